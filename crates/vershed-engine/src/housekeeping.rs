//! Flat get/compare/patch housekeeping handlers.
//!
//! These ride the same reconcile callbacks as the migration engine but carry
//! no state machine of their own: each reads current state, computes the
//! desired shape, and patches only on difference. All of them self-gate on
//! phase and object kind and no-op otherwise.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::{EngineEvent, EventKind, EventSink};
use crate::lifecycle::{ReconcileArgs, ReconcilePhase};
use crate::object::{ObjectKind, ObjectRef, WatchedObject};
use crate::store::{StoreClient, StoreError};

/// Annotation listing, as a JSON array, the security policies a service
/// account should be a member of.
pub const POLICY_MEMBERSHIP_ANNOTATION: &str = "vershed.io/security-policies";

/// Qualified member name under which an account appears in policy user lists.
pub fn qualified_account_name(namespace: &str, name: &str) -> String {
    format!("account:{namespace}:{name}")
}

// ---------------------------------------------------------------------------
// HousekeepingError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HousekeepingError {
    Store(StoreError),
    /// The membership annotation was present but not a JSON string list.
    MalformedAnnotation { key: String, detail: String },
}

impl HousekeepingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(_) => "VS-HK-0001",
            Self::MalformedAnnotation { .. } => "VS-HK-0002",
        }
    }
}

impl fmt::Display for HousekeepingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(err) => write!(f, "store operation failed: {err}"),
            Self::MalformedAnnotation { key, detail } => {
                write!(f, "annotation '{key}' is malformed: {detail}")
            }
        }
    }
}

impl std::error::Error for HousekeepingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::MalformedAnnotation { .. } => None,
        }
    }
}

impl From<StoreError> for HousekeepingError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

// ---------------------------------------------------------------------------
// SecretRetirementHandler
// ---------------------------------------------------------------------------

/// Deletes a fixed list of secrets that newer releases no longer use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRetirementHandler {
    secret_names: Vec<String>,
}

impl SecretRetirementHandler {
    pub fn new(secret_names: Vec<String>) -> Self {
        Self { secret_names }
    }

    pub fn run<S: StoreClient, E: EventSink>(
        &self,
        args: &ReconcileArgs,
        store: &mut S,
        events: &mut E,
    ) -> Result<(), HousekeepingError> {
        if args.phase != ReconcilePhase::PostRead {
            return Ok(());
        }
        if args.controller_deployment().is_none() {
            return Ok(());
        }
        for name in &self.secret_names {
            let object_ref = ObjectRef::new(ObjectKind::Secret, args.namespace.as_str(), name);
            match store.get_object(&object_ref) {
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
                Ok(_) => {}
            }
            match store.delete_object(&object_ref) {
                Ok(()) => events.record(EngineEvent::normal(
                    EventKind::SecretDeleted,
                    object_ref.to_string(),
                    format!("deleted retired secret {name}"),
                )),
                Err(err) => {
                    events.record(EngineEvent::warning(
                        EventKind::SecretDeleteFailed,
                        object_ref.to_string(),
                        format!("failed to delete secret {name}: {err}"),
                    ));
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AnnotationCarryoverHandler
// ---------------------------------------------------------------------------

/// Reconciles one annotation on the current service account from the desired
/// one: removed when absent from desired, copied when present. The outer
/// reconciler persists the mutated current object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationCarryoverHandler {
    key: String,
}

impl AnnotationCarryoverHandler {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn run<S: StoreClient, E: EventSink>(
        &self,
        args: &mut ReconcileArgs,
        _store: &mut S,
        _events: &mut E,
    ) -> Result<(), HousekeepingError> {
        if args.phase != ReconcilePhase::PostRead {
            return Ok(());
        }
        let Some(desired) = args.desired.as_ref().and_then(WatchedObject::as_service_account)
        else {
            return Ok(());
        };
        let carried = desired.meta.annotations.get(&self.key).cloned();
        let Some(WatchedObject::ServiceAccount(current)) = args.current.as_mut() else {
            return Ok(());
        };
        current.meta.annotations.remove(&self.key);
        if let Some(value) = carried {
            current.meta.annotations.insert(self.key.clone(), value);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PolicyMembershipSyncHandler
// ---------------------------------------------------------------------------

/// Keeps every security policy's user list in line with the account's
/// membership annotation: inserted where annotated, removed everywhere else.
/// Delete-flavored phases treat the account as a member of nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMembershipSyncHandler;

impl PolicyMembershipSyncHandler {
    pub fn run<S: StoreClient, E: EventSink>(
        &self,
        args: &ReconcileArgs,
        store: &mut S,
        events: &mut E,
    ) -> Result<(), HousekeepingError> {
        let removing = match args.phase {
            ReconcilePhase::PreCreate | ReconcilePhase::PreUpdate => false,
            ReconcilePhase::PostDelete | ReconcilePhase::OperatorDelete => true,
            ReconcilePhase::PostRead => return Ok(()),
        };
        let account = args
            .current
            .as_ref()
            .and_then(WatchedObject::as_service_account)
            .or_else(|| args.desired.as_ref().and_then(WatchedObject::as_service_account));
        let Some(account) = account else {
            return Ok(());
        };
        let member_name = qualified_account_name(&account.meta.namespace, &account.meta.name);
        let annotated: Vec<String> = if removing {
            Vec::new()
        } else {
            match account.meta.annotations.get(POLICY_MEMBERSHIP_ANNOTATION) {
                Some(raw) => serde_json::from_str(raw).map_err(|err| {
                    HousekeepingError::MalformedAnnotation {
                        key: POLICY_MEMBERSHIP_ANNOTATION.to_string(),
                        detail: err.to_string(),
                    }
                })?,
                None => Vec::new(),
            }
        };
        let policies = match store.list_policies() {
            // The policy kind is optional store machinery; nothing to sync.
            Err(err) if err.is_kind_not_served() => return Ok(()),
            Err(err) => return Err(err.into()),
            Ok(policies) => policies,
        };
        for policy in policies {
            let keep = annotated.iter().any(|name| name == &policy.meta.name);
            let mut users = Vec::new();
            let mut seen = false;
            for user in &policy.users {
                if user == &member_name {
                    seen = true;
                    if !keep {
                        continue;
                    }
                }
                users.push(user.clone());
            }
            if keep && !seen {
                users.push(member_name.clone());
            }
            if users != policy.users {
                let mut updated = policy.clone();
                updated.users = users;
                store.update_object(&WatchedObject::SecurityPolicy(updated))?;
                events.record(
                    EngineEvent::normal(
                        EventKind::PolicyMembershipUpdated,
                        policy.meta.name.clone(),
                        format!("synced membership of {member_name}"),
                    )
                    .field("member", member_name.clone())
                    .field("member_kept", keep.to_string()),
                );
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RelationshipLabelsHandler
// ---------------------------------------------------------------------------

/// Stamps the installer's recommended labels onto tracked objects that the
/// reconciler does not otherwise own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipLabelsHandler {
    tracked: Vec<ObjectRef>,
    labels: BTreeMap<String, String>,
}

impl RelationshipLabelsHandler {
    pub fn new(tracked: Vec<ObjectRef>, labels: BTreeMap<String, String>) -> Self {
        Self { tracked, labels }
    }

    pub fn run<S: StoreClient, E: EventSink>(
        &self,
        args: &ReconcileArgs,
        store: &mut S,
        events: &mut E,
    ) -> Result<(), HousekeepingError> {
        if args.phase != ReconcilePhase::PostRead {
            return Ok(());
        }
        let ready = args
            .controller_deployment()
            .is_some_and(|deployment| deployment.is_ready());
        if !ready {
            return Ok(());
        }
        for object_ref in &self.tracked {
            let mut object = match store.get_object(object_ref) {
                Err(err) if err.is_not_found() || err.is_kind_not_served() => continue,
                Err(err) => return Err(err.into()),
                Ok(object) => object,
            };
            let before = object.meta().labels.clone();
            object
                .meta_mut()
                .labels
                .extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
            if object.meta().labels != before {
                store.update_object(&object)?;
                events.record(EngineEvent::normal(
                    EventKind::LabelsStamped,
                    object_ref.to_string(),
                    "stamped recommended labels",
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TypeNormalizationHandler
// ---------------------------------------------------------------------------

/// Clears the legacy unknown-fields flag on a type definition before the
/// pending update is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeNormalizationHandler;

impl TypeNormalizationHandler {
    pub fn run<S: StoreClient, E: EventSink>(
        &self,
        args: &mut ReconcileArgs,
        _store: &mut S,
        _events: &mut E,
    ) -> Result<(), HousekeepingError> {
        if args.phase != ReconcilePhase::PreUpdate {
            return Ok(());
        }
        if let Some(td) = args.current.as_mut().and_then(WatchedObject::as_type_definition_mut) {
            td.spec.preserve_unknown_fields = false;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
