//! Reconcile-callback dispatch over a closed set of phases and handlers.
//!
//! The dispatcher invokes handlers at defined lifecycle points of the outer
//! reconcile loop. Phases are an explicit enum and handlers a closed variant
//! set resolved by static dispatch; the current/desired objects arrive as
//! typed [`WatchedObject`] values decided once at dispatch time, so no
//! handler ever inspects runtime types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::EventSink;
use crate::housekeeping::{
    AnnotationCarryoverHandler, HousekeepingError, PolicyMembershipSyncHandler,
    RelationshipLabelsHandler, SecretRetirementHandler, TypeNormalizationHandler,
};
use crate::migration::{MigrationError, StorageMigrationHandler};
use crate::object::{Deployment, WatchedObject};
use crate::store::StoreClient;

// ---------------------------------------------------------------------------
// ReconcilePhase
// ---------------------------------------------------------------------------

/// Lifecycle points at which handlers may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePhase {
    /// After current cluster state was read, before create/update is decided.
    PostRead,
    PreCreate,
    PreUpdate,
    PostDelete,
    /// The owning operator resource itself is being deleted.
    OperatorDelete,
}

impl ReconcilePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PostRead => "post_read",
            Self::PreCreate => "pre_create",
            Self::PreUpdate => "pre_update",
            Self::PostDelete => "post_delete",
            Self::OperatorDelete => "operator_delete",
        }
    }
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ReconcileArgs
// ---------------------------------------------------------------------------

/// Arguments for one handler invocation. Handlers may mutate `current` in
/// place; the outer reconciler persists it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileArgs {
    pub phase: ReconcilePhase,
    pub namespace: String,
    pub current: Option<WatchedObject>,
    pub desired: Option<WatchedObject>,
}

impl ReconcileArgs {
    pub fn new(phase: ReconcilePhase, namespace: impl Into<String>) -> Self {
        Self {
            phase,
            namespace: namespace.into(),
            current: None,
            desired: None,
        }
    }

    pub fn with_current(mut self, object: WatchedObject) -> Self {
        self.current = Some(object);
        self
    }

    pub fn with_desired(mut self, object: WatchedObject) -> Self {
        self.desired = Some(object);
        self
    }

    /// The current object, when it is the recognized controller deployment.
    pub fn controller_deployment(&self) -> Option<&Deployment> {
        self.current
            .as_ref()
            .and_then(WatchedObject::as_deployment)
            .filter(|deployment| deployment.is_controller_workload())
    }
}

// ---------------------------------------------------------------------------
// LifecycleError
// ---------------------------------------------------------------------------

/// Error surfaced from a handler; dispatch stops at the first one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("storage migration handler failed: {0}")]
    Migration(#[from] MigrationError),
    #[error("housekeeping handler failed: {0}")]
    Housekeeping(#[from] HousekeepingError),
}

// ---------------------------------------------------------------------------
// ReconcileHandler — closed variant set
// ---------------------------------------------------------------------------

/// Every handler the dispatcher knows about. Adding a handler means adding a
/// variant here; there is no open registration surface.
#[derive(Debug, Clone)]
pub enum ReconcileHandler {
    StorageMigration(StorageMigrationHandler),
    SecretRetirement(SecretRetirementHandler),
    AnnotationCarryover(AnnotationCarryoverHandler),
    PolicyMembershipSync(PolicyMembershipSyncHandler),
    RelationshipLabels(RelationshipLabelsHandler),
    TypeNormalization(TypeNormalizationHandler),
}

impl ReconcileHandler {
    /// Stable handler tag for events and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StorageMigration(_) => "storage_migration",
            Self::SecretRetirement(_) => "secret_retirement",
            Self::AnnotationCarryover(_) => "annotation_carryover",
            Self::PolicyMembershipSync(_) => "policy_membership_sync",
            Self::RelationshipLabels(_) => "relationship_labels",
            Self::TypeNormalization(_) => "type_normalization",
        }
    }

    fn run<S: StoreClient, E: EventSink>(
        &self,
        args: &mut ReconcileArgs,
        store: &mut S,
        events: &mut E,
    ) -> Result<(), LifecycleError> {
        match self {
            Self::StorageMigration(h) => {
                h.run(args, store, events)?;
                Ok(())
            }
            Self::SecretRetirement(h) => Ok(h.run(args, store, events)?),
            Self::AnnotationCarryover(h) => Ok(h.run(args, store, events)?),
            Self::PolicyMembershipSync(h) => Ok(h.run(args, store, events)?),
            Self::RelationshipLabels(h) => Ok(h.run(args, store, events)?),
            Self::TypeNormalization(h) => Ok(h.run(args, store, events)?),
        }
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Ordered `(phase, handler)` pairs. Dispatch runs every handler registered
/// for the invoked phase, in registration order.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    entries: Vec<(ReconcilePhase, ReconcileHandler)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, phase: ReconcilePhase, handler: ReconcileHandler) {
        self.entries.push((phase, handler));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn handlers_for(&self, phase: ReconcilePhase) -> Vec<&ReconcileHandler> {
        self.entries
            .iter()
            .filter(|(p, _)| *p == phase)
            .map(|(_, h)| h)
            .collect()
    }

    /// Run the phase's handlers; returns how many were invoked. The first
    /// error aborts the remainder so the outer loop requeues the whole pass.
    pub fn dispatch<S: StoreClient, E: EventSink>(
        &self,
        args: &mut ReconcileArgs,
        store: &mut S,
        events: &mut E,
    ) -> Result<usize, LifecycleError> {
        let mut invoked = 0;
        for (phase, handler) in &self.entries {
            if *phase != args.phase {
                continue;
            }
            handler.run(args, store, events)?;
            invoked += 1;
        }
        Ok(invoked)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
