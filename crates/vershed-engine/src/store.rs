//! Store client seam and the in-memory implementation used by tests.
//!
//! All calls are synchronous and may block on network I/O in a real binding.
//! Conditional writes compare the object's revision against the store's
//! current value; a losing write surfaces as [`StoreError::Conflict`], never
//! a merge or force-overwrite.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::object::{Instance, ObjectKind, ObjectMeta, ObjectRef, SecurityPolicy, WatchedObject};
use crate::type_definition::TypeDefinition;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Store failure taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreError {
    /// The named object does not exist.
    NotFound { kind: String, name: String },
    /// Conditional write lost the optimistic-concurrency race.
    Conflict {
        kind: String,
        name: String,
        revision: u64,
    },
    /// Network/timeout class failure; safe to retry on a later pass.
    Transient { op: String, detail: String },
    /// The store does not serve this kind at all.
    KindNotServed { kind: String },
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "VS-ST-0001",
            Self::Conflict { .. } => "VS-ST-0002",
            Self::Transient { .. } => "VS-ST-0003",
            Self::KindNotServed { .. } => "VS-ST-0004",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_kind_not_served(&self) -> bool {
        matches!(self, Self::KindNotServed { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { kind, name } => write!(f, "{kind} '{name}' not found"),
            Self::Conflict {
                kind,
                name,
                revision,
            } => write!(
                f,
                "conditional write on {kind} '{name}' lost against revision {revision}"
            ),
            Self::Transient { op, detail } => write!(f, "transient failure in {op}: {detail}"),
            Self::KindNotServed { kind } => write!(f, "kind {kind} not served by this store"),
        }
    }
}

impl std::error::Error for StoreError {}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// Opaque listing cursor handed back by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancePage {
    pub items: Vec<Instance>,
    pub next: Option<ContinuationToken>,
}

// ---------------------------------------------------------------------------
// StoreClient
// ---------------------------------------------------------------------------

/// Synchronous store access used by the engine and its sibling handlers.
pub trait StoreClient {
    fn get_type_definition(&mut self, name: &str) -> Result<TypeDefinition, StoreError>;

    /// Conditional spec write. The store keeps its own status half.
    fn update_type_definition(&mut self, td: &TypeDefinition)
        -> Result<TypeDefinition, StoreError>;

    /// Conditional status write. The store keeps its own spec half.
    fn update_type_definition_status(
        &mut self,
        td: &TypeDefinition,
    ) -> Result<TypeDefinition, StoreError>;

    fn list_instances(
        &mut self,
        kind: &str,
        page_size: usize,
        token: Option<&ContinuationToken>,
    ) -> Result<InstancePage, StoreError>;

    /// Unconditional-intent read-modify-write of one instance; re-persists it
    /// under the current storage encoding. Conflict is a distinct error.
    fn rewrite_instance(&mut self, instance: &Instance) -> Result<(), StoreError>;

    fn get_object(&mut self, object_ref: &ObjectRef) -> Result<WatchedObject, StoreError>;

    fn update_object(&mut self, object: &WatchedObject) -> Result<WatchedObject, StoreError>;

    fn delete_object(&mut self, object_ref: &ObjectRef) -> Result<(), StoreError>;

    fn list_policies(&mut self) -> Result<Vec<SecurityPolicy>, StoreError>;
}

// ---------------------------------------------------------------------------
// Fault plan — scripted failures for partial-failure tests
// ---------------------------------------------------------------------------

/// Scripted failures. Call indices are 1-based and counted per operation.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    pub fail_list_calls: BTreeSet<u64>,
    pub fail_rewrite_calls: BTreeSet<u64>,
    pub fail_status_writes: BTreeSet<u64>,
    pub fail_spec_writes: BTreeSet<u64>,
    /// Instance keys (`kind/namespace/name`) whose next rewrite loses the
    /// optimistic race to a simulated concurrent writer.
    pub conflict_rewrites: BTreeSet<String>,
    /// Instance keys deleted between list and write.
    pub vanish_before_rewrite: BTreeSet<String>,
}

// ---------------------------------------------------------------------------
// InMemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredInstance {
    instance: Instance,
    stored_version: String,
}

/// In-memory store for unit and integration tests.
///
/// Models the write path the engine relies on: every successful instance
/// write re-stamps the instance with the kind's current storage version and
/// appends that version to the owning type definition's ledger.
#[derive(Debug)]
pub struct InMemoryStore {
    types: BTreeMap<String, TypeDefinition>,
    instances: BTreeMap<String, BTreeMap<String, StoredInstance>>,
    objects: BTreeMap<String, WatchedObject>,
    policy_kind_served: bool,
    faults: FaultPlan,
    next_revision: u64,
    list_calls: u64,
    rewrite_calls: u64,
    status_write_calls: u64,
    spec_write_calls: u64,
    writes: u64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            types: BTreeMap::new(),
            instances: BTreeMap::new(),
            objects: BTreeMap::new(),
            policy_kind_served: true,
            faults: FaultPlan::default(),
            next_revision: 0,
            list_calls: 0,
            rewrite_calls: 0,
            status_write_calls: 0,
            spec_write_calls: 0,
            writes: 0,
        }
    }

    fn alloc_revision(&mut self) -> u64 {
        self.next_revision += 1;
        self.next_revision
    }

    fn ref_key(object_ref: &ObjectRef) -> String {
        format!(
            "{}/{}/{}",
            object_ref.kind.as_str(),
            object_ref.namespace,
            object_ref.name
        )
    }

    fn instance_key(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }

    fn fault_key(instance: &Instance) -> String {
        format!(
            "{}/{}/{}",
            instance.kind, instance.meta.namespace, instance.meta.name
        )
    }

    /// The kind's owning type definition and its single storage version, if
    /// unambiguous.
    fn desired_of_kind(&self, kind: &str) -> Option<(String, String)> {
        let td = self.types.values().find(|td| td.spec.kind == kind)?;
        let storage = td.storage_decls();
        if storage.len() == 1 {
            Some((td.meta.name.clone(), storage[0].name.clone()))
        } else {
            None
        }
    }

    // -- Seeding --

    pub fn insert_type_definition(&mut self, mut td: TypeDefinition) {
        td.meta.revision = self.alloc_revision();
        self.types.insert(td.meta.name.clone(), td);
    }

    pub fn seed_instance(
        &mut self,
        kind: &str,
        namespace: &str,
        name: &str,
        stored_version: &str,
    ) {
        let mut meta = ObjectMeta::new(namespace, name);
        meta.revision = self.alloc_revision();
        let instance = Instance {
            kind: kind.to_string(),
            meta,
        };
        self.instances
            .entry(kind.to_string())
            .or_default()
            .insert(
                Self::instance_key(namespace, name),
                StoredInstance {
                    instance,
                    stored_version: stored_version.to_string(),
                },
            );
    }

    pub fn insert_object(&mut self, mut object: WatchedObject) {
        object.meta_mut().revision = self.alloc_revision();
        self.objects
            .insert(Self::ref_key(&object.object_ref()), object);
    }

    pub fn set_policy_kind_served(&mut self, served: bool) {
        self.policy_kind_served = served;
    }

    pub fn faults_mut(&mut self) -> &mut FaultPlan {
        &mut self.faults
    }

    // -- Inspection --

    pub fn type_definition(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.get(name)
    }

    pub fn object(&self, object_ref: &ObjectRef) -> Option<&WatchedObject> {
        self.objects.get(&Self::ref_key(object_ref))
    }

    pub fn instance_count(&self, kind: &str) -> usize {
        self.instances.get(kind).map_or(0, BTreeMap::len)
    }

    pub fn stored_version_of(&self, kind: &str, namespace: &str, name: &str) -> Option<&str> {
        self.instances
            .get(kind)?
            .get(&Self::instance_key(namespace, name))
            .map(|rec| rec.stored_version.as_str())
    }

    /// How many instances of `kind` are persisted under each version.
    pub fn stored_version_counts(&self, kind: &str) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        if let Some(map) = self.instances.get(kind) {
            for rec in map.values() {
                *counts.entry(rec.stored_version.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Total writes issued through this client.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls
    }

    pub fn rewrite_calls(&self) -> u64 {
        self.rewrite_calls
    }

    pub fn spec_write_calls(&self) -> u64 {
        self.spec_write_calls
    }

    pub fn status_write_calls(&self) -> u64 {
        self.status_write_calls
    }
}

impl StoreClient for InMemoryStore {
    fn get_type_definition(&mut self, name: &str) -> Result<TypeDefinition, StoreError> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: ObjectKind::TypeDefinition.as_str().to_string(),
                name: name.to_string(),
            })
    }

    fn update_type_definition(
        &mut self,
        td: &TypeDefinition,
    ) -> Result<TypeDefinition, StoreError> {
        self.spec_write_calls += 1;
        if self.faults.fail_spec_writes.remove(&self.spec_write_calls) {
            return Err(StoreError::Transient {
                op: "update_type_definition".to_string(),
                detail: "injected".to_string(),
            });
        }
        let new_revision = self.alloc_revision();
        let current = self
            .types
            .get_mut(td.name())
            .ok_or_else(|| StoreError::NotFound {
                kind: ObjectKind::TypeDefinition.as_str().to_string(),
                name: td.name().to_string(),
            })?;
        if current.meta.revision != td.meta.revision {
            return Err(StoreError::Conflict {
                kind: ObjectKind::TypeDefinition.as_str().to_string(),
                name: td.name().to_string(),
                revision: current.meta.revision,
            });
        }
        let mut stored = td.clone();
        stored.status = current.status.clone();
        stored.meta.revision = new_revision;
        *current = stored.clone();
        self.writes += 1;
        Ok(stored)
    }

    fn update_type_definition_status(
        &mut self,
        td: &TypeDefinition,
    ) -> Result<TypeDefinition, StoreError> {
        self.status_write_calls += 1;
        if self
            .faults
            .fail_status_writes
            .remove(&self.status_write_calls)
        {
            return Err(StoreError::Transient {
                op: "update_type_definition_status".to_string(),
                detail: "injected".to_string(),
            });
        }
        let new_revision = self.alloc_revision();
        let current = self
            .types
            .get_mut(td.name())
            .ok_or_else(|| StoreError::NotFound {
                kind: ObjectKind::TypeDefinition.as_str().to_string(),
                name: td.name().to_string(),
            })?;
        if current.meta.revision != td.meta.revision {
            return Err(StoreError::Conflict {
                kind: ObjectKind::TypeDefinition.as_str().to_string(),
                name: td.name().to_string(),
                revision: current.meta.revision,
            });
        }
        current.status = td.status.clone();
        current.meta.revision = new_revision;
        self.writes += 1;
        Ok(current.clone())
    }

    fn list_instances(
        &mut self,
        kind: &str,
        page_size: usize,
        token: Option<&ContinuationToken>,
    ) -> Result<InstancePage, StoreError> {
        self.list_calls += 1;
        if self.faults.fail_list_calls.remove(&self.list_calls) {
            return Err(StoreError::Transient {
                op: "list_instances".to_string(),
                detail: "injected".to_string(),
            });
        }
        let page_size = page_size.max(1);
        let empty = BTreeMap::new();
        let map = self.instances.get(kind).unwrap_or(&empty);
        let after = token.map(|t| t.as_str().to_string());
        let remaining: Vec<&StoredInstance> = map
            .iter()
            .filter(|(key, _)| match &after {
                Some(cursor) => key.as_str() > cursor.as_str(),
                None => true,
            })
            .map(|(_, rec)| rec)
            .collect();
        let items: Vec<Instance> = remaining
            .iter()
            .take(page_size)
            .map(|rec| rec.instance.clone())
            .collect();
        let next = if remaining.len() > page_size {
            items.last().map(|inst| {
                ContinuationToken::from_raw(Self::instance_key(
                    &inst.meta.namespace,
                    &inst.meta.name,
                ))
            })
        } else {
            None
        };
        Ok(InstancePage { items, next })
    }

    fn rewrite_instance(&mut self, instance: &Instance) -> Result<(), StoreError> {
        self.rewrite_calls += 1;
        if self.faults.fail_rewrite_calls.remove(&self.rewrite_calls) {
            return Err(StoreError::Transient {
                op: "rewrite_instance".to_string(),
                detail: "injected".to_string(),
            });
        }
        let fault_key = Self::fault_key(instance);
        let instance_key =
            Self::instance_key(&instance.meta.namespace, &instance.meta.name);
        let not_found = || StoreError::NotFound {
            kind: instance.kind.clone(),
            name: instance.meta.name.clone(),
        };

        if self.faults.vanish_before_rewrite.remove(&fault_key) {
            if let Some(map) = self.instances.get_mut(&instance.kind) {
                map.remove(&instance_key);
            }
            return Err(not_found());
        }

        let desired = self.desired_of_kind(&instance.kind);
        let new_revision = self.alloc_revision();

        // Simulated concurrent writer: re-persists the instance itself, then
        // our conditional write loses.
        if self.faults.conflict_rewrites.remove(&fault_key) {
            let rec = self
                .instances
                .get_mut(&instance.kind)
                .and_then(|map| map.get_mut(&instance_key))
                .ok_or_else(not_found)?;
            rec.instance.meta.revision = new_revision;
            if let Some((_, version)) = &desired {
                rec.stored_version = version.clone();
            }
            if let Some((type_name, version)) = desired {
                if let Some(td) = self.types.get_mut(&type_name) {
                    td.status.stored_versions.insert(version);
                }
            }
            return Err(StoreError::Conflict {
                kind: instance.kind.clone(),
                name: instance.meta.name.clone(),
                revision: new_revision,
            });
        }

        let rec = self
            .instances
            .get_mut(&instance.kind)
            .and_then(|map| map.get_mut(&instance_key))
            .ok_or_else(not_found)?;
        if rec.instance.meta.revision != instance.meta.revision {
            return Err(StoreError::Conflict {
                kind: instance.kind.clone(),
                name: instance.meta.name.clone(),
                revision: rec.instance.meta.revision,
            });
        }
        rec.instance.meta.revision = new_revision;
        if let Some((_, version)) = &desired {
            rec.stored_version = version.clone();
        }
        self.writes += 1;
        if let Some((type_name, version)) = desired {
            if let Some(td) = self.types.get_mut(&type_name) {
                td.status.stored_versions.insert(version);
            }
        }
        Ok(())
    }

    fn get_object(&mut self, object_ref: &ObjectRef) -> Result<WatchedObject, StoreError> {
        match object_ref.kind {
            ObjectKind::TypeDefinition => self
                .get_type_definition(&object_ref.name)
                .map(WatchedObject::TypeDefinition),
            ObjectKind::SecurityPolicy if !self.policy_kind_served => {
                Err(StoreError::KindNotServed {
                    kind: ObjectKind::SecurityPolicy.as_str().to_string(),
                })
            }
            _ => self
                .objects
                .get(&Self::ref_key(object_ref))
                .cloned()
                .ok_or_else(|| StoreError::NotFound {
                    kind: object_ref.kind.as_str().to_string(),
                    name: object_ref.name.clone(),
                }),
        }
    }

    fn update_object(&mut self, object: &WatchedObject) -> Result<WatchedObject, StoreError> {
        if let WatchedObject::TypeDefinition(td) = object {
            return self
                .update_type_definition(td)
                .map(WatchedObject::TypeDefinition);
        }
        if object.kind() == ObjectKind::SecurityPolicy && !self.policy_kind_served {
            return Err(StoreError::KindNotServed {
                kind: ObjectKind::SecurityPolicy.as_str().to_string(),
            });
        }
        let key = Self::ref_key(&object.object_ref());
        let new_revision = self.alloc_revision();
        let current = self.objects.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            kind: object.kind().as_str().to_string(),
            name: object.meta().name.clone(),
        })?;
        if current.meta().revision != object.meta().revision {
            return Err(StoreError::Conflict {
                kind: object.kind().as_str().to_string(),
                name: object.meta().name.clone(),
                revision: current.meta().revision,
            });
        }
        let mut stored = object.clone();
        stored.meta_mut().revision = new_revision;
        *current = stored.clone();
        self.writes += 1;
        Ok(stored)
    }

    fn delete_object(&mut self, object_ref: &ObjectRef) -> Result<(), StoreError> {
        if object_ref.kind == ObjectKind::SecurityPolicy && !self.policy_kind_served {
            return Err(StoreError::KindNotServed {
                kind: ObjectKind::SecurityPolicy.as_str().to_string(),
            });
        }
        match self.objects.remove(&Self::ref_key(object_ref)) {
            Some(_) => {
                self.writes += 1;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: object_ref.kind.as_str().to_string(),
                name: object_ref.name.clone(),
            }),
        }
    }

    fn list_policies(&mut self) -> Result<Vec<SecurityPolicy>, StoreError> {
        if !self.policy_kind_served {
            return Err(StoreError::KindNotServed {
                kind: ObjectKind::SecurityPolicy.as_str().to_string(),
            });
        }
        Ok(self
            .objects
            .values()
            .filter_map(|obj| match obj {
                WatchedObject::SecurityPolicy(p) => Some(p.clone()),
                _ => None,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
