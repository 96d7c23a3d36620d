//! Typed universe of objects the engine and its sibling handlers touch.
//!
//! The set of kinds is closed: dispatch decides the concrete variant once and
//! handlers match on [`WatchedObject`], so no runtime type inspection is ever
//! needed downstream.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::type_definition::TypeDefinition;

/// Label marking the deployment that carries the controller workload.
pub const CONTROLLER_COMPONENT_LABEL: &str = "vershed.io/component";

/// Expected value of [`CONTROLLER_COMPONENT_LABEL`] on the controller.
pub const CONTROLLER_COMPONENT: &str = "controller";

// ---------------------------------------------------------------------------
// ObjectKind / ObjectRef / ObjectMeta
// ---------------------------------------------------------------------------

/// Closed set of watched object kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Deployment,
    ServiceAccount,
    Secret,
    ConfigMap,
    SecurityPolicy,
    TypeDefinition,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::ServiceAccount => "service_account",
            Self::Secret => "secret",
            Self::ConfigMap => "config_map",
            Self::SecurityPolicy => "security_policy",
            Self::TypeDefinition => "type_definition",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a single object. Cluster-scoped kinds use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Metadata shared by every stored object.
///
/// `revision` is the store's optimistic-concurrency token; a conditional
/// write compares it against the store's current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub revision: u64,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            revision: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Concrete kinds
// ---------------------------------------------------------------------------

/// Workload deployment snapshot; only the fields the gates read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub meta: ObjectMeta,
    pub desired_replicas: u32,
    pub ready_replicas: u32,
}

impl Deployment {
    /// Whether this deployment is recognized as the controller workload.
    pub fn is_controller_workload(&self) -> bool {
        self.meta.labels.get(CONTROLLER_COMPONENT_LABEL).map(String::as_str)
            == Some(CONTROLLER_COMPONENT)
    }

    /// Whether every desired replica reports ready.
    pub fn is_ready(&self) -> bool {
        self.desired_replicas > 0 && self.ready_replicas >= self.desired_replicas
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub meta: ObjectMeta,
}

/// Secret payloads are opaque to the engine; only metadata is carried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub meta: ObjectMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMap {
    pub meta: ObjectMeta,
}

/// Cluster security policy carrying an ordered member list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub meta: ObjectMeta,
    pub users: Vec<String>,
}

/// Opaque live instance of a migrating kind.
///
/// The engine never inspects the payload and the persisted encoding is not
/// externally visible; a rewrite is triggered purely through the key and
/// revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub kind: String,
    pub meta: ObjectMeta,
}

// ---------------------------------------------------------------------------
// WatchedObject — the tagged union handed to handlers
// ---------------------------------------------------------------------------

/// A watched object, decided once at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchedObject {
    Deployment(Deployment),
    ServiceAccount(ServiceAccount),
    Secret(Secret),
    ConfigMap(ConfigMap),
    SecurityPolicy(SecurityPolicy),
    TypeDefinition(TypeDefinition),
}

impl WatchedObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Deployment(_) => ObjectKind::Deployment,
            Self::ServiceAccount(_) => ObjectKind::ServiceAccount,
            Self::Secret(_) => ObjectKind::Secret,
            Self::ConfigMap(_) => ObjectKind::ConfigMap,
            Self::SecurityPolicy(_) => ObjectKind::SecurityPolicy,
            Self::TypeDefinition(_) => ObjectKind::TypeDefinition,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Deployment(o) => &o.meta,
            Self::ServiceAccount(o) => &o.meta,
            Self::Secret(o) => &o.meta,
            Self::ConfigMap(o) => &o.meta,
            Self::SecurityPolicy(o) => &o.meta,
            Self::TypeDefinition(o) => &o.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Deployment(o) => &mut o.meta,
            Self::ServiceAccount(o) => &mut o.meta,
            Self::Secret(o) => &mut o.meta,
            Self::ConfigMap(o) => &mut o.meta,
            Self::SecurityPolicy(o) => &mut o.meta,
            Self::TypeDefinition(o) => &mut o.meta,
        }
    }

    pub fn object_ref(&self) -> ObjectRef {
        let meta = self.meta();
        ObjectRef::new(self.kind(), meta.namespace.clone(), meta.name.clone())
    }

    pub fn as_deployment(&self) -> Option<&Deployment> {
        match self {
            Self::Deployment(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_service_account(&self) -> Option<&ServiceAccount> {
        match self {
            Self::ServiceAccount(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_type_definition_mut(&mut self) -> Option<&mut TypeDefinition> {
        match self {
            Self::TypeDefinition(o) => Some(o),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
