//! Type definitions and their stored-version ledger.
//!
//! A [`TypeDefinition`] declares the schema versions of a resource kind and
//! records, in status, every version that has ever been used to persist a
//! still-possibly-live instance. The ledger and the declared version set are
//! the only durable migration state: each reconcile pass recomputes progress
//! from this snapshot, which is what makes the protocol crash-safe.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::object::ObjectMeta;

// ---------------------------------------------------------------------------
// SchemaVersionDecl
// ---------------------------------------------------------------------------

/// One declared schema version. Immutable once created except for the
/// served/storage flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersionDecl {
    pub name: String,
    pub served: bool,
    pub storage: bool,
}

impl SchemaVersionDecl {
    pub fn new(name: impl Into<String>, served: bool, storage: bool) -> Self {
        Self {
            name: name.into(),
            served,
            storage,
        }
    }

    /// A served, storage-flagged version.
    pub fn storage(name: impl Into<String>) -> Self {
        Self::new(name, true, true)
    }

    /// A served version without the storage flag.
    pub fn served(name: impl Into<String>) -> Self {
        Self::new(name, true, false)
    }
}

// ---------------------------------------------------------------------------
// TypeDefinition
// ---------------------------------------------------------------------------

/// Declared shape of the kind: its group, kind tag, and ordered versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinitionSpec {
    pub group: String,
    pub kind: String,
    pub versions: Vec<SchemaVersionDecl>,
    /// Legacy flag cleared by normalization before updates are applied.
    pub preserve_unknown_fields: bool,
}

/// Status half: the stored-version ledger. Order-irrelevant, so a `BTreeSet`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinitionStatus {
    pub stored_versions: BTreeSet<String>,
}

/// A registered resource type and its migration state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub meta: ObjectMeta,
    pub spec: TypeDefinitionSpec,
    pub status: TypeDefinitionStatus,
}

impl TypeDefinition {
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        kind: impl Into<String>,
        versions: Vec<SchemaVersionDecl>,
    ) -> Self {
        Self {
            meta: ObjectMeta::new("", name),
            spec: TypeDefinitionSpec {
                group: group.into(),
                kind: kind.into(),
                versions,
                preserve_unknown_fields: false,
            },
            status: TypeDefinitionStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Declared version names in declaration order.
    pub fn version_names(&self) -> Vec<&str> {
        self.spec.versions.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn has_version(&self, name: &str) -> bool {
        self.spec.versions.iter().any(|v| v.name == name)
    }

    /// Declared versions carrying the storage flag.
    pub fn storage_decls(&self) -> Vec<&SchemaVersionDecl> {
        self.spec.versions.iter().filter(|v| v.storage).collect()
    }

    /// Ledger-coverage invariant: every stored version name is either the
    /// desired version's name or still declared in the schema.
    pub fn ledger_covered(&self, desired: &str) -> bool {
        self.status
            .stored_versions
            .iter()
            .all(|name| name == desired || self.has_version(name))
    }

    /// True once the ledger names nothing but the desired version.
    pub fn ledger_reduced_to(&self, desired: &str) -> bool {
        self.status.stored_versions.iter().all(|name| name == desired)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
