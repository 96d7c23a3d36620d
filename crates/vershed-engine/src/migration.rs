//! Storage-version migration: one idempotent pass per reconcile invocation.
//!
//! Each pass recomputes progress from the type definition snapshot alone:
//! select the desired (storage-flagged) version, detect stale ledger entries,
//! and either sweep-and-prune the ledger or prune the schema. Sweeping and
//! schema pruning never share a pass, so at no observable instant does the
//! schema lack a version the ledger still claims is in use — even if the
//! process dies immediately after the ledger write.
//!
//! Every step is independently idempotent; a crash between any two steps is
//! corrected by the next pass.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::{EngineEvent, EventKind, EventSink};
use crate::lifecycle::{ReconcileArgs, ReconcilePhase};
use crate::object::WatchedObject;
use crate::schema_version::ranks_below;
use crate::store::{StoreClient, StoreError};
use crate::sweep::{ObjectSweeper, SweepConfig, SweepOutcome};
use crate::type_definition::{SchemaVersionDecl, TypeDefinition};

// ---------------------------------------------------------------------------
// MigrationError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationError {
    /// Zero or more than one declared version carries the storage flag.
    /// Operator intervention required; nothing is mutated.
    AmbiguousStorageVersion {
        type_name: String,
        storage_flags: usize,
    },
    /// Store failure; the pass aborts with state untouched and the
    /// surrounding controller requeues.
    Store(StoreError),
}

impl MigrationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AmbiguousStorageVersion { .. } => "VS-MG-0001",
            Self::Store(_) => "VS-MG-0002",
        }
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AmbiguousStorageVersion {
                type_name,
                storage_flags,
            } => write!(
                f,
                "type definition '{type_name}' declares {storage_flags} storage versions, expected exactly 1"
            ),
            Self::Store(err) => write!(f, "store operation failed: {err}"),
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::AmbiguousStorageVersion { .. } => None,
        }
    }
}

impl From<StoreError> for MigrationError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

// ---------------------------------------------------------------------------
// Selector and detector
// ---------------------------------------------------------------------------

/// The single declared version with the storage flag.
pub fn select_desired_version(
    td: &TypeDefinition,
) -> Result<&SchemaVersionDecl, MigrationError> {
    let storage = td.storage_decls();
    if storage.len() == 1 {
        Ok(storage[0])
    } else {
        Err(MigrationError::AmbiguousStorageVersion {
            type_name: td.name().to_string(),
            storage_flags: storage.len(),
        })
    }
}

/// Ledger entries ranking strictly below the desired version. The desired
/// version's own entry is excluded; entries ranking above it are not stale
/// and are left for operator resolution.
pub fn detect_stale_versions(desired: &str, ledger: &BTreeSet<String>) -> BTreeSet<String> {
    ledger
        .iter()
        .filter(|name| name.as_str() != desired && ranks_below(name, desired))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// PassOutcome / MigrationConfig
// ---------------------------------------------------------------------------

/// Terminal disposition of one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassOutcome {
    /// The type definition vanished; nothing to migrate.
    TypeAbsent,
    /// Stale versions existed: all instances were re-persisted and the swept
    /// names removed from the ledger.
    SweptLedger {
        sweep: SweepOutcome,
        pruned: BTreeSet<String>,
    },
    /// The ledger was clean; retired versions were dropped from the schema.
    SchemaPruned { dropped: Vec<String> },
    /// Non-desired, non-stale names still in the ledger hold pruning off.
    SchemaHeld { blocking: BTreeSet<String> },
    /// Ledger and schema already minimal; no write issued.
    Converged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub sweep: SweepConfig,
}

// ---------------------------------------------------------------------------
// MigrationEngine — the per-pass orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MigrationEngine {
    config: MigrationConfig,
}

impl MigrationEngine {
    pub fn new(config: MigrationConfig) -> Self {
        Self { config }
    }

    /// Run one reconcile pass for `type_name`. Any error aborts the whole
    /// pass; partial recovery is never attempted.
    pub fn run_pass<S: StoreClient, E: EventSink>(
        &self,
        store: &mut S,
        type_name: &str,
        events: &mut E,
    ) -> Result<PassOutcome, MigrationError> {
        let result = self.pass(store, type_name, events);
        if let Err(err) = &result {
            events.record(
                EngineEvent::warning(
                    EventKind::PassFailed,
                    type_name,
                    format!("migration pass failed: {err}"),
                )
                .field("error_code", err.code()),
            );
        }
        result
    }

    fn pass<S: StoreClient, E: EventSink>(
        &self,
        store: &mut S,
        type_name: &str,
        events: &mut E,
    ) -> Result<PassOutcome, MigrationError> {
        let td = match store.get_type_definition(type_name) {
            Ok(td) => td,
            Err(err) if err.is_not_found() => return Ok(PassOutcome::TypeAbsent),
            Err(err) => return Err(err.into()),
        };
        let desired = select_desired_version(&td)?.name.clone();
        let stale = detect_stale_versions(&desired, &td.status.stored_versions);
        if stale.is_empty() {
            self.prune_schema(store, td, &desired, events)
        } else {
            let sweeper = ObjectSweeper::new(self.config.sweep.clone());
            let sweep = sweeper.sweep(store, &td.spec.kind, &stale, events)?;
            let pruned = self.prune_ledger(store, &td, &stale, events)?;
            Ok(PassOutcome::SweptLedger { sweep, pruned })
        }
    }

    /// Remove the swept names from the ledger with one status write.
    fn prune_ledger<S: StoreClient, E: EventSink>(
        &self,
        store: &mut S,
        td: &TypeDefinition,
        swept: &BTreeSet<String>,
        events: &mut E,
    ) -> Result<BTreeSet<String>, MigrationError> {
        let removed: BTreeSet<String> = td
            .status
            .stored_versions
            .intersection(swept)
            .cloned()
            .collect();
        if removed.is_empty() {
            return Ok(removed);
        }
        let mut updated = td.clone();
        updated.status.stored_versions = td
            .status
            .stored_versions
            .difference(swept)
            .cloned()
            .collect();
        store.update_type_definition_status(&updated)?;
        events.record(
            EngineEvent::normal(
                EventKind::LedgerPruned,
                td.name(),
                "removed retired versions from the stored-version ledger",
            )
            .field(
                "removed",
                removed.iter().cloned().collect::<Vec<_>>().join(","),
            ),
        );
        Ok(removed)
    }

    /// Drop retired versions from the schema once the ledger is clean.
    fn prune_schema<S: StoreClient, E: EventSink>(
        &self,
        store: &mut S,
        td: TypeDefinition,
        desired: &str,
        events: &mut E,
    ) -> Result<PassOutcome, MigrationError> {
        if !td.ledger_reduced_to(desired) {
            let blocking: BTreeSet<String> = td
                .status
                .stored_versions
                .iter()
                .filter(|name| name.as_str() != desired)
                .cloned()
                .collect();
            events.record(
                EngineEvent::warning(
                    EventKind::SchemaPruneHeld,
                    td.name(),
                    "ledger still names versions outranking the storage version",
                )
                .field(
                    "blocking",
                    blocking.iter().cloned().collect::<Vec<_>>().join(","),
                ),
            );
            return Ok(PassOutcome::SchemaHeld { blocking });
        }

        let retained: Vec<SchemaVersionDecl> = td
            .spec
            .versions
            .iter()
            .filter(|v| v.name == desired)
            .cloned()
            .collect();
        if retained == td.spec.versions {
            return Ok(PassOutcome::Converged);
        }
        let dropped: Vec<String> = td
            .spec
            .versions
            .iter()
            .filter(|v| v.name != desired)
            .map(|v| v.name.clone())
            .collect();
        let mut updated = td;
        updated.spec.versions = retained;
        store.update_type_definition(&updated)?;
        events.record(
            EngineEvent::normal(
                EventKind::SchemaPruned,
                updated.name(),
                "dropped retired versions from the schema",
            )
            .field("dropped", dropped.join(","))
            .field("retained", desired),
        );
        Ok(PassOutcome::SchemaPruned { dropped })
    }
}

// ---------------------------------------------------------------------------
// StorageMigrationHandler — gated lifecycle entry point
// ---------------------------------------------------------------------------

/// Runs the migration pass when invoked after state read, on behalf of the
/// ready controller deployment.
#[derive(Debug, Clone)]
pub struct StorageMigrationHandler {
    type_name: String,
    engine: MigrationEngine,
}

impl StorageMigrationHandler {
    pub fn new(type_name: impl Into<String>, config: MigrationConfig) -> Self {
        Self {
            type_name: type_name.into(),
            engine: MigrationEngine::new(config),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns `Ok(None)` when the gate does not apply to this invocation.
    pub fn run<S: StoreClient, E: EventSink>(
        &self,
        args: &ReconcileArgs,
        store: &mut S,
        events: &mut E,
    ) -> Result<Option<PassOutcome>, MigrationError> {
        if args.phase != ReconcilePhase::PostRead {
            return Ok(None);
        }
        let Some(deployment) = args.current.as_ref().and_then(WatchedObject::as_deployment)
        else {
            return Ok(None);
        };
        if !deployment.is_controller_workload() || !deployment.is_ready() {
            return Ok(None);
        }
        self.engine.run_pass(store, &self.type_name, events).map(Some)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
