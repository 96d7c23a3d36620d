//! Forced re-write sweep over every live instance of a kind.
//!
//! The sweep lists instances page by page and issues an unconditional
//! read-modify-write for each, forcing the store to re-persist them under the
//! current storage encoding. Stale version names are carried for intent
//! reporting only; instances expose no encoding tag, so the sweep touches all
//! of them.
//!
//! Recovery strategy: no cursor survives a failed pass. A transient error
//! aborts the sweep and the next pass re-scans from the first page, trading
//! repeated work for crash-safety.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::event::{EngineEvent, EventKind, EventSink};
use crate::store::{ContinuationToken, StoreClient, StoreError};

// ---------------------------------------------------------------------------
// SweepConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Instances requested per list page. Clamped to at least 1.
    pub page_size: usize,
}

impl SweepConfig {
    pub fn is_valid(&self) -> bool {
        self.page_size >= 1
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { page_size: 256 }
    }
}

// ---------------------------------------------------------------------------
// SweepOutcome
// ---------------------------------------------------------------------------

/// Per-pass sweep counters. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepOutcome {
    pub pages: u64,
    pub rewritten: u64,
    /// Writes that lost the optimistic race; a concurrent writer already
    /// re-persisted the instance, so these count as done.
    pub conflict_skips: u64,
    /// Instances deleted between list and write.
    pub missing_skips: u64,
}

impl SweepOutcome {
    pub fn touched(&self) -> u64 {
        self.rewritten + self.conflict_skips + self.missing_skips
    }
}

// ---------------------------------------------------------------------------
// ObjectSweeper
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ObjectSweeper {
    config: SweepConfig,
}

impl ObjectSweeper {
    pub fn new(config: SweepConfig) -> Self {
        Self { config }
    }

    /// Run one full sweep of `kind`. Aborts on the first transient error,
    /// leaving re-listing to the next pass.
    pub fn sweep<S: StoreClient, E: EventSink>(
        &self,
        store: &mut S,
        kind: &str,
        stale: &BTreeSet<String>,
        events: &mut E,
    ) -> Result<SweepOutcome, StoreError> {
        let stale_list = stale.iter().cloned().collect::<Vec<_>>().join(",");
        events.record(
            EngineEvent::normal(
                EventKind::SweepStarted,
                kind,
                format!("rewriting all instances of {kind}"),
            )
            .field("stale_versions", stale_list.clone()),
        );

        match self.run(store, kind) {
            Ok(outcome) => {
                events.record(
                    EngineEvent::normal(
                        EventKind::SweepCompleted,
                        kind,
                        format!("rewrote {} instances of {kind}", outcome.rewritten),
                    )
                    .field("pages", outcome.pages.to_string())
                    .field("rewritten", outcome.rewritten.to_string())
                    .field("conflict_skips", outcome.conflict_skips.to_string())
                    .field("missing_skips", outcome.missing_skips.to_string()),
                );
                Ok(outcome)
            }
            Err(err) => {
                events.record(
                    EngineEvent::warning(
                        EventKind::SweepAborted,
                        kind,
                        format!("sweep aborted: {err}"),
                    )
                    .field("error_code", err.code())
                    .field("stale_versions", stale_list),
                );
                Err(err)
            }
        }
    }

    fn run<S: StoreClient>(&self, store: &mut S, kind: &str) -> Result<SweepOutcome, StoreError> {
        let mut outcome = SweepOutcome::default();
        let mut token: Option<ContinuationToken> = None;
        loop {
            let page = store.list_instances(kind, self.config.page_size, token.as_ref())?;
            outcome.pages += 1;
            for instance in &page.items {
                match store.rewrite_instance(instance) {
                    Ok(()) => outcome.rewritten += 1,
                    Err(err) if err.is_conflict() => outcome.conflict_skips += 1,
                    Err(err) if err.is_not_found() => outcome.missing_skips += 1,
                    Err(err) => return Err(err),
                }
            }
            match page.next {
                Some(next) => token = Some(next),
                None => return Ok(outcome),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
