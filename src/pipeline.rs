//! Sequential batch run loop.
//!
//! Batches are acquired from a [`BatchSource`] collaborator (the trip
//! normalizer plus whatever download/cache machinery sits behind it) and
//! processed strictly oldest to newest, exactly one batch in flight. A
//! failure fetching or computing one batch is contained: it is logged,
//! recorded on the run report, and the run continues. A failure merging or
//! checkpointing is fatal: the run aborts and the last good checkpoint on
//! disk stays intact.

use log::{info, warn};

use crate::engine::FastestTimeEngine;
use crate::{BatchId, CanonicalTrip, EngineError, Result};

/// Collaborator boundary: lists available batches and produces canonical
/// trips for one batch.
///
/// Implementations own all fetching, caching, and format normalization.
/// The trips returned for a batch must be in a stable (chronological)
/// order and satisfy the canonical-trip contract: every field present,
/// coordinates valid.
pub trait BatchSource {
    /// All batch identifiers the source knows about, in any order.
    fn list_batches(&self) -> Result<Vec<BatchId>>;

    /// Produce the canonical trips for one batch.
    fn fetch_batch(&mut self, batch_id: &str) -> Result<Vec<CanonicalTrip>>;
}

/// Outcome of one run over a batch source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Batches merged during this run, in processing order.
    pub merged: Vec<BatchId>,
    /// Batches skipped because the ledger already records them.
    pub skipped: Vec<BatchId>,
    /// Batches that failed to fetch or compute, with the failure message.
    /// These are not marked processed and will be retried next run.
    pub failed: Vec<(BatchId, String)>,
    /// Unmappable trips dropped across all merged batches.
    pub dropped_trips: u64,
}

impl RunReport {
    /// Whether every attempted batch merged cleanly.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Process every pending batch from `source`, oldest to newest.
///
/// Returns the run report once all available batches have been attempted.
/// Propagates merge/checkpoint errors immediately; per-batch fetch
/// failures only mark the batch as failed in the report.
pub fn run<S: BatchSource>(engine: &mut FastestTimeEngine, source: &mut S) -> Result<RunReport> {
    let known = source.list_batches()?;

    let mut report = RunReport {
        skipped: known
            .iter()
            .filter(|id| engine.is_processed(id))
            .cloned()
            .collect(),
        ..RunReport::default()
    };

    let pending = engine.pending_batches(&known);
    if pending.is_empty() {
        info!("all {} known batches already processed", known.len());
        return Ok(report);
    }
    info!(
        "{} pending of {} known batches ({} already processed)",
        pending.len(),
        known.len(),
        report.skipped.len()
    );

    for batch_id in pending {
        let trips = match source.fetch_batch(&batch_id) {
            Ok(trips) => trips,
            Err(err) => {
                warn!("batch '{}' failed to fetch: {}; continuing", batch_id, err);
                report.failed.push((batch_id, err.to_string()));
                continue;
            }
        };

        match engine.process_batch(&batch_id, &trips) {
            Ok(summary) => {
                report.dropped_trips += summary.dropped;
                report.merged.push(batch_id);
            }
            // A checkpoint or serialization failure means cumulative state
            // may have partially applied in memory; abort rather than
            // continue against it.
            Err(err @ (EngineError::Checkpoint { .. } | EngineError::Snapshot(_))) => {
                return Err(err);
            }
            Err(err) => {
                warn!("batch '{}' failed to merge: {}; continuing", batch_id, err);
                report.failed.push((batch_id, err.to_string()));
            }
        }
    }

    info!(
        "run complete: {} merged, {} skipped, {} failed, {} trips dropped",
        report.merged.len(),
        report.skipped.len(),
        report.failed.len(),
        report.dropped_trips
    );
    Ok(report)
}

// ============================================================================
// Tests
// ============================================================================
