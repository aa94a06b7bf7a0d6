//! # Fastest-Time Engine
//!
//! The incremental merge & checkpoint manager: sole owner of the cumulative
//! station registry, pair table, and processing ledger.
//!
//! ## Architecture
//!
//! Each batch runs through three phases, with no cumulative mutation until
//! the batch is fully computed:
//! 1. Resolve the batch's station identities (pure, batch-local)
//! 2. Aggregate the batch's directed pair table (pure, batch-local)
//! 3. Merge into cumulative state, append the ledger, write a checkpoint
//!
//! Merging is commutative per pair (min for fastest time, sum for
//! attempts); only `current_label` is order-dependent, which is why the
//! caller must present batches oldest to newest.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info};
use uuid::Uuid;

use crate::aggregator::BatchPairTable;
#[cfg(not(feature = "parallel"))]
use crate::aggregator::aggregate_batch;
#[cfg(feature = "parallel")]
use crate::aggregator::aggregate_batch_parallel;
use crate::persistence::{load_snapshot, write_snapshot};
use crate::resolver::{resolve_batch, BatchRegistry};
use crate::{
    BatchId, CanonicalTrip, EngineError, Ledger, PairAggregate, PairKey, Result, StationIdentity,
};

// ============================================================================
// Core Types
// ============================================================================

/// Per-batch processing figures, returned after a successful merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    /// Identifier of the merged batch.
    pub batch_id: BatchId,
    /// Trips presented for aggregation.
    pub trip_count: usize,
    /// Distinct ordered pairs observed in this batch.
    pub pair_count: usize,
    /// Station identities first seen in this batch.
    pub new_stations: usize,
    /// Trips dropped because their endpoints were unmappable.
    pub dropped: u64,
}

/// Engine statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub station_count: u32,
    pub pair_count: u32,
    pub processed_batch_count: u32,
    pub dropped_trips: u64,
}

// ============================================================================
// Fastest-Time Engine
// ============================================================================

/// Cumulative fastest-known-time state with batch-granular checkpointing.
///
/// The engine is the only component permitted to mutate persisted state.
/// Per-batch registries and pair tables are transient inputs consumed by
/// [`FastestTimeEngine::process_batch`].
#[derive(Debug, Default)]
pub struct FastestTimeEngine {
    registry: BTreeMap<Uuid, StationIdentity>,
    pairs: BTreeMap<PairKey, PairAggregate>,
    ledger: Ledger,
    /// Cumulative count of unmappable records across all batches.
    dropped_trips: u64,
    /// Snapshot destination. `None` disables checkpointing (in-memory use
    /// and tests).
    checkpoint_path: Option<PathBuf>,
}

impl FastestTimeEngine {
    /// Create an empty engine with checkpointing disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine checkpointing to `path`, restoring any snapshot
    /// already there. A legacy-format snapshot is upgraded transparently
    /// on load and rewritten in the current format at the next checkpoint.
    pub fn with_checkpoint(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut engine = Self::new();

        if path.exists() {
            let snapshot = load_snapshot(&path)?;
            info!(
                "restored checkpoint from {}: {} stations, {} pairs, {} processed batches",
                path.display(),
                snapshot.registry.len(),
                snapshot.pairs.len(),
                snapshot.ledger.processed_batches.len()
            );
            engine.registry = snapshot.registry;
            engine.pairs = snapshot
                .pairs
                .into_iter()
                .map(|pair| (pair.key(), pair))
                .collect();
            engine.ledger = snapshot.ledger;
            engine.dropped_trips = snapshot.dropped_trips;
        }

        engine.checkpoint_path = Some(path);
        Ok(engine)
    }

    // ========================================================================
    // Batch Processing
    // ========================================================================

    /// Resolve, aggregate, and merge one batch, then checkpoint.
    ///
    /// Refuses batches already recorded in the ledger: the merge's min and
    /// sum operations are not idempotent against re-application, so a
    /// ledgered batch must never be merged twice.
    ///
    /// On a checkpoint failure the error is fatal for the run; the
    /// previous on-disk snapshot is left intact and this engine value
    /// should be discarded, so a restart reprocesses the batch.
    pub fn process_batch(&mut self, batch_id: &str, trips: &[CanonicalTrip]) -> Result<BatchSummary> {
        if self.ledger.is_processed(batch_id) {
            return Err(EngineError::BatchAlreadyProcessed {
                batch_id: batch_id.to_string(),
            });
        }

        debug!("processing batch '{}' ({} trips)", batch_id, trips.len());

        // Phase 1 & 2: fully compute the batch before touching cumulative
        // state.
        let registry = resolve_batch(trips);

        #[cfg(feature = "parallel")]
        let table = aggregate_batch_parallel(trips, &registry);
        #[cfg(not(feature = "parallel"))]
        let table = aggregate_batch(trips, &registry);

        let new_stations = registry
            .identities()
            .keys()
            .filter(|key| !self.registry.contains_key(key))
            .count();

        let summary = BatchSummary {
            batch_id: batch_id.to_string(),
            trip_count: trips.len(),
            pair_count: table.len(),
            new_stations,
            dropped: table.dropped,
        };

        // Phase 3: merge, ledger, checkpoint.
        self.dropped_trips += table.dropped;
        self.merge_registry(registry);
        self.merge_pairs(table);
        self.ledger.record(batch_id, Utc::now());
        self.checkpoint()?;

        info!(
            "merged batch '{}': {} trips, {} pairs ({} new stations, {} dropped)",
            batch_id, summary.trip_count, summary.pair_count, summary.new_stations, summary.dropped
        );

        Ok(summary)
    }

    /// Merge a batch registry into the cumulative registry.
    ///
    /// Set union for raw IDs and labels (no information is ever lost);
    /// `current_label` is overwritten because batches arrive in
    /// chronological order, a precondition the caller enforces.
    fn merge_registry(&mut self, batch: BatchRegistry) {
        for (key, station) in batch.into_identities() {
            match self.registry.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(station);
                }
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    existing.raw_ids.extend(station.raw_ids);
                    existing.raw_labels.extend(station.raw_labels);
                    existing.current_label = station.current_label;
                }
            }
        }
    }

    /// Merge a batch pair table into the cumulative table.
    ///
    /// The central aggregation invariant: `fastest_minutes` reflects the
    /// minimum ever observed across all history, independent of
    /// processing order, while `attempts` is purely additive.
    fn merge_pairs(&mut self, batch: BatchPairTable) {
        for (key, pair) in batch.into_pairs() {
            match self.pairs.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(pair);
                }
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    existing.attempts += pair.attempts;
                    if pair.fastest_minutes < existing.fastest_minutes {
                        existing.fastest_minutes = pair.fastest_minutes;
                        existing.evidence = pair.evidence;
                    }
                }
            }
        }
    }

    // ========================================================================
    // Work Set & Ledger
    // ========================================================================

    /// Whether a batch has already been merged.
    pub fn is_processed(&self, batch_id: &str) -> bool {
        self.ledger.is_processed(batch_id)
    }

    /// Compute the remaining work set: known batches minus processed ones,
    /// sorted oldest to newest.
    pub fn pending_batches(&self, known: &[BatchId]) -> Vec<BatchId> {
        let mut pending: Vec<BatchId> = known
            .iter()
            .filter(|id| !self.ledger.is_processed(id))
            .cloned()
            .collect();
        pending.sort();
        pending.dedup();
        pending
    }

    // ========================================================================
    // Checkpointing
    // ========================================================================

    /// Persist a full snapshot of the cumulative state, atomically with
    /// respect to the previous checkpoint. A no-op when no checkpoint
    /// path is configured.
    pub fn checkpoint(&self) -> Result<()> {
        let Some(path) = &self.checkpoint_path else {
            return Ok(());
        };
        write_snapshot(
            path,
            &self.ledger,
            &self.registry,
            &self.pairs,
            self.dropped_trips,
        )?;
        debug!("checkpoint written to {}", path.display());
        Ok(())
    }

    /// The configured checkpoint path, if any.
    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.checkpoint_path.as_deref()
    }

    // ========================================================================
    // Read-Only Snapshots
    // ========================================================================

    /// The cumulative station identity table.
    pub fn registry(&self) -> &BTreeMap<Uuid, StationIdentity> {
        &self.registry
    }

    /// The cumulative directed pair table.
    pub fn pairs(&self) -> &BTreeMap<PairKey, PairAggregate> {
        &self.pairs
    }

    /// Look up the best-known connection for an ordered pair.
    pub fn pair(&self, from: Uuid, to: Uuid) -> Option<&PairAggregate> {
        self.pairs.get(&PairKey::new(from, to))
    }

    /// The processing ledger.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Engine statistics.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            station_count: self.registry.len() as u32,
            pair_count: self.pairs.len() as u32,
            processed_batch_count: self.ledger.processed_batches.len() as u32,
            dropped_trips: self.dropped_trips,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{identity_key, GeoPoint};
    use chrono::{TimeZone, Utc};

    const A: (f64, f64) = (42.36, -71.094);
    const B: (f64, f64) = (42.365, -71.09);

    fn trip(trip_ref: &str, duration: f64) -> CanonicalTrip {
        trip_labeled(trip_ref, duration, "A", "B")
    }

    fn trip_labeled(
        trip_ref: &str,
        duration: f64,
        start_label: &str,
        end_label: &str,
    ) -> CanonicalTrip {
        CanonicalTrip {
            trip_ref: trip_ref.to_string(),
            raw_start_id: "12".to_string(),
            raw_end_id: "47".to_string(),
            start_label: start_label.to_string(),
            end_label: end_label.to_string(),
            start: GeoPoint::new(A.0, A.1),
            end: GeoPoint::new(B.0, B.1),
            duration_minutes: duration,
            observed_at: Utc.with_ymd_and_hms(2024, 1, 5, 8, 30, 0).unwrap(),
        }
    }

    fn pair_a_b(engine: &FastestTimeEngine) -> &PairAggregate {
        engine
            .pair(identity_key(A.0, A.1), identity_key(B.0, B.1))
            .unwrap()
    }

    #[test]
    fn test_single_batch_merge() {
        let mut engine = FastestTimeEngine::new();
        let summary = engine
            .process_batch("202401", &[trip("r1", 7.5), trip("r2", 5.0)])
            .unwrap();

        assert_eq!(summary.pair_count, 1);
        assert_eq!(summary.new_stations, 2);

        let pair = pair_a_b(&engine);
        assert_eq!(pair.fastest_minutes, 5.0);
        assert_eq!(pair.fastest_formatted(), "5:00");
        assert_eq!(pair.attempts, 2);
        assert!(engine.is_processed("202401"));
    }

    #[test]
    fn test_slower_later_batch_keeps_fastest_and_adds_attempts() {
        let mut engine = FastestTimeEngine::new();
        engine.process_batch("202401", &[trip("r1", 5.0)]).unwrap();
        engine
            .process_batch("202402", &[trip("r2", 9.0), trip("r3", 8.0)])
            .unwrap();

        let pair = pair_a_b(&engine);
        assert_eq!(pair.fastest_minutes, 5.0);
        assert_eq!(pair.evidence.trip_ref, "r1");
        assert_eq!(pair.attempts, 3);
    }

    #[test]
    fn test_faster_later_batch_replaces_evidence() {
        let mut engine = FastestTimeEngine::new();
        engine.process_batch("202401", &[trip("r1", 7.0)]).unwrap();
        engine.process_batch("202402", &[trip("r2", 4.25)]).unwrap();

        let pair = pair_a_b(&engine);
        assert_eq!(pair.fastest_minutes, 4.25);
        assert_eq!(pair.fastest_formatted(), "4:15");
        assert_eq!(pair.evidence.trip_ref, "r2");
        assert_eq!(pair.attempts, 2);
    }

    #[test]
    fn test_merge_is_commutative_for_times_and_attempts() {
        let batch1 = vec![trip("r1", 7.0), trip("r2", 6.0)];
        let batch2 = vec![trip("r3", 5.5), trip("r4", 9.0), trip("r5", 5.5)];

        let mut forward = FastestTimeEngine::new();
        forward.process_batch("b1", &batch1).unwrap();
        forward.process_batch("b2", &batch2).unwrap();

        let mut reverse = FastestTimeEngine::new();
        reverse.process_batch("b2", &batch2).unwrap();
        reverse.process_batch("b1", &batch1).unwrap();

        let f = pair_a_b(&forward);
        let r = pair_a_b(&reverse);
        assert_eq!(f.fastest_minutes, r.fastest_minutes);
        assert_eq!(f.fastest_minutes, 5.5);
        assert_eq!(f.attempts, r.attempts);
        assert_eq!(f.attempts, 5);
    }

    #[test]
    fn test_refuses_already_processed_batch() {
        let mut engine = FastestTimeEngine::new();
        engine.process_batch("202401", &[trip("r1", 7.0)]).unwrap();

        let err = engine
            .process_batch("202401", &[trip("r1", 7.0)])
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::BatchAlreadyProcessed { .. }
        ));

        // Nothing was double-counted.
        assert_eq!(pair_a_b(&engine).attempts, 1);
    }

    #[test]
    fn test_later_batch_updates_current_label() {
        let mut engine = FastestTimeEngine::new();
        engine
            .process_batch("202401", &[trip_labeled("r1", 7.0, "Main St", "B")])
            .unwrap();
        engine
            .process_batch("202402", &[trip_labeled("r2", 8.0, "Main Street", "B")])
            .unwrap();

        let station = engine.registry().get(&identity_key(A.0, A.1)).unwrap();
        assert_eq!(station.current_label, "Main Street");
        assert!(station.raw_labels.contains("Main St"));
        assert!(station.raw_labels.contains("Main Street"));
    }

    #[test]
    fn test_pending_batches_sorted_minus_processed() {
        let mut engine = FastestTimeEngine::new();
        engine.process_batch("202402", &[trip("r1", 7.0)]).unwrap();

        let known = vec![
            "202403".to_string(),
            "202401".to_string(),
            "202402".to_string(),
        ];
        assert_eq!(
            engine.pending_batches(&known),
            vec!["202401".to_string(), "202403".to_string()]
        );
    }

    #[test]
    fn test_stats() {
        let mut engine = FastestTimeEngine::new();
        engine
            .process_batch("202401", &[trip("r1", 7.0), trip("r2", 5.0)])
            .unwrap();

        let stats = engine.stats();
        assert_eq!(stats.station_count, 2);
        assert_eq!(stats.pair_count, 1);
        assert_eq!(stats.processed_batch_count, 1);
        assert_eq!(stats.dropped_trips, 0);
    }
}
