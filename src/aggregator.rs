//! Per-batch pair aggregation: folding one batch of canonical trips into a
//! directed best-time table.
//!
//! The fold is pure and batch-local. Combine functions are explicit: min
//! for the fastest duration, sum for attempt counts, first-seen for
//! evidence on exact duration ties. The parallel path partitions the batch
//! and merges partial tables with a (duration, batch index) ordering so its
//! output is bit-identical to the sequential fold.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::geo::haversine_km;
use crate::resolver::BatchRegistry;
use crate::{CanonicalTrip, PairAggregate, PairKey, StationIdentity, TripEvidence};

/// Directed pair table for one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchPairTable {
    pairs: BTreeMap<PairKey, PairAggregate>,
    /// Trips whose endpoints did not resolve against the batch registry.
    /// Dropped records are counted, never fatal.
    pub dropped: u64,
}

impl BatchPairTable {
    /// All pairs observed in this batch, ordered by key.
    pub fn pairs(&self) -> &BTreeMap<PairKey, PairAggregate> {
        &self.pairs
    }

    /// Consume the table, yielding its pairs for merging.
    pub fn into_pairs(self) -> BTreeMap<PairKey, PairAggregate> {
        self.pairs
    }

    /// Look up one pair.
    pub fn get(&self, key: &PairKey) -> Option<&PairAggregate> {
        self.pairs.get(key)
    }

    /// Number of distinct ordered pairs in this batch.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the batch produced no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Fold state for one pair. The batch index of the evidence trip is kept
/// so tie-breaks stay deterministic when partial tables are merged.
#[derive(Debug, Clone)]
struct PairFold {
    aggregate: PairAggregate,
    evidence_index: usize,
}

fn new_fold(
    from: &StationIdentity,
    to: &StationIdentity,
    trip: &CanonicalTrip,
    index: usize,
) -> PairFold {
    PairFold {
        aggregate: PairAggregate {
            from_key: from.key,
            to_key: to.key,
            fastest_minutes: trip.duration_minutes,
            attempts: 1,
            distance_km: haversine_km(&from.location(), &to.location()),
            evidence: TripEvidence {
                trip_ref: trip.trip_ref.clone(),
                observed_at: trip.observed_at,
            },
        },
        evidence_index: index,
    }
}

/// Fold trips into a table of pair folds. `base_index` offsets the batch
/// index when folding a chunk of a larger batch.
fn fold_trips(
    trips: &[CanonicalTrip],
    registry: &BatchRegistry,
    base_index: usize,
) -> (BTreeMap<PairKey, PairFold>, u64) {
    let mut folds: BTreeMap<PairKey, PairFold> = BTreeMap::new();
    let mut dropped = 0u64;

    for (offset, trip) in trips.iter().enumerate() {
        let index = base_index + offset;
        let (Some(from), Some(to)) = (
            registry.station_for(&trip.start),
            registry.station_for(&trip.end),
        ) else {
            dropped += 1;
            continue;
        };

        match folds.entry(PairKey::new(from.key, to.key)) {
            Entry::Vacant(slot) => {
                slot.insert(new_fold(from, to, trip, index));
            }
            Entry::Occupied(mut slot) => {
                let fold = slot.get_mut();
                fold.aggregate.attempts += 1;
                // Strict comparison: on an exact duration tie the earlier
                // trip keeps the evidence (an acknowledged arbitrary
                // tie-break, not semantically meaningful).
                if trip.duration_minutes < fold.aggregate.fastest_minutes {
                    fold.aggregate.fastest_minutes = trip.duration_minutes;
                    fold.aggregate.evidence = TripEvidence {
                        trip_ref: trip.trip_ref.clone(),
                        observed_at: trip.observed_at,
                    };
                    fold.evidence_index = index;
                }
            }
        }
    }

    (folds, dropped)
}

/// Merge a partial fold table into an accumulator, preserving the
/// sequential fold's tie-break by batch index.
#[cfg(feature = "parallel")]
fn combine_folds(into: &mut BTreeMap<PairKey, PairFold>, from: BTreeMap<PairKey, PairFold>) {
    for (key, fold) in from {
        match into.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(fold);
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get_mut();
                current.aggregate.attempts += fold.aggregate.attempts;
                let faster = fold.aggregate.fastest_minutes < current.aggregate.fastest_minutes;
                let tie_earlier = fold.aggregate.fastest_minutes
                    == current.aggregate.fastest_minutes
                    && fold.evidence_index < current.evidence_index;
                if faster || tie_earlier {
                    current.aggregate.fastest_minutes = fold.aggregate.fastest_minutes;
                    current.aggregate.evidence = fold.aggregate.evidence;
                    current.evidence_index = fold.evidence_index;
                }
            }
        }
    }
}

fn into_table(folds: BTreeMap<PairKey, PairFold>, dropped: u64) -> BatchPairTable {
    BatchPairTable {
        pairs: folds
            .into_iter()
            .map(|(key, fold)| (key, fold.aggregate))
            .collect(),
        dropped,
    }
}

/// Aggregate one batch of trips into a directed pair table.
///
/// Trips whose endpoints do not resolve against `registry` are dropped and
/// counted on the returned table. Per ordered pair the batch contributes
/// the minimum duration, the trip count, the evidence trip achieving the
/// minimum, and the haversine distance between the two identities'
/// first-seen coordinates.
pub fn aggregate_batch(trips: &[CanonicalTrip], registry: &BatchRegistry) -> BatchPairTable {
    let (folds, dropped) = fold_trips(trips, registry, 0);
    into_table(folds, dropped)
}

/// Parallel variant of [`aggregate_batch`].
///
/// Partitions the batch into chunks, folds them in parallel, and merges
/// the partial tables in chunk order. The result is identical to the
/// sequential fold, including evidence tie-breaks.
#[cfg(feature = "parallel")]
pub fn aggregate_batch_parallel(
    trips: &[CanonicalTrip],
    registry: &BatchRegistry,
) -> BatchPairTable {
    const CHUNK_SIZE: usize = 4096;

    if trips.len() <= CHUNK_SIZE {
        return aggregate_batch(trips, registry);
    }

    let partials: Vec<(BTreeMap<PairKey, PairFold>, u64)> = trips
        .par_chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(chunk_index, chunk)| fold_trips(chunk, registry, chunk_index * CHUNK_SIZE))
        .collect();

    let mut folds: BTreeMap<PairKey, PairFold> = BTreeMap::new();
    let mut dropped = 0u64;
    for (partial, partial_dropped) in partials {
        combine_folds(&mut folds, partial);
        dropped += partial_dropped;
    }

    into_table(folds, dropped)
}

// ============================================================================
// Tests
// ============================================================================
