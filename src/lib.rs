//! # FKT Engine
//!
//! Incremental fastest-known-time aggregation for bikeshare trip data.
//!
//! Monthly trip batches arrive with raw station identifiers and names that
//! drift over the years. This library resolves every trip endpoint to a
//! stable, coordinate-derived station identity, folds each batch into a
//! cumulative best-time-per-ordered-pair table, and checkpoints the
//! cumulative state after every merged batch so a run can crash and resume
//! at batch granularity.
//!
//! This crate provides:
//! - Deterministic geo-identity resolution (rounded coordinates -> UUID)
//! - Per-batch pair aggregation (min duration, attempt counts, evidence)
//! - Order-independent merge of fastest times and attempt counts
//! - Crash-safe snapshot checkpointing with legacy-format upgrade
//!
//! ## Features
//!
//! - **`parallel`** - Enable parallel within-batch aggregation with rayon
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use fkt_engine::{CanonicalTrip, FastestTimeEngine, GeoPoint};
//!
//! let trip = CanonicalTrip {
//!     trip_ref: "ride-1".to_string(),
//!     raw_start_id: "12".to_string(),
//!     raw_end_id: "47".to_string(),
//!     start_label: "Central Square".to_string(),
//!     end_label: "Kendall Square".to_string(),
//!     start: GeoPoint::new(42.365070, -71.103100),
//!     end: GeoPoint::new(42.362500, -71.084700),
//!     duration_minutes: 7.5,
//!     observed_at: Utc.with_ymd_and_hms(2024, 1, 5, 8, 30, 0).unwrap(),
//! };
//!
//! let mut engine = FastestTimeEngine::new();
//! let summary = engine.process_batch("202401", &[trip]).unwrap();
//! assert_eq!(summary.pair_count, 1);
//! assert_eq!(engine.stats().station_count, 2);
//! ```

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Unified error handling
pub mod error;
pub use error::{EngineError, Result};

// Geographic helpers (rounding, identity keys, distance, formatting)
pub mod geo;
pub use geo::{format_minutes, haversine_km, identity_key, round_coordinate};

// Geo-identity resolution (per-batch station registry)
pub mod resolver;
pub use resolver::{resolve_batch, BatchRegistry};

// Per-batch pair aggregation
pub mod aggregator;
#[cfg(feature = "parallel")]
pub use aggregator::aggregate_batch_parallel;
pub use aggregator::{aggregate_batch, BatchPairTable};

// Cumulative merge & checkpoint manager
pub mod engine;
pub use engine::{BatchSummary, EngineStats, FastestTimeEngine};

// Snapshot persistence (versioned format + legacy upgrade)
pub mod persistence;
pub use persistence::{load_snapshot, write_snapshot, Snapshot, SNAPSHOT_VERSION};

// Sequential batch run loop over a BatchSource collaborator
pub mod pipeline;
pub use pipeline::{run, BatchSource, RunReport};

// ============================================================================
// Core Types
// ============================================================================

/// Identifier for one batch of trips (one month of data in practice).
///
/// Opaque to the engine except for ordering: batch identifiers sort
/// chronologically (e.g. `"202401" < "202402"`), and the pipeline processes
/// them oldest to newest.
pub type BatchId = String;

/// A geographic coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use fkt_engine::GeoPoint;
/// let point = GeoPoint::new(42.3601, -71.0589); // Boston
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a new geographic point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// One normalized trip record, as produced by the upstream trip normalizer.
///
/// The normalizer guarantees every field is present and the duration is
/// within its validity window, so the engine never sees partial records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalTrip {
    /// External reference for this trip (ride id in the source data).
    pub trip_ref: String,
    /// Raw station identifier at the start endpoint, as published upstream.
    pub raw_start_id: String,
    /// Raw station identifier at the end endpoint.
    pub raw_end_id: String,
    /// Display name of the start station at the time of the trip.
    pub start_label: String,
    /// Display name of the end station at the time of the trip.
    pub end_label: String,
    /// Start endpoint coordinates.
    pub start: GeoPoint,
    /// End endpoint coordinates.
    pub end: GeoPoint,
    /// Trip duration in minutes (fractional).
    pub duration_minutes: f64,
    /// When the trip started.
    pub observed_at: DateTime<Utc>,
}

/// One physical dock location, keyed by its coordinate-derived identity.
///
/// Raw station identifiers and display names change over the years; every
/// value ever observed at this location is retained, and `current_label`
/// tracks the most recently processed name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationIdentity {
    /// Stable identity key, a pure function of the rounded coordinates.
    pub key: Uuid,
    /// First-seen latitude. Later observations that round to the same key
    /// are absorbed without updating this value.
    pub latitude: f64,
    /// First-seen longitude.
    pub longitude: f64,
    /// Most recently observed display name (last write wins, in batch
    /// processing order).
    pub current_label: String,
    /// Every distinct raw station identifier ever seen at this location.
    pub raw_ids: BTreeSet<String>,
    /// Every distinct display name ever seen at this location.
    pub raw_labels: BTreeSet<String>,
}

impl StationIdentity {
    /// The first-seen coordinates of this identity.
    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// The trip substantiating a recorded fastest time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripEvidence {
    /// External trip reference.
    pub trip_ref: String,
    /// When the trip started.
    pub observed_at: DateTime<Utc>,
}

/// An ordered (from, to) identity key combination.
///
/// Directed: `A -> B` and `B -> A` are tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PairKey {
    pub from: Uuid,
    pub to: Uuid,
}

impl PairKey {
    /// Create an ordered pair key.
    pub fn new(from: Uuid, to: Uuid) -> Self {
        Self { from, to }
    }
}

/// Best-known connection from one station identity to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairAggregate {
    /// Identity key of the origin station.
    pub from_key: Uuid,
    /// Identity key of the destination station.
    pub to_key: Uuid,
    /// Minimum duration ever observed for this ordered pair, in minutes.
    /// Monotonically non-increasing across merges.
    pub fastest_minutes: f64,
    /// Total qualifying trips ever observed for this pair, across all
    /// processed batches. Monotonically non-decreasing, purely additive.
    pub attempts: u64,
    /// Great-circle distance between the two identities' first-seen
    /// coordinates, in kilometers.
    pub distance_km: f64,
    /// The trip that produced `fastest_minutes`.
    pub evidence: TripEvidence,
}

impl PairAggregate {
    /// The ordered key of this pair.
    pub fn key(&self) -> PairKey {
        PairKey::new(self.from_key, self.to_key)
    }

    /// Human-readable rendering of the fastest time, e.g. `7.5 -> "7:30"`.
    ///
    /// Purely a display derivation of `fastest_minutes`.
    pub fn fastest_formatted(&self) -> String {
        format_minutes(self.fastest_minutes)
    }
}

/// Process-wide record of which batches have been fully merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    /// Batch identifiers already folded into the cumulative aggregate.
    pub processed_batches: BTreeSet<BatchId>,
    /// Timestamp of the last successful merge.
    pub last_updated: Option<DateTime<Utc>>,
}

impl Ledger {
    /// Whether a batch has already been merged.
    pub fn is_processed(&self, batch_id: &str) -> bool {
        self.processed_batches.contains(batch_id)
    }

    /// Record a successfully merged batch.
    pub fn record(&mut self, batch_id: &str, at: DateTime<Utc>) {
        self.processed_batches.insert(batch_id.to_string());
        self.last_updated = Some(at);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_geo_point_validation() {
        assert!(GeoPoint::new(42.3601, -71.0589).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, 181.0).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_pair_key_is_directed() {
        let a = identity_key(42.36, -71.09);
        let b = identity_key(42.37, -71.10);
        assert_ne!(PairKey::new(a, b), PairKey::new(b, a));
    }

    #[test]
    fn test_pair_formatted_time() {
        let pair = PairAggregate {
            from_key: identity_key(42.36, -71.09),
            to_key: identity_key(42.37, -71.10),
            fastest_minutes: 7.5,
            attempts: 3,
            distance_km: 1.2,
            evidence: TripEvidence {
                trip_ref: "ride-1".to_string(),
                observed_at: Utc.with_ymd_and_hms(2024, 1, 5, 8, 30, 0).unwrap(),
            },
        };
        assert_eq!(pair.fastest_formatted(), "7:30");
    }

    #[test]
    fn test_ledger_record() {
        let mut ledger = Ledger::default();
        assert!(!ledger.is_processed("202401"));

        let at = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        ledger.record("202401", at);

        assert!(ledger.is_processed("202401"));
        assert_eq!(ledger.last_updated, Some(at));

        // Re-recording the same batch does not duplicate the entry.
        ledger.record("202401", at);
        assert_eq!(ledger.processed_batches.len(), 1);
    }
}
