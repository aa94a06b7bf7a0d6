//! Snapshot persistence for the cumulative state.
//!
//! One checkpoint is one versioned JSON document holding the ledger, the
//! station registry, and the pair table. Writes go to a staging file that
//! is renamed over the live snapshot, so a failure mid-write never
//! corrupts the previous checkpoint.
//!
//! The loader branches once on the document's shape. A `version` field
//! marks the current format. Without it the file is one of the two
//! historical shapes: the nested form (top-level `metadata` /
//! `station_registry` / `station_pairs`) or the older flat form
//! (sentinel `_metadata` / `_station_registry` keys beside a
//! station-to-destinations map). Either is upgraded in memory on load;
//! formats are never mixed after that point, and the next checkpoint
//! rewrites the file in the current shape.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    EngineError, Ledger, PairAggregate, PairKey, Result, StationIdentity, TripEvidence,
};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 2;

/// A full snapshot of the cumulative state, in the current format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub ledger: Ledger,
    pub registry: BTreeMap<Uuid, StationIdentity>,
    pub pairs: Vec<PairAggregate>,
    /// Trips dropped as unmappable across all merged batches.
    #[serde(default)]
    pub dropped_trips: u64,
}

/// Borrowed view of the cumulative state for serialization, so a
/// checkpoint write never clones the tables.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    ledger: &'a Ledger,
    registry: &'a BTreeMap<Uuid, StationIdentity>,
    pairs: Vec<&'a PairAggregate>,
    dropped_trips: u64,
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn io_error(path: &Path, source: std::io::Error) -> EngineError {
    EngineError::Checkpoint {
        path: path.to_path_buf(),
        source,
    }
}

fn format_error(path: &Path, message: impl Into<String>) -> EngineError {
    EngineError::SnapshotFormat {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

/// Write a snapshot atomically: serialize to `<path>.tmp`, then rename
/// over the live file.
pub fn write_snapshot(
    path: &Path,
    ledger: &Ledger,
    registry: &BTreeMap<Uuid, StationIdentity>,
    pairs: &BTreeMap<PairKey, PairAggregate>,
    dropped_trips: u64,
) -> Result<()> {
    let snapshot = SnapshotRef {
        version: SNAPSHOT_VERSION,
        ledger,
        registry,
        pairs: pairs.values().collect(),
        dropped_trips,
    };
    let encoded = serde_json::to_string_pretty(&snapshot)?;

    let staging = staging_path(path);
    fs::write(&staging, encoded).map_err(|source| io_error(&staging, source))?;
    fs::rename(&staging, path).map_err(|source| io_error(path, source))?;
    Ok(())
}

/// Load a snapshot, transparently upgrading either legacy format.
pub fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let raw = fs::read_to_string(path).map_err(|source| io_error(path, source))?;
    let value: Value = serde_json::from_str(&raw)?;

    if value.get("version").is_some() {
        let snapshot: Snapshot = serde_json::from_value(value)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(format_error(
                path,
                format!("unsupported snapshot version {}", snapshot.version),
            ));
        }
        Ok(snapshot)
    } else if value.get("station_pairs").is_some() || value.get("metadata").is_some() {
        upgrade_legacy_nested(value)
    } else {
        upgrade_legacy_flat(value, path)
    }
}

// ============================================================================
// Legacy Format Upgrade
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct LegacyMetadata {
    #[serde(default)]
    processed_months: Vec<String>,
    #[serde(default)]
    last_updated: String,
}

#[derive(Debug, Deserialize)]
struct LegacyStation {
    lat: f64,
    lng: f64,
    #[serde(default)]
    current_name: String,
    #[serde(default)]
    bluebike_ids: Vec<String>,
    #[serde(default)]
    all_names: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyNestedDocument {
    #[serde(default)]
    metadata: LegacyMetadata,
    #[serde(default)]
    station_registry: BTreeMap<Uuid, LegacyStation>,
    #[serde(default)]
    station_pairs: BTreeMap<Uuid, BTreeMap<Uuid, LegacyNestedDestination>>,
}

#[derive(Debug, Deserialize)]
struct LegacyNestedDestination {
    fastest_time_minutes: f64,
    #[serde(default = "default_trip_count")]
    attempts: u64,
    #[serde(default)]
    distance_km: f64,
    ride_id: String,
    #[serde(default)]
    fastest_set_at: String,
}

#[derive(Debug, Deserialize)]
struct LegacyEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lng: Option<f64>,
    #[serde(default)]
    bluebike_ids: Vec<String>,
    #[serde(default)]
    all_names: Vec<String>,
    #[serde(default)]
    destinations: BTreeMap<Uuid, LegacyDestination>,
}

#[derive(Debug, Deserialize)]
struct LegacyDestination {
    fastest_time_minutes: f64,
    #[serde(default = "default_trip_count")]
    trip_count: u64,
    #[serde(default)]
    distance_km: f64,
    ride_id: String,
    #[serde(default)]
    date: String,
}

fn default_trip_count() -> u64 {
    1
}

/// Parse the fixed timestamp format the legacy writer used
/// (`2024-01-05 08:30:00`, optionally suffixed ` UTC`).
fn parse_legacy_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix(" UTC").unwrap_or(trimmed);
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn ledger_from_metadata(metadata: LegacyMetadata) -> Ledger {
    Ledger {
        processed_batches: metadata.processed_months.into_iter().collect(),
        last_updated: parse_legacy_timestamp(&metadata.last_updated),
    }
}

fn identity_from_station(key: Uuid, station: LegacyStation) -> StationIdentity {
    StationIdentity {
        key,
        latitude: station.lat,
        longitude: station.lng,
        current_label: station.current_name,
        raw_ids: station.bluebike_ids.into_iter().collect(),
        raw_labels: station.all_names.into_iter().collect(),
    }
}

/// Upgrade the nested legacy snapshot (top-level `metadata`,
/// `station_registry`, and `station_pairs` objects) into the current
/// shape.
fn upgrade_legacy_nested(value: Value) -> Result<Snapshot> {
    let document: LegacyNestedDocument = serde_json::from_value(value)?;

    let registry: BTreeMap<Uuid, StationIdentity> = document
        .station_registry
        .into_iter()
        .map(|(key, station)| (key, identity_from_station(key, station)))
        .collect();

    let mut pairs = Vec::new();
    for (from_key, destinations) in document.station_pairs {
        for (to_key, dest) in destinations {
            pairs.push(PairAggregate {
                from_key,
                to_key,
                fastest_minutes: dest.fastest_time_minutes,
                attempts: dest.attempts,
                distance_km: dest.distance_km,
                evidence: TripEvidence {
                    trip_ref: dest.ride_id,
                    observed_at: parse_legacy_timestamp(&dest.fastest_set_at)
                        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                },
            });
        }
    }

    Ok(Snapshot {
        version: SNAPSHOT_VERSION,
        ledger: ledger_from_metadata(document.metadata),
        registry,
        pairs,
        dropped_trips: 0,
    })
}

/// Upgrade the flat legacy snapshot (underscore-sentinel keys beside a
/// station-to-destinations map) into the current shape.
///
/// Unparseable legacy timestamps degrade to `None` (ledger) or the Unix
/// epoch (evidence) rather than refusing years of aggregate history.
fn upgrade_legacy_flat(value: Value, path: &Path) -> Result<Snapshot> {
    let Value::Object(mut map) = value else {
        return Err(format_error(path, "snapshot root is not an object"));
    };

    let metadata: LegacyMetadata = match map.remove("_metadata") {
        Some(raw) => serde_json::from_value(raw)?,
        None => LegacyMetadata::default(),
    };

    let mut registry: BTreeMap<Uuid, StationIdentity> = BTreeMap::new();
    if let Some(raw) = map.remove("_station_registry") {
        let stations: BTreeMap<Uuid, LegacyStation> = serde_json::from_value(raw)?;
        for (key, station) in stations {
            registry.insert(key, identity_from_station(key, station));
        }
    }

    let mut pairs = Vec::new();
    for (key_raw, entry_raw) in map {
        let from_key: Uuid = key_raw
            .parse()
            .map_err(|_| format_error(path, format!("'{key_raw}' is not a station key")))?;
        let entry: LegacyEntry = serde_json::from_value(entry_raw)?;

        // Older files carried station info only on the flat entry; use it
        // when the sentinel registry lacks this key.
        if !registry.contains_key(&from_key) {
            if let (Some(lat), Some(lng)) = (entry.lat, entry.lng) {
                registry.insert(
                    from_key,
                    StationIdentity {
                        key: from_key,
                        latitude: lat,
                        longitude: lng,
                        current_label: entry.name.clone().unwrap_or_default(),
                        raw_ids: entry.bluebike_ids.iter().cloned().collect(),
                        raw_labels: entry.all_names.iter().cloned().collect(),
                    },
                );
            }
        }

        for (to_key, dest) in entry.destinations {
            pairs.push(PairAggregate {
                from_key,
                to_key,
                fastest_minutes: dest.fastest_time_minutes,
                attempts: dest.trip_count,
                distance_km: dest.distance_km,
                evidence: TripEvidence {
                    trip_ref: dest.ride_id,
                    observed_at: parse_legacy_timestamp(&dest.date)
                        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                },
            });
        }
    }

    Ok(Snapshot {
        version: SNAPSHOT_VERSION,
        ledger: ledger_from_metadata(metadata),
        registry,
        pairs,
        dropped_trips: 0,
    })
}

// ============================================================================
// Tests
// ============================================================================
