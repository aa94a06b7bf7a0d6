//! Geo-identity resolution: mapping raw trip endpoints to stable station
//! identities for one batch.
//!
//! A batch registry is transient and batch-local. It reads no global state
//! and writes none; the merge step owns folding it into the cumulative
//! registry. Trips are expected in a stable (chronological) order so that
//! "current label" is meaningful within the batch.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::geo::identity_key_for;
use crate::{CanonicalTrip, GeoPoint, StationIdentity};

/// Per-batch registry of station identities, keyed by identity key.
///
/// Doubles as the batch's coordinate-to-key lookup: [`BatchRegistry::resolve`]
/// answers only for locations actually observed in the batch.
#[derive(Debug, Clone, Default)]
pub struct BatchRegistry {
    identities: BTreeMap<Uuid, StationIdentity>,
}

impl BatchRegistry {
    /// Resolve a coordinate to an identity key, if that location was
    /// observed in this batch.
    pub fn resolve(&self, point: &GeoPoint) -> Option<Uuid> {
        let key = identity_key_for(point);
        self.identities.contains_key(&key).then_some(key)
    }

    /// Resolve a coordinate to the full station identity.
    pub fn station_for(&self, point: &GeoPoint) -> Option<&StationIdentity> {
        self.identities.get(&identity_key_for(point))
    }

    /// Look up an identity by key.
    pub fn get(&self, key: &Uuid) -> Option<&StationIdentity> {
        self.identities.get(key)
    }

    /// All identities observed in this batch, ordered by key.
    pub fn identities(&self) -> &BTreeMap<Uuid, StationIdentity> {
        &self.identities
    }

    /// Consume the registry, yielding its identities for merging.
    pub fn into_identities(self) -> BTreeMap<Uuid, StationIdentity> {
        self.identities
    }

    /// Number of distinct identities observed in this batch.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Whether the batch observed no stations at all.
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Fold one endpoint observation into the registry.
    ///
    /// Coordinates are kept from the first observation only; later
    /// observations at the same key were already absorbed by rounding.
    /// The label overwrite is last-write-wins in iteration order.
    /// Out-of-range or non-finite coordinates are skipped, which leaves
    /// the trip unresolvable and lets aggregation count it as dropped.
    fn observe(&mut self, point: &GeoPoint, raw_id: &str, label: &str) {
        if !point.is_valid() {
            return;
        }
        let key = identity_key_for(point);
        let entry = self.identities.entry(key).or_insert_with(|| StationIdentity {
            key,
            latitude: point.latitude,
            longitude: point.longitude,
            current_label: label.to_string(),
            raw_ids: Default::default(),
            raw_labels: Default::default(),
        });
        entry.raw_ids.insert(raw_id.to_string());
        entry.raw_labels.insert(label.to_string());
        entry.current_label = label.to_string();
    }
}

/// Build the station registry for one batch of canonical trips.
///
/// Both endpoints of every trip are folded in, in batch iteration order.
/// Trips with missing coordinates are excluded upstream by the
/// normalizer's contract; endpoints carrying invalid coordinates are
/// skipped here.
pub fn resolve_batch(trips: &[CanonicalTrip]) -> BatchRegistry {
    let mut registry = BatchRegistry::default();
    for trip in trips {
        registry.observe(&trip.start, &trip.raw_start_id, &trip.start_label);
        registry.observe(&trip.end, &trip.raw_end_id, &trip.end_label);
    }
    registry
}

// ============================================================================
// Tests
// ============================================================================
