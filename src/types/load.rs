//! Load and destination types supplied by the load registry

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Geographic coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Coordinates are usable when both components are finite and in range.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Bit-exact key, used where coordinates must be hashed.
    pub(crate) fn key(&self) -> (u64, u64) {
        (self.lat.to_bits(), self.lng.to_bits())
    }
}

/// A delivery destination belonging to a load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub id: Uuid,
    pub coordinates: Coordinates,
    pub address: String,
    #[serde(default)]
    pub expected_delivery_date: Option<NaiveDate>,
}

/// A transport load with its origin and destinations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Load {
    pub id: Uuid,
    pub origin: Coordinates,
    pub destinations: Vec<Destination>,
    /// Weak reference to the active route version, owned by route persistence
    #[serde(default)]
    pub active_version_id: Option<Uuid>,
}

impl Load {
    /// Stable digest of the origin and destination set.
    ///
    /// Destination order does not matter; ids and coordinates do.
    pub fn fingerprint(&self) -> String {
        let mut entries: Vec<(Uuid, (u64, u64))> = self
            .destinations
            .iter()
            .map(|d| (d.id, d.coordinates.key()))
            .collect();
        entries.sort();

        let mut hasher = Sha256::new();
        let (olat, olng) = self.origin.key();
        hasher.update(olat.to_be_bytes());
        hasher.update(olng.to_be_bytes());
        for (id, (lat, lng)) in entries {
            hasher.update(id.as_bytes());
            hasher.update(lat.to_be_bytes());
            hasher.update(lng.to_be_bytes());
        }
        hex::encode(hasher.finalize())
    }
}
