//! Durable device-relay pairing records.
//!
//! A pairing records the historical trust relationship between one device
//! and one relay identity: when it first and last connected, how reliable
//! the link has been, and the certificate fingerprint the device pinned.
//! Pairings outlive connections and power auto-reconnect; they are keyed by
//! relay fingerprint plus device id, so a trust reset (new fingerprint)
//! naturally orphans old records until the expiry sweep collects them.

use crate::error::StoreError;
use crate::store::DeviceId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// Days without a connection before a pairing expires
pub const PAIRING_EXPIRY_DAYS: i64 = 30;

/// One device-relay trust record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRecord {
    /// Paired device
    pub device_id: DeviceId,
    /// Fingerprint of the relay identity this pairing belongs to
    pub relay_fingerprint: String,
    /// First successful pairing
    pub first_connected_at: DateTime<Utc>,
    /// Most recent connection attempt that succeeded
    pub last_connected_at: DateTime<Utc>,
    /// Successful connection attempts
    pub successes: u32,
    /// Failed connection attempts
    pub failures: u32,
    /// Whether the client should reconnect without prompting
    pub auto_reconnect: bool,
    /// Fingerprint the device pinned (TOFU)
    pub pinned_fingerprint: String,
}

impl PairingRecord {
    fn new(device_id: DeviceId, relay_fingerprint: &str, now: DateTime<Utc>) -> Self {
        Self {
            device_id,
            relay_fingerprint: relay_fingerprint.to_string(),
            first_connected_at: now,
            last_connected_at: now,
            successes: 0,
            failures: 0,
            auto_reconnect: true,
            pinned_fingerprint: relay_fingerprint.to_string(),
        }
    }

    /// Fraction of attempts that succeeded; 0.0 with no attempts recorded
    pub fn reliability_score(&self) -> f64 {
        let attempts = self.successes + self.failures;
        if attempts == 0 {
            0.0
        } else {
            f64::from(self.successes) / f64::from(attempts)
        }
    }

    /// Whether the pairing has gone unused past the expiry window
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now - self.last_connected_at > Duration::days(PAIRING_EXPIRY_DAYS)
    }

    /// [`Self::is_expired_at`] against the current time
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

fn key(relay_fingerprint: &str, device_id: &DeviceId) -> String {
    format!("{relay_fingerprint}/{device_id}")
}

/// Durable store of pairing records
///
/// Backed by a single JSON file, rewritten on every mutation. Records are
/// only removed by the explicit [`PairingStore::purge_expired`] sweep, never
/// as a side effect of reads.
pub struct PairingStore {
    path: PathBuf,
    records: Mutex<HashMap<String, PairingRecord>>,
}

impl PairingStore {
    /// Open (or create) the store at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(e.to_string()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Record a successful connection attempt
    ///
    /// Creates the pairing on first success; later successes bump the
    /// counter and refresh `last_connected_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be persisted.
    pub fn record_success(
        &self,
        relay_fingerprint: &str,
        device_id: &DeviceId,
    ) -> Result<PairingRecord, StoreError> {
        let now = Utc::now();
        let mut records = self.records.lock().expect("pairing lock");
        let record = records
            .entry(key(relay_fingerprint, device_id))
            .or_insert_with(|| PairingRecord::new(device_id.clone(), relay_fingerprint, now));
        record.successes += 1;
        record.last_connected_at = now;
        let snapshot = record.clone();
        self.persist(&records)?;
        Ok(snapshot)
    }

    /// Record a failed connection attempt
    ///
    /// A failure against an unknown device creates no pairing; trust begins
    /// with a success.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be persisted.
    pub fn record_failure(
        &self,
        relay_fingerprint: &str,
        device_id: &DeviceId,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("pairing lock");
        if let Some(record) = records.get_mut(&key(relay_fingerprint, device_id)) {
            record.failures += 1;
            self.persist(&records)?;
        }
        Ok(())
    }

    /// Look up one pairing
    pub fn get(&self, relay_fingerprint: &str, device_id: &DeviceId) -> Option<PairingRecord> {
        self.records
            .lock()
            .expect("pairing lock")
            .get(&key(relay_fingerprint, device_id))
            .cloned()
    }

    /// All pairings, in no particular order
    pub fn list(&self) -> Vec<PairingRecord> {
        self.records
            .lock()
            .expect("pairing lock")
            .values()
            .cloned()
            .collect()
    }

    /// Remove expired pairings; returns how many were removed
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be persisted.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut records = self.records.lock().expect("pairing lock");
        let before = records.len();
        records.retain(|_, record| !record.is_expired_at(now));
        let removed = before - records.len();
        if removed > 0 {
            self.persist(&records)?;
            tracing::info!(removed, "purged expired pairings");
        }
        Ok(removed)
    }

    fn persist(&self, records: &HashMap<String, PairingRecord>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(records)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        fs::write(&self.path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const FP: &str = "aabbccdd";

    fn store(dir: &tempfile::TempDir) -> PairingStore {
        PairingStore::open(dir.path().join("pairings.json")).unwrap()
    }

    #[test]
    fn test_first_success_creates_pairing() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let device = DeviceId::mint();

        let record = store.record_success(FP, &device).unwrap();
        assert_eq!(record.successes, 1);
        assert_eq!(record.failures, 0);
        assert!(record.auto_reconnect);
        assert_eq!(record.pinned_fingerprint, FP);
        assert_eq!(record.first_connected_at, record.last_connected_at);
    }

    #[test]
    fn test_reliability_score() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let device = DeviceId::mint();

        store.record_success(FP, &device).unwrap();
        store.record_success(FP, &device).unwrap();
        store.record_success(FP, &device).unwrap();
        store.record_failure(FP, &device).unwrap();

        let record = store.get(FP, &device).unwrap();
        assert_eq!(record.successes, 3);
        assert_eq!(record.failures, 1);
        assert!((record.reliability_score() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reliability_score_zero_with_no_attempts() {
        let record = PairingRecord::new(DeviceId::mint(), FP, Utc::now());
        assert_eq!(record.reliability_score(), 0.0);
    }

    #[test]
    fn test_failure_without_pairing_creates_nothing() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let device = DeviceId::mint();

        store.record_failure(FP, &device).unwrap();
        assert!(store.get(FP, &device).is_none());
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let mut record = PairingRecord::new(DeviceId::mint(), FP, now);

        record.last_connected_at = now - Duration::days(30);
        assert!(!record.is_expired_at(now));

        record.last_connected_at = now - Duration::days(30) - Duration::seconds(1);
        assert!(record.is_expired_at(now));
    }

    #[test]
    fn test_purge_removes_only_expired() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let stale = DeviceId::mint();
        let fresh = DeviceId::mint();

        store.record_success(FP, &stale).unwrap();
        store.record_success(FP, &fresh).unwrap();

        {
            let mut records = store.records.lock().unwrap();
            let entry = records.get_mut(&key(FP, &stale)).unwrap();
            entry.last_connected_at = Utc::now() - Duration::days(45);
        }

        let removed = store.purge_expired().unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(FP, &stale).is_none());
        assert!(store.get(FP, &fresh).is_some());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pairings.json");
        let device = DeviceId::mint();

        {
            let store = PairingStore::open(&path).unwrap();
            store.record_success(FP, &device).unwrap();
            store.record_success(FP, &device).unwrap();
        }

        let reopened = PairingStore::open(&path).unwrap();
        let record = reopened.get(FP, &device).unwrap();
        assert_eq!(record.successes, 2);
    }

    #[test]
    fn test_trust_reset_orphans_old_pairings() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let device = DeviceId::mint();

        store.record_success(FP, &device).unwrap();
        // New relay identity: same device pairs fresh under the new key
        let record = store.record_success("11223344", &device).unwrap();
        assert_eq!(record.successes, 1);
        assert!(store.get(FP, &device).is_some());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pairings.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            PairingStore::open(&path),
            Err(StoreError::Corrupt(_))
        ));
    }
}
