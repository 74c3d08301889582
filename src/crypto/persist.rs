//! Durable packet-id high-water mark.
//!
//! A small bincode record written at most once per flush interval and at
//! session end, then read back at the next start so the static-key
//! context never reuses or re-accepts an id.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::PersistError;

/// On-disk record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedPacketId {
    /// Unix seconds when the record was produced.
    pub time: u64,
    /// Last id issued by the send side.
    pub issued: u64,
    /// Highest id accepted by the receive side.
    pub seen: u64,
}

/// File-backed store for the packet-id record.
#[derive(Debug)]
pub struct PacketIdStore {
    path: PathBuf,
    loaded: Option<PersistedPacketId>,
    current: PersistedPacketId,
    written: Option<PersistedPacketId>,
    last_flush: Option<Instant>,
}

impl PacketIdStore {
    /// Open the store, loading an existing record if present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref().to_path_buf();
        let loaded = match fs::read(&path) {
            Ok(bytes) => {
                let record: PersistedPacketId = bincode::deserialize(&bytes)
                    .map_err(|e| PersistError::Decode(e.to_string()))?;
                info!(
                    path = %path.display(),
                    issued = record.issued,
                    seen = record.seen,
                    "loaded persisted packet id"
                );
                Some(record)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            current: loaded.unwrap_or_default(),
            written: loaded,
            loaded,
            last_flush: None,
        })
    }

    /// Record found at open time.
    pub fn loaded(&self) -> Option<PersistedPacketId> {
        self.loaded
    }

    /// Latest in-memory state.
    pub fn current(&self) -> PersistedPacketId {
        self.current
    }

    /// Update the in-memory high-water mark. Values never move backwards.
    pub fn update(&mut self, issued: u64, seen: u64) {
        self.current.issued = self.current.issued.max(issued);
        self.current.seen = self.current.seen.max(seen);
    }

    /// Write if `interval` has passed since the last flush and state changed.
    pub fn flush_if_due(&mut self, now: Instant, interval: Duration) -> Result<bool, PersistError> {
        let due = match self.last_flush {
            Some(last) => now.saturating_duration_since(last) >= interval,
            None => true,
        };
        if !due {
            return Ok(false);
        }
        self.last_flush = Some(now);
        self.save()
    }

    /// Write now if state changed since the last write.
    pub fn save(&mut self) -> Result<bool, PersistError> {
        if self
            .written
            .is_some_and(|w| w.issued == self.current.issued && w.seen == self.current.seen)
        {
            return Ok(false);
        }
        let mut record = self.current;
        record.time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let bytes = bincode::serialize(&record).map_err(|e| PersistError::Decode(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;

        debug!(issued = record.issued, seen = record.seen, "packet id persisted");
        self.written = Some(record);
        Ok(true)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PacketIdStore::open(dir.path().join("pid")).unwrap();
        assert_eq!(store.loaded(), None);
        assert_eq!(store.current(), PersistedPacketId::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pid");

        let mut store = PacketIdStore::open(&path).unwrap();
        store.update(42, 17);
        assert!(store.save().unwrap());
        // Unchanged state is not rewritten
        assert!(!store.save().unwrap());

        let reopened = PacketIdStore::open(&path).unwrap();
        let record = reopened.loaded().unwrap();
        assert_eq!((record.issued, record.seen), (42, 17));
        assert!(record.time > 0);
    }

    #[test]
    fn test_update_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PacketIdStore::open(dir.path().join("pid")).unwrap();
        store.update(10, 10);
        store.update(5, 20);
        assert_eq!((store.current().issued, store.current().seen), (10, 20));
    }

    #[test]
    fn test_flush_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PacketIdStore::open(dir.path().join("pid")).unwrap();
        let start = Instant::now();
        let interval = Duration::from_secs(60);

        store.update(1, 1);
        assert!(store.flush_if_due(start, interval).unwrap());

        store.update(2, 2);
        assert!(!store.flush_if_due(start + Duration::from_secs(30), interval).unwrap());
        assert!(store.flush_if_due(start + Duration::from_secs(60), interval).unwrap());
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pid");
        fs::write(&path, b"xx").unwrap();
        assert!(matches!(PacketIdStore::open(&path), Err(PersistError::Decode(_))));
    }
}
