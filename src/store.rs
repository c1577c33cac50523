//! Durable lease storage.
//!
//! The engine writes through a [`LeaseStore`] before it touches any
//! in-memory state, so a failed write leaves the engine exactly as it was.
//!
//! [`JournalStore`] is an append-only JSON-lines file: every committed change
//! appends one [`StoreRecord`], and [`LeaseStore::load`] replays the journal to
//! rebuild the table. [`JournalStore::compact`] rewrites the file with one
//! `put` per live record.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lease::{ClientId, Lease};

/// Durable backing for the lease tables of every subnet.
pub trait LeaseStore: Send + Sync + 'static {
    /// Returns every persisted lease.
    fn load(&self) -> impl Future<Output = Result<Vec<Lease>>> + Send;

    /// Inserts or replaces the record for `(lease.subnet, lease.client_id)`.
    fn put(&self, lease: &Lease) -> impl Future<Output = Result<()>> + Send;

    /// Deletes the record for `(subnet, client_id)`. Missing records are fine.
    fn remove(&self, subnet: Ipv4Addr, client_id: &ClientId)
    -> impl Future<Output = Result<()>> + Send;
}

/// One line of the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreRecord {
    Put { lease: Lease },
    Remove { subnet: Ipv4Addr, client_id: ClientId },
}

type RecordKey = (Ipv4Addr, ClientId);

fn replay(records: impl IntoIterator<Item = StoreRecord>) -> BTreeMap<RecordKey, Lease> {
    let mut leases = BTreeMap::new();
    for record in records {
        match record {
            StoreRecord::Put { lease } => {
                leases.insert((lease.subnet, lease.client_id.clone()), lease);
            }
            StoreRecord::Remove { subnet, client_id } => {
                leases.remove(&(subnet, client_id));
            }
        }
    }
    leases
}

fn store_error(context: &str, path: &Path, error: impl std::fmt::Display) -> Error {
    Error::StoreUnavailable(format!("{context} {}: {error}", path.display()))
}

/// Append-only JSON-lines lease journal.
#[derive(Debug)]
pub struct JournalStore {
    path: PathBuf,
    /// Serializes appends and compaction.
    write_lock: Mutex<()>,
}

impl JournalStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_records(&self) -> Result<Vec<StoreRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(store_error("failed to read", &self.path, error)),
        };

        let mut records = Vec::new();
        let lines: Vec<&str> = content.lines().collect();
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoreRecord>(line) {
                Ok(record) => records.push(record),
                // A torn final line is what a crash mid-append leaves behind.
                Err(error) if index + 1 == lines.len() => {
                    warn!(
                        "Ignoring truncated last record in {}: {}",
                        self.path.display(),
                        error
                    );
                }
                Err(error) => {
                    return Err(store_error(
                        &format!("corrupt record on line {} of", index + 1),
                        &self.path,
                        error,
                    ));
                }
            }
        }
        Ok(records)
    }

    async fn append(&self, record: &StoreRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _lock = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|error| store_error("failed to open", &self.path, error))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|error| store_error("failed to append to", &self.path, error))?;
        file.sync_data()
            .await
            .map_err(|error| store_error("failed to sync", &self.path, error))?;
        Ok(())
    }

    /// Rewrites the journal as one `put` per live record.
    ///
    /// The new journal is written to a sibling file and renamed over the old
    /// one, so a crash leaves either the old or the new journal intact.
    pub async fn compact(&self) -> Result<usize> {
        let _lock = self.write_lock.lock().await;
        let leases = replay(self.read_records().await?);

        let mut content = String::new();
        for lease in leases.values() {
            content.push_str(&serde_json::to_string(&StoreRecord::Put {
                lease: lease.clone(),
            })?);
            content.push('\n');
        }

        let temp_path = self.path.with_extension("compact");
        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|error| store_error("failed to write", &temp_path, error))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|error| store_error("failed to replace", &self.path, error))?;

        debug!(
            "Compacted {} to {} record(s)",
            self.path.display(),
            leases.len()
        );
        Ok(leases.len())
    }
}

impl LeaseStore for JournalStore {
    async fn load(&self) -> Result<Vec<Lease>> {
        Ok(replay(self.read_records().await?).into_values().collect())
    }

    async fn put(&self, lease: &Lease) -> Result<()> {
        self.append(&StoreRecord::Put {
            lease: lease.clone(),
        })
        .await
    }

    async fn remove(&self, subnet: Ipv4Addr, client_id: &ClientId) -> Result<()> {
        self.append(&StoreRecord::Remove {
            subnet,
            client_id: client_id.clone(),
        })
        .await
    }
}

/// In-memory store. Can be switched into a failing mode to exercise the
/// no-partial-commit path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    leases: StdMutex<BTreeMap<RecordKey, Lease>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with [`Error::StoreUnavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    pub fn get(&self, subnet: Ipv4Addr, client_id: &ClientId) -> Option<Lease> {
        self.records().get(&(subnet, client_id.clone())).cloned()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<RecordKey, Lease>> {
        self.leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(
                "memory store is in failing mode".to_string(),
            ));
        }
        Ok(())
    }
}

impl LeaseStore for MemoryStore {
    async fn load(&self) -> Result<Vec<Lease>> {
        self.check_available()?;
        Ok(self.records().values().cloned().collect())
    }

    async fn put(&self, lease: &Lease) -> Result<()> {
        self.check_available()?;
        self.records()
            .insert((lease.subnet, lease.client_id.clone()), lease.clone());
        Ok(())
    }

    async fn remove(&self, subnet: Ipv4Addr, client_id: &ClientId) -> Result<()> {
        self.check_available()?;
        self.records().remove(&(subnet, client_id.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::state::LeaseEvent;

    fn bound_lease(last_octet: u8) -> Lease {
        let now = Utc::now();
        let mut lease = Lease::offered(
            Ipv4Addr::new(192, 168, 1, 0),
            ClientId::from_hardware(1, &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, last_octet]),
            Ipv4Addr::new(192, 168, 1, last_octet),
            3600,
            7,
            now,
            60,
        );
        lease.acknowledge(now, 3600, 7).unwrap();
        lease
    }

    #[tokio::test]
    async fn test_journal_replay() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new(dir.path().join("leases.jsonl"));
        assert!(store.load().await.unwrap().is_empty());

        let first = bound_lease(100);
        let mut second = bound_lease(101);
        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        second.apply(LeaseEvent::Release, Utc::now()).unwrap();
        store.put(&second).await.unwrap();
        store.remove(first.subnet, &first.client_id).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, vec![second]);
    }

    #[tokio::test]
    async fn test_journal_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.jsonl");
        let store = JournalStore::new(&path);

        let lease = bound_lease(100);
        for _ in 0..5 {
            store.put(&lease).await.unwrap();
        }
        store.put(&bound_lease(101)).await.unwrap();
        store
            .remove(lease.subnet, &bound_lease(101).client_id)
            .await
            .unwrap();

        assert_eq!(store.compact().await.unwrap(), 1);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert_eq!(store.load().await.unwrap(), vec![lease]);
    }

    #[tokio::test]
    async fn test_journal_tolerates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.jsonl");
        let store = JournalStore::new(&path);
        let lease = bound_lease(100);
        store.put(&lease).await.unwrap();

        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"op\":\"put\",\"lea");
        std::fs::write(&path, content).unwrap();

        assert_eq!(store.load().await.unwrap(), vec![lease]);
    }

    #[tokio::test]
    async fn test_journal_rejects_corrupt_middle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.jsonl");
        std::fs::write(&path, "garbage\n{\"op\":\"remove\",\"subnet\":\"10.0.0.0\",\"client_id\":\"01\"}\n")
            .unwrap();

        let store = JournalStore::new(&path);
        assert!(matches!(
            store.load().await,
            Err(Error::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_failing_mode() {
        let store = MemoryStore::new();
        let lease = bound_lease(100);
        store.put(&lease).await.unwrap();
        assert_eq!(store.len(), 1);

        store.set_failing(true);
        assert!(matches!(
            store.put(&bound_lease(101)).await,
            Err(Error::StoreUnavailable(_))
        ));
        assert_eq!(store.len(), 1);

        store.set_failing(false);
        store.remove(lease.subnet, &lease.client_id).await.unwrap();
        assert!(store.is_empty());
    }
}
