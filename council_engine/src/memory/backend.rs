/*!
Append-only persistence back-ends for the memory store:

* **InMemoryBackend** – in-process vector (dev/testing, no persistence).
* **SledBackend** – embedded `sled` database; records keyed by a monotonic id
  inside the active tree, archival switches the active-tree pointer.
*/
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, instrument};

use super::MemoryRecord;
use crate::error::{CouncilError, Result};

/// Outcome of moving the whole store aside.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReceipt {
    pub label: String,
    pub records: usize,
    pub archived_at: DateTime<Utc>,
}

/// Storage medium for memory records. Appends from one writer are never
/// reordered; `load` returns them in append order.
#[async_trait]
pub trait MemoryBackend: Send + Sync + std::fmt::Debug {
    /// Atomically append one record, returning its sequence number.
    async fn append(&self, record: &MemoryRecord) -> Result<u64>;

    /// All live records in append order.
    async fn load(&self) -> Result<Vec<MemoryRecord>>;

    /// Move every live record aside in one step; the live store becomes empty.
    async fn archive(&self) -> Result<ArchiveReceipt>;

    async fn len(&self) -> Result<usize>;
}

#[derive(Debug, Default)]
struct InMemoryState {
    live: Vec<MemoryRecord>,
    archives: Vec<(String, Vec<MemoryRecord>)>,
    next_seq: u64,
}

/// Simple in-process backend for development and testing
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<InMemoryState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn archive_count(&self) -> usize {
        self.state.lock().archives.len()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn append(&self, record: &MemoryRecord) -> Result<u64> {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.live.push(record.clone());
        Ok(seq)
    }

    async fn load(&self) -> Result<Vec<MemoryRecord>> {
        Ok(self.state.lock().live.clone())
    }

    async fn archive(&self) -> Result<ArchiveReceipt> {
        let mut state = self.state.lock();
        let records = std::mem::take(&mut state.live);
        let label = format!("archive-{}", state.archives.len());
        let receipt = ArchiveReceipt {
            label: label.clone(),
            records: records.len(),
            archived_at: Utc::now(),
        };
        state.archives.push((label, records));
        Ok(receipt)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.state.lock().live.len())
    }
}

const META_TREE: &str = "meta";
const ACTIVE_KEY: &[u8] = b"active_tree";
const FIRST_TREE: &str = "memory-0";

/// Embedded sled database backend.
pub struct SledBackend {
    db: sled::Db,
    meta: sled::Tree,
}

impl std::fmt::Debug for SledBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledBackend")
            .field("active_tree", &self.active_name().ok())
            .finish()
    }
}

impl SledBackend {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::open(path)?;
        let meta = db.open_tree(META_TREE)?;
        info!("Opened sled memory store at {:?}", path);
        Ok(Self { db, meta })
    }

    fn active_name(&self) -> Result<String> {
        Ok(match self.meta.get(ACTIVE_KEY)? {
            Some(raw) => String::from_utf8_lossy(&raw).into_owned(),
            None => FIRST_TREE.to_string(),
        })
    }

    fn active_tree(&self) -> Result<sled::Tree> {
        Ok(self.db.open_tree(self.active_name()?)?)
    }
}

#[async_trait]
impl MemoryBackend for SledBackend {
    #[instrument(skip(self, record))]
    async fn append(&self, record: &MemoryRecord) -> Result<u64> {
        let tree = self.active_tree()?;
        let seq = self.db.generate_id()?;
        let bytes = bincode::serialize(record)?;
        tree.insert(seq.to_be_bytes(), bytes)?;
        tree.flush_async().await?;
        debug!(seq, "memory record persisted");
        Ok(seq)
    }

    async fn load(&self) -> Result<Vec<MemoryRecord>> {
        let tree = self.active_tree()?;
        let mut out = Vec::with_capacity(tree.len());
        for item in tree.iter() {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    async fn archive(&self) -> Result<ArchiveReceipt> {
        let current = self.meta.get(ACTIVE_KEY)?;
        let label = self.active_name()?;
        let records = self.active_tree()?.len();
        let next = format!("memory-{}", self.db.generate_id()?);

        self.meta
            .compare_and_swap(ACTIVE_KEY, current, Some(next.as_bytes()))?
            .map_err(|_| {
                CouncilError::MemoryAppendFailure(
                    "active memory tree changed during archival".to_string(),
                )
            })?;
        self.db.flush_async().await?;

        info!("Archived memory tree {} ({} records), now writing to {}", label, records, next);
        Ok(ArchiveReceipt {
            label,
            records,
            archived_at: Utc::now(),
        })
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.active_tree()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Reflection, Teaching};
    use crate::learning::{OutcomeSignal, SignalSource};
    use uuid::Uuid;

    fn teaching(topic: &str) -> MemoryRecord {
        MemoryRecord::Teaching(Teaching::new(topic, "keep answers short", &[]))
    }

    fn reflection() -> MemoryRecord {
        MemoryRecord::Reflection(Reflection {
            request_id: Uuid::new_v4(),
            signal: OutcomeSignal::Success,
            source: SignalSource::Explicit,
            note: "positive".to_string(),
            created_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_in_memory_backend() {
        let backend = InMemoryBackend::new();
        let first = teaching("email");
        let second = reflection();

        assert_eq!(backend.append(&first).await.unwrap(), 0);
        assert_eq!(backend.append(&second).await.unwrap(), 1);
        assert_eq!(backend.load().await.unwrap(), vec![first, second]);

        let receipt = backend.archive().await.unwrap();
        assert_eq!(receipt.records, 2);
        assert_eq!(backend.len().await.unwrap(), 0);
        assert_eq!(backend.archive_count(), 1);
    }

    #[tokio::test]
    async fn test_sled_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.sled");
        let records: Vec<MemoryRecord> = vec![teaching("email"), reflection(), teaching("rent")];

        {
            let backend = SledBackend::open(&path).unwrap();
            for record in &records {
                backend.append(record).await.unwrap();
            }
        }

        let backend = SledBackend::open(&path).unwrap();
        assert_eq!(backend.load().await.unwrap(), records);
    }

    #[tokio::test]
    async fn test_sled_archive_switches_active_tree() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SledBackend::open(&dir.path().join("memory.sled")).unwrap();
        backend.append(&teaching("email")).await.unwrap();
        backend.append(&teaching("rent")).await.unwrap();

        let receipt = backend.archive().await.unwrap();
        assert_eq!(receipt.label, FIRST_TREE);
        assert_eq!(receipt.records, 2);
        assert_eq!(backend.len().await.unwrap(), 0);

        let record = teaching("poetry");
        backend.append(&record).await.unwrap();
        assert_eq!(backend.load().await.unwrap(), vec![record]);
        // The archived tree is still on disk.
        assert_eq!(backend.db.open_tree(FIRST_TREE).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_backend_concurrent_appends_keep_every_record() {
        let backend = std::sync::Arc::new(InMemoryBackend::new());
        let mut handles = Vec::new();
        for i in 0..10 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend.append(&teaching(&format!("topic{}", i))).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(backend.len().await.unwrap(), 10);
    }
}
