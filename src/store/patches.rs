//! # Durable, crash-safe patch store.
//!
//! One sled [`Tree`](sled::Tree) per task is the durable container; inside
//! it, one entry per patch identity holds the timestamp, the endpoint pair,
//! and the ordered list of individually serialized operations. Writing a
//! patch under an existing identity replaces the previous contents in one
//! atomic insert; patches are only ever wholesale replaced, never appended
//! to.
//!
//! Persistence is asynchronous: [`PatchStore::store`] hands the patch to a
//! dedicated writer task over a bounded channel. [`PatchStore::stop`] closes
//! the channel, lets the writer drain what is already queued, and joins it;
//! writes are per-patch transactions, so nothing is ever left half-written.
//!
//! Reads go through [`PatchReader`], a cheap cloneable handle that is what
//! travels over the bus in the request/response idiom; other execution
//! contexts never hold a pointer to the store itself.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::StoreError;
use crate::store::{Operation, Patch};

/// Queue depth between `store()` callers and the writer task.
const WRITE_QUEUE: usize = 32;

/// Stored representation of one patch.
///
/// Operations are encoded individually so a corrupt operation can be skipped
/// on load without dropping the rest of the patch.
#[derive(Serialize, Deserialize)]
struct StoredPatch {
    /// Completion time, unix millis.
    at: i64,
    source: String,
    target: String,
    ops: Vec<Vec<u8>>,
}

/// Durable append/replace store for one task's patches.
pub struct PatchStore {
    task: String,
    tree: sled::Tree,
    tx: Mutex<Option<mpsc::Sender<Patch>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PatchStore {
    /// Opens (or creates) the task's container inside the shared database
    /// and starts the background writer.
    pub fn open(db: &sled::Db, task: &str) -> Result<Self, StoreError> {
        let tree = db.open_tree(task.as_bytes())?;
        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        let writer = tokio::spawn(writer_loop(task.to_string(), tree.clone(), rx));

        Ok(Self {
            task: task.to_string(),
            tree,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Queues a patch for persistence.
    ///
    /// A patch with zero operations is discarded and never written. After
    /// [`stop`](Self::stop) the patch is dropped with a warning.
    pub async fn store(&self, patch: Patch) {
        if patch.is_empty() {
            debug!(task = %self.task, patch = %patch.id, "discarding empty patch");
            return;
        }

        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => {
                if tx.send(patch).await.is_err() {
                    warn!(task = %self.task, "patch writer is gone; patch dropped");
                }
            }
            None => warn!(task = %self.task, "patch store stopped; patch dropped"),
        }
    }

    /// Cheap read handle safe to send to other execution contexts.
    pub fn reader(&self) -> PatchReader {
        PatchReader {
            task: self.task.clone(),
            tree: self.tree.clone(),
        }
    }

    /// Stops accepting new patches, drains the queue, and joins the writer.
    ///
    /// Idempotent; the second call returns immediately.
    pub async fn stop(&self) {
        let tx = self.tx.lock().take();
        if tx.is_none() {
            return;
        }
        drop(tx); // closes the channel; the writer drains and exits

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if writer.await.is_err() {
                error!(task = %self.task, "patch writer panicked");
            }
        }
    }
}

async fn writer_loop(task: String, tree: sled::Tree, mut rx: mpsc::Receiver<Patch>) {
    while let Some(patch) = rx.recv().await {
        if let Err(e) = persist(&tree, &patch) {
            error!(task = %task, patch = %patch.id, error = %e, "failed to persist patch");
        }
    }
    if let Err(e) = tree.flush() {
        error!(task = %task, error = %e, "final patch container flush failed");
    }
}

/// Writes one patch as a single transaction: the insert replaces any
/// previous value under the same identity atomically.
fn persist(tree: &sled::Tree, patch: &Patch) -> Result<(), StoreError> {
    let ops = patch
        .ops
        .iter()
        .map(bincode::serialize)
        .collect::<Result<Vec<_>, _>>()?;

    let record = StoredPatch {
        at: patch.at.timestamp_millis(),
        source: patch.source.clone(),
        target: patch.target.clone(),
        ops,
    };

    tree.insert(patch.id.as_bytes(), bincode::serialize(&record)?)?;
    tree.flush()?;
    Ok(())
}

/// Read handle to one task's patch container.
///
/// Cloneable and `Send`; this is the "store handle" published over the bus
/// in response to a store request.
#[derive(Debug, Clone)]
pub struct PatchReader {
    task: String,
    tree: sled::Tree,
}

impl PatchReader {
    /// Task identity this reader is bound to.
    pub fn task(&self) -> &str {
        &self.task
    }

    /// Reconstructs all persisted patches bound to the given endpoint pair,
    /// most recent timestamp first.
    ///
    /// An operation that fails to deserialize is skipped rather than
    /// aborting the whole load.
    pub fn load(&self, source: &str, target: &str) -> Result<Vec<Patch>, StoreError> {
        let mut patches = self.load_all()?;
        patches.retain(|p| p.source == source && p.target == target);
        Ok(patches)
    }

    /// Reconstructs every persisted patch in the container, most recent
    /// timestamp first.
    pub fn load_all(&self) -> Result<Vec<Patch>, StoreError> {
        let mut patches = Vec::new();

        for entry in self.tree.iter() {
            let (key, value) = entry?;
            let record: StoredPatch = match bincode::deserialize(&value) {
                Ok(r) => r,
                Err(e) => {
                    warn!(task = %self.task, error = %e, "skipping undecodable patch record");
                    continue;
                }
            };

            let ops: Vec<Operation> = record
                .ops
                .iter()
                .filter_map(|raw| match bincode::deserialize(raw) {
                    Ok(op) => Some(op),
                    Err(e) => {
                        warn!(task = %self.task, error = %e, "skipping undecodable operation");
                        None
                    }
                })
                .collect();

            patches.push(Patch {
                id: String::from_utf8_lossy(&key).into_owned(),
                task: self.task.clone(),
                source: record.source,
                target: record.target,
                at: DateTime::<Utc>::from_timestamp_millis(record.at).unwrap_or_else(Utc::now),
                ops,
            });
        }

        patches.sort_by(|a, b| b.at.cmp(&a.at));
        Ok(patches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OpKind;
    use chrono::TimeZone;

    fn open_store(dir: &std::path::Path, task: &str) -> (sled::Db, PatchStore) {
        let db = sled::open(dir.join("patches")).unwrap();
        let store = PatchStore::open(&db, task).unwrap();
        (db, store)
    }

    fn patch(id: &str, at_millis: i64, ops: Vec<Operation>) -> Patch {
        Patch {
            id: id.to_string(),
            task: "t".to_string(),
            source: "file:///left".to_string(),
            target: "file:///right".to_string(),
            at: Utc.timestamp_millis_opt(at_millis).unwrap(),
            ops,
        }
    }

    fn create_op(path: &str) -> Operation {
        Operation::new(OpKind::Create, path)
    }

    #[tokio::test]
    async fn empty_patch_is_never_written() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, store) = open_store(dir.path(), "t");

        store.store(patch("noop", 1_000, vec![])).await;
        store.stop().await;

        let loaded = store.reader().load("file:///left", "file:///right").unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn same_identity_replaces_not_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, store) = open_store(dir.path(), "t");

        store
            .store(patch("p1", 1_000, vec![create_op("a.txt"), create_op("b.txt")]))
            .await;
        store.store(patch("p1", 2_000, vec![create_op("c.txt")])).await;
        store.stop().await;

        let loaded = store.reader().load("file:///left", "file:///right").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "p1");
        assert_eq!(loaded[0].ops.len(), 1);
        assert_eq!(loaded[0].ops[0].path, "c.txt");
    }

    #[tokio::test]
    async fn load_orders_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, store) = open_store(dir.path(), "t");

        // Insertion order deliberately differs from timestamp order.
        store.store(patch("mid", 2_000, vec![create_op("m")])).await;
        store.store(patch("old", 1_000, vec![create_op("o")])).await;
        store.store(patch("new", 3_000, vec![create_op("n")])).await;
        store.stop().await;

        let loaded = store.reader().load("file:///left", "file:///right").unwrap();
        let ids: Vec<&str> = loaded.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn load_filters_by_endpoint_pair() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, store) = open_store(dir.path(), "t");

        let mut other = patch("other", 1_000, vec![create_op("x")]);
        other.source = "file:///elsewhere".to_string();
        store.store(other).await;
        store.store(patch("mine", 2_000, vec![create_op("y")])).await;
        store.stop().await;

        let reader = store.reader();
        let loaded = reader.load("file:///left", "file:///right").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "mine");
        assert_eq!(reader.load_all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn corrupt_operation_is_skipped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let (db, store) = open_store(dir.path(), "t");
        store.stop().await;

        // Hand-craft a record with one good op and one byte-garbage op.
        let good = bincode::serialize(&create_op("ok.txt")).unwrap();
        let record = StoredPatch {
            at: 1_000,
            source: "file:///left".to_string(),
            target: "file:///right".to_string(),
            ops: vec![good, vec![0xff, 0xff, 0xff]],
        };
        let tree = db.open_tree(b"t").unwrap();
        tree.insert(b"p1", bincode::serialize(&record).unwrap()).unwrap();

        let loaded = store.reader().load("file:///left", "file:///right").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].ops.len(), 1);
        assert_eq!(loaded[0].ops[0].path, "ok.txt");
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, store) = open_store(dir.path(), "t");

        store.store(patch("p1", 1_000, vec![create_op("a")])).await;
        store.stop().await;
        store.stop().await;

        let loaded = store.reader().load_all().unwrap();
        assert_eq!(loaded.len(), 1);
    }
}
