use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::store::{
    ChangeSet, Collection, Document, Query, RecordStore, StoreError, WriteBatch, WriteOp,
};

type Table = BTreeMap<String, Document>;

/// In-process `RecordStore`.
///
/// A batch is applied to a staged copy of the touched collections and only
/// swapped in once every op succeeded, so readers never see half a batch.
pub struct MemoryStore {
    tables: Mutex<HashMap<Collection, Table>>,
    changes: broadcast::Sender<ChangeSet>,
    failing_commits: AtomicUsize,
    failing_queries: AtomicUsize,
    lost_acks: AtomicUsize,
}

impl MemoryStore {
    pub fn new(change_feed_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_feed_capacity.max(1));
        Self {
            tables: Mutex::new(HashMap::new()),
            changes,
            failing_commits: AtomicUsize::new(0),
            failing_queries: AtomicUsize::new(0),
            lost_acks: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` commits fail with `StoreError::Unavailable`.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` queries fail with `StoreError::Unavailable`.
    pub fn fail_next_queries(&self, count: usize) {
        self.failing_queries.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` commits apply and then report
    /// `StoreError::Unavailable`, as when a connection drops after commit.
    pub fn lose_next_acks(&self, count: usize) {
        self.lost_acks.store(count, Ordering::SeqCst);
    }

    /// Number of documents currently stored in `collection`.
    pub fn len(&self, collection: Collection) -> usize {
        self.lock()
            .map(|tables| tables.get(&collection).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Collection, Table>>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn take_injected_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(256)
    }
}

fn apply(table: &mut Table, op: WriteOp) -> Result<(), StoreError> {
    match op {
        WriteOp::Create {
            collection,
            id,
            body,
        } => {
            if table.contains_key(&id) {
                return Err(StoreError::AlreadyExists { collection, id });
            }
            table.insert(id.clone(), Document { id, revision: 1, body });
        }
        WriteOp::Put { id, body, .. } => {
            let revision = table.get(&id).map_or(1, |doc| doc.revision + 1);
            table.insert(id.clone(), Document { id, revision, body });
        }
        WriteOp::Replace {
            collection,
            id,
            body,
            expected_revision,
        } => {
            let current = table.get_mut(&id).ok_or_else(|| StoreError::NotFound {
                collection,
                id: id.clone(),
            })?;
            if let Some(expected) = expected_revision {
                if current.revision != expected {
                    return Err(StoreError::Conflict {
                        collection,
                        id,
                        expected,
                        found: current.revision,
                    });
                }
            }
            current.body = body;
            current.revision += 1;
        }
        WriteOp::Patch {
            collection,
            id,
            fields,
        } => {
            let current = table
                .get_mut(&id)
                .ok_or(StoreError::NotFound { collection, id })?;
            if let Value::Object(map) = &mut current.body {
                map.extend(fields);
            }
            current.revision += 1;
        }
        WriteOp::AddToSet {
            collection,
            id,
            field,
            value,
        } => {
            let current = table
                .get_mut(&id)
                .ok_or(StoreError::NotFound { collection, id })?;
            if let Value::Object(map) = &mut current.body {
                let entry = map
                    .entry(field)
                    .or_insert_with(|| Value::Array(Vec::new()));
                if !entry.is_array() {
                    *entry = Value::Array(Vec::new());
                }
                if let Value::Array(items) = entry {
                    if !items.contains(&value) {
                        items.push(value);
                    }
                }
            }
            current.revision += 1;
        }
        WriteOp::Delete { collection, id } => {
            if table.remove(&id).is_none() {
                return Err(StoreError::NotFound { collection, id });
            }
        }
    }
    Ok(())
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        let tables = self.lock()?;
        Ok(tables.get(&collection).and_then(|t| t.get(id)).cloned())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        if Self::take_injected_failure(&self.failing_queries) {
            return Err(StoreError::Unavailable("injected query failure".to_string()));
        }
        let mut documents: Vec<Document> = {
            let tables = self.lock()?;
            tables
                .get(&query.collection)
                .map(|table| {
                    table
                        .values()
                        .filter(|doc| query.matches(&doc.body))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        query.sort(&mut documents);
        if let Some(limit) = query.limit {
            documents.truncate(limit);
        }
        Ok(documents)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        if Self::take_injected_failure(&self.failing_commits) {
            return Err(StoreError::Unavailable(
                "injected commit failure".to_string(),
            ));
        }

        let change_sets = batch.change_sets();
        {
            let mut tables = self.lock()?;
            let mut staged: HashMap<Collection, Table> = HashMap::new();
            for op in batch.ops {
                let collection = op.collection();
                let table = staged.entry(collection).or_insert_with(|| {
                    tables.get(&collection).cloned().unwrap_or_default()
                });
                apply(table, op)?;
            }
            tables.extend(staged);
        }

        for set in change_sets {
            debug!(collection = ?set.collection, count = set.ids.len(), "publishing change set");
            // No receivers is fine: nobody is watching.
            let _ = self.changes.send(set);
        }
        if Self::take_injected_failure(&self.lost_acks) {
            return Err(StoreError::Unavailable(
                "injected lost acknowledgement".to_string(),
            ));
        }
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<ChangeSet> {
        self.changes.subscribe()
    }
}
