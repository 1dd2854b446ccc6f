//! Live snapshot subscriptions.
//!
//! A subscription re-runs its query whenever a committed batch touches the
//! queried collection and publishes the whole result set. Each subscription
//! keeps only its newest snapshot, so a slow consumer skips intermediate
//! states instead of queueing them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::retry::RetryPolicy;
use crate::store::{Document, Query, RecordStore, StoreError};

pub type Snapshot<T> = Arc<Vec<T>>;

type Decoder<T> = fn(&[Document]) -> Result<Vec<T>, StoreError>;

/// Handle to a live query.
///
/// Dropping the handle cancels the subscription.
pub struct Subscription<T> {
    rx: watch::Receiver<Option<Snapshot<T>>>,
    task: AbortHandle,
    cancelled: AtomicBool,
}

impl<T> Subscription<T> {
    /// Waits for the next snapshot. Returns `None` once cancelled.
    pub async fn next(&mut self) -> Option<Snapshot<T>> {
        loop {
            if self.is_cancelled() {
                return None;
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
            if self.is_cancelled() {
                return None;
            }
            if let Some(snapshot) = self.rx.borrow_and_update().clone() {
                return Some(snapshot);
            }
        }
    }

    /// Last delivered snapshot, kept while the feed is being re-established.
    pub fn latest(&self) -> Option<Snapshot<T>> {
        self.rx.borrow().clone()
    }

    /// Stops deliveries. Safe to call more than once.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!("subscription cancelled");
        }
        self.task.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct RealtimeSyncBroker {
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
}

impl RealtimeSyncBroker {
    pub fn new(store: Arc<dyn RecordStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Subscribes to raw documents.
    pub fn subscribe(&self, query: Query) -> Subscription<Document> {
        self.spawn(query, |docs| Ok(docs.to_vec()))
    }

    /// Subscribes to documents decoded into `T`.
    pub fn subscribe_as<T>(&self, query: Query) -> Subscription<T>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.spawn(query, |docs| docs.iter().map(Document::decode).collect())
    }

    fn spawn<T>(&self, query: Query, decode: Decoder<T>) -> Subscription<T>
    where
        T: Send + Sync + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let handle = tokio::spawn(run_subscription(
            self.store.clone(),
            query,
            self.retry.clone(),
            decode,
            tx,
        ));
        Subscription {
            rx,
            task: handle.abort_handle(),
            cancelled: AtomicBool::new(false),
        }
    }
}

async fn run_subscription<T>(
    store: Arc<dyn RecordStore>,
    query: Query,
    retry: RetryPolicy,
    decode: Decoder<T>,
    tx: watch::Sender<Option<Snapshot<T>>>,
) where
    T: Send + Sync + 'static,
{
    // Subscribe before the first read so no commit falls between the two.
    let mut changes = store.changes();
    let mut last: Option<Vec<Document>> = None;
    let mut failures: u32 = 0;

    loop {
        match store.query(&query).await {
            Ok(documents) => {
                if failures > 0 {
                    debug!(collection = %query.collection, "subscription re-established");
                }
                failures = 0;
                if last.as_ref() != Some(&documents) {
                    match decode(&documents) {
                        Ok(items) => {
                            if tx.send(Some(Arc::new(items))).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(collection = %query.collection, error = %err, "dropping undecodable snapshot");
                        }
                    }
                    last = Some(documents);
                }
            }
            Err(err) => {
                failures += 1;
                let delay = retry.backoff(failures);
                if failures >= retry.max_attempts {
                    error!(collection = %query.collection, failures, error = %err, "subscription refresh keeps failing");
                } else {
                    warn!(collection = %query.collection, failures, error = %err, "subscription refresh failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = tx.closed() => return,
                }
                continue;
            }
        }

        loop {
            let received = tokio::select! {
                received = changes.recv() => received,
                _ = tx.closed() => return,
            };
            match received {
                Ok(set) if set.affects(query.collection) => break,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "change feed lagged, refreshing");
                    break;
                }
                Err(RecvError::Closed) => {
                    failures += 1;
                    warn!(collection = %query.collection, "change feed closed, resubscribing");
                    tokio::time::sleep(retry.backoff(failures)).await;
                    changes = store.changes();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::{encode, Collection, Direction, WriteBatch, WriteOp};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        section: String,
        rank: u32,
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            multiplier: 2.0,
        }
    }

    async fn put(store: &MemoryStore, collection: Collection, id: &str, section: &str, rank: u32) {
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::Put {
            collection,
            id: id.to_string(),
            body: encode(&Row {
                section: section.to_string(),
                rank,
            })
            .unwrap(),
        });
        store.commit(batch).await.unwrap();
    }

    fn section_query(section: &str) -> Query {
        Query::new(Collection::Attendance)
            .eq("section", section)
            .order_by("rank", Direction::Asc)
    }

    async fn next_within<T>(sub: &mut Subscription<T>) -> Option<Snapshot<T>> {
        tokio::time::timeout(Duration::from_millis(500), sub.next())
            .await
            .ok()
            .flatten()
    }

    async fn quiet<T>(sub: &mut Subscription<T>) -> bool {
        tokio::time::timeout(Duration::from_millis(60), sub.next())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn delivers_full_ordered_snapshot_after_each_write() {
        let store = Arc::new(MemoryStore::default());
        put(&store, Collection::Attendance, "a", "S1", 2).await;
        let broker = RealtimeSyncBroker::new(store.clone(), fast_retry());
        let mut sub = broker.subscribe_as::<Row>(section_query("S1"));

        let initial = next_within(&mut sub).await.unwrap();
        assert_eq!(initial.len(), 1);

        put(&store, Collection::Attendance, "b", "S1", 1).await;
        let snapshot = next_within(&mut sub).await.unwrap();
        let ranks: Vec<u32> = snapshot.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![1, 2]);

        put(&store, Collection::Attendance, "c", "S1", 3).await;
        let snapshot = next_within(&mut sub).await.unwrap();
        let ranks: Vec<u32> = snapshot.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn unrelated_writes_do_not_redeliver() {
        let store = Arc::new(MemoryStore::default());
        let broker = RealtimeSyncBroker::new(store.clone(), fast_retry());
        let mut sub = broker.subscribe_as::<Row>(section_query("S1"));
        assert!(next_within(&mut sub).await.unwrap().is_empty());

        put(&store, Collection::Results, "x", "S1", 1).await;
        put(&store, Collection::Attendance, "y", "S2", 1).await;
        assert!(quiet(&mut sub).await);
    }

    #[tokio::test]
    async fn cancel_stops_deliveries_and_is_idempotent() {
        let store = Arc::new(MemoryStore::default());
        let broker = RealtimeSyncBroker::new(store.clone(), fast_retry());
        let mut sub = broker.subscribe(section_query("S1"));
        next_within(&mut sub).await.unwrap();

        sub.cancel();
        sub.cancel();
        assert!(sub.is_cancelled());
        put(&store, Collection::Attendance, "a", "S1", 1).await;
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn keeps_last_snapshot_while_store_is_unavailable() {
        let store = Arc::new(MemoryStore::default());
        put(&store, Collection::Attendance, "a", "S1", 1).await;
        let broker = RealtimeSyncBroker::new(store.clone(), fast_retry());
        let mut sub = broker.subscribe_as::<Row>(section_query("S1"));
        assert_eq!(next_within(&mut sub).await.unwrap().len(), 1);

        store.fail_next_queries(2);
        put(&store, Collection::Attendance, "b", "S1", 2).await;
        assert_eq!(sub.latest().unwrap().len(), 1);

        let recovered = next_within(&mut sub).await.unwrap();
        assert_eq!(recovered.len(), 2);
    }

    #[tokio::test]
    async fn independent_subscriptions_fan_out() {
        let store = Arc::new(MemoryStore::default());
        let broker = RealtimeSyncBroker::new(store.clone(), fast_retry());
        let mut first = broker.subscribe(section_query("S1"));
        let mut second = broker.subscribe(section_query("S1"));
        next_within(&mut first).await.unwrap();
        next_within(&mut second).await.unwrap();

        put(&store, Collection::Attendance, "a", "S1", 1).await;
        assert_eq!(next_within(&mut first).await.unwrap().len(), 1);
        assert_eq!(next_within(&mut second).await.unwrap().len(), 1);

        first.cancel();
        put(&store, Collection::Attendance, "b", "S1", 2).await;
        assert_eq!(next_within(&mut second).await.unwrap().len(), 2);
        assert!(first.next().await.is_none());
    }

    #[tokio::test]
    async fn raw_subscription_carries_revisions() {
        let store = Arc::new(MemoryStore::default());
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::Create {
            collection: Collection::Attendance,
            id: "a".to_string(),
            body: json!({ "section": "S1", "rank": 1 }),
        });
        store.commit(batch).await.unwrap();

        let broker = RealtimeSyncBroker::new(store.clone(), fast_retry());
        let mut sub = broker.subscribe(section_query("S1"));
        let snapshot = next_within(&mut sub).await.unwrap();
        assert_eq!(snapshot[0].revision, 1);
    }
}
