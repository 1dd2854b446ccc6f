use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// Named document collections backing the records core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Attendance,
    AttendanceSessions,
    Results,
    Notifications,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Attendance => "attendance",
            Collection::AttendanceSessions => "attendance_sessions",
            Collection::Results => "results",
            Collection::Notifications => "notifications",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("document {collection}/{id} not found")]
    NotFound { collection: Collection, id: String },

    #[error("document {collection}/{id} already exists")]
    AlreadyExists { collection: Collection, id: String },

    #[error("revision conflict on {collection}/{id}: expected {expected}, found {found}")]
    Conflict {
        collection: Collection,
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Errors after which repeating the same batch can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// A stored document. `revision` starts at 1 and increments on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub revision: u64,
    pub body: Value,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }
}

/// Serializes an entity into a document body.
pub fn encode<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    let body = serde_json::to_value(value)?;
    if !body.is_object() {
        return Err(StoreError::Serialization(
            "documents must serialize to a JSON object".to_string(),
        ));
    }
    Ok(body)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOp {
    pub fn sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn matches(&self, body: &Value) -> bool {
        let Some(actual) = body.get(&self.field) else {
            return false;
        };
        match compare_values(actual, &self.value) {
            Some(ordering) => match self.op {
                FilterOp::Eq => ordering == Ordering::Equal,
                FilterOp::Gt => ordering == Ordering::Greater,
                FilterOp::Gte => ordering != Ordering::Less,
                FilterOp::Lt => ordering == Ordering::Less,
                FilterOp::Lte => ordering != Ordering::Greater,
            },
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Equality/range query over one collection.
///
/// Results are ordered by `order` and then by document id, so two runs over
/// unchanged data always return the same sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: Collection,
    pub filters: Vec<Filter>,
    pub order: Vec<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    fn filter(mut self, field: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn gt(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Gt, value)
    }

    pub fn gte(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Gte, value)
    }

    pub fn lt(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Lt, value)
    }

    pub fn lte(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Lte, value)
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order.push(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, body: &Value) -> bool {
        self.filters.iter().all(|filter| filter.matches(body))
    }

    /// Sorts documents in place by the declared order, then by id.
    pub fn sort(&self, documents: &mut [Document]) {
        documents.sort_by(|a, b| {
            for order in &self.order {
                let left = a.field(&order.field).unwrap_or(&Value::Null);
                let right = b.field(&order.field).unwrap_or(&Value::Null);
                let ordering = compare_for_sort(left, right);
                let ordering = match order.direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.id.cmp(&b.id)
        });
    }
}

/// Compares two JSON scalars of the same kind. Mixed kinds are incomparable.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

// Nulls and missing fields sort first, like an ascending index would.
fn compare_for_sort(left: &Value, right: &Value) -> Ordering {
    match (left.is_null(), right.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => compare_values(left, right).unwrap_or(Ordering::Equal),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert; fails with `AlreadyExists` when the id is taken.
    Create {
        collection: Collection,
        id: String,
        body: Value,
    },
    /// Insert or overwrite.
    Put {
        collection: Collection,
        id: String,
        body: Value,
    },
    /// Overwrite an existing document, optionally guarded by its revision.
    Replace {
        collection: Collection,
        id: String,
        body: Value,
        expected_revision: Option<u64>,
    },
    /// Shallow merge of the given fields into an existing document.
    Patch {
        collection: Collection,
        id: String,
        fields: serde_json::Map<String, Value>,
    },
    /// Adds `value` to the array `field` unless already present.
    AddToSet {
        collection: Collection,
        id: String,
        field: String,
        value: Value,
    },
    Delete {
        collection: Collection,
        id: String,
    },
}

impl WriteOp {
    pub fn collection(&self) -> Collection {
        match self {
            WriteOp::Create { collection, .. }
            | WriteOp::Put { collection, .. }
            | WriteOp::Replace { collection, .. }
            | WriteOp::Patch { collection, .. }
            | WriteOp::AddToSet { collection, .. }
            | WriteOp::Delete { collection, .. } => *collection,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            WriteOp::Create { id, .. }
            | WriteOp::Put { id, .. }
            | WriteOp::Replace { id, .. }
            | WriteOp::Patch { id, .. }
            | WriteOp::AddToSet { id, .. }
            | WriteOp::Delete { id, .. } => id,
        }
    }
}

/// A set of writes committed all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Groups touched ids per collection, in first-touched order.
    pub fn change_sets(&self) -> Vec<ChangeSet> {
        let mut sets: Vec<ChangeSet> = Vec::new();
        for op in &self.ops {
            let collection = op.collection();
            let id = op.id().to_string();
            match sets
                .iter_mut()
                .find(|set| set.collection == Some(collection))
            {
                Some(set) => {
                    if !set.ids.contains(&id) {
                        set.ids.push(id);
                    }
                }
                None => sets.push(ChangeSet {
                    collection: Some(collection),
                    ids: vec![id],
                }),
            }
        }
        sets
    }
}

/// Notification that a committed batch touched documents.
///
/// `collection == None` is a resync: anything may have changed, typically
/// because the change feed was interrupted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub collection: Option<Collection>,
    pub ids: Vec<String>,
}

impl ChangeSet {
    pub fn resync() -> Self {
        Self {
            collection: None,
            ids: Vec::new(),
        }
    }

    pub fn affects(&self, collection: Collection) -> bool {
        self.collection.map_or(true, |c| c == collection)
    }
}

/// Document-oriented persistence with atomic batches and change feeds.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Applies every op of `batch` or none of them.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Subscribes to change sets of batches committed after this call.
    fn changes(&self) -> broadcast::Receiver<ChangeSet>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, body: Value) -> Document {
        Document {
            id: id.to_string(),
            revision: 1,
            body,
        }
    }

    #[test]
    fn range_filters_compare_numbers_numerically() {
        let query = Query::new(Collection::Attendance)
            .gte("date", 100)
            .lte("date", 1_000);
        assert!(query.matches(&json!({ "date": 999 })));
        assert!(query.matches(&json!({ "date": 100 })));
        assert!(!query.matches(&json!({ "date": 1_001 })));
        assert!(!query.matches(&json!({ "date": "500" })));
        assert!(!query.matches(&json!({})));
    }

    #[test]
    fn sort_applies_each_key_then_id() {
        let query = Query::new(Collection::Attendance)
            .order_by("period", Direction::Asc)
            .order_by("registerNo", Direction::Desc);
        let mut docs = vec![
            doc("c", json!({ "period": 2, "registerNo": "100000001" })),
            doc("b", json!({ "period": 1, "registerNo": "100000001" })),
            doc("a", json!({ "period": 1, "registerNo": "100000002" })),
            doc("d", json!({ "period": 1, "registerNo": "100000002" })),
        ];
        query.sort(&mut docs);
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d", "b", "c"]);
    }

    #[test]
    fn change_sets_group_ids_by_collection() {
        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::Create {
                collection: Collection::AttendanceSessions,
                id: "s1".to_string(),
                body: json!({}),
            })
            .push(WriteOp::Create {
                collection: Collection::Attendance,
                id: "r1".to_string(),
                body: json!({}),
            })
            .push(WriteOp::Create {
                collection: Collection::Attendance,
                id: "r2".to_string(),
                body: json!({}),
            });
        let sets = batch.change_sets();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].collection, Some(Collection::AttendanceSessions));
        assert_eq!(sets[1].ids, vec!["r1".to_string(), "r2".to_string()]);
        assert!(ChangeSet::resync().affects(Collection::Results));
        assert!(!sets[0].affects(Collection::Results));
    }

    #[test]
    fn retryable_errors_are_transient_ones() {
        assert!(StoreError::Unavailable("down".into()).is_retryable());
        assert!(StoreError::Conflict {
            collection: Collection::Attendance,
            id: "x".into(),
            expected: 1,
            found: 2,
        }
        .is_retryable());
        assert!(!StoreError::AlreadyExists {
            collection: Collection::Attendance,
            id: "x".into(),
        }
        .is_retryable());
    }
}
