use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::attendance::{AttendanceSessionWriter, MarkAttendance, RollCallEntry};
use crate::calendar::CampusCalendar;
use crate::error::CoreError;
use crate::models::{AttendanceStatus, ExamResult};
use crate::results::{result_id_for, MAX_SUBJECT_CREDITS};
use crate::retry::RetryPolicy;
use crate::store::{
    encode, ChangeSet, Collection, Direction, Document, Query, RecordStore, StoreError, WriteBatch,
    WriteOp,
};

/// Postgres channel carrying committed change sets.
pub const CHANGE_CHANNEL: &str = "campus_records_changes";

// pg_notify rejects payloads of 8000 bytes or more.
const MAX_NOTIFY_PAYLOAD: usize = 7900;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        // serialization_failure, deadlock_detected
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("40001" | "40P01")) => {
            StoreError::Unavailable(err.to_string())
        }
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
            StoreError::Serialization(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn select_statement(query: &Query) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(
        "SELECT id, revision, body FROM campus_records.documents WHERE collection = ",
    );
    builder.push_bind(query.collection.as_str());

    for filter in &query.filters {
        builder
            .push(" AND body -> ")
            .push_bind(filter.field.clone())
            .push(format!(" {} ", filter.op.sql()))
            .push_bind(Json(filter.value.clone()));
    }

    builder.push(" ORDER BY ");
    for order in &query.order {
        let nulls = match order.direction {
            Direction::Asc => "NULLS FIRST",
            Direction::Desc => "NULLS LAST",
        };
        builder
            .push("body -> ")
            .push_bind(order.field.clone())
            .push(format!(" {} {nulls}, ", order.direction.sql()));
    }
    builder.push("id ASC");

    if let Some(limit) = query.limit {
        builder
            .push(" LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }
    builder
}

fn document_from_row(row: &PgRow) -> Result<Document, StoreError> {
    let id: String = row.try_get("id").map_err(map_sqlx)?;
    let revision: i64 = row.try_get("revision").map_err(map_sqlx)?;
    let Json(body): Json<Value> = row.try_get("body").map_err(map_sqlx)?;
    Ok(Document {
        id,
        revision: u64::try_from(revision).unwrap_or_default(),
        body,
    })
}

/// Change set as sent through `pg_notify`, without ids when they would not fit.
fn notify_payload(set: &ChangeSet) -> Result<String, StoreError> {
    let payload = serde_json::to_string(set)?;
    if payload.len() < MAX_NOTIFY_PAYLOAD {
        return Ok(payload);
    }
    let trimmed = ChangeSet {
        collection: set.collection,
        ids: Vec::new(),
    };
    Ok(serde_json::to_string(&trimmed)?)
}

async fn lock_revision(
    tx: &mut Transaction<'_, Postgres>,
    collection: Collection,
    id: &str,
) -> Result<i64, StoreError> {
    let revision: Option<i64> = sqlx::query_scalar(
        "SELECT revision FROM campus_records.documents WHERE collection = $1 AND id = $2 FOR UPDATE",
    )
    .bind(collection.as_str())
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(map_sqlx)?;

    revision.ok_or_else(|| StoreError::NotFound {
        collection,
        id: id.to_string(),
    })
}

async fn apply(tx: &mut Transaction<'_, Postgres>, op: WriteOp) -> Result<(), StoreError> {
    match op {
        WriteOp::Create {
            collection,
            id,
            body,
        } => {
            let result = sqlx::query(
                r#"
                INSERT INTO campus_records.documents (collection, id, revision, body)
                VALUES ($1, $2, 1, $3)
                ON CONFLICT (collection, id) DO NOTHING
                "#,
            )
            .bind(collection.as_str())
            .bind(&id)
            .bind(Json(body))
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::AlreadyExists { collection, id });
            }
        }
        WriteOp::Put {
            collection,
            id,
            body,
        } => {
            sqlx::query(
                r#"
                INSERT INTO campus_records.documents (collection, id, revision, body)
                VALUES ($1, $2, 1, $3)
                ON CONFLICT (collection, id) DO UPDATE
                SET body = EXCLUDED.body,
                    revision = campus_records.documents.revision + 1,
                    updated_at = now()
                "#,
            )
            .bind(collection.as_str())
            .bind(&id)
            .bind(Json(body))
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        }
        WriteOp::Replace {
            collection,
            id,
            body,
            expected_revision,
        } => {
            let current = lock_revision(tx, collection, &id).await?;
            if let Some(expected) = expected_revision {
                let found = u64::try_from(current).unwrap_or_default();
                if found != expected {
                    return Err(StoreError::Conflict {
                        collection,
                        id,
                        expected,
                        found,
                    });
                }
            }
            sqlx::query(
                r#"
                UPDATE campus_records.documents
                SET body = $3, revision = revision + 1, updated_at = now()
                WHERE collection = $1 AND id = $2
                "#,
            )
            .bind(collection.as_str())
            .bind(&id)
            .bind(Json(body))
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        }
        WriteOp::Patch {
            collection,
            id,
            fields,
        } => {
            lock_revision(tx, collection, &id).await?;
            sqlx::query(
                r#"
                UPDATE campus_records.documents
                SET body = body || $3, revision = revision + 1, updated_at = now()
                WHERE collection = $1 AND id = $2
                "#,
            )
            .bind(collection.as_str())
            .bind(&id)
            .bind(Json(Value::Object(fields)))
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        }
        WriteOp::AddToSet {
            collection,
            id,
            field,
            value,
        } => {
            lock_revision(tx, collection, &id).await?;
            sqlx::query(
                r#"
                UPDATE campus_records.documents
                SET body = jsonb_set(
                        body,
                        ARRAY[$3::text],
                        CASE
                            WHEN jsonb_typeof(body -> $3::text) <> 'array'
                                OR body -> $3::text IS NULL
                                THEN jsonb_build_array($4::jsonb)
                            WHEN (body -> $3::text) @> jsonb_build_array($4::jsonb)
                                THEN body -> $3::text
                            ELSE (body -> $3::text) || jsonb_build_array($4::jsonb)
                        END,
                        true
                    ),
                    revision = revision + 1,
                    updated_at = now()
                WHERE collection = $1 AND id = $2
                "#,
            )
            .bind(collection.as_str())
            .bind(&id)
            .bind(&field)
            .bind(Json(value))
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        }
        WriteOp::Delete { collection, id } => {
            let result = sqlx::query(
                "DELETE FROM campus_records.documents WHERE collection = $1 AND id = $2",
            )
            .bind(collection.as_str())
            .bind(&id)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound { collection, id });
            }
        }
    }
    Ok(())
}

/// `RecordStore` on a single Postgres `documents` table.
///
/// Each batch runs in one transaction and announces its change sets with
/// `pg_notify`, so listeners only hear about committed writes. A background
/// listener forwards them to `changes()` and emits a resync after every
/// reconnect.
pub struct PgStore {
    pool: PgPool,
    changes: broadcast::Sender<ChangeSet>,
    listener: JoinHandle<()>,
}

impl PgStore {
    /// Must be called from within a Tokio runtime.
    pub fn new(pool: PgPool, change_feed_capacity: usize, retry: RetryPolicy) -> Self {
        let (changes, _) = broadcast::channel(change_feed_capacity.max(1));
        let listener = tokio::spawn(listen(pool.clone(), changes.clone(), retry));
        Self {
            pool,
            changes,
            listener,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Drop for PgStore {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(pool: PgPool, changes: broadcast::Sender<ChangeSet>, retry: RetryPolicy) {
    let mut failures: u32 = 0;
    let mut connected_before = false;

    loop {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(err) => {
                failures += 1;
                warn!(failures, error = %err, "change listener connect failed");
                tokio::time::sleep(retry.backoff(failures)).await;
                continue;
            }
        };
        if let Err(err) = listener.listen(CHANGE_CHANNEL).await {
            failures += 1;
            warn!(failures, error = %err, "change listener subscribe failed");
            tokio::time::sleep(retry.backoff(failures)).await;
            continue;
        }

        if connected_before {
            info!("change listener reconnected, requesting resync");
            let _ = changes.send(ChangeSet::resync());
        }
        connected_before = true;
        failures = 0;

        loop {
            match listener.try_recv().await {
                Ok(Some(notification)) => {
                    let set = serde_json::from_str::<ChangeSet>(notification.payload())
                        .unwrap_or_else(|err| {
                            warn!(error = %err, "unreadable change payload, requesting resync");
                            ChangeSet::resync()
                        });
                    let _ = changes.send(set);
                }
                Ok(None) => {
                    warn!("change listener lost its connection");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "change listener failed");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(
            "SELECT id, revision, body FROM campus_records.documents WHERE collection = $1 AND id = $2",
        )
        .bind(collection.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(document_from_row).transpose()
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let mut statement = select_statement(query);
        let rows = statement
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(document_from_row).collect()
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let change_sets = batch.change_sets();
        let ops = batch.len();

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for op in batch.ops {
            apply(&mut tx, op).await?;
        }
        for set in &change_sets {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(CHANGE_CHANNEL)
                .bind(notify_payload(set)?)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;

        debug!(ops, collections = change_sets.len(), "batch committed");
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<ChangeSet> {
        self.changes.subscribe()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub sessions_created: usize,
    pub sessions_skipped: usize,
    pub results: usize,
}

const SEED_SECTION: &str = "CSE-A";

/// Loads a demo section: four roll calls and a semester of results.
///
/// Safe to run repeatedly; periods that were already marked are skipped.
pub async fn seed(store: Arc<dyn RecordStore>, calendar: CampusCalendar) -> anyhow::Result<SeedSummary> {
    let students = [
        ("st-avery", "Avery Lee", "311521104001"),
        ("st-jules", "Jules Moreno", "311521104002"),
        ("st-kiara", "Kiara Patel", "311521104003"),
    ];

    let roll_calls = [
        ("2026-02-02", "CS3401", "Algorithms", 1, ["present", "present", "absent"]),
        ("2026-02-02", "MA3151", "Matrices and Calculus", 2, ["present", "late", "absent"]),
        ("2026-02-03", "CS3401", "Algorithms", 1, ["present", "absent", "excused"]),
        ("2026-02-03", "CS3461LAB", "Operating Systems Lab", 3, ["present", "present", "absent"]),
    ];

    let writer = AttendanceSessionWriter::new(store.clone(), calendar, RetryPolicy::default());
    let mut summary = SeedSummary::default();

    for (date, subject_id, subject_name, period, statuses) in roll_calls {
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").context("invalid seed date")?;
        let mut records = Vec::with_capacity(students.len());
        for ((student_id, name, register_no), status) in students.iter().zip(statuses) {
            records.push(RollCallEntry {
                student_id: student_id.to_string(),
                student_name: name.to_string(),
                register_no: register_no.to_string(),
                status: status.parse::<AttendanceStatus>().map_err(anyhow::Error::msg)?,
                remarks: None,
            });
        }

        let request = MarkAttendance {
            date,
            subject_id: subject_id.to_string(),
            subject_name: subject_name.to_string(),
            section_id: SEED_SECTION.to_string(),
            period,
            marked_by: "faculty-demo".to_string(),
            records,
        };
        match writer.mark_attendance(request).await {
            Ok(_) => summary.sessions_created += 1,
            Err(CoreError::DuplicateSession { .. }) => summary.sessions_skipped += 1,
            Err(err) => return Err(err).context("failed to seed attendance"),
        }
    }

    let grades = [
        ("st-avery", ["O", "A+", "A"]),
        ("st-jules", ["B+", "A", "B"]),
        ("st-kiara", ["C", "RA", "B+"]),
    ];
    let subjects = [("CS3401", 3), ("MA3151", 4), ("CS3461LAB", 2)];

    let mut batch = WriteBatch::new();
    for (student_id, student_grades) in grades {
        for ((subject_code, credits), grade) in subjects.iter().zip(student_grades) {
            let result = ExamResult {
                student_id: student_id.to_string(),
                subject_code: subject_code.to_string(),
                semester: 1,
                grade: grade.to_string(),
                credits: Some(*credits),
            };
            batch.push(WriteOp::Put {
                collection: Collection::Results,
                id: result_id_for(&result.student_id, &result.subject_code, result.semester),
                body: encode(&result)?,
            });
            summary.results += 1;
        }
    }
    store.commit(batch).await.context("failed to seed results")?;

    info!(
        created = summary.sessions_created,
        skipped = summary.sessions_skipped,
        results = summary.results,
        "seed complete"
    );
    Ok(summary)
}

/// Imports exam results from a CSV with the header
/// `student_id,subject_code,semester,grade,credits` (credits may be empty).
///
/// Returns the number of results that did not exist before; re-imported rows
/// overwrite the stored grade.
pub async fn import_results_csv(store: &dyn RecordStore, csv_path: &Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        student_id: String,
        subject_code: String,
        semester: u32,
        grade: String,
        credits: Option<u32>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut batch = WriteBatch::new();
    let mut inserted = 0usize;

    for (line, row) in reader.deserialize::<CsvRow>().enumerate() {
        let row = row.with_context(|| format!("invalid row {}", line + 2))?;
        if row.student_id.trim().is_empty() || row.subject_code.trim().is_empty() {
            anyhow::bail!("row {} is missing student_id or subject_code", line + 2);
        }
        if let Some(credits) = row.credits.filter(|c| *c > MAX_SUBJECT_CREDITS) {
            anyhow::bail!(
                "row {} has {} credits, above the limit of {}",
                line + 2,
                credits,
                MAX_SUBJECT_CREDITS
            );
        }

        let result = ExamResult {
            student_id: row.student_id.trim().to_string(),
            subject_code: row.subject_code.trim().to_string(),
            semester: row.semester,
            grade: row.grade.trim().to_string(),
            credits: row.credits,
        };
        let id = result_id_for(&result.student_id, &result.subject_code, result.semester);
        if store.get(Collection::Results, &id).await?.is_none() {
            inserted += 1;
        }
        batch.push(WriteOp::Put {
            collection: Collection::Results,
            id,
            body: encode(&result)?,
        });
    }

    let rows = batch.len();
    store.commit(batch).await.context("failed to store results")?;
    info!(rows, inserted, path = %csv_path.display(), "results imported");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::results::ResultsReader;
    use std::io::Write;

    #[test]
    fn select_statement_binds_fields_and_values() {
        let query = Query::new(Collection::Attendance)
            .eq("sectionId", "CSE-A")
            .gte("date", 1_000)
            .order_by("date", Direction::Asc)
            .order_by("period", Direction::Desc)
            .limit(5);
        let statement = select_statement(&query);
        assert_eq!(
            statement.sql(),
            "SELECT id, revision, body FROM campus_records.documents WHERE collection = $1 \
             AND body -> $2 = $3 AND body -> $4 >= $5 \
             ORDER BY body -> $6 ASC NULLS FIRST, body -> $7 DESC NULLS LAST, id ASC LIMIT $8"
        );
    }

    #[test]
    fn unordered_query_still_orders_by_id() {
        let statement = select_statement(&Query::new(Collection::Results));
        assert!(statement.sql().ends_with("ORDER BY id ASC"));
    }

    #[test]
    fn oversized_change_sets_drop_their_ids() {
        let small = ChangeSet {
            collection: Some(Collection::Attendance),
            ids: vec!["a".to_string()],
        };
        let payload = notify_payload(&small).unwrap();
        assert_eq!(serde_json::from_str::<ChangeSet>(&payload).unwrap(), small);

        let large = ChangeSet {
            collection: Some(Collection::Attendance),
            ids: (0..400).map(|i| format!("{i:036}")).collect(),
        };
        let payload = notify_payload(&large).unwrap();
        let decoded: ChangeSet = serde_json::from_str(&payload).unwrap();
        assert_eq!(decoded.collection, Some(Collection::Attendance));
        assert!(decoded.ids.is_empty());
    }

    #[test]
    fn connection_errors_are_retryable() {
        assert!(map_sqlx(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!map_sqlx(sqlx::Error::RowNotFound).is_retryable());
        assert!(matches!(
            map_sqlx(sqlx::Error::Protocol("bad message".to_string())),
            StoreError::Backend(_)
        ));
    }

    #[tokio::test]
    async fn seed_is_repeatable() {
        let store = Arc::new(MemoryStore::default());
        let first = seed(store.clone(), CampusCalendar::utc()).await.unwrap();
        assert_eq!(first.sessions_created, 4);
        assert_eq!(first.results, 9);

        let second = seed(store.clone(), CampusCalendar::utc()).await.unwrap();
        assert_eq!(second.sessions_created, 0);
        assert_eq!(second.sessions_skipped, 4);
        assert_eq!(store.len(Collection::AttendanceSessions), 4);
        assert_eq!(store.len(Collection::Attendance), 12);
        assert_eq!(store.len(Collection::Results), 9);
    }

    #[tokio::test]
    async fn imports_results_and_overwrites_on_reimport() {
        let store = Arc::new(MemoryStore::default());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "student_id,subject_code,semester,grade,credits").unwrap();
        writeln!(file, "st1,CS3401,1,O,3").unwrap();
        writeln!(file, "st1,MA3151,1,B+,3").unwrap();
        writeln!(file, "st1,LAB1,1,A,").unwrap();
        file.flush().unwrap();

        let inserted = import_results_csv(store.as_ref(), file.path()).await.unwrap();
        assert_eq!(inserted, 3);
        let reader = ResultsReader::new(store.clone());
        assert_eq!(reader.cgpa_for_student("st1").await.unwrap().cgpa, 8.38);

        let inserted = import_results_csv(store.as_ref(), file.path()).await.unwrap();
        assert_eq!(inserted, 0);
        assert_eq!(store.len(Collection::Results), 3);
    }

    #[tokio::test]
    async fn rejects_rows_without_keys() {
        let store = MemoryStore::default();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "student_id,subject_code,semester,grade,credits").unwrap();
        writeln!(file, ",CS3401,1,O,3").unwrap();
        file.flush().unwrap();

        assert!(import_results_csv(&store, file.path()).await.is_err());
        assert_eq!(store.len(Collection::Results), 0);
    }

    #[tokio::test]
    async fn rejects_rows_with_implausible_credits() {
        let store = MemoryStore::default();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "student_id,subject_code,semester,grade,credits").unwrap();
        writeln!(file, "st1,CS3401,1,O,3").unwrap();
        writeln!(file, "st1,MA3151,1,A,4294967295").unwrap();
        file.flush().unwrap();

        let err = import_results_csv(&store, file.path()).await.unwrap_err();
        assert!(err.to_string().contains("row 3"));
        assert_eq!(store.len(Collection::Results), 0);
    }
}
