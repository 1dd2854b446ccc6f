use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::calendar::CampusCalendar;
use crate::error::{CoreError, Result};
use crate::models::{AttendanceRecord, AttendanceSession, AttendanceStatus};
use crate::retry::RetryPolicy;
use crate::store::{encode, Collection, Query, RecordStore, StoreError, WriteBatch, WriteOp};

// Namespace for the v5 ids derived from session and record keys.
pub(crate) const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_3c2a_9b84_4e0f_a1c7_52d9_e83b_04f6);

/// One student's line in a roll call.
#[derive(Debug, Clone, PartialEq)]
pub struct RollCallEntry {
    pub student_id: String,
    pub student_name: String,
    pub register_no: String,
    pub status: AttendanceStatus,
    pub remarks: Option<String>,
}

/// A roll call for one class period.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkAttendance {
    pub date: NaiveDate,
    pub subject_id: String,
    pub subject_name: String,
    pub section_id: String,
    pub period: u32,
    pub marked_by: String,
    pub records: Vec<RollCallEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub status: AttendanceStatus,
    pub remarks: Option<String>,
    pub corrected_by: String,
}

/// Session id for a (date, subject, section, period) key.
///
/// Marking the same period twice derives the same id, which the store's
/// create guard rejects.
pub fn session_id_for(date: NaiveDate, subject_id: &str, section_id: &str, period: u32) -> String {
    let key = format!("{date}|{subject_id}|{section_id}|{period}");
    Uuid::new_v5(&ID_NAMESPACE, key.as_bytes()).to_string()
}

pub fn record_id_for(session_id: &str, student_id: &str) -> String {
    let key = format!("{session_id}|{student_id}");
    Uuid::new_v5(&ID_NAMESPACE, key.as_bytes()).to_string()
}

/// Register numbers are all digits and longer than 8 characters.
pub fn valid_register_no(register_no: &str) -> bool {
    register_no.len() > 8 && register_no.chars().all(|c| c.is_ascii_digit())
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CoreError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn validate(request: &MarkAttendance) -> Result<()> {
    require("subject_id", &request.subject_id)?;
    require("section_id", &request.section_id)?;
    require("marked_by", &request.marked_by)?;
    if request.period == 0 {
        return Err(CoreError::validation("period must be at least 1"));
    }
    if request.records.is_empty() {
        return Err(CoreError::validation("roll call has no records"));
    }

    let mut seen = HashSet::new();
    for entry in &request.records {
        require("student_id", &entry.student_id)?;
        if !seen.insert(entry.student_id.as_str()) {
            return Err(CoreError::validation(format!(
                "student {} appears more than once",
                entry.student_id
            )));
        }
        if !entry.register_no.is_empty() && !valid_register_no(&entry.register_no) {
            return Err(CoreError::validation(format!(
                "invalid register number '{}' for student {}",
                entry.register_no, entry.student_id
            )));
        }
    }
    Ok(())
}

fn count_into(session: &mut AttendanceSession, status: AttendanceStatus, delta: i64) {
    fn bump(value: &mut u32, delta: i64) {
        *value = (i64::from(*value) + delta).max(0) as u32;
    }
    match status {
        AttendanceStatus::Present => bump(&mut session.present_count, delta),
        AttendanceStatus::Late => bump(&mut session.late_count, delta),
        AttendanceStatus::Absent => bump(&mut session.absent_count, delta),
        AttendanceStatus::Excused => {
            bump(&mut session.absent_count, delta);
            bump(&mut session.excused_count, delta);
        }
    }
}

/// Commits roll calls and corrections.
pub struct AttendanceSessionWriter {
    store: Arc<dyn RecordStore>,
    calendar: CampusCalendar,
    retry: RetryPolicy,
}

impl AttendanceSessionWriter {
    pub fn new(store: Arc<dyn RecordStore>, calendar: CampusCalendar, retry: RetryPolicy) -> Self {
        Self {
            store,
            calendar,
            retry,
        }
    }

    /// Writes the session and every record in one atomic batch and returns
    /// the session id.
    pub async fn mark_attendance(&self, request: MarkAttendance) -> Result<String> {
        validate(&request)?;

        let session_id = session_id_for(
            request.date,
            &request.subject_id,
            &request.section_id,
            request.period,
        );
        let date = self.calendar.midnight(request.date);
        let now = Utc::now();

        let mut session = AttendanceSession {
            id: session_id.clone(),
            date,
            subject_id: request.subject_id.clone(),
            subject_name: request.subject_name.clone(),
            section_id: request.section_id.clone(),
            period: request.period,
            marked_by: request.marked_by.clone(),
            total_students: request.records.len() as u32,
            present_count: 0,
            absent_count: 0,
            late_count: 0,
            excused_count: 0,
            created_at: now,
            updated_at: None,
        };

        let mut record_ops = Vec::with_capacity(request.records.len());
        let mut expected = Vec::with_capacity(request.records.len());
        for entry in request.records {
            count_into(&mut session, entry.status, 1);
            expected.push((record_id_for(&session_id, &entry.student_id), entry.status));
            let record = AttendanceRecord {
                id: record_id_for(&session_id, &entry.student_id),
                session_id: session_id.clone(),
                student_id: entry.student_id,
                student_name: entry.student_name,
                register_no: entry.register_no,
                date,
                status: entry.status,
                subject_id: request.subject_id.clone(),
                subject_name: request.subject_name.clone(),
                section_id: request.section_id.clone(),
                period: request.period,
                marked_by: request.marked_by.clone(),
                marked_at: now,
                remarks: entry.remarks,
            };
            record_ops.push(WriteOp::Create {
                collection: Collection::Attendance,
                id: record.id.clone(),
                body: encode(&record)?,
            });
        }

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::Create {
            collection: Collection::AttendanceSessions,
            id: session_id.clone(),
            body: encode(&session)?,
        });
        batch.ops.extend(record_ops);

        debug!(
            session_id = %session_id,
            documents = batch.len(),
            "committing roll call"
        );

        let expected = &expected;
        let mut attempt = 0u32;
        self.retry
            .run("mark_attendance", || {
                attempt += 1;
                let retried = attempt > 1;
                let batch = batch.clone();
                let session_id = session_id.clone();
                async move {
                    match self.store.commit(batch).await {
                        Ok(()) => Ok(()),
                        Err(StoreError::AlreadyExists { .. }) => {
                            // A retry can collide with its own earlier attempt.
                            if retried && self.roll_call_landed(&session_id, expected).await? {
                                info!(session_id = %session_id, "earlier attempt had already committed");
                                Ok(())
                            } else {
                                Err(CoreError::DuplicateSession { session_id })
                            }
                        }
                        Err(other) => Err(CoreError::Store(other)),
                    }
                }
            })
            .await
            .inspect_err(|err| {
                if let CoreError::DuplicateSession { session_id } = err {
                    warn!(session_id = %session_id, "rejected duplicate roll call");
                }
            })?;

        info!(
            session_id = %session_id,
            section = %session.section_id,
            subject = %session.subject_id,
            period = session.period,
            present = session.present_count,
            absent = session.absent_count,
            late = session.late_count,
            "attendance marked"
        );
        Ok(session_id)
    }

    /// Whether the stored records of `session_id` are exactly `expected`.
    async fn roll_call_landed(
        &self,
        session_id: &str,
        expected: &[(String, AttendanceStatus)],
    ) -> Result<bool> {
        let query = Query::new(Collection::Attendance).eq("sessionId", session_id);
        let mut stored = Vec::new();
        for doc in self.store.query(&query).await? {
            let record: AttendanceRecord = doc.decode()?;
            stored.push((record.id, record.status));
        }
        let mut expected = expected.to_vec();
        stored.sort_by(|a, b| a.0.cmp(&b.0));
        expected.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(stored == expected)
    }

    /// Changes one record's status and rewrites its session counts in the
    /// same commit. Concurrent edits are detected by revision and retried.
    pub async fn correct_record(&self, record_id: &str, correction: Correction) -> Result<AttendanceRecord> {
        require("corrected_by", &correction.corrected_by)?;
        self.retry
            .run("correct_record", || self.try_correct(record_id, &correction))
            .await
    }

    async fn try_correct(&self, record_id: &str, correction: &Correction) -> Result<AttendanceRecord> {
        let record_doc = self
            .store
            .get(Collection::Attendance, record_id)
            .await?
            .ok_or_else(|| CoreError::not_found("attendance record", record_id))?;
        let mut record: AttendanceRecord = record_doc.decode()?;

        let previous = record.status;
        if previous == correction.status && record.remarks == correction.remarks {
            return Ok(record);
        }

        let session_doc = self
            .store
            .get(Collection::AttendanceSessions, &record.session_id)
            .await?
            .ok_or_else(|| CoreError::not_found("attendance session", record.session_id.clone()))?;
        let mut session: AttendanceSession = session_doc.decode()?;

        let now = Utc::now();
        count_into(&mut session, previous, -1);
        count_into(&mut session, correction.status, 1);
        session.updated_at = Some(now);
        if !session.counts_consistent() {
            return Err(CoreError::validation(format!(
                "session {} counts would become inconsistent",
                session.id
            )));
        }

        record.status = correction.status;
        record.remarks = correction.remarks.clone();
        record.marked_by = correction.corrected_by.clone();
        record.marked_at = now;

        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::Replace {
                collection: Collection::Attendance,
                id: record.id.clone(),
                body: encode(&record)?,
                expected_revision: Some(record_doc.revision),
            })
            .push(WriteOp::Replace {
                collection: Collection::AttendanceSessions,
                id: session.id.clone(),
                body: encode(&session)?,
                expected_revision: Some(session_doc.revision),
            });
        self.store.commit(batch).await?;

        info!(
            record_id = %record.id,
            session_id = %session.id,
            from = %previous,
            to = %record.status,
            "attendance record corrected"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::Query;

    fn entry(student: &str, register_no: &str, status: AttendanceStatus) -> RollCallEntry {
        RollCallEntry {
            student_id: student.to_string(),
            student_name: format!("Student {student}"),
            register_no: register_no.to_string(),
            status,
            remarks: None,
        }
    }

    fn roll_call(period: u32, records: Vec<RollCallEntry>) -> MarkAttendance {
        MarkAttendance {
            date: NaiveDate::from_ymd_opt(2026, 2, 2).unwrap(),
            subject_id: "CS101".to_string(),
            subject_name: "Programming".to_string(),
            section_id: "CSE-A".to_string(),
            period,
            marked_by: "faculty-7".to_string(),
            records,
        }
    }

    fn roster() -> Vec<RollCallEntry> {
        vec![
            entry("st1", "412345678901", AttendanceStatus::Present),
            entry("st2", "412345678902", AttendanceStatus::Absent),
            entry("st3", "412345678903", AttendanceStatus::Late),
            entry("st4", "412345678904", AttendanceStatus::Excused),
        ]
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
        }
    }

    fn writer(store: &Arc<MemoryStore>) -> AttendanceSessionWriter {
        AttendanceSessionWriter::new(store.clone(), CampusCalendar::utc(), fast_retry())
    }

    async fn session(store: &MemoryStore, id: &str) -> AttendanceSession {
        store
            .get(Collection::AttendanceSessions, id)
            .await
            .unwrap()
            .unwrap()
            .decode()
            .unwrap()
    }

    async fn records_of(store: &MemoryStore, session_id: &str) -> Vec<AttendanceRecord> {
        store
            .query(&Query::new(Collection::Attendance).eq("sessionId", session_id))
            .await
            .unwrap()
            .iter()
            .map(|doc| doc.decode().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn commits_session_with_matching_records() {
        let store = Arc::new(MemoryStore::default());
        let session_id = writer(&store).mark_attendance(roll_call(1, roster())).await.unwrap();

        let session = session(&store, &session_id).await;
        assert_eq!(session.total_students, 4);
        assert_eq!(session.present_count, 1);
        assert_eq!(session.late_count, 1);
        assert_eq!(session.absent_count, 2);
        assert_eq!(session.excused_count, 1);
        assert!(session.counts_consistent());
        assert_eq!(records_of(&store, &session_id).await.len(), 4);
    }

    #[tokio::test]
    async fn invalid_roll_calls_write_nothing() {
        let store = Arc::new(MemoryStore::default());
        let writer = writer(&store);

        let empty = writer.mark_attendance(roll_call(1, Vec::new())).await;
        assert!(matches!(empty, Err(CoreError::Validation(_))));

        let mut doubled = roster();
        doubled.push(entry("st1", "412345678901", AttendanceStatus::Absent));
        let doubled = writer.mark_attendance(roll_call(1, doubled)).await;
        assert!(matches!(doubled, Err(CoreError::Validation(_))));

        let bad_register = vec![entry("st1", "41A3", AttendanceStatus::Present)];
        let bad_register = writer.mark_attendance(roll_call(1, bad_register)).await;
        assert!(matches!(bad_register, Err(CoreError::Validation(_))));

        let period_zero = writer.mark_attendance(roll_call(0, roster())).await;
        assert!(matches!(period_zero, Err(CoreError::Validation(_))));

        assert_eq!(store.len(Collection::AttendanceSessions), 0);
        assert_eq!(store.len(Collection::Attendance), 0);
    }

    #[tokio::test]
    async fn second_roll_call_for_same_period_is_rejected() {
        let store = Arc::new(MemoryStore::default());
        let writer = writer(&store);
        let first = writer.mark_attendance(roll_call(2, roster())).await.unwrap();

        let other_roster = vec![entry("st9", "412345678909", AttendanceStatus::Present)];
        let second = writer.mark_attendance(roll_call(2, other_roster)).await;
        match second {
            Err(CoreError::DuplicateSession { session_id }) => assert_eq!(session_id, first),
            other => panic!("expected duplicate rejection, got {other:?}"),
        }

        assert_eq!(store.len(Collection::AttendanceSessions), 1);
        let records = records_of(&store, &first).await;
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.student_id != "st9"));

        // A different period is a different session.
        writer.mark_attendance(roll_call(3, roster())).await.unwrap();
        assert_eq!(store.len(Collection::AttendanceSessions), 2);
    }

    #[tokio::test]
    async fn concurrent_duplicates_leave_exactly_one_session() {
        let store = Arc::new(MemoryStore::default());
        let writer = writer(&store);
        let (a, b) = tokio::join!(
            writer.mark_attendance(roll_call(4, roster())),
            writer.mark_attendance(roll_call(
                4,
                vec![entry("st5", "412345678905", AttendanceStatus::Present)]
            )),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(store.len(Collection::AttendanceSessions), 1);
        let session_id = a.or(b.map_err(|_| ())).unwrap_or_default();
        let session = session(&store, &session_id).await;
        assert_eq!(
            session.total_students as usize,
            records_of(&store, &session_id).await.len()
        );
    }

    #[tokio::test]
    async fn transient_commit_failures_are_retried() {
        let store = Arc::new(MemoryStore::default());
        store.fail_next_commits(2);
        let session_id = writer(&store).mark_attendance(roll_call(1, roster())).await.unwrap();
        assert_eq!(records_of(&store, &session_id).await.len(), 4);
    }

    #[tokio::test]
    async fn retry_after_lost_acknowledgement_is_not_a_duplicate() {
        let store = Arc::new(MemoryStore::default());
        store.lose_next_acks(1);
        let session_id = writer(&store).mark_attendance(roll_call(1, roster())).await.unwrap();
        assert_eq!(store.len(Collection::AttendanceSessions), 1);
        assert_eq!(records_of(&store, &session_id).await.len(), 4);

        let again = writer(&store).mark_attendance(roll_call(1, roster())).await.unwrap_err();
        assert!(matches!(again, CoreError::DuplicateSession { .. }));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_retryable_error_without_partial_state() {
        let store = Arc::new(MemoryStore::default());
        store.fail_next_commits(5);
        let err = writer(&store)
            .mark_attendance(roll_call(1, roster()))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.len(Collection::AttendanceSessions), 0);
        assert_eq!(store.len(Collection::Attendance), 0);
    }

    #[tokio::test]
    async fn correction_moves_counts_between_buckets() {
        let store = Arc::new(MemoryStore::default());
        let writer = writer(&store);
        let session_id = writer.mark_attendance(roll_call(1, roster())).await.unwrap();
        let record_id = record_id_for(&session_id, "st2");

        let corrected = writer
            .correct_record(
                &record_id,
                Correction {
                    status: AttendanceStatus::Late,
                    remarks: Some("bus delay".to_string()),
                    corrected_by: "hod-1".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(corrected.status, AttendanceStatus::Late);
        assert_eq!(corrected.marked_by, "hod-1");

        let session = session(&store, &session_id).await;
        assert_eq!(session.late_count, 2);
        assert_eq!(session.absent_count, 1);
        assert!(session.counts_consistent());
        assert!(session.updated_at.is_some());

        writer
            .correct_record(
                &record_id_for(&session_id, "st4"),
                Correction {
                    status: AttendanceStatus::Present,
                    remarks: None,
                    corrected_by: "hod-1".to_string(),
                },
            )
            .await
            .unwrap();
        let session = self::session(&store, &session_id).await;
        assert_eq!(session.excused_count, 0);
        assert_eq!(session.absent_count, 0);
        assert_eq!(session.present_count, 2);
        assert!(session.counts_consistent());
    }

    #[tokio::test]
    async fn correcting_unknown_record_is_not_found() {
        let store = Arc::new(MemoryStore::default());
        let err = writer(&store)
            .correct_record(
                "missing",
                Correction {
                    status: AttendanceStatus::Present,
                    remarks: None,
                    corrected_by: "hod-1".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn ids_are_deterministic_per_key() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 2).unwrap();
        assert_eq!(
            session_id_for(date, "CS101", "A", 1),
            session_id_for(date, "CS101", "A", 1)
        );
        assert_ne!(
            session_id_for(date, "CS101", "A", 1),
            session_id_for(date, "CS101", "A", 2)
        );
        assert!(valid_register_no("412345678901"));
        assert!(!valid_register_no("12345678"));
    }
}
