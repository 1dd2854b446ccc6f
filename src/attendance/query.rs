use std::sync::Arc;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::analytics::{self, RiskThresholds, Tally};
use crate::calendar::{CampusCalendar, DateRange, DayWindow};
use crate::error::{CoreError, Result};
use crate::models::{AttendanceRecord, AttendanceSession, AttendanceStats, LowAttendanceStudent};
use crate::store::{Collection, Direction, Query, RecordStore};

pub const DEFAULT_LOW_ATTENDANCE_THRESHOLD: u32 = 75;

/// Restricts a query on the `date` field to an inclusive instant window.
pub fn within(query: Query, window: DayWindow) -> Query {
    query
        .gte("date", window.start.timestamp_millis())
        .lte("date", window.end.timestamp_millis())
}

/// Records of one section, ordered the way roll calls are read back.
pub fn section_records_query(section_id: &str) -> Query {
    Query::new(Collection::Attendance)
        .eq("sectionId", section_id)
        .order_by("date", Direction::Asc)
        .order_by("period", Direction::Asc)
        .order_by("registerNo", Direction::Asc)
}

/// Per-student aggregation for a section, lowest percentage first.
///
/// Students at or above `threshold` are dropped; ties are ordered by student
/// id so the result does not depend on record order.
pub fn low_attendance(records: &[AttendanceRecord], threshold: u32) -> Vec<LowAttendanceStudent> {
    let mut students: Vec<LowAttendanceStudent> = analytics::group_by_student(records)
        .into_iter()
        .map(|(student_id, records)| {
            let mut tally = Tally::default();
            for record in &records {
                tally.add(record.status);
            }
            let first = &records[0];
            LowAttendanceStudent {
                student_id: student_id.to_string(),
                student_name: first.student_name.clone(),
                register_no: first.register_no.clone(),
                attended: tally.attended(),
                total: tally.total(),
                percentage: analytics::percentage(tally.attended(), tally.total()),
            }
        })
        .filter(|student| student.total > 0 && student.percentage < threshold)
        .collect();

    students.sort_by(|a, b| {
        a.percentage
            .cmp(&b.percentage)
            .then_with(|| a.student_id.cmp(&b.student_id))
    });
    students
}

pub struct AttendanceQueryEngine {
    store: Arc<dyn RecordStore>,
    calendar: CampusCalendar,
    thresholds: RiskThresholds,
}

impl AttendanceQueryEngine {
    pub fn new(store: Arc<dyn RecordStore>, calendar: CampusCalendar, thresholds: RiskThresholds) -> Self {
        Self {
            store,
            calendar,
            thresholds,
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, query: &Query) -> Result<Vec<T>> {
        let documents = self.store.query(query).await?;
        documents
            .iter()
            .map(|doc| doc.decode().map_err(CoreError::from))
            .collect()
    }

    /// Records marked on `date`, optionally narrowed to a section and subject,
    /// ordered by period then register number.
    pub async fn get_by_date(
        &self,
        date: NaiveDate,
        section_id: Option<&str>,
        subject_id: Option<&str>,
    ) -> Result<Vec<AttendanceRecord>> {
        let mut query = within(Query::new(Collection::Attendance), self.calendar.day(date));
        if let Some(section_id) = section_id {
            query = query.eq("sectionId", section_id);
        }
        if let Some(subject_id) = subject_id {
            query = query.eq("subjectId", subject_id);
        }
        let query = query
            .order_by("period", Direction::Asc)
            .order_by("registerNo", Direction::Asc);
        self.fetch(&query).await
    }

    pub async fn get_student_stats(
        &self,
        student_id: &str,
        range: Option<DateRange>,
    ) -> Result<AttendanceStats> {
        if student_id.trim().is_empty() {
            return Err(CoreError::validation("student_id must not be empty"));
        }
        let mut query = Query::new(Collection::Attendance).eq("studentId", student_id);
        if let Some(range) = range {
            query = within(query, self.calendar.window(range));
        }
        let records: Vec<AttendanceRecord> = self.fetch(&query).await?;
        debug!(student_id, records = records.len(), "computing student stats");
        Ok(analytics::student_stats(student_id, &records, &self.thresholds))
    }

    /// Most recent sessions first (date, then period, descending).
    pub async fn get_sessions(&self, section_id: Option<&str>, limit: usize) -> Result<Vec<AttendanceSession>> {
        if limit == 0 {
            return Err(CoreError::validation("limit must be at least 1"));
        }
        let mut query = Query::new(Collection::AttendanceSessions);
        if let Some(section_id) = section_id {
            query = query.eq("sectionId", section_id);
        }
        let query = query
            .order_by("date", Direction::Desc)
            .order_by("period", Direction::Desc)
            .limit(limit);
        self.fetch(&query).await
    }

    pub async fn section_records(&self, section_id: &str) -> Result<Vec<AttendanceRecord>> {
        self.fetch(&section_records_query(section_id)).await
    }

    /// Students of a section below `threshold` percent, lowest first.
    pub async fn get_low_attendance_students(
        &self,
        section_id: &str,
        threshold: u32,
    ) -> Result<Vec<LowAttendanceStudent>> {
        if section_id.trim().is_empty() {
            return Err(CoreError::validation("section_id must not be empty"));
        }
        if threshold > 100 {
            return Err(CoreError::validation("threshold must be at most 100"));
        }
        let records = self.section_records(section_id).await?;
        let students = low_attendance(&records, threshold);
        debug!(
            section_id,
            records = records.len(),
            flagged = students.len(),
            "low attendance scan"
        );
        Ok(students)
    }
}
