use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::models::{
    AttendanceRecord, AttendanceStats, AttendanceStatus, Classification, RiskStatus,
    SubjectAttendanceMetric,
};

/// Subject used for records that carry no subject id.
pub const GENERAL_SUBJECT: &str = "general";

/// Percentage cutoffs: below `danger` is danger, below `warning` is warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    pub danger: u32,
    pub warning: u32,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            danger: 75,
            warning: 85,
        }
    }
}

impl RiskThresholds {
    pub fn validate(&self) -> Result<()> {
        if self.danger > self.warning || self.warning > 100 {
            return Err(CoreError::validation(format!(
                "thresholds must satisfy danger <= warning <= 100 (got {} / {})",
                self.danger, self.warning
            )));
        }
        Ok(())
    }

    pub fn status_for(&self, percentage: u32) -> RiskStatus {
        if percentage < self.danger {
            RiskStatus::Danger
        } else if percentage < self.warning {
            RiskStatus::Warning
        } else {
            RiskStatus::Safe
        }
    }

    pub fn classify(&self, attended: u32, total: u32) -> Classification {
        let percentage = percentage(attended, total);
        Classification {
            percentage,
            status: self.status_for(percentage),
        }
    }
}

/// Classifies with the default 75/85 cutoffs.
pub fn classify(attended: u32, total: u32) -> Classification {
    RiskThresholds::default().classify(attended, total)
}

/// `round(attended / total * 100)`, half away from zero, 0 when `total` is 0
/// and never above 100.
pub fn percentage(attended: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let attended = u64::from(attended.min(total));
    let total = u64::from(total);
    ((attended * 200 + total) / (2 * total)) as u32
}

/// Running counts for one student or subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub present: u32,
    pub absent: u32,
    pub late: u32,
    pub excused: u32,
}

impl Tally {
    pub fn add(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Late => self.late += 1,
            AttendanceStatus::Excused => self.excused += 1,
        }
    }

    pub fn attended(&self) -> u32 {
        self.present + self.late
    }

    /// Denominator of the percentage: every non-excused record.
    pub fn total(&self) -> u32 {
        self.present + self.absent + self.late
    }

    pub fn classify(&self, thresholds: &RiskThresholds) -> Classification {
        thresholds.classify(self.attended(), self.total())
    }
}

pub fn subject_key(subject_id: &str) -> &str {
    if subject_id.trim().is_empty() {
        GENERAL_SUBJECT
    } else {
        subject_id
    }
}

/// Groups records by subject and classifies each group, ordered by subject.
pub fn subject_metrics<'a, I>(records: I, thresholds: &RiskThresholds) -> Vec<SubjectAttendanceMetric>
where
    I: IntoIterator<Item = &'a AttendanceRecord>,
{
    let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
    for record in records {
        tallies
            .entry(subject_key(&record.subject_id).to_string())
            .or_default()
            .add(record.status);
    }

    tallies
        .into_iter()
        .map(|(subject_code, tally)| {
            let classification = tally.classify(thresholds);
            SubjectAttendanceMetric {
                subject_code,
                attended: tally.attended(),
                total: tally.total(),
                percentage: classification.percentage,
                status: classification.status,
            }
        })
        .collect()
}

/// Overall and per-subject stats for one student's records.
pub fn student_stats(
    student_id: &str,
    records: &[AttendanceRecord],
    thresholds: &RiskThresholds,
) -> AttendanceStats {
    let mut tally = Tally::default();
    for record in records {
        tally.add(record.status);
    }
    let classification = tally.classify(thresholds);
    AttendanceStats {
        student_id: student_id.to_string(),
        present: tally.present,
        absent: tally.absent,
        late: tally.late,
        excused: tally.excused,
        attended: tally.attended(),
        total: tally.total(),
        percentage: classification.percentage,
        status: classification.status,
        subjects: subject_metrics(records, thresholds),
    }
}

/// Splits records per student, keyed and ordered by student id.
pub fn group_by_student(records: &[AttendanceRecord]) -> BTreeMap<&str, Vec<AttendanceRecord>> {
    let mut grouped: BTreeMap<&str, Vec<AttendanceRecord>> = BTreeMap::new();
    for record in records {
        grouped
            .entry(record.student_id.as_str())
            .or_default()
            .push(record.clone());
    }
    grouped
}

/// Number of reporting periods the external portal publishes per subject.
pub const PORTAL_PERIODS: usize = 4;

/// One reporting bucket of the portal's subject-wise attendance table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalPeriod {
    #[serde(default)]
    pub total_period: String,
    #[serde(default)]
    pub attended_period: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalSubject {
    pub subject_code: String,
    #[serde(default)]
    pub subject_name: String,
    /// Buckets for periods 1..=4 in order; missing buckets are empty.
    #[serde(default)]
    pub periods: Vec<PortalPeriod>,
}

impl PortalSubject {
    fn bucket(&self, period: usize) -> Option<&PortalPeriod> {
        period.checked_sub(1).and_then(|index| self.periods.get(index))
    }
}

/// Latest reporting period (1-based) for which any subject has a total.
///
/// Scans period 4 down to 1 once across all subjects, so every subject is
/// reported against the same period.
pub fn detect_current_period(subjects: &[PortalSubject]) -> Option<usize> {
    (1..=PORTAL_PERIODS).rev().find(|&period| {
        subjects.iter().any(|subject| {
            subject
                .bucket(period)
                .is_some_and(|bucket| !bucket.total_period.trim().is_empty())
        })
    })
}

fn parse_count(value: &str) -> u32 {
    value.trim().parse().unwrap_or(0)
}

/// Classifies every portal subject against the detected current period.
pub fn subject_wise_metrics(
    subjects: &[PortalSubject],
    thresholds: &RiskThresholds,
) -> Vec<SubjectAttendanceMetric> {
    let Some(period) = detect_current_period(subjects) else {
        return Vec::new();
    };

    subjects
        .iter()
        .map(|subject| {
            let (attended, total) = subject
                .bucket(period)
                .map(|bucket| {
                    (
                        parse_count(&bucket.attended_period),
                        parse_count(&bucket.total_period),
                    )
                })
                .unwrap_or((0, 0));
            let classification = thresholds.classify(attended, total);
            SubjectAttendanceMetric {
                subject_code: subject.subject_code.clone(),
                attended,
                total,
                percentage: classification.percentage,
                status: classification.status,
            }
        })
        .collect()
}
