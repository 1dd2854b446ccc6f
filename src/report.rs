use std::fmt::Write;

use crate::analytics::{self, RiskThresholds};
use crate::attendance::query::low_attendance;
use crate::calendar::DateRange;
use crate::models::{AttendanceRecord, AttendanceSession, RiskStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskMix {
    pub safe: usize,
    pub warning: usize,
    pub danger: usize,
}

/// Counts students of a section by their overall status.
pub fn summarize_risk_mix(records: &[AttendanceRecord], thresholds: &RiskThresholds) -> RiskMix {
    let mut mix = RiskMix::default();
    for (student_id, records) in analytics::group_by_student(records) {
        match analytics::student_stats(student_id, &records, thresholds).status {
            RiskStatus::Safe => mix.safe += 1,
            RiskStatus::Warning => mix.warning += 1,
            RiskStatus::Danger => mix.danger += 1,
        }
    }
    mix
}

pub fn build_section_report(
    section_id: &str,
    range: Option<DateRange>,
    records: &[AttendanceRecord],
    sessions: &[AttendanceSession],
    thresholds: &RiskThresholds,
    low_threshold: u32,
) -> String {
    let mix = summarize_risk_mix(records, thresholds);
    let subjects = analytics::subject_metrics(records, thresholds);
    let flagged = low_attendance(records, low_threshold);

    let mut output = String::new();
    let window = match range {
        Some(range) => format!("{} to {}", range.start(), range.end()),
        None => "all recorded dates".to_string(),
    };

    let _ = writeln!(output, "# Section Attendance Report");
    let _ = writeln!(output, "Generated for {} ({})", section_id, window);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Mix");

    if records.is_empty() {
        let _ = writeln!(output, "No attendance recorded for this window.");
    } else {
        let _ = writeln!(output, "- safe: {} students", mix.safe);
        let _ = writeln!(
            output,
            "- warning (below {}%): {} students",
            thresholds.warning, mix.warning
        );
        let _ = writeln!(
            output,
            "- danger (below {}%): {} students",
            thresholds.danger, mix.danger
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Subjects");

    if subjects.is_empty() {
        let _ = writeln!(output, "No subjects recorded for this window.");
    } else {
        for subject in subjects.iter() {
            let _ = writeln!(
                output,
                "- {}: {}% ({} of {} attendances, {})",
                subject.subject_code,
                subject.percentage,
                subject.attended,
                subject.total,
                subject.status
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Below {}%", low_threshold);

    if flagged.is_empty() {
        let _ = writeln!(output, "No students below the threshold.");
    } else {
        for student in flagged.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} ({}) {}% across {} classes",
                student.student_name, student.register_no, student.percentage, student.total
            );
        }
    }

    let mut recent = sessions.to_vec();
    recent.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| b.period.cmp(&a.period)));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Sessions");

    if recent.is_empty() {
        let _ = writeln!(output, "No sessions marked for this window.");
    } else {
        for session in recent.iter().take(5) {
            let _ = writeln!(
                output,
                "- {} period {} {}: {} present, {} late, {} absent ({} excused) of {}",
                session.date.format("%Y-%m-%d"),
                session.period,
                session.subject_name,
                session.present_count,
                session.late_count,
                session.absent_count,
                session.excused_count,
                session.total_students
            );
        }
    }

    output
}
