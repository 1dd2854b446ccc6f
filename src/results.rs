use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::attendance::writer::ID_NAMESPACE;
use crate::error::{CoreError, Result};
use crate::models::{CgpaCalculation, ExamResult, SemesterGpa};
use crate::store::{Collection, Direction, Query, RecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Grade {
    O,
    APlus,
    A,
    BPlus,
    B,
    C,
    D,
    Ra,
    Sa,
    W,
    Ab,
}

impl Grade {
    pub fn points(self) -> u32 {
        match self {
            Grade::O => 10,
            Grade::APlus => 9,
            Grade::A => 8,
            Grade::BPlus => 7,
            Grade::B => 6,
            Grade::C => 5,
            Grade::D => 4,
            Grade::Ra | Grade::Sa | Grade::W | Grade::Ab => 0,
        }
    }

    /// D is the minimum passing grade.
    pub fn is_pass(self) -> bool {
        self.points() >= Grade::D.points()
    }
}

impl FromStr for Grade {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "O" => Ok(Grade::O),
            "A+" => Ok(Grade::APlus),
            "A" => Ok(Grade::A),
            "B+" => Ok(Grade::BPlus),
            "B" => Ok(Grade::B),
            "C" => Ok(Grade::C),
            "D" => Ok(Grade::D),
            "RA" => Ok(Grade::Ra),
            "SA" => Ok(Grade::Sa),
            "W" => Ok(Grade::W),
            "AB" => Ok(Grade::Ab),
            other => Err(format!("unknown grade '{other}'")),
        }
    }
}

/// One result per student, subject and semester; re-imports overwrite it.
pub fn result_id_for(student_id: &str, subject_code: &str, semester: u32) -> String {
    let key = format!("result|{student_id}|{subject_code}|{semester}");
    Uuid::new_v5(&ID_NAMESPACE, key.as_bytes()).to_string()
}

/// Credits of a result: the published value, else the legacy rule that lab
/// subjects weigh 2 and everything else 3.
pub fn credits_for(result: &ExamResult) -> u32 {
    result.credits.unwrap_or_else(|| {
        if result.subject_code.contains("LAB") {
            2
        } else {
            3
        }
    })
}

fn grade_points(result: &ExamResult) -> u32 {
    match result.grade.parse::<Grade>() {
        Ok(grade) => grade.points(),
        Err(err) => {
            warn!(
                student_id = %result.student_id,
                subject = %result.subject_code,
                "{err}; scoring as 0"
            );
            0
        }
    }
}

/// Upper bound on credits accepted for a single subject on import.
pub const MAX_SUBJECT_CREDITS: u32 = 30;

/// Rounds to two decimals, half away from zero.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn gpa(points: u32, credits: u32) -> f64 {
    if credits == 0 {
        0.0
    } else {
        round2(f64::from(points) / f64::from(credits))
    }
}

/// CGPA, per-semester SGPA in ascending semester order, and grade counts.
pub fn calculate_cgpa(results: &[ExamResult]) -> CgpaCalculation {
    let mut total_points = 0u32;
    let mut total_credits = 0u32;
    let mut semesters: HashMap<u32, (u32, u32)> = HashMap::new();
    let mut grade_distribution: BTreeMap<String, u32> = BTreeMap::new();

    for result in results {
        let credits = credits_for(result);
        let points = grade_points(result).saturating_mul(credits);
        total_points = total_points.saturating_add(points);
        total_credits = total_credits.saturating_add(credits);

        let entry = semesters.entry(result.semester).or_insert((0, 0));
        entry.0 = entry.0.saturating_add(points);
        entry.1 = entry.1.saturating_add(credits);

        *grade_distribution
            .entry(result.grade.trim().to_ascii_uppercase())
            .or_insert(0) += 1;
    }

    let mut sgpa: Vec<SemesterGpa> = semesters
        .into_iter()
        .map(|(semester, (points, credits))| SemesterGpa {
            semester,
            sgpa: gpa(points, credits),
            credits,
        })
        .collect();
    sgpa.sort_by_key(|s| s.semester);

    CgpaCalculation {
        cgpa: gpa(total_points, total_credits),
        sgpa,
        total_credits,
        total_points,
        grade_distribution,
    }
}

/// Read-only access to published exam results.
pub struct ResultsReader {
    store: Arc<dyn RecordStore>,
}

impl ResultsReader {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn for_student(&self, student_id: &str) -> Result<Vec<ExamResult>> {
        let query = Query::new(Collection::Results)
            .eq("studentId", student_id)
            .order_by("semester", Direction::Asc)
            .order_by("subjectCode", Direction::Asc);
        self.store
            .query(&query)
            .await?
            .iter()
            .map(|doc| doc.decode().map_err(CoreError::from))
            .collect()
    }

    pub async fn cgpa_for_student(&self, student_id: &str) -> Result<CgpaCalculation> {
        let results = self.for_student(student_id).await?;
        Ok(calculate_cgpa(&results))
    }
}
