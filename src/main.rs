use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use campus_record_core::attendance::{
    AttendanceQueryEngine, AttendanceSessionWriter, Correction, MarkAttendance, RollCallEntry,
};
use campus_record_core::calendar::DateRange;
use campus_record_core::config::CoreConfig;
use campus_record_core::db::{self, PgStore};
use campus_record_core::models::AttendanceStatus;
use campus_record_core::monitor::AttendanceMonitor;
use campus_record_core::notify::{
    LastKnownStatus, NotificationInbox, NotificationTrigger, StoreNotificationSink,
};
use campus_record_core::report;
use campus_record_core::results::ResultsReader;
use campus_record_core::store::RecordStore;
use campus_record_core::sync::RealtimeSyncBroker;

const DEFAULT_LOG_FILTER: &str = "campus_record_core=info,campus_records=info";

#[derive(Parser)]
#[command(name = "campus-records")]
#[command(about = "Attendance, results and early-warning records for a campus", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo section with attendance and results
    Seed,
    /// Import exam results from a CSV file
    ImportResults {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Record a roll call from a roster CSV
    Mark {
        #[arg(long)]
        section: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        subject_name: String,
        #[arg(long)]
        period: u32,
        #[arg(long)]
        marked_by: String,
        /// Defaults to today on the campus calendar
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Columns: student_id,student_name,register_no,status,remarks
        #[arg(long)]
        roster: PathBuf,
    },
    /// Change the status of one attendance record
    Correct {
        #[arg(long)]
        record: String,
        #[arg(long)]
        status: AttendanceStatus,
        #[arg(long)]
        by: String,
        #[arg(long)]
        remarks: Option<String>,
    },
    /// Attendance statistics for a student
    Stats {
        #[arg(long)]
        student: String,
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },
    /// Most recent roll calls
    Sessions {
        #[arg(long)]
        section: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Students below the attendance threshold
    Low {
        #[arg(long)]
        section: String,
        #[arg(long)]
        threshold: Option<u32>,
    },
    /// CGPA and per-semester SGPA for a student
    Cgpa {
        #[arg(long)]
        student: String,
    },
    /// Generate a markdown report for a section
    Report {
        #[arg(long)]
        section: String,
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Watch a section and raise notifications until interrupted
    Watch {
        #[arg(long)]
        section: String,
        /// JSON file holding the last known statuses between runs
        #[arg(long)]
        state: Option<PathBuf>,
    },
    /// List a user's notifications
    Inbox {
        #[arg(long)]
        user: String,
        #[arg(long)]
        unread: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Mark a notification as read
    MarkRead {
        #[arg(long)]
        id: String,
        #[arg(long)]
        reader: String,
    },
}

fn read_roster(path: &Path) -> anyhow::Result<Vec<RollCallEntry>> {
    #[derive(serde::Deserialize)]
    struct RosterRow {
        student_id: String,
        student_name: String,
        register_no: Option<String>,
        status: String,
        remarks: Option<String>,
    }

    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open roster {}", path.display()))?;
    let mut entries = Vec::new();
    for (line, row) in reader.deserialize::<RosterRow>().enumerate() {
        let row = row.with_context(|| format!("invalid roster row {}", line + 2))?;
        let status = row
            .status
            .parse::<AttendanceStatus>()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("invalid roster row {}", line + 2))?;
        entries.push(RollCallEntry {
            student_id: row.student_id,
            student_name: row.student_name,
            register_no: row.register_no.unwrap_or_default(),
            status,
            remarks: row.remarks.filter(|r| !r.trim().is_empty()),
        });
    }
    Ok(entries)
}

fn date_range(from: Option<NaiveDate>, to: Option<NaiveDate>) -> anyhow::Result<Option<DateRange>> {
    match (from, to) {
        (Some(from), Some(to)) => Ok(Some(DateRange::new(from, to)?)),
        _ => Ok(None),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = CoreConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    config.validate()?;
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    if let Commands::InitDb = cli.command {
        db::init_db(&pool).await?;
        println!("Schema ready.");
        return Ok(());
    }

    let calendar = config.calendar()?;
    let store: Arc<dyn RecordStore> = Arc::new(PgStore::new(
        pool,
        config.change_feed_capacity,
        config.retry.clone(),
    ));
    let engine = AttendanceQueryEngine::new(store.clone(), calendar, config.thresholds);

    match cli.command {
        Commands::InitDb => {}
        Commands::Seed => {
            let summary = db::seed(store.clone(), calendar).await?;
            println!(
                "Seed data inserted: {} sessions ({} already present), {} results.",
                summary.sessions_created, summary.sessions_skipped, summary.results
            );
        }
        Commands::ImportResults { csv } => {
            let inserted = db::import_results_csv(store.as_ref(), &csv).await?;
            println!("Inserted {inserted} results from {}.", csv.display());
        }
        Commands::Mark {
            section,
            subject,
            subject_name,
            period,
            marked_by,
            date,
            roster,
        } => {
            let records = read_roster(&roster)?;
            let writer = AttendanceSessionWriter::new(store.clone(), calendar, config.retry.clone());
            let session_id = writer
                .mark_attendance(MarkAttendance {
                    date: date.unwrap_or_else(|| calendar.today()),
                    subject_id: subject,
                    subject_name,
                    section_id: section,
                    period,
                    marked_by,
                    records,
                })
                .await?;
            println!("Attendance recorded as session {session_id}.");
        }
        Commands::Correct {
            record,
            status,
            by,
            remarks,
        } => {
            let writer = AttendanceSessionWriter::new(store.clone(), calendar, config.retry.clone());
            let updated = writer
                .correct_record(
                    &record,
                    Correction {
                        status,
                        remarks,
                        corrected_by: by,
                    },
                )
                .await?;
            println!(
                "{} is now {} for {} period {}.",
                updated.student_name, updated.status, updated.subject_name, updated.period
            );
        }
        Commands::Stats { student, from, to } => {
            let stats = engine
                .get_student_stats(&student, date_range(from, to)?)
                .await?;
            if stats.total == 0 && stats.excused == 0 {
                println!("No attendance recorded for {student}.");
                return Ok(());
            }
            println!(
                "{}: {}% ({} of {} classes, {} excused) {}",
                stats.student_id, stats.percentage, stats.attended, stats.total, stats.excused, stats.status
            );
            for subject in stats.subjects.iter() {
                println!(
                    "- {}: {}% ({} of {}) {}",
                    subject.subject_code, subject.percentage, subject.attended, subject.total, subject.status
                );
            }
        }
        Commands::Sessions { section, limit } => {
            let sessions = engine.get_sessions(section.as_deref(), limit).await?;
            if sessions.is_empty() {
                println!("No sessions recorded.");
                return Ok(());
            }
            for session in sessions.iter() {
                println!(
                    "- {} {} period {} {} ({}): {}/{} present, {} late, {} absent",
                    session.date.with_timezone(&calendar.offset()).format("%Y-%m-%d"),
                    session.section_id,
                    session.period,
                    session.subject_name,
                    session.id,
                    session.present_count,
                    session.total_students,
                    session.late_count,
                    session.absent_count
                );
            }
        }
        Commands::Low { section, threshold } => {
            let threshold = threshold.unwrap_or(config.low_attendance_threshold);
            let students = engine.get_low_attendance_students(&section, threshold).await?;
            if students.is_empty() {
                println!("No students in {section} below {threshold}%.");
                return Ok(());
            }
            println!("Students in {section} below {threshold}%:");
            for student in students.iter() {
                println!(
                    "- {} ({}) {}% ({} of {})",
                    student.student_name, student.register_no, student.percentage, student.attended, student.total
                );
            }
        }
        Commands::Cgpa { student } => {
            let calc = ResultsReader::new(store.clone())
                .cgpa_for_student(&student)
                .await?;
            if calc.total_credits == 0 {
                println!("No results published for {student}.");
                return Ok(());
            }
            println!(
                "{student}: CGPA {:.2} over {} credits",
                calc.cgpa, calc.total_credits
            );
            for semester in calc.sgpa.iter() {
                println!(
                    "- semester {}: SGPA {:.2} ({} credits)",
                    semester.semester, semester.sgpa, semester.credits
                );
            }
        }
        Commands::Report {
            section,
            from,
            to,
            out,
        } => {
            let range = date_range(from, to)?;
            let mut records = engine.section_records(&section).await?;
            let mut sessions = engine.get_sessions(Some(&section), usize::MAX).await?;
            if let Some(range) = range {
                let window = calendar.window(range);
                records.retain(|r| r.date >= window.start && r.date <= window.end);
                sessions.retain(|s| s.date >= window.start && s.date <= window.end);
            }
            let report = report::build_section_report(
                &section,
                range,
                &records,
                &sessions,
                &config.thresholds,
                config.low_attendance_threshold,
            );
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Watch { section, state } => {
            let last_known = match state.as_deref() {
                Some(path) if path.exists() => {
                    let saved = std::fs::read_to_string(path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    serde_json::from_str(&saved)
                        .with_context(|| format!("invalid state file {}", path.display()))?
                }
                _ => LastKnownStatus::new(),
            };

            let monitor = AttendanceMonitor::new(
                RealtimeSyncBroker::new(store.clone(), config.retry.clone()),
                config.thresholds,
                NotificationTrigger::new(config.notify_at),
                Arc::new(StoreNotificationSink::new(store.clone())),
            );
            let handle = monitor.watch_section(&section, last_known);
            println!("Watching {section}; press Ctrl-C to stop.");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;

            let last_known = handle.stop().await;
            if let Some(path) = state {
                std::fs::write(&path, serde_json::to_string_pretty(&last_known)?)
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }
            println!("Stopped watching {section}.");
        }
        Commands::Inbox {
            user,
            unread,
            limit,
        } => {
            let notifications = NotificationInbox::new(store.clone())
                .list(&user, unread, limit)
                .await?;
            if notifications.is_empty() {
                println!("No notifications for {user}.");
                return Ok(());
            }
            for notification in notifications.iter() {
                println!(
                    "- [{}] {} {}: {}",
                    if notification.read { "read" } else { "new" },
                    notification.id,
                    notification.title,
                    notification.body
                );
            }
        }
        Commands::MarkRead { id, reader } => {
            NotificationInbox::new(store.clone())
                .mark_read(&id, &reader)
                .await?;
            println!("Notification {id} marked read.");
        }
    }

    Ok(())
}
