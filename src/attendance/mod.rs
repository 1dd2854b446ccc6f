//! Attendance sessions: the atomic roll-call writer and the read side.

pub mod query;
pub mod writer;

pub use query::{AttendanceQueryEngine, DEFAULT_LOW_ATTENDANCE_THRESHOLD};
pub use writer::{
    session_id_for, AttendanceSessionWriter, Correction, MarkAttendance, RollCallEntry,
};
