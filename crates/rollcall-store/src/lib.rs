//! rollcall-store — SQLite implementation of [`AttendanceStore`].
//!
//! Besides the operations the tracking loop needs, the store exposes the
//! enrollment and review operations used by the `rollcall` admin CLI.
//!
//! [`AttendanceStore`]: rollcall_core::AttendanceStore

mod schema;
pub mod sqlite;

pub use sqlite::{SqliteStore, StaffMember, UnknownEntrySummary};
