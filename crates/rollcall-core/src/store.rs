//! Persistence interface consumed by the decision engine.
//!
//! All confidences cross this boundary as plain `f64`.

use crate::matcher::{Gallery, IdentityRecord};
use crate::types::BoundingBox;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("invalid stored data: {0}")]
    InvalidData(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

/// Which transition a station records for confirmed staff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemMode {
    #[serde(rename = "checkin")]
    CheckIn,
    #[serde(rename = "checkout")]
    CheckOut,
}

impl SystemMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SystemMode::CheckIn => "checkin",
            SystemMode::CheckOut => "checkout",
        }
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SystemMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "checkin" | "check_in" | "check-in" => Ok(SystemMode::CheckIn),
            "checkout" | "check_out" | "check-out" => Ok(SystemMode::CheckOut),
            other => Err(format!("unknown system mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// A face was seen and embedded but matched no staff member.
    UnknownPerson,
    /// A face was seen but was too poor to embed (mask, hand, hood, blur).
    CoveredFace,
    /// A person-sized moving body with no face.
    NoFace,
}

impl EntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::UnknownPerson => "unknown_person",
            EntryType::CoveredFace => "covered_face",
            EntryType::NoFace => "no_face",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown_person" => Ok(EntryType::UnknownPerson),
            "covered_face" => Ok(EntryType::CoveredFace),
            "no_face" => Ok(EntryType::NoFace),
            other => Err(format!("unknown entry type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    OnTime,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::OnTime => "on_time",
            AttendanceStatus::Late => "late",
        }
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_time" => Ok(AttendanceStatus::OnTime),
            "late" => Ok(AttendanceStatus::Late),
            other => Err(format!("unknown attendance status: {other}")),
        }
    }
}

/// One row per (staff_id, date).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub staff_id: String,
    pub date: NaiveDate,
    pub check_in_time: Option<NaiveDateTime>,
    pub check_out_time: Option<NaiveDateTime>,
    pub confidence: f64,
    pub status: Option<AttendanceStatus>,
    pub late_minutes: u32,
    pub hours_worked: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckIn {
    pub staff_id: String,
    pub at: NaiveDateTime,
    pub confidence: f64,
    pub status: AttendanceStatus,
    pub late_minutes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInOutcome {
    Recorded,
    /// A row already exists for the day; its check-in time was left as is.
    AlreadyCheckedIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutOutcome {
    Recorded,
    NoCheckIn,
    AlreadyCheckedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewUnknownEntry {
    pub track_id: u64,
    pub entry_type: EntryType,
    /// JPEG-encoded snapshot.
    pub image: Vec<u8>,
    pub detection_confidence: f64,
    pub recognition_confidence: f64,
    pub reason: String,
    pub system_mode: SystemMode,
    pub detection_time: NaiveDateTime,
    pub face_bbox: Option<BoundingBox>,
    pub person_bbox: Option<BoundingBox>,
}

pub trait AttendanceStore: Send + Sync {
    fn staff_gallery(&self) -> Result<Vec<IdentityRecord>, StoreError>;

    fn customer_gallery(&self) -> Result<Vec<IdentityRecord>, StoreError>;

    /// Whether `staff_id` is enrolled and active right now.
    fn staff_exists(&self, staff_id: &str) -> Result<bool, StoreError>;

    fn attendance(
        &self,
        staff_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError>;

    /// Create the day's row if absent. Never overwrites an existing check-in.
    fn record_checkin(&self, checkin: &CheckIn) -> Result<CheckInOutcome, StoreError>;

    /// Set the check-out time on a row that has a check-in and no check-out.
    fn record_checkout(
        &self,
        staff_id: &str,
        at: NaiveDateTime,
        confidence: f64,
    ) -> Result<CheckOutOutcome, StoreError>;

    /// Append an unknown entry and return its id.
    fn record_unknown_entry(&self, entry: &NewUnknownEntry) -> Result<i64, StoreError>;
}

/// Build a gallery from the store. A store that cannot be read yields an
/// empty partition rather than an error, so everyone is classified unknown
/// until the next reload succeeds.
pub fn load_gallery(store: &dyn AttendanceStore) -> Gallery {
    let staff = store.staff_gallery().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load staff gallery; continuing with none");
        Vec::new()
    });
    let customers = store.customer_gallery().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load customer gallery; continuing with none");
        Vec::new()
    });
    Gallery::new(staff, customers)
}
