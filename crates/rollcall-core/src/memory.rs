//! In-process [`AttendanceStore`] used by tests and dry runs.

use crate::matcher::{IdentityKind, IdentityRecord};
use crate::store::{
    AttendanceRecord, AttendanceStore, CheckIn, CheckInOutcome, CheckOutOutcome, NewUnknownEntry,
    StoreError,
};
use crate::types::Embedding;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct State {
    staff: BTreeMap<String, Vec<Embedding>>,
    customers: BTreeMap<String, Vec<Embedding>>,
    attendance: BTreeMap<(String, NaiveDate), AttendanceRecord>,
    unknown_entries: Vec<(i64, NewUnknownEntry)>,
    fail_writes: bool,
    writes: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_staff(&self, staff_id: &str, embeddings: Vec<Embedding>) {
        self.lock().staff.insert(staff_id.to_string(), embeddings);
    }

    pub fn remove_staff(&self, staff_id: &str) {
        self.lock().staff.remove(staff_id);
    }

    pub fn add_customer(&self, customer_id: &str, embeddings: Vec<Embedding>) {
        self.lock().customers.insert(customer_id.to_string(), embeddings);
    }

    /// Make every subsequent write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Number of successful mutating calls.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    pub fn attendance_rows(&self) -> Vec<AttendanceRecord> {
        self.lock().attendance.values().cloned().collect()
    }

    pub fn unknown_entries(&self) -> Vec<NewUnknownEntry> {
        self.lock()
            .unknown_entries
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn check_writable(state: &State) -> Result<(), StoreError> {
        if state.fail_writes {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

fn records(map: &BTreeMap<String, Vec<Embedding>>, kind: IdentityKind) -> Vec<IdentityRecord> {
    map.iter()
        .map(|(id, embeddings)| IdentityRecord::new(id.clone(), kind, embeddings.clone()))
        .collect()
}

impl AttendanceStore for MemoryStore {
    fn staff_gallery(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        Ok(records(&self.lock().staff, IdentityKind::Staff))
    }

    fn customer_gallery(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        Ok(records(&self.lock().customers, IdentityKind::Customer))
    }

    fn staff_exists(&self, staff_id: &str) -> Result<bool, StoreError> {
        Ok(self.lock().staff.contains_key(staff_id))
    }

    fn attendance(
        &self,
        staff_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        Ok(self
            .lock()
            .attendance
            .get(&(staff_id.to_string(), date))
            .cloned())
    }

    fn record_checkin(&self, checkin: &CheckIn) -> Result<CheckInOutcome, StoreError> {
        let mut state = self.lock();
        Self::check_writable(&state)?;

        let key = (checkin.staff_id.clone(), checkin.at.date());
        if state.attendance.contains_key(&key) {
            return Ok(CheckInOutcome::AlreadyCheckedIn);
        }
        state.attendance.insert(
            key,
            AttendanceRecord {
                staff_id: checkin.staff_id.clone(),
                date: checkin.at.date(),
                check_in_time: Some(checkin.at),
                check_out_time: None,
                confidence: checkin.confidence,
                status: Some(checkin.status),
                late_minutes: checkin.late_minutes,
                hours_worked: None,
            },
        );
        state.writes += 1;
        Ok(CheckInOutcome::Recorded)
    }

    fn record_checkout(
        &self,
        staff_id: &str,
        at: NaiveDateTime,
        _confidence: f64,
    ) -> Result<CheckOutOutcome, StoreError> {
        let mut state = self.lock();
        Self::check_writable(&state)?;

        let Some(row) = state.attendance.get_mut(&(staff_id.to_string(), at.date())) else {
            return Ok(CheckOutOutcome::NoCheckIn);
        };
        let Some(check_in) = row.check_in_time else {
            return Ok(CheckOutOutcome::NoCheckIn);
        };
        if row.check_out_time.is_some() {
            return Ok(CheckOutOutcome::AlreadyCheckedOut);
        }
        row.check_out_time = Some(at);
        row.hours_worked = Some((at - check_in).num_seconds() as f64 / 3600.0);
        state.writes += 1;
        Ok(CheckOutOutcome::Recorded)
    }

    fn record_unknown_entry(&self, entry: &NewUnknownEntry) -> Result<i64, StoreError> {
        let mut state = self.lock();
        Self::check_writable(&state)?;

        let id = state.unknown_entries.len() as i64 + 1;
        state.unknown_entries.push((id, entry.clone()));
        state.writes += 1;
        Ok(id)
    }
}
