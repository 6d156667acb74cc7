use crate::schema::SCHEMA;
use chrono::{Local, NaiveDate, NaiveDateTime};
use rollcall_core::matcher::{IdentityKind, IdentityRecord};
use rollcall_core::store::{
    AttendanceRecord, AttendanceStore, CheckIn, CheckInOutcome, CheckOutOutcome, EntryType,
    NewUnknownEntry, StoreError, SystemMode,
};
use rollcall_core::types::{BoundingBox, Embedding};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// How long a write waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// Enrolled staff member as listed by [`SqliteStore::list_staff`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaffMember {
    pub staff_id: String,
    pub name: String,
    pub employee_id: Option<String>,
    pub is_active: bool,
    pub embeddings: usize,
    pub added_at: NaiveDateTime,
}

/// Unknown entry without its image, for review listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnknownEntrySummary {
    pub id: i64,
    pub track_id: i64,
    pub entry_type: EntryType,
    pub detection_time: NaiveDateTime,
    pub face_detected: bool,
    pub face_bbox: Option<BoundingBox>,
    pub person_bbox: Option<BoundingBox>,
    pub detection_confidence: f64,
    pub recognition_confidence: f64,
    pub reason: String,
    pub system_mode: SystemMode,
    pub is_processed: bool,
    pub image_bytes: usize,
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(StoreError::backend)?;
            }
        }
        let conn = Connection::open(path).map_err(StoreError::backend)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(StoreError::backend)?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(StoreError::backend)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(StoreError::backend)?;
        conn.execute_batch(SCHEMA).map_err(StoreError::backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enroll or re-enroll a staff member. Existing embeddings are replaced
    /// and a deactivated member is reactivated.
    pub fn add_staff(
        &self,
        staff_id: &str,
        name: &str,
        employee_id: Option<&str>,
        embeddings: &[Embedding],
    ) -> Result<(), StoreError> {
        validate_embeddings(staff_id, embeddings)?;
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(StoreError::backend)?;
        tx.execute(
            "INSERT INTO staff (staff_id, name, employee_id, added_at, is_active)
             VALUES (?1, ?2, ?3, ?4, 1)
             ON CONFLICT (staff_id) DO UPDATE SET
                 name = excluded.name,
                 employee_id = excluded.employee_id,
                 is_active = 1",
            params![staff_id, name, employee_id, Local::now().naive_local()],
        )
        .map_err(StoreError::backend)?;
        tx.execute("DELETE FROM staff_embeddings WHERE staff_id = ?1", params![staff_id])
            .map_err(StoreError::backend)?;
        for embedding in embeddings {
            tx.execute(
                "INSERT INTO staff_embeddings (staff_id, embedding) VALUES (?1, ?2)",
                params![staff_id, embedding.to_le_bytes()],
            )
            .map_err(StoreError::backend)?;
        }
        tx.commit().map_err(StoreError::backend)?;

        tracing::info!(staff_id, name, embeddings = embeddings.len(), "staff enrolled");
        Ok(())
    }

    /// Deactivate a staff member. Returns false if no such active member.
    pub fn remove_staff(&self, staff_id: &str) -> Result<bool, StoreError> {
        let changed = self
            .lock()
            .execute(
                "UPDATE staff SET is_active = 0 WHERE staff_id = ?1 AND is_active = 1",
                params![staff_id],
            )
            .map_err(StoreError::backend)?;
        if changed > 0 {
            tracing::info!(staff_id, "staff deactivated");
        }
        Ok(changed > 0)
    }

    pub fn list_staff(&self) -> Result<Vec<StaffMember>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT s.staff_id, s.name, s.employee_id, s.is_active, s.added_at,
                        (SELECT COUNT(*) FROM staff_embeddings e WHERE e.staff_id = s.staff_id)
                 FROM staff s
                 ORDER BY s.staff_id",
            )
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StaffMember {
                    staff_id: row.get(0)?,
                    name: row.get(1)?,
                    employee_id: row.get(2)?,
                    is_active: row.get(3)?,
                    added_at: row.get(4)?,
                    embeddings: row.get::<_, i64>(5)? as usize,
                })
            })
            .map_err(StoreError::backend)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::backend)
    }

    /// Enroll or re-enroll a known customer.
    pub fn add_customer(
        &self,
        customer_id: &str,
        name: Option<&str>,
        embeddings: &[Embedding],
    ) -> Result<(), StoreError> {
        validate_embeddings(customer_id, embeddings)?;
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(StoreError::backend)?;
        tx.execute(
            "INSERT INTO customers (customer_id, name, added_at, is_active)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT (customer_id) DO UPDATE SET name = excluded.name, is_active = 1",
            params![customer_id, name, Local::now().naive_local()],
        )
        .map_err(StoreError::backend)?;
        tx.execute(
            "DELETE FROM customer_embeddings WHERE customer_id = ?1",
            params![customer_id],
        )
        .map_err(StoreError::backend)?;
        for embedding in embeddings {
            tx.execute(
                "INSERT INTO customer_embeddings (customer_id, embedding) VALUES (?1, ?2)",
                params![customer_id, embedding.to_le_bytes()],
            )
            .map_err(StoreError::backend)?;
        }
        tx.commit().map_err(StoreError::backend)?;

        tracing::info!(customer_id, embeddings = embeddings.len(), "customer enrolled");
        Ok(())
    }

    pub fn remove_customer(&self, customer_id: &str) -> Result<bool, StoreError> {
        let changed = self
            .lock()
            .execute(
                "UPDATE customers SET is_active = 0 WHERE customer_id = ?1 AND is_active = 1",
                params![customer_id],
            )
            .map_err(StoreError::backend)?;
        Ok(changed > 0)
    }

    pub fn attendance_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "{ATTENDANCE_COLUMNS} WHERE date = ?1 ORDER BY check_in_time, staff_id"
            ))
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map(params![date], attendance_from_row)
            .map_err(StoreError::backend)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::backend)
    }

    /// Most recent entries first, optionally restricted to one day.
    pub fn list_unknown_entries(
        &self,
        date: Option<NaiveDate>,
        limit: usize,
    ) -> Result<Vec<UnknownEntrySummary>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, track_id, entry_type, detection_time, face_detected, face_bbox,
                        person_bbox, detection_confidence, recognition_confidence, reason,
                        system_mode, is_processed, length(image)
                 FROM unknown_entries
                 WHERE (?1 IS NULL OR date = ?1)
                 ORDER BY detection_time DESC, id DESC
                 LIMIT ?2",
            )
            .map_err(StoreError::backend)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let raw = stmt
            .query_map(params![date, limit], |row| {
                Ok(RawUnknownEntry {
                    id: row.get(0)?,
                    track_id: row.get(1)?,
                    entry_type: row.get(2)?,
                    detection_time: row.get(3)?,
                    face_detected: row.get(4)?,
                    face_bbox: row.get(5)?,
                    person_bbox: row.get(6)?,
                    detection_confidence: row.get(7)?,
                    recognition_confidence: row.get(8)?,
                    reason: row.get(9)?,
                    system_mode: row.get(10)?,
                    is_processed: row.get(11)?,
                    image_bytes: row.get(12)?,
                })
            })
            .map_err(StoreError::backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::backend)?;

        raw.into_iter().map(RawUnknownEntry::into_summary).collect()
    }

    pub fn unknown_entry_image(&self, id: i64) -> Result<Option<Vec<u8>>, StoreError> {
        self.lock()
            .query_row(
                "SELECT image FROM unknown_entries WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::backend)
    }

    pub fn mark_unknown_entry_processed(&self, id: i64) -> Result<bool, StoreError> {
        let changed = self
            .lock()
            .execute(
                "UPDATE unknown_entries SET is_processed = 1 WHERE id = ?1",
                params![id],
            )
            .map_err(StoreError::backend)?;
        Ok(changed > 0)
    }

    pub fn delete_unknown_entry(&self, id: i64) -> Result<bool, StoreError> {
        let changed = self
            .lock()
            .execute("DELETE FROM unknown_entries WHERE id = ?1", params![id])
            .map_err(StoreError::backend)?;
        if changed > 0 {
            tracing::info!(entry_id = id, "unknown entry deleted");
        }
        Ok(changed > 0)
    }

    fn gallery(&self, sql: &str, kind: IdentityKind) -> Result<Vec<IdentityRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql).map_err(StoreError::backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(StoreError::backend)?;

        // Rows arrive grouped by id.
        let mut grouped: Vec<(String, Vec<Embedding>)> = Vec::new();
        for row in rows {
            let (id, blob) = row.map_err(StoreError::backend)?;
            let Some(embedding) = Embedding::from_le_bytes(&blob) else {
                tracing::warn!(entity_id = %id, len = blob.len(), "skipping malformed embedding blob");
                continue;
            };
            match grouped.last_mut() {
                Some((last, list)) if *last == id => list.push(embedding),
                _ => grouped.push((id, vec![embedding])),
            }
        }

        Ok(grouped
            .into_iter()
            .map(|(id, embeddings)| IdentityRecord::new(id, kind, embeddings))
            .collect())
    }
}

const ATTENDANCE_COLUMNS: &str = "SELECT staff_id, date, check_in_time, check_out_time,
        recognition_confidence, status, late_minutes, hours_worked
 FROM staff_attendance";

fn attendance_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let status: Option<String> = row.get(5)?;
    let late_minutes: i64 = row.get(6)?;
    Ok(AttendanceRecord {
        staff_id: row.get(0)?,
        date: row.get(1)?,
        check_in_time: row.get(2)?,
        check_out_time: row.get(3)?,
        confidence: row.get(4)?,
        status: status.and_then(|s| s.parse().ok()),
        late_minutes: u32::try_from(late_minutes).unwrap_or(0),
        hours_worked: row.get(7)?,
    })
}

fn validate_embeddings(id: &str, embeddings: &[Embedding]) -> Result<(), StoreError> {
    if embeddings.is_empty() {
        return Err(StoreError::InvalidData(format!("{id}: no embeddings")));
    }
    if let Some(bad) = embeddings.iter().position(|e| e.normalized().is_none()) {
        return Err(StoreError::InvalidData(format!(
            "{id}: embedding {bad} is zero or not finite"
        )));
    }
    let dim = embeddings[0].dim();
    if embeddings.iter().any(|e| e.dim() != dim) {
        return Err(StoreError::InvalidData(format!(
            "{id}: embeddings have mixed dimensions"
        )));
    }
    Ok(())
}

struct RawUnknownEntry {
    id: i64,
    track_id: i64,
    entry_type: String,
    detection_time: NaiveDateTime,
    face_detected: bool,
    face_bbox: Option<String>,
    person_bbox: Option<String>,
    detection_confidence: f64,
    recognition_confidence: f64,
    reason: String,
    system_mode: String,
    is_processed: bool,
    image_bytes: i64,
}

impl RawUnknownEntry {
    fn into_summary(self) -> Result<UnknownEntrySummary, StoreError> {
        Ok(UnknownEntrySummary {
            id: self.id,
            track_id: self.track_id,
            entry_type: self.entry_type.parse().map_err(StoreError::InvalidData)?,
            detection_time: self.detection_time,
            face_detected: self.face_detected,
            face_bbox: parse_bbox(self.face_bbox.as_deref()),
            person_bbox: parse_bbox(self.person_bbox.as_deref()),
            detection_confidence: self.detection_confidence,
            recognition_confidence: self.recognition_confidence,
            reason: self.reason,
            system_mode: self.system_mode.parse().map_err(StoreError::InvalidData)?,
            is_processed: self.is_processed,
            image_bytes: usize::try_from(self.image_bytes).unwrap_or(0),
        })
    }
}

fn parse_bbox(text: Option<&str>) -> Option<BoundingBox> {
    text.and_then(|t| serde_json::from_str(t).ok())
}

fn bbox_json(bbox: Option<&BoundingBox>) -> Result<Option<String>, StoreError> {
    bbox.map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::backend)
}

impl AttendanceStore for SqliteStore {
    fn staff_gallery(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        self.gallery(
            "SELECT s.staff_id, e.embedding
             FROM staff s JOIN staff_embeddings e ON e.staff_id = s.staff_id
             WHERE s.is_active = 1
             ORDER BY s.staff_id, e.id",
            IdentityKind::Staff,
        )
    }

    fn customer_gallery(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        self.gallery(
            "SELECT c.customer_id, e.embedding
             FROM customers c JOIN customer_embeddings e ON e.customer_id = c.customer_id
             WHERE c.is_active = 1
             ORDER BY c.customer_id, e.id",
            IdentityKind::Customer,
        )
    }

    fn staff_exists(&self, staff_id: &str) -> Result<bool, StoreError> {
        self.lock()
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM staff WHERE staff_id = ?1 AND is_active = 1)",
                params![staff_id],
                |row| row.get(0),
            )
            .map_err(StoreError::backend)
    }

    fn attendance(
        &self,
        staff_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        self.lock()
            .query_row(
                &format!("{ATTENDANCE_COLUMNS} WHERE staff_id = ?1 AND date = ?2"),
                params![staff_id, date],
                attendance_from_row,
            )
            .optional()
            .map_err(StoreError::backend)
    }

    fn record_checkin(&self, checkin: &CheckIn) -> Result<CheckInOutcome, StoreError> {
        let date = checkin.at.date();
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(StoreError::backend)?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO staff_attendance
                     (staff_id, date, check_in_time, status, late_minutes, recognition_confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    checkin.staff_id,
                    date,
                    checkin.at,
                    checkin.status.as_str(),
                    checkin.late_minutes,
                    checkin.confidence,
                ],
            )
            .map_err(StoreError::backend)?;
        if inserted == 0 {
            return Ok(CheckInOutcome::AlreadyCheckedIn);
        }

        tx.execute(
            "INSERT INTO staff_checkins
                 (staff_id, date, check_time, status, late_minutes, recognition_confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                checkin.staff_id,
                date,
                checkin.at,
                checkin.status.as_str(),
                checkin.late_minutes,
                checkin.confidence,
            ],
        )
        .map_err(StoreError::backend)?;
        tx.commit().map_err(StoreError::backend)?;
        Ok(CheckInOutcome::Recorded)
    }

    fn record_checkout(
        &self,
        staff_id: &str,
        at: NaiveDateTime,
        confidence: f64,
    ) -> Result<CheckOutOutcome, StoreError> {
        let date = at.date();
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(StoreError::backend)?;

        let row: Option<(Option<NaiveDateTime>, Option<NaiveDateTime>)> = tx
            .query_row(
                "SELECT check_in_time, check_out_time FROM staff_attendance
                 WHERE staff_id = ?1 AND date = ?2",
                params![staff_id, date],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StoreError::backend)?;

        let check_in = match row {
            None | Some((None, _)) => return Ok(CheckOutOutcome::NoCheckIn),
            Some((Some(_), Some(_))) => return Ok(CheckOutOutcome::AlreadyCheckedOut),
            Some((Some(check_in), None)) => check_in,
        };
        let hours = (at - check_in).num_seconds().max(0) as f64 / 3600.0;

        tx.execute(
            "UPDATE staff_attendance
             SET check_out_time = ?3, hours_worked = ?4, checkout_confidence = ?5
             WHERE staff_id = ?1 AND date = ?2 AND check_out_time IS NULL",
            params![staff_id, date, at, hours, confidence],
        )
        .map_err(StoreError::backend)?;
        tx.commit().map_err(StoreError::backend)?;
        Ok(CheckOutOutcome::Recorded)
    }

    fn record_unknown_entry(&self, entry: &NewUnknownEntry) -> Result<i64, StoreError> {
        let face_bbox = bbox_json(entry.face_bbox.as_ref())?;
        let person_bbox = bbox_json(entry.person_bbox.as_ref())?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO unknown_entries
                 (track_id, entry_type, detection_time, date, image, face_bbox, person_bbox,
                  face_detected, detection_confidence, recognition_confidence, reason, system_mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.track_id as i64,
                entry.entry_type.as_str(),
                entry.detection_time,
                entry.detection_time.date(),
                entry.image,
                face_bbox,
                person_bbox,
                entry.face_bbox.is_some(),
                entry.detection_confidence,
                entry.recognition_confidence,
                entry.reason,
                entry.system_mode.as_str(),
            ],
        )
        .map_err(StoreError::backend)?;
        Ok(conn.last_insert_rowid())
    }
}
