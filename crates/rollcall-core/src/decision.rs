//! Event decision engine — turns per-frame evidence into a few durable writes.
//!
//! Per track: `New → Classifying → ConfirmedStaff | ConfirmedUnknown`.
//! Confirmed staff produce at most one check-in and one check-out per staff
//! member per day. Confirmed unknowns produce unknown-entry snapshots no
//! more often than the recapture interval. Store failures are logged and
//! never abort the caller; the next eligible window retries.

use crate::frame::Frame;
use crate::matcher::Identification;
use crate::store::{
    AttendanceStatus, AttendanceStore, CheckIn, CheckInOutcome, CheckOutOutcome, EntryType,
    NewUnknownEntry, SystemMode,
};
use crate::tracker::{Classification, Track, TrackKind, TrackState};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Minimum gap between snapshots of a track that never showed a face.
    pub recapture_no_face_ms: u64,
    /// Minimum gap between snapshots of a track with a face estimate.
    pub recapture_face_ms: u64,
    /// A motion-only track must live this long before it counts as a person.
    pub no_face_grace_ms: u64,
    /// Faces below this detector quality are treated as covered.
    pub min_face_quality: f32,
    pub jpeg_quality: u8,
    /// Margin added around the person box when cropping the snapshot.
    pub snapshot_padding: f32,
    /// Store the whole frame instead of the padded person crop.
    pub full_frame_snapshot: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            recapture_no_face_ms: 200,
            recapture_face_ms: 2000,
            no_face_grace_ms: 300,
            min_face_quality: 0.5,
            jpeg_quality: 85,
            snapshot_padding: 0.2,
            full_frame_snapshot: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttendanceConfig {
    /// Check-ins after this time are late.
    pub shift_start: NaiveTime,
    /// Minimum gap between store attempts for the same staff member.
    pub staff_retry_ms: u64,
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self {
            shift_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            staff_retry_ms: 3000,
        }
    }
}

/// What the pipeline learned about a track this frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Evidence {
    /// A usable face was embedded and identified.
    Face {
        detection_confidence: f32,
        identification: Identification,
    },
    /// A face was found but could not be embedded reliably.
    CoveredFace { detection_confidence: f32 },
    /// Motion update with no face.
    NoFace,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Evidence does not apply to this track.
    Ignored,
    /// Not enough to act on yet.
    Pending,
    CheckedIn {
        staff_id: String,
        status: AttendanceStatus,
        late_minutes: u32,
    },
    CheckedOut { staff_id: String },
    /// Today's event for this mode already exists; nothing written.
    AlreadyRecorded { staff_id: String },
    /// Check-out requested without a check-in today; nothing written.
    NoCheckIn { staff_id: String },
    /// A store attempt for this staff member was made too recently.
    Debounced { staff_id: String },
    UnknownCaptured { entry_id: i64, entry_type: EntryType },
    CaptureThrottled,
    WriteFailed,
}

/// Per staff member, per day, for the engine's mode.
#[derive(Debug, Clone, Copy)]
struct StaffDay {
    date: NaiveDate,
    resolved: bool,
    last_attempt: Option<NaiveDateTime>,
}

pub struct DecisionEngine {
    store: Arc<dyn AttendanceStore>,
    mode: SystemMode,
    capture: CaptureConfig,
    attendance: AttendanceConfig,
    ledger: HashMap<String, StaffDay>,
}

impl DecisionEngine {
    pub fn new(
        store: Arc<dyn AttendanceStore>,
        mode: SystemMode,
        capture: CaptureConfig,
        attendance: AttendanceConfig,
    ) -> Self {
        Self {
            store,
            mode,
            capture,
            attendance,
            ledger: HashMap::new(),
        }
    }

    pub fn mode(&self) -> SystemMode {
        self.mode
    }

    /// Apply one piece of evidence to `track`.
    pub fn observe(
        &mut self,
        track: &mut Track,
        evidence: Evidence,
        frame: &Frame,
        now: NaiveDateTime,
    ) -> Outcome {
        if track.state == TrackState::New {
            track.state = TrackState::Classifying;
        }

        match evidence {
            Evidence::Face {
                detection_confidence,
                identification,
            } => match identification {
                Identification::Staff {
                    staff_id,
                    confidence,
                } => self.on_staff(track, staff_id, confidence, now),
                Identification::TentativeStaff { staff_id, .. } => {
                    tracing::trace!(track_id = track.id, staff_id = %staff_id, "tentative staff match");
                    Outcome::Pending
                }
                Identification::Customer {
                    customer_id,
                    confidence,
                } => {
                    if track.state == TrackState::ConfirmedStaff {
                        return Outcome::Ignored;
                    }
                    track.classification = Classification::Customer;
                    self.on_unknown(
                        track,
                        EntryType::UnknownPerson,
                        format!("recognized customer {customer_id}, not staff"),
                        detection_confidence,
                        confidence,
                        frame,
                        now,
                    )
                }
                Identification::Unknown { best_similarity } => {
                    if track.state == TrackState::ConfirmedStaff {
                        return Outcome::Ignored;
                    }
                    track.classification = Classification::Unknown;
                    self.on_unknown(
                        track,
                        EntryType::UnknownPerson,
                        format!("no staff match (best similarity {best_similarity:.2})"),
                        detection_confidence,
                        best_similarity,
                        frame,
                        now,
                    )
                }
            },
            Evidence::CoveredFace {
                detection_confidence,
            } => {
                if track.state == TrackState::ConfirmedStaff {
                    return Outcome::Ignored;
                }
                track.classification = Classification::Unknown;
                self.on_unknown(
                    track,
                    EntryType::CoveredFace,
                    "face detected but not recognizable".to_string(),
                    detection_confidence,
                    0.0,
                    frame,
                    now,
                )
            }
            Evidence::NoFace => {
                // Once a face has been seen, face evidence governs the track.
                if track.kind == TrackKind::Face || track.state == TrackState::ConfirmedStaff {
                    return Outcome::Ignored;
                }
                let grace = Duration::milliseconds(self.capture.no_face_grace_ms as i64);
                if track.age(now) < grace {
                    return Outcome::Pending;
                }
                track.classification = Classification::Unknown;
                self.on_unknown(
                    track,
                    EntryType::NoFace,
                    "person detected without a visible face".to_string(),
                    0.0,
                    0.0,
                    frame,
                    now,
                )
            }
        }
    }

    fn on_staff(
        &mut self,
        track: &mut Track,
        staff_id: String,
        confidence: f32,
        now: NaiveDateTime,
    ) -> Outcome {
        let already_confirmed = track.state == TrackState::ConfirmedStaff
            && track.staff_id.as_deref() == Some(staff_id.as_str());

        if !already_confirmed {
            // The gallery may be stale; only the store can confirm.
            match self.store.staff_exists(&staff_id) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(
                        track_id = track.id,
                        staff_id = %staff_id,
                        "matched staff is not enrolled in the store; not confirming"
                    );
                    return Outcome::Pending;
                }
                Err(e) => {
                    tracing::warn!(
                        track_id = track.id,
                        staff_id = %staff_id,
                        error = %e,
                        "staff lookup failed; not confirming"
                    );
                    return Outcome::Pending;
                }
            }
            tracing::info!(
                track_id = track.id,
                staff_id = %staff_id,
                confidence,
                "track confirmed as staff"
            );
            track.state = TrackState::ConfirmedStaff;
            track.classification = Classification::Staff;
            track.staff_id = Some(staff_id.clone());
        }

        track.confidence = confidence;
        self.record_attendance(&staff_id, confidence, now)
    }

    fn record_attendance(&mut self, staff_id: &str, confidence: f32, now: NaiveDateTime) -> Outcome {
        let date = now.date();
        let retry = Duration::milliseconds(self.attendance.staff_retry_ms as i64);

        let day = self
            .ledger
            .entry(staff_id.to_string())
            .or_insert(StaffDay {
                date,
                resolved: false,
                last_attempt: None,
            });
        if day.date != date {
            *day = StaffDay {
                date,
                resolved: false,
                last_attempt: None,
            };
        }
        if day.resolved {
            return Outcome::AlreadyRecorded {
                staff_id: staff_id.to_string(),
            };
        }
        if let Some(last) = day.last_attempt {
            if now - last < retry {
                return Outcome::Debounced {
                    staff_id: staff_id.to_string(),
                };
            }
        }
        day.last_attempt = Some(now);

        let confidence = store_confidence(confidence);
        let (outcome, resolved) = match self.mode {
            SystemMode::CheckIn => self.check_in(staff_id, confidence, now),
            SystemMode::CheckOut => self.check_out(staff_id, confidence, now),
        };

        if resolved {
            if let Some(day) = self.ledger.get_mut(staff_id) {
                day.resolved = true;
            }
        }
        outcome
    }

    fn check_in(&self, staff_id: &str, confidence: f64, now: NaiveDateTime) -> (Outcome, bool) {
        let already = || Outcome::AlreadyRecorded {
            staff_id: staff_id.to_string(),
        };

        match self.store.attendance(staff_id, now.date()) {
            Ok(Some(row)) if row.check_in_time.is_some() => return (already(), true),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(staff_id, error = %e, "attendance lookup failed");
                return (Outcome::WriteFailed, false);
            }
        }

        let (status, late_minutes) = self.lateness(now.time());
        let checkin = CheckIn {
            staff_id: staff_id.to_string(),
            at: now,
            confidence,
            status,
            late_minutes,
        };

        match self.store.record_checkin(&checkin) {
            Ok(CheckInOutcome::Recorded) => {
                tracing::info!(
                    staff_id,
                    at = %now.time(),
                    status = status.as_str(),
                    late_minutes,
                    confidence,
                    "staff checked in"
                );
                (
                    Outcome::CheckedIn {
                        staff_id: staff_id.to_string(),
                        status,
                        late_minutes,
                    },
                    true,
                )
            }
            Ok(CheckInOutcome::AlreadyCheckedIn) => (already(), true),
            Err(e) => {
                tracing::warn!(staff_id, error = %e, "failed to record check-in");
                (Outcome::WriteFailed, false)
            }
        }
    }

    fn check_out(&self, staff_id: &str, confidence: f64, now: NaiveDateTime) -> (Outcome, bool) {
        let no_check_in = || Outcome::NoCheckIn {
            staff_id: staff_id.to_string(),
        };

        match self.store.attendance(staff_id, now.date()) {
            Ok(Some(row)) if row.check_in_time.is_some() => {
                if row.check_out_time.is_some() {
                    return (
                        Outcome::AlreadyRecorded {
                            staff_id: staff_id.to_string(),
                        },
                        true,
                    );
                }
            }
            Ok(_) => {
                tracing::debug!(staff_id, "check-out without a check-in today; skipping");
                return (no_check_in(), false);
            }
            Err(e) => {
                tracing::warn!(staff_id, error = %e, "attendance lookup failed");
                return (Outcome::WriteFailed, false);
            }
        }

        match self.store.record_checkout(staff_id, now, confidence) {
            Ok(CheckOutOutcome::Recorded) => {
                tracing::info!(staff_id, at = %now.time(), confidence, "staff checked out");
                (
                    Outcome::CheckedOut {
                        staff_id: staff_id.to_string(),
                    },
                    true,
                )
            }
            Ok(CheckOutOutcome::AlreadyCheckedOut) => (
                Outcome::AlreadyRecorded {
                    staff_id: staff_id.to_string(),
                },
                true,
            ),
            Ok(CheckOutOutcome::NoCheckIn) => (no_check_in(), false),
            Err(e) => {
                tracing::warn!(staff_id, error = %e, "failed to record check-out");
                (Outcome::WriteFailed, false)
            }
        }
    }

    /// Whole minutes past shift start; a check-in within the first minute is on time.
    fn lateness(&self, at: NaiveTime) -> (AttendanceStatus, u32) {
        let minutes = (at - self.attendance.shift_start).num_minutes();
        if minutes > 0 {
            (AttendanceStatus::Late, minutes as u32)
        } else {
            (AttendanceStatus::OnTime, 0)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_unknown(
        &mut self,
        track: &mut Track,
        entry_type: EntryType,
        reason: String,
        detection_confidence: f32,
        recognition_confidence: f32,
        frame: &Frame,
        now: NaiveDateTime,
    ) -> Outcome {
        if track.state != TrackState::ConfirmedUnknown {
            tracing::debug!(track_id = track.id, entry_type = %entry_type, "track confirmed unknown");
            track.state = TrackState::ConfirmedUnknown;
        }
        track.confidence = recognition_confidence;

        let interval = if track.has_face() {
            self.capture.recapture_face_ms
        } else {
            self.capture.recapture_no_face_ms
        };
        if let Some(last) = track.last_capture_time {
            if now - last < Duration::milliseconds(interval as i64) {
                return Outcome::CaptureThrottled;
            }
        }

        // The window is consumed even if the write below fails.
        track.last_capture_time = Some(now);
        track.captures += 1;

        let crop = if self.capture.full_frame_snapshot {
            None
        } else {
            let area = track
                .bounding_box
                .expanded(self.capture.snapshot_padding, frame.width, frame.height);
            frame.crop(&area)
        };
        let snapshot = crop.as_ref().unwrap_or(frame);
        let image = match snapshot.encode_jpeg(self.capture.jpeg_quality) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(track_id = track.id, error = %e, "failed to encode snapshot");
                return Outcome::WriteFailed;
            }
        };

        let entry = NewUnknownEntry {
            track_id: track.id,
            entry_type,
            image,
            detection_confidence: store_confidence(detection_confidence),
            recognition_confidence: store_confidence(recognition_confidence),
            reason,
            system_mode: self.mode,
            detection_time: now,
            face_bbox: track.face_bounding_box,
            person_bbox: Some(track.bounding_box),
        };

        match self.store.record_unknown_entry(&entry) {
            Ok(entry_id) => {
                tracing::info!(
                    track_id = track.id,
                    entry_id,
                    entry_type = %entry_type,
                    reason = %entry.reason,
                    "unknown entry captured"
                );
                Outcome::UnknownCaptured {
                    entry_id,
                    entry_type,
                }
            }
            Err(e) => {
                tracing::warn!(track_id = track.id, error = %e, "failed to record unknown entry");
                Outcome::WriteFailed
            }
        }
    }
}

/// Convert a model score to the store's plain float, mapping NaN/inf to 0.
pub fn store_confidence(value: f32) -> f64 {
    if value.is_finite() {
        f64::from(value)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::test_support::gray_frame;
    use crate::memory::MemoryStore;
    use crate::tracker::{Detection, TrackRegistry, TrackerConfig};
    use crate::types::{BoundingBox, Embedding, FaceDetection, MotionBlob};
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32, ms: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .and_then(|d| d.and_hms_opt(h, m, s))
            .map(|t| t + Duration::milliseconds(ms))
            .unwrap()
    }

    fn store_with_s1() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.add_staff("S1", vec![Embedding::new(vec![1.0, 0.0, 0.0])]);
        store
    }

    fn engine(store: &Arc<MemoryStore>, mode: SystemMode) -> DecisionEngine {
        DecisionEngine::new(
            store.clone(),
            mode,
            CaptureConfig::default(),
            AttendanceConfig::default(),
        )
    }

    fn face_det() -> Detection {
        Detection::Face(FaceDetection {
            bbox: BoundingBox::new(20.0, 10.0, 16.0, 20.0),
            quality: 0.9,
        })
    }

    fn motion_det() -> Detection {
        Detection::Motion(MotionBlob {
            bbox: BoundingBox::new(10.0, 5.0, 40.0, 40.0),
            area_fraction: 0.3,
        })
    }

    fn staff_evidence(confidence: f32) -> Evidence {
        Evidence::Face {
            detection_confidence: 0.9,
            identification: Identification::Staff {
                staff_id: "S1".into(),
                confidence,
            },
        }
    }

    fn unknown_evidence() -> Evidence {
        Evidence::Face {
            detection_confidence: 0.9,
            identification: Identification::Unknown { best_similarity: 0.0 },
        }
    }

    #[test]
    fn test_checkin_scenario_creates_one_event() {
        let store = store_with_s1();
        let mut eng = engine(&store, SystemMode::CheckIn);
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let now = at(8, 55, 0, 0);
        let id = reg.update(&[face_det()], now)[0];
        let frame = gray_frame(64, 48, 120, 0);

        let out = eng.observe(reg.get_mut(id).unwrap(), staff_evidence(1.0), &frame, now);
        assert_eq!(
            out,
            Outcome::CheckedIn {
                staff_id: "S1".into(),
                status: AttendanceStatus::OnTime,
                late_minutes: 0
            }
        );

        let rows = store.attendance_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].staff_id, "S1");
        assert_eq!(rows[0].check_in_time, Some(now));
        assert_eq!(rows[0].check_out_time, None);
        assert!(store.unknown_entries().is_empty());

        let t = reg.get(id).unwrap();
        assert_eq!(t.state, TrackState::ConfirmedStaff);
        assert_eq!(t.staff_id.as_deref(), Some("S1"));
    }

    #[test]
    fn test_second_checkin_keeps_first_time() {
        let store = store_with_s1();
        let mut eng = engine(&store, SystemMode::CheckIn);
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let frame = gray_frame(64, 48, 120, 0);

        let first = at(8, 55, 0, 0);
        let id = reg.update(&[face_det()], first)[0];
        eng.observe(reg.get_mut(id).unwrap(), staff_evidence(0.9), &frame, first);

        // Same person, new track two minutes later.
        let later = at(8, 57, 0, 0);
        reg.evict_stale(later);
        let id = reg.update(&[face_det()], later)[0];
        let out = eng.observe(reg.get_mut(id).unwrap(), staff_evidence(0.95), &frame, later);
        assert_eq!(out, Outcome::AlreadyRecorded { staff_id: "S1".into() });

        let rows = store.attendance_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].check_in_time, Some(first));
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_checkin_idempotent_across_restart() {
        let store = store_with_s1();
        let frame = gray_frame(64, 48, 120, 0);
        let first = at(8, 55, 0, 0);

        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let id = reg.update(&[face_det()], first)[0];
        engine(&store, SystemMode::CheckIn).observe(
            reg.get_mut(id).unwrap(),
            staff_evidence(0.9),
            &frame,
            first,
        );

        // Fresh engine has an empty ledger and must consult the store.
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let later = at(8, 57, 0, 0);
        let id = reg.update(&[face_det()], later)[0];
        let out = engine(&store, SystemMode::CheckIn).observe(
            reg.get_mut(id).unwrap(),
            staff_evidence(0.9),
            &frame,
            later,
        );
        assert_eq!(out, Outcome::AlreadyRecorded { staff_id: "S1".into() });
        assert_eq!(store.attendance_rows()[0].check_in_time, Some(first));
    }

    #[test]
    fn test_late_checkin() {
        let store = store_with_s1();
        let mut eng = engine(&store, SystemMode::CheckIn);
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let now = at(9, 12, 30, 0);
        let id = reg.update(&[face_det()], now)[0];
        let out = eng.observe(
            reg.get_mut(id).unwrap(),
            staff_evidence(0.8),
            &gray_frame(64, 48, 120, 0),
            now,
        );
        assert_eq!(
            out,
            Outcome::CheckedIn {
                staff_id: "S1".into(),
                status: AttendanceStatus::Late,
                late_minutes: 12
            }
        );
    }

    #[test]
    fn test_checkout_without_checkin_writes_nothing() {
        let store = store_with_s1();
        let mut eng = engine(&store, SystemMode::CheckOut);
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let now = at(17, 30, 0, 0);
        let id = reg.update(&[face_det()], now)[0];
        let out = eng.observe(
            reg.get_mut(id).unwrap(),
            staff_evidence(0.9),
            &gray_frame(64, 48, 120, 0),
            now,
        );
        assert_eq!(out, Outcome::NoCheckIn { staff_id: "S1".into() });
        assert_eq!(store.write_count(), 0);
        assert!(store.attendance_rows().is_empty());
    }

    #[test]
    fn test_checkout_after_checkin() {
        let store = store_with_s1();
        let frame = gray_frame(64, 48, 120, 0);
        let mut reg = TrackRegistry::new(TrackerConfig::default());

        let morning = at(8, 30, 0, 0);
        let id = reg.update(&[face_det()], morning)[0];
        engine(&store, SystemMode::CheckIn).observe(
            reg.get_mut(id).unwrap(),
            staff_evidence(0.9),
            &frame,
            morning,
        );

        let mut eng = engine(&store, SystemMode::CheckOut);
        let evening = at(17, 0, 0, 0);
        reg.evict_stale(evening);
        let id = reg.update(&[face_det()], evening)[0];
        let out = eng.observe(reg.get_mut(id).unwrap(), staff_evidence(0.9), &frame, evening);
        assert_eq!(out, Outcome::CheckedOut { staff_id: "S1".into() });

        let row = &store.attendance_rows()[0];
        assert_eq!(row.check_in_time, Some(morning));
        assert_eq!(row.check_out_time, Some(evening));
        assert!((row.hours_worked.unwrap() - 8.5).abs() < 1e-9);

        // A second sighting does not move the check-out.
        let out = eng.observe(
            reg.get_mut(id).unwrap(),
            staff_evidence(0.9),
            &frame,
            evening + Duration::seconds(30),
        );
        assert_eq!(out, Outcome::AlreadyRecorded { staff_id: "S1".into() });
        assert_eq!(store.attendance_rows()[0].check_out_time, Some(evening));
    }

    #[test]
    fn test_stale_gallery_match_is_not_confirmed() {
        let store = store_with_s1();
        store.remove_staff("S1");
        let mut eng = engine(&store, SystemMode::CheckIn);
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let now = at(8, 55, 0, 0);
        let id = reg.update(&[face_det()], now)[0];
        let out = eng.observe(
            reg.get_mut(id).unwrap(),
            staff_evidence(0.9),
            &gray_frame(64, 48, 120, 0),
            now,
        );
        assert_eq!(out, Outcome::Pending);
        assert_eq!(reg.get(id).unwrap().state, TrackState::Classifying);
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn test_unknown_face_recaptures_every_interval() {
        let store = store_with_s1();
        let capture = CaptureConfig {
            recapture_face_ms: 200,
            ..CaptureConfig::default()
        };
        let mut eng = DecisionEngine::new(
            store.clone(),
            SystemMode::CheckIn,
            capture,
            AttendanceConfig::default(),
        );
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let frame = gray_frame(64, 48, 120, 0);

        // One second of continuous sightings at 20 Hz.
        for step in 0..=20i64 {
            let now = at(10, 0, 0, step * 50);
            let id = reg.update(&[face_det()], now)[0];
            eng.observe(reg.get_mut(id).unwrap(), unknown_evidence(), &frame, now);
        }

        let entries = store.unknown_entries();
        assert!(entries.len() == 5 || entries.len() == 6, "got {}", entries.len());
        assert!(entries.iter().all(|e| e.track_id == 1));
        assert!(entries.iter().all(|e| e.entry_type == EntryType::UnknownPerson));
        assert_eq!(reg.get(1).unwrap().state, TrackState::ConfirmedUnknown);
    }

    #[test]
    fn test_capture_count_is_bounded_by_interval() {
        let store = store_with_s1();
        let mut eng = engine(&store, SystemMode::CheckIn);
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let frame = gray_frame(64, 48, 120, 0);

        // Five seconds with a face: default face interval is 2 s.
        for step in 0..=100i64 {
            let now = at(10, 0, 0, step * 50);
            let id = reg.update(&[face_det()], now)[0];
            eng.observe(reg.get_mut(id).unwrap(), unknown_evidence(), &frame, now);
        }
        // ceil(5.0 / 2.0) + 1 = 4
        assert!(store.unknown_entries().len() <= 4);
        assert_eq!(store.unknown_entries().len(), 3);
    }

    #[test]
    fn test_motion_only_track_waits_for_grace_then_captures_no_face() {
        let store = store_with_s1();
        let mut eng = engine(&store, SystemMode::CheckOut);
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let frame = gray_frame(64, 48, 120, 0);

        let t0 = at(10, 0, 0, 0);
        let id = reg.update(&[motion_det()], t0)[0];
        assert_eq!(
            eng.observe(reg.get_mut(id).unwrap(), Evidence::NoFace, &frame, t0),
            Outcome::Pending
        );

        let t1 = at(10, 0, 0, 300);
        reg.update(&[motion_det()], t1);
        let out = eng.observe(reg.get_mut(id).unwrap(), Evidence::NoFace, &frame, t1);
        assert!(matches!(
            out,
            Outcome::UnknownCaptured { entry_type: EntryType::NoFace, .. }
        ));

        let entry = &store.unknown_entries()[0];
        assert_eq!(entry.system_mode, SystemMode::CheckOut);
        assert_eq!(entry.face_bbox, None);
        assert_eq!(entry.detection_confidence, 0.0);
        assert_eq!(&entry.image[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_snapshot_is_person_crop_unless_full_frame() {
        let frame = gray_frame(64, 48, 120, 0);
        let now = at(10, 0, 0, 0);
        let snapshot_size = |capture: CaptureConfig| {
            let store = store_with_s1();
            let mut eng = DecisionEngine::new(
                store.clone(),
                SystemMode::CheckIn,
                capture,
                AttendanceConfig::default(),
            );
            let mut reg = TrackRegistry::new(TrackerConfig::default());
            let id = reg.update(&[face_det()], now)[0];
            eng.observe(reg.get_mut(id).unwrap(), unknown_evidence(), &frame, now);
            let image = image::load_from_memory(&store.unknown_entries()[0].image).unwrap();
            (image.width(), image.height())
        };

        let (w, h) = snapshot_size(CaptureConfig::default());
        assert!(w < 64 && h < 48, "expected a crop, got {w}x{h}");

        let full = CaptureConfig {
            full_frame_snapshot: true,
            ..CaptureConfig::default()
        };
        assert_eq!(snapshot_size(full), (64, 48));
    }

    #[test]
    fn test_no_face_evidence_ignored_once_face_seen() {
        let store = store_with_s1();
        let mut eng = engine(&store, SystemMode::CheckIn);
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let frame = gray_frame(64, 48, 120, 0);

        let t0 = at(10, 0, 0, 0);
        let id = reg.update(&[motion_det()], t0)[0];
        reg.update(&[face_det()], at(10, 0, 0, 50));
        let out = eng.observe(
            reg.get_mut(id).unwrap(),
            Evidence::NoFace,
            &frame,
            at(10, 0, 1, 0),
        );
        assert_eq!(out, Outcome::Ignored);
        assert!(store.unknown_entries().is_empty());
    }

    #[test]
    fn test_confirmed_staff_is_not_recaptured_as_unknown() {
        let store = store_with_s1();
        let mut eng = engine(&store, SystemMode::CheckIn);
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let frame = gray_frame(64, 48, 120, 0);
        let now = at(8, 55, 0, 0);
        let id = reg.update(&[face_det()], now)[0];
        eng.observe(reg.get_mut(id).unwrap(), staff_evidence(0.9), &frame, now);

        let out = eng.observe(
            reg.get_mut(id).unwrap(),
            unknown_evidence(),
            &frame,
            now + Duration::seconds(1),
        );
        assert_eq!(out, Outcome::Ignored);
        assert!(store.unknown_entries().is_empty());
    }

    #[test]
    fn test_customer_is_captured_with_reason() {
        let store = store_with_s1();
        let mut eng = engine(&store, SystemMode::CheckIn);
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let now = at(11, 0, 0, 0);
        let id = reg.update(&[face_det()], now)[0];
        let out = eng.observe(
            reg.get_mut(id).unwrap(),
            Evidence::Face {
                detection_confidence: 0.8,
                identification: Identification::Customer {
                    customer_id: "C7".into(),
                    confidence: 0.72,
                },
            },
            &gray_frame(64, 48, 120, 0),
            now,
        );
        assert!(matches!(out, Outcome::UnknownCaptured { .. }));
        assert_eq!(reg.get(id).unwrap().classification, Classification::Customer);
        let entry = &store.unknown_entries()[0];
        assert!(entry.reason.contains("C7"));
        assert!((entry.recognition_confidence - 0.72).abs() < 1e-6);
    }

    #[test]
    fn test_tentative_staff_neither_writes_nor_captures() {
        let store = store_with_s1();
        let mut eng = engine(&store, SystemMode::CheckIn);
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let now = at(8, 55, 0, 0);
        let id = reg.update(&[face_det()], now)[0];
        let out = eng.observe(
            reg.get_mut(id).unwrap(),
            Evidence::Face {
                detection_confidence: 0.9,
                identification: Identification::TentativeStaff {
                    staff_id: "S1".into(),
                    confidence: 0.55,
                },
            },
            &gray_frame(64, 48, 120, 0),
            now,
        );
        assert_eq!(out, Outcome::Pending);
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn test_failed_unknown_write_retries_next_window() {
        let store = store_with_s1();
        let mut eng = engine(&store, SystemMode::CheckIn);
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let frame = gray_frame(64, 48, 120, 0);

        store.set_fail_writes(true);
        let t0 = at(10, 0, 0, 0);
        let id = reg.update(&[face_det()], t0)[0];
        let out = eng.observe(reg.get_mut(id).unwrap(), unknown_evidence(), &frame, t0);
        assert_eq!(out, Outcome::WriteFailed);
        let track = reg.get(id).unwrap();
        assert_eq!(track.state, TrackState::ConfirmedUnknown);
        assert_eq!(track.last_capture_time, Some(t0));

        store.set_fail_writes(false);
        let t1 = at(10, 0, 1, 0);
        assert_eq!(
            eng.observe(reg.get_mut(id).unwrap(), unknown_evidence(), &frame, t1),
            Outcome::CaptureThrottled
        );
        let t2 = at(10, 0, 2, 0);
        assert!(matches!(
            eng.observe(reg.get_mut(id).unwrap(), unknown_evidence(), &frame, t2),
            Outcome::UnknownCaptured { .. }
        ));
        assert_eq!(store.unknown_entries().len(), 1);
    }

    #[test]
    fn test_failed_checkin_retries_after_debounce() {
        let store = store_with_s1();
        let mut eng = engine(&store, SystemMode::CheckIn);
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let frame = gray_frame(64, 48, 120, 0);

        store.set_fail_writes(true);
        let t0 = at(8, 50, 0, 0);
        let id = reg.update(&[face_det()], t0)[0];
        assert_eq!(
            eng.observe(reg.get_mut(id).unwrap(), staff_evidence(0.9), &frame, t0),
            Outcome::WriteFailed
        );
        assert_eq!(reg.get(id).unwrap().state, TrackState::ConfirmedStaff);

        store.set_fail_writes(false);
        assert_eq!(
            eng.observe(
                reg.get_mut(id).unwrap(),
                staff_evidence(0.9),
                &frame,
                at(8, 50, 1, 0)
            ),
            Outcome::Debounced { staff_id: "S1".into() }
        );
        let t3 = at(8, 50, 3, 0);
        assert!(matches!(
            eng.observe(reg.get_mut(id).unwrap(), staff_evidence(0.9), &frame, t3),
            Outcome::CheckedIn { .. }
        ));
        assert_eq!(store.attendance_rows()[0].check_in_time, Some(t3));
    }

    #[test]
    fn test_store_confidence_is_plain_float() {
        assert_eq!(store_confidence(0.5), 0.5f64);
        assert_eq!(store_confidence(f32::NAN), 0.0);
        assert_eq!(store_confidence(f32::INFINITY), 0.0);
    }
}
