//! Track registry — persistent identities for people across frames.
//!
//! Motion blobs and face boxes arrive at different cadences and both write
//! into the same registry. A detection is associated with the live track it
//! overlaps most; unmatched detections spawn new tracks. A face that lands on
//! a motion-only track upgrades that track in place, so one person stays one
//! track however the detectors interleave.

use crate::types::{BoundingBox, FaceDetection, MotionBlob};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

pub type TrackId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Face,
    Motion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Pending,
    Staff,
    Customer,
    Unknown,
}

/// Decision state of a track. Owned by the registry, advanced by the
/// decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    New,
    Classifying,
    ConfirmedStaff,
    ConfirmedUnknown,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub kind: TrackKind,
    pub state: TrackState,
    pub classification: Classification,
    pub first_seen: NaiveDateTime,
    pub last_seen: NaiveDateTime,
    pub last_motion_seen: Option<NaiveDateTime>,
    pub last_capture_time: Option<NaiveDateTime>,
    /// Person-level box: the motion blob when one is known, else the face.
    pub bounding_box: BoundingBox,
    pub face_bounding_box: Option<BoundingBox>,
    pub staff_id: Option<String>,
    /// Recognition confidence of the latest identification.
    pub confidence: f32,
    pub captures: u32,
}

impl Track {
    fn spawn(id: TrackId, detection: &Detection, now: NaiveDateTime) -> Self {
        let mut track = Self {
            id,
            kind: detection.kind(),
            state: TrackState::New,
            classification: Classification::Pending,
            first_seen: now,
            last_seen: now,
            last_motion_seen: None,
            last_capture_time: None,
            bounding_box: detection.bbox(),
            face_bounding_box: None,
            staff_id: None,
            confidence: 0.0,
            captures: 0,
        };
        track.absorb(detection, now);
        track
    }

    fn absorb(&mut self, detection: &Detection, now: NaiveDateTime) {
        match detection {
            Detection::Face(face) => {
                if self.kind == TrackKind::Motion {
                    tracing::debug!(track_id = self.id, "motion track upgraded to face track");
                    self.kind = TrackKind::Face;
                }
                if self.last_motion_seen.is_none() {
                    self.bounding_box = face.bbox;
                }
                self.face_bounding_box = Some(face.bbox);
            }
            Detection::Motion(blob) => {
                self.bounding_box = blob.bbox;
                self.last_motion_seen = Some(now);
            }
        }
        self.last_seen = now;
    }

    /// Whether a face has been associated with this track.
    pub fn has_face(&self) -> bool {
        self.face_bounding_box.is_some()
    }

    pub fn age(&self, now: NaiveDateTime) -> Duration {
        now - self.first_seen
    }

    fn is_live(&self, now: NaiveDateTime, timeout: Duration) -> bool {
        now - self.last_seen <= timeout
    }

    /// How strongly `detection` overlaps this track, in [0, 1].
    fn affinity(&self, detection: &Detection) -> f32 {
        match detection {
            Detection::Face(face) => {
                let mut score = face
                    .bbox
                    .iou(&self.bounding_box)
                    .max(face.bbox.containment_in(&self.bounding_box));
                if let Some(prev) = &self.face_bounding_box {
                    score = score.max(face.bbox.iou(prev));
                }
                score
            }
            Detection::Motion(blob) => {
                let mut score = blob.bbox.iou(&self.bounding_box);
                if let Some(prev) = &self.face_bounding_box {
                    score = score.max(prev.containment_in(&blob.bbox));
                }
                score
            }
        }
    }
}

/// One detection fed into the registry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Detection {
    Face(FaceDetection),
    Motion(MotionBlob),
}

impl Detection {
    pub fn bbox(&self) -> BoundingBox {
        match self {
            Detection::Face(f) => f.bbox,
            Detection::Motion(m) => m.bbox,
        }
    }

    pub fn kind(&self) -> TrackKind {
        match self {
            Detection::Face(_) => TrackKind::Face,
            Detection::Motion(_) => TrackKind::Motion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum overlap score for a detection to continue a track.
    pub iou_threshold: f32,
    /// A track not updated for longer than this is evicted.
    pub inactivity_timeout_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            inactivity_timeout_ms: 3000,
        }
    }
}

impl TrackerConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::milliseconds(self.inactivity_timeout_ms as i64)
    }
}

pub struct TrackRegistry {
    tracks: BTreeMap<TrackId, Track>,
    next_id: TrackId,
    config: TrackerConfig,
}

impl TrackRegistry {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            tracks: BTreeMap::new(),
            next_id: 1,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn get_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.get_mut(&id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    /// Associate this frame's detections with live tracks.
    ///
    /// Returns the track id each detection was assigned to, index-aligned
    /// with `detections`. Assignment is greedy by descending overlap; each
    /// track takes at most one detection per call.
    pub fn update(&mut self, detections: &[Detection], now: NaiveDateTime) -> Vec<TrackId> {
        let timeout = self.config.inactivity_timeout();
        let threshold = self.config.iou_threshold;

        let mut candidates: Vec<(f32, usize, TrackId)> = Vec::new();
        for (det_idx, det) in detections.iter().enumerate() {
            for track in self.tracks.values().filter(|t| t.is_live(now, timeout)) {
                let score = track.affinity(det);
                if score > threshold {
                    candidates.push((score, det_idx, track.id));
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.cmp(&b.2))
                .then(a.1.cmp(&b.1))
        });

        let mut assigned: Vec<Option<TrackId>> = vec![None; detections.len()];
        let mut taken: HashSet<TrackId> = HashSet::new();
        for (_, det_idx, track_id) in candidates {
            if assigned[det_idx].is_some() || taken.contains(&track_id) {
                continue;
            }
            assigned[det_idx] = Some(track_id);
            taken.insert(track_id);
        }

        let mut ids = Vec::with_capacity(detections.len());
        for (det, slot) in detections.iter().zip(assigned) {
            let id = match slot {
                Some(id) => {
                    if let Some(track) = self.tracks.get_mut(&id) {
                        track.absorb(det, now);
                    }
                    id
                }
                None => self.spawn(det, now),
            };
            ids.push(id);
        }
        ids
    }

    fn spawn(&mut self, detection: &Detection, now: NaiveDateTime) -> TrackId {
        let id = self.next_id;
        self.next_id += 1;
        let track = Track::spawn(id, detection, now);
        tracing::debug!(track_id = id, kind = ?track.kind, "track spawned");
        self.tracks.insert(id, track);
        id
    }

    /// Remove tracks idle for longer than the inactivity timeout.
    /// Identifiers are never reused.
    pub fn evict_stale(&mut self, now: NaiveDateTime) -> Vec<Track> {
        let timeout = self.config.inactivity_timeout();
        let stale: Vec<TrackId> = self
            .tracks
            .values()
            .filter(|t| !t.is_live(now, timeout))
            .map(|t| t.id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.tracks.remove(&id))
            .inspect(|t| {
                tracing::debug!(
                    track_id = t.id,
                    state = ?t.state,
                    captures = t.captures,
                    "track evicted"
                );
            })
            .collect()
    }

    /// Drop every track, e.g. after the frame stream was reset.
    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::test_support::at_ms;

    fn motion(x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection::Motion(MotionBlob {
            bbox: BoundingBox::new(x, y, w, h),
            area_fraction: 0.05,
        })
    }

    fn face(x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection::Face(FaceDetection {
            bbox: BoundingBox::new(x, y, w, h),
            quality: 0.9,
        })
    }

    #[test]
    fn test_new_detection_spawns_track() {
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let ids = reg.update(&[motion(100.0, 100.0, 80.0, 200.0)], at_ms(0));
        assert_eq!(ids, vec![1]);
        let t = reg.get(1).unwrap();
        assert_eq!(t.kind, TrackKind::Motion);
        assert_eq!(t.state, TrackState::New);
        assert_eq!(t.classification, Classification::Pending);
    }

    #[test]
    fn test_overlapping_detection_continues_track() {
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        reg.update(&[motion(100.0, 100.0, 80.0, 200.0)], at_ms(0));
        let ids = reg.update(&[motion(105.0, 102.0, 80.0, 200.0)], at_ms(33));
        assert_eq!(ids, vec![1]);
        assert_eq!(reg.len(), 1);
        let t = reg.get(1).unwrap();
        assert_eq!(t.bounding_box, BoundingBox::new(105.0, 102.0, 80.0, 200.0));
        assert_eq!(t.last_seen, at_ms(33));
    }

    #[test]
    fn test_face_upgrades_motion_track_in_place() {
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        reg.update(&[motion(100.0, 100.0, 80.0, 200.0)], at_ms(0));
        let ids = reg.update(&[face(120.0, 110.0, 40.0, 50.0)], at_ms(50));
        assert_eq!(ids, vec![1]);
        assert_eq!(reg.len(), 1);
        let t = reg.get(1).unwrap();
        assert_eq!(t.kind, TrackKind::Face);
        // Body box is kept; the face is recorded separately.
        assert_eq!(t.bounding_box, BoundingBox::new(100.0, 100.0, 80.0, 200.0));
        assert_eq!(t.face_bounding_box, Some(BoundingBox::new(120.0, 110.0, 40.0, 50.0)));
    }

    #[test]
    fn test_face_with_high_iou_on_motion_track_is_not_duplicated() {
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        reg.update(&[motion(100.0, 100.0, 60.0, 100.0)], at_ms(0));
        let ids = reg.update(&[face(102.0, 102.0, 58.0, 96.0)], at_ms(10));
        assert_eq!(ids, vec![1]);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_alternating_sources_keep_continuity() {
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let mut seen = HashSet::new();
        for step in 0..30i64 {
            let dx = step as f32 * 2.0;
            let ids = if step % 3 == 0 {
                reg.update(&[face(120.0 + dx, 110.0, 40.0, 50.0)], at_ms(step * 33))
            } else {
                reg.update(&[motion(100.0 + dx, 100.0, 80.0, 200.0)], at_ms(step * 33))
            };
            seen.extend(ids);
        }
        assert_eq!(seen.len(), 1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_motion_blob_absorbs_face_only_track() {
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        reg.update(&[face(120.0, 110.0, 40.0, 50.0)], at_ms(0));
        let ids = reg.update(&[motion(100.0, 100.0, 80.0, 200.0)], at_ms(20));
        assert_eq!(ids, vec![1]);
        let t = reg.get(1).unwrap();
        assert_eq!(t.kind, TrackKind::Face);
        assert_eq!(t.bounding_box, BoundingBox::new(100.0, 100.0, 80.0, 200.0));
    }

    #[test]
    fn test_two_people_get_two_tracks() {
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let ids = reg.update(
            &[motion(0.0, 0.0, 80.0, 200.0), motion(400.0, 0.0, 80.0, 200.0)],
            at_ms(0),
        );
        assert_eq!(ids, vec![1, 2]);
        let ids = reg.update(
            &[motion(402.0, 0.0, 80.0, 200.0), motion(3.0, 0.0, 80.0, 200.0)],
            at_ms(33),
        );
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn test_one_track_takes_one_detection_per_update() {
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        reg.update(&[motion(0.0, 0.0, 200.0, 200.0)], at_ms(0));
        let ids = reg.update(
            &[face(20.0, 20.0, 40.0, 40.0), face(120.0, 20.0, 40.0, 40.0)],
            at_ms(10),
        );
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_eviction_after_inactivity() {
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        reg.update(&[motion(0.0, 0.0, 80.0, 200.0)], at_ms(0));
        assert!(reg.evict_stale(at_ms(3000)).is_empty());
        let evicted = reg.evict_stale(at_ms(3001));
        assert_eq!(evicted.len(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        reg.update(&[motion(0.0, 0.0, 80.0, 200.0)], at_ms(0));
        reg.evict_stale(at_ms(5000));
        let ids = reg.update(&[motion(0.0, 0.0, 80.0, 200.0)], at_ms(5000));
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_stale_track_is_not_matched() {
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        reg.update(&[motion(0.0, 0.0, 80.0, 200.0)], at_ms(0));
        let ids = reg.update(&[motion(0.0, 0.0, 80.0, 200.0)], at_ms(4000));
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_size_only_shrinks_through_eviction() {
        let mut reg = TrackRegistry::new(TrackerConfig::default());
        let mut last_len = 0;
        for step in 0..20i64 {
            let det = if step % 2 == 0 {
                motion(100.0, 100.0, 80.0, 200.0)
            } else {
                face(120.0, 110.0, 40.0, 50.0)
            };
            reg.update(&[det], at_ms(step * 40));
            assert!(reg.len() >= last_len);
            last_len = reg.len();
        }
        assert_eq!(reg.len(), 1);
    }
}
