//! Per-frame processing: quality gate, throttled motion and face passes,
//! track association and decisions.
//!
//! [`Pipeline::process`] is the body of the streaming loop. It never fails:
//! capability errors count as "nothing found" for that pass and store errors
//! are absorbed by the decision engine.

use crate::capability::{Embedder, FaceDetector, MotionSegmenter};
use crate::config::TrackingConfig;
use crate::decision::{DecisionEngine, Evidence, Outcome};
use crate::frame::Frame;
use crate::matcher::IdentityMatcher;
use crate::quality::{Admission, FrameMetrics, QualityGate};
use crate::store::{AttendanceStore, SystemMode};
use crate::tracker::{Detection, TrackId, TrackRegistry};
use crate::types::{FaceDetection, MotionBlob};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Minimum spacing between passes of each detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub motion_interval_ms: u64,
    pub face_interval_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            motion_interval_ms: 33,
            face_interval_ms: 66,
        }
    }
}

/// Which motion blobs are plausibly a person.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonFilterConfig {
    pub min_area_fraction: f32,
    pub max_area_fraction: f32,
    pub min_width: f32,
    pub min_height: f32,
}

impl Default for PersonFilterConfig {
    fn default() -> Self {
        Self {
            min_area_fraction: 0.01,
            max_area_fraction: 0.5,
            min_width: 50.0,
            min_height: 100.0,
        }
    }
}

impl PersonFilterConfig {
    pub fn accepts(&self, blob: &MotionBlob) -> bool {
        blob.area_fraction >= self.min_area_fraction
            && blob.area_fraction <= self.max_area_fraction
            && blob.bbox.width >= self.min_width
            && blob.bbox.height >= self.min_height
    }
}

/// The sensing capabilities a pipeline drives.
pub struct Capabilities {
    pub detector: Box<dyn FaceDetector>,
    pub embedder: Box<dyn Embedder>,
    pub segmenter: Box<dyn MotionSegmenter>,
}

/// What happened while processing one frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub sequence: u64,
    pub metrics: FrameMetrics,
    pub admission: Admission,
    pub motion_ran: bool,
    pub faces_ran: bool,
    /// Person-sized blobs after filtering.
    pub people: usize,
    pub faces: usize,
    pub outcomes: Vec<(TrackId, Outcome)>,
    pub evicted: usize,
    pub active_tracks: usize,
}

pub struct Pipeline {
    gate: QualityGate,
    matcher: Arc<IdentityMatcher>,
    registry: TrackRegistry,
    decisions: DecisionEngine,
    caps: Capabilities,
    throttle: ThrottleConfig,
    person_filter: PersonFilterConfig,
    min_face_quality: f32,
    last_motion_check: Option<NaiveDateTime>,
    last_face_check: Option<NaiveDateTime>,
}

impl Pipeline {
    pub fn new(
        config: &TrackingConfig,
        matcher: Arc<IdentityMatcher>,
        store: Arc<dyn AttendanceStore>,
        mode: SystemMode,
        caps: Capabilities,
    ) -> Self {
        Self {
            gate: QualityGate::new(config.quality),
            matcher,
            registry: TrackRegistry::new(config.tracker),
            decisions: DecisionEngine::new(store, mode, config.capture, config.attendance),
            caps,
            throttle: config.throttle,
            person_filter: config.person_filter,
            min_face_quality: config.capture.min_face_quality,
            last_motion_check: None,
            last_face_check: None,
        }
    }

    pub fn matcher(&self) -> &Arc<IdentityMatcher> {
        &self.matcher
    }

    pub fn registry(&self) -> &TrackRegistry {
        &self.registry
    }

    pub fn mode(&self) -> SystemMode {
        self.decisions.mode()
    }

    /// Drop all tracks and background state, e.g. when the source restarts.
    pub fn reset(&mut self) {
        self.registry.clear();
        self.caps.segmenter.reset();
        self.last_motion_check = None;
        self.last_face_check = None;
        tracing::debug!("pipeline reset");
    }

    pub fn process(&mut self, frame: &Frame) -> FrameReport {
        let now = frame.captured_at;
        let metrics = self.gate.evaluate(frame);
        let admission = self.gate.admission(&metrics);

        let mut report = FrameReport {
            sequence: frame.sequence,
            metrics,
            admission,
            motion_ran: false,
            faces_ran: false,
            people: 0,
            faces: 0,
            outcomes: Vec::new(),
            evicted: 0,
            active_tracks: 0,
        };

        if admission.allows_processing() {
            let motion_every = Duration::milliseconds(self.throttle.motion_interval_ms as i64);
            if is_due(self.last_motion_check, now, motion_every) {
                self.last_motion_check = Some(now);
                report.motion_ran = true;
                self.motion_pass(frame, now, &mut report);
            }

            let face_every = Duration::milliseconds(self.throttle.face_interval_ms as i64);
            if is_due(self.last_face_check, now, face_every) {
                self.last_face_check = Some(now);
                report.faces_ran = true;
                self.face_pass(frame, admission, now, &mut report);
            }
        } else {
            tracing::trace!(
                sequence = frame.sequence,
                brightness = metrics.brightness,
                sharpness = metrics.sharpness,
                "frame rejected by quality gate"
            );
        }

        report.evicted = self.registry.evict_stale(now).len();
        report.active_tracks = self.registry.len();
        report
    }

    fn motion_pass(&mut self, frame: &Frame, now: NaiveDateTime, report: &mut FrameReport) {
        let blobs = self.caps.segmenter.segment(frame).unwrap_or_else(|e| {
            tracing::warn!(sequence = frame.sequence, error = %e, "motion segmentation failed");
            Vec::new()
        });
        let people: Vec<Detection> = blobs
            .into_iter()
            .filter(|b| self.person_filter.accepts(b))
            .map(Detection::Motion)
            .collect();
        report.people = people.len();

        for id in self.registry.update(&people, now) {
            if let Some(track) = self.registry.get_mut(id) {
                let outcome = self.decisions.observe(track, Evidence::NoFace, frame, now);
                report.outcomes.push((id, outcome));
            }
        }
    }

    fn face_pass(
        &mut self,
        frame: &Frame,
        admission: Admission,
        now: NaiveDateTime,
        report: &mut FrameReport,
    ) {
        let faces = self.caps.detector.detect(frame).unwrap_or_else(|e| {
            tracing::warn!(sequence = frame.sequence, error = %e, "face detection failed");
            Vec::new()
        });
        report.faces = faces.len();

        let detections: Vec<Detection> = faces.iter().copied().map(Detection::Face).collect();
        let ids = self.registry.update(&detections, now);

        for (face, id) in faces.iter().zip(ids) {
            let evidence = self.face_evidence(frame, face, admission);
            if let Some(track) = self.registry.get_mut(id) {
                let outcome = self.decisions.observe(track, evidence, frame, now);
                report.outcomes.push((id, outcome));
            }
        }
    }

    fn face_evidence(&mut self, frame: &Frame, face: &FaceDetection, admission: Admission) -> Evidence {
        let covered = Evidence::CoveredFace {
            detection_confidence: face.quality,
        };
        if face.quality < self.min_face_quality {
            return covered;
        }
        let Some(crop) = frame.crop(&face.bbox) else {
            return covered;
        };

        match self.caps.embedder.embed(&crop) {
            Ok(embedding) if embedding.normalized().is_some() => Evidence::Face {
                detection_confidence: face.quality,
                identification: self.matcher.identify(&embedding, admission),
            },
            Ok(_) => {
                tracing::debug!(sequence = frame.sequence, "degenerate face embedding");
                covered
            }
            Err(e) => {
                tracing::debug!(sequence = frame.sequence, error = %e, "face embedding failed");
                covered
            }
        }
    }
}

/// A pass is due on first use, after `every`, or when time went backwards.
fn is_due(last: Option<NaiveDateTime>, now: NaiveDateTime, every: Duration) -> bool {
    match last {
        None => true,
        Some(last) => now < last || now - last >= every,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityError;
    use crate::frame::test_support::{checker_frame, gray_frame};
    use crate::matcher::{Identification, MatchConfig};
    use crate::memory::MemoryStore;
    use crate::store::{load_gallery, EntryType};
    use crate::tracker::TrackState;
    use crate::types::{BoundingBox, Embedding};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone)]
    struct Script<T> {
        items: Arc<Mutex<Vec<T>>>,
        fail: Arc<Mutex<bool>>,
        calls: Arc<AtomicUsize>,
    }

    impl<T> Default for Script<T> {
        fn default() -> Self {
            Self {
                items: Arc::new(Mutex::new(Vec::new())),
                fail: Arc::new(Mutex::new(false)),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl<T: Clone> Script<T> {
        fn set(&self, items: Vec<T>) {
            *self.items.lock().unwrap() = items;
        }

        fn fail(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next(&self) -> Result<Vec<T>, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail.lock().unwrap() {
                return Err(CapabilityError::InferenceFailed("scripted".into()));
            }
            Ok(self.items.lock().unwrap().clone())
        }
    }

    struct FakeDetector(Script<FaceDetection>);
    impl FaceDetector for FakeDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<FaceDetection>, CapabilityError> {
            self.0.next()
        }
    }

    struct FakeSegmenter(Script<MotionBlob>);
    impl MotionSegmenter for FakeSegmenter {
        fn segment(&mut self, _frame: &Frame) -> Result<Vec<MotionBlob>, CapabilityError> {
            self.0.next()
        }
    }

    struct FixedEmbedder(Embedding);
    impl Embedder for FixedEmbedder {
        fn embed(&mut self, _face: &Frame) -> Result<Embedding, CapabilityError> {
            Ok(self.0.clone())
        }
    }

    struct Harness {
        pipeline: Pipeline,
        store: Arc<MemoryStore>,
        faces: Script<FaceDetection>,
        blobs: Script<MotionBlob>,
    }

    fn harness(mode: SystemMode, query: Vec<f32>, config: TrackingConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.add_staff("S1", vec![Embedding::new(vec![1.0, 0.0, 0.0])]);
        store.add_customer("C1", vec![Embedding::new(vec![0.0, 0.0, 1.0])]);
        let matcher = Arc::new(IdentityMatcher::new(
            load_gallery(store.as_ref()),
            MatchConfig::default(),
        ));
        let faces = Script::default();
        let blobs = Script::default();
        let caps = Capabilities {
            detector: Box::new(FakeDetector(faces.clone())),
            embedder: Box::new(FixedEmbedder(Embedding::new(query))),
            segmenter: Box::new(FakeSegmenter(blobs.clone())),
        };
        let pipeline = Pipeline::new(&config, matcher, store.clone(), mode, caps);
        Harness {
            pipeline,
            store,
            faces,
            blobs,
        }
    }

    fn person() -> MotionBlob {
        MotionBlob {
            bbox: BoundingBox::new(100.0, 40.0, 80.0, 160.0),
            area_fraction: 0.17,
        }
    }

    fn face() -> FaceDetection {
        FaceDetection {
            bbox: BoundingBox::new(120.0, 50.0, 40.0, 50.0),
            quality: 0.9,
        }
    }

    /// Bright, sharp frame that clears the strict tier.
    fn strict(ms: i64) -> Frame {
        checker_frame(320, 240, 40, 80, ms)
    }

    #[test]
    fn test_staff_walk_in_records_one_checkin() {
        let mut h = harness(SystemMode::CheckIn, vec![1.0, 0.0, 0.0], TrackingConfig::default());
        h.blobs.set(vec![person()]);
        h.faces.set(vec![face()]);

        for step in 0..60i64 {
            h.pipeline.process(&strict(step * 33));
        }

        let rows = h.store.attendance_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].staff_id, "S1");
        assert!(h.store.unknown_entries().is_empty());
        assert_eq!(h.pipeline.registry().len(), 1);
        let track = h.pipeline.registry().tracks().next().unwrap();
        assert_eq!(track.state, TrackState::ConfirmedStaff);
    }

    #[test]
    fn test_unknown_face_is_captured_at_face_interval() {
        let mut h = harness(SystemMode::CheckIn, vec![0.0, 1.0, 0.0], TrackingConfig::default());
        h.faces.set(vec![face()]);

        // 4.2 s of frames; face interval 2 s gives captures at 0, 2, 4 s.
        for step in 0..=126i64 {
            h.pipeline.process(&strict(step * 33));
        }

        let entries = h.store.unknown_entries();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.entry_type == EntryType::UnknownPerson));
        assert!(entries.iter().all(|e| e.face_bbox.is_some()));
        assert!(h.store.attendance_rows().is_empty());
    }

    #[test]
    fn test_customer_is_recorded_as_unknown_entry() {
        let mut h = harness(SystemMode::CheckIn, vec![0.0, 0.0, 1.0], TrackingConfig::default());
        h.faces.set(vec![face()]);
        let report = h.pipeline.process(&strict(0));
        assert!(matches!(
            report.outcomes.as_slice(),
            [(_, Outcome::UnknownCaptured { .. })]
        ));
        assert!(h.store.unknown_entries()[0].reason.contains("C1"));
    }

    #[test]
    fn test_rejected_frame_runs_no_detectors() {
        let mut h = harness(SystemMode::CheckIn, vec![1.0, 0.0, 0.0], TrackingConfig::default());
        h.blobs.set(vec![person()]);
        h.faces.set(vec![face()]);

        let report = h.pipeline.process(&gray_frame(320, 240, 5, 0));
        assert_eq!(report.admission, Admission::Rejected);
        assert!(!report.motion_ran && !report.faces_ran);
        assert_eq!(h.faces.calls(), 0);
        assert_eq!(h.blobs.calls(), 0);
        assert!(h.pipeline.registry().is_empty());
    }

    #[test]
    fn test_faceless_person_captured_on_lenient_frames() {
        let mut h = harness(SystemMode::CheckIn, vec![1.0, 0.0, 0.0], TrackingConfig::default());
        h.blobs.set(vec![person()]);

        // ~1 s of dim frames: grace ends at 300 ms, then one capture per 200 ms.
        for step in 0..=30i64 {
            let report = h.pipeline.process(&checker_frame(320, 240, 10, 30, step * 33));
            assert_eq!(report.admission, Admission::Lenient);
        }

        let entries = h.store.unknown_entries();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.entry_type == EntryType::NoFace));
        assert!(entries.iter().all(|e| e.face_bbox.is_none()));
        assert!(h.store.attendance_rows().is_empty());
    }

    #[test]
    fn test_lenient_frame_tracks_but_never_confirms_staff() {
        let mut h = harness(SystemMode::CheckIn, vec![1.0, 0.0, 0.0], TrackingConfig::default());
        h.blobs.set(vec![person()]);
        h.faces.set(vec![face()]);

        // Mean 20, high sharpness: lenient only.
        let report = h.pipeline.process(&checker_frame(320, 240, 10, 30, 0));
        assert_eq!(report.admission, Admission::Lenient);
        assert!(report.motion_ran);
        assert_eq!(report.people, 1);
        assert_eq!(h.pipeline.registry().len(), 1);
        assert!(h.store.attendance_rows().is_empty());
        assert!(h.store.unknown_entries().is_empty());
        assert!(report.outcomes.iter().all(|(_, o)| *o != Outcome::WriteFailed));
    }

    #[test]
    fn test_lenient_identification_is_tentative() {
        let h = harness(SystemMode::CheckIn, vec![1.0, 0.0, 0.0], TrackingConfig::default());
        assert!(matches!(
            h.pipeline
                .matcher()
                .identify(&Embedding::new(vec![1.0, 0.0, 0.0]), Admission::Lenient),
            Identification::TentativeStaff { .. }
        ));
    }

    #[test]
    fn test_detectors_are_throttled_independently() {
        let mut h = harness(SystemMode::CheckIn, vec![0.0, 1.0, 0.0], TrackingConfig::default());
        for step in 0..=10i64 {
            h.pipeline.process(&strict(step * 10));
        }
        // Frames every 10 ms over 100 ms: motion at 0/40/80, faces at 0/70.
        assert_eq!(h.blobs.calls(), 3);
        assert_eq!(h.faces.calls(), 2);
    }

    #[test]
    fn test_capability_failure_counts_as_empty() {
        let mut h = harness(SystemMode::CheckIn, vec![1.0, 0.0, 0.0], TrackingConfig::default());
        h.faces.set(vec![face()]);
        h.faces.fail(true);
        h.blobs.fail(true);

        let report = h.pipeline.process(&strict(0));
        assert!(report.faces_ran && report.motion_ran);
        assert_eq!(report.faces, 0);
        assert!(h.pipeline.registry().is_empty());

        h.faces.fail(false);
        h.pipeline.process(&strict(100));
        assert_eq!(h.store.attendance_rows().len(), 1);
    }

    #[test]
    fn test_faceless_person_is_captured_after_grace() {
        let mut h = harness(SystemMode::CheckIn, vec![0.0, 1.0, 0.0], TrackingConfig::default());
        h.blobs.set(vec![person()]);

        for step in 0..=15i64 {
            h.pipeline.process(&strict(step * 33));
        }

        let entries = h.store.unknown_entries();
        assert!(!entries.is_empty());
        assert!(entries.iter().all(|e| e.entry_type == EntryType::NoFace));
        // First capture waits out the 300 ms grace.
        assert!(entries[0].detection_time >= strict(300).captured_at);
    }

    #[test]
    fn test_small_blobs_are_not_people() {
        let mut h = harness(SystemMode::CheckIn, vec![0.0, 1.0, 0.0], TrackingConfig::default());
        h.blobs.set(vec![MotionBlob {
            bbox: BoundingBox::new(0.0, 0.0, 20.0, 20.0),
            area_fraction: 0.005,
        }]);
        let report = h.pipeline.process(&strict(0));
        assert_eq!(report.people, 0);
        assert!(h.pipeline.registry().is_empty());
    }

    #[test]
    fn test_low_quality_face_is_covered() {
        let mut h = harness(SystemMode::CheckIn, vec![1.0, 0.0, 0.0], TrackingConfig::default());
        h.faces.set(vec![FaceDetection {
            quality: 0.2,
            ..face()
        }]);
        h.pipeline.process(&strict(0));
        assert_eq!(h.store.unknown_entries()[0].entry_type, EntryType::CoveredFace);
        assert!(h.store.attendance_rows().is_empty());
    }

    #[test]
    fn test_tracks_expire_when_person_leaves() {
        let mut h = harness(SystemMode::CheckIn, vec![1.0, 0.0, 0.0], TrackingConfig::default());
        h.faces.set(vec![face()]);
        h.pipeline.process(&strict(0));
        h.faces.set(vec![]);
        let report = h.pipeline.process(&strict(3100));
        assert_eq!(report.evicted, 1);
        assert_eq!(report.active_tracks, 0);
    }

    #[test]
    fn test_reset_clears_tracks() {
        let mut h = harness(SystemMode::CheckIn, vec![1.0, 0.0, 0.0], TrackingConfig::default());
        h.blobs.set(vec![person()]);
        h.pipeline.process(&strict(0));
        assert_eq!(h.pipeline.registry().len(), 1);
        h.pipeline.reset();
        assert!(h.pipeline.registry().is_empty());
    }
}
