use rollcall_core::decision::Outcome;
use rollcall_core::{load_gallery, Admission, AttendanceStore, Frame, FrameReport, Pipeline};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Control messages for the engine thread. Frames travel separately.
enum EngineRequest {
    ReloadGallery { reply: oneshot::Sender<usize> },
    Reset { reply: oneshot::Sender<()> },
    Stop,
}

/// Counters accumulated by the engine thread, returned when it exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub frames: u64,
    pub rejected: u64,
    pub check_ins: u64,
    pub check_outs: u64,
    pub unknown_captures: u64,
    pub write_failures: u64,
}

impl EngineStats {
    fn record(&mut self, report: &FrameReport) {
        self.frames += 1;
        if report.admission == Admission::Rejected {
            self.rejected += 1;
        }
        for (_, outcome) in &report.outcomes {
            match outcome {
                Outcome::CheckedIn { .. } => self.check_ins += 1,
                Outcome::CheckedOut { .. } => self.check_outs += 1,
                Outcome::UnknownCaptured { .. } => self.unknown_captures += 1,
                Outcome::WriteFailed => self.write_failures += 1,
                _ => {}
            }
        }
    }
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    frames: Arc<watch::Sender<Option<Arc<Frame>>>>,
}

impl EngineHandle {
    /// Offer the newest frame. A frame the engine has not started on yet is
    /// replaced, never queued.
    pub fn submit(&self, frame: Frame) -> Result<(), EngineError> {
        self.frames
            .send(Some(Arc::new(frame)))
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Rebuild the gallery from the store; returns the number of identities.
    pub async fn reload_gallery(&self) -> Result<usize, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::ReloadGallery { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Drop all live tracks, e.g. when the frame source restarts.
    pub async fn reset(&self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Reset { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn stop(&self) -> Result<(), EngineError> {
        self.tx
            .send(EngineRequest::Stop)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the streaming loop on a dedicated OS thread.
///
/// Must be called from within a tokio runtime; the thread drives its
/// channels through that runtime's handle but does all frame work itself.
pub fn spawn_engine(
    pipeline: Pipeline,
    store: Arc<dyn AttendanceStore>,
) -> Result<(EngineHandle, std::thread::JoinHandle<EngineStats>), EngineError> {
    let (tx, rx) = mpsc::channel::<EngineRequest>(4);
    let (frames_tx, frames_rx) = watch::channel::<Option<Arc<Frame>>>(None);
    let runtime = tokio::runtime::Handle::current();

    let thread = std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(mode = %pipeline.mode(), "engine thread started");
            let stats = runtime.block_on(run_loop(pipeline, store, rx, frames_rx));
            tracing::info!(
                frames = stats.frames,
                rejected = stats.rejected,
                check_ins = stats.check_ins,
                check_outs = stats.check_outs,
                unknown_captures = stats.unknown_captures,
                write_failures = stats.write_failures,
                "engine thread exiting"
            );
            stats
        })?;

    Ok((
        EngineHandle {
            tx,
            frames: Arc::new(frames_tx),
        },
        thread,
    ))
}

async fn run_loop(
    mut pipeline: Pipeline,
    store: Arc<dyn AttendanceStore>,
    mut rx: mpsc::Receiver<EngineRequest>,
    mut frames: watch::Receiver<Option<Arc<Frame>>>,
) -> EngineStats {
    let mut stats = EngineStats::default();

    loop {
        tokio::select! {
            req = rx.recv() => match req {
                Some(EngineRequest::ReloadGallery { reply }) => {
                    let gallery = load_gallery(store.as_ref());
                    let count = gallery.len();
                    pipeline.matcher().reload(gallery);
                    let _ = reply.send(count);
                }
                Some(EngineRequest::Reset { reply }) => {
                    pipeline.reset();
                    let _ = reply.send(());
                }
                Some(EngineRequest::Stop) | None => break,
            },
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let frame = frames.borrow_and_update().clone();
                if let Some(frame) = frame {
                    let report = pipeline.process(&frame);
                    tracing::trace!(
                        sequence = report.sequence,
                        admission = ?report.admission,
                        people = report.people,
                        faces = report.faces,
                        tracks = report.active_tracks,
                        "frame processed"
                    );
                    stats.record(&report);
                }
            }
        }
    }

    stats
}
