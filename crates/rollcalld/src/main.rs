use anyhow::{Context, Result};
use rollcall_core::capability::{CapabilityError, Embedder, FaceDetector};
use rollcall_core::{
    load_gallery, AttendanceStore, Capabilities, Embedding, FaceDetection, Frame,
    IdentityMatcher, Pipeline,
};
use rollcall_store::SqliteStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

mod arcface;
mod config;
mod engine;
mod model;
mod motion;
mod scrfd;
mod source;

use arcface::ArcFaceEmbedder;
use engine::EngineHandle;
use scrfd::ScrfdDetector;

/// Stand-in used when the model files are missing: the station then tracks
/// people by motion only and every visitor is recorded as a no-face entry.
struct NoFaceModel;

impl FaceDetector for NoFaceModel {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<FaceDetection>, CapabilityError> {
        Ok(Vec::new())
    }
}

impl Embedder for NoFaceModel {
    fn embed(&mut self, _face: &Frame) -> Result<Embedding, CapabilityError> {
        Err(CapabilityError::Unavailable("no face model configured".into()))
    }
}

/// Load SCRFD and ArcFace from the model directory. Missing files fall back
/// to motion-only tracking; a file that exists but fails to load is an error.
fn face_models(
    detector_path: &Path,
    embedder_path: &Path,
) -> Result<(Box<dyn FaceDetector>, Box<dyn Embedder>)> {
    let missing: Vec<_> = [detector_path, embedder_path]
        .into_iter()
        .filter(|p| !p.exists())
        .map(|p| p.display().to_string())
        .collect();
    if !missing.is_empty() {
        tracing::warn!(?missing, "face model files missing; tracking by motion only");
        return Ok((Box::new(NoFaceModel), Box::new(NoFaceModel)));
    }
    let detector = ScrfdDetector::load(detector_path)
        .with_context(|| format!("failed to load {}", detector_path.display()))?;
    let embedder = ArcFaceEmbedder::load(embedder_path)
        .with_context(|| format!("failed to load {}", embedder_path.display()))?;
    Ok((Box::new(detector), Box::new(embedder)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env().context("invalid configuration")?;
    let replay_dir = config
        .replay_dir
        .clone()
        .context("ROLLCALL_REPLAY_DIR is not set; no frame source available")?;
    let source = source::DirectorySource::open(&replay_dir)?;

    let store: Arc<dyn AttendanceStore> = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("failed to open {}", config.db_path.display()))?,
    );

    let gallery = load_gallery(store.as_ref());
    tracing::info!(
        staff = gallery.staff().len(),
        customers = gallery.customers().len(),
        mode = %config.mode,
        "gallery loaded"
    );
    let matcher = Arc::new(IdentityMatcher::new(gallery, config.tracking.matching));

    let (detector, embedder) =
        face_models(&config.scrfd_model_path(), &config.arcface_model_path())?;
    let caps = Capabilities {
        detector,
        embedder,
        segmenter: Box::new(motion::FrameDiffSegmenter::default()),
    };
    let pipeline = Pipeline::new(&config.tracking, matcher, store.clone(), config.mode, caps);
    let (engine, thread) = engine::spawn_engine(pipeline, store)?;

    let mut replay = tokio::spawn(source::replay(
        source,
        engine.clone(),
        config.replay_fps,
        config.replay_loop,
    ));
    let mut hangup = signal(SignalKind::hangup())?;
    let mut reload_timer = (config.gallery_reload_secs > 0).then(|| {
        let period = Duration::from_secs(config.gallery_reload_secs);
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    tracing::info!("rollcalld ready");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("rollcalld shutting down");
                break;
            }
            _ = hangup.recv() => {
                tracing::info!("SIGHUP received; reloading gallery");
                reload(&engine).await;
            }
            _ = async {
                match reload_timer.as_mut() {
                    Some(timer) => {
                        timer.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => reload(&engine).await,
            finished = &mut replay => {
                match finished {
                    Ok(Ok(frames)) => tracing::info!(frames, "replay finished"),
                    Ok(Err(e)) => tracing::warn!(error = %e, "replay stopped"),
                    Err(e) => tracing::warn!(error = %e, "replay task failed"),
                }
                break;
            }
        }
    }

    replay.abort();
    if let Err(e) = engine.stop().await {
        tracing::debug!(error = %e, "engine already stopped");
    }
    drop(engine);
    match tokio::task::spawn_blocking(move || thread.join()).await {
        Ok(Ok(_stats)) => {}
        _ => tracing::warn!("engine thread did not exit cleanly"),
    }

    Ok(())
}

async fn reload(engine: &EngineHandle) {
    match engine.reload_gallery().await {
        Ok(count) => tracing::debug!(identities = count, "gallery reload complete"),
        Err(e) => tracing::warn!(error = %e, "gallery reload failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_missing_models_fall_back_to_motion_only() {
        let dir = std::env::temp_dir().join("rollcalld-models-absent");
        let (mut detector, mut embedder) =
            face_models(&dir.join("det_10g.onnx"), &dir.join("w600k_r50.onnx")).unwrap();

        let at = NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let frame = Frame::from_rgb(vec![90; 8 * 8 * 3], 8, 8, at, 0).unwrap();
        assert!(detector.detect(&frame).unwrap().is_empty());
        assert!(matches!(
            embedder.embed(&frame),
            Err(CapabilityError::Unavailable(_))
        ));
    }
}
