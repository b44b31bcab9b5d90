//! camwatch: live camera pipeline with detection overlays and an access log.
//!
//! # Architecture
//!
//! Three independently paced activities share one `SharedFrameState`:
//!
//! 1. **Capture-encode loop**: pulls frames from a `FrameSource`, overlays the
//!    latest detections, encodes JPEG, publishes raw and encoded frames.
//! 2. **Detection loop**: runs the enabled detector families on the latest raw
//!    frame, publishes the results and feeds the access log recorder.
//! 3. **Stream viewers**: one `FrameStream` per `/video_feed` connection.
//!
//! Every slot is a whole-value swap of an `Arc`; no loop ever waits on another
//! beyond the lock needed to clone a pointer. Detections may lag the displayed
//! frame by up to one detection period.
//!
//! # Module Structure
//!
//! - `frame`: frames, the whole-value-swap `Slot`, `SharedFrameState`
//! - `ingest`: frame sources (synthetic, image directory, V4L2)
//! - `detect`: detection results, backends and the per-family registry
//! - `overlay`: box/label rendering and JPEG encoding
//! - `toggle`: detector family toggles
//! - `event_log`: cooldown-gated access log with snapshot images
//! - `pipeline`: capture and detection loops, counters, supervisor
//! - `stream`: multipart MJPEG publisher
//! - `api`: HTTP surface
//! - `config`: daemon configuration

use anyhow::{anyhow, Result};

pub mod api;
pub mod config;
pub mod detect;
pub mod event_log;
pub mod frame;
pub mod ingest;
pub mod overlay;
pub mod pipeline;
pub mod stream;
pub mod toggle;

pub use detect::{
    BoundingBox, Detection, DetectorBackend, DetectorFamily, DetectorRegistry, MotionBackend,
    StubBackend,
};
pub use event_log::{AccessLogEntry, AccessLogStore, EventRecorder, RecordOutcome};
pub use frame::{EncodedFrame, Frame, SharedFrameState, Slot};
pub use ingest::{open_source, FrameSource, SourceConfig};
pub use overlay::Overlay;
pub use pipeline::{CaptureLoop, DetectionLoop, PipelineStats, Supervisor};
pub use toggle::{DetectionToggles, ToggleState, ToggleUpdate};

use config::CamwatchConfig;

/// Detector registry for the configured families.
///
/// A configured ONNX model takes precedence. Without one the objects family
/// falls back to frame-difference motion detection and the faces family stays
/// empty.
pub fn build_detectors(cfg: &CamwatchConfig) -> Result<DetectorRegistry> {
    let mut registry = DetectorRegistry::new();
    let det = &cfg.detection;

    match &det.objects_model {
        Some(model) => register_model(&mut registry, cfg, DetectorFamily::Objects, model)?,
        None => registry.register(MotionBackend::new()),
    }
    match &det.faces_model {
        Some(model) => register_model(&mut registry, cfg, DetectorFamily::Faces, model)?,
        None => log::warn!("no faces model configured; face detection disabled"),
    }

    registry.warm_up()?;
    Ok(registry)
}

#[cfg(feature = "backend-tract")]
fn register_model(
    registry: &mut DetectorRegistry,
    cfg: &CamwatchConfig,
    family: DetectorFamily,
    model: &std::path::Path,
) -> Result<()> {
    const MODEL_INPUT: u32 = 416;

    let mut backend = detect::TractBackend::new(model, family, MODEL_INPUT, MODEL_INPUT)?
        .with_thresholds(
            cfg.detection.confidence_threshold,
            cfg.detection.nms_threshold,
        );
    if family == DetectorFamily::Objects {
        if let Some(labels) = &cfg.detection.labels_path {
            backend = backend.with_labels_file(labels)?;
        }
    }
    log::info!("{} detector: {}", family.as_str(), model.display());
    registry.register(backend);
    Ok(())
}

#[cfg(not(feature = "backend-tract"))]
fn register_model(
    _registry: &mut DetectorRegistry,
    _cfg: &CamwatchConfig,
    family: DetectorFamily,
    model: &std::path::Path,
) -> Result<()> {
    Err(anyhow!(
        "{} model {} requires the backend-tract feature",
        family.as_str(),
        model.display()
    ))
}

/// Overlay renderer, with label text when a font is configured.
pub fn build_overlay(cfg: &CamwatchConfig) -> Result<Overlay> {
    match &cfg.font_path {
        Some(path) => Overlay::with_font_file(path)
            .map_err(|e| anyhow!("overlay font unusable: {:#}", e)),
        None => {
            log::info!("no overlay font configured; labels drawn without text");
            Ok(Overlay::new())
        }
    }
}
