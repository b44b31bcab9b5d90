use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::PipelineStats;
use crate::frame::{EncodedFrame, Frame, SharedFrameState};
use crate::ingest::FrameSource;
use crate::overlay::{encode_jpeg, encode_rgb, Overlay};

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Pause after each iteration; caps the rate viewers see.
    pub interval: Duration,
    pub jpeg_quality: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(33),
            jpeg_quality: 80,
        }
    }
}

/// Capture-encode loop: owns the frame source and the raw/encoded slots.
pub struct CaptureLoop {
    source: Box<dyn FrameSource>,
    state: Arc<SharedFrameState>,
    overlay: Arc<Overlay>,
    stats: Arc<PipelineStats>,
    config: CaptureConfig,
}

impl CaptureLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        state: Arc<SharedFrameState>,
        overlay: Arc<Overlay>,
        stats: Arc<PipelineStats>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            source,
            state,
            overlay,
            stats,
            config,
        }
    }

    /// One capture, publish, annotate, encode, publish cycle.
    ///
    /// Only a source failure is returned as an error. An encode failure keeps
    /// the previous encoded frame current and returns `Ok(None)`.
    pub fn run_once(&mut self) -> Result<Option<u64>> {
        let captured = self.source.next_frame();
        self.stats
            .set_source_healthy(captured.is_ok() && self.source.is_healthy());
        let frame = Arc::new(captured.context("frame source failure")?);
        self.state.publish_raw(frame.clone());
        self.stats.frame_captured();

        let detections = self.state.latest_detections();
        match self.encode(&frame, &detections) {
            Ok(jpeg) => {
                self.state.publish_encoded(EncodedFrame {
                    jpeg,
                    sequence: frame.sequence,
                });
                self.stats.frame_encoded();
                Ok(Some(frame.sequence))
            }
            Err(err) => {
                let failures = self.stats.encode_failed();
                log::warn!(
                    "capture: encode of frame {} failed ({} total): {:#}",
                    frame.sequence,
                    failures,
                    err
                );
                Ok(None)
            }
        }
    }

    fn encode(&self, frame: &Frame, detections: &[crate::detect::Detection]) -> Result<Vec<u8>> {
        if detections.is_empty() {
            return encode_rgb(
                frame.pixels(),
                frame.width,
                frame.height,
                self.config.jpeg_quality,
            );
        }
        let annotated = self.overlay.annotate(frame, detections)?;
        encode_jpeg(&annotated, self.config.jpeg_quality)
    }

    /// Run until `shutdown` is set or the source fails.
    ///
    /// The source is released only after the last iteration has returned.
    pub fn run(mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let uri = self.source.stats().uri;
        let result = loop {
            if shutdown.load(Ordering::SeqCst) {
                break Ok(());
            }
            if let Err(err) = self.run_once() {
                log::error!("capture loop stopped: {:#}", err);
                break Err(err);
            }
            std::thread::sleep(self.config.interval);
        };
        drop(self.source);
        log::info!("capture: released source {}", uri);
        result
    }
}
