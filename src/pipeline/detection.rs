use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::PipelineStats;
use crate::detect::{Detection, DetectorFamily, DetectorRegistry};
use crate::event_log::{EventRecorder, RecordOutcome};
use crate::frame::SharedFrameState;
use crate::toggle::ToggleState;

#[derive(Clone, Debug)]
pub struct DetectionConfig {
    /// Pause after an iteration that ran detectors.
    pub active_interval: Duration,
    /// Pause while no frame exists yet or every family is disabled.
    pub idle_interval: Duration,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_millis(150),
            idle_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionTick {
    /// Nothing captured yet.
    NoFrame,
    /// All families disabled; an empty list was published.
    Idle,
    /// Detectors ran; carries the number of detections published.
    Detected(usize),
}

/// Detection loop: owns the detections slot and feeds the event recorder.
pub struct DetectionLoop {
    state: Arc<SharedFrameState>,
    toggles: Arc<ToggleState>,
    registry: DetectorRegistry,
    recorder: Option<EventRecorder>,
    stats: Arc<PipelineStats>,
    config: DetectionConfig,
}

impl DetectionLoop {
    pub fn new(
        state: Arc<SharedFrameState>,
        toggles: Arc<ToggleState>,
        registry: DetectorRegistry,
        stats: Arc<PipelineStats>,
        config: DetectionConfig,
    ) -> Self {
        Self {
            state,
            toggles,
            registry,
            recorder: None,
            stats,
            config,
        }
    }

    pub fn with_recorder(mut self, recorder: EventRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn tick(&mut self) -> DetectionTick {
        let Some(frame) = self.state.latest_raw() else {
            return DetectionTick::NoFrame;
        };
        let toggles = self.toggles.get();
        if !toggles.any_enabled() {
            self.state.publish_detections(Vec::new());
            return DetectionTick::Idle;
        }

        // `frame` is an immutable snapshot; the capture loop publishes new
        // frames into the slot rather than writing into this one.
        let mut detections: Vec<Detection> = Vec::new();
        for family in DetectorFamily::ALL {
            if !toggles.enabled(family) {
                continue;
            }
            match self.registry.detect(family, &frame) {
                Ok(found) => detections.extend(found),
                Err(err) => {
                    self.stats.detector_failed();
                    log::warn!("detection: {} detector failed: {:#}", family.as_str(), err);
                }
            }
        }
        let count = detections.len();
        self.state.publish_detections(detections.clone());
        self.stats.detection_iteration();

        if let Some(recorder) = self.recorder.as_mut() {
            match recorder.observe(&frame, &detections) {
                Ok(RecordOutcome::Recorded(_)) => self.stats.event_recorded(),
                Ok(_) => {}
                Err(err) => {
                    self.stats.persistence_failed();
                    log::error!("detection: access event not persisted: {:#}", err);
                }
            }
        }
        DetectionTick::Detected(count)
    }

    pub fn run(mut self, shutdown: Arc<AtomicBool>) {
        log::info!(
            "detection loop started (backends: {:?})",
            self.registry.list()
        );
        while !shutdown.load(Ordering::SeqCst) {
            let pause = match self.tick() {
                DetectionTick::Detected(_) => self.config.active_interval,
                DetectionTick::NoFrame | DetectionTick::Idle => self.config.idle_interval,
            };
            std::thread::sleep(pause);
        }
        log::info!("detection loop stopped");
    }
}
