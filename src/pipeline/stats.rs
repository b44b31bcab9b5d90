use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Pipeline counters shared by the loops, the API and the health log.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_captured: AtomicU64,
    frames_encoded: AtomicU64,
    encode_failures: AtomicU64,
    detection_iterations: AtomicU64,
    detector_failures: AtomicU64,
    events_recorded: AtomicU64,
    persistence_failures: AtomicU64,
    source_unhealthy: AtomicBool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_encoded: u64,
    pub encode_failures: u64,
    pub detection_iterations: u64,
    pub detector_failures: u64,
    pub events_recorded: u64,
    pub persistence_failures: u64,
    pub source_healthy: bool,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn frame_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_encoded(&self) {
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the running total.
    pub(crate) fn encode_failed(&self) -> u64 {
        self.encode_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn detection_iteration(&self) {
        self.detection_iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn detector_failed(&self) {
        self.detector_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn event_recorded(&self) {
        self.events_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn persistence_failed(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the source's own health verdict after a capture attempt.
    pub(crate) fn set_source_healthy(&self, healthy: bool) {
        self.source_unhealthy.store(!healthy, Ordering::Relaxed);
    }

    pub fn source_healthy(&self) -> bool {
        !self.source_unhealthy.load(Ordering::Relaxed)
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            detection_iterations: self.detection_iterations.load(Ordering::Relaxed),
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
            events_recorded: self.events_recorded.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            source_healthy: self.source_healthy(),
        }
    }
}
