//! The concurrent frame pipeline.
//!
//! - `CaptureLoop`: source -> raw slot -> overlay -> JPEG -> encoded slot
//! - `DetectionLoop`: raw slot -> detectors -> detections slot -> event recorder
//! - `Supervisor`: owns both loop threads plus the API server
//!
//! The loops share nothing but `SharedFrameState`, `ToggleState` and the
//! `PipelineStats` counters.

mod capture;
mod detection;
mod stats;
mod supervisor;

pub use capture::{CaptureConfig, CaptureLoop};
pub use detection::{DetectionConfig, DetectionLoop, DetectionTick};
pub use stats::{PipelineStats, StatsSnapshot};
pub use supervisor::{LoopHandle, Supervisor};
