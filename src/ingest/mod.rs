//! Frame sources.
//!
//! This module provides the sources the capture loop pulls frames from:
//! - Synthetic scene (`stub://…`), for tests and demos
//! - Image directory (`dir://…`), cycling still images
//! - USB/V4L2 devices (`v4l2:///dev/videoN` or `/dev/videoN`, feature: ingest-v4l2)
//!
//! Every source produces RGB24 `Frame` values. `next_frame` is the only call
//! in the capture loop allowed to block on I/O.

mod image_dir;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use crate::frame::Frame;

pub use image_dir::ImageDirSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Capture abstraction used by the capture loop.
pub trait FrameSource: Send {
    /// Open the underlying device or input.
    fn connect(&mut self) -> Result<()>;

    /// Capture the next frame. Errors are treated as hardware failure.
    fn next_frame(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub uri: String,
}

/// Configuration for a frame source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// Source URI (e.g. "stub://camera", "dir:///srv/frames", "/dev/video0").
    pub uri: String,
    /// Requested frame width (synthetic frames use it as-is).
    pub width: u32,
    /// Requested frame height.
    pub height: u32,
    /// Frames per second the source paces itself to. 0 = unpaced.
    pub target_fps: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            uri: "stub://camera".to_string(),
            width: 640,
            height: 480,
            target_fps: 30,
        }
    }
}

/// Open the source named by `config.uri`.
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    let uri = config.uri.trim();
    if uri.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config.clone())));
    }
    if let Some(path) = uri.strip_prefix("dir://") {
        return Ok(Box::new(ImageDirSource::new(path, config.clone())?));
    }
    if let Some(device) = device_path(uri) {
        #[cfg(feature = "ingest-v4l2")]
        {
            let mut config = config.clone();
            config.uri = device.to_string();
            return Ok(Box::new(V4l2Source::new(config)?));
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            return Err(anyhow!(
                "capture device {} requires the ingest-v4l2 feature",
                device
            ));
        }
    }
    Err(anyhow!("unsupported frame source '{}'", uri))
}

fn device_path(uri: &str) -> Option<&str> {
    if let Some(path) = uri.strip_prefix("v4l2://") {
        return Some(path);
    }
    if uri.starts_with("/dev/video") {
        return Some(uri);
    }
    None
}

/// Sleeps so that successive frames are at least `1 / fps` apart.
pub(crate) struct FramePacer {
    interval: Option<Duration>,
    last: Option<Instant>,
}

impl FramePacer {
    pub(crate) fn new(target_fps: u32) -> Self {
        Self {
            interval: (target_fps > 0).then(|| Duration::from_secs_f64(1.0 / target_fps as f64)),
            last: None,
        }
    }

    pub(crate) fn wait(&mut self) {
        if let (Some(interval), Some(last)) = (self.interval, self.last) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_synthetic_source() -> Result<()> {
        let mut source = open_source(&SourceConfig {
            uri: "stub://test".to_string(),
            width: 32,
            height: 24,
            target_fps: 0,
        })?;
        source.connect()?;
        let frame = source.next_frame()?;
        assert_eq!((frame.width, frame.height), (32, 24));
        assert_eq!(source.stats().frames_captured, 1);
        Ok(())
    }

    #[test]
    fn rejects_unknown_scheme() {
        let config = SourceConfig {
            uri: "rtsp://camera/stream".to_string(),
            ..SourceConfig::default()
        };
        assert!(open_source(&config).is_err());
    }

    #[test]
    fn recognises_device_paths() {
        assert_eq!(device_path("v4l2:///dev/video2"), Some("/dev/video2"));
        assert_eq!(device_path("/dev/video0"), Some("/dev/video0"));
        assert_eq!(device_path("stub://x"), None);
    }
}
