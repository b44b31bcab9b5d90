use anyhow::Result;

use crate::detect::result::{Detection, DetectorFamily};
use crate::frame::Frame;

/// Detector backend trait.
///
/// Backends receive an immutable frame snapshot and return zero or more
/// detections. They must not keep a reference to the frame beyond the call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Family this backend serves.
    fn family(&self) -> DetectorFamily;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
