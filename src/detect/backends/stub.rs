use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, DetectorFamily};
use crate::frame::Frame;

enum Behavior {
    Return(Vec<Detection>),
    Fail,
    Panic,
}

/// Stub backend for testing. Returns a fixed detection list, fails, or panics
/// on every call.
pub struct StubBackend {
    family: DetectorFamily,
    behavior: Behavior,
}

impl StubBackend {
    pub fn new(family: DetectorFamily, detections: Vec<Detection>) -> Self {
        Self {
            family,
            behavior: Behavior::Return(detections),
        }
    }

    /// A backend whose every invocation returns an error.
    pub fn failing(family: DetectorFamily) -> Self {
        Self {
            family,
            behavior: Behavior::Fail,
        }
    }

    /// A backend whose every invocation panics.
    pub fn panicking(family: DetectorFamily) -> Self {
        Self {
            family,
            behavior: Behavior::Panic,
        }
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn family(&self) -> DetectorFamily {
        self.family
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        match &self.behavior {
            Behavior::Return(detections) => Ok(detections.clone()),
            Behavior::Fail => Err(anyhow!("stub {} backend failure", self.family.as_str())),
            Behavior::Panic => panic!("stub {} backend panic", self.family.as_str()),
        }
    }
}
