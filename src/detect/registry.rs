use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};

use crate::detect::result::{Detection, DetectorFamily};
use crate::frame::Frame;

use super::backend::DetectorBackend;

/// Thread-safe registry of detector backends, one per family.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
pub struct DetectorRegistry {
    backends: HashMap<DetectorFamily, Arc<Mutex<dyn DetectorBackend>>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Register a backend for its family, replacing any previous one.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let family = backend.family();
        if let Some(previous) = self.backends.insert(family, Arc::new(Mutex::new(backend))) {
            if let Ok(previous) = previous.lock() {
                log::debug!(
                    "replaced {} backend '{}'",
                    family.as_str(),
                    previous.name()
                );
            }
        }
    }

    pub fn get(&self, family: DetectorFamily) -> Option<Arc<Mutex<dyn DetectorBackend>>> {
        self.backends.get(&family).cloned()
    }

    /// Registered backend names by family.
    pub fn list(&self) -> Vec<(DetectorFamily, &'static str)> {
        let mut out = Vec::new();
        for family in DetectorFamily::ALL {
            if let Some(backend) = self.backends.get(&family) {
                if let Ok(guard) = backend.lock() {
                    out.push((family, guard.name()));
                }
            }
        }
        out
    }

    /// Warm up every registered backend.
    pub fn warm_up(&self) -> Result<()> {
        for (family, backend) in &self.backends {
            let mut guard = backend
                .lock()
                .map_err(|_| anyhow!("detector lock poisoned"))?;
            guard
                .warm_up()
                .map_err(|e| anyhow!("{} backend '{}' warm-up failed: {}", family.as_str(), guard.name(), e))?;
        }
        Ok(())
    }

    /// Run the backend registered for `family`.
    ///
    /// A family with no backend yields no detections. A backend that panics is
    /// reported as an error; the panic is caught while the lock is still held,
    /// so the backend stays usable for the next call.
    pub fn detect(&self, family: DetectorFamily, frame: &Frame) -> Result<Vec<Detection>> {
        let Some(backend) = self.get(family) else {
            return Ok(Vec::new());
        };
        let mut guard = backend
            .lock()
            .map_err(|_| anyhow!("detector lock poisoned"))?;
        let name = guard.name();
        match catch_unwind(AssertUnwindSafe(|| guard.detect(frame))) {
            Ok(result) => result.with_context(|| format!("{} backend '{}'", family.as_str(), name)),
            Err(payload) => Err(anyhow!(
                "{} backend '{}' panicked: {}",
                family.as_str(),
                name,
                panic_message(payload.as_ref())
            )),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
