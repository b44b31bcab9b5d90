use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::{CaptureLoop, DetectionLoop};
use crate::api::ApiHandle;

/// A named long-lived pipeline thread.
#[derive(Debug)]
pub struct LoopHandle {
    name: &'static str,
    join: Option<JoinHandle<Result<()>>>,
}

impl LoopHandle {
    fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)?;
        Ok(Self {
            name,
            join: Some(join),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    fn join(&mut self) -> Result<()> {
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        join.join()
            .map_err(|_| anyhow!("{} thread panicked", self.name))?
    }
}

/// Owns the capture loop, the detection loop and the API server.
///
/// `stop` signals shutdown and joins everything. Each loop finishes its
/// current iteration first; the capture loop releases its source on exit, so
/// the device is never closed under a running capture.
pub struct Supervisor {
    shutdown: Arc<AtomicBool>,
    capture: LoopHandle,
    detection: LoopHandle,
    api: Option<ApiHandle>,
}

impl Supervisor {
    pub fn start(capture: CaptureLoop, detection: DetectionLoop) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let capture_shutdown = shutdown.clone();
        let capture = LoopHandle::spawn("capture", move || capture.run(capture_shutdown))?;
        let detection_shutdown = shutdown.clone();
        let detection = LoopHandle::spawn("detection", move || {
            detection.run(detection_shutdown);
            Ok(())
        });
        let detection = match detection {
            Ok(handle) => handle,
            Err(err) => {
                shutdown.store(true, Ordering::SeqCst);
                let mut capture = capture;
                let _ = capture.join();
                return Err(err);
            }
        };
        Ok(Self {
            shutdown,
            capture,
            detection,
            api: None,
        })
    }

    pub fn with_api(mut self, api: ApiHandle) -> Self {
        self.api = Some(api);
        self
    }

    pub fn api(&self) -> Option<&ApiHandle> {
        self.api.as_ref()
    }

    /// False once the capture loop has exited (source failure or shutdown).
    pub fn capture_alive(&self) -> bool {
        !self.capture.is_finished()
    }

    /// False once the detection loop has exited. Outside shutdown this only
    /// happens if the loop itself panicked.
    pub fn detection_alive(&self) -> bool {
        !self.detection.is_finished()
    }

    /// Stop all threads. Returns the capture loop's error if it died.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let api_result = match self.api.take() {
            Some(api) => api.stop(),
            None => Ok(()),
        };
        let detection_result = self.detection.join();
        let capture_result = self.capture.join();
        log::info!("pipeline stopped");
        capture_result?;
        detection_result?;
        api_result
    }
}
