//! Multipart MJPEG stream publisher.
//!
//! Each viewer gets its own `FrameStream`: an independent cursor over the
//! encoded-frame slot with its own pacing. Nothing is shared between viewers
//! except the slot itself.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::frame::{EncodedFrame, SharedFrameState};

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Pause between two emitted chunks.
    pub interval: Duration,
    /// Poll interval while no encoded frame exists yet.
    pub wait: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            wait: Duration::from_millis(100),
        }
    }
}

type ClosedCheck = Box<dyn FnMut() -> bool + Send>;

/// Pull-based, per-viewer frame sequence.
///
/// Yields the latest encoded frame, then sleeps one interval before the next
/// read. Before the first frame is captured it polls without yielding. The
/// sequence ends when `shutdown` is set, or while still waiting for a frame
/// once the `until_closed` check reports the viewer gone. After that a closed
/// connection shows up as a failed write in the caller.
pub struct FrameStream {
    state: Arc<SharedFrameState>,
    shutdown: Arc<AtomicBool>,
    config: StreamConfig,
    emitted: u64,
    closed: Option<ClosedCheck>,
}

impl FrameStream {
    pub fn new(state: Arc<SharedFrameState>, shutdown: Arc<AtomicBool>, config: StreamConfig) -> Self {
        Self {
            state,
            shutdown,
            config,
            emitted: 0,
            closed: None,
        }
    }

    /// Polled on every wait for a frame; returning true ends the sequence.
    pub fn until_closed(mut self, closed: impl FnMut() -> bool + Send + 'static) -> Self {
        self.closed = Some(Box::new(closed));
        self
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

impl Iterator for FrameStream {
    type Item = Arc<EncodedFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.emitted > 0 {
            std::thread::sleep(self.config.interval);
        }
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(frame) = self.state.latest_encoded() {
                self.emitted += 1;
                return Some(frame);
            }
            if let Some(closed) = self.closed.as_mut() {
                if closed() {
                    return None;
                }
            }
            std::thread::sleep(self.config.wait);
        }
    }
}

/// Write one part of a `multipart/x-mixed-replace` body.
pub fn write_multipart_chunk<W: Write>(out: &mut W, jpeg: &[u8]) -> std::io::Result<()> {
    write!(
        out,
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    )?;
    out.write_all(jpeg)?;
    out.write_all(b"\r\n")?;
    out.flush()
}

/// Number of connected stream viewers.
#[derive(Debug, Default)]
pub struct ViewerCount(AtomicUsize);

impl ViewerCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Register a viewer until the returned guard is dropped.
    pub fn enter(self: &Arc<Self>) -> ViewerGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ViewerGuard {
            count: self.clone(),
        }
    }
}

pub struct ViewerGuard {
    count: Arc<ViewerCount>,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.count.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn config() -> StreamConfig {
        StreamConfig {
            interval: Duration::from_millis(1),
            wait: Duration::from_millis(1),
        }
    }

    #[test]
    fn waits_for_first_frame_then_yields() {
        let state = Arc::new(SharedFrameState::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut stream = FrameStream::new(state.clone(), shutdown, config());

        let publisher = {
            let state = state.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                state.publish_encoded(EncodedFrame {
                    jpeg: vec![1, 2, 3],
                    sequence: 7,
                });
            })
        };
        let first = stream.next().unwrap();
        publisher.join().unwrap();
        assert_eq!(first.sequence, 7);
        assert_eq!(stream.next().unwrap().sequence, 7);
        assert_eq!(stream.emitted(), 2);
    }

    #[test]
    fn shutdown_ends_the_sequence() {
        let state = Arc::new(SharedFrameState::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut stream = FrameStream::new(state, shutdown.clone(), config());
        shutdown.store(true, Ordering::SeqCst);
        assert!(stream.next().is_none());
    }

    #[test]
    fn closed_viewer_stops_waiting_for_first_frame() {
        let state = Arc::new(SharedFrameState::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut polls = 0;
        let mut stream = FrameStream::new(state, shutdown, config()).until_closed(move || {
            polls += 1;
            polls >= 3
        });
        assert!(stream.next().is_none());
        assert_eq!(stream.emitted(), 0);
    }

    #[test]
    fn viewers_have_independent_cursors() {
        let state = Arc::new(SharedFrameState::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        state.publish_encoded(EncodedFrame {
            jpeg: vec![0xFF, 0xD8],
            sequence: 1,
        });
        let mut a = FrameStream::new(state.clone(), shutdown.clone(), config());
        let mut b = FrameStream::new(state.clone(), shutdown, config());
        a.next();
        a.next();
        drop(a);
        assert_eq!(b.next().unwrap().sequence, 1);
        assert_eq!(b.emitted(), 1);
    }

    #[test]
    fn chunk_has_boundary_headers_and_payload() {
        let mut out = Vec::new();
        write_multipart_chunk(&mut out, b"JPEG").unwrap();
        assert_eq!(
            out,
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\nJPEG\r\n".to_vec()
        );
    }

    #[test]
    fn viewer_guard_tracks_connections() {
        let viewers = Arc::new(ViewerCount::new());
        let first = viewers.enter();
        {
            let _second = viewers.enter();
            assert_eq!(viewers.get(), 2);
        }
        assert_eq!(viewers.get(), 1);
        drop(first);
        assert_eq!(viewers.get(), 0);
    }
}
