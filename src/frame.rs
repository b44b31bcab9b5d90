//! Frames and the shared frame state.
//!
//! - `Frame`: an RGB pixel buffer captured from a `FrameSource`.
//! - `EncodedFrame`: a compressed (JPEG) rendition ready for streaming.
//! - `Slot<T>`: a single whole-value-swap cell.
//! - `SharedFrameState`: the three slots the pipeline loops communicate through.
//!
//! Values are published as `Arc<T>` and never mutated afterwards. A reader that
//! holds an `Arc` keeps a complete snapshot no matter how many newer values
//! get published.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::detect::Detection;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Raw RGB24 frame.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture sequence number assigned by the source.
    pub sequence: u64,
    captured_at: Instant,
}

impl Frame {
    /// Wrap an RGB24 buffer. The length must be `width * height * 3`.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
            captured_at: Instant::now(),
        })
    }

    pub fn from_image(image: RgbImage, sequence: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Working copy as an image buffer (for overlay rendering).
    pub fn to_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }

    /// Time since the frame was captured.
    pub fn age(&self) -> std::time::Duration {
        self.captured_at.elapsed()
    }
}

/// Compressed frame published for viewers.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    /// Sequence of the raw frame this was encoded from.
    pub sequence: u64,
}

// ----------------------------------------------------------------------------
// Slot: whole-value swap cell
// ----------------------------------------------------------------------------

struct Versioned<T> {
    version: u64,
    value: Option<Arc<T>>,
}

/// Single-writer, many-reader cell with whole-value replacement.
///
/// The lock is held only long enough to swap or clone an `Arc`. Every publish
/// bumps a version counter under the same lock, so successive reads of one
/// slot never go backwards.
pub struct Slot<T> {
    inner: Mutex<Versioned<T>>,
}

impl<T> Slot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Versioned {
                version: 0,
                value: None,
            }),
        }
    }

    /// Replace the current value. Returns the new version.
    pub fn publish(&self, value: T) -> u64 {
        self.publish_arc(Arc::new(value))
    }

    pub fn publish_arc(&self, value: Arc<T>) -> u64 {
        // A slot only ever holds a complete value, so a poisoned lock is still consistent.
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.version += 1;
        guard.value = Some(value);
        guard.version
    }

    pub fn latest(&self) -> Option<Arc<T>> {
        self.latest_versioned().map(|(_, value)| value)
    }

    /// Latest value together with the version it was published under.
    pub fn latest_versioned(&self) -> Option<(u64, Arc<T>)> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.value.as_ref().map(|value| (guard.version, value.clone()))
    }

}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// SharedFrameState
// ----------------------------------------------------------------------------

/// State shared by the capture loop, the detection loop and stream viewers.
///
/// Ownership per slot:
/// - `raw`, `encoded`: written by the capture loop
/// - `detections`: written by the detection loop
///
/// No ordering is promised across slots; detections may belong to an older frame.
#[derive(Default)]
pub struct SharedFrameState {
    raw: Slot<Frame>,
    encoded: Slot<EncodedFrame>,
    detections: Slot<Vec<Detection>>,
}

impl SharedFrameState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_raw(&self, frame: Arc<Frame>) -> u64 {
        self.raw.publish_arc(frame)
    }

    pub fn publish_encoded(&self, frame: EncodedFrame) -> u64 {
        self.encoded.publish(frame)
    }

    pub fn publish_detections(&self, detections: Vec<Detection>) -> u64 {
        self.detections.publish(detections)
    }

    pub fn latest_raw(&self) -> Option<Arc<Frame>> {
        self.raw.latest()
    }

    pub fn latest_encoded(&self) -> Option<Arc<EncodedFrame>> {
        self.encoded.latest()
    }

    /// Latest detection list; empty until the detection loop has published once.
    pub fn latest_detections(&self) -> Arc<Vec<Detection>> {
        self.detections.latest().unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn make_test_frame(fill: u8, sequence: u64) -> Frame {
        Frame::from_rgb(vec![fill; 4 * 3 * 3], 4, 3, sequence).unwrap()
    }

    #[test]
    fn frame_rejects_wrong_length() {
        assert!(Frame::from_rgb(vec![0u8; 10], 4, 3, 0).is_err());
    }

    #[test]
    fn frame_image_round_trip_keeps_pixels() {
        let frame = make_test_frame(9, 1);
        let image = frame.to_image().unwrap();
        assert_eq!(image.dimensions(), (4, 3));
        let back = Frame::from_image(image, 1);
        assert_eq!(back.pixels(), frame.pixels());
    }

    #[test]
    fn empty_slot_reads_none() {
        let slot: Slot<u32> = Slot::new();
        assert!(slot.latest().is_none());
        assert!(slot.latest_versioned().is_none());
    }

    #[test]
    fn slot_versions_never_go_backwards_under_concurrent_publish() {
        let slot = Arc::new(Slot::new());
        let writer = {
            let slot = slot.clone();
            thread::spawn(move || {
                for i in 0..5_000u64 {
                    slot.publish(i);
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let slot = slot.clone();
            readers.push(thread::spawn(move || {
                let mut last_version = 0;
                let mut last_value = None;
                for _ in 0..5_000 {
                    if let Some((version, value)) = slot.latest_versioned() {
                        assert!(version >= last_version);
                        if let Some(prev) = last_value {
                            assert!(*value >= prev, "observed {} after {}", value, prev);
                        }
                        last_version = version;
                        last_value = Some(*value);
                    }
                }
            }));
        }

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(*slot.latest().unwrap(), 4_999);
    }

    #[test]
    fn raw_snapshot_is_unaffected_by_later_publishes() {
        let state = Arc::new(SharedFrameState::new());
        state.publish_raw(Arc::new(make_test_frame(1, 1)));
        let snapshot = state.latest_raw().unwrap();

        let writer = {
            let state = state.clone();
            thread::spawn(move || {
                for seq in 2..200u64 {
                    state.publish_raw(Arc::new(make_test_frame(seq as u8, seq)));
                }
            })
        };
        writer.join().unwrap();

        assert_eq!(snapshot.sequence, 1);
        assert!(snapshot.pixels().iter().all(|&p| p == 1));
        assert_eq!(state.latest_raw().unwrap().sequence, 199);
    }

    #[test]
    fn detections_default_to_empty() {
        let state = SharedFrameState::new();
        assert!(state.latest_detections().is_empty());
    }
}
