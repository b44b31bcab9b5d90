use anyhow::Result;

use super::{FramePacer, FrameSource, SourceConfig, SourceStats};
use crate::frame::Frame;

const BLOCK_SIZE: u32 = 48;

/// Synthetic scene source (`stub://`).
///
/// Renders a slowly drifting gradient with a bright block sweeping across the
/// frame, so frame-difference detectors see motion.
pub struct SyntheticSource {
    config: SourceConfig,
    frame_count: u64,
    pacer: FramePacer,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        let pacer = FramePacer::new(config.target_fps);
        Self {
            config,
            frame_count: 0,
            pacer,
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let (w, h) = (self.config.width, self.config.height);
        let mut pixels = vec![0u8; (w * h * 3) as usize];
        let drift = (self.frame_count / 4) as u32;
        let block_x = if w > BLOCK_SIZE {
            ((self.frame_count * 4) % (w - BLOCK_SIZE) as u64) as u32
        } else {
            0
        };
        let block_y = h.saturating_sub(BLOCK_SIZE) / 2;

        for y in 0..h {
            for x in 0..w {
                let i = ((y * w + x) * 3) as usize;
                let in_block = x >= block_x
                    && x < block_x + BLOCK_SIZE
                    && y >= block_y
                    && y < block_y + BLOCK_SIZE;
                if in_block {
                    pixels[i..i + 3].copy_from_slice(&[235, 235, 235]);
                } else {
                    pixels[i] = ((x + drift) % 96) as u8;
                    pixels[i + 1] = ((y + drift) % 96) as u8;
                    pixels[i + 2] = 64;
                }
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    /// Synthetic sources are always "connected".
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "SyntheticSource: connected to {} ({}x{})",
            self.config.uri,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.pacer.wait();
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::from_rgb(
            pixels,
            self.config.width,
            self.config.height,
            self.frame_count,
        )
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            uri: self.config.uri.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> SourceConfig {
        SourceConfig {
            uri: "stub://test".to_string(),
            width: 160,
            height: 120,
            target_fps: 0,
        }
    }

    #[test]
    fn synthetic_source_produces_sequenced_frames() -> Result<()> {
        let mut source = SyntheticSource::new(stub_config());
        source.connect()?;

        let first = source.next_frame()?;
        let second = source.next_frame()?;
        assert_eq!((first.width, first.height), (160, 120));
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        Ok(())
    }

    #[test]
    fn synthetic_scene_changes_between_frames() -> Result<()> {
        let mut source = SyntheticSource::new(stub_config());
        let first = source.next_frame()?;
        let second = source.next_frame()?;
        assert_ne!(first.pixels(), second.pixels());
        Ok(())
    }
}
