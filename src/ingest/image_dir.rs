use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::{FramePacer, FrameSource, SourceConfig, SourceStats};
use crate::frame::Frame;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Local image directory source (`dir://`).
///
/// Cycles through the JPEG/PNG files of a directory in lexical order. Files
/// that fail to decode are skipped; a pass with no decodable file is an error.
pub struct ImageDirSource {
    dir: PathBuf,
    config: SourceConfig,
    files: Vec<PathBuf>,
    next_index: usize,
    frame_count: u64,
    last_error: Option<String>,
    pacer: FramePacer,
}

impl ImageDirSource {
    pub fn new(dir: &str, config: SourceConfig) -> Result<Self> {
        if dir.trim().is_empty() {
            return Err(anyhow!("image directory path is empty"));
        }
        let pacer = FramePacer::new(config.target_fps);
        Ok(Self {
            dir: PathBuf::from(dir),
            config,
            files: Vec::new(),
            next_index: 0,
            frame_count: 0,
            last_error: None,
            pacer,
        })
    }

    fn decode(&self, path: &Path) -> Result<Frame> {
        let image = image::open(path)
            .with_context(|| format!("decode {}", path.display()))?
            .to_rgb8();
        Ok(Frame::from_image(image, self.frame_count))
    }
}

impl FrameSource for ImageDirSource {
    fn connect(&mut self) -> Result<()> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("read image directory {}", self.dir.display()))?
        {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if is_image {
                files.push(path);
            }
        }
        files.sort();
        if files.is_empty() {
            return Err(anyhow!("no images found in {}", self.dir.display()));
        }
        log::info!(
            "ImageDirSource: connected to {} ({} images)",
            self.dir.display(),
            files.len()
        );
        self.files = files;
        self.next_index = 0;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if self.files.is_empty() {
            return Err(anyhow!("image directory source not connected"));
        }
        self.pacer.wait();
        for _ in 0..self.files.len() {
            let path = self.files[self.next_index].clone();
            self.next_index = (self.next_index + 1) % self.files.len();
            self.frame_count += 1;
            match self.decode(&path) {
                Ok(frame) => {
                    self.last_error = None;
                    return Ok(frame);
                }
                Err(err) => {
                    log::warn!("ImageDirSource: skipping {}: {}", path.display(), err);
                    self.last_error = Some(err.to_string());
                }
            }
        }
        Err(anyhow!("no decodable images in {}", self.dir.display()))
    }

    fn is_healthy(&self) -> bool {
        !self.files.is_empty() && self.last_error.is_none()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            uri: self.config.uri.clone(),
        }
    }
}
