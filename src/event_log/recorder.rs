use anyhow::{Context, Result};
use chrono::SecondsFormat;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::entry::{image_file_name, new_entry_id, AccessLogEntry};
use super::store::AccessLogStore;
use crate::detect::Detection;
use crate::frame::Frame;
use crate::overlay::{encode_jpeg, Overlay};

/// Recording policy knobs.
#[derive(Clone, Debug)]
pub struct RecorderConfig {
    pub trigger_labels: Vec<String>,
    pub cooldown: Duration,
    pub jpeg_quality: u8,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            trigger_labels: vec!["person".to_string(), "face".to_string()],
            cooldown: Duration::from_secs(30),
            jpeg_quality: 80,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// No detection carried a trigger label.
    NoTrigger,
    /// A trigger was seen but the cooldown window has not elapsed.
    CoolingDown,
    Recorded(AccessLogEntry),
}

/// Cooldown-gated event recorder fed by the detection loop.
pub struct EventRecorder {
    store: Arc<AccessLogStore>,
    overlay: Arc<Overlay>,
    triggers: HashSet<String>,
    cooldown: Duration,
    jpeg_quality: u8,
    last_recorded: Option<Instant>,
}

impl EventRecorder {
    pub fn new(store: Arc<AccessLogStore>, overlay: Arc<Overlay>, config: RecorderConfig) -> Self {
        Self {
            store,
            overlay,
            triggers: config
                .trigger_labels
                .iter()
                .map(|label| label.trim().to_lowercase())
                .filter(|label| !label.is_empty())
                .collect(),
            cooldown: config.cooldown,
            jpeg_quality: config.jpeg_quality,
            last_recorded: None,
        }
    }

    pub fn store(&self) -> &Arc<AccessLogStore> {
        &self.store
    }

    pub fn observe(&mut self, frame: &Frame, detections: &[Detection]) -> Result<RecordOutcome> {
        self.observe_at(Instant::now(), frame, detections)
    }

    /// Apply the recording policy to one detection batch as of `now`.
    ///
    /// The cooldown timer is armed before persisting, so a failing store is
    /// retried at most once per cooldown window.
    pub fn observe_at(
        &mut self,
        now: Instant,
        frame: &Frame,
        detections: &[Detection],
    ) -> Result<RecordOutcome> {
        let triggered: Vec<Detection> = detections
            .iter()
            .filter(|det| self.triggers.contains(&det.label.to_lowercase()))
            .cloned()
            .collect();
        if triggered.is_empty() {
            return Ok(RecordOutcome::NoTrigger);
        }
        if let Some(last) = self.last_recorded {
            if now.saturating_duration_since(last) < self.cooldown {
                return Ok(RecordOutcome::CoolingDown);
            }
        }
        self.last_recorded = Some(now);

        let snapshot = self.overlay.annotate(frame, &triggered)?;
        let jpeg = encode_jpeg(&snapshot, self.jpeg_quality)?;

        let id = new_entry_id();
        let labels: BTreeSet<String> = triggered
            .iter()
            .map(|det| det.label.to_lowercase())
            .collect();
        let entry = AccessLogEntry {
            image: image_file_name(&id),
            timestamp: chrono::Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
            labels: labels.into_iter().collect(),
            count: triggered.len(),
            id,
        };
        self.store
            .insert(&entry, &jpeg)
            .with_context(|| format!("record access event {}", entry.id))?;

        log::info!(
            "access event recorded: id={} labels={:?} count={}",
            entry.id,
            entry.labels,
            entry.count
        );
        Ok(RecordOutcome::Recorded(entry))
    }
}
