//! Access log: cooldown-gated persistence of "subject present" events.
//!
//! - `AccessLogEntry`: one recorded event and its snapshot file name.
//! - `AccessLogStore`: SQLite-backed newest-first collection plus images.
//! - `EventRecorder`: trigger filtering, cooldown, snapshot rendering.

mod entry;
mod recorder;
mod store;

pub use entry::{image_file_name, is_valid_entry_id, new_entry_id, AccessLogEntry};
pub use recorder::{EventRecorder, RecordOutcome, RecorderConfig};
pub use store::{AccessLogStore, ReconcileReport};
