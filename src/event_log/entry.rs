use rand::RngCore;
use serde::{Deserialize, Serialize};

const ID_BYTES: usize = 12;

/// One recorded "subject present" event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub id: String,
    /// RFC 3339 local time.
    pub timestamp: String,
    /// Sorted, de-duplicated trigger labels seen in the event.
    pub labels: Vec<String>,
    /// Number of trigger detections in the event.
    pub count: usize,
    /// Snapshot file name inside the images directory.
    pub image: String,
}

/// Fresh random entry id: 24 lowercase hex characters.
pub fn new_entry_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Only ids of the generated shape are accepted; anything else cannot name a
/// stored entry or a file outside the images directory.
pub fn is_valid_entry_id(id: &str) -> bool {
    id.len() == ID_BYTES * 2
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

pub fn image_file_name(id: &str) -> String {
    format!("{}.jpg", id)
}
