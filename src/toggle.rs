//! Detection toggle state: which detector families are active.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Mutex, PoisonError};

use crate::detect::DetectorFamily;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionToggles {
    pub faces: bool,
    pub objects: bool,
}

impl DetectionToggles {
    pub fn enabled(&self, family: DetectorFamily) -> bool {
        match family {
            DetectorFamily::Faces => self.faces,
            DetectorFamily::Objects => self.objects,
        }
    }

    pub fn any_enabled(&self) -> bool {
        self.faces || self.objects
    }
}

impl Default for DetectionToggles {
    fn default() -> Self {
        Self {
            faces: true,
            objects: true,
        }
    }
}

/// Partial update; absent fields keep their current value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ToggleUpdate {
    pub faces: Option<bool>,
    pub objects: Option<bool>,
}

impl ToggleUpdate {
    /// Parse a request body leniently.
    ///
    /// Only boolean `faces` / `objects` fields are taken. Anything else,
    /// including a body that is not JSON at all, yields an empty update.
    pub fn from_json_lenient(body: &[u8]) -> Self {
        let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) else {
            return Self::default();
        };
        Self {
            faces: map.get("faces").and_then(Value::as_bool),
            objects: map.get("objects").and_then(Value::as_bool),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_none() && self.objects.is_none()
    }

    fn apply_to(&self, current: DetectionToggles) -> DetectionToggles {
        DetectionToggles {
            faces: self.faces.unwrap_or(current.faces),
            objects: self.objects.unwrap_or(current.objects),
        }
    }
}

/// Shared toggle state. Updates replace the whole value under one lock.
pub struct ToggleState {
    current: Mutex<DetectionToggles>,
}

impl ToggleState {
    pub fn new(initial: DetectionToggles) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> DetectionToggles {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge an update and return the resulting state.
    pub fn apply(&self, update: ToggleUpdate) -> DetectionToggles {
        let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let next = update.apply_to(*guard);
        if next != *guard {
            log::info!(
                "detection toggles changed: faces={} objects={}",
                next.faces,
                next.objects
            );
        }
        *guard = next;
        next
    }
}

impl Default for ToggleState {
    fn default() -> Self {
        Self::new(DetectionToggles::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_update_keeps_other_field() {
        let state = ToggleState::new(DetectionToggles {
            faces: true,
            objects: true,
        });
        let next = state.apply(ToggleUpdate::from_json_lenient(br#"{"objects": false}"#));
        assert_eq!(
            next,
            DetectionToggles {
                faces: true,
                objects: false
            }
        );
        assert_eq!(state.get(), next);
    }

    #[test]
    fn malformed_body_is_a_no_op() {
        let state = ToggleState::default();
        let before = state.get();
        for body in [&b"not json"[..], b"[1,2]", br#"{"faces": "off"}"#, b""] {
            let update = ToggleUpdate::from_json_lenient(body);
            assert!(update.is_empty());
            assert_eq!(state.apply(update), before);
        }
    }

    #[test]
    fn mixed_valid_and_invalid_fields_apply_valid_only() {
        let state = ToggleState::default();
        let next = state.apply(ToggleUpdate::from_json_lenient(
            br#"{"faces": false, "objects": 0, "extra": true}"#,
        ));
        assert!(!next.faces);
        assert!(next.objects);
    }

    #[test]
    fn any_enabled_reflects_both_flags() {
        let off = DetectionToggles {
            faces: false,
            objects: false,
        };
        assert!(!off.any_enabled());
        assert!(DetectionToggles::default().any_enabled());
        assert!(!off.enabled(DetectorFamily::Faces));
    }
}
