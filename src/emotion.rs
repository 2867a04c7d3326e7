use serde::Serialize;

use crate::constants::NONE_SELECTED;

/// Work out the emotion the user means from the preset picker and the free-text box.
///
/// Trimmed free text wins when non-empty; otherwise the preset is used unless it is
/// the "none selected" sentinel. An empty result means the user gave nothing this time.
pub fn resolve_emotion(preset: &str, custom: &str) -> String {
    let custom = custom.trim();
    if !custom.is_empty() {
        custom.to_string()
    } else if preset != NONE_SELECTED {
        preset.to_string()
    } else {
        String::new()
    }
}

/// The active emotion label for a session.
///
/// Sticky: an empty resolution never clears a label that was set earlier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EmotionState {
    label: String,
}

impl EmotionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the inputs and overwrite the label if the result is non-empty.
    /// Returns true when the label was overwritten.
    pub fn select(&mut self, preset: &str, custom: &str) -> bool {
        let resolved = resolve_emotion(preset, custom);
        if resolved.is_empty() {
            return false;
        }
        self.label = resolved;
        true
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_set(&self) -> bool {
        !self.label.is_empty()
    }
}
