use serde::{Deserialize, Serialize};

use crate::notice::DEFAULT_RECALL_PLACEHOLDER;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the change-notification broadcast channel.
    pub event_buffer: usize,
    /// Content shown in place of a recalled message.
    pub recall_placeholder: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_buffer: 1024,
            recall_placeholder: DEFAULT_RECALL_PLACEHOLDER.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"event_buffer": 8}"#).expect("valid config");
        assert_eq!(config.event_buffer, 8);
        assert_eq!(config.recall_placeholder, DEFAULT_RECALL_PLACEHOLDER);
    }
}
