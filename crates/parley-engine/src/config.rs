//! Engine configuration.

use std::path::Path;

use parley_types::Result;
use serde::{Deserialize, Serialize};

/// Tunables for a [`crate::FlowEngine`]. Every field has a default, so a
/// config file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Steps one inbound event may drive before escalating to a human.
    pub max_steps_per_cycle: usize,
    /// Retry budget for question steps that do not set `max_retries`.
    pub default_max_retries: u32,
    pub default_retry_message: String,
    /// Sent on the default handover once retries run out.
    pub exhausted_message: String,
    /// Sent once when a cycle fails unexpectedly.
    pub apology_message: String,
    /// Sent when the sweeper closes an idle conversation.
    pub timeout_message: String,
    pub inactivity_timeout_secs: u64,
    /// Default keywords for `user_requested_human`.
    pub human_keywords: Vec<String>,
    /// How many recent event ids are remembered for duplicate detection.
    pub recent_event_capacity: usize,
    /// Buffer of the engine event channel per listener.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_cycle: 50,
            default_max_retries: 2,
            default_retry_message: "Sorry, I didn't understand that. Please try again.".into(),
            exhausted_message:
                "I'm having trouble understanding. Let me connect you with someone from our team."
                    .into(),
            apology_message: "Sorry, something went wrong on our side. Please try again later."
                .into(),
            timeout_message:
                "This conversation was closed due to inactivity. Send a message anytime to start again."
                    .into(),
            inactivity_timeout_secs: 86_400,
            human_keywords: ["human", "agent", "person", "operator", "representative"]
                .into_iter()
                .map(String::from)
                .collect(),
            recent_event_capacity: 1024,
            event_buffer: 256,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn inactivity_timeout(&self) -> chrono::Duration {
        let max_secs = (i64::MAX / 1000) as u64;
        chrono::Duration::seconds(self.inactivity_timeout_secs.min(max_secs) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_steps_per_cycle, 50);
        assert_eq!(cfg.default_max_retries, 2);
        assert_eq!(cfg.inactivity_timeout_secs, 86_400);
        assert_eq!(cfg.recent_event_capacity, 1024);
        assert_eq!(cfg.event_buffer, 256);
        assert!(cfg.human_keywords.contains(&"agent".to_string()));
        assert_eq!(cfg.inactivity_timeout(), chrono::Duration::hours(24));
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let cfg = EngineConfig::from_json_str(r#"{"max_steps_per_cycle": 5, "human_keywords": ["humano"]}"#)
            .unwrap();
        assert_eq!(cfg.max_steps_per_cycle, 5);
        assert_eq!(cfg.human_keywords, vec!["humano"]);
        assert_eq!(cfg.default_max_retries, 2);
    }

    #[test]
    fn from_file_reads_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"default_max_retries": 4}}"#).unwrap();
        let cfg = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.default_max_retries, 4);

        assert!(EngineConfig::from_file("/definitely/not/here.json").is_err());
        assert!(EngineConfig::from_json_str("[1, 2]").is_err());
    }
}
