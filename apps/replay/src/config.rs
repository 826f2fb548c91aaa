use std::{fs, path::Path};

use anyhow::Context;
use client_core::SessionConfig;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "replay.toml";
const ENV_PREFIX: &str = "CHAT_REPLAY__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Overrides the viewer named by the fixture.
    pub viewer: Option<String>,
    pub event_buffer: usize,
    pub recall_placeholder: String,
}

impl Default for Settings {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            viewer: None,
            event_buffer: session.event_buffer,
            recall_placeholder: session.recall_placeholder,
        }
    }
}

impl Settings {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            event_buffer: self.event_buffer,
            recall_placeholder: self.recall_placeholder.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    viewer: Option<String>,
    event_buffer: Option<usize>,
    recall_placeholder: Option<String>,
}

/// Defaults, then the config file (if present), then `CHAT_REPLAY__*` env vars.
pub fn load_settings(path: &Path, explicit: bool) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    match fs::read_to_string(path) {
        Ok(raw) => apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid config file '{}'", path.display()))?,
        Err(err) if explicit => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()));
        }
        Err(_) => {}
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

pub fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file.viewer {
        settings.viewer = Some(v);
    }
    if let Some(v) = file.event_buffer {
        settings.event_buffer = v;
    }
    if let Some(v) = file.recall_placeholder {
        settings.recall_placeholder = v;
    }
    Ok(())
}

pub fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| {
        lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
    };

    if let Some(v) = var("VIEWER") {
        settings.viewer = Some(v);
    }
    if let Some(v) = var("EVENT_BUFFER") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.event_buffer = parsed;
        }
    }
    if let Some(v) = var("RECALL_PLACEHOLDER") {
        settings.recall_placeholder = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
