// src/config.rs

use crate::types::Config;
use anyhow::{bail, Context, Result};
use std::fs;
use std::str::FromStr;
use tracing::{info, warn};

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path))?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if std::path::Path::new(path).exists() {
            Self::load(path)
        } else {
            warn!("Config file {} not found, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Apply the deployment environment variables on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("VIDEO_SOURCE") {
            self.video.source = v;
        }
        if let Some(v) = lookup("SPOTS_FILE") {
            self.spots.path = v;
        }
        if let Some(v) = lookup("MODEL_FILE") {
            self.model.path = v;
        }
        override_parsed(&lookup, "SPOT_THRESHOLD", &mut self.detection.threshold);
        override_parsed(&lookup, "HISTORY_LEN", &mut self.detection.history_len);
        override_parsed(
            &lookup,
            "PROCESS_EVERY_N_FRAMES",
            &mut self.detection.process_every_n_frames,
        );
        if let Some(v) = lookup("ENABLE_ALPR") {
            self.recognition.enabled = parse_bool(&v);
        }
        override_parsed(&lookup, "ALPR_WORKERS", &mut self.recognition.workers);
        override_parsed(&lookup, "ALPR_EVENT_BUFFER", &mut self.recognition.event_buffer);
        if let Some(v) = lookup("ALPR_SERVER_URL") {
            self.recognition.server_url = v;
        }
        if let Some(v) = lookup("BIND_ADDRESS") {
            self.server.bind_address = v;
        }
        override_parsed(&lookup, "PORT", &mut self.server.port);
    }

    pub fn validate(&self) -> Result<()> {
        if self.detection.history_len == 0 {
            bail!("detection.history_len must be at least 1");
        }
        if self.detection.process_every_n_frames == 0 {
            bail!("detection.process_every_n_frames must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.detection.threshold) {
            bail!(
                "detection.threshold must be within [0, 1], got {}",
                self.detection.threshold
            );
        }
        if self.recognition.workers == 0 {
            bail!("recognition.workers must be at least 1");
        }
        if self.model.input_size == 0 {
            bail!("model.input_size must be at least 1");
        }
        Ok(())
    }

    pub fn log_summary(&self) {
        info!(
            "Detection: threshold={:.2}, history={}, every {} frame(s)",
            self.detection.threshold,
            self.detection.history_len,
            self.detection.process_every_n_frames
        );
        info!(
            "Recognition: enabled={}, workers={}, event buffer={}",
            self.recognition.enabled, self.recognition.workers, self.recognition.event_buffer
        );
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(v) => *target = v,
            Err(_) => warn!("Ignoring invalid value for {}: {:?}", key, raw),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
