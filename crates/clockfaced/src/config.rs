use crate::session::SessionConfig;
use clockface_hw::CaptureConstraints;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Loaded from an optional TOML file named by `CLOCKFACE_CONFIG`, then
/// overridden field by field from `CLOCKFACE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub capture: CaptureConstraints,
    /// Base URL of the employee / check-in API.
    pub store_url: String,
    /// Sent as `X-API-KEY` when set.
    pub api_key: Option<String>,
    /// Base URL of the descriptor extraction sidecar.
    pub extractor_url: String,
    /// Expected descriptor dimensionality.
    pub descriptor_len: usize,
    /// Timeout in seconds for every store and extractor request.
    pub http_timeout_secs: u64,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            capture: CaptureConstraints::default(),
            store_url: "http://localhost:3000".to_string(),
            api_key: None,
            extractor_url: "http://localhost:5001".to_string(),
            descriptor_len: 128,
            http_timeout_secs: 10,
            system_bus: false,
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Load the file named by `CLOCKFACE_CONFIG` (if any), apply environment
    /// overrides and validate the result.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("CLOCKFACE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `CLOCKFACE_*` variables. Unparsable values are
    /// ignored and the current value kept.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(device) = lookup("CLOCKFACE_CAMERA_DEVICE") {
            self.camera_device = device;
        }
        self.capture.width = env_parse(&lookup, "CLOCKFACE_CAPTURE_WIDTH", self.capture.width);
        self.capture.height = env_parse(&lookup, "CLOCKFACE_CAPTURE_HEIGHT", self.capture.height);
        if let Some(url) = lookup("CLOCKFACE_STORE_URL") {
            self.store_url = url;
        }
        if let Some(key) = lookup("CLOCKFACE_API_KEY") {
            self.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Some(url) = lookup("CLOCKFACE_EXTRACTOR_URL") {
            self.extractor_url = url;
        }
        self.descriptor_len = env_parse(&lookup, "CLOCKFACE_DESCRIPTOR_LEN", self.descriptor_len);
        self.http_timeout_secs =
            env_parse(&lookup, "CLOCKFACE_HTTP_TIMEOUT_SECS", self.http_timeout_secs);
        self.system_bus = lookup("CLOCKFACE_SYSTEM_BUS")
            .map(|v| v != "0")
            .unwrap_or(self.system_bus);

        let session = &mut self.session;
        session.min_samples = env_parse(&lookup, "CLOCKFACE_MIN_SAMPLES", session.min_samples);
        session.max_samples = env_parse(&lookup, "CLOCKFACE_MAX_SAMPLES", session.max_samples);
        session.match_threshold =
            env_parse(&lookup, "CLOCKFACE_MATCH_THRESHOLD", session.match_threshold);
        session.detection_poll_interval_ms = env_parse(
            &lookup,
            "CLOCKFACE_POLL_INTERVAL_MS",
            session.detection_poll_interval_ms,
        );
        session.confirmed_auto_reset_ms = env_parse(
            &lookup,
            "CLOCKFACE_AUTO_RESET_MS",
            session.confirmed_auto_reset_ms,
        );
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        if session.min_samples == 0 {
            return Err(ConfigError::Invalid("min_samples must be at least 1".into()));
        }
        if session.max_samples < session.min_samples {
            return Err(ConfigError::Invalid(format!(
                "max_samples ({}) is below min_samples ({})",
                session.max_samples, session.min_samples
            )));
        }
        if !(session.match_threshold.is_finite() && session.match_threshold > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be a positive number, got {}",
                session.match_threshold
            )));
        }
        if session.detection_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "detection_poll_interval_ms must be non-zero".into(),
            ));
        }
        if self.descriptor_len == 0 {
            return Err(ConfigError::Invalid("descriptor_len must be non-zero".into()));
        }
        for (name, url) in [("store_url", &self.store_url), ("extractor_url", &self.extractor_url)] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be an http(s) URL, got {url:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(current)
}
