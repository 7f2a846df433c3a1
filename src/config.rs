//! Engine configuration.
//!
//! Configs are plain serde structs with builder setters. Files may be YAML or
//! JSON; every field is optional and falls back to its default. Durations are
//! written as (fractional) seconds:
//!
//! ```yaml
//! state_dir: /var/lib/dedup
//! store:
//!   max_entries: 5000
//!   max_age: 604800
//!   quality_floor: 0.3
//! batch:
//!   max_batch_size: 8
//!   max_wait_time: 2.5
//!   strategy:
//!     kind: concurrent
//!     max_concurrency: 4
//! ```

use crate::batch::BatchConfig;
use crate::cache::StoreConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the state directory for file persistence.
pub const STATE_DIR_ENV: &str = "DEDUP_STATE_DIR";
/// Environment variable naming a YAML or JSON config file.
pub const CONFIG_PATH_ENV: &str = "DEDUP_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub batch: BatchConfig,
    /// Directory for `responses.json` and `batch-state.json`. Without one,
    /// and without an explicit backend, nothing is persisted.
    pub state_dir: Option<PathBuf>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.batch.validate()
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a `.json` file as JSON and anything else as YAML.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            Error::configuration_with_context(
                "cannot read config file",
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_details(e.to_string()),
            )
        })?;
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes.as_slice());
        let text = std::str::from_utf8(bytes).map_err(|e| {
            Error::configuration_with_context(
                "config file is not valid UTF-8",
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_details(e.to_string()),
            )
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(text),
            _ => Self::from_yaml_str(text),
        }
    }

    /// Defaults, overlaid with the file named by `DEDUP_CONFIG` and the
    /// directory named by `DEDUP_STATE_DIR`, when set.
    pub async fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(PathBuf::from(path)).await?,
            None => Self::default(),
        };
        if let Some(dir) = std::env::var_os(STATE_DIR_ENV) {
            config.state_dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }
}

/// `Duration` as fractional seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// `Option<Duration>` as fractional seconds or null.
pub(crate) mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(d)? {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
