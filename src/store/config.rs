use crate::core::Result;
use crate::serializer::ID_KEY;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Who drains the tick queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickMode {
    /// The caller runs `Store::run_tick`
    #[default]
    Manual,
    /// The first scheduled task of a tick spawns a drain on the Tokio runtime
    Auto,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How tick work (flushes, array updates) gets drained
    pub tick_mode: TickMode,

    /// Period of the background tick worker, if one is spawned from config
    pub tick_interval_ms: Option<u64>,

    /// Wire name of the identifier for the default serializer
    pub primary_key: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tick_mode: TickMode::Manual,
            tick_interval_ms: None,
            primary_key: ID_KEY.to_string(),
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tick mode
    pub fn tick_mode(mut self, mode: TickMode) -> Self {
        self.tick_mode = mode;
        self
    }

    /// Set the background tick interval
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    /// Set the identifier key used by the default serializer
    pub fn primary_key(mut self, key: &str) -> Self {
        self.primary_key = key.to_string();
        self
    }

    pub fn interval(&self) -> Option<Duration> {
        self.tick_interval_ms
            .map(|ms| Duration::from_millis(ms.max(1)))
    }

    /// Parse from a JSON document; missing fields take their defaults.
    ///
    /// ```
    /// # use recordstore::{StoreConfig, TickMode};
    /// let config = StoreConfig::from_json(r#"{"tick_mode": "auto"}"#).unwrap();
    /// assert_eq!(config.tick_mode, TickMode::Auto);
    /// assert_eq!(config.primary_key, "id");
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
