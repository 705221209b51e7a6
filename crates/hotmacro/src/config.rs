use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default bound on acquiring the dispatch table lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Configuration for a dispatch [`Router`](crate::Router)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long mutations and dispatch passes wait for the table lock
    #[serde(with = "duration_ms", rename = "lock_timeout_ms")]
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl EngineConfig {
    /// Set the table lock timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Parse a configuration from RON text. Missing fields take defaults.
    pub fn from_ron(text: &str) -> Result<Self> {
        Ok(ron::from_str(text)?)
    }
}

/// Serde helpers that write a `Duration` as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.lock_timeout, DEFAULT_LOCK_TIMEOUT);
    }

    #[test]
    fn test_engine_config_with_methods() {
        let config = EngineConfig::default().with_lock_timeout(Duration::from_millis(5));
        assert_eq!(config.lock_timeout, Duration::from_millis(5));
    }

    #[test]
    fn test_engine_config_from_ron() {
        let config = EngineConfig::from_ron("(lock_timeout_ms: 250)").unwrap();
        assert_eq!(config.lock_timeout, Duration::from_millis(250));

        let config = EngineConfig::from_ron("()").unwrap();
        assert_eq!(config, EngineConfig::default());

        assert!(EngineConfig::from_ron("(lock_timeout_ms: \"soon\")").is_err());
    }

    #[test]
    fn test_engine_config_ron_output() {
        let config = EngineConfig::default().with_lock_timeout(Duration::from_millis(42));
        let text = ron::to_string(&config).unwrap();
        assert_eq!(EngineConfig::from_ron(&text).unwrap(), config);
    }
}
