use dav_lib::{DavError, DavResult, DEFAULT_MAX_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest payload sent as one blob.
    pub max_chunk_size: u64,
    /// Simultaneous blob channel calls, shared by send, fetch and delete.
    pub max_in_flight: usize,
    /// Upper bound for a single blob channel call.
    pub call_timeout_ms: u64,
    /// Create missing parent folders when writing a file.
    pub auto_create_parents: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            auto_create_parents: true,
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn validate(&self) -> DavResult<()> {
        if self.max_chunk_size == 0 {
            return Err(DavError::InvalidInput(
                "max_chunk_size must be positive".to_string(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(DavError::InvalidInput(
                "max_in_flight must be positive".to_string(),
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(DavError::InvalidInput(
                "call_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "max_in_flight": 8 }"#).unwrap();
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.max_chunk_size, DEFAULT_MAX_CHUNK_SIZE);
        assert_eq!(config.call_timeout(), Duration::from_secs(60));
        assert!(config.auto_create_parents);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_validate() {
        let config = EngineConfig {
            max_in_flight: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = EngineConfig {
            max_chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
