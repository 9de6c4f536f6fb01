use crate::core::{GraphError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What a cache operation does once its timeout has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NonStopTimeoutBehavior {
    /// Reads and mutations both fail with a timeout.
    ExceptionOnTimeout,
    /// Reads fall back to the local cache; mutations fail.
    ExceptionOnMutateAndLocalReads,
    /// Reads fall back to the local cache; mutations apply locally only.
    LocalReads,
    /// Reads return nothing; mutations are dropped.
    NoOp,
}

impl NonStopTimeoutBehavior {
    pub fn reads_local(&self) -> bool {
        matches!(
            self,
            Self::ExceptionOnMutateAndLocalReads | Self::LocalReads
        )
    }
}

impl Default for NonStopTimeoutBehavior {
    fn default() -> Self {
        Self::ExceptionOnTimeout
    }
}

impl fmt::Display for NonStopTimeoutBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ExceptionOnTimeout => "exception",
            Self::ExceptionOnMutateAndLocalReads => "exceptionOnMutateAndLocalReads",
            Self::LocalReads => "localReads",
            Self::NoOp => "noop",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonStopConfig {
    /// With nonstop disabled, operations wait for the cluster indefinitely.
    pub enabled: bool,
    pub timeout_ms: u64,
    #[serde(default)]
    pub behavior: NonStopTimeoutBehavior,
    /// Entries kept locally for timeout fallbacks.
    pub local_cache_capacity: usize,
}

impl Default for NonStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 30_000,
            behavior: NonStopTimeoutBehavior::default(),
            local_cache_capacity: 10_000,
        }
    }
}

impl NonStopConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn behavior(mut self, behavior: NonStopTimeoutBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn local_cache_capacity(mut self, capacity: usize) -> Self {
        self.local_cache_capacity = capacity;
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(GraphError::ConfigError(
                "nonstop timeout_ms must be > 0".to_string(),
            ));
        }
        if self.local_cache_capacity == 0 {
            return Err(GraphError::ConfigError(
                "nonstop local_cache_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
