//! Forwarding engine tuning.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine tuning as it appears in the configuration file (milliseconds, bytes).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub connect_timeout_ms: u64,
    pub bind_timeout_ms: u64,
    pub drain_grace_ms: u64,
    pub udp_idle_timeout_ms: u64,
    pub buffer_size: usize,
    pub max_accept_errors: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            bind_timeout_ms: 5_000,
            drain_grace_ms: 5_000,
            udp_idle_timeout_ms: 60_000,
            buffer_size: 16 * 1024,
            max_accept_errors: 16,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("engine.connect_timeout_ms must be greater than 0");
        }
        if self.bind_timeout_ms == 0 {
            anyhow::bail!("engine.bind_timeout_ms must be greater than 0");
        }
        if self.udp_idle_timeout_ms == 0 {
            anyhow::bail!("engine.udp_idle_timeout_ms must be greater than 0");
        }
        if !(512..=1024 * 1024).contains(&self.buffer_size) {
            anyhow::bail!(
                "engine.buffer_size must be between 512 and 1048576 bytes, got {}",
                self.buffer_size
            );
        }
        if self.max_accept_errors == 0 {
            anyhow::bail!("engine.max_accept_errors must be greater than 0");
        }
        Ok(())
    }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            bind_timeout: Duration::from_millis(self.bind_timeout_ms),
            drain_grace: Duration::from_millis(self.drain_grace_ms),
            udp_idle_timeout: Duration::from_millis(self.udp_idle_timeout_ms),
            buffer_size: self.buffer_size,
            max_accept_errors: self.max_accept_errors,
        }
    }
}

/// Runtime settings injected into the engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Bound on dialing the target for one inbound connection
    pub connect_timeout: Duration,
    /// Bound on opening the listen socket during start
    pub bind_timeout: Duration,
    /// How long stop waits for Relays before force-closing them
    pub drain_grace: Duration,
    /// UDP sessions without traffic for this long are evicted
    pub udp_idle_timeout: Duration,
    /// Copy buffer size per relay direction
    pub buffer_size: usize,
    /// Consecutive non-transient accept/recv errors before the Listener fails
    pub max_accept_errors: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineConfig::default().settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        let settings = config.settings();
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
        assert_eq!(settings.udp_idle_timeout, Duration::from_secs(60));
        assert_eq!(settings.buffer_size, 16384);
    }

    #[test]
    fn test_engine_rejects_tiny_buffer() {
        let config = EngineConfig {
            buffer_size: 16,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_drain_grace_is_allowed() {
        // A zero grace period means "force-close immediately" on stop
        let config = EngineConfig {
            drain_grace_ms: 0,
            ..Default::default()
        };
        config.validate().unwrap();
    }
}
