//! Per-device causality tokens.
//!
//! Each device stamps its operations with a strictly increasing counter.
//! Together with the device id it gives the causal position of an operation
//! within its own device's history; cross-device order comes from
//! [`Operation::causal_key`](crate::types::Operation::causal_key).

use serde::{Deserialize, Serialize};

/// Monotonic counter owned by one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalityClock {
    device_id: String,
    last: u64,
}

impl CausalityClock {
    /// Starts a clock with no operations issued.
    pub fn new(device_id: impl Into<String>) -> Self {
        CausalityClock {
            device_id: device_id.into(),
            last: 0,
        }
    }

    /// Resumes a clock after restart.
    pub fn resume(device_id: impl Into<String>, last: u64) -> Self {
        CausalityClock {
            device_id: device_id.into(),
            last,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Last issued token (0 when none).
    pub fn current(&self) -> u64 {
        self.last
    }

    /// Issues the next token.
    pub fn tick(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    /// Advances past a token seen for this device (e.g. on replay).
    ///
    /// Tokens from other devices are ignored.
    pub fn observe(&mut self, device_id: &str, token: u64) {
        if device_id == self.device_id && token > self.last {
            self.last = token;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_is_strictly_increasing() {
        let mut clock = CausalityClock::new("device-a");
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.current(), 2);
    }

    #[test]
    fn test_observe_only_own_device() {
        let mut clock = CausalityClock::resume("device-a", 3);
        clock.observe("device-b", 10);
        assert_eq!(clock.current(), 3);

        clock.observe("device-a", 7);
        assert_eq!(clock.tick(), 8);

        clock.observe("device-a", 2);
        assert_eq!(clock.current(), 8);
    }
}
