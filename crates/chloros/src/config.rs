// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Defaults match the classic single-carrier setup: cooperative only,
//! 1 MiB stacks, and a 5 ms virtual-time slice when preemption is on.
//! Every knob can be overridden from the environment.

use std::time::Duration;

use crate::error::Error;

/// Default per-thread stack size (1 MiB).
pub const DEFAULT_STACK_SIZE: usize = 1 << 20;

/// Smallest stack `init` accepts.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Default preemption time slice.
pub const DEFAULT_INTERVAL: Duration = Duration::from_micros(5000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Install the timer signal that forces reschedules.
    pub preempt: bool,
    /// Period of the preemption timer, measured in process CPU time.
    pub interval: Duration,
    /// Usable stack bytes per spawned thread. Rounded up to whole pages.
    pub stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preempt: false,
            interval: DEFAULT_INTERVAL,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl Config {
    /// Default configuration with the preemption timer enabled.
    pub fn preemptive() -> Self {
        Self {
            preempt: true,
            ..Self::default()
        }
    }

    pub fn with_preempt(mut self, preempt: bool) -> Self {
        self.preempt = preempt;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Defaults, overridden by `CHLOROS_PREEMPT`, `CHLOROS_PREEMPT_INTERVAL_US`
    /// and `CHLOROS_STACK_SIZE`. Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("CHLOROS_PREEMPT") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.preempt = true,
                "0" | "false" | "no" | "off" => config.preempt = false,
                _ => log::warn!("ignoring CHLOROS_PREEMPT={raw:?}: expected a boolean"),
            }
        }

        if let Some(raw) = lookup("CHLOROS_PREEMPT_INTERVAL_US") {
            match raw.trim().parse::<u64>() {
                Ok(us) if us > 0 => config.interval = Duration::from_micros(us),
                _ => log::warn!(
                    "ignoring CHLOROS_PREEMPT_INTERVAL_US={raw:?}: expected a positive integer"
                ),
            }
        }

        if let Some(raw) = lookup("CHLOROS_STACK_SIZE") {
            match raw.trim().parse::<usize>() {
                Ok(bytes) => config.stack_size = bytes,
                Err(_) => log::warn!("ignoring CHLOROS_STACK_SIZE={raw:?}: expected a byte count"),
            }
        }

        config
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "stack size {} is below the {} byte minimum",
                self.stack_size, MIN_STACK_SIZE
            )));
        }
        if self.preempt && self.interval.is_zero() {
            return Err(Error::InvalidConfig(
                "preemption interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
