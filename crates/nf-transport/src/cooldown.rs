//! Tick-driven retry timers.
//!
//! Cooldowns are plain state machines: the transport's bumper worker wakes
//! on a fixed interval and ticks every live cooldown once.  Nothing here
//! touches the clock.

/// Outcome of advancing a cooldown by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownTick {
    /// Nothing to do this tick.
    Idle,
    /// The timer fired; perform the periodic action (retransmit, ping...).
    Cycled,
    /// The timer is exhausted and will never cycle again.
    Died,
}

// ---------------------------------------------------------------------------
// Linear
// ---------------------------------------------------------------------------

/// Configuration for [`LinearCooldown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearConfig {
    /// Ticks between consecutive `Cycled` events once past `start_delay`.
    pub ticks_per_attempt: u64,
    /// Tick count at which the cooldown dies.
    pub max_ticks: u64,
    /// Ticks to wait before the first `Cycled`.
    pub start_delay: u64,
}

impl Default for LinearConfig {
    fn default() -> Self {
        LinearConfig {
            ticks_per_attempt: 500,
            max_ticks: 5000,
            start_delay: 1000,
        }
    }
}

impl LinearConfig {
    pub fn start(self) -> LinearCooldown {
        LinearCooldown { config: self, counter: 0 }
    }
}

/// Cycles at a fixed period after an initial delay, then dies at a cap.
#[derive(Debug, Clone)]
pub struct LinearCooldown {
    config: LinearConfig,
    counter: u64,
}

impl LinearCooldown {
    pub fn tick(&mut self) -> CooldownTick {
        if self.counter >= self.config.max_ticks {
            return CooldownTick::Died;
        }
        self.counter += 1;
        if self.counter >= self.config.start_delay
            && (self.counter - self.config.start_delay) % self.config.ticks_per_attempt == 0
        {
            return CooldownTick::Cycled;
        }
        CooldownTick::Idle
    }

    /// Restart from zero with the same configuration.
    pub fn reset(&mut self) {
        self.counter = 0;
    }
}

// ---------------------------------------------------------------------------
// Binary exponential
// ---------------------------------------------------------------------------

/// Configuration for [`BinaryExpCooldown`].
///
/// The gap after the k-th cycle is `2^floor((k + 1) * numer / denom)`
/// ticks, so `numer/denom` tunes how fast the backoff ramps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryExpConfig {
    pub numer: u64,
    pub denom: u64,
    pub max_attempts: u64,
}

impl Default for BinaryExpConfig {
    fn default() -> Self {
        BinaryExpConfig { numer: 11, denom: 16, max_attempts: 23 }
    }
}

impl BinaryExpConfig {
    pub fn start(self) -> BinaryExpCooldown {
        BinaryExpCooldown { config: self, attempts: 0, counter: 0 }
    }
}

/// Cycles immediately on the first tick, then with binary-exponentially
/// growing gaps, dying after `max_attempts` cycles.
#[derive(Debug, Clone)]
pub struct BinaryExpCooldown {
    config: BinaryExpConfig,
    attempts: u64,
    counter: u64,
}

impl BinaryExpCooldown {
    pub fn tick(&mut self) -> CooldownTick {
        if self.counter > 0 {
            self.counter -= 1;
        }
        if self.counter > 0 {
            return CooldownTick::Idle;
        }
        if self.attempts >= self.config.max_attempts {
            return CooldownTick::Died;
        }
        self.attempts += 1;
        let exponent = ((self.attempts + 1) * self.config.numer / self.config.denom).min(63);
        self.counter = 1 << exponent;
        CooldownTick::Cycled
    }
}
