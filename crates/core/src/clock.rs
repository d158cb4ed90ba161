// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Virtual time base for the counter peripherals (PIT, RTT, TC, TWI
//! debounce). The run loop advances `SimClock` from host monotonic time;
//! tests advance it manually for determinism.

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Monotonic virtual clock, in nanoseconds since emulator start.
#[derive(Debug, Default)]
pub struct SimClock {
    now_ns: u64,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    pub fn advance_ns(&mut self, delta: u64) {
        self.now_ns = self.now_ns.wrapping_add(delta);
    }
}

/// Down-counting periodic timer: loaded with `limit`, it expires every
/// `limit` ticks of its configured frequency. Expirations are delivered by
/// polling with the current virtual time, so a long gap reports every
/// expiry that occurred within it.
#[derive(Debug, Default)]
pub struct PeriodicTimer {
    freq_hz: u64,
    limit: u64,
    count: u64,
    running: bool,
    oneshot: bool,
    last_ns: u64,
    // sub-tick remainder, in ns * freq units
    frac: u128,
}

impl PeriodicTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_freq(&mut self, hz: u64) {
        self.freq_hz = hz;
        self.frac = 0;
    }

    pub fn freq(&self) -> u64 {
        self.freq_hz
    }

    /// Set the reload value. With `reload` the current countdown restarts
    /// from the new limit as well.
    pub fn set_limit(&mut self, limit: u64, reload: bool) {
        let limit = limit.max(1);
        self.limit = limit;
        if reload || self.count == 0 || self.count > limit {
            self.count = limit;
        }
    }

    pub fn run(&mut self, now_ns: u64, oneshot: bool) {
        self.running = true;
        self.oneshot = oneshot;
        self.last_ns = now_ns;
        self.frac = 0;
        if self.count == 0 {
            self.count = self.limit.max(1);
        }
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current countdown value; ticks elapsed in the running period are
    /// `limit - count`.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Advance to `now_ns` and return how many times the timer expired.
    pub fn poll(&mut self, now_ns: u64) -> u64 {
        if !self.running || self.freq_hz == 0 {
            self.last_ns = now_ns;
            return 0;
        }

        let elapsed = now_ns.wrapping_sub(self.last_ns) as u128;
        self.last_ns = now_ns;

        let scaled = elapsed * self.freq_hz as u128 + self.frac;
        let mut ticks = (scaled / NANOS_PER_SEC) as u64;
        self.frac = scaled % NANOS_PER_SEC;

        if ticks < self.count {
            self.count -= ticks;
            return 0;
        }

        if self.oneshot {
            self.running = false;
            self.count = self.limit.max(1);
            return 1;
        }

        ticks -= self.count;
        let limit = self.limit.max(1);
        let fires = 1 + ticks / limit;
        self.count = limit - (ticks % limit);
        fires
    }
}
