//! Exponential backoff for callers driving reconnect loops.
//!
//! The engine itself is single-shot: once its stream dies it stays dead.
//! A caller that wants the connection back builds a fresh engine, and
//! this keeps the retry cadence honest: delays double up to a cap, with
//! a random jitter so a restarted fleet does not reconnect in lockstep,
//! and reset once a connection proves stable.

use std::time::Duration;

use rand::Rng;

pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    current_delay: Duration,
    /// Consecutive failed attempts since the last `reset()`.
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Backoff {
        Backoff {
            initial_delay,
            max_delay,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// The delay to sleep before the next attempt; doubles (capped) for
    /// the one after.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_delay;
        self.attempt += 1;
        self.current_delay = (self.current_delay * 2).min(self.max_delay);
        base + self.jitter(base)
    }

    /// Up to a quarter of the base delay.
    fn jitter(&self, base: Duration) -> Duration {
        let max_jitter = (base / 4).as_millis() as u64;
        if max_jitter == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
    }

    /// Back to the initial delay, after a connection held long enough.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    pub fn exceeded(&self, max_attempts: u32) -> bool {
        self.attempt >= max_attempts
    }
}
