use std::time::Duration;

use rand::Rng;

/// Exponential backoff with an optional jitter range.
///
/// Attempt N yields `min(max, initial * factor^N)`. With jitter enabled the
/// delay is a uniform sample between `initial` and the computed value, which
/// keeps many restarting workers from hitting a backend in lockstep.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor: if factor < 1.0 { 1.0 } else { factor },
            jitter: false,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay for the current attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.factor.powi(self.attempt as i32);
        let computed = self.initial.mul_f64(exp).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter && computed > self.initial {
            let mut rng = rand::thread_rng();
            let sampled =
                rng.gen_range(self.initial.as_secs_f64()..=computed.as_secs_f64());
            Duration::from_secs_f64(sampled)
        } else {
            computed
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(30), 2.0)
    }
}
