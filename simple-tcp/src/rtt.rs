//! Round-trip-time estimation and retransmission timeout (RTO).
//!
//! Jacobson/Karels smoothing as presented in Kurose & Ross §3.5.3:
//!
//! ```text
//! EstimatedRTT    = 0.875 · EstimatedRTT + 0.125 · SampleRTT
//! DevRTT          = 0.75  · DevRTT       + 0.25  · |SampleRTT − EstimatedRTT|
//! TimeoutInterval = EstimatedRTT + 4 · DevRTT
//! ```
//!
//! `DevRTT` is updated with the *new* `EstimatedRTT`.  The timeout is clamped
//! to `[min_rto, max_rto]`.  There is no exponential back-off: a timeout
//! restarts the timer with the current interval.

use std::time::Duration;

use crate::config::Config;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;

/// Which segments may contribute a `SampleRTT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RttSampling {
    /// Only segments transmitted exactly once are sampled.
    #[default]
    FreshOnly,
    /// Retransmitted segments are sampled too, timed from their latest
    /// transmission.
    IncludeRetransmitted,
}

/// Smoothed RTT state for one connection.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    estimated: Duration,
    deviation: Duration,
    timeout: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(config: &Config) -> Self {
        Self {
            estimated: config.initial_rtt,
            deviation: config.initial_rtt_dev,
            timeout: config.initial_rto.clamp(config.min_rto, config.max_rto),
            min_rto: config.min_rto,
            max_rto: config.max_rto,
        }
    }

    /// Fold one `SampleRTT` into the estimate and recompute the timeout.
    pub fn record_sample(&mut self, sample: Duration) {
        let sample_s = sample.as_secs_f64();
        let est = (1.0 - ALPHA) * self.estimated.as_secs_f64() + ALPHA * sample_s;
        let dev = (1.0 - BETA) * self.deviation.as_secs_f64() + BETA * (sample_s - est).abs();

        self.estimated = Duration::from_secs_f64(est);
        self.deviation = Duration::from_secs_f64(dev);
        self.timeout = (self.estimated + self.deviation * 4).clamp(self.min_rto, self.max_rto);
    }

    /// Current `TimeoutInterval`.
    pub fn rto(&self) -> Duration {
        self.timeout
    }

    pub fn estimated_rtt(&self) -> Duration {
        self.estimated
    }

    pub fn dev_rtt(&self) -> Duration {
        self.deviation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            initial_rtt: Duration::from_secs(1),
            initial_rtt_dev: Duration::from_millis(500),
            initial_rto: Duration::from_secs(2),
            min_rto: Duration::from_millis(1),
            max_rto: Duration::from_secs(60),
            ..Config::default()
        }
    }

    fn approx(d: Duration, secs: f64) -> bool {
        (d.as_secs_f64() - secs).abs() < 1e-6
    }

    #[test]
    fn initial_timeout_before_any_sample() {
        let est = RttEstimator::new(&config());
        assert_eq!(est.rto(), Duration::from_secs(2));
        assert_eq!(est.estimated_rtt(), Duration::from_secs(1));
    }

    #[test]
    fn one_sample_follows_the_formula() {
        let mut est = RttEstimator::new(&config());
        est.record_sample(Duration::from_millis(200));

        // 0.875 * 1.0 + 0.125 * 0.2 = 0.9
        assert!(approx(est.estimated_rtt(), 0.9));
        // 0.75 * 0.5 + 0.25 * |0.2 - 0.9| = 0.55
        assert!(approx(est.dev_rtt(), 0.55));
        // 0.9 + 4 * 0.55 = 3.1
        assert!(approx(est.rto(), 3.1));
    }

    #[test]
    fn steady_samples_converge() {
        let mut est = RttEstimator::new(&config());
        for _ in 0..200 {
            est.record_sample(Duration::from_millis(10));
        }
        assert!(approx(est.estimated_rtt(), 0.010));
        assert!(est.dev_rtt() < Duration::from_micros(10));
        assert!(est.rto() < Duration::from_millis(11));
    }

    #[test]
    fn timeout_is_clamped() {
        let mut cfg = config();
        cfg.min_rto = Duration::from_millis(50);
        cfg.max_rto = Duration::from_secs(2);
        let mut est = RttEstimator::new(&cfg);

        for _ in 0..200 {
            est.record_sample(Duration::from_micros(100));
        }
        assert_eq!(est.rto(), Duration::from_millis(50));

        est.record_sample(Duration::from_secs(30));
        assert_eq!(est.rto(), Duration::from_secs(2));
    }
}
