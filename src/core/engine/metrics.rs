use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

pub const DEGRADED_ERROR_RATE: f64 = 0.10;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub total_inferences: u64,
    pub total_errors: u64,
    pub avg_latency: Duration,
    pub last_inference_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    successes: u64,
}

impl Metrics {
    pub fn error_rate(&self) -> f64 {
        if self.total_inferences == 0 {
            return 0.0;
        }
        self.total_errors as f64 / self.total_inferences as f64
    }

    pub fn is_degraded(&self) -> bool {
        self.error_rate() > DEGRADED_ERROR_RATE
    }

    pub(crate) fn record_attempt(&mut self) {
        self.total_inferences += 1;
        self.last_inference_at = Some(Utc::now());
    }

    pub(crate) fn record_success(&mut self, latency: Duration) {
        self.successes += 1;
        let prev = self.avg_latency.as_secs_f64();
        let mean = prev + (latency.as_secs_f64() - prev) / self.successes as f64;
        self.avg_latency = Duration::from_secs_f64(mean.max(0.0));
    }

    pub(crate) fn record_failure(&mut self) {
        self.total_errors += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_mean() {
        let mut m = Metrics::default();
        for ms in [10u64, 20, 30] {
            m.record_attempt();
            m.record_success(Duration::from_millis(ms));
        }
        assert_eq!(m.total_inferences, 3);
        assert!((m.avg_latency.as_secs_f64() - 0.020).abs() < 1e-9);
        assert!(m.last_inference_at.is_some());
    }

    #[test]
    fn test_failures_do_not_move_mean() {
        let mut m = Metrics::default();
        m.record_attempt();
        m.record_success(Duration::from_millis(8));
        m.record_attempt();
        m.record_failure();
        assert_eq!(m.avg_latency, Duration::from_millis(8));
        assert_eq!(m.error_rate(), 0.5);
        assert!(m.is_degraded());
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut m = Metrics::default();
        for i in 0..10 {
            m.record_attempt();
            if i == 0 {
                m.record_failure();
            }
        }
        // exactly 10% is still healthy
        assert!(!m.is_degraded());
    }
}
