//! Throughput and remaining-time estimation.
//!
//! The estimator keeps a short rolling window of `(instant, processed)`
//! samples. The rate is an exponentially weighted moving average of the
//! per-sample-pair rates, floored at a fraction of the overall average so a
//! single slow chunk can't push the estimate towards infinity.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MAX_SAMPLES: usize = 30;
const MAX_AGE: Duration = Duration::from_secs(60);
const ALPHA: f64 = 0.3;
const FLOOR_RATIO: f64 = 0.2;
const WARMUP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimate {
    /// Items per second.
    pub rate: f64,
    pub seconds_remaining: u64,
}

#[derive(Debug, Clone)]
pub struct Estimator {
    started: Instant,
    samples: VecDeque<(Instant, u64)>,
}

impl Estimator {
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    pub fn started_at(started: Instant) -> Self {
        Self {
            started,
            samples: VecDeque::with_capacity(MAX_SAMPLES),
        }
    }

    pub fn record(&mut self, processed: u64) {
        self.record_at(Instant::now(), processed);
    }

    pub fn record_at(&mut self, now: Instant, processed: u64) {
        self.samples.push_back((now, processed));
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
        while self.samples.len() > 1 {
            match self.samples.front() {
                Some((at, _)) if now.duration_since(*at) > MAX_AGE => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    pub fn estimate(&self, total: u64) -> Option<Estimate> {
        self.estimate_at(Instant::now(), total)
    }

    /// `None` during warm-up or before anything was processed.
    pub fn estimate_at(&self, now: Instant, total: u64) -> Option<Estimate> {
        let elapsed = now.duration_since(self.started);
        if elapsed < WARMUP {
            return None;
        }
        let &(_, processed) = self.samples.back()?;
        if processed == 0 {
            return None;
        }

        let overall = processed as f64 / elapsed.as_secs_f64();
        let mut smoothed: Option<f64> = None;
        for (a, b) in self.samples.iter().zip(self.samples.iter().skip(1)) {
            let dt = b.0.duration_since(a.0).as_secs_f64();
            if dt <= 0.0 {
                continue;
            }
            let r = b.1.saturating_sub(a.1) as f64 / dt;
            smoothed = Some(match smoothed {
                None => r,
                Some(prev) => ALPHA * r + (1.0 - ALPHA) * prev,
            });
        }
        let rate = smoothed.unwrap_or(overall).max(FLOOR_RATIO * overall);
        if rate <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(processed) as f64;
        Some(Estimate {
            rate,
            seconds_remaining: (remaining / rate).ceil() as u64,
        })
    }
}

impl Default for Estimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_estimate_during_warmup() {
        let t0 = Instant::now();
        let mut e = Estimator::started_at(t0);
        e.record_at(t0 + Duration::from_millis(500), 100);
        assert!(e.estimate_at(t0 + Duration::from_millis(1500), 1000).is_none());
    }

    #[test]
    fn no_estimate_before_any_item() {
        let t0 = Instant::now();
        let mut e = Estimator::started_at(t0);
        assert!(e.estimate_at(t0 + Duration::from_secs(5), 1000).is_none());
        e.record_at(t0 + Duration::from_secs(5), 0);
        assert!(e.estimate_at(t0 + Duration::from_secs(6), 1000).is_none());
    }

    #[test]
    fn steady_rate_gives_linear_estimate() {
        let t0 = Instant::now();
        let mut e = Estimator::started_at(t0);
        for s in 1..=10u64 {
            e.record_at(t0 + Duration::from_secs(s), s * 10);
        }
        let est = e.estimate_at(t0 + Duration::from_secs(10), 200).unwrap();
        assert!((est.rate - 10.0).abs() < 1e-6);
        assert_eq!(est.seconds_remaining, 10);
    }

    #[test]
    fn stall_is_floored_at_fraction_of_average() {
        let t0 = Instant::now();
        let mut e = Estimator::started_at(t0);
        e.record_at(t0 + Duration::from_secs(1), 100);
        for s in 2..=20u64 {
            e.record_at(t0 + Duration::from_secs(s), 100);
        }
        let est = e.estimate_at(t0 + Duration::from_secs(20), 200).unwrap();
        let overall = 100.0 / 20.0;
        assert!(est.rate >= FLOOR_RATIO * overall - 1e-9);
    }

    #[test]
    fn window_is_bounded() {
        let t0 = Instant::now();
        let mut e = Estimator::started_at(t0);
        for s in 0..200u64 {
            e.record_at(t0 + Duration::from_secs(s), s);
        }
        assert!(e.samples.len() <= MAX_SAMPLES);
        let oldest = e.samples.front().unwrap().0;
        assert!(t0 + Duration::from_secs(199) - oldest <= MAX_AGE);
    }
}
