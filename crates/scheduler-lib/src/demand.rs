//! Demand estimator
//!
//! Exponential smoothing over router-reported request counts. Produces the
//! current smoothed rate and a short-horizon projection derived from the
//! smoothed relative slope. Estimates decay to zero when no samples arrive
//! within the observation window.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::clamp;

/// Maximum relative slope applied to the projection.
const SLOPE_LIMIT: f64 = 0.5;

/// Configuration for the demand estimator.
#[derive(Debug, Clone)]
pub struct DemandConfig {
    /// EMA smoothing factor for the rate and slope.
    pub smoothing: f64,
    /// Staleness cutoff; without samples for this long both estimates are 0.
    pub window: Duration,
}

impl Default for DemandConfig {
    fn default() -> Self {
        Self {
            smoothing: 0.3,
            window: Duration::from_secs(300),
        }
    }
}

/// Current and projected request rates, requests per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemandEstimate {
    pub now: f64,
    pub next: f64,
}

#[derive(Debug, Clone, Copy)]
struct DemandState {
    rate: f64,
    slope: f64,
    last_sample: Instant,
}

/// Exponential-smoothing request-rate predictor.
#[derive(Debug)]
pub struct DemandEstimator {
    config: DemandConfig,
    state: Mutex<Option<DemandState>>,
}

impl DemandEstimator {
    pub fn new(config: DemandConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    /// Fold in one sampling window of request counts.
    pub fn update(&self, request_count: u64, window_seconds: f64) {
        self.update_at(request_count, window_seconds, Instant::now());
    }

    fn update_at(&self, request_count: u64, window_seconds: f64, now: Instant) {
        if window_seconds <= 0.0 {
            return;
        }
        let sample_rate = request_count as f64 / window_seconds;
        let mut guard = self.state.lock().expect("demand estimator poisoned");
        let next = match *guard {
            None => DemandState {
                rate: sample_rate,
                slope: 0.0,
                last_sample: now,
            },
            Some(state) => {
                let alpha = self.config.smoothing;
                let rate = alpha * sample_rate + (1.0 - alpha) * state.rate;
                let slope = if state.rate > f64::EPSILON {
                    let sample_slope =
                        clamp((sample_rate - state.rate) / state.rate, -SLOPE_LIMIT, SLOPE_LIMIT);
                    alpha * sample_slope + (1.0 - alpha) * state.slope
                } else {
                    0.0
                };
                DemandState {
                    rate,
                    slope,
                    last_sample: now,
                }
            }
        };
        *guard = Some(next);
    }

    /// Current estimate; `next = now * (1 + slope)` with the slope clamped
    /// to +/-50%.
    pub fn estimate(&self) -> DemandEstimate {
        self.estimate_at(Instant::now())
    }

    fn estimate_at(&self, now: Instant) -> DemandEstimate {
        let guard = self.state.lock().expect("demand estimator poisoned");
        match *guard {
            Some(state) if now.duration_since(state.last_sample) <= self.config.window => {
                let slope = clamp(state.slope, -SLOPE_LIMIT, SLOPE_LIMIT);
                DemandEstimate {
                    now: state.rate,
                    next: (state.rate * (1.0 + slope)).max(0.0),
                }
            }
            _ => DemandEstimate { now: 0.0, next: 0.0 },
        }
    }
}

impl Default for DemandEstimator {
    fn default() -> Self {
        Self::new(DemandConfig::default())
    }
}
