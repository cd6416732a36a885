//! Processing throttle
//!
//! Derives a scalar throttle from the credit balance and the current grid
//! intensity, smooths it with a first-order IIR filter and maps it onto
//! per-component replica ceilings. Components named `router` keep their
//! full ceiling so ingress capacity is never cut; the throttle trades
//! buffering latency for scaled-down downstream workers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{clamp, ComponentBounds};

/// Ingress component exempt from throttling.
const ROUTER_COMPONENT: &str = "router";

/// Throttle tunables.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    /// Lower clamp of the throttle.
    pub throttle_min: f64,
    /// Intensity below this scales freely (ratio 1).
    pub intensity_floor: f64,
    /// Intensity above this throttles fully (ratio 0).
    pub intensity_ceiling: f64,
    /// IIR smoothing factor.
    pub beta: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            throttle_min: 0.2,
            intensity_floor: 150.0,
            intensity_ceiling: 350.0,
            beta: 0.5,
        }
    }
}

/// Published processing directive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingDirective {
    #[serde(default = "full_ratio")]
    pub throttle: f64,
    #[serde(default = "full_ratio")]
    pub credits_ratio: f64,
    #[serde(default = "full_ratio")]
    pub intensity_ratio: f64,
    #[serde(default)]
    pub ceilings: BTreeMap<String, u32>,
}

fn full_ratio() -> f64 {
    1.0
}

impl Default for ProcessingDirective {
    fn default() -> Self {
        Self {
            throttle: 1.0,
            credits_ratio: 1.0,
            intensity_ratio: 1.0,
            ceilings: BTreeMap::new(),
        }
    }
}

/// Per-session throttle state; owns the IIR memory.
#[derive(Debug, Default)]
pub struct ProcessingState {
    smoothed: Option<f64>,
}

impl ProcessingState {
    /// Raw throttle before smoothing; exposed for diagnostics.
    pub fn raw_throttle(
        config: &ThrottleConfig,
        credit_balance: f64,
        credit_min: f64,
        credit_max: f64,
        intensity_now: Option<f64>,
    ) -> (f64, f64, f64) {
        let span = credit_max - credit_min;
        let credits_ratio = if span > 0.0 {
            clamp((credit_balance - credit_min) / span, 0.0, 1.0)
        } else {
            1.0
        };

        let intensity_ratio = match intensity_now {
            Some(now) if config.intensity_ceiling > config.intensity_floor => {
                1.0 - clamp(
                    (now - config.intensity_floor)
                        / (config.intensity_ceiling - config.intensity_floor),
                    0.0,
                    1.0,
                )
            }
            _ => 1.0,
        };

        let raw = credits_ratio.min(intensity_ratio).max(config.throttle_min);
        (raw, credits_ratio, intensity_ratio)
    }

    /// Fold the current cycle into the smoothed throttle and derive the
    /// component ceilings. The first cycle publishes the raw clamp (there
    /// is no previous output to blend with).
    pub fn advance(
        &mut self,
        config: &ThrottleConfig,
        credit_balance: f64,
        credit_min: f64,
        credit_max: f64,
        intensity_now: Option<f64>,
        component_bounds: &BTreeMap<String, ComponentBounds>,
    ) -> ProcessingDirective {
        let (raw, credits_ratio, intensity_ratio) = Self::raw_throttle(
            config,
            credit_balance,
            credit_min,
            credit_max,
            intensity_now,
        );

        let throttle = match self.smoothed {
            Some(previous) => (1.0 - config.beta) * previous + config.beta * raw,
            None => raw,
        };
        self.smoothed = Some(throttle);

        let ceilings = component_bounds
            .iter()
            .map(|(name, bounds)| {
                let ceiling = if name == ROUTER_COMPONENT {
                    bounds.max_replicas
                } else {
                    let scaled = (bounds.max_replicas as f64 * throttle).floor() as u32;
                    scaled.max(bounds.min_replicas).min(bounds.max_replicas)
                };
                (name.clone(), ceiling)
            })
            .collect();

        ProcessingDirective {
            throttle,
            credits_ratio,
            intensity_ratio,
            ceilings,
        }
    }

    /// Drop the IIR memory (used when a manual override takes control).
    pub fn reset(&mut self) {
        self.smoothed = None;
    }
}
