//! Scheduling policies
//!
//! A policy is a pure function of the flavour snapshot, the (possibly
//! absent) forecast and the ledger state. Four policies share one shape:
//! - `precision-tier`: carbon-insensitive baseline lockdown
//! - `credit-greedy`: spends the credit allowance on greener flavours
//! - `forecast-aware`: credit-greedy plus a short-term trend adjustment
//! - `forecast-aware-global`: fuses trend, demand, cumulative emissions
//!   and extended look-ahead
//!
//! Missing prerequisites walk the static fallback chain
//! `forecast-aware-global -> forecast-aware -> credit-greedy ->
//! precision-tier` and flag `policy_fallback` in the diagnostics.

mod credit_greedy;
mod forecast_aware;
mod forecast_aware_global;
mod precision_tier;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;

use crate::error::EngineError;
use crate::models::{FlavourProfile, ForecastSnapshot, PolicyResult};

/// Numerical guard for weight normalisation and divisions.
pub const EPSILON: f64 = 1e-6;

/// The selectable scheduling policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    PrecisionTier,
    CreditGreedy,
    ForecastAware,
    ForecastAwareGlobal,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::PrecisionTier => "precision-tier",
            PolicyKind::CreditGreedy => "credit-greedy",
            PolicyKind::ForecastAware => "forecast-aware",
            PolicyKind::ForecastAwareGlobal => "forecast-aware-global",
        }
    }

    /// Next policy in the degradation chain.
    fn fallback(&self) -> Option<PolicyKind> {
        match self {
            PolicyKind::ForecastAwareGlobal => Some(PolicyKind::ForecastAware),
            PolicyKind::ForecastAware => Some(PolicyKind::CreditGreedy),
            PolicyKind::CreditGreedy => Some(PolicyKind::PrecisionTier),
            PolicyKind::PrecisionTier => None,
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "precision-tier" => Ok(PolicyKind::PrecisionTier),
            "credit-greedy" => Ok(PolicyKind::CreditGreedy),
            "forecast-aware" => Ok(PolicyKind::ForecastAware),
            "forecast-aware-global" => Ok(PolicyKind::ForecastAwareGlobal),
            _ => Err(()),
        }
    }
}

/// Running emissions totals owned by the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmissionsStats {
    pub cumulative_gco2: f64,
    pub request_count: u64,
}

impl EmissionsStats {
    pub fn accrue(&mut self, grams: f64, requests: u64) {
        self.cumulative_gco2 += grams.max(0.0);
        self.request_count += requests;
    }

    /// Average grams per accounted request; 0 before any accounting.
    pub fn average(&self) -> f64 {
        self.cumulative_gco2 / (self.request_count.max(1) as f64)
    }
}

/// Immutable inputs shared by every policy evaluation.
pub struct PolicyContext<'a> {
    /// Enabled flavours, sorted by descending precision.
    pub flavours: &'a [FlavourProfile],
    pub forecast: Option<&'a ForecastSnapshot>,
    pub balance: f64,
    /// Ledger allowance in [0, 1].
    pub allowance: f64,
    /// Windowed median of observed current intensity.
    pub intensity_reference: Option<f64>,
    pub emissions: EmissionsStats,
    /// Cap for the forecast-aware trend adjustment.
    pub trend_cap: f64,
    /// Scale for the forecast-aware trend adjustment.
    pub trend_scale: f64,
}

impl<'a> PolicyContext<'a> {
    pub fn baseline(&self) -> &FlavourProfile {
        &self.flavours[0]
    }
}

/// Evaluate `kind`, degrading along the fallback chain when a policy's
/// prerequisites are missing. Only fails when no flavour is enabled.
pub fn evaluate(kind: PolicyKind, ctx: &PolicyContext<'_>) -> Result<PolicyResult, EngineError> {
    if ctx.flavours.is_empty() {
        return Err(EngineError::Internal(anyhow!(
            "no enabled flavours to schedule"
        )));
    }

    let mut current = kind;
    let mut fell_back = false;
    loop {
        let attempt = match current {
            PolicyKind::PrecisionTier => Some(precision_tier::evaluate(ctx)),
            PolicyKind::CreditGreedy => credit_greedy::evaluate(ctx),
            PolicyKind::ForecastAware => forecast_aware::evaluate(ctx),
            PolicyKind::ForecastAwareGlobal => forecast_aware_global::evaluate(ctx),
        };
        if let Some(mut result) = attempt {
            if fell_back {
                result.diagnostics.insert("policy_fallback".to_string(), 1.0);
            }
            debug_assert!((weight_sum(&result.weights) - 1.0).abs() <= EPSILON);
            return Ok(result);
        }
        // precision-tier always succeeds, so the chain terminates.
        current = current.fallback().expect("fallback chain exhausted");
        fell_back = true;
    }
}

pub(crate) fn weight_sum(weights: &BTreeMap<String, f64>) -> f64 {
    weights.values().sum()
}

/// Normalise weights in place so they sum to 1.
pub(crate) fn normalise(weights: &mut BTreeMap<String, f64>) {
    let total = weight_sum(weights);
    if total > EPSILON {
        for value in weights.values_mut() {
            *value /= total;
        }
    }
}

/// Weighted average precision over the flavour set.
pub(crate) fn expected_precision(
    flavours: &[FlavourProfile],
    weights: &BTreeMap<String, f64>,
) -> f64 {
    flavours
        .iter()
        .map(|f| weights.get(&f.name).copied().unwrap_or(0.0) * f.precision)
        .sum()
}

/// Per-request intensity of a flavour; zero estimates fall back to the
/// current grid intensity.
pub(crate) fn effective_intensity(flavour: &FlavourProfile, intensity_now: Option<f64>) -> f64 {
    if flavour.carbon_intensity > 0.0 {
        flavour.carbon_intensity
    } else {
        intensity_now.unwrap_or(0.0)
    }
}
