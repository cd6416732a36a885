//! Core data models for the decision engine
//!
//! - `FlavourProfile`: precision/energy variants of the target workload
//! - `ForecastPoint` / `ForecastSnapshot`: carbon intensity and demand forecasts
//! - `PolicyResult`: output of a scheduling policy evaluation
//! - `SchedulerConfig` / `ConfigUpdate`: runtime configuration and its merge form

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EngineError;
use crate::policy::PolicyKind;
use crate::throttle::ThrottleConfig;

/// Clamp `value` to the range `[low, high]`.
pub(crate) fn clamp(value: f64, low: f64, high: f64) -> f64 {
    value.max(low).min(high)
}

/// Derive the canonical flavour name from a precision value,
/// e.g. `precision-30` for 0.3.
pub fn precision_key(precision: f64) -> String {
    let clamped = clamp(precision, 0.0, 1.0);
    format!("precision-{}", (clamped * 100.0).round() as u32)
}

/// One precision/energy variant of the target workload.
///
/// Each flavour corresponds to a deployment serving the same requests at a
/// specific quality level. A `carbon_intensity` of zero means "unknown" and
/// the current grid intensity is substituted when scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlavourProfile {
    pub name: String,
    /// Quality relative to the baseline, in (0, 1].
    pub precision: f64,
    /// Estimated grams CO2e per request; 0 = unknown.
    pub carbon_intensity: f64,
    /// Relative latency cost factor.
    pub latency_weight: f64,
    /// Queue deadline hint for router consumers, seconds.
    pub deadline: Option<u64>,
    pub enabled: bool,
    /// Metadata carried from deployment labels.
    pub annotations: BTreeMap<String, String>,
}

impl FlavourProfile {
    pub fn new(name: impl Into<String>, precision: f64, carbon_intensity: f64) -> Self {
        Self {
            name: name.into(),
            precision,
            carbon_intensity,
            latency_weight: 1.0,
            deadline: None,
            enabled: true,
            annotations: BTreeMap::new(),
        }
    }

    /// Expected quality error of this flavour (0 = perfect).
    pub fn expected_error(&self) -> f64 {
        (1.0 - self.precision).max(0.0)
    }
}

/// Carbon intensity forecast for one provider slot (~30 minutes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastPoint {
    #[serde(rename = "from")]
    pub start: DateTime<Utc>,
    #[serde(rename = "to")]
    pub end: DateTime<Utc>,
    pub forecast: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
}

/// Extended look-ahead sample derived from the slot schedule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExtendedPoint {
    /// Hours from the sampling instant to the slot midpoint.
    pub horizon_hours: f64,
    pub intensity: f64,
}

/// Immutable observation produced by the forecast provider per evaluation.
///
/// Demand estimates are folded in by the session before policy evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForecastSnapshot {
    pub intensity_now: Option<f64>,
    pub intensity_next: Option<f64>,
    pub index_now: Option<String>,
    pub index_next: Option<String>,
    pub demand_now: Option<f64>,
    pub demand_next: Option<f64>,
    /// Set when `intensity_next` had to be backfilled from `intensity_now`.
    pub degraded: bool,
    pub generated_at: Option<DateTime<Utc>>,
    pub schedule: Vec<ForecastPoint>,
    /// Up to 48 h of look-ahead points, ordered by horizon.
    pub extended: Vec<ExtendedPoint>,
}

/// Result of one policy evaluation.
///
/// Weights are non-negative, cover exactly the enabled flavours and sum to 1.
#[derive(Debug, Clone)]
pub struct PolicyResult {
    pub weights: BTreeMap<String, f64>,
    pub expected_precision: f64,
    pub diagnostics: BTreeMap<String, f64>,
}

/// Replica bounds for one scaled component.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBounds {
    pub min_replicas: u32,
    pub max_replicas: u32,
}

/// Runtime configuration for one scheduler session.
///
/// Constructed from environment defaults and merged with operator pushes
/// via [`ConfigUpdate`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Target quality error threshold, in [0, 1).
    pub target_error: f64,
    pub credit_min: f64,
    pub credit_max: f64,
    /// Smoothing/observation window in seconds.
    pub credit_window: u64,
    /// Allowance damping exponent in (0, 1]; 1 = linear.
    pub credit_sensitivity: f64,
    pub policy: PolicyKind,
    /// Schedule validity period in seconds.
    pub valid_for: u64,
    /// Flavour discovery refresh hint for the reconciler, seconds.
    pub discovery_interval: u64,
    pub carbon_target: String,
    pub carbon_timeout: f64,
    pub carbon_cache_ttl: f64,
    pub throttle: ThrottleConfig,
    pub component_bounds: BTreeMap<String, ComponentBounds>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            target_error: 0.05,
            credit_min: -0.5,
            credit_max: 0.5,
            credit_window: 300,
            credit_sensitivity: 1.0,
            policy: PolicyKind::CreditGreedy,
            valid_for: 60,
            discovery_interval: 60,
            carbon_target: "national".to_string(),
            carbon_timeout: 2.0,
            carbon_cache_ttl: 300.0,
            throttle: ThrottleConfig::default(),
            component_bounds: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Merge an already-validated update in place. Fields absent from the
    /// update keep their current values, so pushing the same payload twice
    /// is a no-op.
    pub fn apply(&mut self, update: &ConfigUpdate) {
        if let Some(v) = update.target_error {
            self.target_error = v;
        }
        if let Some(v) = update.credit_min {
            self.credit_min = v;
        }
        if let Some(v) = update.credit_max {
            self.credit_max = v;
        }
        if let Some(v) = update.credit_window {
            self.credit_window = v;
        }
        if let Some(v) = update.credit_sensitivity {
            self.credit_sensitivity = v;
        }
        if let Some(ref v) = update.policy {
            // Parse already checked by validate().
            if let Ok(kind) = v.parse::<PolicyKind>() {
                self.policy = kind;
            }
        }
        if let Some(v) = update.valid_for {
            self.valid_for = v;
        }
        if let Some(v) = update.discovery_interval {
            self.discovery_interval = v;
        }
        if let Some(ref v) = update.carbon_target {
            self.carbon_target = v.clone();
        }
        if let Some(v) = update.carbon_timeout {
            self.carbon_timeout = v;
        }
        if let Some(v) = update.carbon_cache_ttl {
            self.carbon_cache_ttl = v;
        }
        if let Some(ref components) = update.components {
            self.component_bounds = components
                .iter()
                .map(|(name, bounds)| (name.clone(), *bounds))
                .collect();
        }
    }
}

/// Flavour entry as pushed by the reconciler.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlavourInput {
    pub name: Option<String>,
    pub precision: f64,
    pub carbon_intensity: Option<f64>,
    pub latency_weight: Option<f64>,
    pub deadline: Option<u64>,
    pub enabled: Option<bool>,
    pub annotations: Option<BTreeMap<String, String>>,
}

impl FlavourInput {
    /// Normalised precision: values above 1 are interpreted as percentages.
    fn normalised_precision(&self) -> f64 {
        let mut precision = self.precision;
        if precision > 1.0 {
            precision /= 100.0;
        }
        precision
    }

    fn into_profile(self) -> FlavourProfile {
        let precision = clamp(self.normalised_precision(), 0.0, 1.0);
        let name = match self.name {
            Some(name) if !name.is_empty() => name,
            _ => precision_key(precision),
        };
        FlavourProfile {
            name,
            precision,
            carbon_intensity: self.carbon_intensity.unwrap_or(0.0).max(0.0),
            latency_weight: self.latency_weight.unwrap_or(1.0).max(0.0),
            deadline: self.deadline,
            enabled: self.enabled.unwrap_or(true),
            annotations: self.annotations.unwrap_or_default(),
        }
    }
}

/// Configuration payload accepted on `PUT /config/{ns}/{name}`.
///
/// All fields are optional; the update is merged over the session's current
/// configuration. Unknown keys are collected and logged, not rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub target_error: Option<f64>,
    pub credit_min: Option<f64>,
    pub credit_max: Option<f64>,
    pub credit_window: Option<u64>,
    pub credit_sensitivity: Option<f64>,
    pub policy: Option<String>,
    pub valid_for: Option<u64>,
    pub discovery_interval: Option<u64>,
    pub carbon_target: Option<String>,
    pub carbon_timeout: Option<f64>,
    #[serde(rename = "carbonCacheTTL")]
    pub carbon_cache_ttl: Option<f64>,
    pub components: Option<BTreeMap<String, ComponentBounds>>,
    pub flavours: Option<Vec<FlavourInput>>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl ConfigUpdate {
    /// Structural validation applied before any session state is touched.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.unknown.is_empty() {
            let keys: Vec<&str> = self.unknown.keys().map(String::as_str).collect();
            warn!(keys = ?keys, "Ignoring unknown configuration fields");
        }
        if let Some(v) = self.target_error {
            if !v.is_finite() || !(0.0..1.0).contains(&v) {
                return Err(EngineError::Validation(format!(
                    "targetError must be in [0, 1), got {v}"
                )));
            }
        }
        match (self.credit_min, self.credit_max) {
            (Some(min), _) if !min.is_finite() || min > 0.0 => {
                return Err(EngineError::Validation(format!(
                    "creditMin must be <= 0, got {min}"
                )));
            }
            (_, Some(max)) if !max.is_finite() || max < 0.0 => {
                return Err(EngineError::Validation(format!(
                    "creditMax must be >= 0, got {max}"
                )));
            }
            _ => {}
        }
        if let Some(v) = self.credit_window {
            if v < 1 {
                return Err(EngineError::Validation(
                    "creditWindow must be >= 1".to_string(),
                ));
            }
        }
        if let Some(v) = self.credit_sensitivity {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) || v == 0.0 {
                return Err(EngineError::Validation(format!(
                    "creditSensitivity must be in (0, 1], got {v}"
                )));
            }
        }
        if let Some(ref name) = self.policy {
            name.parse::<PolicyKind>()
                .map_err(|_| EngineError::Validation(format!("unknown policy '{name}'")))?;
        }
        if let Some(v) = self.valid_for {
            if v < 1 {
                return Err(EngineError::Validation(
                    "validFor must be >= 1".to_string(),
                ));
            }
        }
        if let Some(v) = self.carbon_timeout {
            if !v.is_finite() || v <= 0.0 {
                return Err(EngineError::Validation(
                    "carbonTimeout must be positive".to_string(),
                ));
            }
        }
        if let Some(v) = self.carbon_cache_ttl {
            if !v.is_finite() || v < 0.0 {
                return Err(EngineError::Validation(
                    "carbonCacheTTL must be non-negative".to_string(),
                ));
            }
        }
        if let Some(ref components) = self.components {
            for (name, bounds) in components {
                if bounds.max_replicas == 0 || bounds.min_replicas > bounds.max_replicas {
                    return Err(EngineError::Validation(format!(
                        "component '{name}' has invalid replica bounds {}..{}",
                        bounds.min_replicas, bounds.max_replicas
                    )));
                }
            }
        }
        if let Some(ref flavours) = self.flavours {
            for flavour in flavours {
                let precision = flavour.normalised_precision();
                if !precision.is_finite() || precision <= 0.0 || precision > 1.0 {
                    return Err(EngineError::Validation(format!(
                        "flavour precision must be in (0, 1], got {}",
                        flavour.precision
                    )));
                }
            }
        }
        Ok(())
    }

    /// Convert the flavour section, if present, into profiles.
    pub fn flavour_profiles(&self) -> Option<Vec<FlavourProfile>> {
        self.flavours
            .as_ref()
            .map(|list| list.iter().cloned().map(FlavourInput::into_profile).collect())
    }
}
