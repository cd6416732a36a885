//! Published schedule snapshot
//!
//! The wire contract read by the traffic router and written back to the
//! workload resource status by the reconciler. Snapshots are immutable;
//! the session replaces the published one atomically each cycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{FlavourProfile, ForecastPoint, ForecastSnapshot, PolicyResult, SchedulerConfig};
use crate::throttle::ProcessingDirective;

/// Identifies the policy that produced a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInfo {
    pub name: String,
}

/// Credit ledger state at publication time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreditSummary {
    pub balance: f64,
    pub velocity: f64,
    pub target: f64,
    pub min: f64,
    pub max: f64,
    pub allowance: f64,
}

/// Per-flavour metadata in the published schedule. Precision and weight
/// are integer percentages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlavourSummary {
    pub name: String,
    pub precision: u32,
    pub weight: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<u64>,
    pub carbon_intensity: f64,
    pub enabled: bool,
}

/// Forecast excerpt carried on the snapshot for observers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForecastSummary {
    pub intensity_now: Option<f64>,
    pub intensity_next: Option<f64>,
    #[serde(default)]
    pub schedule: Vec<ForecastPoint>,
}

/// The atomically-published result of one evaluation (or an operator
/// override when `manual` is set).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSnapshot {
    /// Integer percentages summing to 100.
    pub flavour_weights: BTreeMap<String, u32>,
    pub flavours: Vec<FlavourSummary>,
    pub policy: PolicyInfo,
    pub credits: CreditSummary,
    pub processing: ProcessingDirective,
    pub forecast: ForecastSummary,
    #[serde(default)]
    pub diagnostics: BTreeMap<String, f64>,
    pub avg_precision: f64,
    pub valid_until: DateTime<Utc>,
    pub manual: bool,
}

impl ScheduleSnapshot {
    /// Assemble the published form from one evaluation cycle.
    #[allow(clippy::too_many_arguments)]
    pub fn from_evaluation(
        result: &PolicyResult,
        flavours: &[FlavourProfile],
        config: &SchedulerConfig,
        credits: CreditSummary,
        processing: ProcessingDirective,
        forecast: Option<&ForecastSnapshot>,
        diagnostics: BTreeMap<String, f64>,
        valid_until: DateTime<Utc>,
    ) -> Self {
        let flavour_weights = percent_weights(&result.weights, flavours);

        let flavour_meta = flavours
            .iter()
            .map(|f| FlavourSummary {
                name: f.name.clone(),
                precision: (f.precision * 100.0).round() as u32,
                weight: flavour_weights.get(&f.name).copied().unwrap_or(0),
                deadline: f.deadline,
                carbon_intensity: f.carbon_intensity,
                enabled: f.enabled,
            })
            .collect();

        let forecast_summary = forecast
            .map(|f| ForecastSummary {
                intensity_now: f.intensity_now,
                intensity_next: f.intensity_next,
                schedule: f.schedule.clone(),
            })
            .unwrap_or_default();

        Self {
            flavour_weights,
            flavours: flavour_meta,
            policy: PolicyInfo {
                name: config.policy.as_str().to_string(),
            },
            credits,
            processing,
            forecast: forecast_summary,
            diagnostics,
            avg_precision: result.expected_precision,
            valid_until,
            manual: false,
        }
    }
}

/// Partial snapshot accepted on the manual-override endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualScheduleRequest {
    pub flavour_weights: Option<BTreeMap<String, f64>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub processing: Option<ProcessingDirective>,
    pub diagnostics: Option<BTreeMap<String, f64>>,
}

/// Convert fractional weights to integer percentages summing to exactly
/// 100. The rounding residual lands on the highest-precision enabled
/// flavour; if that would push it negative, the largest entry absorbs it.
pub(crate) fn percent_weights(
    weights: &BTreeMap<String, f64>,
    flavours: &[FlavourProfile],
) -> BTreeMap<String, u32> {
    let total: f64 = weights.values().sum();
    let total = if total > 0.0 { total } else { 1.0 };

    let mut scaled: BTreeMap<String, i64> = weights
        .iter()
        .map(|(name, value)| (name.clone(), ((value / total) * 100.0).round() as i64))
        .collect();

    let residual = 100 - scaled.values().sum::<i64>();
    if residual != 0 && !scaled.is_empty() {
        let baseline = flavours
            .iter()
            .find(|f| f.enabled && scaled.contains_key(&f.name))
            .map(|f| f.name.clone());
        let target = match baseline {
            Some(name) if scaled[&name] + residual >= 0 => name,
            _ => scaled
                .iter()
                .max_by_key(|(_, value)| **value)
                .map(|(name, _)| name.clone())
                .expect("non-empty weights"),
        };
        *scaled.get_mut(&target).expect("target exists") += residual;
    }

    scaled
        .into_iter()
        .map(|(name, value)| (name, value.max(0) as u32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flavours() -> Vec<FlavourProfile> {
        vec![
            FlavourProfile::new("precision-100", 1.0, 200.0),
            FlavourProfile::new("precision-70", 0.7, 80.0),
            FlavourProfile::new("precision-30", 0.3, 40.0),
        ]
    }

    #[test]
    fn test_percent_weights_sum_to_hundred() {
        let mut weights = BTreeMap::new();
        weights.insert("precision-100".to_string(), 1.0 / 3.0);
        weights.insert("precision-70".to_string(), 1.0 / 3.0);
        weights.insert("precision-30".to_string(), 1.0 / 3.0);

        let percents = percent_weights(&weights, &flavours());
        assert_eq!(percents.values().sum::<u32>(), 100);
        // The residual lands on the baseline.
        assert_eq!(percents["precision-100"], 34);
        assert_eq!(percents["precision-70"], 33);
        assert_eq!(percents["precision-30"], 33);
    }

    #[test]
    fn test_percent_weights_exact_split() {
        let mut weights = BTreeMap::new();
        weights.insert("precision-100".to_string(), 0.6);
        weights.insert("precision-70".to_string(), 0.4);

        let percents = percent_weights(&weights, &flavours());
        assert_eq!(percents["precision-100"], 60);
        assert_eq!(percents["precision-70"], 40);
    }

    #[test]
    fn test_percent_weights_unnormalised_input() {
        let mut weights = BTreeMap::new();
        weights.insert("precision-100".to_string(), 2.0);
        weights.insert("precision-70".to_string(), 2.0);

        let percents = percent_weights(&weights, &flavours());
        assert_eq!(percents.values().sum::<u32>(), 100);
    }

    #[test]
    fn test_snapshot_serialises_camel_case() {
        let result = PolicyResult {
            weights: BTreeMap::from([
                ("precision-100".to_string(), 1.0),
                ("precision-70".to_string(), 0.0),
            ]),
            expected_precision: 1.0,
            diagnostics: BTreeMap::new(),
        };
        let config = SchedulerConfig::default();
        let snapshot = ScheduleSnapshot::from_evaluation(
            &result,
            &flavours(),
            &config,
            CreditSummary {
                balance: 0.0,
                velocity: 0.0,
                target: 0.05,
                min: -0.5,
                max: 0.5,
                allowance: 0.5,
            },
            ProcessingDirective::default(),
            None,
            BTreeMap::new(),
            Utc::now(),
        );

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("flavourWeights").is_some());
        assert!(json.get("validUntil").is_some());
        assert!(json.get("avgPrecision").is_some());
        assert_eq!(json["policy"]["name"], "credit-greedy");
        assert_eq!(json["flavourWeights"]["precision-100"], 100);
        // The forecast block keeps its snake_case keys.
        assert!(json["forecast"].get("intensity_now").is_some());
    }

    #[test]
    fn test_manual_request_parses_partial_payload() {
        let request: ManualScheduleRequest = serde_json::from_value(serde_json::json!({
            "flavourWeights": { "precision-100": 100 },
            "validUntil": "2026-08-02T13:00:00Z"
        }))
        .unwrap();
        assert_eq!(request.flavour_weights.unwrap()["precision-100"], 100.0);
        assert!(request.valid_until.is_some());
        assert!(request.processing.is_none());
    }
}
