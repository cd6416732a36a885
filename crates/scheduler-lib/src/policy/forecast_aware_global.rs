//! Forecast-aware-global policy
//!
//! Inherits the credit-greedy base allocation and fuses four signals into
//! one bounded adjustment applied to the non-baseline mass:
//! - short-term intensity trend (next slot vs. current)
//! - demand projection (conserve ahead of a spike)
//! - cumulative emissions vs. the current grid rate
//! - extended look-ahead over the next forecast slots

use std::collections::BTreeMap;

use crate::models::{clamp, ExtendedPoint, ForecastSnapshot, PolicyResult};

use super::{credit_greedy, expected_precision, normalise, EmissionsStats, PolicyContext, EPSILON};

/// Signal weights for the fused adjustment.
const CARBON_WEIGHT: f64 = 0.35;
const DEMAND_WEIGHT: f64 = 0.25;
const EMISSIONS_WEIGHT: f64 = 0.25;
const LOOKAHEAD_WEIGHT: f64 = 0.15;

/// Bound on the fused adjustment.
const TOTAL_LIMIT: f64 = 0.5;

/// Bound on the short-term carbon signal.
const CARBON_LIMIT: f64 = 0.8;

/// Look-ahead points considered.
const LOOKAHEAD_POINTS: usize = 6;

pub(super) fn evaluate(ctx: &PolicyContext<'_>) -> Option<PolicyResult> {
    let forecast = ctx.forecast?;
    let intensity_now = forecast.intensity_now?;
    forecast.intensity_next?;

    let base = credit_greedy::evaluate(ctx)?;

    let carbon_adj = carbon_trend_adjustment(forecast);
    let demand_adj = demand_adjustment(forecast);
    let emissions_adj = emissions_adjustment(&ctx.emissions, intensity_now);
    let lookahead_adj = lookahead_adjustment(&forecast.extended, intensity_now);

    let total = clamp(
        CARBON_WEIGHT * carbon_adj
            + DEMAND_WEIGHT * demand_adj
            + EMISSIONS_WEIGHT * emissions_adj
            + LOOKAHEAD_WEIGHT * lookahead_adj,
        -TOTAL_LIMIT,
        TOTAL_LIMIT,
    );

    let weights = apply_shift(ctx, base.weights, total);
    let baseline_weight = weights.get(&ctx.baseline().name).copied().unwrap_or(0.0);
    let non_baseline = 1.0 - baseline_weight;
    let avg = expected_precision(ctx.flavours, &weights);

    let mut diagnostics = base.diagnostics;
    diagnostics.insert("carbon_adjustment".to_string(), carbon_adj);
    diagnostics.insert("demand_adjustment".to_string(), demand_adj);
    diagnostics.insert("emissions_adjustment".to_string(), emissions_adj);
    diagnostics.insert("lookahead_adjustment".to_string(), lookahead_adj);
    diagnostics.insert("total_adjustment".to_string(), total);
    diagnostics.insert("non_baseline_mass".to_string(), non_baseline);
    diagnostics.insert(
        "cumulative_gco2".to_string(),
        ctx.emissions.cumulative_gco2,
    );
    diagnostics.insert(
        "request_count".to_string(),
        ctx.emissions.request_count as f64,
    );
    diagnostics.insert(
        "avg_gco2_per_request".to_string(),
        ctx.emissions.average(),
    );
    diagnostics.insert("baseline_weight".to_string(), baseline_weight);

    Some(PolicyResult {
        weights,
        expected_precision: avg,
        diagnostics,
    })
}

/// Short-term trend signal in [-0.8, +0.8]: negative when the next slot is
/// more than 5% dirtier, positive when more than 5% cleaner, magnitude
/// proportional to the relative delta.
fn carbon_trend_adjustment(forecast: &ForecastSnapshot) -> f64 {
    let (now, next) = match (forecast.intensity_now, forecast.intensity_next) {
        (Some(now), Some(next)) if now > 0.0 => (now, next),
        _ => return 0.0,
    };
    let relative = (next - now) / now;
    if relative.abs() <= 0.05 {
        return 0.0;
    }
    clamp(-relative, -CARBON_LIMIT, CARBON_LIMIT)
}

/// Demand signal: conserve hard ahead of a spike, spend into a lull.
fn demand_adjustment(forecast: &ForecastSnapshot) -> f64 {
    let (now, next) = match (forecast.demand_now, forecast.demand_next) {
        (Some(now), Some(next)) if now > 0.0 => (now, next),
        _ => return 0.0,
    };
    let ratio = next / now;
    if ratio >= 1.5 {
        -0.6
    } else if ratio <= 0.7 {
        0.4
    } else {
        0.0
    }
}

/// Cumulative-emissions signal: running over budget pushes towards greener
/// flavours, running clean releases the pressure.
fn emissions_adjustment(emissions: &EmissionsStats, intensity_now: f64) -> f64 {
    if emissions.request_count == 0 || intensity_now <= 0.0 {
        return 0.0;
    }
    let average = emissions.average();
    if average > 1.2 * intensity_now {
        0.5
    } else if average < 0.8 * intensity_now {
        -0.5
    } else {
        0.0
    }
}

/// Extended look-ahead over the next slots: a markedly cleaner window ahead
/// spends now, a markedly dirtier one conserves.
fn lookahead_adjustment(extended: &[ExtendedPoint], intensity_now: f64) -> f64 {
    if intensity_now <= 0.0 {
        return 0.0;
    }
    let window: Vec<f64> = extended
        .iter()
        .take(LOOKAHEAD_POINTS)
        .map(|p| p.intensity)
        .filter(|v| *v > 0.0)
        .collect();
    if window.is_empty() {
        return 0.0;
    }
    let min_future = window.iter().cloned().fold(f64::INFINITY, f64::min);
    let max_future = window.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    if min_future < 0.6 * intensity_now {
        0.5
    } else if max_future > 1.4 * intensity_now {
        -0.5
    } else {
        0.0
    }
}

/// Shift the non-baseline mass by `total`, multiplicatively.
///
/// Positive totals move part of the baseline's complementary mass onto the
/// non-baseline flavours in proportion to their existing weights; negative
/// totals scale the non-baseline mass down and return it to the baseline.
fn apply_shift(
    ctx: &PolicyContext<'_>,
    mut weights: BTreeMap<String, f64>,
    total: f64,
) -> BTreeMap<String, f64> {
    if total.abs() <= EPSILON || ctx.flavours.len() < 2 {
        return weights;
    }

    let baseline_name = ctx.baseline().name.clone();
    let baseline_weight = weights.get(&baseline_name).copied().unwrap_or(0.0);
    let non_baseline: f64 = 1.0 - baseline_weight;

    if total > 0.0 {
        let moved = (total * (1.0 - non_baseline)).min(baseline_weight);
        if moved <= EPSILON {
            return weights;
        }
        if non_baseline > EPSILON {
            let scale = (non_baseline + moved) / non_baseline;
            for (name, value) in weights.iter_mut() {
                if *name != baseline_name {
                    *value *= scale;
                }
            }
        } else {
            // Nothing to be proportional to; seed from the base allocation
            // at full spend, which orders flavours by carbon score.
            let seeded = credit_greedy::allocate(ctx, 1.0);
            let seeded_mass: f64 = seeded
                .iter()
                .filter(|(name, _)| **name != baseline_name)
                .map(|(_, v)| v)
                .sum();
            if seeded_mass <= EPSILON {
                return weights;
            }
            for (name, value) in weights.iter_mut() {
                if *name != baseline_name {
                    *value += moved * seeded.get(name).copied().unwrap_or(0.0) / seeded_mass;
                }
            }
        }
        weights.insert(baseline_name, baseline_weight - moved);
    } else {
        let moved = (-total) * non_baseline;
        if moved <= EPSILON {
            return weights;
        }
        let scale = 1.0 + total;
        for (name, value) in weights.iter_mut() {
            if *name != baseline_name {
                *value *= scale;
            }
        }
        weights.insert(baseline_name, baseline_weight + moved);
    }

    normalise(&mut weights);
    weights
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::{
        evaluate as evaluate_policy, weight_sum, EmissionsStats, PolicyKind, EPSILON,
    };
    use super::*;
    use crate::models::FlavourProfile;

    fn flavours_abc() -> Vec<FlavourProfile> {
        vec![
            FlavourProfile::new("precision-100", 1.0, 200.0),
            FlavourProfile::new("precision-50", 0.5, 90.0),
            FlavourProfile::new("precision-30", 0.3, 40.0),
        ]
    }

    #[test]
    fn test_carbon_trend_deadband() {
        assert_eq!(carbon_trend_adjustment(&forecast(200.0, 206.0)), 0.0);
        assert!(carbon_trend_adjustment(&forecast(200.0, 260.0)) < 0.0);
        assert!(carbon_trend_adjustment(&forecast(200.0, 150.0)) > 0.0);
    }

    #[test]
    fn test_carbon_trend_capped() {
        let adj = carbon_trend_adjustment(&forecast(100.0, 500.0));
        assert!((adj + CARBON_LIMIT).abs() <= EPSILON);
    }

    #[test]
    fn test_demand_adjustment_thresholds() {
        let mut snapshot = forecast(200.0, 200.0);
        snapshot.demand_now = Some(100.0);
        snapshot.demand_next = Some(160.0);
        assert_eq!(demand_adjustment(&snapshot), -0.6);

        snapshot.demand_next = Some(60.0);
        assert_eq!(demand_adjustment(&snapshot), 0.4);

        snapshot.demand_next = Some(110.0);
        assert_eq!(demand_adjustment(&snapshot), 0.0);
    }

    #[test]
    fn test_emissions_adjustment_thresholds() {
        let mut stats = EmissionsStats::default();
        assert_eq!(emissions_adjustment(&stats, 200.0), 0.0);

        stats.accrue(2600.0, 10); // avg 260 = 1.3x of 200
        assert_eq!(emissions_adjustment(&stats, 200.0), 0.5);

        let mut clean = EmissionsStats::default();
        clean.accrue(1000.0, 10); // avg 100 = 0.5x of 200
        assert_eq!(emissions_adjustment(&clean, 200.0), -0.5);
    }

    #[test]
    fn test_lookahead_adjustment() {
        let points = vec![
            ExtendedPoint {
                horizon_hours: 0.5,
                intensity: 100.0,
            },
            ExtendedPoint {
                horizon_hours: 1.0,
                intensity: 210.0,
            },
        ];
        // min 100 < 0.6 * 200 -> clean window ahead, spend now.
        assert_eq!(lookahead_adjustment(&points, 200.0), 0.5);

        let dirty = vec![ExtendedPoint {
            horizon_hours: 0.5,
            intensity: 300.0,
        }];
        assert_eq!(lookahead_adjustment(&dirty, 200.0), -0.5);

        assert_eq!(lookahead_adjustment(&[], 200.0), 0.0);
    }

    #[test]
    fn test_global_fusion_scenario() {
        // Pre-seeded emissions at 1.3x the grid rate, a demand spike ahead
        // and a slightly cleaner next slot.
        let flavours = flavours_abc();
        let mut snapshot = forecast(200.0, 180.0);
        snapshot.demand_now = Some(100.0);
        snapshot.demand_next = Some(160.0);
        snapshot.extended = vec![ExtendedPoint {
            horizon_hours: 0.5,
            intensity: 190.0,
        }];

        let mut ctx = context(&flavours, Some(&snapshot), 0.5);
        ctx.emissions.accrue(2600.0, 10);

        let result = evaluate_policy(PolicyKind::ForecastAwareGlobal, &ctx).unwrap();
        assert!(result.diagnostics["carbon_adjustment"] > 0.0);
        assert_eq!(result.diagnostics["demand_adjustment"], -0.6);
        assert_eq!(result.diagnostics["emissions_adjustment"], 0.5);
        let total = result.diagnostics["total_adjustment"];
        assert!((-0.5..=0.5).contains(&total));
        assert!((weight_sum(&result.weights) - 1.0).abs() <= EPSILON);
    }

    #[test]
    fn test_dirtier_next_slot_shrinks_non_baseline_mass() {
        let flavours = flavours_abc();
        let flat = forecast(200.0, 200.0);
        let dirty = forecast(200.0, 260.0); // next > 1.05x now

        let base = evaluate_policy(
            PolicyKind::ForecastAwareGlobal,
            &context(&flavours, Some(&flat), 0.5),
        )
        .unwrap();
        let conserving = evaluate_policy(
            PolicyKind::ForecastAwareGlobal,
            &context(&flavours, Some(&dirty), 0.5),
        )
        .unwrap();

        assert!(
            conserving.diagnostics["non_baseline_mass"] < base.diagnostics["non_baseline_mass"]
        );
    }

    #[test]
    fn test_cleaner_next_slot_grows_non_baseline_mass() {
        let flavours = flavours_abc();
        let flat = forecast(200.0, 200.0);
        let clean = forecast(200.0, 180.0); // next < 0.95x now

        let base = evaluate_policy(
            PolicyKind::ForecastAwareGlobal,
            &context(&flavours, Some(&flat), 0.5),
        )
        .unwrap();
        let spending = evaluate_policy(
            PolicyKind::ForecastAwareGlobal,
            &context(&flavours, Some(&clean), 0.5),
        )
        .unwrap();

        assert!(
            spending.diagnostics["non_baseline_mass"] > base.diagnostics["non_baseline_mass"]
        );
    }

    #[test]
    fn test_positive_shift_with_locked_baseline_uses_carbon_scores() {
        // Allowance 0 puts everything on the baseline; a positive total
        // still seeds the greener flavours from the score ordering.
        let flavours = flavours_abc();
        let mut snapshot = forecast(200.0, 150.0);
        snapshot.extended = vec![ExtendedPoint {
            horizon_hours: 0.5,
            intensity: 100.0,
        }];
        let ctx = context(&flavours, Some(&snapshot), 0.0);
        let result = evaluate_policy(PolicyKind::ForecastAwareGlobal, &ctx).unwrap();
        assert!(result.diagnostics["total_adjustment"] > 0.0);
        assert!(result.weights["precision-50"] > 0.0 || result.weights["precision-30"] > 0.0);
        assert!((weight_sum(&result.weights) - 1.0).abs() <= EPSILON);
    }
}
