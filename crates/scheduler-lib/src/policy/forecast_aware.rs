//! Forecast-aware policy
//!
//! Credit-greedy plus a short-term trend adjustment: when the next slot is
//! cleaner the allowance grows (spend now is fine, more is coming cheap);
//! when it is dirtier the allowance shrinks to conserve credit.

use std::collections::BTreeMap;

use crate::models::{clamp, PolicyResult};

use super::{credit_greedy, expected_precision, PolicyContext, EPSILON};

pub(super) fn evaluate(ctx: &PolicyContext<'_>) -> Option<PolicyResult> {
    let forecast = ctx.forecast?;
    let intensity_now = forecast.intensity_now?;
    let intensity_next = forecast.intensity_next?;

    let plan = credit_greedy::spend_plan(ctx)?;

    let trend = intensity_next - intensity_now;
    let adjustment = -clamp(
        trend / intensity_now.max(EPSILON) * ctx.trend_scale,
        -ctx.trend_cap,
        ctx.trend_cap,
    );

    let alpha = clamp(plan.alpha + adjustment, 0.0, 1.0);
    let weights = credit_greedy::allocate(ctx, alpha);

    let baseline_weight = weights.get(&ctx.baseline().name).copied().unwrap_or(0.0);
    let avg = expected_precision(ctx.flavours, &weights);

    let mut diagnostics = BTreeMap::new();
    diagnostics.insert("credit_balance".to_string(), ctx.balance);
    diagnostics.insert("allowance".to_string(), alpha);
    diagnostics.insert("intensity_multiplier".to_string(), plan.multiplier);
    diagnostics.insert("baseline_weight".to_string(), baseline_weight);
    diagnostics.insert("trend".to_string(), trend);
    diagnostics.insert("trend_adjustment".to_string(), adjustment);

    Some(PolicyResult {
        weights,
        expected_precision: avg,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::{evaluate as evaluate_policy, weight_sum, PolicyKind, EPSILON};

    #[test]
    fn test_rising_intensity_conserves_credit() {
        // Balance 0.25 in [-0.5, 0.5] -> allowance 0.75; the 200 -> 260
        // trend pulls 0.15 back out of it.
        let flavours = flavours_ab();

        let rising = forecast(200.0, 260.0);
        let flat = forecast(200.0, 200.0);

        let ctx_rising = context(&flavours, Some(&rising), 0.75);
        let ctx_flat = context(&flavours, Some(&flat), 0.75);

        let with_trend = evaluate_policy(PolicyKind::ForecastAware, &ctx_rising).unwrap();
        let without = evaluate_policy(PolicyKind::ForecastAware, &ctx_flat).unwrap();

        assert!(with_trend.weights["precision-100"] > without.weights["precision-100"]);
        assert!((with_trend.diagnostics["trend_adjustment"] + 0.15).abs() <= EPSILON);
        assert_eq!(without.diagnostics["trend_adjustment"], 0.0);
    }

    #[test]
    fn test_falling_intensity_spends_more() {
        let flavours = flavours_ab();
        let falling = forecast(200.0, 140.0);
        let flat = forecast(200.0, 200.0);

        let spent = evaluate_policy(
            PolicyKind::ForecastAware,
            &context(&flavours, Some(&falling), 0.4),
        )
        .unwrap();
        let held = evaluate_policy(
            PolicyKind::ForecastAware,
            &context(&flavours, Some(&flat), 0.4),
        )
        .unwrap();

        assert!(spent.weights["precision-70"] > held.weights["precision-70"]);
        assert!(spent.diagnostics["trend_adjustment"] > 0.0);
    }

    #[test]
    fn test_adjustment_capped() {
        let flavours = flavours_ab();
        // A 5x jump would give raw adjustment -2.0; the cap holds it at -0.3.
        let spike = forecast(100.0, 500.0);
        let ctx = context(&flavours, Some(&spike), 0.9);
        let result = evaluate_policy(PolicyKind::ForecastAware, &ctx).unwrap();
        assert!((result.diagnostics["trend_adjustment"] + 0.3).abs() <= EPSILON);
        assert!((weight_sum(&result.weights) - 1.0).abs() <= EPSILON);
    }

    #[test]
    fn test_adjusted_allowance_clamped_to_unit_interval() {
        let flavours = flavours_ab();
        let plunge = forecast(400.0, 100.0);
        let ctx = context(&flavours, Some(&plunge), 0.9);
        let result = evaluate_policy(PolicyKind::ForecastAware, &ctx).unwrap();
        assert!(result.diagnostics["allowance"] <= 1.0 + EPSILON);
    }
}
