//! Baseline lockdown policy: all traffic to the highest-precision flavour.
//!
//! Carbon-insensitive control for experiments and the terminal fallback
//! when richer policies lack their inputs.

use std::collections::BTreeMap;

use crate::models::PolicyResult;

use super::PolicyContext;

pub(super) fn evaluate(ctx: &PolicyContext<'_>) -> PolicyResult {
    let baseline = ctx.baseline();

    let mut weights: BTreeMap<String, f64> = ctx
        .flavours
        .iter()
        .map(|f| (f.name.clone(), 0.0))
        .collect();
    weights.insert(baseline.name.clone(), 1.0);

    let mut diagnostics = BTreeMap::new();
    diagnostics.insert("baseline_precision".to_string(), baseline.precision);

    PolicyResult {
        weights,
        expected_precision: baseline.precision,
        diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::{evaluate as evaluate_policy, PolicyKind, EPSILON};
    use crate::models::FlavourProfile;

    #[test]
    fn test_all_weight_on_baseline() {
        let flavours = flavours_ab();
        let ctx = context(&flavours, None, 1.0);
        let result = evaluate_policy(PolicyKind::PrecisionTier, &ctx).unwrap();

        assert!((result.weights["precision-100"] - 1.0).abs() <= EPSILON);
        assert_eq!(result.weights["precision-70"], 0.0);
        assert!((result.expected_precision - 1.0).abs() <= EPSILON);
    }

    #[test]
    fn test_baseline_is_highest_precision_not_first_listed() {
        let flavours = vec![
            FlavourProfile::new("precision-95", 0.95, 150.0),
            FlavourProfile::new("precision-50", 0.5, 40.0),
        ];
        let ctx = context(&flavours, None, 0.0);
        let result = evaluate_policy(PolicyKind::PrecisionTier, &ctx).unwrap();
        assert!((result.weights["precision-95"] - 1.0).abs() <= EPSILON);
        assert!((result.expected_precision - 0.95).abs() <= EPSILON);
    }
}
