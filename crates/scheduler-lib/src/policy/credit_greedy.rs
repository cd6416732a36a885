//! Credit-greedy policy
//!
//! Spends the ledger allowance on greener flavours while keeping the error
//! budget: the baseline keeps `1 - allowance` of the traffic, the rest is
//! split across non-baseline flavours in proportion to their carbon score
//! (intensity saved per unit of expected error). The allowance itself is
//! scaled by how clean the current slot is relative to the recent median.

use std::collections::BTreeMap;

use crate::models::{clamp, PolicyResult};

use super::{effective_intensity, expected_precision, normalise, PolicyContext, EPSILON};

/// Allowance after the intensity multiplier, plus its factors.
pub(super) struct SpendPlan {
    pub alpha: f64,
    pub multiplier: f64,
}

/// Compute the non-baseline budget for this cycle.
///
/// Returns `None` when there is no intensity basis at all (no forecast and
/// no per-flavour estimates), which sends the caller down the fallback
/// chain.
pub(super) fn spend_plan(ctx: &PolicyContext<'_>) -> Option<SpendPlan> {
    let intensity_now = ctx.forecast.and_then(|f| f.intensity_now);

    let has_estimates = ctx.flavours.iter().any(|f| f.carbon_intensity > 0.0);
    if !has_estimates && intensity_now.is_none() {
        return None;
    }

    // A clean grid (below the windowed median) justifies spending more of
    // the allowance, a dirty one less.
    let multiplier = match intensity_now {
        Some(now) => {
            let reference = ctx.intensity_reference.unwrap_or(now).max(EPSILON);
            clamp(now / reference, 0.5, 2.0)
        }
        None => 1.0,
    };

    let alpha = clamp(ctx.allowance * multiplier, 0.0, 1.0);
    Some(SpendPlan { alpha, multiplier })
}

/// Distribute `alpha` of the traffic over non-baseline flavours by carbon
/// score; everything else stays on the baseline. Scores that are all
/// non-positive return the whole mass to the baseline.
pub(super) fn allocate(ctx: &PolicyContext<'_>, alpha: f64) -> BTreeMap<String, f64> {
    let intensity_now = ctx.forecast.and_then(|f| f.intensity_now);
    let baseline = ctx.baseline();

    let mut weights: BTreeMap<String, f64> = ctx
        .flavours
        .iter()
        .map(|f| (f.name.clone(), 0.0))
        .collect();

    let greener = &ctx.flavours[1..];
    if greener.is_empty() || alpha <= EPSILON {
        weights.insert(baseline.name.clone(), 1.0);
        return weights;
    }

    let baseline_intensity = ctx
        .flavours
        .iter()
        .map(|f| effective_intensity(f, intensity_now))
        .fold(0.0, f64::max);

    let scores: Vec<f64> = greener
        .iter()
        .map(|f| carbon_score(baseline_intensity, f, intensity_now))
        .collect();
    let positive_sum: f64 = scores.iter().filter(|s| **s > 0.0).sum();

    if positive_sum <= EPSILON {
        weights.insert(baseline.name.clone(), 1.0);
        return weights;
    }

    weights.insert(baseline.name.clone(), (1.0 - alpha).max(0.0));
    for (flavour, score) in greener.iter().zip(scores) {
        let share = score.max(0.0) / positive_sum;
        weights.insert(flavour.name.clone(), alpha * share);
    }

    normalise(&mut weights);
    weights
}

/// Intensity saved per unit of expected error.
fn carbon_score(
    baseline_intensity: f64,
    flavour: &crate::models::FlavourProfile,
    intensity_now: Option<f64>,
) -> f64 {
    let saving = baseline_intensity - effective_intensity(flavour, intensity_now);
    saving / flavour.expected_error().max(EPSILON)
}

pub(super) fn evaluate(ctx: &PolicyContext<'_>) -> Option<PolicyResult> {
    let plan = spend_plan(ctx)?;
    let weights = allocate(ctx, plan.alpha);

    let baseline_weight = weights.get(&ctx.baseline().name).copied().unwrap_or(0.0);
    let avg = expected_precision(ctx.flavours, &weights);

    let mut diagnostics = BTreeMap::new();
    diagnostics.insert("credit_balance".to_string(), ctx.balance);
    diagnostics.insert("allowance".to_string(), plan.alpha);
    diagnostics.insert("intensity_multiplier".to_string(), plan.multiplier);
    diagnostics.insert("baseline_weight".to_string(), baseline_weight);

    Some(PolicyResult {
        weights,
        expected_precision: avg,
        diagnostics,
    })
}
