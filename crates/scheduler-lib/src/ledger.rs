//! Quality credit ledger
//!
//! Maintains a bounded, signed balance of quality surplus: each accounted
//! request (or evaluation) contributes `target_error - realised_error`.
//! A positive balance means the workload delivered better-than-target
//! quality recently and may spend the surplus on cheaper flavours; a
//! negative balance means it owes quality.

use crate::models::clamp;

/// Time-windowed signed accumulator with hard bounds.
#[derive(Debug, Clone)]
pub struct CreditLedger {
    target_error: f64,
    credit_min: f64,
    credit_max: f64,
    /// Smoothing window in seconds; drives the velocity EMA constant.
    window_seconds: u64,
    /// Allowance damping exponent in (0, 1]; 1 = linear mapping.
    sensitivity: f64,
    balance: f64,
    velocity: f64,
    previous_balance: Option<f64>,
    updates: u64,
}

impl CreditLedger {
    pub fn new(
        target_error: f64,
        credit_min: f64,
        credit_max: f64,
        window_seconds: u64,
        sensitivity: f64,
    ) -> Self {
        Self {
            target_error,
            credit_min,
            credit_max,
            window_seconds: window_seconds.max(1),
            sensitivity,
            balance: 0.0,
            velocity: 0.0,
            previous_balance: None,
            updates: 0,
        }
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn target_error(&self) -> f64 {
        self.target_error
    }

    pub fn credit_min(&self) -> f64 {
        self.credit_min
    }

    pub fn credit_max(&self) -> f64 {
        self.credit_max
    }

    /// Account one realised request precision.
    pub fn record(&mut self, precision_realised: f64) -> f64 {
        self.update(precision_realised, 1.0)
    }

    /// Account a weighted precision observation (the evaluator uses the
    /// policy's expected precision with weight 1).
    pub fn update(&mut self, precision_realised: f64, weight: f64) -> f64 {
        let realised_error = (1.0 - precision_realised).max(0.0);
        let delta = weight * (self.target_error - realised_error);
        let previous = self.balance;
        self.balance = clamp(self.balance + delta, self.credit_min, self.credit_max);
        self.updates += 1;

        // Velocity is the EMA of the balance first difference; it is only
        // defined once two balances exist.
        if self.previous_balance.is_some() {
            let diff = self.balance - previous;
            let alpha = 2.0 / (self.window_seconds as f64 + 1.0);
            if self.updates == 2 {
                self.velocity = diff;
            } else {
                self.velocity = alpha * diff + (1.0 - alpha) * self.velocity;
            }
        }
        self.previous_balance = Some(previous);
        self.balance
    }

    /// Project the balance to a non-baseline traffic budget in [0, 1].
    ///
    /// The balance is mapped linearly across `[credit_min, credit_max]`,
    /// then raised to the sensitivity exponent so the ledger can behave
    /// like a larger tank.
    pub fn allowance(&self) -> f64 {
        let span = self.credit_max - self.credit_min;
        if span <= 0.0 {
            return 1.0;
        }
        let ratio = clamp((self.balance - self.credit_min) / span, 0.0, 1.0);
        if (self.sensitivity - 1.0).abs() < f64::EPSILON {
            ratio
        } else {
            ratio.powf(self.sensitivity)
        }
    }

    /// Adopt new bounds without discarding the accumulated balance; the
    /// balance is re-clamped into the new range.
    pub fn reconfigure(
        &mut self,
        target_error: f64,
        credit_min: f64,
        credit_max: f64,
        window_seconds: u64,
        sensitivity: f64,
    ) {
        self.target_error = target_error;
        self.credit_min = credit_min;
        self.credit_max = credit_max;
        self.window_seconds = window_seconds.max(1);
        self.sensitivity = sensitivity;
        self.balance = clamp(self.balance, credit_min, credit_max);
    }

    #[cfg(test)]
    pub(crate) fn set_balance_for_test(&mut self, balance: f64) {
        self.balance = clamp(balance, self.credit_min, self.credit_max);
    }
}
