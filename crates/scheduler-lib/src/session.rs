//! Scheduler session
//!
//! One long-lived session per (namespace, name): owns the credit ledger,
//! flavour registry, demand estimator and throttle state, runs the
//! background evaluation loop and publishes schedule snapshots atomically.
//! Manual overrides suppress evaluation until they expire; evaluation
//! failures keep the last good snapshot alive.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::demand::{DemandConfig, DemandEstimator};
use crate::error::EngineError;
use crate::flavours::FlavourRegistry;
use crate::forecast::{CarbonTarget, ForecastSource, IntensityHistory, ProviderSettings};
use crate::ledger::CreditLedger;
use crate::models::{ConfigUpdate, FlavourProfile, SchedulerConfig};
use crate::observability::EngineMetrics;
use crate::policy::{self, EmissionsStats, PolicyContext};
use crate::snapshot::{
    percent_weights, CreditSummary, FlavourSummary, ManualScheduleRequest, PolicyInfo,
    ScheduleSnapshot,
};
use crate::throttle::ProcessingState;

/// Upper bound on the evaluation period.
const EVAL_INTERVAL_CAP: Duration = Duration::from_secs(15);

/// Margin subtracted from `valid_for` so a fresh snapshot is published
/// before the previous one expires.
const EVAL_SLACK_SECS: u64 = 2;

/// Trend adjustment defaults for the forecast-aware policy.
const TREND_CAP: f64 = 0.3;
const TREND_SCALE: f64 = 0.5;

/// Evaluator-owned mutable state. The lock is never held across await
/// points that can block (forecast fetches happen before it is taken).
struct SessionState {
    config: SchedulerConfig,
    ledger: CreditLedger,
    throttle: ProcessingState,
    intensity_history: IntensityHistory,
    emissions: EmissionsStats,
    manual_until: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

/// Feedback processing result returned to the router.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackSummary {
    pub realized_precision: f64,
    pub credit_balance: f64,
    pub credit_velocity: f64,
    pub total_requests: u64,
}

/// Long-lived per-workload scheduler.
pub struct SchedulerSession {
    namespace: String,
    name: String,
    state: Mutex<SessionState>,
    flavours: FlavourRegistry,
    demand: DemandEstimator,
    published: RwLock<Option<ScheduleSnapshot>>,
    forecast: Arc<dyn ForecastSource>,
    refresh: Notify,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
    metrics: EngineMetrics,
}

impl SchedulerSession {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        config: SchedulerConfig,
        forecast: Arc<dyn ForecastSource>,
        metrics: EngineMetrics,
    ) -> Arc<Self> {
        let ledger = CreditLedger::new(
            config.target_error,
            config.credit_min,
            config.credit_max,
            config.credit_window,
            config.credit_sensitivity,
        );
        let intensity_history = IntensityHistory::new(Duration::from_secs(config.credit_window));
        let (shutdown, _) = broadcast::channel(1);

        Arc::new(Self {
            namespace: namespace.into(),
            name: name.into(),
            state: Mutex::new(SessionState {
                config,
                ledger,
                throttle: ProcessingState::default(),
                intensity_history,
                emissions: EmissionsStats::default(),
                manual_until: None,
                consecutive_failures: 0,
            }),
            flavours: FlavourRegistry::default(),
            demand: DemandEstimator::new(DemandConfig::default()),
            published: RwLock::new(None),
            forecast,
            refresh: Notify::new(),
            shutdown,
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the background evaluation loop.
    pub fn spawn(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(session.run(shutdown));
    }

    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            namespace = %self.namespace,
            name = %self.name,
            "Starting scheduler session"
        );

        loop {
            let period = self.eval_period().await;
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = self.refresh.notified() => {}
                _ = shutdown.recv() => {
                    info!(
                        namespace = %self.namespace,
                        name = %self.name,
                        "Shutting down scheduler session"
                    );
                    break;
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.evaluate_once().await {
                warn!(
                    namespace = %self.namespace,
                    name = %self.name,
                    error = %e,
                    "Evaluation cycle failed"
                );
            }
        }
    }

    async fn eval_period(&self) -> Duration {
        let valid_for = self.state.lock().await.config.valid_for;
        let budget = valid_for.saturating_sub(EVAL_SLACK_SECS).max(1);
        Duration::from_secs(budget).min(EVAL_INTERVAL_CAP)
    }

    /// Idempotent configuration merge. Validation runs before any state is
    /// touched; a rejected update leaves the session unchanged.
    pub async fn configure(&self, update: &ConfigUpdate) -> Result<(), EngineError> {
        update.validate()?;

        if let Some(profiles) = update.flavour_profiles() {
            self.flavours.replace(profiles)?;
        }

        {
            let mut state = self.state.lock().await;
            state.config.apply(update);
            let target_error = state.config.target_error;
            let credit_min = state.config.credit_min;
            let credit_max = state.config.credit_max;
            let credit_window = state.config.credit_window;
            let credit_sensitivity = state.config.credit_sensitivity;
            state.ledger.reconfigure(
                target_error,
                credit_min,
                credit_max,
                credit_window,
                credit_sensitivity,
            );
            state
                .intensity_history
                .set_window(Duration::from_secs(credit_window));
            self.forecast.configure(ProviderSettings {
                target: CarbonTarget::parse(&state.config.carbon_target),
                timeout: Duration::from_secs_f64(state.config.carbon_timeout),
                cache_ttl: Duration::from_secs_f64(state.config.carbon_cache_ttl),
            });
        }

        debug!(
            namespace = %self.namespace,
            name = %self.name,
            "Configuration applied"
        );
        self.refresh.notify_one();
        Ok(())
    }

    /// Latest published snapshot; `None` until the first evaluation (the
    /// API maps this to `Pending`).
    pub async fn latest(&self) -> Option<ScheduleSnapshot> {
        self.published.read().await.clone()
    }

    /// Install a manual override. It takes precedence over automatic
    /// evaluation until `valid_until` passes.
    pub async fn override_schedule(
        &self,
        request: ManualScheduleRequest,
    ) -> Result<ScheduleSnapshot, EngineError> {
        let now = Utc::now();
        if let Some(until) = request.valid_until {
            if until <= now {
                return Err(EngineError::Validation(format!(
                    "manual override validUntil {until} is already expired"
                )));
            }
        }
        if let Some(ref weights) = request.flavour_weights {
            if weights.is_empty() {
                return Err(EngineError::Validation(
                    "manual flavourWeights must not be empty".to_string(),
                ));
            }
            for (name, value) in weights {
                if !value.is_finite() || *value < 0.0 {
                    return Err(EngineError::Validation(format!(
                        "manual weight for '{name}' must be a non-negative number"
                    )));
                }
            }
            if weights.values().sum::<f64>() <= 0.0 {
                return Err(EngineError::Validation(
                    "manual flavourWeights must carry positive mass".to_string(),
                ));
            }
        }

        let flavours = self.flavours.snapshot();
        let mut snapshot = match self.latest().await {
            Some(previous) => previous,
            None => self.neutral_snapshot(&flavours).await,
        };

        let valid_until = {
            let mut state = self.state.lock().await;
            let until = request
                .valid_until
                .unwrap_or_else(|| now + chrono::Duration::seconds(state.config.valid_for as i64));
            state.manual_until = Some(until);
            // The IIR filter restarts when automatic control resumes.
            state.throttle.reset();
            until
        };

        if let Some(weights) = request.flavour_weights {
            let percents = percent_weights(&weights, &flavours);
            snapshot.flavours = flavour_summaries(&flavours, &percents);
            snapshot.flavour_weights = percents;
        }
        if let Some(processing) = request.processing {
            snapshot.processing = processing;
        }
        if let Some(diagnostics) = request.diagnostics {
            snapshot.diagnostics = diagnostics;
        }
        snapshot.manual = true;
        snapshot.valid_until = valid_until;

        *self.published.write().await = Some(snapshot.clone());
        self.metrics
            .record_snapshot(&self.namespace, &self.name, &snapshot, None);

        warn!(
            namespace = %self.namespace,
            name = %self.name,
            valid_until = %valid_until,
            "Manual schedule override installed"
        );
        Ok(snapshot)
    }

    /// Router feedback: realised flavour counts over a sampling window.
    /// Feeds the ledger, the demand estimator and the emissions tracker.
    pub async fn process_feedback(
        &self,
        flavour_counts: &BTreeMap<String, u64>,
        total_requests: u64,
        window_seconds: f64,
    ) -> Result<FeedbackSummary, EngineError> {
        if total_requests == 0 || flavour_counts.is_empty() {
            return Err(EngineError::Validation(
                "feedback requires flavour counts and a positive total".to_string(),
            ));
        }

        let profiles = self.flavours.all();
        let precision_of = |name: &str| {
            profiles
                .iter()
                .find(|f| f.name == name)
                .map(|f| f.precision)
                .unwrap_or(1.0)
        };
        let intensity_of = |name: &str| {
            profiles
                .iter()
                .find(|f| f.name == name)
                .map(|f| f.carbon_intensity)
                .unwrap_or(0.0)
        };

        let weighted: f64 = flavour_counts
            .iter()
            .map(|(name, count)| precision_of(name) * (*count as f64))
            .sum();
        let realized_precision = weighted / total_requests as f64;

        let grams: f64 = flavour_counts
            .iter()
            .map(|(name, count)| intensity_of(name) * (*count as f64))
            .sum();

        self.demand.update(total_requests, window_seconds.max(1.0));

        let summary = {
            let mut state = self.state.lock().await;
            let balance = state.ledger.record(realized_precision);
            state.emissions.accrue(grams, total_requests);
            FeedbackSummary {
                realized_precision,
                credit_balance: balance,
                credit_velocity: state.ledger.velocity(),
                total_requests,
            }
        };

        info!(
            namespace = %self.namespace,
            name = %self.name,
            total_requests,
            realized_precision = summary.realized_precision,
            credit_balance = summary.credit_balance,
            "Feedback processed"
        );
        self.refresh.notify_one();
        Ok(summary)
    }

    /// Stop the background loop. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        self.refresh.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run one evaluation cycle. The background loop calls this on every
    /// tick; tests drive it directly.
    pub async fn evaluate_once(&self) -> Result<(), EngineError> {
        // Step 1: an active manual override suppresses evaluation.
        {
            let mut state = self.state.lock().await;
            match state.manual_until {
                Some(until) if until > Utc::now() => {
                    debug!(
                        namespace = %self.namespace,
                        name = %self.name,
                        "Manual override active, skipping evaluation"
                    );
                    return Ok(());
                }
                Some(_) => {
                    state.manual_until = None;
                }
                None => {}
            }
        }

        // Step 2: sample the forecast before taking any state lock; the
        // provider bounds its own latency.
        let forecast = match self.forecast.sample().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(
                    namespace = %self.namespace,
                    name = %self.name,
                    error = %e,
                    "Forecast unavailable, evaluating without it"
                );
                None
            }
        };
        let demand = self.demand.estimate();
        let forecast = forecast.map(|mut f| {
            f.demand_now = Some(demand.now);
            f.demand_next = Some(demand.next);
            f
        });

        // Step 3: empty registry keeps the previous snapshot alive.
        let flavours = self.flavours.snapshot();
        if flavours.is_empty() {
            self.extend_previous("no_flavours").await;
            return Ok(());
        }

        let (snapshot, forecast) = {
            let mut state = self.state.lock().await;

            if let Some(intensity) = forecast.as_ref().and_then(|f| f.intensity_now) {
                state.intensity_history.push(intensity);
            }

            // Step 4: policy evaluation with fallback.
            let ctx = PolicyContext {
                flavours: &flavours,
                forecast: forecast.as_ref(),
                balance: state.ledger.balance(),
                allowance: state.ledger.allowance(),
                intensity_reference: state.intensity_history.median(),
                emissions: state.emissions,
                trend_cap: TREND_CAP,
                trend_scale: TREND_SCALE,
            };
            let result = match policy::evaluate(state.config.policy, &ctx) {
                Ok(result) => result,
                Err(e) => {
                    drop(state);
                    self.absorb_failure(&e.to_string()).await;
                    return Ok(());
                }
            };

            // Step 5: ledger update with the expected precision.
            state.ledger.update(result.expected_precision, 1.0);
            state.consecutive_failures = 0;

            // Emissions accrue from the projected request volume; router
            // feedback later accounts the realised one.
            if demand.now > 0.0 {
                let requests = demand.now * state.config.valid_for as f64;
                let intensity_now = forecast.as_ref().and_then(|f| f.intensity_now);
                let grams: f64 = flavours
                    .iter()
                    .map(|f| {
                        let weight = result.weights.get(&f.name).copied().unwrap_or(0.0);
                        let intensity = if f.carbon_intensity > 0.0 {
                            f.carbon_intensity
                        } else {
                            intensity_now.unwrap_or(0.0)
                        };
                        weight * intensity * requests
                    })
                    .sum();
                state.emissions.accrue(grams, requests as u64);
            }

            // Step 6: processing throttle.
            let intensity_now = forecast.as_ref().and_then(|f| f.intensity_now);
            let (raw_throttle, _, _) = ProcessingState::raw_throttle(
                &state.config.throttle,
                state.ledger.balance(),
                state.ledger.credit_min(),
                state.ledger.credit_max(),
                intensity_now,
            );
            let throttle_config = state.config.throttle.clone();
            let component_bounds = state.config.component_bounds.clone();
            let credit_balance = state.ledger.balance();
            let credit_min = state.ledger.credit_min();
            let credit_max = state.ledger.credit_max();
            let directive = state.throttle.advance(
                &throttle_config,
                credit_balance,
                credit_min,
                credit_max,
                intensity_now,
                &component_bounds,
            );

            // Step 7: assemble the snapshot.
            let mut diagnostics = result.diagnostics.clone();
            diagnostics.insert("throttle_raw".to_string(), raw_throttle);
            let degraded = forecast.as_ref().map(|f| f.degraded).unwrap_or(true);
            if degraded {
                diagnostics.insert("forecast_degraded".to_string(), 1.0);
            }

            let credits = CreditSummary {
                balance: state.ledger.balance(),
                velocity: state.ledger.velocity(),
                target: state.ledger.target_error(),
                min: state.ledger.credit_min(),
                max: state.ledger.credit_max(),
                allowance: state.ledger.allowance(),
            };
            let valid_until =
                Utc::now() + chrono::Duration::seconds(state.config.valid_for as i64);

            let snapshot = ScheduleSnapshot::from_evaluation(
                &result,
                &flavours,
                &state.config,
                credits,
                directive,
                forecast.as_ref(),
                diagnostics,
                valid_until,
            );
            (snapshot, forecast)
        };

        // Step 8: atomic replacement; readers only ever see whole snapshots.
        *self.published.write().await = Some(snapshot.clone());
        self.metrics
            .record_snapshot(&self.namespace, &self.name, &snapshot, forecast.as_ref());

        debug!(
            namespace = %self.namespace,
            name = %self.name,
            policy = %snapshot.policy.name,
            avg_precision = snapshot.avg_precision,
            throttle = snapshot.processing.throttle,
            "Published schedule snapshot"
        );
        Ok(())
    }

    /// Keep the previous snapshot alive with a fresh validity window and a
    /// marker diagnostic; no ledger update happens.
    async fn extend_previous(&self, reason: &str) {
        let valid_for = self.state.lock().await.config.valid_for;
        let mut published = self.published.write().await;
        if let Some(snapshot) = published.as_mut() {
            snapshot.valid_until = Utc::now() + chrono::Duration::seconds(valid_for as i64);
            snapshot.diagnostics.insert(reason.to_string(), 1.0);
            warn!(
                namespace = %self.namespace,
                name = %self.name,
                reason,
                "Re-published previous snapshot with extended validity"
            );
        }
    }

    /// Absorb a transient evaluation failure: the last good snapshot stays
    /// published with extended validity; a second consecutive failure flips
    /// the `evaluator_unhealthy` diagnostic for operators.
    async fn absorb_failure(&self, error: &str) {
        let (valid_for, failures) = {
            let mut state = self.state.lock().await;
            state.consecutive_failures += 1;
            (state.config.valid_for, state.consecutive_failures)
        };
        self.metrics
            .inc_evaluation_failed(&self.namespace, &self.name);
        warn!(
            namespace = %self.namespace,
            name = %self.name,
            error,
            consecutive = failures,
            "Evaluation failed, keeping previous snapshot"
        );

        let mut published = self.published.write().await;
        if let Some(snapshot) = published.as_mut() {
            snapshot.valid_until = Utc::now() + chrono::Duration::seconds(valid_for as i64);
            if failures >= 2 {
                snapshot
                    .diagnostics
                    .insert("evaluator_unhealthy".to_string(), 1.0);
            }
        }
    }

    /// Placeholder snapshot used as the base for manual overrides installed
    /// before the first evaluation.
    async fn neutral_snapshot(&self, flavours: &[FlavourProfile]) -> ScheduleSnapshot {
        let state = self.state.lock().await;
        ScheduleSnapshot {
            flavour_weights: BTreeMap::new(),
            flavours: flavour_summaries(flavours, &BTreeMap::new()),
            policy: PolicyInfo {
                name: state.config.policy.as_str().to_string(),
            },
            credits: CreditSummary {
                balance: state.ledger.balance(),
                velocity: state.ledger.velocity(),
                target: state.ledger.target_error(),
                min: state.ledger.credit_min(),
                max: state.ledger.credit_max(),
                allowance: state.ledger.allowance(),
            },
            processing: Default::default(),
            forecast: Default::default(),
            diagnostics: BTreeMap::new(),
            avg_precision: 1.0,
            valid_until: Utc::now(),
            manual: false,
        }
    }

    #[cfg(test)]
    pub(crate) async fn seed_for_test(
        &self,
        balance: f64,
        emissions_gco2: f64,
        emissions_requests: u64,
    ) {
        let mut state = self.state.lock().await;
        state.ledger.set_balance_for_test(balance);
        state.emissions = EmissionsStats::default();
        state.emissions.accrue(emissions_gco2, emissions_requests);
    }

    #[cfg(test)]
    pub(crate) async fn fail_cycle_for_test(&self, error: &str) {
        self.absorb_failure(error).await;
    }
}

fn flavour_summaries(
    flavours: &[FlavourProfile],
    percents: &BTreeMap<String, u32>,
) -> Vec<FlavourSummary> {
    flavours
        .iter()
        .map(|f| FlavourSummary {
            name: f.name.clone(),
            precision: (f.precision * 100.0).round() as u32,
            weight: percents.get(&f.name).copied().unwrap_or(0),
            deadline: f.deadline,
            carbon_intensity: f.carbon_intensity,
            enabled: f.enabled,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::ForecastUnavailable;
    use crate::models::{ExtendedPoint, ForecastSnapshot};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Scripted forecast source for driving sessions deterministically.
    struct MockForecast {
        snapshot: StdMutex<Option<ForecastSnapshot>>,
    }

    impl MockForecast {
        fn available(now: f64, next: f64) -> Arc<Self> {
            Arc::new(Self {
                snapshot: StdMutex::new(Some(ForecastSnapshot {
                    intensity_now: Some(now),
                    intensity_next: Some(next),
                    ..Default::default()
                })),
            })
        }

        fn unavailable() -> Arc<Self> {
            Arc::new(Self {
                snapshot: StdMutex::new(None),
            })
        }
    }

    #[async_trait]
    impl ForecastSource for MockForecast {
        async fn sample(&self) -> Result<ForecastSnapshot, ForecastUnavailable> {
            self.snapshot
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ForecastUnavailable::new("mock outage"))
        }
    }

    fn config_with(policy: &str, target_error: f64) -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        config.policy = policy.parse().unwrap();
        config.target_error = target_error;
        config
    }

    async fn configured_session(
        policy: &str,
        forecast: Arc<MockForecast>,
    ) -> Arc<SchedulerSession> {
        let session = SchedulerSession::new(
            "default",
            "default",
            config_with(policy, 0.1),
            forecast,
            EngineMetrics::new(),
        );
        let update: ConfigUpdate = serde_json::from_value(serde_json::json!({
            "flavours": [
                { "name": "precision-100", "precision": 1.0, "carbonIntensity": 200.0 },
                { "name": "precision-70", "precision": 0.7, "carbonIntensity": 80.0 }
            ],
            "components": {
                "consumer": { "minReplicas": 1, "maxReplicas": 15 },
                "router": { "minReplicas": 1, "maxReplicas": 15 }
            }
        }))
        .unwrap();
        session.configure(&update).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_pending_before_first_evaluation() {
        let session = configured_session("credit-greedy", MockForecast::available(200.0, 200.0))
            .await;
        assert!(session.latest().await.is_none());
    }

    #[tokio::test]
    async fn test_precision_tier_locks_baseline() {
        let session = configured_session("precision-tier", MockForecast::available(300.0, 300.0))
            .await;
        session.evaluate_once().await.unwrap();

        let snapshot = session.latest().await.unwrap();
        assert_eq!(snapshot.flavour_weights["precision-100"], 100);
        assert_eq!(snapshot.flavour_weights["precision-70"], 0);
        assert!((snapshot.avg_precision - 1.0).abs() < 1e-9);
        assert!(!snapshot.manual);
        // Intensity 300 in [150, 350] gives ratio 0.25, below the credit
        // ratio, so the first (unsmoothed) throttle is intensity-driven.
        assert!((snapshot.processing.throttle - 0.25).abs() < 1e-9);
        assert!((snapshot.processing.intensity_ratio - 0.25).abs() < 1e-9);
        assert_eq!(snapshot.processing.ceilings["router"], 15);
    }

    #[tokio::test]
    async fn test_credit_spent_on_clean_grid() {
        let session = configured_session("credit-greedy", MockForecast::available(100.0, 100.0))
            .await;
        session.seed_for_test(0.5, 0.0, 0).await;
        session.evaluate_once().await.unwrap();

        let snapshot = session.latest().await.unwrap();
        assert!(snapshot.flavour_weights["precision-100"] <= 60);
        assert!(snapshot.flavour_weights["precision-70"] > 0);

        // With weight on the cheaper flavour the expected error exceeds the
        // target, so the balance drains from its seeded maximum.
        for _ in 0..10 {
            session.evaluate_once().await.unwrap();
        }
        let later = session.latest().await.unwrap();
        assert!(later.credits.balance < 0.5);
    }

    #[tokio::test]
    async fn test_forecast_unavailable_falls_back_with_diagnostics() {
        let session =
            configured_session("forecast-aware", MockForecast::unavailable()).await;
        session.evaluate_once().await.unwrap();

        let snapshot = session.latest().await.unwrap();
        assert_eq!(snapshot.diagnostics.get("policy_fallback"), Some(&1.0));
        assert_eq!(snapshot.diagnostics.get("forecast_degraded"), Some(&1.0));
        // Absent forecast puts no intensity pressure on the throttle.
        assert_eq!(snapshot.processing.intensity_ratio, 1.0);
    }

    #[tokio::test]
    async fn test_throttle_clamp_under_pressure() {
        let session = configured_session("credit-greedy", MockForecast::available(400.0, 400.0))
            .await;
        session.seed_for_test(-0.5, 0.0, 0).await;
        session.evaluate_once().await.unwrap();

        let snapshot = session.latest().await.unwrap();
        assert!((snapshot.processing.throttle - 0.2).abs() < 1e-6);
        assert_eq!(snapshot.processing.ceilings["consumer"], 3);
        assert_eq!(snapshot.processing.ceilings["router"], 15);
    }

    #[tokio::test]
    async fn test_manual_override_takes_precedence_and_expires() {
        let forecast = MockForecast::available(200.0, 200.0);
        let session = configured_session("credit-greedy", forecast).await;
        session.evaluate_once().await.unwrap();

        let request: ManualScheduleRequest = serde_json::from_value(serde_json::json!({
            "flavourWeights": { "precision-100": 100 },
            "validUntil": (Utc::now() + chrono::Duration::seconds(120)).to_rfc3339()
        }))
        .unwrap();
        session.override_schedule(request).await.unwrap();

        let manual = session.latest().await.unwrap();
        assert!(manual.manual);
        assert_eq!(manual.flavour_weights["precision-100"], 100);

        // While the override is active evaluation cycles are no-ops.
        session.evaluate_once().await.unwrap();
        let still_manual = session.latest().await.unwrap();
        assert!(still_manual.manual);

        // Force-expire the override; the next cycle re-takes control.
        {
            let mut state = session.state.lock().await;
            state.manual_until = Some(Utc::now() - chrono::Duration::seconds(1));
        }
        session.evaluate_once().await.unwrap();
        let automatic = session.latest().await.unwrap();
        assert!(!automatic.manual);
    }

    #[tokio::test]
    async fn test_expired_manual_override_rejected() {
        let session = configured_session("credit-greedy", MockForecast::available(200.0, 200.0))
            .await;
        session.evaluate_once().await.unwrap();
        let before = session.latest().await.unwrap();

        let request: ManualScheduleRequest = serde_json::from_value(serde_json::json!({
            "flavourWeights": { "precision-100": 100 },
            "validUntil": (Utc::now() - chrono::Duration::seconds(1)).to_rfc3339()
        }))
        .unwrap();
        let result = session.override_schedule(request).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));

        // The published snapshot is untouched.
        let after = session.latest().await.unwrap();
        assert_eq!(after.valid_until, before.valid_until);
        assert!(!after.manual);
    }

    #[tokio::test]
    async fn test_empty_registry_extends_previous_snapshot() {
        let session = configured_session("credit-greedy", MockForecast::available(200.0, 200.0))
            .await;
        session.evaluate_once().await.unwrap();
        let before = session.latest().await.unwrap();
        let balance_before = before.credits.balance;

        session.flavours.replace(Vec::new()).unwrap();
        session.evaluate_once().await.unwrap();

        let after = session.latest().await.unwrap();
        assert!(after.valid_until >= before.valid_until);
        assert_eq!(after.diagnostics.get("no_flavours"), Some(&1.0));
        // No ledger update happened.
        assert_eq!(after.credits.balance, balance_before);
    }

    #[tokio::test]
    async fn test_global_policy_fuses_session_emissions() {
        let forecast = MockForecast::available(200.0, 180.0);
        {
            let mut snapshot = forecast.snapshot.lock().unwrap();
            let f = snapshot.as_mut().unwrap();
            f.demand_now = None;
            f.demand_next = None;
            f.extended = vec![ExtendedPoint {
                horizon_hours: 0.5,
                intensity: 190.0,
            }];
        }
        let session =
            configured_session("forecast-aware-global", forecast).await;
        // avg = 260 gCO2 per request = 1.3x intensity_now.
        session.seed_for_test(0.25, 2600.0, 10).await;
        session.evaluate_once().await.unwrap();

        let snapshot = session.latest().await.unwrap();
        assert!(snapshot.diagnostics["carbon_adjustment"] > 0.0);
        assert_eq!(snapshot.diagnostics["emissions_adjustment"], 0.5);
        let total = snapshot.diagnostics["total_adjustment"];
        assert!((-0.5..=0.5).contains(&total));
    }

    #[tokio::test]
    async fn test_consecutive_failures_flip_unhealthy_bit() {
        let session = configured_session("credit-greedy", MockForecast::available(200.0, 200.0))
            .await;
        session.evaluate_once().await.unwrap();

        session.fail_cycle_for_test("boom").await;
        let after_one = session.latest().await.unwrap();
        assert!(after_one.diagnostics.get("evaluator_unhealthy").is_none());

        session.fail_cycle_for_test("boom again").await;
        let after_two = session.latest().await.unwrap();
        assert_eq!(after_two.diagnostics.get("evaluator_unhealthy"), Some(&1.0));
    }

    #[tokio::test]
    async fn test_feedback_updates_ledger_and_reports() {
        let session = configured_session("credit-greedy", MockForecast::available(200.0, 200.0))
            .await;
        let counts = BTreeMap::from([
            ("precision-100".to_string(), 800_u64),
            ("precision-70".to_string(), 200_u64),
        ]);
        let summary = session.process_feedback(&counts, 1000, 30.0).await.unwrap();

        // realised precision = (800 * 1.0 + 200 * 0.7) / 1000 = 0.94,
        // error 0.06 under the 0.1 target -> positive delta.
        assert!((summary.realized_precision - 0.94).abs() < 1e-9);
        assert!(summary.credit_balance > 0.0);

        let rejected = session.process_feedback(&BTreeMap::new(), 0, 30.0).await;
        assert!(matches!(rejected, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_configure_twice_is_idempotent() {
        let session = configured_session("credit-greedy", MockForecast::available(200.0, 200.0))
            .await;
        let update: ConfigUpdate = serde_json::from_value(serde_json::json!({
            "targetError": 0.08,
            "validFor": 45
        }))
        .unwrap();
        session.configure(&update).await.unwrap();
        session.evaluate_once().await.unwrap();
        let first = session.latest().await.unwrap();

        session.configure(&update).await.unwrap();
        session.evaluate_once().await.unwrap();
        let second = session.latest().await.unwrap();

        assert_eq!(first.credits.target, second.credits.target);
        assert_eq!(first.flavour_weights, second.flavour_weights);
        assert_eq!(first.policy.name, second.policy.name);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = configured_session("credit-greedy", MockForecast::available(200.0, 200.0))
            .await;
        session.close();
        session.close();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_monotonic_valid_until_across_cycles() {
        let session = configured_session("credit-greedy", MockForecast::available(200.0, 200.0))
            .await;
        session.evaluate_once().await.unwrap();
        let first = session.latest().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        session.evaluate_once().await.unwrap();
        let second = session.latest().await.unwrap();
        assert!(second.valid_until >= first.valid_until);
    }
}
