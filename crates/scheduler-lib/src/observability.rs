//! Observability infrastructure for the decision engine
//!
//! Provides:
//! - Prometheus gauges/counters per published snapshot (weights, credits,
//!   throttle, ceilings, policy choices, forecast horizons)
//! - a custom collector exporting forecast points with explicit target
//!   timestamps, so they plot at their future slot rather than scrape time

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use chrono::Utc;
use prometheus::core::{Collector, Desc};
use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_counter_vec, CounterVec, GaugeVec,
    IntCounterVec,
};
use tracing::warn;

use crate::models::ForecastSnapshot;
use crate::snapshot::ScheduleSnapshot;

/// Retention for timestamped forecast points after their target instant.
const FORECAST_RETENTION_SECS: i64 = 3600;

/// Global metrics instance (registered once).
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    flavour_weight: GaugeVec,
    valid_until: GaugeVec,
    credit_balance: GaugeVec,
    credit_velocity: GaugeVec,
    avg_precision: GaugeVec,
    processing_throttle: GaugeVec,
    replica_ceiling: GaugeVec,
    policy_choice_total: CounterVec,
    forecast_intensity: GaugeVec,
    evaluation_failed_total: IntCounterVec,
    forecast_collector: TimestampedForecastCollector,
}

impl EngineMetricsInner {
    fn new() -> Self {
        let forecast_collector = TimestampedForecastCollector::new();
        if let Err(e) = prometheus::register(Box::new(forecast_collector.clone())) {
            warn!(error = %e, "Timestamped forecast collector already registered");
        }

        Self {
            flavour_weight: register_gauge_vec!(
                "schedule_flavour_weight",
                "Traffic weight per flavour (0-1)",
                &["namespace", "schedule", "flavour"]
            )
            .expect("Failed to register schedule_flavour_weight"),

            valid_until: register_gauge_vec!(
                "schedule_valid_until",
                "UNIX epoch of the snapshot validUntil",
                &["namespace", "schedule"]
            )
            .expect("Failed to register schedule_valid_until"),

            credit_balance: register_gauge_vec!(
                "scheduler_credit_balance",
                "Current credit balance",
                &["namespace", "schedule", "policy"]
            )
            .expect("Failed to register scheduler_credit_balance"),

            credit_velocity: register_gauge_vec!(
                "scheduler_credit_velocity",
                "Smoothed credit balance delta",
                &["namespace", "schedule", "policy"]
            )
            .expect("Failed to register scheduler_credit_velocity"),

            avg_precision: register_gauge_vec!(
                "scheduler_avg_precision",
                "Expected precision of the published schedule",
                &["namespace", "schedule", "policy"]
            )
            .expect("Failed to register scheduler_avg_precision"),

            processing_throttle: register_gauge_vec!(
                "scheduler_processing_throttle",
                "Throttle factor applied to downstream processing",
                &["namespace", "schedule", "policy"]
            )
            .expect("Failed to register scheduler_processing_throttle"),

            replica_ceiling: register_gauge_vec!(
                "scheduler_effective_replica_ceiling",
                "Effective replica ceiling per component",
                &["namespace", "schedule", "component"]
            )
            .expect("Failed to register scheduler_effective_replica_ceiling"),

            policy_choice_total: register_counter_vec!(
                "scheduler_policy_choice_total",
                "Cumulative flavour selections, weighted",
                &["namespace", "schedule", "policy", "strategy"]
            )
            .expect("Failed to register scheduler_policy_choice_total"),

            forecast_intensity: register_gauge_vec!(
                "scheduler_forecast_intensity",
                "Carbon intensity forecast",
                &["namespace", "schedule", "policy", "horizon"]
            )
            .expect("Failed to register scheduler_forecast_intensity"),

            evaluation_failed_total: register_int_counter_vec!(
                "scheduler_evaluation_failed_total",
                "Evaluation cycles that failed and kept the previous snapshot",
                &["namespace", "schedule"]
            )
            .expect("Failed to register scheduler_evaluation_failed_total"),

            forecast_collector,
        }
    }
}

/// Lightweight handle to the global engine metrics.
///
/// Clones share the same underlying Prometheus series.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Export every series derived from one published snapshot.
    pub fn record_snapshot(
        &self,
        namespace: &str,
        schedule: &str,
        snapshot: &ScheduleSnapshot,
        forecast: Option<&ForecastSnapshot>,
    ) {
        let inner = self.inner();
        let policy = snapshot.policy.name.as_str();

        for (flavour, weight) in &snapshot.flavour_weights {
            inner
                .flavour_weight
                .with_label_values(&[namespace, schedule, flavour])
                .set(*weight as f64 / 100.0);
        }
        inner
            .valid_until
            .with_label_values(&[namespace, schedule])
            .set(snapshot.valid_until.timestamp() as f64);
        inner
            .credit_balance
            .with_label_values(&[namespace, schedule, policy])
            .set(snapshot.credits.balance);
        inner
            .credit_velocity
            .with_label_values(&[namespace, schedule, policy])
            .set(snapshot.credits.velocity);
        inner
            .avg_precision
            .with_label_values(&[namespace, schedule, policy])
            .set(snapshot.avg_precision);
        inner
            .processing_throttle
            .with_label_values(&[namespace, schedule, policy])
            .set(snapshot.processing.throttle);

        for (component, ceiling) in &snapshot.processing.ceilings {
            inner
                .replica_ceiling
                .with_label_values(&[namespace, schedule, component])
                .set(*ceiling as f64);
        }

        for (strategy, weight) in &snapshot.flavour_weights {
            inner
                .policy_choice_total
                .with_label_values(&[namespace, schedule, policy, strategy])
                .inc_by(*weight as f64 / 100.0);
        }

        if let Some(forecast) = forecast {
            self.record_forecast(namespace, schedule, policy, forecast);
        }
    }

    fn record_forecast(
        &self,
        namespace: &str,
        schedule: &str,
        policy: &str,
        forecast: &ForecastSnapshot,
    ) {
        let inner = self.inner();
        if let Some(now) = forecast.intensity_now {
            inner
                .forecast_intensity
                .with_label_values(&[namespace, schedule, policy, "now"])
                .set(now);
        }
        if let Some(next) = forecast.intensity_next {
            inner
                .forecast_intensity
                .with_label_values(&[namespace, schedule, policy, "next"])
                .set(next);
        }

        let now_ms = Utc::now().timestamp_millis();
        inner
            .forecast_collector
            .clear_older_than(now_ms - FORECAST_RETENTION_SECS * 1000);

        for point in &forecast.extended {
            let horizon = format!("{:.1}h", point.horizon_hours);
            let target_ms = now_ms + (point.horizon_hours * 3600.0 * 1000.0) as i64;
            inner.forecast_collector.set_forecast(
                namespace,
                schedule,
                policy,
                &horizon,
                point.intensity,
                target_ms,
            );
            inner
                .forecast_intensity
                .with_label_values(&[namespace, schedule, policy, &horizon])
                .set(point.intensity);
        }
    }

    pub fn inc_evaluation_failed(&self, namespace: &str, schedule: &str) {
        self.inner()
            .evaluation_failed_total
            .with_label_values(&[namespace, schedule])
            .inc();
    }
}

type ForecastKey = (String, String, String, String);

/// Custom collector exporting forecast gauges with explicit timestamps so
/// each point is plotted at its target slot.
#[derive(Clone)]
pub struct TimestampedForecastCollector {
    desc: Desc,
    forecasts: Arc<Mutex<HashMap<ForecastKey, (f64, i64)>>>,
}

impl TimestampedForecastCollector {
    fn new() -> Self {
        let desc = Desc::new(
            "scheduler_forecast_intensity_timestamped".to_string(),
            "Carbon intensity forecast with target timestamp".to_string(),
            vec![
                "namespace".to_string(),
                "schedule".to_string(),
                "policy".to_string(),
                "horizon".to_string(),
            ],
            HashMap::new(),
        )
        .expect("valid forecast collector descriptor");
        Self {
            desc,
            forecasts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn set_forecast(
        &self,
        namespace: &str,
        schedule: &str,
        policy: &str,
        horizon: &str,
        value: f64,
        timestamp_ms: i64,
    ) {
        let mut forecasts = self.forecasts.lock().expect("forecast collector poisoned");
        forecasts.insert(
            (
                namespace.to_string(),
                schedule.to_string(),
                policy.to_string(),
                horizon.to_string(),
            ),
            (value, timestamp_ms),
        );
    }

    fn clear_older_than(&self, cutoff_ms: i64) {
        let mut forecasts = self.forecasts.lock().expect("forecast collector poisoned");
        forecasts.retain(|_, (_, ts)| *ts > cutoff_ms);
    }
}

impl Collector for TimestampedForecastCollector {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let forecasts = self.forecasts.lock().expect("forecast collector poisoned");
        if forecasts.is_empty() {
            return Vec::new();
        }

        let mut family = MetricFamily::default();
        family.set_name("scheduler_forecast_intensity_timestamped".to_string());
        family.set_help("Carbon intensity forecast with target timestamp".to_string());
        family.set_field_type(MetricType::GAUGE);

        for ((namespace, schedule, policy, horizon), (value, timestamp_ms)) in forecasts.iter() {
            let mut metric = Metric::default();
            for (name, label_value) in [
                ("namespace", namespace),
                ("schedule", schedule),
                ("policy", policy),
                ("horizon", horizon),
            ] {
                let mut pair = LabelPair::default();
                pair.set_name(name.to_string());
                pair.set_value(label_value.clone());
                metric.mut_label().push(pair);
            }
            let mut gauge = Gauge::default();
            gauge.set_value(*value);
            metric.set_gauge(gauge);
            metric.set_timestamp_ms(*timestamp_ms);
            family.mut_metric().push(metric);
        }

        vec![family]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamped_collector_exports_points() {
        let collector = TimestampedForecastCollector::new();
        collector.set_forecast("default", "default", "credit-greedy", "0.5h", 180.0, 1_000);
        collector.set_forecast("default", "default", "credit-greedy", "1.0h", 150.0, 2_000);

        let families = collector.collect();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_metric().len(), 2);
        let metric = &families[0].get_metric()[0];
        assert!(metric.get_timestamp_ms() > 0);
    }

    #[test]
    fn test_timestamped_collector_prunes_old_points() {
        let collector = TimestampedForecastCollector::new();
        collector.set_forecast("default", "default", "credit-greedy", "0.5h", 180.0, 1_000);
        collector.set_forecast("default", "default", "credit-greedy", "1.0h", 150.0, 9_000);
        collector.clear_older_than(5_000);

        let families = collector.collect();
        assert_eq!(families[0].get_metric().len(), 1);
    }

    #[test]
    fn test_engine_metrics_handle_is_reusable() {
        let metrics = EngineMetrics::new();
        metrics.inc_evaluation_failed("default", "default");
        let again = EngineMetrics::new();
        again.inc_evaluation_failed("default", "default");
    }
}
