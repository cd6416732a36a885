//! Engine configuration

use anyhow::Result;
use scheduler_lib::{PolicyKind, SchedulerConfig};
use serde::Deserialize;
use tracing::warn;

/// Process-level settings loaded from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Namespace used by the default-key schedule endpoints.
    #[serde(default = "default_namespace")]
    pub default_schedule_namespace: String,

    /// Name used by the default-key schedule endpoints.
    #[serde(default = "default_name")]
    pub default_schedule_name: String,

    /// API listener port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Standalone Prometheus scrape port.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Log level when RUST_LOG is not set.
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// Target quality error threshold.
    #[serde(default = "default_target_error")]
    pub target_error: f64,

    #[serde(default = "default_credit_min")]
    pub credit_min: f64,

    #[serde(default = "default_credit_max")]
    pub credit_max: f64,

    /// Credit smoothing window in seconds.
    #[serde(default = "default_credit_window")]
    pub credit_window: u64,

    /// Default scheduling policy for new sessions.
    #[serde(default = "default_policy")]
    pub scheduler_policy: String,

    /// Schedule validity period in seconds.
    #[serde(default = "default_valid_for")]
    pub schedule_valid_for: u64,

    /// Carbon forecast endpoint; sessions degrade gracefully without one.
    pub carbon_api_url: Option<String>,

    #[serde(default = "default_carbon_target")]
    pub carbon_api_target: String,

    #[serde(default = "default_carbon_timeout")]
    pub carbon_api_timeout: f64,

    #[serde(default = "default_carbon_cache_ttl")]
    pub carbon_api_cache_ttl: f64,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_name() -> String {
    "default".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    8001
}

fn default_loglevel() -> String {
    "INFO".to_string()
}

fn default_target_error() -> f64 {
    0.05
}

fn default_credit_min() -> f64 {
    -0.5
}

fn default_credit_max() -> f64 {
    0.5
}

fn default_credit_window() -> u64 {
    300
}

fn default_policy() -> String {
    "credit-greedy".to_string()
}

fn default_valid_for() -> u64 {
    60
}

fn default_carbon_target() -> String {
    "national".to_string()
}

fn default_carbon_timeout() -> f64 {
    2.0
}

fn default_carbon_cache_ttl() -> f64 {
    300.0
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_schedule_namespace: default_namespace(),
            default_schedule_name: default_name(),
            api_port: default_api_port(),
            metrics_port: default_metrics_port(),
            loglevel: default_loglevel(),
            target_error: default_target_error(),
            credit_min: default_credit_min(),
            credit_max: default_credit_max(),
            credit_window: default_credit_window(),
            scheduler_policy: default_policy(),
            schedule_valid_for: default_valid_for(),
            carbon_api_url: None,
            carbon_api_target: default_carbon_target(),
            carbon_api_timeout: default_carbon_timeout(),
            carbon_api_cache_ttl: default_carbon_cache_ttl(),
        }
    }
}

impl EngineSettings {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }

    /// Base per-session configuration derived from these settings.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let policy = self
            .scheduler_policy
            .parse::<PolicyKind>()
            .unwrap_or_else(|_| {
                warn!(
                    policy = %self.scheduler_policy,
                    "Unknown SCHEDULER_POLICY, falling back to credit-greedy"
                );
                PolicyKind::CreditGreedy
            });

        SchedulerConfig {
            target_error: self.target_error,
            credit_min: self.credit_min,
            credit_max: self.credit_max,
            credit_window: self.credit_window.max(1),
            policy,
            valid_for: self.schedule_valid_for.max(1),
            carbon_target: self.carbon_api_target.clone(),
            carbon_timeout: self.carbon_api_timeout,
            carbon_cache_ttl: self.carbon_api_cache_ttl,
            ..SchedulerConfig::default()
        }
    }
}
