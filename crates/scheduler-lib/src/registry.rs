//! Scheduler registry
//!
//! Sessions keyed by (namespace, name). Config pushes create sessions on
//! demand; reads return handles without blocking policy work. Per-key
//! operations are serialised by the session itself, different keys run
//! concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;
use url::Url;

use crate::error::{EngineError, EngineResult};
use crate::forecast::{CarbonForecastProvider, CarbonTarget, ForecastSource, ProviderSettings};
use crate::models::{ConfigUpdate, SchedulerConfig};
use crate::observability::EngineMetrics;
use crate::session::SchedulerSession;

type SessionKey = (String, String);

/// Builds the forecast source for a new session.
///
/// The default factory creates an HTTP provider against the configured
/// endpoint (or a stub that reports `Unavailable` when no endpoint is
/// set); tests inject scripted sources.
pub type ForecastFactory =
    Arc<dyn Fn(&SchedulerConfig) -> Arc<dyn ForecastSource> + Send + Sync>;

/// Registry of scheduler sessions.
pub struct SchedulerRegistry {
    base_config: SchedulerConfig,
    forecast_factory: ForecastFactory,
    sessions: RwLock<HashMap<SessionKey, Arc<SchedulerSession>>>,
    metrics: EngineMetrics,
}

impl SchedulerRegistry {
    pub fn new(
        base_config: SchedulerConfig,
        carbon_api_url: Option<Url>,
        metrics: EngineMetrics,
    ) -> Self {
        let factory: ForecastFactory = match carbon_api_url {
            Some(url) => Arc::new(move |config: &SchedulerConfig| {
                let provider = CarbonForecastProvider::new(
                    url.clone(),
                    ProviderSettings {
                        target: CarbonTarget::parse(&config.carbon_target),
                        timeout: Duration::from_secs_f64(config.carbon_timeout),
                        cache_ttl: Duration::from_secs_f64(config.carbon_cache_ttl),
                    },
                );
                Arc::new(provider) as Arc<dyn ForecastSource>
            }),
            None => Arc::new(|_: &SchedulerConfig| {
                Arc::new(NullForecastSource) as Arc<dyn ForecastSource>
            }),
        };
        Self::with_forecast_factory(base_config, factory, metrics)
    }

    pub fn with_forecast_factory(
        base_config: SchedulerConfig,
        forecast_factory: ForecastFactory,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            base_config,
            forecast_factory,
            sessions: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Create the session if missing, then merge the configuration into it.
    pub async fn update_config(
        &self,
        namespace: &str,
        name: &str,
        update: ConfigUpdate,
    ) -> EngineResult<()> {
        // Validate before creating anything so a bad first push leaves no
        // half-configured session behind.
        update.validate()?;
        let session = self.ensure_session(namespace, name).await;
        session.configure(&update).await
    }

    /// Handle for an existing session.
    pub async fn get(&self, namespace: &str, name: &str) -> EngineResult<Arc<SchedulerSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    /// Get-or-create; used by config pushes and manual overrides.
    pub async fn ensure_session(&self, namespace: &str, name: &str) -> Arc<SchedulerSession> {
        let key = (namespace.to_string(), name.to_string());
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&key) {
                return Arc::clone(session);
            }
        }

        let mut sessions = self.sessions.write().await;
        // Double-checked: another writer may have won the race.
        if let Some(session) = sessions.get(&key) {
            return Arc::clone(session);
        }

        info!(namespace, name, "Creating scheduler session");
        let config = self.base_config.clone();
        let forecast = (self.forecast_factory)(&config);
        let session =
            SchedulerSession::new(namespace, name, config, forecast, self.metrics.clone());
        session.spawn();
        sessions.insert(key, Arc::clone(&session));
        session
    }

    /// Stop a session and drop the handle.
    pub async fn remove(&self, namespace: &str, name: &str) -> EngineResult<()> {
        let key = (namespace.to_string(), name.to_string());
        let removed = self.sessions.write().await.remove(&key);
        match removed {
            Some(session) => {
                session.close();
                info!(namespace, name, "Removed scheduler session");
                Ok(())
            }
            None => Err(EngineError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

/// Stand-in source used when no forecast endpoint is configured; every
/// sample reports `Unavailable` and policies degrade accordingly.
struct NullForecastSource;

#[async_trait::async_trait]
impl ForecastSource for NullForecastSource {
    async fn sample(
        &self,
    ) -> Result<crate::models::ForecastSnapshot, crate::forecast::ForecastUnavailable> {
        Err(crate::forecast::ForecastUnavailable::new(
            "no forecast endpoint configured",
        ))
    }
}
