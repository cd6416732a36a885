//! Carbon forecast provider
//!
//! Converts the external intensity endpoint into [`ForecastSnapshot`]s with
//! bounded latency and a typed failure mode:
//! - 48 h slot schedule fetch (national, regional or postcode scoped)
//! - TTL cache behind a short-lived lock
//! - degradation to `Unavailable` on timeout, non-2xx or parse failure
//!
//! Also hosts [`IntensityHistory`], the windowed sample store whose median
//! serves as the credit-greedy intensity reference.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::models::{ExtendedPoint, ForecastPoint, ForecastSnapshot};

/// Extended look-ahead horizon.
const MAX_HORIZON_HOURS: f64 = 48.0;

/// The forecast source could not produce a usable sample.
#[derive(Debug, Error)]
#[error("carbon forecast unavailable: {reason}")]
pub struct ForecastUnavailable {
    pub reason: String,
}

impl ForecastUnavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Scope of the intensity query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarbonTarget {
    National,
    Region(String),
    Postcode(String),
}

impl CarbonTarget {
    /// Parse `national`, `region:<id>` or `postcode:<code>`.
    pub fn parse(raw: &str) -> Self {
        let value = raw.trim();
        let lowered = value.to_ascii_lowercase();
        if let Some(id) = lowered.strip_prefix("region:") {
            return CarbonTarget::Region(id.trim().to_string());
        }
        if lowered.starts_with("postcode:") {
            let code = value.splitn(2, ':').nth(1).unwrap_or("").trim();
            return CarbonTarget::Postcode(code.to_ascii_uppercase());
        }
        CarbonTarget::National
    }
}

/// Tunable provider settings; refreshed on config pushes.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub target: CarbonTarget,
    pub timeout: Duration,
    pub cache_ttl: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            target: CarbonTarget::National,
            timeout: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Source of forecast snapshots; the seam sessions are tested through.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn sample(&self) -> Result<ForecastSnapshot, ForecastUnavailable>;

    /// Adopt new settings; sources without tunables ignore this.
    fn configure(&self, _settings: ProviderSettings) {}
}

#[derive(Debug)]
struct ProviderState {
    settings: ProviderSettings,
    cache: Option<(Instant, Vec<ForecastPoint>)>,
}

/// HTTP adapter for the carbon intensity forecast API.
pub struct CarbonForecastProvider {
    client: reqwest::Client,
    base_url: Url,
    state: Mutex<ProviderState>,
}

/// Provider wire format: `{"data": [{"from", "to", "intensity": {...}}]}`.
#[derive(Debug, Deserialize)]
struct SchedulePayload {
    #[serde(default)]
    data: Vec<SlotEntry>,
}

#[derive(Debug, Deserialize)]
struct SlotEntry {
    from: Option<String>,
    to: Option<String>,
    intensity: Option<IntensityEntry>,
}

#[derive(Debug, Deserialize)]
struct IntensityEntry {
    forecast: Option<f64>,
    actual: Option<f64>,
    index: Option<String>,
}

impl CarbonForecastProvider {
    pub fn new(base_url: Url, settings: ProviderSettings) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("default reqwest client");
        Self {
            client,
            base_url,
            state: Mutex::new(ProviderState {
                settings,
                cache: None,
            }),
        }
    }

    fn settings(&self) -> ProviderSettings {
        self.state.lock().expect("provider state poisoned").settings.clone()
    }

    fn cached_schedule(&self, ttl: Duration) -> Option<Vec<ForecastPoint>> {
        let state = self.state.lock().expect("provider state poisoned");
        state
            .cache
            .as_ref()
            .filter(|(fetched, _)| fetched.elapsed() < ttl)
            .map(|(_, schedule)| schedule.clone())
    }

    fn store_schedule(&self, schedule: Vec<ForecastPoint>) {
        let mut state = self.state.lock().expect("provider state poisoned");
        state.cache = Some((Instant::now(), schedule));
    }

    fn schedule_path(&self, target: &CarbonTarget, start: DateTime<Utc>) -> String {
        let period = start.format("%Y-%m-%dT%H:%MZ");
        match target {
            CarbonTarget::Region(id) => {
                format!("regional/intensity/{period}/fw48h/regionid/{id}")
            }
            CarbonTarget::Postcode(code) => {
                format!("regional/intensity/{period}/fw48h/postcode/{code}")
            }
            CarbonTarget::National => format!("intensity/{period}/fw48h"),
        }
    }

    async fn fetch_schedule(
        &self,
        settings: &ProviderSettings,
    ) -> Result<Vec<ForecastPoint>, ForecastUnavailable> {
        let start = floor_half_hour(Utc::now());
        let path = self.schedule_path(&settings.target, start);
        let url = self
            .base_url
            .join(&path)
            .map_err(|e| ForecastUnavailable::new(format!("invalid forecast url: {e}")))?;

        let response = self
            .client
            .get(url.clone())
            .timeout(settings.timeout)
            .send()
            .await
            .map_err(|e| ForecastUnavailable::new(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ForecastUnavailable::new(format!(
                "forecast endpoint returned {}",
                response.status()
            )));
        }

        let payload: SchedulePayload = response
            .json()
            .await
            .map_err(|e| ForecastUnavailable::new(format!("malformed forecast payload: {e}")))?;

        let schedule = normalise_schedule(payload.data, Utc::now());
        if schedule.is_empty() {
            return Err(ForecastUnavailable::new("forecast schedule is empty"));
        }

        debug!(url = %url, slots = schedule.len(), "Fetched carbon forecast schedule");
        Ok(schedule)
    }
}

#[async_trait]
impl ForecastSource for CarbonForecastProvider {
    async fn sample(&self) -> Result<ForecastSnapshot, ForecastUnavailable> {
        let settings = self.settings();

        let schedule = match self.cached_schedule(settings.cache_ttl) {
            Some(schedule) => schedule,
            None => {
                let schedule = self.fetch_schedule(&settings).await?;
                self.store_schedule(schedule.clone());
                schedule
            }
        };

        snapshot_from_schedule(schedule, Utc::now())
    }

    fn configure(&self, settings: ProviderSettings) {
        let mut state = self.state.lock().expect("provider state poisoned");
        if state.settings.target != settings.target {
            // A different scope invalidates the cached schedule.
            state.cache = None;
        }
        state.settings = settings;
    }
}

/// Floor the instant to the containing half-hour slot boundary.
fn floor_half_hour(moment: DateTime<Utc>) -> DateTime<Utc> {
    let minute = if moment.minute() < 30 { 0 } else { 30 };
    moment
        .with_minute(minute)
        .and_then(|m| m.with_second(0))
        .and_then(|m| m.with_nanosecond(0))
        .unwrap_or(moment)
}

/// Parse provider slot timestamps; the upstream format omits seconds
/// (`2026-08-02T12:00Z`) but full RFC3339 is tolerated too.
fn parse_slot_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%MZ")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Drop stale or unparseable slots and order the rest by start time.
fn normalise_schedule(entries: Vec<SlotEntry>, now: DateTime<Utc>) -> Vec<ForecastPoint> {
    let window_start = now - chrono::Duration::minutes(30);
    let mut schedule: Vec<ForecastPoint> = entries
        .into_iter()
        .filter_map(|entry| {
            let start = parse_slot_time(entry.from.as_deref()?)?;
            let end = parse_slot_time(entry.to.as_deref()?)?;
            if end < window_start {
                return None;
            }
            let (forecast, index) = match entry.intensity {
                Some(intensity) => (
                    intensity.forecast.or(intensity.actual),
                    intensity.index,
                ),
                None => (None, None),
            };
            Some(ForecastPoint {
                start,
                end,
                forecast,
                index,
            })
        })
        .collect();
    schedule.sort_by_key(|point| point.start);
    schedule
}

/// Build a snapshot from an ordered slot schedule.
///
/// `intensity_now` is the slot containing `now` (or the first upcoming
/// slot); `intensity_next` is the following one and is backfilled from
/// `intensity_now` with the degraded flag set when missing.
fn snapshot_from_schedule(
    schedule: Vec<ForecastPoint>,
    now: DateTime<Utc>,
) -> Result<ForecastSnapshot, ForecastUnavailable> {
    let current_idx = schedule
        .iter()
        .position(|p| p.start <= now && now < p.end)
        .or_else(|| schedule.iter().position(|p| p.end > now));

    let current_idx = match current_idx {
        Some(idx) => idx,
        None => return Err(ForecastUnavailable::new("no slot covers the sampling instant")),
    };

    let current = &schedule[current_idx];
    let next = schedule.get(current_idx + 1);

    let mut intensity_now = current.forecast;
    let mut intensity_next = next.and_then(|p| p.forecast);
    let mut degraded = false;

    match (intensity_now, intensity_next) {
        (None, None) => {
            return Err(ForecastUnavailable::new(
                "schedule carries no intensity values",
            ))
        }
        (Some(_), None) => {
            intensity_next = intensity_now;
            degraded = true;
        }
        (None, Some(_)) => {
            intensity_now = intensity_next;
            degraded = true;
        }
        (Some(_), Some(_)) => {}
    }

    if degraded {
        warn!("Forecast degraded: missing slot value backfilled");
    }

    let extended = schedule
        .iter()
        .skip(current_idx + 1)
        .filter_map(|point| {
            let forecast = point.forecast?;
            let midpoint = point.start + (point.end - point.start) / 2;
            let horizon_hours = (midpoint - now).num_seconds() as f64 / 3600.0;
            if horizon_hours <= 0.0 || horizon_hours > MAX_HORIZON_HOURS {
                return None;
            }
            Some(ExtendedPoint {
                horizon_hours,
                intensity: forecast,
            })
        })
        .collect();

    Ok(ForecastSnapshot {
        intensity_now,
        intensity_next,
        index_now: current.index.clone(),
        index_next: next.and_then(|p| p.index.clone()),
        demand_now: None,
        demand_next: None,
        degraded,
        generated_at: Some(now),
        schedule: schedule[current_idx..].to_vec(),
        extended,
    })
}

/// Time-windowed store of observed current intensities.
///
/// The median over the window is the reference the credit-greedy policy
/// scales its allowance against; it bootstraps to the first observation.
#[derive(Debug)]
pub struct IntensityHistory {
    window: Duration,
    samples: VecDeque<(Instant, f64)>,
}

impl IntensityHistory {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn push(&mut self, value: f64) {
        self.push_at(value, Instant::now());
    }

    fn push_at(&mut self, value: f64, now: Instant) {
        self.samples.push_back((now, value));
        let window = self.window;
        while let Some((ts, _)) = self.samples.front() {
            if now.duration_since(*ts) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn median(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut values: Vec<f64> = self.samples.iter().map(|(_, v)| *v).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = values.len() / 2;
        if values.len() % 2 == 0 {
            Some((values[mid - 1] + values[mid]) / 2.0)
        } else {
            Some(values[mid])
        }
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }
}
