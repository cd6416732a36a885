//! Scheduler library for the carbon-aware decision engine
//!
//! This crate provides the core functionality for:
//! - Quality credit accounting (ledger)
//! - Carbon intensity forecasting and demand estimation
//! - Pluggable scheduling policies with a static fallback chain
//! - Per-workload scheduler sessions and their registry
//! - Processing throttle and replica ceilings
//! - Prometheus metrics export

pub mod demand;
pub mod error;
pub mod flavours;
pub mod forecast;
pub mod ledger;
pub mod models;
pub mod observability;
pub mod policy;
pub mod registry;
pub mod session;
pub mod snapshot;
pub mod throttle;

pub use error::{EngineError, EngineResult};
pub use models::{ConfigUpdate, FlavourProfile, ForecastSnapshot, SchedulerConfig};
pub use observability::EngineMetrics;
pub use policy::PolicyKind;
pub use registry::SchedulerRegistry;
pub use session::SchedulerSession;
pub use snapshot::{ManualScheduleRequest, ScheduleSnapshot};
