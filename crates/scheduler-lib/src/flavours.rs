//! Flavour registry
//!
//! Holds the current set of flavour profiles behind a read-write boundary.
//! The reconciler is the single writer (whole-set replacement); policies
//! read point-in-time snapshots and never hold the lock across work.

use std::sync::RwLock;

use crate::error::EngineError;
use crate::models::FlavourProfile;

/// Thread-safe set of enabled flavours for one session.
#[derive(Debug, Default)]
pub struct FlavourRegistry {
    flavours: RwLock<Vec<FlavourProfile>>,
}

impl FlavourRegistry {
    pub fn new(flavours: Vec<FlavourProfile>) -> Self {
        Self {
            flavours: RwLock::new(flavours),
        }
    }

    /// Atomically swap the whole flavour set.
    ///
    /// An update where every flavour is disabled is rejected: the evaluator
    /// would have nothing to schedule and the previous set stays in place.
    pub fn replace(&self, flavours: Vec<FlavourProfile>) -> Result<(), EngineError> {
        if !flavours.is_empty() && flavours.iter().all(|f| !f.enabled) {
            return Err(EngineError::Validation(
                "flavour update would disable every flavour".to_string(),
            ));
        }
        let mut guard = self.flavours.write().expect("flavour registry poisoned");
        *guard = flavours;
        Ok(())
    }

    /// Point-in-time copy of the enabled flavours, sorted by descending
    /// precision (the baseline comes first).
    pub fn snapshot(&self) -> Vec<FlavourProfile> {
        let guard = self.flavours.read().expect("flavour registry poisoned");
        let mut enabled: Vec<FlavourProfile> =
            guard.iter().filter(|f| f.enabled).cloned().collect();
        enabled.sort_by(|a, b| {
            b.precision
                .partial_cmp(&a.precision)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        enabled
    }

    /// All registered flavours, including disabled ones.
    pub fn all(&self) -> Vec<FlavourProfile> {
        self.flavours
            .read()
            .expect("flavour registry poisoned")
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.flavours
            .read()
            .expect("flavour registry poisoned")
            .is_empty()
    }
}
