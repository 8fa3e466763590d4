//! Caller-supplied grant for executing runs concurrently.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authorization artifact for parallel runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelAuthorization {
    pub granted_by: String,
    pub run_ids: Vec<String>,
    pub max_workers: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ParallelAuthorization {
    /// Check the grant covers exactly what is being requested.
    ///
    /// Returns the reason the request is not covered.
    pub fn check(&self, requested: &[String], now: DateTime<Utc>) -> Result<(), String> {
        if self.granted_by.trim().is_empty() {
            return Err("authorization has no granted_by".to_string());
        }
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return Err(format!("authorization expired at {}", expires_at.to_rfc3339()));
            }
        }
        if requested.len() > self.max_workers {
            return Err(format!(
                "authorization allows {} workers, {} requested",
                self.max_workers,
                requested.len()
            ));
        }
        let granted: BTreeSet<&str> = self.run_ids.iter().map(String::as_str).collect();
        let missing: Vec<&str> = requested
            .iter()
            .map(String::as_str)
            .filter(|id| !granted.contains(id))
            .collect();
        if !missing.is_empty() {
            return Err(format!(
                "authorization does not list run ids: {}",
                missing.join(", ")
            ));
        }
        Ok(())
    }
}

/// First run id that appears more than once, if any.
pub fn duplicate_run_id(run_ids: &[String]) -> Option<&str> {
    let mut seen = BTreeSet::new();
    run_ids
        .iter()
        .map(String::as_str)
        .find(|id| !seen.insert(*id))
}
