//! HealthMonitor - derives the queue health verdict for operators
//!
//! A pure function over the current queue stats and provider breaker states;
//! it never mutates anything and holds no locks of its own.

use std::collections::HashSet;
use std::time::Duration;

use pq_common::{QueueHealth, QueueHealthStatus};

use crate::breaker::CircuitState;
use crate::dispatcher::ProviderStats;

/// Thresholds for the health verdict
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Queue capacity; reaching it is critical.
    pub max_queue_depth: usize,
    /// Pending depth at which the verdict degrades to warning.
    pub warn_threshold: usize,
    /// Oldest-request age at which the verdict degrades to warning.
    pub age_warn_threshold: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_queue_depth: 100,
            warn_threshold: 75,
            age_warn_threshold: Duration::from_secs(60),
        }
    }
}

pub struct HealthMonitor {
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Evaluate the health verdict.
    ///
    /// - critical: queue at capacity, or every provider referenced by pending
    ///   requests has an open circuit
    /// - warning: depth or oldest-request age past the warn thresholds
    /// - healthy: otherwise
    ///
    /// `issues` lists every condition currently true, not just the worst one.
    pub fn evaluate(
        &self,
        length: usize,
        oldest_age: Option<Duration>,
        providers: &[ProviderStats],
        referenced: &HashSet<String>,
    ) -> QueueHealth {
        let mut issues = Vec::new();

        for provider in providers {
            if provider.circuit_state == CircuitState::Open {
                issues.push(format!("provider {} circuit open", provider.name));
            }
        }

        let at_capacity = length >= self.thresholds.max_queue_depth;
        if at_capacity {
            issues.push(format!(
                "queue depth {}/{} at capacity",
                length, self.thresholds.max_queue_depth
            ));
        }

        let all_referenced_open = !referenced.is_empty()
            && referenced.iter().all(|name| {
                providers
                    .iter()
                    .find(|p| &p.name == name)
                    .map(|p| p.circuit_state == CircuitState::Open)
                    .unwrap_or(false)
            });
        if all_referenced_open {
            issues.push(
                "all providers referenced by pending requests have open circuits".to_string(),
            );
        }

        let near_capacity = !at_capacity && length >= self.thresholds.warn_threshold;
        if near_capacity {
            issues.push(format!(
                "queue depth {} approaching capacity {}",
                length, self.thresholds.max_queue_depth
            ));
        }

        let stale = oldest_age
            .map(|age| age >= self.thresholds.age_warn_threshold)
            .unwrap_or(false);
        if stale {
            let age = oldest_age.unwrap_or_default();
            issues.push(format!(
                "oldest request waiting {}s (threshold {}s)",
                age.as_secs(),
                self.thresholds.age_warn_threshold.as_secs()
            ));
        }

        let status = if at_capacity || all_referenced_open {
            QueueHealthStatus::Critical
        } else if near_capacity || stale {
            QueueHealthStatus::Warning
        } else {
            QueueHealthStatus::Healthy
        };

        QueueHealth { status, issues }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}
