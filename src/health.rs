//! `HealthMonitor`: a periodic sanity audit against the resource list

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::k8s::ClusterClient;
use crate::model::CheckState;

/// How stale `next_check` is allowed to be before counting as a sanity
/// failure (spec §4.6: `next_check + 30s < now`)
const STALENESS_GRACE: chrono::Duration = chrono::Duration::seconds(30);

/// A periodic, read-only task that audits every check's persisted
/// `next_check` against the current time, tripping a circuit-breaker log
/// after enough consecutive failing audits (spec §4.6). Observes only; it
/// never mutates cluster state.
pub struct HealthMonitor {
    cluster: Arc<dyn ClusterClient>,
    interval: Duration,
    circuit_breaker_threshold: u32,
}

impl HealthMonitor {
    pub fn new(cluster: Arc<dyn ClusterClient>, interval: Duration, circuit_breaker_threshold: u32) -> Self {
        HealthMonitor {
            cluster,
            interval,
            circuit_breaker_threshold,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut consecutive_failing_runs = 0u32;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let failures = self.audit_once().await;
                    if failures > 0 {
                        consecutive_failing_runs += 1;
                    } else {
                        consecutive_failing_runs = 0;
                    }
                    if consecutive_failing_runs > self.circuit_breaker_threshold {
                        tracing::error!(
                            consecutive_failing_runs,
                            "health monitor circuit breaker tripped: checks are not being scheduled"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                return;
            }
        }
    }

    /// List every check and count how many are sanity-failing right now,
    /// logging each one at warn level.
    async fn audit_once(&self) -> u32 {
        let (checks, _resource_version) = match self.cluster.list_checks().await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(%err, "health monitor failed to list checks");
                return 0;
            }
        };

        let mut failures = 0;
        for (key, raw) in checks {
            let status = raw.get("status").map(crate::model::Status::from_json).unwrap_or_default();
            if is_sanity_failure(&status) {
                failures += 1;
                tracing::warn!(check = %key, "check has not been scheduled recently");
            }
        }
        failures
    }
}

/// `next_check + 30s < now && state != RUNNING` (spec §4.6)
fn is_sanity_failure(status: &crate::model::Status) -> bool {
    match status.next_check {
        Some(next_check) => next_check + STALENESS_GRACE < Utc::now() && status.state != CheckState::Running,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Status;

    #[test]
    fn stale_next_check_while_idle_is_a_sanity_failure() {
        let mut status = Status::default();
        status.next_check = Some(Utc::now() - chrono::Duration::minutes(5));
        status.state = CheckState::Idle;
        assert!(is_sanity_failure(&status));
    }

    #[test]
    fn stale_next_check_while_running_is_not_a_failure() {
        let mut status = Status::default();
        status.next_check = Some(Utc::now() - chrono::Duration::minutes(5));
        status.state = CheckState::Running;
        assert!(!is_sanity_failure(&status));
    }

    #[test]
    fn next_check_within_grace_window_is_not_a_failure() {
        let mut status = Status::default();
        status.next_check = Some(Utc::now() - chrono::Duration::seconds(5));
        status.state = CheckState::Idle;
        assert!(!is_sanity_failure(&status));
    }

    #[test]
    fn missing_next_check_is_not_a_failure() {
        let status = Status::default();
        assert!(!is_sanity_failure(&status));
    }
}
