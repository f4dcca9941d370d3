//! `CheckRunner`: the per-check scheduler state machine

use chrono::Utc;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::escalate::EscalatorRegistry;
use crate::k8s::{ClusterClient, JobPhase};
use crate::model::{CheckConfig, CheckKey, CheckState, CheckStatus, Status};
use crate::queue::{MetricSample, MetricsSender};

/// How long a force-finalization grace window is given to an in-flight tick
/// after shutdown is signaled, before it's promoted to a forced CRITICAL
/// finalization (spec §4.4/§5).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Cadence at which a runner polls its worker Job's status while it is
/// running (spec §4.4 step 3, default 3s)
const DEFAULT_JOB_POLL_INTERVAL: Duration = Duration::from_secs(3);

fn telemetry_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^TELEMETRY:\s*(?P<key>\w+)\s*(?P<val>\d+(?:\.\d+)?)\s*$")
            .expect("telemetry regex is valid")
    })
}

/// Strip `TELEMETRY: key value` lines out of worker logs, returning the
/// remaining log text and the parsed telemetry map (spec §6).
fn extract_telemetry(raw_logs: &str) -> (String, HashMap<String, f64>) {
    let mut telemetry = HashMap::new();
    let mut remaining = String::new();
    for line in raw_logs.lines() {
        if let Some(caps) = telemetry_regex().captures(line) {
            if let Some(value) = caps.name("val").and_then(|m| m.as_str().parse::<f64>().ok()) {
                telemetry.insert(caps["key"].to_owned(), value);
                continue;
            }
        }
        remaining.push_str(line);
        remaining.push('\n');
    }
    (remaining, telemetry)
}

/// The outcome of one `run_job` execution
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Ok,
    Critical,
}

/// Owns one check: its config, its cluster/escalation/metrics collaborators,
/// and its mutable `Status`. Driven by `spawn`, which runs the scheduler
/// loop as an independent `tokio` task until shutdown is signaled.
pub struct CheckRunner {
    key: CheckKey,
    config: CheckConfig,
    cluster: Arc<dyn ClusterClient>,
    escalators: Arc<EscalatorRegistry>,
    metrics: MetricsSender,
    status: Status,
    /// Whether the check is currently in the "escalated" bookkeeping state;
    /// not part of the status subresource schema, purely internal.
    escalated: bool,
    job_poll_interval: Duration,
}

impl CheckRunner {
    /// Construct a runner, optionally seeded from a previously persisted
    /// `pre_status` (spec §4.4 "Seeding from pre_status").
    pub fn new(
        key: CheckKey,
        config: CheckConfig,
        cluster: Arc<dyn ClusterClient>,
        escalators: Arc<EscalatorRegistry>,
        metrics: MetricsSender,
        pre_status: Option<Status>,
    ) -> Self {
        let mut status = Status::default();
        let mut escalated = false;
        if let Some(pre) = pre_status {
            status.seed_from(&pre);
            escalated = !status.status.is_ok() && status.attempt >= config.max_attempts;
        }
        CheckRunner {
            key,
            config,
            cluster,
            escalators,
            metrics,
            status,
            escalated,
            job_poll_interval: DEFAULT_JOB_POLL_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_job_poll_interval(mut self, interval: Duration) -> Self {
        self.job_poll_interval = interval;
        self
    }

    pub fn config(&self) -> &CheckConfig {
        &self.config
    }

    /// The delay before this runner's first tick, applying the seeding rule
    /// from spec §4.4: a runner seeded mid-RUNNING reschedules almost
    /// immediately; otherwise it honors the persisted `next_check`.
    fn initial_delay(&self) -> Duration {
        if self.status.is_running() {
            return Duration::from_secs(1);
        }
        match self.status.next_check {
            Some(next_check) => {
                let now = Utc::now();
                if next_check <= now {
                    Duration::from_secs(1)
                } else {
                    (next_check - now).to_std().unwrap_or(Duration::from_secs(1))
                }
            }
            None => Duration::from_secs(1),
        }
    }

    /// Run the scheduler loop until `shutdown` reports `true`. Consumes
    /// `self` since the loop owns the runner for its whole lifetime.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        // A runner that was mid-flight when seeded re-enters RUNNING state;
        // that in-flight attempt is considered lost, so we go back to IDLE
        // before scheduling the next tick (the attempt decrement already
        // happened in `Status::seed_from`).
        self.status.state = CheckState::Idle;
        self.status.next_check = Some(Utc::now() + chrono::Duration::from_std(self.initial_delay()).unwrap_or_default());
        if let Err(err) = self.cluster.patch_status(&self.key, self.status.to_patch()).await {
            tracing::warn!(check = %self.key, %err, "failed to publish initial status");
        }

        let mut deadline = Instant::now() + self.initial_delay();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    self.tick(&mut shutdown).await;
                    let next = self.status.next_check.unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(1));
                    let remaining = (next - Utc::now()).to_std().unwrap_or(Duration::from_secs(1));
                    deadline = Instant::now() + remaining;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
    }

    /// One scheduled execution: increments `attempt`, runs the worker
    /// workload, applies the next-interval policy, and re-publishes status
    /// (spec §4.4 "tick").
    async fn tick(&mut self, shutdown: &mut watch::Receiver<bool>) {
        self.status.attempt += 1;
        self.status.state = CheckState::Running;
        if let Err(err) = self.cluster.patch_status(&self.key, self.status.to_patch()).await {
            tracing::warn!(check = %self.key, %err, "failed to publish running status");
        }

        let (outcome, runtime) = self.run_job(shutdown).await;

        self.status.state = CheckState::Idle;
        self.status.last_check = Some(Utc::now());
        self.apply_next_interval(outcome).await;

        self.emit_metrics(outcome, runtime);

        if let Err(err) = self.cluster.patch_status(&self.key, self.status.to_patch()).await {
            tracing::warn!(check = %self.key, %err, "failed to publish final status");
        }
    }

    /// Run the worker Job for this attempt to completion (or forced
    /// finalization), updating `self.status.logs`/`telemetry`/`message` and
    /// returning the observed outcome plus the measured runtime (spec §4.4
    /// "Execution" / "Metrics emitted each tick: last runtime seconds").
    async fn run_job(&mut self, shutdown: &mut watch::Receiver<bool>) -> (Outcome, Duration) {
        let job_name = job_name(&self.key, self.status.attempt);

        if let Err(err) = self
            .cluster
            .create_job(&self.key, &job_name, &self.config.workload_spec)
            .await
        {
            tracing::error!(check = %self.key, %err, "failed to create worker job");
            self.status.message = "failed to create worker job".to_owned();
            let _ = self.cluster.delete_job(&self.key, &job_name).await;
            return (Outcome::Critical, Duration::ZERO);
        }

        let start = Instant::now();
        let mut shutdown_signaled_at: Option<Instant> = None;

        let outcome = loop {
            match self.cluster.job_phase(&self.key, &job_name).await {
                Ok(JobPhase::Succeeded) => {
                    self.status.message = "worker job succeeded".to_owned();
                    break Outcome::Ok;
                }
                Ok(JobPhase::Failed) => {
                    self.status.message = "worker job exited non-zero".to_owned();
                    break Outcome::Critical;
                }
                Ok(JobPhase::Gone) => {
                    self.status.message = "worker job disappeared before completion".to_owned();
                    break Outcome::Critical;
                }
                Ok(JobPhase::Pending | JobPhase::Running) => {}
                Err(err) => {
                    tracing::warn!(check = %self.key, %err, "failed to poll worker job status");
                }
            }

            let runtime = self.runtime_since(&job_name, start).await;
            if !self.config.timeout.is_zero() && runtime > self.config.timeout {
                self.status.message = format!("timed out after {}s", runtime.as_secs());
                break Outcome::Critical;
            }

            if *shutdown.borrow() {
                let signaled_at = *shutdown_signaled_at.get_or_insert_with(Instant::now);
                if signaled_at.elapsed() > SHUTDOWN_GRACE {
                    self.status.message = "force-finalized on shutdown".to_owned();
                    break Outcome::Critical;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.job_poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        };

        let runtime = self.runtime_since(&job_name, start).await;

        let raw_logs = self.cluster.job_logs(&self.key, &job_name).await.unwrap_or_default();
        let (logs, telemetry) = extract_telemetry(&raw_logs);
        self.status.logs = logs;
        self.status.telemetry = telemetry;

        if let Err(err) = self.cluster.delete_job(&self.key, &job_name).await {
            tracing::warn!(check = %self.key, %err, "failed to delete worker job");
        }

        (outcome, runtime)
    }

    async fn runtime_since(&self, job_name: &str, fallback_start: Instant) -> Duration {
        match self.cluster.job_start_time(&self.key, job_name).await {
            Ok(Some(started)) => (Utc::now() - started).to_std().unwrap_or_default(),
            _ => fallback_start.elapsed(),
        }
    }

    /// Apply the next-interval/escalation policy from spec §4.4
    /// "Next-interval policy", mutating `status`/`escalated` and dispatching
    /// escalations as a side effect.
    async fn apply_next_interval(&mut self, outcome: Outcome) {
        let next_interval = match outcome {
            Outcome::Ok => {
                self.status.status = CheckStatus::Ok;
                if self.escalated {
                    self.escalators
                        .escalate_all(&self.key, &self.config, &self.status)
                        .await;
                    self.escalated = false;
                    self.status.message = "recovered".to_owned();
                }
                self.status.attempt = 0;
                self.config.check_interval
            }
            Outcome::Critical => {
                self.status.status = CheckStatus::Critical;
                if self.status.attempt < self.config.max_attempts {
                    self.config.retry_interval
                } else {
                    if !self.escalated {
                        self.escalators
                            .escalate_all(&self.key, &self.config, &self.status)
                            .await;
                        self.status.message = format!("escalated after {} attempts", self.status.attempt);
                    }
                    self.escalated = true;
                    self.config.notification_interval
                }
            }
        };
        self.status.next_check = Some(Utc::now() + chrono::Duration::from_std(next_interval).unwrap_or_default());
    }

    fn emit_metrics(&self, outcome: Outcome, runtime: Duration) {
        let mut labels = HashMap::new();
        labels.insert("status".to_owned(), self.status.status.to_string());
        labels.insert("escalated".to_owned(), self.escalated.to_string());

        self.metrics.put(MetricSample {
            key: self.key.clone(),
            name: "check_runtime".to_owned(),
            value: runtime.as_secs_f64(),
            labels: labels.clone(),
        });
        if outcome == Outcome::Critical {
            self.metrics.put(MetricSample {
                key: self.key.clone(),
                name: "check_failure_count".to_owned(),
                value: 1.0,
                labels: labels.clone(),
            });
        }
        if self.escalated {
            self.metrics.put(MetricSample {
                key: self.key.clone(),
                name: "check_escalation_count".to_owned(),
                value: 1.0,
                labels: labels.clone(),
            });
        }
        self.metrics.put_many(&self.key, &labels, &self.status.telemetry);
    }
}

fn job_name(key: &CheckKey, attempt: u32) -> String {
    format!("check-{}-{}", key.name, attempt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalate::{ClusterContext, Escalator};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::sync::watch;

    #[test]
    fn extract_telemetry_strips_matching_lines() {
        let logs = "line one\nTELEMETRY: latency_ms 42\nline two\n";
        let (remaining, telemetry) = extract_telemetry(logs);
        assert_eq!(remaining, "line one\nline two\n");
        assert_eq!(telemetry.get("latency_ms"), Some(&42.0));
    }

    #[test]
    fn extract_telemetry_ignores_non_matching_lines() {
        let logs = "TELEMETRY is not a valid line\nnormal output\n";
        let (remaining, telemetry) = extract_telemetry(logs);
        assert!(telemetry.is_empty());
        assert!(remaining.contains("normal output"));
    }

    #[derive(Default)]
    struct FakeClusterClient {
        phases: Mutex<Vec<JobPhase>>,
        logs: String,
        created: AtomicU32,
        start_time: Option<chrono::DateTime<chrono::Utc>>,
    }

    #[async_trait]
    impl ClusterClient for FakeClusterClient {
        async fn list_checks(&self) -> Result<(Vec<(CheckKey, serde_json::Value)>, String), crate::Error> {
            Ok((vec![], String::new()))
        }

        async fn watch_checks(&self, _rv: &str) -> Result<tokio::sync::mpsc::Receiver<crate::k8s::ClusterEvent>, crate::Error> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(rx)
        }

        async fn patch_status(&self, _key: &CheckKey, _patch: serde_json::Value) -> Result<(), crate::Error> {
            Ok(())
        }

        async fn create_job(&self, _key: &CheckKey, _job_name: &str, _workload_spec: &serde_json::Value) -> Result<(), crate::Error> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn job_phase(&self, _key: &CheckKey, _job_name: &str) -> Result<JobPhase, crate::Error> {
            let mut phases = self.phases.lock().unwrap();
            if phases.len() > 1 {
                Ok(phases.remove(0))
            } else {
                Ok(phases.first().copied().unwrap_or(JobPhase::Succeeded))
            }
        }

        async fn job_start_time(&self, _key: &CheckKey, _job_name: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>, crate::Error> {
            Ok(self.start_time)
        }

        async fn job_logs(&self, _key: &CheckKey, _job_name: &str) -> Result<String, crate::Error> {
            Ok(self.logs.clone())
        }

        async fn delete_job(&self, _key: &CheckKey, _job_name: &str) -> Result<(), crate::Error> {
            Ok(())
        }
    }

    fn test_config(max_attempts: u32) -> CheckConfig {
        CheckConfig::new(
            CheckKey::new("default", "disk-space"),
            Duration::from_secs(60),
            Duration::from_secs(10),
            Duration::from_secs(300),
            max_attempts,
            Duration::ZERO,
            vec![],
            serde_json::json!({}),
        )
    }

    fn no_context_registry() -> Arc<EscalatorRegistry> {
        Arc::new(EscalatorRegistry::new(ClusterContext {
            project: None,
            cluster: None,
            region: None,
        }))
    }

    #[tokio::test]
    async fn happy_path_run_job_sets_ok_and_resets_attempt() {
        let cluster: Arc<dyn ClusterClient> = Arc::new(FakeClusterClient {
            phases: Mutex::new(vec![JobPhase::Succeeded]),
            ..Default::default()
        });
        let (metrics_tx, _metrics_rx) = crate::queue::metrics_queue::channel();
        let mut runner = CheckRunner::new(
            CheckKey::new("default", "disk-space"),
            test_config(3),
            cluster,
            no_context_registry(),
            metrics_tx,
            None,
        )
        .with_job_poll_interval(Duration::from_millis(1));

        let (_tx, mut rx) = watch::channel(false);
        runner.tick(&mut rx).await;

        assert_eq!(runner.status.status, CheckStatus::Ok);
        assert_eq!(runner.status.attempt, 0);
        assert_eq!(runner.status.state, CheckState::Idle);
    }

    #[tokio::test]
    async fn retry_then_escalate_after_max_attempts() {
        let cluster: Arc<dyn ClusterClient> = Arc::new(FakeClusterClient {
            phases: Mutex::new(vec![JobPhase::Failed]),
            ..Default::default()
        });
        let (metrics_tx, _metrics_rx) = crate::queue::metrics_queue::channel();
        let mut runner = CheckRunner::new(
            CheckKey::new("default", "disk-space"),
            test_config(3),
            cluster,
            no_context_registry(),
            metrics_tx,
            None,
        )
        .with_job_poll_interval(Duration::from_millis(1));

        let (_tx, mut rx) = watch::channel(false);
        runner.tick(&mut rx).await;
        assert_eq!(runner.status.attempt, 1);
        assert!(!runner.escalated);

        runner.tick(&mut rx).await;
        assert_eq!(runner.status.attempt, 2);
        assert!(!runner.escalated);

        runner.tick(&mut rx).await;
        assert_eq!(runner.status.attempt, 3);
        assert!(runner.escalated);
        assert!(runner.status.next_check.unwrap() > Utc::now() + chrono::Duration::seconds(100));
    }

    #[tokio::test]
    async fn recovery_after_escalation_clears_flag_and_notifies() {
        struct RecordingEscalator(Arc<AtomicU32>);
        #[async_trait]
        impl Escalator for RecordingEscalator {
            async fn escalate(
                &self,
                _key: &CheckKey,
                _config: &CheckConfig,
                _status: &Status,
                _args: &HashMap<String, String>,
            ) -> Result<(), crate::Error> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = EscalatorRegistry::new(ClusterContext {
            project: None,
            cluster: None,
            region: None,
        });
        registry.register("slack", Box::new(RecordingEscalator(calls.clone())));
        let registry = Arc::new(registry);

        let mut config = test_config(1);
        config.escalations = vec![crate::model::EscalationSpec {
            kind: "slack".to_owned(),
            args: HashMap::new(),
        }];

        let cluster: Arc<dyn ClusterClient> = Arc::new(FakeClusterClient {
            phases: Mutex::new(vec![JobPhase::Failed]),
            ..Default::default()
        });
        let (metrics_tx, _metrics_rx) = crate::queue::metrics_queue::channel();
        let mut runner = CheckRunner::new(
            CheckKey::new("default", "disk-space"),
            config,
            cluster.clone(),
            registry.clone(),
            metrics_tx.clone(),
            None,
        )
        .with_job_poll_interval(Duration::from_millis(1));

        let (_tx, mut rx) = watch::channel(false);
        runner.tick(&mut rx).await;
        assert!(runner.escalated);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        runner.cluster = Arc::new(FakeClusterClient {
            phases: Mutex::new(vec![JobPhase::Succeeded]),
            ..Default::default()
        });
        runner.tick(&mut rx).await;
        assert!(!runner.escalated);
        assert_eq!(runner.status.attempt, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn emits_the_measured_runtime_as_a_gauge() {
        let cluster: Arc<dyn ClusterClient> = Arc::new(FakeClusterClient {
            phases: Mutex::new(vec![JobPhase::Succeeded]),
            start_time: Some(Utc::now() - chrono::Duration::seconds(5)),
            ..Default::default()
        });
        let (metrics_tx, mut metrics_rx) = crate::queue::metrics_queue::channel();
        let mut runner = CheckRunner::new(
            CheckKey::new("default", "disk-space"),
            test_config(3),
            cluster,
            no_context_registry(),
            metrics_tx,
            None,
        )
        .with_job_poll_interval(Duration::from_millis(1));

        let (_tx, mut rx) = watch::channel(false);
        runner.tick(&mut rx).await;

        let mut saw_nonzero_runtime = false;
        while let Some(sample) = metrics_rx.get(Duration::from_millis(50)).await {
            if sample.name == "check_runtime" {
                assert!(sample.value >= 5.0, "expected measured runtime, got {}", sample.value);
                saw_nonzero_runtime = true;
            }
        }
        assert!(saw_nonzero_runtime, "expected a check_runtime sample");
    }

    #[test]
    fn seeded_running_status_reschedules_quickly() {
        let mut pre = Status::default();
        pre.state = CheckState::Running;
        pre.attempt = 2;

        let runner = CheckRunner::new(
            CheckKey::new("default", "disk-space"),
            test_config(3),
            Arc::new(FakeClusterClient::default()),
            no_context_registry(),
            crate::queue::metrics_queue::channel().0,
            Some(pre),
        );

        assert_eq!(runner.status.attempt, 1);
        assert_eq!(runner.initial_delay(), Duration::from_secs(1));
    }
}
