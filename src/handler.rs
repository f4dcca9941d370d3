//! `CheckHandler`: owns the live `CheckRunner`s and reacts to events

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::escalate::EscalatorRegistry;
use crate::k8s::ClusterClient;
use crate::model::{CheckConfig, CheckKey, Event, EventKind};
use crate::queue::{EventReceiver, MetricsSender};
use crate::runner::CheckRunner;

/// A running `CheckRunner`'s supervision handle: enough to shut it down and
/// to compare its config for status-echo detection, without re-reading the
/// runner itself (spec §4.5 "compare... structurally").
struct RunnerHandle {
    config: CheckConfig,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Consumes the `EventQueue` and maintains one `CheckRunner` per live check
/// key, per spec §4.5.
pub struct CheckHandler {
    cluster: Arc<dyn ClusterClient>,
    escalators: Arc<EscalatorRegistry>,
    metrics: MetricsSender,
    runners: HashMap<CheckKey, RunnerHandle>,
}

/// Why `CheckHandler::run` returned
#[derive(Debug, PartialEq, Eq)]
pub enum HandlerExit {
    /// Shutdown was requested from outside (the controller supervisor)
    Shutdown,
    /// The watcher reported a fatal `ERROR` event; this is fatal to the
    /// whole controller (spec §4.5 "ERROR: terminate all runners and
    /// propagate a fatal signal upward").
    FatalWatchError(String),
}

impl CheckHandler {
    pub fn new(cluster: Arc<dyn ClusterClient>, escalators: Arc<EscalatorRegistry>, metrics: MetricsSender) -> Self {
        CheckHandler {
            cluster,
            escalators,
            metrics,
            runners: HashMap::new(),
        }
    }

    /// Drain `events` until shutdown is requested or a fatal event arrives.
    pub async fn run(mut self, mut events: EventReceiver, mut shutdown: watch::Receiver<bool>) -> HandlerExit {
        let poll_timeout = tokio::time::Duration::from_secs(3);
        let exit = loop {
            tokio::select! {
                event = events.get(poll_timeout) => {
                    if let Some(event) = event {
                        if let Some(exit) = self.handle(event).await {
                            break exit;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break HandlerExit::Shutdown;
                    }
                }
            }
            if *shutdown.borrow() {
                break HandlerExit::Shutdown;
            }
        };
        self.terminate_all().await;
        exit
    }

    /// Apply one event, returning `Some(exit)` if this event ends the
    /// handler's run (only `ERROR` does).
    async fn handle(&mut self, event: Event) -> Option<HandlerExit> {
        match event.kind {
            EventKind::Added => {
                if self.runners.contains_key(&event.key) {
                    tracing::warn!(check = %event.key, "ADDED for a key that already has a runner, replacing it");
                    self.terminate_one(&event.key).await;
                }
                if let Some(config) = event.config {
                    self.spawn_runner(event.key, config, Some(event.pre_status));
                }
                None
            }
            EventKind::Modified => {
                let Some(config) = event.config else {
                    return None;
                };
                match self.runners.get(&event.key) {
                    Some(existing) if existing.config == config => {
                        tracing::debug!(check = %event.key, "MODIFIED is a status-echo, ignoring");
                    }
                    _ => {
                        self.terminate_one(&event.key).await;
                        self.spawn_runner(event.key, config, Some(event.pre_status));
                    }
                }
                None
            }
            EventKind::Deleted => {
                self.terminate_one(&event.key).await;
                None
            }
            EventKind::Error => {
                let reason = event.reason.unwrap_or_else(|| "unknown watch error".to_owned());
                tracing::error!(%reason, "fatal watch error, terminating all runners");
                Some(HandlerExit::FatalWatchError(reason))
            }
            EventKind::BadEvent => {
                tracing::warn!(check = %event.key, reason = ?event.reason, "dropping unparseable event");
                None
            }
        }
    }

    fn spawn_runner(&mut self, key: CheckKey, config: CheckConfig, pre_status: Option<crate::model::Status>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = CheckRunner::new(
            key.clone(),
            config.clone(),
            self.cluster.clone(),
            self.escalators.clone(),
            self.metrics.clone(),
            pre_status,
        );
        let join = tokio::spawn(runner.run(shutdown_rx));
        self.runners.insert(
            key,
            RunnerHandle {
                config,
                shutdown: shutdown_tx,
                join,
            },
        );
    }

    async fn terminate_one(&mut self, key: &CheckKey) {
        if let Some(handle) = self.runners.remove(key) {
            let _ = handle.shutdown.send(true);
            if let Err(err) = handle.join.await {
                tracing::warn!(check = %key, %err, "runner task panicked while terminating");
            }
        }
    }

    async fn terminate_all(&mut self) {
        let keys: Vec<CheckKey> = self.runners.keys().cloned().collect();
        for key in keys {
            self.terminate_one(&key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalate::ClusterContext;
    use crate::k8s::ClusterEvent;
    use crate::model::Status;
    use crate::queue::event_queue;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct NoopClusterClient;

    #[async_trait]
    impl ClusterClient for NoopClusterClient {
        async fn list_checks(&self) -> Result<(Vec<(CheckKey, serde_json::Value)>, String), crate::Error> {
            Ok((vec![], String::new()))
        }
        async fn watch_checks(&self, _rv: &str) -> Result<tokio::sync::mpsc::Receiver<ClusterEvent>, crate::Error> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(rx)
        }
        async fn patch_status(&self, _key: &CheckKey, _patch: serde_json::Value) -> Result<(), crate::Error> {
            Ok(())
        }
        async fn create_job(&self, _key: &CheckKey, _job_name: &str, _workload_spec: &serde_json::Value) -> Result<(), crate::Error> {
            Ok(())
        }
        async fn job_phase(&self, _key: &CheckKey, _job_name: &str) -> Result<crate::k8s::JobPhase, crate::Error> {
            Ok(crate::k8s::JobPhase::Succeeded)
        }
        async fn job_start_time(&self, _key: &CheckKey, _job_name: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>, crate::Error> {
            Ok(None)
        }
        async fn job_logs(&self, _key: &CheckKey, _job_name: &str) -> Result<String, crate::Error> {
            Ok(String::new())
        }
        async fn delete_job(&self, _key: &CheckKey, _job_name: &str) -> Result<(), crate::Error> {
            Ok(())
        }
    }

    fn handler() -> CheckHandler {
        CheckHandler::new(
            Arc::new(NoopClusterClient),
            Arc::new(EscalatorRegistry::new(ClusterContext {
                project: None,
                cluster: None,
                region: None,
            })),
            crate::queue::metrics_queue::channel().0,
        )
    }

    fn config(key: &CheckKey) -> CheckConfig {
        CheckConfig::new(
            key.clone(),
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(60),
            3,
            Duration::ZERO,
            vec![],
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn added_event_spawns_a_runner() {
        let mut handler = handler();
        let key = CheckKey::new("default", "disk-space");
        let event = Event::added(key.clone(), config(&key), Status::default());
        assert!(handler.handle(event).await.is_none());
        assert!(handler.runners.contains_key(&key));
        handler.terminate_all().await;
    }

    #[tokio::test]
    async fn modified_with_unchanged_config_is_a_noop() {
        let mut handler = handler();
        let key = CheckKey::new("default", "disk-space");
        handler.handle(Event::added(key.clone(), config(&key), Status::default())).await;

        handler.handle(Event::modified(key.clone(), config(&key), Status::default())).await;
        assert_eq!(handler.runners.len(), 1);
        handler.terminate_all().await;
    }

    #[tokio::test]
    async fn modified_with_changed_config_replaces_the_runner() {
        let mut handler = handler();
        let key = CheckKey::new("default", "disk-space");
        handler.handle(Event::added(key.clone(), config(&key), Status::default())).await;

        let mut changed = config(&key);
        changed.max_attempts = 5;
        handler.handle(Event::modified(key.clone(), changed.clone(), Status::default())).await;

        assert_eq!(handler.runners.get(&key).unwrap().config, changed);
        handler.terminate_all().await;
    }

    #[tokio::test]
    async fn deleted_event_removes_the_runner() {
        let mut handler = handler();
        let key = CheckKey::new("default", "disk-space");
        handler.handle(Event::added(key.clone(), config(&key), Status::default())).await;
        handler.handle(Event::deleted(key.clone())).await;
        assert!(!handler.runners.contains_key(&key));
    }

    #[tokio::test]
    async fn error_event_is_fatal_and_terminates_all_runners() {
        let mut handler = handler();
        let key = CheckKey::new("default", "disk-space");
        handler.handle(Event::added(key.clone(), config(&key), Status::default())).await;

        let exit = handler.handle(Event::error("watch disconnected")).await;
        assert_eq!(exit, Some(HandlerExit::FatalWatchError("watch disconnected".to_owned())));
    }

    #[tokio::test]
    async fn run_exits_on_shutdown_and_terminates_runners() {
        let handler = handler();
        let (_event_tx, event_rx) = event_queue::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        let exit = handler.run(event_rx, shutdown_rx).await;
        assert_eq!(exit, HandlerExit::Shutdown);
    }
}
