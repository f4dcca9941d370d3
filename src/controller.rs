//! `Controller`: the supervisor that starts, restarts, and joins the
//! watcher, handler, metrics pusher, health monitor, and service endpoint

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::{Id, JoinSet};

use crate::config::Config;
use crate::escalate::EscalatorRegistry;
use crate::handler::{CheckHandler, HandlerExit};
use crate::health::HealthMonitor;
use crate::k8s::ClusterClient;
use crate::metrics_sink::MetricsSink;
use crate::queue::{event_queue, metrics_queue};
use crate::watcher::Watcher;

/// The process exit code for an unrecoverable watch error or CRD validation
/// failure (spec §6 "Exit codes")
pub const EXIT_CODE_FATAL: i32 = 2;

/// The supervised workers other than `CheckHandler`, which gets its own
/// fatal-exit handling instead of being restarted (spec §4.7/§2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Worker {
    Watcher,
    Health,
    Metrics,
    Service,
}

/// Everything needed to (re)spawn any of the four restartable workers
struct WorkerInputs {
    cluster: Arc<dyn ClusterClient>,
    events_tx: event_queue::EventSender,
    metrics_rx: Arc<AsyncMutex<metrics_queue::MetricsReceiver>>,
    metrics_sink: Arc<dyn MetricsSink>,
    health_interval: Duration,
    circuit_breaker_threshold: u32,
    healthz_port: u16,
}

impl WorkerInputs {
    fn spawn(&self, workers: &mut JoinSet<()>, ids: &mut HashMap<Id, Worker>, kind: Worker, shutdown: watch::Receiver<bool>) {
        let abort_handle = match kind {
            Worker::Watcher => {
                let watcher = Watcher::new(self.cluster.clone());
                let events_tx = self.events_tx.clone();
                workers.spawn(async move { watcher.run(events_tx, shutdown).await; })
            }
            Worker::Health => {
                let health_monitor =
                    HealthMonitor::new(self.cluster.clone(), self.health_interval, self.circuit_breaker_threshold);
                workers.spawn(async move { health_monitor.run(shutdown).await; })
            }
            Worker::Metrics => {
                let metrics_rx = self.metrics_rx.clone();
                let metrics_sink = self.metrics_sink.clone();
                workers.spawn(async move {
                    let mut metrics_rx = metrics_rx.lock().await;
                    run_metrics_pusher(metrics_sink, &mut metrics_rx, shutdown).await;
                })
            }
            Worker::Service => {
                let port = self.healthz_port;
                workers.spawn(async move {
                    if let Err(err) = crate::service::run(port, shutdown).await {
                        tracing::error!(%err, "healthz service endpoint exited with an error");
                    }
                })
            }
        };
        ids.insert(abort_handle.id(), kind);
    }
}

/// Starts the four long-lived workers described in spec §2/§4.7, shares a
/// single shutdown signal across them, and restarts any worker that exits
/// unexpectedly except a fatal `CheckHandler` exit.
pub struct Controller {
    cluster: Arc<dyn ClusterClient>,
    escalators: Arc<EscalatorRegistry>,
    metrics_sink: Arc<dyn MetricsSink>,
    config: Config,
}

impl Controller {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        escalators: Arc<EscalatorRegistry>,
        metrics_sink: Arc<dyn MetricsSink>,
        config: Config,
    ) -> Self {
        Controller {
            cluster,
            escalators,
            metrics_sink,
            config,
        }
    }

    /// Run until SIGINT/SIGTERM, returning the process exit code. The
    /// watcher, health monitor, metrics pusher, and service endpoint are
    /// restarted if any of them exits or panics unexpectedly; only a fatal
    /// `CheckHandler` exit (or its own panic) tears the whole thing down.
    pub async fn run(self) -> i32 {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = event_queue::channel();
        let (metrics_tx, metrics_rx) = metrics_queue::channel();

        let handler = CheckHandler::new(self.cluster.clone(), self.escalators.clone(), metrics_tx);
        let mut handler_handle = tokio::spawn(handler.run(events_rx, shutdown_rx.clone()));

        let inputs = WorkerInputs {
            cluster: self.cluster.clone(),
            events_tx,
            metrics_rx: Arc::new(AsyncMutex::new(metrics_rx)),
            metrics_sink: self.metrics_sink.clone(),
            health_interval: Duration::from_secs(self.config.health_check_interval_secs),
            circuit_breaker_threshold: self.config.circuit_breaker_threshold,
            healthz_port: self.config.healthz_port,
        };

        let mut workers = JoinSet::new();
        let mut worker_ids = HashMap::new();
        for kind in [Worker::Watcher, Worker::Health, Worker::Metrics, Worker::Service] {
            inputs.spawn(&mut workers, &mut worker_ids, kind, shutdown_rx.clone());
        }

        let mut shutdown_signal = Box::pin(wait_for_shutdown_signal());

        let exit_code = loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    tracing::info!("shutdown signal received");
                    break 0;
                }
                result = &mut handler_handle => {
                    match result {
                        Ok(HandlerExit::FatalWatchError(reason)) => {
                            tracing::error!(%reason, "fatal watch error, shutting down");
                            break EXIT_CODE_FATAL;
                        }
                        Ok(HandlerExit::Shutdown) => break 0,
                        Err(err) => {
                            tracing::error!(%err, "handler task panicked");
                            break EXIT_CODE_FATAL;
                        }
                    }
                }
                Some(joined) = workers.join_next_with_id() => {
                    let (id, panicked) = match &joined {
                        Ok((id, ())) => (*id, false),
                        Err(err) => (err.id(), true),
                    };
                    let Some(kind) = worker_ids.remove(&id) else { continue };
                    if panicked {
                        let err = joined.unwrap_err();
                        tracing::error!(%err, ?kind, "worker task panicked, restarting");
                    } else {
                        tracing::warn!(?kind, "worker exited unexpectedly, restarting");
                    }
                    inputs.spawn(&mut workers, &mut worker_ids, kind, shutdown_rx.clone());
                }
            }
        };

        let _ = shutdown_tx.send(true);
        if !handler_handle.is_finished() {
            let _ = handler_handle.await;
        }
        while workers.join_next_with_id().await.is_some() {}
        exit_code
    }
}

async fn run_metrics_pusher(
    sink: Arc<dyn MetricsSink>,
    metrics_rx: &mut metrics_queue::MetricsReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    let batch_window = Duration::from_secs(3);
    loop {
        let mut batch = Vec::new();
        let deadline = tokio::time::Instant::now() + batch_window;
        while let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now()) {
            tokio::select! {
                sample = metrics_rx.get(remaining) => {
                    match sample {
                        Some(sample) => batch.push(sample),
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        if !batch.is_empty() {
                            let _ = sink.push(&batch).await;
                        }
                        return;
                    }
                }
            }
        }
        if !batch.is_empty() {
            if let Err(err) = sink.push(&batch).await {
                tracing::warn!(%err, "failed to push metrics batch");
            }
        }
        if *shutdown.borrow() {
            return;
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
