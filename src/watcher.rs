//! `Watcher`: the resumable list-then-watch loop against the cluster API

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::k8s::{ClusterClient, ClusterEvent};
use crate::model::Event;
use crate::queue::EventSender;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Streams `Check` resource events into the `EventQueue`, resuming from the
/// last observed `resource_version` on reconnect (spec §4.3).
pub struct Watcher {
    cluster: Arc<dyn ClusterClient>,
}

impl Watcher {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Watcher { cluster }
    }

    /// Run the list-then-watch loop until shutdown is requested or a fatal
    /// watch error propagates.
    pub async fn run(self, events: EventSender, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.run_once(&events, &mut shutdown).await {
                StreamOutcome::Fatal(reason) => {
                    let _ = events.put(Event::error(reason)).await;
                    return;
                }
                StreamOutcome::ShuttingDown => return,
                StreamOutcome::Disconnected => {
                    tracing::warn!(backoff_secs = backoff.as_secs(), "watch stream ended, reconnecting");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                return;
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// List every check (emitting a synthetic `ADDED` for each), then watch
    /// from the listed `resource_version` until the stream ends, errors, or
    /// shutdown is requested.
    async fn run_once(&self, events: &EventSender, shutdown: &mut watch::Receiver<bool>) -> StreamOutcome {
        let (checks, resource_version) = match self.cluster.list_checks().await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(%err, "failed to list checks, will retry");
                return StreamOutcome::Disconnected;
            }
        };

        for (key, raw) in checks {
            match crate::model::Event::decode(&key.namespace, &key.name, &raw) {
                Ok((config, pre_status)) => {
                    let _ = events.put(Event::added(key, config, pre_status)).await;
                }
                Err(reason) => {
                    let _ = events.put(Event::bad(key, reason)).await;
                }
            }
        }

        let mut stream = match self.cluster.watch_checks(&resource_version).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(%err, "failed to start watch, will retry");
                return StreamOutcome::Disconnected;
            }
        };

        loop {
            tokio::select! {
                notification = stream.recv() => {
                    match notification {
                        Some(ClusterEvent::Added(key, raw)) => self.forward_object_event(events, key, raw, true).await,
                        Some(ClusterEvent::Modified(key, raw)) => self.forward_object_event(events, key, raw, false).await,
                        Some(ClusterEvent::Deleted(key)) => {
                            let _ = events.put(Event::deleted(key)).await;
                        }
                        Some(ClusterEvent::Error(reason)) => return StreamOutcome::Fatal(reason),
                        None => return StreamOutcome::Disconnected,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return StreamOutcome::ShuttingDown;
                    }
                }
            }
        }
    }

    async fn forward_object_event(&self, events: &EventSender, key: crate::model::CheckKey, raw: serde_json::Value, added: bool) {
        match crate::model::Event::decode(&key.namespace, &key.name, &raw) {
            Ok((config, pre_status)) => {
                let event = if added {
                    Event::added(key, config, pre_status)
                } else {
                    Event::modified(key, config, pre_status)
                };
                let _ = events.put(event).await;
            }
            Err(reason) => {
                let _ = events.put(Event::bad(key, reason)).await;
            }
        }
    }
}

enum StreamOutcome {
    /// The watch stream itself reported a fatal error; the controller must
    /// shut down (spec §4.3 "Treats an ERROR event as fatal").
    Fatal(String),
    /// The stream ended or a transport error occurred; reconnect with
    /// backoff.
    Disconnected,
    ShuttingDown,
}
