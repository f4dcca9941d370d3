//! A lossy handoff from runners to the metrics pusher task. Bounded and
//! non-blocking on the sending side: a runner publishing telemetry must
//! never stall its tick waiting on a slow metrics sink (spec §7.2).

use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::model::CheckKey;

const CAPACITY: usize = 2048;

/// A single metric observation queued for the metrics sink
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    pub key: CheckKey,
    pub name: String,
    pub value: f64,
    pub labels: HashMap<String, String>,
}

#[derive(Clone)]
pub struct MetricsSender(mpsc::Sender<MetricSample>);

pub struct MetricsReceiver(mpsc::Receiver<MetricSample>);

pub fn channel() -> (MetricsSender, MetricsReceiver) {
    let (tx, rx) = mpsc::channel(CAPACITY);
    (MetricsSender(tx), MetricsReceiver(rx))
}

impl MetricsSender {
    /// Queue one sample. Drops it (with a debug log) rather than blocking
    /// if the channel is full - metrics are best-effort.
    pub fn put(&self, sample: MetricSample) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.0.try_send(sample) {
            tracing::debug!("metrics queue full, discarding sample");
        }
    }

    /// Queue every entry in `metrics` under the same key/labels
    pub fn put_many(&self, key: &CheckKey, labels: &HashMap<String, String>, metrics: &HashMap<String, f64>) {
        for (name, value) in metrics {
            self.put(MetricSample {
                key: key.clone(),
                name: name.clone(),
                value: *value,
                labels: labels.clone(),
            });
        }
    }
}

impl MetricsReceiver {
    pub async fn get(&mut self, timeout: Duration) -> Option<MetricSample> {
        tokio::time::timeout(timeout, self.0.recv()).await.ok().flatten()
    }
}
