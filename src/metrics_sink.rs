//! The `MetricsSink` trait and its Prometheus pushgateway implementation

use async_trait::async_trait;
use std::fmt::Write as _;

use crate::queue::MetricSample;
use crate::Error;

/// Where a `CheckRunner` publishes the telemetry it scrapes from worker
/// logs and its own run outcomes. Kept as a thin trait so tests can swap in
/// a recording fake instead of pushing to a real gateway.
#[async_trait]
pub trait MetricsSink: Send + Sync + 'static {
    async fn push(&self, samples: &[MetricSample]) -> Result<(), Error>;
}

/// Pushes samples to a Prometheus pushgateway over its text exposition
/// format, matching `mozalert/metrics/thread.py`'s `push_to_gateway` calls.
pub struct PushgatewaySink {
    client: reqwest::Client,
    gateway_url: String,
    job: String,
}

impl PushgatewaySink {
    pub fn new(gateway_url: impl Into<String>) -> Self {
        PushgatewaySink {
            client: reqwest::Client::new(),
            gateway_url: gateway_url.into(),
            job: "check_controller".to_owned(),
        }
    }
}

#[async_trait]
impl MetricsSink for PushgatewaySink {
    async fn push(&self, samples: &[MetricSample]) -> Result<(), Error> {
        if samples.is_empty() {
            return Ok(());
        }
        let body = render_exposition(samples);
        let url = format!("{}/metrics/job/{}", self.gateway_url.trim_end_matches('/'), self.job);
        self.client
            .post(url)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// A sink that records every pushed sample in memory, for tests and for
/// running without a configured gateway.
#[derive(Default)]
pub struct NullSink {
    pub pushed: std::sync::Mutex<Vec<MetricSample>>,
}

#[async_trait]
impl MetricsSink for NullSink {
    async fn push(&self, samples: &[MetricSample]) -> Result<(), Error> {
        self.pushed
            .lock()
            .expect("metrics sink mutex poisoned")
            .extend_from_slice(samples);
        Ok(())
    }
}

fn render_exposition(samples: &[MetricSample]) -> String {
    let mut out = String::new();
    for sample in samples {
        let metric_name = format!("check_controller_{}", sanitize(&sample.name));
        let mut labels = format!("name=\"{}\",namespace=\"{}\"", sample.key.name, sample.key.namespace);
        for (k, v) in &sample.labels {
            let _ = write!(labels, ",{}=\"{}\"", sanitize(k), v.replace('"', "\\\""));
        }
        let _ = writeln!(out, "{metric_name}{{{labels}}} {}", sample.value);
    }
    out
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CheckKey;
    use std::collections::HashMap;

    #[tokio::test]
    async fn null_sink_records_pushed_samples() {
        let sink = NullSink::default();
        let sample = MetricSample {
            key: CheckKey::new("default", "disk-space"),
            name: "runtime".to_owned(),
            value: 1.5,
            labels: HashMap::new(),
        };
        sink.push(std::slice::from_ref(&sample)).await.unwrap();
        assert_eq!(sink.pushed.lock().unwrap().len(), 1);
    }

    #[test]
    fn render_exposition_sanitizes_metric_and_label_names() {
        let mut labels = HashMap::new();
        labels.insert("escalated".to_owned(), "true".to_owned());
        let sample = MetricSample {
            key: CheckKey::new("default", "disk-space"),
            name: "check-runtime".to_owned(),
            value: 3.0,
            labels,
        };
        let rendered = render_exposition(&[sample]);
        assert!(rendered.contains("check_controller_check_runtime"));
        assert!(rendered.contains("escalated=\"true\""));
    }
}
