//! Escalation channels and the registry that dispatches to them

pub mod email;
pub mod slack;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::model::{CheckConfig, CheckKey, EscalationSpec, Status};
use crate::Error;

/// The deep-link enrichment context passed to every escalator, filled from
/// `GCP_PROJECT`/`GCP_CLUSTER`/`GCP_REGION` when the controller runs on GKE
pub struct ClusterContext {
    pub project: Option<String>,
    pub cluster: Option<String>,
    pub region: Option<String>,
}

impl ClusterContext {
    pub fn from_env() -> Self {
        ClusterContext {
            project: std::env::var("GCP_PROJECT").ok(),
            cluster: std::env::var("GCP_CLUSTER").ok(),
            region: std::env::var("GCP_REGION").ok(),
        }
    }

    /// A deep link to this check's resource in the GCP console, or `None`
    /// if any required piece of context is missing
    pub fn deep_link(&self, key: &CheckKey) -> Option<String> {
        let project = self.project.as_ref()?;
        let cluster = self.cluster.as_ref()?;
        let region = self.region.as_ref()?;
        Some(format!(
            "https://console.cloud.google.com/kubernetes/object/{region}/{cluster}/crd.k8s.afrank.local/v1/check/{namespace}/{name}?project={project}",
            namespace = key.namespace,
            name = key.name,
        ))
    }
}

/// A single notification channel. Implementations are constructed once at
/// startup from a closed, known set of kinds (spec §6 "escalation registry
/// as a closed set") rather than resolved dynamically by string.
#[async_trait]
pub trait Escalator: Send + Sync + 'static {
    /// Send a notification for `key` transitioning to `status`
    async fn escalate(
        &self,
        key: &CheckKey,
        config: &CheckConfig,
        status: &Status,
        args: &HashMap<String, String>,
    ) -> Result<(), Error>;
}

/// The fixed set of escalators the controller knows how to dispatch to
pub struct EscalatorRegistry {
    escalators: HashMap<String, Box<dyn Escalator>>,
    context: ClusterContext,
}

impl EscalatorRegistry {
    pub fn new(context: ClusterContext) -> Self {
        EscalatorRegistry {
            escalators: HashMap::new(),
            context,
        }
    }

    pub fn register(&mut self, kind: impl Into<String>, escalator: Box<dyn Escalator>) {
        self.escalators.insert(kind.into(), escalator);
    }

    /// Notify every escalation channel configured on `config`, logging and
    /// continuing past individual channel failures rather than aborting the
    /// whole batch (spec §6 "escalation is best-effort per channel").
    pub async fn escalate_all(&self, key: &CheckKey, config: &CheckConfig, status: &Status) {
        for spec in &config.escalations {
            self.escalate_one(key, config, status, spec).await;
        }
    }

    async fn escalate_one(&self, key: &CheckKey, config: &CheckConfig, status: &Status, spec: &EscalationSpec) {
        let Some(escalator) = self.escalators.get(&spec.kind) else {
            tracing::warn!(kind = %spec.kind, check = %key, "no escalator registered for this channel type");
            return;
        };
        let mut args = spec.args.clone();
        if let Some(deep_link) = self.context.deep_link(key) {
            args.entry("deep_link".to_owned()).or_insert(deep_link);
        }
        if let Err(err) = escalator.escalate(key, config, status, &args).await {
            tracing::error!(kind = %spec.kind, check = %key, %err, "escalation channel failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct CountingEscalator(Arc<AtomicUsize>);

    #[async_trait]
    impl Escalator for CountingEscalator {
        async fn escalate(
            &self,
            _key: &CheckKey,
            _config: &CheckConfig,
            _status: &Status,
            _args: &HashMap<String, String>,
        ) -> Result<(), Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn escalate_all_dispatches_to_every_configured_channel() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = EscalatorRegistry::new(ClusterContext {
            project: None,
            cluster: None,
            region: None,
        });
        registry.register("slack", Box::new(CountingEscalator(calls.clone())));
        registry.register("email", Box::new(CountingEscalator(calls.clone())));

        let key = CheckKey::new("default", "disk-space");
        let config = CheckConfig::new(
            key.clone(),
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(60),
            3,
            Duration::ZERO,
            vec![
                EscalationSpec { kind: "slack".to_owned(), args: HashMap::new() },
                EscalationSpec { kind: "email".to_owned(), args: HashMap::new() },
                EscalationSpec { kind: "pagerduty".to_owned(), args: HashMap::new() },
            ],
            serde_json::json!({}),
        );
        let status = Status::default();

        registry.escalate_all(&key, &config, &status).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn deep_link_requires_all_three_context_fields() {
        let ctx = ClusterContext {
            project: Some("proj".to_owned()),
            cluster: None,
            region: Some("us-central1".to_owned()),
        };
        assert!(ctx.deep_link(&CheckKey::new("default", "x")).is_none());
    }
}
