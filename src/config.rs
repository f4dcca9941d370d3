//! Layered configuration: defaults, an optional config file, then
//! environment overrides, matching `Keys::from_path` in spirit.

use std::path::Path;

use crate::Error;

fn default_plural() -> String {
    "checks".to_owned()
}

fn default_api_version() -> String {
    "v1".to_owned()
}

fn default_domain() -> String {
    "crd.k8s.afrank.local".to_owned()
}

fn default_job_poll_interval_secs() -> u64 {
    5
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_circuit_breaker_threshold() -> u32 {
    2
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_healthz_port() -> u16 {
    8080
}

/// Controller-wide configuration, loaded from an optional YAML file and
/// then overlaid with `CHECK_CONTROLLER__*` environment variables.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// The CRD group the `Check` resource is served under
    #[serde(default = "default_domain")]
    pub domain: String,
    /// The CRD version
    #[serde(default = "default_api_version")]
    pub version: String,
    /// The CRD's plural resource name
    #[serde(default = "default_plural")]
    pub plural: String,
    /// Prometheus pushgateway URL. Metrics are only pushed when set.
    pub prometheus_gateway: Option<String>,
    /// SendGrid API key used by the email escalator
    pub sendgrid_api_key: Option<String>,
    /// GCP project, used to build escalation deep links
    pub gcp_project: Option<String>,
    /// GKE cluster name, used to build escalation deep links
    pub gcp_cluster: Option<String>,
    /// GCP region, used to build escalation deep links
    pub gcp_region: Option<String>,
    /// How often a runner polls its worker Job's status
    #[serde(default = "default_job_poll_interval_secs")]
    pub job_poll_interval_secs: u64,
    /// How often the health monitor audits every runner
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Consecutive failing health audits before the circuit breaker trips
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    /// How long the supervisor waits for workers to exit on shutdown
    /// before force-finalizing them
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Port the `/healthz` service endpoint listens on
    #[serde(default = "default_healthz_port")]
    pub healthz_port: u16,
}

impl Config {
    /// Load configuration from an optional YAML file, then overlay
    /// `CHECK_CONTROLLER__*` environment variables, then the specific bare
    /// environment variables spec.md §6 names (`PROMETHEUS_GATEWAY`,
    /// `SENDGRID_API_KEY`, `DOMAIN`, `VERSION`, `PLURAL`) on top of that -
    /// the bare names win, matching the original's scattered
    /// `os.environ.get(...)` call sites.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, Error> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if path.as_ref().exists() {
                builder = builder.add_source(
                    config::File::from(path.as_ref()).format(config::FileFormat::Yaml),
                );
            }
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CHECK_CONTROLLER").separator("__"),
        );
        let mut config: Config = builder.build()?.try_deserialize()?;
        config.apply_bare_env_overrides();
        Ok(config)
    }

    /// Overlay the bare (unprefixed) environment variables spec.md §6
    /// names directly, taking priority over both the file and the
    /// `CHECK_CONTROLLER__*`-prefixed form.
    fn apply_bare_env_overrides(&mut self) {
        if let Ok(domain) = std::env::var("DOMAIN") {
            self.domain = domain;
        }
        if let Ok(version) = std::env::var("VERSION") {
            self.version = version;
        }
        if let Ok(plural) = std::env::var("PLURAL") {
            self.plural = plural;
        }
        if let Ok(gateway) = std::env::var("PROMETHEUS_GATEWAY") {
            self.prometheus_gateway = Some(gateway);
        }
        if let Ok(api_key) = std::env::var("SENDGRID_API_KEY") {
            self.sendgrid_api_key = Some(api_key);
        }
        if let Ok(project) = std::env::var("GCP_PROJECT") {
            self.gcp_project = Some(project);
        }
        if let Ok(cluster) = std::env::var("GCP_CLUSTER") {
            self.gcp_cluster = Some(cluster);
        }
        if let Ok(region) = std::env::var("GCP_REGION") {
            self.gcp_region = Some(region);
        }
    }

    /// `true` when running inside a pod, detected the same way the
    /// in-cluster `kube::Config::incluster` path does
    pub fn in_cluster() -> bool {
        Path::new("/var/run/secrets/kubernetes.io/serviceaccount/token").exists()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            domain: default_domain(),
            version: default_api_version(),
            plural: default_plural(),
            prometheus_gateway: None,
            sendgrid_api_key: None,
            gcp_project: None,
            gcp_cluster: None,
            gcp_region: None,
            job_poll_interval_secs: default_job_poll_interval_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            healthz_port: default_healthz_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_with_no_file_falls_back_to_defaults() {
        let config = Config::load(Some("/nonexistent/path.yml")).unwrap();
        assert_eq!(config.domain, "crd.k8s.afrank.local");
        assert_eq!(config.job_poll_interval_secs, 5);
    }
}
