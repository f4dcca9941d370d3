//! The `Check` custom resource definition

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, Patch, PatchParams},
    core::CustomResourceExt,
    runtime::{conditions, wait::await_condition},
    Client,
};
use kube_derive::CustomResource;
use schemars::JsonSchema;
use std::collections::HashMap;
use std::time::Duration as StdDuration;

use crate::Error;

pub const CRD_NAME: &str = "checks.crd.k8s.afrank.local";

/// Serde helper for the default check interval, in minutes
fn default_check_interval() -> String {
    "5".to_owned()
}

/// Serde helper for the default max attempts before escalation
fn default_max_attempts() -> u32 {
    3
}

/// A single escalation channel entry in a `Check`'s spec
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct EscalationSpecRaw {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

/// `Check` CRD spec: a recurring worker workload plus its retry/escalation
/// policy. Intervals are accepted either as a bare number of minutes or the
/// compact `[NNh][NNm][NNs]` form.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "crd.k8s.afrank.local",
    version = "v1",
    kind = "Check",
    namespaced,
    status = "CheckStatusRaw",
    doc = "Custom resource representing a recurring check and its escalation policy"
)]
pub struct CheckSpec {
    /// How often to run this check when it's passing
    #[serde(default = "default_check_interval")]
    pub check_interval: String,
    /// How often to retry this check while it's failing, before escalation.
    /// Defaults to `check_interval` when unset.
    #[serde(default)]
    pub retry_interval: String,
    /// How often to re-notify while escalated. Defaults to `check_interval`
    /// when unset.
    #[serde(default)]
    pub notification_interval: String,
    /// Number of consecutive failures before escalating
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Worker Job timeout - a duration string or numeric minutes, same
    /// format as `check_interval`/`retry_interval`/`notification_interval`
    #[serde(default)]
    pub timeout: String,
    /// Escalation channels to notify on sustained failure
    #[serde(default)]
    pub escalations: Vec<EscalationSpecRaw>,
    /// Container image to run for this check's worker
    pub image: Option<String>,
    /// Secret to pull into the worker container's environment
    pub secret_ref: Option<String>,
    /// ConfigMap mounted at `/checks` in the worker container
    pub check_cm: Option<String>,
    /// URL passed as the sole argument to the worker container
    pub check_url: Option<String>,
    /// Extra arguments passed to the worker container
    #[serde(default)]
    pub args: Vec<String>,
    /// A fully specified pod template spec, used verbatim instead of the
    /// convenience fields above when set
    pub workload_spec: Option<serde_json::Value>,
}

/// The status subresource written back by the controller
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct CheckStatusRaw {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub attempt: String,
    #[serde(default)]
    pub last_check: String,
    #[serde(default)]
    pub next_check: String,
    #[serde(default)]
    pub logs: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub telemetry: HashMap<String, f64>,
}

/// Create or update the `Check` CRD in the cluster, waiting for it to reach
/// the `Established` condition before returning.
pub async fn create_or_update(client: &Client) -> Result<(), Error> {
    let params = PatchParams::apply("check_controller_apply").force();
    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    crd_api
        .patch(CRD_NAME, &params, &Patch::Apply(Check::crd()))
        .await?;

    let established = await_condition(crd_api, CRD_NAME, conditions::is_crd_established());
    match tokio::time::timeout(StdDuration::from_secs(30), established).await {
        Ok(_) => {
            tracing::info!("Check CRD applied");
            Ok(())
        }
        Err(_) => Err(Error::new("timed out waiting for Check CRD to be established")),
    }
}
