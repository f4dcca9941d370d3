//! Normalized, immutable check configuration extracted from a resource

use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

/// The minimum interval the controller will ever schedule a check at,
/// regardless of what a zero/absent interval in the resource requests
/// (spec §8 boundary behavior: `check_interval = 0` => 1s minimum).
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// The globally unique identity of a check: the `namespace/name` pair
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckKey {
    pub namespace: String,
    pub name: String,
}

impl CheckKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        CheckKey {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CheckKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A single configured escalation channel: a `type` plus its args
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

/// Normalized, immutable check configuration. Equality is structural over
/// every field and is the sole signal the handler uses to tell a user edit
/// from a status-induced echo (spec §4.7/§8).
#[derive(Clone, Debug, PartialEq)]
pub struct CheckConfig {
    pub key: CheckKey,
    pub check_interval: Duration,
    pub retry_interval: Duration,
    pub notification_interval: Duration,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub escalations: Vec<EscalationSpec>,
    /// Opaque blob describing the ephemeral worker workload to launch. The
    /// core never inspects this; it exists purely to flow from the watched
    /// resource to the `ClusterClient` that creates the Job.
    pub workload_spec: serde_json::Value,
}

impl CheckConfig {
    /// Build a normalized `CheckConfig`, applying the zero-inherits-from
    /// defaults from spec §3 and the 1s floor from spec §8.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: CheckKey,
        check_interval: Duration,
        retry_interval: Duration,
        notification_interval: Duration,
        max_attempts: u32,
        timeout: Duration,
        escalations: Vec<EscalationSpec>,
        workload_spec: serde_json::Value,
    ) -> Self {
        let check_interval = if check_interval.is_zero() {
            MIN_INTERVAL
        } else {
            check_interval
        };
        let retry_interval = if retry_interval.is_zero() {
            check_interval
        } else {
            retry_interval
        };
        let notification_interval = if notification_interval.is_zero() {
            check_interval
        } else {
            notification_interval
        };
        CheckConfig {
            key,
            check_interval,
            retry_interval,
            notification_interval,
            max_attempts: max_attempts.max(1),
            timeout,
            escalations,
            workload_spec,
        }
    }
}

/// Parse a duration field that is either a bare number (interpreted as
/// minutes) or a compact `[NNh][NNm][NNs]` string. Unparseable input is not
/// an error - it resolves to zero, matching `mozalert/event.py::parse_time`.
pub fn parse_duration(raw: &str) -> Duration {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Duration::ZERO;
    }
    if let Ok(minutes) = trimmed.parse::<f64>() {
        if minutes.is_finite() && minutes >= 0.0 {
            return Duration::from_secs_f64(minutes * 60.0);
        }
    }
    compact_duration_regex()
        .captures(trimmed)
        .map(|caps| {
            let hours: u64 = caps
                .name("hours")
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            let minutes: u64 = caps
                .name("minutes")
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            let seconds: u64 = caps
                .name("seconds")
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            Duration::from_secs(hours * 3600 + minutes * 60 + seconds)
        })
        .unwrap_or(Duration::ZERO)
}

fn compact_duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:(?P<hours>\d+)h)?(?:(?P<minutes>\d+)m)?(?:(?P<seconds>\d+)s)?$")
            .expect("compact duration regex is valid")
    })
}

/// Parse a duration field from whatever JSON shape the resource carried it
/// in - a bare number (minutes) or a string (either a bare number of
/// minutes or the compact form).
pub fn parse_duration_value(raw: Option<&serde_json::Value>) -> Duration {
    match raw {
        None => Duration::ZERO,
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .map(|minutes| Duration::from_secs_f64(minutes * 60.0))
            .unwrap_or(Duration::ZERO),
        Some(serde_json::Value::String(s)) => parse_duration(s),
        Some(_) => Duration::ZERO,
    }
}

/// Synthesize a single-container `spec.template.spec`-shaped pod spec from
/// the convenience fields (`image`, `secret_ref`, `check_cm`, `check_url`,
/// `args`), matching `mozalert/checkconfig.py::build_pod_spec`.
pub fn synthesize_workload_spec(
    name: &str,
    image: Option<&str>,
    secret_ref: Option<&str>,
    check_cm: Option<&str>,
    check_url: Option<&str>,
    args: &[String],
) -> serde_json::Value {
    let mut container = serde_json::json!({
        "name": name,
        "image": image.unwrap_or_default(),
    });
    if let Some(secret_ref) = secret_ref {
        container["envFrom"] = serde_json::json!([{"secretRef": {"name": secret_ref}}]);
    }
    if check_cm.is_some() {
        container["volumeMounts"] = serde_json::json!([
            {"name": "checks", "mountPath": "/checks", "readOnly": true}
        ]);
    }
    if let Some(check_url) = check_url {
        container["args"] = serde_json::json!([check_url]);
    } else if !args.is_empty() {
        container["args"] = serde_json::json!(args);
    }

    let mut template = serde_json::json!({
        "restartPolicy": "Never",
        "containers": [container],
    });
    if let Some(check_cm) = check_cm {
        template["volumes"] = serde_json::json!([
            {"name": "checks", "configMap": {"name": check_cm}}
        ]);
    }
    template
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_handles_bare_minutes() {
        assert_eq!(parse_duration("5"), Duration::from_secs(300));
        assert_eq!(parse_duration("0.5"), Duration::from_secs(30));
    }

    #[test]
    fn parse_duration_handles_compact_form() {
        assert_eq!(parse_duration("90s"), Duration::from_secs(90));
        assert_eq!(parse_duration("1h30m"), Duration::from_secs(5400));
        assert_eq!(parse_duration("2h5m10s"), Duration::from_secs(2 * 3600 + 5 * 60 + 10));
    }

    #[test]
    fn parse_duration_garbage_is_zero_not_an_error() {
        assert_eq!(parse_duration("banana"), Duration::ZERO);
        assert_eq!(parse_duration(""), Duration::ZERO);
    }

    #[test]
    fn new_inherits_zero_intervals_from_check_interval() {
        let cfg = CheckConfig::new(
            CheckKey::new("default", "disk-space"),
            Duration::from_secs(60),
            Duration::ZERO,
            Duration::ZERO,
            3,
            Duration::ZERO,
            vec![],
            serde_json::json!({}),
        );
        assert_eq!(cfg.retry_interval, Duration::from_secs(60));
        assert_eq!(cfg.notification_interval, Duration::from_secs(60));
    }

    #[test]
    fn new_floors_zero_check_interval_to_one_second() {
        let cfg = CheckConfig::new(
            CheckKey::new("default", "disk-space"),
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            3,
            Duration::ZERO,
            vec![],
            serde_json::json!({}),
        );
        assert_eq!(cfg.check_interval, MIN_INTERVAL);
        assert_eq!(cfg.retry_interval, MIN_INTERVAL);
    }

    #[test]
    fn structural_equality_ignores_nothing() {
        let base = CheckConfig::new(
            CheckKey::new("default", "disk-space"),
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(60),
            3,
            Duration::ZERO,
            vec![],
            serde_json::json!({"image": "a"}),
        );
        let mut changed = base.clone();
        changed.workload_spec = serde_json::json!({"image": "b"});
        assert_ne!(base, changed);
        assert_eq!(base, base.clone());
    }

    #[test]
    fn synthesize_workload_spec_builds_single_container_template() {
        let spec = synthesize_workload_spec(
            "disk-space",
            Some("checks/disk:latest"),
            None,
            None,
            Some("http://example.com/check"),
            &[],
        );
        assert_eq!(spec["restartPolicy"], "Never");
        assert_eq!(spec["containers"][0]["image"], "checks/disk:latest");
        assert_eq!(spec["containers"][0]["args"][0], "http://example.com/check");
    }
}
