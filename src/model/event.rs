//! The normalized notification the watcher hands to the handler

use std::collections::HashMap;

use crate::model::check_config::{
    parse_duration_value, synthesize_workload_spec, CheckConfig, CheckKey, EscalationSpec,
};
use crate::model::status::Status;

/// What kind of change a watch notification describes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    /// The watch stream itself errored; the watcher should resume from
    /// scratch (spec §4.2 "watch resumption")
    Error,
    /// A notification that could not be decoded into a `CheckConfig` -
    /// carried through rather than dropped so the handler can log it with
    /// full context instead of it silently vanishing.
    BadEvent,
}

/// A single normalized unit of work handed from the watcher to the handler.
/// `pre_status` carries whatever status subresource was already on the
/// object at the moment of notification, used to seed a freshly spawned
/// runner after a controller restart (spec §4.4).
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub key: CheckKey,
    pub config: Option<CheckConfig>,
    pub pre_status: Status,
    pub reason: Option<String>,
}

impl Event {
    pub fn added(key: CheckKey, config: CheckConfig, pre_status: Status) -> Self {
        Event {
            kind: EventKind::Added,
            key,
            config: Some(config),
            pre_status,
            reason: None,
        }
    }

    pub fn modified(key: CheckKey, config: CheckConfig, pre_status: Status) -> Self {
        Event {
            kind: EventKind::Modified,
            key,
            config: Some(config),
            pre_status,
            reason: None,
        }
    }

    pub fn deleted(key: CheckKey) -> Self {
        Event {
            kind: EventKind::Deleted,
            key,
            config: None,
            pre_status: Status::default(),
            reason: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Event {
            kind: EventKind::Error,
            key: CheckKey::new("", ""),
            config: None,
            pre_status: Status::default(),
            reason: Some(reason.into()),
        }
    }

    pub fn bad(key: CheckKey, reason: impl Into<String>) -> Self {
        Event {
            kind: EventKind::BadEvent,
            key,
            config: None,
            pre_status: Status::default(),
            reason: Some(reason.into()),
        }
    }

    /// Decode a `CheckConfig` plus its pre-existing `Status` out of a raw
    /// watched object's `spec`/`status` JSON, matching
    /// `mozalert/checkconfig.py::CheckConfig.from_spec`.
    pub fn decode(namespace: &str, name: &str, raw: &serde_json::Value) -> Result<(CheckConfig, Status), String> {
        let key = CheckKey::new(namespace, name);
        let spec = raw
            .get("spec")
            .ok_or_else(|| "object has no spec".to_owned())?;

        let check_interval = parse_duration_value(spec.get("check_interval"));
        let retry_interval = parse_duration_value(spec.get("retry_interval"));
        let notification_interval = parse_duration_value(spec.get("notification_interval"));
        let max_attempts = spec
            .get("max_attempts")
            .and_then(|v| v.as_u64())
            .unwrap_or(3) as u32;
        let timeout = parse_duration_value(spec.get("timeout"));

        let escalations = spec
            .get("escalations")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|e| decode_escalation(e))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let template_spec = spec.get("template").and_then(|t| t.get("spec")).cloned();
        let workload_spec = template_spec.unwrap_or_else(|| {
            synthesize_workload_spec(
                name,
                spec.get("image").and_then(|v| v.as_str()),
                spec.get("secret_ref").and_then(|v| v.as_str()),
                spec.get("check_cm").and_then(|v| v.as_str()),
                spec.get("check_url").and_then(|v| v.as_str()),
                &decode_args(spec.get("args")),
            )
        });

        let config = CheckConfig::new(
            key,
            check_interval,
            retry_interval,
            notification_interval,
            max_attempts,
            timeout,
            escalations,
            workload_spec,
        );

        let pre_status = raw
            .get("status")
            .map(Status::from_json)
            .unwrap_or_default();

        Ok((config, pre_status))
    }
}

/// Decode the `args` convenience field into a plain string vec, used when
/// synthesizing a workload spec from convenience fields rather than a full
/// `template.spec`.
fn decode_args(raw: Option<&serde_json::Value>) -> Vec<String> {
    raw.and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

fn decode_escalation(raw: &serde_json::Value) -> Option<EscalationSpec> {
    let kind = raw.get("type").and_then(|v| v.as_str())?.to_owned();
    let mut args = HashMap::new();
    if let Some(obj) = raw.get("args").and_then(|v| v.as_object()) {
        for (k, v) in obj {
            if let Some(s) = v.as_str() {
                args.insert(k.clone(), s.to_owned());
            } else {
                args.insert(k.clone(), v.to_string());
            }
        }
    }
    Some(EscalationSpec { kind, args })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_reads_intervals_and_escalations() {
        let raw = serde_json::json!({
            "spec": {
                "check_interval": "5m",
                "max_attempts": 2,
                "timeout": "30s",
                "escalations": [
                    {"type": "slack", "args": {"channel": "#alerts"}}
                ],
                "template": {"spec": {"containers": [{"name": "disk-space", "image": "checks/disk:latest"}]}},
            },
            "status": {"status": "OK", "attempt": 0},
        });

        let (config, pre_status) = Event::decode("default", "disk-space", &raw).unwrap();

        assert_eq!(config.check_interval, Duration::from_secs(300));
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.escalations.len(), 1);
        assert_eq!(config.escalations[0].kind, "slack");
        assert_eq!(pre_status.status.to_string(), "OK");
        assert_eq!(config.workload_spec["containers"][0]["image"], "checks/disk:latest");
    }

    #[test]
    fn decode_without_spec_errors() {
        let raw = serde_json::json!({});
        assert!(Event::decode("default", "x", &raw).is_err());
    }

    #[test]
    fn decode_defaults_missing_fields() {
        let raw = serde_json::json!({"spec": {}});
        let (config, _) = Event::decode("default", "x", &raw).unwrap();
        assert_eq!(config.max_attempts, 3);
        assert!(config.escalations.is_empty());
    }

    #[test]
    fn decode_prefers_full_template_over_convenience_fields() {
        let raw = serde_json::json!({
            "spec": {
                "image": "checks/ignored:latest",
                "template": {"spec": {"containers": [{"name": "x", "image": "checks/disk:latest"}]}},
            },
        });
        let (config, _) = Event::decode("default", "disk-space", &raw).unwrap();
        assert_eq!(config.workload_spec["containers"][0]["image"], "checks/disk:latest");
    }

    #[test]
    fn decode_synthesizes_workload_spec_from_convenience_fields() {
        let raw = serde_json::json!({
            "spec": {
                "image": "checks/disk:latest",
                "check_url": "http://example.com/check",
            },
        });
        let (config, _) = Event::decode("default", "disk-space", &raw).unwrap();
        assert_eq!(config.workload_spec["restartPolicy"], "Never");
        assert_eq!(config.workload_spec["containers"][0]["image"], "checks/disk:latest");
        assert_eq!(config.workload_spec["containers"][0]["args"][0], "http://example.com/check");
    }

    #[test]
    fn decode_timeout_uses_minutes_compact_form_like_other_intervals() {
        let raw = serde_json::json!({"spec": {"timeout": "2m"}});
        let (config, _) = Event::decode("default", "x", &raw).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(120));
    }
}
