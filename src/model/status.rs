//! The status subresource of a check, and the enums it is built from

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The timestamp format the status subresource is read from and written to
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The outcome of the most recently completed attempt
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CheckStatus {
    #[default]
    Pending,
    Ok,
    Warn,
    Critical,
    Unknown,
}

impl CheckStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, CheckStatus::Ok)
    }

    pub fn is_critical(self) -> bool {
        matches!(self, CheckStatus::Critical)
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Critical => "CRITICAL",
            CheckStatus::Unknown => "UNKNOWN",
            CheckStatus::Pending => "PENDING",
        };
        write!(f, "{name}")
    }
}

impl FromStr for CheckStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OK" => Ok(CheckStatus::Ok),
            "WARN" => Ok(CheckStatus::Warn),
            "CRITICAL" => Ok(CheckStatus::Critical),
            "UNKNOWN" => Ok(CheckStatus::Unknown),
            "PENDING" => Ok(CheckStatus::Pending),
            other => Err(Error::new(format!("invalid check status '{other}'"))),
        }
    }
}

/// Whether an attempt is currently in-flight
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    Idle,
    Running,
    Unknown,
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CheckState::Idle => "IDLE",
            CheckState::Running => "RUNNING",
            CheckState::Unknown => "UNKNOWN",
        };
        write!(f, "{name}")
    }
}

impl FromStr for CheckState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IDLE" => Ok(CheckState::Idle),
            "RUNNING" => Ok(CheckState::Running),
            "UNKNOWN" => Ok(CheckState::Unknown),
            other => Err(Error::new(format!("invalid check state '{other}'"))),
        }
    }
}

/// The status subresource of a check, owned by exactly one `CheckRunner`
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    pub status: CheckStatus,
    pub state: CheckState,
    pub attempt: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub next_check: Option<DateTime<Utc>>,
    pub logs: String,
    pub telemetry: HashMap<String, f64>,
    pub message: String,
}

impl Default for Status {
    fn default() -> Self {
        Status {
            status: CheckStatus::Pending,
            state: CheckState::Idle,
            attempt: 0,
            last_check: None,
            next_check: None,
            logs: String::new(),
            telemetry: HashMap::new(),
            message: String::new(),
        }
    }
}

impl Status {
    pub fn is_running(&self) -> bool {
        matches!(self.state, CheckState::Running)
    }

    /// Parse a timestamp in the status subresource's naive `%Y-%m-%d %H:%M:%S`
    /// form, assumed UTC. Returns `Ok(None)` for a missing/empty/`"None"`
    /// field and an error for anything that parses as neither - callers treat
    /// a parse error as "leave the existing value alone" per the status
    /// subresource's historically naive (tz-less) serialization.
    pub fn parse_timestamp(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, Error> {
        match raw {
            None => Ok(None),
            Some(s) if s.is_empty() || s == "None" => Ok(None),
            Some(s) => {
                let naive = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)?;
                Ok(Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)))
            }
        }
    }

    fn format_timestamp(ts: Option<DateTime<Utc>>) -> String {
        match ts {
            Some(ts) => ts.format(TIMESTAMP_FORMAT).to_string(),
            None => "None".to_owned(),
        }
    }

    /// Parse a `Status` from the raw JSON `status` subresource of a watched
    /// object. Missing fields default, and an unparseable `last_check` or
    /// `next_check` is logged and left as `None` rather than aborting the
    /// whole parse.
    pub fn from_json(raw: &serde_json::Value) -> Status {
        let mut status = Status::default();
        if let Some(s) = raw.get("status").and_then(|v| v.as_str()) {
            if let Ok(parsed) = s.parse() {
                status.status = parsed;
            } else {
                tracing::warn!(value = s, "unrecognized status value, defaulting");
            }
        }
        if let Some(s) = raw.get("state").and_then(|v| v.as_str()) {
            if let Ok(parsed) = s.parse() {
                status.state = parsed;
            } else {
                tracing::warn!(value = s, "unrecognized state value, defaulting");
            }
        }
        if let Some(attempt) = raw.get("attempt") {
            status.attempt = match attempt {
                serde_json::Value::String(s) => s.parse().unwrap_or(0),
                serde_json::Value::Number(n) => n.as_u64().unwrap_or(0) as u32,
                _ => 0,
            };
        }
        match Status::parse_timestamp(raw.get("last_check").and_then(|v| v.as_str())) {
            Ok(ts) => status.last_check = ts,
            Err(err) => tracing::warn!(%err, "failed to parse last_check, leaving unset"),
        }
        match Status::parse_timestamp(raw.get("next_check").and_then(|v| v.as_str())) {
            Ok(ts) => status.next_check = ts,
            Err(err) => tracing::warn!(%err, "failed to parse next_check, leaving unset"),
        }
        if let Some(logs) = raw.get("logs").and_then(|v| v.as_str()) {
            status.logs = logs.to_owned();
        }
        if let Some(message) = raw.get("message").and_then(|v| v.as_str()) {
            status.message = message.to_owned();
        }
        if let Some(telemetry) = raw.get("telemetry").and_then(|v| v.as_object()) {
            for (key, value) in telemetry {
                if let Some(value) = value.as_f64().or_else(|| {
                    value
                        .as_str()
                        .and_then(|s| s.parse::<f64>().ok())
                }) {
                    status.telemetry.insert(key.clone(), value);
                }
            }
        }
        status
    }

    /// Build the JSON body used to patch the status subresource
    pub fn to_patch(&self) -> serde_json::Value {
        serde_json::json!({
            "status": {
                "status": self.status.to_string(),
                "state": self.state.to_string(),
                "attempt": self.attempt.to_string(),
                "last_check": Status::format_timestamp(self.last_check),
                "next_check": Status::format_timestamp(self.next_check),
                "logs": self.logs,
                "telemetry": self.telemetry,
                "message": self.message,
            }
        })
    }

    /// Seed this status from a previously-persisted `pre_status`, applying
    /// the attempt-decrement rule for a runner that was mid-flight when the
    /// controller last observed it (spec §4.4 "Seeding from pre_status").
    pub fn seed_from(&mut self, pre_status: &Status) {
        self.status = pre_status.status;
        self.state = pre_status.state;
        self.last_check = pre_status.last_check;
        self.next_check = pre_status.next_check;
        self.attempt = pre_status.attempt;
        self.logs = pre_status.logs.clone();
        self.telemetry = pre_status.telemetry.clone();
        self.message = pre_status.message.clone();
        if self.is_running() && self.attempt > 0 {
            self.attempt -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_patch_and_parse() {
        let mut status = Status::default();
        status.status = CheckStatus::Critical;
        status.state = CheckState::Idle;
        status.attempt = 2;
        status.last_check = Some(DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc));
        status.telemetry.insert("latency_ms".to_owned(), 12.5);

        let patch = status.to_patch();
        let parsed = Status::from_json(&patch["status"]);

        assert_eq!(parsed.status, CheckStatus::Critical);
        assert_eq!(parsed.attempt, 2);
        assert_eq!(parsed.last_check, status.last_check);
        assert_eq!(parsed.telemetry.get("latency_ms"), Some(&12.5));
    }

    #[test]
    fn unparseable_timestamp_is_left_unset_not_fatal() {
        let raw = serde_json::json!({"last_check": "not-a-timestamp"});
        let status = Status::from_json(&raw);
        assert_eq!(status.last_check, None);
    }

    #[test]
    fn seed_from_running_decrements_attempt() {
        let mut fresh = Status::default();
        let mut pre = Status::default();
        pre.state = CheckState::Running;
        pre.attempt = 2;

        fresh.seed_from(&pre);

        assert_eq!(fresh.attempt, 1);
        assert_eq!(fresh.state, CheckState::Running);
    }

    #[test]
    fn seed_from_running_with_zero_attempt_stays_zero() {
        let mut fresh = Status::default();
        let mut pre = Status::default();
        pre.state = CheckState::Running;
        pre.attempt = 0;

        fresh.seed_from(&pre);

        assert_eq!(fresh.attempt, 0);
    }
}
