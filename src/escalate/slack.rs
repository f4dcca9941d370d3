//! The slack escalator: posts a formatted attachment to an incoming webhook

use async_trait::async_trait;
use std::collections::HashMap;

use crate::escalate::Escalator;
use crate::model::{CheckConfig, CheckKey, Status};
use crate::Error;

pub struct SlackEscalator {
    client: reqwest::Client,
}

impl SlackEscalator {
    pub fn new() -> Self {
        SlackEscalator {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for SlackEscalator {
    fn default() -> Self {
        Self::new()
    }
}

fn color_for(status: &Status) -> &'static str {
    if status.status.is_ok() {
        "#36a64f"
    } else {
        "#ff0000"
    }
}

#[async_trait]
impl Escalator for SlackEscalator {
    async fn escalate(
        &self,
        key: &CheckKey,
        config: &CheckConfig,
        status: &Status,
        args: &HashMap<String, String>,
    ) -> Result<(), Error> {
        let webhook_url = args
            .get("webhook_url")
            .ok_or_else(|| Error::new("slack escalation missing webhook_url arg"))?;

        let mut fields = vec![
            serde_json::json!({"title": "Target", "value": key.to_string(), "short": false}),
            serde_json::json!({"title": "Status", "value": status.status.to_string(), "short": true}),
            serde_json::json!({"title": "Attempt", "value": format!("{}/{}", status.attempt, config.max_attempts), "short": true}),
        ];
        if let Some(deep_link) = args.get("deep_link") {
            fields.push(serde_json::json!({"title": "Details", "value": deep_link, "short": false}));
        }

        let body = serde_json::json!({
            "channel": args.get("channel"),
            "username": "check-controller",
            "icon_emoji": ":rotating_light:",
            "attachments": [{
                "mrkdwn_in": ["text"],
                "color": color_for(status),
                "fields": fields,
            }],
        });

        self.client
            .post(webhook_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
