use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::actuator::{ActuationContext, ActuationOutcome, Actuator};
use crate::config::{TriggerConfig, TriggerMethod};

/// Longest slice of a response body carried into a failure reason.
const MAX_REASON_BODY: usize = 256;

/// Calls a trigger endpoint and classifies the response.
pub struct HttpActuator {
    name: String,
    client: Client,
    config: TriggerConfig,
}

impl HttpActuator {
    pub fn new(name: &str, client: Client, config: TriggerConfig) -> Self {
        Self {
            name: name.to_string(),
            client,
            config,
        }
    }
}

#[async_trait]
impl Actuator for HttpActuator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn act(&self, context: &ActuationContext) -> ActuationOutcome {
        let url = render_url(&self.config.url, context);
        tracing::info!(
            actuator = %self.name,
            entity_id = %context.entity_id,
            attempt = context.attempt,
            method = ?self.config.method,
            url = %url,
            "Calling trigger endpoint"
        );

        let mut request = match self.config.method {
            TriggerMethod::Get => self.client.get(&url),
            TriggerMethod::Post => self.client.post(&url),
        }
        .timeout(Duration::from_secs(self.config.timeout_secs));

        if let Some(auth) = &self.config.basic_auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                tracing::warn!(actuator = %self.name, error = %e, "Trigger request did not complete");
                return ActuationOutcome::TransientFailure(e.to_string());
            }
            Err(e) => {
                tracing::error!(actuator = %self.name, error = %e, "Trigger request failed");
                return ActuationOutcome::HardFailure(e.to_string());
            }
        };

        let status = response.status().as_u16();
        tracing::info!(actuator = %self.name, status, "Trigger responded");

        if self.config.success_status.contains(&status) {
            return ActuationOutcome::Success;
        }

        let body = response.text().await.unwrap_or_default();
        classify_failure(&self.config, status, &body)
    }
}

/// Substitute `{entity_id}`, `{key}`, `{from}` and `{to}` with URL-encoded values.
pub fn render_url(template: &str, context: &ActuationContext) -> String {
    template
        .replace("{entity_id}", &urlencoding::encode(&context.entity_id))
        .replace("{key}", &urlencoding::encode(&context.key))
        .replace(
            "{from}",
            &urlencoding::encode(context.from.as_deref().unwrap_or_default()),
        )
        .replace(
            "{to}",
            &urlencoding::encode(context.to.as_deref().unwrap_or_default()),
        )
}

fn classify_failure(config: &TriggerConfig, status: u16, body: &str) -> ActuationOutcome {
    let snippet: String = body.chars().take(MAX_REASON_BODY).collect();
    let reason = format!("HTTP {status}: {}", snippet.trim());

    let transient = config.transient_status.contains(&status)
        || config
            .transient_markers
            .iter()
            .any(|marker| body.contains(marker.as_str()));

    if transient {
        ActuationOutcome::TransientFailure(reason)
    } else {
        ActuationOutcome::HardFailure(reason)
    }
}
