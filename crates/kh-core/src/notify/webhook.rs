//! Chat webhook delivery.

use super::{NotifyError, WebhookClient};
use kh_config::WebhookIdentity;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// JSON body posted to the webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub channel: String,
    pub username: String,
    pub text: String,
    pub icon_emoji: String,
}

impl WebhookPayload {
    pub fn new(identity: &WebhookIdentity, text: impl Into<String>) -> Self {
        Self {
            channel: identity.channel.clone(),
            username: identity.username.clone(),
            text: text.into(),
            icon_emoji: identity.icon_emoji.clone(),
        }
    }
}

/// Webhook client on `ureq`.
#[derive(Debug, Clone)]
pub struct UreqWebhookClient {
    agent: ureq::Agent,
}

impl UreqWebhookClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl WebhookClient for UreqWebhookClient {
    fn post(&self, url: &str, payload: &WebhookPayload) -> Result<u16, NotifyError> {
        match self.agent.post(url).send_json(payload) {
            Ok(response) => Ok(response.status()),
            Err(ureq::Error::Status(status, _)) => Err(NotifyError::HttpStatus { status }),
            Err(e) => Err(NotifyError::Transport(e.to_string())),
        }
    }
}
