//! WhatsApp notifications via the Twilio Messages API
//!
//! Messages are sent as pre-approved content templates:
//! `POST {api_base}/2010-04-01/Accounts/{sid}/Messages.json` with form fields
//! `From`, `To`, `ContentSid` and, when the event carries data,
//! `ContentVariables` (a JSON object keyed by placeholder number).

use crate::infra::config::Config;
use crate::services::notifier::{NotifierClient, NotifyError};
use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

const WHATSAPP_PREFIX: &str = "whatsapp:";

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: String,
}

/// Address a phone number on the WhatsApp channel
pub fn whatsapp_address(number: &str) -> String {
    if number.starts_with(WHATSAPP_PREFIX) {
        number.to_string()
    } else {
        format!("{WHATSAPP_PREFIX}{number}")
    }
}

pub struct TwilioNotifier {
    client: reqwest::Client,
    messages_url: String,
    authorization: String,
    from: String,
}

impl TwilioNotifier {
    pub fn new(
        api_base: &str,
        account_sid: &str,
        auth_token: &str,
        from: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let credentials = format!("{}:{}", account_sid, auth_token);
        let authorization = format!("Basic {}", STANDARD.encode(credentials.as_bytes()));

        Ok(Self {
            client,
            messages_url: format!(
                "{}/2010-04-01/Accounts/{}/Messages.json",
                api_base.trim_end_matches('/'),
                account_sid
            ),
            authorization,
            from: whatsapp_address(from),
        })
    }

    /// Build from the `[notify]` section; credentials are required
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let sid = config
            .notify_account_sid()
            .context("notify.account_sid (or TWILIO_ACCOUNT_SID) is required")?;
        let token = config
            .notify_auth_token()
            .context("notify.auth_token (or TWILIO_AUTH_TOKEN) is required")?;
        if config.notify_from().is_empty() || config.notify_to().is_empty() {
            anyhow::bail!("notify.from and notify.to are required when notifications are enabled");
        }
        Self::new(config.notify_api_base(), sid, token, config.notify_from(), config.notify_timeout())
    }

    pub fn messages_url(&self) -> &str {
        &self.messages_url
    }

    fn form_fields(
        &self,
        template_id: &str,
        recipient: &str,
        variables: &BTreeMap<String, String>,
    ) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("From", self.from.clone()),
            ("To", whatsapp_address(recipient)),
            ("ContentSid", template_id.to_string()),
        ];
        if !variables.is_empty() {
            // BTreeMap<String, String> always serializes
            if let Ok(json) = serde_json::to_string(variables) {
                form.push(("ContentVariables", json));
            }
        }
        form
    }
}

#[async_trait]
impl NotifierClient for TwilioNotifier {
    async fn send(
        &self,
        template_id: &str,
        recipient: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<String, NotifyError> {
        let form = self.form_fields(template_id, recipient, variables);

        let response = self
            .client
            .post(&self.messages_url)
            .header("Authorization", &self.authorization)
            .form(&form)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| NotifyError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(NotifyError::Rejected { status: status.as_u16(), body });
        }

        match serde_json::from_str::<MessageResource>(&body) {
            Ok(message) => Ok(message.sid),
            Err(_) => Ok(String::from("unknown")),
        }
    }
}
