//! Outbound transport for the Brevo-style transactional mail API
//! (`POST /v3/smtp/email`).

use async_trait::async_trait;
use keymint_common::config::MailerConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::traits::{MailTransport, OutgoingEmail};

pub struct BrevoMailer {
    cfg: MailerConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct Party<'a> {
    name: &'a str,
    email: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendEmailRequest<'a> {
    sender: Party<'a>,
    to: Vec<Party<'a>>,
    subject: &'a str,
    html_content: &'a str,
    tags: &'a [String],
    reply_to: Party<'a>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendEmailResponse {
    message_id: String,
}

impl BrevoMailer {
    pub fn new(cfg: MailerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .expect("Failed to build reqwest Client");
        Self { cfg, client }
    }
}

#[async_trait]
impl MailTransport for BrevoMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, EngineError> {
        let url = format!("{}/v3/smtp/email", self.cfg.base_url);
        let request = SendEmailRequest {
            sender: Party {
                name: &self.cfg.sender_name,
                email: &self.cfg.sender_email,
            },
            to: vec![Party {
                name: &email.to_name,
                email: &email.to_email,
            }],
            subject: &email.subject,
            html_content: &email.html_body,
            tags: &email.tags,
            reply_to: Party {
                name: &self.cfg.sender_name,
                email: &self.cfg.reply_to_email,
            },
        };

        let response = self
            .client
            .post(&url)
            .header("api-key", &self.cfg.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                EngineError::provider(format!("Mail API unreachable: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::provider(format!(
                "Mail API returned {status}: {body}"
            )));
        }

        let parsed: SendEmailResponse =
            response.json().await.map_err(|err| {
                EngineError::provider(format!(
                    "Mail API response was not JSON: {err}"
                ))
            })?;
        debug!(message_id = %parsed.message_id, "Email accepted by mail API");
        Ok(parsed.message_id)
    }
}
