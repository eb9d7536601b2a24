//! Voximplant bot service client: sends the feedback-request template message.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::json;
use tracing::{debug, warn};

use super::Notifier;
use super::mb_broker::parse_base_url;
use crate::error::FeedbackError;

const SERVICE: &str = "voximplant";
const SEND_TEMPLATE_PATH: &str = "api/v3/botService/sendTemplateMessage";
const DEFAULT_RATING: u8 = 5;

#[derive(Debug, Clone)]
pub struct VoximplantConfig {
    pub base_url: String,
    pub access_token: String,
    pub domain: String,
    pub message_template_id: String,
    pub channel_id: String,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct VoximplantClient {
    client: Client,
    endpoint: Url,
    access_token: String,
    domain: String,
    message_template_id: String,
    channel_id: String,
}

impl VoximplantClient {
    /// # Errors
    /// Fails when the base URL is invalid or the HTTP client cannot be built.
    pub fn new(config: VoximplantConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()
            .context("failed to build voximplant HTTP client")?;

        let endpoint = parse_base_url(&config.base_url)
            .and_then(|base| Ok(base.join(SEND_TEMPLATE_PATH)?))
            .context("invalid voximplant base URL")?;

        Ok(Self {
            client,
            endpoint,
            access_token: config.access_token,
            domain: config.domain,
            message_template_id: config.message_template_id,
            channel_id: config.channel_id,
        })
    }
}

/// Query string embedded in the template's rating button.
fn button_url_param(order_external_id: &str, product_code: &str) -> String {
    format!("orderCode={order_external_id}&productCode={product_code}&rating={DEFAULT_RATING}")
}

fn text_param_values(user_name: &str) -> Result<String> {
    serde_json::to_string_pretty(&json!({ "name2": user_name }))
        .context("failed to encode text_param_values")
}

#[async_trait]
impl Notifier for VoximplantClient {
    async fn send_notification(
        &self,
        order_external_id: &str,
        user_phone: &str,
        user_name: &str,
        product_code: &str,
    ) -> Result<()> {
        let button_url = button_url_param(order_external_id, product_code);
        let text_params = text_param_values(user_name)?;
        let form = [
            ("domain", self.domain.as_str()),
            ("client_id", user_phone),
            ("message_template_id", self.message_template_id.as_str()),
            ("channel_id", self.channel_id.as_str()),
            ("access_token", self.access_token.as_str()),
            ("header_param_value", user_name),
            ("button_url_param_value", button_url.as_str()),
            ("text_param_values", text_params.as_str()),
        ];

        let response = self
            .client
            .post(self.endpoint.clone())
            .form(&form)
            .send()
            .await
            .context("voximplant send request failed")?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!(
                %status,
                order_external_id,
                product_code,
                body = %body,
                "voximplant returned error status"
            );
            return Err(FeedbackError::BadStatusCode {
                service: SERVICE,
                status: status.as_u16(),
                body,
            }
            .into());
        }

        debug!(order_external_id, product_code, body = %body, "voximplant message accepted");
        Ok(())
    }
}
