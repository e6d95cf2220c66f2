use crate::traits::ChannelSender;
use crate::types::OutboundMessage;
use anyhow::{Result, anyhow};
use reqwest::Url;

#[derive(Clone)]
pub struct WhatsAppCloudSender {
    http: reqwest::Client,
    access_token: String,
    phone_number_id: String,
}

impl WhatsAppCloudSender {
    pub fn new(access_token: &str, phone_number_id: &str) -> Result<Self> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(anyhow!("whatsapp access token is required"));
        }
        let phone_number_id = phone_number_id.trim();
        if phone_number_id.is_empty() {
            return Err(anyhow!("whatsapp phone number id is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            access_token: access_token.to_string(),
            phone_number_id: phone_number_id.to_string(),
        })
    }

    fn messages_url(&self) -> Result<Url> {
        Url::parse(&format!(
            "https://graph.facebook.com/v20.0/{}/messages",
            self.phone_number_id
        ))
        .map_err(|e| anyhow!("invalid whatsapp graph API URL: {e}"))
    }

    /// The Graph API wants the bare E.164 number, not the `@c.us` suffix the
    /// webhook uses for chat identities.
    fn recipient_from_chat(chat: &str) -> &str {
        chat.split('@').next().unwrap_or(chat)
    }
}

#[async_trait::async_trait]
impl ChannelSender for WhatsAppCloudSender {
    fn channel_id(&self) -> &str {
        "whatsapp"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let to = Self::recipient_from_chat(message.conversation.chat.as_str());
        if to.trim().is_empty() {
            return Err(anyhow!("recipient phone number is required"));
        }
        let text = message.text.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let url = self.messages_url()?;
        let payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": {
                "preview_url": false,
                "body": text,
            }
        });

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "whatsapp send failed: status={} body={}",
                status,
                body
            ));
        }

        tracing::debug!(
            chat = %message.conversation.chat,
            job_id = ?message.job_id,
            "whatsapp message delivered"
        );
        Ok(())
    }
}
