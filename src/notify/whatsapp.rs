use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use super::NotificationDispatcher;
use crate::error::NotifyError;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:3000/send-message";

/// Characters of a rejection body kept for the error
const BODY_EXCERPT: usize = 400;

/// Client for the WhatsApp gateway's `POST /send-message`
#[derive(Debug, Clone)]
pub struct WhatsAppNotifier {
    client: Client,
    endpoint: String,
}

impl WhatsAppNotifier {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl NotificationDispatcher for WhatsAppNotifier {
    async fn send(&self, message: &str, destination: &str) -> Result<(), NotifyError> {
        debug!("Posting {} chars to {}", message.len(), self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "jid": destination, "message": message }))
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(BODY_EXCERPT).collect(),
            });
        }

        info!("📤 Message sent to {}", destination);
        Ok(())
    }
}
