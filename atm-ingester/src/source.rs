use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::SourceError;

/// The notification event type that signals a completed file write and
/// triggers the ingestion pipeline.
pub const FINALIZE_EVENT: &str = "OBJECT_FINALIZE";

/// One notification as delivered by the message source.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Raw message body, expected to be JSON describing the written file.
    pub data: Vec<u8>,
    /// Transport-level attributes; `eventType` selects the pipeline.
    pub attributes: HashMap<String, String>,
    /// Opaque token passed back on acknowledgment.
    pub ack_id: String,
}

impl Notification {
    pub fn event_type(&self) -> Option<&str> {
        self.attributes.get("eventType").map(String::as_str)
    }
}

/// Message source collaborator: a blocking-style batched pull plus a
/// batched acknowledgment call.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Pull up to `max_messages` notifications. A deadline-exceeded
    /// outcome surfaces as `SourceError::Timeout` and is retryable.
    async fn pull(&self, max_messages: i32) -> Result<Vec<Notification>, SourceError>;

    /// Acknowledge all tokens in one call. Stops redelivery of the
    /// corresponding notifications.
    async fn acknowledge(&self, ack_ids: Vec<String>) -> Result<(), SourceError>;
}

/// Content hash of a canonicalized message body, used as the dedup key.
/// serde_json keeps object keys sorted, so two bodies that differ only in
/// key order produce the same fingerprint.
pub fn fingerprint(body: &Value) -> String {
    let canonical = body.to_string();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

/// Pub/Sub-compatible REST adapter for `MessageSource`.
pub struct PubSubSource {
    client: reqwest::Client,
    pull_url: String,
    acknowledge_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    #[serde(default)]
    message: PubSubMessage,
}

#[derive(Deserialize, Default)]
struct PubSubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

impl PubSubSource {
    /// `pull_timeout` bounds the blocking pull server-side; the client
    /// allows a little slack on top before giving up itself.
    pub fn new(
        endpoint: &str,
        project_id: &str,
        subscription_id: &str,
        access_token: &str,
        pull_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if !access_token.is_empty() {
            let value = format!("Bearer {}", access_token)
                .parse()
                .map_err(|_| SourceError::Decode("access token is not a valid header".into()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("atm-ingester")
            .timeout(pull_timeout + Duration::from_secs(10))
            .build()?;

        let subscription = format!(
            "{}/v1/projects/{}/subscriptions/{}",
            endpoint.trim_end_matches('/'),
            project_id,
            subscription_id
        );

        Ok(Self {
            client,
            pull_url: format!("{subscription}:pull"),
            acknowledge_url: format!("{subscription}:acknowledge"),
        })
    }
}

#[async_trait]
impl MessageSource for PubSubSource {
    async fn pull(&self, max_messages: i32) -> Result<Vec<Notification>, SourceError> {
        let response = self
            .client
            .post(&self.pull_url)
            .json(&serde_json::json!({
                "maxMessages": max_messages,
                "returnImmediately": false,
            }))
            .send()
            .await
            .map_err(classify_transport)?;

        if response.status() == reqwest::StatusCode::GATEWAY_TIMEOUT {
            return Err(SourceError::Timeout);
        }
        let response = response.error_for_status().map_err(SourceError::Transport)?;

        let body: PullResponse = response.json().await.map_err(SourceError::Transport)?;

        let mut notifications = Vec::with_capacity(body.received_messages.len());
        for received in body.received_messages {
            let data = BASE64
                .decode(received.message.data.as_bytes())
                .map_err(|e| SourceError::Decode(format!("invalid base64 message data: {e}")))?;
            notifications.push(Notification {
                data,
                attributes: received.message.attributes,
                ack_id: received.ack_id,
            });
        }

        debug!(count = notifications.len(), "pulled notifications");
        Ok(notifications)
    }

    async fn acknowledge(&self, ack_ids: Vec<String>) -> Result<(), SourceError> {
        if ack_ids.is_empty() {
            return Ok(());
        }

        self.client
            .post(&self.acknowledge_url)
            .json(&serde_json::json!({ "ackIds": ack_ids }))
            .send()
            .await
            .map_err(classify_transport)?
            .error_for_status()
            .map_err(SourceError::Transport)?;

        Ok(())
    }
}

fn classify_transport(error: reqwest::Error) -> SourceError {
    if error.is_timeout() {
        SourceError::Timeout
    } else {
        SourceError::Transport(error)
    }
}
