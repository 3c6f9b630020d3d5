//! services/api/src/adapters/fcm.rs
//!
//! Push notifications through Firebase Cloud Messaging. One multicast request per
//! recipient, addressed to every device token they registered.

use async_trait::async_trait;
use guardian_core::domain::{Severity, User};
use guardian_core::ports::{DeliveryError, Notification, NotificationChannel};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

const FCM_SEND_URL: &str = "https://fcm.googleapis.com/fcm/send";

#[derive(Serialize)]
struct MulticastRequest<'a> {
    registration_ids: &'a [String],
    priority: &'static str,
    notification: serde_json::Value,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct MulticastResponse {
    #[serde(default)]
    success: u32,
    #[serde(default)]
    failure: u32,
}

pub struct FcmPushChannel {
    http: Client,
    server_key: String,
}

impl FcmPushChannel {
    pub fn new(http: Client, server_key: String) -> Self {
        Self { http, server_key }
    }
}

fn payload<'a>(tokens: &'a [String], notification: &Notification) -> MulticastRequest<'a> {
    let priority = if notification.severity >= Severity::High {
        "high"
    } else {
        "normal"
    };
    MulticastRequest {
        registration_ids: tokens,
        priority,
        notification: json!({
            "title": notification.title,
            "body": notification.body,
        }),
        data: json!({
            "severity": notification.severity.as_str(),
            "journeyId": notification.journey_id,
            "audioUrl": notification.audio_url,
        }),
    }
}

#[async_trait]
impl NotificationChannel for FcmPushChannel {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn deliver(
        &self,
        recipient: &User,
        notification: &Notification,
    ) -> Result<(), DeliveryError> {
        if recipient.device_tokens.is_empty() {
            return Err(DeliveryError::NotConfigured(format!(
                "user {} has no device tokens",
                recipient.id
            )));
        }

        let response = self
            .http
            .post(FCM_SEND_URL)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&payload(&recipient.device_tokens, notification))
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(format!("fcm request error: {e}")))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(DeliveryError::Transport(format!("fcm returned {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(DeliveryError::Rejected(format!("fcm returned {}", status.as_u16())));
        }

        let outcome: MulticastResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Transport(format!("fcm response decode: {e}")))?;
        if outcome.success == 0 {
            return Err(DeliveryError::Rejected(format!(
                "all {} device tokens were refused",
                outcome.failure
            )));
        }
        if outcome.failure > 0 {
            warn!(
                "FCM refused {} of {} tokens for user {}",
                outcome.failure,
                recipient.device_tokens.len(),
                recipient.id
            );
        }
        debug!("Push delivered to user {}", recipient.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn payload_addresses_every_token() {
        let tokens = vec!["a".to_string(), "b".to_string()];
        let journey_id = Uuid::new_v4();
        let notification = Notification {
            title: "Safety alert".to_string(),
            body: "Low battery".to_string(),
            severity: Severity::Medium,
            journey_id: Some(journey_id),
            audio_url: None,
        };
        let value = serde_json::to_value(payload(&tokens, &notification)).unwrap();
        assert_eq!(value["registration_ids"], json!(["a", "b"]));
        assert_eq!(value["priority"], "normal");
        assert_eq!(value["data"]["journeyId"], json!(journey_id));
        assert_eq!(value["notification"]["title"], "Safety alert");
    }

    #[test]
    fn high_severity_is_sent_with_high_priority() {
        let notification = Notification {
            title: "SOS".to_string(),
            body: "Help".to_string(),
            severity: Severity::Critical,
            journey_id: None,
            audio_url: None,
        };
        let value = serde_json::to_value(payload(&[], &notification)).unwrap();
        assert_eq!(value["priority"], "high");
    }
}
