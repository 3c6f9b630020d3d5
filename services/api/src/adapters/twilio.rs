//! services/api/src/adapters/twilio.rs
//!
//! SMS and voice-call channels backed by the Twilio REST API. Both implement the
//! `NotificationChannel` port from the core crate and share one HTTP client.

use crate::config::TwilioConfig;
use async_trait::async_trait;
use guardian_core::domain::{Severity, User};
use guardian_core::ports::{DeliveryError, Notification, NotificationChannel};
use reqwest::{Client, StatusCode};
use tracing::debug;

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

//=========================================================================================
// Shared Client
//=========================================================================================

/// Credentials plus the HTTP client used by both Twilio channels.
#[derive(Clone)]
pub struct TwilioClient {
    http: Client,
    config: TwilioConfig,
    base_url: String,
}

impl TwilioClient {
    pub fn new(http: Client, config: TwilioConfig) -> Self {
        Self {
            http,
            config,
            base_url: TWILIO_API_BASE.to_string(),
        }
    }

    fn resource_url(&self, resource: &str) -> String {
        format!(
            "{}/Accounts/{}/{}.json",
            self.base_url, self.config.account_sid, resource
        )
    }

    async fn post_form(&self, resource: &str, form: &[(&str, &str)]) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(self.resource_url(resource))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(form)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(format!("twilio request error: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(map_http_error(status, &body))
    }
}

/// 429 and 5xx are worth retrying; any other refusal is final.
fn map_http_error(status: StatusCode, body: &str) -> DeliveryError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        DeliveryError::Transport(format!("twilio returned {}: {}", status.as_u16(), body))
    } else {
        DeliveryError::Rejected(format!("twilio returned {}: {}", status.as_u16(), body))
    }
}

fn recipient_phone(recipient: &User) -> Result<&str, DeliveryError> {
    recipient
        .phone
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| DeliveryError::NotConfigured(format!("user {} has no phone", recipient.id)))
}

//=========================================================================================
// SMS
//=========================================================================================

pub struct TwilioSmsChannel {
    client: TwilioClient,
}

impl TwilioSmsChannel {
    pub fn new(client: TwilioClient) -> Self {
        Self { client }
    }
}

fn sms_body(notification: &Notification) -> String {
    match &notification.audio_url {
        Some(url) => format!("{}: {}\nRecording: {}", notification.title, notification.body, url),
        None => format!("{}: {}", notification.title, notification.body),
    }
}

#[async_trait]
impl NotificationChannel for TwilioSmsChannel {
    fn name(&self) -> &'static str {
        "sms"
    }

    async fn deliver(
        &self,
        recipient: &User,
        notification: &Notification,
    ) -> Result<(), DeliveryError> {
        let to = recipient_phone(recipient)?;
        let body = sms_body(notification);
        debug!("Sending SMS to user {}", recipient.id);
        self.client
            .post_form(
                "Messages",
                &[
                    ("To", to),
                    ("From", self.client.config.from_number.as_str()),
                    ("Body", body.as_str()),
                ],
            )
            .await
    }
}

//=========================================================================================
// Voice
//=========================================================================================

/// Places a call that reads the notification aloud. Reserved for critical events.
pub struct TwilioVoiceChannel {
    client: TwilioClient,
}

impl TwilioVoiceChannel {
    pub fn new(client: TwilioClient) -> Self {
        Self { client }
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn twiml(notification: &Notification) -> String {
    let mut speech = format!(
        "<Say voice=\"alice\">{}. {}</Say>",
        escape_xml(&notification.title),
        escape_xml(&notification.body)
    );
    if let Some(url) = &notification.audio_url {
        speech.push_str(&format!("<Play>{}</Play>", escape_xml(url)));
    }
    format!("<Response>{}</Response>", speech)
}

#[async_trait]
impl NotificationChannel for TwilioVoiceChannel {
    fn name(&self) -> &'static str {
        "voice"
    }

    fn accepts(&self, notification: &Notification) -> bool {
        notification.severity == Severity::Critical
    }

    async fn deliver(
        &self,
        recipient: &User,
        notification: &Notification,
    ) -> Result<(), DeliveryError> {
        let to = recipient_phone(recipient)?;
        let twiml = twiml(notification);
        debug!("Placing voice call to user {}", recipient.id);
        self.client
            .post_form(
                "Calls",
                &[
                    ("To", to),
                    ("From", self.client.config.from_number.as_str()),
                    ("Twiml", twiml.as_str()),
                ],
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_core::domain::Role;
    use uuid::Uuid;

    fn notification(severity: Severity) -> Notification {
        Notification {
            title: "SOS from Ada".to_string(),
            body: "Needs help <now> & fast".to_string(),
            severity,
            journey_id: None,
            audio_url: None,
        }
    }

    fn client() -> TwilioClient {
        TwilioClient::new(
            Client::new(),
            TwilioConfig {
                account_sid: "AC123".to_string(),
                auth_token: "secret".to_string(),
                from_number: "+15550001111".to_string(),
            },
        )
    }

    #[test]
    fn twiml_escapes_markup() {
        let xml = twiml(&notification(Severity::Critical));
        assert!(xml.starts_with("<Response><Say"));
        assert!(xml.contains("&lt;now&gt; &amp; fast"));
        assert!(!xml.contains("<now>"));
    }

    #[test]
    fn voice_only_accepts_critical() {
        let voice = TwilioVoiceChannel::new(client());
        assert!(voice.accepts(&notification(Severity::Critical)));
        assert!(!voice.accepts(&notification(Severity::High)));
    }

    #[test]
    fn resource_urls_are_scoped_to_the_account() {
        assert_eq!(
            client().resource_url("Messages"),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Messages.json"
        );
    }

    #[test]
    fn server_errors_are_transient_and_client_errors_are_not() {
        assert!(map_http_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(map_http_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!map_http_error(StatusCode::BAD_REQUEST, "invalid 'To'").is_transient());
    }

    #[tokio::test]
    async fn missing_phone_is_not_configured() {
        let sms = TwilioSmsChannel::new(client());
        let user = User {
            id: Uuid::new_v4(),
            name: None,
            phone: None,
            role: Role::Parent,
            relations: vec![],
            last_location: None,
            device_tokens: vec![],
        };
        let err = sms
            .deliver(&user, &notification(Severity::High))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::NotConfigured(_)));
    }
}
