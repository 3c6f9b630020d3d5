//! crates/guardian_core/src/fanout.rs
//!
//! Delivers one event to every interested party: live subscribers through the
//! `SessionRegistry`, and each recipient parent through every configured
//! `NotificationChannel`.
//!
//! Dispatch never fails. Each recipient is attempted independently (concurrently),
//! each attempt is bounded by a timeout and transient failures are retried with
//! backoff. The outcome comes back as a `DeliveryReport` whose entries become the
//! owning record's `notifiedParents` audit trail.

use crate::domain::{
    Checkpoint, CheckpointStatus, EmergencyAction, Journey, LocationUpdate, ParentNotification,
    SafetyAlert, Severity, TimedPoint, User,
};
use crate::ports::{DatabaseService, DeliveryError, Notification, NotificationChannel};
use crate::retry::RetryPolicy;
use crate::session::{Channel, LiveEvent, SessionRegistry};
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Something that happened to a journey (or to a user outside any journey).
#[derive(Debug, Clone)]
pub enum FanoutEvent {
    JourneyStarted,
    JourneyCompleted,
    JourneyCancelled,
    Checkpoint(Checkpoint),
    Alert(SafetyAlert),
    AlertResolved(SafetyAlert),
    Emergency(EmergencyAction),
    Location { update: LocationUpdate, progress: f64 },
    UserLocation(TimedPoint),
}

impl FanoutEvent {
    fn kind(&self) -> &'static str {
        match self {
            FanoutEvent::JourneyStarted => "journey_started",
            FanoutEvent::JourneyCompleted => "journey_completed",
            FanoutEvent::JourneyCancelled => "journey_cancelled",
            FanoutEvent::Checkpoint(_) => "checkpoint",
            FanoutEvent::Alert(_) => "safety_alert",
            FanoutEvent::AlertResolved(_) => "alert_resolved",
            FanoutEvent::Emergency(_) => "emergency",
            FanoutEvent::Location { .. } | FanoutEvent::UserLocation(_) => "location",
        }
    }

    fn live_event(&self, owner_id: Uuid, journey: Option<&Journey>) -> LiveEvent {
        match self {
            FanoutEvent::JourneyStarted => LiveEvent::new(
                "journey:update",
                json!({ "type": self.kind(), "journey": journey, "message": "Journey started" }),
            ),
            FanoutEvent::JourneyCompleted => LiveEvent::new(
                "journey:update",
                json!({ "type": self.kind(), "journey": journey, "message": "Journey completed" }),
            ),
            FanoutEvent::JourneyCancelled => LiveEvent::new(
                "journey:update",
                json!({ "type": self.kind(), "journey": journey, "message": "Journey cancelled" }),
            ),
            FanoutEvent::Checkpoint(checkpoint) => LiveEvent::new(
                "journey:update",
                json!({
                    "type": self.kind(),
                    "journey": journey,
                    "checkpoint": checkpoint,
                    "message": format!("Checkpoint: {}", checkpoint.status.as_str()),
                }),
            ),
            FanoutEvent::Alert(alert) => LiveEvent::new(
                "safety:alert",
                json!({ "type": alert.alert_type, "alert": alert, "journey": journey }),
            ),
            FanoutEvent::AlertResolved(alert) => LiveEvent::new(
                "safety:alert",
                json!({ "type": self.kind(), "alert": alert, "journey": journey }),
            ),
            FanoutEvent::Emergency(action) => LiveEvent::new(
                "sos:alert",
                json!({ "userId": owner_id, "sos": action, "journey": journey }),
            ),
            FanoutEvent::Location { update, progress } => LiveEvent::new(
                "location:update",
                json!({ "userId": owner_id, "update": update, "progress": progress }),
            ),
            FanoutEvent::UserLocation(location) => LiveEvent::new(
                "location:update",
                json!({ "userId": owner_id, "location": location }),
            ),
        }
    }

    /// The durable notification for this event, or `None` for live-only events.
    fn notification(&self, journey: Option<&Journey>, owner: Option<&User>) -> Option<Notification> {
        let who = owner
            .map(User::display_name)
            .unwrap_or_else(|| "Your contact".to_string());
        let journey_id = journey.map(|j| j.id);
        let destination = journey
            .and_then(|j| j.destination.address.clone())
            .unwrap_or_else(|| "their destination".to_string());

        let (title, body, severity, audio_url) = match self {
            FanoutEvent::JourneyStarted => (
                "Journey Started".to_string(),
                format!("{} started a journey to {}", who, destination),
                Severity::Low,
                None,
            ),
            FanoutEvent::JourneyCancelled => (
                "Journey Cancelled".to_string(),
                format!("{} cancelled the journey to {}", who, destination),
                Severity::Low,
                None,
            ),
            FanoutEvent::Checkpoint(checkpoint) => {
                let severity = match checkpoint.status {
                    CheckpointStatus::Safe => Severity::Low,
                    CheckpointStatus::Unsafe => Severity::High,
                    CheckpointStatus::NoResponse => Severity::Critical,
                };
                (
                    format!("Checkpoint: {}", checkpoint.status.as_str().replace('_', " ")),
                    format!(
                        "{} checkpoint at {}",
                        who,
                        maps_link(checkpoint.location.lat, checkpoint.location.lng)
                    ),
                    severity,
                    checkpoint.audio_url.clone(),
                )
            }
            FanoutEvent::Alert(alert) => (
                format!("Safety Alert: {}", alert.alert_type.as_str().replace('_', " ")),
                format!("{}: {}", who, alert.message),
                alert.severity,
                None,
            ),
            FanoutEvent::Emergency(action) => {
                let mut body = format!(
                    "Emergency {} from {} at {}",
                    action.action.as_str().replace('_', " "),
                    who,
                    maps_link(action.location.lat, action.location.lng)
                );
                if let Some(message) = action.message.as_deref().filter(|m| !m.is_empty()) {
                    body.push_str(&format!(". Msg: {}", message));
                }
                (
                    "Emergency Alert".to_string(),
                    body,
                    action.action.severity(),
                    action.audio_url.clone(),
                )
            }
            // A completed journey is announced offline by its safe_arrival alert.
            FanoutEvent::JourneyCompleted
            | FanoutEvent::AlertResolved(_)
            | FanoutEvent::Location { .. }
            | FanoutEvent::UserLocation(_) => return None,
        };

        Some(Notification {
            title,
            body,
            severity,
            journey_id,
            audio_url,
        })
    }
}

fn maps_link(lat: f64, lng: f64) -> String {
    format!("https://www.google.com/maps?q={},{}", lat, lng)
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    /// Live connections reached.
    pub live_deliveries: usize,
    /// One entry per attempted recipient, delivered or not.
    pub recipients: Vec<ParentNotification>,
}

impl DeliveryReport {
    pub fn delivered_count(&self) -> usize {
        self.recipients.iter().filter(|r| r.delivered).count()
    }

    pub fn failed_count(&self) -> usize {
        self.recipients.len() - self.delivered_count()
    }
}

/// Recipients of a journey's events: its explicit share list, falling back to the
/// owner's persisted parent relations.
pub fn resolve_recipients(journey: Option<&Journey>, owner: Option<&User>) -> Vec<Uuid> {
    match journey {
        Some(j) if !j.shared_with_parents.is_empty() => j.shared_with_parents.clone(),
        _ => owner.map(|u| u.relations.clone()).unwrap_or_default(),
    }
}

pub struct AlertFanoutDispatcher {
    db: Arc<dyn DatabaseService>,
    sessions: SessionRegistry,
    channels: Vec<Arc<dyn NotificationChannel>>,
    attempt_timeout: Duration,
    retry: RetryPolicy,
}

impl AlertFanoutDispatcher {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        sessions: SessionRegistry,
        channels: Vec<Arc<dyn NotificationChannel>>,
    ) -> Self {
        Self {
            db,
            sessions,
            channels,
            attempt_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub async fn dispatch(&self, journey: &Journey, event: FanoutEvent) -> DeliveryReport {
        self.fan_out(journey.user_id, Some(journey), event).await
    }

    /// Dispatch for events that are not tied to a journey (standalone SOS, location
    /// outside a journey). Recipients are the user's parent relations.
    pub async fn dispatch_for_user(&self, user_id: Uuid, event: FanoutEvent) -> DeliveryReport {
        self.fan_out(user_id, None, event).await
    }

    /// Live delivery only. Used when the durable notification for the same incident
    /// goes out through another event.
    pub async fn publish_live(&self, journey: &Journey, event: FanoutEvent) -> usize {
        let owner = self.load_owner(journey.user_id).await;
        let recipient_ids = resolve_recipients(Some(journey), owner.as_ref());
        self.publish(journey.user_id, Some(journey), &recipient_ids, &event).await
    }

    async fn load_owner(&self, owner_id: Uuid) -> Option<User> {
        match self.db.get_user(owner_id).await {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(user_id = %owner_id, error = %e, "could not load event owner for fanout");
                None
            }
        }
    }

    async fn publish(
        &self,
        owner_id: Uuid,
        journey: Option<&Journey>,
        recipient_ids: &[Uuid],
        event: &FanoutEvent,
    ) -> usize {
        let mut channels = vec![Channel::ParentsOf(owner_id)];
        if let Some(j) = journey {
            channels.push(Channel::Journey(j.id));
        }
        channels.extend(recipient_ids.iter().map(|id| Channel::User(*id)));
        self.sessions
            .publish_many(&channels, event.live_event(owner_id, journey))
            .await
    }

    async fn fan_out(
        &self,
        owner_id: Uuid,
        journey: Option<&Journey>,
        event: FanoutEvent,
    ) -> DeliveryReport {
        let owner = self.load_owner(owner_id).await;
        let recipient_ids = resolve_recipients(journey, owner.as_ref());

        // --- 1. Live delivery ---
        let live_deliveries = self.publish(owner_id, journey, &recipient_ids, &event).await;

        let mut report = DeliveryReport {
            live_deliveries,
            recipients: Vec::new(),
        };

        // --- 2. Durable delivery ---
        let Some(notification) = event.notification(journey, owner.as_ref()) else {
            return report;
        };
        if recipient_ids.is_empty() {
            debug!(user_id = %owner_id, event = event.kind(), "no recipients to notify");
            return report;
        }

        let recipients = match self.db.get_users(&recipient_ids).await {
            Ok(users) => users,
            Err(e) => {
                warn!(user_id = %owner_id, error = %e, "could not load recipients; recording as undelivered");
                Vec::new()
            }
        };

        let attempts = recipients
            .iter()
            .map(|recipient| self.notify_recipient(recipient, &notification));
        report.recipients = join_all(attempts).await;

        // Recipients that could not be loaded still belong in the audit trail.
        for id in &recipient_ids {
            if !report.recipients.iter().any(|r| r.parent == *id) {
                report.recipients.push(undelivered(*id));
            }
        }

        info!(
            user_id = %owner_id,
            journey_id = ?journey.map(|j| j.id),
            event = event.kind(),
            live = report.live_deliveries,
            delivered = report.delivered_count(),
            failed = report.failed_count(),
            "fanout finished"
        );
        report
    }

    async fn notify_recipient(
        &self,
        recipient: &User,
        notification: &Notification,
    ) -> ParentNotification {
        let mut delivered_via = Vec::new();
        for channel in self.channels.iter().filter(|c| c.accepts(notification)) {
            match self.deliver_with_retry(channel.as_ref(), recipient, notification).await {
                Ok(()) => delivered_via.push(channel.name().to_string()),
                Err(e) => warn!(
                    parent = %recipient.id,
                    channel = channel.name(),
                    error = %e,
                    "notification delivery failed"
                ),
            }
        }
        ParentNotification {
            parent: recipient.id,
            notified_at: Utc::now(),
            delivered: !delivered_via.is_empty(),
            channels: delivered_via,
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    async fn deliver_with_retry(
        &self,
        channel: &dyn NotificationChannel,
        recipient: &User,
        notification: &Notification,
    ) -> Result<(), DeliveryError> {
        let mut attempt = 0;
        loop {
            let delay = self.retry.next_delay(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result =
                match tokio::time::timeout(self.attempt_timeout, channel.deliver(recipient, notification))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(DeliveryError::TimedOut(self.attempt_timeout)),
                };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    debug!(
                        parent = %recipient.id,
                        channel = channel.name(),
                        attempt,
                        error = %e,
                        "transient delivery failure; retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn undelivered(parent: Uuid) -> ParentNotification {
    ParentNotification {
        parent,
        notified_at: Utc::now(),
        delivered: false,
        channels: Vec::new(),
        acknowledged: false,
        acknowledged_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EmergencyActionKind, GeoPoint, Role};

    fn user(relations: Vec<Uuid>) -> User {
        User {
            id: Uuid::new_v4(),
            name: Some("Sam".into()),
            phone: None,
            role: Role::User,
            relations,
            last_location: None,
            device_tokens: vec![],
        }
    }

    #[test]
    fn owner_relations_are_the_fallback_recipients() {
        let parent = Uuid::new_v4();
        let owner = user(vec![parent]);
        assert_eq!(resolve_recipients(None, Some(&owner)), vec![parent]);
        assert!(resolve_recipients(None, None).is_empty());
    }

    #[test]
    fn location_events_are_live_only() {
        let event = FanoutEvent::UserLocation(TimedPoint {
            point: GeoPoint::new(1.0, 2.0).unwrap(),
            updated_at: Utc::now(),
        });
        assert!(event.notification(None, None).is_none());
        assert_eq!(event.live_event(Uuid::nil(), None).event, "location:update");
    }

    #[test]
    fn sos_call_notification_is_critical_and_links_the_location() {
        let owner = user(vec![]);
        let action = EmergencyAction {
            id: Uuid::new_v4(),
            user_id: owner.id,
            journey_id: None,
            action: EmergencyActionKind::SosCall,
            location: GeoPoint::new(12.5, 77.25).unwrap(),
            message: Some("help".into()),
            audio_url: Some("https://cdn/a.m4a".into()),
            notified_parents: vec![],
            created_at: Utc::now(),
        };
        let n = FanoutEvent::Emergency(action).notification(None, Some(&owner)).unwrap();
        assert_eq!(n.severity, Severity::Critical);
        assert!(n.body.contains("maps?q=12.5,77.25"));
        assert!(n.body.contains("Sam"));
        assert!(n.body.contains("help"));
        assert_eq!(n.audio_url.as_deref(), Some("https://cdn/a.m4a"));
    }
}
