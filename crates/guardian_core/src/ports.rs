//! crates/guardian_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture: storage and the
//! outbound notification providers live behind them, outside the core.

use crate::domain::{
    AlertType, ConnectionRequest, EmergencyAction, Journey, JourneyStatus, LocationUpdate,
    ParentNotification, Role, SafetyAlert, Severity, TimedPoint, User,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all storage port operations.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    /// A conditional write or uniqueness constraint rejected the operation.
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// Offset pagination for history reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub const DEFAULT_LIMIT: u32 = 20;
    pub const MAX_LIMIT: u32 = 100;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

//=========================================================================================
// Storage Port
//=========================================================================================

#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- Users ---
    async fn get_user(&self, user_id: Uuid) -> PortResult<User>;

    /// Returns the users that exist among `user_ids`; unknown ids are skipped.
    async fn get_users(&self, user_ids: &[Uuid]) -> PortResult<Vec<User>>;

    async fn find_user_by_phone(&self, phone: &str) -> PortResult<Option<User>>;

    async fn upsert_user_profile(
        &self,
        user_id: Uuid,
        role: Role,
        name: Option<&str>,
        phone: Option<&str>,
    ) -> PortResult<User>;

    async fn add_device_token(&self, user_id: Uuid, token: &str) -> PortResult<()>;

    async fn update_user_location(&self, user_id: Uuid, location: TimedPoint) -> PortResult<()>;

    /// Removes the relation from both records. Unlinked pairs are left as they are.
    async fn unlink_users(&self, user_id: Uuid, other_id: Uuid) -> PortResult<()>;

    // --- Connection requests ---
    /// Fails with `PortError::Conflict` when the pair already has a pending request.
    async fn insert_connection_request(&self, request: &ConnectionRequest) -> PortResult<()>;

    async fn get_connection_request(&self, request_id: Uuid) -> PortResult<ConnectionRequest>;

    /// Pending requests addressed to `target`, oldest first.
    async fn list_pending_connection_requests(
        &self,
        target: Uuid,
    ) -> PortResult<Vec<ConnectionRequest>>;

    /// Stores the response if the request is still pending; an accepted request links
    /// requester and target on both records in the same write. Returns `false` when
    /// the request was already answered.
    async fn respond_connection_request(&self, request: &ConnectionRequest) -> PortResult<bool>;

    // --- Journeys ---
    async fn insert_journey(&self, journey: &Journey) -> PortResult<()>;

    async fn get_journey(&self, journey_id: Uuid) -> PortResult<Journey>;

    /// The user's journey that is active or in emergency and not yet ended.
    async fn find_in_progress_journey(&self, user_id: Uuid) -> PortResult<Option<Journey>>;

    /// Conditional write. Fails with `PortError::Conflict` when the stored status no
    /// longer equals `expected_status`, or when the write would leave the owner with
    /// two in-progress journeys.
    async fn update_journey(
        &self,
        journey: &Journey,
        expected_status: JourneyStatus,
    ) -> PortResult<()>;

    /// In-progress journeys owned by any of `owners` or shared with `parent_id`.
    async fn list_in_progress_journeys_for_parent(
        &self,
        parent_id: Uuid,
        owners: &[Uuid],
    ) -> PortResult<Vec<Journey>>;

    /// Most recent first.
    async fn list_journey_history(&self, user_id: Uuid, page: Page) -> PortResult<Vec<Journey>>;

    // --- Location updates ---
    async fn insert_location_update(&self, update: &LocationUpdate) -> PortResult<()>;

    /// Samples for the journey with `timestamp >= since`, oldest first.
    async fn recent_location_updates(
        &self,
        journey_id: Uuid,
        since: DateTime<Utc>,
    ) -> PortResult<Vec<LocationUpdate>>;

    /// Every retained sample for the journey, oldest first.
    async fn location_updates_for_journey(&self, journey_id: Uuid)
        -> PortResult<Vec<LocationUpdate>>;

    async fn latest_location_update(&self, journey_id: Uuid)
        -> PortResult<Option<LocationUpdate>>;

    /// Deletes samples older than `cutoff`; returns how many were removed.
    async fn purge_location_updates_before(&self, cutoff: DateTime<Utc>) -> PortResult<u64>;

    // --- Safety alerts ---
    /// Inserts the alert unless an unresolved alert of the same type already exists
    /// for the journey. Returns `false` when the de-duplication gate rejected it.
    async fn insert_alert_if_absent(&self, alert: &SafetyAlert) -> PortResult<bool>;

    async fn get_alert(&self, alert_id: Uuid) -> PortResult<SafetyAlert>;

    /// Replaces only the delivery ledger; resolution fields are left untouched.
    async fn save_alert_ledger(
        &self,
        alert_id: Uuid,
        ledger: &[ParentNotification],
    ) -> PortResult<()>;

    /// Marks the alert resolved if it is still open. Returns `false` when it was
    /// already resolved.
    async fn mark_alert_resolved(
        &self,
        alert_id: Uuid,
        resolved_by: Uuid,
        at: DateTime<Utc>,
    ) -> PortResult<bool>;

    /// Flags the parent's ledger entry as acknowledged; other entries are untouched.
    /// Returns `false` when the parent has no entry or already acknowledged.
    async fn mark_alert_acknowledged(
        &self,
        alert_id: Uuid,
        parent_id: Uuid,
        at: DateTime<Utc>,
    ) -> PortResult<bool>;

    /// Most recent first.
    async fn list_alerts_for_journey(&self, journey_id: Uuid) -> PortResult<Vec<SafetyAlert>>;

    async fn open_alert_types(&self, journey_id: Uuid) -> PortResult<Vec<AlertType>>;

    // --- Emergency actions ---
    async fn insert_emergency_action(&self, action: &EmergencyAction) -> PortResult<()>;

    async fn get_emergency_action(&self, action_id: Uuid) -> PortResult<EmergencyAction>;

    /// Most recent first.
    async fn list_emergency_actions(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> PortResult<Vec<EmergencyAction>>;
}

//=========================================================================================
// Notification Port
//=========================================================================================

/// The payload handed to every outbound notification channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub severity: Severity,
    pub journey_id: Option<Uuid>,
    pub audio_url: Option<String>,
}

/// Why a single channel failed to reach a single recipient.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    /// The recipient has no address for this channel, or the channel is disabled.
    #[error("Channel not configured: {0}")]
    NotConfigured(String),
    /// The provider refused the request.
    #[error("Rejected by provider: {0}")]
    Rejected(String),
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),
}

impl DeliveryError {
    /// Whether a later attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transport(_) | DeliveryError::TimedOut(_))
    }
}

/// One outbound channel (push, SMS, voice, ...). Fire-and-forget from the core's
/// point of view: failures are reported, never propagated.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// A short stable name used in logs and in the delivery ledger.
    fn name(&self) -> &'static str;

    /// Whether this channel should carry `notification` at all.
    fn accepts(&self, _notification: &Notification) -> bool {
        true
    }

    async fn deliver(&self, recipient: &User, notification: &Notification)
        -> Result<(), DeliveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_clamps_limit() {
        assert_eq!(Page::new(None, None), Page { limit: 20, offset: 0 });
        assert_eq!(Page::new(Some(0), Some(5)), Page { limit: 1, offset: 5 });
        assert_eq!(Page::new(Some(1_000), None).limit, Page::MAX_LIMIT);
    }

    #[test]
    fn only_transport_failures_and_timeouts_are_transient() {
        assert!(DeliveryError::Transport("reset".into()).is_transient());
        assert!(DeliveryError::TimedOut(Duration::from_secs(1)).is_transient());
        assert!(!DeliveryError::Rejected("bad number".into()).is_transient());
        assert!(!DeliveryError::NotConfigured("no phone".into()).is_transient());
    }
}
