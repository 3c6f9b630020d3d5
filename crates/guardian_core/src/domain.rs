//! crates/guardian_core/src/domain.rs
//!
//! Defines the core data structures for the application: users, journeys, location
//! samples, safety alerts and emergency actions.
//! These structs are independent of any database; their serde form is the canonical
//! wire schema shared by the HTTP and live-channel paths.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Speed (km/h) above which a sample counts as moving.
pub const MOVING_SPEED_THRESHOLD_KMH: f64 = 1.0;

//=========================================================================================
// Geometry
//=========================================================================================

/// A WGS84 position. Serialized as a GeoJSON `Point`, i.e. `[lng, lat]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "GeoJsonPoint", try_from = "GeoJsonPoint")]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> CoreResult<Self> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(CoreError::Validation(format!("latitude {} is out of range", lat)));
        }
        if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
            return Err(CoreError::Validation(format!("longitude {} is out of range", lng)));
        }
        Ok(Self { lat, lng })
    }
}

#[derive(Serialize, Deserialize)]
struct GeoJsonPoint {
    #[serde(rename = "type")]
    kind: String,
    coordinates: [f64; 2],
}

impl From<GeoPoint> for GeoJsonPoint {
    fn from(point: GeoPoint) -> Self {
        Self {
            kind: "Point".to_string(),
            coordinates: [point.lng, point.lat],
        }
    }
}

impl TryFrom<GeoJsonPoint> for GeoPoint {
    type Error = String;

    fn try_from(value: GeoJsonPoint) -> Result<Self, Self::Error> {
        if value.kind != "Point" {
            return Err(format!("expected a GeoJSON Point, got '{}'", value.kind));
        }
        let [lng, lat] = value.coordinates;
        GeoPoint::new(lat, lng).map_err(|e| e.to_string())
    }
}

/// A point with an optional human-readable label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    pub point: GeoPoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// A point stamped with the time it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimedPoint {
    pub point: GeoPoint,
    pub updated_at: DateTime<Utc>,
}

//=========================================================================================
// Users
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Parent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Parent => "parent",
        }
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "parent" => Ok(Role::Parent),
            other => Err(CoreError::Validation(format!("unknown role '{}'", other))),
        }
    }
}

/// A verified identity handed to the core by the authentication boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

/// A tracked individual or a guardian. `relations` is mirrored on both sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub role: Role,
    pub relations: Vec<Uuid>,
    pub last_location: Option<TimedPoint>,
    #[serde(default, skip_serializing)]
    pub device_tokens: Vec<String>,
}

impl User {
    pub fn is_linked_to(&self, other: Uuid) -> bool {
        self.relations.contains(&other)
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.phone.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Accepted => "accepted",
            ConnectionStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for ConnectionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConnectionStatus::Pending),
            "accepted" => Ok(ConnectionStatus::Accepted),
            "rejected" => Ok(ConnectionStatus::Rejected),
            other => Err(CoreError::Validation(format!("unknown connection status '{}'", other))),
        }
    }
}

/// A parent asking a user to be linked. Accepting it mirrors the relation on both
/// user records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub id: Uuid,
    /// The parent.
    pub requester: Uuid,
    /// The user being asked.
    pub target: Uuid,
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

//=========================================================================================
// Journeys
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStatus {
    Planned,
    Active,
    Completed,
    Cancelled,
    Emergency,
}

impl JourneyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JourneyStatus::Planned => "planned",
            JourneyStatus::Active => "active",
            JourneyStatus::Completed => "completed",
            JourneyStatus::Cancelled => "cancelled",
            JourneyStatus::Emergency => "emergency",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JourneyStatus::Completed | JourneyStatus::Cancelled)
    }
}

impl fmt::Display for JourneyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JourneyStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(JourneyStatus::Planned),
            "active" => Ok(JourneyStatus::Active),
            "completed" => Ok(JourneyStatus::Completed),
            "cancelled" => Ok(JourneyStatus::Cancelled),
            "emergency" => Ok(JourneyStatus::Emergency),
            other => Err(CoreError::Validation(format!("unknown journey status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    #[default]
    Walking,
    Cycling,
    Driving,
    PublicTransport,
    Other,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Walking => "walking",
            TransportMode::Cycling => "cycling",
            TransportMode::Driving => "driving",
            TransportMode::PublicTransport => "public_transport",
            TransportMode::Other => "other",
        }
    }
}

impl FromStr for TransportMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "walking" => Ok(TransportMode::Walking),
            "cycling" => Ok(TransportMode::Cycling),
            "driving" => Ok(TransportMode::Driving),
            "public_transport" => Ok(TransportMode::PublicTransport),
            "other" => Ok(TransportMode::Other),
            other => Err(CoreError::Validation(format!("unknown transport mode '{}'", other))),
        }
    }
}

/// Opaque planned-route geometry supplied by the client.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedRoute {
    #[serde(default)]
    pub waypoints: Vec<GeoPoint>,
    /// Metres.
    pub total_distance: Option<f64>,
    /// Seconds.
    pub estimated_duration: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Safe,
    Unsafe,
    NoResponse,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Safe => "safe",
            CheckpointStatus::Unsafe => "unsafe",
            CheckpointStatus::NoResponse => "no_response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    pub status: CheckpointStatus,
    pub location: GeoPoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    pub recorded_by: Uuid,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JourneyMetrics {
    /// km/h
    pub average_speed: f64,
    /// km/h
    pub max_speed: f64,
    pub alert_count: u32,
    /// 0..=100
    pub safety_score: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Journey {
    pub id: Uuid,
    pub user_id: Uuid,
    pub start_location: Place,
    pub destination: Place,
    pub planned_route: Option<PlannedRoute>,
    pub transport_mode: TransportMode,
    pub scheduled_time: DateTime<Utc>,
    pub status: JourneyStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Whole seconds between `start_time` and `end_time`.
    pub actual_duration: Option<i64>,
    pub metrics: Option<JourneyMetrics>,
    pub shared_with_parents: Vec<Uuid>,
    pub checkpoints: Vec<Checkpoint>,
    pub last_known_location: Option<TimedPoint>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Journey {
    /// Active or flagged as emergency, and not yet ended. Location tracking continues
    /// through an emergency.
    pub fn is_in_progress(&self) -> bool {
        matches!(self.status, JourneyStatus::Active | JourneyStatus::Emergency)
            && self.end_time.is_none()
    }

    pub fn planned_distance(&self) -> Option<f64> {
        self.planned_route
            .as_ref()
            .and_then(|r| r.total_distance)
            .filter(|d| d.is_finite() && *d > 0.0)
    }
}

/// Input to journey creation, as received from a client.
#[derive(Debug, Clone, Default)]
pub struct NewJourney {
    pub start_location: Option<Place>,
    pub destination: Option<Place>,
    pub planned_route: Option<PlannedRoute>,
    pub transport_mode: Option<TransportMode>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub shared_with_parents: Vec<Uuid>,
}

//=========================================================================================
// Location samples
//=========================================================================================

/// A raw location sample from either ingress path.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocationSample {
    pub lat: f64,
    pub lng: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
    pub battery_level: Option<f64>,
    pub address: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl LocationSample {
    /// A bare position with no device telemetry.
    pub fn at(point: GeoPoint) -> Self {
        Self {
            lat: point.lat,
            lng: point.lng,
            ..Default::default()
        }
    }
}

/// An append-only sample tied to a journey. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub id: Uuid,
    pub journey_id: Uuid,
    pub user_id: Uuid,
    pub location: GeoPoint,
    /// km/h
    pub speed: f64,
    /// degrees, 0..360
    pub heading: f64,
    /// metres
    pub accuracy: f64,
    /// percent, 0..=100
    pub battery_level: f64,
    pub is_moving: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub timestamp: DateTime<Utc>,
}

//=========================================================================================
// Safety alerts
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    RouteDeviation,
    UnexpectedStop,
    HighRiskArea,
    LowBattery,
    CommunicationLoss,
    Emergency,
    SpeedAlert,
    LateArrival,
    SafeArrival,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::RouteDeviation => "route_deviation",
            AlertType::UnexpectedStop => "unexpected_stop",
            AlertType::HighRiskArea => "high_risk_area",
            AlertType::LowBattery => "low_battery",
            AlertType::CommunicationLoss => "communication_loss",
            AlertType::Emergency => "emergency",
            AlertType::SpeedAlert => "speed_alert",
            AlertType::LateArrival => "late_arrival",
            AlertType::SafeArrival => "safe_arrival",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "route_deviation" => Ok(AlertType::RouteDeviation),
            "unexpected_stop" => Ok(AlertType::UnexpectedStop),
            "high_risk_area" => Ok(AlertType::HighRiskArea),
            "low_battery" => Ok(AlertType::LowBattery),
            "communication_loss" => Ok(AlertType::CommunicationLoss),
            "emergency" => Ok(AlertType::Emergency),
            "speed_alert" => Ok(AlertType::SpeedAlert),
            "late_arrival" => Ok(AlertType::LateArrival),
            "safe_arrival" => Ok(AlertType::SafeArrival),
            other => Err(CoreError::Validation(format!("unknown alert type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(CoreError::Validation(format!("unknown severity '{}'", other))),
        }
    }
}

/// Type-specific context attached to an alert.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deviation_distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_arrival: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_arrival: Option<DateTime<Utc>>,
}

/// One entry of a delivery audit trail: a recipient that was attempted, whether any
/// channel reached them, and whether they acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentNotification {
    pub parent: Uuid,
    pub notified_at: DateTime<Utc>,
    pub delivered: bool,
    pub channels: Vec<String>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyAlert {
    pub id: Uuid,
    pub journey_id: Uuid,
    pub user_id: Uuid,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub location: GeoPoint,
    pub metadata: AlertMetadata,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
    pub notified_parents: Vec<ParentNotification>,
    pub created_at: DateTime<Utc>,
}

impl SafetyAlert {
    pub fn new(
        journey: &Journey,
        alert_type: AlertType,
        severity: Severity,
        message: impl Into<String>,
        location: GeoPoint,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            journey_id: journey.id,
            user_id: journey.user_id,
            alert_type,
            severity,
            message: message.into(),
            location,
            metadata: AlertMetadata::default(),
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            notified_parents: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: AlertMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

//=========================================================================================
// Emergency actions
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyActionKind {
    SosCall,
    VoiceRecording,
    NoResponse,
}

impl EmergencyActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyActionKind::SosCall => "sos_call",
            EmergencyActionKind::VoiceRecording => "voice_recording",
            EmergencyActionKind::NoResponse => "no_response",
        }
    }

    /// `no_response` is raised on the user's behalf; the others come from the user.
    pub fn is_user_initiated(&self) -> bool {
        !matches!(self, EmergencyActionKind::NoResponse)
    }

    pub fn severity(&self) -> Severity {
        match self {
            EmergencyActionKind::SosCall => Severity::Critical,
            EmergencyActionKind::VoiceRecording | EmergencyActionKind::NoResponse => {
                Severity::High
            }
        }
    }
}

impl FromStr for EmergencyActionKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sos_call" => Ok(EmergencyActionKind::SosCall),
            "voice_recording" => Ok(EmergencyActionKind::VoiceRecording),
            "no_response" => Ok(EmergencyActionKind::NoResponse),
            other => Err(CoreError::Validation(format!("invalid emergency action '{}'", other))),
        }
    }
}

/// An immutable SOS/emergency event. Only `notified_parents` is filled in before the
/// record is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyAction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub journey_id: Option<Uuid>,
    pub action: EmergencyActionKind,
    pub location: GeoPoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    pub notified_parents: Vec<ParentNotification>,
    pub created_at: DateTime<Utc>,
}

/// Input to an emergency trigger.
#[derive(Debug, Clone)]
pub struct EmergencyRequest {
    pub user_id: Uuid,
    pub journey_id: Option<Uuid>,
    pub action: EmergencyActionKind,
    pub location: GeoPoint,
    pub message: Option<String>,
    pub audio_url: Option<String>,
}
