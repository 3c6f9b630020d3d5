//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DatabaseService` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.
//!
//! The two uniqueness rules of the domain are enforced by partial unique indexes
//! (see `migrations/0001_init.sql`); a violation surfaces as `PortError::Conflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guardian_core::domain::{
    AlertMetadata, AlertType, Checkpoint, ConnectionRequest, ConnectionStatus, EmergencyAction,
    GeoPoint, Journey, JourneyMetrics, JourneyStatus, LocationUpdate, ParentNotification, Place,
    PlannedRoute, Role, SafetyAlert, TimedPoint, User,
};
use guardian_core::ports::{DatabaseService, Page, PortError, PortResult};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DatabaseService` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

/// Maps a driver error onto the port's error taxonomy.
fn port_err(e: sqlx::Error) -> PortError {
    match e {
        sqlx::Error::RowNotFound => PortError::NotFound("row not found".to_string()),
        sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23505") => {
            PortError::Conflict(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            PortError::Unavailable(e.to_string())
        }
        other => PortError::Unexpected(other.to_string()),
    }
}

fn parse<T: std::str::FromStr>(value: &str, what: &str) -> PortResult<T> {
    value
        .parse::<T>()
        .map_err(|_| PortError::Unexpected(format!("stored {} '{}' is invalid", what, value)))
}

fn point(lat: f64, lng: f64) -> PortResult<GeoPoint> {
    GeoPoint::new(lat, lng).map_err(|e| PortError::Unexpected(e.to_string()))
}

fn timed_point(
    lat: Option<f64>,
    lng: Option<f64>,
    at: Option<DateTime<Utc>>,
) -> PortResult<Option<TimedPoint>> {
    match (lat, lng, at) {
        (Some(lat), Some(lng), Some(updated_at)) => Ok(Some(TimedPoint {
            point: point(lat, lng)?,
            updated_at,
        })),
        _ => Ok(None),
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

const USER_COLUMNS: &str =
    "id, name, phone, role, relations, device_tokens, last_lat, last_lng, last_location_at";

#[derive(FromRow)]
struct UserRecord {
    id: Uuid,
    name: Option<String>,
    phone: Option<String>,
    role: String,
    relations: Vec<Uuid>,
    device_tokens: Vec<String>,
    last_lat: Option<f64>,
    last_lng: Option<f64>,
    last_location_at: Option<DateTime<Utc>>,
}
impl UserRecord {
    fn to_domain(self) -> PortResult<User> {
        Ok(User {
            id: self.id,
            name: self.name,
            phone: self.phone,
            role: parse::<Role>(&self.role, "role")?,
            relations: self.relations,
            last_location: timed_point(self.last_lat, self.last_lng, self.last_location_at)?,
            device_tokens: self.device_tokens,
        })
    }
}

const JOURNEY_COLUMNS: &str = "id, user_id, start_lat, start_lng, start_address, dest_lat, \
     dest_lng, dest_address, planned_route, transport_mode, scheduled_time, status, start_time, \
     end_time, actual_duration, metrics, shared_with_parents, checkpoints, last_lat, last_lng, \
     last_location_at, created_at, updated_at";

#[derive(FromRow)]
struct JourneyRecord {
    id: Uuid,
    user_id: Uuid,
    start_lat: f64,
    start_lng: f64,
    start_address: Option<String>,
    dest_lat: f64,
    dest_lng: f64,
    dest_address: Option<String>,
    planned_route: Option<Json<PlannedRoute>>,
    transport_mode: String,
    scheduled_time: DateTime<Utc>,
    status: String,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    actual_duration: Option<i64>,
    metrics: Option<Json<JourneyMetrics>>,
    shared_with_parents: Vec<Uuid>,
    checkpoints: Json<Vec<Checkpoint>>,
    last_lat: Option<f64>,
    last_lng: Option<f64>,
    last_location_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl JourneyRecord {
    fn to_domain(self) -> PortResult<Journey> {
        Ok(Journey {
            id: self.id,
            user_id: self.user_id,
            start_location: Place {
                point: point(self.start_lat, self.start_lng)?,
                address: self.start_address,
            },
            destination: Place {
                point: point(self.dest_lat, self.dest_lng)?,
                address: self.dest_address,
            },
            planned_route: self.planned_route.map(|r| r.0),
            transport_mode: parse(&self.transport_mode, "transport mode")?,
            scheduled_time: self.scheduled_time,
            status: parse::<JourneyStatus>(&self.status, "journey status")?,
            start_time: self.start_time,
            end_time: self.end_time,
            actual_duration: self.actual_duration,
            metrics: self.metrics.map(|m| m.0),
            shared_with_parents: self.shared_with_parents,
            checkpoints: self.checkpoints.0,
            last_known_location: timed_point(self.last_lat, self.last_lng, self.last_location_at)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const LOCATION_COLUMNS: &str = "id, journey_id, user_id, lat, lng, speed, heading, accuracy, \
     battery_level, is_moving, address, recorded_at";

#[derive(FromRow)]
struct LocationUpdateRecord {
    id: Uuid,
    journey_id: Uuid,
    user_id: Uuid,
    lat: f64,
    lng: f64,
    speed: f64,
    heading: f64,
    accuracy: f64,
    battery_level: f64,
    is_moving: bool,
    address: Option<String>,
    recorded_at: DateTime<Utc>,
}
impl LocationUpdateRecord {
    fn to_domain(self) -> PortResult<LocationUpdate> {
        Ok(LocationUpdate {
            id: self.id,
            journey_id: self.journey_id,
            user_id: self.user_id,
            location: point(self.lat, self.lng)?,
            speed: self.speed,
            heading: self.heading,
            accuracy: self.accuracy,
            battery_level: self.battery_level,
            is_moving: self.is_moving,
            address: self.address,
            timestamp: self.recorded_at,
        })
    }
}

const ALERT_COLUMNS: &str = "id, journey_id, user_id, alert_type, severity, message, lat, lng, \
     metadata, resolved, resolved_at, resolved_by, notified_parents, created_at";

#[derive(FromRow)]
struct SafetyAlertRecord {
    id: Uuid,
    journey_id: Uuid,
    user_id: Uuid,
    alert_type: String,
    severity: String,
    message: String,
    lat: f64,
    lng: f64,
    metadata: Json<AlertMetadata>,
    resolved: bool,
    resolved_at: Option<DateTime<Utc>>,
    resolved_by: Option<Uuid>,
    notified_parents: Json<Vec<ParentNotification>>,
    created_at: DateTime<Utc>,
}
impl SafetyAlertRecord {
    fn to_domain(self) -> PortResult<SafetyAlert> {
        Ok(SafetyAlert {
            id: self.id,
            journey_id: self.journey_id,
            user_id: self.user_id,
            alert_type: parse::<AlertType>(&self.alert_type, "alert type")?,
            severity: parse(&self.severity, "severity")?,
            message: self.message,
            location: point(self.lat, self.lng)?,
            metadata: self.metadata.0,
            resolved: self.resolved,
            resolved_at: self.resolved_at,
            resolved_by: self.resolved_by,
            notified_parents: self.notified_parents.0,
            created_at: self.created_at,
        })
    }
}

const EMERGENCY_COLUMNS: &str =
    "id, user_id, journey_id, action, lat, lng, message, audio_url, notified_parents, created_at";

#[derive(FromRow)]
struct EmergencyActionRecord {
    id: Uuid,
    user_id: Uuid,
    journey_id: Option<Uuid>,
    action: String,
    lat: f64,
    lng: f64,
    message: Option<String>,
    audio_url: Option<String>,
    notified_parents: Json<Vec<ParentNotification>>,
    created_at: DateTime<Utc>,
}
impl EmergencyActionRecord {
    fn to_domain(self) -> PortResult<EmergencyAction> {
        Ok(EmergencyAction {
            id: self.id,
            user_id: self.user_id,
            journey_id: self.journey_id,
            action: parse(&self.action, "emergency action")?,
            location: point(self.lat, self.lng)?,
            message: self.message,
            audio_url: self.audio_url,
            notified_parents: self.notified_parents.0,
            created_at: self.created_at,
        })
    }
}

const CONNECTION_COLUMNS: &str =
    "id, requester, target, status, message, created_at, responded_at";

#[derive(FromRow)]
struct ConnectionRequestRecord {
    id: Uuid,
    requester: Uuid,
    target: Uuid,
    status: String,
    message: Option<String>,
    created_at: DateTime<Utc>,
    responded_at: Option<DateTime<Utc>>,
}
impl ConnectionRequestRecord {
    fn to_domain(self) -> PortResult<ConnectionRequest> {
        Ok(ConnectionRequest {
            id: self.id,
            requester: self.requester,
            target: self.target,
            status: parse::<ConnectionStatus>(&self.status, "connection status")?,
            message: self.message,
            created_at: self.created_at,
            responded_at: self.responded_at,
        })
    }
}

fn all<R, T>(records: Vec<R>, to_domain: fn(R) -> PortResult<T>) -> PortResult<Vec<T>> {
    records.into_iter().map(to_domain).collect()
}

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for DbAdapter {
    // --- Users ---

    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        let record = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {} FROM users WHERE id = $1",
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(port_err)?
        .ok_or_else(|| PortError::NotFound(format!("user {}", user_id)))?;
        record.to_domain()
    }

    async fn get_users(&self, user_ids: &[Uuid]) -> PortResult<Vec<User>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let records = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {} FROM users WHERE id = ANY($1)",
            USER_COLUMNS
        ))
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(port_err)?;
        let mut users = all(records, UserRecord::to_domain)?;
        // Keep the caller's order.
        users.sort_by_key(|u| user_ids.iter().position(|id| *id == u.id));
        Ok(users)
    }

    async fn find_user_by_phone(&self, phone: &str) -> PortResult<Option<User>> {
        let record = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {} FROM users WHERE phone = $1 ORDER BY created_at LIMIT 1",
            USER_COLUMNS
        ))
        .bind(phone)
        .fetch_optional(&self.pool)
        .await
        .map_err(port_err)?;
        record.map(UserRecord::to_domain).transpose()
    }

    async fn upsert_user_profile(
        &self,
        user_id: Uuid,
        role: Role,
        name: Option<&str>,
        phone: Option<&str>,
    ) -> PortResult<User> {
        let record = sqlx::query_as::<_, UserRecord>(&format!(
            "INSERT INTO users (id, role, name, phone) VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET
                role = EXCLUDED.role,
                name = COALESCE(EXCLUDED.name, users.name),
                phone = COALESCE(EXCLUDED.phone, users.phone),
                updated_at = now()
             RETURNING {}",
            USER_COLUMNS
        ))
        .bind(user_id)
        .bind(role.as_str())
        .bind(name)
        .bind(phone)
        .fetch_one(&self.pool)
        .await
        .map_err(port_err)?;
        record.to_domain()
    }

    async fn add_device_token(&self, user_id: Uuid, token: &str) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE users SET
                device_tokens = CASE WHEN $2 = ANY(device_tokens) THEN device_tokens
                                     ELSE array_append(device_tokens, $2) END,
                updated_at = now()
             WHERE id = $1",
        )
        .bind(user_id)
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(port_err)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    async fn update_user_location(&self, user_id: Uuid, location: TimedPoint) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE users SET last_lat = $2, last_lng = $3, last_location_at = $4, updated_at = now()
             WHERE id = $1",
        )
        .bind(user_id)
        .bind(location.point.lat)
        .bind(location.point.lng)
        .bind(location.updated_at)
        .execute(&self.pool)
        .await
        .map_err(port_err)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    async fn unlink_users(&self, user_id: Uuid, other_id: Uuid) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(port_err)?;
        for (a, b) in [(user_id, other_id), (other_id, user_id)] {
            sqlx::query(
                "UPDATE users SET relations = array_remove(relations, $2), updated_at = now()
                 WHERE id = $1",
            )
            .bind(a)
            .bind(b)
            .execute(&mut *tx)
            .await
            .map_err(port_err)?;
        }
        tx.commit().await.map_err(port_err)
    }

    // --- Connection requests ---

    async fn insert_connection_request(&self, request: &ConnectionRequest) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO connection_requests (id, requester, target, status, message, created_at,
                responded_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(request.id)
        .bind(request.requester)
        .bind(request.target)
        .bind(request.status.as_str())
        .bind(request.message.as_deref())
        .bind(request.created_at)
        .bind(request.responded_at)
        .execute(&self.pool)
        .await
        .map_err(port_err)?;
        Ok(())
    }

    async fn get_connection_request(&self, request_id: Uuid) -> PortResult<ConnectionRequest> {
        let record = sqlx::query_as::<_, ConnectionRequestRecord>(&format!(
            "SELECT {} FROM connection_requests WHERE id = $1",
            CONNECTION_COLUMNS
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(port_err)?
        .ok_or_else(|| PortError::NotFound(format!("connection request {}", request_id)))?;
        record.to_domain()
    }

    async fn list_pending_connection_requests(
        &self,
        target: Uuid,
    ) -> PortResult<Vec<ConnectionRequest>> {
        let records = sqlx::query_as::<_, ConnectionRequestRecord>(&format!(
            "SELECT {} FROM connection_requests WHERE target = $1 AND status = 'pending'
             ORDER BY created_at",
            CONNECTION_COLUMNS
        ))
        .bind(target)
        .fetch_all(&self.pool)
        .await
        .map_err(port_err)?;
        all(records, ConnectionRequestRecord::to_domain)
    }

    async fn respond_connection_request(&self, request: &ConnectionRequest) -> PortResult<bool> {
        let mut tx = self.pool.begin().await.map_err(port_err)?;
        let result = sqlx::query(
            "UPDATE connection_requests SET status = $2, responded_at = $3
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(request.id)
        .bind(request.status.as_str())
        .bind(request.responded_at)
        .execute(&mut *tx)
        .await
        .map_err(port_err)?;
        if result.rows_affected() == 0 {
            drop(tx);
            // Distinguish an answered request from a missing one.
            self.get_connection_request(request.id).await?;
            return Ok(false);
        }

        if request.status == ConnectionStatus::Accepted {
            for (a, b) in [(request.target, request.requester), (request.requester, request.target)] {
                let linked = sqlx::query(
                    "UPDATE users SET
                        relations = CASE WHEN $2 = ANY(relations) THEN relations
                                         ELSE array_append(relations, $2) END,
                        updated_at = now()
                     WHERE id = $1",
                )
                .bind(a)
                .bind(b)
                .execute(&mut *tx)
                .await
                .map_err(port_err)?;
                if linked.rows_affected() == 0 {
                    return Err(PortError::NotFound(format!("user {}", a)));
                }
            }
        }
        tx.commit().await.map_err(port_err)?;
        Ok(true)
    }

    // --- Journeys ---

    async fn insert_journey(&self, journey: &Journey) -> PortResult<()> {
        let last = journey.last_known_location;
        sqlx::query(
            "INSERT INTO journeys (id, user_id, start_lat, start_lng, start_address, dest_lat,
                dest_lng, dest_address, planned_route, transport_mode, scheduled_time, status,
                start_time, end_time, actual_duration, metrics, shared_with_parents, checkpoints,
                last_lat, last_lng, last_location_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22, $23)",
        )
        .bind(journey.id)
        .bind(journey.user_id)
        .bind(journey.start_location.point.lat)
        .bind(journey.start_location.point.lng)
        .bind(journey.start_location.address.as_deref())
        .bind(journey.destination.point.lat)
        .bind(journey.destination.point.lng)
        .bind(journey.destination.address.as_deref())
        .bind(journey.planned_route.as_ref().map(Json))
        .bind(journey.transport_mode.as_str())
        .bind(journey.scheduled_time)
        .bind(journey.status.as_str())
        .bind(journey.start_time)
        .bind(journey.end_time)
        .bind(journey.actual_duration)
        .bind(journey.metrics.as_ref().map(Json))
        .bind(&journey.shared_with_parents)
        .bind(Json(&journey.checkpoints))
        .bind(last.map(|l| l.point.lat))
        .bind(last.map(|l| l.point.lng))
        .bind(last.map(|l| l.updated_at))
        .bind(journey.created_at)
        .bind(journey.updated_at)
        .execute(&self.pool)
        .await
        .map_err(port_err)?;
        Ok(())
    }

    async fn get_journey(&self, journey_id: Uuid) -> PortResult<Journey> {
        let record = sqlx::query_as::<_, JourneyRecord>(&format!(
            "SELECT {} FROM journeys WHERE id = $1",
            JOURNEY_COLUMNS
        ))
        .bind(journey_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(port_err)?
        .ok_or_else(|| PortError::NotFound(format!("journey {}", journey_id)))?;
        record.to_domain()
    }

    async fn find_in_progress_journey(&self, user_id: Uuid) -> PortResult<Option<Journey>> {
        let record = sqlx::query_as::<_, JourneyRecord>(&format!(
            "SELECT {} FROM journeys
             WHERE user_id = $1 AND status IN ('active', 'emergency') AND end_time IS NULL",
            JOURNEY_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(port_err)?;
        record.map(JourneyRecord::to_domain).transpose()
    }

    async fn update_journey(
        &self,
        journey: &Journey,
        expected_status: JourneyStatus,
    ) -> PortResult<()> {
        let last = journey.last_known_location;
        let result = sqlx::query(
            "UPDATE journeys SET
                start_lat = $3, start_lng = $4, start_address = $5, status = $6,
                start_time = $7, end_time = $8, actual_duration = $9, metrics = $10,
                checkpoints = $11, last_lat = $12, last_lng = $13, last_location_at = $14,
                updated_at = $15
             WHERE id = $1 AND status = $2",
        )
        .bind(journey.id)
        .bind(expected_status.as_str())
        .bind(journey.start_location.point.lat)
        .bind(journey.start_location.point.lng)
        .bind(journey.start_location.address.as_deref())
        .bind(journey.status.as_str())
        .bind(journey.start_time)
        .bind(journey.end_time)
        .bind(journey.actual_duration)
        .bind(journey.metrics.as_ref().map(Json))
        .bind(Json(&journey.checkpoints))
        .bind(last.map(|l| l.point.lat))
        .bind(last.map(|l| l.point.lng))
        .bind(last.map(|l| l.updated_at))
        .bind(journey.updated_at)
        .execute(&self.pool)
        .await
        .map_err(port_err)?;

        if result.rows_affected() == 0 {
            // Distinguish a stale status from a missing row.
            self.get_journey(journey.id).await?;
            return Err(PortError::Conflict(format!(
                "journey {} is no longer {}",
                journey.id, expected_status
            )));
        }
        Ok(())
    }

    async fn list_in_progress_journeys_for_parent(
        &self,
        parent_id: Uuid,
        owners: &[Uuid],
    ) -> PortResult<Vec<Journey>> {
        let records = sqlx::query_as::<_, JourneyRecord>(&format!(
            "SELECT {} FROM journeys
             WHERE status IN ('active', 'emergency') AND end_time IS NULL
               AND (user_id = ANY($1) OR $2 = ANY(shared_with_parents))
             ORDER BY start_time DESC",
            JOURNEY_COLUMNS
        ))
        .bind(owners)
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(port_err)?;
        all(records, JourneyRecord::to_domain)
    }

    async fn list_journey_history(&self, user_id: Uuid, page: Page) -> PortResult<Vec<Journey>> {
        let records = sqlx::query_as::<_, JourneyRecord>(&format!(
            "SELECT {} FROM journeys WHERE user_id = $1
             ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            JOURNEY_COLUMNS
        ))
        .bind(user_id)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(port_err)?;
        all(records, JourneyRecord::to_domain)
    }

    // --- Location updates ---

    async fn insert_location_update(&self, update: &LocationUpdate) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO location_updates (id, journey_id, user_id, lat, lng, speed, heading,
                accuracy, battery_level, is_moving, address, recorded_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(update.id)
        .bind(update.journey_id)
        .bind(update.user_id)
        .bind(update.location.lat)
        .bind(update.location.lng)
        .bind(update.speed)
        .bind(update.heading)
        .bind(update.accuracy)
        .bind(update.battery_level)
        .bind(update.is_moving)
        .bind(update.address.as_deref())
        .bind(update.timestamp)
        .execute(&self.pool)
        .await
        .map_err(port_err)?;
        Ok(())
    }

    async fn recent_location_updates(
        &self,
        journey_id: Uuid,
        since: DateTime<Utc>,
    ) -> PortResult<Vec<LocationUpdate>> {
        let records = sqlx::query_as::<_, LocationUpdateRecord>(&format!(
            "SELECT {} FROM location_updates
             WHERE journey_id = $1 AND recorded_at >= $2 ORDER BY recorded_at ASC",
            LOCATION_COLUMNS
        ))
        .bind(journey_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(port_err)?;
        all(records, LocationUpdateRecord::to_domain)
    }

    async fn location_updates_for_journey(
        &self,
        journey_id: Uuid,
    ) -> PortResult<Vec<LocationUpdate>> {
        let records = sqlx::query_as::<_, LocationUpdateRecord>(&format!(
            "SELECT {} FROM location_updates WHERE journey_id = $1 ORDER BY recorded_at ASC",
            LOCATION_COLUMNS
        ))
        .bind(journey_id)
        .fetch_all(&self.pool)
        .await
        .map_err(port_err)?;
        all(records, LocationUpdateRecord::to_domain)
    }

    async fn latest_location_update(
        &self,
        journey_id: Uuid,
    ) -> PortResult<Option<LocationUpdate>> {
        let record = sqlx::query_as::<_, LocationUpdateRecord>(&format!(
            "SELECT {} FROM location_updates WHERE journey_id = $1
             ORDER BY recorded_at DESC LIMIT 1",
            LOCATION_COLUMNS
        ))
        .bind(journey_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(port_err)?;
        record.map(LocationUpdateRecord::to_domain).transpose()
    }

    async fn purge_location_updates_before(&self, cutoff: DateTime<Utc>) -> PortResult<u64> {
        let result = sqlx::query("DELETE FROM location_updates WHERE recorded_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(port_err)?;
        Ok(result.rows_affected())
    }

    // --- Safety alerts ---

    async fn insert_alert_if_absent(&self, alert: &SafetyAlert) -> PortResult<bool> {
        let result = sqlx::query(
            "INSERT INTO safety_alerts (id, journey_id, user_id, alert_type, severity, message,
                lat, lng, metadata, resolved, resolved_at, resolved_by, notified_parents, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             ON CONFLICT (journey_id, alert_type) WHERE NOT resolved DO NOTHING",
        )
        .bind(alert.id)
        .bind(alert.journey_id)
        .bind(alert.user_id)
        .bind(alert.alert_type.as_str())
        .bind(alert.severity.as_str())
        .bind(&alert.message)
        .bind(alert.location.lat)
        .bind(alert.location.lng)
        .bind(Json(&alert.metadata))
        .bind(alert.resolved)
        .bind(alert.resolved_at)
        .bind(alert.resolved_by)
        .bind(Json(&alert.notified_parents))
        .bind(alert.created_at)
        .execute(&self.pool)
        .await
        .map_err(port_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_alert(&self, alert_id: Uuid) -> PortResult<SafetyAlert> {
        let record = sqlx::query_as::<_, SafetyAlertRecord>(&format!(
            "SELECT {} FROM safety_alerts WHERE id = $1",
            ALERT_COLUMNS
        ))
        .bind(alert_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(port_err)?
        .ok_or_else(|| PortError::NotFound(format!("alert {}", alert_id)))?;
        record.to_domain()
    }

    async fn save_alert_ledger(
        &self,
        alert_id: Uuid,
        ledger: &[ParentNotification],
    ) -> PortResult<()> {
        let result = sqlx::query("UPDATE safety_alerts SET notified_parents = $2 WHERE id = $1")
            .bind(alert_id)
            .bind(Json(ledger))
            .execute(&self.pool)
            .await
            .map_err(port_err)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("alert {}", alert_id)));
        }
        Ok(())
    }

    async fn mark_alert_resolved(
        &self,
        alert_id: Uuid,
        resolved_by: Uuid,
        at: DateTime<Utc>,
    ) -> PortResult<bool> {
        let result = sqlx::query(
            "UPDATE safety_alerts SET resolved = TRUE, resolved_at = $3, resolved_by = $2
             WHERE id = $1 AND NOT resolved",
        )
        .bind(alert_id)
        .bind(resolved_by)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(port_err)?;
        if result.rows_affected() == 0 {
            self.get_alert(alert_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn mark_alert_acknowledged(
        &self,
        alert_id: Uuid,
        parent_id: Uuid,
        at: DateTime<Utc>,
    ) -> PortResult<bool> {
        // Rewrites only the matching ledger entry, keeping the array order.
        let result = sqlx::query(
            "UPDATE safety_alerts SET notified_parents = (
                SELECT jsonb_agg(
                    CASE WHEN e.entry->>'parent' = $2::text
                              AND NOT (e.entry->>'acknowledged')::boolean
                         THEN e.entry || jsonb_build_object('acknowledged', true, 'acknowledgedAt', $3::timestamptz)
                         ELSE e.entry END
                    ORDER BY e.ord)
                FROM jsonb_array_elements(notified_parents) WITH ORDINALITY AS e(entry, ord))
             WHERE id = $1
               AND EXISTS (
                SELECT 1 FROM jsonb_array_elements(notified_parents) AS p(entry)
                WHERE p.entry->>'parent' = $2::text AND NOT (p.entry->>'acknowledged')::boolean)",
        )
        .bind(alert_id)
        .bind(parent_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(port_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_alerts_for_journey(&self, journey_id: Uuid) -> PortResult<Vec<SafetyAlert>> {
        let records = sqlx::query_as::<_, SafetyAlertRecord>(&format!(
            "SELECT {} FROM safety_alerts WHERE journey_id = $1 ORDER BY created_at DESC",
            ALERT_COLUMNS
        ))
        .bind(journey_id)
        .fetch_all(&self.pool)
        .await
        .map_err(port_err)?;
        all(records, SafetyAlertRecord::to_domain)
    }

    async fn open_alert_types(&self, journey_id: Uuid) -> PortResult<Vec<AlertType>> {
        let types = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT alert_type FROM safety_alerts WHERE journey_id = $1 AND NOT resolved",
        )
        .bind(journey_id)
        .fetch_all(&self.pool)
        .await
        .map_err(port_err)?;
        types.iter().map(|t| parse(t, "alert type")).collect()
    }

    // --- Emergency actions ---

    async fn insert_emergency_action(&self, action: &EmergencyAction) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO emergency_actions (id, user_id, journey_id, action, lat, lng, message,
                audio_url, notified_parents, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(action.id)
        .bind(action.user_id)
        .bind(action.journey_id)
        .bind(action.action.as_str())
        .bind(action.location.lat)
        .bind(action.location.lng)
        .bind(action.message.as_deref())
        .bind(action.audio_url.as_deref())
        .bind(Json(&action.notified_parents))
        .bind(action.created_at)
        .execute(&self.pool)
        .await
        .map_err(port_err)?;
        Ok(())
    }

    async fn get_emergency_action(&self, action_id: Uuid) -> PortResult<EmergencyAction> {
        let record = sqlx::query_as::<_, EmergencyActionRecord>(&format!(
            "SELECT {} FROM emergency_actions WHERE id = $1",
            EMERGENCY_COLUMNS
        ))
        .bind(action_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(port_err)?
        .ok_or_else(|| PortError::NotFound(format!("emergency action {}", action_id)))?;
        record.to_domain()
    }

    async fn list_emergency_actions(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> PortResult<Vec<EmergencyAction>> {
        let records = sqlx::query_as::<_, EmergencyActionRecord>(&format!(
            "SELECT {} FROM emergency_actions WHERE user_id = $1
             ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            EMERGENCY_COLUMNS
        ))
        .bind(user_id)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(port_err)?;
        all(records, EmergencyActionRecord::to_domain)
    }
}
