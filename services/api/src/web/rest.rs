//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.
//!
//! Every handler runs behind `require_actor` and receives the caller as an
//! `Extension<Actor>`. Core errors are mapped to HTTP statuses by `to_http`.

use crate::error::{to_http, HttpError};
use crate::web::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use chrono::{DateTime, Utc};
use guardian_core::domain::{
    Actor, CheckpointStatus, EmergencyActionKind, EmergencyRequest, GeoPoint, JourneyStatus,
    LocationSample, NewJourney, Place, PlannedRoute, TransportMode,
};
use guardian_core::{ConnectionTarget, CoreError, Page, SosRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        health_handler,
        create_journey_handler,
        start_journey_handler,
        journey_location_handler,
        complete_journey_handler,
        checkpoint_handler,
        emergency_handler,
        active_journeys_handler,
        journey_history_handler,
        current_journey_handler,
        get_journey_handler,
        journey_alerts_handler,
        resolve_alert_handler,
        acknowledge_alert_handler,
        send_sos_handler,
        sos_history_handler,
        get_sos_handler,
        location_handler,
        user_location_handler,
        update_profile_handler,
        register_device_token_handler,
        request_connection_handler,
        pending_connections_handler,
        respond_connection_handler,
        disconnect_handler,
    ),
    components(
        schemas(
            HealthResponse,
            CreateJourneyRequest,
            StartJourneyRequest,
            LocationSampleRequest,
            CompleteJourneyRequest,
            CheckpointRequest,
            EmergencyBody,
            SosBody,
            ProfileRequest,
            DeviceTokenRequest,
            ConnectionRequestBody,
            ConnectionResponseBody,
        )
    ),
    tags(
        (name = "Guardian API", description = "Journey tracking, safety alerts and SOS. \
            Every endpoint except /health expects the verified identity in the \
            x-user-id and x-user-role headers.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Request and Response Structs
//=========================================================================================

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    status: &'static str,
    live_connections: usize,
}

/// Points use the GeoJSON `Point` encoding (`coordinates: [lng, lat]`).
#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateJourneyRequest {
    #[schema(value_type = Option<Object>)]
    pub start_location: Option<Place>,
    #[schema(value_type = Option<Object>)]
    pub destination: Option<Place>,
    #[schema(value_type = Option<Object>)]
    pub planned_route: Option<PlannedRoute>,
    #[schema(value_type = Option<String>)]
    pub transport_mode: Option<TransportMode>,
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub shared_with_parents: Vec<Uuid>,
}

#[derive(Deserialize, Default, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartJourneyRequest {
    #[schema(value_type = Option<Object>)]
    pub current_location: Option<GeoPoint>,
}

/// One device sample. Flat `lat`/`lng`, shared with the live `location:update` event.
#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocationSampleRequest {
    pub lat: f64,
    pub lng: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
    pub battery_level: Option<f64>,
    pub address: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<LocationSampleRequest> for LocationSample {
    fn from(body: LocationSampleRequest) -> Self {
        Self {
            lat: body.lat,
            lng: body.lng,
            speed: body.speed,
            heading: body.heading,
            accuracy: body.accuracy,
            battery_level: body.battery_level,
            address: body.address,
            timestamp: body.timestamp,
        }
    }
}

#[derive(Deserialize, Default, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompleteJourneyRequest {
    /// `completed` (default), `cancelled` or `emergency`.
    pub status: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub current_location: Option<GeoPoint>,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRequest {
    #[schema(value_type = String)]
    pub status: CheckpointStatus,
    #[schema(value_type = Object)]
    pub location: GeoPoint,
    pub audio_url: Option<String>,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyBody {
    /// Defaults to the caller.
    pub user_id: Option<Uuid>,
    pub journey_id: Option<Uuid>,
    /// `sos_call`, `voice_recording` or `no_response`.
    pub action: String,
    #[schema(value_type = Object)]
    pub location: GeoPoint,
    pub message: Option<String>,
    pub audio_url: Option<String>,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SosBody {
    /// Defaults to `sos_call`.
    pub action: Option<String>,
    #[schema(value_type = Object)]
    pub location: GeoPoint,
    pub message: Option<String>,
    pub audio_url: Option<String>,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRequest {
    pub name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct DeviceTokenRequest {
    pub token: String,
}

/// Names the user by id or by phone number; the id wins when both are given.
#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequestBody {
    pub child_id: Option<Uuid>,
    pub child_phone: Option<String>,
    pub message: Option<String>,
}

impl ConnectionRequestBody {
    fn target(&self) -> Result<ConnectionTarget, HttpError> {
        match (self.child_id, self.child_phone.as_deref().map(str::trim)) {
            (Some(id), _) => Ok(ConnectionTarget::Id(id)),
            (None, Some(phone)) if !phone.is_empty() => Ok(ConnectionTarget::Phone(phone.to_string())),
            _ => Err((
                StatusCode::BAD_REQUEST,
                "childId or childPhone is required".to_string(),
            )),
        }
    }
}

/// `action` is `accept` or `reject`.
#[derive(Deserialize, ToSchema)]
pub struct ConnectionResponseBody {
    pub action: String,
}

#[derive(Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    /// A linked child whose history to read; defaults to the caller.
    pub child_id: Option<Uuid>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl HistoryQuery {
    fn page(&self) -> Page {
        Page::new(self.limit, self.offset)
    }
}

fn parse_action(raw: &str) -> Result<EmergencyActionKind, HttpError> {
    raw.parse::<EmergencyActionKind>().map_err(to_http)
}

//=========================================================================================
// Health
//=========================================================================================

/// Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health_handler(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        live_connections: app_state.sessions.connection_count().await,
    })
}

//=========================================================================================
// Journey Handlers
//=========================================================================================

/// Plan a new journey for the caller.
#[utoipa::path(
    post,
    path = "/journeys",
    request_body = CreateJourneyRequest,
    responses(
        (status = 201, description = "Journey planned"),
        (status = 400, description = "Missing start, destination or scheduled time"),
        (status = 403, description = "Caller is not a tracked user, or a parent is not linked")
    )
)]
pub async fn create_journey_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<CreateJourneyRequest>,
) -> Result<impl IntoResponse, HttpError> {
    let input = NewJourney {
        start_location: body.start_location,
        destination: body.destination,
        planned_route: body.planned_route,
        transport_mode: body.transport_mode,
        scheduled_time: body.scheduled_time,
        shared_with_parents: body.shared_with_parents,
    };
    let journey = app_state.journeys.create(actor, input).await.map_err(to_http)?;
    Ok((StatusCode::CREATED, Json(journey)))
}

/// Start a planned journey.
#[utoipa::path(
    post,
    path = "/journeys/{id}/start",
    request_body = StartJourneyRequest,
    params(("id" = Uuid, Path, description = "Journey id")),
    responses(
        (status = 200, description = "Journey is active"),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Journey not found"),
        (status = 409, description = "Journey or another journey of the user already in progress")
    )
)]
pub async fn start_journey_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(journey_id): Path<Uuid>,
    Json(body): Json<StartJourneyRequest>,
) -> Result<impl IntoResponse, HttpError> {
    let journey = app_state
        .journeys
        .activate(journey_id, actor, body.current_location)
        .await
        .map_err(to_http)?;
    Ok(Json(journey))
}

/// Submit a location sample for an in-progress journey.
#[utoipa::path(
    post,
    path = "/journeys/{id}/location",
    request_body = LocationSampleRequest,
    params(("id" = Uuid, Path, description = "Journey id")),
    responses(
        (status = 200, description = "Sample stored; returns progress and any new alerts"),
        (status = 400, description = "Coordinates out of range"),
        (status = 409, description = "Journey is not in progress")
    )
)]
pub async fn journey_location_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(journey_id): Path<Uuid>,
    Json(body): Json<LocationSampleRequest>,
) -> Result<impl IntoResponse, HttpError> {
    let outcome = app_state
        .journeys
        .record_location(journey_id, actor, body.into())
        .await
        .map_err(to_http)?;
    Ok(Json(outcome))
}

/// Finish a journey as completed, cancelled or emergency.
#[utoipa::path(
    post,
    path = "/journeys/{id}/complete",
    request_body = CompleteJourneyRequest,
    params(("id" = Uuid, Path, description = "Journey id")),
    responses(
        (status = 200, description = "Journey ended, with metrics"),
        (status = 400, description = "Invalid final status"),
        (status = 409, description = "Journey already ended")
    )
)]
pub async fn complete_journey_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(journey_id): Path<Uuid>,
    Json(body): Json<CompleteJourneyRequest>,
) -> Result<impl IntoResponse, HttpError> {
    let final_status = body
        .status
        .as_deref()
        .map(str::parse::<JourneyStatus>)
        .transpose()
        .map_err(to_http)?;
    let journey = app_state
        .journeys
        .complete(journey_id, actor, final_status, body.current_location)
        .await
        .map_err(to_http)?;
    Ok(Json(journey))
}

/// Record a check-in on a journey.
#[utoipa::path(
    post,
    path = "/journeys/{id}/checkpoints",
    request_body = CheckpointRequest,
    params(("id" = Uuid, Path, description = "Journey id")),
    responses(
        (status = 200, description = "Checkpoint recorded"),
        (status = 403, description = "Caller may not record this checkpoint")
    )
)]
pub async fn checkpoint_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(journey_id): Path<Uuid>,
    Json(body): Json<CheckpointRequest>,
) -> Result<impl IntoResponse, HttpError> {
    let journey = app_state
        .journeys
        .record_checkpoint(journey_id, actor, body.status, body.location, body.audio_url)
        .await
        .map_err(to_http)?;
    Ok(Json(journey))
}

/// Raise an emergency, optionally bound to a journey.
#[utoipa::path(
    post,
    path = "/journeys/emergency",
    request_body = EmergencyBody,
    responses(
        (status = 200, description = "Emergency recorded and fanned out"),
        (status = 400, description = "Invalid action"),
        (status = 404, description = "Journey not found")
    )
)]
pub async fn emergency_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<EmergencyBody>,
) -> Result<impl IntoResponse, HttpError> {
    let action = parse_action(&body.action)?;
    let request = EmergencyRequest {
        user_id: body.user_id.unwrap_or(actor.user_id),
        journey_id: body.journey_id,
        action,
        location: body.location,
        message: body.message,
        audio_url: body.audio_url,
    };
    let emergency = app_state
        .journeys
        .trigger_emergency(actor, request)
        .await
        .map_err(to_http)?;
    Ok(Json(emergency))
}

/// In-progress journeys the calling parent may watch.
#[utoipa::path(
    get,
    path = "/journeys/active",
    responses(
        (status = 200, description = "Journeys with latest location and progress"),
        (status = 403, description = "Caller is not a parent")
    )
)]
pub async fn active_journeys_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, HttpError> {
    let views = app_state
        .journeys
        .active_for_parent(actor)
        .await
        .map_err(to_http)?;
    Ok(Json(views))
}

#[utoipa::path(
    get,
    path = "/journeys/history",
    params(HistoryQuery),
    responses(
        (status = 200, description = "Journeys, most recent first"),
        (status = 403, description = "Not linked to the requested child")
    )
)]
pub async fn journey_history_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let journeys = app_state
        .journeys
        .history(actor, query.child_id, query.page())
        .await
        .map_err(to_http)?;
    Ok(Json(journeys))
}

/// The caller's in-progress journey, or `null`.
#[utoipa::path(
    get,
    path = "/journeys/current",
    responses((status = 200, description = "Current journey or null"))
)]
pub async fn current_journey_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, HttpError> {
    let journey = app_state.journeys.current(actor).await.map_err(to_http)?;
    Ok(Json(journey))
}

#[utoipa::path(
    get,
    path = "/journeys/{id}",
    params(("id" = Uuid, Path, description = "Journey id")),
    responses(
        (status = 200, description = "The journey"),
        (status = 403, description = "Caller may not view this journey"),
        (status = 404, description = "Journey not found")
    )
)]
pub async fn get_journey_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(journey_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let journey = app_state.journeys.get(journey_id, actor).await.map_err(to_http)?;
    Ok(Json(journey))
}

//=========================================================================================
// Alert Handlers
//=========================================================================================

#[utoipa::path(
    get,
    path = "/journeys/{id}/alerts",
    params(("id" = Uuid, Path, description = "Journey id")),
    responses((status = 200, description = "Alerts, most recent first"))
)]
pub async fn journey_alerts_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(journey_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let alerts = app_state
        .journeys
        .alerts_for_journey(journey_id, actor)
        .await
        .map_err(to_http)?;
    Ok(Json(alerts))
}

/// Resolve an alert, freeing its type for future alerts on the journey.
#[utoipa::path(
    post,
    path = "/alerts/{id}/resolve",
    params(("id" = Uuid, Path, description = "Alert id")),
    responses(
        (status = 200, description = "Alert resolved"),
        (status = 409, description = "Alert already resolved")
    )
)]
pub async fn resolve_alert_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(alert_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let alert = app_state
        .journeys
        .resolve_alert(alert_id, actor)
        .await
        .map_err(to_http)?;
    Ok(Json(alert))
}

#[utoipa::path(
    post,
    path = "/alerts/{id}/acknowledge",
    params(("id" = Uuid, Path, description = "Alert id")),
    responses(
        (status = 200, description = "Acknowledgement recorded"),
        (status = 403, description = "Caller was not notified of this alert")
    )
)]
pub async fn acknowledge_alert_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(alert_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let alert = app_state
        .journeys
        .acknowledge_alert(alert_id, actor)
        .await
        .map_err(to_http)?;
    Ok(Json(alert))
}

//=========================================================================================
// SOS Handlers
//=========================================================================================

/// Raise an SOS for the caller. Attached to the in-progress journey when there is one.
#[utoipa::path(
    post,
    path = "/sos",
    request_body = SosBody,
    responses(
        (status = 201, description = "SOS recorded and fanned out"),
        (status = 400, description = "Invalid action")
    )
)]
pub async fn send_sos_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<SosBody>,
) -> Result<impl IntoResponse, HttpError> {
    let action = match body.action.as_deref() {
        Some(raw) => parse_action(raw)?,
        None => EmergencyActionKind::SosCall,
    };
    let emergency = app_state
        .tracker
        .send_sos(
            actor,
            SosRequest {
                action,
                location: body.location,
                message: body.message,
                audio_url: body.audio_url,
            },
        )
        .await
        .map_err(to_http)?;
    Ok((StatusCode::CREATED, Json(emergency)))
}

#[utoipa::path(
    get,
    path = "/sos/history",
    params(HistoryQuery),
    responses((status = 200, description = "Emergency actions, most recent first"))
)]
pub async fn sos_history_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let actions = app_state
        .journeys
        .emergency_history(actor, query.child_id, query.page())
        .await
        .map_err(to_http)?;
    Ok(Json(actions))
}

#[utoipa::path(
    get,
    path = "/sos/{id}",
    params(("id" = Uuid, Path, description = "Emergency action id")),
    responses(
        (status = 200, description = "The emergency action"),
        (status = 404, description = "Not found")
    )
)]
pub async fn get_sos_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(emergency_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let action = app_state
        .journeys
        .emergency(emergency_id, actor)
        .await
        .map_err(to_http)?;
    Ok(Json(action))
}

//=========================================================================================
// Location and Profile Handlers
//=========================================================================================

/// Journey-less location stream. Routed into the in-progress journey when there is one.
#[utoipa::path(
    post,
    path = "/location",
    request_body = LocationSampleRequest,
    responses((status = 200, description = "Where the sample was recorded"))
)]
pub async fn location_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<LocationSampleRequest>,
) -> Result<impl IntoResponse, HttpError> {
    let outcome = app_state
        .tracker
        .ingest_location(actor, body.into())
        .await
        .map_err(to_http)?;
    Ok(Json(outcome))
}

#[utoipa::path(
    get,
    path = "/users/{id}/location",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "Last known location or null"),
        (status = 403, description = "Not linked to this user")
    )
)]
pub async fn user_location_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let location = app_state
        .tracker
        .latest_location(actor, user_id)
        .await
        .map_err(to_http)?;
    Ok(Json(location))
}

/// Create or update the caller's profile. The role comes from the verified identity.
#[utoipa::path(
    put,
    path = "/users/me",
    request_body = ProfileRequest,
    responses((status = 200, description = "The stored profile"))
)]
pub async fn update_profile_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<ProfileRequest>,
) -> Result<impl IntoResponse, HttpError> {
    let user = app_state
        .db
        .upsert_user_profile(
            actor.user_id,
            actor.role,
            body.name.as_deref(),
            body.phone.as_deref(),
        )
        .await
        .map_err(|e| to_http(CoreError::from(e)))?;
    Ok(Json(user))
}

#[utoipa::path(
    post,
    path = "/users/me/device-tokens",
    request_body = DeviceTokenRequest,
    responses(
        (status = 204, description = "Token registered"),
        (status = 400, description = "Empty token")
    )
)]
pub async fn register_device_token_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<DeviceTokenRequest>,
) -> Result<impl IntoResponse, HttpError> {
    let token = body.token.trim();
    if token.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "token must not be empty".to_string()));
    }
    app_state
        .db
        .add_device_token(actor.user_id, token)
        .await
        .map_err(|e| to_http(CoreError::from(e)))?;
    Ok(StatusCode::NO_CONTENT)
}

//=========================================================================================
// Connections
//=========================================================================================

/// Ask a user to connect. Parents only.
#[utoipa::path(
    post,
    path = "/connections/requests",
    request_body = ConnectionRequestBody,
    responses(
        (status = 201, description = "Request filed"),
        (status = 403, description = "Caller is not a parent"),
        (status = 404, description = "No such user"),
        (status = 409, description = "Already connected or a request is pending")
    )
)]
pub async fn request_connection_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<ConnectionRequestBody>,
) -> Result<impl IntoResponse, HttpError> {
    let target = body.target()?;
    let request = app_state
        .connections
        .request(actor, target, body.message)
        .await
        .map_err(to_http)?;
    Ok((StatusCode::CREATED, Json(request)))
}

/// Pending requests addressed to the caller, oldest first.
#[utoipa::path(
    get,
    path = "/connections/requests",
    responses((status = 200, description = "Pending requests"))
)]
pub async fn pending_connections_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, HttpError> {
    let requests = app_state.connections.pending(actor).await.map_err(to_http)?;
    Ok(Json(requests))
}

/// Accept or reject a request. Accepting links both users.
#[utoipa::path(
    post,
    path = "/connections/requests/{id}/respond",
    params(("id" = Uuid, Path, description = "Request id")),
    request_body = ConnectionResponseBody,
    responses(
        (status = 200, description = "Request answered"),
        (status = 400, description = "Unknown action"),
        (status = 403, description = "Request is addressed to someone else"),
        (status = 409, description = "Request was already answered")
    )
)]
pub async fn respond_connection_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<ConnectionResponseBody>,
) -> Result<impl IntoResponse, HttpError> {
    let accept = match body.action.as_str() {
        "accept" => true,
        "reject" => false,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("action must be accept or reject, got '{}'", other),
            ))
        }
    };
    let request = app_state
        .connections
        .respond(actor, request_id, accept)
        .await
        .map_err(to_http)?;
    Ok(Json(request))
}

/// Remove the link between the caller and another user.
#[utoipa::path(
    delete,
    path = "/connections/{id}",
    params(("id" = Uuid, Path, description = "The linked user")),
    responses(
        (status = 204, description = "Disconnected"),
        (status = 404, description = "No such link")
    )
)]
pub async fn disconnect_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(other_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    app_state
        .connections
        .disconnect(actor, other_id)
        .await
        .map_err(to_http)?;
    Ok(StatusCode::NO_CONTENT)
}
