//! End-to-end HTTP tests against the in-memory store.

use api_lib::config::Config;
use api_lib::web::{build_router, state::AppState};
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use guardian_core::domain::{Role, User};
use guardian_core::MemoryStore;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

struct TestApp {
    router: Router,
    child: Uuid,
    parent: Uuid,
}

fn user(role: Role, phone: &str) -> User {
    User {
        id: Uuid::new_v4(),
        name: Some("Ada".into()),
        phone: Some(phone.into()),
        role,
        relations: vec![],
        last_location: None,
        device_tokens: vec![],
    }
}

async fn test_app() -> TestApp {
    let store = MemoryStore::new();
    let child = user(Role::User, "+15550000001");
    let parent = user(Role::Parent, "+15550000002");
    store.seed_user(child.clone()).await;
    store.seed_user(parent.clone()).await;
    store.link(child.id, parent.id).await.unwrap();

    let config = Arc::new(Config::from_lookup(|_| None).unwrap());
    let state = Arc::new(AppState::new(Arc::new(store), config, vec![]));
    TestApp {
        router: build_router(state),
        child: child.id,
        parent: parent.id,
    }
}

fn point(lat: f64, lng: f64) -> Value {
    json!({ "type": "Point", "coordinates": [lng, lat] })
}

async fn call(
    app: &TestApp,
    method: &str,
    uri: &str,
    actor: Option<(Uuid, &str)>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some((id, role)) = actor {
        builder = builder
            .header("x-user-id", id.to_string())
            .header("x-user-role", role);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn plan_journey(app: &TestApp) -> String {
    let (status, journey) = call(
        app,
        "POST",
        "/journeys",
        Some((app.child, "user")),
        Some(json!({
            "startLocation": { "point": point(51.5, -0.12), "address": "Home" },
            "destination": { "point": point(51.51, -0.12) },
            "scheduledTime": "2026-03-01T08:00:00Z",
            "sharedWithParents": [app.parent],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(journey["status"], "planned");
    assert_eq!(journey["scheduledTime"], "2026-03-01T08:00:00Z");
    journey["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_public() {
    let app = test_app().await;
    let (status, body) = call(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn requests_without_identity_are_unauthorized() {
    let app = test_app().await;
    let (status, _) = call(&app, "GET", "/journeys/current", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn second_activation_conflicts() {
    let app = test_app().await;
    let first = plan_journey(&app).await;
    let second = plan_journey(&app).await;

    let (status, journey) = call(
        &app,
        "POST",
        &format!("/journeys/{}/start", first),
        Some((app.child, "user")),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(journey["status"], "active");

    let (status, _) = call(
        &app,
        "POST",
        &format!("/journeys/{}/start", second),
        Some((app.child, "user")),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, current) = call(&app, "GET", "/journeys/current", Some((app.child, "user")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(current["id"], first.as_str());
}

#[tokio::test]
async fn only_the_owner_can_start_a_journey() {
    let app = test_app().await;
    let id = plan_journey(&app).await;
    let (status, _) = call(
        &app,
        "POST",
        &format!("/journeys/{}/start", id),
        Some((Uuid::new_v4(), "user")),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(
        &app,
        "POST",
        &format!("/journeys/{}/start", Uuid::new_v4()),
        Some((app.child, "user")),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn low_battery_sample_raises_one_alert_visible_to_the_parent() {
    let app = test_app().await;
    let id = plan_journey(&app).await;
    call(
        &app,
        "POST",
        &format!("/journeys/{}/start", id),
        Some((app.child, "user")),
        Some(json!({})),
    )
    .await;

    let (status, outcome) = call(
        &app,
        "POST",
        &format!("/journeys/{}/location", id),
        Some((app.child, "user")),
        Some(json!({ "lat": 51.502, "lng": -0.12, "speed": 12, "batteryLevel": 15 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(outcome["progress"].as_f64().unwrap() > 0.0);
    assert_eq!(outcome["alerts"][0]["alertType"], "low_battery");
    assert_eq!(outcome["alerts"][0]["severity"], "medium");

    let (_, outcome) = call(
        &app,
        "POST",
        &format!("/journeys/{}/location", id),
        Some((app.child, "user")),
        Some(json!({ "lat": 51.503, "lng": -0.12, "speed": 12, "batteryLevel": 12 })),
    )
    .await;
    assert_eq!(outcome["alerts"], json!([]));

    let (status, alerts) = call(
        &app,
        "GET",
        &format!("/journeys/{}/alerts", id),
        Some((app.parent, "parent")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(alerts.as_array().unwrap().len(), 1);

    let (status, active) = call(&app, "GET", "/journeys/active", Some((app.parent, "parent")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(active[0]["journey"]["id"], id.as_str());
}

#[tokio::test]
async fn invalid_emergency_action_is_a_bad_request() {
    let app = test_app().await;
    let (status, _) = call(
        &app,
        "POST",
        "/journeys/emergency",
        Some((app.child, "user")),
        Some(json!({ "action": "panic", "location": point(51.5, -0.12) })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn completing_reports_metrics_and_duration() {
    let app = test_app().await;
    let id = plan_journey(&app).await;
    call(
        &app,
        "POST",
        &format!("/journeys/{}/start", id),
        Some((app.child, "user")),
        Some(json!({})),
    )
    .await;

    let (status, journey) = call(
        &app,
        "POST",
        &format!("/journeys/{}/complete", id),
        Some((app.child, "user")),
        Some(json!({ "status": "completed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(journey["status"], "completed");
    assert!(journey["actualDuration"].as_i64().unwrap() >= 0);
    assert!(journey["metrics"].is_object());

    let (status, _) = call(
        &app,
        "POST",
        &format!("/journeys/{}/complete", id),
        Some((app.child, "user")),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn standalone_sos_is_readable_by_a_linked_parent_only() {
    let app = test_app().await;
    let (status, sos) = call(
        &app,
        "POST",
        "/sos",
        Some((app.child, "user")),
        Some(json!({ "location": point(51.5, -0.12), "message": "help" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sos["action"], "sos_call");
    let sos_id = sos["id"].as_str().unwrap().to_string();

    let (status, _) = call(&app, "GET", &format!("/sos/{}", sos_id), Some((app.parent, "parent")), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        &app,
        "GET",
        &format!("/sos/{}", sos_id),
        Some((Uuid::new_v4(), "parent")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, history) = call(
        &app,
        "GET",
        &format!("/sos/history?childId={}", app.child),
        Some((app.parent, "parent")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn profile_and_device_tokens_are_stored() {
    let app = test_app().await;
    let newcomer = Uuid::new_v4();
    let (status, profile) = call(
        &app,
        "PUT",
        "/users/me",
        Some((newcomer, "parent")),
        Some(json!({ "name": "Grace", "phone": "+15550000003" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profile["role"], "parent");
    assert!(profile.get("deviceTokens").is_none());

    let (status, _) = call(
        &app,
        "POST",
        "/users/me/device-tokens",
        Some((newcomer, "parent")),
        Some(json!({ "token": "abc" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(
        &app,
        "POST",
        "/users/me/device-tokens",
        Some((newcomer, "parent")),
        Some(json!({ "token": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn active_journeys_are_for_parents_only() {
    let app = test_app().await;
    let (status, _) = call(&app, "GET", "/journeys/active", Some((app.child, "user")), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn a_parent_connects_through_an_accepted_request() {
    let app = test_app().await;
    let newcomer = Uuid::new_v4();
    call(
        &app,
        "PUT",
        "/users/me",
        Some((newcomer, "parent")),
        Some(json!({ "name": "Grace", "phone": "+15550000003" })),
    )
    .await;

    let (status, request) = call(
        &app,
        "POST",
        "/connections/requests",
        Some((newcomer, "parent")),
        Some(json!({ "childPhone": "+15550000001", "message": "It's Grace" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(request["status"], "pending");
    let request_id = request["id"].as_str().unwrap().to_string();

    let (status, pending) =
        call(&app, "GET", "/connections/requests", Some((app.child, "user")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending.as_array().unwrap().len(), 1);

    let respond_uri = format!("/connections/requests/{}/respond", request_id);
    let (status, _) = call(
        &app,
        "POST",
        &respond_uri,
        Some((app.child, "user")),
        Some(json!({ "action": "maybe" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, answered) = call(
        &app,
        "POST",
        &respond_uri,
        Some((app.child, "user")),
        Some(json!({ "action": "accept" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(answered["status"], "accepted");

    // The new link is usable for sharing.
    let (status, _) = call(
        &app,
        "POST",
        "/journeys",
        Some((app.child, "user")),
        Some(json!({
            "startLocation": { "point": point(51.5, -0.12) },
            "destination": { "point": point(51.51, -0.12) },
            "scheduledTime": "2026-03-01T08:00:00Z",
            "sharedWithParents": [newcomer],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = call(
        &app,
        "DELETE",
        &format!("/connections/{}", app.child),
        Some((newcomer, "parent")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(
        &app,
        "DELETE",
        &format!("/connections/{}", app.child),
        Some((newcomer, "parent")),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn connection_requests_need_a_target() {
    let app = test_app().await;
    let (status, _) = call(
        &app,
        "POST",
        "/connections/requests",
        Some((app.parent, "parent")),
        Some(json!({ "message": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        "POST",
        "/connections/requests",
        Some((app.parent, "parent")),
        Some(json!({ "childId": app.child })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
