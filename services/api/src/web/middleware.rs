//! services/api/src/web/middleware.rs
//!
//! Identity middleware for protected routes.
//!
//! Token verification happens at the edge; the proxy forwards the verified identity
//! in `x-user-id` and `x-user-role`. This middleware turns those headers into an
//! `Actor` request extension for the handlers.

use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use guardian_core::domain::{Actor, Role};
use tracing::debug;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Parses the forwarded identity headers. `None` if either is absent or malformed.
pub fn actor_from_headers(headers: &HeaderMap) -> Option<Actor> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())?;
    let role = headers
        .get(USER_ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().to_ascii_lowercase().parse::<Role>().ok())?;
    Some(Actor { user_id, role })
}

/// Middleware that extracts the caller's identity.
///
/// If present, inserts the `Actor` into request extensions for handlers to use.
/// If missing or malformed, returns 401 Unauthorized.
pub async fn require_actor(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let actor = actor_from_headers(req.headers()).ok_or_else(|| {
        debug!("Rejected request to {} without a valid identity", req.uri().path());
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(actor);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn both_headers_are_required() {
        let id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_str(&id.to_string()).unwrap());
        assert!(actor_from_headers(&headers).is_none());

        headers.insert(USER_ROLE_HEADER, HeaderValue::from_static("Parent"));
        let actor = actor_from_headers(&headers).unwrap();
        assert_eq!(actor.user_id, id);
        assert_eq!(actor.role, Role::Parent);
    }

    #[test]
    fn malformed_identity_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("not-a-uuid"));
        headers.insert(USER_ROLE_HEADER, HeaderValue::from_static("user"));
        assert!(actor_from_headers(&headers).is_none());

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("6f1c1a52-3e1b-4f7e-9a43-0d6a2b0f6a11"));
        headers.insert(USER_ROLE_HEADER, HeaderValue::from_static("admin"));
        assert!(actor_from_headers(&headers).is_none());
    }
}
