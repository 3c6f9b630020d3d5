//! crates/guardian_core/src/links.rs
//!
//! Parent/user links. A parent asks, the user accepts or rejects, and either side
//! can disconnect later. The link itself is the `relations` list kept on both user
//! records; fanout, sharing and watching all read it from there.

use crate::domain::{Actor, ConnectionRequest, ConnectionStatus, Role, User};
use crate::error::{CoreError, CoreResult};
use crate::ports::DatabaseService;
use crate::session::{Channel, LiveEvent, SessionRegistry};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// How a parent names the user they want to connect to.
#[derive(Debug, Clone)]
pub enum ConnectionTarget {
    Id(Uuid),
    Phone(String),
}

pub struct ConnectionService {
    db: Arc<dyn DatabaseService>,
    sessions: SessionRegistry,
}

impl ConnectionService {
    pub fn new(db: Arc<dyn DatabaseService>, sessions: SessionRegistry) -> Self {
        Self { db, sessions }
    }

    /// Files a pending request from a parent. The target is told live if connected.
    pub async fn request(
        &self,
        actor: Actor,
        target: ConnectionTarget,
        message: Option<String>,
    ) -> CoreResult<ConnectionRequest> {
        if actor.role != Role::Parent {
            return Err(CoreError::Authorization("only parents can request a connection".into()));
        }
        let target = self.resolve_target(target).await?;
        if target.id == actor.user_id {
            return Err(CoreError::Validation("cannot connect to yourself".into()));
        }
        if target.role != Role::User {
            return Err(CoreError::Validation("connection target must be a user".into()));
        }
        if target.is_linked_to(actor.user_id) {
            return Err(CoreError::Conflict("already connected".into()));
        }

        let request = ConnectionRequest {
            id: Uuid::new_v4(),
            requester: actor.user_id,
            target: target.id,
            status: ConnectionStatus::Pending,
            message: message.filter(|m| !m.trim().is_empty()),
            created_at: Utc::now(),
            responded_at: None,
        };
        self.db.insert_connection_request(&request).await?;
        info!(request_id = %request.id, parent = %actor.user_id, target = %target.id, "connection requested");

        self.sessions
            .publish(
                Channel::User(target.id),
                LiveEvent::new("connection:request", json!({ "request": request })),
            )
            .await;
        Ok(request)
    }

    /// Pending requests addressed to the caller.
    pub async fn pending(&self, actor: Actor) -> CoreResult<Vec<ConnectionRequest>> {
        Ok(self.db.list_pending_connection_requests(actor.user_id).await?)
    }

    /// Accepts or rejects a request addressed to the caller. Accepting links both
    /// records in one write.
    pub async fn respond(
        &self,
        actor: Actor,
        request_id: Uuid,
        accept: bool,
    ) -> CoreResult<ConnectionRequest> {
        let mut request = self.db.get_connection_request(request_id).await?;
        if request.target != actor.user_id {
            return Err(CoreError::Authorization("request is addressed to another user".into()));
        }
        if request.status != ConnectionStatus::Pending {
            return Err(CoreError::Conflict(format!("request {} was already answered", request_id)));
        }

        request.status = if accept {
            ConnectionStatus::Accepted
        } else {
            ConnectionStatus::Rejected
        };
        request.responded_at = Some(Utc::now());
        if !self.db.respond_connection_request(&request).await? {
            return Err(CoreError::Conflict(format!("request {} was already answered", request_id)));
        }
        info!(
            request_id = %request.id,
            parent = %request.requester,
            user = %request.target,
            status = request.status.as_str(),
            "connection request answered"
        );

        self.sessions
            .publish(
                Channel::User(request.requester),
                LiveEvent::new("connection:response", json!({ "request": request })),
            )
            .await;
        Ok(request)
    }

    /// Removes the link between the caller and `other_id`, from either side.
    pub async fn disconnect(&self, actor: Actor, other_id: Uuid) -> CoreResult<()> {
        let me = self.db.get_user(actor.user_id).await?;
        if !me.is_linked_to(other_id) {
            return Err(CoreError::NotFound(format!("no link to {}", other_id)));
        }
        self.db.unlink_users(actor.user_id, other_id).await?;
        info!(user = %actor.user_id, other = %other_id, "users disconnected");
        Ok(())
    }

    async fn resolve_target(&self, target: ConnectionTarget) -> CoreResult<User> {
        match target {
            ConnectionTarget::Id(id) => Ok(self.db.get_user(id).await?),
            ConnectionTarget::Phone(phone) => self
                .db
                .find_user_by_phone(phone.trim())
                .await?
                .ok_or_else(|| CoreError::NotFound("no user with that phone number".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn user(role: Role, phone: &str) -> User {
        User {
            id: Uuid::new_v4(),
            name: None,
            phone: Some(phone.into()),
            role,
            relations: vec![],
            last_location: None,
            device_tokens: vec![],
        }
    }

    async fn setup() -> (MemoryStore, ConnectionService, Actor, Actor) {
        let store = MemoryStore::new();
        let child = user(Role::User, "+15550000001");
        let parent = user(Role::Parent, "+15550000002");
        store.seed_user(child.clone()).await;
        store.seed_user(parent.clone()).await;
        let service = ConnectionService::new(Arc::new(store.clone()), SessionRegistry::new());
        (
            store,
            service,
            Actor { user_id: child.id, role: Role::User },
            Actor { user_id: parent.id, role: Role::Parent },
        )
    }

    #[tokio::test]
    async fn accepted_request_links_both_sides() {
        let (store, service, child, parent) = setup().await;
        let request = service
            .request(parent, ConnectionTarget::Phone("+15550000001".into()), Some("hi".into()))
            .await
            .unwrap();
        assert_eq!(request.target, child.user_id);
        assert_eq!(service.pending(child).await.unwrap().len(), 1);

        let accepted = service.respond(child, request.id, true).await.unwrap();
        assert_eq!(accepted.status, ConnectionStatus::Accepted);
        assert!(store.get_user(child.user_id).await.unwrap().is_linked_to(parent.user_id));
        assert!(store.get_user(parent.user_id).await.unwrap().is_linked_to(child.user_id));

        let again = service.respond(child, request.id, false).await.unwrap_err();
        assert!(matches!(again, CoreError::Conflict(_)));
        let dup = service
            .request(parent, ConnectionTarget::Id(child.user_id), None)
            .await
            .unwrap_err();
        assert!(matches!(dup, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn rejected_request_leaves_users_unlinked() {
        let (store, service, child, parent) = setup().await;
        let request = service
            .request(parent, ConnectionTarget::Id(child.user_id), None)
            .await
            .unwrap();
        let rejected = service.respond(child, request.id, false).await.unwrap();
        assert_eq!(rejected.status, ConnectionStatus::Rejected);
        assert!(store.get_user(child.user_id).await.unwrap().relations.is_empty());
    }

    #[tokio::test]
    async fn only_parents_ask_and_only_the_target_answers() {
        let (_store, service, child, parent) = setup().await;
        let err = service
            .request(child, ConnectionTarget::Id(parent.user_id), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Authorization(_)));

        let request = service
            .request(parent, ConnectionTarget::Id(child.user_id), None)
            .await
            .unwrap();
        let err = service.respond(parent, request.id, true).await.unwrap_err();
        assert!(matches!(err, CoreError::Authorization(_)));

        let err = service
            .request(parent, ConnectionTarget::Phone("+19999999999".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn either_side_can_disconnect() {
        let (store, service, child, parent) = setup().await;
        store.link(child.user_id, parent.user_id).await.unwrap();

        service.disconnect(child, parent.user_id).await.unwrap();
        assert!(store.get_user(parent.user_id).await.unwrap().relations.is_empty());

        let err = service.disconnect(parent, child.user_id).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn target_is_told_about_the_request_live() {
        let (store, _service, child, parent) = setup().await;
        let sessions = SessionRegistry::new();
        let service = ConnectionService::new(Arc::new(store), sessions.clone());
        let (conn, mut rx) = sessions.connect().await;
        sessions.subscribe(Channel::User(child.user_id), conn).await;

        service
            .request(parent, ConnectionTarget::Id(child.user_id), None)
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "connection:request");
        assert_eq!(event.data["request"]["requester"], parent.user_id.to_string());
    }
}
