//! services/api/src/web/ws_handler.rs
//!
//! This is the entry point and control loop for a live-channel connection.
//!
//! Each connection registers with the `SessionRegistry` and gets an outbound queue.
//! A writer task drains that queue (plus direct replies) into the socket while the
//! read loop handles client messages. Closing the socket, cleanly or not, releases
//! every subscription of the connection.

use crate::error::to_http;
use crate::web::{
    protocol::{ClientMessage, ServerMessage},
    state::AppState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use futures::{SinkExt, StreamExt};
use guardian_core::domain::{Actor, EmergencyActionKind, Role};
use guardian_core::{Channel, ConnectionId, CoreError, CoreResult, LiveEvent, SosRequest};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// The handler for upgrading HTTP requests to live-channel connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, actor))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, actor: Actor) {
    let (connection, mut events) = app_state.sessions.connect().await;
    info!(connection = %connection, user_id = %actor.user_id, "live connection opened");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (reply_tx, mut replies) = mpsc::unbounded_channel::<LiveEvent>();

    // --- 1. Writer Task ---
    let writer = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(event) = events.recv() => event,
                Some(event) = replies.recv() => event,
                else => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize live event {}: {:?}", event.event, e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // --- 2. Main Message Loop ---
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => {
                        match handle_client_message(&app_state, actor, connection, message).await {
                            Ok(reply) => reply,
                            Err(e) => Some(ServerMessage::Error {
                                message: to_http(e).1,
                            }),
                        }
                    }
                    Err(e) => {
                        warn!(connection = %connection, "Unparseable live message: {}", e);
                        Some(ServerMessage::Error {
                            message: format!("Invalid message: {}", e),
                        })
                    }
                };
                if let Some(reply) = reply {
                    if reply_tx.send(reply.into()).is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(connection = %connection, "Live connection error: {}", e);
                break;
            }
        }
    }

    // --- 3. Cleanup ---
    let released = app_state.sessions.remove_connection(connection).await;
    writer.abort();
    info!(
        connection = %connection,
        user_id = %actor.user_id,
        subscriptions = released,
        "live connection closed"
    );
}

fn ensure_self(actor: Actor, claimed: Option<Uuid>) -> CoreResult<()> {
    match claimed {
        Some(user_id) if user_id != actor.user_id => Err(CoreError::Authorization(
            "userId does not match the connection identity".into(),
        )),
        _ => Ok(()),
    }
}

async fn subscribe(
    app_state: &AppState,
    channel: Channel,
    connection: ConnectionId,
) -> CoreResult<Option<ServerMessage>> {
    if !app_state.sessions.subscribe(channel, connection).await {
        return Err(CoreError::NotFound("connection is closed".into()));
    }
    Ok(Some(ServerMessage::Subscribed {
        channel: channel.name(),
    }))
}

async fn unsubscribe(
    app_state: &AppState,
    channel: Channel,
    connection: ConnectionId,
) -> CoreResult<Option<ServerMessage>> {
    app_state.sessions.unsubscribe(channel, connection).await;
    Ok(Some(ServerMessage::Unsubscribed {
        channel: channel.name(),
    }))
}

/// Applies one client message. `Ok(None)` means nothing needs to be sent back.
pub(crate) async fn handle_client_message(
    app_state: &AppState,
    actor: Actor,
    connection: ConnectionId,
    message: ClientMessage,
) -> CoreResult<Option<ServerMessage>> {
    match message {
        ClientMessage::RegisterSocket { user_id } => {
            ensure_self(actor, Some(user_id))?;
            subscribe(app_state, Channel::User(user_id), connection).await
        }
        ClientMessage::ParentWatch { child_id } => {
            if actor.role != Role::Parent {
                return Err(CoreError::Authorization("only parents can watch".into()));
            }
            let child = app_state.db.get_user(child_id).await?;
            if !child.is_linked_to(actor.user_id) {
                return Err(CoreError::Authorization("not linked to this user".into()));
            }
            subscribe(app_state, Channel::ParentsOf(child_id), connection).await
        }
        ClientMessage::ParentUnwatch { child_id } => {
            unsubscribe(app_state, Channel::ParentsOf(child_id), connection).await
        }
        ClientMessage::JourneyJoin { journey_id } => {
            app_state.journeys.get(journey_id, actor).await?;
            subscribe(app_state, Channel::Journey(journey_id), connection).await
        }
        ClientMessage::JourneyLeave { journey_id } => {
            unsubscribe(app_state, Channel::Journey(journey_id), connection).await
        }
        ClientMessage::LocationUpdate(update) => {
            ensure_self(actor, update.user_id)?;
            app_state
                .tracker
                .ingest_location(actor, update.sample.into())
                .await?;
            Ok(None)
        }
        ClientMessage::SosSend(sos) => {
            ensure_self(actor, sos.user_id)?;
            let body = sos.sos;
            let action = match body.action.as_deref() {
                Some(raw) => raw.parse::<EmergencyActionKind>()?,
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
                .await?;
            Ok(Some(ServerMessage::SosSent {
                emergency_id: emergency.id,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use guardian_core::domain::{GeoPoint, User};
    use guardian_core::MemoryStore;

    struct Fixture {
        state: AppState,
        child: Actor,
        parent: Actor,
    }

    fn user(role: Role) -> User {
        User {
            id: Uuid::new_v4(),
            name: Some("Test".into()),
            phone: None,
            role,
            relations: vec![],
            last_location: None,
            device_tokens: vec![],
        }
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let child = user(Role::User);
        let parent = user(Role::Parent);
        store.seed_user(child.clone()).await;
        store.seed_user(parent.clone()).await;
        store.link(child.id, parent.id).await.unwrap();

        let config = Arc::new(Config::from_lookup(|_| None).unwrap());
        Fixture {
            state: AppState::new(Arc::new(store), config, vec![]),
            child: Actor {
                user_id: child.id,
                role: Role::User,
            },
            parent: Actor {
                user_id: parent.id,
                role: Role::Parent,
            },
        }
    }

    #[tokio::test]
    async fn parent_watch_requires_a_link() {
        let f = fixture().await;
        let (conn, _rx) = f.state.sessions.connect().await;

        let reply = handle_client_message(
            &f.state,
            f.parent,
            conn,
            ClientMessage::ParentWatch {
                child_id: f.child.user_id,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            reply,
            Some(ServerMessage::Subscribed {
                channel: Channel::ParentsOf(f.child.user_id).name()
            })
        );

        let stranger = Actor {
            user_id: Uuid::new_v4(),
            role: Role::Parent,
        };
        let err = handle_client_message(
            &f.state,
            stranger,
            conn,
            ClientMessage::ParentWatch {
                child_id: f.child.user_id,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::Authorization(_)));
    }

    #[tokio::test]
    async fn register_socket_rejects_a_foreign_identity() {
        let f = fixture().await;
        let (conn, _rx) = f.state.sessions.connect().await;
        let err = handle_client_message(
            &f.state,
            f.child,
            conn,
            ClientMessage::RegisterSocket {
                user_id: f.parent.user_id,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::Authorization(_)));
    }

    #[tokio::test]
    async fn watcher_receives_standalone_location_over_the_live_channel() {
        let f = fixture().await;
        let (parent_conn, mut parent_rx) = f.state.sessions.connect().await;
        handle_client_message(
            &f.state,
            f.parent,
            parent_conn,
            ClientMessage::ParentWatch {
                child_id: f.child.user_id,
            },
        )
        .await
        .unwrap();

        let (child_conn, _child_rx) = f.state.sessions.connect().await;
        let raw = r#"{"event":"location:update","data":{"lat":51.5,"lng":-0.12}}"#;
        let message = serde_json::from_str::<ClientMessage>(raw).unwrap();
        let reply = handle_client_message(&f.state, f.child, child_conn, message)
            .await
            .unwrap();
        assert!(reply.is_none());

        let event = parent_rx.recv().await.unwrap();
        assert_eq!(event.event, "location:update");
    }

    #[tokio::test]
    async fn sos_over_the_live_channel_is_recorded() {
        let f = fixture().await;
        let (conn, _rx) = f.state.sessions.connect().await;
        let raw = r#"{"event":"sos:send","data":{"location":{"type":"Point","coordinates":[-0.12,51.5]}}}"#;
        let message = serde_json::from_str::<ClientMessage>(raw).unwrap();
        let reply = handle_client_message(&f.state, f.child, conn, message)
            .await
            .unwrap();
        let Some(ServerMessage::SosSent { emergency_id }) = reply else {
            panic!("expected an SOS confirmation, got {:?}", reply);
        };

        let stored = f.state.journeys.emergency(emergency_id, f.parent).await.unwrap();
        assert_eq!(stored.action, EmergencyActionKind::SosCall);
        assert_eq!(stored.location, GeoPoint::new(51.5, -0.12).unwrap());
    }

    #[tokio::test]
    async fn leaving_a_channel_after_disconnect_is_harmless() {
        let f = fixture().await;
        let (conn, _rx) = f.state.sessions.connect().await;
        f.state.sessions.remove_connection(conn).await;
        let reply = handle_client_message(
            &f.state,
            f.child,
            conn,
            ClientMessage::JourneyLeave {
                journey_id: Uuid::new_v4(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(reply, Some(ServerMessage::Unsubscribed { .. })));
    }
}
