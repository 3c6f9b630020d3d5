//! crates/guardian_core/src/session.rs
//!
//! In-memory bookkeeping of live-channel subscriptions.
//!
//! A `SessionRegistry` is constructed once at startup and handed by clone to every
//! component that publishes. Nothing here is persisted: after a restart clients
//! reconnect and re-subscribe.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Identity of one live transport connection.
pub type ConnectionId = Uuid;

/// A logical room. Every ingress path derives room names through `Channel::name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// A user's (or parent's) own devices.
    User(Uuid),
    /// Everyone watching a tracked user.
    ParentsOf(Uuid),
    /// Everyone following one journey.
    Journey(Uuid),
}

impl Channel {
    pub fn name(&self) -> String {
        match self {
            Channel::User(id) => format!("user:{}", id),
            Channel::ParentsOf(id) => format!("parents_of:{}", id),
            Channel::Journey(id) => format!("journey:{}", id),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A server-to-client event: a name such as `journey:update` and its JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveEvent {
    pub event: String,
    pub data: serde_json::Value,
}

impl LiveEvent {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

struct Connection {
    sender: mpsc::UnboundedSender<LiveEvent>,
    channels: HashSet<Channel>,
}

#[derive(Default)]
struct Rooms {
    channels: HashMap<Channel, HashSet<ConnectionId>>,
    connections: HashMap<ConnectionId, Connection>,
}

impl Rooms {
    fn detach(&mut self, channel: Channel, connection: ConnectionId) {
        if let Some(members) = self.channels.get_mut(&channel) {
            members.remove(&connection);
            if members.is_empty() {
                self.channels.remove(&channel);
            }
        }
    }

    fn drop_connection(&mut self, connection: ConnectionId) -> usize {
        let Some(conn) = self.connections.remove(&connection) else {
            return 0;
        };
        let count = conn.channels.len();
        for channel in conn.channels {
            self.detach(channel, connection);
        }
        count
    }
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Rooms>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection and returns its id together with the receiving end
    /// of its outbound event queue.
    pub async fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<LiveEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.inner.write().await.connections.insert(
            id,
            Connection {
                sender,
                channels: HashSet::new(),
            },
        );
        debug!(connection = %id, "live connection registered");
        (id, receiver)
    }

    /// Returns `false` if the connection is unknown (already removed).
    pub async fn subscribe(&self, channel: Channel, connection: ConnectionId) -> bool {
        let mut rooms = self.inner.write().await;
        let Some(conn) = rooms.connections.get_mut(&connection) else {
            return false;
        };
        conn.channels.insert(channel);
        rooms.channels.entry(channel).or_default().insert(connection);
        info!(connection = %connection, channel = %channel, "subscribed");
        true
    }

    pub async fn unsubscribe(&self, channel: Channel, connection: ConnectionId) {
        let mut rooms = self.inner.write().await;
        if let Some(conn) = rooms.connections.get_mut(&connection) {
            conn.channels.remove(&channel);
        }
        rooms.detach(channel, connection);
        info!(connection = %connection, channel = %channel, "unsubscribed");
    }

    /// Removes the connection from every channel it joined. Returns how many
    /// subscriptions were released.
    pub async fn remove_connection(&self, connection: ConnectionId) -> usize {
        let released = self.inner.write().await.drop_connection(connection);
        info!(connection = %connection, released, "live connection removed");
        released
    }

    /// Delivers to every subscriber of `channel`. A no-op without subscribers.
    pub async fn publish(&self, channel: Channel, event: LiveEvent) -> usize {
        self.publish_many(&[channel], event).await
    }

    /// Delivers once to every connection subscribed to at least one of `channels`.
    /// Returns the number of connections reached.
    pub async fn publish_many(&self, channels: &[Channel], event: LiveEvent) -> usize {
        let mut dead = Vec::new();
        let delivered = {
            let rooms = self.inner.read().await;
            let targets: HashSet<ConnectionId> = channels
                .iter()
                .filter_map(|c| rooms.channels.get(c))
                .flat_map(|members| members.iter().copied())
                .collect();

            let mut delivered = 0;
            for id in targets {
                match rooms.connections.get(&id) {
                    Some(conn) if conn.sender.send(event.clone()).is_ok() => delivered += 1,
                    _ => dead.push(id),
                }
            }
            delivered
        };

        // Receivers that went away without a disconnect signal.
        if !dead.is_empty() {
            let mut rooms = self.inner.write().await;
            for id in dead {
                rooms.drop_connection(id);
            }
        }
        debug!(event = %event.event, delivered, "published live event");
        delivered
    }

    pub async fn subscriber_count(&self, channel: Channel) -> usize {
        self.inner
            .read()
            .await
            .channels
            .get(&channel)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_names_are_deterministic() {
        let id = Uuid::nil();
        assert_eq!(
            Channel::ParentsOf(id).name(),
            "parents_of:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(Channel::Journey(id).to_string(), Channel::Journey(id).name());
        assert_ne!(Channel::User(id).name(), Channel::ParentsOf(id).name());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let registry = SessionRegistry::new();
        let delivered = registry
            .publish(Channel::Journey(Uuid::new_v4()), LiveEvent::new("journey:update", json!({})))
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let registry = SessionRegistry::new();
        let (conn, mut rx) = registry.connect().await;
        let channel = Channel::ParentsOf(Uuid::new_v4());
        assert!(registry.subscribe(channel, conn).await);

        let delivered = registry
            .publish(channel, LiveEvent::new("location:update", json!({ "lat": 1.0 })))
            .await;
        assert_eq!(delivered, 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "location:update");
        assert_eq!(event.data["lat"], 1.0);
    }

    #[tokio::test]
    async fn overlapping_channels_deliver_once_per_connection() {
        let registry = SessionRegistry::new();
        let (conn, mut rx) = registry.connect().await;
        let journey = Channel::Journey(Uuid::new_v4());
        let parents = Channel::ParentsOf(Uuid::new_v4());
        registry.subscribe(journey, conn).await;
        registry.subscribe(parents, conn).await;

        let delivered = registry
            .publish_many(&[journey, parents], LiveEvent::new("safety:alert", json!({})))
            .await;
        assert_eq!(delivered, 1);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn remove_connection_releases_every_subscription() {
        let registry = SessionRegistry::new();
        let (conn, _rx) = registry.connect().await;
        let a = Channel::Journey(Uuid::new_v4());
        let b = Channel::User(Uuid::new_v4());
        registry.subscribe(a, conn).await;
        registry.subscribe(b, conn).await;

        assert_eq!(registry.remove_connection(conn).await, 2);
        assert_eq!(registry.subscriber_count(a).await, 0);
        assert_eq!(registry.subscriber_count(b).await, 0);
        assert_eq!(registry.connection_count().await, 0);
        assert!(!registry.subscribe(a, conn).await);
    }

    #[tokio::test]
    async fn unsubscribe_leaves_other_channels_intact() {
        let registry = SessionRegistry::new();
        let (conn, _rx) = registry.connect().await;
        let a = Channel::Journey(Uuid::new_v4());
        let b = Channel::ParentsOf(Uuid::new_v4());
        registry.subscribe(a, conn).await;
        registry.subscribe(b, conn).await;
        registry.unsubscribe(a, conn).await;

        assert_eq!(registry.subscriber_count(a).await, 0);
        assert_eq!(registry.subscriber_count(b).await, 1);
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned_on_publish() {
        let registry = SessionRegistry::new();
        let (conn, rx) = registry.connect().await;
        let channel = Channel::Journey(Uuid::new_v4());
        registry.subscribe(channel, conn).await;
        drop(rx);

        assert_eq!(registry.publish(channel, LiveEvent::new("x", json!(null))).await, 0);
        assert_eq!(registry.subscriber_count(channel).await, 0);
        assert_eq!(registry.connection_count().await, 0);
    }
}
