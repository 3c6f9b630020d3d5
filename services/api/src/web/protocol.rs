//! services/api/src/web/protocol.rs
//!
//! Defines the live-channel message protocol between clients and the API server.
//!
//! Every frame is a JSON text message of the form `{"event": "...", "data": {...}}`.
//! Server-to-client frames are `LiveEvent`s, the same shape the core publishes.

use crate::web::rest::{LocationSampleRequest, SosBody};
use guardian_core::LiveEvent;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

//=========================================================================================
// Messages Sent FROM the Client TO the Server
//=========================================================================================

/// A device sample pushed over the live channel.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveLocation {
    /// Must match the connection's identity when present.
    pub user_id: Option<Uuid>,
    #[serde(flatten)]
    pub sample: LocationSampleRequest,
}

/// An SOS raised over the live channel.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSos {
    pub user_id: Option<Uuid>,
    #[serde(flatten)]
    pub sos: SosBody,
}

/// Represents the structured messages a client can send to the server.
#[derive(Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    /// Joins the caller's own channel. Sent once after connecting.
    #[serde(rename = "register_socket", rename_all = "camelCase")]
    RegisterSocket { user_id: Uuid },

    /// A parent starts receiving a linked child's events.
    #[serde(rename = "parent:watch", rename_all = "camelCase")]
    ParentWatch { child_id: Uuid },

    #[serde(rename = "parent:unwatch", rename_all = "camelCase")]
    ParentUnwatch { child_id: Uuid },

    /// Follows a single journey the caller may view.
    #[serde(rename = "journey:join", rename_all = "camelCase")]
    JourneyJoin { journey_id: Uuid },

    #[serde(rename = "journey:leave", rename_all = "camelCase")]
    JourneyLeave { journey_id: Uuid },

    #[serde(rename = "location:update")]
    LocationUpdate(LiveLocation),

    #[serde(rename = "sos:send")]
    SosSend(LiveSos),
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client
//=========================================================================================

/// Replies to client messages. Domain events arrive as plain `LiveEvent`s.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Confirms a subscription to a named channel.
    Subscribed { channel: String },
    Unsubscribed { channel: String },
    /// Confirms an SOS raised over the live channel.
    SosSent { emergency_id: Uuid },
    /// Reports a rejected message. The connection stays open.
    Error { message: String },
}

impl From<ServerMessage> for LiveEvent {
    fn from(message: ServerMessage) -> Self {
        match message {
            ServerMessage::Subscribed { channel } => {
                LiveEvent::new("subscribed", json!({ "channel": channel }))
            }
            ServerMessage::Unsubscribed { channel } => {
                LiveEvent::new("unsubscribed", json!({ "channel": channel }))
            }
            ServerMessage::SosSent { emergency_id } => {
                LiveEvent::new("sos:sent", json!({ "emergencyId": emergency_id }))
            }
            ServerMessage::Error { message } => LiveEvent::new("error", json!({ "message": message })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_use_their_wire_names() {
        let child = Uuid::new_v4();
        let raw = format!(r#"{{"event":"parent:watch","data":{{"childId":"{}"}}}}"#, child);
        match serde_json::from_str::<ClientMessage>(&raw).unwrap() {
            ClientMessage::ParentWatch { child_id } => assert_eq!(child_id, child),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn location_update_carries_flat_coordinates() {
        let raw = r#"{"event":"location:update","data":{"lat":51.5,"lng":-0.12,"batteryLevel":40}}"#;
        match serde_json::from_str::<ClientMessage>(raw).unwrap() {
            ClientMessage::LocationUpdate(update) => {
                assert!(update.user_id.is_none());
                assert_eq!(update.sample.lat, 51.5);
                assert_eq!(update.sample.battery_level, Some(40.0));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn sos_location_is_a_geojson_point() {
        let raw = r#"{"event":"sos:send","data":{"location":{"type":"Point","coordinates":[-0.12,51.5]},"message":"help"}}"#;
        match serde_json::from_str::<ClientMessage>(raw).unwrap() {
            ClientMessage::SosSend(sos) => {
                assert_eq!(sos.sos.location.lat, 51.5);
                assert_eq!(sos.sos.message.as_deref(), Some("help"));
                assert!(sos.sos.action.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_events_are_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"event":"reading:start","data":{}}"#).is_err());
    }

    #[test]
    fn errors_are_sent_as_error_events() {
        let event: LiveEvent = ServerMessage::Error {
            message: "not linked".into(),
        }
        .into();
        assert_eq!(event.event, "error");
        assert_eq!(event.data["message"], "not linked");
    }
}
