//! crates/guardian_core/src/tracking.rs
//!
//! Entry points shared by the HTTP and live-channel ingress paths for location
//! samples and SOS triggers that may or may not belong to a journey.

use crate::domain::{
    Actor, EmergencyAction, EmergencyActionKind, EmergencyRequest, GeoPoint, LocationSample,
    TimedPoint,
};
use crate::error::{CoreError, CoreResult};
use crate::fanout::{AlertFanoutDispatcher, FanoutEvent};
use crate::journey::{JourneyStateMachine, LocationOutcome};
use crate::ports::DatabaseService;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Where an ingested sample ended up.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestOutcome {
    Journey(LocationOutcome),
    Standalone { location: TimedPoint },
}

#[derive(Debug, Clone)]
pub struct SosRequest {
    pub action: EmergencyActionKind,
    pub location: GeoPoint,
    pub message: Option<String>,
    pub audio_url: Option<String>,
}

pub struct LiveTracker {
    db: Arc<dyn DatabaseService>,
    journeys: Arc<JourneyStateMachine>,
    dispatcher: Arc<AlertFanoutDispatcher>,
}

impl LiveTracker {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        journeys: Arc<JourneyStateMachine>,
        dispatcher: Arc<AlertFanoutDispatcher>,
    ) -> Self {
        Self { db, journeys, dispatcher }
    }

    /// Routes a sample into the caller's in-progress journey, or records it as the
    /// caller's last known location and publishes it live.
    pub async fn ingest_location(&self, actor: Actor, sample: LocationSample) -> CoreResult<IngestOutcome> {
        if let Some(journey) = self.db.find_in_progress_journey(actor.user_id).await? {
            let outcome = self.journeys.record_location(journey.id, actor, sample).await?;
            return Ok(IngestOutcome::Journey(outcome));
        }

        let point = GeoPoint::new(sample.lat, sample.lng)?;
        let now = Utc::now();
        let location = TimedPoint {
            point,
            updated_at: sample.timestamp.map(|t| t.min(now)).unwrap_or(now),
        };
        self.db.update_user_location(actor.user_id, location).await?;
        self.dispatcher
            .dispatch_for_user(actor.user_id, FanoutEvent::UserLocation(location))
            .await;
        debug!(user_id = %actor.user_id, "standalone location recorded");
        Ok(IngestOutcome::Standalone { location })
    }

    /// Raises an SOS for the caller, attached to their in-progress journey if any.
    pub async fn send_sos(&self, actor: Actor, request: SosRequest) -> CoreResult<EmergencyAction> {
        let journey_id = self
            .db
            .find_in_progress_journey(actor.user_id)
            .await?
            .map(|j| j.id);
        self.journeys
            .trigger_emergency(
                actor,
                EmergencyRequest {
                    user_id: actor.user_id,
                    journey_id,
                    action: request.action,
                    location: request.location,
                    message: request.message,
                    audio_url: request.audio_url,
                },
            )
            .await
    }

    /// Last known location of `user_id`, visible to the user and their linked parents.
    pub async fn latest_location(&self, actor: Actor, user_id: Uuid) -> CoreResult<Option<TimedPoint>> {
        let user = self.db.get_user(user_id).await?;
        if user.id != actor.user_id && !user.is_linked_to(actor.user_id) {
            return Err(CoreError::Authorization("not linked to this user".into()));
        }
        Ok(user.last_location)
    }
}
