//! crates/guardian_core/src/journey.rs
//!
//! The journey lifecycle: creation, activation, location ingestion, checkpoints,
//! completion and emergencies.
//!
//! Every status change goes through `transition`, which consults the single
//! `ALLOWED_TRANSITIONS` table. Operations on one journey are serialized through a
//! per-journey lock so a journey's location stream is processed in submission order;
//! distinct journeys proceed concurrently.

use crate::alerts::SafetyAlertEvaluator;
use crate::domain::{
    Actor, AlertType, Checkpoint, CheckpointStatus, EmergencyAction, EmergencyRequest, GeoPoint,
    Journey, JourneyMetrics, JourneyStatus, LocationSample, LocationUpdate, NewJourney,
    ParentNotification, Role, SafetyAlert, TimedPoint, MOVING_SPEED_THRESHOLD_KMH,
};
use crate::error::{CoreError, CoreResult};
use crate::fanout::{resolve_recipients, AlertFanoutDispatcher, FanoutEvent};
use crate::geo::initial_bearing_deg;
use crate::ports::{DatabaseService, Page};
use crate::progress::ProgressEstimator;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

//=========================================================================================
// Transition table
//=========================================================================================

const ALLOWED_TRANSITIONS: &[(JourneyStatus, &[JourneyStatus])] = &[
    (JourneyStatus::Planned, &[JourneyStatus::Active, JourneyStatus::Cancelled]),
    (
        JourneyStatus::Active,
        &[JourneyStatus::Completed, JourneyStatus::Cancelled, JourneyStatus::Emergency],
    ),
    (
        JourneyStatus::Emergency,
        &[
            JourneyStatus::Active,
            JourneyStatus::Completed,
            JourneyStatus::Cancelled,
            JourneyStatus::Emergency,
        ],
    ),
    (JourneyStatus::Completed, &[]),
    (JourneyStatus::Cancelled, &[]),
];

pub fn can_transition(from: JourneyStatus, to: JourneyStatus) -> bool {
    ALLOWED_TRANSITIONS
        .iter()
        .find(|(state, _)| *state == from)
        .map(|(_, next)| next.contains(&to))
        .unwrap_or(false)
}

fn transition(journey: &mut Journey, next: JourneyStatus) -> CoreResult<()> {
    if journey.end_time.is_some() {
        return Err(CoreError::Conflict(format!("journey {} has already ended", journey.id)));
    }
    if !can_transition(journey.status, next) {
        return Err(CoreError::Conflict(format!(
            "journey {} cannot move from {} to {}",
            journey.id, journey.status, next
        )));
    }
    debug!(journey_id = %journey.id, from = %journey.status, to = %next, "journey transition");
    journey.status = next;
    journey.updated_at = Utc::now();
    Ok(())
}

//=========================================================================================
// Per-journey ordering
//=========================================================================================

#[derive(Default)]
struct JourneyLocks {
    inner: Mutex<HashMap<Uuid, Weak<Mutex<()>>>>,
}

impl JourneyLocks {
    async fn acquire(&self, journey_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.retain(|_, weak| weak.strong_count() > 0);
            match map.get(&journey_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    map.insert(journey_id, Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}

//=========================================================================================
// Operation results
//=========================================================================================

/// Result of ingesting one location sample into a journey.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationOutcome {
    pub update: LocationUpdate,
    pub progress: f64,
    pub alerts: Vec<SafetyAlert>,
}

/// An in-progress journey as seen by a watching parent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJourneyView {
    pub journey: Journey,
    pub latest_location: Option<LocationUpdate>,
    pub progress: f64,
}

//=========================================================================================
// The state machine
//=========================================================================================

pub struct JourneyStateMachine {
    db: Arc<dyn DatabaseService>,
    dispatcher: Arc<AlertFanoutDispatcher>,
    evaluator: SafetyAlertEvaluator,
    estimator: ProgressEstimator,
    locks: JourneyLocks,
}

impl JourneyStateMachine {
    pub fn new(db: Arc<dyn DatabaseService>, dispatcher: Arc<AlertFanoutDispatcher>) -> Self {
        Self {
            db,
            dispatcher,
            evaluator: SafetyAlertEvaluator::default(),
            estimator: ProgressEstimator::default(),
            locks: JourneyLocks::default(),
        }
    }

    pub fn with_evaluator(mut self, evaluator: SafetyAlertEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_estimator(mut self, estimator: ProgressEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn estimator(&self) -> &ProgressEstimator {
        &self.estimator
    }

    // --- Lifecycle ---

    /// Creates a journey in `planned`.
    pub async fn create(&self, actor: Actor, input: NewJourney) -> CoreResult<Journey> {
        if actor.role != Role::User {
            return Err(CoreError::Authorization("only tracked users own journeys".into()));
        }
        let start_location = input
            .start_location
            .ok_or_else(|| CoreError::Validation("startLocation is required".into()))?;
        let destination = input
            .destination
            .ok_or_else(|| CoreError::Validation("destination is required".into()))?;
        let scheduled_time = input
            .scheduled_time
            .ok_or_else(|| CoreError::Validation("scheduledTime is required".into()))?;

        let owner = self.db.get_user(actor.user_id).await?;
        let mut shared_with_parents = Vec::new();
        for parent in input.shared_with_parents {
            if !owner.is_linked_to(parent) {
                return Err(CoreError::Validation(format!(
                    "cannot share with {}: not a linked parent",
                    parent
                )));
            }
            if !shared_with_parents.contains(&parent) {
                shared_with_parents.push(parent);
            }
        }

        let now = Utc::now();
        let journey = Journey {
            id: Uuid::new_v4(),
            user_id: actor.user_id,
            start_location,
            destination,
            planned_route: input.planned_route,
            transport_mode: input.transport_mode.unwrap_or_default(),
            scheduled_time,
            status: JourneyStatus::Planned,
            start_time: None,
            end_time: None,
            actual_duration: None,
            metrics: None,
            shared_with_parents,
            checkpoints: Vec::new(),
            last_known_location: None,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_journey(&journey).await?;
        info!(journey_id = %journey.id, user_id = %journey.user_id, "journey planned");
        Ok(journey)
    }

    /// Moves a planned journey to `active`. At most one journey per user may be in
    /// progress; a second activation fails with `Conflict`.
    pub async fn activate(
        &self,
        journey_id: Uuid,
        actor: Actor,
        current_position: Option<GeoPoint>,
    ) -> CoreResult<Journey> {
        let _guard = self.locks.acquire(journey_id).await;
        let mut journey = self.db.get_journey(journey_id).await?;
        ensure_owner(&journey, actor)?;

        if journey.is_in_progress() {
            return Err(CoreError::Conflict(format!("journey {} is already active", journey_id)));
        }
        if let Some(existing) = self.db.find_in_progress_journey(journey.user_id).await? {
            return Err(CoreError::Conflict(format!(
                "journey {} is already active for this user",
                existing.id
            )));
        }

        let previous = journey.status;
        transition(&mut journey, JourneyStatus::Active)?;
        let now = Utc::now();
        journey.start_time = Some(now);
        if let Some(position) = current_position {
            journey.start_location.point = position;
            journey.last_known_location = Some(TimedPoint { point: position, updated_at: now });
        }
        self.db.update_journey(&journey, previous).await?;
        info!(journey_id = %journey.id, user_id = %journey.user_id, "journey started");

        if let Some(position) = current_position {
            let update = build_update(&journey, &LocationSample::at(position), None, now);
            self.db.insert_location_update(&update).await?;
            self.touch_user_location(journey.user_id, position, now).await;
        }

        self.dispatcher.dispatch(&journey, FanoutEvent::JourneyStarted).await;
        Ok(journey)
    }

    /// Ingests one sample: persists it, derives progress, raises alerts and publishes
    /// the position to live subscribers.
    pub async fn record_location(
        &self,
        journey_id: Uuid,
        actor: Actor,
        sample: LocationSample,
    ) -> CoreResult<LocationOutcome> {
        let point = validate_sample(&sample)?;
        let _guard = self.locks.acquire(journey_id).await;
        let mut journey = self.db.get_journey(journey_id).await?;
        ensure_owner(&journey, actor)?;
        if !journey.is_in_progress() {
            return Err(CoreError::Conflict(format!("journey {} is not in progress", journey_id)));
        }

        let now = Utc::now();
        let previous = journey.last_known_location.map(|l| l.point);
        let update = build_update(&journey, &sample, previous, now);
        self.db.insert_location_update(&update).await?;

        journey.last_known_location = Some(TimedPoint { point, updated_at: update.timestamp });
        journey.updated_at = now;
        self.db.update_journey(&journey, journey.status).await?;
        self.touch_user_location(journey.user_id, point, update.timestamp).await;

        let progress = self.estimator.estimate(&journey, point);

        let history = self
            .db
            .recent_location_updates(journey.id, self.evaluator.history_since(&update))
            .await?;
        let open = self.db.open_alert_types(journey.id).await?;
        let mut alerts = Vec::new();
        for candidate in self.evaluator.evaluate(&journey, &update, &history, &open) {
            if let Some(alert) = self.raise_alert(&journey, candidate).await? {
                alerts.push(alert);
            }
        }

        self.dispatcher
            .dispatch(&journey, FanoutEvent::Location { update: update.clone(), progress })
            .await;

        debug!(journey_id = %journey.id, progress, alerts = alerts.len(), "location recorded");
        Ok(LocationOutcome { update, progress, alerts })
    }

    /// Appends a checkpoint. `unsafe` and `no_response` flag the journey as an
    /// emergency; a `safe` checkpoint from the owner clears the flag.
    pub async fn record_checkpoint(
        &self,
        journey_id: Uuid,
        actor: Actor,
        status: CheckpointStatus,
        location: GeoPoint,
        audio_url: Option<String>,
    ) -> CoreResult<Journey> {
        let _guard = self.locks.acquire(journey_id).await;
        let mut journey = self.db.get_journey(journey_id).await?;
        let is_owner = journey.user_id == actor.user_id;
        if !is_owner {
            // Parents may report a missed check-in, nothing else.
            if status != CheckpointStatus::NoResponse || !self.is_recipient(&journey, actor).await? {
                return Err(CoreError::Authorization(
                    "not allowed to record checkpoints on this journey".into(),
                ));
            }
        }
        if !journey.is_in_progress() {
            return Err(CoreError::Conflict(format!("journey {} is not in progress", journey_id)));
        }

        let previous = journey.status;
        match status {
            CheckpointStatus::Unsafe | CheckpointStatus::NoResponse => {
                transition(&mut journey, JourneyStatus::Emergency)?
            }
            CheckpointStatus::Safe if previous == JourneyStatus::Emergency && is_owner => {
                transition(&mut journey, JourneyStatus::Active)?
            }
            CheckpointStatus::Safe => {}
        }

        let now = Utc::now();
        let checkpoint = Checkpoint {
            timestamp: now,
            status,
            location,
            audio_url,
            recorded_by: actor.user_id,
        };
        journey.checkpoints.push(checkpoint.clone());
        journey.last_known_location = Some(TimedPoint { point: location, updated_at: now });
        journey.updated_at = now;
        self.db.update_journey(&journey, previous).await?;
        info!(
            journey_id = %journey.id,
            status = status.as_str(),
            journey_status = %journey.status,
            "checkpoint recorded"
        );

        self.dispatcher.dispatch(&journey, FanoutEvent::Checkpoint(checkpoint)).await;
        Ok(journey)
    }

    /// Ends a journey with `completed` (default), `cancelled` or `emergency`.
    ///
    /// In-progress journeys get their duration and metrics computed; a normal
    /// completion raises a `safe_arrival` alert. A planned journey can only be
    /// cancelled.
    pub async fn complete(
        &self,
        journey_id: Uuid,
        actor: Actor,
        final_status: Option<JourneyStatus>,
        current_position: Option<GeoPoint>,
    ) -> CoreResult<Journey> {
        let final_status = final_status.unwrap_or(JourneyStatus::Completed);
        if !matches!(
            final_status,
            JourneyStatus::Completed | JourneyStatus::Cancelled | JourneyStatus::Emergency
        ) {
            return Err(CoreError::Validation(format!(
                "'{}' is not a valid final status",
                final_status
            )));
        }

        let _guard = self.locks.acquire(journey_id).await;
        let mut journey = self.db.get_journey(journey_id).await?;
        ensure_owner(&journey, actor)?;
        if journey.end_time.is_some() || journey.status.is_terminal() {
            return Err(CoreError::Conflict(format!("journey {} has already ended", journey_id)));
        }
        let was_in_progress = journey.is_in_progress();
        if !was_in_progress && final_status != JourneyStatus::Cancelled {
            return Err(CoreError::Conflict(format!("journey {} is not active", journey_id)));
        }

        let previous = journey.status;
        if previous != final_status {
            transition(&mut journey, final_status)?;
        }

        let now = Utc::now();
        if let Some(position) = current_position.filter(|_| was_in_progress) {
            let last = journey.last_known_location.map(|l| l.point);
            let update = build_update(&journey, &LocationSample::at(position), last, now);
            self.db.insert_location_update(&update).await?;
            journey.last_known_location = Some(TimedPoint { point: position, updated_at: now });
            self.touch_user_location(journey.user_id, position, now).await;
        }

        journey.end_time = Some(now);
        if let Some(start) = journey.start_time {
            let end = now.max(start);
            journey.end_time = Some(end);
            journey.actual_duration = Some((end - start).num_seconds());
        }
        if was_in_progress {
            journey.metrics = Some(self.compute_metrics(&journey).await?);
        }
        journey.updated_at = now;
        self.db.update_journey(&journey, previous).await?;
        info!(
            journey_id = %journey.id,
            status = %journey.status,
            duration_secs = ?journey.actual_duration,
            "journey ended"
        );

        match final_status {
            JourneyStatus::Completed => {
                let at = journey
                    .last_known_location
                    .map(|l| l.point)
                    .unwrap_or(journey.destination.point);
                let alert = self.evaluator.safe_arrival(&journey, at, now);
                self.raise_alert(&journey, alert).await?;
                self.dispatcher.dispatch(&journey, FanoutEvent::JourneyCompleted).await;
            }
            JourneyStatus::Cancelled => {
                self.dispatcher.dispatch(&journey, FanoutEvent::JourneyCancelled).await;
            }
            _ => {
                self.dispatcher.dispatch(&journey, FanoutEvent::JourneyCompleted).await;
            }
        }
        Ok(journey)
    }

    /// Records an SOS / emergency action and always fans it out; emergencies are
    /// never de-duplicated. With a journey, the journey is flagged `emergency` and an
    /// `emergency` alert is recorded if none is open. That alert is only published
    /// live; parents are notified once, for the action.
    pub async fn trigger_emergency(
        &self,
        actor: Actor,
        request: EmergencyRequest,
    ) -> CoreResult<EmergencyAction> {
        let acting_for_self = actor.user_id == request.user_id;
        if !acting_for_self && request.action.is_user_initiated() {
            return Err(CoreError::Authorization(format!(
                "{} can only be triggered by the user",
                request.action.as_str()
            )));
        }

        let mut action = EmergencyAction {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            journey_id: request.journey_id,
            action: request.action,
            location: request.location,
            message: request.message,
            audio_url: request.audio_url,
            notified_parents: Vec::new(),
            created_at: Utc::now(),
        };

        let report = match request.journey_id {
            Some(journey_id) => {
                let _guard = self.locks.acquire(journey_id).await;
                let mut journey = self.db.get_journey(journey_id).await?;
                if journey.user_id != request.user_id {
                    return Err(CoreError::Validation(format!(
                        "journey {} does not belong to user {}",
                        journey_id, request.user_id
                    )));
                }
                if !acting_for_self && !self.is_recipient(&journey, actor).await? {
                    return Err(CoreError::Authorization("not linked to this journey".into()));
                }
                if !journey.is_in_progress() {
                    return Err(CoreError::Conflict(format!(
                        "journey {} is not active",
                        journey_id
                    )));
                }

                let previous = journey.status;
                transition(&mut journey, JourneyStatus::Emergency)?;
                journey.last_known_location = Some(TimedPoint {
                    point: action.location,
                    updated_at: action.created_at,
                });
                self.db.update_journey(&journey, previous).await?;

                // The alert shares the action's delivery ledger.
                let alert = self.evaluator.emergency(&journey, action.action, action.location);
                let raised = self.admit_alert(&journey, &alert).await?;
                if raised {
                    self.dispatcher
                        .publish_live(&journey, FanoutEvent::Alert(alert.clone()))
                        .await;
                }
                let report = self
                    .dispatcher
                    .dispatch(&journey, FanoutEvent::Emergency(action.clone()))
                    .await;
                if raised {
                    self.save_ledger(alert.id, &report.recipients).await;
                }
                report
            }
            None => {
                if !acting_for_self && !self.is_linked(request.user_id, actor).await? {
                    return Err(CoreError::Authorization("not linked to this user".into()));
                }
                self.dispatcher
                    .dispatch_for_user(request.user_id, FanoutEvent::Emergency(action.clone()))
                    .await
            }
        };

        if acting_for_self {
            self.touch_user_location(action.user_id, action.location, action.created_at).await;
        }
        action.notified_parents = report.recipients;
        self.db.insert_emergency_action(&action).await?;
        warn!(
            emergency_id = %action.id,
            user_id = %action.user_id,
            journey_id = ?action.journey_id,
            action = action.action.as_str(),
            notified = action.notified_parents.iter().filter(|p| p.delivered).count(),
            "emergency recorded"
        );
        Ok(action)
    }

    // --- Alerts ---

    /// Marks an alert resolved. Frees the de-duplication slot for its type.
    pub async fn resolve_alert(&self, alert_id: Uuid, actor: Actor) -> CoreResult<SafetyAlert> {
        let alert = self.db.get_alert(alert_id).await?;
        let journey = self.db.get_journey(alert.journey_id).await?;
        self.ensure_can_view(&journey, actor).await?;
        if !self
            .db
            .mark_alert_resolved(alert_id, actor.user_id, Utc::now())
            .await?
        {
            return Err(CoreError::Conflict(format!("alert {} is already resolved", alert_id)));
        }
        let alert = self.db.get_alert(alert_id).await?;
        info!(alert_id = %alert.id, alert_type = %alert.alert_type, resolved_by = %actor.user_id, "alert resolved");

        self.dispatcher
            .dispatch(&journey, FanoutEvent::AlertResolved(alert.clone()))
            .await;
        Ok(alert)
    }

    /// Records a parent's acknowledgement in the alert's delivery ledger.
    pub async fn acknowledge_alert(&self, alert_id: Uuid, actor: Actor) -> CoreResult<SafetyAlert> {
        let alert = self.db.get_alert(alert_id).await?;
        if !alert.notified_parents.iter().any(|p| p.parent == actor.user_id) {
            return Err(CoreError::Authorization("alert was not sent to this parent".into()));
        }
        if self
            .db
            .mark_alert_acknowledged(alert_id, actor.user_id, Utc::now())
            .await?
        {
            info!(alert_id = %alert_id, parent = %actor.user_id, "alert acknowledged");
            return Ok(self.db.get_alert(alert_id).await?);
        }
        Ok(alert)
    }

    pub async fn alerts_for_journey(&self, journey_id: Uuid, actor: Actor) -> CoreResult<Vec<SafetyAlert>> {
        let journey = self.db.get_journey(journey_id).await?;
        self.ensure_can_view(&journey, actor).await?;
        Ok(self.db.list_alerts_for_journey(journey_id).await?)
    }

    // --- Reads ---

    pub async fn get(&self, journey_id: Uuid, actor: Actor) -> CoreResult<Journey> {
        let journey = self.db.get_journey(journey_id).await?;
        self.ensure_can_view(&journey, actor).await?;
        Ok(journey)
    }

    pub async fn current(&self, actor: Actor) -> CoreResult<Option<Journey>> {
        Ok(self.db.find_in_progress_journey(actor.user_id).await?)
    }

    /// In-progress journeys a parent may watch, with their latest sample and progress.
    pub async fn active_for_parent(&self, actor: Actor) -> CoreResult<Vec<ActiveJourneyView>> {
        if actor.role != Role::Parent {
            return Err(CoreError::Authorization("only parents can watch journeys".into()));
        }
        let parent = self.db.get_user(actor.user_id).await?;
        let journeys = self
            .db
            .list_in_progress_journeys_for_parent(parent.id, &parent.relations)
            .await?;

        let mut views = Vec::with_capacity(journeys.len());
        for journey in journeys {
            // A journey with an explicit share list is only visible to those parents.
            if !journey.shared_with_parents.is_empty()
                && !journey.shared_with_parents.contains(&parent.id)
            {
                continue;
            }
            let latest_location = self.db.latest_location_update(journey.id).await?;
            let position = latest_location
                .as_ref()
                .map(|u| u.location)
                .or(journey.last_known_location.map(|l| l.point))
                .unwrap_or(journey.start_location.point);
            let progress = self.estimator.estimate(&journey, position);
            views.push(ActiveJourneyView {
                journey,
                latest_location,
                progress,
            });
        }
        Ok(views)
    }

    /// Journey history of the actor, or of a linked child when `child_id` is given.
    pub async fn history(
        &self,
        actor: Actor,
        child_id: Option<Uuid>,
        page: Page,
    ) -> CoreResult<Vec<Journey>> {
        let owner = match child_id {
            Some(child) if child != actor.user_id => {
                if !self.is_linked(child, actor).await? {
                    return Err(CoreError::Authorization("not linked to this user".into()));
                }
                child
            }
            _ => actor.user_id,
        };
        Ok(self.db.list_journey_history(owner, page).await?)
    }

    pub async fn emergency(&self, emergency_id: Uuid, actor: Actor) -> CoreResult<EmergencyAction> {
        let action = self.db.get_emergency_action(emergency_id).await?;
        if action.user_id != actor.user_id && !self.is_linked(action.user_id, actor).await? {
            return Err(CoreError::Authorization("not linked to this user".into()));
        }
        Ok(action)
    }

    pub async fn emergency_history(
        &self,
        actor: Actor,
        child_id: Option<Uuid>,
        page: Page,
    ) -> CoreResult<Vec<EmergencyAction>> {
        let owner = match child_id {
            Some(child) if child != actor.user_id => {
                if !self.is_linked(child, actor).await? {
                    return Err(CoreError::Authorization("not linked to this user".into()));
                }
                child
            }
            _ => actor.user_id,
        };
        Ok(self.db.list_emergency_actions(owner, page).await?)
    }

    // --- Helpers ---

    /// Persists the alert through the de-duplication gate, fans it out, then saves the
    /// delivery ledger. Returns `None` when an unresolved alert of the same type exists.
    async fn raise_alert(
        &self,
        journey: &Journey,
        mut alert: SafetyAlert,
    ) -> CoreResult<Option<SafetyAlert>> {
        if !self.admit_alert(journey, &alert).await? {
            return Ok(None);
        }
        let report = self
            .dispatcher
            .dispatch(journey, FanoutEvent::Alert(alert.clone()))
            .await;
        self.save_ledger(alert.id, &report.recipients).await;
        alert.notified_parents = report.recipients;
        Ok(Some(alert))
    }

    /// Passes the alert through the de-duplication gate.
    async fn admit_alert(&self, journey: &Journey, alert: &SafetyAlert) -> CoreResult<bool> {
        if !self.db.insert_alert_if_absent(alert).await? {
            debug!(journey_id = %journey.id, alert_type = %alert.alert_type, "alert suppressed: one is already open");
            return Ok(false);
        }
        info!(
            journey_id = %journey.id,
            alert_id = %alert.id,
            alert_type = %alert.alert_type,
            severity = alert.severity.as_str(),
            "safety alert raised"
        );
        Ok(true)
    }

    /// Writes only the ledger, so a resolution made during the fanout survives.
    async fn save_ledger(&self, alert_id: Uuid, ledger: &[ParentNotification]) {
        if let Err(e) = self.db.save_alert_ledger(alert_id, ledger).await {
            // The alert itself is stored; only its ledger is missing.
            warn!(alert_id = %alert_id, error = %e, "failed to save alert delivery ledger");
        }
    }

    async fn compute_metrics(&self, journey: &Journey) -> CoreResult<JourneyMetrics> {
        let samples = self.db.location_updates_for_journey(journey.id).await?;
        let alerts = self.db.list_alerts_for_journey(journey.id).await?;
        let alert_count = alerts
            .iter()
            .filter(|a| a.alert_type != AlertType::SafeArrival)
            .count() as u32;
        Ok(metrics_from(&samples, alert_count))
    }

    async fn touch_user_location(&self, user_id: Uuid, point: GeoPoint, at: DateTime<Utc>) {
        let location = TimedPoint { point, updated_at: at };
        if let Err(e) = self.db.update_user_location(user_id, location).await {
            warn!(user_id = %user_id, error = %e, "failed to update last known location");
        }
    }

    async fn is_recipient(&self, journey: &Journey, actor: Actor) -> CoreResult<bool> {
        if journey.shared_with_parents.contains(&actor.user_id) {
            return Ok(true);
        }
        let owner = self.db.get_user(journey.user_id).await?;
        Ok(resolve_recipients(Some(journey), Some(&owner)).contains(&actor.user_id))
    }

    async fn is_linked(&self, user_id: Uuid, actor: Actor) -> CoreResult<bool> {
        let user = self.db.get_user(user_id).await?;
        Ok(user.is_linked_to(actor.user_id))
    }

    async fn ensure_can_view(&self, journey: &Journey, actor: Actor) -> CoreResult<()> {
        if journey.user_id == actor.user_id || self.is_recipient(journey, actor).await? {
            Ok(())
        } else {
            Err(CoreError::Authorization("not allowed to view this journey".into()))
        }
    }
}

fn ensure_owner(journey: &Journey, actor: Actor) -> CoreResult<()> {
    if journey.user_id != actor.user_id {
        return Err(CoreError::Authorization(format!(
            "journey {} does not belong to the caller",
            journey.id
        )));
    }
    Ok(())
}

fn validate_sample(sample: &LocationSample) -> CoreResult<GeoPoint> {
    let point = GeoPoint::new(sample.lat, sample.lng)?;
    if let Some(level) = sample.battery_level {
        if !(0.0..=100.0).contains(&level) {
            return Err(CoreError::Validation(format!("batteryLevel {} is out of range", level)));
        }
    }
    if let Some(speed) = sample.speed {
        if !speed.is_finite() || speed < 0.0 {
            return Err(CoreError::Validation(format!("speed {} is invalid", speed)));
        }
    }
    Ok(point)
}

fn build_update(
    journey: &Journey,
    sample: &LocationSample,
    previous: Option<GeoPoint>,
    now: DateTime<Utc>,
) -> LocationUpdate {
    let location = GeoPoint {
        lat: sample.lat,
        lng: sample.lng,
    };
    let speed = sample.speed.unwrap_or(0.0);
    // Without a device heading, derive one from the last known position.
    let heading = sample
        .heading
        .or_else(|| previous.filter(|p| *p != location).map(|p| initial_bearing_deg(p, location)))
        .unwrap_or(0.0);
    LocationUpdate {
        id: Uuid::new_v4(),
        journey_id: journey.id,
        user_id: journey.user_id,
        location,
        speed,
        heading,
        accuracy: sample.accuracy.unwrap_or(0.0),
        battery_level: sample.battery_level.unwrap_or(100.0),
        is_moving: speed > MOVING_SPEED_THRESHOLD_KMH,
        address: sample.address.clone(),
        timestamp: sample.timestamp.map(|t| t.min(now)).unwrap_or(now),
    }
}

/// Average and maximum speed over the samples; safety score drops 10 points per alert.
pub fn metrics_from(samples: &[LocationUpdate], alert_count: u32) -> JourneyMetrics {
    let (sum, max) = samples
        .iter()
        .fold((0.0_f64, 0.0_f64), |(sum, max), s| (sum + s.speed, max.max(s.speed)));
    let average_speed = if samples.is_empty() {
        0.0
    } else {
        ((sum / samples.len() as f64) * 100.0).round() / 100.0
    };
    JourneyMetrics {
        average_speed,
        max_speed: max,
        alert_count,
        safety_score: 100u32.saturating_sub(alert_count.saturating_mul(10)),
    }
}
