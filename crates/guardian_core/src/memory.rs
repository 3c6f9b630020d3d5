//! crates/guardian_core/src/memory.rs
//!
//! A process-local `DatabaseService`. Used when no database is configured and by the
//! test suites. Both uniqueness rules (one in-progress journey per user, one
//! unresolved alert per journey and type) are checked under the same write lock as
//! the mutation they guard.

use crate::domain::{
    AlertType, ConnectionRequest, ConnectionStatus, EmergencyAction, Journey, JourneyStatus,
    LocationUpdate, ParentNotification, Role, SafetyAlert, TimedPoint, User,
};
use crate::ports::{DatabaseService, Page, PortError, PortResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    journeys: HashMap<Uuid, Journey>,
    location_updates: Vec<LocationUpdate>,
    alerts: HashMap<Uuid, SafetyAlert>,
    emergency_actions: HashMap<Uuid, EmergencyAction>,
    connection_requests: HashMap<Uuid, ConnectionRequest>,
}

impl Tables {
    fn in_progress_for(&self, user_id: Uuid) -> Option<&Journey> {
        self.journeys
            .values()
            .find(|j| j.user_id == user_id && j.is_in_progress())
    }

    fn alert_mut(&mut self, alert_id: Uuid) -> PortResult<&mut SafetyAlert> {
        self.alerts
            .get_mut(&alert_id)
            .ok_or_else(|| PortError::NotFound(format!("alert {}", alert_id)))
    }

    fn link(&mut self, user_id: Uuid, parent_id: Uuid) -> PortResult<()> {
        for id in [user_id, parent_id] {
            if !self.users.contains_key(&id) {
                return Err(PortError::NotFound(format!("user {}", id)));
            }
        }
        for (a, b) in [(user_id, parent_id), (parent_id, user_id)] {
            if let Some(user) = self.users.get_mut(&a) {
                if !user.relations.contains(&b) {
                    user.relations.push(b);
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a user record as-is.
    pub async fn seed_user(&self, user: User) {
        self.inner.write().await.users.insert(user.id, user);
    }

    /// Mirrors a user/parent relation on both records.
    pub async fn link(&self, user_id: Uuid, parent_id: Uuid) -> PortResult<()> {
        self.inner.write().await.link(user_id, parent_id)
    }

    pub async fn location_update_count(&self) -> usize {
        self.inner.read().await.location_updates.len()
    }
}

fn page_of<T>(items: Vec<T>, page: Page) -> Vec<T> {
    items
        .into_iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect()
}

#[async_trait]
impl DatabaseService for MemoryStore {
    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        self.inner
            .read()
            .await
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("user {}", user_id)))
    }

    async fn get_users(&self, user_ids: &[Uuid]) -> PortResult<Vec<User>> {
        let tables = self.inner.read().await;
        Ok(user_ids
            .iter()
            .filter_map(|id| tables.users.get(id).cloned())
            .collect())
    }

    async fn find_user_by_phone(&self, phone: &str) -> PortResult<Option<User>> {
        let tables = self.inner.read().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.phone.as_deref() == Some(phone))
            .cloned())
    }

    async fn upsert_user_profile(
        &self,
        user_id: Uuid,
        role: Role,
        name: Option<&str>,
        phone: Option<&str>,
    ) -> PortResult<User> {
        let mut tables = self.inner.write().await;
        let user = tables.users.entry(user_id).or_insert_with(|| User {
            id: user_id,
            name: None,
            phone: None,
            role,
            relations: Vec::new(),
            last_location: None,
            device_tokens: Vec::new(),
        });
        user.role = role;
        if let Some(name) = name {
            user.name = Some(name.to_string());
        }
        if let Some(phone) = phone {
            user.phone = Some(phone.to_string());
        }
        Ok(user.clone())
    }

    async fn add_device_token(&self, user_id: Uuid, token: &str) -> PortResult<()> {
        let mut tables = self.inner.write().await;
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| PortError::NotFound(format!("user {}", user_id)))?;
        if !user.device_tokens.iter().any(|t| t == token) {
            user.device_tokens.push(token.to_string());
        }
        Ok(())
    }

    async fn update_user_location(&self, user_id: Uuid, location: TimedPoint) -> PortResult<()> {
        let mut tables = self.inner.write().await;
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| PortError::NotFound(format!("user {}", user_id)))?;
        user.last_location = Some(location);
        Ok(())
    }

    async fn unlink_users(&self, user_id: Uuid, other_id: Uuid) -> PortResult<()> {
        let mut tables = self.inner.write().await;
        for (a, b) in [(user_id, other_id), (other_id, user_id)] {
            if let Some(user) = tables.users.get_mut(&a) {
                user.relations.retain(|id| *id != b);
            }
        }
        Ok(())
    }

    async fn insert_connection_request(&self, request: &ConnectionRequest) -> PortResult<()> {
        let mut tables = self.inner.write().await;
        let pending = tables.connection_requests.values().any(|r| {
            r.requester == request.requester
                && r.target == request.target
                && r.status == ConnectionStatus::Pending
        });
        if pending {
            return Err(PortError::Conflict("a request is already pending".into()));
        }
        tables.connection_requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_connection_request(&self, request_id: Uuid) -> PortResult<ConnectionRequest> {
        self.inner
            .read()
            .await
            .connection_requests
            .get(&request_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("connection request {}", request_id)))
    }

    async fn list_pending_connection_requests(
        &self,
        target: Uuid,
    ) -> PortResult<Vec<ConnectionRequest>> {
        let tables = self.inner.read().await;
        let mut requests: Vec<ConnectionRequest> = tables
            .connection_requests
            .values()
            .filter(|r| r.target == target && r.status == ConnectionStatus::Pending)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    async fn respond_connection_request(&self, request: &ConnectionRequest) -> PortResult<bool> {
        let mut tables = self.inner.write().await;
        let stored = tables
            .connection_requests
            .get(&request.id)
            .ok_or_else(|| PortError::NotFound(format!("connection request {}", request.id)))?;
        if stored.status != ConnectionStatus::Pending {
            return Ok(false);
        }
        if request.status == ConnectionStatus::Accepted {
            tables.link(request.target, request.requester)?;
        }
        tables.connection_requests.insert(request.id, request.clone());
        Ok(true)
    }

    async fn insert_journey(&self, journey: &Journey) -> PortResult<()> {
        let mut tables = self.inner.write().await;
        if tables.journeys.contains_key(&journey.id) {
            return Err(PortError::Conflict(format!("journey {} exists", journey.id)));
        }
        if journey.is_in_progress() && tables.in_progress_for(journey.user_id).is_some() {
            return Err(PortError::Conflict("user already has a journey in progress".into()));
        }
        tables.journeys.insert(journey.id, journey.clone());
        Ok(())
    }

    async fn get_journey(&self, journey_id: Uuid) -> PortResult<Journey> {
        self.inner
            .read()
            .await
            .journeys
            .get(&journey_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("journey {}", journey_id)))
    }

    async fn find_in_progress_journey(&self, user_id: Uuid) -> PortResult<Option<Journey>> {
        Ok(self.inner.read().await.in_progress_for(user_id).cloned())
    }

    async fn update_journey(
        &self,
        journey: &Journey,
        expected_status: JourneyStatus,
    ) -> PortResult<()> {
        let mut tables = self.inner.write().await;
        let stored = tables
            .journeys
            .get(&journey.id)
            .ok_or_else(|| PortError::NotFound(format!("journey {}", journey.id)))?;
        if stored.status != expected_status {
            return Err(PortError::Conflict(format!(
                "journey {} is {}, expected {}",
                journey.id, stored.status, expected_status
            )));
        }
        if journey.is_in_progress() {
            if let Some(other) = tables.in_progress_for(journey.user_id) {
                if other.id != journey.id {
                    return Err(PortError::Conflict(
                        "user already has a journey in progress".into(),
                    ));
                }
            }
        }
        tables.journeys.insert(journey.id, journey.clone());
        Ok(())
    }

    async fn list_in_progress_journeys_for_parent(
        &self,
        parent_id: Uuid,
        owners: &[Uuid],
    ) -> PortResult<Vec<Journey>> {
        let tables = self.inner.read().await;
        let mut journeys: Vec<Journey> = tables
            .journeys
            .values()
            .filter(|j| j.is_in_progress())
            .filter(|j| owners.contains(&j.user_id) || j.shared_with_parents.contains(&parent_id))
            .cloned()
            .collect();
        journeys.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(journeys)
    }

    async fn list_journey_history(&self, user_id: Uuid, page: Page) -> PortResult<Vec<Journey>> {
        let tables = self.inner.read().await;
        let mut journeys: Vec<Journey> = tables
            .journeys
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        journeys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page_of(journeys, page))
    }

    async fn insert_location_update(&self, update: &LocationUpdate) -> PortResult<()> {
        self.inner.write().await.location_updates.push(update.clone());
        Ok(())
    }

    async fn recent_location_updates(
        &self,
        journey_id: Uuid,
        since: DateTime<Utc>,
    ) -> PortResult<Vec<LocationUpdate>> {
        let tables = self.inner.read().await;
        let mut updates: Vec<LocationUpdate> = tables
            .location_updates
            .iter()
            .filter(|u| u.journey_id == journey_id && u.timestamp >= since)
            .cloned()
            .collect();
        updates.sort_by_key(|u| u.timestamp);
        Ok(updates)
    }

    async fn location_updates_for_journey(
        &self,
        journey_id: Uuid,
    ) -> PortResult<Vec<LocationUpdate>> {
        let tables = self.inner.read().await;
        let mut updates: Vec<LocationUpdate> = tables
            .location_updates
            .iter()
            .filter(|u| u.journey_id == journey_id)
            .cloned()
            .collect();
        updates.sort_by_key(|u| u.timestamp);
        Ok(updates)
    }

    async fn latest_location_update(
        &self,
        journey_id: Uuid,
    ) -> PortResult<Option<LocationUpdate>> {
        let tables = self.inner.read().await;
        // Ties on timestamp resolve to the later insertion.
        Ok(tables
            .location_updates
            .iter()
            .filter(|u| u.journey_id == journey_id)
            .fold(None, |latest: Option<&LocationUpdate>, u| match latest {
                Some(l) if l.timestamp > u.timestamp => Some(l),
                _ => Some(u),
            })
            .cloned())
    }

    async fn purge_location_updates_before(&self, cutoff: DateTime<Utc>) -> PortResult<u64> {
        let mut tables = self.inner.write().await;
        let before = tables.location_updates.len();
        tables.location_updates.retain(|u| u.timestamp >= cutoff);
        Ok((before - tables.location_updates.len()) as u64)
    }

    async fn insert_alert_if_absent(&self, alert: &SafetyAlert) -> PortResult<bool> {
        let mut tables = self.inner.write().await;
        let open = tables.alerts.values().any(|a| {
            a.journey_id == alert.journey_id && a.alert_type == alert.alert_type && !a.resolved
        });
        if open {
            return Ok(false);
        }
        tables.alerts.insert(alert.id, alert.clone());
        Ok(true)
    }

    async fn get_alert(&self, alert_id: Uuid) -> PortResult<SafetyAlert> {
        self.inner
            .read()
            .await
            .alerts
            .get(&alert_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("alert {}", alert_id)))
    }

    async fn save_alert_ledger(
        &self,
        alert_id: Uuid,
        ledger: &[ParentNotification],
    ) -> PortResult<()> {
        let mut tables = self.inner.write().await;
        tables.alert_mut(alert_id)?.notified_parents = ledger.to_vec();
        Ok(())
    }

    async fn mark_alert_resolved(
        &self,
        alert_id: Uuid,
        resolved_by: Uuid,
        at: DateTime<Utc>,
    ) -> PortResult<bool> {
        let mut tables = self.inner.write().await;
        let alert = tables.alert_mut(alert_id)?;
        if alert.resolved {
            return Ok(false);
        }
        alert.resolved = true;
        alert.resolved_at = Some(at);
        alert.resolved_by = Some(resolved_by);
        Ok(true)
    }

    async fn mark_alert_acknowledged(
        &self,
        alert_id: Uuid,
        parent_id: Uuid,
        at: DateTime<Utc>,
    ) -> PortResult<bool> {
        let mut tables = self.inner.write().await;
        let alert = tables.alert_mut(alert_id)?;
        match alert
            .notified_parents
            .iter_mut()
            .find(|p| p.parent == parent_id && !p.acknowledged)
        {
            Some(entry) => {
                entry.acknowledged = true;
                entry.acknowledged_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_alerts_for_journey(&self, journey_id: Uuid) -> PortResult<Vec<SafetyAlert>> {
        let tables = self.inner.read().await;
        let mut alerts: Vec<SafetyAlert> = tables
            .alerts
            .values()
            .filter(|a| a.journey_id == journey_id)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(alerts)
    }

    async fn open_alert_types(&self, journey_id: Uuid) -> PortResult<Vec<AlertType>> {
        let tables = self.inner.read().await;
        let mut types: Vec<AlertType> = tables
            .alerts
            .values()
            .filter(|a| a.journey_id == journey_id && !a.resolved)
            .map(|a| a.alert_type)
            .collect();
        types.dedup();
        Ok(types)
    }

    async fn insert_emergency_action(&self, action: &EmergencyAction) -> PortResult<()> {
        let mut tables = self.inner.write().await;
        if tables.emergency_actions.contains_key(&action.id) {
            return Err(PortError::Conflict(format!("emergency action {} exists", action.id)));
        }
        tables.emergency_actions.insert(action.id, action.clone());
        Ok(())
    }

    async fn get_emergency_action(&self, action_id: Uuid) -> PortResult<EmergencyAction> {
        self.inner
            .read()
            .await
            .emergency_actions
            .get(&action_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("emergency action {}", action_id)))
    }

    async fn list_emergency_actions(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> PortResult<Vec<EmergencyAction>> {
        let tables = self.inner.read().await;
        let mut actions: Vec<EmergencyAction> = tables
            .emergency_actions
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        actions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page_of(actions, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GeoPoint, Place, Severity, TransportMode};

    fn journey(user_id: Uuid, status: JourneyStatus) -> Journey {
        let now = Utc::now();
        let place = Place { point: GeoPoint::new(0.0, 0.0).unwrap(), address: None };
        Journey {
            id: Uuid::new_v4(),
            user_id,
            start_location: place.clone(),
            destination: place,
            planned_route: None,
            transport_mode: TransportMode::Walking,
            scheduled_time: now,
            status,
            start_time: None,
            end_time: None,
            actual_duration: None,
            metrics: None,
            shared_with_parents: vec![],
            checkpoints: vec![],
            last_known_location: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_status() {
        let store = MemoryStore::new();
        let mut j = journey(Uuid::new_v4(), JourneyStatus::Planned);
        store.insert_journey(&j).await.unwrap();

        j.status = JourneyStatus::Active;
        store.update_journey(&j, JourneyStatus::Planned).await.unwrap();
        let err = store.update_journey(&j, JourneyStatus::Planned).await.unwrap_err();
        assert!(matches!(err, PortError::Conflict(_)));
    }

    #[tokio::test]
    async fn second_in_progress_journey_is_rejected() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let mut a = journey(user, JourneyStatus::Planned);
        let mut b = journey(user, JourneyStatus::Planned);
        store.insert_journey(&a).await.unwrap();
        store.insert_journey(&b).await.unwrap();

        a.status = JourneyStatus::Active;
        store.update_journey(&a, JourneyStatus::Planned).await.unwrap();
        b.status = JourneyStatus::Active;
        assert!(matches!(
            store.update_journey(&b, JourneyStatus::Planned).await,
            Err(PortError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn alert_gate_admits_one_open_alert_per_type() {
        let store = MemoryStore::new();
        let j = journey(Uuid::new_v4(), JourneyStatus::Active);
        let point = GeoPoint::new(0.0, 0.0).unwrap();
        let first = SafetyAlert::new(&j, AlertType::LowBattery, Severity::Medium, "low", point);
        let second = SafetyAlert::new(&j, AlertType::LowBattery, Severity::High, "lower", point);

        assert!(store.insert_alert_if_absent(&first).await.unwrap());
        assert!(!store.insert_alert_if_absent(&second).await.unwrap());

        assert!(store.mark_alert_resolved(first.id, j.user_id, Utc::now()).await.unwrap());
        assert!(!store.mark_alert_resolved(first.id, j.user_id, Utc::now()).await.unwrap());
        assert!(store.insert_alert_if_absent(&second).await.unwrap());
        assert_eq!(store.open_alert_types(j.id).await.unwrap(), vec![AlertType::LowBattery]);
    }

    #[tokio::test]
    async fn purge_removes_only_old_samples() {
        let store = MemoryStore::new();
        let j = journey(Uuid::new_v4(), JourneyStatus::Active);
        let now = Utc::now();
        for age_days in [40, 31, 1] {
            store
                .insert_location_update(&LocationUpdate {
                    id: Uuid::new_v4(),
                    journey_id: j.id,
                    user_id: j.user_id,
                    location: GeoPoint::new(0.0, 0.0).unwrap(),
                    speed: 0.0,
                    heading: 0.0,
                    accuracy: 0.0,
                    battery_level: 100.0,
                    is_moving: false,
                    address: None,
                    timestamp: now - chrono::Duration::days(age_days),
                })
                .await
                .unwrap();
        }
        let removed = store
            .purge_location_updates_before(now - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.location_update_count().await, 1);
    }

    #[tokio::test]
    async fn ledger_write_keeps_a_concurrent_resolution() {
        let store = MemoryStore::new();
        let j = journey(Uuid::new_v4(), JourneyStatus::Active);
        let point = GeoPoint::new(0.0, 0.0).unwrap();
        let alert = SafetyAlert::new(&j, AlertType::LowBattery, Severity::Medium, "low", point);
        store.insert_alert_if_absent(&alert).await.unwrap();

        let parent = Uuid::new_v4();
        assert!(store.mark_alert_resolved(alert.id, parent, Utc::now()).await.unwrap());
        let ledger = vec![ParentNotification {
            parent,
            notified_at: Utc::now(),
            delivered: true,
            channels: vec!["sms".into()],
            acknowledged: false,
            acknowledged_at: None,
        }];
        store.save_alert_ledger(alert.id, &ledger).await.unwrap();

        let stored = store.get_alert(alert.id).await.unwrap();
        assert!(stored.resolved);
        assert_eq!(stored.resolved_by, Some(parent));
        assert_eq!(stored.notified_parents.len(), 1);

        assert!(store.mark_alert_acknowledged(alert.id, parent, Utc::now()).await.unwrap());
        assert!(!store.mark_alert_acknowledged(alert.id, parent, Utc::now()).await.unwrap());
        assert!(!store.mark_alert_acknowledged(alert.id, Uuid::new_v4(), Utc::now()).await.unwrap());
        assert!(store.get_alert(alert.id).await.unwrap().resolved);
    }

    fn member(role: Role) -> User {
        User {
            id: Uuid::new_v4(),
            name: None,
            phone: None,
            role,
            relations: vec![],
            last_location: None,
            device_tokens: vec![],
        }
    }

    fn request(requester: Uuid, target: Uuid) -> ConnectionRequest {
        ConnectionRequest {
            id: Uuid::new_v4(),
            requester,
            target,
            status: ConnectionStatus::Pending,
            message: None,
            created_at: Utc::now(),
            responded_at: None,
        }
    }

    #[tokio::test]
    async fn accepting_a_request_links_both_records_once() {
        let store = MemoryStore::new();
        let (child, parent) = (member(Role::User), member(Role::Parent));
        store.seed_user(child.clone()).await;
        store.seed_user(parent.clone()).await;

        let pending = request(parent.id, child.id);
        store.insert_connection_request(&pending).await.unwrap();
        assert!(matches!(
            store.insert_connection_request(&request(parent.id, child.id)).await,
            Err(PortError::Conflict(_))
        ));

        let mut accepted = pending.clone();
        accepted.status = ConnectionStatus::Accepted;
        accepted.responded_at = Some(Utc::now());
        assert!(store.respond_connection_request(&accepted).await.unwrap());
        assert!(!store.respond_connection_request(&accepted).await.unwrap());

        assert!(store.get_user(child.id).await.unwrap().is_linked_to(parent.id));
        assert!(store.get_user(parent.id).await.unwrap().is_linked_to(child.id));
        assert!(store.list_pending_connection_requests(child.id).await.unwrap().is_empty());

        store.unlink_users(parent.id, child.id).await.unwrap();
        assert!(store.get_user(child.id).await.unwrap().relations.is_empty());
        assert!(store.get_user(parent.id).await.unwrap().relations.is_empty());
    }

    #[tokio::test]
    async fn linking_a_missing_user_changes_nothing() {
        let store = MemoryStore::new();
        let child = member(Role::User);
        store.seed_user(child.clone()).await;
        assert!(matches!(
            store.link(child.id, Uuid::new_v4()).await,
            Err(PortError::NotFound(_))
        ));
        assert!(store.get_user(child.id).await.unwrap().relations.is_empty());
    }
}
