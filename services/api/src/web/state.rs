//! services/api/src/web/state.rs
//!
//! Defines the application's shared state and how its services are wired together.

use crate::config::Config;
use guardian_core::{
    AlertFanoutDispatcher, ConnectionService, DatabaseService, JourneyStateMachine, LiveTracker,
    NotificationChannel, RetryPolicy, SessionRegistry,
};
use std::sync::Arc;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn DatabaseService>,
    pub config: Arc<Config>,
    pub journeys: Arc<JourneyStateMachine>,
    pub tracker: Arc<LiveTracker>,
    pub connections: Arc<ConnectionService>,
    /// The live-channel registry. Cloning shares the same rooms.
    pub sessions: SessionRegistry,
}

impl AppState {
    /// Builds the core services over one store, one registry and the enabled channels.
    pub fn new(
        db: Arc<dyn DatabaseService>,
        config: Arc<Config>,
        channels: Vec<Arc<dyn NotificationChannel>>,
    ) -> Self {
        let sessions = SessionRegistry::new();
        let retry = RetryPolicy::default().with_max_attempts(config.notify_max_attempts);
        let dispatcher = Arc::new(
            AlertFanoutDispatcher::new(db.clone(), sessions.clone(), channels)
                .with_retry(retry)
                .with_attempt_timeout(config.notify_timeout),
        );
        let journeys = Arc::new(JourneyStateMachine::new(db.clone(), dispatcher.clone()));
        let tracker = Arc::new(LiveTracker::new(db.clone(), journeys.clone(), dispatcher));
        let connections = Arc::new(ConnectionService::new(db.clone(), sessions.clone()));

        Self {
            db,
            config,
            journeys,
            tracker,
            connections,
            sessions,
        }
    }
}
