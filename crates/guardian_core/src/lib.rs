pub mod alerts;
pub mod domain;
pub mod error;
pub mod fanout;
pub mod geo;
pub mod journey;
pub mod links;
pub mod memory;
pub mod ports;
pub mod progress;
pub mod retry;
pub mod session;
pub mod tracking;

pub use alerts::SafetyAlertEvaluator;
pub use domain::{
    Actor, AlertType, Checkpoint, CheckpointStatus, ConnectionRequest, ConnectionStatus,
    EmergencyAction, EmergencyActionKind, EmergencyRequest, GeoPoint, Journey, JourneyStatus,
    LocationSample, LocationUpdate, NewJourney, Place, Role, SafetyAlert, Severity, TimedPoint,
    User,
};
pub use error::{CoreError, CoreResult};
pub use fanout::{AlertFanoutDispatcher, DeliveryReport, FanoutEvent};
pub use journey::{ActiveJourneyView, JourneyStateMachine, LocationOutcome};
pub use links::{ConnectionService, ConnectionTarget};
pub use memory::MemoryStore;
pub use ports::{
    DatabaseService, DeliveryError, Notification, NotificationChannel, Page, PortError,
    PortResult,
};
pub use progress::ProgressEstimator;
pub use retry::RetryPolicy;
pub use session::{Channel, ConnectionId, LiveEvent, SessionRegistry};
pub use tracking::{IngestOutcome, LiveTracker, SosRequest};
