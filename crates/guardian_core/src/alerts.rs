//! crates/guardian_core/src/alerts.rs
//!
//! Decides which safety alerts a new location sample should raise.
//!
//! The evaluator is pure. It is given the alert types that are currently unresolved
//! for the journey and never proposes one of those again; the storage gate
//! (`DatabaseService::insert_alert_if_absent`) makes the final call.

use crate::domain::{
    AlertMetadata, AlertType, EmergencyActionKind, GeoPoint, Journey, LocationUpdate,
    SafetyAlert, Severity,
};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct SafetyAlertEvaluator {
    /// Battery percentage below which a medium alert is raised.
    pub low_battery: f64,
    /// Battery percentage below which the alert is raised as high.
    pub critical_battery: f64,
    /// Trailing window inspected for an unexpected stop.
    pub stop_window: Duration,
    /// Minimum stationary samples inside the window.
    pub stop_min_samples: usize,
}

impl Default for SafetyAlertEvaluator {
    fn default() -> Self {
        Self {
            low_battery: 20.0,
            critical_battery: 10.0,
            stop_window: Duration::minutes(10),
            stop_min_samples: 3,
        }
    }
}

impl SafetyAlertEvaluator {
    /// Start of the history window the caller should load for `update`.
    pub fn history_since(&self, update: &LocationUpdate) -> DateTime<Utc> {
        update.timestamp - self.stop_window
    }

    /// Alerts raised by `update`. `recent_history` may include `update` itself and
    /// samples outside the window; both are handled here.
    pub fn evaluate(
        &self,
        journey: &Journey,
        update: &LocationUpdate,
        recent_history: &[LocationUpdate],
        open_types: &[AlertType],
    ) -> Vec<SafetyAlert> {
        let mut raised = Vec::new();

        if !open_types.contains(&AlertType::LowBattery) {
            if let Some(alert) = self.check_battery(journey, update) {
                raised.push(alert);
            }
        }
        if !open_types.contains(&AlertType::UnexpectedStop) {
            if let Some(alert) = self.check_stop(journey, update, recent_history) {
                raised.push(alert);
            }
        }
        raised
    }

    fn check_battery(&self, journey: &Journey, update: &LocationUpdate) -> Option<SafetyAlert> {
        let level = update.battery_level;
        if level >= self.low_battery {
            return None;
        }
        let severity = if level < self.critical_battery {
            Severity::High
        } else {
            Severity::Medium
        };
        let alert = SafetyAlert::new(
            journey,
            AlertType::LowBattery,
            severity,
            format!("Battery low ({:.0}%)", level),
            update.location,
        )
        .with_metadata(AlertMetadata {
            battery_level: Some(level),
            ..Default::default()
        });
        Some(alert)
    }

    fn check_stop(
        &self,
        journey: &Journey,
        update: &LocationUpdate,
        recent_history: &[LocationUpdate],
    ) -> Option<SafetyAlert> {
        if update.is_moving {
            return None;
        }
        let since = self.history_since(update);
        let mut in_window: Vec<&LocationUpdate> = recent_history
            .iter()
            .filter(|s| s.timestamp >= since && s.timestamp <= update.timestamp)
            .collect();
        if !in_window.iter().any(|s| s.id == update.id) {
            in_window.push(update);
        }

        if in_window.len() < self.stop_min_samples || in_window.iter().any(|s| s.is_moving) {
            return None;
        }
        let alert = SafetyAlert::new(
            journey,
            AlertType::UnexpectedStop,
            Severity::Medium,
            "Unexpected stop detected",
            update.location,
        )
        .with_metadata(AlertMetadata {
            stop_duration: Some(self.stop_window.num_seconds()),
            speed: Some(update.speed),
            ..Default::default()
        });
        Some(alert)
    }

    /// The alert raised when a journey completes normally.
    pub fn safe_arrival(
        &self,
        journey: &Journey,
        location: GeoPoint,
        arrived_at: DateTime<Utc>,
    ) -> SafetyAlert {
        let label = journey
            .destination
            .address
            .clone()
            .unwrap_or_else(|| "the destination".to_string());
        SafetyAlert::new(
            journey,
            AlertType::SafeArrival,
            Severity::Low,
            format!("Arrived safely at {}", label),
            location,
        )
        .with_metadata(AlertMetadata {
            actual_arrival: Some(arrived_at),
            ..Default::default()
        })
    }

    /// The alert that accompanies an emergency trigger on a journey.
    pub fn emergency(
        &self,
        journey: &Journey,
        action: EmergencyActionKind,
        location: GeoPoint,
    ) -> SafetyAlert {
        SafetyAlert::new(
            journey,
            AlertType::Emergency,
            action.severity(),
            format!("Emergency: {}", action.as_str().replace('_', " ")),
            location,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JourneyStatus, Place, TransportMode};
    use uuid::Uuid;

    fn journey() -> Journey {
        let now = Utc::now();
        let place = Place { point: GeoPoint::new(1.0, 1.0).unwrap(), address: None };
        Journey {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            start_location: place.clone(),
            destination: place,
            planned_route: None,
            transport_mode: TransportMode::Walking,
            scheduled_time: now,
            status: JourneyStatus::Active,
            start_time: Some(now),
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

    fn sample(journey: &Journey, at: DateTime<Utc>, moving: bool, battery: f64) -> LocationUpdate {
        LocationUpdate {
            id: Uuid::new_v4(),
            journey_id: journey.id,
            user_id: journey.user_id,
            location: GeoPoint::new(1.0, 1.0).unwrap(),
            speed: if moving { 5.0 } else { 0.0 },
            heading: 0.0,
            accuracy: 5.0,
            battery_level: battery,
            is_moving: moving,
            address: None,
            timestamp: at,
        }
    }

    #[test]
    fn battery_thresholds_map_to_severity() {
        let evaluator = SafetyAlertEvaluator::default();
        let j = journey();
        let now = Utc::now();

        let alerts = evaluator.evaluate(&j, &sample(&j, now, true, 15.0), &[], &[]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::LowBattery);
        assert_eq!(alerts[0].severity, Severity::Medium);
        assert_eq!(alerts[0].metadata.battery_level, Some(15.0));

        let alerts = evaluator.evaluate(&j, &sample(&j, now, true, 9.0), &[], &[]);
        assert_eq!(alerts[0].severity, Severity::High);

        assert!(evaluator.evaluate(&j, &sample(&j, now, true, 20.0), &[], &[]).is_empty());
    }

    #[test]
    fn open_alert_types_are_not_raised_again() {
        let evaluator = SafetyAlertEvaluator::default();
        let j = journey();
        let alerts = evaluator.evaluate(
            &j,
            &sample(&j, Utc::now(), true, 12.0),
            &[],
            &[AlertType::LowBattery],
        );
        assert!(alerts.is_empty());
    }

    #[test]
    fn three_stationary_samples_in_window_raise_unexpected_stop() {
        let evaluator = SafetyAlertEvaluator::default();
        let j = journey();
        let now = Utc::now();
        let history = vec![
            sample(&j, now - Duration::minutes(8), false, 80.0),
            sample(&j, now - Duration::minutes(4), false, 80.0),
        ];
        let latest = sample(&j, now, false, 80.0);

        let alerts = evaluator.evaluate(&j, &latest, &history, &[]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::UnexpectedStop);
        assert_eq!(alerts[0].severity, Severity::Medium);
        assert_eq!(alerts[0].metadata.stop_duration, Some(600));
    }

    #[test]
    fn a_moving_sample_in_window_suppresses_the_stop_alert() {
        let evaluator = SafetyAlertEvaluator::default();
        let j = journey();
        let now = Utc::now();
        let history = vec![
            sample(&j, now - Duration::minutes(8), false, 80.0),
            sample(&j, now - Duration::minutes(6), true, 80.0),
            sample(&j, now - Duration::minutes(4), false, 80.0),
        ];
        let alerts = evaluator.evaluate(&j, &sample(&j, now, false, 80.0), &history, &[]);
        assert!(alerts.is_empty());
    }

    #[test]
    fn samples_outside_the_window_do_not_count() {
        let evaluator = SafetyAlertEvaluator::default();
        let j = journey();
        let now = Utc::now();
        let history = vec![
            sample(&j, now - Duration::minutes(30), false, 80.0),
            sample(&j, now - Duration::minutes(20), false, 80.0),
            sample(&j, now - Duration::minutes(5), false, 80.0),
        ];
        let alerts = evaluator.evaluate(&j, &sample(&j, now, false, 80.0), &history, &[]);
        assert!(alerts.is_empty());
    }

    #[test]
    fn latest_sample_already_in_history_is_not_double_counted() {
        let evaluator = SafetyAlertEvaluator::default();
        let j = journey();
        let now = Utc::now();
        let latest = sample(&j, now, false, 80.0);
        let history = vec![sample(&j, now - Duration::minutes(2), false, 80.0), latest.clone()];
        assert!(evaluator.evaluate(&j, &latest, &history, &[]).is_empty());
    }

    #[test]
    fn safe_arrival_is_low_severity() {
        let evaluator = SafetyAlertEvaluator::default();
        let j = journey();
        let now = Utc::now();
        let alert = evaluator.safe_arrival(&j, j.destination.point, now);
        assert_eq!(alert.alert_type, AlertType::SafeArrival);
        assert_eq!(alert.severity, Severity::Low);
        assert_eq!(alert.metadata.actual_arrival, Some(now));
        assert!(!alert.resolved);
    }
}
