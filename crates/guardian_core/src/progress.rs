//! crates/guardian_core/src/progress.rs
//!
//! Derives a 0..=1 completion fraction for a journey from the current position.

use crate::domain::{GeoPoint, Journey};
use crate::geo::haversine_distance_m;

/// Estimates journey progress.
///
/// With a planned route distance the estimate is `1 - remaining / total`, clamped to
/// `[0, 1]` and rounded to two decimals, so it never decreases while the remaining
/// distance shrinks. Without one it falls back to a coarse two-level approximation:
/// `near_progress` inside `arrival_radius_m` of the destination, `far_progress`
/// elsewhere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEstimator {
    pub arrival_radius_m: f64,
    pub near_progress: f64,
    pub far_progress: f64,
}

impl Default for ProgressEstimator {
    fn default() -> Self {
        Self {
            arrival_radius_m: 100.0,
            near_progress: 0.95,
            far_progress: 0.1,
        }
    }
}

impl ProgressEstimator {
    pub fn estimate(&self, journey: &Journey, current: GeoPoint) -> f64 {
        let remaining = haversine_distance_m(current, journey.destination.point);
        match journey.planned_distance() {
            Some(total) => round2((1.0 - remaining / total).clamp(0.0, 1.0)),
            None if remaining < self.arrival_radius_m => self.near_progress,
            None => self.far_progress,
        }
    }

    /// Remaining great-circle distance to the destination, in metres.
    pub fn remaining_distance_m(&self, journey: &Journey, current: GeoPoint) -> f64 {
        haversine_distance_m(current, journey.destination.point)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JourneyStatus, Place, PlannedRoute, TransportMode};
    use chrono::Utc;
    use uuid::Uuid;

    fn journey_to(dest: GeoPoint, total_distance: Option<f64>) -> Journey {
        let now = Utc::now();
        Journey {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            start_location: Place { point: GeoPoint::new(0.0, 0.0).unwrap(), address: None },
            destination: Place { point: dest, address: None },
            planned_route: total_distance.map(|d| PlannedRoute {
                waypoints: vec![],
                total_distance: Some(d),
                estimated_duration: None,
            }),
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

    #[test]
    fn uses_planned_distance_when_known() {
        let dest = GeoPoint::new(0.0, 0.0).unwrap();
        // ~1112 m north of the destination on a 2224 m route.
        let halfway = GeoPoint::new(0.01, 0.0).unwrap();
        let journey = journey_to(dest, Some(2_224.0));
        assert_eq!(ProgressEstimator::default().estimate(&journey, halfway), 0.5);
    }

    #[test]
    fn clamps_when_further_than_the_whole_route() {
        let dest = GeoPoint::new(0.0, 0.0).unwrap();
        let far = GeoPoint::new(1.0, 0.0).unwrap();
        let journey = journey_to(dest, Some(500.0));
        assert_eq!(ProgressEstimator::default().estimate(&journey, far), 0.0);
        assert_eq!(ProgressEstimator::default().estimate(&journey, dest), 1.0);
    }

    #[test]
    fn is_non_decreasing_as_position_approaches_destination() {
        let dest = GeoPoint::new(10.0, 10.0).unwrap();
        let journey = journey_to(dest, Some(20_000.0));
        let estimator = ProgressEstimator::default();

        let mut previous = 0.0;
        for step in (0..=40).rev() {
            let lat = 10.0 + step as f64 * 0.005;
            let value = estimator.estimate(&journey, GeoPoint::new(lat, 10.0).unwrap());
            assert!((0.0..=1.0).contains(&value));
            assert!(value >= previous, "{} < {} at step {}", value, previous, step);
            previous = value;
        }
        assert_eq!(previous, 1.0);
    }

    #[test]
    fn falls_back_to_heuristic_without_route_distance() {
        let dest = GeoPoint::new(0.0, 0.0).unwrap();
        let journey = journey_to(dest, None);
        let estimator = ProgressEstimator::default();
        assert_eq!(estimator.estimate(&journey, GeoPoint::new(0.0005, 0.0).unwrap()), 0.95);
        assert_eq!(estimator.estimate(&journey, GeoPoint::new(0.5, 0.0).unwrap()), 0.1);
    }

    #[test]
    fn zero_route_distance_uses_the_heuristic() {
        let dest = GeoPoint::new(0.0, 0.0).unwrap();
        let journey = journey_to(dest, Some(0.0));
        assert_eq!(ProgressEstimator::default().estimate(&journey, dest), 0.95);
    }
}
