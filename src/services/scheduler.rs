//! Day scheduling: turns an ordered route into calendar-anchored arrivals.
//!
//! Legs are never split. Before driving a leg, if the current day already has
//! driving and the leg would push it past the daily budget, the day is closed
//! and driving resumes at the next day's start hour.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::{PlannerError, PlannerResult};
use crate::types::{Destination, Leg, OptimizationConstraints, RouteMetrics, RouteWarning, Stop};

/// A destination in visiting order with its incoming leg and dwell
#[derive(Debug, Clone)]
pub struct ScheduleStop {
    pub destination: Destination,
    pub incoming_leg: Leg,
    pub dwell_minutes: f64,
}

/// Result of scheduling
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub stops: Vec<Stop>,
    pub return_leg: Option<Leg>,
    pub metrics: RouteMetrics,
    pub warnings: Vec<RouteWarning>,
}

fn minutes(value: f64) -> Option<Duration> {
    let millis = (value * 60_000.0).round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return None;
    }
    Duration::try_milliseconds(millis as i64)
}

/// Advance `now`, or `None` when the result leaves the calendar range.
fn advance(now: NaiveDateTime, by_minutes: f64) -> Option<NaiveDateTime> {
    now.checked_add_signed(minutes(by_minutes)?)
}

/// Clock that tracks driving per day and rolls over to the next day start
struct DayClock {
    now: NaiveDateTime,
    day_date: NaiveDate,
    day_index: u32,
    day_driving: f64,
    budget: f64,
    day_start: NaiveTime,
}

impl DayClock {
    fn new(departure: NaiveDateTime, budget: f64, day_start: NaiveTime) -> Self {
        Self {
            now: departure,
            day_date: departure.date(),
            day_index: 0,
            day_driving: 0.0,
            budget,
            day_start,
        }
    }

    /// Drive one leg; returns true when the leg alone exceeds a full day.
    ///
    /// The day only closes once it already has driving, so a leg longer than
    /// the budget on a fresh day is driven in one piece.
    fn drive(&mut self, duration: f64) -> Option<bool> {
        if self.day_driving > 0.0 && self.day_driving + duration > self.budget {
            self.close_day();
        }
        let oversized = self.day_driving == 0.0 && duration > self.budget;

        self.now = advance(self.now, duration)?;
        self.day_driving += duration;
        Some(oversized)
    }

    /// Next start hour strictly after the current moment
    fn close_day(&mut self) {
        let mut date = self.day_date;
        loop {
            date = date.succ_opt().unwrap_or(date);
            let start = date.and_time(self.day_start);
            if start > self.now || date == NaiveDate::MAX {
                self.now = start.max(self.now);
                break;
            }
        }
        self.day_date = date;
        self.day_index += 1;
        self.day_driving = 0.0;
    }

    fn rest(&mut self, dwell: f64) -> Option<()> {
        self.now = advance(self.now, dwell)?;
        Some(())
    }
}

fn out_of_range(index: usize) -> PlannerError {
    PlannerError::validation("estimated schedule runs past the supported date range").at_leg(index)
}

/// Schedule `stops` in the given order starting at `departure`.
///
/// Fails with a validation error naming the leg whose arrival cannot be
/// represented.
pub fn schedule(
    stops: &[ScheduleStop],
    return_leg: Option<Leg>,
    departure: NaiveDateTime,
    constraints: &OptimizationConstraints,
    day_start: NaiveTime,
) -> PlannerResult<Schedule> {
    let budget = constraints.daily_driving_budget_minutes();
    let mut clock = DayClock::new(departure, budget, day_start);
    let mut warnings = Vec::new();

    let mut scheduled = Vec::with_capacity(stops.len());
    let mut cumulative_distance = 0.0;
    let mut cumulative_duration = 0.0;

    for (index, stop) in stops.iter().enumerate() {
        let leg = stop.incoming_leg;

        let oversized = clock.drive(leg.duration_minutes()).ok_or_else(|| out_of_range(index))?;
        if oversized {
            warnings.push(oversized_leg_warning(Some(index as u32), &leg, budget));
        }
        cumulative_distance += leg.distance_km();
        cumulative_duration += leg.duration_minutes();

        scheduled.push(Stop {
            sequence: index as u32,
            destination: stop.destination.clone(),
            incoming_leg: leg,
            dwell_minutes: stop.dwell_minutes,
            cumulative_distance_km: cumulative_distance,
            cumulative_duration_minutes: cumulative_duration,
            day_index: clock.day_index,
            estimated_arrival: clock.now,
        });

        clock.rest(stop.dwell_minutes).ok_or_else(|| out_of_range(index))?;
        cumulative_duration += stop.dwell_minutes;
    }

    // No stops means there is nothing to return from
    let return_leg = return_leg.filter(|_| !scheduled.is_empty());
    if let Some(leg) = return_leg {
        let oversized = clock
            .drive(leg.duration_minutes())
            .ok_or_else(|| out_of_range(scheduled.len()))?;
        if oversized {
            warnings.push(oversized_leg_warning(None, &leg, budget));
        }
        cumulative_distance += leg.distance_km();
        cumulative_duration += leg.duration_minutes();
    }

    let metrics = if scheduled.is_empty() {
        RouteMetrics::default()
    } else {
        RouteMetrics {
            total_distance_km: cumulative_distance,
            total_duration_minutes: cumulative_duration,
            total_days: clock.day_index + 1,
            estimated_completion: Some(clock.now),
        }
    };

    Ok(Schedule {
        stops: scheduled,
        return_leg,
        metrics,
        warnings,
    })
}

fn oversized_leg_warning(stop_index: Option<u32>, leg: &Leg, budget: f64) -> RouteWarning {
    let target = match stop_index {
        Some(i) => format!("leg to stop {}", i),
        None => "return leg".to_string(),
    };
    RouteWarning::new(
        stop_index,
        RouteWarning::LEG_EXCEEDS_DAILY_BUDGET,
        format!(
            "{} takes {:.0} min, more than the {:.0} min daily driving budget",
            target,
            leg.duration_minutes(),
            budget
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Coordinates;
    use uuid::Uuid;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn eight() -> NaiveTime {
        NaiveTime::from_hms_opt(8, 0, 0).unwrap()
    }

    fn stop(n: u128, minutes: f64, dwell: f64) -> ScheduleStop {
        ScheduleStop {
            destination: Destination {
                id: Uuid::from_u128(n),
                coordinates: Coordinates::new(44.0 + n as f64 * 0.1, -80.0),
                address: format!("Stop {}", n),
                expected_delivery_date: None,
            },
            incoming_leg: Leg::Exact {
                distance_km: minutes * 80.0 / 60.0,
                duration_minutes: minutes,
            },
            dwell_minutes: dwell,
        }
    }

    #[test]
    fn test_owen_sound_two_day_scenario() {
        let constraints = OptimizationConstraints::default();
        let stops = vec![stop(1, 600.0, 30.0), stop(2, 630.0, 30.0)];

        let result = schedule(&stops, None, at(3, 8, 0), &constraints, eight()).unwrap();

        assert_eq!(result.stops[0].estimated_arrival, at(3, 18, 0));
        assert_eq!(result.stops[0].day_index, 0);
        // B departs day 2 at 08:00 and drives 630 min
        assert_eq!(result.stops[1].estimated_arrival, at(4, 18, 30));
        assert_eq!(result.stops[1].day_index, 1);
        assert_eq!(result.metrics.total_days, 2);
        assert_eq!(result.metrics.estimated_completion, Some(at(4, 19, 0)));
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].warning_type, RouteWarning::LEG_EXCEEDS_DAILY_BUDGET);
        assert_eq!(result.warnings[0].stop_index, Some(1));
    }

    #[test]
    fn test_day_closes_strictly_before_overflowing_leg() {
        let constraints = OptimizationConstraints::default();
        let stops = vec![stop(1, 300.0, 0.0), stop(2, 300.0, 0.0), stop(3, 1.0, 0.0)];

        let result = schedule(&stops, None, at(3, 8, 0), &constraints, eight()).unwrap();

        // 300 + 300 fits exactly; the next minute does not
        assert_eq!(result.stops[1].day_index, 0);
        assert_eq!(result.stops[1].estimated_arrival, at(3, 18, 0));
        assert_eq!(result.stops[2].day_index, 1);
        assert_eq!(result.stops[2].estimated_arrival, at(4, 8, 1));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_cumulative_values_are_monotonic() {
        let constraints = OptimizationConstraints::default();
        let stops: Vec<_> = (1..=8).map(|n| stop(n, 90.0 + n as f64 * 20.0, 15.0)).collect();

        let result = schedule(&stops, None, at(3, 6, 0), &constraints, eight()).unwrap();

        for (i, s) in result.stops.iter().enumerate() {
            assert_eq!(s.sequence, i as u32);
        }
        for pair in result.stops.windows(2) {
            assert!(pair[1].cumulative_distance_km >= pair[0].cumulative_distance_km);
            assert!(pair[1].cumulative_duration_minutes >= pair[0].cumulative_duration_minutes);
            assert!(pair[1].estimated_arrival > pair[0].estimated_arrival);
            assert!(pair[1].day_index >= pair[0].day_index);
        }
    }

    #[test]
    fn test_cumulative_duration_includes_dwell_but_not_rest() {
        let constraints = OptimizationConstraints::default();
        let stops = vec![stop(1, 600.0, 30.0), stop(2, 60.0, 30.0)];

        let result = schedule(&stops, None, at(3, 8, 0), &constraints, eight()).unwrap();

        assert_eq!(result.stops[1].cumulative_duration_minutes, 690.0);
        assert_eq!(result.metrics.total_duration_minutes, 720.0);
    }

    #[test]
    fn test_late_departure_rolls_to_next_morning() {
        let constraints = OptimizationConstraints {
            max_daily_driving_hours: 2.0,
            ..Default::default()
        };
        let stops = vec![stop(1, 100.0, 0.0), stop(2, 100.0, 0.0)];

        let result = schedule(&stops, None, at(3, 22, 0), &constraints, eight()).unwrap();

        // First leg ends 23:40; next start hour after that is the 4th at 08:00
        assert_eq!(result.stops[0].estimated_arrival, at(3, 23, 40));
        assert_eq!(result.stops[1].estimated_arrival, at(4, 9, 40));
    }

    #[test]
    fn test_return_leg_follows_day_rule() {
        let constraints = OptimizationConstraints {
            include_return_trip: true,
            ..Default::default()
        };
        let stops = vec![stop(1, 500.0, 30.0)];
        let back = Leg::Exact {
            distance_km: 400.0,
            duration_minutes: 300.0,
        };

        let result = schedule(&stops, Some(back), at(3, 8, 0), &constraints, eight()).unwrap();

        assert_eq!(result.return_leg, Some(back));
        assert_eq!(result.metrics.total_days, 2);
        assert_eq!(result.metrics.estimated_completion, Some(at(4, 13, 0)));
        assert_eq!(result.metrics.total_duration_minutes, 830.0);
    }

    #[test]
    fn test_no_stops_has_zero_metrics() {
        let result = schedule(
            &[],
            Some(Leg::zero()),
            at(3, 8, 0),
            &OptimizationConstraints::default(),
            eight(),
        )
        .unwrap();

        assert!(result.stops.is_empty());
        assert!(result.return_leg.is_none());
        assert_eq!(result.metrics, RouteMetrics::default());
    }

    #[test]
    fn test_schedule_is_deterministic() {
        let constraints = OptimizationConstraints::default();
        let stops: Vec<_> = (1..=5).map(|n| stop(n, 250.0, 20.0)).collect();

        let a = schedule(&stops, None, at(3, 8, 0), &constraints, eight()).unwrap();
        let b = schedule(&stops, None, at(3, 8, 0), &constraints, eight()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unrepresentable_arrival_is_rejected() {
        let constraints = OptimizationConstraints::default();
        // Roughly what a 1e-9 km/h average speed yields for a 120 km leg
        let stops = vec![stop(1, 60.0, 0.0), stop(2, 7.2e12, 0.0)];

        let result = schedule(&stops, None, at(3, 8, 0), &constraints, eight());

        match result {
            Err(PlannerError::Validation { leg_index, .. }) => assert_eq!(leg_index, Some(1)),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_first_leg_is_not_split() {
        let constraints = OptimizationConstraints::default();
        let stops = vec![stop(1, 900.0, 0.0)];

        let result = schedule(&stops, None, at(3, 8, 0), &constraints, eight()).unwrap();

        assert_eq!(result.stops[0].day_index, 0);
        assert_eq!(result.stops[0].estimated_arrival, at(3, 23, 0));
        assert_eq!(result.warnings.len(), 1);
    }
}
