use std::time::Duration;

use chrono::NaiveTime;

/// Straight-line to road distance factor used by the fallback estimator
pub const DEFAULT_ROAD_COEFFICIENT: f64 = 1.3;

pub const DEFAULT_MAX_DESTINATIONS: usize = 200;

pub const DEFAULT_MAX_IN_FLIGHT_LOOKUPS: usize = 10;

pub const PROVIDER_CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before each retry of a failed provider call
pub const PROVIDER_RETRY_BACKOFF: [Duration; 2] =
    [Duration::from_millis(200), Duration::from_millis(600)];

/// Upper bound on applied 2-opt moves, further capped at n²
pub const TWO_OPT_MAX_ITERATIONS: usize = 5000;

/// Number of most recent deviations averaged for calibration
pub const CALIBRATION_WINDOW: usize = 50;

pub const CALIBRATION_MAX_DEVIATION: f64 = 0.5;

/// Latitude offset of the short sample leg used to measure traffic (~2 km)
pub const TRAFFIC_SAMPLE_OFFSET_DEG: f64 = 0.02;

/// Accepted `averageSpeedKmh` range, inclusive
pub const AVERAGE_SPEED_BOUNDS_KMH: (f64, f64) = (5.0, 150.0);

pub const ROAD_COEFFICIENT_BOUNDS: (f64, f64) = (1.0, 2.0);

pub fn default_day_start() -> NaiveTime {
    NaiveTime::from_hms_opt(8, 0, 0).expect("valid static default day start")
}
