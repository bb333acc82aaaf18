//! Configuration management

use std::str::FromStr;
use std::time::Duration;

use anyhow::{self, Context, Result};
use chrono::NaiveTime;

use crate::defaults::{
    default_day_start, DEFAULT_MAX_DESTINATIONS, DEFAULT_MAX_IN_FLIGHT_LOOKUPS,
    DEFAULT_ROAD_COEFFICIENT, GENERATION_TIMEOUT, PROVIDER_CALL_TIMEOUT,
};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,

    /// PostgreSQL connection string (required by `serve` and `migrate`)
    pub database_url: Option<String>,

    /// Valhalla routing engine URL (optional, estimator falls back to haversine if unset)
    pub valhalla_url: Option<String>,

    /// Open-Meteo compatible weather API URL (optional, conditions are neutral if unset)
    pub weather_url: Option<String>,

    pub planner: PlannerSettings,
}

/// Tunables for route generation
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerSettings {
    pub max_destinations: usize,
    /// Local start hour of every driving day after the first
    pub day_start: NaiveTime,
    pub road_coefficient: f64,
    pub provider_timeout: Duration,
    pub generation_timeout: Duration,
    pub max_in_flight_lookups: usize,
    /// Let recorded feedback adjust the fallback road coefficient
    pub feedback_calibration: bool,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            max_destinations: DEFAULT_MAX_DESTINATIONS,
            day_start: default_day_start(),
            road_coefficient: DEFAULT_ROAD_COEFFICIENT,
            provider_timeout: PROVIDER_CALL_TIMEOUT,
            generation_timeout: GENERATION_TIMEOUT,
            max_in_flight_lookups: DEFAULT_MAX_IN_FLIGHT_LOOKUPS,
            feedback_calibration: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let nats_url = std::env::var("NATS_URL")
            .unwrap_or_else(|_| "nats://localhost:4222".to_string());

        let database_url = std::env::var("DATABASE_URL").ok();
        let valhalla_url = std::env::var("VALHALLA_URL").ok().filter(|u| !u.is_empty());
        let weather_url = std::env::var("WEATHER_URL").ok().filter(|u| !u.is_empty());

        Ok(Self {
            nats_url,
            database_url,
            valhalla_url,
            weather_url,
            planner: PlannerSettings::from_env()?,
        })
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set")
    }
}

impl PlannerSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let day_start = match std::env::var("DAY_START") {
            Ok(raw) => NaiveTime::parse_from_str(&raw, "%H:%M")
                .with_context(|| format!("DAY_START must be HH:MM (got '{}')", raw))?,
            Err(_) => defaults.day_start,
        };

        let settings = Self {
            max_destinations: env_or("MAX_DESTINATIONS", defaults.max_destinations)?,
            day_start,
            road_coefficient: env_or("ROAD_COEFFICIENT", defaults.road_coefficient)?,
            provider_timeout: Duration::from_millis(env_or(
                "PROVIDER_TIMEOUT_MS",
                defaults.provider_timeout.as_millis() as u64,
            )?),
            generation_timeout: Duration::from_millis(env_or(
                "GENERATION_TIMEOUT_MS",
                defaults.generation_timeout.as_millis() as u64,
            )?),
            max_in_flight_lookups: env_or("MAX_IN_FLIGHT_LOOKUPS", defaults.max_in_flight_lookups)?,
            feedback_calibration: env_or("FEEDBACK_CALIBRATION", defaults.feedback_calibration)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_destinations == 0 {
            anyhow::bail!("MAX_DESTINATIONS must be at least 1");
        }
        if self.max_in_flight_lookups == 0 {
            anyhow::bail!("MAX_IN_FLIGHT_LOOKUPS must be at least 1");
        }
        if !self.road_coefficient.is_finite() || self.road_coefficient < 1.0 {
            anyhow::bail!(
                "ROAD_COEFFICIENT must be >= 1.0 (got {})",
                self.road_coefficient
            );
        }
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = PlannerSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.max_destinations, 200);
        assert_eq!(settings.day_start, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(settings.provider_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_settings_reject_sub_unit_road_coefficient() {
        let settings = PlannerSettings {
            road_coefficient: 0.9,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_env_or_parses_value() {
        std::env::set_var("HAULPLAN_TEST_ENV_OR_PARSE", " 42 ");
        let value: usize = env_or("HAULPLAN_TEST_ENV_OR_PARSE", 1).unwrap();
        assert_eq!(value, 42);
        std::env::remove_var("HAULPLAN_TEST_ENV_OR_PARSE");
    }

    #[test]
    fn test_env_or_rejects_garbage() {
        std::env::set_var("HAULPLAN_TEST_ENV_OR_GARBAGE", "many");
        let value: Result<usize> = env_or("HAULPLAN_TEST_ENV_OR_GARBAGE", 1);
        assert!(value.is_err());
        std::env::remove_var("HAULPLAN_TEST_ENV_OR_GARBAGE");
    }

    #[test]
    fn test_env_or_falls_back_when_unset() {
        let value: f64 = env_or("HAULPLAN_TEST_ENV_OR_UNSET", 1.3).unwrap();
        assert_eq!(value, 1.3);
    }
}
