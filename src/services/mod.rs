//! Business logic services

pub mod conditions;
pub mod estimator;
pub mod feedback;
pub mod geo;
pub mod routing;
pub mod scheduler;
pub mod sequencer;
pub mod store;
pub mod versions;
