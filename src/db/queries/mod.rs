//! Database queries

pub mod feedback;
pub mod loads;
pub mod versions;
