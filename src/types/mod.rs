//! Type definitions

pub mod feedback;
pub mod load;
pub mod messages;
pub mod planning;
pub mod route;

pub use feedback::*;
pub use load::*;
pub use messages::*;
pub use planning::*;
pub use route::*;
