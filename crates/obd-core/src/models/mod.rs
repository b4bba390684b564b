//! Value objects shared across the diagnostic pipeline

mod analysis;
mod code;
mod endpoint;
mod sensor;
mod session;
mod severity;
mod vehicle;

pub use analysis::*;
pub use code::*;
pub use endpoint::*;
pub use sensor::*;
pub use session::*;
pub use severity::*;
pub use vehicle::*;
