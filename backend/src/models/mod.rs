pub mod action;
pub mod breaker;
pub mod compliance;
pub mod emergency;
pub mod violation;

pub use action::*;
pub use breaker::*;
pub use compliance::*;
pub use emergency::*;
pub use violation::*;
