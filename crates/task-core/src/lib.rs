pub mod config;
pub mod events;
pub mod policy;
pub mod types;

pub use config::{Config, TierSpec};
pub use policy::AutonomyPolicy;
pub use types::*;
