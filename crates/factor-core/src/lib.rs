pub mod config;
pub mod types;

pub use config::FactorConfig;
pub use types::*;
