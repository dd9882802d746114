pub mod config;
pub mod error;
pub mod types;

pub use config::{BrowserEndpoint, HarvestConfig};
pub use error::HarvestError;
pub use types::*;
