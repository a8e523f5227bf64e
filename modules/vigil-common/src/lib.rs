pub mod config;
pub mod error;
pub mod file_config;
pub mod types;

pub use config::Config;
pub use error::VigilError;
pub use file_config::{FileConfig, IntakeConfig, SettlementConfig, SubcategoryEntry};
pub use types::*;
