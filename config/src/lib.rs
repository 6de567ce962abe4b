pub mod config;

pub use config::{Config, ConfigManager, General, ValidationError, VirtualDevice};
