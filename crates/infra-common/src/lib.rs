/*!
# infra-common

Common infrastructure layer for the OPENCELL base station stack:

- Logging setup and standardization
- Key/value configuration store with typed accessors
- Common error types

This crate is a horizontal layer the other components build on so that
logging and configuration behave the same everywhere.
*/

pub mod config;
pub mod errors;
pub mod logging;

pub use config::ConfigStore;
pub use errors::{Error, Result};
pub use logging::{setup_logging, LoggingConfig};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
