//! # Tether Utilities
//!
//! Shared logging and configuration for the Tether binaries.
//!
//! Libraries in the workspace only emit `tracing` events; installing a
//! subscriber and reading `TETHER_*` environment variables is left to the
//! binaries, through this crate.

pub mod config;
pub mod logging;

// Re-export commonly used items for convenience
pub use config::{ConfigError, TetherConfig};
pub use logging::{init_logging, init_logging_with_level, LogFormat, LogLevel, LoggingError};
pub use tracing::{debug, error, info, trace, warn};
