//! # stackroots utilities
//!
//! Logging setup and the runtime configuration reader shared by the
//! `stackroots` workspace.

pub mod config;
pub mod logging;

pub use config::RuntimeConfig;
pub use logging::{init_logging, init_logging_with_level, LogFormat, LogLevel, LoggingError};
pub use tracing::{debug, error, info, trace, warn};
