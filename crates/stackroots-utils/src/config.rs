//! # Runtime Configuration
//!
//! Named 32-bit values written as up to eight hexadecimal digits, looked up
//! first in the environment as `STACKROOTS_<NAME>` and then as a `NAME=value`
//! line of the ini file named by `STACKROOTS_CONFIG_FILE`. Missing or
//! malformed values read as 0.
//!
//! ## Example
//!
//! ```rust
//! use stackroots_utils::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_ini_str("MAX_FRAMES=40\n; comment\nVERIFY_EPILOGS = 1\n");
//! assert_eq!(config.get("MAX_FRAMES"), 0x40);
//! assert!(config.get_bool("VERIFY_EPILOGS"));
//! assert_eq!(config.get("UNKNOWN"), 0);
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::{env, fs};

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

/// Environment variable prefix of every value
pub const ENV_PREFIX: &str = "STACKROOTS_";
/// Environment variable naming the ini file
pub const CONFIG_FILE_VAR: &str = "STACKROOTS_CONFIG_FILE";

/// Upper bound on frames a walk visits; 0 means the default
pub const MAX_FRAMES: &str = "MAX_FRAMES";
/// Non-zero runs the epilog validator before legacy epilog matching
pub const VERIFY_EPILOGS: &str = "VERIFY_EPILOGS";
/// Non-zero logs frames that land in unboxing stubs
pub const REPORT_UNBOXING_STUBS: &str = "REPORT_UNBOXING_STUBS";

static GLOBAL_CONFIG: OnceCell<RuntimeConfig> = OnceCell::new();

/// Parse a configuration value: at most eight hex digits, optional `0x`.
pub fn parse_hex_value(text: &str) -> Option<u32>
{
    let digits = text.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    if digits.is_empty() || digits.len() > 8 {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

/// Configuration source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig
{
    /// Values from the ini file, keyed by name
    file_values: HashMap<String, String>,
    /// Read the environment before the file
    use_environment: bool,
}

impl RuntimeConfig
{
    /// Configuration from the process environment and its ini file.
    ///
    /// An unreadable ini file is logged and ignored.
    pub fn from_env() -> Self
    {
        let file_values = env::var_os(CONFIG_FILE_VAR)
            .map(|path| load_ini(Path::new(&path)))
            .unwrap_or_default();
        Self {
            file_values,
            use_environment: true,
        }
    }

    /// Configuration from ini text alone; the environment is not consulted.
    pub fn from_ini_str(text: &str) -> Self
    {
        Self {
            file_values: parse_ini(text),
            use_environment: false,
        }
    }

    /// The process configuration, read once on first use
    pub fn global() -> &'static RuntimeConfig
    {
        GLOBAL_CONFIG.get_or_init(RuntimeConfig::from_env)
    }

    /// Value of `name`, or 0 when missing or malformed.
    pub fn get(&self, name: &str) -> u32
    {
        if self.use_environment {
            if let Some(value) = env::var(format!("{ENV_PREFIX}{name}")).ok().and_then(|v| parse_hex_value(&v)) {
                return value;
            }
        }
        self.file_values
            .get(name)
            .and_then(|value| parse_hex_value(value))
            .unwrap_or(0)
    }

    pub fn get_bool(&self, name: &str) -> bool
    {
        self.get(name) != 0
    }
}

fn parse_ini(text: &str) -> HashMap<String, String>
{
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(';') && !line.starts_with('#') && !line.starts_with('['))
        .filter_map(|line| line.split_once('='))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect()
}

fn load_ini(path: &Path) -> HashMap<String, String>
{
    match fs::read_to_string(path) {
        Ok(text) => {
            let values = parse_ini(&text);
            debug!(path = %path.display(), values = values.len(), "loaded config file");
            values
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot read config file");
            HashMap::new()
        }
    }
}
