//! Runtime configuration

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{IpaacaError, PayloadType};

/// Log verbosity levels understood by the runtime
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Logging disabled
    None,
    Critical,
    Error,
    #[default]
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::None => "NONE",
            LogLevel::Critical => "CRITICAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    /// Matching `tracing` filter directive
    pub fn filter_directive(&self) -> &'static str {
        match self {
            LogLevel::None => "off",
            LogLevel::Critical | LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = IpaacaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" | "OFF" => Ok(LogLevel::None),
            "CRITICAL" => Ok(LogLevel::Critical),
            "ERROR" => Ok(LogLevel::Error),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            other => Err(IpaacaError::TypeConversion(format!(
                "unknown log level {}",
                other
            ))),
        }
    }
}

/// Process-wide IPAACA configuration
#[derive(Clone, Debug)]
pub struct IpaacaConfig {
    /// Optional character this process speaks for
    pub character_name: Option<String>,
    /// Optional component name override
    pub component_name: Option<String>,
    /// Payload type for new units
    pub payload_type: PayloadType,
    /// Channel used when none is given
    pub default_channel: String,
    pub log_level: LogLevel,
    pub transport_log_level: LogLevel,
    /// Log every dispatched event
    pub verbose: bool,
    /// Deadline for remote-server calls
    pub rpc_timeout: Duration,
    /// Input buffers request a resend for unknown uids
    pub resend_active: bool,
}

impl Default for IpaacaConfig {
    fn default() -> Self {
        IpaacaConfig {
            character_name: None,
            component_name: None,
            payload_type: PayloadType::Json,
            default_channel: "default".to_string(),
            log_level: LogLevel::Warning,
            transport_log_level: LogLevel::Warning,
            verbose: false,
            rpc_timeout: Duration::from_secs(2),
            resend_active: false,
        }
    }
}

impl IpaacaConfig {
    pub fn with_payload_type(mut self, payload_type: PayloadType) -> Self {
        self.payload_type = payload_type;
        self
    }

    pub fn with_default_channel(mut self, channel: impl Into<String>) -> Self {
        self.default_channel = channel.into();
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_transport_log_level(mut self, level: LogLevel) -> Self {
        self.transport_log_level = level;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_resend_active(mut self, active: bool) -> Self {
        self.resend_active = active;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_character_name(mut self, name: impl Into<String>) -> Self {
        self.character_name = Some(name.into());
        self
    }

    pub fn with_component_name(mut self, name: impl Into<String>) -> Self {
        self.component_name = Some(name.into());
        self
    }
}
