//! Arguments every IPAACA tool accepts

use clap::Args;

use ipaaca_core::{IpaacaConfig, LogLevel, PayloadType};

#[derive(Args, Debug, Clone, Default)]
pub struct IpaacaArgs {
    /// Log every dispatched event
    #[arg(long)]
    pub verbose: bool,

    #[arg(long, value_name = "NAME")]
    pub character_name: Option<String>,

    #[arg(long, value_name = "NAME")]
    pub component_name: Option<String>,

    /// Payload type for new units: MAP, JSON or STR
    #[arg(long = "ipaaca-payload-type", value_name = "TYPE")]
    pub payload_type: Option<PayloadType>,

    #[arg(long = "ipaaca-default-channel", value_name = "NAME")]
    pub default_channel: Option<String>,

    /// Library log level: NONE, CRITICAL, ERROR, WARNING, INFO or DEBUG
    #[arg(long = "ipaaca-enable-logging", value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Transport log level
    #[arg(long = "rsb-enable-logging", value_name = "LEVEL")]
    pub transport_log_level: Option<LogLevel>,
}

impl IpaacaArgs {
    /// Overlay the given flags on the default configuration
    pub fn to_config(&self) -> IpaacaConfig {
        let mut config = IpaacaConfig::default().with_verbose(self.verbose);
        if let Some(name) = &self.character_name {
            config = config.with_character_name(name.clone());
        }
        if let Some(name) = &self.component_name {
            config = config.with_component_name(name.clone());
        }
        if let Some(payload_type) = self.payload_type {
            config = config.with_payload_type(payload_type);
        }
        if let Some(channel) = &self.default_channel {
            config = config.with_default_channel(channel.clone());
        }
        if let Some(level) = self.log_level {
            config = config.with_log_level(level);
        }
        if let Some(level) = self.transport_log_level {
            config = config.with_transport_log_level(level);
        }
        config
    }
}
