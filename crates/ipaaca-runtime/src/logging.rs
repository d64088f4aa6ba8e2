//! Process-wide `tracing` subscriber driven by [`IpaacaConfig`] log levels

use ipaaca_core::{IpaacaConfig, LogLevel};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter directives for the library crates.
///
/// The transport crate follows `transport_log_level`, everything else
/// follows `log_level`. `verbose` raises the runtime to at least `info`.
pub fn directives(config: &IpaacaConfig) -> String {
    let core = config.log_level.filter_directive();
    let runtime = if config.verbose && config.log_level < LogLevel::Info {
        "info"
    } else {
        core
    };
    format!(
        "ipaaca_runtime={},ipaaca_core={},ipaaca_wire={},ipaaca_transport={}",
        runtime,
        core,
        core,
        config.transport_log_level.filter_directive()
    )
}

/// Install the fmt subscriber. `RUST_LOG` wins over the configured levels.
///
/// Returns false when a global subscriber is already set.
pub fn install(config: &IpaacaConfig) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives(config)));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}
