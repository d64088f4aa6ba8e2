//! Runtime handle: shared configuration plus the transport every buffer uses
//!
//! A [`Handle`] is cheap to clone. Tests and embedders create their own with
//! [`Handle::new`]; [`init`] installs a process-wide one backed by a
//! [`LocalBus`] and wires up logging.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use ipaaca_core::{AccessMode, IpaacaConfig, IpaacaResult, ProtocolVersion};
use ipaaca_transport::{LocalBus, Transport};

use crate::input::InputBuffer;
use crate::logging;
use crate::output::OutputBuffer;
use crate::unit::Unit;

struct HandleInner {
    config: IpaacaConfig,
    transport: Arc<dyn Transport>,
}

#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    /// Fails when the transport speaks an incompatible protocol version
    pub fn new(config: IpaacaConfig, transport: Arc<dyn Transport>) -> IpaacaResult<Self> {
        ProtocolVersion::CURRENT.check_compatible(&transport.protocol_version())?;
        Ok(Handle {
            inner: Arc::new(HandleInner { config, transport }),
        })
    }

    /// Handle over a fresh in-process bus
    pub fn local(config: IpaacaConfig) -> IpaacaResult<Self> {
        Self::new(config, Arc::new(LocalBus::new()?))
    }

    pub fn config(&self) -> &IpaacaConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.inner.transport)
    }

    /// Component name from the config, or `fallback`
    fn component<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.inner.config.component_name.as_deref().unwrap_or(fallback)
    }

    pub fn output_buffer(&self, component: &str) -> IpaacaResult<OutputBuffer> {
        OutputBuffer::new(self.component(component), self.transport(), &self.inner.config)
    }

    pub fn input_buffer(&self, component: &str, categories: &[&str]) -> IpaacaResult<InputBuffer> {
        InputBuffer::new(self.component(component), categories, self.transport(), &self.inner.config)
    }

    /// Unit using the configured payload type
    pub fn new_unit(&self, category: &str) -> IpaacaResult<Unit> {
        Unit::builder(category)
            .payload_type(self.inner.config.payload_type)
            .build()
    }

    /// Message using the configured payload type
    pub fn new_message(&self, category: &str) -> IpaacaResult<Unit> {
        Unit::builder(category)
            .payload_type(self.inner.config.payload_type)
            .access_mode(AccessMode::Message)
            .build()
    }
}

static GLOBAL: Mutex<Option<Handle>> = parking_lot::const_mutex(None);

/// Install logging and the process-wide handle. Later calls keep the first
/// handle and return it.
pub fn init(config: IpaacaConfig) -> IpaacaResult<Handle> {
    let mut global = GLOBAL.lock();
    if let Some(handle) = global.as_ref() {
        warn!("ipaaca runtime already initialized; ignoring new configuration");
        return Ok(handle.clone());
    }
    let installed = logging::install(&config);
    let handle = Handle::local(config)?;
    info!(
        "ipaaca runtime initialized (protocol {}, logging {})",
        ProtocolVersion::CURRENT,
        if installed { "installed" } else { "external" }
    );
    *global = Some(handle.clone());
    Ok(handle)
}

/// The handle installed by [`init`], if any
pub fn global() -> Option<Handle> {
    GLOBAL.lock().clone()
}
