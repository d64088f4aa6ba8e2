//! Seams between units and the buffer they belong to

use ipaaca_core::{IpaacaResult, Revision};
use ipaaca_wire::{LinkUpdate, PayloadUpdate, TerminalRecord};

/// Emission side of an output buffer, called by owned units
pub(crate) trait OutboundSink: Send + Sync {
    fn send_payload_update(&self, category: &str, update: PayloadUpdate) -> IpaacaResult<()>;

    fn send_link_update(&self, category: &str, update: LinkUpdate) -> IpaacaResult<()>;

    fn send_terminal(&self, category: &str, record: TerminalRecord) -> IpaacaResult<()>;
}

/// RPC side of an input buffer, called by remote units.
///
/// Each call returns the owner's answer verbatim; `0` means rejected.
pub(crate) trait RemoteBroker: Send + Sync {
    /// Writer name put on forwarded requests
    fn unique_name(&self) -> String;

    fn remote_update_payload(&self, owner: &str, update: PayloadUpdate) -> IpaacaResult<Revision>;

    fn remote_update_links(&self, owner: &str, update: LinkUpdate) -> IpaacaResult<Revision>;

    fn remote_commit(&self, owner: &str, record: TerminalRecord) -> IpaacaResult<Revision>;
}
