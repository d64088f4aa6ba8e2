//! Output buffer: owns and publishes local units

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use ipaaca_core::{
    category_channel, BufferName, BufferRole, EventMask, IpaacaConfig, IpaacaError, IpaacaResult,
    IuEventType, Revision,
};
use ipaaca_transport::{Endpoint, RpcServer, Transport};
use ipaaca_wire::{
    decode, encode, encode_response, LinkUpdate, PayloadUpdate, ResendRequest, TerminalKind,
    TerminalRecord, WireRecord,
};

use crate::dispatch::{EventDispatcher, HandlerId};
use crate::sink::OutboundSink;
use crate::unit::Unit;

/// RPC method names served by every output buffer
pub const METHOD_UPDATE_PAYLOAD: &str = "updatePayload";
pub const METHOD_UPDATE_LINKS: &str = "updateLinks";
pub const METHOD_COMMIT: &str = "commit";
pub const METHOD_RESEND_REQUEST: &str = "resendRequest";

struct OutputInner {
    name: BufferName,
    channel: String,
    transport: Arc<dyn Transport>,
    units: RwLock<HashMap<String, Unit>>,
    dispatcher: EventDispatcher,
    endpoint: Mutex<Option<Box<dyn Endpoint>>>,
    self_ref: Weak<OutputInner>,
}

/// Publishes owned units and answers remote write requests for them
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<OutputInner>,
}

impl OutputBuffer {
    pub fn new(component: &str, transport: Arc<dyn Transport>, config: &IpaacaConfig) -> IpaacaResult<Self> {
        let name = BufferName::allocate(component, BufferRole::Output);
        let inner = Arc::new_cyclic(|self_ref| OutputInner {
            name,
            channel: config.default_channel.clone(),
            transport,
            units: RwLock::new(HashMap::new()),
            dispatcher: EventDispatcher::new(config.verbose),
            endpoint: Mutex::new(None),
            self_ref: self_ref.clone(),
        });

        let server = Arc::new(OutputServer {
            buffer: Arc::downgrade(&inner),
        });
        let endpoint = inner.transport.serve(inner.name.as_str(), server)?;
        *inner.endpoint.lock() = Some(endpoint);
        info!("output buffer {} on channel {}", inner.name, inner.channel);

        Ok(OutputBuffer { inner })
    }

    pub fn unique_name(&self) -> &str {
        self.inner.name.as_str()
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Publish a unit. Messages are sent once and not kept.
    pub fn add(&self, unit: &Unit) -> IpaacaResult<()> {
        let sink: Weak<dyn OutboundSink> = self.inner.self_ref.clone();
        let inner = &self.inner;
        unit.attach_output(sink, inner.name.as_str(), |snapshot| {
            let channel = category_channel(&inner.channel, &snapshot.category);
            if unit.is_message() {
                debug!("sending message {} on {}", snapshot.uid, channel);
                inner.publish(&channel, &WireRecord::Message(snapshot.clone()))
            } else {
                inner.units.write().insert(snapshot.uid.clone(), unit.clone());
                debug!("publishing unit {} on {}", snapshot.uid, channel);
                inner.publish(&channel, &WireRecord::Unit(snapshot.clone()))
            }
        })
    }

    /// Withdraw a unit from this buffer; mirrors evict it
    pub fn remove(&self, uid: &str) -> IpaacaResult<Unit> {
        let unit = self
            .inner
            .units
            .write()
            .remove(uid)
            .ok_or_else(|| IpaacaError::NotFound(uid.to_string()))?;
        let record = WireRecord::Terminal(TerminalRecord {
            uid: uid.to_string(),
            revision: unit.revision(),
            writer_name: self.inner.name.as_str().to_string(),
            kind: TerminalKind::Deletion,
        });
        let channel = category_channel(&self.inner.channel, &unit.category());
        self.inner.publish(&channel, &record)?;
        Ok(unit)
    }

    pub fn retract(&self, uid: &str) -> IpaacaResult<()> {
        let unit = self.get(uid).ok_or_else(|| IpaacaError::NotFound(uid.to_string()))?;
        unit.retract()
    }

    pub fn get(&self, uid: &str) -> Option<Unit> {
        self.inner.units.read().get(uid).cloned()
    }

    pub fn units(&self) -> Vec<Unit> {
        self.inner.units.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.units.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.units.read().is_empty()
    }

    /// Handlers fire for changes made by remote writers
    pub fn register_handler<F>(&self, callback: F, mask: EventMask, category: Option<&str>) -> HandlerId
    where
        F: Fn(&Unit, IuEventType, bool) + Send + Sync + 'static,
    {
        self.inner.dispatcher.register_handler(callback, mask, category)
    }

    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        self.inner.dispatcher.unregister_handler(id)
    }

    /// Stop answering remote requests
    pub fn close(&self) {
        if let Some(endpoint) = self.inner.endpoint.lock().take() {
            endpoint.close();
        }
    }
}

impl OutputInner {
    fn publish(&self, channel: &str, record: &WireRecord) -> IpaacaResult<()> {
        let frame = encode(record)?;
        self.transport.publish(channel, frame)
    }

    fn publish_for(&self, category: &str, uid: &str, record: WireRecord) -> IpaacaResult<()> {
        if !self.units.read().contains_key(uid) {
            debug!("unit {} is no longer in {}; not sending", uid, self.name);
            return Ok(());
        }
        self.publish(&category_channel(&self.channel, category), &record)
    }

    fn lookup(&self, uid: &str) -> Option<Unit> {
        self.units.read().get(uid).cloned()
    }

    fn remote_update_payload(&self, update: PayloadUpdate) -> Revision {
        let Some(unit) = self.lookup(&update.uid) else {
            warn!("remote payload update for unknown unit {}", update.uid);
            return 0;
        };
        if unit.is_read_only() {
            warn!("remote payload update rejected: {} is read-only", update.uid);
            return 0;
        }
        match unit.modify_payload_as(
            update.is_delta,
            update.new_items,
            update.keys_to_remove,
            Some(&update.writer_name),
        ) {
            Ok(revision) => {
                self.dispatcher.dispatch(&unit, IuEventType::Updated, true);
                revision
            }
            Err(e) => {
                reject("payload update", &update.uid, &e);
                0
            }
        }
    }

    fn remote_update_links(&self, update: LinkUpdate) -> Revision {
        let Some(unit) = self.lookup(&update.uid) else {
            warn!("remote link update for unknown unit {}", update.uid);
            return 0;
        };
        if unit.is_read_only() {
            warn!("remote link update rejected: {} is read-only", update.uid);
            return 0;
        }
        match unit.modify_links_as(
            update.is_delta,
            &update.new_links,
            &update.links_to_remove,
            Some(&update.writer_name),
        ) {
            Ok(revision) => {
                self.dispatcher.dispatch(&unit, IuEventType::LinksUpdated, true);
                revision
            }
            Err(e) => {
                reject("link update", &update.uid, &e);
                0
            }
        }
    }

    fn remote_commit(&self, record: TerminalRecord) -> Revision {
        let Some(unit) = self.lookup(&record.uid) else {
            warn!("remote commit for unknown unit {}", record.uid);
            return 0;
        };
        if unit.is_read_only() || unit.is_committed() {
            return 0;
        }
        match unit.commit_as(Some(&record.writer_name)) {
            Ok(revision) => {
                self.dispatcher.dispatch(&unit, IuEventType::Committed, true);
                revision
            }
            Err(e) => {
                reject("commit", &record.uid, &e);
                0
            }
        }
    }

    fn resend(&self, request: ResendRequest) -> IpaacaResult<Revision> {
        let Some(unit) = self.lookup(&request.uid) else {
            warn!("resend requested for unknown unit {}", request.uid);
            return Ok(0);
        };
        if request.hidden_scope_name.is_empty() {
            return Ok(0);
        }
        let snapshot = unit.snapshot();
        let revision = snapshot.revision;
        let channel = category_channel(&self.channel, &request.hidden_scope_name);
        debug!("resending {} on {}", request.uid, channel);
        self.publish(&channel, &WireRecord::Unit(snapshot))?;
        Ok(revision)
    }
}

/// Log a refused remote write; latch and permission refusals go to info
fn reject(what: &str, uid: &str, error: &IpaacaError) {
    if error.is_state_violation() {
        info!("remote {} of {} refused: {}", what, uid, error);
    } else {
        warn!("remote {} of {} rejected: {}", what, uid, error);
    }
}

impl OutboundSink for OutputInner {
    fn send_payload_update(&self, category: &str, update: PayloadUpdate) -> IpaacaResult<()> {
        let uid = update.uid.clone();
        self.publish_for(category, &uid, WireRecord::Payload(update))
    }

    fn send_link_update(&self, category: &str, update: LinkUpdate) -> IpaacaResult<()> {
        let uid = update.uid.clone();
        self.publish_for(category, &uid, WireRecord::Links(update))
    }

    fn send_terminal(&self, category: &str, record: TerminalRecord) -> IpaacaResult<()> {
        let uid = record.uid.clone();
        self.publish_for(category, &uid, WireRecord::Terminal(record))
    }
}

/// RPC endpoint of an output buffer
struct OutputServer {
    buffer: Weak<OutputInner>,
}

impl RpcServer for OutputServer {
    fn handle(&self, method: &str, request: &[u8]) -> IpaacaResult<Bytes> {
        let buffer = self
            .buffer
            .upgrade()
            .ok_or_else(|| IpaacaError::TransportError("output buffer is gone".into()))?;
        let revision = match (method, decode(request)?) {
            (METHOD_UPDATE_PAYLOAD, WireRecord::Payload(update)) => buffer.remote_update_payload(update),
            (METHOD_UPDATE_LINKS, WireRecord::Links(update)) => buffer.remote_update_links(update),
            (METHOD_COMMIT, WireRecord::Terminal(record)) if record.kind == TerminalKind::Commission => {
                buffer.remote_commit(record)
            }
            (METHOD_RESEND_REQUEST, WireRecord::Resend(request)) => buffer.resend(request)?,
            (method, record) => {
                return Err(IpaacaError::InvalidWireFormat(format!(
                    "method {} does not accept {:?} records",
                    method,
                    record.kind()
                )))
            }
        };
        Ok(encode_response(revision))
    }
}
