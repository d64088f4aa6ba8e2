//! Input buffer: mirrors remote units and brokers writes to their owners

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use ipaaca_core::{
    category_channel, BufferName, BufferRole, EventMask, IpaacaConfig, IpaacaError, IpaacaResult,
    IuEventType, Revision,
};
use ipaaca_transport::{Deliver, RemoteServer, Subscription, Transport};
use ipaaca_wire::{
    decode, decode_response, encode, LinkUpdate, PayloadUpdate, ResendRequest, TerminalKind,
    TerminalRecord, WireRecord,
};

use crate::dispatch::{EventDispatcher, HandlerId};
use crate::output::{METHOD_COMMIT, METHOD_RESEND_REQUEST, METHOD_UPDATE_LINKS, METHOD_UPDATE_PAYLOAD};
use crate::sink::RemoteBroker;
use crate::unit::{Durability, Unit};

/// Callback for inbound data that could not be used: `(channel, error)`
pub type ErrorHandlerFn = Arc<dyn Fn(&str, &IpaacaError) + Send + Sync>;

struct InputInner {
    name: BufferName,
    channel: String,
    transport: Arc<dyn Transport>,
    categories: RwLock<BTreeSet<String>>,
    units: RwLock<HashMap<String, Unit>>,
    remotes: Mutex<HashMap<String, Arc<dyn RemoteServer>>>,
    dispatcher: EventDispatcher,
    error_handlers: RwLock<Vec<ErrorHandlerFn>>,
    subscription: Mutex<Option<Box<dyn Subscription>>>,
    resend_active: bool,
    rpc_timeout: Duration,
    self_ref: Weak<InputInner>,
}

/// Mirrors units published on a set of categories
#[derive(Clone)]
pub struct InputBuffer {
    inner: Arc<InputInner>,
}

impl InputBuffer {
    pub fn new(
        component: &str,
        categories: &[&str],
        transport: Arc<dyn Transport>,
        config: &IpaacaConfig,
    ) -> IpaacaResult<Self> {
        let name = BufferName::allocate(component, BufferRole::Input);
        let inner = Arc::new_cyclic(|self_ref| InputInner {
            name,
            channel: config.default_channel.clone(),
            transport,
            categories: RwLock::new(categories.iter().map(|c| c.to_string()).collect()),
            units: RwLock::new(HashMap::new()),
            remotes: Mutex::new(HashMap::new()),
            dispatcher: EventDispatcher::new(config.verbose),
            error_handlers: RwLock::new(Vec::new()),
            subscription: Mutex::new(None),
            resend_active: config.resend_active,
            rpc_timeout: config.rpc_timeout,
            self_ref: self_ref.clone(),
        });

        let mut channels: Vec<String> = categories
            .iter()
            .map(|c| category_channel(&inner.channel, c))
            .collect();
        channels.push(category_channel(&inner.channel, inner.name.short()));
        let sink = Arc::new(InboundSink {
            buffer: Arc::downgrade(&inner),
        });
        let subscription = inner.transport.listen(&channels, sink)?;
        *inner.subscription.lock() = Some(subscription);
        info!("input buffer {} listening on {:?}", inner.name, categories);

        Ok(InputBuffer { inner })
    }

    pub fn unique_name(&self) -> &str {
        self.inner.name.as_str()
    }

    /// Category on which resent units arrive
    pub fn hidden_category(&self) -> &str {
        self.inner.name.short()
    }

    pub fn categories(&self) -> Vec<String> {
        self.inner.categories.read().iter().cloned().collect()
    }

    /// Start mirroring another category
    pub fn add_category_interest(&self, category: &str) {
        if !self.inner.categories.write().insert(category.to_string()) {
            return;
        }
        if let Some(subscription) = self.inner.subscription.lock().as_ref() {
            subscription.add_channel(&category_channel(&self.inner.channel, category));
        }
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

    pub fn register_handler<F>(&self, callback: F, mask: EventMask, category: Option<&str>) -> HandlerId
    where
        F: Fn(&Unit, IuEventType, bool) + Send + Sync + 'static,
    {
        self.inner.dispatcher.register_handler(callback, mask, category)
    }

    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        self.inner.dispatcher.unregister_handler(id)
    }

    /// Be told about malformed or unusable inbound records
    pub fn register_error_handler<F>(&self, callback: F)
    where
        F: Fn(&str, &IpaacaError) + Send + Sync + 'static,
    {
        self.inner.error_handlers.write().push(Arc::new(callback));
    }

    /// Stop listening and drop every mirrored unit
    pub fn close(&self) {
        if let Some(subscription) = self.inner.subscription.lock().take() {
            subscription.close();
        }
        self.inner.units.write().clear();
        self.inner.remotes.lock().clear();
    }
}

impl InputInner {
    fn report(&self, channel: &str, error: &IpaacaError) {
        if error.is_wire_error() {
            warn!("{}: malformed record on {}: {}", self.name, channel, error);
        } else {
            info!("{}: dropping record on {}: {}", self.name, channel, error);
        }
        let handlers: Vec<ErrorHandlerFn> = self.error_handlers.read().clone();
        for handler in handlers {
            handler(channel, error);
        }
    }

    fn broker(&self) -> Weak<dyn RemoteBroker> {
        self.self_ref.clone()
    }

    fn lookup(&self, uid: &str) -> Option<Unit> {
        self.units.read().get(uid).cloned()
    }

    fn handle(&self, channel: &str, record: WireRecord) {
        match record {
            WireRecord::Unit(snapshot) => {
                let uid = snapshot.uid.clone();
                let unit = {
                    let mut units = self.units.write();
                    if units.contains_key(&uid) {
                        debug!("{} already mirrors {}", self.name, uid);
                        return;
                    }
                    let unit = Unit::from_snapshot(snapshot, Durability::Durable, self.broker());
                    units.insert(uid, unit.clone());
                    unit
                };
                self.dispatcher.dispatch(&unit, IuEventType::Added, false);
            }
            WireRecord::Message(snapshot) => {
                let unit = Unit::from_snapshot(snapshot, Durability::Ephemeral, self.broker());
                self.dispatcher.dispatch(&unit, IuEventType::Message, false);
            }
            WireRecord::Payload(update) => {
                let Some(unit) = self.known(channel, &update.uid, &update.writer_name) else {
                    return;
                };
                unit.apply_update(&update);
                self.dispatcher.dispatch(&unit, IuEventType::Updated, false);
            }
            WireRecord::Links(update) => {
                let Some(unit) = self.known(channel, &update.uid, &update.writer_name) else {
                    return;
                };
                unit.apply_link_update(&update);
                self.dispatcher.dispatch(&unit, IuEventType::LinksUpdated, false);
            }
            WireRecord::Terminal(record) => match record.kind {
                TerminalKind::Commission => {
                    let Some(unit) = self.known(channel, &record.uid, &record.writer_name) else {
                        return;
                    };
                    unit.apply_commission(record.revision);
                    self.dispatcher.dispatch(&unit, IuEventType::Committed, false);
                }
                TerminalKind::Retraction => {
                    let Some(unit) = self.known(channel, &record.uid, &record.writer_name) else {
                        return;
                    };
                    unit.apply_retraction(record.revision);
                    self.dispatcher.dispatch(&unit, IuEventType::Retracted, false);
                }
                TerminalKind::Deletion => {
                    let removed = self.units.write().remove(&record.uid);
                    match removed {
                        Some(unit) => self.dispatcher.dispatch(&unit, IuEventType::Deleted, false),
                        None => debug!("deletion of unknown unit {}", record.uid),
                    }
                }
            },
            WireRecord::Resend(request) => {
                debug!("{} ignores resend request for {}", self.name, request.uid);
            }
        }
    }

    /// Cached unit for an update, or `None` after requesting a resend
    fn known(&self, channel: &str, uid: &str, writer: &str) -> Option<Unit> {
        if let Some(unit) = self.lookup(uid) {
            return Some(unit);
        }
        if !self.resend_active {
            self.report(channel, &IpaacaError::NotFound(uid.to_string()));
            return None;
        }
        debug!("{} requests resend of {} from {}", self.name, uid, writer);
        let request = WireRecord::Resend(ResendRequest {
            uid: uid.to_string(),
            hidden_scope_name: self.name.short().to_string(),
        });
        if let Err(e) = self.call(writer, METHOD_RESEND_REQUEST, &request) {
            self.report(channel, &e);
        }
        None
    }

    fn remote(&self, endpoint: &str) -> IpaacaResult<Arc<dyn RemoteServer>> {
        let mut remotes = self.remotes.lock();
        if let Some(remote) = remotes.get(endpoint) {
            return Ok(Arc::clone(remote));
        }
        let remote = self.transport.remote(endpoint)?;
        remotes.insert(endpoint.to_string(), Arc::clone(&remote));
        Ok(remote)
    }

    fn call(&self, endpoint: &str, method: &str, record: &WireRecord) -> IpaacaResult<Revision> {
        let request = encode(record)?;
        let reply = self.remote(endpoint)?.call(method, request, self.rpc_timeout)?;
        decode_response(&reply)
    }

    /// Remote write; transport failures surface as `UpdateFailed`
    fn forward(&self, owner: &str, method: &str, record: WireRecord) -> IpaacaResult<Revision> {
        let uid = record.uid().to_string();
        self.call(owner, method, &record).map_err(|e| {
            warn!("{} on {} for {} failed: {}", method, owner, uid, e);
            IpaacaError::UpdateFailed(format!("{} ({})", uid, e))
        })
    }
}

impl RemoteBroker for InputInner {
    fn unique_name(&self) -> String {
        self.name.as_str().to_string()
    }

    fn remote_update_payload(&self, owner: &str, update: PayloadUpdate) -> IpaacaResult<Revision> {
        self.forward(owner, METHOD_UPDATE_PAYLOAD, WireRecord::Payload(update))
    }

    fn remote_update_links(&self, owner: &str, update: LinkUpdate) -> IpaacaResult<Revision> {
        self.forward(owner, METHOD_UPDATE_LINKS, WireRecord::Links(update))
    }

    fn remote_commit(&self, owner: &str, record: TerminalRecord) -> IpaacaResult<Revision> {
        self.forward(owner, METHOD_COMMIT, WireRecord::Terminal(record))
    }
}

/// Listener registered with the transport; holds the buffer weakly so that
/// dropping the last `InputBuffer` handle ends the subscription
struct InboundSink {
    buffer: Weak<InputInner>,
}

impl Deliver for InboundSink {
    fn deliver(&self, channel: &str, frame: Bytes) {
        let Some(buffer) = self.buffer.upgrade() else {
            return;
        };
        match decode(&frame) {
            Ok(record) => buffer.handle(channel, record),
            Err(e) => buffer.report(channel, &e),
        }
    }
}
