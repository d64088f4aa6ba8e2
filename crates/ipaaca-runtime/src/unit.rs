//! Incremental units
//!
//! One data layout carries all four behaviours, selected by `UnitKind`:
//!
//! | ownership   | durability | writes                                   |
//! |-------------|------------|------------------------------------------|
//! | Owned       | Durable    | latch checks, revision + 1, broadcast    |
//! | Owned       | Ephemeral  | like Durable until sent, then ignored    |
//! | RemoteProxy | Durable    | forwarded to the owner by RPC            |
//! | RemoteProxy | Ephemeral  | local effect only                        |
//!
//! Every state check, revision change and send decision of a unit happens
//! under its reentrant state lock.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::ReentrantMutex;
use tracing::{debug, info, warn};

use ipaaca_core::{
    generate_uid, link_map, AccessMode, DocumentMap, DocumentValue, IpaacaError, IpaacaResult,
    LinkGraph, LinkMap, PayloadType, Revision,
};
use ipaaca_wire::{LinkUpdate, PayloadUpdate, TerminalKind, TerminalRecord, UnitSnapshot};

use crate::payload::{BatchState, Payload};
use crate::sink::{OutboundSink, RemoteBroker};

/// Who holds authority over a unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ownership {
    Owned,
    RemoteProxy,
}

/// Whether a unit lives on after it was sent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Durability {
    Durable,
    Ephemeral,
}

/// Behaviour selector of a unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UnitKind {
    pub ownership: Ownership,
    pub durability: Durability,
}

impl UnitKind {
    pub const UNIT: UnitKind = UnitKind {
        ownership: Ownership::Owned,
        durability: Durability::Durable,
    };
    pub const MESSAGE: UnitKind = UnitKind {
        ownership: Ownership::Owned,
        durability: Durability::Ephemeral,
    };
    pub const REMOTE_UNIT: UnitKind = UnitKind {
        ownership: Ownership::RemoteProxy,
        durability: Durability::Durable,
    };
    pub const REMOTE_MESSAGE: UnitKind = UnitKind {
        ownership: Ownership::RemoteProxy,
        durability: Durability::Ephemeral,
    };

    #[inline]
    pub fn is_remote(self) -> bool {
        self.ownership == Ownership::RemoteProxy
    }

    #[inline]
    pub fn is_ephemeral(self) -> bool {
        self.durability == Durability::Ephemeral
    }
}

pub(crate) enum BufferLink {
    Detached,
    Output(Weak<dyn OutboundSink>),
    Input(Weak<dyn RemoteBroker>),
}

/// Outcome of the write guard
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteGate {
    Apply,
    /// Sent message; the write has no effect
    Ignore,
}

pub(crate) struct UnitState {
    uid: String,
    revision: Revision,
    category: String,
    payload_type: PayloadType,
    owner_name: String,
    committed: bool,
    retracted: bool,
    read_only: bool,
    access_mode: AccessMode,
    payload: DocumentMap,
    links: LinkGraph,
    buffer: BufferLink,
}

impl UnitState {
    fn is_published(&self) -> bool {
        !matches!(self.buffer, BufferLink::Detached)
    }

    fn check_latches(&self) -> IpaacaResult<()> {
        if self.committed {
            Err(IpaacaError::Committed(self.uid.clone()))
        } else if self.retracted {
            Err(IpaacaError::Retracted(self.uid.clone()))
        } else {
            Ok(())
        }
    }

    fn apply_payload(&mut self, is_delta: bool, new_items: &DocumentMap, keys_to_remove: &BTreeSet<String>) {
        if is_delta {
            for key in keys_to_remove {
                self.payload.remove(key);
            }
        } else {
            self.payload.clear();
        }
        for (key, value) in new_items {
            self.payload.insert(key.clone(), value.clone());
        }
    }

    fn apply_links(&mut self, is_delta: bool, new_links: &LinkMap, links_to_remove: &LinkMap) {
        if is_delta {
            self.links.add_and_remove_links(new_links, links_to_remove);
        } else {
            self.links.replace_links(new_links.clone());
        }
    }

    fn outbound(&self) -> Option<(Arc<dyn OutboundSink>, String)> {
        match &self.buffer {
            BufferLink::Output(sink) => sink.upgrade().map(|s| (s, self.category.clone())),
            _ => None,
        }
    }

    fn broker(&self) -> IpaacaResult<Arc<dyn RemoteBroker>> {
        match &self.buffer {
            BufferLink::Input(broker) => broker
                .upgrade()
                .ok_or_else(|| IpaacaError::UpdateFailed(format!("{} (input buffer closed)", self.uid))),
            _ => Err(IpaacaError::Unpublished(self.uid.clone())),
        }
    }

    fn writer(&self, writer: Option<&str>) -> String {
        writer.map(str::to_string).unwrap_or_else(|| self.owner_name.clone())
    }

    fn snapshot(&self) -> UnitSnapshot {
        UnitSnapshot {
            uid: self.uid.clone(),
            revision: self.revision,
            category: self.category.clone(),
            payload_type: self.payload_type,
            owner_name: self.owner_name.clone(),
            committed: self.committed,
            retracted: self.retracted,
            read_only: self.read_only,
            access_mode: self.access_mode,
            payload: self.payload.clone(),
            links: self.links.all_links().clone(),
        }
    }
}

pub(crate) struct UnitInner {
    pub(crate) kind: UnitKind,
    pub(crate) state: ReentrantMutex<RefCell<UnitState>>,
    pub(crate) batch: ReentrantMutex<RefCell<BatchState>>,
}

/// Coerce a value into what the payload type can carry
pub(crate) fn normalize_value(payload_type: PayloadType, value: DocumentValue) -> IpaacaResult<DocumentValue> {
    match payload_type {
        PayloadType::Json if !value.is_finite() => Err(IpaacaError::TypeConversion(format!(
            "JSON payloads cannot carry a non-finite float in a {}",
            value.kind_name()
        ))),
        PayloadType::Json => Ok(value),
        PayloadType::Str => Ok(match value {
            DocumentValue::String(_) => value,
            other => DocumentValue::String(other.to_text()),
        }),
        PayloadType::Map => {
            if value.is_container() {
                Err(IpaacaError::TypeConversion(format!(
                    "MAP payloads hold scalars only, got a {}",
                    value.kind_name()
                )))
            } else {
                Ok(match value {
                    DocumentValue::String(_) => value,
                    other => DocumentValue::String(other.to_text()),
                })
            }
        }
    }
}

fn normalize_items(payload_type: PayloadType, items: DocumentMap) -> IpaacaResult<DocumentMap> {
    items
        .into_iter()
        .map(|(k, v)| normalize_value(payload_type, v).map(|v| (k, v)))
        .collect()
}

/// Builder for owned units and messages
#[derive(Clone, Debug)]
pub struct UnitBuilder {
    category: String,
    payload_type: PayloadType,
    read_only: bool,
    access_mode: AccessMode,
    uid: Option<String>,
    payload: DocumentMap,
}

impl UnitBuilder {
    pub fn payload_type(mut self, payload_type: PayloadType) -> Self {
        self.payload_type = payload_type;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn access_mode(mut self, access_mode: AccessMode) -> Self {
        self.access_mode = access_mode;
        self
    }

    /// Initial payload, present at revision 1
    pub fn payload(mut self, payload: DocumentMap) -> Self {
        self.payload = payload;
        self
    }

    /// Explicit uid; an empty string defers allocation to publication
    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn build(self) -> IpaacaResult<Unit> {
        let kind = match self.access_mode {
            AccessMode::Push => UnitKind::UNIT,
            AccessMode::Message => UnitKind::MESSAGE,
            AccessMode::Remote => {
                return Err(IpaacaError::NotImplemented(
                    "units with remote access mode".into(),
                ))
            }
        };
        let read_only = self.read_only || kind.is_ephemeral();
        let payload = normalize_items(self.payload_type, self.payload)?;
        let state = UnitState {
            uid: self.uid.unwrap_or_else(generate_uid),
            revision: 1,
            category: self.category,
            payload_type: self.payload_type,
            owner_name: String::new(),
            committed: false,
            retracted: false,
            read_only,
            access_mode: self.access_mode,
            payload,
            links: LinkGraph::new(),
            buffer: BufferLink::Detached,
        };
        Ok(Unit::from_parts(kind, state))
    }
}

/// A shared, incrementally updated object. Cloning yields another handle to
/// the same unit.
#[derive(Clone)]
pub struct Unit {
    pub(crate) inner: Arc<UnitInner>,
}

impl Unit {
    pub fn builder(category: impl Into<String>) -> UnitBuilder {
        UnitBuilder {
            category: category.into(),
            payload_type: PayloadType::default(),
            read_only: false,
            access_mode: AccessMode::Push,
            uid: None,
            payload: DocumentMap::new(),
        }
    }

    /// Durable unit with default settings
    pub fn new(category: impl Into<String>) -> Self {
        Self::from_parts(UnitKind::UNIT, Self::fresh_state(category.into(), AccessMode::Push, false))
    }

    /// One-shot message
    pub fn message(category: impl Into<String>) -> Self {
        Self::from_parts(UnitKind::MESSAGE, Self::fresh_state(category.into(), AccessMode::Message, true))
    }

    fn fresh_state(category: String, access_mode: AccessMode, read_only: bool) -> UnitState {
        UnitState {
            uid: generate_uid(),
            revision: 1,
            category,
            payload_type: PayloadType::default(),
            owner_name: String::new(),
            committed: false,
            retracted: false,
            read_only,
            access_mode,
            payload: DocumentMap::new(),
            links: LinkGraph::new(),
            buffer: BufferLink::Detached,
        }
    }

    fn from_parts(kind: UnitKind, state: UnitState) -> Self {
        Unit {
            inner: Arc::new(UnitInner {
                kind,
                state: ReentrantMutex::new(RefCell::new(state)),
                batch: ReentrantMutex::new(RefCell::new(BatchState::default())),
            }),
        }
    }

    /// Proxy for a unit owned by another buffer
    pub(crate) fn from_snapshot(snapshot: UnitSnapshot, durability: Durability, broker: Weak<dyn RemoteBroker>) -> Self {
        let kind = UnitKind {
            ownership: Ownership::RemoteProxy,
            durability,
        };
        let state = UnitState {
            uid: snapshot.uid,
            revision: snapshot.revision,
            category: snapshot.category,
            payload_type: snapshot.payload_type,
            owner_name: snapshot.owner_name,
            committed: snapshot.committed,
            retracted: snapshot.retracted,
            read_only: snapshot.read_only,
            access_mode: snapshot.access_mode,
            payload: snapshot.payload,
            links: LinkGraph::from_map(snapshot.links),
            buffer: BufferLink::Input(broker),
        };
        Self::from_parts(kind, state)
    }

    fn with_state<R>(&self, f: impl FnOnce(&UnitState) -> R) -> R {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        f(&state)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn kind(&self) -> UnitKind {
        self.inner.kind
    }

    pub fn uid(&self) -> String {
        self.with_state(|s| s.uid.clone())
    }

    pub fn revision(&self) -> Revision {
        self.with_state(|s| s.revision)
    }

    pub fn category(&self) -> String {
        self.with_state(|s| s.category.clone())
    }

    pub fn payload_type(&self) -> PayloadType {
        self.with_state(|s| s.payload_type)
    }

    /// Unique name of the owning output buffer, once published
    pub fn owner_name(&self) -> Option<String> {
        self.with_state(|s| (!s.owner_name.is_empty()).then(|| s.owner_name.clone()))
    }

    pub fn access_mode(&self) -> AccessMode {
        self.with_state(|s| s.access_mode)
    }

    pub fn is_committed(&self) -> bool {
        self.with_state(|s| s.committed)
    }

    pub fn is_retracted(&self) -> bool {
        self.with_state(|s| s.retracted)
    }

    pub fn is_read_only(&self) -> bool {
        self.with_state(|s| s.read_only)
    }

    pub fn is_published(&self) -> bool {
        self.with_state(|s| s.is_published())
    }

    #[inline]
    pub fn is_remote(&self) -> bool {
        self.inner.kind.is_remote()
    }

    #[inline]
    pub fn is_message(&self) -> bool {
        self.inner.kind.is_ephemeral()
    }

    pub fn payload(&self) -> Payload {
        Payload::new(self.clone())
    }

    /// Targets of one link type
    pub fn links(&self, link_type: &str) -> BTreeSet<String> {
        self.with_state(|s| s.links.get_links(link_type).clone())
    }

    pub fn all_links(&self) -> LinkMap {
        self.with_state(|s| s.links.all_links().clone())
    }

    pub fn snapshot(&self) -> UnitSnapshot {
        self.with_state(|s| s.snapshot())
    }

    pub fn ptr_eq(&self, other: &Unit) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Set the uid of a unit built without one
    pub fn assign_uid(&self, uid: &str) -> IpaacaResult<()> {
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();
        if !state.uid.is_empty() {
            return Err(IpaacaError::AlreadyHasUid(state.uid.clone()));
        }
        state.uid = uid.to_string();
        Ok(())
    }

    // ========================================================================
    // Payload plumbing
    // ========================================================================

    pub(crate) fn read_key(&self, key: &str) -> Option<DocumentValue> {
        self.with_state(|s| s.payload.get(key).cloned())
    }

    pub(crate) fn payload_map(&self) -> DocumentMap {
        self.with_state(|s| s.payload.clone())
    }

    /// Guard applied to every local write
    pub(crate) fn write_gate(&self) -> IpaacaResult<WriteGate> {
        self.with_state(|s| self.gate(s))
    }

    fn gate(&self, state: &UnitState) -> IpaacaResult<WriteGate> {
        match (self.inner.kind.ownership, self.inner.kind.durability) {
            (Ownership::Owned, Durability::Ephemeral) if state.is_published() => {
                warn!("message {} was already sent; modification has no effect", state.uid);
                Ok(WriteGate::Ignore)
            }
            (Ownership::Owned, _) => state.check_latches().map(|_| WriteGate::Apply),
            (Ownership::RemoteProxy, Durability::Durable) => {
                state.check_latches()?;
                if state.read_only {
                    return Err(IpaacaError::ReadOnly(state.uid.clone()));
                }
                Ok(WriteGate::Apply)
            }
            (Ownership::RemoteProxy, Durability::Ephemeral) => Ok(WriteGate::Apply),
        }
    }

    pub(crate) fn normalize(&self, value: DocumentValue) -> IpaacaResult<DocumentValue> {
        normalize_value(self.payload_type(), value)
    }

    /// Write one key without revision or emission; returns the previous value
    pub(crate) fn write_local(&self, key: &str, value: Option<DocumentValue>) -> Option<DocumentValue> {
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();
        match value {
            Some(v) => state.payload.insert(key.to_string(), v),
            None => state.payload.remove(key),
        }
    }

    pub(crate) fn restore_local(&self, originals: BTreeMap<String, Option<DocumentValue>>) {
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();
        for (key, original) in originals {
            match original {
                Some(v) => state.payload.insert(key, v),
                None => state.payload.remove(&key),
            };
        }
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Change the payload; returns the revision afterwards
    pub fn modify_payload(
        &self,
        is_delta: bool,
        new_items: DocumentMap,
        keys_to_remove: BTreeSet<String>,
    ) -> IpaacaResult<Revision> {
        self.modify_payload_as(is_delta, new_items, keys_to_remove, None)
    }

    pub(crate) fn modify_payload_as(
        &self,
        is_delta: bool,
        new_items: DocumentMap,
        keys_to_remove: BTreeSet<String>,
        writer: Option<&str>,
    ) -> IpaacaResult<Revision> {
        let guard = self.inner.state.lock();
        let payload_type = guard.borrow().payload_type;
        let new_items = normalize_items(payload_type, new_items)?;

        if !self.inner.kind.is_remote() {
            // Sent before it is applied: a failed send leaves no trace
            let (revision, outbound) = {
                let state = guard.borrow();
                if self.gate(&state)? == WriteGate::Ignore {
                    return Ok(state.revision);
                }
                let revision = state.revision + 1;
                let outbound = state.outbound().map(|(sink, category)| {
                    let update = PayloadUpdate {
                        uid: state.uid.clone(),
                        revision,
                        writer_name: state.writer(writer),
                        is_delta,
                        new_items: new_items.clone(),
                        keys_to_remove: keys_to_remove.clone(),
                        payload_type,
                    };
                    (sink, category, update)
                });
                (revision, outbound)
            };
            if let Some((sink, category, update)) = outbound {
                sink.send_payload_update(&category, update)?;
            }
            let mut state = guard.borrow_mut();
            state.apply_payload(is_delta, &new_items, &keys_to_remove);
            state.revision = revision;
            return Ok(revision);
        }

        let (broker, owner, request) = {
            let mut state = guard.borrow_mut();
            self.gate(&state)?;
            if self.inner.kind.is_ephemeral() {
                debug!("remote message {}: modification is local only", state.uid);
                state.apply_payload(is_delta, &new_items, &keys_to_remove);
                return Ok(state.revision);
            }
            let broker = state.broker()?;
            let request = PayloadUpdate {
                uid: state.uid.clone(),
                revision: state.revision,
                writer_name: broker.unique_name(),
                is_delta,
                new_items: new_items.clone(),
                keys_to_remove: keys_to_remove.clone(),
                payload_type,
            };
            (broker, state.owner_name.clone(), request)
        };

        let revision = broker.remote_update_payload(&owner, request)?;
        let mut state = guard.borrow_mut();
        if revision == 0 {
            return Err(IpaacaError::UpdateFailed(state.uid.clone()));
        }
        state.apply_payload(is_delta, &new_items, &keys_to_remove);
        state.revision = revision;
        Ok(revision)
    }

    /// Merge link additions and removals
    pub fn modify_links(&self, add: &LinkMap, remove: &LinkMap) -> IpaacaResult<Revision> {
        self.modify_links_as(true, add, remove, None)
    }

    /// Replace the whole link map
    pub fn set_links(&self, links: &LinkMap) -> IpaacaResult<Revision> {
        self.modify_links_as(false, links, &LinkMap::new(), None)
    }

    pub fn add_links<I, S>(&self, link_type: &str, targets: I) -> IpaacaResult<Revision>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modify_links(&link_map(link_type, targets), &LinkMap::new())
    }

    pub fn remove_links<I, S>(&self, link_type: &str, targets: I) -> IpaacaResult<Revision>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modify_links(&LinkMap::new(), &link_map(link_type, targets))
    }

    pub fn add_link(&self, link_type: &str, target: &str) -> IpaacaResult<Revision> {
        self.add_links(link_type, [target])
    }

    pub fn remove_link(&self, link_type: &str, target: &str) -> IpaacaResult<Revision> {
        self.remove_links(link_type, [target])
    }

    pub(crate) fn modify_links_as(
        &self,
        is_delta: bool,
        new_links: &LinkMap,
        links_to_remove: &LinkMap,
        writer: Option<&str>,
    ) -> IpaacaResult<Revision> {
        let guard = self.inner.state.lock();

        if !self.inner.kind.is_remote() {
            let (revision, outbound) = {
                let state = guard.borrow();
                if self.gate(&state)? == WriteGate::Ignore {
                    return Ok(state.revision);
                }
                let revision = state.revision + 1;
                let outbound = state.outbound().map(|(sink, category)| {
                    let update = LinkUpdate {
                        uid: state.uid.clone(),
                        revision,
                        writer_name: state.writer(writer),
                        is_delta,
                        new_links: new_links.clone(),
                        links_to_remove: links_to_remove.clone(),
                    };
                    (sink, category, update)
                });
                (revision, outbound)
            };
            if let Some((sink, category, update)) = outbound {
                sink.send_link_update(&category, update)?;
            }
            let mut state = guard.borrow_mut();
            state.apply_links(is_delta, new_links, links_to_remove);
            state.revision = revision;
            return Ok(revision);
        }

        let (broker, owner, request) = {
            let mut state = guard.borrow_mut();
            self.gate(&state)?;
            if self.inner.kind.is_ephemeral() {
                debug!("remote message {}: link change is local only", state.uid);
                state.apply_links(is_delta, new_links, links_to_remove);
                return Ok(state.revision);
            }
            let broker = state.broker()?;
            let request = LinkUpdate {
                uid: state.uid.clone(),
                revision: state.revision,
                writer_name: broker.unique_name(),
                is_delta,
                new_links: new_links.clone(),
                links_to_remove: links_to_remove.clone(),
            };
            (broker, state.owner_name.clone(), request)
        };

        let revision = broker.remote_update_links(&owner, request)?;
        let mut state = guard.borrow_mut();
        if revision == 0 {
            return Err(IpaacaError::UpdateFailed(state.uid.clone()));
        }
        state.apply_links(is_delta, new_links, links_to_remove);
        state.revision = revision;
        Ok(revision)
    }

    /// Finalize the unit's content
    pub fn commit(&self) -> IpaacaResult<()> {
        self.commit_as(None).map(|_| ())
    }

    pub(crate) fn commit_as(&self, writer: Option<&str>) -> IpaacaResult<Revision> {
        let guard = self.inner.state.lock();

        match (self.inner.kind.ownership, self.inner.kind.durability) {
            (Ownership::Owned, _) => {
                let (revision, outbound) = {
                    let state = guard.borrow();
                    if self.gate(&state)? == WriteGate::Ignore {
                        return Ok(state.revision);
                    }
                    let revision = state.revision + 1;
                    (revision, self.terminal(&state, revision, TerminalKind::Commission, writer))
                };
                if let Some((sink, category, record)) = outbound {
                    sink.send_terminal(&category, record)?;
                }
                let mut state = guard.borrow_mut();
                state.revision = revision;
                state.committed = true;
                Ok(revision)
            }
            (Ownership::RemoteProxy, Durability::Ephemeral) => {
                let state = guard.borrow();
                info!("committing remote message {} has no effect", state.uid);
                Ok(state.revision)
            }
            (Ownership::RemoteProxy, Durability::Durable) => {
                let (broker, owner, request) = {
                    let state = guard.borrow();
                    if state.read_only {
                        return Err(IpaacaError::ReadOnly(state.uid.clone()));
                    }
                    if state.retracted {
                        return Err(IpaacaError::Retracted(state.uid.clone()));
                    }
                    if state.committed {
                        return Ok(state.revision);
                    }
                    let broker = state.broker()?;
                    let request = TerminalRecord {
                        uid: state.uid.clone(),
                        revision: state.revision,
                        writer_name: broker.unique_name(),
                        kind: TerminalKind::Commission,
                    };
                    (broker, state.owner_name.clone(), request)
                };
                let revision = broker.remote_commit(&owner, request)?;
                let mut state = guard.borrow_mut();
                if revision == 0 {
                    return Err(IpaacaError::UpdateFailed(state.uid.clone()));
                }
                state.revision = revision;
                state.committed = true;
                Ok(revision)
            }
        }
    }

    /// Withdraw the unit; only its owner can do this
    pub fn retract(&self) -> IpaacaResult<()> {
        self.retract_as(None).map(|_| ())
    }

    pub(crate) fn retract_as(&self, writer: Option<&str>) -> IpaacaResult<Revision> {
        if self.inner.kind.is_remote() {
            return Err(IpaacaError::NotImplemented(
                "retracting a unit owned by another buffer".into(),
            ));
        }
        let guard = self.inner.state.lock();
        let (revision, outbound) = {
            let state = guard.borrow();
            if self.gate(&state)? == WriteGate::Ignore {
                return Ok(state.revision);
            }
            let revision = state.revision + 1;
            (revision, self.terminal(&state, revision, TerminalKind::Retraction, writer))
        };
        if let Some((sink, category, record)) = outbound {
            sink.send_terminal(&category, record)?;
        }
        let mut state = guard.borrow_mut();
        state.revision = revision;
        state.retracted = true;
        Ok(revision)
    }

    fn terminal(
        &self,
        state: &UnitState,
        revision: Revision,
        kind: TerminalKind,
        writer: Option<&str>,
    ) -> Option<(Arc<dyn OutboundSink>, String, TerminalRecord)> {
        state.outbound().map(|(sink, category)| {
            let record = TerminalRecord {
                uid: state.uid.clone(),
                revision,
                writer_name: state.writer(writer),
                kind,
            };
            (sink, category, record)
        })
    }

    // ========================================================================
    // Buffer side
    // ========================================================================

    /// Associate with an output buffer. `announce` runs under the unit lock
    /// so no update can overtake the announcement.
    pub(crate) fn attach_output(
        &self,
        sink: Weak<dyn OutboundSink>,
        owner_name: &str,
        announce: impl FnOnce(&UnitSnapshot) -> IpaacaResult<()>,
    ) -> IpaacaResult<()> {
        let guard = self.inner.state.lock();
        let snapshot = {
            let mut state = guard.borrow_mut();
            if self.inner.kind.is_remote() || state.is_published() {
                return Err(IpaacaError::AlreadyInABuffer(state.uid.clone()));
            }
            if state.uid.is_empty() {
                state.uid = generate_uid();
            }
            if !state.owner_name.is_empty() {
                return Err(IpaacaError::AlreadyHasOwnerName(state.owner_name.clone()));
            }
            state.owner_name = owner_name.to_string();
            state.buffer = BufferLink::Output(sink);
            state.snapshot()
        };
        announce(&snapshot)
    }

    pub(crate) fn apply_update(&self, update: &PayloadUpdate) {
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();
        state.apply_payload(update.is_delta, &update.new_items, &update.keys_to_remove);
        state.revision = update.revision;
    }

    pub(crate) fn apply_link_update(&self, update: &LinkUpdate) {
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();
        state.apply_links(update.is_delta, &update.new_links, &update.links_to_remove);
        state.revision = update.revision;
    }

    pub(crate) fn apply_commission(&self, revision: Revision) {
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();
        state.committed = true;
        state.revision = revision;
    }

    pub(crate) fn apply_retraction(&self, revision: Revision) {
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();
        state.retracted = true;
        state.revision = revision;
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with_state(|s| {
            f.debug_struct("Unit")
                .field("uid", &s.uid)
                .field("revision", &s.revision)
                .field("category", &s.category)
                .field("kind", &self.inner.kind)
                .field("committed", &s.committed)
                .field("retracted", &s.retracted)
                .finish()
        })
    }
}
