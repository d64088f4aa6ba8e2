//! Payload document store
//!
//! A `Payload` is a handle onto the key/value content of one unit. Outside a
//! transaction every write becomes one delta update. Inside a
//! `PayloadTransaction` writes are applied locally at once and collected into
//! a single pending delta that goes out when the outermost transaction ends.
//!
//! Nested addressing goes through `EntryProxy`, which stores only a path and
//! resolves it against the current document on every access.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::mem;

use parking_lot::ReentrantMutexGuard;
use tracing::warn;

use ipaaca_core::{describe_path, DocumentMap, DocumentValue, IpaacaError, IpaacaResult, PathSegment};

use crate::unit::{Unit, WriteGate};

/// Pending writes of an open transaction
#[derive(Debug, Default)]
pub(crate) struct BatchState {
    depth: usize,
    writes: DocumentMap,
    removals: BTreeSet<String>,
    /// Value of each touched key before the transaction; `None` = absent
    originals: BTreeMap<String, Option<DocumentValue>>,
}

/// Handle onto a unit's payload
#[derive(Clone, Debug)]
pub struct Payload {
    unit: Unit,
}

impl Payload {
    pub(crate) fn new(unit: Unit) -> Self {
        Payload { unit }
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    /// Value of a key; missing keys read as null
    pub fn get(&self, key: &str) -> DocumentValue {
        self.unit.read_key(key).unwrap_or_default()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.unit.read_key(key).is_some()
    }

    pub fn entry(&self, key: &str) -> EntryProxy {
        EntryProxy {
            payload: self.clone(),
            key: key.to_string(),
            path: Vec::new(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.unit.payload_map().into_keys().collect()
    }

    pub fn len(&self) -> usize {
        self.unit.payload_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.unit.payload_map().is_empty()
    }

    pub fn to_map(&self) -> DocumentMap {
        self.unit.payload_map()
    }

    pub fn set(&self, key: &str, value: impl Into<DocumentValue>) -> IpaacaResult<()> {
        let value = value.into();
        let batch = self.unit.inner.batch.lock();
        if batch.borrow().depth > 0 {
            return self.stage(&batch, key, Some(value));
        }
        let mut items = DocumentMap::new();
        items.insert(key.to_string(), value);
        self.unit.modify_payload(true, items, BTreeSet::new()).map(|_| ())
    }

    /// Remove a key; removing an absent key does nothing
    pub fn remove(&self, key: &str) -> IpaacaResult<()> {
        let batch = self.unit.inner.batch.lock();
        if batch.borrow().depth > 0 {
            return self.stage(&batch, key, None);
        }
        if !self.contains_key(key) {
            return Ok(());
        }
        let removal = [key.to_string()].into_iter().collect();
        self.unit.modify_payload(true, DocumentMap::new(), removal).map(|_| ())
    }

    /// Merge several keys as one delta
    pub fn set_many(&self, items: DocumentMap) -> IpaacaResult<()> {
        let batch = self.unit.inner.batch.lock();
        if batch.borrow().depth > 0 {
            for (key, value) in items {
                self.stage(&batch, &key, Some(value))?;
            }
            return Ok(());
        }
        if items.is_empty() {
            return Ok(());
        }
        self.unit.modify_payload(true, items, BTreeSet::new()).map(|_| ())
    }

    /// Replace the whole payload
    pub fn replace(&self, items: DocumentMap) -> IpaacaResult<()> {
        let batch = self.unit.inner.batch.lock();
        if batch.borrow().depth > 0 {
            for key in self.keys() {
                if !items.contains_key(&key) {
                    self.stage(&batch, &key, None)?;
                }
            }
            for (key, value) in items {
                self.stage(&batch, &key, Some(value))?;
            }
            return Ok(());
        }
        self.unit.modify_payload(false, items, BTreeSet::new()).map(|_| ())
    }

    /// Open a write transaction. Transactions nest on the same thread;
    /// other writers block until the outermost one ends.
    pub fn transaction(&self) -> PayloadTransaction<'_> {
        let guard = self.unit.inner.batch.lock();
        guard.borrow_mut().depth += 1;
        PayloadTransaction {
            payload: self,
            guard: Some(guard),
        }
    }

    fn stage(&self, batch: &RefCell<BatchState>, key: &str, value: Option<DocumentValue>) -> IpaacaResult<()> {
        if self.unit.write_gate()? == WriteGate::Ignore {
            return Ok(());
        }
        let value = value.map(|v| self.unit.normalize(v)).transpose()?;
        let previous = self.unit.write_local(key, value.clone());

        let mut pending = batch.borrow_mut();
        pending.originals.entry(key.to_string()).or_insert(previous);
        match value {
            Some(v) => {
                pending.removals.remove(key);
                pending.writes.insert(key.to_string(), v);
            }
            None => {
                pending.writes.remove(key);
                pending.removals.insert(key.to_string());
            }
        }
        Ok(())
    }

    fn flush(&self, batch: &RefCell<BatchState>) -> IpaacaResult<()> {
        let (writes, mut removals, originals) = {
            let mut pending = batch.borrow_mut();
            (
                mem::take(&mut pending.writes),
                mem::take(&mut pending.removals),
                mem::take(&mut pending.originals),
            )
        };
        // Keys created and removed inside the transaction never existed
        removals.retain(|key| !matches!(originals.get(key), Some(None)));
        if writes.is_empty() && removals.is_empty() {
            return Ok(());
        }
        match self.unit.modify_payload(true, writes, removals) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.unit.restore_local(originals);
                Err(e)
            }
        }
    }

    /// Read-modify-write of one top-level key through a nested path
    fn write_path(
        &self,
        key: &str,
        path: &[PathSegment],
        edit: impl FnOnce(&mut DocumentValue) -> IpaacaResult<()>,
    ) -> IpaacaResult<()> {
        let _batch = self.unit.inner.batch.lock();
        let mut top = self.get(key);
        edit(top.resolve_mut(path)?)?;
        self.set(key, top)
    }
}

/// Scoped write transaction on a payload. The pending delta is sent exactly
/// once when the outermost transaction is finished or dropped.
pub struct PayloadTransaction<'a> {
    payload: &'a Payload,
    guard: Option<ReentrantMutexGuard<'a, RefCell<BatchState>>>,
}

impl<'a> PayloadTransaction<'a> {
    pub fn payload(&self) -> &Payload {
        self.payload
    }

    /// End the transaction and report the outcome of the flush
    pub fn finish(mut self) -> IpaacaResult<()> {
        self.close()
    }

    fn close(&mut self) -> IpaacaResult<()> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        let outermost = {
            let mut pending = guard.borrow_mut();
            pending.depth -= 1;
            pending.depth == 0
        };
        if outermost {
            self.payload.flush(&guard)
        } else {
            Ok(())
        }
    }
}

impl Drop for PayloadTransaction<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("payload transaction on {} failed: {}", self.payload.unit.uid(), e);
        }
    }
}

/// Path into a payload value, rooted at a top-level key
#[derive(Clone, Debug)]
pub struct EntryProxy {
    payload: Payload,
    key: String,
    path: Vec<PathSegment>,
}

impl EntryProxy {
    pub fn key(&self, key: &str) -> EntryProxy {
        self.child(PathSegment::Key(key.to_string()))
    }

    pub fn index(&self, index: usize) -> EntryProxy {
        self.child(PathSegment::Index(index))
    }

    fn child(&self, segment: PathSegment) -> EntryProxy {
        let mut path = self.path.clone();
        path.push(segment);
        EntryProxy {
            payload: self.payload.clone(),
            key: self.key.clone(),
            path,
        }
    }

    /// Printable form of this entry's path
    pub fn describe(&self) -> String {
        describe_path(&self.key, &self.path)
    }

    /// Current value at this path
    pub fn value(&self) -> IpaacaResult<DocumentValue> {
        self.payload.get(&self.key).resolve(&self.path)
    }

    pub fn to_str(&self) -> IpaacaResult<String> {
        Ok(self.value()?.to_text())
    }

    pub fn to_int(&self) -> IpaacaResult<i64> {
        self.value()?.to_int()
    }

    pub fn to_float(&self) -> IpaacaResult<f64> {
        self.value()?.to_float()
    }

    pub fn to_bool(&self) -> IpaacaResult<bool> {
        self.value()?.to_bool()
    }

    pub fn to_string_list(&self) -> IpaacaResult<Vec<String>> {
        self.value()?.to_string_list()
    }

    pub fn is_null(&self) -> bool {
        self.value().map(|v| v.is_null()).unwrap_or(true)
    }

    pub fn is_list(&self) -> bool {
        self.value().map(|v| v.is_list()).unwrap_or(false)
    }

    pub fn is_map(&self) -> bool {
        self.value().map(|v| v.is_map()).unwrap_or(false)
    }

    pub fn len(&self) -> IpaacaResult<usize> {
        self.value()?.len()
    }

    /// Replace the addressed value
    pub fn set(&self, value: impl Into<DocumentValue>) -> IpaacaResult<()> {
        if self.path.is_empty() {
            return self.payload.set(&self.key, value);
        }
        let value = value.into();
        self.payload.write_path(&self.key, &self.path, |slot| {
            *slot = value;
            Ok(())
        })
    }

    /// Append one value to the addressed list
    pub fn push_back(&self, value: impl Into<DocumentValue>) -> IpaacaResult<()> {
        self.extend(std::iter::once(value.into()))
    }

    /// Append a sequence of values to the addressed list
    pub fn extend<I, V>(&self, values: I) -> IpaacaResult<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<DocumentValue>,
    {
        let values: Vec<DocumentValue> = values.into_iter().map(Into::into).collect();
        let described = self.describe();
        self.payload.write_path(&self.key, &self.path, move |slot| match slot {
            DocumentValue::List(items) => {
                items.extend(values);
                Ok(())
            }
            other => Err(IpaacaError::Addressing(format!(
                "{} is a {}, not a list",
                described,
                other.kind_name()
            ))),
        })
    }

    /// Append the elements of another list entry
    pub fn extend_from(&self, other: &EntryProxy) -> IpaacaResult<()> {
        match other.value()? {
            DocumentValue::List(items) => self.extend(items),
            value => Err(IpaacaError::TypeConversion(format!(
                "{} is a {}, not a list",
                other.describe(),
                value.kind_name()
            ))),
        }
    }

    /// Remove the addressed element from its parent
    pub fn remove(&self) -> IpaacaResult<()> {
        let Some((last, parent)) = self.path.split_last() else {
            return self.payload.remove(&self.key);
        };
        let last = last.clone();
        self.payload.write_path(&self.key, parent, move |slot| {
            slot.remove_at(std::slice::from_ref(&last)).map(|_| ())
        })
    }
}
