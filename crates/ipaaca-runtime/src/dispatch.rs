//! Per-buffer event handler registry

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use ipaaca_core::{EventMask, IuEventType};

use crate::unit::Unit;

/// Event callback: `(unit, event type, is_local)`
pub type HandlerFn = Arc<dyn Fn(&Unit, IuEventType, bool) + Send + Sync>;

/// Registration token returned by `register_handler`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct HandlerEntry {
    id: HandlerId,
    callback: HandlerFn,
    mask: EventMask,
    category: Option<String>,
}

impl HandlerEntry {
    fn matches(&self, event: IuEventType, category: &str) -> bool {
        self.mask.contains(event) && self.category.as_deref().map_or(true, |c| c == category)
    }
}

/// Handlers run synchronously, in registration order, on the dispatching
/// thread. A panicking handler aborts the remaining deliveries of that event.
pub struct EventDispatcher {
    handlers: RwLock<Vec<HandlerEntry>>,
    next_id: AtomicU64,
    verbose: bool,
}

impl EventDispatcher {
    pub fn new(verbose: bool) -> Self {
        EventDispatcher {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            verbose,
        }
    }

    pub fn register_handler<F>(&self, callback: F, mask: EventMask, category: Option<&str>) -> HandlerId
    where
        F: Fn(&Unit, IuEventType, bool) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push(HandlerEntry {
            id,
            callback: Arc::new(callback),
            mask,
            category: category.map(str::to_string),
        });
        id
    }

    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Invoke every matching handler
    pub fn dispatch(&self, unit: &Unit, event: IuEventType, is_local: bool) {
        let category = unit.category();
        if self.verbose {
            info!("{} {} ({}, local={})", event, unit.uid(), category, is_local);
        }
        // Handlers may register further handlers; call outside the lock
        let matching: Vec<HandlerFn> = self
            .handlers
            .read()
            .iter()
            .filter(|h| h.matches(event, &category))
            .map(|h| Arc::clone(&h.callback))
            .collect();
        for callback in matching {
            callback(unit, event, is_local);
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(false)
    }
}
