//! Peers and event recording for multi-buffer tests

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use ipaaca_core::{EventMask, IpaacaConfig, IpaacaResult, IuEventType, Revision};
use ipaaca_runtime::{Handle, HandlerId, InputBuffer, OutputBuffer, Unit};
use ipaaca_transport::LocalBus;

/// Default wait used by the scenarios
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// EVENT RECORDER
// ============================================================================

/// One handler invocation as seen by an [`EventRecorder`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub uid: String,
    pub category: String,
    pub event: IuEventType,
    pub is_local: bool,
    /// Unit revision at the time the handler ran
    pub revision: Revision,
}

/// Collects handler invocations and lets tests block until some arrive
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
    arrived: Condvar,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, unit: &Unit, event: IuEventType, is_local: bool) {
        let entry = RecordedEvent {
            uid: unit.uid(),
            category: unit.category(),
            event,
            is_local,
            revision: unit.revision(),
        };
        self.events.lock().push(entry);
        self.arrived.notify_all();
    }

    /// Record every event of `input` matching `mask`
    pub fn attach_input(self: &Arc<Self>, input: &InputBuffer, mask: EventMask) -> HandlerId {
        self.attach_input_filtered(input, mask, None)
    }

    /// Like [`attach_input`](Self::attach_input), limited to one category
    pub fn attach_input_filtered(
        self: &Arc<Self>,
        input: &InputBuffer,
        mask: EventMask,
        category: Option<&str>,
    ) -> HandlerId {
        let me = Arc::clone(self);
        input.register_handler(move |unit, event, local| me.record(unit, event, local), mask, category)
    }

    /// Record every event of `output` matching `mask`
    pub fn attach_output(self: &Arc<Self>, output: &OutputBuffer, mask: EventMask) -> HandlerId {
        let me = Arc::clone(self);
        output.register_handler(move |unit, event, local| me.record(unit, event, local), mask, None)
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: IuEventType) -> usize {
        self.events.lock().iter().filter(|e| e.event == event).count()
    }

    pub fn count_for(&self, uid: &str, event: IuEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event == event && e.uid == uid)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Block until `done` holds for the recorded events or `timeout` passes
    pub fn wait_until<F>(&self, timeout: Duration, done: F) -> bool
    where
        F: Fn(&[RecordedEvent]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        while !done(&events) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.arrived.wait_for(&mut events, deadline - now);
        }
        true
    }

    /// Block until at least `n` events of kind `event` arrived for `uid`
    pub fn wait_for(&self, uid: &str, event: IuEventType, n: usize) -> bool {
        self.wait_until(EVENT_TIMEOUT, |events| {
            events.iter().filter(|e| e.event == event && e.uid == uid).count() >= n
        })
    }

    /// Block until any event of kind `event` arrived, returning it
    pub fn wait_for_any(&self, event: IuEventType) -> Option<RecordedEvent> {
        let found = self.wait_until(EVENT_TIMEOUT, |events| events.iter().any(|e| e.event == event));
        if !found {
            return None;
        }
        self.events.lock().iter().find(|e| e.event == event).cloned()
    }
}

// ============================================================================
// PEER
// ============================================================================

/// One simulated process: an output buffer, an input buffer and a recorder
/// attached to the input side
pub struct Peer {
    pub handle: Handle,
    pub output: OutputBuffer,
    pub input: InputBuffer,
    pub events: Arc<EventRecorder>,
}

impl Peer {
    pub fn new(bus: &LocalBus, component: &str, categories: &[&str]) -> IpaacaResult<Self> {
        Self::with_config(bus, component, categories, IpaacaConfig::default())
    }

    pub fn with_config(
        bus: &LocalBus,
        component: &str,
        categories: &[&str],
        config: IpaacaConfig,
    ) -> IpaacaResult<Self> {
        let handle = Handle::new(config, Arc::new(bus.clone()))?;
        let output = handle.output_buffer(component)?;
        let input = handle.input_buffer(component, categories)?;
        let events = EventRecorder::new();
        events.attach_input(&input, EventMask::ALL_EVENTS);
        Ok(Peer {
            handle,
            output,
            input,
            events,
        })
    }

    /// Mirror of `uid` once its ADDED event arrived
    pub fn mirror(&self, uid: &str) -> Option<Unit> {
        if !self.events.wait_for(uid, IuEventType::Added, 1) {
            return None;
        }
        self.input.get(uid)
    }

    pub fn close(&self) {
        self.input.close();
        self.output.close();
    }
}

/// Poll `done` until it holds or `timeout` passes
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, done: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    done()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_recorder_wakes_waiter() {
        let recorder = EventRecorder::new();
        let unit = Unit::new("demo");
        let r = Arc::clone(&recorder);
        let u = unit.clone();
        let notifier = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            r.record(&u, IuEventType::Updated, false);
        });
        assert!(recorder.wait_for(&unit.uid(), IuEventType::Updated, 1));
        notifier.join().unwrap();
        assert_eq!(recorder.count(IuEventType::Updated), 1);
    }

    #[test]
    fn test_recorder_times_out() {
        let recorder = EventRecorder::new();
        assert!(!recorder.wait_until(Duration::from_millis(20), |e| !e.is_empty()));
    }

    #[test]
    fn test_peer_sees_own_units() {
        let bus = LocalBus::new().unwrap();
        let peer = Peer::new(&bus, "solo", &["demo"]).unwrap();
        let unit = Unit::new("demo");
        peer.output.add(&unit).unwrap();
        let mirror = peer.mirror(&unit.uid()).unwrap();
        assert!(mirror.is_remote());
        assert!(!mirror.ptr_eq(&unit));
        peer.close();
    }
}
