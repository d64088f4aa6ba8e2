//! In-process transport
//!
//! The bus owns a small tokio runtime. Every listener gets a bounded queue
//! drained by one blocking task, so frames published on any of its channels
//! reach it in publication order and a full queue blocks the publisher. RPC
//! endpoints are served the same way; callers wait on a oneshot reply under
//! `tokio::time::timeout`.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, trace, warn};

use ipaaca_core::{IpaacaError, IpaacaResult, ProtocolVersion};

use crate::{Deliver, Endpoint, RemoteServer, RpcServer, Subscription, Transport};

/// Frames a listener may have queued before publishers block
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct Delivery {
    channel: String,
    frame: Bytes,
}

struct ListenerEntry {
    channels: HashSet<String>,
    queue: mpsc::Sender<Delivery>,
}

struct Call {
    method: String,
    request: Bytes,
    reply: oneshot::Sender<IpaacaResult<Bytes>>,
}

/// Bus activity counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub calls: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    calls: AtomicU64,
    timeouts: AtomicU64,
}

struct BusInner {
    version: ProtocolVersion,
    capacity: usize,
    runtime: Option<Runtime>,
    listeners: RwLock<HashMap<u64, ListenerEntry>>,
    endpoints: RwLock<HashMap<String, mpsc::Sender<Call>>>,
    next_id: AtomicU64,
    counters: Counters,
}

impl BusInner {
    fn runtime(&self) -> IpaacaResult<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| IpaacaError::TransportError("bus has shut down".into()))
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        // The last reference may go away on one of the runtime's own threads
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// In-process publish/subscribe bus with RPC endpoints
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    pub fn new() -> IpaacaResult<Self> {
        Self::build(ProtocolVersion::CURRENT, DEFAULT_QUEUE_CAPACITY)
    }

    /// Bus advertising a specific protocol version
    pub fn with_protocol_version(version: ProtocolVersion) -> IpaacaResult<Self> {
        Self::build(version, DEFAULT_QUEUE_CAPACITY)
    }

    /// Bus whose listener queues hold at most `capacity` frames
    pub fn with_queue_capacity(capacity: usize) -> IpaacaResult<Self> {
        Self::build(ProtocolVersion::CURRENT, capacity.max(1))
    }

    fn build(version: ProtocolVersion, capacity: usize) -> IpaacaResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ipaaca-bus")
            .enable_time()
            .build()
            .map_err(|e| IpaacaError::TransportError(format!("bus runtime: {}", e)))?;

        Ok(LocalBus {
            inner: Arc::new(BusInner {
                version,
                capacity,
                runtime: Some(runtime),
                listeners: RwLock::new(HashMap::new()),
                endpoints: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        })
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            calls: c.calls.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Number of live listeners
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    pub fn has_endpoint(&self, endpoint: &str) -> bool {
        self.inner.endpoints.read().contains_key(endpoint)
    }
}

impl Transport for LocalBus {
    fn protocol_version(&self) -> ProtocolVersion {
        self.inner.version
    }

    fn publish(&self, channel: &str, frame: Bytes) -> IpaacaResult<()> {
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        // Senders are cloned out so a full queue never blocks under the lock
        let queues: Vec<mpsc::Sender<Delivery>> = self
            .inner
            .listeners
            .read()
            .values()
            .filter(|entry| entry.channels.contains(channel))
            .map(|entry| entry.queue.clone())
            .collect();

        let mut receivers = 0usize;
        for queue in queues {
            let delivery = Delivery {
                channel: channel.to_string(),
                frame: frame.clone(),
            };
            if queue.blocking_send(delivery).is_ok() {
                receivers += 1;
            }
        }
        trace!("published {} bytes on {} to {} listeners", frame.len(), channel, receivers);
        Ok(())
    }

    fn listen(&self, channels: &[String], sink: Arc<dyn Deliver>) -> IpaacaResult<Box<dyn Subscription>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<Delivery>(self.inner.capacity);
        let bus = Arc::downgrade(&self.inner);

        self.inner.runtime()?.spawn_blocking(move || {
            while let Some(delivery) = rx.blocking_recv() {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    sink.deliver(&delivery.channel, delivery.frame)
                }));
                if outcome.is_err() {
                    error!("handler panicked while delivering on {}", delivery.channel);
                }
                if let Some(bus) = bus.upgrade() {
                    bus.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
            debug!("listener {} stopped", id);
        });

        self.inner.listeners.write().insert(
            id,
            ListenerEntry {
                channels: channels.iter().cloned().collect(),
                queue: tx,
            },
        );
        debug!("listener {} on {:?}", id, channels);

        Ok(Box::new(LocalSubscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }))
    }

    fn serve(&self, endpoint: &str, server: Arc<dyn RpcServer>) -> IpaacaResult<Box<dyn Endpoint>> {
        let mut endpoints = self.inner.endpoints.write();
        if endpoints.contains_key(endpoint) {
            return Err(IpaacaError::TransportError(format!(
                "endpoint {} is already served",
                endpoint
            )));
        }

        let (tx, mut rx) = mpsc::channel::<Call>(self.inner.capacity);
        let name = endpoint.to_string();
        self.inner.runtime()?.spawn_blocking(move || {
            while let Some(call) = rx.blocking_recv() {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    server.handle(&call.method, &call.request)
                }))
                .unwrap_or_else(|_| {
                    error!("RPC handler for {} on {} panicked", call.method, name);
                    Err(IpaacaError::TransportError(format!(
                        "handler for {} panicked",
                        call.method
                    )))
                });
                // The caller may have timed out already
                let _ = call.reply.send(result);
            }
            debug!("endpoint {} stopped", name);
        });

        endpoints.insert(endpoint.to_string(), tx);
        debug!("serving {}", endpoint);

        Ok(Box::new(LocalEndpoint {
            name: endpoint.to_string(),
            bus: Arc::downgrade(&self.inner),
        }))
    }

    fn remote(&self, endpoint: &str) -> IpaacaResult<Arc<dyn RemoteServer>> {
        Ok(Arc::new(LocalRemote {
            endpoint: endpoint.to_string(),
            bus: Arc::downgrade(&self.inner),
        }))
    }
}

struct LocalSubscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription for LocalSubscription {
    fn add_channel(&self, channel: &str) {
        if let Some(bus) = self.bus.upgrade() {
            if let Some(entry) = bus.listeners.write().get_mut(&self.id) {
                entry.channels.insert(channel.to_string());
            }
        }
    }

    fn channels(&self) -> Vec<String> {
        self.bus
            .upgrade()
            .and_then(|bus| {
                bus.listeners
                    .read()
                    .get(&self.id)
                    .map(|entry| entry.channels.iter().cloned().collect())
            })
            .unwrap_or_default()
    }

    fn close(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.listeners.write().remove(&self.id);
        }
    }
}

impl Drop for LocalSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

struct LocalEndpoint {
    name: String,
    bus: Weak<BusInner>,
}

impl Endpoint for LocalEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.endpoints.write().remove(&self.name);
        }
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

struct LocalRemote {
    endpoint: String,
    bus: Weak<BusInner>,
}

impl RemoteServer for LocalRemote {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn call(&self, method: &str, request: Bytes, timeout: Duration) -> IpaacaResult<Bytes> {
        let bus = self
            .bus
            .upgrade()
            .ok_or_else(|| IpaacaError::TransportError("bus has shut down".into()))?;
        bus.counters.calls.fetch_add(1, Ordering::Relaxed);

        let queue = bus
            .endpoints
            .read()
            .get(&self.endpoint)
            .cloned()
            .ok_or_else(|| IpaacaError::NoSuchEndpoint(self.endpoint.clone()))?;

        let (reply, response) = oneshot::channel();
        let call = Call {
            method: method.to_string(),
            request,
            reply,
        };

        let endpoint = self.endpoint.as_str();
        let exchange = async move {
            if queue.send(call).await.is_err() {
                return Err(IpaacaError::NoSuchEndpoint(endpoint.to_string()));
            }
            match response.await {
                Ok(result) => result,
                Err(_) => Err(IpaacaError::TransportError(format!(
                    "endpoint {} dropped the call",
                    endpoint
                ))),
            }
        };

        let outcome = bus.runtime()?.block_on(time::timeout(timeout, exchange));

        match outcome {
            Ok(result) => result,
            Err(_) => {
                bus.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("{} on {} timed out after {:?}", method, self.endpoint, timeout);
                Err(IpaacaError::RpcTimeout {
                    endpoint: self.endpoint.clone(),
                    method: method.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::thread;
    use std::time::Instant;

    struct Collect(Mutex<Sender<(String, Bytes)>>);

    impl Deliver for Collect {
        fn deliver(&self, channel: &str, frame: Bytes) {
            let _ = self.0.lock().send((channel.to_string(), frame));
        }
    }

    fn collector() -> (Arc<dyn Deliver>, Receiver<(String, Bytes)>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Collect(Mutex::new(tx))), rx)
    }

    struct Echo;

    impl RpcServer for Echo {
        fn handle(&self, method: &str, request: &[u8]) -> IpaacaResult<Bytes> {
            match method {
                "echo" => Ok(Bytes::copy_from_slice(request)),
                "slow" => {
                    thread::sleep(Duration::from_millis(300));
                    Ok(Bytes::new())
                }
                "panic" => panic!("boom"),
                other => Err(IpaacaError::NotImplemented(other.to_string())),
            }
        }
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_publish_order_across_channels() {
        let bus = LocalBus::new().unwrap();
        let (sink, rx) = collector();
        let _sub = bus
            .listen(&["a".to_string(), "b".to_string()], sink)
            .unwrap();

        for i in 0..50u8 {
            let channel = if i % 2 == 0 { "a" } else { "b" };
            bus.publish(channel, Bytes::from(vec![i])).unwrap();
        }
        for i in 0..50u8 {
            let (_, frame) = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(frame[0], i);
        }
    }

    #[test]
    fn test_channel_filtering_and_add_channel() {
        let bus = LocalBus::new().unwrap();
        let (sink, rx) = collector();
        let sub = bus.listen(&["a".to_string()], sink).unwrap();

        bus.publish("other", Bytes::from_static(b"x")).unwrap();
        sub.add_channel("other");
        bus.publish("other", Bytes::from_static(b"y")).unwrap();

        let (channel, frame) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(channel, "other");
        assert_eq!(&frame[..], b"y");
        assert_eq!(sub.channels().len(), 2);
    }

    #[test]
    fn test_close_stops_delivery() {
        let bus = LocalBus::new().unwrap();
        let (sink, rx) = collector();
        let sub = bus.listen(&["a".to_string()], sink).unwrap();
        sub.close();
        assert_eq!(bus.listener_count(), 0);
        bus.publish("a", Bytes::from_static(b"x")).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_rpc_roundtrip() {
        let bus = LocalBus::new().unwrap();
        let _endpoint = bus.serve("/srv", Arc::new(Echo)).unwrap();
        let remote = bus.remote("/srv").unwrap();
        let reply = remote.call("echo", Bytes::from_static(b"hi"), WAIT).unwrap();
        assert_eq!(&reply[..], b"hi");
        assert!(matches!(
            remote.call("nope", Bytes::new(), WAIT),
            Err(IpaacaError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_rpc_failures() {
        let bus = LocalBus::new().unwrap();
        let missing = bus.remote("/missing").unwrap();
        assert!(matches!(
            missing.call("echo", Bytes::new(), WAIT),
            Err(IpaacaError::NoSuchEndpoint(_))
        ));

        let endpoint = bus.serve("/srv", Arc::new(Echo)).unwrap();
        assert!(bus.serve("/srv", Arc::new(Echo)).is_err());

        let remote = bus.remote("/srv").unwrap();
        assert!(matches!(
            remote.call("slow", Bytes::new(), Duration::from_millis(20)),
            Err(IpaacaError::RpcTimeout { .. })
        ));
        assert!(matches!(
            remote.call("panic", Bytes::new(), WAIT),
            Err(IpaacaError::TransportError(_))
        ));
        assert_eq!(bus.stats().timeouts, 1);

        endpoint.close();
        assert!(!bus.has_endpoint("/srv"));
    }

    struct Flaky(Mutex<Sender<u8>>);

    impl Deliver for Flaky {
        fn deliver(&self, _channel: &str, frame: Bytes) {
            if frame[0] == 0 {
                panic!("handler failure");
            }
            let _ = self.0.lock().send(frame[0]);
        }
    }

    #[test]
    fn test_panicking_sink_keeps_listener_alive() {
        let bus = LocalBus::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let _sub = bus
            .listen(&["a".to_string()], Arc::new(Flaky(Mutex::new(tx))))
            .unwrap();
        bus.publish("a", Bytes::from_static(&[0])).unwrap();
        bus.publish("a", Bytes::from_static(&[1])).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);
    }

    struct Slow(Mutex<Sender<u8>>);

    impl Deliver for Slow {
        fn deliver(&self, _channel: &str, frame: Bytes) {
            thread::sleep(Duration::from_millis(100));
            let _ = self.0.lock().send(frame[0]);
        }
    }

    #[test]
    fn test_full_queue_blocks_publisher() {
        let bus = LocalBus::with_queue_capacity(1).unwrap();
        let (tx, rx) = mpsc::channel();
        let _sub = bus
            .listen(&["a".to_string()], Arc::new(Slow(Mutex::new(tx))))
            .unwrap();

        let started = Instant::now();
        for i in 0..4u8 {
            bus.publish("a", Bytes::from(vec![i])).unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(150));

        for i in 0..4u8 {
            assert_eq!(rx.recv_timeout(WAIT).unwrap(), i);
        }
    }

    #[test]
    fn test_dropped_bus_ends_remote_calls() {
        let bus = LocalBus::new().unwrap();
        let remote = bus.remote("/srv").unwrap();
        drop(bus);
        assert!(matches!(
            remote.call("echo", Bytes::new(), WAIT),
            Err(IpaacaError::TransportError(_))
        ));
    }
}
