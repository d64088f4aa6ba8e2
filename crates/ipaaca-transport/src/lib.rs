//! IPAACA Transport - publish/subscribe and request/response plumbing
//!
//! This crate provides:
//! - The `Transport` trait buffers are written against
//! - `LocalBus`, an in-process transport on a tokio runtime, with bounded
//!   per-listener FIFO queues and RPC endpoints served as blocking tasks

pub mod local;

pub use local::*;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ipaaca_core::{IpaacaResult, ProtocolVersion};

/// Receives frames published on the channels of a subscription
pub trait Deliver: Send + Sync {
    fn deliver(&self, channel: &str, frame: Bytes);
}

/// Serves the methods of one RPC endpoint
pub trait RpcServer: Send + Sync {
    fn handle(&self, method: &str, request: &[u8]) -> IpaacaResult<Bytes>;
}

/// Client side of an RPC endpoint
pub trait RemoteServer: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Blocking call, bounded by `timeout`
    fn call(&self, method: &str, request: Bytes, timeout: Duration) -> IpaacaResult<Bytes>;
}

/// A live listener registration
pub trait Subscription: Send + Sync {
    /// Start receiving a further channel; frames keep one FIFO order
    fn add_channel(&self, channel: &str);

    fn channels(&self) -> Vec<String>;

    /// Stop delivery; frames already queued are still handed over
    fn close(&self);
}

/// A live RPC endpoint registration
pub trait Endpoint: Send + Sync {
    fn name(&self) -> &str;

    fn close(&self);
}

/// Publish/subscribe plus request/response substrate
pub trait Transport: Send + Sync {
    /// Version of the IPAACA protocol spoken over this transport
    fn protocol_version(&self) -> ProtocolVersion;

    /// Publish one frame; delivery order per publisher is preserved. Blocks
    /// while a receiving listener's queue is full.
    fn publish(&self, channel: &str, frame: Bytes) -> IpaacaResult<()>;

    /// Register a listener on a set of channels. All frames for one listener
    /// are delivered in order on a single thread.
    fn listen(&self, channels: &[String], sink: Arc<dyn Deliver>) -> IpaacaResult<Box<dyn Subscription>>;

    /// Serve an RPC endpoint
    fn serve(&self, endpoint: &str, server: Arc<dyn RpcServer>) -> IpaacaResult<Box<dyn Endpoint>>;

    /// Client for an RPC endpoint; resolution happens at call time
    fn remote(&self, endpoint: &str) -> IpaacaResult<Arc<dyn RemoteServer>>;
}
