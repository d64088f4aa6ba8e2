//! IPAACA Runtime - Units, buffers and event delivery
//!
//! This crate implements:
//! - The unit state machine with revisions and terminal latches
//! - Payload access with batched transactions
//! - Output buffers that own units and answer remote writes
//! - Input buffers that mirror remote units and forward writes to owners
//! - Per-buffer event dispatch to registered handlers
//! - Logging setup and the process-wide runtime handle

pub mod dispatch;
pub mod input;
pub mod logging;
pub mod output;
pub mod payload;
pub mod runtime;
mod sink;
pub mod unit;

pub use dispatch::*;
pub use input::*;
pub use output::*;
pub use payload::*;
pub use runtime::*;
pub use unit::*;
