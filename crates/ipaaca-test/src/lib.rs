//! IPAACA Test Harness - Multi-peer protocol validation
//!
//! This crate provides:
//! - Peers wired to a shared in-process bus
//! - Event recording with blocking waits
//! - Concurrent-writer convergence testing
//! - End-to-end scenarios over real buffers

pub mod harness;
pub mod integration;

#[cfg(test)]
mod scenarios;

pub use harness::*;
pub use integration::*;
