//! IPAACA Core - Fundamental types shared by every IPAACA crate
//!
//! This crate defines:
//! - Identifiers (unit uids, buffer unique names, channel scopes)
//! - Event-type flags and handler masks
//! - Document values with lenient coercion
//! - Link graphs
//! - Configuration and protocol version
//! - The error taxonomy

pub mod config;
pub mod error;
pub mod event;
pub mod id;
pub mod links;
pub mod types;
pub mod value;

pub use config::*;
pub use error::*;
pub use event::*;
pub use id::*;
pub use links::*;
pub use types::*;
pub use value::*;
