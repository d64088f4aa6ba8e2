//! IPAACA Wire - update records and their binary encoding
//!
//! Every record travels as one self-describing frame:
//! - Byte 0: record kind
//! - Byte 1: record flags
//! - Remaining bytes: kind-specific body, little-endian integers,
//!   `u16`-prefixed strings and `u32`-prefixed values
//!
//! Payload values inside a body are encoded according to the payload type
//! of the unit they belong to.

pub mod codec;
pub mod flags;
pub mod record;

pub use codec::*;
pub use flags::*;
pub use record::*;
