//! Small protocol enums shared by units, records and configuration

use std::fmt;
use std::str::FromStr;

use crate::{IpaacaError, IpaacaResult};

/// Unit revision counter; `0` is reserved as the RPC rejection marker
pub type Revision = u32;

/// Payload encoding requested by a unit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// Flat string-valued map
    Map = 0,
    /// Full recursive document tree
    #[default]
    Json = 1,
    /// Legacy protocol: every value forced to text
    Str = 2,
}

impl PayloadType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PayloadType::Map),
            1 => Some(PayloadType::Json),
            2 => Some(PayloadType::Str),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PayloadType::Map => "MAP",
            PayloadType::Json => "JSON",
            PayloadType::Str => "STR",
        }
    }

    /// Whether nested lists and maps can be carried
    #[inline]
    pub fn supports_nesting(self) -> bool {
        matches!(self, PayloadType::Json | PayloadType::Str)
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadType {
    type Err = IpaacaError;

    fn from_str(s: &str) -> IpaacaResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MAP" => Ok(PayloadType::Map),
            "JSON" => Ok(PayloadType::Json),
            "STR" => Ok(PayloadType::Str),
            other => Err(IpaacaError::TypeConversion(format!(
                "unknown payload type {}",
                other
            ))),
        }
    }
}

/// How changes to a unit reach other processes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessMode {
    /// Updates are broadcast to every subscriber
    #[default]
    Push = 0,
    /// Reads are RPC calls to the owner (not implemented)
    Remote = 1,
    /// Fire-and-forget message
    Message = 2,
}

impl AccessMode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(AccessMode::Push),
            1 => Some(AccessMode::Remote),
            2 => Some(AccessMode::Message),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Protocol version, exchanged out-of-band when a transport is attached
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 2, minor: 0 };

    #[inline]
    pub fn new(major: u32, minor: u32) -> Self {
        ProtocolVersion { major, minor }
    }

    /// Peers interoperate when the major versions agree
    #[inline]
    pub fn is_compatible(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }

    pub fn check_compatible(&self, remote: &ProtocolVersion) -> IpaacaResult<()> {
        if self.is_compatible(remote) {
            Ok(())
        } else {
            Err(IpaacaError::IncompatibleProtocol {
                local_major: self.major,
                local_minor: self.minor,
                remote_major: remote.major,
                remote_minor: remote.minor,
            })
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
