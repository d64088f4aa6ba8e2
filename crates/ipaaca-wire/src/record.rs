//! Update records exchanged between buffers

use std::collections::BTreeSet;

use ipaaca_core::{AccessMode, DocumentMap, LinkMap, PayloadType, Revision};

/// Record kind identifiers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// Full unit state, sent on publication and on resend
    UnitSnapshot = 0x01,
    /// Full state of a one-shot message
    MessageSnapshot = 0x02,
    PayloadUpdate = 0x10,
    LinkUpdate = 0x11,
    Commission = 0x20,
    Retraction = 0x21,
    Deletion = 0x22,
    ResendRequest = 0x30,
}

impl RecordKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(RecordKind::UnitSnapshot),
            0x02 => Some(RecordKind::MessageSnapshot),
            0x10 => Some(RecordKind::PayloadUpdate),
            0x11 => Some(RecordKind::LinkUpdate),
            0x20 => Some(RecordKind::Commission),
            0x21 => Some(RecordKind::Retraction),
            0x22 => Some(RecordKind::Deletion),
            0x30 => Some(RecordKind::ResendRequest),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Terminal record discriminant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TerminalKind {
    Commission,
    Retraction,
    Deletion,
}

impl TerminalKind {
    pub fn record_kind(self) -> RecordKind {
        match self {
            TerminalKind::Commission => RecordKind::Commission,
            TerminalKind::Retraction => RecordKind::Retraction,
            TerminalKind::Deletion => RecordKind::Deletion,
        }
    }
}

/// Delta or full payload change
#[derive(Clone, Debug, PartialEq)]
pub struct PayloadUpdate {
    pub uid: String,
    pub revision: Revision,
    pub writer_name: String,
    pub is_delta: bool,
    pub new_items: DocumentMap,
    pub keys_to_remove: BTreeSet<String>,
    pub payload_type: PayloadType,
}

impl PayloadUpdate {
    /// True if applying this update would change nothing
    pub fn is_empty(&self) -> bool {
        self.is_delta && self.new_items.is_empty() && self.keys_to_remove.is_empty()
    }
}

/// Delta or full link change
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkUpdate {
    pub uid: String,
    pub revision: Revision,
    pub writer_name: String,
    pub is_delta: bool,
    pub new_links: LinkMap,
    pub links_to_remove: LinkMap,
}

/// Commission, retraction or deletion of a unit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalRecord {
    pub uid: String,
    pub revision: Revision,
    pub writer_name: String,
    pub kind: TerminalKind,
}

/// Complete state of a unit
#[derive(Clone, Debug, PartialEq)]
pub struct UnitSnapshot {
    pub uid: String,
    pub revision: Revision,
    pub category: String,
    pub payload_type: PayloadType,
    pub owner_name: String,
    pub committed: bool,
    pub retracted: bool,
    pub read_only: bool,
    pub access_mode: AccessMode,
    pub payload: DocumentMap,
    pub links: LinkMap,
}

/// Request to republish a unit on the requester's hidden category
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResendRequest {
    pub uid: String,
    pub hidden_scope_name: String,
}

/// Any record the codec understands
#[derive(Clone, Debug, PartialEq)]
pub enum WireRecord {
    Unit(UnitSnapshot),
    Message(UnitSnapshot),
    Payload(PayloadUpdate),
    Links(LinkUpdate),
    Terminal(TerminalRecord),
    Resend(ResendRequest),
}

impl WireRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            WireRecord::Unit(_) => RecordKind::UnitSnapshot,
            WireRecord::Message(_) => RecordKind::MessageSnapshot,
            WireRecord::Payload(_) => RecordKind::PayloadUpdate,
            WireRecord::Links(_) => RecordKind::LinkUpdate,
            WireRecord::Terminal(t) => t.kind.record_kind(),
            WireRecord::Resend(_) => RecordKind::ResendRequest,
        }
    }

    pub fn uid(&self) -> &str {
        match self {
            WireRecord::Unit(s) | WireRecord::Message(s) => &s.uid,
            WireRecord::Payload(p) => &p.uid,
            WireRecord::Links(l) => &l.uid,
            WireRecord::Terminal(t) => &t.uid,
            WireRecord::Resend(r) => &r.uid,
        }
    }

    /// Name of the buffer that produced the change, if the record carries one
    pub fn writer_name(&self) -> Option<&str> {
        match self {
            WireRecord::Unit(s) | WireRecord::Message(s) => Some(&s.owner_name),
            WireRecord::Payload(p) => Some(&p.writer_name),
            WireRecord::Links(l) => Some(&l.writer_name),
            WireRecord::Terminal(t) => Some(&t.writer_name),
            WireRecord::Resend(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_kind_bytes() {
        for kind in [
            RecordKind::UnitSnapshot,
            RecordKind::MessageSnapshot,
            RecordKind::PayloadUpdate,
            RecordKind::LinkUpdate,
            RecordKind::Commission,
            RecordKind::Retraction,
            RecordKind::Deletion,
            RecordKind::ResendRequest,
        ] {
            assert_eq!(RecordKind::from_byte(kind.to_byte()), Some(kind));
        }
        assert_eq!(RecordKind::from_byte(0x7F), None);
    }

    #[test]
    fn test_record_accessors() {
        let record = WireRecord::Terminal(TerminalRecord {
            uid: "u1".into(),
            revision: 3,
            writer_name: "w".into(),
            kind: TerminalKind::Retraction,
        });
        assert_eq!(record.kind(), RecordKind::Retraction);
        assert_eq!(record.uid(), "u1");
        assert_eq!(record.writer_name(), Some("w"));
    }

    #[test]
    fn test_empty_payload_update() {
        let update = PayloadUpdate {
            uid: "u".into(),
            revision: 1,
            writer_name: String::new(),
            is_delta: true,
            new_items: DocumentMap::new(),
            keys_to_remove: BTreeSet::new(),
            payload_type: PayloadType::Json,
        };
        assert!(update.is_empty());
        assert!(!PayloadUpdate { is_delta: false, ..update }.is_empty());
    }
}
