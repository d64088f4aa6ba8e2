//! Event definitions
//!
//! Every change a buffer observes on a unit is reported to handlers as one
//! of the event types below. The numeric values are single bits so that
//! handler filters can combine them into a mask.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// IU event type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum IuEventType {
    Added = 1,
    Committed = 2,
    Deleted = 4,
    Retracted = 8,
    Updated = 16,
    LinksUpdated = 32,
    Message = 64,
}

impl IuEventType {
    pub const ALL: [IuEventType; 7] = [
        IuEventType::Added,
        IuEventType::Committed,
        IuEventType::Deleted,
        IuEventType::Retracted,
        IuEventType::Updated,
        IuEventType::LinksUpdated,
        IuEventType::Message,
    ];

    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            1 => Some(IuEventType::Added),
            2 => Some(IuEventType::Committed),
            4 => Some(IuEventType::Deleted),
            8 => Some(IuEventType::Retracted),
            16 => Some(IuEventType::Updated),
            32 => Some(IuEventType::LinksUpdated),
            64 => Some(IuEventType::Message),
            _ => None,
        }
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IuEventType::Added => "ADDED",
            IuEventType::Committed => "COMMITTED",
            IuEventType::Deleted => "DELETED",
            IuEventType::Retracted => "RETRACTED",
            IuEventType::Updated => "UPDATED",
            IuEventType::LinksUpdated => "LINKSUPDATED",
            IuEventType::Message => "MESSAGE",
        }
    }
}

impl fmt::Display for IuEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handler filter over event types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventMask(pub u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const ALL_EVENTS: EventMask = EventMask(127);

    pub const ADDED: EventMask = EventMask(1);
    pub const COMMITTED: EventMask = EventMask(2);
    pub const DELETED: EventMask = EventMask(4);
    pub const RETRACTED: EventMask = EventMask(8);
    pub const UPDATED: EventMask = EventMask(16);
    pub const LINKSUPDATED: EventMask = EventMask(32);
    pub const MESSAGE: EventMask = EventMask(64);

    #[inline]
    pub fn new(bits: u32) -> Self {
        EventMask(bits & Self::ALL_EVENTS.0)
    }

    #[inline]
    pub fn contains(self, event: IuEventType) -> bool {
        self.0 & event.bits() != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate over the single event types selected by this mask
    pub fn iter(self) -> impl Iterator<Item = IuEventType> {
        IuEventType::ALL.into_iter().filter(move |e| self.contains(*e))
    }
}

impl Default for EventMask {
    fn default() -> Self {
        EventMask::ALL_EVENTS
    }
}

impl From<IuEventType> for EventMask {
    fn from(event: IuEventType) -> Self {
        EventMask(event.bits())
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOr<IuEventType> for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: IuEventType) -> EventMask {
        EventMask(self.0 | rhs.bits())
    }
}

impl BitOr for IuEventType {
    type Output = EventMask;

    fn bitor(self, rhs: IuEventType) -> EventMask {
        EventMask(self.bits() | rhs.bits())
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bits_roundtrip() {
        for event in IuEventType::ALL {
            assert_eq!(IuEventType::from_bits(event.bits()), Some(event));
        }
        assert_eq!(IuEventType::from_bits(3), None);
        assert_eq!(IuEventType::from_bits(128), None);
    }

    #[test]
    fn test_all_events_covers_every_type() {
        let mask = IuEventType::ALL
            .iter()
            .fold(EventMask::NONE, |m, e| m | *e);
        assert_eq!(mask, EventMask::ALL_EVENTS);
        assert_eq!(EventMask::ALL_EVENTS.iter().count(), 7);
    }

    #[test]
    fn test_mask_filtering() {
        let mask = IuEventType::Updated | IuEventType::Committed;
        assert!(mask.contains(IuEventType::Updated));
        assert!(mask.contains(IuEventType::Committed));
        assert!(!mask.contains(IuEventType::Added));
        assert_eq!(EventMask::new(0xFFFF), EventMask::ALL_EVENTS);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(IuEventType::LinksUpdated.to_string(), "LINKSUPDATED");
        assert_eq!(IuEventType::Message.as_str(), "MESSAGE");
    }
}
