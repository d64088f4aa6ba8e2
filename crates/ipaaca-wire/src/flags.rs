//! Record flags

/// Record flags (1 byte)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordFlags(pub u8);

impl RecordFlags {
    pub const NONE: RecordFlags = RecordFlags(0);

    // Flag bits
    pub const DELTA: u8 = 0b0000_0001;
    pub const COMMITTED: u8 = 0b0000_0010;
    pub const RETRACTED: u8 = 0b0000_0100;
    pub const READ_ONLY: u8 = 0b0000_1000;
    /// Bits no record kind defines
    pub const UNDEFINED: u8 = 0b1111_0000;

    #[inline]
    pub fn new(bits: u8) -> Self {
        RecordFlags(bits)
    }

    #[inline]
    pub fn is_delta(self) -> bool {
        self.0 & Self::DELTA != 0
    }

    #[inline]
    pub fn is_committed(self) -> bool {
        self.0 & Self::COMMITTED != 0
    }

    #[inline]
    pub fn is_retracted(self) -> bool {
        self.0 & Self::RETRACTED != 0
    }

    #[inline]
    pub fn is_read_only(self) -> bool {
        self.0 & Self::READ_ONLY != 0
    }

    #[inline]
    pub fn has_undefined_bits(self) -> bool {
        self.0 & Self::UNDEFINED != 0
    }

    #[inline]
    pub fn set(&mut self, bit: u8, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    #[inline]
    pub fn with(mut self, bit: u8, value: bool) -> Self {
        self.set(bit, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bits() {
        let mut flags = RecordFlags::NONE;
        assert!(!flags.is_delta());

        flags.set(RecordFlags::DELTA, true);
        flags.set(RecordFlags::READ_ONLY, true);
        assert!(flags.is_delta());
        assert!(flags.is_read_only());
        assert!(!flags.is_committed());

        flags.set(RecordFlags::DELTA, false);
        assert!(!flags.is_delta());
        assert!(flags.is_read_only());
    }

    #[test]
    fn test_undefined_bits() {
        assert!(!RecordFlags::NONE.with(RecordFlags::RETRACTED, true).has_undefined_bits());
        assert!(RecordFlags::new(0x80).has_undefined_bits());
    }
}
