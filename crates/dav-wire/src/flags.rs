//! Frame flags

/// Frame flags (1 byte)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags(0);

    // Flag bits
    pub const ENCRYPTED: u8 = 0b0000_0001;
    pub const RESERVED: u8 = 0b1111_1110;

    #[inline]
    pub fn new(bits: u8) -> Self {
        FrameFlags(bits)
    }

    #[inline]
    pub fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    #[inline]
    pub fn set_encrypted(&mut self, value: bool) {
        if value {
            self.0 |= Self::ENCRYPTED;
        } else {
            self.0 &= !Self::ENCRYPTED;
        }
    }

    /// Reserved bits must be zero
    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 & Self::RESERVED == 0
    }
}
