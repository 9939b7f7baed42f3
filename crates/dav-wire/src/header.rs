//! Frame header
//!
//! Frame header is 5 bytes:
//! - Byte 0: Flags
//! - Bytes 1-4: Body length (LE)
//!
//! The body is either a plain telegram or, with the encrypted flag set, the
//! sealed telegram followed by the AEAD tag.

use dav_core::{DavError, DavResult};

use crate::FrameFlags;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 5;

/// Frame header structure
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: FrameFlags,
    pub body_len: u32,
}

impl FrameHeader {
    pub fn new(flags: FrameFlags, body_len: u32) -> Self {
        FrameHeader { flags, body_len }
    }

    /// Parse header from bytes
    pub fn parse(buf: &[u8]) -> DavResult<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(DavError::BufferTooShort {
                expected: FRAME_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let flags = FrameFlags::new(buf[0]);
        if !flags.is_valid() {
            return Err(DavError::InvalidWireFormat(format!(
                "Reserved frame flags set: {:#04x}",
                flags.0
            )));
        }

        let body_len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);

        Ok(FrameHeader { flags, body_len })
    }

    /// Serialize header into the first bytes of `buf`
    pub fn serialize(&self, buf: &mut [u8]) -> DavResult<()> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(DavError::BufferTooShort {
                expected: FRAME_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        buf[0] = self.flags.0;
        buf[1..5].copy_from_slice(&self.body_len.to_le_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut flags = FrameFlags::NONE;
        flags.set_encrypted(true);
        let header = FrameHeader::new(flags, 0x0102_0304);

        let mut buf = [0u8; FRAME_HEADER_SIZE];
        header.serialize(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(FrameHeader::parse(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_too_short() {
        assert!(matches!(
            FrameHeader::parse(&[0u8; 3]),
            Err(DavError::BufferTooShort { expected: 5, actual: 3 })
        ));
    }

    #[test]
    fn test_reserved_flags_rejected() {
        assert!(FrameHeader::parse(&[0x04, 0, 0, 0, 0]).is_err());
    }
}
