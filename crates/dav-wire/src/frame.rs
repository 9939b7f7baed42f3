//! Length-delimited frames on a byte stream
//!
//! Frame = Header + Body. The body of an encrypted frame is opaque to this
//! layer; the channel opens it before decoding the telegram.

use bytes::{Buf, BytesMut};

use dav_core::{DavError, DavResult};

use crate::{FrameFlags, FrameHeader, Telegram, FRAME_HEADER_SIZE};

/// Maximum body size accepted from the wire
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Complete frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a frame around a body
    pub fn new(flags: FrameFlags, body: Vec<u8>) -> DavResult<Self> {
        if body.len() > MAX_FRAME_SIZE {
            return Err(DavError::FrameTooLarge {
                size: body.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(Frame {
            header: FrameHeader::new(flags, body.len() as u32),
            body,
        })
    }

    /// Plain frame carrying one telegram
    pub fn plain(telegram: &Telegram) -> DavResult<Self> {
        Frame::new(FrameFlags::NONE, telegram.encode())
    }

    pub fn is_encrypted(&self) -> bool {
        self.header.flags.is_encrypted()
    }

    /// Serialize frame to bytes
    pub fn serialize(&self) -> DavResult<Vec<u8>> {
        let mut buf = vec![0u8; FRAME_HEADER_SIZE + self.body.len()];
        self.header.serialize(&mut buf)?;
        buf[FRAME_HEADER_SIZE..].copy_from_slice(&self.body);
        Ok(buf)
    }

    /// Total size on the wire
    pub fn size(&self) -> usize {
        FRAME_HEADER_SIZE + self.body.len()
    }
}

/// Incremental decoder for frames arriving on a stream
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Option<FrameHeader>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one complete frame from `buf`, if available
    pub fn decode(&mut self, buf: &mut BytesMut) -> DavResult<Option<Frame>> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if buf.len() < FRAME_HEADER_SIZE {
                    return Ok(None);
                }
                let header = FrameHeader::parse(&buf[..FRAME_HEADER_SIZE])?;
                if header.body_len as usize > MAX_FRAME_SIZE {
                    return Err(DavError::FrameTooLarge {
                        size: header.body_len as usize,
                        max: MAX_FRAME_SIZE,
                    });
                }
                buf.advance(FRAME_HEADER_SIZE);
                self.pending = Some(header);
                header
            }
        };

        let body_len = header.body_len as usize;
        if buf.len() < body_len {
            buf.reserve(body_len - buf.len());
            return Ok(None);
        }

        self.pending = None;
        let body = buf.split_to(body_len).to_vec();
        Ok(Some(Frame { header, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dav_core::DistributorId;

    #[test]
    fn test_frame_roundtrip() {
        let telegram = Telegram::TransmitterRequest {
            distributor: DistributorId::new(42),
        };
        let frame = Frame::plain(&telegram).unwrap();
        let bytes = frame.serialize().unwrap();
        assert_eq!(bytes.len(), frame.size());

        let mut buf = BytesMut::from(&bytes[..]);
        let mut decoder = FrameDecoder::new();
        let parsed = decoder.decode(&mut buf).unwrap().unwrap();

        assert!(!parsed.is_encrypted());
        assert_eq!(Telegram::decode(&parsed.body).unwrap(), telegram);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frames() {
        let first = Frame::plain(&Telegram::KeepAlive).unwrap().serialize().unwrap();
        let second = Frame::plain(&Telegram::Closing {
            message: "bye".into(),
        })
        .unwrap()
        .serialize()
        .unwrap();
        let mut stream: Vec<u8> = first;
        stream.extend_from_slice(&second);

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        // Feed one byte at a time
        for b in stream {
            buf.extend_from_slice(&[b]);
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                frames.push(Telegram::decode(&frame.body).unwrap());
            }
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Telegram::KeepAlive);
    }

    #[test]
    fn test_frame_size_limits() {
        assert!(Frame::new(FrameFlags::NONE, vec![0u8; MAX_FRAME_SIZE + 1]).is_err());

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0x7F]);
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(DavError::FrameTooLarge { .. })
        ));
    }
}
