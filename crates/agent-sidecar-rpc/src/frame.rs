//! Length-prefixed framing.
//!
//! Every message is a 4-byte big-endian length followed by that many bytes
//! of UTF-8 JSON. Zero-length and oversize frames are protocol violations and
//! are rejected as soon as the header is read.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest accepted payload (1 MiB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Framing error. Any of these closes the connection.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("zero-length frame")]
    Empty,
    #[error("frame of {len} bytes exceeds limit of {max}")]
    Oversize { len: usize, max: usize },
    #[error("connection closed mid-frame ({missing} bytes missing)")]
    Truncated { missing: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Codec for `Framed` Unix streams.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    #[must_use]
    pub const fn with_max_len(max_len: usize) -> Self {
        Self { max_len }
    }

    #[must_use]
    pub const fn max_len(&self) -> usize {
        self.max_len
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = [src[0], src[1], src[2], src[3]];
        let declared = u32::from_be_bytes(header);
        let len = usize::try_from(declared).map_err(|_| FrameError::Oversize {
            len: usize::MAX,
            max: self.max_len,
        })?;

        if len == 0 {
            return Err(FrameError::Empty);
        }
        if len > self.max_len {
            return Err(FrameError::Oversize {
                len,
                max: self.max_len,
            });
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        // Closing before a full header is a normal disconnect.
        if src.len() < HEADER_LEN {
            src.clear();
            return Ok(None);
        }
        let declared = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let missing = usize::try_from(declared)
            .unwrap_or(usize::MAX)
            .saturating_sub(src.len() - HEADER_LEN);
        src.clear();
        Err(FrameError::Truncated { missing })
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if item.is_empty() {
            return Err(FrameError::Empty);
        }
        let len = u32::try_from(item.len()).map_err(|_| FrameError::Oversize {
            len: item.len(),
            max: u32::MAX as usize,
        })?;
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32(len);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(len: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(len);
        buf
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let mut buf = header(5);
        buf.extend_from_slice(b"{\"a\"");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"}");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"{\"a\"}"));
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_length_rejected_without_body() {
        let mut codec = FrameCodec::new();
        let mut buf = header(0);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::Empty)));
    }

    #[test]
    fn oversize_rejected_from_header_alone() {
        let mut codec = FrameCodec::new();
        let over = u32::try_from(MAX_FRAME_LEN + 1).unwrap();
        let mut buf = header(over);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::Oversize { len: 1_048_577, .. })
        ));

        // Exactly at the limit is still waiting for its body.
        let mut buf = header(u32::try_from(MAX_FRAME_LEN).unwrap());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn eof_before_header_is_clean_close() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 1][..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn eof_mid_body_is_truncated() {
        let mut codec = FrameCodec::new();
        let mut buf = header(10);
        buf.extend_from_slice(b"abc");
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FrameError::Truncated { missing: 7 })
        ));
    }

    #[test]
    fn encode_prefixes_length() {
        let mut codec = FrameCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(Bytes::from_static(b"{}"), &mut dst).unwrap();
        assert_eq!(&dst[..], &[0, 0, 0, 2, b'{', b'}']);

        assert!(matches!(codec.encode(Bytes::new(), &mut dst), Err(FrameError::Empty)));
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"1"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"22"), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"1"));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"22"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_frames_split_across_reads() {
        use futures::StreamExt;
        use tokio_util::codec::FramedRead;

        let io = tokio_test::io::Builder::new()
            .read(&[0, 0])
            .read(&[0, 4, b'p', b'i'])
            .read(b"ng")
            .build();
        let mut frames = FramedRead::new(io, FrameCodec::new());
        let frame = tokio_test::assert_ok!(frames.next().await.unwrap());
        assert_eq!(frame, Bytes::from_static(b"ping"));
        assert!(frames.next().await.is_none());
    }
}
