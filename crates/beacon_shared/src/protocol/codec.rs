//! Frame Codec
//!
//! Responsibilities:
//! - Length-prefix framing: [u32_be length][payload bytes]
//! - (De)serialization of `Frame` (see `frames.rs`) via `bincode`.
//! - Incremental decode support; the caller feeds arbitrary raw byte chunks
//!   (one transport datagram may carry several frames, or half of one) and
//!   pulls zero or more frames.
//!
//! Error Handling:
//! - Oversized length prefix (> `max_frame_bytes`) => hard error, the endpoint
//!   answers with `FailureCode::Malformed` and closes the link.
//! - Bincode errors are surfaced as `CodecError::Bincode`.
//!
//! Logging:
//! - target: `beacon::frames` (trace only)

use bytes::Bytes;

use super::frames::Frame;
use crate::error::CodecError;

/// Default payload limit, excluding the 4-byte prefix.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 64 * 1024;

/// Codec configuration / stateless helper.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Maximum allowed serialized frame payload size (bytes), excluding the 4-byte length prefix.
    pub max_frame_bytes: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: u32) -> Self {
        Self { max_frame_bytes }
    }

    /// Encode a single `Frame` and append to `out`.
    ///
    /// Layout: [len: u32 BE][payload bytes...]
    pub fn encode(&self, frame: &Frame, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let start = out.len();
        out.extend_from_slice(&[0, 0, 0, 0]);

        if let Err(err) = bincode::serialize_into(&mut *out, frame) {
            out.truncate(start);
            return Err(err.into());
        }

        let payload_len = (out.len() - start - 4) as u32;
        if payload_len > self.max_frame_bytes {
            // leave previously buffered frames intact
            out.truncate(start);
            return Err(CodecError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_bytes,
            });
        }
        out[start..start + 4].copy_from_slice(&payload_len.to_be_bytes());
        tracing::trace!(target: "beacon::frames", bytes = payload_len, ?frame, "encoded");
        Ok(())
    }

    /// Encode a single frame into its own buffer, ready to hand to a transport.
    pub fn encode_to_bytes(&self, frame: &Frame) -> Result<Bytes, CodecError> {
        let mut out = Vec::new();
        self.encode(frame, &mut out)?;
        Ok(Bytes::from(out))
    }

    /// Attempt to decode exactly one frame from `buffer`.
    ///
    /// Returns:
    /// - Ok(Some(Frame)) if a full frame was decoded (and removed from buffer)
    /// - Ok(None) if not enough data yet
    /// - Err if malformed / violates size limit / decode error
    pub fn try_decode(buffer: &mut Vec<u8>, max_frame_bytes: u32) -> Result<Option<Frame>, CodecError> {
        if buffer.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buffer[..4]);
        let frame_len = u32::from_be_bytes(len_bytes);

        if frame_len > max_frame_bytes {
            return Err(CodecError::IncomingTooLarge {
                size: frame_len,
                max: max_frame_bytes,
            });
        }

        let total_needed = 4 + frame_len as usize;
        if buffer.len() < total_needed {
            return Ok(None);
        }

        let frame: Result<Frame, _> = bincode::deserialize(&buffer[4..total_needed]);
        buffer.drain(..total_needed);
        let frame = frame?;
        tracing::trace!(target: "beacon::frames", bytes = frame_len, ?frame, "decoded");
        Ok(Some(frame))
    }
}

/// Stateful incremental decoder.
/// Feed arbitrary chunks via `push_bytes`, then repeatedly call `next_frame`
/// until it returns Ok(None).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_bytes: u32,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        FrameCodec::try_decode(&mut self.buf, self.max_frame_bytes)
    }

    /// Undecoded byte count (diagnostics).
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Clear buffer (e.g. after fatal error).
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::super::frames::{ControlMessage, FailureCode};
    use super::*;
    use crate::ids::PlayerId;

    #[test]
    fn pipelined_frames_decode_in_order() {
        let codec = FrameCodec::new(4096);
        let mut wire = Vec::new();
        codec.encode(&ControlMessage::EncryptionAck.into(), &mut wire).unwrap();
        codec.encode(&ControlMessage::Welcome.into(), &mut wire).unwrap();

        let mut dec = FrameDecoder::new(4096);
        dec.push_bytes(&wire);
        assert_eq!(dec.next_frame().unwrap(), Some(ControlMessage::EncryptionAck.into()));
        assert_eq!(dec.next_frame().unwrap(), Some(ControlMessage::Welcome.into()));
        assert!(dec.next_frame().unwrap().is_none());
        assert_eq!(dec.buffered_len(), 0);
    }

    #[test]
    fn decoder_incremental() {
        let codec = FrameCodec::new(4096);
        let frame = Frame::failure(FailureCode::Malformed, "oops");
        let serialized = codec.encode_to_bytes(&frame).unwrap();

        let split = 5;
        let mut dec = FrameDecoder::new(4096);
        dec.push_bytes(&serialized[..split]);
        assert!(dec.next_frame().unwrap().is_none(), "should need more data");
        dec.push_bytes(&serialized[split..]);
        let decoded = dec.next_frame().unwrap().expect("frame now complete");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn oversize_rejected_and_buffer_untouched() {
        let codec = FrameCodec::new(8);
        let mut buf = vec![1, 2, 3];
        let frame = Frame::Control(ControlMessage::Login {
            player_id: PlayerId::from("a-rather-long-player-id"),
            login_options: "?name=x".into(),
            auth_token: None,
        });
        let err = codec.encode(&frame, &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { max: 8, .. }));
        assert_eq!(buf, vec![1, 2, 3]);
    }

    #[test]
    fn oversize_decode_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1000u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 1000]);
        let err = FrameCodec::try_decode(&mut buf, 64).unwrap_err();
        assert!(err.to_string().contains("frame too large"));
    }

    #[test]
    fn garbage_payload_is_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            FrameCodec::try_decode(&mut buf, 64),
            Err(CodecError::Bincode(_))
        ));
        assert!(buf.is_empty(), "malformed frame is consumed");
    }
}
