//! Wire protocol of the beacon side-channel.

pub mod codec;
pub mod frames;

pub use codec::{DEFAULT_MAX_FRAME_BYTES, FrameCodec, FrameDecoder};
pub use frames::{
    ControlMessage, ControlMessageKind, FailureCode, Frame, PROTOCOL_VERSION, SUPPORTED_VERSIONS,
    SessionRpc, TransportFrame,
};
