//! Codec backend seam.
//!
//! A backend opens stateful decoders and builds pixel-format converters. It is
//! shared by every session of a manager, while the decoders and scalers it
//! creates live only on the session thread that created them.

#[cfg(feature = "ffmpeg")]
mod ffmpeg;
mod synthetic;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::{FfmpegBackend, FfmpegDecoder, FfmpegScaler};
pub use synthetic::{
    dim_payload, SyntheticBackend, SyntheticDecoder, SyntheticFormat, SyntheticFrame,
    SyntheticScaler, DIM_MARKER, FAULT_MARKER, UNSUPPORTED_MARKER, WOULD_BLOCK_MARKER,
};

use std::fmt;

use crate::config::CodecKind;
use crate::error::{ConvertError, DecodeError};

/// A decoded picture in the codec's native layout.
pub trait NativeFrame {
    type Format: Copy + Eq + fmt::Debug;

    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn format(&self) -> Self::Format;
}

/// What the decoder did with a submitted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    /// The decoder's input is full until pending frames are received.
    WouldBlock,
}

/// Stateful decoder for one coded format.
pub trait VideoDecoder {
    type Frame: NativeFrame;

    fn send_packet(&mut self, data: &[u8], pts: i64) -> Result<SendStatus, DecodeError>;

    /// `Ok(None)` means the decoder needs more input.
    fn receive_frame(&mut self) -> Result<Option<Self::Frame>, DecodeError>;
}

/// Converter from a native frame to tightly packed RGBA of the same size.
pub trait FrameScaler {
    type Frame: NativeFrame;

    /// `dest` holds exactly `width * height * 4` bytes.
    fn scale(&mut self, frame: &Self::Frame, dest: &mut [u8]) -> Result<(), ConvertError>;
}

pub trait CodecBackend: Send + Sync + 'static {
    type Frame: NativeFrame;
    type Decoder: VideoDecoder<Frame = Self::Frame>;
    type Scaler: FrameScaler<Frame = Self::Frame>;

    fn name(&self) -> &'static str;

    /// Open a decoder configured for low-delay, single-threaded decoding.
    fn open_decoder(&self, codec: CodecKind) -> Result<Self::Decoder, DecodeError>;

    fn create_scaler(
        &self,
        format: <Self::Frame as NativeFrame>::Format,
        width: u32,
        height: u32,
    ) -> Result<Self::Scaler, ConvertError>;
}

/// Native format of a backend's frames.
pub type FrameFormat<B> = <<B as CodecBackend>::Frame as NativeFrame>::Format;
