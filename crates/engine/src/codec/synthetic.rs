//! Deterministic stand-in codec.
//!
//! Every submission produces one gray frame whose luma is the wrapping sum of
//! the submitted bytes. A few payload prefixes drive the interesting paths:
//!
//! - [`DIM_MARKER`] followed by big-endian `u16` width and height switches the
//!   output resolution (like a new SPS would).
//! - [`FAULT_MARKER`] panics inside `send_packet`, standing in for a fault in
//!   a native decoder.
//! - [`UNSUPPORTED_MARKER`] emits a frame in a format no scaler accepts.
//! - [`WOULD_BLOCK_MARKER`] is refused with [`SendStatus::WouldBlock`] and
//!   produces no frame.
//! - A `DIM:` payload announcing a zero dimension is a hard decode error.
//!
//! The backend records every submission so callers can check exactly what
//! reached the decoder.

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{CodecBackend, FrameScaler, NativeFrame, SendStatus, VideoDecoder};
use crate::config::CodecKind;
use crate::error::{ConvertError, DecodeError};

pub const DIM_MARKER: &[u8; 4] = b"DIM:";
pub const FAULT_MARKER: &[u8; 4] = b"FALT";
pub const UNSUPPORTED_MARKER: &[u8; 4] = b"FMT?";
pub const WOULD_BLOCK_MARKER: &[u8; 4] = b"BUSY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticFormat {
    Gray8,
    Unsupported,
}

#[derive(Debug, Clone)]
pub struct SyntheticFrame {
    pub width: u32,
    pub height: u32,
    pub format: SyntheticFormat,
    pub pts: i64,
    pub luma: u8,
}

impl NativeFrame for SyntheticFrame {
    type Format = SyntheticFormat;

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> SyntheticFormat {
        self.format
    }
}

#[derive(Debug)]
struct Shared {
    default_dims: (u32, u32),
    codecs: Vec<CodecKind>,
    submissions: Mutex<Vec<Vec<u8>>>,
    decoders_opened: AtomicUsize,
    decoders_closed: AtomicUsize,
    scaler_requests: AtomicUsize,
}

/// Test-pattern backend; cheap to clone, clones share their records.
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    shared: Arc<Shared>,
}

impl SyntheticBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_codecs(width, height, vec![CodecKind::Hevc, CodecKind::H264])
    }

    /// Backend that can only open the listed codecs.
    pub fn with_codecs(width: u32, height: u32, codecs: Vec<CodecKind>) -> Self {
        Self {
            shared: Arc::new(Shared {
                default_dims: (width, height),
                codecs,
                submissions: Mutex::new(Vec::new()),
                decoders_opened: AtomicUsize::new(0),
                decoders_closed: AtomicUsize::new(0),
                scaler_requests: AtomicUsize::new(0),
            }),
        }
    }

    /// Every byte sequence handed to a decoder, in order.
    pub fn submissions(&self) -> Vec<Vec<u8>> {
        self.shared.submissions.lock().clone()
    }

    pub fn decoders_opened(&self) -> usize {
        self.shared.decoders_opened.load(Ordering::SeqCst)
    }

    pub fn decoders_closed(&self) -> usize {
        self.shared.decoders_closed.load(Ordering::SeqCst)
    }

    pub fn scaler_requests(&self) -> usize {
        self.shared.scaler_requests.load(Ordering::SeqCst)
    }
}

impl CodecBackend for SyntheticBackend {
    type Frame = SyntheticFrame;
    type Decoder = SyntheticDecoder;
    type Scaler = SyntheticScaler;

    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open_decoder(&self, codec: CodecKind) -> Result<SyntheticDecoder, DecodeError> {
        if !self.shared.codecs.contains(&codec) {
            return Err(DecodeError::UnsupportedCodec(codec));
        }
        self.shared.decoders_opened.fetch_add(1, Ordering::SeqCst);
        Ok(SyntheticDecoder {
            dims: self.shared.default_dims,
            pending: VecDeque::new(),
            shared: Arc::clone(&self.shared),
        })
    }

    fn create_scaler(
        &self,
        format: SyntheticFormat,
        width: u32,
        height: u32,
    ) -> Result<SyntheticScaler, ConvertError> {
        self.shared.scaler_requests.fetch_add(1, Ordering::SeqCst);
        match format {
            SyntheticFormat::Gray8 => Ok(SyntheticScaler { width, height }),
            SyntheticFormat::Unsupported => Err(ConvertError::ConversionUnsupported {
                format: format!("{:?}", format),
                width,
                height,
            }),
        }
    }
}

pub struct SyntheticDecoder {
    dims: (u32, u32),
    pending: VecDeque<SyntheticFrame>,
    shared: Arc<Shared>,
}

impl VideoDecoder for SyntheticDecoder {
    type Frame = SyntheticFrame;

    fn send_packet(&mut self, data: &[u8], pts: i64) -> Result<SendStatus, DecodeError> {
        self.shared.submissions.lock().push(data.to_vec());

        if data.starts_with(FAULT_MARKER) {
            panic!("synthetic decoder fault at pts {}", pts);
        }

        if data.starts_with(WOULD_BLOCK_MARKER) {
            return Ok(SendStatus::WouldBlock);
        }

        if data.starts_with(DIM_MARKER) && data.len() >= 8 {
            let width = BigEndian::read_u16(&data[4..6]) as u32;
            let height = BigEndian::read_u16(&data[6..8]) as u32;
            if width == 0 || height == 0 {
                return Err(DecodeError::Backend(format!(
                    "invalid dimensions {}x{}",
                    width, height
                )));
            }
            self.dims = (width, height);
        }

        let format = if data.starts_with(UNSUPPORTED_MARKER) {
            SyntheticFormat::Unsupported
        } else {
            SyntheticFormat::Gray8
        };

        let luma = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        self.pending.push_back(SyntheticFrame {
            width: self.dims.0,
            height: self.dims.1,
            format,
            pts,
            luma,
        });

        Ok(SendStatus::Accepted)
    }

    fn receive_frame(&mut self) -> Result<Option<SyntheticFrame>, DecodeError> {
        Ok(self.pending.pop_front())
    }
}

impl Drop for SyntheticDecoder {
    fn drop(&mut self) {
        self.shared.decoders_closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct SyntheticScaler {
    width: u32,
    height: u32,
}

impl FrameScaler for SyntheticScaler {
    type Frame = SyntheticFrame;

    fn scale(&mut self, frame: &SyntheticFrame, dest: &mut [u8]) -> Result<(), ConvertError> {
        if (frame.width, frame.height) != (self.width, self.height) {
            return Err(ConvertError::Backend(format!(
                "scaler built for {}x{}, got {}x{}",
                self.width, self.height, frame.width, frame.height
            )));
        }

        for pixel in dest.chunks_exact_mut(4) {
            pixel[0] = frame.luma;
            pixel[1] = frame.luma;
            pixel[2] = frame.luma;
            pixel[3] = 255;
        }
        Ok(())
    }
}

/// Build a `DIM:` payload announcing a new resolution.
pub fn dim_payload(width: u16, height: u16) -> Vec<u8> {
    let mut payload = DIM_MARKER.to_vec();
    payload.extend_from_slice(&width.to_be_bytes());
    payload.extend_from_slice(&height.to_be_bytes());
    payload
}
