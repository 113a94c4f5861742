//! FFmpeg decoder and software scaler backend

use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context as ScalingContext, Flags as ScalingFlags};
use ffmpeg_next::util::error::EAGAIN;
use ffmpeg_next::util::frame::video::Video as VideoFrame;
use tracing::{debug, info};

use super::{CodecBackend, FrameScaler, NativeFrame, SendStatus, VideoDecoder};
use crate::config::CodecKind;
use crate::error::{ConvertError, DecodeError};

/// Backend wrapping libavcodec + libswscale.
pub struct FfmpegBackend {
    _priv: (),
}

impl FfmpegBackend {
    /// Initialize FFmpeg once for the process and quiet its logging down to
    /// errors. FFmpeg writes those lines to stderr itself; they do not pass
    /// through `tracing`.
    pub fn new() -> Result<Self, DecodeError> {
        ffmpeg::init().map_err(|e| DecodeError::Backend(format!("FFmpeg init failed: {}", e)))?;
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
        info!(log_level = "error", "FFmpeg initialized, native log output on stderr");
        Ok(Self { _priv: () })
    }
}

impl NativeFrame for VideoFrame {
    type Format = Pixel;

    fn width(&self) -> u32 {
        VideoFrame::width(self)
    }

    fn height(&self) -> u32 {
        VideoFrame::height(self)
    }

    fn format(&self) -> Pixel {
        VideoFrame::format(self)
    }
}

impl CodecBackend for FfmpegBackend {
    type Frame = VideoFrame;
    type Decoder = FfmpegDecoder;
    type Scaler = FfmpegScaler;

    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open_decoder(&self, kind: CodecKind) -> Result<FfmpegDecoder, DecodeError> {
        let id = match kind {
            CodecKind::Hevc => codec::Id::HEVC,
            CodecKind::H264 => codec::Id::H264,
        };

        let found = ffmpeg::decoder::find(id).ok_or(DecodeError::UnsupportedCodec(kind))?;

        let mut context = codec::context::Context::new_with_codec(found);
        context.set_flags(codec::Flags::LOW_DELAY);

        // SAFETY: the context was just allocated and is not opened yet, so
        // writing plain option fields through the raw pointer is what
        // avcodec expects before avcodec_open2.
        unsafe {
            let raw = context.as_mut_ptr();
            (*raw).flags2 |= ffmpeg::ffi::AV_CODEC_FLAG2_FAST as i32;
            (*raw).thread_count = 1;
        }

        let decoder = context
            .decoder()
            .open_as(found)
            .and_then(|opened| opened.video())
            .map_err(|e| DecodeError::OpenFailed {
                codec: kind,
                reason: e.to_string(),
            })?;

        debug!(codec = ?kind, name = found.name(), "Opened low-delay decoder");

        Ok(FfmpegDecoder { decoder })
    }

    fn create_scaler(
        &self,
        format: Pixel,
        width: u32,
        height: u32,
    ) -> Result<FfmpegScaler, ConvertError> {
        let context = ScalingContext::get(
            format,
            width,
            height,
            Pixel::RGBA,
            width,
            height,
            ScalingFlags::FAST_BILINEAR,
        )
        .map_err(|_| ConvertError::ConversionUnsupported {
            format: format!("{:?}", format),
            width,
            height,
        })?;

        Ok(FfmpegScaler {
            context,
            output: VideoFrame::empty(),
            width,
            height,
        })
    }
}

pub struct FfmpegDecoder {
    decoder: ffmpeg::decoder::Video,
}

impl VideoDecoder for FfmpegDecoder {
    type Frame = VideoFrame;

    fn send_packet(&mut self, data: &[u8], pts: i64) -> Result<SendStatus, DecodeError> {
        let mut packet = ffmpeg::Packet::copy(data);
        packet.set_pts(Some(pts));

        match self.decoder.send_packet(&packet) {
            Ok(()) => Ok(SendStatus::Accepted),
            Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => Ok(SendStatus::WouldBlock),
            Err(e) => Err(DecodeError::Backend(e.to_string())),
        }
    }

    fn receive_frame(&mut self) -> Result<Option<VideoFrame>, DecodeError> {
        let mut frame = VideoFrame::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => Ok(Some(frame)),
            Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => Ok(None),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(e) => Err(DecodeError::Backend(e.to_string())),
        }
    }
}

pub struct FfmpegScaler {
    context: ScalingContext,
    output: VideoFrame,
    width: u32,
    height: u32,
}

impl FrameScaler for FfmpegScaler {
    type Frame = VideoFrame;

    fn scale(&mut self, frame: &VideoFrame, dest: &mut [u8]) -> Result<(), ConvertError> {
        self.context
            .run(frame, &mut self.output)
            .map_err(|e| ConvertError::Backend(e.to_string()))?;

        let width_bytes = self.width as usize * 4;
        let expected = width_bytes * self.height as usize;
        if dest.len() != expected {
            return Err(ConvertError::DestinationMismatch {
                expected,
                actual: dest.len(),
            });
        }

        // Remove row padding
        let stride = self.output.stride(0);
        let src = self.output.data(0);
        if stride == width_bytes {
            dest.copy_from_slice(&src[..expected]);
        } else {
            for (y, row) in dest.chunks_exact_mut(width_bytes).enumerate() {
                let start = y * stride;
                row.copy_from_slice(&src[start..start + width_bytes]);
            }
        }

        Ok(())
    }
}
