//! Conversion of decoded frames to the fixed RGBA output format.

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, info, trace, warn};

use crate::codec::{CodecBackend, FrameFormat, FrameScaler, NativeFrame};
use crate::error::{panic_message, ConvertError};
use crate::pool::{PixelBuffer, BYTES_PER_PIXEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScalerKey<F> {
    format: F,
    width: u32,
    height: u32,
}

/// Owns one scaling context and rebuilds it whenever the decoded format or
/// resolution changes.
///
/// Only the rebuild takes the shared init lock; the conversion itself reads
/// the decoded frame and writes the caller's private buffer.
pub struct ColorConverter<B: CodecBackend> {
    backend: Arc<B>,
    init_lock: Arc<Mutex<()>>,
    active: Option<(ScalerKey<FrameFormat<B>>, B::Scaler)>,
    failed: Option<ScalerKey<FrameFormat<B>>>,
    rebuilds: u64,
}

impl<B: CodecBackend> ColorConverter<B> {
    pub fn new(backend: Arc<B>, init_lock: Arc<Mutex<()>>) -> Self {
        Self {
            backend,
            init_lock,
            active: None,
            failed: None,
            rebuilds: 0,
        }
    }

    /// Convert `frame` into `dest`, which must match the frame's size.
    ///
    /// An unsupported source format is logged once per format/resolution;
    /// later frames with the same key fail quietly.
    pub fn convert(&mut self, frame: &B::Frame, dest: &mut PixelBuffer) -> Result<(), ConvertError> {
        let key = Self::key_for(frame);

        if dest.dims() != (key.width, key.height) {
            return Err(ConvertError::DestinationMismatch {
                expected: key.width as usize * key.height as usize * BYTES_PER_PIXEL,
                actual: dest.pixels().len(),
            });
        }

        let needs_rebuild = !matches!(&self.active, Some((active, _)) if *active == key);
        if needs_rebuild {
            self.rebuild(key)?;
        }

        let Some((_, scaler)) = self.active.as_mut() else {
            return Err(ConvertError::Backend("no scaler available".into()));
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| scaler.scale(frame, dest.pixels_mut())));
        match result {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("CRITICAL: fault in scaler: {}", message);
                // The context may be half-written; start over on the next frame.
                self.active = None;
                Err(ConvertError::Fault(message))
            }
        }
    }

    /// Whether a scaler for this frame's format and size already failed to
    /// build, so converting it would fail without trying.
    pub fn is_known_unsupported(&self, frame: &B::Frame) -> bool {
        self.failed == Some(Self::key_for(frame))
    }

    fn key_for(frame: &B::Frame) -> ScalerKey<FrameFormat<B>> {
        ScalerKey {
            format: frame.format(),
            width: frame.width(),
            height: frame.height(),
        }
    }

    fn rebuild(&mut self, key: ScalerKey<FrameFormat<B>>) -> Result<(), ConvertError> {
        if self.failed == Some(key) {
            trace!(format = ?key.format, "Skipping frame in unsupported format");
            return Err(ConvertError::ConversionUnsupported {
                format: format!("{:?}", key.format),
                width: key.width,
                height: key.height,
            });
        }

        self.active = None;

        let created = {
            let _guard = self.init_lock.lock();
            let backend = &self.backend;
            panic::catch_unwind(AssertUnwindSafe(|| {
                backend.create_scaler(key.format, key.width, key.height)
            }))
        };

        match created {
            Ok(Ok(scaler)) => {
                self.rebuilds += 1;
                self.failed = None;
                info!(
                    format = ?key.format,
                    width = key.width,
                    height = key.height,
                    "Scaler (re)built"
                );
                self.active = Some((key, scaler));
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("{}", e);
                self.failed = Some(key);
                Err(e)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("CRITICAL: fault creating scaler: {}", message);
                self.failed = Some(key);
                Err(ConvertError::Fault(message))
            }
        }
    }

    /// How many times a scaling context has been built.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}
