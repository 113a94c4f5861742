//! Decode engine: config-packet merging plus a fault barrier around every
//! call into the native decoder.
//!
//! A fault in a single decode call is logged as CRITICAL and treated as "no
//! frames for this packet"; the session keeps going. The barrier catches
//! unwinding panics from the backend binding. It cannot catch a hard memory
//! fault, which is why the backend is kept behind its own trait.

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use crate::codec::{CodecBackend, SendStatus, VideoDecoder};
use crate::config::CodecKind;
use crate::error::{panic_message, DecodeError};
use crate::framer::CodedPacket;
use crate::metrics::EngineMetrics;

/// What happened to a submitted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Parameter sets held until the next non-config packet.
    Cached,
    /// Handed to the decoder; `bytes` includes any merged config prefix.
    Submitted { bytes: usize },
    /// Decoder input full; the packet was dropped.
    WouldBlock,
    /// Decoder rejected the packet; the packet was dropped.
    Rejected,
    /// The decode call faulted; the packet was dropped.
    Faulted,
    Closed,
}

pub struct DecodeEngine<D: VideoDecoder> {
    decoder: Option<D>,
    codec: CodecKind,
    config_cache: Option<Vec<u8>>,
    metrics: Arc<EngineMetrics>,
}

impl<D: VideoDecoder> DecodeEngine<D> {
    /// Open a decoder from `backend`. Opening is serialized across sessions
    /// by `init_lock`.
    pub fn open<B>(
        backend: &B,
        codec: CodecKind,
        init_lock: &Mutex<()>,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Self, DecodeError>
    where
        B: CodecBackend<Decoder = D>,
    {
        let opened = {
            let _guard = init_lock.lock();
            panic::catch_unwind(AssertUnwindSafe(|| backend.open_decoder(codec)))
        };

        let decoder = match opened {
            Ok(result) => result?,
            Err(payload) => {
                return Err(DecodeError::OpenFailed {
                    codec,
                    reason: format!("fault during open: {}", panic_message(payload.as_ref())),
                })
            }
        };

        debug!(codec = ?codec, backend = backend.name(), "Decoder opened");

        Ok(Self::from_decoder(decoder, codec, metrics))
    }

    /// Wrap an already opened decoder.
    pub fn from_decoder(decoder: D, codec: CodecKind, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            decoder: Some(decoder),
            codec,
            config_cache: None,
            metrics,
        }
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    pub fn is_open(&self) -> bool {
        self.decoder.is_some()
    }

    /// Whether parameter sets are waiting for the next frame packet.
    pub fn has_pending_config(&self) -> bool {
        self.config_cache.is_some()
    }

    /// Feed one packet. Config packets are cached and prepended to the next
    /// non-config packet; they never reach the decoder alone.
    pub fn submit(&mut self, packet: CodedPacket) -> SubmitOutcome {
        let Some(decoder) = self.decoder.as_mut() else {
            return SubmitOutcome::Closed;
        };

        if packet.is_config {
            trace!(bytes = packet.payload.len(), "Caching config packet");
            self.config_cache = Some(packet.payload);
            return SubmitOutcome::Cached;
        }

        let data = match self.config_cache.take() {
            Some(mut merged) => {
                merged.extend_from_slice(&packet.payload);
                merged
            }
            None => packet.payload,
        };
        let pts = (packet.pts & i64::MAX as u64) as i64;

        let result = panic::catch_unwind(AssertUnwindSafe(|| decoder.send_packet(&data, pts)));
        match result {
            Ok(Ok(SendStatus::Accepted)) => SubmitOutcome::Submitted { bytes: data.len() },
            Ok(Ok(SendStatus::WouldBlock)) => {
                trace!(pts, "Decoder input full, dropping packet");
                SubmitOutcome::WouldBlock
            }
            Ok(Err(e)) => {
                warn!(pts, bytes = data.len(), "send_packet error: {}", e);
                SubmitOutcome::Rejected
            }
            Err(payload) => {
                error!(
                    pts,
                    bytes = data.len(),
                    "CRITICAL: fault in decoder send_packet: {}",
                    panic_message(payload.as_ref())
                );
                self.metrics.decode_fault();
                SubmitOutcome::Faulted
            }
        }
    }

    /// Frames produced by the previous submissions. Stops at the first
    /// "need more input", error or fault.
    pub fn drain(&mut self) -> Drain<'_, D> {
        Drain {
            engine: self,
            done: false,
        }
    }

    fn receive_one(&mut self) -> Option<D::Frame> {
        let decoder = self.decoder.as_mut()?;

        match panic::catch_unwind(AssertUnwindSafe(|| decoder.receive_frame())) {
            Ok(Ok(Some(frame))) => {
                self.metrics.frame_decoded();
                Some(frame)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!("receive_frame error: {}", e);
                None
            }
            Err(payload) => {
                error!(
                    "CRITICAL: fault in decoder receive_frame: {}",
                    panic_message(payload.as_ref())
                );
                self.metrics.decode_fault();
                None
            }
        }
    }

    /// Release the decoder. Calling it again is a no-op.
    pub fn close(&mut self) {
        self.config_cache = None;
        if let Some(decoder) = self.decoder.take() {
            if panic::catch_unwind(AssertUnwindSafe(move || drop(decoder))).is_err() {
                error!("CRITICAL: fault while releasing decoder");
            }
            debug!(codec = ?self.codec, "Decoder closed");
        }
    }
}

impl<D: VideoDecoder> Drop for DecodeEngine<D> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Iterator returned by [`DecodeEngine::drain`].
pub struct Drain<'a, D: VideoDecoder> {
    engine: &'a mut DecodeEngine<D>,
    done: bool,
}

impl<D: VideoDecoder> Iterator for Drain<'_, D> {
    type Item = D::Frame;

    fn next(&mut self) -> Option<D::Frame> {
        if self.done {
            return None;
        }
        let frame = self.engine.receive_one();
        self.done = frame.is_none();
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{
        dim_payload, SyntheticBackend, SyntheticDecoder, FAULT_MARKER, WOULD_BLOCK_MARKER,
    };

    fn open(backend: &SyntheticBackend) -> (DecodeEngine<SyntheticDecoder>, Arc<EngineMetrics>) {
        let metrics = Arc::new(EngineMetrics::new());
        let engine = DecodeEngine::open(
            backend,
            CodecKind::Hevc,
            &Mutex::new(()),
            Arc::clone(&metrics),
        )
        .unwrap();
        (engine, metrics)
    }

    fn packet(is_config: bool, payload: &[u8]) -> CodedPacket {
        CodedPacket {
            pts: 0,
            is_config,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_config_is_merged_into_next_packet() {
        let backend = SyntheticBackend::new(4, 4);
        let (mut engine, _) = open(&backend);

        assert_eq!(engine.submit(packet(true, &[1, 2, 3, 4, 5])), SubmitOutcome::Cached);
        assert!(backend.submissions().is_empty());
        assert!(engine.has_pending_config());

        let outcome = engine.submit(packet(false, &[6, 7, 8, 9, 10, 11, 12, 13]));
        assert_eq!(outcome, SubmitOutcome::Submitted { bytes: 13 });
        assert_eq!(
            backend.submissions(),
            vec![vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13]]
        );
        assert!(!engine.has_pending_config());
    }

    #[test]
    fn test_plain_packet_is_submitted_alone() {
        let backend = SyntheticBackend::new(4, 4);
        let (mut engine, _) = open(&backend);

        engine.submit(packet(false, &[9, 9]));
        engine.submit(packet(false, &[8]));
        assert_eq!(backend.submissions(), vec![vec![9, 9], vec![8]]);
    }

    #[test]
    fn test_newer_config_replaces_pending_one() {
        let backend = SyntheticBackend::new(4, 4);
        let (mut engine, _) = open(&backend);

        engine.submit(packet(true, &[1]));
        engine.submit(packet(true, &[2]));
        engine.submit(packet(false, &[3]));
        assert_eq!(backend.submissions(), vec![vec![2, 3]]);
    }

    #[test]
    fn test_drain_yields_decoded_frames() {
        let backend = SyntheticBackend::new(4, 4);
        let (mut engine, metrics) = open(&backend);

        engine.submit(packet(true, &dim_payload(8, 6)));
        engine.submit(packet(false, &[1]));
        let frames: Vec<_> = engine.drain().collect();

        assert_eq!(frames.len(), 1);
        assert_eq!((frames[0].width, frames[0].height), (8, 6));
        assert_eq!(engine.drain().count(), 0);
        assert_eq!(metrics.snapshot().frames_decoded, 1);
    }

    #[test]
    fn test_fault_is_isolated_to_one_packet() {
        let backend = SyntheticBackend::new(4, 4);
        let (mut engine, metrics) = open(&backend);

        assert_eq!(engine.submit(packet(false, FAULT_MARKER)), SubmitOutcome::Faulted);
        assert_eq!(engine.drain().count(), 0);
        assert_eq!(metrics.snapshot().decode_faults, 1);

        assert_eq!(
            engine.submit(packet(false, &[1, 2])),
            SubmitOutcome::Submitted { bytes: 2 }
        );
        assert_eq!(engine.drain().count(), 1);
    }

    #[test]
    fn test_rejected_and_busy_packets_are_dropped() {
        let backend = SyntheticBackend::new(4, 4);
        let (mut engine, metrics) = open(&backend);

        assert_eq!(engine.submit(packet(false, &dim_payload(0, 0))), SubmitOutcome::Rejected);
        assert_eq!(engine.submit(packet(false, WOULD_BLOCK_MARKER)), SubmitOutcome::WouldBlock);
        assert_eq!(engine.drain().count(), 0);
        assert_eq!(metrics.snapshot().decode_faults, 0);

        assert_eq!(
            engine.submit(packet(false, &[4])),
            SubmitOutcome::Submitted { bytes: 1 }
        );
        assert_eq!(engine.drain().count(), 1);
        assert!(engine.is_open());
    }

    #[test]
    fn test_unsupported_codec_fails_open() {
        let backend = SyntheticBackend::with_codecs(4, 4, vec![CodecKind::H264]);
        let result = DecodeEngine::open(
            &backend,
            CodecKind::Hevc,
            &Mutex::new(()),
            Arc::new(EngineMetrics::new()),
        );
        assert!(matches!(result, Err(DecodeError::UnsupportedCodec(CodecKind::Hevc))));
    }

    #[test]
    fn test_double_close_is_noop() {
        let backend = SyntheticBackend::new(4, 4);
        let (mut engine, _) = open(&backend);

        engine.close();
        engine.close();
        assert!(!engine.is_open());
        assert_eq!(backend.decoders_closed(), 1);
        assert_eq!(engine.submit(packet(false, &[1])), SubmitOutcome::Closed);

        drop(engine);
        assert_eq!(backend.decoders_closed(), 1);
    }
}
