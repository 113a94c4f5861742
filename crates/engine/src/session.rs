//! One streaming session: a dedicated thread running
//! connect → open decoder → read → frame → decode → convert → publish,
//! plus the teardown protocol that lets `stop()` return without waiting for
//! that thread.
//!
//! ```text
//!   caller thread                session thread              render driver
//!   ─────────────                ──────────────              ─────────────
//!   start() ──spawn──────────►  connect + open decoder
//!           ◄──ready(Result)──  read ─► framer ─► decode
//!                                 ─► convert ─► publish ──►  pull() / notify
//!   stop():
//!     1. flags off  ───────────►  loop observes "stopped"    pull() → None
//!     2. shutdown socket ──────►  blocking read returns
//!     3. close handoff
//!     4. unregister surface
//!     5. handle → reaper          thread exits, reaper joins it
//!     6. drop our Arc             state freed with the last Arc
//! ```

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, info_span, trace, warn};

use crate::codec::{CodecBackend, NativeFrame};
use crate::config::EngineConfig;
use crate::convert::ColorConverter;
use crate::decode::{DecodeEngine, SubmitOutcome};
use crate::error::{ConvertError, EngineError, FramingError};
use crate::framer::{FeedOutcome, WireFramer};
use crate::handoff::{FrameHandoff, FrameView};
use crate::metrics::{EngineContext, EngineMetrics};
use crate::reaper::ThreadReaper;
use crate::surface::{FrameSource, RenderSurface, SurfaceId};
use crate::transport::{self, StreamAddress};

/// Engine-assigned session handle, unique for the lifetime of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    Connecting,
    Decoding,
    Stopping,
    Terminated,
}

/// Why the session loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Stopped,
    PeerClosed,
    TransportError,
    StreamCorrupt,
    ConnectFailed,
    DecoderOpenFailed,
}

/// State shared by the session owner, its thread and the render-pull path.
pub(crate) struct SessionState {
    id: SessionId,
    alive: AtomicBool,
    decoding: AtomicBool,
    transport: Mutex<Option<TcpStream>>,
    handoff: FrameHandoff,
    phase: Mutex<SessionPhase>,
    end_reason: Mutex<Option<EndReason>>,
    metrics: Arc<EngineMetrics>,
}

impl SessionState {
    fn new(id: SessionId, recycle_capacity: usize, metrics: Arc<EngineMetrics>) -> Self {
        let active = metrics.session_opened();
        debug!(session = %id, active, "Session state created");
        Self {
            id,
            alive: AtomicBool::new(true),
            decoding: AtomicBool::new(true),
            transport: Mutex::new(None),
            handoff: FrameHandoff::new(recycle_capacity, Arc::clone(&metrics)),
            phase: Mutex::new(SessionPhase::Created),
            end_reason: Mutex::new(None),
            metrics,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn is_decoding(&self) -> bool {
        self.decoding.load(Ordering::SeqCst)
    }

    pub(crate) fn handoff(&self) -> &FrameHandoff {
        &self.handoff
    }

    fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, next: SessionPhase) {
        let mut phase = self.phase.lock();
        if *phase != SessionPhase::Terminated {
            trace!(session = %self.id, from = ?*phase, to = ?next, "Phase change");
            *phase = next;
        }
    }

    /// Record the first reason the loop ended; later reports are ignored.
    fn finish(&self, reason: EndReason) {
        let mut slot = self.end_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    fn end_reason(&self) -> Option<EndReason> {
        *self.end_reason.lock()
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        let active = self.metrics.session_closed();
        debug!(session = %self.id, active, "Session state released");
    }
}

/// Owner handle of a running session. Dropping it runs the teardown.
pub struct Session {
    state: Arc<SessionState>,
    address: StreamAddress,
    surface: Arc<dyn RenderSurface>,
    surface_id: SurfaceId,
    reaper: Arc<ThreadReaper>,
    thread: Option<JoinHandle<()>>,
}

impl Session {
    /// Register with the render surface, spawn the session thread and wait
    /// until it has connected and opened its decoder.
    ///
    /// On failure nothing stays registered and the thread has been joined.
    pub fn start<B: CodecBackend>(
        id: SessionId,
        address: StreamAddress,
        backend: Arc<B>,
        surface: Arc<dyn RenderSurface>,
        context: &EngineContext,
        config: &EngineConfig,
        reaper: Arc<ThreadReaper>,
    ) -> Result<Session, EngineError> {
        let state = Arc::new(SessionState::new(
            id,
            config.recycle_capacity,
            Arc::clone(&context.metrics),
        ));

        let surface_id = surface
            .register(FrameSource::new(id, &state))
            .ok_or(EngineError::RegistrationFailed)?;

        let (ready_tx, ready_rx) = channel::bounded::<Result<(), EngineError>>(1);
        let worker = SessionWorker {
            state: Arc::clone(&state),
            address: address.clone(),
            backend,
            surface: Arc::clone(&surface),
            surface_id,
            context: context.clone(),
            config: config.clone(),
        };

        let spawned = thread::Builder::new()
            .name(format!("vs-session-{}", id))
            .spawn(move || worker.run(ready_tx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                surface.unregister(surface_id);
                return Err(EngineError::Spawn(e));
            }
        };

        let failure = match ready_rx.recv() {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(EngineError::ThreadVanished),
        };

        if let Some(e) = failure {
            state.alive.store(false, Ordering::SeqCst);
            state.handoff.close();
            surface.unregister(surface_id);
            if handle.join().is_err() {
                warn!(session = %id, "Session thread panicked during start");
            }
            return Err(e);
        }

        info!(session = %id, address = %address, surface = %surface_id, "Session started");

        Ok(Session {
            state,
            address,
            surface,
            surface_id,
            reaper,
            thread: Some(handle),
        })
    }

    pub fn id(&self) -> SessionId {
        self.state.id
    }

    pub fn address(&self) -> &StreamAddress {
        &self.address
    }

    pub fn surface_id(&self) -> SurfaceId {
        self.surface_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.state.end_reason()
    }

    /// Latest published frame. `None` before the first frame and once
    /// teardown has begun.
    pub fn pull(&self) -> Option<FrameView> {
        if !self.state.is_alive() {
            return None;
        }
        self.state.handoff.pull()
    }

    /// A pull handle that does not keep the session alive.
    pub fn frame_source(&self) -> FrameSource {
        FrameSource::new(self.state.id, &self.state)
    }

    /// Tear the session down without joining its thread. Idempotent.
    pub fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        let id = self.state.id;
        info!(session = %id, "Stopping session");

        self.state.decoding.store(false, Ordering::SeqCst);
        self.state.alive.store(false, Ordering::SeqCst);
        self.state.set_phase(SessionPhase::Stopping);

        if let Some(stream) = self.state.transport.lock().take() {
            transport::force_close(&stream);
        }

        self.state.handoff.close();

        self.surface.unregister(self.surface_id);

        self.reaper.submit(handle);

        debug!(session = %id, "Session teardown handed off");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.state.id)
            .field("address", &self.address)
            .field("surface", &self.surface_id)
            .field("phase", &self.state.phase())
            .finish()
    }
}

/// Everything the session thread owns or shares.
struct SessionWorker<B: CodecBackend> {
    state: Arc<SessionState>,
    address: StreamAddress,
    backend: Arc<B>,
    surface: Arc<dyn RenderSurface>,
    surface_id: SurfaceId,
    context: EngineContext,
    config: EngineConfig,
}

impl<B: CodecBackend> SessionWorker<B> {
    fn run(self, ready: Sender<Result<(), EngineError>>) {
        let span = info_span!("session", id = %self.state.id);
        let _enter = span.enter();

        info!(address = %self.address, "Session thread started");
        self.state.set_phase(SessionPhase::Connecting);

        let mut stream = match self.address.connect(&self.config) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Connect to {} failed: {}", self.address, e);
                self.fail(EndReason::ConnectFailed);
                let _ = ready.send(Err(EngineError::ConnectFailed {
                    address: self.address.to_string(),
                    source: e,
                }));
                return;
            }
        };

        match stream.try_clone() {
            Ok(clone) => *self.state.transport.lock() = Some(clone),
            Err(e) => warn!("Could not keep a shutdown handle for the transport: {}", e),
        }

        let opened = DecodeEngine::open(
            &*self.backend,
            self.config.codec,
            &self.context.init_lock,
            Arc::clone(&self.context.metrics),
        );
        let mut decoder = match opened {
            Ok(decoder) => decoder,
            Err(e) => {
                error!("Decoder open failed: {}", e);
                self.state.transport.lock().take();
                self.fail(EndReason::DecoderOpenFailed);
                let _ = ready.send(Err(EngineError::Decoder(e)));
                return;
            }
        };

        self.state.set_phase(SessionPhase::Decoding);
        if ready.send(Ok(())).is_err() {
            warn!("Starter went away before the session was ready");
        }

        let mut converter = ColorConverter::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.context.init_lock),
        );
        let reason = self.ingest(&mut stream, &mut decoder, &mut converter);

        self.state.set_phase(SessionPhase::Stopping);
        self.state.finish(reason);
        self.state.decoding.store(false, Ordering::SeqCst);
        self.state.transport.lock().take();
        drop(stream);
        decoder.close();
        drop(converter);

        self.state.set_phase(SessionPhase::Terminated);
        info!(reason = ?reason, "Session thread exiting");
    }

    fn fail(&self, reason: EndReason) {
        self.state.finish(reason);
        self.state.decoding.store(false, Ordering::SeqCst);
        self.state.set_phase(SessionPhase::Terminated);
    }

    /// Read loop. Returns once the session is stopped or the stream ends.
    fn ingest(
        &self,
        stream: &mut TcpStream,
        decoder: &mut DecodeEngine<B::Decoder>,
        converter: &mut ColorConverter<B>,
    ) -> EndReason {
        let mut framer = WireFramer::new(self.config.max_payload_bytes, self.config.max_buffered_bytes);
        let mut chunk = vec![0u8; self.config.read_chunk_bytes];

        loop {
            if !self.state.is_decoding() {
                return EndReason::Stopped;
            }

            let read = match stream.read(&mut chunk) {
                Ok(0) if self.state.is_decoding() => {
                    info!("Peer closed the stream");
                    return EndReason::PeerClosed;
                }
                Ok(0) => return EndReason::Stopped,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) if !self.state.is_decoding() => return EndReason::Stopped,
                Err(e) => {
                    warn!("Transport read failed: {}", e);
                    return EndReason::TransportError;
                }
            };

            if let FeedOutcome::Overflowed { discarded } = framer.feed(&chunk[..read]) {
                debug!(discarded, "Framer reset after overflow");
                self.context.metrics.overflow_reset();
            }

            if let Err(e) = self.process_packets(&mut framer, decoder, converter) {
                error!("Stream corrupt, ending session: {}", e);
                return EndReason::StreamCorrupt;
            }
        }
    }

    fn process_packets(
        &self,
        framer: &mut WireFramer,
        decoder: &mut DecodeEngine<B::Decoder>,
        converter: &mut ColorConverter<B>,
    ) -> Result<(), FramingError> {
        while let Some(packet) = framer.next_packet()? {
            if !self.state.is_decoding() {
                return Ok(());
            }
            trace!(
                pts = packet.pts,
                config = packet.is_config,
                bytes = packet.payload.len(),
                "Packet"
            );

            // A dropped packet can still leave earlier frames to drain.
            if matches!(
                decoder.submit(packet),
                SubmitOutcome::Cached | SubmitOutcome::Closed
            ) {
                continue;
            }

            for frame in decoder.drain() {
                self.present(&frame, converter);
            }
        }
        Ok(())
    }

    /// Convert one decoded frame into a private buffer and publish it.
    fn present(&self, frame: &B::Frame, converter: &mut ColorConverter<B>) {
        let (width, height) = (frame.width(), frame.height());
        if width == 0 || height == 0 {
            trace!("Skipping frame with empty dimensions");
            return;
        }

        if converter.is_known_unsupported(frame) {
            return;
        }

        let mut buffer = self.state.handoff.acquire(width, height);
        if let Err(e) = converter.convert(frame, &mut buffer) {
            // Unsupported formats were already reported by the converter.
            if !matches!(e, ConvertError::ConversionUnsupported { .. }) {
                warn!(width, height, "Frame conversion failed: {}", e);
            }
            self.state.handoff.release(buffer);
            return;
        }

        if self.state.handoff.publish(buffer) {
            self.surface.notify_frame_available(self.surface_id);
        }
    }
}
