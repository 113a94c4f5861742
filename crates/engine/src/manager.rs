//! Session manager: the id → session map and the start/stop command surface.
//!
//! Map mutations are serialized by one lock. Teardown of a removed session
//! runs after that lock is released, so a slow stop never stalls `start`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::codec::CodecBackend;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::handoff::FrameView;
use crate::metrics::{EngineContext, MetricsSnapshot};
use crate::reaper::ThreadReaper;
use crate::session::{EndReason, Session, SessionId, SessionPhase};
use crate::surface::{FrameSource, RenderSurface, SurfaceId};
use crate::transport::StreamAddress;

pub struct SessionManager<B: CodecBackend> {
    backend: Arc<B>,
    surface: Arc<dyn RenderSurface>,
    config: EngineConfig,
    context: EngineContext,
    reaper: Arc<ThreadReaper>,
    sessions: Mutex<HashMap<SessionId, Session>>,
    next_id: AtomicU64,
}

impl<B: CodecBackend> SessionManager<B> {
    pub fn new(
        backend: Arc<B>,
        surface: Arc<dyn RenderSurface>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        Self::with_context(backend, surface, config, EngineContext::new())
    }

    /// Build a manager that reports into an existing context.
    pub fn with_context(
        backend: Arc<B>,
        surface: Arc<dyn RenderSurface>,
        config: EngineConfig,
        context: EngineContext,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let reaper = ThreadReaper::new(config.reaper_queue_capacity, Arc::clone(&context.metrics))?;

        info!(
            backend = backend.name(),
            codec = ?config.codec,
            "Session manager ready"
        );

        Ok(Self {
            backend,
            surface,
            config,
            context,
            reaper: Arc::new(reaper),
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Start a session streaming from `address` (`tcp://host:port`).
    ///
    /// Returns once the session is connected and its decoder is open.
    pub fn start(&self, address: &str) -> Result<SessionId, EngineError> {
        let address = StreamAddress::parse(address)?;
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let session = Session::start(
            id,
            address,
            Arc::clone(&self.backend),
            Arc::clone(&self.surface),
            &self.context,
            &self.config,
            Arc::clone(&self.reaper),
        )?;

        let active = {
            let mut sessions = self.sessions.lock();
            sessions.insert(id, session);
            sessions.len()
        };
        debug!(session = %id, active, "Session registered");
        Ok(id)
    }

    /// Stop one session. Unknown ids are ignored.
    pub fn stop(&self, id: SessionId) {
        let removed = self.sessions.lock().remove(&id);
        match removed {
            Some(mut session) => session.stop(),
            None => debug!(session = %id, "Stop for unknown session ignored"),
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<Session> = {
            let mut sessions = self.sessions.lock();
            sessions.drain().map(|(_, session)| session).collect()
        };
        if !drained.is_empty() {
            info!(count = drained.len(), "Stopping all sessions");
        }
        for mut session in drained {
            session.stop();
        }
    }

    /// Stop every session and wait until all session threads are joined.
    pub fn shutdown(&self) {
        self.stop_all();
        self.reaper.shutdown();
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn phase(&self, id: SessionId) -> Option<SessionPhase> {
        self.sessions.lock().get(&id).map(Session::phase)
    }

    pub fn end_reason(&self, id: SessionId) -> Option<EndReason> {
        self.sessions.lock().get(&id).and_then(Session::end_reason)
    }

    pub fn surface_id(&self, id: SessionId) -> Option<SurfaceId> {
        self.sessions.lock().get(&id).map(Session::surface_id)
    }

    /// Latest frame of a session. The map lock is not held during the pull.
    pub fn pull(&self, id: SessionId) -> Option<FrameView> {
        let source: Option<FrameSource> = self.sessions.lock().get(&id).map(Session::frame_source);
        source?.pull()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.context.metrics.snapshot()
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl<B: CodecBackend> Drop for SessionManager<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
