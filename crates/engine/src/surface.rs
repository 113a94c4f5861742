//! Boundary to the host's render surface.
//!
//! The host registers one pull source per session and gets told after every
//! publish that a new frame is available. Pulls may arrive from any thread at
//! any time, including while the session is being torn down.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use crate::handoff::FrameView;
use crate::session::{SessionId, SessionState};

/// Host-assigned identifier of a registered frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface-{}", self.0)
    }
}

/// Pull handle given to the render surface.
///
/// It does not keep the session alive: once the session is gone, or has begun
/// tearing down, `pull` returns `None`.
#[derive(Clone)]
pub struct FrameSource {
    session: SessionId,
    state: Weak<SessionState>,
}

impl FrameSource {
    pub(crate) fn new(session: SessionId, state: &Arc<SessionState>) -> Self {
        Self {
            session,
            state: Arc::downgrade(state),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Latest published frame, if the session is still alive and has one.
    pub fn pull(&self) -> Option<FrameView> {
        let state = self.state.upgrade()?;
        if !state.is_alive() {
            return None;
        }
        state.handoff().pull()
    }
}

impl fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSource")
            .field("session", &self.session)
            .field("attached", &(self.state.strong_count() > 0))
            .finish()
    }
}

/// What the engine needs from the host renderer.
pub trait RenderSurface: Send + Sync {
    /// Register a pull source. `None` means the host refused.
    fn register(&self, source: FrameSource) -> Option<SurfaceId>;

    fn unregister(&self, id: SurfaceId);

    /// Called after every successful publish. Implementations must ignore
    /// ids that were already unregistered.
    fn notify_frame_available(&self, id: SurfaceId);
}

struct Registration {
    source: FrameSource,
    notifications: u64,
}

/// In-process render surface with no window behind it.
#[derive(Default)]
pub struct HeadlessSurface {
    entries: Mutex<HashMap<SurfaceId, Registration>>,
    next_id: AtomicU64,
    refuse: AtomicBool,
    stale_notifications: AtomicU64,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `register` calls fail (or succeed again).
    pub fn set_refuse_registration(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn registered(&self) -> Vec<SurfaceId> {
        let mut ids: Vec<_> = self.entries.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_registered(&self, id: SurfaceId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn source(&self, id: SurfaceId) -> Option<FrameSource> {
        self.entries.lock().get(&id).map(|entry| entry.source.clone())
    }

    /// Frame-available signals received for `id` so far.
    pub fn notifications(&self, id: SurfaceId) -> Option<u64> {
        self.entries.lock().get(&id).map(|entry| entry.notifications)
    }

    /// Signals that arrived for ids no longer registered.
    pub fn stale_notifications(&self) -> u64 {
        self.stale_notifications.load(Ordering::Relaxed)
    }

    /// Pull through the registered source. The lock is released before the
    /// pull itself.
    pub fn pull(&self, id: SurfaceId) -> Option<FrameView> {
        let source = self.source(id)?;
        source.pull()
    }
}

impl RenderSurface for HeadlessSurface {
    fn register(&self, source: FrameSource) -> Option<SurfaceId> {
        if self.refuse.load(Ordering::SeqCst) {
            debug!(session = %source.session_id(), "Refusing surface registration");
            return None;
        }
        let id = SurfaceId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.entries.lock().insert(
            id,
            Registration {
                source,
                notifications: 0,
            },
        );
        debug!(surface = %id, "Surface registered");
        Some(id)
    }

    fn unregister(&self, id: SurfaceId) {
        if self.entries.lock().remove(&id).is_some() {
            debug!(surface = %id, "Surface unregistered");
        }
    }

    fn notify_frame_available(&self, id: SurfaceId) {
        match self.entries.lock().get_mut(&id) {
            Some(entry) => entry.notifications += 1,
            None => {
                trace!(surface = %id, "Ignoring notification for unregistered surface");
                self.stale_notifications.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
