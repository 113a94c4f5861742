//! Triple-buffer frame handoff between the decode thread and the renderer.
//!
//! ```text
//!   decode thread                          render-pull caller
//!   acquire() ──► convert (unlocked) ──► publish()      pull()
//!                                           │             │
//!                      ┌────────────────────▼─────────────▼──┐
//!                      │ front │ previous_front │ recycle pool│  (short lock)
//!                      └─────────────────────────────────────┘
//! ```
//!
//! The mutex only guards pointer swaps. Pixel bytes are written while the
//! buffer is privately owned by the decode thread and read through a counted
//! [`FrameView`], so neither side blocks on the other's pixel work.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::metrics::EngineMetrics;
use crate::pool::{FrameBufferPool, PixelBuffer};

struct Slots {
    front: Option<Arc<PixelBuffer>>,
    previous_front: Option<Arc<PixelBuffer>>,
    pool: FrameBufferPool,
    alive: bool,
}

pub struct FrameHandoff {
    slots: Mutex<Slots>,
    metrics: Arc<EngineMetrics>,
}

impl FrameHandoff {
    pub fn new(recycle_capacity: usize, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            slots: Mutex::new(Slots {
                front: None,
                previous_front: None,
                pool: FrameBufferPool::new(recycle_capacity),
                alive: true,
            }),
            metrics,
        }
    }

    /// Get a private buffer for the next frame, reusing a pooled one when
    /// nobody else still references it.
    pub fn acquire(&self, width: u32, height: u32) -> PixelBuffer {
        let reused = self.slots.lock().pool.take(width, height);
        reused.unwrap_or_else(|| PixelBuffer::new(width, height, &self.metrics))
    }

    /// Return a buffer that was acquired but never published, e.g. after a
    /// failed conversion. Dropped instead once the handoff is closed.
    pub fn release(&self, buffer: PixelBuffer) {
        let mut slots = self.slots.lock();
        if slots.alive {
            slots.pool.recycle(Arc::new(buffer));
        }
    }

    /// Make a fully converted buffer the new front.
    ///
    /// Returns `false` (and drops the buffer) once the handoff is closed.
    pub fn publish(&self, buffer: PixelBuffer) -> bool {
        let buffer = Arc::new(buffer);
        let mut slots = self.slots.lock();
        if !slots.alive {
            return false;
        }

        if let Some(previous) = slots.previous_front.take() {
            slots.pool.recycle(previous);
        }
        slots.previous_front = slots.front.replace(buffer);
        drop(slots);

        self.metrics.frame_published();
        true
    }

    /// Latest published frame, or `None` before the first publish and after
    /// close.
    pub fn pull(&self) -> Option<FrameView> {
        let slots = self.slots.lock();
        if !slots.alive {
            return None;
        }
        slots.front.as_ref().map(|front| FrameView {
            buffer: Arc::clone(front),
        })
    }

    /// Permanently stop handing out frames and release the slots. Views that
    /// a renderer still holds stay valid until it drops them.
    pub fn close(&self) {
        let mut slots = self.slots.lock();
        slots.alive = false;
        slots.front = None;
        slots.previous_front = None;
        slots.pool.clear();
    }

    pub fn is_alive(&self) -> bool {
        self.slots.lock().alive
    }

    pub fn front_dims(&self) -> Option<(u32, u32)> {
        self.slots.lock().front.as_ref().map(|front| front.dims())
    }

    pub fn pooled_len(&self) -> usize {
        self.slots.lock().pool.len()
    }
}

impl fmt::Debug for FrameHandoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("FrameHandoff")
            .field("alive", &slots.alive)
            .field("front", &slots.front.as_ref().map(|b| b.dims()))
            .field("pooled", &slots.pool.len())
            .finish()
    }
}

/// Read-only view of a published frame.
///
/// Holding a view keeps the buffer out of the recycle pool; drop it once the
/// pixels have been copied.
#[derive(Clone)]
pub struct FrameView {
    buffer: Arc<PixelBuffer>,
}

impl FrameView {
    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    pub fn pixels(&self) -> &[u8] {
        self.buffer.pixels()
    }

    /// Copy the frame into a caller-owned buffer, resizing it as needed.
    pub fn copy_to(&self, dest: &mut Vec<u8>) {
        dest.clear();
        dest.extend_from_slice(self.buffer.pixels());
    }

    /// Whether both views refer to the same published buffer.
    pub fn same_buffer(&self, other: &FrameView) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }
}

impl fmt::Debug for FrameView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameView")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}
