//! Diagnostic counters shared by the sessions of one manager.
//!
//! These are observability only: nothing in the engine branches on them.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct EngineMetrics {
    active_sessions: AtomicI64,
    active_buffers: AtomicI64,
    total_pixels_allocated: AtomicI64,
    buffer_allocations: AtomicU64,
    frames_decoded: AtomicU64,
    frames_published: AtomicU64,
    decode_faults: AtomicU64,
    overflow_resets: AtomicU64,
    threads_reaped: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: i64,
    pub active_buffers: i64,
    pub total_pixels_allocated: i64,
    /// Pixel buffers ever allocated, including ones since released.
    pub buffer_allocations: u64,
    pub frames_decoded: u64,
    pub frames_published: u64,
    pub decode_faults: u64,
    pub overflow_resets: u64,
    pub threads_reaped: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) -> i64 {
        self.active_sessions.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn session_closed(&self) -> i64 {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn buffer_allocated(&self, pixels: i64) {
        self.active_buffers.fetch_add(1, Ordering::Relaxed);
        self.total_pixels_allocated.fetch_add(pixels, Ordering::Relaxed);
        self.buffer_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffer_released(&self, pixels: i64) {
        self.active_buffers.fetch_sub(1, Ordering::Relaxed);
        self.total_pixels_allocated.fetch_sub(pixels, Ordering::Relaxed);
    }

    pub fn frame_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_published(&self) {
        self.frames_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_fault(&self) {
        self.decode_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn overflow_reset(&self) {
        self.overflow_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn thread_reaped(&self) {
        self.threads_reaped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            active_buffers: self.active_buffers.load(Ordering::Relaxed),
            total_pixels_allocated: self.total_pixels_allocated.load(Ordering::Relaxed),
            buffer_allocations: self.buffer_allocations.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            decode_faults: self.decode_faults.load(Ordering::Relaxed),
            overflow_resets: self.overflow_resets.load(Ordering::Relaxed),
            threads_reaped: self.threads_reaped.load(Ordering::Relaxed),
        }
    }
}

/// State injected into every session created by one manager: the metrics
/// sink and the lock serializing decoder/scaler context creation.
#[derive(Debug, Clone, Default)]
pub struct EngineContext {
    pub metrics: Arc<EngineMetrics>,
    pub init_lock: Arc<Mutex<()>>,
}

impl EngineContext {
    pub fn new() -> Self {
        Self::default()
    }
}
