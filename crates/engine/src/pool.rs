//! RGBA pixel buffers and the per-session recycle pool.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::metrics::EngineMetrics;

/// Output format is fixed RGBA, 4 bytes per pixel, tightly packed rows.
pub const BYTES_PER_PIXEL: usize = 4;

/// A tightly packed RGBA frame.
///
/// Allocation and release are reported to the owning manager's metrics so
/// buffer growth is visible from outside.
pub struct PixelBuffer {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    metrics: Arc<EngineMetrics>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, metrics: &Arc<EngineMetrics>) -> Self {
        let len = width as usize * height as usize * BYTES_PER_PIXEL;
        metrics.buffer_allocated(width as i64 * height as i64);
        Self {
            pixels: vec![0u8; len],
            width,
            height,
            metrics: Arc::clone(metrics),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dims(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        self.metrics
            .buffer_released(self.width as i64 * self.height as i64);
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Bounded list of previously published buffers waiting to be reused.
///
/// Entries are shared (`Arc`) because a renderer may still be reading one;
/// an entry is only handed back out once its strong count is exactly one.
pub struct FrameBufferPool {
    entries: VecDeque<Arc<PixelBuffer>>,
    capacity: usize,
    dims: Option<(u32, u32)>,
}

impl FrameBufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity + 1),
            capacity,
            dims: None,
        }
    }

    /// Take an unaliased buffer of the given size out of the pool.
    ///
    /// Asking for a different size than last time discards every pooled
    /// buffer, since none of them can be reused any more.
    pub fn take(&mut self, width: u32, height: u32) -> Option<PixelBuffer> {
        if self.dims != Some((width, height)) {
            if !self.entries.is_empty() {
                debug!(
                    old = ?self.dims,
                    new = ?(width, height),
                    discarded = self.entries.len(),
                    "Resolution change, clearing buffer pool"
                );
            }
            self.entries.clear();
            self.dims = Some((width, height));
            return None;
        }

        let index = self
            .entries
            .iter()
            .position(|entry| Arc::strong_count(entry) == 1)?;
        let entry = self.entries.remove(index)?;

        match Arc::try_unwrap(entry) {
            Ok(buffer) => Some(buffer),
            Err(shared) => {
                // Picked up by a reader between the check and the unwrap.
                self.entries.push_back(shared);
                None
            }
        }
    }

    /// Return a buffer that left the front slots. Buffers of a stale size are
    /// dropped; the oldest entry is evicted once capacity is exceeded.
    pub fn recycle(&mut self, buffer: Arc<PixelBuffer>) {
        if self.dims != Some(buffer.dims()) {
            return;
        }

        self.entries.push_back(buffer);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size of the buffers currently accepted by the pool.
    pub fn dims(&self) -> Option<(u32, u32)> {
        self.dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Arc<EngineMetrics> {
        Arc::new(EngineMetrics::new())
    }

    #[test]
    fn test_buffer_size_and_accounting() {
        let metrics = metrics();
        {
            let buffer = PixelBuffer::new(16, 8, &metrics);
            assert_eq!(buffer.pixels().len(), 16 * 8 * 4);
            assert_eq!(buffer.stride(), 64);
            assert_eq!(metrics.snapshot().active_buffers, 1);
            assert_eq!(metrics.snapshot().total_pixels_allocated, 128);
        }
        assert_eq!(metrics.snapshot().active_buffers, 0);
        assert_eq!(metrics.snapshot().total_pixels_allocated, 0);
    }

    #[test]
    fn test_take_skips_aliased_buffers() {
        let metrics = metrics();
        let mut pool = FrameBufferPool::new(5);
        assert!(pool.take(4, 4).is_none());

        let shared = Arc::new(PixelBuffer::new(4, 4, &metrics));
        let reader = Arc::clone(&shared);
        pool.recycle(shared);

        assert!(pool.take(4, 4).is_none());
        assert_eq!(pool.len(), 1);

        drop(reader);
        let buffer = pool.take(4, 4).unwrap();
        assert_eq!(buffer.dims(), (4, 4));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let metrics = metrics();
        let mut pool = FrameBufferPool::new(2);
        pool.take(2, 2);

        for _ in 0..3 {
            pool.recycle(Arc::new(PixelBuffer::new(2, 2, &metrics)));
        }
        assert_eq!(pool.len(), 2);
        assert_eq!(metrics.snapshot().active_buffers, 2);
    }

    #[test]
    fn test_resolution_change_discards_pool() {
        let metrics = metrics();
        let mut pool = FrameBufferPool::new(5);
        pool.take(8, 8);
        pool.recycle(Arc::new(PixelBuffer::new(8, 8, &metrics)));
        pool.recycle(Arc::new(PixelBuffer::new(8, 8, &metrics)));
        assert_eq!(pool.len(), 2);

        assert!(pool.take(16, 16).is_none());
        assert!(pool.is_empty());
        assert_eq!(pool.dims(), Some((16, 16)));
        assert_eq!(metrics.snapshot().active_buffers, 0);
    }

    #[test]
    fn test_stale_size_is_not_recycled() {
        let metrics = metrics();
        let mut pool = FrameBufferPool::new(5);
        pool.take(16, 16);
        pool.recycle(Arc::new(PixelBuffer::new(8, 8, &metrics)));
        assert!(pool.is_empty());
    }
}
