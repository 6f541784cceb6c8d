//! Bounded pool of reusable RGBA frames
//!
//! The pool owns every idle [`FrameWrapper`]. `get` checks one out to the
//! decoder as a [`Checkout`]; once filled it becomes a [`PooledFrame`], a
//! shared handle whose clones count references. When the last handle drops,
//! the frame goes back to the pool, or is freed if the pool is full or was
//! cleared since the frame was checked out.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use tracing::{debug, warn};

use crate::decode::frame::{FrameMetadata, FrameWrapper, PixelFormat, RgbaView};
use crate::error::DecodeError;

/// Thread-safe handle to a frame pool
#[derive(Clone)]
pub struct FramePool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    idle: ArrayQueue<Arc<FrameWrapper>>,
    /// Bumped by every `clear`; frames from older generations are never reused
    generation: AtomicU64,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    allocations: AtomicUsize,
    reuses: AtomicUsize,
    evictions: AtomicUsize,
    checked_out: AtomicUsize,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Wrappers allocated because no idle one was available
    pub allocations: usize,
    /// Checkouts served from an idle wrapper
    pub reuses: usize,
    /// Wrappers freed by `clear`, a full pool or a stale generation
    pub evictions: usize,
    /// Wrappers currently outside the pool
    pub checked_out: usize,
    /// Wrappers currently idle in the pool
    pub idle: usize,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                idle: ArrayQueue::new(capacity.max(1)),
                generation: AtomicU64::new(0),
                stats: CachePadded::new(Stats::default()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.idle.capacity()
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Check out one frame.
    ///
    /// The frame is either new and unsized, sized for the current stream, or
    /// sized for a previous resolution; the caller detects the last case.
    pub fn get(&self) -> Result<Checkout, DecodeError> {
        let wrapper = loop {
            match self.shared.idle.pop() {
                Some(wrapper) if wrapper.generation() == self.generation() => {
                    self.shared.stats.reuses.fetch_add(1, Ordering::Relaxed);
                    break wrapper;
                }
                // Returned concurrently with a clear
                Some(stale) => self.shared.evict(stale),
                None => break self.shared.allocate()?,
            }
        };
        wrapper.set_in_pool(false);
        self.shared.stats.checked_out.fetch_add(1, Ordering::Relaxed);
        Ok(Checkout {
            wrapper: Some(wrapper),
            pool: Arc::clone(&self.shared),
        })
    }

    /// Free every idle frame and retire all outstanding ones.
    ///
    /// Frames still held by consumers are freed when their last reference
    /// drops instead of being returned.
    pub fn clear(&self) {
        self.shared.clear();
    }

    pub fn stats(&self) -> PoolStats {
        let stats = &self.shared.stats;
        PoolStats {
            allocations: stats.allocations.load(Ordering::Relaxed),
            reuses: stats.reuses.load(Ordering::Relaxed),
            evictions: stats.evictions.load(Ordering::Relaxed),
            checked_out: stats.checked_out.load(Ordering::Relaxed),
            idle: self.shared.idle.len(),
        }
    }
}

impl PoolShared {
    fn clear(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut evicted = 0;
        while let Some(wrapper) = self.idle.pop() {
            self.evict(wrapper);
            evicted += 1;
        }
        debug!(generation, evicted, "Cleared frame pool");
    }

    fn allocate(&self) -> Result<Arc<FrameWrapper>, DecodeError> {
        self.admit(FrameWrapper::new(self.generation.load(Ordering::Acquire)))
    }

    /// Count a fresh wrapper, or report the pool as exhausted when libav
    /// could not allocate one.
    fn admit(
        &self,
        allocated: Result<FrameWrapper, DecodeError>,
    ) -> Result<Arc<FrameWrapper>, DecodeError> {
        match allocated {
            Ok(wrapper) => {
                self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                Ok(Arc::new(wrapper))
            }
            Err(err) => {
                warn!("Frame pool could not allocate a frame: {}", err);
                Err(DecodeError::PoolExhausted)
            }
        }
    }

    fn evict(&self, wrapper: Arc<FrameWrapper>) {
        wrapper.set_in_pool(false);
        if !wrapper.is_freed() {
            wrapper.free();
        }
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Take back a frame with no outstanding references.
    fn recycle(&self, wrapper: Arc<FrameWrapper>) {
        let refs = wrapper.ref_count();
        if refs != 0 {
            panic!("frame returned to pool with {} outstanding references", refs);
        }
        self.stats.checked_out.fetch_sub(1, Ordering::Relaxed);

        if wrapper.is_freed() || wrapper.generation() != self.generation.load(Ordering::Acquire) {
            self.evict(wrapper);
            return;
        }
        wrapper.set_in_pool(true);
        if let Err(wrapper) = self.idle.push(wrapper) {
            self.evict(wrapper);
        }
    }
}

/// A frame checked out to the decoder, with no consumer references yet
///
/// Dropping it without calling [`Checkout::into_frame`] hands the frame back.
pub struct Checkout {
    wrapper: Option<Arc<FrameWrapper>>,
    pool: Arc<PoolShared>,
}

impl Checkout {
    pub(crate) fn wrapper(&self) -> &FrameWrapper {
        // Empty only after a failed reallocate, which the decoder treats as fatal
        self.wrapper
            .as_deref()
            .unwrap_or_else(|| unreachable!("checkout already consumed"))
    }

    /// Replace a frame sized for an old resolution.
    ///
    /// Clears the whole pool and frees the old frame before allocating the
    /// new one, so no stale-size buffer can be handed out afterwards.
    pub fn reallocate(&mut self) -> Result<(), DecodeError> {
        self.pool.clear();
        if let Some(old) = self.wrapper.take() {
            old.free();
            self.pool.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        match self.pool.allocate() {
            Ok(wrapper) => {
                self.wrapper = Some(wrapper);
                Ok(())
            }
            Err(err) => {
                self.pool.stats.checked_out.fetch_sub(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Free the frame instead of returning it to the pool.
    ///
    /// Used when filling it failed part way and its contents can't be trusted.
    pub fn discard(mut self) {
        if let Some(wrapper) = self.wrapper.take() {
            self.pool.stats.checked_out.fetch_sub(1, Ordering::Relaxed);
            self.pool.evict(wrapper);
        }
    }

    /// Hand the filled frame to the caller with one reference.
    pub fn into_frame(mut self, meta: FrameMetadata) -> PooledFrame {
        let wrapper = self
            .wrapper
            .take()
            .unwrap_or_else(|| unreachable!("checkout already consumed"));
        wrapper.increment_ref();
        PooledFrame {
            wrapper,
            pool: Arc::clone(&self.pool),
            meta: Arc::new(meta),
        }
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let Some(wrapper) = self.wrapper.take() {
            self.pool.recycle(wrapper);
        }
    }
}

/// Shared handle to a decoded RGBA frame
///
/// Cloning adds a reference; dropping the last one returns the frame to its pool.
pub struct PooledFrame {
    wrapper: Arc<FrameWrapper>,
    pool: Arc<PoolShared>,
    pub meta: Arc<FrameMetadata>,
}

impl PooledFrame {
    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn image(&self) -> RgbaView<'_> {
        self.wrapper.to_image()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.wrapper.pixel_format()
    }

    /// Handles currently sharing this frame
    pub fn ref_count(&self) -> i64 {
        self.wrapper.ref_count()
    }

    /// Pool generation the frame was allocated under
    pub fn generation(&self) -> u64 {
        self.wrapper.generation()
    }

    pub fn is_freed(&self) -> bool {
        self.wrapper.is_freed()
    }
}

impl Clone for PooledFrame {
    fn clone(&self) -> Self {
        self.wrapper.increment_ref();
        Self {
            wrapper: Arc::clone(&self.wrapper),
            pool: Arc::clone(&self.pool),
            meta: Arc::clone(&self.meta),
        }
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        if self.wrapper.decrement_ref() == 0 {
            self.pool.recycle(Arc::clone(&self.wrapper));
        }
    }
}

impl std::fmt::Debug for PooledFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledFrame")
            .field("meta", &self.meta)
            .field("refs", &self.wrapper.ref_count())
            .finish()
    }
}
