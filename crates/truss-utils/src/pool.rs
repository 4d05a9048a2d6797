use core::ops::{Deref, DerefMut};

/// Smallest class is 4 bytes, largest 4096; requests above the largest
/// class bypass the caches entirely.
const CLASS_COUNT: usize = 11;
const MIN_SHIFT: u32 = 2;

pub const fn class_count() -> usize {
    CLASS_COUNT
}

/// Capacity of a size class. Inverse of [`size_to_index`].
#[inline(always)]
pub const fn index_to_capacity(index: usize) -> usize {
    1 << (index as u32 + MIN_SHIFT)
}

/// Smallest class whose capacity covers `size`, or `None` for the
/// unclassed bypass. Monotone in `size`.
#[inline]
pub fn size_to_index(size: usize) -> Option<usize> {
    if size > index_to_capacity(CLASS_COUNT - 1) {
        return None;
    }
    let needed = size.max(1 << MIN_SHIFT).next_power_of_two();
    Some((needed.trailing_zeros() - MIN_SHIFT) as usize)
}

/// A pooled byte buffer. Remembers the class it was carved from so a
/// release always lands back on the same cache.
pub struct Buffer {
    data: Box<[u8]>,
    class: Option<u8>,
}

impl Buffer {
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn class(&self) -> Option<usize> {
        self.class.map(usize::from)
    }
}

impl Deref for Buffer {
    type Target = [u8];

    #[inline(always)]
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Buffer {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Caps how many buffers each class may cache. The budget is a per-class
/// byte amount, so small classes cache more buffers than large ones.
#[derive(Clone, Copy, Debug)]
pub struct CachePolicy {
    budget: usize,
}

impl CachePolicy {
    pub const fn with_budget(budget: usize) -> Self {
        Self { budget }
    }

    #[inline]
    pub fn cap(&self, class: usize) -> usize {
        self.budget / index_to_capacity(class)
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::with_budget(32 * 4096)
    }
}

#[derive(Default)]
struct ClassCache {
    free: Vec<Box<[u8]>>,
    allocated: usize,
}

/// Size-classed LIFO buffer caches. One pool per reactor thread; no
/// cross-thread transfer. Dropping the pool frees every cached buffer.
///
/// Invariant per class: `allocated - cached` equals the number of
/// buffers currently held by callers.
pub struct BufferPool {
    caches: [ClassCache; CLASS_COUNT],
    policy: CachePolicy,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_policy(CachePolicy::default())
    }

    pub fn with_policy(policy: CachePolicy) -> Self {
        Self { caches: Default::default(), policy }
    }

    /// Returns a buffer of capacity >= `size`, rounded up to the class
    /// bound, or of exact `size` on the bypass path. Cached buffers are
    /// reused LIFO before anything is allocated.
    pub fn acquire(&mut self, size: usize) -> Buffer {
        let Some(class) = size_to_index(size) else {
            return Buffer { data: vec![0u8; size].into_boxed_slice(), class: None };
        };
        let cache = &mut self.caches[class];
        let data = match cache.free.pop() {
            Some(data) => data,
            None => {
                cache.allocated += 1;
                vec![0u8; index_to_capacity(class)].into_boxed_slice()
            }
        };
        Buffer { data, class: Some(class as u8) }
    }

    /// Hands a buffer back to its class cache; frees it instead when the
    /// cache is at the policy cap. Bypass buffers are always freed.
    pub fn release(&mut self, buf: Buffer) {
        let Some(class) = buf.class() else { return };
        crate::safe_assert!(
            buf.capacity() == index_to_capacity(class),
            "buffer returned to a foreign class"
        );
        let cache = &mut self.caches[class];
        if cache.free.len() < self.policy.cap(class) {
            cache.free.push(buf.data);
        } else {
            cache.allocated -= 1;
        }
    }

    /// Buffers of `class` in existence (cached plus held by callers).
    pub fn allocated(&self, class: usize) -> usize {
        self.caches[class].allocated
    }

    /// Buffers of `class` sitting in the cache.
    pub fn cached(&self, class: usize) -> usize {
        self.caches[class].free.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_mapping_agrees_and_is_monotone() {
        let mut prev = 0;
        for size in 1..=4096usize {
            let class = size_to_index(size).unwrap();
            assert!(class >= prev, "size_to_index not monotone at {size}");
            assert!(index_to_capacity(class) >= size);
            if class > 0 {
                assert!(index_to_capacity(class - 1) < size);
            }
            prev = class;
        }
        for class in 0..class_count() {
            assert_eq!(size_to_index(index_to_capacity(class)), Some(class));
        }
        assert_eq!(size_to_index(4097), None);
    }

    #[test]
    fn bypass_allocates_exact() {
        let mut pool = BufferPool::new();
        let buf = pool.acquire(10_000);
        assert_eq!(buf.capacity(), 10_000);
        assert_eq!(buf.class(), None);
        pool.release(buf);
        for class in 0..class_count() {
            assert_eq!(pool.allocated(class), 0);
        }
    }

    #[test]
    fn accounting_tracks_buffers_held_by_callers() {
        let mut pool = BufferPool::new();
        let class = size_to_index(100).unwrap();

        let held: Vec<_> = (0..10).map(|_| pool.acquire(100)).collect();
        assert_eq!(pool.allocated(class) - pool.cached(class), 10);

        for buf in held {
            pool.release(buf);
        }
        assert_eq!(pool.allocated(class) - pool.cached(class), 0);
    }

    #[test]
    fn recycle_caps_cache_and_reuses_lifo() {
        let cap = 8;
        let class = size_to_index(100).unwrap();
        assert_eq!(index_to_capacity(class), 128);
        let mut pool =
            BufferPool::with_policy(CachePolicy::with_budget(cap * index_to_capacity(class)));

        let mut held: Vec<_> = (0..100).map(|_| pool.acquire(100)).collect();
        assert_eq!(pool.allocated(class), 100);
        for (i, buf) in held.iter_mut().enumerate() {
            buf[0] = i as u8;
        }
        for buf in held {
            pool.release(buf);
        }
        // Only the first `cap` released buffers stay cached, the rest are freed.
        assert_eq!(pool.cached(class), cap);
        assert_eq!(pool.allocated(class), cap);

        // LIFO: the most recently cached buffer comes back first.
        for expect in (0..cap as u8).rev() {
            let buf = pool.acquire(100);
            assert_eq!(buf[0], expect);
        }
        let fresh = pool.acquire(100);
        assert_eq!(fresh[0], 0);
        assert_eq!(pool.allocated(class), cap + 1);
    }
}
