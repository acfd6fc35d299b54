//! Freelist Allocator
//!
//! A freelist is a bounded pool of fixed-size kernel objects. Every pooled
//! object type (thread nodes, DPC nodes, worker records) gets its own
//! freelist so that the common create/retire cycle never reaches the
//! underlying allocator.
//!
//! Nodes are reset through the zero callback when they are freed, so a node
//! coming back out of the pool never carries state from its previous user.
//! Once the pool holds `max_count` nodes, further frees go straight back to
//! the underlying allocator.

use std::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::{KernError, KernResult};

// ============================================================================
// Node Callbacks
// ============================================================================

/// Allocate, release and reset callbacks for one node type
///
/// The implementing value doubles as the cookie: any state the callbacks
/// need lives in `self`.
pub trait NodeOps<T>: Send + Sync {
    /// Produce a fresh node, or `None` if the backing allocator is exhausted
    fn alloc(&self) -> Option<Box<T>>;

    /// Give a surplus node back to the backing allocator
    fn free(&self, node: Box<T>) {
        drop(node);
    }

    /// Reset a node before it is pooled
    fn zero(&self, node: &mut T);
}

/// Default callbacks: heap-allocate `T::default()`, reset to `T::default()`
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultOps;

impl<T: Default> NodeOps<T> for DefaultOps {
    fn alloc(&self) -> Option<Box<T>> {
        Some(Box::default())
    }

    fn zero(&self, node: &mut T) {
        *node = T::default();
    }
}

// ============================================================================
// Freelist Statistics
// ============================================================================

/// Freelist counters for debugging and monitoring
#[derive(Debug, Default)]
pub struct FreelistStats {
    /// Successful allocations
    pub allocs: AtomicU64,
    /// Allocations that went to the backing allocator
    pub fresh: AtomicU64,
    /// Frees that were pooled
    pub recycled: AtomicU64,
    /// Frees that went to the backing allocator
    pub released: AtomicU64,
    /// Allocations the backing allocator refused
    pub failures: AtomicU64,
}

/// Point-in-time copy of [`FreelistStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreelistSnapshot {
    pub allocs: u64,
    pub fresh: u64,
    pub recycled: u64,
    pub released: u64,
    pub failures: u64,
    pub pooled: usize,
}

// ============================================================================
// Freelist
// ============================================================================

/// Freelist attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreelistAttrs {
    /// Most nodes kept in the pool at once
    pub max_count: usize,
}

/// Bounded, spinlock-protected pool of `Box<T>` nodes
pub struct Freelist<T, O: NodeOps<T> = DefaultOps> {
    attrs: FreelistAttrs,
    ops: O,
    pool: Mutex<Vec<Box<T>>>,
    stats: FreelistStats,
}

impl<T: Default> Freelist<T> {
    /// Freelist with default callbacks
    pub fn simple(max_count: usize) -> Self {
        Self::new(FreelistAttrs { max_count }, DefaultOps)
    }
}

impl<T, O: NodeOps<T>> Freelist<T, O> {
    /// Create a freelist with custom callbacks
    pub fn new(attrs: FreelistAttrs, ops: O) -> Self {
        Self {
            attrs,
            ops,
            pool: Mutex::new(Vec::with_capacity(attrs.max_count.min(64))),
            stats: FreelistStats::default(),
        }
    }

    /// Attributes this freelist was created with
    pub fn attrs(&self) -> FreelistAttrs {
        self.attrs
    }

    /// Size of one node in bytes
    pub fn node_size(&self) -> usize {
        core::mem::size_of::<T>()
    }

    /// Take a node from the pool, or a fresh one from the callbacks
    pub fn alloc(&self) -> KernResult<Box<T>> {
        // Fast path: reuse a pooled node
        let pooled = self.pool.lock().pop();
        if let Some(node) = pooled {
            self.stats.allocs.fetch_add(1, Ordering::Relaxed);
            return Ok(node);
        }

        // Slow path: the backing allocator, outside the lock
        match self.ops.alloc() {
            Some(node) => {
                self.stats.allocs.fetch_add(1, Ordering::Relaxed);
                self.stats.fresh.fetch_add(1, Ordering::Relaxed);
                Ok(node)
            }
            None => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                Err(KernError::NoMemory)
            }
        }
    }

    /// Return a node, pooling it if there is room
    pub fn free(&self, mut node: Box<T>) {
        self.ops.zero(&mut node);

        let surplus = {
            let mut pool = self.pool.lock();
            if pool.len() < self.attrs.max_count {
                pool.push(node);
                None
            } else {
                Some(node)
            }
        };

        match surplus {
            None => {
                self.stats.recycled.fetch_add(1, Ordering::Relaxed);
            }
            Some(node) => {
                self.stats.released.fetch_add(1, Ordering::Relaxed);
                self.ops.free(node);
            }
        }
    }

    /// Number of nodes currently pooled
    pub fn count(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn stats(&self) -> FreelistSnapshot {
        FreelistSnapshot {
            allocs: self.stats.allocs.load(Ordering::Relaxed),
            fresh: self.stats.fresh.load(Ordering::Relaxed),
            recycled: self.stats.recycled.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            pooled: self.count(),
        }
    }

    /// Release every pooled node and consume the freelist
    pub fn destroy(self) {
        drop(self);
    }

    fn drain(&mut self) -> usize {
        let nodes = core::mem::take(self.pool.get_mut());
        let n = nodes.len();
        for node in nodes {
            self.ops.free(node);
        }
        n
    }
}

impl<T, O: NodeOps<T>> Drop for Freelist<T, O> {
    fn drop(&mut self) {
        let released = self.drain();
        log::trace!(
            "freelist<{}> destroyed, released {} pooled node(s)",
            core::any::type_name::<T>(),
            released
        );
    }
}

impl<T, O: NodeOps<T>> core::fmt::Debug for Freelist<T, O> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Freelist")
            .field("max_count", &self.attrs.max_count)
            .field("pooled", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Default)]
    struct Node {
        tag: u64,
        payload: [u64; 4],
    }

    /// Counts live nodes and refuses allocation past `limit`
    struct CountingOps {
        live: Arc<AtomicUsize>,
        limit: usize,
    }

    impl NodeOps<Node> for CountingOps {
        fn alloc(&self) -> Option<Box<Node>> {
            if self.live.load(Ordering::SeqCst) >= self.limit {
                return None;
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            Some(Box::default())
        }

        fn free(&self, node: Box<Node>) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            drop(node);
        }

        fn zero(&self, node: &mut Node) {
            *node = Node::default();
        }
    }

    #[test]
    fn test_freelist_recycles_and_zeroes() {
        let fl: Freelist<Node> = Freelist::simple(4);

        let mut a = fl.alloc().expect("allocation failed");
        a.tag = 0xdead;
        a.payload[2] = 7;
        let addr = &*a as *const Node;
        fl.free(a);
        assert_eq!(fl.count(), 1);

        let b = fl.alloc().expect("allocation failed");
        assert_eq!(&*b as *const Node, addr);
        assert_eq!(b.tag, 0);
        assert_eq!(b.payload, [0; 4]);
        assert_eq!(fl.count(), 0);
    }

    #[test]
    fn test_freelist_respects_cap() {
        let live = Arc::new(AtomicUsize::new(0));
        let fl = Freelist::new(
            FreelistAttrs { max_count: 2 },
            CountingOps { live: live.clone(), limit: usize::MAX },
        );

        let nodes: Vec<_> = (0..5).map(|_| fl.alloc().unwrap()).collect();
        assert_eq!(live.load(Ordering::SeqCst), 5);

        for n in nodes {
            fl.free(n);
        }
        assert_eq!(fl.count(), 2);
        assert_eq!(live.load(Ordering::SeqCst), 2);

        let snap = fl.stats();
        assert_eq!(snap.recycled, 2);
        assert_eq!(snap.released, 3);

        fl.destroy();
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_freelist_exhaustion() {
        let live = Arc::new(AtomicUsize::new(0));
        let fl = Freelist::new(
            FreelistAttrs { max_count: 1 },
            CountingOps { live: live.clone(), limit: 1 },
        );

        let first = fl.alloc().unwrap();
        assert_eq!(fl.alloc().err(), Some(KernError::NoMemory));
        assert_eq!(fl.stats().failures, 1);

        // A freed node satisfies the next request without the allocator
        fl.free(first);
        let again = fl.alloc().unwrap();
        assert_eq!(fl.stats().fresh, 1);
        fl.free(again);
    }

    #[test]
    fn test_zero_capacity_never_pools() {
        let fl: Freelist<Node> = Freelist::simple(0);
        let n = fl.alloc().unwrap();
        fl.free(n);
        assert_eq!(fl.count(), 0);
        assert_eq!(fl.stats().released, 1);
    }
}
