use std::mem::{ManuallyDrop, align_of, size_of};
use std::ptr::NonNull;
use std::{fmt, num::NonZero};

use parking_lot::Mutex;

use crate::raw::{MIN_ALIGN, RawAllocator};

/// Default number of slots in one chunk.
pub const DEFAULT_CHUNK_LEN: usize = 4096;

/// Storage for one pool slot.
///
/// A slot on the free list holds `next_free`; a slot handed out by the pool holds the
/// caller's payload. The first slot of each chunk never holds a payload. It links the
/// chunk into the pool's chunk list instead, using `next_free` as the link.
#[repr(C)]
union Slot<T> {
    payload: ManuallyDrop<T>,
    next_free: Option<NonNull<Slot<T>>>,
}

/// A fixed-size-node allocator for the tracer's own bookkeeping.
///
/// Nodes are carved out of large chunks obtained from a [`RawAllocator`], so using the
/// pool never calls back into intercepted allocation primitives. Released nodes go onto
/// an intrusive free list threaded through their own storage and are handed out again
/// before any new chunk is requested. Both operations are O(1).
///
/// While the pool is alive its memory never goes back to the system. Chunks are only
/// returned when the pool itself is dropped.
///
/// # Payload ownership
///
/// The pool hands out uninitialized storage and never drops payloads. Callers that store
/// types with drop logic must drop them before releasing the node.
pub struct NodePool<T, R: RawAllocator> {
    /// Where chunks come from and go back to.
    raw: R,

    /// Number of slots per chunk, including the chunk link slot.
    chunk_len: NonZero<usize>,

    /// Free list, chunk list and counters, guarded together.
    state: Mutex<PoolState<T>>,
}

struct PoolState<T> {
    /// Head of the free list, `None` when every slot is handed out.
    free: Option<NonNull<Slot<T>>>,

    /// Most recently obtained chunk. Each chunk's first slot links to the one before it.
    chunks: Option<NonNull<Slot<T>>>,

    /// Number of chunks obtained so far.
    chunk_count: usize,

    /// Number of nodes currently handed out.
    objects_out: usize,
}

// SAFETY: The state only holds pointers into chunks that the pool exclusively owns. The
// payloads stored there may move between threads together with the pool, hence T: Send.
unsafe impl<T: Send> Send for PoolState<T> {}

impl<T, R: RawAllocator> NodePool<T, R> {
    /// Creates an empty pool with the default chunk length.
    ///
    /// No memory is obtained until the first [`allocate()`](Self::allocate).
    #[must_use]
    pub fn new(raw: R) -> Self {
        Self::with_chunk_len(raw, DEFAULT_CHUNK_LEN)
    }

    /// Creates an empty pool whose chunks hold `chunk_len` slots.
    ///
    /// One slot per chunk is used for chunk bookkeeping, so each chunk provides
    /// `chunk_len - 1` nodes.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_len` is less than 2 or if `T` needs more alignment than the raw
    /// allocator guarantees.
    #[must_use]
    pub fn with_chunk_len(raw: R, chunk_len: usize) -> Self {
        assert!(chunk_len >= 2, "a chunk needs room for its link and one node");
        assert!(
            align_of::<Slot<T>>() <= MIN_ALIGN,
            "pool nodes cannot be aligned beyond what the raw allocator guarantees"
        );

        Self {
            raw,
            chunk_len: NonZero::new(chunk_len).expect("guarded by assertion above"),
            state: Mutex::new(PoolState {
                free: None,
                chunks: None,
                chunk_count: 0,
                objects_out: 0,
            }),
        }
    }

    /// Hands out storage for one node.
    ///
    /// The returned storage is uninitialized and suitably aligned for `T`. Returns
    /// `None` if a new chunk was needed and the raw allocator could not provide it.
    pub fn allocate(&self) -> Option<NonNull<T>> {
        let mut state = self.state.lock();

        if state.free.is_none() {
            self.grow(&mut state)?;
        }

        let slot = state.free?;

        // SAFETY: Every slot on the free list was written with `next_free` active.
        state.free = unsafe { (*slot.as_ptr()).next_free };
        state.objects_out = state.objects_out.wrapping_add(1);

        // The union is repr(C) and ManuallyDrop is transparent, so the payload sits at
        // offset zero of the slot.
        Some(slot.cast::<T>())
    }

    /// Returns a node to the free list.
    ///
    /// # Safety
    ///
    /// `node` must have been returned by [`allocate()`](Self::allocate) on this pool and
    /// not released since. Any payload in it is not dropped and must not be used again.
    pub unsafe fn release(&self, node: NonNull<T>) {
        let slot = node.cast::<Slot<T>>();

        let mut state = self.state.lock();

        // SAFETY: The caller guarantees the node is a slot of one of our chunks that is
        // no longer in use, so we may overwrite it with the free list link.
        unsafe {
            slot.as_ptr().write(Slot {
                next_free: state.free,
            });
        }

        state.free = Some(slot);
        state.objects_out = state.objects_out.saturating_sub(1);
    }

    /// Number of nodes currently handed out.
    #[must_use]
    pub fn objects_out(&self) -> usize {
        self.state.lock().objects_out
    }

    /// Number of chunks obtained from the raw allocator.
    #[must_use]
    pub fn chunks(&self) -> usize {
        self.state.lock().chunk_count
    }

    /// Number of nodes the pool can hand out without obtaining another chunk,
    /// including those currently handed out.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.chunks().saturating_mul(self.nodes_per_chunk())
    }

    fn nodes_per_chunk(&self) -> usize {
        self.chunk_len.get().saturating_sub(1)
    }

    /// Obtains one more chunk and threads its nodes onto the free list.
    fn grow(&self, state: &mut PoolState<T>) -> Option<()> {
        let bytes = size_of::<Slot<T>>().checked_mul(self.chunk_len.get())?;
        let chunk = NonNull::new(self.raw.malloc(bytes).cast::<Slot<T>>())?;

        // SAFETY: The chunk is a fresh block of chunk_len slots, aligned for Slot<T> as
        // asserted at construction. Slot zero is the chunk link.
        unsafe {
            chunk.as_ptr().write(Slot {
                next_free: state.chunks,
            });
        }

        state.chunks = Some(chunk);
        state.chunk_count = state.chunk_count.wrapping_add(1);

        // Thread in reverse so nodes are handed out in address order.
        for index in (1..self.chunk_len.get()).rev() {
            // SAFETY: index < chunk_len, so the slot is inside the chunk.
            let slot = unsafe { chunk.add(index) };

            // SAFETY: The slot is inside our fresh chunk and not yet shared with anyone.
            unsafe {
                slot.as_ptr().write(Slot {
                    next_free: state.free,
                });
            }

            state.free = Some(slot);
        }

        Some(())
    }
}

impl<T, R: RawAllocator> Drop for NodePool<T, R> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let mut next = state.chunks.take();

        while let Some(chunk) = next {
            // SAFETY: Slot zero of every chunk holds the link to the previous chunk.
            next = unsafe { (*chunk.as_ptr()).next_free };

            // SAFETY: The chunk was obtained from this raw allocator and nothing refers
            // to it anymore, as the pool is being dropped.
            unsafe {
                self.raw.free(chunk.as_ptr().cast());
            }
        }

        state.free = None;
    }
}

impl<T, R: RawAllocator> fmt::Debug for NodePool<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct("NodePool")
            .field("chunk_len", &self.chunk_len)
            .field("chunks", &state.chunk_count)
            .field("objects_out", &state.objects_out)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashSet;
    use std::ptr;
    use std::sync::Arc;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::raw::Libc;

    assert_impl_all!(NodePool<u64, Libc>: Send, Sync);

    #[derive(Clone, Copy, Debug)]
    struct Exhausted;

    // SAFETY: Never hands out memory, so there is nothing to get wrong.
    unsafe impl RawAllocator for Exhausted {
        fn malloc(&self, _size: usize) -> *mut u8 {
            ptr::null_mut()
        }

        fn calloc(&self, _count: usize, _size: usize) -> *mut u8 {
            ptr::null_mut()
        }

        unsafe fn realloc(&self, _block: *mut u8, _size: usize) -> *mut u8 {
            ptr::null_mut()
        }

        unsafe fn free(&self, _block: *mut u8) {}
    }

    #[test]
    fn empty_pool_owns_nothing() {
        let pool = NodePool::<u64, _>::new(Libc);

        assert_eq!(pool.chunks(), 0);
        assert_eq!(pool.capacity(), 0);
        assert_eq!(pool.objects_out(), 0);
    }

    #[test]
    fn allocate_and_release() {
        let pool = NodePool::<u64, _>::with_chunk_len(Libc, 4);

        let node = pool.allocate().unwrap();

        // SAFETY: The node is ours and aligned for u64.
        unsafe {
            node.as_ptr().write(42);
            assert_eq!(node.as_ptr().read(), 42);
        }

        assert_eq!(pool.objects_out(), 1);
        assert_eq!(pool.chunks(), 1);
        assert_eq!(pool.capacity(), 3);

        // SAFETY: The node came from this pool and is not used afterwards.
        unsafe {
            pool.release(node);
        }

        assert_eq!(pool.objects_out(), 0);
    }

    #[test]
    fn released_node_is_reused_first() {
        let pool = NodePool::<u64, _>::with_chunk_len(Libc, 8);

        let first = pool.allocate().unwrap();
        let _second = pool.allocate().unwrap();

        // SAFETY: The node came from this pool and is not used afterwards.
        unsafe {
            pool.release(first);
        }

        assert_eq!(pool.allocate().unwrap(), first);
        assert_eq!(pool.chunks(), 1);
    }

    #[test]
    fn grows_by_whole_chunks() {
        let pool = NodePool::<u64, _>::with_chunk_len(Libc, 3);

        let nodes: Vec<_> = (0..5).map(|_| pool.allocate().unwrap()).collect();

        assert_eq!(pool.chunks(), 3);
        assert_eq!(pool.capacity(), 6);
        assert_eq!(pool.objects_out(), 5);

        let distinct: HashSet<_> = nodes.iter().map(|node| node.as_ptr().addr()).collect();
        assert_eq!(distinct.len(), 5);

        for node in nodes {
            // SAFETY: Each node came from this pool and is released once.
            unsafe {
                pool.release(node);
            }
        }

        assert_eq!(pool.objects_out(), 0);
        assert_eq!(pool.chunks(), 3);
    }

    #[test]
    fn nodes_are_aligned_for_payload() {
        let pool = NodePool::<u128, _>::with_chunk_len(Libc, 16);

        for _ in 0..40 {
            let node = pool.allocate().unwrap();
            assert_eq!(node.as_ptr().addr() % align_of::<u128>(), 0);
        }
    }

    #[test]
    fn raw_exhaustion_is_reported_as_none() {
        let pool = NodePool::<u64, _>::new(Exhausted);

        assert!(pool.allocate().is_none());
        assert_eq!(pool.objects_out(), 0);
        assert_eq!(pool.chunks(), 0);
    }

    #[test]
    #[should_panic]
    fn chunk_without_room_for_nodes_panics() {
        _ = NodePool::<u64, _>::with_chunk_len(Libc, 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Too slow under Miri.
    fn concurrent_use_keeps_counts_consistent() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 2000;

        // Carries the nodes a worker still holds back to the joining thread.
        struct Held(Vec<NonNull<usize>>);

        // SAFETY: The nodes are exclusively owned by whoever holds the `Held`.
        unsafe impl Send for Held {}

        let pool = Arc::new(NodePool::<usize, _>::with_chunk_len(Libc, 64));

        let workers: Vec<_> = (0..THREADS)
            .map(|worker| {
                let pool = Arc::clone(&pool);

                thread::spawn(move || {
                    let mut held = Vec::new();

                    for round in 0..ROUNDS {
                        let node = pool.allocate().unwrap();

                        // SAFETY: The node is ours until released.
                        unsafe {
                            node.as_ptr().write(worker * ROUNDS + round);
                        }

                        held.push(node);

                        if round % 3 == 0 {
                            let node = held.swap_remove(0);

                            // SAFETY: Nobody else has seen this node.
                            unsafe {
                                assert_eq!(node.as_ptr().read() / ROUNDS, worker);
                                pool.release(node);
                            }
                        }

                        assert!(pool.objects_out() <= pool.capacity());
                    }

                    Held(held)
                })
            })
            .collect();

        let mut remaining = 0;

        for worker in workers {
            let Held(held) = worker.join().unwrap();
            remaining += held.len();

            for node in held {
                // SAFETY: Each node is released exactly once.
                unsafe {
                    pool.release(node);
                }
            }
        }

        assert!(remaining > 0);
        assert_eq!(pool.objects_out(), 0);
    }
}
