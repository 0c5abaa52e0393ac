use std::alloc::{Layout, handle_alloc_error};
use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;
use std::{fmt, slice};

use crate::pool::NodePool;
use crate::raw::{MIN_ALIGN, RawAllocator};
use crate::record::AllocationRecord;

/// Default number of bucket index bits, giving 65536 buckets.
pub const DEFAULT_BUCKET_BITS: u32 = 16;

const MAX_BUCKET_BITS: u32 = 28;

// Block addresses are multiples of the allocator's alignment, so the lowest bits carry
// no information and are shifted out before masking.
const ADDRESS_SHIFT: u32 = MIN_ALIGN.trailing_zeros();

type Link = Option<NonNull<Node>>;

struct Node {
    address: usize,
    record: AllocationRecord,
    next: Link,
}

/// Map from the address of every live, tracked allocation to its record.
///
/// A fixed array of buckets, each a singly linked list of nodes taken from a
/// [`NodePool`]. The bucket is chosen by masking the address, as block addresses are
/// already spread out well enough for that. In steady state no operation obtains
/// memory from the raw allocator: removed nodes go back to the pool and are reused by
/// later insertions.
///
/// The registry is not synchronized. The tracer guards it with a mutex.
pub struct Registry<R: RawAllocator> {
    raw: R,
    buckets: NonNull<Link>,
    mask: usize,
    len: usize,
    pool: NodePool<Node, R>,
}

// SAFETY: The registry exclusively owns its bucket array and nodes. The records in them
// are plain data, so the whole structure may move to another thread.
unsafe impl<R: RawAllocator> Send for Registry<R> {}

impl<R: RawAllocator> Registry<R> {
    /// Creates an empty registry with 2^16 buckets.
    #[must_use]
    pub fn new(raw: R) -> Self {
        Self::with_bucket_bits(raw, DEFAULT_BUCKET_BITS)
    }

    /// Creates an empty registry with `2^bits` buckets.
    ///
    /// The bucket array is obtained zeroed from `raw` right away. Failure to obtain it
    /// is treated like any other fatal allocation failure.
    ///
    /// # Panics
    ///
    /// Panics if `bits` is larger than 28.
    #[must_use]
    pub fn with_bucket_bits(raw: R, bits: u32) -> Self {
        assert!(
            bits <= MAX_BUCKET_BITS,
            "at most 2^{MAX_BUCKET_BITS} buckets are supported"
        );

        let count = 1_usize << bits;

        let Some(buckets) = NonNull::new(raw.calloc(count, size_of::<Link>()).cast::<Link>())
        else {
            handle_alloc_error(Layout::array::<Link>(count).expect("bucket count is bounded"));
        };

        Self {
            raw,
            buckets,
            mask: count.wrapping_sub(1),
            len: 0,
            pool: NodePool::new(raw),
        }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.mask.wrapping_add(1)
    }

    /// Adds a record for `address`, returning it for further modification.
    ///
    /// The record is prepended to its bucket without checking for an existing record for
    /// the same address. Callers register each live address at most once.
    ///
    /// Returns `None`, leaving the registry unchanged, if no node could be obtained.
    pub fn insert(
        &mut self,
        address: usize,
        record: AllocationRecord,
    ) -> Option<&mut AllocationRecord> {
        let node = self.pool.allocate()?;
        let head = self.bucket_for(address);

        // SAFETY: The node storage is fresh from the pool and ours to initialize. The
        // bucket pointer is in bounds.
        unsafe {
            node.as_ptr().write(Node {
                address,
                record,
                next: *head,
            });
        }

        // SAFETY: The bucket pointer is in bounds and we hold &mut self.
        unsafe {
            *head = Some(node);
        }

        self.len = self.len.wrapping_add(1);

        // SAFETY: The node was just initialized and stays alive until removed, which
        // requires &mut self, so the returned borrow cannot outlive it.
        Some(unsafe { &mut (*node.as_ptr()).record })
    }

    /// Looks up the record for `address`.
    #[must_use]
    pub fn find(&self, address: usize) -> Option<&AllocationRecord> {
        self.find_node(address)
            // SAFETY: Nodes reachable from the buckets are initialized and live as long
            // as the borrow of self.
            .map(|node| unsafe { &(*node.as_ptr()).record })
    }

    /// Looks up the record for `address` for modification.
    #[must_use]
    pub fn find_mut(&mut self, address: usize) -> Option<&mut AllocationRecord> {
        self.find_node(address)
            // SAFETY: As in `find()`, and exclusive because we hold &mut self.
            .map(|node| unsafe { &mut (*node.as_ptr()).record })
    }

    /// Removes the record for `address`, returning its node to the pool.
    pub fn remove(&mut self, address: usize) -> Option<AllocationRecord> {
        let mut link = self.bucket_for(address);

        loop {
            // SAFETY: `link` is either a bucket or the `next` field of a live node.
            let node = unsafe { *link }?;
            let node_ptr = node.as_ptr();

            // SAFETY: Nodes reachable from the buckets are initialized.
            let (node_address, next, record) =
                unsafe { ((*node_ptr).address, (*node_ptr).next, (*node_ptr).record) };

            if node_address == address {
                // SAFETY: Unlinking the node. `link` is valid as above.
                unsafe {
                    *link = next;
                }

                // SAFETY: The node came from our pool and is now unreachable.
                unsafe {
                    self.pool.release(node);
                }

                self.len = self.len.wrapping_sub(1);
                return Some(record);
            }

            // SAFETY: The node is live, so its field is a valid place.
            link = unsafe { &raw mut (*node_ptr).next };
        }
    }

    /// Removes every record, returning all nodes to the pool.
    pub fn clear(&mut self) {
        for bucket_index in 0..self.bucket_count() {
            // SAFETY: The index is below the bucket count.
            let head = unsafe { self.buckets.add(bucket_index) };

            // SAFETY: Bucket pointers are in bounds and we hold &mut self.
            let mut next = unsafe { head.as_ptr().replace(None) };

            while let Some(node) = next {
                // SAFETY: Nodes reachable from the buckets are initialized.
                next = unsafe { (*node.as_ptr()).next };

                // SAFETY: The node came from our pool and is no longer reachable.
                unsafe {
                    self.pool.release(node);
                }
            }
        }

        self.len = 0;
    }

    /// Visits every record once, bucket by bucket.
    ///
    /// The borrow keeps the registry from being modified during the walk.
    #[must_use]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            // SAFETY: The bucket array holds bucket_count() initialized links.
            remaining_buckets: unsafe {
                slice::from_raw_parts(self.buckets.as_ptr(), self.bucket_count())
            },
            current: None,
            remaining: self.len,
            _nodes: PhantomData,
        }
    }

    fn bucket_for(&self, address: usize) -> *mut Link {
        let index = (address >> ADDRESS_SHIFT) & self.mask;

        // SAFETY: The mask keeps the index below the bucket count.
        unsafe { self.buckets.as_ptr().add(index) }
    }

    fn find_node(&self, address: usize) -> Option<NonNull<Node>> {
        // SAFETY: The bucket pointer is in bounds.
        let mut next = unsafe { *self.bucket_for(address) };

        while let Some(node) = next {
            // SAFETY: Nodes reachable from the buckets are initialized.
            let (node_address, node_next) =
                unsafe { ((*node.as_ptr()).address, (*node.as_ptr()).next) };

            if node_address == address {
                return Some(node);
            }

            next = node_next;
        }

        None
    }
}

impl<R: RawAllocator> Drop for Registry<R> {
    fn drop(&mut self) {
        // The nodes go away with the pool.
        // SAFETY: The bucket array came from this raw allocator and is no longer used.
        unsafe {
            self.raw.free(self.buckets.as_ptr().cast());
        }
    }
}

impl<R: RawAllocator> fmt::Debug for Registry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.len)
            .field("bucket_count", &self.bucket_count())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl<'a, R: RawAllocator> IntoIterator for &'a Registry<R> {
    type Item = (usize, &'a AllocationRecord);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Single-pass walk over the records of a [`Registry`], yielding each address together
/// with its record.
///
/// Created by [`Registry::iter()`].
pub struct Iter<'a> {
    remaining_buckets: &'a [Link],
    current: Link,
    remaining: usize,
    _nodes: PhantomData<&'a Node>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (usize, &'a AllocationRecord);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(node) = self.current {
                // SAFETY: Nodes reachable from the buckets are initialized and the registry
                // is borrowed for 'a, so they stay alive and unmodified.
                let node = unsafe { &*node.as_ptr() };

                self.current = node.next;
                self.remaining = self.remaining.saturating_sub(1);

                return Some((node.address, &node.record));
            }

            let (head, rest) = self.remaining_buckets.split_first()?;
            self.current = *head;
            self.remaining_buckets = rest;
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Iter<'_> {}
impl FusedIterator for Iter<'_> {}

impl fmt::Debug for Iter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashMap;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::raw::Libc;
    use crate::record::{AllocationKind, CallStack, Timestamp};

    assert_impl_all!(Registry<Libc>: Send);

    fn record(size: usize) -> AllocationRecord {
        AllocationRecord::new(
            size,
            AllocationKind::Scalar,
            Timestamp::from_parts(1, 0),
            CallStack::EMPTY,
        )
    }

    #[test]
    fn insert_find_remove() {
        let mut registry = Registry::with_bucket_bits(Libc, 4);

        registry.insert(0x1000, record(10)).unwrap();
        registry.insert(0x2000, record(20)).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find(0x1000).unwrap().size, 10);
        assert_eq!(registry.find(0x2000).unwrap().size, 20);
        assert!(registry.find(0x3000).is_none());

        assert_eq!(registry.remove(0x1000).unwrap().size, 10);
        assert!(registry.find(0x1000).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_absent_address_is_none() {
        let mut registry = Registry::with_bucket_bits(Libc, 4);
        registry.insert(0x1000, record(1)).unwrap();

        assert!(registry.remove(0x1010).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn colliding_addresses_share_a_bucket() {
        // A single bucket: every address collides.
        let mut registry = Registry::with_bucket_bits(Libc, 0);

        for index in 1..=5 {
            registry.insert(index * 0x10, record(index)).unwrap();
        }

        // Head, middle and tail of the chain.
        assert_eq!(registry.remove(0x50).unwrap().size, 5);
        assert_eq!(registry.remove(0x30).unwrap().size, 3);
        assert_eq!(registry.remove(0x10).unwrap().size, 1);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find(0x20).unwrap().size, 2);
        assert_eq!(registry.find(0x40).unwrap().size, 4);
    }

    #[test]
    fn insert_returns_modifiable_record() {
        let mut registry = Registry::with_bucket_bits(Libc, 4);

        registry.insert(0x1000, record(8)).unwrap().size = 16;
        assert_eq!(registry.find(0x1000).unwrap().size, 16);

        registry.find_mut(0x1000).unwrap().kind = AllocationKind::Array;
        assert_eq!(registry.find(0x1000).unwrap().kind, AllocationKind::Array);
    }

    #[test]
    fn iteration_visits_every_record_once() {
        let mut registry = Registry::with_bucket_bits(Libc, 3);
        let mut expected = HashMap::new();

        for index in 0..100_usize {
            let address = 0x10_0000 + index * 0x30;
            registry.insert(address, record(index)).unwrap();
            expected.insert(address, index);
        }

        let iter = registry.iter();
        assert_eq!(iter.len(), 100);

        let seen: HashMap<_, _> = iter.map(|(address, record)| (address, record.size)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn iterating_empty_registry_yields_nothing() {
        let registry = Registry::new(Libc);

        assert_eq!(registry.bucket_count(), 65536);
        assert_eq!(registry.iter().next(), None);
        assert!((&registry).into_iter().next().is_none());
    }

    #[test]
    fn clear_empties_registry_and_allows_reuse() {
        let mut registry = Registry::with_bucket_bits(Libc, 2);

        for index in 0..10 {
            registry.insert(0x100 + index * 0x10, record(index)).unwrap();
        }

        registry.clear();

        assert!(registry.is_empty());
        assert_eq!(registry.iter().count(), 0);
        assert!(registry.find(0x100).is_none());

        registry.insert(0x100, record(7)).unwrap();
        assert_eq!(registry.find(0x100).unwrap().size, 7);
    }

    #[test]
    fn allocate_release_cycles_do_not_grow_pool() {
        let mut registry = Registry::with_bucket_bits(Libc, 4);

        for round in 0..10_000 {
            registry.insert(0x1000 + round * 0x10, record(round)).unwrap();
            registry.remove(0x1000 + round * 0x10).unwrap();
        }

        assert!(registry.is_empty());
        assert_eq!(registry.pool.chunks(), 1);
        assert_eq!(registry.pool.objects_out(), 0);
    }

    #[test]
    #[should_panic]
    fn too_many_buckets_panics() {
        _ = Registry::with_bucket_bits(Libc, 40);
    }
}
