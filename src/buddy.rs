//! A binary-buddy allocator over an abstract capacity.

use alloc::{
    collections::{BTreeMap, BTreeSet},
    vec::Vec,
};

#[cfg(feature = "log")]
use log::{debug, trace};

use crate::{AllocError, AllocInitError};

/// The free blocks of a single order.
#[derive(Debug)]
struct BuddyLevel {
    block_size: usize,
    /// Offsets of the free blocks of this order, lowest first.
    free_list: BTreeSet<usize>,
}

impl BuddyLevel {
    fn new(order: u32) -> BuddyLevel {
        BuddyLevel {
            block_size: 1 << order,
            free_list: BTreeSet::new(),
        }
    }

    /// Retrieves the offset of the buddy of the block which starts
    /// `block_ofs` units from the base.
    #[inline]
    fn buddy_ofs(&self, block_ofs: usize) -> usize {
        block_ofs ^ self.block_size
    }

    /// Returns the offset of the lowest free block of this order.
    #[inline]
    fn first_free(&self) -> Option<usize> {
        self.free_list.first().copied()
    }

    /// Pushes a block onto the free list.
    fn free_list_push(&mut self, block_ofs: usize) {
        assert_eq!(block_ofs % self.block_size, 0);

        let inserted = self.free_list.insert(block_ofs);
        assert!(inserted, "block at {block_ofs} is already free");
    }

    /// Removes the specified block from the free list.
    ///
    /// Returns `false` if the block was not free.
    fn free_list_remove(&mut self, block_ofs: usize) -> bool {
        self.free_list.remove(&block_ofs)
    }

    /// Frees a block of this order.
    ///
    /// If `coalesce` is set and the buddy is free, the buddy is taken off the
    /// free list and the offset of the merged block is returned; it belongs
    /// to the next order up.
    fn free(&mut self, block_ofs: usize, coalesce: bool) -> Option<usize> {
        if coalesce && self.free_list_remove(self.buddy_ofs(block_ofs)) {
            Some(block_ofs & !self.block_size)
        } else {
            self.free_list_push(block_ofs);
            None
        }
    }
}

/// A top-level block. Roots never coalesce with each other.
#[derive(Copy, Clone, Debug)]
struct Root {
    offset: usize,
    order: u32,
}

#[derive(Clone, Debug)]
struct Allocation<O> {
    order: u32,
    owner: O,
}

/// The position and size of a granted block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Grant {
    /// Offset of the block from the start of the capacity.
    pub offset: usize,
    /// Size of the block; always a power of two.
    pub size: usize,
}

/// Whether a block is free or held by an owner.
#[derive(Debug, PartialEq, Eq, Hash)]
pub enum BlockStatus<'a, O> {
    /// The block is available.
    Free,
    /// The block is held by `owner`.
    Allocated {
        /// The owner the block was granted to.
        owner: &'a O,
    },
}

impl<'a, O> BlockStatus<'a, O> {
    /// Returns `true` if the block is free.
    pub fn is_free(&self) -> bool {
        matches!(self, BlockStatus::Free)
    }

    /// Returns the owner of an allocated block.
    pub fn owner(&self) -> Option<&'a O> {
        match *self {
            BlockStatus::Free => None,
            BlockStatus::Allocated { owner } => Some(owner),
        }
    }
}

impl<O> Clone for BlockStatus<'_, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<O> Copy for BlockStatus<'_, O> {}

/// A read-only view of one block, as returned by [`BuddyAllocator::snapshot`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct BlockView<'a, O> {
    /// Offset of the block from the start of the capacity.
    pub offset: usize,
    /// Size of the block; always a power of two.
    pub size: usize,
    /// Whether the block is free or allocated, and to whom.
    pub status: BlockStatus<'a, O>,
}

impl<O> Clone for BlockView<'_, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<O> Copy for BlockView<'_, O> {}

/// A binary-buddy allocator.
///
/// The allocator manages `capacity` abstract units (kilobytes, pages, ...)
/// and grants power-of-two blocks of them to owners of type `O`.
///
/// The capacity is split into _roots_, one per set bit of its binary
/// representation, laid out from largest to smallest. A power-of-two
/// capacity has a single root. Every root is the top of its own buddy tree,
/// so every block, roots included, has a power-of-two size and an offset
/// which is a multiple of that size.
///
/// Blocks are enumerated in offset order. Allocation is first-fit in that
/// order: the free block with the lowest offset that is large enough is
/// split down to the requested size. Release coalesces a block with its
/// buddy, the block at `offset ^ size`, for as long as the buddy is free.
///
/// ```
/// use buddy_sim::BuddyAllocator;
///
/// // 12 = 8 + 4, so there are two roots.
/// let mut buddy = BuddyAllocator::try_new(12).unwrap();
/// let sizes: Vec<usize> = buddy.snapshot().iter().map(|b| b.size).collect();
/// assert_eq!(sizes, [8, 4]);
///
/// let grant = buddy.grant('a', 3).unwrap().unwrap();
/// assert_eq!((grant.offset, grant.size), (0, 4));
/// ```
#[derive(Debug)]
pub struct BuddyAllocator<O> {
    capacity: usize,
    /// Roots in offset order.
    roots: Vec<Root>,
    /// Free lists, indexed by order.
    levels: Vec<BuddyLevel>,
    /// Allocated blocks by offset.
    allocated: BTreeMap<usize, Allocation<O>>,
    /// Offsets of the blocks held by each owner.
    owners: BTreeMap<O, BTreeSet<usize>>,
}

impl<O: Ord + Clone> BuddyAllocator<O> {
    /// Constructs a new `BuddyAllocator` managing `capacity` units.
    ///
    /// Any positive capacity is accepted; see the type-level documentation
    /// for how capacities which are not powers of two are laid out.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidCapacity`] if `capacity` is zero.
    pub fn try_new(capacity: usize) -> Result<BuddyAllocator<O>, AllocInitError> {
        if capacity == 0 {
            return Err(AllocInitError::InvalidCapacity);
        }

        let max_order = capacity.ilog2();
        let mut levels: Vec<BuddyLevel> = (0..=max_order).map(BuddyLevel::new).collect();

        let mut roots = Vec::with_capacity(capacity.count_ones() as usize);
        let mut offset = 0;
        for order in (0..=max_order).rev() {
            if capacity & (1 << order) == 0 {
                continue;
            }

            roots.push(Root { offset, order });
            levels[order as usize].free_list_push(offset);
            offset += 1 << order;
        }

        debug_assert_eq!(offset, capacity);
        debug!(
            "buddy: capacity {} split into {} root(s), largest block {}",
            capacity,
            roots.len(),
            1usize << max_order
        );

        Ok(BuddyAllocator {
            capacity,
            roots,
            levels,
            allocated: BTreeMap::new(),
            owners: BTreeMap::new(),
        })
    }

    /// Returns the number of units managed by this allocator.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the size of the largest block this allocator can grant.
    pub fn max_block_size(&self) -> usize {
        self.levels.last().map_or(0, |level| level.block_size)
    }

    /// Returns the order of the smallest block that can hold `size` units,
    /// if this allocator has blocks that large.
    fn order_for(&self, size: usize) -> Option<u32> {
        let order = size.checked_next_power_of_two()?.trailing_zeros();

        ((order as usize) < self.levels.len()).then_some(order)
    }

    /// Returns the order of the root containing `block_ofs`.
    fn root_order(&self, block_ofs: usize) -> u32 {
        let idx = self.roots.partition_point(|root| root.offset <= block_ofs);

        self.roots[idx.checked_sub(1).expect("offset precedes the first root")].order
    }

    /// Attempts to allocate `size` units to `owner`.
    ///
    /// Returns `Ok(true)` if a block was granted and `Ok(false)` if no free
    /// block is large enough, in which case nothing changes. Use
    /// [`grant`](Self::grant) to learn where the block was placed.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidRequest`] if `size` is zero.
    pub fn allocate(&mut self, owner: O, size: usize) -> Result<bool, AllocError> {
        Ok(self.grant(owner, size)?.is_some())
    }

    /// Attempts to allocate `size` units to `owner`, returning the granted
    /// block.
    ///
    /// The granted block is the smallest power of two not less than `size`.
    /// It is carved out of the free block with the lowest offset that can
    /// hold it, by halving that block repeatedly; each back half goes onto
    /// the free list of its order and the front half is kept.
    ///
    /// Returns `Ok(None)` if no free block is large enough.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidRequest`] if `size` is zero.
    pub fn grant(&mut self, owner: O, size: usize) -> Result<Option<Grant>, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidRequest);
        }

        let target_order = match self.order_for(size) {
            Some(o) => o,
            None => {
                debug!("buddy: allocation failure: {} exceeds the largest block", size);
                return Ok(None);
            }
        };

        // First fit in offset order: the lowest free offset among all orders
        // large enough to hold the request.
        let found = (target_order..)
            .zip(&self.levels[target_order as usize..])
            .filter_map(|(order, level)| level.first_free().map(|ofs| (ofs, order)))
            .min();

        let Some((block_ofs, init_order)) = found else {
            debug!(
                "buddy: allocation failure: no free block of {} or more",
                1usize << target_order
            );
            return Ok(None);
        };

        let key = owner.clone();

        self.levels[init_order as usize].free_list_remove(block_ofs);

        // Split the block repeatedly. The offset of the front half does not
        // change.
        for order in (target_order..init_order).rev() {
            let level = &mut self.levels[order as usize];
            let back_half = block_ofs + level.block_size;

            trace!(
                "buddy: split {} at offset {} into two {} blocks",
                level.block_size * 2,
                block_ofs,
                level.block_size
            );

            level.free_list_push(back_half);
        }

        self.allocated.insert(
            block_ofs,
            Allocation {
                order: target_order,
                owner,
            },
        );
        self.owners.entry(key).or_default().insert(block_ofs);

        let grant = Grant {
            offset: block_ofs,
            size: 1 << target_order,
        };

        debug!(
            "buddy: granted {} at offset {} for a request of {}",
            grant.size,
            grant.offset,
            size
        );

        Ok(Some(grant))
    }

    /// Releases the block held by `owner`.
    ///
    /// If `owner` holds several blocks, only the one with the lowest offset
    /// is released. The freed block is then coalesced with its buddy for as
    /// long as the buddy is free.
    ///
    /// Returns `false`, changing nothing, if `owner` holds no block.
    pub fn release(&mut self, owner: &O) -> bool {
        let Some(offsets) = self.owners.get_mut(owner) else {
            debug!("buddy: release: owner holds no block");
            return false;
        };

        let block_ofs = offsets.pop_first().expect("owner entry with no blocks");
        if offsets.is_empty() {
            self.owners.remove(owner);
        }

        let Allocation { order, .. } = self
            .allocated
            .remove(&block_ofs)
            .expect("owner index names an unallocated block");

        debug!(
            "buddy: released {} at offset {}",
            1usize << order,
            block_ofs
        );

        self.coalesce(block_ofs, order);

        true
    }

    /// Returns a freed block to the free lists, merging it with its buddy
    /// until the buddy is not free or the root is reached.
    fn coalesce(&mut self, block_ofs: usize, order: u32) {
        let root_order = self.root_order(block_ofs);

        let mut block = Some(block_ofs);
        for order in order..=root_order {
            match block.take() {
                Some(ofs) => {
                    block = self.levels[order as usize].free(ofs, order < root_order);

                    if block.is_some() {
                        debug!(
                            "buddy: merged two {} blocks into one {} block",
                            1usize << order,
                            1usize << (order + 1)
                        );
                    }
                }
                None => break,
            }
        }

        assert!(block.is_none(), "root coalesced a block");
    }

    /// Returns a view of every block, in offset order.
    ///
    /// The blocks tile the whole capacity: each block starts where the
    /// previous one ends, and their sizes sum to [`capacity`](Self::capacity).
    pub fn snapshot(&self) -> Vec<BlockView<'_, O>> {
        let free = self.levels.iter().flat_map(|level| {
            level.free_list.iter().map(move |&offset| BlockView {
                offset,
                size: level.block_size,
                status: BlockStatus::Free,
            })
        });

        let allocated = self.allocated.iter().map(|(&offset, a)| BlockView {
            offset,
            size: 1 << a.order,
            status: BlockStatus::Allocated { owner: &a.owner },
        });

        let mut blocks: Vec<_> = free.chain(allocated).collect();
        blocks.sort_unstable_by_key(|b| b.offset);

        blocks
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;

    type Owner = &'static str;

    /// Returns `(size, owner)` for each block in offset order.
    fn layout(buddy: &BuddyAllocator<Owner>) -> Vec<(usize, Option<Owner>)> {
        buddy
            .snapshot()
            .iter()
            .map(|b| (b.size, b.status.owner().copied()))
            .collect()
    }

    #[test]
    fn create_and_destroy() {
        let buddy = BuddyAllocator::<Owner>::try_new(1024).unwrap();
        assert_eq!(layout(&buddy), [(1024, None)]);
        assert_eq!(buddy.capacity(), 1024);
        assert_eq!(buddy.max_block_size(), 1024);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            BuddyAllocator::<Owner>::try_new(0),
            Err(AllocInitError::InvalidCapacity)
        ));
    }

    #[test]
    fn grant_rounds_up_to_power_of_two() {
        for (request, granted) in [(1, 1), (10, 16), (16, 16), (17, 32), (200, 256), (1024, 1024)] {
            let mut buddy = BuddyAllocator::try_new(1024).unwrap();
            let grant = buddy.grant("a", request).unwrap().unwrap();
            assert_eq!(grant, Grant { offset: 0, size: granted }, "request {request}");
        }
    }

    #[test]
    fn allocate_and_release_1024() {
        let mut buddy = BuddyAllocator::try_new(1024).unwrap();

        assert_eq!(buddy.allocate("A", 200), Ok(true));
        assert_eq!(layout(&buddy), [(256, Some("A")), (256, None), (512, None)]);

        let free: usize = buddy
            .snapshot()
            .iter()
            .filter(|b| b.status.is_free())
            .map(|b| b.size)
            .sum();
        assert_eq!(free, 768);

        assert_eq!(
            buddy.grant("B", 100),
            Ok(Some(Grant {
                offset: 256,
                size: 128
            }))
        );
        assert_eq!(
            layout(&buddy),
            [(256, Some("A")), (128, Some("B")), (128, None), (512, None)]
        );

        // A's buddy was split for B, so nothing merges yet.
        assert!(buddy.release(&"A"));
        assert_eq!(
            layout(&buddy),
            [(256, None), (128, Some("B")), (128, None), (512, None)]
        );

        assert!(!buddy.release(&"Z"));
        assert_eq!(
            layout(&buddy),
            [(256, None), (128, Some("B")), (128, None), (512, None)]
        );

        // Releasing B cascades all the way back to the root.
        assert!(buddy.release(&"B"));
        assert_eq!(layout(&buddy), [(1024, None)]);
    }

    #[test]
    fn root_sized_request_does_not_split() {
        let mut buddy = BuddyAllocator::try_new(8).unwrap();

        assert_eq!(buddy.allocate("A", 8), Ok(true));
        assert_eq!(layout(&buddy), [(8, Some("A"))]);

        assert_eq!(buddy.allocate("B", 1), Ok(false));
        assert_eq!(layout(&buddy), [(8, Some("A"))]);
    }

    #[test]
    fn zero_request_is_rejected() {
        let mut buddy = BuddyAllocator::try_new(64).unwrap();
        buddy.allocate("A", 4).unwrap();
        let before = layout(&buddy);

        assert_eq!(buddy.allocate("B", 0), Err(AllocError::InvalidRequest));
        assert_eq!(layout(&buddy), before);
    }

    #[test]
    fn oversized_request_fails() {
        let mut buddy = BuddyAllocator::try_new(1000).unwrap();

        assert_eq!(buddy.allocate("A", 600), Ok(false));
        assert_eq!(buddy.allocate("A", usize::MAX), Ok(false));
        assert_eq!(buddy.snapshot().len(), 6);

        assert_eq!(buddy.allocate("A", 300), Ok(true));
        assert_eq!(buddy.snapshot()[0].size, 512);
    }

    #[test]
    fn capacity_decomposes_into_roots() {
        let buddy = BuddyAllocator::<Owner>::try_new(1000).unwrap();
        let blocks: Vec<(usize, usize)> =
            buddy.snapshot().iter().map(|b| (b.offset, b.size)).collect();

        assert_eq!(
            blocks,
            [(0, 512), (512, 256), (768, 128), (896, 64), (960, 32), (992, 8)]
        );
        assert_eq!(buddy.max_block_size(), 512);
    }

    #[test]
    fn roots_never_coalesce() {
        let mut buddy = BuddyAllocator::try_new(12).unwrap();

        let offsets: Vec<usize> = ["A", "B", "C"]
            .into_iter()
            .map(|owner| buddy.grant(owner, 4).unwrap().unwrap().offset)
            .collect();
        assert_eq!(offsets, [0, 4, 8]);

        for owner in ["A", "B", "C"] {
            assert!(buddy.release(&owner));
        }

        assert_eq!(layout(&buddy), [(8, None), (4, None)]);
    }

    #[test]
    fn non_buddies_never_coalesce() {
        let mut buddy = BuddyAllocator::try_new(16).unwrap();
        for owner in ["A", "B", "C", "D"] {
            assert_eq!(buddy.allocate(owner, 4), Ok(true));
        }

        // The blocks at 4 and 8 are adjacent and the same size, but they were
        // split from different parents.
        assert!(buddy.release(&"B"));
        assert!(buddy.release(&"C"));
        assert_eq!(
            layout(&buddy),
            [(4, Some("A")), (4, None), (4, None), (4, Some("D"))]
        );
        assert_eq!(buddy.allocate("E", 8), Ok(false));

        assert!(buddy.release(&"A"));
        assert_eq!(layout(&buddy), [(8, None), (4, None), (4, Some("D"))]);
    }

    #[test]
    fn first_fit_prefers_lowest_offset() {
        let mut buddy = BuddyAllocator::try_new(16).unwrap();
        buddy.allocate("A", 8).unwrap();
        buddy.allocate("B", 4).unwrap();
        buddy.release(&"A");
        assert_eq!(layout(&buddy), [(8, None), (4, Some("B")), (4, None)]);

        // A 4-block is free at offset 12, but the 8-block at offset 0 comes
        // first and is split instead.
        assert_eq!(
            buddy.grant("C", 4),
            Ok(Some(Grant { offset: 0, size: 4 }))
        );
        assert_eq!(
            layout(&buddy),
            [(4, Some("C")), (4, None), (4, Some("B")), (4, None)]
        );
    }

    #[test]
    fn release_takes_lowest_block_of_owner() {
        let mut buddy = BuddyAllocator::try_new(8).unwrap();
        buddy.allocate("A", 2).unwrap();
        buddy.allocate("A", 2).unwrap();

        assert!(buddy.release(&"A"));
        assert_eq!(layout(&buddy), [(2, None), (2, Some("A")), (4, None)]);

        assert!(buddy.release(&"A"));
        assert_eq!(layout(&buddy), [(8, None)]);

        assert!(!buddy.release(&"A"));
    }

    #[test]
    fn coalesce_many() {
        const CAPACITY: usize = 256;

        let mut buddy = BuddyAllocator::try_new(CAPACITY).unwrap();

        for order in 0..=CAPACITY.ilog2() {
            let size = 1usize << order;
            let count = CAPACITY / size;

            for i in 0..count {
                assert_eq!(buddy.grant(i, size), Ok(Some(Grant { offset: i * size, size })));
            }
            assert_eq!(buddy.allocate(count, 1), Ok(false));

            // Free in reverse so that every merge happens on the second
            // release of a pair.
            for i in (0..count).rev() {
                assert!(buddy.release(&i));
            }

            let blocks = buddy.snapshot();
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0].size, CAPACITY);
        }
    }
}
