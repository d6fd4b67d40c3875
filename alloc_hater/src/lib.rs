//! A small library for ~~hating on~~ evaluating the correctness of buddy
//! allocators.
//!
//! A [`Subject`] is driven through a sequence of [`AllocatorOp`]s by an
//! [`Evaluator`], which checks the subject's block set after every operation.

use std::collections::HashSet;

use arbitrary::{Arbitrary, Unstructured};

/// Number of distinct owners named by generated operations.
pub const NUM_OWNERS: u8 = 8;

/// A request size which implements `Arbitrary`.
///
/// Sizes are spread evenly across powers of two, so small and large requests
/// are equally likely. Zero is included.
#[derive(Copy, Clone, Debug)]
pub struct ArbSize(pub usize);

impl Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut Unstructured<'_>) -> arbitrary::Result<Self> {
        // Select a random bit index and shift to obtain a bound.
        let shift = u8::arbitrary(u)? % usize::BITS as u8;
        let size = usize::arbitrary(u)? % (1 << shift);

        Ok(ArbSize(size))
    }
}

#[derive(Arbitrary)]
enum AllocatorOpTag {
    Allocate,
    Release,
}

/// A single operation on a subject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocatorOp {
    /// Allocate `size` units to `owner`.
    Allocate { owner: u8, size: usize },
    /// Release the first block held by `owner`.
    Release { owner: u8 },
}

impl Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;
        let owner = u8::arbitrary(u)? % NUM_OWNERS;

        let op = match tag {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                owner,
                size: ArbSize::arbitrary(u)?.0,
            },
            AllocatorOpTag::Release => AllocatorOp::Release { owner },
        };

        Ok(op)
    }
}

/// One block of a subject's block set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    pub offset: usize,
    pub size: usize,
    /// The owner holding the block, or `None` if it is free.
    pub owner: Option<u8>,
}

impl Block {
    /// Creates a free block.
    pub fn free(offset: usize, size: usize) -> Block {
        Block {
            offset,
            size,
            owner: None,
        }
    }

    /// Creates a block held by `owner`.
    pub fn held(offset: usize, size: usize, owner: u8) -> Block {
        Block {
            offset,
            size,
            owner: Some(owner),
        }
    }
}

/// An allocator under evaluation.
pub trait Subject {
    type AllocError;

    /// Returns the number of units managed by the subject.
    fn capacity(&self) -> usize;

    /// Allocates `size` units to `owner`.
    ///
    /// Returns the granted block, or `None` if no block was large enough.
    fn allocate(&mut self, owner: u8, size: usize) -> Result<Option<Block>, Self::AllocError>;

    /// Releases the first block held by `owner`, returning whether one was
    /// held.
    fn release(&mut self, owner: u8) -> bool;

    /// Returns every block, in offset order.
    fn blocks(&self) -> Vec<Block>;
}

/// A broken rule, found after an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    /// The block at `offset` does not start where the previous block ended.
    Gap { offset: usize },
    /// The blocks end at `end` rather than at the capacity.
    Length { end: usize, capacity: usize },
    /// A block size is not a power of two.
    NotPowerOfTwo { offset: usize, size: usize },
    /// A block offset is not a multiple of its size.
    Misaligned { offset: usize, size: usize },
    /// A free block and its free buddy were left unmerged.
    Uncoalesced { offset: usize, size: usize },
    /// A granted block has the wrong size or owner, or is missing.
    WrongGrant { requested: usize, granted: Block },
    /// An allocation failed although a large enough block was free.
    SpuriousFailure { requested: usize },
    /// A request was rejected or accepted against its size.
    Rejection { requested: usize, rejected: bool },
    /// A release reported the wrong outcome.
    Release { owner: u8, held: bool },
    /// A failed operation changed the block set.
    StateChanged,
}

/// The size of the root containing `offset`, in a capacity laid out as one
/// root per set bit, largest first.
fn root_size(capacity: usize, offset: usize) -> usize {
    let mut start = 0;

    for bit in (0..usize::BITS).rev() {
        let size = 1 << bit;
        if capacity & size == 0 {
            continue;
        }

        if offset < start + size {
            return size;
        }

        start += size;
    }

    0
}

/// Checks that `blocks` tile `capacity` as a fully coalesced buddy layout.
pub fn check_blocks(capacity: usize, blocks: &[Block]) -> Result<(), Violation> {
    let mut end = 0;

    for b in blocks {
        if b.offset != end {
            return Err(Violation::Gap { offset: b.offset });
        }

        if !b.size.is_power_of_two() {
            return Err(Violation::NotPowerOfTwo {
                offset: b.offset,
                size: b.size,
            });
        }

        if b.offset % b.size != 0 {
            return Err(Violation::Misaligned {
                offset: b.offset,
                size: b.size,
            });
        }

        end += b.size;
    }

    if end != capacity {
        return Err(Violation::Length { end, capacity });
    }

    let free: HashSet<(usize, usize)> = blocks
        .iter()
        .filter(|b| b.owner.is_none())
        .map(|b| (b.offset, b.size))
        .collect();

    for &(offset, size) in &free {
        if size < root_size(capacity, offset) && free.contains(&(offset ^ size, size)) {
            return Err(Violation::Uncoalesced { offset, size });
        }
    }

    Ok(())
}

/// Checks the outcome of a single allocation.
fn check_allocate<E>(
    res: &Result<Option<Block>, E>,
    owner: u8,
    requested: usize,
    before: &[Block],
    after: &[Block],
) -> Result<(), Violation> {
    match res {
        Err(_) if requested == 0 => Ok(()),
        Err(_) => Err(Violation::Rejection {
            requested,
            rejected: true,
        }),

        Ok(_) if requested == 0 => Err(Violation::Rejection {
            requested,
            rejected: false,
        }),

        Ok(None) => {
            let target = requested.checked_next_power_of_two();
            let fits = before
                .iter()
                .any(|b| b.owner.is_none() && target.is_some_and(|t| b.size >= t));

            if fits {
                Err(Violation::SpuriousFailure { requested })
            } else {
                Ok(())
            }
        }

        Ok(Some(granted)) => {
            let right_size = requested.checked_next_power_of_two() == Some(granted.size);
            let right_owner = granted.owner == Some(owner);

            if right_size && right_owner && after.contains(granted) {
                Ok(())
            } else {
                Err(Violation::WrongGrant {
                    requested,
                    granted: *granted,
                })
            }
        }
    }
}

/// Drives a [`Subject`] and checks it after every operation.
pub struct Evaluator<S: Subject> {
    subject: S,
}

/// The record of a failed evaluation.
#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: AllocatorOp,
    pub violation: Violation,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    /// Returns the subject, as left by the last evaluation.
    pub fn into_subject(self) -> S {
        self.subject
    }

    /// Runs `ops` against the subject, stopping at the first violation.
    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();

        for op in ops {
            if let Err(violation) = self.step(&op) {
                return Err(Failed {
                    completed,
                    failed_op: op,
                    violation,
                });
            }

            completed.push(op);
        }

        Ok(())
    }

    fn step(&mut self, op: &AllocatorOp) -> Result<(), Violation> {
        let before = self.subject.blocks();

        // Whether the operation reported that it changed nothing.
        let unchanged = match *op {
            AllocatorOp::Allocate { owner, size } => {
                let res = self.subject.allocate(owner, size);
                let after = self.subject.blocks();
                check_allocate(&res, owner, size, &before, &after)?;

                !matches!(res, Ok(Some(_)))
            }

            AllocatorOp::Release { owner } => {
                let held = before.iter().any(|b| b.owner == Some(owner));
                if self.subject.release(owner) != held {
                    return Err(Violation::Release { owner, held });
                }

                !held
            }
        };

        let after = self.subject.blocks();
        if unchanged && after != before {
            return Err(Violation::StateChanged);
        }

        check_blocks(self.subject.capacity(), &after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_sizes_follow_binary_layout() {
        // 1000 = 512 + 256 + 128 + 64 + 32 + 8
        assert_eq!(root_size(1000, 0), 512);
        assert_eq!(root_size(1000, 511), 512);
        assert_eq!(root_size(1000, 512), 256);
        assert_eq!(root_size(1000, 992), 8);
        assert_eq!(root_size(1000, 1000), 0);
    }

    #[test]
    fn accepts_coalesced_layout() {
        let blocks = [Block::held(0, 4, 1), Block::free(4, 4), Block::free(8, 8)];
        assert_eq!(check_blocks(16, &blocks), Ok(()));
    }

    #[test]
    fn accepts_adjacent_non_buddies() {
        let blocks = [
            Block::held(0, 4, 1),
            Block::free(4, 4),
            Block::free(8, 4),
            Block::held(12, 4, 2),
        ];
        assert_eq!(check_blocks(16, &blocks), Ok(()));
    }

    #[test]
    fn accepts_separate_roots() {
        let blocks = [Block::free(0, 8), Block::free(8, 4)];
        assert_eq!(check_blocks(12, &blocks), Ok(()));
    }

    #[test]
    fn rejects_uncoalesced_buddies() {
        let blocks = [Block::free(0, 4), Block::free(4, 4), Block::free(8, 8)];
        assert!(matches!(
            check_blocks(16, &blocks),
            Err(Violation::Uncoalesced { size: 4, .. })
        ));
    }

    #[test]
    fn rejects_broken_tiling() {
        assert_eq!(
            check_blocks(16, &[Block::free(0, 8), Block::free(12, 4)]),
            Err(Violation::Gap { offset: 12 })
        );
        assert_eq!(
            check_blocks(16, &[Block::free(0, 8)]),
            Err(Violation::Length {
                end: 8,
                capacity: 16
            })
        );
        assert_eq!(
            check_blocks(16, &[Block::free(0, 6), Block::free(6, 10)]),
            Err(Violation::NotPowerOfTwo { offset: 0, size: 6 })
        );
        assert_eq!(
            check_blocks(12, &[Block::free(0, 4), Block::free(4, 8)]),
            Err(Violation::Misaligned { offset: 4, size: 8 })
        );
    }

    #[test]
    fn ops_decode_from_bytes() {
        let bytes: Vec<u8> = (0..=255).collect();
        let mut u = Unstructured::new(&bytes);

        let ops = Vec::<AllocatorOp>::arbitrary(&mut u).unwrap();
        for op in ops {
            match op {
                AllocatorOp::Allocate { owner, .. } | AllocatorOp::Release { owner } => {
                    assert!(owner < NUM_OWNERS)
                }
            }
        }
    }
}
