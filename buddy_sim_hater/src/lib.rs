use alloc_hater::{Block, Subject};
use buddy_sim::{AllocInitError, BuddyAllocator, Grant};

pub struct BuddySubject(BuddyAllocator<u8>);

impl BuddySubject {
    pub fn new(capacity: usize) -> Result<Self, AllocInitError> {
        let b = BuddyAllocator::try_new(capacity)?;
        Ok(BuddySubject(b))
    }
}

impl Subject for BuddySubject {
    type AllocError = buddy_sim::AllocError;

    fn capacity(&self) -> usize {
        self.0.capacity()
    }

    fn allocate(&mut self, owner: u8, size: usize) -> Result<Option<Block>, Self::AllocError> {
        let grant = self.0.grant(owner, size)?;
        Ok(grant.map(|Grant { offset, size }| Block::held(offset, size, owner)))
    }

    fn release(&mut self, owner: u8) -> bool {
        self.0.release(&owner)
    }

    fn blocks(&self) -> Vec<Block> {
        self.0
            .snapshot()
            .iter()
            .map(|b| Block {
                offset: b.offset,
                size: b.size,
                owner: b.status.owner().copied(),
            })
            .collect()
    }
}
