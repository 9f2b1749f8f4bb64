use std::collections::BTreeMap;

use crate::{
    error::IdAllocError,
    types::{RepIdSeed, ReplicaId, MAX_RESERVED_CMD_OR_ID, REPIDS_PER_BLOCK},
};

/// Hands out replica ids from the blocks granted by the sync host. Ids are
/// never returned to a pool: a released id stays retired for the session.
#[derive(Debug, Default)]
pub struct IdAllocator {
    // seed -> next unused id in that block
    blocks: BTreeMap<RepIdSeed, ReplicaId>,
    available: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next unused id, scanning blocks in seed order
    ///
    /// # Panics
    ///
    /// Panics if every block is used up
    pub fn alloc(&mut self) -> ReplicaId {
        self.try_alloc()
            .unwrap_or_else(|err| panic!("IdAllocator: {}", err))
    }

    pub fn try_alloc(&mut self) -> Result<ReplicaId, IdAllocError> {
        for (seed, next) in self.blocks.iter_mut() {
            if *next < seed + REPIDS_PER_BLOCK {
                let id = *next;
                *next += 1;
                self.available -= 1;
                return Ok(id);
            }
        }
        Err(IdAllocError::Exhausted)
    }

    /// Ids are not reused
    pub fn dealloc(&mut self, _id: ReplicaId) {}

    /// # Panics
    ///
    /// Panics if the block is out of range or overlaps a block already held
    pub fn add_block(&mut self, seed: RepIdSeed) {
        if let Err(err) = self.try_add_block(seed) {
            panic!("IdAllocator: {}", err);
        }
    }

    pub fn try_add_block(&mut self, seed: RepIdSeed) -> Result<(), IdAllocError> {
        if seed < MAX_RESERVED_CMD_OR_ID {
            return Err(IdAllocError::BlockOutOfRange { seed });
        }
        let Some(end) = seed.checked_add(REPIDS_PER_BLOCK) else {
            return Err(IdAllocError::BlockOutOfRange { seed });
        };
        let below = self.blocks.range(..=seed).next_back();
        let above = self.blocks.range(seed..end).next();
        if below.is_some_and(|(held, _)| held + REPIDS_PER_BLOCK > seed) || above.is_some() {
            return Err(IdAllocError::BlockOverlap { seed });
        }
        self.blocks.insert(seed, seed);
        self.available += REPIDS_PER_BLOCK;
        Ok(())
    }

    /// Forget a block, giving up only its unused remainder
    pub fn remove_block(&mut self, seed: RepIdSeed) {
        if let Some(next) = self.blocks.remove(&seed) {
            self.available -= seed + REPIDS_PER_BLOCK - next;
        }
    }

    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn has_blocks(&self) -> bool {
        !self.blocks.is_empty()
    }
}
