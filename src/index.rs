// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! The free-block index: the policy deciding which free block serves a request.
//!
//! The block engine keeps the index in lock-step with the block flags: every block flagged free
//! is in the index, and nothing else is. How the index is organized (and therefore which free
//! block [`find`](FreeBlockIndex::find) picks) is up to the implementation. Two simple
//! strategies are provided: [`AddressOrderFirstFit`] and [`BestFit`].

use crate::carrier::CarrierId;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Location of a block: its carrier and the byte offset of its header within the carrier.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BlockRef {
    carrier: CarrierId,
    offset: usize,
}

impl BlockRef {
    const MIN: Self = Self {
        carrier: CarrierId::MIN,
        offset: 0,
    };

    #[inline]
    #[must_use]
    pub(crate) const fn new(carrier: CarrierId, offset: usize) -> Self {
        Self { carrier, offset }
    }

    /// The carrier holding the block.
    #[inline]
    #[must_use]
    pub const fn carrier(&self) -> CarrierId {
        self.carrier
    }

    /// Offset of the block header from the start of the carrier.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }
}

/// A free block, as handed to and returned by a [`FreeBlockIndex`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct FreeBlock {
    /// Where the block is.
    pub block: BlockRef,
    /// Block size, header included.
    pub size: usize,
}

/// A set of free blocks that can be searched by size.
pub trait FreeBlockIndex {
    /// Removes from the index, and returns, a block of at least `min_size` bytes.
    fn find(&mut self, min_size: usize) -> Option<FreeBlock>;

    /// Adds a block that just became free.
    fn insert(&mut self, block: FreeBlock);

    /// Removes a block that is about to be allocated or merged into a neighbor.
    fn remove(&mut self, block: FreeBlock);

    /// Number of blocks in the index.
    fn len(&self) -> usize;

    /// Whether the index holds no blocks.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `block` is in the index, with that size.
    fn contains(&self, block: FreeBlock) -> bool;

    /// Called after a multi-block carrier is created.
    fn carrier_created(&mut self, _carrier: CarrierId) {}

    /// Called before a multi-block carrier is released. The index must drop every reference it
    /// holds into it.
    fn carrier_destroyed(&mut self, _carrier: CarrierId) {}
}

/// Picks the free block at the lowest (carrier, offset) position that is large enough.
#[derive(Clone, Default, Debug)]
pub struct AddressOrderFirstFit {
    blocks: BTreeMap<BlockRef, usize>,
}

impl AddressOrderFirstFit {
    /// Creates an empty index.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FreeBlockIndex for AddressOrderFirstFit {
    fn find(&mut self, min_size: usize) -> Option<FreeBlock> {
        let (&block, &size) = self.blocks.iter().find(|(_, &size)| size >= min_size)?;
        self.blocks.remove(&block);
        Some(FreeBlock { block, size })
    }

    fn insert(&mut self, block: FreeBlock) {
        let previous = self.blocks.insert(block.block, block.size);
        debug_assert!(previous.is_none(), "block {:?} indexed twice", block.block);
    }

    fn remove(&mut self, block: FreeBlock) {
        let previous = self.blocks.remove(&block.block);
        debug_assert_eq!(previous, Some(block.size), "block {:?} not indexed", block.block);
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn contains(&self, block: FreeBlock) -> bool {
        self.blocks.get(&block.block) == Some(&block.size)
    }

    fn carrier_destroyed(&mut self, carrier: CarrierId) {
        self.blocks.retain(|block, _| block.carrier() != carrier);
    }
}

/// Picks the smallest free block that is large enough, breaking ties by position.
#[derive(Clone, Default, Debug)]
pub struct BestFit {
    blocks: BTreeSet<(usize, BlockRef)>,
}

impl BestFit {
    /// Creates an empty index.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FreeBlockIndex for BestFit {
    fn find(&mut self, min_size: usize) -> Option<FreeBlock> {
        let &(size, block) = self.blocks.range((min_size, BlockRef::MIN)..).next()?;
        self.blocks.remove(&(size, block));
        Some(FreeBlock { block, size })
    }

    fn insert(&mut self, block: FreeBlock) {
        let inserted = self.blocks.insert((block.size, block.block));
        debug_assert!(inserted, "block {:?} indexed twice", block.block);
    }

    fn remove(&mut self, block: FreeBlock) {
        let removed = self.blocks.remove(&(block.size, block.block));
        debug_assert!(removed, "block {:?} not indexed", block.block);
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn contains(&self, block: FreeBlock) -> bool {
        self.blocks.contains(&(block.size, block.block))
    }

    fn carrier_destroyed(&mut self, carrier: CarrierId) {
        self.blocks.retain(|(_, block)| block.carrier() != carrier);
    }
}
