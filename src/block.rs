// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! The block engine: carving, merging and resizing blocks inside multi-block carriers.
//!
//! Every block starts with a one-word header holding its size and flags. A free block that is
//! not the last one in its carrier also ends with a one-word footer repeating its size: the block
//! after it has the previous-free flag set, and can find the start of its free neighbor by reading
//! the word just before its own header.
//!
//! The engine never leaves two free blocks next to each other: freeing a block merges it with its
//! free neighbors, and the free-block index is updated in the same step as the flags.

use crate::carrier::CarrierClass;
use crate::carrier::CarrierRequest;
use crate::header::BlockFlags;
use crate::header::BlockHeader;
use crate::header::BLOCK_HEADER_SIZE;
use crate::index::BlockRef;
use crate::index::FreeBlock;
use crate::index::FreeBlockIndex;
use crate::store::StoreKind;
use crate::AllocatorInner;
use crate::Handle;
use log::trace;
use log::warn;

#[inline]
#[must_use]
const fn free_flags(last: bool) -> BlockFlags {
    if last {
        BlockFlags::FREE.union(BlockFlags::LAST)
    } else {
        BlockFlags::FREE
    }
}

impl<I: FreeBlockIndex> AllocatorInner<I> {
    #[inline]
    pub(crate) fn block_header(&self, block: BlockRef) -> BlockHeader {
        self.carriers
            .carrier(block.carrier())
            .block_header(block.offset())
    }

    #[inline]
    fn set_block_header(&mut self, block: BlockRef, header: BlockHeader) {
        self.carriers
            .carrier_mut(block.carrier())
            .set_block_header(block.offset(), header);
    }

    #[inline]
    fn set_footer(&mut self, block: BlockRef, size: usize) {
        self.carriers
            .carrier_mut(block.carrier())
            .set_footer(block.offset(), size);
    }

    #[inline]
    fn set_prev_free(&mut self, block: BlockRef, value: bool) {
        let mut header = self.block_header(block);
        header.set_prev_free(value);
        self.set_block_header(block, header);
    }

    /// Writes a free block, its footer if it has a successor, and adds it to the index.
    fn install_free_block(&mut self, block: BlockRef, size: usize, last: bool) {
        self.set_block_header(block, BlockHeader::new(size, free_flags(last)));
        if !last {
            self.set_footer(block, size);
        }
        self.index.insert(FreeBlock { block, size });
    }

    #[inline]
    pub(crate) fn is_first_block(&self, block: BlockRef) -> bool {
        block.offset() == self.geometry.mbc_header_size
    }

    #[inline]
    fn block_after(block: BlockRef, size: usize) -> BlockRef {
        BlockRef::new(block.carrier(), block.offset() + size)
    }

    /// The block before `block`, which must be flagged as preceded by a free block.
    fn block_before(&self, block: BlockRef) -> BlockRef {
        let size = self
            .carriers
            .carrier(block.carrier())
            .footer(block.offset());
        BlockRef::new(block.carrier(), block.offset() - size)
    }

    /// Allocates a block for `size` bytes from a multi-block carrier, creating one if needed.
    pub(crate) fn mbc_alloc(&mut self, size: usize) -> Option<Handle> {
        let block_size = self.geometry.block_size(size);

        let free = match self.index.find(block_size) {
            Some(free) => free,
            None => {
                let request = CarrierRequest::default();
                match self.create_carrier(size, CarrierClass::MultiBlock, request) {
                    Some(block) => FreeBlock {
                        block,
                        size: self.block_header(block).size,
                    },
                    None => return self.emergency_alloc(size),
                }
            }
        };

        let block = free.block;
        let mut header = self.block_header(block);
        debug_assert!(header.is_free(), "index returned an allocated block");
        debug_assert_eq!(header.size, free.size, "index returned a stale block size");
        debug_assert!(header.size >= block_size, "index returned a block too small");
        let last = header.is_last();

        let allocated_size = if header.size - self.geometry.min_block_size >= block_size {
            let rest = header.size - block_size;
            self.install_free_block(Self::block_after(block, block_size), rest, last);
            header.size = block_size;
            header.set_last(false);
            trace!(
                "{}: split block {block:?}, {rest} bytes left free",
                self.config.name
            );
            block_size
        } else {
            if !last {
                self.set_prev_free(Self::block_after(block, header.size), false);
            }
            header.size
        };

        header.set_free(false);
        self.set_block_header(block, header);
        self.stats.mbcs.block_allocated(allocated_size);
        Some(Handle::from_block(block))
    }

    /// Last resort when no multi-block carrier can be created: a single-block carrier of the
    /// exact size from the generic store.
    fn emergency_alloc(&mut self, size: usize) -> Option<Handle> {
        warn!(
            "{}: no multi-block carrier for {size} bytes, falling back to a single-block carrier",
            self.config.name
        );
        let request = CarrierRequest {
            force_store: Some(StoreKind::Generic),
            exact_size: true,
            main: false,
        };
        self.create_carrier(size, CarrierClass::SingleBlock, request)
            .map(Handle::from_block)
    }

    /// Frees an allocated block of a multi-block carrier, merging it with its free neighbors.
    pub(crate) fn mbc_free(&mut self, block: BlockRef) {
        let header = self.block_header(block);
        debug_assert!(!header.is_free(), "block {block:?} freed twice");
        self.stats.mbcs.block_freed(header.size);

        let mut block = block;
        let mut size = header.size;
        let mut last = header.is_last();

        if !self.is_first_block(block) && header.is_prev_free() {
            let prev = self.block_before(block);
            let prev_size = self.block_header(prev).size;
            self.index.remove(FreeBlock {
                block: prev,
                size: prev_size,
            });
            size += prev_size;
            block = prev;
            trace!("{}: merged into previous block {block:?}", self.config.name);
        }

        if !last {
            let next = Self::block_after(block, size);
            let next_header = self.block_header(next);
            if next_header.is_free() {
                self.index.remove(FreeBlock {
                    block: next,
                    size: next_header.size,
                });
                size += next_header.size;
                last = next_header.is_last();
                trace!("{}: merged next block {next:?}", self.config.name);
            } else {
                self.set_prev_free(next, true);
            }
        }

        let carrier = block.carrier();
        if self.is_first_block(block) && last && self.main_carrier != Some(carrier) {
            self.destroy_carrier(carrier);
            return;
        }

        self.install_free_block(block, size, last);
    }

    /// Resizes an allocated block of a multi-block carrier, in place when possible.
    pub(crate) fn mbc_realloc(&mut self, block: BlockRef, size: usize) -> Option<Handle> {
        let handle = Handle::from_block(block);
        let mut header = self.block_header(block);
        let old_size = header.size;
        let block_size = self.geometry.block_size(size);
        let min_block_size = self.geometry.min_block_size;

        if block_size == old_size {
            return Some(handle);
        }

        let last = header.is_last();
        let next = Self::block_after(block, old_size);

        if block_size < old_size {
            let mut rest = old_size - block_size;
            let next_free = !last && self.block_header(next).is_free();
            if !next_free && rest < min_block_size {
                // Not worth a block of its own: keep the slack.
                return Some(handle);
            }

            let mut rest_last = last;
            if next_free {
                let next_header = self.block_header(next);
                self.index.remove(FreeBlock {
                    block: next,
                    size: next_header.size,
                });
                rest += next_header.size;
                rest_last = next_header.is_last();
            } else if !last {
                self.set_prev_free(next, true);
            }

            header.size = block_size;
            header.set_last(false);
            self.set_block_header(block, header);
            self.install_free_block(Self::block_after(block, block_size), rest, rest_last);

            self.stats.mbcs.block_freed(old_size);
            self.stats.mbcs.block_allocated(block_size);
            trace!(
                "{}: shrank block {block:?} from {old_size} to {block_size} bytes",
                self.config.name
            );
            return Some(handle);
        }

        if !last {
            let next_header = self.block_header(next);
            if next_header.is_free() && block_size <= old_size + next_header.size {
                self.index.remove(FreeBlock {
                    block: next,
                    size: next_header.size,
                });
                let combined = old_size + next_header.size;
                let rest = combined - block_size;
                let next_last = next_header.is_last();

                let new_size = if rest < min_block_size {
                    header.set_last(next_last);
                    if !next_last {
                        self.set_prev_free(Self::block_after(block, combined), false);
                    }
                    combined
                } else {
                    self.install_free_block(Self::block_after(block, block_size), rest, next_last);
                    block_size
                };

                header.size = new_size;
                self.set_block_header(block, header);
                self.stats.mbcs.block_freed(old_size);
                self.stats.mbcs.block_allocated(new_size);
                trace!(
                    "{}: grew block {block:?} in place from {old_size} to {new_size} bytes",
                    self.config.name
                );
                return Some(handle);
            }
        }

        let new_handle = self.mbc_alloc(size)?;
        let len = size.min(old_size - BLOCK_HEADER_SIZE);
        self.carriers.copy_payload(handle, new_handle, len);
        self.mbc_free(block);
        Some(new_handle)
    }
}
