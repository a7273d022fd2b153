// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::carrier::Carrier;
use crate::carrier::CarrierClass;
use crate::carrier::CarrierId;
use crate::error::Inconsistency;
use crate::header::BlockHeader;
use crate::header::CarrierHeader;
use crate::header::BLOCK_HEADER_SIZE;
use crate::header::SBC_HEADER_SIZE;
use crate::header::UNIT_SIZE;
use crate::index::BlockRef;
use crate::index::FreeBlock;
use crate::index::FreeBlockIndex;
use crate::store::StoreKind;
use crate::AllocatorInner;
use serde::Serialize;

/// Walks the blocks of a carrier in address order, following the size in each header.
///
/// The walk stops after the block flagged as last, or as soon as a header would lie outside the
/// carrier.
#[derive(Clone, Debug)]
pub(crate) struct CarrierBlocks<'a> {
    id: CarrierId,
    carrier: &'a Carrier,
    offset: Option<usize>,
}

impl<'a> CarrierBlocks<'a> {
    pub(crate) const fn new(id: CarrierId, carrier: &'a Carrier, first: usize) -> Self {
        Self {
            id,
            carrier,
            offset: Some(first),
        }
    }
}

impl Iterator for CarrierBlocks<'_> {
    type Item = (BlockRef, BlockHeader);

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset.take()?;
        if offset + BLOCK_HEADER_SIZE > self.carrier.size() {
            return None;
        }
        let header = self.carrier.block_header(offset);
        if !header.is_last() && header.size != 0 {
            self.offset = offset.checked_add(header.size);
        }
        Some((BlockRef::new(self.id, offset), header))
    }
}

/// One block, as listed by [`Allocator::blocks`](crate::Allocator::blocks).
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize)]
pub struct BlockInfo {
    /// The carrier holding the block.
    pub carrier: CarrierId,
    /// Class of that carrier.
    pub class: CarrierClass,
    /// Store that carrier came from.
    pub store: StoreKind,
    /// Offset of the block header within the carrier.
    pub offset: usize,
    /// Block size, header included.
    pub size: usize,
    /// Whether the block is free.
    pub free: bool,
}

#[derive(Copy, Clone, Default, Debug)]
struct Tally {
    blocks: usize,
    blocks_size: usize,
    carriers: usize,
    carriers_size: usize,
    free_blocks: usize,
}

impl<I: FreeBlockIndex> AllocatorInner<I> {
    fn first_block_offset(&self, class: CarrierClass) -> usize {
        match class {
            CarrierClass::MultiBlock => self.geometry.mbc_header_size,
            CarrierClass::SingleBlock => SBC_HEADER_SIZE,
        }
    }

    pub(crate) fn blocks(&self) -> Vec<BlockInfo> {
        let mut blocks = Vec::new();
        for class in [CarrierClass::MultiBlock, CarrierClass::SingleBlock] {
            let first = self.first_block_offset(class);
            for (id, carrier) in self.carriers.iter(class) {
                blocks.extend(CarrierBlocks::new(id, carrier, first).map(|(block, header)| {
                    BlockInfo {
                        carrier: id,
                        class,
                        store: carrier.store,
                        offset: block.offset(),
                        size: header.size,
                        free: header.is_free(),
                    }
                }));
            }
        }
        blocks
    }

    /// Checks every carrier, every block and the free-block index against each other.
    pub(crate) fn verify(&self) -> Result<(), Inconsistency> {
        let mut free_blocks = 0;

        for class in [CarrierClass::MultiBlock, CarrierClass::SingleBlock] {
            let mut tally = Tally::default();
            let mut prev = None;

            for (id, carrier) in self.carriers.iter(class) {
                if carrier.prev != prev || carrier.class != class {
                    return Err(Inconsistency::Link { carrier: id });
                }
                let expected = CarrierHeader {
                    size: carrier.size(),
                    class,
                    store: carrier.store,
                };
                if carrier.header() != expected || carrier.recorded_id() != id.index() {
                    return Err(Inconsistency::CarrierHeader { carrier: id });
                }

                match class {
                    CarrierClass::MultiBlock => self.verify_mbc(id, carrier, &mut tally)?,
                    CarrierClass::SingleBlock => self.verify_sbc(id, carrier, &mut tally)?,
                }
                tally.carriers += 1;
                tally.carriers_size += carrier.size();
                prev = Some(id);
            }

            let list = self.carriers.list(class);
            if list.last != prev {
                let carrier = list.last.or(prev).unwrap_or(CarrierId::MIN);
                return Err(Inconsistency::Link { carrier });
            }

            let stats = match class {
                CarrierClass::MultiBlock => &self.stats.mbcs,
                CarrierClass::SingleBlock => &self.stats.sbcs,
            };
            for (what, recorded, actual) in [
                ("blocks", stats.blocks.current, tally.blocks),
                ("blocks size", stats.blocks_size.current, tally.blocks_size),
                ("carriers", stats.carriers.current, tally.carriers),
                ("carriers size", stats.carriers_size.current, tally.carriers_size),
            ] {
                if recorded != actual {
                    return Err(Inconsistency::Statistics {
                        what,
                        recorded,
                        actual,
                    });
                }
            }

            free_blocks += tally.free_blocks;
        }

        if self.index.len() != free_blocks {
            return Err(Inconsistency::IndexSize {
                indexed: self.index.len(),
                free: free_blocks,
            });
        }

        Ok(())
    }

    fn verify_mbc(
        &self,
        id: CarrierId,
        carrier: &Carrier,
        tally: &mut Tally,
    ) -> Result<(), Inconsistency> {
        let min = self.geometry.min_block_size;
        let mut end = self.geometry.mbc_header_size;
        let mut prev_free = false;
        let mut seen_last = false;

        for (block, header) in CarrierBlocks::new(id, carrier, end) {
            let offset = block.offset();
            let size = header.size;

            if size % UNIT_SIZE != 0 {
                return Err(Inconsistency::Unaligned {
                    carrier: id,
                    offset,
                    size,
                });
            }
            if size < min {
                return Err(Inconsistency::TooSmall {
                    carrier: id,
                    offset,
                    size,
                    min,
                });
            }
            if header.is_prev_free() != prev_free {
                return Err(Inconsistency::PrevFree { carrier: id, offset });
            }

            end = offset + size;
            if end > carrier.size() {
                return Err(Inconsistency::Span {
                    carrier: id,
                    end,
                    carrier_size: carrier.size(),
                });
            }

            if header.is_free() {
                if prev_free {
                    return Err(Inconsistency::AdjacentFree { carrier: id, offset });
                }
                if !header.is_last() && carrier.footer(end) != size {
                    return Err(Inconsistency::Footer {
                        carrier: id,
                        offset,
                        size,
                        footer: carrier.footer(end),
                    });
                }
                if !self.index.contains(FreeBlock { block, size }) {
                    return Err(Inconsistency::NotIndexed { carrier: id, offset });
                }
                tally.free_blocks += 1;
            } else {
                tally.blocks += 1;
                tally.blocks_size += size;
            }

            prev_free = header.is_free();
            seen_last = header.is_last();
        }

        if !seen_last {
            return Err(Inconsistency::LastFlag {
                carrier: id,
                offset: end,
            });
        }
        if carrier.size() - end >= UNIT_SIZE {
            return Err(Inconsistency::Span {
                carrier: id,
                end,
                carrier_size: carrier.size(),
            });
        }
        Ok(())
    }

    fn verify_sbc(
        &self,
        id: CarrierId,
        carrier: &Carrier,
        tally: &mut Tally,
    ) -> Result<(), Inconsistency> {
        let header = carrier.block_header(SBC_HEADER_SIZE);
        let size = header.size;

        if header.is_free() || header.is_prev_free() || !header.is_last() {
            return Err(Inconsistency::SingleBlockShape { carrier: id });
        }
        if size % UNIT_SIZE != 0 {
            return Err(Inconsistency::Unaligned {
                carrier: id,
                offset: SBC_HEADER_SIZE,
                size,
            });
        }
        if size < self.geometry.min_block_size {
            return Err(Inconsistency::TooSmall {
                carrier: id,
                offset: SBC_HEADER_SIZE,
                size,
                min: self.geometry.min_block_size,
            });
        }
        if SBC_HEADER_SIZE + size > carrier.size() {
            return Err(Inconsistency::Span {
                carrier: id,
                end: SBC_HEADER_SIZE + size,
                carrier_size: carrier.size(),
            });
        }

        tally.blocks += 1;
        tally.blocks_size += size;
        Ok(())
    }
}
