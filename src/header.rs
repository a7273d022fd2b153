// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! Packed header words for blocks and carriers.
//!
//! Sizes are always multiples of [`UNIT_SIZE`], which leaves the low bits of every size word
//! unused. Those bits carry the block (or carrier) flags, so that an allocated block costs a
//! single machine word of overhead.

use crate::carrier::CarrierClass;
use crate::store::StoreKind;
use core::ops;

macro_rules! const_assert {
    ( $( $tt:tt )* ) => {
        const _: () = assert!($($tt)*);
    }
}

pub(crate) const WORD_SIZE: usize = size_of::<usize>();

/// Allocation unit: every block size is a multiple of this, and every payload is aligned to it.
pub(crate) const UNIT_SIZE: usize = 2 * WORD_SIZE;
const UNIT_MASK: usize = UNIT_SIZE - 1;

pub(crate) const BLOCK_HEADER_SIZE: usize = WORD_SIZE;
pub(crate) const BLOCK_FOOTER_SIZE: usize = WORD_SIZE;

/// Size of the carrier header record: the packed size/flags word followed by the carrier id.
pub(crate) const CARRIER_HEADER_SIZE: usize = 2 * WORD_SIZE;

/// Offset of the only block of a single-block carrier.
///
/// Chosen so that the payload following the block header is unit aligned.
pub(crate) const SBC_HEADER_SIZE: usize =
    unit_ceiling(CARRIER_HEADER_SIZE + BLOCK_HEADER_SIZE) - BLOCK_HEADER_SIZE;

const FLAG_MASK: usize = 0b111;

const_assert!(UNIT_SIZE.is_power_of_two());
const_assert!(UNIT_SIZE > FLAG_MASK);
const_assert!((SBC_HEADER_SIZE + BLOCK_HEADER_SIZE) % UNIT_SIZE == 0);

#[inline]
#[must_use]
pub(crate) const fn unit_ceiling(size: usize) -> usize {
    (size + UNIT_MASK) & !UNIT_MASK
}

#[inline]
#[must_use]
pub(crate) const fn unit_floor(size: usize) -> usize {
    size & !UNIT_MASK
}

/// Like [`unit_ceiling`], but `None` instead of wrapping around.
#[inline]
#[must_use]
pub(crate) fn checked_unit_ceiling(size: usize) -> Option<usize> {
    Some(size.checked_add(UNIT_MASK)? & !UNIT_MASK)
}

/// The flag bits stored in a block header word.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Debug)]
pub(crate) struct BlockFlags(usize);

impl BlockFlags {
    /// This block is free.
    pub(crate) const FREE: Self = Self(1 << 0);
    /// The block immediately before this one is free (so this block is preceded by a footer).
    pub(crate) const PREV_FREE: Self = Self(1 << 1);
    /// This is the last block in its carrier.
    pub(crate) const LAST: Self = Self(1 << 2);

    #[inline]
    #[must_use]
    pub(crate) const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    #[must_use]
    pub(crate) const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub(crate) fn set(&mut self, other: Self, value: bool) {
        if value {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl ops::BitOr for BlockFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Decoded block header: the block size (header included) and its flags.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct BlockHeader {
    pub(crate) size: usize,
    pub(crate) flags: BlockFlags,
}

impl BlockHeader {
    #[inline]
    #[must_use]
    pub(crate) const fn new(size: usize, flags: BlockFlags) -> Self {
        Self { size, flags }
    }

    #[inline]
    #[must_use]
    pub(crate) const fn is_free(&self) -> bool {
        self.flags.contains(BlockFlags::FREE)
    }

    #[inline]
    #[must_use]
    pub(crate) const fn is_prev_free(&self) -> bool {
        self.flags.contains(BlockFlags::PREV_FREE)
    }

    #[inline]
    #[must_use]
    pub(crate) const fn is_last(&self) -> bool {
        self.flags.contains(BlockFlags::LAST)
    }

    #[inline]
    pub(crate) fn set_free(&mut self, value: bool) {
        self.flags.set(BlockFlags::FREE, value);
    }

    #[inline]
    pub(crate) fn set_prev_free(&mut self, value: bool) {
        self.flags.set(BlockFlags::PREV_FREE, value);
    }

    #[inline]
    pub(crate) fn set_last(&mut self, value: bool) {
        self.flags.set(BlockFlags::LAST, value);
    }

    #[inline]
    #[must_use]
    pub(crate) const fn from_word(word: usize) -> Self {
        Self {
            size: word & !FLAG_MASK,
            flags: BlockFlags(word & FLAG_MASK),
        }
    }

    #[inline]
    #[must_use]
    pub(crate) fn to_word(self) -> usize {
        debug_assert_eq!(
            self.size & UNIT_MASK,
            0,
            "`size` must be a multiple of unit"
        );
        self.size | self.flags.0
    }
}

/// Decoded carrier header: the carrier size and the two carrier tags.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct CarrierHeader {
    pub(crate) size: usize,
    pub(crate) class: CarrierClass,
    pub(crate) store: StoreKind,
}

impl CarrierHeader {
    const SEGMENT_FLAG: usize = 1 << 0;
    const SINGLE_BLOCK_FLAG: usize = 1 << 1;

    #[inline]
    #[must_use]
    pub(crate) const fn from_word(word: usize) -> Self {
        let class = if word & Self::SINGLE_BLOCK_FLAG != 0 {
            CarrierClass::SingleBlock
        } else {
            CarrierClass::MultiBlock
        };
        let store = if word & Self::SEGMENT_FLAG != 0 {
            StoreKind::Segment
        } else {
            StoreKind::Generic
        };
        Self {
            size: word & !FLAG_MASK,
            class,
            store,
        }
    }

    #[inline]
    #[must_use]
    pub(crate) fn to_word(self) -> usize {
        debug_assert_eq!(
            self.size & FLAG_MASK,
            0,
            "carrier `size` must leave the flag bits clear"
        );
        let mut word = self.size;
        if self.class == CarrierClass::SingleBlock {
            word |= Self::SINGLE_BLOCK_FLAG;
        }
        if self.store == StoreKind::Segment {
            word |= Self::SEGMENT_FLAG;
        }
        word
    }
}
