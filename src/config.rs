// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::error::StartError;
use crate::header::unit_ceiling;
use crate::header::BLOCK_FOOTER_SIZE;
use crate::header::BLOCK_HEADER_SIZE;
use crate::header::CARRIER_HEADER_SIZE;
use crate::header::UNIT_SIZE;
use crate::header::WORD_SIZE;
use crate::store::StoreKind;
use serde::Deserialize;
use serde::Serialize;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Decides whether a single-block carrier that shrinks below the single-block threshold is
/// resized in place (`true`) or has its payload moved into a multi-block carrier (`false`).
///
/// The arguments are the carrier size the shrunk allocation would need, the bytes it would
/// actually use, and [`Config::resize_move_threshold`].
pub type MovePolicy = fn(carrier_size: usize, used_size: usize, threshold: usize) -> bool;

/// Keeps the carrier in place as long as the wasted share of it, in percent, is below
/// `threshold`.
#[must_use]
pub fn waste_below_threshold(carrier_size: usize, used_size: usize, threshold: usize) -> bool {
    if carrier_size == 0 {
        return true;
    }
    let waste = carrier_size.saturating_sub(used_size) as u128;
    waste * 100 / (carrier_size as u128) < threshold as u128
}

fn default_move_policy() -> MovePolicy {
    waste_below_threshold
}

/// Options for an allocator instance.
///
/// Every field has a default (see [`Config::default`]), and deserialization fills in the
/// fields missing from the input, so a configuration document only needs to mention what it
/// changes:
///
/// ```
/// let config: ladle::Config =
///     serde_json::from_str(r#"{ "name": "binary_alloc", "single_block_threshold": 1024 }"#)
///         .unwrap();
/// assert_eq!(config.single_block_threshold, 1024);
/// assert!(config.thread_safe);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Diagnostic label prefixed to log lines and reports. Must not be empty.
    pub name: String,
    /// Size of the main carrier, created at start and never destroyed. `0` disables it.
    pub main_carrier_size: usize,
    /// Requests of at least this many bytes get a dedicated single-block carrier.
    pub single_block_threshold: usize,
    /// Segment shrinks smaller than this many bytes (and smaller than
    /// [`segment_shrink_threshold_relative`](Self::segment_shrink_threshold_relative)) leave the
    /// segment untouched.
    pub segment_shrink_threshold_absolute: usize,
    /// Segment shrinks smaller than this percentage of the segment (and smaller than
    /// [`segment_shrink_threshold_absolute`](Self::segment_shrink_threshold_absolute)) leave the
    /// segment untouched.
    pub segment_shrink_threshold_relative: usize,
    /// Percentage of wasted carrier space tolerated when a single-block allocation shrinks below
    /// the single-block threshold. Interpreted by [`move_policy`](Self::move_policy).
    pub resize_move_threshold: usize,
    /// Size of the first multi-block carrier after the main one.
    pub smallest_multiblock_carrier_size: usize,
    /// Size multi-block carriers grow to after
    /// [`multiblock_growth_stages`](Self::multiblock_growth_stages) carriers.
    pub largest_multiblock_carrier_size: usize,
    /// Number of carriers over which multi-block carrier sizes grow from smallest to largest.
    pub multiblock_growth_stages: usize,
    /// Cap on single-block carriers backed by the segment store.
    pub max_segment_carriers_single_block: usize,
    /// Cap on multi-block carriers backed by the segment store.
    pub max_segment_carriers_multi_block: usize,
    /// Serialize operations with a lock. When unset, concurrent use of the instance panics.
    pub thread_safe: bool,
    /// Smallest block the block engine will create, before adding the footer and rounding.
    pub min_block_size: usize,
    /// Bytes reserved at the start of every multi-block carrier.
    pub carrier_header_size: usize,
    /// Backing store options.
    pub store: StoreConfig,
    /// See [`MovePolicy`].
    #[serde(skip, default = "default_move_policy")]
    pub move_policy: MovePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::from("ladle"),
            main_carrier_size: 128 * KIB,
            single_block_threshold: 512 * KIB,
            segment_shrink_threshold_absolute: 2 * MIB,
            segment_shrink_threshold_relative: 20,
            resize_move_threshold: 80,
            smallest_multiblock_carrier_size: 256 * KIB,
            largest_multiblock_carrier_size: 5 * MIB,
            multiblock_growth_stages: 10,
            max_segment_carriers_single_block: 256,
            max_segment_carriers_multi_block: 10,
            thread_safe: true,
            min_block_size: 4 * WORD_SIZE,
            carrier_header_size: CARRIER_HEADER_SIZE,
            store: StoreConfig::default(),
            move_policy: default_move_policy(),
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<(), StartError> {
        if self.name.is_empty() {
            return Err(StartError::MissingName);
        }
        if self.min_block_size < BLOCK_HEADER_SIZE {
            return Err(StartError::MinBlockSizeTooSmall {
                min_block_size: self.min_block_size,
                header_size: BLOCK_HEADER_SIZE,
            });
        }
        if self.carrier_header_size < CARRIER_HEADER_SIZE {
            return Err(StartError::CarrierHeaderTooSmall {
                carrier_header_size: self.carrier_header_size,
                record_size: CARRIER_HEADER_SIZE,
            });
        }
        self.store.validate()
    }
}

/// Options for the two backing stores.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Segment size granularity. Segment carriers are aligned to it.
    pub segment_unit_size: usize,
    /// Cap on segments open at once, across both carrier classes.
    pub max_segments: usize,
    /// Generic store carrier sizes are rounded up to this.
    pub generic_granularity: usize,
    /// Total bytes the segment store may hand out, if limited.
    pub segment_memory_limit: Option<usize>,
    /// Total bytes the generic store may hand out, if limited.
    pub generic_memory_limit: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            segment_unit_size: 4 * KIB,
            max_segments: 1024,
            generic_granularity: MIB,
            segment_memory_limit: None,
            generic_memory_limit: None,
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<(), StartError> {
        for (store, size) in [
            (StoreKind::Segment, self.segment_unit_size),
            (StoreKind::Generic, self.generic_granularity),
        ] {
            if !size.is_power_of_two() || size < UNIT_SIZE {
                return Err(StartError::InvalidStoreUnit {
                    store,
                    size,
                    unit: UNIT_SIZE,
                });
            }
        }
        Ok(())
    }
}

/// Requests above this size cannot be represented as a block.
pub(crate) const MAX_REQUEST_SIZE: usize = isize::MAX as usize - 4 * UNIT_SIZE;

/// Sizes derived from a validated [`Config`] at start.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Geometry {
    /// Smallest block, footer included, rounded to the unit.
    pub(crate) min_block_size: usize,
    /// Offset of the first block of a multi-block carrier; keeps payloads unit aligned.
    pub(crate) mbc_header_size: usize,
    pub(crate) single_block_threshold: usize,
    pub(crate) smallest_mbc_size: usize,
    pub(crate) largest_mbc_size: usize,
    pub(crate) growth_stages: usize,
}

impl Geometry {
    pub(crate) fn new(config: &Config) -> Self {
        let min_block_size = config.min_block_size.min(MAX_REQUEST_SIZE);
        let carrier_header_size = config.carrier_header_size.min(MAX_REQUEST_SIZE);
        Self {
            min_block_size: unit_ceiling(min_block_size + WORD_SIZE),
            mbc_header_size: unit_ceiling(
                carrier_header_size + BLOCK_FOOTER_SIZE + BLOCK_HEADER_SIZE,
            ) - BLOCK_HEADER_SIZE,
            single_block_threshold: config.single_block_threshold,
            smallest_mbc_size: config.smallest_multiblock_carrier_size,
            largest_mbc_size: config
                .largest_multiblock_carrier_size
                .max(config.smallest_multiblock_carrier_size),
            growth_stages: config.multiblock_growth_stages.max(1),
        }
    }

    /// Size of the block serving a request of `size` bytes.
    ///
    /// # Panics
    ///
    /// If `size` is above [`MAX_REQUEST_SIZE`].
    #[inline]
    #[track_caller]
    pub(crate) fn block_size(&self, size: usize) -> usize {
        assert!(
            size <= MAX_REQUEST_SIZE,
            "a request of {size} bytes cannot be represented"
        );
        let size = BLOCK_HEADER_SIZE + size;
        if size <= self.min_block_size {
            self.min_block_size
        } else {
            unit_ceiling(size)
        }
    }
}
