// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::carrier::CarrierId;
use crate::store::StoreKind;
use thiserror::Error;

/// Why [`Allocator::start`](crate::Allocator::start) refused to create an instance.
#[derive(Error, Clone, PartialEq, Eq, Debug)]
pub enum StartError {
    /// [`Config::name`](crate::Config::name) is empty.
    #[error("allocator name must not be empty")]
    MissingName,
    /// The minimum block size cannot hold a block header.
    #[error("minimum block size {min_block_size} is below the block header size {header_size}")]
    MinBlockSizeTooSmall {
        /// The configured minimum block size.
        min_block_size: usize,
        /// The block header size.
        header_size: usize,
    },
    /// The multi-block carrier header cannot hold the carrier header record.
    #[error(
        "carrier header size {carrier_header_size} is below the carrier record size {record_size}"
    )]
    CarrierHeaderTooSmall {
        /// The configured carrier header size.
        carrier_header_size: usize,
        /// The carrier header record size.
        record_size: usize,
    },
    /// A store unit or granularity is not a power of two of at least the allocation unit.
    #[error("{store:?} store unit {size} must be a power of two and at least {unit}")]
    InvalidStoreUnit {
        /// The store being configured.
        store: StoreKind,
        /// The configured unit or granularity.
        size: usize,
        /// The allocation unit.
        unit: usize,
    },
    /// Neither backing store could provide the main carrier.
    #[error("failed to create a main carrier of {size} bytes")]
    MainCarrier {
        /// The requested main carrier size.
        size: usize,
    },
}

/// A broken bookkeeping rule found by [`Allocator::verify`](crate::Allocator::verify).
#[derive(Error, Clone, PartialEq, Eq, Debug)]
#[allow(missing_docs)]
pub enum Inconsistency {
    #[error("carrier {carrier}: list links are broken")]
    Link { carrier: CarrierId },
    #[error("carrier {carrier}: header word does not describe the carrier")]
    CarrierHeader { carrier: CarrierId },
    #[error("carrier {carrier}, block at {offset}: size {size} is not a multiple of the unit")]
    Unaligned {
        carrier: CarrierId,
        offset: usize,
        size: usize,
    },
    #[error("carrier {carrier}, block at {offset}: size {size} is below the minimum {min}")]
    TooSmall {
        carrier: CarrierId,
        offset: usize,
        size: usize,
        min: usize,
    },
    #[error("carrier {carrier}, block at {offset}: previous-free flag does not match")]
    PrevFree { carrier: CarrierId, offset: usize },
    #[error("carrier {carrier}, block at {offset}: footer {footer} does not match size {size}")]
    Footer {
        carrier: CarrierId,
        offset: usize,
        size: usize,
        footer: usize,
    },
    #[error("carrier {carrier}, block at {offset}: two adjacent free blocks")]
    AdjacentFree { carrier: CarrierId, offset: usize },
    #[error("carrier {carrier}, block at {offset}: last-block flag does not match")]
    LastFlag { carrier: CarrierId, offset: usize },
    #[error("carrier {carrier}: blocks end at {end}, carrier ends at {carrier_size}")]
    Span {
        carrier: CarrierId,
        end: usize,
        carrier_size: usize,
    },
    #[error("carrier {carrier}: single-block carrier does not hold exactly one allocated block")]
    SingleBlockShape { carrier: CarrierId },
    #[error("carrier {carrier}, block at {offset}: free block is not in the index")]
    NotIndexed { carrier: CarrierId, offset: usize },
    #[error("index holds {indexed} blocks, carriers hold {free} free blocks")]
    IndexSize { indexed: usize, free: usize },
    #[error("{what}: statistics say {recorded}, carriers hold {actual}")]
    Statistics {
        what: &'static str,
        recorded: usize,
        actual: usize,
    },
}
