// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! Ladle: a carrier-based heap allocation core.
//!
//! Ladle turns large memory regions, called *carriers*, into many independently sized and
//! independently freed blocks. It is meant to sit underneath a runtime that needs its own heaps
//! (one per kind of data, for example), with their own statistics and tuning, rather than to be
//! a drop-in global allocator.
//!
//! # Carriers and blocks
//!
//! Carriers come from one of two backing stores:
//!
//! * the *segment store*, which hands out coarse regions rounded to a fixed unit (like an
//!   `mmap`-backed allocator would), and caps how many of them may be open at once;
//! * the *generic store*, which uses the process allocator, rounding carrier sizes to a
//!   configurable granularity.
//!
//! Requests below the [single-block threshold](Config::single_block_threshold) are served from
//! *multi-block carriers*, split into blocks by a boundary-tag block engine: freeing a block
//! merges it with its free neighbors, and a carrier whose blocks are all free goes back to its
//! store. Requests at or above the threshold get a *single-block carrier* of their own.
//!
//! The *main carrier* is a multi-block carrier created at start and kept until the instance is
//! stopped, even when empty.
//!
//! # Free-block indexes
//!
//! Which free block serves a request is decided by a [`FreeBlockIndex`], chosen when the
//! instance is started. Two are provided: [`AddressOrderFirstFit`] and [`BestFit`].
//!
//! # Quick start
//!
//! ```
//! use ladle::AddressOrderFirstFit;
//! use ladle::Allocator;
//! use ladle::Config;
//!
//! let config = Config {
//!     name: String::from("example_alloc"),
//!     ..Config::default()
//! };
//! let allocator = Allocator::start(config, AddressOrderFirstFit::new()).expect("start failed");
//!
//! let handle = allocator.allocate(100).expect("allocation failed");
//! allocator.write(handle, 0, b"hello");
//!
//! let handle = allocator.reallocate(handle, 5000).expect("reallocation failed");
//! let mut buf = [0u8; 5];
//! allocator.read(handle, 0, &mut buf);
//! assert_eq!(&buf, b"hello");
//!
//! allocator.free(handle);
//!
//! let info = allocator.stop();
//! assert_eq!(info.mbcs.carriers.current, 0);
//! ```
//!
//! # Handles
//!
//! Allocations are identified by a [`Handle`]: the carrier holding the block and the offset of
//! the payload within it. Payload bytes are accessed through the allocator
//! ([`read`](Allocator::read), [`write`](Allocator::write),
//! [`with_payload`](Allocator::with_payload)). Payloads are aligned to [`ALIGNMENT`] bytes.
//!
//! A handle stays valid until it is passed to [`free`](Allocator::free) or
//! [`reallocate`](Allocator::reallocate). Using it afterwards is a bug in the caller; the
//! allocator detects it in most cases, and panics.
//!
//! # Allocating zero bytes
//!
//! [`Allocator::allocate`] with a size of 0 returns `None` without allocating anything, and
//! [`Allocator::reallocate`] with a size of 0 frees the allocation and returns `None`.
//!
//! # Thread safety
//!
//! With [`Config::thread_safe`] set (the default), every operation takes the instance lock. When
//! unset, the instance is meant to be used by one thread at a time, and an operation that finds
//! another one in progress panics instead of waiting.
//!
//! [`Allocator::crash_info`] reads the current carrier and block figures without taking the lock
//! at all, for use when the process is already failing.
//!
//! # Logging
//!
//! Carrier creation, resizing and destruction are logged at the `debug` level through the
//! [`log`] crate, store fallbacks at the `warn` level, and block splits and merges at the `trace`
//! level. Ladle never installs a logger.

#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stderr)]
#![warn(clippy::print_stdout)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(unused_crate_dependencies)]
#![warn(unused_macro_rules)]
#![warn(unused_qualifications)]
#![doc(test(attr(deny(warnings))))]

mod block;
mod carrier;
mod config;
mod error;
mod header;
mod index;
mod iter;
mod stats;
mod store;

#[cfg(test)]
mod tests;

use crate::carrier::CarrierRequest;
use crate::carrier::Carriers;
use crate::config::Geometry;
use crate::header::BLOCK_HEADER_SIZE;
use crate::header::SBC_HEADER_SIZE;
use crate::header::UNIT_SIZE;
use crate::stats::Published;
use crate::stats::Statistics;
use crate::store::BackingStore;
use crate::store::GenericStore;
use crate::store::SegmentStore;
use core::ops::Range;
use log::debug;
use spin::Mutex;
use spin::MutexGuard;

pub use crate::carrier::CarrierClass;
pub use crate::carrier::CarrierId;
pub use crate::config::waste_below_threshold;
pub use crate::config::Config;
pub use crate::config::MovePolicy;
pub use crate::config::StoreConfig;
pub use crate::error::Inconsistency;
pub use crate::error::StartError;
pub use crate::index::AddressOrderFirstFit;
pub use crate::index::BestFit;
pub use crate::index::BlockRef;
pub use crate::index::FreeBlock;
pub use crate::index::FreeBlockIndex;
pub use crate::iter::BlockInfo;
pub use crate::stats::CallCounter;
pub use crate::stats::CarrierStats;
pub use crate::stats::Calls;
pub use crate::stats::CrashCounts;
pub use crate::stats::CrashInfo;
pub use crate::stats::Gauge;
pub use crate::stats::Info;
pub use crate::store::StoreKind;

/// Alignment of every payload.
pub const ALIGNMENT: usize = UNIT_SIZE;

/// Identifies an allocation: the carrier holding it, and the offset of its payload.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Handle {
    carrier: CarrierId,
    offset: usize,
}

impl Handle {
    #[inline]
    #[must_use]
    pub(crate) const fn from_block(block: BlockRef) -> Self {
        Self {
            carrier: block.carrier(),
            offset: block.offset() + BLOCK_HEADER_SIZE,
        }
    }

    /// The carrier holding the allocation.
    #[inline]
    #[must_use]
    pub const fn carrier(&self) -> CarrierId {
        self.carrier
    }

    /// Offset of the payload from the start of the carrier.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    #[must_use]
    pub(crate) const fn block(&self) -> BlockRef {
        BlockRef::new(self.carrier, self.offset - BLOCK_HEADER_SIZE)
    }
}

/// An allocator instance.
///
/// `I` is the [free-block index](FreeBlockIndex) deciding which free block serves each request.
///
/// See the [module-level documentation](crate) for an overview and an example.
#[derive(Debug)]
pub struct Allocator<I: FreeBlockIndex> {
    name: String,
    thread_safe: bool,
    inner: Mutex<AllocatorInner<I>>,
    published: Published,
}

impl<I: FreeBlockIndex> Allocator<I> {
    /// Starts an allocator instance.
    ///
    /// The configuration is validated first, then the main carrier (if
    /// [`Config::main_carrier_size`] is not 0) is created from the generic store. If either
    /// step fails, nothing is left allocated.
    ///
    /// # Examples
    ///
    /// ```
    /// use ladle::Allocator;
    /// use ladle::BestFit;
    /// use ladle::Config;
    /// use ladle::StartError;
    ///
    /// let config = Config {
    ///     name: String::new(),
    ///     ..Config::default()
    /// };
    /// let result = Allocator::start(config, BestFit::new());
    /// assert_eq!(result.err(), Some(StartError::MissingName));
    /// ```
    pub fn start(config: Config, index: I) -> Result<Self, StartError> {
        config.validate()?;

        let mut inner = AllocatorInner {
            geometry: Geometry::new(&config),
            carriers: Carriers::default(),
            main_carrier: None,
            index,
            segments: SegmentStore::new(&config),
            generic: GenericStore::new(&config),
            stats: Statistics::default(),
            config,
        };

        let main_size = inner.config.main_carrier_size;
        if main_size != 0 {
            let request = CarrierRequest {
                force_store: Some(StoreKind::Generic),
                exact_size: true,
                main: true,
            };
            let block = inner
                .create_carrier(main_size, CarrierClass::MultiBlock, request)
                .ok_or(StartError::MainCarrier { size: main_size })?;
            let size = inner.block_header(block).size;
            inner.index.insert(FreeBlock { block, size });
        }

        debug!("{}: started", inner.config.name);

        let allocator = Self {
            name: inner.config.name.clone(),
            thread_safe: inner.config.thread_safe,
            published: Published::default(),
            inner: Mutex::new(inner),
        };
        allocator.published.publish(&allocator.lock().stats);
        Ok(allocator)
    }

    #[track_caller]
    fn lock(&self) -> MutexGuard<'_, AllocatorInner<I>> {
        if self.thread_safe {
            return self.inner.lock();
        }
        match self.inner.try_lock() {
            Some(guard) => guard,
            None => panic!(
                "{}: concurrent use of an allocator started without `thread_safe`",
                self.name
            ),
        }
    }

    /// Runs `f` on the locked instance, then publishes the statistics for
    /// [`crash_info`](Self::crash_info).
    #[track_caller]
    fn with_inner<R>(&self, f: impl FnOnce(&mut AllocatorInner<I>) -> R) -> R {
        let mut inner = self.lock();
        let result = f(&mut inner);
        self.published.publish(&inner.stats);
        result
    }

    /// The diagnostic name of this instance.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocates `size` bytes.
    ///
    /// Returns `None` if `size` is 0, or if no backing store can provide the memory.
    ///
    /// # Panics
    ///
    /// If `size` is too large to be represented as a block (close to `isize::MAX`).
    ///
    /// # Examples
    ///
    /// ```
    /// use ladle::AddressOrderFirstFit;
    /// use ladle::Allocator;
    /// use ladle::Config;
    ///
    /// let allocator = Allocator::start(Config::default(), AddressOrderFirstFit::new()).unwrap();
    /// assert!(allocator.allocate(0).is_none());
    ///
    /// let handle = allocator.allocate(24).unwrap();
    /// assert!(allocator.usable_size(handle) >= 24);
    /// ```
    #[must_use]
    pub fn allocate(&self, size: usize) -> Option<Handle> {
        self.with_inner(|inner| inner.allocate(size))
    }

    /// Frees an allocation. Does nothing when passed `None`.
    ///
    /// # Panics
    ///
    /// If the handle does not refer to a live allocation of this instance.
    pub fn free(&self, handle: impl Into<Option<Handle>>) {
        if let Some(handle) = handle.into() {
            self.with_inner(|inner| inner.free(handle))
        }
    }

    /// Resizes an allocation, preserving the first `min(size, old size)` bytes of its payload.
    ///
    /// With no handle this behaves like [`allocate`](Self::allocate); with a size of 0 it frees
    /// the allocation and returns `None`. The returned handle may differ from the one passed in.
    /// On failure `None` is returned and the original allocation is left intact.
    ///
    /// # Panics
    ///
    /// If the handle does not refer to a live allocation of this instance, or if `size` is too
    /// large to be represented as a block.
    #[must_use]
    pub fn reallocate(&self, handle: impl Into<Option<Handle>>, size: usize) -> Option<Handle> {
        let handle = handle.into();
        self.with_inner(|inner| inner.reallocate(handle, size))
    }

    /// Number of payload bytes usable through `handle`. At least the size requested.
    ///
    /// # Panics
    ///
    /// If the handle does not refer to a live allocation of this instance.
    #[must_use]
    pub fn usable_size(&self, handle: Handle) -> usize {
        self.lock().payload_range(handle).len()
    }

    /// Copies payload bytes, starting at `offset`, into `buf`.
    ///
    /// # Panics
    ///
    /// If the handle does not refer to a live allocation of this instance, or if the range
    /// falls outside the payload.
    pub fn read(&self, handle: Handle, offset: usize, buf: &mut [u8]) {
        self.with_payload(handle, |payload| {
            buf.copy_from_slice(&payload[offset..offset + buf.len()])
        })
    }

    /// Copies `data` into the payload, starting at `offset`.
    ///
    /// # Panics
    ///
    /// If the handle does not refer to a live allocation of this instance, or if the range
    /// falls outside the payload.
    pub fn write(&self, handle: Handle, offset: usize, data: &[u8]) {
        self.with_payload(handle, |payload| {
            payload[offset..offset + data.len()].copy_from_slice(data)
        })
    }

    /// Runs `f` on the whole payload of an allocation, with the instance locked.
    ///
    /// # Panics
    ///
    /// If the handle does not refer to a live allocation of this instance.
    pub fn with_payload<R>(&self, handle: Handle, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.lock();
        let range = inner.payload_range(handle);
        let carrier = inner.carriers.carrier_mut(handle.carrier());
        f(&mut carrier.region.as_mut_slice()[range])
    }

    /// Returns a statistics snapshot.
    ///
    /// With `reset_period` set, the per-period maxima are rolled back to the current values
    /// after the snapshot is taken. All-time maxima are never reset.
    #[must_use]
    pub fn info(&self, reset_period: bool) -> Info {
        self.with_inner(|inner| inner.info(reset_period))
    }

    /// Reads the current carrier and block figures without taking the instance lock.
    ///
    /// Meant for diagnostics when the process is already failing, possibly on a thread that was
    /// interrupted while holding the lock. The figures are those published by the last completed
    /// operation, and may mix values from two operations if one is in progress.
    #[must_use]
    pub fn crash_info(&self) -> CrashInfo {
        self.published.load()
    }

    /// Lists every block of every carrier, multi-block carriers first.
    #[must_use]
    pub fn blocks(&self) -> Vec<BlockInfo> {
        self.lock().blocks()
    }

    /// Checks the carrier lists, every block, the free-block index and the statistics against
    /// each other.
    ///
    /// This walks every block of every carrier, so it is slow. It is meant for tests and
    /// debugging.
    pub fn verify(&self) -> Result<(), Inconsistency> {
        self.lock().verify()
    }

    /// Stops the instance, returning every carrier to its backing store.
    ///
    /// Single-block carriers are released first, then multi-block carriers (the main carrier
    /// included). Returns the final statistics.
    pub fn stop(self) -> Info {
        let mut inner = self.inner.into_inner();
        inner.stop();
        inner.info(false)
    }
}

/// The state of an instance, kept behind the instance lock.
#[derive(Debug)]
pub(crate) struct AllocatorInner<I: FreeBlockIndex> {
    pub(crate) config: Config,
    pub(crate) geometry: Geometry,
    pub(crate) carriers: Carriers,
    pub(crate) main_carrier: Option<CarrierId>,
    pub(crate) index: I,
    pub(crate) segments: SegmentStore,
    pub(crate) generic: GenericStore,
    pub(crate) stats: Statistics,
}

impl<I: FreeBlockIndex> AllocatorInner<I> {
    /// The block behind `handle`, after checking that it is a live allocation.
    #[track_caller]
    fn live_block(&self, handle: Handle) -> (BlockRef, CarrierClass) {
        let carrier = match self.carriers.get(handle.carrier()) {
            Some(carrier) => carrier,
            None => panic!("{handle:?} refers to a carrier that does not exist"),
        };
        let valid_offset = match carrier.class {
            CarrierClass::SingleBlock => handle.offset() == SBC_HEADER_SIZE + BLOCK_HEADER_SIZE,
            CarrierClass::MultiBlock => {
                handle.offset() >= self.geometry.mbc_header_size + BLOCK_HEADER_SIZE
                    && handle.offset() < carrier.size()
                    && handle.offset() % UNIT_SIZE == 0
            }
        };
        assert!(valid_offset, "{handle:?} does not point to a block");

        let block = handle.block();
        let header = carrier.block_header(block.offset());
        assert!(!header.is_free(), "{handle:?} refers to a free block");
        assert!(
            block.offset() + header.size <= carrier.size(),
            "{handle:?} does not point to a block"
        );
        (block, carrier.class)
    }

    #[track_caller]
    fn payload_range(&self, handle: Handle) -> Range<usize> {
        let (block, _) = self.live_block(handle);
        let size = self.block_header(block).size;
        handle.offset()..block.offset() + size
    }

    fn do_allocate(&mut self, size: usize) -> Option<Handle> {
        if size >= self.geometry.single_block_threshold {
            let request = CarrierRequest::default();
            self.create_carrier(size, CarrierClass::SingleBlock, request)
                .map(Handle::from_block)
        } else {
            self.mbc_alloc(size)
        }
    }

    #[track_caller]
    fn do_free(&mut self, handle: Handle) {
        match self.live_block(handle) {
            (_, CarrierClass::SingleBlock) => self.destroy_carrier(handle.carrier()),
            (block, CarrierClass::MultiBlock) => self.mbc_free(block),
        }
    }

    fn allocate(&mut self, size: usize) -> Option<Handle> {
        if size == 0 {
            return None;
        }
        self.stats.alloc_calls.increment();
        self.do_allocate(size)
    }

    #[track_caller]
    fn free(&mut self, handle: Handle) {
        self.stats.free_calls.increment();
        self.do_free(handle);
    }

    #[track_caller]
    fn reallocate(&mut self, handle: Option<Handle>, size: usize) -> Option<Handle> {
        self.stats.realloc_calls.increment();

        let Some(handle) = handle else {
            return if size == 0 {
                None
            } else {
                self.do_allocate(size)
            };
        };

        if size == 0 {
            self.do_free(handle);
            return None;
        }

        let (block, class) = self.live_block(handle);
        let old_size = self.block_header(block).size;

        match (class, size < self.geometry.single_block_threshold) {
            (CarrierClass::MultiBlock, true) => self.mbc_realloc(block, size),
            (CarrierClass::SingleBlock, true) if self.sbc_stays(handle, size) => self
                .resize_carrier(block, size)
                .map(Handle::from_block),
            (CarrierClass::SingleBlock, true) => {
                let new_handle = self.mbc_alloc(size)?;
                let len = size.min(old_size - BLOCK_HEADER_SIZE);
                self.carriers.copy_payload(handle, new_handle, len);
                self.destroy_carrier(handle.carrier());
                Some(new_handle)
            }
            (CarrierClass::SingleBlock, false) => self
                .resize_carrier(block, size)
                .map(Handle::from_block),
            (CarrierClass::MultiBlock, false) => {
                let request = CarrierRequest::default();
                let new_block = self.create_carrier(size, CarrierClass::SingleBlock, request)?;
                let new_handle = Handle::from_block(new_block);
                let len = size.min(old_size - BLOCK_HEADER_SIZE);
                self.carriers.copy_payload(handle, new_handle, len);
                self.mbc_free(block);
                Some(new_handle)
            }
        }
    }

    /// Whether a single-block allocation shrinking to `size` bytes keeps its carrier.
    fn sbc_stays(&self, handle: Handle, size: usize) -> bool {
        let store = self.carriers.carrier(handle.carrier()).store;
        let used = (SBC_HEADER_SIZE + BLOCK_HEADER_SIZE).saturating_add(size);
        match self.store(store).carrier_size(used, false) {
            Some(carrier_size) => {
                (self.config.move_policy)(carrier_size, used, self.config.resize_move_threshold)
            }
            None => true,
        }
    }

    fn info(&mut self, reset_period: bool) -> Info {
        let info = Info {
            name: self.config.name.clone(),
            options: self.config.clone(),
            mbcs: self.stats.mbcs,
            sbcs: self.stats.sbcs,
            calls: self
                .stats
                .calls(self.segments.calls(), self.generic.calls()),
        };
        if reset_period {
            self.stats.reset_period();
        }
        info
    }

    fn stop(&mut self) {
        for class in [CarrierClass::SingleBlock, CarrierClass::MultiBlock] {
            while let Some(id) = self.carriers.list(class).first {
                self.destroy_carrier(id);
            }
        }
        debug!("{}: stopped", self.config.name);
    }
}
