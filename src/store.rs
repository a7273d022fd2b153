// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! The two memory sources that carriers are carved from.
//!
//! The [`SegmentStore`] hands out coarse, unit-sized regions (the way a `mmap`-backed segment
//! allocator would) and caps how many may be open at once. The [`GenericStore`] is a thin layer
//! over the process allocator. Both are used through [`BackingStore`]; deciding which one to try
//! first, and falling back to the other, is up to the carrier manager.

use crate::carrier::CarrierClass;
use crate::config::Config;
use crate::header::checked_unit_ceiling;
use crate::header::UNIT_SIZE;
use crate::header::WORD_SIZE;
use crate::stats::StoreCalls;
use core::alloc::Layout;
use core::fmt;
use core::mem;
use core::ptr::NonNull;
use serde::Deserialize;
use serde::Serialize;
use std::alloc;

/// Which backing store a carrier was obtained from.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum StoreKind {
    /// Coarse fixed-unit segments.
    Segment,
    /// The process allocator.
    Generic,
}

impl StoreKind {
    #[inline]
    #[must_use]
    pub(crate) const fn other(self) -> Self {
        match self {
            Self::Segment => Self::Generic,
            Self::Generic => Self::Segment,
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Segment => "segment",
            Self::Generic => "generic",
        })
    }
}

/// A contiguous, zero-initialized memory region owned by a carrier.
///
/// The memory is returned to the process allocator when the region is dropped.
#[derive(Debug)]
pub(crate) struct Region {
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
}

// SAFETY: `Region` uniquely owns the memory it points to.
unsafe impl Send for Region {}

impl Region {
    /// A placeholder region with no memory behind it.
    #[inline]
    #[must_use]
    pub(crate) const fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            size: 0,
            align: 1,
        }
    }

    #[must_use]
    fn allocate(size: usize, align: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, align).ok()?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, size, align })
    }

    /// Resizes the region, possibly moving it. On failure the region is handed back untouched.
    fn resize(self, new_size: usize) -> Result<Self, Self> {
        if self.size == 0 || new_size == 0 || Layout::from_size_align(new_size, self.align).is_err()
        {
            return Err(self);
        }

        // SAFETY: `self.ptr` was allocated with `self.layout()`, and `new_size` is non-zero and
        // does not overflow when rounded up to `self.align` (checked above).
        let ptr = unsafe { alloc::realloc(self.ptr.as_ptr(), self.layout(), new_size) };
        let Some(ptr) = NonNull::new(ptr) else {
            return Err(self);
        };

        let old_size = self.size;
        let align = self.align;
        mem::forget(self);

        if new_size > old_size {
            // SAFETY: `ptr` is valid for `new_size` bytes; the tail past `old_size` is
            // uninitialized and must be zeroed before any slice covers it.
            unsafe { ptr.as_ptr().add(old_size).write_bytes(0, new_size - old_size) };
        }

        Ok(Self {
            ptr,
            size: new_size,
            align,
        })
    }

    #[inline]
    fn layout(&self) -> Layout {
        // SAFETY: the same size and align were validated when the region was created.
        unsafe { Layout::from_size_align_unchecked(self.size, self.align) }
    }

    #[inline]
    #[must_use]
    pub(crate) const fn len(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: the region owns `size` initialized bytes (or is empty and dangling).
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    #[inline]
    #[must_use]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_slice`, and `&mut self` guarantees uniqueness.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    #[inline]
    #[must_use]
    pub(crate) fn read_word(&self, offset: usize) -> usize {
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(&self.as_slice()[offset..offset + WORD_SIZE]);
        usize::from_ne_bytes(word)
    }

    #[inline]
    pub(crate) fn write_word(&mut self, offset: usize, value: usize) {
        self.as_mut_slice()[offset..offset + WORD_SIZE].copy_from_slice(&value.to_ne_bytes());
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.size != 0 {
            // SAFETY: the memory was allocated by `alloc_zeroed`/`realloc` with this layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout()) }
        }
    }
}

/// Uniform access to the two memory sources.
pub(crate) trait BackingStore {
    /// Carrier size this store would hand out for a request of `size` bytes.
    fn carrier_size(&self, size: usize, exact: bool) -> Option<usize>;

    /// Whether the store is willing to open another carrier of the given class.
    fn has_room(&self, class: CarrierClass) -> bool;

    fn acquire(&mut self, size: usize, class: CarrierClass, exact: bool) -> Option<Region>;

    fn release(&mut self, region: Region, class: CarrierClass);

    /// Resizes `region` to hold at least `new_size` bytes; the region may move, or (for shrinks
    /// the store considers not worth doing) stay as it is.
    fn resize(&mut self, region: Region, new_size: usize) -> Result<Region, Region>;

    fn calls(&self) -> &StoreCalls;
}

#[inline]
fn within_limit(limit: Option<usize>, in_use: usize, extra: usize) -> bool {
    match limit {
        None => true,
        Some(limit) => in_use.checked_add(extra).is_some_and(|total| total <= limit),
    }
}

#[derive(Debug)]
pub(crate) struct SegmentStore {
    unit_size: usize,
    max_segments: usize,
    max_per_class: [usize; 2],
    open: [usize; 2],
    abs_shrink_threshold: usize,
    rel_shrink_threshold: usize,
    limit: Option<usize>,
    in_use: usize,
    calls: StoreCalls,
}

impl SegmentStore {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            unit_size: config.store.segment_unit_size,
            max_segments: config.store.max_segments,
            max_per_class: [
                config.max_segment_carriers_multi_block,
                config.max_segment_carriers_single_block,
            ],
            open: [0, 0],
            abs_shrink_threshold: config.segment_shrink_threshold_absolute.min(usize::MAX / 100),
            rel_shrink_threshold: config.segment_shrink_threshold_relative,
            limit: config.store.segment_memory_limit,
            in_use: 0,
            calls: StoreCalls::default(),
        }
    }

    #[inline]
    fn ceiling(&self, size: usize) -> Option<usize> {
        let mask = self.unit_size - 1;
        Some(size.checked_add(mask)? & !mask)
    }

    /// A shrink small in both absolute and relative terms leaves the segment alone.
    #[inline]
    fn keeps_segment(&self, old_size: usize, new_size: usize) -> bool {
        let shrink = old_size - new_size;
        shrink < self.abs_shrink_threshold
            && shrink.saturating_mul(100) < self.rel_shrink_threshold.saturating_mul(old_size)
    }
}

impl BackingStore for SegmentStore {
    fn carrier_size(&self, size: usize, _exact: bool) -> Option<usize> {
        self.ceiling(size)
    }

    fn has_room(&self, class: CarrierClass) -> bool {
        self.open[0] + self.open[1] < self.max_segments
            && self.open[class.index()] < self.max_per_class[class.index()]
    }

    fn acquire(&mut self, size: usize, class: CarrierClass, _exact: bool) -> Option<Region> {
        if !self.has_room(class) {
            return None;
        }
        self.calls.alloc.increment();
        let size = self.ceiling(size)?;
        if !within_limit(self.limit, self.in_use, size) {
            return None;
        }
        let region = Region::allocate(size, self.unit_size)?;
        self.open[class.index()] += 1;
        self.in_use += size;
        Some(region)
    }

    fn release(&mut self, region: Region, class: CarrierClass) {
        self.calls.free.increment();
        debug_assert!(self.open[class.index()] > 0, "no open segment to release");
        self.open[class.index()] -= 1;
        self.in_use -= region.len();
    }

    fn resize(&mut self, region: Region, new_size: usize) -> Result<Region, Region> {
        self.calls.realloc.increment();
        let Some(new_size) = self.ceiling(new_size) else {
            return Err(region);
        };
        let old_size = region.len();

        if new_size <= old_size {
            if self.keeps_segment(old_size, new_size) {
                return Ok(region);
            }
        } else if !within_limit(self.limit, self.in_use, new_size - old_size) {
            return Err(region);
        }

        let region = region.resize(new_size)?;
        self.in_use = self.in_use - old_size + new_size;
        Ok(region)
    }

    fn calls(&self) -> &StoreCalls {
        &self.calls
    }
}

#[derive(Debug)]
pub(crate) struct GenericStore {
    granularity: usize,
    limit: Option<usize>,
    in_use: usize,
    calls: StoreCalls,
}

impl GenericStore {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            granularity: config.store.generic_granularity,
            limit: config.store.generic_memory_limit,
            in_use: 0,
            calls: StoreCalls::default(),
        }
    }

    #[inline]
    fn ceiling(&self, size: usize) -> Option<usize> {
        let mask = self.granularity - 1;
        Some(size.checked_add(mask)? & !mask)
    }

    fn try_allocate(&mut self, size: usize) -> Option<Region> {
        self.calls.alloc.increment();
        if !within_limit(self.limit, self.in_use, size) {
            return None;
        }
        let region = Region::allocate(size, UNIT_SIZE)?;
        self.in_use += size;
        Some(region)
    }

    fn try_resize(&mut self, region: Region, new_size: usize) -> Result<Region, Region> {
        self.calls.realloc.increment();
        let old_size = region.len();
        if new_size > old_size && !within_limit(self.limit, self.in_use, new_size - old_size) {
            return Err(region);
        }
        let region = region.resize(new_size)?;
        self.in_use = self.in_use - old_size + new_size;
        Ok(region)
    }
}

impl BackingStore for GenericStore {
    fn carrier_size(&self, size: usize, exact: bool) -> Option<usize> {
        if exact {
            checked_unit_ceiling(size)
        } else {
            self.ceiling(size)
        }
    }

    fn has_room(&self, _class: CarrierClass) -> bool {
        true
    }

    fn acquire(&mut self, size: usize, _class: CarrierClass, exact: bool) -> Option<Region> {
        let exact_size = checked_unit_ceiling(size)?;
        let size = self.carrier_size(size, exact)?;
        if let Some(region) = self.try_allocate(size) {
            return Some(region);
        }
        // Retry without the granularity padding.
        if size > exact_size {
            return self.try_allocate(exact_size);
        }
        None
    }

    fn release(&mut self, region: Region, _class: CarrierClass) {
        self.calls.free.increment();
        self.in_use -= region.len();
    }

    fn resize(&mut self, region: Region, new_size: usize) -> Result<Region, Region> {
        let (Some(exact_size), Some(size)) = (checked_unit_ceiling(new_size), self.ceiling(new_size))
        else {
            return Err(region);
        };
        match self.try_resize(region, size) {
            Ok(region) => Ok(region),
            Err(region) if size > exact_size => self.try_resize(region, exact_size),
            Err(region) => Err(region),
        }
    }

    fn calls(&self) -> &StoreCalls {
        &self.calls
    }
}
