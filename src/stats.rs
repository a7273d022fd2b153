// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::config::Config;
use crate::store::StoreKind;
use core::fmt;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering;
use serde::Serialize;

const ONE_GIGA: u32 = 1_000_000_000;

/// A value tracked together with its peak in the current period and its all-time peak.
///
/// The period peak is rolled back to the current value by [`Allocator::info`] when called with
/// `reset_period` set; the all-time peak never decreases.
///
/// [`Allocator::info`]: crate::Allocator::info
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug, Serialize)]
pub struct Gauge {
    /// Current value.
    pub current: usize,
    /// Highest value observed since the last period reset.
    pub max: usize,
    /// Highest value ever observed.
    pub max_ever: usize,
}

impl Gauge {
    #[inline]
    pub(crate) fn add(&mut self, amount: usize) {
        self.current += amount;
        if self.current > self.max {
            self.max = self.current;
            if self.max > self.max_ever {
                self.max_ever = self.max;
            }
        }
    }

    #[inline]
    pub(crate) fn sub(&mut self, amount: usize) {
        debug_assert!(self.current >= amount, "gauge underflow");
        self.current -= amount;
    }

    #[inline]
    fn reset_period(&mut self) {
        self.max = self.current;
    }
}

/// Carrier and block statistics for one carrier class.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug, Serialize)]
pub struct CarrierStats {
    /// Number of allocated blocks.
    pub blocks: Gauge,
    /// Total size of the allocated blocks, block headers included.
    pub blocks_size: Gauge,
    /// Number of carriers, regardless of the store they came from.
    pub carriers: Gauge,
    /// Total size of the carriers.
    pub carriers_size: Gauge,
    /// Number of carriers obtained from the segment store.
    pub segment_carriers: Gauge,
    /// Total size of the carriers obtained from the segment store.
    pub segment_carriers_size: Gauge,
    /// Number of carriers obtained from the generic store.
    pub generic_carriers: Gauge,
    /// Total size of the carriers obtained from the generic store.
    pub generic_carriers_size: Gauge,
}

impl CarrierStats {
    fn store_gauges(&mut self, store: StoreKind) -> (&mut Gauge, &mut Gauge) {
        match store {
            StoreKind::Segment => (&mut self.segment_carriers, &mut self.segment_carriers_size),
            StoreKind::Generic => (&mut self.generic_carriers, &mut self.generic_carriers_size),
        }
    }

    pub(crate) fn carrier_created(&mut self, store: StoreKind, size: usize) {
        self.carriers.add(1);
        self.carriers_size.add(size);
        let (count, total) = self.store_gauges(store);
        count.add(1);
        total.add(size);
    }

    pub(crate) fn carrier_destroyed(&mut self, store: StoreKind, size: usize) {
        self.carriers.sub(1);
        self.carriers_size.sub(size);
        let (count, total) = self.store_gauges(store);
        count.sub(1);
        total.sub(size);
    }

    pub(crate) fn block_allocated(&mut self, size: usize) {
        self.blocks.add(1);
        self.blocks_size.add(size);
    }

    pub(crate) fn block_freed(&mut self, size: usize) {
        self.blocks.sub(1);
        self.blocks_size.sub(size);
    }

    fn reset_period(&mut self) {
        for gauge in [
            &mut self.blocks,
            &mut self.blocks_size,
            &mut self.carriers,
            &mut self.carriers_size,
            &mut self.segment_carriers,
            &mut self.segment_carriers_size,
            &mut self.generic_carriers,
            &mut self.generic_carriers_size,
        ] {
            gauge.reset_period();
        }
    }
}

/// A call counter that does not overflow: `count` rolls over into `giga` every 10⁹ calls.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug, Serialize)]
pub struct CallCounter {
    /// Number of whole billions of calls.
    pub giga: u64,
    /// Calls on top of `giga` billions, always below 10⁹.
    pub count: u32,
}

impl CallCounter {
    #[inline]
    pub(crate) fn increment(&mut self) {
        if self.count == ONE_GIGA - 1 {
            self.giga += 1;
            self.count = 0;
        } else {
            self.count += 1;
        }
    }

    /// The total number of calls, as a single integer.
    #[inline]
    #[must_use]
    pub fn total(&self) -> u128 {
        u128::from(self.giga) * u128::from(ONE_GIGA) + u128::from(self.count)
    }
}

impl fmt::Display for CallCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.giga, self.count)
    }
}

/// The primitive call counters kept by a backing store.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub(crate) struct StoreCalls {
    pub(crate) alloc: CallCounter,
    pub(crate) free: CallCounter,
    pub(crate) realloc: CallCounter,
}

/// Call counters for the public operations and for each backing-store primitive.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug, Serialize)]
pub struct Calls {
    /// Calls to [`Allocator::allocate`](crate::Allocator::allocate).
    pub alloc: CallCounter,
    /// Calls to [`Allocator::free`](crate::Allocator::free) with a handle.
    pub free: CallCounter,
    /// Calls to [`Allocator::reallocate`](crate::Allocator::reallocate).
    pub realloc: CallCounter,
    /// Segment store acquisitions.
    pub segment_alloc: CallCounter,
    /// Segment store releases.
    pub segment_free: CallCounter,
    /// Segment store resizes.
    pub segment_realloc: CallCounter,
    /// Generic store acquisitions.
    pub generic_alloc: CallCounter,
    /// Generic store releases.
    pub generic_free: CallCounter,
    /// Generic store resizes.
    pub generic_realloc: CallCounter,
}

/// The statistics record kept by every allocator instance.
#[derive(Clone, Default, Debug)]
pub(crate) struct Statistics {
    pub(crate) mbcs: CarrierStats,
    pub(crate) sbcs: CarrierStats,
    pub(crate) alloc_calls: CallCounter,
    pub(crate) free_calls: CallCounter,
    pub(crate) realloc_calls: CallCounter,
}

impl Statistics {
    pub(crate) fn reset_period(&mut self) {
        self.mbcs.reset_period();
        self.sbcs.reset_period();
    }

    pub(crate) fn calls(&self, segment: &StoreCalls, generic: &StoreCalls) -> Calls {
        Calls {
            alloc: self.alloc_calls,
            free: self.free_calls,
            realloc: self.realloc_calls,
            segment_alloc: segment.alloc,
            segment_free: segment.free,
            segment_realloc: segment.realloc,
            generic_alloc: generic.alloc,
            generic_free: generic.free,
            generic_realloc: generic.realloc,
        }
    }
}

/// Statistics snapshot returned by [`Allocator::info`](crate::Allocator::info) and
/// [`Allocator::stop`](crate::Allocator::stop).
///
/// The [`Display`](fmt::Display) implementation renders a line-oriented report; the layout of
/// that report is meant for humans and may change. Use the fields (or the [`Serialize`]
/// implementation) for anything programmatic.
#[derive(Clone, Debug, Serialize)]
pub struct Info {
    /// Diagnostic name of the instance.
    pub name: String,
    /// The configuration the instance was started with.
    pub options: Config,
    /// Multi-block carrier statistics.
    pub mbcs: CarrierStats,
    /// Single-block carrier statistics.
    pub sbcs: CarrierStats,
    /// Call counters.
    pub calls: Calls,
}

fn fmt_gauge(f: &mut fmt::Formatter<'_>, prefix: &str, name: &str, gauge: &Gauge) -> fmt::Result {
    writeln!(
        f,
        "{prefix} {name}: {} {} {}",
        gauge.current, gauge.max, gauge.max_ever
    )
}

fn fmt_carrier_stats(f: &mut fmt::Formatter<'_>, prefix: &str, stats: &CarrierStats) -> fmt::Result {
    fmt_gauge(f, prefix, "blocks", &stats.blocks)?;
    fmt_gauge(f, prefix, "blocks size", &stats.blocks_size)?;
    fmt_gauge(f, prefix, "carriers", &stats.carriers)?;
    fmt_gauge(f, prefix, "segment carriers", &stats.segment_carriers)?;
    fmt_gauge(f, prefix, "generic carriers", &stats.generic_carriers)?;
    fmt_gauge(f, prefix, "carriers size", &stats.carriers_size)?;
    fmt_gauge(f, prefix, "segment carriers size", &stats.segment_carriers_size)?;
    fmt_gauge(f, prefix, "generic carriers size", &stats.generic_carriers_size)
}

impl fmt::Display for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = &self.name;
        let options = &self.options;
        writeln!(f, "{name} option sbct: {}", options.single_block_threshold)?;
        writeln!(f, "{name} option mmbcs: {}", options.main_carrier_size)?;
        writeln!(f, "{name} option asbcst: {}", options.segment_shrink_threshold_absolute)?;
        writeln!(f, "{name} option rsbcst: {}", options.segment_shrink_threshold_relative)?;
        writeln!(f, "{name} option rsbcmt: {}", options.resize_move_threshold)?;
        writeln!(f, "{name} option smbcs: {}", options.smallest_multiblock_carrier_size)?;
        writeln!(f, "{name} option lmbcs: {}", options.largest_multiblock_carrier_size)?;
        writeln!(f, "{name} option mbcgs: {}", options.multiblock_growth_stages)?;
        writeln!(f, "{name} option mmsbc: {}", options.max_segment_carriers_single_block)?;
        writeln!(f, "{name} option mmmbc: {}", options.max_segment_carriers_multi_block)?;
        writeln!(f, "{name} option ts: {}", options.thread_safe)?;

        fmt_carrier_stats(f, &format!("{name} mbcs"), &self.mbcs)?;
        fmt_carrier_stats(f, &format!("{name} sbcs"), &self.sbcs)?;

        let calls = &self.calls;
        writeln!(f, "{name} calls alloc: {}", calls.alloc)?;
        writeln!(f, "{name} calls free: {}", calls.free)?;
        writeln!(f, "{name} calls realloc: {}", calls.realloc)?;
        writeln!(f, "{name} calls segment alloc: {}", calls.segment_alloc)?;
        writeln!(f, "{name} calls segment free: {}", calls.segment_free)?;
        writeln!(f, "{name} calls segment realloc: {}", calls.segment_realloc)?;
        writeln!(f, "{name} calls generic alloc: {}", calls.generic_alloc)?;
        writeln!(f, "{name} calls generic free: {}", calls.generic_free)?;
        writeln!(f, "{name} calls generic realloc: {}", calls.generic_realloc)
    }
}

/// Current carrier and block figures for one carrier class, as seen by
/// [`Allocator::crash_info`](crate::Allocator::crash_info).
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug, Serialize)]
pub struct CrashCounts {
    /// Number of allocated blocks.
    pub blocks: usize,
    /// Total size of the allocated blocks.
    pub blocks_size: usize,
    /// Number of carriers.
    pub carriers: usize,
    /// Total size of the carriers.
    pub carriers_size: usize,
}

/// Best-effort statistics read without taking the instance lock.
///
/// The figures are published after every completed operation; a read racing with an operation
/// may mix values from before and after it.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug, Serialize)]
pub struct CrashInfo {
    /// Multi-block carrier figures.
    pub mbcs: CrashCounts,
    /// Single-block carrier figures.
    pub sbcs: CrashCounts,
}

#[derive(Default, Debug)]
struct PublishedCounts {
    blocks: AtomicUsize,
    blocks_size: AtomicUsize,
    carriers: AtomicUsize,
    carriers_size: AtomicUsize,
}

impl PublishedCounts {
    fn store(&self, stats: &CarrierStats) {
        self.blocks.store(stats.blocks.current, Ordering::Relaxed);
        self.blocks_size.store(stats.blocks_size.current, Ordering::Relaxed);
        self.carriers.store(stats.carriers.current, Ordering::Relaxed);
        self.carriers_size.store(stats.carriers_size.current, Ordering::Relaxed);
    }

    fn load(&self) -> CrashCounts {
        CrashCounts {
            blocks: self.blocks.load(Ordering::Relaxed),
            blocks_size: self.blocks_size.load(Ordering::Relaxed),
            carriers: self.carriers.load(Ordering::Relaxed),
            carriers_size: self.carriers_size.load(Ordering::Relaxed),
        }
    }
}

/// Lock-free mirror of the current gauges.
#[derive(Default, Debug)]
pub(crate) struct Published {
    mbcs: PublishedCounts,
    sbcs: PublishedCounts,
}

impl Published {
    pub(crate) fn publish(&self, stats: &Statistics) {
        self.mbcs.store(&stats.mbcs);
        self.sbcs.store(&stats.sbcs);
    }

    pub(crate) fn load(&self) -> CrashInfo {
        CrashInfo {
            mbcs: self.mbcs.load(),
            sbcs: self.sbcs.load(),
        }
    }
}
