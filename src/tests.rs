// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::config::Geometry;
use crate::header::BLOCK_HEADER_SIZE;
use crate::waste_below_threshold;
use crate::Allocator;
use crate::BlockInfo;
use crate::BlockRef;
use crate::CallCounter;
use crate::CarrierClass;
use crate::CarrierId;
use crate::Config;
use crate::FreeBlock;
use crate::FreeBlockIndex;
use crate::Handle;
use crate::Inconsistency;
use crate::StartError;
use crate::StoreConfig;
use crate::StoreKind;
use crate::ALIGNMENT;
use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;
use std::thread;

/// A small configuration where carrier sizes are easy to follow: 4 KiB store units, a 4 KiB
/// main carrier, and multi-block carriers growing from 8 KiB to 32 KiB over 3 stages.
fn test_config() -> Config {
    Config {
        name: String::from("test_alloc"),
        main_carrier_size: 4096,
        single_block_threshold: 16384,
        smallest_multiblock_carrier_size: 8192,
        largest_multiblock_carrier_size: 32768,
        multiblock_growth_stages: 3,
        store: StoreConfig {
            segment_unit_size: 4096,
            generic_granularity: 4096,
            ..StoreConfig::default()
        },
        ..Config::default()
    }
}

fn start<I: FreeBlockIndex + Default>(config: Config) -> Allocator<I> {
    Allocator::start(config, I::default()).expect("start failed")
}

fn fill<I: FreeBlockIndex>(allocator: &Allocator<I>, handle: Handle, len: usize, byte: u8) {
    allocator.with_payload(handle, |payload| payload[..len].fill(byte));
}

fn assert_filled<I: FreeBlockIndex>(allocator: &Allocator<I>, handle: Handle, len: usize, byte: u8) {
    allocator.with_payload(handle, |payload| {
        assert!(
            payload[..len].iter().all(|&b| b == byte),
            "payload of {handle:?} was corrupted"
        );
    });
}

fn assert_verified<I: FreeBlockIndex>(allocator: &Allocator<I>) {
    if let Err(err) = allocator.verify() {
        panic!("verification failed: {err}");
    }
}

fn random_size<R: Rng>(rng: &mut R) -> usize {
    if rng.gen_ratio(1, 10) {
        rng.gen_range(16_384..60_000)
    } else {
        rng.gen_range(1..2_000)
    }
}

fn small_and_large<I: FreeBlockIndex + Default>() {
    let config = Config {
        single_block_threshold: 1024,
        min_block_size: 32,
        ..test_config()
    };
    let allocator = start::<I>(config);

    let small = allocator.allocate(16).expect("allocation failed");
    let info = allocator.info(false);
    assert_eq!(info.mbcs.blocks.current, 1);
    assert_eq!(info.mbcs.blocks_size.current, 48);
    assert_eq!(info.mbcs.carriers.current, 1);
    assert_eq!(info.sbcs.carriers.current, 0);

    let large = allocator.allocate(2048).expect("allocation failed");
    let info = allocator.info(false);
    assert_eq!(info.sbcs.carriers.current, 1);
    assert_eq!(info.sbcs.segment_carriers.current, 1);
    assert_eq!(info.sbcs.carriers_size.current, 4096);
    assert_eq!(info.sbcs.blocks.current, 1);
    assert_eq!(info.sbcs.blocks_size.current, 2064);
    assert_eq!(allocator.usable_size(large), 2056);

    allocator.free(small);
    allocator.free(large);
    assert_verified(&allocator);

    let info = allocator.info(false);
    assert_eq!(info.sbcs.carriers.current, 0);
    assert_eq!(info.mbcs.carriers.current, 1);

    let info = allocator.stop();
    assert_eq!(info.mbcs.carriers.current, 0);
    assert_eq!(info.sbcs.carriers.current, 0);
    assert_eq!(info.mbcs.carriers_size.current, 0);
}

fn reuse_freed_block<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());

    let a = allocator.allocate(100).expect("allocation failed");
    let b = allocator.allocate(100).expect("allocation failed");
    assert_eq!(a.carrier(), b.carrier());
    assert_eq!(b.offset(), a.offset() + 112);

    allocator.free(a);
    assert_verified(&allocator);

    let free = allocator
        .blocks()
        .into_iter()
        .filter(|block| block.free)
        .collect::<Vec<_>>();
    assert_eq!(free.iter().filter(|block| block.size == 112).count(), 1);
    assert_eq!(
        free[0],
        BlockInfo {
            carrier: a.carrier(),
            class: CarrierClass::MultiBlock,
            store: StoreKind::Generic,
            offset: a.offset() - 8,
            size: 112,
            free: true,
        }
    );

    let c = allocator.allocate(100).expect("allocation failed");
    assert_eq!(c, a);
    assert_verified(&allocator);
}

fn alignment<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());
    let mut handles = Vec::new();

    for size in (1..=300).chain([16_384, 20_000, 40_001]) {
        let handle = allocator.allocate(size).expect("allocation failed");
        assert_eq!(handle.offset() % ALIGNMENT, 0, "{handle:?} is not aligned");
        allocator.with_payload(handle, |payload| {
            assert_eq!(payload.as_ptr().align_offset(ALIGNMENT), 0);
            assert!(payload.len() >= size);
        });
        handles.push(handle);
    }

    for handle in handles {
        let size = allocator.usable_size(handle);
        allocator.free(handle);
        let handle = allocator.allocate(size).expect("allocation failed");
        fill(&allocator, handle, size, 0xa5);
        allocator.free(handle);
    }
    assert_verified(&allocator);
}

fn zero_sizes<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());

    assert!(allocator.allocate(0).is_none());
    assert_eq!(allocator.info(false).calls.alloc.total(), 0);

    let handle = allocator.reallocate(None, 100).expect("reallocation failed");
    let info = allocator.info(false);
    assert_eq!(info.calls.alloc.total(), 0);
    assert_eq!(info.calls.realloc.total(), 1);
    assert_eq!(info.mbcs.blocks.current, 1);

    assert!(allocator.reallocate(handle, 0).is_none());
    let info = allocator.info(false);
    assert_eq!(info.calls.free.total(), 0);
    assert_eq!(info.calls.realloc.total(), 2);
    assert_eq!(info.mbcs.blocks.current, 0);

    assert!(allocator.reallocate(None, 0).is_none());
    allocator.free(None);
    let info = allocator.info(false);
    assert_eq!(info.calls.realloc.total(), 3);
    assert_eq!(info.calls.free.total(), 0);

    let handle = allocator.allocate(10).expect("allocation failed");
    allocator.free(handle);
    let info = allocator.info(false);
    assert_eq!(info.calls.alloc.total(), 1);
    assert_eq!(info.calls.free.total(), 1);
    assert_verified(&allocator);
}

fn grow_in_place<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());

    let a = allocator.allocate(100).expect("allocation failed");
    allocator.write(a, 0, b"abcdefghijklmnop");

    let b = allocator.reallocate(a, 200).expect("reallocation failed");
    assert_eq!(a, b);
    assert_eq!(allocator.usable_size(b), 200);
    assert_eq!(allocator.info(false).mbcs.blocks_size.current, 208);

    let mut buf = [0u8; 16];
    allocator.read(b, 0, &mut buf);
    assert_eq!(&buf, b"abcdefghijklmnop");
    assert_verified(&allocator);
}

fn shrink_in_place<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());

    let a = allocator.allocate(200).expect("allocation failed");
    let b = allocator.allocate(100).expect("allocation failed");
    let _c = allocator.allocate(100).expect("allocation failed");
    allocator.write(a, 0, b"abcdefghijklmnop");

    let c = allocator.reallocate(a, 50).expect("reallocation failed");
    assert_eq!(a, c);
    assert_eq!(allocator.usable_size(c), 56);

    let freed = allocator
        .blocks()
        .into_iter()
        .find(|block| block.free && block.offset == c.offset() - 8 + 64)
        .expect("no free block after the shrunk one");
    assert_eq!(freed.size, 144);

    let mut buf = [0u8; 16];
    allocator.read(c, 0, &mut buf);
    assert_eq!(&buf, b"abcdefghijklmnop");
    assert_verified(&allocator);

    // Too little to split off: the block keeps its slack.
    let d = allocator.reallocate(b, 80).expect("reallocation failed");
    assert_eq!(b, d);
    assert_eq!(allocator.usable_size(d), 104);
    assert_verified(&allocator);
}

fn grow_reallocated<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());

    let a = allocator.allocate(100).expect("allocation failed");
    let _b = allocator.allocate(100).expect("allocation failed");
    fill(&allocator, a, 100, 0x5a);

    let c = allocator.reallocate(a, 500).expect("reallocation failed");
    assert_ne!(a, c);
    assert_filled(&allocator, c, 100, 0x5a);

    let info = allocator.info(false);
    assert_eq!(info.mbcs.blocks.current, 2);
    assert_eq!(info.mbcs.blocks_size.current, 112 + 512);
    assert_verified(&allocator);
}

fn multi_to_single_block<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());

    let a = allocator.allocate(100).expect("allocation failed");
    fill(&allocator, a, 100, 0x11);

    let b = allocator.reallocate(a, 20_000).expect("reallocation failed");
    assert_ne!(a.carrier(), b.carrier());
    assert_filled(&allocator, b, 100, 0x11);

    let info = allocator.info(false);
    assert_eq!(info.mbcs.blocks.current, 0);
    assert_eq!(info.sbcs.blocks.current, 1);
    assert_eq!(info.sbcs.blocks_size.current, 20_016);
    assert_verified(&allocator);
}

fn single_block_shrinks<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());

    let a = allocator.allocate(100_000).expect("allocation failed");
    fill(&allocator, a, 1000, 0x22);
    let info = allocator.info(false);
    assert_eq!(info.sbcs.carriers_size.current, 102_400);
    assert_eq!(info.sbcs.blocks_size.current, 100_016);

    // A small shrink leaves the segment alone.
    let b = allocator.reallocate(a, 90_000).expect("reallocation failed");
    assert_eq!(a, b);
    let info = allocator.info(false);
    assert_eq!(info.sbcs.carriers_size.current, 102_400);
    assert_eq!(info.sbcs.blocks_size.current, 90_016);
    assert_eq!(allocator.usable_size(b), 90_008);

    // A large one gives memory back.
    let c = allocator.reallocate(b, 50_000).expect("reallocation failed");
    let info = allocator.info(false);
    assert_eq!(info.sbcs.carriers.current, 1);
    assert_eq!(info.sbcs.carriers_size.current, 53_248);
    assert_eq!(info.sbcs.blocks_size.current, 50_016);
    assert_filled(&allocator, c, 1000, 0x22);
    assert_verified(&allocator);
}

fn single_block_moves<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());

    let a = allocator.allocate(20_000).expect("allocation failed");
    fill(&allocator, a, 1000, 0x33);
    assert_eq!(allocator.info(false).sbcs.carriers_size.current, 20_480);

    // 1032 bytes used out of a 4 KiB segment: below the waste threshold, so it stays.
    let b = allocator.reallocate(a, 1000).expect("reallocation failed");
    let info = allocator.info(false);
    assert_eq!(info.sbcs.carriers.current, 1);
    assert_eq!(info.sbcs.carriers_size.current, 4096);
    assert_eq!(info.sbcs.blocks_size.current, 1008);
    assert_eq!(info.mbcs.blocks.current, 0);
    assert_filled(&allocator, b, 1000, 0x33);

    // 132 bytes used: too much waste, so it moves into a multi-block carrier.
    let c = allocator.reallocate(b, 100).expect("reallocation failed");
    let info = allocator.info(false);
    assert_eq!(info.sbcs.carriers.current, 0);
    assert_eq!(info.mbcs.blocks.current, 1);
    assert_eq!(info.mbcs.blocks_size.current, 112);
    assert_filled(&allocator, c, 100, 0x33);
    assert_verified(&allocator);
}

fn custom_move_policy<I: FreeBlockIndex + Default>() {
    let config = Config {
        move_policy: |_, _, _| false,
        ..test_config()
    };
    let allocator = start::<I>(config);

    let a = allocator.allocate(20_000).expect("allocation failed");
    fill(&allocator, a, 1000, 0x44);

    let b = allocator.reallocate(a, 1000).expect("reallocation failed");
    let info = allocator.info(false);
    assert_eq!(info.sbcs.carriers.current, 0);
    assert_eq!(info.mbcs.blocks.current, 1);
    assert_filled(&allocator, b, 1000, 0x44);
    assert_verified(&allocator);
}

fn carrier_lifecycle<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());

    let a = allocator.allocate(100).expect("allocation failed");
    allocator.free(a);
    let info = allocator.info(false);
    assert_eq!(info.mbcs.carriers.current, 1);
    assert_eq!(info.mbcs.generic_carriers.current, 1);
    assert_eq!(info.mbcs.carriers_size.current, 4144);

    let b = allocator.allocate(8000).expect("allocation failed");
    assert_ne!(a.carrier(), b.carrier());
    let info = allocator.info(false);
    assert_eq!(info.mbcs.carriers.current, 2);
    assert_eq!(info.mbcs.segment_carriers.current, 1);

    allocator.free(b);
    let info = allocator.info(false);
    assert_eq!(info.mbcs.carriers.current, 1);
    assert_eq!(info.mbcs.segment_carriers.current, 0);
    assert_eq!(info.mbcs.carriers.max_ever, 2);
    assert_eq!(info.calls.segment_free.total(), 1);
    assert_verified(&allocator);
}

fn no_main_carrier<I: FreeBlockIndex + Default>() {
    let config = Config {
        main_carrier_size: 0,
        ..test_config()
    };
    let allocator = start::<I>(config);
    assert_eq!(allocator.info(false).mbcs.carriers.current, 0);

    let a = allocator.allocate(100).expect("allocation failed");
    let info = allocator.info(false);
    assert_eq!(info.mbcs.carriers.current, 1);
    assert_eq!(info.mbcs.carriers_size.current, 8192);

    allocator.free(a);
    assert_eq!(allocator.info(false).mbcs.carriers.current, 0);
    assert_verified(&allocator);
}

fn growth_schedule<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());
    let mut handles = Vec::new();
    let mut sizes = Vec::new();

    let mut info = allocator.info(false);
    while info.mbcs.carriers.current < 6 {
        handles.push(allocator.allocate(8000).expect("allocation failed"));
        let next = allocator.info(false);
        if next.mbcs.carriers.current > info.mbcs.carriers.current {
            sizes.push(next.mbcs.carriers_size.current - info.mbcs.carriers_size.current);
        }
        info = next;
    }

    assert_eq!(sizes, [8192, 16384, 24576, 32768, 32768]);
    assert_verified(&allocator);

    for handle in handles {
        allocator.free(handle);
    }
    let info = allocator.info(false);
    assert_eq!(info.mbcs.carriers.current, 1);
    assert_eq!(info.mbcs.blocks.current, 0);
    assert_verified(&allocator);
}

fn segment_caps<I: FreeBlockIndex + Default>() {
    let config = Config {
        max_segment_carriers_multi_block: 1,
        max_segment_carriers_single_block: 1,
        ..test_config()
    };
    let allocator = start::<I>(config);

    let handles = [
        allocator.allocate(8000),
        allocator.allocate(8000),
        allocator.allocate(20_000),
        allocator.allocate(20_000),
    ];
    assert!(handles.iter().all(Option::is_some));

    let info = allocator.info(false);
    assert_eq!(info.mbcs.segment_carriers.current, 1);
    assert_eq!(info.mbcs.generic_carriers.current, 2);
    assert_eq!(info.mbcs.generic_carriers_size.current, 4144 + 8192);
    assert_eq!(info.sbcs.segment_carriers.current, 1);
    assert_eq!(info.sbcs.generic_carriers.current, 1);
    assert_verified(&allocator);

    for handle in handles {
        allocator.free(handle);
    }
    assert_verified(&allocator);
}

fn rejected_segments_are_not_counted<I: FreeBlockIndex + Default>() {
    let config = Config {
        max_segment_carriers_multi_block: 0,
        store: StoreConfig {
            generic_memory_limit: Some(4144),
            ..test_config().store
        },
        ..test_config()
    };
    let allocator = start::<I>(config);

    assert!(allocator.allocate(8000).is_none());
    let info = allocator.info(false);
    assert_eq!(info.calls.segment_alloc.total(), 0);
    assert_eq!(info.mbcs.segment_carriers.max_ever, 0);

    let handle = allocator.allocate(20_000).expect("allocation failed");
    let info = allocator.info(false);
    assert_eq!(info.calls.segment_alloc.total(), 1);
    assert_eq!(info.sbcs.segment_carriers.current, 1);

    allocator.free(handle);
    assert_verified(&allocator);
}

fn emergency_single_block<I: FreeBlockIndex + Default>() {
    let config = Config {
        main_carrier_size: 0,
        store: StoreConfig {
            segment_memory_limit: Some(0),
            generic_memory_limit: Some(4096),
            ..test_config().store
        },
        ..test_config()
    };
    let allocator = start::<I>(config);

    let a = allocator.allocate(100).expect("allocation failed");
    assert_eq!(a.offset() % ALIGNMENT, 0);
    let info = allocator.info(false);
    assert_eq!(info.mbcs.carriers.current, 0);
    assert_eq!(info.sbcs.carriers.current, 1);
    assert_eq!(info.sbcs.generic_carriers.current, 1);
    assert_eq!(info.sbcs.carriers_size.current, 144);

    // Nothing can hold this one.
    assert!(allocator.allocate(8000).is_none());
    let info = allocator.info(false);
    assert_eq!(info.calls.alloc.total(), 2);
    assert_eq!(info.sbcs.carriers.current, 1);
    assert_eq!(info.mbcs.carriers.current, 0);
    assert_verified(&allocator);

    allocator.free(a);
    assert_eq!(allocator.info(false).sbcs.carriers.current, 0);
}

fn resize_moves_to_other_store<I: FreeBlockIndex + Default>() {
    let config = Config {
        store: StoreConfig {
            segment_memory_limit: Some(24_576),
            ..test_config().store
        },
        ..test_config()
    };
    let allocator = start::<I>(config);

    let a = allocator.allocate(20_000).expect("allocation failed");
    fill(&allocator, a, 20_000, 0x66);
    assert_eq!(allocator.info(false).sbcs.segment_carriers.current, 1);

    let b = allocator.reallocate(a, 30_000).expect("reallocation failed");
    assert_filled(&allocator, b, 20_000, 0x66);

    let info = allocator.info(false);
    assert_eq!(info.sbcs.carriers.current, 1);
    assert_eq!(info.sbcs.segment_carriers.current, 0);
    assert_eq!(info.sbcs.generic_carriers.current, 1);
    assert_eq!(info.sbcs.carriers_size.current, 32_768);
    assert_eq!(info.calls.segment_free.total(), 1);
    assert_verified(&allocator);
}

fn failed_resize_keeps_allocation<I: FreeBlockIndex + Default>() {
    let config = Config {
        store: StoreConfig {
            segment_memory_limit: Some(24_576),
            generic_memory_limit: Some(4144),
            ..test_config().store
        },
        ..test_config()
    };
    let allocator = start::<I>(config);

    let a = allocator.allocate(20_000).expect("allocation failed");
    fill(&allocator, a, 20_000, 0x77);

    assert!(allocator.reallocate(a, 30_000).is_none());

    assert_eq!(allocator.usable_size(a), 20_008);
    assert_filled(&allocator, a, 20_000, 0x77);
    let info = allocator.info(false);
    assert_eq!(info.sbcs.carriers.current, 1);
    assert_eq!(info.sbcs.carriers_size.current, 20_480);
    assert_eq!(info.sbcs.blocks_size.current, 20_016);
    assert_eq!(info.calls.segment_realloc.total(), 1);
    // The main carrier, then the padded and the exact attempt for the moved carrier.
    assert_eq!(info.calls.generic_alloc.total(), 3);
    assert_verified(&allocator);

    allocator.free(a);
    assert_verified(&allocator);
}

fn info_periods<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());

    let handles = [
        allocator.allocate(100).expect("allocation failed"),
        allocator.allocate(100).expect("allocation failed"),
        allocator.allocate(100).expect("allocation failed"),
    ];
    allocator.free(handles[0]);
    allocator.free(handles[1]);

    let info = allocator.info(true);
    assert_eq!(info.mbcs.blocks.current, 1);
    assert_eq!(info.mbcs.blocks.max, 3);
    assert_eq!(info.mbcs.blocks.max_ever, 3);

    let info = allocator.info(false);
    assert_eq!(info.mbcs.blocks.current, 1);
    assert_eq!(info.mbcs.blocks.max, 1);
    assert_eq!(info.mbcs.blocks.max_ever, 3);
    assert_eq!(info.mbcs.blocks_size.max, 112);
    assert_eq!(info.mbcs.blocks_size.max_ever, 336);
    assert_eq!(info.calls.alloc.total(), 3);
    assert_eq!(info.calls.free.total(), 2);

    let report = info.to_string();
    assert!(report.contains("test_alloc mbcs blocks: 1 1 3\n"));
    assert!(report.contains("test_alloc calls alloc: 0 3\n"));
    assert!(report.contains("test_alloc option sbct: 16384\n"));
}

fn crash_info<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());
    let a = allocator.allocate(100).expect("allocation failed");
    let b = allocator.allocate(20_000).expect("allocation failed");

    let crash = allocator.crash_info();
    let info = allocator.info(false);
    assert_eq!(crash.mbcs.blocks, info.mbcs.blocks.current);
    assert_eq!(crash.mbcs.blocks_size, 112);
    assert_eq!(crash.mbcs.carriers, 1);
    assert_eq!(crash.mbcs.carriers_size, 4144);
    assert_eq!(crash.sbcs.blocks, 1);
    assert_eq!(crash.sbcs.carriers_size, info.sbcs.carriers_size.current);

    allocator.free(a);
    allocator.free(b);
    let crash = allocator.crash_info();
    assert_eq!(crash.mbcs.blocks, 0);
    assert_eq!(crash.sbcs.carriers, 0);
}

fn stop_releases_everything<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());
    for size in [100, 8000, 8000, 20_000, 40_000] {
        let _ = allocator.allocate(size).expect("allocation failed");
    }
    let before = allocator.info(false);
    assert_eq!(before.mbcs.carriers.current, 3);
    assert_eq!(before.sbcs.carriers.current, 2);

    let info = allocator.stop();
    assert_eq!(info.name, "test_alloc");
    assert_eq!(info.mbcs.carriers.current, 0);
    assert_eq!(info.mbcs.carriers_size.current, 0);
    assert_eq!(info.sbcs.carriers.current, 0);
    assert_eq!(info.sbcs.blocks.current, 0);
    assert_eq!(info.mbcs.carriers.max_ever, 3);
    assert_eq!(info.calls.segment_free.total(), 4);
    assert_eq!(info.calls.generic_free.total(), 1);
}

fn verify_detects_corruption<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());
    let a = allocator.allocate(100).expect("allocation failed");
    let _b = allocator.allocate(100).expect("allocation failed");
    allocator.free(a);
    assert_verified(&allocator);

    {
        let mut inner = allocator.inner.lock();
        inner.stats.mbcs.blocks.add(1);
    }
    assert_eq!(
        allocator.verify(),
        Err(Inconsistency::Statistics {
            what: "blocks",
            recorded: 2,
            actual: 1,
        })
    );
    allocator.inner.lock().stats.mbcs.blocks.sub(1);

    {
        let mut inner = allocator.inner.lock();
        let carrier = inner.carriers.carrier_mut(a.carrier());
        carrier.region.write_word(a.offset() - 8 + 112 - 8, 7);
    }
    assert_eq!(
        allocator.verify(),
        Err(Inconsistency::Footer {
            carrier: a.carrier(),
            offset: a.offset() - 8,
            size: 112,
            footer: 7,
        })
    );
}

fn random<I: FreeBlockIndex + Default>() {
    fn alloc_random<I: FreeBlockIndex, R: Rng>(
        allocator: &Allocator<I>,
        rng: &mut R,
        objects: &mut Vec<(Handle, usize, u8)>,
    ) {
        let size = random_size(rng);
        let byte = rng.gen();
        if let Some(handle) = allocator.allocate(size) {
            assert_eq!(handle.offset() % ALIGNMENT, 0);
            assert!(allocator.usable_size(handle) >= size);
            fill(allocator, handle, size, byte);
            objects.push((handle, size, byte));
        }
    }

    fn free_random<I: FreeBlockIndex, R: Rng>(
        allocator: &Allocator<I>,
        rng: &mut R,
        objects: &mut Vec<(Handle, usize, u8)>,
    ) {
        if objects.is_empty() {
            return;
        }
        let index = rng.gen_range(0..objects.len());
        let (handle, size, byte) = objects.swap_remove(index);
        assert_filled(allocator, handle, size, byte);
        allocator.free(handle);
    }

    fn realloc_random<I: FreeBlockIndex, R: Rng>(
        allocator: &Allocator<I>,
        rng: &mut R,
        objects: &mut [(Handle, usize, u8)],
    ) {
        if objects.is_empty() {
            return;
        }
        let index = rng.gen_range(0..objects.len());
        let (handle, size, byte) = objects[index];
        let new_size = random_size(rng);
        if let Some(new_handle) = allocator.reallocate(handle, new_size) {
            assert_eq!(new_handle.offset() % ALIGNMENT, 0);
            assert_filled(allocator, new_handle, size.min(new_size), byte);
            fill(allocator, new_handle, new_size, byte);
            objects[index] = (new_handle, new_size, byte);
        } else {
            assert_filled(allocator, handle, size, byte);
        }
    }

    let allocator = start::<I>(test_config());
    let mut rng = SmallRng::seed_from_u64(12345);
    let mut objects = Vec::new();

    for step in 0..1500 {
        match rng.gen_range(0..8) {
            0 | 1 => free_random(&allocator, &mut rng, &mut objects),
            2 => realloc_random(&allocator, &mut rng, &mut objects),
            _ => alloc_random(&allocator, &mut rng, &mut objects),
        }
        if let Err(err) = allocator.verify() {
            panic!("verification failed after step {step}: {err}");
        }
        let info = allocator.info(false);
        assert_eq!(info.mbcs.blocks.current + info.sbcs.blocks.current, objects.len());
    }

    while !objects.is_empty() {
        free_random(&allocator, &mut rng, &mut objects);
    }
    assert_verified(&allocator);

    let info = allocator.info(false);
    assert_eq!(info.mbcs.carriers.current, 1);
    assert_eq!(info.mbcs.blocks_size.current, 0);
    assert_eq!(info.sbcs.carriers.current, 0);
}

fn threads<I: FreeBlockIndex + Default + Send>() {
    let allocator = start::<I>(test_config());

    thread::scope(|scope| {
        for seed in 0..4 {
            let allocator = &allocator;
            scope.spawn(move || {
                let mut rng = SmallRng::seed_from_u64(seed);
                let mut objects = Vec::new();
                for _ in 0..300 {
                    if objects.is_empty() || rng.gen_ratio(2, 3) {
                        let size = random_size(&mut rng);
                        let byte = rng.gen();
                        if let Some(handle) = allocator.allocate(size) {
                            fill(allocator, handle, size, byte);
                            objects.push((handle, size, byte));
                        }
                    } else {
                        let index = rng.gen_range(0..objects.len());
                        let (handle, size, byte) = objects.swap_remove(index);
                        assert_filled(allocator, handle, size, byte);
                        allocator.free(handle);
                    }
                }
                for (handle, size, byte) in objects {
                    assert_filled(allocator, handle, size, byte);
                    allocator.free(handle);
                }
            });
        }
    });

    assert_verified(&allocator);
    let info = allocator.info(false);
    assert_eq!(info.mbcs.carriers.current, 1);
    assert_eq!(info.mbcs.blocks.current, 0);
    assert_eq!(info.sbcs.carriers.current, 0);
    assert_eq!(info.calls.alloc.total(), info.calls.free.total());
}

fn alloc_free_sequence<I: FreeBlockIndex + Default>(sizes: &[usize]) {
    let allocator = start::<I>(test_config());

    let handles = sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| {
            let handle = allocator.allocate(size).expect("allocation failed");
            fill(&allocator, handle, size, i as u8);
            handle
        })
        .collect::<Vec<_>>();
    assert_verified(&allocator);

    // A block is at least the rounded request, and more only when a free block was too small to
    // split and got consumed whole.
    let geometry = Geometry::new(&test_config());
    let mut rounded_total = 0;
    let mut block_total = 0;
    for (&handle, &size) in handles.iter().zip(sizes) {
        let rounded = geometry.block_size(size);
        let block = allocator.usable_size(handle) + BLOCK_HEADER_SIZE;
        assert!(
            block >= rounded && block < rounded + geometry.min_block_size,
            "block of {block} bytes for a request of {size} bytes"
        );
        rounded_total += rounded;
        block_total += block;
    }
    let info = allocator.info(false);
    assert_eq!(info.mbcs.blocks_size.current + info.sbcs.blocks_size.current, block_total);
    assert!(block_total >= rounded_total);

    let (even, odd): (Vec<_>, Vec<_>) = handles.iter().enumerate().partition(|(i, _)| i % 2 == 0);
    for (i, &handle) in even.into_iter().chain(odd) {
        assert_filled(&allocator, handle, sizes[i], i as u8);
        allocator.free(handle);
        assert_verified(&allocator);
    }

    let info = allocator.info(false);
    assert_eq!(info.mbcs.carriers.current, 1);
    assert_eq!(info.mbcs.blocks.current, 0);
    assert_eq!(info.sbcs.carriers.current, 0);
}

fn unsynchronized_reentry<I: FreeBlockIndex + Default>() {
    let config = Config {
        thread_safe: false,
        ..test_config()
    };
    let allocator = start::<I>(config);
    let handle = allocator.allocate(10).expect("allocation failed");
    allocator.with_payload(handle, |_| {
        let _ = allocator.allocate(10);
    });
}

fn double_free<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());
    let a = allocator.allocate(100).expect("allocation failed");
    let _b = allocator.allocate(100).expect("allocation failed");
    allocator.free(a);
    allocator.free(a);
}

fn foreign_handle<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());
    let other = start::<I>(test_config());
    let handle = other.allocate(20_000).expect("allocation failed");
    allocator.free(handle);
}

fn unrepresentable_size<I: FreeBlockIndex + Default>() {
    let allocator = start::<I>(test_config());
    let _ = allocator.allocate(usize::MAX);
}

macro_rules! common_tests {
    ( I = $index:ty $(,)? ) => {
        #[test]
        fn small_and_large() {
            $crate::tests::small_and_large::<$index>()
        }

        #[test]
        fn reuse_freed_block() {
            $crate::tests::reuse_freed_block::<$index>()
        }

        #[test]
        fn alignment() {
            $crate::tests::alignment::<$index>()
        }

        #[test]
        fn zero_sizes() {
            $crate::tests::zero_sizes::<$index>()
        }

        #[test]
        fn grow_in_place() {
            $crate::tests::grow_in_place::<$index>()
        }

        #[test]
        fn shrink_in_place() {
            $crate::tests::shrink_in_place::<$index>()
        }

        #[test]
        fn grow_reallocated() {
            $crate::tests::grow_reallocated::<$index>()
        }

        #[test]
        fn multi_to_single_block() {
            $crate::tests::multi_to_single_block::<$index>()
        }

        #[test]
        fn single_block_shrinks() {
            $crate::tests::single_block_shrinks::<$index>()
        }

        #[test]
        fn single_block_moves() {
            $crate::tests::single_block_moves::<$index>()
        }

        #[test]
        fn custom_move_policy() {
            $crate::tests::custom_move_policy::<$index>()
        }

        #[test]
        fn carrier_lifecycle() {
            $crate::tests::carrier_lifecycle::<$index>()
        }

        #[test]
        fn no_main_carrier() {
            $crate::tests::no_main_carrier::<$index>()
        }

        #[test]
        fn growth_schedule() {
            $crate::tests::growth_schedule::<$index>()
        }

        #[test]
        fn segment_caps() {
            $crate::tests::segment_caps::<$index>()
        }

        #[test]
        fn rejected_segments_are_not_counted() {
            $crate::tests::rejected_segments_are_not_counted::<$index>()
        }

        #[test]
        fn emergency_single_block() {
            $crate::tests::emergency_single_block::<$index>()
        }

        #[test]
        fn resize_moves_to_other_store() {
            $crate::tests::resize_moves_to_other_store::<$index>()
        }

        #[test]
        fn failed_resize_keeps_allocation() {
            $crate::tests::failed_resize_keeps_allocation::<$index>()
        }

        #[test]
        fn info_periods() {
            $crate::tests::info_periods::<$index>()
        }

        #[test]
        fn crash_info() {
            $crate::tests::crash_info::<$index>()
        }

        #[test]
        fn stop_releases_everything() {
            $crate::tests::stop_releases_everything::<$index>()
        }

        #[test]
        fn verify_detects_corruption() {
            $crate::tests::verify_detects_corruption::<$index>()
        }

        #[test]
        #[cfg(not(miri))]
        fn random() {
            $crate::tests::random::<$index>()
        }

        #[test]
        #[cfg(not(miri))]
        fn threads() {
            $crate::tests::threads::<$index>()
        }

        #[test]
        #[should_panic(expected = "concurrent use")]
        fn unsynchronized_reentry() {
            $crate::tests::unsynchronized_reentry::<$index>()
        }

        #[test]
        #[should_panic(expected = "refers to a free block")]
        fn double_free() {
            $crate::tests::double_free::<$index>()
        }

        #[test]
        #[should_panic(expected = "does not exist")]
        fn foreign_handle() {
            $crate::tests::foreign_handle::<$index>()
        }

        #[test]
        #[should_panic(expected = "cannot be represented")]
        fn unrepresentable_size() {
            $crate::tests::unrepresentable_size::<$index>()
        }

        #[cfg(not(miri))]
        proptest::proptest! {
            #[test]
            fn alloc_free_sequence(sizes in proptest::collection::vec(1usize..50_000, 1..40)) {
                $crate::tests::alloc_free_sequence::<$index>(&sizes)
            }
        }
    };
}

use common_tests;

#[allow(non_snake_case)]
mod AddressOrderFirstFit {
    super::common_tests!(I = crate::AddressOrderFirstFit);
}

#[allow(non_snake_case)]
mod BestFit {
    super::common_tests!(I = crate::BestFit);
}

fn free_blocks() -> [FreeBlock; 3] {
    let carrier = CarrierId::MIN;
    [
        FreeBlock {
            block: BlockRef::new(carrier, 96),
            size: 64,
        },
        FreeBlock {
            block: BlockRef::new(carrier, 256),
            size: 32,
        },
        FreeBlock {
            block: BlockRef::new(carrier, 512),
            size: 48,
        },
    ]
}

#[test]
fn first_fit_picks_lowest_address() {
    let mut index = crate::AddressOrderFirstFit::new();
    for block in free_blocks() {
        index.insert(block);
    }
    assert_eq!(index.len(), 3);

    assert_eq!(index.find(40), Some(free_blocks()[0]));
    assert_eq!(index.len(), 2);
    assert!(!index.contains(free_blocks()[0]));
    assert_eq!(index.find(40), Some(free_blocks()[2]));
    assert_eq!(index.find(40), None);

    index.remove(free_blocks()[1]);
    assert!(index.is_empty());
}

#[test]
fn best_fit_picks_smallest_block() {
    let mut index = crate::BestFit::new();
    for block in free_blocks() {
        index.insert(block);
    }

    assert_eq!(index.find(40), Some(free_blocks()[2]));
    assert_eq!(index.find(16), Some(free_blocks()[1]));
    assert_eq!(index.find(100), None);
    assert!(index.contains(free_blocks()[0]));

    index.carrier_destroyed(CarrierId::MIN);
    assert!(index.is_empty());
}

#[test]
fn call_counter_rollover() {
    let mut counter = CallCounter {
        giga: 0,
        count: 999_999_999,
    };
    counter.increment();
    assert_eq!(counter, CallCounter { giga: 1, count: 0 });
    assert_eq!(counter.total(), 1_000_000_000);
    assert_eq!(counter.to_string(), "1 0");

    counter.increment();
    assert_eq!(counter.total(), 1_000_000_001);
}

#[test]
fn waste_threshold() {
    assert!(waste_below_threshold(4096, 1032, 80));
    assert!(!waste_below_threshold(4096, 132, 80));
    assert!(!waste_below_threshold(4096, 1032, 0));
    assert!(waste_below_threshold(0, 0, 80));
}

#[test]
fn config_from_json() {
    let config: Config = serde_json::from_str(
        r#"{
            "name": "binary_alloc",
            "single_block_threshold": 1024,
            "thread_safe": false,
            "store": { "segment_unit_size": 8192, "generic_memory_limit": 1048576 }
        }"#,
    )
    .expect("invalid configuration");

    assert_eq!(config.name, "binary_alloc");
    assert_eq!(config.single_block_threshold, 1024);
    assert!(!config.thread_safe);
    assert_eq!(config.main_carrier_size, Config::default().main_carrier_size);
    assert_eq!(
        config.store,
        StoreConfig {
            segment_unit_size: 8192,
            generic_memory_limit: Some(1_048_576),
            ..StoreConfig::default()
        }
    );

    let json = serde_json::to_string(&config).expect("serialization failed");
    let again: Config = serde_json::from_str(&json).expect("invalid configuration");
    assert_eq!(again.name, config.name);
    assert_eq!(again.store, config.store);
    assert!(!json.contains("move_policy"));
}

#[test]
fn info_to_json() {
    let allocator =
        Allocator::start(test_config(), crate::BestFit::new()).expect("start failed");
    let _handle = allocator.allocate(20_000).expect("allocation failed");

    let value = serde_json::to_value(allocator.info(false)).expect("serialization failed");
    assert_eq!(value["name"], "test_alloc");
    assert_eq!(value["options"]["main_carrier_size"], 4096);
    assert_eq!(value["mbcs"]["carriers"]["current"], 1);
    assert_eq!(value["sbcs"]["segment_carriers_size"]["max_ever"], 20_480);
    assert_eq!(value["calls"]["alloc"], serde_json::json!({ "giga": 0, "count": 1 }));
}

#[test]
fn start_errors() {
    fn start_with(config: Config) -> Result<(), StartError> {
        Allocator::start(config, crate::AddressOrderFirstFit::new()).map(|_| ())
    }

    assert_eq!(
        start_with(Config {
            name: String::new(),
            ..test_config()
        }),
        Err(StartError::MissingName)
    );
    assert_eq!(
        start_with(Config {
            min_block_size: 4,
            ..test_config()
        }),
        Err(StartError::MinBlockSizeTooSmall {
            min_block_size: 4,
            header_size: 8,
        })
    );
    assert_eq!(
        start_with(Config {
            carrier_header_size: 8,
            ..test_config()
        }),
        Err(StartError::CarrierHeaderTooSmall {
            carrier_header_size: 8,
            record_size: 16,
        })
    );
    assert_eq!(
        start_with(Config {
            store: StoreConfig {
                segment_unit_size: 1000,
                ..StoreConfig::default()
            },
            ..test_config()
        }),
        Err(StartError::InvalidStoreUnit {
            store: StoreKind::Segment,
            size: 1000,
            unit: ALIGNMENT,
        })
    );
    assert_eq!(
        start_with(Config {
            store: StoreConfig {
                generic_memory_limit: Some(100),
                ..StoreConfig::default()
            },
            ..test_config()
        }),
        Err(StartError::MainCarrier { size: 4096 })
    );
}
