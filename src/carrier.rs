// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

use crate::header::unit_floor;
use crate::header::BlockFlags;
use crate::header::BlockHeader;
use crate::header::CarrierHeader;
use crate::header::BLOCK_HEADER_SIZE;
use crate::header::SBC_HEADER_SIZE;
use crate::header::WORD_SIZE;
use crate::index::BlockRef;
use crate::index::FreeBlockIndex;
use crate::store::BackingStore;
use crate::store::Region;
use crate::store::StoreKind;
use crate::AllocatorInner;
use crate::Handle;
use core::fmt;
use core::mem;
use log::debug;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

/// Identifies a carrier within its allocator instance.
///
/// Ids of destroyed carriers are reused by carriers created later.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct CarrierId(usize);

impl CarrierId {
    pub(crate) const MIN: Self = Self(0);

    #[inline]
    #[must_use]
    pub(crate) const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for CarrierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The two kinds of carrier.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum CarrierClass {
    /// Many blocks, carved by the block engine.
    MultiBlock,
    /// A single block for one large allocation.
    SingleBlock,
}

impl CarrierClass {
    #[inline]
    #[must_use]
    pub(crate) const fn index(self) -> usize {
        match self {
            Self::MultiBlock => 0,
            Self::SingleBlock => 1,
        }
    }
}

impl fmt::Display for CarrierClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MultiBlock => "multi-block",
            Self::SingleBlock => "single-block",
        })
    }
}

/// A carrier: a region obtained from a backing store, and its place in the carrier list.
///
/// The first words of the region repeat the carrier size, class, store and id (see
/// [`CarrierHeader`]), so that the region is self-describing.
#[derive(Debug)]
pub(crate) struct Carrier {
    pub(crate) region: Region,
    pub(crate) class: CarrierClass,
    pub(crate) store: StoreKind,
    pub(crate) prev: Option<CarrierId>,
    pub(crate) next: Option<CarrierId>,
}

impl Carrier {
    #[inline]
    #[must_use]
    pub(crate) const fn size(&self) -> usize {
        self.region.len()
    }

    #[inline]
    #[must_use]
    pub(crate) fn header(&self) -> CarrierHeader {
        CarrierHeader::from_word(self.region.read_word(0))
    }

    #[inline]
    #[must_use]
    pub(crate) fn recorded_id(&self) -> usize {
        self.region.read_word(WORD_SIZE)
    }

    fn write_header(&mut self, id: CarrierId) {
        let header = CarrierHeader {
            size: self.size(),
            class: self.class,
            store: self.store,
        };
        self.region.write_word(0, header.to_word());
        self.region.write_word(WORD_SIZE, id.index());
    }

    #[inline]
    #[must_use]
    pub(crate) fn block_header(&self, offset: usize) -> BlockHeader {
        BlockHeader::from_word(self.region.read_word(offset))
    }

    #[inline]
    pub(crate) fn set_block_header(&mut self, offset: usize, header: BlockHeader) {
        self.region.write_word(offset, header.to_word());
    }

    /// Reads the size footer of the free block ending at `end`.
    #[inline]
    #[must_use]
    pub(crate) fn footer(&self, end: usize) -> usize {
        self.region.read_word(end - WORD_SIZE)
    }

    #[inline]
    pub(crate) fn set_footer(&mut self, offset: usize, size: usize) {
        self.region.write_word(offset + size - WORD_SIZE, size);
    }
}

#[derive(Copy, Clone, Default, Debug)]
pub(crate) struct CarrierList {
    pub(crate) first: Option<CarrierId>,
    pub(crate) last: Option<CarrierId>,
}

/// All the carriers of an instance, addressed by [`CarrierId`], plus one list per class.
#[derive(Default, Debug)]
pub(crate) struct Carriers {
    slots: Vec<Option<Carrier>>,
    vacant: Vec<usize>,
    lists: [CarrierList; 2],
}

impl Carriers {
    #[inline]
    #[must_use]
    pub(crate) fn get(&self, id: CarrierId) -> Option<&Carrier> {
        self.slots.get(id.index())?.as_ref()
    }

    /// Like [`get`](Self::get), for ids that come from a live handle.
    #[inline]
    #[must_use]
    #[track_caller]
    pub(crate) fn carrier(&self, id: CarrierId) -> &Carrier {
        match self.get(id) {
            Some(carrier) => carrier,
            None => panic!("carrier {id} does not exist"),
        }
    }

    #[inline]
    #[must_use]
    #[track_caller]
    pub(crate) fn carrier_mut(&mut self, id: CarrierId) -> &mut Carrier {
        match self.slots.get_mut(id.index()).and_then(Option::as_mut) {
            Some(carrier) => carrier,
            None => panic!("carrier {id} does not exist"),
        }
    }

    #[inline]
    #[must_use]
    pub(crate) fn list(&self, class: CarrierClass) -> CarrierList {
        self.lists[class.index()]
    }

    /// Iterates over the carriers of a class, in list order.
    pub(crate) fn iter(&self, class: CarrierClass) -> CarrierIter<'_> {
        CarrierIter {
            carriers: self,
            next: self.list(class).first,
        }
    }

    /// Records a new carrier and appends it to the list of its class.
    fn link(&mut self, region: Region, class: CarrierClass, store: StoreKind) -> CarrierId {
        let carrier = Carrier {
            region,
            class,
            store,
            prev: self.lists[class.index()].last,
            next: None,
        };

        let id = match self.vacant.pop() {
            Some(index) => {
                self.slots[index] = Some(carrier);
                CarrierId(index)
            }
            None => {
                self.slots.push(Some(carrier));
                CarrierId(self.slots.len() - 1)
            }
        };

        let list = &mut self.lists[class.index()];
        let prev = list.last.replace(id);
        if list.first.is_none() {
            list.first = Some(id);
        }
        if let Some(prev) = prev {
            self.carrier_mut(prev).next = Some(id);
        }

        self.carrier_mut(id).write_header(id);
        id
    }

    /// Removes a carrier from its list and from the instance.
    fn unlink(&mut self, id: CarrierId) -> Carrier {
        let carrier = match self.slots.get_mut(id.index()).and_then(Option::take) {
            Some(carrier) => carrier,
            None => panic!("carrier {id} does not exist"),
        };
        self.vacant.push(id.index());

        let class = carrier.class.index();
        match carrier.prev {
            None => self.lists[class].first = carrier.next,
            Some(prev) => self.carrier_mut(prev).next = carrier.next,
        }
        match carrier.next {
            None => self.lists[class].last = carrier.prev,
            Some(next) => self.carrier_mut(next).prev = carrier.prev,
        }

        carrier
    }

    /// Copies `len` payload bytes between two allocated blocks, possibly in different carriers.
    pub(crate) fn copy_payload(&mut self, from: Handle, to: Handle, len: usize) {
        let src_range = from.offset()..from.offset() + len;
        let dst_offset = to.offset();

        if from.carrier() == to.carrier() {
            self.carrier_mut(from.carrier())
                .region
                .as_mut_slice()
                .copy_within(src_range, dst_offset);
            return;
        }

        let (a, b) = (from.carrier().index(), to.carrier().index());
        let (src, dst) = if a < b {
            let (left, right) = self.slots.split_at_mut(b);
            (&left[a], &mut right[0])
        } else {
            let (left, right) = self.slots.split_at_mut(a);
            (&right[0], &mut left[b])
        };
        let (Some(src), Some(dst)) = (src.as_ref(), dst.as_mut()) else {
            panic!("payload copy between carriers that do not exist");
        };
        dst.region.as_mut_slice()[dst_offset..dst_offset + len]
            .copy_from_slice(&src.region.as_slice()[src_range]);
    }
}

#[derive(Clone, Debug)]
pub(crate) struct CarrierIter<'a> {
    carriers: &'a Carriers,
    next: Option<CarrierId>,
}

impl<'a> Iterator for CarrierIter<'a> {
    type Item = (CarrierId, &'a Carrier);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let carrier = self.carriers.get(id)?;
        self.next = carrier.next;
        Some((id, carrier))
    }
}

/// How [`AllocatorInner::create_carrier`] may satisfy a request.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub(crate) struct CarrierRequest {
    /// Use only this store, with no fallback to the other one.
    pub(crate) force_store: Option<StoreKind>,
    /// Do not round the carrier size up to the store granularity.
    pub(crate) exact_size: bool,
    /// This is the main carrier.
    pub(crate) main: bool,
}

impl<I: FreeBlockIndex> AllocatorInner<I> {
    #[inline]
    pub(crate) fn store(&self, kind: StoreKind) -> &dyn BackingStore {
        match kind {
            StoreKind::Segment => &self.segments,
            StoreKind::Generic => &self.generic,
        }
    }

    #[inline]
    pub(crate) fn store_mut(&mut self, kind: StoreKind) -> &mut dyn BackingStore {
        match kind {
            StoreKind::Segment => &mut self.segments,
            StoreKind::Generic => &mut self.generic,
        }
    }

    /// Size of the next multi-block carrier, following the growth schedule.
    ///
    /// Sizes grow linearly from the smallest to the largest multi-block carrier size as more
    /// carriers exist; the main carrier does not count.
    pub(crate) fn next_mbc_size(&self) -> usize {
        let geometry = &self.geometry;
        let existing = self.stats.mbcs.carriers.current - usize::from(self.main_carrier.is_some());

        let size = if existing >= geometry.growth_stages {
            geometry.largest_mbc_size
        } else {
            let range = (geometry.largest_mbc_size - geometry.smallest_mbc_size) as u128;
            let step = range * existing as u128 / geometry.growth_stages as u128;
            geometry.smallest_mbc_size + step as usize
        };

        size.max(geometry.mbc_header_size + geometry.min_block_size)
    }

    fn carrier_size_for(
        &self,
        store: StoreKind,
        class: CarrierClass,
        block_size: usize,
        request: CarrierRequest,
    ) -> Option<usize> {
        match class {
            CarrierClass::SingleBlock => block_size.checked_add(SBC_HEADER_SIZE),
            CarrierClass::MultiBlock => {
                let needed = self.geometry.mbc_header_size.checked_add(block_size)?;
                Some(match (store, request.main) {
                    (_, true) => needed,
                    (StoreKind::Segment, false) => needed.max(self.next_mbc_size()),
                    (StoreKind::Generic, false) => needed.max(self.geometry.smallest_mbc_size),
                })
            }
        }
    }

    /// Creates a carrier able to hold a request of `size` bytes.
    ///
    /// For a single-block carrier the returned block is allocated. For a multi-block carrier the
    /// returned block is the free block spanning the carrier, and it is *not* in the index.
    pub(crate) fn create_carrier(
        &mut self,
        size: usize,
        class: CarrierClass,
        request: CarrierRequest,
    ) -> Option<BlockRef> {
        let block_size = self.geometry.block_size(size);

        let mut store = match request.force_store {
            Some(store) => store,
            None if self.segments.has_room(class) => StoreKind::Segment,
            None => StoreKind::Generic,
        };
        let mut fallback = request.force_store.is_none();

        let region = loop {
            let region = self
                .carrier_size_for(store, class, block_size, request)
                .and_then(|carrier_size| {
                    self.store_mut(store)
                        .acquire(carrier_size, class, request.exact_size)
                });
            if let Some(region) = region {
                break region;
            }
            if !fallback {
                warn!(
                    "{}: no store could provide a {class} carrier for {size} bytes",
                    self.config.name
                );
                return None;
            }
            warn!(
                "{}: {store} store could not provide a {class} carrier for {size} bytes, \
                 trying the {} store",
                self.config.name,
                store.other()
            );
            store = store.other();
            fallback = false;
        };

        let carrier_size = region.len();
        let id = self.carriers.link(region, class, store);
        let carrier = self.carriers.carrier_mut(id);

        let block = match class {
            CarrierClass::SingleBlock => {
                carrier.set_block_header(
                    SBC_HEADER_SIZE,
                    BlockHeader::new(block_size, BlockFlags::LAST),
                );
                self.stats.sbcs.carrier_created(store, carrier_size);
                self.stats.sbcs.block_allocated(block_size);
                BlockRef::new(id, SBC_HEADER_SIZE)
            }
            CarrierClass::MultiBlock => {
                let offset = self.geometry.mbc_header_size;
                let first_size = unit_floor(carrier_size - offset);
                carrier.set_block_header(
                    offset,
                    BlockHeader::new(first_size, BlockFlags::FREE | BlockFlags::LAST),
                );
                self.stats.mbcs.carrier_created(store, carrier_size);
                if request.main {
                    debug_assert!(self.main_carrier.is_none(), "main carrier created twice");
                    self.main_carrier = Some(id);
                }
                self.index.carrier_created(id);
                BlockRef::new(id, offset)
            }
        };

        debug!(
            "{}: created {class} carrier {id} of {carrier_size} bytes in the {store} store{}",
            self.config.name,
            if request.main { " (main)" } else { "" }
        );
        Some(block)
    }

    /// Resizes the single-block carrier holding `block` for a request of `size` bytes.
    ///
    /// On failure the carrier and its payload are left untouched.
    pub(crate) fn resize_carrier(&mut self, block: BlockRef, size: usize) -> Option<BlockRef> {
        let id = block.carrier();
        let new_block_size = self.geometry.block_size(size);
        let new_carrier_size = new_block_size.checked_add(SBC_HEADER_SIZE)?;

        let carrier = self.carriers.carrier_mut(id);
        debug_assert_eq!(carrier.class, CarrierClass::SingleBlock);
        let store = carrier.store;
        let old_carrier_size = carrier.size();
        let old_block_size = carrier.block_header(SBC_HEADER_SIZE).size;
        let region = mem::replace(&mut carrier.region, Region::empty());

        let (region, resized) = match self.store_mut(store).resize(region, new_carrier_size) {
            Ok(region) => (region, true),
            Err(region) => (region, false),
        };

        let carrier = self.carriers.carrier_mut(id);
        carrier.region = region;

        if resized {
            carrier.write_header(id);
            carrier.set_block_header(
                SBC_HEADER_SIZE,
                BlockHeader::new(new_block_size, BlockFlags::LAST),
            );
            let carrier_size = carrier.size();
            let stats = &mut self.stats.sbcs;
            stats.block_freed(old_block_size);
            stats.carrier_destroyed(store, old_carrier_size);
            stats.carrier_created(store, carrier_size);
            stats.block_allocated(new_block_size);
            debug!(
                "{}: resized single-block carrier {id} in the {store} store from \
                 {old_carrier_size} to {carrier_size} bytes",
                self.config.name
            );
            return Some(block);
        }

        warn!(
            "{}: {store} store could not resize single-block carrier {id}, moving it",
            self.config.name
        );
        let request = CarrierRequest {
            force_store: Some(store.other()),
            ..CarrierRequest::default()
        };
        let new_block = self.create_carrier(size, CarrierClass::SingleBlock, request)?;
        let len = new_block_size.min(old_block_size) - BLOCK_HEADER_SIZE;
        self.carriers
            .copy_payload(Handle::from_block(block), Handle::from_block(new_block), len);
        self.destroy_carrier(id);
        Some(new_block)
    }

    /// Returns a carrier to its backing store.
    pub(crate) fn destroy_carrier(&mut self, id: CarrierId) {
        let carrier = self.carriers.unlink(id);
        let size = carrier.size();
        let class = carrier.class;
        let store = carrier.store;

        match class {
            CarrierClass::SingleBlock => {
                let block_size = carrier.block_header(SBC_HEADER_SIZE).size;
                self.stats.sbcs.block_freed(block_size);
                self.stats.sbcs.carrier_destroyed(store, size);
            }
            CarrierClass::MultiBlock => {
                self.stats.mbcs.carrier_destroyed(store, size);
                self.index.carrier_destroyed(id);
                if self.main_carrier == Some(id) {
                    self.main_carrier = None;
                }
            }
        }

        debug!(
            "{}: destroyed {class} carrier {id} of {size} bytes in the {store} store",
            self.config.name
        );
        self.store_mut(store).release(carrier.region, class);
    }
}
