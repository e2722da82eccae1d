// SPDX-License-Identifier: MPL-2.0

//! The subsystem context.
//!
//! Everything that a kernel would keep as file-scope singletons — the pager
//! window, the async completion queue, the interrupt-safe map registry, the
//! swap drum, the fault counters — lives in an explicit [`VmContext`]
//! instead. A context is initialized once at subsystem startup and lives for
//! the rest of the process; tests create several independent contexts and
//! run them concurrently.

use core::{
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use hashbrown::HashMap;

use crate::{
    map::{MapFlags, VmMap},
    page::Page,
    pager::{AioDesc, PagerWindow, DEFAULT_WINDOW_PAGES, PAGER_WINDOW_BASE},
    prelude::*,
};

/// Options for initializing a [`VmContext`].
pub struct VmInitOptions {
    window_pages: usize,
    swap_slots: usize,
}

impl VmInitOptions {
    /// Creates the default set of options.
    pub fn new() -> Self {
        Self {
            window_pages: DEFAULT_WINDOW_PAGES,
            swap_slots: 1024,
        }
    }

    /// Sets the capacity of the pager window, in pages.
    pub fn window_pages(mut self, pages: usize) -> Self {
        self.window_pages = pages;
        self
    }

    /// Sets the capacity of the swap drum, in slots.
    pub fn swap_slots(mut self, slots: usize) -> Self {
        self.swap_slots = slots;
        self
    }

    /// Builds the context.
    pub fn build(self) -> VmContext {
        VmContext {
            window: PagerWindow::new(PAGER_WINDOW_BASE, self.window_pages),
            swap: SwapDrum::new(self.swap_slots),
            aio_queue: SpinLock::new(VecDeque::new()),
            aio_wq: WaitQueue::new(),
            intrsafe_maps: SpinLock::new(Vec::new()),
            stats: FaultStats::new(),
            next_page: AtomicU64::new(0),
        }
    }
}

impl Default for VmInitOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide state of the fault/pager subsystem.
pub struct VmContext {
    window: PagerWindow,
    swap: SwapDrum,
    aio_queue: SpinLock<VecDeque<AioDesc>>,
    aio_wq: WaitQueue,
    intrsafe_maps: SpinLock<Vec<Arc<VmMap>>>,
    stats: FaultStats,
    next_page: AtomicU64,
}

impl VmContext {
    /// Initializes a context with default options.
    pub fn new() -> Self {
        VmInitOptions::new().build()
    }

    /// Returns the pager window.
    pub fn window(&self) -> &PagerWindow {
        &self.window
    }

    /// Returns the swap drum.
    pub fn swap(&self) -> &SwapDrum {
        &self.swap
    }

    /// Returns the fault counters.
    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    /// Allocates a zero-filled page.
    ///
    /// This stands in for the physical allocator; the page is released when
    /// the last handle to it is dropped.
    pub fn alloc_page(&self) -> Page {
        let index = self.next_page.fetch_add(1, Ordering::Relaxed);
        Page::new(index)
    }

    /// Creates an address map covering `va_range`.
    ///
    /// Maps flagged [`MapFlags::INTRSAFE`] are registered so that fault
    /// handling can recognize them without taking a blocking lock.
    pub fn create_map(&self, va_range: Range<Vaddr>, flags: MapFlags) -> Arc<VmMap> {
        let map = VmMap::new(flags, va_range);
        if flags.contains(MapFlags::INTRSAFE) {
            self.intrsafe_maps.lock().push(map.clone());
        }
        map
    }

    /// Scans the interrupt-safe registry for a map covering `addr`.
    ///
    /// The registry holds a handful of fixed kernel maps and each map's
    /// range is immutable, so a linear scan suffices and no map lock is
    /// ever taken.
    pub(crate) fn find_intrsafe(&self, addr: Vaddr) -> Option<Arc<VmMap>> {
        self.intrsafe_maps
            .lock()
            .iter()
            .find(|map| map.va_range().contains(&addr))
            .cloned()
    }

    /// Queues a finished asynchronous operation for completion processing.
    ///
    /// Called from the I/O-completion context; the descriptor is consumed by
    /// [`drain_aio`].
    ///
    /// [`drain_aio`]: Self::drain_aio
    pub fn enqueue_aio(&self, aio: AioDesc) {
        self.aio_queue.lock().push_back(aio);
        self.aio_wq.wake_all();
    }

    /// Returns the number of queued, unprocessed completions.
    pub fn pending_aio(&self) -> usize {
        self.aio_queue.lock().len()
    }

    /// Processes every queued async completion, dispatching each descriptor
    /// to its owning object's `aio_done`. This is the pagedaemon's half of
    /// asynchronous I/O. Returns the number of completions processed.
    pub fn drain_aio(&self) -> usize {
        let mut processed = 0;
        loop {
            let Some(aio) = self.aio_queue.lock().pop_front() else {
                break;
            };
            match aio.object() {
                Some(obj) => obj.pager().aio_done(self, &obj, aio),
                None => {
                    // The object died with I/O in flight; all that is left
                    // to reclaim is the window mapping.
                    warn!("async completion for a dead object");
                    self.window.map_out(aio.kva(), aio.npages());
                }
            }
            processed += 1;
        }
        processed
    }
}

impl Default for VmContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The slot-table transport standing in for the swap device.
///
/// Slot numbers start at 1; slot 0 is reserved as "no slot assigned".
pub struct SwapDrum {
    inner: SpinLock<DrumInner>,
}

struct DrumInner {
    capacity: usize,
    next_slot: u32,
    free: Vec<u32>,
    store: HashMap<u32, Box<[u8]>>,
    fail_next: u32,
}

impl SwapDrum {
    fn new(capacity: usize) -> Self {
        Self {
            inner: SpinLock::new(DrumInner {
                capacity,
                next_slot: 1,
                free: Vec::new(),
                store: HashMap::new(),
                fail_next: 0,
            }),
        }
    }

    /// Reserves a slot.
    pub fn alloc_slot(&self) -> Result<u32> {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.free.pop() {
            return Ok(slot);
        }
        if inner.next_slot as usize > inner.capacity {
            return_errno_with_message!(Errno::ENOSPC, "swap drum is full");
        }
        let slot = inner.next_slot;
        inner.next_slot += 1;
        Ok(slot)
    }

    /// Returns a slot to the free pool, discarding its contents.
    pub fn free_slot(&self, slot: u32) {
        debug_assert_ne!(slot, 0);
        let mut inner = self.inner.lock();
        inner.store.remove(&slot);
        inner.free.push(slot);
    }

    /// Writes the page contents to `slot`.
    pub fn write_slot(&self, slot: u32, page: &Page) -> Result<()> {
        debug_assert_ne!(slot, 0);
        let mut buf = alloc::vec![0u8; PAGE_SIZE];
        page.read_bytes(&mut buf);
        let mut inner = self.inner.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return_errno_with_message!(Errno::EIO, "swap write failed");
        }
        inner.store.insert(slot, buf.into_boxed_slice());
        Ok(())
    }

    /// Reads the contents of `slot` into the page.
    pub fn read_slot(&self, slot: u32, page: &Page) -> Result<()> {
        debug_assert_ne!(slot, 0);
        let inner = self.inner.lock();
        if let Some(data) = inner.store.get(&slot) {
            page.write_bytes(data);
            Ok(())
        } else {
            return_errno_with_message!(Errno::EIO, "swap slot holds no data")
        }
    }

    /// Makes the next `count` writes fail with an I/O error, for exercising
    /// the failure paths.
    pub fn inject_io_errors(&self, count: u32) {
        self.inner.lock().fail_next = count;
    }

    /// Returns the number of slots currently holding data.
    pub fn used_slots(&self) -> usize {
        self.inner.lock().store.len()
    }
}

/// Counters over fault handling, kept per context.
pub struct FaultStats {
    faults: AtomicU64,
    zero_fills: AtomicU64,
    cow_copies: AtomicU64,
    pageins: AtomicU64,
    pageouts: AtomicU64,
    relock_stale: AtomicU64,
}

impl FaultStats {
    const fn new() -> Self {
        Self {
            faults: AtomicU64::new(0),
            zero_fills: AtomicU64::new(0),
            cow_copies: AtomicU64::new(0),
            pageins: AtomicU64::new(0),
            pageouts: AtomicU64::new(0),
            relock_stale: AtomicU64::new(0),
        }
    }

    pub(crate) fn count_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_zero_fill(&self) {
        self.zero_fills.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_cow_copy(&self) {
        self.cow_copies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_pagein(&self) {
        self.pageins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_pageout(&self) {
        self.pageouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_relock_stale(&self) {
        self.relock_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn zero_fills(&self) -> u64 {
        self.zero_fills.load(Ordering::Relaxed)
    }

    pub fn cow_copies(&self) -> u64 {
        self.cow_copies.load(Ordering::Relaxed)
    }

    pub fn pageins(&self) -> u64 {
        self.pageins.load(Ordering::Relaxed)
    }

    pub fn pageouts(&self) -> u64 {
        self.pageouts.load(Ordering::Relaxed)
    }

    pub fn relock_stale(&self) -> u64 {
        self.relock_stale.load(Ordering::Relaxed)
    }
}
