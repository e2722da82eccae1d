// SPDX-License-Identifier: MPL-2.0

//! Pager dispatch.
//!
//! This module moves pages between backing objects and physical memory. It
//! owns the pager window (the reserved kernel-virtual range that makes
//! physical pages addressable during a transfer), builds write-back clusters
//! of dirty pages around a center page, drives the object's `get`/`put`
//! capabilities, and manages the descriptors of asynchronous operations.

use align_ext::AlignExt;
use smallvec::SmallVec;

use crate::{
    context::VmContext,
    object::{PutStatus, VmObject, VmObjectInner},
    page::{Page, PageFlags},
    prelude::*,
};

#[cfg(test)]
mod test;

bitflags! {
    /// Flags steering pager operations.
    pub struct PagerFlags: u32 {
        /// Write dirty pages back (clean them).
        const CLEANIT     = 1 << 0;
        /// Perform the transfer synchronously.
        const SYNCIO      = 1 << 1;
        /// Deactivate pages after a successful put.
        const DEACTIVATE  = 1 << 2;
        /// Free pages after a successful put.
        const FREE        = 1 << 3;
        /// Flush every resident page of the object, ignoring the range.
        const ALLPAGES    = 1 << 4;
        /// Admit recently-referenced (active) pages into a put cluster.
        const DOACTCLUST  = 1 << 5;
        /// Dispose of the cluster after a successful put the way the
        /// pagedaemon wants: pages are released for reclaim rather than
        /// merely cleaned.
        const PDFREECLUST = 1 << 6;
        /// Fail instead of blocking when the pager window is exhausted.
        const NOWAIT      = 1 << 7;
    }
}

/// The most pages one cluster transfer may carry.
pub const CLUSTER_MAX: usize = 16;

/// The base address of the pager window.
pub const PAGER_WINDOW_BASE: Vaddr = 0xffff_ff80_0000_0000;

/// The number of window pages when not configured otherwise.
pub const DEFAULT_WINDOW_PAGES: usize = 256;

/// A write-back cluster: pages tagged with their object offsets.
///
/// Offsets need not be contiguous — a busy page in the middle of an
/// otherwise dirty range is skipped, not waited for, and the pages beyond
/// it still make the cluster.
pub type Cluster = SmallVec<[(usize, Page); CLUSTER_MAX]>;

/// The reserved kernel-virtual window pages are mapped into for I/O.
///
/// The window is a hard-capacity shared resource: when no contiguous run of
/// slots is free, [`map_in`] blocks until another transfer unmaps, unless
/// the caller opted out with [`PagerFlags::NOWAIT`].
///
/// [`map_in`]: Self::map_in
pub struct PagerWindow {
    base: Vaddr,
    slots: SpinLock<Vec<Option<Page>>>,
    wq: WaitQueue,
}

impl PagerWindow {
    pub(crate) fn new(base: Vaddr, capacity: usize) -> Self {
        Self {
            base,
            slots: SpinLock::new(alloc::vec![None; capacity]),
            wq: WaitQueue::new(),
        }
    }

    /// Returns the window capacity in pages.
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns the number of currently free window pages.
    pub fn free_pages(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_none()).count()
    }

    /// Maps `pages` contiguously into the window and returns the address of
    /// the first page.
    ///
    /// Blocks while no contiguous run is free; with [`PagerFlags::NOWAIT`]
    /// it fails with `EAGAIN` instead.
    pub fn map_in(&self, pages: &[Page], flags: PagerFlags) -> Result<Vaddr> {
        if pages.is_empty() || pages.len() > self.capacity() {
            return_errno_with_message!(Errno::EINVAL, "bad pager window request size");
        }
        if flags.contains(PagerFlags::NOWAIT) {
            return match self.try_map_in(pages) {
                Some(kva) => Ok(kva),
                None => {
                    debug!("pager window exhausted, caller declined to wait");
                    Err(Error::with_message(Errno::EAGAIN, "pager window exhausted"))
                }
            };
        }
        Ok(self.wq.wait_until(|| self.try_map_in(pages)))
    }

    fn try_map_in(&self, pages: &[Page]) -> Option<Vaddr> {
        let mut slots = self.slots.lock();
        let n = pages.len();
        let mut run = 0;
        let mut found = None;
        for i in 0..slots.len() {
            if slots[i].is_none() {
                run += 1;
                if run == n {
                    found = Some(i + 1 - n);
                    break;
                }
            } else {
                run = 0;
            }
        }
        let start = found?;
        for (j, page) in pages.iter().enumerate() {
            slots[start + j] = Some(page.clone());
        }
        Some(self.base + start * PAGE_SIZE)
    }

    /// Unmaps a run previously returned by [`map_in`] and wakes waiters.
    ///
    /// [`map_in`]: Self::map_in
    pub fn map_out(&self, kva: Vaddr, npages: usize) {
        let start = self.slot_index(kva);
        let mut slots = self.slots.lock();
        for slot in &mut slots[start..start + npages] {
            debug_assert!(slot.is_some(), "unmapping an unmapped window page");
            *slot = None;
        }
        drop(slots);
        self.wq.wake_all();
    }

    /// Maps an address inside the window back to the page mapped there.
    pub fn page_at(&self, addr: Vaddr) -> Option<Page> {
        let index = self.slot_index(addr);
        self.slots.lock().get(index).and_then(|s| s.clone())
    }

    fn slot_index(&self, addr: Vaddr) -> usize {
        debug_assert!(addr >= self.base);
        (addr - self.base) / PAGE_SIZE
    }
}

/// The descriptor of one in-flight asynchronous pager operation.
///
/// Created by the pager variant when it queues the transfer, carried through
/// the context's completion queue, and consumed by the variant's `aio_done`,
/// which unmaps the window range and disposes of the cluster.
pub struct AioDesc {
    kva: Vaddr,
    offsets: Vec<usize>,
    object: Weak<VmObject>,
    flags: PagerFlags,
    result: core::result::Result<(), Error>,
}

impl AioDesc {
    pub fn new(
        kva: Vaddr,
        offsets: Vec<usize>,
        object: &Arc<VmObject>,
        flags: PagerFlags,
        result: core::result::Result<(), Error>,
    ) -> Self {
        Self {
            kva,
            offsets,
            object: Arc::downgrade(object),
            flags,
            result,
        }
    }

    pub fn kva(&self) -> Vaddr {
        self.kva
    }

    pub fn npages(&self) -> usize {
        self.offsets.len()
    }

    /// The object offsets of the cluster pages, in window order.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn flags(&self) -> PagerFlags {
        self.flags
    }

    /// The transport's verdict on the transfer.
    pub fn result(&self) -> core::result::Result<(), Error> {
        self.result
    }

    /// Upgrades the back-reference to the owning object.
    pub fn object(&self) -> Option<Arc<VmObject>> {
        self.object.upgrade()
    }
}

/// Builds the cluster of pages to write back together with `center`.
///
/// The object's `cluster` capability proposes the profitable offset range
/// (a variant with no policy proposes just the center page); the cluster is
/// then every resident, dirty, non-busy page in that range, clipped to
/// `lo..hi` and [`CLUSTER_MAX`]. A busy page is skipped — its dirty state
/// will be retried on a later flush pass — rather than waited upon, so an
/// unrelated flush holding pages busy never stalls this one. Active pages
/// join only under [`PagerFlags::DOACTCLUST`]. Collected pages are marked
/// busy; the center must already be busy and dirty and is always included.
///
/// The caller must hold the object lock.
pub fn mk_pcluster(
    obj: &Arc<VmObject>,
    inner: &mut VmObjectInner,
    center: &Page,
    center_off: usize,
    flags: PagerFlags,
    lo: usize,
    hi: usize,
) -> Cluster {
    debug_assert!(center.is_busy() && center.is_dirty());

    let mut cluster = Cluster::new();
    cluster.push((center_off, center.clone()));

    let proposed = obj.pager().cluster(center_off, lo, hi);
    let clo = proposed.start.max(lo).align_down(PAGE_SIZE);
    let chi = proposed.end.min(hi).align_up(PAGE_SIZE);

    let mut off = clo;
    while off < chi && cluster.len() < CLUSTER_MAX {
        if off == center_off {
            off += PAGE_SIZE;
            continue;
        }
        let eligible = inner.find(off).is_some_and(|page| {
            let f = page.flags();
            !f.contains(PageFlags::BUSY)
                && !f.contains(PageFlags::RELEASED)
                && f.contains(PageFlags::DIRTY)
                && (flags.contains(PagerFlags::DOACTCLUST) || !f.contains(PageFlags::ACTIVE))
        });
        if eligible {
            let page = inner.find(off).unwrap().clone();
            page.set_flags(PageFlags::BUSY);
            cluster.push((off, page));
        }
        off += PAGE_SIZE;
    }
    cluster.sort_unstable_by_key(|(off, _)| *off);

    trace!(
        "cluster of {} page(s) in [0x{:x}..0x{:x}) around 0x{:x}",
        cluster.len(),
        clo,
        chi,
        center_off
    );
    cluster
}

/// Drives one write-back of `center` (which the caller has marked busy and
/// which must be dirty), clustering neighbors when the object allows it.
///
/// On success the cluster is disposed per `flags` (`PDFREECLUST` frees or
/// deactivates for the pagedaemon; plain `CLEANIT` merely cleans). A hard
/// I/O error never throws dirty data away: every page stays dirty and
/// resident for a later retry, and the error is propagated unchanged.
pub fn put(
    ctx: &VmContext,
    obj: &Arc<VmObject>,
    center: &Page,
    center_off: usize,
    flags: PagerFlags,
    lo: usize,
    hi: usize,
) -> Result<PutStatus> {
    let cluster = {
        let mut inner = obj.lock();
        obj.pager()
            .mk_put_cluster(obj, &mut inner, center, center_off, flags, lo, hi)
    };
    put_cluster(ctx, obj, &cluster, flags)
}

/// Like [`put`], but with a caller-supplied cluster. All pages must be busy.
pub fn put_cluster(
    ctx: &VmContext,
    obj: &Arc<VmObject>,
    cluster: &[(usize, Page)],
    flags: PagerFlags,
) -> Result<PutStatus> {
    debug_assert!(cluster.iter().all(|(_, p)| p.is_busy()));
    ctx.stats().count_pageout();
    match obj.pager().put(ctx, obj, cluster, flags) {
        Ok(PutStatus::Pending) => Ok(PutStatus::Pending),
        Ok(PutStatus::Done) => {
            drop_cluster(ctx, obj, cluster, flags, true);
            Ok(PutStatus::Done)
        }
        Err(err) => {
            warn!("pager put of a {}-page cluster failed: {:?}", cluster.len(), err);
            drop_cluster(ctx, obj, cluster, flags, false);
            Err(err)
        }
    }
}

/// Releases a cluster after its transfer finished (or failed).
///
/// Pages marked released while under I/O are handed to the object's
/// `release_page`. Otherwise, a successful put cleans the pages and, under
/// `PDFREECLUST`/`FREE`, drops them from the resident table (or merely
/// deactivates them under `DEACTIVATE`); a failed put leaves every page
/// dirty and resident.
pub fn drop_cluster(
    ctx: &VmContext,
    obj: &Arc<VmObject>,
    cluster: &[(usize, Page)],
    flags: PagerFlags,
    io_ok: bool,
) {
    let mut inner = obj.lock();
    for (offset, page) in cluster {
        if page.flags().contains(PageFlags::RELEASED) {
            page.unbusy_wake();
            obj.pager().release_page(ctx, &mut inner, *offset, page);
            continue;
        }
        page.unbusy_wake();
        if io_ok {
            page.clear_flags(PageFlags::DIRTY);
            if flags.intersects(PagerFlags::PDFREECLUST | PagerFlags::FREE) {
                inner.remove(*offset);
            } else if flags.contains(PagerFlags::DEACTIVATE) {
                page.clear_flags(PageFlags::ACTIVE);
            }
        } else {
            // The data never made it to backing store; the page must stay
            // dirty and resident so a later pass can retry it.
            page.set_flags(PageFlags::DIRTY);
        }
    }
}

/// Reads `npages` pages at `offset` from the object's backing store and
/// enters them into the resident table.
pub fn get(
    ctx: &VmContext,
    obj: &Arc<VmObject>,
    offset: usize,
    npages: usize,
    flags: PagerFlags,
) -> Result<Vec<Page>> {
    let pages = obj.pager().get(ctx, obj, offset, npages, flags)?;
    let mut inner = obj.lock();
    for (i, page) in pages.iter().enumerate() {
        inner.insert(offset + i * PAGE_SIZE, page.clone());
    }
    Ok(pages)
}

/// Writes back every dirty resident page in `start..end` (or the whole
/// object under [`PagerFlags::ALLPAGES`]), one cluster at a time. Busy
/// pages are skipped; they will be caught by a later pass.
pub fn flush(
    ctx: &VmContext,
    obj: &Arc<VmObject>,
    start: usize,
    end: usize,
    flags: PagerFlags,
) -> Result<()> {
    let (start, end) = if flags.contains(PagerFlags::ALLPAGES) {
        match obj.lock().bounds() {
            Some((first, last)) => (first, last + PAGE_SIZE),
            None => return Ok(()),
        }
    } else {
        (start, end)
    };
    let mut off = start.align_down(PAGE_SIZE);
    let end = end.align_up(PAGE_SIZE);
    while off < end {
        let center = {
            let inner = obj.lock();
            match inner.find(off) {
                Some(page) if page.is_dirty() && !page.is_busy() => {
                    page.set_flags(PageFlags::BUSY);
                    Some(page.clone())
                }
                _ => None,
            }
        };
        if let Some(center) = center {
            put(ctx, obj, &center, off, flags | PagerFlags::CLEANIT, start, end)?;
        }
        off += PAGE_SIZE;
    }
    Ok(())
}
