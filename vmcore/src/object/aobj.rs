// SPDX-License-Identifier: MPL-2.0

//! The anonymous/swap-backed pager.

use crate::{
    context::VmContext,
    object::{PagerOps, PutStatus, VmObject, VmObjectInner},
    page::Page,
    pager::{self, AioDesc, PagerFlags},
    prelude::*,
};

/// A pager for anonymous memory whose backing store is the swap drum.
///
/// The pager keeps a table mapping object offsets to drum slots. A page
/// with no slot has never been written out and reads back as zeroes. This
/// is the one variant that requests asynchronous puts: the transfer itself
/// runs in-line against the drum, but disposal of the cluster is deferred
/// to the completion queue, where a real transport's completion interrupt
/// would land.
pub struct SwapPager {
    slots: SpinLock<BTreeMap<usize, u32>>,
}

impl SwapPager {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            slots: SpinLock::new(BTreeMap::new()),
        })
    }

    /// Returns the drum slot holding `offset`, if one was ever assigned.
    pub fn slot_of(&self, offset: usize) -> Option<u32> {
        self.slots.lock().get(&offset).copied()
    }
}

impl PagerOps for SwapPager {
    fn kind(&self) -> &'static str {
        "aobj"
    }

    fn get(
        &self,
        ctx: &VmContext,
        _obj: &Arc<VmObject>,
        offset: usize,
        npages: usize,
        flags: PagerFlags,
    ) -> Result<Vec<Page>> {
        debug_assert_eq!(offset % PAGE_SIZE, 0);
        let pages: Vec<Page> = (0..npages).map(|_| ctx.alloc_page()).collect();
        let kva = ctx.window().map_in(&pages, flags)?;

        for i in 0..npages {
            let off = offset + i * PAGE_SIZE;
            let Some(slot) = self.slot_of(off) else {
                // Never swapped out; the freshly allocated page is already
                // zero-filled.
                continue;
            };
            let page = ctx.window().page_at(kva + i * PAGE_SIZE).unwrap();
            if let Err(err) = ctx.swap().read_slot(slot, &page) {
                ctx.window().map_out(kva, npages);
                return Err(err);
            }
        }

        ctx.window().map_out(kva, npages);
        trace!("aobj get {} page(s) at 0x{:x}", npages, offset);
        Ok(pages)
    }

    fn put(
        &self,
        ctx: &VmContext,
        obj: &Arc<VmObject>,
        cluster: &[(usize, Page)],
        flags: PagerFlags,
    ) -> Result<PutStatus> {
        let pages: Vec<Page> = cluster.iter().map(|(_, p)| p.clone()).collect();
        let kva = ctx.window().map_in(&pages, flags)?;

        let mut result = Ok(());
        for (i, (off, _)) in cluster.iter().enumerate() {
            debug_assert_eq!(off % PAGE_SIZE, 0);
            let (slot, fresh) = match self.slot_of(*off) {
                Some(slot) => (slot, false),
                None => match ctx.swap().alloc_slot() {
                    Ok(slot) => {
                        self.slots.lock().insert(*off, slot);
                        (slot, true)
                    }
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                },
            };
            let page = ctx.window().page_at(kva + i * PAGE_SIZE).unwrap();
            if let Err(err) = ctx.swap().write_slot(slot, &page) {
                // The slot holds no data; do not leave a dangling
                // assignment behind for a fresh slot.
                if fresh {
                    self.slots.lock().remove(off);
                    ctx.swap().free_slot(slot);
                }
                result = Err(err);
                break;
            }
        }

        if flags.contains(PagerFlags::SYNCIO) {
            ctx.window().map_out(kva, pages.len());
            result.map(|_| PutStatus::Done)
        } else {
            // Queue the completion; the window stays mapped until the
            // completion context runs `aio_done`.
            trace!("aobj async put of {} page(s) queued", pages.len());
            let offsets: Vec<usize> = cluster.iter().map(|(off, _)| *off).collect();
            ctx.enqueue_aio(AioDesc::new(kva, offsets, obj, flags, result));
            Ok(PutStatus::Pending)
        }
    }

    fn flush(
        &self,
        ctx: &VmContext,
        obj: &Arc<VmObject>,
        start: usize,
        end: usize,
        flags: PagerFlags,
    ) -> Result<()> {
        pager::flush(ctx, obj, start, end, flags)
    }

    fn cluster(&self, offset: usize, lo: usize, hi: usize) -> core::ops::Range<usize> {
        // Anonymous pages cluster freely; the drum has no layout to respect
        // beyond the caller's bounds.
        lo.max(offset.saturating_sub(pager::CLUSTER_MAX / 2 * PAGE_SIZE))
            ..hi.min(offset + pager::CLUSTER_MAX / 2 * PAGE_SIZE)
    }

    fn release_page(
        &self,
        ctx: &VmContext,
        inner: &mut VmObjectInner,
        offset: usize,
        page: &Page,
    ) -> bool {
        if let Some(slot) = self.slots.lock().remove(&offset) {
            ctx.swap().free_slot(slot);
        }
        let resident_here = inner.find(offset).is_some_and(|p| p.same_as(page));
        if resident_here {
            inner.remove(offset);
        }
        true
    }

    fn aio_done(&self, ctx: &VmContext, obj: &Arc<VmObject>, aio: AioDesc) {
        // Recover the page handles from the window before tearing the
        // mapping down; the completion context has nothing else to go by.
        let cluster: Vec<(usize, Page)> = aio
            .offsets()
            .iter()
            .enumerate()
            .map(|(i, off)| {
                let page = ctx
                    .window()
                    .page_at(aio.kva() + i * PAGE_SIZE)
                    .expect("async cluster page vanished from the pager window");
                (*off, page)
            })
            .collect();
        ctx.window().map_out(aio.kva(), aio.npages());

        pager::drop_cluster(ctx, obj, &cluster, aio.flags(), aio.result().is_ok());
        trace!(
            "aobj async put of {} page(s) completed, ok={}",
            cluster.len(),
            aio.result().is_ok()
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::page::PageFlags;

    #[test]
    fn put_then_get_round_trips_through_the_drum() {
        let ctx = VmContext::new();
        let obj = VmObject::new(SwapPager::new());

        let page = ctx.alloc_page();
        page.write_bytes(b"anonymous data");
        page.set_flags(PageFlags::BUSY | PageFlags::DIRTY);
        obj.lock().insert(0, page.clone());

        let status = pager::put_cluster(
            &ctx,
            &obj,
            &[(0, page.clone())],
            PagerFlags::SYNCIO | PagerFlags::PDFREECLUST,
        )
        .unwrap();
        assert_eq!(status, PutStatus::Done);
        // The pagedaemon-mode put reclaimed the page.
        assert_eq!(obj.resident_count(), 0);
        assert_eq!(ctx.swap().used_slots(), 1);

        let pages = pager::get(&ctx, &obj, 0, 1, PagerFlags::SYNCIO).unwrap();
        let mut buf = alloc::vec![0u8; PAGE_SIZE];
        pages[0].read_bytes(&mut buf);
        assert_eq!(&buf[..14], b"anonymous data");
    }

    #[test]
    fn get_without_slot_is_zero_fill() {
        let ctx = VmContext::new();
        let obj = VmObject::new(SwapPager::new());
        let pages = pager::get(&ctx, &obj, 8 * PAGE_SIZE, 1, PagerFlags::SYNCIO).unwrap();
        let mut buf = alloc::vec![0u8; PAGE_SIZE];
        pages[0].read_bytes(&mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn failed_sync_put_releases_fresh_slot() {
        let ctx = VmContext::new();
        let obj = VmObject::new(SwapPager::new());

        let page = ctx.alloc_page();
        page.set_flags(PageFlags::BUSY | PageFlags::DIRTY);
        obj.lock().insert(0, page.clone());

        ctx.swap().inject_io_errors(1);
        let err = pager::put_cluster(&ctx, &obj, &[(0, page.clone())], PagerFlags::SYNCIO)
            .unwrap_err();
        assert_eq!(err.error(), Errno::EIO);
        assert_eq!(ctx.swap().used_slots(), 0);
        // The failed put left the page dirty and resident.
        assert!(page.is_dirty());
        assert_eq!(obj.resident_count(), 1);
    }
}
