// SPDX-License-Identifier: MPL-2.0

use std::{sync::Arc as StdArc, thread, time::Duration};

use super::*;
use crate::{
    context::{VmContext, VmInitOptions},
    object::{SwapPager, VmObject},
    page::{Page, PageFlags},
};

fn dirty_resident(ctx: &VmContext, obj: &Arc<VmObject>, off: usize, mark: u8) -> Page {
    let page = ctx.alloc_page();
    page.write_bytes(&[mark; 8]);
    page.set_flags(PageFlags::DIRTY);
    obj.lock().insert(off, page.clone());
    page
}

mod window {
    use super::*;

    #[test]
    fn round_trip() {
        let ctx = VmInitOptions::new().window_pages(8).build();
        let pages: Vec<Page> = (0..3).map(|_| ctx.alloc_page()).collect();

        let kva = ctx.window().map_in(&pages, PagerFlags::empty()).unwrap();
        for (i, page) in pages.iter().enumerate() {
            // Any address within the mapped page resolves to its handle.
            let at_base = ctx.window().page_at(kva + i * PAGE_SIZE).unwrap();
            let at_mid = ctx.window().page_at(kva + i * PAGE_SIZE + 123).unwrap();
            assert!(at_base.same_as(page));
            assert!(at_mid.same_as(page));
        }

        ctx.window().map_out(kva, pages.len());
        assert!(ctx.window().page_at(kva).is_none());
        assert_eq!(ctx.window().free_pages(), 8);
    }

    #[test]
    fn nowait_fails_when_exhausted() {
        let ctx = VmInitOptions::new().window_pages(4).build();
        let hog: Vec<Page> = (0..3).map(|_| ctx.alloc_page()).collect();
        let kva = ctx.window().map_in(&hog, PagerFlags::empty()).unwrap();

        let two: Vec<Page> = (0..2).map(|_| ctx.alloc_page()).collect();
        let err = ctx
            .window()
            .map_in(&two, PagerFlags::NOWAIT)
            .unwrap_err();
        assert_eq!(err.error(), Errno::EAGAIN);

        // A single page still fits in the remaining slot.
        let one = [ctx.alloc_page()];
        let kva1 = ctx.window().map_in(&one, PagerFlags::NOWAIT).unwrap();
        ctx.window().map_out(kva1, 1);
        ctx.window().map_out(kva, 3);
    }

    #[test]
    fn oversized_request_is_rejected() {
        let ctx = VmInitOptions::new().window_pages(4).build();
        let pages: Vec<Page> = (0..5).map(|_| ctx.alloc_page()).collect();
        let err = ctx.window().map_in(&pages, PagerFlags::empty()).unwrap_err();
        assert_eq!(err.error(), Errno::EINVAL);
    }

    #[test]
    fn blocks_until_space_frees_up() {
        let ctx = StdArc::new(VmInitOptions::new().window_pages(2).build());
        let hog: Vec<Page> = (0..2).map(|_| ctx.alloc_page()).collect();
        let kva = ctx.window().map_in(&hog, PagerFlags::empty()).unwrap();

        let waiter = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                let page = [ctx.alloc_page()];
                let kva = ctx.window().map_in(&page, PagerFlags::empty()).unwrap();
                ctx.window().map_out(kva, 1);
            })
        };

        thread::sleep(Duration::from_millis(20));
        ctx.window().map_out(kva, 2);
        waiter.join().unwrap();
        assert_eq!(ctx.window().free_pages(), 2);
    }
}

mod cluster {
    use super::*;

    #[test]
    fn skips_busy_and_clean_pages_keeps_center() {
        let ctx = VmContext::new();
        let obj = VmObject::new(SwapPager::new());

        let left = dirty_resident(&ctx, &obj, 0, 1);
        let center = dirty_resident(&ctx, &obj, PAGE_SIZE, 2);
        center.set_flags(PageFlags::BUSY);
        let busy = dirty_resident(&ctx, &obj, 2 * PAGE_SIZE, 3);
        busy.set_flags(PageFlags::BUSY);
        let right = dirty_resident(&ctx, &obj, 3 * PAGE_SIZE, 4);
        let clean = ctx.alloc_page();
        obj.lock().insert(4 * PAGE_SIZE, clean.clone());

        let cluster = {
            let mut inner = obj.lock();
            mk_pcluster(
                &obj,
                &mut inner,
                &center,
                PAGE_SIZE,
                PagerFlags::CLEANIT,
                0,
                5 * PAGE_SIZE,
            )
        };

        let offsets: Vec<usize> = cluster.iter().map(|(off, _)| *off).collect();
        // The busy page at 0x2000 is skipped, not waited for; the dirty
        // page beyond it still joins. The clean page never does.
        assert_eq!(offsets, alloc::vec![0, PAGE_SIZE, 3 * PAGE_SIZE]);
        assert!(cluster.iter().all(|(_, p)| p.is_busy()));
        assert!(left.is_busy() && right.is_busy());
        assert!(!clean.is_busy());
    }

    #[test]
    fn active_pages_join_only_with_doactclust() {
        let ctx = VmContext::new();
        let obj = VmObject::new(SwapPager::new());

        let active = dirty_resident(&ctx, &obj, 0, 1);
        active.set_flags(PageFlags::ACTIVE);
        let center = dirty_resident(&ctx, &obj, PAGE_SIZE, 2);
        center.set_flags(PageFlags::BUSY);

        let without = {
            let mut inner = obj.lock();
            mk_pcluster(
                &obj,
                &mut inner,
                &center,
                PAGE_SIZE,
                PagerFlags::CLEANIT,
                0,
                2 * PAGE_SIZE,
            )
        };
        assert_eq!(without.len(), 1);
        assert!(!active.is_busy());

        let with = {
            let mut inner = obj.lock();
            mk_pcluster(
                &obj,
                &mut inner,
                &center,
                PAGE_SIZE,
                PagerFlags::CLEANIT | PagerFlags::DOACTCLUST,
                0,
                2 * PAGE_SIZE,
            )
        };
        assert_eq!(with.len(), 2);
        assert!(active.is_busy());
    }
}

mod put {
    use super::*;

    #[test]
    fn failed_put_leaves_every_page_dirty_and_resident() {
        let ctx = VmContext::new();
        let obj = VmObject::new(SwapPager::new());

        let pages: Vec<Page> = (0..3)
            .map(|i| dirty_resident(&ctx, &obj, i * PAGE_SIZE, i as u8))
            .collect();
        let center = pages[1].clone();
        center.set_flags(PageFlags::BUSY);

        ctx.swap().inject_io_errors(1);
        let err = super::super::put(
            &ctx,
            &obj,
            &center,
            PAGE_SIZE,
            PagerFlags::CLEANIT | PagerFlags::SYNCIO | PagerFlags::PDFREECLUST,
            0,
            3 * PAGE_SIZE,
        )
        .unwrap_err();
        assert_eq!(err.error(), Errno::EIO);

        // No silent data loss: the whole cluster is still dirty, resident,
        // and no longer busy.
        assert_eq!(obj.resident_count(), 3);
        for page in &pages {
            assert!(page.is_dirty());
            assert!(!page.is_busy());
        }
    }

    #[test]
    fn successful_pagedaemon_put_reclaims_the_cluster() {
        let ctx = VmContext::new();
        let obj = VmObject::new(SwapPager::new());

        let a = dirty_resident(&ctx, &obj, 0, 1);
        let center = dirty_resident(&ctx, &obj, PAGE_SIZE, 2);
        center.set_flags(PageFlags::BUSY);

        let status = super::super::put(
            &ctx,
            &obj,
            &center,
            PAGE_SIZE,
            PagerFlags::CLEANIT | PagerFlags::SYNCIO | PagerFlags::PDFREECLUST,
            0,
            2 * PAGE_SIZE,
        )
        .unwrap();
        assert_eq!(status, PutStatus::Done);
        assert_eq!(obj.resident_count(), 0);
        assert!(!a.is_dirty());
        assert_eq!(ctx.swap().used_slots(), 2);
    }

    #[test]
    fn msync_style_put_cleans_but_keeps_pages() {
        let ctx = VmContext::new();
        let obj = VmObject::new(SwapPager::new());
        let center = dirty_resident(&ctx, &obj, 0, 9);
        center.set_flags(PageFlags::BUSY);

        let status = super::super::put(
            &ctx,
            &obj,
            &center,
            0,
            PagerFlags::CLEANIT | PagerFlags::SYNCIO,
            0,
            PAGE_SIZE,
        )
        .unwrap();
        assert_eq!(status, PutStatus::Done);
        assert_eq!(obj.resident_count(), 1);
        assert!(!center.is_dirty());
        assert!(!center.is_busy());
    }
}

mod aio {
    use super::*;

    #[test]
    fn async_put_completes_through_the_queue() {
        let ctx = VmInitOptions::new().window_pages(8).build();
        let obj = VmObject::new(SwapPager::new());

        let a = dirty_resident(&ctx, &obj, 0, 1);
        let center = dirty_resident(&ctx, &obj, PAGE_SIZE, 2);
        center.set_flags(PageFlags::BUSY);

        let free_before = ctx.window().free_pages();
        let status = super::super::put(
            &ctx,
            &obj,
            &center,
            PAGE_SIZE,
            PagerFlags::CLEANIT | PagerFlags::PDFREECLUST,
            0,
            2 * PAGE_SIZE,
        )
        .unwrap();
        assert_eq!(status, PutStatus::Pending);
        assert_eq!(ctx.pending_aio(), 1);
        // The window range stays mapped until completion runs.
        assert_eq!(ctx.window().free_pages(), free_before - 2);
        // Disposal is deferred: the pages are still busy.
        assert!(a.is_busy() && center.is_busy());

        assert_eq!(ctx.drain_aio(), 1);
        assert_eq!(ctx.pending_aio(), 0);
        assert_eq!(ctx.window().free_pages(), free_before);
        assert_eq!(obj.resident_count(), 0);
        assert!(!a.is_busy() && !center.is_busy());
        assert_eq!(ctx.swap().used_slots(), 2);
    }

    #[test]
    fn async_put_failure_surfaces_at_completion() {
        let ctx = VmContext::new();
        let obj = VmObject::new(SwapPager::new());
        let center = dirty_resident(&ctx, &obj, 0, 7);
        center.set_flags(PageFlags::BUSY);

        ctx.swap().inject_io_errors(1);
        let status = super::super::put(
            &ctx,
            &obj,
            &center,
            0,
            PagerFlags::CLEANIT | PagerFlags::PDFREECLUST,
            0,
            PAGE_SIZE,
        )
        .unwrap();
        // Async transport failures are reported at completion time, not at
        // submission.
        assert_eq!(status, PutStatus::Pending);
        assert_eq!(ctx.drain_aio(), 1);

        assert!(center.is_dirty());
        assert!(!center.is_busy());
        assert_eq!(obj.resident_count(), 1);
    }
}

mod flush {
    use super::*;

    #[test]
    fn allpages_flushes_the_whole_object() {
        let ctx = VmContext::new();
        let obj = VmObject::new(SwapPager::new());
        let near = dirty_resident(&ctx, &obj, 3 * PAGE_SIZE, 1);
        let far = dirty_resident(&ctx, &obj, 64 * PAGE_SIZE, 2);

        super::super::flush(
            &ctx,
            &obj,
            0,
            0,
            PagerFlags::SYNCIO | PagerFlags::ALLPAGES,
        )
        .unwrap();

        assert!(!near.is_dirty());
        assert!(!far.is_dirty());
        assert_eq!(obj.resident_count(), 2);
    }

    #[test]
    fn busy_pages_are_left_for_a_later_pass() {
        let ctx = VmContext::new();
        let obj = VmObject::new(SwapPager::new());
        let busy = dirty_resident(&ctx, &obj, 0, 1);
        busy.set_flags(PageFlags::BUSY);
        let plain = dirty_resident(&ctx, &obj, PAGE_SIZE, 2);

        super::super::flush(&ctx, &obj, 0, 2 * PAGE_SIZE, PagerFlags::SYNCIO).unwrap();

        assert!(busy.is_dirty(), "the busy page is untouched");
        assert!(!plain.is_dirty());
        busy.unbusy_wake();
    }
}
