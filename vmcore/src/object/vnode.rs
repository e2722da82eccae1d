// SPDX-License-Identifier: MPL-2.0

//! The file-backed pager.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    context::VmContext,
    map::round_page,
    object::{PagerOps, PutStatus, VmObject},
    page::Page,
    pager::{self, PagerFlags},
    prelude::*,
};

/// How much of a file around the write-back center is profitable to carry in
/// one transfer.
const VNODE_CLUSTER_BYTES: usize = 16 * PAGE_SIZE;

/// A file image shared between a [`VnodePager`] and whoever opened the file.
pub type FileImage = Arc<SpinLock<Vec<u8>>>;

/// A pager backed by a file.
///
/// The file transport is modeled as a growable in-memory image held through
/// a shared handle (the "open file"); the interesting parts — moving page
/// contents through the pager window, the cluster policy, reference
/// bookkeeping — are the real thing.
pub struct VnodePager {
    file: FileImage,
    refs: AtomicUsize,
}

impl VnodePager {
    /// Creates a pager over an empty file.
    pub fn new() -> Box<Self> {
        Self::with_file(Arc::new(SpinLock::new(Vec::new())))
    }

    /// Creates a pager over a file with the given contents.
    pub fn with_contents(contents: Vec<u8>) -> Box<Self> {
        Self::with_file(Arc::new(SpinLock::new(contents)))
    }

    /// Creates a pager over an already-open file image.
    pub fn with_file(file: FileImage) -> Box<Self> {
        Box::new(Self {
            file,
            refs: AtomicUsize::new(1),
        })
    }

    /// Returns the current size of the backing file.
    pub fn file_size(&self) -> usize {
        self.file.lock().len()
    }
}

impl PagerOps for VnodePager {
    fn kind(&self) -> &'static str {
        "vnode"
    }

    fn reference(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn detach(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        trace!("vnode pager detached, {} reference(s) left", prev - 1);
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
        if offset >= round_page(self.file_size()) {
            return_errno_with_message!(Errno::EINVAL, "read past end of file");
        }
        let pages: Vec<Page> = (0..npages).map(|_| ctx.alloc_page()).collect();
        let kva = ctx.window().map_in(&pages, flags)?;

        // Transfer through the window, the way I/O code addresses the pages.
        let file = self.file.lock();
        for i in 0..npages {
            let off = offset + i * PAGE_SIZE;
            let page = ctx.window().page_at(kva + i * PAGE_SIZE).unwrap();
            if off < file.len() {
                let end = (off + PAGE_SIZE).min(file.len());
                page.write_bytes(&file[off..end]);
            }
        }
        drop(file);

        ctx.window().map_out(kva, npages);
        trace!("vnode get {} page(s) at 0x{:x}", npages, offset);
        Ok(pages)
    }

    fn put(
        &self,
        ctx: &VmContext,
        _obj: &Arc<VmObject>,
        cluster: &[(usize, Page)],
        flags: PagerFlags,
    ) -> Result<PutStatus> {
        let pages: Vec<Page> = cluster.iter().map(|(_, p)| p.clone()).collect();
        let kva = ctx.window().map_in(&pages, flags)?;

        let mut buf = alloc::vec![0u8; PAGE_SIZE];
        let mut file = self.file.lock();
        for (i, (off, _)) in cluster.iter().enumerate() {
            debug_assert_eq!(off % PAGE_SIZE, 0);
            if file.len() < off + PAGE_SIZE {
                file.resize(off + PAGE_SIZE, 0);
            }
            let page = ctx.window().page_at(kva + i * PAGE_SIZE).unwrap();
            page.read_bytes(&mut buf);
            file[*off..off + PAGE_SIZE].copy_from_slice(&buf);
        }
        drop(file);

        ctx.window().map_out(kva, pages.len());
        trace!("vnode put of a {}-page cluster", pages.len());
        Ok(PutStatus::Done)
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
        // Round out to the transfer window, but never past the file or the
        // caller's bounds.
        let start = (offset - offset % VNODE_CLUSTER_BYTES).max(lo);
        let end = (start + VNODE_CLUSTER_BYTES)
            .min(hi)
            .min(round_page(self.file_size()).max(offset + PAGE_SIZE));
        start..end
    }
}
