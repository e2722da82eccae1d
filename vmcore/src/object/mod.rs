// SPDX-License-Identifier: MPL-2.0

//! Backing objects and the pager operation table.
//!
//! A [`VmObject`] is the abstraction over "where the pages of a region come
//! from": a file, a device, or anonymous swap-backed storage. The generic
//! part — the table of resident pages and its lock — is shared; everything
//! else is supplied by the object's [`PagerOps`] implementation. Dispatch
//! code never inspects which variant it is talking to: it only calls through
//! the operation table, and a variant that lacks a capability inherits the
//! explicit "not supported" default.

use crate::{
    context::VmContext,
    page::Page,
    pager::{AioDesc, Cluster, PagerFlags},
    prelude::*,
    sync::{ArcRwLockWriteGuard, RwLock},
};

mod aobj;
mod device;
mod vnode;

pub use aobj::SwapPager;
pub use device::DevicePager;
pub use vnode::VnodePager;

/// The outcome of a successful put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    /// The transfer completed synchronously.
    Done,
    /// The transfer was queued; completion arrives through the context's
    /// async queue and the object's `aio_done` capability.
    Pending,
}

/// The capability table of a backing object.
///
/// `get`/`put`/`flush` transport implementations are invoked *without* the
/// object lock held; the pages handed to `put` are marked busy by the
/// dispatch layer, which also owns their disposal (see
/// [`crate::pager::put_cluster`]).
pub trait PagerOps: Send + Sync {
    /// A short tag identifying the pager variant, for diagnostics only.
    fn kind(&self) -> &'static str;

    /// Notes that another mapping now references the object.
    fn reference(&self) {}

    /// Notes that a reference was dropped. Called when the last shared
    /// handle goes away; variant state is owned by the trait object, so
    /// there is usually nothing left to do.
    fn detach(&self) {}

    /// Reads `npages` pages starting at `offset` from the backing store.
    ///
    /// Returns freshly allocated pages; the dispatch layer enters them into
    /// the resident table.
    fn get(
        &self,
        _ctx: &VmContext,
        _obj: &Arc<VmObject>,
        _offset: usize,
        _npages: usize,
        _flags: PagerFlags,
    ) -> Result<Vec<Page>> {
        return_errno_with_message!(Errno::EOPNOTSUPP, "pager does not support get")
    }

    /// Writes the given cluster — pages tagged with their object offsets —
    /// to the backing store.
    fn put(
        &self,
        _ctx: &VmContext,
        _obj: &Arc<VmObject>,
        _cluster: &[(usize, Page)],
        _flags: PagerFlags,
    ) -> Result<PutStatus> {
        return_errno_with_message!(Errno::EOPNOTSUPP, "pager does not support put")
    }

    /// Writes back the dirty resident pages in `start..end`.
    fn flush(
        &self,
        _ctx: &VmContext,
        _obj: &Arc<VmObject>,
        _start: usize,
        _end: usize,
        _flags: PagerFlags,
    ) -> Result<()> {
        return_errno_with_message!(Errno::EOPNOTSUPP, "pager does not support flush")
    }

    /// Returns the offset range around `offset` that is profitable to write
    /// back in one transfer. The default declines clustering.
    fn cluster(&self, offset: usize, _lo: usize, _hi: usize) -> core::ops::Range<usize> {
        offset..offset + PAGE_SIZE
    }

    /// Builds the put cluster around a center page.
    ///
    /// The default is the generic collector in [`crate::pager::mk_pcluster`],
    /// which consults [`cluster`] for the profitable range; a variant with
    /// special knowledge of its backing layout may assemble the cluster
    /// itself. The caller holds the object lock.
    ///
    /// [`cluster`]: Self::cluster
    fn mk_put_cluster(
        &self,
        obj: &Arc<VmObject>,
        inner: &mut VmObjectInner,
        center: &Page,
        center_off: usize,
        flags: PagerFlags,
        lo: usize,
        hi: usize,
    ) -> Cluster {
        crate::pager::mk_pcluster(obj, inner, center, center_off, flags, lo, hi)
    }

    /// Resolves a fault directly, for objects whose pages are not managed
    /// through get/put (e.g. device memory).
    fn fault(&self, _ctx: &VmContext, _obj: &Arc<VmObject>, _offset: usize) -> Result<Page> {
        return_errno_with_message!(Errno::EOPNOTSUPP, "pager does not support direct fault")
    }

    /// Disposes of a page marked released once its current operation ends.
    ///
    /// Returns whether the object is still alive afterwards.
    fn release_page(
        &self,
        _ctx: &VmContext,
        inner: &mut VmObjectInner,
        offset: usize,
        page: &Page,
    ) -> bool {
        let resident_here = inner.find(offset).is_some_and(|p| p.same_as(page));
        if resident_here {
            inner.remove(offset);
        }
        true
    }

    /// Finishes an asynchronous operation. Only reachable for variants that
    /// actually request async mode; the default cleans up the window mapping
    /// so a spurious completion cannot leak window space.
    fn aio_done(&self, ctx: &VmContext, _obj: &Arc<VmObject>, aio: AioDesc) {
        error!(
            "{} pager received an async completion it never requested",
            self.kind()
        );
        ctx.window().map_out(aio.kva(), aio.npages());
    }
}

/// A backing object: the shared resident-page table plus the variant's
/// operation table.
pub struct VmObject {
    pager: Box<dyn PagerOps>,
    inner: Arc<RwLock<VmObjectInner>>,
}

/// The lock-protected resident-page table of a [`VmObject`].
pub struct VmObjectInner {
    pages: BTreeMap<usize, Page>,
}

/// An owned guard over an object's resident-page table.
pub type ObjectGuard = ArcRwLockWriteGuard<VmObjectInner>;

impl VmObject {
    /// Creates an object driven by the given pager.
    pub fn new(pager: Box<dyn PagerOps>) -> Arc<Self> {
        Arc::new(Self {
            pager,
            inner: Arc::new(RwLock::new(VmObjectInner {
                pages: BTreeMap::new(),
            })),
        })
    }

    /// Returns the object's operation table.
    pub fn pager(&self) -> &dyn PagerOps {
        &*self.pager
    }

    /// Acquires the object lock.
    pub fn lock(&self) -> ObjectGuard {
        self.inner.write_arc()
    }

    /// Attempts to acquire the object lock without waiting.
    pub fn try_lock(&self) -> Option<ObjectGuard> {
        self.inner.try_write_arc()
    }

    /// Takes another reference to the object, notifying the pager.
    pub fn dup(self: &Arc<Self>) -> Arc<Self> {
        self.pager.reference();
        Arc::clone(self)
    }

    /// Returns the number of resident pages.
    pub fn resident_count(&self) -> usize {
        self.inner.read().pages.len()
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        self.pager.detach();
    }
}

impl VmObjectInner {
    /// Returns the resident page at `offset`, if any.
    pub fn find(&self, offset: usize) -> Option<&Page> {
        self.pages.get(&offset)
    }

    /// Enters a page into the resident table, replacing any previous page at
    /// that offset.
    pub fn insert(&mut self, offset: usize, page: Page) {
        self.pages.insert(offset, page);
    }

    /// Removes the resident page at `offset`.
    pub fn remove(&mut self, offset: usize) -> Option<Page> {
        self.pages.remove(&offset)
    }

    /// Returns the number of resident pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Returns the lowest and highest resident offsets.
    pub fn bounds(&self) -> Option<(usize, usize)> {
        let first = *self.pages.keys().next()?;
        let last = *self.pages.keys().next_back()?;
        Some((first, last))
    }
}
