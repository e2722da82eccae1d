// SPDX-License-Identifier: MPL-2.0

//! Page handles.
//!
//! A [`Page`] is an opaque, reference-counted handle to one physical frame.
//! Cloning the handle is taking a reference; the frame is released when the
//! last handle is dropped. The physical allocator proper is an external
//! collaborator — pages are produced by [`VmContext::alloc_page`] and carry
//! just enough state for the fault and pager paths: an atomic flag word, a
//! page-sized data buffer that backing-store transfers move bytes through,
//! and a wait queue for busy-page sleeps.
//!
//! [`VmContext::alloc_page`]: crate::context::VmContext::alloc_page

use core::sync::atomic::{AtomicU32, Ordering};

use crate::prelude::*;

bitflags! {
    /// The ownership and state bits of a page.
    pub struct PageFlags: u32 {
        /// The page is owned by an in-flight operation (I/O or fault
        /// resolution); everyone else must wait for it.
        const BUSY     = 1 << 0;
        /// Someone is waiting for the page to become un-busy.
        const WANTED   = 1 << 1;
        /// The page is scheduled to be released once its current operation
        /// finishes.
        const RELEASED = 1 << 2;
        /// The page has been modified since it was last written back.
        const DIRTY    = 1 << 3;
        /// The page was referenced recently.
        const ACTIVE   = 1 << 4;
    }
}

/// A reference-counted handle to one physical frame.
#[derive(Clone)]
pub struct Page {
    inner: Arc<PageInner>,
}

struct PageInner {
    index: u64,
    flags: AtomicU32,
    data: SpinLock<Box<[u8]>>,
    busy_wq: WaitQueue,
}

impl Page {
    /// Creates a zero-filled page with the given frame index.
    pub(crate) fn new(index: u64) -> Self {
        Self {
            inner: Arc::new(PageInner {
                index,
                flags: AtomicU32::new(0),
                data: SpinLock::new(alloc::vec![0u8; PAGE_SIZE].into_boxed_slice()),
                busy_wq: WaitQueue::new(),
            }),
        }
    }

    /// Returns the frame index of the page.
    pub fn index(&self) -> u64 {
        self.inner.index
    }

    /// Returns the number of handles referencing this frame.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Returns whether two handles refer to the same frame.
    pub fn same_as(&self, other: &Page) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns the current flag word.
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.inner.flags.load(Ordering::Acquire))
    }

    /// Sets the given flags.
    pub fn set_flags(&self, flags: PageFlags) {
        self.inner.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clears the given flags.
    pub fn clear_flags(&self, flags: PageFlags) {
        self.inner.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn is_busy(&self) -> bool {
        self.flags().contains(PageFlags::BUSY)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PageFlags::DIRTY)
    }

    /// Waits until the page is no longer busy.
    ///
    /// The waiter marks the page wanted first so that whoever owns the page
    /// knows to issue a wakeup when dropping the busy bit.
    pub fn wait_busy(&self) {
        self.inner.busy_wq.wait_until(|| {
            if self.is_busy() {
                self.set_flags(PageFlags::WANTED);
                None
            } else {
                Some(())
            }
        })
    }

    /// Drops the busy bit and wakes anyone waiting for the page.
    pub fn unbusy_wake(&self) {
        let was = PageFlags::from_bits_truncate(self.inner.flags.fetch_and(
            !(PageFlags::BUSY | PageFlags::WANTED).bits(),
            Ordering::AcqRel,
        ));
        if was.contains(PageFlags::WANTED) {
            self.inner.busy_wq.wake_all();
        }
    }

    /// Reads the page contents into `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is not exactly [`PAGE_SIZE`] bytes long.
    pub fn read_bytes(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), PAGE_SIZE);
        buf.copy_from_slice(&self.inner.data.lock());
    }

    /// Overwrites the page contents with `data`, zero-filling the tail if
    /// `data` is shorter than a page.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than [`PAGE_SIZE`] bytes.
    pub fn write_bytes(&self, data: &[u8]) {
        assert!(data.len() <= PAGE_SIZE);
        let mut guard = self.inner.data.lock();
        guard[..data.len()].copy_from_slice(data);
        guard[data.len()..].fill(0);
    }

    /// Zero-fills the page.
    pub fn zero(&self) {
        self.inner.data.lock().fill(0);
    }

    /// Copies the contents of `src` into this page.
    pub fn copy_from(&self, src: &Page) {
        // Stage through a buffer so that the two page locks are never held
        // at the same time.
        let mut buf = alloc::vec![0u8; PAGE_SIZE];
        src.read_bytes(&mut buf);
        self.write_bytes(&buf);
    }
}

impl Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index())
            .field("flags", &self.flags())
            .field("refs", &self.reference_count())
            .finish()
    }
}
