// SPDX-License-Identifier: MPL-2.0

//! The device pager.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    context::VmContext,
    object::{PagerOps, VmObject},
    page::{Page, PageFlags},
    prelude::*,
};

/// A pager over device memory.
///
/// Device frames exist for the lifetime of the device and are never paged
/// out, so this variant declines `get`/`put` entirely (they inherit the
/// explicit "not supported" defaults) and instead resolves faults directly
/// through the `fault` capability.
pub struct DevicePager {
    frames: Vec<Page>,
    attachments: Arc<AtomicUsize>,
}

impl DevicePager {
    /// Creates a pager exposing `npages` device frames.
    pub fn new(ctx: &VmContext, npages: usize) -> Box<Self> {
        let frames: Vec<Page> = (0..npages)
            .map(|_| {
                let page = ctx.alloc_page();
                page.set_flags(PageFlags::ACTIVE);
                page
            })
            .collect();
        Box::new(Self {
            frames,
            attachments: Arc::new(AtomicUsize::new(1)),
        })
    }

    /// Returns a handle to the attachment counter, which tracks how many
    /// mappings reference the device.
    pub fn attachments(&self) -> Arc<AtomicUsize> {
        self.attachments.clone()
    }
}

impl PagerOps for DevicePager {
    fn kind(&self) -> &'static str {
        "device"
    }

    fn reference(&self) {
        self.attachments.fetch_add(1, Ordering::AcqRel);
    }

    fn detach(&self) {
        trace!(
            "device pager torn down after {} attachment(s)",
            self.attachments.load(Ordering::Acquire)
        );
    }

    fn fault(&self, _ctx: &VmContext, obj: &Arc<VmObject>, offset: usize) -> Result<Page> {
        let index = offset / PAGE_SIZE;
        let Some(frame) = self.frames.get(index) else {
            return_errno_with_message!(Errno::EFAULT, "fault beyond the device's frames");
        };
        obj.lock().insert(offset, frame.clone());
        Ok(frame.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{object::PutStatus, pager::PagerFlags};

    #[test]
    fn fault_maps_device_frame() {
        let ctx = VmContext::new();
        let obj = VmObject::new(DevicePager::new(&ctx, 4));
        let page = obj.pager().fault(&ctx, &obj, 2 * PAGE_SIZE).unwrap();
        // Faulting again yields the very same frame.
        let again = obj.pager().fault(&ctx, &obj, 2 * PAGE_SIZE).unwrap();
        assert!(page.same_as(&again));
        assert_eq!(obj.resident_count(), 1);
    }

    #[test]
    fn fault_beyond_frames_fails() {
        let ctx = VmContext::new();
        let obj = VmObject::new(DevicePager::new(&ctx, 2));
        let err = obj.pager().fault(&ctx, &obj, 8 * PAGE_SIZE).unwrap_err();
        assert_eq!(err.error(), Errno::EFAULT);
    }

    #[test]
    fn paging_capabilities_are_declined() {
        let ctx = VmContext::new();
        let obj = VmObject::new(DevicePager::new(&ctx, 1));
        let err = obj
            .pager()
            .get(&ctx, &obj, 0, 1, PagerFlags::SYNCIO)
            .unwrap_err();
        assert_eq!(err.error(), Errno::EOPNOTSUPP);
        let empty: &[(usize, crate::page::Page)] = &[];
        let err: Error = obj
            .pager()
            .put(&ctx, &obj, empty, PagerFlags::SYNCIO)
            .map(|_: PutStatus| ())
            .unwrap_err();
        assert_eq!(err.error(), Errno::EOPNOTSUPP);
    }

    #[test]
    fn reference_notes_new_attachments() {
        let ctx = VmContext::new();
        let pager = DevicePager::new(&ctx, 1);
        let attachments = pager.attachments();
        let obj = VmObject::new(pager);
        assert_eq!(attachments.load(Ordering::Acquire), 1);
        let dup = obj.dup();
        assert_eq!(attachments.load(Ordering::Acquire), 2);
        drop(dup);
        drop(obj);
    }
}
