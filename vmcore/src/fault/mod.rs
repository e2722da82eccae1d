// SPDX-License-Identifier: MPL-2.0

//! Fault resolution.
//!
//! [`FaultInfo`] resolves a faulting address to a locked map entry, handles
//! submap indirection, and provides the cheap relock-and-revalidate path
//! that lets the handler drop every lock, perform blocking pager I/O, and
//! resume. [`FaultLocks`] pins the canonical multi-lock discipline into a
//! type: the map lock is taken first (by [`FaultInfo::lookup`]), then amap,
//! then object, then anon; [`unlock_all`] releases them in exactly the
//! mirror order, which is the single most important invariant in the whole
//! subsystem — two faults on overlapping regions deadlock the moment one of
//! them improvises.
//!
//! [`handle_fault`] is the entry point the trap handler calls.

use crate::{
    amap::{Amap, AmapGuard, AmapInner, Anon, AnonGuard, AnonInner},
    context::VmContext,
    map::{trunc_page, EntryBacking, MapEntry, MapGuard, VmMap},
    object::{ObjectGuard, VmObject, VmObjectInner},
    page::PageFlags,
    pager::{self, PagerFlags},
    perms::VmPerms,
    prelude::*,
};


/// The state of one fault, from trap to resolution.
///
/// Stack-scoped: created per fault and never persisted. While the map lock
/// is held it lives in `self` as an owned guard, so the unlock → blocking
/// work → relock protocol works across call frames.
pub struct FaultInfo {
    orig_map: Arc<VmMap>,
    orig_rvaddr: Vaddr,
    orig_size: usize,
    /// The map the address resolved in; differs from `orig_map` after
    /// descending through submap entries.
    map: Arc<VmMap>,
    /// The map's version stamp, captured under the lock by `lookup` and
    /// valid only for comparison under the lock.
    mapv: u64,
    /// The fault size clipped to the resolved entry.
    size: usize,
    entry: Option<MapEntry>,
    guard: Option<MapGuard>,
}

impl FaultInfo {
    /// Prepares fault state for `size` bytes at `vaddr` in `map`.
    ///
    /// # Panics
    ///
    /// Panics (in debug builds) if `size` is zero.
    pub fn new(map: &Arc<VmMap>, vaddr: Vaddr, size: usize) -> Self {
        debug_assert!(size > 0);
        Self {
            orig_map: map.clone(),
            orig_rvaddr: trunc_page(vaddr),
            orig_size: size,
            map: map.clone(),
            mapv: 0,
            size,
            entry: None,
            guard: None,
        }
    }

    /// The page-aligned faulting address.
    pub fn fault_addr(&self) -> Vaddr {
        self.orig_rvaddr
    }

    /// The map the fault resolved in.
    pub fn map(&self) -> &Arc<VmMap> {
        &self.map
    }

    /// The version stamp captured by the last successful `lookup`.
    pub fn mapv(&self) -> u64 {
        self.mapv
    }

    /// The effective fault size, clipped to the resolved entry.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The resolved entry, a snapshot taken under the map lock.
    pub fn entry(&self) -> Option<&MapEntry> {
        self.entry.as_ref()
    }

    /// Whether the map lock is currently held by this fault.
    pub fn is_locked(&self) -> bool {
        self.guard.is_some()
    }

    /// Resolves the faulting address to a map entry, descending through
    /// submaps, and leaves the final map locked (exclusive if `write_lock`).
    ///
    /// Submap entries span the identical virtual range in parent and child,
    /// so the walk reuses the faulting address unchanged. On failure the
    /// map is fully unlocked and the condition is fatal to the faulting
    /// context — an unmapped address is never retried.
    pub fn lookup(&mut self, write_lock: bool) -> Result<()> {
        debug_assert!(self.guard.is_none());
        self.map = self.orig_map.clone();
        loop {
            let guard = if write_lock {
                self.map.lock_write()
            } else {
                self.map.lock_read()
            };
            let Some(entry) = guard.inner().lookup_entry(self.orig_rvaddr).cloned() else {
                drop(guard);
                trace!("no entry covers 0x{:x}", self.orig_rvaddr);
                return_errno_with_message!(Errno::EFAULT, "address not mapped");
            };
            self.size = self.orig_size.min(entry.end - self.orig_rvaddr);
            if let EntryBacking::Submap(submap) = &entry.backing {
                let submap = submap.clone();
                drop(guard);
                self.map = submap;
                continue;
            }
            self.mapv = guard.inner().version();
            self.entry = Some(entry);
            self.guard = Some(guard);
            return Ok(());
        }
    }

    /// Releases the map lock, in whatever mode `lookup` acquired it.
    pub fn unlock(&mut self) {
        debug_assert!(self.guard.is_some(), "unlocking an unlocked fault");
        self.guard = None;
    }

    /// Re-acquires the map in shared mode after blocking work, succeeding
    /// only if the map was not structurally modified in between.
    ///
    /// A `false` return is not an error: the map is left unlocked and the
    /// caller must redo `lookup` from the top.
    pub fn relock(&mut self) -> bool {
        debug_assert!(self.guard.is_none());
        let guard = self.map.lock_read();
        if guard.inner().version() != self.mapv {
            drop(guard);
            trace!("map changed under the fault, relock refused");
            return false;
        }
        self.guard = Some(guard);
        true
    }

    /// Checks whether the faulting address falls in an interrupt-safe map.
    ///
    /// Such maps hold pre-wired kernel memory and are exempt from the
    /// normal fault path: taking a blocking map lock at interrupt priority
    /// is fatal, so the registry scan records the map without locking it.
    pub fn check_intrsafe(&mut self, ctx: &VmContext) -> bool {
        if let Some(map) = ctx.find_intrsafe(self.orig_rvaddr) {
            self.map = map;
            true
        } else {
            false
        }
    }
}

/// The amap/object/anon locks a fault holds beyond the map lock.
///
/// Acquisition must follow the canonical order — amap, then object, then
/// anon, after the map lock — which the `lock_*` methods assert. The field
/// declaration order is the release order, so even an implicit drop
/// releases innermost-first.
pub struct FaultLocks {
    anon: Option<AnonGuard>,
    object: Option<ObjectGuard>,
    amap: Option<AmapGuard>,
}

impl FaultLocks {
    pub fn new() -> Self {
        Self {
            anon: None,
            object: None,
            amap: None,
        }
    }

    pub fn lock_amap(&mut self, amap: &Amap) {
        debug_assert!(
            self.amap.is_none() && self.object.is_none() && self.anon.is_none(),
            "amap lock must come first"
        );
        self.amap = Some(amap.lock());
    }

    pub fn lock_object(&mut self, object: &VmObject) {
        debug_assert!(
            self.object.is_none() && self.anon.is_none(),
            "object lock must precede the anon lock"
        );
        self.object = Some(object.lock());
    }

    pub fn lock_anon(&mut self, anon: &Anon) {
        debug_assert!(self.anon.is_none());
        self.anon = Some(anon.lock());
    }

    pub fn holds_amap(&self) -> bool {
        self.amap.is_some()
    }

    pub fn holds_object(&self) -> bool {
        self.object.is_some()
    }

    pub fn holds_anon(&self) -> bool {
        self.anon.is_some()
    }

    pub fn amap(&self) -> &AmapInner {
        self.amap.as_ref().expect("amap is not locked")
    }

    pub fn amap_mut(&mut self) -> &mut AmapInner {
        self.amap.as_mut().expect("amap is not locked")
    }

    pub fn object(&self) -> &VmObjectInner {
        self.object.as_ref().expect("object is not locked")
    }

    pub fn object_mut(&mut self) -> &mut VmObjectInner {
        self.object.as_mut().expect("object is not locked")
    }

    pub fn anon(&self) -> &AnonInner {
        self.anon.as_ref().expect("anon is not locked")
    }

    pub fn anon_mut(&mut self) -> &mut AnonInner {
        self.anon.as_mut().expect("anon is not locked")
    }

    /// Releases just the anon lock, e.g. before replacing the slot that
    /// referenced it.
    pub fn unlock_anon(&mut self) {
        self.anon = None;
    }
}

impl Default for FaultLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases every fault-related lock, in the one sanctioned order:
/// anon, then object, then amap, then the map.
///
/// By contract the map must be held in read mode at this call site; the
/// write-locked paths never reach blocking work.
pub fn unlock_all(fi: &mut FaultInfo, locks: FaultLocks) {
    let FaultLocks { anon, object, amap } = locks;
    drop(anon);
    drop(object);
    drop(amap);
    debug_assert!(
        fi.guard.as_ref().is_some_and(|g| !g.is_write()),
        "unlock_all requires the map to be read-locked"
    );
    fi.unlock();
}

/// Resolves a fault at `vaddr` in `map` for the given access.
///
/// This is the inbound interface of the subsystem: the trap handler calls
/// it with the faulting (address, access, map) triple and delivers the
/// returned error to the faulting context if resolution fails. The stale-
/// relock condition is the only one recovered locally (by redoing the
/// lookup); everything else propagates verbatim.
pub fn handle_fault(
    ctx: &VmContext,
    map: &Arc<VmMap>,
    vaddr: Vaddr,
    access: VmPerms,
) -> Result<()> {
    ctx.stats().count_fault();
    let mut fi = FaultInfo::new(map, vaddr, PAGE_SIZE);

    if fi.check_intrsafe(ctx) {
        // Interrupt-safe maps hold pre-wired memory; a fault here is a
        // kernel bug, not something to resolve.
        return_errno_with_message!(Errno::EFAULT, "page fault in an interrupt-safe map");
    }

    let write = access.contains(VmPerms::WRITE);
    loop {
        fi.lookup(false)?;
        let entry = fi.entry().cloned().expect("lookup succeeded without an entry");

        if !entry.protection.admits(access) {
            fi.unlock();
            return_errno_with_message!(Errno::EACCES, "access exceeds the mapping's protection");
        }

        let mut locks = FaultLocks::new();

        // The anonymous layer shadows the backing object.
        if let Some(aref) = &entry.aref {
            locks.lock_amap(&aref.amap);
            let slot = aref.slot_of(fi.fault_addr(), entry.start);
            if let Some(anon) = locks.amap().lookup(slot).cloned() {
                match resolve_anon(ctx, &mut fi, &mut locks, &anon, slot, write)? {
                    Resolution::Done => return Ok(()),
                    Resolution::Refault => continue,
                }
            }
        }

        match &entry.backing {
            EntryBacking::Object { object, offset } => {
                let object = object.clone();
                let ooff = offset + (fi.fault_addr() - entry.start);
                match resolve_object(ctx, &mut fi, &mut locks, &entry, &object, ooff, write)? {
                    Resolution::Done => return Ok(()),
                    Resolution::Refault => continue,
                }
            }
            EntryBacking::Anonymous => {
                // Zero-fill: promote a fresh anon into the empty slot.
                let aref = entry.aref.as_ref().expect("anonymous entry without an amap");
                let slot = aref.slot_of(fi.fault_addr(), entry.start);
                let page = ctx.alloc_page();
                page.set_flags(PageFlags::ACTIVE);
                if write {
                    page.set_flags(PageFlags::DIRTY);
                }
                locks.amap_mut().insert(slot, Anon::with_page(page));
                ctx.stats().count_zero_fill();
                trace!("zero-fill fault at 0x{:x}", fi.fault_addr());
                unlock_all(&mut fi, locks);
                return Ok(());
            }
            EntryBacking::Submap(_) => {
                unreachable!("lookup descends through submap entries")
            }
        }
    }
}

enum Resolution {
    Done,
    Refault,
}

/// Resolves a fault against the anon found in the entry's amap slot.
///
/// Expects the amap lock in `locks`; takes the anon lock itself.
fn resolve_anon(
    ctx: &VmContext,
    fi: &mut FaultInfo,
    locks: &mut FaultLocks,
    anon: &Arc<Anon>,
    slot: usize,
    write: bool,
) -> Result<Resolution> {
    locks.lock_anon(anon);

    let Some(page) = locks.anon().page.clone() else {
        // The anon's page is out on the drum. Install a busy placeholder,
        // drop every lock, do the transfer, and refault.
        let swap_slot = locks
            .anon()
            .swap_slot
            .expect("anon with neither a page nor a swap slot");
        let page = ctx.alloc_page();
        page.set_flags(PageFlags::BUSY);
        locks.anon_mut().page = Some(page.clone());
        let anon = anon.clone();
        let mut taken = FaultLocks::new();
        core::mem::swap(&mut taken, locks);
        unlock_all(fi, taken);

        ctx.stats().count_pagein();
        let res = ctx.swap().read_slot(swap_slot, &page);
        {
            let mut ag = anon.lock();
            if res.is_err() {
                // A failed get leaves the page absent so the fault can be
                // retried or reported, per the caller's policy.
                ag.page = None;
            }
            page.unbusy_wake();
        }
        res?;

        if fi.relock() {
            fi.unlock();
        } else {
            ctx.stats().count_relock_stale();
        }
        return Ok(Resolution::Refault);
    };

    if page.is_busy() {
        // Another fault owns the page; wait outside all locks and retry.
        let mut taken = FaultLocks::new();
        core::mem::swap(&mut taken, locks);
        unlock_all(fi, taken);
        page.wait_busy();
        return Ok(Resolution::Refault);
    }

    page.set_flags(PageFlags::ACTIVE);
    if write {
        if anon.ref_count() > 1 {
            // The anon is shared copy-on-write; never mutate it in place.
            let copy = ctx.alloc_page();
            copy.copy_from(&page);
            copy.set_flags(PageFlags::DIRTY | PageFlags::ACTIVE);
            locks.unlock_anon();
            locks.amap_mut().replace(slot, Anon::with_page(copy));
            ctx.stats().count_cow_copy();
            trace!("copy-on-write fault at 0x{:x}", fi.fault_addr());
        } else {
            page.set_flags(PageFlags::DIRTY);
        }
    }

    let mut taken = FaultLocks::new();
    core::mem::swap(&mut taken, locks);
    unlock_all(fi, taken);
    Ok(Resolution::Done)
}

/// Resolves a fault against the entry's backing object.
///
/// Expects the amap lock in `locks` when the entry has an anonymous layer;
/// takes the object lock itself.
fn resolve_object(
    ctx: &VmContext,
    fi: &mut FaultInfo,
    locks: &mut FaultLocks,
    entry: &MapEntry,
    object: &Arc<VmObject>,
    ooff: usize,
    write: bool,
) -> Result<Resolution> {
    locks.lock_object(object);

    if let Some(page) = locks.object().find(ooff).cloned() {
        if page.is_busy() {
            let mut taken = FaultLocks::new();
            core::mem::swap(&mut taken, locks);
            unlock_all(fi, taken);
            page.wait_busy();
            return Ok(Resolution::Refault);
        }
        page.set_flags(PageFlags::ACTIVE);
        if write && entry.copy_on_write {
            // Writing a copy-on-write object page promotes a private copy
            // into the anonymous layer; the object's page stays pristine.
            let aref = entry
                .aref
                .as_ref()
                .expect("copy-on-write entry without an amap");
            let slot = aref.slot_of(fi.fault_addr(), entry.start);
            let copy = ctx.alloc_page();
            copy.copy_from(&page);
            copy.set_flags(PageFlags::DIRTY | PageFlags::ACTIVE);
            locks.amap_mut().insert(slot, Anon::with_page(copy));
            ctx.stats().count_cow_copy();
            trace!("promoted object page 0x{:x} at 0x{:x}", ooff, fi.fault_addr());
        } else if write {
            page.set_flags(PageFlags::DIRTY);
        }
        let mut taken = FaultLocks::new();
        core::mem::swap(&mut taken, locks);
        unlock_all(fi, taken);
        return Ok(Resolution::Done);
    }

    // Not resident: drop every lock and ask the pager. Objects whose pages
    // are not managed through get/put (device memory) resolve through the
    // direct fault capability instead.
    let mut taken = FaultLocks::new();
    core::mem::swap(&mut taken, locks);
    unlock_all(fi, taken);
    ctx.stats().count_pagein();

    match object.pager().fault(ctx, object, ooff) {
        Ok(_) => {}
        Err(err) if err.error() == Errno::EOPNOTSUPP => {
            pager::get(ctx, object, ooff, 1, PagerFlags::SYNCIO)?;
        }
        Err(err) => return Err(err),
    }

    if fi.relock() {
        fi.unlock();
    } else {
        ctx.stats().count_relock_stale();
    }
    Ok(Resolution::Refault)
}
