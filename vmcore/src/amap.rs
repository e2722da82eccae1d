// SPDX-License-Identifier: MPL-2.0

//! The anonymous-memory layer.
//!
//! An [`Amap`] is the per-region table recording which [`Anon`] backs each
//! page-slot of an anonymous mapping. Amaps are shared by every mapping that
//! has not yet copy-on-write-forked a slot; each anon tracks how many amap
//! slots currently share it, and a shared anon is never written in place —
//! the write fault copies it first.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    page::Page,
    prelude::*,
    sync::{ArcRwLockWriteGuard, RwLock},
};

/// The record of a single anonymous page, independent of any particular
/// amap slot.
pub struct Anon {
    /// The number of amap slots referencing this anon.
    ///
    /// This is deliberately not `Arc::strong_count`: transient handle clones
    /// (a fault holding the anon while its locks are dropped, a guard, a
    /// test) must not change copy-on-write policy. Memory safety is the
    /// `Arc`'s job; this count only answers "is the anon shared?".
    ref_count: AtomicUsize,
    inner: Arc<RwLock<AnonInner>>,
}

/// The lock-protected state of an [`Anon`].
pub struct AnonInner {
    /// The resident page, if any.
    pub page: Option<Page>,
    /// The swap slot holding the page contents while it is not resident.
    pub swap_slot: Option<u32>,
}

/// An owned guard over an anon's state.
pub type AnonGuard = ArcRwLockWriteGuard<AnonInner>;

impl Anon {
    /// Creates an anon owning a resident page.
    pub fn with_page(page: Page) -> Arc<Self> {
        Arc::new(Self {
            ref_count: AtomicUsize::new(1),
            inner: Arc::new(RwLock::new(AnonInner {
                page: Some(page),
                swap_slot: None,
            })),
        })
    }

    /// Creates an anon whose contents live in the given swap slot.
    pub fn with_swap_slot(slot: u32) -> Arc<Self> {
        Arc::new(Self {
            ref_count: AtomicUsize::new(1),
            inner: Arc::new(RwLock::new(AnonInner {
                page: None,
                swap_slot: Some(slot),
            })),
        })
    }

    /// Returns the number of amap slots sharing this anon.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn del_ref(&self) {
        self.ref_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Acquires the anon lock.
    pub fn lock(&self) -> AnonGuard {
        self.inner.write_arc()
    }

    /// Attempts to acquire the anon lock without waiting.
    pub fn try_lock(&self) -> Option<AnonGuard> {
        self.inner.try_write_arc()
    }
}

impl Debug for Anon {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Anon")
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// A per-region table of anon references, one per page-slot.
pub struct Amap {
    inner: Arc<RwLock<AmapInner>>,
}

/// The lock-protected slot table of an [`Amap`].
pub struct AmapInner {
    slots: Vec<Option<Arc<Anon>>>,
}

/// An owned guard over an amap's slot table.
pub type AmapGuard = ArcRwLockWriteGuard<AmapInner>;

impl Amap {
    /// Creates an amap with `nslots` empty slots.
    pub fn new(nslots: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(RwLock::new(AmapInner {
                slots: alloc::vec![None; nslots],
            })),
        })
    }

    /// Acquires the amap lock.
    pub fn lock(&self) -> AmapGuard {
        self.inner.write_arc()
    }

    /// Attempts to acquire the amap lock without waiting.
    pub fn try_lock(&self) -> Option<AmapGuard> {
        self.inner.try_write_arc()
    }

    /// Returns the number of slots.
    pub fn slot_count(&self) -> usize {
        self.inner.read().slots.len()
    }

    /// Produces a copy-on-write fork of this amap.
    ///
    /// The new amap references the same anons; every referenced anon's slot
    /// count is bumped, so a subsequent write fault through either amap sees
    /// the anon as shared and copies it.
    pub fn share(&self) -> Arc<Amap> {
        let guard = self.inner.read();
        for anon in guard.slots.iter().flatten() {
            anon.add_ref();
        }
        Arc::new(Amap {
            inner: Arc::new(RwLock::new(AmapInner {
                slots: guard.slots.clone(),
            })),
        })
    }
}

impl AmapInner {
    /// Returns the anon at `slot`, if any.
    pub fn lookup(&self, slot: usize) -> Option<&Arc<Anon>> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Installs an anon in an empty slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already occupied or out of range.
    pub fn insert(&mut self, slot: usize, anon: Arc<Anon>) {
        let entry = &mut self.slots[slot];
        assert!(entry.is_none(), "amap slot {} already occupied", slot);
        *entry = Some(anon);
    }

    /// Replaces the anon at `slot`, dropping the old anon's slot reference.
    ///
    /// This is the commit point of a copy-on-write fault: the freshly copied
    /// anon takes over the slot and the shared original loses one sharer.
    pub fn replace(&mut self, slot: usize, anon: Arc<Anon>) -> Option<Arc<Anon>> {
        let old = self.slots[slot].replace(anon);
        if let Some(old) = &old {
            old.del_ref();
        }
        old
    }

    /// Removes and returns the anon at `slot`.
    pub fn remove(&mut self, slot: usize) -> Option<Arc<Anon>> {
        let old = self.slots.get_mut(slot).and_then(|s| s.take());
        if let Some(old) = &old {
            old.del_ref();
        }
        old
    }
}

impl Drop for AmapInner {
    fn drop(&mut self) {
        for anon in self.slots.iter().flatten() {
            anon.del_ref();
        }
    }
}

/// A map entry's reference into an amap: the amap plus the slot offset the
/// entry's first page corresponds to.
#[derive(Clone)]
pub struct ARef {
    pub amap: Arc<Amap>,
    pub slot_off: usize,
}

impl ARef {
    /// Returns the amap slot for a page-aligned address within an entry
    /// starting at `entry_start`.
    pub fn slot_of(&self, addr: Vaddr, entry_start: Vaddr) -> usize {
        debug_assert!(addr >= entry_start);
        self.slot_off + (addr - entry_start) / PAGE_SIZE
    }
}
