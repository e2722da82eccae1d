// SPDX-License-Identifier: MPL-2.0

//! Address maps.
//!
//! A [`VmMap`] holds a set of disjoint, ordered [`MapEntry`]s, each covering
//! one contiguous virtual range with a single backing relationship: an
//! object at an offset, a nested submap, or pure anonymous memory. The map
//! is guarded by a reader-writer lock, and every structural mutation (enter,
//! remove, clip) bumps a monotonic version stamp. Fault handling captures
//! the stamp under the lock and later revalidates it with an equality
//! compare — the optimistic relock protocol in [`crate::fault`].

use core::ops::Range;

use align_ext::AlignExt;

use crate::{
    amap::{ARef, Amap},
    object::VmObject,
    perms::VmPerms,
    prelude::*,
    sync::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RwLock},
};

bitflags! {
    /// Map-wide behavior flags.
    pub struct MapFlags: u32 {
        /// The map covers pre-wired kernel memory that must never fault at
        /// interrupt level. Faults consult the interrupt-safe registry for
        /// such maps instead of taking the normal (blocking) lock path.
        const INTRSAFE = 1 << 0;
    }
}

/// An address map.
pub struct VmMap {
    flags: MapFlags,
    va_range: Range<Vaddr>,
    inner: Arc<RwLock<MapInner>>,
}

/// The lock-protected state of a [`VmMap`].
pub struct MapInner {
    entries: BTreeMap<Vaddr, MapEntry>,
    version: u64,
}

/// One contiguous virtual range with a single backing relationship.
#[derive(Clone)]
pub struct MapEntry {
    pub start: Vaddr,
    pub end: Vaddr,
    pub protection: VmPerms,
    /// Whether writes to this entry must be satisfied by private copies
    /// promoted into the anonymous layer.
    pub copy_on_write: bool,
    /// The anonymous layer overlaying the backing, if any.
    pub aref: Option<ARef>,
    pub backing: EntryBacking,
}

/// Where the pages of an entry come from.
#[derive(Clone)]
pub enum EntryBacking {
    /// Zero-fill anonymous memory; all pages live in the entry's amap.
    Anonymous,
    /// A backing object supplying pages starting at `offset`.
    Object { object: Arc<VmObject>, offset: usize },
    /// A map nested inside this entry, spanning the identical virtual range.
    Submap(Arc<VmMap>),
}

impl MapEntry {
    pub fn range(&self) -> Range<Vaddr> {
        self.start..self.end
    }
}

/// A held map lock, in the mode it was acquired.
///
/// The guard owns the lock through an `Arc`, so it can be stashed in
/// fault-handling state and released from a different call frame than the
/// one that acquired it.
pub enum MapGuard {
    Read(ArcRwLockReadGuard<MapInner>),
    Write(ArcRwLockWriteGuard<MapInner>),
}

impl MapGuard {
    pub fn inner(&self) -> &MapInner {
        match self {
            MapGuard::Read(g) => g,
            MapGuard::Write(g) => g,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, MapGuard::Write(_))
    }
}

impl VmMap {
    pub(crate) fn new(flags: MapFlags, va_range: Range<Vaddr>) -> Arc<Self> {
        Arc::new(Self {
            flags,
            va_range,
            inner: Arc::new(RwLock::new(MapInner {
                entries: BTreeMap::new(),
                version: 0,
            })),
        })
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn va_range(&self) -> Range<Vaddr> {
        self.va_range.clone()
    }

    /// Acquires the map lock in shared mode.
    pub fn lock_read(&self) -> MapGuard {
        MapGuard::Read(self.inner.read_arc())
    }

    /// Acquires the map lock in exclusive mode.
    pub fn lock_write(&self) -> MapGuard {
        MapGuard::Write(self.inner.write_arc())
    }

    /// Attempts to acquire the map lock in shared mode without waiting.
    pub fn try_lock_read(&self) -> Option<MapGuard> {
        self.inner.try_read_arc().map(MapGuard::Read)
    }

    /// Attempts to acquire the map lock in exclusive mode without waiting.
    pub fn try_lock_write(&self) -> Option<MapGuard> {
        self.inner.try_write_arc().map(MapGuard::Write)
    }

    /// Returns the current version stamp.
    ///
    /// The stamp is only meaningful for comparison against a stamp captured
    /// while the map lock was held.
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Removes all entries overlapping `start..end`, clipping entries that
    /// straddle either boundary.
    pub fn remove(&self, start: Vaddr, end: Vaddr) -> Result<()> {
        if start % PAGE_SIZE != 0 || end % PAGE_SIZE != 0 || start >= end {
            return_errno_with_message!(Errno::EINVAL, "invalid unmap range");
        }
        let mut inner = self.inner.write();
        inner.clip(start);
        inner.clip(end);
        let covered: Vec<Vaddr> = inner
            .entries
            .range(start..end)
            .map(|(addr, _)| *addr)
            .collect();
        if !covered.is_empty() {
            for addr in covered {
                inner.entries.remove(&addr);
            }
            inner.version += 1;
        }
        trace!("unmap 0x{:x}..0x{:x}, version={}", start, end, inner.version);
        Ok(())
    }
}

impl MapInner {
    /// Finds the entry containing `addr`, if any.
    ///
    /// The caller must hold the map lock in at least shared mode.
    pub fn lookup_entry(&self, addr: Vaddr) -> Option<&MapEntry> {
        self.entries
            .range(..=addr)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.end > addr)
    }

    /// Returns the version stamp.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Ensures no entry straddles `addr` by splitting the one that does.
    ///
    /// Splitting adjusts the right half's amap slot offset and object offset
    /// so both halves keep referring to the same pages.
    fn clip(&mut self, addr: Vaddr) {
        debug_assert_eq!(addr % PAGE_SIZE, 0);
        let Some((&start, entry)) = self
            .entries
            .range(..addr)
            .next_back()
            .filter(|(_, e)| e.end > addr)
        else {
            return;
        };
        let mut right = entry.clone();
        let delta = addr - start;
        right.start = addr;
        if let Some(aref) = &mut right.aref {
            aref.slot_off += delta / PAGE_SIZE;
        }
        if let EntryBacking::Object { offset, .. } = &mut right.backing {
            *offset += delta;
        }
        self.entries.get_mut(&start).unwrap().end = addr;
        self.entries.insert(addr, right);
        self.version += 1;
    }

    fn enter(&mut self, entry: MapEntry) -> Result<()> {
        let overlaps = self
            .entries
            .range(..entry.end)
            .next_back()
            .is_some_and(|(_, prev)| prev.end > entry.start);
        if overlaps {
            return_errno_with_message!(Errno::EINVAL, "mapping overlaps an existing entry");
        }
        self.entries.insert(entry.start, entry);
        self.version += 1;
        Ok(())
    }
}

/// Options for entering a new mapping into a [`VmMap`].
pub struct MapEnterOptions {
    start: Vaddr,
    size: usize,
    protection: VmPerms,
    copy_on_write: bool,
    backing: EntryBacking,
    aref: Option<ARef>,
}

impl MapEnterOptions {
    /// Creates a default set of options for an anonymous mapping at `start`.
    pub fn new(start: Vaddr, size: usize) -> Self {
        Self {
            start,
            size,
            protection: VmPerms::READ | VmPerms::WRITE,
            copy_on_write: false,
            backing: EntryBacking::Anonymous,
            aref: None,
        }
    }

    /// Sets the access permissions of the mapping.
    pub fn protection(mut self, protection: VmPerms) -> Self {
        self.protection = protection;
        self
    }

    /// Backs the mapping with an object, starting at `offset` within it.
    pub fn object(mut self, object: Arc<VmObject>, offset: usize) -> Self {
        self.backing = EntryBacking::Object { object, offset };
        self
    }

    /// Makes the entry denote a nested submap.
    ///
    /// The submap must span exactly the entry's virtual range; submap
    /// lookups use the same addresses as the parent, with no translation.
    pub fn submap(mut self, submap: Arc<VmMap>) -> Self {
        self.backing = EntryBacking::Submap(submap);
        self
    }

    /// Marks the mapping copy-on-write.
    pub fn copy_on_write(mut self, cow: bool) -> Self {
        self.copy_on_write = cow;
        self
    }

    /// Supplies an existing anonymous layer instead of allocating a fresh
    /// one, e.g. when two mappings share anonymous memory or a fork shares
    /// it copy-on-write.
    pub fn amap(mut self, aref: ARef) -> Self {
        self.aref = Some(aref);
        self
    }

    /// Validates the options and enters the mapping.
    pub fn enter(self, map: &VmMap) -> Result<()> {
        let Self {
            start,
            size,
            protection,
            copy_on_write,
            backing,
            mut aref,
        } = self;
        if size == 0 || start % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return_errno_with_message!(Errno::EINVAL, "mapping must be page-aligned and non-empty");
        }
        let end = start
            .checked_add(size)
            .ok_or(Error::with_message(Errno::EINVAL, "mapping wraps around"))?;
        if start < map.va_range.start || end > map.va_range.end {
            return_errno_with_message!(Errno::EINVAL, "mapping outside the map's range");
        }
        match &backing {
            EntryBacking::Submap(submap) => {
                // Parent and child ranges must coincide exactly; submap
                // lookups reuse the faulting address unchanged.
                if submap.va_range() != (start..end) {
                    return_errno_with_message!(
                        Errno::EINVAL,
                        "submap range differs from the entry range"
                    );
                }
                if aref.is_some() || copy_on_write {
                    return_errno_with_message!(
                        Errno::EINVAL,
                        "submap entries carry no anonymous layer"
                    );
                }
            }
            EntryBacking::Anonymous | EntryBacking::Object { .. } => {
                let needs_amap =
                    matches!(backing, EntryBacking::Anonymous) || copy_on_write;
                if needs_amap && aref.is_none() {
                    aref = Some(ARef {
                        amap: Amap::new(size / PAGE_SIZE),
                        slot_off: 0,
                    });
                }
            }
        }
        let entry = MapEntry {
            start,
            end,
            protection,
            copy_on_write,
            aref,
            backing,
        };
        let mut inner = map.inner.write();
        inner.enter(entry)?;
        trace!(
            "enter 0x{:x}..0x{:x} prot={:?}, version={}",
            start,
            end,
            protection,
            inner.version
        );
        Ok(())
    }
}

/// Rounds an address down to its page base.
pub fn trunc_page(addr: Vaddr) -> Vaddr {
    addr.align_down(PAGE_SIZE)
}

/// Rounds an address up to the next page boundary.
pub fn round_page(addr: Vaddr) -> Vaddr {
    addr.align_up(PAGE_SIZE)
}
