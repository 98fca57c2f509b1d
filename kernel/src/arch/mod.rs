//! Architecture contract
//!
//! The core kernel is arch-independent; this module is its seam with
//! the x86-64 specifics. [`PageTables`] is the kernel's authoritative
//! record of what a process's page tables contain. The walker that
//! mirrors these entries into hardware tables, the APIC, and the entry
//! stubs live outside the core and consume this record; the invariant
//! they preserve is that the hardware view never diverges from it.

use alloc::collections::BTreeMap;

use bitflags::bitflags;

use crate::config::PAGE_SIZE;
use crate::memory::{PhysAddr, VirtAddr};
use j6::Koid;

bitflags! {
    /// Permission and type bits of a mapped page.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const WRITE         = 1 << 0;
        const EXEC          = 1 << 1;
        /// Write-combining for framebuffer-style memory
        const WRITE_COMBINE = 1 << 2;
        /// Uncached device memory
        const MMIO          = 1 << 3;
    }
}

/// One page's entry in a process's tables.
///
/// Anonymous VMA pages start with no frame: the entry exists but is
/// not present, and the first touch faults the frame in. Backed ranges
/// are present from the start.
#[derive(Debug, Clone, Copy)]
pub struct PageEntry {
    /// Backing frame; `None` until a lazy page is faulted in
    pub phys: Option<PhysAddr>,
    pub flags: PageFlags,
    /// The VMA this entry belongs to
    pub vma: Koid,
}

/// The kernel's record of one process's page tables.
pub struct PageTables {
    /// Physical address of the top-level table root
    root: PhysAddr,

    /// Entries keyed by virtual page base address
    entries: BTreeMap<u64, PageEntry>,
}

impl PageTables {
    pub fn new(root: PhysAddr) -> Self {
        Self {
            root,
            entries: BTreeMap::new(),
        }
    }

    /// The table root, as loaded into CR3 on switch-in.
    #[inline]
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// True if any entry covers the page containing `addr`.
    pub fn is_mapped(&self, addr: VirtAddr) -> bool {
        self.entries.contains_key(&addr.page_base().as_u64())
    }

    /// True if any page in `base..base+pages` is already mapped.
    pub fn range_occupied(&self, base: VirtAddr, pages: usize) -> bool {
        let start = base.page_base().as_u64();
        let end = start + (pages * PAGE_SIZE) as u64;
        self.entries.range(start..end).next().is_some()
    }

    /// Install entries for `pages` pages of `vma` at `base`. Lazy
    /// pages pass `None` frames; present pages pass their frame.
    pub fn install(
        &mut self,
        vma: Koid,
        base: VirtAddr,
        frames: impl Iterator<Item = Option<PhysAddr>>,
        flags: PageFlags,
    ) {
        let mut addr = base.page_base().as_u64();
        for phys in frames {
            self.entries.insert(addr, PageEntry { phys, flags, vma });
            addr += PAGE_SIZE as u64;
        }
    }

    /// Record a fault-in: the page at `addr` now has a frame.
    pub fn make_present(&mut self, addr: VirtAddr, phys: PhysAddr) {
        if let Some(entry) = self.entries.get_mut(&addr.page_base().as_u64()) {
            entry.phys = Some(phys);
        }
    }

    /// Remove every entry belonging to `vma`, returning how many were
    /// removed.
    pub fn remove_vma(&mut self, vma: Koid) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.vma != vma);
        before - self.entries.len()
    }

    /// Remove entries for `vma` at page indexes >= `from_page`,
    /// counting from `base`. Used when a VMA contracts.
    pub fn remove_vma_tail(&mut self, vma: Koid, base: VirtAddr, from_page: usize) {
        let cut = base.page_base().as_u64() + (from_page * PAGE_SIZE) as u64;
        self.entries
            .retain(|&addr, e| e.vma != vma || addr < cut);
    }

    /// Look up the entry covering `addr`.
    pub fn lookup(&self, addr: VirtAddr) -> Option<&PageEntry> {
        self.entries.get(&addr.page_base().as_u64())
    }

    /// Number of entries referring to `vma`.
    pub fn entries_for(&self, vma: Koid) -> usize {
        self.entries.values().filter(|e| e.vma == vma).count()
    }

    /// Total number of installed entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Stop this CPU. On hardware this is a cli/hlt loop; hosted, the
/// panic path has already taken over before this is reachable.
#[cfg(not(test))]
pub fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_and_tear_down() {
        let mut pt = PageTables::new(PhysAddr::new(0x1000));
        let base = VirtAddr::new(0x2000_0000_0000);

        pt.install(7, base, (0..4).map(|_| None), PageFlags::WRITE);
        assert_eq!(pt.entries_for(7), 4);
        assert!(pt.is_mapped(base));
        assert!(pt.range_occupied(base, 4));
        assert!(!pt.range_occupied(base.offset_pages(4), 4));

        pt.make_present(base, PhysAddr::new(0x8000));
        assert_eq!(pt.lookup(base).unwrap().phys, Some(PhysAddr::new(0x8000)));

        assert_eq!(pt.remove_vma(7), 4);
        assert!(pt.is_empty());
    }

    #[test]
    fn tail_removal_keeps_head() {
        let mut pt = PageTables::new(PhysAddr::new(0x1000));
        let base = VirtAddr::new(0x2000_0000_0000);
        pt.install(9, base, (0..16).map(|_| None), PageFlags::WRITE);

        pt.remove_vma_tail(9, base, 4);
        assert_eq!(pt.entries_for(9), 4);
        assert!(pt.is_mapped(base.offset_pages(3)));
        assert!(!pt.is_mapped(base.offset_pages(4)));
    }
}
