//! VMA management
//!
//! Creating, mapping, unmapping, and resizing virtual memory areas,
//! plus the page-fault path that lazily backs anonymous pages. A
//! mapping counts as an internal user of the VMA, so a VMA is
//! destroyed exactly when no handle refers to it and no process maps
//! it.

use j6::caps::Caps;
use j6::syslog::{Area, Severity};
use j6::{Handle, Koid, ObjectType, Status};

use crate::config::{USER_SPACE_TOP, VMA_AREA_BASE};
use crate::memory::{page_aligned, page_count, AllocKind, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::objects::{Body, Object, Vma, VmaFlags};

use super::Kernel;

/// Capabilities granted on a freshly created VMA handle.
pub const VMA_DEFAULT_CAPS: Caps = Caps::from_bits_truncate(
    Caps::CLONE.bits()
        | Caps::TRANSFER.bits()
        | Caps::WAIT.bits()
        | Caps::VMA_MAP.bits()
        | Caps::VMA_UNMAP.bits()
        | Caps::VMA_RESIZE.bits(),
);

/// Flags that make sense on a VMA itself.
const CREATE_FLAGS: VmaFlags = VmaFlags::from_bits_truncate(
    VmaFlags::WRITE.bits()
        | VmaFlags::EXEC.bits()
        | VmaFlags::WRITE_COMBINE.bits()
        | VmaFlags::RING.bits(),
);

impl Kernel {
    /// `vma_create`: allocate an anonymous VMA and hand back a handle
    /// to it, without mapping it anywhere.
    pub fn vma_create(
        &self,
        process: Koid,
        size: u64,
        flags: VmaFlags,
    ) -> Result<Handle, Status> {
        if size == 0 || !CREATE_FLAGS.contains(flags & !VmaFlags::EXACT) {
            return Err(Status::InvalidArg);
        }
        let pages = page_count(size as usize);
        if flags.contains(VmaFlags::RING) && !(pages * PAGE_SIZE).is_power_of_two() {
            return Err(Status::InvalidArg);
        }

        self.create_object(
            process,
            Body::Vma(spin::Mutex::new(Vma::anonymous(pages, flags))),
            VMA_DEFAULT_CAPS,
        )
    }

    /// `vma_create_map`: create and immediately map into the calling
    /// process. `addr` is in-out: 0 asks the kernel to choose.
    pub fn vma_create_map(
        &self,
        process: Koid,
        size: u64,
        addr: &mut u64,
        flags: VmaFlags,
    ) -> Result<Handle, Status> {
        let handle = self.vma_create(process, size, flags)?;
        match self.vma_map(process, handle, process, addr, flags) {
            Ok(()) => Ok(handle),
            Err(status) => {
                self.handle_close(process, handle);
                Err(status)
            }
        }
    }

    /// `vma_map`: install a VMA's pages into `target`'s tables.
    ///
    /// `addr` 0 means choose; the `EXACT` flag forbids moving the
    /// requested address, and a collision there is `exists`.
    pub fn vma_map(
        &self,
        process: Koid,
        handle: Handle,
        target: Koid,
        addr: &mut u64,
        flags: VmaFlags,
    ) -> Result<(), Status> {
        if *addr != 0 && !page_aligned(*addr) {
            return Err(Status::InvalidArg);
        }

        let entry = self.resolve_handle(process, handle, ObjectType::Vma, Caps::VMA_MAP)?;
        let vma_obj = self.obj(entry.koid)?;
        let vma_cell = vma_obj.as_vma().ok_or(Status::Unexpected)?;

        let target_obj = self.obj_as(target, ObjectType::Process)?;
        let target_cell = target_obj.as_process().ok_or(Status::Unexpected)?;

        let (pages, page_flags, frames): (usize, _, alloc::vec::Vec<_>) = {
            let vma = vma_cell.lock();
            if vma.mapping_in(target).is_some() {
                return Err(Status::Exists);
            }
            (
                vma.pages(),
                vma.flags().page_flags(),
                vma.page_frames().collect(),
            )
        };

        let base = {
            let mut proc = target_cell.lock();
            let base = if *addr == 0 {
                choose_address(&mut proc, pages)?
            } else {
                let wanted = VirtAddr::new(*addr);
                if proc.page_tables.range_occupied(wanted, pages) {
                    if flags.contains(VmaFlags::EXACT) {
                        return Err(Status::Exists);
                    }
                    choose_address(&mut proc, pages)?
                } else {
                    wanted
                }
            };

            proc.page_tables
                .install(entry.koid, base, frames.into_iter(), page_flags);
            proc.add_vma(entry.koid);
            base
        };

        vma_cell.lock().add_mapping(target, base);

        // The mapping is an internal user of the VMA
        self.retain(entry.koid);

        *addr = base.as_u64();
        Ok(())
    }

    /// `vma_unmap`: remove a VMA's entries from `target`. The VMA
    /// itself lives on until its last handle and mapping go away.
    pub fn vma_unmap(
        &self,
        process: Koid,
        handle: Handle,
        target: Koid,
    ) -> Result<(), Status> {
        let entry = self.resolve_handle(process, handle, ObjectType::Vma, Caps::VMA_UNMAP)?;
        let vma_obj = self.obj(entry.koid)?;
        let vma_cell = vma_obj.as_vma().ok_or(Status::Unexpected)?;

        let target_obj = self.obj_as(target, ObjectType::Process)?;
        let target_cell = target_obj.as_process().ok_or(Status::Unexpected)?;

        {
            let mut vma = vma_cell.lock();
            if vma.remove_mapping(target).is_none() {
                return Err(Status::InvalidArg);
            }
        }

        {
            let mut proc = target_cell.lock();
            proc.page_tables.remove_vma(entry.koid);
            proc.remove_vma(entry.koid);
        }

        self.release(entry.koid);
        Ok(())
    }

    /// `vma_resize`: grow or shrink an anonymous VMA mapped in at most
    /// one process. `new_size` is in-out and comes back page-rounded.
    /// Contraction frees the trailing frames.
    pub fn vma_resize(
        &self,
        process: Koid,
        handle: Handle,
        new_size: &mut u64,
    ) -> Result<(), Status> {
        let entry = self.resolve_handle(process, handle, ObjectType::Vma, Caps::VMA_RESIZE)?;
        let vma_obj = self.obj(entry.koid)?;
        let vma_cell = vma_obj.as_vma().ok_or(Status::Unexpected)?;

        let new_pages = page_count(*new_size as usize);
        let mut vma = vma_cell.lock();
        let old_pages = vma.pages();
        let freed = vma.resize(new_pages)?;
        let mapping = vma.mappings().first().copied();
        let flags = vma.flags().page_flags();
        drop(vma);

        // Keep the single mapping's page tables in step
        if let Some((proc_koid, base)) = mapping {
            if let Ok(proc_obj) = self.obj_as(proc_koid, ObjectType::Process) {
                if let Some(proc_cell) = proc_obj.as_process() {
                    let mut proc = proc_cell.lock();
                    if new_pages < old_pages {
                        proc.page_tables
                            .remove_vma_tail(entry.koid, base, new_pages);
                    } else if new_pages > old_pages {
                        let grown = base.offset_pages(old_pages);
                        proc.page_tables.install(
                            entry.koid,
                            grown,
                            (old_pages..new_pages).map(|_| None),
                            flags,
                        );
                    }
                }
            }
        }

        if !freed.is_empty() {
            let mut frames = self.frames.lock();
            for phys in freed {
                frames.free(phys, 1, AllocKind::VmaBacking);
            }
        }

        *new_size = (new_pages * PAGE_SIZE) as u64;
        Ok(())
    }

    /// The page-fault path: back the touched page of an anonymous VMA
    /// with a zeroed frame. A fault with no entry behind it is fatal
    /// to the faulting thread's process.
    pub fn handle_user_fault(&self, process: Koid, addr: VirtAddr) -> Result<(), Status> {
        let proc_obj = self.obj_as(process, ObjectType::Process)?;
        let proc_cell = proc_obj.as_process().ok_or(Status::Unexpected)?;

        let (vma_koid, already_present) = {
            let proc = proc_cell.lock();
            match proc.page_tables.lookup(addr) {
                Some(entry) => (entry.vma, entry.phys.is_some()),
                None => {
                    self.log(
                        Area::Memory,
                        Severity::Error,
                        "fatal fault: no mapping at faulting address",
                    );
                    return Err(Status::InvalidArg);
                }
            }
        };

        if already_present {
            // Spurious: another thread faulted the page in first
            return Ok(());
        }

        let vma_obj = self.obj(vma_koid)?;
        let vma_cell = vma_obj.as_vma().ok_or(Status::Unexpected)?;

        // The walker zeroes the frame through the physical map before
        // it installs the entry; anonymous pages are never handed to
        // user space with stale contents.
        let phys = self.frames.lock().alloc(1, AllocKind::VmaBacking)?;

        let mut vma = vma_cell.lock();
        let base = vma.mapping_in(process).ok_or(Status::Unexpected)?;
        let index = ((addr.page_base().as_u64() - base.as_u64()) / PAGE_SIZE as u64) as usize;
        vma.set_frame(index, phys);
        drop(vma);

        proc_cell.lock().page_tables.make_present(addr, phys);
        Ok(())
    }

    /// Map a physical range through the system object: MMIO and boot
    /// ranges for drivers. The range is never handed to the frame
    /// allocator.
    pub fn system_map_phys(
        &self,
        process: Koid,
        sys_handle: Handle,
        phys: u64,
        size: u64,
        flags: VmaFlags,
    ) -> Result<Handle, Status> {
        self.resolve_handle(process, sys_handle, ObjectType::System, Caps::SYSTEM_MAP_PHYS)?;
        if size == 0 || !page_aligned(phys) {
            return Err(Status::InvalidArg);
        }

        let pages = page_count(size as usize);
        self.create_object(
            process,
            Body::Vma(spin::Mutex::new(Vma::backed(
                pages,
                flags | VmaFlags::MMIO,
                PhysAddr::new(phys),
            ))),
            VMA_DEFAULT_CAPS,
        )
    }

    /// Destruction teardown: return an anonymous VMA's frames.
    pub(crate) fn teardown_vma(&self, obj: &Object) {
        let Some(cell) = obj.as_vma() else { return };
        let frames = cell.lock().take_frames();
        if frames.is_empty() {
            return;
        }
        let mut allocator = self.frames.lock();
        for phys in frames {
            allocator.free(phys, 1, AllocKind::VmaBacking);
        }
    }
}

/// Pick a free range in the target's address space, bumping from the
/// process's cursor.
fn choose_address(
    proc: &mut crate::objects::Process,
    pages: usize,
) -> Result<VirtAddr, Status> {
    let span = (pages * PAGE_SIZE) as u64;
    let mut candidate = proc.next_map_addr.max(VMA_AREA_BASE);

    loop {
        if candidate + span > USER_SPACE_TOP {
            return Err(Status::Insufficient);
        }
        let base = VirtAddr::new(candidate);
        if !proc.page_tables.range_occupied(base, pages) {
            proc.next_map_addr = candidate + span;
            return Ok(base);
        }
        candidate += span.max(PAGE_SIZE as u64);
    }
}
