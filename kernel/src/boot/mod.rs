//! Boot-time bring-up
//!
//! Turns the boot protocol args into a running [`Kernel`]: check the
//! magic and version, carve out the kernel heap, hand the rest of
//! conventional memory to the frame allocator, then build the init
//! process with its well-known handles and init-value records.
//!
//! The loader has already placed the init program in memory and built
//! its page tables' skeleton; the ELF side of loading is its problem,
//! not ours.

use alloc::vec::Vec;

use bootproto::{Args, ArgsError, MemType};

use j6::caps::Caps;
use j6::init::{InitPayload, InitType, InitValue, TypedHandle};
use j6::syslog::{Area, Severity};
use j6::{Koid, ObjectType, Status};

use crate::config::PAGE_SIZE;
use crate::kernel::Kernel;
use crate::memory::{FrameAllocator, PhysAddr};
use crate::objects::VmaFlags;

/// Pages carved from the memory map for the kernel heap before the
/// frame allocator exists.
pub const KERNEL_HEAP_PAGES: usize = 1024;

/// Pages in the init process's user stack.
const INIT_STACK_PAGES: u64 = 16;

/// Everything the arch entry path needs to start the first user
/// process.
pub struct InitHandoff {
    pub process: Koid,
    pub thread: Koid,
    /// Records for the init stack, in push order
    pub values: Vec<InitValue>,
    pub entrypoint: u64,
    pub stack_top: u64,
}

/// Why bring-up refused to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// Bad magic or unsupported version in the args record
    Args(ArgsError),
    /// No conventional region large enough for the kernel heap
    NoHeapRegion,
    /// Building the init process failed
    InitFailed(Status),
}

impl From<ArgsError> for BootError {
    fn from(e: ArgsError) -> Self {
        BootError::Args(e)
    }
}

/// Bring the kernel up from boot args.
///
/// # Safety
/// `args` must be a conforming boot protocol record: the memory map
/// and program descriptors it points at must be live.
pub unsafe fn bring_up(args: &Args, num_cpus: usize) -> Result<(Kernel, InitHandoff), BootError> {
    args.validate()?;

    let map = args.memory_map();

    // The heap comes first: the frame allocator's own bookkeeping
    // needs somewhere to live.
    let heap = carve_heap(map).ok_or(BootError::NoHeapRegion)?;
    #[cfg(not(test))]
    crate::memory::heap::init(heap.as_u64() as *mut u8, KERNEL_HEAP_PAGES * PAGE_SIZE);

    let mut frames = FrameAllocator::new();
    for entry in map {
        if entry.mem_type != MemType::Free {
            continue;
        }
        add_region_excluding(&mut frames, entry.start, entry.pages as usize, heap);
    }

    let kernel = Kernel::new(frames, num_cpus);
    kernel.log(Area::Boot, Severity::Info, "kernel memory online");
    crate::kinfo!("memory online, {} frames free", kernel.free_frames());

    let handoff = build_init(&kernel, args).map_err(BootError::InitFailed)?;
    kernel.log(Area::Boot, Severity::Info, "init process ready");
    crate::kinfo!("init entry {:#x}", handoff.entrypoint);

    Ok((kernel, handoff))
}

/// Find the heap's backing range in the raw memory map.
fn carve_heap(map: &[bootproto::MemEntry]) -> Option<PhysAddr> {
    map.iter()
        .find(|e| e.mem_type == MemType::Free && e.pages as usize >= KERNEL_HEAP_PAGES)
        .map(|e| PhysAddr::new(e.start))
}

/// Add a free region, skipping the heap carve-out if it overlaps.
fn add_region_excluding(
    frames: &mut FrameAllocator,
    start: u64,
    pages: usize,
    heap: PhysAddr,
) {
    let heap_start = heap.as_u64();
    let heap_end = heap_start + (KERNEL_HEAP_PAGES * PAGE_SIZE) as u64;
    let end = start + (pages * PAGE_SIZE) as u64;

    if heap_end <= start || heap_start >= end {
        frames.add_region(PhysAddr::new(start), pages);
        return;
    }

    if heap_start > start {
        let lead = ((heap_start - start) as usize) / PAGE_SIZE;
        frames.add_region(PhysAddr::new(start), lead);
    }
    if end > heap_end {
        let trail = ((end - heap_end) as usize) / PAGE_SIZE;
        frames.add_region(PhysAddr::new(heap_end), trail);
    }
}

/// Build the first user process: its address space root, its stack,
/// its well-known handles, and the init-value records for its stack.
fn build_init(kernel: &Kernel, args: &Args) -> Result<InitHandoff, Status> {
    let root = kernel.alloc_table_root()?;
    let process = kernel.create_process(root);

    let system_handle = kernel.grant_system_handle(
        process,
        Caps::CLONE
            | Caps::TRANSFER
            | Caps::WAIT
            | Caps::SYSTEM_GET_LOG
            | Caps::SYSTEM_BIND_IRQ
            | Caps::SYSTEM_MAP_PHYS
            | Caps::SYSTEM_IOPL,
    )?;

    // The init stack: an anonymous VMA mapped at the kernel's
    // choosing. The handle stays in init's table; it owns its stack.
    let mut stack_base = 0u64;
    kernel.vma_create_map(
        process,
        INIT_STACK_PAGES * PAGE_SIZE as u64,
        &mut stack_base,
        VmaFlags::WRITE,
    )?;
    let stack_top = stack_base + INIT_STACK_PAGES * PAGE_SIZE as u64;

    let (thread, _) = kernel.thread_create(
        process,
        args.init.entrypoint,
        stack_top,
        crate::config::DEFAULT_PRIORITY,
        0,
    )?;

    let self_handle = {
        let proc_obj = kernel.obj_as(process, ObjectType::Process)?;
        let cell = proc_obj.as_process().ok_or(Status::Unexpected)?;
        let self_handle = cell.lock().self_handle;
        self_handle
    };

    let values = alloc::vec![
        InitValue {
            init_type: InitType::HandleSelf,
            value: InitPayload {
                handle: TypedHandle {
                    object_type: ObjectType::Process,
                    handle: self_handle,
                },
            },
        },
        InitValue {
            init_type: InitType::HandleOther,
            value: InitPayload {
                handle: TypedHandle {
                    object_type: ObjectType::System,
                    handle: system_handle,
                },
            },
        },
    ];

    Ok(InitHandoff {
        process,
        thread,
        values,
        entrypoint: args.init.entrypoint,
        stack_top,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bootproto::MemEntry;

    fn args_with_map(map: &'static [MemEntry]) -> Args {
        let mut args: Args = unsafe { core::mem::zeroed() };
        args.magic = bootproto::ARGS_MAGIC;
        args.version = bootproto::VERSION;
        args.mem_map = map.as_ptr();
        args.num_map_entries = map.len() as u64;
        args.init.entrypoint = 0x20_0000;
        args
    }

    static GOOD_MAP: [MemEntry; 2] = [
        MemEntry {
            start: 0x10_0000,
            pages: 2048,
            mem_type: MemType::Free,
            attr: 0,
        },
        MemEntry {
            start: 0xfee0_0000,
            pages: 16,
            mem_type: MemType::Mmio,
            attr: 0,
        },
    ];

    #[test]
    fn rejects_stale_version() {
        let mut args = args_with_map(&GOOD_MAP);
        args.version = 1;
        let result = unsafe { bring_up(&args, 1) };
        assert!(matches!(
            result.err(),
            Some(BootError::Args(ArgsError::UnsupportedVersion(1)))
        ));
    }

    #[test]
    fn brings_up_kernel_and_init() {
        let args = args_with_map(&GOOD_MAP);
        let (kernel, handoff) = unsafe { bring_up(&args, 1) }.expect("boot should succeed");

        // Init got its two well-known handles
        assert_eq!(handoff.values.len(), 2);
        assert_eq!(handoff.values[0].init_type, InitType::HandleSelf);
        assert_eq!(handoff.values[1].init_type, InitType::HandleOther);
        assert_eq!(handoff.entrypoint, 0x20_0000);

        // The init thread is runnable
        assert_eq!(kernel.schedule(0), Some(handoff.thread));

        // MMIO pages never reached the allocator: 2048 free minus the
        // heap carve-out, the table root, and the stack VMA bookkeeping
        assert!(kernel.free_frames() <= 2048 - KERNEL_HEAP_PAGES);
    }

    #[test]
    fn refuses_when_no_heap_region_fits() {
        static TINY_MAP: [MemEntry; 1] = [MemEntry {
            start: 0x10_0000,
            pages: 64,
            mem_type: MemType::Free,
            attr: 0,
        }];
        let args = args_with_map(&TINY_MAP);
        let result = unsafe { bring_up(&args, 1) };
        assert!(matches!(result.err(), Some(BootError::NoHeapRegion)));
    }
}
