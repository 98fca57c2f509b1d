//! jsix boot protocol, version 2
//!
//! The bootloader hands the kernel a single [`Args`] record describing
//! everything it needs to take over the machine: the page-table root,
//! the UEFI memory map, pre-made frame accounting, the init program,
//! and firmware pointers. All records are 64-bit packed, C-ABI,
//! little-endian, and naturally aligned.
//!
//! A [`Header`] record is embedded in the kernel image itself; the
//! loader refuses images older than [`MIN_VERSION`], and the kernel
//! refuses [`Args`] records whose magic or version do not match.

#![no_std]

use bitflags::bitflags;

/// Magic introducing an [`Args`] record: `'j6KERNEL'` read as a
/// little-endian u64.
pub const ARGS_MAGIC: u64 = 0x4c45_4e52_454b_366a;

/// Current boot protocol version.
pub const VERSION: u16 = 2;

/// Oldest args version the kernel will accept.
pub const MIN_VERSION: u16 = 2;

/// Types of memory in the loader's map. Only `Free` may be handed to
/// the frame allocator.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    /// Conventional memory, free for kernel use
    Free = 0,
    /// In use by the loader but reclaimable once args are consumed
    Pending = 1,
    /// ACPI tables; never allocate
    Acpi = 2,
    /// UEFI runtime services; never allocate
    UefiRuntime = 3,
    /// Memory-mapped device space; never allocate
    Mmio = 4,
    /// Non-volatile memory; never allocate
    Persistent = 5,
}

impl MemType {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Pending),
            2 => Some(Self::Acpi),
            3 => Some(Self::UefiRuntime),
            4 => Some(Self::Mmio),
            5 => Some(Self::Persistent),
            _ => None,
        }
    }
}

/// One entry in the loader's memory map.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemEntry {
    /// Physical start address, page aligned
    pub start: u64,
    /// Length in 4 KiB pages
    pub pages: u64,
    /// What this range holds
    pub mem_type: MemType,
    /// UEFI attribute bits, passed through
    pub attr: u32,
}

bitflags! {
    /// Cacheability and protection attributes of a frame block.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        const UNCACHEABLE      = 0x0000_0001;
        const WRITE_COMBINING  = 0x0000_0002;
        const WRITE_THROUGH    = 0x0000_0004;
        const WRITE_BACK       = 0x0000_0008;

        const WRITE_PROTECT    = 0x0000_1000;
        const READ_PROTECT     = 0x0000_2000;
        const EXEC_PROTECT     = 0x0000_4000;
        const NON_VOLATILE     = 0x0000_8000;
    }
}

/// A contiguous block of physical frames with shared attributes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FrameBlock {
    /// Physical base address
    pub base: u64,
    /// Number of 4 KiB frames in the block
    pub count: u32,
    /// Attributes common to the whole block
    pub flags: FrameFlags,
}

/// What a page allocation made by the loader is for. The kernel keeps
/// these labels for diagnostic dumps.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationType {
    None = 0,
    PageTable = 1,
    MemMap = 2,
    FrameMap = 3,
    File = 4,
    Program = 5,
    InitArgs = 6,
}

/// A single contiguous allocation of pages made before kernel entry.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PageAllocation {
    pub address: u64,
    pub count: u32,
    pub alloc_type: AllocationType,
    pub _reserved: [u8; 3],
}

/// Number of allocation entries per register page.
pub const ALLOCATIONS_PER_REGISTER: usize = 255;

/// A page-sized register of [`PageAllocation`] entries, chained through
/// `next`.
#[repr(C)]
pub struct AllocationRegister {
    pub next: *const AllocationRegister,
    pub count: u8,
    pub _reserved: [u8; 7],
    pub entries: [PageAllocation; ALLOCATIONS_PER_REGISTER],
}

bitflags! {
    /// Section permissions in a program descriptor.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        const EXECUTE = 1 << 0;
        const WRITE   = 1 << 1;
        const READ    = 1 << 2;
    }
}

/// One loadable section of the init program.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProgramSection {
    pub phys_addr: u64,
    pub virt_addr: u64,
    pub size: u32,
    pub flags: SectionFlags,
}

/// The init program, already loaded into physical memory by the boot
/// loader. The kernel builds the first user process from this.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Program {
    pub entrypoint: u64,
    pub phys_base: u64,
    pub sections: *const ProgramSection,
    pub num_sections: u64,
}

bitflags! {
    /// Boot option flags.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BootFlags: u16 {
        const DEBUG = 1 << 0;
        const TEST  = 1 << 1;
    }
}

/// Everything the bootloader passes to the kernel.
#[repr(C)]
pub struct Args {
    pub magic: u64,
    pub version: u16,
    pub flags: BootFlags,
    pub _reserved: u32,

    /// Physical address of the top-level page table root
    pub pml4: u64,

    /// The loader's memory map
    pub mem_map: *const MemEntry,
    pub num_map_entries: u64,

    /// Pre-built frame accounting blocks
    pub frame_blocks: *const FrameBlock,
    pub num_frame_blocks: u64,

    /// Chain of page allocations made before kernel entry
    pub allocations: *const AllocationRegister,

    /// Address of the early panic handler
    pub panic_handler: u64,

    /// Kernel symbol table for panic backtraces
    pub symbol_table: *const u8,
    pub symbol_table_size: u64,

    /// The init process image
    pub init: Program,

    /// Head of the list of init modules
    pub init_modules: u64,

    /// UEFI runtime services pointer
    pub runtime_services: u64,

    /// ACPI RSDP
    pub acpi_table: u64,
}

/// Header embedded at a known offset in the kernel image, checked by
/// the loader before jumping in.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub magic: u64,

    pub length: u16,
    pub version: u16,

    pub version_major: u16,
    pub version_minor: u16,
    pub version_patch: u16,
    pub _reserved: u16,

    pub version_gitsha: u32,

    pub flags: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<Header>(), 32);
static_assertions::const_assert_eq!(core::mem::size_of::<MemEntry>(), 24);
static_assertions::const_assert_eq!(core::mem::align_of::<Args>(), 8);

/// Reasons the kernel refuses a boot args record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgsError {
    BadMagic(u64),
    UnsupportedVersion(u16),
}

impl Args {
    /// Check the magic and version before trusting anything else in
    /// the record.
    pub fn validate(&self) -> Result<(), ArgsError> {
        if self.magic != ARGS_MAGIC {
            return Err(ArgsError::BadMagic(self.magic));
        }
        if self.version < MIN_VERSION {
            return Err(ArgsError::UnsupportedVersion(self.version));
        }
        Ok(())
    }

    /// The memory map as a slice.
    ///
    /// # Safety
    /// `mem_map` and `num_map_entries` must describe a valid, live
    /// array, as produced by a conforming loader.
    pub unsafe fn memory_map(&self) -> &[MemEntry] {
        if self.mem_map.is_null() {
            return &[];
        }
        core::slice::from_raw_parts(self.mem_map, self.num_map_entries as usize)
    }
}
