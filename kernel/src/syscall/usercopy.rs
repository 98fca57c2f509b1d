//! User memory access
//!
//! Every user pointer crossing the syscall gate is validated here:
//! null, kernel-half, wrap-around, and misaligned ranges are all
//! `invalid_arg` before anything is touched. On hardware the copies
//! then go straight through the user mapping, which is live during a
//! syscall; the hosted test build substitutes a per-process buffer
//! registry so the same call paths run without an MMU.

use j6::{Koid, Status};

use crate::config::{USER_SPACE_BASE, USER_SPACE_TOP};

/// Check a user range: non-null, naturally aligned, inside the user
/// half, and not wrapping.
pub fn validate(addr: u64, len: usize, align: u64) -> Result<(), Status> {
    if addr == 0 || align != 0 && addr % align != 0 {
        return Err(Status::InvalidArg);
    }
    let end = addr.checked_add(len as u64).ok_or(Status::InvalidArg)?;
    if addr < USER_SPACE_BASE || end > USER_SPACE_TOP {
        return Err(Status::InvalidArg);
    }
    Ok(())
}

/// Copy `len` bytes in from user space.
pub fn copy_in(process: Koid, addr: u64, len: usize) -> Result<alloc::vec::Vec<u8>, Status> {
    validate(addr, len, 1)?;
    imp::copy_in(process, addr, len)
}

/// Copy bytes out to user space.
pub fn copy_out(process: Koid, addr: u64, bytes: &[u8]) -> Result<(), Status> {
    validate(addr, bytes.len(), 1)?;
    imp::copy_out(process, addr, bytes)
}

/// Read a u64 from user space.
pub fn read_u64(process: Koid, addr: u64) -> Result<u64, Status> {
    validate(addr, 8, 8)?;
    let bytes = imp::copy_in(process, addr, 8)?;
    Ok(u64::from_le_bytes(bytes[..8].try_into().unwrap()))
}

/// Write a u64 to user space.
pub fn write_u64(process: Koid, addr: u64, value: u64) -> Result<(), Status> {
    validate(addr, 8, 8)?;
    imp::copy_out(process, addr, &value.to_le_bytes())
}

/// Read a 32-bit futex word.
pub fn read_u32(process: Koid, addr: u64) -> Result<u32, Status> {
    validate(addr, 4, 4)?;
    let bytes = imp::copy_in(process, addr, 4)?;
    Ok(u32::from_le_bytes(bytes[..4].try_into().unwrap()))
}

#[cfg(not(test))]
mod imp {
    use alloc::vec::Vec;

    use j6::{Koid, Status};

    // During a syscall the caller's tables are live in CR3, so a
    // validated user range is directly addressable. A fault inside
    // these copies is routed back as an error by the entry stub.

    pub fn copy_in(_process: Koid, addr: u64, len: usize) -> Result<Vec<u8>, Status> {
        let mut out = Vec::with_capacity(len);
        unsafe {
            let src = core::slice::from_raw_parts(addr as *const u8, len);
            out.extend_from_slice(src);
        }
        Ok(out)
    }

    pub fn copy_out(_process: Koid, addr: u64, bytes: &[u8]) -> Result<(), Status> {
        unsafe {
            let dst = core::slice::from_raw_parts_mut(addr as *mut u8, bytes.len());
            dst.copy_from_slice(bytes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod imp {
    //! Hosted stand-in: a registry of user buffers keyed by process
    //! and base address. Thread-local so parallel tests, whose kernels
    //! hand out overlapping koids, never see each other's memory.

    use alloc::vec::Vec;
    use std::cell::RefCell;

    use hashbrown::HashMap;

    use j6::{Koid, Status};

    std::thread_local! {
        static REGIONS: RefCell<HashMap<(Koid, u64), Vec<u8>>> =
            RefCell::new(HashMap::new());
    }

    fn with_regions<R>(f: impl FnOnce(&mut HashMap<(Koid, u64), Vec<u8>>) -> R) -> R {
        REGIONS.with(|regions| f(&mut regions.borrow_mut()))
    }

    /// Install a user buffer for a test.
    pub fn install(process: Koid, addr: u64, bytes: Vec<u8>) {
        with_regions(|r| {
            r.insert((process, addr), bytes);
        });
    }

    /// Read a whole installed buffer back.
    pub fn fetch(process: Koid, addr: u64) -> Option<Vec<u8>> {
        with_regions(|r| r.get(&(process, addr)).cloned())
    }

    fn locate(
        regions: &mut HashMap<(Koid, u64), Vec<u8>>,
        process: Koid,
        addr: u64,
        len: usize,
    ) -> Result<(u64, usize), Status> {
        for (&(p, base), buf) in regions.iter() {
            if p != process {
                continue;
            }
            let end = base + buf.len() as u64;
            if addr >= base && addr + len as u64 <= end {
                return Ok((base, (addr - base) as usize));
            }
        }
        Err(Status::InvalidArg)
    }

    pub fn copy_in(process: Koid, addr: u64, len: usize) -> Result<Vec<u8>, Status> {
        with_regions(|r| {
            let (base, offset) = locate(r, process, addr, len)?;
            let buf = r.get(&(process, base)).unwrap();
            Ok(buf[offset..offset + len].to_vec())
        })
    }

    pub fn copy_out(process: Koid, addr: u64, bytes: &[u8]) -> Result<(), Status> {
        with_regions(|r| {
            let (base, offset) = locate(r, process, addr, bytes.len())?;
            let buf = r.get_mut(&(process, base)).unwrap();
            buf[offset..offset + bytes.len()].copy_from_slice(bytes);
            Ok(())
        })
    }
}
