//! Syscall dispatch
//!
//! The numbered gate between user space and the kernel. Entry order:
//! validate user pointers, resolve and capability-check every handle
//! argument against the table's requirements, then dispatch. Outputs
//! are written back only on success. An unknown number is `nyi`.
//!
//! Arguments arrive in registers per the System-V convention, with
//! spillover on the user stack gathered by the entry stub into a
//! [`SyscallArgs`] record. A blocking handler parks the thread and
//! reports [`Action::Blocked`]; when the thread is rescheduled the
//! stub calls [`finish`] to copy the wait result back out.

pub mod numbers;
pub mod usercopy;

use alloc::vec::Vec;

use j6::caps::Caps;
use j6::syslog::{Area, Severity};
use j6::{Handle, Koid, ObjectType, Status};

use crate::kernel::{Invocation, Kernel};
use crate::objects::VmaFlags;
use crate::memory::VirtAddr;

use numbers::*;

/// Register and stack arguments of one syscall.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallArgs {
    pub args: [u64; 9],
}

impl SyscallArgs {
    pub fn new(args: [u64; 9]) -> Self {
        Self { args }
    }

    #[inline]
    fn at(&self, index: usize) -> u64 {
        self.args[index]
    }
}

/// The calling thread's identity, resolved by the entry stub.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub thread: Koid,
    pub process: Koid,
}

/// What the dispatcher tells the entry stub to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Return this status to the caller now
    Done(Status),
    /// The thread is parked; schedule away and call [`finish`] when
    /// it runs again
    Blocked,
}

/// A handle argument's position and what it must grant.
struct HandleSpec {
    arg: usize,
    otype: ObjectType,
    required: Caps,
}

/// One dispatch table entry.
struct SyscallEntry {
    name: &'static str,
    handles: &'static [HandleSpec],
    handler: fn(&Kernel, Caller, &SyscallArgs) -> Result<Action, Status>,
}

macro_rules! entry {
    ($name:ident, $handler:ident, $handles:expr) => {
        Some(SyscallEntry {
            name: stringify!($name),
            handles: $handles,
            handler: $handler,
        })
    };
}

/// The flat dispatch table, indexed by syscall number.
static TABLE: [Option<SyscallEntry>; SYS_MAX as usize] = [
    entry!(noop, sys_noop, &[]),
    entry!(log, sys_log, &[]),
    entry!(handle_list, sys_handle_list, &[]),
    entry!(handle_clone, sys_handle_clone, &[]),
    entry!(handle_close, sys_handle_close, &[]),
    entry!(
        object_wait,
        sys_object_wait,
        &[]
    ),
    entry!(event_create, sys_event_create, &[]),
    entry!(
        event_signal,
        sys_event_signal,
        &[]
    ),
    entry!(mailbox_create, sys_mailbox_create, &[]),
    entry!(
        mailbox_call,
        sys_mailbox_call,
        &[HandleSpec {
            arg: 0,
            otype: ObjectType::Mailbox,
            required: Caps::MAILBOX_CALL,
        }]
    ),
    entry!(
        mailbox_respond,
        sys_mailbox_respond,
        &[HandleSpec {
            arg: 0,
            otype: ObjectType::Mailbox,
            required: Caps::MAILBOX_RESPOND,
        }]
    ),
    entry!(channel_create, sys_channel_create, &[]),
    entry!(vma_create, sys_vma_create, &[]),
    entry!(vma_create_map, sys_vma_create_map, &[]),
    entry!(
        vma_map,
        sys_vma_map,
        &[HandleSpec {
            arg: 0,
            otype: ObjectType::Vma,
            required: Caps::VMA_MAP,
        }]
    ),
    entry!(
        vma_unmap,
        sys_vma_unmap,
        &[HandleSpec {
            arg: 0,
            otype: ObjectType::Vma,
            required: Caps::VMA_UNMAP,
        }]
    ),
    entry!(
        vma_resize,
        sys_vma_resize,
        &[HandleSpec {
            arg: 0,
            otype: ObjectType::Vma,
            required: Caps::VMA_RESIZE,
        }]
    ),
    entry!(process_create, sys_process_create, &[]),
    entry!(
        process_kill,
        sys_process_kill,
        &[HandleSpec {
            arg: 0,
            otype: ObjectType::Process,
            required: Caps::PROCESS_KILL,
        }]
    ),
    entry!(process_exit, sys_process_exit, &[]),
    entry!(
        thread_create,
        sys_thread_create,
        &[HandleSpec {
            arg: 0,
            otype: ObjectType::Process,
            required: Caps::PROCESS_CREATE_THREAD,
        }]
    ),
    entry!(
        thread_kill,
        sys_thread_kill,
        &[HandleSpec {
            arg: 0,
            otype: ObjectType::Thread,
            required: Caps::THREAD_KILL,
        }]
    ),
    entry!(thread_exit, sys_thread_exit, &[]),
    entry!(thread_sleep, sys_thread_sleep, &[]),
    entry!(
        thread_join,
        sys_thread_join,
        &[HandleSpec {
            arg: 0,
            otype: ObjectType::Thread,
            required: Caps::THREAD_JOIN,
        }]
    ),
    entry!(futex_wait, sys_futex_wait, &[]),
    entry!(futex_wake, sys_futex_wake, &[]),
    entry!(
        system_get_log,
        sys_system_get_log,
        &[HandleSpec {
            arg: 0,
            otype: ObjectType::System,
            required: Caps::SYSTEM_GET_LOG,
        }]
    ),
    entry!(
        system_bind_irq,
        sys_system_bind_irq,
        &[HandleSpec {
            arg: 0,
            otype: ObjectType::System,
            required: Caps::SYSTEM_BIND_IRQ,
        }]
    ),
    entry!(
        system_map_phys,
        sys_system_map_phys,
        &[HandleSpec {
            arg: 0,
            otype: ObjectType::System,
            required: Caps::SYSTEM_MAP_PHYS,
        }]
    ),
    entry!(
        system_request_iopl,
        sys_system_request_iopl,
        &[HandleSpec {
            arg: 0,
            otype: ObjectType::System,
            required: Caps::SYSTEM_IOPL,
        }]
    ),
];

/// The name of a syscall number, for diagnostics and trace output.
pub fn name(num: u64) -> Option<&'static str> {
    TABLE.get(num as usize)?.as_ref().map(|e| e.name)
}

/// Dispatch one syscall.
pub fn dispatch(kernel: &Kernel, caller: Caller, num: u64, args: &SyscallArgs) -> Action {
    let Some(Some(entry)) = TABLE.get(num as usize).map(|e| e.as_ref()) else {
        kernel.log(Area::Syscall, Severity::Warn, "unknown syscall number");
        return Action::Done(Status::Nyi);
    };

    // Resolve and capability-check every declared handle argument
    // before the handler runs; a denied or stale handle never reaches
    // handler code.
    for spec in entry.handles {
        if let Err(status) =
            kernel.resolve_handle(caller.process, args.at(spec.arg), spec.otype, spec.required)
        {
            return Action::Done(status);
        }
    }

    match (entry.handler)(kernel, caller, args) {
        Ok(action) => action,
        Err(status) => Action::Done(status),
    }
}

/// Complete a syscall whose thread blocked and has now been woken:
/// read the wait descriptor and write the outputs user space is owed.
/// Returns the status for the return register.
pub fn finish(kernel: &Kernel, caller: Caller, num: u64, args: &SyscallArgs) -> Status {
    let (status, value, reply) = match kernel.take_wait_result(caller.thread) {
        Some(result) => result,
        None => return Status::Unexpected,
    };

    match num {
        SYS_OBJECT_WAIT => {
            if status == Status::Ok {
                let _ = usercopy::write_u64(caller.process, args.at(3), value);
            }
            status
        }

        SYS_MAILBOX_CALL => finish_mailbox(caller, args, status, reply, true),
        SYS_MAILBOX_RESPOND => {
            // A woken responder has been handed a request to serve
            finish_mailbox(caller, args, status, reply, false)
        }

        SYS_SYSTEM_GET_LOG => {
            if status != Status::Ok {
                return status;
            }
            // The has-log signal fired; pull the entry now
            match read_log_entry(kernel, caller, args) {
                Ok(()) => Status::Ok,
                Err(status) => status,
            }
        }

        // Sleep, join, futex wait: the status is the whole story
        _ => status,
    }
}

/// Write a delivered mailbox message back to the caller's buffers.
fn finish_mailbox(
    caller: Caller,
    args: &SyscallArgs,
    status: Status,
    reply: Option<crate::objects::Delivered>,
    is_call: bool,
) -> Status {
    let tag_ptr = args.at(1);
    let data_ptr = args.at(2);
    let data_len_ptr = args.at(3);
    let handles_ptr = args.at(5);
    let handles_count_ptr = args.at(6);

    match status {
        Status::Ok | Status::Insufficient => {}
        Status::Closed if is_call => {
            // The exchange died: buffers stand, lengths read empty
            let _ = usercopy::write_u64(caller.process, data_len_ptr, 0);
            let _ = usercopy::write_u64(caller.process, handles_count_ptr, 0);
            return status;
        }
        _ => return status,
    }

    let Some(delivered) = reply else {
        return Status::Unexpected;
    };

    let _ = usercopy::write_u64(caller.process, tag_ptr, delivered.tag);
    if !delivered.data.is_empty() {
        let _ = usercopy::copy_out(caller.process, data_ptr, &delivered.data);
    }
    let _ = usercopy::write_u64(caller.process, data_len_ptr, delivered.data.len() as u64);

    for (i, &handle) in delivered.handles.iter().enumerate() {
        let _ = usercopy::write_u64(caller.process, handles_ptr + (i * 8) as u64, handle);
    }
    let _ = usercopy::write_u64(
        caller.process,
        handles_count_ptr,
        delivered.handles.len() as u64,
    );

    status
}

// ----------------------------------------------------------------------
// Handlers

fn sys_noop(_kernel: &Kernel, _caller: Caller, _args: &SyscallArgs) -> Result<Action, Status> {
    Ok(Action::Done(Status::Ok))
}

/// `log(ptr, len)`: append a message to the system log.
fn sys_log(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    let len = args.at(1) as usize;
    if len > j6::syslog::MAX_MESSAGE {
        return Err(Status::InvalidArg);
    }
    let bytes = usercopy::copy_in(caller.process, args.at(0), len)?;
    kernel.log_bytes(Area::User, Severity::Info, &bytes);
    Ok(Action::Done(Status::Ok))
}

/// `handle_list(buf, inout count)`: describe the caller's handles.
fn sys_handle_list(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    let buf_ptr = args.at(0);
    let count_ptr = args.at(1);

    // Clamp the kernel-side staging buffer; a bigger claim than this
    // only changes how much of it gets filled
    let capacity = (usercopy::read_u64(caller.process, count_ptr)? as usize).min(4096);

    let mut descriptors = Vec::new();
    descriptors.resize(
        capacity,
        j6::HandleDescriptor {
            handle: j6::HANDLE_INVALID,
            caps: 0,
            object_type: ObjectType::None,
        },
    );

    match kernel.handle_list(caller.process, &mut descriptors) {
        Ok(total) => {
            for (i, desc) in descriptors[..total].iter().enumerate() {
                let base = buf_ptr + (i * 24) as u64;
                usercopy::write_u64(caller.process, base, desc.handle)?;
                usercopy::write_u64(caller.process, base + 8, desc.caps as u64)?;
                usercopy::write_u64(caller.process, base + 16, desc.object_type as u64)?;
            }
            usercopy::write_u64(caller.process, count_ptr, total as u64)?;
            Ok(Action::Done(Status::Ok))
        }
        Err((status, required)) => {
            // Report how much space a retry needs
            usercopy::write_u64(caller.process, count_ptr, required as u64)?;
            Ok(Action::Done(status))
        }
    }
}

/// `handle_clone(handle, mask, out new)`.
fn sys_handle_clone(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    let mask = Caps::from_bits_truncate(args.at(1) as u32);
    let out_ptr = args.at(2);
    usercopy::validate(out_ptr, 8, 8)?;

    let new_handle = kernel.handle_clone(caller.process, args.at(0), mask)?;
    usercopy::write_u64(caller.process, out_ptr, new_handle)?;
    Ok(Action::Done(Status::Ok))
}

fn sys_handle_close(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    Ok(Action::Done(kernel.handle_close(caller.process, args.at(0))))
}

/// `object_wait(handle, mask, deadline, out signals)`.
fn sys_object_wait(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    let out_ptr = args.at(3);
    usercopy::validate(out_ptr, 8, 8)?;

    match kernel.object_wait(caller.thread, caller.process, args.at(0), args.at(1), args.at(2))? {
        Invocation::Complete(signals) => {
            usercopy::write_u64(caller.process, out_ptr, signals)?;
            Ok(Action::Done(Status::Ok))
        }
        Invocation::Block => Ok(Action::Blocked),
    }
}

fn sys_event_create(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    let out_ptr = args.at(0);
    usercopy::validate(out_ptr, 8, 8)?;

    let handle = kernel.event_create(caller.process)?;
    usercopy::write_u64(caller.process, out_ptr, handle)?;
    Ok(Action::Done(Status::Ok))
}

fn sys_event_signal(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    kernel.object_signal(caller.process, args.at(0), args.at(1))?;
    Ok(Action::Done(Status::Ok))
}

fn sys_mailbox_create(
    kernel: &Kernel,
    caller: Caller,
    args: &SyscallArgs,
) -> Result<Action, Status> {
    let out_ptr = args.at(0);
    usercopy::validate(out_ptr, 8, 8)?;

    let handle = kernel.mailbox_create(caller.process)?;
    usercopy::write_u64(caller.process, out_ptr, handle)?;
    Ok(Action::Done(Status::Ok))
}

/// `mailbox_call(mb, inout tag, data, inout data_len, data_cap,
/// handles, inout handle_count, handle_cap)`.
fn sys_mailbox_call(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    let mb = args.at(0);
    let tag = usercopy::read_u64(caller.process, args.at(1))?;
    let data_len = usercopy::read_u64(caller.process, args.at(3))? as usize;
    let data_cap = args.at(4) as usize;
    let handle_count = usercopy::read_u64(caller.process, args.at(6))? as usize;
    let handle_cap = args.at(7) as usize;

    if data_len > crate::config::MAILBOX_MAX_DATA
        || handle_count > crate::config::MAILBOX_MAX_HANDLES
    {
        return Err(Status::InvalidArg);
    }

    let data = if data_len > 0 {
        usercopy::copy_in(caller.process, args.at(2), data_len)?
    } else {
        Vec::new()
    };

    let mut handles = Vec::with_capacity(handle_count);
    for i in 0..handle_count {
        handles.push(usercopy::read_u64(caller.process, args.at(5) + (i * 8) as u64)?);
    }

    match kernel.mailbox_call(
        caller.thread,
        caller.process,
        mb,
        tag,
        data,
        &handles,
        data_cap,
        handle_cap,
    )? {
        Invocation::Block => Ok(Action::Blocked),
        Invocation::Complete(()) => Ok(Action::Done(Status::Unexpected)),
    }
}

/// `mailbox_respond(mb, inout tag, data, inout data_len, data_cap,
/// handles, inout handle_count, handle_cap, flags)`. A zero tag means
/// no reply is owed yet (the first pickup).
fn sys_mailbox_respond(
    kernel: &Kernel,
    caller: Caller,
    args: &SyscallArgs,
) -> Result<Action, Status> {
    const FLAG_BLOCK: u64 = 1 << 0;

    let mb = args.at(0);
    let tag = usercopy::read_u64(caller.process, args.at(1))?;
    let data_cap = args.at(4) as usize;
    let handle_cap = args.at(7) as usize;
    let block = args.at(8) & FLAG_BLOCK != 0;

    let reply = if tag != j6::tags::INVALID {
        let data_len = usercopy::read_u64(caller.process, args.at(3))? as usize;
        let handle_count = usercopy::read_u64(caller.process, args.at(6))? as usize;
        if data_len > crate::config::MAILBOX_MAX_DATA
            || handle_count > crate::config::MAILBOX_MAX_HANDLES
        {
            return Err(Status::InvalidArg);
        }
        let data = if data_len > 0 {
            usercopy::copy_in(caller.process, args.at(2), data_len)?
        } else {
            Vec::new()
        };
        let mut handles = Vec::with_capacity(handle_count);
        for i in 0..handle_count {
            handles.push(usercopy::read_u64(caller.process, args.at(5) + (i * 8) as u64)?);
        }
        Some((tag, data, handles))
    } else {
        None
    };

    match kernel.mailbox_respond(
        caller.thread,
        caller.process,
        mb,
        reply,
        data_cap,
        handle_cap,
        block,
    )? {
        Invocation::Complete(Some(delivered)) => {
            let status = if delivered.truncated {
                Status::Insufficient
            } else {
                Status::Ok
            };
            Ok(Action::Done(write_delivered(caller, args, delivered, status)))
        }
        Invocation::Complete(None) => Ok(Action::Done(Status::WouldBlock)),
        Invocation::Block => Ok(Action::Blocked),
    }
}

fn write_delivered(
    caller: Caller,
    args: &SyscallArgs,
    delivered: crate::objects::Delivered,
    status: Status,
) -> Status {
    let _ = usercopy::write_u64(caller.process, args.at(1), delivered.tag);
    if !delivered.data.is_empty() {
        let _ = usercopy::copy_out(caller.process, args.at(2), &delivered.data);
    }
    let _ = usercopy::write_u64(caller.process, args.at(3), delivered.data.len() as u64);
    for (i, &handle) in delivered.handles.iter().enumerate() {
        let _ = usercopy::write_u64(caller.process, args.at(5) + (i * 8) as u64, handle);
    }
    let _ = usercopy::write_u64(caller.process, args.at(6), delivered.handles.len() as u64);
    status
}

/// `channel_create(size, out first, out second)`.
fn sys_channel_create(
    kernel: &Kernel,
    caller: Caller,
    args: &SyscallArgs,
) -> Result<Action, Status> {
    usercopy::validate(args.at(1), 8, 8)?;
    usercopy::validate(args.at(2), 8, 8)?;

    let (a, b) = kernel.channel_create(caller.process, args.at(0) as usize)?;
    usercopy::write_u64(caller.process, args.at(1), a)?;
    usercopy::write_u64(caller.process, args.at(2), b)?;
    Ok(Action::Done(Status::Ok))
}

fn sys_vma_create(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    let out_ptr = args.at(2);
    usercopy::validate(out_ptr, 8, 8)?;

    let flags = VmaFlags::from_bits(args.at(1) as u32).ok_or(Status::InvalidArg)?;
    let handle = kernel.vma_create(caller.process, args.at(0), flags)?;
    usercopy::write_u64(caller.process, out_ptr, handle)?;
    Ok(Action::Done(Status::Ok))
}

/// `vma_create_map(size, inout addr, flags, out handle)`.
fn sys_vma_create_map(
    kernel: &Kernel,
    caller: Caller,
    args: &SyscallArgs,
) -> Result<Action, Status> {
    let addr_ptr = args.at(1);
    let out_ptr = args.at(3);
    usercopy::validate(out_ptr, 8, 8)?;

    let flags = VmaFlags::from_bits(args.at(2) as u32).ok_or(Status::InvalidArg)?;
    let mut addr = usercopy::read_u64(caller.process, addr_ptr)?;

    let handle = kernel.vma_create_map(caller.process, args.at(0), &mut addr, flags)?;
    usercopy::write_u64(caller.process, addr_ptr, addr)?;
    usercopy::write_u64(caller.process, out_ptr, handle)?;
    Ok(Action::Done(Status::Ok))
}

/// `vma_map(vma, process, inout addr, flags)`. A zero process handle
/// means the caller itself.
fn sys_vma_map(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    let addr_ptr = args.at(2);
    let flags = VmaFlags::from_bits(args.at(3) as u32).ok_or(Status::InvalidArg)?;

    let target = resolve_process_arg(kernel, caller, args.at(1))?;
    let mut addr = usercopy::read_u64(caller.process, addr_ptr)?;

    kernel.vma_map(caller.process, args.at(0), target, &mut addr, flags)?;
    usercopy::write_u64(caller.process, addr_ptr, addr)?;
    Ok(Action::Done(Status::Ok))
}

fn sys_vma_unmap(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    let target = resolve_process_arg(kernel, caller, args.at(1))?;
    kernel.vma_unmap(caller.process, args.at(0), target)?;
    Ok(Action::Done(Status::Ok))
}

/// `vma_resize(vma, inout size)`.
fn sys_vma_resize(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    let size_ptr = args.at(1);
    let mut size = usercopy::read_u64(caller.process, size_ptr)?;

    kernel.vma_resize(caller.process, args.at(0), &mut size)?;
    usercopy::write_u64(caller.process, size_ptr, size)?;
    Ok(Action::Done(Status::Ok))
}

fn sys_process_create(
    kernel: &Kernel,
    caller: Caller,
    args: &SyscallArgs,
) -> Result<Action, Status> {
    let out_ptr = args.at(0);
    usercopy::validate(out_ptr, 8, 8)?;

    // The child's table root frame comes from the frame allocator;
    // the arch walker fills in the shared kernel half.
    let root = kernel.alloc_table_root()?;
    let (_, handle) = kernel.process_create(caller.process, root)?;
    usercopy::write_u64(caller.process, out_ptr, handle)?;
    Ok(Action::Done(Status::Ok))
}

fn sys_process_kill(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    kernel.process_kill(caller.process, args.at(0))?;
    Ok(Action::Done(Status::Ok))
}

fn sys_process_exit(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    kernel.process_exit(caller.thread, args.at(0))?;
    // The calling thread is gone; the stub schedules away and never
    // returns to it
    Ok(Action::Blocked)
}

/// `thread_create(process, entry, stack, priority, out handle)`.
fn sys_thread_create(
    kernel: &Kernel,
    caller: Caller,
    args: &SyscallArgs,
) -> Result<Action, Status> {
    let out_ptr = args.at(4);
    usercopy::validate(out_ptr, 8, 8)?;

    let entry = kernel.resolve_handle(
        caller.process,
        args.at(0),
        ObjectType::Process,
        Caps::PROCESS_CREATE_THREAD,
    )?;

    let (_, handle) = kernel.thread_create(
        entry.koid,
        args.at(1),
        args.at(2),
        args.at(3) as u8,
        0,
    )?;
    usercopy::write_u64(caller.process, out_ptr, handle)?;
    Ok(Action::Done(Status::Ok))
}

fn sys_thread_kill(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    kernel.thread_kill(caller.process, args.at(0))?;
    Ok(Action::Done(Status::Ok))
}

fn sys_thread_exit(kernel: &Kernel, caller: Caller, _args: &SyscallArgs) -> Result<Action, Status> {
    kernel.thread_exit(caller.thread);
    Ok(Action::Blocked)
}

fn sys_thread_sleep(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    kernel.thread_sleep(caller.thread, args.at(0));
    Ok(Action::Blocked)
}

/// `thread_join(thread, deadline)`.
fn sys_thread_join(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    match kernel.thread_join(caller.thread, caller.process, args.at(0), args.at(1))? {
        Invocation::Complete(()) => Ok(Action::Done(Status::Ok)),
        Invocation::Block => Ok(Action::Blocked),
    }
}

/// `futex_wait(addr, expected, deadline)`.
fn sys_futex_wait(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    let addr = args.at(0);
    // The comparison value is read under the futex path's protection
    let observed = usercopy::read_u32(caller.process, addr)?;

    match kernel.futex_wait(
        caller.thread,
        caller.process,
        VirtAddr::new(addr),
        args.at(1) as u32,
        observed,
        args.at(2),
    )? {
        Invocation::Complete(()) => Ok(Action::Done(Status::Ok)),
        Invocation::Block => Ok(Action::Blocked),
    }
}

/// `futex_wake(addr, count)`.
fn sys_futex_wake(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<Action, Status> {
    usercopy::validate(args.at(0), 4, 4)?;
    kernel.futex_wake(caller.process, VirtAddr::new(args.at(0)), args.at(1) as usize)?;
    Ok(Action::Done(Status::Ok))
}

/// `system_get_log(sys, after_id, buf, inout len)`.
fn sys_system_get_log(
    kernel: &Kernel,
    caller: Caller,
    args: &SyscallArgs,
) -> Result<Action, Status> {
    match read_log_entry(kernel, caller, args) {
        Ok(()) => Ok(Action::Done(Status::Ok)),
        Err(Status::NotReady) => {
            // Nothing pending: park on the system object's has-log bit
            match kernel.wait_for_log(caller.thread, caller.process, args.at(0))? {
                Invocation::Complete(_) => {
                    read_log_entry(kernel, caller, args)?;
                    Ok(Action::Done(Status::Ok))
                }
                Invocation::Block => Ok(Action::Blocked),
            }
        }
        Err(status) => Err(status),
    }
}

/// Pull the next log entry into the caller's buffer: header record,
/// then message bytes.
fn read_log_entry(kernel: &Kernel, caller: Caller, args: &SyscallArgs) -> Result<(), Status> {
    let after_id = args.at(1);
    let buf_ptr = args.at(2);
    let len_ptr = args.at(3);

    // No entry is bigger than a header plus MAX_MESSAGE; larger
    // claims just waste the caller's buffer
    let header_size = j6::syslog::EntryHeader::SIZE;
    let capacity = (usercopy::read_u64(caller.process, len_ptr)? as usize)
        .min(header_size + j6::syslog::MAX_MESSAGE);
    if capacity < header_size {
        return Err(Status::Insufficient);
    }

    let mut message = alloc::vec![0u8; capacity - header_size];
    let (header, len) = kernel.get_log(after_id, &mut message)?;

    let mut frame = alloc::vec::Vec::with_capacity(header_size + len);
    frame.extend_from_slice(&header.id.to_le_bytes());
    frame.extend_from_slice(&header.bytes.to_le_bytes());
    frame.push(header.area);
    frame.push(header.severity);
    frame.extend_from_slice(&[0u8; 4]);
    frame.extend_from_slice(&message[..len]);

    usercopy::copy_out(caller.process, buf_ptr, &frame)?;
    usercopy::write_u64(caller.process, len_ptr, frame.len() as u64)?;
    Ok(())
}

/// `system_bind_irq(sys, mailbox, vector, out handle)`.
fn sys_system_bind_irq(
    kernel: &Kernel,
    caller: Caller,
    args: &SyscallArgs,
) -> Result<Action, Status> {
    let out_ptr = args.at(3);
    usercopy::validate(out_ptr, 8, 8)?;

    let handle =
        kernel.system_bind_irq(caller.process, args.at(0), args.at(2) as u16, args.at(1))?;
    usercopy::write_u64(caller.process, out_ptr, handle)?;
    Ok(Action::Done(Status::Ok))
}

/// `system_map_phys(sys, phys, size, flags, out handle)`.
fn sys_system_map_phys(
    kernel: &Kernel,
    caller: Caller,
    args: &SyscallArgs,
) -> Result<Action, Status> {
    let out_ptr = args.at(4);
    usercopy::validate(out_ptr, 8, 8)?;

    let flags = VmaFlags::from_bits(args.at(3) as u32).ok_or(Status::InvalidArg)?;
    let handle =
        kernel.system_map_phys(caller.process, args.at(0), args.at(1), args.at(2), flags)?;
    usercopy::write_u64(caller.process, out_ptr, handle)?;
    Ok(Action::Done(Status::Ok))
}

fn sys_system_request_iopl(
    kernel: &Kernel,
    caller: Caller,
    args: &SyscallArgs,
) -> Result<Action, Status> {
    kernel.system_request_iopl(caller.process, args.at(0), args.at(1) as u8)?;
    Ok(Action::Done(Status::Ok))
}

/// Process-handle arguments: 0 names the caller's own process.
fn resolve_process_arg(kernel: &Kernel, caller: Caller, handle: Handle) -> Result<Koid, Status> {
    if handle == j6::HANDLE_INVALID {
        return Ok(caller.process);
    }
    let entry = kernel.resolve_handle(caller.process, handle, ObjectType::Process, Caps::empty())?;
    Ok(entry.koid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FrameAllocator;
    use crate::memory::PhysAddr;

    fn test_kernel() -> Kernel {
        let mut frames = FrameAllocator::new();
        frames.add_region(PhysAddr::new(0x10_0000), 512);
        Kernel::new(frames, 1)
    }

    fn spawn(kernel: &Kernel) -> Caller {
        let process = kernel.create_process(PhysAddr::new(0x1000));
        let (thread, _) = kernel.thread_create(process, 0x1000, 0x2000, 16, 0).unwrap();
        Caller { thread, process }
    }

    #[test]
    fn unknown_number_is_nyi() {
        let kernel = test_kernel();
        let caller = spawn(&kernel);
        let action = dispatch(&kernel, caller, 999, &SyscallArgs::default());
        assert_eq!(action, Action::Done(Status::Nyi));
    }

    #[test]
    fn table_names_match_numbers() {
        assert_eq!(name(SYS_NOOP), Some("noop"));
        assert_eq!(name(SYS_MAILBOX_CALL), Some("mailbox_call"));
        assert_eq!(name(SYS_SYSTEM_REQUEST_IOPL), Some("system_request_iopl"));
        assert_eq!(name(SYS_MAX), None);
    }

    #[test]
    fn noop_is_ok() {
        let kernel = test_kernel();
        let caller = spawn(&kernel);
        let action = dispatch(&kernel, caller, SYS_NOOP, &SyscallArgs::default());
        assert_eq!(action, Action::Done(Status::Ok));
    }

    #[test]
    fn bad_out_pointer_is_invalid_arg() {
        let kernel = test_kernel();
        let caller = spawn(&kernel);

        // Kernel-half pointer for the out handle
        let args = SyscallArgs::new([0xffff_8000_dead_0000, 0, 0, 0, 0, 0, 0, 0, 0]);
        let action = dispatch(&kernel, caller, SYS_EVENT_CREATE, &args);
        assert_eq!(action, Action::Done(Status::InvalidArg));
    }

    #[test]
    fn table_checks_handle_caps_before_handlers() {
        let kernel = test_kernel();
        let caller = spawn(&kernel);

        // A mailbox handle stripped of the call capability
        let full = kernel.mailbox_create(caller.process).unwrap();
        let stripped = kernel
            .handle_clone(caller.process, full, Caps::MAILBOX_RESPOND | Caps::CLONE)
            .unwrap();

        let args = SyscallArgs::new([stripped, 0, 0, 0, 0, 0, 0, 0, 0]);
        let action = dispatch(&kernel, caller, SYS_MAILBOX_CALL, &args);
        assert_eq!(action, Action::Done(Status::Denied));
    }

    #[test]
    fn wrong_handle_type_is_invalid_arg() {
        let kernel = test_kernel();
        let caller = spawn(&kernel);

        let event = kernel.event_create(caller.process).unwrap();
        let args = SyscallArgs::new([event, 0, 0, 0, 0, 0, 0, 0, 0]);
        let action = dispatch(&kernel, caller, SYS_MAILBOX_CALL, &args);
        assert_eq!(action, Action::Done(Status::InvalidArg));
    }

    #[test]
    fn event_create_writes_out_handle() {
        let kernel = test_kernel();
        let caller = spawn(&kernel);

        usercopy::testmem::install(caller.process, 0x4000_0000, alloc::vec![0u8; 8]);
        let args = SyscallArgs::new([0x4000_0000, 0, 0, 0, 0, 0, 0, 0, 0]);
        let action = dispatch(&kernel, caller, SYS_EVENT_CREATE, &args);
        assert_eq!(action, Action::Done(Status::Ok));

        let handle = usercopy::read_u64(caller.process, 0x4000_0000).unwrap();
        assert_ne!(handle, j6::HANDLE_INVALID);
    }
}
