//! Kernel-level scenario tests
//!
//! These drive the kernel as a state machine through the same entry
//! points the syscall layer uses. Blocking operations report
//! `Invocation::Block`; the tests then act as the scheduler, waking
//! and inspecting threads through their wait descriptors.

use alloc::vec;
use alloc::vec::Vec;

use j6::caps::Caps;
use j6::{signals, tags, Koid, ObjectType, Status};

use crate::kernel::{Invocation, Kernel};
use crate::memory::{FrameAllocator, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::objects::{ThreadState, VmaFlags};

const RAM_PAGES: usize = 1024;

fn kernel() -> Kernel {
    let mut frames = FrameAllocator::new();
    frames.add_region(PhysAddr::new(0x10_0000), RAM_PAGES);
    Kernel::new(frames, 1)
}

fn spawn_process(kernel: &Kernel) -> Koid {
    let root = kernel.alloc_table_root().unwrap();
    kernel.create_process(root)
}

fn spawn_thread(kernel: &Kernel, process: Koid) -> Koid {
    let (thread, _) = kernel
        .thread_create(process, 0x40_0000, 0x50_0000, 16, 0)
        .unwrap();
    thread
}

fn wait_status(kernel: &Kernel, thread: Koid) -> Option<Status> {
    kernel.take_wait_result(thread).map(|(status, _, _)| status)
}

// ----------------------------------------------------------------------
// Property 1: closing the last handle destroys the object and wakes
// waiters with closed

#[test]
fn handle_close_releases_object() {
    let kernel = kernel();
    let process = spawn_process(&kernel);
    let waiter = spawn_thread(&kernel, process);

    let objects_before = kernel.object_count();
    let event = kernel.event_create(process).unwrap();
    assert_eq!(kernel.object_count(), objects_before + 1);

    // Park a watcher on a user signal bit
    let parked = kernel
        .object_wait(waiter, process, event, signals::USER0, 0)
        .unwrap();
    assert!(matches!(parked, Invocation::Block));

    // The only handle closes: the object dies and the waiter unblocks
    assert_eq!(kernel.handle_close(process, event), Status::Ok);
    assert_eq!(kernel.object_count(), objects_before);
    assert_eq!(wait_status(&kernel, waiter), Some(Status::Closed));
}

// ----------------------------------------------------------------------
// Property 2: capabilities never widen

#[test]
fn clone_cannot_widen_capabilities() {
    let kernel = kernel();
    let process = spawn_process(&kernel);

    let mb = kernel.mailbox_create(process).unwrap();
    let narrowed = kernel
        .handle_clone(process, mb, Caps::MAILBOX_CALL | Caps::CLONE)
        .unwrap();

    // Try to clone the narrowed handle back up to full rights
    let reclone = kernel.handle_clone(process, narrowed, Caps::all()).unwrap();
    assert_eq!(
        j6::handle_caps(reclone),
        (Caps::MAILBOX_CALL | Caps::CLONE).bits()
    );
}

// ----------------------------------------------------------------------
// Property 3 / scenario: mailbox FIFO round trip

#[test]
fn mailbox_serves_callers_in_call_order() {
    let kernel = kernel();
    let process = spawn_process(&kernel);
    let server = spawn_thread(&kernel, process);
    let mb = kernel.mailbox_create(process).unwrap();

    let callers: Vec<Koid> = (0..3).map(|_| spawn_thread(&kernel, process)).collect();
    for (i, &caller) in callers.iter().enumerate() {
        let blocked = kernel
            .mailbox_call(
                caller,
                process,
                mb,
                100 + i as u64,
                vec![i as u8],
                &[],
                64,
                4,
            )
            .unwrap();
        assert!(matches!(blocked, Invocation::Block));
    }

    // The responder drains them in order, echoing tag + 1
    let mut served_tags = Vec::new();
    let mut pending = None;
    for _ in 0..3 {
        let picked = kernel
            .mailbox_respond(server, process, mb, pending.take(), 64, 4, false)
            .unwrap();
        let request = match picked {
            Invocation::Complete(Some(request)) => request,
            other => panic!("expected a request, got {:?}", other),
        };
        served_tags.push(request.tag);
        pending = Some((request.tag + 1, request.data.clone(), Vec::new()));
    }
    // Deliver the final reply; no more callers are pending
    let last = kernel.mailbox_respond(server, process, mb, pending.take(), 64, 4, false);
    assert!(matches!(last, Err(Status::WouldBlock)));

    assert_eq!(served_tags, vec![100, 101, 102]);

    // Each caller observes exactly its own reply
    for (i, &caller) in callers.iter().enumerate() {
        let (status, _, reply) = kernel.take_wait_result(caller).unwrap();
        assert_eq!(status, Status::Ok);
        let reply = reply.unwrap();
        assert_eq!(reply.tag, 101 + i as u64);
        assert_eq!(reply.data, vec![i as u8]);
    }
}

#[test]
fn parked_responder_is_paired_immediately() {
    let kernel = kernel();
    let process = spawn_process(&kernel);
    let server = spawn_thread(&kernel, process);
    let client = spawn_thread(&kernel, process);
    let mb = kernel.mailbox_create(process).unwrap();

    // Server parks first
    let parked = kernel
        .mailbox_respond(server, process, mb, None, 64, 4, true)
        .unwrap();
    assert!(matches!(parked, Invocation::Block));

    // The call pairs with it at once
    kernel
        .mailbox_call(client, process, mb, 7, vec![1, 2, 3], &[], 64, 4)
        .unwrap();

    let (status, _, request) = kernel.take_wait_result(server).unwrap();
    assert_eq!(status, Status::Ok);
    let request = request.unwrap();
    assert_eq!(request.tag, 7);
    assert_eq!(request.data, vec![1, 2, 3]);

    // And the reply goes back to the caller
    kernel
        .mailbox_respond(server, process, mb, Some((8, vec![9], Vec::new())), 64, 4, false)
        .unwrap_err(); // WouldBlock: nothing else pending
    let (status, _, reply) = kernel.take_wait_result(client).unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(reply.unwrap().tag, 8);
}

// ----------------------------------------------------------------------
// Scenario S2: server dies mid-call

#[test]
fn mailbox_closed_mid_call_unblocks_caller() {
    let kernel = kernel();
    let client_proc = spawn_process(&kernel);
    let server_proc = spawn_process(&kernel);
    let client = spawn_thread(&kernel, client_proc);
    let _server = spawn_thread(&kernel, server_proc);

    // The server creates the mailbox and gives the client a
    // call-only handle
    let mb = kernel.mailbox_create(server_proc).unwrap();
    let call_only = kernel
        .handle_clone(server_proc, mb, Caps::MAILBOX_CALL | Caps::TRANSFER)
        .unwrap();
    let client_mb = kernel
        .handle_transfer(server_proc, call_only, client_proc)
        .unwrap();

    let blocked = kernel
        .mailbox_call(client, client_proc, client_mb, 1, vec![0xee], &[], 64, 4)
        .unwrap();
    assert!(matches!(blocked, Invocation::Block));

    // The server process dies before responding; its respond-capable
    // handle goes away and the mailbox closes
    kernel.terminate_process(server_proc, 1).unwrap();

    let (status, _, reply) = kernel.take_wait_result(client).unwrap();
    assert_eq!(status, Status::Closed);
    assert!(reply.is_none());
}

// ----------------------------------------------------------------------
// Scenario S3: handle transfer through a mailbox reply

#[test]
fn reply_transfers_handle_without_refcount_change() {
    let kernel = kernel();
    let proc_a = spawn_process(&kernel);
    let proc_b = spawn_process(&kernel);
    let server_a = spawn_thread(&kernel, proc_a);
    let client_b = spawn_thread(&kernel, proc_b);

    // A shared mailbox: B holds a call-capable handle
    let mb = kernel.mailbox_create(proc_a).unwrap();
    let call_handle = kernel
        .handle_clone(proc_a, mb, Caps::MAILBOX_CALL | Caps::TRANSFER)
        .unwrap();
    let b_mb = kernel.handle_transfer(proc_a, call_handle, proc_b).unwrap();

    // The payload object: an event A will send to B
    let payload = kernel.event_create(proc_a).unwrap();
    let payload_koid = kernel
        .resolve_handle(proc_a, payload, ObjectType::Event, Caps::empty())
        .unwrap()
        .koid;
    let refs_before = kernel.obj(payload_koid).unwrap().header().refs();

    // B calls; A picks up and replies with the handle attached
    kernel
        .mailbox_call(client_b, proc_b, b_mb, 5, Vec::new(), &[], 64, 4)
        .unwrap();
    let request = kernel
        .mailbox_respond(server_a, proc_a, mb, None, 64, 4, false)
        .unwrap();
    assert!(matches!(request, Invocation::Complete(Some(_))));

    kernel
        .mailbox_respond(server_a, proc_a, mb, Some((6, Vec::new(), vec![payload])), 64, 4, false)
        .unwrap_err(); // WouldBlock after delivery

    // A's table no longer holds the handle
    assert_eq!(
        kernel
            .resolve_handle(proc_a, payload, ObjectType::Event, Caps::empty())
            .unwrap_err(),
        Status::InvalidArg
    );

    // B's table holds a new handle with the same caps, and the
    // object's refcount is unchanged
    let (status, _, reply) = kernel.take_wait_result(client_b).unwrap();
    assert_eq!(status, Status::Ok);
    let reply = reply.unwrap();
    assert_eq!(reply.handles.len(), 1);
    let received = kernel
        .resolve_handle(proc_b, reply.handles[0], ObjectType::Event, Caps::empty())
        .unwrap();
    assert_eq!(received.koid, payload_koid);
    // The capability mask crossed unchanged
    assert_eq!(
        received.caps,
        Caps::CLONE | Caps::TRANSFER | Caps::WAIT | Caps::SIGNAL
    );
    assert_eq!(kernel.obj(payload_koid).unwrap().header().refs(), refs_before);
}

// ----------------------------------------------------------------------
// Scenario S4: futex wake count and order

#[test]
fn futex_wake_exact_count_fifo() {
    let kernel = kernel();
    let process = spawn_process(&kernel);
    let addr = VirtAddr::new(0x6000_0000);

    let waiters: Vec<Koid> = (0..5).map(|_| spawn_thread(&kernel, process)).collect();
    for &thread in &waiters {
        let blocked = kernel
            .futex_wait(thread, process, addr, 0, 0, 0)
            .unwrap();
        assert!(matches!(blocked, Invocation::Block));
    }

    assert_eq!(kernel.futex_wake(process, addr, 3).unwrap(), 3);

    // Exactly the first three, in FIFO order, woke with ok
    for &thread in &waiters[..3] {
        assert_eq!(wait_status(&kernel, thread), Some(Status::Ok));
    }
    for &thread in &waiters[3..] {
        assert_eq!(wait_status(&kernel, thread), None);
        let obj = kernel.obj(thread).unwrap();
        assert!(matches!(
            obj.as_thread().unwrap().lock().state(),
            ThreadState::Blocked(_)
        ));
    }
}

#[test]
fn futex_value_mismatch_fails_fast() {
    let kernel = kernel();
    let process = spawn_process(&kernel);
    let thread = spawn_thread(&kernel, process);
    let addr = VirtAddr::new(0x6000_0000);

    let result = kernel.futex_wait(thread, process, addr, 0, 1, 0);
    assert_eq!(result.unwrap_err(), Status::FutexChanged);
}

// ----------------------------------------------------------------------
// Scenario S5: IRQ delivery

#[test]
fn irq_fires_one_message_with_vector_tag() {
    let kernel = kernel();
    let process = spawn_process(&kernel);
    let server = spawn_thread(&kernel, process);

    let mb = kernel.mailbox_create(process).unwrap();
    let sys = kernel
        .grant_system_handle(process, Caps::SYSTEM_BIND_IRQ | Caps::SYSTEM_GET_LOG)
        .unwrap();

    kernel.system_bind_irq(process, sys, 0x30, mb).unwrap();
    kernel.irq_fire(0x30).unwrap();

    let picked = kernel
        .mailbox_respond(server, process, mb, None, 64, 4, false)
        .unwrap();
    let msg = match picked {
        Invocation::Complete(Some(msg)) => msg,
        other => panic!("expected irq message, got {:?}", other),
    };
    assert_eq!(msg.tag, 0xffff_ffff_ffff_0030);
    assert_eq!(msg.tag, tags::from_irq(0x30));
    assert!(msg.data.is_empty());
    assert!(msg.handles.is_empty());

    // Exactly one message arrived
    let again = kernel.mailbox_respond(server, process, mb, None, 64, 4, false);
    assert!(matches!(again, Err(Status::WouldBlock)));
}

#[test]
fn binding_a_vector_twice_collides() {
    let kernel = kernel();
    let process = spawn_process(&kernel);
    let mb = kernel.mailbox_create(process).unwrap();
    let sys = kernel
        .grant_system_handle(process, Caps::SYSTEM_BIND_IRQ)
        .unwrap();

    kernel.system_bind_irq(process, sys, 0x21, mb).unwrap();
    assert_eq!(
        kernel.system_bind_irq(process, sys, 0x21, mb).unwrap_err(),
        Status::Collision
    );
}

// ----------------------------------------------------------------------
// Scenario S6: VMA downsize frees trailing frames

#[test]
fn vma_downsize_frees_frames_and_faults_become_fatal() {
    let kernel = kernel();
    let process = spawn_process(&kernel);

    let mut base = 0u64;
    let vma = kernel
        .vma_create_map(process, 16 * PAGE_SIZE as u64, &mut base, VmaFlags::WRITE)
        .unwrap();
    assert_ne!(base, 0);

    let free_before = kernel.free_frames();

    // Touch every page so all sixteen have frames
    for page in 0..16 {
        kernel
            .handle_user_fault(process, VirtAddr::new(base).offset_pages(page))
            .unwrap();
    }
    assert_eq!(kernel.free_frames(), free_before - 16);

    // Shrink to 4 pages: the 12 trailing frames return to the
    // allocator
    let mut new_size = 4 * PAGE_SIZE as u64;
    kernel.vma_resize(process, vma, &mut new_size).unwrap();
    assert_eq!(new_size, 4 * PAGE_SIZE as u64);
    assert_eq!(kernel.free_frames(), free_before - 4);

    // A touch inside the dropped range is now a fatal fault
    let result = kernel.handle_user_fault(process, VirtAddr::new(base).offset_pages(8));
    assert!(result.is_err());

    // The head still works
    kernel
        .handle_user_fault(process, VirtAddr::new(base).offset_pages(2))
        .unwrap();
}

#[test]
fn exact_map_collision_is_exists() {
    let kernel = kernel();
    let process = spawn_process(&kernel);

    let mut addr_a = 0u64;
    kernel
        .vma_create_map(process, PAGE_SIZE as u64, &mut addr_a, VmaFlags::WRITE)
        .unwrap();

    let vma_b = kernel
        .vma_create(process, PAGE_SIZE as u64, VmaFlags::WRITE)
        .unwrap();
    let mut addr_b = addr_a;
    assert_eq!(
        kernel
            .vma_map(
                process,
                vma_b,
                process,
                &mut addr_b,
                VmaFlags::WRITE | VmaFlags::EXACT
            )
            .unwrap_err(),
        Status::Exists
    );
}

// ----------------------------------------------------------------------
// Property 5: a timed-out wait leaves no scheduler state behind

#[test]
fn timeout_leaves_no_wait_state() {
    let kernel = kernel();
    let process = spawn_process(&kernel);
    let thread = spawn_thread(&kernel, process);

    let event = kernel.event_create(process).unwrap();
    let blocked = kernel
        .object_wait(thread, process, event, signals::USER0, 10)
        .unwrap();
    assert!(matches!(blocked, Invocation::Block));

    kernel.advance_time(10);
    assert_eq!(wait_status(&kernel, thread), Some(Status::TimedOut));

    // A later signal finds no waiter to wake
    kernel.object_signal(process, event, signals::USER0).unwrap();
    assert_eq!(wait_status(&kernel, thread), None);
}

#[test]
fn sleep_wakes_ok_at_deadline() {
    let kernel = kernel();
    let process = spawn_process(&kernel);
    let thread = spawn_thread(&kernel, process);

    kernel.thread_sleep(thread, 25);
    kernel.advance_time(24);
    assert_eq!(wait_status(&kernel, thread), None);
    kernel.advance_time(25);
    assert_eq!(wait_status(&kernel, thread), Some(Status::Ok));
}

// ----------------------------------------------------------------------
// Property 6: no use after close

#[test]
fn operations_on_dead_objects_are_closed() {
    let kernel = kernel();
    let process = spawn_process(&kernel);
    let thread = spawn_thread(&kernel, process);

    // A child process that dies while a handle to it is still held
    let root = kernel.alloc_table_root().unwrap();
    let (child, child_handle) = kernel.process_create(process, root).unwrap();
    let child_thread = spawn_thread(&kernel, child);
    let _ = child_thread;
    kernel.process_kill(process, child_handle).unwrap();

    // Waiting on the dead child for anything but closed fails closed
    assert_eq!(
        kernel
            .object_wait(thread, process, child_handle, signals::USER0, 0)
            .unwrap_err(),
        Status::Closed
    );

    // Waiting for closed itself completes immediately
    let done = kernel
        .object_wait(thread, process, child_handle, signals::CLOSED, 0)
        .unwrap();
    match done {
        Invocation::Complete(word) => assert!(word & signals::CLOSED != 0),
        other => panic!("expected completion, got {:?}", other),
    }

    // A closed handle index is invalid_arg
    assert_eq!(kernel.handle_close(process, child_handle), Status::Ok);
    assert_eq!(kernel.handle_close(process, child_handle), Status::InvalidArg);
}

#[test]
fn join_completes_when_target_exits() {
    let kernel = kernel();
    let process = spawn_process(&kernel);
    let joiner = spawn_thread(&kernel, process);
    let (target, target_handle) = kernel
        .thread_create(process, 0x40_0000, 0x50_0000, 16, 0)
        .unwrap();

    let parked = kernel
        .thread_join(joiner, process, target_handle, 0)
        .unwrap();
    assert!(matches!(parked, Invocation::Block));

    kernel.thread_exit(target);
    assert_eq!(wait_status(&kernel, joiner), Some(Status::Ok));

    // Joining an already exited thread completes on the spot
    kernel
        .thread_join(joiner, process, target_handle, 0)
        .unwrap()
        .unwrap_complete();
}

// ----------------------------------------------------------------------
// Scheduling: priorities and round robin

#[test]
fn scheduler_prefers_higher_priority_and_round_robins() {
    let kernel = kernel();
    let process = spawn_process(&kernel);

    let (low, _) = kernel.thread_create(process, 0, 0, 20, 0).unwrap();
    let (high_a, _) = kernel.thread_create(process, 0, 0, 4, 0).unwrap();
    let (high_b, _) = kernel.thread_create(process, 0, 0, 4, 0).unwrap();

    assert_eq!(kernel.schedule(0), Some(high_a));
    // A tick rotates within the priority level
    assert_eq!(kernel.tick(0, Some(high_a)), Some(high_b));
    assert_eq!(kernel.tick(0, Some(high_b)), Some(high_a));

    // Only when both high threads block does the low one run
    kernel.thread_sleep(high_a, 1000);
    assert_eq!(kernel.schedule(0), Some(high_b));
    kernel.thread_sleep(high_b, 1000);
    assert_eq!(kernel.schedule(0), Some(low));
}

// ----------------------------------------------------------------------
// Channels through handles

#[test]
fn channel_stream_round_trip_and_signals() {
    let kernel = kernel();
    let process = spawn_process(&kernel);

    let (a, b) = kernel.channel_create(process, 4096).unwrap();

    kernel.channel_send(process, a, b"ping ").unwrap();
    kernel.channel_send(process, a, b"pong").unwrap();

    // The receive side sees can_recv rise
    let b_koid = kernel
        .resolve_handle(process, b, ObjectType::Channel, Caps::empty())
        .unwrap()
        .koid;
    let word = kernel.obj(b_koid).unwrap().header().signals();
    assert!(word & signals::CHANNEL_CAN_RECV != 0);

    let mut buf = [0u8; 16];
    let n = kernel.channel_recv(process, b, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping pong");

    // Drained: can_recv falls again
    let word = kernel.obj(b_koid).unwrap().header().signals();
    assert!(word & signals::CHANNEL_CAN_RECV == 0);
    assert!(matches!(
        kernel.channel_recv(process, b, &mut buf),
        Err(Status::WouldBlock)
    ));
}

#[test]
fn destroyed_peer_closes_channel() {
    let kernel = kernel();
    let process = spawn_process(&kernel);

    let (a, b) = kernel.channel_create(process, 4096).unwrap();
    assert_eq!(kernel.handle_close(process, b), Status::Ok);

    assert_eq!(
        kernel.channel_send(process, a, b"x").unwrap_err(),
        Status::Closed
    );
}

// ----------------------------------------------------------------------
// The log ring through the kernel root

#[test]
fn log_readers_park_until_entries_arrive() {
    let kernel = kernel();
    let process = spawn_process(&kernel);
    let reader = spawn_thread(&kernel, process);
    let sys = kernel
        .grant_system_handle(process, Caps::SYSTEM_GET_LOG)
        .unwrap();

    // Drain whatever boot-time entries exist
    let mut buf = [0u8; 512];
    let mut last = 0;
    while let Ok((header, _)) = kernel.get_log(last, &mut buf) {
        last = header.id;
    }

    // Nothing pending: the reader parks
    let parked = kernel.wait_for_log(reader, process, sys).unwrap();
    assert!(matches!(parked, Invocation::Block));

    kernel.log(
        j6::syslog::Area::Sched,
        j6::syslog::Severity::Info,
        "tick storm",
    );
    assert_eq!(wait_status(&kernel, reader), Some(Status::Ok));

    let (header, len) = kernel.get_log(last, &mut buf).unwrap();
    assert!(header.id > last);
    assert_eq!(&buf[..len], b"tick storm");
}
