//! Scheduler core
//!
//! Per-CPU run queues of fixed priority with round-robin within each
//! level, plus the timer heap that turns deadlines into `timed_out`
//! wake-ups. The scheduler tracks which thread occupies each CPU; it
//! never touches thread bodies itself. The kernel root moves threads
//! between the scheduler and wait queues, holding the per-object locks
//! it needs; run-queue state is always taken last, per the kernel's
//! lock ordering.

pub mod queues;
pub mod timer;

pub use queues::RunQueues;
pub use timer::{TimerEntry, TimerQueue};

use alloc::vec::Vec;

use j6::Koid;

/// One CPU's scheduling state.
struct Cpu {
    queues: RunQueues,
    current: Option<Koid>,
}

/// The scheduler: run queues per CPU and one timer heap.
pub struct Scheduler {
    cpus: Vec<Cpu>,
    timers: TimerQueue,

    /// Monotonic tick counter; deadlines are absolute ticks
    now: u64,
}

impl Scheduler {
    pub fn new(num_cpus: usize) -> Self {
        debug_assert!(num_cpus >= 1);
        let mut cpus = Vec::with_capacity(num_cpus);
        for _ in 0..num_cpus {
            cpus.push(Cpu {
                queues: RunQueues::new(),
                current: None,
            });
        }
        Self {
            cpus,
            timers: TimerQueue::new(),
            now: 0,
        }
    }

    #[inline]
    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    #[inline]
    pub fn now(&self) -> u64 {
        self.now
    }

    /// The thread occupying `cpu`.
    pub fn current(&self, cpu: usize) -> Option<Koid> {
        self.cpus[cpu].current
    }

    pub fn set_current(&mut self, cpu: usize, thread: Option<Koid>) {
        self.cpus[cpu].current = thread;
    }

    /// Make a thread runnable on `cpu`, at the back of its priority.
    pub fn enqueue(&mut self, cpu: usize, thread: Koid, priority: u8) {
        self.cpus[cpu].queues.enqueue(thread, priority);
    }

    /// Pick the next thread for `cpu` and occupy it. Returns `None`
    /// when every queue is empty (the CPU idles).
    pub fn pick_next(&mut self, cpu: usize) -> Option<Koid> {
        let next = self.cpus[cpu].queues.dequeue_highest().map(|(t, _)| t);
        self.cpus[cpu].current = next;
        next
    }

    /// True if a queued thread outranks `priority` on `cpu`; the
    /// running thread should be preempted at the next decision point.
    pub fn should_preempt(&self, cpu: usize, priority: u8) -> bool {
        match self.cpus[cpu].queues.highest_ready() {
            Some(ready) => ready < priority,
            None => false,
        }
    }

    /// Remove a runnable thread from `cpu`'s queues (kill path).
    pub fn remove(&mut self, cpu: usize, thread: Koid, priority: u8) -> bool {
        self.cpus[cpu].queues.remove(thread, priority)
    }

    /// Remove a thread from whichever CPU's queues hold it.
    pub fn remove_anywhere(&mut self, thread: Koid, priority: u8) -> bool {
        for cpu in &mut self.cpus {
            if cpu.queues.remove(thread, priority) {
                return true;
            }
        }
        false
    }

    /// Vacate any CPU the thread currently occupies (kill path).
    pub fn clear_current(&mut self, thread: Koid) {
        for cpu in &mut self.cpus {
            if cpu.current == Some(thread) {
                cpu.current = None;
            }
        }
    }

    /// Arm a wake-up deadline (absolute ticks). 0 arms nothing.
    pub fn arm_timeout(&mut self, thread: Koid, deadline: u64) {
        self.timers.arm(thread, deadline);
    }

    /// Disarm a thread's deadline after an ordinary wake-up.
    pub fn cancel_timeout(&mut self, thread: Koid) {
        self.timers.disarm(thread);
    }

    /// Advance the clock to `now` and return the threads whose
    /// deadlines fired. The kernel decides for each whether it is
    /// still blocked.
    pub fn advance(&mut self, now: u64) -> Vec<TimerEntry> {
        debug_assert!(now >= self.now);
        self.now = now;
        self.timers.pop_due(now)
    }

    /// Total runnable threads across all CPUs, for diagnostics.
    pub fn runnable_count(&self) -> usize {
        self.cpus.iter().map(|c| c.queues.len()).sum()
    }
}
