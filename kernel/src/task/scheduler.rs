//! Preemptive round-robin scheduler.
//!
//! A fixed table of 256 task control blocks; slot 0 is permanently the idle
//! task wrapping the boot-time kernel context. The ready queue is a doubly
//! linked chain of slot indices threaded through the control blocks
//! (arrival order); the blocked queue is a singly linked chain. A task is
//! in at most one queue at any time.
//!
//! Locking: every path that mutates the table or queues holds [`TASK_LOCK`]
//! with interrupts disabled. The timer tick is the one exception: it runs
//! in interrupt context, where the lock can never be held (all holders run
//! with IF=0), so it accesses the table directly.

use crate::arch::x86::{gdt, idt, pic, pit};
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::{physical, virtual_mem, FRAME_SIZE};
use crate::sync::spinlock::Spinlock;
use crate::task::context::{context_restore, context_switch, CpuContext};
use crate::task::elf::{self, ElfFile};
use crate::task::task::{Task, TaskPriority, TaskState};

/// Capacity of the task table.
pub const MAX_TASKS: usize = 256;

/// Slot 0 is always the idle task.
const IDLE_SLOT: usize = 0;

/// Default time quantum in ticks.
pub const DEFAULT_QUANTUM: u64 = 20;

/// Scheduler tick rate in Hz.
pub const TICK_RATE: u32 = 1000;

/// Size of each task's user stack.
const USER_STACK_SIZE: usize = 64 * 1024;
const USER_STACK_PAGES: usize = USER_STACK_SIZE / FRAME_SIZE;

/// Top of the user stack, just below the 2 GiB mark. The stack grows down
/// from here; a guard page sits immediately below it.
const USER_STACK_TOP: u64 = 0x7FFF_F000;

/// Most argv/envp entries `execute` accepts.
const MAX_ARGS: usize = 32;

/// Auxiliary vector entry: page size.
const AT_PAGESZ: u64 = 6;

/// Aggregate scheduler counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub total_tasks_created: u64,
    pub context_switches: u64,
    pub ticks_since_boot: u64,
    pub idle_ticks: u64,
    pub current_task_count: u32,
    pub ready_tasks: u32,
    pub blocked_tasks: u32,
}

/// The task table plus queue heads and counters.
pub struct TaskTable {
    tasks: [Task; MAX_TASKS],
    ready_head: Option<u16>,
    ready_tail: Option<u16>,
    blocked_head: Option<u16>,
    current: u16,
    next_tid: u32,
    default_quantum: u64,
    stats: SchedulerStats,
}

impl TaskTable {
    pub const fn new() -> Self {
        TaskTable {
            tasks: [Task::EMPTY; MAX_TASKS],
            ready_head: None,
            ready_tail: None,
            blocked_head: None,
            current: IDLE_SLOT as u16,
            next_tid: 1,
            default_quantum: DEFAULT_QUANTUM,
            stats: SchedulerStats {
                total_tasks_created: 0,
                context_switches: 0,
                ticks_since_boot: 0,
                idle_ticks: 0,
                current_task_count: 0,
                ready_tasks: 0,
                blocked_tasks: 0,
            },
        }
    }

    /// Next task id: monotonically increasing 32-bit, skipping 0 on wrap.
    fn alloc_tid(&mut self) -> u32 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        if self.next_tid == 0 {
            self.next_tid = 1;
        }
        tid
    }

    /// Reserve a free slot (never slot 0). Free means never-used or
    /// Terminated.
    fn alloc_slot(&mut self) -> Option<usize> {
        (1..MAX_TASKS).find(|&i| self.tasks[i].is_free_slot())
    }

    /// Slot index holding `tid`, if any live task has it.
    fn slot_of(&self, tid: u32) -> Option<usize> {
        (0..MAX_TASKS).find(|&i| {
            let t = &self.tasks[i];
            t.tid == tid && !(t.state == TaskState::New && t.tid == 0)
        })
    }

    /// Append to the tail of the ready queue (arrival order).
    fn push_ready(&mut self, slot: usize) {
        self.tasks[slot].next = None;
        self.tasks[slot].prev = self.ready_tail;
        match self.ready_tail {
            Some(tail) => self.tasks[tail as usize].next = Some(slot as u16),
            None => self.ready_head = Some(slot as u16),
        }
        self.ready_tail = Some(slot as u16);
        self.tasks[slot].state = TaskState::Ready;
    }

    /// Pop the head of the ready queue.
    fn pop_ready(&mut self) -> Option<usize> {
        let head = self.ready_head? as usize;
        self.ready_head = self.tasks[head].next;
        match self.ready_head {
            Some(new_head) => self.tasks[new_head as usize].prev = None,
            None => self.ready_tail = None,
        }
        self.tasks[head].next = None;
        self.tasks[head].prev = None;
        Some(head)
    }

    /// Unlink a task from the middle of the ready queue.
    fn remove_from_ready(&mut self, slot: usize) {
        let prev = self.tasks[slot].prev;
        let next = self.tasks[slot].next;
        match prev {
            Some(p) => self.tasks[p as usize].next = next,
            None if self.ready_head == Some(slot as u16) => self.ready_head = next,
            None => return, // not queued
        }
        match next {
            Some(n) => self.tasks[n as usize].prev = prev,
            None if self.ready_tail == Some(slot as u16) => self.ready_tail = prev,
            None => {}
        }
        self.tasks[slot].next = None;
        self.tasks[slot].prev = None;
    }

    /// Push onto the blocked queue (LIFO, singly linked).
    fn push_blocked(&mut self, slot: usize) {
        self.tasks[slot].next = self.blocked_head;
        self.tasks[slot].prev = None;
        self.blocked_head = Some(slot as u16);
        self.tasks[slot].state = TaskState::Blocked;
    }

    /// Unlink a task from the blocked queue.
    fn remove_from_blocked(&mut self, slot: usize) {
        let mut cursor = self.blocked_head;
        let mut prev: Option<u16> = None;
        while let Some(c) = cursor {
            if c as usize == slot {
                match prev {
                    Some(p) => self.tasks[p as usize].next = self.tasks[slot].next,
                    None => self.blocked_head = self.tasks[slot].next,
                }
                self.tasks[slot].next = None;
                return;
            }
            prev = cursor;
            cursor = self.tasks[c as usize].next;
        }
    }

    /// Remove a task from whichever queue its state says it is in.
    fn remove_from_queues(&mut self, slot: usize) {
        match self.tasks[slot].state {
            TaskState::Ready => self.remove_from_ready(slot),
            TaskState::Blocked => self.remove_from_blocked(slot),
            _ => {}
        }
    }

    fn count_state(&self, state: TaskState) -> u32 {
        (0..MAX_TASKS)
            .filter(|&i| !self.tasks[i].is_free_slot() || i == IDLE_SLOT)
            .filter(|&i| self.tasks[i].state == state)
            .count() as u32
    }
}

static TASK_LOCK: Spinlock<()> = Spinlock::new(());

static mut TABLE: TaskTable = TaskTable::new();

/// Direct table access.
///
/// Callers must either hold [`TASK_LOCK`] or run in interrupt context
/// (IF=0, where no lock holder can be interrupted mid-section).
fn table() -> &'static mut TaskTable {
    unsafe { &mut TABLE }
}

/// Initialize the scheduler: set the quantum, hook the tick source, and
/// program the timer at the scheduler's tick rate.
pub fn init(quantum: u64, tick_rate: u32) {
    table().default_quantum = quantum;
    pit::register_callback(timer_tick);
    pit::init(tick_rate);
    crate::log_info!(
        "Scheduler: quantum {} ticks at {} Hz",
        quantum,
        tick_rate
    );
}

/// Register the boot-time kernel context as the idle task (slot 0, TID 0).
///
/// The idle task borrows the kernel address space and runs whenever the
/// ready queue is empty; its quantum never expires.
pub fn register_idle() {
    let _guard = TASK_LOCK.lock();
    let t = table();
    let idle = &mut t.tasks[IDLE_SLOT];
    idle.tid = 0;
    idle.set_name("idle");
    idle.state = TaskState::Running;
    idle.base_priority = TaskPriority::Idle;
    idle.dynamic_priority = TaskPriority::Idle;
    idle.quantum = u64::MAX;
    idle.page_table = 0;
    idle.context = CpuContext::zeroed();
    idle.context.cr3 = virtual_mem::kernel_space().cr3();
    t.current = IDLE_SLOT as u16;
    crate::log_debug!("Scheduler: idle task registered (TID 0)");
}

/// Create a task from an ELF buffer.
///
/// Builds the task's address space and user stack (with a non-present
/// guard page below it), loads the image, and constructs the initial Ring 3
/// context. The task is left in the New state; [`execute`] makes it
/// runnable. Returns the new TID.
pub fn create(elf_data: &[u8], name: &str, priority: TaskPriority) -> Option<u32> {
    let elf = match ElfFile::parse(elf_data) {
        Ok(elf) => elf,
        Err(e) => {
            crate::log_error!("Scheduler: ELF rejected for '{}': {}", name, e);
            return None;
        }
    };

    let _guard = TASK_LOCK.lock();
    let t = table();

    let slot = match t.alloc_slot() {
        Some(slot) => slot,
        None => {
            crate::log_error!("Scheduler: task table full");
            return None;
        }
    };

    let space = match virtual_mem::create_address_space() {
        Some(space) => space,
        None => {
            crate::log_error!("Scheduler: failed to create address space");
            return None;
        }
    };

    // User stack: one contiguous run mapped below USER_STACK_TOP, guarded
    // by an explicit non-present page underneath.
    let stack_bottom = USER_STACK_TOP - USER_STACK_SIZE as u64;
    let stack_phys = match physical::alloc_frames(USER_STACK_PAGES) {
        Some(p) => p,
        None => {
            virtual_mem::delete_address_space(space);
            crate::log_error!("Scheduler: out of frames for user stack");
            return None;
        }
    };
    unsafe {
        core::ptr::write_bytes(virtual_mem::phys_to_virt(stack_phys), 0, USER_STACK_SIZE);
    }
    if !virtual_mem::map_pages_in(
        &space,
        VirtAddr::new(stack_bottom),
        stack_phys,
        USER_STACK_PAGES,
        virtual_mem::FLAG_WRITABLE | virtual_mem::FLAG_USER | virtual_mem::FLAG_NO_EXECUTE,
    ) {
        physical::free_frames(stack_phys, USER_STACK_PAGES);
        virtual_mem::delete_address_space(space);
        return None;
    }
    virtual_mem::map_guard_page_in(&space, VirtAddr::new(stack_bottom - FRAME_SIZE as u64));

    let image = match elf.load(&space, 0) {
        Ok(image) => image,
        Err(e) => {
            crate::log_error!("Scheduler: failed to load '{}': {}", name, e);
            virtual_mem::unmap_pages_in(&space, VirtAddr::new(stack_bottom), USER_STACK_PAGES);
            physical::free_frames(stack_phys, USER_STACK_PAGES);
            virtual_mem::delete_address_space(space);
            return None;
        }
    };

    let tid = t.alloc_tid();
    let task = &mut t.tasks[slot];
    *task = Task::EMPTY;
    task.tid = tid;
    task.set_name(name);
    task.state = TaskState::New;
    task.base_priority = priority;
    task.dynamic_priority = priority;
    task.quantum = t.default_quantum;
    task.page_table = space.cr3();
    task.stack_top = USER_STACK_TOP;
    task.stack_phys = stack_phys.as_u64();
    task.stack_size = USER_STACK_SIZE;
    task.image = image;

    // Initial Ring 3 context: entry point, interrupts enabled, user
    // selectors with RPL=3. RSP is finalized by `execute` once the
    // argument block is on the stack.
    task.context = CpuContext::zeroed();
    task.context.rip = image.entry;
    task.context.rsp = USER_STACK_TOP;
    task.context.rflags = 0x202;
    task.context.cs = (gdt::USER_CODE_SEL | gdt::RPL_USER) as u64;
    task.context.ss = (gdt::USER_DATA_SEL | gdt::RPL_USER) as u64;
    task.context.ds = task.context.ss;
    task.context.es = task.context.ss;
    task.context.fs = task.context.ss;
    task.context.gs = task.context.ss;
    task.context.cr3 = space.cr3();

    t.stats.total_tasks_created += 1;
    crate::log_info!(
        "Scheduler: created '{}' (TID {}, entry {:#x})",
        name, tid, image.entry
    );
    Some(tid)
}

/// Make a created task runnable: build the Linux-style argc/argv/envp/auxv
/// block on its stack and append it to the ready queue.
pub fn execute(tid: u32, argv: &[&str], envp: &[&str]) -> bool {
    let _guard = TASK_LOCK.lock();
    let t = table();
    let slot = match t.slot_of(tid) {
        Some(slot) => slot,
        None => {
            crate::log_error!("Scheduler: execute of unknown TID {}", tid);
            return false;
        }
    };
    if t.tasks[slot].state != TaskState::New {
        crate::log_error!("Scheduler: execute of TID {} in state {:?}", tid, t.tasks[slot].state);
        return false;
    }

    let task = &mut t.tasks[slot];
    let stack = unsafe {
        core::slice::from_raw_parts_mut(
            virtual_mem::phys_to_virt(PhysAddr::new(task.stack_phys)),
            task.stack_size,
        )
    };
    let rsp = match build_user_stack(stack, task.stack_top, argv, envp) {
        Some(rsp) => rsp,
        None => {
            crate::log_error!("Scheduler: argument block too large for TID {}", tid);
            return false;
        }
    };
    task.context.rsp = rsp;

    t.push_ready(slot);
    crate::log_debug!("Scheduler: TID {} ready (rsp {:#x})", tid, rsp);
    true
}

/// Create and immediately start a task.
pub fn spawn(
    elf_data: &[u8],
    name: &str,
    priority: TaskPriority,
    argv: &[&str],
    envp: &[&str],
) -> Option<u32> {
    let tid = create(elf_data, name, priority)?;
    if !execute(tid, argv, envp) {
        terminate(tid, -1);
        return None;
    }
    Some(tid)
}

/// Lay out the initial user stack: string data at the top, then a 16-byte
/// aligned block of argc, argv pointers, NULL, envp pointers, NULL, auxv.
///
/// `buf` is the stack's backing memory; `buf[len-1]` corresponds to virtual
/// address `stack_top - 1`. Returns the initial RSP.
fn build_user_stack(buf: &mut [u8], stack_top: u64, argv: &[&str], envp: &[&str]) -> Option<u64> {
    if argv.len() > MAX_ARGS || envp.len() > MAX_ARGS {
        return None;
    }
    let stack_bottom = stack_top - buf.len() as u64;
    let offset_of = |virt: u64| (virt - stack_bottom) as usize;

    let mut cursor = stack_top;
    let mut argv_ptrs = [0u64; MAX_ARGS];
    let mut envp_ptrs = [0u64; MAX_ARGS];

    let mut copy_string = |cursor: &mut u64, s: &str| -> Option<u64> {
        let bytes = s.as_bytes();
        *cursor = cursor.checked_sub(bytes.len() as u64 + 1)?;
        if *cursor < stack_bottom {
            return None;
        }
        let at = offset_of(*cursor);
        buf[at..at + bytes.len()].copy_from_slice(bytes);
        buf[at + bytes.len()] = 0;
        Some(*cursor)
    };

    for (i, arg) in argv.iter().enumerate() {
        argv_ptrs[i] = copy_string(&mut cursor, arg)?;
    }
    for (i, env) in envp.iter().enumerate() {
        envp_ptrs[i] = copy_string(&mut cursor, env)?;
    }

    // Vector block: argc + argv[] + NULL + envp[] + NULL + 2 auxv pairs.
    let words = 1 + argv.len() + 1 + envp.len() + 1 + 4;
    cursor &= !0xF;
    let mut rsp = cursor - (words as u64) * 8;
    rsp &= !0xF;
    if rsp < stack_bottom {
        return None;
    }

    let mut write_word = |at: &mut u64, value: u64| {
        let idx = offset_of(*at);
        buf[idx..idx + 8].copy_from_slice(&value.to_le_bytes());
        *at += 8;
    };

    let mut at = rsp;
    write_word(&mut at, argv.len() as u64);
    for ptr in &argv_ptrs[..argv.len()] {
        write_word(&mut at, *ptr);
    }
    write_word(&mut at, 0);
    for ptr in &envp_ptrs[..envp.len()] {
        write_word(&mut at, *ptr);
    }
    write_word(&mut at, 0);
    write_word(&mut at, AT_PAGESZ);
    write_word(&mut at, FRAME_SIZE as u64);
    write_word(&mut at, 0); // AT_NULL
    write_word(&mut at, 0);

    Some(rsp)
}

/// A task must be preempted once it has run a full quantum since it was
/// last dispatched.
fn quantum_expired(task: &Task) -> bool {
    task.cpu_time - task.last_schedule >= task.quantum
}

/// Copy the interrupted register file out of the trap frame into a task's
/// saved context. Segment selectors keep their initialized values.
fn capture_frame(context: &mut CpuContext, frame: &idt::InterruptFrame) {
    context.rax = frame.rax;
    context.rbx = frame.rbx;
    context.rcx = frame.rcx;
    context.rdx = frame.rdx;
    context.rsi = frame.rsi;
    context.rdi = frame.rdi;
    context.rbp = frame.rbp;
    context.rsp = frame.rsp;
    context.r8 = frame.r8;
    context.r9 = frame.r9;
    context.r10 = frame.r10;
    context.r11 = frame.r11;
    context.r12 = frame.r12;
    context.r13 = frame.r13;
    context.r14 = frame.r14;
    context.r15 = frame.r15;
    context.rip = frame.rip;
    context.rflags = frame.rflags;
    context.cs = frame.cs;
    context.ss = frame.ss;
}

/// Timer tick callback: account CPU time and preempt on quantum expiry.
///
/// Runs in interrupt context with IF=0; see the module-level locking note.
fn timer_tick(ticks: u64) {
    let t = table();
    t.stats.ticks_since_boot = ticks;

    let cur = t.current as usize;
    if cur == IDLE_SLOT {
        t.stats.idle_ticks += 1;
    }

    if t.tasks[cur].state == TaskState::Running {
        t.tasks[cur].cpu_time += 1;
        if cur != IDLE_SLOT && quantum_expired(&t.tasks[cur]) {
            t.tasks[cur].state = TaskState::Ready;
            let slot = cur;
            t.push_ready(slot);
            preempt(t);
        } else if cur == IDLE_SLOT && t.ready_head.is_some() {
            // Idle never expires, but it yields the instant real work shows up.
            preempt(t);
        }
    } else {
        // Current went non-Running between ticks: pick someone else now.
        preempt(t);
    }
}

/// Dispatch the next ready task from interrupt context.
///
/// Exactly one context switch per tick: either the same task is re-armed
/// (sole runnable) or the interrupted context is captured from the trap
/// frame and the next task is restored directly, never returning here.
fn preempt(t: &mut TaskTable) {
    let prev = t.current as usize;
    let next = t.pop_ready().unwrap_or(IDLE_SLOT);

    t.stats.context_switches += 1;

    if next == prev {
        let task = &mut t.tasks[prev];
        task.state = TaskState::Running;
        task.last_schedule = task.cpu_time;
        return;
    }

    if t.tasks[prev].state == TaskState::Running {
        t.tasks[prev].state = TaskState::Ready;
    }
    if let Some(frame) = idt::active_frame() {
        capture_frame(&mut t.tasks[prev].context, frame);
    }

    let task = &mut t.tasks[next];
    task.state = TaskState::Running;
    task.last_schedule = task.cpu_time;
    t.current = next as u16;

    let target = if task.page_table != 0 {
        virtual_mem::AddressSpace::from_cr3(task.page_table)
    } else {
        virtual_mem::kernel_space()
    };
    virtual_mem::switch_address_space(&target);
    gdt::set_kernel_stack(gdt::interrupt_stack_top());

    // The dispatch path below never returns, so acknowledge the timer IRQ
    // here; the CR3 load and the iretq inside context_restore form one
    // uninterruptible transition (IF stays 0 until the restored RFLAGS).
    pic::send_eoi(0);
    let context = &t.tasks[next].context as *const CpuContext;
    unsafe { context_restore(context) }
}

/// Voluntarily give up the CPU. No-op when nothing else is runnable.
pub fn yield_now() {
    let guard = TASK_LOCK.lock();
    let t = table();
    let cur = t.current as usize;

    let next = match t.pop_ready() {
        Some(next) => next,
        None => return, // guard drops, nothing to do
    };

    if cur != IDLE_SLOT && t.tasks[cur].state == TaskState::Running {
        t.tasks[cur].state = TaskState::Ready;
        t.push_ready(cur);
    }

    switch_to(t, cur, next, guard);
}

/// Block the current task until [`unblock`] is called on it.
pub fn block_current() {
    let guard = TASK_LOCK.lock();
    let t = table();
    let cur = t.current as usize;
    if cur == IDLE_SLOT {
        crate::log_error!("Scheduler: idle task cannot block");
        return;
    }

    t.push_blocked(cur);
    let next = t.pop_ready().unwrap_or(IDLE_SLOT);
    switch_to(t, cur, next, guard);
}

/// Move a blocked task back to the ready queue.
pub fn unblock(tid: u32) -> bool {
    let _guard = TASK_LOCK.lock();
    let t = table();
    let slot = match t.slot_of(tid) {
        Some(slot) => slot,
        None => return false,
    };
    if t.tasks[slot].state != TaskState::Blocked {
        return false;
    }
    t.remove_from_blocked(slot);
    t.push_ready(slot);
    true
}

/// Common voluntary switch tail: mark `next` running, swap CR3, save the
/// calling kernel context and resume `next`.
///
/// The lock is released with interrupts still disabled; they come back
/// only through the resumed context's RFLAGS, making the switch atomic.
fn switch_to(
    t: &mut TaskTable,
    prev: usize,
    next: usize,
    guard: crate::sync::spinlock::SpinlockGuard<'_, ()>,
) {
    if prev == next {
        drop(guard);
        return;
    }

    if t.tasks[prev].state == TaskState::Running {
        t.tasks[prev].state = TaskState::Ready;
    }

    let task = &mut t.tasks[next];
    task.state = TaskState::Running;
    task.last_schedule = task.cpu_time;
    t.current = next as u16;
    t.stats.context_switches += 1;

    let target = if task.page_table != 0 {
        virtual_mem::AddressSpace::from_cr3(task.page_table)
    } else {
        virtual_mem::kernel_space()
    };
    virtual_mem::switch_address_space(&target);
    gdt::set_kernel_stack(gdt::interrupt_stack_top());

    let prev_context = core::ptr::addr_of_mut!(t.tasks[prev].context);
    let next_context = core::ptr::addr_of!(t.tasks[next].context);
    guard.release_no_irq_restore();
    unsafe {
        context_switch(prev_context, next_context);
    }
    // Resumed here when `prev` is dispatched again; interrupt state was
    // restored from its saved RFLAGS.
}

/// Release everything a task owns: ELF segments, user stack, address
/// space. Runs with the kernel address space active. Idempotent.
fn release_resources(task: &mut Task) {
    if task.page_table == 0 {
        return;
    }
    let space = virtual_mem::AddressSpace::from_cr3(task.page_table);

    if task.image.is_loaded() {
        elf::unload(&space, &task.image);
        task.image = elf::LoadedImage::empty();
    }
    if task.stack_phys != 0 {
        let stack_bottom = task.stack_top - task.stack_size as u64;
        virtual_mem::unmap_pages_in(&space, VirtAddr::new(stack_bottom), task.stack_size / FRAME_SIZE);
        physical::free_frames(PhysAddr::new(task.stack_phys), task.stack_size / FRAME_SIZE);
        task.stack_phys = 0;
    }
    virtual_mem::delete_address_space(space);
    task.page_table = 0;
}

/// Terminate a task and reclaim its resources.
///
/// Terminating the current task dispatches the next one and does not
/// return. The control block keeps its slot (state Terminated, exit code
/// readable) until a new task reuses it.
pub fn terminate(tid: u32, exit_code: i32) -> bool {
    if tid == 0 {
        crate::log_error!("Scheduler: refusing to terminate the idle task");
        return false;
    }

    let guard = TASK_LOCK.lock();
    let t = table();
    let slot = match t.slot_of(tid) {
        Some(slot) => slot,
        None => return false,
    };
    if t.tasks[slot].state == TaskState::Terminated {
        return false;
    }

    let is_current = slot == t.current as usize;
    t.remove_from_queues(slot);

    if is_current {
        // Step off the dying address space before tearing it down.
        virtual_mem::switch_address_space(&virtual_mem::kernel_space());
    }
    release_resources(&mut t.tasks[slot]);
    t.tasks[slot].state = TaskState::Terminated;
    t.tasks[slot].exit_code = exit_code;
    crate::log_info!(
        "Scheduler: TID {} terminated (exit code {})",
        tid, exit_code
    );

    if !is_current {
        return true;
    }

    // The current task is gone; hand the CPU to the next one.
    let next = t.pop_ready().unwrap_or(IDLE_SLOT);
    let task = &mut t.tasks[next];
    task.state = TaskState::Running;
    task.last_schedule = task.cpu_time;
    t.current = next as u16;
    t.stats.context_switches += 1;

    let target = if task.page_table != 0 {
        virtual_mem::AddressSpace::from_cr3(task.page_table)
    } else {
        virtual_mem::kernel_space()
    };
    virtual_mem::switch_address_space(&target);
    gdt::set_kernel_stack(gdt::interrupt_stack_top());

    let context = &t.tasks[next].context as *const CpuContext;
    guard.release_no_irq_restore();
    unsafe { context_restore(context) }
}

/// Terminate the current task. Never returns.
pub fn exit_current(exit_code: i32) -> ! {
    let tid = current_tid();
    terminate(tid, exit_code);
    // Only reachable if the current task was the idle task.
    panic!("exit_current on the idle task");
}

/// Kill the faulting task from an exception handler. Never returns to the
/// faulting context; other tasks are unaffected.
///
/// Exception context: the lock cannot be held (holders run with IF=0), so
/// the table is accessed directly.
pub fn fault_terminate(frame: &mut idt::InterruptFrame) {
    let t = table();
    let cur = t.current as usize;
    if cur == IDLE_SLOT {
        return; // fault in the kernel itself; caller halts
    }
    let tid = t.tasks[cur].tid;
    crate::log_error!(
        "Scheduler: killing TID {} ('{}') after fault at RIP {:#x}",
        tid,
        t.tasks[cur].name_str(),
        frame.rip
    );

    virtual_mem::switch_address_space(&virtual_mem::kernel_space());
    release_resources(&mut t.tasks[cur]);
    t.tasks[cur].state = TaskState::Terminated;
    t.tasks[cur].exit_code = 139;

    let next = t.pop_ready().unwrap_or(IDLE_SLOT);
    let task = &mut t.tasks[next];
    task.state = TaskState::Running;
    task.last_schedule = task.cpu_time;
    t.current = next as u16;
    t.stats.context_switches += 1;

    let target = if task.page_table != 0 {
        virtual_mem::AddressSpace::from_cr3(task.page_table)
    } else {
        virtual_mem::kernel_space()
    };
    virtual_mem::switch_address_space(&target);
    gdt::set_kernel_stack(gdt::interrupt_stack_top());

    let context = &t.tasks[next].context as *const CpuContext;
    unsafe { context_restore(context) }
}

/// TID of the task currently on the CPU.
pub fn current_tid() -> u32 {
    let t = table();
    t.tasks[t.current as usize].tid
}

/// Waitpid-style query: accumulated CPU ticks, lifecycle state, exit code.
pub fn task_stats(tid: u32) -> Option<(u64, TaskState, i32)> {
    let _guard = TASK_LOCK.lock();
    let t = table();
    let slot = t.slot_of(tid)?;
    let task = &t.tasks[slot];
    Some((task.cpu_time, task.state, task.exit_code))
}

/// Record a task's priority (base and dynamic). The round-robin policy
/// records but does not consult it.
pub fn set_priority(tid: u32, priority: TaskPriority) -> bool {
    let _guard = TASK_LOCK.lock();
    let t = table();
    let slot = match t.slot_of(tid) {
        Some(slot) => slot,
        None => return false,
    };
    t.tasks[slot].base_priority = priority;
    t.tasks[slot].dynamic_priority = priority;
    true
}

/// Fill `out` with the TIDs of live tasks; returns how many were written.
pub fn list_tasks(out: &mut [u32]) -> usize {
    let _guard = TASK_LOCK.lock();
    let t = table();
    let mut n = 0;
    for i in 0..MAX_TASKS {
        if n == out.len() {
            break;
        }
        if i == IDLE_SLOT || !t.tasks[i].is_free_slot() {
            out[n] = t.tasks[i].tid;
            n += 1;
        }
    }
    n
}

/// Aggregate scheduler counters with live per-state counts.
pub fn stats() -> SchedulerStats {
    let _guard = TASK_LOCK.lock();
    let t = table();
    let mut s = t.stats;
    s.ready_tasks = t.count_state(TaskState::Ready);
    s.blocked_tasks = t.count_state(TaskState::Blocked);
    s.current_task_count = (0..MAX_TASKS)
        .filter(|&i| i == IDLE_SLOT || !t.tasks[i].is_free_slot())
        .count() as u32;
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_table() -> TaskTable {
        let mut t = TaskTable::new();
        t.tasks[IDLE_SLOT].set_name("idle");
        t.tasks[IDLE_SLOT].state = TaskState::Running;
        t.tasks[IDLE_SLOT].quantum = u64::MAX;
        t
    }

    /// Claim a slot and give it a live task shell.
    fn add_task(t: &mut TaskTable, quantum: u64) -> usize {
        let slot = t.alloc_slot().unwrap();
        let tid = t.alloc_tid();
        t.tasks[slot] = Task::EMPTY;
        t.tasks[slot].tid = tid;
        t.tasks[slot].state = TaskState::New;
        t.tasks[slot].quantum = quantum;
        slot
    }

    #[test]
    fn tid_allocation_skips_zero_on_wrap() {
        let mut t = fresh_table();
        t.next_tid = u32::MAX;
        assert_eq!(t.alloc_tid(), u32::MAX);
        assert_eq!(t.alloc_tid(), 1);
    }

    #[test]
    fn slot_zero_is_never_allocated() {
        let mut t = fresh_table();
        for _ in 0..10 {
            let slot = add_task(&mut t, 10);
            assert_ne!(slot, IDLE_SLOT);
        }
    }

    #[test]
    fn terminated_slots_are_reusable() {
        let mut t = fresh_table();
        let slot = add_task(&mut t, 10);
        t.tasks[slot].state = TaskState::Terminated;
        let again = t.alloc_slot().unwrap();
        assert_eq!(again, slot);
    }

    #[test]
    fn ready_queue_is_fifo_by_arrival() {
        let mut t = fresh_table();
        let a = add_task(&mut t, 10);
        let b = add_task(&mut t, 10);
        let c = add_task(&mut t, 10);
        t.push_ready(a);
        t.push_ready(b);
        t.push_ready(c);
        assert_eq!(t.pop_ready(), Some(a));
        assert_eq!(t.pop_ready(), Some(b));
        assert_eq!(t.pop_ready(), Some(c));
        assert_eq!(t.pop_ready(), None);
        assert_eq!(t.ready_tail, None);
    }

    #[test]
    fn remove_from_middle_of_ready_queue() {
        let mut t = fresh_table();
        let a = add_task(&mut t, 10);
        let b = add_task(&mut t, 10);
        let c = add_task(&mut t, 10);
        t.push_ready(a);
        t.push_ready(b);
        t.push_ready(c);

        t.remove_from_ready(b);
        assert_eq!(t.pop_ready(), Some(a));
        assert_eq!(t.pop_ready(), Some(c));
        assert_eq!(t.pop_ready(), None);
    }

    #[test]
    fn remove_head_and_tail_fix_queue_ends() {
        let mut t = fresh_table();
        let a = add_task(&mut t, 10);
        let b = add_task(&mut t, 10);
        t.push_ready(a);
        t.push_ready(b);

        t.remove_from_ready(a);
        assert_eq!(t.ready_head, Some(b as u16));
        t.remove_from_ready(b);
        assert_eq!(t.ready_head, None);
        assert_eq!(t.ready_tail, None);
    }

    #[test]
    fn task_is_in_at_most_one_queue() {
        let mut t = fresh_table();
        let a = add_task(&mut t, 10);
        t.push_ready(a);
        t.remove_from_queues(a);
        t.push_blocked(a);

        // Not reachable from the ready queue anymore.
        assert_eq!(t.pop_ready(), None);
        assert_eq!(t.blocked_head, Some(a as u16));
    }

    #[test]
    fn blocked_queue_remove_relinks() {
        let mut t = fresh_table();
        let a = add_task(&mut t, 10);
        let b = add_task(&mut t, 10);
        t.push_blocked(a);
        t.push_blocked(b); // head = b -> a

        t.remove_from_blocked(a);
        assert_eq!(t.blocked_head, Some(b as u16));
        assert_eq!(t.tasks[b].next, None);

        t.remove_from_blocked(b);
        assert_eq!(t.blocked_head, None);
    }

    #[test]
    fn quantum_expiry_condition() {
        let mut t = fresh_table();
        let slot = add_task(&mut t, 3);
        t.tasks[slot].state = TaskState::Running;
        t.tasks[slot].last_schedule = 5;
        t.tasks[slot].cpu_time = 7;
        let task = &t.tasks[slot];
        assert!(task.cpu_time - task.last_schedule < task.quantum);
        let task = &mut t.tasks[slot];
        task.cpu_time = 8;
        assert!(task.cpu_time - task.last_schedule >= task.quantum);
    }

    /// Drive the tick/preemption policy against a table without touching
    /// real CPU state: returns per-slot CPU time after `ticks` timer ticks.
    fn simulate_round_robin(t: &mut TaskTable, mut current: usize, ticks: u64) -> usize {
        for _ in 0..ticks {
            t.tasks[current].cpu_time += 1;
            if current != IDLE_SLOT && quantum_expired(&t.tasks[current]) {
                t.tasks[current].state = TaskState::Ready;
                let slot = current;
                t.push_ready(slot);
                let next = t.pop_ready().unwrap_or(IDLE_SLOT);
                t.tasks[next].state = TaskState::Running;
                t.tasks[next].last_schedule = t.tasks[next].cpu_time;
                t.stats.context_switches += 1;
                current = next;
            } else if current == IDLE_SLOT {
                if let Some(next) = t.pop_ready() {
                    t.tasks[next].state = TaskState::Running;
                    t.tasks[next].last_schedule = t.tasks[next].cpu_time;
                    t.stats.context_switches += 1;
                    current = next;
                }
            }
        }
        current
    }

    #[test]
    fn two_tasks_share_the_cpu_evenly() {
        // Two identical tasks with quantum 10, starting from idle. The
        // first tick goes to idle; after that the quantum alternates, so
        // at any full rotation both have identical CPU time.
        let mut t = fresh_table();
        let a = add_task(&mut t, 10);
        let b = add_task(&mut t, 10);
        t.push_ready(a);
        t.push_ready(b);

        simulate_round_robin(&mut t, IDLE_SLOT, 41);

        assert_eq!(t.tasks[a].cpu_time + t.tasks[b].cpu_time, 40);
        assert_eq!(t.tasks[a].cpu_time, t.tasks[b].cpu_time);
        // Mid-rotation the imbalance never exceeds one quantum.
        simulate_round_robin(&mut t, a, 5);
        assert!(t.tasks[a].cpu_time.abs_diff(t.tasks[b].cpu_time) <= 10);
    }

    #[test]
    fn sole_task_is_requeued_and_redispatched_on_expiry() {
        // One task with quantum 3: every third tick it is preempted, found
        // to be the only runnable task, and dispatched again.
        let mut t = fresh_table();
        let slot = add_task(&mut t, 3);
        t.push_ready(slot);

        let current = simulate_round_robin(&mut t, IDLE_SLOT, 11);

        assert_eq!(current, slot);
        assert_eq!(t.tasks[slot].cpu_time, 10); // first tick went to idle
        // Initial dispatch plus at least two expiry re-dispatches.
        assert!(t.stats.context_switches >= 3);
        assert_eq!(t.tasks[slot].state, TaskState::Running);
    }

    #[test]
    fn user_stack_block_is_16_byte_aligned() {
        let mut buf = vec![0u8; USER_STACK_SIZE];
        let rsp = build_user_stack(&mut buf, USER_STACK_TOP, &["prog", "arg1"], &["PATH=/bin"])
            .unwrap();
        assert_eq!(rsp % 16, 0);
        assert!(rsp < USER_STACK_TOP);
    }

    #[test]
    fn user_stack_layout_argc_argv_envp_auxv() {
        let mut buf = vec![0u8; USER_STACK_SIZE];
        let top = USER_STACK_TOP;
        let rsp = build_user_stack(&mut buf, top, &["prog", "x"], &["A=1"]).unwrap();
        let bottom = top - buf.len() as u64;
        let word = |virt: u64| {
            let at = (virt - bottom) as usize;
            u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
        };

        // argc
        assert_eq!(word(rsp), 2);
        // argv[0] points at "prog\0"
        let argv0 = word(rsp + 8);
        let at = (argv0 - bottom) as usize;
        assert_eq!(&buf[at..at + 5], b"prog\0");
        // argv terminator
        assert_eq!(word(rsp + 24), 0);
        // envp[0] points at "A=1\0"
        let envp0 = word(rsp + 32);
        let at = (envp0 - bottom) as usize;
        assert_eq!(&buf[at..at + 4], b"A=1\0");
        // envp terminator
        assert_eq!(word(rsp + 40), 0);
        // auxv: AT_PAGESZ then AT_NULL
        assert_eq!(word(rsp + 48), AT_PAGESZ);
        assert_eq!(word(rsp + 56), FRAME_SIZE as u64);
        assert_eq!(word(rsp + 64), 0);
        assert_eq!(word(rsp + 72), 0);
    }

    #[test]
    fn user_stack_rejects_too_many_args() {
        let mut buf = vec![0u8; USER_STACK_SIZE];
        let args = ["x"; MAX_ARGS + 1];
        assert!(build_user_stack(&mut buf, USER_STACK_TOP, &args, &[]).is_none());
    }

    #[test]
    fn capture_frame_copies_interrupted_registers() {
        let mut context = CpuContext::zeroed();
        context.ds = 0x23;
        let mut frame: idt::InterruptFrame = unsafe { core::mem::zeroed() };
        frame.rax = 0x11;
        frame.r15 = 0x22;
        frame.rip = 0x40_0000;
        frame.rsp = 0x7FFF_0000;
        frame.rflags = 0x202;
        frame.cs = 0x1B;
        frame.ss = 0x23;

        capture_frame(&mut context, &frame);
        assert_eq!(context.rax, 0x11);
        assert_eq!(context.r15, 0x22);
        assert_eq!(context.rip, 0x40_0000);
        assert_eq!(context.rsp, 0x7FFF_0000);
        assert_eq!(context.cs, 0x1B);
        // Selector fields not in the frame are preserved.
        assert_eq!(context.ds, 0x23);
    }
}
