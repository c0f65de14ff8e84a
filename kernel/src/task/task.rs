//! Task control block.

use crate::task::context::CpuContext;
use crate::task::elf::LoadedImage;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Slot is fresh or the task is created but not yet runnable.
    New,
    /// In the ready queue, eligible for dispatch.
    Ready,
    /// Currently executing; always the scheduler's current task.
    Running,
    /// Waiting for an explicit unblock.
    Blocked,
    /// Finished; the slot is reusable once a new task claims it.
    Terminated,
}

/// Scheduling priority. Recorded per task (base and dynamic) and reported
/// in stats; the round-robin policy does not consult it yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Idle = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Realtime = 4,
}

/// Length of the fixed task name buffer.
pub const TASK_NAME_LEN: usize = 32;

/// A task control block.
///
/// Ownership of a task lives in the scheduler's table; the queues refer to
/// tasks only by slot index through the `next`/`prev` link fields.
pub struct Task {
    pub tid: u32,
    pub name: [u8; TASK_NAME_LEN],
    pub state: TaskState,
    pub base_priority: TaskPriority,
    pub dynamic_priority: TaskPriority,
    /// Time quantum in ticks before mandatory preemption.
    pub quantum: u64,
    /// Accumulated CPU ticks.
    pub cpu_time: u64,
    /// `cpu_time` at the moment this task was last dispatched.
    pub last_schedule: u64,
    pub exit_code: i32,
    pub context: CpuContext,
    /// Owned top-level page table (0 for the idle task, which borrows the
    /// kernel address space).
    pub page_table: u64,
    /// Top of the owned user stack (virtual).
    pub stack_top: u64,
    /// Contiguous physical backing of the user stack (0 = none).
    pub stack_phys: u64,
    pub stack_size: usize,
    /// Owned ELF segment runs, released at termination.
    pub image: LoadedImage,
    /// Intrusive queue links (slot indices).
    pub next: Option<u16>,
    pub prev: Option<u16>,
}

impl Task {
    pub const EMPTY: Task = Task {
        tid: 0,
        name: [0; TASK_NAME_LEN],
        state: TaskState::New,
        base_priority: TaskPriority::Normal,
        dynamic_priority: TaskPriority::Normal,
        quantum: 0,
        cpu_time: 0,
        last_schedule: 0,
        exit_code: 0,
        context: CpuContext::zeroed(),
        page_table: 0,
        stack_top: 0,
        stack_phys: 0,
        stack_size: 0,
        image: LoadedImage::empty(),
        next: None,
        prev: None,
    };

    /// Copy `name` into the fixed buffer, truncating to 31 bytes.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; TASK_NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(TASK_NAME_LEN - 1);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }

    /// Task name as a string slice.
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(TASK_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("???")
    }

    /// A slot is free when it never held a task or its task terminated.
    pub fn is_free_slot(&self) -> bool {
        (self.state == TaskState::New && self.tid == 0)
            || self.state == TaskState::Terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_truncates_at_31_bytes() {
        let mut t = Task::EMPTY;
        t.set_name("a-task-name-that-is-way-longer-than-the-buffer");
        assert_eq!(t.name_str().len(), TASK_NAME_LEN - 1);
        assert!(t.name_str().starts_with("a-task-name"));
    }

    #[test]
    fn empty_slot_is_free_terminated_slot_is_free() {
        let mut t = Task::EMPTY;
        assert!(t.is_free_slot());

        t.tid = 7;
        t.state = TaskState::Ready;
        assert!(!t.is_free_slot());

        t.state = TaskState::Terminated;
        assert!(t.is_free_slot());
    }

    #[test]
    fn priority_ordering() {
        assert!(TaskPriority::Idle < TaskPriority::Low);
        assert!(TaskPriority::High < TaskPriority::Realtime);
    }
}
