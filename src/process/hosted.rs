//! 宿主环境（std 线程）上的调度器与控制台
//!
//! 每个 std 线程被视为一个任务。睡眠 / 唤醒通过一个 `Mutex` + `Condvar`
//! 组成的闸门实现：睡眠者先拿到闸门再释放自旋锁，唤醒者在持有自旋锁时
//! 需要先拿到闸门才能通知，因此唤醒不会丢失。

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use crate::printf::{self, Console};
use crate::spinlock::SpinLockGuard;

use super::Scheduler;

static NEXT_TASK: AtomicUsize = AtomicUsize::new(1);

std::thread_local! {
    static TASK: usize = NEXT_TASK.fetch_add(1, Ordering::Relaxed);
}

/// 以 std 线程为任务的调度器
pub struct HostScheduler {
    gate: Mutex<()>,
    cond: Condvar,
}

impl HostScheduler {
    pub const fn new() -> Self {
        Self {
            gate: Mutex::new(()),
            cond: Condvar::new(),
        }
    }
}

impl Scheduler for HostScheduler {
    fn task_id(&self) -> usize {
        TASK.with(|id| *id)
    }

    fn sleep(&self, _chan: usize, guard: SpinLockGuard<'_, ()>) {
        // 先持有闸门再放开自旋锁，唤醒者必须等我们进入 wait 才能通知
        let gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        drop(guard);
        let gate = self.cond.wait(gate).unwrap_or_else(PoisonError::into_inner);
        drop(gate);
    }

    fn wakeup(&self, _chan: usize) {
        let gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
        drop(gate);
    }
}

/// 输出到标准错误的控制台
pub struct HostConsole;

impl Console for HostConsole {
    fn putc(&self, c: u8) {
        let _ = std::io::stderr().write_all(&[c]);
    }
}

static HOST_SCHEDULER: HostScheduler = HostScheduler::new();
static HOST_CONSOLE: HostConsole = HostConsole;

/// 安装宿主调度器与控制台，可以重复调用。
pub fn init() {
    super::install(&HOST_SCHEDULER);
    printf::set_console(&HOST_CONSOLE);
}
