//! 进程调度接口
//!
//! 块缓存本身不负责调度，但它依赖的两种锁需要知道“当前是哪个任务”，
//! 睡眠锁还需要让出处理器并在锁释放时被唤醒。内核在启动时通过
//! [`install`] 注册自己的调度器，之后所有锁都经由本模块访问它。

use spin::Once;

use crate::spinlock::SpinLockGuard;

#[cfg(any(test, feature = "std"))]
pub mod hosted;

/// 锁原语所需的调度器能力。
///
/// 内核的进程管理器实现该 trait，并在启动阶段调用 [`install`] 注册一次。
pub trait Scheduler: Sync {
    /// 返回当前正在运行的任务（进程 / 内核线程）的标识。
    ///
    /// 同一任务在其生命周期内必须返回相同的值，不同任务的值必须互不相同，
    /// 且不能等于 `usize::MAX`（该值表示“无持有者”）。
    fn task_id(&self) -> usize;

    /// 让当前任务在通道 `chan` 上睡眠。
    ///
    /// # 功能说明
    /// 与 xv6 的 `sleep(chan, lk)` 语义一致：调用时 `guard` 仍被持有，
    /// 实现必须先确保之后的 [`Scheduler::wakeup`] 不会被错过，然后才释放 `guard`，
    /// 再挂起当前任务。返回时 `guard` 已经被释放，调用者需要重新获取锁并检查条件；
    /// 允许伪唤醒。
    fn sleep(&self, chan: usize, guard: SpinLockGuard<'_, ()>);

    /// 唤醒所有在通道 `chan` 上睡眠的任务。
    fn wakeup(&self, chan: usize);

    /// 关闭当前处理器的中断（可嵌套）。
    fn push_off(&self) {}

    /// 与 [`Scheduler::push_off`] 配对，恢复中断状态。
    fn pop_off(&self) {}
}

static SCHEDULER: Once<&'static dyn Scheduler> = Once::new();

/// 注册全局调度器，只有第一次调用生效。
///
/// 必须在第一次使用任何 [`SpinLock`](crate::spinlock::SpinLock) 之前调用。
pub fn install(scheduler: &'static dyn Scheduler) {
    SCHEDULER.call_once(|| scheduler);
}

fn scheduler() -> &'static dyn Scheduler {
    match SCHEDULER.get() {
        Some(scheduler) => *scheduler,
        None => panic!("process: no scheduler installed"),
    }
}

/// 当前任务的标识
#[inline]
pub fn task_id() -> usize {
    scheduler().task_id()
}

/// 在 `chan` 上睡眠，`guard` 在挂起前释放。
pub fn sleep(chan: usize, guard: SpinLockGuard<'_, ()>) {
    scheduler().sleep(chan, guard)
}

/// 唤醒 `chan` 上的所有睡眠者
pub fn wakeup(chan: usize) {
    scheduler().wakeup(chan)
}

pub fn push_off() {
    scheduler().push_off()
}

pub fn pop_off() {
    scheduler().pop_off()
}
