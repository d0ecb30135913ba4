//! 睡眠锁模块
//! 提供基于进程休眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的进程会进入休眠状态，避免忙等待。

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut, Drop};

use crate::process;
use crate::spinlock::SpinLock;

const NO_HOLDER: usize = usize::MAX;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，当锁被占用时，尝试获取的进程会进入休眠状态，
/// 直到锁被释放后被唤醒。这避免了忙等待，适用于可能长时间持有的锁，
/// 例如跨越一次磁盘传输的缓冲块数据。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护`locked`与`holder`状态
/// - `locked`: 表示锁是否已被占用
/// - `holder`: 持有锁的任务标识
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    holder: Cell<usize>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
// `locked` 与 `holder` 只在持有内部自旋锁时访问
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            holder: Cell::new(NO_HOLDER),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞进程）
    ///
    /// # 功能说明
    /// 尝试获取睡眠锁。如果锁已被占用，当前进程将进入休眠状态，
    /// 直到锁被释放后被唤醒。返回守卫对象提供对数据的访问。
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁保护临界区
    /// 2. 检查`locked`状态：
    ///   - 如果已锁定：调用`sleep()`让当前进程休眠，醒来后重新获取自旋锁再检查
    ///   - 如果未锁定：设置`locked=true`并记录持有者
    /// 3. 释放内部自旋锁（因已设置locked状态）
    ///
    /// # 返回值
    /// `SleepLockGuard<T>`守卫对象，提供对内部数据的访问
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();

        while self.locked.get() {
            // 让当前进程休眠，等待锁释放
            process::sleep(self.chan(), guard);
            guard = self.lock.lock();
        }

        self.locked.set(true);
        self.holder.set(process::task_id());
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 当前任务是否持有该睡眠锁
    pub fn holding(&self) -> bool {
        let guard = self.lock.lock();
        let holding = self.locked.get() && self.holder.get() == process::task_id();
        drop(guard);
        holding
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    ///
    /// 在内部自旋锁保护下清除状态并唤醒等待者，
    /// 保证唤醒发生在睡眠者真正进入等待之后。
    /// 只有持有者可以释放。
    fn unlock(&self) {
        let guard = self.lock.lock();
        if self.holder.get() != process::task_id() {
            drop(guard);
            panic!("sleeplock {} release", self.name);
        }
        self.locked.set(false);
        self.holder.set(NO_HOLDER);
        process::wakeup(self.chan());
        drop(guard);
    }

    /// 睡眠通道：`locked` 字段的地址
    fn chan(&self) -> usize {
        self.locked.as_ptr() as usize
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 当守卫存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    /// 当前任务是否仍是该锁的持有者
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::hosted;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn holder_is_tracked() {
        hosted::init();
        let l = SleepLock::new(0u8, "holder");
        assert!(!l.holding());
        let guard = l.lock();
        assert!(guard.holding());
        std::thread::scope(|s| {
            s.spawn(|| assert!(!l.holding()));
        });
        drop(guard);
        assert!(!l.holding());
    }

    #[test]
    fn release_by_another_task_is_fatal() {
        hosted::init();
        let l = SleepLock::new(0u8, "handoff");
        let guard = l.lock();
        let released = std::thread::scope(|s| s.spawn(move || drop(guard)).join());
        assert!(released.is_err());
        assert!(l.holding());
    }

    #[test]
    fn waiter_sleeps_until_release() {
        hosted::init();
        let l = SleepLock::new(Vec::new(), "waiter");
        let released = AtomicBool::new(false);
        let barrier = Barrier::new(2);
        std::thread::scope(|s| {
            let mut guard = l.lock();
            s.spawn(|| {
                barrier.wait();
                let mut guard = l.lock();
                // 只有在持有者释放之后才能拿到锁
                assert!(released.load(Ordering::SeqCst));
                guard.push(2);
            });
            barrier.wait();
            std::thread::sleep(Duration::from_millis(20));
            guard.push(1);
            released.store(true, Ordering::SeqCst);
            drop(guard);
        });
        assert_eq!(*l.lock(), vec![1, 2]);
    }

    #[test]
    fn mutual_exclusion_across_tasks() {
        hosted::init();
        let l = SleepLock::new(0usize, "counter");
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..500 {
                        let mut guard = l.lock();
                        let v = *guard;
                        std::thread::yield_now();
                        *guard = v + 1;
                    }
                });
            }
        });
        assert_eq!(*l.lock(), 2000);
    }
}
