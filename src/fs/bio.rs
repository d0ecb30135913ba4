//! 缓存层
//!
//! 块缓存是一组固定数量的缓冲块，缓存磁盘块内容，并作为多个进程
//! 访问同一磁盘块时的同步点。
//!
//! 接口：
//! * 通过 `bread` 获取某个磁盘块对应的缓冲块；
//! * 修改数据后调用 `bwrite` 写回磁盘；
//! * 使用完毕后丢弃 `Buf`（或调用 `brelse`）释放缓冲块；
//! * 释放后不得再使用该缓冲块；
//! * 同一时刻只有一个进程可以使用某个缓冲块，因此不要长时间持有。

use array_macro::array;

use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::consts::fs::{BSIZE, NBUF};
use crate::driver::BlockDevice;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

/// 缓冲区缓存（Buffer Cache）结构体，用于块设备的读写缓存。
///
/// `Bcache` 提供了一个固定大小的内存缓冲区池，用于缓存磁盘块数据，
/// 以减少重复的磁盘访问。它结合 LRU（最近最少使用）替换策略
/// 维护块缓冲的使用顺序，并通过自旋锁与睡眠锁两级锁实现线程安全的数据访问。
///
/// 该结构在内核初始化阶段构造一次，以共享引用的方式交给文件系统使用，
/// 是文件系统与块设备驱动之间的关键缓冲层。
pub struct Bcache<D: BlockDevice> {
    /// 控制 LRU 缓存元信息的自旋锁。
    ///
    /// 保护 `BufLru`：LRU 链表结构以及每个缓冲块的引用计数、块号与设备号。
    /// 持有该锁期间不得睡眠，也不得获取缓冲块的睡眠锁。
    ctrl: SpinLock<BufLru>,

    /// 缓冲块数组，长度为固定值 `NBUF`，与 `BufLru::inner` 的前 `NBUF` 项一一对应。
    bufs: [BufInner; NBUF],

    /// 底层块设备
    disk: D,

    /// 命中、缺失与磁盘传输计数
    counters: Counters,
}

impl<D: BlockDevice> Bcache<D> {
    /// 构造块缓存。
    ///
    /// 初始化元信息自旋锁与每个缓冲块的睡眠锁，并把全部缓冲块串入 LRU 链表。
    /// 此时所有缓冲块都未绑定任何磁盘块，引用计数为 0；不会发生磁盘访问。
    pub fn new(disk: D) -> Self {
        if cfg!(feature = "verbose_init_info") {
            println!("bcache: {} buffers of {} bytes", NBUF, BSIZE);
        }
        Self {
            ctrl: SpinLock::new(BufLru::new(), "bcache"),
            bufs: array![_ => BufInner::new(); NBUF],
            disk,
            counters: Counters::new(),
        }
    }

    /// 缓冲块数量
    pub fn capacity(&self) -> usize {
        NBUF
    }

    pub fn disk(&self) -> &D {
        &self.disk
    }

    /// 查询 `(dev, blockno)` 当前是否驻留在缓存中，不增加引用计数。
    pub fn cached(&self, dev: u32, blockno: u32) -> bool {
        self.ctrl.lock().lookup(dev, blockno).is_some()
    }

    /// 命中、缺失与磁盘传输次数的快照
    pub fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    /// 获取指定设备与块号对应的缓冲块。
    ///
    /// # 功能说明
    /// `bget` 是缓冲区缓存系统的底层接口，用于查找是否已缓存给定的 `(dev, blockno)` 对应的块。
    /// 若缓存命中，则返回已存在的缓冲块；否则回收一个未被引用的块，并将其分配给新请求。
    /// 该函数不涉及实际磁盘读写，调用者需通过 `VALID` 标志判断是否需要从磁盘加载数据。
    ///
    /// # 流程解释
    /// - 首先通过自旋锁锁住 `BufLru` 控制结构；
    /// - 调用 `find_cached` 从最近使用端开始查找是否已有缓存块命中；
    ///   - 若命中，则增加引用计数，释放自旋锁后获取该块的睡眠锁并返回；
    /// - 若未命中，调用 `recycle` 从 LRU 尾部回收一个未被引用的缓存块；
    ///   - 若成功回收，则清除其标志位（包括 `VALID`），释放自旋锁后获取睡眠锁并返回；
    ///   - 若无法回收（所有缓冲块都在被使用），触发 panic。
    ///
    /// 自旋锁总是在获取睡眠锁之前释放：两者从不嵌套持有。
    ///
    /// # 可能的错误
    /// - 当所有缓冲块都处于被引用状态时，无法执行替换，会触发 panic（`"bget: no buffers"`）。
    ///   内核没有针对缓冲块的等待队列，这属于容量规划错误而不是可重试的情况。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let mut ctrl = self.ctrl.lock();

        // 是否已缓存
        if let Some(index) = ctrl.find_cached(dev, blockno) {
            drop(ctrl);
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return self.lock_buf(index, dev, blockno);
        }

        // 未缓存
        // 回收最近最少使用（LRU）的未使用缓冲区
        match ctrl.recycle(dev, blockno) {
            Some(index) => {
                let inner = &self.bufs[index];
                if cfg!(feature = "kernel_warning") && inner.flags().contains(BufFlags::DIRTY) {
                    println!(
                        "bcache: buffer {} recycled for ({}, {}) with unwritten changes",
                        index, dev, blockno
                    );
                }
                inner.clear_flags(BufFlags::all());
                drop(ctrl);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.lock_buf(index, dev, blockno)
            }
            None => panic!("bget: no buffers"),
        }
    }

    /// 获取缓冲块的睡眠锁，此时调用者已经拥有该块的一个引用。
    fn lock_buf(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_, D> {
        Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
            _task: PhantomData,
        }
    }

    /// 从缓冲区缓存中读取指定设备与块号对应的数据。
    ///
    /// # 功能说明
    /// 对外提供的读取接口，用于从缓存中获取给定 `(dev, blockno)` 对应的缓冲块。
    /// 若缓冲块未被标记为有效（即未曾从磁盘加载），则会自动触发一次从磁盘读取操作。
    ///
    /// # 流程解释
    /// - 调用 `bget` 获取目标块的缓冲结构，返回时已持有其睡眠锁；
    /// - 若 `VALID` 标志未设置，调用底层块设备执行一次读取，完成后设置 `VALID`；
    /// - 返回已准备就绪的缓冲块 `Buf` 对象。
    ///
    /// 多个任务同时读取同一个未缓存的块时，只有最先拿到睡眠锁的任务会访问磁盘，
    /// 其他任务在睡眠锁上等待，醒来后看到的已经是有效数据。
    ///
    /// # 返回值
    /// - 返回包含指定块数据的 `Buf`，内部持有睡眠锁，丢弃时自动释放。
    ///
    /// # 可能的错误
    /// - 若 `bget` 无法获取可用缓冲块，将触发 panic；
    /// - 底层设备的读错误由驱动自行处理（视为致命错误）。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let mut b = self.bget(dev, blockno);
        let inner = &self.bufs[b.index];
        if !inner.flags().contains(BufFlags::VALID) {
            if cfg!(feature = "trace_bio") {
                println!("bcache: read ({}, {}) from disk", dev, blockno);
            }
            self.disk.rw(dev, blockno, b.data_raw(), false);
            inner.set_flags(BufFlags::VALID);
            self.counters.disk_reads.fetch_add(1, Ordering::Relaxed);
        } else if cfg!(feature = "trace_bio") {
            println!("bcache: ({}, {}) served from buffer {}", dev, blockno, b.index);
        }
        b
    }

    /// 释放一个 `BufPin` 所持有的引用。
    ///
    /// 只获取元信息自旋锁，不需要缓冲块的睡眠锁，也不改变其在 LRU 链表中的位置。
    /// 引用计数归零后，该块重新成为可回收的候选。
    ///
    /// `pin` 必须由本缓存发出，否则 panic：交给别的缓存会减掉一个仍被持有的引用。
    pub fn unpin(&self, pin: BufPin<'_, D>) {
        if !ptr::eq(pin.cache, self) {
            panic!("bunpin: buffer of another cache");
        }
        let mut ctrl = self.ctrl.lock();
        debug_assert_eq!(ctrl.inner[pin.index].block, Some((pin.dev, pin.blockno)));
        ctrl.unpin(pin.index);
    }

    /// 释放缓冲块的引用（由 `Buf` 的 `Drop` 调用，此时睡眠锁已释放）
    fn brelse(&self, index: usize) {
        self.ctrl.lock().move_if_no_ref(index);
    }
}

/// 缓冲块句柄，表示一个已分配给 `(dev, blockno)` 并被当前任务锁定的缓冲块。
///
/// `Buf` 持有该缓冲块数据的睡眠锁，因此可以自由读写数据；
/// 生命周期结束时先释放睡眠锁，再在自旋锁下归还引用计数并更新 LRU 位置。
///
/// 睡眠锁属于获取它的任务，所以 `Buf` 不能被发送到其他线程。
pub struct Buf<'a, D: BlockDevice> {
    /// 所属的块缓存
    cache: &'a Bcache<D>,

    /// 缓冲块在 `bufs` 与 `BufLru::inner` 中的索引
    index: usize,

    dev: u32,
    blockno: u32,

    /// 缓冲数据的睡眠锁守卫，只在 `Drop` 中取出并释放
    data: Option<SleepLockGuard<'a, BufData>>,

    _task: PhantomData<*const ()>,
}

impl<'a, D: BlockDevice> Buf<'a, D> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// 缓冲块数据（只读）
    pub fn data(&self) -> &BufData {
        self.guard()
    }

    /// 缓冲块数据（可写），同时把该块标记为脏。
    pub fn data_mut(&mut self) -> &mut BufData {
        self.cache.bufs[self.index].set_flags(BufFlags::DIRTY);
        self.data_raw()
    }

    /// 自上次写回（或读入）以来是否被修改过
    pub fn is_dirty(&self) -> bool {
        self.cache.bufs[self.index].flags().contains(BufFlags::DIRTY)
    }

    /// 将缓冲块内容写回磁盘。
    ///
    /// 调用者必须持有该缓冲块的睡眠锁，否则 panic。不释放缓冲块，也不改变引用计数。
    pub fn bwrite(&mut self) {
        if !self.guard().holding() {
            panic!("bwrite");
        }
        let (cache, dev, blockno) = (self.cache, self.dev, self.blockno);
        cache.disk.rw(dev, blockno, self.data_raw(), true);
        cache.bufs[self.index].clear_flags(BufFlags::DIRTY);
        cache.counters.disk_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// 将当前缓冲块的引用计数加一，“钉住”该块，防止其被回收。
    ///
    /// # 功能说明
    /// 返回的 [`BufPin`] 代表这一份额外的引用：即使 `Buf` 被释放，
    /// 该块仍然驻留在缓存中，直到把 `BufPin` 交还给 [`Bcache::unpin`]。
    /// 日志层用它把已记录但尚未安装的块留在内存里。
    pub fn pin(&self) -> BufPin<'a, D> {
        self.cache.ctrl.lock().pin(self.index);
        BufPin {
            cache: self.cache,
            index: self.index,
            dev: self.dev,
            blockno: self.blockno,
        }
    }

    /// 显式释放缓冲块，等价于丢弃 `Buf`。
    pub fn brelse(self) {
        drop(self)
    }

    /// 睡眠锁守卫只在 `Drop` 中被取走
    fn guard(&self) -> &SleepLockGuard<'a, BufData> {
        match self.data {
            Some(ref guard) => guard,
            None => panic!("buf: used after release"),
        }
    }

    /// 磁盘传输使用的数据引用，不影响脏标志
    fn data_raw(&mut self) -> &mut BufData {
        match self.data {
            Some(ref mut guard) => guard,
            None => panic!("buf: used after release"),
        }
    }
}

impl<'a, D: BlockDevice> Drop for Buf<'a, D> {
    fn drop(&mut self) {
        if !self.guard().holding() {
            panic!("brelse");
        }
        // 先放开睡眠锁，再去获取自旋锁
        drop(self.data.take());
        self.cache.brelse(self.index);
    }
}

/// 一份“钉住”缓冲块的引用，由 [`Buf::pin`] 创建，交给 [`Bcache::unpin`] 归还。
///
/// 它借用发出它的缓存，不会比缓存活得更久，也只能交还给该缓存。
#[must_use = "a pinned buffer stays resident until it is unpinned"]
pub struct BufPin<'a, D: BlockDevice> {
    cache: &'a Bcache<D>,
    index: usize,
    dev: u32,
    blockno: u32,
}

impl<'a, D: BlockDevice> BufPin<'a, D> {
    /// 归还给发出它的缓存，等价于 `Bcache::unpin`
    pub fn unpin(self) {
        let cache = self.cache;
        cache.unpin(self)
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }
}

impl<D: BlockDevice> fmt::Debug for BufPin<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufPin")
            .field("index", &self.index)
            .field("dev", &self.dev)
            .field("blockno", &self.blockno)
            .finish()
    }
}

/// 块缓存的统计信息
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// `bget` 找到已缓存块的次数
    pub hits: usize,
    /// `bget` 回收缓冲块的次数
    pub misses: usize,
    /// 从磁盘读入的次数
    pub disk_reads: usize,
    /// 写回磁盘的次数
    pub disk_writes: usize,
}

struct Counters {
    hits: AtomicUsize,
    misses: AtomicUsize,
    disk_reads: AtomicUsize,
    disk_writes: AtomicUsize,
}

impl Counters {
    const fn new() -> Self {
        Self {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            disk_reads: AtomicUsize::new(0),
            disk_writes: AtomicUsize::new(0),
        }
    }

    fn snapshot(&self) -> Stats {
        Stats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            disk_reads: self.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.disk_writes.load(Ordering::Relaxed),
        }
    }
}

/// 哨兵节点在 `BufLru::inner` 中的索引
const HEAD: usize = NBUF;

/// 缓冲区缓存的 LRU（最近最少使用）链表控制结构。
///
/// `BufLru` 用于管理所有缓冲块的元信息，并通过带哨兵的双向链表实现 LRU 替换策略。
/// 链表用数组下标而不是指针相连：`inner[HEAD]` 是哨兵，
/// `inner[HEAD].next` 是最近使用的块，`inner[HEAD].prev` 是最久未使用的块。
/// 链表中始终恰好有 `NBUF` 个缓冲块，只有它们的位置会改变。
///
/// 该结构由 `Bcache::ctrl` 自旋锁保护。
struct BufLru {
    inner: [BufCtrl; NBUF + 1],
}

impl BufLru {
    /// 创建链表并依次把每个缓冲块插到头部，缓冲块 0 最终位于尾部。
    fn new() -> Self {
        let mut lru = Self {
            inner: array![_ => BufCtrl::new(); NBUF + 1],
        };
        lru.inner[HEAD].prev = HEAD;
        lru.inner[HEAD].next = HEAD;
        for index in 0..NBUF {
            lru.push_front(index);
        }
        lru
    }

    /// 从最近使用端开始查找绑定到 `(dev, blockno)` 的缓冲块。
    fn lookup(&self, dev: u32, blockno: u32) -> Option<usize> {
        let mut b = self.inner[HEAD].next;
        while b != HEAD {
            if self.inner[b].block == Some((dev, blockno)) {
                return Some(b);
            }
            b = self.inner[b].next;
        }
        None
    }

    /// 查找是否缓存中已存在指定设备和块号的缓冲块，命中则引用计数加一。
    fn find_cached(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let index = self.lookup(dev, blockno)?;
        self.inner[index].refcnt += 1;
        Some(index)
    }

    /// 从 LRU 链表尾部回收一个未被使用（引用计数为 0）的缓冲块。
    ///
    /// # 功能说明
    /// 在缓存未命中时，从缓存池中寻找一个可用的空闲缓冲块进行复用。
    /// 搜索方向从 LRU 链表的尾部开始，即优先替换“最久未使用”的缓存项，
    /// 遇到的第一个空闲块即被选中。
    /// 选中的块被重新绑定到 `(dev, blockno)`，引用计数置为 1。
    ///
    /// # 返回值
    /// - `Some(index)`：被回收的缓冲块索引；
    /// - `None`：所有缓冲块都在被引用。
    fn recycle(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let mut b = self.inner[HEAD].prev;
        while b != HEAD {
            let ctrl = &mut self.inner[b];
            if ctrl.refcnt == 0 {
                ctrl.block = Some((dev, blockno));
                ctrl.refcnt = 1;
                return Some(b);
            }
            b = ctrl.prev;
        }
        None
    }

    /// 引用计数减一，若不再被引用，则将其移至 LRU 链表头部。
    ///
    /// # 功能说明
    /// 刚释放的块很可能马上被再次使用，因此它成为回收扫描中最后才会被考虑的候选。
    /// 若引用计数仍大于零（还有其他持有者或被钉住），位置保持不变。
    ///
    /// # 可能的错误
    /// - 引用计数已为 0 时调用属于协议错误，触发 panic。
    fn move_if_no_ref(&mut self, index: usize) {
        let b = &mut self.inner[index];
        if b.refcnt == 0 {
            panic!("brelse: refcnt underflow");
        }
        b.refcnt -= 1;
        if b.refcnt == 0 {
            self.unlink(index);
            self.push_front(index);
        }
    }

    fn pin(&mut self, index: usize) {
        self.inner[index].refcnt += 1;
    }

    fn unpin(&mut self, index: usize) {
        let b = &mut self.inner[index];
        if b.refcnt == 0 {
            panic!("bunpin: refcnt underflow");
        }
        b.refcnt -= 1;
    }

    /// 分离 `index`
    fn unlink(&mut self, index: usize) {
        let (prev, next) = (self.inner[index].prev, self.inner[index].next);
        self.inner[prev].next = next;
        self.inner[next].prev = prev;
    }

    /// 把 `index` 附加到哨兵之后（最近使用端）
    fn push_front(&mut self, index: usize) {
        let first = self.inner[HEAD].next;
        self.inner[index].prev = HEAD;
        self.inner[index].next = first;
        self.inner[first].prev = index;
        self.inner[HEAD].next = index;
    }
}

/// 缓冲块控制结构，记录缓冲块的元信息并构建 LRU 链表。
///
/// `BufCtrl` 并不包含具体的块数据，其字段全部由 `Bcache::ctrl` 保护。
struct BufCtrl {
    /// 绑定的 `(dev, blockno)`；`None` 表示尚未绑定任何磁盘块。
    block: Option<(u32, u32)>,

    /// 当前持有该块的引用数（包括 `BufPin`）。
    ///
    /// 为 0 时可被 `recycle` 回收；大于 0 时绑定关系不会改变。
    refcnt: usize,

    /// 前驱节点下标
    prev: usize,

    /// 后继节点下标
    next: usize,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            block: None,
            refcnt: 0,
            prev: HEAD,
            next: HEAD,
        }
    }
}

bitflags! {
    /// 缓冲块状态位，沿用 xv6 的 `B_VALID` / `B_DIRTY` 取值。
    pub struct BufFlags: u8 {
        /// 数据已从磁盘读入
        const VALID = 0x2;
        /// 数据被修改且尚未写回
        const DIRTY = 0x4;
    }
}

/// 缓冲块的数据部分，包含实际的磁盘块内容及其状态标志。
///
/// 数据访问通过 `SleepLock` 保护。`flags` 在回收时由持有 `ctrl` 自旋锁的一方清零
/// （此时没有任何引用者），其余时间只由持有睡眠锁的一方修改。
struct BufInner {
    flags: AtomicU8,
    data: SleepLock<BufData>,
}

impl BufInner {
    fn new() -> Self {
        Self {
            flags: AtomicU8::new(0),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }

    fn flags(&self) -> BufFlags {
        BufFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flags(&self, flags: BufFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn clear_flags(&self, flags: BufFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[derive(Clone)]
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Default for BufData {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for BufData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}
