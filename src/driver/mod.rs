//! 设备驱动模块，包含块设备接口与内存盘驱动

use crate::fs::BufData;

pub mod ramdisk;

/// 块设备：缓存层唯一依赖的磁盘传输操作。
///
/// # 功能说明
/// 同步地读出或写入 `(dev, blockno)` 对应的整块数据：
/// - `writing == false`：把磁盘内容读入 `data`；
/// - `writing == true`：把 `data` 写回磁盘。
///
/// 调用期间调用者持有该缓冲块的睡眠锁，因此实现可以睡眠。
/// 接口不返回错误：设备故障在内核中视为致命错误，由驱动自行 panic。
pub trait BlockDevice: Sync {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool);
}

impl<T: BlockDevice + ?Sized> BlockDevice for &T {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) {
        (**self).rw(dev, blockno, data, writing)
    }
}
