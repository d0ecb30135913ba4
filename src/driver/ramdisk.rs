//! 内存盘驱动，用一段内存模拟块设备

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::fs::BufData;
use crate::spinlock::SpinLock;

use super::BlockDevice;

/// 单个设备号上的内存盘。
///
/// 块数在创建时确定；读写计数可用于观察缓存层实际发起的磁盘传输次数。
pub struct RamDisk {
    dev: u32,
    blocks: SpinLock<Vec<BufData>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    /// 创建设备号为 `dev`、共 `nblocks` 个全零块的内存盘
    pub fn new(dev: u32, nblocks: usize) -> Self {
        if cfg!(feature = "verbose_init_info") {
            println!("ramdisk: dev {} with {} blocks", dev, nblocks);
        }
        let blocks = (0..nblocks).map(|_| BufData::new()).collect();
        Self {
            dev,
            blocks: SpinLock::new(blocks, "ramdisk"),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn size(&self) -> usize {
        self.blocks.lock().len()
    }

    /// 已完成的读传输次数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 已完成的写传输次数
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 绕过缓存，直接取出某个块在“磁盘”上的内容
    pub fn block(&self, blockno: u32) -> BufData {
        let blocks = self.blocks.lock();
        match blocks.get(blockno as usize) {
            Some(block) => block.clone(),
            None => panic!("ramdisk: block {} out of range", blockno),
        }
    }
}

impl BlockDevice for RamDisk {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) {
        if dev != self.dev {
            panic!("ramdisk: unknown device {}", dev);
        }
        let mut blocks = self.blocks.lock();
        let block = match blocks.get_mut(blockno as usize) {
            Some(block) => block,
            None => panic!("ramdisk: block {} out of range", blockno),
        };
        if writing {
            block.copy_from_slice(data);
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            data.copy_from_slice(block);
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
        drop(blocks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::fs::BSIZE;
    use crate::process::hosted;

    #[test]
    fn write_then_read_back() {
        hosted::init();
        let disk = RamDisk::new(1, 8);
        assert_eq!((disk.dev(), disk.size()), (1, 8));

        let mut data = BufData::new();
        data[0] = 0xab;
        data[BSIZE - 1] = 0xcd;
        disk.rw(1, 3, &mut data, true);

        let mut out = BufData::new();
        disk.rw(1, 3, &mut out, false);
        assert_eq!(out[0], 0xab);
        assert_eq!(out[BSIZE - 1], 0xcd);
        assert_eq!(disk.block(3)[0], 0xab);
        assert_eq!(disk.block(2)[0], 0);
        assert_eq!((disk.reads(), disk.writes()), (1, 1));
    }

    #[test]
    #[should_panic(expected = "ramdisk: block 8 out of range")]
    fn out_of_range_is_fatal() {
        hosted::init();
        let disk = RamDisk::new(1, 8);
        let mut data = BufData::new();
        disk.rw(1, 8, &mut data, false);
    }

    #[test]
    #[should_panic(expected = "ramdisk: unknown device 2")]
    fn unknown_device_is_fatal() {
        hosted::init();
        let disk = RamDisk::new(1, 8);
        let mut data = BufData::new();
        disk.rw(2, 0, &mut data, false);
    }
}
