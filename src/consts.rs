//! 内核常量

/// 文件系统 / 块层相关常量
pub mod fs {
    /// 磁盘块大小（字节）
    pub const BSIZE: usize = 1024;

    /// 单个文件系统操作最多写入的块数
    pub const MAXOPBLOCKS: usize = 10;

    /// 块缓存中的缓冲块数量
    pub const NBUF: usize = MAXOPBLOCKS * 3;

    /// 根文件系统所在的设备号
    pub const ROOTDEV: u32 = 1;
}
