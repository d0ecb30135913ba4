//! 文件系统模块
//!
//! 目前只包含块缓存层；inode、日志等上层通过 [`Bcache`] 访问磁盘块。

mod bio;

pub use bio::{Bcache, Buf, BufData, BufFlags, BufPin, Stats};
