//! xv6 块缓存
//!
//! 固定数量的缓冲块缓存磁盘块内容，对同一磁盘块的并发访问去重，
//! 并限制同时进行的磁盘 I/O。元信息由自旋锁保护，每个缓冲块的数据由睡眠锁保护。

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;

extern crate alloc;

#[macro_use]
pub mod printf;

pub mod consts;
pub mod driver;
pub mod fs;
pub mod process;
pub mod sleeplock;
pub mod spinlock;
