//! 定义系统内核的输出方法

use core::fmt;

use spin::Once;

use crate::spinlock::SpinLock;

/// 字符输出设备，例如 UART 控制台。
pub trait Console: Sync {
    /// 输出单个字节
    fn putc(&self, c: u8);
}

static CONSOLE: Once<&'static dyn Console> = Once::new();

/// 注册控制台，只有第一次调用生效。未注册时所有输出被丢弃。
pub fn set_console(console: &'static dyn Console) {
    CONSOLE.call_once(|| console);
}

/// 把格式化输出转发给控制台的适配器
struct Print(&'static dyn Console);

impl fmt::Write for Print {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.0.putc(byte);
        }
        Ok(())
    }
}

/// 核心打印函数（被宏调用）
///
/// 使用自旋锁保证多个任务的输出按行不交错。
#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    static PRINT: SpinLock<()> = SpinLock::new((), "print");

    let console = match CONSOLE.get() {
        Some(console) => *console,
        None => return,
    };
    let guard = PRINT.lock();
    let _ = Print(console).write_fmt(args);
    drop(guard);
}

/// 在终端输出一串字符
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printf::_print(format_args!($($arg)*));
    };
}

/// 在终端输出一行字符
#[macro_export]
macro_rules! println {
    () => {$crate::print!("\n")};
    ($fmt:expr) => {$crate::print!(concat!($fmt, "\n"))};
    ($fmt:expr, $($arg:tt)*) => {
        $crate::print!(concat!($fmt, "\n"), $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::hosted;

    #[test]
    fn println_from_many_tasks() {
        hosted::init();
        std::thread::scope(|s| {
            for t in 0..3 {
                s.spawn(move || {
                    for i in 0..5 {
                        crate::println!("printf: task {} line {}", t, i);
                    }
                });
            }
        });
    }
}
