//! Kernel logger: `log` facade over the serial console, with a jiffies
//! timestamp on every record.

use log::{Level, LevelFilter, Metadata, Record};

struct CorvusLogger;

impl log::Log for CorvusLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::serial_println!(
                "[{:>8}.{:03}] [{}] {}",
                crate::time::jiffies() / crate::time::SYS_HZ,
                crate::time::jiffies() % crate::time::SYS_HZ,
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

fn max_level() -> Level {
    if cfg!(feature = "debug_verbose") { Level::Debug } else { Level::Info }
}

static LOGGER: CorvusLogger = CorvusLogger;

/// Install the logger. Safe to call once, early in boot.
pub fn init() {
    match log::set_logger(&LOGGER) {
        Ok(()) => {
            log::set_max_level(if cfg!(feature = "debug_verbose") {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            });
            log::info!("logger initialized");
        }
        Err(err) => {
            crate::serial_println!("logger init failed: {}", err);
        }
    }
}
