//! `log` backend that prints to COM1.
//!
//! Records look like `[INFO paging] Paging enabled, ...`: the level, then the last segment
//! of the emitting module's path.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

pub static LOGGER: SerialLogger = SerialLogger::new();

/// Keeps records from interleaving on the port.
pub struct SerialLogger {
    lock: Mutex<()>,
}

impl SerialLogger {
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }
}

impl Default for SerialLogger {
    fn default() -> Self {
        Self::new()
    }
}

/// `kestrel::memory::paging` becomes `paging`.
fn short_target(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // the timer handler logs too, so the lock is never held with interrupts on
        crate::cpu::without_interrupts(|| {
            let _guard = self.lock.lock();
            crate::serial_println!(
                "[{} {}] {}",
                record.level(),
                short_target(record.target()),
                record.args()
            );
        });
    }

    fn flush(&self) {}
}

/// Installs `LOGGER`. Debug builds log at Debug, release builds at Info.
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    let level = if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    log::set_max_level(level);
    Ok(())
}
