//! Logging to the kernel ring buffer.
//!
//! The initramfs has no journal and no syslog, so every message goes to
//! `/dev/kmsg` where it survives into the booted system (`dmesg | grep
//! booster`). Each record is prefixed with the program name and carries a
//! kmsg priority so the kernel applies its usual console filtering.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::{Level, LevelFilter, Log, Metadata, Record};

const KMSG_PATH: &str = "/dev/kmsg";

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

struct KmsgLogger {
    kmsg: Mutex<File>,
}

impl KmsgLogger {
    fn priority(level: Level) -> u8 {
        match level {
            Level::Error => 3,
            Level::Warn => 4,
            Level::Info => 6,
            Level::Debug | Level::Trace => 7,
        }
    }
}

impl Log for KmsgLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info || DEBUG_ENABLED.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "<{}>booster: {}\n",
            Self::priority(record.level()),
            record.args()
        );
        if let Ok(mut kmsg) = self.kmsg.lock() {
            // A full printk buffer returns an error we can do nothing about.
            let _ = kmsg.write_all(line.as_bytes());
        }
    }

    fn flush(&self) {}
}

/// Install the kmsg sink as the process logger. `/dev/kmsg` must exist, i.e.
/// devtmpfs has to be mounted first.
pub fn init() -> Result<()> {
    let kmsg = OpenOptions::new()
        .write(true)
        .open(KMSG_PATH)
        .with_context(|| format!("unable to open {}", KMSG_PATH))?;

    log::set_boxed_logger(Box::new(KmsgLogger {
        kmsg: Mutex::new(kmsg),
    }))
    .context("logger already installed")?;
    log::set_max_level(LevelFilter::Debug);
    Ok(())
}

/// Turn on debug records. Called once `booster.debug` is seen on the kernel
/// command line.
pub fn enable_debug() {
    DEBUG_ENABLED.store(true, Ordering::Relaxed);
}

pub fn debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Lift the kernel rate limit on /dev/kmsg writers. Debug logging emits
/// enough lines to trip it otherwise.
pub fn disable_kmsg_throttling() -> Result<()> {
    const SYS_KMSG_FILE: &str = "/proc/sys/kernel/printk_devkmsg";

    std::fs::write(SYS_KMSG_FILE, b"on\n")
        .with_context(|| format!("unable to write {}", SYS_KMSG_FILE))
}
