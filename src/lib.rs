//! booster initramfs runtime.
//!
//! The binary runs as PID 1 inside the initramfs. It discovers block
//! devices from kernel uevents, loads the modules they need, unlocks
//! encrypted volumes (interactively or through clevis tang/tpm2 bindings),
//! assembles LVM, mounts the root filesystem and execs the real init.

pub mod blkinfo;
pub mod clevis;
pub mod cmdline;
pub mod config;
pub mod console;
pub mod devmapper;
pub mod init;
pub mod kmsg;
pub mod luks;
pub mod lvm;
pub mod module;
pub mod mount;
pub mod net;
pub mod types;
pub mod uevent;

use anyhow::{bail, Result};

/// Entry point for the init binary. Never returns on success: the process
/// image is replaced by the real init.
pub async fn run() -> Result<()> {
    if std::process::id() != 1 {
        bail!("not running as PID 1; booster only works as an initramfs init");
    }
    init::boot().await
}
