//! Filesystem mounts: the pseudo filesystems the runtime itself needs, the
//! root filesystem, and the final switch-root handoff.

use std::ffi::CString;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};
use nix::mount::{mount, MsFlags};
use nix::unistd::{chdir, chroot, execv};

use crate::cmdline::MountOptions;

pub const NEW_ROOT: &str = "/new_root";

fn mount_fs(
    source: &str,
    target: &str,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    std::fs::create_dir_all(target)
        .with_context(|| format!("unable to create {}", target))?;
    mount(Some(source), target, Some(fstype), flags, data)
        .with_context(|| format!("unable to mount {}", target))
}

/// Mount devtmpfs. Everything else, including the kmsg logger, depends on
/// /dev being there, so this runs first and a failure is fatal.
pub fn mount_dev() -> Result<()> {
    mount_fs(
        "dev",
        "/dev",
        "devtmpfs",
        MsFlags::MS_NOSUID,
        Some("mode=0755"),
    )
}

/// Mount the remaining pseudo filesystems.
pub fn mount_pseudo_filesystems() -> Result<()> {
    mount_fs(
        "sys",
        "/sys",
        "sysfs",
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        None,
    )?;
    debug!("mounted /sys");
    mount_fs(
        "proc",
        "/proc",
        "proc",
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        None,
    )?;
    debug!("mounted /proc");
    mount_fs(
        "run",
        "/run",
        "tmpfs",
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_STRICTATIME,
        Some("mode=755"),
    )?;
    debug!("mounted /run");
    Ok(())
}

/// Mount the root filesystem at [`NEW_ROOT`].
pub fn mount_root(dev: &Path, fstype: &str, opts: &MountOptions) -> Result<()> {
    std::fs::create_dir_all(NEW_ROOT)
        .with_context(|| format!("unable to create {}", NEW_ROOT))?;

    let data = opts.data_string();
    info!(
        "mounting {}->{}, fs={}, flags={:?}, options={}",
        dev.display(),
        NEW_ROOT,
        fstype,
        opts.flags,
        data
    );
    mount(
        Some(dev),
        NEW_ROOT,
        Some(fstype),
        opts.flags,
        if data.is_empty() {
            None
        } else {
            Some(data.as_str())
        },
    )
    .with_context(|| format!("unable to mount root filesystem from {}", dev.display()))
}

/// Move the pseudo filesystems into the new root, make it `/` and exec the
/// real init. Only returns on error.
pub fn switch_root(init: &Path) -> Result<std::convert::Infallible> {
    for dir in ["/dev", "/proc", "/sys", "/run"] {
        let target = format!("{}{}", NEW_ROOT, dir);
        if !Path::new(&target).exists() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("unable to create {}", target))?;
        }
        mount(
            Some(dir),
            target.as_str(),
            None::<&str>,
            MsFlags::MS_MOVE,
            None::<&str>,
        )
        .with_context(|| format!("unable to move {} to {}", dir, target))?;
    }

    chdir(NEW_ROOT).context("unable to chdir to the new root")?;
    mount(
        Some("."),
        "/",
        None::<&str>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )
    .context("unable to move the new root to /")?;
    chroot(".").context("unable to chroot to the new root")?;
    chdir("/").context("unable to chdir to /")?;

    let init_c = CString::new(init.to_string_lossy().as_bytes())
        .context("init path contains a NUL byte")?;

    info!("Switching to the new userspace now");
    let err = execv(&init_c, &[init_c.as_c_str()])
        .with_context(|| format!("unable to execute init at {}", init.display()))
        .unwrap_err();
    Err(err)
}
