//! Device-mapper client.
//!
//! Thin layer over the dm ioctl interface on `/dev/mapper/control` used to
//! activate dm-crypt mappings for unlocked LUKS volumes and linear mappings
//! for LVM logical volumes. There is no udev in the initramfs, so the
//! `/dev/mapper/<name>` nodes are created here as well.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use devicemapper::{DevId, DmFlags, DmName, DmOptions, DmUuid, DM};
use lazy_static::lazy_static;
use log::{debug, warn};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};

lazy_static! {
    // mappings created this boot; torn down if the boot aborts instead of
    // handing them to the new root
    static ref ACTIVE: std::sync::Mutex<Vec<String>> = std::sync::Mutex::new(Vec::new());
}

/// A single target line of a dm table: start sector, length in sectors,
/// target type, target parameters.
pub type TableLine = (u64, u64, String, String);

/// Create, load and resume a dm device. Returns the `/dev/mapper/<name>`
/// node. A name collision is a hard error: it means two volumes raced for
/// the same mapping and continuing would hand I/O to the wrong one.
pub fn activate(name: &str, dm_uuid: Option<&str>, table: &[TableLine]) -> Result<PathBuf> {
    let dm = DM::new().context("unable to talk to the device-mapper driver")?;
    let dm_name =
        DmName::new(name).with_context(|| format!("{} is not a valid dm name", name))?;
    let uuid = match dm_uuid {
        Some(u) => {
            Some(DmUuid::new(u).with_context(|| format!("{} is not a valid dm uuid", u))?)
        }
        None => None,
    };

    dm.device_create(dm_name, uuid, DmOptions::default())
        .with_context(|| format!("unable to create dm device {}", name))?;

    let dm_id = DevId::Name(dm_name);
    let result = dm
        .table_load(
            &dm_id,
            table,
            DmOptions::default().set_flags(DmFlags::DM_PERSISTENT_DEV),
        )
        .with_context(|| format!("unable to load dm table for {}", name))
        .and_then(|_| {
            dm.device_suspend(&dm_id, DmOptions::default())
                .with_context(|| format!("unable to resume dm device {}", name))
        });

    if let Err(e) = result {
        // do not leave a half-constructed mapping behind
        let _ = dm.device_remove(&dm_id, DmOptions::default());
        return Err(e);
    }

    let node = create_mapper_node(name)?;
    debug!("dm device {} is active at {}", name, node.display());
    if let Ok(mut active) = ACTIVE.lock() {
        active.push(name.to_string());
    }
    Ok(node)
}

/// Remove every mapping this boot created. Called on the fatal-error path
/// so plaintext mappings never outlive a failed boot.
pub fn teardown_all() {
    let names: Vec<String> = match ACTIVE.lock() {
        Ok(mut active) => active.drain(..).collect(),
        Err(_) => return,
    };
    for name in names.iter().rev() {
        if let Err(e) = remove(name) {
            warn!("unable to tear down dm device {}: {:#}", name, e);
        }
    }
}

pub fn remove(name: &str) -> Result<()> {
    let dm = DM::new().context("unable to talk to the device-mapper driver")?;
    let dm_name =
        DmName::new(name).with_context(|| format!("{} is not a valid dm name", name))?;
    dm.device_remove(&DevId::Name(dm_name), DmOptions::default())
        .with_context(|| format!("unable to remove dm device {}", name))?;
    let _ = std::fs::remove_file(Path::new("/dev/mapper").join(name));
    Ok(())
}

/// Parameter string for a `crypt` target.
pub fn crypt_target_params(
    cipher: &str,
    key_hex: &str,
    device: &Path,
    offset_sectors: u64,
    flags: &[String],
    sector_size: Option<u32>,
) -> String {
    let mut opt_params: Vec<String> = flags.to_vec();
    if let Some(ss) = sector_size {
        if ss != 512 {
            opt_params.push(format!("sector_size:{}", ss));
        }
    }

    let mut params = format!(
        "{} {} 0 {} {}",
        cipher,
        key_hex,
        device.display(),
        offset_sectors
    );
    if !opt_params.is_empty() {
        params.push_str(&format!(" {} {}", opt_params.len(), opt_params.join(" ")));
    }
    params
}

/// Map `rd.luks.options=` words to dm-crypt optional parameters.
pub fn crypt_flags_from_options(options: &[String]) -> Vec<String> {
    let mut flags = Vec::new();
    for opt in options {
        match opt.as_str() {
            "discard" => flags.push("allow_discards".to_string()),
            "no-read-workqueue" => flags.push("no_read_workqueue".to_string()),
            "no-write-workqueue" => flags.push("no_write_workqueue".to_string()),
            "same-cpu-crypt" => flags.push("same_cpu_crypt".to_string()),
            other => debug!("ignoring unknown luks option {:?}", other),
        }
    }
    flags
}

/// devtmpfs names dm devices `dm-N`; resolve N for a mapping and create the
/// `/dev/mapper/<name>` node udev would normally provide.
fn create_mapper_node(name: &str) -> Result<PathBuf> {
    let (major, minor) = wait_dm_numbers(name)?;

    std::fs::create_dir_all("/dev/mapper").context("unable to create /dev/mapper")?;
    let node = Path::new("/dev/mapper").join(name);
    match mknod(
        &node,
        SFlag::S_IFBLK,
        Mode::from_bits_truncate(0o600),
        makedev(major, minor),
    ) {
        Ok(()) => {}
        Err(nix::errno::Errno::EEXIST) => {}
        Err(e) => {
            return Err(anyhow!(e))
                .with_context(|| format!("unable to create {}", node.display()))
        }
    }
    Ok(node)
}

fn wait_dm_numbers(name: &str) -> Result<(u64, u64)> {
    // sysfs entries appear as part of device creation; a couple of retries
    // paper over the tiny window where the directory is still being set up
    for _ in 0..50 {
        if let Some(numbers) = find_dm_numbers(name)? {
            return Ok(numbers);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    bail!("dm device {} did not show up in sysfs", name)
}

fn find_dm_numbers(name: &str) -> Result<Option<(u64, u64)>> {
    let entries = match std::fs::read_dir("/sys/class/block") {
        Ok(e) => e,
        Err(_) => return Ok(None),
    };
    for entry in entries.flatten() {
        let entry_name = entry.file_name();
        let entry_name = entry_name.to_string_lossy();
        if !entry_name.starts_with("dm-") {
            continue;
        }
        let dm_name_path = entry.path().join("dm/name");
        let Ok(dm_name) = std::fs::read_to_string(&dm_name_path) else {
            continue;
        };
        if dm_name.trim_end() != name {
            continue;
        }
        let dev = std::fs::read_to_string(entry.path().join("dev"))
            .with_context(|| format!("unable to read dev numbers for {}", entry_name))?;
        let (major, minor) = dev
            .trim_end()
            .split_once(':')
            .with_context(|| format!("malformed dev numbers {:?}", dev))?;
        return Ok(Some((major.parse()?, minor.parse()?)));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypt_target_params() {
        let params = crypt_target_params(
            "aes-xts-plain64",
            "00ff",
            Path::new("/dev/sda"),
            4096,
            &[],
            None,
        );
        assert_eq!(params, "aes-xts-plain64 00ff 0 /dev/sda 4096");
    }

    #[test]
    fn test_crypt_target_params_with_flags() {
        let flags = crypt_flags_from_options(&[
            "discard".to_string(),
            "no-read-workqueue".to_string(),
            "bogus".to_string(),
        ]);
        assert_eq!(flags, vec!["allow_discards", "no_read_workqueue"]);

        let params = crypt_target_params(
            "aes-xts-plain64",
            "00ff",
            Path::new("/dev/sda"),
            4096,
            &flags,
            Some(4096),
        );
        assert_eq!(
            params,
            "aes-xts-plain64 00ff 0 /dev/sda 4096 3 allow_discards no_read_workqueue sector_size:4096"
        );
    }

    #[test]
    fn test_sector_size_512_is_default() {
        let params = crypt_target_params(
            "aes-xts-plain64",
            "00ff",
            Path::new("/dev/sda"),
            0,
            &[],
            Some(512),
        );
        assert_eq!(params, "aes-xts-plain64 00ff 0 /dev/sda 0");
    }
}
