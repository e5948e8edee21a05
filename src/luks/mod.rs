//! LUKS volume unlocking.
//!
//! The strategy per volume: try every clevis-bound key slot first (they
//! unlock unattended), then fall back to prompting on the console. A
//! recovered master key is handed to dm-crypt and dropped; it is zeroed on
//! every exit path.

pub mod af;
mod cipher;
pub mod luks1;
pub mod luks2;

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use crate::clevis::{self, jwe::Jwe};
use crate::console;
use crate::devmapper;
use crate::types::{MasterKey, Passphrase};

const INTERACTIVE_ATTEMPTS: u32 = 3;

nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Fully parsed on-disk state of a LUKS volume.
pub enum LuksDevice {
    V1 {
        header: luks1::Luks1Header,
        /// (slot, compact JWE) pairs from luksmeta
        clevis_slots: Vec<(usize, String)>,
    },
    V2 {
        header: luks2::Luks2Header,
    },
}

impl LuksDevice {
    /// Read and parse the headers. Blocking.
    pub fn read(path: &Path) -> Result<Self> {
        let mut dev =
            File::open(path).with_context(|| format!("unable to open {}", path.display()))?;

        let mut magic = [0u8; 8];
        use std::io::Read as _;
        dev.read_exact(&mut magic)
            .with_context(|| format!("unable to read {}", path.display()))?;
        let version = u16::from_be_bytes(magic[6..8].try_into().unwrap());

        match version {
            1 => {
                let mut raw = vec![0u8; luks1::HEADER_SIZE];
                use std::io::{Seek, SeekFrom};
                dev.seek(SeekFrom::Start(0))?;
                dev.read_exact(&mut raw)
                    .context("unable to read luks1 header")?;
                let header = luks1::Luks1Header::parse(&raw)?;
                let clevis_slots = header.clevis_tokens(&mut dev).unwrap_or_else(|e| {
                    debug!("luksmeta scan failed: {:#}", e);
                    Vec::new()
                });
                Ok(LuksDevice::V1 {
                    header,
                    clevis_slots,
                })
            }
            2 => Ok(LuksDevice::V2 {
                header: luks2::read_header(&mut dev)?,
            }),
            v => bail!("unsupported luks version {}", v),
        }
    }

    pub fn uuid(&self) -> &str {
        match self {
            LuksDevice::V1 { header, .. } => &header.uuid,
            LuksDevice::V2 { header } => &header.uuid,
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            LuksDevice::V1 { .. } => 1,
            LuksDevice::V2 { .. } => 2,
        }
    }

    /// Clevis-bound slots in ascending slot order, as parsed JWEs.
    fn clevis_jwes(&self) -> Vec<(usize, Jwe)> {
        match self {
            LuksDevice::V1 { clevis_slots, .. } => clevis_slots
                .iter()
                .filter_map(|(slot, compact)| match Jwe::parse_compact(compact) {
                    Ok(jwe) => Some((*slot, jwe)),
                    Err(e) => {
                        warn!("ignoring malformed clevis blob in slot {}: {:#}", slot, e);
                        None
                    }
                })
                .collect(),
            LuksDevice::V2 { header } => header
                .metadata
                .clevis_tokens()
                .iter()
                .filter_map(|(slot, value)| match Jwe::parse_json(value) {
                    Ok(jwe) => Some((*slot, jwe)),
                    Err(e) => {
                        warn!("ignoring malformed clevis token for slot {}: {:#}", slot, e);
                        None
                    }
                })
                .collect(),
        }
    }

    /// Try one passphrase against a specific slot. Blocking.
    fn unseal_slot(
        &self,
        path: &Path,
        slot: usize,
        passphrase: &Passphrase,
    ) -> Result<Option<MasterKey>> {
        let mut dev =
            File::open(path).with_context(|| format!("unable to open {}", path.display()))?;
        match self {
            LuksDevice::V1 { header, .. } => header.unseal_slot(&mut dev, slot, passphrase),
            LuksDevice::V2 { header } => {
                header
                    .metadata
                    .unseal_slot(&mut dev, &slot.to_string(), passphrase)
            }
        }
    }

    /// Try one passphrase against every active slot. Blocking.
    fn unseal_any_slot(
        &self,
        path: &Path,
        passphrase: &Passphrase,
    ) -> Result<Option<MasterKey>> {
        let slots: Vec<usize> = match self {
            LuksDevice::V1 { header, .. } => header
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.active)
                .map(|(i, _)| i)
                .collect(),
            LuksDevice::V2 { header } => header
                .metadata
                .ordered_keyslots()
                .iter()
                .map(|(i, _)| *i)
                .collect(),
        };
        for slot in slots {
            if let Some(mk) = self.unseal_slot(path, slot, passphrase)? {
                return Ok(Some(mk));
            }
        }
        Ok(None)
    }

    fn cipher_and_segment(&self) -> Result<(String, u64, Option<u32>)> {
        match self {
            LuksDevice::V1 { header, .. } => {
                Ok((header.cipher_spec(), header.payload_offset as u64, None))
            }
            LuksDevice::V2 { header } => {
                let segment = header.metadata.crypt_segment()?;
                let encryption = segment
                    .encryption
                    .clone()
                    .context("crypt segment has no encryption")?;
                Ok((encryption, segment.offset_sectors()?, segment.sector_size))
            }
        }
    }
}

/// Unlock a LUKS volume and activate it under `name`. Returns the
/// `/dev/mapper/<name>` node of the plaintext device.
pub async fn unlock_and_activate(
    path: PathBuf,
    name: String,
    options: Vec<String>,
) -> Result<PathBuf> {
    let device = {
        let path = path.clone();
        tokio::task::spawn_blocking(move || LuksDevice::read(&path))
            .await
            .context("luks parse task failed")??
    };
    let device = std::sync::Arc::new(device);
    info!(
        "luks{} volume {} at {}",
        device.version(),
        device.uuid(),
        path.display()
    );

    // unattended first: clevis-bound slots in ascending order
    for (slot, jwe) in device.clevis_jwes() {
        match clevis::recover_passphrase(&jwe).await {
            Ok(passphrase) => {
                let unsealed = {
                    let device = std::sync::Arc::clone(&device);
                    let path = path.clone();
                    tokio::task::spawn_blocking(move || {
                        device.unseal_slot(&path, slot, &passphrase)
                    })
                    .await
                    .context("keyslot task failed")??
                };
                match unsealed {
                    Some(mk) => {
                        debug!("clevis pin opened keyslot {}", slot);
                        return activate(&device, &path, &name, &options, mk).await;
                    }
                    None => warn!(
                        "clevis-recovered passphrase does not open keyslot {}",
                        slot
                    ),
                }
            }
            Err(e) => warn!("clevis recovery for slot {} failed: {:#}", slot, e),
        }
    }

    // interactive fallback
    for _ in 0..INTERACTIVE_ATTEMPTS {
        let prompt = format!("Enter passphrase for {}:", name);
        let passphrase = console::read_passphrase(&prompt).await?;
        let unsealed = {
            let device = std::sync::Arc::clone(&device);
            let path = path.clone();
            tokio::task::spawn_blocking(move || device.unseal_any_slot(&path, &passphrase))
                .await
                .context("keyslot task failed")??
        };
        match unsealed {
            Some(mk) => return activate(&device, &path, &name, &options, mk).await,
            None => warn!("no keyslot of {} opens with this passphrase", name),
        }
    }

    bail!(
        "unable to unlock luks volume {} after {} attempts",
        device.uuid(),
        INTERACTIVE_ATTEMPTS
    )
}

async fn activate(
    device: &LuksDevice,
    path: &Path,
    name: &str,
    options: &[String],
    master_key: MasterKey,
) -> Result<PathBuf> {
    let (cipher_spec, offset_sectors, sector_size) = device.cipher_and_segment()?;
    let flags = devmapper::crypt_flags_from_options(options);
    let dm_uuid = format!(
        "CRYPT-LUKS{}-{}-{}",
        device.version(),
        device.uuid().replace('-', ""),
        name
    );

    let name = name.to_string();
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let total_sectors = device_sectors(&path)?;
        if total_sectors <= offset_sectors {
            bail!(
                "device {} is smaller than its luks payload offset",
                path.display()
            );
        }

        let params = devmapper::crypt_target_params(
            &cipher_spec,
            &master_key.to_hex(),
            &path,
            offset_sectors,
            &flags,
            sector_size,
        );
        drop(master_key);

        let table = vec![(
            0u64,
            total_sectors - offset_sectors,
            "crypt".to_string(),
            params,
        )];
        devmapper::activate(&name, Some(&dm_uuid), &table)
    })
    .await
    .context("dm activation task failed")?
}

fn device_sectors(path: &Path) -> Result<u64> {
    let dev =
        File::open(path).with_context(|| format!("unable to open {}", path.display()))?;
    let mut size: u64 = 0;
    unsafe { blkgetsize64(dev.as_raw_fd(), &mut size) }
        .with_context(|| format!("unable to read size of {}", path.display()))?;
    Ok(size / 512)
}
