//! Block device classification.
//!
//! Reads a small window from the start of a device and matches it against
//! known superblock signatures. The probe never writes and treats anything
//! it cannot make sense of as an empty device, so a garbage drive in the
//! system cannot stall the boot.

use std::fmt::{self, Display};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use crate::types::BlkUuid;

/// btrfs keeps its superblock at 64 KiB; one read this large covers every
/// signature we know about.
const PROBE_WINDOW: usize = 0x11000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkFormat {
    Luks1,
    Luks2,
    Ext4,
    Btrfs,
    Xfs,
    F2fs,
    LvmPv,
    Gpt,
    Mbr,
    Empty,
}

impl BlkFormat {
    pub fn is_luks(&self) -> bool {
        matches!(self, BlkFormat::Luks1 | BlkFormat::Luks2)
    }

    /// The fs type string the kernel mount call expects, for formats that
    /// are mountable filesystems.
    pub fn kernel_fs_type(&self) -> Option<&'static str> {
        match self {
            BlkFormat::Ext4 => Some("ext4"),
            BlkFormat::Btrfs => Some("btrfs"),
            BlkFormat::Xfs => Some("xfs"),
            BlkFormat::F2fs => Some("f2fs"),
            _ => None,
        }
    }
}

impl Display for BlkFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlkFormat::Luks1 => "luks1",
            BlkFormat::Luks2 => "luks2",
            BlkFormat::Ext4 => "ext4",
            BlkFormat::Btrfs => "btrfs",
            BlkFormat::Xfs => "xfs",
            BlkFormat::F2fs => "f2fs",
            BlkFormat::LvmPv => "lvm-pv",
            BlkFormat::Gpt => "gpt",
            BlkFormat::Mbr => "mbr",
            BlkFormat::Empty => "empty",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct BlkInfo {
    pub format: BlkFormat,
    pub uuid: Option<BlkUuid>,
    pub label: Option<String>,
}

impl BlkInfo {
    fn empty() -> Self {
        BlkInfo {
            format: BlkFormat::Empty,
            uuid: None,
            label: None,
        }
    }
}

/// Read and classify a block device.
pub fn read_blk_info(path: impl AsRef<Path>) -> Result<BlkInfo> {
    let path = path.as_ref();
    let mut file =
        File::open(path).with_context(|| format!("unable to open {}", path.display()))?;

    let mut buf = vec![0u8; PROBE_WINDOW];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file
            .read(&mut buf[filled..])
            .with_context(|| format!("unable to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);

    Ok(probe(&buf))
}

/// Match the window against the signature table. First match wins; the GPT
/// probe runs before MBR so a protective MBR does not shadow the real
/// partition table.
pub fn probe(buf: &[u8]) -> BlkInfo {
    let probes: &[fn(&[u8]) -> Option<BlkInfo>] = &[
        probe_luks,
        probe_ext4,
        probe_btrfs,
        probe_xfs,
        probe_f2fs,
        probe_lvm_pv,
        probe_gpt,
        probe_mbr,
    ];
    for p in probes {
        if let Some(info) = p(buf) {
            return info;
        }
    }
    BlkInfo::empty()
}

fn window(buf: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    buf.get(offset..offset + len)
}

fn cstr_label(raw: &[u8]) -> Option<String> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    if end == 0 {
        return None;
    }
    std::str::from_utf8(&raw[..end]).ok().map(str::to_string)
}

fn probe_luks(buf: &[u8]) -> Option<BlkInfo> {
    if window(buf, 0, 6)? != b"LUKS\xba\xbe" {
        return None;
    }
    let version = u16::from_be_bytes(window(buf, 6, 2)?.try_into().unwrap());

    // Both versions keep an ASCII UUID at the same offset.
    let uuid_raw = window(buf, 168, 40)?;
    let uuid = cstr_label(uuid_raw)
        .and_then(|s| BlkUuid::parse(&s.to_lowercase()).ok());

    match version {
        1 => Some(BlkInfo {
            format: BlkFormat::Luks1,
            uuid,
            label: None,
        }),
        2 => Some(BlkInfo {
            format: BlkFormat::Luks2,
            uuid,
            label: cstr_label(window(buf, 24, 48)?),
        }),
        _ => Some(BlkInfo::empty()),
    }
}

fn probe_ext4(buf: &[u8]) -> Option<BlkInfo> {
    // superblock at 1024, s_magic at +0x38
    if window(buf, 1080, 2)? != &[0x53, 0xef] {
        return None;
    }
    Some(BlkInfo {
        format: BlkFormat::Ext4,
        uuid: Some(BlkUuid::new(window(buf, 1128, 16)?.to_vec())),
        label: cstr_label(window(buf, 1144, 16)?),
    })
}

fn probe_btrfs(buf: &[u8]) -> Option<BlkInfo> {
    if window(buf, 0x10040, 8)? != b"_BHRfS_M" {
        return None;
    }
    Some(BlkInfo {
        format: BlkFormat::Btrfs,
        uuid: Some(BlkUuid::new(window(buf, 0x10020, 16)?.to_vec())),
        label: cstr_label(window(buf, 0x1012b, 256)?),
    })
}

fn probe_xfs(buf: &[u8]) -> Option<BlkInfo> {
    if window(buf, 0, 4)? != b"XFSB" {
        return None;
    }
    Some(BlkInfo {
        format: BlkFormat::Xfs,
        uuid: Some(BlkUuid::new(window(buf, 32, 16)?.to_vec())),
        label: cstr_label(window(buf, 108, 12)?),
    })
}

fn probe_f2fs(buf: &[u8]) -> Option<BlkInfo> {
    // superblock at 1024, little-endian magic 0xF2F52010
    if window(buf, 1024, 4)? != &[0x10, 0x20, 0xf5, 0xf2] {
        return None;
    }
    let label_raw = window(buf, 1148, 512)?;
    let utf16: Vec<u16> = label_raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|c| *c != 0)
        .collect();
    let label = String::from_utf16(&utf16).ok().filter(|l| !l.is_empty());
    Some(BlkInfo {
        format: BlkFormat::F2fs,
        uuid: Some(BlkUuid::new(window(buf, 1132, 16)?.to_vec())),
        label,
    })
}

fn probe_lvm_pv(buf: &[u8]) -> Option<BlkInfo> {
    // label header in sector 1, type field at 0x218
    if window(buf, 512, 8)? != b"LABELONE" || window(buf, 0x218, 8)? != b"LVM2 001" {
        return None;
    }
    Some(BlkInfo {
        format: BlkFormat::LvmPv,
        uuid: None,
        label: None,
    })
}

fn probe_gpt(buf: &[u8]) -> Option<BlkInfo> {
    if window(buf, 512, 8)? != b"EFI PART" {
        return None;
    }
    let guid = window(buf, 512 + 56, 16)?;
    // disk GUID is stored with the first three fields little-endian
    let mut uuid = Vec::with_capacity(16);
    uuid.extend([guid[3], guid[2], guid[1], guid[0]]);
    uuid.extend([guid[5], guid[4]]);
    uuid.extend([guid[7], guid[6]]);
    uuid.extend(&guid[8..16]);
    Some(BlkInfo {
        format: BlkFormat::Gpt,
        uuid: Some(BlkUuid::new(uuid)),
        label: None,
    })
}

fn probe_mbr(buf: &[u8]) -> Option<BlkInfo> {
    if window(buf, 510, 2)? != &[0x55, 0xaa] {
        return None;
    }
    let sig = window(buf, 440, 4)?;
    // stored little-endian; present it most significant byte first
    let uuid = vec![sig[3], sig[2], sig[1], sig[0]];
    Some(BlkInfo {
        format: BlkFormat::Mbr,
        uuid: Some(BlkUuid::new(uuid)),
        label: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(buf: &mut [u8], offset: usize, data: &[u8]) {
        buf[offset..offset + data.len()].copy_from_slice(data);
    }

    #[test]
    fn test_ext4() {
        let mut buf = vec![0u8; 2048];
        put(&mut buf, 1080, &[0x53, 0xef]);
        let uuid = hex::decode("717be5bad42d4aaab8468a23cc7471b0").unwrap();
        put(&mut buf, 1128, &uuid);
        put(&mut buf, 1144, b"extlabel\0");

        let info = probe(&buf);
        assert_eq!(info.format, BlkFormat::Ext4);
        assert_eq!(
            info.uuid.unwrap().to_string(),
            "717be5ba-d42d-4aaa-b846-8a23cc7471b0"
        );
        assert_eq!(info.label.as_deref(), Some("extlabel"));
    }

    #[test]
    fn test_btrfs() {
        let mut buf = vec![0u8; PROBE_WINDOW];
        put(&mut buf, 0x10040, b"_BHRfS_M");
        let uuid = hex::decode("1884e1eb186f4b1baf1145ea80da8e3c").unwrap();
        put(&mut buf, 0x10020, &uuid);
        put(&mut buf, 0x1012b, b"btrfs111\0");

        let info = probe(&buf);
        assert_eq!(info.format, BlkFormat::Btrfs);
        assert_eq!(
            info.uuid.unwrap().to_string(),
            "1884e1eb-186f-4b1b-af11-45ea80da8e3c"
        );
        assert_eq!(info.label.as_deref(), Some("btrfs111"));
    }

    #[test]
    fn test_xfs() {
        let mut buf = vec![0u8; 512];
        put(&mut buf, 0, b"XFSB");
        let uuid = hex::decode("ee7cad9a02024c00a320418a9276d70d").unwrap();
        put(&mut buf, 32, &uuid);
        put(&mut buf, 108, b"xfs44\0");

        let info = probe(&buf);
        assert_eq!(info.format, BlkFormat::Xfs);
        assert_eq!(
            info.uuid.unwrap().to_string(),
            "ee7cad9a-0202-4c00-a320-418a9276d70d"
        );
        assert_eq!(info.label.as_deref(), Some("xfs44"));
    }

    #[test]
    fn test_f2fs() {
        let mut buf = vec![0u8; 4096];
        put(&mut buf, 1024, &[0x10, 0x20, 0xf5, 0xf2]);
        let uuid = hex::decode("6af49bb00bd84b82a1d1286dfe37d729").unwrap();
        put(&mut buf, 1132, &uuid);
        let label: Vec<u8> = "test1"
            .encode_utf16()
            .flat_map(|c| c.to_le_bytes())
            .collect();
        put(&mut buf, 1148, &label);

        let info = probe(&buf);
        assert_eq!(info.format, BlkFormat::F2fs);
        assert_eq!(
            info.uuid.unwrap().to_string(),
            "6af49bb0-0bd8-4b82-a1d1-286dfe37d729"
        );
        assert_eq!(info.label.as_deref(), Some("test1"));
    }

    #[test]
    fn test_luks1() {
        let mut buf = vec![0u8; 1024];
        put(&mut buf, 0, b"LUKS\xba\xbe");
        put(&mut buf, 6, &1u16.to_be_bytes());
        put(&mut buf, 168, b"6faf1e59-9999-4da4-97f9-c815e7353777\0");

        let info = probe(&buf);
        assert_eq!(info.format, BlkFormat::Luks1);
        assert_eq!(
            info.uuid.unwrap().to_string(),
            "6faf1e59-9999-4da4-97f9-c815e7353777"
        );
        assert_eq!(info.label, None);
    }

    #[test]
    fn test_luks2() {
        let mut buf = vec![0u8; 1024];
        put(&mut buf, 0, b"LUKS\xba\xbe");
        put(&mut buf, 6, &2u16.to_be_bytes());
        put(&mut buf, 24, b"bazz\0");
        put(&mut buf, 168, b"51df71ed-8e4a-4a7a-956d-b782706a52d1\0");

        let info = probe(&buf);
        assert_eq!(info.format, BlkFormat::Luks2);
        assert_eq!(
            info.uuid.unwrap().to_string(),
            "51df71ed-8e4a-4a7a-956d-b782706a52d1"
        );
        assert_eq!(info.label.as_deref(), Some("bazz"));
    }

    #[test]
    fn test_gpt_wins_over_protective_mbr() {
        let mut buf = vec![0u8; 1024];
        put(&mut buf, 510, &[0x55, 0xaa]);
        put(&mut buf, 512, b"EFI PART");
        // c26fcabe-8010-4bff-a066-8c73e76dbb32 in on-disk mixed-endian form
        let on_disk = [
            0xbe, 0xca, 0x6f, 0xc2, 0x10, 0x80, 0xff, 0x4b, 0xa0, 0x66, 0x8c, 0x73, 0xe7, 0x6d,
            0xbb, 0x32,
        ];
        put(&mut buf, 512 + 56, &on_disk);

        let info = probe(&buf);
        assert_eq!(info.format, BlkFormat::Gpt);
        assert_eq!(
            info.uuid.unwrap().to_string(),
            "c26fcabe-8010-4bff-a066-8c73e76dbb32"
        );
    }

    #[test]
    fn test_mbr() {
        let mut buf = vec![0u8; 512];
        put(&mut buf, 510, &[0x55, 0xaa]);
        put(&mut buf, 440, &[0x80, 0xb1, 0xea, 0x2b]); // 0x2beab180 little-endian

        let info = probe(&buf);
        assert_eq!(info.format, BlkFormat::Mbr);
        assert_eq!(info.uuid.unwrap().to_string(), "2beab180");
    }

    #[test]
    fn test_lvm_pv() {
        let mut buf = vec![0u8; 1024];
        put(&mut buf, 512, b"LABELONE");
        put(&mut buf, 0x218, b"LVM2 001");
        assert_eq!(probe(&buf).format, BlkFormat::LvmPv);
    }

    #[test]
    fn test_garbage_is_empty() {
        assert_eq!(probe(&[0u8; 4096]).format, BlkFormat::Empty);
        assert_eq!(probe(b"not a filesystem").format, BlkFormat::Empty);
        assert_eq!(probe(&[]).format, BlkFormat::Empty);
    }
}
