//! LUKS version 2 on-disk format: binary headers plus the JSON metadata
//! area.
//!
//! The header exists in two copies for crash safety. Each copy is
//! checksummed and carries a sequence id; the valid copy with the highest
//! seqid wins.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use anyhow::{anyhow, bail, Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine as _};
use serde::Deserialize;
use sha2::{Digest as _, Sha256};

use super::{af, cipher};
use crate::types::{MasterKey, Passphrase};

const MAGIC_PRIMARY: &[u8] = b"LUKS\xba\xbe";
const MAGIC_SECONDARY: &[u8] = b"SKUL\xba\xbe";
const BIN_HEADER_SIZE: usize = 4096;

/// Offsets at which the secondary header may start, i.e. the valid sizes of
/// the primary header area.
const SECONDARY_OFFSETS: &[u64] = &[
    0x4000, 0x8000, 0x10000, 0x20000, 0x40000, 0x80000, 0x100000, 0x200000, 0x400000,
];

#[derive(Debug, Clone)]
pub struct Luks2Header {
    pub seqid: u64,
    pub hdr_size: u64,
    pub uuid: String,
    pub label: Option<String>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    pub keyslots: HashMap<String, Keyslot>,
    #[serde(default)]
    pub tokens: HashMap<String, Token>,
    pub segments: HashMap<String, Segment>,
    pub digests: HashMap<String, KeyDigest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Keyslot {
    #[serde(rename = "type")]
    pub slot_type: String,
    pub key_size: usize,
    pub af: AfParams,
    pub area: Area,
    pub kdf: Kdf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AfParams {
    #[serde(rename = "type")]
    pub af_type: String,
    pub stripes: usize,
    pub hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Area {
    #[serde(rename = "type")]
    pub area_type: String,
    pub offset: String,
    pub size: String,
    pub encryption: String,
    pub key_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum Kdf {
    #[serde(rename = "pbkdf2")]
    Pbkdf2 {
        salt: String,
        hash: String,
        iterations: u32,
    },
    #[serde(rename = "argon2i")]
    Argon2i {
        salt: String,
        time: u32,
        memory: u32,
        cpus: u32,
    },
    #[serde(rename = "argon2id")]
    Argon2id {
        salt: String,
        time: u32,
        memory: u32,
        cpus: u32,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Token {
    #[serde(rename = "type")]
    pub token_type: String,
    #[serde(default)]
    pub keyslots: Vec<String>,
    #[serde(default)]
    pub jwe: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub segment_type: String,
    pub offset: String,
    pub size: String,
    #[serde(default)]
    pub encryption: Option<String>,
    #[serde(default)]
    pub sector_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDigest {
    #[serde(rename = "type")]
    pub digest_type: String,
    pub keyslots: Vec<String>,
    #[serde(default)]
    pub segments: Vec<String>,
    pub hash: String,
    pub iterations: u32,
    pub salt: String,
    pub digest: String,
}

struct BinHeader {
    hdr_size: u64,
    seqid: u64,
    uuid: String,
    label: Option<String>,
    csum_alg: String,
    csum: [u8; 64],
}

fn header_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).to_string()
}

fn parse_bin_header(raw: &[u8], primary: bool) -> Result<BinHeader> {
    let magic = if primary { MAGIC_PRIMARY } else { MAGIC_SECONDARY };
    if &raw[0..6] != magic {
        bail!("luks2 header magic mismatch");
    }
    let version = u16::from_be_bytes(raw[6..8].try_into().unwrap());
    if version != 2 {
        bail!("unexpected luks header version {}", version);
    }
    let label = header_str(&raw[24..72]);
    Ok(BinHeader {
        hdr_size: u64::from_be_bytes(raw[8..16].try_into().unwrap()),
        seqid: u64::from_be_bytes(raw[16..24].try_into().unwrap()),
        uuid: header_str(&raw[168..208]).to_lowercase(),
        label: (!label.is_empty()).then_some(label),
        csum_alg: header_str(&raw[72..104]),
        csum: raw[448..512].try_into().unwrap(),
    })
}

/// Validate the checksum of a whole header area (binary header + JSON).
fn checksum_ok(area: &[u8], header: &BinHeader) -> bool {
    if header.csum_alg != "sha256" {
        return false;
    }
    let mut zeroed = area.to_vec();
    zeroed[448..512].fill(0);
    let digest = Sha256::digest(&zeroed);
    header.csum[..32] == digest[..]
}

fn read_header_copy(dev: &mut File, offset: u64, primary: bool) -> Result<Luks2Header> {
    let mut bin = vec![0u8; BIN_HEADER_SIZE];
    dev.seek(SeekFrom::Start(offset))?;
    dev.read_exact(&mut bin)?;
    let header = parse_bin_header(&bin, primary)?;

    if !primary && !SECONDARY_OFFSETS.contains(&offset) {
        bail!("implausible secondary header offset {}", offset);
    }
    let area_size = header.hdr_size as usize;
    if area_size <= BIN_HEADER_SIZE || area_size > 4 * 1024 * 1024 {
        bail!("implausible luks2 header size {}", area_size);
    }

    let mut area = vec![0u8; area_size];
    dev.seek(SeekFrom::Start(offset))?;
    dev.read_exact(&mut area)?;
    if !checksum_ok(&area, &header) {
        bail!("luks2 header checksum mismatch");
    }

    let json_raw = &area[BIN_HEADER_SIZE..];
    let end = json_raw
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(json_raw.len());
    let metadata: Metadata = serde_json::from_slice(&json_raw[..end])
        .context("unable to parse luks2 json metadata")?;

    Ok(Luks2Header {
        seqid: header.seqid,
        hdr_size: header.hdr_size,
        uuid: header.uuid,
        label: header.label,
        metadata,
    })
}

/// Read both header copies and return the freshest valid one.
pub fn read_header(dev: &mut File) -> Result<Luks2Header> {
    let primary = read_header_copy(dev, 0, true);

    let secondary = match &primary {
        // the secondary copy starts where the primary area ends
        Ok(p) => read_header_copy(dev, p.hdr_size, false),
        // primary is damaged, scan the known offsets
        Err(_) => SECONDARY_OFFSETS
            .iter()
            .find_map(|offset| read_header_copy(dev, *offset, false).ok())
            .ok_or_else(|| anyhow!("no valid luks2 header copy found")),
    };

    match (primary, secondary) {
        (Ok(p), Ok(s)) => Ok(if s.seqid > p.seqid { s } else { p }),
        (Ok(p), Err(_)) => Ok(p),
        (Err(_), Ok(s)) => Ok(s),
        (Err(e), Err(_)) => Err(e).context("both luks2 header copies are damaged"),
    }
}

impl Metadata {
    /// Active keyslots in ascending numeric order.
    pub fn ordered_keyslots(&self) -> Vec<(usize, &Keyslot)> {
        let mut slots: Vec<(usize, &Keyslot)> = self
            .keyslots
            .iter()
            .filter_map(|(id, slot)| Some((id.parse().ok()?, slot)))
            .collect();
        slots.sort_by_key(|(id, _)| *id);
        slots
    }

    /// Clevis tokens as (keyslot index, jwe json) in ascending keyslot
    /// order.
    pub fn clevis_tokens(&self) -> Vec<(usize, serde_json::Value)> {
        let mut tokens: Vec<(usize, serde_json::Value)> = self
            .tokens
            .values()
            .filter(|t| t.token_type == "clevis")
            .filter_map(|t| {
                let slot: usize = t.keyslots.first()?.parse().ok()?;
                Some((slot, t.jwe.clone()?))
            })
            .collect();
        tokens.sort_by_key(|(slot, _)| *slot);
        tokens
    }

    /// The crypt segment describing the payload.
    pub fn crypt_segment(&self) -> Result<&Segment> {
        self.segments
            .values()
            .find(|s| s.segment_type == "crypt")
            .context("luks2 metadata has no crypt segment")
    }

    fn digest_for_slot(&self, slot_id: &str) -> Option<&KeyDigest> {
        self.digests
            .values()
            .find(|d| d.digest_type == "pbkdf2" && d.keyslots.iter().any(|k| k == slot_id))
    }

    /// Try to open one keyslot with a passphrase. `Ok(None)` means wrong
    /// passphrase.
    pub fn unseal_slot(
        &self,
        dev: &mut File,
        slot_id: &str,
        passphrase: &Passphrase,
    ) -> Result<Option<MasterKey>> {
        let slot = self
            .keyslots
            .get(slot_id)
            .with_context(|| format!("no keyslot {}", slot_id))?;
        if slot.slot_type != "luks2" {
            bail!("unsupported keyslot type {}", slot.slot_type);
        }
        if slot.af.af_type != "luks1" {
            bail!("unsupported af type {}", slot.af.af_type);
        }
        if slot.area.area_type != "raw" {
            bail!("unsupported keyslot area type {}", slot.area.area_type);
        }

        let mut area_key = vec![0u8; slot.area.key_size];
        derive_kdf(&slot.kdf, passphrase, &mut area_key)?;

        let area_offset: u64 = slot
            .area
            .offset
            .parse()
            .context("malformed keyslot area offset")?;
        let material_len = slot.key_size * slot.af.stripes;
        let mut material = vec![0u8; material_len.next_multiple_of(512)];
        dev.seek(SeekFrom::Start(area_offset))
            .context("unable to seek to keyslot area")?;
        dev.read_exact(&mut material)
            .context("unable to read keyslot area")?;

        cipher::decrypt_area(&slot.area.encryption, &area_key, &mut material)?;
        material.truncate(material_len);

        let candidate = MasterKey::from(af::merge(
            &material,
            slot.key_size,
            slot.af.stripes,
            &slot.af.hash,
        )?);

        let digest = self
            .digest_for_slot(slot_id)
            .with_context(|| format!("no digest covers keyslot {}", slot_id))?;
        let expected = BASE64_STANDARD
            .decode(&digest.digest)
            .context("malformed digest")?;
        let salt = BASE64_STANDARD
            .decode(&digest.salt)
            .context("malformed digest salt")?;
        let mut actual = vec![0u8; expected.len()];
        cipher::pbkdf2_derive(
            &digest.hash,
            candidate.as_bytes(),
            &salt,
            digest.iterations,
            &mut actual,
        )?;

        if actual == expected {
            Ok(Some(candidate))
        } else {
            Ok(None)
        }
    }
}

fn derive_kdf(kdf: &Kdf, passphrase: &Passphrase, out: &mut [u8]) -> Result<()> {
    match kdf {
        Kdf::Pbkdf2 {
            salt,
            hash,
            iterations,
        } => {
            let salt = BASE64_STANDARD.decode(salt).context("malformed kdf salt")?;
            cipher::pbkdf2_derive(hash, passphrase.as_bytes(), &salt, *iterations, out)
        }
        Kdf::Argon2i {
            salt,
            time,
            memory,
            cpus,
        } => argon2_derive(
            argon2::Algorithm::Argon2i,
            salt,
            passphrase,
            *time,
            *memory,
            *cpus,
            out,
        ),
        Kdf::Argon2id {
            salt,
            time,
            memory,
            cpus,
        } => argon2_derive(
            argon2::Algorithm::Argon2id,
            salt,
            passphrase,
            *time,
            *memory,
            *cpus,
            out,
        ),
    }
}

fn argon2_derive(
    alg: argon2::Algorithm,
    salt: &str,
    passphrase: &Passphrase,
    time: u32,
    memory: u32,
    cpus: u32,
    out: &mut [u8],
) -> Result<()> {
    let salt = BASE64_STANDARD.decode(salt).context("malformed kdf salt")?;
    let params = argon2::Params::new(memory, time, cpus, Some(out.len()))
        .map_err(|e| anyhow!("bad argon2 parameters: {}", e))?;
    argon2::Argon2::new(alg, argon2::Version::V0x13, params)
        .hash_password_into(passphrase.as_bytes(), &salt, out)
        .map_err(|e| anyhow!("argon2 derivation failed: {}", e))
}

impl Segment {
    pub fn offset_sectors(&self) -> Result<u64> {
        let bytes: u64 = self.offset.parse().context("malformed segment offset")?;
        Ok(bytes / 512)
    }
}
