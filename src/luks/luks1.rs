//! LUKS version 1 on-disk format.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use anyhow::{bail, Context, Result};
use log::debug;

use super::{af, cipher};
use crate::types::{MasterKey, Passphrase};

pub const HEADER_SIZE: usize = 592;
const MAGIC: &[u8] = b"LUKS\xba\xbe";
const KEY_SLOTS: usize = 8;
const SLOT_ACTIVE: u32 = 0x00ac71f3;
const DIGEST_SIZE: usize = 20;

/// Application UUID under which clevis stores its JWE blobs in the
/// luksmeta area of a LUKS1 volume.
const CLEVIS_LUKSMETA_UUID: [u8; 16] = [
    0xcb, 0x6e, 0x89, 0x04, 0x81, 0xff, 0x40, 0xda, 0xa8, 0x4a, 0x07, 0xab, 0x9a, 0xb5, 0x71,
    0x5e,
];

#[derive(Debug, Clone)]
pub struct Luks1Slot {
    pub active: bool,
    pub iterations: u32,
    pub salt: [u8; 32],
    /// in sectors
    pub key_material_offset: u32,
    pub stripes: u32,
}

#[derive(Debug, Clone)]
pub struct Luks1Header {
    pub cipher_name: String,
    pub cipher_mode: String,
    pub hash_spec: String,
    /// in sectors
    pub payload_offset: u32,
    pub key_bytes: u32,
    pub mk_digest: [u8; DIGEST_SIZE],
    pub mk_digest_salt: [u8; 32],
    pub mk_digest_iter: u32,
    pub uuid: String,
    pub slots: Vec<Luks1Slot>,
}

fn header_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).to_string()
}

fn be32(raw: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(raw[offset..offset + 4].try_into().unwrap())
}

impl Luks1Header {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_SIZE {
            bail!("luks1 header truncated at {} bytes", raw.len());
        }
        if &raw[0..6] != MAGIC {
            bail!("not a luks device");
        }
        let version = u16::from_be_bytes(raw[6..8].try_into().unwrap());
        if version != 1 {
            bail!("unexpected luks header version {}", version);
        }

        let mut slots = Vec::with_capacity(KEY_SLOTS);
        for i in 0..KEY_SLOTS {
            let base = 208 + i * 48;
            slots.push(Luks1Slot {
                active: be32(raw, base) == SLOT_ACTIVE,
                iterations: be32(raw, base + 4),
                salt: raw[base + 8..base + 40].try_into().unwrap(),
                key_material_offset: be32(raw, base + 40),
                stripes: be32(raw, base + 44),
            });
        }

        Ok(Luks1Header {
            cipher_name: header_str(&raw[8..40]),
            cipher_mode: header_str(&raw[40..72]),
            hash_spec: header_str(&raw[72..104]),
            payload_offset: be32(raw, 104),
            key_bytes: be32(raw, 108),
            mk_digest: raw[112..132].try_into().unwrap(),
            mk_digest_salt: raw[132..164].try_into().unwrap(),
            mk_digest_iter: be32(raw, 164),
            uuid: header_str(&raw[168..208]).to_lowercase(),
            slots,
        })
    }

    pub fn cipher_spec(&self) -> String {
        format!("{}-{}", self.cipher_name, self.cipher_mode)
    }

    /// Derive the keyslot key from a passphrase and try to recover and
    /// verify the master key. `Ok(None)` means the passphrase does not open
    /// this slot.
    pub fn unseal_slot(
        &self,
        dev: &mut File,
        slot_index: usize,
        passphrase: &Passphrase,
    ) -> Result<Option<MasterKey>> {
        let slot = &self.slots[slot_index];
        if !slot.active {
            return Ok(None);
        }

        let key_bytes = self.key_bytes as usize;
        let mut derived = vec![0u8; key_bytes];
        cipher::pbkdf2_derive(
            &self.hash_spec,
            passphrase.as_bytes(),
            &slot.salt,
            slot.iterations,
            &mut derived,
        )?;

        let material_len = key_bytes * slot.stripes as usize;
        let read_len = material_len.next_multiple_of(512);
        let mut material = vec![0u8; read_len];
        dev.seek(SeekFrom::Start(slot.key_material_offset as u64 * 512))
            .context("unable to seek to key material")?;
        dev.read_exact(&mut material)
            .context("unable to read key material")?;

        cipher::decrypt_area(&self.cipher_spec(), &derived, &mut material)?;
        material.truncate(material_len);

        let candidate = MasterKey::from(af::merge(
            &material,
            key_bytes,
            slot.stripes as usize,
            &self.hash_spec,
        )?);

        let mut digest = [0u8; DIGEST_SIZE];
        cipher::pbkdf2_derive(
            &self.hash_spec,
            candidate.as_bytes(),
            &self.mk_digest_salt,
            self.mk_digest_iter,
            &mut digest,
        )?;
        if digest == self.mk_digest {
            Ok(Some(candidate))
        } else {
            Ok(None)
        }
    }

    /// Collect clevis JWE blobs from the luksmeta area, paired with the
    /// keyslot they unlock, in ascending slot order.
    pub fn clevis_tokens(&self, dev: &mut File) -> Result<Vec<(usize, String)>> {
        let Some(header_offset) = self.find_luksmeta(dev)? else {
            return Ok(Vec::new());
        };

        let mut raw = vec![0u8; 16 + KEY_SLOTS * 28];
        dev.seek(SeekFrom::Start(header_offset))
            .context("unable to seek to luksmeta header")?;
        dev.read_exact(&mut raw)
            .context("unable to read luksmeta header")?;

        let mut tokens = Vec::new();
        for slot in 0..KEY_SLOTS {
            let base = 16 + slot * 28;
            let uuid: [u8; 16] = raw[base..base + 16].try_into().unwrap();
            if uuid != CLEVIS_LUKSMETA_UUID {
                continue;
            }
            let offset = be32(&raw, base + 16) as u64;
            let length = be32(&raw, base + 20) as usize;
            if length == 0 || length > 64 * 1024 {
                continue;
            }
            let mut blob = vec![0u8; length];
            dev.seek(SeekFrom::Start(header_offset + offset))
                .context("unable to seek to luksmeta slot data")?;
            dev.read_exact(&mut blob)
                .context("unable to read luksmeta slot data")?;
            let end = blob.iter().position(|b| *b == 0).unwrap_or(blob.len());
            let jwe = String::from_utf8_lossy(&blob[..end]).trim().to_string();
            if !jwe.is_empty() {
                debug!("found clevis metadata for luks1 slot {}", slot);
                tokens.push((slot, jwe));
            }
        }
        Ok(tokens)
    }

    /// The luksmeta header lives 4 KiB-aligned in the gap between the last
    /// keyslot area and the payload.
    fn find_luksmeta(&self, dev: &mut File) -> Result<Option<u64>> {
        let keyslots_end = self
            .slots
            .iter()
            .filter(|s| s.active)
            .map(|s| {
                s.key_material_offset as u64 * 512
                    + (self.key_bytes * s.stripes) as u64
            })
            .max()
            .unwrap_or(HEADER_SIZE as u64);
        let mut offset = keyslots_end.next_multiple_of(4096);

        let payload_start = self.payload_offset as u64 * 512;
        let mut magic = [0u8; 8];
        while offset + 8 <= payload_start {
            dev.seek(SeekFrom::Start(offset))
                .context("unable to seek while scanning for luksmeta")?;
            if dev.read_exact(&mut magic).is_err() {
                return Ok(None);
            }
            if &magic == b"LUKSMETA" {
                return Ok(Some(offset));
            }
            offset += 4096;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Vec<u8> {
        let mut raw = vec![0u8; HEADER_SIZE];
        raw[0..6].copy_from_slice(MAGIC);
        raw[6..8].copy_from_slice(&1u16.to_be_bytes());
        raw[8..11].copy_from_slice(b"aes");
        raw[40..51].copy_from_slice(b"xts-plain64");
        raw[72..78].copy_from_slice(b"sha256");
        raw[104..108].copy_from_slice(&4096u32.to_be_bytes()); // payload offset
        raw[108..112].copy_from_slice(&64u32.to_be_bytes()); // key bytes
        raw[164..168].copy_from_slice(&1000u32.to_be_bytes());
        raw[168..204].copy_from_slice(b"f0c89fd5-7e1e-4ecc-b310-8cd650bd5415");

        // slot 0 active, slot 1 dead
        raw[208..212].copy_from_slice(&SLOT_ACTIVE.to_be_bytes());
        raw[212..216].copy_from_slice(&261032u32.to_be_bytes());
        raw[248..252].copy_from_slice(&8u32.to_be_bytes());
        raw[252..256].copy_from_slice(&4000u32.to_be_bytes());
        raw[256..260].copy_from_slice(&0x0000deadu32.to_be_bytes());
        raw
    }

    #[test]
    fn test_parse_header() {
        let header = Luks1Header::parse(&sample_header()).unwrap();
        assert_eq!(header.cipher_spec(), "aes-xts-plain64");
        assert_eq!(header.hash_spec, "sha256");
        assert_eq!(header.uuid, "f0c89fd5-7e1e-4ecc-b310-8cd650bd5415");
        assert_eq!(header.payload_offset, 4096);
        assert_eq!(header.key_bytes, 64);
        assert!(header.slots[0].active);
        assert_eq!(header.slots[0].iterations, 261032);
        assert_eq!(header.slots[0].stripes, 4000);
        assert!(!header.slots[1].active);
    }

    #[test]
    fn test_parse_rejects_wrong_version() {
        let mut raw = sample_header();
        raw[6..8].copy_from_slice(&2u16.to_be_bytes());
        assert!(Luks1Header::parse(&raw).is_err());
    }

    #[test]
    fn test_parse_rejects_truncated() {
        assert!(Luks1Header::parse(&[0u8; 100]).is_err());
        assert!(Luks1Header::parse(b"LUKS\xba\xbe").is_err());
    }
}
