//! LUKS anti-forensic information splitter.
//!
//! Key material on disk is stored split over `stripes` diffused blocks so
//! that overwriting any part of the area destroys the key. Unlocking only
//! ever needs the merge direction.

use anyhow::{bail, Result};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

/// Merge `stripes` diffused blocks of `key_len` bytes back into the key.
pub fn merge(material: &[u8], key_len: usize, stripes: usize, hash: &str) -> Result<Vec<u8>> {
    if stripes == 0 || material.len() < key_len * stripes {
        bail!(
            "af material too short: {} bytes for {} stripes of {}",
            material.len(),
            stripes,
            key_len
        );
    }

    let mut d = vec![0u8; key_len];
    for stripe in 0..stripes - 1 {
        let block = &material[stripe * key_len..(stripe + 1) * key_len];
        for (acc, b) in d.iter_mut().zip(block) {
            *acc ^= b;
        }
        diffuse(hash, &mut d)?;
    }
    let last = &material[(stripes - 1) * key_len..stripes * key_len];
    for (acc, b) in d.iter_mut().zip(last) {
        *acc ^= b;
    }
    Ok(d)
}

/// Hash every digest-sized chunk keyed by its index, in place. The last
/// partial chunk keeps only the leading bytes of its digest.
fn diffuse(hash: &str, buf: &mut [u8]) -> Result<()> {
    let digest_size = hash_digest_size(hash)?;
    let len = buf.len();
    let mut chunk_index: u32 = 0;
    let mut offset = 0;
    while offset < len {
        let chunk_len = digest_size.min(len - offset);
        let digest = hash_with_index(hash, chunk_index, &buf[offset..offset + chunk_len])?;
        buf[offset..offset + chunk_len].copy_from_slice(&digest[..chunk_len]);
        offset += chunk_len;
        chunk_index += 1;
    }
    Ok(())
}

pub fn hash_digest_size(hash: &str) -> Result<usize> {
    match hash {
        "sha1" => Ok(20),
        "sha256" => Ok(32),
        "sha512" => Ok(64),
        other => bail!("unsupported af hash {}", other),
    }
}

fn hash_with_index(hash: &str, index: u32, data: &[u8]) -> Result<Vec<u8>> {
    let prefix = index.to_be_bytes();
    Ok(match hash {
        "sha1" => {
            let mut h = Sha1::new();
            h.update(prefix);
            h.update(data);
            h.finalize().to_vec()
        }
        "sha256" => {
            let mut h = Sha256::new();
            h.update(prefix);
            h.update(data);
            h.finalize().to_vec()
        }
        "sha512" => {
            let mut h = Sha512::new();
            h.update(prefix);
            h.update(data);
            h.finalize().to_vec()
        }
        other => bail!("unsupported af hash {}", other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_stripe_is_identity() {
        let material = [0xa5u8; 32];
        let merged = merge(&material, 32, 1, "sha256").unwrap();
        assert_eq!(merged, material);
    }

    #[test]
    fn test_merge_is_deterministic() {
        let material: Vec<u8> = (0..64u8).cycle().take(32 * 4000).collect();
        let a = merge(&material, 32, 4000, "sha256").unwrap();
        let b = merge(&material, 32, 4000, "sha256").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_merge_sensitive_to_any_stripe() {
        let material: Vec<u8> = (0..64u8).cycle().take(32 * 100).collect();
        let baseline = merge(&material, 32, 100, "sha256").unwrap();

        let mut flipped = material.clone();
        flipped[32 * 50] ^= 1;
        assert_ne!(baseline, merge(&flipped, 32, 100, "sha256").unwrap());
    }

    #[test]
    fn test_short_material_rejected() {
        assert!(merge(&[0u8; 16], 32, 2, "sha256").is_err());
        assert!(merge(&[0u8; 64], 32, 0, "sha256").is_err());
    }

    #[test]
    fn test_unknown_hash_rejected() {
        assert!(merge(&[0u8; 64], 32, 2, "whirlpool").is_err());
    }
}
