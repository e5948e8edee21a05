//! Minimal JWE handling for clevis blobs.
//!
//! Clevis stores its key material as a JWE in compact serialization (LUKS1
//! luksmeta) or flattened JSON (LUKS2 tokens). The content encryption is
//! always A256GCM; how the CEK is recovered depends on the pin.

use anyhow::{anyhow, bail, Context, Result};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit};
use base64::{prelude::BASE64_URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};

pub fn b64url_decode(s: &str) -> Result<Vec<u8>> {
    BASE64_URL_SAFE_NO_PAD
        .decode(s.trim())
        .map_err(|e| anyhow!("invalid base64url data: {}", e))
}

pub fn b64url_encode(data: &[u8]) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(data)
}

#[derive(Debug, Clone)]
pub struct Jwe {
    /// Protected header exactly as transmitted; it doubles as the AAD.
    pub protected_b64: String,
    pub header: serde_json::Value,
    pub encrypted_key: Vec<u8>,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

impl Jwe {
    /// Parse the five-field `a.b.c.d.e` compact form.
    pub fn parse_compact(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.trim().split('.').collect();
        if fields.len() != 5 {
            bail!("compact jwe has {} fields, expected 5", fields.len());
        }
        Self::from_fields(fields[0], fields[1], fields[2], fields[3], fields[4])
    }

    /// Parse the flattened JSON form used inside LUKS2 tokens.
    pub fn parse_json(value: &serde_json::Value) -> Result<Self> {
        let field = |name: &str| -> Result<&str> {
            value
                .get(name)
                .and_then(|v| v.as_str())
                .with_context(|| format!("jwe is missing the {:?} field", name))
        };
        Self::from_fields(
            field("protected")?,
            value.get("encrypted_key").and_then(|v| v.as_str()).unwrap_or(""),
            field("iv")?,
            field("ciphertext")?,
            field("tag")?,
        )
    }

    fn from_fields(
        protected: &str,
        encrypted_key: &str,
        iv: &str,
        ciphertext: &str,
        tag: &str,
    ) -> Result<Self> {
        let header: serde_json::Value = serde_json::from_slice(&b64url_decode(protected)?)
            .context("unable to parse jwe protected header")?;
        Ok(Jwe {
            protected_b64: protected.to_string(),
            header,
            encrypted_key: if encrypted_key.is_empty() {
                Vec::new()
            } else {
                b64url_decode(encrypted_key)?
            },
            iv: b64url_decode(iv)?,
            ciphertext: b64url_decode(ciphertext)?,
            tag: b64url_decode(tag)?,
        })
    }

    pub fn alg(&self) -> Option<&str> {
        self.header.get("alg").and_then(|v| v.as_str())
    }

    pub fn enc(&self) -> Option<&str> {
        self.header.get("enc").and_then(|v| v.as_str())
    }

    /// The `clevis` object of the protected header.
    pub fn clevis(&self) -> Result<&serde_json::Value> {
        self.header
            .get("clevis")
            .context("jwe protected header has no clevis object")
    }

    pub fn pin(&self) -> Result<&str> {
        self.clevis()?
            .get("pin")
            .and_then(|v| v.as_str())
            .context("clevis object has no pin")
    }

    /// Decrypt the payload with the recovered CEK. The protected header is
    /// authenticated as AAD, so a tampered header fails here.
    pub fn decrypt(&self, cek: &[u8]) -> Result<Vec<u8>> {
        match self.enc() {
            Some("A256GCM") => {}
            other => bail!("unsupported jwe enc {:?}", other),
        }
        if self.iv.len() != 12 {
            bail!("unexpected jwe iv length {}", self.iv.len());
        }

        let cipher = Aes256Gcm::new_from_slice(cek)
            .map_err(|_| anyhow!("cek has wrong length {}", cek.len()))?;
        let mut msg = self.ciphertext.clone();
        msg.extend_from_slice(&self.tag);

        cipher
            .decrypt(
                aes_gcm::Nonce::from_slice(&self.iv),
                Payload {
                    msg: &msg,
                    aad: self.protected_b64.as_bytes(),
                },
            )
            .map_err(|_| anyhow!("jwe payload decryption failed"))
    }
}

/// Concat KDF (NIST SP 800-56A) with SHA-256 as used for ECDH-ES direct key
/// agreement, RFC 7518 section 4.6.
pub fn concat_kdf_sha256(
    z: &[u8],
    alg: &str,
    apu: &[u8],
    apv: &[u8],
    key_len: usize,
) -> Vec<u8> {
    let mut other_info = Vec::new();
    for field in [alg.as_bytes(), apu, apv] {
        other_info.extend_from_slice(&(field.len() as u32).to_be_bytes());
        other_info.extend_from_slice(field);
    }
    other_info.extend_from_slice(&((key_len * 8) as u32).to_be_bytes());

    let mut derived = Vec::with_capacity(key_len);
    let mut round: u32 = 1;
    while derived.len() < key_len {
        let mut hasher = Sha256::new();
        hasher.update(round.to_be_bytes());
        hasher.update(z);
        hasher.update(&other_info);
        derived.extend_from_slice(&hasher.finalize());
        round += 1;
    }
    derived.truncate(key_len);
    derived
}

/// RFC 7638 thumbprint of an EC JWK, base64url encoded.
pub fn ec_jwk_thumbprint(crv: &str, x: &str, y: &str) -> String {
    let canonical = format!(
        r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
        crv, x, y
    );
    b64url_encode(&Sha256::digest(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::aead::Aead;

    #[test]
    fn test_concat_kdf_rfc7518_vector() {
        // RFC 7518 appendix C
        let z: [u8; 32] = [
            158, 86, 217, 29, 129, 113, 53, 211, 114, 131, 66, 131, 191, 132, 38, 156, 251, 49,
            110, 163, 218, 128, 106, 72, 246, 218, 167, 121, 140, 254, 144, 196,
        ];
        let derived = concat_kdf_sha256(&z, "A128GCM", b"Alice", b"Bob", 16);
        assert_eq!(b64url_encode(&derived), "VqqN6vgjbSBcIijNcacQGg");
    }

    #[test]
    fn test_parse_compact() {
        let header = br#"{"alg":"ECDH-ES","enc":"A256GCM","clevis":{"pin":"tang","tang":{"url":"http://10.0.2.100:5697"}}}"#;
        let compact = format!(
            "{}..{}.{}.{}",
            b64url_encode(header),
            b64url_encode(&[0u8; 12]),
            b64url_encode(b"payload"),
            b64url_encode(&[0u8; 16]),
        );
        let jwe = Jwe::parse_compact(&compact).unwrap();
        assert_eq!(jwe.alg(), Some("ECDH-ES"));
        assert_eq!(jwe.enc(), Some("A256GCM"));
        assert_eq!(jwe.pin().unwrap(), "tang");
        assert!(jwe.encrypted_key.is_empty());
        assert_eq!(jwe.iv.len(), 12);
    }

    #[test]
    fn test_parse_json() {
        let value = serde_json::json!({
            "protected": b64url_encode(br#"{"alg":"dir","enc":"A256GCM","clevis":{"pin":"tpm2"}}"#),
            "iv": b64url_encode(&[1u8; 12]),
            "ciphertext": b64url_encode(b"ct"),
            "tag": b64url_encode(&[2u8; 16]),
        });
        let jwe = Jwe::parse_json(&value).unwrap();
        assert_eq!(jwe.pin().unwrap(), "tpm2");
        assert_eq!(jwe.iv, vec![1u8; 12]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Jwe::parse_compact("only.three.fields").is_err());
        assert!(Jwe::parse_compact("a.b.c.d.e").is_err()); // not base64 json
        assert!(Jwe::parse_json(&serde_json::json!({"protected": "x"})).is_err());
    }

    #[test]
    fn test_decrypt_roundtrip_with_aad() {
        let header = br#"{"alg":"dir","enc":"A256GCM","clevis":{"pin":"tpm2"}}"#;
        let protected_b64 = b64url_encode(header);
        let cek = [7u8; 32];
        let iv = [9u8; 12];

        let cipher = Aes256Gcm::new_from_slice(&cek).unwrap();
        let sealed = cipher
            .encrypt(
                aes_gcm::Nonce::from_slice(&iv),
                Payload {
                    msg: b"secret passphrase",
                    aad: protected_b64.as_bytes(),
                },
            )
            .unwrap();
        let (ct, tag) = sealed.split_at(sealed.len() - 16);

        let compact = format!(
            "{}..{}.{}.{}",
            protected_b64,
            b64url_encode(&iv),
            b64url_encode(ct),
            b64url_encode(tag),
        );
        let jwe = Jwe::parse_compact(&compact).unwrap();
        assert_eq!(jwe.decrypt(&cek).unwrap(), b"secret passphrase");

        // wrong key must fail, not return garbage
        assert!(jwe.decrypt(&[8u8; 32]).is_err());
    }

    #[test]
    fn test_thumbprint_is_stable() {
        let a = ec_jwk_thumbprint("P-521", "AX...x", "AY...y");
        let b = ec_jwk_thumbprint("P-521", "AX...x", "AY...y");
        assert_eq!(a, b);
        assert_ne!(a, ec_jwk_thumbprint("P-521", "AX...x", "other"));
    }
}
