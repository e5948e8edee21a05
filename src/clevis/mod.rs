//! Clevis pin evaluation: recover a LUKS passphrase from a bound JWE.
//!
//! Each pin is a different way to get at the content encryption key; the
//! payload decryption is shared. A failing pin only fails its own key slot,
//! the caller falls through to the next slot or the interactive prompt.

pub mod jwe;
pub mod tang;
pub mod tpm2;

use anyhow::{bail, Context, Result};
use log::debug;

use crate::types::Passphrase;
use jwe::Jwe;

pub enum Pin {
    Tang,
    Tpm2,
}

impl Pin {
    fn of(jwe: &Jwe) -> Result<Pin> {
        match jwe.pin()? {
            "tang" => Ok(Pin::Tang),
            "tpm2" => Ok(Pin::Tpm2),
            other => bail!("unsupported clevis pin {}", other),
        }
    }
}

/// Recover the passphrase sealed in a clevis JWE, whatever the pin.
pub async fn recover_passphrase(jwe: &Jwe) -> Result<Passphrase> {
    let cek = match Pin::of(jwe)? {
        Pin::Tang => {
            debug!("recovering key via the tang pin");
            tang::recover(jwe).await.context("tang pin failed")?
        }
        Pin::Tpm2 => {
            debug!("recovering key via the tpm2 pin");
            let jwe = jwe.clone();
            tokio::task::spawn_blocking(move || tpm2::recover(&jwe))
                .await
                .context("tpm2 task failed")?
                .context("tpm2 pin failed")?
        }
    };

    let plaintext = jwe.decrypt(&cek)?;
    Ok(Passphrase::from(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jwe::b64url_encode;

    #[test]
    fn test_pin_dispatch() {
        let tang = Jwe::parse_compact(&format!(
            "{}..{}.{}.{}",
            b64url_encode(br#"{"alg":"ECDH-ES","enc":"A256GCM","clevis":{"pin":"tang","tang":{"url":"http://x"}}}"#),
            b64url_encode(&[0u8; 12]),
            b64url_encode(b"x"),
            b64url_encode(&[0u8; 16]),
        ))
        .unwrap();
        assert!(matches!(Pin::of(&tang).unwrap(), Pin::Tang));

        let unknown = Jwe::parse_compact(&format!(
            "{}..{}.{}.{}",
            b64url_encode(br#"{"alg":"dir","enc":"A256GCM","clevis":{"pin":"sss"}}"#),
            b64url_encode(&[0u8; 12]),
            b64url_encode(b"x"),
            b64url_encode(&[0u8; 16]),
        ))
        .unwrap();
        assert!(Pin::of(&unknown).is_err());
    }
}
