//! TPM2 pin: unseal the content key from the TPM.
//!
//! The binding sealed a symmetric JWK under a deterministic primary key in
//! the owner hierarchy, optionally gated by a PCR policy. Recovery talks
//! straight to the kernel resource manager with hand-marshalled TPM2
//! commands; the handful we need does not justify a TSS stack in the
//! initramfs.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use serde::Deserialize;

use super::jwe::{b64url_decode, Jwe};

const TPM_DEVICES: &[&str] = &["/dev/tpmrm0", "/dev/tpm0"];

// command/response tags
const TPM_ST_NO_SESSIONS: u16 = 0x8001;
const TPM_ST_SESSIONS: u16 = 0x8002;

// command codes
const TPM_CC_CREATE_PRIMARY: u32 = 0x0000_0131;
const TPM_CC_LOAD: u32 = 0x0000_0157;
const TPM_CC_UNSEAL: u32 = 0x0000_015e;
const TPM_CC_FLUSH_CONTEXT: u32 = 0x0000_0165;
const TPM_CC_START_AUTH_SESSION: u32 = 0x0000_0176;
const TPM_CC_POLICY_PCR: u32 = 0x0000_017f;

// permanent handles
const TPM_RH_OWNER: u32 = 0x4000_0001;
const TPM_RH_NULL: u32 = 0x4000_0007;
const TPM_RS_PW: u32 = 0x4000_0009;

// algorithms
const TPM_ALG_RSA: u16 = 0x0001;
const TPM_ALG_SHA1: u16 = 0x0004;
const TPM_ALG_AES: u16 = 0x0006;
const TPM_ALG_SHA256: u16 = 0x000b;
const TPM_ALG_NULL: u16 = 0x0010;
const TPM_ALG_ECC: u16 = 0x0023;
const TPM_ALG_CFB: u16 = 0x0043;
const TPM_ECC_NIST_P256: u16 = 0x0003;

const TPM_SE_POLICY: u8 = 0x01;

/// fixedTPM | fixedParent | sensitiveDataOrigin | userWithAuth | restricted
/// | decrypt | noDA: the storage-key template clevis creates primaries with
const PRIMARY_ATTRS: u32 = 0x0003_0472;

#[derive(Debug, Deserialize)]
struct Tpm2Config {
    #[serde(default = "default_hash")]
    hash: String,
    #[serde(default = "default_key")]
    key: String,
    jwk_pub: String,
    jwk_priv: String,
    #[serde(default)]
    pcr_bank: Option<String>,
    #[serde(default)]
    pcr_ids: Option<serde_json::Value>,
}

fn default_hash() -> String {
    "sha256".to_string()
}

fn default_key() -> String {
    "ecc".to_string()
}

#[derive(Debug, Deserialize)]
struct SealedJwk {
    k: String,
}

/// Recover the CEK for a tpm2-bound JWE. Blocking TPM I/O, so call it from
/// a blocking task.
pub fn recover(jwe: &Jwe) -> Result<Vec<u8>> {
    let config: Tpm2Config =
        serde_json::from_value(jwe.clevis()?.get("tpm2").context("no tpm2 config")?.clone())
            .context("malformed tpm2 config")?;

    let sealed_pub = b64url_decode(&config.jwk_pub).context("malformed jwk_pub")?;
    let sealed_priv = b64url_decode(&config.jwk_priv).context("malformed jwk_priv")?;

    let mut tpm = open_tpm()?;

    let name_alg = alg_id(&config.hash)?;
    let primary = create_primary(&mut tpm, name_alg, &config.key)?;
    let result = (|| {
        let object = load(&mut tpm, primary, &sealed_priv, &sealed_pub)?;
        let unsealed = (|| {
            let session = match pcr_selection(&config)? {
                Some((bank, pcrs)) => {
                    let session = start_policy_session(&mut tpm)?;
                    if let Err(e) = policy_pcr(&mut tpm, session, bank, &pcrs) {
                        flush(&mut tpm, session);
                        return Err(e);
                    }
                    Some(session)
                }
                None => None,
            };
            let unsealed = unseal(&mut tpm, object, session);
            if let Some(session) = session {
                flush(&mut tpm, session);
            }
            unsealed
        })();
        flush(&mut tpm, object);
        unsealed
    })();
    flush(&mut tpm, primary);

    let unsealed = result?;
    let jwk: SealedJwk =
        serde_json::from_slice(&unsealed).context("unsealed data is not a jwk")?;
    b64url_decode(&jwk.k).context("unsealed jwk has a malformed key")
}

fn open_tpm() -> Result<File> {
    for dev in TPM_DEVICES {
        if let Ok(file) = OpenOptions::new().read(true).write(true).open(dev) {
            debug!("using tpm device {}", dev);
            return Ok(file);
        }
    }
    bail!("no tpm device available")
}

fn alg_id(name: &str) -> Result<u16> {
    match name {
        "sha1" => Ok(TPM_ALG_SHA1),
        "sha256" => Ok(TPM_ALG_SHA256),
        other => bail!("unsupported tpm hash {}", other),
    }
}

fn pcr_selection(config: &Tpm2Config) -> Result<Option<(u16, Vec<u8>)>> {
    let Some(ids) = &config.pcr_ids else {
        return Ok(None);
    };
    let list: Vec<u32> = match ids {
        serde_json::Value::String(s) if s.is_empty() => return Ok(None),
        serde_json::Value::String(s) => s
            .split(',')
            .map(|i| i.trim().parse().context("malformed pcr id"))
            .collect::<Result<_>>()?,
        serde_json::Value::Array(items) => items
            .iter()
            .map(|i| i.as_u64().map(|v| v as u32).context("malformed pcr id"))
            .collect::<Result<_>>()?,
        _ => bail!("malformed pcr_ids"),
    };
    if list.is_empty() {
        return Ok(None);
    }
    let bank = alg_id(config.pcr_bank.as_deref().unwrap_or("sha256"))?;
    Ok(Some((bank, list.iter().fold(vec![0u8; 3], |mut acc, id| {
        acc[(*id / 8) as usize] |= 1u8 << (id % 8);
        acc
    }))))
}

// ---- command marshalling ----

struct CommandBuf(Vec<u8>);

impl CommandBuf {
    fn new(tag: u16, cc: u32) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&tag.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // size, patched in finish()
        buf.extend_from_slice(&cc.to_be_bytes());
        CommandBuf(buf)
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.0.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.0.extend_from_slice(data);
        self
    }

    /// size-prefixed TPM2B buffer
    fn tpm2b(&mut self, data: &[u8]) -> &mut Self {
        self.u16(data.len() as u16);
        self.bytes(data)
    }

    /// empty-password authorization area
    fn password_auth(&mut self) -> &mut Self {
        let auth_len: u32 = 4 + 2 + 1 + 2;
        self.u32(auth_len);
        self.u32(TPM_RS_PW);
        self.u16(0); // nonce
        self.u8(0x01); // continueSession
        self.u16(0) // empty hmac
    }

    /// policy-session authorization area
    fn session_auth(&mut self, session: u32) -> &mut Self {
        let auth_len: u32 = 4 + 2 + 1 + 2;
        self.u32(auth_len);
        self.u32(session);
        self.u16(0);
        self.u8(0x01);
        self.u16(0)
    }

    fn finish(mut self) -> Vec<u8> {
        let size = (self.0.len() as u32).to_be_bytes();
        self.0[2..6].copy_from_slice(&size);
        self.0
    }
}

fn transact(tpm: &mut File, command: Vec<u8>) -> Result<Vec<u8>> {
    tpm.write_all(&command).context("tpm write failed")?;
    let mut response = vec![0u8; 4096];
    let len = tpm.read(&mut response).context("tpm read failed")?;
    if len < 10 {
        bail!("short tpm response ({} bytes)", len);
    }
    response.truncate(len);

    let rc = u32::from_be_bytes(response[6..10].try_into().unwrap());
    if rc != 0 {
        bail!("tpm command failed with rc {:#x}", rc);
    }
    Ok(response)
}

fn create_primary(tpm: &mut File, name_alg: u16, key_type: &str) -> Result<u32> {
    let mut template = Vec::new();
    match key_type {
        "ecc" => {
            template.extend_from_slice(&TPM_ALG_ECC.to_be_bytes());
            template.extend_from_slice(&name_alg.to_be_bytes());
            template.extend_from_slice(&PRIMARY_ATTRS.to_be_bytes());
            template.extend_from_slice(&0u16.to_be_bytes()); // authPolicy
            template.extend_from_slice(&TPM_ALG_AES.to_be_bytes());
            template.extend_from_slice(&128u16.to_be_bytes());
            template.extend_from_slice(&TPM_ALG_CFB.to_be_bytes());
            template.extend_from_slice(&TPM_ALG_NULL.to_be_bytes()); // scheme
            template.extend_from_slice(&TPM_ECC_NIST_P256.to_be_bytes());
            template.extend_from_slice(&TPM_ALG_NULL.to_be_bytes()); // kdf
            template.extend_from_slice(&0u16.to_be_bytes()); // unique.x
            template.extend_from_slice(&0u16.to_be_bytes()); // unique.y
        }
        "rsa" => {
            template.extend_from_slice(&TPM_ALG_RSA.to_be_bytes());
            template.extend_from_slice(&name_alg.to_be_bytes());
            template.extend_from_slice(&PRIMARY_ATTRS.to_be_bytes());
            template.extend_from_slice(&0u16.to_be_bytes());
            template.extend_from_slice(&TPM_ALG_AES.to_be_bytes());
            template.extend_from_slice(&128u16.to_be_bytes());
            template.extend_from_slice(&TPM_ALG_CFB.to_be_bytes());
            template.extend_from_slice(&TPM_ALG_NULL.to_be_bytes());
            template.extend_from_slice(&2048u16.to_be_bytes());
            template.extend_from_slice(&0u32.to_be_bytes()); // exponent
            template.extend_from_slice(&0u16.to_be_bytes()); // unique
        }
        other => bail!("unsupported tpm primary key type {}", other),
    }

    let mut cmd = CommandBuf::new(TPM_ST_SESSIONS, TPM_CC_CREATE_PRIMARY);
    cmd.u32(TPM_RH_OWNER);
    cmd.password_auth();
    // inSensitive: empty userAuth + empty data
    cmd.u16(4).u16(0).u16(0);
    cmd.tpm2b(&template);
    cmd.u16(0); // outsideInfo
    cmd.u32(0); // creationPCR

    let response = transact(tpm, cmd.finish())?;
    if response.len() < 14 {
        bail!("short CreatePrimary response");
    }
    Ok(u32::from_be_bytes(response[10..14].try_into().unwrap()))
}

fn load(tpm: &mut File, parent: u32, sealed_priv: &[u8], sealed_pub: &[u8]) -> Result<u32> {
    let mut cmd = CommandBuf::new(TPM_ST_SESSIONS, TPM_CC_LOAD);
    cmd.u32(parent);
    cmd.password_auth();
    // jwk_pub/jwk_priv already carry their TPM2B size prefixes
    cmd.bytes(sealed_priv);
    cmd.bytes(sealed_pub);

    let response = transact(tpm, cmd.finish())?;
    if response.len() < 14 {
        bail!("short Load response");
    }
    Ok(u32::from_be_bytes(response[10..14].try_into().unwrap()))
}

fn start_policy_session(tpm: &mut File) -> Result<u32> {
    let mut cmd = CommandBuf::new(TPM_ST_NO_SESSIONS, TPM_CC_START_AUTH_SESSION);
    cmd.u32(TPM_RH_NULL); // tpmKey
    cmd.u32(TPM_RH_NULL); // bind
    cmd.tpm2b(&[0u8; 16]); // nonceCaller
    cmd.u16(0); // encryptedSalt
    cmd.u8(TPM_SE_POLICY);
    cmd.u16(TPM_ALG_NULL); // symmetric
    cmd.u16(TPM_ALG_SHA256); // authHash

    let response = transact(tpm, cmd.finish())?;
    if response.len() < 14 {
        bail!("short StartAuthSession response");
    }
    Ok(u32::from_be_bytes(response[10..14].try_into().unwrap()))
}

fn policy_pcr(tpm: &mut File, session: u32, bank: u16, bitmap: &[u8]) -> Result<()> {
    let mut cmd = CommandBuf::new(TPM_ST_NO_SESSIONS, TPM_CC_POLICY_PCR);
    cmd.u32(session);
    cmd.u16(0); // pcrDigest: let the TPM compute it
    cmd.u32(1); // one selection
    cmd.u16(bank);
    cmd.u8(bitmap.len() as u8);
    cmd.bytes(bitmap);
    transact(tpm, cmd.finish()).map(|_| ())
}

fn unseal(tpm: &mut File, object: u32, session: Option<u32>) -> Result<Vec<u8>> {
    let mut cmd = CommandBuf::new(TPM_ST_SESSIONS, TPM_CC_UNSEAL);
    cmd.u32(object);
    match session {
        Some(session) => cmd.session_auth(session),
        None => cmd.password_auth(),
    };

    let response = transact(tpm, cmd.finish())?;
    // tag(2) size(4) rc(4) paramSize(4) TPM2B outData
    if response.len() < 16 {
        bail!("short Unseal response");
    }
    let data_len = u16::from_be_bytes(response[14..16].try_into().unwrap()) as usize;
    response
        .get(16..16 + data_len)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| anyhow!("truncated Unseal response"))
}

fn flush(tpm: &mut File, handle: u32) {
    let mut cmd = CommandBuf::new(TPM_ST_NO_SESSIONS, TPM_CC_FLUSH_CONTEXT);
    cmd.u32(handle);
    if let Err(e) = transact(tpm, cmd.finish()) {
        debug!("unable to flush tpm handle {:#x}: {:#}", handle, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_framing() {
        let mut cmd = CommandBuf::new(TPM_ST_NO_SESSIONS, TPM_CC_FLUSH_CONTEXT);
        cmd.u32(0x8000_0001);
        let raw = cmd.finish();
        assert_eq!(raw.len(), 14);
        assert_eq!(&raw[0..2], &[0x80, 0x01]);
        assert_eq!(&raw[2..6], &[0, 0, 0, 14]); // patched total size
        assert_eq!(&raw[6..10], &[0, 0, 0x01, 0x65]);
        assert_eq!(&raw[10..14], &[0x80, 0, 0, 0x01]);
    }

    #[test]
    fn test_password_auth_layout() {
        let mut cmd = CommandBuf::new(TPM_ST_SESSIONS, TPM_CC_UNSEAL);
        cmd.u32(0x8000_0002);
        cmd.password_auth();
        let raw = cmd.finish();
        // header(10) + handle(4) + authSize(4) + auth(9)
        assert_eq!(raw.len(), 27);
        assert_eq!(&raw[14..18], &[0, 0, 0, 9]);
        assert_eq!(&raw[18..22], &TPM_RS_PW.to_be_bytes());
        assert_eq!(raw[24], 0x01); // continueSession
    }

    #[test]
    fn test_pcr_selection_bitmap() {
        let config = Tpm2Config {
            hash: "sha256".into(),
            key: "ecc".into(),
            jwk_pub: String::new(),
            jwk_priv: String::new(),
            pcr_bank: Some("sha256".into()),
            pcr_ids: Some(serde_json::json!("7")),
        };
        let (bank, bitmap) = pcr_selection(&config).unwrap().unwrap();
        assert_eq!(bank, TPM_ALG_SHA256);
        assert_eq!(bitmap, vec![0b1000_0000, 0, 0]);

        let config = Tpm2Config {
            pcr_ids: Some(serde_json::json!([0, 8, 16])),
            ..config
        };
        let (_, bitmap) = pcr_selection(&config).unwrap().unwrap();
        assert_eq!(bitmap, vec![1, 1, 1]);
    }

    #[test]
    fn test_no_pcr_ids_means_no_policy() {
        let config = Tpm2Config {
            hash: "sha256".into(),
            key: "ecc".into(),
            jwk_pub: String::new(),
            jwk_priv: String::new(),
            pcr_bank: None,
            pcr_ids: None,
        };
        assert!(pcr_selection(&config).unwrap().is_none());
    }

    #[test]
    fn test_config_defaults() {
        let config: Tpm2Config = serde_json::from_value(serde_json::json!({
            "jwk_pub": "cHVi",
            "jwk_priv": "cHJpdg"
        }))
        .unwrap();
        assert_eq!(config.hash, "sha256");
        assert_eq!(config.key, "ecc");
    }
}
