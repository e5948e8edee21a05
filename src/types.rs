use std::fmt::{self, Debug, Display};

use zeroize::{Zeroize, ZeroizeOnDrop};

/// A secret used to unlock a LUKS key slot. Wiped from memory on drop and
/// never printed by any formatting impl.
#[derive(Zeroize, ZeroizeOnDrop, Clone, PartialEq, Eq)]
pub struct Passphrase(Vec<u8>);

impl Passphrase {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl From<Vec<u8>> for Passphrase {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&str> for Passphrase {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// A LUKS volume master key, recovered from a key slot. Same handling rules
/// as [`Passphrase`].
#[derive(Zeroize, ZeroizeOnDrop, Clone)]
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    pub fn new(len: usize) -> Self {
        Self(vec![0u8; len])
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        self.0.as_mut_slice()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl From<Vec<u8>> for MasterKey {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Filesystem or container UUID as stored in a superblock.
///
/// Regular filesystems carry 16 bytes in RFC-4122 order, an MBR disk is
/// identified by its 4-byte signature.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BlkUuid(Vec<u8>);

impl BlkUuid {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Parse the canonical `8-4-4-4-12` text form, or plain hex for the
    /// 4-byte MBR signature.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let hex_str: String = s.chars().filter(|c| *c != '-').collect();
        let bytes =
            hex::decode(&hex_str).map_err(|e| anyhow::anyhow!("invalid uuid {:?}: {}", s, e))?;
        if bytes.len() != 16 && bytes.len() != 4 {
            anyhow::bail!("invalid uuid {:?}: unexpected length {}", s, bytes.len());
        }
        Ok(Self(bytes))
    }

    fn write_canonical(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() == 16 {
            write!(
                f,
                "{}-{}-{}-{}-{}",
                hex::encode(&self.0[0..4]),
                hex::encode(&self.0[4..6]),
                hex::encode(&self.0[6..8]),
                hex::encode(&self.0[8..10]),
                hex::encode(&self.0[10..16]),
            )
        } else {
            f.write_str(&hex::encode(&self.0))
        }
    }
}

impl Display for BlkUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_canonical(f)
    }
}

impl Debug for BlkUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_canonical(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_roundtrip() {
        let u = BlkUuid::parse("5c92fc66-7315-408b-b652-176dc554d370").unwrap();
        assert_eq!(u.to_string(), "5c92fc66-7315-408b-b652-176dc554d370");

        let mbr = BlkUuid::parse("2beab180").unwrap();
        assert_eq!(mbr.as_bytes(), &[0x2b, 0xea, 0xb1, 0x80]);
        assert_eq!(mbr.to_string(), "2beab180");
    }

    #[test]
    fn test_uuid_bad_input() {
        assert!(BlkUuid::parse("zz92fc66-7315-408b-b652-176dc554d370").is_err());
        assert!(BlkUuid::parse("5c92fc66").is_err());
    }

    #[test]
    fn test_passphrase_redacted() {
        let p = Passphrase::from("hunter2");
        assert_eq!(format!("{:?}", p), "Passphrase(<redacted>)");
    }
}
