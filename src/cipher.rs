//! Byte ciphers shared by literal encryption and the level-5 packer.
//!
//! Each routine here has a PowerShell twin emitted into the output, so the
//! arithmetic must match the runtime decoder byte for byte.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::str::FromStr;

const LCG_MUL: u64 = 1103515245;
const LCG_ADD: u64 = 12345;

/// Mask applied to the stored integrity code so it is not kept in clear.
pub const INTEGRITY_MASK: i32 = 0x5A5A_5A5A;

/// Minimum key length for literal encryption, in bytes.
pub const MIN_KEY_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherKind {
    #[default]
    Xor,
    Rc4,
}

impl FromStr for CipherKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "xor" => Ok(Self::Xor),
            "rc4" => Ok(Self::Rc4),
            other => Err(Error::Config(format!("unknown cipher '{other}' (expected xor or rc4)"))),
        }
    }
}

impl CipherKind {
    pub fn encrypt(self, data: &[u8], key: &[u8]) -> Vec<u8> {
        match self {
            Self::Xor => {
                let mut out = data.to_vec();
                xor_in_place(&mut out, key);
                out
            }
            Self::Rc4 => rc4(data, key),
        }
    }
}

/// Repeating-key XOR. An empty key leaves the data unchanged.
pub fn xor_in_place(data: &mut [u8], key: &[u8]) {
    if key.is_empty() {
        return;
    }
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= key[i % key.len()];
    }
}

/// RC4 keystream applied to `data`. Symmetric.
pub fn rc4(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    let mut s: [u8; 256] = std::array::from_fn(|i| i as u8);
    let mut j = 0usize;
    for i in 0..256 {
        j = (j + s[i] as usize + key[i % key.len()] as usize) % 256;
        s.swap(i, j);
    }
    let (mut i, mut j) = (0usize, 0usize);
    data.iter()
        .map(|&b| {
            i = (i + 1) % 256;
            j = (j + s[i] as usize) % 256;
            s.swap(i, j);
            b ^ s[(s[i] as usize + s[j] as usize) % 256]
        })
        .collect()
}

/// `n` key bytes from the 31-bit LCG seeded with `seed`.
pub fn lcg_key(seed: i64, n: usize) -> Vec<u8> {
    let mut s = (seed & 0x7FFF_FFFF) as u64;
    (0..n)
        .map(|_| {
            s = (s * LCG_MUL + LCG_ADD) & 0x7FFF_FFFF;
            ((s >> 16) & 0xFF) as u8
        })
        .collect()
}

/// First four bytes of SHA-256 over the UTF-8 text, little-endian.
pub fn integrity_code(text: &str) -> i32 {
    let digest = Sha256::digest(text.as_bytes());
    i32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Parse hex key material: even length, at least [`MIN_KEY_BYTES`] bytes.
pub fn parse_hex_key(text: &str) -> Result<Vec<u8>> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::Config("encrypt stage requires a key (hex)".into()));
    }
    if text.len() % 2 != 0 {
        return Err(Error::Config(format!("key must have an even number of hex digits, got {}", text.len())));
    }
    let key = hex::decode(text).map_err(|e| Error::Config(format!("key is not valid hex: {e}")))?;
    if key.len() < MIN_KEY_BYTES {
        return Err(Error::Config(format!(
            "key must be at least {MIN_KEY_BYTES} bytes, got {}",
            key.len()
        )));
    }
    Ok(key)
}
