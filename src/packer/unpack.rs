//! Offline decoder for `no_exec` payloads.
//!
//! Replays what the runtime stub does for each level, so a packed body can be
//! inspected or checked without a PowerShell host.

use super::KEY_LEN;
use crate::cipher::{lcg_key, xor_in_place};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use regex::Regex;
use std::io::Read;
use std::sync::LazyLock;

static RE_CHAR_JOIN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\$\(-join \(\(([0-9,]*)\) \|").unwrap());
static RE_FRAGMENTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@\('((?:[^']|'')*(?:','(?:[^']|'')*)*)'\); '((?:[^']|'')*)'; (\d+)$").unwrap());

fn bad(level: u8, what: impl std::fmt::Display) -> Error {
    Error::Packer(format!("cannot decode level {level} payload: {what}"))
}

fn utf8(level: u8, bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| bad(level, e))
}

fn gunzip(level: u8, bytes: &[u8]) -> Result<String> {
    let mut out = String::new();
    GzDecoder::new(bytes).read_to_string(&mut out).map_err(|e| bad(level, e))?;
    Ok(out)
}

/// Decode a payload produced by [`super::pack`] with `no_exec` set.
pub fn decode(level: u8, payload: &str) -> Result<String> {
    match level {
        1 if payload.trim() == "''" => Ok(String::new()),
        1 => {
            let caps = RE_CHAR_JOIN.captures(payload).ok_or_else(|| bad(1, "not a character join"))?;
            caps[1]
                .split(',')
                .filter(|c| !c.is_empty())
                .map(|c| {
                    c.parse::<u32>()
                        .ok()
                        .and_then(char::from_u32)
                        .ok_or_else(|| bad(1, format!("invalid code point '{c}'")))
                })
                .collect()
        }
        2 | 3 => utf8(level, STANDARD.decode(payload.trim()).map_err(|e| bad(level, e))?),
        4 => {
            let gz = STANDARD.decode(payload.trim()).map_err(|e| bad(4, e))?;
            gunzip(4, &gz)
        }
        5 => {
            let caps = RE_FRAGMENTS.captures(payload.trim()).ok_or_else(|| bad(5, "not a fragment list"))?;
            let fragments: Vec<String> = caps[1].split("','").map(|f| f.replace("''", "'")).collect();
            let order = STANDARD.decode(caps[2].replace("''", "'")).map_err(|e| bad(5, e))?;
            let seed: i64 = caps[3].parse().map_err(|e| bad(5, e))?;
            if order.len() != fragments.len() {
                return Err(bad(5, format!("{} fragments but {} order entries", fragments.len(), order.len())));
            }
            let mut inv = vec![0usize; order.len()];
            for (i, &o) in order.iter().enumerate() {
                let slot = inv.get_mut(usize::from(o)).ok_or_else(|| bad(5, "order index out of range"))?;
                *slot = i;
            }
            let joined: String = inv.iter().map(|&i| fragments[i].as_str()).collect();
            let mut bytes = STANDARD.decode(joined).map_err(|e| bad(5, e))?;
            xor_in_place(&mut bytes, &lcg_key(seed, KEY_LEN));
            gunzip(5, &bytes)
        }
        other => Err(Error::Packer(format!("unsupported level: {other} (valid 1..5)"))),
    }
}

#[cfg(test)]
mod tests {
    use super::super::{pack, PackerConfig};
    use super::*;
    use crate::rng::RunRng;

    fn packed(body: &str, level: u8, seed: i64) -> String {
        let cfg = PackerConfig { level, no_exec: true, ..PackerConfig::default() };
        pack(body, &cfg, &mut RunRng::from_seed(seed, true)).unwrap()
    }

    #[test]
    fn safe_mode_round_trip_all_levels() {
        let body = "param($n)\n$h = @'\n it's raw\n'@\nWrite-Output \"héllo $n 😀\" # done\r\n";
        for level in 1..=5 {
            for seed in [1, 42, 977] {
                assert_eq!(decode(level, &packed(body, level, seed)).unwrap(), body, "level {level} seed {seed}");
            }
        }
    }

    #[test]
    fn level5_reassembles_many_fragments() {
        let body = RunRng::from_seed(5, true).ident(6_000);
        let cfg = PackerConfig { level: 5, min_frag: 5, max_frag: 14, no_exec: true, ..PackerConfig::default() };
        let out = pack(&body, &cfg, &mut RunRng::from_seed(8, true)).unwrap();
        assert!(out.split("','").count() > 100);
        assert_eq!(decode(5, &out).unwrap(), body);
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode(1, "Write-Output 1").is_err());
        assert!(decode(4, "not base64!").is_err());
        assert!(decode(5, "@('QQ=='); 'AAE='; 1").is_err());
        assert!(matches!(decode(9, ""), Err(Error::Packer(_))));
    }
}
