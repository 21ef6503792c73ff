//! Packer: turns the rewritten body into a self-decoding stub.
//!
//! | Level | Payload                                                   |
//! |-------|-----------------------------------------------------------|
//! | 1     | character codes joined at runtime                         |
//! | 2     | Base64 of the UTF-8 bytes                                 |
//! | 3     | Base64 decoded through an intermediate byte variable      |
//! | 4     | gzip + Base64, inflated through `GzipStream`              |
//! | 5     | gzip + XOR (seed-derived key) + Base64 + shuffled fragments |
//!
//! Every stub starts with the UTF-8 console preamble and re-enters the body
//! through `& ([scriptblock]::Create($v))`, splatting the caller's arguments.

pub mod unpack;

use crate::cipher::{integrity_code, lcg_key, xor_in_place, INTEGRITY_MASK};
use crate::error::{Error, Result};
use crate::rng::RunRng;
use crate::snippet;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use tracing::debug;

const PREAMBLE: &str = "[Console]::OutputEncoding = [Text.Encoding]::UTF8; $OutputEncoding = [Text.Encoding]::UTF8; ";

/// Order indices are stored one byte each.
pub const MAX_FRAGMENTS: usize = 256;

/// Length of the level-5 XOR key.
pub const KEY_LEN: usize = 32;

/// Fixed for the run, derived from the caller options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackerConfig {
    pub level: u8,
    pub min_frag: usize,
    pub max_frag: usize,
    pub integrity: bool,
    pub exec_wrapper: bool,
    pub no_exec: bool,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self { level: 5, min_frag: 10, max_frag: 20, integrity: false, exec_wrapper: true, no_exec: false }
    }
}

fn exec_form(var: &str) -> String {
    exec_form_splat(var, "args")
}

fn exec_form_splat(var: &str, splat: &str) -> String {
    format!("& ([scriptblock]::Create(${var})) @{splat}")
}

/// Put `exec` into one of the five call shapes. Every shape hands the
/// caller's `$args` to the outermost invocation.
fn call_template(template: usize, run: &str, noise: &str, rng: &mut RunRng, wrapper: bool) -> String {
    // ForEach-Object bodies see their own empty $args
    let captured = (template == 3).then(|| rng.var_name(5));
    let mut exec = exec_form_splat(run, captured.as_deref().unwrap_or("args"));
    if !noise.is_empty() {
        exec = format!("{noise}; {exec}");
    }
    if wrapper {
        exec = snippet::wrap_opaque(rng, &exec);
    }
    match (template, captured) {
        (1, _) => format!("& {{ {exec} }} @args"),
        (3, Some(a)) => format!("${a} = $args; @(1) | ForEach-Object {{ {exec} }}"),
        (4, _) => format!("try {{ {exec} }} catch {{ }}"),
        _ => exec,
    }
}

/// `$(-join ((codes) | ...))`, expanding code points above the BMP.
///
/// An empty body is `''`; PowerShell rejects an empty `()`.
pub fn char_join(body: &str) -> String {
    if body.is_empty() {
        return "''".to_string();
    }
    let codes: Vec<String> = body.chars().map(|c| (c as u32).to_string()).collect();
    format!(
        "$(-join (({}) | ForEach-Object {{ if ($_ -le 65535) {{ [char]$_ }} else {{ [char]::ConvertFromUtf32($_) }} }}))",
        codes.join(",")
    )
}

/// Runtime expression building `s` from its character codes.
fn char_codes_expr(s: &str) -> String {
    let codes: Vec<String> = s.chars().map(|c| (c as u32).to_string()).collect();
    format!("-join ([char[]]({}))", codes.join(","))
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).map_err(|e| Error::Packer(format!("gzip write: {e}")))?;
    enc.finish().map_err(|e| Error::Packer(format!("gzip finish: {e}")))
}

/// Split `s` into pieces of `min..=max` bytes, the last one possibly shorter.
///
/// `s` is Base64, so every split point is a char boundary.
pub fn fragment(s: &str, min: usize, max: usize, rng: &mut RunRng) -> Vec<String> {
    let min = min.max(1);
    let max = if max < min { min + 6 } else { max };
    let mut out = Vec::new();
    let mut i = 0;
    while i < s.len() {
        let size = rng.range(min, max);
        let end = (i + size).min(s.len());
        out.push(s[i..end].to_string());
        i = end;
    }
    out
}

/// Build the stub for `body` at `cfg.level`.
pub fn pack(body: &str, cfg: &PackerConfig, rng: &mut RunRng) -> Result<String> {
    let run = rng.var_name(6);
    let out = match cfg.level {
        1 => {
            let payload = char_join(body);
            if cfg.no_exec {
                return Ok(payload);
            }
            format!("${run} = {payload}; {}", exec_form(&run))
        }
        2 => {
            let enc = STANDARD.encode(body.as_bytes());
            if cfg.no_exec {
                return Ok(enc);
            }
            format!(
                "${run} = [Text.Encoding]::UTF8.GetString([Convert]::FromBase64String('{enc}')); {}",
                exec_form(&run)
            )
        }
        3 => {
            let e = rng.var_name(4);
            let enc = STANDARD.encode(body.as_bytes());
            if cfg.no_exec {
                return Ok(enc);
            }
            format!(
                "${e} = [Convert]::FromBase64String('{enc}'); ${run} = [Text.Encoding]::UTF8.GetString(${e}); {}",
                exec_form(&run)
            )
        }
        4 => {
            let enc = STANDARD.encode(gzip(body.as_bytes())?);
            if cfg.no_exec {
                return Ok(enc);
            }
            let (c, b) = (rng.var_name(6), rng.var_name(5));
            let (ms, gz, sr) = (rng.var_name(4), rng.var_name(4), rng.var_name(4));
            format!(
                "${c} = '{enc}'; ${b} = [Convert]::FromBase64String(${c}); \
                 ${ms} = New-Object IO.MemoryStream(,${b}); \
                 ${gz} = New-Object IO.Compression.GzipStream(${ms},[IO.Compression.CompressionMode]::Decompress); \
                 ${sr} = New-Object IO.StreamReader(${gz},[Text.Encoding]::UTF8); \
                 ${run} = ${sr}.ReadToEnd(); {}",
                exec_form(&run)
            )
        }
        5 => return level5(body, cfg, &run, rng),
        other => return Err(Error::Packer(format!("unsupported level: {other} (valid 1..5)"))),
    };
    Ok(format!("{PREAMBLE}{out}"))
}

/// Encrypted, fragmented payload before it is rendered.
struct Shuffled {
    seed: i64,
    fragments: Vec<String>,
    order_b64: String,
}

fn encrypt_and_shuffle(body: &str, cfg: &PackerConfig, rng: &mut RunRng) -> Result<Shuffled> {
    let mut payload = gzip(body.as_bytes())?;
    let seed = rng.int63() & 0x7FFF_FFFF;
    xor_in_place(&mut payload, &lcg_key(seed, KEY_LEN));
    let enc = STANDARD.encode(&payload);

    let (mut min, mut max) = (cfg.min_frag, cfg.max_frag);
    let floor = enc.len().div_ceil(MAX_FRAGMENTS);
    if floor > min {
        min = floor;
        if max < min {
            max = min + 10;
        }
    }
    let frags = fragment(&enc, min, max, rng);
    if frags.is_empty() {
        return Err(Error::Packer("fragmentation produced no fragments".into()));
    }
    if frags.len() > MAX_FRAGMENTS {
        return Err(Error::Packer(format!(
            "too many fragments for order encoding ({} > {MAX_FRAGMENTS})",
            frags.len()
        )));
    }

    let mut order: Vec<usize> = (0..frags.len()).collect();
    rng.shuffle(&mut order);
    let fragments = order.iter().map(|&o| frags[o].clone()).collect();
    let order_bytes: Vec<u8> = order.iter().map(|&o| o as u8).collect();
    debug!(fragments = order.len(), min, max, "payload fragmented");
    Ok(Shuffled { seed, fragments, order_b64: STANDARD.encode(order_bytes) })
}

fn level5(body: &str, cfg: &PackerConfig, run: &str, rng: &mut RunRng) -> Result<String> {
    let Shuffled { seed, fragments, order_b64 } = encrypt_and_shuffle(body, cfg, rng)?;
    let array = format!("@('{}')", fragments.iter().map(|f| f.replace('\'', "''")).collect::<Vec<_>>().join("','"));
    let order_b64 = order_b64.replace('\'', "''");
    if cfg.no_exec {
        return Ok(format!("{array}; '{order_b64}'; {seed}"));
    }
    let n = fragments.len();

    let f = rng.var_name(6);
    let order_bytes = rng.var_name(5);
    let inv = rng.var_name(5);
    let c = rng.var_name(6);
    let b = rng.var_name(5);
    let k = rng.var_name(5);
    let s = rng.mixed_state_name();
    let m = rng.var_name(4);
    let (ms, gz, sr) = (rng.var_name(4), rng.var_name(4), rng.var_name(4));
    let i = rng.var_name(4);

    let integrity = if cfg.integrity {
        let (h, mask, alg, bytes, actual) =
            (rng.var_name(4), rng.var_name(4), rng.var_name(4), rng.var_name(4), rng.var_name(4));
        let stored = integrity_code(body) ^ INTEGRITY_MASK;
        format!(
            "${h} = {stored}; ${mask} = {INTEGRITY_MASK}; \
             ${alg} = [System.Security.Cryptography.SHA256]::Create(); \
             ${bytes} = ${alg}.ComputeHash([System.Text.Encoding]::UTF8.GetBytes(${run})); \
             ${actual} = [BitConverter]::ToInt32(${bytes}, 0); \
             if(${actual} -ne (${h} -bxor ${mask})){{ ${run} = '' }}; "
        )
    } else {
        String::new()
    };

    let decoy = rng.buffer_name();
    let mut fake_seed = rng.int63() & 0x7FFF_FFFF;
    if fake_seed == seed {
        fake_seed = (fake_seed + 1) & 0x7FFF_FFFF;
    }

    let key_derive = format!(
        "${k} = New-Object byte[] {KEY_LEN}; ${s} = {seed} -band 0x7FFFFFFF; \
         0..{last_key} | ForEach-Object {{ ${s} = (([long]${s} * 1103515245 + 12345) -band 0x7FFFFFFF); \
         ${k}[$_] = [byte]((${s} -shr 16) -band 0xFF) }}",
        last_key = KEY_LEN - 1
    );
    let decode_order = format!(
        "${m} = {}; ${order_bytes} = [Convert].GetMethod(${m}, [Type[]]@([string])).Invoke($null, @('{order_b64}'))",
        char_codes_expr("FromBase64String")
    );

    let noise1 = snippet::noise_block(rng, 3);
    let noise2 = snippet::noise_block(rng, 3);
    let noise_exec = snippet::noise_block(rng, 2);
    let template = rng.intn(5);
    let exec = call_template(template, run, &noise_exec, rng, cfg.exec_wrapper);

    let (first, second) = if rng.intn(2) == 0 { (key_derive, decode_order) } else { (decode_order, key_derive) };
    let sep = |noise: &str| if noise.is_empty() { "; ".to_string() } else { format!("; {noise}; ") };

    let last = n - 1;
    let join = if template == 2 {
        let mid = rng.var_name(5);
        format!("${mid} = -join (0..{last} | ForEach-Object {{ ${f}[${inv}[$_]] }}); ${c} = ${mid}")
    } else {
        format!("${c} = -join (0..{last} | ForEach-Object {{ ${f}[${inv}[$_]] }})")
    };
    debug!(template, integrity = cfg.integrity, wrapper = cfg.exec_wrapper, "level 5 stub");

    Ok(format!(
        "{PREAMBLE}${f} = {array}; ${decoy} = {fake_seed}{sep1}{first}{sep2}{second}; \
         ${inv} = New-Object int[] {n}; 0..{last} | ForEach-Object {{ ${inv}[${order_bytes}[$_]] = $_ }}; \
         {join}; \
         ${b} = [Convert].GetMethod(${m}, [Type[]]@([string])).Invoke($null, @(${c})); \
         for(${i}=0;${i} -lt ${b}.Length;${i}++){{ ${b}[${i}] = ${b}[${i}] -bxor ${k}[${i}%${k}.Length] }}; \
         ${ms} = New-Object IO.MemoryStream(,${b}); \
         ${gz} = New-Object IO.Compression.GzipStream(${ms},[IO.Compression.CompressionMode]::Decompress); \
         ${sr} = New-Object IO.StreamReader(${gz},[Text.Encoding]::UTF8); \
         ${run} = ${sr}.ReadToEnd(); {integrity}{exec}",
        sep1 = sep(&noise1),
        sep2 = sep(&noise2),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "Write-Output 'Hello'; $x = 1 + 1; Write-Output $x";

    fn cfg(level: u8) -> PackerConfig {
        PackerConfig { level, ..PackerConfig::default() }
    }

    #[test]
    fn every_level_has_preamble_and_exec_form() {
        for level in 1..=5 {
            let out = pack(BODY, &cfg(level), &mut RunRng::from_seed(42, true)).unwrap();
            assert!(out.starts_with(PREAMBLE), "level {level}: {out}");
            assert!(out.contains("[scriptblock]::Create($"), "level {level}: {out}");
            assert!(out.contains(")) @"), "level {level}: {out}");
        }
    }

    #[test]
    fn unsupported_level() {
        let err = pack(BODY, &cfg(6), &mut RunRng::from_seed(1, true)).unwrap_err();
        assert!(matches!(err, Error::Packer(_)), "Got: {err}");
        assert!(pack(BODY, &cfg(0), &mut RunRng::from_seed(1, true)).is_err());
    }

    #[test]
    fn level1_handles_astral_chars() {
        let out = char_join("a😀");
        assert!(out.contains("((97,128512) |"), "Got: {out}");
        assert!(out.contains("ConvertFromUtf32"), "Got: {out}");
    }

    #[test]
    fn empty_body_packs_at_every_level() {
        assert_eq!(char_join(""), "''");
        for level in 1..=5 {
            let out = pack("", &cfg(level), &mut RunRng::from_seed(5, true)).unwrap();
            assert!(!out.contains("(()"), "level {level}: {out}");
            let payload = pack("", &PackerConfig { no_exec: true, ..cfg(level) }, &mut RunRng::from_seed(5, true)).unwrap();
            assert_eq!(unpack::decode(level, &payload).unwrap(), "", "level {level}");
        }
    }

    #[test]
    fn level5_hides_method_name() {
        let out = pack(BODY, &cfg(5), &mut RunRng::from_seed(42, true)).unwrap();
        assert!(!out.contains("FromBase64String"), "Got: {out}");
        assert!(out.contains("-join ([char[]](70,114,111,109"), "Got: {out}");
        assert!(out.contains("1103515245"), "Got: {out}");
    }

    #[test]
    fn level5_is_deterministic() {
        let a = pack(BODY, &cfg(5), &mut RunRng::from_seed(42, true)).unwrap();
        let b = pack(BODY, &cfg(5), &mut RunRng::from_seed(42, true)).unwrap();
        assert_eq!(a, b);
        let c = pack(BODY, &cfg(5), &mut RunRng::from_seed(43, true)).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn level5_integrity_block() {
        let mut with = cfg(5);
        with.integrity = true;
        let out = pack(BODY, &with, &mut RunRng::from_seed(7, true)).unwrap();
        assert!(out.contains("SHA256"), "Got: {out}");
        assert!(out.contains(&format!("= {};", integrity_code(BODY) ^ INTEGRITY_MASK)), "Got: {out}");
        assert!(out.contains("= '' }"), "Got: {out}");
        let without = pack(BODY, &cfg(5), &mut RunRng::from_seed(7, true)).unwrap();
        assert!(!without.contains("SHA256"));
    }

    /// Offset of the `}` closing the `{` at `open`.
    fn closing(s: &str, open: usize) -> usize {
        let mut depth = 0;
        for (i, b) in s.bytes().enumerate().skip(open) {
            match b {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return i;
                    }
                }
                _ => {}
            }
        }
        panic!("unbalanced stub: {s}");
    }

    /// Every scriptblock enclosing the final exec call passes the caller's arguments on.
    fn assert_args_forwarded(stub: &str) {
        let call = stub.rfind("[scriptblock]::Create(").unwrap();
        let splat = &stub[call..];
        let splat = &splat[splat.find(")) @").unwrap() + 4..];
        let splat: String = splat.chars().take_while(|c| c.is_ascii_alphanumeric()).collect();

        let mut open = Vec::new();
        for (i, b) in stub[..call].bytes().enumerate() {
            match b {
                b'{' => open.push(i),
                b'}' => {
                    open.pop();
                }
                _ => {}
            }
        }
        let mut in_foreach = false;
        for &o in &open {
            let before = stub[..o].trim_end();
            if before.ends_with('&') {
                assert!(stub[closing(stub, o) + 1..].starts_with(" @args"), "Got: {stub}");
            } else if before.ends_with("ForEach-Object") {
                in_foreach = true;
            }
        }
        if in_foreach {
            assert_ne!(splat, "args", "Got: {stub}");
            assert!(stub.contains(&format!("${splat} = $args;")), "Got: {stub}");
        } else {
            assert_eq!(splat, "args", "Got: {stub}");
        }
    }

    #[test]
    fn call_templates_forward_arguments() {
        for template in 0..5 {
            for wrapper in [false, true] {
                let out = call_template(template, "v", "", &mut RunRng::from_seed(4, true), wrapper);
                assert_args_forwarded(&out);
            }
        }
        let nested = call_template(1, "v", "", &mut RunRng::from_seed(4, true), false);
        assert_eq!(nested, "& { & ([scriptblock]::Create($v)) @args } @args");
    }

    #[test]
    fn level5_stub_forwards_arguments_for_every_seed() {
        let body = "param($a) Write-Output $a";
        for seed in 0..40 {
            for wrapper in [false, true] {
                let c = PackerConfig { exec_wrapper: wrapper, ..cfg(5) };
                let out = pack(body, &c, &mut RunRng::from_seed(seed, true)).unwrap();
                assert_args_forwarded(&out);
            }
        }
    }

    #[test]
    fn fragments_respect_bounds() {
        let mut rng = RunRng::from_seed(3, true);
        let s = "A".repeat(500);
        let frags = fragment(&s, 10, 20, &mut rng);
        assert_eq!(frags.concat(), s);
        for f in &frags[..frags.len() - 1] {
            assert!((10..=20).contains(&f.len()), "Got: {}", f.len());
        }
    }

    #[test]
    fn fragment_floor_keeps_count_under_limit() {
        let body = RunRng::from_seed(1, true).ident(40_000);
        let mut small = cfg(5);
        small.min_frag = 1;
        small.max_frag = 2;
        small.no_exec = true;
        let out = pack(&body, &small, &mut RunRng::from_seed(9, true)).unwrap();
        let count = out.split("','").count();
        assert!(count <= MAX_FRAGMENTS, "Got: {count}");
    }
}
