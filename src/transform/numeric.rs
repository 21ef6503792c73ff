//! Integer literal rewriting: `n` becomes `((0xA -bxor 0xB)-C)`.

use crate::rng::RunRng;
use crate::span::{is_inside_attribute, ScanMap};
use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

static RE_NUM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+").unwrap());
static RE_ENUM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\benum\s+\w+\s*\{").unwrap());

/// Largest value rewritten; keeps `(n + c) ^ b` inside a positive 32-bit hex literal.
pub const MAX_ENCODED: i64 = i32::MAX as i64 - 5;

/// Expression evaluating to `n`.
pub fn encode(n: i64, rng: &mut RunRng) -> String {
    let c = rng.intn(5) as i64 + 1;
    let b = rng.intn(0x7FFF) as i64;
    let a = (n + c) ^ b;
    format!("((0x{a:X} -bxor 0x{b:X})-{c})")
}

fn is_word(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Decimal, range, exponent, hex, suffix, `$1` and redirection neighbours.
fn skip_context(b: &[u8], start: usize, end: usize) -> bool {
    let prev = start.checked_sub(1).map(|i| b[i]);
    let next = b.get(end).copied();
    if prev.is_some_and(|p| is_word(p) || p == b'$' || p == b'.') {
        return true;
    }
    if next.is_some_and(|n| is_word(n) || n == b'.' || n == b'>') {
        return true;
    }
    // 2>&1, <&0
    if start >= 2 && matches!(&b[start - 2..start], b">&" | b"<&") {
        return true;
    }
    // 1e-5
    if start >= 2 && matches!(b[start - 1], b'-' | b'+') && matches!(b[start - 2], b'e' | b'E') {
        return start >= 3 && b[start - 3].is_ascii_digit();
    }
    false
}

fn enum_bodies(text: &str, scan: &ScanMap) -> Vec<Range<usize>> {
    RE_ENUM
        .find_iter(text)
        .filter(|m| scan.is_code(m.start()))
        .filter_map(|m| {
            let open = m.end() - 1;
            scan.find_matching(text, open).map(|close| open..close)
        })
        .collect()
}

/// Rewrite standalone decimal integers in code.
pub fn rewrite(text: &str, rng: &mut RunRng) -> String {
    let scan = ScanMap::new(text);
    let enums = enum_bodies(text, &scan);
    let b = text.as_bytes();
    let mut out = String::with_capacity(text.len() * 2);
    let mut last = 0;
    for m in RE_NUM.find_iter(text) {
        let (start, end) = (m.start(), m.end());
        if !scan.is_code(start) || skip_context(b, start, end) {
            continue;
        }
        if enums.iter().any(|r| r.contains(&start)) || is_inside_attribute(text, start) {
            continue;
        }
        let Ok(n) = m.as_str().parse::<i64>() else { continue };
        if n > MAX_ENCODED {
            continue;
        }
        let encoded = encode(n, rng);
        // A negative argument (`f -3`) needs the sign inside the parentheses
        let negative_arg = start >= 1
            && b[start - 1] == b'-'
            && (start == 1 || matches!(b[start - 2], b' ' | b'\t' | b'(' | b',' | b'=' | b'\n'));
        if negative_arg {
            out.push_str(&text[last..start - 1]);
            out.push_str(&format!("(-{encoded})"));
        } else {
            out.push_str(&text[last..start]);
            out.push_str(&encoded);
        }
        last = end;
    }
    out.push_str(&text[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Captures;

    static RE_ENCODED: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(-)?\(\(0x([0-9A-F]+) -bxor 0x([0-9A-F]+)\)-(\d+)\)").unwrap());

    fn eval(c: &Captures) -> i64 {
        let a = i64::from_str_radix(&c[2], 16).unwrap();
        let b = i64::from_str_radix(&c[3], 16).unwrap();
        let v = (a ^ b) - c[4].parse::<i64>().unwrap();
        if c.get(1).is_some() {
            -v
        } else {
            v
        }
    }

    /// Replace every encoded expression with its value.
    fn decode(text: &str) -> String {
        let neg = Regex::new(r"\(-(\(\(0x[0-9A-F]+ -bxor 0x[0-9A-F]+\)-\d+\))\)").unwrap();
        let text = neg.replace_all(text, |c: &Captures| format!("-{}", &c[1]));
        RE_ENCODED.replace_all(&text, |c: &Captures| eval(c).to_string()).into_owned()
    }

    #[test]
    fn encode_evaluates_back() {
        let mut rng = RunRng::from_seed(1, true);
        for n in [0, 1, 42, 65535, MAX_ENCODED] {
            let e = encode(n, &mut rng);
            let c = RE_ENCODED.captures(&e).unwrap();
            assert_eq!(eval(&c), n, "Got: {e}");
        }
    }

    #[test]
    fn rewrites_standalone_integers() {
        let mut rng = RunRng::from_seed(2, true);
        let text = "$x = 1 + 41; $a[3]; Start-Sleep 10";
        let out = rewrite(text, &mut rng);
        assert!(!out.contains(" 41"), "Got: {out}");
        assert_eq!(decode(&out), text);
    }

    #[test]
    fn skips_non_integer_contexts() {
        let mut rng = RunRng::from_seed(3, true);
        let text = "$v = 3.14; 1..5; 1e5; 2.5e-3; 0xFF; 10MB; $1; cmd 2>&1; x 3> $null; Get-Int32 'a 7'; # 9";
        assert_eq!(rewrite(text, &mut rng), text);
    }

    #[test]
    fn negative_argument_wraps_sign() {
        let mut rng = RunRng::from_seed(4, true);
        let out = rewrite("f -3", &mut rng);
        assert!(out.starts_with("f (-(("), "Got: {out}");
        assert_eq!(decode(&out), "f -3");
        let out = rewrite("$a-3", &mut rng);
        assert!(out.starts_with("$a-(("), "Got: {out}");
    }

    #[test]
    fn skips_large_values_enums_and_attributes() {
        let mut rng = RunRng::from_seed(5, true);
        let text = "enum Color { Red = 1 }\n[ValidateRange(1, 10)]$p = 2147483647";
        assert_eq!(rewrite(text, &mut rng), text);
    }

    #[test]
    fn live_regions_are_code() {
        let mut rng = RunRng::from_seed(6, true);
        let text = "\"v $(1 + 2) 3\"";
        let out = rewrite(text, &mut rng);
        assert!(out.ends_with(") 3\""), "Got: {out}");
        assert_eq!(decode(&out), text);
    }
}
