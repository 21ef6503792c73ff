//! Whitespace jitter per line.
//!
//! Lines that touch a raw block, and lines ending in a backtick continuation,
//! keep their exact text and a single newline separator.

use crate::rng::RunRng;
use crate::span::classify;

/// Byte ranges of each line, without the `\n`.
fn line_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            out.push((start, i));
            start = i + 1;
        }
    }
    out.push((start, text.len()));
    out
}

fn continues(line: &str) -> bool {
    line.trim_end_matches([' ', '\t', '\r']).ends_with('`')
}

/// Randomly trim, left-pad or right-pad lines and vary blank lines between them.
pub fn jitter(text: &str, rng: &mut RunRng) -> String {
    let raw: Vec<(usize, usize)> = classify(text)
        .iter()
        .filter(|s| s.is_raw())
        .map(|s| (s.start, s.end))
        .collect();
    let ranges = line_ranges(text);
    // A line touches a raw block when any of its bytes (or its newline) is inside one
    let frozen: Vec<bool> = ranges
        .iter()
        .map(|&(s, e)| raw.iter().any(|&(rs, re)| s < re && e + 1 > rs))
        .collect();

    let mut lines: Vec<String> = Vec::with_capacity(ranges.len());
    for (i, &(s, e)) in ranges.iter().enumerate() {
        let line = &text[s..e];
        if frozen[i] || continues(line) {
            lines.push(line.to_string());
            continue;
        }
        let mut line = line.to_string();
        if rng.chance(35) {
            line = line.trim().to_string();
        }
        if rng.chance(30) {
            line.insert(0, ' ');
        }
        if rng.chance(30) {
            line.push(' ');
        }
        lines.push(line);
    }

    let mut out = String::with_capacity(text.len() + lines.len());
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            let fixed = frozen[i] || frozen[i - 1] || continues(&lines[i - 1]);
            let newlines = if fixed { 1 } else { 1 + rng.intn(2) };
            out.push_str(&"\n".repeat(newlines));
        }
        out.push_str(line);
    }
    out
}
