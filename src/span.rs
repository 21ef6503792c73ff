//! Literal / raw-block / free-text classification for PowerShell source.
//!
//! A single left-to-right scanner over delimiter pairs. No grammar: anything
//! the scanner does not recognise is free text. Spans are never patched after
//! a rewrite; callers re-run [`classify`] on the new text.
//!
//! Recognised forms:
//! - `'...'` with `''` as the only escape, single line.
//! - `"..."` with backtick escapes and `$( ... )` live regions, single line
//!   outside live regions.
//! - `@'` / `@"` here-strings, opener at end of line, terminator at column 0.
//! - `# ...` line comments and `<# ... #>` block comments (free text, but
//!   quotes inside them never open a literal).

use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    SingleLiteral,
    DoubleLiteral,
    RawBlockSingle,
    RawBlockDouble,
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub kind: SpanKind,
}

impl Span {
    pub fn is_literal(&self) -> bool {
        matches!(self.kind, SpanKind::SingleLiteral | SpanKind::DoubleLiteral)
    }

    pub fn is_raw(&self) -> bool {
        matches!(self.kind, SpanKind::RawBlockSingle | SpanKind::RawBlockDouble)
    }

    /// Whether `$name` inside this span expands at runtime.
    pub fn expands(&self) -> bool {
        matches!(self.kind, SpanKind::DoubleLiteral | SpanKind::RawBlockDouble)
    }

    pub fn text<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }

    /// Byte range of the content between the delimiters.
    pub fn content_range(&self, text: &str) -> Range<usize> {
        match self.kind {
            SpanKind::Free => self.start..self.end,
            SpanKind::SingleLiteral | SpanKind::DoubleLiteral => self.start + 1..self.end - 1,
            SpanKind::RawBlockSingle | SpanKind::RawBlockDouble => {
                let b = text.as_bytes();
                let mut s = self.start + 2;
                while s < self.end && (b[s] == b' ' || b[s] == b'\t') {
                    s += 1;
                }
                if s < self.end && b[s] == b'\r' {
                    s += 1;
                }
                if s < self.end && b[s] == b'\n' {
                    s += 1;
                }
                // Terminator sits at column 0, so the byte before it is '\n'.
                let mut e = self.end - 2;
                if e > s && b[e - 1] == b'\n' {
                    e -= 1;
                    if e > s && b[e - 1] == b'\r' {
                        e -= 1;
                    }
                }
                s..e.max(s)
            }
        }
    }

    pub fn content<'a>(&self, text: &'a str) -> &'a str {
        &text[self.content_range(text)]
    }
}

/// Classify `text` into sorted spans that cover it exactly once.
pub fn classify(text: &str) -> Vec<Span> {
    scan(text).0
}

/// Comment ranges found while classifying.
pub fn comment_ranges(text: &str) -> Vec<Range<usize>> {
    scan(text).1
}

fn scan(text: &str) -> (Vec<Span>, Vec<Range<usize>>) {
    let b = text.as_bytes();
    let mut spans = Vec::new();
    let mut comments = Vec::new();
    let mut free_start = 0;
    let mut i = 0;

    let push = |spans: &mut Vec<Span>, free_start: usize, start: usize, end: usize, kind| {
        if free_start < start {
            spans.push(Span { start: free_start, end: start, kind: SpanKind::Free });
        }
        spans.push(Span { start, end, kind });
    };

    while i < b.len() {
        match b[i] {
            b'`' => i += 2,
            b'#' if at_token_start(b, i) => {
                let end = line_end(b, i);
                comments.push(i..end);
                i = end;
            }
            b'<' if b.get(i + 1) == Some(&b'#') => {
                let end = find_from(b, i + 2, b"#>").map_or(b.len(), |p| p + 2);
                comments.push(i..end);
                i = end;
            }
            b'@' if matches!(b.get(i + 1), Some(b'\'') | Some(b'"')) => {
                let kind = if b[i + 1] == b'\'' {
                    SpanKind::RawBlockSingle
                } else {
                    SpanKind::RawBlockDouble
                };
                match scan_raw(b, i) {
                    Some(end) => {
                        push(&mut spans, free_start, i, end, kind);
                        i = end;
                        free_start = i;
                    }
                    // `@'` not at end of line is an array/splat, not a raw block
                    None => i += 1,
                }
            }
            b'\'' => match scan_single(b, i) {
                Some(end) => {
                    push(&mut spans, free_start, i, end, SpanKind::SingleLiteral);
                    i = end;
                    free_start = i;
                }
                None => i += 1,
            },
            b'"' => match scan_double(b, i) {
                Some(end) => {
                    push(&mut spans, free_start, i, end, SpanKind::DoubleLiteral);
                    i = end;
                    free_start = i;
                }
                None => i += 1,
            },
            _ => i += 1,
        }
    }
    if free_start < b.len() {
        spans.push(Span { start: free_start, end: b.len(), kind: SpanKind::Free });
    }
    (spans, comments)
}

fn at_token_start(b: &[u8], i: usize) -> bool {
    i == 0 || matches!(b[i - 1], b' ' | b'\t' | b'\r' | b'\n' | b';' | b'(' | b')' | b'{' | b'}' | b'|' | b'&')
}

fn line_end(b: &[u8], i: usize) -> usize {
    b[i..].iter().position(|&c| c == b'\n').map_or(b.len(), |p| i + p)
}

fn find_from(b: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= b.len() {
        return None;
    }
    b[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

/// `'...'` starting at `i`. Returns the end offset (exclusive).
fn scan_single(b: &[u8], i: usize) -> Option<usize> {
    let mut j = i + 1;
    while j < b.len() {
        match b[j] {
            b'\n' => return None,
            b'\'' if b.get(j + 1) == Some(&b'\'') => j += 2,
            b'\'' => return Some(j + 1),
            _ => j += 1,
        }
    }
    None
}

/// `"..."` starting at `i`, honouring backticks and `$( )` live regions.
fn scan_double(b: &[u8], i: usize) -> Option<usize> {
    let mut j = i + 1;
    while j < b.len() {
        match b[j] {
            b'`' => j += 2,
            b'\n' => return None,
            b'"' if b.get(j + 1) == Some(&b'"') => j += 2,
            b'"' => return Some(j + 1),
            b'$' if b.get(j + 1) == Some(&b'(') => j = live_end(b, j + 2)?,
            _ => j += 1,
        }
    }
    None
}

/// End (exclusive) of a live region whose body starts at `from`, just after `$(`.
fn live_end(b: &[u8], from: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut k = from;
    while k < b.len() {
        match b[k] {
            b'`' => k += 2,
            b'(' => {
                depth += 1;
                k += 1;
            }
            b')' => {
                depth -= 1;
                k += 1;
                if depth == 0 {
                    return Some(k);
                }
            }
            b'\'' => k = scan_single(b, k).unwrap_or(k + 1),
            b'"' => k = scan_double(b, k).unwrap_or(k + 1),
            _ => k += 1,
        }
    }
    None
}

/// Here-string starting at `i` (`@'` or `@"`). Returns the end offset past the terminator.
fn scan_raw(b: &[u8], i: usize) -> Option<usize> {
    let quote = b[i + 1];
    let mut j = i + 2;
    while j < b.len() && (b[j] == b' ' || b[j] == b'\t') {
        j += 1;
    }
    if j < b.len() && b[j] == b'\r' {
        j += 1;
    }
    if j >= b.len() || b[j] != b'\n' {
        return None;
    }
    let mut line = j + 1;
    while line < b.len() {
        if b[line] == quote && b.get(line + 1) == Some(&b'@') {
            return Some(line + 2);
        }
        line = line_end(b, line) + 1;
    }
    None
}

/// Literal (non-live) sub-ranges of an expanding span.
///
/// For single-quoted spans the whole content is literal. For double-quoted
/// spans and double raw blocks, `$( ... )` regions are code and excluded.
pub fn substitution_spans(text: &str, span: &Span) -> Vec<Range<usize>> {
    let r = span.content_range(text);
    match span.kind {
        SpanKind::Free => return Vec::new(),
        SpanKind::SingleLiteral | SpanKind::RawBlockSingle => return vec![r],
        _ => {}
    }
    let b = text.as_bytes();
    let mut out = Vec::new();
    let mut lit_start = r.start;
    let mut j = r.start;
    while j < r.end {
        match b[j] {
            b'`' => j += 2,
            b'$' if b.get(j + 1) == Some(&b'(') => {
                if lit_start < j {
                    out.push(lit_start..j);
                }
                j = live_end(b, j + 2).unwrap_or(r.end).min(r.end);
                lit_start = j;
            }
            _ => j += 1,
        }
    }
    if lit_start < r.end {
        out.push(lit_start..r.end);
    }
    out
}

/// Whether double-quoted content carries a substitution marker.
pub fn has_substitution(content: &str) -> bool {
    let b = content.as_bytes();
    let mut j = 0;
    while j < b.len() {
        match b[j] {
            b'`' => j += 2,
            b'$' => match b.get(j + 1) {
                Some(c) if c.is_ascii_alphanumeric() || matches!(c, b'_' | b'{' | b'(' | b'?' | b'^' | b'$') => {
                    return true
                }
                _ => j += 1,
            },
            _ => j += 1,
        }
    }
    false
}

/// Precomputed classification plus a per-byte code mask.
///
/// A byte is code when it lies in free text outside comments, or inside a
/// live `$( )` region of an expanding literal (but not in a literal nested
/// within that region).
pub struct ScanMap {
    pub spans: Vec<Span>,
    code: Vec<bool>,
}

impl ScanMap {
    pub fn new(text: &str) -> Self {
        let (spans, comments) = scan(text);
        let b = text.as_bytes();
        let mut code = vec![false; b.len()];
        for span in &spans {
            match span.kind {
                SpanKind::Free => code[span.start..span.end].iter_mut().for_each(|c| *c = true),
                SpanKind::DoubleLiteral | SpanKind::RawBlockDouble => {
                    let content = span.content_range(text);
                    let literal = substitution_spans(text, span);
                    let tail = content.end..content.end;
                    let mut pos = content.start;
                    for lit in literal.iter().chain(std::iter::once(&tail)) {
                        if pos < lit.start {
                            mark_live(b, pos, lit.start, &mut code);
                        }
                        pos = lit.end;
                    }
                }
                _ => {}
            }
        }
        for c in comments {
            code[c].iter_mut().for_each(|m| *m = false);
        }
        Self { spans, code }
    }

    pub fn is_code(&self, pos: usize) -> bool {
        self.code.get(pos).copied().unwrap_or(false)
    }

    pub fn span_at(&self, pos: usize) -> Option<&Span> {
        let idx = self.spans.partition_point(|s| s.end <= pos);
        self.spans.get(idx).filter(|s| s.start <= pos)
    }

    /// Offset of the bracket closing the one at `open`, counting code bytes only.
    pub fn find_matching(&self, text: &str, open: usize) -> Option<usize> {
        let b = text.as_bytes();
        let (o, c) = match b.get(open)? {
            b'{' => (b'{', b'}'),
            b'(' => (b'(', b')'),
            b'[' => (b'[', b']'),
            _ => return None,
        };
        let mut depth = 0usize;
        for (k, &ch) in b.iter().enumerate().skip(open) {
            if !self.is_code(k) {
                continue;
            }
            if ch == o {
                depth += 1;
            } else if ch == c {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(k);
                }
            }
        }
        None
    }
}

/// Marks `from..to` (a live region, `$(` and `)` included) as code, skipping nested literals.
fn mark_live(b: &[u8], from: usize, to: usize, code: &mut [bool]) {
    let mut k = from;
    while k < to {
        match b[k] {
            b'\'' => match scan_single(b, k) {
                Some(e) => k = e.min(to),
                None => {
                    code[k] = true;
                    k += 1;
                }
            },
            b'"' => match scan_double(b, k) {
                Some(e) => k = e.min(to),
                None => {
                    code[k] = true;
                    k += 1;
                }
            },
            _ => {
                code[k] = true;
                k += 1;
            }
        }
    }
}

/// Whether `pos` sits inside the argument list of an attribute such as
/// `[ValidateSet('a','b')]`.
pub fn is_inside_attribute(text: &str, pos: usize) -> bool {
    let b = text.as_bytes();
    let mut depth = 0usize;
    let mut k = pos.min(b.len());
    let open = loop {
        if k == 0 {
            return false;
        }
        k -= 1;
        match b[k] {
            b'\n' => return false,
            b')' => depth += 1,
            b'(' if depth == 0 => break k,
            b'(' => depth -= 1,
            _ => {}
        }
    };
    let mut k = open;
    while k > 0 {
        k -= 1;
        let ch = b[k];
        if ch == b'[' {
            return k + 1 < open;
        }
        if !(ch.is_ascii_alphanumeric() || matches!(ch, b'_' | b'.' | b' ' | b'\t')) {
            return false;
        }
    }
    false
}
