//! Literal-facing stages: identifier renaming, literal tokenization and
//! literal encryption.
//!
//! Only plain single- and double-quoted literals are candidates. Raw blocks,
//! attribute arguments, literals with a substitution marker or backtick
//! escape, and literals the script executes as code are left as they are.

use super::{insert_prologue, prologue_point, PipelineContext};
use crate::cipher::CipherKind;
use crate::error::Result;
use crate::resolve::{self, ProtectedNames};
use crate::span::{has_substitution, is_inside_attribute, ScanMap, Span, SpanKind};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::Regex;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::LazyLock;
use tracing::debug;

/// Literals shorter than this (in characters) are never tokenized.
pub const MIN_TOKENIZE_LEN: usize = 10;

/// How far past an execution call the first literal is still its argument.
const EXEC_LOOKAHEAD: usize = 400;

static RE_EXEC_CONTEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:Invoke-Expression|\[ScriptBlock\]::Create|Add-Type\s+-TypeDefinition|Add-Type\s+-MemberDefinition)\s*[\(\s]+|\biex\s+[\(\s]*",
    )
    .unwrap()
});

pub(super) fn rename_stage(text: &str, ctx: &mut PipelineContext) -> Result<String> {
    let mut exported = if ctx.settings.module_protection {
        ctx.hints
            .exported
            .clone()
            .unwrap_or_else(|| resolve::exported_functions(text))
    } else {
        Vec::new()
    };
    if let Some(helper) = &ctx.helpers.decrypt_helper {
        exported.push(helper.clone());
    }
    let protected = ProtectedNames::collect(text, &exported).with_variables(&ctx.helpers.token_tables);
    let (out, mapping) = resolve::rename(text, &protected, &mut ctx.rng);
    debug!(renamed = mapping.len(), "identifiers renamed");
    Ok(out)
}

/// Ranges of literals that are executed as code (`iex`, `Add-Type`, ...).
///
/// Parser hints take precedence; otherwise the first literal within reach of
/// each execution call is taken.
pub fn executable_literals(text: &str, scan: &ScanMap, hints: Option<&[String]>) -> Vec<Range<usize>> {
    if let Some(hinted) = hints {
        return scan
            .spans
            .iter()
            .filter(|s| s.is_literal() && hinted.iter().any(|h| h == s.text(text)))
            .map(|s| s.start..s.end)
            .collect();
    }
    let mut out = Vec::new();
    for m in RE_EXEC_CONTEXT.find_iter(text) {
        if !scan.is_code(m.start()) {
            continue;
        }
        let reach = m.end() + EXEC_LOOKAHEAD;
        if let Some(lit) = scan
            .spans
            .iter()
            .find(|s| s.start >= m.end() && s.start < reach && s.is_literal())
        {
            out.push(lit.start..lit.end);
        }
    }
    out
}

/// Byte ranges of emitted token-table declarations.
fn table_regions(text: &str, scan: &ScanMap, tables: &[String]) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    for name in tables {
        let head = format!("$script:{name}=@(");
        let mut from = 0;
        while let Some(p) = text[from..].find(&head) {
            let start = from + p;
            let open = start + head.len() - 1;
            let end = scan.find_matching(text, open).map_or(text.len(), |c| c + 1);
            out.push(start..end);
            from = end;
        }
    }
    out
}

/// The runtime value of an eligible literal, or `None` when the literal must stay.
fn literal_value(text: &str, span: &Span, excluded: &[Range<usize>]) -> Option<String> {
    if excluded.iter().any(|r| span.start < r.end && span.end > r.start) {
        return None;
    }
    if is_inside_attribute(text, span.start) {
        return None;
    }
    let content = span.content(text);
    match span.kind {
        SpanKind::SingleLiteral => Some(content.replace("''", "'")),
        SpanKind::DoubleLiteral => {
            if has_substitution(content) || content.contains('`') {
                None
            } else {
                Some(content.replace("\"\"", "\""))
            }
        }
        _ => None,
    }
}

fn quote_single(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Split `value` into chunks of 3 to 6 characters; the last may be shorter.
fn chunk(value: &str, ctx: &mut PipelineContext) -> Vec<String> {
    let chars: Vec<char> = value.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let left = chars.len() - i;
        let size = if left <= 3 { left } else { ctx.rng.range(3, 6).min(left) };
        out.push(chars[i..i + size].iter().collect());
        i += size;
    }
    out
}

/// Everything before the prologue point: parameter defaults bind before
/// any prologue statement has run.
fn before_prologue(text: &str) -> Option<Range<usize>> {
    match prologue_point(text) {
        0 => None,
        at => Some(0..at),
    }
}

/// Replace long literals with joins over a shared chunk table.
pub fn tokenize(text: &str, ctx: &mut PipelineContext) -> Result<String> {
    let percent = ctx.settings.tokenize_percent;
    if percent == 0 {
        return Ok(text.to_string());
    }
    let scan = ScanMap::new(text);
    let mut excluded = table_regions(text, &scan, &ctx.helpers.token_tables);
    if ctx.settings.context_protection {
        excluded.extend(executable_literals(text, &scan, ctx.hints.executable_literals.as_deref()));
    }
    excluded.extend(before_prologue(text));
    let table = format!("T{}", ctx.rng.ident(5));

    let mut tokens: Vec<String> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out = String::with_capacity(text.len());
    let mut replaced = 0;
    for span in &scan.spans {
        let original = span.text(text);
        let value = match literal_value(text, span, &excluded) {
            Some(v) if v.chars().count() >= MIN_TOKENIZE_LEN => v,
            _ => {
                out.push_str(original);
                continue;
            }
        };
        if !ctx.rng.chance(percent) {
            out.push_str(original);
            continue;
        }
        let parts: Vec<String> = chunk(&value, ctx)
            .into_iter()
            .map(|c| {
                let id = *index.entry(c.clone()).or_insert_with(|| {
                    tokens.push(c);
                    tokens.len() - 1
                });
                format!("$script:{table}[{id}]")
            })
            .collect();
        out.push_str(&format!("(-join @({}))", parts.join(",")));
        replaced += 1;
    }

    if replaced == 0 {
        return Ok(text.to_string());
    }
    let entries: Vec<String> = tokens.iter().map(|t| quote_single(t)).collect();
    let decl = format!("$script:{table}=@({});", entries.join(","));
    ctx.helpers.token_tables.push(table);
    debug!(literals = replaced, chunks = tokens.len(), "literals tokenized");
    Ok(insert_prologue(&out, &decl))
}

fn key_bytes_expr(key: &[u8]) -> String {
    format!(
        "0..({}-1)|%{{[Convert]::ToByte('{}'.Substring($_*2,2),16)}}",
        key.len(),
        hex::encode_upper(key)
    )
}

fn rc4_helper(name: &str) -> String {
    format!(
        "function {name}($k,[byte[]]$d){{$s=0..255;$j=0;for($i=0;$i -lt 256;$i++){{\
         $j=($j+$s[$i]+$k[$i%$k.Length])%256;$t=$s[$i];$s[$i]=$s[$j];$s[$j]=$t}}\
         $i=0;$j=0;for($x=0;$x -lt $d.Length;$x++){{\
         $i=($i+1)%256;$j=($j+$s[$i])%256;$t=$s[$i];$s[$i]=$s[$j];$s[$j]=$t;\
         $d[$x]=$d[$x] -bxor $s[($s[$i]+$s[$j])%256]}}\
         [Text.Encoding]::UTF8.GetString($d)}}"
    )
}

/// Replace eligible literals with a runtime decode of their encrypted bytes.
pub fn encrypt(text: &str, ctx: &mut PipelineContext) -> Result<String> {
    let key = ctx.settings.key.clone();
    let cipher = ctx.settings.cipher;
    let scan = ScanMap::new(text);
    let mut excluded = table_regions(text, &scan, &ctx.helpers.token_tables);
    if ctx.settings.context_protection {
        excluded.extend(executable_literals(text, &scan, ctx.hints.executable_literals.as_deref()));
    }
    let helper = match (cipher, &ctx.helpers.decrypt_helper) {
        (CipherKind::Rc4, Some(name)) => Some((name.clone(), false)),
        (CipherKind::Rc4, None) => Some((format!("__dec{}", ctx.rng.ident(6)), true)),
        (CipherKind::Xor, _) => None,
    };
    if helper.is_some() {
        excluded.extend(before_prologue(text));
    }

    let mut out = String::with_capacity(text.len() * 2);
    let mut replaced = 0;
    for span in &scan.spans {
        let original = span.text(text);
        let value = match literal_value(text, span, &excluded) {
            Some(v) if !v.is_empty() => v,
            _ => {
                out.push_str(original);
                continue;
            }
        };
        let payload = STANDARD.encode(cipher.encrypt(value.as_bytes(), &key));
        let expr = match &helper {
            None => format!(
                "(&{{[byte[]]$k={};[byte[]]$b=[Convert]::FromBase64String('{payload}');\
                 for($i=0;$i -lt $b.Length;$i++){{$b[$i]=$b[$i] -bxor $k[$i%$k.Length]}};\
                 [Text.Encoding]::UTF8.GetString($b)}})",
                key_bytes_expr(&key)
            ),
            Some((name, _)) => format!(
                "({name} ([byte[]]({})) ([Convert]::FromBase64String('{payload}')))",
                key_bytes_expr(&key)
            ),
        };
        out.push_str(&expr);
        replaced += 1;
    }

    debug!(literals = replaced, cipher = ?cipher, "literals encrypted");
    match helper {
        Some((name, true)) if replaced > 0 => {
            let with_helper = insert_prologue(&out, &rc4_helper(&name));
            ctx.helpers.decrypt_helper = Some(name);
            Ok(with_helper)
        }
        _ => Ok(out),
    }
}
