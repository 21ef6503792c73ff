//! Control-flow noise: opaque wrap, function block shuffle, dead code and the
//! anti-analysis prologue.
//!
//! With flow-safe mode on, the first three back off from any region that
//! contains `try`, `catch`, `finally` or `trap`.

use super::{depth_at, has_error_handling, has_named_blocks, insert_prologue, prologue_point, PipelineContext};
use crate::snippet;
use crate::span::{comment_ranges, ScanMap};
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static RE_TYPE_DECL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(?:class|enum)\s+\w+").unwrap());
static RE_FUNC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bfunction\s+[A-Za-z_][A-Za-z0-9_-]*\s*[\(\{]").unwrap());

/// Wrap everything after the prologue point in `if(<always true>){ ... }`.
pub fn opaque_wrap(text: &str, ctx: &mut PipelineContext) -> String {
    let at = prologue_point(text);
    let body = &text[at..];
    if body.trim().is_empty() {
        return text.to_string();
    }
    let scan = ScanMap::new(text);
    if RE_TYPE_DECL.find_iter(text).any(|m| scan.is_code(m.start())) {
        debug!("opaque wrap skipped: class or enum declared");
        return text.to_string();
    }
    if has_named_blocks(text) {
        debug!("opaque wrap skipped: script-level named blocks");
        return text.to_string();
    }
    if ctx.settings.flow_safe && has_error_handling(body) {
        debug!("opaque wrap skipped: error handling present");
        return text.to_string();
    }
    let cond = snippet::opaque_true(&mut ctx.rng);
    let head = if at == 0 { String::new() } else { format!("{}\n", &text[..at]) };
    format!("{head}if({cond}){{\n{body}\n}}\n")
}

/// A top-level function declaration, `start..end` covering `function` to the closing brace.
#[derive(Debug, Clone, Copy)]
struct Block {
    start: usize,
    end: usize,
}

fn top_level_functions(text: &str, scan: &ScanMap) -> Vec<Block> {
    let mut out: Vec<Block> = Vec::new();
    for m in RE_FUNC.find_iter(text) {
        let start = m.start();
        if !scan.is_code(start) || out.last().is_some_and(|b| start < b.end) {
            continue;
        }
        if depth_at(text, scan, start) != 0 {
            continue;
        }
        let mut open = m.end() - 1;
        if text.as_bytes()[open] == b'(' {
            let Some(close) = scan.find_matching(text, open) else { continue };
            let Some(brace) = (close + 1..text.len()).find(|&i| text.as_bytes()[i] == b'{' && scan.is_code(i)) else {
                continue;
            };
            open = brace;
        }
        if let Some(close) = scan.find_matching(text, open) {
            out.push(Block { start, end: close + 1 });
        }
    }
    out
}

/// Glue between two functions qualifies when it holds only whitespace and comments.
fn is_glue(text: &str, from: usize, to: usize, comments: &[std::ops::Range<usize>]) -> bool {
    let b = text.as_bytes();
    let mut i = from;
    while i < to {
        if b[i].is_ascii_whitespace() {
            i += 1;
        } else if let Some(c) = comments.iter().find(|c| c.contains(&i)) {
            i = c.end;
        } else {
            return false;
        }
    }
    true
}

/// Permute runs of consecutive top-level functions, keeping the glue in place.
pub fn shuffle_functions(text: &str, ctx: &mut PipelineContext) -> String {
    let scan = ScanMap::new(text);
    let blocks = top_level_functions(text, &scan);
    if blocks.len() < 2 {
        return text.to_string();
    }
    let comments = comment_ranges(text);

    let mut runs: Vec<Vec<Block>> = vec![vec![blocks[0]]];
    for pair in blocks.windows(2) {
        if is_glue(text, pair[0].end, pair[1].start, &comments) {
            if let Some(run) = runs.last_mut() {
                run.push(pair[1]);
            }
        } else {
            runs.push(vec![pair[1]]);
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for run in runs {
        let first = run[0];
        let last = run[run.len() - 1];
        out.push_str(&text[cursor..first.start]);
        cursor = last.end;
        let guarded = ctx.settings.flow_safe && has_error_handling(&text[first.start..last.end]);
        if run.len() < 2 || guarded {
            out.push_str(&text[first.start..last.end]);
            continue;
        }
        let mut order: Vec<usize> = (0..run.len()).collect();
        ctx.rng.shuffle(&mut order);
        for (slot, &pick) in order.iter().enumerate() {
            let block = run[pick];
            out.push_str(&text[block.start..block.end]);
            if slot + 1 < run.len() {
                out.push_str(&text[run[slot].end..run[slot + 1].start]);
            }
        }
        debug!(functions = run.len(), "function run shuffled");
    }
    out.push_str(&text[cursor..]);
    out
}

/// Append inert snippets with probability `dead_code_prob`.
pub fn inject_dead_code(text: &str, ctx: &mut PipelineContext) -> String {
    let prob = ctx.settings.dead_code_prob;
    if !ctx.rng.chance(prob) {
        return text.to_string();
    }
    if ctx.settings.flow_safe && has_error_handling(text) {
        debug!("dead code skipped: error handling present");
        return text.to_string();
    }
    if has_named_blocks(text) {
        debug!("dead code skipped: script-level named blocks");
        return text.to_string();
    }
    let mut out = text.to_string();
    for s in snippet::dead_code(&mut ctx.rng, prob) {
        out.push('\n');
        out.push_str(&s);
        out.push('\n');
    }
    out
}

/// Debugger check at the prologue point.
pub fn anti_analysis(text: &str, ctx: &mut PipelineContext) -> String {
    let check = snippet::anti_analysis(&mut ctx.rng);
    insert_prologue(text, &check)
}
