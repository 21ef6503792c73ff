//! Ordered rewrite stages.
//!
//! Each stage takes the whole text and the run context and returns new text.
//! Stages never share offsets: every stage re-classifies the text it receives.

pub mod flow;
pub mod layout;
pub mod literal;
pub mod numeric;

use crate::cipher::CipherKind;
use crate::error::{Error, Result};
use crate::rng::RunRng;
use crate::span::{comment_ranges, ScanMap};
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static RE_GUARDED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(?:try|catch|finally|trap)\b").unwrap());
static RE_PARAM_HEAD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^param\s*\(").unwrap());
// Script-level named blocks; no statement may sit outside them
static RE_NAMED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(begin|process|end|dynamicparam)\s*\{").unwrap());

/// Named blocks in the order PowerShell runs them.
const NAMED_BLOCK_ORDER: [&str; 4] = ["dynamicparam", "begin", "process", "end"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Rename,
    Tokenize,
    Encrypt,
    Numeric,
    Layout,
    Opaque,
    Shuffle,
    DeadCode,
    AntiAnalysis,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Rename => "rename",
            Stage::Tokenize => "tokenize",
            Stage::Encrypt => "encrypt",
            Stage::Numeric => "numeric",
            Stage::Layout => "layout",
            Stage::Opaque => "opaque",
            Stage::Shuffle => "shuffle",
            Stage::DeadCode => "deadcode",
            Stage::AntiAnalysis => "anti-analysis",
        }
    }

    /// Parse a comma-separated stage list. `cf` expands to opaque wrap then
    /// block shuffle; `frag` only selects packer fragmentation and adds no stage.
    pub fn parse_list(list: &str) -> Result<Vec<Stage>> {
        let mut stages = Vec::new();
        for raw in list.split(',') {
            let name = raw.trim().to_ascii_lowercase();
            match name.as_str() {
                "" | "frag" => {}
                "iden" | "rename" => stages.push(Stage::Rename),
                "stringdict" | "tokenize" => stages.push(Stage::Tokenize),
                "strenc" | "encrypt" => stages.push(Stage::Encrypt),
                "numenc" | "numeric" => stages.push(Stage::Numeric),
                "fmt" | "layout" => stages.push(Stage::Layout),
                "cf" => stages.extend([Stage::Opaque, Stage::Shuffle]),
                "opaque" => stages.push(Stage::Opaque),
                "shuffle" => stages.push(Stage::Shuffle),
                "dead" | "deadcode" => stages.push(Stage::DeadCode),
                "anti" | "anti-analysis" => stages.push(Stage::AntiAnalysis),
                other => return Err(Error::Config(format!("unknown stage '{other}'"))),
            }
        }
        Ok(stages)
    }

    pub fn apply(self, text: &str, ctx: &mut PipelineContext) -> Result<String> {
        match self {
            Stage::Rename => literal::rename_stage(text, ctx),
            Stage::Tokenize => literal::tokenize(text, ctx),
            Stage::Encrypt => literal::encrypt(text, ctx),
            Stage::Numeric => Ok(numeric::rewrite(text, &mut ctx.rng)),
            Stage::Layout => Ok(layout::jitter(text, &mut ctx.rng)),
            Stage::Opaque => Ok(flow::opaque_wrap(text, ctx)),
            Stage::Shuffle => Ok(flow::shuffle_functions(text, ctx)),
            Stage::DeadCode => Ok(flow::inject_dead_code(text, ctx)),
            Stage::AntiAnalysis => Ok(flow::anti_analysis(text, ctx)),
        }
    }
}

/// Per-stage parameters, fixed for the run.
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub tokenize_percent: u8,
    pub cipher: CipherKind,
    pub key: Vec<u8>,
    pub dead_code_prob: u8,
    pub flow_safe: bool,
    pub context_protection: bool,
    pub module_protection: bool,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            tokenize_percent: 30,
            cipher: CipherKind::Xor,
            key: Vec::new(),
            dead_code_prob: 0,
            flow_safe: true,
            context_protection: true,
            module_protection: false,
        }
    }
}

/// Signals from the external parser, taken on the pre-transform body.
#[derive(Debug, Clone, Default)]
pub struct ParserHints {
    /// Source text of literals that are executed as code.
    pub executable_literals: Option<Vec<String>>,
    /// Function names on the module's export surface.
    pub exported: Option<Vec<String>>,
}

/// Names emitted by stages, latched on first use.
#[derive(Debug, Clone, Default)]
pub struct HelperFlags {
    /// Variable names (without `$script:`) of emitted token tables.
    pub token_tables: Vec<String>,
    /// Name of the RC4 decode function, once emitted.
    pub decrypt_helper: Option<String>,
}

/// Everything one run needs, owned by that run.
pub struct PipelineContext {
    pub rng: RunRng,
    pub settings: StageSettings,
    pub hints: ParserHints,
    pub helpers: HelperFlags,
}

impl PipelineContext {
    pub fn new(rng: RunRng, settings: StageSettings, hints: ParserHints) -> Self {
        Self { rng, settings, hints, helpers: HelperFlags::default() }
    }
}

/// Run `stages` in order. Stops at the first failure.
pub fn run_pipeline(text: &str, stages: &[Stage], ctx: &mut PipelineContext) -> Result<String> {
    let mut current = text.to_string();
    for stage in stages {
        let before = current.len();
        current = stage.apply(&current, ctx)?;
        debug!(stage = stage.name(), before, after = current.len(), "stage applied");
    }
    Ok(current)
}

/// Whether `text` contains `try`, `catch`, `finally` or `trap` as code.
pub fn has_error_handling(text: &str) -> bool {
    let scan = ScanMap::new(text);
    RE_GUARDED.find_iter(text).any(|m| scan.is_code(m.start()))
}

/// Brace depth of `pos`, counting code braces only.
pub fn depth_at(text: &str, scan: &ScanMap, pos: usize) -> usize {
    let mut depth = 0usize;
    for (i, b) in text.bytes().enumerate().take(pos) {
        if !scan.is_code(i) {
            continue;
        }
        match b {
            b'{' => depth += 1,
            b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    depth
}

/// Script-level `dynamicparam`/`begin`/`process`/`end` blocks as
/// (run order, offset of the opening brace).
fn named_blocks(text: &str, scan: &ScanMap) -> Vec<(usize, usize)> {
    let b = text.as_bytes();
    RE_NAMED_BLOCK
        .captures_iter(text)
        .filter_map(|c| {
            let m = c.get(0)?;
            let start = m.start();
            if !scan.is_code(start) || (start > 0 && matches!(b[start - 1], b'$' | b'-' | b'.' | b':')) {
                return None;
            }
            if depth_at(text, scan, start) != 0 {
                return None;
            }
            let rank = NAMED_BLOCK_ORDER.iter().position(|k| k.eq_ignore_ascii_case(&c[1]))?;
            Some((rank, m.end() - 1))
        })
        .collect()
}

/// Whether the script body is split into named blocks.
pub fn has_named_blocks(text: &str) -> bool {
    !named_blocks(text, &ScanMap::new(text)).is_empty()
}

/// Offset where stage-generated prologue code goes: inside the named block
/// that runs first, else after a leading attribute list and `param(...)`
/// block, or 0 when there is none.
pub fn prologue_point(text: &str) -> usize {
    let scan = ScanMap::new(text);
    if let Some(&(_, open)) = named_blocks(text, &scan).iter().min_by_key(|(rank, _)| *rank) {
        return open + 1;
    }
    let comments = comment_ranges(text);
    let b = text.as_bytes();
    let skip_trivia = |mut i: usize| {
        while i < b.len() {
            if b[i].is_ascii_whitespace() {
                i += 1;
            } else if let Some(c) = comments.iter().find(|c| c.start == i) {
                i = c.end;
            } else {
                break;
            }
        }
        i
    };

    let mut i = skip_trivia(0);
    while i < b.len() && b[i] == b'[' {
        match scan.find_matching(text, i) {
            Some(close) => i = skip_trivia(close + 1),
            None => return 0,
        }
    }
    match RE_PARAM_HEAD.find(&text[i..]) {
        Some(m) => {
            let open = i + m.end() - 1;
            scan.find_matching(text, open).map_or(0, |close| close + 1)
        }
        None => 0,
    }
}

/// Insert `code` at the prologue point.
pub fn insert_prologue(text: &str, code: &str) -> String {
    let at = prologue_point(text);
    if at == 0 {
        format!("{code}\n{text}")
    } else {
        format!("{}\n{code}\n{}", &text[..at], &text[at..])
    }
}
