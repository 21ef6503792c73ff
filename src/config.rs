//! Run options and their validation.
//!
//! [`Options`] is the loose caller-facing shape (what the CLI fills in).
//! [`Options::validate`] checks every field and produces a [`Plan`], so a bad
//! option is always reported before any transform runs.

use crate::cipher::{parse_hex_key, CipherKind};
use crate::collab::{Collaborator, DEFAULT_TIMEOUT};
use crate::error::{Error, Result};
use crate::packer::PackerConfig;
use crate::transform::{Stage, StageSettings};
use std::time::Duration;

/// Largest accepted input, in bytes.
pub const MAX_INPUT_BYTES: usize = 100 * 1024 * 1024;

/// Named fragment size bounds for level 5.
pub fn fragment_profile(profile: &str) -> Result<(usize, usize)> {
    let name = profile.trim().to_ascii_lowercase();
    let name = name.strip_prefix("profile=").unwrap_or(&name);
    match name {
        "tight" => Ok((6, 10)),
        "medium" => Ok((10, 18)),
        "loose" => Ok((14, 28)),
        "pro" => Ok((5, 14)),
        _ => Err(Error::Config(format!(
            "malformed fragment profile '{profile}' (expected tight, medium, loose or pro)"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    pub level: u8,
    /// Comma-separated stage names, applied in order.
    pub pipeline: String,
    pub tokenize_percent: u32,
    pub cipher: String,
    /// Hex key material for the encrypt stage.
    pub key: String,
    pub dead_code_prob: u32,
    /// Explicit bounds win over `frag_profile`.
    pub min_frag: Option<usize>,
    pub max_frag: Option<usize>,
    pub frag_profile: Option<String>,
    pub flow_safe: bool,
    pub module_protection: bool,
    pub context_protection: bool,
    pub integrity: bool,
    pub exec_wrapper: bool,
    pub no_exec: bool,
    pub seed: Option<i64>,
    /// Parser collaborator command line, split on whitespace.
    pub parser: Option<String>,
    pub parser_timeout: Duration,
    pub require_parser: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            level: 1,
            pipeline: String::new(),
            tokenize_percent: 30,
            cipher: "xor".into(),
            key: String::new(),
            dead_code_prob: 0,
            min_frag: None,
            max_frag: None,
            frag_profile: None,
            flow_safe: true,
            module_protection: false,
            context_protection: true,
            integrity: false,
            exec_wrapper: true,
            no_exec: false,
            seed: None,
            parser: None,
            parser_timeout: DEFAULT_TIMEOUT,
            require_parser: false,
        }
    }
}

/// Validated, immutable description of one run.
#[derive(Debug, Clone)]
pub struct Plan {
    pub stages: Vec<Stage>,
    pub settings: StageSettings,
    pub packer: PackerConfig,
    pub collaborator: Option<Collaborator>,
    pub seed: Option<i64>,
}

fn percent(name: &str, value: u32) -> Result<u8> {
    u8::try_from(value)
        .ok()
        .filter(|v| *v <= 100)
        .ok_or_else(|| Error::Config(format!("{name} must be between 0 and 100, got {value}")))
}

impl Options {
    fn fragment_bounds(&self) -> Result<(usize, usize)> {
        let (mut min, mut max) = match &self.frag_profile {
            Some(p) if !p.trim().is_empty() => fragment_profile(p)?,
            _ => (10, 20),
        };
        if let Some(v) = self.min_frag {
            min = v;
        }
        if let Some(v) = self.max_frag {
            max = v;
        }
        if min == 0 {
            return Err(Error::Config("minimum fragment size must be at least 1".into()));
        }
        if max < min {
            return Err(Error::Config(format!("maximum fragment size {max} is below minimum {min}")));
        }
        Ok((min, max))
    }

    pub fn validate(&self) -> Result<Plan> {
        if !(1..=5).contains(&self.level) {
            return Err(Error::Config(format!("unsupported level {} (valid 1..5)", self.level)));
        }
        let stages = Stage::parse_list(&self.pipeline)?;
        let tokenize_percent = percent("tokenize percentage", self.tokenize_percent)?;
        let dead_code_prob = percent("dead-code probability", self.dead_code_prob)?;
        let cipher: CipherKind = self.cipher.parse()?;
        let key = if stages.contains(&Stage::Encrypt) || !self.key.trim().is_empty() {
            parse_hex_key(&self.key)?
        } else {
            Vec::new()
        };
        let (min_frag, max_frag) = self.fragment_bounds()?;

        let collaborator = match self.parser.as_deref().map(str::trim) {
            Some(cmd) if !cmd.is_empty() => Some(Collaborator {
                command: cmd.split_whitespace().map(String::from).collect(),
                timeout: self.parser_timeout,
                required: self.require_parser,
            }),
            _ if self.require_parser => {
                return Err(Error::Config("a parser is required but no parser command was given".into()))
            }
            _ => None,
        };

        Ok(Plan {
            stages,
            settings: StageSettings {
                tokenize_percent,
                cipher,
                key,
                dead_code_prob,
                flow_safe: self.flow_safe,
                context_protection: self.context_protection,
                module_protection: self.module_protection,
            },
            packer: PackerConfig {
                level: self.level,
                min_frag,
                max_frag,
                integrity: self.integrity,
                exec_wrapper: self.exec_wrapper,
                no_exec: self.no_exec,
            },
            collaborator,
            seed: self.seed,
        })
    }
}
