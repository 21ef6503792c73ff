//! Run driver: input checks, pipeline, packer, assembly and output writes.

use crate::assemble::{assemble, extract_directives, strip_bom, with_bom};
use crate::collab;
use crate::config::{Plan, MAX_INPUT_BYTES};
use crate::error::{Error, Result};
use crate::packer;
use crate::rng::{init_rng, RunRng};
use crate::transform::{run_pipeline, PipelineContext};
use rayon::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// Result of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// Directives, stub and footer.
    pub text: String,
    /// Effective seed; replaying it reproduces `text`.
    pub seed: i64,
}

impl Output {
    /// Bytes to write: BOM, newline, text.
    pub fn to_bytes(&self) -> Vec<u8> {
        with_bom(&self.text)
    }
}

/// Check raw input and return it as text without BOM.
pub fn decode_input(bytes: &[u8]) -> Result<String> {
    if bytes.len() > MAX_INPUT_BYTES {
        return Err(Error::Input(format!(
            "input is {} bytes, limit is {MAX_INPUT_BYTES}",
            bytes.len()
        )));
    }
    let text = std::str::from_utf8(strip_bom(bytes))
        .map_err(|e| Error::Input(format!("input is not valid UTF-8: {e}")))?;
    if text.trim().is_empty() {
        return Err(Error::Input("input is empty".into()));
    }
    Ok(text.to_string())
}

/// Transform and pack `input` according to `plan`.
pub fn run(input: &str, plan: &Plan) -> Result<Output> {
    let (directives, body) = extract_directives(input);
    let rng = init_rng(plan.seed, input);
    let seed = rng.seed();
    let user_seed = rng.is_user_seed();

    let hints = if plan.stages.is_empty() {
        Default::default()
    } else {
        collab::hints(plan.collaborator.as_ref(), &body)?
    };
    let mut ctx = PipelineContext::new(rng, plan.settings.clone(), hints);
    let body = run_pipeline(&body, &plan.stages, &mut ctx)?;
    let stub = packer::pack(&body, &plan.packer, &mut ctx.rng)?;
    let text = assemble(&directives, &stub, seed);
    info!(
        seed,
        user_seed,
        level = plan.packer.level,
        stages = plan.stages.len(),
        input = input.len(),
        output = text.len(),
        "run complete"
    );
    Ok(Output { text, seed })
}

/// `count` independent runs, each seeded from a draw on the base seed.
pub fn generate_variants(input: &str, plan: &Plan, count: usize) -> Result<Vec<Output>> {
    let base = init_rng(plan.seed, input).seed();
    let mut seeds_rng = RunRng::from_seed(base, true);
    let seeds: Vec<i64> = (0..count).map(|_| seeds_rng.int63()).collect();
    seeds
        .par_iter()
        .map(|&seed| {
            let plan = Plan { seed: Some(seed), ..plan.clone() };
            run(input, &plan)
        })
        .collect()
}

/// `dir/stem.v<i>.ps1` beside `output`.
pub fn variant_path(output: &Path, index: usize) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".into());
    output.with_file_name(format!("{stem}.v{index}.ps1"))
}

fn staged(path: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    Ok(tmp)
}

/// Write through a temporary file in the destination directory, then rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    write_all_atomic(&[(path.to_path_buf(), bytes.to_vec())])
}

/// Write every file or none: all contents are staged before the first
/// rename, and files already renamed are removed if a later rename fails.
pub fn write_all_atomic(files: &[(PathBuf, Vec<u8>)]) -> Result<()> {
    let staged = files
        .iter()
        .map(|(path, bytes)| Ok((path, staged(path, bytes)?)))
        .collect::<Result<Vec<_>>>()?;
    let mut done: Vec<&PathBuf> = Vec::with_capacity(staged.len());
    for (path, tmp) in staged {
        if let Err(e) = tmp.persist(path) {
            for p in done {
                if let Err(err) = std::fs::remove_file(p) {
                    warn!(path = %p.display(), %err, "could not remove partial output");
                }
            }
            return Err(Error::Io(e.error));
        }
        done.push(path);
    }
    Ok(())
}
