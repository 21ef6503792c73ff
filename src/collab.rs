//! Client for the external parser collaborator.
//!
//! The collaborator is any program that reads a script on stdin and prints a
//! JSON object as its last stdout line:
//!
//! ```json
//! {"executableStringSpans": [[12, 40]], "exportedNames": ["Get-Thing"], "error": null}
//! ```
//!
//! Span offsets count characters of the body. Spans are turned into the
//! literal texts they cover right away, so stages that shift offsets later
//! can still match them.

use crate::error::{Error, Result};
use crate::transform::ParserHints;
use serde::Deserialize;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How to reach the collaborator.
#[derive(Debug, Clone)]
pub struct Collaborator {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub timeout: Duration,
    /// Fail the run instead of falling back to heuristics.
    pub required: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Response {
    #[serde(default, alias = "executableStrings")]
    executable_string_spans: Vec<[usize; 2]>,
    #[serde(default, alias = "exportedFunctions")]
    exported_names: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse collaborator stdout: the last line that looks like a JSON object wins.
fn parse_response(stdout: &str) -> Result<Response> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('{'))
        .ok_or_else(|| Error::Collaborator("no JSON object on stdout".into()))?;
    let resp: Response =
        serde_json::from_str(line).map_err(|e| Error::Collaborator(format!("bad response: {e}")))?;
    match resp.error.as_deref() {
        Some(err) if !err.trim().is_empty() => Err(Error::Collaborator(err.trim().to_string())),
        _ => Ok(resp),
    }
}

/// Character span to the text it covers. Out-of-range spans are dropped.
fn span_text(body: &str, start: usize, end: usize) -> Option<String> {
    if start >= end {
        return None;
    }
    let mut offsets = body.char_indices().map(|(i, _)| i).chain(std::iter::once(body.len()));
    let from = offsets.nth(start)?;
    let to = offsets.nth(end - start - 1)?;
    Some(body[from..to].to_string())
}

fn to_hints(body: &str, resp: Response) -> ParserHints {
    let literals: Vec<String> = resp
        .executable_string_spans
        .iter()
        .filter_map(|&[s, e]| span_text(body, s, e))
        .collect();
    ParserHints { executable_literals: Some(literals), exported: Some(resp.exported_names) }
}

impl Collaborator {
    fn query(&self, body: &str) -> Result<Response> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| Error::Collaborator("empty command".into()))?;
        debug!("Executing: {} {:?}", program, args);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Collaborator(format!("failed to spawn '{program}': {e}")))?;

        // Feed and drain on helper threads so a large body cannot fill a pipe
        let mut stdin = child.stdin.take();
        let input = body.to_string();
        let writer = thread::spawn(move || {
            if let Some(pipe) = stdin.as_mut() {
                let _ = pipe.write_all(input.as_bytes());
            }
        });
        let mut stdout = child.stdout.take();
        let reader = thread::spawn(move || {
            let mut out = String::new();
            if let Some(pipe) = stdout.as_mut() {
                let _ = pipe.read_to_string(&mut out);
            }
            out
        });

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Collaborator(format!(
                    "'{program}' timed out after {} seconds",
                    self.timeout.as_secs()
                )));
            }
        };
        let _ = writer.join();
        let stdout = reader
            .join()
            .map_err(|_| Error::Collaborator("stdout reader panicked".into()))?;
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            return Err(Error::Collaborator(format!("'{program}' failed with exit code {code}")));
        }
        parse_response(&stdout)
    }
}

/// Ask the collaborator, if one is configured, for hints about `body`.
///
/// Failures degrade to empty hints with a warning unless the collaborator is
/// required.
pub fn hints(collab: Option<&Collaborator>, body: &str) -> Result<ParserHints> {
    let Some(collab) = collab else {
        return Ok(ParserHints::default());
    };
    match collab.query(body) {
        Ok(resp) => {
            debug!(
                spans = resp.executable_string_spans.len(),
                exported = resp.exported_names.len(),
                "parser collaborator answered"
            );
            Ok(to_hints(body, resp))
        }
        Err(e) if collab.required => Err(e),
        Err(e) => {
            warn!("parser collaborator unavailable, using heuristics: {e}");
            Ok(ParserHints::default())
        }
    }
}
