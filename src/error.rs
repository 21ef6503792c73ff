//! Error taxonomy for a pscloak run.
//!
//! Every kind is fatal: the driver stops at the first error and writes
//! nothing. Collaborator failures only surface here when the caller asked for
//! the parser to be mandatory; otherwise the run falls back to heuristics.

use thiserror::Error;

/// Errors that can occur during a run.
#[derive(Error, Debug)]
pub enum Error {
    /// Input rejected before any transform (empty, not UTF-8, too large)
    #[error("input error: {0}")]
    Input(String),

    /// Options rejected before any transform
    #[error("config error: {0}")]
    Config(String),

    /// A pipeline stage could not produce valid output
    #[error("transform {stage} failed: {reason}")]
    Transform { stage: &'static str, reason: String },

    /// The packer could not encode the body
    #[error("packer error: {0}")]
    Packer(String),

    /// The external parser was required but failed or timed out
    #[error("parser collaborator unavailable: {0}")]
    Collaborator(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short kind label used in CLI diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Input(_) => "InputError",
            Error::Config(_) => "ConfigError",
            Error::Transform { .. } => "TransformError",
            Error::Packer(_) => "PackerError",
            Error::Collaborator(_) => "CollaboratorError",
            Error::Io(_) => "IoError",
        }
    }

    /// One-line remediation hint, when there is an obvious one.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::Input(msg) if msg.contains("UTF-8") => {
                Some("save the script as UTF-8 (with or without BOM)")
            }
            Error::Config(msg) if msg.contains("key") => {
                Some("pass a hex key of at least 4 bytes with --strkey")
            }
            Error::Transform { .. } => Some("retry with a lower level or fewer stages"),
            Error::Collaborator(_) => Some("drop --require-parser to fall back to built-in heuristics"),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
