//! Seeded source-to-source protective rewriter and packer for PowerShell.
//!
//! A run goes through these phases:
//!
//! 1. **Directives**: lift leading `#Requires` / `using` lines out of the body
//! 2. **Pipeline**: apply the requested stages in order (rename, tokenize,
//!    encrypt, numeric, layout, opaque, shuffle, dead code, anti-analysis)
//! 3. **Pack**: encode the body into a self-decoding stub at level 1..5
//! 4. **Assemble**: directives, stub and a `# pscloak | seed=N` footer
//!
//! Every random choice comes from one seeded stream, so a seed and a set of
//! options always reproduce the same bytes.

pub mod assemble;
pub mod cipher;
pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod packer;
pub mod reserved;
pub mod resolve;
pub mod rng;
pub mod snippet;
pub mod span;
pub mod transform;

pub use config::{Options, Plan};
pub use engine::{run, Output};
pub use error::{Error, Result};
