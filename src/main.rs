//! `pscloak` command line.

use anyhow::{Context, Result};
use clap::Parser;
use pscloak::engine::{self, decode_input, generate_variants, variant_path, write_all_atomic, write_atomic};
use pscloak::Options;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pscloak", version, about = "Seeded protective rewriter and packer for PowerShell scripts")]
struct Cli {
    /// Input script (reads stdin when omitted)
    #[arg(short = 'i')]
    input: Option<PathBuf>,

    /// Output file (writes stdout when omitted)
    #[arg(short = 'o')]
    output: Option<PathBuf>,

    /// Packer level (1..5)
    #[arg(short = 'l', long = "level", default_value_t = 1)]
    level: u8,

    /// Comma-separated stages: iden,stringdict,strenc,numenc,fmt,cf,opaque,shuffle,dead,anti
    #[arg(short = 'p', long = "pipeline", default_value = "")]
    pipeline: String,

    /// Percentage of eligible literals to tokenize (0..100)
    #[arg(long = "stringdict", default_value_t = 30)]
    stringdict: u32,

    /// Literal cipher: xor or rc4
    #[arg(long = "strenc", default_value = "xor")]
    strenc: String,

    /// Hex key for literal encryption (at least 4 bytes)
    #[arg(long = "strkey", default_value = "")]
    strkey: String,

    /// Dead-code injection probability (0..100)
    #[arg(long = "deadcode", default_value_t = 0)]
    deadcode: u32,

    /// Minimum level-5 fragment size
    #[arg(long = "minfrag")]
    minfrag: Option<usize>,

    /// Maximum level-5 fragment size
    #[arg(long = "maxfrag")]
    maxfrag: Option<usize>,

    /// Fragment profile: profile=tight|medium|loose|pro
    #[arg(long = "frag")]
    frag: Option<String>,

    /// Allow flow stages on code with try/catch/finally/trap
    #[arg(long = "flow-unsafe")]
    flow_unsafe: bool,

    /// Keep exported functions and module surface names
    #[arg(long = "module-aware")]
    module_aware: bool,

    /// Also transform literals passed to Invoke-Expression, Add-Type and friends
    #[arg(long = "no-context-aware")]
    no_context_aware: bool,

    /// Level 5: verify the decoded body before running it
    #[arg(long = "integrity")]
    integrity: bool,

    /// Level 5: drop the always-true wrapper around the exec call
    #[arg(long = "no-exec-wrapper")]
    no_exec_wrapper: bool,

    /// Emit only the payload, without the exec stub
    #[arg(long = "noexec")]
    noexec: bool,

    /// Seed for a reproducible build (random when omitted)
    #[arg(long = "seed", allow_hyphen_values = true)]
    seed: Option<i64>,

    /// Parser collaborator command (script on stdin, JSON on stdout)
    #[arg(long = "parser")]
    parser: Option<String>,

    /// Parser collaborator timeout in seconds
    #[arg(long = "parser-timeout", default_value_t = 30)]
    parser_timeout: u64,

    /// Fail instead of falling back when the parser is unavailable
    #[arg(long = "require-parser")]
    require_parser: bool,

    /// Write N variants named <stem>.v<i>.ps1 beside the output. Requires -o.
    #[arg(long = "variants", default_value_t = 0)]
    variants: usize,

    /// Do not print the seed
    #[arg(short = 'q')]
    quiet: bool,
}

impl Cli {
    fn options(&self) -> Options {
        Options {
            level: self.level,
            pipeline: self.pipeline.clone(),
            tokenize_percent: self.stringdict,
            cipher: self.strenc.clone(),
            key: self.strkey.clone(),
            dead_code_prob: self.deadcode,
            min_frag: self.minfrag,
            max_frag: self.maxfrag,
            frag_profile: self.frag.clone(),
            flow_safe: !self.flow_unsafe,
            module_protection: self.module_aware,
            context_protection: !self.no_context_aware,
            integrity: self.integrity,
            exec_wrapper: !self.no_exec_wrapper,
            no_exec: self.noexec,
            seed: self.seed,
            parser: self.parser.clone(),
            parser_timeout: Duration::from_secs(self.parser_timeout),
            require_parser: self.require_parser,
        }
    }
}

fn read_input(cli: &Cli) -> Result<Vec<u8>> {
    match &cli.input {
        Some(path) => std::fs::read(path).with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf).context("Failed to read stdin")?;
            Ok(buf)
        }
    }
}

fn try_main(cli: &Cli) -> Result<()> {
    // Options first: a bad flag must fail before the input is touched
    let plan = cli.options().validate()?;
    let input = decode_input(&read_input(cli)?)?;

    if cli.variants > 0 {
        let output = cli.output.as_ref().context("--variants requires -o")?;
        let outputs = generate_variants(&input, &plan, cli.variants)?;
        let files: Vec<_> = outputs.iter().enumerate().map(|(i, out)| (variant_path(output, i), out.to_bytes())).collect();
        write_all_atomic(&files).with_context(|| format!("Failed to write variants of {}", output.display()))?;
        if !cli.quiet {
            for ((path, _), out) in files.iter().zip(&outputs) {
                eprintln!("{}: seed={}", path.display(), out.seed);
            }
        }
        return Ok(());
    }

    let out = engine::run(&input, &plan)?;
    match &cli.output {
        Some(path) => {
            write_atomic(path, &out.to_bytes()).with_context(|| format!("Failed to write {}", path.display()))?
        }
        None => std::io::stdout().write_all(&out.to_bytes()).context("Failed to write stdout")?,
    }
    if !cli.quiet {
        eprintln!("seed={}", out.seed);
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match try_main(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<pscloak::Error>() {
                Some(e) => {
                    eprintln!("{}: {e}", e.kind());
                    if let Some(hint) = e.hint() {
                        eprintln!("hint: {hint}");
                    }
                }
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
