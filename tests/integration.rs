use predicates::prelude::*;
use pscloak::packer::unpack;
use std::io::Write;
use std::process::Command;
use tempfile::{NamedTempFile, TempDir};

const SCENARIO: &str = "Write-Output 'Hello'; $x = 1 + 1; Write-Output $x";

fn cmd() -> assert_cmd::Command {
    assert_cmd::Command::from(Command::new(env!("CARGO_BIN_EXE_pscloak")))
}

fn input_file(text: &str) -> NamedTempFile {
    let mut infile = NamedTempFile::new().unwrap();
    infile.write_all(text.as_bytes()).unwrap();
    infile
}

/// Run with `args` and return the written file as text, BOM and leading newline removed.
fn pscloak(input: &str, args: &[&str]) -> String {
    let infile = input_file(input);
    let outfile = NamedTempFile::new().unwrap();

    cmd()
        .args(["-i", infile.path().to_str().unwrap()])
        .args(["-o", outfile.path().to_str().unwrap()])
        .arg("-q")
        .args(args)
        .assert()
        .success();

    let bytes = std::fs::read(outfile.path()).unwrap();
    assert!(bytes.starts_with(b"\xEF\xBB\xBF\n"), "missing BOM");
    String::from_utf8(bytes[4..].to_vec()).unwrap()
}

/// Decode the payload line of a `--noexec` output.
fn decoded(output: &str, level: u8) -> String {
    let payload = output.lines().next().unwrap();
    unpack::decode(level, payload).unwrap()
}

#[test]
fn cli_level5_fixed_seed() {
    let args = ["--level", "5", "--seed", "42", "--minfrag", "10", "--maxfrag", "20"];
    let a = pscloak(SCENARIO, &args);
    let b = pscloak(SCENARIO, &args);
    assert!(a.contains("# pscloak | seed=42"), "Got: {a}");
    assert!(a.starts_with("[Console]::OutputEncoding"), "Got: {a}");
    assert_eq!(a, b);
}

#[test]
fn cli_safe_mode_round_trip() {
    for level in 1..=5u8 {
        let lvl = level.to_string();
        let out = pscloak(SCENARIO, &["--level", &lvl, "--seed", "3", "--noexec"]);
        assert_eq!(decoded(&out, level), SCENARIO, "level {level}");
    }
}

#[test]
fn cli_encrypt_without_key() {
    let infile = input_file(SCENARIO);
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out.ps1");

    cmd()
        .args(["-i", infile.path().to_str().unwrap()])
        .args(["-o", out.to_str().unwrap()])
        .args(["--pipeline", "strenc"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ConfigError"))
        .stderr(predicate::str::contains("hint:"));
    assert!(!out.exists());
}

#[test]
fn cli_substitution_literal_untouched() {
    let input = "$name = 'World'\nWrite-Output \"Hello $name\"\n";
    let out = pscloak(
        input,
        &["--pipeline", "stringdict,strenc", "--stringdict", "100", "--strkey", "a1b2c3d4", "--seed", "5", "--noexec"],
    );
    let body = decoded(&out, 1);
    assert!(body.contains("\"Hello $name\""), "Got: {body}");
    assert!(!body.contains("'World'"), "Got: {body}");
}

#[test]
fn cli_rename_keeps_parameters() {
    let input = "function Get-Greeting($Name) { \"Hi $Name\" }\nGet-Greeting -Name 'x'\nGet-Greeting 'y'\n";
    let out = pscloak(input, &["--pipeline", "iden", "--seed", "11", "--noexec"]);
    let body = decoded(&out, 1);
    assert!(!body.contains("Get-Greeting"), "Got: {body}");
    assert!(body.contains("($Name)"), "Got: {body}");
    assert!(body.contains("\"Hi $Name\""), "Got: {body}");
    assert!(body.contains(" -Name 'x'"), "Got: {body}");
}

#[test]
fn cli_module_aware_keeps_exports() {
    let input = "function Get-Thing { 1 }\nfunction helper { 2 }\nExport-ModuleMember -Function Get-Thing\n";
    let out = pscloak(input, &["--pipeline", "iden", "--module-aware", "--seed", "2", "--noexec"]);
    let body = decoded(&out, 1);
    assert!(body.contains("function Get-Thing"), "Got: {body}");
    assert!(!body.contains("function helper"), "Got: {body}");
}

#[test]
fn cli_directives_on_top() {
    let input = "#Requires -Version 5.1\nWrite-Output 1\n";
    let out = pscloak(input, &["--level", "4", "--seed", "1"]);
    assert!(out.starts_with("#Requires -Version 5.1\n[Console]"), "Got: {out}");
}

#[test]
fn cli_seed_printed_unless_quiet() {
    let infile = input_file(SCENARIO);
    cmd()
        .args(["-i", infile.path().to_str().unwrap()])
        .args(["--seed", "77"])
        .assert()
        .success()
        .stderr(predicate::str::contains("seed=77"))
        .stdout(predicate::str::contains("# pscloak | seed=77"));
}

#[test]
fn cli_reads_stdin() {
    cmd()
        .args(["--level", "2", "--noexec", "--seed", "1", "-q"])
        .write_stdin("Get-Date")
        .assert()
        .success()
        .stdout(predicate::str::contains("R2V0LURhdGU="))
        .stderr(predicate::str::is_empty());
}

#[test]
fn cli_rejects_bad_input() {
    cmd().write_stdin("").assert().failure().stderr(predicate::str::contains("InputError"));
    cmd()
        .write_stdin(vec![0xFFu8, 0xFE, 0x00])
        .assert()
        .failure()
        .stderr(predicate::str::contains("UTF-8"));
}

#[test]
fn cli_rejects_bad_level() {
    cmd()
        .args(["--level", "9"])
        .write_stdin(SCENARIO)
        .assert()
        .failure()
        .stderr(predicate::str::contains("ConfigError"));
}

#[test]
fn cli_missing_input() {
    cmd()
        .args(["-i", "/tmp/nonexistent_pscloak_test_xyz.ps1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn cli_variants() {
    let infile = input_file(SCENARIO);
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("build.ps1");

    cmd()
        .args(["-i", infile.path().to_str().unwrap()])
        .args(["-o", out.to_str().unwrap()])
        .args(["--level", "5", "--seed", "9", "--variants", "3"])
        .assert()
        .success()
        .stderr(predicate::str::contains("build.v2.ps1"));

    let texts: Vec<String> = (0..3)
        .map(|i| std::fs::read_to_string(dir.path().join(format!("build.v{i}.ps1"))).unwrap())
        .collect();
    assert_ne!(texts[0], texts[1]);
    assert_ne!(texts[1], texts[2]);
    assert!(!out.exists());
}

#[test]
fn cli_full_pipeline() {
    let input = r#"[CmdletBinding()]
param([string]$Target = 'localhost')

function Test-Reach($HostName) {
    $count = 3
    $result = "pinging $HostName"
    Write-Output $result
    return $count
}

function Format-Report($Items) {
    $Items | ForEach-Object { "item: $_" }
}

$h = @"
Report for $Target
"@
Test-Reach -HostName $Target
Format-Report -Items @(1, 2, 3)
Write-Output 'a moderately long literal string'
"#;
    let args = [
        "--pipeline",
        "iden,stringdict,strenc,numenc,fmt,cf,dead,anti",
        "--strkey",
        "00112233",
        "--strenc",
        "rc4",
        "--deadcode",
        "100",
        "--level",
        "5",
        "--integrity",
        "--seed",
        "1234",
    ];
    let a = pscloak(input, &args);
    let b = pscloak(input, &args);
    assert_eq!(a, b);
    assert!(a.ends_with("# pscloak | seed=1234\n"), "Got: {a}");
}
