//! Directive extraction and final file assembly.
//!
//! `#Requires` and `using` statements must stay at the top of the file; they
//! cannot run from inside `[scriptblock]::Create`, so they are lifted out
//! before any stage sees the body and put back in front of the stub.

/// UTF-8 byte order mark written in front of every output.
pub const BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

fn is_directive(trimmed: &str) -> bool {
    let lower = trimmed.to_ascii_lowercase();
    lower.starts_with("#requires") || lower.starts_with("using ")
}

/// Split the leading directive block from the body.
///
/// Blank lines and plain comments between directives travel with them. When
/// the leading block holds no real directive the whole text is the body.
pub fn extract_directives(text: &str) -> (String, String) {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut body_start = 0;
    let mut found = false;
    for line in &lines {
        let trimmed = line.trim();
        if is_directive(trimmed) {
            found = true;
        } else if !(trimmed.is_empty() || trimmed.starts_with('#')) {
            break;
        }
        body_start += 1;
    }
    if !found {
        return (String::new(), text.to_string());
    }
    (lines[..body_start].join("\n"), lines[body_start..].join("\n"))
}

/// Directives, stub and the seed footer, newline separated.
pub fn assemble(directives: &str, stub: &str, seed: i64) -> String {
    let mut out = String::new();
    if !directives.trim().is_empty() {
        out.push_str(directives.trim_end());
        out.push('\n');
    }
    out.push_str(stub);
    if !stub.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("# pscloak | seed={seed}\n"));
    out
}

/// File bytes: BOM, newline, then the assembled text.
pub fn with_bom(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(BOM.len() + 1 + text.len());
    out.extend_from_slice(BOM);
    out.push(b'\n');
    out.extend_from_slice(text.as_bytes());
    out
}

/// Drop a leading BOM, if any.
pub fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(BOM).unwrap_or(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifts_requires_and_using() {
        let text = "#Requires -Version 5.1\n# note\n\nusing namespace System.IO\nWrite-Output 1\n#Requires -Modules X";
        let (dirs, body) = extract_directives(text);
        assert_eq!(dirs, "#Requires -Version 5.1\n# note\n\nusing namespace System.IO");
        assert_eq!(body, "Write-Output 1\n#Requires -Modules X");
    }

    #[test]
    fn comments_alone_are_not_directives() {
        let text = "# header\n\nWrite-Output 1";
        let (dirs, body) = extract_directives(text);
        assert!(dirs.is_empty());
        assert_eq!(body, text);
    }

    #[test]
    fn requires_case_insensitive() {
        let (dirs, body) = extract_directives("#REQUIRES -RunAsAdministrator\r\nGet-Date");
        assert_eq!(dirs, "#REQUIRES -RunAsAdministrator\r");
        assert_eq!(body, "Get-Date");
    }

    #[test]
    fn assemble_layout() {
        assert_eq!(assemble("", "STUB", 42), "STUB\n# pscloak | seed=42\n");
        assert_eq!(
            assemble("#Requires -Version 7\n", "STUB", -3),
            "#Requires -Version 7\nSTUB\n# pscloak | seed=-3\n"
        );
    }

    #[test]
    fn bom_helpers() {
        let bytes = with_bom("x");
        assert_eq!(bytes, b"\xEF\xBB\xBF\nx");
        assert_eq!(strip_bom(&bytes), b"\nx");
        assert_eq!(strip_bom(b"plain"), b"plain");
    }
}
