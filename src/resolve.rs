//! Identifier renaming for variables and user-declared functions.
//!
//! Four variable forms share one logical name: `$name`, `$scope:name`,
//! `${name}` and the splat `@name`. Function names taken from `function Name`
//! declarations are renamed at the declaration and at every call site.
//!
//! Names are kept when they are reserved, declared parameters, class
//! properties, or (with module protection) exported functions. Functions
//! reached by name through `function:` paths or `Get-Command` keep their
//! names too. Occurrences in
//! single-quoted text, after a backtick, or inside attribute arguments are
//! never touched.

use crate::reserved;
use crate::rng::RunRng;
use crate::span::{is_inside_attribute, ScanMap, SpanKind};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

static RE_FUNC_DECL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bfunction\s+([A-Za-z_][A-Za-z0-9_-]*)\s*[\(\{]").unwrap());
static RE_FUNC_SIG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bfunction\s+[\w-]+\s*\(([^)]*)\)").unwrap());
static RE_PARAM_BLOCK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bparam\s*\(").unwrap());
static RE_CLASS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bclass\s+\w+[^{]*\{").unwrap());
// `hidden`/`static` modifiers and nested generic type annotations before the property
static RE_CLASS_PROP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*(?:(?:hidden|static)\s+)*(?:\[[\w\.\[\], ]+(?:\(.*?\))?\]\s*)*\$([A-Za-z_]\w*)")
        .unwrap()
});
static RE_THIS_PROP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\$this\.([A-Za-z_]\w*)").unwrap());
static RE_VAR_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$([A-Za-z_]\w*)").unwrap());
// ${name} | $name | $drive:name
static RE_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*)(?::([A-Za-z_][A-Za-z0-9_]*))?)")
        .unwrap()
});
static RE_SPLAT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"@([A-Za-z_][A-Za-z0-9_]*)").unwrap());
static RE_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap());
// $function:Name, ${function:Name}, Get-Item function:\Name
static RE_FUNC_PROVIDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bfunction:\\?([A-Za-z_][A-Za-z0-9_-]*)").unwrap());
static RE_COMMAND_LOOKUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:Get-Command|gcm)\s+(?:-Name\s+)?['"]?([A-Za-z_][A-Za-z0-9_-]*)"#).unwrap()
});
static RE_EXPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Export-ModuleMember\s+-Function\s+([A-Za-z0-9_\-\s,]+?)(?:\s+-[A-Za-z]|\s*$|\r|\n)").unwrap()
});

/// Names that renaming must leave alone, lowercase and without `$`.
#[derive(Debug, Default, Clone)]
pub struct ProtectedNames {
    params: HashSet<String>,
    properties: HashSet<String>,
    exported: HashSet<String>,
    looked_up: HashSet<String>,
    kept: HashSet<String>,
}

impl ProtectedNames {
    /// Collect parameter and property names from `text`. `exported` is the
    /// list of function names to keep, empty unless module protection is on.
    pub fn collect(text: &str, exported: &[String]) -> Self {
        let scan = ScanMap::new(text);
        Self {
            params: param_names(text, &scan),
            properties: class_property_names(text, &scan),
            exported: exported.iter().map(|n| n.to_ascii_lowercase()).collect(),
            looked_up: looked_up_functions(text),
            kept: HashSet::new(),
        }
    }

    /// Also keep these variable names, e.g. names emitted by earlier stages.
    pub fn with_variables(mut self, names: &[String]) -> Self {
        self.kept.extend(names.iter().map(|n| n.to_ascii_lowercase()));
        self
    }

    /// Whether the variable base name must keep its text.
    pub fn keeps_variable(&self, base: &str) -> bool {
        let lower = base.to_ascii_lowercase();
        reserved::is_reserved(&lower)
            || self.params.contains(&lower)
            || self.properties.contains(&lower)
            || self.kept.contains(&lower)
    }

    /// Whether the function must keep its name: exported, or looked up by
    /// name somewhere renaming cannot follow.
    pub fn keeps_callable(&self, callable: &str) -> bool {
        let lower = callable.to_ascii_lowercase();
        self.exported.contains(&lower) || self.looked_up.contains(&lower)
    }
}

/// Function names listed by `Export-ModuleMember -Function`.
pub fn exported_functions(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for caps in RE_EXPORT.captures_iter(text) {
        for name in caps[1].split(|c: char| c == ',' || c.is_whitespace()) {
            let name = name.trim();
            if !name.is_empty() && !out.iter().any(|n: &String| n.eq_ignore_ascii_case(name)) {
                out.push(name.to_string());
            }
        }
    }
    out
}

/// Function names reached through the function provider or `Get-Command`,
/// in code and in literals alike.
fn looked_up_functions(text: &str) -> HashSet<String> {
    RE_FUNC_PROVIDER
        .captures_iter(text)
        .chain(RE_COMMAND_LOOKUP.captures_iter(text))
        .map(|c| c[1].to_ascii_lowercase())
        .collect()
}

fn param_names(text: &str, scan: &ScanMap) -> HashSet<String> {
    let mut params = HashSet::new();
    for caps in RE_FUNC_SIG.captures_iter(text) {
        for v in RE_VAR_NAME.captures_iter(&caps[1]) {
            params.insert(v[1].to_ascii_lowercase());
        }
    }
    for m in RE_PARAM_BLOCK.find_iter(text) {
        if !scan.is_code(m.start()) {
            continue;
        }
        let open = m.end() - 1;
        let Some(close) = scan.find_matching(text, open) else {
            continue;
        };
        for v in RE_VAR_NAME.captures_iter(&text[open + 1..close]) {
            params.insert(v[1].to_ascii_lowercase());
        }
    }
    params
}

fn class_property_names(text: &str, scan: &ScanMap) -> HashSet<String> {
    let mut props = HashSet::new();
    for m in RE_CLASS.find_iter(text) {
        if !scan.is_code(m.start()) {
            continue;
        }
        let open = m.end() - 1;
        let Some(close) = scan.find_matching(text, open) else {
            continue;
        };
        for caps in RE_CLASS_PROP.captures_iter(&text[m.end()..close]) {
            props.insert(caps[1].to_ascii_lowercase());
        }
    }
    // Member access is never rewritten, so the backing name must survive
    for caps in RE_THIS_PROP.captures_iter(text) {
        props.insert(caps[1].to_ascii_lowercase());
    }
    props
}

/// Original name (lowercase) to generated name, for variables and functions.
#[derive(Debug, Default, Clone)]
pub struct RenameMapping {
    variables: HashMap<String, String>,
    callables: HashMap<String, String>,
}

impl RenameMapping {
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn callable(&self, name: &str) -> Option<&str> {
        self.callables.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.variables.len() + self.callables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hands out generated names that collide with nothing already in use.
struct NameSource<'a> {
    rng: &'a mut RunRng,
    taken: HashSet<String>,
}

impl NameSource<'_> {
    fn fresh(&mut self, original_len: usize) -> String {
        let mut len = original_len + 1;
        let mut attempts = 0;
        loop {
            let candidate = self.rng.ident(len);
            let lower = candidate.to_ascii_lowercase();
            if !self.taken.contains(&lower) && !reserved::is_reserved(&lower) {
                self.taken.insert(lower);
                return candidate;
            }
            attempts += 1;
            if attempts % 8 == 0 {
                len += 1;
            }
        }
    }
}

/// Build the rename mapping for `text`.
///
/// Function names are drawn first in declaration order, then variables in
/// order of first occurrence.
pub fn resolve(text: &str, scan: &ScanMap, protected: &ProtectedNames, rng: &mut RunRng) -> RenameMapping {
    let mut names = NameSource {
        rng,
        taken: RE_WORD.find_iter(text).map(|m| m.as_str().to_ascii_lowercase()).collect(),
    };
    let mut mapping = RenameMapping::default();

    for caps in RE_FUNC_DECL.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        if !scan.is_code(whole.start()) {
            continue;
        }
        let name = &caps[1];
        let lower = name.to_ascii_lowercase();
        if protected.keeps_callable(name) || mapping.callables.contains_key(&lower) {
            continue;
        }
        let fresh = names.fresh(name.len());
        mapping.callables.insert(lower, fresh);
    }

    for caps in RE_VAR.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        if !variable_site(text, scan, whole.start()) {
            continue;
        }
        let Some(base) = variable_base(&caps) else { continue };
        let lower = base.to_ascii_lowercase();
        if protected.keeps_variable(base) || mapping.variables.contains_key(&lower) {
            continue;
        }
        let fresh = names.fresh(base.len());
        mapping.variables.insert(lower, fresh);
    }

    mapping
}

/// The renameable base name of a `RE_VAR` match, or `None` if the token stays verbatim.
fn variable_base<'t>(caps: &regex::Captures<'t>) -> Option<&'t str> {
    if let Some(braced) = caps.get(1) {
        return Some(braced.as_str());
    }
    let head = caps.get(2)?.as_str();
    match caps.get(3) {
        None => Some(head),
        Some(base) if reserved::is_scope(head) => Some(base.as_str()),
        // `$env:X` and other drives
        Some(_) => None,
    }
}

fn variable_site(text: &str, scan: &ScanMap, pos: usize) -> bool {
    if matches!(
        scan.span_at(pos).map(|s| s.kind),
        Some(SpanKind::SingleLiteral) | Some(SpanKind::RawBlockSingle)
    ) {
        return false;
    }
    if pos > 0 && text.as_bytes()[pos - 1] == b'`' {
        return false;
    }
    !is_inside_attribute(text, pos)
}

fn callable_site(text: &str, scan: &ScanMap, start: usize, end: usize) -> bool {
    let b = text.as_bytes();
    if !scan.is_code(start) {
        return false;
    }
    if start > 0 && matches!(b[start - 1], b'.' | b'$' | b'@' | b'-' | b':') {
        return false;
    }
    if let Some(&next) = b.get(end) {
        if next == b'-' || next.is_ascii_alphanumeric() || next == b'_' {
            return false;
        }
    }
    !is_inside_attribute(text, start)
}

/// Rewrite `text` according to `mapping`.
pub fn apply(text: &str, scan: &ScanMap, mapping: &RenameMapping) -> String {
    let mut edits: Vec<(usize, usize, String)> = Vec::new();

    for caps in RE_VAR.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        if !variable_site(text, scan, whole.start()) {
            continue;
        }
        let Some(base) = variable_base(&caps) else { continue };
        let Some(fresh) = mapping.variable(base) else { continue };
        let replacement = if caps.get(1).is_some() {
            format!("${{{fresh}}}")
        } else if caps.get(3).is_some() {
            format!("${}:{fresh}", &caps[2])
        } else {
            format!("${fresh}")
        };
        edits.push((whole.start(), whole.end(), replacement));
    }

    for caps in RE_SPLAT.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let start = whole.start();
        if !scan.is_code(start) {
            continue;
        }
        if start > 0 {
            let prev = text.as_bytes()[start - 1];
            if prev == b'`' || prev.is_ascii_alphanumeric() || prev == b'_' {
                continue;
            }
        }
        if let Some(fresh) = mapping.variable(&caps[1]) {
            edits.push((start, whole.end(), format!("@{fresh}")));
        }
    }

    if let Some(re) = callable_pattern(mapping) {
        for m in re.find_iter(text) {
            if !callable_site(text, scan, m.start(), m.end()) {
                continue;
            }
            if let Some(fresh) = mapping.callable(m.as_str()) {
                edits.push((m.start(), m.end(), fresh.to_string()));
            }
        }
    }

    // Variable edits come first, so a callable inside `${name}` loses the tie
    edits.sort_by_key(|e| e.0);
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (start, end, replacement) in edits {
        if start < last {
            continue;
        }
        out.push_str(&text[last..start]);
        out.push_str(&replacement);
        last = end;
    }
    out.push_str(&text[last..]);
    out
}

/// Longest-first alternation of every renamed function name.
fn callable_pattern(mapping: &RenameMapping) -> Option<Regex> {
    if mapping.callables.is_empty() {
        return None;
    }
    let mut names: Vec<&String> = mapping.callables.keys().collect();
    names.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
    let alternation: Vec<String> = names.iter().map(|n| regex::escape(n)).collect();
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternation.join("|"))).ok()
}

/// Resolve and apply in one call.
pub fn rename(text: &str, protected: &ProtectedNames, rng: &mut RunRng) -> (String, RenameMapping) {
    let scan = ScanMap::new(text);
    let mapping = resolve(text, &scan, protected, rng);
    let out = apply(text, &scan, &mapping);
    (out, mapping)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str) -> (String, RenameMapping) {
        let protected = ProtectedNames::collect(text, &[]);
        let mut rng = RunRng::from_seed(42, true);
        rename(text, &protected, &mut rng)
    }

    #[test]
    fn function_renamed_but_parameters_kept() {
        let text = "function Add-Numbers($a, $b) { return $a + $b }\nAdd-Numbers -a 1 -b 2\nadd-numbers 3 4";
        let (out, mapping) = run(text);
        let fresh = mapping.callable("Add-Numbers").expect("function should be renamed");
        assert!(!out.contains("Add-Numbers"), "Got: {out}");
        assert_eq!(out.matches(fresh).count(), 3, "Got: {out}");
        assert!(out.contains("($a, $b)"), "Got: {out}");
        assert!(out.contains("-a 1 -b 2"), "Got: {out}");
    }

    #[test]
    fn functions_looked_up_by_name_kept() {
        for lookup in [
            "${function:Get-Thing}",
            "$function:Get-Thing",
            "Get-Item function:\\Get-Thing",
            "Get-Command Get-Thing",
            "gcm -Name 'Get-Thing'",
        ] {
            let text = format!("function Get-Thing {{ 1 }}\nfunction Other {{ 2 }}\n{lookup}\nGet-Thing");
            let (out, mapping) = run(&text);
            assert!(mapping.callable("Get-Thing").is_none(), "{lookup}: {out}");
            assert!(out.starts_with("function Get-Thing {"), "Got: {out}");
            assert!(mapping.callable("Other").is_some(), "{lookup}: {out}");
        }
    }

    #[test]
    fn param_block_names_kept() {
        let text = "param([string]$Path, [int]$Count = 3)\n$result = $Path";
        let (out, mapping) = run(text);
        assert!(out.contains("$Path"));
        assert!(out.contains("$Count"));
        assert!(mapping.variable("result").is_some());
        assert!(!out.contains("$result"), "Got: {out}");
    }

    #[test]
    fn all_forms_share_one_name() {
        let text = "$opts = @{ A = 1 }\n$script:opts = $opts\nWrite-Output \"${opts}\"\nf @opts";
        let (out, mapping) = run(text);
        let fresh = mapping.variable("opts").expect("renamed");
        assert!(out.contains(&format!("${fresh} = @{{")), "Got: {out}");
        assert!(out.contains(&format!("$script:{fresh}")), "Got: {out}");
        assert!(out.contains(&format!("${{{fresh}}}")), "Got: {out}");
        assert!(out.contains(&format!("@{fresh}")), "Got: {out}");
    }

    #[test]
    fn case_insensitive_variables() {
        let text = "$Total = 1; $total += 2; $TOTAL";
        let (out, mapping) = run(text);
        let fresh = mapping.variable("total").expect("renamed");
        assert_eq!(out.matches(fresh).count(), 3, "Got: {out}");
    }

    #[test]
    fn env_and_drives_untouched() {
        let text = "$env:PATH; $function:prompt; $x";
        let (out, _) = run(text);
        assert!(out.starts_with("$env:PATH; $function:prompt; "), "Got: {out}");
    }

    #[test]
    fn literals_and_escapes() {
        let text = "$name = 1\n'$name'\n\"$name `$name\"\n@'\n$name\n'@\n";
        let (out, mapping) = run(text);
        let fresh = mapping.variable("name").expect("renamed");
        assert!(out.contains("'$name'"), "single-quoted kept. Got: {out}");
        assert!(out.contains(&format!("\"${fresh} `$name\"")), "Got: {out}");
        assert!(out.contains("@'\n$name\n'@"), "raw block kept. Got: {out}");
    }

    #[test]
    fn reserved_and_properties_kept() {
        let text = "class Box {\n  [int]$Size\n  hidden [string]$Tag\n  Box() { $this.Size = 1 }\n}\n$_; $PSItem; $args; $Size; $Tag";
        let (out, _) = run(text);
        for kept in ["$_", "$PSItem", "$args", "$Size", "$Tag", "$this.Size"] {
            assert!(out.contains(kept), "{kept} missing. Got: {out}");
        }
    }

    #[test]
    fn attribute_arguments_kept() {
        let text = "[ValidateScript({ $limit -gt 0 })]$v = 1\n$limit = 2";
        let (out, _) = run(text);
        assert!(out.contains("{ $limit -gt 0 }"), "Got: {out}");
    }

    #[test]
    fn method_and_static_calls_not_renamed() {
        let text = "function Run { 1 }\n$o.Run(); [X]::Run(); Run";
        let (out, mapping) = run(text);
        let fresh = mapping.callable("Run").expect("renamed");
        assert!(out.contains(".Run();"), "Got: {out}");
        assert!(out.contains("[X]::Run()"), "Got: {out}");
        assert!(out.ends_with(fresh), "Got: {out}");
    }

    #[test]
    fn function_names_in_strings_kept() {
        let text = "function Greet { 'hi' }\nWrite-Output 'Greet'; \"Greet $(Greet)\"";
        let (out, mapping) = run(text);
        let fresh = mapping.callable("Greet").expect("renamed");
        assert!(out.contains("'Greet'"), "Got: {out}");
        assert!(out.contains(&format!("\"Greet $({fresh})\"")), "Got: {out}");
    }

    #[test]
    fn exported_functions_kept() {
        let text = "function Get-Thing { }\nfunction Hidden-Thing { }\nExport-ModuleMember -Function Get-Thing";
        let exported = exported_functions(text);
        assert_eq!(exported, vec!["Get-Thing".to_string()]);
        let protected = ProtectedNames::collect(text, &exported);
        let mut rng = RunRng::from_seed(1, true);
        let (out, mapping) = rename(text, &protected, &mut rng);
        assert!(mapping.callable("Get-Thing").is_none());
        assert!(out.contains("Export-ModuleMember -Function Get-Thing"), "Got: {out}");
        assert!(!out.contains("Hidden-Thing"), "Got: {out}");
    }

    #[test]
    fn generated_names_are_distinct_and_fresh() {
        let text = "$a=1;$b=2;$c=3;$d=4;$e=5;$f=6;$g=7;$h=8";
        let (_, mapping) = run(text);
        let names: HashSet<&str> = "abcdefgh"
            .chars()
            .filter_map(|c| mapping.variable(&c.to_string()))
            .collect();
        assert_eq!(names.len(), 8);
        assert!(names.iter().all(|n| n.len() >= 2));
    }

    #[test]
    fn same_seed_same_mapping() {
        let text = "function F($p) { $q = $p }\n$r = F 1";
        assert_eq!(run(text).0, run(text).0);
    }
}
