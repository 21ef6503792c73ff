//! Variable names that are never renamed.
//!
//! PowerShell automatic and preference variables, plus the scope keywords
//! that prefix `$scope:name`. Keys are lowercase and carry no `$`.

use std::collections::HashSet;
use std::sync::LazyLock;

static RESERVED: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        // Automatic variables
        "$", "?", "^", "_", "args", "input", "null", "true", "false", "error", "foreach",
        "host", "pid", "pwd", "pshome", "psversiontable", "psboundparameters",
        "myinvocation", "pscmdlet", "psscriptroot", "pscommandpath", "lastexitcode", "ofs",
        "stacktrace", "sender", "eventargs", "event", "eventsubscriber", "nestedpromptlevel",
        "matches", "consolefilename", "shellid", "executioncontext", "this", "isglobal",
        "isscript", "psitem", "psdebugcontext", "psculture", "psuiculture", "psedition",
        "iswindows", "islinux", "ismacos", "iscoreclr", "profile", "home", "switch",
        "enabledexperimentalfeatures", "psstyle", "pssenderinfo",
        // Preference variables
        "psdefaultparametervalues", "outputencoding", "erroractionpreference",
        "warningpreference", "verbosepreference", "debugpreference", "progresspreference",
        "confirmpreference", "whatifpreference", "informationpreference", "errorview",
        "formatenumerationlimit", "maximumhistorycount", "psemailserver",
        "psmoduleautoloadingpreference", "psnativecommandargumentpassing",
        "psnativecommanduseerroractionpreference", "pssessionapplicationname",
        "pssessionconfigurationname", "pssessionoption", "transcript", "logcommandhealthevent",
        "logcommandlifecycleevent", "logengineheathevent", "logenginelifecycleevent",
        "logproviderhealthevent", "logproviderlifecycleevent",
        // Scope keywords and the environment drive
        "global", "local", "script", "private", "using", "variable", "workflow", "env",
    ]
    .into_iter()
    .collect()
});

/// Scope keywords that may prefix a variable; only the base name after `:` is renamed.
pub const SCOPES: &[&str] = &["global", "local", "script", "private", "using", "variable", "workflow"];

/// Whether `name` (with or without `$`, any case) must keep its text.
///
/// Scoped names are judged by their base, except `env:` which is always kept.
pub fn is_reserved(name: &str) -> bool {
    let name = name.strip_prefix('$').unwrap_or(name);
    if name.is_empty() {
        return true;
    }
    let lower = name.to_ascii_lowercase();
    if RESERVED.contains(lower.as_str()) {
        return true;
    }
    match lower.split_once(':') {
        Some(("env", _)) => true,
        Some((scope, base)) if is_scope(scope) => is_reserved(base),
        // Other drives (`$function:x`, `$alias:y`) are left alone
        Some(_) => true,
        None => false,
    }
}

pub fn is_scope(word: &str) -> bool {
    SCOPES.iter().any(|s| s.eq_ignore_ascii_case(word))
}
