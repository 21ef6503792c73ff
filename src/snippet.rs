//! Generated PowerShell fragments: always-true predicates, inert noise
//! statements, dead code and the debugger check.
//!
//! Every fragment is built from fresh random names so it cannot clash with
//! identifiers in the script it is mixed into.

use crate::rng::RunRng;

/// A condition that always evaluates to `$true`.
pub fn opaque_true(rng: &mut RunRng) -> String {
    match rng.intn(8) {
        0 => "1 -eq 1".to_string(),
        1 => format!("(${} = 1) -eq 1", rng.var_name(3)),
        2 => "[int]1 -eq [int]1".to_string(),
        3 => "'' -eq ''".to_string(),
        4 => {
            let a = rng.intn(50) + 1;
            format!("{a} -le {}", a + rng.intn(50) + 1)
        }
        5 => format!("'{}'.Length -gt 0", rng.ident(3)),
        6 => "$null -eq $null".to_string(),
        _ => "$true -or $false".to_string(),
    }
}

/// `if(<always true>){ body }`
pub fn wrap_opaque(rng: &mut RunRng, body: &str) -> String {
    let cond = opaque_true(rng);
    format!("if({cond}){{ {body} }}")
}

/// One statement with no observable effect.
pub fn noise_statement(rng: &mut RunRng) -> String {
    match rng.intn(14) {
        0 => format!("${} = 0", rng.var_name(4)),
        1 => format!("${} = 1 + 1", rng.var_name(4)),
        2 => format!("${} = $null", rng.var_name(4)),
        3 => {
            let (a, b) = (rng.var_name(4), rng.var_name(4));
            format!("${a} = 3; ${b} = ${a} * 2")
        }
        4 => format!("if(0 -eq 1){{ ${} = 0 }}", rng.var_name(4)),
        5 => {
            let v = rng.var_name(4);
            format!("${v} = 1; ${v} = 2")
        }
        6 => format!("${} = [int]0", rng.var_name(4)),
        7 => format!("${} = ''", rng.var_name(4)),
        8 => {
            let v = rng.var_name(4);
            format!("${v} = @({},{},{})", rng.intn(100), rng.intn(100), rng.intn(100))
        }
        9 => {
            let v = rng.var_name(4);
            format!("${v} = '{}' + '{}'", rng.ident(3), rng.ident(3))
        }
        10 => format!("${} = [string]::IsNullOrEmpty('')", rng.var_name(4)),
        11 => {
            let (v, k) = (rng.var_name(4), rng.ident(3));
            format!("${v} = @{{'{k}'={}}}", rng.intn(100))
        }
        12 => {
            let (v, w) = (rng.var_name(4), rng.var_name(4));
            format!("if($false){{ ${v} = [Math]::Sqrt({}); ${w} = ${v} }}", rng.intn(9999))
        }
        _ => {
            let v = rng.var_name(4);
            format!("${v} = {} -gt {}", rng.intn(100), rng.intn(100) + 100)
        }
    }
}

/// Zero to `max` noise statements joined by `; `. Empty when the draw is zero.
pub fn noise_block(rng: &mut RunRng, max: usize) -> String {
    let count = rng.intn(max.max(1) + 1);
    (0..count)
        .map(|_| noise_statement(rng))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Inert snippets appended by dead-code injection, each kept with probability `prob`.
pub fn dead_code(rng: &mut RunRng, prob: u8) -> Vec<String> {
    let mut out = Vec::new();
    if rng.chance(prob) {
        out.push(format!("function __dc{}{{ return }}", rng.ident(6)));
    }
    if rng.chance(prob) {
        let v = rng.var_name(5);
        out.push(format!("for(${v}=0;${v} -lt 0;${v}++){{Start-Sleep -Milliseconds 0}}"));
    }
    if rng.chance(prob) {
        let (a, b) = (rng.var_name(5), rng.var_name(5));
        out.push(format!("${a}='canary';${b}=${a}+${a}|Out-Null"));
    }
    out
}

/// Exits quietly when a managed debugger is attached.
pub fn anti_analysis(rng: &mut RunRng) -> String {
    let v = rng.var_name(6);
    format!("${v}=[System.Diagnostics.Debugger]::IsAttached;if(${v}){{exit 0}};")
}
