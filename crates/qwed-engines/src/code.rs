//! Static code security analysis.
//!
//! The analyzer never executes anything. Source is parsed into a flat
//! statement model (imports, function definitions, assignments, calls) and
//! walked with a rule catalogue producing severity-tagged issues. Taint from
//! request-boundary sources propagates through assignments, aliases, and up
//! to two function-call hops before reaching a sink.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeIssue {
    pub severity: Severity,
    pub rule: String,
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeReport {
    pub issues: Vec<CodeIssue>,
}

impl CodeReport {
    pub fn has_critical(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }

    pub fn has_high(&self) -> bool {
        self.issues.iter().any(|i| i.severity >= Severity::High)
    }
}

/// Identifiers whose values arrive from the request boundary.
pub const DEFAULT_TAINT_SOURCES: &[&str] =
    &["request", "input", "argv", "params", "user_input", "payload"];

const PASSWORD_HINTS: &[&str] = &["password", "passwd", "pwd", "secret", "token", "credential"];
const SECRET_ASSIGN_HINTS: &[&str] = &["key", "secret", "token"];
const WEAK_HASHES: &[&str] = &["md5", "sha1"];
const SHA_FAMILY: &[&str] = &["sha224", "sha256", "sha384", "sha512"];

const DANGEROUS_CALLS: &[(&str, &str)] = &[
    ("eval", "dynamic code execution"),
    ("exec", "dynamic code execution"),
    ("compile", "dynamic code compilation"),
    ("os.system", "shell command execution"),
    ("os.popen", "shell command execution"),
    ("subprocess.call", "subprocess execution"),
    ("subprocess.run", "subprocess execution"),
    ("subprocess.Popen", "subprocess execution"),
    ("subprocess.check_output", "subprocess execution"),
    ("pickle.load", "deserialization that can execute code"),
    ("pickle.loads", "deserialization that can execute code"),
    ("marshal.load", "deserialization that can execute code"),
    ("marshal.loads", "deserialization that can execute code"),
    ("yaml.load", "unsafe YAML load"),
    ("ctypes.CDLL", "native library load"),
];

const NETWORK_FS_SINKS: &[&str] = &[
    "open",
    "os.remove",
    "os.unlink",
    "os.rename",
    "shutil.rmtree",
    "shutil.copy",
    "socket.socket",
    "socket.connect",
    "requests.get",
    "requests.post",
    "requests.put",
    "requests.delete",
    "urllib.request.urlopen",
    "httpx.get",
    "httpx.post",
];

static CALL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<name>[A-Za-z_][A-Za-z0-9_.]*)\s*\(").expect("static regex")
});
static ASSIGN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?P<target>[A-Za-z_][A-Za-z0-9_]*)\s*(?::[^=]+)?=(?P<rhs>[^=].*)$")
        .expect("static regex")
});
static DEF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*def\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)\s*\((?P<params>[^)]*)\)")
        .expect("static regex")
});
static STRING_LIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"["']([^"']*)["']"#).expect("static regex"));
static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("static regex"));

#[derive(Debug, Clone)]
struct Line {
    number: usize,
    indent: usize,
    text: String,
}

#[derive(Debug, Clone)]
struct FnDef {
    name: String,
    params: Vec<String>,
    body: Vec<usize>, // indices into lines
}

/// Analyze one source snippet. `language` only tunes the comment stripper;
/// the rule catalogue is shared.
pub fn analyze(code: &str, language: &str, taint_sources: &[String]) -> CodeReport {
    let lines = split_lines(code, language);
    let defs = collect_defs(&lines);
    let mut issues = Vec::new();

    dangerous_call_rules(&lines, &mut issues);
    dynamic_import_rules(&lines, &mut issues);
    reflection_rules(&lines, &mut issues);
    self_recursion_rule(&lines, &defs, &mut issues);
    weak_hash_rules(&lines, &mut issues);
    hardcoded_secret_rule(&lines, &mut issues);
    taint_rules(&lines, &defs, taint_sources, &mut issues);

    issues.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.line.cmp(&b.line)));
    issues.dedup_by(|a, b| a.rule == b.rule && a.line == b.line);
    CodeReport { issues }
}

fn split_lines(code: &str, language: &str) -> Vec<Line> {
    let comment = if matches!(language, "javascript" | "typescript" | "go" | "rust") {
        "//"
    } else {
        "#"
    };
    let mut out = Vec::new();
    for (idx, raw) in code.lines().enumerate() {
        let number = idx + 1;
        let stripped = match raw.find(comment) {
            Some(pos) if !inside_string(raw, pos) => &raw[..pos],
            _ => raw,
        };
        // `;`-joined statements share their physical line number.
        for segment in split_outside_strings(stripped, ';') {
            let indent = segment.len() - segment.trim_start().len();
            let text = segment.trim_end().to_string();
            if !text.trim().is_empty() {
                out.push(Line {
                    number,
                    indent,
                    text,
                });
            }
        }
    }
    out
}

fn split_outside_strings(line: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut start = 0usize;
    for (i, c) in line.char_indices() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            c if c == sep && !in_single && !in_double => {
                parts.push(&line[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&line[start..]);
    parts
}

fn inside_string(line: &str, idx: usize) -> bool {
    let mut in_single = false;
    let mut in_double = false;
    for (i, c) in line.char_indices() {
        if i == idx {
            return in_single || in_double;
        }
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            _ => {}
        }
    }
    false
}

fn collect_defs(lines: &[Line]) -> Vec<FnDef> {
    let mut defs = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if let Some(caps) = DEF_RE.captures(&lines[i].text) {
            let indent = lines[i].indent;
            let mut body = Vec::new();
            let mut j = i + 1;
            while j < lines.len() && lines[j].indent > indent {
                body.push(j);
                j += 1;
            }
            // One-liner form: `def f(): f()`
            if body.is_empty() {
                if let Some(colon) = lines[i].text.find("):") {
                    let tail = lines[i].text[colon + 2..].trim();
                    if !tail.is_empty() {
                        body.push(i);
                    }
                }
            }
            defs.push(FnDef {
                name: caps["name"].to_string(),
                params: caps["params"]
                    .split(',')
                    .map(|p| p.split(&[':', '='][..]).next().unwrap_or("").trim().to_string())
                    .filter(|p| !p.is_empty() && p != "self")
                    .collect(),
                body,
            });
        }
        i += 1;
    }
    defs
}

fn calls_in(text: &str) -> Vec<(String, String)> {
    CALL_RE
        .captures_iter(text)
        .map(|caps| {
            let name = caps["name"].to_string();
            let start = caps.get(0).expect("whole match").end();
            let args = call_args(text, start);
            (name, args)
        })
        .collect()
}

/// Raw argument text of a call whose open paren ends at `start`.
fn call_args(text: &str, start: usize) -> String {
    let mut depth = 1;
    let mut out = String::new();
    for c in text[start..].chars() {
        match c {
            '(' => {
                depth += 1;
                out.push(c);
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn dangerous_call_rules(lines: &[Line], issues: &mut Vec<CodeIssue>) {
    for line in lines {
        for (name, _args) in calls_in(&line.text) {
            if let Some((_, reason)) = DANGEROUS_CALLS.iter().find(|(d, _)| *d == name) {
                issues.push(CodeIssue {
                    severity: Severity::Critical,
                    rule: "dangerous-call".into(),
                    line: line.number,
                    message: format!("Use of dangerous function: {name} ({reason})"),
                });
            }
        }
        // `import os` alone is not an issue; `from os import system` is a
        // disguised shell spawner.
        if line.text.trim_start().starts_with("from os import")
            && line.text.contains("system")
        {
            issues.push(CodeIssue {
                severity: Severity::Critical,
                rule: "dangerous-call".into(),
                line: line.number,
                message: "Use of dangerous function: os.system (shell command execution)".into(),
            });
        }
    }
}

fn dynamic_import_rules(lines: &[Line], issues: &mut Vec<CodeIssue>) {
    for line in lines {
        for (name, args) in calls_in(&line.text) {
            if name == "__import__" || name == "importlib.import_module" {
                let trimmed = args.trim();
                let literal = trimmed.starts_with('"') || trimmed.starts_with('\'');
                let severity = if literal {
                    Severity::High
                } else {
                    Severity::Critical
                };
                issues.push(CodeIssue {
                    severity,
                    rule: "dynamic-import".into(),
                    line: line.number,
                    message: format!("Dynamic import via {name}"),
                });
            }
        }
    }
}

fn reflection_rules(lines: &[Line], issues: &mut Vec<CodeIssue>) {
    for line in lines {
        for (name, args) in calls_in(&line.text) {
            if name == "getattr" || name == "setattr" {
                let second = args.split(',').nth(1).map(str::trim).unwrap_or("");
                let literal = second.starts_with('"') || second.starts_with('\'');
                if !literal && !second.is_empty() {
                    issues.push(CodeIssue {
                        severity: Severity::Critical,
                        rule: "reflection-dispatch".into(),
                        line: line.number,
                        message: format!("Reflection dispatch with non-literal name via {name}"),
                    });
                }
            }
        }
    }
}

fn self_recursion_rule(lines: &[Line], defs: &[FnDef], issues: &mut Vec<CodeIssue>) {
    for def in defs {
        let Some(&first) = def.body.first() else {
            continue;
        };
        if def.body.len() == 1 {
            let body_text = &lines[first].text;
            let body_tail = body_text
                .find("):")
                .map(|i| &body_text[i + 2..])
                .unwrap_or(body_text);
            let self_call = format!("{}(", def.name);
            if body_tail.trim().starts_with(&self_call)
                || body_tail.trim() == format!("{})", self_call)
            {
                issues.push(CodeIssue {
                    severity: Severity::Critical,
                    rule: "infinite-recursion".into(),
                    line: lines[first].number,
                    message: format!(
                        "Function {} unconditionally calls itself",
                        def.name
                    ),
                });
            }
        }
    }
}

fn name_contains(name: &str, hints: &[&str]) -> bool {
    let lower = name.to_lowercase();
    hints.iter().any(|h| lower.contains(h))
}

fn weak_hash_rules(lines: &[Line], issues: &mut Vec<CodeIssue>) {
    for line in lines {
        for (name, args) in calls_in(&line.text) {
            let hash = name.rsplit('.').next().unwrap_or(&name);
            let arg_names: Vec<&str> = IDENT_RE.find_all_str(&args);
            let password_ctx = arg_names.iter().any(|a| name_contains(a, PASSWORD_HINTS));
            if WEAK_HASHES.contains(&hash) && password_ctx {
                issues.push(CodeIssue {
                    severity: Severity::Critical,
                    rule: "weak-hash-password".into(),
                    line: line.number,
                    message: format!("Weak hash {hash} used on credential material"),
                });
            }
            if SHA_FAMILY.contains(&hash) && password_ctx && !args.contains('+') {
                issues.push(CodeIssue {
                    severity: Severity::Medium,
                    rule: "unsalted-hash-password".into(),
                    line: line.number,
                    message: format!("{hash} over credential material without a salt"),
                });
            }
        }
    }
}

fn hardcoded_secret_rule(lines: &[Line], issues: &mut Vec<CodeIssue>) {
    for line in lines {
        let Some(caps) = ASSIGN_RE.captures(&line.text) else {
            continue;
        };
        let target = &caps["target"];
        if !name_contains(target, SECRET_ASSIGN_HINTS) {
            continue;
        }
        for lit in STRING_LIT_RE.captures_iter(&caps["rhs"]) {
            let value = &lit[1];
            if value.len() > 20 && shannon_entropy(value) > 3.5 {
                issues.push(CodeIssue {
                    severity: Severity::Critical,
                    rule: "hardcoded-secret".into(),
                    line: line.number,
                    message: format!("High-entropy constant assigned to {target}"),
                });
            }
        }
    }
}

/// Bits per character.
fn shannon_entropy(s: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }
    let len = s.chars().count() as f64;
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / len;
            -p * p.log2()
        })
        .sum()
}

fn taint_rules(
    lines: &[Line],
    defs: &[FnDef],
    sources: &[String],
    issues: &mut Vec<CodeIssue>,
) {
    let mut tainted: HashSet<String> = sources.iter().cloned().collect();

    // Two propagation passes cover assignment chains and up to two function
    // hops: caller-arg -> param (hop 1), param passed onward (hop 2).
    for _hop in 0..2 {
        for line in lines {
            if let Some(caps) = ASSIGN_RE.captures(&line.text) {
                let rhs_idents: Vec<&str> = IDENT_RE.find_all_str(&caps["rhs"]);
                if rhs_idents.iter().any(|i| tainted.contains(*i)) {
                    tainted.insert(caps["target"].to_string());
                }
            }
            for (name, args) in calls_in(&line.text) {
                let Some(def) = defs.iter().find(|d| d.name == name) else {
                    continue;
                };
                let arg_list: Vec<&str> = args.split(',').map(str::trim).collect();
                for (pos, arg) in arg_list.iter().enumerate() {
                    let arg_idents: Vec<&str> = IDENT_RE.find_all_str(arg);
                    if arg_idents.iter().any(|i| tainted.contains(*i)) {
                        if let Some(param) = def.params.get(pos) {
                            tainted.insert(param.clone());
                        }
                    }
                }
            }
        }
    }

    for line in lines {
        for (name, args) in calls_in(&line.text) {
            if !NETWORK_FS_SINKS.contains(&name.as_str()) {
                continue;
            }
            let arg_idents: Vec<&str> = IDENT_RE.find_all_str(&args);
            if arg_idents.iter().any(|i| tainted.contains(*i)) {
                issues.push(CodeIssue {
                    severity: Severity::High,
                    rule: "tainted-sink".into(),
                    line: line.number,
                    message: format!("Request-derived data reaches {name}"),
                });
            }
        }
    }
}

trait FindAllStr {
    fn find_all_str<'t>(&self, text: &'t str) -> Vec<&'t str>;
}

impl FindAllStr for Regex {
    fn find_all_str<'t>(&self, text: &'t str) -> Vec<&'t str> {
        self.find_iter(text).map(|m| m.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(code: &str) -> CodeReport {
        let sources: Vec<String> = DEFAULT_TAINT_SOURCES.iter().map(|s| s.to_string()).collect();
        analyze(code, "python", &sources)
    }

    #[test]
    fn os_system_is_critical() {
        let report = run("import os; os.system('rm -rf /')");
        assert!(report.has_critical());
        assert!(report
            .issues
            .iter()
            .any(|i| i.message.contains("Use of dangerous function: os.system")));
    }

    #[test]
    fn eval_is_critical() {
        let report = run("result = eval(user_input)");
        assert!(report.has_critical());
    }

    #[test]
    fn clean_code_has_no_issues() {
        let report = run("def add(a, b):\n    return a + b\n\ntotal = add(1, 2)");
        assert!(report.issues.is_empty());
    }

    #[test]
    fn dynamic_import_with_variable_is_critical() {
        let report = run("mod = __import__(module_name)");
        assert!(report
            .issues
            .iter()
            .any(|i| i.rule == "dynamic-import" && i.severity == Severity::Critical));
    }

    #[test]
    fn reflection_with_nonliteral_name() {
        let report = run("handler = getattr(obj, action)");
        assert!(report
            .issues
            .iter()
            .any(|i| i.rule == "reflection-dispatch"));
        let quiet = run("handler = getattr(obj, 'run')");
        assert!(!quiet.issues.iter().any(|i| i.rule == "reflection-dispatch"));
    }

    #[test]
    fn self_recursion_pattern() {
        let report = run("def f(): f()");
        assert!(report
            .issues
            .iter()
            .any(|i| i.rule == "infinite-recursion"));
    }

    #[test]
    fn weak_hash_on_password() {
        let report = run("digest = hashlib.md5(password)");
        assert!(report
            .issues
            .iter()
            .any(|i| i.rule == "weak-hash-password" && i.severity == Severity::Critical));
    }

    #[test]
    fn unsalted_sha_on_password_is_medium() {
        let report = run("digest = hashlib.sha256(password)");
        assert!(report
            .issues
            .iter()
            .any(|i| i.rule == "unsalted-hash-password" && i.severity == Severity::Medium));
        let salted = run("digest = hashlib.sha256(salt + password)");
        assert!(!salted
            .issues
            .iter()
            .any(|i| i.rule == "unsalted-hash-password"));
    }

    #[test]
    fn hardcoded_secret_detection() {
        let report = run("api_key = \"sk_A9f3KZpQ7rX2mN8vB5tY1wL6\"");
        assert!(report
            .issues
            .iter()
            .any(|i| i.rule == "hardcoded-secret"));
        let quiet = run("api_key = \"aaaaaaaaaaaaaaaaaaaaaaaaaa\"");
        assert!(!quiet.issues.iter().any(|i| i.rule == "hardcoded-secret"));
    }

    #[test]
    fn taint_flows_through_two_hops() {
        let code = "def outer(data):\n    inner(data)\ndef inner(path):\n    open(path)\nouter(request)";
        let report = run(code);
        assert!(report
            .issues
            .iter()
            .any(|i| i.rule == "tainted-sink" && i.message.contains("open")));
    }

    #[test]
    fn untainted_sink_is_quiet() {
        let report = run("open('static-config.yaml')");
        assert!(!report.issues.iter().any(|i| i.rule == "tainted-sink"));
    }
}
