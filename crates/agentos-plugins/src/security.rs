//! Static source-code security scan.
//!
//! [`SecurityScanner`] walks a plugin directory and matches every line of every
//! text source file against two rule sets. *Forbidden* rules (dynamic code
//! evaluation, process control, child-process spawning) block the load;
//! *suspicious* rules (raw fs/net modules, environment access, `unsafe`) only
//! produce warnings. Hosts can extend both sets through configuration.

use std::path::Path;

use regex::Regex;
use serde::Serialize;
use walkdir::{DirEntry, WalkDir};

use crate::error::{PluginError, Result};

/// File extensions treated as scannable source.
pub const SCANNED_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "ts", "rs", "py", "wat"];

/// Directories never descended into.
pub const SKIPPED_DIRS: &[&str] = &["node_modules", "target"];

const FORBIDDEN_RULES: &[(&str, &str)] = &[
    ("dynamic code evaluation", r"\beval\s*\("),
    ("dynamic function construction", r"\bnew\s+Function\s*\("),
    ("dynamic import evaluation", r"__import__\s*\("),
    (
        "child process import",
        r#"(require\s*\(\s*['"](node:)?child_process['"]\s*\)|from\s+['"](node:)?child_process['"])"#,
    ),
    ("process termination", r"\bprocess\s*\.\s*(exit|kill|abort)\s*\("),
    ("process spawning", r"(std::process::Command|\bCommand::new\s*\()"),
    ("shell execution", r"\b(os\.system|os\.popen|subprocess\.\w+)\s*\("),
    ("process exit", r"std::process::(exit|abort)\s*\("),
];

const SUSPICIOUS_RULES: &[(&str, &str)] = &[
    (
        "raw filesystem or network module",
        r#"(require\s*\(\s*['"](node:)?(fs|net|http|https|dgram|tls|os)['"]\s*\)|from\s+['"](node:)?(fs|net|http|https|dgram|tls|os)['"])"#,
    ),
    ("environment access", r"(process\s*\.\s*env\b|std::env::var|os\.environ|os\.getenv)"),
    ("unsafe block", r"\bunsafe\s*\{"),
    ("raw socket import", r"^\s*import\s+socket\b"),
    ("wasi import", r#"\(import\s+"wasi"#),
];

/// Whether a match blocks the load or only warns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingKind {
    Forbidden,
    Suspicious,
}

/// One rule match in one source line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub kind: FindingKind,
    /// Human-readable rule name.
    pub rule: String,
    /// Path relative to the scanned root.
    pub file: String,
    /// 1-based line number.
    pub line: usize,
}

struct Rule {
    name: String,
    regex: Regex,
}

fn compile(name: &str, pattern: &str) -> Result<Rule> {
    let regex = Regex::new(pattern).map_err(|e| PluginError::InvalidPattern {
        pattern: pattern.to_owned(),
        reason: e.to_string(),
    })?;
    Ok(Rule {
        name: name.to_owned(),
        regex,
    })
}

/// Line-oriented pattern scanner over plugin source files.
pub struct SecurityScanner {
    forbidden: Vec<Rule>,
    suspicious: Vec<Rule>,
}

impl SecurityScanner {
    /// Scanner with the built-in rule sets only.
    pub fn new() -> Result<Self> {
        Self::with_extra_patterns(&[], &[])
    }

    /// Scanner with the built-in rule sets extended by custom patterns.
    pub fn with_extra_patterns(forbidden: &[String], suspicious: &[String]) -> Result<Self> {
        let mut forbidden_rules = FORBIDDEN_RULES
            .iter()
            .map(|(name, pattern)| compile(name, pattern))
            .collect::<Result<Vec<_>>>()?;
        for pattern in forbidden {
            forbidden_rules.push(compile(&format!("custom pattern `{pattern}`"), pattern)?);
        }

        let mut suspicious_rules = SUSPICIOUS_RULES
            .iter()
            .map(|(name, pattern)| compile(name, pattern))
            .collect::<Result<Vec<_>>>()?;
        for pattern in suspicious {
            suspicious_rules.push(compile(&format!("custom pattern `{pattern}`"), pattern)?);
        }

        Ok(Self {
            forbidden: forbidden_rules,
            suspicious: suspicious_rules,
        })
    }

    /// Scan one file's contents. `file` is only used to label findings.
    pub fn scan_source(&self, file: &str, source: &str) -> Vec<Finding> {
        let mut findings = Vec::new();
        for (idx, line) in source.lines().enumerate() {
            if is_comment(line) {
                continue;
            }
            let rule_sets = [
                (FindingKind::Forbidden, &self.forbidden),
                (FindingKind::Suspicious, &self.suspicious),
            ];
            for (kind, rules) in rule_sets {
                for rule in rules.iter().filter(|r| r.regex.is_match(line)) {
                    findings.push(Finding {
                        kind,
                        rule: rule.name.clone(),
                        file: file.to_owned(),
                        line: idx + 1,
                    });
                }
            }
        }
        findings
    }

    /// Scan every source file under `root`.
    ///
    /// Unreadable or non-UTF-8 files are skipped with a debug log.
    pub fn scan_dir(&self, root: &Path) -> Vec<Finding> {
        let mut findings = Vec::new();
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry));

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || !is_scannable(entry.path()) {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .display()
                .to_string();
            match std::fs::read_to_string(entry.path()) {
                Ok(source) => findings.extend(self.scan_source(&relative, &source)),
                Err(e) => {
                    tracing::debug!(file = %relative, error = %e, "skipping unreadable source file");
                }
            }
        }
        findings
    }
}

/// Whether the file extension marks a scannable source file.
pub fn is_scannable(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SCANNED_EXTENSIONS.contains(&ext))
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref())
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.starts_with(";;") || trimmed.starts_with("# ")
}
