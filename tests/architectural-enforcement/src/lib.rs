//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - No thread sleeps anywhere in relay code
//! - No blocking I/O inside async functions
//! - No panicking shortcuts in production code
//!
//! The helpers here load the production part of each source file: everything
//! before the first `#[cfg(test)]` line, with line comments stripped. Block
//! comments and raw strings spanning lines are not recognised.

use std::fs;
use std::path::{Path, PathBuf};

/// Crate source directories checked by every rule
pub const SOURCE_DIRS: &[&str] = &["relay/core/src", "relay/daemon/src"];

/// One line of production code
#[derive(Debug, Clone)]
pub struct CodeLine {
    pub number: usize,
    /// Line with any `//` comment removed
    pub code: String,
    /// Whether the nearest enclosing `fn` is `async`
    pub in_async_fn: bool,
}

/// Production code of one source file
#[derive(Debug)]
pub struct SourceFile {
    pub path: PathBuf,
    pub lines: Vec<CodeLine>,
}

impl SourceFile {
    /// Format a violation for `line`
    pub fn violation(&self, line: &CodeLine, what: &str) -> String {
        format!(
            "{}:{} - {what}: {}",
            self.path.display(),
            line.number,
            line.code.trim()
        )
    }
}

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Every `.rs` file under the checked source directories
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();
    for dir in SOURCE_DIRS {
        for entry in walkdir::WalkDir::new(root.join(dir))
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            if let Ok(content) = fs::read_to_string(entry.path()) {
                files.push(SourceFile {
                    path: entry.path().to_path_buf(),
                    lines: production_lines(&content),
                });
            }
        }
    }
    files
}

/// Production lines of `content`, stopping at the test module
pub fn production_lines(content: &str) -> Vec<CodeLine> {
    let mut lines = Vec::new();
    let mut in_async_fn = false;

    for (idx, raw) in content.lines().enumerate() {
        let trimmed = raw.trim_start();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        let code = strip_line_comment(raw).to_string();
        if code.trim().is_empty() {
            continue;
        }
        if let Some(signature) = fn_signature(&code) {
            in_async_fn = signature.contains("async fn");
        }
        lines.push(CodeLine {
            number: idx + 1,
            code,
            in_async_fn,
        });
    }
    lines
}

/// `raw` up to the first `//` that is not inside a string or char literal
fn strip_line_comment(raw: &str) -> &str {
    let bytes = raw.as_bytes();
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_string => i += 1,
            b'"' => in_string = !in_string,
            b'\'' if !in_string && bytes.get(i + 2) == Some(&b'\'') => i += 2,
            b'/' if !in_string && bytes.get(i + 1) == Some(&b'/') => return &raw[..i],
            _ => {}
        }
        i += 1;
    }
    raw
}

fn fn_signature(code: &str) -> Option<&str> {
    let trimmed = code.trim_start();
    let is_fn = trimmed.starts_with("fn ")
        || trimmed.contains(" fn ")
        || trimmed.starts_with("async fn ");
    is_fn.then_some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let content = "fn a() {\n    x(); // note\n}\n#[cfg(test)]\nmod tests {}\n";
        let lines = production_lines(content);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].code.trim(), "x();");
    }

    #[test]
    fn test_comment_markers_inside_literals_are_kept() {
        let content = "fn a() {\n    connect(\"ws://host\"); std::thread::sleep(d); // why\n    let q = '\"'; b(); // x\n    let e = \"a\\\"//\"; c();\n}\n";
        let lines = production_lines(content);
        assert_eq!(
            lines[1].code.trim(),
            "connect(\"ws://host\"); std::thread::sleep(d);"
        );
        assert_eq!(lines[2].code.trim(), "let q = '\"'; b();");
        assert_eq!(lines[3].code.trim(), "let e = \"a\\\"//\"; c();");
    }

    #[test]
    fn test_async_context_tracking() {
        let content = "fn sync() {\n    a();\n}\npub async fn run() {\n    b();\n}\n";
        let lines = production_lines(content);
        assert!(!lines[1].in_async_fn);
        assert!(lines[4].in_async_fn);
    }

    #[test]
    fn test_sources_are_found() {
        assert!(!production_sources().is_empty());
    }
}
