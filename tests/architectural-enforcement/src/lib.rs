//! Architectural Enforcement
//!
//! Source scanners used by the integration tests in `tests/` to keep the
//! async transport free of blocking calls:
//! - No `std::thread::sleep` in production code
//! - No blocking `std::net` sockets
//! - No blocking file I/O inside the transport
//!
//! Test code (everything after a `#[cfg(test)]` marker) and comments are
//! ignored.

use std::fs;
use std::path::{Path, PathBuf};

/// A single offending source line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the line
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The trimmed line text
    pub text: String,
    /// Which rule matched
    pub rule: &'static str,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.rule,
            self.text
        )
    }
}

/// A forbidden pattern and the rule name reported for it
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    /// Human-readable rule name
    pub name: &'static str,
    /// Substrings that trigger the rule
    pub patterns: &'static [&'static str],
}

/// Blocking sleep
pub const NO_BLOCKING_SLEEP: Rule = Rule {
    name: "Blocking sleep",
    patterns: &["std::thread::sleep", "thread::sleep("],
};

/// Blocking sockets
pub const NO_BLOCKING_NET: Rule = Rule {
    name: "Blocking network I/O",
    patterns: &[
        "std::net::TcpStream",
        "std::net::TcpListener",
        "std::net::UdpSocket",
    ],
};

/// Blocking file I/O
pub const NO_BLOCKING_FS: Rule = Rule {
    name: "Blocking file I/O",
    patterns: &["std::fs::", "use std::fs"],
};

/// Root of the workspace this crate lives in
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from("../.."))
}

/// Production source directories of the workspace crates
#[must_use]
pub fn production_dirs() -> Vec<PathBuf> {
    let root = workspace_root();
    vec![root.join("parley/core/src"), root.join("parley/daemon/src")]
}

/// Check every `.rs` file under `dir` against `rules`
#[must_use]
pub fn scan_dir(dir: &Path, rules: &[Rule]) -> Vec<Violation> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .flat_map(|e| match fs::read_to_string(e.path()) {
            Ok(content) => scan_source(e.path(), &content, rules),
            Err(_) => Vec::new(),
        })
        .collect()
}

/// Check one file's contents against `rules`
#[must_use]
pub fn scan_source(path: &Path, content: &str, rules: &[Rule]) -> Vec<Violation> {
    let mut violations = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if trimmed.starts_with("//") {
            continue;
        }
        let code = line.split("//").next().unwrap_or(line);

        for rule in rules {
            if rule.patterns.iter().any(|p| code.contains(p)) {
                violations.push(Violation {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    text: trimmed.to_string(),
                    rule: rule.name,
                });
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_sleep() {
        let src = "fn main() {\n    std::thread::sleep(d);\n}\n";
        let found = scan_source(Path::new("x.rs"), src, &[NO_BLOCKING_SLEEP]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].line, 2);
    }

    #[test]
    fn test_ignores_comments_and_tests() {
        let src = "\
// std::thread::sleep is forbidden
let a = 1; // std::net::TcpStream
#[cfg(test)]
mod tests { fn t() { std::thread::sleep(d); } }
";
        let found = scan_source(Path::new("x.rs"), src, &[NO_BLOCKING_SLEEP, NO_BLOCKING_NET]);
        assert!(found.is_empty(), "{found:?}");
    }

    #[test]
    fn test_socket_addr_is_allowed() {
        let src = "use std::net::SocketAddr;\n";
        assert!(scan_source(Path::new("x.rs"), src, &[NO_BLOCKING_NET]).is_empty());
    }
}
