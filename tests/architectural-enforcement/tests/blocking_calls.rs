//! Integration Test: No Blocking Calls in the Async Transport
//!
//! Every socket in parley is driven by tokio. A blocking sleep or a blocking
//! std socket anywhere in production code would stall a runtime worker and
//! every connection scheduled on it.

use architectural_enforcement::{
    production_dirs, scan_dir, workspace_root, Violation, NO_BLOCKING_FS, NO_BLOCKING_NET,
    NO_BLOCKING_SLEEP,
};

fn report(violations: &[Violation], headline: &str) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n{headline}");
    for violation in violations {
        eprintln!("  {violation}");
    }
    panic!("\nFound {} violation(s)", violations.len());
}

#[test]
fn test_production_dirs_exist() {
    for dir in production_dirs() {
        assert!(dir.is_dir(), "missing source directory {}", dir.display());
    }
}

#[test]
fn test_no_blocking_sleep() {
    let violations: Vec<_> = production_dirs()
        .iter()
        .flat_map(|dir| scan_dir(dir, &[NO_BLOCKING_SLEEP]))
        .collect();
    report(
        &violations,
        "Blocking sleep in production code; use tokio::time::sleep",
    );
}

#[test]
fn test_no_blocking_sockets() {
    let violations: Vec<_> = production_dirs()
        .iter()
        .flat_map(|dir| scan_dir(dir, &[NO_BLOCKING_NET]))
        .collect();
    report(
        &violations,
        "Blocking std::net sockets in production code; use tokio::net",
    );
}

#[test]
fn test_no_file_io_in_transport() {
    let transport = workspace_root().join("parley/core/src/transport");
    let violations = scan_dir(&transport, &[NO_BLOCKING_FS]);
    report(&violations, "File I/O inside the transport layer");
}
