//! Workspace-wide architectural rules

use std::fs;

use architectural_enforcement::{
    find_violations, production_code, production_sources, workspace_root, Violation,
};

fn report(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn violations_of(needle: &str) -> Vec<Violation> {
    production_sources(&workspace_root())
        .iter()
        .flat_map(|path| find_violations(path, needle))
        .collect()
}

#[test]
fn test_sources_are_found() {
    let sources = production_sources(&workspace_root());
    assert!(sources.iter().any(|p| p.ends_with("session.rs")));
    assert!(sources.iter().any(|p| p.ends_with("server.rs")));
}

#[test]
fn test_no_blocking_sleep() {
    let violations = violations_of("thread::sleep");
    assert!(violations.is_empty(), "blocking sleep found:\n{}", report(&violations));
}

#[test]
fn test_no_std_mutex() {
    let violations = violations_of("std::sync::Mutex");
    assert!(
        violations.is_empty(),
        "use parking_lot or tokio locks:\n{}",
        report(&violations)
    );
}

#[test]
fn test_no_unwrap_in_production_code() {
    let violations = violations_of(".unwrap()");
    assert!(violations.is_empty(), "unwrap found:\n{}", report(&violations));
}

#[test]
fn test_expect_only_for_signal_handlers() {
    let violations: Vec<Violation> = violations_of(".expect(")
        .into_iter()
        .filter(|v| !v.text.contains("signal(SignalKind::"))
        .collect();
    assert!(violations.is_empty(), "expect found:\n{}", report(&violations));
}

#[test]
fn test_polling_uses_tokio_interval() {
    let path = workspace_root().join("vitals/core/src/streaming/polling.rs");
    let content = fs::read_to_string(&path).unwrap();
    let code = production_code(&content);

    assert!(code.contains("tokio::time::interval"));
    assert!(!code.contains("tokio::time::sleep"));
}

#[test]
fn test_core_does_not_depend_on_daemon() {
    let manifest = fs::read_to_string(workspace_root().join("vitals/core/Cargo.toml")).unwrap();
    assert!(!manifest.contains("vitals-daemon"));
}
