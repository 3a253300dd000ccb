//! Source-level check that row locking stays behind the transaction
//! primitive. Runs without a database.
//!
//! Every `FOR UPDATE` statement must live in one of the modules that own a
//! locking concern, and direct locking reads of the breaker state table are
//! confined to the breaker store. New call sites should go through
//! `with_locked_transaction` rather than widening this list.

use std::path::{Path, PathBuf};

const LOCKING_MODULES: &[&str] = &[
    "database/locked_transaction.rs",
    "breaker/store.rs",
    "outbox/mod.rs",
    "work_queue/mod.rs",
];

fn src_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("src")
}

fn rust_sources(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = std::fs::read_dir(dir).expect("read src dir");
    for entry in entries {
        let path = entry.expect("dir entry").path();
        if path.is_dir() {
            rust_sources(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}

/// Code lines only: comments may mention locking freely.
fn code_lines(source: &str) -> String {
    source
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !(trimmed.starts_with("//") || trimmed.starts_with("//!") || trimmed.starts_with("///"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn module_name(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .expect("path under src")
        .to_string_lossy()
        .replace('\\', "/")
}

#[test]
fn test_for_update_confined_to_locking_modules() {
    let root = src_root();
    let mut sources = Vec::new();
    rust_sources(&root, &mut sources);
    assert!(!sources.is_empty(), "no sources found under src/");

    for path in &sources {
        let source = std::fs::read_to_string(path).expect("read source file");
        let code = code_lines(&source).to_ascii_uppercase();
        let module = module_name(path, &root);

        if code.contains("FOR UPDATE") {
            assert!(
                LOCKING_MODULES.contains(&module.as_str()),
                "{module} issues FOR UPDATE outside the locking modules"
            );
        }
    }
}

#[test]
fn test_breaker_state_locking_reads_stay_in_store() {
    let root = src_root();
    let mut sources = Vec::new();
    rust_sources(&root, &mut sources);

    for path in &sources {
        let source = std::fs::read_to_string(path).expect("read source file");
        let code = code_lines(&source).to_ascii_uppercase();
        let module = module_name(path, &root);

        if code.contains("COSTSIM_CB_STATE") && code.contains("FOR UPDATE") {
            assert_eq!(
                module, "breaker/store.rs",
                "{module} takes row locks on the breaker state table"
            );
        }
    }
}
