//! Configuration resolution tests
//!
//! Uses serial_test: tests that manipulate QBANK_CONFIG or QBANK_DATABASE
//! are marked #[serial] so they never race on the process environment.

use qbank_common::config::{ConsolidationConfig, MatchMode, CONFIG_ENV_VAR, DATABASE_ENV_VAR};
use qbank_common::Error;
use serial_test::serial;
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
#[serial]
fn test_explicit_file_is_loaded() {
    env::remove_var(CONFIG_ENV_VAR);
    let file = write_config(
        r#"
        canonical_label = "Pool"
        batch_size = 250
        "#,
    );

    let config = ConsolidationConfig::load(Some(file.path())).unwrap();

    assert_eq!(config.canonical_label, "Pool");
    assert_eq!(config.batch_size, 250);
    assert_eq!(config.match_mode, MatchMode::Strict);
}

#[test]
#[serial]
fn test_missing_explicit_file_is_config_error() {
    env::remove_var(CONFIG_ENV_VAR);

    let result = ConsolidationConfig::load(Some(Path::new("/nonexistent/qbank.toml")));

    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
#[serial]
fn test_env_var_names_config_file() {
    let file = write_config("anchor_label = \"Anchor\"\n");
    env::set_var(CONFIG_ENV_VAR, file.path());

    let config = ConsolidationConfig::load(None).unwrap();
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(config.anchor_label.as_deref(), Some("Anchor"));
}

#[test]
#[serial]
fn test_invalid_values_rejected_on_load() {
    env::remove_var(CONFIG_ENV_VAR);
    let file = write_config("max_tree_depth = 0\n");

    let result = ConsolidationConfig::load(Some(file.path()));

    match result {
        Err(Error::Config(msg)) => assert!(msg.contains("max_tree_depth")),
        other => panic!("Expected config error, got {:?}", other),
    }
}

#[test]
#[serial]
fn test_database_path_priority() {
    let config = ConsolidationConfig {
        database_path: Some(PathBuf::from("/toml/qbank.db")),
        ..Default::default()
    };

    // Environment beats TOML
    env::set_var(DATABASE_ENV_VAR, "/env/qbank.db");
    assert_eq!(config.resolve_database_path(None), PathBuf::from("/env/qbank.db"));

    // CLI beats environment
    assert_eq!(
        config.resolve_database_path(Some(Path::new("/cli/qbank.db"))),
        PathBuf::from("/cli/qbank.db")
    );

    // TOML used when environment is clear
    env::remove_var(DATABASE_ENV_VAR);
    assert_eq!(config.resolve_database_path(None), PathBuf::from("/toml/qbank.db"));
}

#[test]
#[serial]
fn test_default_database_path_is_named_qbank_db() {
    env::remove_var(DATABASE_ENV_VAR);
    let config = ConsolidationConfig::default();

    let path = config.resolve_database_path(None);

    assert!(path.ends_with("qbank.db"));
}
