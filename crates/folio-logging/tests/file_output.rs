//! End-to-end file output through the builder

use std::fs;

use folio_logging::{FileConfig, FolioSubscriberBuilder, LogConfig, RotationStrategy};
use serde_json::Value;

#[test]
fn test_events_reach_jsonl_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig {
        file: Some(FileConfig {
            directory: dir.path().to_path_buf(),
            prefix: "folio-test".to_string(),
            rotation: RotationStrategy::Never,
            max_files: None,
        }),
        ..LogConfig::production(dir.path().to_path_buf())
    };

    let (default_guard, file_guard) = FolioSubscriberBuilder::new()
        .with_config(config)
        .set_default()
        .unwrap();
    tracing::info!(target: "folio::usage", event = "block_started", block_kind = "sql", "Block started");
    tracing::debug!("Filtered out at info");
    drop(default_guard);
    drop(file_guard);

    let contents = fs::read_to_string(dir.path().join("folio-test.log")).unwrap();
    let lines: Vec<Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["event"], "block_started");
    assert_eq!(lines[0]["block_kind"], "sql");
}

#[test]
fn test_rolling_file_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let (default_guard, file_guard) = FolioSubscriberBuilder::new()
        .with_console(false)
        .with_file_output(FileConfig {
            directory: dir.path().to_path_buf(),
            prefix: "rolling".to_string(),
            rotation: RotationStrategy::Hourly,
            max_files: Some(2),
        })
        .set_default()
        .unwrap();
    tracing::warn!("Disk almost full");
    drop(default_guard);
    drop(file_guard);

    let names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().any(|name| name.starts_with("rolling") && name.ends_with("log")));
}
