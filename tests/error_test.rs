//! Tests for error types

use std::path::PathBuf;

use trueno_lineage::{Error, RunId};

#[test]
fn test_run_not_found_error() {
    let error = Error::RunNotFound(RunId::new(42));
    let error_str = format!("{error}");
    assert!(error_str.contains("Run not found"));
    assert!(error_str.contains("42"));
    assert!(error.is_not_found());
    assert_eq!(error.missing_run(), Some(RunId::new(42)));
}

#[test]
fn test_artifact_not_found_error() {
    let error = Error::ArtifactNotFound("runs/1/artifacts/abc.json".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Artifact not found"));
    assert!(error_str.contains("runs/1/artifacts/abc.json"));
    assert!(error.is_not_found());
    assert_eq!(error.missing_run(), None);
}

#[test]
fn test_unsupported_type_error() {
    let error = Error::UnsupportedType("u16".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Unsupported type"));
    assert!(error_str.contains("u16"));
    assert!(!error.is_not_found());
}

#[test]
fn test_corruption_error() {
    let error = Error::Corruption {
        path: "runs/3/artifacts/x.f64".to_string(),
        reason: "bad magic".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Corrupted artifact"));
    assert!(error_str.contains("runs/3/artifacts/x.f64"));
    assert!(error_str.contains("bad magic"));
}

#[test]
fn test_task_execution_error() {
    let error = Error::TaskExecution {
        run_id: RunId::new(5),
        task: "split".to_string(),
        source: anyhow::anyhow!("empty frame"),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Task 'split' failed in run 5"));
    assert!(error_str.contains("empty frame"));
    assert_eq!(error.failed_run(), Some(RunId::new(5)));
    assert!(std::error::Error::source(&error).is_some());
}

#[test]
fn test_already_committed_error() {
    let error = Error::AlreadyCommitted(RunId::new(9));
    assert!(format!("{error}").contains("Run 9 is already committed"));
}

#[test]
fn test_lineage_order_error() {
    let error = Error::LineageOrder {
        producer: RunId::new(4),
        consumer: RunId::new(2),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("4 -> 2"));
    assert!(error_str.contains("producer must be earlier"));
}

#[test]
fn test_run_dir_exists_error() {
    let error = Error::RunDirExists(PathBuf::from("/data/runs/7"));
    assert!(format!("{error}").contains("/data/runs/7"));
}

#[test]
fn test_group_errors() {
    let reserved = Error::ReservedGroup("outputs".to_string());
    assert!(format!("{reserved}").contains("'outputs' is a reserved"));

    let exists = Error::GroupExists {
        run_id: RunId::new(3),
        group: "plots".to_string(),
    };
    let error_str = format!("{exists}");
    assert!(error_str.contains("plots"));
    assert!(error_str.contains("run 3"));
}

#[test]
fn test_invalid_input_error() {
    let error = Error::InvalidInput("unknown cache policy 'x'".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Invalid input"));
    assert!(error_str.contains("unknown cache policy"));
}

#[test]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let error: Error = io_error.into();
    let error_str = format!("{error}");
    assert!(error_str.contains("IO error"));
    assert!(error_str.contains("file not found"));
}

#[test]
fn test_serialization_error_conversion() {
    let json_error = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
    let error: Error = json_error.into();
    assert!(format!("{error}").contains("Serialization error"));
}
