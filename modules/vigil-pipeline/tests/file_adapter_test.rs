//! The NDJSON file drivers, end to end: the source tails a growing file,
//! the sink appends annotated events.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use vigil_common::ComponentType;
use vigil_pipeline::{ComponentTables, PipelineRuntime, ProjectStatus};

async fn wait_for_lines(path: &std::path::Path, want: usize) -> Vec<String> {
    for _ in 0..200 {
        let lines: Vec<String> = std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect();
        if lines.len() >= want {
            return lines;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {want} lines in {}", path.display());
}

#[tokio::test]
async fn file_source_tails_and_file_sink_appends() {
    let dir = tempfile::tempdir().unwrap();
    let in_path = dir.path().join("events.ndjson");
    let out_path = dir.path().join("delivered.ndjson");
    std::fs::write(
        &in_path,
        "{\"kind\":\"a\"}\nnot json at all\n{\"kind\":\"b\"}\n",
    )
    .unwrap();

    let tables = Arc::new(ComponentTables::new());
    tables.create_memory_only(
        ComponentType::Input,
        "tail",
        &format!("type: file\nfile:\n  path: {}\n", in_path.display()),
    );
    tables.create_memory_only(
        ComponentType::Output,
        "sink",
        &format!("type: file\nfile:\n  path: {}\n", out_path.display()),
    );
    tables.create_memory_only(ComponentType::Project, "p1", "INPUT.tail -> OUTPUT.sink");

    let runtime = Arc::new(PipelineRuntime::new(tables));
    runtime.ensure_project("p1");
    runtime.start_project("p1").await.unwrap();

    // The undecodable line is skipped; both objects arrive annotated.
    let lines = wait_for_lines(&out_path, 2).await;
    assert!(lines[0].contains("\"kind\":\"a\""));
    assert!(lines[0].contains("_vigil_pns"));
    assert!(lines[1].contains("\"kind\":\"b\""));

    // Appended lines are picked up by the tail.
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&in_path)
        .unwrap();
    writeln!(file, "{{\"kind\":\"c\"}}").unwrap();
    file.flush().unwrap();

    let lines = wait_for_lines(&out_path, 3).await;
    assert!(lines[2].contains("\"kind\":\"c\""));

    runtime.stop_project("p1").await.unwrap();
    assert_eq!(
        runtime.project("p1").unwrap().status(),
        ProjectStatus::Stopped
    );
}

#[tokio::test]
async fn missing_input_file_is_a_connectivity_error() {
    let tables = Arc::new(ComponentTables::new());
    tables.create_memory_only(
        ComponentType::Input,
        "tail",
        "type: file\nfile:\n  path: /nonexistent/events.ndjson\n",
    );
    tables.create_memory_only(ComponentType::Output, "sink", "type: print\n");
    tables.create_memory_only(ComponentType::Project, "p1", "INPUT.tail -> OUTPUT.sink");

    let runtime = Arc::new(PipelineRuntime::new(tables));
    runtime.ensure_project("p1");
    let err = runtime.start_project("p1").await.unwrap_err();
    assert!(err.to_string().contains("cannot reach"), "{err}");
    assert_eq!(
        runtime.project("p1").unwrap().status(),
        ProjectStatus::Error
    );
}
