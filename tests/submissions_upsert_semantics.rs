use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_daemon() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_classbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn classbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

#[test]
fn upsert_resolution_and_conflict_key() {
    let workspace = temp_dir("classbook-submissions-upsert");
    let (mut child, mut stdin, mut reader) = spawn_daemon();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "8D Math" }),
    );
    let class_id = class.get("classId").and_then(|v| v.as_str()).unwrap().to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "classId": class_id, "lastName": "Archer", "firstName": "Alice" }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .unwrap()
    .to_string();
    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assignments.create",
        json!({ "classId": class_id, "title": "Quiz 1", "totalPoints": 10.0 }),
    )
    .get("assignmentId")
    .and_then(|v| v.as_str())
    .unwrap()
    .to_string();

    // A bare grade resolves to graded.
    let graded = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "submissions.upsert",
        json!({ "assignmentId": assignment, "studentId": student, "grade": 7.5 }),
    );
    assert_eq!(graded.get("status").and_then(|v| v.as_str()), Some("graded"));

    // Re-upserting the same (assignment, student) replaces the row.
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "submissions.upsert",
        json!({ "assignmentId": assignment, "studentId": student, "status": "submitted" }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "submissions.list",
        json!({ "assignmentId": assignment }),
    );
    let rows = listed
        .get("submissions")
        .and_then(|v| v.as_array())
        .expect("submissions");
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("status").and_then(|v| v.as_str()),
        Some("submitted")
    );
    assert!(rows[0].get("grade").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(
        rows[0].get("displayName").and_then(|v| v.as_str()),
        Some("Archer, Alice")
    );

    // Invalid shapes are rejected before any write.
    let negative = request(
        &mut stdin,
        &mut reader,
        "8",
        "submissions.upsert",
        json!({ "assignmentId": assignment, "studentId": student, "grade": -1.0 }),
    );
    assert_eq!(error_code(&negative), Some("bad_params"));

    let graded_without_grade = request(
        &mut stdin,
        &mut reader,
        "9",
        "submissions.upsert",
        json!({ "assignmentId": assignment, "studentId": student, "status": "graded" }),
    );
    assert_eq!(error_code(&graded_without_grade), Some("bad_params"));

    let neither = request(
        &mut stdin,
        &mut reader,
        "10",
        "submissions.upsert",
        json!({ "assignmentId": assignment, "studentId": student }),
    );
    assert_eq!(error_code(&neither), Some("bad_params"));

    let unknown_assignment = request(
        &mut stdin,
        &mut reader,
        "11",
        "submissions.upsert",
        json!({ "assignmentId": "missing", "studentId": student, "grade": 5.0 }),
    );
    assert_eq!(error_code(&unknown_assignment), Some("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
