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

struct Fixture {
    class_id: String,
    alice: String,
    benny: String,
    carol: String,
    quiz: String,
    project: String,
}

fn build_fixture(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) -> Fixture {
    request_ok(
        stdin,
        reader,
        "f1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        stdin,
        reader,
        "f2",
        "classes.create",
        json!({ "name": "8D Math" }),
    );
    let class_id = class.get("classId").and_then(|v| v.as_str()).unwrap().to_string();

    let mut students = Vec::new();
    for (i, (last, first)) in [("Archer", "Alice"), ("Bright", "Benny"), ("Chu", "Carol")]
        .iter()
        .enumerate()
    {
        let result = request_ok(
            stdin,
            reader,
            &format!("f3{}", i),
            "students.create",
            json!({
                "classId": class_id,
                "lastName": last,
                "firstName": first
            }),
        );
        students.push(
            result
                .get("studentId")
                .and_then(|v| v.as_str())
                .unwrap()
                .to_string(),
        );
    }

    let quiz = request_ok(
        stdin,
        reader,
        "f4",
        "assignments.create",
        json!({ "classId": class_id, "title": "Quiz 1", "totalPoints": 10.0 }),
    )
    .get("assignmentId")
    .and_then(|v| v.as_str())
    .unwrap()
    .to_string();
    let project = request_ok(
        stdin,
        reader,
        "f5",
        "assignments.create",
        json!({ "classId": class_id, "title": "Term Project", "totalPoints": 90.0 }),
    )
    .get("assignmentId")
    .and_then(|v| v.as_str())
    .unwrap()
    .to_string();

    Fixture {
        class_id,
        alice: students[0].clone(),
        benny: students[1].clone(),
        carol: students[2].clone(),
        quiz,
        project,
    }
}

fn row_for<'a>(rows: &'a [serde_json::Value], student_id: &str) -> &'a serde_json::Value {
    rows.iter()
        .find(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(student_id))
        .unwrap_or_else(|| panic!("no gradebook row for {}", student_id))
}

#[test]
fn matrix_defaults_overlay_and_average_semantics() {
    let workspace = temp_dir("classbook-gradebook-matrix");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let fx = build_fixture(&mut stdin, &mut reader, &workspace);

    // Alice: perfect quiz, half-marks project. Benny: strong quiz, project
    // handed in but not yet graded. Carol: nothing at all.
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "submissions.upsert",
        json!({ "assignmentId": fx.quiz, "studentId": fx.alice, "grade": 10.0 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "submissions.upsert",
        json!({ "assignmentId": fx.project, "studentId": fx.alice, "grade": 45.0 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "submissions.upsert",
        json!({ "assignmentId": fx.quiz, "studentId": fx.benny, "grade": 9.0 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "submissions.upsert",
        json!({ "assignmentId": fx.project, "studentId": fx.benny, "status": "submitted" }),
    );

    let model = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "gradebook.open",
        json!({ "classId": fx.class_id }),
    );

    let rows = model.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 3);
    let assignments = model
        .get("assignments")
        .and_then(|v| v.as_array())
        .expect("assignments");
    assert_eq!(assignments.len(), 2);

    // Dense matrix: every row carries a cell per assignment, with absent
    // pairs defaulting to not_submitted.
    let carol = row_for(rows, &fx.carol);
    let carol_cells = carol.get("cells").and_then(|v| v.as_array()).unwrap();
    assert_eq!(carol_cells.len(), 2);
    for cell in carol_cells {
        assert_eq!(
            cell.get("status").and_then(|v| v.as_str()),
            Some("not_submitted")
        );
        assert!(cell.get("grade").map(|v| v.is_null()).unwrap_or(false));
    }
    assert_eq!(carol.get("percent").and_then(|v| v.as_f64()), Some(0.0));
    assert!(carol.get("letter").map(|v| v.is_null()).unwrap_or(false));

    // Alice: weighted 55/100 vs unweighted mean of 100% and 50%.
    let alice = row_for(rows, &fx.alice);
    assert_eq!(alice.get("pointsEarned").and_then(|v| v.as_f64()), Some(55.0));
    assert_eq!(alice.get("maxPoints").and_then(|v| v.as_f64()), Some(100.0));
    assert_eq!(alice.get("percent").and_then(|v| v.as_f64()), Some(55.0));
    assert_eq!(
        alice.get("averageOfPercents").and_then(|v| v.as_f64()),
        Some(75.0)
    );
    assert_eq!(alice.get("letter").and_then(|v| v.as_str()), Some("F"));

    // Benny: submitted-but-ungraded project contributes nothing yet.
    let benny = row_for(rows, &fx.benny);
    assert_eq!(benny.get("percent").and_then(|v| v.as_f64()), Some(90.0));
    assert_eq!(benny.get("letter").and_then(|v| v.as_str()), Some("A"));
    let benny_cells = benny.get("cells").and_then(|v| v.as_array()).unwrap();
    assert_eq!(
        benny_cells[1].get("status").and_then(|v| v.as_str()),
        Some("submitted")
    );

    // Class average is points-over-points: (55 + 9) / (100 + 10).
    assert_eq!(
        model.get("classAveragePercent").and_then(|v| v.as_f64()),
        Some(58.2)
    );

    let distribution = model.get("distribution").expect("distribution");
    assert_eq!(distribution.get("a").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(distribution.get("f").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(distribution.get("b").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(distribution.get("c").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(distribution.get("d").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(
        distribution.get("ungraded").and_then(|v| v.as_u64()),
        Some(1)
    );

    let per_assignment = model
        .get("perAssignment")
        .and_then(|v| v.as_array())
        .expect("perAssignment");
    assert_eq!(
        per_assignment[0].get("gradedCount").and_then(|v| v.as_u64()),
        Some(2)
    );
    assert_eq!(
        per_assignment[0]
            .get("averagePercent")
            .and_then(|v| v.as_f64()),
        Some(95.0)
    );
    assert_eq!(
        per_assignment[1].get("gradedCount").and_then(|v| v.as_u64()),
        Some(1)
    );
    assert_eq!(
        per_assignment[1]
            .get("submittedCount")
            .and_then(|v| v.as_u64()),
        Some(1)
    );
    assert_eq!(
        per_assignment[1]
            .get("averagePercent")
            .and_then(|v| v.as_f64()),
        Some(50.0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn inactive_students_keep_rows_but_leave_class_aggregates() {
    let workspace = temp_dir("classbook-gradebook-inactive");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let fx = build_fixture(&mut stdin, &mut reader, &workspace);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "submissions.upsert",
        json!({ "assignmentId": fx.quiz, "studentId": fx.alice, "grade": 10.0 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "submissions.upsert",
        json!({ "assignmentId": fx.quiz, "studentId": fx.benny, "grade": 4.0 }),
    );
    // Benny transfers out mid-term.
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.update",
        json!({
            "classId": fx.class_id,
            "studentId": fx.benny,
            "patch": { "active": false }
        }),
    );

    let model = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "gradebook.open",
        json!({ "classId": fx.class_id }),
    );

    let rows = model.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 3);
    let benny = row_for(rows, &fx.benny);
    assert_eq!(benny.get("active").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(benny.get("percent").and_then(|v| v.as_f64()), Some(40.0));

    // Only Alice's 10/10 counts class-wide.
    assert_eq!(
        model.get("classAveragePercent").and_then(|v| v.as_f64()),
        Some(100.0)
    );
    let distribution = model.get("distribution").expect("distribution");
    assert_eq!(distribution.get("a").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(distribution.get("f").and_then(|v| v.as_u64()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
