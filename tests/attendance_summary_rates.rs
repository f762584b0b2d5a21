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

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    class_id: &str,
    last: &str,
    first: &str,
) -> String {
    let result = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({
            "classId": class_id,
            "lastName": last,
            "firstName": first
        }),
    );
    result
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

fn mark(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    class_id: &str,
    date: &str,
    student_id: &str,
    status: &str,
) {
    request_ok(
        stdin,
        reader,
        id,
        "attendance.mark",
        json!({
            "classId": class_id,
            "date": date,
            "studentId": student_id,
            "status": status
        }),
    );
}

fn student_entry<'a>(per_student: &'a [serde_json::Value], student_id: &str) -> &'a serde_json::Value {
    per_student
        .iter()
        .find(|s| s.get("studentId").and_then(|v| v.as_str()) == Some(student_id))
        .unwrap_or_else(|| panic!("no perStudent entry for {}", student_id))
}

#[test]
fn summary_uses_unweighted_mean_of_per_student_rates() {
    let workspace = temp_dir("classbook-attendance-rates");
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
        json!({ "name": "8D Homeroom" }),
    );
    let class_id = class.get("classId").and_then(|v| v.as_str()).unwrap().to_string();

    let alice = create_student(&mut stdin, &mut reader, "3", &class_id, "Archer", "Alice");
    let benny = create_student(&mut stdin, &mut reader, "4", &class_id, "Bright", "Benny");
    let carol = create_student(&mut stdin, &mut reader, "5", &class_id, "Chu", "Carol");

    // Alice: 2 of 4 present. Benny: 1 of 2 present. Carol: never marked.
    mark(&mut stdin, &mut reader, "6", &class_id, "2024-09-02", &alice, "present");
    mark(&mut stdin, &mut reader, "7", &class_id, "2024-09-03", &alice, "present");
    mark(&mut stdin, &mut reader, "8", &class_id, "2024-09-04", &alice, "absent");
    mark(&mut stdin, &mut reader, "9", &class_id, "2024-09-05", &alice, "sick");
    mark(&mut stdin, &mut reader, "10", &class_id, "2024-09-02", &benny, "present");
    mark(&mut stdin, &mut reader, "11", &class_id, "2024-09-03", &benny, "absent");

    // A record whose student has no roster row: name is masked, not an error.
    // (The daemon never produces this on its own; simulate an older workspace.)
    {
        let conn = rusqlite::Connection::open(workspace.join("classbook.sqlite3"))
            .expect("open workspace db from test");
        conn.execute(
            "INSERT INTO attendance_records(class_id, student_id, date, status, marked_by)
             VALUES(?, 'ghost-1', '2024-09-02', 'present', NULL)",
            [&class_id],
        )
        .expect("insert orphan attendance record");
    }

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "attendance.summary",
        json!({ "classId": class_id }),
    );

    assert_eq!(summary.get("dateCount").and_then(|v| v.as_u64()), Some(4));
    // Carol has no records, so only three students appear in the data.
    assert_eq!(summary.get("studentCount").and_then(|v| v.as_u64()), Some(3));

    let per_student = summary
        .get("perStudent")
        .and_then(|v| v.as_array())
        .expect("perStudent");
    assert_eq!(per_student.len(), 4);

    let a = student_entry(per_student, &alice);
    assert_eq!(a.get("presentCount").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(a.get("recordCount").and_then(|v| v.as_i64()), Some(4));
    assert_eq!(a.get("rate").and_then(|v| v.as_f64()), Some(50.0));

    let b = student_entry(per_student, &benny);
    assert_eq!(b.get("rate").and_then(|v| v.as_f64()), Some(50.0));

    // Zero records is rate 0, not a division error.
    let c = student_entry(per_student, &carol);
    assert_eq!(c.get("recordCount").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(c.get("rate").and_then(|v| v.as_f64()), Some(0.0));

    let ghost = student_entry(per_student, "ghost-1");
    assert_eq!(
        ghost.get("displayName").and_then(|v| v.as_str()),
        Some("Unknown")
    );
    assert_eq!(ghost.get("rate").and_then(|v| v.as_f64()), Some(100.0));

    // Mean of 50, 50, 0, 100 — NOT the record-weighted 4/7.
    assert_eq!(
        summary.get("classAverageRate").and_then(|v| v.as_f64()),
        Some(50.0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn calendar_groups_by_date_with_present_and_total() {
    let workspace = temp_dir("classbook-attendance-calendar");
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
        json!({ "name": "7A Science" }),
    );
    let class_id = class.get("classId").and_then(|v| v.as_str()).unwrap().to_string();

    let alice = create_student(&mut stdin, &mut reader, "3", &class_id, "Archer", "Alice");
    let benny = create_student(&mut stdin, &mut reader, "4", &class_id, "Bright", "Benny");

    mark(&mut stdin, &mut reader, "5", &class_id, "2024-09-02", &alice, "present");
    mark(&mut stdin, &mut reader, "6", &class_id, "2024-09-02", &benny, "present");
    mark(&mut stdin, &mut reader, "7", &class_id, "2024-09-03", &alice, "present");
    mark(&mut stdin, &mut reader, "8", &class_id, "2024-09-03", &benny, "absent");
    mark(&mut stdin, &mut reader, "9", &class_id, "2024-09-04", &alice, "permission");
    // A different month must not leak into the view.
    mark(&mut stdin, &mut reader, "10", &class_id, "2024-10-01", &alice, "present");

    let calendar = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.calendar",
        json!({ "classId": class_id, "month": "2024-09" }),
    );
    let days = calendar.get("days").and_then(|v| v.as_array()).expect("days");
    let flat: Vec<(String, i64, i64)> = days
        .iter()
        .map(|d| {
            (
                d.get("date").and_then(|v| v.as_str()).unwrap().to_string(),
                d.get("present").and_then(|v| v.as_i64()).unwrap(),
                d.get("total").and_then(|v| v.as_i64()).unwrap(),
            )
        })
        .collect();
    assert_eq!(
        flat,
        vec![
            ("2024-09-02".to_string(), 2, 2),
            ("2024-09-03".to_string(), 1, 2),
            ("2024-09-04".to_string(), 0, 1),
        ]
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
