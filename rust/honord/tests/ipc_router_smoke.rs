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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_honord");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn honord");
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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
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
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("honord-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let before = request(&mut stdin, &mut reader, "0", "levels.list", json!({}));
    assert_eq!(error_code(&before), Some("no_workspace"));

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let levels = request_ok(&mut stdin, &mut reader, "3", "levels.list", json!({}));
    let keys: Vec<&str> = levels["levels"]
        .as_array()
        .expect("levels")
        .iter()
        .filter_map(|l| l.get("key").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(
        keys,
        vec!["elementary", "junior_highschool", "senior_highschool", "college"]
    );

    let types = request_ok(&mut stdin, &mut reader, "4", "honorTypes.list", json!({}));
    assert_eq!(types["honorTypes"].as_array().map(|a| a.len()), Some(7));

    let periods = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "periods.list",
        json!({ "levelKey": "college" }),
    );
    assert_eq!(periods["honorPeriods"], json!(["S1", "S2"]));

    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "criteria.list",
        json!({ "levelKey": "elementary" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.upsert",
        json!({ "levelKey": "elementary", "code": "math", "name": "Mathematics" }),
    );
    let subjects = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "subjects.list",
        json!({ "levelKey": "elementary" }),
    );
    assert_eq!(subjects["subjects"][0]["code"], "MATH");

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.upsert",
        json!({
            "studentNo": "E-001",
            "lastName": "Reyes",
            "firstName": "Ana",
            "levelKey": "elementary",
            "yearOfStudy": 4
        }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();
    request_ok(&mut stdin, &mut reader, "10", "students.list", json!({}));

    request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.upsert",
        json!({
            "studentId": student_id,
            "subjectCode": "MATH",
            "periodCode": "Q1",
            "schoolYear": "2024-2025",
            "grade": 97
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "grades.bulkUpsert",
        json!({ "edits": [] }),
    );
    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "grades.list",
        json!({ "studentId": student_id, "schoolYear": "2024-2025" }),
    );
    assert_eq!(grades["grades"].as_array().map(|a| a.len()), Some(1));

    for (i, method) in [
        "honors.evaluateYear",
        "honors.evaluatePeriods",
    ]
    .into_iter()
    .enumerate()
    {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("14-{}", i),
            method,
            json!({ "studentId": student_id, "schoolYear": "2024-2025", "persist": false }),
        );
    }
    request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "honors.evaluatePeriod",
        json!({ "studentId": student_id, "schoolYear": "2024-2025", "periodCode": "Q1", "persist": false }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "honors.evaluateLevel",
        json!({ "levelKey": "elementary", "schoolYear": "2024-2025", "persist": false }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "honors.results.list",
        json!({ "levelKey": "elementary", "schoolYear": "2024-2025" }),
    );
    let missing = request(
        &mut stdin,
        &mut reader,
        "18",
        "honors.results.approve",
        json!({ "resultId": "nope", "reviewer": "registrar" }),
    );
    assert_eq!(error_code(&missing), Some("not_found"));

    request_ok(&mut stdin, &mut reader, "19", "setup.get", json!({}));
    request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "demo.seedGrades",
        json!({
            "levelKey": "elementary",
            "schoolYear": "2024-2025",
            "seed": 1,
            "assignments": [{ "studentId": student_id, "tier": "with_honors" }]
        }),
    );

    let unknown = request(&mut stdin, &mut reader, "21", "classes.list", json!({}));
    assert_eq!(error_code(&unknown), Some("not_implemented"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn malformed_line_gets_bad_json_and_loop_continues() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(error_code(&value), Some("bad_json"));

    request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    drop(stdin);
    let _ = child.wait();
}
