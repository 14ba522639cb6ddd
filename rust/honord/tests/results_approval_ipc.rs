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

const YEAR: &str = "2024-2025";

fn student_with_grades(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    grade: f64,
) -> String {
    request_ok(
        stdin,
        reader,
        "subj",
        "subjects.upsert",
        json!({ "levelKey": "elementary", "code": "MATH", "name": "Mathematics" }),
    );
    let student = request_ok(
        stdin,
        reader,
        "student",
        "students.upsert",
        json!({
            "studentNo": "E-500",
            "lastName": "Cruz",
            "firstName": "Ben",
            "levelKey": "elementary"
        }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();
    set_grades(stdin, reader, &student_id, grade);
    student_id
}

fn set_grades(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    student_id: &str,
    grade: f64,
) {
    let edits: Vec<serde_json::Value> = ["Q1", "Q2", "Q3", "Q4"]
        .iter()
        .map(|q| {
            json!({
                "studentId": student_id,
                "subjectCode": "MATH",
                "periodCode": q,
                "schoolYear": YEAR,
                "grade": grade,
            })
        })
        .collect();
    let res = request_ok(
        stdin,
        reader,
        "grades",
        "grades.bulkUpsert",
        json!({ "edits": edits }),
    );
    assert_eq!(res["updated"], 4);
}

fn single_result_id(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let listed = request_ok(
        stdin,
        reader,
        "list",
        "honors.results.list",
        json!({ "levelKey": "elementary", "schoolYear": YEAR }),
    );
    let rows = listed["results"].as_array().expect("results");
    assert_eq!(rows.len(), 1, "{}", listed);
    rows[0]["id"].as_str().expect("id").to_string()
}

#[test]
fn approved_result_is_locked_against_reevaluation() {
    let workspace = temp_dir("honord-approval-lock");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student_id = student_with_grades(&mut stdin, &mut reader, 92.0);
    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "honors.evaluateYear",
        json!({ "studentId": student_id, "schoolYear": YEAR }),
    );
    assert_eq!(eval["persisted"], "created");
    let result_id = single_result_id(&mut stdin, &mut reader);

    let approved = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "honors.results.approve",
        json!({ "resultId": result_id, "reviewer": "registrar", "note": "checked" }),
    );
    assert_eq!(approved["result"]["status"], "approved");
    assert_eq!(approved["result"]["reviewedBy"], "registrar");
    assert_eq!(approved["result"]["reviewNote"], "checked");
    assert!(approved["result"]["reviewedAt"].is_string());

    let twice = request(
        &mut stdin,
        &mut reader,
        "4",
        "honors.results.reject",
        json!({ "resultId": result_id, "reviewer": "registrar" }),
    );
    assert_eq!(error_code(&twice), Some("invalid_transition"));

    set_grades(&mut stdin, &mut reader, &student_id, 80.0);
    let reeval = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "honors.evaluateYear",
        json!({ "studentId": student_id, "schoolYear": YEAR }),
    );
    assert!(reeval["honor"].is_null());
    assert_eq!(reeval["persisted"], "locked");

    let approved_only = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "honors.results.list",
        json!({ "levelKey": "elementary", "schoolYear": YEAR, "status": "approved" }),
    );
    let rows = approved_only["results"].as_array().expect("results");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["honorType"], "with_honors");
    assert_eq!(rows[0]["gpa"], 92.0);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn rejecting_needs_a_reviewer_and_filters_by_status() {
    let workspace = temp_dir("honord-approval-reject");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student_id = student_with_grades(&mut stdin, &mut reader, 96.0);
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "honors.evaluateYear",
        json!({ "studentId": student_id, "schoolYear": YEAR }),
    );
    let result_id = single_result_id(&mut stdin, &mut reader);

    let missing_reviewer = request(
        &mut stdin,
        &mut reader,
        "3",
        "honors.results.reject",
        json!({ "resultId": result_id }),
    );
    assert_eq!(error_code(&missing_reviewer), Some("bad_params"));

    let rejected = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "honors.results.reject",
        json!({ "resultId": result_id, "reviewer": "principal" }),
    );
    assert_eq!(rejected["result"]["status"], "rejected");

    let pending = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "honors.results.list",
        json!({ "levelKey": "elementary", "schoolYear": YEAR, "status": "pending" }),
    );
    assert_eq!(pending["results"].as_array().map(|a| a.len()), Some(0));

    let bad_status = request(
        &mut stdin,
        &mut reader,
        "6",
        "honors.results.list",
        json!({ "levelKey": "elementary", "schoolYear": YEAR, "status": "archived" }),
    );
    assert_eq!(error_code(&bad_status), Some("bad_params"));

    drop(stdin);
    let _ = child.wait();
}
