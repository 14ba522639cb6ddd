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

fn open_with_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> String {
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        stdin,
        reader,
        "subj",
        "subjects.upsert",
        json!({ "levelKey": "senior_highschool", "code": "GENMATH", "name": "General Mathematics" }),
    );
    let student = request_ok(
        stdin,
        reader,
        "student",
        "students.upsert",
        json!({
            "studentNo": "S-001",
            "lastName": "Lim",
            "firstName": "Kai",
            "levelKey": "senior_highschool",
            "yearOfStudy": 11
        }),
    );
    student["studentId"].as_str().expect("studentId").to_string()
}

#[test]
fn single_upsert_rejects_bad_edits_with_stable_codes() {
    let workspace = temp_dir("honord-grades-validation");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let student_id = open_with_student(&mut stdin, &mut reader, &workspace);

    let cases = [
        (json!({ "subjectCode": "GENMATH", "periodCode": "Q1", "grade": 101 }), "grade_out_of_range"),
        (json!({ "subjectCode": "GENMATH", "periodCode": "Q1", "grade": -1 }), "grade_out_of_range"),
        (json!({ "subjectCode": "GENMATH", "periodCode": "S1", "grade": 90 }), "calculated_period"),
        (json!({ "subjectCode": "GENMATH", "periodCode": "Q9", "grade": 90 }), "unknown_period"),
        (json!({ "subjectCode": "PE", "periodCode": "Q1", "grade": 90 }), "not_found"),
        (json!({ "subjectCode": "GENMATH", "periodCode": "Q1" }), "bad_params"),
        (json!({ "subjectCode": "GENMATH", "periodCode": "Q1", "grade": 90, "schoolYear": "2024-2026" }), "bad_params"),
    ];
    for (i, (edit, code)) in cases.into_iter().enumerate() {
        let mut params = edit;
        params["studentId"] = json!(student_id);
        if params.get("schoolYear").is_none() {
            params["schoolYear"] = json!(YEAR);
        }
        let res = request(&mut stdin, &mut reader, &format!("c{}", i), "grades.upsert", params);
        assert_eq!(error_code(&res), Some(code), "case {}: {}", i, res);
    }

    let unknown_student = request(
        &mut stdin,
        &mut reader,
        "u",
        "grades.upsert",
        json!({
            "studentId": "missing",
            "subjectCode": "GENMATH",
            "periodCode": "Q1",
            "schoolYear": YEAR,
            "grade": 90
        }),
    );
    assert_eq!(error_code(&unknown_student), Some("not_found"));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "grades.list",
        json!({ "studentId": student_id, "schoolYear": YEAR }),
    );
    assert_eq!(listed["grades"].as_array().map(|a| a.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn bulk_upsert_reports_per_edit_errors() {
    let workspace = temp_dir("honord-grades-bulk");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let student_id = open_with_student(&mut stdin, &mut reader, &workspace);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "bulk",
        "grades.bulkUpsert",
        json!({
            "edits": [
                { "studentId": student_id, "subjectCode": "GENMATH", "periodCode": "Q1", "schoolYear": YEAR, "grade": 90 },
                { "studentId": student_id, "subjectCode": "GENMATH", "periodCode": "Q2", "schoolYear": YEAR, "grade": 150 },
                "not an object",
                { "studentId": student_id, "subjectCode": "GENMATH", "periodCode": "q2", "schoolYear": YEAR, "grade": 93.5 }
            ]
        }),
    );
    assert_eq!(res["updated"], 2);
    assert_eq!(res["rejected"], 2);
    let errors = res["errors"].as_array().expect("errors");
    assert_eq!(errors[0]["index"], 1);
    assert_eq!(errors[0]["code"], "grade_out_of_range");
    assert_eq!(errors[1]["index"], 2);
    assert_eq!(errors[1]["code"], "bad_params");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "grades.list",
        json!({ "studentId": student_id, "schoolYear": YEAR }),
    );
    let grades = listed["grades"].as_array().expect("grades");
    assert_eq!(grades.len(), 2);
    assert_eq!(grades[1]["periodCode"], "Q2");
    assert_eq!(grades[1]["grade"], 93.5);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn bulk_payload_limit_returns_deterministic_rejection() {
    let workspace = temp_dir("honord-grades-limit");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let student_id = open_with_student(&mut stdin, &mut reader, &workspace);

    let edits: Vec<serde_json::Value> = (0..5001)
        .map(|_| {
            json!({
                "studentId": student_id,
                "subjectCode": "GENMATH",
                "periodCode": "Q1",
                "schoolYear": YEAR,
                "grade": 90
            })
        })
        .collect();
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "limit",
        "grades.bulkUpsert",
        json!({ "edits": edits }),
    );
    assert_eq!(res["updated"], 0);
    assert_eq!(res["rejected"], 5001);
    assert_eq!(res["limitExceeded"], true);
    assert_eq!(res["errors"][0]["code"], "too_many_edits");

    drop(stdin);
    let _ = child.wait();
}
