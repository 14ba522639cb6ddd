use crate::honor::AcademicLevel;
use crate::ipc::helpers::{
    db_query_err, db_update_err, get_bool_or, get_level, get_opt_i64, get_opt_str, get_str,
    require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::records;
use serde_json::{json, Value};
use uuid::Uuid;

fn students_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let level = match get_opt_str(&req.params, "levelKey")? {
        None => None,
        Some(_) => Some(get_level(&req.params)?),
    };
    let students = records::list_students(conn, level).map_err(db_query_err)?;
    Ok(json!({ "students": students }))
}

fn students_upsert(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let p = &req.params;
    let student_no = get_str(p, "studentNo")?;
    let last_name = get_str(p, "lastName")?;
    let first_name = get_str(p, "firstName")?;
    let level: AcademicLevel = get_level(p)?;
    let year_of_study = get_opt_i64(p, "yearOfStudy")?;
    let section = get_opt_str(p, "section")?;
    let active = get_bool_or(p, "active", true)?;
    if let Some(y) = year_of_study {
        if !(1..=12).contains(&y) {
            return Err(HandlerErr::bad_params("yearOfStudy must be in 1..=12")
                .with_details(json!({ "yearOfStudy": y })));
        }
    }

    conn.execute(
        "INSERT INTO students(
            id, student_no, last_name, first_name, academic_level_key, year_of_study,
            section, active, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_no) DO UPDATE SET
           last_name = excluded.last_name,
           first_name = excluded.first_name,
           academic_level_key = excluded.academic_level_key,
           year_of_study = excluded.year_of_study,
           section = excluded.section,
           active = excluded.active,
           updated_at = excluded.updated_at",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            student_no,
            last_name,
            first_name,
            level.key(),
            year_of_study,
            section,
            active as i64,
            records::now_rfc3339(),
        ],
    )
    .map_err(db_update_err)?;

    let id: String = conn
        .query_row(
            "SELECT id FROM students WHERE student_no = ?",
            [student_no],
            |r| r.get(0),
        )
        .map_err(db_query_err)?;
    Ok(json!({ "ok": true, "studentId": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => students_list(state, req),
        "students.upsert" => students_upsert(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
