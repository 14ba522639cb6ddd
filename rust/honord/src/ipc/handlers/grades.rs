use super::setup;
use crate::honor::AcademicLevel;
use crate::ipc::helpers::{
    db_query_err, db_update_err, get_f64, get_level, get_opt_str, get_school_year, get_str,
    require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::periods::PeriodTree;
use crate::records::{self, GradeUpsert, StudentRecord};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashMap;

const GRADES_BULK_MAX_EDITS: usize = 5000;

fn resolve_student(conn: &Connection, student_id: &str) -> Result<StudentRecord, HandlerErr> {
    records::load_student(conn, student_id)
        .map_err(db_query_err)?
        .ok_or_else(|| {
            HandlerErr::new("not_found", "student not found")
                .with_details(json!({ "studentId": student_id }))
        })
}

/// Grades are stored against the level named in the edit, or the student's
/// current level when none is given.
fn resolve_level(params: &Value, student: &StudentRecord) -> Result<AcademicLevel, HandlerErr> {
    if get_opt_str(params, "levelKey")?.is_some() {
        return get_level(params);
    }
    student.level().ok_or_else(|| {
        HandlerErr::new("invalid_student", "student has an unknown academic level")
            .with_details(json!({ "levelKey": student.level_key }))
    })
}

fn resolve_subject(
    conn: &Connection,
    params: &Value,
    level: AcademicLevel,
) -> Result<String, HandlerErr> {
    let found: Option<String> = if let Some(id) = get_opt_str(params, "subjectId")? {
        conn.query_row(
            "SELECT id FROM subjects WHERE id = ? AND academic_level_key = ?",
            (id, level.key()),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?
    } else {
        let code = get_str(params, "subjectCode")?.to_ascii_uppercase();
        conn.query_row(
            "SELECT id FROM subjects WHERE code = ? AND academic_level_key = ?",
            (&code, level.key()),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?
    };
    found.ok_or_else(|| {
        HandlerErr::new("not_found", "subject not found for level")
            .with_details(json!({ "levelKey": level.key() }))
    })
}

fn check_period(tree: &PeriodTree, period_code: &str) -> Result<(), HandlerErr> {
    if !tree.knows(period_code) {
        return Err(HandlerErr::new("unknown_period", "unknown grading period")
            .with_details(json!({ "periodCode": period_code })));
    }
    if tree.is_calculated(period_code) {
        return Err(HandlerErr::new(
            "calculated_period",
            "grades cannot be entered for a calculated period",
        )
        .with_details(json!({ "periodCode": period_code })));
    }
    Ok(())
}

fn check_grade(grade: f64) -> Result<(), HandlerErr> {
    if !grade.is_finite() || !(0.0..=100.0).contains(&grade) {
        return Err(HandlerErr::new("grade_out_of_range", "grade must be in 0..=100")
            .with_details(json!({ "grade": grade })));
    }
    Ok(())
}

#[derive(Default)]
struct TreeCache {
    trees: HashMap<AcademicLevel, PeriodTree>,
}

impl TreeCache {
    fn get(&mut self, conn: &Connection, level: AcademicLevel) -> Result<&PeriodTree, HandlerErr> {
        if !self.trees.contains_key(&level) {
            let periods = records::load_periods(conn, level).map_err(db_query_err)?;
            let tree = PeriodTree::new(periods)?;
            self.trees.insert(level, tree);
        }
        self.trees
            .get(&level)
            .ok_or_else(|| HandlerErr::new("db_query_failed", "period tree unavailable"))
    }
}

fn apply_edit(
    conn: &Connection,
    trees: &mut TreeCache,
    edit: &Value,
    default_year: &dyn Fn() -> String,
) -> Result<(), HandlerErr> {
    let student = resolve_student(conn, get_str(edit, "studentId")?)?;
    let level = resolve_level(edit, &student)?;
    let school_year = get_school_year(edit, default_year)?;
    let period_code = get_str(edit, "periodCode")?.to_ascii_uppercase();
    let grade = get_f64(edit, "grade")?;

    check_grade(grade)?;
    check_period(trees.get(conn, level)?, &period_code)?;
    let subject_id = resolve_subject(conn, edit, level)?;

    records::upsert_grade(
        conn,
        &GradeUpsert {
            student_id: &student.id,
            subject_id: &subject_id,
            level,
            period_code: &period_code,
            school_year: &school_year,
            grade,
        },
    )
    .map_err(db_update_err)
}

fn grades_upsert(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut trees = TreeCache::default();
    apply_edit(conn, &mut trees, &req.params, &|| {
        setup::current_school_year(conn)
    })?;
    Ok(json!({ "ok": true }))
}

fn grades_bulk_upsert(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let Some(edits) = req.params.get("edits").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing edits[]"));
    };

    if edits.len() > GRADES_BULK_MAX_EDITS {
        let rejected = edits.len();
        return Ok(json!({
            "ok": true,
            "updated": 0,
            "rejected": rejected,
            "limitExceeded": true,
            "errors": [{
                "index": -1,
                "code": "too_many_edits",
                "message": format!(
                    "bulk payload exceeds max edits: {} > {}",
                    rejected, GRADES_BULK_MAX_EDITS
                )
            }]
        }));
    }

    let fallback_year = setup::current_school_year(conn);
    let default_year = || fallback_year.clone();
    let mut trees = TreeCache::default();
    let mut updated: usize = 0;
    let mut errors: Vec<Value> = Vec::new();

    let tx = conn.unchecked_transaction().map_err(db_update_err)?;
    for (i, edit) in edits.iter().enumerate() {
        if !edit.is_object() {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("edit at index {} must be an object", i),
            }));
            continue;
        }
        match apply_edit(&tx, &mut trees, edit, &default_year) {
            Ok(()) => updated += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            })),
        }
    }
    tx.commit().map_err(db_update_err)?;

    let rejected = errors.len();
    tracing::info!(updated, rejected, "grades bulk upsert");
    let mut result = json!({ "ok": true, "updated": updated });
    if rejected > 0 {
        if let Some(obj) = result.as_object_mut() {
            obj.insert("rejected".into(), json!(rejected));
            obj.insert("errors".into(), json!(errors));
        }
    }
    Ok(result)
}

fn grades_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student = resolve_student(conn, get_str(&req.params, "studentId")?)?;
    let level = resolve_level(&req.params, &student)?;
    let school_year = get_school_year(&req.params, || setup::current_school_year(conn))?;
    let grades =
        records::load_grade_rows(conn, &student.id, level, &school_year).map_err(db_query_err)?;
    Ok(json!({
        "student": student,
        "levelKey": level.key(),
        "schoolYear": school_year,
        "grades": grades,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grades.upsert" => grades_upsert(state, req),
        "grades.bulkUpsert" => grades_bulk_upsert(state, req),
        "grades.list" => grades_list(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
