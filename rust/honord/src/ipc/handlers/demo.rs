use super::setup;
use crate::demo::{self, PerformanceTier};
use crate::ipc::helpers::{
    db_query_err, db_update_err, get_level, get_opt_i64, get_school_year, require_db, respond,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::periods::{HonorGranularity, PeriodTree};
use crate::records::{self, GradeUpsert};
use serde_json::{json, Value};

/// Fills entry-period grades for the listed students, each drawn from the
/// range of its assigned performance tier.
fn demo_seed_grades(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let p = &req.params;
    let level = get_level(p)?;
    let school_year = get_school_year(p, || setup::current_school_year(conn))?;
    let seed = match get_opt_i64(p, "seed")? {
        Some(s) => s as u64,
        None => rand::random::<u64>(),
    };
    let Some(assignments) = p.get("assignments").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing assignments[]"));
    };

    let periods = records::load_periods(conn, level).map_err(db_query_err)?;
    let tree = PeriodTree::new(periods)?;
    let entry_periods = tree.honor_periods(HonorGranularity::EntryPeriods, &[]);
    if entry_periods.is_empty() {
        return Err(HandlerErr::bad_params("level has no grading periods"));
    }

    let mut stmt = conn
        .prepare("SELECT id FROM subjects WHERE academic_level_key = ? ORDER BY code")
        .map_err(db_query_err)?;
    let subjects = stmt
        .query_map([level.key()], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;
    if subjects.is_empty() {
        return Err(HandlerErr::bad_params("level has no subjects"));
    }

    let mut plan: Vec<(String, PerformanceTier)> = Vec::with_capacity(assignments.len());
    for (i, a) in assignments.iter().enumerate() {
        let student_id = a.get("studentId").and_then(|v| v.as_str());
        let tier = a
            .get("tier")
            .and_then(|v| v.as_str())
            .and_then(PerformanceTier::parse);
        let (Some(student_id), Some(tier)) = (student_id, tier) else {
            return Err(HandlerErr::bad_params(format!(
                "assignment at index {} needs studentId and a known tier",
                i
            ))
            .with_details(json!({
                "allowedTiers": PerformanceTier::ALL.iter().map(|t| t.key()).collect::<Vec<_>>(),
            })));
        };
        let student = records::load_student(conn, student_id)
            .map_err(db_query_err)?
            .ok_or_else(|| {
                HandlerErr::new("not_found", "student not found")
                    .with_details(json!({ "studentId": student_id }))
            })?;
        if student.level() != Some(level) {
            return Err(HandlerErr::bad_params("student is not enrolled at this level")
                .with_details(json!({ "studentId": student_id, "levelKey": student.level_key })));
        }
        plan.push((student.id, tier));
    }

    let mut rng = demo::seeded_rng(seed);
    let tx = conn.unchecked_transaction().map_err(db_update_err)?;
    let mut written = 0usize;
    for (student_id, tier) in &plan {
        for g in demo::generate_grades(&mut rng, *tier, &subjects, &entry_periods) {
            records::upsert_grade(
                &tx,
                &GradeUpsert {
                    student_id,
                    subject_id: &g.subject_id,
                    level,
                    period_code: &g.period_code,
                    school_year: &school_year,
                    grade: g.grade,
                },
            )
            .map_err(db_update_err)?;
            written += 1;
        }
    }
    tx.commit().map_err(db_update_err)?;

    tracing::info!(level = level.key(), students = plan.len(), grades = written, seed, "demo grades seeded");
    Ok(json!({
        "ok": true,
        "levelKey": level.key(),
        "schoolYear": school_year,
        "seed": seed,
        "students": plan.len(),
        "grades": written,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "demo.seedGrades" => demo_seed_grades(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
