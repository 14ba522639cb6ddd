use super::setup::{self, HonorSettings};
use crate::honor::{
    self, AcademicLevel, GradeRow, HonorCriterion, HonorDecision, HonorError, StudentContext,
};
use crate::ipc::helpers::{
    db_query_err, db_update_err, get_bool_or, get_level, get_opt_str, get_school_year, get_str,
    require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::periods::PeriodTree;
use crate::records::{self, PersistOutcome, ResultStatus, ReviewError, StudentRecord};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Everything one evaluation needs, loaded from the workspace.
struct LevelInputs {
    level: AcademicLevel,
    school_year: String,
    tree: PeriodTree,
    criteria: Vec<HonorCriterion>,
    settings: HonorSettings,
}

impl LevelInputs {
    fn load(conn: &Connection, level: AcademicLevel, school_year: String) -> Result<Self, HandlerErr> {
        let periods = records::load_periods(conn, level).map_err(db_query_err)?;
        let tree = PeriodTree::new(periods)?;
        let criteria = records::load_criteria(conn, level).map_err(db_query_err)?;
        if criteria.is_empty() {
            return Err(HonorError::MissingCriteria(level.key().to_string()).into());
        }
        let settings = setup::load_honor_settings(conn).map_err(db_query_err)?;
        Ok(Self {
            level,
            school_year,
            tree,
            criteria,
            settings,
        })
    }

    fn context<'a>(&'a self, student: &'a StudentRecord) -> StudentContext<'a> {
        StudentContext {
            student_id: &student.id,
            level: self.level,
            school_year: &self.school_year,
            year_of_study: student.year_of_study,
        }
    }

    fn grades(&self, conn: &Connection, student: &StudentRecord) -> Result<Vec<GradeRow>, HandlerErr> {
        records::load_grade_rows(conn, &student.id, self.level, &self.school_year)
            .map_err(db_query_err)
    }

    fn persist(
        &self,
        conn: &Connection,
        student: &StudentRecord,
        period_code: Option<&str>,
        decision: Option<&HonorDecision>,
    ) -> Result<PersistOutcome, HandlerErr> {
        records::persist_decision(
            conn,
            &student.id,
            self.level,
            &self.school_year,
            period_code,
            decision,
        )
        .map_err(db_update_err)
    }
}

/// Resolves the student named by `studentId` and the inputs for the level
/// being evaluated (the student's own level unless `levelKey` is given).
fn load_student_inputs(
    conn: &Connection,
    params: &Value,
) -> Result<(StudentRecord, LevelInputs), HandlerErr> {
    let student_id = get_str(params, "studentId")?;
    let student = records::load_student(conn, student_id)
        .map_err(db_query_err)?
        .ok_or_else(|| {
            HandlerErr::new("not_found", "student not found")
                .with_details(json!({ "studentId": student_id }))
        })?;
    let level = if get_opt_str(params, "levelKey")?.is_some() {
        get_level(params)?
    } else {
        student.level().ok_or_else(|| {
            HandlerErr::new("invalid_student", "student has an unknown academic level")
        })?
    };
    let school_year = get_school_year(params, || setup::current_school_year(conn))?;
    let inputs = LevelInputs::load(conn, level, school_year)?;
    Ok((student, inputs))
}

fn should_persist(params: &Value, inputs: &LevelInputs) -> Result<bool, HandlerErr> {
    Ok(inputs.settings.persist_results && get_bool_or(params, "persist", true)?)
}

fn honors_evaluate_year(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let (student, inputs) = load_student_inputs(conn, &req.params)?;
    let grades = inputs.grades(conn, &student)?;
    let eval = honor::evaluate_year_detailed(
        &inputs.context(&student),
        &grades,
        &inputs.tree,
        &inputs.criteria,
        &inputs.settings.opts,
    )?;
    let persisted = if should_persist(&req.params, &inputs)? {
        Some(inputs.persist(conn, &student, None, eval.honor.as_ref())?)
    } else {
        None
    };
    tracing::debug!(
        student_id = %student.id,
        level = inputs.level.key(),
        school_year = %inputs.school_year,
        honor = ?eval.honor.as_ref().map(|h| h.honor_type.as_str()),
        "evaluated yearly honor"
    );
    Ok(json!({
        "studentId": student.id,
        "levelKey": inputs.level.key(),
        "schoolYear": inputs.school_year,
        "gpa": eval.gpa,
        "honor": eval.honor,
        "checks": eval.checks,
        "persisted": persisted,
    }))
}

fn honors_evaluate_period(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let (student, inputs) = load_student_inputs(conn, &req.params)?;
    let period_code = get_str(&req.params, "periodCode")?.to_ascii_uppercase();
    let grades = inputs.grades(conn, &student)?;
    let outcome = honor::evaluate_period_in_year(
        &inputs.context(&student),
        &period_code,
        &grades,
        &inputs.tree,
        &inputs.criteria,
        &inputs.settings.opts,
    )?;
    let persisted = if should_persist(&req.params, &inputs)? {
        Some(inputs.persist(conn, &student, Some(&outcome.period_code), outcome.honor.as_ref())?)
    } else {
        None
    };
    Ok(json!({
        "studentId": student.id,
        "levelKey": inputs.level.key(),
        "schoolYear": inputs.school_year,
        "outcome": outcome,
        "persisted": persisted,
    }))
}

fn honors_evaluate_periods(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let (student, inputs) = load_student_inputs(conn, &req.params)?;
    let grades = inputs.grades(conn, &student)?;
    let outcomes = honor::evaluate_periods(
        &inputs.context(&student),
        &grades,
        &inputs.tree,
        &inputs.criteria,
        &inputs.settings.opts,
    )?;

    let mut periods = Vec::with_capacity(outcomes.len());
    let persist = should_persist(&req.params, &inputs)?;
    for outcome in outcomes {
        let persisted = if persist {
            Some(inputs.persist(conn, &student, Some(&outcome.period_code), outcome.honor.as_ref())?)
        } else {
            None
        };
        periods.push(json!({ "outcome": outcome, "persisted": persisted }));
    }
    Ok(json!({
        "studentId": student.id,
        "levelKey": inputs.level.key(),
        "schoolYear": inputs.school_year,
        "periods": periods,
    }))
}

/// Batch evaluation of every active student at a level. Per-student failures
/// are reported alongside the successes; configuration errors fail the call.
fn honors_evaluate_level(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let p = &req.params;
    let level = get_level(p)?;
    let school_year = get_school_year(p, || setup::current_school_year(conn))?;
    let period_code = get_opt_str(p, "periodCode")?.map(|s| s.to_ascii_uppercase());
    let inputs = LevelInputs::load(conn, level, school_year)?;
    if let Some(code) = period_code.as_deref() {
        if !inputs.tree.knows(code) {
            return Err(HonorError::UnknownPeriod(code.to_string()).into());
        }
    }
    let persist = should_persist(p, &inputs)?;

    let students: Vec<StudentRecord> = records::list_students(conn, Some(level))
        .map_err(db_query_err)?
        .into_iter()
        .filter(|s| s.active)
        .collect();

    let tx = conn.unchecked_transaction().map_err(db_update_err)?;
    let mut results = Vec::with_capacity(students.len());
    let mut errors = Vec::new();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for student in &students {
        let grades = inputs.grades(&tx, student)?;
        let ctx = inputs.context(student);
        let evaluated = match period_code.as_deref() {
            None => honor::evaluate_year(
                &ctx,
                &grades,
                &inputs.tree,
                &inputs.criteria,
                &inputs.settings.opts,
            )
            .map(|h| (honor::compute_gpa(&grades, &inputs.tree, &inputs.settings.opts), h)),
            Some(code) => honor::evaluate_period_in_year(
                &ctx,
                code,
                &grades,
                &inputs.tree,
                &inputs.criteria,
                &inputs.settings.opts,
            )
            .map(|o| (o.gpa, o.honor)),
        };
        let (gpa, decision) = match evaluated {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(student_id = %student.id, error = %e, "honor evaluation failed");
                errors.push(json!({
                    "studentId": student.id,
                    "code": e.code(),
                    "message": e.to_string(),
                }));
                continue;
            }
        };
        let persisted = if persist {
            Some(inputs.persist(&tx, student, period_code.as_deref(), decision.as_ref())?)
        } else {
            None
        };
        if let Some(d) = decision.as_ref() {
            *counts.entry(d.honor_type.clone()).or_default() += 1;
        }
        results.push(json!({
            "studentId": student.id,
            "displayName": student.display_name,
            "gpa": gpa,
            "honor": decision,
            "persisted": persisted,
        }));
    }
    tx.commit().map_err(db_update_err)?;

    tracing::info!(
        level = level.key(),
        school_year = %inputs.school_year,
        evaluated = results.len(),
        failed = errors.len(),
        "level honors evaluated"
    );
    Ok(json!({
        "levelKey": level.key(),
        "schoolYear": inputs.school_year,
        "periodCode": period_code,
        "evaluated": results.len(),
        "honorCounts": counts,
        "results": results,
        "errors": errors,
    }))
}

fn results_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let p = &req.params;
    let level = get_level(p)?;
    let school_year = get_school_year(p, || setup::current_school_year(conn))?;
    let status = match get_opt_str(p, "status")? {
        None => None,
        Some(raw) => Some(ResultStatus::parse(raw).ok_or_else(|| {
            HandlerErr::bad_params("status must be one of: pending, approved, rejected")
        })?),
    };
    let results =
        records::list_results(conn, level, &school_year, status).map_err(db_query_err)?;
    Ok(json!({
        "levelKey": level.key(),
        "schoolYear": school_year,
        "results": results,
    }))
}

fn results_review(state: &AppState, req: &Request, to: ResultStatus) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let p = &req.params;
    let result_id = get_str(p, "resultId")?;
    let reviewer = get_str(p, "reviewer")?;
    let note = get_opt_str(p, "note")?;
    match records::review_result(conn, result_id, to, reviewer, note) {
        Ok(row) => Ok(json!({ "ok": true, "result": row })),
        Err(e @ ReviewError::Db(_)) => Err(db_update_err(e)),
        Err(e) => Err(HandlerErr::new(e.code(), e.to_string())
            .with_details(json!({ "resultId": result_id }))),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "honors.evaluateYear" => honors_evaluate_year(state, req),
        "honors.evaluatePeriod" => honors_evaluate_period(state, req),
        "honors.evaluatePeriods" => honors_evaluate_periods(state, req),
        "honors.evaluateLevel" => honors_evaluate_level(state, req),
        "honors.results.list" => results_list(state, req),
        "honors.results.approve" => results_review(state, req, ResultStatus::Approved),
        "honors.results.reject" => results_review(state, req, ResultStatus::Rejected),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
