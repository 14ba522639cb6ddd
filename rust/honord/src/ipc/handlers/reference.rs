use crate::honor::{validate_criteria, AcademicLevel, HonorCriterion, HonorScope};
use crate::ipc::helpers::{
    db_query_err, db_update_err, get_bool_or, get_f64, get_level, get_opt_f64, get_opt_i64,
    get_opt_str, get_str, require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::periods::{GradingPeriod, PeriodTree};
use crate::{records, reference};
use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use uuid::Uuid;

fn levels_list(state: &AppState, _req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut stmt = conn
        .prepare("SELECT key, name FROM academic_levels ORDER BY sort_order")
        .map_err(db_query_err)?;
    let levels = stmt
        .query_map([], |r| {
            let key: String = r.get(0)?;
            let name: String = r.get(1)?;
            Ok((key, name))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;
    let levels: Vec<Value> = levels
        .into_iter()
        .map(|(key, name)| {
            let level = AcademicLevel::parse(&key);
            let result_scope = level.map(|l| if l.results_per_period() { "period" } else { "year" });
            json!({
                "key": key,
                "name": name,
                "scope": level.map(|l| l.scope().key()),
                "resultScope": result_scope,
            })
        })
        .collect();
    Ok(json!({ "levels": levels }))
}

fn honor_types_list(state: &AppState, _req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut stmt = conn
        .prepare("SELECT key, name, scope FROM honor_types ORDER BY scope, key")
        .map_err(db_query_err)?;
    let types = stmt
        .query_map([], |r| {
            Ok(json!({
                "key": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "scope": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;
    Ok(json!({ "honorTypes": types }))
}

fn periods_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let level = get_level(&req.params)?;
    let periods = records::load_periods(conn, level).map_err(db_query_err)?;
    let tree = PeriodTree::new(periods.clone())?;
    let honor_periods = tree.honor_periods(level.honor_granularity(), &[]);
    Ok(json!({
        "levelKey": level.key(),
        "periods": periods,
        "honorPeriods": honor_periods,
    }))
}

fn periods_upsert(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let p = &req.params;
    let level = get_level(p)?;
    let code = get_str(p, "code")?.to_ascii_uppercase();
    let name = get_str(p, "name")?.to_string();
    let parent_code = get_opt_str(p, "parentCode")?.map(|s| s.to_ascii_uppercase());
    let sort_order = get_opt_i64(p, "sortOrder")?.unwrap_or(0);
    let weight = get_opt_f64(p, "weight")?.unwrap_or(1.0);
    let is_calculated = get_bool_or(p, "isCalculated", false)?;
    if !weight.is_finite() || weight <= 0.0 {
        return Err(HandlerErr::bad_params("weight must be > 0").with_details(json!({ "weight": weight })));
    }

    let candidate = GradingPeriod {
        code: code.clone(),
        name,
        parent_code,
        sort_order,
        weight,
        is_calculated,
    };
    let mut periods = records::load_periods(conn, level).map_err(db_query_err)?;
    periods.retain(|x| x.code != candidate.code);
    periods.push(candidate.clone());
    PeriodTree::new(periods)?;

    conn.execute(
        "INSERT INTO grading_periods(
            id, academic_level_key, code, name, parent_code, sort_order, weight, is_calculated
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(academic_level_key, code) DO UPDATE SET
           name = excluded.name,
           parent_code = excluded.parent_code,
           sort_order = excluded.sort_order,
           weight = excluded.weight,
           is_calculated = excluded.is_calculated",
        (
            Uuid::new_v4().to_string(),
            level.key(),
            &candidate.code,
            &candidate.name,
            &candidate.parent_code,
            candidate.sort_order,
            candidate.weight,
            candidate.is_calculated as i64,
        ),
    )
    .map_err(db_update_err)?;
    Ok(json!({ "ok": true, "period": candidate }))
}

fn criteria_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let level = get_level(&req.params)?;
    let criteria = records::load_criteria(conn, level).map_err(db_query_err)?;
    Ok(json!({ "levelKey": level.key(), "criteria": criteria }))
}

fn criteria_upsert(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let p = &req.params;
    let level = get_level(p)?;
    let honor_type_key = get_str(p, "honorType")?;
    let Some(honor_type) = reference::honor_type(honor_type_key) else {
        return Err(HandlerErr::bad_params("unknown honorType")
            .with_details(json!({ "honorType": honor_type_key })));
    };
    if honor_type.scope != level.scope() {
        return Err(HandlerErr::bad_params(format!(
            "{} is a {} honor and cannot apply to {}",
            honor_type.key,
            honor_type.scope.key(),
            level.key()
        )));
    }

    let criterion = HonorCriterion {
        honor_type: honor_type.key.to_string(),
        honor_name: honor_type.name.to_string(),
        min_gpa: get_f64(p, "minGpa")?,
        max_gpa: get_opt_f64(p, "maxGpa")?,
        min_grade: get_opt_f64(p, "minGrade")?,
        min_grade_all: get_opt_f64(p, "minGradeAll")?,
        min_year: get_opt_i64(p, "minYear")?,
        max_year: get_opt_i64(p, "maxYear")?,
        require_consistent_honor: get_bool_or(p, "requireConsistentHonor", false)?,
        priority: get_opt_i64(p, "priority")?.unwrap_or(0),
    };
    if level.scope() == HonorScope::Basic
        && (criterion.min_year.is_some() || criterion.max_year.is_some())
    {
        return Err(HandlerErr::bad_params(
            "minYear/maxYear only apply to college criteria",
        ));
    }
    validate_criteria(std::slice::from_ref(&criterion))?;

    conn.execute(
        "INSERT INTO honor_criteria(
            id, academic_level_key, honor_type_key, min_gpa, max_gpa, min_grade,
            min_grade_all, min_year, max_year, require_consistent_honor, priority
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(academic_level_key, honor_type_key) DO UPDATE SET
           min_gpa = excluded.min_gpa,
           max_gpa = excluded.max_gpa,
           min_grade = excluded.min_grade,
           min_grade_all = excluded.min_grade_all,
           min_year = excluded.min_year,
           max_year = excluded.max_year,
           require_consistent_honor = excluded.require_consistent_honor,
           priority = excluded.priority",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            level.key(),
            &criterion.honor_type,
            criterion.min_gpa,
            criterion.max_gpa,
            criterion.min_grade,
            criterion.min_grade_all,
            criterion.min_year,
            criterion.max_year,
            criterion.require_consistent_honor as i64,
            criterion.priority,
        ],
    )
    .map_err(db_update_err)?;
    tracing::info!(level = level.key(), honor_type = %criterion.honor_type, "honor criterion saved");
    Ok(json!({ "ok": true, "criterion": criterion }))
}

fn subjects_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let level = get_level(&req.params)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, code, name, units, strand FROM subjects
             WHERE academic_level_key = ?
             ORDER BY code",
        )
        .map_err(db_query_err)?;
    let subjects = stmt
        .query_map([level.key()], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "units": r.get::<_, f64>(3)?,
                "strand": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;
    Ok(json!({ "levelKey": level.key(), "subjects": subjects }))
}

fn subjects_upsert(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let p = &req.params;
    let level = get_level(p)?;
    let code = get_str(p, "code")?.to_ascii_uppercase();
    let name = get_str(p, "name")?;
    let units = get_opt_f64(p, "units")?.unwrap_or(1.0);
    let strand = get_opt_str(p, "strand")?;
    if !units.is_finite() || units < 0.0 {
        return Err(HandlerErr::bad_params("units must be >= 0").with_details(json!({ "units": units })));
    }

    conn.execute(
        "INSERT INTO subjects(id, academic_level_key, code, name, units, strand)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(academic_level_key, code) DO UPDATE SET
           name = excluded.name,
           units = excluded.units,
           strand = excluded.strand",
        (Uuid::new_v4().to_string(), level.key(), &code, name, units, strand),
    )
    .map_err(db_update_err)?;
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM subjects WHERE academic_level_key = ? AND code = ?",
            (level.key(), &code),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    let id = id.ok_or_else(|| HandlerErr::new("db_update_failed", "subject not stored"))?;
    Ok(json!({ "ok": true, "subjectId": id, "code": code }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "levels.list" => levels_list(state, req),
        "honorTypes.list" => honor_types_list(state, req),
        "periods.list" => periods_list(state, req),
        "periods.upsert" => periods_upsert(state, req),
        "criteria.list" => criteria_list(state, req),
        "criteria.upsert" => criteria_upsert(state, req),
        "subjects.list" => subjects_list(state, req),
        "subjects.upsert" => subjects_upsert(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
