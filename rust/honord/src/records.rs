use crate::honor::{AcademicLevel, GradeRow, HonorCriterion, HonorDecision};
use crate::periods::GradingPeriod;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    pub id: String,
    pub student_no: String,
    pub display_name: String,
    pub level_key: String,
    pub year_of_study: Option<i64>,
    pub section: Option<String>,
    pub active: bool,
}

impl StudentRecord {
    pub fn level(&self) -> Option<AcademicLevel> {
        AcademicLevel::parse(&self.level_key)
    }
}

const STUDENT_COLUMNS: &str =
    "id, student_no, last_name, first_name, academic_level_key, year_of_study, section, active";

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRecord> {
    let last: String = r.get(2)?;
    let first: String = r.get(3)?;
    Ok(StudentRecord {
        id: r.get(0)?,
        student_no: r.get(1)?,
        display_name: format!("{}, {}", last, first),
        level_key: r.get(4)?,
        year_of_study: r.get(5)?,
        section: r.get(6)?,
        active: r.get::<_, i64>(7)? != 0,
    })
}

pub fn load_student(conn: &Connection, student_id: &str) -> anyhow::Result<Option<StudentRecord>> {
    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
    Ok(conn
        .query_row(&sql, [student_id], student_from_row)
        .optional()?)
}

pub fn list_students(
    conn: &Connection,
    level: Option<AcademicLevel>,
) -> anyhow::Result<Vec<StudentRecord>> {
    let sql = format!(
        "SELECT {} FROM students
         WHERE (?1 IS NULL OR academic_level_key = ?1)
         ORDER BY last_name, first_name, student_no",
        STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([level.map(|l| l.key())], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_grade_rows(
    conn: &Connection,
    student_id: &str,
    level: AcademicLevel,
    school_year: &str,
) -> anyhow::Result<Vec<GradeRow>> {
    let mut stmt = conn.prepare(
        "SELECT g.subject_id, s.units, g.grading_period_code, g.grade
         FROM student_grades g
         JOIN subjects s ON s.id = g.subject_id
         WHERE g.student_id = ? AND g.academic_level_key = ? AND g.school_year = ?
         ORDER BY g.rowid",
    )?;
    let rows = stmt
        .query_map((student_id, level.key(), school_year), |r| {
            Ok(GradeRow {
                subject_id: r.get(0)?,
                units: r.get(1)?,
                period_code: r.get(2)?,
                grade: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_periods(conn: &Connection, level: AcademicLevel) -> anyhow::Result<Vec<GradingPeriod>> {
    let mut stmt = conn.prepare(
        "SELECT code, name, parent_code, sort_order, weight, is_calculated
         FROM grading_periods
         WHERE academic_level_key = ?
         ORDER BY sort_order, code",
    )?;
    let rows = stmt
        .query_map([level.key()], |r| {
            Ok(GradingPeriod {
                code: r.get(0)?,
                name: r.get(1)?,
                parent_code: r.get(2)?,
                sort_order: r.get(3)?,
                weight: r.get(4)?,
                is_calculated: r.get::<_, i64>(5)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_criteria(
    conn: &Connection,
    level: AcademicLevel,
) -> anyhow::Result<Vec<HonorCriterion>> {
    let mut stmt = conn.prepare(
        "SELECT c.honor_type_key, t.name, c.min_gpa, c.max_gpa, c.min_grade, c.min_grade_all,
                c.min_year, c.max_year, c.require_consistent_honor, c.priority
         FROM honor_criteria c
         JOIN honor_types t ON t.key = c.honor_type_key
         WHERE c.academic_level_key = ?
         ORDER BY c.min_gpa DESC, c.priority DESC, c.honor_type_key",
    )?;
    let rows = stmt
        .query_map([level.key()], |r| {
            Ok(HonorCriterion {
                honor_type: r.get(0)?,
                honor_name: r.get(1)?,
                min_gpa: r.get(2)?,
                max_gpa: r.get(3)?,
                min_grade: r.get(4)?,
                min_grade_all: r.get(5)?,
                min_year: r.get(6)?,
                max_year: r.get(7)?,
                require_consistent_honor: r.get::<_, i64>(8)? != 0,
                priority: r.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct GradeUpsert<'a> {
    pub student_id: &'a str,
    pub subject_id: &'a str,
    pub level: AcademicLevel,
    pub period_code: &'a str,
    pub school_year: &'a str,
    pub grade: f64,
}

pub fn upsert_grade(conn: &Connection, g: &GradeUpsert<'_>) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO student_grades(
            id, student_id, subject_id, academic_level_key, grading_period_code, school_year, grade, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, academic_level_key, grading_period_code, school_year)
         DO UPDATE SET grade = excluded.grade, updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            g.student_id,
            g.subject_id,
            g.level.key(),
            g.period_code,
            g.school_year,
            g.grade,
            now_rfc3339(),
        ),
    )?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Pending,
    Approved,
    Rejected,
}

impl ResultStatus {
    pub fn key(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// What persisting an evaluation did to the stored HonorResult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistOutcome {
    Created,
    Updated,
    Unchanged,
    Cleared,
    /// A reviewed result disagrees with the new evaluation and was left alone.
    Locked,
    NoHonor,
    /// The level keeps its results at the other scope; nothing was written.
    Skipped,
}

/// Writes the evaluation for one (student, level, school year, period scope).
/// `period_code` is `None` for the whole-year result. Each level stores one
/// kind only, so a year result never sits beside period results.
pub fn persist_decision(
    conn: &Connection,
    student_id: &str,
    level: AcademicLevel,
    school_year: &str,
    period_code: Option<&str>,
    decision: Option<&HonorDecision>,
) -> anyhow::Result<PersistOutcome> {
    if level.results_per_period() != period_code.is_some() {
        return Ok(PersistOutcome::Skipped);
    }
    let scope = period_code.unwrap_or("");
    let existing: Option<(String, String, f64, String)> = conn
        .query_row(
            "SELECT id, honor_type_key, gpa, status FROM honor_results
             WHERE student_id = ? AND academic_level_key = ? AND school_year = ? AND period_code = ?",
            (student_id, level.key(), school_year, scope),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let now = now_rfc3339();

    match (existing, decision) {
        (None, None) => Ok(PersistOutcome::NoHonor),
        (None, Some(d)) => {
            conn.execute(
                "INSERT INTO honor_results(
                    id, student_id, honor_type_key, academic_level_key, school_year, period_code,
                    gpa, status, created_at, updated_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    student_id,
                    &d.honor_type,
                    level.key(),
                    school_year,
                    scope,
                    d.gpa,
                    &now,
                    &now,
                ],
            )?;
            Ok(PersistOutcome::Created)
        }
        (Some((id, _, _, status)), None) => {
            if status == ResultStatus::Pending.key() {
                conn.execute("DELETE FROM honor_results WHERE id = ?", [&id])?;
                Ok(PersistOutcome::Cleared)
            } else {
                tracing::warn!(result_id = %id, %status, "reviewed honor no longer qualifies; left unchanged");
                Ok(PersistOutcome::Locked)
            }
        }
        (Some((id, honor_type, gpa, status)), Some(d)) => {
            if honor_type == d.honor_type && gpa == d.gpa {
                return Ok(PersistOutcome::Unchanged);
            }
            if status != ResultStatus::Pending.key() {
                tracing::warn!(result_id = %id, %status, new_honor = %d.honor_type, "reviewed honor differs from evaluation; left unchanged");
                return Ok(PersistOutcome::Locked);
            }
            conn.execute(
                "UPDATE honor_results SET honor_type_key = ?, gpa = ?, updated_at = ? WHERE id = ?",
                (&d.honor_type, d.gpa, &now, &id),
            )?;
            Ok(PersistOutcome::Updated)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HonorResultRow {
    pub id: String,
    pub student_id: String,
    pub display_name: String,
    pub honor_type: String,
    pub honor_name: String,
    pub level_key: String,
    pub school_year: String,
    pub period_code: Option<String>,
    pub gpa: f64,
    pub status: String,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<String>,
    pub review_note: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

const RESULT_SELECT: &str = "SELECT r.id, r.student_id, st.last_name, st.first_name, r.honor_type_key, t.name,
        r.academic_level_key, r.school_year, r.period_code, r.gpa, r.status,
        r.reviewed_by, r.reviewed_at, r.review_note, r.created_at, r.updated_at
     FROM honor_results r
     JOIN students st ON st.id = r.student_id
     JOIN honor_types t ON t.key = r.honor_type_key";

fn result_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<HonorResultRow> {
    let last: String = r.get(2)?;
    let first: String = r.get(3)?;
    let period: String = r.get(8)?;
    Ok(HonorResultRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        display_name: format!("{}, {}", last, first),
        honor_type: r.get(4)?,
        honor_name: r.get(5)?,
        level_key: r.get(6)?,
        school_year: r.get(7)?,
        period_code: if period.is_empty() { None } else { Some(period) },
        gpa: r.get(9)?,
        status: r.get(10)?,
        reviewed_by: r.get(11)?,
        reviewed_at: r.get(12)?,
        review_note: r.get(13)?,
        created_at: r.get(14)?,
        updated_at: r.get(15)?,
    })
}

pub fn load_result(conn: &Connection, id: &str) -> anyhow::Result<Option<HonorResultRow>> {
    let sql = format!("{} WHERE r.id = ?", RESULT_SELECT);
    Ok(conn.query_row(&sql, [id], result_from_row).optional()?)
}

pub fn list_results(
    conn: &Connection,
    level: AcademicLevel,
    school_year: &str,
    status: Option<ResultStatus>,
) -> anyhow::Result<Vec<HonorResultRow>> {
    let sql = format!(
        "{} WHERE r.academic_level_key = ?1 AND r.school_year = ?2
           AND (?3 IS NULL OR r.status = ?3)
         ORDER BY r.period_code, r.gpa DESC, st.last_name, st.first_name",
        RESULT_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            (level.key(), school_year, status.map(|s| s.key())),
            result_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(thiserror::Error, Debug)]
pub enum ReviewError {
    #[error("honor result not found")]
    NotFound,
    #[error("cannot move honor result from {from} to {to}")]
    InvalidTransition { from: String, to: &'static str },
    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

impl ReviewError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Db(_) => "db_update_failed",
        }
    }
}

/// Moves a pending result to approved or rejected.
pub fn review_result(
    conn: &Connection,
    id: &str,
    to: ResultStatus,
    reviewer: &str,
    note: Option<&str>,
) -> Result<HonorResultRow, ReviewError> {
    let current = load_result(conn, id)?.ok_or(ReviewError::NotFound)?;
    if current.status != ResultStatus::Pending.key() || to == ResultStatus::Pending {
        return Err(ReviewError::InvalidTransition {
            from: current.status,
            to: to.key(),
        });
    }
    let now = now_rfc3339();
    conn.execute(
        "UPDATE honor_results
         SET status = ?, reviewed_by = ?, reviewed_at = ?, review_note = ?, updated_at = ?
         WHERE id = ?",
        (to.key(), reviewer, &now, note, &now, id),
    )
    .map_err(anyhow::Error::from)?;
    tracing::info!(result_id = %id, status = to.key(), %reviewer, "honor result reviewed");
    load_result(conn, id)?.ok_or(ReviewError::NotFound)
}
