//! Honor qualification.
//!
//! Pure functions from a student's grade rows and the honor criteria of their
//! academic level to the single best honor they earn, per school year or per
//! grading period. Nothing here touches storage.

use crate::periods::{HonorGranularity, PeriodTree};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcademicLevel {
    Elementary,
    JuniorHighschool,
    SeniorHighschool,
    College,
}

impl AcademicLevel {
    pub const ALL: [AcademicLevel; 4] = [
        AcademicLevel::Elementary,
        AcademicLevel::JuniorHighschool,
        AcademicLevel::SeniorHighschool,
        AcademicLevel::College,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Elementary => "elementary",
            Self::JuniorHighschool => "junior_highschool",
            Self::SeniorHighschool => "senior_highschool",
            Self::College => "college",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|l| l.key().eq_ignore_ascii_case(s.trim()))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Elementary => "Elementary",
            Self::JuniorHighschool => "Junior High School",
            Self::SeniorHighschool => "Senior High School",
            Self::College => "College",
        }
    }

    pub fn scope(self) -> HonorScope {
        match self {
            Self::College => HonorScope::College,
            _ => HonorScope::Basic,
        }
    }

    /// Stored results are kept per honor period here, per school year elsewhere.
    pub fn results_per_period(self) -> bool {
        matches!(self, Self::SeniorHighschool | Self::College)
    }

    pub fn honor_granularity(self) -> HonorGranularity {
        match self {
            Self::College => HonorGranularity::Terms,
            _ => HonorGranularity::EntryPeriods,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HonorScope {
    Basic,
    College,
}

impl HonorScope {
    pub fn key(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::College => "college",
        }
    }
}

/// What the `min_grade` floor is compared against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MinGradeScope {
    #[default]
    SubjectAverage,
    RawGrade,
}

impl MinGradeScope {
    pub fn key(self) -> &'static str {
        match self {
            Self::SubjectAverage => "subjectAverage",
            Self::RawGrade => "rawGrade",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "subjectaverage" => Some(Self::SubjectAverage),
            "rawgrade" => Some(Self::RawGrade),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalOptions {
    pub min_grade_scope: MinGradeScope,
    pub gpa_decimals: u32,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            min_grade_scope: MinGradeScope::SubjectAverage,
            gpa_decimals: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRow {
    pub subject_id: String,
    pub units: f64,
    pub period_code: String,
    pub grade: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HonorCriterion {
    pub honor_type: String,
    pub honor_name: String,
    pub min_gpa: f64,
    pub max_gpa: Option<f64>,
    pub min_grade: Option<f64>,
    pub min_grade_all: Option<f64>,
    pub min_year: Option<i64>,
    pub max_year: Option<i64>,
    pub require_consistent_honor: bool,
    pub priority: i64,
}

#[derive(Debug, Clone)]
pub struct StudentContext<'a> {
    pub student_id: &'a str,
    pub level: AcademicLevel,
    pub school_year: &'a str,
    pub year_of_study: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HonorDecision {
    pub honor_type: String,
    pub honor_name: String,
    pub gpa: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierCheck {
    pub honor_type: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodOutcome {
    pub period_code: String,
    pub gpa: Option<f64>,
    pub honor: Option<HonorDecision>,
    pub checks: Vec<TierCheck>,
}

impl PeriodOutcome {
    pub fn qualified(&self) -> bool {
        self.honor.is_some()
    }

    fn graded(&self) -> bool {
        self.gpa.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearEvaluation {
    pub gpa: Option<f64>,
    pub honor: Option<HonorDecision>,
    pub checks: Vec<TierCheck>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum HonorError {
    #[error("no honor criteria configured for level {0}")]
    MissingCriteria(String),
    #[error("invalid criterion {honor_type}: {reason}")]
    InvalidCriterion { honor_type: String, reason: String },
    #[error("grade {grade} for subject {subject_id} in period {period_code} is outside 0..=100")]
    GradeOutOfRange {
        subject_id: String,
        period_code: String,
        grade: f64,
    },
    #[error("subject {subject_id} has invalid units {units}")]
    InvalidUnits { subject_id: String, units: f64 },
    #[error("grade references unknown grading period {0}")]
    UnknownPeriod(String),
    #[error("invalid grading period tree: {0}")]
    InvalidPeriodTree(String),
}

impl HonorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCriteria(_) => "missing_criteria",
            Self::InvalidCriterion { .. } => "invalid_criterion",
            Self::GradeOutOfRange { .. } => "grade_out_of_range",
            Self::InvalidUnits { .. } => "invalid_units",
            Self::UnknownPeriod(_) => "unknown_period",
            Self::InvalidPeriodTree(_) => "invalid_period_tree",
        }
    }
}

/// Half-up rounding to `decimals` places: `Int(x * 10^d + 0.5) / 10^d`.
pub fn round_half_up(x: f64, decimals: u32) -> f64 {
    let f = 10_f64.powi(decimals as i32);
    ((x * f) + 0.5).floor() / f
}

fn in_grade_range(v: f64) -> bool {
    v.is_finite() && (0.0..=100.0).contains(&v)
}

pub fn validate_criteria(criteria: &[HonorCriterion]) -> Result<(), HonorError> {
    for c in criteria {
        let bad = |reason: String| HonorError::InvalidCriterion {
            honor_type: c.honor_type.clone(),
            reason,
        };
        if !in_grade_range(c.min_gpa) {
            return Err(bad(format!("min_gpa {} outside 0..=100", c.min_gpa)));
        }
        if let Some(max) = c.max_gpa {
            if !in_grade_range(max) {
                return Err(bad(format!("max_gpa {} outside 0..=100", max)));
            }
            if max < c.min_gpa {
                return Err(bad(format!("max_gpa {} below min_gpa {}", max, c.min_gpa)));
            }
        }
        for (name, floor) in [("min_grade", c.min_grade), ("min_grade_all", c.min_grade_all)] {
            if let Some(v) = floor {
                if !in_grade_range(v) {
                    return Err(bad(format!("{} {} outside 0..=100", name, v)));
                }
            }
        }
        if let (Some(lo), Some(hi)) = (c.min_year, c.max_year) {
            if lo > hi {
                return Err(bad(format!("min_year {} above max_year {}", lo, hi)));
            }
        }
    }
    Ok(())
}

fn validate_inputs(
    ctx: &StudentContext<'_>,
    grades: &[GradeRow],
    tree: &PeriodTree,
    criteria: &[HonorCriterion],
) -> Result<(), HonorError> {
    if criteria.is_empty() {
        return Err(HonorError::MissingCriteria(ctx.level.key().to_string()));
    }
    validate_criteria(criteria)?;
    for g in grades {
        if !in_grade_range(g.grade) {
            return Err(HonorError::GradeOutOfRange {
                subject_id: g.subject_id.clone(),
                period_code: g.period_code.clone(),
                grade: g.grade,
            });
        }
        if !g.units.is_finite() || g.units < 0.0 {
            return Err(HonorError::InvalidUnits {
                subject_id: g.subject_id.clone(),
                units: g.units,
            });
        }
        if !tree.knows(&g.period_code) {
            return Err(HonorError::UnknownPeriod(g.period_code.clone()));
        }
    }
    Ok(())
}

#[derive(Default)]
struct SubjectScores<'a> {
    units: f64,
    by_period: HashMap<&'a str, Vec<f64>>,
}

/// The graded population of one evaluation scope.
struct Scored {
    gpa: f64,
    raw: Vec<f64>,
    subject_values: Vec<f64>,
}

fn score(
    grades: &[GradeRow],
    tree: &PeriodTree,
    period: Option<&str>,
    opts: &EvalOptions,
) -> Option<Scored> {
    let mut subjects: BTreeMap<&str, SubjectScores<'_>> = BTreeMap::new();
    let mut raw: Vec<f64> = Vec::new();

    for g in grades {
        if tree.is_calculated(&g.period_code) {
            tracing::debug!(
                subject = %g.subject_id,
                period = %g.period_code,
                "ignoring grade entered against a calculated period"
            );
            continue;
        }
        if let Some(p) = period {
            if !tree.contains(p, &g.period_code) {
                continue;
            }
        }
        let entry = subjects.entry(g.subject_id.as_str()).or_default();
        // Rows of one subject carry the same units; max keeps this order-free.
        entry.units = entry.units.max(g.units);
        entry
            .by_period
            .entry(g.period_code.as_str())
            .or_default()
            .push(g.grade);
        raw.push(g.grade);
    }

    let mut values: Vec<(f64, f64)> = Vec::with_capacity(subjects.len());
    for s in subjects.values() {
        let value = match period {
            Some(p) => tree.value_of(p, &s.by_period),
            None => tree.yearly_value(&s.by_period),
        };
        if let Some(v) = value {
            values.push((v, s.units));
        }
    }
    if values.is_empty() {
        return None;
    }

    let weighted: Vec<(f64, f64)> = values.iter().copied().filter(|(_, u)| *u > 0.0).collect();
    let gpa_raw = if weighted.is_empty() {
        crate::periods::mean(&values.iter().map(|(v, _)| *v).collect::<Vec<_>>())
    } else {
        crate::periods::weighted_mean(weighted)
    };
    let gpa_raw = gpa_raw?;

    Some(Scored {
        gpa: round_half_up(gpa_raw, opts.gpa_decimals),
        raw,
        subject_values: values.into_iter().map(|(v, _)| v).collect(),
    })
}

fn check_tier(
    c: &HonorCriterion,
    scored: &Scored,
    ctx: &StudentContext<'_>,
    opts: &EvalOptions,
    consistent: bool,
) -> TierCheck {
    let failed = first_failed_check(c, scored, ctx, opts, consistent);
    TierCheck {
        honor_type: c.honor_type.clone(),
        passed: failed.is_none(),
        failed,
    }
}

fn first_failed_check(
    c: &HonorCriterion,
    scored: &Scored,
    ctx: &StudentContext<'_>,
    opts: &EvalOptions,
    consistent: bool,
) -> Option<&'static str> {
    if let Some(floor) = c.min_grade_all {
        if scored.raw.iter().any(|g| *g < floor) {
            return Some("min_grade_all");
        }
    }
    if let Some(floor) = c.min_grade {
        let population = match opts.min_grade_scope {
            MinGradeScope::SubjectAverage => &scored.subject_values,
            MinGradeScope::RawGrade => &scored.raw,
        };
        if population.iter().any(|g| *g < floor) {
            return Some("min_grade");
        }
    }
    if scored.gpa < c.min_gpa {
        return Some("min_gpa");
    }
    if let Some(max) = c.max_gpa {
        // Judged at the ceiling's own precision so adjacent bands leave no gap.
        if truncate_to(scored.gpa, decimals_of(max)) > max {
            return Some("max_gpa");
        }
    }
    if c.min_year.is_some() || c.max_year.is_some() {
        let Some(year) = ctx.year_of_study else {
            return Some("year_window");
        };
        if c.min_year.map(|lo| year < lo).unwrap_or(false)
            || c.max_year.map(|hi| year > hi).unwrap_or(false)
        {
            return Some("year_window");
        }
    }
    if c.require_consistent_honor && !consistent {
        return Some("consistency");
    }
    None
}

/// Decimal places written in `x`, up to six.
fn decimals_of(x: f64) -> u32 {
    (0..6)
        .find(|&d| {
            let scaled = x * 10_f64.powi(d as i32);
            (scaled - scaled.round()).abs() < 1e-6
        })
        .unwrap_or(6)
}

fn truncate_to(x: f64, decimals: u32) -> f64 {
    let f = 10_f64.powi(decimals as i32);
    (x * f + 1e-6).floor() / f
}

/// Most prestigious first: highest `min_gpa`, then highest priority, then key.
fn tier_order(a: &HonorCriterion, b: &HonorCriterion) -> Ordering {
    b.min_gpa
        .partial_cmp(&a.min_gpa)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.honor_type.cmp(&b.honor_type))
}

fn decide(
    criteria: &[HonorCriterion],
    scored: &Scored,
    ctx: &StudentContext<'_>,
    opts: &EvalOptions,
    consistent: bool,
) -> (Option<HonorDecision>, Vec<TierCheck>) {
    let mut ordered: Vec<&HonorCriterion> = criteria.iter().collect();
    ordered.sort_by(|a, b| tier_order(a, b));

    let mut honor = None;
    let mut checks = Vec::with_capacity(ordered.len());
    for c in ordered {
        let check = check_tier(c, scored, ctx, opts, consistent);
        if check.passed && honor.is_none() {
            honor = Some(HonorDecision {
                honor_type: c.honor_type.clone(),
                honor_name: c.honor_name.clone(),
                gpa: scored.gpa,
            });
        }
        checks.push(check);
    }
    tracing::debug!(
        student_id = ctx.student_id,
        school_year = ctx.school_year,
        level = ctx.level.key(),
        gpa = scored.gpa,
        honor = ?honor.as_ref().map(|h| h.honor_type.as_str()),
        "honor decided"
    );
    (honor, checks)
}

/// Yearly GPA: subject values weighted by units, rounded per `opts`.
pub fn compute_gpa(
    grades: &[GradeRow],
    tree: &PeriodTree,
    opts: &EvalOptions,
) -> Option<f64> {
    score(grades, tree, None, opts).map(|s| s.gpa)
}

fn seen_periods(grades: &[GradeRow]) -> Vec<&str> {
    grades.iter().map(|g| g.period_code.as_str()).collect()
}

pub fn evaluate_year_detailed(
    ctx: &StudentContext<'_>,
    grades: &[GradeRow],
    tree: &PeriodTree,
    criteria: &[HonorCriterion],
    opts: &EvalOptions,
) -> Result<YearEvaluation, HonorError> {
    validate_inputs(ctx, grades, tree, criteria)?;

    let Some(scored) = score(grades, tree, None, opts) else {
        return Ok(YearEvaluation {
            gpa: None,
            honor: None,
            checks: Vec::new(),
        });
    };

    let consistent = if criteria.iter().any(|c| c.require_consistent_honor) {
        evaluate_periods(ctx, grades, tree, criteria, opts)?
            .iter()
            .filter(|o| o.graded())
            .all(|o| o.qualified())
    } else {
        true
    };

    let (honor, checks) = decide(criteria, &scored, ctx, opts, consistent);
    Ok(YearEvaluation {
        gpa: Some(scored.gpa),
        honor,
        checks,
    })
}

pub fn evaluate_year(
    ctx: &StudentContext<'_>,
    grades: &[GradeRow],
    tree: &PeriodTree,
    criteria: &[HonorCriterion],
    opts: &EvalOptions,
) -> Result<Option<HonorDecision>, HonorError> {
    Ok(evaluate_year_detailed(ctx, grades, tree, criteria, opts)?.honor)
}

/// Honor for one grading period. `prior` holds the outcomes of the earlier
/// periods of the same school year; any graded prior period without an honor
/// closes the consistency-required tiers.
pub fn evaluate_period(
    ctx: &StudentContext<'_>,
    period_code: &str,
    grades: &[GradeRow],
    tree: &PeriodTree,
    criteria: &[HonorCriterion],
    prior: &[PeriodOutcome],
    opts: &EvalOptions,
) -> Result<PeriodOutcome, HonorError> {
    validate_inputs(ctx, grades, tree, criteria)?;
    if !tree.knows(period_code) {
        return Err(HonorError::UnknownPeriod(period_code.to_string()));
    }

    let Some(scored) = score(grades, tree, Some(period_code), opts) else {
        return Ok(PeriodOutcome {
            period_code: period_code.to_string(),
            gpa: None,
            honor: None,
            checks: Vec::new(),
        });
    };

    let consistent = prior.iter().filter(|o| o.graded()).all(|o| o.qualified());
    let (honor, checks) = decide(criteria, &scored, ctx, opts, consistent);
    Ok(PeriodOutcome {
        period_code: period_code.to_string(),
        gpa: Some(scored.gpa),
        honor,
        checks,
    })
}

/// Every honor period of the level, in order, each seeing the ones before it.
pub fn evaluate_periods(
    ctx: &StudentContext<'_>,
    grades: &[GradeRow],
    tree: &PeriodTree,
    criteria: &[HonorCriterion],
    opts: &EvalOptions,
) -> Result<Vec<PeriodOutcome>, HonorError> {
    let codes = tree.honor_periods(ctx.level.honor_granularity(), &seen_periods(grades));
    let mut outcomes: Vec<PeriodOutcome> = Vec::with_capacity(codes.len());
    for code in &codes {
        let outcome = evaluate_period(ctx, code, grades, tree, criteria, &outcomes, opts)?;
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

/// Evaluates one period with the prior outcomes derived from the same grades.
/// A period that is not an honor period of the level is evaluated on its own.
pub fn evaluate_period_in_year(
    ctx: &StudentContext<'_>,
    period_code: &str,
    grades: &[GradeRow],
    tree: &PeriodTree,
    criteria: &[HonorCriterion],
    opts: &EvalOptions,
) -> Result<PeriodOutcome, HonorError> {
    let codes = tree.honor_periods(ctx.level.honor_granularity(), &seen_periods(grades));
    let before = codes.iter().position(|c| c == period_code).unwrap_or(0);
    let mut prior: Vec<PeriodOutcome> = Vec::with_capacity(before);
    for code in &codes[..before] {
        let outcome = evaluate_period(ctx, code, grades, tree, criteria, &prior, opts)?;
        prior.push(outcome);
    }
    evaluate_period(ctx, period_code, grades, tree, criteria, &prior, opts)
}
