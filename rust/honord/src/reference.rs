use crate::honor::{AcademicLevel, HonorCriterion, HonorScope};
use crate::periods::GradingPeriod;
use rusqlite::Connection;
use uuid::Uuid;

pub struct HonorTypeDef {
    pub key: &'static str,
    pub name: &'static str,
    pub scope: HonorScope,
}

pub static HONOR_TYPES: [HonorTypeDef; 7] = [
    HonorTypeDef {
        key: "with_honors",
        name: "With Honors",
        scope: HonorScope::Basic,
    },
    HonorTypeDef {
        key: "with_high_honors",
        name: "With High Honors",
        scope: HonorScope::Basic,
    },
    HonorTypeDef {
        key: "with_highest_honors",
        name: "With Highest Honors",
        scope: HonorScope::Basic,
    },
    HonorTypeDef {
        key: "deans_list",
        name: "Dean's List",
        scope: HonorScope::College,
    },
    HonorTypeDef {
        key: "cum_laude",
        name: "Cum Laude",
        scope: HonorScope::College,
    },
    HonorTypeDef {
        key: "magna_cum_laude",
        name: "Magna Cum Laude",
        scope: HonorScope::College,
    },
    HonorTypeDef {
        key: "summa_cum_laude",
        name: "Summa Cum Laude",
        scope: HonorScope::College,
    },
];

pub fn honor_type(key: &str) -> Option<&'static HonorTypeDef> {
    HONOR_TYPES.iter().find(|t| t.key == key)
}

const BASIC_FLOOR: f64 = 85.0;

fn period(
    code: &str,
    name: &str,
    parent: Option<&str>,
    sort_order: i64,
    weight: f64,
    is_calculated: bool,
) -> GradingPeriod {
    GradingPeriod {
        code: code.to_string(),
        name: name.to_string(),
        parent_code: parent.map(|s| s.to_string()),
        sort_order,
        weight,
        is_calculated,
    }
}

pub fn default_periods(level: AcademicLevel) -> Vec<GradingPeriod> {
    match level {
        AcademicLevel::Elementary | AcademicLevel::JuniorHighschool => vec![
            period("Q1", "First Quarter", None, 1, 1.0, false),
            period("Q2", "Second Quarter", None, 2, 1.0, false),
            period("Q3", "Third Quarter", None, 3, 1.0, false),
            period("Q4", "Fourth Quarter", None, 4, 1.0, false),
        ],
        AcademicLevel::SeniorHighschool => vec![
            period("S1", "First Semester", None, 1, 1.0, true),
            period("Q1", "First Quarter", Some("S1"), 1, 1.0, false),
            period("Q2", "Second Quarter", Some("S1"), 2, 1.0, false),
            period("S2", "Second Semester", None, 2, 1.0, true),
            period("Q3", "Third Quarter", Some("S2"), 1, 1.0, false),
            period("Q4", "Fourth Quarter", Some("S2"), 2, 1.0, false),
        ],
        AcademicLevel::College => {
            let mut out = Vec::new();
            for (i, (sem, sem_name)) in [("S1", "First Semester"), ("S2", "Second Semester")]
                .into_iter()
                .enumerate()
            {
                out.push(period(sem, sem_name, None, i as i64 + 1, 1.0, true));
                for (j, (suffix, name, weight)) in [
                    ("MIDTERM", "Midterm", 0.3),
                    ("PREFINAL", "Prefinal", 0.3),
                    ("FINAL", "Final", 0.4),
                ]
                .into_iter()
                .enumerate()
                {
                    out.push(period(
                        &format!("{}_{}", sem, suffix),
                        &format!("{} {}", sem_name, name),
                        Some(sem),
                        j as i64 + 1,
                        weight,
                        false,
                    ));
                }
            }
            out
        }
    }
}

fn criterion(key: &str, min_gpa: f64, max_gpa: Option<f64>) -> HonorCriterion {
    HonorCriterion {
        honor_type: key.to_string(),
        honor_name: honor_type(key).map(|t| t.name).unwrap_or(key).to_string(),
        min_gpa,
        max_gpa,
        min_grade: None,
        min_grade_all: Some(BASIC_FLOOR),
        min_year: None,
        max_year: None,
        require_consistent_honor: false,
        priority: 0,
    }
}

pub fn default_criteria(level: AcademicLevel) -> Vec<HonorCriterion> {
    match level {
        AcademicLevel::College => {
            let latin = |key: &str, min: f64, max: f64| HonorCriterion {
                min_year: Some(4),
                max_year: Some(5),
                priority: 10,
                ..criterion(key, min, Some(max))
            };
            vec![
                HonorCriterion {
                    require_consistent_honor: true,
                    ..criterion("deans_list", 90.0, None)
                },
                latin("cum_laude", 90.0, 93.99),
                latin("magna_cum_laude", 94.0, 96.99),
                latin("summa_cum_laude", 97.0, 100.0),
            ]
        }
        _ => {
            let consistent = level == AcademicLevel::SeniorHighschool;
            [
                ("with_honors", 90.0, 94.99),
                ("with_high_honors", 95.0, 97.99),
                ("with_highest_honors", 98.0, 100.0),
            ]
            .into_iter()
            .map(|(key, min, max)| HonorCriterion {
                require_consistent_honor: consistent,
                ..criterion(key, min, Some(max))
            })
            .collect()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub periods_added: usize,
    pub criteria_added: usize,
}

/// Upserts the static reference rows keyed by their natural keys. Names of
/// levels and honor types are refreshed; periods and criteria that already
/// exist are left as the user configured them.
pub fn seed_reference_data(conn: &Connection) -> anyhow::Result<SeedSummary> {
    let tx = conn.unchecked_transaction()?;
    let mut summary = SeedSummary::default();

    for (i, level) in AcademicLevel::ALL.into_iter().enumerate() {
        tx.execute(
            "INSERT INTO academic_levels(key, name, sort_order) VALUES(?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET name = excluded.name, sort_order = excluded.sort_order",
            (level.key(), level.name(), i as i64),
        )?;
    }

    for t in &HONOR_TYPES {
        tx.execute(
            "INSERT INTO honor_types(key, name, scope) VALUES(?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET name = excluded.name, scope = excluded.scope",
            (t.key, t.name, t.scope.key()),
        )?;
    }

    for level in AcademicLevel::ALL {
        for p in default_periods(level) {
            summary.periods_added += tx.execute(
                "INSERT INTO grading_periods(
                    id, academic_level_key, code, name, parent_code, sort_order, weight, is_calculated
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(academic_level_key, code) DO NOTHING",
                (
                    Uuid::new_v4().to_string(),
                    level.key(),
                    &p.code,
                    &p.name,
                    &p.parent_code,
                    p.sort_order,
                    p.weight,
                    p.is_calculated as i64,
                ),
            )?;
        }
        for c in default_criteria(level) {
            summary.criteria_added += tx.execute(
                "INSERT INTO honor_criteria(
                    id, academic_level_key, honor_type_key, min_gpa, max_gpa, min_grade,
                    min_grade_all, min_year, max_year, require_consistent_honor, priority
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(academic_level_key, honor_type_key) DO NOTHING",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    level.key(),
                    &c.honor_type,
                    c.min_gpa,
                    c.max_gpa,
                    c.min_grade,
                    c.min_grade_all,
                    c.min_year,
                    c.max_year,
                    c.require_consistent_honor as i64,
                    c.priority,
                ],
            )?;
        }
    }

    tx.commit()?;
    if summary.periods_added > 0 || summary.criteria_added > 0 {
        tracing::info!(
            periods = summary.periods_added,
            criteria = summary.criteria_added,
            "seeded default reference data"
        );
    }
    Ok(summary)
}
