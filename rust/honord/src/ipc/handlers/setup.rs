use crate::db;
use crate::honor::{EvalOptions, MinGradeScope};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, NaiveDate};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Honors,
    SchoolYear,
}

impl SetupSection {
    const ALL: [SetupSection; 2] = [SetupSection::Honors, SetupSection::SchoolYear];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "honors" => Some(Self::Honors),
            "schoolYear" => Some(Self::SchoolYear),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Honors => "honors",
            Self::SchoolYear => "schoolYear",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Honors => "setup.honors",
            Self::SchoolYear => "setup.schoolYear",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Honors => json!({
            "minGradeScope": MinGradeScope::default().key(),
            "gpaDecimals": 2,
            "persistResults": true
        }),
        SetupSection::SchoolYear => json!({
            "startMonth": 6
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Honors => match k.as_str() {
                "minGradeScope" => {
                    let scope = v
                        .as_str()
                        .and_then(MinGradeScope::parse)
                        .ok_or("minGradeScope must be one of: subjectAverage, rawGrade")?;
                    obj.insert(k.clone(), Value::String(scope.key().to_string()));
                }
                "gpaDecimals" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 4)?));
                }
                "persistResults" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown honors field: {}", k)),
            },
            SetupSection::SchoolYear => match k.as_str() {
                "startMonth" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 12)?));
                }
                _ => return Err(format!("unknown schoolYear field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // A malformed stored field keeps its default; the other fields still load.
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                if let Err(e) = merge_section_patch(section, &mut current, &one) {
                    tracing::warn!(section = section.name(), field = %k, error = %e, "ignoring stored setup value");
                }
            }
        }
    }
    Ok(current)
}

#[derive(Debug, Clone, Copy)]
pub struct HonorSettings {
    pub opts: EvalOptions,
    pub persist_results: bool,
}

pub fn load_honor_settings(conn: &rusqlite::Connection) -> anyhow::Result<HonorSettings> {
    let v = load_section(conn, SetupSection::Honors)?;
    let min_grade_scope = v
        .get("minGradeScope")
        .and_then(|s| s.as_str())
        .and_then(MinGradeScope::parse)
        .unwrap_or_default();
    let gpa_decimals = v
        .get("gpaDecimals")
        .and_then(|n| n.as_u64())
        .map(|n| n as u32)
        .unwrap_or(2);
    let persist_results = v
        .get("persistResults")
        .and_then(|b| b.as_bool())
        .unwrap_or(true);
    Ok(HonorSettings {
        opts: EvalOptions {
            min_grade_scope,
            gpa_decimals,
        },
        persist_results,
    })
}

pub fn school_year_containing(day: NaiveDate, start_month: u32) -> String {
    let y = day.year();
    if day.month() >= start_month {
        format!("{}-{}", y, y + 1)
    } else {
        format!("{}-{}", y - 1, y)
    }
}

/// School year that contains today, per the configured start month.
pub fn current_school_year(conn: &rusqlite::Connection) -> String {
    let start_month = load_section(conn, SetupSection::SchoolYear)
        .ok()
        .and_then(|v| v.get("startMonth").and_then(|m| m.as_u64()))
        .map(|m| m as u32)
        .unwrap_or(6);
    school_year_containing(chrono::Local::now().date_naive(), start_month)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut out = Map::new();
    for section in SetupSection::ALL {
        match load_section(conn, section) {
            Ok(v) => {
                out.insert(section.name().to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = section.name(), "setup updated");
    ok(
        &req.id,
        json!({ "ok": true, "section": section.name(), "values": current }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn school_year_rolls_over_at_start_month() {
        let may = NaiveDate::from_ymd_opt(2025, 5, 31).expect("date");
        let june = NaiveDate::from_ymd_opt(2025, 6, 1).expect("date");
        assert_eq!(school_year_containing(may, 6), "2024-2025");
        assert_eq!(school_year_containing(june, 6), "2025-2026");
        assert_eq!(school_year_containing(may, 1), "2025-2026");
    }

    #[test]
    fn stored_bad_field_does_not_discard_the_rest() {
        let workspace = std::env::temp_dir().join(format!(
            "honord-setup-stored-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let conn = db::open_db(&workspace).expect("open db");
        db::settings_set_json(
            &conn,
            SetupSection::Honors.key(),
            &json!({ "gpaDecimals": 9, "minGradeScope": "rawGrade", "persistResults": false }),
        )
        .expect("store settings");

        let settings = load_honor_settings(&conn).expect("load settings");
        assert_eq!(settings.opts.gpa_decimals, 2);
        assert_eq!(settings.opts.min_grade_scope, MinGradeScope::RawGrade);
        assert!(!settings.persist_results);
    }

    #[test]
    fn honors_patch_rejects_unknown_scope() {
        let mut current = default_section(SetupSection::Honors);
        let patch = json!({ "minGradeScope": "everything" });
        let res = merge_section_patch(
            SetupSection::Honors,
            &mut current,
            patch.as_object().expect("object"),
        );
        assert!(res.is_err());

        let patch = json!({ "minGradeScope": "rawGrade", "gpaDecimals": 1 });
        merge_section_patch(
            SetupSection::Honors,
            &mut current,
            patch.as_object().expect("object"),
        )
        .expect("valid patch");
        assert_eq!(current["minGradeScope"], "rawGrade");
        assert_eq!(current["gpaDecimals"], 1);
    }
}
