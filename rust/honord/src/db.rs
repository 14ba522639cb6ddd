use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "honors.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_levels(
            key TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS honor_types(
            key TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            scope TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grading_periods(
            id TEXT PRIMARY KEY,
            academic_level_key TEXT NOT NULL,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            parent_code TEXT,
            sort_order INTEGER NOT NULL,
            weight REAL NOT NULL DEFAULT 1,
            is_calculated INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(academic_level_key) REFERENCES academic_levels(key),
            UNIQUE(academic_level_key, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grading_periods_level ON grading_periods(academic_level_key)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            academic_level_key TEXT NOT NULL,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            units REAL NOT NULL DEFAULT 1,
            strand TEXT,
            FOREIGN KEY(academic_level_key) REFERENCES academic_levels(key),
            UNIQUE(academic_level_key, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_level ON subjects(academic_level_key)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            student_no TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            academic_level_key TEXT NOT NULL,
            year_of_study INTEGER,
            section TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            FOREIGN KEY(academic_level_key) REFERENCES academic_levels(key)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_level ON students(academic_level_key)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            academic_level_key TEXT NOT NULL,
            grading_period_code TEXT NOT NULL,
            school_year TEXT NOT NULL,
            grade REAL NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(academic_level_key) REFERENCES academic_levels(key),
            UNIQUE(student_id, subject_id, academic_level_key, grading_period_code, school_year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_grades_scope
         ON student_grades(student_id, academic_level_key, school_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS honor_criteria(
            id TEXT PRIMARY KEY,
            academic_level_key TEXT NOT NULL,
            honor_type_key TEXT NOT NULL,
            min_gpa REAL NOT NULL,
            max_gpa REAL,
            min_grade REAL,
            min_grade_all REAL,
            min_year INTEGER,
            max_year INTEGER,
            require_consistent_honor INTEGER NOT NULL DEFAULT 0,
            priority INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(academic_level_key) REFERENCES academic_levels(key),
            FOREIGN KEY(honor_type_key) REFERENCES honor_types(key),
            UNIQUE(academic_level_key, honor_type_key)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS honor_results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            honor_type_key TEXT NOT NULL,
            academic_level_key TEXT NOT NULL,
            school_year TEXT NOT NULL,
            period_code TEXT NOT NULL DEFAULT '',
            gpa REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            reviewed_by TEXT,
            reviewed_at TEXT,
            review_note TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(honor_type_key) REFERENCES honor_types(key),
            FOREIGN KEY(academic_level_key) REFERENCES academic_levels(key),
            UNIQUE(student_id, academic_level_key, school_year, period_code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_honor_results_scope
         ON honor_results(academic_level_key, school_year)",
        [],
    )?;

    crate::reference::seed_reference_data(&conn)?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
