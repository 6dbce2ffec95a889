use crate::model::CHANNELS;
use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "obetrack.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    create_schema(&conn)?;
    Ok(conn)
}

/// Column list `po1 REAL NOT NULL DEFAULT 0, ...` for the CO-PO tables.
fn channel_columns(suffix: &str) -> String {
    CHANNELS
        .iter()
        .map(|c| format!("{}{} REAL NOT NULL DEFAULT 0", c, suffix))
        .collect::<Vec<_>>()
        .join(",\n            ")
}

pub fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_digest TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'user',
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            roll_no TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            father_name TEXT NOT NULL,
            branch TEXT NOT NULL,
            current_year INTEGER NOT NULL,
            current_semester INTEGER NOT NULL,
            section TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class
         ON students(branch, current_year, current_semester, section)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            branch TEXT NOT NULL,
            year INTEGER NOT NULL,
            semester INTEGER NOT NULL,
            regulation TEXT NOT NULL,
            course_code TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_branch ON subjects(branch, year, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            exam_type TEXT NOT NULL,
            marks REAL NOT NULL,
            max_marks REAL,
            regulation TEXT,
            year INTEGER,
            semester INTEGER,
            section TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(student_id, subject_id, exam_type)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_subject ON marks(subject_id, exam_type)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student ON marks(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS internal_marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            exam_type TEXT NOT NULL,
            q1a REAL NOT NULL DEFAULT 0,
            q1b REAL NOT NULL DEFAULT 0,
            q1c REAL NOT NULL DEFAULT 0,
            q2a REAL NOT NULL DEFAULT 0,
            q2b REAL NOT NULL DEFAULT 0,
            q3a REAL NOT NULL DEFAULT 0,
            q3b REAL NOT NULL DEFAULT 0,
            q4a REAL NOT NULL DEFAULT 0,
            q4b REAL NOT NULL DEFAULT 0,
            year INTEGER NOT NULL,
            semester INTEGER NOT NULL,
            section TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(student_id, subject_id, exam_type)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_internal_marks_subject ON internal_marks(subject_id, exam_type)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_outcomes(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            co_no TEXT NOT NULL,
            course_outcome TEXT NOT NULL,
            knowledge_level TEXT NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(subject_id, co_no)
        )",
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS copo_entries(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            course_outcome_id TEXT NOT NULL,
            {},
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(course_outcome_id) REFERENCES course_outcomes(id),
            UNIQUE(subject_id, course_outcome_id)
        )",
            channel_columns("")
        ),
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_copo_entries_subject ON copo_entries(subject_id)",
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS copo_averages(
            subject_id TEXT PRIMARY KEY,
            entry_count INTEGER NOT NULL,
            {},
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
            channel_columns("_avg")
        ),
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attainments(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            exam_type TEXT NOT NULL,
            attainment_type TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(subject_id, exam_type)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attainment_levels(
            attainment_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            co_no TEXT NOT NULL,
            attainment_level REAL,
            PRIMARY KEY(attainment_id, position),
            FOREIGN KEY(attainment_id) REFERENCES attainments(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feedback_attainments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            co1 INTEGER NOT NULL,
            co2 INTEGER NOT NULL,
            co3 INTEGER NOT NULL,
            co4 INTEGER NOT NULL,
            co5 INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(student_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feedback_subject ON feedback_attainments(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            total_classes INTEGER NOT NULL,
            classes_attended INTEGER NOT NULL,
            period TEXT NOT NULL,
            month INTEGER NOT NULL,
            year INTEGER NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(student_id, subject_id, period, month, year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_period ON attendance(year, month, period)",
        [],
    )?;

    ensure_pso_columns(conn)?;

    Ok(())
}

/// Workspaces created before the PSO channels existed lack these columns.
fn ensure_pso_columns(conn: &Connection) -> anyhow::Result<()> {
    for (table, suffix) in [("copo_entries", ""), ("copo_averages", "_avg")] {
        for channel in ["pso1", "pso2"] {
            let column = format!("{}{}", channel, suffix);
            if table_has_column(conn, table, &column)? {
                continue;
            }
            conn.execute(
                &format!(
                    "ALTER TABLE {} ADD COLUMN {} REAL NOT NULL DEFAULT 0",
                    table, column
                ),
                [],
            )?;
        }
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .expect("prepare");
        stmt.query_map([], |r| r.get::<_, String>(0))
            .expect("query")
            .collect::<Result<Vec<_>, _>>()
            .expect("rows")
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().expect("db");
        create_schema(&conn).expect("first");
        create_schema(&conn).expect("second");
        let names = table_names(&conn);
        for t in [
            "attainment_levels",
            "attainments",
            "attendance",
            "copo_averages",
            "copo_entries",
            "course_outcomes",
            "feedback_attainments",
            "internal_marks",
            "marks",
            "students",
            "subjects",
            "users",
        ] {
            assert!(names.iter().any(|n| n == t), "missing table {}", t);
        }
    }

    #[test]
    fn copo_tables_carry_all_fourteen_channels() {
        let conn = Connection::open_in_memory().expect("db");
        create_schema(&conn).expect("schema");
        let cols: Vec<String> = conn
            .prepare("PRAGMA table_info(copo_averages)")
            .expect("prepare")
            .query_map([], |r| r.get::<_, String>(1))
            .expect("query")
            .collect::<Result<Vec<_>, _>>()
            .expect("rows");
        assert!(cols.iter().any(|c| c == "pso2_avg"));
        assert_eq!(cols.iter().filter(|c| c.ends_with("_avg")).count(), 14);
    }

    #[test]
    fn older_copo_tables_gain_pso_columns() {
        let conn = Connection::open_in_memory().expect("db");
        conn.execute(
            "CREATE TABLE copo_entries(
                id TEXT PRIMARY KEY,
                subject_id TEXT NOT NULL,
                course_outcome_id TEXT NOT NULL,
                po1 REAL NOT NULL DEFAULT 0
            )",
            [],
        )
        .expect("legacy table");
        conn.execute(
            "INSERT INTO copo_entries(id, subject_id, course_outcome_id, po1) VALUES('e1', 's1', 'c1', 2)",
            [],
        )
        .expect("legacy row");

        create_schema(&conn).expect("schema upgrade");
        let (pso1, pso2): (f64, f64) = conn
            .query_row(
                "SELECT pso1, pso2 FROM copo_entries WHERE id = 'e1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("upgraded row");
        assert_eq!((pso1, pso2), (0.0, 0.0));
        assert!(table_has_column(&conn, "copo_averages", "pso2_avg").expect("pragma"));
    }
}
