use crate::auth::Access;
use crate::ipc::error::AppError;
use crate::ipc::helpers::{
    authorize, db_conn, new_id, optional_i64, optional_str, required_i64, required_str, respond,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const SUBJECT_COLUMNS: &str = "id, name, branch, year, semester, regulation, course_code";

/// Tables holding rows that reference a subject, children before parents.
const SUBJECT_DEPENDENTS: [&str; 8] = [
    "marks",
    "internal_marks",
    "attendance",
    "feedback_attainments",
    "copo_entries",
    "copo_averages",
    "course_outcomes",
    "attainments",
];

fn subject_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "branch": r.get::<_, String>(2)?,
        "year": r.get::<_, i64>(3)?,
        "semester": r.get::<_, i64>(4)?,
        "regulation": r.get::<_, String>(5)?,
        "courseCode": r.get::<_, String>(6)?,
    }))
}

fn load_one(conn: &Connection, id: &str) -> Result<Value, AppError> {
    conn.query_row(
        &format!("SELECT {} FROM subjects WHERE id = ?", SUBJECT_COLUMNS),
        [id],
        subject_json,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("subject"))
}

fn subjects_create(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let p = &req.params;
    let name = required_str(p, "name")?;
    let branch = required_str(p, "branch")?;
    let year = required_i64(p, "year")?;
    let semester = required_i64(p, "semester")?;
    let regulation = required_str(p, "regulation")?;
    let course_code = required_str(p, "courseCode")?;

    let id = new_id();
    conn.execute(
        "INSERT INTO subjects(id, name, branch, year, semester, regulation, course_code)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&id, &name, &branch, year, semester, &regulation, &course_code),
    )?;
    load_one(conn, &id)
}

fn subjects_list(state: &AppState, _req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM subjects ORDER BY branch, year, semester, name",
        SUBJECT_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], subject_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!(rows))
}

fn subjects_get(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let id = required_str(&req.params, "id")?;
    load_one(conn, &id)
}

fn subjects_find(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let p = &req.params;
    let branch = required_str(p, "branch")?;
    let year = required_i64(p, "year")?;
    let semester = required_i64(p, "semester")?;

    let mut sql = format!(
        "SELECT {} FROM subjects WHERE branch = ? AND year = ? AND semester = ?",
        SUBJECT_COLUMNS
    );
    let mut bind_values = vec![
        SqlValue::Text(branch),
        SqlValue::Integer(year),
        SqlValue::Integer(semester),
    ];
    if let Some(regulation) = optional_str(p, "regulation")? {
        sql.push_str(" AND regulation = ?");
        bind_values.push(SqlValue::Text(regulation));
    }
    sql.push_str(" ORDER BY name");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind_values), subject_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!(rows))
}

fn subjects_update(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::Admin)?;
    let conn = db_conn(state)?;
    let id = required_str(&req.params, "id")?;
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return Err(AppError::missing("patch"));
    };

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<SqlValue> = Vec::new();
    for (key, column) in [
        ("name", "name = ?"),
        ("branch", "branch = ?"),
        ("regulation", "regulation = ?"),
        ("courseCode", "course_code = ?"),
    ] {
        if let Some(v) = optional_str(patch, key)? {
            set_parts.push(column);
            bind_values.push(SqlValue::Text(v));
        }
    }
    for (key, column) in [("year", "year = ?"), ("semester", "semester = ?")] {
        if let Some(v) = optional_i64(patch, key)? {
            set_parts.push(column);
            bind_values.push(SqlValue::Integer(v));
        }
    }
    if set_parts.is_empty() {
        return Err(AppError::BadParams(
            "patch must include at least one field".to_string(),
        ));
    }

    let sql = format!("UPDATE subjects SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(SqlValue::Text(id.clone()));
    if conn.execute(&sql, params_from_iter(bind_values))? == 0 {
        return Err(AppError::not_found("subject"));
    }
    load_one(conn, &id)
}

fn subjects_delete(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let ctx = authorize(state, req, Access::Admin)?;
    let conn = db_conn(state)?;
    let id = required_str(&req.params, "id")?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM attainment_levels
         WHERE attainment_id IN (SELECT id FROM attainments WHERE subject_id = ?)",
        [&id],
    )?;
    for table in SUBJECT_DEPENDENTS {
        tx.execute(
            &format!("DELETE FROM {} WHERE subject_id = ?", table),
            [&id],
        )?;
    }
    let removed = tx.execute("DELETE FROM subjects WHERE id = ?", [&id])?;
    if removed == 0 {
        // tx rolls back on drop
        return Err(AppError::not_found("subject"));
    }
    tx.commit()?;

    tracing::info!(actor = %ctx.subject_id, subject_id = %id, "subject deleted");
    Ok(json!({ "deleted": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "subjects.create" => subjects_create(state, req),
        "subjects.list" => subjects_list(state, req),
        "subjects.get" => subjects_get(state, req),
        "subjects.find" => subjects_find(state, req),
        "subjects.update" => subjects_update(state, req),
        "subjects.delete" => subjects_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
