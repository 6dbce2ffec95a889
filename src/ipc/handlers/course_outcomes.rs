use crate::auth::Access;
use crate::ipc::error::{conflict_or_db, AppError};
use crate::ipc::handlers::copo::{insert_entry, load_entry};
use crate::ipc::helpers::{
    authorize, db_conn, new_id, optional_str, required_str, require_subject, respond,
};
use crate::ipc::types::{AppState, Request};
use crate::model::PoChannels;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const CO_COLUMNS: &str = "id, subject_id, co_no, course_outcome, knowledge_level";

fn course_outcome_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "subjectId": r.get::<_, String>(1)?,
        "coNo": r.get::<_, String>(2)?,
        "courseOutcome": r.get::<_, String>(3)?,
        "knowledgeLevel": r.get::<_, String>(4)?,
    }))
}

fn load_one(conn: &Connection, id: &str) -> Result<Value, AppError> {
    conn.query_row(
        &format!("SELECT {} FROM course_outcomes WHERE id = ?", CO_COLUMNS),
        [id],
        course_outcome_json,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("course outcome"))
}

/// Creates the CO together with its all-zero CO-PO row.
fn course_outcomes_create(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let p = &req.params;
    let subject_id = required_str(p, "subjectId")?;
    let co_no = required_str(p, "coNo")?;
    let course_outcome = required_str(p, "courseOutcome")?;
    let knowledge_level = required_str(p, "knowledgeLevel")?;
    require_subject(conn, &subject_id)?;

    let id = new_id();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO course_outcomes(id, subject_id, co_no, course_outcome, knowledge_level)
         VALUES(?, ?, ?, ?, ?)",
        (&id, &subject_id, &co_no, &course_outcome, &knowledge_level),
    )
    .map_err(|e| conflict_or_db(e, &format!("course outcome {}", co_no)))?;
    let copo_id = insert_entry(&tx, &subject_id, &id, &PoChannels::default())?;
    tx.commit()?;

    Ok(json!({
        "courseOutcome": load_one(conn, &id)?,
        "coPoMatrix": load_entry(conn, &copo_id)?,
    }))
}

fn course_outcomes_list(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM course_outcomes WHERE subject_id = ? ORDER BY rowid",
        CO_COLUMNS
    ))?;
    let rows = stmt
        .query_map([&subject_id], course_outcome_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!(rows))
}

fn course_outcomes_update(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let id = required_str(&req.params, "id")?;
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return Err(AppError::missing("patch"));
    };

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<SqlValue> = Vec::new();
    for (key, column) in [
        ("coNo", "co_no = ?"),
        ("courseOutcome", "course_outcome = ?"),
        ("knowledgeLevel", "knowledge_level = ?"),
    ] {
        if let Some(v) = optional_str(patch, key)? {
            set_parts.push(column);
            bind_values.push(SqlValue::Text(v));
        }
    }
    if set_parts.is_empty() {
        return Err(AppError::BadParams(
            "patch must include at least one field".to_string(),
        ));
    }

    let sql = format!(
        "UPDATE course_outcomes SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    bind_values.push(SqlValue::Text(id.clone()));
    let changed = conn
        .execute(&sql, params_from_iter(bind_values))
        .map_err(|e| conflict_or_db(e, "course outcome with this coNo"))?;
    if changed == 0 {
        return Err(AppError::not_found("course outcome"));
    }
    Ok(json!({
        "updatedCourseOutcome": load_one(conn, &id)?,
        "message": "Course Outcome updated successfully",
    }))
}

fn course_outcomes_delete(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let id = required_str(&req.params, "id")?;

    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM copo_entries WHERE course_outcome_id = ?", [&id])?;
    if tx.execute("DELETE FROM course_outcomes WHERE id = ?", [&id])? == 0 {
        return Err(AppError::not_found("course outcome"));
    }
    tx.commit()?;
    Ok(json!({
        "message": "Course Outcome and related CO-PO Matrix entries deleted successfully"
    }))
}

fn course_outcomes_delete_by_subject(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let ctx = authorize(state, req, Access::Admin)?;
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;

    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM copo_entries WHERE subject_id = ?", [&subject_id])?;
    let removed = tx.execute(
        "DELETE FROM course_outcomes WHERE subject_id = ?",
        [&subject_id],
    )?;
    if removed == 0 {
        return Err(AppError::NotFound(
            "no course outcomes found for subject".to_string(),
        ));
    }
    tx.commit()?;

    tracing::info!(actor = %ctx.subject_id, subject_id = %subject_id, removed, "course outcomes deleted");
    Ok(json!({ "subjectId": subject_id, "deleted": removed }))
}

fn course_outcomes_delete_all(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let ctx = authorize(state, req, Access::Admin)?;
    let conn = db_conn(state)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM copo_entries", [])?;
    let removed = tx.execute("DELETE FROM course_outcomes", [])?;
    tx.commit()?;

    tracing::warn!(actor = %ctx.subject_id, removed, "all course outcomes deleted");
    Ok(json!({ "deleted": removed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "courseOutcomes.create" => course_outcomes_create(state, req),
        "courseOutcomes.list" => course_outcomes_list(state, req),
        "courseOutcomes.update" => course_outcomes_update(state, req),
        "courseOutcomes.delete" => course_outcomes_delete(state, req),
        "courseOutcomes.deleteBySubject" => course_outcomes_delete_by_subject(state, req),
        "courseOutcomes.deleteAll" => course_outcomes_delete_all(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
