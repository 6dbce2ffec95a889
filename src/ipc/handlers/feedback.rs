use crate::auth::Access;
use crate::ipc::error::{conflict_or_db, AppError};
use crate::ipc::helpers::{
    authorize, db_conn, new_id, now_rfc3339, required_str, require_student, require_subject,
    respond,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{parse_feedback_level, FEEDBACK_CHANNELS};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

fn select_sql(filter: &str) -> String {
    format!(
        "SELECT f.id, f.student_id, st.name, st.roll_no, f.subject_id, sb.name,
                f.co1, f.co2, f.co3, f.co4, f.co5, f.created_at, f.updated_at
         FROM feedback_attainments f
         JOIN students st ON st.id = f.student_id
         JOIN subjects sb ON sb.id = f.subject_id
         {}
         ORDER BY f.rowid",
        filter
    )
}

fn feedback_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    let mut out = serde_json::Map::new();
    out.insert("id".into(), json!(r.get::<_, String>(0)?));
    out.insert("studentId".into(), json!(r.get::<_, String>(1)?));
    out.insert("studentName".into(), json!(r.get::<_, String>(2)?));
    out.insert("rollNo".into(), json!(r.get::<_, String>(3)?));
    out.insert("subjectId".into(), json!(r.get::<_, String>(4)?));
    out.insert("subjectName".into(), json!(r.get::<_, String>(5)?));
    for (i, key) in FEEDBACK_CHANNELS.iter().enumerate() {
        out.insert((*key).to_string(), json!(r.get::<_, i64>(6 + i)?));
    }
    out.insert("createdAt".into(), json!(r.get::<_, String>(11)?));
    out.insert("updatedAt".into(), json!(r.get::<_, String>(12)?));
    Ok(Value::Object(out))
}

fn load_one(conn: &Connection, id: &str) -> Result<Value, AppError> {
    conn.query_row(&select_sql("WHERE f.id = ?"), [id], feedback_json)
        .optional()?
        .ok_or_else(|| AppError::not_found("feedback attainment"))
}

fn feedback_create(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let p = &req.params;
    let student_id = required_str(p, "studentId")?;
    let subject_id = required_str(p, "subjectId")?;
    let mut levels = [0i64; 5];
    for (slot, key) in levels.iter_mut().zip(FEEDBACK_CHANNELS) {
        *slot = parse_feedback_level(p, key)?.ok_or_else(|| AppError::missing(key))?;
    }
    require_student(conn, &student_id)?;
    require_subject(conn, &subject_id)?;

    let id = new_id();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO feedback_attainments(id, student_id, subject_id, co1, co2, co3, co4, co5, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &student_id,
            &subject_id,
            levels[0],
            levels[1],
            levels[2],
            levels[3],
            levels[4],
            &now,
            &now,
        ),
    )
    .map_err(|e| conflict_or_db(e, "feedback for this student and subject"))?;
    load_one(conn, &id)
}

fn feedback_list(state: &AppState, _req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let mut stmt = conn.prepare(&select_sql(""))?;
    let rows = stmt
        .query_map([], feedback_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!(rows))
}

fn feedback_get(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let id = required_str(&req.params, "id")?;
    load_one(conn, &id)
}

fn feedback_by_subject(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let mut stmt = conn.prepare(&select_sql("WHERE f.subject_id = ?"))?;
    let rows = stmt
        .query_map([&subject_id], feedback_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!(rows))
}

fn feedback_update(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let id = required_str(&req.params, "id")?;
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return Err(AppError::missing("patch"));
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<SqlValue> = Vec::new();
    for key in FEEDBACK_CHANNELS {
        if let Some(level) = parse_feedback_level(patch, key)? {
            set_parts.push(format!("{} = ?", key.to_ascii_lowercase()));
            bind_values.push(SqlValue::Integer(level));
        }
    }
    if set_parts.is_empty() {
        return Err(AppError::BadParams(
            "patch must include at least one of CO1..CO5".to_string(),
        ));
    }
    set_parts.push("updated_at = ?".to_string());
    bind_values.push(SqlValue::Text(now_rfc3339()));

    let sql = format!(
        "UPDATE feedback_attainments SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    bind_values.push(SqlValue::Text(id.clone()));
    if conn.execute(&sql, params_from_iter(bind_values))? == 0 {
        return Err(AppError::not_found("feedback attainment"));
    }
    load_one(conn, &id)
}

fn feedback_delete(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let id = required_str(&req.params, "id")?;
    if conn.execute("DELETE FROM feedback_attainments WHERE id = ?", [&id])? == 0 {
        return Err(AppError::not_found("feedback attainment"));
    }
    Ok(json!({ "message": "Feedback attainment deleted successfully" }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "feedback.create" => feedback_create(state, req),
        "feedback.list" => feedback_list(state, req),
        "feedback.get" => feedback_get(state, req),
        "feedback.bySubject" => feedback_by_subject(state, req),
        "feedback.update" => feedback_update(state, req),
        "feedback.delete" => feedback_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
