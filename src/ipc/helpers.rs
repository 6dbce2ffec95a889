use crate::auth::{self, Access, RequestContext};
use crate::ipc::error::{ok, AppError};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

pub fn db_conn(state: &AppState) -> Result<&Connection, AppError> {
    state.db.as_ref().ok_or(AppError::NoWorkspace)
}

pub fn authorize(
    state: &AppState,
    req: &Request,
    access: Access,
) -> Result<RequestContext, AppError> {
    auth::authorize(&state.auth, req.auth.as_deref(), access)
}

/// Wraps an operation result in the response envelope.
pub fn respond(req: &Request, result: Result<Value, AppError>) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => {
            if e.status() >= 500 {
                tracing::error!(method = %req.method, error = %e, "request failed");
            } else {
                tracing::debug!(method = %req.method, code = e.code(), error = %e, "request rejected");
            }
            e.response(&req.id)
        }
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn required_str(params: &Value, key: &str) -> Result<String, AppError> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| AppError::missing(key))?;
    if s.is_empty() {
        return Err(AppError::BadParams(format!("{} must not be empty", key)));
    }
    Ok(s)
}

pub fn optional_str(params: &Value, key: &str) -> Result<Option<String>, AppError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            if t.is_empty() {
                Err(AppError::BadParams(format!("{} must not be empty", key)))
            } else {
                Ok(Some(t.to_string()))
            }
        }
        Some(_) => Err(AppError::BadParams(format!("{} must be a string", key))),
    }
}

/// Integers may arrive as numbers or as digit strings (path-style params).
pub fn optional_i64(params: &Value, key: &str) -> Result<Option<i64>, AppError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| AppError::BadParams(format!("{} must be an integer", key))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| AppError::BadParams(format!("{} must be an integer", key))),
        Some(_) => Err(AppError::BadParams(format!("{} must be an integer", key))),
    }
}

pub fn required_i64(params: &Value, key: &str) -> Result<i64, AppError> {
    optional_i64(params, key)?.ok_or_else(|| AppError::missing(key))
}

pub fn optional_f64(params: &Value, key: &str) -> Result<Option<f64>, AppError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| AppError::BadParams(format!("{} must be a number", key))),
    }
}

pub fn required_f64(params: &Value, key: &str) -> Result<f64, AppError> {
    optional_f64(params, key)?.ok_or_else(|| AppError::missing(key))
}

/// `?, ?, ?` for an `IN (...)` list of `n` values.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, AppError> {
    Ok(conn
        .query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub fn require_student(conn: &Connection, student_id: &str) -> Result<(), AppError> {
    if exists(conn, "SELECT 1 FROM students WHERE id = ?", student_id)? {
        Ok(())
    } else {
        Err(AppError::not_found("student"))
    }
}

pub fn require_subject(conn: &Connection, subject_id: &str) -> Result<(), AppError> {
    if exists(conn, "SELECT 1 FROM subjects WHERE id = ?", subject_id)? {
        Ok(())
    } else {
        Err(AppError::not_found("subject"))
    }
}

pub fn student_id_by_roll_no(conn: &Connection, roll_no: &str) -> Result<String, AppError> {
    conn.query_row(
        "SELECT id FROM students WHERE roll_no = ?",
        [roll_no],
        |r| r.get::<_, String>(0),
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("student"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_params_are_trimmed_and_required() {
        let p = json!({ "name": "  Ada ", "blank": "  ", "n": 3 });
        assert_eq!(required_str(&p, "name").expect("name"), "Ada");
        assert_eq!(required_str(&p, "blank").expect_err("blank").code(), "bad_params");
        assert_eq!(required_str(&p, "other").expect_err("missing").to_string(), "missing other");
        assert!(optional_str(&p, "n").is_err());
        assert_eq!(optional_str(&p, "other").expect("absent"), None);
    }

    #[test]
    fn integers_accept_digit_strings() {
        let p = json!({ "year": "3", "sem": 5, "bad": "x", "frac": 1.5 });
        assert_eq!(required_i64(&p, "year").expect("year"), 3);
        assert_eq!(required_i64(&p, "sem").expect("sem"), 5);
        assert!(required_i64(&p, "bad").is_err());
        assert!(required_i64(&p, "frac").is_err());
    }
}
