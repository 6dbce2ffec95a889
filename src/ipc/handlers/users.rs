use crate::auth::{self, Access, Role};
use crate::ipc::error::{conflict_or_db, AppError};
use crate::ipc::helpers::{authorize, db_conn, new_id, now_rfc3339, required_str, respond};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::{json, Value};

fn users_signup(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let p = &req.params;
    let first_name = required_str(p, "firstName")?;
    let last_name = required_str(p, "lastName")?;
    let email = required_str(p, "email")?.to_ascii_lowercase();
    let password = p
        .get("password")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::missing("password"))?;
    if !auth::is_valid_email(&email) {
        return Err(AppError::BadParams("invalid email format".to_string()));
    }

    let role = state.auth.signup_role(&email);
    let password_digest = auth::hash_password(&state.auth, password)?;
    let user_id = new_id();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO users(id, first_name, last_name, email, password_digest, role, active, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &user_id,
            &first_name,
            &last_name,
            &email,
            &password_digest,
            role.as_str(),
            &now,
            &now,
        ),
    )
    .map_err(|e| conflict_or_db(e, "email"))?;

    tracing::info!(user_id = %user_id, role = role.as_str(), "user signed up");
    Ok(json!({ "message": "User created successfully", "userId": user_id }))
}

fn users_signin(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let email = required_str(&req.params, "email")?.to_ascii_lowercase();
    let password = req
        .params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::missing("password"))?;

    let row: Option<(String, String, String, bool)> = conn
        .query_row(
            "SELECT id, password_digest, role, active FROM users WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get::<_, i64>(3)? != 0)),
        )
        .optional()?;
    let invalid = || AppError::Unauthorized("invalid email or password".to_string());
    let Some((user_id, digest, role, active)) = row else {
        return Err(invalid());
    };
    if !active || !auth::verify_password(password, &digest) {
        return Err(invalid());
    }

    let role = Role::parse(&role)?;
    let token = auth::issue_token(&state.auth, &user_id, &email, role)?;
    Ok(json!({ "token": token, "role": role.as_str() }))
}

fn users_profile(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let ctx = authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    conn.query_row(
        "SELECT id, first_name, last_name, email, role, active, created_at
         FROM users WHERE id = ?",
        [&ctx.subject_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "firstName": r.get::<_, String>(1)?,
                "lastName": r.get::<_, String>(2)?,
                "email": r.get::<_, String>(3)?,
                "role": r.get::<_, String>(4)?,
                "active": r.get::<_, i64>(5)? != 0,
                "createdAt": r.get::<_, String>(6)?,
            }))
        },
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("user"))
}

fn users_set_role(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let ctx = authorize(state, req, Access::Admin)?;
    let conn = db_conn(state)?;
    let user_id = required_str(&req.params, "userId")?;
    let role = Role::parse(&required_str(&req.params, "role")?)?;
    let changed = conn.execute(
        "UPDATE users SET role = ?, updated_at = ? WHERE id = ?",
        (role.as_str(), now_rfc3339(), &user_id),
    )?;
    if changed == 0 {
        return Err(AppError::not_found("user"));
    }
    tracing::info!(actor = %ctx.subject_id, user_id = %user_id, role = role.as_str(), "role changed");
    Ok(json!({ "userId": user_id, "role": role.as_str() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "users.signup" => users_signup(state, req),
        "users.signin" => users_signin(state, req),
        "users.profile" => users_profile(state, req),
        "users.setRole" => users_set_role(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
