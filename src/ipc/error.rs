use serde_json::json;
use thiserror::Error;

/// Failure of a single request. Every variant maps to a wire `code` and the
/// HTTP status class a REST façade would answer with.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadParams(String),

    #[error("no matching coNo found in attainmentData, nothing was updated")]
    NothingUpdated { skipped: Vec<String> },

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("select a workspace first")]
    NoWorkspace,

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn not_found(what: &str) -> Self {
        AppError::NotFound(format!("{} not found", what))
    }

    pub fn missing(key: &str) -> Self {
        AppError::BadParams(format!("missing {}", key))
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadParams(_) => "bad_params",
            AppError::NothingUpdated { .. } => "nothing_updated",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::NoWorkspace => "no_workspace",
            AppError::Db(_) => "db_error",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            AppError::BadParams(_) | AppError::NothingUpdated { .. } | AppError::NoWorkspace => 400,
            AppError::Unauthorized(_) => 401,
            AppError::Forbidden(_) => 403,
            AppError::NotFound(_) => 404,
            AppError::Conflict(_) => 409,
            AppError::Db(_) | AppError::Internal(_) => 500,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::NothingUpdated { skipped } => Some(json!({ "updated": 0, "skipped": skipped })),
            _ => None,
        }
    }

    pub fn response(&self, id: &str) -> serde_json::Value {
        err(id, self.code(), self.status(), self.to_string(), self.details())
    }
}

/// Maps UNIQUE violations to `Conflict`, anything else to `Db`.
pub fn conflict_or_db(e: rusqlite::Error, what: &str) -> AppError {
    if let rusqlite::Error::SqliteFailure(inner, _) = &e {
        if inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        {
            return AppError::Conflict(format!("{} already exists", what));
        }
    }
    AppError::Db(e)
}

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    status: u16,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
        "status": status,
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}
