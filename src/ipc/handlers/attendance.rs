use crate::auth::Access;
use crate::ipc::error::{conflict_or_db, AppError};
use crate::ipc::helpers::{
    authorize, db_conn, new_id, optional_i64, optional_str, required_i64, required_str, require_student,
    require_subject, respond, student_id_by_roll_no,
};
use crate::ipc::types::{AppState, Request};
use crate::model::Period;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

pub(crate) const ATTENDANCE_COLUMNS: &str =
    "a.id, a.student_id, a.subject_id, s.name, a.total_classes, a.classes_attended, a.period, a.month, a.year";

/// Row shape produced by selecting [`ATTENDANCE_COLUMNS`] from
/// `attendance a JOIN subjects s`.
pub(crate) fn attendance_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "subjectId": r.get::<_, String>(2)?,
        "subjectName": r.get::<_, String>(3)?,
        "totalClasses": r.get::<_, i64>(4)?,
        "classesAttended": r.get::<_, i64>(5)?,
        "period": r.get::<_, String>(6)?,
        "month": r.get::<_, i64>(7)?,
        "year": r.get::<_, i64>(8)?,
    }))
}

fn validate_counts(total: i64, attended: i64) -> Result<(), AppError> {
    if total < 0 || attended < 0 {
        return Err(AppError::BadParams(
            "class counts must not be negative".to_string(),
        ));
    }
    if attended > total {
        return Err(AppError::BadParams(
            "classesAttended cannot exceed totalClasses".to_string(),
        ));
    }
    Ok(())
}

fn validate_month(month: i64) -> Result<(), AppError> {
    if (1..=12).contains(&month) {
        Ok(())
    } else {
        Err(AppError::BadParams(
            "month must be between 1 and 12".to_string(),
        ))
    }
}

fn load_one(conn: &Connection, id: &str) -> Result<Value, AppError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM attendance a JOIN subjects s ON s.id = a.subject_id WHERE a.id = ?",
            ATTENDANCE_COLUMNS
        ),
        [id],
        attendance_json,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("attendance record"))
}

fn attendance_create(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let p = &req.params;
    let student_id = required_str(p, "studentId")?;
    let subject_id = required_str(p, "subjectId")?;
    let total = required_i64(p, "totalClasses")?;
    let attended = required_i64(p, "classesAttended")?;
    let period = Period::parse(&required_str(p, "period")?)?;
    let month = required_i64(p, "month")?;
    let year = required_i64(p, "year")?;
    validate_counts(total, attended)?;
    validate_month(month)?;

    require_student(conn, &student_id)?;
    require_subject(conn, &subject_id)?;

    let id = new_id();
    conn.execute(
        "INSERT INTO attendance(id, student_id, subject_id, total_classes, classes_attended, period, month, year)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &student_id,
            &subject_id,
            total,
            attended,
            period.as_str(),
            month,
            year,
        ),
    )
    .map_err(|e| conflict_or_db(e, "attendance record for this period"))?;
    load_one(conn, &id)
}

fn attendance_by_student(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let roll_no = required_str(&req.params, "rollNo")?;
    let student_id = student_id_by_roll_no(conn, &roll_no)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM attendance a JOIN subjects s ON s.id = a.subject_id
         WHERE a.student_id = ?
         ORDER BY a.year, a.month, a.period, s.name",
        ATTENDANCE_COLUMNS
    ))?;
    let rows = stmt
        .query_map([&student_id], attendance_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!(rows))
}

fn attendance_by_period(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let p = &req.params;
    let month = required_i64(p, "month")?;
    let year = required_i64(p, "year")?;
    let period = Period::parse(&required_str(p, "period")?)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM attendance a JOIN subjects s ON s.id = a.subject_id
         WHERE a.month = ? AND a.year = ? AND a.period = ?
         ORDER BY a.rowid",
        ATTENDANCE_COLUMNS
    ))?;
    let rows = stmt
        .query_map((month, year, period.as_str()), attendance_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!(rows))
}

fn attendance_update(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let id = required_str(&req.params, "id")?;
    let Some(p) = req.params.get("patch").filter(|v| v.is_object()) else {
        return Err(AppError::missing("patch"));
    };

    let existing: Option<(i64, i64, String, i64, i64)> = conn
        .query_row(
            "SELECT total_classes, classes_attended, period, month, year FROM attendance WHERE id = ?",
            [&id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;
    let Some((total, attended, period, month, year)) = existing else {
        return Err(AppError::not_found("attendance record"));
    };

    let total = optional_i64(p, "totalClasses")?.unwrap_or(total);
    let attended = optional_i64(p, "classesAttended")?.unwrap_or(attended);
    let period = match optional_str(p, "period")? {
        Some(raw) => Period::parse(&raw)?.as_str().to_string(),
        None => period,
    };
    let month = optional_i64(p, "month")?.unwrap_or(month);
    let year = optional_i64(p, "year")?.unwrap_or(year);
    validate_counts(total, attended)?;
    validate_month(month)?;

    conn.execute(
        "UPDATE attendance
         SET total_classes = ?, classes_attended = ?, period = ?, month = ?, year = ?
         WHERE id = ?",
        (total, attended, &period, month, year, &id),
    )
    .map_err(|e| conflict_or_db(e, "attendance record for this period"))?;
    load_one(conn, &id)
}

fn attendance_delete(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let id = required_str(&req.params, "id")?;
    let removed = conn.execute("DELETE FROM attendance WHERE id = ?", [&id])?;
    if removed == 0 {
        return Err(AppError::not_found("attendance record"));
    }
    Ok(json!({ "deleted": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "attendance.create" => attendance_create(state, req),
        "attendance.byStudent" => attendance_by_student(state, req),
        "attendance.byPeriod" => attendance_by_period(state, req),
        "attendance.update" => attendance_update(state, req),
        "attendance.delete" => attendance_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
