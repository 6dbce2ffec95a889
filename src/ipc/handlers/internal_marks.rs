use crate::auth::Access;
use crate::calc::{self, QuestionTotalsRow, StudentRef};
use crate::ipc::error::{conflict_or_db, AppError};
use crate::ipc::helpers::{
    authorize, db_conn, new_id, required_i64, required_str, require_student, require_subject,
    respond,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{InternalExamType, InternalMarkSheet};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const SHEET_COLUMNS: &str = "im.q1a, im.q1b, im.q1c, im.q2a, im.q2b, im.q3a, im.q3b, im.q4a, im.q4b";

fn sheet_from_row(r: &Row<'_>, first: usize) -> rusqlite::Result<InternalMarkSheet> {
    let mut parts = [0.0; 9];
    for (i, slot) in parts.iter_mut().enumerate() {
        *slot = r.get(first + i)?;
    }
    Ok(InternalMarkSheet::from_parts(parts))
}

fn select_sql(filter: &str) -> String {
    format!(
        "SELECT im.id, im.student_id, st.roll_no, st.name, im.subject_id, sb.name, im.exam_type,
                im.year, im.semester, im.section, {}
         FROM internal_marks im
         JOIN students st ON st.id = im.student_id
         JOIN subjects sb ON sb.id = im.subject_id
         {}
         ORDER BY im.rowid",
        SHEET_COLUMNS, filter
    )
}

fn internal_mark_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    let sheet = sheet_from_row(r, 10)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "rollNo": r.get::<_, String>(2)?,
        "name": r.get::<_, String>(3)?,
        "subjectId": r.get::<_, String>(4)?,
        "subjectName": r.get::<_, String>(5)?,
        "examType": r.get::<_, String>(6)?,
        "year": r.get::<_, i64>(7)?,
        "semester": r.get::<_, i64>(8)?,
        "section": r.get::<_, String>(9)?,
        "marks": sheet,
    }))
}

fn load_one(conn: &Connection, id: &str) -> Result<Value, AppError> {
    conn.query_row(&select_sql("WHERE im.id = ?"), [id], internal_mark_json)
        .optional()?
        .ok_or_else(|| AppError::not_found("internal marks entry"))
}

/// Per-question totals of every CIE sheet for (subject, examType).
pub(crate) fn question_totals_for(
    conn: &Connection,
    subject_id: &str,
    exam_type: InternalExamType,
) -> Result<Vec<QuestionTotalsRow>, AppError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT im.student_id, st.roll_no, st.name, {}
         FROM internal_marks im JOIN students st ON st.id = im.student_id
         WHERE im.subject_id = ? AND im.exam_type = ?
         ORDER BY im.rowid",
        SHEET_COLUMNS
    ))?;
    let sheets = stmt
        .query_map((subject_id, exam_type.as_str()), |r| {
            Ok((
                StudentRef {
                    student_id: r.get(0)?,
                    roll_no: r.get(1)?,
                    name: r.get(2)?,
                },
                sheet_from_row(r, 3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(calc::question_totals_rows(&sheets))
}

fn internal_marks_create(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let p = &req.params;
    let student_id = required_str(p, "studentId")?;
    let subject_id = required_str(p, "subjectId")?;
    let exam_type = InternalExamType::parse(&required_str(p, "examType")?)?;
    let sheet = InternalMarkSheet::from_params(p.get("marks"))?;
    let year = required_i64(p, "year")?;
    let semester = required_i64(p, "semester")?;
    let section = required_str(p, "section")?;

    require_student(conn, &student_id)?;
    require_subject(conn, &subject_id)?;

    let id = new_id();
    let q = sheet.parts();
    conn.execute(
        "INSERT INTO internal_marks(id, student_id, subject_id, exam_type,
            q1a, q1b, q1c, q2a, q2b, q3a, q3b, q4a, q4b, year, semester, section)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &student_id,
            &subject_id,
            exam_type.as_str(),
            q[0],
            q[1],
            q[2],
            q[3],
            q[4],
            q[5],
            q[6],
            q[7],
            q[8],
            year,
            semester,
            &section,
        ),
    )
    .map_err(|e| conflict_or_db(e, "internal marks entry for this student and exam"))?;

    let data = load_one(conn, &id)?;
    Ok(json!({ "message": "Internal Marks entry created successfully", "data": data }))
}

fn internal_marks_list(state: &AppState, _req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let mut stmt = conn.prepare(&select_sql(""))?;
    let rows = stmt
        .query_map([], internal_mark_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!(rows))
}

fn internal_marks_by_subject(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let exam_type = InternalExamType::parse(&required_str(&req.params, "examType")?)?;
    let mut stmt = conn.prepare(&select_sql(
        "WHERE im.subject_id = ? AND im.exam_type = ?",
    ))?;
    let rows = stmt
        .query_map((&subject_id, exam_type.as_str()), internal_mark_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!(rows))
}

fn internal_marks_by_class(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let p = &req.params;
    let year = required_i64(p, "year")?;
    let semester = required_i64(p, "semester")?;
    let section = required_str(p, "section")?;
    let exam_type = InternalExamType::parse(&required_str(p, "examType")?)?;
    let mut stmt = conn.prepare(&select_sql(
        "WHERE im.year = ? AND im.semester = ? AND im.section = ? AND im.exam_type = ?",
    ))?;
    let rows = stmt
        .query_map(
            (year, semester, &section, exam_type.as_str()),
            internal_mark_json,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!(rows))
}

fn internal_marks_question_totals(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let exam_type = InternalExamType::parse(&required_str(&req.params, "examType")?)?;
    let rows = question_totals_for(conn, &subject_id, exam_type)?;
    Ok(json!(rows))
}

/// Replaces the whole mark sheet of an entry addressed by
/// (subject, examType, id).
fn internal_marks_update(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let p = &req.params;
    let id = required_str(p, "id")?;
    let subject_id = required_str(p, "subjectId")?;
    let exam_type = InternalExamType::parse(&required_str(p, "examType")?)?;
    if p.get("marks").map_or(true, |v| v.is_null()) {
        return Err(AppError::missing("marks"));
    }
    let q = InternalMarkSheet::from_params(p.get("marks"))?.parts();

    let changed = conn.execute(
        "UPDATE internal_marks
         SET q1a = ?, q1b = ?, q1c = ?, q2a = ?, q2b = ?, q3a = ?, q3b = ?, q4a = ?, q4b = ?
         WHERE id = ? AND subject_id = ? AND exam_type = ?",
        (
            q[0],
            q[1],
            q[2],
            q[3],
            q[4],
            q[5],
            q[6],
            q[7],
            q[8],
            &id,
            &subject_id,
            exam_type.as_str(),
        ),
    )?;
    if changed == 0 {
        return Err(AppError::not_found("internal marks entry"));
    }
    let data = load_one(conn, &id)?;
    Ok(json!({ "message": "Internal Marks updated successfully", "data": data }))
}

fn internal_marks_delete(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let p = &req.params;
    let id = required_str(p, "id")?;
    let subject_id = required_str(p, "subjectId")?;
    let exam_type = InternalExamType::parse(&required_str(p, "examType")?)?;
    let removed = conn.execute(
        "DELETE FROM internal_marks WHERE id = ? AND subject_id = ? AND exam_type = ?",
        (&id, &subject_id, exam_type.as_str()),
    )?;
    if removed == 0 {
        return Err(AppError::not_found("internal marks entry"));
    }
    Ok(json!({ "message": "Internal Marks deleted successfully" }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "internalMarks.create" => internal_marks_create(state, req),
        "internalMarks.list" => internal_marks_list(state, req),
        "internalMarks.bySubject" => internal_marks_by_subject(state, req),
        "internalMarks.byClass" => internal_marks_by_class(state, req),
        "internalMarks.questionTotals" => internal_marks_question_totals(state, req),
        "internalMarks.update" => internal_marks_update(state, req),
        "internalMarks.delete" => internal_marks_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
