use crate::auth::Access;
use crate::calc::{self, BestOfTwoRow, ScoredMark, StudentRef};
use crate::ipc::error::AppError;
use crate::ipc::handlers::internal_marks::question_totals_for;
use crate::ipc::helpers::{
    authorize, db_conn, new_id, optional_f64, optional_i64, optional_str, placeholders,
    required_f64, required_i64, required_str, require_student, require_subject, respond,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{best_of_two_exam_types, InternalExamType};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const MARK_COLUMNS: &str = "m.id, m.student_id, st.roll_no, st.name, m.subject_id, m.exam_type, \
     m.marks, m.max_marks, m.regulation, m.year, m.semester, m.section";

fn mark_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "rollNo": r.get::<_, String>(2)?,
        "name": r.get::<_, String>(3)?,
        "subjectId": r.get::<_, String>(4)?,
        "examType": r.get::<_, String>(5)?,
        "marks": r.get::<_, f64>(6)?,
        "maxMarks": r.get::<_, Option<f64>>(7)?,
        "regulation": r.get::<_, Option<String>>(8)?,
        "year": r.get::<_, Option<i64>>(9)?,
        "semester": r.get::<_, Option<i64>>(10)?,
        "section": r.get::<_, Option<String>>(11)?,
    }))
}

fn load_one(conn: &Connection, id: &str) -> Result<Value, AppError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM marks m JOIN students st ON st.id = m.student_id WHERE m.id = ?",
            MARK_COLUMNS
        ),
        [id],
        mark_json,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("marks entry"))
}

fn validate_score(marks: f64, max_marks: Option<f64>) -> Result<(), AppError> {
    if marks < 0.0 {
        return Err(AppError::BadParams("marks must not be negative".to_string()));
    }
    if let Some(max) = max_marks {
        if max < 0.0 {
            return Err(AppError::BadParams(
                "maxMarks must not be negative".to_string(),
            ));
        }
        if marks > max {
            return Err(AppError::BadParams(
                "marks cannot exceed maxMarks".to_string(),
            ));
        }
    }
    Ok(())
}

/// Inserts or overwrites the mark for (student, subject, examType).
fn marks_upsert(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let p = &req.params;
    let student_id = required_str(p, "studentId")?;
    let subject_id = required_str(p, "subjectId")?;
    let exam_type = required_str(p, "examType")?;
    let marks = required_f64(p, "marks")?;
    let max_marks = optional_f64(p, "maxMarks")?;
    let regulation = optional_str(p, "regulation")?;
    let year = optional_i64(p, "year")?;
    let semester = optional_i64(p, "semester")?;
    let section = optional_str(p, "section")?;
    validate_score(marks, max_marks)?;

    require_student(conn, &student_id)?;
    require_subject(conn, &subject_id)?;

    conn.execute(
        "INSERT INTO marks(id, student_id, subject_id, exam_type, marks, max_marks, regulation, year, semester, section)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, exam_type) DO UPDATE SET
           marks = excluded.marks,
           max_marks = excluded.max_marks,
           regulation = excluded.regulation,
           year = excluded.year,
           semester = excluded.semester,
           section = excluded.section",
        (
            new_id(),
            &student_id,
            &subject_id,
            &exam_type,
            marks,
            max_marks,
            &regulation,
            year,
            semester,
            &section,
        ),
    )?;

    let id: String = conn.query_row(
        "SELECT id FROM marks WHERE student_id = ? AND subject_id = ? AND exam_type = ?",
        (&student_id, &subject_id, &exam_type),
        |r| r.get(0),
    )?;
    let entry = load_one(conn, &id)?;
    Ok(json!({ "message": "Marks saved successfully", "marksEntry": entry }))
}

fn marks_list(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let exam_type = required_str(&req.params, "examType")?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM marks m JOIN students st ON st.id = m.student_id
         WHERE m.subject_id = ? AND m.exam_type = ?
         ORDER BY m.rowid",
        MARK_COLUMNS
    ))?;
    let rows = stmt
        .query_map((&subject_id, &exam_type), mark_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!(rows))
}

fn marks_by_class(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let p = &req.params;
    let year = required_i64(p, "year")?;
    let semester = required_i64(p, "semester")?;
    let section = required_str(p, "section")?;
    let exam_type = required_str(p, "examType")?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM marks m JOIN students st ON st.id = m.student_id
         WHERE m.year = ? AND m.semester = ? AND m.section = ? AND m.exam_type = ?
         ORDER BY m.rowid",
        MARK_COLUMNS
    ))?;
    let rows = stmt
        .query_map((year, semester, &section, &exam_type), mark_json)?
        .collect::<Result<Vec<_>, _>>()?;
    if rows.is_empty() {
        return Err(AppError::NotFound(
            "no marks found for the given filters".to_string(),
        ));
    }
    Ok(json!(rows))
}

fn marks_update(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let id = required_str(&req.params, "id")?;
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return Err(AppError::missing("patch"));
    };

    let current: Option<(f64, Option<f64>)> = conn
        .query_row(
            "SELECT marks, max_marks FROM marks WHERE id = ?",
            [&id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((cur_marks, cur_max)) = current else {
        return Err(AppError::not_found("marks entry"));
    };

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<SqlValue> = Vec::new();
    let new_marks = optional_f64(patch, "marks")?;
    let new_max = optional_f64(patch, "maxMarks")?;
    validate_score(new_marks.unwrap_or(cur_marks), new_max.or(cur_max))?;
    if let Some(v) = new_marks {
        set_parts.push("marks = ?");
        bind_values.push(SqlValue::Real(v));
    }
    if let Some(v) = new_max {
        set_parts.push("max_marks = ?");
        bind_values.push(SqlValue::Real(v));
    }
    if let Some(v) = optional_str(patch, "regulation")? {
        set_parts.push("regulation = ?");
        bind_values.push(SqlValue::Text(v));
    }
    for (key, column) in [("year", "year = ?"), ("semester", "semester = ?")] {
        if let Some(v) = optional_i64(patch, key)? {
            set_parts.push(column);
            bind_values.push(SqlValue::Integer(v));
        }
    }
    if let Some(v) = optional_str(patch, "section")? {
        set_parts.push("section = ?");
        bind_values.push(SqlValue::Text(v));
    }
    if set_parts.is_empty() {
        return Err(AppError::BadParams(
            "patch must include at least one field".to_string(),
        ));
    }

    let sql = format!("UPDATE marks SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(SqlValue::Text(id.clone()));
    conn.execute(&sql, params_from_iter(bind_values))?;
    let entry = load_one(conn, &id)?;
    Ok(json!({ "message": "Marks updated successfully", "marksEntry": entry }))
}

/// Best-of-two averages of a subject, students in order of their first mark.
pub(crate) fn best_of_two_for(
    conn: &Connection,
    subject_id: &str,
) -> Result<Vec<BestOfTwoRow>, AppError> {
    let exam_types = best_of_two_exam_types();
    let sql = format!(
        "SELECT m.student_id, st.roll_no, st.name, m.exam_type, m.marks
         FROM marks m JOIN students st ON st.id = m.student_id
         WHERE m.subject_id = ? AND m.exam_type IN ({})
         ORDER BY m.rowid",
        placeholders(exam_types.len())
    );
    let mut bind_values = vec![SqlValue::Text(subject_id.to_string())];
    bind_values.extend(exam_types.iter().map(|t| SqlValue::Text(t.to_string())));

    let mut stmt = conn.prepare(&sql)?;
    let scored = stmt
        .query_map(params_from_iter(bind_values), |r| {
            Ok(ScoredMark {
                student: StudentRef {
                    student_id: r.get(0)?,
                    roll_no: r.get(1)?,
                    name: r.get(2)?,
                },
                exam_type: r.get(3)?,
                marks: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(calc::best_of_two(&scored))
}

fn marks_best_of_two(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let rows = best_of_two_for(conn, &subject_id)?;
    Ok(json!(rows))
}

fn marks_attainment_view(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let exam_type = InternalExamType::parse(&required_str(&req.params, "examType")?)?;

    let best = best_of_two_for(conn, &subject_id)?;
    let totals = question_totals_for(conn, &subject_id, exam_type)?;
    let rows = calc::attainment_view(best, totals);
    tracing::debug!(subject_id = %subject_id, rows = rows.len(), "attainment view");
    Ok(json!(rows))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "marks.upsert" => marks_upsert(state, req),
        "marks.list" => marks_list(state, req),
        "marks.byClass" => marks_by_class(state, req),
        "marks.update" => marks_update(state, req),
        "marks.bestOfTwo" => marks_best_of_two(state, req),
        "marks.attainmentView" => marks_attainment_view(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
