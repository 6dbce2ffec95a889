use crate::auth::Access;
use crate::calc;
use crate::ipc::error::{conflict_or_db, AppError};
use crate::ipc::handlers::attendance::{attendance_json, ATTENDANCE_COLUMNS};
use crate::ipc::helpers::{
    authorize, db_conn, new_id, now_rfc3339, optional_i64, optional_str, placeholders,
    required_i64, required_str, respond, student_id_by_roll_no,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Period, PTM_EXAM_TYPES, SEE_VERIFICATION_EXAM_TYPES};
use chrono::NaiveDate;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};

const STUDENT_COLUMNS: &str =
    "id, roll_no, name, father_name, branch, current_year, current_semester, section, created_at";

const REPORT_DATE_FORMAT: &str = "%d/%m/%Y";

fn student_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "rollNo": r.get::<_, String>(1)?,
        "name": r.get::<_, String>(2)?,
        "fatherName": r.get::<_, String>(3)?,
        "branch": r.get::<_, String>(4)?,
        "currentYear": r.get::<_, i64>(5)?,
        "currentSemester": r.get::<_, i64>(6)?,
        "section": r.get::<_, String>(7)?,
        "createdAt": r.get::<_, String>(8)?,
    }))
}

fn load_by_roll_no(conn: &Connection, roll_no: &str) -> Result<Value, AppError> {
    conn.query_row(
        &format!("SELECT {} FROM students WHERE roll_no = ?", STUDENT_COLUMNS),
        [roll_no],
        student_json,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("student"))
}

fn students_create(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let p = &req.params;
    let roll_no = required_str(p, "rollNo")?;
    let name = required_str(p, "name")?;
    let father_name = required_str(p, "fatherName")?;
    let branch = required_str(p, "branch")?;
    let current_year = required_i64(p, "currentYear")?;
    let current_semester = required_i64(p, "currentSemester")?;
    let section = required_str(p, "section")?;

    conn.execute(
        "INSERT INTO students(id, roll_no, name, father_name, branch, current_year, current_semester, section, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            new_id(),
            &roll_no,
            &name,
            &father_name,
            &branch,
            current_year,
            current_semester,
            &section,
            now_rfc3339(),
        ),
    )
    .map_err(|e| conflict_or_db(e, "student with this rollNo"))?;
    load_by_roll_no(conn, &roll_no)
}

fn students_list(state: &AppState, _req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM students ORDER BY roll_no",
        STUDENT_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], student_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!(rows))
}

fn students_get(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let roll_no = required_str(&req.params, "rollNo")?;
    load_by_roll_no(conn, &roll_no)
}

fn students_update(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let roll_no = required_str(&req.params, "rollNo")?;
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(AppError::missing("patch"));
    };
    if patch.contains_key("rollNo") {
        return Err(AppError::BadParams("rollNo cannot be changed".to_string()));
    }
    let patch = Value::Object(patch.clone());

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<SqlValue> = Vec::new();
    for (key, column) in [
        ("name", "name = ?"),
        ("fatherName", "father_name = ?"),
        ("branch", "branch = ?"),
        ("section", "section = ?"),
    ] {
        if let Some(v) = optional_str(&patch, key)? {
            set_parts.push(column);
            bind_values.push(SqlValue::Text(v));
        }
    }
    for (key, column) in [
        ("currentYear", "current_year = ?"),
        ("currentSemester", "current_semester = ?"),
    ] {
        if let Some(v) = optional_i64(&patch, key)? {
            set_parts.push(column);
            bind_values.push(SqlValue::Integer(v));
        }
    }
    if set_parts.is_empty() {
        return Err(AppError::BadParams(
            "patch must include at least one field".to_string(),
        ));
    }

    let sql = format!(
        "UPDATE students SET {} WHERE roll_no = ?",
        set_parts.join(", ")
    );
    bind_values.push(SqlValue::Text(roll_no.clone()));
    let changed = conn.execute(&sql, params_from_iter(bind_values))?;
    if changed == 0 {
        return Err(AppError::not_found("student"));
    }
    load_by_roll_no(conn, &roll_no)
}

fn students_delete(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let ctx = authorize(state, req, Access::Admin)?;
    let conn = db_conn(state)?;
    let roll_no = required_str(&req.params, "rollNo")?;
    let student_id = student_id_by_roll_no(conn, &roll_no)?;

    let tx = conn.unchecked_transaction()?;
    for table in ["feedback_attainments", "attendance", "internal_marks", "marks"] {
        tx.execute(
            &format!("DELETE FROM {} WHERE student_id = ?", table),
            [&student_id],
        )?;
    }
    tx.execute("DELETE FROM students WHERE id = ?", [&student_id])?;
    tx.commit()?;

    tracing::info!(actor = %ctx.subject_id, role = ctx.role.as_str(), roll_no = %roll_no, "student deleted");
    Ok(json!({ "deleted": roll_no }))
}

/// Students of a class with their attendance rows attached. The attendance
/// rows can be narrowed to one subject and one period.
fn students_filtered(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let p = &req.params;

    let mut where_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<SqlValue> = Vec::new();
    if let Some(branch) = optional_str(p, "branch")? {
        where_parts.push("branch = ?");
        bind_values.push(SqlValue::Text(branch));
    }
    if let Some(year) = optional_i64(p, "year")? {
        where_parts.push("current_year = ?");
        bind_values.push(SqlValue::Integer(year));
    }
    if let Some(semester) = optional_i64(p, "semester")? {
        where_parts.push("current_semester = ?");
        bind_values.push(SqlValue::Integer(semester));
    }
    if let Some(section) = optional_str(p, "section")? {
        where_parts.push("section = ?");
        bind_values.push(SqlValue::Text(section));
    }
    let where_sql = if where_parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", where_parts.join(" AND "))
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM students{} ORDER BY roll_no",
        STUDENT_COLUMNS, where_sql
    ))?;
    let students = stmt
        .query_map(params_from_iter(bind_values.iter()), student_json)?
        .collect::<Result<Vec<_>, _>>()?;

    // Attendance is read for the selected students only.
    let student_scope = format!("a.student_id IN (SELECT id FROM students{})", where_sql);
    let mut att_parts: Vec<&str> = vec![student_scope.as_str()];
    let mut att_values: Vec<SqlValue> = bind_values;
    if let Some(subject_id) = optional_str(p, "subjectId")? {
        att_parts.push("a.subject_id = ?");
        att_values.push(SqlValue::Text(subject_id));
    }
    if let Some(period) = optional_str(p, "period")? {
        att_parts.push("a.period = ?");
        att_values.push(SqlValue::Text(Period::parse(&period)?.as_str().to_string()));
    }
    let att_where = format!(" WHERE {}", att_parts.join(" AND "));
    let mut att_stmt = conn.prepare(&format!(
        "SELECT {} FROM attendance a JOIN subjects s ON s.id = a.subject_id{} ORDER BY a.rowid",
        ATTENDANCE_COLUMNS, att_where
    ))?;
    let mut by_student: HashMap<String, Vec<Value>> = HashMap::new();
    let rows = att_stmt.query_map(params_from_iter(att_values), attendance_json)?;
    for row in rows {
        let row = row?;
        let sid = row
            .get("studentId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        by_student.entry(sid).or_default().push(row);
    }

    let out: Vec<Value> = students
        .into_iter()
        .map(|mut s| {
            let sid = s.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let attendance = by_student.remove(&sid).unwrap_or_default();
            if let Some(obj) = s.as_object_mut() {
                obj.insert("attendance".to_string(), json!(attendance));
            }
            s
        })
        .collect();
    Ok(json!(out))
}

struct StudentMark {
    subject_id: String,
    subject_name: String,
    exam_type: String,
    marks: f64,
    max_marks: Option<f64>,
}

fn student_marks_for(
    conn: &Connection,
    student_id: &str,
    exam_types: &[&str],
) -> Result<Vec<StudentMark>, AppError> {
    let sql = format!(
        "SELECT m.subject_id, s.name, m.exam_type, m.marks, m.max_marks
         FROM marks m JOIN subjects s ON s.id = m.subject_id
         WHERE m.student_id = ? AND m.exam_type IN ({})
         ORDER BY m.rowid",
        placeholders(exam_types.len())
    );
    let mut bind_values = vec![SqlValue::Text(student_id.to_string())];
    bind_values.extend(exam_types.iter().map(|t| SqlValue::Text(t.to_string())));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind_values), |r| {
            Ok(StudentMark {
                subject_id: r.get(0)?,
                subject_name: r.get(1)?,
                exam_type: r.get(2)?,
                marks: r.get(3)?,
                max_marks: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn parse_report_date(params: &Value, key: &str) -> Result<NaiveDate, AppError> {
    let raw = required_str(params, key)?;
    NaiveDate::parse_from_str(&raw, REPORT_DATE_FORMAT).map_err(|_| {
        AppError::BadParams(format!("{} must be a date in DD/MM/YYYY format", key))
    })
}

fn students_data(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let p = &req.params;
    let roll_no = required_str(p, "rollNo")?;
    let start = parse_report_date(p, "startDate")?;
    let end = parse_report_date(p, "endDate")?;
    if start > end {
        return Err(AppError::BadParams(
            "startDate cannot be after endDate".to_string(),
        ));
    }

    let (student_id, name, year, semester, section): (String, String, i64, i64, String) = conn
        .query_row(
            "SELECT id, name, current_year, current_semester, section FROM students WHERE roll_no = ?",
            [&roll_no],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?
        .ok_or_else(|| AppError::not_found("student"))?;

    let wanted: HashSet<(String, i64, i64)> = calc::attendance_periods(start, end)
        .into_iter()
        .map(|ap| {
            (
                ap.period.as_str().to_string(),
                i64::from(ap.month),
                i64::from(ap.year),
            )
        })
        .collect();

    let mut stmt = conn.prepare(
        "SELECT a.subject_id, s.name, a.period, a.total_classes, a.classes_attended, a.month, a.year
         FROM attendance a JOIN subjects s ON s.id = a.subject_id
         WHERE a.student_id = ?
         ORDER BY a.year, a.month, a.period, s.name",
    )?;
    let attendance = stmt
        .query_map([&student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, i64>(5)?,
                r.get::<_, i64>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|(_, _, period, _, _, month, year)| {
            wanted.contains(&(period.clone(), *month, *year))
        })
        .map(
            |(subject_id, subject_name, period, total, attended, month, year)| {
                json!({
                    "subjectId": subject_id,
                    "subjectName": subject_name,
                    "period": period,
                    "totalClasses": total,
                    "classesAttended": attended,
                    "month": month,
                    "year": year,
                })
            },
        )
        .collect::<Vec<_>>();

    let marks: Vec<Value> = student_marks_for(conn, &student_id, &PTM_EXAM_TYPES)?
        .into_iter()
        .map(|m| {
            json!({
                "subjectId": m.subject_id,
                "subjectName": m.subject_name,
                "examType": m.exam_type,
                "marks": m.marks,
                "maxMarks": m.max_marks,
            })
        })
        .collect();

    Ok(json!({
        "studentId": student_id,
        "studentName": name,
        "rollNo": roll_no,
        "year": year,
        "semester": semester,
        "section": section,
        "marks": marks,
        "attendance": attendance,
    }))
}

/// Marks grouped as `{subjectName: {examType: {...}}}` with the student's
/// class header. `with_max` adds `maxMarks` to each cell.
fn mark_sheet(
    conn: &Connection,
    roll_no: &str,
    exam_types: &[&str],
    with_max: bool,
) -> Result<Value, AppError> {
    let (student_id, name, year, semester, section): (String, String, i64, i64, String) = conn
        .query_row(
            "SELECT id, name, current_year, current_semester, section FROM students WHERE roll_no = ?",
            [roll_no],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?
        .ok_or_else(|| AppError::not_found("student"))?;

    let marks = student_marks_for(conn, &student_id, exam_types)?;
    if marks.is_empty() {
        return Err(AppError::NotFound(
            "no marks found for the requested exams".to_string(),
        ));
    }

    let mut grouped: Map<String, Value> = Map::new();
    for m in marks {
        let cell = if with_max {
            json!({ "marks": m.marks, "maxMarks": m.max_marks })
        } else {
            json!({ "marks": m.marks })
        };
        if let Some(subject) = grouped
            .entry(m.subject_name)
            .or_insert_with(|| json!({}))
            .as_object_mut()
        {
            subject.insert(m.exam_type, cell);
        }
    }

    Ok(json!({
        "student": name,
        "rollNo": roll_no,
        "year": year,
        "semester": semester,
        "section": section,
        "marks": grouped,
    }))
}

fn students_marks(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let roll_no = required_str(&req.params, "rollNo")?;
    mark_sheet(conn, &roll_no, &PTM_EXAM_TYPES, true)
}

fn students_all_marks(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let roll_no = required_str(&req.params, "rollNo")?;
    mark_sheet(conn, &roll_no, &SEE_VERIFICATION_EXAM_TYPES, false)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "students.create" => students_create(state, req),
        "students.list" => students_list(state, req),
        "students.get" => students_get(state, req),
        "students.update" => students_update(state, req),
        "students.delete" => students_delete(state, req),
        "students.filtered" => students_filtered(state, req),
        "students.data" => students_data(state, req),
        "students.marks" => students_marks(state, req),
        "students.allMarks" => students_all_marks(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
