use crate::auth::Access;
use crate::calc::{self, LevelUpdate};
use crate::ipc::error::{conflict_or_db, AppError};
use crate::ipc::helpers::{
    authorize, db_conn, new_id, now_rfc3339, optional_str, required_str, require_subject,
    respond,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{parse_attainment_data, AttainmentExamType, AttainmentLevel, AttainmentType};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

struct AttainmentRecord {
    id: String,
    subject_id: String,
    subject_name: String,
    exam_type: String,
    attainment_type: String,
    created_at: String,
    updated_at: String,
    levels: Vec<AttainmentLevel>,
}

impl AttainmentRecord {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "subjectId": self.subject_id,
            "subjectName": self.subject_name,
            "examType": self.exam_type,
            "attainmentType": self.attainment_type,
            "attainmentData": self.levels,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

fn load_levels(conn: &Connection, attainment_id: &str) -> Result<Vec<AttainmentLevel>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT co_no, attainment_level FROM attainment_levels
         WHERE attainment_id = ? ORDER BY position",
    )?;
    let levels = stmt
        .query_map([attainment_id], |r| {
            Ok(AttainmentLevel {
                co_no: r.get(0)?,
                attainment_level: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(levels)
}

/// Replaces the stored level list; list order is kept in `position`.
fn write_levels(
    conn: &Connection,
    attainment_id: &str,
    levels: &[AttainmentLevel],
) -> Result<(), AppError> {
    conn.execute(
        "DELETE FROM attainment_levels WHERE attainment_id = ?",
        [attainment_id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO attainment_levels(attainment_id, position, co_no, attainment_level)
         VALUES(?, ?, ?, ?)",
    )?;
    for (position, level) in levels.iter().enumerate() {
        stmt.execute((
            attainment_id,
            position as i64,
            &level.co_no,
            level.attainment_level,
        ))?;
    }
    Ok(())
}

fn load_records(
    conn: &Connection,
    filter: &str,
    params: &[&str],
) -> Result<Vec<AttainmentRecord>, AppError> {
    let sql = format!(
        "SELECT a.id, a.subject_id, s.name, a.exam_type, a.attainment_type, a.created_at, a.updated_at
         FROM attainments a JOIN subjects s ON s.id = a.subject_id
         {}
         ORDER BY a.rowid",
        filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let heads = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), |r| {
            Ok(AttainmentRecord {
                id: r.get(0)?,
                subject_id: r.get(1)?,
                subject_name: r.get(2)?,
                exam_type: r.get(3)?,
                attainment_type: r.get(4)?,
                created_at: r.get(5)?,
                updated_at: r.get(6)?,
                levels: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(heads.len());
    for mut rec in heads {
        rec.levels = load_levels(conn, &rec.id)?;
        out.push(rec);
    }
    Ok(out)
}

fn load_by_id(conn: &Connection, id: &str) -> Result<AttainmentRecord, AppError> {
    load_records(conn, "WHERE a.id = ?", &[id])?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::not_found("attainment record"))
}

fn load_by_subject_exam(
    conn: &Connection,
    subject_id: &str,
    exam_type: AttainmentExamType,
) -> Result<AttainmentRecord, AppError> {
    load_records(
        conn,
        "WHERE a.subject_id = ? AND a.exam_type = ?",
        &[subject_id, exam_type.as_str()],
    )?
    .into_iter()
    .next()
    .ok_or_else(|| AppError::not_found("attainment record"))
}

fn attainments_create(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let p = &req.params;
    let subject_id = required_str(p, "subjectId")?;
    let exam_type = AttainmentExamType::parse(&required_str(p, "examType")?)?;
    let attainment_type = AttainmentType::parse(&required_str(p, "attainmentType")?)?;
    let levels = parse_attainment_data(p.get("attainmentData"))?;
    require_subject(conn, &subject_id)?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM attainments WHERE subject_id = ? AND exam_type = ?",
            (&subject_id, exam_type.as_str()),
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(AppError::Conflict(
            "an attainment record already exists for this subject and exam type".to_string(),
        ));
    }

    let id = new_id();
    let now = now_rfc3339();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO attainments(id, subject_id, exam_type, attainment_type, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            &subject_id,
            exam_type.as_str(),
            attainment_type.as_str(),
            &now,
            &now,
        ),
    )
    .map_err(|e| conflict_or_db(e, "attainment record for this subject and exam type"))?;
    write_levels(&tx, &id, &levels)?;
    tx.commit()?;

    Ok(load_by_id(conn, &id)?.to_json())
}

fn attainments_list(state: &AppState, _req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let rows: Vec<Value> = load_records(conn, "", &[])?
        .iter()
        .map(AttainmentRecord::to_json)
        .collect();
    Ok(json!(rows))
}

fn attainments_find(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let exam_type = AttainmentExamType::parse(&required_str(&req.params, "examType")?)?;
    Ok(load_by_subject_exam(conn, &subject_id, exam_type)?.to_json())
}

fn attainments_by_type(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let attainment_type = AttainmentType::parse(&required_str(&req.params, "attainmentType")?)?;
    let rows: Vec<Value> = load_records(
        conn,
        "WHERE a.subject_id = ? AND a.attainment_type = ?",
        &[subject_id.as_str(), attainment_type.as_str()],
    )?
    .iter()
    .map(AttainmentRecord::to_json)
    .collect();
    Ok(json!(rows))
}

/// Full replacement of type and level list; `examType` may move the record
/// to another free slot of the same subject.
fn attainments_update(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let p = &req.params;
    let id = required_str(p, "id")?;
    let current = load_by_id(conn, &id)?;

    let attainment_type = AttainmentType::parse(&required_str(p, "attainmentType")?)?;
    if p.get("attainmentData").map_or(true, |v| v.is_null()) {
        return Err(AppError::missing("attainmentData"));
    }
    let levels = parse_attainment_data(p.get("attainmentData"))?;
    let exam_type = match optional_str(p, "examType")? {
        Some(raw) => AttainmentExamType::parse(&raw)?.as_str().to_string(),
        None => current.exam_type.clone(),
    };

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE attainments SET exam_type = ?, attainment_type = ?, updated_at = ? WHERE id = ?",
        (&exam_type, attainment_type.as_str(), now_rfc3339(), &id),
    )
    .map_err(|e| conflict_or_db(e, "attainment record for this subject and exam type"))?;
    write_levels(&tx, &id, &levels)?;
    tx.commit()?;

    Ok(load_by_id(conn, &id)?.to_json())
}

/// Sets levels by CO label. Unknown labels are skipped; a batch that
/// matches nothing fails and leaves the record untouched.
fn attainments_update_levels(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let p = &req.params;
    let subject_id = required_str(p, "subjectId")?;
    let exam_type = AttainmentExamType::parse(&required_str(p, "examType")?)?;
    let updates: Vec<LevelUpdate> = match p.get("attainmentUpdates") {
        None | Some(Value::Null) => return Err(AppError::missing("attainmentUpdates")),
        Some(raw) => serde_json::from_value(raw.clone())
            .map_err(|e| AppError::BadParams(format!("invalid attainmentUpdates: {}", e)))?,
    };

    let mut record = load_by_subject_exam(conn, &subject_id, exam_type)?;
    let outcome = calc::apply_level_updates(&mut record.levels, &updates);
    for co_no in &outcome.skipped {
        tracing::warn!(subject_id = %subject_id, exam_type = exam_type.as_str(), co_no = %co_no, "coNo not found in attainmentData");
    }
    if outcome.updated == 0 {
        return Err(AppError::NothingUpdated {
            skipped: outcome.skipped,
        });
    }

    let tx = conn.unchecked_transaction()?;
    write_levels(&tx, &record.id, &record.levels)?;
    tx.execute(
        "UPDATE attainments SET updated_at = ? WHERE id = ?",
        (now_rfc3339(), &record.id),
    )?;
    tx.commit()?;

    Ok(json!({
        "message": "Attainment levels updated successfully",
        "updated": outcome.updated,
        "skipped": outcome.skipped,
    }))
}

fn attainments_delete(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let id = required_str(&req.params, "id")?;

    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM attainment_levels WHERE attainment_id = ?", [&id])?;
    if tx.execute("DELETE FROM attainments WHERE id = ?", [&id])? == 0 {
        return Err(AppError::not_found("attainment record"));
    }
    tx.commit()?;
    Ok(json!({ "message": "Attainment deleted" }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "attainments.create" => attainments_create(state, req),
        "attainments.list" => attainments_list(state, req),
        "attainments.find" => attainments_find(state, req),
        "attainments.byType" => attainments_by_type(state, req),
        "attainments.update" => attainments_update(state, req),
        "attainments.updateLevels" => attainments_update_levels(state, req),
        "attainments.delete" => attainments_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
