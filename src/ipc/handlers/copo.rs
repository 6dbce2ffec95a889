use crate::auth::Access;
use crate::calc;
use crate::ipc::error::{conflict_or_db, AppError};
use crate::ipc::helpers::{authorize, db_conn, new_id, required_str, require_subject, respond};
use crate::ipc::types::{AppState, Request};
use crate::model::{PoChannels, CHANNELS};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

/// `e.po1, e.po2, ...` or `po1_avg, ...` in channel order.
fn channel_list(prefix: &str, suffix: &str) -> String {
    CHANNELS
        .iter()
        .map(|c| format!("{}{}{}", prefix, c, suffix))
        .collect::<Vec<_>>()
        .join(", ")
}

fn channels_from_row(r: &Row<'_>, first: usize) -> rusqlite::Result<PoChannels> {
    let mut values = [0.0; 14];
    for (i, slot) in values.iter_mut().enumerate() {
        *slot = r.get(first + i)?;
    }
    Ok(PoChannels(values))
}

fn entry_select_sql(filter: &str) -> String {
    format!(
        "SELECT e.id, e.subject_id, e.course_outcome_id, co.co_no, {}
         FROM copo_entries e JOIN course_outcomes co ON co.id = e.course_outcome_id
         {}
         ORDER BY co.rowid, e.rowid",
        channel_list("e.", ""),
        filter
    )
}

fn entry_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    let channels = channels_from_row(r, 4)?;
    let mut out = channels.to_json("");
    out.insert("id".to_string(), json!(r.get::<_, String>(0)?));
    out.insert("subjectId".to_string(), json!(r.get::<_, String>(1)?));
    out.insert("courseOutcomeId".to_string(), json!(r.get::<_, String>(2)?));
    out.insert("coNo".to_string(), json!(r.get::<_, String>(3)?));
    Ok(Value::Object(out))
}

pub(crate) fn load_entry(conn: &Connection, id: &str) -> Result<Value, AppError> {
    conn.query_row(&entry_select_sql("WHERE e.id = ?"), [id], entry_json)
        .optional()?
        .ok_or_else(|| AppError::not_found("CO-PO matrix entry"))
}

/// Inserts one CO-PO row; a second row for the same (subject, CO) is a
/// conflict.
pub(crate) fn insert_entry(
    conn: &Connection,
    subject_id: &str,
    course_outcome_id: &str,
    channels: &PoChannels,
) -> Result<String, AppError> {
    let id = new_id();
    let sql = format!(
        "INSERT INTO copo_entries(id, subject_id, course_outcome_id, {})
         VALUES(?, ?, ?, {})",
        channel_list("", ""),
        vec!["?"; CHANNELS.len()].join(", ")
    );
    let mut bind_values = vec![
        SqlValue::Text(id.clone()),
        SqlValue::Text(subject_id.to_string()),
        SqlValue::Text(course_outcome_id.to_string()),
    ];
    bind_values.extend(channels.0.iter().map(|v| SqlValue::Real(*v)));
    conn.execute(&sql, params_from_iter(bind_values))
        .map_err(|e| conflict_or_db(e, "CO-PO matrix entry for this course outcome"))?;
    Ok(id)
}

fn copo_create(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let p = &req.params;
    let subject_id = required_str(p, "subjectId")?;
    let course_outcome_id = required_str(p, "courseOutcomeId")?;
    let channels = PoChannels::from_params(p)?;

    let owner: Option<String> = conn
        .query_row(
            "SELECT subject_id FROM course_outcomes WHERE id = ?",
            [&course_outcome_id],
            |r| r.get(0),
        )
        .optional()?;
    match owner {
        None => return Err(AppError::not_found("course outcome")),
        Some(owner) if owner != subject_id => {
            return Err(AppError::BadParams(
                "course outcome belongs to a different subject".to_string(),
            ))
        }
        Some(_) => {}
    }

    let id = insert_entry(conn, &subject_id, &course_outcome_id, &channels)?;
    load_entry(conn, &id)
}

fn copo_list(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let mut stmt = conn.prepare(&entry_select_sql("WHERE e.subject_id = ?"))?;
    let rows = stmt
        .query_map([&subject_id], entry_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!(rows))
}

fn copo_update(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let id = required_str(&req.params, "id")?;
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return Err(AppError::missing("patch"));
    };

    let current = conn
        .query_row(
            &format!(
                "SELECT {} FROM copo_entries WHERE id = ?",
                channel_list("", "")
            ),
            [&id],
            |r| channels_from_row(r, 0),
        )
        .optional()?;
    let Some(mut channels) = current else {
        return Err(AppError::not_found("CO-PO matrix entry"));
    };
    if !channels.apply_patch(patch)? {
        return Err(AppError::BadParams(
            "patch must include at least one channel".to_string(),
        ));
    }

    let sets = CHANNELS
        .iter()
        .map(|c| format!("{} = ?", c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut bind_values: Vec<SqlValue> = channels.0.iter().map(|v| SqlValue::Real(*v)).collect();
    bind_values.push(SqlValue::Text(id.clone()));
    conn.execute(
        &format!("UPDATE copo_entries SET {} WHERE id = ?", sets),
        params_from_iter(bind_values),
    )?;
    load_entry(conn, &id)
}

fn copo_delete(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let id = required_str(&req.params, "id")?;
    if conn.execute("DELETE FROM copo_entries WHERE id = ?", [&id])? == 0 {
        return Err(AppError::not_found("CO-PO matrix entry"));
    }
    Ok(json!({ "deleted": id }))
}

fn copo_delete_by_subject(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let ctx = authorize(state, req, Access::Admin)?;
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let removed = conn.execute("DELETE FROM copo_entries WHERE subject_id = ?", [&subject_id])?;
    if removed == 0 {
        return Err(AppError::NotFound(
            "no CO-PO matrix entries found for subject".to_string(),
        ));
    }
    tracing::info!(actor = %ctx.subject_id, subject_id = %subject_id, removed, "CO-PO entries deleted");
    Ok(json!({ "subjectId": subject_id, "deleted": removed }))
}

fn average_json(subject_id: &str, entry_count: i64, avg: &PoChannels) -> Value {
    let mut out = avg.to_json("_avg");
    out.insert("subjectId".to_string(), json!(subject_id));
    out.insert("entryCount".to_string(), json!(entry_count));
    Value::Object(out)
}

/// Recomputes the subject's channel averages from its current CO-PO rows and
/// overwrites the stored average.
fn copo_averages_compute(state: &AppState, req: &Request) -> Result<Value, AppError> {
    authorize(state, req, Access::User)?;
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    require_subject(conn, &subject_id)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM copo_entries WHERE subject_id = ? ORDER BY rowid",
        channel_list("", "")
    ))?;
    let entries = stmt
        .query_map([&subject_id], |r| channels_from_row(r, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    let Some(avg) = calc::copo_average(&entries) else {
        return Err(AppError::NotFound(
            "no CO-PO matrix entries found for subject".to_string(),
        ));
    };
    let entry_count = entries.len() as i64;

    let avg_cols = channel_list("", "_avg");
    let updates = CHANNELS
        .iter()
        .map(|c| format!("{c}_avg = excluded.{c}_avg"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO copo_averages(subject_id, entry_count, {})
         VALUES(?, ?, {})
         ON CONFLICT(subject_id) DO UPDATE SET entry_count = excluded.entry_count, {}",
        avg_cols,
        vec!["?"; CHANNELS.len()].join(", "),
        updates
    );
    let mut bind_values = vec![
        SqlValue::Text(subject_id.clone()),
        SqlValue::Integer(entry_count),
    ];
    bind_values.extend(avg.0.iter().map(|v| SqlValue::Real(*v)));
    conn.execute(&sql, params_from_iter(bind_values))?;

    tracing::info!(subject_id = %subject_id, entries = entry_count, "CO-PO averages computed");
    Ok(average_json(&subject_id, entry_count, &avg))
}

fn copo_averages_get(state: &AppState, req: &Request) -> Result<Value, AppError> {
    let conn = db_conn(state)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    conn.query_row(
        &format!(
            "SELECT entry_count, {} FROM copo_averages WHERE subject_id = ?",
            channel_list("", "_avg")
        ),
        [&subject_id],
        |r| {
            let count: i64 = r.get(0)?;
            Ok(average_json(&subject_id, count, &channels_from_row(r, 1)?))
        },
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("CO-PO average"))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "copo.create" => copo_create(state, req),
        "copo.list" => copo_list(state, req),
        "copo.update" => copo_update(state, req),
        "copo.delete" => copo_delete(state, req),
        "copo.deleteBySubject" => copo_delete_by_subject(state, req),
        "copo.averages.compute" => copo_averages_compute(state, req),
        "copo.averages.get" => copo_averages_get(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
