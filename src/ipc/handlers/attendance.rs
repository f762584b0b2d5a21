use crate::calc::{self, AttendanceStatus, CalcContext};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

#[derive(Debug, Clone)]
struct BasicStudent {
    id: String,
    display_name: String,
    sort_order: i64,
    active: bool,
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn list_students_for_class(conn: &Connection, class_id: &str) -> Result<Vec<BasicStudent>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, sort_order, active
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    stmt.query_map([class_id], |r| {
        let last: String = r.get(1)?;
        let first: String = r.get(2)?;
        Ok(BasicStudent {
            id: r.get(0)?,
            display_name: format!("{}, {}", last, first),
            sort_order: r.get(3)?,
            active: r.get::<_, i64>(4)? != 0,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn parse_date(raw: &str) -> Result<String, HandlerErr> {
    let t = raw.trim();
    NaiveDate::parse_from_str(t, "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "bad_params",
        message: "date must be YYYY-MM-DD".to_string(),
        details: None,
    })?;
    Ok(t.to_string())
}

fn parse_month_key(raw: &str) -> Result<String, HandlerErr> {
    let t = raw.trim();
    let Some((y, m)) = t.split_once('-') else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "month must be YYYY-MM".to_string(),
            details: None,
        });
    };
    let year_ok = y.len() == 4 && y.parse::<i32>().is_ok();
    let month_ok = m.len() == 2 && m.parse::<u32>().map(|n| (1..=12).contains(&n)).unwrap_or(false);
    if !year_ok || !month_ok {
        return Err(HandlerErr {
            code: "bad_params",
            message: "month must be YYYY-MM".to_string(),
            details: None,
        });
    }
    Ok(t.to_string())
}

fn calc_err(e: calc::CalcError) -> HandlerErr {
    let code = match e.code.as_str() {
        "not_found" => "not_found",
        _ => "db_query_failed",
    };
    HandlerErr {
        code,
        message: e.message,
        details: e.details,
    }
}

fn parse_status(raw: &str) -> Result<AttendanceStatus, HandlerErr> {
    AttendanceStatus::parse(raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "status must be one of: present, absent, sick, permission".to_string(),
        details: Some(json!({ "status": raw })),
    })
}

fn attendance_day_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = parse_date(&get_required_str(params, "date")?)?;

    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }
    let students = list_students_for_class(conn, &class_id)?;

    let mut by_student: HashMap<String, (String, Option<String>)> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT student_id, status, marked_by
             FROM attendance_records
             WHERE class_id = ? AND date = ?",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map((&class_id, &date), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    for (student_id, status, marked_by) in rows {
        by_student.insert(student_id, (status, marked_by));
    }

    // Unmarked stays null: "absent" is a statement, silence is not.
    let rows_json: Vec<serde_json::Value> = students
        .iter()
        .map(|s| {
            let (status, marked_by) = by_student
                .get(&s.id)
                .map(|(st, mb)| (Some(st.clone()), mb.clone()))
                .unwrap_or((None, None));
            json!({
                "studentId": s.id,
                "displayName": s.display_name,
                "sortOrder": s.sort_order,
                "active": s.active,
                "status": status,
                "markedBy": marked_by
            })
        })
        .collect();

    Ok(json!({
        "date": date,
        "rows": rows_json
    }))
}

fn attendance_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = parse_date(&get_required_str(params, "date")?)?;
    let student_id = get_required_str(params, "studentId")?;
    let status = parse_status(&get_required_str(params, "status")?)?;
    let marked_by = params
        .get("markedBy")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let student_exists = conn
        .query_row(
            "SELECT 1 FROM students WHERE class_id = ? AND id = ?",
            (&class_id, &student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if !student_exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    conn.execute(
        "INSERT INTO attendance_records(class_id, student_id, date, status, marked_by)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(class_id, date, student_id) DO UPDATE SET
           status = excluded.status,
           marked_by = excluded.marked_by",
        (&class_id, &student_id, &date, status.as_str(), &marked_by),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance_records" })),
    })?;

    Ok(json!({ "ok": true }))
}

fn attendance_bulk_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = parse_date(&get_required_str(params, "date")?)?;
    let marked_by = params
        .get("markedBy")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let Some(entries_json) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing entries".to_string(),
            details: None,
        });
    };

    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let mut entries: Vec<(String, AttendanceStatus)> = Vec::with_capacity(entries_json.len());
    for e in entries_json {
        let student_id = get_required_str(e, "studentId")?;
        let status = parse_status(&get_required_str(e, "status")?)?;
        entries.push((student_id, status));
    }

    // The day is replaced wholesale: delete-then-insert under one
    // transaction so a failure never leaves the day half-written.
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    if let Err(e) = tx.execute(
        "DELETE FROM attendance_records WHERE class_id = ? AND date = ?",
        (&class_id, &date),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance_records" })),
        });
    }

    for (student_id, status) in &entries {
        let exists = tx
            .query_row(
                "SELECT 1 FROM students WHERE class_id = ? AND id = ?",
                (&class_id, student_id),
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?
            .is_some();
        if !exists {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "not_found",
                message: "student not found".to_string(),
                details: Some(json!({ "studentId": student_id })),
            });
        }
        if let Err(e) = tx.execute(
            "INSERT INTO attendance_records(class_id, student_id, date, status, marked_by)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(class_id, date, student_id) DO UPDATE SET
               status = excluded.status,
               marked_by = excluded.marked_by",
            (&class_id, student_id, &date, status.as_str(), &marked_by),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "attendance_records" })),
            });
        }
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true, "recordCount": entries.len() }))
}

fn attendance_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let from = match params.get("from").and_then(|v| v.as_str()) {
        Some(raw) => Some(parse_date(raw)?),
        None => None,
    };
    let to = match params.get("to").and_then(|v| v.as_str()) {
        Some(raw) => Some(parse_date(raw)?),
        None => None,
    };

    let ctx = CalcContext {
        conn,
        class_id: &class_id,
    };
    let model = calc::compute_attendance_summary(&ctx, from.as_deref(), to.as_deref())
        .map_err(calc_err)?;
    Ok(json!(model))
}

fn attendance_calendar(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let month = parse_month_key(&get_required_str(params, "month")?)?;

    let ctx = CalcContext {
        conn,
        class_id: &class_id,
    };
    let days = calc::compute_attendance_calendar(&ctx, &month).map_err(calc_err)?;

    Ok(json!({
        "month": month,
        "days": days
    }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.dayOpen" => Some(with_conn(state, req, attendance_day_open)),
        "attendance.mark" => Some(with_conn(state, req, attendance_mark)),
        "attendance.bulkMark" => Some(with_conn(state, req, attendance_bulk_mark)),
        "attendance.summary" => Some(with_conn(state, req, attendance_summary)),
        "attendance.calendar" => Some(with_conn(state, req, attendance_calendar)),
        _ => None,
    }
}
