use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::paging::Pager;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

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

/// Reads optional paging params; pageSize falls back to the stored
/// workspace preference, then 10.
fn build_pager(
    conn: &Connection,
    params: &serde_json::Value,
    total_items: u64,
) -> Result<Option<Pager>, HandlerErr> {
    let page = params.get("page").and_then(|v| v.as_u64());
    let page_size = params.get("pageSize").and_then(|v| v.as_u64());
    if page.is_none() && page_size.is_none() {
        return Ok(None);
    }

    let page_size = match page_size {
        Some(v) => v,
        None => db::settings_get_json(conn, "paging.itemsPerPage")
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?
            .and_then(|v| v.as_u64())
            .unwrap_or(10),
    };

    let mut pager = Pager::new(total_items, page_size);
    if let Some(p) = page {
        pager.set_page(p);
    }
    Ok(Some(pager))
}

fn pagination_json(pager: &Pager) -> serde_json::Value {
    json!({
        "totalItems": pager.total_items(),
        "itemsPerPage": pager.items_per_page(),
        "currentPage": pager.current_page(),
        "totalPages": pager.total_pages(),
        "startItem": pager.start_item(),
        "endItem": pager.end_item(),
        "visiblePages": pager.visible_pages(),
    })
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, student_no, active, sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let students: Vec<serde_json::Value> = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let last_name: String = r.get(1)?;
            let first_name: String = r.get(2)?;
            let student_no: Option<String> = r.get(3)?;
            let active: i64 = r.get(4)?;
            let sort_order: i64 = r.get(5)?;
            Ok(json!({
                "id": id,
                "lastName": last_name,
                "firstName": first_name,
                "displayName": format!("{}, {}", last_name, first_name),
                "studentNo": student_no,
                "active": active != 0,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    match build_pager(conn, params, students.len() as u64)? {
        Some(pager) => {
            let page_items: Vec<serde_json::Value> = pager.slice(&students).to_vec();
            Ok(json!({
                "students": page_items,
                "pagination": pagination_json(&pager)
            }))
        }
        None => Ok(json!({ "students": students })),
    }
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let last_name = get_required_str(params, "lastName")?;
    let first_name = get_required_str(params, "firstName")?;
    let last_name = last_name.trim().to_string();
    let first_name = first_name.trim().to_string();
    if last_name.is_empty() || first_name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "lastName and firstName must not be empty".to_string(),
            details: None,
        });
    }
    let student_no = params
        .get("studentNo")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());
    let active = params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let student_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, student_no, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &class_id,
            &last_name,
            &first_name,
            &student_no,
            active as i64,
            next_sort,
            &now,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    Ok(json!({
        "studentId": student_id,
        "displayName": format!("{}, {}", last_name, first_name),
        "sortOrder": next_sort
    }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing patch".to_string(),
            details: None,
        });
    };

    let exists = conn
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
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    if let Some(v) = patch.get("lastName").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return Err(HandlerErr {
                code: "bad_params",
                message: "lastName must not be empty".to_string(),
                details: None,
            });
        }
        conn.execute(
            "UPDATE students SET last_name = ? WHERE id = ?",
            (v, &student_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }
    if let Some(v) = patch.get("firstName").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return Err(HandlerErr {
                code: "bad_params",
                message: "firstName must not be empty".to_string(),
                details: None,
            });
        }
        conn.execute(
            "UPDATE students SET first_name = ? WHERE id = ?",
            (v, &student_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }
    if let Some(v) = patch.get("studentNo") {
        let student_no = v.as_str().map(|s| s.trim().to_string());
        conn.execute(
            "UPDATE students SET student_no = ? WHERE id = ?",
            (&student_no, &student_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }
    if let Some(v) = patch.get("active").and_then(|v| v.as_bool()) {
        conn.execute(
            "UPDATE students SET active = ? WHERE id = ?",
            (v as i64, &student_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }

    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE students SET updated_at = ? WHERE id = ?",
        (&now, &student_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true }))
}

fn students_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let student_id = get_required_str(params, "studentId")?;

    let exists = conn
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
    if !exists {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    if let Err(e) = tx.execute(
        "DELETE FROM attendance_records WHERE class_id = ? AND student_id = ?",
        (&class_id, &student_id),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance_records" })),
        });
    }
    if let Err(e) = tx.execute(
        "DELETE FROM submissions WHERE student_id = ?
         AND assignment_id IN (SELECT id FROM assignments WHERE class_id = ?)",
        (&student_id, &class_id),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "submissions" })),
        });
    }
    if let Err(e) = tx.execute(
        "DELETE FROM students WHERE class_id = ? AND id = ?",
        (&class_id, &student_id),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "students" })),
        });
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true }))
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
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.delete" => Some(with_conn(state, req, students_delete)),
        _ => None,
    }
}
