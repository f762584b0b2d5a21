use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
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

fn parse_due_date(v: Option<&serde_json::Value>) -> Result<Option<String>, HandlerErr> {
    let Some(v) = v else { return Ok(None) };
    if v.is_null() {
        return Ok(None);
    }
    let Some(s) = v.as_str() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "dueDate must be string or null".to_string(),
            details: None,
        });
    };
    let t = s.trim();
    if t.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(t, "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "bad_params",
        message: "dueDate must be YYYY-MM-DD".to_string(),
        details: None,
    })?;
    Ok(Some(t.to_string()))
}

fn parse_total_points(v: Option<&serde_json::Value>) -> Result<f64, HandlerErr> {
    let points = v.and_then(|v| v.as_f64()).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "missing totalPoints".to_string(),
        details: None,
    })?;
    if points <= 0.0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "totalPoints must be > 0".to_string(),
            details: Some(json!({ "totalPoints": points })),
        });
    }
    Ok(points)
}

fn assignments_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
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
            "SELECT a.id, a.title, a.total_points, a.due_date, a.sort_order,
               (SELECT COUNT(*) FROM submissions s WHERE s.assignment_id = a.id) AS submission_count
             FROM assignments a
             WHERE a.class_id = ?
             ORDER BY a.sort_order",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let assignments: Vec<serde_json::Value> = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let title: String = r.get(1)?;
            let total_points: f64 = r.get(2)?;
            let due_date: Option<String> = r.get(3)?;
            let sort_order: i64 = r.get(4)?;
            let submission_count: i64 = r.get(5)?;
            Ok(json!({
                "id": id,
                "title": title,
                "totalPoints": total_points,
                "dueDate": due_date,
                "sortOrder": sort_order,
                "submissionCount": submission_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "assignments": assignments }))
}

fn assignments_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let title = get_required_str(params, "title")?.trim().to_string();
    if title.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "title must not be empty".to_string(),
            details: None,
        });
    }
    let total_points = parse_total_points(params.get("totalPoints"))?;
    let due_date = parse_due_date(params.get("dueDate"))?;

    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM assignments WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let assignment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assignments(id, class_id, title, total_points, due_date, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &assignment_id,
            &class_id,
            &title,
            total_points,
            &due_date,
            next_sort,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "assignments" })),
    })?;

    Ok(json!({
        "assignmentId": assignment_id,
        "title": title,
        "sortOrder": next_sort
    }))
}

fn assignments_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let assignment_id = get_required_str(params, "assignmentId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing patch".to_string(),
            details: None,
        });
    };

    let exists = conn
        .query_row(
            "SELECT 1 FROM assignments WHERE class_id = ? AND id = ?",
            (&class_id, &assignment_id),
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
            message: "assignment not found".to_string(),
            details: None,
        });
    }

    if let Some(v) = patch.get("title").and_then(|v| v.as_str()) {
        let title = v.trim();
        if title.is_empty() {
            return Err(HandlerErr {
                code: "bad_params",
                message: "title must not be empty".to_string(),
                details: None,
            });
        }
        conn.execute(
            "UPDATE assignments SET title = ? WHERE id = ?",
            (title, &assignment_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }
    if patch.contains_key("totalPoints") {
        let total_points = parse_total_points(patch.get("totalPoints"))?;
        conn.execute(
            "UPDATE assignments SET total_points = ? WHERE id = ?",
            (total_points, &assignment_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }
    if patch.contains_key("dueDate") {
        let due_date = parse_due_date(patch.get("dueDate"))?;
        conn.execute(
            "UPDATE assignments SET due_date = ? WHERE id = ?",
            (&due_date, &assignment_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }

    Ok(json!({ "ok": true }))
}

fn assignments_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let assignment_id = get_required_str(params, "assignmentId")?;

    let exists = conn
        .query_row(
            "SELECT 1 FROM assignments WHERE class_id = ? AND id = ?",
            (&class_id, &assignment_id),
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
            message: "assignment not found".to_string(),
            details: None,
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    if let Err(e) = tx.execute(
        "DELETE FROM submissions WHERE assignment_id = ?",
        [&assignment_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "submissions" })),
        });
    }
    if let Err(e) = tx.execute("DELETE FROM assignments WHERE id = ?", [&assignment_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "assignments" })),
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
        "assignments.list" => Some(with_conn(state, req, assignments_list)),
        "assignments.create" => Some(with_conn(state, req, assignments_create)),
        "assignments.update" => Some(with_conn(state, req, assignments_update)),
        "assignments.delete" => Some(with_conn(state, req, assignments_delete)),
        _ => None,
    }
}
