use crate::calc::{self, CalcContext};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
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

/// Resolve an explicit status plus optional grade into the stored pair.
/// A numeric grade always means the work was graded.
fn resolve_submission(
    explicit_status: Option<&str>,
    grade: Option<f64>,
) -> Result<(&'static str, Option<f64>), HandlerErr> {
    if let Some(v) = grade {
        if v < 0.0 {
            return Err(HandlerErr {
                code: "bad_params",
                message: "negative grades are not allowed".to_string(),
                details: Some(json!({ "grade": v })),
            });
        }
    }

    match explicit_status.map(|s| s.to_ascii_lowercase()) {
        Some(s) if s == "graded" => {
            let Some(v) = grade else {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "graded status requires a numeric grade".to_string(),
                    details: None,
                });
            };
            Ok(("graded", Some(v)))
        }
        Some(s) if s == "submitted" => Ok(("submitted", None)),
        Some(s) if s == "not_submitted" => Ok(("not_submitted", None)),
        Some(other) => Err(HandlerErr {
            code: "bad_params",
            message: "status must be one of: not_submitted, submitted, graded".to_string(),
            details: Some(json!({ "status": other })),
        }),
        None => match grade {
            Some(v) => Ok(("graded", Some(v))),
            None => Err(HandlerErr {
                code: "bad_params",
                message: "provide status or grade".to_string(),
                details: None,
            }),
        },
    }
}

fn submissions_upsert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let student_id = get_required_str(params, "studentId")?;
    let status = params.get("status").and_then(|v| v.as_str());
    let grade = params.get("grade").and_then(|v| v.as_f64());
    let (status, grade) = resolve_submission(status, grade)?;

    let class_id: Option<String> = conn
        .query_row(
            "SELECT class_id FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(class_id) = class_id else {
        return Err(HandlerErr {
            code: "not_found",
            message: "assignment not found".to_string(),
            details: None,
        });
    };

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

    let submitted_at = if status == "not_submitted" {
        None
    } else {
        Some(chrono::Utc::now().to_rfc3339())
    };
    let submission_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO submissions(id, assignment_id, student_id, status, grade, submitted_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(assignment_id, student_id) DO UPDATE SET
           status = excluded.status,
           grade = excluded.grade,
           submitted_at = excluded.submitted_at",
        (
            &submission_id,
            &assignment_id,
            &student_id,
            status,
            grade,
            &submitted_at,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "submissions" })),
    })?;

    Ok(json!({
        "assignmentId": assignment_id,
        "studentId": student_id,
        "status": status,
        "grade": grade
    }))
}

fn submissions_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;

    let exists = conn
        .query_row(
            "SELECT 1 FROM assignments WHERE id = ?",
            [&assignment_id],
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

    // LEFT JOIN keeps rows whose student was since removed; the name is
    // masked rather than dropped.
    let mut stmt = conn
        .prepare(
            "SELECT sub.student_id, s.last_name, s.first_name, sub.status, sub.grade, sub.submitted_at
             FROM submissions sub
             LEFT JOIN students s ON s.id = sub.student_id
             WHERE sub.assignment_id = ?
             ORDER BY COALESCE(s.sort_order, 9223372036854775807), sub.student_id",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows: Vec<serde_json::Value> = stmt
        .query_map([&assignment_id], |r| {
            let student_id: String = r.get(0)?;
            let last_name: Option<String> = r.get(1)?;
            let first_name: Option<String> = r.get(2)?;
            let status: String = r.get(3)?;
            let grade: Option<f64> = r.get(4)?;
            let submitted_at: Option<String> = r.get(5)?;
            let display_name = match (last_name, first_name) {
                (Some(l), Some(f)) => format!("{}, {}", l, f),
                _ => "Unknown".to_string(),
            };
            Ok(json!({
                "studentId": student_id,
                "displayName": display_name,
                "status": status,
                "grade": grade,
                "submittedAt": submitted_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "submissions": rows }))
}

fn gradebook_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let ctx = CalcContext {
        conn,
        class_id: &class_id,
    };
    let model = calc::compute_gradebook(&ctx).map_err(calc_err)?;
    Ok(json!(model))
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
        "submissions.upsert" => Some(with_conn(state, req, submissions_upsert)),
        "submissions.list" => Some(with_conn(state, req, submissions_list)),
        "gradebook.open" => Some(with_conn(state, req, gradebook_open)),
        _ => None,
    }
}
