use crate::db::{self, MATERIALS_DIR_NAME};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::paging::Pager;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
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

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn materials_add(
    conn: &Connection,
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let src = PathBuf::from(get_required_str(params, "path")?);

    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }
    if !src.is_file() {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("no such file: {}", src.to_string_lossy()),
            details: None,
        });
    }
    let file_name = src
        .file_name()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "path has no usable file name".to_string(),
            details: None,
        })?;
    let title = params
        .get("title")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| file_name.clone());

    let bytes = std::fs::read(&src).map_err(|e| HandlerErr {
        code: "file_read_failed",
        message: e.to_string(),
        details: Some(json!({ "path": src.to_string_lossy() })),
    })?;
    let sha256 = sha256_hex(&bytes);
    let size_bytes = bytes.len() as i64;

    let material_id = Uuid::new_v4().to_string();
    let stored_name = format!("{}-{}", material_id, file_name);
    let materials_dir = workspace.join(MATERIALS_DIR_NAME);
    std::fs::create_dir_all(&materials_dir).map_err(|e| HandlerErr {
        code: "file_write_failed",
        message: e.to_string(),
        details: None,
    })?;
    let dst = materials_dir.join(&stored_name);
    std::fs::write(&dst, &bytes).map_err(|e| HandlerErr {
        code: "file_write_failed",
        message: e.to_string(),
        details: Some(json!({ "path": dst.to_string_lossy() })),
    })?;

    let uploaded_at = chrono::Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO materials(id, class_id, title, file_name, stored_name, size_bytes, sha256, uploaded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &material_id,
            &class_id,
            &title,
            &file_name,
            &stored_name,
            size_bytes,
            &sha256,
            &uploaded_at,
        ),
    ) {
        // Don't leave an orphaned copy behind if the row never landed.
        let _ = std::fs::remove_file(&dst);
        return Err(HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "materials" })),
        });
    }

    Ok(json!({
        "materialId": material_id,
        "title": title,
        "fileName": file_name,
        "storedName": stored_name,
        "sizeBytes": size_bytes,
        "sha256": sha256,
        "uploadedAt": uploaded_at
    }))
}

fn materials_list(
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
            "SELECT id, title, file_name, stored_name, size_bytes, sha256, uploaded_at
             FROM materials
             WHERE class_id = ?
             ORDER BY uploaded_at DESC, id",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let materials: Vec<serde_json::Value> = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let title: String = r.get(1)?;
            let file_name: String = r.get(2)?;
            let stored_name: String = r.get(3)?;
            let size_bytes: i64 = r.get(4)?;
            let sha256: String = r.get(5)?;
            let uploaded_at: String = r.get(6)?;
            Ok(json!({
                "id": id,
                "title": title,
                "fileName": file_name,
                "storedName": stored_name,
                "sizeBytes": size_bytes,
                "sha256": sha256,
                "uploadedAt": uploaded_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    match build_pager(conn, params, materials.len() as u64)? {
        Some(pager) => {
            let page_items: Vec<serde_json::Value> = pager.slice(&materials).to_vec();
            Ok(json!({
                "materials": page_items,
                "pagination": pagination_json(&pager)
            }))
        }
        None => Ok(json!({ "materials": materials })),
    }
}

fn materials_delete(
    conn: &Connection,
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let material_id = get_required_str(params, "materialId")?;

    let stored_name: Option<String> = conn
        .query_row(
            "SELECT stored_name FROM materials WHERE class_id = ? AND id = ?",
            (&class_id, &material_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(stored_name) = stored_name else {
        return Err(HandlerErr {
            code: "not_found",
            message: "material not found".to_string(),
            details: None,
        });
    };

    conn.execute(
        "DELETE FROM materials WHERE class_id = ? AND id = ?",
        (&class_id, &material_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_delete_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "materials" })),
    })?;

    // Row is gone; the file copy is best-effort cleanup.
    let _ = std::fs::remove_file(workspace.join(MATERIALS_DIR_NAME).join(stored_name));

    Ok(json!({ "ok": true }))
}

fn with_workspace(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &Path, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &workspace, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
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
        "materials.add" => Some(with_workspace(state, req, materials_add)),
        "materials.list" => Some(with_conn(state, req, materials_list)),
        "materials.delete" => Some(with_workspace(state, req, materials_delete)),
        _ => None,
    }
}
