use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::seed;
use rusqlite::OptionalExtension;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            state.workspace = Some(path.clone());
            // Fresh workspaces get the default circulation policy. Existing
            // values are left alone so a tuned rate survives reopen.
            match db::settings_get_json(&conn, "library.circulation") {
                Ok(None) => {
                    let _ = db::settings_set_json(
                        &conn,
                        "library.circulation",
                        &json!({ "finePerDayCents": 100 }),
                    );
                }
                _ => {}
            }

            state.db = Some(conn);
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn handle_workspace_seed_demo(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    // Demo data is only for empty workspaces; a populated database is never
    // touched by the seeding path.
    let has_users = match conn
        .query_row("SELECT 1 FROM users LIMIT 1", [], |r| r.get::<_, i64>(0))
        .optional()
    {
        Ok(v) => v.is_some(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if has_users {
        return err(
            &req.id,
            "conflict",
            "workspace already has users; demo seeding is only for fresh workspaces",
            None,
        );
    }

    match seed::seed_demo(conn) {
        Ok(summary) => ok(&req.id, summary),
        Err(e) => err(&req.id, "db_insert_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "workspace.seedDemo" => Some(handle_workspace_seed_demo(state, req)),
        _ => None,
    }
}
