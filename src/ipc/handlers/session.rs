use crate::auth;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{authenticate, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct LoginRow {
    user_id: String,
    password_hash: String,
    role: String,
    first_name: String,
    last_name: String,
    active: bool,
}

fn login(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let password = get_required_str(params, "password")?;

    let row = conn
        .query_row(
            "SELECT id, password_hash, role, first_name, last_name, active
             FROM users WHERE username = ?",
            [&username],
            |r| {
                Ok(LoginRow {
                    user_id: r.get(0)?,
                    password_hash: r.get(1)?,
                    role: r.get(2)?,
                    first_name: r.get(3)?,
                    last_name: r.get(4)?,
                    active: r.get::<_, i64>(5)? != 0,
                })
            },
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    // One failure message for unknown user, wrong password and disabled
    // account; the caller learns nothing about which it was.
    let Some(row) = row else {
        return Err(HandlerErr {
            code: "unauthenticated",
            message: "invalid username or password".to_string(),
            details: None,
        });
    };
    if !row.active || !auth::verify_password(&row.password_hash, &password) {
        return Err(HandlerErr {
            code: "unauthenticated",
            message: "invalid username or password".to_string(),
            details: None,
        });
    }

    let token = auth::issue_session(conn, &row.user_id).map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "sessions" })),
    })?;

    Ok(json!({
        "token": token,
        "user": {
            "id": row.user_id,
            "username": username,
            "role": row.role,
            "firstName": row.first_name,
            "lastName": row.last_name
        }
    }))
}

fn logout(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let token = get_required_str(params, "token")?;
    let removed = auth::drop_session(conn, &token).map_err(|e| HandlerErr {
        code: "db_delete_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "sessions" })),
    })?;
    if !removed {
        return Err(HandlerErr {
            code: "unauthenticated",
            message: "unknown or expired session".to_string(),
            details: None,
        });
    }
    Ok(json!({ "ok": true }))
}

fn whoami(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let identity = authenticate(conn, params)?;
    Ok(json!({
        "user": {
            "id": identity.user_id,
            "username": identity.username,
            "role": identity.role
        }
    }))
}

fn handle(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
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
        "auth.login" => Some(handle(state, req, login)),
        "auth.logout" => Some(handle(state, req, logout)),
        "auth.whoami" => Some(handle(state, req, whoami)),
        _ => None,
    }
}
