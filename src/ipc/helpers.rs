use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::{self, Identity};
use crate::ipc::error::err;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

pub fn get_opt_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn get_opt_bool(params: &serde_json::Value, key: &str) -> bool {
    params
        .get(key)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

pub fn parse_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "bad_params",
        message: format!("{} must be YYYY-MM-DD", key),
        details: Some(json!({ "value": raw })),
    })
}

pub fn get_required_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = get_required_str(params, key)?;
    parse_date(&raw, key)
}

pub fn get_opt_date(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<NaiveDate>, HandlerErr> {
    match get_opt_str(params, key) {
        Some(raw) => parse_date(&raw, key).map(Some),
        None => Ok(None),
    }
}

/// Optional date param falling back to the wall-clock day. Callers pass an
/// explicit value in tests to keep derivations deterministic.
pub fn get_date_or_today(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    Ok(match get_opt_date(params, key)? {
        Some(d) => d,
        None => chrono::Local::now().date_naive(),
    })
}

pub fn authenticate(conn: &Connection, params: &serde_json::Value) -> Result<Identity, HandlerErr> {
    let Some(token) = get_opt_str(params, "token") else {
        return Err(HandlerErr {
            code: "unauthenticated",
            message: "missing token".to_string(),
            details: None,
        });
    };
    match auth::identity_for_token(conn, &token) {
        Ok(Some(identity)) => Ok(identity),
        Ok(None) => Err(HandlerErr {
            code: "unauthenticated",
            message: "unknown or expired session".to_string(),
            details: None,
        }),
        Err(e) => Err(HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }),
    }
}

pub fn require_role(identity: &Identity, allowed: &[&str]) -> Result<(), HandlerErr> {
    if allowed.contains(&identity.role.as_str()) {
        return Ok(());
    }
    Err(HandlerErr {
        code: "forbidden",
        message: format!("requires role {}", allowed.join(" or ")),
        details: Some(json!({ "role": identity.role })),
    })
}

pub fn require_admin(conn: &Connection, params: &serde_json::Value) -> Result<Identity, HandlerErr> {
    let identity = authenticate(conn, params)?;
    require_role(&identity, &[auth::ROLE_ADMIN])?;
    Ok(identity)
}

/// Read-scope check for per-student records: admins and teachers see
/// everyone, a student only itself, a parent only its children.
pub fn check_student_read_scope(
    conn: &Connection,
    identity: &Identity,
    student_id: &str,
) -> Result<(), HandlerErr> {
    if identity.is_admin() || identity.is_teacher() {
        return Ok(());
    }
    let owner_col = match identity.role.as_str() {
        auth::ROLE_STUDENT => "user_id",
        auth::ROLE_PARENT => "parent_user_id",
        _ => {
            return Err(HandlerErr {
                code: "forbidden",
                message: "role cannot read student records".to_string(),
                details: Some(json!({ "role": identity.role })),
            })
        }
    };
    let sql = format!("SELECT 1 FROM students WHERE id = ? AND {} = ?", owner_col);
    let visible = conn
        .query_row(&sql, (student_id, &identity.user_id), |r| r.get::<_, i64>(0))
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if visible {
        Ok(())
    } else {
        Err(HandlerErr {
            code: "forbidden",
            message: "not allowed to read this student's records".to_string(),
            details: None,
        })
    }
}

/// The student row owned by a student-role identity, if any.
pub fn own_student_id(
    conn: &Connection,
    identity: &Identity,
) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT id FROM students WHERE user_id = ?",
        [&identity.user_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

pub fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
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
