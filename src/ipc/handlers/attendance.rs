use crate::auth;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    authenticate, check_student_read_scope, get_opt_str, get_required_date, get_required_str,
    own_student_id, require_role, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const STATUSES: [&str; 3] = ["present", "absent", "late"];

fn teacher_row_id(conn: &Connection, user_id: &str) -> Result<String, HandlerErr> {
    conn.query_row("SELECT id FROM teachers WHERE user_id = ?", [user_id], |r| {
        r.get(0)
    })
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?
    .ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "no teacher profile for this account".to_string(),
        details: None,
    })
}

fn attendance_mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let identity = authenticate(conn, params)?;
    require_role(&identity, &[auth::ROLE_TEACHER])?;
    let teacher_id = teacher_row_id(conn, &identity.user_id)?;

    let date = get_required_date(params, "date")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing entries".to_string(),
            details: None,
        });
    };

    let subject_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if subject_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: None,
        });
    }

    // Validate the whole batch before touching the database; a bad row
    // rejects the request rather than half-applying it.
    let mut parsed: Vec<(String, String, Option<String>)> = Vec::new();
    for entry in entries {
        let Some(student_id) = entry.get("studentId").and_then(|v| v.as_str()) else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "entry missing studentId".to_string(),
                details: None,
            });
        };
        let Some(status) = entry.get("status").and_then(|v| v.as_str()) else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "entry missing status".to_string(),
                details: None,
            });
        };
        if !STATUSES.contains(&status) {
            return Err(HandlerErr {
                code: "validation_failed",
                message: "status must be present, absent or late".to_string(),
                details: Some(json!({ "status": status })),
            });
        }
        let remarks = entry
            .get("remarks")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        parsed.push((student_id.to_string(), status.to_string(), remarks));
    }

    let date_str = date.format("%Y-%m-%d").to_string();
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let mut marked = 0usize;
    for (student_id, status, remarks) in parsed {
        let exists = tx
            .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?
            .is_some();
        if !exists {
            continue;
        }
        tx.execute(
            "INSERT INTO attendance(id, student_id, date, status, subject_id, remarks, marked_by)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, date, subject_id) DO UPDATE SET
               status = excluded.status,
               remarks = excluded.remarks,
               marked_by = excluded.marked_by",
            (
                Uuid::new_v4().to_string(),
                &student_id,
                &date_str,
                &status,
                &subject_id,
                &remarks,
                &teacher_id,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance" })),
        })?;
        marked += 1;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "marked": marked, "date": date_str }))
}

fn attendance_list_for_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let identity = authenticate(conn, params)?;
    let student_id = match get_opt_str(params, "studentId") {
        Some(id) => id,
        None => match own_student_id(conn, &identity)? {
            Some(own) => own,
            None => {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "missing studentId".to_string(),
                    details: None,
                })
            }
        },
    };
    check_student_read_scope(conn, &identity, &student_id)?;

    let from = get_opt_str(params, "from");
    let to = get_opt_str(params, "to");

    let mut sql = String::from(
        "SELECT a.id, a.date, a.status, a.subject_id, sub.name, a.remarks
         FROM attendance a
         JOIN subjects sub ON sub.id = a.subject_id
         WHERE a.student_id = ?",
    );
    let mut args: Vec<String> = vec![student_id.clone()];
    if let Some(from) = from {
        sql.push_str(" AND a.date >= ?");
        args.push(from);
    }
    if let Some(to) = to {
        sql.push_str(" AND a.date <= ?");
        args.push(to);
    }
    sql.push_str(" ORDER BY a.date DESC");

    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "status": r.get::<_, String>(2)?,
                "subjectId": r.get::<_, String>(3)?,
                "subjectName": r.get::<_, String>(4)?,
                "remarks": r.get::<_, Option<String>>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "studentId": student_id, "attendance": rows }))
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
        "attendance.mark" => Some(handle(state, req, attendance_mark)),
        "attendance.listForStudent" => Some(handle(state, req, attendance_list_for_student)),
        _ => None,
    }
}
