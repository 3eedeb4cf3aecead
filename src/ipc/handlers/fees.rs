use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    authenticate, check_student_read_scope, get_date_or_today, get_opt_i64, get_opt_str,
    get_required_date, get_required_i64, get_required_str, own_student_id, require_admin,
    student_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth::{ROLE_PARENT, ROLE_STUDENT};

fn format_cents(cents: i64) -> String {
    format!("${}.{:02}", cents / 100, cents % 100)
}

fn fees_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;
    let category = get_required_str(params, "category")?;
    let amount_cents = get_required_i64(params, "amountCents")?;
    let due_date = get_required_date(params, "dueDate")?;
    let academic_year = get_required_str(params, "academicYear")?;

    if amount_cents <= 0 {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "amountCents must be positive".to_string(),
            details: Some(json!({ "amountCents": amount_cents })),
        });
    }
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let fee_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO fees(id, student_id, category, amount_cents, due_date, status, academic_year)
         VALUES(?, ?, ?, ?, ?, 'pending', ?)",
        (
            &fee_id,
            &student_id,
            &category,
            amount_cents,
            due_date.format("%Y-%m-%d").to_string(),
            &academic_year,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "fees" })),
    })?;

    Ok(json!({ "feeId": fee_id }))
}

fn fees_pay(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let fee_id = get_required_str(params, "feeId")?;
    let method = get_required_str(params, "method")?;
    let payment_date = get_date_or_today(params, "paymentDate")?;

    let status: Option<String> = conn
        .query_row("SELECT status FROM fees WHERE id = ?", [&fee_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(status) = status else {
        return Err(HandlerErr {
            code: "not_found",
            message: "fee not found".to_string(),
            details: None,
        });
    };
    if status == calc::FEE_PAID {
        return Err(HandlerErr {
            code: "conflict",
            message: "fee is already paid".to_string(),
            details: Some(json!({ "feeId": fee_id })),
        });
    }

    // The status guard makes the first payment win; a racing second payment
    // updates zero rows and the original payment_date survives.
    let updated = conn
        .execute(
            "UPDATE fees SET status = 'paid', payment_date = ?, payment_method = ?
             WHERE id = ? AND status = 'pending'",
            (
                payment_date.format("%Y-%m-%d").to_string(),
                &method,
                &fee_id,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "fees" })),
        })?;
    if updated == 0 {
        return Err(HandlerErr {
            code: "conflict",
            message: "fee is already paid".to_string(),
            details: Some(json!({ "feeId": fee_id })),
        });
    }

    Ok(json!({
        "feeId": fee_id,
        "paymentDate": payment_date.format("%Y-%m-%d").to_string()
    }))
}

fn fees_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let fee_id = get_required_str(params, "feeId")?;

    let row: Option<(String, String, i64, String, String)> = conn
        .query_row(
            "SELECT status, category, amount_cents, due_date, academic_year
             FROM fees WHERE id = ?",
            [&fee_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some((status, category, amount_cents, due_date, academic_year)) = row else {
        return Err(HandlerErr {
            code: "not_found",
            message: "fee not found".to_string(),
            details: None,
        });
    };
    if status == calc::FEE_PAID {
        // Paid fees are immutable; corrective edits go through fees.reopen.
        return Err(HandlerErr {
            code: "conflict",
            message: "fee is already paid; reopen it before editing".to_string(),
            details: Some(json!({ "feeId": fee_id })),
        });
    }

    let new_amount = get_opt_i64(params, "amountCents").unwrap_or(amount_cents);
    if new_amount <= 0 {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "amountCents must be positive".to_string(),
            details: Some(json!({ "amountCents": new_amount })),
        });
    }
    let new_due = match get_opt_str(params, "dueDate") {
        Some(raw) => crate::ipc::helpers::parse_date(&raw, "dueDate")?
            .format("%Y-%m-%d")
            .to_string(),
        None => due_date,
    };

    conn.execute(
        "UPDATE fees SET category = ?, amount_cents = ?, due_date = ?, academic_year = ?
         WHERE id = ?",
        (
            get_opt_str(params, "category").unwrap_or(category),
            new_amount,
            new_due,
            get_opt_str(params, "academicYear").unwrap_or(academic_year),
            &fee_id,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "fees" })),
    })?;

    Ok(json!({ "ok": true }))
}

fn fees_reopen(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let fee_id = get_required_str(params, "feeId")?;

    let updated = conn
        .execute(
            "UPDATE fees SET status = 'pending', payment_date = NULL, payment_method = NULL
             WHERE id = ? AND status = 'paid'",
            [&fee_id],
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "fees" })),
        })?;
    if updated == 0 {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM fees WHERE id = ?", [&fee_id], |r| r.get(0))
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        if exists.is_none() {
            return Err(HandlerErr {
                code: "not_found",
                message: "fee not found".to_string(),
                details: None,
            });
        }
        return Err(HandlerErr {
            code: "conflict",
            message: "only a paid fee can be reopened".to_string(),
            details: Some(json!({ "feeId": fee_id })),
        });
    }

    Ok(json!({ "ok": true }))
}

fn fees_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let fee_id = get_required_str(params, "feeId")?;

    let removed = conn
        .execute("DELETE FROM fees WHERE id = ?", [&fee_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "fees" })),
        })?;
    if removed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "fee not found".to_string(),
            details: None,
        });
    }

    Ok(json!({ "ok": true }))
}

struct FeeRow {
    id: String,
    student_id: String,
    borrower: String,
    category: String,
    amount_cents: i64,
    due_date: String,
    status: String,
    payment_date: Option<String>,
    payment_method: Option<String>,
    academic_year: String,
}

fn fees_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let identity = authenticate(conn, params)?;
    let as_of = get_date_or_today(params, "asOf")?;
    let status_filter = get_opt_str(params, "status");
    if let Some(s) = status_filter.as_deref() {
        if !matches!(s, "pending" | "paid" | "overdue") {
            return Err(HandlerErr {
                code: "bad_params",
                message: "status must be pending, paid or overdue".to_string(),
                details: Some(json!({ "status": s })),
            });
        }
    }

    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Value> = Vec::new();

    match identity.role.as_str() {
        ROLE_STUDENT => {
            if let Some(requested) = get_opt_str(params, "studentId") {
                check_student_read_scope(conn, &identity, &requested)?;
                clauses.push("f.student_id = ?".to_string());
                args.push(Value::Text(requested));
            } else {
                let Some(own) = own_student_id(conn, &identity)? else {
                    return Ok(json!({ "fees": [] }));
                };
                clauses.push("f.student_id = ?".to_string());
                args.push(Value::Text(own));
            }
        }
        ROLE_PARENT => {
            if let Some(requested) = get_opt_str(params, "studentId") {
                check_student_read_scope(conn, &identity, &requested)?;
                clauses.push("f.student_id = ?".to_string());
                args.push(Value::Text(requested));
            } else {
                clauses.push("s.parent_user_id = ?".to_string());
                args.push(Value::Text(identity.user_id.clone()));
            }
        }
        _ => {
            if let Some(requested) = get_opt_str(params, "studentId") {
                clauses.push("f.student_id = ?".to_string());
                args.push(Value::Text(requested));
            }
        }
    }

    let mut sql = String::from(
        "SELECT f.id, f.student_id, u.last_name, u.first_name, f.category, f.amount_cents,
                f.due_date, f.status, f.payment_date, f.payment_method, f.academic_year
         FROM fees f
         JOIN students s ON s.id = f.student_id
         JOIN users u ON u.id = s.user_id",
    );
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY f.due_date, f.id");

    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(FeeRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                borrower: format!("{}, {}", last, first),
                category: r.get(4)?,
                amount_cents: r.get(5)?,
                due_date: r.get(6)?,
                status: r.get(7)?,
                payment_date: r.get(8)?,
                payment_method: r.get(9)?,
                academic_year: r.get(10)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    // The overdue filter works on the derived status, so it is applied
    // after derivation rather than pushed into SQL.
    let fees: Vec<serde_json::Value> = rows
        .into_iter()
        .filter_map(|f| {
            let derived = chrono::NaiveDate::parse_from_str(&f.due_date, "%Y-%m-%d")
                .map(|due| calc::fee_status_at(&f.status, due, as_of).to_string())
                .unwrap_or_else(|_| f.status.clone());
            if let Some(wanted) = status_filter.as_deref() {
                if derived != wanted {
                    return None;
                }
            }
            Some(json!({
                "id": f.id,
                "studentId": f.student_id,
                "student": f.borrower,
                "category": f.category,
                "amountCents": f.amount_cents,
                "amount": format_cents(f.amount_cents),
                "dueDate": f.due_date,
                "status": f.status,
                "derivedStatus": derived,
                "paymentDate": f.payment_date,
                "paymentMethod": f.payment_method,
                "academicYear": f.academic_year
            }))
        })
        .collect();

    Ok(json!({ "fees": fees, "asOf": as_of.format("%Y-%m-%d").to_string() }))
}

fn fees_receipt(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let identity = authenticate(conn, params)?;
    let fee_id = get_required_str(params, "feeId")?;

    let row: Option<(String, String, String, String, i64, String, Option<String>, Option<String>)> =
        conn.query_row(
            "SELECT f.student_id, s.student_no, u.first_name, u.last_name,
                    f.amount_cents, f.status, f.payment_date, f.payment_method
             FROM fees f
             JOIN students s ON s.id = f.student_id
             JOIN users u ON u.id = s.user_id
             WHERE f.id = ?",
            [&fee_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some((student_id, student_no, first, last, amount_cents, status, payment_date, method)) =
        row
    else {
        return Err(HandlerErr {
            code: "not_found",
            message: "fee not found".to_string(),
            details: None,
        });
    };
    check_student_read_scope(conn, &identity, &student_id)?;
    if status != calc::FEE_PAID {
        return Err(HandlerErr {
            code: "conflict",
            message: "receipts exist only for paid fees".to_string(),
            details: Some(json!({ "feeId": fee_id, "status": status })),
        });
    }

    let category: String = conn
        .query_row("SELECT category FROM fees WHERE id = ?", [&fee_id], |r| {
            r.get(0)
        })
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let short_id: String = fee_id.chars().take(8).collect();
    let receipt = format!(
        "SCHOOLHUB\nPAYMENT RECEIPT\n\nReceipt ID: RCP-{}\nDate: {}\n\nStudent: {} {}\nStudent No: {}\n\nFee Category: {}\nAmount: {}\nPayment Method: {}\nStatus: PAID\n\nThank you for your payment!\n",
        short_id,
        payment_date.as_deref().unwrap_or("-"),
        first,
        last,
        student_no,
        category,
        format_cents(amount_cents),
        method.as_deref().unwrap_or("-"),
    );

    Ok(json!({ "feeId": fee_id, "receipt": receipt }))
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
        "fees.create" => Some(handle(state, req, fees_create)),
        "fees.pay" => Some(handle(state, req, fees_pay)),
        "fees.update" => Some(handle(state, req, fees_update)),
        "fees.reopen" => Some(handle(state, req, fees_reopen)),
        "fees.delete" => Some(handle(state, req, fees_delete)),
        "fees.list" => Some(handle(state, req, fees_list)),
        "fees.receipt" => Some(handle(state, req, fees_receipt)),
        _ => None,
    }
}
