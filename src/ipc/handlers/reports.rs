use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_date_or_today, require_admin, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn count(conn: &Connection, sql: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [], |r| r.get(0)).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn count_with_date(conn: &Connection, sql: &str, as_of: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [as_of], |r| r.get(0))
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })
}

fn dashboard_stats(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let as_of = get_date_or_today(params, "asOf")?;
    let as_of_str = as_of.format("%Y-%m-%d").to_string();

    let total_students = count(conn, "SELECT COUNT(*) FROM students")?;
    let total_teachers = count(conn, "SELECT COUNT(*) FROM teachers")?;
    let total_classes = count(conn, "SELECT COUNT(*) FROM school_classes")?;
    let total_subjects = count(conn, "SELECT COUNT(*) FROM subjects")?;
    let total_books = count(conn, "SELECT COUNT(*) FROM books")?;

    let pending_fees = count(conn, "SELECT COUNT(*) FROM fees WHERE status = 'pending'")?;
    // Overdue is derived from the due date; nothing in the fees or loans
    // tables ever stores an 'overdue' status.
    let overdue_fees = count_with_date(
        conn,
        "SELECT COUNT(*) FROM fees WHERE status = 'pending' AND due_date < ?",
        &as_of_str,
    )?;
    let issued_loans = count(conn, "SELECT COUNT(*) FROM loans WHERE status = 'issued'")?;
    let overdue_loans = count_with_date(
        conn,
        "SELECT COUNT(*) FROM loans WHERE status = 'issued' AND due_date < ?",
        &as_of_str,
    )?;

    Ok(json!({
        "asOf": as_of_str,
        "totalStudents": total_students,
        "totalTeachers": total_teachers,
        "totalClasses": total_classes,
        "totalSubjects": total_subjects,
        "totalBooks": total_books,
        "pendingFees": pending_fees,
        "overdueFees": overdue_fees,
        "issuedLoans": issued_loans,
        "overdueLoans": overdue_loans
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.stats" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            Some(match dashboard_stats(conn, &req.params) {
                Ok(result) => ok(&req.id, result),
                Err(error) => error.response(&req.id),
            })
        }
        _ => None,
    }
}
