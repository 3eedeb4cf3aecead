use crate::calc;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    authenticate, check_student_read_scope, get_date_or_today, get_opt_bool, get_opt_i64,
    get_opt_str, get_required_date, get_required_str, own_student_id, require_admin,
    student_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth::{ROLE_PARENT, ROLE_STUDENT};

const DEFAULT_FINE_PER_DAY_CENTS: i64 = 100;

fn fine_per_day_cents(conn: &Connection) -> Result<i64, HandlerErr> {
    let setting = db::settings_get_json(conn, "library.circulation").map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(setting
        .as_ref()
        .and_then(|v| v.get("finePerDayCents"))
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_FINE_PER_DAY_CENTS))
}

struct BookRow {
    id: String,
    title: String,
    author: String,
    isbn: Option<String>,
    category: Option<String>,
    total_copies: i64,
    available_copies: i64,
    publication_year: Option<i64>,
    publisher: Option<String>,
    language: String,
}

fn book_json(b: &BookRow) -> serde_json::Value {
    json!({
        "id": b.id,
        "title": b.title,
        "author": b.author,
        "isbn": b.isbn,
        "category": b.category,
        "totalCopies": b.total_copies,
        "availableCopies": b.available_copies,
        "publicationYear": b.publication_year,
        "publisher": b.publisher,
        "language": b.language
    })
}

fn read_book(conn: &Connection, book_id: &str) -> Result<Option<BookRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, title, author, isbn, category, total_copies, available_copies,
                publication_year, publisher, language
         FROM books WHERE id = ?",
        [book_id],
        |r| {
            Ok(BookRow {
                id: r.get(0)?,
                title: r.get(1)?,
                author: r.get(2)?,
                isbn: r.get(3)?,
                category: r.get(4)?,
                total_copies: r.get(5)?,
                available_copies: r.get(6)?,
                publication_year: r.get(7)?,
                publisher: r.get(8)?,
                language: r.get(9)?,
            })
        },
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn books_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let title = get_required_str(params, "title")?;
    let author = get_required_str(params, "author")?;
    let total_copies = get_opt_i64(params, "totalCopies").unwrap_or(1);
    if total_copies < 0 {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "totalCopies must not be negative".to_string(),
            details: Some(json!({ "totalCopies": total_copies })),
        });
    }

    let book_id = Uuid::new_v4().to_string();
    // Every copy of a new title starts on the shelf.
    conn.execute(
        "INSERT INTO books(id, title, author, isbn, category, total_copies,
                           available_copies, publication_year, publisher, language)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &book_id,
            &title,
            &author,
            get_opt_str(params, "isbn"),
            get_opt_str(params, "category"),
            total_copies,
            total_copies,
            get_opt_i64(params, "publicationYear"),
            get_opt_str(params, "publisher"),
            get_opt_str(params, "language").unwrap_or_else(|| "English".to_string()),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "books" })),
    })?;

    Ok(json!({ "bookId": book_id }))
}

fn books_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let book_id = get_required_str(params, "bookId")?;
    let Some(existing) = read_book(conn, &book_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "book not found".to_string(),
            details: None,
        });
    };

    let total_copies = get_opt_i64(params, "totalCopies").unwrap_or(existing.total_copies);
    let available_copies =
        get_opt_i64(params, "availableCopies").unwrap_or(existing.available_copies);
    if total_copies < 0 || available_copies < 0 || available_copies > total_copies {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "copy counts must satisfy 0 <= available <= total".to_string(),
            details: Some(json!({
                "totalCopies": total_copies,
                "availableCopies": available_copies
            })),
        });
    }

    conn.execute(
        "UPDATE books SET title = ?, author = ?, isbn = ?, category = ?,
                total_copies = ?, available_copies = ?, publication_year = ?,
                publisher = ?, language = ?
         WHERE id = ?",
        (
            get_opt_str(params, "title").unwrap_or(existing.title),
            get_opt_str(params, "author").unwrap_or(existing.author),
            get_opt_str(params, "isbn").or(existing.isbn),
            get_opt_str(params, "category").or(existing.category),
            total_copies,
            available_copies,
            get_opt_i64(params, "publicationYear").or(existing.publication_year),
            get_opt_str(params, "publisher").or(existing.publisher),
            get_opt_str(params, "language").unwrap_or(existing.language),
            &book_id,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "books" })),
    })?;

    Ok(json!({ "ok": true }))
}

fn books_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let book_id = get_required_str(params, "bookId")?;

    if read_book(conn, &book_id)?.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "book not found".to_string(),
            details: None,
        });
    }

    let active_loans: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM loans WHERE book_id = ? AND status = 'issued'",
            [&book_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if active_loans > 0 {
        return Err(HandlerErr {
            code: "conflict",
            message: format!("book has {} active loans", active_loans),
            details: Some(json!({ "activeLoans": active_loans })),
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    // History goes with the title; only returned loans can remain by now.
    tx.execute("DELETE FROM loans WHERE book_id = ?", [&book_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "loans" })),
        })?;
    tx.execute("DELETE FROM books WHERE id = ?", [&book_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "books" })),
        })?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true }))
}

fn books_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _identity = authenticate(conn, params)?;
    let only_available = get_opt_bool(params, "onlyAvailable");

    let sql = if only_available {
        "SELECT id, title, author, isbn, category, total_copies, available_copies,
                publication_year, publisher, language
         FROM books WHERE available_copies > 0 ORDER BY title"
    } else {
        "SELECT id, title, author, isbn, category, total_copies, available_copies,
                publication_year, publisher, language
         FROM books ORDER BY title"
    };
    let mut stmt = conn.prepare(sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let rows = stmt
        .query_map([], |r| {
            Ok(BookRow {
                id: r.get(0)?,
                title: r.get(1)?,
                author: r.get(2)?,
                isbn: r.get(3)?,
                category: r.get(4)?,
                total_copies: r.get(5)?,
                available_copies: r.get(6)?,
                publication_year: r.get(7)?,
                publisher: r.get(8)?,
                language: r.get(9)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "books": rows.iter().map(book_json).collect::<Vec<_>>() }))
}

fn library_issue(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let book_id = get_required_str(params, "bookId")?;
    let student_id = get_required_str(params, "studentId")?;
    let issue_date = get_required_date(params, "issueDate")?;
    let due_date = get_required_date(params, "dueDate")?;
    if due_date < issue_date {
        return Err(HandlerErr {
            code: "bad_params",
            message: "dueDate must not precede issueDate".to_string(),
            details: None,
        });
    }

    let Some(book) = read_book(conn, &book_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "book not found".to_string(),
            details: None,
        });
    };
    if !student_exists(conn, &student_id)? {
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

    // Guarded decrement: the WHERE clause is the availability check, so a
    // concurrent issue of the last copy loses cleanly instead of driving
    // the counter negative.
    let decremented = tx
        .execute(
            "UPDATE books SET available_copies = available_copies - 1
             WHERE id = ? AND available_copies > 0",
            [&book_id],
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "books" })),
        })?;
    if decremented == 0 {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "constraint_violation",
            message: "no copies available for this book".to_string(),
            details: Some(json!({ "bookId": book.id, "availableCopies": 0 })),
        });
    }

    let loan_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO loans(id, book_id, student_id, issue_date, due_date, status, fine_cents)
         VALUES(?, ?, ?, ?, ?, 'issued', 0)",
        (
            &loan_id,
            &book_id,
            &student_id,
            issue_date.format("%Y-%m-%d").to_string(),
            due_date.format("%Y-%m-%d").to_string(),
        ),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "loans" })),
        });
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "loanId": loan_id }))
}

fn library_return(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let loan_id = get_required_str(params, "loanId")?;
    let return_date = get_date_or_today(params, "returnDate")?;

    let loan: Option<(String, String, String)> = conn
        .query_row(
            "SELECT book_id, due_date, status FROM loans WHERE id = ?",
            [&loan_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some((book_id, due_raw, status)) = loan else {
        return Err(HandlerErr {
            code: "not_found",
            message: "loan not found".to_string(),
            details: None,
        });
    };
    if status != calc::LOAN_ISSUED {
        // A second return is an error, never a silent no-op; anything else
        // would double-increment the shelf counter.
        return Err(HandlerErr {
            code: "conflict",
            message: "loan is already returned".to_string(),
            details: Some(json!({ "loanId": loan_id })),
        });
    }

    let due_date =
        chrono::NaiveDate::parse_from_str(&due_raw, "%Y-%m-%d").map_err(|_| HandlerErr {
            code: "db_query_failed",
            message: format!("stored due_date is not a date: {}", due_raw),
            details: None,
        })?;
    let fine = calc::fine_cents(due_date, return_date, fine_per_day_cents(conn)?);

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    // Status guard repeated inside the transaction so two racing returns
    // cannot both pass the check above.
    let closed = tx
        .execute(
            "UPDATE loans SET status = 'returned', return_date = ?, fine_cents = ?
             WHERE id = ? AND status = 'issued'",
            (return_date.format("%Y-%m-%d").to_string(), fine, &loan_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "loans" })),
        })?;
    if closed == 0 {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "conflict",
            message: "loan is already returned".to_string(),
            details: Some(json!({ "loanId": loan_id })),
        });
    }

    let incremented = tx
        .execute(
            "UPDATE books SET available_copies = available_copies + 1
             WHERE id = ? AND available_copies < total_copies",
            [&book_id],
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "books" })),
        })?;
    if incremented == 0 {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "constraint_violation",
            message: "return would exceed the book's total copies".to_string(),
            details: Some(json!({ "bookId": book_id })),
        });
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({
        "loanId": loan_id,
        "returnDate": return_date.format("%Y-%m-%d").to_string(),
        "fineCents": fine
    }))
}

fn library_loans(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let identity = authenticate(conn, params)?;
    let as_of = get_date_or_today(params, "asOf")?;

    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Value> = Vec::new();

    match identity.role.as_str() {
        ROLE_STUDENT => {
            if let Some(requested) = get_opt_str(params, "studentId") {
                check_student_read_scope(conn, &identity, &requested)?;
                clauses.push("l.student_id = ?".to_string());
                args.push(Value::Text(requested));
            } else {
                let Some(own) = own_student_id(conn, &identity)? else {
                    return Ok(json!({ "loans": [] }));
                };
                clauses.push("l.student_id = ?".to_string());
                args.push(Value::Text(own));
            }
        }
        ROLE_PARENT => {
            if let Some(requested) = get_opt_str(params, "studentId") {
                check_student_read_scope(conn, &identity, &requested)?;
                clauses.push("l.student_id = ?".to_string());
                args.push(Value::Text(requested));
            } else {
                clauses.push("s.parent_user_id = ?".to_string());
                args.push(Value::Text(identity.user_id.clone()));
            }
        }
        _ => {
            if let Some(requested) = get_opt_str(params, "studentId") {
                clauses.push("l.student_id = ?".to_string());
                args.push(Value::Text(requested));
            }
        }
    }
    if let Some(book_id) = get_opt_str(params, "bookId") {
        clauses.push("l.book_id = ?".to_string());
        args.push(Value::Text(book_id));
    }
    if let Some(status) = get_opt_str(params, "status") {
        if status != calc::LOAN_ISSUED && status != calc::LOAN_RETURNED {
            return Err(HandlerErr {
                code: "bad_params",
                message: "status must be issued or returned".to_string(),
                details: Some(json!({ "status": status })),
            });
        }
        clauses.push("l.status = ?".to_string());
        args.push(Value::Text(status));
    }

    let mut sql = String::from(
        "SELECT l.id, l.book_id, b.title, l.student_id, u.last_name, u.first_name,
                l.issue_date, l.due_date, l.return_date, l.status, l.fine_cents
         FROM loans l
         JOIN books b ON b.id = l.book_id
         JOIN students s ON s.id = l.student_id
         JOIN users u ON u.id = s.user_id",
    );
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY l.issue_date, l.id");

    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), |r| {
            let due_raw: String = r.get(7)?;
            let status: String = r.get(9)?;
            let last: String = r.get(4)?;
            let first: String = r.get(5)?;
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                format!("{}, {}", last, first),
                r.get::<_, String>(6)?,
                due_raw,
                r.get::<_, Option<String>>(8)?,
                status,
                r.get::<_, i64>(10)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let loans: Vec<serde_json::Value> = rows
        .into_iter()
        .map(
            |(id, book_id, title, student_id, borrower, issued, due_raw, returned, status, fine)| {
                let overdue = chrono::NaiveDate::parse_from_str(&due_raw, "%Y-%m-%d")
                    .map(|due| calc::loan_is_overdue(&status, due, as_of))
                    .unwrap_or(false);
                json!({
                    "id": id,
                    "bookId": book_id,
                    "bookTitle": title,
                    "studentId": student_id,
                    "borrower": borrower,
                    "issueDate": issued,
                    "dueDate": due_raw,
                    "returnDate": returned,
                    "status": status,
                    "fineCents": fine,
                    "overdue": overdue
                })
            },
        )
        .collect();

    Ok(json!({ "loans": loans, "asOf": as_of.format("%Y-%m-%d").to_string() }))
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
        "books.create" => Some(handle(state, req, books_create)),
        "books.update" => Some(handle(state, req, books_update)),
        "books.delete" => Some(handle(state, req, books_delete)),
        "books.list" => Some(handle(state, req, books_list)),
        "library.issue" => Some(handle(state, req, library_issue)),
        "library.return" => Some(handle(state, req, library_return)),
        "library.loans" => Some(handle(state, req, library_loans)),
        _ => None,
    }
}
