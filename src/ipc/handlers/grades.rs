use crate::auth;
use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    authenticate, check_student_read_scope, get_opt_str, get_required_date, get_required_str,
    own_student_id, require_role, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

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

fn grades_submit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let identity = authenticate(conn, params)?;
    require_role(&identity, &[auth::ROLE_TEACHER])?;
    let teacher_id = teacher_row_id(conn, &identity.user_id)?;

    let subject_id = get_required_str(params, "subjectId")?;
    let exam_type = get_required_str(params, "examType")?;
    let exam_date = get_required_date(params, "examDate")?;
    let Some(total_marks) = params.get("totalMarks").and_then(|v| v.as_f64()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing totalMarks".to_string(),
            details: None,
        });
    };
    if total_marks <= 0.0 {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "totalMarks must be positive".to_string(),
            details: Some(json!({ "totalMarks": total_marks })),
        });
    }
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

    let mut parsed: Vec<(String, f64)> = Vec::new();
    for entry in entries {
        let Some(student_id) = entry.get("studentId").and_then(|v| v.as_str()) else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "entry missing studentId".to_string(),
                details: None,
            });
        };
        let Some(marks) = entry.get("marks").and_then(|v| v.as_f64()) else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "entry missing marks".to_string(),
                details: None,
            });
        };
        if marks < 0.0 || marks > total_marks {
            return Err(HandlerErr {
                code: "validation_failed",
                message: "marks must be between 0 and totalMarks".to_string(),
                details: Some(json!({ "studentId": student_id, "marks": marks })),
            });
        }
        parsed.push((student_id.to_string(), marks));
    }

    let exam_date_str = exam_date.format("%Y-%m-%d").to_string();
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let mut submitted = 0usize;
    for (student_id, marks) in parsed {
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
        // The stored letter is always recomputed from the raw percentage so
        // re-submission cannot leave a stale letter behind.
        let letter = calc::letter_grade(marks / total_marks * 100.0);
        tx.execute(
            "INSERT INTO grades(id, student_id, subject_id, exam_type, marks_obtained,
                                total_marks, grade_letter, exam_date, teacher_id)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, subject_id, exam_type) DO UPDATE SET
               marks_obtained = excluded.marks_obtained,
               total_marks = excluded.total_marks,
               grade_letter = excluded.grade_letter,
               exam_date = excluded.exam_date,
               teacher_id = excluded.teacher_id",
            (
                Uuid::new_v4().to_string(),
                &student_id,
                &subject_id,
                &exam_type,
                marks,
                total_marks,
                letter,
                &exam_date_str,
                &teacher_id,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "grades" })),
        })?;
        submitted += 1;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "submitted": submitted }))
}

fn grades_list_for_student(
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

    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.subject_id, sub.name, g.exam_type, g.marks_obtained,
                    g.total_marks, g.grade_letter, g.exam_date
             FROM grades g
             JOIN subjects sub ON sub.id = g.subject_id
             WHERE g.student_id = ?
             ORDER BY g.exam_date DESC, sub.name",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([&student_id], |r| {
            let obtained: f64 = r.get(4)?;
            let total: f64 = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subjectId": r.get::<_, String>(1)?,
                "subjectName": r.get::<_, String>(2)?,
                "examType": r.get::<_, String>(3)?,
                "marksObtained": obtained,
                "totalMarks": total,
                "percentage": if total > 0.0 { obtained / total * 100.0 } else { 0.0 },
                "gradeLetter": r.get::<_, String>(6)?,
                "examDate": r.get::<_, String>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "studentId": student_id, "grades": rows }))
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
        "grades.submit" => Some(handle(state, req, grades_submit)),
        "grades.listForStudent" => Some(handle(state, req, grades_list_for_student)),
        _ => None,
    }
}
