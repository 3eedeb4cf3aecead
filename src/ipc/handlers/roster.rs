use crate::auth;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    authenticate, get_opt_i64, get_opt_str, get_required_str, require_admin, require_role,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn username_taken(conn: &Connection, username: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM users WHERE username = ? OR email = ?",
        (username, username),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

/// Inserts the account row for a profile. Callers run this inside their own
/// transaction so profile and account land together. Returns the generated
/// initial password when none was supplied.
fn insert_user(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    params: &serde_json::Value,
    role: &str,
) -> Result<Option<String>, HandlerErr> {
    let email = get_required_str(params, "email")?;
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;

    let supplied = get_opt_str(params, "password");
    let generated = if supplied.is_none() {
        Some(Uuid::new_v4().simple().to_string())
    } else {
        None
    };
    let password = supplied
        .clone()
        .or_else(|| generated.clone())
        .unwrap_or_default();

    tx.execute(
        "INSERT INTO users(id, username, email, password_hash, role, first_name, last_name,
                           phone, address, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            user_id,
            &email,
            &email,
            auth::hash_password(&password),
            role,
            &first_name,
            &last_name,
            get_opt_str(params, "phone"),
            get_opt_str(params, "address"),
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "users" })),
    })?;

    Ok(generated)
}

fn update_user_fields(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    params: &serde_json::Value,
) -> Result<(), HandlerErr> {
    let existing: Option<(String, String, String, Option<String>, Option<String>)> = tx
        .query_row(
            "SELECT email, first_name, last_name, phone, address FROM users WHERE id = ?",
            [user_id],
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
    let Some((email, first, last, phone, address)) = existing else {
        return Err(HandlerErr {
            code: "not_found",
            message: "user not found".to_string(),
            details: None,
        });
    };

    let new_email = get_opt_str(params, "email").unwrap_or(email);
    tx.execute(
        "UPDATE users SET email = ?, username = ?, first_name = ?, last_name = ?,
                phone = ?, address = ?
         WHERE id = ?",
        (
            &new_email,
            &new_email,
            get_opt_str(params, "firstName").unwrap_or(first),
            get_opt_str(params, "lastName").unwrap_or(last),
            get_opt_str(params, "phone").or(phone),
            get_opt_str(params, "address").or(address),
            user_id,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "users" })),
    })?;
    Ok(())
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let identity = authenticate(conn, params)?;

    let (filter_sql, filter_arg): (&str, Option<String>) = match identity.role.as_str() {
        auth::ROLE_ADMIN | auth::ROLE_TEACHER => match get_opt_str(params, "classId") {
            Some(class_id) => (" WHERE s.class_id = ?", Some(class_id)),
            None => ("", None),
        },
        auth::ROLE_STUDENT => (" WHERE u.id = ?", Some(identity.user_id.clone())),
        _ => (" WHERE s.parent_user_id = ?", Some(identity.user_id.clone())),
    };

    let sql = format!(
        "SELECT s.id, s.student_no, u.last_name, u.first_name, u.email, s.class_id,
                c.name, s.date_of_birth, s.gender, s.admission_date, s.parent_user_id
         FROM students s
         JOIN users u ON u.id = s.user_id
         LEFT JOIN school_classes c ON c.id = s.class_id{}
         ORDER BY u.last_name, u.first_name",
        filter_sql
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;

    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        let last: String = r.get(2)?;
        let first: String = r.get(3)?;
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "studentNo": r.get::<_, String>(1)?,
            "displayName": format!("{}, {}", last, first),
            "email": r.get::<_, String>(4)?,
            "classId": r.get::<_, Option<String>>(5)?,
            "className": r.get::<_, Option<String>>(6)?,
            "dateOfBirth": r.get::<_, Option<String>>(7)?,
            "gender": r.get::<_, Option<String>>(8)?,
            "admissionDate": r.get::<_, Option<String>>(9)?,
            "parentUserId": r.get::<_, Option<String>>(10)?
        }))
    };
    let rows = match filter_arg {
        Some(arg) => stmt.query_map([arg], map_row),
        None => stmt.query_map([], map_row),
    }
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "students": rows }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let student_no = get_required_str(params, "studentNo")?;
    let email = get_required_str(params, "email")?;
    if username_taken(conn, &email)? {
        return Err(HandlerErr {
            code: "conflict",
            message: "a user with this email already exists".to_string(),
            details: Some(json!({ "email": email })),
        });
    }

    if let Some(class_id) = get_opt_str(params, "classId") {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM school_classes WHERE id = ?", [&class_id], |r| r.get(0))
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        if exists.is_none() {
            return Err(HandlerErr {
                code: "not_found",
                message: "class not found".to_string(),
                details: None,
            });
        }
    }
    if let Some(parent_id) = get_opt_str(params, "parentUserId") {
        let role: Option<String> = conn
            .query_row("SELECT role FROM users WHERE id = ?", [&parent_id], |r| r.get(0))
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        match role.as_deref() {
            Some("parent") => {}
            Some(_) => {
                return Err(HandlerErr {
                    code: "validation_failed",
                    message: "parentUserId must reference a parent account".to_string(),
                    details: None,
                })
            }
            None => {
                return Err(HandlerErr {
                    code: "not_found",
                    message: "parent user not found".to_string(),
                    details: None,
                })
            }
        }
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let user_id = Uuid::new_v4().to_string();
    let student_id = Uuid::new_v4().to_string();
    let initial_password = insert_user(&tx, &user_id, params, auth::ROLE_STUDENT)?;
    if let Err(e) = tx.execute(
        "INSERT INTO students(id, user_id, student_no, class_id, date_of_birth, gender,
                              admission_date, parent_user_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &user_id,
            &student_no,
            get_opt_str(params, "classId"),
            get_opt_str(params, "dateOfBirth"),
            get_opt_str(params, "gender"),
            get_opt_str(params, "admissionDate"),
            get_opt_str(params, "parentUserId"),
        ),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "students" })),
        });
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut result = json!({ "studentId": student_id, "userId": user_id });
    if let Some(p) = initial_password {
        result["initialPassword"] = json!(p);
    }
    Ok(result)
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;

    let row: Option<(String, Option<String>, Option<String>, Option<String>, Option<String>)> =
        conn.query_row(
            "SELECT user_id, class_id, date_of_birth, gender, parent_user_id
             FROM students WHERE id = ?",
            [&student_id],
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
    let Some((user_id, class_id, dob, gender, parent_user_id)) = row else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    };

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    if let Err(e) = update_user_fields(&tx, &user_id, params) {
        let _ = tx.rollback();
        return Err(e);
    }
    if let Err(e) = tx.execute(
        "UPDATE students SET class_id = ?, date_of_birth = ?, gender = ?, parent_user_id = ?
         WHERE id = ?",
        (
            get_opt_str(params, "classId").or(class_id),
            get_opt_str(params, "dateOfBirth").or(dob),
            get_opt_str(params, "gender").or(gender),
            get_opt_str(params, "parentUserId").or(parent_user_id),
            &student_id,
        ),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "students" })),
        });
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true }))
}

fn students_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;

    let user_id: Option<String> = conn
        .query_row("SELECT user_id FROM students WHERE id = ?", [&student_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(user_id) = user_id else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    };

    let open_loans: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM loans WHERE student_id = ? AND status = 'issued'",
            [&student_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if open_loans > 0 {
        return Err(HandlerErr {
            code: "conflict",
            message: format!("student still has {} unreturned loans", open_loans),
            details: Some(json!({ "openLoans": open_loans })),
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    for (sql, table) in [
        ("DELETE FROM attendance WHERE student_id = ?", "attendance"),
        ("DELETE FROM grades WHERE student_id = ?", "grades"),
        ("DELETE FROM fees WHERE student_id = ?", "fees"),
        ("DELETE FROM loans WHERE student_id = ?", "loans"),
        ("DELETE FROM students WHERE id = ?", "students"),
    ] {
        if let Err(e) = tx.execute(sql, [&student_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_delete_failed",
                message: e.to_string(),
                details: Some(json!({ "table": table })),
            });
        }
    }
    for (sql, table) in [
        ("DELETE FROM sessions WHERE user_id = ?", "sessions"),
        ("DELETE FROM users WHERE id = ?", "users"),
    ] {
        if let Err(e) = tx.execute(sql, [&user_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_delete_failed",
                message: e.to_string(),
                details: Some(json!({ "table": table })),
            });
        }
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true }))
}

fn teachers_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let identity = authenticate(conn, params)?;
    require_role(&identity, &[auth::ROLE_ADMIN, auth::ROLE_TEACHER])?;

    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.teacher_no, u.last_name, u.first_name, u.email,
                    t.specialization, t.qualification, t.experience_years, t.hire_date
             FROM teachers t
             JOIN users u ON u.id = t.user_id
             ORDER BY u.last_name, u.first_name",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([], |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "teacherNo": r.get::<_, String>(1)?,
                "displayName": format!("{}, {}", last, first),
                "email": r.get::<_, String>(4)?,
                "specialization": r.get::<_, Option<String>>(5)?,
                "qualification": r.get::<_, Option<String>>(6)?,
                "experienceYears": r.get::<_, Option<i64>>(7)?,
                "hireDate": r.get::<_, Option<String>>(8)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "teachers": rows }))
}

fn teachers_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let teacher_no = get_required_str(params, "teacherNo")?;
    let email = get_required_str(params, "email")?;
    if username_taken(conn, &email)? {
        return Err(HandlerErr {
            code: "conflict",
            message: "a user with this email already exists".to_string(),
            details: Some(json!({ "email": email })),
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let user_id = Uuid::new_v4().to_string();
    let teacher_id = Uuid::new_v4().to_string();
    let initial_password = insert_user(&tx, &user_id, params, auth::ROLE_TEACHER)?;
    if let Err(e) = tx.execute(
        "INSERT INTO teachers(id, user_id, teacher_no, specialization, qualification,
                              experience_years, salary_cents, hire_date)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &teacher_id,
            &user_id,
            &teacher_no,
            get_opt_str(params, "specialization"),
            get_opt_str(params, "qualification"),
            get_opt_i64(params, "experienceYears"),
            get_opt_i64(params, "salaryCents"),
            get_opt_str(params, "hireDate"),
        ),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "teachers" })),
        });
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut result = json!({ "teacherId": teacher_id, "userId": user_id });
    if let Some(p) = initial_password {
        result["initialPassword"] = json!(p);
    }
    Ok(result)
}

fn teachers_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let teacher_id = get_required_str(params, "teacherId")?;

    let row: Option<(String, Option<String>, Option<String>, Option<i64>, Option<String>)> = conn
        .query_row(
            "SELECT user_id, specialization, qualification, experience_years, hire_date
             FROM teachers WHERE id = ?",
            [&teacher_id],
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
    let Some((user_id, specialization, qualification, experience, hire_date)) = row else {
        return Err(HandlerErr {
            code: "not_found",
            message: "teacher not found".to_string(),
            details: None,
        });
    };

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    if let Err(e) = update_user_fields(&tx, &user_id, params) {
        let _ = tx.rollback();
        return Err(e);
    }
    if let Err(e) = tx.execute(
        "UPDATE teachers SET specialization = ?, qualification = ?, experience_years = ?,
                hire_date = ?
         WHERE id = ?",
        (
            get_opt_str(params, "specialization").or(specialization),
            get_opt_str(params, "qualification").or(qualification),
            get_opt_i64(params, "experienceYears").or(experience),
            get_opt_str(params, "hireDate").or(hire_date),
            &teacher_id,
        ),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "teachers" })),
        });
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true }))
}

fn teachers_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let teacher_id = get_required_str(params, "teacherId")?;

    let user_id: Option<String> = conn
        .query_row("SELECT user_id FROM teachers WHERE id = ?", [&teacher_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(user_id) = user_id else {
        return Err(HandlerErr {
            code: "not_found",
            message: "teacher not found".to_string(),
            details: None,
        });
    };

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    // Authored records stay but lose their author; assignments and slots go.
    for (sql, table) in [
        ("UPDATE grades SET teacher_id = NULL WHERE teacher_id = ?", "grades"),
        ("UPDATE attendance SET marked_by = NULL WHERE marked_by = ?", "attendance"),
        ("UPDATE school_classes SET class_teacher_id = NULL WHERE class_teacher_id = ?", "school_classes"),
        ("DELETE FROM timetable_slots WHERE teacher_id = ?", "timetable_slots"),
        ("DELETE FROM teacher_subjects WHERE teacher_id = ?", "teacher_subjects"),
        ("DELETE FROM teachers WHERE id = ?", "teachers"),
    ] {
        if let Err(e) = tx.execute(sql, [&teacher_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_delete_failed",
                message: e.to_string(),
                details: Some(json!({ "table": table })),
            });
        }
    }
    for (sql, table) in [
        ("DELETE FROM sessions WHERE user_id = ?", "sessions"),
        ("DELETE FROM users WHERE id = ?", "users"),
    ] {
        if let Err(e) = tx.execute(sql, [&user_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_delete_failed",
                message: e.to_string(),
                details: Some(json!({ "table": table })),
            });
        }
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true }))
}

fn parents_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let email = get_required_str(params, "email")?;
    if username_taken(conn, &email)? {
        return Err(HandlerErr {
            code: "conflict",
            message: "a user with this email already exists".to_string(),
            details: Some(json!({ "email": email })),
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let user_id = Uuid::new_v4().to_string();
    let initial_password = insert_user(&tx, &user_id, params, auth::ROLE_PARENT)?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut result = json!({ "userId": user_id });
    if let Some(p) = initial_password {
        result["initialPassword"] = json!(p);
    }
    Ok(result)
}

fn teachers_assign_subject(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let class_id = get_required_str(params, "classId")?;

    for (table, id) in [
        ("teachers", &teacher_id),
        ("subjects", &subject_id),
        ("school_classes", &class_id),
    ] {
        let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
        let exists: Option<i64> = conn
            .query_row(&sql, [id], |r| r.get(0))
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        if exists.is_none() {
            return Err(HandlerErr {
                code: "not_found",
                message: format!("{} row not found", table),
                details: Some(json!({ "id": id })),
            });
        }
    }

    let assignment_id = Uuid::new_v4().to_string();
    let inserted = conn
        .execute(
            "INSERT INTO teacher_subjects(id, teacher_id, subject_id, class_id)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(teacher_id, subject_id, class_id) DO NOTHING",
            (&assignment_id, &teacher_id, &subject_id, &class_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "teacher_subjects" })),
        })?;
    if inserted == 0 {
        return Err(HandlerErr {
            code: "conflict",
            message: "assignment already exists".to_string(),
            details: None,
        });
    }

    Ok(json!({ "assignmentId": assignment_id }))
}

fn teachers_assignments(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let identity = authenticate(conn, params)?;
    require_role(&identity, &[auth::ROLE_ADMIN, auth::ROLE_TEACHER])?;
    let teacher_id = get_required_str(params, "teacherId")?;

    let mut stmt = conn
        .prepare(
            "SELECT ts.id, ts.subject_id, sub.name, ts.class_id, c.name
             FROM teacher_subjects ts
             JOIN subjects sub ON sub.id = ts.subject_id
             JOIN school_classes c ON c.id = ts.class_id
             WHERE ts.teacher_id = ?
             ORDER BY c.name, sub.name",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([&teacher_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subjectId": r.get::<_, String>(1)?,
                "subjectName": r.get::<_, String>(2)?,
                "classId": r.get::<_, String>(3)?,
                "className": r.get::<_, String>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "assignments": rows }))
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
        "students.list" => Some(handle(state, req, students_list)),
        "students.create" => Some(handle(state, req, students_create)),
        "students.update" => Some(handle(state, req, students_update)),
        "students.delete" => Some(handle(state, req, students_delete)),
        "teachers.list" => Some(handle(state, req, teachers_list)),
        "teachers.create" => Some(handle(state, req, teachers_create)),
        "teachers.update" => Some(handle(state, req, teachers_update)),
        "teachers.delete" => Some(handle(state, req, teachers_delete)),
        "teachers.assignSubject" => Some(handle(state, req, teachers_assign_subject)),
        "teachers.assignments" => Some(handle(state, req, teachers_assignments)),
        "parents.create" => Some(handle(state, req, parents_create)),
        _ => None,
    }
}
