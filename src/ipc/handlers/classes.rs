use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{authenticate, get_opt_i64, get_opt_str, require_admin};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(e) = authenticate(conn, &req.params) {
        return e.response(&req.id);
    }

    // Include basic counts so the UI can show a useful dashboard.
    // Use correlated subqueries to avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.grade_level,
           c.section,
           c.academic_year,
           c.max_students,
           c.class_teacher_id,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM timetable_slots t WHERE t.class_id = c.id) AS slot_count
         FROM school_classes c
         ORDER BY c.grade_level, c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "gradeLevel": row.get::<_, i64>(2)?,
                "section": row.get::<_, Option<String>>(3)?,
                "academicYear": row.get::<_, String>(4)?,
                "maxStudents": row.get::<_, i64>(5)?,
                "classTeacherId": row.get::<_, Option<String>>(6)?,
                "studentCount": row.get::<_, i64>(7)?,
                "slotCount": row.get::<_, i64>(8)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(e) = require_admin(conn, &req.params) {
        return e.response(&req.id);
    }

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let Some(grade_level) = get_opt_i64(&req.params, "gradeLevel") else {
        return err(&req.id, "bad_params", "missing gradeLevel", None);
    };
    let Some(academic_year) = get_opt_str(&req.params, "academicYear") else {
        return err(&req.id, "bad_params", "missing academicYear", None);
    };

    if let Some(teacher_id) = get_opt_str(&req.params, "classTeacherId") {
        let exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM teachers WHERE id = ?", [&teacher_id], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_none() {
            return err(&req.id, "not_found", "class teacher not found", None);
        }
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO school_classes(id, name, grade_level, section, academic_year,
                                    class_teacher_id, max_students)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &class_id,
            &name,
            grade_level,
            get_opt_str(&req.params, "section"),
            &academic_year,
            get_opt_str(&req.params, "classTeacherId"),
            get_opt_i64(&req.params, "maxStudents").unwrap_or(30),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "school_classes" })),
        );
    }

    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(e) = require_admin(conn, &req.params) {
        return e.response(&req.id);
    }

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let existing: Option<(String, i64, Option<String>, String, Option<String>, i64)> = match conn
        .query_row(
            "SELECT name, grade_level, section, academic_year, class_teacher_id, max_students
             FROM school_classes WHERE id = ?",
            [&class_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((name, grade_level, section, academic_year, class_teacher_id, max_students)) =
        existing
    else {
        return err(&req.id, "not_found", "class not found", None);
    };

    if let Err(e) = conn.execute(
        "UPDATE school_classes SET name = ?, grade_level = ?, section = ?, academic_year = ?,
                class_teacher_id = ?, max_students = ?
         WHERE id = ?",
        (
            get_opt_str(&req.params, "name").unwrap_or(name),
            get_opt_i64(&req.params, "gradeLevel").unwrap_or(grade_level),
            get_opt_str(&req.params, "section").or(section),
            get_opt_str(&req.params, "academicYear").unwrap_or(academic_year),
            get_opt_str(&req.params, "classTeacherId").or(class_teacher_id),
            get_opt_i64(&req.params, "maxStudents").unwrap_or(max_students),
            &class_id,
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "school_classes" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(e) = require_admin(conn, &req.params) {
        return e.response(&req.id);
    }

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM school_classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let enrolled: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if enrolled > 0 {
        return err(
            &req.id,
            "conflict",
            format!("class has {} students enrolled", enrolled),
            Some(json!({ "studentCount": enrolled })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM teacher_subjects WHERE class_id = ?",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "teacher_subjects" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM timetable_slots WHERE class_id = ?",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "timetable_slots" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM school_classes WHERE id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "school_classes" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
