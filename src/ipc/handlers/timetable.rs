use crate::auth;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    authenticate, get_opt_str, get_required_str, require_admin, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const WEEKDAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

fn parse_time(raw: &str, key: &str) -> Result<NaiveTime, HandlerErr> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|_| HandlerErr {
        code: "bad_params",
        message: format!("{} must be HH:MM", key),
        details: Some(json!({ "value": raw })),
    })
}

fn add_slot(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let day_of_week = get_required_str(params, "dayOfWeek")?.to_ascii_lowercase();
    let start_raw = get_required_str(params, "startTime")?;
    let end_raw = get_required_str(params, "endTime")?;

    if !WEEKDAYS.contains(&day_of_week.as_str()) {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "dayOfWeek must be a weekday name".to_string(),
            details: Some(json!({ "dayOfWeek": day_of_week })),
        });
    }
    let start = parse_time(&start_raw, "startTime")?;
    let end = parse_time(&end_raw, "endTime")?;
    if end <= start {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "endTime must be after startTime".to_string(),
            details: Some(json!({ "startTime": start_raw, "endTime": end_raw })),
        });
    }

    for (table, id) in [
        ("school_classes", &class_id),
        ("subjects", &subject_id),
        ("teachers", &teacher_id),
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

    let slot_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO timetable_slots(id, class_id, subject_id, teacher_id, day_of_week,
                                     start_time, end_time, room)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &slot_id,
            &class_id,
            &subject_id,
            &teacher_id,
            &day_of_week,
            start.format("%H:%M").to_string(),
            end.format("%H:%M").to_string(),
            get_opt_str(params, "room"),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "timetable_slots" })),
    })?;

    Ok(json!({ "slotId": slot_id }))
}

fn delete_slot(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let _admin = require_admin(conn, params)?;
    let slot_id = get_required_str(params, "slotId")?;

    let removed = conn
        .execute("DELETE FROM timetable_slots WHERE id = ?", [&slot_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "timetable_slots" })),
        })?;
    if removed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "slot not found".to_string(),
            details: None,
        });
    }

    Ok(json!({ "ok": true }))
}

fn for_class(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let identity = authenticate(conn, params)?;
    let class_id = get_required_str(params, "classId")?;

    // Students and parents only see timetables for their own class(es).
    match identity.role.as_str() {
        auth::ROLE_ADMIN | auth::ROLE_TEACHER => {}
        auth::ROLE_STUDENT | auth::ROLE_PARENT => {
            let owner_col = if identity.role == auth::ROLE_STUDENT {
                "user_id"
            } else {
                "parent_user_id"
            };
            let sql = format!(
                "SELECT 1 FROM students WHERE class_id = ? AND {} = ?",
                owner_col
            );
            let visible = conn
                .query_row(&sql, (&class_id, &identity.user_id), |r| {
                    r.get::<_, i64>(0)
                })
                .optional()
                .map_err(|e| HandlerErr {
                    code: "db_query_failed",
                    message: e.to_string(),
                    details: None,
                })?
                .is_some();
            if !visible {
                return Err(HandlerErr {
                    code: "forbidden",
                    message: "not allowed to read this class timetable".to_string(),
                    details: None,
                });
            }
        }
        _ => {
            return Err(HandlerErr {
                code: "forbidden",
                message: "role cannot read timetables".to_string(),
                details: None,
            })
        }
    }

    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.day_of_week, t.start_time, t.end_time, t.room,
                    t.subject_id, sub.name, t.teacher_id, u.last_name, u.first_name
             FROM timetable_slots t
             JOIN subjects sub ON sub.id = t.subject_id
             JOIN teachers te ON te.id = t.teacher_id
             JOIN users u ON u.id = te.user_id
             WHERE t.class_id = ?
             ORDER BY
               CASE t.day_of_week
                 WHEN 'monday' THEN 0 WHEN 'tuesday' THEN 1 WHEN 'wednesday' THEN 2
                 WHEN 'thursday' THEN 3 WHEN 'friday' THEN 4 WHEN 'saturday' THEN 5
                 ELSE 6
               END,
               t.start_time",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([&class_id], |r| {
            let last: String = r.get(8)?;
            let first: String = r.get(9)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "dayOfWeek": r.get::<_, String>(1)?,
                "startTime": r.get::<_, String>(2)?,
                "endTime": r.get::<_, String>(3)?,
                "room": r.get::<_, Option<String>>(4)?,
                "subjectId": r.get::<_, String>(5)?,
                "subjectName": r.get::<_, String>(6)?,
                "teacherId": r.get::<_, String>(7)?,
                "teacherName": format!("{}, {}", last, first)
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "classId": class_id, "slots": rows }))
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
        "timetable.addSlot" => Some(handle(state, req, add_slot)),
        "timetable.deleteSlot" => Some(handle(state, req, delete_slot)),
        "timetable.forClass" => Some(handle(state, req, for_class)),
        _ => None,
    }
}
