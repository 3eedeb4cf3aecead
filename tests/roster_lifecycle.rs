use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoolhubd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoolhubd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

fn setup(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "w1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(stdin, reader, "w2", "workspace.seedDemo", json!({}));
    let login = request_ok(
        stdin,
        reader,
        "w3",
        "auth.login",
        json!({ "username": "admin@school.example", "password": "admin123" }),
    );
    login
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string()
}

#[test]
fn student_create_login_and_delete_guard() {
    let workspace = temp_dir("schoolhub-roster-students");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let token = setup(&mut stdin, &mut reader, &workspace);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({
            "token": token,
            "studentNo": "S900",
            "email": "dana@school.example",
            "firstName": "Dana",
            "lastName": "West"
        }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let initial_password = created
        .get("initialPassword")
        .and_then(|v| v.as_str())
        .expect("a generated initial password")
        .to_string();

    // The generated credentials work immediately.
    let login = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.login",
        json!({ "username": "dana@school.example", "password": initial_password }),
    );
    assert_eq!(
        login
            .get("user")
            .and_then(|u| u.get("role"))
            .and_then(|v| v.as_str()),
        Some("student")
    );

    // Duplicate email is rejected before any row is written.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "token": token,
            "studentNo": "S901",
            "email": "dana@school.example",
            "firstName": "Other",
            "lastName": "Dana"
        }),
    );
    assert_eq!(code, "conflict");

    // An unreturned loan blocks deletion.
    let book = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "books.create",
        json!({ "token": token, "title": "Keeper", "author": "H. Older", "totalCopies": 1 }),
    );
    let book_id = book
        .get("bookId")
        .and_then(|v| v.as_str())
        .expect("bookId")
        .to_string();
    let issued = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "library.issue",
        json!({
            "token": token,
            "bookId": book_id,
            "studentId": student_id,
            "issueDate": "2024-01-02",
            "dueDate": "2024-01-16"
        }),
    );
    let loan_id = issued
        .get("loanId")
        .and_then(|v| v.as_str())
        .expect("loanId")
        .to_string();

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "6",
        "students.delete",
        json!({ "token": token, "studentId": student_id }),
    );
    assert_eq!(code, "conflict");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "library.return",
        json!({ "token": token, "loanId": loan_id, "returnDate": "2024-01-10" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.delete",
        json!({ "token": token, "studentId": student_id }),
    );

    // The account went with the profile.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "9",
        "auth.login",
        json!({ "username": "dana@school.example", "password": initial_password }),
    );
    assert_eq!(code, "unauthenticated");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "10",
        "students.delete",
        json!({ "token": token, "studentId": student_id }),
    );
    assert_eq!(code, "not_found");
}

#[test]
fn teacher_assignments_and_deletion() {
    let workspace = temp_dir("schoolhub-roster-teachers");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let token = setup(&mut stdin, &mut reader, &workspace);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "teachers.create",
        json!({
            "token": token,
            "teacherNo": "T900",
            "email": "newteacher@school.example",
            "firstName": "Nina",
            "lastName": "Velez",
            "specialization": "Science",
            "password": "nina-secret"
        }),
    );
    let teacher_id = created
        .get("teacherId")
        .and_then(|v| v.as_str())
        .expect("teacherId")
        .to_string();
    assert!(
        created.get("initialPassword").is_none(),
        "no generated password when one is supplied"
    );

    let subjects = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.list",
        json!({ "token": token }),
    );
    let subject_id = subjects
        .get("subjects")
        .and_then(|v| v.as_array())
        .and_then(|rows| rows.first())
        .and_then(|r| r.get("id"))
        .and_then(|v| v.as_str())
        .expect("subject")
        .to_string();
    let classes = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.list",
        json!({ "token": token }),
    );
    let class_id = classes
        .get("classes")
        .and_then(|v| v.as_array())
        .and_then(|rows| rows.first())
        .and_then(|r| r.get("id"))
        .and_then(|v| v.as_str())
        .expect("class")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.assignSubject",
        json!({
            "token": token,
            "teacherId": teacher_id,
            "subjectId": subject_id,
            "classId": class_id
        }),
    );
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.assignSubject",
        json!({
            "token": token,
            "teacherId": teacher_id,
            "subjectId": subject_id,
            "classId": class_id
        }),
    );
    assert_eq!(code, "conflict");

    let assignments = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "teachers.assignments",
        json!({ "token": token, "teacherId": teacher_id }),
    );
    assert_eq!(
        assignments
            .get("assignments")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "teachers.delete",
        json!({ "token": token, "teacherId": teacher_id }),
    );
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "8",
        "auth.login",
        json!({ "username": "newteacher@school.example", "password": "nina-secret" }),
    );
    assert_eq!(code, "unauthenticated");
}

#[test]
fn class_delete_guard_and_subject_cascade() {
    let workspace = temp_dir("schoolhub-roster-classes");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let token = setup(&mut stdin, &mut reader, &workspace);

    // The seeded Grade 1-A class has students; it cannot be deleted.
    let classes = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "classes.list",
        json!({ "token": token }),
    );
    let populated = classes
        .get("classes")
        .and_then(|v| v.as_array())
        .and_then(|rows| {
            rows.iter().find(|r| {
                r.get("studentCount").and_then(|v| v.as_i64()).unwrap_or(0) > 0
            })
        })
        .and_then(|r| r.get("id"))
        .and_then(|v| v.as_str())
        .expect("populated class")
        .to_string();
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "2",
        "classes.delete",
        json!({ "token": token, "classId": populated }),
    );
    assert_eq!(code, "conflict");

    // An empty class deletes cleanly.
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({
            "token": token,
            "name": "Grade 9-Z",
            "gradeLevel": 9,
            "academicYear": "2024-2025"
        }),
    );
    let empty_class = created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.delete",
        json!({ "token": token, "classId": empty_class }),
    );

    // Subject deletion sweeps attendance/grades/timetable references.
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.create",
        json!({ "token": token, "name": "Latin", "code": "LAT101" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.create",
        json!({ "token": token, "name": "Latin II", "code": "LAT101" }),
    );
    assert_eq!(code, "conflict");

    let teacher_token = {
        let login = request_ok(
            &mut stdin,
            &mut reader,
            "7",
            "auth.login",
            json!({ "username": "teacher1@school.example", "password": "teacher123" }),
        );
        login
            .get("token")
            .and_then(|v| v.as_str())
            .expect("token")
            .to_string()
    };
    let students = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.list",
        json!({ "token": token }),
    );
    let any_student = students
        .get("students")
        .and_then(|v| v.as_array())
        .and_then(|rows| rows.first())
        .and_then(|r| r.get("id"))
        .and_then(|v| v.as_str())
        .expect("student")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.mark",
        json!({
            "token": teacher_token,
            "date": "2024-09-12",
            "subjectId": subject_id,
            "entries": [ { "studentId": any_student, "status": "present" } ]
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "subjects.delete",
        json!({ "token": token, "subjectId": subject_id }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.listForStudent",
        json!({ "token": token, "studentId": any_student }),
    );
    let leftover = listed
        .get("attendance")
        .and_then(|v| v.as_array())
        .map(|rows| {
            rows.iter()
                .any(|r| r.get("subjectId").and_then(|v| v.as_str()) == Some(subject_id.as_str()))
        })
        .unwrap_or(true);
    assert!(!leftover, "subject cascade must remove its attendance");
}
