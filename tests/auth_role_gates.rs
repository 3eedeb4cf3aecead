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

fn login(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    username: &str,
    password: &str,
) -> String {
    let result = request_ok(
        stdin,
        reader,
        id,
        "auth.login",
        json!({ "username": username, "password": password }),
    );
    result
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string()
}

fn seed_workspace(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) {
    let _ = request_ok(
        stdin,
        reader,
        "w1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(stdin, reader, "w2", "workspace.seedDemo", json!({}));
}

#[test]
fn login_failures_and_session_lifecycle() {
    let workspace = temp_dir("schoolhub-auth-lifecycle");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_workspace(&mut stdin, &mut reader, &workspace);

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "1",
        "auth.login",
        json!({ "username": "admin@school.example", "password": "wrong" }),
    );
    assert_eq!(code, "unauthenticated");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "2",
        "auth.login",
        json!({ "username": "nobody@school.example", "password": "admin123" }),
    );
    assert_eq!(code, "unauthenticated");

    let token = login(
        &mut stdin,
        &mut reader,
        "3",
        "admin@school.example",
        "admin123",
    );
    let who = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.whoami",
        json!({ "token": token }),
    );
    assert_eq!(
        who.get("user").and_then(|u| u.get("role")).and_then(|v| v.as_str()),
        Some("admin")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "auth.logout",
        json!({ "token": token }),
    );
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "6",
        "auth.whoami",
        json!({ "token": token }),
    );
    assert_eq!(code, "unauthenticated");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "7",
        "auth.logout",
        json!({ "token": token }),
    );
    assert_eq!(code, "unauthenticated");

    // Requests without any token never pass the gate.
    let code = request_err_code(&mut stdin, &mut reader, "8", "books.list", json!({}));
    assert_eq!(code, "unauthenticated");
}

#[test]
fn mutations_are_admin_only() {
    let workspace = temp_dir("schoolhub-auth-admin-only");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_workspace(&mut stdin, &mut reader, &workspace);
    let student_token = login(
        &mut stdin,
        &mut reader,
        "1",
        "student1@school.example",
        "student123",
    );
    let teacher_token = login(
        &mut stdin,
        &mut reader,
        "2",
        "teacher1@school.example",
        "teacher123",
    );

    // Catalog, circulation and fee mutation: admin only, for every
    // non-admin role including teachers.
    for (i, (token, method, params)) in [
        (
            &student_token,
            "books.create",
            json!({ "title": "X", "author": "Y" }),
        ),
        (
            &teacher_token,
            "books.create",
            json!({ "title": "X", "author": "Y" }),
        ),
        (
            &student_token,
            "library.issue",
            json!({ "bookId": "b", "studentId": "s", "issueDate": "2024-01-01", "dueDate": "2024-01-02" }),
        ),
        (
            &teacher_token,
            "library.return",
            json!({ "loanId": "l" }),
        ),
        (
            &student_token,
            "fees.pay",
            json!({ "feeId": "f", "method": "online" }),
        ),
        (
            &teacher_token,
            "fees.create",
            json!({ "studentId": "s", "category": "c", "amountCents": 100, "dueDate": "2024-01-01", "academicYear": "2023-2024" }),
        ),
        (
            &student_token,
            "students.delete",
            json!({ "studentId": "s" }),
        ),
    ]
    .into_iter()
    .enumerate()
    {
        let mut p = params.clone();
        p["token"] = json!(token);
        let code = request_err_code(
            &mut stdin,
            &mut reader,
            &format!("gate-{}", i),
            method,
            p,
        );
        assert_eq!(code, "forbidden", "{} should be admin-only", method);
    }

    // Attendance and grades are teacher verbs; students are rejected.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({
            "token": student_token,
            "date": "2024-01-10",
            "subjectId": "s",
            "entries": []
        }),
    );
    assert_eq!(code, "forbidden");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "4",
        "grades.submit",
        json!({
            "token": student_token,
            "subjectId": "s",
            "examType": "quiz",
            "examDate": "2024-01-10",
            "totalMarks": 10,
            "entries": []
        }),
    );
    assert_eq!(code, "forbidden");
}

#[test]
fn self_scoped_reads_for_students_and_parents() {
    let workspace = temp_dir("schoolhub-auth-scopes");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_workspace(&mut stdin, &mut reader, &workspace);
    let admin_token = login(
        &mut stdin,
        &mut reader,
        "1",
        "admin@school.example",
        "admin123",
    );
    let student_token = login(
        &mut stdin,
        &mut reader,
        "2",
        "student1@school.example",
        "student123",
    );
    let parent_token = login(
        &mut stdin,
        &mut reader,
        "3",
        "parent1@school.example",
        "parent123",
    );

    // Find Alice (S001, linked to the demo parent) and Bob (S002).
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.list",
        json!({ "token": admin_token }),
    );
    let students = listed.get("students").and_then(|v| v.as_array()).unwrap();
    let id_of = |no: &str| -> String {
        students
            .iter()
            .find(|r| r.get("studentNo").and_then(|v| v.as_str()) == Some(no))
            .and_then(|r| r.get("id"))
            .and_then(|v| v.as_str())
            .expect("student id")
            .to_string()
    };
    let alice = id_of("S001");
    let bob = id_of("S002");

    // The demo seed gives both Alice and Bob pending fees. Each sees only
    // their own rows without naming a studentId.
    let own = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "fees.list",
        json!({ "token": student_token }),
    );
    let own_rows = own.get("fees").and_then(|v| v.as_array()).unwrap();
    assert!(!own_rows.is_empty(), "Alice has seeded fees");
    assert!(own_rows
        .iter()
        .all(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(alice.as_str())));

    // Alice cannot read Bob's records.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "6",
        "fees.list",
        json!({ "token": student_token, "studentId": bob }),
    );
    assert_eq!(code, "forbidden");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "7",
        "grades.listForStudent",
        json!({ "token": student_token, "studentId": bob }),
    );
    assert_eq!(code, "forbidden");

    // The parent reads Alice (their child) but not Bob.
    let child_fees = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "fees.list",
        json!({ "token": parent_token, "studentId": alice }),
    );
    assert!(!child_fees
        .get("fees")
        .and_then(|v| v.as_array())
        .unwrap()
        .is_empty());
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "9",
        "fees.list",
        json!({ "token": parent_token, "studentId": bob }),
    );
    assert_eq!(code, "forbidden");

    // Parent's unfiltered listing covers exactly their children.
    let unfiltered = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "fees.list",
        json!({ "token": parent_token }),
    );
    assert!(unfiltered
        .get("fees")
        .and_then(|v| v.as_array())
        .unwrap()
        .iter()
        .all(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(alice.as_str())));
}

#[test]
fn seeding_is_fresh_workspace_only() {
    let workspace = temp_dir("schoolhub-auth-seed-once");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_workspace(&mut stdin, &mut reader, &workspace);

    let code = request_err_code(&mut stdin, &mut reader, "1", "workspace.seedDemo", json!({}));
    assert_eq!(code, "conflict");
}
