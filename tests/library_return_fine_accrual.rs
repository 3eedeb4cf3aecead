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

fn student_by_no(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    token: &str,
    student_no: &str,
) -> String {
    let listed = request_ok(stdin, reader, "sl", "students.list", json!({ "token": token }));
    listed
        .get("students")
        .and_then(|v| v.as_array())
        .and_then(|rows| {
            rows.iter()
                .find(|r| r.get("studentNo").and_then(|v| v.as_str()) == Some(student_no))
        })
        .and_then(|r| r.get("id"))
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string()
}

fn issue(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    token: &str,
    book_id: &str,
    student_id: &str,
    issue_date: &str,
    due_date: &str,
) -> String {
    let issued = request_ok(
        stdin,
        reader,
        id,
        "library.issue",
        json!({
            "token": token,
            "bookId": book_id,
            "studentId": student_id,
            "issueDate": issue_date,
            "dueDate": due_date
        }),
    );
    issued
        .get("loanId")
        .and_then(|v| v.as_str())
        .expect("loanId")
        .to_string()
}

#[test]
fn fine_is_days_late_times_rate() {
    let workspace = temp_dir("schoolhub-fines");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let token = setup(&mut stdin, &mut reader, &workspace);
    let student = student_by_no(&mut stdin, &mut reader, &token, "S001");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "books.create",
        json!({ "token": token, "title": "Fine Print", "author": "A. Uthor", "totalCopies": 3 }),
    );
    let book_id = created
        .get("bookId")
        .and_then(|v| v.as_str())
        .expect("bookId")
        .to_string();

    // Five days late at the default $1/day.
    let loan = issue(
        &mut stdin, &mut reader, "2", &token, &book_id, &student, "2024-01-02", "2024-01-10",
    );
    let returned = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "library.return",
        json!({ "token": token, "loanId": loan, "returnDate": "2024-01-15" }),
    );
    assert_eq!(returned.get("fineCents").and_then(|v| v.as_i64()), Some(500));

    // Early return: zero, never negative.
    let loan = issue(
        &mut stdin, &mut reader, "4", &token, &book_id, &student, "2024-01-02", "2024-01-10",
    );
    let returned = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "library.return",
        json!({ "token": token, "loanId": loan, "returnDate": "2024-01-05" }),
    );
    assert_eq!(returned.get("fineCents").and_then(|v| v.as_i64()), Some(0));

    // Stored fines come back on the loan listing.
    let loans = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "library.loans",
        json!({ "token": token, "bookId": book_id, "status": "returned" }),
    );
    let fines: Vec<i64> = loans
        .get("loans")
        .and_then(|v| v.as_array())
        .expect("loans")
        .iter()
        .map(|l| l.get("fineCents").and_then(|v| v.as_i64()).expect("fine"))
        .collect();
    assert_eq!(fines.len(), 2);
    assert!(fines.contains(&500) && fines.contains(&0), "fines: {:?}", fines);
}

#[test]
fn fine_rate_is_a_workspace_setting() {
    let workspace = temp_dir("schoolhub-fine-rate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let token = setup(&mut stdin, &mut reader, &workspace);
    let student = student_by_no(&mut stdin, &mut reader, &token, "S002");

    // Raise the per-day rate by editing the workspace database directly,
    // the same way an operator tool would.
    {
        let conn = rusqlite::Connection::open(workspace.join("schoolhub.sqlite3"))
            .expect("open workspace db");
        conn.execute(
            "UPDATE settings SET value = ? WHERE key = 'library.circulation'",
            [r#"{"finePerDayCents":250}"#],
        )
        .expect("update setting");
    }

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "books.create",
        json!({ "token": token, "title": "Costly", "author": "B. Orrower", "totalCopies": 1 }),
    );
    let book_id = created
        .get("bookId")
        .and_then(|v| v.as_str())
        .expect("bookId")
        .to_string();

    let loan = issue(
        &mut stdin, &mut reader, "2", &token, &book_id, &student, "2024-03-01", "2024-03-10",
    );
    let returned = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "library.return",
        json!({ "token": token, "loanId": loan, "returnDate": "2024-03-14" }),
    );
    assert_eq!(
        returned.get("fineCents").and_then(|v| v.as_i64()),
        Some(4 * 250)
    );
}

#[test]
fn overdue_flag_is_derived_not_stored() {
    let workspace = temp_dir("schoolhub-loan-overdue");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let token = setup(&mut stdin, &mut reader, &workspace);
    let student = student_by_no(&mut stdin, &mut reader, &token, "S003");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "books.create",
        json!({ "token": token, "title": "Late Bloomer", "author": "C. Lock", "totalCopies": 1 }),
    );
    let book_id = created
        .get("bookId")
        .and_then(|v| v.as_str())
        .expect("bookId")
        .to_string();
    let _loan = issue(
        &mut stdin, &mut reader, "2", &token, &book_id, &student, "2024-01-02", "2024-01-10",
    );

    // Same stored row, different asOf: the status never changes, only the
    // derived flag does.
    for (as_of, expect_overdue) in [("2024-01-10", false), ("2024-01-11", true)] {
        let loans = request_ok(
            &mut stdin,
            &mut reader,
            "3",
            "library.loans",
            json!({ "token": token, "bookId": book_id, "asOf": as_of }),
        );
        let row = loans
            .get("loans")
            .and_then(|v| v.as_array())
            .and_then(|rows| rows.first())
            .cloned()
            .expect("loan row");
        assert_eq!(row.get("status").and_then(|v| v.as_str()), Some("issued"));
        assert_eq!(
            row.get("overdue").and_then(|v| v.as_bool()),
            Some(expect_overdue),
            "asOf {}",
            as_of
        );
    }
}
