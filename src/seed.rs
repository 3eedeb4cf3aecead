//! Demo workspace seeding. Only reachable through `workspace.seedDemo`,
//! which refuses to run once any real user exists; the well-known demo
//! passwords below never leave this module on any other code path.

use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::auth;

struct DemoUser<'a> {
    email: &'a str,
    first: &'a str,
    last: &'a str,
    role: &'a str,
    password: &'a str,
}

fn insert_demo_user(tx: &rusqlite::Transaction<'_>, u: &DemoUser<'_>) -> anyhow::Result<String> {
    let user_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO users(id, username, email, password_hash, role, first_name, last_name,
                           phone, address, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, NULL, NULL, 1, ?)",
        (
            &user_id,
            u.email,
            u.email,
            auth::hash_password(u.password),
            u.role,
            u.first,
            u.last,
            Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(user_id)
}

pub fn seed_demo(conn: &Connection) -> anyhow::Result<serde_json::Value> {
    let tx = conn.unchecked_transaction()?;

    let admin = DemoUser {
        email: "admin@school.example",
        first: "System",
        last: "Administrator",
        role: auth::ROLE_ADMIN,
        password: "admin123",
    };
    insert_demo_user(&tx, &admin)?;

    let teacher_users = [
        DemoUser {
            email: "teacher1@school.example",
            first: "John",
            last: "Smith",
            role: auth::ROLE_TEACHER,
            password: "teacher123",
        },
        DemoUser {
            email: "teacher2@school.example",
            first: "Sarah",
            last: "Johnson",
            role: auth::ROLE_TEACHER,
            password: "teacher123",
        },
    ];
    let mut teacher_ids = Vec::new();
    for (i, u) in teacher_users.iter().enumerate() {
        let user_id = insert_demo_user(&tx, u)?;
        let teacher_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO teachers(id, user_id, teacher_no, specialization, qualification,
                                  experience_years, salary_cents, hire_date)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &teacher_id,
                &user_id,
                format!("T{:03}", i + 1),
                if i == 0 { "Mathematics" } else { "English" },
                if i == 0 {
                    "M.Ed Mathematics"
                } else {
                    "M.A English Literature"
                },
                5 + i as i64,
                5_000_000_i64,
                "2020-09-01",
            ),
        )?;
        teacher_ids.push(teacher_id);
    }

    let mut class_ids = Vec::new();
    for (name, grade, section) in [("Grade 1-A", 1_i64, "A"), ("Grade 2-A", 2, "A")] {
        let class_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO school_classes(id, name, grade_level, section, academic_year,
                                        class_teacher_id, max_students)
             VALUES(?, ?, ?, ?, '2024-2025', ?, 30)",
            (&class_id, name, grade, section, &teacher_ids[0]),
        )?;
        class_ids.push(class_id);
    }

    let mut subject_ids = Vec::new();
    for (name, code, credits) in [
        ("Mathematics", "MATH101", 3_i64),
        ("English", "ENG101", 3),
        ("Science", "SCI101", 3),
    ] {
        let subject_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO subjects(id, name, code, description, credits, grade_level)
             VALUES(?, ?, ?, NULL, ?, 1)",
            (&subject_id, name, code, credits),
        )?;
        subject_ids.push(subject_id);
    }
    tx.execute(
        "INSERT INTO teacher_subjects(id, teacher_id, subject_id, class_id)
         VALUES(?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            &teacher_ids[0],
            &subject_ids[0],
            &class_ids[0],
        ),
    )?;

    let parent = DemoUser {
        email: "parent1@school.example",
        first: "Mary",
        last: "Johnson",
        role: auth::ROLE_PARENT,
        password: "parent123",
    };
    let parent_user_id = insert_demo_user(&tx, &parent)?;

    let student_users = [
        DemoUser {
            email: "student1@school.example",
            first: "Alice",
            last: "Johnson",
            role: auth::ROLE_STUDENT,
            password: "student123",
        },
        DemoUser {
            email: "student2@school.example",
            first: "Bob",
            last: "Smith",
            role: auth::ROLE_STUDENT,
            password: "student123",
        },
        DemoUser {
            email: "student3@school.example",
            first: "Charlie",
            last: "Brown",
            role: auth::ROLE_STUDENT,
            password: "student123",
        },
    ];
    let mut student_ids = Vec::new();
    for (i, u) in student_users.iter().enumerate() {
        let user_id = insert_demo_user(&tx, u)?;
        let student_id = Uuid::new_v4().to_string();
        // Alice belongs to the demo parent; the rest are unlinked.
        let parent_ref = if i == 0 { Some(&parent_user_id) } else { None };
        tx.execute(
            "INSERT INTO students(id, user_id, student_no, class_id, date_of_birth, gender,
                                  admission_date, parent_user_id)
             VALUES(?, ?, ?, ?, ?, NULL, '2024-09-01', ?)",
            (
                &student_id,
                &user_id,
                format!("S{:03}", i + 1),
                &class_ids[i % class_ids.len()],
                "2015-03-15",
                parent_ref,
            ),
        )?;
        student_ids.push(student_id);
    }

    let books = [
        ("The Little Prince", "Antoine de Saint-Exupéry", 3_i64),
        ("Charlotte's Web", "E. B. White", 2),
        ("Matilda", "Roald Dahl", 1),
    ];
    for (i, (title, author, copies)) in books.iter().enumerate() {
        tx.execute(
            "INSERT INTO books(id, title, author, isbn, category, total_copies,
                               available_copies, publication_year, publisher, language)
             VALUES(?, ?, ?, ?, 'Fiction', ?, ?, NULL, NULL, 'English')",
            (
                Uuid::new_v4().to_string(),
                title,
                author,
                format!("978-0-000000-{:02}-0", i + 1),
                copies,
                copies,
            ),
        )?;
    }

    for (student, category, amount_cents, due) in [
        (&student_ids[0], "tuition", 50_000_i64, "2025-01-15"),
        (&student_ids[0], "library", 1_500, "2025-02-01"),
        (&student_ids[1], "tuition", 50_000, "2025-01-15"),
    ] {
        tx.execute(
            "INSERT INTO fees(id, student_id, category, amount_cents, due_date, status,
                              academic_year)
             VALUES(?, ?, ?, ?, ?, 'pending', '2024-2025')",
            (
                Uuid::new_v4().to_string(),
                student,
                category,
                amount_cents,
                due,
            ),
        )?;
    }

    tx.commit()?;

    Ok(json!({
        "seeded": true,
        "users": 7,
        "classes": 2,
        "subjects": 3,
        "students": 3,
        "books": 3,
        "fees": 3,
        "demoCredentials": [
            { "username": "admin@school.example", "password": "admin123", "role": "admin" },
            { "username": "teacher1@school.example", "password": "teacher123", "role": "teacher" },
            { "username": "student1@school.example", "password": "student123", "role": "student" },
            { "username": "parent1@school.example", "password": "parent123", "role": "parent" }
        ]
    }))
}
