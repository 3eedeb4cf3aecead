use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_TEACHER: &str = "teacher";
pub const ROLE_STUDENT: &str = "student";
pub const ROLE_PARENT: &str = "parent";

/// The authenticated caller. Resolved once per request from the token param
/// and passed explicitly into domain logic; nothing reads an ambient
/// current-user.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub role: String,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    pub fn is_teacher(&self) -> bool {
        self.role == ROLE_TEACHER
    }
}

/// Stored form is `salt$hexdigest` with digest = SHA-256(salt || password).
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{}${:x}", salt, hasher.finalize())
}

pub fn verify_password(stored: &str, candidate: &str) -> bool {
    let Some((salt, expected)) = stored.split_once('$') else {
        return false;
    };
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(candidate.as_bytes());
    format!("{:x}", hasher.finalize()) == expected
}

pub fn issue_session(conn: &Connection, user_id: &str) -> anyhow::Result<String> {
    let token = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sessions(token, user_id, created_at) VALUES(?, ?, ?)",
        (&token, user_id, Utc::now().to_rfc3339()),
    )?;
    Ok(token)
}

/// Returns true if a session was actually removed.
pub fn drop_session(conn: &Connection, token: &str) -> anyhow::Result<bool> {
    let n = conn.execute("DELETE FROM sessions WHERE token = ?", [token])?;
    Ok(n > 0)
}

pub fn identity_for_token(conn: &Connection, token: &str) -> anyhow::Result<Option<Identity>> {
    let row = conn
        .query_row(
            "SELECT u.id, u.username, u.role
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token = ? AND u.active = 1",
            [token],
            |r| {
                Ok(Identity {
                    user_id: r.get(0)?,
                    username: r.get(1)?,
                    role: r.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}
