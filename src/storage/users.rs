//! Users and their session tokens.
//!
//! Tokens are opaque random strings. How a user first obtains one (the OAuth
//! handoff) happens outside this service; the CLI can mint tokens directly.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

use super::{encode_ts, ts_column, uuid_column, Pool, StoreError};
use crate::model::UserId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UserStore {
    pool: Pool,
}

const USER_COLUMNS: &str = "id, email, name, avatar_url, created_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_column(row, 0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        avatar_url: row.get(3)?,
        created_at: ts_column(row, 4)?,
    })
}

impl UserStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert a user, or return the existing one with the same email.
    pub fn upsert(&self, email: &str, name: &str, now: DateTime<Utc>) -> Result<User, StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO users (id, email, name, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(email) DO UPDATE SET name = excluded.name",
            params![Uuid::new_v4().to_string(), email, name, encode_ts(now)],
        )?;
        let user = conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
            params![email],
            user_from_row,
        )?;
        Ok(user)
    }

    pub fn get(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let conn = self.pool.get()?;
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.to_string()],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    /// Issue a new session token for `user_id`, valid for `ttl`.
    pub fn create_session(&self, user_id: UserId, now: DateTime<Utc>, ttl: Duration) -> Result<String, StoreError> {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token: String = raw.iter().map(|b| format!("{b:02x}")).collect();

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![token, user_id.to_string(), encode_ts(now), encode_ts(now + ttl)],
        )?;
        Ok(token)
    }

    /// The user behind an unexpired session token.
    pub fn user_for_token(&self, token: &str, now: DateTime<Utc>) -> Result<Option<User>, StoreError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT u.id, u.email, u.name, u.avatar_url, u.created_at, s.expires_at
                 FROM sessions s JOIN users u ON u.id = s.user_id
                 WHERE s.token = ?1",
                params![token],
                |row| Ok((user_from_row(row)?, ts_column(row, 5)?)),
            )
            .optional()?;

        Ok(match row {
            Some((user, expires_at)) if expires_at > now => Some(user),
            _ => None,
        })
    }

    /// Revoke a session. Returns whether it existed.
    pub fn revoke(&self, token: &str) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
        Ok(changed > 0)
    }
}
