//! User storage.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_ts, is_unique_violation, parse_ts, Database};
use crate::error::{CompassError, NotFoundError, Result};
use crate::user::{User, UserRepository};

pub(crate) const USER_COLUMNS: &str = "id, email, provider, created_at, updated_at";

pub struct SqliteUserRepository {
    db: Database,
}

impl SqliteUserRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

pub(crate) fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        provider: row.get(2)?,
        created_at: Some(parse_ts(&row.get::<_, String>(3)?)?),
        updated_at: Some(parse_ts(&row.get::<_, String>(4)?)?),
    })
}

pub(crate) fn find_by_email(conn: &Connection, email: &str) -> Result<Option<User>> {
    Ok(conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
            params![email],
            user_from_row,
        )
        .optional()?)
}

fn insert(conn: &Connection, user: &User) -> Result<String> {
    user.validate()?;
    let id = if user.id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        user.id.clone()
    };
    let now = format_ts(&Utc::now());
    conn.execute(
        "INSERT INTO users (id, email, provider, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
        params![id, user.email, user.provider, now],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            CompassError::AlreadyExists {
                resource: "user",
                key: user.email.clone(),
            }
        } else {
            e.into()
        }
    })?;
    Ok(id)
}

/// Id of the user with `email`, inserting it with `provider` when absent.
pub(crate) fn get_or_insert(conn: &Connection, email: &str, provider: &str) -> Result<String> {
    if let Some(user) = find_by_email(conn, email)? {
        return Ok(user.id);
    }
    insert(
        conn,
        &User {
            email: email.to_string(),
            provider: provider.to_string(),
            ..Default::default()
        },
    )
}

#[async_trait]
impl UserRepository for SqliteUserRepository {
    async fn get_by_id(&self, id: &str) -> Result<User> {
        let id = id.to_string();
        self.db
            .run(move |conn| {
                conn.query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                    params![id],
                    user_from_row,
                )
                .optional()?
                .ok_or_else(|| NotFoundError::UserId(id.clone()).into())
            })
            .await
    }

    async fn get_by_email(&self, email: &str) -> Result<User> {
        let email = email.to_string();
        self.db
            .run(move |conn| {
                find_by_email(conn, &email)?.ok_or_else(|| NotFoundError::Email(email).into())
            })
            .await
    }

    async fn create(&self, user: &User) -> Result<String> {
        let user = user.clone();
        self.db.run(move |conn| insert(conn, &user)).await
    }

    async fn get_or_insert_by_email(&self, user: &User) -> Result<String> {
        user.validate()?;
        let user = user.clone();
        self.db
            .run(move |conn| get_or_insert(conn, &user.email, &user.provider))
            .await
    }
}
