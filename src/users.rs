//! User accounts: registration, login, and lookup.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::auth;
use crate::error::{is_unique_violation, KbError, KbResult};
use crate::models::{now_ts, ts, User};

const MIN_PASSWORD_LEN: usize = 8;

pub(crate) fn user_from_row(row: &SqliteRow) -> User {
    User {
        id: row.get("id"),
        email: row.get("email"),
        display_name: row.get("display_name"),
        password_hash: row.get("password_hash"),
        created_at: ts(row.get("created_at")),
    }
}

fn normalize_email(email: &str) -> KbResult<String> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(KbError::bad_request(format!("invalid email: '{}'", email))),
    }
}

/// Create a user. Emails are unique case-insensitively.
pub async fn register(
    pool: &SqlitePool,
    email: &str,
    password: &str,
    display_name: &str,
) -> KbResult<User> {
    let email = normalize_email(email)?;
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(KbError::bad_request(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    let display_name = match display_name.trim() {
        "" => email.split('@').next().unwrap_or_default().to_string(),
        name => name.to_string(),
    };

    let id = Uuid::new_v4().to_string();
    let now = now_ts();
    let duplicate = || KbError::conflict(format!("a user with email {} already exists", email));
    if find_by_email(pool, &email).await?.is_some() {
        return Err(duplicate());
    }

    let password = password.to_string();
    let password_hash = blocking(move || auth::hash_password(&password)).await?;

    sqlx::query(
        "INSERT INTO users (id, email, display_name, password_hash, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&email)
    .bind(&display_name)
    .bind(&password_hash)
    .bind(now)
    .execute(pool)
    .await
    .map_err(|e| if is_unique_violation(&e) { duplicate() } else { e.into() })?;

    let user = User {
        id,
        email,
        display_name,
        password_hash,
        created_at: ts(now),
    };

    tracing::info!(user_id = %user.id, "registered user");
    Ok(user)
}

/// Check credentials. Unknown email and wrong password fail identically.
pub async fn authenticate(pool: &SqlitePool, email: &str, password: &str) -> KbResult<User> {
    let bad_credentials = || KbError::Unauthorized("invalid email or password".to_string());

    let email = normalize_email(email).map_err(|_| bad_credentials())?;
    let user = find_by_email(pool, &email)
        .await?
        .ok_or_else(bad_credentials)?;

    let password = password.to_string();
    let encoded = user.password_hash.clone();
    if !blocking(move || auth::verify_password(&password, &encoded)).await? {
        return Err(bad_credentials());
    }
    Ok(user)
}

/// Run CPU-heavy password hashing off the async worker threads.
async fn blocking<T, F>(f: F) -> KbResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KbError::Internal(anyhow::anyhow!("password hashing task failed: {}", e)))
}

pub async fn get_user(pool: &SqlitePool, id: &str) -> KbResult<User> {
    let row = sqlx::query("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| user_from_row(&r))
        .ok_or_else(|| KbError::not_found(format!("user {}", id)))
}

pub async fn find_by_email(pool: &SqlitePool, email: &str) -> KbResult<Option<User>> {
    let row = sqlx::query("SELECT * FROM users WHERE email = ?")
        .bind(email.trim().to_lowercase())
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| user_from_row(&r)))
}

pub async fn list_users(pool: &SqlitePool) -> KbResult<Vec<User>> {
    let rows = sqlx::query("SELECT * FROM users ORDER BY created_at ASC, email ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(user_from_row).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_is_normalized() {
        assert_eq!(
            normalize_email("  Alice@Example.COM ").unwrap(),
            "alice@example.com"
        );
    }

    #[test]
    fn email_without_at_is_rejected() {
        assert!(normalize_email("alice").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("alice@").is_err());
    }
}
