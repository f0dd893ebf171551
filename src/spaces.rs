//! Spaces and their membership.
//!
//! A space scopes knowledge bases, assistants, and conversations. Every
//! operation is performed on behalf of an acting user whose [`Role`] in the
//! space decides what is allowed:
//!
//! | Action | Minimum role |
//! |--------|--------------|
//! | read anything in the space | Viewer |
//! | write knowledge bases, sources, assistants | Editor |
//! | manage members, rename the space | Admin |
//! | delete the space | Owner |
//!
//! Membership changes have extra rules, checked by [`check_grant`] and
//! [`check_removal`]: nobody can grant a role above their own, admins cannot
//! touch owners, and the last owner can never be demoted or removed.
//! Non-members asking about a space get `NotFound`, not `Forbidden`, so
//! space ids are not leaked.

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{KbError, KbResult};
use crate::models::{now_ts, ts, Role, Space, SpaceMember};

const MAX_NAME_LEN: usize = 120;

/// A space as seen by one member.
#[derive(Debug, Clone, Serialize)]
pub struct SpaceView {
    #[serde(flatten)]
    pub space: Space,
    pub role: Role,
}

// ============ Permission rules ============

/// Validate that `actor` may give someone `new_role`.
///
/// `current` is the target's existing role, if they are already a member.
pub fn check_grant(actor: Role, current: Option<Role>, new_role: Role) -> KbResult<()> {
    if actor < Role::Admin {
        return Err(KbError::forbidden("only admins and owners can manage members"));
    }
    if new_role > actor {
        return Err(KbError::forbidden(format!(
            "a {} cannot grant the {} role",
            actor, new_role
        )));
    }
    if let Some(current) = current {
        if current > actor {
            return Err(KbError::forbidden(format!(
                "a {} cannot change the role of a {}",
                actor, current
            )));
        }
    }
    Ok(())
}

/// Validate that `actor` may remove `target` from the space.
pub fn check_removal(
    actor_id: &str,
    actor: Role,
    target_id: &str,
    target: Role,
    owner_count: i64,
) -> KbResult<()> {
    if target == Role::Owner && owner_count <= 1 {
        return Err(KbError::conflict("cannot remove the last owner of a space"));
    }
    if actor_id == target_id {
        return Ok(());
    }
    if actor < Role::Admin {
        return Err(KbError::forbidden("only admins and owners can remove members"));
    }
    if target > actor {
        return Err(KbError::forbidden(format!(
            "a {} cannot remove a {}",
            actor, target
        )));
    }
    Ok(())
}

fn validate_name(name: &str) -> KbResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(KbError::bad_request("name must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(KbError::bad_request(format!(
            "name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

/// Trimmed optional text; blank becomes `None`.
pub(crate) fn clean_optional(text: Option<&str>) -> Option<String> {
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

// ============ Queries ============

fn space_from_row(row: &SqliteRow) -> Space {
    Space {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        created_by: row.get("created_by"),
        created_at: ts(row.get("created_at")),
        updated_at: ts(row.get("updated_at")),
    }
}

fn member_from_row(row: &SqliteRow) -> KbResult<SpaceMember> {
    let role: String = row.get("role");
    Ok(SpaceMember {
        space_id: row.get("space_id"),
        user_id: row.get("user_id"),
        email: row.get("email"),
        display_name: row.get("display_name"),
        role: role.parse().map_err(|e: String| anyhow::anyhow!(e))?,
        joined_at: ts(row.get("joined_at")),
    })
}

async fn member_role(pool: &SqlitePool, space_id: &str, user_id: &str) -> KbResult<Option<Role>> {
    let role: Option<String> =
        sqlx::query_scalar("SELECT role FROM space_members WHERE space_id = ? AND user_id = ?")
            .bind(space_id)
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    match role {
        Some(r) => Ok(Some(r.parse().map_err(|e: String| anyhow::anyhow!(e))?)),
        None => Ok(None),
    }
}

/// SQL condition on a `space_members` row: changing it leaves the space with
/// at least one owner.
const KEEPS_AN_OWNER: &str = "(role != 'owner' OR (SELECT COUNT(*) FROM space_members o \
     WHERE o.space_id = space_members.space_id AND o.role = 'owner') > 1)";

/// Explain a guarded membership write that matched no row.
async fn last_owner_or_gone(pool: &SqlitePool, space_id: &str, user_id: &str, action: &str) -> KbError {
    match member_role(pool, space_id, user_id).await {
        Ok(Some(_)) => KbError::conflict(format!("cannot {} the last owner of a space", action)),
        Ok(None) => KbError::not_found(format!("member {}", user_id)),
        Err(e) => e,
    }
}

async fn owner_count(pool: &SqlitePool, space_id: &str) -> KbResult<i64> {
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM space_members WHERE space_id = ? AND role = 'owner'",
    )
    .bind(space_id)
    .fetch_one(pool)
    .await?;
    Ok(n)
}

/// Resolve the acting user's role, requiring at least `min`.
pub async fn require_role(
    pool: &SqlitePool,
    space_id: &str,
    user_id: &str,
    min: Role,
) -> KbResult<Role> {
    let role = member_role(pool, space_id, user_id)
        .await?
        .ok_or_else(|| KbError::not_found(format!("space {}", space_id)))?;
    if role < min {
        return Err(KbError::forbidden(format!(
            "this action requires the {} role (you are {})",
            min, role
        )));
    }
    Ok(role)
}

/// Create a space; the creator becomes its owner.
pub async fn create_space(
    pool: &SqlitePool,
    actor_id: &str,
    name: &str,
    description: Option<&str>,
) -> KbResult<SpaceView> {
    let now = now_ts();
    let space = Space {
        id: Uuid::new_v4().to_string(),
        name: validate_name(name)?,
        description: clean_optional(description),
        created_by: actor_id.to_string(),
        created_at: ts(now),
        updated_at: ts(now),
    };

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO spaces (id, name, description, created_by, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&space.id)
    .bind(&space.name)
    .bind(&space.description)
    .bind(&space.created_by)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO space_members (space_id, user_id, role, joined_at) VALUES (?, ?, 'owner', ?)",
    )
    .bind(&space.id)
    .bind(actor_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(space_id = %space.id, "created space");
    Ok(SpaceView {
        space,
        role: Role::Owner,
    })
}

pub async fn get_space(pool: &SqlitePool, actor_id: &str, space_id: &str) -> KbResult<SpaceView> {
    let role = require_role(pool, space_id, actor_id, Role::Viewer).await?;
    let row = sqlx::query("SELECT * FROM spaces WHERE id = ?")
        .bind(space_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| KbError::not_found(format!("space {}", space_id)))?;
    Ok(SpaceView {
        space: space_from_row(&row),
        role,
    })
}

pub async fn list_spaces_for_user(pool: &SqlitePool, user_id: &str) -> KbResult<Vec<SpaceView>> {
    let rows = sqlx::query(
        r#"
        SELECT s.*, m.role AS member_role
        FROM spaces s
        JOIN space_members m ON m.space_id = s.id
        WHERE m.user_id = ?
        ORDER BY s.name COLLATE NOCASE ASC, s.id ASC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let role: String = row.get("member_role");
            Ok(SpaceView {
                space: space_from_row(row),
                role: role.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            })
        })
        .collect()
}

pub async fn update_space(
    pool: &SqlitePool,
    actor_id: &str,
    space_id: &str,
    name: Option<&str>,
    description: Option<&str>,
) -> KbResult<SpaceView> {
    require_role(pool, space_id, actor_id, Role::Admin).await?;
    let current = get_space(pool, actor_id, space_id).await?;

    let name = match name {
        Some(n) => validate_name(n)?,
        None => current.space.name,
    };
    let description = match description {
        Some(d) => clean_optional(Some(d)),
        None => current.space.description,
    };

    sqlx::query("UPDATE spaces SET name = ?, description = ?, updated_at = ? WHERE id = ?")
        .bind(&name)
        .bind(&description)
        .bind(now_ts())
        .bind(space_id)
        .execute(pool)
        .await?;

    get_space(pool, actor_id, space_id).await
}

/// Delete a space and everything in it. Owners only.
pub async fn delete_space(pool: &SqlitePool, actor_id: &str, space_id: &str) -> KbResult<()> {
    require_role(pool, space_id, actor_id, Role::Owner).await?;

    let upload_paths: Vec<Option<String>> = sqlx::query_scalar(
        "SELECT location FROM knowledge_sources WHERE space_id = ? AND kind = 'upload'",
    )
    .bind(space_id)
    .fetch_all(pool)
    .await?;

    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM chunks_fts WHERE knowledge_base_id IN (SELECT id FROM knowledge_bases WHERE space_id = ?)",
    )
    .bind(space_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM spaces WHERE id = ?")
        .bind(space_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    for path in upload_paths.into_iter().flatten() {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path, error = %e, "could not remove upload");
        }
    }

    tracing::info!(space_id = %space_id, "deleted space");
    Ok(())
}

// ============ Members ============

pub async fn list_members(
    pool: &SqlitePool,
    actor_id: &str,
    space_id: &str,
) -> KbResult<Vec<SpaceMember>> {
    require_role(pool, space_id, actor_id, Role::Viewer).await?;
    let rows = sqlx::query(
        r#"
        SELECT m.space_id, m.user_id, m.role, m.joined_at, u.email, u.display_name
        FROM space_members m
        JOIN users u ON u.id = m.user_id
        WHERE m.space_id = ?
        ORDER BY m.joined_at ASC, u.email ASC
        "#,
    )
    .bind(space_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(member_from_row).collect()
}

async fn get_member(pool: &SqlitePool, space_id: &str, user_id: &str) -> KbResult<SpaceMember> {
    let row = sqlx::query(
        r#"
        SELECT m.space_id, m.user_id, m.role, m.joined_at, u.email, u.display_name
        FROM space_members m
        JOIN users u ON u.id = m.user_id
        WHERE m.space_id = ? AND m.user_id = ?
        "#,
    )
    .bind(space_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| KbError::not_found(format!("member {}", user_id)))?;
    member_from_row(&row)
}

/// Add `user_id` to the space with `role`.
pub async fn add_member(
    pool: &SqlitePool,
    actor_id: &str,
    space_id: &str,
    user_id: &str,
    role: Role,
) -> KbResult<SpaceMember> {
    let actor_role = require_role(pool, space_id, actor_id, Role::Viewer).await?;
    check_grant(actor_role, None, role)?;

    let user_exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    if !user_exists {
        return Err(KbError::not_found(format!("user {}", user_id)));
    }
    if member_role(pool, space_id, user_id).await?.is_some() {
        return Err(KbError::conflict("user is already a member of this space"));
    }

    sqlx::query("INSERT INTO space_members (space_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)")
        .bind(space_id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(now_ts())
        .execute(pool)
        .await?;

    tracing::info!(space_id = %space_id, user_id = %user_id, role = %role, "added member");
    get_member(pool, space_id, user_id).await
}

pub async fn update_member_role(
    pool: &SqlitePool,
    actor_id: &str,
    space_id: &str,
    user_id: &str,
    role: Role,
) -> KbResult<SpaceMember> {
    let actor_role = require_role(pool, space_id, actor_id, Role::Viewer).await?;
    let current = member_role(pool, space_id, user_id)
        .await?
        .ok_or_else(|| KbError::not_found(format!("member {}", user_id)))?;
    check_grant(actor_role, Some(current), role)?;

    if current == Role::Owner && role != Role::Owner && owner_count(pool, space_id).await? <= 1 {
        return Err(KbError::conflict("cannot demote the last owner of a space"));
    }

    // The owner check is repeated inside the write so two concurrent
    // demotions cannot both pass it.
    let updated = sqlx::query(&format!(
        "UPDATE space_members SET role = ?1 \
         WHERE space_id = ?2 AND user_id = ?3 AND (?1 = 'owner' OR {})",
        KEEPS_AN_OWNER
    ))
    .bind(role.as_str())
    .bind(space_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(last_owner_or_gone(pool, space_id, user_id, "demote").await);
    }

    get_member(pool, space_id, user_id).await
}

pub async fn remove_member(
    pool: &SqlitePool,
    actor_id: &str,
    space_id: &str,
    user_id: &str,
) -> KbResult<()> {
    let actor_role = require_role(pool, space_id, actor_id, Role::Viewer).await?;
    let target_role = member_role(pool, space_id, user_id)
        .await?
        .ok_or_else(|| KbError::not_found(format!("member {}", user_id)))?;
    let owners = owner_count(pool, space_id).await?;
    check_removal(actor_id, actor_role, user_id, target_role, owners)?;

    let removed = sqlx::query(&format!(
        "DELETE FROM space_members WHERE space_id = ?1 AND user_id = ?2 AND {}",
        KEEPS_AN_OWNER
    ))
    .bind(space_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    if removed.rows_affected() == 0 {
        return Err(last_owner_or_gone(pool, space_id, user_id, "remove").await);
    }

    tracing::info!(space_id = %space_id, user_id = %user_id, "removed member");
    Ok(())
}
