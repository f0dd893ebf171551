//! Assistants: a system prompt, model settings, and the knowledge bases
//! consulted when answering.

use serde::Deserialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{KbError, KbResult};
use crate::models::{now_ts, ts, Assistant, Role};
use crate::spaces::{clean_optional, require_role};

const MAX_NAME_LEN: usize = 120;
const MAX_PROMPT_LEN: usize = 20_000;
const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer using the provided context when it is relevant, \
     and cite sources with their bracketed numbers.";

/// Fields accepted when creating an assistant.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub knowledge_base_ids: Vec<String>,
}

/// Partial update; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub knowledge_base_ids: Option<Vec<String>>,
}

fn validate_temperature(t: f64) -> KbResult<f64> {
    if !(0.0..=2.0).contains(&t) {
        return Err(KbError::bad_request("temperature must be between 0 and 2"));
    }
    Ok(t)
}

fn validate_name(name: &str) -> KbResult<String> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(KbError::bad_request(format!(
            "name must be 1 to {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

fn validate_prompt(prompt: Option<&str>) -> KbResult<String> {
    let prompt = prompt.map(str::trim).unwrap_or_default();
    if prompt.len() > MAX_PROMPT_LEN {
        return Err(KbError::bad_request(format!(
            "system_prompt must be at most {} bytes",
            MAX_PROMPT_LEN
        )));
    }
    Ok(if prompt.is_empty() {
        DEFAULT_SYSTEM_PROMPT.to_string()
    } else {
        prompt.to_string()
    })
}

/// Deduplicate and check that every id names a knowledge base in `space_id`.
async fn validate_kb_ids(pool: &SqlitePool, space_id: &str, ids: &[String]) -> KbResult<Vec<String>> {
    let mut unique: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !unique.contains(id) {
            unique.push(id.clone());
        }
    }
    for id in &unique {
        let ok: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM knowledge_bases WHERE id = ? AND space_id = ?",
        )
        .bind(id)
        .bind(space_id)
        .fetch_one(pool)
        .await?;
        if !ok {
            return Err(KbError::bad_request(format!(
                "knowledge base {} does not belong to this space",
                id
            )));
        }
    }
    Ok(unique)
}

async fn kb_ids_for(pool: &SqlitePool, assistant_id: &str) -> KbResult<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT akb.knowledge_base_id
        FROM assistant_knowledge_bases akb
        JOIN knowledge_bases kb ON kb.id = akb.knowledge_base_id
        WHERE akb.assistant_id = ?
        ORDER BY kb.name COLLATE NOCASE ASC, kb.id ASC
        "#,
    )
    .bind(assistant_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

async fn assistant_from_row(pool: &SqlitePool, row: &SqliteRow) -> KbResult<Assistant> {
    let id: String = row.get("id");
    let knowledge_base_ids = kb_ids_for(pool, &id).await?;
    Ok(Assistant {
        id,
        space_id: row.get("space_id"),
        name: row.get("name"),
        description: row.get("description"),
        system_prompt: row.get("system_prompt"),
        model: row.get("model"),
        temperature: row.get("temperature"),
        knowledge_base_ids,
        created_by: row.get("created_by"),
        created_at: ts(row.get("created_at")),
        updated_at: ts(row.get("updated_at")),
    })
}

/// Load an assistant without a permission check.
pub async fn load_assistant(pool: &SqlitePool, assistant_id: &str) -> KbResult<Assistant> {
    let row = sqlx::query("SELECT * FROM assistants WHERE id = ?")
        .bind(assistant_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| KbError::not_found(format!("assistant {}", assistant_id)))?;
    assistant_from_row(pool, &row).await
}

async fn authorized_assistant(
    pool: &SqlitePool,
    actor_id: &str,
    assistant_id: &str,
    min: Role,
) -> KbResult<Assistant> {
    let assistant = load_assistant(pool, assistant_id).await?;
    require_role(pool, &assistant.space_id, actor_id, min)
        .await
        .map_err(|e| match e {
            KbError::NotFound(_) => KbError::not_found(format!("assistant {}", assistant_id)),
            other => other,
        })?;
    Ok(assistant)
}

pub async fn create_assistant(
    pool: &SqlitePool,
    actor_id: &str,
    space_id: &str,
    input: &AssistantInput,
    default_temperature: f64,
) -> KbResult<Assistant> {
    require_role(pool, space_id, actor_id, Role::Editor).await?;

    let name = validate_name(&input.name)?;
    let system_prompt = validate_prompt(input.system_prompt.as_deref())?;
    let temperature = validate_temperature(input.temperature.unwrap_or(default_temperature))?;
    let kb_ids = validate_kb_ids(pool, space_id, &input.knowledge_base_ids).await?;
    let id = Uuid::new_v4().to_string();
    let now = now_ts();

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO assistants (id, space_id, name, description, system_prompt, model, temperature,
                                created_by, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(space_id)
    .bind(&name)
    .bind(clean_optional(input.description.as_deref()))
    .bind(&system_prompt)
    .bind(clean_optional(input.model.as_deref()))
    .bind(temperature)
    .bind(actor_id)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    for kb_id in &kb_ids {
        sqlx::query(
            "INSERT INTO assistant_knowledge_bases (assistant_id, knowledge_base_id) VALUES (?, ?)",
        )
        .bind(&id)
        .bind(kb_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    tracing::info!(assistant_id = %id, space_id = %space_id, "created assistant");
    load_assistant(pool, &id).await
}

pub async fn list_assistants(
    pool: &SqlitePool,
    actor_id: &str,
    space_id: &str,
) -> KbResult<Vec<Assistant>> {
    require_role(pool, space_id, actor_id, Role::Viewer).await?;
    let rows = sqlx::query(
        "SELECT * FROM assistants WHERE space_id = ? ORDER BY name COLLATE NOCASE ASC, id ASC",
    )
    .bind(space_id)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        out.push(assistant_from_row(pool, row).await?);
    }
    Ok(out)
}

pub async fn get_assistant(
    pool: &SqlitePool,
    actor_id: &str,
    assistant_id: &str,
) -> KbResult<Assistant> {
    authorized_assistant(pool, actor_id, assistant_id, Role::Viewer).await
}

pub async fn update_assistant(
    pool: &SqlitePool,
    actor_id: &str,
    assistant_id: &str,
    patch: &AssistantPatch,
) -> KbResult<Assistant> {
    let current = authorized_assistant(pool, actor_id, assistant_id, Role::Editor).await?;

    let name = match &patch.name {
        Some(n) => validate_name(n)?,
        None => current.name,
    };
    let description = match &patch.description {
        Some(d) => clean_optional(Some(d)),
        None => current.description,
    };
    let system_prompt = match &patch.system_prompt {
        Some(p) => validate_prompt(Some(p))?,
        None => current.system_prompt,
    };
    let model = match &patch.model {
        Some(m) => clean_optional(Some(m)),
        None => current.model,
    };
    let temperature = validate_temperature(patch.temperature.unwrap_or(current.temperature))?;
    let kb_ids = match &patch.knowledge_base_ids {
        Some(ids) => Some(validate_kb_ids(pool, &current.space_id, ids).await?),
        None => None,
    };

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        UPDATE assistants SET name = ?, description = ?, system_prompt = ?, model = ?,
                              temperature = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&name)
    .bind(&description)
    .bind(&system_prompt)
    .bind(&model)
    .bind(temperature)
    .bind(now_ts())
    .bind(assistant_id)
    .execute(&mut *tx)
    .await?;
    if let Some(ids) = kb_ids {
        sqlx::query("DELETE FROM assistant_knowledge_bases WHERE assistant_id = ?")
            .bind(assistant_id)
            .execute(&mut *tx)
            .await?;
        for kb_id in &ids {
            sqlx::query(
                "INSERT INTO assistant_knowledge_bases (assistant_id, knowledge_base_id) VALUES (?, ?)",
            )
            .bind(assistant_id)
            .bind(kb_id)
            .execute(&mut *tx)
            .await?;
        }
    }
    tx.commit().await?;

    load_assistant(pool, assistant_id).await
}

pub async fn delete_assistant(pool: &SqlitePool, actor_id: &str, assistant_id: &str) -> KbResult<()> {
    authorized_assistant(pool, actor_id, assistant_id, Role::Editor).await?;
    sqlx::query("DELETE FROM assistants WHERE id = ?")
        .bind(assistant_id)
        .execute(pool)
        .await?;
    tracing::info!(assistant_id = %assistant_id, "deleted assistant");
    Ok(())
}
