//! HTTP API.
//!
//! JSON over HTTP under `/api/v1`, authenticated with bearer tokens from
//! `POST /api/v1/auth/login` (or `register`). Chat answers stream back as
//! server-sent events.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness and database check |
//! | `POST` | `/api/v1/auth/register` | Create an account, returns a token |
//! | `POST` | `/api/v1/auth/login` | Exchange credentials for a token |
//! | `GET`  | `/api/v1/auth/me` | The authenticated user |
//! | `GET` `POST` | `/api/v1/spaces` | List / create spaces |
//! | `GET` `PATCH` `DELETE` | `/api/v1/spaces/{id}` | Read / rename / delete a space |
//! | `GET` `POST` | `/api/v1/spaces/{id}/members` | List / add members |
//! | `PATCH` `DELETE` | `/api/v1/spaces/{id}/members/{user_id}` | Change role / remove |
//! | `GET`  | `/api/v1/spaces/{id}/stats` | Index counts for the space |
//! | `GET`  | `/api/v1/spaces/{id}/jobs` | Recent background jobs |
//! | `POST` | `/api/v1/spaces/{id}/search` | Search the space's knowledge bases |
//! | `GET` `POST` | `/api/v1/spaces/{id}/knowledge-bases` | List / create knowledge bases |
//! | `GET` `PATCH` `DELETE` | `/api/v1/knowledge-bases/{id}` | Read / update / delete |
//! | `GET` `POST` | `/api/v1/knowledge-bases/{id}/sources` | List / add text or URL sources |
//! | `POST` | `/api/v1/knowledge-bases/{id}/sources/upload` | Add a file (multipart `file`) |
//! | `GET` `DELETE` | `/api/v1/sources/{id}` | Read / delete a source |
//! | `POST` | `/api/v1/sources/{id}/reindex` | Queue re-ingestion |
//! | `GET`  | `/api/v1/jobs/{id}` | Job status |
//! | `POST` | `/api/v1/jobs/{id}/cancel` `/retry` | Cancel a queued job / retry a failed one |
//! | `GET` `POST` | `/api/v1/spaces/{id}/assistants` | List / create assistants |
//! | `GET` `PATCH` `DELETE` | `/api/v1/assistants/{id}` | Read / update / delete |
//! | `GET` `POST` | `/api/v1/conversations` | List own / start a conversation |
//! | `GET` `DELETE` | `/api/v1/conversations/{id}` | Read / delete |
//! | `GET`  | `/api/v1/conversations/{id}/messages` | Message history |
//! | `POST` | `/api/v1/conversations/{id}/messages` | Send a message, SSE answer |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "space 42 not found" } }
//! ```
//!
//! Codes: `bad_request` (400), `disabled` (400), `unauthorized` and
//! `token_expired` (401), `forbidden` (403), `not_found` (404), `conflict`
//! (409), `payload_too_large` (413), `upstream_error` (502), `internal` (500).
//! Resources in spaces the caller doesn't belong to are reported as
//! `not_found`.
//!
//! # Streaming
//!
//! `POST /conversations/{id}/messages` answers with `text/event-stream`.
//! Each event's name is its `type` (`context`, `delta`, `done`, `error`) and
//! its data is the JSON-encoded [`ChatEvent`].

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    extract::{
        multipart::MultipartError, rejection::{JsonRejection, QueryRejection}, DefaultBodyLimit, FromRequestParts,
        Multipart, Path, Query, State,
    },
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, patch, post},
    Json, Router,
};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::assistants::{self, AssistantInput, AssistantPatch};
use crate::auth;
use crate::chat::{self, ChatEvent, ChatService};
use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::KbError;
use crate::knowledge;
use crate::llm::{self, ChatModel};
use crate::models::{
    Assistant, Conversation, Job, JobStatus, KnowledgeBase, KnowledgeSource, Message, Role,
    SpaceMember, User,
};
use crate::queue;
use crate::search::{search_documents, SearchMode, SearchResult};
use crate::spaces::{self, SpaceView};
use crate::stats::{self, SpaceStats};
use crate::users;
use crate::worker::{self, Worker};

/// Multipart framing allowance on top of `upload.max_file_size`.
const MULTIPART_OVERHEAD: usize = 64 * 1024;
const MAX_SEARCH_LIMIT: i64 = 100;
const MAX_JOB_LIMIT: i64 = 200;

/// Shared state passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub chat: ChatService,
}

impl AppState {
    pub fn new(
        pool: SqlitePool,
        config: Arc<Config>,
        embedder: Arc<dyn EmbeddingProvider>,
        chat_model: Arc<dyn ChatModel>,
    ) -> Self {
        let chat = ChatService::new(pool.clone(), config.clone(), embedder.clone(), chat_model);
        Self {
            pool,
            config,
            embedder,
            chat,
        }
    }
}

/// Connect, build providers from config, and serve until Ctrl-C.
///
/// With `workers > 0` an embedded worker pool processes ingestion jobs in
/// the same process; otherwise run `kb worker` separately.
pub async fn serve(config: &Config, workers: usize) -> anyhow::Result<()> {
    config.validate_for_server()?;
    let config = Arc::new(config.clone());
    let pool = db::connect(&config).await?;
    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::from(embedding::create_provider(&config.embedding)?);
    let chat_model = llm::create_chat_model(&config.llm)?;
    let state = AppState::new(pool.clone(), config.clone(), embedder.clone(), chat_model);

    let shutdown = worker::ctrl_c_shutdown();
    let pool_task = if workers > 0 {
        let worker = Arc::new(Worker::with_default_handlers(
            pool.clone(),
            config.clone(),
            embedder,
        )?);
        Some(tokio::spawn(worker.run_pool(workers, shutdown.clone())))
    } else {
        None
    };

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    tracing::info!(addr = %config.server.bind, workers, "listening");
    serve_on(listener, state, shutdown).await?;

    if let Some(task) = pool_task {
        task.await??;
    }
    pool.close().await;
    Ok(())
}

/// Serve `state` on an already-bound listener until `shutdown` turns `true`.
pub async fn serve_on(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state)?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return Ok(layer.allow_origin(Any));
    }
    let values = origins
        .iter()
        .map(|o| {
            o.parse::<HeaderValue>()
                .with_context(|| format!("invalid CORS origin: {}", o))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(values)))
}

pub fn router(state: AppState) -> anyhow::Result<Router> {
    let cors = cors_layer(&state.config.server.cors_origins)?;
    let body_limit = state.config.upload.max_file_size + MULTIPART_OVERHEAD;

    let api = Router::new()
        .route("/auth/register", post(handle_register))
        .route("/auth/login", post(handle_login))
        .route("/auth/me", get(handle_me))
        .route("/spaces", get(handle_list_spaces).post(handle_create_space))
        .route(
            "/spaces/{space_id}",
            get(handle_get_space)
                .patch(handle_update_space)
                .delete(handle_delete_space),
        )
        .route(
            "/spaces/{space_id}/members",
            get(handle_list_members).post(handle_add_member),
        )
        .route(
            "/spaces/{space_id}/members/{user_id}",
            patch(handle_update_member).delete(handle_remove_member),
        )
        .route("/spaces/{space_id}/stats", get(handle_space_stats))
        .route("/spaces/{space_id}/jobs", get(handle_list_jobs))
        .route("/spaces/{space_id}/search", post(handle_search))
        .route(
            "/spaces/{space_id}/knowledge-bases",
            get(handle_list_kbs).post(handle_create_kb),
        )
        .route(
            "/knowledge-bases/{kb_id}",
            get(handle_get_kb)
                .patch(handle_update_kb)
                .delete(handle_delete_kb),
        )
        .route(
            "/knowledge-bases/{kb_id}/sources",
            get(handle_list_sources).post(handle_create_source),
        )
        .route(
            "/knowledge-bases/{kb_id}/sources/upload",
            post(handle_upload_source),
        )
        .route(
            "/sources/{source_id}",
            get(handle_get_source).delete(handle_delete_source),
        )
        .route("/sources/{source_id}/reindex", post(handle_reindex_source))
        .route("/jobs/{job_id}", get(handle_get_job))
        .route("/jobs/{job_id}/cancel", post(handle_cancel_job))
        .route("/jobs/{job_id}/retry", post(handle_retry_job))
        .route(
            "/spaces/{space_id}/assistants",
            get(handle_list_assistants).post(handle_create_assistant),
        )
        .route(
            "/assistants/{assistant_id}",
            get(handle_get_assistant)
                .patch(handle_update_assistant)
                .delete(handle_delete_assistant),
        )
        .route(
            "/conversations",
            get(handle_list_conversations).post(handle_create_conversation),
        )
        .route(
            "/conversations/{conversation_id}",
            get(handle_get_conversation).delete(handle_delete_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(handle_list_messages).post(handle_send_message),
        );

    Ok(Router::new()
        .route("/health", get(handle_health))
        .nest("/api/v1", api)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Converts domain errors into the JSON error contract.
pub struct AppError(KbError);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            KbError::BadRequest(_) | KbError::Disabled(_) => StatusCode::BAD_REQUEST,
            KbError::Unauthorized(_) | KbError::TokenExpired => StatusCode::UNAUTHORIZED,
            KbError::Forbidden(_) => StatusCode::FORBIDDEN,
            KbError::NotFound(_) => StatusCode::NOT_FOUND,
            KbError::Conflict(_) => StatusCode::CONFLICT,
            KbError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            KbError::Upstream(_) => StatusCode::BAD_GATEWAY,
            KbError::Database(_) | KbError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl<E: Into<KbError>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
            "internal server error".to_string()
        } else {
            self.0.to_string()
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.0.code().to_string(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Unwrap a JSON body, reporting malformed input in the error contract.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| AppError(KbError::bad_request(e.body_text())))
}

/// Unwrap query parameters, reporting malformed input in the error contract.
fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, AppError> {
    query
        .map(|Query(v)| v)
        .map_err(|e| AppError(KbError::bad_request(e.body_text())))
}

fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError(KbError::PayloadTooLarge(err.body_text()))
    } else {
        AppError(KbError::bad_request(err.body_text()))
    }
}

// ============ Authentication ============

/// The caller, resolved from `Authorization: Bearer <token>`.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| KbError::Unauthorized("missing bearer token".to_string()))?;
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| KbError::Unauthorized("missing bearer token".to_string()))?;

        let claims = auth::verify_token(&state.config.auth.jwt_secret, token)?;
        // Tokens outlive deleted accounts.
        let user = users::get_user(&state.pool, &claims.sub)
            .await
            .map_err(|e| match e {
                KbError::NotFound(_) => KbError::Unauthorized("unknown user".to_string()),
                other => other,
            })?;
        Ok(AuthUser {
            id: user.id,
            email: user.email,
        })
    }
}

// ============ Health and auth ============

async fn handle_health(State(state): State<AppState>) -> Response {
    let db_ok = sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .is_ok();
    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "embeddings": state.embedder.is_enabled(),
    });
    (status, Json(body)).into_response()
}

#[derive(Deserialize)]
struct RegisterRequest {
    email: String,
    password: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct TokenResponse {
    token: String,
    token_type: &'static str,
    expires_in: i64,
    user: User,
}

fn token_response(config: &Config, user: User) -> TokenResponse {
    let token = auth::issue_token(
        &config.auth.jwt_secret,
        &user.id,
        &user.email,
        config.auth.token_ttl_minutes,
    );
    TokenResponse {
        token,
        token_type: "Bearer",
        expires_in: config.auth.token_ttl_minutes * 60,
        user,
    }
}

async fn handle_register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TokenResponse>), AppError> {
    if !state.config.auth.allow_registration {
        return Err(KbError::forbidden("registration is disabled").into());
    }
    let req = json_body(payload)?;
    let display_name = req.display_name.unwrap_or_default();
    let user = users::register(&state.pool, &req.email, &req.password, &display_name).await?;
    Ok((
        StatusCode::CREATED,
        Json(token_response(&state.config, user)),
    ))
}

async fn handle_login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, AppError> {
    let req = json_body(payload)?;
    let user = users::authenticate(&state.pool, &req.email, &req.password).await?;
    tracing::debug!(user_id = %user.id, "login");
    Ok(Json(token_response(&state.config, user)))
}

async fn handle_me(State(state): State<AppState>, user: AuthUser) -> Result<Json<User>, AppError> {
    Ok(Json(users::get_user(&state.pool, &user.id).await?))
}

// ============ Spaces and members ============

#[derive(Deserialize)]
struct SpaceRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct SpacePatch {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn handle_list_spaces(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<SpaceView>>, AppError> {
    Ok(Json(spaces::list_spaces_for_user(&state.pool, &user.id).await?))
}

async fn handle_create_space(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Result<Json<SpaceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SpaceView>), AppError> {
    let req = json_body(payload)?;
    let space =
        spaces::create_space(&state.pool, &user.id, &req.name, req.description.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(space)))
}

async fn handle_get_space(
    State(state): State<AppState>,
    user: AuthUser,
    Path(space_id): Path<String>,
) -> Result<Json<SpaceView>, AppError> {
    Ok(Json(spaces::get_space(&state.pool, &user.id, &space_id).await?))
}

async fn handle_update_space(
    State(state): State<AppState>,
    user: AuthUser,
    Path(space_id): Path<String>,
    payload: Result<Json<SpacePatch>, JsonRejection>,
) -> Result<Json<SpaceView>, AppError> {
    let req = json_body(payload)?;
    let space = spaces::update_space(
        &state.pool,
        &user.id,
        &space_id,
        req.name.as_deref(),
        req.description.as_deref(),
    )
    .await?;
    Ok(Json(space))
}

async fn handle_delete_space(
    State(state): State<AppState>,
    user: AuthUser,
    Path(space_id): Path<String>,
) -> Result<StatusCode, AppError> {
    spaces::delete_space(&state.pool, &user.id, &space_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct AddMemberRequest {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    role: Role,
}

#[derive(Deserialize)]
struct RoleRequest {
    role: Role,
}

async fn handle_list_members(
    State(state): State<AppState>,
    user: AuthUser,
    Path(space_id): Path<String>,
) -> Result<Json<Vec<SpaceMember>>, AppError> {
    Ok(Json(spaces::list_members(&state.pool, &user.id, &space_id).await?))
}

async fn handle_add_member(
    State(state): State<AppState>,
    user: AuthUser,
    Path(space_id): Path<String>,
    payload: Result<Json<AddMemberRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SpaceMember>), AppError> {
    let req = json_body(payload)?;
    let target_id = match (req.user_id, req.email) {
        (Some(id), _) => id,
        (None, Some(email)) => {
            users::find_by_email(&state.pool, &email)
                .await?
                .ok_or_else(|| KbError::not_found(format!("user {}", email)))?
                .id
        }
        (None, None) => return Err(KbError::bad_request("user_id or email is required").into()),
    };
    let member = spaces::add_member(&state.pool, &user.id, &space_id, &target_id, req.role).await?;
    Ok((StatusCode::CREATED, Json(member)))
}

async fn handle_update_member(
    State(state): State<AppState>,
    user: AuthUser,
    Path((space_id, member_id)): Path<(String, String)>,
    payload: Result<Json<RoleRequest>, JsonRejection>,
) -> Result<Json<SpaceMember>, AppError> {
    let req = json_body(payload)?;
    let member =
        spaces::update_member_role(&state.pool, &user.id, &space_id, &member_id, req.role).await?;
    Ok(Json(member))
}

async fn handle_remove_member(
    State(state): State<AppState>,
    user: AuthUser,
    Path((space_id, member_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    spaces::remove_member(&state.pool, &user.id, &space_id, &member_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_space_stats(
    State(state): State<AppState>,
    user: AuthUser,
    Path(space_id): Path<String>,
) -> Result<Json<SpaceStats>, AppError> {
    spaces::require_role(&state.pool, &space_id, &user.id, Role::Viewer).await?;
    Ok(Json(stats::space_stats(&state.pool, &space_id).await?))
}

// ============ Search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    /// Restrict to these knowledge bases; all of the space's when absent.
    #[serde(default)]
    knowledge_base_ids: Option<Vec<String>>,
    #[serde(default)]
    mode: Option<SearchMode>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Serialize)]
struct SearchResponse {
    mode: SearchMode,
    results: Vec<SearchResult>,
}

async fn handle_search(
    State(state): State<AppState>,
    user: AuthUser,
    Path(space_id): Path<String>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let req = json_body(payload)?;
    let in_space: Vec<String> = knowledge::list_knowledge_bases(&state.pool, &user.id, &space_id)
        .await?
        .into_iter()
        .map(|kb| kb.id)
        .collect();
    let kb_ids = match req.knowledge_base_ids {
        Some(ids) => {
            if let Some(bad) = ids.iter().find(|id| !in_space.contains(id)) {
                return Err(KbError::bad_request(format!(
                    "knowledge base {} does not belong to this space",
                    bad
                ))
                .into());
            }
            ids
        }
        None => in_space,
    };
    let mode = req
        .mode
        .unwrap_or_else(|| SearchMode::default_for(state.embedder.as_ref()));
    let limit = req.limit.map(|l| l.clamp(1, MAX_SEARCH_LIMIT));

    let results = search_documents(
        &state.pool,
        &state.config.retrieval,
        state.embedder.as_ref(),
        &kb_ids,
        &req.query,
        mode,
        limit,
    )
    .await?;
    Ok(Json(SearchResponse { mode, results }))
}

// ============ Knowledge bases and sources ============

#[derive(Deserialize)]
struct KnowledgeBaseRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct KnowledgeBasePatch {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn handle_list_kbs(
    State(state): State<AppState>,
    user: AuthUser,
    Path(space_id): Path<String>,
) -> Result<Json<Vec<KnowledgeBase>>, AppError> {
    Ok(Json(
        knowledge::list_knowledge_bases(&state.pool, &user.id, &space_id).await?,
    ))
}

async fn handle_create_kb(
    State(state): State<AppState>,
    user: AuthUser,
    Path(space_id): Path<String>,
    payload: Result<Json<KnowledgeBaseRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<KnowledgeBase>), AppError> {
    let req = json_body(payload)?;
    let kb = knowledge::create_knowledge_base(
        &state.pool,
        &user.id,
        &space_id,
        &req.name,
        req.description.as_deref(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(kb)))
}

async fn handle_get_kb(
    State(state): State<AppState>,
    user: AuthUser,
    Path(kb_id): Path<String>,
) -> Result<Json<KnowledgeBase>, AppError> {
    Ok(Json(
        knowledge::get_knowledge_base(&state.pool, &user.id, &kb_id).await?,
    ))
}

async fn handle_update_kb(
    State(state): State<AppState>,
    user: AuthUser,
    Path(kb_id): Path<String>,
    payload: Result<Json<KnowledgeBasePatch>, JsonRejection>,
) -> Result<Json<KnowledgeBase>, AppError> {
    let req = json_body(payload)?;
    let kb = knowledge::update_knowledge_base(
        &state.pool,
        &user.id,
        &kb_id,
        req.name.as_deref(),
        req.description.as_deref(),
    )
    .await?;
    Ok(Json(kb))
}

async fn handle_delete_kb(
    State(state): State<AppState>,
    user: AuthUser,
    Path(kb_id): Path<String>,
) -> Result<StatusCode, AppError> {
    knowledge::delete_knowledge_base(&state.pool, &user.id, &kb_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum NewSource {
    Text {
        title: String,
        content: String,
    },
    Url {
        url: String,
        #[serde(default)]
        title: Option<String>,
    },
}

async fn handle_list_sources(
    State(state): State<AppState>,
    user: AuthUser,
    Path(kb_id): Path<String>,
) -> Result<Json<Vec<KnowledgeSource>>, AppError> {
    Ok(Json(knowledge::list_sources(&state.pool, &user.id, &kb_id).await?))
}

async fn handle_create_source(
    State(state): State<AppState>,
    user: AuthUser,
    Path(kb_id): Path<String>,
    payload: Result<Json<NewSource>, JsonRejection>,
) -> Result<(StatusCode, Json<KnowledgeSource>), AppError> {
    let source = match json_body(payload)? {
        NewSource::Text { title, content } => {
            knowledge::create_text_source(
                &state.pool,
                &state.config,
                &user.id,
                &kb_id,
                &title,
                &content,
            )
            .await?
        }
        NewSource::Url { url, title } => {
            knowledge::create_url_source(
                &state.pool,
                &state.config,
                &user.id,
                &kb_id,
                &url,
                title.as_deref(),
            )
            .await?
        }
    };
    Ok((StatusCode::ACCEPTED, Json(source)))
}

async fn handle_upload_source(
    State(state): State<AppState>,
    user: AuthUser,
    Path(kb_id): Path<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<KnowledgeSource>), AppError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(multipart_error)?;
        let source = knowledge::create_upload_source(
            &state.pool,
            &state.config,
            &user.id,
            &kb_id,
            &filename,
            content_type.as_deref(),
            &bytes,
        )
        .await?;
        return Ok((StatusCode::ACCEPTED, Json(source)));
    }
    Err(KbError::bad_request("multipart field 'file' is required").into())
}

async fn handle_get_source(
    State(state): State<AppState>,
    user: AuthUser,
    Path(source_id): Path<String>,
) -> Result<Json<KnowledgeSource>, AppError> {
    Ok(Json(knowledge::get_source(&state.pool, &user.id, &source_id).await?))
}

async fn handle_delete_source(
    State(state): State<AppState>,
    user: AuthUser,
    Path(source_id): Path<String>,
) -> Result<StatusCode, AppError> {
    knowledge::delete_source(&state.pool, &user.id, &source_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_reindex_source(
    State(state): State<AppState>,
    user: AuthUser,
    Path(source_id): Path<String>,
) -> Result<(StatusCode, Json<KnowledgeSource>), AppError> {
    let source =
        knowledge::reindex_source(&state.pool, &state.config, &user.id, &source_id).await?;
    Ok((StatusCode::ACCEPTED, Json(source)))
}

// ============ Jobs ============

#[derive(Deserialize)]
struct JobsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

/// Load a job the caller may see (Viewer) or act on (Editor).
async fn authorized_job(state: &AppState, user: &AuthUser, job_id: &str, min: Role) -> Result<Job, AppError> {
    let missing = || KbError::not_found(format!("job {}", job_id));
    let job = queue::get_job(&state.pool, job_id).await?;
    let space_id = job.space_id.as_deref().ok_or_else(missing)?;
    spaces::require_role(&state.pool, space_id, &user.id, min)
        .await
        .map_err(|e| match e {
            KbError::NotFound(_) => missing(),
            other => other,
        })?;
    Ok(job)
}

async fn handle_list_jobs(
    State(state): State<AppState>,
    user: AuthUser,
    Path(space_id): Path<String>,
    query: Result<Query<JobsQuery>, QueryRejection>,
) -> Result<Json<Vec<Job>>, AppError> {
    let query = query_params(query)?;
    spaces::require_role(&state.pool, &space_id, &user.id, Role::Viewer).await?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(KbError::bad_request)?;
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_JOB_LIMIT);
    let jobs = queue::list_jobs(&state.pool, Some(&space_id), status, limit).await?;
    Ok(Json(jobs))
}

async fn handle_get_job(
    State(state): State<AppState>,
    user: AuthUser,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, AppError> {
    Ok(Json(authorized_job(&state, &user, &job_id, Role::Viewer).await?))
}

async fn handle_cancel_job(
    State(state): State<AppState>,
    user: AuthUser,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, AppError> {
    authorized_job(&state, &user, &job_id, Role::Editor).await?;
    Ok(Json(queue::cancel(&state.pool, &job_id).await?))
}

async fn handle_retry_job(
    State(state): State<AppState>,
    user: AuthUser,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, AppError> {
    authorized_job(&state, &user, &job_id, Role::Editor).await?;
    Ok(Json(queue::retry(&state.pool, &job_id).await?))
}

// ============ Assistants ============

async fn handle_list_assistants(
    State(state): State<AppState>,
    user: AuthUser,
    Path(space_id): Path<String>,
) -> Result<Json<Vec<Assistant>>, AppError> {
    Ok(Json(
        assistants::list_assistants(&state.pool, &user.id, &space_id).await?,
    ))
}

async fn handle_create_assistant(
    State(state): State<AppState>,
    user: AuthUser,
    Path(space_id): Path<String>,
    payload: Result<Json<AssistantInput>, JsonRejection>,
) -> Result<(StatusCode, Json<Assistant>), AppError> {
    let input = json_body(payload)?;
    let assistant = assistants::create_assistant(
        &state.pool,
        &user.id,
        &space_id,
        &input,
        state.config.llm.temperature,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(assistant)))
}

async fn handle_get_assistant(
    State(state): State<AppState>,
    user: AuthUser,
    Path(assistant_id): Path<String>,
) -> Result<Json<Assistant>, AppError> {
    Ok(Json(
        assistants::get_assistant(&state.pool, &user.id, &assistant_id).await?,
    ))
}

async fn handle_update_assistant(
    State(state): State<AppState>,
    user: AuthUser,
    Path(assistant_id): Path<String>,
    payload: Result<Json<AssistantPatch>, JsonRejection>,
) -> Result<Json<Assistant>, AppError> {
    let patch = json_body(payload)?;
    Ok(Json(
        assistants::update_assistant(&state.pool, &user.id, &assistant_id, &patch).await?,
    ))
}

async fn handle_delete_assistant(
    State(state): State<AppState>,
    user: AuthUser,
    Path(assistant_id): Path<String>,
) -> Result<StatusCode, AppError> {
    assistants::delete_assistant(&state.pool, &user.id, &assistant_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Conversations ============

#[derive(Deserialize)]
struct ConversationRequest {
    assistant_id: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Deserialize)]
struct ConversationsQuery {
    #[serde(default)]
    assistant_id: Option<String>,
}

#[derive(Deserialize)]
struct MessageRequest {
    content: String,
}

async fn handle_list_conversations(
    State(state): State<AppState>,
    user: AuthUser,
    query: Result<Query<ConversationsQuery>, QueryRejection>,
) -> Result<Json<Vec<Conversation>>, AppError> {
    let query = query_params(query)?;
    Ok(Json(
        chat::list_conversations(&state.pool, &user.id, query.assistant_id.as_deref()).await?,
    ))
}

async fn handle_create_conversation(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Result<Json<ConversationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Conversation>), AppError> {
    let req = json_body(payload)?;
    let conversation = chat::create_conversation(
        &state.pool,
        &user.id,
        &req.assistant_id,
        req.title.as_deref(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn handle_get_conversation(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<String>,
) -> Result<Json<Conversation>, AppError> {
    Ok(Json(
        chat::get_conversation(&state.pool, &user.id, &conversation_id).await?,
    ))
}

async fn handle_delete_conversation(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<String>,
) -> Result<StatusCode, AppError> {
    chat::delete_conversation(&state.pool, &user.id, &conversation_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_list_messages(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<String>,
) -> Result<Json<Vec<Message>>, AppError> {
    Ok(Json(
        chat::list_messages(&state.pool, &user.id, &conversation_id).await?,
    ))
}

fn sse_event(event: &ChatEvent) -> Event {
    Event::default()
        .event(event.name())
        .json_data(event)
        .unwrap_or_else(|e| {
            Event::default()
                .event("error")
                .data(format!("{{\"type\":\"error\",\"message\":\"{}\"}}", e))
        })
}

async fn handle_send_message(
    State(state): State<AppState>,
    user: AuthUser,
    Path(conversation_id): Path<String>,
    payload: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let req = json_body(payload)?;
    let events = state
        .chat
        .send_message(&user.id, &conversation_id, &req.content)
        .await?;

    let stream = futures_util::stream::unfold(events, |mut events| async move {
        let event = events.recv().await?;
        Some((Ok::<_, Infallible>(sse_event(&event)), events))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
