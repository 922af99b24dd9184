mod acl;
pub mod auth;
mod config;

use crate::server::auth::AuthCtx;
use crate::storage::{self, models};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware;
use axum::response::Response as AxumResponse;
use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{Method, StatusCode, header},
    routing::{get, post},
};
use bcrypt::verify;
pub use config::{AppConfig, ConfigError, Role, UserConfig};
use fampoints_shared::api;
use fampoints_shared::domain::UserId;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Span, info_span};
use uuid::Uuid;

type BalanceCacheMap =
    std::sync::Arc<Mutex<std::collections::HashMap<UserId, std::sync::Arc<Mutex<Option<i64>>>>>>;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: crate::storage::Store,
    // Cache of point totals per user. None => needs recompute
    balance_cache: BalanceCacheMap,
    shutdown: CancellationToken,
}

type BalanceGuard<'a> = MutexGuard<'a, Option<i64>>;

impl AppState {
    pub fn new(config: AppConfig, store: crate::storage::Store) -> Self {
        Self {
            config,
            store,
            balance_cache: Default::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Per-user lock guarding the cached balance. Every credit/redeem for a
    /// user runs under this lock, so check-then-debit sequences serialize.
    async fn user_mutex(&self, user_id: &UserId) -> std::sync::Arc<Mutex<Option<i64>>> {
        let mut map = self.balance_cache.lock().await;
        map.entry(user_id.clone())
            .or_insert_with(Default::default)
            .clone()
    }

    async fn reset_balance(&self, guard: &mut BalanceGuard<'_>) {
        guard.take();
    }

    async fn total_points(
        &self,
        user_id: &UserId,
        guard: &mut BalanceGuard<'_>,
    ) -> Result<i64, AppError> {
        if let Some(v) = **guard {
            return Ok(v);
        }

        // Compute and cache

        let v = self.store.compute_balance(&user_id.0).await?;

        **guard = Some(v);
        Ok(v)
    }
}

#[derive(Clone, Debug)]
struct ReqId(pub String);

pub fn router(state: AppState) -> Router {
    let private = Router::new()
        .route(
            "/api/v1/family/{family_id}/members",
            get(api_list_members),
        )
        .route(
            "/api/v1/family/{family_id}/members/{user_id}/points",
            get(api_member_points).post(api_credit_points),
        )
        .route(
            "/api/v1/family/{family_id}/members/{user_id}/ledger",
            get(api_member_ledger),
        )
        .route(
            "/api/v1/family/{family_id}/members/{user_id}/redemptions",
            get(api_member_redemptions),
        )
        .route(
            "/api/v1/family/{family_id}/rewards",
            get(api_list_rewards).post(api_create_reward),
        )
        .route(
            "/api/v1/family/{family_id}/rewards/{reward_id}/redeem",
            post(api_redeem_reward),
        )
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            acl::enforce_acl,
        ))
        .layer(middleware::from_fn(set_auth_span_fields))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    // Trace with request context (method, path, request_id)
    let trace = TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
        let request_id = req
            .extensions()
            .get::<ReqId>()
            .map(|r| r.0.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info_span!(
            "request",
            method = %req.method(),
            path = %req.uri().path(),
            request_id = %request_id,
            username = tracing::field::Empty,
            role = tracing::field::Empty,
            user_id = tracing::field::Empty,
            family_id = tracing::field::Empty
        )
    });

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/api/v1/version", get(api_version))
        .route("/api/v1/auth/login", post(api_auth_login))
        .merge(private)
        .with_state(state.clone())
        .layer(trace)
        .layer(middleware::from_fn(add_security_headers))
        .layer(middleware::from_fn(add_request_id));

    // Optionally add CORS for dev if configured

    if let Some(origin) = &state.config.dev_cors_origin {
        let hv = header::HeaderValue::from_str(origin)
            .unwrap_or(header::HeaderValue::from_static("http://localhost:5173"));
        let cors = CorsLayer::new()
            .allow_origin(hv)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
        app.layer(cors)
    } else {
        app
    }
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct VersionBody {
    version: &'static str,
}

async fn api_version() -> Json<VersionBody> {
    Json(VersionBody {
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn add_request_id(
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let hdr = HeaderName::from_static("x-request-id");
    // Use provided x-request-id if present, else generate
    let rid = req
        .headers()
        .get(&hdr)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    // Put into request extensions for trace layer & handlers
    req.extensions_mut().insert(ReqId(rid.clone()));
    // Call next
    let mut resp = next.run(req).await;
    // Set header on response
    if let Ok(hv) = HeaderValue::from_str(&rid) {
        resp.headers_mut().insert(hdr, hv);
    }
    Ok(resp)
}

async fn add_security_headers(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let path = req.uri().path().to_string();
    let mut resp = next.run(req).await;

    // General security headers for all responses
    let headers = resp.headers_mut();
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("SAMEORIGIN"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(
        HeaderName::from_static("cross-origin-opener-policy"),
        HeaderValue::from_static("same-origin"),
    );
    headers.insert(
        HeaderName::from_static("cross-origin-resource-policy"),
        HeaderValue::from_static("same-origin"),
    );
    // HSTS is only honored on HTTPS; harmless otherwise
    headers.insert(
        HeaderName::from_static("strict-transport-security"),
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );

    // Disable caching for API and health endpoints
    if path == "/healthz" || path.starts_with("/api/") || path == "/api" {
        headers.insert(
            HeaderName::from_static("cache-control"),
            HeaderValue::from_static("no-store, no-cache, must-revalidate, private"),
        );
        headers.insert(
            HeaderName::from_static("pragma"),
            HeaderValue::from_static("no-cache"),
        );
        headers.insert(
            HeaderName::from_static("expires"),
            HeaderValue::from_static("0"),
        );
    }

    Ok(resp)
}

async fn set_auth_span_fields(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    if let Some(auth) = req.extensions().get::<AuthCtx>() {
        let span = Span::current();
        let claims = &auth.claims;
        span.record("username", tracing::field::display(&claims.sub));
        span.record("role", tracing::field::debug(claims.role));
        span.record("user_id", tracing::field::display(&claims.user_id));
        span.record("family_id", tracing::field::display(&claims.family_id));
    }
    Ok(next.run(req).await)
}

#[derive(Deserialize)]
struct FamilyPath {
    family_id: String,
}

#[derive(Deserialize)]
struct MemberPath {
    family_id: String,
    user_id: String,
}

#[derive(Deserialize)]
struct RewardPath {
    family_id: String,
    reward_id: i32,
}

#[derive(Deserialize)]
struct PageOpts {
    page: Option<usize>,
    per_page: Option<usize>,
}

fn ledger_entry_dto(e: models::LedgerEntry) -> api::LedgerEntryDto {
    api::LedgerEntryDto {
        points: e.points,
        reason: e.reason,
        created_at: chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(
            e.created_at,
            chrono::Utc,
        )
        .to_rfc3339(),
    }
}

fn reward_dto(r: models::Reward) -> api::RewardDto {
    api::RewardDto {
        id: r.id,
        name: r.name,
        description: r.description,
        points_required: r.points_required,
    }
}

/// Looks up the addressed member, mapping an unknown or out-of-family id to
/// a 404 before any ledger work happens.
async fn member_in_family(
    state: &AppState,
    user_id: &str,
    family_id: &str,
) -> Result<models::User, AppError> {
    state
        .store
        .get_user_in_family(user_id, family_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("user not found in family: {}", user_id)))
}

async fn api_list_members(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthCtx>,
    Path(p): Path<FamilyPath>,
) -> Result<Json<Vec<api::MemberDto>>, AppError> {
    // ACL enforced by middleware
    let rows = state.store.list_members_with_balances(&p.family_id).await?;
    let items = rows
        .into_iter()
        .map(|(m, total)| api::MemberDto {
            role: models::role_from_str(&m.role),
            id: m.id,
            display_name: m.display_name,
            total_points: total,
        })
        .collect();
    Ok(Json(items))
}

async fn api_member_points(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthCtx>,
    Path(p): Path<MemberPath>,
) -> Result<Json<api::PointsDto>, AppError> {
    // ACL enforced by middleware
    let member = member_in_family(&state, &p.user_id, &p.family_id).await?;

    let uid = UserId(member.id.clone());
    let user_mutex = state.user_mutex(&uid).await;
    let mut guard = user_mutex.lock().await;
    let total = state.total_points(&uid, &mut guard).await?;

    let recent = state.store.list_ledger_for_user(&member.id, 1, 10).await?;
    Ok(Json(api::PointsDto {
        user_id: member.id,
        total_points: total,
        recent: recent.into_iter().map(ledger_entry_dto).collect(),
    }))
}

async fn api_credit_points(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthCtx>,
    Path(p): Path<MemberPath>,
    Json(body): Json<api::CreditReq>,
) -> Result<Json<api::CreditResp>, AppError> {
    let member = member_in_family(&state, &p.user_id, &p.family_id).await?;
    let reason = body.reason.trim();
    if reason.is_empty() {
        return Err(AppError::bad_request("reason is required"));
    }

    // Invalidate cache for this user; compute after DB update
    let uid = UserId(member.id.clone());
    let user_mutex = state.user_mutex(&uid).await;
    let mut guard = user_mutex.lock().await;
    state.reset_balance(&mut guard).await;

    state
        .store
        .credit_points(&member.id, body.points, reason)
        .await?;
    let total = state.total_points(&uid, &mut guard).await?;
    Ok(Json(api::CreditResp {
        user_id: member.id,
        total_points: total,
    }))
}

async fn api_member_ledger(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthCtx>,
    Path(p): Path<MemberPath>,
    Query(opts): Query<PageOpts>,
) -> Result<Json<Vec<api::LedgerEntryDto>>, AppError> {
    let member = member_in_family(&state, &p.user_id, &p.family_id).await?;
    let page = opts.page.unwrap_or(1);
    let per_page = opts.per_page.unwrap_or(10);
    let rows = state
        .store
        .list_ledger_for_user(&member.id, page, per_page)
        .await?;
    Ok(Json(rows.into_iter().map(ledger_entry_dto).collect()))
}

async fn api_member_redemptions(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthCtx>,
    Path(p): Path<MemberPath>,
    Query(opts): Query<PageOpts>,
) -> Result<Json<Vec<api::RedemptionDto>>, AppError> {
    let member = member_in_family(&state, &p.user_id, &p.family_id).await?;
    let page = opts.page.unwrap_or(1);
    let per_page = opts.per_page.unwrap_or(10);
    let rows = state
        .store
        .list_redemptions_for_user(&member.id, page, per_page)
        .await?;
    let items = rows
        .into_iter()
        .map(|(r, reward_name)| api::RedemptionDto {
            reward_name,
            points_spent: r.points_spent,
            redeemed_at: chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(
                r.redeemed_at,
                chrono::Utc,
            )
            .to_rfc3339(),
        })
        .collect();
    Ok(Json(items))
}

async fn api_list_rewards(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthCtx>,
    Path(p): Path<FamilyPath>,
) -> Result<Json<Vec<api::RewardDto>>, AppError> {
    let rows = state.store.list_rewards_for_family(&p.family_id).await?;
    Ok(Json(rows.into_iter().map(reward_dto).collect()))
}

async fn api_create_reward(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthCtx>,
    Path(p): Path<FamilyPath>,
    Json(body): Json<api::CreateRewardReq>,
) -> Result<Json<api::RewardDto>, AppError> {
    // Parent role enforced by the ACL middleware
    let name = body.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("reward name is required"));
    }
    if body.points_required <= 0 {
        return Err(AppError::bad_request("points_required must be positive"));
    }
    let description = body
        .description
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let reward = state
        .store
        .create_reward(&p.family_id, name, description, body.points_required)
        .await?;
    Ok(Json(reward_dto(reward)))
}

async fn api_redeem_reward(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(p): Path<RewardPath>,
) -> Result<Json<api::RedeemResp>, AppError> {
    // Redemption debits the authenticated caller, never a third party
    let claims = &auth.claims;
    let uid = claims.user_id.clone();

    let user_mutex = state.user_mutex(&uid).await;
    let mut guard = user_mutex.lock().await;
    state.reset_balance(&mut guard).await;

    let outcome = state
        .store
        .redeem_reward(&uid.0, p.reward_id, &p.family_id)
        .await?;
    *guard = Some(outcome.new_balance);
    Ok(Json(api::RedeemResp {
        reward_id: outcome.reward_id,
        points_spent: outcome.points_spent,
        total_points: outcome.new_balance,
    }))
}

async fn api_auth_login(
    State(state): State<AppState>,
    Json(body): Json<api::AuthReq>,
) -> Result<Json<api::AuthResp>, AppError> {
    // Find user in config
    let user = state
        .config
        .users
        .iter()
        .find(|u| u.username == body.username)
        .ok_or_else(|| {
            tracing::warn!(username=%body.username, "login: unknown username");
            AppError::unauthorized()
        })?;
    if !verify(&body.password, &user.password_hash).map_err(|e| {
        tracing::error!(username=%body.username, error=%e, "login: bcrypt verify failed");
        AppError::internal(e)
    })? {
        tracing::warn!(username=%body.username, "login: invalid password");
        return Err(AppError::unauthorized());
    }
    let token = auth::issue_jwt_for_user(&state, user).await?;
    Ok(Json(api::AuthResp { token }))
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized,
    Forbidden,
    NotFound(String),
    InsufficientPoints { required: i64, balance: i64 },
    Conflict(String),
    Internal(String),
}

impl AppError {
    fn bad_request<T: Into<String>>(msg: T) -> Self {
        Self::BadRequest(msg.into())
    }
    fn unauthorized() -> Self {
        Self::Unauthorized
    }
    fn forbidden() -> Self {
        Self::Forbidden
    }
    fn not_found<T: Into<String>>(msg: T) -> Self {
        Self::NotFound(msg.into())
    }
    fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<storage::StorageError> for AppError {
    fn from(e: storage::StorageError) -> Self {
        use diesel::result::{DatabaseErrorKind, Error as DieselError};
        match e {
            storage::StorageError::NotFound(msg) => AppError::NotFound(msg),
            storage::StorageError::InvalidAmount(v) => {
                AppError::BadRequest(format!("invalid amount: {v}"))
            }
            storage::StorageError::InsufficientPoints { required, balance } => {
                AppError::InsufficientPoints { required, balance }
            }
            storage::StorageError::Database(DieselError::DatabaseError(
                DatabaseErrorKind::SerializationFailure,
                info,
            )) => AppError::Conflict(info.message().to_string()),
            storage::StorageError::Database(DieselError::DatabaseError(_, info))
                if info.message().contains("database is locked") =>
            {
                AppError::Conflict(info.message().to_string())
            }
            other => AppError::internal(other),
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, kind, detail) = match self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m, "bad_request", None),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized".into(),
                "unauthorized",
                None,
            ),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden".into(), "forbidden", None),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m, "not_found", None),
            AppError::InsufficientPoints { required, balance } => (
                StatusCode::BAD_REQUEST,
                format!("insufficient points: need {} more", required - balance),
                "insufficient_points",
                None,
            ),
            // Retriable: the write lost a race with a concurrent transaction
            AppError::Conflict(m) => (StatusCode::CONFLICT, m, "conflict", None),
            // Do not leak internal error details to clients, but log them
            AppError::Internal(m) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".into(),
                "internal",
                Some(m),
            ),
        };
        // Log any error responses at ERROR level to file for troubleshooting
        if let Some(detail) = detail {
            tracing::error!(status = %status, kind = kind, message = %msg, detail = %detail, "request failed");
        } else {
            tracing::error!(status = %status, kind = kind, message = %msg, "request failed");
        }
        let body = axum::Json(ErrorBody { error: msg });
        (status, body).into_response()
    }
}
