use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{NaiveDate, Utc};
use llmeter::{
    ApiKeyDailyReport, ApiKeyRecord, ApiKeyUsage, CallLogRecord, ChatRequest, DailyReport,
    EmbeddingsRequest, LlmProxy, ProxyError,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::services::ServeDir;

#[derive(Clone)]
struct AppState {
    proxy: LlmProxy,
}

pub async fn serve(
    addr: SocketAddr,
    proxy: LlmProxy,
    static_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = Arc::new(AppState { proxy });

    let mut router = Router::new()
        .route("/health", get(health_check))
        // OpenAI-compatible proxy surface
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        // Reporting surface
        .route("/reports/daily", get(daily_reports))
        .route("/logs", get(list_logs))
        .route("/api-keys", get(list_api_keys))
        .route("/api-keys/usage", get(api_key_usage))
        .route("/api-keys/reports/daily", get(api_key_daily_reports))
        .route("/api-keys/:id/usage", get(api_key_usage_by_id));

    if let Some(dir) = static_dir.as_ref() {
        if dir.is_dir() {
            router = router.fallback_service(ServeDir::new(dir));
        } else {
            eprintln!("static dir '{}' is not a directory", dir.display());
        }
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    println!("llmeter proxy listening on http://{bound_addr}");

    axum::serve(listener, router.with_state(state)).await?;
    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({"status": "ok", "timestamp": Utc::now().to_rfc3339()}))
}

/// Bearer credential from the Authorization header, if any. Absence is not
/// an error: the call is simply accounted as anonymous.
fn bearer_credential(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

fn proxy_error_response(err: ProxyError) -> Response {
    eprintln!("proxy error: {err}");
    let (status, message) = match &err {
        ProxyError::GatewayNotConfigured => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        ProxyError::Upstream { status, message } => (
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            message.clone(),
        ),
        ProxyError::Http(source) if source.is_timeout() => (
            StatusCode::GATEWAY_TIMEOUT,
            "upstream request timed out".to_owned(),
        ),
        ProxyError::Http(_) => (StatusCode::BAD_GATEWAY, err.to_string()),
        ProxyError::InvalidEndpoint { .. }
        | ProxyError::DuplicateKeyHash
        | ProxyError::Database(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_owned(),
        ),
    };
    error_response(status, &message)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let request: ChatRequest = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid request: {err}"));
        }
    };

    let credential = bearer_credential(&headers);
    match state
        .proxy
        .chat_completion(request, credential.as_deref())
        .await
    {
        Ok(body) => Json(body).into_response(),
        Err(err) => proxy_error_response(err),
    }
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let request: EmbeddingsRequest = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid request: {err}"));
        }
    };

    let credential = bearer_credential(&headers);
    match state.proxy.embeddings(request, credential.as_deref()).await {
        Ok(body) => Json(body).into_response(),
        Err(err) => proxy_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    from: Option<String>,
    to: Option<String>,
    model: Option<String>,
}

/// Inclusive unix-second range covering `from` 00:00:00 through `to`
/// 23:59:59 UTC; both bounds are `YYYY-MM-DD`.
fn parse_day_range(from: Option<&str>, to: Option<&str>) -> Option<(i64, i64)> {
    let from = NaiveDate::parse_from_str(from?, "%Y-%m-%d").ok()?;
    let to = NaiveDate::parse_from_str(to?, "%Y-%m-%d").ok()?;
    let start = from.and_hms_opt(0, 0, 0)?.and_utc().timestamp();
    let end = to.and_hms_opt(23, 59, 59)?.and_utc().timestamp();
    Some((start, end))
}

async fn daily_reports(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangeQuery>,
) -> Response {
    let Some((from, to)) = parse_day_range(params.from.as_deref(), params.to.as_deref()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "from and to parameters are required (YYYY-MM-DD)",
        );
    };

    match state.proxy.daily_reports(from, to).await {
        Ok(days) => Json(json!({
            "days": days.into_iter().map(DailyReportView::from).collect::<Vec<_>>()
        }))
        .into_response(),
        Err(err) => proxy_error_response(err),
    }
}

async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangeQuery>,
) -> Response {
    let Some((from, to)) = parse_day_range(params.from.as_deref(), params.to.as_deref()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "from and to parameters are required (YYYY-MM-DD)",
        );
    };

    match state
        .proxy
        .call_logs_between(from, to, params.model.as_deref())
        .await
    {
        Ok(logs) => {
            let items: Vec<CallLogView> = logs.into_iter().map(CallLogView::from).collect();
            let total = items.len();
            Json(json!({"items": items, "total": total})).into_response()
        }
        Err(err) => proxy_error_response(err),
    }
}

async fn list_api_keys(State(state): State<Arc<AppState>>) -> Response {
    match state.proxy.list_api_keys().await {
        Ok(keys) => Json(keys.into_iter().map(ApiKeyView::from).collect::<Vec<_>>()).into_response(),
        Err(err) => proxy_error_response(err),
    }
}

async fn api_key_usage(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangeQuery>,
) -> Response {
    let Some((from, to)) = parse_day_range(params.from.as_deref(), params.to.as_deref()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "from and to parameters are required (YYYY-MM-DD)",
        );
    };

    match state.proxy.api_key_usage(from, to).await {
        Ok(usage) => Json(
            usage
                .into_iter()
                .map(ApiKeyUsageView::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => proxy_error_response(err),
    }
}

async fn api_key_daily_reports(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangeQuery>,
) -> Response {
    let Some((from, to)) = parse_day_range(params.from.as_deref(), params.to.as_deref()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "from and to parameters are required (YYYY-MM-DD)",
        );
    };

    match state.proxy.api_key_daily_reports(from, to).await {
        Ok(reports) => Json(
            reports
                .into_iter()
                .map(ApiKeyDailyReportView::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => proxy_error_response(err),
    }
}

async fn api_key_usage_by_id(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<RangeQuery>,
) -> Response {
    let Some((from, to)) = parse_day_range(params.from.as_deref(), params.to.as_deref()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "from and to parameters are required (YYYY-MM-DD)",
        );
    };

    match state.proxy.api_key_usage_by_id(&id, from, to).await {
        Ok(Some(usage)) => Json(ApiKeyUsageView::from(usage)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "API key not found"),
        Err(err) => proxy_error_response(err),
    }
}

// ----- views -----

#[derive(Debug, Serialize)]
struct DailyReportView {
    date: String,
    total_tokens: i64,
    cost: f64,
    cache_hit_rate: f64,
    saved_estimate: f64,
}

impl From<DailyReport> for DailyReportView {
    fn from(report: DailyReport) -> Self {
        Self {
            date: report.date,
            total_tokens: report.total_tokens,
            cost: report.cost,
            cache_hit_rate: report.cache_hit_rate,
            saved_estimate: report.saved_estimate,
        }
    }
}

#[derive(Debug, Serialize)]
struct CallLogView {
    id: String,
    ts: i64,
    model: String,
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
    cost: f64,
    cache_hit: bool,
    latency_ms: i64,
    api_key_id: Option<String>,
}

impl From<CallLogRecord> for CallLogView {
    fn from(record: CallLogRecord) -> Self {
        Self {
            id: record.id,
            ts: record.ts,
            model: record.model,
            prompt_tokens: record.prompt_tokens,
            completion_tokens: record.completion_tokens,
            total_tokens: record.total_tokens,
            cost: record.cost,
            cache_hit: record.cache_hit,
            latency_ms: record.latency_ms,
            api_key_id: record.api_key_id,
        }
    }
}

/// Identity view: never includes the raw credential or any hash.
#[derive(Debug, Serialize)]
struct ApiKeyView {
    id: String,
    key_prefix: String,
    created_at: i64,
    last_used_at: Option<i64>,
    is_active: bool,
    description: Option<String>,
}

impl From<ApiKeyRecord> for ApiKeyView {
    fn from(record: ApiKeyRecord) -> Self {
        Self {
            id: record.id,
            key_prefix: record.key_prefix,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
            is_active: record.is_active,
            description: record.description,
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiKeyUsageView {
    api_key_id: String,
    key_prefix: String,
    total_tokens: i64,
    total_cost: f64,
    call_count: i64,
    last_used_at: Option<i64>,
}

impl From<ApiKeyUsage> for ApiKeyUsageView {
    fn from(usage: ApiKeyUsage) -> Self {
        Self {
            api_key_id: usage.api_key_id,
            key_prefix: usage.key_prefix,
            total_tokens: usage.total_tokens,
            total_cost: usage.total_cost,
            call_count: usage.call_count,
            last_used_at: usage.last_used_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiKeyDailyReportView {
    api_key_id: String,
    key_prefix: String,
    date: String,
    total_tokens: i64,
    cost: f64,
    call_count: i64,
}

impl From<ApiKeyDailyReport> for ApiKeyDailyReportView {
    fn from(report: ApiKeyDailyReport) -> Self {
        Self {
            api_key_id: report.api_key_id,
            key_prefix: report.key_prefix,
            date: report.date,
            total_tokens: report.total_tokens,
            cost: report.cost,
            call_count: report.call_count,
        }
    }
}
