use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use nanoid::nanoid;
use rand::RngCore;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use url::Url;

/// Default OpenAI-compatible upstream base URL.
pub const DEFAULT_UPSTREAM: &str = "https://api.openai.com/v1";

/// Fixed domain-separation salt for the deterministic lookup digest.
/// Changing it orphans every stored identity, so it is versioned.
const LOOKUP_DOMAIN_SALT: &[u8] = b"llmeter/api-key-lookup/v1";
const VERIFY_DOMAIN_SALT: &[u8] = b"llmeter/api-key-verify/v1";
const VERIFY_SALT_LEN: usize = 32;

const KEY_PREFIX_LEN: usize = 8;

/// Flat USD rate per 1K total tokens applied to models missing from the
/// pricing table, so an unexpected model is never reported as free.
const UNKNOWN_MODEL_RATE_PER_1K: f64 = 0.002;

/// Fraction of cost counted as saved when a call was served from cache.
const CACHE_SAVED_FRACTION: f64 = 0.3;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// (model, input USD per 1K tokens, output USD per 1K tokens)
const MODEL_RATES: &[(&str, f64, f64)] = &[
    ("gpt-4", 0.03, 0.06),
    ("gpt-4-turbo", 0.01, 0.03),
    ("gpt-3.5-turbo", 0.0015, 0.002),
    ("gpt-3.5-turbo-16k", 0.003, 0.004),
    ("text-embedding-ada-002", 0.0001, 0.0),
    ("text-embedding-3-small", 0.00002, 0.0),
    ("text-embedding-3-large", 0.00013, 0.0),
];

/// Deterministic one-way digest of a raw credential, used as the unique
/// lookup key for identity resolution. Stable across process restarts.
pub fn lookup_hash(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(LOOKUP_DOMAIN_SALT);
    hasher.update([0u8]);
    hasher.update(credential.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Randomized one-way digest of a raw credential, salted per identity.
/// Stored for future possession verification; returns (digest, salt).
pub fn verification_hash(credential: &str) -> (String, String) {
    let mut salt = [0u8; VERIFY_SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut hasher = Sha256::new();
    hasher.update(VERIFY_DOMAIN_SALT);
    hasher.update([0u8]);
    hasher.update(salt);
    hasher.update(credential.as_bytes());
    (
        URL_SAFE_NO_PAD.encode(hasher.finalize()),
        URL_SAFE_NO_PAD.encode(salt),
    )
}

/// First 8 characters of a credential, kept for human identification only.
pub fn key_prefix(credential: &str) -> String {
    credential.chars().take(KEY_PREFIX_LEN).collect()
}

/// Collision-resistant identifier for new identities and usage events.
pub fn new_record_id() -> String {
    nanoid!()
}

/// Cost in USD for a call, using per-model rates where known and the flat
/// blended rate otherwise. Pure; same inputs always yield the same cost.
pub fn calculate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    match MODEL_RATES.iter().find(|(name, _, _)| *name == model) {
        Some((_, input_rate, output_rate)) => {
            (input_tokens as f64 * input_rate + output_tokens as f64 * output_rate) / 1000.0
        }
        None => (input_tokens + output_tokens) as f64 * UNKNOWN_MODEL_RATE_PER_1K / 1000.0,
    }
}

/// Provider-reported token counts from a response envelope, as
/// (input, output). Responses without a usage block count as (0, 0);
/// no estimation is attempted.
pub fn extract_usage(response: &Value) -> (u64, u64) {
    match response.get("usage") {
        Some(usage) => (
            usage
                .get("prompt_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        ),
        None => (0, 0),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Inbound chat completion request. Fields the proxy does not inspect are
/// captured in `extra` and forwarded upstream untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Inbound embeddings request; `input` may be a string or array of strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A caller identity derived from a credential. The raw credential and its
/// hashes never leave the store.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: String,
    pub key_prefix: String,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
    pub is_active: bool,
    pub description: Option<String>,
}

/// One immutable usage event per accounted call.
#[derive(Debug, Clone)]
pub struct CallLogRecord {
    pub id: String,
    pub ts: i64,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost: f64,
    pub cache_hit: bool,
    pub latency_ms: i64,
    pub api_key_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DailyReport {
    pub date: String,
    pub total_tokens: i64,
    pub cost: f64,
    pub cache_hit_rate: f64,
    pub saved_estimate: f64,
}

#[derive(Debug, Clone)]
pub struct ApiKeyUsage {
    pub api_key_id: String,
    pub key_prefix: String,
    pub total_tokens: i64,
    pub total_cost: f64,
    pub call_count: i64,
    pub last_used_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ApiKeyDailyReport {
    pub api_key_id: String,
    pub key_prefix: String,
    pub date: String,
    pub total_tokens: i64,
    pub cost: f64,
    pub call_count: i64,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no inference gateway configured")]
    GatewayNotConfigured,
    #[error("invalid upstream endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api key hash already exists")]
    DuplicateKeyHash,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Outbound port to the upstream inference provider.
#[async_trait]
pub trait InferenceGateway: Send + Sync {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<Value, ProxyError>;
    async fn embeddings(&self, request: &EmbeddingsRequest) -> Result<Value, ProxyError>;
}

/// HTTP adapter for OpenAI-compatible providers.
#[derive(Debug, Clone)]
pub struct OpenAiGateway {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl OpenAiGateway {
    pub fn new(api_key: &str, base_url: &str) -> Result<Self, ProxyError> {
        let base_url = Url::parse(base_url).map_err(|source| ProxyError::InvalidEndpoint {
            endpoint: base_url.to_owned(),
            source,
        })?;
        let client = Client::builder().timeout(UPSTREAM_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.to_owned(),
        })
    }

    async fn forward<T: Serialize + Sync>(
        &self,
        path: &str,
        request: &T,
    ) -> Result<Value, ProxyError> {
        let url = format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::Upstream {
                status: status.as_u16(),
                message: upstream_error_message(status, &body),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl InferenceGateway for OpenAiGateway {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<Value, ProxyError> {
        self.forward("chat/completions", request).await
    }

    async fn embeddings(&self, request: &EmbeddingsRequest) -> Result<Value, ProxyError> {
        self.forward("embeddings", request).await
    }
}

fn upstream_error_message(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        let error = value.get("error")?;
        error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| error.as_str().map(str::to_owned))
    });
    match detail {
        Some(message) => message,
        None => format!("upstream returned {status}"),
    }
}

/// Proxies inference calls and records per-identity usage. Accounting is
/// strictly secondary: once the upstream response exists, no accounting
/// failure changes what the caller receives.
#[derive(Clone)]
pub struct LlmProxy {
    gateway: Option<Arc<dyn InferenceGateway>>,
    store: UsageStore,
}

impl LlmProxy {
    pub async fn new(
        gateway: Option<Arc<dyn InferenceGateway>>,
        database_path: &str,
    ) -> Result<Self, ProxyError> {
        let store = UsageStore::new(database_path).await?;
        Ok(Self { gateway, store })
    }

    pub fn with_store(gateway: Option<Arc<dyn InferenceGateway>>, store: UsageStore) -> Self {
        Self { gateway, store }
    }

    /// Forward a chat completion upstream, then account the call.
    pub async fn chat_completion(
        &self,
        request: ChatRequest,
        credential: Option<&str>,
    ) -> Result<Value, ProxyError> {
        let gateway = self
            .gateway
            .as_ref()
            .ok_or(ProxyError::GatewayNotConfigured)?;

        let started = Instant::now();
        let response = gateway.chat_completion(&request).await?;
        let latency_ms = started.elapsed().as_millis() as i64;

        self.account(&request.model, &response, latency_ms, credential)
            .await;
        Ok(response)
    }

    /// Forward an embeddings request upstream, then account the call.
    pub async fn embeddings(
        &self,
        request: EmbeddingsRequest,
        credential: Option<&str>,
    ) -> Result<Value, ProxyError> {
        let gateway = self
            .gateway
            .as_ref()
            .ok_or(ProxyError::GatewayNotConfigured)?;

        let started = Instant::now();
        let response = gateway.embeddings(&request).await?;
        let latency_ms = started.elapsed().as_millis() as i64;

        self.account(&request.model, &response, latency_ms, credential)
            .await;
        Ok(response)
    }

    /// Record one usage event for a successful upstream response. The model
    /// is taken from the request, not from whatever the response echoes.
    /// Every failure path in here is logged and swallowed.
    async fn account(
        &self,
        model: &str,
        response: &Value,
        latency_ms: i64,
        credential: Option<&str>,
    ) {
        let (input_tokens, output_tokens) = extract_usage(response);
        let cost = calculate_cost(model, input_tokens, output_tokens);

        let api_key_id = match credential {
            Some(raw) => self.resolve_key(raw).await,
            None => None,
        };

        if let Some(id) = api_key_id.as_deref()
            && let Err(err) = self.store.touch_last_used(id).await
        {
            eprintln!("accounting: last-used update failed for key {id}: {err}");
        }

        let log = CallLogRecord {
            id: new_record_id(),
            ts: Utc::now().timestamp(),
            model: model.to_owned(),
            prompt_tokens: input_tokens as i64,
            completion_tokens: output_tokens as i64,
            total_tokens: (input_tokens + output_tokens) as i64,
            cost,
            cache_hit: false,
            latency_ms,
            api_key_id,
        };

        log_call(credential, model, log.total_tokens, cost, latency_ms);

        if let Err(err) = self.store.append_call_log(&log).await {
            eprintln!("accounting: usage event {} not persisted: {err}", log.id);
        }
    }

    /// Resolve a credential to an identity id, creating the identity on
    /// first use. Returns None on any failure; the call proceeds anonymous.
    async fn resolve_key(&self, credential: &str) -> Option<String> {
        let hash = lookup_hash(credential);

        match self.store.find_key_by_hash(&hash).await {
            Ok(Some(key)) => Some(key.id),
            Ok(None) => match self.store.create_key(credential, None).await {
                Ok(key) => Some(key.id),
                // Lost a first-use race; the winner's row is authoritative.
                Err(ProxyError::DuplicateKeyHash) => {
                    match self.store.find_key_by_hash(&hash).await {
                        Ok(Some(key)) => Some(key.id),
                        Ok(None) => None,
                        Err(err) => {
                            eprintln!("accounting: api key re-lookup failed: {err}");
                            None
                        }
                    }
                }
                Err(err) => {
                    eprintln!("accounting: api key creation failed: {err}");
                    None
                }
            },
            Err(err) => {
                eprintln!("accounting: api key lookup failed: {err}");
                None
            }
        }
    }

    // ----- reporting pass-throughs -----

    pub async fn daily_reports(&self, from: i64, to: i64) -> Result<Vec<DailyReport>, ProxyError> {
        self.store.daily_reports(from, to).await
    }

    pub async fn call_logs_between(
        &self,
        from: i64,
        to: i64,
        model: Option<&str>,
    ) -> Result<Vec<CallLogRecord>, ProxyError> {
        self.store.call_logs_between(from, to, model).await
    }

    pub async fn recent_call_logs(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CallLogRecord>, ProxyError> {
        self.store.recent_call_logs(limit, offset).await
    }

    pub async fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>, ProxyError> {
        self.store.list_keys().await
    }

    pub async fn deactivate_api_key(&self, key_id: &str) -> Result<(), ProxyError> {
        self.store.deactivate_key(key_id).await
    }

    pub async fn api_key_usage(&self, from: i64, to: i64) -> Result<Vec<ApiKeyUsage>, ProxyError> {
        self.store.key_usage(from, to).await
    }

    pub async fn api_key_daily_reports(
        &self,
        from: i64,
        to: i64,
    ) -> Result<Vec<ApiKeyDailyReport>, ProxyError> {
        self.store.key_daily_reports(from, to).await
    }

    pub async fn api_key_usage_by_id(
        &self,
        key_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Option<ApiKeyUsage>, ProxyError> {
        self.store.key_usage_by_id(key_id, from, to).await
    }
}

/// SQLite-backed repository for identities and usage events.
#[derive(Debug, Clone)]
pub struct UsageStore {
    pool: SqlitePool,
}

impl UsageStore {
    pub async fn new(database_path: &str) -> Result<Self, ProxyError> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// Ephemeral in-memory store. Single connection, because every SQLite
    /// `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self, ProxyError> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), ProxyError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                key_prefix TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                verification_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_used_at INTEGER,
                is_active INTEGER NOT NULL DEFAULT 1,
                description TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS call_logs (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                cost REAL NOT NULL,
                cache_hit INTEGER NOT NULL DEFAULT 0,
                latency_ms INTEGER NOT NULL,
                api_key_id TEXT REFERENCES api_keys(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_keys_prefix ON api_keys(key_prefix)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_call_logs_ts ON call_logs(ts)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_call_logs_api_key ON call_logs(api_key_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn find_key_by_hash(&self, hash: &str) -> Result<Option<ApiKeyRecord>, ProxyError> {
        let row = sqlx::query(
            r#"
            SELECT id, key_prefix, created_at, last_used_at, is_active, description
            FROM api_keys
            WHERE key_hash = ?
            LIMIT 1
            "#,
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| map_api_key(&row))
            .transpose()
            .map_err(Into::into)
    }

    /// Create an identity from a raw credential. The lookup hash, prefix and
    /// verification hash are derived here; the raw credential is never
    /// stored. Fails with [`ProxyError::DuplicateKeyHash`] when the lookup
    /// hash already exists.
    pub async fn create_key(
        &self,
        credential: &str,
        description: Option<&str>,
    ) -> Result<ApiKeyRecord, ProxyError> {
        let id = new_record_id();
        let hash = lookup_hash(credential);
        let prefix = key_prefix(credential);
        let (verification, salt) = verification_hash(credential);
        let created_at = Utc::now().timestamp();

        let inserted = sqlx::query(
            r#"
            INSERT INTO api_keys (
                id, key_prefix, key_hash, verification_hash, salt,
                created_at, is_active, description
            ) VALUES (?, ?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(&id)
        .bind(&prefix)
        .bind(&hash)
        .bind(&verification)
        .bind(&salt)
        .bind(created_at)
        .bind(description)
        .execute(&self.pool)
        .await;

        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(ProxyError::DuplicateKeyHash);
            }
            return Err(err.into());
        }

        Ok(ApiKeyRecord {
            id,
            key_prefix: prefix,
            created_at,
            last_used_at: None,
            is_active: true,
            description: description.map(str::to_owned),
        })
    }

    pub async fn touch_last_used(&self, key_id: &str) -> Result<(), ProxyError> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn deactivate_key(&self, key_id: &str) -> Result<(), ProxyError> {
        sqlx::query("UPDATE api_keys SET is_active = 0 WHERE id = ?")
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_keys(&self) -> Result<Vec<ApiKeyRecord>, ProxyError> {
        let rows = sqlx::query(
            r#"
            SELECT id, key_prefix, created_at, last_used_at, is_active, description
            FROM api_keys
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| map_api_key(row).map_err(Into::into))
            .collect()
    }

    pub async fn append_call_log(&self, log: &CallLogRecord) -> Result<(), ProxyError> {
        sqlx::query(
            r#"
            INSERT INTO call_logs (
                id, ts, model, prompt_tokens, completion_tokens, total_tokens,
                cost, cache_hit, latency_ms, api_key_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.id)
        .bind(log.ts)
        .bind(&log.model)
        .bind(log.prompt_tokens)
        .bind(log.completion_tokens)
        .bind(log.total_tokens)
        .bind(log.cost)
        .bind(log.cache_hit)
        .bind(log.latency_ms)
        .bind(log.api_key_id.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_call_logs(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CallLogRecord>, ProxyError> {
        let rows = sqlx::query(
            r#"
            SELECT id, ts, model, prompt_tokens, completion_tokens, total_tokens,
                   cost, cache_hit, latency_ms, api_key_id
            FROM call_logs
            ORDER BY ts DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit.clamp(1, 500) as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| map_call_log(row).map_err(Into::into))
            .collect()
    }

    pub async fn call_logs_between(
        &self,
        from: i64,
        to: i64,
        model: Option<&str>,
    ) -> Result<Vec<CallLogRecord>, ProxyError> {
        let rows = match model {
            Some(model) => {
                sqlx::query(
                    r#"
                    SELECT id, ts, model, prompt_tokens, completion_tokens, total_tokens,
                           cost, cache_hit, latency_ms, api_key_id
                    FROM call_logs
                    WHERE ts >= ? AND ts <= ? AND model LIKE ?
                    ORDER BY ts DESC, id DESC
                    "#,
                )
                .bind(from)
                .bind(to)
                .bind(format!("%{model}%"))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, ts, model, prompt_tokens, completion_tokens, total_tokens,
                           cost, cache_hit, latency_ms, api_key_id
                    FROM call_logs
                    WHERE ts >= ? AND ts <= ?
                    ORDER BY ts DESC, id DESC
                    "#,
                )
                .bind(from)
                .bind(to)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter()
            .map(|row| map_call_log(row).map_err(Into::into))
            .collect()
    }

    pub async fn daily_reports(&self, from: i64, to: i64) -> Result<Vec<DailyReport>, ProxyError> {
        let rows = sqlx::query(
            r#"
            SELECT
                DATE(ts, 'unixepoch') AS date,
                COALESCE(SUM(total_tokens), 0) AS total_tokens,
                COALESCE(SUM(cost), 0.0) AS cost,
                COALESCE(AVG(CASE WHEN cache_hit THEN 1.0 ELSE 0.0 END), 0.0) AS cache_hit_rate,
                COALESCE(SUM(CASE WHEN cache_hit THEN cost * ? ELSE 0.0 END), 0.0) AS saved_estimate
            FROM call_logs
            WHERE ts >= ? AND ts <= ?
            GROUP BY date
            ORDER BY date ASC
            "#,
        )
        .bind(CACHE_SAVED_FRACTION)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let reports = rows
            .into_iter()
            .map(|row| -> Result<DailyReport, sqlx::Error> {
                Ok(DailyReport {
                    date: row.try_get("date")?,
                    total_tokens: row.try_get("total_tokens")?,
                    cost: row.try_get("cost")?,
                    cache_hit_rate: row.try_get("cache_hit_rate")?,
                    saved_estimate: row.try_get("saved_estimate")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(reports)
    }

    /// Per-identity usage totals over a range. Deactivated identities are
    /// excluded from every aggregate view.
    pub async fn key_usage(&self, from: i64, to: i64) -> Result<Vec<ApiKeyUsage>, ProxyError> {
        let rows = sqlx::query(
            r#"
            SELECT
                ak.id AS api_key_id,
                ak.key_prefix,
                ak.last_used_at,
                COALESCE(SUM(cl.total_tokens), 0) AS total_tokens,
                COALESCE(SUM(cl.cost), 0.0) AS total_cost,
                COUNT(cl.id) AS call_count
            FROM api_keys ak
            JOIN call_logs cl ON cl.api_key_id = ak.id
            WHERE ak.is_active = 1 AND cl.ts >= ? AND cl.ts <= ?
            GROUP BY ak.id, ak.key_prefix, ak.last_used_at
            ORDER BY total_cost DESC, ak.id ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let usage = rows
            .into_iter()
            .map(|row| -> Result<ApiKeyUsage, sqlx::Error> {
                Ok(ApiKeyUsage {
                    api_key_id: row.try_get("api_key_id")?,
                    key_prefix: row.try_get("key_prefix")?,
                    total_tokens: row.try_get("total_tokens")?,
                    total_cost: row.try_get("total_cost")?,
                    call_count: row.try_get("call_count")?,
                    last_used_at: row.try_get("last_used_at")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(usage)
    }

    pub async fn key_daily_reports(
        &self,
        from: i64,
        to: i64,
    ) -> Result<Vec<ApiKeyDailyReport>, ProxyError> {
        let rows = sqlx::query(
            r#"
            SELECT
                ak.id AS api_key_id,
                ak.key_prefix,
                DATE(cl.ts, 'unixepoch') AS date,
                COALESCE(SUM(cl.total_tokens), 0) AS total_tokens,
                COALESCE(SUM(cl.cost), 0.0) AS cost,
                COUNT(cl.id) AS call_count
            FROM call_logs cl
            JOIN api_keys ak ON ak.id = cl.api_key_id
            WHERE ak.is_active = 1 AND cl.ts >= ? AND cl.ts <= ?
            GROUP BY ak.id, ak.key_prefix, date
            ORDER BY date ASC, ak.id ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let reports = rows
            .into_iter()
            .map(|row| -> Result<ApiKeyDailyReport, sqlx::Error> {
                Ok(ApiKeyDailyReport {
                    api_key_id: row.try_get("api_key_id")?,
                    key_prefix: row.try_get("key_prefix")?,
                    date: row.try_get("date")?,
                    total_tokens: row.try_get("total_tokens")?,
                    cost: row.try_get("cost")?,
                    call_count: row.try_get("call_count")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(reports)
    }

    pub async fn key_usage_by_id(
        &self,
        key_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Option<ApiKeyUsage>, ProxyError> {
        let key = sqlx::query(
            r#"
            SELECT id, key_prefix, last_used_at
            FROM api_keys
            WHERE id = ? AND is_active = 1
            LIMIT 1
            "#,
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(key) = key else {
            return Ok(None);
        };

        let totals = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(total_tokens), 0) AS total_tokens,
                COALESCE(SUM(cost), 0.0) AS total_cost,
                COUNT(id) AS call_count
            FROM call_logs
            WHERE api_key_id = ? AND ts >= ? AND ts <= ?
            "#,
        )
        .bind(key_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(ApiKeyUsage {
            api_key_id: key.try_get("id")?,
            key_prefix: key.try_get("key_prefix")?,
            total_tokens: totals.try_get("total_tokens")?,
            total_cost: totals.try_get("total_cost")?,
            call_count: totals.try_get("call_count")?,
            last_used_at: key.try_get("last_used_at")?,
        }))
    }
}

fn map_api_key(row: &sqlx::sqlite::SqliteRow) -> Result<ApiKeyRecord, sqlx::Error> {
    Ok(ApiKeyRecord {
        id: row.try_get("id")?,
        key_prefix: row.try_get("key_prefix")?,
        created_at: row.try_get("created_at")?,
        last_used_at: row.try_get("last_used_at")?,
        is_active: row.try_get("is_active")?,
        description: row.try_get("description")?,
    })
}

fn map_call_log(row: &sqlx::sqlite::SqliteRow) -> Result<CallLogRecord, sqlx::Error> {
    Ok(CallLogRecord {
        id: row.try_get("id")?,
        ts: row.try_get("ts")?,
        model: row.try_get("model")?,
        prompt_tokens: row.try_get("prompt_tokens")?,
        completion_tokens: row.try_get("completion_tokens")?,
        total_tokens: row.try_get("total_tokens")?,
        cost: row.try_get("cost")?,
        cache_hit: row.try_get("cache_hit")?,
        latency_ms: row.try_get("latency_ms")?,
        api_key_id: row.try_get("api_key_id")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

fn preview_credential(credential: &str) -> String {
    format!("{}…", key_prefix(credential))
}

fn log_call(credential: Option<&str>, model: &str, total_tokens: i64, cost: f64, latency_ms: i64) {
    let who = credential
        .map(preview_credential)
        .unwrap_or_else(|| "anonymous".to_owned());
    println!("[{who}] {model} {total_tokens} tokens ${cost:.6} in {latency_ms}ms");
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::Rng;
    use serde_json::json;

    use super::*;

    #[test]
    fn lookup_hash_is_deterministic() {
        assert_eq!(lookup_hash("sk-test123"), lookup_hash("sk-test123"));
        assert_ne!(lookup_hash("sk-test123"), lookup_hash("sk-test124"));
    }

    #[test]
    fn lookup_hash_random_inputs_do_not_collide() {
        let mut rng = rand::thread_rng();
        let mut inputs = HashSet::new();
        while inputs.len() < 500 {
            let credential: String = (0..24)
                .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
                .collect();
            inputs.insert(credential);
        }
        let mut seen = HashSet::new();
        for credential in &inputs {
            assert!(seen.insert(lookup_hash(credential)), "collision observed");
        }
    }

    #[test]
    fn verification_hash_uses_fresh_salt() {
        let (digest_a, salt_a) = verification_hash("sk-test123");
        let (digest_b, salt_b) = verification_hash("sk-test123");
        assert_ne!(salt_a, salt_b);
        assert_ne!(digest_a, digest_b);
        assert_ne!(digest_a, lookup_hash("sk-test123"));
    }

    #[test]
    fn key_prefix_truncates_to_eight_chars() {
        assert_eq!(key_prefix("sk-test123"), "sk-test1");
        assert_eq!(key_prefix("short"), "short");
        assert_eq!(key_prefix("ключ-метер"), "ключ-мет");
    }

    #[test]
    fn cost_uses_per_model_rates() {
        let cost = calculate_cost("gpt-4", 100, 50);
        assert!((cost - 0.006).abs() < 1e-9);

        let embed = calculate_cost("text-embedding-ada-002", 1000, 0);
        assert!((embed - 0.0001).abs() < 1e-9);
    }

    #[test]
    fn cost_unknown_model_is_never_free() {
        let cost = calculate_cost("mystery-model", 1000, 500);
        assert!((cost - 0.003).abs() < 1e-9);
        assert!(calculate_cost("mystery-model", 1, 0) > 0.0);
    }

    #[test]
    fn cost_is_zero_only_for_zero_tokens() {
        assert_eq!(calculate_cost("gpt-4", 0, 0), 0.0);
        assert_eq!(calculate_cost("mystery-model", 0, 0), 0.0);
    }

    #[test]
    fn cost_is_monotonic_in_token_counts() {
        for model in ["gpt-4", "gpt-3.5-turbo", "mystery-model"] {
            let mut previous = 0.0;
            for tokens in [0u64, 10, 100, 1_000, 10_000] {
                let cost = calculate_cost(model, tokens, tokens / 2);
                assert!(cost >= previous, "{model} not monotonic at {tokens}");
                previous = cost;
            }
        }
    }

    #[test]
    fn extract_usage_reads_provider_counters() {
        let response = json!({
            "usage": {"prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150}
        });
        assert_eq!(extract_usage(&response), (100, 50));
    }

    #[test]
    fn extract_usage_defaults_to_zero() {
        assert_eq!(extract_usage(&json!({"id": "chatcmpl-1"})), (0, 0));
        // embeddings responses report prompt tokens only
        assert_eq!(
            extract_usage(&json!({"usage": {"prompt_tokens": 8, "total_tokens": 8}})),
            (8, 0)
        );
    }

    #[test]
    fn chat_request_preserves_unknown_fields() {
        let raw = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "response_format": {"type": "json_object"}
        });
        let request: ChatRequest = serde_json::from_value(raw).unwrap();
        assert!(request.extra.contains_key("response_format"));

        let forwarded = serde_json::to_value(&request).unwrap();
        assert_eq!(
            forwarded.get("response_format"),
            Some(&json!({"type": "json_object"}))
        );
        assert!(forwarded.get("temperature").is_none());
    }

    #[test]
    fn malformed_chat_request_is_rejected() {
        let missing_model = json!({"messages": [{"role": "user", "content": "hi"}]});
        assert!(serde_json::from_value::<ChatRequest>(missing_model).is_err());

        let bad_messages = json!({"model": "gpt-4", "messages": "hello"});
        assert!(serde_json::from_value::<ChatRequest>(bad_messages).is_err());
    }

    // ----- store tests -----

    #[tokio::test]
    async fn store_creates_and_finds_key() {
        let store = UsageStore::in_memory().await.unwrap();
        let created = store
            .create_key("sk-test123", Some("ci key"))
            .await
            .unwrap();
        assert_eq!(created.key_prefix, "sk-test1");
        assert!(created.is_active);
        assert!(created.last_used_at.is_none());

        let found = store
            .find_key_by_hash(&lookup_hash("sk-test123"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.description.as_deref(), Some("ci key"));

        assert!(
            store
                .find_key_by_hash(&lookup_hash("sk-other"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn store_rejects_duplicate_key_hash() {
        let store = UsageStore::in_memory().await.unwrap();
        store.create_key("sk-test123", None).await.unwrap();
        let err = store.create_key("sk-test123", None).await.unwrap_err();
        assert!(matches!(err, ProxyError::DuplicateKeyHash));
    }

    #[tokio::test]
    async fn store_touches_last_used() {
        let store = UsageStore::in_memory().await.unwrap();
        let key = store.create_key("sk-test123", None).await.unwrap();
        store.touch_last_used(&key.id).await.unwrap();

        let found = store
            .find_key_by_hash(&lookup_hash("sk-test123"))
            .await
            .unwrap()
            .unwrap();
        assert!(found.last_used_at.is_some());
    }

    #[tokio::test]
    async fn store_call_log_round_trip() {
        let store = UsageStore::in_memory().await.unwrap();
        let ts = Utc::now().timestamp();
        let log = CallLogRecord {
            id: new_record_id(),
            ts,
            model: "gpt-4".to_owned(),
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
            cost: calculate_cost("gpt-4", 100, 50),
            cache_hit: false,
            latency_ms: 12,
            api_key_id: None,
        };
        store.append_call_log(&log).await.unwrap();

        let logs = store
            .call_logs_between(ts - 10, ts + 10, None)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].total_tokens, 150);
        assert!((logs[0].cost - 0.006).abs() < 1e-9);
        assert!(logs[0].api_key_id.is_none());
        assert!(!logs[0].cache_hit);

        let filtered = store
            .call_logs_between(ts - 10, ts + 10, Some("embedding"))
            .await
            .unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn store_daily_reports_aggregate() {
        let store = UsageStore::in_memory().await.unwrap();
        let ts = Utc::now().timestamp();
        for (input, output) in [(100u64, 50u64), (200, 100)] {
            store
                .append_call_log(&CallLogRecord {
                    id: new_record_id(),
                    ts,
                    model: "gpt-4".to_owned(),
                    prompt_tokens: input as i64,
                    completion_tokens: output as i64,
                    total_tokens: (input + output) as i64,
                    cost: calculate_cost("gpt-4", input, output),
                    cache_hit: false,
                    latency_ms: 5,
                    api_key_id: None,
                })
                .await
                .unwrap();
        }

        let days = store.daily_reports(ts - 10, ts + 10).await.unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].total_tokens, 450);
        assert!((days[0].cost - 0.018).abs() < 1e-9);
        assert_eq!(days[0].cache_hit_rate, 0.0);
        assert_eq!(days[0].saved_estimate, 0.0);
    }

    #[tokio::test]
    async fn store_key_usage_excludes_deactivated() {
        let store = UsageStore::in_memory().await.unwrap();
        let active = store.create_key("sk-active-1", None).await.unwrap();
        let retired = store.create_key("sk-retired", None).await.unwrap();
        let ts = Utc::now().timestamp();

        for key in [&active, &retired] {
            store
                .append_call_log(&CallLogRecord {
                    id: new_record_id(),
                    ts,
                    model: "gpt-4".to_owned(),
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                    cost: calculate_cost("gpt-4", 10, 5),
                    cache_hit: false,
                    latency_ms: 3,
                    api_key_id: Some(key.id.clone()),
                })
                .await
                .unwrap();
        }

        store.deactivate_key(&retired.id).await.unwrap();

        let usage = store.key_usage(ts - 10, ts + 10).await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].api_key_id, active.id);
        assert_eq!(usage[0].call_count, 1);
        assert_eq!(usage[0].total_tokens, 15);

        let daily = store.key_daily_reports(ts - 10, ts + 10).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].api_key_id, active.id);

        assert!(
            store
                .key_usage_by_id(&retired.id, ts - 10, ts + 10)
                .await
                .unwrap()
                .is_none()
        );
        let by_id = store
            .key_usage_by_id(&active.id, ts - 10, ts + 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_id.call_count, 1);
    }

    // ----- orchestrator tests -----

    struct StaticGateway {
        response: Value,
    }

    #[async_trait]
    impl InferenceGateway for StaticGateway {
        async fn chat_completion(&self, _request: &ChatRequest) -> Result<Value, ProxyError> {
            Ok(self.response.clone())
        }

        async fn embeddings(&self, _request: &EmbeddingsRequest) -> Result<Value, ProxyError> {
            Ok(self.response.clone())
        }
    }

    struct FailingGateway {
        status: u16,
    }

    #[async_trait]
    impl InferenceGateway for FailingGateway {
        async fn chat_completion(&self, _request: &ChatRequest) -> Result<Value, ProxyError> {
            Err(ProxyError::Upstream {
                status: self.status,
                message: "rate limited".to_owned(),
            })
        }

        async fn embeddings(&self, _request: &EmbeddingsRequest) -> Result<Value, ProxyError> {
            Err(ProxyError::Upstream {
                status: self.status,
                message: "rate limited".to_owned(),
            })
        }
    }

    fn chat_response() -> Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 0,
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150}
        })
    }

    fn chat_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4".to_owned(),
            messages: vec![ChatMessage {
                role: "user".to_owned(),
                content: "hi".to_owned(),
            }],
            temperature: None,
            max_tokens: None,
            extra: serde_json::Map::new(),
        }
    }

    async fn proxy_with(gateway: Option<Arc<dyn InferenceGateway>>) -> LlmProxy {
        let store = UsageStore::in_memory().await.unwrap();
        LlmProxy::with_store(gateway, store)
    }

    #[tokio::test]
    async fn proxy_returns_response_unchanged_and_accounts() {
        let proxy = proxy_with(Some(Arc::new(StaticGateway {
            response: chat_response(),
        })))
        .await;

        let response = proxy
            .chat_completion(chat_request(), Some("sk-test123"))
            .await
            .unwrap();
        assert_eq!(response, chat_response());

        let logs = proxy.recent_call_logs(10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].model, "gpt-4");
        assert_eq!(logs[0].total_tokens, 150);
        assert!((logs[0].cost - 0.006).abs() < 1e-9);
        assert!(logs[0].api_key_id.is_some());

        let keys = proxy.list_api_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_prefix, "sk-test1");
    }

    #[tokio::test]
    async fn proxy_reuses_identity_for_same_credential() {
        let proxy = proxy_with(Some(Arc::new(StaticGateway {
            response: chat_response(),
        })))
        .await;

        proxy
            .chat_completion(chat_request(), Some("sk-test123"))
            .await
            .unwrap();
        proxy
            .chat_completion(chat_request(), Some("sk-test123"))
            .await
            .unwrap();

        let keys = proxy.list_api_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].last_used_at.is_some());

        let logs = proxy.recent_call_logs(10, 0).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].api_key_id, logs[1].api_key_id);
    }

    #[tokio::test]
    async fn proxy_accounts_anonymous_calls() {
        let proxy = proxy_with(Some(Arc::new(StaticGateway {
            response: chat_response(),
        })))
        .await;

        proxy.chat_completion(chat_request(), None).await.unwrap();

        let logs = proxy.recent_call_logs(10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].api_key_id.is_none());
        assert!(proxy.list_api_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn proxy_without_gateway_fails_before_any_accounting() {
        let proxy = proxy_with(None).await;
        let err = proxy
            .chat_completion(chat_request(), Some("sk-test123"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::GatewayNotConfigured));
        assert!(proxy.recent_call_logs(10, 0).await.unwrap().is_empty());
        assert!(proxy.list_api_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn proxy_upstream_failure_skips_accounting() {
        let proxy = proxy_with(Some(Arc::new(FailingGateway { status: 429 }))).await;
        let err = proxy
            .chat_completion(chat_request(), Some("sk-test123"))
            .await
            .unwrap_err();
        match err {
            ProxyError::Upstream { status, .. } => assert_eq!(status, 429),
            other => panic!("unexpected error: {other}"),
        }
        assert!(proxy.recent_call_logs(10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn proxy_concurrent_first_use_creates_single_identity() {
        let proxy = proxy_with(Some(Arc::new(StaticGateway {
            response: chat_response(),
        })))
        .await;

        let (a, b) = tokio::join!(
            proxy.chat_completion(chat_request(), Some("sk-fresh42")),
            proxy.chat_completion(chat_request(), Some("sk-fresh42")),
        );
        a.unwrap();
        b.unwrap();

        let keys = proxy.list_api_keys().await.unwrap();
        assert_eq!(keys.len(), 1);

        let logs = proxy.recent_call_logs(10, 0).await.unwrap();
        assert_eq!(logs.len(), 2);
        for log in &logs {
            assert_eq!(log.api_key_id.as_ref(), Some(&keys[0].id));
        }
    }

    #[tokio::test]
    async fn proxy_embeddings_are_accounted() {
        let proxy = proxy_with(Some(Arc::new(StaticGateway {
            response: json!({
                "object": "list",
                "data": [{"object": "embedding", "index": 0, "embedding": [0.1, 0.2]}],
                "model": "text-embedding-ada-002",
                "usage": {"prompt_tokens": 8, "total_tokens": 8}
            }),
        })))
        .await;

        let request = EmbeddingsRequest {
            model: "text-embedding-ada-002".to_owned(),
            input: json!("hello world"),
            extra: serde_json::Map::new(),
        };
        proxy.embeddings(request, Some("sk-test123")).await.unwrap();

        let logs = proxy.recent_call_logs(10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].prompt_tokens, 8);
        assert_eq!(logs[0].completion_tokens, 0);
        assert!((logs[0].cost - 8.0 * 0.0001 / 1000.0).abs() < 1e-12);
    }
}
