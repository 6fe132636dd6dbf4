use axum::{
    Json, Router,
    extract::Query,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use serde_json::{Value, json};
use std::{collections::HashMap, net::SocketAddr, time::Duration};
use tokio::task::JoinHandle;

/// Mock OpenAI-compatible upstream for exercising the proxy end to end.
/// Pass `?status=429` (or any non-2xx code) to simulate provider failures.

fn error_override(q: &HashMap<String, String>) -> Option<StatusCode> {
    let code = q.get("status")?.parse::<u16>().ok()?;
    let status = StatusCode::from_u16(code).ok()?;
    (!status.is_success()).then_some(status)
}

async fn chat_completions(
    Query(q): Query<HashMap<String, String>>,
    Json(request): Json<Value>,
) -> impl IntoResponse {
    if let Some(status) = error_override(&q) {
        return (
            status,
            Json(json!({"error": {"message": format!("mock upstream error {status}")}})),
        );
    }

    let model = request
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("gpt-4");

    let body = json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "mock completion"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150}
    });

    (StatusCode::OK, Json(body))
}

async fn embeddings(
    Query(q): Query<HashMap<String, String>>,
    Json(request): Json<Value>,
) -> impl IntoResponse {
    if let Some(status) = error_override(&q) {
        return (
            status,
            Json(json!({"error": {"message": format!("mock upstream error {status}")}})),
        );
    }

    let model = request
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("text-embedding-ada-002");

    let body = json!({
        "object": "list",
        "data": [{"object": "embedding", "index": 0, "embedding": [0.1, 0.2, 0.3]}],
        "model": model,
        "usage": {"prompt_tokens": 8, "total_tokens": 8}
    });

    (StatusCode::OK, Json(body))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings));

    let bind_addr =
        std::env::var("MOCK_UPSTREAM_ADDR").unwrap_or_else(|_| "127.0.0.1:58090".to_string());
    let addr: SocketAddr = bind_addr.parse()?;
    println!("Mock OpenAI upstream on http://{addr}");

    let generator = spawn_generator();

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;

    if let Some(handle) = generator {
        let _ = handle.await;
    }
    Ok(())
}

/// Optional background traffic generator against a running proxy; enabled
/// by setting PROXY_BASE.
fn spawn_generator() -> Option<JoinHandle<()>> {
    let proxy_base = std::env::var("PROXY_BASE").ok()?;
    let credential = std::env::var("GEN_API_KEY").ok();
    let interval_ms: u64 = std::env::var("GEN_INTERVAL_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5000);

    Some(tokio::spawn(async move {
        let client = reqwest::Client::new();
        let models = ["gpt-4", "gpt-3.5-turbo", "gpt-4-turbo"];
        let mut i = 0usize;

        loop {
            let model = models[i % models.len()];
            let url = format!("{proxy_base}/v1/chat/completions");
            let mut builder = client.post(&url).json(&json!({
                "model": model,
                "messages": [{"role": "user", "content": "ping"}]
            }));
            if let Some(key) = credential.as_deref() {
                builder = builder.bearer_auth(key);
            }

            match builder.send().await {
                Ok(resp) => println!("[mock-gen] {} {} -> {}", model, url, resp.status()),
                Err(err) => eprintln!("[mock-gen] request error: {err}"),
            }

            i = i.wrapping_add(1);
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }))
}
