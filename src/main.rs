mod server;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use llmeter::{DEFAULT_UPSTREAM, InferenceGateway, LlmProxy, OpenAiGateway, UsageStore};

#[derive(Debug, Parser)]
#[command(author, version, about = "OpenAI-compatible metering proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the proxy and reporting HTTP server.
    Serve(ServeArgs),
    /// List the API key identities known to the usage database.
    Keys(KeysArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    /// Upstream provider credential. When absent, no gateway is configured
    /// and proxy calls fail with a configuration error.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// Upstream provider base URL.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_UPSTREAM)]
    openai_base_url: String,

    /// SQLite database path for identities and usage events.
    #[arg(long, env = "LLMETER_DB_PATH", default_value = "llmeter.db")]
    db_path: String,

    /// Address to bind the server to.
    #[arg(long, env = "LLMETER_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port to bind the server to.
    #[arg(long, env = "LLMETER_PORT", default_value_t = 3001)]
    port: u16,

    /// Optional directory with a built dashboard to serve statically.
    #[arg(long, env = "LLMETER_STATIC_DIR")]
    static_dir: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct KeysArgs {
    /// SQLite database path for identities and usage events.
    #[arg(long, env = "LLMETER_DB_PATH", default_value = "llmeter.db")]
    db_path: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => run_server(args).await,
        Command::Keys(args) => run_keys(args).await,
    }
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let gateway: Option<Arc<dyn InferenceGateway>> = match args.openai_api_key.as_deref() {
        Some(key) if !key.trim().is_empty() => Some(Arc::new(OpenAiGateway::new(
            key.trim(),
            &args.openai_base_url,
        )?)),
        _ => {
            eprintln!("no upstream credential configured; proxy calls will be rejected");
            None
        }
    };

    let proxy = LlmProxy::new(gateway, &args.db_path).await?;
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    server::serve(addr, proxy, args.static_dir).await
}

async fn run_keys(args: KeysArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = UsageStore::new(&args.db_path).await?;
    let keys = store.list_keys().await?;

    if keys.is_empty() {
        println!("no API keys recorded");
        return Ok(());
    }

    for key in keys {
        let status = if key.is_active { "active" } else { "inactive" };
        let last_used = key
            .last_used_at
            .map(format_timestamp)
            .unwrap_or_else(|| "never".to_owned());
        println!(
            "{}  {}…  {}  created {}  last used {}{}",
            key.id,
            key.key_prefix,
            status,
            format_timestamp(key.created_at),
            last_used,
            key.description
                .map(|d| format!("  ({d})"))
                .unwrap_or_default(),
        );
    }

    Ok(())
}

fn format_timestamp(timestamp: i64) -> String {
    match Utc.timestamp_opt(timestamp, 0).single() {
        Some(datetime) => datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => timestamp.to_string(),
    }
}
