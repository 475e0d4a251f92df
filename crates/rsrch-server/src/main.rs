//! Process entry point: CLI args, tracing init, provider wiring, and the
//! SSE server's run/shutdown lifecycle.

mod providers;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use rsrch_pipeline::{ModelClient, SearchClient};
use rsrch_stream_server::SseServer;
use rsrch_task_manager::TaskManagerConfig;
use rsrch_task_store::InMemoryTaskStore;
use tracing::info;

use providers::{HttpModelClient, HttpSearchClient, UnconfiguredModelClient, UnconfiguredSearchClient};

#[derive(Parser)]
#[command(name = "rsrch-server")]
#[command(about = "Research task execution engine: SSE streaming endpoint")]
struct Args {
    /// Address to bind the SSE endpoint on.
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind: SocketAddr,

    /// HTTP path the SSE endpoint is served from.
    #[arg(long, default_value = "/api/sse")]
    sse_path: String,

    /// Maximum number of tracked tasks before eviction kicks in.
    #[arg(long, default_value_t = 1000)]
    max_tasks: usize,

    /// Search provider name reported in `X-Search-Provider` when the
    /// request doesn't name one.
    #[arg(long, default_value = "tavily")]
    search_provider: String,

    /// Comma-separated default thinking models, used when a request's
    /// `thinkingModel` query param is absent.
    #[arg(long, default_value = "")]
    thinking_models: String,

    /// Comma-separated default task models, used when a request's
    /// `taskModel` query param is absent.
    #[arg(long, default_value = "")]
    task_models: String,

    /// Comma-separated search API key pool (spec.md §4.E rotation input).
    #[arg(long, default_value = "")]
    search_api_keys: String,

    /// Base URL of an OpenAI-compatible chat completions endpoint. Leave
    /// unset to run with a model client that rejects every call (useful
    /// for exercising the HTTP surface without a live provider).
    #[arg(long)]
    model_base_url: Option<String>,

    #[arg(long, default_value = "")]
    model_api_key: String,

    /// Base URL of a Tavily-shaped `/search` endpoint.
    #[arg(long)]
    search_base_url: Option<String>,

    /// Disable permissive CORS headers on the SSE endpoint.
    #[arg(long)]
    no_cors: bool,
}

fn build_model_client(args: &Args) -> anyhow::Result<Arc<dyn ModelClient>> {
    match &args.model_base_url {
        Some(base_url) => Ok(Arc::new(HttpModelClient::new(
            base_url.clone(),
            args.model_api_key.clone(),
        )?)),
        None => Ok(Arc::new(UnconfiguredModelClient)),
    }
}

fn build_search_client(args: &Args) -> anyhow::Result<Arc<dyn SearchClient>> {
    match &args.search_base_url {
        Some(base_url) => Ok(Arc::new(HttpSearchClient::new(base_url.clone())?)),
        None => Ok(Arc::new(UnconfiguredSearchClient)),
    }
}

fn split_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let model_client = build_model_client(&args)?;
    let search_client = build_search_client(&args)?;

    let store = Arc::new(InMemoryTaskStore::new());
    let task_manager_config = TaskManagerConfig {
        max_tasks: args.max_tasks,
    };

    let server = SseServer::builder(store, task_manager_config, model_client, search_client)
        .bind_address(args.bind)
        .sse_path(args.sse_path.clone())
        .cors(!args.no_cors)
        .default_search_provider(args.search_provider.clone())
        .default_thinking_models(args.thinking_models.clone())
        .default_task_models(args.task_models.clone())
        .search_api_keys(split_keys(&args.search_api_keys))
        .build();

    info!(addr = %args.bind, path = %args.sse_path, "starting research task execution engine");
    server.recover().await?;

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, stopping accept loop (in-flight jobs are not awaited)");
        }
    }

    Ok(())
}
