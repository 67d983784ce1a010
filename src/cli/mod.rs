//! Command-line interface parsing and handling
//!
//! `serve` exposes the HTTP control surface, `chat` runs a single relay
//! stream to stdout and `inspect` reports what each configured endpoint
//! offers.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::{Config, ResolvedConfig};
use crate::logging::{self, redact_secret};
use crate::mcp::{ConnectionOutcome, ConnectionRegistry, EndpointDescriptor};
use crate::relay::{
    encode_event, OpenAiBackend, RelaySettings, StreamEvent, StreamRelay, ToolResults,
};
use crate::server::{self, AppState};

#[derive(Parser)]
#[command(name = "mcp-relay", version)]
#[command(about = "Relay LLM chat streams to Model Context Protocol tool providers")]
#[command(
    long_about = "mcp-relay connects to MCP tool providers over stdio, SSE or streamable \
HTTP, declares their tools to an OpenAI-compatible model and streams the model's output \
as server-sent events.\n\n\
Environment Variables:\n\
  LLM_API_KEY       API key for the model endpoint (required for chat)\n\
  LLM_MODEL         Model id (optional, defaults to gpt-4o-mini)\n\
  LLM_BASE_URL      OpenAI-compatible base URL (optional, defaults to https://api.openai.com/v1)\n\
  RUST_LOG          Log filter (optional, defaults to mcp_relay=info)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config.toml (defaults to the platform config directory)
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect configured endpoints and serve the HTTP API
    Serve {
        /// Address to listen on, overriding `bind` from the config file
        #[arg(short, long, value_name = "ADDR")]
        bind: Option<String>,
    },
    /// Run one chat turn and print its events
    Chat {
        /// Prompt sent to the model
        prompt: String,
        /// Endpoint id whose tools are offered to the model (repeatable)
        #[arg(short, long = "server", value_name = "ID")]
        servers: Vec<String>,
    },
    /// Connect configured endpoints and print their capabilities
    Inspect,
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    logging::init();
    tokio::runtime::Runtime::new()?.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    let config = Config::load(args.config.as_deref())?.resolve_from_env();
    match &config.api_key {
        Some(key) => debug!(api_key = %redact_secret(key), model = %config.model, "Model configured"),
        None => debug!(model = %config.model, "No model API key configured"),
    }

    let registry = Arc::new(ConnectionRegistry::with_timeouts(
        config.timeouts.transport(),
    ));

    let result = match args.command {
        Commands::Serve { bind } => serve(&config, registry.clone(), bind).await,
        Commands::Chat { prompt, servers } => {
            chat(&config, registry.clone(), prompt, servers).await
        }
        Commands::Inspect => inspect(&config, &registry).await,
    };

    registry.disconnect_all().await;
    result
}

fn build_relay(config: &ResolvedConfig, registry: Arc<ConnectionRegistry>) -> Arc<StreamRelay> {
    let backend = OpenAiBackend::new(
        config.base_url.clone(),
        config.api_key.clone().unwrap_or_default(),
    );
    Arc::new(StreamRelay::new(
        registry,
        Arc::new(backend),
        Arc::new(ToolResults::new(config.timeouts.tool_result_wait())),
        RelaySettings {
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        },
    ))
}

/// Connects every enabled endpoint concurrently.
async fn connect_configured(
    registry: &ConnectionRegistry,
    endpoints: &[EndpointDescriptor],
) -> Vec<ConnectionOutcome> {
    let outcomes = join_all(
        endpoints
            .iter()
            .filter(|endpoint| endpoint.enabled)
            .map(|endpoint| registry.connect(endpoint.clone())),
    )
    .await;

    for outcome in &outcomes {
        match outcome {
            ConnectionOutcome::Connected(connection) => {
                info!(server_id = %connection.id(), tools = connection.catalog.tools.len(), "Endpoint connected");
            }
            ConnectionOutcome::Failed { id, message } => {
                warn!(server_id = %id, error = %message, "Endpoint failed to connect");
            }
        }
    }
    outcomes
}

async fn serve(
    config: &ResolvedConfig,
    registry: Arc<ConnectionRegistry>,
    bind: Option<String>,
) -> Result<(), Box<dyn Error>> {
    connect_configured(&registry, &config.endpoints).await;
    let relay = build_relay(config, registry.clone());
    let bind = bind.unwrap_or_else(|| config.bind.clone());

    tokio::select! {
        result = server::serve(&bind, AppState::new(registry, relay)) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

async fn chat(
    config: &ResolvedConfig,
    registry: Arc<ConnectionRegistry>,
    prompt: String,
    servers: Vec<String>,
) -> Result<(), Box<dyn Error>> {
    if !servers.is_empty() {
        let wanted: Vec<EndpointDescriptor> = config
            .endpoints
            .iter()
            .filter(|endpoint| servers.contains(&endpoint.id))
            .cloned()
            .collect();
        connect_configured(&registry, &wanted).await;
    }

    let relay = build_relay(config, registry);
    let cancel = CancellationToken::new();
    let mut events = relay.spawn(prompt, servers, cancel.clone());

    let mut call_ids = Vec::new();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                cancel.cancel();
                continue;
            }
        };
        let Some(event) = event else {
            break;
        };
        if let StreamEvent::FunctionCalls { calls } = &event {
            call_ids.extend(calls.iter().map(|call| call.id.clone()));
        }
        print!("{}", encode_event(&event));
    }

    for call_id in call_ids {
        let result = relay.results().take(&call_id).await;
        println!("{}", json!({"callId": call_id, "result": result}));
    }
    Ok(())
}

async fn inspect(
    config: &ResolvedConfig,
    registry: &ConnectionRegistry,
) -> Result<(), Box<dyn Error>> {
    if config.endpoints.is_empty() {
        eprintln!("No endpoints configured.");
        return Ok(());
    }

    for outcome in connect_configured(registry, &config.endpoints).await {
        match outcome {
            ConnectionOutcome::Connected(connection) => {
                println!(
                    "✅ {} ({}, {} {}): {} tools, {} prompts, {} resources",
                    connection.descriptor.display_name(),
                    connection.transport_used,
                    connection.server_info.name,
                    connection.server_info.version,
                    connection.catalog.tools.len(),
                    connection.catalog.prompts.len(),
                    connection.catalog.resources.len(),
                );
                for tool in &connection.catalog.tools {
                    match &tool.description {
                        Some(description) => println!("   - {}: {}", tool.name, description),
                        None => println!("   - {}", tool.name),
                    }
                }
            }
            ConnectionOutcome::Failed { id, message } => {
                println!("❌ {id}: {message}");
            }
        }
    }
    Ok(())
}
