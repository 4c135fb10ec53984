//! socket-call CLI - serve the demo namespace or talk to a socket-call server.
//!
//! This is the main binary entry point. See the `socket_call` library for
//! the core functionality.
//!
//! Rust guideline compliant 2026-02

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use serde_json::Value;
use socket_call::demo::{self, UserDemoTiming};
use socket_call::error::WEBSOCKET_ERROR_MESSAGE;
use socket_call::plugin::cache::CacheStorage;
use socket_call::{
    CacheOptions, CachePlugin, CallError, CallOptions, Config, ConnectionError, FileStorage,
    MemoryStorage, NamespaceOptions, SocketClient, StaticSession, Ttl,
};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Extra time allowed for the first connect outcome beyond the handshake timeout.
const CONNECT_SETTLE_GRACE: Duration = Duration::from_millis(500);

// CLI
#[derive(Parser)]
#[command(name = "socket-call")]
#[command(version)]
#[command(about = "Typed remote calls over namespaced WebSocket connections")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo /user namespace over WebSocket
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:3000")]
        bind: String,
    },
    /// Call a remote event and print its result as JSON
    Call {
        /// Namespace name (e.g. /user)
        namespace: String,
        /// Event name
        event: String,
        /// Arguments, each parsed as JSON (bare words become strings)
        args: Vec<String>,
        /// Bypass the response cache
        #[arg(long)]
        no_cache: bool,
        /// Session token sent during the handshake
        #[arg(long)]
        token: Option<String>,
    },
    /// Print server-pushed events until Ctrl-C
    Listen {
        /// Namespace name (e.g. /user)
        namespace: String,
        /// Event names to subscribe to
        #[arg(required = true)]
        events: Vec<String>,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Serve { bind } => serve(&bind).await?,
        Commands::Call {
            namespace,
            event,
            args,
            no_cache,
            token,
        } => {
            let code = call(&config, &namespace, &event, &args, no_cache, token).await?;
            std::process::exit(code);
        }
        Commands::Listen { namespace, events } => listen(&config, &namespace, &events).await?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}

async fn serve(bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    let server = Arc::new(demo::server(UserDemoTiming::default()));
    println!("Server listening on {}", listener.local_addr()?);
    socket_call::server::ws::serve(listener, server).await;
    Ok(())
}

fn client(config: &Config) -> SocketClient {
    SocketClient::new(config.server_url.clone()).connect_options(config.connect_options())
}

fn cache_storage(config: &Config) -> Result<Arc<dyn CacheStorage>> {
    Ok(match &config.cache_path {
        Some(path) => Arc::new(
            FileStorage::open(path)
                .with_context(|| format!("Failed to open cache {}", path.display()))?,
        ),
        None => Arc::new(MemoryStorage::new()),
    })
}

/// Parse a CLI argument as JSON, falling back to a plain string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Perform one call. Returns the process exit code.
async fn call(
    config: &Config,
    namespace: &str,
    event: &str,
    args: &[String],
    no_cache: bool,
    token: Option<String>,
) -> Result<i32> {
    let cache = CachePlugin::new(
        CacheOptions::new(cache_storage(config)?).ttl(Ttl::Fixed(config.cache_ttl())),
    );
    let options = NamespaceOptions::new()
        .plugin(cache)
        .session(StaticSession::new(token.or_else(|| config.token.clone())));

    let client = client(config);
    let namespace = client.add_namespace(namespace, options);
    let args = args.iter().map(|raw| parse_arg(raw)).collect();

    // Wait for the first connect outcome so offline calls go to the cache.
    namespace.connect();
    let mut offline = namespace.offline_state();
    let settle = Duration::from_millis(config.timeout_ms) + CONNECT_SETTLE_GRACE;
    if tokio::time::timeout(settle, offline.wait_for(Option::is_some))
        .await
        .is_err()
    {
        log::debug!("No connect outcome for {} yet", namespace.name());
    }

    let pending = namespace.call_with(event, args, CallOptions { disable_cache: no_cache });
    let result = if namespace.is_offline() == Some(true) {
        // Offline emissions queue until reconnect; only the cache can answer now.
        tokio::time::timeout(Duration::from_millis(config.timeout_ms), pending)
            .await
            .unwrap_or_else(|_| {
                Err(CallError::Connection(ConnectionError::from_transport(
                    WEBSOCKET_ERROR_MESSAGE,
                    namespace.name(),
                    Some(event),
                )))
            })
    } else {
        pending.await
    };

    match result {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(0)
        }
        Err(CallError::Remote(error)) => {
            println!("{}", serde_json::to_string_pretty(&error.to_value())?);
            Ok(1)
        }
        Err(e) => {
            eprintln!("{}", e);
            Ok(2)
        }
    }
}

async fn listen(config: &Config, namespace: &str, events: &[String]) -> Result<()> {
    let client = client(config);
    let namespace = client.add_namespace(
        namespace,
        NamespaceOptions::new().session(StaticSession::new(config.token.clone())),
    );

    for event in events {
        let name = event.clone();
        namespace.subscribe(event, move |args| {
            println!("{} {}", name, Value::Array(args));
        })?;
    }
    namespace.connect();

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    namespace.disconnect();
    Ok(())
}
