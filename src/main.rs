//! MCP Wire demo server.
//!
//! Serves an `echo` method over the transport chosen on the command line.

use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mcp_wire_rs::config::{Args, Config, TransportKind};
use mcp_wire_rs::error::{Error, Result};
use mcp_wire_rs::mcp::capabilities::ServerCapabilities;
use mcp_wire_rs::mcp::handler::{EchoMethod, MethodRouter};
use mcp_wire_rs::mcp::protocol::Implementation;
use mcp_wire_rs::mcp::server::{ServerOptions, ServerSession};
use mcp_wire_rs::mcp::transport::{StdioTransport, WebSocketAcceptPolicy, WebSocketTransport};
use mcp_wire_rs::mcp::unix_server::UnixSocketServer;
use mcp_wire_rs::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the stdio transport.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.debug { "debug" } else { "info" }));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Internal(format!("Failed to set tracing subscriber: {}", e)))?;

    let config: Config = args.into();

    info!("MCP Wire v{}", VERSION);
    info!("Transport: {:?}", config.transport);

    let mut router = MethodRouter::new();
    router.register(EchoMethod);
    info!("Registered {} methods", router.method_count());

    let options = ServerOptions::new(
        Implementation::new(config.name.clone(), VERSION),
        Arc::new(router),
    )
    .with_capabilities(ServerCapabilities::default().with_logging())
    .with_instructions("Demo server. Call `echo` to get your params back.");

    match config.transport {
        TransportKind::Stdio => serve_stdio(options).await,
        TransportKind::Unix => serve_unix(&config, options).await,
        TransportKind::Websocket => serve_websocket(&config, options).await,
        TransportKind::Http => mcp_wire_rs::http::start_server(&config, options).await,
    }
}

async fn serve_stdio(options: ServerOptions) -> Result<()> {
    info!("Starting stdio transport...");
    let session = ServerSession::new(Arc::new(StdioTransport::stdio()), options);
    let cancel = CancellationToken::new();
    session.start(&cancel).await?;

    tokio::select! {
        _ = session.wait_closed() => info!("Client disconnected"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    session.close(&cancel).await
}

async fn serve_unix(config: &Config, options: ServerOptions) -> Result<()> {
    let server = UnixSocketServer::new(config.unix_server(), options);
    server.start().await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down ({} open sessions)", server.session_count());
    server.stop().await
}

async fn serve_websocket(config: &Config, options: ServerOptions) -> Result<()> {
    let policy = WebSocketAcceptPolicy {
        allowed_origins: config.allowed_origins.clone(),
        bearer_token: config.token.clone(),
        subprotocols: vec!["mcp".to_string()],
        ping_interval: (config.ping_interval_ms > 0)
            .then(|| std::time::Duration::from_millis(config.ping_interval_ms)),
    };

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket server listening on {}", addr);

    let shutdown = CancellationToken::new();
    loop {
        let accepted = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        let policy = policy.clone();
        let options = options.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let transport = match WebSocketTransport::accept(stream, &policy).await {
                Ok(transport) => Arc::new(transport),
                Err(e) => {
                    debug!("WebSocket handshake with {} failed: {}", peer, e);
                    return;
                }
            };
            let session = ServerSession::new(transport, options);
            if let Err(e) = session.start(&shutdown).await {
                warn!("Failed to start session for {}: {}", peer, e);
                return;
            }
            info!("Session {} opened for {}", session.id(), peer);
            tokio::select! {
                _ = session.wait_closed() => {}
                _ = shutdown.cancelled() => {
                    let _ = session.close(&CancellationToken::new()).await;
                }
            }
            info!("Session {} closed", session.id());
        });
    }

    shutdown.cancel();
    Ok(())
}
