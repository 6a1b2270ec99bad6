//! Multi-client Unix domain socket server.
//!
//! Every accepted connection gets its own newline-delimited JSON transport
//! and its own [`ServerSession`]. The server tracks the live sessions and
//! publishes [`ServerEvent`]s as they come and go.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UnixServerConfig;
use crate::error::{Error, Result};
use crate::mcp::server::{until_closed, ServerEvent, ServerOptions, ServerSession, SessionRegistry};
use crate::mcp::transport::StdioTransport;

struct Running {
    shutdown: CancellationToken,
    accept: JoinHandle<()>,
}

/// Unix socket server for MCP.
pub struct UnixSocketServer {
    config: UnixServerConfig,
    options: ServerOptions,
    registry: Arc<SessionRegistry>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl UnixSocketServer {
    pub fn new(config: UnixServerConfig, options: ServerOptions) -> Self {
        Self {
            config,
            options,
            registry: Arc::new(SessionRegistry::new()),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Socket path this server binds.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<Arc<ServerSession>> {
        self.registry.snapshot()
    }

    /// Subscribe to session created/closed events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ServerEvent> {
        self.registry.subscribe()
    }

    /// Bind the socket and start accepting connections.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let path = self.config.path.clone();
        if running.is_some() {
            return Err(Error::AlreadyRunning(path.display().to_string()));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if std::fs::symlink_metadata(&path).is_ok() {
            if UnixStream::connect(&path).await.is_ok() {
                return Err(Error::AlreadyRunning(path.display().to_string()));
            }
            debug!(path = %path.display(), "Removing stale socket file");
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;

        #[cfg(unix)]
        if let Some(mode) = self.config.permissions {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
        }

        info!(path = %path.display(), "Unix socket server listening");

        let shutdown = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(
            listener,
            self.registry.clone(),
            self.options.clone(),
            shutdown.clone(),
        ));
        *running = Some(Running { shutdown, accept });
        Ok(())
    }

    /// Close every session, stop listening and remove the socket file.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        running.shutdown.cancel();
        let _ = running.accept.await;

        self.registry.close_all().await;

        remove_socket_file(&self.config.path);
        info!(path = %self.config.path.display(), "Unix socket server stopped");
        Ok(())
    }
}

impl Drop for UnixSocketServer {
    fn drop(&mut self) {
        let Some(running) = self.running.get_mut().take() else {
            return;
        };
        running.shutdown.cancel();
        running.accept.abort();

        let sessions = self.registry.drain();
        if !sessions.is_empty() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    for session in sessions {
                        let _ = session.close(&CancellationToken::new()).await;
                    }
                });
            }
        }
        remove_socket_file(&self.config.path);
    }
}

fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove socket file: {}", e),
    }
}

async fn accept_loop(
    listener: UnixListener,
    registry: Arc<SessionRegistry>,
    options: ServerOptions,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _addr)) => {
                debug!("Accepted Unix socket connection");
                tokio::spawn(serve_connection(
                    stream,
                    registry.clone(),
                    options.clone(),
                    shutdown.clone(),
                ));
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// Run one connection's session until it closes.
async fn serve_connection(
    stream: UnixStream,
    registry: Arc<SessionRegistry>,
    options: ServerOptions,
    shutdown: CancellationToken,
) {
    let (reader, writer) = stream.into_split();
    let transport = Arc::new(StdioTransport::new(reader, writer));
    let session = ServerSession::new(transport, options);
    let mut events = session.subscribe();

    if let Err(e) = session.start(&shutdown).await {
        warn!("Failed to start session: {}", e);
        return;
    }

    registry.insert(session.clone());
    if shutdown.is_cancelled() {
        // Stop raced this connection; it will not be drained.
        let _ = session.close(&CancellationToken::new()).await;
        registry.remove(session.id());
        return;
    }

    until_closed(&mut events).await;
    registry.remove(session.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::handler::MethodRouter;
    use crate::mcp::protocol::Implementation;
    use std::path::PathBuf;

    fn server(path: PathBuf) -> UnixSocketServer {
        let options = ServerOptions::new(
            Implementation::new("unix-test", "0.1.0"),
            Arc::new(MethodRouter::new()),
        );
        UnixSocketServer::new(UnixServerConfig::new(path), options)
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path().join("mcp.sock"));

        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(Error::AlreadyRunning(_))));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.sock");
        std::fs::write(&path, b"stale").unwrap();

        let server = server(path.clone());
        server.start().await.unwrap();
        assert!(UnixStream::connect(&path).await.is_ok());
        server.stop().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_live_socket_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.sock");

        let first = server(path.clone());
        first.start().await.unwrap();

        let second = server(path.clone());
        assert!(matches!(second.start().await, Err(Error::AlreadyRunning(_))));

        first.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_sets_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mcp.sock");
        let server = server(path.clone());

        server.stop().await.unwrap();
        server.start().await.unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        server.stop().await.unwrap();
        server.stop().await.unwrap();
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_drop_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.sock");
        {
            let server = server(path.clone());
            server.start().await.unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
