//! Newline-delimited JSON transport over byte streams.
//!
//! Each outbound message is written as one line of JSON followed by `\n`.
//! A background task reads the peer's stream, buffers partial lines and
//! parses every complete line as one message. The same transport drives the
//! current process's stdin/stdout, a spawned child process, or any pair of
//! async byte streams (for example the two halves of a Unix socket).

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::mcp::protocol::Message;
use crate::mcp::transport::{cancellable, Transport, TransportCore, TransportEvent, TransportState};

/// Default upper bound on a single inbound line.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// How long a child process gets to exit after its stdin closes.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(2);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A child process to launch as the peer.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

enum StdioSource {
    /// Caller-supplied streams; usable for exactly one connection.
    Streams(Option<(BoxedReader, BoxedWriter)>),
    /// This process's stdin/stdout.
    Process,
    /// A child process, re-spawned on every connect.
    Command(CommandSpec),
}

/// One line from the peer, with framing faults kept in-band so a bad line
/// never ends the stream.
pub(crate) enum Line {
    Text(String),
    Oversized,
    Invalid(String),
}

/// `LinesCodec` wrapper that turns recoverable decode faults into items.
pub(crate) struct JsonLinesCodec {
    lines: LinesCodec,
}

impl JsonLinesCodec {
    pub(crate) fn new(max_line_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_length),
        }
    }

    fn map(
        result: std::result::Result<Option<String>, LinesCodecError>,
    ) -> std::result::Result<Option<Line>, LinesCodecError> {
        match result {
            Ok(line) => Ok(line.map(Line::Text)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Line::Oversized)),
            Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                Ok(Some(Line::Invalid(e.to_string())))
            }
            Err(e) => Err(e),
        }
    }
}

impl Decoder for JsonLinesCodec {
    type Item = Line;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<Line>, LinesCodecError> {
        Self::map(self.lines.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<Line>, LinesCodecError> {
        Self::map(self.lines.decode_eof(buf))
    }
}

impl Encoder<String> for JsonLinesCodec {
    type Error = LinesCodecError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> std::result::Result<(), LinesCodecError> {
        self.lines.encode(line, dst)
    }
}

fn codec_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::Io(e) => Error::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            Error::Parse("Line exceeds maximum length".to_string())
        }
    }
}

struct Connection {
    writer: FramedWrite<BoxedWriter, JsonLinesCodec>,
    reader: JoinHandle<()>,
    shutdown: CancellationToken,
    child: Option<Child>,
}

/// Stdio transport for MCP.
pub struct StdioTransport {
    core: Arc<TransportCore>,
    source: Mutex<StdioSource>,
    max_line_length: usize,
    connection: tokio::sync::Mutex<Option<Connection>>,
}

impl StdioTransport {
    fn with_source(source: StdioSource) -> Self {
        Self {
            core: Arc::new(TransportCore::new("stdio")),
            source: Mutex::new(source),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            connection: tokio::sync::Mutex::new(None),
        }
    }

    /// Frame messages over an arbitrary pair of byte streams.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_source(StdioSource::Streams(Some((Box::new(reader), Box::new(writer)))))
    }

    /// Frame messages over this process's stdin and stdout.
    pub fn stdio() -> Self {
        Self::with_source(StdioSource::Process)
    }

    /// Spawn `spec` on connect and talk to it over its stdin and stdout.
    pub fn spawn(spec: CommandSpec) -> Self {
        Self::with_source(StdioSource::Command(spec))
    }

    /// Override the maximum accepted inbound line length.
    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    fn open_streams(&self) -> Result<(BoxedReader, BoxedWriter, Option<Child>)> {
        let mut source = self.source.lock().unwrap_or_else(|p| p.into_inner());
        match &mut *source {
            StdioSource::Streams(streams) => {
                let (reader, writer) = streams.take().ok_or_else(|| {
                    Error::Transport("byte streams were already used by an earlier connection".to_string())
                })?;
                Ok((reader, writer, None))
            }
            StdioSource::Process => Ok((
                Box::new(tokio::io::stdin()),
                Box::new(tokio::io::stdout()),
                None,
            )),
            StdioSource::Command(spec) => {
                debug!("Spawning peer process: {} {:?}", spec.program, spec.args);
                let mut command = Command::new(&spec.program);
                command
                    .args(&spec.args)
                    .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                    .stdin(std::process::Stdio::piped())
                    .stdout(std::process::Stdio::piped())
                    .stderr(std::process::Stdio::inherit())
                    .kill_on_drop(true);
                if let Some(cwd) = &spec.cwd {
                    command.current_dir(cwd);
                }

                let mut child = command.spawn()?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| Error::Transport("child stdin unavailable".to_string()))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| Error::Transport("child stdout unavailable".to_string()))?;
                Ok((Box::new(stdout), Box::new(stdin), Some(child)))
            }
        }
    }

    async fn close_connection(mut conn: Connection) -> Result<()> {
        conn.shutdown.cancel();
        let closed = conn.writer.close().await.map_err(codec_error);

        if let Some(child) = conn.child.as_mut() {
            match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
                Ok(status) => debug!("Peer process exited: {:?}", status?),
                Err(_) => {
                    warn!("Peer process did not exit after stdin closed, killing it");
                    child.kill().await?;
                }
            }
        }

        let _ = conn.reader.await;
        closed
    }
}

/// Read lines until EOF, a read error, or shutdown.
async fn read_loop(
    core: Arc<TransportCore>,
    reader: BoxedReader,
    max_line_length: usize,
    shutdown: CancellationToken,
) {
    let mut lines = FramedRead::new(reader, JsonLinesCodec::new(max_line_length));

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = lines.next() => next,
        };

        match next {
            Some(Ok(Line::Text(line))) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                trace!("Received: {}", trimmed);
                match Message::parse(trimmed) {
                    Ok(message) => core.emit_message(message),
                    Err(e) => {
                        warn!("Failed to parse message: {}", e);
                        core.emit_error(e);
                    }
                }
            }
            Some(Ok(Line::Oversized)) => {
                warn!("Dropping inbound line longer than {} bytes", max_line_length);
                core.emit_error(Error::Parse(format!(
                    "Line exceeds maximum length of {} bytes",
                    max_line_length
                )));
            }
            Some(Ok(Line::Invalid(reason))) => {
                warn!("Dropping inbound line: {}", reason);
                core.emit_error(Error::Parse(reason));
            }
            Some(Err(e)) => {
                error!("Error reading input stream: {}", e);
                core.emit_error(codec_error(e));
                core.transition(|s| s != TransportState::Disconnecting, TransportState::Error);
                return;
            }
            None => {
                debug!("EOF on input stream, stopping transport");
                core.transition(|s| s != TransportState::Disconnecting, TransportState::Disconnected);
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn state(&self) -> TransportState {
        self.core.state()
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let mut guard = cancellable(cancel, async { Ok(self.connection.lock().await) }).await?;

        if guard.is_some() {
            if self.core.state() == TransportState::Connected {
                return Ok(());
            }
            // The peer went away; drop what is left of the old connection.
            if let Some(stale) = guard.take() {
                let _ = Self::close_connection(stale).await;
            }
        }

        self.core.set_state(TransportState::Connecting);

        let (reader, writer, child) = match self.open_streams() {
            Ok(streams) => streams,
            Err(e) => {
                error!("Failed to open stdio streams: {}", e);
                self.core.set_state(TransportState::Error);
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            self.core.set_state(TransportState::Disconnected);
            return Err(Error::Cancelled);
        }

        // Connected must land before the reader can observe EOF.
        self.core.set_state(TransportState::Connected);
        let shutdown = CancellationToken::new();
        let reader = tokio::spawn(read_loop(
            self.core.clone(),
            reader,
            self.max_line_length,
            shutdown.clone(),
        ));

        *guard = Some(Connection {
            writer: FramedWrite::new(writer, JsonLinesCodec::new(self.max_line_length)),
            reader,
            shutdown,
            child,
        });
        Ok(())
    }

    async fn disconnect(&self, cancel: &CancellationToken) -> Result<()> {
        let conn = cancellable(cancel, async { Ok(self.connection.lock().await.take()) }).await?;

        let Some(conn) = conn else {
            self.core.set_state(TransportState::Disconnected);
            return Ok(());
        };

        self.core.set_state(TransportState::Disconnecting);
        let result = cancellable(cancel, Self::close_connection(conn)).await;
        self.core.set_state(TransportState::Disconnected);

        match result {
            Err(e) if !matches!(e, Error::Cancelled) => {
                debug!("Error while closing stdio transport: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    async fn send(&self, message: &Message, cancel: &CancellationToken) -> Result<()> {
        self.core.ensure_can_send()?;
        let line = message.to_json();

        let mut guard = cancellable(cancel, async { Ok(self.connection.lock().await) }).await?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::NotConnected(self.core.state().to_string()))?;

        trace!("Sending: {}", line);
        // Not cancellable past this point: a half-written line would corrupt the framing.
        if let Err(e) = conn.writer.send(line).await {
            let e = codec_error(e);
            error!("Error writing message: {}", e);
            self.core.emit_error(Error::Transport(e.to_string()));
            return Err(e);
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.core.subscribe()
    }
}
