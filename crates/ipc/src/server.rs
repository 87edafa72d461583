//! Controller-side transport server.
//!
//! The server owns a small private tokio runtime so the controller's public
//! API stays synchronous. A single accept loop dispatches each connection
//! to its own task; handler callbacks run on the blocking pool because they
//! may invoke arbitrary user code.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cmdmox_common::wire::{CommandResponse, Invocation, PassthroughResult, WireMessage};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Endpoint, TransportError};

/// Server-side behavior plugged in by the controller.
///
/// Implementations are called once per incoming frame, from worker threads;
/// they must be internally synchronized.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_invocation(&self, invocation: Invocation) -> CommandResponse;
    fn on_passthrough_result(&self, result: PassthroughResult) -> CommandResponse;
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long startup may poll the endpoint before giving up.
    pub ready_timeout: Duration,
    /// Practical cap on concurrently served connections; accepts stall
    /// until a session finishes once the cap is reached.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            max_connections: 64,
        }
    }
}

/// A running transport endpoint. Shuts down on drop.
pub struct IpcServer {
    endpoint: Endpoint,
    shutdown: CancellationToken,
    runtime: Option<tokio::runtime::Runtime>,
    accept_task: Option<tokio::task::JoinHandle<()>>,
}

impl IpcServer {
    /// Bind the endpoint, spawn the accept loop, and block until a probe
    /// connection succeeds.
    pub fn start(
        endpoint: Endpoint,
        handler: Arc<dyn MessageHandler>,
        config: &ServerConfig,
    ) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("cmdmox-ipc")
            .enable_all()
            .build()?;
        let shutdown = CancellationToken::new();

        let accept_task = Self::spawn_accept_loop(
            &runtime,
            &endpoint,
            handler,
            shutdown.clone(),
            config.max_connections.max(1),
        )?;

        let server = Self {
            endpoint,
            shutdown,
            runtime: Some(runtime),
            accept_task: Some(accept_task),
        };
        server.wait_ready(config.ready_timeout)?;
        Ok(server)
    }

    #[cfg(unix)]
    fn spawn_accept_loop(
        runtime: &tokio::runtime::Runtime,
        endpoint: &Endpoint,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
        max_connections: usize,
    ) -> Result<tokio::task::JoinHandle<()>, TransportError> {
        let path = endpoint.logical_path().to_path_buf();
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let listener = {
            let _guard = runtime.enter();
            tokio::net::UnixListener::bind(&path).map_err(|source| TransportError::Bind {
                endpoint: endpoint.address(),
                source,
            })?
        };
        Ok(runtime.spawn(accept_loop_unix(listener, handler, shutdown, max_connections)))
    }

    #[cfg(windows)]
    fn spawn_accept_loop(
        runtime: &tokio::runtime::Runtime,
        endpoint: &Endpoint,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
        max_connections: usize,
    ) -> Result<tokio::task::JoinHandle<()>, TransportError> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let pipe_name = endpoint.pipe_name();
        let first = {
            let _guard = runtime.enter();
            ServerOptions::new()
                .first_pipe_instance(true)
                .create(&pipe_name)
                .map_err(|source| TransportError::Bind {
                    endpoint: pipe_name.clone(),
                    source,
                })?
        };
        Ok(runtime.spawn(accept_loop_pipe(
            pipe_name,
            first,
            handler,
            shutdown,
            max_connections,
        )))
    }

    /// The endpoint this server is listening on.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Poll the endpoint with exponential backoff until it accepts a
    /// connection.
    fn wait_ready(&self, timeout: Duration) -> Result<(), TransportError> {
        let started = Instant::now();
        let mut delay = Duration::from_millis(5);
        loop {
            if probe(&self.endpoint) {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(TransportError::NotReady {
                    endpoint: self.endpoint.address(),
                    waited: elapsed,
                });
            }
            thread::sleep(delay.min(timeout - elapsed));
            delay = (delay * 2).min(Duration::from_millis(250));
        }
    }

    /// Stop accepting, join workers, and unbind the endpoint. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.cancel();
        if let (Some(task), Some(runtime)) = (self.accept_task.take(), self.runtime.as_ref()) {
            let joined = runtime.block_on(async {
                tokio::time::timeout(Duration::from_secs(5), task).await
            });
            if joined.is_err() {
                warn!("accept loop did not stop within its grace period");
            }
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(self.endpoint.logical_path());
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn probe(endpoint: &Endpoint) -> bool {
    #[cfg(unix)]
    {
        std::os::unix::net::UnixStream::connect(endpoint.logical_path()).is_ok()
    }
    #[cfg(windows)]
    {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(endpoint.pipe_name())
            .is_ok()
    }
}

#[cfg(unix)]
async fn accept_loop_unix(
    listener: tokio::net::UnixListener,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
    max_connections: usize,
) {
    let mut sessions: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            joined = sessions.join_next(), if !sessions.is_empty() => {
                if let Some(Err(err)) = joined {
                    warn!("connection task panicked: {err}");
                }
            }
            accepted = listener.accept(), if sessions.len() < max_connections => match accepted {
                Ok((stream, _)) => {
                    spawn_session(&mut sessions, stream, handler.clone(), cancel.clone());
                }
                Err(err) => {
                    warn!(error = %err, "failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }
    drain_sessions(sessions).await;
}

#[cfg(windows)]
async fn accept_loop_pipe(
    pipe_name: String,
    mut server: tokio::net::windows::named_pipe::NamedPipeServer,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
    max_connections: usize,
) {
    use tokio::net::windows::named_pipe::ServerOptions;

    const ERROR_PIPE_CONNECTED: i32 = 535;

    let mut sessions: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            joined = sessions.join_next(), if !sessions.is_empty() => {
                if let Some(Err(err)) = joined {
                    warn!("connection task panicked: {err}");
                }
            }
            connected = server.connect(), if sessions.len() < max_connections => {
                match connected {
                    Ok(()) => {}
                    Err(err) if err.raw_os_error() == Some(ERROR_PIPE_CONNECTED) => {}
                    Err(err) => {
                        warn!(error = %err, "named pipe connect failed");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        continue;
                    }
                }
                let next = match ServerOptions::new().create(&pipe_name) {
                    Ok(next) => next,
                    Err(err) => {
                        warn!(error = %err, "failed to create next pipe instance");
                        break;
                    }
                };
                let stream = std::mem::replace(&mut server, next);
                spawn_session(&mut sessions, stream, handler.clone(), cancel.clone());
            }
        }
    }
    drain_sessions(sessions).await;
}

fn spawn_session<S>(
    sessions: &mut JoinSet<()>,
    stream: S,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    sessions.spawn(async move {
        if let Err(err) = run_session(stream, handler, cancel).await {
            debug!(error = %err, "connection ended with error");
        }
    });
}

async fn drain_sessions(mut sessions: JoinSet<()>) {
    while let Some(joined) = sessions.join_next().await {
        if let Err(err) = joined {
            warn!("connection task panicked: {err}");
        }
    }
}

/// Serve one connection: read frames until EOF, answer each with exactly
/// one response frame. A launcher doing passthrough sends two frames on the
/// same connection and gets two responses.
async fn run_session<S>(
    stream: S,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = dispatch_line(handler.clone(), line).await;
        let encoded = WireMessage::Response(reply).encode_line()?;
        write_half.write_all(encoded.as_bytes()).await?;
        write_half.flush().await?;
    }
}

async fn dispatch_line(handler: Arc<dyn MessageHandler>, line: String) -> CommandResponse {
    let message = match WireMessage::decode_line(&line) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "rejecting malformed frame");
            return CommandResponse::internal_error(format!("protocol error: {err}"));
        }
    };
    let handled = tokio::task::spawn_blocking(move || match message {
        WireMessage::Invocation(invocation) => handler.on_invocation(invocation),
        WireMessage::PassthroughResult(result) => handler.on_passthrough_result(result),
        WireMessage::Response(_) => {
            warn!("client sent a response frame");
            CommandResponse::internal_error("protocol error: unexpected response frame")
        }
    })
    .await;
    handled.unwrap_or_else(|err| {
        warn!("handler task failed: {err}");
        CommandResponse::internal_error("internal handler failure")
    })
}
