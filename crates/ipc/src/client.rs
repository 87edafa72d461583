//! Launcher-side transport client.
//!
//! Launchers are short-lived and synchronous, so the client is plain
//! blocking I/O: connect with bounded retries and linear-with-jitter
//! backoff, then exchange newline-framed JSON with per-operation timeouts.

use std::io::{BufRead, BufReader, Read, Write};
use std::thread;
use std::time::Duration;

use cmdmox_common::wire::{CommandResponse, WireMessage};
use rand::Rng;

use crate::{Endpoint, TransportError};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-operation timeout applied to connect, send, and receive.
    pub timeout: Duration,
    /// Maximum connect attempts before giving up.
    pub connect_attempts: u32,
    /// Base delay between attempts; grows linearly with the attempt number.
    pub backoff: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs_f64(cmdmox_common::DEFAULT_IPC_TIMEOUT_SECS),
            connect_attempts: 5,
            backoff: Duration::from_millis(50),
            jitter: Duration::from_millis(25),
        }
    }
}

impl ClientConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

enum ClientStream {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    #[cfg(windows)]
    Pipe(std::fs::File),
}

impl ClientStream {
    fn dial(endpoint: &Endpoint) -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            std::os::unix::net::UnixStream::connect(endpoint.logical_path()).map(Self::Unix)
        }
        #[cfg(windows)]
        {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(endpoint.pipe_name())
                .map(Self::Pipe)
        }
    }

    fn set_timeouts(&self, timeout: Duration) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))
            }
            // File handles to named pipes have no socket-style deadlines;
            // the bounded connect retries are the protection on Windows.
            #[cfg(windows)]
            Self::Pipe(_) => Ok(()),
        }
    }

    fn try_clone(&self) -> std::io::Result<Self> {
        match self {
            #[cfg(unix)]
            Self::Unix(stream) => stream.try_clone().map(Self::Unix),
            #[cfg(windows)]
            Self::Pipe(file) => file.try_clone().map(Self::Pipe),
        }
    }
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(stream) => stream.read(buf),
            #[cfg(windows)]
            Self::Pipe(file) => file.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
            #[cfg(windows)]
            Self::Pipe(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
            #[cfg(windows)]
            Self::Pipe(file) => file.flush(),
        }
    }
}

/// A connected launcher-side channel.
pub struct IpcClient {
    writer: ClientStream,
    reader: BufReader<ClientStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect with bounded retries and linear-with-jitter backoff.
    pub fn connect(endpoint: &Endpoint, config: &ClientConfig) -> Result<Self, TransportError> {
        let attempts = config.connect_attempts.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                thread::sleep(retry_delay(config, attempt));
            }
            match ClientStream::dial(endpoint) {
                Ok(stream) => {
                    stream.set_timeouts(config.timeout)?;
                    let reader = BufReader::new(stream.try_clone()?);
                    return Ok(Self {
                        writer: stream,
                        reader,
                        timeout: config.timeout,
                    });
                }
                Err(err) => last_error = Some(err),
            }
        }
        Err(TransportError::Connect {
            endpoint: endpoint.address(),
            attempts,
            source: last_error
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no attempt")),
        })
    }

    /// Send one message and wait for the matching response frame.
    pub fn roundtrip(&mut self, message: &WireMessage) -> Result<CommandResponse, TransportError> {
        self.send(message)?;
        self.receive()
    }

    pub fn send(&mut self, message: &WireMessage) -> Result<(), TransportError> {
        let encoded = message.encode_line()?;
        self.writer
            .write_all(encoded.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|err| TransportError::from_timed_io(err, self.timeout))
    }

    pub fn receive(&mut self) -> Result<CommandResponse, TransportError> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .map_err(|err| TransportError::from_timed_io(err, self.timeout))?;
        if read == 0 {
            return Err(TransportError::Disconnected);
        }
        match WireMessage::decode_line(&line)? {
            WireMessage::Response(response) => Ok(response),
            WireMessage::Invocation(_) => Err(TransportError::UnexpectedMessage("invocation")),
            WireMessage::PassthroughResult(_) => {
                Err(TransportError::UnexpectedMessage("passthrough-result"))
            }
        }
    }
}

fn retry_delay(config: &ClientConfig, attempt: u32) -> Duration {
    let base = config.backoff.saturating_mul(attempt);
    let jitter_ms = config.jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::server::{IpcServer, MessageHandler, ServerConfig};
    use cmdmox_common::wire::{Invocation, PassthroughResult};
    use std::sync::Arc;

    struct Upper;

    impl MessageHandler for Upper {
        fn on_invocation(&self, invocation: Invocation) -> CommandResponse {
            CommandResponse::text(invocation.command.to_uppercase(), "", 0)
        }

        fn on_passthrough_result(&self, result: PassthroughResult) -> CommandResponse {
            CommandResponse::text(result.stdout, result.stderr, result.exit_code)
        }
    }

    #[test]
    fn connects_and_exchanges_messages() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::new(dir.path().join("ipc.sock"));
        let _server =
            IpcServer::start(endpoint.clone(), Arc::new(Upper), &ServerConfig::default()).unwrap();

        let mut client = IpcClient::connect(&endpoint, &ClientConfig::default()).unwrap();
        let invocation = Invocation::new("inv-1", "git", vec![], String::new(), Default::default());
        let response = client
            .roundtrip(&WireMessage::Invocation(invocation))
            .unwrap();
        assert_eq!(response.stdout, "GIT");
    }

    #[test]
    fn reports_exhausted_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::new(dir.path().join("missing.sock"));
        let config = ClientConfig {
            connect_attempts: 2,
            backoff: Duration::from_millis(1),
            jitter: Duration::ZERO,
            ..ClientConfig::default()
        };
        match IpcClient::connect(&endpoint, &config) {
            Err(TransportError::Connect { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected connect error, got {other:?}"),
        }
    }

    #[test]
    fn retry_delay_grows_linearly() {
        let config = ClientConfig {
            backoff: Duration::from_millis(10),
            jitter: Duration::ZERO,
            ..ClientConfig::default()
        };
        assert_eq!(retry_delay(&config, 1), Duration::from_millis(10));
        assert_eq!(retry_delay(&config, 3), Duration::from_millis(30));
    }
}
