use neohub_core::hub_ipc::{encode_frame, DEFAULT_MAX_FRAME_BYTES};
use neohub_core::RunRequest;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tracing::debug;

const RESPONSE_BUFFER_BYTES: usize = 1024;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("NeoHub is not running: no socket at {}", .0.display())]
    ConnectionUnavailable(PathBuf),
    #[error("transport failure: {0}")]
    TransportFailure(String),
}

impl From<io::Error> for SendError {
    fn from(err: io::Error) -> Self {
        SendError::TransportFailure(err.to_string())
    }
}

/// One request, one response, one connection per call.
#[derive(Debug, Clone)]
pub struct SocketClient {
    socket_path: PathBuf,
    response_timeout: Duration,
}

impl SocketClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            response_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Blocks until the hub answers. Must not be called from inside a tokio runtime.
    pub fn send(&self, request: &RunRequest) -> Result<String, SendError> {
        if !self.socket_path.exists() {
            return Err(SendError::ConnectionUnavailable(self.socket_path.clone()));
        }

        let frame = encode_frame(request, DEFAULT_MAX_FRAME_BYTES)
            .map_err(|err| SendError::TransportFailure(err.to_string()))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.exchange(frame))
    }

    async fn exchange(&self, frame: Vec<u8>) -> Result<String, SendError> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        debug!(event = "client_connected", socket = %self.socket_path.display());
        let (mut reader, mut writer) = stream.into_split();

        let (response_tx, response_rx) = oneshot::channel();
        let read_task = tokio::spawn(async move {
            let mut buf = vec![0u8; RESPONSE_BUFFER_BYTES];
            let result = match reader.read(&mut buf).await {
                Ok(0) => Err(SendError::TransportFailure(
                    "connection closed before a response arrived".to_string(),
                )),
                Ok(read) => Ok(String::from_utf8_lossy(&buf[..read]).into_owned()),
                Err(err) => Err(err.into()),
            };
            let _ = response_tx.send(result);
        });

        if let Err(err) = writer.write_all(&frame).await {
            read_task.abort();
            return Err(err.into());
        }

        let result = match tokio::time::timeout(self.response_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SendError::TransportFailure(
                "response reader stopped".to_string(),
            )),
            Err(_) => Err(SendError::TransportFailure(format!(
                "no response within {}ms",
                self.response_timeout.as_millis()
            ))),
        };
        read_task.abort();
        result
    }
}
