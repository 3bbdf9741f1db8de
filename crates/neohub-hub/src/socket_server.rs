use crate::error::HubError;
use crate::registry::EditorRegistry;
use crate::report::{ReportKind, ReportableError, Reporter};
use neohub_core::hub_ipc::{FrameDecoder, ACK, DEFAULT_MAX_FRAME_BYTES};
use neohub_core::RunRequest;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{fs, io};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

const READ_BUFFER_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct SocketServerConfig {
    pub socket_path: PathBuf,
    pub max_frame_bytes: usize,
    pub write_timeout: Duration,
}

impl SocketServerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            write_timeout: Duration::from_secs(2),
        }
    }
}

struct Connection {
    conn_id: u64,
    config: SocketServerConfig,
    registry: EditorRegistry,
    reporter: Arc<dyn Reporter>,
}

/// Accepts CLI connections until `shutdown` flips to true. The socket file is
/// owned by the server: a stale one is replaced at start and removed on stop.
pub async fn run(
    config: SocketServerConfig,
    registry: EditorRegistry,
    reporter: Arc<dyn Reporter>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), HubError> {
    let listener = match bind(&config) {
        Ok(listener) => listener,
        Err(err) => {
            let report = ReportableError::new("Failed to launch the socket server", "socket_server::run")
                .with_meta("SocketPath", config.socket_path.display())
                .with_source(&err);
            error!(
                event = "socket_server_start_failed",
                socket = %config.socket_path.display(),
                error = %err
            );
            reporter.report(ReportKind::FailedToLaunchServer, &report);
            return Err(HubError::ServerStartFailure(err));
        }
    };

    info!(event = "socket_server_start", socket = %config.socket_path.display());

    let next_conn_id = AtomicU64::new(1);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let connection = Connection {
                            conn_id: next_conn_id.fetch_add(1, Ordering::Relaxed),
                            config: config.clone(),
                            registry: registry.clone(),
                            reporter: reporter.clone(),
                        };
                        tokio::spawn(connection.handle(stream));
                    }
                    Err(err) => {
                        warn!(event = "socket_server_accept_error", error = %err);
                    }
                }
            }
        }
    }

    if let Err(err) = fs::remove_file(&config.socket_path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(
                event = "socket_server_cleanup_failed",
                socket = %config.socket_path.display(),
                error = %err
            );
        }
    }
    info!(event = "socket_server_stop", socket = %config.socket_path.display());
    Ok(())
}

fn bind(config: &SocketServerConfig) -> io::Result<UnixListener> {
    if let Some(parent) = config.socket_path.parent() {
        fs::create_dir_all(parent)?;
    }

    if fs::symlink_metadata(&config.socket_path).is_ok() {
        warn!(event = "socket_server_stale_socket", socket = %config.socket_path.display());
        fs::remove_file(&config.socket_path)?;
    }

    let listener = UnixListener::bind(&config.socket_path)?;
    let _ = fs::set_permissions(&config.socket_path, fs::Permissions::from_mode(0o600));
    Ok(listener)
}

impl Connection {
    async fn handle(self, mut stream: UnixStream) {
        debug!(event = "cli_connected", conn_id = self.conn_id);
        let mut decoder = FrameDecoder::<RunRequest>::new(self.config.max_frame_bytes);
        let mut buf = vec![0u8; READ_BUFFER_BYTES];

        'read: loop {
            let read = match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) => {
                    debug!(event = "cli_read_error", conn_id = self.conn_id, error = %err);
                    break;
                }
            };

            let report = decoder.push_chunk(&buf[..read]);
            for request in report.frames {
                self.dispatch(request);
                if !self.acknowledge(&mut stream).await {
                    break 'read;
                }
            }

            if let Some(err) = report.errors.into_iter().next() {
                // The stream offset can't be trusted past a bad frame.
                let error = HubError::ProtocolDecodeFailure(err);
                let report = ReportableError::new(
                    "Failed to decode a request from the cli",
                    "socket_server::handle",
                )
                .with_meta("ConnectionID", self.conn_id)
                .with_source(&error);
                error!(event = "cli_decode_failed", conn_id = self.conn_id, error = %error);
                self.reporter.report(error.report_kind(), &report);
                break;
            }
        }

        debug!(event = "cli_disconnected", conn_id = self.conn_id);
    }

    fn dispatch(&self, request: RunRequest) {
        info!(
            event = "cli_request",
            conn_id = self.conn_id,
            wd = %request.wd.display(),
            bin = %request.bin.display(),
            name = request.name.as_deref().unwrap_or("-"),
            path = request.path.as_deref().unwrap_or("-"),
            opts = ?request.opts
        );
        trace!(event = "cli_request_env", conn_id = self.conn_id, env = ?request.env);
        self.registry.run_editor(request);
    }

    async fn acknowledge(&self, stream: &mut UnixStream) -> bool {
        match tokio::time::timeout(self.config.write_timeout, stream.write_all(ACK)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                debug!(event = "cli_ack_failed", conn_id = self.conn_id, error = %err);
                false
            }
            Err(_) => {
                warn!(event = "cli_ack_timeout", conn_id = self.conn_id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationTracker;
    use crate::registry::{RegistryConfig, SortTarget};
    use crate::report::RecordingReporter;
    use crate::testing::{FakeDesktop, FakeLauncher, FakeWindows};
    use neohub_core::hub_ipc::encode_frame;
    use std::collections::BTreeMap;
    use std::os::unix::fs::FileTypeExt;
    use std::path::Path;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn test_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("neohub-test-{name}-{nanos}"))
            .join("neohub.sock")
    }

    async fn wait_for_socket(path: &Path) {
        for _ in 0..100 {
            let is_socket = fs::symlink_metadata(path)
                .map(|meta| meta.file_type().is_socket())
                .unwrap_or(false);
            if is_socket {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("socket did not appear: {}", path.display());
    }

    struct LaunchedHub {
        path: PathBuf,
        shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<Result<(), HubError>>,
        registry: EditorRegistry,
        launcher: FakeLauncher,
        reporter: Arc<RecordingReporter>,
    }

    async fn launch_hub_at(path: PathBuf) -> LaunchedHub {
        let launcher = FakeLauncher::default();
        let desktop = Arc::new(FakeDesktop::default());
        let reporter = Arc::new(RecordingReporter::default());
        let tracker = Arc::new(ActivationTracker::new(
            1,
            desktop.clone(),
            Arc::new(FakeWindows::default()),
        ));
        let registry = EditorRegistry::spawn(
            RegistryConfig::default(),
            Arc::new(launcher.clone()),
            desktop,
            tracker,
            reporter.clone(),
        );
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            SocketServerConfig::new(path.clone()),
            registry.clone(),
            reporter.clone(),
            rx,
        ));
        wait_for_socket(&path).await;
        LaunchedHub {
            path,
            shutdown,
            handle,
            registry,
            launcher,
            reporter,
        }
    }

    async fn launch_hub(name: &str) -> LaunchedHub {
        launch_hub_at(test_path(name)).await
    }

    fn run_request(wd: &str) -> RunRequest {
        RunRequest::new(
            wd,
            "/usr/bin/neovide",
            None,
            Some("main.rs".to_string()),
            vec![],
            BTreeMap::new(),
        )
    }

    async fn read_reply(stream: &mut UnixStream) -> Vec<u8> {
        let mut reply = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
                .await
                .expect("read timeout")
                .expect("read");
            if read == 0 {
                return reply;
            }
            reply.extend_from_slice(&buf[..read]);
            if reply.len() >= ACK.len() {
                return reply;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_is_acknowledged_and_dispatched() {
        let hub = launch_hub("ack").await;
        let mut stream = UnixStream::connect(&hub.path).await.expect("connect");

        let frame = encode_frame(&run_request("/work/a"), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        stream.write_all(&frame).await.expect("write");
        assert_eq!(read_reply(&mut stream).await, ACK);

        let editors = hub.registry.editors(SortTarget::Menubar).await;
        assert_eq!(editors.len(), 1);
        assert_eq!(editors[0].name, "main.rs");
        assert_eq!(hub.launcher.launched()[0].args, vec!["--no-fork", "main.rs"]);

        let _ = hub.shutdown.send(true);
        hub.handle.await.expect("join").expect("server");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_split_across_writes_is_reassembled() {
        let hub = launch_hub("split").await;
        let mut stream = UnixStream::connect(&hub.path).await.expect("connect");

        let frame = encode_frame(&run_request("/work/b"), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let (head, tail) = frame.split_at(3);
        stream.write_all(head).await.expect("write head");
        stream.flush().await.expect("flush");
        tokio::time::sleep(Duration::from_millis(30)).await;
        stream.write_all(tail).await.expect("write tail");
        assert_eq!(read_reply(&mut stream).await, ACK);
        assert_eq!(hub.registry.len().await, 1);

        let _ = hub.shutdown.send(true);
        let _ = hub.handle.await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_request_is_reported_without_ack() {
        let hub = launch_hub("malformed").await;
        let mut stream = UnixStream::connect(&hub.path).await.expect("connect");

        let body = br#"{"wd":"relative/dir","bin":"/usr/bin/neovide"}"#;
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        stream.write_all(&frame).await.expect("write");

        assert!(read_reply(&mut stream).await.is_empty());
        assert!(hub.registry.is_empty().await);
        assert_eq!(
            hub.reporter.kinds(),
            vec![ReportKind::FailedToHandleRequestFromCli]
        );

        let _ = hub.shutdown.send(true);
        let _ = hub.handle.await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_socket_is_replaced_and_removed_on_shutdown() {
        let path = test_path("stale");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, b"stale").expect("stale file");

        let hub = launch_hub_at(path.clone()).await;
        let mut stream = UnixStream::connect(&hub.path).await.expect("connect");
        let frame = encode_frame(&run_request("/work/c"), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        stream.write_all(&frame).await.expect("write");
        assert_eq!(read_reply(&mut stream).await, ACK);

        let _ = hub.shutdown.send(true);
        hub.handle.await.expect("join").expect("server");
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unbindable_path_reports_server_start_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").expect("file");

        let registry_reporter = Arc::new(RecordingReporter::default());
        let desktop = Arc::new(FakeDesktop::default());
        let tracker = Arc::new(ActivationTracker::new(
            1,
            desktop.clone(),
            Arc::new(FakeWindows::default()),
        ));
        let registry = EditorRegistry::spawn(
            RegistryConfig::default(),
            Arc::new(FakeLauncher::default()),
            desktop,
            tracker,
            registry_reporter.clone(),
        );
        let (_shutdown, rx) = watch::channel(false);
        let result = run(
            SocketServerConfig::new(blocker.join("neohub.sock")),
            registry,
            registry_reporter.clone(),
            rx,
        )
        .await;

        assert!(matches!(result, Err(HubError::ServerStartFailure(_))));
        assert_eq!(
            registry_reporter.kinds(),
            vec![ReportKind::FailedToLaunchServer]
        );
    }
}
