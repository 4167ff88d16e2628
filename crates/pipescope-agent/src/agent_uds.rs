use crate::registry::{PipelineRegistry, RegistryError};
use notify::{RecursiveMode, Watcher};
use pipescope_core::inspector_ipc::{
    decode_frame, encode_frame, BinQuery, ChildBinNames, ErrorPayload, PipelineDump,
    PipelineNames, ReadyPayload, WireEnvelope, WireMsg, CURRENT_PROTOCOL_VERSION,
    DEFAULT_MAX_FRAME_BYTES, GSTREAMER_DOMAIN,
};
use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
#[cfg(unix)]
use std::{fs, os::unix::fs::PermissionsExt};
#[cfg(unix)]
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixListener, UnixStream,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::{mpsc, watch, RwLock},
};
use tracing::{debug, info, warn};

const CHANGE_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct AgentUdsConfig {
    pub session_id: String,
    pub agent_id: String,
    pub socket_path: PathBuf,
    pub pipelines_dir: PathBuf,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
}

#[cfg(not(unix))]
pub async fn run(_config: AgentUdsConfig, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
    let _ = shutdown.changed().await;
    Ok(())
}

#[cfg(unix)]
pub async fn run(config: AgentUdsConfig, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
    if let Some(parent) = config.socket_path.parent() {
        fs::create_dir_all(parent)?;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
    }

    if config.socket_path.exists() {
        let _ = fs::remove_file(&config.socket_path);
    }

    let listener = UnixListener::bind(&config.socket_path)?;
    let _ = fs::set_permissions(&config.socket_path, fs::Permissions::from_mode(0o600));

    let agent = Arc::new(InspectorAgent::new(config.clone()));
    agent.clone().spawn_pipeline_watcher(shutdown.clone());

    info!(
        event = "agent_uds_start",
        session_id = %config.session_id,
        socket = %config.socket_path.display(),
        pipelines_dir = %config.pipelines_dir.display(),
        queue_capacity = config.queue_capacity
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let agent = agent.clone();
                        tokio::spawn(async move {
                            agent.handle_connection(stream).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "agent_uds_accept_error", error = %err);
                    }
                }
            }
        }
    }

    let _ = fs::remove_file(&config.socket_path);
    info!(event = "agent_uds_stop", session_id = %config.session_id);
    Ok(())
}

#[cfg(unix)]
struct InspectorAgent {
    config: AgentUdsConfig,
    registry: PipelineRegistry,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, mpsc::Sender<WireEnvelope>>>,
}

#[cfg(unix)]
impl InspectorAgent {
    fn new(config: AgentUdsConfig) -> Self {
        let registry = PipelineRegistry::new(config.pipelines_dir.clone());
        Self {
            config,
            registry,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("agent-conn-{id}")
    }

    fn make_envelope(&self, request_id: Option<String>, msg: WireMsg) -> WireEnvelope {
        WireEnvelope::new(
            &self.config.session_id,
            &self.config.agent_id,
            request_id,
            msg,
        )
    }

    async fn register_client(
        &self,
        conn_id: &str,
        client_id: &str,
        sender: mpsc::Sender<WireEnvelope>,
    ) {
        self.clients
            .write()
            .await
            .insert(conn_id.to_string(), sender);
        info!(event = "agent_client_connected", conn_id = %conn_id, client_id = %client_id);
    }

    async fn unregister_client(&self, conn_id: &str) {
        if self.clients.write().await.remove(conn_id).is_some() {
            info!(event = "agent_client_disconnected", conn_id = conn_id);
        }
    }

    async fn broadcast(&self, envelope: WireEnvelope) {
        let clients = self.clients.read().await.clone();
        let mut slow = Vec::new();

        for (conn_id, sender) in clients {
            match sender.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    slow.push(conn_id);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event = "agent_slow_consumer", conn_id = %conn_id);
                    slow.push(conn_id);
                }
            }
        }

        for conn_id in slow {
            self.unregister_client(&conn_id).await;
        }
    }

    fn spawn_pipeline_watcher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let dir = self.config.pipelines_dir.clone();
        tokio::spawn(async move {
            let (event_tx, mut event_rx) = mpsc::unbounded_channel::<()>();
            let mut watcher = match notify::recommended_watcher(
                move |res: notify::Result<notify::Event>| {
                    if res.is_ok() {
                        let _ = event_tx.send(());
                    }
                },
            ) {
                Ok(watcher) => watcher,
                Err(err) => {
                    warn!(event = "agent_watch_failed", error = %err);
                    return;
                }
            };
            if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                warn!(event = "agent_watch_failed", dir = %dir.display(), error = %err);
                return;
            }

            let mut pending = false;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    Some(()) = event_rx.recv() => {
                        pending = true;
                    }
                    _ = tokio::time::sleep(CHANGE_DEBOUNCE), if pending => {
                        pending = false;
                        debug!(event = "agent_pipelines_changed", dir = %dir.display());
                        let envelope = self.make_envelope(None, WireMsg::ActivePipelinesChanged);
                        self.broadcast(envelope).await;
                    }
                }
            }
        });
    }

    async fn answer(&self, msg: WireMsg) -> WireMsg {
        let registry = self.registry.clone();
        let result = tokio::task::spawn_blocking(move || answer_request(&registry, msg)).await;
        match result {
            Ok(reply) => reply,
            Err(err) => WireMsg::Error(ErrorPayload {
                code: "internal".to_string(),
                message: err.to_string(),
            }),
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let conn_id = self.next_conn_id();
        let (reader_half, writer_half) = stream.into_split();
        let mut reader = BufReader::new(reader_half);

        let Some(hello) = read_next_valid_frame(&mut reader).await else {
            return;
        };

        if hello.version.0 > CURRENT_PROTOCOL_VERSION {
            warn!(
                event = "agent_uds_unsupported_version",
                conn_id = %conn_id,
                version = hello.version.0
            );
            return;
        }
        if hello.session_id != self.config.session_id {
            warn!(
                event = "agent_uds_session_mismatch",
                conn_id = %conn_id,
                msg_session = %hello.session_id,
                expected_session = %self.config.session_id
            );
            return;
        }

        let WireMsg::Hello(payload) = hello.msg else {
            warn!(event = "agent_uds_expected_hello", conn_id = %conn_id);
            return;
        };

        let (tx, rx) = mpsc::channel::<WireEnvelope>(self.config.queue_capacity);
        let write_timeout = self.config.write_timeout;
        let conn_for_writer = conn_id.clone();
        let writer_task = tokio::spawn(async move {
            writer_loop(conn_for_writer, writer_half, rx, write_timeout).await;
        });

        self.register_client(&conn_id, &payload.client_id, tx.clone())
            .await;

        let ready = self.make_envelope(
            hello.request_id,
            WireMsg::Ready(ReadyPayload {
                agent_id: self.config.agent_id.clone(),
                domains: vec![GSTREAMER_DOMAIN.to_string()],
            }),
        );
        let _ = tx.send(ready).await;

        loop {
            let Some(envelope) = read_next_valid_frame(&mut reader).await else {
                break;
            };
            if envelope.version.0 > CURRENT_PROTOCOL_VERSION {
                warn!(
                    event = "agent_uds_skip_version",
                    conn_id = %conn_id,
                    version = envelope.version.0
                );
                continue;
            }
            if envelope.session_id != self.config.session_id {
                warn!(
                    event = "agent_uds_message_session_mismatch",
                    conn_id = %conn_id,
                    msg_session = %envelope.session_id,
                    expected_session = %self.config.session_id
                );
                break;
            }

            match envelope.msg {
                msg @ (WireMsg::ListPipelineNames
                | WireMsg::ListChildBinNames(_)
                | WireMsg::DumpPipeline(_)) => {
                    let kind = msg.kind();
                    let reply = self.answer(msg).await;
                    debug!(
                        event = "agent_request",
                        conn_id = %conn_id,
                        request = kind,
                        reply = reply.kind(),
                        request_id = envelope.request_id.as_deref().unwrap_or_default()
                    );
                    let response = self.make_envelope(envelope.request_id, reply);
                    if tx.send(response).await.is_err() {
                        break;
                    }
                }
                WireMsg::Hello(_) => {
                    warn!(event = "agent_uds_unexpected_hello", conn_id = %conn_id);
                }
                other => {
                    debug!(
                        event = "agent_uds_ignored_message",
                        conn_id = %conn_id,
                        kind = other.kind()
                    );
                }
            }
        }

        self.unregister_client(&conn_id).await;
        drop(tx);
        let _ = writer_task.await;
    }
}

fn error_reply(err: RegistryError) -> WireMsg {
    WireMsg::Error(ErrorPayload {
        code: err.code().to_string(),
        message: err.to_string(),
    })
}

/// Map one agent request onto the registry.
fn answer_request(registry: &PipelineRegistry, msg: WireMsg) -> WireMsg {
    match msg {
        WireMsg::ListPipelineNames => match registry.pipeline_names() {
            Ok(names) => WireMsg::PipelineNames(PipelineNames { names }),
            Err(err) => error_reply(err),
        },
        WireMsg::ListChildBinNames(BinQuery {
            pipeline_name,
            bin_name,
        }) => WireMsg::ChildBinNames(ChildBinNames {
            bin_names: registry.child_bin_names(&pipeline_name, &bin_name),
        }),
        WireMsg::DumpPipeline(BinQuery {
            pipeline_name,
            bin_name,
        }) => match registry.dump_pipeline(&pipeline_name, &bin_name) {
            Ok(graph_representation) => WireMsg::PipelineDump(PipelineDump {
                graph_representation,
            }),
            Err(err) => error_reply(err),
        },
        other => WireMsg::Error(ErrorPayload {
            code: "unsupported".to_string(),
            message: format!("unsupported request {}", other.kind()),
        }),
    }
}

#[cfg(unix)]
async fn writer_loop(
    conn_id: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<WireEnvelope>,
    write_timeout: Duration,
) {
    while let Some(envelope) = rx.recv().await {
        let frame = match encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "agent_uds_encode_error", conn_id = %conn_id, error = %err);
                continue;
            }
        };
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if tokio::time::timeout(write_timeout, send).await.is_err() {
            warn!(event = "agent_uds_write_timeout", conn_id = %conn_id);
            break;
        }
    }
}

#[cfg(unix)]
async fn read_next_valid_frame(reader: &mut BufReader<OwnedReadHalf>) -> Option<WireEnvelope> {
    loop {
        let mut line = Vec::new();
        let n = match reader.read_until(b'\n', &mut line).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "agent_uds_read_error", error = %err);
                return None;
            }
        };
        if n == 0 {
            return None;
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match decode_frame::<WireEnvelope>(&line, DEFAULT_MAX_FRAME_BYTES) {
            Ok(envelope) => return Some(envelope),
            Err(err) => {
                warn!(event = "agent_uds_decode_error", error = %err);
                continue;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pipescope_core::inspector_ipc::HelloPayload;
    use std::path::Path;
    use std::time::{SystemTime, UNIX_EPOCH};

    const PIPELINE: &str = r#"digraph pipeline {
  subgraph cluster_bin_0x1 {
    label="GstBin\nbin0\n[>]";
    subgraph cluster_src_0x2 {
      label="GstFakeSrc\nsrc\n[>]";
      src_0x2_src [label="src"];
    }
  }
}
"#;

    fn test_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("pipescope-agent-test-{name}-{nanos}"))
            .join("agent.sock")
    }

    async fn wait_for_socket(path: &Path) {
        for _ in 0..100 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("socket did not appear: {}", path.display());
    }

    fn request(session: &str, request_id: &str, msg: WireMsg) -> WireEnvelope {
        WireEnvelope::new(session, "panel-test", Some(request_id.to_string()), msg)
    }

    fn hello(session: &str) -> WireEnvelope {
        WireEnvelope::new(
            session,
            "panel-test",
            None,
            WireMsg::Hello(HelloPayload {
                client_id: "panel-test".to_string(),
                role: "inspector".to_string(),
                capabilities: vec!["pipelines".to_string()],
            }),
        )
    }

    async fn connect_client(
        path: &Path,
        hello: WireEnvelope,
    ) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let stream = UnixStream::connect(path)
            .await
            .unwrap_or_else(|err| panic!("connect failed: {err}"));
        let (reader, mut writer) = stream.into_split();
        send_frame(&mut writer, &hello).await;
        (BufReader::new(reader), writer)
    }

    async fn send_frame(writer: &mut OwnedWriteHalf, envelope: &WireEnvelope) {
        let frame = encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        writer.write_all(&frame).await.expect("write");
        writer.flush().await.expect("flush");
    }

    async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> WireEnvelope {
        let mut line = Vec::new();
        let read =
            tokio::time::timeout(Duration::from_secs(3), reader.read_until(b'\n', &mut line))
                .await
                .expect("read timeout")
                .expect("read error");
        assert!(read > 0, "unexpected EOF");
        decode_frame(&line, DEFAULT_MAX_FRAME_BYTES).expect("decode")
    }

    async fn launch_agent(
        name: &str,
        session: &str,
        pipelines_dir: &Path,
    ) -> (
        PathBuf,
        watch::Sender<bool>,
        tokio::task::JoinHandle<io::Result<()>>,
    ) {
        let path = test_path(name);
        let cfg = AgentUdsConfig {
            session_id: session.to_string(),
            agent_id: "agent-test".to_string(),
            socket_path: path.clone(),
            pipelines_dir: pipelines_dir.to_path_buf(),
            write_timeout: Duration::from_secs(1),
            queue_capacity: 32,
        };
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(cfg, rx));
        wait_for_socket(&path).await;
        (path, tx, handle)
    }

    #[test]
    fn answers_requests_from_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("p0.dot"), PIPELINE).expect("write");
        let registry = PipelineRegistry::new(dir.path());

        let reply = answer_request(&registry, WireMsg::ListPipelineNames);
        assert_eq!(
            reply,
            WireMsg::PipelineNames(PipelineNames {
                names: vec!["p0".to_string()]
            })
        );

        let reply = answer_request(
            &registry,
            WireMsg::DumpPipeline(BinQuery {
                pipeline_name: "p1".to_string(),
                bin_name: String::new(),
            }),
        );
        let WireMsg::Error(err) = reply else {
            panic!("expected error")
        };
        assert_eq!(err.message, "No active pipeline named p1");

        let reply = answer_request(&registry, WireMsg::ActivePipelinesChanged);
        assert!(matches!(reply, WireMsg::Error(ErrorPayload { ref code, .. }) if code == "unsupported"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ready_then_correlated_responses() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("p0.dot"), PIPELINE).expect("write");
        let session = "agent-test-session";
        let (path, shutdown_tx, handle) = launch_agent("requests", session, dir.path()).await;

        let (mut reader, mut writer) = connect_client(&path, hello(session)).await;
        let ready = read_frame(&mut reader).await;
        let WireMsg::Ready(ready_payload) = ready.msg else {
            panic!("expected ready")
        };
        assert!(ready_payload.has_domain(GSTREAMER_DOMAIN));

        send_frame(&mut writer, &request(session, "r1", WireMsg::ListPipelineNames)).await;
        send_frame(
            &mut writer,
            &request(
                session,
                "r2",
                WireMsg::ListChildBinNames(BinQuery {
                    pipeline_name: "p0".to_string(),
                    bin_name: String::new(),
                }),
            ),
        )
        .await;
        send_frame(
            &mut writer,
            &request(
                session,
                "r3",
                WireMsg::DumpPipeline(BinQuery {
                    pipeline_name: "p0".to_string(),
                    bin_name: "missing".to_string(),
                }),
            ),
        )
        .await;

        let first = read_frame(&mut reader).await;
        assert_eq!(first.request_id.as_deref(), Some("r1"));
        let WireMsg::PipelineNames(names) = first.msg else {
            panic!("expected names")
        };
        assert_eq!(names.names, vec!["p0".to_string()]);

        let second = read_frame(&mut reader).await;
        assert_eq!(second.request_id.as_deref(), Some("r2"));
        let WireMsg::ChildBinNames(bins) = second.msg else {
            panic!("expected bins")
        };
        assert_eq!(bins.bin_names, vec!["bin0".to_string()]);

        let third = read_frame(&mut reader).await;
        assert_eq!(third.request_id.as_deref(), Some("r3"));
        let WireMsg::Error(err) = third.msg else {
            panic!("expected error")
        };
        assert_eq!(err.code, "unknown_bin");
        assert_eq!(err.message, "No bin named missing in pipeline p0");

        let _ = shutdown_tx.send(true);
        let result = handle.await.expect("join agent");
        assert!(result.is_ok(), "agent returned error: {result:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejects_cross_session_clients() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (path, shutdown_tx, handle) =
            launch_agent("session", "agent-session-a", dir.path()).await;

        let (mut reader, _writer) = connect_client(&path, hello("agent-session-b")).await;
        let mut line = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(3), reader.read_until(b'\n', &mut line))
            .await
            .expect("read timeout")
            .expect("read error");
        assert_eq!(read, 0, "expected the agent to close the connection");

        let _ = shutdown_tx.send(true);
        let _ = handle.await.expect("join agent");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn directory_changes_are_broadcast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = "agent-watch-session";
        let (path, shutdown_tx, handle) = launch_agent("watch", session, dir.path()).await;

        let (mut reader, _writer) = connect_client(&path, hello(session)).await;
        let ready = read_frame(&mut reader).await;
        assert!(matches!(ready.msg, WireMsg::Ready(_)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(dir.path().join("fresh.dot"), PIPELINE).expect("write");

        let changed = read_frame(&mut reader).await;
        assert_eq!(changed.msg, WireMsg::ActivePipelinesChanged);

        let _ = shutdown_tx.send(true);
        let _ = handle.await.expect("join agent");
    }
}
