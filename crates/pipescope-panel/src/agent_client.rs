//! Client side of the inspector socket.
//!
//! [`UdsPipelineAgent`] keeps one connection to the agent alive in a
//! background task, reconnecting with backoff. Requests are matched to
//! replies by `request_id`; connection state changes and pushed
//! notifications are reported as [`AgentEvent`]s.

use async_trait::async_trait;
use pipescope_core::inspector_ipc::{BinQuery, WireMsg};
use std::{path::PathBuf, time::Duration};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[cfg(unix)]
use pipescope_core::config::next_backoff;
#[cfg(unix)]
use pipescope_core::inspector_ipc::{
    encode_frame, HelloPayload, NdjsonFrameDecoder, WireEnvelope, CURRENT_PROTOCOL_VERSION,
    DEFAULT_MAX_FRAME_BYTES, GSTREAMER_DOMAIN,
};
#[cfg(unix)]
use std::{collections::HashMap, io};
#[cfg(unix)]
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
};
#[cfg(unix)]
use tracing::{debug, info, warn};

const COMMAND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("pipeline agent is not connected")]
    NotConnected,
    #[error("pipeline agent disconnected before replying")]
    Disconnected,
    #[error("pipeline agent did not reply within {0:?}")]
    Timeout(Duration),
    #[error("{message}")]
    Remote { code: String, message: String },
    #[error("unexpected {0} reply from pipeline agent")]
    UnexpectedReply(&'static str),
}

/// The three operations a pipeline agent answers.
#[async_trait]
pub trait PipelineAgent: Send + Sync {
    async fn list_pipeline_names(&self) -> Result<Vec<String>, AgentError>;

    async fn list_child_bin_names(
        &self,
        pipeline_name: &str,
        bin_name: &str,
    ) -> Result<Vec<String>, AgentError>;

    async fn dump_pipeline(&self, pipeline_name: &str, bin_name: &str)
        -> Result<String, AgentError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// The agent answered `hello` and serves the GStreamer domain.
    TargetAvailable,
    Disconnected,
    /// The agent's set of active pipelines changed.
    PipelinesChanged,
}

/// Who asked for a dump; decides how its reply is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpOrigin {
    Catalog,
    Navigation,
    RefreshTick { session_id: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRequest {
    ListPipelineNames,
    ListChildBinNames {
        generation: u64,
        query: BinQuery,
    },
    DumpPipeline {
        query: BinQuery,
        parent_bin_name: String,
        origin: DumpOrigin,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    PipelineNames(Result<Vec<String>, AgentError>),
    ChildBinNames {
        generation: u64,
        result: Result<Vec<String>, AgentError>,
    },
    PipelineDump {
        query: BinQuery,
        parent_bin_name: String,
        origin: DumpOrigin,
        result: Result<String, AgentError>,
    },
}

/// Run one request against the agent and pair the result with the request's
/// context.
pub async fn execute(agent: &dyn PipelineAgent, request: AgentRequest) -> AgentReply {
    match request {
        AgentRequest::ListPipelineNames => {
            AgentReply::PipelineNames(agent.list_pipeline_names().await)
        }
        AgentRequest::ListChildBinNames { generation, query } => AgentReply::ChildBinNames {
            generation,
            result: agent
                .list_child_bin_names(&query.pipeline_name, &query.bin_name)
                .await,
        },
        AgentRequest::DumpPipeline {
            query,
            parent_bin_name,
            origin,
        } => {
            let result = agent
                .dump_pipeline(&query.pipeline_name, &query.bin_name)
                .await;
            AgentReply::PipelineDump {
                query,
                parent_bin_name,
                origin,
                result,
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct AgentClientConfig {
    pub session_id: String,
    pub client_id: String,
    pub socket_path: PathBuf,
    pub request_timeout: Duration,
}

struct AgentCommand {
    msg: WireMsg,
    reply: oneshot::Sender<Result<WireMsg, AgentError>>,
}

/// [`PipelineAgent`] over the agent's Unix socket.
#[derive(Clone)]
pub struct UdsPipelineAgent {
    commands: mpsc::Sender<AgentCommand>,
    request_timeout: Duration,
}

impl UdsPipelineAgent {
    /// Start the connection task. It ends once every clone of the returned
    /// client has been dropped.
    pub fn spawn(config: AgentClientConfig, events: mpsc::Sender<AgentEvent>) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let request_timeout = config.request_timeout;
        tokio::spawn(connection_loop(config, events, command_rx));
        Self {
            commands,
            request_timeout,
        }
    }

    async fn request(&self, msg: WireMsg) -> Result<WireMsg, AgentError> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(AgentCommand { msg, reply })
            .await
            .map_err(|_| AgentError::NotConnected)?;
        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AgentError::Disconnected),
            Err(_) => Err(AgentError::Timeout(self.request_timeout)),
        }
    }
}

#[async_trait]
impl PipelineAgent for UdsPipelineAgent {
    async fn list_pipeline_names(&self) -> Result<Vec<String>, AgentError> {
        match self.request(WireMsg::ListPipelineNames).await? {
            WireMsg::PipelineNames(payload) => Ok(payload.names),
            other => Err(unexpected(other)),
        }
    }

    async fn list_child_bin_names(
        &self,
        pipeline_name: &str,
        bin_name: &str,
    ) -> Result<Vec<String>, AgentError> {
        let query = BinQuery {
            pipeline_name: pipeline_name.to_string(),
            bin_name: bin_name.to_string(),
        };
        match self.request(WireMsg::ListChildBinNames(query)).await? {
            WireMsg::ChildBinNames(payload) => Ok(payload.bin_names),
            other => Err(unexpected(other)),
        }
    }

    async fn dump_pipeline(
        &self,
        pipeline_name: &str,
        bin_name: &str,
    ) -> Result<String, AgentError> {
        let query = BinQuery {
            pipeline_name: pipeline_name.to_string(),
            bin_name: bin_name.to_string(),
        };
        match self.request(WireMsg::DumpPipeline(query)).await? {
            WireMsg::PipelineDump(payload) => Ok(payload.graph_representation),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(msg: WireMsg) -> AgentError {
    match msg {
        WireMsg::Error(payload) => AgentError::Remote {
            code: payload.code,
            message: payload.message,
        },
        other => AgentError::UnexpectedReply(other.kind()),
    }
}

#[cfg(not(unix))]
async fn connection_loop(
    _config: AgentClientConfig,
    events: mpsc::Sender<AgentEvent>,
    mut command_rx: mpsc::Receiver<AgentCommand>,
) {
    let _ = events.send(AgentEvent::Disconnected).await;
    while let Some(command) = command_rx.recv().await {
        let _ = command.reply.send(Err(AgentError::NotConnected));
    }
}

#[cfg(unix)]
async fn connection_loop(
    config: AgentClientConfig,
    events: mpsc::Sender<AgentEvent>,
    mut command_rx: mpsc::Receiver<AgentCommand>,
) {
    let mut backoff = Duration::from_secs(1);

    loop {
        match UnixStream::connect(&config.socket_path).await {
            Ok(stream) => {
                backoff = Duration::from_secs(1);
                let open = serve_connection(&config, stream, &events, &mut command_rx).await;
                if !open {
                    return;
                }
            }
            Err(err) => {
                debug!(
                    event = "agent_connect_error",
                    socket = %config.socket_path.display(),
                    error = %err
                );
            }
        }

        // Nothing is queued for a later connection: requests made while
        // disconnected fail straight away.
        let retry = tokio::time::sleep(backoff);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                _ = &mut retry => break,
                maybe_command = command_rx.recv() => match maybe_command {
                    Some(command) => {
                        let _ = command.reply.send(Err(AgentError::NotConnected));
                    }
                    None => return,
                },
            }
        }
        backoff = next_backoff(backoff);
    }
}

/// Drive one connection until it drops. Returns false once the command
/// channel has closed and the client is gone.
#[cfg(unix)]
async fn serve_connection(
    config: &AgentClientConfig,
    stream: UnixStream,
    events: &mpsc::Sender<AgentEvent>,
    command_rx: &mut mpsc::Receiver<AgentCommand>,
) -> bool {
    let (reader_half, mut writer_half) = stream.into_split();
    let hello = WireEnvelope::new(
        &config.session_id,
        &config.client_id,
        None,
        WireMsg::Hello(HelloPayload {
            client_id: config.client_id.clone(),
            role: "inspector".to_string(),
            capabilities: vec!["pipelines".to_string(), "dump".to_string()],
        }),
    );
    if let Err(err) = send_wire_envelope(&mut writer_half, &hello).await {
        warn!(event = "agent_hello_error", error = %err);
        return true;
    }

    let mut reader = BufReader::new(reader_half);
    let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::new(DEFAULT_MAX_FRAME_BYTES);
    let mut read_buf = [0u8; 8192];
    let mut pending: HashMap<String, oneshot::Sender<Result<WireMsg, AgentError>>> =
        HashMap::new();
    let mut next_request_id = 0u64;
    let mut ready = false;
    let mut command_open = true;

    loop {
        tokio::select! {
            read = reader.read(&mut read_buf) => {
                let read = match read {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(event = "agent_read_error", error = %err);
                        break;
                    }
                };
                if read == 0 {
                    break;
                }
                let report = decoder.push_chunk(&read_buf[..read]);
                for err in report.errors {
                    warn!(event = "agent_decode_error", error = %err);
                }
                for envelope in report.frames {
                    if envelope.session_id != config.session_id
                        || envelope.version.0 > CURRENT_PROTOCOL_VERSION
                    {
                        continue;
                    }
                    match envelope.msg {
                        WireMsg::Ready(payload) => {
                            if payload.has_domain(GSTREAMER_DOMAIN) {
                                info!(event = "agent_ready", agent_id = %payload.agent_id);
                                ready = true;
                                let _ = events.send(AgentEvent::TargetAvailable).await;
                            } else {
                                warn!(
                                    event = "agent_missing_domain",
                                    agent_id = %payload.agent_id,
                                    domain = GSTREAMER_DOMAIN
                                );
                            }
                        }
                        WireMsg::ActivePipelinesChanged => {
                            let _ = events.send(AgentEvent::PipelinesChanged).await;
                        }
                        msg => {
                            let waiter = envelope
                                .request_id
                                .as_ref()
                                .and_then(|request_id| pending.remove(request_id));
                            match waiter {
                                Some(waiter) => {
                                    let _ = waiter.send(Ok(msg));
                                }
                                None => debug!(
                                    event = "agent_unmatched_reply",
                                    kind = msg.kind(),
                                    request_id = envelope.request_id.as_deref().unwrap_or_default()
                                ),
                            }
                        }
                    }
                }
            }
            maybe_command = command_rx.recv(), if command_open => {
                let Some(command) = maybe_command else {
                    command_open = false;
                    break;
                };
                if !ready {
                    let _ = command.reply.send(Err(AgentError::NotConnected));
                    continue;
                }
                next_request_id += 1;
                let request_id = format!("{}-{next_request_id}", config.client_id);
                let envelope = WireEnvelope::new(
                    &config.session_id,
                    &config.client_id,
                    Some(request_id.clone()),
                    command.msg,
                );
                if let Err(err) = send_wire_envelope(&mut writer_half, &envelope).await {
                    warn!(event = "agent_write_error", error = %err);
                    let _ = command.reply.send(Err(AgentError::Disconnected));
                    break;
                }
                pending.retain(|_, waiter| !waiter.is_closed());
                pending.insert(request_id, command.reply);
            }
        }
    }

    for err in decoder.finish().errors {
        warn!(event = "agent_decode_error", error = %err);
    }
    for (_, waiter) in pending.drain() {
        let _ = waiter.send(Err(AgentError::Disconnected));
    }
    if ready {
        info!(event = "agent_disconnected", socket = %config.socket_path.display());
        let _ = events.send(AgentEvent::Disconnected).await;
    }
    command_open
}

#[cfg(unix)]
async fn send_wire_envelope(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    envelope: &WireEnvelope,
) -> io::Result<()> {
    let frame = encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted agent: answers from canned results and records calls.
    #[derive(Default)]
    pub(crate) struct FakeAgent {
        pub names: Mutex<Vec<Result<Vec<String>, AgentError>>>,
        pub dumps: Mutex<Vec<Result<String, AgentError>>>,
        pub calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PipelineAgent for FakeAgent {
        async fn list_pipeline_names(&self) -> Result<Vec<String>, AgentError> {
            self.calls.lock().expect("calls").push("list".to_string());
            self.names
                .lock()
                .expect("names")
                .pop()
                .unwrap_or(Err(AgentError::NotConnected))
        }

        async fn list_child_bin_names(
            &self,
            pipeline_name: &str,
            bin_name: &str,
        ) -> Result<Vec<String>, AgentError> {
            self.calls
                .lock()
                .expect("calls")
                .push(format!("bins {pipeline_name}/{bin_name}"));
            Ok(vec![format!("{bin_name}child")])
        }

        async fn dump_pipeline(
            &self,
            pipeline_name: &str,
            bin_name: &str,
        ) -> Result<String, AgentError> {
            self.calls
                .lock()
                .expect("calls")
                .push(format!("dump {pipeline_name}/{bin_name}"));
            self.dumps
                .lock()
                .expect("dumps")
                .pop()
                .unwrap_or(Err(AgentError::NotConnected))
        }
    }

    #[tokio::test]
    async fn execute_keeps_request_context() {
        let agent = FakeAgent::default();
        agent
            .dumps
            .lock()
            .expect("dumps")
            .push(Ok("digraph p {}".to_string()));

        let reply = execute(
            &agent,
            AgentRequest::DumpPipeline {
                query: BinQuery {
                    pipeline_name: "p".to_string(),
                    bin_name: "bin".to_string(),
                },
                parent_bin_name: "outer".to_string(),
                origin: DumpOrigin::RefreshTick { session_id: 3 },
            },
        )
        .await;
        let AgentReply::PipelineDump {
            parent_bin_name,
            origin,
            result,
            ..
        } = reply
        else {
            panic!("expected dump reply")
        };
        assert_eq!(parent_bin_name, "outer");
        assert_eq!(origin, DumpOrigin::RefreshTick { session_id: 3 });
        assert_eq!(result.as_deref(), Ok("digraph p {}"));

        let reply = execute(
            &agent,
            AgentRequest::ListChildBinNames {
                generation: 7,
                query: BinQuery {
                    pipeline_name: "p".to_string(),
                    bin_name: String::new(),
                },
            },
        )
        .await;
        assert_eq!(
            reply,
            AgentReply::ChildBinNames {
                generation: 7,
                result: Ok(vec!["child".to_string()])
            }
        );
        assert_eq!(
            *agent.calls.lock().expect("calls"),
            vec!["dump p/bin".to_string(), "bins p/".to_string()]
        );
    }

    #[tokio::test]
    async fn execute_lists_pipeline_names() {
        let agent = FakeAgent::default();
        agent
            .names
            .lock()
            .expect("names")
            .push(Ok(vec!["playbin0".to_string(), "webrtcbin0".to_string()]));

        let reply = execute(&agent, AgentRequest::ListPipelineNames).await;
        assert_eq!(
            reply,
            AgentReply::PipelineNames(Ok(vec![
                "playbin0".to_string(),
                "webrtcbin0".to_string()
            ]))
        );

        let reply = execute(&agent, AgentRequest::ListPipelineNames).await;
        assert_eq!(
            reply,
            AgentReply::PipelineNames(Err(AgentError::NotConnected))
        );
        assert_eq!(
            *agent.calls.lock().expect("calls"),
            vec!["list".to_string(), "list".to_string()]
        );
    }

    #[test]
    fn error_replies_carry_agent_message() {
        let err = unexpected(WireMsg::Error(pipescope_core::inspector_ipc::ErrorPayload {
            code: "unknown_pipeline".to_string(),
            message: "No active pipeline named p".to_string(),
        }));
        assert_eq!(err.to_string(), "No active pipeline named p");
        assert_eq!(
            unexpected(WireMsg::ActivePipelinesChanged),
            AgentError::UnexpectedReply("active_pipelines_changed")
        );
    }

    #[cfg(unix)]
    mod socket {
        use super::super::*;
        use pipescope_core::inspector_ipc::{
            decode_frame, ChildBinNames, ErrorPayload, PipelineDump, PipelineNames, ReadyPayload,
        };
        use std::path::Path;
        use std::time::{SystemTime, UNIX_EPOCH};
        use tokio::io::AsyncBufReadExt;
        use tokio::net::UnixListener;

        const SESSION: &str = "panel-client-test";

        fn test_path(name: &str) -> PathBuf {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            let dir = std::env::temp_dir().join(format!("pipescope-panel-test-{name}-{nanos}"));
            std::fs::create_dir_all(&dir).expect("mkdir");
            dir.join("agent.sock")
        }

        fn client_config(path: &Path) -> AgentClientConfig {
            AgentClientConfig {
                session_id: SESSION.to_string(),
                client_id: "panel-test".to_string(),
                socket_path: path.to_path_buf(),
                request_timeout: Duration::from_secs(3),
            }
        }

        async fn write_envelope(
            writer: &mut tokio::net::unix::OwnedWriteHalf,
            request_id: Option<String>,
            msg: WireMsg,
        ) {
            let envelope = WireEnvelope::new(SESSION, "agent-test", request_id, msg);
            send_wire_envelope(writer, &envelope).await.expect("write");
        }

        /// Minimal agent: one connection, canned replies, a change
        /// notification after the first request.
        async fn serve_one(listener: UnixListener) {
            let (stream, _) = listener.accept().await.expect("accept");
            let (reader, mut writer) = stream.into_split();
            let mut reader = tokio::io::BufReader::new(reader);
            let mut line = Vec::new();
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                let envelope: WireEnvelope =
                    decode_frame(&line, DEFAULT_MAX_FRAME_BYTES).expect("decode");
                let reply = match envelope.msg {
                    WireMsg::Hello(_) => WireMsg::Ready(ReadyPayload {
                        agent_id: "agent-test".to_string(),
                        domains: vec![GSTREAMER_DOMAIN.to_string()],
                    }),
                    WireMsg::ListPipelineNames => WireMsg::PipelineNames(PipelineNames {
                        names: vec!["p0".to_string(), "p1".to_string()],
                    }),
                    WireMsg::ListChildBinNames(query) => WireMsg::ChildBinNames(ChildBinNames {
                        bin_names: vec![format!("{}-bin", query.pipeline_name)],
                    }),
                    WireMsg::DumpPipeline(query) if query.pipeline_name == "p0" => {
                        WireMsg::PipelineDump(PipelineDump {
                            graph_representation: "digraph p0 {}".to_string(),
                        })
                    }
                    WireMsg::DumpPipeline(query) => WireMsg::Error(ErrorPayload {
                        code: "unknown_pipeline".to_string(),
                        message: format!("No active pipeline named {}", query.pipeline_name),
                    }),
                    _ => continue,
                };
                let first_request = matches!(reply, WireMsg::PipelineNames(_));
                write_envelope(&mut writer, envelope.request_id, reply).await;
                if first_request {
                    write_envelope(&mut writer, None, WireMsg::ActivePipelinesChanged).await;
                }
            }
        }

        async fn next_event(events: &mut mpsc::Receiver<AgentEvent>) -> AgentEvent {
            tokio::time::timeout(Duration::from_secs(3), events.recv())
                .await
                .expect("event timeout")
                .expect("event channel open")
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn requests_round_trip_over_socket() {
            let path = test_path("round-trip");
            let listener = UnixListener::bind(&path).expect("bind");
            let server = tokio::spawn(serve_one(listener));

            let (events_tx, mut events) = mpsc::channel(16);
            let agent = UdsPipelineAgent::spawn(client_config(&path), events_tx);
            assert_eq!(next_event(&mut events).await, AgentEvent::TargetAvailable);

            assert_eq!(
                agent.list_pipeline_names().await,
                Ok(vec!["p0".to_string(), "p1".to_string()])
            );
            assert_eq!(next_event(&mut events).await, AgentEvent::PipelinesChanged);

            let (bins, dump, missing) = tokio::join!(
                agent.list_child_bin_names("p0", ""),
                agent.dump_pipeline("p0", ""),
                agent.dump_pipeline("p9", ""),
            );
            assert_eq!(bins, Ok(vec!["p0-bin".to_string()]));
            assert_eq!(dump.as_deref(), Ok("digraph p0 {}"));
            assert_eq!(
                missing.map_err(|err| err.to_string()),
                Err("No active pipeline named p9".to_string())
            );

            server.abort();
            let _ = std::fs::remove_file(&path);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn requests_fail_fast_without_agent() {
            let path = test_path("absent");
            let (events_tx, _events) = mpsc::channel(16);
            let agent = UdsPipelineAgent::spawn(client_config(&path), events_tx);
            let result = agent.list_pipeline_names().await;
            assert_eq!(result, Err(AgentError::NotConnected));
        }
    }
}
