use crate::codec::{
    classify_close, close_code, Compression, Decompressor, InboundFrame, OutboundPayload,
    ALLOWED_BEFORE_READY,
};
use crate::config::{BackoffConfig, ManagerConfig};
use crate::context::ShardContext;
use crate::error::{Error, ErrorKind};
use crate::heartbeat::Heartbeater;
use crate::metrics::Metrics;
use crate::session::SessionInfo;
use futures_util::future::BoxFuture;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type ConnectWaiter = oneshot::Sender<Result<(), Error>>;

/// Handshake progress for one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ShardStatus {
    #[default]
    Idle,
    Connecting,
    WaitingForHello,
    Identifying,
    Resuming,
    Ready,
    Disconnected,
    Destroyed,
}

/// Options for tearing a shard down.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DestroyOptions {
    /// Keep the stored session so the next connect can resume. `false`
    /// clears it, forcing a fresh identify.
    pub preserve_session: bool,
}

impl Default for DestroyOptions {
    fn default() -> Self {
        Self {
            preserve_session: true,
        }
    }
}

/// Events a shard surfaces to the host, keyed by shard id at the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShardEvent {
    /// A fresh session reached Ready
    Ready { data: Value },
    /// An interrupted session was resumed
    Resumed { replayed: u64 },
    /// Any dispatch frame, surfaced opaquely
    Dispatch {
        event: String,
        sequence: Option<u64>,
        data: Value,
    },
    /// The connection closed with the given code
    Closed { code: u16 },
    /// A heartbeat round-trip completed
    HeartbeatComplete { latency_ms: u64 },
    /// A fatal, non-retried failure
    Error { kind: ErrorKind, message: String },
}

/// Everything a shard needs to drive its connection, snapshotted from the
/// manager config at spawn time so worker threads hold plain data.
#[derive(Debug, Clone)]
pub(crate) struct ShardOptions {
    pub token: String,
    pub intents: u64,
    pub shard_count: u16,
    pub gateway_url: String,
    pub version: String,
    pub compression: Compression,
    pub connect_timeout: Duration,
    pub hello_timeout: Duration,
    pub ready_timeout: Duration,
    pub identify_properties: crate::codec::IdentifyProperties,
    pub large_threshold: Option<u16>,
    pub max_reconnect_attempts: u32,
    pub backoff: BackoffConfig,
    pub send_limit: u32,
    pub send_window: Duration,
}

impl ShardOptions {
    pub(crate) fn from_config(config: &ManagerConfig, shard_count: u16, gateway_url: String) -> Self {
        Self {
            token: config.token.clone(),
            intents: config.intents,
            shard_count,
            gateway_url,
            version: config.version.clone(),
            compression: config.compression,
            connect_timeout: config.connect_timeout,
            hello_timeout: config.hello_timeout,
            ready_timeout: config.ready_timeout,
            identify_properties: config.identify_properties.clone(),
            large_threshold: config.large_threshold,
            max_reconnect_attempts: config.max_reconnect_attempts,
            backoff: config.backoff.clone(),
            send_limit: config.send_limit,
            send_window: config.send_window,
        }
    }
}

/// Resume is only valid while the stored session was identified under the
/// same total shard count.
pub(crate) fn can_resume(session: Option<&SessionInfo>, shard_count: u16) -> bool {
    session.is_some_and(|s| s.shard_count == shard_count)
}

/// Per-shard outbound throughput budget: a fixed quota per rolling window.
#[derive(Debug)]
struct RateLimitWindow {
    limit: u32,
    window: Duration,
    remaining: u32,
    reset_at: Instant,
}

impl RateLimitWindow {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            remaining: limit,
            reset_at: Instant::now() + window,
        }
    }

    fn refill_if_elapsed(&mut self) {
        if Instant::now() >= self.reset_at {
            self.remaining = self.limit;
            self.reset_at = Instant::now() + self.window;
        }
    }

    fn try_consume(&mut self) -> bool {
        self.refill_if_elapsed();
        if self.remaining > 0 {
            self.remaining -= 1;
            true
        } else {
            false
        }
    }

    fn reset_at(&self) -> Instant {
        self.reset_at
    }
}

/// Commands routed into the shard task.
enum ShardCommand {
    Connect(ConnectWaiter),
    Send(OutboundPayload, oneshot::Sender<Result<(), Error>>),
    Destroy(DestroyOptions, oneshot::Sender<()>),
}

/// Why an individual connection ended.
enum ConnectionEnd {
    /// destroy() was handled; the task is done
    Destroyed,
    /// Reconnect and resume the session
    Resume,
    /// Drop the session, reconnect and identify
    Reidentify,
}

/// Owning handle for one spawned shard task.
pub(crate) struct ShardHandle {
    pub id: u16,
    command_tx: mpsc::UnboundedSender<ShardCommand>,
    status_rx: watch::Receiver<ShardStatus>,
    task: JoinHandle<()>,
}

impl ShardHandle {
    pub(crate) fn spawn(
        id: u16,
        options: ShardOptions,
        context: ShardContext,
        event_tx: mpsc::UnboundedSender<(u16, ShardEvent)>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ShardStatus::Idle);
        let runner = ShardRunner {
            id,
            options,
            context,
            event_tx,
            metrics,
            command_rx,
            status_tx,
            session: None,
            connect_waiters: Vec::new(),
            send_queue: VecDeque::new(),
        };
        let task = tokio::spawn(runner.run());
        Self {
            id,
            command_tx,
            status_rx,
            task,
        }
    }

    /// Future resolving once the shard reaches Ready (fresh or resumed), or
    /// failing with the shard's fatal error. Does not borrow the handle so
    /// callers can drop locks before awaiting.
    pub(crate) fn connect_future(&self) -> BoxFuture<'static, Result<(), Error>> {
        let command_tx = self.command_tx.clone();
        let shard_id = self.id;
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            command_tx
                .send(ShardCommand::Connect(tx))
                .map_err(|_| Error::Destroyed { shard_id })?;
            rx.await.map_err(|_| Error::Destroyed { shard_id })?
        })
    }

    /// Future enqueuing an outbound payload; suspends on the rate window.
    pub(crate) fn send_future(&self, payload: OutboundPayload) -> BoxFuture<'static, Result<(), Error>> {
        let command_tx = self.command_tx.clone();
        let shard_id = self.id;
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            command_tx
                .send(ShardCommand::Send(payload, tx))
                .map_err(|_| Error::Destroyed { shard_id })?;
            rx.await.map_err(|_| Error::Destroyed { shard_id })?
        })
    }

    /// Tear the shard down and wait for its task to finish.
    pub(crate) async fn destroy(self, options: DestroyOptions) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        if self.command_tx
            .send(ShardCommand::Destroy(options, tx))
            .is_ok()
        {
            let _ = rx.await;
        }
        let _ = self.task.await;
        Ok(())
    }

    pub(crate) fn status(&self) -> ShardStatus {
        *self.status_rx.borrow()
    }
}

struct ShardRunner {
    id: u16,
    options: ShardOptions,
    context: ShardContext,
    event_tx: mpsc::UnboundedSender<(u16, ShardEvent)>,
    metrics: Arc<Metrics>,
    command_rx: mpsc::UnboundedReceiver<ShardCommand>,
    status_tx: watch::Sender<ShardStatus>,
    /// Local copy of the stored session; the store stays authoritative
    session: Option<SessionInfo>,
    connect_waiters: Vec<ConnectWaiter>,
    /// Sends accepted but not yet written, in caller order
    send_queue: VecDeque<(OutboundPayload, oneshot::Sender<Result<(), Error>>)>,
}

impl ShardRunner {
    async fn run(mut self) {
        // Idle until the first connect
        loop {
            match self.command_rx.recv().await {
                Some(ShardCommand::Connect(waiter)) => {
                    self.connect_waiters.push(waiter);
                    break;
                }
                Some(ShardCommand::Send(payload, responder)) => {
                    let _ = responder.send(Err(Error::NotReady {
                        shard_id: self.id,
                        op: payload.op,
                    }));
                }
                Some(ShardCommand::Destroy(_, ack)) => {
                    self.set_status(ShardStatus::Destroyed);
                    let _ = ack.send(());
                    return;
                }
                None => return,
            }
        }

        if let Err(error) = self.run_lifecycle().await {
            warn!(shard_id = self.id, %error, "shard failed fatally");
            self.metrics.record_error();
            self.set_status(ShardStatus::Destroyed);
            self.emit(ShardEvent::Error {
                kind: error.kind(),
                message: error.to_string(),
            });
            let mirrored = (error.kind(), error.to_string());
            for waiter in self.connect_waiters.drain(..) {
                let _ = waiter.send(Err(Error::from_reported(mirrored.0, mirrored.1.clone())));
            }
        }
    }

    /// Reconnect loop: retries resumable failures with capped backoff and
    /// stops on destroy, fatal close codes, or budget exhaustion.
    async fn run_lifecycle(&mut self) -> Result<(), Error> {
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                if attempt > self.options.max_reconnect_attempts {
                    return Err(Error::ReconnectBudgetExhausted {
                        shard_id: self.id,
                        attempts: attempt - 1,
                    });
                }
                let delay = self.options.backoff.delay_for_attempt(attempt - 1);
                debug!(
                    shard_id = self.id,
                    delay_ms = delay.as_millis() as u64,
                    attempt,
                    "reconnecting after backoff"
                );
                if self.backoff_sleep(delay).await {
                    return Ok(());
                }
                self.metrics.record_reconnection();
            }

            self.session = self.context.retrieve_session(self.id).await;

            let mut reached_ready = false;
            let end = self.connect_once(&mut reached_ready).await;

            // Whatever interrupted the connection also interrupted anything
            // still parked on the rate window
            for (_, responder) in self.send_queue.drain(..) {
                let _ = responder.send(Err(Error::ChannelSend(
                    "connection interrupted before payload was sent".to_string(),
                )));
            }

            match end {
                Ok(ConnectionEnd::Destroyed) => return Ok(()),
                Ok(ConnectionEnd::Resume) => {
                    self.set_status(ShardStatus::Disconnected);
                }
                Ok(ConnectionEnd::Reidentify) => {
                    self.session = None;
                    self.context.update_session(self.id, None).await;
                    self.set_status(ShardStatus::Disconnected);
                }
                Err(error) => match error.kind() {
                    ErrorKind::WebSocket | ErrorKind::Timeout => {
                        debug!(shard_id = self.id, %error, "retryable connection failure");
                        self.set_status(ShardStatus::Disconnected);
                    }
                    _ => return Err(error),
                },
            }

            attempt = if reached_ready { 1 } else { attempt + 1 };
        }
    }

    /// Sleep out the backoff while staying responsive to commands.
    /// Returns `true` when a destroy ended the task.
    async fn backoff_sleep(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return false,
                cmd = self.command_rx.recv() => match cmd {
                    Some(ShardCommand::Connect(waiter)) => self.connect_waiters.push(waiter),
                    Some(ShardCommand::Send(payload, responder)) => {
                        let _ = responder.send(Err(Error::NotReady {
                            shard_id: self.id,
                            op: payload.op,
                        }));
                    }
                    Some(ShardCommand::Destroy(options, ack)) => {
                        self.finish_destroy(None, options).await;
                        let _ = ack.send(());
                        return true;
                    }
                    None => return true,
                },
            }
        }
    }

    /// Drive one connection from dial to disconnect.
    async fn connect_once(&mut self, reached_ready: &mut bool) -> Result<ConnectionEnd, Error> {
        self.set_status(ShardStatus::Connecting);

        let url = self.connection_url()?;
        debug!(shard_id = self.id, %url, "connecting");

        let dial = timeout(self.options.connect_timeout, connect_async(url.as_str()));
        let (stream, _response) = match dial.await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => return Err(Error::WebSocket(e)),
            Err(_) => {
                return Err(Error::Timeout {
                    phase: "connect",
                    waited_ms: self.options.connect_timeout.as_millis() as u64,
                })
            }
        };
        self.metrics.record_connection();
        self.metrics.update_shard(self.id, |s| {
            s.last_connected_at = Some(std::time::Instant::now());
        });
        info!(shard_id = self.id, "connected");

        let (mut sink, mut source) = stream.split();
        let mut decompressor = Decompressor::new(self.options.compression);
        let mut heartbeater: Option<Heartbeater> = None;
        let mut rate = RateLimitWindow::new(self.options.send_limit, self.options.send_window);
        let mut identify_wait: Option<BoxFuture<'static, Result<(), Error>>> = None;
        let mut replayed: u64 = 0;

        self.set_status(ShardStatus::WaitingForHello);
        let mut phase_deadline: Option<(Instant, &'static str)> =
            Some((Instant::now() + self.options.hello_timeout, "hello"));

        loop {
            let status = *self.status_tx.borrow();
            let beat_at = heartbeater.as_ref().map(|h| h.next_beat_at());
            let queue_parked = !self.send_queue.is_empty();

            tokio::select! {
                biased;

                cmd = self.command_rx.recv() => match cmd {
                    Some(ShardCommand::Connect(waiter)) => {
                        if status == ShardStatus::Ready {
                            let _ = waiter.send(Ok(()));
                        } else {
                            self.connect_waiters.push(waiter);
                        }
                    }
                    Some(ShardCommand::Send(payload, responder)) => {
                        if status != ShardStatus::Ready
                            && !ALLOWED_BEFORE_READY.contains(&payload.op)
                        {
                            let _ = responder.send(Err(Error::NotReady {
                                shard_id: self.id,
                                op: payload.op,
                            }));
                        } else {
                            self.send_queue.push_back((payload, responder));
                            self.flush_send_queue(&mut sink, &mut rate).await?;
                        }
                    }
                    Some(ShardCommand::Destroy(options, ack)) => {
                        self.finish_destroy(Some(&mut sink), options).await;
                        let _ = ack.send(());
                        return Ok(ConnectionEnd::Destroyed);
                    }
                    None => {
                        // Handle dropped: treat like a silent destroy
                        self.finish_destroy(Some(&mut sink), DestroyOptions::default()).await;
                        return Ok(ConnectionEnd::Destroyed);
                    }
                },

                admitted = async { identify_wait.as_mut().expect("guarded").await },
                    if identify_wait.is_some() =>
                {
                    identify_wait = None;
                    admitted?;
                    debug!(shard_id = self.id, "identify admitted, identifying");
                    let payload = OutboundPayload::identify(
                        &self.options.token,
                        self.options.intents,
                        self.id,
                        self.options.shard_count,
                        &self.options.identify_properties,
                        self.options.compression == Compression::Payload,
                        self.options.large_threshold,
                    );
                    self.write_control(&mut sink, &mut rate, payload).await?;
                    self.metrics.record_identify();
                    phase_deadline =
                        Some((Instant::now() + self.options.ready_timeout, "ready"));
                }

                message = source.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Err(Error::WebSocket(e)),
                        None => {
                            info!(shard_id = self.id, "gateway stream ended");
                            return Ok(ConnectionEnd::Resume);
                        }
                    };

                    let frame = match message {
                        Message::Text(text) => {
                            self.metrics.record_message_received();
                            decompressor.feed_text(&text)?
                        }
                        Message::Binary(bytes) => {
                            self.metrics.record_message_received();
                            decompressor.feed_binary(&bytes)?
                        }
                        Message::Ping(data) => {
                            sink.send(Message::Pong(data)).await?;
                            None
                        }
                        Message::Pong(_) | Message::Frame(_) => None,
                        Message::Close(frame) => {
                            let code = frame.map_or(1000, |f| u16::from(f.code));
                            info!(shard_id = self.id, code, "gateway closed the connection");
                            self.emit(ShardEvent::Closed { code });
                            return match classify_close(code) {
                                crate::codec::CloseBehavior::Resume => Ok(ConnectionEnd::Resume),
                                crate::codec::CloseBehavior::Reidentify => {
                                    Ok(ConnectionEnd::Reidentify)
                                }
                                crate::codec::CloseBehavior::Fatal => {
                                    Err(Error::Authentication { code })
                                }
                            };
                        }
                    };

                    if let Some(frame) = frame {
                        if let Some(end) = self
                            .handle_frame(
                                frame,
                                &mut sink,
                                &mut rate,
                                &mut heartbeater,
                                &mut identify_wait,
                                &mut phase_deadline,
                                &mut replayed,
                                reached_ready,
                            )
                            .await?
                        {
                            return Ok(end);
                        }
                    }
                }

                _ = async { sleep_until(beat_at.expect("guarded")).await },
                    if beat_at.is_some() =>
                {
                    let beater = heartbeater.as_mut().expect("guarded");
                    if beater.is_zombie() {
                        warn!(shard_id = self.id, "no heartbeat ack within one interval, zombie connection");
                        self.metrics.record_zombie_disconnect();
                        self.close_connection(&mut sink, close_code::RESUMING).await;
                        return Ok(ConnectionEnd::Resume);
                    }
                    let sequence = self.session.as_ref().map(|s| s.sequence);
                    self.write_control(&mut sink, &mut rate, OutboundPayload::heartbeat(sequence))
                        .await?;
                    beater.record_beat();
                    trace!(shard_id = self.id, "heartbeat sent");
                }

                _ = async { sleep_until(phase_deadline.expect("guarded").0).await },
                    if phase_deadline.is_some() =>
                {
                    let (_, phase) = phase_deadline.take().expect("guarded");
                    return Err(Error::Timeout {
                        phase,
                        waited_ms: match phase {
                            "hello" => self.options.hello_timeout.as_millis() as u64,
                            _ => self.options.ready_timeout.as_millis() as u64,
                        },
                    });
                }

                _ = async { sleep_until(rate.reset_at()).await }, if queue_parked => {
                    self.flush_send_queue(&mut sink, &mut rate).await?;
                }
            }
        }
    }

    /// Dispatch one decoded frame. Returns `Some` when the connection must
    /// end.
    #[allow(clippy::too_many_arguments)]
    async fn handle_frame(
        &mut self,
        frame: InboundFrame,
        sink: &mut WsSink,
        rate: &mut RateLimitWindow,
        heartbeater: &mut Option<Heartbeater>,
        identify_wait: &mut Option<BoxFuture<'static, Result<(), Error>>>,
        phase_deadline: &mut Option<(Instant, &'static str)>,
        replayed: &mut u64,
        reached_ready: &mut bool,
    ) -> Result<Option<ConnectionEnd>, Error> {
        match frame {
            InboundFrame::Hello {
                heartbeat_interval_ms,
            } => {
                debug!(
                    shard_id = self.id,
                    heartbeat_interval_ms, "hello received, heartbeating"
                );
                *heartbeater = Some(Heartbeater::new(heartbeat_interval_ms));
                *phase_deadline = None;

                let resumable = self
                    .session
                    .clone()
                    .filter(|s| s.shard_count == self.options.shard_count);
                if let Some(session) = resumable {
                    debug!(
                        shard_id = self.id,
                        sequence = session.sequence,
                        "resuming session"
                    );
                    self.set_status(ShardStatus::Resuming);
                    *replayed = 0;
                    let payload = OutboundPayload::resume(
                        &self.options.token,
                        &session.session_id,
                        session.sequence,
                    );
                    self.write_control(sink, rate, payload).await?;
                    *phase_deadline = Some((Instant::now() + self.options.ready_timeout, "ready"));
                } else {
                    if self.session.is_some() {
                        debug!(
                            shard_id = self.id,
                            "stored session has a different shard count, identifying fresh"
                        );
                    }
                    self.set_status(ShardStatus::Identifying);
                    // Admission can take several cooldown rounds; no
                    // deadline until the identify is actually sent
                    *identify_wait = Some(self.context.wait_for_identify(self.id));
                }
            }

            InboundFrame::Dispatch {
                event,
                sequence,
                data,
            } => {
                let status = *self.status_tx.borrow();
                if status == ShardStatus::Resuming {
                    *replayed += 1;
                }

                match event.as_str() {
                    "READY" => {
                        let session_id = data
                            .get("session_id")
                            .and_then(Value::as_str)
                            .ok_or_else(|| {
                                Error::Protocol("READY dispatch without session_id".into())
                            })?
                            .to_string();
                        let resume_url = data
                            .get("resume_gateway_url")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        let session = SessionInfo {
                            session_id,
                            sequence: sequence.unwrap_or_default(),
                            shard_id: self.id,
                            shard_count: self.options.shard_count,
                            resume_url,
                        };
                        self.session = Some(session.clone());
                        self.context.update_session(self.id, Some(session)).await;
                        self.become_ready(reached_ready);
                        info!(shard_id = self.id, "shard ready");
                        self.emit(ShardEvent::Ready { data: data.clone() });
                        *phase_deadline = None;
                    }
                    "RESUMED" => {
                        self.become_ready(reached_ready);
                        self.metrics.record_resume();
                        info!(shard_id = self.id, replayed = *replayed, "session resumed");
                        self.emit(ShardEvent::Resumed { replayed: *replayed });
                        *phase_deadline = None;
                    }
                    _ => {}
                }

                if let (Some(sequence), Some(session)) = (sequence, self.session.as_mut()) {
                    if sequence > session.sequence {
                        session.sequence = sequence;
                        let updated = session.clone();
                        self.context.update_session(self.id, Some(updated)).await;
                    }
                }

                self.emit(ShardEvent::Dispatch {
                    event,
                    sequence,
                    data,
                });
            }

            InboundFrame::HeartbeatRequest => {
                let sequence = self.session.as_ref().map(|s| s.sequence);
                self.write_control(sink, rate, OutboundPayload::heartbeat(sequence))
                    .await?;
                if let Some(beater) = heartbeater.as_mut() {
                    beater.record_beat();
                }
            }

            InboundFrame::HeartbeatAck => {
                if let Some(beater) = heartbeater.as_mut() {
                    if let Some(latency) = beater.record_ack() {
                        let latency_ms = latency.as_millis() as u64;
                        self.metrics
                            .update_shard(self.id, |s| s.latency_ms = Some(latency_ms));
                        self.emit(ShardEvent::HeartbeatComplete { latency_ms });
                    }
                }
            }

            InboundFrame::Reconnect => {
                info!(shard_id = self.id, "gateway requested reconnect");
                self.close_connection(sink, close_code::RESUMING).await;
                return Ok(Some(ConnectionEnd::Resume));
            }

            InboundFrame::InvalidSession { resumable } => {
                debug!(shard_id = self.id, resumable, "session invalidated");
                let session = self
                    .session
                    .clone()
                    .filter(|s| resumable && s.shard_count == self.options.shard_count);
                if let Some(session) = session {
                    self.set_status(ShardStatus::Resuming);
                    *replayed = 0;
                    let payload = OutboundPayload::resume(
                        &self.options.token,
                        &session.session_id,
                        session.sequence,
                    );
                    self.write_control(sink, rate, payload).await?;
                    *phase_deadline = Some((Instant::now() + self.options.ready_timeout, "ready"));
                } else {
                    self.close_connection(sink, close_code::NORMAL).await;
                    return Ok(Some(ConnectionEnd::Reidentify));
                }
            }
        }

        Ok(None)
    }

    fn become_ready(&mut self, reached_ready: &mut bool) {
        *reached_ready = true;
        self.set_status(ShardStatus::Ready);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Write a control payload (heartbeat/identify/resume) immediately.
    /// Control frames consume send budget when available but are never
    /// parked behind it; the handshake and liveness cannot wait a window.
    async fn write_control(
        &self,
        sink: &mut WsSink,
        rate: &mut RateLimitWindow,
        payload: OutboundPayload,
    ) -> Result<(), Error> {
        let _ = rate.try_consume();
        sink.send(Message::Text(payload.encode())).await?;
        self.metrics.record_message_sent();
        Ok(())
    }

    /// Drain queued sends while the window has budget.
    async fn flush_send_queue(
        &mut self,
        sink: &mut WsSink,
        rate: &mut RateLimitWindow,
    ) -> Result<(), Error> {
        while let Some((payload, responder)) = self.send_queue.pop_front() {
            if !rate.try_consume() {
                self.send_queue.push_front((payload, responder));
                self.metrics.record_rate_limit_stall();
                debug!(
                    shard_id = self.id,
                    queued = self.send_queue.len(),
                    "send window exhausted, parking queue"
                );
                break;
            }
            sink.send(Message::Text(payload.encode())).await?;
            self.metrics.record_message_sent();
            let _ = responder.send(Ok(()));
        }
        Ok(())
    }

    async fn close_connection(&self, sink: &mut WsSink, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
    }

    /// Common teardown for destroy(): close the transport, optionally clear
    /// the session, reject in-flight waiters.
    async fn finish_destroy(&mut self, sink: Option<&mut WsSink>, options: DestroyOptions) {
        info!(
            shard_id = self.id,
            preserve_session = options.preserve_session,
            "destroying shard"
        );
        if let Some(sink) = sink {
            let code = if options.preserve_session {
                close_code::RESUMING
            } else {
                close_code::NORMAL
            };
            self.close_connection(sink, code).await;
        }
        if !options.preserve_session {
            self.session = None;
            self.context.update_session(self.id, None).await;
        }
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(Error::Destroyed { shard_id: self.id }));
        }
        for (_, responder) in self.send_queue.drain(..) {
            let _ = responder.send(Err(Error::Destroyed { shard_id: self.id }));
        }
        self.set_status(ShardStatus::Destroyed);
    }

    fn connection_url(&self) -> Result<Url, Error> {
        let base = self
            .session
            .as_ref()
            .filter(|s| can_resume(Some(s), self.options.shard_count))
            .and_then(|s| s.resume_url.as_deref())
            .unwrap_or(&self.options.gateway_url);
        let mut url = Url::parse(base)
            .map_err(|e| Error::Protocol(format!("invalid gateway url {base}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("v", &self.options.version)
            .append_pair("encoding", "json");
        if self.options.compression == Compression::Stream {
            url.query_pairs_mut()
                .append_pair("compress", "zlib-stream");
        }
        Ok(url)
    }

    fn set_status(&self, status: ShardStatus) {
        self.status_tx.send_replace(status);
        self.metrics.update_shard(self.id, |s| s.status = status);
    }

    fn emit(&self, event: ShardEvent) {
        let _ = self.event_tx.send((self.id, event));
    }
}
