use crate::codec::OutboundPayload;
use crate::context::ShardContext;
use crate::error::{Error, ErrorKind};
use crate::metrics::Metrics;
use crate::session::{SessionCallbacks, SessionInfo};
use crate::shard::{DestroyOptions, ShardEvent, ShardHandle, ShardOptions, ShardStatus};
use crate::strategy::{partition_ids, StrategyResources};
use crate::throttle::IdentifyThrottle;
use futures_util::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// How long the coordinator waits for a worker's reply to a
/// request-shaped envelope before treating the worker as unresponsive.
const STATUS_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Envelopes the coordinator sends to a worker.
///
/// `Connect`/`Destroy`/`Send` are fire-and-forget, correlated by shard id;
/// the `nonce`-carrying variants answer (or pose) request-shaped ops and
/// echo the requester's nonce verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum HostMessage {
    Connect { shard_id: u16 },
    Destroy { shard_id: u16, options: DestroyOptions },
    Send { shard_id: u16, payload: OutboundPayload },
    FetchStatus { nonce: u64 },
    SessionInfoResponse { nonce: u64, session: Option<SessionInfo> },
    IdentifyAdmission { nonce: u64 },
    Terminate,
}

/// Envelopes a worker sends to the coordinator.
///
/// Session persistence and the identify throttle live only in the
/// coordinating context, so workers round-trip those through
/// `RetrieveSessionInfo`/`UpdateSessionInfo`/`WaitForIdentify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum WorkerMessage {
    WorkerReady,
    Connected {
        shard_id: u16,
        result: Result<(), (ErrorKind, String)>,
    },
    Destroyed { shard_id: u16 },
    Event { shard_id: u16, event: ShardEvent },
    RetrieveSessionInfo { nonce: u64, shard_id: u16 },
    UpdateSessionInfo { shard_id: u16, session: Option<SessionInfo> },
    WaitForIdentify { nonce: u64, shard_id: u16 },
    FetchStatusResponse {
        nonce: u64,
        statuses: Vec<(u16, ShardStatus)>,
    },
}

/// Nonce-keyed table of pending request/response calls.
///
/// Nonces increase monotonically per table; a reply resolves its entry
/// exactly once and duplicate replies are ignored.
pub(crate) struct PendingTable<T> {
    next_nonce: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<T>>>,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self {
            next_nonce: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> PendingTable<T> {
    pub(crate) fn register(&self) -> (u64, oneshot::Receiver<T>) {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(nonce, tx);
        (nonce, rx)
    }

    /// Resolve the entry for `nonce`. Returns `false` for an unknown or
    /// already-consumed nonce.
    pub(crate) fn resolve(&self, nonce: u64, value: T) -> bool {
        match self.pending.lock().remove(&nonce) {
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }
}

/// Worker-side access to coordinator-owned state, one per worker.
///
/// Cloning is cheap; every shard in the worker shares the same pending
/// tables and outbound channel.
#[derive(Clone)]
pub(crate) struct RemoteContext {
    to_coordinator: mpsc::UnboundedSender<WorkerMessage>,
    sessions: Arc<PendingTable<Option<SessionInfo>>>,
    admissions: Arc<PendingTable<()>>,
}

impl RemoteContext {
    fn new(to_coordinator: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self {
            to_coordinator,
            sessions: Arc::default(),
            admissions: Arc::default(),
        }
    }

    pub(crate) async fn retrieve_session(&self, shard_id: u16) -> Option<SessionInfo> {
        let (nonce, rx) = self.sessions.register();
        if self
            .to_coordinator
            .send(WorkerMessage::RetrieveSessionInfo { nonce, shard_id })
            .is_err()
        {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    pub(crate) fn update_session(&self, shard_id: u16, session: Option<SessionInfo>) {
        let _ = self
            .to_coordinator
            .send(WorkerMessage::UpdateSessionInfo { shard_id, session });
    }

    pub(crate) fn wait_for_identify(&self, shard_id: u16) -> BoxFuture<'static, Result<(), Error>> {
        let (nonce, rx) = self.admissions.register();
        let sent = self
            .to_coordinator
            .send(WorkerMessage::WaitForIdentify { nonce, shard_id });
        Box::pin(async move {
            sent.map_err(|_| Error::Worker("coordinator channel closed".to_string()))?;
            rx.await
                .map_err(|_| Error::Worker("coordinator channel closed".to_string()))
        })
    }

    fn resolve_session(&self, nonce: u64, session: Option<SessionInfo>) {
        if !self.sessions.resolve(nonce, session) {
            debug!(nonce, "ignoring duplicate session info response");
        }
    }

    fn resolve_admission(&self, nonce: u64) {
        if !self.admissions.resolve(nonce, ()) {
            debug!(nonce, "ignoring duplicate identify admission");
        }
    }
}

/// Requests the coordinator has issued and not yet seen answered.
#[derive(Default)]
struct CoordinatorPending {
    connects: Mutex<HashMap<u16, oneshot::Sender<Result<(), Error>>>>,
    destroys: Mutex<HashMap<u16, oneshot::Sender<()>>>,
    status: PendingTable<Vec<(u16, ShardStatus)>>,
}

struct Worker {
    ids: Vec<u16>,
    host_tx: mpsc::UnboundedSender<HostMessage>,
    thread: std::thread::JoinHandle<()>,
    router: tokio::task::JoinHandle<()>,
}

/// Shards partitioned across dedicated worker threads, coordinated purely
/// through `HostMessage`/`WorkerMessage` envelopes.
pub(crate) struct WorkerStrategy {
    workers: Vec<Worker>,
    pending: Arc<CoordinatorPending>,
    shutting_down: Arc<AtomicBool>,
}

impl WorkerStrategy {
    pub(crate) fn spawn(
        ids: &[u16],
        shards_per_worker: Option<usize>,
        resources: &StrategyResources,
    ) -> Self {
        let options = ShardOptions::from_config(
            &resources.config,
            resources.shard_count,
            resources.gateway_url.clone(),
        );
        let pending: Arc<CoordinatorPending> = Arc::default();
        let shutting_down = Arc::new(AtomicBool::new(false));
        let groups = partition_ids(ids, shards_per_worker);
        info!(
            shards = ids.len(),
            workers = groups.len(),
            "spawning worker shards"
        );

        let mut workers = Vec::with_capacity(groups.len());
        for (index, group) in groups.into_iter().enumerate() {
            let (host_tx, host_rx) = mpsc::unbounded_channel::<HostMessage>();
            let (worker_tx, worker_rx) = mpsc::unbounded_channel::<WorkerMessage>();

            let thread = {
                let thread_ids = group.clone();
                let options = options.clone();
                let builder =
                    std::thread::Builder::new().name(format!("gateway-worker-{index}"));
                match builder
                    .spawn(move || worker_thread_main(thread_ids, options, host_rx, worker_tx))
                {
                    Ok(thread) => thread,
                    Err(e) => {
                        error!(worker = index, error = %e, "failed to spawn worker thread");
                        for &shard_id in &group {
                            let _ = resources.event_tx.send((
                                shard_id,
                                ShardEvent::Error {
                                    kind: ErrorKind::Worker,
                                    message: format!("worker thread failed to spawn: {e}"),
                                },
                            ));
                        }
                        continue;
                    }
                }
            };

            let router = tokio::spawn(route_worker_messages(
                index,
                group.clone(),
                worker_rx,
                host_tx.clone(),
                resources.config.session.clone(),
                resources.throttle.clone(),
                resources.event_tx.clone(),
                pending.clone(),
                shutting_down.clone(),
            ));

            workers.push(Worker {
                ids: group,
                host_tx,
                thread,
                router,
            });
        }

        Self {
            workers,
            pending,
            shutting_down,
        }
    }

    pub(crate) fn connect_future(&self) -> BoxFuture<'static, Result<(), Error>> {
        let mut waiters = Vec::new();
        for worker in &self.workers {
            for &shard_id in &worker.ids {
                let (tx, rx) = oneshot::channel();
                self.pending.connects.lock().insert(shard_id, tx);
                if worker
                    .host_tx
                    .send(HostMessage::Connect { shard_id })
                    .is_err()
                {
                    if let Some(tx) = self.pending.connects.lock().remove(&shard_id) {
                        let _ = tx.send(Err(Error::Worker(
                            "worker channel closed before connect".to_string(),
                        )));
                    }
                }
                waiters.push(rx);
            }
        }
        Box::pin(async move {
            let mut first_error = None;
            for result in join_all(waiters).await {
                let result = result
                    .unwrap_or_else(|_| Err(Error::Worker("worker terminated".to_string())));
                if let Err(error) = result {
                    first_error.get_or_insert(error);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
    }

    pub(crate) async fn destroy(self, options: DestroyOptions) -> Result<(), Error> {
        self.shutting_down.store(true, Ordering::SeqCst);

        let mut waiters = Vec::new();
        for worker in &self.workers {
            for &shard_id in &worker.ids {
                let (tx, rx) = oneshot::channel();
                self.pending.destroys.lock().insert(shard_id, tx);
                if worker
                    .host_tx
                    .send(HostMessage::Destroy { shard_id, options })
                    .is_err()
                {
                    // Worker already gone; nothing will ack
                    if let Some(tx) = self.pending.destroys.lock().remove(&shard_id) {
                        let _ = tx.send(());
                    }
                }
                waiters.push(rx);
            }
        }
        // Destroyed acks; a dropped sender means the worker is already gone
        for waiter in waiters {
            let _ = waiter.await;
        }

        for worker in &self.workers {
            let _ = worker.host_tx.send(HostMessage::Terminate);
        }

        // No execution context is left orphaned: routers drain, threads join
        for worker in self.workers {
            let _ = worker.router.await;
            let thread = worker.thread;
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
        Ok(())
    }

    pub(crate) fn send_future(
        &self,
        shard_id: u16,
        payload: OutboundPayload,
    ) -> BoxFuture<'static, Result<(), Error>> {
        let worker = self
            .workers
            .iter()
            .find(|worker| worker.ids.contains(&shard_id));
        let result = match worker {
            // Fire-and-forget across the boundary; send failures surface
            // as shard-keyed error events from the worker
            Some(worker) => worker
                .host_tx
                .send(HostMessage::Send { shard_id, payload })
                .map_err(|_| Error::Worker("worker channel closed".to_string())),
            None => Err(Error::UnknownShard(shard_id)),
        };
        Box::pin(async move { result })
    }

    pub(crate) fn fetch_status_future(
        &self,
    ) -> BoxFuture<'static, Result<HashMap<u16, ShardStatus>, Error>> {
        let mut waiters = Vec::new();
        for worker in &self.workers {
            let (nonce, rx) = self.pending.status.register();
            if worker
                .host_tx
                .send(HostMessage::FetchStatus { nonce })
                .is_ok()
            {
                waiters.push(rx);
            }
        }
        Box::pin(async move {
            let mut statuses = HashMap::new();
            for waiter in waiters {
                let worker_statuses =
                    match tokio::time::timeout(STATUS_REPLY_TIMEOUT, waiter).await {
                        Ok(Ok(worker_statuses)) => worker_statuses,
                        Ok(Err(_)) => {
                            return Err(Error::Worker("worker terminated".to_string()))
                        }
                        Err(_) => {
                            return Err(Error::Worker(
                                "timed out waiting for a status reply".to_string(),
                            ))
                        }
                    };
                statuses.extend(worker_statuses);
            }
            Ok(statuses)
        })
    }
}

/// Coordinator-side pump for one worker's outbound envelopes.
///
/// Session and throttle requests are answered here, against the single
/// coordinator-owned instances. Retrieve/update calls run inline so the
/// per-worker FIFO makes an update visible to every later retrieve;
/// identify admissions can wait several cooldown rounds and are answered
/// from spawned tasks instead.
#[allow(clippy::too_many_arguments)]
async fn route_worker_messages(
    worker_index: usize,
    ids: Vec<u16>,
    mut worker_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    host_tx: mpsc::UnboundedSender<HostMessage>,
    session: SessionCallbacks,
    throttle: Arc<IdentifyThrottle>,
    event_tx: mpsc::UnboundedSender<(u16, ShardEvent)>,
    pending: Arc<CoordinatorPending>,
    shutting_down: Arc<AtomicBool>,
) {
    while let Some(message) = worker_rx.recv().await {
        match message {
            WorkerMessage::WorkerReady => {
                debug!(worker = worker_index, "worker ready");
            }
            WorkerMessage::Connected { shard_id, result } => {
                if let Some(tx) = pending.connects.lock().remove(&shard_id) {
                    let _ = tx.send(
                        result.map_err(|(kind, message)| Error::from_reported(kind, message)),
                    );
                }
            }
            WorkerMessage::Destroyed { shard_id } => {
                if let Some(tx) = pending.destroys.lock().remove(&shard_id) {
                    let _ = tx.send(());
                }
            }
            WorkerMessage::Event { shard_id, event } => {
                let _ = event_tx.send((shard_id, event));
            }
            WorkerMessage::RetrieveSessionInfo { nonce, shard_id } => {
                let info = (session.retrieve)(shard_id).await;
                let _ = host_tx.send(HostMessage::SessionInfoResponse {
                    nonce,
                    session: info,
                });
            }
            WorkerMessage::UpdateSessionInfo { shard_id, session: info } => {
                (session.update)(shard_id, info).await;
            }
            WorkerMessage::WaitForIdentify { nonce, shard_id } => {
                let throttle = throttle.clone();
                let host_tx = host_tx.clone();
                tokio::spawn(async move {
                    throttle.wait_for_identify(shard_id).await;
                    let _ = host_tx.send(HostMessage::IdentifyAdmission { nonce });
                });
            }
            WorkerMessage::FetchStatusResponse { nonce, statuses } => {
                if !pending.status.resolve(nonce, statuses) {
                    debug!(nonce, "ignoring duplicate status response");
                }
            }
        }
    }

    // Channel gone. Whatever is still pending for this worker's ids will
    // never be answered; during shutdown that is the normal end, otherwise
    // the worker died and only its shard ids are affected.
    let dirty_shutdown = !shutting_down.load(Ordering::SeqCst);
    for &shard_id in &ids {
        if let Some(tx) = pending.connects.lock().remove(&shard_id) {
            let _ = tx.send(Err(Error::Worker("worker terminated".to_string())));
        }
        if let Some(tx) = pending.destroys.lock().remove(&shard_id) {
            let _ = tx.send(());
        }
        if dirty_shutdown {
            let _ = event_tx.send((
                shard_id,
                ShardEvent::Error {
                    kind: ErrorKind::Worker,
                    message: "worker terminated unexpectedly".to_string(),
                },
            ));
        }
    }
    if dirty_shutdown {
        warn!(worker = worker_index, "worker channel closed unexpectedly");
    }
}

/// Entry point of a worker thread: builds its own single-threaded runtime
/// and drives the shards it owns until told to terminate.
fn worker_thread_main(
    ids: Vec<u16>,
    options: ShardOptions,
    host_rx: mpsc::UnboundedReceiver<HostMessage>,
    to_coordinator: mpsc::UnboundedSender<WorkerMessage>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "worker runtime failed to start");
            for &shard_id in &ids {
                let _ = to_coordinator.send(WorkerMessage::Event {
                    shard_id,
                    event: ShardEvent::Error {
                        kind: ErrorKind::Worker,
                        message: format!("worker runtime failed to start: {e}"),
                    },
                });
            }
            return;
        }
    };

    runtime.block_on(worker_main(ids, options, host_rx, to_coordinator));
}

async fn worker_main(
    ids: Vec<u16>,
    options: ShardOptions,
    mut host_rx: mpsc::UnboundedReceiver<HostMessage>,
    to_coordinator: mpsc::UnboundedSender<WorkerMessage>,
) {
    let remote = RemoteContext::new(to_coordinator.clone());
    let metrics = Arc::new(Metrics::new());

    // Shard events flow out as envelopes with the shard id attached
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<(u16, ShardEvent)>();
    let forward_tx = to_coordinator.clone();
    tokio::spawn(async move {
        while let Some((shard_id, event)) = event_rx.recv().await {
            if forward_tx
                .send(WorkerMessage::Event { shard_id, event })
                .is_err()
            {
                break;
            }
        }
    });

    let mut shards: HashMap<u16, ShardHandle> = ids
        .iter()
        .map(|&id| {
            let handle = ShardHandle::spawn(
                id,
                options.clone(),
                ShardContext::Remote(remote.clone()),
                event_tx.clone(),
                metrics.clone(),
            );
            (id, handle)
        })
        .collect();

    let _ = to_coordinator.send(WorkerMessage::WorkerReady);

    while let Some(message) = host_rx.recv().await {
        match message {
            HostMessage::Connect { shard_id } => {
                let result_tx = to_coordinator.clone();
                match shards.get(&shard_id) {
                    Some(shard) => {
                        let connect = shard.connect_future();
                        tokio::spawn(async move {
                            let result = connect
                                .await
                                .map_err(|e| (e.kind(), e.to_string()));
                            let _ = result_tx.send(WorkerMessage::Connected { shard_id, result });
                        });
                    }
                    None => {
                        let _ = result_tx.send(WorkerMessage::Connected {
                            shard_id,
                            result: Err((
                                ErrorKind::Other,
                                format!("unknown shard id {shard_id}"),
                            )),
                        });
                    }
                }
            }
            HostMessage::Destroy { shard_id, options } => {
                if let Some(shard) = shards.remove(&shard_id) {
                    let result_tx = to_coordinator.clone();
                    tokio::spawn(async move {
                        let _ = shard.destroy(options).await;
                        let _ = result_tx.send(WorkerMessage::Destroyed { shard_id });
                    });
                } else {
                    let _ = to_coordinator.send(WorkerMessage::Destroyed { shard_id });
                }
            }
            HostMessage::Send { shard_id, payload } => match shards.get(&shard_id) {
                Some(shard) => {
                    let send = shard.send_future(payload);
                    let event_tx = to_coordinator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = send.await {
                            let _ = event_tx.send(WorkerMessage::Event {
                                shard_id,
                                event: ShardEvent::Error {
                                    kind: e.kind(),
                                    message: e.to_string(),
                                },
                            });
                        }
                    });
                }
                None => {
                    let _ = to_coordinator.send(WorkerMessage::Event {
                        shard_id,
                        event: ShardEvent::Error {
                            kind: ErrorKind::Other,
                            message: format!("send to unknown shard id {shard_id}"),
                        },
                    });
                }
            },
            HostMessage::FetchStatus { nonce } => {
                let statuses = shards
                    .iter()
                    .map(|(&id, handle)| (id, handle.status()))
                    .collect();
                let _ = to_coordinator.send(WorkerMessage::FetchStatusResponse { nonce, statuses });
            }
            HostMessage::SessionInfoResponse { nonce, session } => {
                remote.resolve_session(nonce, session);
            }
            HostMessage::IdentifyAdmission { nonce } => {
                remote.resolve_admission(nonce);
            }
            HostMessage::Terminate => {
                debug!("worker terminating");
                break;
            }
        }
    }

    // Coordinator hung up or told us to stop: tear down what is left
    let remaining: Vec<_> = shards.drain().map(|(_, handle)| handle).collect();
    join_all(
        remaining
            .into_iter()
            .map(|handle| handle.destroy(DestroyOptions::default())),
    )
    .await;
}
