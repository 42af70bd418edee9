//! The controller daemon.
//!
//! Owns outbound connections to the configured workers and a listener for
//! initiators. Each build request gets one owner task that resolves the
//! graph and drives the plan executor with a remote unit builder: ready
//! units go to the least-loaded worker, the claim table keeps each cache
//! key in flight at most once fleet-wide, and worker output streams back
//! to the initiator. A lost worker releases its claims and the affected
//! units are re-dispatched unconditionally.

use crate::error::{DistbuildError, DistbuildResult};
use crate::protocol::{Message, StreamKind, read_message, write_message};
use async_trait::async_trait;
use morph_builder::error::{BuildError, BuildResult};
use morph_builder::{BuildOutcome, PlanExecutor, UnitBuilder};
use morph_cache::{RemoteArtifactCache, artifact_filename};
use morph_core::graph::BuildGraph;
use morph_core::{CacheKey, Config, GitRepoCache, GraphBuilder, SourceResolver};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;

/// What a unit owner sees of its exec request.
#[derive(Debug)]
pub enum ExecEvent {
    Output { stream: StreamKind, text: String },
    Response { exit: i32 },
    /// The worker connection died while the request was in flight.
    Lost,
}

/// Fleet-wide claim table: at most one in-flight build per cache key.
///
/// A second request for a claimed key waits for the first to land in the
/// shared cache instead of re-running the build. Lock hold times are
/// O(1): lookup and insert only.
#[derive(Default)]
pub struct ClaimTable {
    inner: Mutex<HashMap<CacheKey, ClaimEntry>>,
}

struct ClaimEntry {
    worker: String,
    since: Instant,
    done: Arc<Notify>,
}

/// Outcome of a claim attempt.
pub enum ClaimStatus {
    Granted,
    /// Someone else is building; wait on the notifier, then re-check the
    /// shared cache.
    InFlight(Arc<Notify>),
}

impl ClaimTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn claim(&self, key: &CacheKey, worker: &str) -> ClaimStatus {
        let mut inner = self.inner.lock().await;
        match inner.get(key) {
            Some(entry) => ClaimStatus::InFlight(entry.done.clone()),
            None => {
                inner.insert(
                    *key,
                    ClaimEntry {
                        worker: worker.to_string(),
                        since: Instant::now(),
                        done: Arc::new(Notify::new()),
                    },
                );
                ClaimStatus::Granted
            }
        }
    }

    /// Release a claim and wake every waiter.
    pub async fn release(&self, key: &CacheKey) {
        if let Some(entry) = self.inner.lock().await.remove(key) {
            tracing::debug!(
                key = %key,
                worker = %entry.worker,
                held_for = ?entry.since.elapsed(),
                "claim released"
            );
            entry.done.notify_waiters();
        }
    }

    /// Release every claim held by `worker`, waking their waiters.
    pub async fn release_worker(&self, worker: &str) {
        let mut inner = self.inner.lock().await;
        let gone: Vec<CacheKey> = inner
            .iter()
            .filter(|(_, entry)| entry.worker == worker)
            .map(|(key, _)| *key)
            .collect();
        for key in gone {
            if let Some(entry) = inner.remove(&key) {
                entry.done.notify_waiters();
            }
        }
    }

    pub async fn holder(&self, key: &CacheKey) -> Option<String> {
        self.inner
            .lock()
            .await
            .get(key)
            .map(|entry| entry.worker.clone())
    }
}

/// One worker as seen from the controller.
pub struct WorkerHandle {
    addr: String,
    outgoing: mpsc::Sender<Message>,
    subscriptions: Mutex<HashMap<String, mpsc::Sender<ExecEvent>>>,
    load: AtomicUsize,
    connected: AtomicBool,
}

impl WorkerHandle {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }

    /// Dispatch one exec request; events arrive on the returned channel.
    pub async fn exec(
        &self,
        id: &str,
        argv: Vec<String>,
        stdin_contents: String,
    ) -> DistbuildResult<mpsc::Receiver<ExecEvent>> {
        if !self.is_connected() {
            return Err(DistbuildError::WorkerDisconnected(self.addr.clone()));
        }
        let (tx, rx) = mpsc::channel(64);
        self.subscriptions.lock().await.insert(id.to_string(), tx);
        self.load.fetch_add(1, Ordering::SeqCst);
        let message = Message::ExecRequest {
            id: id.to_string(),
            argv,
            stdin_contents,
        };
        if self.outgoing.send(message).await.is_err() {
            self.drop_subscription(id).await;
            return Err(DistbuildError::WorkerDisconnected(self.addr.clone()));
        }
        Ok(rx)
    }

    /// Idempotent cancel of an in-flight exec.
    pub async fn cancel(&self, id: &str) {
        let _ = self
            .outgoing
            .send(Message::ExecCancel { id: id.to_string() })
            .await;
    }

    async fn drop_subscription(&self, id: &str) {
        if self.subscriptions.lock().await.remove(id).is_some() {
            self.load.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn route(&self, id: &str, event: ExecEvent) {
        let finished = matches!(event, ExecEvent::Response { .. });
        let subscription = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions.get(id).cloned()
        };
        if let Some(tx) = subscription {
            let _ = tx.send(event).await;
        }
        if finished {
            self.drop_subscription(id).await;
        }
    }

    async fn connection_lost(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut subscriptions = self.subscriptions.lock().await;
        for (_, tx) in subscriptions.drain() {
            let _ = tx.send(ExecEvent::Lost).await;
        }
        self.load.store(0, Ordering::SeqCst);
    }
}

/// The controller's view of the whole fleet.
#[derive(Default)]
pub struct WorkerPool {
    workers: Vec<Arc<WorkerHandle>>,
}

impl WorkerPool {
    /// Create handles for the configured workers and spawn a connector
    /// task per worker that dials, relays, and re-dials on loss.
    pub fn spawn(config: &Config, claims: Arc<ClaimTable>) -> Arc<Self> {
        let mut workers = Vec::new();
        for worker_config in &config.distbuild.workers {
            let (tx, rx) = mpsc::channel(256);
            let handle = Arc::new(WorkerHandle {
                addr: worker_config.addr.clone(),
                outgoing: tx,
                subscriptions: Mutex::new(HashMap::new()),
                load: AtomicUsize::new(0),
                connected: AtomicBool::new(false),
            });
            workers.push(handle.clone());
            let delay = Duration::from_secs(config.distbuild.reconnect_delay_secs.max(1));
            tokio::spawn(run_worker_connector(handle, rx, delay, claims.clone()));
        }
        Arc::new(Self { workers })
    }

    /// The connected worker with the fewest in-flight requests.
    pub fn least_loaded(&self) -> Option<Arc<WorkerHandle>> {
        self.workers
            .iter()
            .filter(|w| w.is_connected())
            .min_by_key(|w| w.load())
            .cloned()
    }

    pub fn any_connected(&self) -> bool {
        self.workers.iter().any(|w| w.is_connected())
    }

    /// Whether any workers are configured at all.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Dial one worker forever, relaying outgoing frames and routing incoming
/// ones to the unit owners.
async fn run_worker_connector(
    handle: Arc<WorkerHandle>,
    mut rx: mpsc::Receiver<Message>,
    reconnect_delay: Duration,
    claims: Arc<ClaimTable>,
) {
    loop {
        let stream = match TcpStream::connect(&handle.addr).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(worker = %handle.addr, error = %err, "worker dial failed");
                tokio::time::sleep(reconnect_delay).await;
                continue;
            }
        };
        tracing::info!(worker = %handle.addr, "worker connected");
        handle.connected.store(true, Ordering::SeqCst);

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    match outgoing {
                        None => return,
                        Some(message) => {
                            if write_message(&mut write_half, &message).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                incoming = read_message(&mut reader) => {
                    match incoming {
                        Ok(Some(Message::ExecOutput { id, stream, text })) => {
                            handle.route(&id, ExecEvent::Output { stream, text }).await;
                        }
                        Ok(Some(Message::ExecResponse { id, exit })) => {
                            handle.route(&id, ExecEvent::Response { exit }).await;
                        }
                        Ok(Some(other)) => {
                            tracing::warn!(
                                worker = %handle.addr,
                                id = %other.id(),
                                "unexpected message from worker, dropping connection"
                            );
                            break;
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            }
        }

        tracing::warn!(worker = %handle.addr, "worker connection lost");
        handle.connection_lost().await;
        claims.release_worker(&handle.addr).await;
        tokio::time::sleep(reconnect_delay).await;
    }
}

/// A `UnitBuilder` that builds by dispatching to workers.
///
/// Units already present in the shared cache short-circuit to `Cached`;
/// everything else claims its key, runs the worker-side build command and
/// verifies the upload landed before reporting success.
pub struct DistBuilder {
    request_id: String,
    graph_json: String,
    pool: Arc<WorkerPool>,
    claims: Arc<ClaimTable>,
    shared: RemoteArtifactCache,
    build_command: Vec<String>,
    to_initiator: mpsc::Sender<Message>,
    done: AtomicUsize,
    total: usize,
}

impl DistBuilder {
    async fn progress(&self, step: &str, message: String) {
        let n = self.done.load(Ordering::SeqCst);
        let _ = self
            .to_initiator
            .send(Message::BuildProgress {
                id: self.request_id.clone(),
                step: step.to_string(),
                n,
                total: self.total,
                message,
            })
            .await;
    }

    fn finish_one(&self) {
        self.done.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl UnitBuilder for DistBuilder {
    async fn build(
        &self,
        graph: Arc<BuildGraph>,
        unit_index: usize,
        cancel: CancellationToken,
    ) -> BuildResult<BuildOutcome> {
        let unit = &graph.units[unit_index];
        let filename = artifact_filename(&unit.cache_key, unit.kind, &unit.name);

        loop {
            if cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }

            // The shared cache is authoritative for done-ness.
            match self.shared.head(&filename).await {
                Ok(true) => {
                    self.finish_one();
                    self.progress(&unit.name, "already in shared cache".to_string())
                        .await;
                    return Ok(BuildOutcome::Cached);
                }
                Ok(false) => {}
                Err(morph_cache::CacheError::Busy(_)) => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                Err(err) => return Err(BuildError::Cache(err)),
            }

            let worker = match self.pool.least_loaded() {
                Some(worker) => worker,
                None if self.pool.is_empty() => {
                    return Err(BuildError::Remote("no workers available".to_string()));
                }
                None => {
                    // Workers are configured but none is connected right
                    // now; they re-dial, so hold the unit instead of
                    // failing the request.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
            };

            match self.claims.claim(&unit.cache_key, worker.addr()).await {
                ClaimStatus::InFlight(done) => {
                    // Someone else is building this key; wait for it to
                    // land, then re-check the cache.
                    done.notified().await;
                    continue;
                }
                ClaimStatus::Granted => {}
            }

            let exec_id = uuid::Uuid::new_v4().to_string();
            let mut argv = self.build_command.clone();
            argv.push(unit.cache_key.to_hex());
            self.progress(&unit.name, format!("building on {}", worker.addr()))
                .await;

            let mut events = match worker
                .exec(&exec_id, argv, self.graph_json.clone())
                .await
            {
                Ok(events) => events,
                Err(_) => {
                    self.claims.release(&unit.cache_key).await;
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        worker.cancel(&exec_id).await;
                        self.claims.release(&unit.cache_key).await;
                        return Err(BuildError::Cancelled);
                    }
                    event = events.recv() => match event {
                        Some(ExecEvent::Output { stream, text }) => {
                            let _ = self
                                .to_initiator
                                .send(Message::BuildOutput {
                                    id: self.request_id.clone(),
                                    stream,
                                    text,
                                })
                                .await;
                        }
                        Some(ExecEvent::Response { exit }) => {
                            self.claims.release(&unit.cache_key).await;
                            if exit != 0 {
                                return Err(BuildError::Remote(format!(
                                    "{} failed on {} with exit {exit}",
                                    unit.name,
                                    worker.addr()
                                )));
                            }
                            // The worker must have uploaded before exiting 0.
                            match self.shared.head(&filename).await {
                                Ok(true) => {
                                    self.finish_one();
                                    self.progress(&unit.name, "built".to_string()).await;
                                    return Ok(BuildOutcome::Built);
                                }
                                _ => {
                                    return Err(BuildError::Remote(format!(
                                        "{} exited 0 on {} but never reached the shared cache",
                                        unit.name,
                                        worker.addr()
                                    )));
                                }
                            }
                        }
                        Some(ExecEvent::Lost) | None => {
                            // Re-dispatch unconditionally.
                            tracing::warn!(
                                unit = %unit.name,
                                worker = %worker.addr(),
                                "worker lost mid-build, re-dispatching"
                            );
                            self.claims.release(&unit.cache_key).await;
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// The controller daemon.
pub struct ControllerDaemon {
    config: Config,
    git: Arc<dyn GitRepoCache>,
    pool: Arc<WorkerPool>,
    claims: Arc<ClaimTable>,
    listener: TcpListener,
}

impl ControllerDaemon {
    /// Bind the initiator listener and dial out to the workers.
    pub async fn bind(config: Config, git: Arc<dyn GitRepoCache>) -> DistbuildResult<Self> {
        let listener = TcpListener::bind(&config.distbuild.controller_bind).await?;
        let claims = Arc::new(ClaimTable::new());
        let pool = WorkerPool::spawn(&config, claims.clone());
        Ok(Self {
            config,
            git,
            pool,
            claims,
            listener,
        })
    }

    pub fn local_addr(&self) -> DistbuildResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept initiators forever.
    pub async fn run(self) -> DistbuildResult<()> {
        let shared = Arc::new(RequestContext {
            config: self.config,
            git: self.git,
            pool: self.pool,
            claims: self.claims,
        });
        loop {
            let (stream, peer) = self.listener.accept().await?;
            tracing::info!(peer = %peer, "initiator connected");
            let shared = shared.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_initiator(stream, shared).await {
                    tracing::warn!(peer = %peer, error = %err, "initiator connection ended");
                }
            });
        }
    }
}

struct RequestContext {
    config: Config,
    git: Arc<dyn GitRepoCache>,
    pool: Arc<WorkerPool>,
    claims: Arc<ClaimTable>,
}

async fn serve_initiator(stream: TcpStream, ctx: Arc<RequestContext>) -> DistbuildResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if write_message(&mut write_half, &message).await.is_err() {
                break;
            }
        }
    });

    let mut requests: HashMap<String, CancellationToken> = HashMap::new();
    let result = loop {
        match read_message(&mut reader).await {
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
            Ok(Some(Message::BuildRequest {
                id,
                repo,
                ref_,
                morphology,
            })) => {
                let cancel = CancellationToken::new();
                requests.insert(id.clone(), cancel.clone());
                let ctx = ctx.clone();
                let tx = tx.clone();
                tokio::spawn(run_build_request(
                    ctx, id, repo, ref_, morphology, tx, cancel,
                ));
            }
            Ok(Some(Message::BuildCancel { id })) => {
                if let Some(cancel) = requests.get(&id) {
                    tracing::info!(id = %id, "build-cancel");
                    cancel.cancel();
                }
            }
            Ok(Some(other)) => {
                break Err(DistbuildError::Protocol(format!(
                    "unexpected message from initiator: id {}",
                    other.id()
                )));
            }
        }
    };

    // The initiator is gone; its builds must not keep running.
    for (_, cancel) in requests {
        cancel.cancel();
    }
    drop(tx);
    let _ = writer.await;
    result
}

/// The owner task for one build request: sole mutator of its plan state.
async fn run_build_request(
    ctx: Arc<RequestContext>,
    id: String,
    repo: String,
    ref_: String,
    morphology: String,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let fail = |reason: String| Message::BuildFailed {
        id: id.clone(),
        reason,
    };

    let Some(shared_url) = ctx.config.shared_cache.clone() else {
        let _ = tx
            .send(fail("controller has no shared cache configured".to_string()))
            .await;
        return;
    };
    let shared = match RemoteArtifactCache::new(&shared_url) {
        Ok(shared) => shared,
        Err(err) => {
            let _ = tx.send(fail(err.to_string())).await;
            return;
        }
    };

    let _ = tx
        .send(Message::BuildProgress {
            id: id.clone(),
            step: "resolve".to_string(),
            n: 0,
            total: 0,
            message: format!("resolving {morphology} at {repo} {ref_}"),
        })
        .await;

    let resolver = SourceResolver::new(ctx.git.clone());
    let graph = match GraphBuilder::new(&resolver, &ctx.config)
        .build(&repo, &ref_, &morphology)
        .await
    {
        Ok(graph) => Arc::new(graph),
        Err(err) => {
            let _ = tx.send(fail(err.to_string())).await;
            return;
        }
    };
    let graph_json = match graph.to_json() {
        Ok(json) => json,
        Err(err) => {
            let _ = tx.send(fail(err.to_string())).await;
            return;
        }
    };

    let width = ctx.config.distbuild.workers.len().max(1);
    let builder = Arc::new(DistBuilder {
        request_id: id.clone(),
        graph_json,
        pool: ctx.pool.clone(),
        claims: ctx.claims.clone(),
        shared,
        build_command: ctx.config.distbuild.build_command.clone(),
        to_initiator: tx.clone(),
        done: AtomicUsize::new(0),
        total: graph.len(),
    });

    let report = PlanExecutor::new(width)
        .execute(graph, builder, cancel.clone())
        .await;

    let terminal = if cancel.is_cancelled() {
        fail("build cancelled".to_string())
    } else if report.succeeded() {
        Message::BuildFinished { id: id.clone() }
    } else {
        fail(report
            .first_failure()
            .unwrap_or("build failed")
            .to_string())
    };
    let _ = tx.send(terminal).await;
}
