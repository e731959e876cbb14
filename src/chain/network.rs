//! Staged worker-pool network.
//!
//! # Responsibilities
//! - Give every stage its own inbound queue and dispatcher task
//! - Run each request's stage on a freshly spawned task, optionally capped
//!   by a per-stage worker pool
//! - Bound the number of requests in flight (admission control)
//! - Hand each connection back to the caller that injected it
//!
//! # Design Decisions
//! - Completion bookkeeping lives in one drainer task that owns the map from
//!   sequence number to waiting caller; everything else talks to it through
//!   messages
//! - Registration is sent before injection and the drainer always prefers
//!   control messages, so a completion never overtakes its registration
//! - A stage that returns false or panics sends the request straight to the
//!   exit queue; a panic turns the response into a 500
//! - Tasks stop by themselves once the last handler clone is dropped: the
//!   entry queue closes, each dispatcher drains and exits, and the drainer
//!   follows when the exit queue has no senders left

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::Instrument;

use crate::chain::Handler;
use crate::component::Component;
use crate::conn::Connection;
use crate::http::Request;
use crate::observability::metrics;

/// Network sizing.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Name used in logs and metrics.
    pub name: String,
    /// Maximum requests inside the network at once; `None` is unbounded.
    pub capacity: Option<usize>,
    /// Capacity of each stage's inbound queue; `None` is unbounded.
    pub queue_limit: Option<usize>,
    /// Maximum concurrent tasks per stage; `None` is unbounded.
    pub stage_workers: Option<usize>,
}

impl NetworkConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: None,
            queue_limit: None,
            stage_workers: None,
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = Some(limit);
        self
    }

    pub fn stage_workers(mut self, workers: usize) -> Self {
        self.stage_workers = Some(workers);
        self
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::new("network")
    }
}

/// A request travelling through the network.
struct Flight {
    seq: u64,
    conn: Connection,
    req: Request,
    /// Admission slot, released when the caller gets the connection back.
    _admission: Option<OwnedSemaphorePermit>,
}

/// Sending side of a stage queue.
#[derive(Clone)]
enum StageTx {
    Bounded(mpsc::Sender<Flight>),
    Unbounded(mpsc::UnboundedSender<Flight>),
}

enum StageRx {
    Bounded(mpsc::Receiver<Flight>),
    Unbounded(mpsc::UnboundedReceiver<Flight>),
}

fn stage_queue(limit: Option<usize>) -> (StageTx, StageRx) {
    match limit {
        Some(limit) => {
            let (tx, rx) = mpsc::channel(limit.max(1));
            (StageTx::Bounded(tx), StageRx::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (StageTx::Unbounded(tx), StageRx::Unbounded(rx))
        }
    }
}

impl StageTx {
    /// Enqueue, waiting for room on a bounded queue. The flight comes back
    /// if the queue is closed.
    async fn send(&self, flight: Flight) -> Result<(), Flight> {
        match self {
            StageTx::Bounded(tx) => tx.send(flight).await.map_err(|e| e.0),
            StageTx::Unbounded(tx) => tx.send(flight).map_err(|e| e.0),
        }
    }
}

impl StageRx {
    async fn recv(&mut self) -> Option<Flight> {
        match self {
            StageRx::Bounded(rx) => rx.recv().await,
            StageRx::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Where a stage forwards a request that returned true.
#[derive(Clone)]
enum Next {
    Stage(StageTx),
    Exit(mpsc::UnboundedSender<Flight>),
}

impl Next {
    async fn send(&self, flight: Flight) -> Result<(), Flight> {
        match self {
            Next::Stage(tx) => tx.send(flight).await,
            Next::Exit(tx) => tx.send(flight).map_err(|e| e.0),
        }
    }
}

/// Messages to the drainer.
enum Control {
    Register { seq: u64, tx: oneshot::Sender<Flight> },
    Cancel(u64),
}

/// A running network. Callers interact with it through [`NetworkHandler`].
pub struct Network {
    name: String,
    stage_count: usize,
    admission: Option<Arc<Semaphore>>,
    entry: Next,
    control: mpsc::UnboundedSender<Control>,
    next_seq: AtomicU64,
    pending: Arc<AtomicUsize>,
}

impl Network {
    /// Spawn the dispatchers and the drainer. Must be called inside a Tokio
    /// runtime.
    pub fn start(config: NetworkConfig, stages: Vec<Component>) -> NetworkHandler {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let name: Arc<str> = Arc::from(config.name.as_str());

        // Wire queues back to front so each dispatcher knows its successor.
        let mut next = Next::Exit(exit_tx.clone());
        for (index, component) in stages.iter().enumerate().rev() {
            let (tx, rx) = stage_queue(config.queue_limit);
            let workers = config
                .stage_workers
                .map(|n| Arc::new(Semaphore::new(n.max(1))));
            tokio::spawn(dispatch(Dispatcher {
                network: Arc::clone(&name),
                index,
                component: component.clone(),
                inbound: rx,
                next,
                exit: exit_tx.clone(),
                workers,
            }));
            next = Next::Stage(tx);
        }
        drop(exit_tx);

        tokio::spawn(drain(Arc::clone(&name), control_rx, exit_rx, Arc::clone(&pending)));

        tracing::info!(
            network = %config.name,
            stages = stages.len(),
            capacity = ?config.capacity,
            queue_limit = ?config.queue_limit,
            stage_workers = ?config.stage_workers,
            "Network started"
        );

        NetworkHandler {
            inner: Arc::new(Network {
                name: config.name,
                stage_count: stages.len(),
                admission: config.capacity.map(|c| Arc::new(Semaphore::new(c.max(1)))),
                entry: next,
                control: control_tx,
                next_seq: AtomicU64::new(0),
                pending,
            }),
        }
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("name", &self.name)
            .field("stage_count", &self.stage_count)
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct Dispatcher {
    network: Arc<str>,
    index: usize,
    component: Component,
    inbound: StageRx,
    next: Next,
    exit: mpsc::UnboundedSender<Flight>,
    workers: Option<Arc<Semaphore>>,
}

async fn dispatch(mut d: Dispatcher) {
    while let Some(flight) = d.inbound.recv().await {
        let worker = match &d.workers {
            Some(pool) => match Arc::clone(pool).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => break,
            },
            None => None,
        };
        let span = tracing::debug_span!(
            "stage",
            network = %d.network,
            index = d.index,
            stage = d.component.name(),
            connection_id = %flight.conn.id()
        );
        tokio::spawn(
            run_stage(
                d.component.clone(),
                flight,
                d.next.clone(),
                d.exit.clone(),
                worker,
            )
            .instrument(span),
        );
    }
    tracing::debug!(network = %d.network, index = d.index, "Stage dispatcher stopped");
}

/// Delivers the flight to the exit queue as a 500 if the stage task dies
/// before handing it on.
struct StageGuard {
    flight: Option<Flight>,
    exit: mpsc::UnboundedSender<Flight>,
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        if let Some(mut flight) = self.flight.take() {
            tracing::error!(connection_id = %flight.conn.id(), "Stage did not complete, answering 500");
            flight.conn.status_response(StatusCode::INTERNAL_SERVER_ERROR);
            let _ = self.exit.send(flight);
        }
    }
}

async fn run_stage(
    component: Component,
    flight: Flight,
    next: Next,
    exit: mpsc::UnboundedSender<Flight>,
    worker: Option<OwnedSemaphorePermit>,
) {
    let mut guard = StageGuard {
        flight: Some(flight),
        exit: exit.clone(),
    };
    let Some(current) = guard.flight.as_mut() else {
        return;
    };
    let proceed = component.handle(&mut current.conn, &current.req).await;

    let Some(flight) = guard.flight.take() else {
        return;
    };
    // The worker slot covers the stage itself, not the hand-off.
    drop(worker);

    if proceed {
        if let Err(flight) = next.send(flight).await {
            tracing::warn!(connection_id = %flight.conn.id(), "Next stage closed, completing early");
            let _ = exit.send(flight);
        }
    } else {
        tracing::debug!(connection_id = %flight.conn.id(), stage = component.name(), "Network request aborted");
        metrics::record_abort(component.name());
        let _ = exit.send(flight);
    }
}

async fn drain(
    network: Arc<str>,
    mut control: mpsc::UnboundedReceiver<Control>,
    mut exits: mpsc::UnboundedReceiver<Flight>,
    pending: Arc<AtomicUsize>,
) {
    let mut waiting: HashMap<u64, oneshot::Sender<Flight>> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            Some(message) = control.recv() => match message {
                Control::Register { seq, tx } => {
                    waiting.insert(seq, tx);
                }
                Control::Cancel(seq) => {
                    waiting.remove(&seq);
                }
            },
            Some(flight) = exits.recv() => {
                let waiter = waiting.remove(&flight.seq);
                pending.store(waiting.len(), Ordering::Relaxed);
                metrics::record_pending(&network, waiting.len());
                match waiter {
                    Some(tx) => {
                        if tx.send(flight).is_err() {
                            tracing::debug!(network = %network, "Caller went away before completion");
                        }
                    }
                    None => {
                        tracing::debug!(network = %network, seq = flight.seq, "Completion without a waiting caller");
                    }
                }
                continue;
            }
            else => break,
        }
        pending.store(waiting.len(), Ordering::Relaxed);
        metrics::record_pending(&network, waiting.len());
    }

    tracing::debug!(network = %network, "Network drainer stopped");
}

/// Sends a cancellation if the caller stops waiting before completion.
struct Registration {
    seq: u64,
    control: mpsc::UnboundedSender<Control>,
    armed: bool,
}

impl Registration {
    fn complete(mut self) {
        self.armed = false;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.control.send(Control::Cancel(self.seq));
        }
    }
}

fn unavailable(mut conn: Connection) -> Connection {
    conn.status_response(StatusCode::SERVICE_UNAVAILABLE);
    conn
}

/// Shared entry point into a running network.
///
/// Clones share the same network: binding clones to several routes makes
/// those routes compete for one set of queues, workers and capacity.
#[derive(Debug, Clone)]
pub struct NetworkHandler {
    inner: Arc<Network>,
}

impl NetworkHandler {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn stage_count(&self) -> usize {
        self.inner.stage_count
    }

    /// Callers currently registered for completion.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Relaxed)
    }

    /// Admission slots free right now; `None` when unbounded.
    pub fn available(&self) -> Option<usize> {
        self.inner.admission.as_ref().map(|s| s.available_permits())
    }
}

#[async_trait]
impl Handler for NetworkHandler {
    async fn serve(&self, conn: Connection, req: Request) -> Connection {
        let network = &self.inner;

        let admission = match &network.admission {
            Some(slots) => match Arc::clone(slots).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return unavailable(conn),
            },
            None => None,
        };

        let seq = network.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if network.control.send(Control::Register { seq, tx }).is_err() {
            tracing::error!(network = %network.name, "Network drainer is gone");
            return unavailable(conn);
        }
        let registration = Registration {
            seq,
            control: network.control.clone(),
            armed: true,
        };

        let flight = Flight {
            seq,
            conn,
            req,
            _admission: admission,
        };
        if let Err(flight) = network.entry.send(flight).await {
            tracing::error!(network = %network.name, "Network entry queue is closed");
            return unavailable(flight.conn);
        }

        match rx.await {
            Ok(flight) => {
                registration.complete();
                flight.conn
            }
            Err(_) => {
                registration.complete();
                tracing::error!(network = %network.name, seq, "Request lost inside the network");
                unavailable(Connection::detached())
            }
        }
    }
}
