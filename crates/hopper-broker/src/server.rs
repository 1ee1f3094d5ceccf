//! Broker runtime.
//!
//! Wires the scheduler task to the TCP listener, the HTTP surface and the
//! periodic store prune. Every accepted connection identifies itself in its
//! `Hello` and is handled as a client, a worker or an artifact transfer.

use hopper_config::BrokerConfig;
use hopper_core::artifact::ArtifactStore;
use hopper_core::clock::SystemClock;
use hopper_core::{ClientId, Digest, ResourceId, WorkerId};
use hopper_scheduler::{
    Message, Scheduler, SchedulerConfig, SchedulerSnapshot, run_scheduler, run_ticker,
};
use hopper_store::FsArtifactStore;
use hopper_transport::messages::Peer;
use hopper_transport::{Connection, TransportResult, accept_hello, reader_loop, writer_loop};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::artifacts;
use crate::deps::{BrokerMessage, PassThroughDeps};
use crate::error::BrokerResult;
use crate::http::{self, HttpState};

const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// A running broker. Dropping it stops every broker task.
pub struct Broker {
    addr: SocketAddr,
    http_addr: SocketAddr,
    store: Arc<FsArtifactStore>,
    snapshots: watch::Receiver<SchedulerSnapshot>,
    tasks: JoinSet<()>,
}

impl Broker {
    /// Open the store, bind both listeners and start serving.
    pub async fn start(config: &BrokerConfig) -> BrokerResult<Self> {
        let store = Arc::new(
            FsArtifactStore::open(&config.store.root, config.store.retention_policy()).await?,
        );
        info!(
            root = %config.store.root.display(),
            bytes = store.total_bytes(),
            "Artifact store opened"
        );

        let scheduler = Scheduler::<PassThroughDeps>::new(
            SchedulerConfig {
                max_retries: config.max_retries,
                heartbeat_timeout: config.heartbeat_timeout,
            },
            Arc::new(SystemClock),
            store.clone(),
        );
        let snapshots = scheduler.snapshots();
        let events = scheduler.event_sender();

        let listener = TcpListener::bind(config.listen).await?;
        let http_listener = TcpListener::bind(config.http_listen).await?;
        let addr = listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        tasks.spawn(run_scheduler(scheduler, PassThroughDeps, receiver));
        tasks.spawn(run_ticker(sender.clone(), config.tick_interval));
        tasks.spawn(accept_loop(listener, sender, store.clone()));
        tasks.spawn(prune_loop(store.clone(), PRUNE_INTERVAL));

        let app = http::router(HttpState {
            snapshots: snapshots.clone(),
            events,
        })
        .layer(TraceLayer::new_for_http());
        tasks.spawn(async move {
            if let Err(e) = axum::serve(http_listener, app).await {
                error!(error = %e, "HTTP server failed");
            }
        });

        info!(%addr, %http_addr, "Broker listening");
        Ok(Self {
            addr,
            http_addr,
            store,
            snapshots,
            tasks,
        })
    }

    /// Address clients, workers and artifact transfers connect to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn store(&self) -> &Arc<FsArtifactStore> {
        &self.store
    }

    pub fn snapshots(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.snapshots.clone()
    }

    /// Serve until `shutdown` resolves or a broker task stops on its own.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) {
        tokio::select! {
            _ = shutdown => info!("Shutting down"),
            Some(result) = self.tasks.join_next() => {
                error!(?result, "Broker task exited unexpectedly");
            }
        }
        self.tasks.shutdown().await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    scheduler: UnboundedSender<BrokerMessage>,
    store: Arc<FsArtifactStore>,
) {
    // Dropped with this task, which aborts every connection.
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    let scheduler = scheduler.clone();
                    let store = store.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, scheduler, store).await {
                            debug!(%peer_addr, error = %e, "Connection closed with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next() => {}
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    scheduler: UnboundedSender<BrokerMessage>,
    store: Arc<FsArtifactStore>,
) -> TransportResult<()> {
    let mut conn = Connection::new(stream);
    let id = ResourceId::new();
    match accept_hello(&mut conn, id).await? {
        Peer::Client => client_session(conn, ClientId(id), scheduler).await,
        Peer::Worker { slots, cached } => {
            worker_session(conn, WorkerId(id), slots, cached, scheduler).await
        }
        Peer::ArtifactFetcher => artifacts::serve_fetch(&mut conn, &store).await,
        Peer::ArtifactPusher => artifacts::serve_push(&mut conn, &store).await,
    }
}

async fn client_session(
    conn: Connection<TcpStream>,
    id: ClientId,
    scheduler: UnboundedSender<BrokerMessage>,
) -> TransportResult<()> {
    let (reader, writer) = conn.into_split();
    let (sender, outbound) = mpsc::unbounded_channel();
    if scheduler.send(Message::ClientConnected(id, sender)).is_err() {
        return Ok(());
    }

    let result = tokio::select! {
        result = reader_loop(reader, scheduler.clone(), move |m| Message::FromClient(id, m)) => result,
        result = writer_loop(outbound, writer) => result,
    };
    let _ = scheduler.send(Message::ClientDisconnected(id));
    result
}

async fn worker_session(
    conn: Connection<TcpStream>,
    id: WorkerId,
    slots: u32,
    cached: Vec<Digest>,
    scheduler: UnboundedSender<BrokerMessage>,
) -> TransportResult<()> {
    let (reader, writer) = conn.into_split();
    let (sender, outbound) = mpsc::unbounded_channel();
    let connected = Message::WorkerConnected {
        id,
        slots,
        cached,
        sender,
    };
    if scheduler.send(connected).is_err() {
        return Ok(());
    }

    let result = tokio::select! {
        result = reader_loop(reader, scheduler.clone(), move |m| Message::FromWorker(id, m)) => result,
        result = writer_loop(outbound, writer) => result,
    };
    let _ = scheduler.send(Message::WorkerDisconnected(id));
    result
}

async fn prune_loop(store: Arc<FsArtifactStore>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick is immediate.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match store.prune().await {
            Ok(stats) => debug!(
                deleted = stats.artifacts_deleted,
                freed = stats.bytes_freed,
                "Store prune finished"
            ),
            Err(e) => warn!(error = %e, "Store prune failed"),
        }
    }
}
