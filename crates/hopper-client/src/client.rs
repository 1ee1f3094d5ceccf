//! Broker client.

use bytes::Bytes;
use futures::stream::{FuturesUnordered, Stream};
use hopper_core::artifact::CHUNK_SIZE;
use hopper_core::stats::BrokerStatistics;
use hopper_core::{ClientJobId, Digest, JobId, JobOutcome, JobSpec, ResourceId};
use hopper_transport::messages::{
    ArtifactPushRequest, ArtifactPushResponse, BrokerToClient, ClientToBroker, Peer, SubmitOptions,
};
use hopper_transport::{MessageReader, connect, writer_loop};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::ReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};

/// A submission the broker accepted.
#[derive(Debug)]
pub struct JobHandle {
    client_job_id: ClientJobId,
    job_id: JobId,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    pub fn client_job_id(&self) -> ClientJobId {
        self.client_job_id
    }

    /// Content-derived id. Identical submissions share it.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

/// The terminal result of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub client_job_id: ClientJobId,
    pub job_id: JobId,
    pub outcome: JobOutcome,
}

#[derive(Default)]
struct Pending {
    accepts: HashMap<ClientJobId, oneshot::Sender<Result<JobId, String>>>,
    outcomes: HashMap<ClientJobId, oneshot::Sender<JobOutcome>>,
    statistics: VecDeque<oneshot::Sender<BrokerStatistics>>,
    closed: bool,
}

/// A connection to the broker. Submissions, cancellations and statistics
/// requests share it; artifact pushes open their own connections.
pub struct Client {
    addr: String,
    id: ResourceId,
    to_broker: UnboundedSender<ClientToBroker>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU32,
    tasks: Vec<AbortHandle>,
}

impl Client {
    pub async fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        let addr = addr.into();
        let (conn, id) = connect(addr.as_str(), Peer::Client).await?;
        debug!(broker = %addr, client_id = %id, "Connected to broker");

        let (reader, writer) = conn.into_split();
        let (to_broker, outbound) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(Pending::default()));

        let writer_task = tokio::spawn(async move {
            if let Err(e) = writer_loop(outbound, writer).await {
                warn!(error = %e, "Failed to write to broker");
            }
        });
        let reader_task = tokio::spawn(dispatch(reader, pending.clone()));

        Ok(Self {
            addr,
            id,
            to_broker,
            pending,
            next_id: AtomicU32::new(0),
            tasks: vec![writer_task.abort_handle(), reader_task.abort_handle()],
        })
    }

    /// Id the broker assigned to this connection.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Upload a layer. The broker stores it only if it hashes to the digest
    /// returned here.
    pub async fn push_layer(&self, data: Bytes) -> ClientResult<Digest> {
        let digest = Digest::of(&data);
        let (mut conn, _) = connect(self.addr.as_str(), Peer::ArtifactPusher).await?;
        conn.send(&ArtifactPushRequest {
            digest,
            size: data.len() as u64,
        })
        .await?;

        let chunks = (0..data.len())
            .step_by(CHUNK_SIZE)
            .map(|start| Ok::<_, std::io::Error>(data.slice(start..(start + CHUNK_SIZE).min(data.len()))))
            .collect::<Vec<_>>();
        conn.writer()
            .send_body(futures::stream::iter(chunks))
            .await?;

        match conn.expect::<ArtifactPushResponse>().await? {
            ArtifactPushResponse::Stored => {
                debug!(digest = %digest.short(), size = data.len(), "Pushed layer");
                Ok(digest)
            }
            ArtifactPushResponse::Rejected { message } => Err(ClientError::PushRejected(message)),
        }
    }

    pub async fn submit(&self, spec: JobSpec) -> ClientResult<JobHandle> {
        self.submit_with(spec, SubmitOptions::default()).await
    }

    /// Submit a job and wait for the broker to accept or reject it.
    pub async fn submit_with(&self, spec: JobSpec, options: SubmitOptions) -> ClientResult<JobHandle> {
        let client_job_id = ClientJobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (accepted_tx, accepted) = oneshot::channel();
        let (outcome_tx, outcome) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(ClientError::Disconnected);
            }
            pending.accepts.insert(client_job_id, accepted_tx);
            pending.outcomes.insert(client_job_id, outcome_tx);
        }

        self.send(ClientToBroker::JobRequest {
            client_job_id,
            spec,
            options,
        })?;

        match accepted.await {
            Ok(Ok(job_id)) => Ok(JobHandle {
                client_job_id,
                job_id,
                outcome,
            }),
            Ok(Err(message)) => {
                lock(&self.pending).outcomes.remove(&client_job_id);
                Err(ClientError::Rejected(message))
            }
            Err(_) => Err(ClientError::Disconnected),
        }
    }

    /// Wait for a submission's terminal result.
    pub async fn result(&self, handle: JobHandle) -> ClientResult<JobResult> {
        wait(handle).await
    }

    /// Results for `handles` in the order they finish.
    pub fn results(&self, handles: Vec<JobHandle>) -> impl Stream<Item = ClientResult<JobResult>> {
        handles.into_iter().map(wait).collect::<FuturesUnordered<_>>()
    }

    /// Ask the broker to cancel a submission. Its result arrives as
    /// `Failed(Cancelled)` unless the job already finished.
    pub fn cancel(&self, handle: &JobHandle) -> ClientResult<()> {
        self.send(ClientToBroker::CancelJob {
            client_job_id: handle.client_job_id,
        })
    }

    pub async fn statistics(&self) -> ClientResult<BrokerStatistics> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(ClientError::Disconnected);
            }
            pending.statistics.push_back(tx);
        }
        self.send(ClientToBroker::StatisticsRequest)?;
        rx.await.map_err(|_| ClientError::Disconnected)
    }

    fn send(&self, msg: ClientToBroker) -> ClientResult<()> {
        self.to_broker
            .send(msg)
            .map_err(|_| ClientError::Disconnected)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn wait(handle: JobHandle) -> ClientResult<JobResult> {
    let outcome = handle.outcome.await.map_err(|_| ClientError::Disconnected)?;
    Ok(JobResult {
        client_job_id: handle.client_job_id,
        job_id: handle.job_id,
        outcome,
    })
}

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Route broker messages to whoever is waiting for them. When the connection
/// ends every waiter is dropped, which they observe as a disconnect.
async fn dispatch(mut reader: MessageReader<ReadHalf<TcpStream>>, pending: Arc<Mutex<Pending>>) {
    loop {
        let msg = match reader.recv::<BrokerToClient>().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Broker connection failed");
                break;
            }
        };
        let mut pending = lock(&pending);
        match msg {
            BrokerToClient::JobAccepted {
                client_job_id,
                job_id,
            } => {
                if let Some(tx) = pending.accepts.remove(&client_job_id) {
                    let _ = tx.send(Ok(job_id));
                }
            }
            BrokerToClient::JobRejected {
                client_job_id,
                message,
            } => {
                if let Some(tx) = pending.accepts.remove(&client_job_id) {
                    let _ = tx.send(Err(message));
                }
            }
            BrokerToClient::JobResponse {
                client_job_id,
                outcome,
                ..
            } => match pending.outcomes.remove(&client_job_id) {
                Some(tx) => {
                    let _ = tx.send(outcome);
                }
                None => debug!(client_job_id = client_job_id.0, "Ignoring result nobody waits for"),
            },
            BrokerToClient::StatisticsResponse { statistics } => {
                if let Some(tx) = pending.statistics.pop_front() {
                    let _ = tx.send(statistics);
                }
            }
        }
    }

    let mut pending = lock(&pending);
    pending.closed = true;
    pending.accepts.clear();
    pending.outcomes.clear();
    pending.statistics.clear();
}
