//! Request batching and dispatch.
//!
//! Callers hand single transfers to [`Batcher::send_token`]. A single
//! assembler task drains the bounded request queue into batches, flushing
//! when a batch is full or when the queue has nothing more ready. Batches go
//! through a one-slot handoff to a pool of dispatch workers, one per funding
//! identity, so each identity only ever has one transaction in flight. The
//! outcome of a batch is delivered to every request through its own oneshot
//! slot.
//!
//! ```text
//! send_token ──► queue (mpsc, bounded) ──► assembler ──► handoff (1) ──► worker[identity] ──► TransferClient
//!     ▲                                                                       │
//!     └──────────────────────────── oneshot result ───────────────────────────┘
//! ```

use crate::client::{TransferClient, TransferRequest};
use crate::error::{FaucetError, FaucetResult, TransferError};
use faucet_common::{Address, Coin};
use futures::future::join_all;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(20);

type Outcome = Result<String, TransferError>;

/// A queued transfer together with the slot its caller is waiting on.
struct PendingTransfer {
    request: TransferRequest,
    result_tx: oneshot::Sender<Outcome>,
}

type Batch = Vec<PendingTransfer>;
type Handoff = Arc<tokio::sync::Mutex<mpsc::Receiver<Batch>>>;

/// Lifecycle of a [`Batcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatcherState {
    Created,
    Running,
    Closing,
    Stopped,
}

struct Admission {
    state: BatcherState,
    /// `None` once closing started; new requests are rejected from then on.
    queue_tx: Option<mpsc::Sender<PendingTransfer>>,
}

/// Coalesces single transfer requests into multi-output transactions
pub struct Batcher {
    client: Arc<dyn TransferClient>,
    funding_identities: Vec<Address>,
    batch_size: usize,
    dispatch_timeout: Duration,
    admission: Mutex<Admission>,
    queue_rx: Mutex<Option<mpsc::Receiver<PendingTransfer>>>,
}

impl Batcher {
    /// Create a batcher dispatching through `client` from `funding_identities`.
    ///
    /// The request queue holds `batch_size` requests; further callers wait
    /// until the assembler catches up.
    pub fn new(
        client: Arc<dyn TransferClient>,
        funding_identities: Vec<Address>,
        batch_size: usize,
    ) -> FaucetResult<Self> {
        if funding_identities.is_empty() {
            return Err(FaucetError::Config("at least one funding identity is required".to_string()));
        }
        if batch_size == 0 {
            return Err(FaucetError::Config("batch size must be greater than zero".to_string()));
        }

        let (queue_tx, queue_rx) = mpsc::channel(batch_size);

        Ok(Self {
            client,
            funding_identities,
            batch_size,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            admission: Mutex::new(Admission {
                state: BatcherState::Created,
                queue_tx: Some(queue_tx),
            }),
            queue_rx: Mutex::new(Some(queue_rx)),
        })
    }

    /// Bound on each chain submission, independent of any caller.
    pub fn with_dispatch_timeout(mut self, dispatch_timeout: Duration) -> Self {
        self.dispatch_timeout = dispatch_timeout;
        self
    }

    pub fn funding_identities(&self) -> &[Address] {
        &self.funding_identities
    }

    pub fn state(&self) -> BatcherState {
        self.admission().state
    }

    /// Send `amount` to `destination` as part of some batch and return the
    /// hash of the transaction that carried it.
    pub async fn send_token(&self, destination: Address, amount: Coin) -> FaucetResult<String> {
        self.send_token_until(destination, amount, std::future::pending::<()>())
            .await
    }

    /// Like [`Batcher::send_token`], but gives up with [`FaucetError::Aborted`]
    /// once `abort` completes.
    ///
    /// Giving up only affects this caller: a request that is already queued
    /// is still sent with its batch and the outcome is discarded.
    pub async fn send_token_until<F>(
        &self,
        destination: Address,
        amount: Coin,
        abort: F,
    ) -> FaucetResult<String>
    where
        F: Future<Output = ()>,
    {
        let queue_tx = self.admission_sender()?;
        tokio::pin!(abort);

        let (result_tx, result_rx) = oneshot::channel();
        let pending = PendingTransfer {
            request: TransferRequest { destination, amount },
            result_tx,
        };

        tokio::select! {
            biased;
            sent = queue_tx.send(pending) => sent.map_err(|_| FaucetError::Closed)?,
            _ = &mut abort => return Err(FaucetError::Aborted),
        }
        drop(queue_tx);

        tokio::select! {
            biased;
            outcome = result_rx => match outcome {
                Ok(Ok(tx_hash)) => Ok(tx_hash),
                Ok(Err(err)) => Err(FaucetError::TransferFailed(err)),
                Err(_) => Err(FaucetError::Internal("request dropped before completion".to_string())),
            },
            _ = &mut abort => Err(FaucetError::Aborted),
        }
    }

    /// Runs the assembler and one dispatch worker per funding identity until
    /// `shutdown` completes, then drains every request already admitted.
    ///
    /// Returns once all workers have exited. May only be called once.
    pub async fn run<F>(&self, shutdown: F) -> FaucetResult<()>
    where
        F: Future<Output = ()>,
    {
        let queue_rx = self
            .queue_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| FaucetError::Internal("batcher has already been started".to_string()))?;

        {
            let mut admission = self.admission();
            if admission.state == BatcherState::Created {
                admission.state = BatcherState::Running;
            }
        }

        let (handoff_tx, handoff_rx) = mpsc::channel::<Batch>(1);
        let handoff_rx: Handoff = Arc::new(tokio::sync::Mutex::new(handoff_rx));

        info!(
            funding_identities = self.funding_identities.len(),
            batch_size = self.batch_size,
            "Batcher started"
        );

        let workers: Vec<_> = self
            .funding_identities
            .iter()
            .map(|identity| {
                tokio::spawn(dispatch_batches(
                    self.client.clone(),
                    *identity,
                    handoff_rx.clone(),
                    self.dispatch_timeout,
                ))
            })
            .collect();
        // Only workers hold the handoff receiver, so a dead pool closes it.
        drop(handoff_rx);
        let assembler = tokio::spawn(assemble_batches(queue_rx, handoff_tx, self.batch_size));

        shutdown.await;
        info!("Batcher closing, draining queued requests");
        self.close();

        let mut failure = None;
        if let Err(e) = assembler.await {
            error!("Batch assembler task failed: {}", e);
            failure = Some(FaucetError::Internal(format!("batch assembler failed: {}", e)));
        }
        for joined in join_all(workers).await {
            if let Err(e) = joined {
                error!("Dispatch worker task failed: {}", e);
                failure.get_or_insert_with(|| FaucetError::Internal(format!("dispatch worker failed: {}", e)));
            }
        }

        self.admission().state = BatcherState::Stopped;
        info!("Batcher stopped");

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop admitting requests. Idempotent.
    ///
    /// Callers that already obtained a queue sender still complete their
    /// enqueue; the assembler keeps draining until the last of them is gone.
    fn close(&self) {
        let mut admission = self.admission();
        if admission.queue_tx.is_none() {
            return;
        }
        admission.queue_tx = None;
        admission.state = BatcherState::Closing;
    }

    fn admission_sender(&self) -> FaucetResult<mpsc::Sender<PendingTransfer>> {
        self.admission().queue_tx.clone().ok_or(FaucetError::Closed)
    }

    fn admission(&self) -> MutexGuard<'_, Admission> {
        self.admission.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Sole consumer of the request queue. Closes the handoff when the queue is
/// closed and drained.
async fn assemble_batches(
    mut queue_rx: mpsc::Receiver<PendingTransfer>,
    handoff_tx: mpsc::Sender<Batch>,
    batch_size: usize,
) {
    while let Some(first) = queue_rx.recv().await {
        let mut batch = Vec::with_capacity(batch_size);
        batch.push(first);

        // Empty or closed queue: flush what we have.
        while batch.len() < batch_size {
            match queue_rx.try_recv() {
                Ok(pending) => batch.push(pending),
                Err(_) => break,
            }
        }

        debug!(size = batch.len(), "Batch assembled");
        if handoff_tx.send(batch).await.is_err() {
            error!("No dispatch worker left, stopping batch assembly");
            return;
        }
    }

    debug!("Request queue closed and drained");
}

async fn dispatch_batches(
    client: Arc<dyn TransferClient>,
    identity: Address,
    handoff_rx: Handoff,
    dispatch_timeout: Duration,
) {
    loop {
        let batch = {
            let mut rx = handoff_rx.lock().await;
            rx.recv().await
        };
        let Some(batch) = batch else { break };

        send_batch(client.as_ref(), &identity, batch, dispatch_timeout).await;
    }

    debug!(funding_identity = %identity, "Dispatch worker stopped");
}

async fn send_batch(
    client: &dyn TransferClient,
    identity: &Address,
    batch: Batch,
    dispatch_timeout: Duration,
) {
    let (requests, slots): (Vec<_>, Vec<_>) = batch
        .into_iter()
        .map(|pending| (pending.request, pending.result_tx))
        .unzip();

    debug!(funding_identity = %identity, size = requests.len(), "Dispatching batch");

    let outcome = match tokio::time::timeout(dispatch_timeout, client.transfer(identity, &requests)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(TransferError::Timeout(dispatch_timeout)),
    };

    match &outcome {
        Ok(tx_hash) => debug!(funding_identity = %identity, tx_hash = %tx_hash, "Batch sent"),
        Err(e) => warn!(funding_identity = %identity, size = requests.len(), "Batch failed: {}", e),
    }

    for slot in slots {
        // The caller may have given up already.
        let _ = slot.send(outcome.clone());
    }
}
