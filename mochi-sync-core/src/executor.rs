//! # executor: bounded worker pool applying operations to the remote service
//!
//! [`Executor::execute`] feeds operations into a bounded queue consumed by a
//! fixed number of spawned workers. Each worker runs one operation through
//! [`execute_one`], which calls the remote client and, on success, applies
//! the matching lock mutation. Outcomes are sent back and inspected only after
//! every worker has finished.
//!
//! Failures do not stop sibling operations: they are collected into an
//! [`ExecuteError`] that also carries the tally of what succeeded. The lock
//! already reflects every success by the time the error is returned.
//!
//! Cancellation is a `watch` flag: once it flips to `true`, workers stop
//! pulling work and abandon in-flight calls.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::contract::{CardUpdate, Client, ClientError, NewDeck};
use crate::lock::{Lock, LockError};
use crate::operation::{Attachment, Operation, OperationKind, Tally};

/// Upper bound on concurrent workers, to stay friendly with the API rate limit.
pub const MAX_WORKERS: usize = 8;

/// Worker count derived from available parallelism, capped at [`MAX_WORKERS`].
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
        .clamp(1, MAX_WORKERS)
}

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("remote call failed: {0}")]
    Remote(#[source] ClientError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("cancelled")]
    Cancelled,
}

/// Result of one successfully applied operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub kind: OperationKind,
    /// Id of the deck or card the operation created or touched.
    pub id: String,
    pub attachments_uploaded: usize,
}

#[derive(Debug)]
pub struct OperationFailure {
    /// Human-readable description of the failed operation.
    pub operation: String,
    pub error: OperationError,
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.error)
    }
}

/// Aggregate error of a batch where at least one operation failed.
#[derive(Debug)]
pub struct ExecuteError {
    /// What did succeed.
    pub tally: Tally,
    pub failures: Vec<OperationFailure>,
}

impl fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} operation(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  - {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecuteError {}

/// Execute a single operation and apply its lock mutation.
pub async fn execute_one<C>(client: &C, lock: &Lock, op: Operation) -> Result<Applied, OperationError>
where
    C: Client + ?Sized,
{
    let kind = op.kind();
    match op {
        Operation::CreateDeck {
            path,
            name,
            parent_id,
        } => {
            let deck = client
                .create_deck(NewDeck {
                    name: name.clone(),
                    parent_id,
                })
                .await
                .map_err(OperationError::Remote)?;
            lock.set_deck(&deck.id, &path, &name);
            Ok(applied(kind, deck.id, 0))
        }
        Operation::UpdateDeckName {
            deck_id,
            path,
            name,
        } => {
            client
                .update_deck(deck_id.clone(), name.clone())
                .await
                .map_err(OperationError::Remote)?;
            lock.set_deck(&deck_id, &path, &name);
            Ok(applied(kind, deck_id, 0))
        }
        Operation::DeleteDeck { deck_id, .. } => {
            client
                .delete_deck(deck_id.clone())
                .await
                .map_err(OperationError::Remote)?;
            lock.remove_deck(&deck_id);
            Ok(applied(kind, deck_id, 0))
        }
        Operation::CreateCard {
            filename,
            card,
            attachments,
        } => {
            let deck_id = card.deck_id.clone();
            let created = client.create_card(card).await.map_err(OperationError::Remote)?;
            lock.set_card(&deck_id, &created.id, &filename)?;
            let paths: BTreeSet<String> = attachments.iter().map(|a| a.path.clone()).collect();
            let uploaded = upload_attachments(client, lock, &deck_id, &created.id, attachments).await?;
            lock.prune_attachments(&deck_id, &created.id, &paths);
            Ok(applied(kind, created.id, uploaded))
        }
        Operation::UpdateCard {
            deck_id,
            card_id,
            filename,
            update,
            attachments,
            attachment_paths,
        } => {
            if !update.is_empty() {
                client
                    .update_card(card_id.clone(), update)
                    .await
                    .map_err(OperationError::Remote)?;
            }
            lock.set_card(&deck_id, &card_id, &filename)?;
            let uploaded = upload_attachments(client, lock, &deck_id, &card_id, attachments).await?;
            lock.prune_attachments(&deck_id, &card_id, &attachment_paths);
            Ok(applied(kind, card_id, uploaded))
        }
        Operation::ArchiveCard { card_id, .. } => {
            let update = CardUpdate {
                archived: Some(true),
                ..CardUpdate::default()
            };
            client
                .update_card(card_id.clone(), update)
                .await
                .map_err(OperationError::Remote)?;
            Ok(applied(kind, card_id, 0))
        }
        Operation::DeleteCard { deck_id, card_id } => {
            client
                .delete_card(card_id.clone())
                .await
                .map_err(OperationError::Remote)?;
            lock.remove_card(&deck_id, &card_id);
            Ok(applied(kind, card_id, 0))
        }
    }
}

fn applied(kind: OperationKind, id: String, attachments_uploaded: usize) -> Applied {
    Applied {
        kind,
        id,
        attachments_uploaded,
    }
}

/// Upload attachments whose hash differs from the lock, recording each hash
/// as soon as its upload succeeds.
async fn upload_attachments<C>(
    client: &C,
    lock: &Lock,
    deck_id: &str,
    card_id: &str,
    attachments: Vec<Attachment>,
) -> Result<usize, OperationError>
where
    C: Client + ?Sized,
{
    let mut uploaded = 0;
    for attachment in attachments {
        if lock.get_attachment_hash(deck_id, card_id, &attachment.path).as_deref()
            == Some(attachment.hash.as_str())
        {
            continue;
        }
        debug!(card_id, path = %attachment.path, name = %attachment.name, "[EXEC] Uploading attachment");
        client
            .add_attachment(card_id.to_string(), attachment.name, attachment.data)
            .await
            .map_err(OperationError::Remote)?;
        lock.set_attachment_hash(deck_id, card_id, &attachment.path, &attachment.hash)?;
        uploaded += 1;
    }
    Ok(uploaded)
}

/// Resolves once the cancellation flag is set. Never resolves if the sender
/// is dropped without cancelling.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|rx| *rx.borrow())
}

async fn run_cancellable<C>(
    client: &C,
    lock: &Lock,
    op: Operation,
    cancel: &mut Option<watch::Receiver<bool>>,
) -> Result<Applied, OperationError>
where
    C: Client + ?Sized,
{
    match cancel {
        Some(rx) => tokio::select! {
            biased;
            _ = cancelled(rx) => Err(OperationError::Cancelled),
            result = execute_one(client, lock, op) => result,
        },
        None => execute_one(client, lock, op).await,
    }
}

struct Outcome {
    operation: String,
    kind: OperationKind,
    result: Result<Applied, OperationError>,
}

/// Runs operation batches on a bounded pool of workers.
pub struct Executor<C: ?Sized> {
    client: Arc<C>,
    lock: Arc<Lock>,
    workers: usize,
    cancel: Option<watch::Receiver<bool>>,
}

impl<C> Executor<C>
where
    C: Client + ?Sized + 'static,
{
    pub fn new(client: Arc<C>, lock: Arc<Lock>) -> Self {
        Self {
            client,
            lock,
            workers: default_workers(),
            cancel: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Execute `ops` concurrently. Returns the tally, or an aggregate error
    /// listing every failed operation once all workers have drained.
    pub async fn execute(&self, ops: Vec<Operation>) -> Result<Tally, ExecuteError> {
        let total = ops.len();
        if total == 0 {
            return Ok(Tally::default());
        }
        let workers = self.workers.clamp(1, total);
        info!(operations = total, workers, "[EXEC] Executing operations");

        let (task_tx, task_rx) = mpsc::channel::<Operation>(workers * 2);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Outcome>();

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let client = Arc::clone(&self.client);
            let lock = Arc::clone(&self.lock);
            let tasks = Arc::clone(&task_rx);
            let results = result_tx.clone();
            let mut cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if is_cancelled(&cancel) {
                        debug!(worker, "[EXEC] Worker stopping on cancellation");
                        break;
                    }
                    let next = tasks.lock().await.recv().await;
                    let Some(op) = next else {
                        break;
                    };
                    let operation = op.to_string();
                    let kind = op.kind();
                    let result = run_cancellable(client.as_ref(), &lock, op, &mut cancel).await;
                    if results
                        .send(Outcome {
                            operation,
                            kind,
                            result,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);
        drop(task_rx);

        for op in ops {
            // Fails only once every worker has stopped.
            if task_tx.send(op).await.is_err() {
                break;
            }
        }
        drop(task_tx);

        let mut failures = Vec::new();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "[EXEC] Worker task failed");
            }
        }

        let mut tally = Tally::default();
        let mut finished = 0;
        while let Some(outcome) = result_rx.recv().await {
            finished += 1;
            match outcome.result {
                Ok(applied) => {
                    debug!(operation = %outcome.operation, id = %applied.id, "[EXEC] Operation succeeded");
                    tally.record(outcome.kind);
                    tally.attachments_uploaded += applied.attachments_uploaded;
                }
                Err(error) => {
                    warn!(operation = %outcome.operation, error = %error, "[EXEC] Operation failed");
                    failures.push(OperationFailure {
                        operation: outcome.operation,
                        error,
                    });
                }
            }
        }
        let unexecuted = total - finished;
        if unexecuted > 0 {
            warn!(unexecuted, "[EXEC] Operations left unexecuted");
            failures.push(OperationFailure {
                operation: format!("{unexecuted} queued operation(s)"),
                error: OperationError::Cancelled,
            });
        }

        info!(%tally, failed = failures.len(), "[EXEC] Execution finished");
        if failures.is_empty() {
            Ok(tally)
        } else {
            Err(ExecuteError { tally, failures })
        }
    }
}
