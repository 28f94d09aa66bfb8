use std::sync::Arc;
use std::time::Duration;

use estate_core::NormalizedListing;
use estate_storage::{ListingStore, StoreError, UpsertOutcome};
use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub inserted: usize,
    pub updated: usize,
    /// Records in batches dropped after their retry also failed.
    pub failed: usize,
    /// Records never dispatched because the run was cancelled.
    pub not_attempted: usize,
    pub batches_committed: usize,
    pub batches_dropped: usize,
    pub cancelled: bool,
}

/// Commits normalized records in bounded batches, retrying each failed batch once.
pub struct Reconciler {
    store: Arc<dyn ListingStore>,
    batch_size: usize,
    max_in_flight: usize,
    commit_timeout: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ListingStore>, batch_size: usize, max_in_flight: usize, commit_timeout: Duration) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            max_in_flight: max_in_flight.max(1),
            commit_timeout,
        }
    }

    /// Stops dispatching once `cancel` fires; batches already in flight still
    /// commit or roll back as a unit.
    pub async fn reconcile(&self, records: Vec<NormalizedListing>, cancel: &CancellationToken) -> ReconcileOutcome {
        let mut session = self.session();
        session.push(records, cancel).await;
        session.finish(cancel).await
    }

    /// Starts an incremental reconcile that accepts records as they are produced.
    pub fn session(&self) -> ReconcileSession<'_> {
        ReconcileSession {
            reconciler: self,
            buffer: Vec::new(),
            in_flight: JoinSet::new(),
            unresolved: 0,
            outcome: ReconcileOutcome::default(),
        }
    }
}

type BatchResult = (usize, Result<UpsertOutcome, StoreError>);

/// Records are committed in arrival order, one full batch at a time; the
/// trailing partial batch is committed by [`ReconcileSession::finish`].
pub struct ReconcileSession<'a> {
    reconciler: &'a Reconciler,
    buffer: Vec<NormalizedListing>,
    in_flight: JoinSet<BatchResult>,
    // Records handed to batch tasks that have not reported back yet.
    unresolved: usize,
    outcome: ReconcileOutcome,
}

impl ReconcileSession<'_> {
    /// Buffers `records` and dispatches every full batch, waiting for a free
    /// commit slot when all of them are busy.
    pub async fn push(&mut self, records: impl IntoIterator<Item = NormalizedListing>, cancel: &CancellationToken) {
        self.buffer.extend(records);
        while self.buffer.len() >= self.reconciler.batch_size && self.dispatch_next(cancel).await {}
    }

    /// Commits what is left, waits for every in-flight batch and reports.
    ///
    /// The outcome is `cancelled` only when cancellation left records undispatched.
    pub async fn finish(mut self, cancel: &CancellationToken) -> ReconcileOutcome {
        while !self.buffer.is_empty() && self.dispatch_next(cancel).await {}
        while let Some(joined) = self.in_flight.join_next().await {
            self.record(joined);
        }
        // Whatever is left belonged to tasks that panicked.
        self.outcome.failed += self.unresolved;
        self.outcome.not_attempted = self.buffer.len();
        self.outcome.cancelled = self.outcome.not_attempted > 0;
        self.outcome
    }

    // Returns false without dispatching once `cancel` has fired.
    async fn dispatch_next(&mut self, cancel: &CancellationToken) -> bool {
        while self.in_flight.len() >= self.reconciler.max_in_flight {
            let Some(joined) = self.in_flight.join_next().await else {
                break;
            };
            self.record(joined);
        }
        if cancel.is_cancelled() {
            return false;
        }

        let take = self.buffer.len().min(self.reconciler.batch_size);
        let batch = self.buffer.drain(..take).collect::<Vec<_>>();
        let store = Arc::clone(&self.reconciler.store);
        let timeout = self.reconciler.commit_timeout;
        self.unresolved += batch.len();
        self.in_flight.spawn(async move {
            let result = commit_with_retry(store.as_ref(), &batch, timeout).await;
            (batch.len(), result)
        });
        true
    }

    fn record(&mut self, joined: Result<BatchResult, JoinError>) {
        match joined {
            Ok((len, Ok(committed))) => {
                self.unresolved -= len;
                self.outcome.inserted += committed.inserted;
                self.outcome.updated += committed.updated;
                self.outcome.batches_committed += 1;
            }
            Ok((len, Err(err))) => {
                self.unresolved -= len;
                error!(records = len, error = %err, "dropping batch after retry");
                self.outcome.failed += len;
                self.outcome.batches_dropped += 1;
            }
            Err(join_err) => {
                error!(error = %join_err, "batch task aborted");
                self.outcome.batches_dropped += 1;
            }
        }
    }
}

async fn commit_with_retry(
    store: &dyn ListingStore,
    batch: &[NormalizedListing],
    timeout: Duration,
) -> Result<UpsertOutcome, StoreError> {
    match commit_once(store, batch, timeout).await {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            warn!(records = batch.len(), error = %err, "batch commit failed, retrying once");
            commit_once(store, batch, timeout).await
        }
    }
}

async fn commit_once(
    store: &dyn ListingStore,
    batch: &[NormalizedListing],
    timeout: Duration,
) -> Result<UpsertOutcome, StoreError> {
    tokio::time::timeout(timeout, store.upsert_batch(batch))
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
}
