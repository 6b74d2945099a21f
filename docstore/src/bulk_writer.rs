use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use prost_types::Value;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use docstore_gax::cancel::CancellationToken;
use docstore_gax::grpc::{Code, Status};
use docstore_gax::retry::ExponentialBackoff;

use crate::apiv1::model::{BatchWriteRequest, BatchWriteResponse};
use crate::apiv1::Client as ApiClient;
use crate::client::Error;
use crate::path::{DocumentPath, FieldPath};
use crate::rate_limiter::{RateLimiter, Throttling};
use crate::retry::{default_should_retry, RetryDecision, WriteRetryPredicate};
use crate::value::Fields;
use crate::write::{Precondition, Write, WriteError, WriteResult};

/// The most operations one batch round-trip may carry.
pub const MAX_BATCH_SIZE: usize = 20;

const DEFAULT_MAX_ATTEMPTS: u32 = 10;

pub type SuccessCallback = Arc<dyn Fn(&DocumentPath, &WriteResult) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&WriteError) + Send + Sync>;

#[derive(Clone)]
pub struct BulkWriterConfig {
    pub throttling: Throttling,
    /// Cap on server-attributed failures per write under the default retry
    /// policy.
    pub max_attempts: u32,
    /// User predicate consulted before the default policy.
    pub retry: Option<WriteRetryPredicate>,
    pub on_success: Option<SuccessCallback>,
    pub on_error: Option<ErrorCallback>,
    /// Seed for per-write backoff jitter; set for deterministic tests.
    pub backoff_seed: Option<u64>,
}

impl Default for BulkWriterConfig {
    fn default() -> Self {
        Self {
            throttling: Throttling::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry: None,
            on_success: None,
            on_error: None,
            backoff_seed: None,
        }
    }
}

/// Completion handle for one queued write.
pub struct WriteAwaiter {
    consumer: oneshot::Receiver<Result<WriteResult, WriteError>>,
}

impl WriteAwaiter {
    pub(crate) fn new(consumer: oneshot::Receiver<Result<WriteResult, WriteError>>) -> Self {
        Self { consumer }
    }

    /// Resolves once the write has been committed or has failed for good.
    pub async fn get(self) -> Result<WriteResult, WriteError> {
        match self.consumer.await {
            Ok(result) => result,
            Err(_) => Err(WriteError {
                code: Code::Cancelled,
                message: "bulk writer dropped the write".to_string(),
                failed_attempts: 0,
                path: String::new(),
            }),
        }
    }
}

enum Command {
    Write {
        write: Write,
        producer: oneshot::Sender<Result<WriteResult, WriteError>>,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
}

/// A pipeline that batches many writes, throttles throughput and retries
/// transient failures, while keeping writes to the same document in enqueue
/// order.
///
/// Writes are queued with [`create`](Self::create) and friends, each
/// returning a [`WriteAwaiter`]. [`close`](Self::close) drains the pipeline;
/// writes queued afterwards are rejected with `InvalidArgument`.
pub struct BulkWriter {
    sender: async_channel::Sender<Command>,
    task: Option<JoinHandle<()>>,
}

impl BulkWriter {
    pub(crate) fn new(
        client: ApiClient,
        database: String,
        cancel: CancellationToken,
        config: BulkWriterConfig,
    ) -> Result<Self, Error> {
        let limiter = RateLimiter::new(config.throttling.clone())?;
        let (sender, receiver) = async_channel::unbounded::<Command>();
        let scheduler = Scheduler {
            client,
            database,
            cancel,
            limiter,
            receiver,
            max_attempts: config.max_attempts.max(1),
            retry: config.retry,
            on_success: config.on_success,
            on_error: config.on_error,
            backoff_seed: config.backoff_seed,
            pending: BTreeMap::new(),
            parked: HashMap::new(),
            retry_heap: BinaryHeap::new(),
            retrying_docs: HashMap::new(),
            dispatched: HashMap::new(),
            in_flight_docs: HashSet::new(),
            in_flight: JoinSet::new(),
            unresolved: BTreeSet::new(),
            flush_waiters: Vec::new(),
            next_seq: 0,
            rate_wake: None,
            draining: false,
        };
        let task = tokio::spawn(scheduler.run());
        Ok(Self {
            sender,
            task: Some(task),
        })
    }

    pub async fn create(&self, path: DocumentPath, fields: Fields) -> WriteAwaiter {
        self.enqueue(Write::create(path, fields)).await
    }

    pub async fn set(&self, path: DocumentPath, fields: Fields) -> WriteAwaiter {
        self.enqueue(Write::set(path, fields)).await
    }

    pub async fn set_merge(
        &self,
        path: DocumentPath,
        fields: Fields,
        merge: Vec<FieldPath>,
    ) -> Result<WriteAwaiter, Error> {
        Ok(self.enqueue(Write::set_merge(path, fields, merge)?).await)
    }

    pub async fn update(
        &self,
        path: DocumentPath,
        entries: impl IntoIterator<Item = (FieldPath, Value)>,
    ) -> Result<WriteAwaiter, Error> {
        Ok(self.enqueue(Write::update(path, entries)?).await)
    }

    pub async fn delete(&self, path: DocumentPath) -> WriteAwaiter {
        self.enqueue(Write::delete(path)).await
    }

    pub async fn delete_with(&self, path: DocumentPath, precondition: Precondition) -> Result<WriteAwaiter, Error> {
        Ok(self.enqueue(Write::delete(path).with_precondition(precondition)?).await)
    }

    /// Queues a validated write. Never blocks on the server.
    pub async fn enqueue(&self, write: Write) -> WriteAwaiter {
        let (producer, consumer) = oneshot::channel();
        if self.sender.is_closed() {
            let _ = producer.send(Err(Self::rejected(&write)));
            return WriteAwaiter::new(consumer);
        }
        if let Err(err) = self.sender.send(Command::Write { write, producer }).await {
            if let Command::Write { write, producer } = err.0 {
                let _ = producer.send(Err(Self::rejected(&write)));
            }
        }
        WriteAwaiter::new(consumer)
    }

    /// Waits until every write queued so far has resolved, one way or the
    /// other. The writer stays usable.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(Command::Flush { done }).await.is_err() {
            return;
        }
        let _ = wait.await;
    }

    /// Stops accepting writes and waits for the pipeline to drain. Errors of
    /// individual writes are reported only through their awaiters and the
    /// error callback, never by close itself. Idempotent.
    pub async fn close(&mut self) {
        self.sender.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("bulk writer scheduler failed: {:?}", e);
            }
        }
    }

    fn rejected(write: &Write) -> WriteError {
        WriteError {
            code: Code::InvalidArgument,
            message: "bulk writer has been closed".to_string(),
            failed_attempts: 0,
            path: write.path.to_string(),
        }
    }
}

struct QueuedWrite {
    seq: u64,
    write: Write,
    /// Canonical document id, the unit of mutual exclusion.
    doc: String,
    producer: oneshot::Sender<Result<WriteResult, WriteError>>,
    failed_attempts: u32,
    backoff: ExponentialBackoff,
}

#[derive(PartialEq, Eq)]
struct RetryEntry {
    ready_at: Instant,
    seq: u64,
}

impl Ord for RetryEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at.cmp(&other.ready_at).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct BatchOutcome {
    seqs: Vec<u64>,
    result: Result<BatchWriteResponse, Status>,
}

/// The single-task cooperative core. All queue state is owned here; the
/// only concurrency is the set of in-flight batch RPCs.
struct Scheduler {
    client: ApiClient,
    database: String,
    cancel: CancellationToken,
    limiter: RateLimiter,
    receiver: async_channel::Receiver<Command>,
    max_attempts: u32,
    retry: Option<WriteRetryPredicate>,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
    backoff_seed: Option<u64>,

    /// Writes ready to be batched, ordered by sequence number.
    pending: BTreeMap<u64, QueuedWrite>,
    /// Writes waiting out a backoff delay.
    parked: HashMap<u64, QueuedWrite>,
    retry_heap: BinaryHeap<Reverse<RetryEntry>>,
    /// Documents blocked by a parked retry; later writes to them must hold.
    retrying_docs: HashMap<String, usize>,
    /// Writes owned by an in-flight batch.
    dispatched: HashMap<u64, QueuedWrite>,
    in_flight_docs: HashSet<String>,
    in_flight: JoinSet<BatchOutcome>,

    /// Sequence numbers not yet resolved, for flush barriers.
    unresolved: BTreeSet<u64>,
    flush_waiters: Vec<(u64, oneshot::Sender<()>)>,

    next_seq: u64,
    rate_wake: Option<Instant>,
    draining: bool,
}

impl Scheduler {
    async fn run(mut self) {
        loop {
            let now = Instant::now();
            self.admit_due_retries(now);
            self.dispatch(now);
            if self.draining && self.is_idle() {
                break;
            }
            let wake = self.next_wake();

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.drain_cancelled().await;
                    break;
                }
                command = self.receiver.recv(), if !self.draining => {
                    match command {
                        Ok(Command::Write { write, producer }) => self.admit_write(write, producer),
                        Ok(Command::Flush { done }) => self.register_flush(done),
                        Err(_) => self.draining = true,
                    }
                    // batch up everything already queued behind it
                    self.drain_commands();
                }
                outcome = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    match outcome {
                        Some(Ok(batch)) => self.finish_batch(batch),
                        Some(Err(e)) => tracing::error!("batch task failed: {:?}", e),
                        None => {}
                    }
                }
                _ = tokio::time::sleep_until(wake.unwrap_or(now)), if wake.is_some() => {}
            }
        }

        tracing::trace!("bulk writer drained");
        let waiters = std::mem::take(&mut self.flush_waiters);
        for (_, done) in waiters {
            let _ = done.send(());
        }
    }

    fn drain_commands(&mut self) {
        loop {
            match self.receiver.try_recv() {
                Ok(Command::Write { write, producer }) => self.admit_write(write, producer),
                Ok(Command::Flush { done }) => self.register_flush(done),
                Err(async_channel::TryRecvError::Empty) => break,
                Err(async_channel::TryRecvError::Closed) => {
                    self.draining = true;
                    break;
                }
            }
        }
    }

    fn admit_write(&mut self, write: Write, producer: oneshot::Sender<Result<WriteResult, WriteError>>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let doc = write.path.to_string();
        let mut backoff = ExponentialBackoff::default();
        if let Some(seed) = self.backoff_seed {
            backoff = backoff.with_seed(seed.wrapping_add(seq));
        }
        self.unresolved.insert(seq);
        self.pending.insert(
            seq,
            QueuedWrite {
                seq,
                write,
                doc,
                producer,
                failed_attempts: 0,
                backoff,
            },
        );
    }

    fn register_flush(&mut self, done: oneshot::Sender<()>) {
        let target = self.next_seq.saturating_sub(1);
        self.flush_waiters.push((target, done));
        self.notify_flush_waiters();
    }

    /// Moves retries whose delay elapsed back into the pending queue at
    /// their original sequence position.
    fn admit_due_retries(&mut self, now: Instant) {
        loop {
            match self.retry_heap.peek() {
                Some(Reverse(entry)) if entry.ready_at <= now => {}
                _ => break,
            }
            let Reverse(entry) = self.retry_heap.pop().unwrap();
            if let Some(op) = self.parked.remove(&entry.seq) {
                match self.retrying_docs.get_mut(&op.doc) {
                    Some(count) if *count > 1 => *count -= 1,
                    _ => {
                        self.retrying_docs.remove(&op.doc);
                    }
                }
                self.pending.insert(op.seq, op);
            }
        }
    }

    /// Greedily forms and dispatches batches. A document already owned by an
    /// in-flight batch, or with an earlier write waiting out a backoff,
    /// blocks its later writes. The rate limiter is consulted per batch;
    /// a denied batch holds everything behind it (first come, first served).
    fn dispatch(&mut self, now: Instant) {
        if let Some(wake) = self.rate_wake {
            if wake > now {
                return;
            }
            self.rate_wake = None;
        }
        loop {
            let mut batch_seqs: Vec<u64> = Vec::new();
            let mut batch_docs: HashSet<&str> = HashSet::new();
            for (seq, queued) in self.pending.iter() {
                if batch_seqs.len() >= MAX_BATCH_SIZE {
                    break;
                }
                if self.in_flight_docs.contains(&queued.doc)
                    || self.retrying_docs.contains_key(&queued.doc)
                    || batch_docs.contains(queued.doc.as_str())
                {
                    continue;
                }
                batch_docs.insert(queued.doc.as_str());
                batch_seqs.push(*seq);
            }
            if batch_seqs.is_empty() {
                return;
            }
            if let Some(wait) = self.limiter.try_acquire(batch_seqs.len()) {
                self.rate_wake = Some(now + wait);
                return;
            }
            self.send_batch(batch_seqs);
        }
    }

    fn send_batch(&mut self, seqs: Vec<u64>) {
        let mut writes = Vec::with_capacity(seqs.len());
        for seq in &seqs {
            let queued = self.pending.remove(seq).unwrap();
            self.in_flight_docs.insert(queued.doc.clone());
            writes.push(queued.write.clone());
            self.dispatched.insert(*seq, queued);
        }
        tracing::trace!("dispatching batch of {} write(s)", writes.len());
        let client = self.client.clone();
        let database = self.database.clone();
        let cancel = self.cancel.child_token();
        self.in_flight.spawn(async move {
            let result = client
                .batch_write(BatchWriteRequest { database, writes }, Some(cancel), None)
                .await;
            BatchOutcome { seqs, result }
        });
    }

    fn finish_batch(&mut self, outcome: BatchOutcome) {
        let now = Instant::now();
        let ops: Vec<QueuedWrite> = outcome
            .seqs
            .iter()
            .filter_map(|seq| self.dispatched.remove(seq))
            .collect();
        for op in &ops {
            self.in_flight_docs.remove(&op.doc);
        }

        match outcome.result {
            Ok(response) => {
                for (i, op) in ops.into_iter().enumerate() {
                    let code = response.statuses.get(i).map(|s| s.code()).unwrap_or(Code::Internal);
                    if code == Code::Ok {
                        let result = response
                            .write_results
                            .get(i)
                            .cloned()
                            .unwrap_or(WriteResult { update_time: None });
                        self.succeed(op, result);
                    } else {
                        let message = response
                            .statuses
                            .get(i)
                            .map(|s| s.message().to_string())
                            .unwrap_or_default();
                        self.fail_or_retry(op, code, message, now);
                    }
                }
            }
            // a whole-batch failure fans out to every write in it
            Err(status) => {
                let code = status.code();
                let message = status.message().to_string();
                for op in ops {
                    self.fail_or_retry(op, code, message.clone(), now);
                }
            }
        }
    }

    fn succeed(&mut self, op: QueuedWrite, result: WriteResult) {
        if let Some(on_success) = &self.on_success {
            on_success(&op.write.path, &result);
        }
        self.mark_resolved(op.seq);
        if op.producer.send(Ok(result)).is_err() {
            tracing::trace!("write result receiver dropped: {}", op.doc);
        }
    }

    fn fail_or_retry(&mut self, mut op: QueuedWrite, code: Code, message: String, now: Instant) {
        op.failed_attempts += 1;
        let error = WriteError {
            code,
            message,
            failed_attempts: op.failed_attempts,
            path: op.doc.clone(),
        };
        let decision = match &self.retry {
            Some(predicate) => predicate(code, op.failed_attempts, &error),
            None => RetryDecision::Default,
        };
        let should_retry = match decision {
            RetryDecision::Retry => true,
            RetryDecision::Stop => false,
            RetryDecision::Default => default_should_retry(code, op.failed_attempts, self.max_attempts),
        };

        if should_retry {
            let delay = op.backoff.next().unwrap_or(Duration::ZERO);
            tracing::debug!(
                "retrying write to {} (attempt {}) in {:?}: {:?}",
                op.doc,
                op.failed_attempts,
                delay,
                code
            );
            *self.retrying_docs.entry(op.doc.clone()).or_insert(0) += 1;
            self.retry_heap.push(Reverse(RetryEntry {
                ready_at: now + delay,
                seq: op.seq,
            }));
            self.parked.insert(op.seq, op);
        } else {
            if let Some(on_error) = &self.on_error {
                on_error(&error);
            }
            self.mark_resolved(op.seq);
            if op.producer.send(Err(error)).is_err() {
                tracing::trace!("write error receiver dropped: {}", op.doc);
            }
        }
    }

    fn mark_resolved(&mut self, seq: u64) {
        self.unresolved.remove(&seq);
        self.notify_flush_waiters();
    }

    fn notify_flush_waiters(&mut self) {
        let mut i = 0;
        while i < self.flush_waiters.len() {
            let target = self.flush_waiters[i].0;
            if self.unresolved.range(..=target).next().is_none() {
                let (_, done) = self.flush_waiters.swap_remove(i);
                let _ = done.send(());
            } else {
                i += 1;
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let retry = self.retry_heap.peek().map(|Reverse(entry)| entry.ready_at);
        match (retry, self.rate_wake) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.parked.is_empty() && self.dispatched.is_empty()
    }

    /// Cancellation drains everything with a `Cancelled` error and stops.
    async fn drain_cancelled(&mut self) {
        self.receiver.close();
        while let Ok(command) = self.receiver.try_recv() {
            match command {
                Command::Write { write, producer } => {
                    let _ = producer.send(Err(WriteError {
                        code: Code::Cancelled,
                        message: "bulk writer cancelled".to_string(),
                        failed_attempts: 0,
                        path: write.path.to_string(),
                    }));
                }
                Command::Flush { done } => {
                    let _ = done.send(());
                }
            }
        }

        self.in_flight.shutdown().await;
        let dispatched = std::mem::take(&mut self.dispatched);
        let pending = std::mem::take(&mut self.pending);
        let parked = std::mem::take(&mut self.parked);
        for (_, op) in dispatched.into_iter().chain(parked).chain(pending) {
            let error = WriteError {
                code: Code::Cancelled,
                message: "bulk writer cancelled".to_string(),
                failed_attempts: op.failed_attempts,
                path: op.doc.clone(),
            };
            if let Some(on_error) = &self.on_error {
                on_error(&error);
            }
            self.mark_resolved(op.seq);
            let _ = op.producer.send(Err(error));
        }
        self.retry_heap.clear();
        self.retrying_docs.clear();
        self.in_flight_docs.clear();
    }
}
