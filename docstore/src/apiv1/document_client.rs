use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use docstore_gax::cancel::{bounded, CancellationToken};
use docstore_gax::grpc::Status;
use docstore_gax::retry::{invoke, RetrySetting};

use crate::apiv1::model::{
    BatchGetRequest, BatchGetResponseItem, BatchWriteRequest, BatchWriteResponse, BeginTransactionRequest,
    BeginTransactionResponse, CommitRequest, CommitResponse, RollbackRequest,
};
use crate::retry::{no_retry, DEFAULT_RPC_DEADLINE};

pub type BatchGetStream = BoxStream<'static, Result<BatchGetResponseItem, Status>>;

/// The transport seam: a semantic view of the document service RPCs.
///
/// Production transports speak the wire protocol behind this trait; tests
/// provide scripted implementations.
#[async_trait]
pub trait DocumentService: Send + Sync {
    async fn batch_get_documents(&self, req: BatchGetRequest) -> Result<BatchGetStream, Status>;

    async fn begin_transaction(&self, req: BeginTransactionRequest) -> Result<BeginTransactionResponse, Status>;

    async fn commit(&self, req: CommitRequest) -> Result<CommitResponse, Status>;

    async fn rollback(&self, req: RollbackRequest) -> Result<(), Status>;

    async fn batch_write(&self, req: BatchWriteRequest) -> Result<BatchWriteResponse, Status>;
}

/// Thin wrapper over the transport. Each attempt is bounded by the
/// operation deadline, the whole call by the cancellation token, both via
/// [`docstore_gax::cancel::bounded`].
///
/// Commit and batch-write are not idempotent, so their retry policy is owned
/// by the caller; passing `None` performs exactly one attempt.
#[derive(Clone)]
pub struct Client {
    inner: Arc<dyn DocumentService>,
    deadline: Duration,
}

impl Client {
    pub fn new(inner: Arc<dyn DocumentService>) -> Client {
        Client {
            inner,
            deadline: DEFAULT_RPC_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Client {
        self.deadline = deadline;
        self
    }

    fn get_call_setting(opt: Option<RetrySetting>) -> RetrySetting {
        opt.unwrap_or_else(no_retry)
    }

    pub async fn batch_get_documents(
        &self,
        req: BatchGetRequest,
        cancel: Option<CancellationToken>,
        retry: Option<RetrySetting>,
    ) -> Result<BatchGetStream, Status> {
        let setting = Self::get_call_setting(retry);
        invoke(
            cancel,
            Some(setting),
            || bounded(None, Some(self.deadline), self.inner.batch_get_documents(req.clone())),
        )
        .await
    }

    pub async fn begin_transaction(
        &self,
        req: BeginTransactionRequest,
        cancel: Option<CancellationToken>,
        retry: Option<RetrySetting>,
    ) -> Result<BeginTransactionResponse, Status> {
        let setting = Self::get_call_setting(retry);
        invoke(
            cancel,
            Some(setting),
            || bounded(None, Some(self.deadline), self.inner.begin_transaction(req.clone())),
        )
        .await
    }

    pub async fn commit(
        &self,
        req: CommitRequest,
        cancel: Option<CancellationToken>,
        retry: Option<RetrySetting>,
    ) -> Result<CommitResponse, Status> {
        let setting = Self::get_call_setting(retry);
        invoke(
            cancel,
            Some(setting),
            || bounded(None, Some(self.deadline), self.inner.commit(req.clone())),
        )
        .await
    }

    pub async fn rollback(
        &self,
        req: RollbackRequest,
        cancel: Option<CancellationToken>,
        retry: Option<RetrySetting>,
    ) -> Result<(), Status> {
        let setting = Self::get_call_setting(retry);
        invoke(
            cancel,
            Some(setting),
            || bounded(None, Some(self.deadline), self.inner.rollback(req.clone())),
        )
        .await
    }

    pub async fn batch_write(
        &self,
        req: BatchWriteRequest,
        cancel: Option<CancellationToken>,
        retry: Option<RetrySetting>,
    ) -> Result<BatchWriteResponse, Status> {
        let setting = Self::get_call_setting(retry);
        invoke(
            cancel,
            Some(setting),
            || bounded(None, Some(self.deadline), self.inner.batch_write(req.clone())),
        )
        .await
    }
}
