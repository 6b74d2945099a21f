//! Semantic request and response types for the document service. The wire
//! encoding is owned by the transport behind [`crate::apiv1::DocumentService`].

use prost_types::Timestamp;

use docstore_gax::grpc::Status;

use crate::value::Fields;
use crate::write::{Write, WriteResult};

/// A document as returned by the server.
#[derive(Clone, Debug)]
pub struct Document {
    /// Full canonical resource name.
    pub name: String,
    pub fields: Fields,
    pub create_time: Option<Timestamp>,
    pub update_time: Option<Timestamp>,
}

#[derive(Clone, Debug)]
pub enum BatchGetResult {
    Found(Document),
    /// Canonical resource name of a document that does not exist.
    Missing(String),
}

/// One element of the batch-get response stream.
#[derive(Clone, Debug)]
pub struct BatchGetResponseItem {
    pub result: BatchGetResult,
    pub read_time: Option<Timestamp>,
    /// Set on the first response when a new transaction was requested.
    pub transaction: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub enum TransactionMode {
    ReadOnly { read_time: Option<Timestamp> },
    ReadWrite,
}

#[derive(Clone, Debug)]
pub struct TransactionOptions {
    pub mode: TransactionMode,
}

/// Read consistency for a batch-get: at most one of an existing transaction,
/// a new transaction, or a point-in-time read.
#[derive(Clone, Debug)]
pub enum ConsistencySelector {
    Transaction(Vec<u8>),
    NewTransaction(TransactionOptions),
    ReadTime(Timestamp),
}

#[derive(Clone, Debug)]
pub struct BatchGetRequest {
    /// `projects/{project}/databases/{database}`
    pub database: String,
    /// Canonical document names, in the order results should be assembled.
    pub documents: Vec<String>,
    /// Encoded field paths to return; `None` returns all fields.
    pub mask: Option<Vec<String>>,
    pub consistency: Option<ConsistencySelector>,
}

#[derive(Clone, Debug)]
pub struct BeginTransactionRequest {
    pub database: String,
    pub options: TransactionOptions,
}

#[derive(Clone, Debug)]
pub struct BeginTransactionResponse {
    pub transaction: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct CommitRequest {
    pub database: String,
    pub writes: Vec<Write>,
    /// Token of the transaction to commit; `None` applies the writes as a
    /// single atomic batch.
    pub transaction: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct CommitResponse {
    pub commit_time: Option<Timestamp>,
    pub write_results: Vec<WriteResult>,
}

#[derive(Clone, Debug)]
pub struct RollbackRequest {
    pub database: String,
    pub transaction: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct BatchWriteRequest {
    pub database: String,
    pub writes: Vec<Write>,
}

/// Non-transactional bulk response: one status per write, aligned by index,
/// with a result for every write that succeeded.
#[derive(Debug)]
pub struct BatchWriteResponse {
    pub write_results: Vec<WriteResult>,
    pub statuses: Vec<Status>,
}
