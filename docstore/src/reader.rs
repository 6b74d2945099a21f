use std::collections::HashMap;

use futures_util::StreamExt;
use prost_types::Timestamp;

use docstore_gax::cancel::CancellationToken;
use docstore_gax::grpc::Status;

use crate::apiv1::model::{BatchGetRequest, BatchGetResult, ConsistencySelector};
use crate::apiv1::Client;
use crate::document::DocumentSnapshot;
use crate::path::{DocumentPath, FieldPath};
use crate::retry::{batch_get_retry_setting, in_batch_get_retry_set};

/// The assembled result of a batch read.
pub struct BatchGetOutcome {
    /// Snapshots in the order the paths were requested.
    pub snapshots: Vec<DocumentSnapshot>,
    /// Token issued by the server when a new transaction was requested.
    pub transaction: Option<Vec<u8>>,
    pub read_time: Option<Timestamp>,
}

/// Reads a set of documents, reassembling the out-of-order response stream
/// into request order.
///
/// Outside a transaction a dropped stream is re-issued for the unreceived
/// documents only, provided the error is retryable and at least one result
/// arrived. Under any consistency selector the error is surfaced and the
/// caller owns the retry.
pub async fn read_documents(
    client: &Client,
    database: &str,
    paths: &[DocumentPath],
    mask: Option<&[FieldPath]>,
    consistency: Option<ConsistencySelector>,
    cancel: Option<CancellationToken>,
) -> Result<BatchGetOutcome, Status> {
    let mask: Option<Vec<String>> = mask.map(|paths| paths.iter().map(|p| p.to_string()).collect());
    let allow_partial_retry = consistency.is_none();

    let mut remaining: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
    let mut received: HashMap<String, DocumentSnapshot> = HashMap::with_capacity(paths.len());
    let mut transaction: Option<Vec<u8>> = None;
    let mut read_time: Option<Timestamp> = None;

    while !remaining.is_empty() {
        let request = BatchGetRequest {
            database: database.to_string(),
            documents: remaining.clone(),
            mask: mask.clone(),
            consistency: consistency.clone(),
        };
        let retry = allow_partial_retry.then(batch_get_retry_setting);
        let mut stream = client.batch_get_documents(request, cancel.clone(), retry).await?;

        let mut progress = 0usize;
        let mut stream_error: Option<Status> = None;
        while let Some(item) = stream.next().await {
            let item = match item {
                Ok(item) => item,
                Err(status) => {
                    stream_error = Some(status);
                    break;
                }
            };
            if transaction.is_none() {
                transaction = item.transaction;
            }
            if read_time.is_none() {
                read_time = item.read_time;
            }
            let snapshot = match item.result {
                BatchGetResult::Found(doc) => {
                    let path = DocumentPath::parse(&doc.name)
                        .map_err(|e| Status::internal(format!("malformed document name from server: {e}")))?;
                    DocumentSnapshot::found(path, doc.fields, item.read_time, doc.create_time, doc.update_time)
                }
                BatchGetResult::Missing(name) => {
                    let path = DocumentPath::parse(&name)
                        .map_err(|e| Status::internal(format!("malformed document name from server: {e}")))?;
                    DocumentSnapshot::missing(path, item.read_time)
                }
            };
            let name = snapshot.path.to_string();
            remaining.retain(|r| *r != name);
            received.insert(name, snapshot);
            progress += 1;
        }

        if let Some(status) = stream_error {
            if allow_partial_retry && progress > 0 && in_batch_get_retry_set(status.code()) {
                tracing::debug!(
                    "batch get interrupted after {} result(s), retrying {} document(s): {:?}",
                    progress,
                    remaining.len(),
                    status
                );
                continue;
            }
            return Err(status);
        }

        if !remaining.is_empty() {
            return Err(Status::internal(format!(
                "server closed the stream with {} document(s) unanswered",
                remaining.len()
            )));
        }
    }

    let mut snapshots = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path.to_string();
        let snapshot = received
            .get(&name)
            .cloned()
            .ok_or_else(|| Status::internal(format!("no response for document {name}")))?;
        snapshots.push(snapshot);
    }

    Ok(BatchGetOutcome {
        snapshots,
        transaction,
        read_time,
    })
}
