use prost_types::{Timestamp, Value};

use docstore_gax::cancel::CancellationToken;

use crate::apiv1::model::{
    CommitRequest, CommitResponse, ConsistencySelector, RollbackRequest, TransactionMode, TransactionOptions,
};
use crate::apiv1::Client;
use crate::client::Error;
use crate::document::DocumentSnapshot;
use crate::path::{DocumentPath, FieldPath};
use crate::reader;
use crate::value::Fields;
use crate::write::{Precondition, Write};

/// Progress of one transaction attempt. Illegal transitions surface as
/// InvalidArgument before any RPC is issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    NotStarted,
    Reading,
    Writing,
    Committing,
    Done,
    Failed,
}

/// One attempt of a transactional unit of work.
///
/// The transaction begins lazily: the first read carries new-transaction
/// options and the server-issued token ties all subsequent reads and the
/// commit together. Writes are buffered locally and ship only at commit.
pub struct Transaction {
    client: Client,
    database: String,
    read_only: bool,
    read_time: Option<Timestamp>,
    token: Option<Vec<u8>>,
    writes: Vec<Write>,
    state: State,
    cancel: Option<CancellationToken>,
}

impl Transaction {
    pub(crate) fn new(
        client: Client,
        database: String,
        read_only: bool,
        read_time: Option<Timestamp>,
        cancel: Option<CancellationToken>,
    ) -> Self {
        Self {
            client,
            database,
            read_only,
            read_time,
            token: None,
            writes: vec![],
            state: State::NotStarted,
            cancel,
        }
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Reads a single document under the transaction.
    pub async fn get(&mut self, path: &DocumentPath) -> Result<DocumentSnapshot, Error> {
        let mut snapshots = self.batch_get(std::slice::from_ref(path), None).await?;
        Ok(snapshots.pop().unwrap())
    }

    /// Reads several documents under the transaction, in input order.
    pub async fn batch_get(
        &mut self,
        paths: &[DocumentPath],
        mask: Option<&[FieldPath]>,
    ) -> Result<Vec<DocumentSnapshot>, Error> {
        match self.state {
            State::NotStarted | State::Reading => {}
            State::Writing => {
                return Err(Error::InvalidArgument(
                    "cannot read after writes are buffered in this transaction".to_string(),
                ))
            }
            _ => return Err(Error::InvalidArgument("transaction is no longer active".to_string())),
        }

        let consistency = match &self.token {
            Some(token) => ConsistencySelector::Transaction(token.clone()),
            None => match (self.read_only, self.read_time.clone()) {
                (true, Some(read_time)) => ConsistencySelector::ReadTime(read_time),
                (read_only, _) => ConsistencySelector::NewTransaction(TransactionOptions {
                    mode: if read_only {
                        TransactionMode::ReadOnly { read_time: None }
                    } else {
                        TransactionMode::ReadWrite
                    },
                }),
            },
        };

        let outcome = reader::read_documents(
            &self.client,
            &self.database,
            paths,
            mask,
            Some(consistency),
            self.cancel.clone(),
        )
        .await?;

        if self.token.is_none() {
            self.token = outcome.transaction;
        }
        self.state = State::Reading;
        Ok(outcome.snapshots)
    }

    /// Buffers a validated write. Nothing is sent until commit.
    pub fn buffer_write(&mut self, write: Write) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::InvalidArgument(
                "cannot write in a read-only transaction".to_string(),
            ));
        }
        match self.state {
            State::NotStarted | State::Reading | State::Writing => {}
            _ => return Err(Error::InvalidArgument("transaction is no longer active".to_string())),
        }
        self.writes.push(write);
        self.state = State::Writing;
        Ok(())
    }

    pub fn create(&mut self, path: DocumentPath, fields: Fields) -> Result<(), Error> {
        self.buffer_write(Write::create(path, fields))
    }

    pub fn set(&mut self, path: DocumentPath, fields: Fields) -> Result<(), Error> {
        self.buffer_write(Write::set(path, fields))
    }

    pub fn set_merge(&mut self, path: DocumentPath, fields: Fields, merge: Vec<FieldPath>) -> Result<(), Error> {
        self.buffer_write(Write::set_merge(path, fields, merge)?)
    }

    pub fn update(
        &mut self,
        path: DocumentPath,
        entries: impl IntoIterator<Item = (FieldPath, Value)>,
    ) -> Result<(), Error> {
        self.buffer_write(Write::update(path, entries)?)
    }

    pub fn delete(&mut self, path: DocumentPath) -> Result<(), Error> {
        self.buffer_write(Write::delete(path))
    }

    pub fn delete_with(&mut self, path: DocumentPath, precondition: Precondition) -> Result<(), Error> {
        self.buffer_write(Write::delete(path).with_precondition(precondition)?)
    }

    /// Commits the buffered writes. Read-only transactions have nothing to
    /// commit; the token alone closed the unit of work.
    pub(crate) async fn commit(&mut self) -> Result<CommitResponse, Error> {
        match self.state {
            State::NotStarted | State::Reading | State::Writing => {}
            _ => return Err(Error::InvalidArgument("transaction is no longer active".to_string())),
        }
        self.state = State::Committing;

        if self.read_only {
            self.state = State::Done;
            return Ok(CommitResponse {
                commit_time: None,
                write_results: vec![],
            });
        }

        let request = CommitRequest {
            database: self.database.clone(),
            writes: std::mem::take(&mut self.writes),
            transaction: self.token.clone(),
        };
        match self.client.commit(request, self.cancel.clone(), None).await {
            Ok(response) => {
                self.state = State::Done;
                Ok(response)
            }
            Err(status) => {
                self.state = State::Failed;
                Err(Error::Grpc(status))
            }
        }
    }

    /// Best-effort rollback; errors are logged and swallowed.
    pub(crate) async fn rollback(&mut self) {
        self.state = State::Failed;
        if self.read_only {
            return;
        }
        let token = match self.token.take() {
            Some(token) => token,
            None => return,
        };
        let request = RollbackRequest {
            database: self.database.clone(),
            transaction: token,
        };
        if let Err(status) = self.client.rollback(request, self.cancel.clone(), None).await {
            tracing::debug!("rollback failed, ignoring: {:?}", status);
        }
    }
}
