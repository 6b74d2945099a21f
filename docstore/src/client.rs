use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;

use docstore_gax::cancel::CancellationToken;
use docstore_gax::grpc::Status;
use docstore_gax::retry::{CodeCondition, Retry, RetrySetting, TryAs};
use prost_types::Timestamp;

use crate::apiv1::{Client as ApiClient, DocumentService};
use crate::bulk_writer::{BulkWriter, BulkWriterConfig};
use crate::document::DocumentSnapshot;
use crate::path::{CollectionPath, DocumentPath, PathError, ResourcePath};
use crate::reader;
use crate::retry::{commit_retry_setting, in_commit_retry_set};
use crate::transaction::Transaction;
use crate::value::timestamp_from;

/// Environment variable naming the emulator endpoint. When set, the
/// transport rewrites URLs and authenticates with the fixed `owner` token;
/// client behavior is otherwise unchanged.
pub const EMULATOR_HOST_ENV: &str = "DOCSTORE_EMULATOR_HOST";

/// Environment variable supplying the project id when the config leaves it
/// unset.
pub const PROJECT_ID_ENV: &str = "DOCSTORE_PROJECT_ID";

/// Oldest read time accepted for a point-in-time read-only transaction.
const MAX_READ_TIME_STALENESS_SECS: i64 = 270;

const DEFAULT_DATABASE_ID: &str = "(default)";
const DEFAULT_RW_MAX_ATTEMPTS: u32 = 5;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Grpc(#[from] Status),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl TryAs<Status> for Error {
    fn try_as(&self) -> Option<&Status> {
        match self {
            Error::Grpc(status) => Some(status),
            _ => None,
        }
    }
}

impl From<PathError> for Error {
    fn from(e: PathError) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}

/// ClientConfig has configurations for the client.
pub struct ClientConfig {
    /// Project id; falls back to `DOCSTORE_PROJECT_ID` when unset.
    pub project_id: Option<String>,
    /// Database id within the project.
    pub database_id: String,
    /// Environment map consulted once at construction. `None` captures the
    /// process environment; tests inject their own map.
    pub environment: Option<HashMap<String, String>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            project_id: None,
            database_id: DEFAULT_DATABASE_ID.to_string(),
            environment: None,
        }
    }
}

/// Options for [`Client::run_transaction`].
#[derive(Clone, Debug)]
pub struct TransactionOptions {
    pub read_only: bool,
    /// Point-in-time read; valid only with `read_only` and at most 270 s in
    /// the past.
    pub read_time: Option<OffsetDateTime>,
    /// Attempt budget for read-write transactions. Read-only transactions
    /// always fail fast.
    pub max_attempts: u32,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        TransactionOptions {
            read_only: false,
            read_time: None,
            max_attempts: DEFAULT_RW_MAX_ATTEMPTS,
        }
    }
}

/// Client is a client for reading and writing data of one document database.
/// A client is safe to use concurrently.
pub struct Client {
    service: ApiClient,
    database: String,
    project_id: String,
    database_id: String,
    emulator_host: Option<String>,
    cancel: CancellationToken,
}

impl Client {
    /// Creates a client for the database selected by `config`, speaking
    /// through the given transport. Project id and emulator host are
    /// resolved from the environment once, here.
    pub fn new(service: Arc<dyn DocumentService>, config: ClientConfig) -> Result<Self, Error> {
        let environment = config
            .environment
            .unwrap_or_else(|| std::env::vars().collect());
        let project_id = match config.project_id.or_else(|| environment.get(PROJECT_ID_ENV).cloned()) {
            Some(project_id) if !project_id.is_empty() => project_id,
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "project id is required (set it in the config or via {PROJECT_ID_ENV})"
                )))
            }
        };
        let emulator_host = environment.get(EMULATOR_HOST_ENV).cloned();
        if let Some(host) = &emulator_host {
            tracing::debug!("using emulator at {}", host);
        }
        let database = format!("projects/{}/databases/{}", project_id, config.database_id);
        Ok(Client {
            service: ApiClient::new(service),
            database,
            project_id,
            database_id: config.database_id,
            emulator_host,
            cancel: CancellationToken::new(),
        })
    }

    /// `projects/{project}/databases/{database}`
    pub fn database(&self) -> &str {
        &self.database
    }

    /// The emulator endpoint resolved at construction, if any. Transports
    /// consult this to rewrite URLs.
    pub fn emulator_host(&self) -> Option<&str> {
        self.emulator_host.as_deref()
    }

    /// Resolves a `collection/doc/...` relative path to a document path.
    pub fn doc(&self, relative: &str) -> Result<DocumentPath, Error> {
        Ok(DocumentPath::from_relative(&self.project_id, &self.database_id, relative)?)
    }

    /// Resolves a relative path to a collection path.
    pub fn collection(&self, relative: &str) -> Result<CollectionPath, Error> {
        let path = ResourcePath::root(self.project_id.clone(), self.database_id.clone()).append_relative(relative)?;
        Ok(CollectionPath::new(path)?)
    }

    /// Creates a bulk writer bound to this database.
    pub fn bulk_writer(&self, config: BulkWriterConfig) -> Result<BulkWriter, Error> {
        BulkWriter::new(
            self.service.clone(),
            self.database.clone(),
            self.cancel.child_token(),
            config,
        )
    }

    /// Reads documents outside any transaction. Interrupted streams are
    /// re-issued for the unreceived documents.
    pub async fn batch_get(
        &self,
        paths: &[DocumentPath],
        mask: Option<&[crate::path::FieldPath]>,
    ) -> Result<Vec<DocumentSnapshot>, Error> {
        let outcome = reader::read_documents(
            &self.service,
            &self.database,
            paths,
            mask,
            None,
            Some(self.cancel.child_token()),
        )
        .await?;
        Ok(outcome.snapshots)
    }

    /// Runs `f` in a transaction, with retries as necessary.
    ///
    /// The function may be called multiple times; it must not keep state
    /// between calls. When the commit (or any read) fails with a contention
    /// or transient code the whole function is rerun against a fresh
    /// transaction, after a backoff sleep, up to `max_attempts` times. The
    /// last server error is surfaced once attempts are exhausted.
    pub async fn run_transaction<T, E, F>(
        &self,
        f: impl Fn(Arc<Mutex<Transaction>>) -> F,
        options: Option<TransactionOptions>,
    ) -> Result<(Option<Timestamp>, T), E>
    where
        E: TryAs<Status> + From<Error>,
        F: Future<Output = Result<T, E>>,
    {
        let options = options.unwrap_or_default();
        let read_time = Self::validate_read_time(&options).map_err(E::from)?;
        let max_attempts = if options.read_only { 1 } else { options.max_attempts.max(1) };

        let setting = commit_retry_setting();
        let mut backoff = <RetrySetting as Retry<Status, CodeCondition>>::strategy(&setting);

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let tx = Arc::new(Mutex::new(Transaction::new(
                self.service.clone(),
                self.database.clone(),
                options.read_only,
                read_time.clone(),
                Some(self.cancel.child_token()),
            )));

            let result = f(tx.clone()).await;
            let mut locked = tx.lock().await;
            let error = match result {
                Ok(value) => match locked.commit().await {
                    Ok(response) => return Ok((response.commit_time, value)),
                    Err(commit_error) => E::from(commit_error),
                },
                Err(user_error) => user_error,
            };

            let retryable = error
                .try_as()
                .map(|status| in_commit_retry_set(status.code()))
                .unwrap_or(false);
            if retryable && attempts < max_attempts {
                locked.rollback().await;
                drop(locked);
                if let Some(delay) = backoff.next() {
                    tracing::debug!("transaction attempt {} failed, retrying in {:?}", attempts, delay);
                    tokio::time::sleep(delay).await;
                }
                continue;
            }

            locked.rollback().await;
            return Err(error);
        }
    }

    fn validate_read_time(options: &TransactionOptions) -> Result<Option<Timestamp>, Error> {
        let read_time = match options.read_time {
            Some(read_time) => read_time,
            None => return Ok(None),
        };
        if !options.read_only {
            return Err(Error::InvalidArgument(
                "read_time is only valid for read-only transactions".to_string(),
            ));
        }
        let age = OffsetDateTime::now_utc() - read_time;
        if age > time::Duration::seconds(MAX_READ_TIME_STALENESS_SECS) {
            return Err(Error::InvalidArgument(format!(
                "read_time must be at most {MAX_READ_TIME_STALENESS_SECS}s in the past"
            )));
        }
        Ok(Some(timestamp_from(read_time)))
    }

    /// Cancels every in-flight RPC issued through this client and prevents
    /// new dispatches. Bulk writers drain their callbacks with `Cancelled`.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_project_id_from_environment() {
        let environment: HashMap<String, String> =
            [(PROJECT_ID_ENV.to_string(), "env-project".to_string())].into();
        let config = ClientConfig {
            environment: Some(environment),
            ..Default::default()
        };
        // the service is never called here
        let client = Client::new(crate::apiv1::test_support::unreachable_service(), config).unwrap();
        assert_eq!(client.database(), "projects/env-project/databases/(default)");
        assert!(client.emulator_host().is_none());
    }

    #[test]
    fn test_missing_project_id() {
        let config = ClientConfig {
            environment: Some(HashMap::new()),
            ..Default::default()
        };
        let result = Client::new(crate::apiv1::test_support::unreachable_service(), config);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_emulator_host_resolution() {
        let environment: HashMap<String, String> = [
            (PROJECT_ID_ENV.to_string(), "p".to_string()),
            (EMULATOR_HOST_ENV.to_string(), "localhost:8080".to_string()),
        ]
        .into();
        let config = ClientConfig {
            environment: Some(environment),
            ..Default::default()
        };
        let client = Client::new(crate::apiv1::test_support::unreachable_service(), config).unwrap();
        assert_eq!(client.emulator_host(), Some("localhost:8080"));
    }

    #[test]
    fn test_read_time_requires_read_only() {
        let options = TransactionOptions {
            read_only: false,
            read_time: Some(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        assert!(Client::validate_read_time(&options).is_err());

        let stale = TransactionOptions {
            read_only: true,
            read_time: Some(OffsetDateTime::now_utc() - Duration::from_secs(600)),
            ..Default::default()
        };
        assert!(Client::validate_read_time(&stale).is_err());

        let fresh = TransactionOptions {
            read_only: true,
            read_time: Some(OffsetDateTime::now_utc() - Duration::from_secs(60)),
            ..Default::default()
        };
        assert!(Client::validate_read_time(&fresh).unwrap().is_some());
    }
}
