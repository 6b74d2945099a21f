use std::sync::Arc;
use std::time::Duration;

use docstore_gax::grpc::Code;
use docstore_gax::retry::RetrySetting;

use crate::write::WriteError;

/// Coarse classification of server status codes, used to decide whether an
/// operation failed for good or is worth another attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Ok,
    /// Retry may succeed without user intervention.
    Transient,
    /// Lost a race with a concurrent writer.
    Contention,
    Permission,
    Invalid,
    NotFound,
    AlreadyExists,
    Unavailable,
    Deadline,
    Internal,
    Unauthenticated,
    Fatal,
}

pub fn classify(code: Code) -> ErrorClass {
    match code {
        Code::Ok => ErrorClass::Ok,
        Code::Aborted => ErrorClass::Contention,
        Code::Unavailable => ErrorClass::Unavailable,
        Code::DeadlineExceeded => ErrorClass::Deadline,
        Code::Internal => ErrorClass::Internal,
        Code::ResourceExhausted | Code::Unknown => ErrorClass::Transient,
        Code::PermissionDenied => ErrorClass::Permission,
        Code::InvalidArgument | Code::OutOfRange | Code::FailedPrecondition => ErrorClass::Invalid,
        Code::NotFound => ErrorClass::NotFound,
        Code::AlreadyExists => ErrorClass::AlreadyExists,
        Code::Unauthenticated => ErrorClass::Unauthenticated,
        Code::Cancelled | Code::Unimplemented | Code::DataLoss => ErrorClass::Fatal,
    }
}

impl ErrorClass {
    /// True for classes a retry may recover from.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::Transient
                | ErrorClass::Contention
                | ErrorClass::Unavailable
                | ErrorClass::Deadline
                | ErrorClass::Internal
        )
    }
}

/// Codes on which an interrupted batch-get may be re-issued.
pub const BATCH_GET_RETRY_CODES: [Code; 3] = [Code::Unavailable, Code::Internal, Code::DeadlineExceeded];

/// Codes on which a transaction attempt is rerun.
pub const COMMIT_RETRY_CODES: [Code; 3] = [Code::Aborted, Code::Unavailable, Code::Internal];

/// Codes the bulk writer retries by default.
pub const BULK_WRITER_RETRY_CODES: [Code; 7] = [
    Code::Cancelled,
    Code::Unknown,
    Code::Internal,
    Code::Unavailable,
    Code::DeadlineExceeded,
    Code::ResourceExhausted,
    Code::Aborted,
];

pub fn batch_get_retry_setting() -> RetrySetting {
    RetrySetting {
        codes: BATCH_GET_RETRY_CODES.to_vec(),
        ..Default::default()
    }
}

pub fn commit_retry_setting() -> RetrySetting {
    RetrySetting {
        codes: COMMIT_RETRY_CODES.to_vec(),
        ..Default::default()
    }
}

pub fn bulk_writer_retry_setting() -> RetrySetting {
    RetrySetting {
        codes: BULK_WRITER_RETRY_CODES.to_vec(),
        ..Default::default()
    }
}

/// A setting that surfaces the first error. Used for RPCs whose retry policy
/// lives in a higher layer.
pub(crate) fn no_retry() -> RetrySetting {
    RetrySetting {
        take: 0,
        codes: vec![],
        ..Default::default()
    }
}

pub(crate) fn in_commit_retry_set(code: Code) -> bool {
    COMMIT_RETRY_CODES.contains(&code)
}

pub(crate) fn in_batch_get_retry_set(code: Code) -> bool {
    BATCH_GET_RETRY_CODES.contains(&code)
}

/// The verdict of a user-supplied retry predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Stop,
    /// Defer to the default policy.
    Default,
}

/// User hook consulted for each failed bulk write: receives the status code,
/// the failed-attempt count and the error itself.
pub type WriteRetryPredicate = Arc<dyn Fn(Code, u32, &WriteError) -> RetryDecision + Send + Sync>;

/// The default bulk-writer policy: transient codes, bounded by `max_attempts`.
pub(crate) fn default_should_retry(code: Code, failed_attempts: u32, max_attempts: u32) -> bool {
    failed_attempts < max_attempts && BULK_WRITER_RETRY_CODES.contains(&code)
}

/// Default per-RPC operation deadline.
pub const DEFAULT_RPC_DEADLINE: Duration = Duration::from_secs(600);
