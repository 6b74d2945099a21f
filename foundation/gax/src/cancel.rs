//! Cancellation and deadline bounding for RPC invocations.

use std::future::Future;
use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

use crate::grpc::Status;

/// Runs `fut` bounded by an optional cancellation token and an optional
/// operation deadline.
///
/// Cancellation resolves the call to `Cancelled` and an elapsed deadline to
/// `DeadlineExceeded`; otherwise the future's own result is passed through.
/// The retry loops in [`crate::retry`] bound the whole retry chain with a
/// token, while per-attempt deadlines are applied by the RPC wrappers.
pub async fn bounded<R, E>(
    cancel: Option<CancellationToken>,
    deadline: Option<Duration>,
    fut: impl Future<Output = Result<R, E>>,
) -> Result<R, E>
where
    E: From<Status>,
{
    let limited = async {
        match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, fut).await {
                Ok(result) => result,
                Err(_) => Err(Status::deadline_exceeded("operation deadline exceeded").into()),
            },
            None => fut.await,
        }
    };
    match cancel {
        Some(cancel) => {
            tokio::select! {
                _ = cancel.cancelled() => Err(Status::cancelled("client cancel").into()),
                result = limited => result,
            }
        }
        None => limited.await,
    }
}
