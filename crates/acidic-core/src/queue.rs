//! Job queue port.
//!
//! The queue is an external collaborator: it delivers jobs at least once and
//! owns retries and backoff. The engine only ever hands it a serialized job,
//! either to start an awaited job or to resume an awaiting one.

use acidic_types::error::QueueError;
use acidic_types::job::SerializedJob;

/// Storage-agnostic handle to the job executor backend.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait JobQueue: Send + Sync {
    /// Name of the backend, matched against a job class's declared adapter.
    fn adapter_name(&self) -> &str;

    /// Hand a job to the queue for asynchronous execution.
    ///
    /// The queue reconstructs the job from `job.job_class` and
    /// `job.arguments` and must preserve `job.job_id`.
    fn enqueue(
        &self,
        job: SerializedJob,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;
}
