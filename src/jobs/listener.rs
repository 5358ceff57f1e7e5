use super::models::Job;

/// Observer of job status changes made by a [`JobMaster`](super::JobMaster).
///
/// Callbacks run on the worker thread processing the job and receive the job
/// as persisted after the change.
pub trait JobStatusListener: Send + Sync {
    /// The job was claimed and is about to run.
    fn on_processing(&self, _job: &Job) {}

    fn on_finished(&self, _job: &Job) {}

    /// An attempt failed. The job is NEW again if it will be retried,
    /// MAX_TRIES_EXCEEDED otherwise.
    fn on_failed(&self, _job: &Job) {}
}
