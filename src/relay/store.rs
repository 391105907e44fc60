use anyhow::Result;
use async_trait::async_trait;

use super::db::DbHandle;
use super::models::*;

/// Durable job and snapshot storage.
/// Real implementation: `DbHandle` over SQLite.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, new: NewJob) -> Result<Job>;

    async fn get_job(&self, id: i64) -> Result<Option<Job>>;

    /// Partial update. Fails with `StoreError::InvalidTransition` when the
    /// status change is not allowed from the current state.
    async fn update_job(&self, id: i64, update: JobUpdate) -> Result<Job>;

    async fn list_jobs_for_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<Job>>;

    async fn find_job_by_session(&self, session_id: &str) -> Result<Option<Job>>;

    /// Jobs in `pending`, `generating` or `paused`, oldest first.
    async fn list_unfinished_jobs(&self) -> Result<Vec<Job>>;

    /// Fails with `StoreError::SnapshotOutOfOrder` unless `iteration` is
    /// strictly greater than every stored iteration for the job.
    async fn create_snapshot(&self, new: NewSnapshot) -> Result<IterationSnapshot>;

    async fn get_snapshot(&self, job_id: i64, iteration: i64)
    -> Result<Option<IterationSnapshot>>;

    async fn list_snapshots_for_job(&self, job_id: i64) -> Result<Vec<IterationSnapshot>>;

    async fn delete_snapshot(&self, id: i64) -> Result<bool>;
}

#[async_trait]
impl JobStore for DbHandle {
    async fn create_job(&self, new: NewJob) -> Result<Job> {
        self.call(move |db| db.create_job(&new)).await
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        self.call(move |db| db.get_job(id)).await
    }

    async fn update_job(&self, id: i64, update: JobUpdate) -> Result<Job> {
        self.call(move |db| db.update_job(id, &update)).await
    }

    async fn list_jobs_for_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<Job>> {
        let owner_id = owner_id.to_string();
        self.call(move |db| db.list_jobs_for_owner(&owner_id, limit))
            .await
    }

    async fn find_job_by_session(&self, session_id: &str) -> Result<Option<Job>> {
        let session_id = session_id.to_string();
        self.call(move |db| db.find_job_by_session(&session_id))
            .await
    }

    async fn list_unfinished_jobs(&self) -> Result<Vec<Job>> {
        self.call(|db| db.list_unfinished_jobs()).await
    }

    async fn create_snapshot(&self, new: NewSnapshot) -> Result<IterationSnapshot> {
        self.call(move |db| db.create_snapshot(&new)).await
    }

    async fn get_snapshot(
        &self,
        job_id: i64,
        iteration: i64,
    ) -> Result<Option<IterationSnapshot>> {
        self.call(move |db| db.get_snapshot(job_id, iteration))
            .await
    }

    async fn list_snapshots_for_job(&self, job_id: i64) -> Result<Vec<IterationSnapshot>> {
        self.call(move |db| db.list_snapshots_for_job(job_id)).await
    }

    async fn delete_snapshot(&self, id: i64) -> Result<bool> {
        self.call(move |db| db.delete_snapshot(id)).await
    }
}
