//! In-memory job store.
//!
//! Same conditional-update semantics as the Firestore repository, with the
//! compare-and-set provided by a single mutex. Used by tests and by
//! single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use vscale_models::{Job, JobId, JobStatus, SegmentCompletion};

use crate::store::{
    AggregationClaim, JobFinalization, JobStore, SegmentUpdate, StoreError, StoreResult,
};

struct Lease {
    owner: String,
    expires_at: chrono::DateTime<Utc>,
}

struct Record {
    job: Job,
    lease: Option<Lease>,
}

/// Process-local job store.
#[derive(Default)]
pub struct MemoryJobStore {
    records: Mutex<HashMap<JobId, Record>>,
    unavailable: AtomicBool,
    finalizations: AtomicU32,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// How many times a job was moved to COMPLETE.
    pub fn finalization_count(&self) -> u32 {
        self.finalizations.load(Ordering::SeqCst)
    }

    /// Current lease owner of a job, if any (expired leases included).
    pub fn lease_owner(&self, id: &JobId) -> Option<String> {
        self.lock()
            .get(id)
            .and_then(|r| r.lease.as_ref().map(|l| l.owner.clone()))
    }

    /// Hand the lease to `owner` whoever holds it, as if the current
    /// holder had stopped renewing.
    pub fn force_lease(&self, id: &JobId, owner: &str, lease: Duration) {
        if let Some(record) = self.lock().get_mut(id) {
            let expires_at = Utc::now()
                + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());
            record.lease = Some(Lease {
                owner: owner.to_string(),
                expires_at,
            });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Record>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("memory job store offline"));
        }
        Ok(())
    }
}

/// Live (present and unexpired) record for `id`.
fn live<'a>(records: &'a mut HashMap<JobId, Record>, id: &JobId) -> Option<&'a mut Record> {
    let now = Utc::now();
    records.get_mut(id).filter(|r| !r.job.is_expired(now))
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        self.check_available()?;
        let mut records = self.lock();
        if records.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id.to_string()));
        }
        records.insert(
            job.id.clone(),
            Record {
                job: job.clone(),
                lease: None,
            },
        );
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>> {
        self.check_available()?;
        let mut records = self.lock();
        Ok(live(&mut records, id).map(|r| r.job.clone()))
    }

    async fn complete_segment(
        &self,
        id: &JobId,
        segment_name: &str,
        completion: &SegmentCompletion,
    ) -> StoreResult<SegmentUpdate> {
        self.check_available()?;
        let mut records = self.lock();
        let Some(record) = live(&mut records, id) else {
            return Ok(SegmentUpdate::UnknownJob);
        };
        let Some(segment) = record.job.segment_mut(segment_name) else {
            return Ok(SegmentUpdate::UnknownSegment);
        };
        if segment.apply_completion(completion) {
            Ok(SegmentUpdate::Applied)
        } else {
            Ok(SegmentUpdate::AlreadyComplete)
        }
    }

    async fn claim_aggregation(
        &self,
        id: &JobId,
        owner: &str,
        lease: Duration,
    ) -> StoreResult<AggregationClaim> {
        self.check_available()?;
        let mut records = self.lock();
        let Some(record) = live(&mut records, id) else {
            return Ok(AggregationClaim::UnknownJob);
        };
        if record.job.status == JobStatus::Complete {
            return Ok(AggregationClaim::AlreadyComplete);
        }

        let now = Utc::now();
        if let Some(held) = &record.lease {
            if held.owner != owner && held.expires_at > now {
                return Ok(AggregationClaim::HeldByOther {
                    owner: held.owner.clone(),
                });
            }
        }

        let expires_at = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| StoreError::corrupt(format!("lease duration: {}", e)))?;
        record.lease = Some(Lease {
            owner: owner.to_string(),
            expires_at,
        });
        Ok(AggregationClaim::Acquired { expires_at })
    }

    async fn renew_aggregation(
        &self,
        id: &JobId,
        owner: &str,
        lease: Duration,
    ) -> StoreResult<chrono::DateTime<Utc>> {
        self.check_available()?;
        let mut records = self.lock();
        let Some(record) = live(&mut records, id) else {
            return Err(StoreError::LeaseLost(id.to_string()));
        };
        if record.job.status != JobStatus::InProgress {
            return Err(StoreError::LeaseLost(id.to_string()));
        }
        match record.lease.as_mut() {
            Some(held) if held.owner == owner => {
                held.expires_at = Utc::now()
                    + chrono::Duration::from_std(lease)
                        .map_err(|e| StoreError::corrupt(format!("lease duration: {}", e)))?;
                Ok(held.expires_at)
            }
            _ => Err(StoreError::LeaseLost(id.to_string())),
        }
    }

    async fn release_aggregation(&self, id: &JobId, owner: &str) -> StoreResult<()> {
        self.check_available()?;
        let mut records = self.lock();
        if let Some(record) = records.get_mut(id) {
            if record.lease.as_ref().map(|l| l.owner == owner).unwrap_or(false) {
                record.lease = None;
            }
        }
        Ok(())
    }

    async fn finalize_job(
        &self,
        id: &JobId,
        owner: &str,
        finalization: &JobFinalization,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut records = self.lock();
        let Some(record) = live(&mut records, id) else {
            return Err(StoreError::LeaseLost(id.to_string()));
        };
        let holds_lease = record
            .lease
            .as_ref()
            .map(|l| l.owner == owner)
            .unwrap_or(false);
        if record.job.status != JobStatus::InProgress || !holds_lease {
            return Err(StoreError::LeaseLost(id.to_string()));
        }

        record.job.status = JobStatus::Complete;
        record.job.result_artifact = Some(finalization.result_artifact.clone());
        record.job.time_end = Some(finalization.time_end);
        record.job.expires_at = Some(finalization.expires_at);
        record.lease = None;
        self.finalizations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;
    use vscale_models::{ArtifactRef, SegmentStatus};

    fn job(segments: usize) -> Job {
        let id = JobId::new();
        let names = (0..segments)
            .map(|i| vscale_models::segment_name(&id, i))
            .collect();
        Job::new(id, ArtifactRef::parse("in.mp4").unwrap(), names)
    }

    fn completion(name: &str) -> SegmentCompletion {
        let now = Utc::now();
        SegmentCompletion {
            result_name: vscale_models::processed_segment_name(name),
            time_start: now,
            time_end: now,
        }
    }

    fn finalization(expires_in: chrono::Duration) -> JobFinalization {
        JobFinalization {
            result_artifact: "out.mp4".into(),
            time_end: Utc::now(),
            expires_at: Utc::now() + expires_in,
        }
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let store = MemoryJobStore::new();
        let job = job(3);
        store.create_job(&job).await.unwrap();

        let read = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(read, job);
        assert!(matches!(
            store.create_job(&job).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(store.get_job(&JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_segment_is_conditional() {
        let store = MemoryJobStore::new();
        let job = job(2);
        store.create_job(&job).await.unwrap();
        let name = job.segments[0].name.clone();

        let first = completion(&name);
        assert_eq!(
            store.complete_segment(&job.id, &name, &first).await.unwrap(),
            SegmentUpdate::Applied
        );

        let mut second = completion(&name);
        second.time_end = first.time_end + chrono::Duration::seconds(60);
        assert_eq!(
            store.complete_segment(&job.id, &name, &second).await.unwrap(),
            SegmentUpdate::AlreadyComplete
        );

        let read = store.get_job(&job.id).await.unwrap().unwrap();
        let seg = read.segment(&name).unwrap();
        assert_eq!(seg.status, SegmentStatus::Complete);
        assert_eq!(seg.time_end, Some(first.time_end));
        // The other segment is untouched
        assert_eq!(read.segments[1].status, SegmentStatus::Unprocessed);

        assert_eq!(
            store.complete_segment(&job.id, "nope.mp4", &first).await.unwrap(),
            SegmentUpdate::UnknownSegment
        );
        assert_eq!(
            store.complete_segment(&JobId::new(), &name, &first).await.unwrap(),
            SegmentUpdate::UnknownJob
        );
    }

    #[tokio::test]
    async fn test_single_lease_holder() {
        let store = MemoryJobStore::new();
        let job = job(1);
        store.create_job(&job).await.unwrap();
        let lease = Duration::from_secs(60);

        assert!(matches!(
            store.claim_aggregation(&job.id, "a", lease).await.unwrap(),
            AggregationClaim::Acquired { .. }
        ));
        assert_eq!(
            store.claim_aggregation(&job.id, "b", lease).await.unwrap(),
            AggregationClaim::HeldByOther { owner: "a".into() }
        );
        // Re-entrant for the holder
        assert!(matches!(
            store.claim_aggregation(&job.id, "a", lease).await.unwrap(),
            AggregationClaim::Acquired { .. }
        ));

        // Finalizing without the lease fails
        assert!(matches!(
            store
                .finalize_job(&job.id, "b", &finalization(chrono::Duration::hours(1)))
                .await,
            Err(StoreError::LeaseLost(_))
        ));

        store
            .finalize_job(&job.id, "a", &finalization(chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(store.finalization_count(), 1);
        assert_eq!(
            store.claim_aggregation(&job.id, "b", lease).await.unwrap(),
            AggregationClaim::AlreadyComplete
        );

        let read = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(read.status, JobStatus::Complete);
        assert_eq!(read.result_artifact.as_deref(), Some("out.mp4"));
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = MemoryJobStore::new();
        let job = job(1);
        store.create_job(&job).await.unwrap();

        store
            .claim_aggregation(&job.id, "a", Duration::ZERO)
            .await
            .unwrap();
        assert!(matches!(
            store
                .claim_aggregation(&job.id, "b", Duration::from_secs(60))
                .await
                .unwrap(),
            AggregationClaim::Acquired { .. }
        ));
        assert_eq!(store.lease_owner(&job.id).as_deref(), Some("b"));

        // Release by a non-holder is ignored
        assert_ok!(store.release_aggregation(&job.id, "a").await);
        assert_eq!(store.lease_owner(&job.id).as_deref(), Some("b"));
        assert_ok!(store.release_aggregation(&job.id, "b").await);
        assert_eq!(store.lease_owner(&job.id), None);
    }

    #[tokio::test]
    async fn test_renewal_only_by_the_holder() {
        let store = MemoryJobStore::new();
        let job = job(1);
        store.create_job(&job).await.unwrap();
        store
            .claim_aggregation(&job.id, "a", Duration::from_millis(10))
            .await
            .unwrap();

        let until = assert_ok!(
            store
                .renew_aggregation(&job.id, "a", Duration::from_secs(60))
                .await
        );
        assert!(until > Utc::now() + chrono::Duration::seconds(50));
        // The renewed lease keeps others out
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            store
                .claim_aggregation(&job.id, "b", Duration::from_secs(60))
                .await
                .unwrap(),
            AggregationClaim::HeldByOther { owner: "a".into() }
        );
        assert!(matches!(
            store
                .renew_aggregation(&job.id, "b", Duration::from_secs(60))
                .await,
            Err(StoreError::LeaseLost(_))
        ));

        store.force_lease(&job.id, "b", Duration::from_secs(60));
        assert!(matches!(
            store
                .renew_aggregation(&job.id, "a", Duration::from_secs(60))
                .await,
            Err(StoreError::LeaseLost(_))
        ));
        assert!(matches!(
            store
                .renew_aggregation(&JobId::new(), "a", Duration::from_secs(60))
                .await,
            Err(StoreError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_records_read_as_absent() {
        let store = MemoryJobStore::new();
        let job = job(1);
        store.create_job(&job).await.unwrap();
        store
            .claim_aggregation(&job.id, "a", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .finalize_job(&job.id, "a", &finalization(chrono::Duration::seconds(-1)))
            .await
            .unwrap();

        assert!(store.get_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryJobStore::new();
        store.set_unavailable(true);
        let err = store.get_job(&JobId::new()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
