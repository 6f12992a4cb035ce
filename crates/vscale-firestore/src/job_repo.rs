//! Firestore-backed job store.
//!
//! Layout:
//! - `jobs/{job_id}`: job-level fields plus the aggregation lease
//! - `jobs/{job_id}/segments/{segment_name}`: one document per segment
//!
//! Segment documents are written before the job document, so a readable
//! job always has all of its segments. Conditional writes use the
//! document's `updateTime` as the compare-and-set token.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use vscale_models::{
    ArtifactRef, Job, JobId, JobStatus, Segment, SegmentCompletion, SegmentStatus, ARTIFACT_NONE,
};

use crate::client::{FirestoreClient, MAX_BATCH_WRITES};
use crate::metrics::record_cas_conflict;
use crate::store::{
    AggregationClaim, JobFinalization, JobStore, SegmentUpdate, StoreError, StoreResult,
};
use crate::types::{Document, Fields, ToFirestoreValue, Value, Write};

const JOBS_COLLECTION: &str = "jobs";

/// Repository for job and segment documents.
#[derive(Clone)]
pub struct JobRepository {
    client: FirestoreClient,
}

impl JobRepository {
    pub fn new(client: FirestoreClient) -> Self {
        Self { client }
    }

    fn segments_collection(id: &JobId) -> String {
        format!("{}/{}/segments", JOBS_COLLECTION, id)
    }

    /// Read the job document, treating expired records as absent.
    async fn live_job_doc(&self, id: &JobId) -> StoreResult<Option<Document>> {
        let doc = self
            .client
            .with_retry("get_job", || {
                self.client.get_document(JOBS_COLLECTION, id.as_str())
            })
            .await?;
        Ok(doc.filter(|d| !is_expired(d, Utc::now())))
    }

    async fn segment_doc(&self, id: &JobId, name: &str) -> StoreResult<Option<Document>> {
        let collection = Self::segments_collection(id);
        Ok(self
            .client
            .with_retry("get_segment", || self.client.get_document(&collection, name))
            .await?)
    }

    /// Stamp the retention deadline on every segment document.
    async fn expire_segments(&self, id: &JobId, expires_at: DateTime<Utc>) -> StoreResult<()> {
        let collection = Self::segments_collection(id);
        let docs = self
            .client
            .with_retry("list_segments", || self.client.list_all_documents(&collection))
            .await?;

        let writes: Vec<Write> = docs
            .iter()
            .filter_map(|d| d.name.clone())
            .map(|name| {
                let mut fields = HashMap::new();
                fields.insert("expires_at".to_string(), expires_at.to_firestore_value());
                Write::patch(
                    Document::new(fields).with_name(name),
                    vec!["expires_at".to_string()],
                )
            })
            .collect();

        for chunk in writes.chunks(MAX_BATCH_WRITES) {
            self.client.batch_write(chunk.to_vec()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for JobRepository {
    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        let collection = Self::segments_collection(&job.id);
        let writes: Vec<Write> = job
            .segments
            .iter()
            .map(|s| {
                let name = self.client.full_document_name(&collection, &s.name);
                Write::set(Document::new(segment_to_fields(s)).with_name(name))
            })
            .collect();

        for chunk in writes.chunks(MAX_BATCH_WRITES) {
            self.client
                .with_retry("create_segments", || self.client.batch_write(chunk.to_vec()))
                .await?;
        }

        self.client
            .create_document(JOBS_COLLECTION, job.id.as_str(), job_to_fields(job))
            .await?;

        info!(
            job_id = %job.id,
            segments = job.segments.len(),
            "Created job record"
        );
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>> {
        let Some(doc) = self.live_job_doc(id).await? else {
            return Ok(None);
        };

        let collection = Self::segments_collection(id);
        let segment_docs = self
            .client
            .with_retry("list_segments", || self.client.list_all_documents(&collection))
            .await?;
        let mut segments = segment_docs
            .iter()
            .map(document_to_segment)
            .collect::<StoreResult<Vec<_>>>()?;
        segments.sort_by_key(|s| s.index);

        let job = document_to_job(&doc, segments)?;
        Ok(Some(job))
    }

    async fn complete_segment(
        &self,
        id: &JobId,
        segment_name: &str,
        completion: &SegmentCompletion,
    ) -> StoreResult<SegmentUpdate> {
        if self.live_job_doc(id).await?.is_none() {
            return Ok(SegmentUpdate::UnknownJob);
        }
        let Some(doc) = self.segment_doc(id, segment_name).await? else {
            return Ok(SegmentUpdate::UnknownSegment);
        };
        if segment_status(&doc)? == SegmentStatus::Complete {
            return Ok(SegmentUpdate::AlreadyComplete);
        }
        let update_time = update_time(&doc)?;

        let mut fields = HashMap::new();
        fields.insert(
            "status".to_string(),
            SegmentStatus::Complete.as_str().to_firestore_value(),
        );
        fields.insert(
            "result_name".to_string(),
            completion.result_name.to_firestore_value(),
        );
        fields.insert(
            "time_start".to_string(),
            completion.time_start.to_firestore_value(),
        );
        fields.insert(
            "time_end".to_string(),
            completion.time_end.to_firestore_value(),
        );

        let result = self
            .client
            .update_document(
                &Self::segments_collection(id),
                segment_name,
                fields,
                &["status", "result_name", "time_start", "time_end"],
                Some(&update_time),
            )
            .await;

        match result {
            Ok(_) => Ok(SegmentUpdate::Applied),
            Err(e) if e.is_precondition_failed() => {
                record_cas_conflict("complete_segment");
                // Lost the race; the segment only ever moves to COMPLETE
                match self.segment_doc(id, segment_name).await? {
                    Some(doc) if segment_status(&doc)? == SegmentStatus::Complete => {
                        Ok(SegmentUpdate::AlreadyComplete)
                    }
                    _ => Err(StoreError::Conflict(format!("{}/{}", id, segment_name))),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn claim_aggregation(
        &self,
        id: &JobId,
        owner: &str,
        lease: Duration,
    ) -> StoreResult<AggregationClaim> {
        let Some(doc) = self.live_job_doc(id).await? else {
            return Ok(AggregationClaim::UnknownJob);
        };
        if let Some(outcome) = blocking_claim(&doc, owner, Utc::now())? {
            return Ok(outcome);
        }

        let expires_at = Utc::now()
            + chrono::Duration::from_std(lease)
                .map_err(|e| StoreError::corrupt(format!("lease duration: {}", e)))?;
        let mut fields = HashMap::new();
        fields.insert("aggregation_owner".to_string(), owner.to_firestore_value());
        fields.insert(
            "aggregation_expires_at".to_string(),
            expires_at.to_firestore_value(),
        );

        let result = self
            .client
            .update_document(
                JOBS_COLLECTION,
                id.as_str(),
                fields,
                &["aggregation_owner", "aggregation_expires_at"],
                Some(&update_time(&doc)?),
            )
            .await;

        match result {
            Ok(_) => {
                debug!(job_id = %id, owner, "Acquired aggregation lease");
                Ok(AggregationClaim::Acquired { expires_at })
            }
            Err(e) if e.is_precondition_failed() => {
                record_cas_conflict("claim_aggregation");
                let Some(doc) = self.live_job_doc(id).await? else {
                    return Ok(AggregationClaim::UnknownJob);
                };
                match blocking_claim(&doc, owner, Utc::now())? {
                    Some(outcome) => Ok(outcome),
                    None => Err(StoreError::Conflict(format!("{}/{}", JOBS_COLLECTION, id))),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renew_aggregation(
        &self,
        id: &JobId,
        owner: &str,
        lease: Duration,
    ) -> StoreResult<DateTime<Utc>> {
        let Some(doc) = self.live_job_doc(id).await? else {
            return Err(StoreError::LeaseLost(id.to_string()));
        };
        if !holds_lease(&doc, owner)? {
            return Err(StoreError::LeaseLost(id.to_string()));
        }

        let expires_at = Utc::now()
            + chrono::Duration::from_std(lease)
                .map_err(|e| StoreError::corrupt(format!("lease duration: {}", e)))?;
        let mut fields = HashMap::new();
        fields.insert(
            "aggregation_expires_at".to_string(),
            expires_at.to_firestore_value(),
        );

        let result = self
            .client
            .update_document(
                JOBS_COLLECTION,
                id.as_str(),
                fields,
                &["aggregation_expires_at"],
                Some(&update_time(&doc)?),
            )
            .await;

        match result {
            Ok(_) => Ok(expires_at),
            Err(e) if e.is_precondition_failed() => {
                record_cas_conflict("renew_aggregation");
                match self.live_job_doc(id).await? {
                    Some(doc) if holds_lease(&doc, owner)? => {
                        Err(StoreError::Conflict(format!("{}/{}", JOBS_COLLECTION, id)))
                    }
                    _ => Err(StoreError::LeaseLost(id.to_string())),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release_aggregation(&self, id: &JobId, owner: &str) -> StoreResult<()> {
        let Some(doc) = self.live_job_doc(id).await? else {
            return Ok(());
        };
        if doc.field::<String>("aggregation_owner").as_deref() != Some(owner) {
            return Ok(());
        }

        let mut fields = HashMap::new();
        fields.insert("aggregation_owner".to_string(), Value::null());
        fields.insert("aggregation_expires_at".to_string(), Value::null());
        let result = self
            .client
            .update_document(
                JOBS_COLLECTION,
                id.as_str(),
                fields,
                &["aggregation_owner", "aggregation_expires_at"],
                Some(&update_time(&doc)?),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_precondition_failed() => {
                // Someone else changed the record; whatever they wrote wins
                debug!(job_id = %id, owner, "Lease changed before release");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn finalize_job(
        &self,
        id: &JobId,
        owner: &str,
        finalization: &JobFinalization,
    ) -> StoreResult<()> {
        let Some(doc) = self.live_job_doc(id).await? else {
            return Err(StoreError::LeaseLost(id.to_string()));
        };
        if !holds_lease(&doc, owner)? {
            return Err(StoreError::LeaseLost(id.to_string()));
        }

        let mut fields = HashMap::new();
        fields.insert(
            "status".to_string(),
            JobStatus::Complete.as_str().to_firestore_value(),
        );
        fields.insert(
            "result_artifact".to_string(),
            finalization.result_artifact.to_firestore_value(),
        );
        fields.insert(
            "time_end".to_string(),
            finalization.time_end.to_firestore_value(),
        );
        fields.insert(
            "expires_at".to_string(),
            finalization.expires_at.to_firestore_value(),
        );
        fields.insert("aggregation_owner".to_string(), Value::null());
        fields.insert("aggregation_expires_at".to_string(), Value::null());

        let result = self
            .client
            .update_document(
                JOBS_COLLECTION,
                id.as_str(),
                fields,
                &[
                    "status",
                    "result_artifact",
                    "time_end",
                    "expires_at",
                    "aggregation_owner",
                    "aggregation_expires_at",
                ],
                Some(&update_time(&doc)?),
            )
            .await;

        match result {
            Ok(_) => {}
            Err(e) if e.is_precondition_failed() => {
                record_cas_conflict("finalize_job");
                // Our own earlier attempt may have landed
                let landed = match self.live_job_doc(id).await? {
                    Some(doc) => {
                        job_status(&doc)? == JobStatus::Complete
                            && doc.field::<String>("result_artifact").as_deref()
                                == Some(finalization.result_artifact.as_str())
                    }
                    None => false,
                };
                if !landed {
                    return Err(StoreError::LeaseLost(id.to_string()));
                }
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.expire_segments(id, finalization.expires_at).await {
            warn!(job_id = %id, "Failed to stamp retention on segment records: {}", e);
        }
        info!(job_id = %id, result = %finalization.result_artifact, "Job complete");
        Ok(())
    }
}

/// The non-acquiring outcome for `owner`, or `None` if the lease is free to take.
fn blocking_claim(
    doc: &Document,
    owner: &str,
    now: DateTime<Utc>,
) -> StoreResult<Option<AggregationClaim>> {
    if job_status(doc)? == JobStatus::Complete {
        return Ok(Some(AggregationClaim::AlreadyComplete));
    }
    let holder = doc.field::<String>("aggregation_owner");
    let until = doc.field::<DateTime<Utc>>("aggregation_expires_at");
    match (holder, until) {
        (Some(holder), Some(until)) if holder != owner && until > now => {
            Ok(Some(AggregationClaim::HeldByOther { owner: holder }))
        }
        _ => Ok(None),
    }
}

/// Whether `owner` holds the lease of a job that is still in progress.
fn holds_lease(doc: &Document, owner: &str) -> StoreResult<bool> {
    Ok(job_status(doc)? == JobStatus::InProgress
        && doc.field::<String>("aggregation_owner").as_deref() == Some(owner))
}

fn is_expired(doc: &Document, now: DateTime<Utc>) -> bool {
    doc.field::<DateTime<Utc>>("expires_at")
        .map(|at| at <= now)
        .unwrap_or(false)
}

fn update_time(doc: &Document) -> StoreResult<String> {
    doc.update_time
        .clone()
        .ok_or_else(|| StoreError::corrupt("document has no updateTime"))
}

fn job_status(doc: &Document) -> StoreResult<JobStatus> {
    let raw: String = doc.required("status")?;
    raw.parse().map_err(|e| StoreError::corrupt(format!("{}", e)))
}

fn segment_status(doc: &Document) -> StoreResult<SegmentStatus> {
    let raw: String = doc.required("status")?;
    raw.parse().map_err(|e| StoreError::corrupt(format!("{}", e)))
}

/// Read an optional artifact name stored with the `"NONE"` sentinel.
fn optional_name(doc: &Document, key: &str) -> Option<String> {
    doc.field::<String>(key).filter(|s| s != ARTIFACT_NONE)
}

fn job_to_fields(job: &Job) -> Fields {
    let mut fields = HashMap::new();
    fields.insert("id".to_string(), job.id.as_str().to_firestore_value());
    fields.insert("source".to_string(), job.source.as_str().to_firestore_value());
    fields.insert("status".to_string(), job.status.as_str().to_firestore_value());
    fields.insert(
        "segment_count".to_string(),
        (job.segments.len() as u32).to_firestore_value(),
    );
    fields.insert("time_start".to_string(), job.time_start.to_firestore_value());
    fields.insert("time_end".to_string(), job.time_end.to_firestore_value());
    fields.insert(
        "result_artifact".to_string(),
        job.result_artifact
            .as_deref()
            .unwrap_or(ARTIFACT_NONE)
            .to_firestore_value(),
    );
    fields.insert("expires_at".to_string(), job.expires_at.to_firestore_value());
    fields.insert("aggregation_owner".to_string(), Value::null());
    fields.insert("aggregation_expires_at".to_string(), Value::null());
    fields
}

fn segment_to_fields(segment: &Segment) -> Fields {
    let mut fields = HashMap::new();
    fields.insert("name".to_string(), segment.name.to_firestore_value());
    fields.insert("index".to_string(), segment.index.to_firestore_value());
    fields.insert("status".to_string(), segment.status.as_str().to_firestore_value());
    fields.insert("time_start".to_string(), segment.time_start.to_firestore_value());
    fields.insert("time_end".to_string(), segment.time_end.to_firestore_value());
    fields.insert(
        "result_name".to_string(),
        segment
            .result_name
            .as_deref()
            .unwrap_or(ARTIFACT_NONE)
            .to_firestore_value(),
    );
    fields.insert("expires_at".to_string(), Value::null());
    fields
}

fn document_to_segment(doc: &Document) -> StoreResult<Segment> {
    Ok(Segment {
        name: doc.required("name")?,
        index: doc.required("index")?,
        status: segment_status(doc)?,
        time_start: doc.field("time_start"),
        time_end: doc.field("time_end"),
        result_name: optional_name(doc, "result_name"),
    })
}

fn document_to_job(doc: &Document, segments: Vec<Segment>) -> StoreResult<Job> {
    let id: String = doc.required("id")?;
    let expected: u32 = doc.required("segment_count")?;
    if segments.len() != expected as usize {
        return Err(StoreError::corrupt(format!(
            "job {} expects {} segments, found {}",
            id,
            expected,
            segments.len()
        )));
    }
    let source: String = doc.required("source")?;

    Ok(Job {
        id: JobId::from_string(id),
        source: ArtifactRef::parse(source).map_err(|e| StoreError::corrupt(e.to_string()))?,
        status: job_status(doc)?,
        segments,
        time_start: doc.required("time_start")?,
        time_end: doc.field("time_end"),
        result_artifact: optional_name(doc, "result_artifact"),
        expires_at: doc.field("expires_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_update_time(fields: Fields, name: &str) -> Document {
        let mut doc = Document::new(fields).with_name(name);
        doc.update_time = Some("2024-01-01T00:00:00.000001Z".into());
        doc
    }

    fn sample_job() -> Job {
        let id = JobId::from_string("j1");
        Job::new(
            id.clone(),
            ArtifactRef::parse("clip.mp4").unwrap(),
            vec![
                vscale_models::segment_name(&id, 0),
                vscale_models::segment_name(&id, 1),
            ],
        )
    }

    #[test]
    fn test_job_document_round_trip() {
        let job = sample_job();
        let doc = with_update_time(job_to_fields(&job), "jobs/j1");
        let segments: Vec<Segment> = job
            .segments
            .iter()
            .map(|s| document_to_segment(&Document::new(segment_to_fields(s))).unwrap())
            .collect();

        let read = document_to_job(&doc, segments).unwrap();
        assert_eq!(read.id, job.id);
        assert_eq!(read.status, JobStatus::InProgress);
        assert_eq!(read.result_artifact, None);
        assert_eq!(read.segments, job.segments);
    }

    #[test]
    fn test_missing_segments_are_corrupt() {
        let job = sample_job();
        let doc = with_update_time(job_to_fields(&job), "jobs/j1");
        assert!(matches!(
            document_to_job(&doc, vec![]),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_blocking_claim() {
        let job = sample_job();
        let now = Utc::now();
        let mut fields = job_to_fields(&job);
        let doc = with_update_time(fields.clone(), "jobs/j1");
        assert_eq!(blocking_claim(&doc, "a", now).unwrap(), None);

        fields.insert("aggregation_owner".into(), "b".to_firestore_value());
        fields.insert(
            "aggregation_expires_at".into(),
            (now + chrono::Duration::seconds(30)).to_firestore_value(),
        );
        let held = with_update_time(fields.clone(), "jobs/j1");
        assert_eq!(
            blocking_claim(&held, "a", now).unwrap(),
            Some(AggregationClaim::HeldByOther { owner: "b".into() })
        );
        // Holder may re-claim; expired leases are free
        assert_eq!(blocking_claim(&held, "b", now).unwrap(), None);
        assert_eq!(
            blocking_claim(&held, "a", now + chrono::Duration::seconds(31)).unwrap(),
            None
        );

        fields.insert("status".into(), "COMPLETE".to_firestore_value());
        let done = with_update_time(fields, "jobs/j1");
        assert_eq!(
            blocking_claim(&done, "a", now).unwrap(),
            Some(AggregationClaim::AlreadyComplete)
        );
    }

    #[test]
    fn test_holds_lease() {
        let job = sample_job();
        let mut fields = job_to_fields(&job);
        assert!(!holds_lease(&Document::new(fields.clone()), "a").unwrap());

        fields.insert("aggregation_owner".into(), "a".to_firestore_value());
        assert!(holds_lease(&Document::new(fields.clone()), "a").unwrap());
        assert!(!holds_lease(&Document::new(fields.clone()), "b").unwrap());

        fields.insert("status".into(), "COMPLETE".to_firestore_value());
        assert!(!holds_lease(&Document::new(fields), "a").unwrap());
    }

    #[test]
    fn test_expiry_check() {
        let now = Utc::now();
        let mut fields = HashMap::new();
        assert!(!is_expired(&Document::new(fields.clone()), now));
        fields.insert(
            "expires_at".to_string(),
            (now - chrono::Duration::seconds(1)).to_firestore_value(),
        );
        assert!(is_expired(&Document::new(fields), now));
    }
}
