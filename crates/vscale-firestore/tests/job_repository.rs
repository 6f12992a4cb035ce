//! Firestore integration tests.

use std::time::Duration;

use chrono::Utc;
use vscale_firestore::{
    AggregationClaim, FirestoreClient, JobFinalization, JobRepository, JobStore, SegmentUpdate,
    StoreError,
};
use vscale_models::{segment_name, ArtifactRef, Job, JobId, JobStatus, SegmentCompletion};

fn repository() -> JobRepository {
    dotenvy::dotenv().ok();
    let client = FirestoreClient::from_env().expect("Failed to create Firestore client");
    JobRepository::new(client)
}

fn new_job(segments: usize) -> Job {
    let id = JobId::new();
    let names = (0..segments).map(|i| segment_name(&id, i)).collect();
    Job::new(id, ArtifactRef::parse("it-source.mp4").unwrap(), names)
}

fn completion(segment: &str) -> SegmentCompletion {
    let now = Utc::now();
    SegmentCompletion {
        result_name: segment.replace(".mp4", "_processed.mp4"),
        time_start: now,
        time_end: now,
    }
}

#[tokio::test]
#[ignore = "requires Firestore credentials"]
async fn test_job_roundtrip() {
    let repo = repository();
    let job = new_job(3);
    repo.create_job(&job).await.expect("Failed to create job");

    let stored = repo
        .get_job(&job.id)
        .await
        .expect("Failed to read job")
        .expect("Job missing");
    assert_eq!(stored.status, JobStatus::InProgress);
    assert_eq!(stored.segments.len(), 3);

    assert!(repo
        .get_job(&JobId::new())
        .await
        .expect("Failed to read job")
        .is_none());
}

#[tokio::test]
#[ignore = "requires Firestore credentials"]
async fn test_segment_completion_is_conditional() {
    let repo = repository();
    let job = new_job(2);
    repo.create_job(&job).await.expect("Failed to create job");
    let name = job.segments[0].name.clone();

    let first = repo
        .complete_segment(&job.id, &name, &completion(&name))
        .await
        .expect("Failed to complete segment");
    assert_eq!(first, SegmentUpdate::Applied);

    let second = repo
        .complete_segment(&job.id, &name, &completion(&name))
        .await
        .expect("Failed to complete segment");
    assert_eq!(second, SegmentUpdate::AlreadyComplete);

    let unknown = repo
        .complete_segment(&job.id, "nope.mp4", &completion("nope.mp4"))
        .await
        .expect("Failed to complete segment");
    assert_eq!(unknown, SegmentUpdate::UnknownSegment);
}

#[tokio::test]
#[ignore = "requires Firestore credentials"]
async fn test_aggregation_lease_and_finalize() {
    let repo = repository();
    let job = new_job(1);
    repo.create_job(&job).await.expect("Failed to create job");
    let name = job.segments[0].name.clone();
    repo.complete_segment(&job.id, &name, &completion(&name))
        .await
        .expect("Failed to complete segment");

    let lease = Duration::from_secs(60);
    let claim = repo
        .claim_aggregation(&job.id, "owner-a", lease)
        .await
        .expect("Failed to claim");
    assert!(matches!(claim, AggregationClaim::Acquired { .. }));

    let other = repo
        .claim_aggregation(&job.id, "owner-b", lease)
        .await
        .expect("Failed to claim");
    assert_eq!(
        other,
        AggregationClaim::HeldByOther {
            owner: "owner-a".to_string()
        }
    );

    repo.renew_aggregation(&job.id, "owner-a", lease)
        .await
        .expect("Holder failed to renew");
    assert!(matches!(
        repo.renew_aggregation(&job.id, "owner-b", lease).await,
        Err(StoreError::LeaseLost(_))
    ));

    let now = Utc::now();
    repo.finalize_job(
        &job.id,
        "owner-a",
        &JobFinalization {
            result_artifact: format!("{}_upscaled.mp4", job.id),
            time_end: now,
            expires_at: now + chrono::Duration::hours(1),
        },
    )
    .await
    .expect("Failed to finalize");

    let done = repo
        .get_job(&job.id)
        .await
        .expect("Failed to read job")
        .expect("Job missing");
    assert_eq!(done.status, JobStatus::Complete);
    assert_eq!(
        repo.claim_aggregation(&job.id, "owner-b", lease)
            .await
            .expect("Failed to claim"),
        AggregationClaim::AlreadyComplete
    );
}
