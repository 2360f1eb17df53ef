//! Acquisition scenarios: rescue, defensive takeover and claim races.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use encnode_jobstore::{JobRecord, JobStore};
use encnode_models::{AcquisitionPath, JobDescription, JobId, JobSource, JobStatus};
use encnode_worker::testing::{Fixture, GatewayCall};
use encnode_worker::{CompletionRoute, JobOutcome};

fn description(id: &str, age: Duration) -> JobDescription {
    JobDescription::new(
        JobId::from_string(id),
        "ipfs://QmSource",
        JobSource::Gateway {
            owner: "alice".into(),
            permlink: id.into(),
            short: false,
        },
    )
    .with_created_at(Utc::now() - chrono::Duration::from_std(age).unwrap())
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

/// An abandoned job is rescued, processed and written straight to the store.
#[tokio::test]
async fn test_rescued_job_completes_without_gateway() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.store.enqueue(description("J1", minutes(6))).await.unwrap();
    let coordinator = fixture.coordinator().await.unwrap();

    let report = coordinator.rescue_cycle().await.unwrap();
    assert_eq!(report.claimed.len(), 1);
    let job = report.claimed.into_iter().next().unwrap();
    assert_eq!(job.acquisition_path, AcquisitionPath::Rescued);
    assert!(job.bypasses_gateway());

    let outcome = coordinator.dispatch(job).await.unwrap().await.unwrap();

    match outcome {
        JobOutcome::Completed { result, route, .. } => {
            assert_eq!(route, CompletionRoute::Direct);
            assert_eq!(result.content_address.as_str(), "QmOutput");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    let record = fixture
        .store
        .get_job(&JobId::from_string("J1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, JobStatus::Complete);
    assert!(record.defensive_takeover);
    assert_eq!(record.acquisition_path, Some(AcquisitionPath::Rescued));
    assert_eq!(fixture.gateway.total_calls(), 0);
}

/// Jobs younger than the threshold are left alone.
#[tokio::test]
async fn test_rescue_respects_age_gate() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.store.enqueue(description("young", minutes(4))).await.unwrap();
    fixture
        .store
        .enqueue(description("old", minutes(5) + Duration::from_secs(1)))
        .await
        .unwrap();
    let coordinator = fixture.coordinator().await.unwrap();

    let report = coordinator.rescue_cycle().await.unwrap();

    let ids: Vec<&str> = report.claimed.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec!["old"]);
    let young = fixture
        .store
        .get_job(&JobId::from_string("young"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(young.status, JobStatus::Queued);
}

/// Ten eligible jobs, two claims per cycle, oldest first.
#[tokio::test]
async fn test_rescue_claims_at_most_max_per_cycle() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::new(dir.path());
    for i in 0..10u64 {
        fixture
            .store
            .enqueue(description(&format!("J{}", i), minutes(10 + i)))
            .await
            .unwrap();
    }
    let coordinator = fixture.coordinator().await.unwrap();

    let report = coordinator.rescue_cycle().await.unwrap();

    let ids: Vec<&str> = report.claimed.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec!["J9", "J8"]);

    let queued = fixture
        .store
        .find_queued_older_than(Duration::ZERO, 100)
        .await
        .unwrap();
    assert_eq!(queued.len(), 8);
}

/// Running jobs are never rescued, however old.
#[tokio::test]
async fn test_rescue_never_preempts_running_jobs() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.store.enqueue(description("J1", minutes(30))).await.unwrap();
    let other = {
        let mut other = Fixture::new(dir.path().join("other"));
        other.config.worker_id = "worker-b".to_string();
        other.store = fixture.store.clone();
        other
    };
    let holder = other.coordinator().await.unwrap();
    assert_eq!(holder.rescue_cycle().await.unwrap().claimed.len(), 1);

    let coordinator = fixture.coordinator().await.unwrap();
    let report = coordinator.rescue_cycle().await.unwrap();

    assert_eq!(report.candidates, 0);
    assert!(report.claimed.is_empty());
}

/// Two workers racing for the same abandoned job: exactly one wins.
#[tokio::test]
async fn test_concurrent_rescues_claim_once() {
    let dir = TempDir::new().unwrap();
    let a = Fixture::new(dir.path().join("a"));
    a.store.enqueue(description("J1", minutes(6))).await.unwrap();
    let mut b = Fixture::new(dir.path().join("b"));
    b.config.worker_id = "worker-b".to_string();
    b.store = a.store.clone();

    let coordinators = vec![a.coordinator().await.unwrap(), b.coordinator().await.unwrap()];
    let reports = futures::future::join_all(coordinators.iter().map(|c| c.rescue_cycle())).await;

    let claimed: usize = reports.iter().map(|r| r.as_ref().unwrap().claimed.len()).sum();
    assert_eq!(claimed, 1);
}

/// The gateway hands J1 to worker-a while worker-b's rescue scan races for
/// it on the shared store: exactly one of them ends up holding the job.
#[tokio::test]
async fn test_gateway_poll_and_rescue_claim_once() {
    let dir = TempDir::new().unwrap();
    let a = Fixture::new(dir.path().join("a"));
    a.store.enqueue(description("J1", minutes(6))).await.unwrap();
    a.gateway.push_job(description("J1", minutes(6)));
    let mut b = Fixture::new(dir.path().join("b"));
    b.config.worker_id = "worker-b".to_string();
    b.store = a.store.clone();

    let poller = a.coordinator().await.unwrap();
    let rescuer = b.coordinator().await.unwrap();
    let (polled, rescued) = tokio::join!(poller.poll_once(), rescuer.rescue_cycle());

    let polled = polled.unwrap();
    let rescued = rescued.unwrap();
    assert_eq!(usize::from(polled.is_some()) + rescued.claimed.len(), 1);

    let record = a
        .store
        .get_job(&JobId::from_string("J1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, JobStatus::Running);
    let holder = if polled.is_some() { "worker-a" } else { "worker-b" };
    assert!(record.is_assigned_to(holder));
}

/// A gateway hand-out claims the job in the store, so a later rescue scan
/// finds nothing to take.
#[tokio::test]
async fn test_gateway_job_is_claimed_before_rescue_scan() {
    let dir = TempDir::new().unwrap();
    let a = Fixture::new(dir.path().join("a"));
    a.store.enqueue(description("J1", minutes(6))).await.unwrap();
    a.gateway.push_job(description("J1", minutes(6)));
    let mut b = Fixture::new(dir.path().join("b"));
    b.config.worker_id = "worker-b".to_string();
    b.store = a.store.clone();

    let job = a.coordinator().await.unwrap().poll_once().await.unwrap().unwrap();
    assert_eq!(job.acquisition_path, AcquisitionPath::Gateway);
    assert!(!job.bypasses_gateway());

    let report = b.coordinator().await.unwrap().rescue_cycle().await.unwrap();
    assert!(report.claimed.is_empty());

    let record = a
        .store
        .get_job(&JobId::from_string("J1"))
        .await
        .unwrap()
        .unwrap();
    assert!(record.is_assigned_to("worker-a"));
    assert_eq!(record.acquisition_path, Some(AcquisitionPath::Gateway));
    assert!(!record.defensive_takeover);
}

/// A rescued job re-offered by the gateway is dropped without accepting.
#[tokio::test]
async fn test_rescued_job_offered_by_gateway_is_not_accepted() {
    let dir = TempDir::new().unwrap();
    let a = Fixture::new(dir.path().join("a"));
    a.store.enqueue(description("J1", minutes(6))).await.unwrap();
    a.gateway.push_job(description("J1", minutes(6)));
    let mut b = Fixture::new(dir.path().join("b"));
    b.config.worker_id = "worker-b".to_string();
    b.store = a.store.clone();

    assert_eq!(b.coordinator().await.unwrap().rescue_cycle().await.unwrap().claimed.len(), 1);
    let polled = a.coordinator().await.unwrap().poll_once().await.unwrap();

    assert!(polled.is_none());
    assert_eq!(a.gateway.calls(), vec![GatewayCall::Poll]);
}

/// A job completed through the store is never accepted on the gateway again.
#[tokio::test]
async fn test_taken_over_job_skips_gateway_accept() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::new(dir.path());
    let mut record = JobRecord::queued(description("J1", minutes(10)));
    record.status = JobStatus::Complete;
    record.assigned_worker = Some("worker-a".to_string());
    record.defensive_takeover = true;
    fixture.store.insert(record).await;
    fixture.gateway.push_job(description("J1", minutes(10)));
    let coordinator = fixture.coordinator().await.unwrap();

    assert!(coordinator.poll_once().await.unwrap().is_none());
    assert_eq!(fixture.gateway.calls(), vec![GatewayCall::Poll]);
    assert_eq!(fixture.gateway.write_calls(), 0);
}

/// Accept fails with a 5xx; the store shows the job unassigned, so the worker
/// claims it defensively and never reports to the gateway again.
#[tokio::test]
async fn test_accept_failure_falls_back_to_store() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::new(dir.path());
    fixture.store.enqueue(description("J1", minutes(1))).await.unwrap();
    fixture.gateway.push_job(description("J1", minutes(1)));
    fixture.gateway.set_accept_status(Some(503));
    let coordinator = fixture.coordinator().await.unwrap();

    let job = coordinator.poll_once().await.unwrap().unwrap();
    assert_eq!(job.acquisition_path, AcquisitionPath::DefensiveTakeover);
    let outcome = coordinator.dispatch(job).await.unwrap().await.unwrap();

    assert!(matches!(
        outcome,
        JobOutcome::Completed {
            route: CompletionRoute::Direct,
            ..
        }
    ));
    assert_eq!(
        fixture.gateway.calls(),
        vec![GatewayCall::Poll, GatewayCall::Accept(JobId::from_string("J1"))]
    );
}

/// A gateway-assigned job whose store record gains the takeover flag after
/// acceptance completes through the store only.
#[tokio::test]
async fn test_takeover_flag_is_sticky_for_gateway_jobs() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::new(dir.path());
    let mut record = JobRecord::queued(description("J1", minutes(1)));
    record.status = JobStatus::Assigned;
    record.assigned_worker = Some("worker-a".to_string());
    fixture.store.insert(record).await;
    fixture.gateway.push_job(description("J1", minutes(1)));
    let coordinator = fixture.coordinator().await.unwrap();

    let job = coordinator.poll_once().await.unwrap().unwrap();
    assert_eq!(job.acquisition_path, AcquisitionPath::Gateway);
    fixture
        .store
        .mark_defensive_takeover(&JobId::from_string("J1"))
        .await
        .unwrap();

    let outcome = coordinator.dispatch(job).await.unwrap().await.unwrap();

    assert!(matches!(
        outcome,
        JobOutcome::Completed {
            route: CompletionRoute::Direct,
            ..
        }
    ));
    assert_eq!(fixture.gateway.write_calls(), 1, "only the accept call");
    assert!(fixture.gateway.completions().is_empty());
}

/// The poll loop keeps running through gateway outages and exits on shutdown.
#[tokio::test]
async fn test_poll_loop_survives_gateway_errors() {
    let dir = TempDir::new().unwrap();
    let mut fixture = Fixture::new(dir.path());
    fixture.config.poll_interval = Duration::from_millis(10);
    fixture.gateway.set_poll_status(Some(502));
    let coordinator = fixture.coordinator().await.unwrap();

    let runner = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.run().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    coordinator.shutdown();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let polls = fixture
        .gateway
        .calls()
        .iter()
        .filter(|c| **c == GatewayCall::Poll)
        .count();
    assert!(polls >= 2, "polled {} times", polls);
}
