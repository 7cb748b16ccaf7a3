use fabric_orchestrator::artifacts::ArtifactName;
use fabric_orchestrator::channel::{ChannelOrchestrator, StepOutcome};
use fabric_orchestrator::error::{ErrorKind, GatewayError, Operation, OrchestratorError};
use fabric_orchestrator::poll::Backoff;
use fabric_orchestrator::store::MemoryStateRepository;
use fabric_orchestrator::test_utils::Harness;
use fabric_orchestrator::types::{ChannelStatus, MspId, OrgId};
use matches::assert_matches;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const CHANNEL: &str = "npa-channel";

fn org(id: &str) -> OrgId {
    OrgId::new(id)
}

#[tokio::test(start_paused = true)]
async fn orderer_ready_after_five_seconds_is_waited_for() {
    fabric_trace::test_run();
    let h = Harness::two_org();
    h.ledger.orderer_ready_after(Duration::from_secs(5));

    let start = Instant::now();
    h.channels()
        .wait_for_orderer_ready(Duration::from_secs(30), &Backoff::default())
        .await
        .unwrap();
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(5), "returned after {:?}", waited);
    assert!(waited < Duration::from_secs(30));
    assert!(h.ledger.calls(Operation::PingOrderer) > 1);
}

#[tokio::test(start_paused = true)]
async fn orderer_that_never_comes_up_is_transient() {
    fabric_trace::test_run();
    let h = Harness::two_org();
    h.ledger.orderer_ready_after(Duration::from_secs(3600));

    let err = h
        .channels()
        .wait_for_orderer_ready(Duration::from_secs(10), &Backoff::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(err.kind().exit_code(), 1);
    assert_matches!(err, OrchestratorError::TransientUnavailable { last, .. } if last.contains("connection refused"));
}

#[tokio::test(start_paused = true)]
async fn ensure_channel_exists_is_idempotent() {
    fabric_trace::test_run();
    let h = Harness::two_org();
    let channels = h.channels();
    for _ in 0..3 {
        let state = channels.ensure_channel_exists(CHANNEL).await.unwrap();
        assert_eq!(state.status, ChannelStatus::Created);
    }
    assert_eq!(h.ledger.submissions(Operation::CreateChannel), 1);
}

#[tokio::test(start_paused = true)]
async fn a_transient_create_failure_is_retried() {
    fabric_trace::test_run();
    let h = Harness::two_org();
    h.ledger.fail_next(
        Operation::CreateChannel,
        GatewayError::Unavailable("orderer.example.com:7050: connection refused".into()),
    );
    h.channels().ensure_channel_exists(CHANNEL).await.unwrap();
    assert_eq!(h.ledger.calls(Operation::CreateChannel), 2);
    assert_eq!(h.ledger.submissions(Operation::CreateChannel), 1);
}

#[tokio::test(start_paused = true)]
async fn ensure_ready_reaches_ready_and_reruns_submit_nothing() {
    fabric_trace::test_run();
    let h = Harness::two_org();
    let channels = h.channels();

    let state = channels.ensure_ready(CHANNEL).await.unwrap();
    assert_eq!(state.status, ChannelStatus::Ready);
    assert!(state.has_joined(&org("Org1"), "peer0.org1.example.com"));
    assert!(state.has_joined(&org("Org2"), "peer0.org2.example.com"));
    assert_eq!(state.anchored.len(), 2);

    let before = h.ledger.total_submissions();
    let again = channels.ensure_ready(CHANNEL).await.unwrap();
    assert_eq!(again.status, ChannelStatus::Ready);
    assert_eq!(h.ledger.total_submissions(), before);
}

#[tokio::test(start_paused = true)]
async fn joins_commute() {
    fabric_trace::test_run();
    let orders = [["Org1", "Org2"], ["Org2", "Org1"]];
    let mut results = Vec::new();
    for order in orders {
        let h = Harness::two_org();
        let channels = h.channels();
        channels.ensure_channel_exists(CHANNEL).await.unwrap();
        let mut seen = Vec::new();
        for id in order {
            channels.join_org(CHANNEL, &org(id)).await.unwrap();
            seen.push(channels.status(CHANNEL).await.unwrap().status);
        }
        assert_eq!(seen, vec![ChannelStatus::PartiallyJoined, ChannelStatus::JoinedAll]);
        results.push(channels.status(CHANNEL).await.unwrap().joined);
    }
    assert_eq!(results[0], results[1]);
}

#[tokio::test(start_paused = true)]
async fn joining_twice_is_a_no_op() {
    fabric_trace::test_run();
    let h = Harness::two_org();
    let channels = h.channels();
    channels.ensure_channel_exists(CHANNEL).await.unwrap();
    let first = channels
        .join_peer(CHANNEL, &org("Org1"), "peer0.org1.example.com")
        .await
        .unwrap();
    let second = channels
        .join_peer(CHANNEL, &org("Org1"), "peer0.org1.example.com")
        .await
        .unwrap();
    assert_eq!(first, StepOutcome::Applied);
    assert_eq!(second, StepOutcome::AlreadyDone);
    assert_eq!(h.ledger.submissions(Operation::JoinChannel), 1);
}

#[tokio::test(start_paused = true)]
async fn joining_an_absent_channel_is_a_conflict() {
    fabric_trace::test_run();
    let h = Harness::two_org();
    let err = h
        .channels()
        .join_peer(CHANNEL, &org("Org1"), "peer0.org1.example.com")
        .await
        .unwrap_err();
    assert_matches!(err, OrchestratorError::StateConflict { .. });
    assert_eq!(err.kind().exit_code(), 2);
}

#[tokio::test(start_paused = true)]
async fn anchors_need_a_joined_peer() {
    fabric_trace::test_run();
    let h = Harness::two_org();
    let channels = h.channels();
    channels.ensure_channel_exists(CHANNEL).await.unwrap();
    assert_matches!(
        channels.update_anchor_peers(CHANNEL, &org("Org2")).await,
        Err(OrchestratorError::StateConflict { .. })
    );

    channels.join_org(CHANNEL, &org("Org2")).await.unwrap();
    assert_eq!(
        channels.update_anchor_peers(CHANNEL, &org("Org2")).await.unwrap(),
        StepOutcome::Applied
    );
    assert_eq!(
        channels.update_anchor_peers(CHANNEL, &org("Org2")).await.unwrap(),
        StepOutcome::AlreadyDone
    );
    assert_eq!(h.ledger.submissions(Operation::UpdateAnchorPeers), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_anchor_artifact_halts_after_the_joins() {
    fabric_trace::test_run();
    let h = Harness::two_org();
    h.artifacts
        .remove(&ArtifactName::AnchorTx(MspId::new("Org2MSP")));

    let err = h.channels().ensure_ready(CHANNEL).await.unwrap_err();
    assert_eq!(err.step, "anchor Org2");
    assert_eq!(err.reached, ChannelStatus::JoinedAll);
    assert_eq!(err.kind(), ErrorKind::ArtifactMissing);
    assert!(err.source.to_string().contains("Org2MSPanchors.tx"));
}

#[tokio::test(start_paused = true)]
async fn denied_join_reports_the_state_reached_and_resumes() {
    fabric_trace::test_run();
    let h = Harness::two_org();
    h.ledger.deny(Operation::JoinChannel);

    let err = h.channels().ensure_ready(CHANNEL).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(err.reached, ChannelStatus::Created);
    assert!(err.step.starts_with("join "));

    h.ledger.allow(Operation::JoinChannel);
    let state = h.channels().ensure_ready(CHANNEL).await.unwrap();
    assert_eq!(state.status, ChannelStatus::Ready);
    assert_eq!(h.ledger.submissions(Operation::CreateChannel), 1);
}

#[tokio::test(start_paused = true)]
async fn a_failed_join_leaves_the_channel_partially_joined() {
    fabric_trace::test_run();
    let h = Harness::two_org();
    let channels = h.channels();
    channels.ensure_channel_exists(CHANNEL).await.unwrap();
    channels.join_org(CHANNEL, &org("Org1")).await.unwrap();
    h.ledger
        .fail_next(Operation::JoinChannel, GatewayError::Rejected("bad block".into()));

    let err = channels.ensure_ready(CHANNEL).await.unwrap_err();
    assert_eq!(err.reached, ChannelStatus::PartiallyJoined);
    assert_eq!(
        channels.status(CHANNEL).await.unwrap().status,
        ChannelStatus::PartiallyJoined
    );

    let state = channels.ensure_ready(CHANNEL).await.unwrap();
    assert_eq!(state.status, ChannelStatus::Ready);
}

#[tokio::test(start_paused = true)]
async fn force_recreate_replaces_a_stale_genesis_block() {
    fabric_trace::test_run();
    let h = Harness::two_org();
    h.ready_channel().await;

    // the network is wiped and another operator recreates the channel
    h.ledger.wipe();
    let other = ChannelOrchestrator::new(
        h.topology.clone(),
        h.ledger.clone(),
        h.artifacts.clone(),
        Arc::new(MemoryStateRepository::new()),
    )
    .with_policy(Harness::policy());
    other.ensure_channel_exists(CHANNEL).await.unwrap();

    let channels = h.channels();
    let err = channels.ensure_ready(CHANNEL).await.unwrap_err();
    assert!(err.step.starts_with("join "));
    assert!(err.source.to_string().contains("earlier network"));

    let state = channels.force_recreate_channel(CHANNEL).await.unwrap();
    assert_eq!(state.status, ChannelStatus::Created);
    let state = channels.ensure_ready(CHANNEL).await.unwrap();
    assert_eq!(state.status, ChannelStatus::Ready);
}

#[tokio::test(start_paused = true)]
async fn force_recreate_creates_a_lost_channel() {
    fabric_trace::test_run();
    let h = Harness::two_org();
    h.ready_channel().await;
    h.ledger.wipe();

    let channels = h.channels();
    assert_eq!(
        channels.status(CHANNEL).await.unwrap().status,
        ChannelStatus::Absent
    );
    channels.force_recreate_channel(CHANNEL).await.unwrap();
    let state = channels.ensure_ready(CHANNEL).await.unwrap();
    assert_eq!(state.status, ChannelStatus::Ready);
    assert_eq!(h.ledger.submissions(Operation::CreateChannel), 2);
}

#[tokio::test(start_paused = true)]
async fn stalled_peers_are_detected() {
    fabric_trace::test_run();
    let h = Harness::two_org();
    h.ledger.stall_peer("peer0.org2.example.com");
    h.ready_channel().await;

    let stuck = h.channels().detect_stuck(CHANNEL).await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].org, org("Org2"));
    assert_eq!(stuck[0].peer, "peer0.org2.example.com");
    assert_eq!(stuck[0].height, 1);
}

#[tokio::test(start_paused = true)]
async fn a_fresh_channel_has_no_stuck_peers() {
    fabric_trace::test_run();
    let h = Harness::two_org();
    let channels = h.channels();
    channels.ensure_channel_exists(CHANNEL).await.unwrap();
    channels.join_org(CHANNEL, &org("Org1")).await.unwrap();
    assert!(channels.detect_stuck(CHANNEL).await.unwrap().is_empty());
}
