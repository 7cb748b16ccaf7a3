//! Call-level expectations against a mocked gateway.

use fabric_orchestrator::channel::{ChannelOrchestrator, StepOutcome};
use fabric_orchestrator::chaincode::ChaincodeLifecycleOrchestrator;
use fabric_orchestrator::config::TopologyConfig;
use fabric_orchestrator::error::{ErrorKind, GatewayError, OrchestratorError};
use fabric_orchestrator::gateway::{ApprovedDefinition, CommittedDefinition, MockLedgerGateway};
use fabric_orchestrator::store::{MemoryStateRepository, StateRepository};
use fabric_orchestrator::test_utils::{Harness, MemoryArtifacts};
use fabric_orchestrator::types::{ChaincodeDefinition, OrgId, PackageId};
use matches::assert_matches;
use std::sync::Arc;

fn channels(gateway: MockLedgerGateway, store: Arc<MemoryStateRepository>) -> ChannelOrchestrator {
    let topology = TopologyConfig::two_org_default();
    let artifacts = Arc::new(MemoryArtifacts::for_topology(&topology));
    ChannelOrchestrator::new(Arc::new(topology), Arc::new(gateway), artifacts, store)
        .with_policy(Harness::policy())
}

fn lifecycle(gateway: MockLedgerGateway) -> ChaincodeLifecycleOrchestrator {
    ChaincodeLifecycleOrchestrator::new(
        Arc::new(TopologyConfig::two_org_default()),
        Arc::new(gateway),
        Arc::new(MemoryStateRepository::new()),
    )
    .with_policy(Harness::policy())
}

#[tokio::test(start_paused = true)]
async fn an_existing_channel_is_never_created_again() {
    fabric_trace::test_run();
    let mut gateway = MockLedgerGateway::new();
    gateway.expect_channel_exists().returning(|_, _| Ok(true));
    gateway.expect_create_channel().never();
    gateway
        .expect_fetch_genesis_block()
        .times(1)
        .returning(|_, _| Ok(b"block".to_vec()));
    gateway
        .expect_joined_channels()
        .returning(|_, _| Ok(Vec::new()));

    let store = Arc::new(MemoryStateRepository::new());
    channels(gateway, store.clone())
        .ensure_channel_exists("npa-channel")
        .await
        .unwrap();
    assert_eq!(
        store.channel_block("npa-channel").await.unwrap(),
        Some(b"block".to_vec())
    );
}

#[tokio::test(start_paused = true)]
async fn a_joined_peer_is_not_joined_again() {
    fabric_trace::test_run();
    let mut gateway = MockLedgerGateway::new();
    gateway.expect_channel_exists().returning(|_, _| Ok(true));
    gateway
        .expect_joined_channels()
        .returning(|_, _| Ok(vec!["npa-channel".to_string()]));
    gateway.expect_join_channel().never();

    let outcome = channels(gateway, Arc::new(MemoryStateRepository::new()))
        .join_peer("npa-channel", &OrgId::new("Org1"), "peer0.org1.example.com")
        .await
        .unwrap();
    assert_eq!(outcome, StepOutcome::AlreadyDone);
}

#[tokio::test(start_paused = true)]
async fn a_rejected_join_that_landed_anyway_counts_as_done() {
    fabric_trace::test_run();
    let mut gateway = MockLedgerGateway::new();
    gateway.expect_channel_exists().returning(|_, _| Ok(true));
    let mut listed = 0;
    gateway.expect_joined_channels().returning(move |_, _| {
        listed += 1;
        // the first listing happens before the join
        Ok(if listed > 1 {
            vec!["npa-channel".to_string()]
        } else {
            Vec::new()
        })
    });
    gateway
        .expect_join_channel()
        .times(1)
        .returning(|_, _, _| Err(GatewayError::Rejected("ledger already exists".into())));

    let store = Arc::new(MemoryStateRepository::new());
    store
        .put_channel_block("npa-channel", b"block".to_vec())
        .await
        .unwrap();
    let outcome = channels(gateway, store)
        .join_peer("npa-channel", &OrgId::new("Org1"), "peer0.org1.example.com")
        .await
        .unwrap();
    assert_eq!(outcome, StepOutcome::Applied);
}

#[tokio::test(start_paused = true)]
async fn permission_denied_is_surfaced_verbatim() {
    fabric_trace::test_run();
    let mut gateway = MockLedgerGateway::new();
    gateway.expect_query_committed().returning(|_, _, _| Ok(None));
    gateway.expect_query_approved().returning(|_, _| Ok(None));
    gateway.expect_approve().times(1).returning(|_, _, _| {
        Err(GatewayError::PermissionDenied(
            "signature set did not satisfy policy".into(),
        ))
    });

    let err = lifecycle(gateway)
        .approve_for_org(
            &OrgId::new("Org2"),
            &ChaincodeDefinition::new("npa-channel", "taskdocument", "1.0", 1),
            &PackageId::new("taskdocument_1.0:abcd"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_matches!(
        &err,
        OrchestratorError::PermissionDenied { message, .. }
            if message == "signature set did not satisfy policy"
    );
    assert!(err.to_string().contains("[org Org2 on npa-channel]"));
}

#[tokio::test(start_paused = true)]
async fn a_committed_sequence_is_refused_before_collecting_approvals() {
    fabric_trace::test_run();
    let mut gateway = MockLedgerGateway::new();
    gateway.expect_query_committed().returning(|_, _, _| {
        Ok(Some(CommittedDefinition {
            version: "1.0".into(),
            sequence: 2,
        }))
    });
    gateway.expect_query_approved().never();
    gateway.expect_commit().never();

    let err = lifecycle(gateway)
        .commit(&ChaincodeDefinition::new("npa-channel", "taskdocument", "1.0", 2))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        OrchestratorError::StaleSequence { requested: 2, committed: 2, .. }
    );
}

#[tokio::test(start_paused = true)]
async fn approvals_for_another_version_do_not_count() {
    fabric_trace::test_run();
    let mut gateway = MockLedgerGateway::new();
    gateway.expect_query_approved().returning(|org, _| {
        Ok(Some(ApprovedDefinition {
            version: if org.id.as_str() == "Org1" { "1.0" } else { "0.9" }.into(),
            sequence: 1,
            package_id: Some(PackageId::new("taskdocument_1.0:abcd")),
        }))
    });

    let readiness = lifecycle(gateway)
        .check_commit_readiness(&ChaincodeDefinition::new(
            "npa-channel",
            "taskdocument",
            "1.0",
            1,
        ))
        .await
        .unwrap();
    assert_eq!(
        readiness.missing.clone().into_iter().collect::<Vec<_>>(),
        vec![OrgId::new("Org2")]
    );
    assert_eq!(
        readiness.approvals.keys().collect::<Vec<_>>(),
        vec![&OrgId::new("Org1")]
    );
    assert_eq!(readiness.agreed_package(), None);
}
