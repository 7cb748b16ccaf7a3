use fabric_orchestrator::channel::StepOutcome;
use fabric_orchestrator::error::{ErrorKind, Operation, OrchestratorError};
use fabric_orchestrator::package::DefinitionSource;
use fabric_orchestrator::store::{ApprovalKey, StateRepository};
use fabric_orchestrator::test_utils::Harness;
use fabric_orchestrator::types::{ChaincodeDefinition, OrgId};
use matches::assert_matches;
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;

fn org(id: &str) -> OrgId {
    OrgId::new(id)
}

fn definition(version: &str, sequence: u64) -> ChaincodeDefinition {
    ChaincodeDefinition::new("npa-channel", "taskdocument", version, sequence)
}

fn source(address: &str) -> DefinitionSource {
    DefinitionSource::new("taskdocument_1.0", address)
}

async fn ready() -> Harness {
    fabric_trace::test_run();
    let h = Harness::two_org();
    h.ready_channel().await;
    h
}

#[tokio::test(start_paused = true)]
async fn conflicting_packages_block_the_commit() {
    let h = ready().await;
    let cc = h.lifecycle();
    let def = definition("1.0", 1);

    let a = cc.package(&source("chaincode-rest:9999")).unwrap();
    let b = cc.package(&source("chaincode-rest:9998")).unwrap();
    assert_ne!(a.package_id(), b.package_id());

    let a_id = cc.install_on_org(&org("Org1"), &a).await.unwrap();
    let b_id = cc.install_on_org(&org("Org2"), &b).await.unwrap();
    cc.approve_for_org(&org("Org1"), &def, &a_id).await.unwrap();
    cc.approve_for_org(&org("Org2"), &def, &b_id).await.unwrap();

    let err = cc.check_commit_readiness(&def).await.unwrap_err();
    assert_matches!(
        &err,
        OrchestratorError::DefinitionConflict { approvals, .. }
            if approvals[&org("Org1")] == a_id && approvals[&org("Org2")] == b_id
    );
    assert_eq!(err.kind().exit_code(), 2);

    assert_matches!(
        cc.commit(&def).await,
        Err(OrchestratorError::DefinitionConflict { .. })
    );
    assert_eq!(h.ledger.submissions(Operation::Commit), 0);
    assert_eq!(h.ledger.committed("npa-channel", "taskdocument"), None);
    assert_eq!(h.store.latest_commit("npa-channel", "taskdocument").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn commit_then_stale_sequence_then_next_sequence() {
    let h = ready().await;
    let cc = h.lifecycle();
    let def = definition("1.0", 1);

    let pkg = cc.package(&source("chaincode-rest:9999")).unwrap();
    for id in ["Org1", "Org2"] {
        let pkg_id = cc.install_on_org(&org(id), &pkg).await.unwrap();
        cc.approve_for_org(&org(id), &def, &pkg_id).await.unwrap();
    }
    assert!(cc.check_commit_readiness(&def).await.unwrap().is_ready());

    let record = cc.commit(&def).await.unwrap();
    assert!(record.committed);
    assert_eq!(record.package_id, pkg.package_id());
    assert_eq!(
        h.store.commit_record(&def.key()).await.unwrap(),
        Some(record.clone())
    );
    assert_eq!(
        h.ledger.committed("npa-channel", "taskdocument").unwrap().sequence,
        1
    );

    let err = cc.commit(&def).await.unwrap_err();
    assert_matches!(
        err,
        OrchestratorError::StaleSequence { requested: 1, committed: 1, .. }
    );
    assert_eq!(h.ledger.submissions(Operation::Commit), 1);

    let next = def.next_sequence("1.1");
    let pkg2 = cc
        .package(&DefinitionSource::new("taskdocument_1.1", "chaincode-rest:9999"))
        .unwrap();
    for id in ["Org1", "Org2"] {
        let pkg_id = cc.install_on_org(&org(id), &pkg2).await.unwrap();
        cc.approve_for_org(&org(id), &next, &pkg_id).await.unwrap();
    }
    let record = cc.commit(&next).await.unwrap();
    assert_eq!(record.definition.sequence, 2);
    assert_eq!(
        cc.latest_committed("npa-channel", "taskdocument")
            .await
            .unwrap(),
        Some(next)
    );
}

#[tokio::test(start_paused = true)]
async fn commit_waits_for_every_required_org() {
    let h = ready().await;
    let cc = h.lifecycle();
    let def = definition("1.0", 1);
    let pkg = cc.package(&source("chaincode-rest:9999")).unwrap();
    let pkg_id = cc.install_on_org(&org("Org1"), &pkg).await.unwrap();
    cc.approve_for_org(&org("Org1"), &def, &pkg_id).await.unwrap();

    let err = cc.commit(&def).await.unwrap_err();
    assert_matches!(
        &err,
        OrchestratorError::CommitNotReady { missing, .. }
            if missing == &BTreeSet::from([org("Org2")])
    );
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.ledger.submissions(Operation::Commit), 0);
}

#[tokio::test(start_paused = true)]
async fn install_and_approve_are_idempotent() {
    let h = ready().await;
    let cc = h.lifecycle();
    let def = definition("1.0", 1);
    let pkg = cc.package(&source("chaincode-rest:9999")).unwrap();

    let first = cc.install_on_org(&org("Org1"), &pkg).await.unwrap();
    let second = cc.install_on_org(&org("Org1"), &pkg).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.ledger.submissions(Operation::Install), 1);

    assert_eq!(
        cc.approve_for_org(&org("Org1"), &def, &first).await.unwrap(),
        StepOutcome::Applied
    );
    assert_eq!(
        cc.approve_for_org(&org("Org1"), &def, &first).await.unwrap(),
        StepOutcome::AlreadyDone
    );
    assert_eq!(h.ledger.submissions(Operation::Approve), 1);

    let stored = h
        .store
        .approval(&ApprovalKey::new(def.key(), org("Org1")))
        .await
        .unwrap()
        .unwrap();
    assert!(stored.value.approved);
    assert_eq!(stored.value.package_id, Some(first));
}

#[tokio::test(start_paused = true)]
async fn a_changed_vote_is_resubmitted() {
    let h = ready().await;
    let cc = h.lifecycle();
    let def = definition("1.0", 1);
    let a = cc.package(&source("chaincode-rest:9999")).unwrap();
    let b = cc.package(&source("chaincode-rest:9998")).unwrap();

    cc.approve_for_org(&org("Org1"), &def, &a.package_id()).await.unwrap();
    assert_eq!(
        cc.approve_for_org(&org("Org1"), &def, &b.package_id()).await.unwrap(),
        StepOutcome::Applied
    );
    assert_eq!(h.ledger.submissions(Operation::Approve), 2);
    let stored = h
        .store
        .approval(&ApprovalKey::new(def.key(), org("Org1")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.value.package_id, Some(b.package_id()));
}

#[tokio::test(start_paused = true)]
async fn approving_a_committed_sequence_is_stale() {
    let h = ready().await;
    let flow = h.deploy_flow();
    flow.run(&h.request()).await.unwrap();

    let cc = h.lifecycle();
    let pkg = cc.package(&source("chaincode-rest:9999")).unwrap();
    assert_matches!(
        cc.approve_for_org(&org("Org1"), &definition("1.0", 1), &pkg.package_id())
            .await,
        Err(OrchestratorError::StaleSequence { .. })
    );
}

#[tokio::test(start_paused = true)]
async fn readiness_refreshes_approvals_made_elsewhere() {
    let h = ready().await;
    let cc = h.lifecycle();
    let def = definition("1.0", 1);
    let pkg = cc.package(&source("chaincode-rest:9999")).unwrap();

    // both orgs voted through some other tool
    h.ledger.force_approve(&org("Org1"), &def, &pkg.package_id());
    h.ledger.force_approve(&org("Org2"), &def, &pkg.package_id());

    assert!(cc.check_commit_readiness(&def).await.unwrap().is_ready());
    let stored = h.store.approvals(&def.key()).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|a| a.approved));

    let record = cc.commit(&def).await.unwrap();
    assert_eq!(record.package_id, pkg.package_id());
}

#[tokio::test(start_paused = true)]
async fn required_orgs_limit_who_must_approve() {
    fabric_trace::test_run();
    let mut topology = fabric_orchestrator::config::TopologyConfig::two_org_default();
    topology.chaincode.required_orgs = vec![org("Org1")];
    let h = Harness::with_topology(topology);
    h.ready_channel().await;

    let cc = h.lifecycle();
    let def = definition("1.0", 1);
    let pkg = cc.package(&source("chaincode-rest:9999")).unwrap();
    let pkg_id = cc.install_on_org(&org("Org1"), &pkg).await.unwrap();
    cc.approve_for_org(&org("Org1"), &def, &pkg_id).await.unwrap();

    assert!(cc.check_commit_readiness(&def).await.unwrap().is_ready());
    cc.commit(&def).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn the_commit_record_names_the_package_required_orgs_agreed_on() {
    fabric_trace::test_run();
    let mut topology = fabric_orchestrator::config::TopologyConfig::two_org_default();
    topology.chaincode.required_orgs = vec![org("Org2")];
    let h = Harness::with_topology(topology);
    h.ready_channel().await;

    let cc = h.lifecycle();
    let def = definition("1.0", 1);
    let other = cc.package(&source("chaincode-rest:9998")).unwrap();
    let agreed = cc.package(&source("chaincode-rest:9999")).unwrap();
    let other_id = cc.install_on_org(&org("Org1"), &other).await.unwrap();
    let agreed_id = cc.install_on_org(&org("Org2"), &agreed).await.unwrap();

    // Org1 is not required and votes for other code
    cc.approve_for_org(&org("Org1"), &def, &other_id).await.unwrap();
    cc.approve_for_org(&org("Org2"), &def, &agreed_id).await.unwrap();

    let readiness = cc.check_commit_readiness(&def).await.unwrap();
    assert_eq!(readiness.agreed_package(), Some(&agreed_id));
    assert!(!readiness.approvals.contains_key(&org("Org1")));

    let record = cc.commit(&def).await.unwrap();
    assert_eq!(record.package_id, agreed_id);
    assert_eq!(
        h.store.commit_record(&def.key()).await.unwrap().unwrap().package_id,
        agreed_id
    );
}

#[tokio::test(start_paused = true)]
async fn the_ledger_outranks_a_leftover_commit_record() {
    let h = ready().await;
    let cc = h.lifecycle();
    h.deploy_flow().run(&h.request()).await.unwrap();

    // the network is wiped but the state directory is kept
    h.ledger.wipe();
    h.ready_channel().await;
    assert!(h
        .store
        .latest_commit("npa-channel", "taskdocument")
        .await
        .unwrap()
        .is_some());
    assert_eq!(
        cc.latest_committed("npa-channel", "taskdocument").await.unwrap(),
        None
    );

    let def = definition("1.0", 1);
    let pkg = cc.package(&source("chaincode-rest:9998")).unwrap();
    for id in ["Org1", "Org2"] {
        let pkg_id = cc.install_on_org(&org(id), &pkg).await.unwrap();
        cc.approve_for_org(&org(id), &def, &pkg_id).await.unwrap();
    }
    let record = cc.commit(&def).await.unwrap();
    assert_eq!(record.package_id, pkg.package_id());
    assert_eq!(
        h.store.commit_record(&def.key()).await.unwrap(),
        Some(record)
    );
}
