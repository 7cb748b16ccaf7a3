//! Commands run against the in-memory ledger with a mocked `docker compose`.

use fabric_cli::cmds::{ChaincodeCmd, ChannelCmd, Command, DeployArgs, EnsureArgs};
use fabric_cli::{error_kind, exit_code, Services};
use fabric_orchestrator::config::TopologyConfig;
use fabric_orchestrator::error::{ErrorKind, Operation};
use fabric_orchestrator::process::{CommandOutput, Invocation, MockCommandRunner};
use fabric_orchestrator::store::StateRepository;
use fabric_orchestrator::test_utils::Harness;
use fabric_orchestrator::types::ChannelStatus;
use std::sync::Arc;

const ALL_RUNNING: &str = r#"{"Name":"orderer0","Service":"orderer.example.com","State":"running"}
{"Name":"peer0.org1.example.com","Service":"peer0.org1.example.com","State":"running"}
{"Name":"peer0.org2.example.com","Service":"peer0.org2.example.com","State":"running"}
"#;

const PEER_DOWN: &str = r#"{"Name":"orderer0","Service":"orderer.example.com","State":"running"}
{"Name":"peer0.org1.example.com","Service":"peer0.org1.example.com","State":"running"}
{"Name":"peer0.org2.example.com","Service":"peer0.org2.example.com","State":"exited"}
"#;

struct Fixture {
    _dir: tempfile::TempDir,
    harness: Harness,
    services: Services,
}

fn fixture(ps: &'static str) -> Fixture {
    fabric_trace::test_run().ok();
    let dir = tempfile::tempdir().unwrap();
    let mut topology = TopologyConfig::two_org_default();
    topology.base_dir = dir.path().to_path_buf();
    std::fs::write(topology.compose_file(), "services: {}\n").unwrap();

    let mut runner = MockCommandRunner::new();
    runner
        .expect_run()
        .withf(|inv: &Invocation| inv.args.contains(&"ps".to_string()))
        .returning(move |_| Ok(CommandOutput::ok(ps)));

    let harness = Harness::with_topology(topology);
    let services = Services {
        topology: harness.topology.clone(),
        runner: Arc::new(runner),
        gateway: harness.ledger.clone(),
        artifacts: harness.artifacts.clone(),
        store: harness.store.clone(),
    };
    Fixture {
        _dir: dir,
        harness,
        services,
    }
}

fn setup() -> Command {
    Command::Channel(ChannelCmd::Setup(EnsureArgs::default()))
}

fn deploy() -> Command {
    Command::Chaincode(ChaincodeCmd::Deploy(DeployArgs::default()))
}

#[tokio::test(start_paused = true)]
async fn channel_setup_reaches_ready_and_reruns_submit_nothing() {
    let f = fixture(ALL_RUNNING);
    setup().run(&f.services).await.unwrap();
    let state = f
        .services
        .channels()
        .status(&f.services.topology.channel)
        .await
        .unwrap();
    assert_eq!(state.status, ChannelStatus::Ready);

    let before = f.harness.ledger.total_submissions();
    setup().run(&f.services).await.unwrap();
    assert_eq!(f.harness.ledger.total_submissions(), before);
}

#[tokio::test(start_paused = true)]
async fn a_stopped_peer_blocks_channel_work_with_a_retryable_error() {
    let f = fixture(PEER_DOWN);
    let err = setup().run(&f.services).await.unwrap_err();
    assert_eq!(error_kind(&err), ErrorKind::Transient);
    assert_eq!(exit_code(&err), 1);
    assert!(err.to_string().contains("peer0.org2.example.com"));
    assert_eq!(f.harness.ledger.total_submissions(), 0);
}

#[tokio::test(start_paused = true)]
async fn deploy_needs_a_joined_channel() {
    let f = fixture(ALL_RUNNING);
    let err = deploy().run(&f.services).await.unwrap_err();
    assert_eq!(error_kind(&err), ErrorKind::Conflict);
    assert_eq!(exit_code(&err), 2);
    assert!(err.to_string().contains("channel setup"));
    assert_eq!(f.harness.ledger.submissions(Operation::Install), 0);
}

#[tokio::test(start_paused = true)]
async fn deploy_records_the_activation_contract() {
    let f = fixture(ALL_RUNNING);
    setup().run(&f.services).await.unwrap();
    deploy().run(&f.services).await.unwrap();

    let commit = f
        .services
        .store
        .latest_commit("npa-channel", "taskdocument")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(commit.definition.sequence, 1);
    assert!(commit.package_id.as_str().starts_with("taskdocument_1.0:"));

    Command::Chaincode(ChaincodeCmd::Activation {
        target: Default::default(),
        json: true,
    })
    .run(&f.services)
    .await
    .unwrap();

    let before = f.harness.ledger.total_submissions();
    deploy().run(&f.services).await.unwrap();
    assert_eq!(f.harness.ledger.total_submissions(), before);
}

#[tokio::test(start_paused = true)]
async fn activation_before_any_commit_is_a_conflict() {
    let f = fixture(ALL_RUNNING);
    let err = Command::Chaincode(ChaincodeCmd::Activation {
        target: Default::default(),
        json: false,
    })
    .run(&f.services)
    .await
    .unwrap_err();
    assert_eq!(exit_code(&err), 2);
}

#[tokio::test(start_paused = true)]
async fn the_next_sequence_deploys_from_flags() {
    let f = fixture(ALL_RUNNING);
    setup().run(&f.services).await.unwrap();
    deploy().run(&f.services).await.unwrap();

    let args = DeployArgs {
        version: Some("1.1".into()),
        sequence: Some(2),
        ..Default::default()
    };
    let request = args.request(&f.services);
    assert_eq!(request.source.label, "taskdocument_1.1");
    Command::Chaincode(ChaincodeCmd::Deploy(args))
        .run(&f.services)
        .await
        .unwrap();
    assert_eq!(
        f.harness
            .ledger
            .committed("npa-channel", "taskdocument")
            .unwrap()
            .sequence,
        2
    );

    // the same sequence again with other code needs a new sequence
    let stale = DeployArgs {
        version: Some("1.1".into()),
        sequence: Some(2),
        address: Some("chaincode-rest:9998".into()),
        ..Default::default()
    };
    let err = Command::Chaincode(ChaincodeCmd::Deploy(stale))
        .run(&f.services)
        .await
        .unwrap_err();
    assert_eq!(exit_code(&err), 2);
}
