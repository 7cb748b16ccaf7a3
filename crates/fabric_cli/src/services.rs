use fabric_orchestrator::artifacts::{ArtifactDir, ArtifactSource};
use fabric_orchestrator::chaincode::ChaincodeLifecycleOrchestrator;
use fabric_orchestrator::channel::ChannelOrchestrator;
use fabric_orchestrator::config::TopologyConfig;
use fabric_orchestrator::deploy::DeployFlow;
use fabric_orchestrator::error::OrchestratorError;
use fabric_orchestrator::gateway::{LedgerGateway, PeerCliGateway};
use fabric_orchestrator::materials::FabricToolsGenerator;
use fabric_orchestrator::network::ComposeNetwork;
use fabric_orchestrator::process::{CommandRunner, TokioCommandRunner};
use fabric_orchestrator::store::{FileStateRepository, StateRepository};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything the commands talk to.
#[derive(Clone)]
pub struct Services {
    /// The network
    pub topology: Arc<TopologyConfig>,
    /// Runs `docker` for the network and material commands
    pub runner: Arc<dyn CommandRunner>,
    /// Remote ledger operations
    pub gateway: Arc<dyn LedgerGateway>,
    /// Generated channel artifacts
    pub artifacts: Arc<dyn ArtifactSource>,
    /// Approvals, commit records and checkpoints
    pub store: Arc<dyn StateRepository>,
}

impl Services {
    /// Production wiring: the `peer` CLI in the peer containers, artifacts
    /// from `channel-artifacts/` and state under `state_dir`.
    pub fn connect(topology: TopologyConfig, state_dir: &Path) -> anyhow::Result<Self> {
        let topology = Arc::new(topology);
        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
        let gateway = Arc::new(PeerCliGateway::new(topology.clone(), runner.clone()));
        let artifacts = Arc::new(ArtifactDir::new(topology.channel_artifacts_dir()));
        let store = Arc::new(FileStateRepository::new(state_dir).map_err(OrchestratorError::from)?);
        tracing::debug!(state_dir = %state_dir.display(), base_dir = %topology.base_dir.display(), "connected");
        Ok(Self {
            topology,
            runner,
            gateway,
            artifacts,
            store,
        })
    }

    /// The compose network of the topology
    pub fn network(&self) -> ComposeNetwork {
        ComposeNetwork::new(self.topology.clone(), self.runner.clone())
    }

    /// Crypto material and channel artifact generation
    pub fn materials(&self) -> FabricToolsGenerator {
        FabricToolsGenerator::new(self.topology.clone(), self.runner.clone())
    }

    /// Channel orchestrator with the topology's call policy
    pub fn channels(&self) -> ChannelOrchestrator {
        ChannelOrchestrator::new(
            self.topology.clone(),
            self.gateway.clone(),
            self.artifacts.clone(),
            self.store.clone(),
        )
    }

    /// Chaincode lifecycle orchestrator with the topology's call policy
    pub fn lifecycle(&self) -> ChaincodeLifecycleOrchestrator {
        ChaincodeLifecycleOrchestrator::new(
            self.topology.clone(),
            self.gateway.clone(),
            self.store.clone(),
        )
    }

    /// Deploy flow that stops before its next submission once `cancel` fires
    pub fn deploy_flow(&self, cancel: CancellationToken) -> DeployFlow {
        DeployFlow::new(Arc::new(self.lifecycle()), self.store.clone()).with_cancellation(cancel)
    }

    /// Fail unless the orderer and every peer container is running.
    pub async fn require_network(&self) -> anyhow::Result<()> {
        self.network()
            .require_running(&self.topology.service_containers())
            .await
            .map_err(OrchestratorError::from)?;
        Ok(())
    }
}
