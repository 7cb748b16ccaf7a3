//! In-memory stand-ins for the ledger and the artifact directory.
//!
//! [`FakeLedger`] models what the orchestrators rely on: orderer readiness,
//! channel membership through genesis blocks, anchor peers, installed
//! packages and the lifecycle endorsement rules. Faults are injected per
//! [`Operation`].

use crate::artifacts::{Artifact, ArtifactName, ArtifactSource};
use crate::chaincode::ChaincodeLifecycleOrchestrator;
use crate::channel::ChannelOrchestrator;
use crate::config::TopologyConfig;
use crate::deploy::{DeployFlow, DeployRequest};
use crate::error::{GatewayError, GatewayResult, Operation, OrchestratorError, OrchestratorResult};
use crate::gateway::{ApprovedDefinition, CommittedDefinition, InstalledPackage, LedgerGateway};
use crate::poll::{Backoff, CallPolicy};
use crate::store::MemoryStateRepository;
use crate::types::{ChaincodeDefinition, Endpoint, MspId, OrgId, Organization, PackageId, PeerNode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Anchor update transaction understood by [`FakeLedger`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeAnchorTx {
    /// Org the update is for
    pub msp_id: MspId,
    /// Anchors it sets
    pub anchors: Vec<Endpoint>,
}

impl FakeAnchorTx {
    /// The update an org's configured anchors produce
    pub fn for_org(org: &Organization) -> Self {
        Self {
            msp_id: org.msp_id.clone(),
            anchors: org.anchor_peers.clone(),
        }
    }

    /// Encode
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Artifacts held in memory.
#[derive(Default)]
pub struct MemoryArtifacts(Mutex<HashMap<ArtifactName, Vec<u8>>>);

impl MemoryArtifacts {
    /// Empty
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything `configtxgen` would produce for the topology
    pub fn for_topology(topology: &TopologyConfig) -> Self {
        let artifacts = Self::new();
        artifacts.insert(ArtifactName::Genesis, b"system genesis".to_vec());
        artifacts.insert(
            ArtifactName::ChannelTx(topology.channel.clone()),
            format!("create {}", topology.channel).into_bytes(),
        );
        for org in &topology.organizations {
            artifacts.insert(
                ArtifactName::AnchorTx(org.msp_id.clone()),
                FakeAnchorTx::for_org(org).to_bytes(),
            );
        }
        artifacts
    }

    /// Add or replace an artifact
    pub fn insert(&self, name: ArtifactName, bytes: Vec<u8>) {
        self.0.lock().insert(name, bytes);
    }

    /// Drop an artifact
    pub fn remove(&self, name: &ArtifactName) {
        self.0.lock().remove(name);
    }
}

impl ArtifactSource for MemoryArtifacts {
    fn load(&self, name: &ArtifactName) -> OrchestratorResult<Artifact> {
        self.0
            .lock()
            .get(name)
            .map(|bytes| Artifact {
                name: name.file_name(),
                bytes: bytes.clone(),
            })
            .ok_or_else(|| OrchestratorError::ArtifactMissing {
                name: name.file_name(),
                path: format!("memory/{}", name.file_name()).into(),
            })
    }

    fn exists(&self, name: &ArtifactName) -> bool {
        self.0.lock().contains_key(name)
    }
}

#[derive(Default)]
struct FakeChannel {
    epoch: u64,
    height: u64,
    joined: BTreeSet<String>,
    anchors: BTreeMap<MspId, Vec<Endpoint>>,
    approvals: BTreeMap<(String, u64), BTreeMap<OrgId, ApprovedDefinition>>,
    committed: BTreeMap<String, CommittedDefinition>,
}

#[derive(Default)]
struct LedgerState {
    orderer_ready_at: Option<Instant>,
    epoch: u64,
    channels: BTreeMap<String, FakeChannel>,
    installed: BTreeMap<String, BTreeMap<PackageId, String>>,
    stalled: BTreeSet<String>,
    denied: BTreeSet<Operation>,
    fail_next: BTreeMap<Operation, VecDeque<GatewayError>>,
    submissions: BTreeMap<Operation, usize>,
    calls: BTreeMap<Operation, usize>,
}

/// In-memory ledger implementing [`LedgerGateway`].
#[derive(Default)]
pub struct FakeLedger(Mutex<LedgerState>);

fn genesis_block(channel: &str, epoch: u64) -> Vec<u8> {
    format!("genesis {} {}", channel, epoch).into_bytes()
}

fn parse_genesis(block: &[u8]) -> Option<(String, u64)> {
    let text = std::str::from_utf8(block).ok()?;
    let mut parts = text.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("genesis"), Some(channel), Some(epoch)) => {
            Some((channel.to_string(), epoch.parse().ok()?))
        }
        _ => None,
    }
}

/// Label from the `metadata.json` of a `ccaas` package.
fn package_label(package: &[u8]) -> Option<String> {
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(package));
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        if entry.path().ok()?.to_str()? == "metadata.json" {
            let mut json = Vec::new();
            entry.read_to_end(&mut json).ok()?;
            let value: serde_json::Value = serde_json::from_slice(&json).ok()?;
            return value.get("label")?.as_str().map(str::to_string);
        }
    }
    None
}

fn rejected(msg: impl Into<String>) -> GatewayError {
    GatewayError::Rejected(msg.into())
}

impl FakeLedger {
    /// A ready orderer with no channels
    pub fn new() -> Self {
        Self::default()
    }

    /// The orderer refuses connections until `delay` from now
    pub fn orderer_ready_after(&self, delay: Duration) {
        self.0.lock().orderer_ready_at = Some(Instant::now() + delay);
    }

    /// Every call of `op` is denied
    pub fn deny(&self, op: Operation) {
        self.0.lock().denied.insert(op);
    }

    /// Stop denying `op`
    pub fn allow(&self, op: Operation) {
        self.0.lock().denied.remove(&op);
    }

    /// The next call of `op` fails with `error`
    pub fn fail_next(&self, op: Operation, error: GatewayError) {
        self.0.lock().fail_next.entry(op).or_default().push_back(error);
    }

    /// The peer stops receiving blocks after its genesis block
    pub fn stall_peer(&self, peer: &str) {
        self.0.lock().stalled.insert(peer.to_string());
    }

    /// Transactions of kind `op` that reached the ledger
    pub fn submissions(&self, op: Operation) -> usize {
        self.0.lock().submissions.get(&op).copied().unwrap_or(0)
    }

    /// Transactions of any kind that reached the ledger
    pub fn total_submissions(&self) -> usize {
        self.0.lock().submissions.values().sum()
    }

    /// Calls of `op`, including failed ones
    pub fn calls(&self, op: Operation) -> usize {
        self.0.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Lose every channel and installed package, as when the network's
    /// volumes are removed. Blocks fetched before are stale afterwards.
    pub fn wipe(&self) {
        let mut s = self.0.lock();
        s.channels.clear();
        s.installed.clear();
    }

    /// Peers that joined `channel`
    pub fn joined(&self, channel: &str) -> BTreeSet<String> {
        self.0
            .lock()
            .channels
            .get(channel)
            .map(|c| c.joined.clone())
            .unwrap_or_default()
    }

    /// Join a peer behind the orchestrators' back
    pub fn force_join(&self, channel: &str, peer: &str) {
        if let Some(c) = self.0.lock().channels.get_mut(channel) {
            c.joined.insert(peer.to_string());
        }
    }

    /// Record an approval behind the orchestrators' back
    pub fn force_approve(&self, org: &OrgId, definition: &ChaincodeDefinition, package_id: &PackageId) {
        if let Some(c) = self.0.lock().channels.get_mut(&definition.channel) {
            c.approvals
                .entry((definition.name.clone(), definition.sequence))
                .or_default()
                .insert(
                    org.clone(),
                    ApprovedDefinition {
                        version: definition.version.clone(),
                        sequence: definition.sequence,
                        package_id: Some(package_id.clone()),
                    },
                );
        }
    }

    /// Committed definition of a chaincode
    pub fn committed(&self, channel: &str, name: &str) -> Option<CommittedDefinition> {
        self.0
            .lock()
            .channels
            .get(channel)
            .and_then(|c| c.committed.get(name).cloned())
    }

    /// Apply injected faults and orderer readiness to a call.
    fn gate(&self, op: Operation, needs_orderer: bool) -> GatewayResult<parking_lot::MutexGuard<'_, LedgerState>> {
        let mut s = self.0.lock();
        *s.calls.entry(op).or_default() += 1;
        if s.denied.contains(&op) {
            return Err(GatewayError::PermissionDenied(format!(
                "access denied for [{}]: identity is not an admin",
                op
            )));
        }
        if let Some(e) = s.fail_next.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(e);
        }
        if needs_orderer {
            if let Some(at) = s.orderer_ready_at {
                if Instant::now() < at {
                    return Err(GatewayError::Unavailable(
                        "orderer.example.com:7050: connection refused".into(),
                    ));
                }
            }
        }
        Ok(s)
    }

    fn submitted(s: &mut LedgerState, op: Operation) {
        *s.submissions.entry(op).or_default() += 1;
    }
}

fn channel_mut<'a>(s: &'a mut LedgerState, channel: &str) -> GatewayResult<&'a mut FakeChannel> {
    s.channels
        .get_mut(channel)
        .ok_or_else(|| GatewayError::NotFound(format!("channel {} not found", channel)))
}

#[async_trait::async_trait]
impl LedgerGateway for FakeLedger {
    async fn ping_orderer(&self, _org: &Organization) -> GatewayResult<()> {
        self.gate(Operation::PingOrderer, true).map(|_| ())
    }

    async fn channel_exists(&self, _org: &Organization, channel: &str) -> GatewayResult<bool> {
        let s = self.gate(Operation::ChannelExists, true)?;
        Ok(s.channels.contains_key(channel))
    }

    async fn create_channel(
        &self,
        _org: &Organization,
        channel: &str,
        creation_tx: &[u8],
    ) -> GatewayResult<Vec<u8>> {
        let mut s = self.gate(Operation::CreateChannel, true)?;
        if s.channels.contains_key(channel) {
            return Err(rejected(format!("channel {} already exists", channel)));
        }
        if creation_tx != format!("create {}", channel).as_bytes() {
            return Err(rejected("creation transaction is for another channel"));
        }
        s.epoch += 1;
        let epoch = s.epoch;
        s.channels.insert(
            channel.to_string(),
            FakeChannel {
                epoch,
                height: 1,
                ..Default::default()
            },
        );
        Self::submitted(&mut s, Operation::CreateChannel);
        Ok(genesis_block(channel, epoch))
    }

    async fn fetch_genesis_block(&self, _org: &Organization, channel: &str) -> GatewayResult<Vec<u8>> {
        let mut s = self.gate(Operation::FetchChannelBlock, true)?;
        let c = channel_mut(&mut s, channel)?;
        Ok(genesis_block(channel, c.epoch))
    }

    async fn joined_channels(&self, _org: &Organization, peer: &PeerNode) -> GatewayResult<Vec<String>> {
        let s = self.gate(Operation::ListJoinedChannels, false)?;
        Ok(s.channels
            .iter()
            .filter(|(_, c)| c.joined.contains(&peer.name))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn join_channel(
        &self,
        _org: &Organization,
        peer: &PeerNode,
        genesis_block: &[u8],
    ) -> GatewayResult<()> {
        let mut s = self.gate(Operation::JoinChannel, true)?;
        let (channel, epoch) =
            parse_genesis(genesis_block).ok_or_else(|| rejected("not a genesis block"))?;
        let c = channel_mut(&mut s, &channel)?;
        if c.epoch != epoch {
            return Err(rejected(format!(
                "genesis block of {} is from an earlier network",
                channel
            )));
        }
        if !c.joined.insert(peer.name.clone()) {
            return Err(rejected("ledger already exists"));
        }
        Self::submitted(&mut s, Operation::JoinChannel);
        Ok(())
    }

    async fn channel_height(
        &self,
        _org: &Organization,
        peer: &PeerNode,
        channel: &str,
    ) -> GatewayResult<u64> {
        let mut s = self.gate(Operation::ChannelHeight, false)?;
        let stalled = s.stalled.contains(&peer.name);
        let c = channel_mut(&mut s, channel)?;
        if !c.joined.contains(&peer.name) {
            return Err(GatewayError::NotFound(format!(
                "{} has not joined {}",
                peer.name, channel
            )));
        }
        Ok(if stalled { 1 } else { c.height })
    }

    async fn anchor_peers(&self, org: &Organization, channel: &str) -> GatewayResult<Vec<Endpoint>> {
        let mut s = self.gate(Operation::QueryAnchorPeers, true)?;
        let c = channel_mut(&mut s, channel)?;
        Ok(c.anchors.get(&org.msp_id).cloned().unwrap_or_default())
    }

    async fn update_anchor_peers(
        &self,
        org: &Organization,
        channel: &str,
        update_tx: &[u8],
    ) -> GatewayResult<()> {
        let mut s = self.gate(Operation::UpdateAnchorPeers, true)?;
        let tx: FakeAnchorTx = serde_json::from_slice(update_tx)
            .map_err(|e| rejected(format!("malformed anchor update: {}", e)))?;
        if tx.msp_id != org.msp_id {
            return Err(GatewayError::PermissionDenied(format!(
                "{} cannot update the anchors of {}",
                org.msp_id, tx.msp_id
            )));
        }
        let c = channel_mut(&mut s, channel)?;
        c.anchors.insert(tx.msp_id, tx.anchors);
        c.height += 1;
        Self::submitted(&mut s, Operation::UpdateAnchorPeers);
        Ok(())
    }

    async fn query_installed(
        &self,
        _org: &Organization,
        peer: &PeerNode,
    ) -> GatewayResult<Vec<InstalledPackage>> {
        let s = self.gate(Operation::QueryInstalled, false)?;
        Ok(s.installed
            .get(&peer.name)
            .map(|pkgs| {
                pkgs.iter()
                    .map(|(id, label)| InstalledPackage {
                        package_id: id.clone(),
                        label: label.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn install(
        &self,
        _org: &Organization,
        peer: &PeerNode,
        package: &[u8],
    ) -> GatewayResult<PackageId> {
        let mut s = self.gate(Operation::Install, false)?;
        let label = package_label(package).ok_or_else(|| rejected("not a chaincode package"))?;
        let id = PackageId::new(format!("{}:{}", label, hex::encode(Sha256::digest(package))));
        let installed = s.installed.entry(peer.name.clone()).or_default();
        if installed.contains_key(&id) {
            return Err(rejected(format!(
                "chaincode already successfully installed (package ID '{}')",
                id
            )));
        }
        installed.insert(id.clone(), label);
        Self::submitted(&mut s, Operation::Install);
        Ok(id)
    }

    async fn query_approved(
        &self,
        org: &Organization,
        definition: &ChaincodeDefinition,
    ) -> GatewayResult<Option<ApprovedDefinition>> {
        let mut s = self.gate(Operation::QueryApproved, false)?;
        let c = channel_mut(&mut s, &definition.channel)?;
        Ok(c.approvals
            .get(&(definition.name.clone(), definition.sequence))
            .and_then(|votes| votes.get(&org.id).cloned()))
    }

    async fn approve(
        &self,
        org: &Organization,
        definition: &ChaincodeDefinition,
        package_id: &PackageId,
    ) -> GatewayResult<()> {
        let mut s = self.gate(Operation::Approve, true)?;
        let c = channel_mut(&mut s, &definition.channel)?;
        if !org.peers.iter().any(|p| c.joined.contains(&p.name)) {
            return Err(rejected(format!(
                "{} has no peer on {}",
                org.id, definition.channel
            )));
        }
        let committed = c.committed.get(&definition.name).map(|d| d.sequence).unwrap_or(0);
        if definition.sequence <= committed {
            return Err(rejected(format!(
                "requested sequence is {}, but new definition must be sequence {}",
                definition.sequence,
                committed + 1
            )));
        }
        c.approvals
            .entry((definition.name.clone(), definition.sequence))
            .or_default()
            .insert(
                org.id.clone(),
                ApprovedDefinition {
                    version: definition.version.clone(),
                    sequence: definition.sequence,
                    package_id: Some(package_id.clone()),
                },
            );
        c.height += 1;
        Self::submitted(&mut s, Operation::Approve);
        Ok(())
    }

    async fn query_committed(
        &self,
        _org: &Organization,
        channel: &str,
        name: &str,
    ) -> GatewayResult<Option<CommittedDefinition>> {
        let mut s = self.gate(Operation::QueryCommitted, false)?;
        let c = channel_mut(&mut s, channel)?;
        Ok(c.committed.get(name).cloned())
    }

    async fn commit(
        &self,
        _org: &Organization,
        definition: &ChaincodeDefinition,
        endorsers: &[Organization],
    ) -> GatewayResult<()> {
        let mut s = self.gate(Operation::Commit, true)?;
        let c = channel_mut(&mut s, &definition.channel)?;
        let committed = c.committed.get(&definition.name).map(|d| d.sequence).unwrap_or(0);
        if definition.sequence <= committed {
            return Err(rejected(format!(
                "requested sequence is {}, but new definition must be sequence {}",
                definition.sequence,
                committed + 1
            )));
        }
        let votes = c
            .approvals
            .get(&(definition.name.clone(), definition.sequence))
            .cloned()
            .unwrap_or_default();
        for org in endorsers {
            let agreed = votes
                .get(&org.id)
                .map(|a| a.version == definition.version && a.sequence == definition.sequence)
                .unwrap_or(false);
            if !agreed {
                return Err(rejected(format!(
                    "chaincode definition not agreed to by this org ({})",
                    org.msp_id
                )));
            }
        }
        c.committed.insert(
            definition.name.clone(),
            CommittedDefinition {
                version: definition.version.clone(),
                sequence: definition.sequence,
            },
        );
        c.height += 1;
        Self::submitted(&mut s, Operation::Commit);
        Ok(())
    }
}

/// A two-org network wired to a [`FakeLedger`].
pub struct Harness {
    /// Topology
    pub topology: Arc<TopologyConfig>,
    /// Ledger
    pub ledger: Arc<FakeLedger>,
    /// Artifacts
    pub artifacts: Arc<MemoryArtifacts>,
    /// State
    pub store: Arc<MemoryStateRepository>,
}

impl Harness {
    /// The sample two-org network
    pub fn two_org() -> Self {
        Self::with_topology(TopologyConfig::two_org_default())
    }

    /// Any topology
    pub fn with_topology(topology: TopologyConfig) -> Self {
        let artifacts = Arc::new(MemoryArtifacts::for_topology(&topology));
        Self {
            topology: Arc::new(topology),
            ledger: Arc::new(FakeLedger::new()),
            artifacts,
            store: Arc::new(MemoryStateRepository::new()),
        }
    }

    /// Short timeouts for tests
    pub fn policy() -> CallPolicy {
        CallPolicy {
            call_timeout: Duration::from_secs(5),
            retries: 2,
            backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2),
            confirm_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(30),
        }
    }

    /// Channel orchestrator on this network
    pub fn channels(&self) -> ChannelOrchestrator {
        ChannelOrchestrator::new(
            self.topology.clone(),
            self.ledger.clone(),
            self.artifacts.clone(),
            self.store.clone(),
        )
        .with_policy(Self::policy())
    }

    /// Lifecycle orchestrator on this network
    pub fn lifecycle(&self) -> ChaincodeLifecycleOrchestrator {
        ChaincodeLifecycleOrchestrator::new(
            self.topology.clone(),
            self.ledger.clone(),
            self.store.clone(),
        )
        .with_policy(Self::policy())
    }

    /// Deploy flow on this network
    pub fn deploy_flow(&self) -> DeployFlow {
        DeployFlow::new(Arc::new(self.lifecycle()), self.store.clone())
    }

    /// The default deploy of the topology
    pub fn request(&self) -> DeployRequest {
        DeployRequest::from_config(&self.topology)
    }

    /// Bring the channel to `Ready`
    pub async fn ready_channel(&self) {
        if let Err(e) = self.channels().ensure_ready(&self.topology.channel).await {
            panic!("channel setup failed: {}", e);
        }
    }
}
