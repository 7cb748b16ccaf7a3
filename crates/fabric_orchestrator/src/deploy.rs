//! The deploy flow: `Pending -> Packaged -> Installed -> Approved -> Committed`
//! as a persisted state machine per (channel, chaincode, sequence).
//!
//! Each confirmed step writes a [`DeployCheckpoint`]. A checkpoint only tells
//! where the last run got to. Orgs it lists as installed or approved are
//! checked with a query instead of going through the whole step again, and an
//! org whose state is gone from the ledger is redone.

use crate::chaincode::ChaincodeLifecycleOrchestrator;
use crate::config::TopologyConfig;
use crate::error::{CallContext, FlowError, Operation, OrchestratorError, OrchestratorResult};
use crate::package::{DefinitionSource, PackageDescriptor};
use crate::store::{StateRepository, StoreError};
use crate::types::{ChaincodeDefinition, CommitRecord, OrgId, PackageId};
use chrono::{DateTime, Utc};
use derive_more::Display;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// How far a deploy got. Ordered by progress.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
pub enum DeployStage {
    /// Nothing confirmed yet
    Pending,
    /// The package was built
    Packaged,
    /// Every org has the package installed
    Installed,
    /// Every required org approved the definition
    Approved,
    /// The definition is committed
    Committed,
}

/// Persisted progress of one deploy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployCheckpoint {
    /// Definition being deployed
    pub definition: ChaincodeDefinition,
    /// Last confirmed stage
    pub stage: DeployStage,
    /// Package built for the definition
    pub package: Option<PackageDescriptor>,
    /// Orgs confirmed to have the package installed
    pub installed: BTreeSet<OrgId>,
    /// Orgs confirmed to have approved
    pub approved: BTreeSet<OrgId>,
    /// When the checkpoint was written
    pub updated_at: DateTime<Utc>,
}

impl DeployCheckpoint {
    /// A checkpoint at `stage` with nothing recorded yet
    pub fn new(definition: ChaincodeDefinition, stage: DeployStage) -> Self {
        Self {
            definition,
            stage,
            package: None,
            installed: BTreeSet::new(),
            approved: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    fn advance(&mut self, stage: DeployStage) {
        self.stage = stage;
        self.updated_at = Utc::now();
    }
}

/// What to deploy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    /// The definition to commit
    pub definition: ChaincodeDefinition,
    /// What goes into the package
    pub source: DefinitionSource,
}

impl DeployRequest {
    /// The chaincode defaults of the topology
    pub fn from_config(topology: &TopologyConfig) -> Self {
        let cc = &topology.chaincode;
        Self {
            definition: ChaincodeDefinition::new(
                topology.channel.clone(),
                cc.name.clone(),
                cc.version.clone(),
                cc.sequence,
            ),
            source: DefinitionSource {
                label: cc.label_or_default(&cc.name, &cc.version),
                address: cc.address.clone(),
                dial_timeout: cc.dial_timeout.clone(),
                tls_required: cc.tls_required,
            },
        }
    }
}

/// What the chaincode service needs to serve a committed definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationContract {
    /// Channel
    pub channel: String,
    /// Chaincode name
    pub name: String,
    /// Committed version
    pub version: String,
    /// Committed sequence
    pub sequence: u64,
    /// Package id the peers dispatch to
    pub package_id: PackageId,
    /// Address the service listens on
    pub chaincode_address: String,
}

impl ActivationContract {
    /// Contract for a commit record
    pub fn new(record: &CommitRecord, chaincode_address: impl Into<String>) -> Self {
        Self {
            channel: record.definition.channel.clone(),
            name: record.definition.name.clone(),
            version: record.definition.version.clone(),
            sequence: record.definition.sequence,
            package_id: record.package_id.clone(),
            chaincode_address: chaincode_address.into(),
        }
    }

    /// Contract for the latest recorded commit of (channel, name)
    pub async fn latest(
        store: &dyn StateRepository,
        channel: &str,
        name: &str,
        chaincode_address: &str,
    ) -> OrchestratorResult<Option<Self>> {
        Ok(store
            .latest_commit(channel, name)
            .await?
            .map(|r| Self::new(&r, chaincode_address)))
    }

    /// Environment the chaincode service is started with
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("CHAINCODE_ID", self.package_id.to_string()),
            ("CHAINCODE_SERVER_ADDRESS", self.chaincode_address.clone()),
            ("CHAINCODE_CHANNEL", self.channel.clone()),
            ("CHAINCODE_NAME", self.name.clone()),
            ("CHAINCODE_VERSION", self.version.clone()),
            ("CHAINCODE_SEQUENCE", self.sequence.to_string()),
        ]
    }

    /// `KEY=value` lines
    pub fn env_lines(&self) -> String {
        self.to_env()
            .into_iter()
            .map(|(k, v)| format!("{}={}\n", k, v))
            .collect()
    }
}

/// Result of a deploy run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployOutcome {
    /// Committed definition
    pub definition: ChaincodeDefinition,
    /// Committed package
    pub package_id: PackageId,
    /// The definition was already committed and nothing was submitted
    pub already_committed: bool,
    /// What to hand to the chaincode service
    pub contract: ActivationContract,
}

/// Record which orgs finished a step. Returns the first failure.
fn settle(
    done: &mut BTreeSet<OrgId>,
    orgs: &[OrgId],
    results: Vec<OrchestratorResult<()>>,
) -> Option<(OrgId, OrchestratorError)> {
    let mut failure = None;
    for (org, result) in orgs.iter().zip(results) {
        match result {
            Ok(()) => {
                done.insert(org.clone());
            }
            Err(e) => {
                done.remove(org);
                failure.get_or_insert((org.clone(), e));
            }
        }
    }
    failure
}

/// Runs deploys, resuming from checkpoints.
pub struct DeployFlow {
    lifecycle: Arc<ChaincodeLifecycleOrchestrator>,
    store: Arc<dyn StateRepository>,
    cancel: CancellationToken,
}

type FlowResult<T> = Result<T, FlowError<DeployStage>>;

impl DeployFlow {
    /// Construct a flow
    pub fn new(
        lifecycle: Arc<ChaincodeLifecycleOrchestrator>,
        store: Arc<dyn StateRepository>,
    ) -> Self {
        Self {
            lifecycle,
            store,
            cancel: CancellationToken::new(),
        }
    }

    /// Observe this token before every submission
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels this flow
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn check_cancelled(&self, context: CallContext) -> OrchestratorResult<()> {
        if self.cancel.is_cancelled() {
            tracing::warn!(%context, "cancelled");
            return Err(OrchestratorError::Cancelled { context });
        }
        Ok(())
    }

    async fn save(&self, checkpoint: &DeployCheckpoint) -> OrchestratorResult<()> {
        self.store
            .save_deploy_checkpoint(&checkpoint.definition.key(), checkpoint.clone())
            .await?;
        tracing::debug!(stage = %checkpoint.stage, "checkpoint saved");
        Ok(())
    }

    /// The stored checkpoint for `definition`, if any
    pub async fn checkpoint(
        &self,
        definition: &ChaincodeDefinition,
    ) -> OrchestratorResult<Option<DeployCheckpoint>> {
        Ok(self.store.deploy_checkpoint(&definition.key()).await?)
    }

    /// Drive `request` to `Committed`.
    ///
    /// Re-running with an unchanged, committed definition submits nothing.
    /// On failure the error carries the last confirmed stage.
    pub async fn run(&self, request: &DeployRequest) -> FlowResult<DeployOutcome> {
        let definition = &request.definition;
        let span = tracing::info_span!(
            "deploy",
            channel = %definition.channel,
            chaincode = %definition.name,
            version = %definition.version,
            sequence = definition.sequence,
        );
        self.run_inner(request).instrument(span).await
    }

    async fn run_inner(&self, request: &DeployRequest) -> FlowResult<DeployOutcome> {
        let definition = &request.definition;
        let fail = |step: &str, reached: DeployStage| {
            let step = step.to_string();
            move |e: OrchestratorError| FlowError::new(step, reached, e)
        };

        let mut checkpoint = match self
            .checkpoint(definition)
            .await
            .map_err(fail("load checkpoint", DeployStage::Pending))?
        {
            Some(c) if &c.definition == definition => {
                tracing::info!(stage = %c.stage, "resuming deploy");
                c
            }
            Some(c) => {
                tracing::warn!(
                    previous = %c.definition,
                    "checkpoint was for another version, starting over"
                );
                DeployCheckpoint::new(definition.clone(), DeployStage::Pending)
            }
            None => DeployCheckpoint::new(definition.clone(), DeployStage::Pending),
        };
        let resumed_at = checkpoint.stage;

        let package = self
            .lifecycle
            .package(&request.source)
            .map_err(fail("package", DeployStage::Pending))?;
        let package_id = package.package_id();

        // the ledger decides whether there is anything left to do
        if let Some(committed) = self
            .lifecycle
            .latest_committed(&definition.channel, &definition.name)
            .await
            .map_err(fail("query committed", resumed_at))?
        {
            if committed.sequence > definition.sequence
                || (committed.sequence == definition.sequence && committed.version != definition.version)
            {
                return Err(FlowError::new(
                    "verify sequence",
                    resumed_at,
                    OrchestratorError::StaleSequence {
                        channel: definition.channel.clone(),
                        name: definition.name.clone(),
                        requested: definition.sequence,
                        committed: committed.sequence,
                    },
                ));
            }
            if committed.sequence == definition.sequence {
                return self
                    .already_committed(request, checkpoint, package.descriptor.clone())
                    .await;
            }
        }

        if checkpoint.package.as_ref() != Some(&package.descriptor) {
            if checkpoint.package.is_some() {
                tracing::warn!(%package_id, "package changed since the last run, reinstalling");
            }
            checkpoint.installed.clear();
            checkpoint.approved.clear();
            checkpoint.package = Some(package.descriptor.clone());
        }
        checkpoint.advance(DeployStage::Packaged);
        self.save(&checkpoint)
            .await
            .map_err(fail("save checkpoint", DeployStage::Pending))?;

        let reached = DeployStage::Packaged;
        let orgs: Vec<OrgId> = self
            .lifecycle
            .topology()
            .organizations
            .iter()
            .map(|o| o.id.clone())
            .collect();
        // orgs a checkpoint lists are verified with a query; the rest go
        // through the full install step
        let listed = checkpoint.installed.clone();
        let installs = orgs.iter().map(|org| {
            let package = &package;
            let listed = &listed;
            async move {
                if listed.contains(org) {
                    if self.lifecycle.is_installed(org, &package.package_id()).await? {
                        tracing::debug!(%org, "install from the last run still in place");
                        return Ok(());
                    }
                    tracing::warn!(%org, "checkpoint lists an install the peers no longer have");
                }
                self.check_cancelled(CallContext::new(Operation::Install).org(org))?;
                self.lifecycle.install_on_org(org, package).await.map(|_| ())
            }
        });
        let results = join_all(installs).await;
        if let Some((org, e)) = settle(&mut checkpoint.installed, &orgs, results) {
            self.save(&checkpoint).await.ok();
            return Err(FlowError::new(format!("install on {}", org), reached, e));
        }
        checkpoint.advance(DeployStage::Installed);
        self.save(&checkpoint)
            .await
            .map_err(fail("save checkpoint", reached))?;

        let reached = DeployStage::Installed;
        let required: Vec<OrgId> = self
            .lifecycle
            .required_orgs()
            .into_iter()
            .map(|o| o.id.clone())
            .collect();
        let listed = checkpoint.approved.clone();
        let approvals = required.iter().map(|org| {
            let package_id = &package_id;
            let listed = &listed;
            async move {
                if listed.contains(org)
                    && self
                        .lifecycle
                        .is_approved(org, definition, package_id)
                        .await?
                {
                    tracing::debug!(%org, "approval from the last run still in place");
                    return Ok(());
                }
                self.check_cancelled(
                    CallContext::new(Operation::Approve)
                        .org(org)
                        .channel(&definition.channel),
                )?;
                self.lifecycle
                    .approve_for_org(org, definition, package_id)
                    .await
                    .map(|_| ())
            }
        });
        let results = join_all(approvals).await;
        if let Some((org, e)) = settle(&mut checkpoint.approved, &required, results) {
            self.save(&checkpoint).await.ok();
            return Err(FlowError::new(format!("approve for {}", org), reached, e));
        }
        checkpoint.advance(DeployStage::Approved);
        self.save(&checkpoint)
            .await
            .map_err(fail("save checkpoint", reached))?;

        let reached = DeployStage::Approved;
        self.check_cancelled(CallContext::new(Operation::Commit).channel(&definition.channel))
            .map_err(fail("commit", reached))?;
        let record = self
            .lifecycle
            .commit(definition)
            .await
            .map_err(fail("commit", reached))?;
        checkpoint.advance(DeployStage::Committed);
        self.save(&checkpoint)
            .await
            .map_err(fail("save checkpoint", reached))?;

        tracing::info!(package_id = %record.package_id, "deploy complete");
        Ok(DeployOutcome {
            definition: definition.clone(),
            package_id: record.package_id.clone(),
            already_committed: false,
            contract: ActivationContract::new(&record, request.source.address.clone()),
        })
    }

    /// The ledger already has this sequence committed with this version.
    /// Make sure it is the same package and fill in the bookkeeping.
    async fn already_committed(
        &self,
        request: &DeployRequest,
        mut checkpoint: DeployCheckpoint,
        descriptor: PackageDescriptor,
    ) -> FlowResult<DeployOutcome> {
        let definition = &request.definition;
        let reached = checkpoint.stage;
        let package_id = descriptor.package_id();
        let stale = || OrchestratorError::StaleSequence {
            channel: definition.channel.clone(),
            name: definition.name.clone(),
            requested: definition.sequence,
            committed: definition.sequence,
        };

        let record = match self
            .store
            .commit_record(&definition.key())
            .await
            .map_err(|e| FlowError::new("read commit record", reached, e.into()))?
        {
            Some(record) if record.package_id != package_id => {
                tracing::warn!(
                    committed = %record.package_id,
                    requested = %package_id,
                    "sequence already committed with another package"
                );
                return Err(FlowError::new("verify package", reached, stale()));
            }
            Some(record) => record,
            None => {
                let record = CommitRecord {
                    definition: definition.clone(),
                    package_id: package_id.clone(),
                    committed: true,
                };
                match self.store.insert_commit_record(record.clone()).await {
                    Ok(()) | Err(StoreError::AlreadyExists(_)) => record,
                    Err(e) => return Err(FlowError::new("write commit record", reached, e.into())),
                }
            }
        };

        checkpoint.package = Some(descriptor);
        checkpoint.advance(DeployStage::Committed);
        self.save(&checkpoint)
            .await
            .map_err(|e| FlowError::new("save checkpoint", reached, e))?;
        tracing::info!("definition already committed, nothing to do");
        Ok(DeployOutcome {
            definition: definition.clone(),
            package_id: record.package_id.clone(),
            already_committed: true,
            contract: ActivationContract::new(&record, request.source.address.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record() -> CommitRecord {
        CommitRecord {
            definition: ChaincodeDefinition::new("npa-channel", "taskdocument", "1.0", 1),
            package_id: "taskdocument_1.0:abcd".into(),
            committed: true,
        }
    }

    #[test]
    fn stages_are_ordered_by_progress() {
        assert!(DeployStage::Pending < DeployStage::Packaged);
        assert!(DeployStage::Installed < DeployStage::Approved);
        assert!(DeployStage::Approved < DeployStage::Committed);
        assert_eq!(DeployStage::Installed.to_string(), "Installed");
    }

    #[test]
    fn activation_env_names_the_package_and_address() {
        let contract = ActivationContract::new(&record(), "chaincode-rest:9999");
        assert_eq!(
            contract.env_lines(),
            "CHAINCODE_ID=taskdocument_1.0:abcd\n\
             CHAINCODE_SERVER_ADDRESS=chaincode-rest:9999\n\
             CHAINCODE_CHANNEL=npa-channel\n\
             CHAINCODE_NAME=taskdocument\n\
             CHAINCODE_VERSION=1.0\n\
             CHAINCODE_SEQUENCE=1\n"
        );
        let json = serde_json::to_value(&contract).unwrap();
        assert_eq!(json["package_id"], "taskdocument_1.0:abcd");
        assert_eq!(json["sequence"], 1);
    }

    #[test]
    fn request_from_config_uses_the_chaincode_defaults() {
        let topology = TopologyConfig::two_org_default();
        let request = DeployRequest::from_config(&topology);
        assert_eq!(
            request.definition,
            ChaincodeDefinition::new("npa-channel", "taskdocument", "1.0", 1)
        );
        assert_eq!(request.source.label, "taskdocument_1.0");
        assert_eq!(request.source.address, "chaincode-rest:9999");
    }

    #[test]
    fn checkpoint_survives_json() {
        let mut checkpoint = DeployCheckpoint::new(record().definition, DeployStage::Pending);
        checkpoint.installed.insert("Org1".into());
        checkpoint.advance(DeployStage::Installed);
        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: DeployCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checkpoint);
    }
}
