//! Chaincode lifecycle: package, install, approve per org, commit.
//!
//! Approvals are the orgs' independent votes. They are mirrored into the
//! [`StateRepository`] through compare-and-set so concurrent orchestrators
//! never lose each other's view, and they are always refreshed from the ledger
//! before a commit decision is made.

use crate::channel::StepOutcome;
use crate::config::TopologyConfig;
use crate::error::{CallContext, Operation, OrchestratorError, OrchestratorResult};
use crate::gateway::{ApprovedDefinition, LedgerGateway};
use crate::package::{self, ChaincodePackage, DefinitionSource};
use crate::poll::{self, confirm_error, poll_until, CallPolicy, Observation};
use crate::store::{ApprovalKey, StateRepository, StoreError};
use crate::types::{
    ApprovalRecord, ChaincodeDefinition, CommitRecord, OrgId, Organization, PackageId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::Instrument;

/// Compare-and-set attempts before a lost race is reported.
const CAS_ATTEMPTS: usize = 5;

/// The required orgs' votes on one definition, as the ledger reports them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitReadiness {
    /// Package each required org approved
    pub approvals: BTreeMap<OrgId, PackageId>,
    /// Required orgs without an approval
    pub missing: BTreeSet<OrgId>,
}

impl CommitReadiness {
    /// Every required org approved
    pub fn is_ready(&self) -> bool {
        self.missing.is_empty()
    }

    /// The package the required orgs agreed on, once all of them approved
    pub fn agreed_package(&self) -> Option<&PackageId> {
        if self.is_ready() {
            self.approvals.values().next()
        } else {
            None
        }
    }
}

/// Drives chaincode definitions to `Committed`.
pub struct ChaincodeLifecycleOrchestrator {
    topology: Arc<TopologyConfig>,
    gateway: Arc<dyn LedgerGateway>,
    store: Arc<dyn StateRepository>,
    policy: CallPolicy,
}

impl ChaincodeLifecycleOrchestrator {
    /// Construct an orchestrator
    pub fn new(
        topology: Arc<TopologyConfig>,
        gateway: Arc<dyn LedgerGateway>,
        store: Arc<dyn StateRepository>,
    ) -> Self {
        let policy = topology.call_policy();
        Self {
            topology,
            gateway,
            store,
            policy,
        }
    }

    /// Replace the call policy from the topology
    pub fn with_policy(mut self, policy: CallPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The topology this orchestrator works on
    pub fn topology(&self) -> &TopologyConfig {
        &self.topology
    }

    /// The call policy in use
    pub fn policy(&self) -> &CallPolicy {
        &self.policy
    }

    /// Orgs whose approval a commit needs
    pub fn required_orgs(&self) -> Vec<&Organization> {
        self.topology.required_orgs()
    }

    /// Build the `ccaas` package for `source`.
    pub fn package(&self, source: &DefinitionSource) -> OrchestratorResult<ChaincodePackage> {
        Ok(package::package(source)?)
    }

    async fn installed_on(
        &self,
        org: &Organization,
        peer: &crate::types::PeerNode,
        package_id: &PackageId,
    ) -> OrchestratorResult<bool> {
        let ctx = CallContext::new(Operation::QueryInstalled).org(&org.id);
        let installed =
            poll::query(&self.policy, &ctx, || self.gateway.query_installed(org, peer)).await?;
        Ok(installed.iter().any(|p| &p.package_id == package_id))
    }

    /// Install on every peer of the org that does not have the package yet,
    /// then wait until each peer lists it. Returns the package id.
    pub async fn install_on_org(
        &self,
        org: &OrgId,
        package: &ChaincodePackage,
    ) -> OrchestratorResult<PackageId> {
        let org = self.topology.org(org)?;
        let package_id = package.package_id();
        let span = tracing::info_span!("install", org = %org.id, package_id = %package_id);
        async move {
            let ctx = CallContext::new(Operation::Install).org(&org.id);
            for peer in &org.peers {
                if self.installed_on(org, peer, &package_id).await? {
                    tracing::debug!(peer = %peer.name, "already installed");
                    continue;
                }
                match poll::submit(&self.policy, &ctx, || {
                    self.gateway.install(org, peer, &package.bytes)
                })
                .await
                {
                    Ok(id) if id != package_id => {
                        return Err(OrchestratorError::conflict(
                            ctx,
                            format!("peer {} computed package id {} for {}", peer.name, id, package_id),
                        ));
                    }
                    Ok(_) => {}
                    Err(e) if self.installed_on(org, peer, &package_id).await? => {
                        tracing::warn!(peer = %peer.name, error = %e, "install failed but package is present");
                    }
                    Err(e) => return Err(e),
                }
                let package_id = &package_id;
                poll_until::<_, OrchestratorError, _, _>(
                    "package installed",
                    self.policy.confirm_timeout,
                    &self.policy.backoff,
                    || async move {
                        Ok(if self.installed_on(org, peer, package_id).await? {
                            Observation::Ready(())
                        } else {
                            Observation::Pending(format!("{} does not list the package yet", peer.name))
                        })
                    },
                )
                .await
                .map_err(|e| confirm_error(&ctx, e))?;
                tracing::info!(peer = %peer.name, "installed");
            }
            Ok(package_id)
        }
        .instrument(span)
        .await
    }

    /// Whether every peer of the org lists `package_id`. Only queries.
    pub async fn is_installed(
        &self,
        org: &OrgId,
        package_id: &PackageId,
    ) -> OrchestratorResult<bool> {
        let org = self.topology.org(org)?;
        for peer in &org.peers {
            if !self.installed_on(org, peer, package_id).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether the ledger holds the org's approval of `definition` with
    /// `package_id`. Only queries.
    pub async fn is_approved(
        &self,
        org: &OrgId,
        definition: &ChaincodeDefinition,
        package_id: &PackageId,
    ) -> OrchestratorResult<bool> {
        let org = self.topology.org(org)?;
        Ok(self
            .ledger_approval(org, definition)
            .await?
            .map(|a| a.matches(definition, package_id))
            .unwrap_or(false))
    }

    async fn ledger_approval(
        &self,
        org: &Organization,
        definition: &ChaincodeDefinition,
    ) -> OrchestratorResult<Option<ApprovedDefinition>> {
        let ctx = CallContext::new(Operation::QueryApproved)
            .org(&org.id)
            .channel(&definition.channel);
        poll::query(&self.policy, &ctx, || self.gateway.query_approved(org, definition)).await
    }

    /// Store `record` as the org's vote, re-reading and retrying when another
    /// writer got there first.
    async fn record_approval(&self, record: ApprovalRecord) -> OrchestratorResult<()> {
        let key = ApprovalKey::new(record.definition.key(), record.org.clone());
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.store.approval(&key).await?;
            if current.as_ref().map(|v| &v.value) == Some(&record) {
                return Ok(());
            }
            let expected = current.map(|v| v.version);
            match self
                .store
                .compare_and_set_approval(&key, expected, record.clone())
                .await
            {
                Ok(version) => {
                    tracing::trace!(%key, version, "approval recorded");
                    return Ok(());
                }
                Err(e @ StoreError::VersionConflict { .. }) if attempt >= CAS_ATTEMPTS => {
                    return Err(e.into())
                }
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::debug!(%key, attempt, "approval changed underneath, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Vote for `definition` with `package_id` on behalf of the org.
    ///
    /// Submits `approveformyorg` only when the ledger does not already hold
    /// exactly this approval, then waits until it is visible.
    pub async fn approve_for_org(
        &self,
        org: &OrgId,
        definition: &ChaincodeDefinition,
        package_id: &PackageId,
    ) -> OrchestratorResult<StepOutcome> {
        let org = self.topology.org(org)?;
        let span = tracing::info_span!(
            "approve",
            org = %org.id,
            channel = %definition.channel,
            chaincode = %definition.name,
            sequence = definition.sequence,
        );
        async move {
            let ctx = CallContext::new(Operation::Approve)
                .org(&org.id)
                .channel(&definition.channel);

            if let Some(committed) = self.latest_committed(&definition.channel, &definition.name).await? {
                if committed.sequence >= definition.sequence {
                    return Err(OrchestratorError::StaleSequence {
                        channel: definition.channel.clone(),
                        name: definition.name.clone(),
                        requested: definition.sequence,
                        committed: committed.sequence,
                    });
                }
            }

            let approved = |package: Option<PackageId>, approved: bool| ApprovalRecord {
                org: org.id.clone(),
                definition: definition.clone(),
                package_id: package,
                approved,
            };

            if let Some(current) = self.ledger_approval(org, definition).await? {
                if current.matches(definition, package_id) {
                    self.record_approval(approved(Some(package_id.clone()), true))
                        .await?;
                    tracing::debug!("already approved");
                    return Ok(StepOutcome::AlreadyDone);
                }
                tracing::info!(
                    previous = ?current.package_id,
                    "replacing the org's earlier approval"
                );
            }

            // the vote is recorded before it is submitted
            self.record_approval(approved(Some(package_id.clone()), false))
                .await?;
            match poll::submit(&self.policy, &ctx, || {
                self.gateway.approve(org, definition, package_id)
            })
            .await
            {
                Ok(()) => {}
                Err(e)
                    if self
                        .ledger_approval(org, definition)
                        .await?
                        .map(|a| a.matches(definition, package_id))
                        .unwrap_or(false) =>
                {
                    tracing::warn!(error = %e, "approve failed but the approval is in place");
                }
                Err(e) => return Err(e),
            }
            poll_until::<_, OrchestratorError, _, _>(
                "approval visible",
                self.policy.confirm_timeout,
                &self.policy.backoff,
                || async move {
                    Ok(match self.ledger_approval(org, definition).await? {
                        Some(a) if a.matches(definition, package_id) => Observation::Ready(()),
                        _ => Observation::Pending("approval not visible yet".into()),
                    })
                },
            )
            .await
            .map_err(|e| confirm_error(&ctx, e))?;
            self.record_approval(approved(Some(package_id.clone()), true))
                .await?;
            tracing::info!(%package_id, "approved");
            Ok(StepOutcome::Applied)
        }
        .instrument(span)
        .await
    }

    /// Refresh every required org's approval from the ledger and report who
    /// approved which package and who has not approved `definition` yet.
    ///
    /// Fails with [`OrchestratorError::DefinitionConflict`] when required orgs
    /// approved the same definition with different packages.
    pub async fn check_commit_readiness(
        &self,
        definition: &ChaincodeDefinition,
    ) -> OrchestratorResult<CommitReadiness> {
        let mut approvals: BTreeMap<OrgId, PackageId> = BTreeMap::new();
        let mut missing = BTreeSet::new();
        for org in self.required_orgs() {
            let on_ledger = self
                .ledger_approval(org, definition)
                .await?
                .filter(|a| a.version == definition.version && a.sequence == definition.sequence);
            let package = on_ledger.and_then(|a| a.package_id);
            let stored = self
                .store
                .approval(&ApprovalKey::new(definition.key(), org.id.clone()))
                .await?;
            let refreshed = ApprovalRecord {
                org: org.id.clone(),
                definition: definition.clone(),
                package_id: package
                    .clone()
                    .or_else(|| stored.and_then(|s| s.value.package_id)),
                approved: package.is_some(),
            };
            self.record_approval(refreshed).await?;

            match package {
                Some(package) => {
                    approvals.insert(org.id.clone(), package);
                }
                None => {
                    missing.insert(org.id.clone());
                }
            }
        }

        let distinct: BTreeSet<&PackageId> = approvals.values().collect();
        if distinct.len() > 1 {
            tracing::warn!(%definition, ?approvals, "orgs approved different packages");
            return Err(OrchestratorError::DefinitionConflict {
                definition: definition.clone(),
                approvals,
            });
        }
        tracing::debug!(%definition, ?missing, "commit readiness");
        Ok(CommitReadiness { approvals, missing })
    }

    /// The committed definition of (channel, name) as the ledger reports it.
    ///
    /// A commit record above the ledger's sequence is left over from a channel
    /// that no longer exists. It is logged and otherwise ignored.
    pub async fn latest_committed(
        &self,
        channel: &str,
        name: &str,
    ) -> OrchestratorResult<Option<ChaincodeDefinition>> {
        let creator = self.topology.creator()?;
        let ctx = CallContext::new(Operation::QueryCommitted)
            .org(&creator.id)
            .channel(channel);
        let ledger = poll::query(&self.policy, &ctx, || {
            self.gateway.query_committed(creator, channel, name)
        })
        .await?
        .map(|c| ChaincodeDefinition::new(channel, name, c.version, c.sequence));
        if let Some(stored) = self.store.latest_commit(channel, name).await? {
            let on_ledger = ledger.as_ref().map(|l| l.sequence);
            if on_ledger < Some(stored.definition.sequence) {
                tracing::warn!(
                    recorded = %stored.definition,
                    ?on_ledger,
                    "commit record is ahead of the ledger, ignoring it"
                );
            }
        }
        Ok(ledger)
    }

    /// Commit `definition` once every required org approved it with the same
    /// package, then write the commit record.
    pub async fn commit(&self, definition: &ChaincodeDefinition) -> OrchestratorResult<CommitRecord> {
        let creator = self.topology.creator()?;
        let span = tracing::info_span!(
            "commit",
            channel = %definition.channel,
            chaincode = %definition.name,
            sequence = definition.sequence,
        );
        async move {
            let ctx = CallContext::new(Operation::Commit)
                .org(&creator.id)
                .channel(&definition.channel);
            let stale = |committed: u64| OrchestratorError::StaleSequence {
                channel: definition.channel.clone(),
                name: definition.name.clone(),
                requested: definition.sequence,
                committed,
            };

            if let Some(committed) = self.latest_committed(&definition.channel, &definition.name).await? {
                if committed.sequence >= definition.sequence {
                    return Err(stale(committed.sequence));
                }
            }

            let readiness = self.check_commit_readiness(definition).await?;
            if !readiness.is_ready() {
                return Err(OrchestratorError::CommitNotReady {
                    definition: definition.clone(),
                    missing: readiness.missing,
                });
            }
            let package_id = readiness
                .agreed_package()
                .cloned()
                .ok_or_else(|| {
                    OrchestratorError::conflict(ctx.clone(), "no required org approved a package")
                })?;

            let endorsers: Vec<Organization> =
                self.required_orgs().into_iter().cloned().collect();
            let landed = || async move {
                self.latest_committed(&definition.channel, &definition.name)
                    .await
                    .map(|c| c.map(|c| c.sequence >= definition.sequence).unwrap_or(false))
            };
            match poll::submit(&self.policy, &ctx, || {
                self.gateway.commit(creator, definition, &endorsers)
            })
            .await
            {
                Ok(()) => {}
                Err(e) if landed().await? => {
                    tracing::warn!(error = %e, "commit failed but the definition is committed");
                }
                Err(e) => return Err(e),
            }
            poll_until::<_, OrchestratorError, _, _>(
                "definition committed",
                self.policy.confirm_timeout,
                &self.policy.backoff,
                || async move {
                    let creator = self.topology.creator()?;
                    let ctx = CallContext::new(Operation::QueryCommitted)
                        .org(&creator.id)
                        .channel(&definition.channel);
                    let committed = poll::query(&self.policy, &ctx, || {
                        self.gateway
                            .query_committed(creator, &definition.channel, &definition.name)
                    })
                    .await?;
                    Ok(match committed {
                        Some(c) if c.sequence >= definition.sequence => Observation::Ready(()),
                        _ => Observation::Pending("commit not visible yet".into()),
                    })
                },
            )
            .await
            .map_err(|e| confirm_error(&ctx, e))?;

            let record = CommitRecord {
                definition: definition.clone(),
                package_id,
                committed: true,
            };
            match self.store.insert_commit_record(record.clone()).await {
                Ok(()) => {}
                Err(StoreError::AlreadyExists(_)) => {
                    match self.store.commit_record(&definition.key()).await? {
                        Some(existing) if existing == record => {}
                        existing => {
                            // the ledger just confirmed this sequence, so any other
                            // record for it belongs to a channel that was wiped
                            tracing::warn!(?existing, "replacing a commit record the ledger no longer holds");
                            self.store.replace_commit_record(record.clone()).await?;
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
            tracing::info!(package_id = %record.package_id, "committed");
            Ok(record)
        }
        .instrument(span)
        .await
    }
}
