//! Channel lifecycle: `Absent -> Created -> PartiallyJoined -> JoinedAll -> Ready`.
//!
//! Every operation derives the channel's status from live queries before it
//! acts, so each one is safe to repeat and none moves a channel backwards.

use crate::artifacts::{ArtifactName, ArtifactSource};
use crate::config::TopologyConfig;
use crate::error::{CallContext, FlowError, Operation, OrchestratorError, OrchestratorResult};
use crate::gateway::LedgerGateway;
use crate::poll::{self, confirm_error, poll_until, Backoff, CallPolicy, Observation};
use crate::store::StateRepository;
use crate::types::{ChannelState, ChannelStatus, Endpoint, OrgId, Organization, PeerNode};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// What an idempotent step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step changed the ledger
    Applied,
    /// The ledger was already there
    AlreadyDone,
}

/// A peer whose ledger stopped at its genesis block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckPeer {
    /// Owning org
    pub org: OrgId,
    /// Peer name
    pub peer: String,
    /// Observed height
    pub height: u64,
}

/// Drives channels to `Ready`.
pub struct ChannelOrchestrator {
    topology: Arc<TopologyConfig>,
    gateway: Arc<dyn LedgerGateway>,
    artifacts: Arc<dyn ArtifactSource>,
    store: Arc<dyn StateRepository>,
    policy: CallPolicy,
}

impl ChannelOrchestrator {
    /// Construct an orchestrator
    pub fn new(
        topology: Arc<TopologyConfig>,
        gateway: Arc<dyn LedgerGateway>,
        artifacts: Arc<dyn ArtifactSource>,
        store: Arc<dyn StateRepository>,
    ) -> Self {
        let policy = topology.call_policy();
        Self {
            topology,
            gateway,
            artifacts,
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

    fn creator(&self) -> OrchestratorResult<&Organization> {
        Ok(self.topology.creator()?)
    }

    async fn is_joined(
        &self,
        org: &Organization,
        peer: &PeerNode,
        channel: &str,
    ) -> OrchestratorResult<bool> {
        let ctx = CallContext::new(Operation::ListJoinedChannels)
            .org(&org.id)
            .channel(channel);
        let joined = poll::query(&self.policy, &ctx, || self.gateway.joined_channels(org, peer)).await?;
        Ok(joined.iter().any(|c| c == channel))
    }

    async fn channel_exists(&self, channel: &str) -> OrchestratorResult<bool> {
        let creator = self.creator()?;
        let ctx = CallContext::new(Operation::ChannelExists)
            .org(&creator.id)
            .channel(channel);
        poll::query(&self.policy, &ctx, || self.gateway.channel_exists(creator, channel)).await
    }

    async fn advertised_anchors(
        &self,
        org: &Organization,
        channel: &str,
    ) -> OrchestratorResult<BTreeSet<Endpoint>> {
        let ctx = CallContext::new(Operation::QueryAnchorPeers)
            .org(&org.id)
            .channel(channel);
        let anchors = poll::query(&self.policy, &ctx, || self.gateway.anchor_peers(org, channel)).await?;
        Ok(anchors.into_iter().collect())
    }

    /// Derive the channel's status from live queries.
    ///
    /// Also reports the ledger height of every joined peer and which orgs
    /// advertise exactly their configured anchors.
    pub async fn status(&self, channel: &str) -> OrchestratorResult<ChannelState> {
        if !self.channel_exists(channel).await? {
            return Ok(ChannelState::absent(channel));
        }

        let mut joined: BTreeMap<OrgId, BTreeSet<String>> = BTreeMap::new();
        let mut heights = BTreeMap::new();
        let mut total = 0;
        for org in &self.topology.organizations {
            for peer in &org.peers {
                total += 1;
                if self.is_joined(org, peer, channel).await? {
                    let ctx = CallContext::new(Operation::ChannelHeight)
                        .org(&org.id)
                        .channel(channel);
                    let height = poll::query(&self.policy, &ctx, || {
                        self.gateway.channel_height(org, peer, channel)
                    })
                    .await?;
                    heights.insert(peer.name.clone(), height);
                    joined
                        .entry(org.id.clone())
                        .or_default()
                        .insert(peer.name.clone());
                }
            }
        }

        let mut anchored = BTreeSet::new();
        for org in &self.topology.organizations {
            if joined.contains_key(&org.id)
                && self.advertised_anchors(org, channel).await? == org.anchor_set()
            {
                anchored.insert(org.id.clone());
            }
        }

        let count: usize = joined.values().map(BTreeSet::len).sum();
        let status = if count == 0 {
            ChannelStatus::Created
        } else if count < total {
            ChannelStatus::PartiallyJoined
        } else if anchored.len() == self.topology.organizations.len() {
            ChannelStatus::Ready
        } else {
            ChannelStatus::JoinedAll
        };

        Ok(ChannelState {
            name: channel.to_string(),
            status,
            joined,
            heights,
            anchored,
        })
    }

    /// Poll the orderer until it accepts requests.
    pub async fn wait_for_orderer_ready(
        &self,
        timeout: Duration,
        backoff: &Backoff,
    ) -> OrchestratorResult<()> {
        let creator = self.creator()?;
        let ctx = CallContext::new(Operation::PingOrderer).org(&creator.id);
        tracing::info!(orderer = %self.topology.orderer.endpoint(), ?timeout, "waiting for orderer");
        let check_ctx = &ctx;
        poll_until("orderer ready", timeout, backoff, || async move {
            self.gateway
                .ping_orderer(creator)
                .await
                .map(Observation::Ready)
                .map_err(|e| OrchestratorError::from_gateway(check_ctx.clone(), e))
        })
        .await
        .map_err(|e| confirm_error(&ctx, e))
    }

    /// Create the channel unless the orderer already knows it, and make sure
    /// its genesis block is cached for joins.
    pub async fn ensure_channel_exists(&self, channel: &str) -> OrchestratorResult<ChannelState> {
        let creator = self.creator()?;
        let span = tracing::info_span!("ensure_channel", channel, org = %creator.id);
        async move {
            if !self.channel_exists(channel).await? {
                let tx = self
                    .artifacts
                    .load(&ArtifactName::ChannelTx(channel.to_string()))?;
                tracing::info!(digest = %tx.digest(), "creating channel");
                let ctx = CallContext::new(Operation::CreateChannel)
                    .org(&creator.id)
                    .channel(channel);
                match poll::submit(&self.policy, &ctx, || {
                    self.gateway.create_channel(creator, channel, &tx.bytes)
                })
                .await
                {
                    Ok(block) => self.store.put_channel_block(channel, block).await?,
                    // somebody else created it in the meantime
                    Err(e) if self.channel_exists(channel).await? => {
                        tracing::warn!(error = %e, "create failed but channel exists");
                    }
                    Err(e) => return Err(e),
                }
                self.confirm(&ctx, "channel created", || async move {
                    Ok(if self.channel_exists(channel).await? {
                        Observation::Ready(())
                    } else {
                        Observation::Pending("orderer does not list the channel yet".into())
                    })
                })
                .await?;
            }
            self.channel_block(channel).await?;
            self.status(channel).await
        }
        .instrument(span)
        .await
    }

    /// Cached genesis block, fetched from the orderer when not cached.
    async fn channel_block(&self, channel: &str) -> OrchestratorResult<Vec<u8>> {
        if let Some(block) = self.store.channel_block(channel).await? {
            return Ok(block);
        }
        let creator = self.creator()?;
        let ctx = CallContext::new(Operation::FetchChannelBlock)
            .org(&creator.id)
            .channel(channel);
        tracing::info!(channel, "fetching genesis block from orderer");
        let block = poll::query(&self.policy, &ctx, || {
            self.gateway.fetch_genesis_block(creator, channel)
        })
        .await?;
        self.store.put_channel_block(channel, block.clone()).await?;
        Ok(block)
    }

    async fn confirm<F, Fut>(&self, ctx: &CallContext, what: &str, check: F) -> OrchestratorResult<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = OrchestratorResult<Observation<()>>>,
    {
        poll_until(what, self.policy.confirm_timeout, &self.policy.backoff, check)
            .await
            .map_err(|e| confirm_error(ctx, e))
    }

    /// Join one peer. A no-op when it already lists the channel.
    pub async fn join_peer(
        &self,
        channel: &str,
        org: &OrgId,
        peer: &str,
    ) -> OrchestratorResult<StepOutcome> {
        let (org, peer) = self.topology.peer(org, peer)?;
        let span = tracing::info_span!("join", channel, org = %org.id, peer = %peer.name);
        async move {
            let ctx = CallContext::new(Operation::JoinChannel)
                .org(&org.id)
                .channel(channel);
            if !self.channel_exists(channel).await? {
                return Err(OrchestratorError::conflict(
                    ctx,
                    format!("channel {} has not been created", channel),
                ));
            }
            if self.is_joined(org, peer, channel).await? {
                tracing::debug!("already joined");
                return Ok(StepOutcome::AlreadyDone);
            }

            let block = self.channel_block(channel).await?;
            match poll::submit(&self.policy, &ctx, || {
                self.gateway.join_channel(org, peer, &block)
            })
            .await
            {
                Ok(()) => {}
                Err(e) if self.is_joined(org, peer, channel).await? => {
                    tracing::warn!(error = %e, "join failed but peer lists the channel");
                }
                Err(e) => return Err(e),
            }
            self.confirm(&ctx, "peer joined", || async move {
                Ok(if self.is_joined(org, peer, channel).await? {
                    Observation::Ready(())
                } else {
                    Observation::Pending("peer does not list the channel yet".into())
                })
            })
            .await?;
            tracing::info!("peer joined");
            Ok(StepOutcome::Applied)
        }
        .instrument(span)
        .await
    }

    /// Join every peer of an org.
    pub async fn join_org(&self, channel: &str, org: &OrgId) -> OrchestratorResult<StepOutcome> {
        let peers: Vec<String> = self
            .topology
            .org(org)?
            .peers
            .iter()
            .map(|p| p.name.clone())
            .collect();
        let mut outcome = StepOutcome::AlreadyDone;
        for peer in peers {
            if self.join_peer(channel, org, &peer).await? == StepOutcome::Applied {
                outcome = StepOutcome::Applied;
            }
        }
        Ok(outcome)
    }

    /// Make the ledger advertise exactly the org's configured anchors.
    pub async fn update_anchor_peers(
        &self,
        channel: &str,
        org: &OrgId,
    ) -> OrchestratorResult<StepOutcome> {
        let org = self.topology.org(org)?;
        let span = tracing::info_span!("anchor", channel, org = %org.id);
        async move {
            let ctx = CallContext::new(Operation::UpdateAnchorPeers)
                .org(&org.id)
                .channel(channel);
            let wanted = org.anchor_set();
            if wanted.is_empty() {
                return Ok(StepOutcome::AlreadyDone);
            }
            if !self.channel_exists(channel).await? {
                return Err(OrchestratorError::conflict(
                    ctx,
                    format!("channel {} has not been created", channel),
                ));
            }
            let mut any_joined = false;
            for peer in &org.peers {
                if self.is_joined(org, peer, channel).await? {
                    any_joined = true;
                    break;
                }
            }
            if !any_joined {
                return Err(OrchestratorError::conflict(
                    ctx,
                    format!("no peer of {} has joined {}", org.id, channel),
                ));
            }
            if self.advertised_anchors(org, channel).await? == wanted {
                tracing::debug!("anchors already advertised");
                return Ok(StepOutcome::AlreadyDone);
            }

            let tx = self
                .artifacts
                .load(&ArtifactName::AnchorTx(org.msp_id.clone()))?;
            match poll::submit(&self.policy, &ctx, || {
                self.gateway.update_anchor_peers(org, channel, &tx.bytes)
            })
            .await
            {
                Ok(()) => {}
                Err(e) if self.advertised_anchors(org, channel).await? == wanted => {
                    tracing::warn!(error = %e, "anchor update failed but anchors are in place");
                }
                Err(e) => return Err(e),
            }
            let wanted = &wanted;
            self.confirm(&ctx, "anchors advertised", || async move {
                Ok(if &self.advertised_anchors(org, channel).await? == wanted {
                    Observation::Ready(())
                } else {
                    Observation::Pending("channel config does not list the anchors yet".into())
                })
            })
            .await?;
            tracing::info!(anchors = ?wanted, "anchor peers updated");
            Ok(StepOutcome::Applied)
        }
        .instrument(span)
        .await
    }

    /// Operator reset: drop the cached genesis block and derive the channel
    /// again, creating it if the orderer lost it or refetching block 0.
    ///
    /// Used after the network volumes were wiped, when peers were left with a
    /// genesis block from an earlier network. Approvals, commit records and
    /// deploy checkpoints of the old channel are dropped with it. Follow with
    /// [`Self::ensure_ready`] to rejoin.
    pub async fn force_recreate_channel(&self, channel: &str) -> OrchestratorResult<ChannelState> {
        tracing::warn!(channel, "discarding cached channel block and chaincode records");
        self.store.discard_channel_block(channel).await?;
        self.store.discard_channel_records(channel).await?;
        self.ensure_channel_exists(channel).await
    }

    /// Peers whose ledger is still at its genesis block although the channel
    /// has taken config updates since.
    pub async fn detect_stuck(&self, channel: &str) -> OrchestratorResult<Vec<StuckPeer>> {
        let state = self.status(channel).await?;
        let configured = state
            .heights
            .values()
            .copied()
            .max()
            .map(|h| h > 1)
            .unwrap_or(false)
            || !state.anchored.is_empty();
        if !configured {
            return Ok(Vec::new());
        }
        let mut stuck = Vec::new();
        for (org, peers) in &state.joined {
            for peer in peers {
                let height = state.heights.get(peer).copied().unwrap_or(0);
                if height <= 1 {
                    stuck.push(StuckPeer {
                        org: org.clone(),
                        peer: peer.clone(),
                        height,
                    });
                }
            }
        }
        Ok(stuck)
    }

    /// The full setup: wait for the orderer, make sure the channel exists,
    /// join every peer and update every org's anchors, then verify `Ready`.
    ///
    /// Orgs are joined and anchored concurrently. The first fatal error halts
    /// the flow and reports the step and the status reached.
    pub async fn ensure_ready(&self, channel: &str) -> Result<ChannelState, FlowError<ChannelStatus>> {
        let mut reached = ChannelStatus::Absent;

        self.wait_for_orderer_ready(self.policy.ready_timeout, &self.policy.backoff)
            .await
            .map_err(|e| FlowError::new("wait for orderer", reached, e))?;

        let state = self
            .ensure_channel_exists(channel)
            .await
            .map_err(|e| FlowError::new("create channel", reached, e))?;
        reached = state.status;

        let joins = self.topology.organizations.iter().map(|org| async move {
            (org.id.clone(), self.join_org(channel, &org.id).await)
        });
        for (org, result) in join_all(joins).await {
            if let Err(e) = result {
                let reached = self.reached(channel, reached).await;
                return Err(FlowError::new(format!("join {}", org), reached, e));
            }
        }
        reached = reached.max(ChannelStatus::JoinedAll);

        let anchors = self.topology.organizations.iter().map(|org| async move {
            (
                org.id.clone(),
                self.update_anchor_peers(channel, &org.id).await,
            )
        });
        for (org, result) in join_all(anchors).await {
            if let Err(e) = result {
                let reached = self.reached(channel, reached).await;
                return Err(FlowError::new(format!("anchor {}", org), reached, e));
            }
        }

        let state = self
            .status(channel)
            .await
            .map_err(|e| FlowError::new("verify", reached, e))?;
        if state.status != ChannelStatus::Ready {
            let ctx = CallContext::new(Operation::QueryAnchorPeers).channel(channel);
            return Err(FlowError::new(
                "verify",
                state.status,
                OrchestratorError::conflict(
                    ctx,
                    format!("channel is {} after setup", state.status),
                ),
            ));
        }
        tracing::info!(channel, "channel ready");
        Ok(state)
    }

    /// Best effort status after a failure, never below what was confirmed.
    async fn reached(&self, channel: &str, confirmed: ChannelStatus) -> ChannelStatus {
        match self.status(channel).await {
            Ok(state) => state.status.max(confirmed),
            Err(_) => confirmed,
        }
    }
}
