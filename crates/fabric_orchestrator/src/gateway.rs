//! The one seam through which orchestrators touch the ledger.

use crate::error::GatewayResult;
use crate::types::{ChaincodeDefinition, Endpoint, Organization, PackageId, PeerNode};
use serde::{Deserialize, Serialize};

mod peer_cli;

pub use peer_cli::*;

/// A chaincode package installed on a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    /// `label:hash`
    pub package_id: PackageId,
    /// Label
    pub label: String,
}

/// An org's approval as the ledger reports it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovedDefinition {
    /// Approved version
    pub version: String,
    /// Approved sequence
    pub sequence: u64,
    /// Package the org tied to the definition, if any
    pub package_id: Option<PackageId>,
}

impl ApprovedDefinition {
    /// Whether this approval is exactly `definition` with `package_id`
    pub fn matches(&self, definition: &ChaincodeDefinition, package_id: &PackageId) -> bool {
        self.version == definition.version
            && self.sequence == definition.sequence
            && self.package_id.as_ref() == Some(package_id)
    }
}

/// A definition committed on a channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedDefinition {
    /// Committed version
    pub version: String,
    /// Committed sequence
    pub sequence: u64,
}

/// Every call is one remote operation against an orderer or peer, made with
/// the identity of the given org.
///
/// Implementations never retry; retries, timeouts and confirmation polling
/// belong to the orchestrators.
#[mockall::automock]
#[async_trait::async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Succeeds once the orderer accepts requests
    async fn ping_orderer(&self, org: &Organization) -> GatewayResult<()>;

    /// Whether the orderer knows the channel
    async fn channel_exists(&self, org: &Organization, channel: &str) -> GatewayResult<bool>;

    /// Submit the channel creation transaction, returning the genesis block
    async fn create_channel(
        &self,
        org: &Organization,
        channel: &str,
        creation_tx: &[u8],
    ) -> GatewayResult<Vec<u8>>;

    /// Fetch block 0 of the channel from the orderer
    async fn fetch_genesis_block(&self, org: &Organization, channel: &str)
        -> GatewayResult<Vec<u8>>;

    /// Channels the peer has joined
    async fn joined_channels(
        &self,
        org: &Organization,
        peer: &PeerNode,
    ) -> GatewayResult<Vec<String>>;

    /// Join the peer to the channel given its genesis block
    async fn join_channel(
        &self,
        org: &Organization,
        peer: &PeerNode,
        genesis_block: &[u8],
    ) -> GatewayResult<()>;

    /// Ledger height of the channel on the peer
    async fn channel_height(
        &self,
        org: &Organization,
        peer: &PeerNode,
        channel: &str,
    ) -> GatewayResult<u64>;

    /// Anchor peers the channel config currently holds for the org
    async fn anchor_peers(&self, org: &Organization, channel: &str)
        -> GatewayResult<Vec<Endpoint>>;

    /// Submit the org's anchor peer update transaction
    async fn update_anchor_peers(
        &self,
        org: &Organization,
        channel: &str,
        update_tx: &[u8],
    ) -> GatewayResult<()>;

    /// Packages installed on the peer
    async fn query_installed(
        &self,
        org: &Organization,
        peer: &PeerNode,
    ) -> GatewayResult<Vec<InstalledPackage>>;

    /// Install a package on the peer, returning its package id
    async fn install(
        &self,
        org: &Organization,
        peer: &PeerNode,
        package: &[u8],
    ) -> GatewayResult<PackageId>;

    /// The org's approval of this (channel, name, sequence), if any
    async fn query_approved(
        &self,
        org: &Organization,
        definition: &ChaincodeDefinition,
    ) -> GatewayResult<Option<ApprovedDefinition>>;

    /// Approve the definition for the org
    async fn approve(
        &self,
        org: &Organization,
        definition: &ChaincodeDefinition,
        package_id: &PackageId,
    ) -> GatewayResult<()>;

    /// The definition currently committed for (channel, name), if any
    async fn query_committed(
        &self,
        org: &Organization,
        channel: &str,
        name: &str,
    ) -> GatewayResult<Option<CommittedDefinition>>;

    /// Commit the definition, collecting endorsements from `endorsers`
    async fn commit(
        &self,
        org: &Organization,
        definition: &ChaincodeDefinition,
        endorsers: &[Organization],
    ) -> GatewayResult<()>;
}
