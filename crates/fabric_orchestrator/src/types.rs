//! Plain data shared by the orchestrators, the gateway and the state repository.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// Short organization id as used in the topology, e.g. `Org1`.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From,
)]
#[serde(transparent)]
pub struct OrgId(String);

impl OrgId {
    /// Construct from anything string-like
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OrgId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Membership service provider id, e.g. `Org1MSP`.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From,
)]
#[serde(transparent)]
pub struct MspId(String);

impl MspId {
    /// Construct from anything string-like
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MspId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Content-derived chaincode package id: `label:sha256hex`.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From,
)]
#[serde(transparent)]
pub struct PackageId(String);

impl PackageId {
    /// Construct from anything string-like
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner id
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The label part, everything before the last `:`
    pub fn label(&self) -> &str {
        self.0.rsplit_once(':').map(|(l, _)| l).unwrap_or(&self.0)
    }
}

impl From<&str> for PackageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A `host:port` pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display(fmt = "{}:{}", host, port)]
pub struct Endpoint {
    /// Host name as peers resolve it inside the network
    pub host: String,
    /// Port
    pub port: u16,
}

impl Endpoint {
    /// Construct an endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("endpoint '{}' is not host:port", s))?;
        if host.is_empty() {
            return Err(format!("endpoint '{}' has an empty host", s));
        }
        let port = port
            .parse()
            .map_err(|e| format!("endpoint '{}' has a bad port: {}", s, e))?;
        Ok(Self::new(host, port))
    }
}

/// A peer belonging to exactly one organization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    /// Peer host name, e.g. `peer0.org1.example.com`
    pub name: String,
    /// Container the peer runs in
    pub container: String,
    /// Listen port
    pub port: u16,
    /// TLS root cert of this peer as seen from inside the peer containers,
    /// handed to `--tlsRootCertFiles` when collecting endorsements
    #[serde(default = "default_tls_root_cert")]
    pub tls_root_cert: String,
}

fn default_tls_root_cert() -> String {
    "/etc/hyperledger/fabric/tls/ca.crt".to_string()
}

impl PeerNode {
    /// A peer whose container is named after its host
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        Self {
            container: name.clone(),
            name,
            port,
            tls_root_cert: default_tls_root_cert(),
        }
    }

    /// Address other components dial
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.name.clone(), self.port)
    }
}

/// One organization of the network. Fixed once the topology is loaded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    /// Short id, e.g. `Org1`
    pub id: OrgId,
    /// MSP id, e.g. `Org1MSP`
    pub msp_id: MspId,
    /// Domain, e.g. `org1.example.com`
    pub domain: String,
    /// Admin user name, e.g. `Admin`
    #[serde(default = "default_admin")]
    pub admin_user: String,
    /// Peers of this org
    pub peers: Vec<PeerNode>,
    /// Anchor peers this org advertises on every channel
    #[serde(default)]
    pub anchor_peers: Vec<Endpoint>,
}

fn default_admin() -> String {
    "Admin".to_string()
}

impl Organization {
    /// Fully qualified admin identity, e.g. `Admin@org1.example.com`
    pub fn admin_identity(&self) -> String {
        format!("{}@{}", self.admin_user, self.domain)
    }

    /// Look up one of this org's peers by name
    pub fn peer(&self, name: &str) -> Option<&PeerNode> {
        self.peers.iter().find(|p| p.name == name)
    }

    /// The peer used for org-level queries and submissions
    pub fn lead_peer(&self) -> Option<&PeerNode> {
        self.peers.first()
    }

    /// The configured anchors as a set
    pub fn anchor_set(&self) -> BTreeSet<Endpoint> {
        self.anchor_peers.iter().cloned().collect()
    }
}

/// Lifecycle status of a channel, derived from live queries.
///
/// The order of the variants is the order of progress, which lets callers
/// check that an operation never moved a channel backwards.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
pub enum ChannelStatus {
    /// The orderer does not know the channel
    Absent,
    /// The channel exists but no peer has joined
    Created,
    /// Some but not all peers have joined
    PartiallyJoined,
    /// Every peer has joined
    JoinedAll,
    /// Every peer has joined and every org advertises its configured anchors
    Ready,
}

/// Snapshot of a channel as observed on the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    /// Channel name
    pub name: String,
    /// Derived status
    pub status: ChannelStatus,
    /// Peers that list the channel, per org
    pub joined: BTreeMap<OrgId, BTreeSet<String>>,
    /// Observed ledger height per joined peer
    pub heights: BTreeMap<String, u64>,
    /// Orgs whose advertised anchors equal the configured set
    pub anchored: BTreeSet<OrgId>,
}

impl ChannelState {
    /// State of a channel the orderer does not know
    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ChannelStatus::Absent,
            joined: BTreeMap::new(),
            heights: BTreeMap::new(),
            anchored: BTreeSet::new(),
        }
    }

    /// Whether the given peer of the org has joined
    pub fn has_joined(&self, org: &OrgId, peer: &str) -> bool {
        self.joined
            .get(org)
            .map(|peers| peers.contains(peer))
            .unwrap_or(false)
    }
}

/// Identity of a deployable chaincode unit.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display(fmt = "{}@{} (sequence {}) on {}", name, version, sequence, channel)]
pub struct ChaincodeDefinition {
    /// Channel the definition lives on
    pub channel: String,
    /// Chaincode name
    pub name: String,
    /// Version label
    pub version: String,
    /// Lifecycle sequence, strictly increasing per (channel, name)
    pub sequence: u64,
}

impl ChaincodeDefinition {
    /// Construct a definition
    pub fn new(
        channel: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        sequence: u64,
    ) -> Self {
        Self {
            channel: channel.into(),
            name: name.into(),
            version: version.into(),
            sequence,
        }
    }

    /// The key this definition's records are stored under
    pub fn key(&self) -> DefinitionKey {
        DefinitionKey {
            channel: self.channel.clone(),
            name: self.name.clone(),
            sequence: self.sequence,
        }
    }

    /// Same definition at the next sequence
    pub fn next_sequence(&self, version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            sequence: self.sequence + 1,
            ..self.clone()
        }
    }
}

/// (channel, chaincode, sequence)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display(fmt = "{}/{}#{}", channel, name, sequence)]
pub struct DefinitionKey {
    /// Channel
    pub channel: String,
    /// Chaincode name
    pub name: String,
    /// Sequence
    pub sequence: u64,
}

/// One org's vote for a definition. Overwritten, never appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Voting org
    pub org: OrgId,
    /// What the org approved
    pub definition: ChaincodeDefinition,
    /// Package the org approved the definition with
    pub package_id: Option<PackageId>,
    /// Whether the ledger currently holds this approval
    pub approved: bool,
}

/// Terminal record of a committed definition. Write-once per sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Committed definition
    pub definition: ChaincodeDefinition,
    /// The package every required org approved
    pub package_id: PackageId,
    /// Always true once written
    pub committed: bool,
}
