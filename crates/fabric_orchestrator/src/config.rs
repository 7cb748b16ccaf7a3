//! The topology file: who is in the network and where everything lives.

use crate::poll::{CallPolicy, CallPolicyConfig};
use crate::types::{Endpoint, MspId, OrgId, Organization, PeerNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Errors loading or using the topology.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No file at the given path
    #[error("topology file not found at {0}")]
    ConfigMissing(PathBuf),

    /// The file is not valid YAML for a topology
    #[error("topology could not be parsed: {0}")]
    SerializationError(#[from] serde_yaml::Error),

    /// Reading the file failed
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// The topology parsed but makes no sense
    #[error("invalid topology: {0}")]
    Invalid(String),

    /// An org id that is not part of the topology
    #[error("organization '{0}' is not part of the topology")]
    UnknownOrg(OrgId),

    /// A peer that does not belong to the org
    #[error("peer '{peer}' does not belong to organization '{org}'")]
    UnknownPeer {
        /// Org
        org: OrgId,
        /// Peer name
        peer: String,
    },
}

/// Config Result
pub type ConfigResult<T> = Result<T, ConfigError>;

/// The ordering service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrdererConfig {
    /// Host name, also the TLS hostname override
    pub host: String,
    /// Container name
    pub container: String,
    /// Listen port
    pub port: u16,
    /// Orderer org domain
    pub domain: String,
    /// System channel name, fetched to check readiness
    #[serde(default = "default_system_channel")]
    pub system_channel: String,
    /// Orderer TLS CA on the host. When unset it is looked up in
    /// `organizations/ordererOrganizations/<domain>/orderers/<host>/msp/tlscacerts`.
    #[serde(default)]
    pub tls_ca_file: Option<PathBuf>,
}

fn default_system_channel() -> String {
    "system-channel".to_string()
}

impl OrdererConfig {
    /// Address peers dial
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

/// Defaults for the chaincode-as-a-service deployment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaincodeConfig {
    /// Chaincode name
    pub name: String,
    /// Version
    pub version: String,
    /// Sequence
    pub sequence: u64,
    /// Package label, `<name>_<version>` when unset
    pub label: Option<String>,
    /// Where peers dial the chaincode service
    pub address: String,
    /// Dial timeout written into connection.json
    pub dial_timeout: String,
    /// Whether peers dial the service over TLS
    pub tls_required: bool,
    /// Orgs that must approve before commit, all channel members when empty
    pub required_orgs: Vec<OrgId>,
}

impl Default for ChaincodeConfig {
    fn default() -> Self {
        Self {
            name: "taskdocument".to_string(),
            version: "1.0".to_string(),
            sequence: 1,
            label: None,
            address: "chaincode-rest:9999".to_string(),
            dial_timeout: "10s".to_string(),
            tls_required: false,
            required_orgs: Vec::new(),
        }
    }
}

impl ChaincodeConfig {
    /// Label used for the package
    pub fn label_or_default(&self, name: &str, version: &str) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("{}_{}", name, version))
    }
}

/// How containers are reached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// `docker` binary
    pub docker: String,
    /// Image with `cryptogen`, `configtxgen` and `configtxlator`
    pub tools_image: String,
    /// Working directory of the `peer` CLI inside peer containers
    pub peer_workdir: String,
    /// MSP directory of the admin identity inside peer containers
    pub peer_msp_path: String,
    /// TLS root cert of the local peer inside peer containers
    pub peer_tls_root_cert: String,
    /// Compose file, relative to the base directory
    pub compose_file: PathBuf,
    /// Peer image written into a rendered compose file
    pub peer_image: String,
    /// Orderer image written into a rendered compose file
    pub orderer_image: String,
    /// State database image, one container per peer
    pub couchdb_image: String,
    /// Docker network the rendered compose file puts every container on
    pub network: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
            tools_image: "hyperledger/fabric-tools:2.5".to_string(),
            peer_workdir: "/opt/gopath/src/github.com/hyperledger/fabric/peer".to_string(),
            peer_msp_path: "/etc/hyperledger/fabric/msp".to_string(),
            peer_tls_root_cert: "/etc/hyperledger/fabric/tls/ca.crt".to_string(),
            compose_file: PathBuf::from("docker-compose.yaml"),
            peer_image: "hyperledger/fabric-peer:2.5".to_string(),
            orderer_image: "hyperledger/fabric-orderer:2.5".to_string(),
            couchdb_image: "couchdb:3.2".to_string(),
            network: "fabric-network".to_string(),
        }
    }
}

/// The whole network as the orchestrators see it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Directory holding `config/`, `organizations/`, `channel-artifacts/`
    /// and the compose file. Relative paths are resolved against the
    /// topology file's directory.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Application channel
    pub channel: String,
    /// Org that creates the channel and commits definitions, the first org when unset
    #[serde(default)]
    pub creator_org: Option<OrgId>,
    /// Ordering service
    pub orderer: OrdererConfig,
    /// Member orgs
    pub organizations: Vec<Organization>,
    /// Chaincode defaults
    #[serde(default)]
    pub chaincode: ChaincodeConfig,
    /// Timeouts and retries
    #[serde(default)]
    pub policy: CallPolicyConfig,
    /// Container access
    #[serde(default)]
    pub docker: DockerConfig,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}

impl TopologyConfig {
    /// Create a topology from a yaml file, validating it
    pub fn load_yaml(path: &Path) -> ConfigResult<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ConfigError::ConfigMissing(path.into())
            } else {
                ConfigError::from(err)
            }
        })?;
        let mut config = Self::from_yaml(&yaml)?;
        if config.base_dir.is_relative() {
            if let Some(parent) = path.parent() {
                config.base_dir = parent.join(&config.base_dir);
            }
        }
        Ok(config)
    }

    /// Parse and validate yaml
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the topology as yaml
    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// The two-org network of the sample deployment: `npa-channel`,
    /// `Org1MSP` on 7051, `Org2MSP` on 9051, the orderer on 7050 and the
    /// `taskdocument` chaincode service at `chaincode-rest:9999`.
    pub fn two_org_default() -> Self {
        let org = |n: u16, port: u16| {
            let domain = format!("org{}.example.com", n);
            let peer = format!("peer0.{}", domain);
            Organization {
                id: OrgId::new(format!("Org{}", n)),
                msp_id: MspId::new(format!("Org{}MSP", n)),
                admin_user: "Admin".to_string(),
                peers: vec![PeerNode::new(peer.clone(), port)],
                anchor_peers: vec![Endpoint::new(peer, port)],
                domain,
            }
        };
        Self {
            base_dir: default_base_dir(),
            channel: "npa-channel".to_string(),
            creator_org: None,
            orderer: OrdererConfig {
                host: "orderer.example.com".to_string(),
                container: "orderer0".to_string(),
                port: 7050,
                domain: "example.com".to_string(),
                system_channel: default_system_channel(),
                tls_ca_file: None,
            },
            organizations: vec![org(1, 7051), org(2, 9051)],
            chaincode: ChaincodeConfig::default(),
            policy: CallPolicyConfig::default(),
            docker: DockerConfig::default(),
        }
    }

    /// Check the topology is usable
    pub fn validate(&self) -> ConfigResult<()> {
        if self.channel.is_empty()
            || !self
                .channel
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        {
            return Err(ConfigError::Invalid(format!(
                "channel name '{}' must be lowercase alphanumerics, '.' or '-'",
                self.channel
            )));
        }
        if self.organizations.is_empty() {
            return Err(ConfigError::Invalid("no organizations".into()));
        }
        let mut ids = BTreeSet::new();
        let mut peers = BTreeSet::new();
        for org in &self.organizations {
            if !ids.insert(&org.id) {
                return Err(ConfigError::Invalid(format!(
                    "organization '{}' is listed twice",
                    org.id
                )));
            }
            if org.peers.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "organization '{}' has no peers",
                    org.id
                )));
            }
            for peer in &org.peers {
                if !peers.insert(&peer.name) {
                    return Err(ConfigError::Invalid(format!(
                        "peer '{}' is listed twice",
                        peer.name
                    )));
                }
            }
        }
        if let Some(creator) = &self.creator_org {
            self.org(creator)?;
        }
        for org in &self.chaincode.required_orgs {
            self.org(org)?;
        }
        Ok(())
    }

    /// Look up an org
    pub fn org(&self, id: &OrgId) -> ConfigResult<&Organization> {
        self.organizations
            .iter()
            .find(|o| &o.id == id)
            .ok_or_else(|| ConfigError::UnknownOrg(id.clone()))
    }

    /// Look up a peer of an org
    pub fn peer(&self, org: &OrgId, peer: &str) -> ConfigResult<(&Organization, &PeerNode)> {
        let o = self.org(org)?;
        let p = o.peer(peer).ok_or_else(|| ConfigError::UnknownPeer {
            org: org.clone(),
            peer: peer.to_string(),
        })?;
        Ok((o, p))
    }

    /// Org that creates channels and submits commits
    pub fn creator(&self) -> ConfigResult<&Organization> {
        match &self.creator_org {
            Some(id) => self.org(id),
            None => self
                .organizations
                .first()
                .ok_or_else(|| ConfigError::Invalid("no organizations".into())),
        }
    }

    /// Orgs that must approve a definition before it can be committed
    pub fn required_orgs(&self) -> Vec<&Organization> {
        if self.chaincode.required_orgs.is_empty() {
            self.organizations.iter().collect()
        } else {
            self.organizations
                .iter()
                .filter(|o| self.chaincode.required_orgs.contains(&o.id))
                .collect()
        }
    }

    /// Timeouts and retries for remote calls
    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy::from(&self.policy)
    }

    /// `config/`: inputs of cryptogen and configtxgen
    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    /// `organizations/`: generated identities
    pub fn organizations_dir(&self) -> PathBuf {
        self.base_dir.join("organizations")
    }

    /// `channel-artifacts/`: generated blocks and transactions
    pub fn channel_artifacts_dir(&self) -> PathBuf {
        self.base_dir.join("channel-artifacts")
    }

    /// The compose file
    pub fn compose_file(&self) -> PathBuf {
        self.base_dir.join(&self.docker.compose_file)
    }

    /// Containers that must be running for channel work
    pub fn service_containers(&self) -> Vec<String> {
        std::iter::once(self.orderer.container.clone())
            .chain(
                self.organizations
                    .iter()
                    .flat_map(|o| o.peers.iter().map(|p| p.container.clone())),
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn two_org_default_matches_the_sample_network() {
        let t = TopologyConfig::two_org_default();
        t.validate().unwrap();
        assert_eq!(t.channel, "npa-channel");
        assert_eq!(t.creator().unwrap().msp_id.as_str(), "Org1MSP");
        let org2 = t.org(&"Org2".into()).unwrap();
        assert_eq!(org2.peers[0].endpoint().to_string(), "peer0.org2.example.com:9051");
        assert_eq!(org2.admin_identity(), "Admin@org2.example.com");
        assert_eq!(t.orderer.endpoint().to_string(), "orderer.example.com:7050");
        assert_eq!(t.required_orgs().len(), 2);
        assert_eq!(
            t.service_containers(),
            vec!["orderer0", "peer0.org1.example.com", "peer0.org2.example.com"]
        );
    }

    #[test]
    fn yaml_round_trip_keeps_the_topology() {
        let t = TopologyConfig::two_org_default();
        let yaml = t.to_yaml().unwrap();
        assert_eq!(TopologyConfig::from_yaml(&yaml).unwrap(), t);
    }

    #[test]
    fn minimal_yaml_fills_defaults() {
        let yaml = r#"
channel: npa-channel
orderer:
  host: orderer.example.com
  container: orderer0
  port: 7050
  domain: example.com
organizations:
  - id: Org1
    msp_id: Org1MSP
    domain: org1.example.com
    peers:
      - name: peer0.org1.example.com
        container: peer0.org1.example.com
        port: 7051
    anchor_peers:
      - host: peer0.org1.example.com
        port: 7051
"#;
        let t = TopologyConfig::from_yaml(yaml).unwrap();
        assert_eq!(t.chaincode.name, "taskdocument");
        assert_eq!(t.orderer.system_channel, "system-channel");
        assert_eq!(t.organizations[0].admin_user, "Admin");
        assert_eq!(t.call_policy(), CallPolicy::default());
    }

    #[test]
    fn validation_rejects_broken_topologies() {
        let mut t = TopologyConfig::two_org_default();
        t.organizations[1].id = "Org1".into();
        assert_matches!(t.validate(), Err(ConfigError::Invalid(_)));

        let mut t = TopologyConfig::two_org_default();
        t.chaincode.required_orgs = vec!["Org3".into()];
        assert_matches!(t.validate(), Err(ConfigError::UnknownOrg(_)));

        let mut t = TopologyConfig::two_org_default();
        t.channel = "NPA channel".into();
        assert_matches!(t.validate(), Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn load_yaml_reports_a_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            TopologyConfig::load_yaml(&dir.path().join("nope.yaml")),
            Err(ConfigError::ConfigMissing(_))
        );
    }

    #[test]
    fn load_yaml_resolves_base_dir_against_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.yaml");
        std::fs::write(&path, TopologyConfig::two_org_default().to_yaml().unwrap()).unwrap();
        let t = TopologyConfig::load_yaml(&path).unwrap();
        assert_eq!(t.channel_artifacts_dir(), dir.path().join(".").join("channel-artifacts"));
    }
}
