//! Tool inputs and the compose file, rendered from the topology.
//!
//! `cryptogen` reads `crypto-config.yaml`, `configtxgen` reads
//! `configtx.yaml`, and the network runs from the compose file. All three
//! follow from the topology, so a fresh base directory needs nothing but the
//! topology file. Files already on disk are hand-edited more often than not,
//! and are left alone.

use super::{MaterialsReport, MaterialsResult};
use crate::config::TopologyConfig;
use crate::types::{Organization, PeerNode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// MSP id of the ordering organization
pub const ORDERER_MSP: &str = "OrdererMSP";
/// `configtxgen` profile for the system channel genesis block
pub const GENESIS_PROFILE: &str = "TwoOrgsOrdererGenesis";
/// `configtxgen` profile for application channels
pub const CHANNEL_PROFILE: &str = "TwoOrgsChannel";

const CONSORTIUM: &str = "SampleConsortium";
const COUCHDB_USER: &str = "admin";
const COUCHDB_PASSWORD: &str = "adminpw";
const OPERATIONS_PORT: u16 = 9443;
/// Where peer nodes find their own MSP. The admin MSP is mounted at
/// `DockerConfig::peer_msp_path` for the `peer` CLI.
const NODE_MSP: &str = "/etc/hyperledger/fabric/node-msp";

// crypto-config.yaml

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CryptoConfig {
    orderer_orgs: Vec<OrdererOrgSpec>,
    peer_orgs: Vec<PeerOrgSpec>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct OrdererOrgSpec {
    name: String,
    domain: String,
    specs: Vec<HostSpec>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PeerOrgSpec {
    name: String,
    domain: String,
    #[serde(rename = "EnableNodeOUs")]
    enable_node_ous: bool,
    specs: Vec<HostSpec>,
    users: UserCount,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostSpec {
    hostname: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UserCount {
    count: u32,
}

/// The host label cryptogen prefixes to the domain
fn host_label(host: &str, domain: &str) -> String {
    host.strip_suffix(&format!(".{}", domain))
        .unwrap_or(host)
        .to_string()
}

/// `crypto-config.yaml` for the orderer org and every member org
pub fn crypto_config(topology: &TopologyConfig) -> MaterialsResult<String> {
    let orderer = &topology.orderer;
    let config = CryptoConfig {
        orderer_orgs: vec![OrdererOrgSpec {
            name: "Orderer".to_string(),
            domain: orderer.domain.clone(),
            specs: vec![HostSpec {
                hostname: host_label(&orderer.host, &orderer.domain),
            }],
        }],
        peer_orgs: topology
            .organizations
            .iter()
            .map(|org| PeerOrgSpec {
                name: org.id.to_string(),
                domain: org.domain.clone(),
                enable_node_ous: true,
                specs: org
                    .peers
                    .iter()
                    .map(|p| HostSpec {
                        hostname: host_label(&p.name, &org.domain),
                    })
                    .collect(),
                users: UserCount { count: 1 },
            })
            .collect(),
    };
    Ok(serde_yaml::to_string(&config)?)
}

// configtx.yaml

#[derive(Clone, Serialize)]
struct Policy {
    #[serde(rename = "Type")]
    kind: &'static str,
    #[serde(rename = "Rule")]
    rule: String,
}

impl Policy {
    fn signature(rule: String) -> Self {
        Self {
            kind: "Signature",
            rule,
        }
    }

    fn implicit(rule: &str) -> Self {
        Self {
            kind: "ImplicitMeta",
            rule: rule.to_string(),
        }
    }
}

type Policies = BTreeMap<&'static str, Policy>;
type Capabilities = BTreeMap<&'static str, bool>;

#[derive(Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AnchorPeer {
    host: String,
    port: u16,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct OrgSection {
    name: String,
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "MSPDir")]
    msp_dir: String,
    policies: Policies,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    orderer_endpoints: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    anchor_peers: Vec<AnchorPeer>,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Consenter {
    host: String,
    port: u16,
    #[serde(rename = "ClientTLSCert")]
    client_tls_cert: String,
    #[serde(rename = "ServerTLSCert")]
    server_tls_cert: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct EtcdRaft {
    consenters: Vec<Consenter>,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct BatchSize {
    max_message_count: u32,
    absolute_max_bytes: &'static str,
    preferred_max_bytes: &'static str,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct OrdererSection {
    orderer_type: &'static str,
    etcd_raft: EtcdRaft,
    batch_timeout: &'static str,
    batch_size: BatchSize,
    organizations: Vec<OrgSection>,
    policies: Policies,
    capabilities: Capabilities,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ApplicationSection {
    organizations: Vec<OrgSection>,
    policies: Policies,
    capabilities: Capabilities,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Consortium {
    organizations: Vec<OrgSection>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Profile {
    policies: Policies,
    capabilities: Capabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    orderer: Option<OrdererSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    consortiums: Option<BTreeMap<&'static str, Consortium>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    consortium: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    application: Option<ApplicationSection>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ConfigTx {
    organizations: Vec<OrgSection>,
    profiles: BTreeMap<&'static str, Profile>,
}

fn v2_capabilities() -> Capabilities {
    BTreeMap::from([("V2_0", true)])
}

fn implicit_policies() -> Policies {
    BTreeMap::from([
        ("Readers", Policy::implicit("ANY Readers")),
        ("Writers", Policy::implicit("ANY Writers")),
        ("Admins", Policy::implicit("MAJORITY Admins")),
    ])
}

fn orderer_org(topology: &TopologyConfig) -> OrgSection {
    let member = format!("OR('{}.member')", ORDERER_MSP);
    OrgSection {
        name: "OrdererOrg".to_string(),
        id: ORDERER_MSP.to_string(),
        msp_dir: format!(
            "../organizations/ordererOrganizations/{}/msp",
            topology.orderer.domain
        ),
        policies: BTreeMap::from([
            ("Readers", Policy::signature(member.clone())),
            ("Writers", Policy::signature(member)),
            (
                "Admins",
                Policy::signature(format!("OR('{}.admin')", ORDERER_MSP)),
            ),
        ]),
        orderer_endpoints: vec![topology.orderer.endpoint().to_string()],
        anchor_peers: Vec::new(),
    }
}

fn member_org(org: &Organization) -> OrgSection {
    let msp = &org.msp_id;
    OrgSection {
        name: msp.to_string(),
        id: msp.to_string(),
        msp_dir: format!("../organizations/peerOrganizations/{}/msp", org.domain),
        policies: BTreeMap::from([
            (
                "Readers",
                Policy::signature(format!(
                    "OR('{0}.admin', '{0}.peer', '{0}.client')",
                    msp
                )),
            ),
            (
                "Writers",
                Policy::signature(format!("OR('{0}.admin', '{0}.client')", msp)),
            ),
            ("Admins", Policy::signature(format!("OR('{}.admin')", msp))),
            (
                "Endorsement",
                Policy::signature(format!("OR('{}.peer')", msp)),
            ),
        ]),
        orderer_endpoints: Vec::new(),
        anchor_peers: org
            .anchor_peers
            .iter()
            .map(|e| AnchorPeer {
                host: e.host.clone(),
                port: e.port,
            })
            .collect(),
    }
}

fn orderer_section(topology: &TopologyConfig, orderer_org: OrgSection) -> OrdererSection {
    let orderer = &topology.orderer;
    let tls = format!(
        "../organizations/ordererOrganizations/{}/orderers/{}/tls/server.crt",
        orderer.domain, orderer.host
    );
    let mut policies = implicit_policies();
    policies.insert("BlockValidation", Policy::implicit("ANY Writers"));
    OrdererSection {
        orderer_type: "etcdraft",
        etcd_raft: EtcdRaft {
            consenters: vec![Consenter {
                host: orderer.host.clone(),
                port: orderer.port,
                client_tls_cert: tls.clone(),
                server_tls_cert: tls,
            }],
        },
        batch_timeout: "2s",
        batch_size: BatchSize {
            max_message_count: 10,
            absolute_max_bytes: "99 MB",
            preferred_max_bytes: "512 KB",
        },
        organizations: vec![orderer_org],
        policies,
        capabilities: v2_capabilities(),
    }
}

fn application_section(members: Vec<OrgSection>) -> ApplicationSection {
    let mut policies = implicit_policies();
    policies.insert(
        "LifecycleEndorsement",
        Policy::implicit("MAJORITY Endorsement"),
    );
    policies.insert("Endorsement", Policy::implicit("MAJORITY Endorsement"));
    ApplicationSection {
        organizations: members,
        policies,
        capabilities: v2_capabilities(),
    }
}

/// `configtx.yaml` with the genesis and channel profiles
/// [`super::FabricToolsGenerator`] asks `configtxgen` for
pub fn configtx(topology: &TopologyConfig) -> MaterialsResult<String> {
    let orderer_org = orderer_org(topology);
    let members: Vec<_> = topology.organizations.iter().map(member_org).collect();

    let genesis = Profile {
        policies: implicit_policies(),
        capabilities: v2_capabilities(),
        orderer: Some(orderer_section(topology, orderer_org.clone())),
        consortiums: Some(BTreeMap::from([(
            CONSORTIUM,
            Consortium {
                organizations: members.clone(),
            },
        )])),
        consortium: None,
        application: None,
    };
    let channel = Profile {
        policies: implicit_policies(),
        capabilities: v2_capabilities(),
        orderer: None,
        consortiums: None,
        consortium: Some(CONSORTIUM),
        application: Some(application_section(members.clone())),
    };

    let config = ConfigTx {
        organizations: std::iter::once(orderer_org).chain(members).collect(),
        profiles: BTreeMap::from([(GENESIS_PROFILE, genesis), (CHANNEL_PROFILE, channel)]),
    };
    Ok(serde_yaml::to_string(&config)?)
}

// docker-compose.yaml

#[derive(Serialize, Default)]
struct Service {
    container_name: String,
    image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    environment: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    networks: Vec<String>,
}

#[derive(Serialize)]
struct Compose {
    services: BTreeMap<String, Service>,
    volumes: BTreeMap<String, Option<()>>,
    networks: BTreeMap<String, BTreeMap<&'static str, String>>,
}

fn orderer_service(topology: &TopologyConfig) -> Service {
    let orderer = &topology.orderer;
    let dir = format!(
        "./organizations/ordererOrganizations/{}/orderers/{}",
        orderer.domain, orderer.host
    );
    let genesis = "/var/hyperledger/orderer/orderer.genesis.block";
    Service {
        container_name: orderer.container.clone(),
        image: topology.docker.orderer_image.clone(),
        environment: vec![
            "FABRIC_LOGGING_SPEC=INFO".to_string(),
            "ORDERER_GENERAL_LISTENADDRESS=0.0.0.0".to_string(),
            format!("ORDERER_GENERAL_LISTENPORT={}", orderer.port),
            "ORDERER_GENERAL_BOOTSTRAPMETHOD=file".to_string(),
            format!("ORDERER_GENERAL_BOOTSTRAPFILE={}", genesis),
            format!("ORDERER_GENERAL_LOCALMSPID={}", ORDERER_MSP),
            "ORDERER_GENERAL_LOCALMSPDIR=/var/hyperledger/orderer/msp".to_string(),
            "ORDERER_GENERAL_TLS_ENABLED=true".to_string(),
            "ORDERER_GENERAL_TLS_PRIVATEKEY=/var/hyperledger/orderer/tls/server.key".to_string(),
            "ORDERER_GENERAL_TLS_CERTIFICATE=/var/hyperledger/orderer/tls/server.crt".to_string(),
            "ORDERER_GENERAL_TLS_ROOTCAS=[/var/hyperledger/orderer/tls/ca.crt]".to_string(),
            "ORDERER_GENERAL_CLUSTER_CLIENTCERTIFICATE=/var/hyperledger/orderer/tls/server.crt"
                .to_string(),
            "ORDERER_GENERAL_CLUSTER_CLIENTPRIVATEKEY=/var/hyperledger/orderer/tls/server.key"
                .to_string(),
            "ORDERER_GENERAL_CLUSTER_ROOTCAS=[/var/hyperledger/orderer/tls/ca.crt]".to_string(),
            "ORDERER_FILELEDGER_LOCATION=/var/hyperledger/production/orderer".to_string(),
        ],
        working_dir: Some("/opt/gopath/src/github.com/hyperledger/fabric".to_string()),
        command: Some("orderer".to_string()),
        volumes: vec![
            format!("./channel-artifacts/genesis.block:{}", genesis),
            format!("{}/msp:/var/hyperledger/orderer/msp", dir),
            format!("{}/tls/:/var/hyperledger/orderer/tls", dir),
            format!("{}:/var/hyperledger/production/orderer", orderer.container),
        ],
        ports: vec![format!("{0}:{0}", orderer.port)],
        depends_on: Vec::new(),
        networks: vec![topology.docker.network.clone()],
    }
}

fn peer_service(
    topology: &TopologyConfig,
    org: &Organization,
    peer: &PeerNode,
    couchdb: &str,
    operations_port: u16,
) -> Service {
    let docker = &topology.docker;
    let endpoint = peer.endpoint().to_string();
    let chaincode_port = peer.port.saturating_add(1);
    let chaincode_endpoint = format!("{}:{}", peer.name, chaincode_port);
    let builder = serde_json::json!({
        "peers": [{
            "name": peer.name,
            "address": chaincode_endpoint,
            "tls_required": true,
            "client_tls_cert": "/etc/hyperledger/fabric/tls/server.crt",
            "root_cert": "/etc/hyperledger/fabric/tls/ca.crt",
        }]
    });
    let org_dir = format!("./organizations/peerOrganizations/{}", org.domain);
    Service {
        container_name: peer.container.clone(),
        image: docker.peer_image.clone(),
        environment: vec![
            "CORE_VM_ENDPOINT=unix:///host/var/run/docker.sock".to_string(),
            format!("CORE_VM_DOCKER_HOSTCONFIG_NETWORKMODE={}", docker.network),
            "FABRIC_LOGGING_SPEC=INFO".to_string(),
            "CORE_PEER_TLS_ENABLED=true".to_string(),
            "CORE_PEER_PROFILE_ENABLED=true".to_string(),
            "CORE_PEER_TLS_CERT_FILE=/etc/hyperledger/fabric/tls/server.crt".to_string(),
            "CORE_PEER_TLS_KEY_FILE=/etc/hyperledger/fabric/tls/server.key".to_string(),
            "CORE_PEER_TLS_ROOTCERT_FILE=/etc/hyperledger/fabric/tls/ca.crt".to_string(),
            format!("CORE_PEER_ID={}", peer.name),
            format!("CORE_PEER_ADDRESS={}", endpoint),
            format!("CORE_PEER_LISTENADDRESS=0.0.0.0:{}", peer.port),
            format!("CORE_PEER_CHAINCODEADDRESS={}", chaincode_endpoint),
            format!("CORE_PEER_CHAINCODELISTENADDRESS=0.0.0.0:{}", chaincode_port),
            format!("CORE_PEER_GOSSIP_BOOTSTRAP={}", endpoint),
            format!("CORE_PEER_GOSSIP_EXTERNALENDPOINT={}", endpoint),
            format!("CORE_PEER_LOCALMSPID={}", org.msp_id),
            format!("CORE_PEER_MSPCONFIGPATH={}", NODE_MSP),
            format!("CORE_OPERATIONS_LISTENADDRESS=0.0.0.0:{}", operations_port),
            format!("CHAINCODE_AS_A_SERVICE_BUILDER_CONFIG={}", builder),
            "CORE_PEER_GOSSIP_USELEADERELECTION=true".to_string(),
            "CORE_PEER_GOSSIP_ORGLEADER=false".to_string(),
            "CORE_LEDGER_STATE_STATEDATABASE=CouchDB".to_string(),
            format!(
                "CORE_LEDGER_STATE_COUCHDBCONFIG_COUCHDBADDRESS={}:5984",
                couchdb
            ),
            format!("CORE_LEDGER_STATE_COUCHDBCONFIG_USERNAME={}", COUCHDB_USER),
            format!("CORE_LEDGER_STATE_COUCHDBCONFIG_PASSWORD={}", COUCHDB_PASSWORD),
        ],
        working_dir: Some(docker.peer_workdir.clone()),
        command: Some("peer node start".to_string()),
        volumes: vec![
            "/var/run/:/host/var/run/".to_string(),
            format!("{}/peers/{}/msp:{}", org_dir, peer.name, NODE_MSP),
            format!(
                "{}/users/{}@{}/msp:{}",
                org_dir, org.admin_user, org.domain, docker.peer_msp_path
            ),
            format!("{}/peers/{}/tls/:/etc/hyperledger/fabric/tls", org_dir, peer.name),
            format!("{}:/var/hyperledger/production", peer.name),
        ],
        ports: vec![
            format!("{0}:{0}", peer.port),
            format!("{0}:{0}", operations_port),
        ],
        depends_on: vec![topology.orderer.host.clone(), couchdb.to_string()],
        networks: vec![docker.network.clone()],
    }
}

fn couchdb_service(topology: &TopologyConfig, name: &str) -> Service {
    Service {
        container_name: name.to_string(),
        image: topology.docker.couchdb_image.clone(),
        environment: vec![
            format!("COUCHDB_USER={}", COUCHDB_USER),
            format!("COUCHDB_PASSWORD={}", COUCHDB_PASSWORD),
        ],
        networks: vec![topology.docker.network.clone()],
        ..Default::default()
    }
}

/// The compose file: the orderer, every peer, and a CouchDB per peer
pub fn compose(topology: &TopologyConfig) -> MaterialsResult<String> {
    let mut services = BTreeMap::new();
    let mut volumes = BTreeMap::new();
    services.insert(topology.orderer.host.clone(), orderer_service(topology));
    volumes.insert(topology.orderer.container.clone(), None);

    let peers = topology
        .organizations
        .iter()
        .flat_map(|org| org.peers.iter().map(move |peer| (org, peer)));
    for (index, (org, peer)) in peers.enumerate() {
        let couchdb = format!("couchdb{}", index);
        let operations_port = OPERATIONS_PORT.saturating_add(index as u16);
        services.insert(
            peer.name.clone(),
            peer_service(topology, org, peer, &couchdb, operations_port),
        );
        services.insert(couchdb.clone(), couchdb_service(topology, &couchdb));
        volumes.insert(peer.name.clone(), None);
    }

    let network = &topology.docker.network;
    let compose = Compose {
        services,
        volumes,
        networks: BTreeMap::from([(
            network.clone(),
            BTreeMap::from([("name", network.clone())]),
        )]),
    };
    Ok(serde_yaml::to_string(&compose)?)
}

/// Render into `path` unless something is already there
fn write_missing(
    path: &Path,
    render: impl FnOnce() -> MaterialsResult<String>,
    label: String,
    report: &mut MaterialsReport,
) -> MaterialsResult<()> {
    if path.exists() {
        report.skipped.push(label);
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render()?)?;
    tracing::info!(path = %path.display(), "rendered from the topology");
    report.generated.push(label);
    Ok(())
}

/// Render each input that is not on disk yet
pub fn render_missing(
    topology: &TopologyConfig,
    report: &mut MaterialsReport,
) -> MaterialsResult<()> {
    let config = topology.config_dir();
    write_missing(
        &config.join("crypto-config.yaml"),
        || crypto_config(topology),
        "crypto-config.yaml".to_string(),
        report,
    )?;
    write_missing(
        &config.join("configtx.yaml"),
        || configtx(topology),
        "configtx.yaml".to_string(),
        report,
    )?;
    let compose_file = topology.compose_file();
    write_missing(
        &compose_file,
        || compose(topology),
        topology.docker.compose_file.display().to_string(),
        report,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_yaml::Value;

    fn parsed(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn crypto_config_lists_every_org_and_host() {
        let t = TopologyConfig::two_org_default();
        let v = parsed(&crypto_config(&t).unwrap());
        assert_eq!(v["OrdererOrgs"][0]["Domain"], "example.com");
        assert_eq!(v["OrdererOrgs"][0]["Specs"][0]["Hostname"], "orderer");
        let peers = v["PeerOrgs"].as_sequence().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1]["Name"], "Org2");
        assert_eq!(peers[1]["Domain"], "org2.example.com");
        assert_eq!(peers[1]["EnableNodeOUs"], true);
        assert_eq!(peers[1]["Specs"][0]["Hostname"], "peer0");
    }

    #[test]
    fn configtx_has_both_profiles() {
        let t = TopologyConfig::two_org_default();
        let v = parsed(&configtx(&t).unwrap());
        let genesis = &v["Profiles"][GENESIS_PROFILE];
        assert_eq!(genesis["Orderer"]["OrdererType"], "etcdraft");
        assert_eq!(
            genesis["Orderer"]["EtcdRaft"]["Consenters"][0]["ServerTLSCert"],
            "../organizations/ordererOrganizations/example.com/orderers/orderer.example.com/tls/server.crt"
        );
        assert_eq!(
            genesis["Consortiums"][CONSORTIUM]["Organizations"]
                .as_sequence()
                .unwrap()
                .len(),
            2
        );

        let channel = &v["Profiles"][CHANNEL_PROFILE];
        assert_eq!(channel["Consortium"], CONSORTIUM);
        let org1 = &channel["Application"]["Organizations"][0];
        assert_eq!(org1["ID"], "Org1MSP");
        assert_eq!(org1["AnchorPeers"][0]["Host"], "peer0.org1.example.com");
        assert_eq!(org1["AnchorPeers"][0]["Port"], 7051);
        assert_eq!(
            channel["Application"]["Policies"]["LifecycleEndorsement"]["Rule"],
            "MAJORITY Endorsement"
        );
        assert_eq!(v["Organizations"][0]["ID"], ORDERER_MSP);
    }

    #[test]
    fn compose_runs_the_topology_containers() {
        let t = TopologyConfig::two_org_default();
        let v = parsed(&compose(&t).unwrap());
        let services = v["services"].as_mapping().unwrap();
        // orderer, two peers, two couchdbs
        assert_eq!(services.len(), 5);
        assert_eq!(v["services"]["orderer.example.com"]["container_name"], "orderer0");
        let peer = &v["services"]["peer0.org2.example.com"];
        assert_eq!(peer["image"], "hyperledger/fabric-peer:2.5");
        assert_eq!(peer["ports"][0], "9051:9051");
        assert_eq!(peer["ports"][1], "9444:9444");
        let env: Vec<_> = peer["environment"]
            .as_sequence()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(env.contains(&"CORE_PEER_LOCALMSPID=Org2MSP"));
        assert!(env.contains(&"CORE_LEDGER_STATE_COUCHDBCONFIG_COUCHDBADDRESS=couchdb1:5984"));
        let builder = env
            .iter()
            .find_map(|e| e.strip_prefix("CHAINCODE_AS_A_SERVICE_BUILDER_CONFIG="))
            .unwrap();
        let builder: serde_json::Value = serde_json::from_str(builder).unwrap();
        assert_eq!(builder["peers"][0]["address"], "peer0.org2.example.com:9052");
        assert!(peer["volumes"]
            .as_sequence()
            .unwrap()
            .contains(&Value::from(
                "./organizations/peerOrganizations/org2.example.com/users/Admin@org2.example.com/msp:/etc/hyperledger/fabric/msp"
            )));
        assert_eq!(v["networks"]["fabric-network"]["name"], "fabric-network");
    }

    #[test]
    fn host_labels_drop_the_domain() {
        assert_eq!(host_label("peer0.org1.example.com", "org1.example.com"), "peer0");
        assert_eq!(host_label("standalone", "org1.example.com"), "standalone");
    }
}
