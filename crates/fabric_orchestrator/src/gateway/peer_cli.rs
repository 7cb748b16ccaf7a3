use super::*;
use crate::config::TopologyConfig;
use crate::error::GatewayError;
use crate::process::{CommandOutput, CommandRunner, Invocation};
use std::path::PathBuf;
use std::sync::Arc;

const ORDERER_CA: &str = "orderer-ca.pem";

/// [`LedgerGateway`] that drives the `peer` CLI inside each org's peer
/// container with `docker exec`, using the org's MSP environment.
///
/// Files travel in and out of the containers with `docker cp`. Anchor peers
/// are read by decoding the channel config block with `configtxlator` in a
/// throwaway `fabric-tools` container.
pub struct PeerCliGateway {
    topology: Arc<TopologyConfig>,
    runner: Arc<dyn CommandRunner>,
}

impl PeerCliGateway {
    /// Construct a gateway for the topology
    pub fn new(topology: Arc<TopologyConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { topology, runner }
    }

    fn docker(&self) -> Invocation {
        Invocation::new(self.topology.docker.docker.clone())
    }

    fn in_workdir(&self, file: &str) -> String {
        format!("{}/{}", self.topology.docker.peer_workdir, file)
    }

    /// Orderer TLS CA on the host.
    fn orderer_ca(&self) -> GatewayResult<PathBuf> {
        if let Some(path) = &self.topology.orderer.tls_ca_file {
            return Ok(path.clone());
        }
        let orderer = &self.topology.orderer;
        let dir = self
            .topology
            .organizations_dir()
            .join("ordererOrganizations")
            .join(&orderer.domain)
            .join("orderers")
            .join(&orderer.host)
            .join("msp")
            .join("tlscacerts");
        let mut pems: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| p.extension().map(|e| e == "pem").unwrap_or(false))
                    .collect()
            })
            .unwrap_or_default();
        pems.sort();
        pems.into_iter().next().ok_or_else(|| {
            GatewayError::Io(format!(
                "no orderer TLS CA (*.pem) in {}; regenerate crypto material",
                dir.display()
            ))
        })
    }

    async fn checked(&self, invocation: Invocation) -> GatewayResult<CommandOutput> {
        let line = invocation.display();
        let output = self.runner.run(invocation).await?;
        if output.success() {
            Ok(output)
        } else {
            tracing::debug!(cmd = %line, stderr = %output.stderr.trim(), "command failed");
            Err(classify(&output.stderr))
        }
    }

    async fn copy_in(&self, peer: &PeerNode, bytes: &[u8], name: &str) -> GatewayResult<()> {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        self.checked(
            self.docker()
                .arg("cp")
                .arg(tmp.path().display().to_string())
                .arg(format!("{}:{}", peer.container, self.in_workdir(name))),
        )
        .await?;
        Ok(())
    }

    async fn copy_out(&self, peer: &PeerNode, name: &str) -> GatewayResult<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join(name);
        self.checked(
            self.docker()
                .arg("cp")
                .arg(format!("{}:{}", peer.container, self.in_workdir(name)))
                .arg(dest.display().to_string()),
        )
        .await?;
        Ok(std::fs::read(&dest)?)
    }

    async fn put_orderer_ca(&self, peer: &PeerNode) -> GatewayResult<()> {
        let bytes = std::fs::read(self.orderer_ca()?)?;
        self.copy_in(peer, &bytes, ORDERER_CA).await
    }

    fn orderer_args(&self) -> Vec<String> {
        let orderer = &self.topology.orderer;
        vec![
            "-o".to_string(),
            orderer.endpoint().to_string(),
            "--ordererTLSHostnameOverride".to_string(),
            orderer.host.clone(),
            "--tls".to_string(),
            "--cafile".to_string(),
            format!("./{}", ORDERER_CA),
        ]
    }

    /// `docker exec` the `peer` CLI as the org's admin on one of its peers
    fn peer_cli(&self, org: &Organization, peer: &PeerNode) -> Invocation {
        let docker = &self.topology.docker;
        self.docker()
            .arg("exec")
            .args([
                "-e".to_string(),
                format!("CORE_PEER_LOCALMSPID={}", org.msp_id),
                "-e".to_string(),
                "CORE_PEER_TLS_ENABLED=true".to_string(),
                "-e".to_string(),
                format!("CORE_PEER_ADDRESS={}", peer.endpoint()),
                "-e".to_string(),
                format!("CORE_PEER_TLS_ROOTCERT_FILE={}", docker.peer_tls_root_cert),
                "-e".to_string(),
                format!("CORE_PEER_MSPCONFIGPATH={}", docker.peer_msp_path),
                "-w".to_string(),
                docker.peer_workdir.clone(),
            ])
            .arg(peer.container.clone())
            .arg("peer")
    }

    fn lead_peer<'o>(&self, org: &'o Organization) -> GatewayResult<&'o PeerNode> {
        org.lead_peer()
            .ok_or_else(|| GatewayError::Io(format!("organization {} has no peers", org.id)))
    }

    async fn fetch_block(
        &self,
        org: &Organization,
        which: &str,
        channel: &str,
        file: &str,
    ) -> GatewayResult<Vec<u8>> {
        let peer = self.lead_peer(org)?;
        self.put_orderer_ca(peer).await?;
        self.checked(
            self.peer_cli(org, peer)
                .args(["channel", "fetch", which, &*format!("./{}", file), "-c", channel])
                .args(self.orderer_args()),
        )
        .await?;
        self.copy_out(peer, file).await
    }
}

#[async_trait::async_trait]
impl LedgerGateway for PeerCliGateway {
    async fn ping_orderer(&self, org: &Organization) -> GatewayResult<()> {
        let system = self.topology.orderer.system_channel.clone();
        match self
            .fetch_block(org, "0", &system, "system-ping.block")
            .await
        {
            // an orderer without a system channel answering NOT_FOUND is up
            Ok(_) | Err(GatewayError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn channel_exists(&self, org: &Organization, channel: &str) -> GatewayResult<bool> {
        match self
            .fetch_block(org, "0", channel, &format!("{}.exists.block", channel))
            .await
        {
            Ok(_) => Ok(true),
            Err(GatewayError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_channel(
        &self,
        org: &Organization,
        channel: &str,
        creation_tx: &[u8],
    ) -> GatewayResult<Vec<u8>> {
        let peer = self.lead_peer(org)?;
        let tx = format!("{}.tx", channel);
        let block = format!("{}.block", channel);
        self.copy_in(peer, creation_tx, &tx).await?;
        self.put_orderer_ca(peer).await?;
        self.checked(
            self.peer_cli(org, peer)
                .args(["channel", "create", "-c", channel])
                .args(["-f".to_string(), format!("./{}", tx)])
                .args(["--outputBlock".to_string(), format!("./{}", block)])
                .args(self.orderer_args()),
        )
        .await?;
        self.copy_out(peer, &block).await
    }

    async fn fetch_genesis_block(
        &self,
        org: &Organization,
        channel: &str,
    ) -> GatewayResult<Vec<u8>> {
        self.fetch_block(org, "0", channel, &format!("{}.block", channel))
            .await
    }

    async fn joined_channels(
        &self,
        org: &Organization,
        peer: &PeerNode,
    ) -> GatewayResult<Vec<String>> {
        let out = self
            .checked(self.peer_cli(org, peer).args(["channel", "list"]))
            .await?;
        Ok(parse_joined_channels(&out.stdout_str()))
    }

    async fn join_channel(
        &self,
        org: &Organization,
        peer: &PeerNode,
        genesis_block: &[u8],
    ) -> GatewayResult<()> {
        let file = "join.block";
        self.copy_in(peer, genesis_block, file).await?;
        self.checked(
            self.peer_cli(org, peer)
                .args(["channel", "join", "-b"])
                .arg(format!("./{}", file)),
        )
        .await?;
        Ok(())
    }

    async fn channel_height(
        &self,
        org: &Organization,
        peer: &PeerNode,
        channel: &str,
    ) -> GatewayResult<u64> {
        let out = self
            .checked(
                self.peer_cli(org, peer)
                    .args(["channel", "getinfo", "-c", channel]),
            )
            .await?;
        parse_height(&out.stdout_str())
    }

    async fn anchor_peers(
        &self,
        org: &Organization,
        channel: &str,
    ) -> GatewayResult<Vec<Endpoint>> {
        let block = self
            .fetch_block(org, "config", channel, &format!("{}.config.block", channel))
            .await?;
        let out = self
            .checked(
                self.docker()
                    .args(["run", "--rm", "-i"])
                    .arg(self.topology.docker.tools_image.clone())
                    .args([
                        "configtxlator",
                        "proto_decode",
                        "--type",
                        "common.Block",
                        "--input",
                        "/dev/stdin",
                    ])
                    .stdin(block),
            )
            .await?;
        parse_anchor_peers(&out.stdout, org.msp_id.as_str())
    }

    async fn update_anchor_peers(
        &self,
        org: &Organization,
        channel: &str,
        update_tx: &[u8],
    ) -> GatewayResult<()> {
        let peer = self.lead_peer(org)?;
        let file = format!("{}anchors.tx", org.msp_id);
        self.copy_in(peer, update_tx, &file).await?;
        self.put_orderer_ca(peer).await?;
        self.checked(
            self.peer_cli(org, peer)
                .args(["channel", "update", "-c", channel])
                .args(["-f".to_string(), format!("./{}", file)])
                .args(self.orderer_args()),
        )
        .await?;
        Ok(())
    }

    async fn query_installed(
        &self,
        org: &Organization,
        peer: &PeerNode,
    ) -> GatewayResult<Vec<InstalledPackage>> {
        let out = self
            .checked(
                self.peer_cli(org, peer)
                    .args(["lifecycle", "chaincode", "queryinstalled", "-O", "json"]),
            )
            .await?;
        parse_installed(&out.stdout)
    }

    async fn install(
        &self,
        org: &Organization,
        peer: &PeerNode,
        package: &[u8],
    ) -> GatewayResult<PackageId> {
        let file = "chaincode.tar.gz";
        self.copy_in(peer, package, file).await?;
        let out = self
            .checked(
                self.peer_cli(org, peer)
                    .args(["lifecycle", "chaincode", "install"])
                    .arg(format!("./{}", file)),
            )
            .await?;
        parse_package_id(&out.combined()).ok_or_else(|| {
            GatewayError::Rejected("install did not report a package identifier".into())
        })
    }

    async fn query_approved(
        &self,
        org: &Organization,
        definition: &ChaincodeDefinition,
    ) -> GatewayResult<Option<ApprovedDefinition>> {
        let peer = self.lead_peer(org)?;
        let out = self
            .checked(
                self.peer_cli(org, peer)
                    .args(["lifecycle", "chaincode", "queryapproved"])
                    .args(["--channelID", definition.channel.as_str()])
                    .args(["--name", definition.name.as_str()])
                    .args(["--sequence".to_string(), definition.sequence.to_string()])
                    .args(["-O", "json"]),
            )
            .await;
        match out {
            Ok(out) => parse_approved(&out.stdout).map(Some),
            Err(GatewayError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn approve(
        &self,
        org: &Organization,
        definition: &ChaincodeDefinition,
        package_id: &PackageId,
    ) -> GatewayResult<()> {
        let peer = self.lead_peer(org)?;
        self.put_orderer_ca(peer).await?;
        self.checked(
            self.peer_cli(org, peer)
                .args(["lifecycle", "chaincode", "approveformyorg"])
                .args(["--channelID", definition.channel.as_str()])
                .args(["--name", definition.name.as_str()])
                .args(["--version", definition.version.as_str()])
                .args(["--package-id", package_id.as_str()])
                .args(["--sequence".to_string(), definition.sequence.to_string()])
                .args(self.orderer_args()),
        )
        .await?;
        Ok(())
    }

    async fn query_committed(
        &self,
        org: &Organization,
        channel: &str,
        name: &str,
    ) -> GatewayResult<Option<CommittedDefinition>> {
        let peer = self.lead_peer(org)?;
        let out = self
            .checked(
                self.peer_cli(org, peer)
                    .args(["lifecycle", "chaincode", "querycommitted"])
                    .args(["--channelID", channel, "--name", name, "-O", "json"]),
            )
            .await;
        match out {
            Ok(out) => parse_committed(&out.stdout).map(Some),
            Err(GatewayError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn commit(
        &self,
        org: &Organization,
        definition: &ChaincodeDefinition,
        endorsers: &[Organization],
    ) -> GatewayResult<()> {
        let peer = self.lead_peer(org)?;
        self.put_orderer_ca(peer).await?;
        let mut cli = self
            .peer_cli(org, peer)
            .args(["lifecycle", "chaincode", "commit"])
            .args(["--channelID", definition.channel.as_str()])
            .args(["--name", definition.name.as_str()])
            .args(["--version", definition.version.as_str()])
            .args(["--sequence".to_string(), definition.sequence.to_string()])
            .args(self.orderer_args());
        for endorser in endorsers {
            let p = self.lead_peer(endorser)?;
            cli = cli
                .args(["--peerAddresses".to_string(), p.endpoint().to_string()])
                .args(["--tlsRootCertFiles".to_string(), p.tls_root_cert.clone()]);
        }
        self.checked(cli).await?;
        Ok(())
    }
}

/// Map `peer` CLI / docker stderr onto gateway error kinds.
pub(crate) fn classify(stderr: &str) -> GatewayError {
    let message = stderr
        .lines()
        .rev()
        .find(|l| l.contains("Error"))
        .unwrap_or_else(|| stderr.trim())
        .trim()
        .to_string();
    let lower = stderr.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if any(&[
        "access denied",
        "permission denied",
        "creator org unknown",
        "signature set did not satisfy policy",
        "implicit policy evaluation failed",
        "forbidden",
    ]) {
        GatewayError::PermissionDenied(message)
    } else if any(&[
        "connection refused",
        "context deadline exceeded",
        "failed to create new connection",
        "service_unavailable",
        "unavailable",
        "no such container",
        "is not running",
        "cannot connect to the docker daemon",
    ]) {
        GatewayError::Unavailable(message)
    } else if any(&[
        "not_found",
        "could not fetch approved",
        "is not defined",
        "does not exist",
    ]) {
        GatewayError::NotFound(message)
    } else {
        GatewayError::Rejected(message)
    }
}

pub(crate) fn parse_joined_channels(stdout: &str) -> Vec<String> {
    let mut lines = stdout.lines().map(str::trim);
    let header = stdout.contains("Channels peers has joined");
    if header {
        for line in lines.by_ref() {
            if line.starts_with("Channels peers has joined") {
                break;
            }
        }
    }
    lines
        .filter(|l| !l.is_empty() && !l.contains(' '))
        .map(str::to_string)
        .collect()
}

pub(crate) fn parse_height(stdout: &str) -> GatewayResult<u64> {
    #[derive(serde::Deserialize)]
    struct Info {
        height: u64,
    }
    let json = stdout
        .split_once("Blockchain info:")
        .map(|(_, rest)| rest)
        .unwrap_or(stdout)
        .trim();
    serde_json::from_str::<Info>(json)
        .map(|i| i.height)
        .map_err(|e| GatewayError::Rejected(format!("unreadable channel info: {}", e)))
}

pub(crate) fn parse_installed(stdout: &[u8]) -> GatewayResult<Vec<InstalledPackage>> {
    #[derive(serde::Deserialize)]
    struct Installed {
        #[serde(default)]
        installed_chaincodes: Vec<InstalledPackage>,
    }
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice::<Installed>(stdout)
        .map(|i| i.installed_chaincodes)
        .map_err(|e| GatewayError::Rejected(format!("unreadable installed chaincodes: {}", e)))
}

pub(crate) fn parse_approved(stdout: &[u8]) -> GatewayResult<ApprovedDefinition> {
    let v: serde_json::Value = serde_json::from_slice(stdout)
        .map_err(|e| GatewayError::Rejected(format!("unreadable approval: {}", e)))?;
    let sequence = v["sequence"]
        .as_u64()
        .ok_or_else(|| GatewayError::Rejected("approval without a sequence".into()))?;
    let version = v["version"].as_str().unwrap_or_default().to_string();
    let package_id = v["source"]["Type"]["LocalPackage"]["package_id"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(PackageId::new);
    Ok(ApprovedDefinition {
        version,
        sequence,
        package_id,
    })
}

pub(crate) fn parse_committed(stdout: &[u8]) -> GatewayResult<CommittedDefinition> {
    serde_json::from_slice(stdout)
        .map_err(|e| GatewayError::Rejected(format!("unreadable committed definition: {}", e)))
}

pub(crate) fn parse_package_id(output: &str) -> Option<PackageId> {
    const MARKER: &str = "Chaincode code package identifier:";
    output
        .lines()
        .find_map(|l| l.split_once(MARKER).map(|(_, id)| id.trim()))
        .filter(|id| !id.is_empty())
        .map(PackageId::new)
}

pub(crate) fn parse_anchor_peers(block_json: &[u8], msp: &str) -> GatewayResult<Vec<Endpoint>> {
    let v: serde_json::Value = serde_json::from_slice(block_json)
        .map_err(|e| GatewayError::Rejected(format!("unreadable config block: {}", e)))?;
    let org = &v["data"]["data"][0]["payload"]["data"]["config"]["channel_group"]["groups"]
        ["Application"]["groups"][msp];
    if org.is_null() {
        return Err(GatewayError::NotFound(format!(
            "{} is not a member of the channel",
            msp
        )));
    }
    let anchors = match org["values"]["AnchorPeers"]["value"]["anchor_peers"].as_array() {
        Some(anchors) => anchors,
        None => return Ok(Vec::new()),
    };
    anchors
        .iter()
        .map(|a| {
            let host = a["host"].as_str();
            let port = a["port"].as_u64().and_then(|p| u16::try_from(p).ok());
            match (host, port) {
                (Some(host), Some(port)) => Ok(Endpoint::new(host, port)),
                _ => Err(GatewayError::Rejected(format!("bad anchor peer entry {}", a))),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MockCommandRunner;
    use matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn classify_sorts_cli_failures() {
        assert_matches!(
            classify("Error: failed to create deliver client for orderer: orderer client failed to connect to orderer.example.com:7050: failed to create new connection: connection error: desc = \"transport: error while dialing: dial tcp 172.18.0.2:7050: connect: connection refused\""),
            GatewayError::Unavailable(_)
        );
        assert_matches!(
            classify("Error response from daemon: Container abc is not running"),
            GatewayError::Unavailable(_)
        );
        assert_matches!(
            classify("Error: got unexpected status: FORBIDDEN -- config update for existing channel did not pass initial checks: implicit policy evaluation failed"),
            GatewayError::PermissionDenied(_)
        );
        assert_matches!(
            classify("Error: can't read the block: &{NOT_FOUND}"),
            GatewayError::NotFound(_)
        );
        assert_matches!(
            classify("Error: query failed with status: 500 - failed to invoke backing implementation of 'QueryApprovedChaincodeDefinition': could not fetch approved chaincode definition (name: 'taskdocument', sequence: '1') on channel 'npa-channel'"),
            GatewayError::NotFound(_)
        );
        assert_matches!(
            classify("Error: query failed with status: 404 - namespace taskdocument is not defined"),
            GatewayError::NotFound(_)
        );
        assert_matches!(
            classify("Error: proposal failed with status: 500 - failed to invoke backing implementation of 'CommitChaincodeDefinition': requested sequence is 1, but new definition must be sequence 2"),
            GatewayError::Rejected(_)
        );
    }

    #[test]
    fn classify_keeps_the_error_line() {
        let e = classify("2024-01-01 INFO noise\nError: bad things\n");
        assert_eq!(e, GatewayError::Rejected("Error: bad things".into()));
    }

    #[test]
    fn parses_channel_list() {
        let out = "Channels peers has joined: \nnpa-channel\nother\n";
        assert_eq!(parse_joined_channels(out), vec!["npa-channel", "other"]);
        assert!(parse_joined_channels("Channels peers has joined: \n").is_empty());
    }

    #[test]
    fn parses_channel_height() {
        let out = r#"Blockchain info: {"height":3,"currentBlockHash":"abc","previousBlockHash":"def"}"#;
        assert_eq!(parse_height(out).unwrap(), 3);
        assert!(parse_height("garbage").is_err());
    }

    #[test]
    fn parses_installed_packages() {
        let out = br#"{"installed_chaincodes":[{"package_id":"taskdocument_1.0:abc","label":"taskdocument_1.0","references":{}}]}"#;
        let installed = parse_installed(out).unwrap();
        assert_eq!(installed[0].package_id, PackageId::new("taskdocument_1.0:abc"));
        assert!(parse_installed(b"{}").unwrap().is_empty());
        assert!(parse_installed(b"\n").unwrap().is_empty());
    }

    #[test]
    fn parses_approved_definition() {
        let out = br#"{"sequence":1,"version":"1.0","endorsement_plugin":"escc","validation_plugin":"vscc","validation_parameter":"","collections":{},"init_required":false,"source":{"Type":{"LocalPackage":{"package_id":"taskdocument_1.0:abc"}}}}"#;
        let approved = parse_approved(out).unwrap();
        assert_eq!(approved.sequence, 1);
        assert_eq!(approved.package_id, Some(PackageId::new("taskdocument_1.0:abc")));

        let unavailable = br#"{"sequence":2,"version":"2.0","source":{"Type":{"Unavailable":{}}}}"#;
        assert_eq!(parse_approved(unavailable).unwrap().package_id, None);
    }

    #[test]
    fn parses_install_output() {
        let out = "2024 INFO [cli.lifecycle.chaincode] submitInstallProposal -> Installed remotely: response:<status:200 >\n2024 INFO [cli.lifecycle.chaincode] submitInstallProposal -> Chaincode code package identifier: taskdocument_1.0:9f86d0\n";
        assert_eq!(
            parse_package_id(out),
            Some(PackageId::new("taskdocument_1.0:9f86d0"))
        );
        assert_eq!(parse_package_id("nothing here"), None);
    }

    #[test]
    fn parses_anchor_peers_from_config_block() {
        let block = serde_json::json!({
            "data": {"data": [{"payload": {"data": {"config": {"channel_group": {"groups": {
                "Application": {"groups": {
                    "Org1MSP": {"values": {"AnchorPeers": {"value": {"anchor_peers": [
                        {"host": "peer0.org1.example.com", "port": 7051}
                    ]}}}},
                    "Org2MSP": {"values": {}}
                }}
            }}}}}}]}
        });
        let bytes = serde_json::to_vec(&block).unwrap();
        assert_eq!(
            parse_anchor_peers(&bytes, "Org1MSP").unwrap(),
            vec![Endpoint::new("peer0.org1.example.com", 7051)]
        );
        assert!(parse_anchor_peers(&bytes, "Org2MSP").unwrap().is_empty());
        assert_matches!(
            parse_anchor_peers(&bytes, "Org3MSP"),
            Err(GatewayError::NotFound(_))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn joined_channels_runs_peer_channel_list_with_org_env() {
        let topology = Arc::new(TopologyConfig::two_org_default());
        let org = topology.organizations[1].clone();
        let peer = org.peers[0].clone();

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|inv: &Invocation| {
                inv.program == "docker"
                    && inv.args.contains(&"CORE_PEER_LOCALMSPID=Org2MSP".to_string())
                    && inv
                        .args
                        .contains(&"CORE_PEER_ADDRESS=peer0.org2.example.com:9051".to_string())
                    && inv.args.ends_with(&[
                        "peer0.org2.example.com".to_string(),
                        "peer".to_string(),
                        "channel".to_string(),
                        "list".to_string(),
                    ])
            })
            .times(1)
            .returning(|_| {
                Ok(CommandOutput::ok(
                    "Channels peers has joined: \nnpa-channel\n",
                ))
            });

        let gateway = PeerCliGateway::new(topology, Arc::new(runner));
        assert_eq!(
            gateway.joined_channels(&org, &peer).await.unwrap(),
            vec!["npa-channel".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn query_committed_maps_undefined_namespace_to_none() {
        let topology = Arc::new(TopologyConfig::two_org_default());
        let org = topology.organizations[0].clone();

        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|_| {
            Ok(CommandOutput::failed(
                1,
                "Error: query failed with status: 404 - namespace taskdocument is not defined",
            ))
        });

        let gateway = PeerCliGateway::new(topology, Arc::new(runner));
        assert_eq!(
            gateway
                .query_committed(&org, "npa-channel", "taskdocument")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_orderer_ca_is_reported_before_running_anything() {
        let dir = tempfile::tempdir().unwrap();
        let mut topology = TopologyConfig::two_org_default();
        topology.base_dir = dir.path().to_path_buf();
        let org = topology.organizations[0].clone();

        // no expectations: any docker call would panic
        let runner = MockCommandRunner::new();
        let gateway = PeerCliGateway::new(Arc::new(topology), Arc::new(runner));
        let err = gateway.ping_orderer(&org).await.unwrap_err();
        assert_matches!(err, GatewayError::Io(ref m) if m.contains("tlscacerts"));
    }
}
