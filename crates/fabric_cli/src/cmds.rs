//! The command surface of `fabric-orch`.

use crate::msg;
use crate::Services;
use clap::{Args, Subcommand};
use fabric_orchestrator::channel::{ChannelOrchestrator, StepOutcome};
use fabric_orchestrator::deploy::{ActivationContract, DeployRequest};
use fabric_orchestrator::error::{CallContext, Operation, OrchestratorError};
use fabric_orchestrator::materials::MaterialsGenerator;
use fabric_orchestrator::network::NetworkLifecycle;
use fabric_orchestrator::types::{ChaincodeDefinition, ChannelState, ChannelStatus, OrgId};
use futures::StreamExt;
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

/// Top level commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the channel, join peers and set anchor peers
    #[command(subcommand)]
    Channel(ChannelCmd),
    /// Package, install, approve and commit chaincode
    #[command(subcommand)]
    Chaincode(ChaincodeCmd),
    /// Start, stop and inspect the network containers
    #[command(subcommand)]
    Network(NetworkCmd),
    /// Generate crypto material and channel artifacts
    #[command(subcommand)]
    Materials(MaterialsCmd),
}

impl Command {
    /// Run this command
    pub async fn run(&self, services: &Services) -> anyhow::Result<()> {
        match self {
            Command::Channel(cmd) => cmd.run(services).await,
            Command::Chaincode(cmd) => cmd.run(services).await,
            Command::Network(cmd) => cmd.run(services).await,
            Command::Materials(cmd) => cmd.run(services).await,
        }
    }
}

/// Which channel and which orgs a channel command applies to.
#[derive(Debug, Args, Clone, Default)]
pub struct ChannelTarget {
    /// Channel name. Defaults to the topology's channel.
    #[arg(long)]
    pub channel: Option<String>,

    /// Only this organization, e.g. `Org1`. Defaults to every organization.
    #[arg(long)]
    pub org: Option<String>,
}

impl ChannelTarget {
    fn channel<'a>(&'a self, services: &'a Services) -> &'a str {
        self.channel
            .as_deref()
            .unwrap_or(services.topology.channel.as_str())
    }

    fn orgs(&self, services: &Services) -> anyhow::Result<Vec<OrgId>> {
        match &self.org {
            Some(id) => {
                let org = services
                    .topology
                    .org(&OrgId::new(id.as_str()))
                    .map_err(OrchestratorError::from)?;
                Ok(vec![org.id.clone()])
            }
            None => Ok(services
                .topology
                .organizations
                .iter()
                .map(|o| o.id.clone())
                .collect()),
        }
    }
}

/// Arguments of the commands that may recreate the channel.
#[derive(Debug, Args, Clone, Default)]
pub struct EnsureArgs {
    #[command(flatten)]
    pub target: ChannelTarget,

    /// Drop the cached genesis block and create the channel again.
    /// Use after the network volumes were wiped.
    #[arg(long)]
    pub force_recreate: bool,
}

/// Channel commands.
#[derive(Debug, Subcommand)]
pub enum ChannelCmd {
    /// Create the channel unless the orderer already knows it
    Ensure(EnsureArgs),
    /// Join the peers of one or every organization
    Join(ChannelTarget),
    /// Set the anchor peers of one or every organization
    Anchor(ChannelTarget),
    /// Show what the ledger says about the channel
    Status(ChannelTarget),
    /// Drive the channel all the way to ready
    Setup(EnsureArgs),
}

impl ChannelCmd {
    /// Run this command
    pub async fn run(&self, services: &Services) -> anyhow::Result<()> {
        services.require_network().await?;
        let channels = services.channels();
        let policy = services.topology.call_policy();
        match self {
            ChannelCmd::Ensure(args) => {
                let channel = args.target.channel(services);
                channels
                    .wait_for_orderer_ready(policy.ready_timeout, &policy.backoff)
                    .await?;
                let state = if args.force_recreate {
                    channels.force_recreate_channel(channel).await?
                } else {
                    channels.ensure_channel_exists(channel).await?
                };
                msg!("channel {} is {}", state.name, state.status);
            }
            ChannelCmd::Join(target) => {
                let channel = target.channel(services);
                for org in target.orgs(services)? {
                    match channels.join_org(channel, &org).await? {
                        StepOutcome::Applied => msg!("{} joined {}", org, channel),
                        StepOutcome::AlreadyDone => msg!("{} had already joined {}", org, channel),
                    }
                }
            }
            ChannelCmd::Anchor(target) => {
                let channel = target.channel(services);
                for org in target.orgs(services)? {
                    match channels.update_anchor_peers(channel, &org).await? {
                        StepOutcome::Applied => msg!("anchor peers of {} updated", org),
                        StepOutcome::AlreadyDone => msg!("anchor peers of {} already set", org),
                    }
                }
            }
            ChannelCmd::Status(target) => {
                let channel = target.channel(services);
                let state = channels.status(channel).await?;
                print_channel(&state);
                report_stuck(&channels, &state).await?;
            }
            ChannelCmd::Setup(args) => {
                let channel = args.target.channel(services);
                if args.force_recreate {
                    channels
                        .wait_for_orderer_ready(policy.ready_timeout, &policy.backoff)
                        .await?;
                    channels.force_recreate_channel(channel).await?;
                }
                let state = channels.ensure_ready(channel).await?;
                print_channel(&state);
                report_stuck(&channels, &state).await?;
            }
        }
        Ok(())
    }
}

fn print_channel(state: &ChannelState) {
    msg!("channel {} is {}", state.name, state.status);
    for (org, peers) in &state.joined {
        for peer in peers {
            let height = state.heights.get(peer).copied().unwrap_or_default();
            msg!("  {} {} height {}", org, peer, height);
        }
    }
    if !state.anchored.is_empty() {
        let anchored: Vec<&str> = state.anchored.iter().map(|o| o.as_str()).collect();
        msg!("  anchors set for {}", anchored.join(", "));
    }
}

async fn report_stuck(channels: &ChannelOrchestrator, state: &ChannelState) -> anyhow::Result<()> {
    if state.status == ChannelStatus::Absent {
        return Ok(());
    }
    for stuck in channels.detect_stuck(&state.name).await? {
        msg!(
            "{} of {} is stuck at height {}; recreate the channel with --force-recreate",
            stuck.peer,
            stuck.org,
            stuck.height
        );
    }
    Ok(())
}

/// Which chaincode a chaincode command applies to.
#[derive(Debug, Args, Clone, Default)]
pub struct ChaincodeTarget {
    /// Channel name. Defaults to the topology's channel.
    #[arg(long)]
    pub channel: Option<String>,

    /// Chaincode name. Defaults to the topology's chaincode.
    #[arg(long)]
    pub name: Option<String>,
}

/// Arguments of `chaincode deploy`. Anything not given comes from the topology.
#[derive(Debug, Args, Clone, Default)]
pub struct DeployArgs {
    #[command(flatten)]
    pub target: ChaincodeTarget,

    /// Version label of the definition
    #[arg(long)]
    pub version: Option<String>,

    /// Lifecycle sequence; must be above the committed one
    #[arg(long)]
    pub sequence: Option<u64>,

    /// Address the peers dial the chaincode service on, e.g. `chaincode-rest:9999`
    #[arg(long)]
    pub address: Option<String>,

    /// Package label. Defaults to `<name>_<version>`.
    #[arg(long)]
    pub label: Option<String>,
}

impl DeployArgs {
    /// The request these arguments describe on top of the topology defaults
    pub fn request(&self, services: &Services) -> DeployRequest {
        let mut request = DeployRequest::from_config(&services.topology);
        let renamed = self.target.name.is_some() || self.version.is_some();
        if let Some(channel) = &self.target.channel {
            request.definition.channel = channel.clone();
        }
        if let Some(name) = &self.target.name {
            request.definition.name = name.clone();
        }
        if let Some(version) = &self.version {
            request.definition.version = version.clone();
        }
        if let Some(sequence) = self.sequence {
            request.definition.sequence = sequence;
        }
        if let Some(address) = &self.address {
            request.source.address = address.clone();
        }
        request.source.label = match &self.label {
            Some(label) => label.clone(),
            None if renamed => format!(
                "{}_{}",
                request.definition.name, request.definition.version
            ),
            None => request.source.label,
        };
        request
    }
}

/// Chaincode commands.
#[derive(Debug, Subcommand)]
pub enum ChaincodeCmd {
    /// Install, approve and commit a definition, resuming an interrupted deploy
    Deploy(DeployArgs),
    /// Show the committed definition and the progress of the next one
    Status {
        #[command(flatten)]
        target: ChaincodeTarget,

        /// Sequence to report on. Defaults to the topology's sequence.
        #[arg(long)]
        sequence: Option<u64>,
    },
    /// Print what the chaincode service needs to serve the committed definition
    Activation {
        #[command(flatten)]
        target: ChaincodeTarget,

        /// Print JSON instead of `KEY=value` lines
        #[arg(long)]
        json: bool,
    },
}

impl ChaincodeCmd {
    /// Run this command
    pub async fn run(&self, services: &Services) -> anyhow::Result<()> {
        match self {
            ChaincodeCmd::Deploy(args) => deploy(services, args.request(services)).await,
            ChaincodeCmd::Status { target, sequence } => {
                let cc = &services.topology.chaincode;
                let definition = ChaincodeDefinition::new(
                    target.channel.as_deref().unwrap_or(&services.topology.channel),
                    target.name.as_deref().unwrap_or(&cc.name),
                    cc.version.as_str(),
                    sequence.unwrap_or(cc.sequence),
                );
                chaincode_status(services, &definition).await
            }
            ChaincodeCmd::Activation { target, json } => {
                let channel = target
                    .channel
                    .as_deref()
                    .unwrap_or(&services.topology.channel);
                let name = target
                    .name
                    .as_deref()
                    .unwrap_or(&services.topology.chaincode.name);
                let contract = ActivationContract::latest(
                    services.store.as_ref(),
                    channel,
                    name,
                    &services.topology.chaincode.address,
                )
                .await?
                .ok_or_else(|| {
                    OrchestratorError::conflict(
                        CallContext::new(Operation::QueryCommitted).channel(channel),
                        format!("no committed definition of {} recorded; deploy it first", name),
                    )
                })?;
                if *json {
                    println!("{}", serde_json::to_string_pretty(&contract)?);
                } else {
                    print!("{}", contract.env_lines());
                }
                Ok(())
            }
        }
    }
}

async fn deploy(services: &Services, request: DeployRequest) -> anyhow::Result<()> {
    services.require_network().await?;
    let channel = &request.definition.channel;
    let state = services.channels().status(channel).await?;
    if state.status < ChannelStatus::JoinedAll {
        return Err(OrchestratorError::conflict(
            CallContext::new(Operation::ListJoinedChannels).channel(channel),
            format!(
                "channel is {}; run `fabric-orch channel setup` first",
                state.status
            ),
        )
        .into());
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            msg!("interrupted, stopping before the next submission");
            on_interrupt.cancel();
        }
    });

    msg!("deploying {}", request.definition);
    let result = services.deploy_flow(cancel).run(&request).await;
    watcher.abort();
    let outcome = result?;

    if outcome.already_committed {
        msg!("{} was already committed", outcome.definition);
    } else {
        msg!(
            "committed {} with package {}",
            outcome.definition,
            outcome.package_id
        );
    }
    for (key, value) in outcome.contract.to_env() {
        msg!("  {}={}", key, value);
    }
    Ok(())
}

async fn chaincode_status(
    services: &Services,
    definition: &ChaincodeDefinition,
) -> anyhow::Result<()> {
    services.require_network().await?;
    let lifecycle = services.lifecycle();

    let committed = lifecycle
        .latest_committed(&definition.channel, &definition.name)
        .await?;
    match &committed {
        Some(c) => msg!("committed: {}", c),
        None => msg!("nothing committed for {} on {}", definition.name, definition.channel),
    }

    if let Some(checkpoint) = services.store.deploy_checkpoint(&definition.key()).await? {
        msg!(
            "deploy of {} reached {} at {}",
            checkpoint.definition,
            checkpoint.stage,
            checkpoint.updated_at
        );
        let join = |orgs: &BTreeSet<OrgId>| {
            orgs.iter().map(|o| o.as_str()).collect::<Vec<_>>().join(", ")
        };
        msg!("  installed on: {}", join(&checkpoint.installed));
        msg!("  approved by: {}", join(&checkpoint.approved));
    }

    if committed
        .as_ref()
        .map(|c| c.sequence >= definition.sequence)
        .unwrap_or(false)
    {
        return Ok(());
    }
    let readiness = lifecycle.check_commit_readiness(definition).await?;
    for approval in services.store.approvals(&definition.key()).await? {
        let package = approval
            .package_id
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        msg!(
            "  {} approved={} package {}",
            approval.org,
            approval.approved,
            package
        );
    }
    match readiness.agreed_package() {
        Some(package) => msg!("{} is ready to commit with {}", definition, package),
        None => {
            let missing: Vec<&str> = readiness.missing.iter().map(|o| o.as_str()).collect();
            msg!("{} waits on approval from {}", definition, missing.join(", "));
        }
    }
    Ok(())
}

/// Network commands.
#[derive(Debug, Subcommand)]
pub enum NetworkCmd {
    /// Start every container in the background
    Start,
    /// Stop and remove the containers, keeping volumes
    Stop,
    /// Stop the network and delete its volumes; every ledger is lost
    Clean,
    /// Show the state of every container
    Status,
    /// Print the last lines of the container logs
    Logs {
        /// Keep printing new lines until interrupted
        #[arg(short, long)]
        follow: bool,
    },
}

impl NetworkCmd {
    /// Run this command
    pub async fn run(&self, services: &Services) -> anyhow::Result<()> {
        let network = services.network();
        match self {
            NetworkCmd::Start => {
                network.start().await.map_err(OrchestratorError::from)?;
                msg!("network started");
            }
            NetworkCmd::Stop => {
                network.stop().await.map_err(OrchestratorError::from)?;
                msg!("network stopped");
            }
            NetworkCmd::Clean => {
                network.clean().await.map_err(OrchestratorError::from)?;
                msg!("network removed with its volumes; run `fabric-orch channel setup --force-recreate` after the next start");
            }
            NetworkCmd::Status => {
                let status = network.status().await.map_err(OrchestratorError::from)?;
                if status.is_empty() {
                    msg!("no containers");
                }
                for (service, state) in status {
                    msg!("{:<32} {}", service, state);
                }
            }
            NetworkCmd::Logs { follow } => {
                let mut lines = network.logs(*follow).await.map_err(OrchestratorError::from)?;
                loop {
                    tokio::select! {
                        line = lines.next() => match line {
                            Some(line) => println!("{}", line?),
                            None => break,
                        },
                        _ = tokio::signal::ctrl_c() => break,
                    }
                }
            }
        }
        Ok(())
    }
}

/// Material commands.
#[derive(Debug, Subcommand)]
pub enum MaterialsCmd {
    /// Generate whatever identities and channel artifacts are missing
    Generate {
        /// Channel to generate the creation transaction for.
        /// Defaults to the topology's channel.
        #[arg(long)]
        channel: Option<String>,
    },
    /// Delete every generated identity and artifact
    Reset {
        /// Required; nothing is deleted without it
        #[arg(long)]
        confirm: bool,
    },
}

impl MaterialsCmd {
    /// Run this command
    pub async fn run(&self, services: &Services) -> anyhow::Result<()> {
        let generator = services.materials();
        match self {
            MaterialsCmd::Generate { channel } => {
                let channel = channel.as_deref().unwrap_or(&services.topology.channel);
                let report = generator
                    .generate(channel)
                    .await
                    .map_err(OrchestratorError::from)?;
                for name in &report.generated {
                    msg!("generated {}", name);
                }
                for name in &report.skipped {
                    msg!("kept existing {}", name);
                }
            }
            MaterialsCmd::Reset { confirm } => {
                let removed = generator
                    .reset(*confirm)
                    .await
                    .map_err(OrchestratorError::from)?;
                for path in removed {
                    msg!("removed {}", path.display());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FabricOrch;
    use clap::Parser;
    use matches::assert_matches;

    fn parse(args: &[&str]) -> Command {
        let mut argv = vec!["fabric-orch"];
        argv.extend_from_slice(args);
        FabricOrch::try_parse_from(argv).unwrap().command
    }

    #[test]
    fn channel_commands_parse() {
        assert_matches!(
            parse(&["channel", "join", "--org", "Org2"]),
            Command::Channel(ChannelCmd::Join(ChannelTarget { org: Some(org), channel: None })) if org == "Org2"
        );
        assert_matches!(
            parse(&["channel", "setup", "--channel", "other", "--force-recreate"]),
            Command::Channel(ChannelCmd::Setup(EnsureArgs { force_recreate: true, target: ChannelTarget { channel: Some(c), .. } })) if c == "other"
        );
        assert_matches!(
            parse(&["channel", "ensure"]),
            Command::Channel(ChannelCmd::Ensure(EnsureArgs { force_recreate: false, .. }))
        );
    }

    #[test]
    fn chaincode_commands_parse() {
        assert_matches!(
            parse(&["chaincode", "deploy", "--version", "1.1", "--sequence", "2"]),
            Command::Chaincode(ChaincodeCmd::Deploy(DeployArgs { sequence: Some(2), version: Some(v), .. })) if v == "1.1"
        );
        assert_matches!(
            parse(&["chaincode", "activation", "--json"]),
            Command::Chaincode(ChaincodeCmd::Activation { json: true, .. })
        );
        assert_matches!(
            parse(&["chaincode", "status", "--sequence", "3"]),
            Command::Chaincode(ChaincodeCmd::Status { sequence: Some(3), .. })
        );
    }

    #[test]
    fn network_and_material_commands_parse() {
        assert_matches!(
            parse(&["network", "logs", "--follow"]),
            Command::Network(NetworkCmd::Logs { follow: true })
        );
        assert_matches!(parse(&["network", "clean"]), Command::Network(NetworkCmd::Clean));
        assert_matches!(
            parse(&["materials", "reset", "--confirm"]),
            Command::Materials(MaterialsCmd::Reset { confirm: true })
        );
        assert_matches!(
            parse(&["materials", "generate"]),
            Command::Materials(MaterialsCmd::Generate { channel: None })
        );
    }

    #[test]
    fn a_sequence_must_be_a_number() {
        assert!(FabricOrch::try_parse_from([
            "fabric-orch",
            "chaincode",
            "deploy",
            "--sequence",
            "next"
        ])
        .is_err());
    }
}
