#![warn(missing_docs)]

//! A library and CLI to set up channels and deploy chaincode on a
//! multi-org Hyperledger Fabric network.
//!
//! ## CLI
//! The `fabric-orch` CLI drives the network described by a topology file
//! (`fabric-topology.yaml` in the current directory by default, the built-in
//! two-org network when there is none).
//! Every command checks the ledger before acting, so any of them can be run
//! again after an interruption.
//! ### Common usage
//! ```shell
//! fabric-orch materials generate
//! fabric-orch network start
//! fabric-orch channel setup
//! fabric-orch chaincode deploy
//! fabric-orch chaincode activation --json
//! ```
//! After wiping the network volumes with `network clean` the channel has to be
//! created again:
//! ```shell
//! fabric-orch channel setup --force-recreate
//! ```
//! ### Exit codes
//! - `0` success
//! - `1` something was not ready yet, running the command again may succeed
//! - `2` an operator has to act first, e.g. on a definition conflict or a stale
//!   sequence
//!
//! ## Library
//! [`Services`] bundles the gateway, artifacts and state behind the commands,
//! so other tools can reuse the same wiring.

use clap::Parser;
use fabric_orchestrator::config::TopologyConfig;
use fabric_orchestrator::deploy::DeployStage;
use fabric_orchestrator::error::{ErrorKind, FlowError, OrchestratorError};
use fabric_orchestrator::network::NetworkError;
use fabric_orchestrator::store::StoreError;
use fabric_orchestrator::types::ChannelStatus;
use std::path::{Path, PathBuf};

/// Print a user facing progress line.
#[macro_export]
macro_rules! msg {
    ($($arg:tt)*) => ({
        use ansi_term::Color::*;
        print!("{} ", Blue.bold().paint("fabric-orch:"));
        println!($($arg)*);
    })
}

pub mod cmds;
mod services;

pub use services::Services;

/// Topology file looked up in the current directory when `--config` is not given.
pub const DEFAULT_TOPOLOGY_FILE: &str = "fabric-topology.yaml";

#[derive(Debug, Parser)]
#[command(name = "fabric-orch", version, about)]
/// Set up channels and deploy chaincode on a Fabric network.
///
/// Every command reads the live ledger first and only submits what is
/// missing, so re-running a command is always safe.
pub struct FabricOrch {
    /// Topology file describing orderer, organizations and chaincode.
    /// Defaults to `fabric-topology.yaml` in the current directory, or the
    /// built-in two-org network when that file does not exist.
    #[arg(short, long, env = "FABRIC_ORCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding approvals, commit records and deploy checkpoints.
    #[arg(long, env = "FABRIC_ORCH_STATE_DIR", default_value = ".fabric-orch")]
    pub state_dir: PathBuf,

    /// Output structured log messages (only when RUST_LOG is set).
    /// Log, Compact, Json, JsonTimed, LogTimed or None.
    #[arg(long, default_value = "Log")]
    pub structured: fabric_trace::Output,

    /// The command to run
    #[command(subcommand)]
    pub command: cmds::Command,
}

impl FabricOrch {
    /// Load the topology this invocation works on.
    pub fn topology(&self) -> anyhow::Result<TopologyConfig> {
        load_topology(self.config.as_deref(), Path::new(DEFAULT_TOPOLOGY_FILE))
    }

    /// Run this command
    pub async fn run(self) -> anyhow::Result<()> {
        let topology = self.topology()?;
        let services = Services::connect(topology, &self.state_dir)?;
        self.command.run(&services).await
    }
}

/// An explicit path must exist; the default file is optional.
pub fn load_topology(explicit: Option<&Path>, default: &Path) -> anyhow::Result<TopologyConfig> {
    let topology = match explicit {
        Some(path) => TopologyConfig::load_yaml(path).map_err(OrchestratorError::from)?,
        None if default.is_file() => {
            TopologyConfig::load_yaml(default).map_err(OrchestratorError::from)?
        }
        None => {
            tracing::info!("no topology file, using the built-in two-org network");
            let topology = TopologyConfig::two_org_default();
            topology.validate().map_err(OrchestratorError::from)?;
            topology
        }
    };
    Ok(topology)
}

/// How the error that ended a command should be treated.
pub fn error_kind(err: &anyhow::Error) -> ErrorKind {
    if let Some(e) = err.downcast_ref::<OrchestratorError>() {
        e.kind()
    } else if let Some(e) = err.downcast_ref::<FlowError<ChannelStatus>>() {
        e.kind()
    } else if let Some(e) = err.downcast_ref::<FlowError<DeployStage>>() {
        e.kind()
    } else if let Some(e) = err.downcast_ref::<NetworkError>() {
        e.kind()
    } else if let Some(e) = err.downcast_ref::<StoreError>() {
        e.kind()
    } else {
        ErrorKind::Structural
    }
}

/// Process exit code for the error that ended a command.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    error_kind(err).exit_code()
}
