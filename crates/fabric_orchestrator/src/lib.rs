#![deny(missing_docs)]
//! Idempotent orchestration of a multi-organization Hyperledger Fabric network.
//!
//! Two orchestrators turn independent per-organization admin actions into one
//! consistent state on the ledger:
//!
//! - [`channel::ChannelOrchestrator`] drives a channel from `Absent` to `Ready`
//!   (create, join every peer, update every org's anchor peers).
//! - [`chaincode::ChaincodeLifecycleOrchestrator`] packages, installs, approves
//!   and commits a chaincode-as-a-service definition, and
//!   [`deploy::DeployFlow`] runs those steps as a resumable state machine.
//!
//! Every operation queries live ledger state before acting, so any of them can
//! be re-run after an interruption. All remote calls go through the
//! [`gateway::LedgerGateway`] trait; the production implementation drives the
//! `peer` CLI inside the peer containers.

pub mod artifacts;
pub mod chaincode;
pub mod channel;
pub mod config;
pub mod deploy;
pub mod error;
pub mod gateway;
pub mod materials;
pub mod network;
pub mod package;
pub mod poll;
pub mod process;
pub mod store;
pub mod types;

#[cfg(feature = "test_utils")]
pub mod test_utils;

/// Common imports for users of the orchestrators
pub mod prelude {
    pub use crate::artifacts::{ArtifactDir, ArtifactName, ArtifactSource};
    pub use crate::chaincode::ChaincodeLifecycleOrchestrator;
    pub use crate::channel::ChannelOrchestrator;
    pub use crate::config::TopologyConfig;
    pub use crate::deploy::{ActivationContract, DeployFlow, DeployRequest, DeployStage};
    pub use crate::error::{ErrorKind, FlowError, OrchestratorError, OrchestratorResult};
    pub use crate::gateway::LedgerGateway;
    pub use crate::package::{ChaincodePackage, DefinitionSource, PackageDescriptor};
    pub use crate::poll::{Backoff, CallPolicy};
    pub use crate::store::{FileStateRepository, MemoryStateRepository, StateRepository};
    pub use crate::types::*;
}
