//! Error taxonomy shared by every orchestrator operation.

use crate::config::ConfigError;
use crate::materials::MaterialsError;
use crate::network::NetworkError;
use crate::package::PackageError;
use crate::store::StoreError;
use crate::types::{ChaincodeDefinition, OrgId, PackageId};
use derive_more::Display;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Failure of a single remote call, as classified by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The endpoint could not be reached or is not ready yet
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),
    /// The identity used is not allowed to perform the call
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The thing queried does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// The ledger refused the transaction
    #[error("rejected: {0}")]
    Rejected(String),
    /// Running the call failed locally
    #[error("io error: {0}")]
    Io(String),
}

impl GatewayError {
    /// Only unavailability is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Io(e.to_string())
    }
}

/// Gateway Result
pub type GatewayResult<T> = Result<T, GatewayError>;

/// The remote operations the orchestrators perform.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub enum Operation {
    #[display(fmt = "ping orderer")]
    PingOrderer,
    #[display(fmt = "check channel exists")]
    ChannelExists,
    #[display(fmt = "create channel")]
    CreateChannel,
    #[display(fmt = "fetch channel block")]
    FetchChannelBlock,
    #[display(fmt = "list joined channels")]
    ListJoinedChannels,
    #[display(fmt = "join channel")]
    JoinChannel,
    #[display(fmt = "query channel height")]
    ChannelHeight,
    #[display(fmt = "query anchor peers")]
    QueryAnchorPeers,
    #[display(fmt = "update anchor peers")]
    UpdateAnchorPeers,
    #[display(fmt = "query installed chaincode")]
    QueryInstalled,
    #[display(fmt = "install chaincode")]
    Install,
    #[display(fmt = "query approved definition")]
    QueryApproved,
    #[display(fmt = "approve definition")]
    Approve,
    #[display(fmt = "query committed definition")]
    QueryCommitted,
    #[display(fmt = "commit definition")]
    Commit,
}

/// Where a remote call was made: operation, organization and channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// The operation
    pub operation: Operation,
    /// Org whose identity made the call
    pub org: Option<OrgId>,
    /// Channel the call was about
    pub channel: Option<String>,
}

impl CallContext {
    /// Context with only the operation set
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            org: None,
            channel: None,
        }
    }

    /// Set the org
    pub fn org(mut self, org: &OrgId) -> Self {
        self.org = Some(org.clone());
        self
    }

    /// Set the channel
    pub fn channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation)?;
        match (&self.org, &self.channel) {
            (Some(org), Some(channel)) => write!(f, " [org {} on {}]", org, channel),
            (Some(org), None) => write!(f, " [org {}]", org),
            (None, Some(channel)) => write!(f, " [on {}]", channel),
            (None, None) => Ok(()),
        }
    }
}

/// How an error should be treated by whoever ran the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorKind {
    /// Retrying later may succeed
    Transient,
    /// Generated material is missing, regenerate it
    ArtifactMissing,
    /// The ledger or store is not in the state the operation needs
    Conflict,
    /// The caller's identity is not allowed to do this
    PermissionDenied,
    /// The operation was cancelled before submitting anything
    Cancelled,
    /// Bad configuration, bad input or a local failure
    Structural,
}

impl ErrorKind {
    /// Process exit code: 1 means retry advised, 2 means an operator has to act
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Transient | ErrorKind::Cancelled => 1,
            _ => 2,
        }
    }
}

/// Error type for every orchestrator operation.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Endpoint still unavailable once the retry budget was used up
    #[error("{context}: still unavailable after {attempts} attempt(s) over {elapsed:?}: {last}")]
    TransientUnavailable {
        /// Failing call
        context: CallContext,
        /// Attempts made
        attempts: u32,
        /// Time spent
        elapsed: Duration,
        /// Last failure seen
        last: String,
    },

    /// A generated artifact is not where it should be
    #[error("artifact '{name}' not found at {}; regenerate it with `fabric-orch materials generate`", path.display())]
    ArtifactMissing {
        /// Artifact name
        name: String,
        /// Where it was looked for
        path: PathBuf,
    },

    /// The ledger is not in a state the operation can proceed from
    #[error("{context}: state conflict: {reason}")]
    StateConflict {
        /// Call that found the conflict
        context: CallContext,
        /// What is wrong
        reason: String,
    },

    /// Required orgs approved the same definition with different packages
    #[error("definition conflict for {definition}: orgs approved different packages {approvals:?}")]
    DefinitionConflict {
        /// The definition
        definition: ChaincodeDefinition,
        /// Package approved by each org
        approvals: BTreeMap<OrgId, PackageId>,
    },

    /// A sequence at or below the committed one was requested
    #[error("stale sequence for {name} on {channel}: requested {requested} but {committed} is already committed; use a higher sequence")]
    StaleSequence {
        /// Channel
        channel: String,
        /// Chaincode name
        name: String,
        /// Requested sequence
        requested: u64,
        /// Highest committed sequence
        committed: u64,
    },

    /// Some required orgs have not approved yet
    #[error("{definition} cannot be committed yet: waiting on approval from {missing:?}")]
    CommitNotReady {
        /// The definition
        definition: ChaincodeDefinition,
        /// Orgs still to approve
        missing: BTreeSet<OrgId>,
    },

    /// Surfaced verbatim from the ledger
    #[error("{context}: permission denied: {message}")]
    PermissionDenied {
        /// Denied call
        context: CallContext,
        /// Ledger message
        message: String,
    },

    /// Cancellation was observed before a transaction was submitted
    #[error("cancelled before {context}")]
    Cancelled {
        /// Call that was not made
        context: CallContext,
    },

    /// A fatal gateway failure that fits no other variant
    #[error("{context}: {source}")]
    Gateway {
        /// Failing call
        context: CallContext,
        /// Gateway error
        #[source]
        source: GatewayError,
    },

    /// State repository failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Topology configuration problem
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Chaincode packaging failure
    #[error(transparent)]
    Package(#[from] PackageError),

    /// Container network failure
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Material generation failure
    #[error(transparent)]
    Materials(#[from] MaterialsError),
}

impl OrchestratorError {
    /// Classify a fatal or exhausted gateway failure.
    pub fn from_gateway(context: CallContext, error: GatewayError) -> Self {
        match error {
            GatewayError::PermissionDenied(message) => {
                OrchestratorError::PermissionDenied { context, message }
            }
            GatewayError::Unavailable(last) => OrchestratorError::TransientUnavailable {
                context,
                attempts: 1,
                elapsed: Duration::ZERO,
                last,
            },
            source => OrchestratorError::Gateway { context, source },
        }
    }

    /// How this error should be treated.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::TransientUnavailable { .. } => ErrorKind::Transient,
            OrchestratorError::ArtifactMissing { .. } => ErrorKind::ArtifactMissing,
            OrchestratorError::StateConflict { .. }
            | OrchestratorError::DefinitionConflict { .. }
            | OrchestratorError::StaleSequence { .. }
            | OrchestratorError::CommitNotReady { .. } => ErrorKind::Conflict,
            OrchestratorError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            OrchestratorError::Cancelled { .. } => ErrorKind::Cancelled,
            OrchestratorError::Gateway { source, .. } => match source {
                GatewayError::Unavailable(_) => ErrorKind::Transient,
                GatewayError::PermissionDenied(_) => ErrorKind::PermissionDenied,
                _ => ErrorKind::Structural,
            },
            OrchestratorError::Store(e) => e.kind(),
            OrchestratorError::Network(e) => e.kind(),
            OrchestratorError::Config(_)
            | OrchestratorError::Package(_)
            | OrchestratorError::Materials(_) => ErrorKind::Structural,
        }
    }

    /// Shorthand for a [`OrchestratorError::StateConflict`]
    pub fn conflict(context: CallContext, reason: impl Into<String>) -> Self {
        OrchestratorError::StateConflict {
            context,
            reason: reason.into(),
        }
    }
}

/// Orchestrator Result
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// A multi-step flow halted on a fatal error.
///
/// `reached` is the last state confirmed on the ledger before the failing step,
/// so the flow can be resumed from there.
#[derive(Debug, thiserror::Error)]
#[error("{step} failed after reaching {reached}: {source}")]
pub struct FlowError<S: fmt::Debug + fmt::Display> {
    /// Step that failed
    pub step: String,
    /// State reached before the failure
    pub reached: S,
    /// Underlying error
    #[source]
    pub source: OrchestratorError,
}

impl<S: fmt::Debug + fmt::Display> FlowError<S> {
    /// Construct a flow error
    pub fn new(step: impl Into<String>, reached: S, source: OrchestratorError) -> Self {
        Self {
            step: step.into(),
            reached,
            source,
        }
    }

    /// Kind of the underlying error
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelStatus;

    #[test]
    fn gateway_errors_are_classified() {
        let ctx = CallContext::new(Operation::Approve).org(&"Org1".into());
        assert_eq!(
            OrchestratorError::from_gateway(ctx.clone(), GatewayError::Unavailable("x".into()))
                .kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            OrchestratorError::from_gateway(
                ctx.clone(),
                GatewayError::PermissionDenied("x".into())
            )
            .kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            OrchestratorError::from_gateway(ctx, GatewayError::Rejected("x".into())).kind(),
            ErrorKind::Structural
        );
    }

    #[test]
    fn exit_codes_split_transient_from_structural() {
        assert_eq!(ErrorKind::Transient.exit_code(), 1);
        assert_eq!(ErrorKind::Cancelled.exit_code(), 1);
        assert_eq!(ErrorKind::Conflict.exit_code(), 2);
        assert_eq!(ErrorKind::ArtifactMissing.exit_code(), 2);
        assert_eq!(ErrorKind::PermissionDenied.exit_code(), 2);
    }

    #[test]
    fn context_display_names_org_and_channel() {
        let ctx = CallContext::new(Operation::JoinChannel)
            .org(&"Org2".into())
            .channel("npa-channel");
        assert_eq!(ctx.to_string(), "join channel [org Org2 on npa-channel]");
    }

    #[test]
    fn flow_error_reports_step_and_state() {
        let err = FlowError::new(
            "join Org2/peer0.org2.example.com",
            ChannelStatus::PartiallyJoined,
            OrchestratorError::conflict(CallContext::new(Operation::JoinChannel), "boom"),
        );
        let text = err.to_string();
        assert!(text.starts_with("join Org2/peer0.org2.example.com failed after reaching PartiallyJoined"));
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
