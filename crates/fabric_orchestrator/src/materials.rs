//! Generating crypto material and channel artifacts with the Fabric tools.
//!
//! Generation only ever adds what is missing, starting with the tool inputs
//! and compose file, which are rendered from the topology. Identities that exist are never
//! regenerated, since that would orphan every certificate already handed out.
//! Wiping material is the separate [`MaterialsGenerator::reset`], which has to
//! be confirmed.

use crate::artifacts::ArtifactName;
use crate::config::TopologyConfig;
use crate::process::{CommandRunner, Invocation};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod inputs;

pub use inputs::{CHANNEL_PROFILE, GENESIS_PROFILE, ORDERER_MSP};

/// Errors generating material.
#[derive(Debug, thiserror::Error)]
pub enum MaterialsError {
    /// A tool input could not be rendered
    #[error("rendering tool input failed: {0}")]
    Render(#[from] serde_yaml::Error),

    /// A tool run failed
    #[error("{step} failed with exit code {code:?}: {stderr}")]
    ToolFailed {
        /// What was being generated
        step: String,
        /// Exit code
        code: Option<i32>,
        /// What the tool printed on stderr
        stderr: String,
    },

    /// A reset was asked for without confirmation
    #[error("resetting material deletes every identity and artifact; pass --confirm to proceed")]
    ConfirmationRequired,

    /// Filesystem failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Materials Result
pub type MaterialsResult<T> = Result<T, MaterialsError>;

/// What a generation run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterialsReport {
    /// Produced by this run
    pub generated: Vec<String>,
    /// Already present, left alone
    pub skipped: Vec<String>,
}

/// Produces the material a network needs.
#[async_trait::async_trait]
pub trait MaterialsGenerator: Send + Sync {
    /// Produce whatever is missing for `channel`
    async fn generate(&self, channel: &str) -> MaterialsResult<MaterialsReport>;

    /// Delete all generated material. Refused unless `confirm` is set.
    async fn reset(&self, confirm: bool) -> MaterialsResult<Vec<PathBuf>>;
}

/// [`MaterialsGenerator`] running `cryptogen` and `configtxgen` in a
/// throwaway `fabric-tools` container with the base directory mounted.
pub struct FabricToolsGenerator {
    topology: Arc<TopologyConfig>,
    runner: Arc<dyn CommandRunner>,
}

fn non_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

impl FabricToolsGenerator {
    /// Construct for the topology's base directory
    pub fn new(topology: Arc<TopologyConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { topology, runner }
    }

    fn tool(&self, base: &Path) -> Invocation {
        Invocation::new(self.topology.docker.docker.clone())
            .args(["run", "--rm", "-v"])
            .arg(format!("{}:/data", base.display()))
            .args(["-w", "/data", "-e", "FABRIC_CFG_PATH=/data/config"])
            .arg(self.topology.docker.tools_image.clone())
            .cwd(base)
    }

    async fn run_tool(&self, step: &str, invocation: Invocation) -> MaterialsResult<()> {
        tracing::info!(step, cmd = %invocation.display(), "generating");
        let output = self.runner.run(invocation).await?;
        if !output.success() {
            return Err(MaterialsError::ToolFailed {
                step: step.to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Identity directories cryptogen is expected to produce.
    fn identity_dirs(&self) -> Vec<PathBuf> {
        let orgs = self.topology.organizations_dir();
        std::iter::once(
            orgs.join("ordererOrganizations")
                .join(&self.topology.orderer.domain),
        )
        .chain(
            self.topology
                .organizations
                .iter()
                .map(|o| orgs.join("peerOrganizations").join(&o.domain)),
        )
        .collect()
    }

    async fn identities(&self, base: &Path, report: &mut MaterialsReport) -> MaterialsResult<()> {
        let missing = self
            .identity_dirs()
            .into_iter()
            .filter(|d| !d.is_dir())
            .count();
        if missing == 0 {
            report.skipped.push("crypto material".to_string());
            return Ok(());
        }
        // extend only fills in orgs that have no material yet
        let mode = if non_empty_dir(&self.topology.organizations_dir()) {
            ["extend", "--input=./organizations"]
        } else {
            ["generate", "--output=./organizations"]
        };
        self.run_tool(
            "crypto material",
            self.tool(base)
                .args(["cryptogen", mode[0], "--config=./config/crypto-config.yaml", mode[1]]),
        )
        .await?;
        report.generated.push("crypto material".to_string());
        Ok(())
    }

    async fn artifact(
        &self,
        base: &Path,
        name: ArtifactName,
        args: Vec<String>,
        report: &mut MaterialsReport,
    ) -> MaterialsResult<()> {
        let file = name.file_name();
        if self.topology.channel_artifacts_dir().join(&file).is_file() {
            report.skipped.push(file);
            return Ok(());
        }
        self.run_tool(&file, self.tool(base).arg("configtxgen").args(args))
            .await?;
        report.generated.push(file);
        Ok(())
    }
}

#[async_trait::async_trait]
impl MaterialsGenerator for FabricToolsGenerator {
    async fn generate(&self, channel: &str) -> MaterialsResult<MaterialsReport> {
        let mut report = MaterialsReport::default();
        inputs::render_missing(&self.topology, &mut report)?;
        std::fs::create_dir_all(self.topology.channel_artifacts_dir())?;
        let base = std::fs::canonicalize(&self.topology.base_dir)?;
        let out = |file: String| format!("./channel-artifacts/{}", file);

        self.identities(&base, &mut report).await?;

        let genesis = ArtifactName::Genesis;
        let genesis_out = out(genesis.file_name());
        self.artifact(
            &base,
            genesis,
            vec![
                "-profile".into(),
                GENESIS_PROFILE.into(),
                "-channelID".into(),
                self.topology.orderer.system_channel.clone(),
                "-outputBlock".into(),
                genesis_out,
            ],
            &mut report,
        )
        .await?;

        let channel_tx = ArtifactName::ChannelTx(channel.to_string());
        let channel_out = out(channel_tx.file_name());
        self.artifact(
            &base,
            channel_tx,
            vec![
                "-profile".into(),
                CHANNEL_PROFILE.into(),
                "-channelID".into(),
                channel.to_string(),
                "-outputCreateChannelTx".into(),
                channel_out,
            ],
            &mut report,
        )
        .await?;

        for org in &self.topology.organizations {
            let anchors = ArtifactName::AnchorTx(org.msp_id.clone());
            let anchors_out = out(anchors.file_name());
            self.artifact(
                &base,
                anchors,
                vec![
                    "-profile".into(),
                    CHANNEL_PROFILE.into(),
                    "-outputAnchorPeersUpdate".into(),
                    anchors_out,
                    "-channelID".into(),
                    channel.to_string(),
                    "-asOrg".into(),
                    org.msp_id.to_string(),
                ],
                &mut report,
            )
            .await?;
        }

        tracing::info!(generated = ?report.generated, skipped = ?report.skipped, "materials ready");
        Ok(report)
    }

    async fn reset(&self, confirm: bool) -> MaterialsResult<Vec<PathBuf>> {
        if !confirm {
            return Err(MaterialsError::ConfirmationRequired);
        }
        let mut removed = Vec::new();
        for dir in [
            self.topology.organizations_dir(),
            self.topology.channel_artifacts_dir(),
        ] {
            if dir.exists() {
                tracing::warn!(dir = %dir.display(), "deleting generated material");
                std::fs::remove_dir_all(&dir)?;
                removed.push(dir);
            }
        }
        Ok(removed)
    }
}
