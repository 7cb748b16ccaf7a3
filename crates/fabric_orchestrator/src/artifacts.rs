//! Generated channel artifacts, addressed by name and never parsed.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::MspId;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Artifacts the orchestrators consume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactName {
    /// Orderer system channel genesis block
    Genesis,
    /// Creation transaction of an application channel
    ChannelTx(String),
    /// Anchor peer update transaction of an org
    AnchorTx(MspId),
}

impl ArtifactName {
    /// File name inside the artifacts directory
    pub fn file_name(&self) -> String {
        match self {
            ArtifactName::Genesis => "genesis.block".to_string(),
            ArtifactName::ChannelTx(channel) => format!("{}.tx", channel),
            ArtifactName::AnchorTx(msp) => format!("{}anchors.tx", msp),
        }
    }
}

/// The bytes of an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// File name it was loaded from
    pub name: String,
    /// Raw contents
    pub bytes: Vec<u8>,
}

impl Artifact {
    /// sha256 of the contents, hex encoded, for logs
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(&self.bytes))
    }
}

/// Resolves artifact names to bytes.
pub trait ArtifactSource: Send + Sync {
    /// Load an artifact or fail with [`OrchestratorError::ArtifactMissing`]
    fn load(&self, name: &ArtifactName) -> OrchestratorResult<Artifact>;

    /// Whether an artifact is present
    fn exists(&self, name: &ArtifactName) -> bool;
}

/// The `channel-artifacts/` directory written by `configtxgen`.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    root: PathBuf,
}

impl ArtifactDir {
    /// Read artifacts from `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where an artifact lives
    pub fn path(&self, name: &ArtifactName) -> PathBuf {
        self.root.join(name.file_name())
    }

    /// The directory
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArtifactSource for ArtifactDir {
    fn load(&self, name: &ArtifactName) -> OrchestratorResult<Artifact> {
        let path = self.path(name);
        match std::fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => {
                let artifact = Artifact {
                    name: name.file_name(),
                    bytes,
                };
                tracing::debug!(artifact = %artifact.name, digest = %artifact.digest(), "loaded artifact");
                Ok(artifact)
            }
            // an empty file is as good as none, configtxgen never writes one
            Ok(_) => Err(OrchestratorError::ArtifactMissing {
                name: name.file_name(),
                path,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(OrchestratorError::ArtifactMissing {
                    name: name.file_name(),
                    path,
                })
            }
            Err(e) => Err(OrchestratorError::Store(crate::store::StoreError::Io {
                path,
                source: e,
            })),
        }
    }

    fn exists(&self, name: &ArtifactName) -> bool {
        self.path(name).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    #[test]
    fn file_names_follow_configtxgen_conventions() {
        assert_eq!(ArtifactName::Genesis.file_name(), "genesis.block");
        assert_eq!(
            ArtifactName::ChannelTx("npa-channel".into()).file_name(),
            "npa-channel.tx"
        );
        assert_eq!(
            ArtifactName::AnchorTx("Org1MSP".into()).file_name(),
            "Org1MSPanchors.tx"
        );
    }

    #[test]
    fn missing_and_empty_artifacts_are_reported_with_their_path() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactDir::new(dir.path());
        let name = ArtifactName::ChannelTx("npa-channel".into());

        let err = artifacts.load(&name).unwrap_err();
        assert_matches!(err, OrchestratorError::ArtifactMissing { ref path, .. } if path == &dir.path().join("npa-channel.tx"));
        assert!(err.to_string().contains("materials generate"));

        std::fs::write(dir.path().join("npa-channel.tx"), b"").unwrap();
        assert_matches!(
            artifacts.load(&name),
            Err(OrchestratorError::ArtifactMissing { .. })
        );

        std::fs::write(dir.path().join("npa-channel.tx"), b"tx").unwrap();
        let artifact = artifacts.load(&name).unwrap();
        assert_eq!(artifact.bytes, b"tx");
        assert!(artifacts.exists(&name));
        assert_eq!(artifact.digest().len(), 64);
    }
}
