//! Starting, stopping and inspecting the containers of the network.

use crate::config::TopologyConfig;
use crate::error::ErrorKind;
use crate::process::{CommandRunner, Invocation, LineStream};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Errors managing the container network.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A container channel work needs is not running
    #[error("services not running: {0:?}; start the network with `fabric-orch network start`")]
    ServiceNotRunning(Vec<String>),

    /// The compose file is not where the topology says
    #[error("compose file not found at {}", .0.display())]
    MissingFile(PathBuf),

    /// The container tool exited with an error
    #[error("`{command}` failed with exit code {code:?}: {stderr}")]
    CommandFailed {
        /// Command line
        command: String,
        /// Exit code
        code: Option<i32>,
        /// What it printed on stderr
        stderr: String,
    },

    /// The container tool could not be run
    #[error("could not run the container tool: {0}")]
    Io(#[from] std::io::Error),

    /// The container tool printed something unexpected
    #[error("could not read container status: {0}")]
    Parse(#[from] serde_json::Error),
}

impl NetworkError {
    /// Stopped services may be started; the rest needs an operator
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::ServiceNotRunning(_) => ErrorKind::Transient,
            NetworkError::MissingFile(_) => ErrorKind::ArtifactMissing,
            _ => ErrorKind::Structural,
        }
    }
}

/// Network Result
pub type NetworkResult<T> = Result<T, NetworkError>;

/// State of one service container.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum ServiceState {
    /// Up
    #[display(fmt = "running")]
    Running,
    /// Created but never started
    #[display(fmt = "created")]
    Created,
    /// Restarting after a crash
    #[display(fmt = "restarting")]
    Restarting,
    /// Stopped
    #[display(fmt = "exited")]
    Exited,
    /// Anything else the tool reports
    #[display(fmt = "{}", _0)]
    Other(String),
}

impl From<&str> for ServiceState {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "running" => ServiceState::Running,
            "created" => ServiceState::Created,
            "restarting" => ServiceState::Restarting,
            "exited" => ServiceState::Exited,
            other => ServiceState::Other(other.to_string()),
        }
    }
}

/// Start, stop and inspect the network.
#[mockall::automock]
#[async_trait::async_trait]
pub trait NetworkLifecycle: Send + Sync {
    /// Bring every service up in the background
    async fn start(&self) -> NetworkResult<()>;

    /// Stop and remove the containers, keeping volumes
    async fn stop(&self) -> NetworkResult<()>;

    /// State of every service, keyed by service name
    async fn status(&self) -> NetworkResult<BTreeMap<String, ServiceState>>;

    /// Service logs; with `follow` the stream runs until dropped
    async fn logs(&self, follow: bool) -> NetworkResult<LineStream>;
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    state: String,
}

/// `docker compose ps --format json` prints one array on older releases and
/// one object per line on newer ones.
pub(crate) fn parse_ps(output: &str) -> NetworkResult<Vec<(String, String, ServiceState)>> {
    let trimmed = output.trim();
    let entries: Vec<PsEntry> = if trimmed.is_empty() {
        Vec::new()
    } else if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?
    };
    Ok(entries
        .into_iter()
        .map(|e| {
            let service = if e.service.is_empty() {
                e.name.clone()
            } else {
                e.service
            };
            (service, e.name, ServiceState::from(e.state.as_str()))
        })
        .collect())
}

/// [`NetworkLifecycle`] backed by `docker compose`.
pub struct ComposeNetwork {
    topology: Arc<TopologyConfig>,
    runner: Arc<dyn CommandRunner>,
}

impl ComposeNetwork {
    /// Construct for the topology's compose file
    pub fn new(topology: Arc<TopologyConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { topology, runner }
    }

    fn compose(&self) -> NetworkResult<Invocation> {
        let file = self.topology.compose_file();
        if !file.is_file() {
            return Err(NetworkError::MissingFile(file));
        }
        Ok(Invocation::new(self.topology.docker.docker.clone())
            .arg("compose")
            .arg("-f")
            .arg(file.display().to_string())
            .cwd(self.topology.base_dir.clone()))
    }

    async fn checked(&self, invocation: Invocation) -> NetworkResult<String> {
        let command = invocation.display();
        let output = self.runner.run(invocation).await?;
        if !output.success() {
            return Err(NetworkError::CommandFailed {
                command,
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout_str())
    }

    /// Stop the network and delete its volumes. Ledgers are lost, so every
    /// channel has to be recreated afterwards.
    pub async fn clean(&self) -> NetworkResult<()> {
        tracing::warn!("removing containers and volumes");
        self.checked(self.compose()?.args(["down", "-v", "--remove-orphans"]))
            .await?;
        Ok(())
    }

    /// Fail unless every container in `containers` is running.
    pub async fn require_running(&self, containers: &[String]) -> NetworkResult<()> {
        let ps = self
            .checked(self.compose()?.args(["ps", "-a", "--format", "json"]))
            .await?;
        let entries = parse_ps(&ps)?;
        let missing: Vec<String> = containers
            .iter()
            .filter(|c| {
                !entries.iter().any(|(service, name, state)| {
                    (service == *c || name == *c) && *state == ServiceState::Running
                })
            })
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(NetworkError::ServiceNotRunning(missing))
        }
    }
}

#[async_trait::async_trait]
impl NetworkLifecycle for ComposeNetwork {
    async fn start(&self) -> NetworkResult<()> {
        tracing::info!(file = %self.topology.compose_file().display(), "starting network");
        self.checked(self.compose()?.args(["up", "-d"])).await?;
        Ok(())
    }

    async fn stop(&self) -> NetworkResult<()> {
        tracing::info!("stopping network");
        self.checked(self.compose()?.arg("down")).await?;
        Ok(())
    }

    async fn status(&self) -> NetworkResult<BTreeMap<String, ServiceState>> {
        let ps = self
            .checked(self.compose()?.args(["ps", "-a", "--format", "json"]))
            .await?;
        Ok(parse_ps(&ps)?
            .into_iter()
            .map(|(service, _, state)| (service, state))
            .collect())
    }

    async fn logs(&self, follow: bool) -> NetworkResult<LineStream> {
        let mut invocation = self.compose()?.args(["logs", "--tail=100"]);
        if follow {
            invocation = invocation.arg("-f");
        }
        Ok(self.runner.stream(invocation).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{CommandOutput, MockCommandRunner};
    use matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn topology(dir: &std::path::Path) -> Arc<TopologyConfig> {
        std::fs::write(dir.join("docker-compose.yaml"), "services: {}\n").unwrap();
        let mut t = TopologyConfig::two_org_default();
        t.base_dir = dir.to_path_buf();
        Arc::new(t)
    }

    const PS_LINES: &str = r#"{"Name":"orderer0","Service":"orderer.example.com","State":"running"}
{"Name":"peer0.org1.example.com","Service":"peer0.org1.example.com","State":"running"}
{"Name":"peer0.org2.example.com","Service":"peer0.org2.example.com","State":"exited"}
"#;

    #[test]
    fn ps_output_in_both_formats() {
        let lines = parse_ps(PS_LINES).unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2].2, ServiceState::Exited);

        let array = r#"[{"Name":"orderer0","Service":"orderer.example.com","State":"running"}]"#;
        let parsed = parse_ps(array).unwrap();
        assert_eq!(
            parsed,
            vec![(
                "orderer.example.com".to_string(),
                "orderer0".to_string(),
                ServiceState::Running
            )]
        );
        assert!(parse_ps("").unwrap().is_empty());
        assert_matches!(parse_ps("not json"), Err(NetworkError::Parse(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn require_running_names_stopped_containers() {
        let dir = tempfile::tempdir().unwrap();
        let topology = topology(dir.path());
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|inv: &Invocation| inv.args.contains(&"ps".to_string()))
            .returning(|_| Ok(CommandOutput::ok(PS_LINES)));
        let network = ComposeNetwork::new(topology.clone(), Arc::new(runner));

        let err = network
            .require_running(&topology.service_containers())
            .await
            .unwrap_err();
        assert_matches!(&err, NetworkError::ServiceNotRunning(m) if m == &vec!["peer0.org2.example.com".to_string()]);
        assert_eq!(err.kind(), ErrorKind::Transient);

        let status = network.status().await.unwrap();
        assert_eq!(status["orderer.example.com"], ServiceState::Running);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clean_removes_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|inv: &Invocation| {
                inv.args.ends_with(&[
                    "down".to_string(),
                    "-v".to_string(),
                    "--remove-orphans".to_string(),
                ])
            })
            .times(1)
            .returning(|_| Ok(CommandOutput::ok("")));
        let network = ComposeNetwork::new(topology(dir.path()), Arc::new(runner));
        network.clean().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_compose_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = TopologyConfig::two_org_default();
        t.base_dir = dir.path().to_path_buf();
        let network = ComposeNetwork::new(Arc::new(t), Arc::new(MockCommandRunner::new()));
        let err = network.start().await.unwrap_err();
        assert_matches!(err, NetworkError::MissingFile(_));
        assert_eq!(err.kind(), ErrorKind::ArtifactMissing);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_commands_carry_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(CommandOutput::failed(1, "no such service\n")));
        let network = ComposeNetwork::new(topology(dir.path()), Arc::new(runner));
        assert_matches!(
            network.stop().await,
            Err(NetworkError::CommandFailed { stderr, .. }) if stderr == "no such service"
        );
    }
}
