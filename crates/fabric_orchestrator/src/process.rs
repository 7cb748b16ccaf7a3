//! Running external programs (`docker`, `docker compose`).

use futures::stream::BoxStream;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// One program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Invocation {
    /// Program to run
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Bytes fed to stdin
    pub stdin: Option<Vec<u8>>,
}

impl Invocation {
    /// Run `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Feed bytes to stdin
    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    /// The command line, for logs and error messages
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What a finished program left behind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal
    pub code: Option<i32>,
    /// Raw stdout
    pub stdout: Vec<u8>,
    /// Stderr, lossily decoded
    pub stderr: String,
}

impl CommandOutput {
    /// A successful run with this stdout
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed run with this stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    /// Exit code was 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout, lossily decoded
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Both streams, for parsing tools that print results on stderr
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout_str(), self.stderr)
    }
}

/// Lines of a long running program's output.
pub type LineStream = BoxStream<'static, std::io::Result<String>>;

/// Runs programs.
#[mockall::automock]
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, capturing output
    async fn run(&self, invocation: Invocation) -> std::io::Result<CommandOutput>;

    /// Start and stream stdout line by line; the program is killed when the
    /// stream is dropped
    async fn stream(&self, invocation: Invocation) -> std::io::Result<LineStream>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    fn command(invocation: &Invocation) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&invocation.program);
        cmd.args(&invocation.args).kill_on_drop(true);
        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

#[async_trait::async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, invocation: Invocation) -> std::io::Result<CommandOutput> {
        tracing::debug!(cmd = %invocation.display(), "running");
        let mut cmd = Self::command(&invocation);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = cmd.spawn()?;
        if let (Some(bytes), Some(mut stdin)) = (invocation.stdin, child.stdin.take()) {
            stdin.write_all(&bytes).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        let output = CommandOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !output.success() {
            tracing::debug!(code = ?output.code, stderr = %output.stderr.trim(), "command failed");
        }
        Ok(output)
    }

    async fn stream(&self, invocation: Invocation) -> std::io::Result<LineStream> {
        tracing::debug!(cmd = %invocation.display(), "streaming");
        let mut cmd = Self::command(&invocation);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .stdin(Stdio::null());
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "child stdout was not captured")
        })?;
        let lines = BufReader::new(stdout).lines();
        // the child rides along in the stream state so dropping the stream kills it
        let stream = futures::stream::unfold((lines, child), |(mut lines, child)| async move {
            match lines.next_line().await {
                Ok(Some(line)) => Some((Ok(line), (lines, child))),
                Ok(None) => None,
                Err(e) => Some((Err(e), (lines, child))),
            }
        });
        Ok(Box::pin(stream))
    }
}
