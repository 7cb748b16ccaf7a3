//! Durable bookkeeping shared by both orchestrators.
//!
//! The ledger is the source of truth. The repository remembers what the
//! orchestrators observed and decided: per-org approvals (with a version for
//! compare-and-set), write-once commit records, deploy checkpoints and the
//! cached channel block.

use crate::deploy::DeployCheckpoint;
use crate::error::ErrorKind;
use crate::types::{ApprovalRecord, CommitRecord, DefinitionKey, OrgId};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Errors from a [`StateRepository`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Compare-and-set lost against a concurrent writer
    #[error("compare-and-set conflict on {key}: expected version {expected:?}, found {found:?}")]
    VersionConflict {
        /// Record key
        key: String,
        /// Version the writer read
        expected: Option<u64>,
        /// Version actually stored
        found: Option<u64>,
    },

    /// A write-once record already exists
    #[error("record {0} is write-once and already exists")]
    AlreadyExists(String),

    /// A name cannot be used as a storage key
    #[error("'{0}' cannot be used as a state key")]
    InvalidKey(String),

    /// Filesystem failure
    #[error("state io error at {}: {source}", path.display())]
    Io {
        /// Path involved
        path: PathBuf,
        /// Cause
        #[source]
        source: std::io::Error,
    },

    /// A background filesystem task did not finish
    #[error("state task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A stored document could not be read back
    #[error("state document {} is corrupt: {source}", path.display())]
    Corrupt {
        /// Path involved
        path: PathBuf,
        /// Cause
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Lost races and duplicate records need an operator; io may go away
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::VersionConflict { .. } | StoreError::AlreadyExists(_) => {
                ErrorKind::Conflict
            }
            StoreError::InvalidKey(_)
            | StoreError::Io { .. }
            | StoreError::Task(_)
            | StoreError::Corrupt { .. } => ErrorKind::Structural,
        }
    }
}

/// Store Result
pub type StoreResult<T> = Result<T, StoreError>;

/// Key of one org's approval of one definition.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApprovalKey {
    /// Definition the vote is for
    pub definition: DefinitionKey,
    /// Voting org
    pub org: OrgId,
}

impl ApprovalKey {
    /// Construct a key
    pub fn new(definition: DefinitionKey, org: OrgId) -> Self {
        Self { definition, org }
    }
}

impl std::fmt::Display for ApprovalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.definition, self.org)
    }
}

/// A record plus the version it was stored at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    /// Bumped on every write
    pub version: u64,
    /// The record
    pub value: T,
}

/// Where the orchestrators keep what they learned and decided.
#[async_trait::async_trait]
pub trait StateRepository: Send + Sync {
    /// Current approval of an org, with its version
    async fn approval(&self, key: &ApprovalKey) -> StoreResult<Option<Versioned<ApprovalRecord>>>;

    /// Write an approval if the stored version is still `expected`
    /// (`None` meaning "no record yet"). Returns the new version.
    async fn compare_and_set_approval(
        &self,
        key: &ApprovalKey,
        expected: Option<u64>,
        record: ApprovalRecord,
    ) -> StoreResult<u64>;

    /// All approvals stored for a definition
    async fn approvals(&self, definition: &DefinitionKey) -> StoreResult<Vec<ApprovalRecord>>;

    /// Commit record at exactly this sequence
    async fn commit_record(&self, definition: &DefinitionKey) -> StoreResult<Option<CommitRecord>>;

    /// Commit record with the highest sequence for (channel, name)
    async fn latest_commit(&self, channel: &str, name: &str) -> StoreResult<Option<CommitRecord>>;

    /// Write a commit record. Fails with [`StoreError::AlreadyExists`] if one
    /// exists for that sequence.
    async fn insert_commit_record(&self, record: CommitRecord) -> StoreResult<()>;

    /// Overwrite the commit record at a sequence. Only for a commit the ledger
    /// confirmed after the channel was recreated.
    async fn replace_commit_record(&self, record: CommitRecord) -> StoreResult<()>;

    /// Forget every approval, commit record and checkpoint kept for a channel
    async fn discard_channel_records(&self, channel: &str) -> StoreResult<()>;

    /// Last checkpoint of a deploy flow
    async fn deploy_checkpoint(&self, key: &DefinitionKey) -> StoreResult<Option<DeployCheckpoint>>;

    /// Overwrite the checkpoint of a deploy flow
    async fn save_deploy_checkpoint(
        &self,
        key: &DefinitionKey,
        checkpoint: DeployCheckpoint,
    ) -> StoreResult<()>;

    /// Cached genesis block of a channel
    async fn channel_block(&self, channel: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Cache the genesis block of a channel
    async fn put_channel_block(&self, channel: &str, block: Vec<u8>) -> StoreResult<()>;

    /// Forget the cached genesis block of a channel
    async fn discard_channel_block(&self, channel: &str) -> StoreResult<()>;
}

#[derive(Default)]
struct MemoryInner {
    approvals: BTreeMap<ApprovalKey, Versioned<ApprovalRecord>>,
    commits: BTreeMap<DefinitionKey, CommitRecord>,
    checkpoints: BTreeMap<DefinitionKey, DeployCheckpoint>,
    blocks: BTreeMap<String, Vec<u8>>,
}

/// In-memory repository, for tests and one-shot runs.
#[derive(Default)]
pub struct MemoryStateRepository(Mutex<MemoryInner>);

impl MemoryStateRepository {
    /// An empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateRepository for MemoryStateRepository {
    async fn approval(&self, key: &ApprovalKey) -> StoreResult<Option<Versioned<ApprovalRecord>>> {
        Ok(self.0.lock().approvals.get(key).cloned())
    }

    async fn compare_and_set_approval(
        &self,
        key: &ApprovalKey,
        expected: Option<u64>,
        record: ApprovalRecord,
    ) -> StoreResult<u64> {
        let mut inner = self.0.lock();
        let found = inner.approvals.get(key).map(|v| v.version);
        if found != expected {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected,
                found,
            });
        }
        let version = found.map(|v| v + 1).unwrap_or(1);
        inner.approvals.insert(
            key.clone(),
            Versioned {
                version,
                value: record,
            },
        );
        Ok(version)
    }

    async fn approvals(&self, definition: &DefinitionKey) -> StoreResult<Vec<ApprovalRecord>> {
        Ok(self
            .0
            .lock()
            .approvals
            .iter()
            .filter(|(k, _)| &k.definition == definition)
            .map(|(_, v)| v.value.clone())
            .collect())
    }

    async fn commit_record(&self, definition: &DefinitionKey) -> StoreResult<Option<CommitRecord>> {
        Ok(self.0.lock().commits.get(definition).cloned())
    }

    async fn latest_commit(&self, channel: &str, name: &str) -> StoreResult<Option<CommitRecord>> {
        Ok(self
            .0
            .lock()
            .commits
            .iter()
            .filter(|(k, _)| k.channel == channel && k.name == name)
            .max_by_key(|(k, _)| k.sequence)
            .map(|(_, v)| v.clone()))
    }

    async fn insert_commit_record(&self, record: CommitRecord) -> StoreResult<()> {
        let key = record.definition.key();
        let mut inner = self.0.lock();
        if inner.commits.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        inner.commits.insert(key, record);
        Ok(())
    }

    async fn replace_commit_record(&self, record: CommitRecord) -> StoreResult<()> {
        self.0.lock().commits.insert(record.definition.key(), record);
        Ok(())
    }

    async fn discard_channel_records(&self, channel: &str) -> StoreResult<()> {
        let mut inner = self.0.lock();
        inner.approvals.retain(|k, _| k.definition.channel != channel);
        inner.commits.retain(|k, _| k.channel != channel);
        inner.checkpoints.retain(|k, _| k.channel != channel);
        Ok(())
    }

    async fn deploy_checkpoint(&self, key: &DefinitionKey) -> StoreResult<Option<DeployCheckpoint>> {
        Ok(self.0.lock().checkpoints.get(key).cloned())
    }

    async fn save_deploy_checkpoint(
        &self,
        key: &DefinitionKey,
        checkpoint: DeployCheckpoint,
    ) -> StoreResult<()> {
        self.0.lock().checkpoints.insert(key.clone(), checkpoint);
        Ok(())
    }

    async fn channel_block(&self, channel: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.0.lock().blocks.get(channel).cloned())
    }

    async fn put_channel_block(&self, channel: &str, block: Vec<u8>) -> StoreResult<()> {
        self.0.lock().blocks.insert(channel.to_string(), block);
        Ok(())
    }

    async fn discard_channel_block(&self, channel: &str) -> StoreResult<()> {
        self.0.lock().blocks.remove(channel);
        Ok(())
    }
}

/// Repository of JSON documents under a state directory.
///
/// Layout:
/// ```text
/// <root>/channels/<channel>/channel.block
/// <root>/channels/<channel>/chaincode/<name>/<sequence>/approvals/<org>.json
/// <root>/channels/<channel>/chaincode/<name>/<sequence>/commit.json
/// <root>/channels/<channel>/chaincode/<name>/<sequence>/deploy.json
/// ```
/// Every write goes to a temp file in the target directory and is renamed into
/// place. Filesystem work runs on the blocking pool. Commit records are persisted without clobbering, so two processes
/// racing to record the same commit cannot both succeed. Compare-and-set on
/// approvals is serialized within one process.
pub struct FileStateRepository {
    root: PathBuf,
    cas_lock: tokio::sync::Mutex<()>,
}

impl FileStateRepository {
    /// Use `root`, creating it if needed
    pub fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            cas_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The state directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn channel_dir(&self, channel: &str) -> StoreResult<PathBuf> {
        Ok(self.root.join("channels").join(component(channel)?))
    }

    fn chaincode_dir(&self, channel: &str, name: &str) -> StoreResult<PathBuf> {
        Ok(self
            .channel_dir(channel)?
            .join("chaincode")
            .join(component(name)?))
    }

    fn definition_dir(&self, key: &DefinitionKey) -> StoreResult<PathBuf> {
        Ok(self
            .chaincode_dir(&key.channel, &key.name)?
            .join(key.sequence.to_string()))
    }

    fn approval_path(&self, key: &ApprovalKey) -> StoreResult<PathBuf> {
        Ok(self
            .definition_dir(&key.definition)?
            .join("approvals")
            .join(format!("{}.json", component(key.org.as_str())?)))
    }
}

/// Reject names that would escape their directory.
fn component(name: &str) -> StoreResult<&str> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(StoreError::InvalidKey(name.to_string()));
    }
    Ok(name)
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_bytes(path: &Path) -> StoreResult<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path)(e)),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match read_bytes(path)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            }),
        None => Ok(None),
    }
}

fn temp_in(path: &Path) -> StoreResult<tempfile::NamedTempFile> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(io_err(dir))?;
    tempfile::NamedTempFile::new_in(dir).map_err(io_err(dir))
}

fn write_bytes(path: &Path, bytes: &[u8], clobber: bool) -> StoreResult<()> {
    use std::io::Write;
    let mut tmp = temp_in(path)?;
    tmp.write_all(bytes).map_err(io_err(path))?;
    tmp.as_file().sync_all().map_err(io_err(path))?;
    if clobber {
        tmp.persist(path).map_err(|e| io_err(path)(e.error))?;
    } else {
        tmp.persist_noclobber(path).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                StoreError::AlreadyExists(path.display().to_string())
            } else {
                io_err(path)(e.error)
            }
        })?;
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T, clobber: bool) -> StoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    write_bytes(path, &bytes, clobber)
}

/// Subdirectories of `dir`, empty if it does not exist.
fn subdirs(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(dir)(e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err(dir))?;
        if entry.path().is_dir() {
            out.push(entry.path());
        }
    }
    Ok(out)
}

fn read_approvals(dir: &Path) -> StoreResult<Vec<ApprovalRecord>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(dir)(e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let path = entry.map_err(io_err(dir))?.path();
        if path.extension().map(|e| e == "json").unwrap_or(false) {
            if let Some(v) = read_json::<Versioned<ApprovalRecord>>(&path)? {
                out.push(v.value);
            }
        }
    }
    out.sort_by(|a, b| a.org.cmp(&b.org));
    Ok(out)
}

fn latest_commit_in(dir: &Path) -> StoreResult<Option<CommitRecord>> {
    let mut sequences: Vec<u64> = subdirs(dir)?
        .iter()
        .filter_map(|p| p.file_name()?.to_str()?.parse().ok())
        .collect();
    sequences.sort_unstable_by(|a, b| b.cmp(a));
    for sequence in sequences {
        if let Some(record) = read_json(&dir.join(sequence.to_string()).join("commit.json"))? {
            return Ok(Some(record));
        }
    }
    Ok(None)
}

fn remove_file(path: &Path) -> StoreResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}

fn remove_dir(path: &Path) -> StoreResult<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}

/// Run filesystem work off the async runtime.
async fn blocking<T, F>(f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

#[async_trait::async_trait]
impl StateRepository for FileStateRepository {
    async fn approval(&self, key: &ApprovalKey) -> StoreResult<Option<Versioned<ApprovalRecord>>> {
        let path = self.approval_path(key)?;
        blocking(move || read_json(&path)).await
    }

    async fn compare_and_set_approval(
        &self,
        key: &ApprovalKey,
        expected: Option<u64>,
        record: ApprovalRecord,
    ) -> StoreResult<u64> {
        let path = self.approval_path(key)?;
        let key = key.to_string();
        let _guard = self.cas_lock.lock().await;
        blocking(move || {
            let found = read_json::<Versioned<ApprovalRecord>>(&path)?.map(|v| v.version);
            if found != expected {
                return Err(StoreError::VersionConflict {
                    key,
                    expected,
                    found,
                });
            }
            let version = found.map(|v| v + 1).unwrap_or(1);
            write_json(
                &path,
                &Versioned {
                    version,
                    value: record,
                },
                true,
            )?;
            Ok(version)
        })
        .await
    }

    async fn approvals(&self, definition: &DefinitionKey) -> StoreResult<Vec<ApprovalRecord>> {
        let dir = self.definition_dir(definition)?.join("approvals");
        blocking(move || read_approvals(&dir)).await
    }

    async fn commit_record(&self, definition: &DefinitionKey) -> StoreResult<Option<CommitRecord>> {
        let path = self.definition_dir(definition)?.join("commit.json");
        blocking(move || read_json(&path)).await
    }

    async fn latest_commit(&self, channel: &str, name: &str) -> StoreResult<Option<CommitRecord>> {
        let dir = self.chaincode_dir(channel, name)?;
        blocking(move || latest_commit_in(&dir)).await
    }

    async fn insert_commit_record(&self, record: CommitRecord) -> StoreResult<()> {
        let key = record.definition.key();
        let path = self.definition_dir(&key)?.join("commit.json");
        blocking(move || {
            write_json(&path, &record, false).map_err(|e| match e {
                StoreError::AlreadyExists(_) => StoreError::AlreadyExists(key.to_string()),
                e => e,
            })
        })
        .await
    }

    async fn replace_commit_record(&self, record: CommitRecord) -> StoreResult<()> {
        let path = self.definition_dir(&record.definition.key())?.join("commit.json");
        blocking(move || write_json(&path, &record, true)).await
    }

    async fn discard_channel_records(&self, channel: &str) -> StoreResult<()> {
        let dir = self.channel_dir(channel)?.join("chaincode");
        blocking(move || remove_dir(&dir)).await
    }

    async fn deploy_checkpoint(&self, key: &DefinitionKey) -> StoreResult<Option<DeployCheckpoint>> {
        let path = self.definition_dir(key)?.join("deploy.json");
        blocking(move || read_json(&path)).await
    }

    async fn save_deploy_checkpoint(
        &self,
        key: &DefinitionKey,
        checkpoint: DeployCheckpoint,
    ) -> StoreResult<()> {
        let path = self.definition_dir(key)?.join("deploy.json");
        blocking(move || write_json(&path, &checkpoint, true)).await
    }

    async fn channel_block(&self, channel: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.channel_dir(channel)?.join("channel.block");
        blocking(move || read_bytes(&path)).await
    }

    async fn put_channel_block(&self, channel: &str, block: Vec<u8>) -> StoreResult<()> {
        let path = self.channel_dir(channel)?.join("channel.block");
        blocking(move || write_bytes(&path, &block, true)).await
    }

    async fn discard_channel_block(&self, channel: &str) -> StoreResult<()> {
        let path = self.channel_dir(channel)?.join("channel.block");
        blocking(move || remove_file(&path)).await
    }
}
