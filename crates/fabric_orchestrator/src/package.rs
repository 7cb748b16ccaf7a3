//! Chaincode-as-a-service packages.
//!
//! A package is a `tar.gz` holding `metadata.json` and `code.tar.gz`, the
//! latter holding `connection.json`. Headers carry fixed mtime, mode and
//! owner, and the gzip header has no timestamp, so the same source always
//! yields the same bytes and therefore the same package id.

use crate::types::PackageId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;

/// Errors building a package.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    /// Fabric only accepts `[[:alnum:]][[:alnum:]_.+-]*`
    #[error("package label '{0}' must start with an alphanumeric and contain only alphanumerics, '_', '.', '+' or '-'")]
    InvalidLabel(String),

    /// The chaincode service address is unusable
    #[error("chaincode address '{0}' must be host:port")]
    InvalidAddress(String),

    /// Building the archive failed
    #[error("could not build package: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding the json documents failed
    #[error("could not encode package metadata: {0}")]
    Json(#[from] serde_json::Error),
}

/// Package Result
pub type PackageResult<T> = Result<T, PackageError>;

/// Everything that goes into a package.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionSource {
    /// Package label, e.g. `taskdocument_1.0`
    pub label: String,
    /// Where peers dial the chaincode service, e.g. `chaincode-rest:9999`
    pub address: String,
    /// Dial timeout, e.g. `10s`
    pub dial_timeout: String,
    /// Whether peers dial over TLS
    pub tls_required: bool,
}

impl DefinitionSource {
    /// A plain-text service at `address`
    pub fn new(label: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            address: address.into(),
            dial_timeout: "10s".to_string(),
            tls_required: false,
        }
    }
}

/// Immutable, content-addressed identity of a package.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageDescriptor {
    /// Label
    pub label: String,
    /// sha256 of the package bytes, hex encoded
    pub hash: String,
}

impl PackageDescriptor {
    /// `label:hash`, as the peer computes it on install
    pub fn package_id(&self) -> PackageId {
        PackageId::new(format!("{}:{}", self.label, self.hash))
    }
}

/// A built package.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChaincodePackage {
    /// Identity
    pub descriptor: PackageDescriptor,
    /// The `tar.gz` bytes
    pub bytes: Vec<u8>,
}

impl ChaincodePackage {
    /// Package id of this package
    pub fn package_id(&self) -> PackageId {
        self.descriptor.package_id()
    }

    /// File name the peer CLI would use
    pub fn file_name(&self) -> String {
        format!("{}.tar.gz", self.descriptor.label)
    }
}

#[derive(Serialize)]
struct Metadata<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    label: &'a str,
}

#[derive(Serialize)]
struct Connection<'a> {
    address: &'a str,
    dial_timeout: &'a str,
    tls_required: bool,
}

fn valid_label(label: &str) -> bool {
    let mut chars = label.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || "_.+-".contains(c))
}

fn valid_address(address: &str) -> bool {
    matches!(
        address.rsplit_once(':'),
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok()
    )
}

fn tar_gz(entries: &[(&str, &[u8])]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        builder.append_data(&mut header, path, *data)?;
    }
    let tar = builder.into_inner()?;

    let mut gz = flate2::GzBuilder::new()
        .mtime(0)
        .write(Vec::new(), flate2::Compression::default());
    gz.write_all(&tar)?;
    gz.finish()
}

/// Build the package for `source`. Identical sources give identical bytes.
pub fn package(source: &DefinitionSource) -> PackageResult<ChaincodePackage> {
    if !valid_label(&source.label) {
        return Err(PackageError::InvalidLabel(source.label.clone()));
    }
    if !valid_address(&source.address) {
        return Err(PackageError::InvalidAddress(source.address.clone()));
    }

    let connection = serde_json::to_vec(&Connection {
        address: &source.address,
        dial_timeout: &source.dial_timeout,
        tls_required: source.tls_required,
    })?;
    let code = tar_gz(&[("connection.json", connection.as_slice())])?;
    let metadata = serde_json::to_vec(&Metadata {
        kind: "ccaas",
        label: &source.label,
    })?;
    let bytes = tar_gz(&[
        ("metadata.json", metadata.as_slice()),
        ("code.tar.gz", code.as_slice()),
    ])?;

    let descriptor = PackageDescriptor {
        label: source.label.clone(),
        hash: hex::encode(Sha256::digest(&bytes)),
    };
    tracing::debug!(package_id = %descriptor.package_id(), size = bytes.len(), "built package");
    Ok(ChaincodePackage { descriptor, bytes })
}
