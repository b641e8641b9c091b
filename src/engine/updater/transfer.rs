//! Artifact Transfer
//!
//! Materializes the ruleset payload and its detached signature in the staging
//! directory. The directory is purged before every transfer and left populated
//! afterwards for the appliance to consume.

use reqwest::blocking::Client;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::config::UpdaterConfig;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Failed to prepare staging directory {}: {detail}", path.display())]
    StagingDir { path: PathBuf, detail: String },
    #[error("Failed to download {file}: {detail}")]
    Download { file: String, detail: String },
    #[error("Artifact incomplete: {0}")]
    Incomplete(String),
}

impl TransferError {
    fn staging(path: &Path, e: io::Error) -> Self {
        Self::StagingDir {
            path: path.to_path_buf(),
            detail: e.to_string(),
        }
    }

    fn download(file: &str, detail: impl ToString) -> Self {
        Self::Download {
            file: file.to_string(),
            detail: detail.to_string(),
        }
    }
}

/// The two staged files plus what was observed about them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPair {
    pub payload_path: PathBuf,
    pub signature_path: PathBuf,
    pub payload_bytes: u64,
    pub signature_bytes: u64,
    pub payload_sha256: String,
}

/// Where to fetch the pair from and how to name it locally
#[derive(Debug, Clone)]
pub struct ArtifactRequest {
    pub payload_url: String,
    pub signature_url: String,
    pub payload_file: String,
    pub signature_file: String,
    /// Complete `Authorization` header value for the artifact store
    pub authorization: String,
    pub timeout: Duration,
}

impl ArtifactRequest {
    pub fn from_config(config: &UpdaterConfig) -> Self {
        let payload_file = config.payload_file_name();
        let signature_file = config.signature_file_name();
        Self {
            payload_url: config.artifact_url(&payload_file),
            signature_url: config.artifact_url(&signature_file),
            payload_file,
            signature_file,
            authorization: config.artifact_authorization(),
            timeout: config.download_timeout(),
        }
    }
}

pub trait ArtifactTransfer: Send + Sync {
    /// Ensure the directory exists and is empty
    fn prepare(&self, staging_dir: &Path) -> Result<(), TransferError>;

    /// Download payload, then signature
    fn fetch(&self, request: &ArtifactRequest, staging_dir: &Path) -> Result<ArtifactPair, TransferError>;

    /// Re-list the directory and confirm both files landed
    fn verify(&self, staging_dir: &Path, pair: &ArtifactPair) -> Result<(), TransferError>;
}

/// Create `dir` if needed, then remove everything inside it
pub fn purge_staging_dir(dir: &Path) -> Result<(), TransferError> {
    fs::create_dir_all(dir).map_err(|e| TransferError::staging(dir, e))?;

    for entry in fs::read_dir(dir).map_err(|e| TransferError::staging(dir, e))? {
        let path = entry.map_err(|e| TransferError::staging(dir, e))?.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|e| TransferError::staging(&path, e))?;
    }
    Ok(())
}

/// Check both files by listing the directory, independent of what the
/// download reported
pub fn verify_staging_dir(dir: &Path, pair: &ArtifactPair) -> Result<(), TransferError> {
    let listing = fs::read_dir(dir)
        .map_err(|e| TransferError::Incomplete(format!("cannot list {}: {}", dir.display(), e)))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect::<BTreeSet<_>>();

    for path in [&pair.payload_path, &pair.signature_path] {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !listing.contains(&name) {
            return Err(TransferError::Incomplete(format!(
                "{} missing from {}",
                name,
                dir.display()
            )));
        }
        let size = fs::metadata(dir.join(&name)).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(TransferError::Incomplete(format!("{} is empty", name)));
        }
    }
    Ok(())
}

/// Streaming SHA-256 of a file, hex encoded
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Production transfer: two authenticated GETs against the artifact store
pub struct HttpArtifactTransfer {
    client: Client,
}

impl HttpArtifactTransfer {
    pub fn new(accept_invalid_certs: bool) -> Result<Self, TransferError> {
        let client = Client::builder()
            .user_agent(concat!("ngfw-updater/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| TransferError::download("artifact client", e))?;
        Ok(Self { client })
    }

    /// Download `url` to `dest` through a `.partial` file; returns bytes written
    fn download(
        &self,
        url: &str,
        dest: &Path,
        authorization: &str,
        timeout: Duration,
    ) -> Result<u64, TransferError> {
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| url.to_string());
        let partial_path = dest.with_file_name(format!("{}.partial", file_name));

        let mut response = self
            .client
            .get(url)
            .header(AUTHORIZATION, authorization)
            .timeout(timeout)
            .send()
            .map_err(|e| TransferError::download(&file_name, e))?;

        if !response.status().is_success() {
            return Err(TransferError::download(
                &file_name,
                format!("HTTP {}", response.status()),
            ));
        }

        let mut file = File::create(&partial_path).map_err(|e| TransferError::download(&file_name, e))?;
        let written = response
            .copy_to(&mut file)
            .map_err(|e| TransferError::download(&file_name, e))?;
        file.flush().map_err(|e| TransferError::download(&file_name, e))?;
        drop(file);

        if written == 0 {
            let _ = fs::remove_file(&partial_path);
            return Err(TransferError::download(&file_name, "empty response body"));
        }

        fs::rename(&partial_path, dest).map_err(|e| TransferError::download(&file_name, e))?;
        tracing::info!(file = %file_name, bytes = written, "artifact downloaded");
        Ok(written)
    }
}

impl ArtifactTransfer for HttpArtifactTransfer {
    fn prepare(&self, staging_dir: &Path) -> Result<(), TransferError> {
        purge_staging_dir(staging_dir)
    }

    fn fetch(&self, request: &ArtifactRequest, staging_dir: &Path) -> Result<ArtifactPair, TransferError> {
        let payload_path = staging_dir.join(&request.payload_file);
        let signature_path = staging_dir.join(&request.signature_file);

        let payload_bytes = self.download(
            &request.payload_url,
            &payload_path,
            &request.authorization,
            request.timeout,
        )?;
        let signature_bytes = self.download(
            &request.signature_url,
            &signature_path,
            &request.authorization,
            request.timeout,
        )?;

        let payload_sha256 = sha256_file(&payload_path)
            .map_err(|e| TransferError::download(&request.payload_file, e))?;

        Ok(ArtifactPair {
            payload_path,
            signature_path,
            payload_bytes,
            signature_bytes,
            payload_sha256,
        })
    }

    fn verify(&self, staging_dir: &Path, pair: &ArtifactPair) -> Result<(), TransferError> {
        verify_staging_dir(staging_dir, pair)
    }
}
