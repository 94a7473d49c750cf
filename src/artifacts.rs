//! Byte-exact run artifacts with recorded SHA-256 digests.
//!
//! Each run owns `<base_dir>/<run_id>/`. Artifacts are written once to a
//! `.partial` sibling and renamed into place; they are never rewritten.

use crate::errors::ArtifactError;
use crate::hashing::sha256_hex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Screenshot,
    HtmlBefore,
    HtmlAfter,
    JobRecord,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::HtmlBefore,
        ArtifactKind::HtmlAfter,
        ArtifactKind::Screenshot,
        ArtifactKind::JobRecord,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Screenshot => "screenshot",
            Self::HtmlBefore => "html_before",
            Self::HtmlAfter => "html_after",
            Self::JobRecord => "job_record",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Screenshot => "screenshot.png",
            Self::HtmlBefore => "raw.before.html",
            Self::HtmlAfter => "raw.after.html",
            Self::JobRecord => "job_record.json",
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "screenshot" => Ok(Self::Screenshot),
            "html_before" => Ok(Self::HtmlBefore),
            "html_after" => Ok(Self::HtmlAfter),
            "job_record" => Ok(Self::JobRecord),
            _ => Err(format!("Invalid artifact kind: {}", s)),
        }
    }
}

/// Metadata of a registered artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub run_id: String,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ArtifactLedger {
    base_dir: PathBuf,
}

impl ArtifactLedger {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    pub fn path_for(&self, run_id: &str, kind: ArtifactKind) -> PathBuf {
        self.run_dir(run_id).join(kind.file_name())
    }

    /// Persist `bytes` as the run's artifact of `kind` and return its record.
    ///
    /// The digest is computed over the bytes that were written.
    pub fn register(
        &self,
        run_id: &str,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<Artifact, ArtifactError> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir).map_err(|source| ArtifactError::Io {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(kind.file_name());
        if path.exists() {
            return Err(ArtifactError::AlreadyExists { path });
        }

        let partial = dir.join(format!("{}.partial", kind.file_name()));
        fs::write(&partial, bytes).map_err(|source| ArtifactError::Io {
            path: partial.clone(),
            source,
        })?;
        fs::rename(&partial, &path).map_err(|source| ArtifactError::Io {
            path: path.clone(),
            source,
        })?;

        let artifact = Artifact {
            run_id: run_id.to_string(),
            kind,
            path,
            sha256: sha256_hex(bytes),
            created_at: Utc::now(),
        };
        tracing::debug!(
            run_id,
            kind = kind.as_str(),
            sha256 = %artifact.sha256,
            bytes = bytes.len(),
            "registered artifact"
        );
        Ok(artifact)
    }

    /// Recompute the digest of the stored bytes and compare it to the record.
    ///
    /// A missing file is an I/O error, not `false`.
    pub fn verify(&self, artifact: &Artifact) -> Result<bool, ArtifactError> {
        let bytes = read_bytes(&artifact.path)?;
        Ok(sha256_hex(&bytes) == artifact.sha256)
    }

    /// Return the stored bytes only if they still match the recorded digest.
    pub fn read_verified(&self, artifact: &Artifact) -> Result<Vec<u8>, ArtifactError> {
        let bytes = read_bytes(&artifact.path)?;
        let actual = sha256_hex(&bytes);
        if actual != artifact.sha256 {
            tracing::warn!(
                run_id = %artifact.run_id,
                kind = artifact.kind.as_str(),
                "artifact digest mismatch"
            );
            return Err(ArtifactError::Integrity {
                path: artifact.path.clone(),
                expected: artifact.sha256.clone(),
                actual,
            });
        }
        Ok(bytes)
    }
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, ArtifactError> {
    fs::read(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })
}
