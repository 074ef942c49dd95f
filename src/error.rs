use std::path::PathBuf;

use thiserror::Error;

/// Precondition failures that abort an operation before any file is touched.
///
/// These travel inside `anyhow::Error`; use [`precondition`] to pull one
/// back out when the caller needs to branch on the cause.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeployError {
    #[error("mod not found in store: {0}")]
    ModNotFound(String),
    #[error("manifest.json not found in {}", .0.display())]
    ManifestNotFound(PathBuf),
    #[error("no game target configured; set the install folder first")]
    NoTargetRoot,
    #[error("target root does not exist: {}", .0.display())]
    TargetRootMissing(PathBuf),
    #[error("manifest for {0} lists no files")]
    EmptyFileList(String),
    #[error("restore point not found: {0}")]
    RestorePointNotFound(String),
    #[error("invalid mod name: {0:?}")]
    InvalidModName(String),
}

pub fn precondition(err: &anyhow::Error) -> Option<&DeployError> {
    err.downcast_ref::<DeployError>()
}
