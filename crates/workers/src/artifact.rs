//! Artifact resolution and delivery.

use std::path::{Component, Path, PathBuf};

use kiln_core::error::CoreError;

use crate::schemas::FileRef;

fn read_failure(path: &Path, e: impl std::fmt::Display) -> CoreError {
    CoreError::ArtifactReadFailure {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

/// Where a file reported by an async worker lives on local disk.
///
/// Returns `None` for references that would escape `output_dir`.
pub fn local_path(output_dir: &Path, file: &FileRef) -> Option<PathBuf> {
    let relative = Path::new(&file.subfolder).join(&file.filename);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || file.filename.is_empty() {
        None
    } else {
        Some(output_dir.join(relative))
    }
}

/// Path reported by a synchronous worker; relative paths are taken
/// relative to the directory the worker was told to write into.
pub fn reported_path(output_dir: &Path, reported: &str) -> PathBuf {
    let path = Path::new(reported);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        output_dir.join(path)
    }
}

/// Copy `source` to `destination`, creating intermediate directories.
/// Without a destination the source path is returned unchanged after
/// checking it exists.
pub async fn deliver(source: &Path, destination: Option<&Path>) -> Result<PathBuf, CoreError> {
    let Some(destination) = destination else {
        return match tokio::fs::metadata(source).await {
            Ok(meta) if meta.is_file() => Ok(source.to_path_buf()),
            Ok(_) => Err(read_failure(source, "not a regular file")),
            Err(e) => Err(read_failure(source, e)),
        };
    };

    let bytes = tokio::fs::read(source)
        .await
        .map_err(|e| read_failure(source, e))?;
    write(destination, &bytes).await
}

/// Write downloaded bytes to `path`, creating intermediate directories.
pub async fn write(path: &Path, bytes: &[u8]) -> Result<PathBuf, CoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| read_failure(path, e))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| read_failure(path, e))?;
    Ok(path.to_path_buf())
}
