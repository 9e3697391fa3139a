use std::path::{Component, Path};

use thiserror::Error;

/// Key of the scan root itself in the parent-resolution map.
pub const ROOT_KEY: &str = ".";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is not under the scan root")]
    OutsideRoot,
    #[error("relative path is empty")]
    Empty,
    #[error("path contains unsupported component")]
    UnsupportedComponent,
    #[error("path component is not valid UTF-8: {0}")]
    NonUtf8(String),
}

/// Forward-slash key of `path` relative to `root`, e.g. `docs/report.txt`.
pub fn relative_key(root: &Path, path: &Path) -> Result<String, PathError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| PathError::OutsideRoot)?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| PathError::NonUtf8(part.to_string_lossy().into_owned()))?;
                parts.push(part);
            }
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

pub fn parent_key(key: &str) -> &str {
    match key.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent,
        _ => ROOT_KEY,
    }
}
