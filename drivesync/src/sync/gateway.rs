use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use drivesync_core::{DriveClient, DriveError, DriveFile, aligned_chunk_size, children_query, folder_query};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

use super::retry::{RetryError, RetryPolicy, retry_with_policy};
use super::scanner::ItemKind;

const FOLDER_LOOKUP_FIELDS: &str = "nextPageToken, files(id, name)";
const CHILDREN_FIELDS: &str = "nextPageToken, files(id, name, mimeType, md5Checksum, modifiedTime)";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Persistent {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: DriveError,
    },
    #[error("{operation} failed: {source}")]
    NonRetryable {
        operation: &'static str,
        #[source]
        source: DriveError,
    },
}

impl GatewayError {
    fn from_retry(operation: &'static str, err: RetryError<DriveError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => GatewayError::Persistent {
                operation,
                attempts,
                source: last,
            },
            RetryError::Aborted { error, .. } => GatewayError::NonRetryable {
                operation,
                source: error,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChild {
    pub id: String,
    pub name: String,
    pub kind: ItemKind,
    pub checksum: Option<String>,
    /// Seconds since the Unix epoch.
    pub modified_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub id: String,
    pub name: String,
    pub size: Option<u64>,
    pub trashed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedObject {
    pub id: String,
    pub checksum: Option<String>,
}

/// Remote storage as seen by the sync engine and verifier.
///
/// Every call retries transient failures (rate limits, 5xx, timeouts) with
/// exponential backoff before reporting an error.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Returns the id of the folder `name` under `parent_id`, creating it when absent.
    async fn find_or_create_folder(&self, parent_id: &str, name: &str)
    -> Result<String, GatewayError>;

    /// Non-trashed children of `folder_id`, keyed by name.
    async fn list_children(
        &self,
        folder_id: &str,
    ) -> Result<BTreeMap<String, RemoteChild>, GatewayError>;

    /// Creates a new remote file named `name` under `parent_id` with the contents of `local_path`.
    async fn upload_content(
        &self,
        local_path: &Path,
        name: &str,
        parent_id: &str,
    ) -> Result<UploadedObject, GatewayError>;

    /// Metadata of `remote_id`, or `None` if the object does not exist.
    async fn get_metadata(
        &self,
        remote_id: &str,
        fields: &[&str],
    ) -> Result<Option<RemoteMetadata>, GatewayError>;
}

pub struct DriveGateway {
    client: DriveClient,
    policy: RetryPolicy,
    chunk_size: usize,
}

enum FolderResolution {
    Found { id: String, duplicates: usize },
    Created(String),
}

impl DriveGateway {
    pub fn new(client: DriveClient, policy: RetryPolicy, chunk_size: usize) -> Self {
        Self {
            client,
            policy,
            chunk_size: aligned_chunk_size(chunk_size),
        }
    }
}

fn parse_modified_time(value: &str) -> Option<f64> {
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .map(|dt| dt.unix_timestamp_nanos() as f64 / 1_000_000_000.0)
}

fn remote_child(file: DriveFile) -> RemoteChild {
    let kind = if file.is_folder() {
        ItemKind::Folder
    } else {
        ItemKind::File
    };
    RemoteChild {
        modified_time: file.modified_time.as_deref().and_then(parse_modified_time),
        id: file.id,
        name: file.name,
        kind,
        checksum: file.md5_checksum,
    }
}

#[async_trait]
impl RemoteGateway for DriveGateway {
    async fn find_or_create_folder(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<String, GatewayError> {
        let client = &self.client;
        // Each attempt looks up again before creating, so a create that
        // succeeded remotely but failed in transit is not repeated.
        let resolution = retry_with_policy(
            &self.policy,
            "find_or_create_folder",
            DriveError::is_retryable,
            move || async move {
                let found = client
                    .list_files_all(&folder_query(parent_id, name), Some(FOLDER_LOOKUP_FIELDS))
                    .await?;
                let duplicates = found.len();
                if let Some(id) = found.into_iter().map(|file| file.id).min() {
                    return Ok(FolderResolution::Found { id, duplicates });
                }
                let created = client.create_folder(name, parent_id).await?;
                Ok::<_, DriveError>(FolderResolution::Created(created.id))
            },
        )
        .await
        .map_err(|err| GatewayError::from_retry("find_or_create_folder", err))?;

        match resolution {
            FolderResolution::Found { id, duplicates } => {
                if duplicates > 1 {
                    warn!(
                        parent_id,
                        name,
                        duplicates,
                        chosen = %id,
                        "multiple remote folders share this name, using the smallest id"
                    );
                }
                debug!(parent_id, name, folder_id = %id, "found remote folder");
                Ok(id)
            }
            FolderResolution::Created(id) => {
                info!(parent_id, name, folder_id = %id, "created remote folder");
                Ok(id)
            }
        }
    }

    async fn list_children(
        &self,
        folder_id: &str,
    ) -> Result<BTreeMap<String, RemoteChild>, GatewayError> {
        let client = &self.client;
        let files = retry_with_policy(
            &self.policy,
            "list_children",
            DriveError::is_retryable,
            move || async move {
                client
                    .list_files_all(&children_query(folder_id), Some(CHILDREN_FIELDS))
                    .await
            },
        )
        .await
        .map_err(|err| GatewayError::from_retry("list_children", err))?;

        Ok(files
            .into_iter()
            .map(|file| (file.name.clone(), remote_child(file)))
            .collect())
    }

    async fn upload_content(
        &self,
        local_path: &Path,
        name: &str,
        parent_id: &str,
    ) -> Result<UploadedObject, GatewayError> {
        let client = &self.client;
        let chunk_size = self.chunk_size;
        let uploaded = retry_with_policy(
            &self.policy,
            "upload_content",
            DriveError::is_retryable,
            move || async move {
                client
                    .upload_file(local_path, name, parent_id, chunk_size, |sent, total| {
                        let percent = if total == 0 { 100 } else { sent * 100 / total };
                        debug!(name, sent, total, percent, "upload progress");
                    })
                    .await
            },
        )
        .await
        .map_err(|err| GatewayError::from_retry("upload_content", err))?;

        Ok(UploadedObject {
            id: uploaded.id,
            checksum: uploaded.md5_checksum,
        })
    }

    async fn get_metadata(
        &self,
        remote_id: &str,
        fields: &[&str],
    ) -> Result<Option<RemoteMetadata>, GatewayError> {
        let client = &self.client;
        let result = retry_with_policy(
            &self.policy,
            "get_metadata",
            DriveError::is_retryable,
            move || async move { client.get_file(remote_id, Some(fields)).await },
        )
        .await;

        match result {
            Ok(file) => Ok(Some(RemoteMetadata {
                id: file.id,
                name: file.name,
                size: file.size,
                trashed: file.trashed.unwrap_or(false),
            })),
            Err(RetryError::Aborted { error, .. }) if error.is_not_found() => {
                debug!(remote_id, "remote object not found");
                Ok(None)
            }
            Err(err) => Err(GatewayError::from_retry("get_metadata", err)),
        }
    }
}

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;
