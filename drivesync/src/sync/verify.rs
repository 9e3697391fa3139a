use std::collections::HashSet;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::gateway::RemoteGateway;
use super::scanner::{ItemKind, ScanError, scan};
use super::state::StateStore;

const METADATA_FIELDS: &[&str] = &["id", "name", "size", "trashed"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileCheck {
    NotInState,
    MissingRemoteId,
    MetadataUnavailable,
    Trashed,
    SizeMismatch { local: u64, remote: u64 },
    SizeMatch,
    SizeUnknown,
    StateUnreadable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub files_checked: usize,
    pub not_in_state: usize,
    pub missing_remote_id: usize,
    pub metadata_unavailable: usize,
    pub trashed: usize,
    pub size_mismatch: usize,
    pub size_match: usize,
    pub size_unknown: usize,
    pub state_unreadable: usize,
    /// Recorded files no longer present under the source folder.
    pub missing_locally: usize,
}

impl VerifyReport {
    fn record(&mut self, check: &FileCheck) {
        self.files_checked += 1;
        match check {
            FileCheck::NotInState => self.not_in_state += 1,
            FileCheck::MissingRemoteId => self.missing_remote_id += 1,
            FileCheck::MetadataUnavailable => self.metadata_unavailable += 1,
            FileCheck::Trashed => self.trashed += 1,
            FileCheck::SizeMismatch { .. } => self.size_mismatch += 1,
            FileCheck::SizeMatch => self.size_match += 1,
            FileCheck::SizeUnknown => self.size_unknown += 1,
            FileCheck::StateUnreadable => self.state_unreadable += 1,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.files_checked == self.size_match + self.size_unknown && self.missing_locally == 0
    }
}

/// Read-only comparison of local files against the state store and the remote side.
pub struct Verifier<'a> {
    gateway: &'a dyn RemoteGateway,
    state: &'a dyn StateStore,
    source_root: PathBuf,
}

impl<'a> Verifier<'a> {
    pub fn new(
        gateway: &'a dyn RemoteGateway,
        state: &'a dyn StateStore,
        source_root: PathBuf,
    ) -> Self {
        Self {
            gateway,
            state,
            source_root,
        }
    }

    pub async fn run(&self) -> Result<VerifyReport, ScanError> {
        let entries = scan(&self.source_root)?;
        info!(source = %self.source_root.display(), "starting verification");

        let mut report = VerifyReport::default();
        let mut seen = HashSet::new();
        for entry in entries.filter(|entry| entry.kind == ItemKind::File) {
            let check = self.check_file(&entry.relative_path, entry.size).await;
            report.record(&check);
            seen.insert(entry.relative_path);
        }

        match self.state.list_all_processed_items().await {
            Ok(items) => {
                for item in items.iter().filter(|item| !seen.contains(&item.relative_path)) {
                    warn!(path = %item.relative_path, "recorded file is missing locally");
                    report.missing_locally += 1;
                }
            }
            Err(err) => warn!(error = %err, "cannot list recorded files, skipping local presence check"),
        }

        info!(
            files_checked = report.files_checked,
            size_match = report.size_match,
            size_mismatch = report.size_mismatch,
            size_unknown = report.size_unknown,
            not_in_state = report.not_in_state,
            missing_remote_id = report.missing_remote_id,
            metadata_unavailable = report.metadata_unavailable,
            trashed = report.trashed,
            state_unreadable = report.state_unreadable,
            missing_locally = report.missing_locally,
            "verification finished"
        );
        Ok(report)
    }

    async fn check_file(&self, path: &str, local_size: u64) -> FileCheck {
        let item = match self.state.get_processed_item(path).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                warn!(path, "file was never uploaded");
                return FileCheck::NotInState;
            }
            Err(err) => {
                warn!(path, error = %err, "cannot read state record");
                return FileCheck::StateUnreadable;
            }
        };
        let Some(remote_id) = item.remote_id.filter(|id| !id.is_empty()) else {
            warn!(path, "state record has no remote id");
            return FileCheck::MissingRemoteId;
        };

        let metadata = match self.gateway.get_metadata(&remote_id, METADATA_FIELDS).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                warn!(path, remote_id = %remote_id, "remote object not found");
                return FileCheck::MetadataUnavailable;
            }
            Err(err) => {
                warn!(path, remote_id = %remote_id, error = %err, "remote metadata unavailable");
                return FileCheck::MetadataUnavailable;
            }
        };

        if metadata.trashed {
            warn!(path, remote_id = %remote_id, "remote copy is in the trash");
            return FileCheck::Trashed;
        }
        match metadata.size {
            Some(remote) if remote == local_size => {
                debug!(path, size = local_size, "size matches");
                FileCheck::SizeMatch
            }
            Some(remote) => {
                warn!(path, local = local_size, remote, "size mismatch");
                FileCheck::SizeMismatch {
                    local: local_size,
                    remote,
                }
            }
            None => {
                info!(path, "remote size not reported");
                FileCheck::SizeUnknown
            }
        }
    }
}
