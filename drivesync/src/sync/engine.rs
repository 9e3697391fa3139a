use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use super::gateway::RemoteGateway;
use super::paths::{ROOT_KEY, parent_key};
use super::scanner::{ItemKind, LocalEntry, ScanError, scan};
use super::state::{FolderMapping, ProcessedItem, StateStore};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub source_root: PathBuf,
    pub target_folder_id: String,
    /// Log intended actions without touching the remote side or the state store.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub relative_path: String,
    pub kind: ItemKind,
    pub reason: String,
}

/// What happened to a single local entry during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    FolderMapped {
        remote_id: String,
        from_state: bool,
        state_write_failed: bool,
    },
    FileUnchanged,
    FileUploaded {
        remote_id: String,
        state_write_failed: bool,
    },
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub dry_run: bool,
    pub folders_from_state: usize,
    pub folders_resolved: usize,
    pub uploaded: usize,
    pub skipped_unchanged: usize,
    /// Remote operations that succeeded but could not be recorded locally.
    pub state_write_errors: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    fn record(&mut self, entry: &LocalEntry, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::FolderMapped {
                from_state,
                state_write_failed,
                ..
            } => {
                if from_state {
                    self.folders_from_state += 1;
                } else {
                    self.folders_resolved += 1;
                }
                if state_write_failed {
                    self.state_write_errors += 1;
                }
            }
            EntryOutcome::FileUnchanged => self.skipped_unchanged += 1,
            EntryOutcome::FileUploaded {
                state_write_failed, ..
            } => {
                self.uploaded += 1;
                if state_write_failed {
                    self.state_write_errors += 1;
                }
            }
            EntryOutcome::Failed(reason) => self.failures.push(SyncFailure {
                relative_path: entry.relative_path.clone(),
                kind: entry.kind,
                reason,
            }),
        }
    }

    fn log_summary(&self) {
        for failure in &self.failures {
            warn!(
                path = %failure.relative_path,
                kind = failure.kind.as_str(),
                reason = %failure.reason,
                "entry failed"
            );
        }
        info!(
            dry_run = self.dry_run,
            uploaded = self.uploaded,
            skipped = self.skipped_unchanged,
            failed = self.failed(),
            folders_from_state = self.folders_from_state,
            folders_resolved = self.folders_resolved,
            state_write_errors = self.state_write_errors,
            "sync finished"
        );
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dry_run {
            write!(f, "[dry run] ")?;
        }
        write!(
            f,
            "uploaded: {}, skipped: {}, failed: {}",
            self.uploaded,
            self.skipped_unchanged,
            self.failed()
        )
    }
}

pub fn dry_run_placeholder(relative_path: &str) -> String {
    format!("dry-run:{relative_path}")
}

/// One-way mirror of a local folder into a remote folder.
///
/// Entries are processed in scan order, so every folder is resolved before
/// its contents. A folder that cannot be resolved causes everything beneath
/// it to be reported as failed. Nothing is ever deleted remotely.
pub struct SyncEngine<'a> {
    gateway: &'a dyn RemoteGateway,
    state: &'a dyn StateStore,
    options: SyncOptions,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        gateway: &'a dyn RemoteGateway,
        state: &'a dyn StateStore,
        options: SyncOptions,
    ) -> Self {
        Self {
            gateway,
            state,
            options,
        }
    }

    pub async fn run(&self) -> Result<SyncReport, ScanError> {
        let entries = scan(&self.options.source_root)?;
        info!(
            source = %self.options.source_root.display(),
            target = %self.options.target_folder_id,
            dry_run = self.options.dry_run,
            "starting sync"
        );

        // relative path -> remote folder id, for this run only
        let mut parents = HashMap::from([(
            ROOT_KEY.to_string(),
            self.options.target_folder_id.clone(),
        )]);
        let mut report = SyncReport {
            dry_run: self.options.dry_run,
            ..SyncReport::default()
        };

        for entry in entries {
            let outcome = self.process_entry(&entry, &mut parents).await;
            report.record(&entry, outcome);
        }

        report.log_summary();
        Ok(report)
    }

    async fn process_entry(
        &self,
        entry: &LocalEntry,
        parents: &mut HashMap<String, String>,
    ) -> EntryOutcome {
        let parent = parent_key(&entry.relative_path);
        let Some(parent_id) = parents.get(parent).cloned() else {
            warn!(
                path = %entry.relative_path,
                parent,
                "parent folder was not resolved, skipping"
            );
            return EntryOutcome::Failed(format!("parent folder '{parent}' was not resolved"));
        };

        match entry.kind {
            ItemKind::Folder => {
                let outcome = self.resolve_folder(entry, &parent_id).await;
                if let EntryOutcome::FolderMapped { remote_id, .. } = &outcome {
                    parents.insert(entry.relative_path.clone(), remote_id.clone());
                }
                outcome
            }
            ItemKind::File => self.sync_file(entry, &parent_id).await,
        }
    }

    async fn resolve_folder(&self, entry: &LocalEntry, parent_id: &str) -> EntryOutcome {
        let path = entry.relative_path.as_str();
        match self.state.get_folder_mapping(path).await {
            Ok(Some(mapping)) => {
                debug!(path, remote_id = %mapping.remote_folder_id, "folder mapped from state");
                return EntryOutcome::FolderMapped {
                    remote_id: mapping.remote_folder_id,
                    from_state: true,
                    state_write_failed: false,
                };
            }
            Ok(None) => {}
            Err(err) => {
                warn!(path, error = %err, "folder mapping lookup failed, resolving remotely");
            }
        }

        if self.options.dry_run {
            info!(path, parent_id, "[dry run] would find or create remote folder");
            return EntryOutcome::FolderMapped {
                remote_id: dry_run_placeholder(path),
                from_state: false,
                state_write_failed: false,
            };
        }

        match self.gateway.find_or_create_folder(parent_id, &entry.name).await {
            Ok(remote_id) => {
                let mapping = FolderMapping {
                    relative_path: path.to_string(),
                    remote_folder_id: remote_id.clone(),
                };
                let state_write_failed = match self.state.put_folder_mapping(&mapping).await {
                    Ok(()) => false,
                    Err(err) => {
                        error!(path, remote_id = %remote_id, error = %err, "failed to record folder mapping");
                        true
                    }
                };
                EntryOutcome::FolderMapped {
                    remote_id,
                    from_state: false,
                    state_write_failed,
                }
            }
            Err(err) => {
                error!(path, error = %err, "failed to resolve remote folder, its contents will be skipped");
                EntryOutcome::Failed(err.to_string())
            }
        }
    }

    async fn sync_file(&self, entry: &LocalEntry, parent_id: &str) -> EntryOutcome {
        let path = entry.relative_path.as_str();
        let previous = match self.state.get_processed_item(path).await {
            Ok(previous) => previous,
            Err(err) => {
                error!(path, error = %err, "state lookup failed, not uploading");
                return EntryOutcome::Failed(format!("state lookup failed: {err}"));
            }
        };

        match &previous {
            Some(prev) if prev.matches(entry.size, entry.modified_time) => {
                debug!(path, "unchanged since last upload");
                return EntryOutcome::FileUnchanged;
            }
            Some(prev) => info!(
                path,
                old_size = prev.local_size,
                new_size = entry.size,
                old_mtime = prev.local_modified_time,
                new_mtime = entry.modified_time,
                "file changed, uploading new copy"
            ),
            None => info!(path, size = entry.size, "new file, uploading"),
        }

        if self.options.dry_run {
            info!(path, parent_id, size = entry.size, "[dry run] would upload file");
            return EntryOutcome::FileUploaded {
                remote_id: dry_run_placeholder(path),
                state_write_failed: false,
            };
        }

        match self
            .gateway
            .upload_content(&entry.full_path, &entry.name, parent_id)
            .await
        {
            Ok(uploaded) => {
                let item = ProcessedItem {
                    relative_path: path.to_string(),
                    remote_id: Some(uploaded.id.clone()),
                    local_size: entry.size,
                    local_modified_time: entry.modified_time,
                    remote_checksum: uploaded.checksum,
                };
                let state_write_failed = match self.state.put_processed_item(&item).await {
                    Ok(()) => false,
                    Err(err) => {
                        error!(path, remote_id = %uploaded.id, error = %err, "failed to record uploaded file");
                        true
                    }
                };
                info!(path, remote_id = %uploaded.id, "uploaded");
                EntryOutcome::FileUploaded {
                    remote_id: uploaded.id,
                    state_write_failed,
                }
            }
            Err(err) => {
                error!(path, error = %err, "upload failed, previous record kept");
                EntryOutcome::Failed(err.to_string())
            }
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
