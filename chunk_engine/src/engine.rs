use dav_lib::{
    normalize_path, BlobChannel, BlobHandle, ChunkFailure, DavError, DavResult, NamespaceId,
    TransferFailureDetail, TransferOp, ROOT_PATH,
};
use log::{error, info, warn};
use meta_store::{FileRecord, FileState, FolderState, MetaStoreDB};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{EngineConfig, PathLockMgr, TransferOrchestrator};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileHandle {
    pub id: i64,
    pub path: String,
    pub size: u64,
    pub chunk_count: u32,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FolderHandle {
    pub id: i64,
    pub path: String,
    pub namespace_id: NamespaceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub name: String,
    pub is_folder: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Unfinished files whose blobs and rows were removed.
    pub rolled_back_files: Vec<String>,
    /// Unfinished files that still hold blobs the channel refused to delete.
    /// Their rows stay so a later run can retry.
    pub retained_files: Vec<(String, Vec<BlobHandle>)>,
    /// Folder rows whose namespace was never attached.
    pub removed_folders: Vec<String>,
}

/// The storage engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChunkEngine {
    pub(crate) db: Arc<MetaStoreDB>,
    pub(crate) transfer: Arc<TransferOrchestrator>,
    pub(crate) locks: PathLockMgr,
    pub(crate) config: EngineConfig,
}

impl ChunkEngine {
    pub fn new(
        db: Arc<MetaStoreDB>,
        channel: Arc<dyn BlobChannel>,
        config: EngineConfig,
    ) -> DavResult<Self> {
        config.validate()?;
        let transfer = Arc::new(TransferOrchestrator::new(
            channel,
            config.max_in_flight,
            config.call_timeout(),
        ));
        Ok(Self {
            db,
            transfer,
            locks: PathLockMgr::new(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn meta_db(&self) -> &Arc<MetaStoreDB> {
        &self.db
    }

    /// Metadata of the complete file at `path`, without touching the channel.
    pub fn stat_file(&self, path: &str) -> DavResult<FileRecord> {
        let path = normalize_path(path)?;
        self.db.get_complete_file(&path)
    }

    /// Direct children of a folder: folders first, then complete files, each by name.
    pub fn list_folder(&self, path: &str) -> DavResult<Vec<ListEntry>> {
        let path = normalize_path(path)?;
        let folder = match self.db.get_folder_by_path(&path) {
            Ok(folder) => folder,
            // the root row only appears with the first folder or file
            Err(e) if e.is_not_found() && path == ROOT_PATH => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        if folder.state != FolderState::Active {
            return Err(DavError::NotFound(format!("folder {}", path)));
        }

        let mut entries: Vec<ListEntry> = self
            .db
            .list_child_folders(&path)?
            .into_iter()
            .filter(|f| f.state == FolderState::Active)
            .map(|f| ListEntry {
                name: f.name,
                is_folder: true,
                size: 0,
            })
            .collect();

        let mut files: Vec<ListEntry> = self
            .db
            .list_folder_files(folder.id)?
            .into_iter()
            .filter(|f| f.state == FileState::Complete)
            .map(|f| ListEntry {
                name: f.name,
                is_folder: false,
                size: f.size,
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        entries.append(&mut files);
        Ok(entries)
    }

    /// Startup recovery. Every file not `complete` is rolled back, since a crash
    /// may have happened before or after its remote commit. Must run before the
    /// engine serves requests.
    pub async fn reconcile(&self) -> DavResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for file in self.db.list_unfinished_files()? {
            let _guard = self.locks.lock_exclusive(&file.path).await;
            warn!(
                "ChunkEngine: rolling back unfinished file {} (id {}, state {})",
                file.path,
                file.id,
                file.state.as_str()
            );
            match self.purge_file(&file).await {
                Ok(()) => report.rolled_back_files.push(file.path.clone()),
                Err(e) => {
                    let left: Vec<BlobHandle> = self
                        .db
                        .list_chunks(file.id)?
                        .into_iter()
                        .filter_map(|c| c.handle)
                        .collect();
                    error!(
                        "ChunkEngine: reconcile of {} incomplete, {} blob(s) retained! {}",
                        file.path,
                        left.len(),
                        e
                    );
                    report.retained_files.push((file.path.clone(), left));
                }
            }
        }

        for folder in self.db.list_pending_folders()? {
            let _guard = self.locks.lock_exclusive(&folder.path).await;
            warn!(
                "ChunkEngine: removing folder {} left without namespace, a remote namespace may be orphaned",
                folder.path
            );
            self.db.remove_folder(folder.id)?;
            report.removed_folders.push(folder.path);
        }

        info!(
            "ChunkEngine: reconcile done, rolled back {}, retained {}, removed folders {}",
            report.rolled_back_files.len(),
            report.retained_files.len(),
            report.removed_folders.len()
        );
        Ok(report)
    }

    /// Delete a file's remote blobs and then its rows. Chunk rows of blobs
    /// that could not be deleted are kept, together with the file row, in
    /// `deleting` state so the blobs stay tracked.
    pub(crate) async fn purge_file(&self, file: &FileRecord) -> DavResult<()> {
        if file.state != FileState::Deleting {
            self.db.set_file_state(file.id, FileState::Deleting)?;
        }

        let chunks = self.db.list_chunks(file.id)?;
        let mut seq_by_handle: HashMap<BlobHandle, u32> = HashMap::new();
        for chunk in chunks.iter() {
            if let Some(handle) = chunk.handle.as_ref() {
                seq_by_handle.insert(handle.clone(), chunk.seq);
            }
        }

        let results = self
            .transfer
            .delete_all(seq_by_handle.keys().cloned().collect())
            .await;

        let mut deleted = Vec::new();
        let mut failures = Vec::new();
        for (handle, result) in results {
            let seq = seq_by_handle.get(&handle).copied().unwrap_or_default();
            match result {
                Ok(()) => deleted.push(seq),
                Err(e) => failures.push(ChunkFailure {
                    seq,
                    handle: Some(handle),
                    reason: e.to_string(),
                }),
            }
        }

        if failures.is_empty() {
            self.db.remove_file(file.id)?;
            info!(
                "ChunkEngine: removed file {} (id {}, {} chunk(s))",
                file.path,
                file.id,
                chunks.len()
            );
            return Ok(());
        }

        self.db.remove_chunks(file.id, &deleted)?;
        warn!(
            "ChunkEngine: file {} (id {}) kept in deleting state, {} blob(s) not deleted",
            file.path,
            file.id,
            failures.len()
        );
        Err(DavError::TransferFailure(TransferFailureDetail::new(
            TransferOp::Delete,
            failures,
        )))
    }
}
