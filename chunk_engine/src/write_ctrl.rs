use dav_lib::{
    ancestor_chain, normalize_path, parent_path, path_name, plan_chunks, BlobHandle, ChunkFailure,
    ChunkPlan, DavError, DavResult, NamespaceId, TransferFailureDetail, TransferOp,
    DEFAULT_CONTENT_TYPE,
};
use log::{debug, error, info, warn};
use meta_store::{FileRecord, FileState, FolderState};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;

use crate::{ChunkEngine, FileHandle, PathGuard};

struct WriteJob {
    path: String,
    parent: String,
    name: String,
    size: u64,
    content_type: String,
    plans: Vec<ChunkPlan>,
    payloads: Vec<(u32, Vec<u8>)>,
}

/// Split the content stream into one buffer per planned chunk. The stream must
/// hold exactly `size` bytes.
async fn read_payloads<R>(
    reader: &mut R,
    plans: &[ChunkPlan],
    size: u64,
) -> DavResult<Vec<(u32, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut payloads = Vec::with_capacity(plans.len());
    for plan in plans.iter() {
        let len = usize::try_from(plan.size).map_err(|_| {
            DavError::InvalidInput(format!("chunk size {} too large", plan.size))
        })?;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                DavError::InvalidInput(format!(
                    "content ended before the declared {} bytes",
                    size
                ))
            } else {
                DavError::from(e)
            }
        })?;
        payloads.push((plan.seq, buf));
    }

    let mut probe = [0u8; 1];
    if reader.read(&mut probe).await? != 0 {
        return Err(DavError::InvalidInput(format!(
            "content longer than the declared {} bytes",
            size
        )));
    }
    Ok(payloads)
}

fn caller_gone(alive: &mut oneshot::Receiver<()>) -> bool {
    matches!(alive.try_recv(), Err(oneshot::error::TryRecvError::Closed))
}

impl ChunkEngine {
    /// Store `total_size` bytes read from `reader` at `path`.
    ///
    /// The content becomes visible only once every chunk is stored remotely. Any
    /// failure, or the caller dropping this future before commit, rolls the
    /// write back. An existing file at `path` stays readable until the new one
    /// commits and is removed afterwards.
    pub async fn write_file<R>(
        &self,
        path: &str,
        total_size: i64,
        content_type: Option<&str>,
        mut reader: R,
    ) -> DavResult<FileHandle>
    where
        R: AsyncRead + Unpin,
    {
        let path = normalize_path(path)?;
        let parent = parent_path(&path)
            .ok_or_else(|| DavError::InvalidInput("cannot write a file at /".to_string()))?;
        let plans = plan_chunks(total_size, self.config.max_chunk_size)?;
        let size = total_size as u64;
        let payloads = read_payloads(&mut reader, &plans, size).await?;

        if self.config.auto_create_parents {
            self.ensure_folder_chain(&parent).await?;
        }

        let (parent_guard, file_guard) = self.lock_for_file(&path).await?;

        let job = WriteJob {
            name: path_name(&path).to_string(),
            path,
            parent,
            size,
            content_type: content_type.unwrap_or(DEFAULT_CONTENT_TYPE).to_string(),
            plans,
            payloads,
        };

        // The job owns the guards so they are held until it ends, even when the
        // caller goes away.
        let (alive_tx, alive_rx) = oneshot::channel::<()>();
        let engine = self.clone();
        let task = tokio::spawn(async move {
            let result = engine.run_write(job, alive_rx).await;
            drop(file_guard);
            drop(parent_guard);
            result
        });

        let result = task
            .await
            .map_err(|e| DavError::Internal(format!("write task failed: {}", e)))?;
        drop(alive_tx);
        result
    }

    async fn run_write(
        &self,
        job: WriteJob,
        mut alive: oneshot::Receiver<()>,
    ) -> DavResult<FileHandle> {
        let folder = self.db.get_folder_by_path(&job.parent)?;
        if folder.state != FolderState::Active {
            return Err(DavError::NotFound(format!("folder {}", job.parent)));
        }
        let namespace: NamespaceId = folder.namespace_id.clone().ok_or_else(|| {
            DavError::CorruptMetadata(format!("active folder {} has no namespace", folder.path))
        })?;

        let file = self.db.create_file_plan(
            folder.id,
            &job.name,
            &job.path,
            job.size,
            &job.content_type,
            &job.plans,
        )?;
        info!(
            "ChunkEngine: planned {} as file {}, {} bytes in {} chunk(s)",
            file.path,
            file.id,
            file.size,
            job.plans.len()
        );

        if let Err(e) = self.db.set_file_state(file.id, FileState::Transferring) {
            return Err(self.rollback_write(&file, Vec::new(), e).await);
        }

        let db = self.db.clone();
        let file_id = file.id;
        let outcomes = self
            .transfer
            .send_all(&namespace, &job.name, job.payloads, |seq, handle| {
                // commit records every handle again; this copy lets recovery
                // find blobs sent before a crash
                if let Err(e) = db.set_chunk_handle(file_id, seq, handle) {
                    warn!(
                        "ChunkEngine: record handle of chunk {} of file {} failed! {}",
                        seq, file_id, e
                    );
                }
            })
            .await;

        let mut sent = Vec::new();
        let mut failures = Vec::new();
        for (seq, outcome) in outcomes {
            match outcome {
                Ok(handle) => sent.push((seq, handle)),
                Err(e) => failures.push(ChunkFailure {
                    seq,
                    handle: None,
                    reason: e.to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            let cause =
                DavError::TransferFailure(TransferFailureDetail::new(TransferOp::Send, failures));
            return Err(self.rollback_write(&file, sent, cause).await);
        }

        if caller_gone(&mut alive) {
            warn!(
                "ChunkEngine: writer of {} went away before commit, rolling back",
                file.path
            );
            let cause = DavError::Internal(format!("write of {} cancelled", file.path));
            return Err(self.rollback_write(&file, sent, cause).await);
        }

        let superseded = match self.db.commit_file(file.id, &sent) {
            Ok(superseded) => superseded,
            Err(e) => return Err(self.rollback_write(&file, sent, e).await),
        };
        info!(
            "ChunkEngine: committed {} (file {}, {} chunk(s))",
            file.path,
            file.id,
            sent.len()
        );

        if let Some(old) = superseded {
            debug!(
                "ChunkEngine: removing superseded file {} of {}",
                old.id, old.path
            );
            if let Err(e) = self.purge_file(&old).await {
                warn!(
                    "ChunkEngine: superseded file {} of {} left for reconcile! {}",
                    old.id, old.path, e
                );
            }
        }

        Ok(FileHandle {
            id: file.id,
            path: file.path,
            size: file.size,
            chunk_count: sent.len() as u32,
            content_type: file.content_type,
        })
    }

    /// Delete every blob sent for `file`, then its rows. Returns `cause`, or
    /// `Orphaned` wrapping it when some blobs could not be deleted.
    async fn rollback_write(
        &self,
        file: &FileRecord,
        sent: Vec<(u32, BlobHandle)>,
        cause: DavError,
    ) -> DavError {
        let mut handles: Vec<BlobHandle> = sent.into_iter().map(|(_, h)| h).collect();
        match self.db.list_chunks(file.id) {
            Ok(chunks) => {
                for handle in chunks.into_iter().filter_map(|c| c.handle) {
                    if !handles.contains(&handle) {
                        handles.push(handle);
                    }
                }
            }
            Err(e) => warn!(
                "ChunkEngine: list chunks of {} for rollback failed! {}",
                file.path, e
            ),
        }

        warn!(
            "ChunkEngine: rolling back {} (file {}), deleting {} sent blob(s): {}",
            file.path,
            file.id,
            handles.len(),
            cause
        );

        let orphans: Vec<BlobHandle> = self
            .transfer
            .delete_all(handles)
            .await
            .into_iter()
            .filter_map(|(handle, result)| result.err().map(|_| handle))
            .collect();

        if let Err(e) = self.db.remove_file(file.id) {
            warn!(
                "ChunkEngine: remove rows of {} after rollback failed, left for reconcile! {}",
                file.path, e
            );
        }

        if orphans.is_empty() {
            return cause;
        }

        error!(
            "ChunkEngine: rollback of {} left orphaned blobs! {:?}",
            file.path,
            orphans.iter().map(|h| h.as_str()).collect::<Vec<&str>>()
        );
        DavError::Orphaned {
            handles: orphans,
            cause: Box::new(cause),
        }
    }

    /// Remove the complete file at `path`. A missing file is `NotFound` and
    /// changes nothing.
    pub async fn delete_file(&self, path: &str) -> DavResult<()> {
        let path = normalize_path(path)?;
        let _guards = self.lock_for_file(&path).await?;

        let file = self.db.get_complete_file(&path)?;
        info!("ChunkEngine: deleting {} (file {})", file.path, file.id);
        self.purge_file(&file).await
    }

    /// Create every missing folder from the root down to `path`.
    pub(crate) async fn ensure_folder_chain(&self, path: &str) -> DavResult<()> {
        for folder_path in ancestor_chain(path) {
            match self.db.get_folder_by_path(&folder_path) {
                Ok(folder) if folder.state == FolderState::Active => continue,
                Ok(_) => {
                    return Err(DavError::Conflict(format!(
                        "folder {} is still being created",
                        folder_path
                    )))
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }

            match self.create_folder(&folder_path).await {
                Ok(_) => debug!("ChunkEngine: created implicit folder {}", folder_path),
                // lost a race with another creator
                Err(e) if e.is_conflict() => {
                    let existing = self.db.get_folder_by_path(&folder_path)?;
                    if existing.state != FolderState::Active {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub(crate) async fn lock_for_file(&self, path: &str) -> DavResult<(PathGuard, PathGuard)> {
        let parent = parent_path(path)
            .ok_or_else(|| DavError::InvalidInput("/ is not a file".to_string()))?;
        let parent_guard = self.locks.lock_shared(&parent).await;
        let file_guard = self.locks.lock_exclusive(path).await;
        Ok((parent_guard, file_guard))
    }
}
