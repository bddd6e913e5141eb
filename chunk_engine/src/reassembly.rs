use dav_lib::{normalize_path, BlobHandle, DavError, DavResult};
use log::{debug, warn};
use meta_store::{ChunkRecord, FileRecord};

use crate::ChunkEngine;

// A read racing an overwrite can find the old blobs already removed.
const SUPERSEDED_READ_RETRIES: usize = 3;

/// Ordered `(seq, handle)` pairs of a file, after checking the chunk layout.
fn fetch_plan(file: &FileRecord, chunks: &[ChunkRecord]) -> DavResult<Vec<(u32, BlobHandle)>> {
    if chunks.is_empty() {
        return Err(DavError::CorruptMetadata(format!(
            "file {} has no chunks",
            file.path
        )));
    }

    let mut plan = Vec::with_capacity(chunks.len());
    let mut offset = 0u64;
    for (expected, chunk) in chunks.iter().enumerate() {
        if chunk.seq as usize != expected {
            return Err(DavError::CorruptMetadata(format!(
                "file {} chunk sequence broken at {}, found {}",
                file.path, expected, chunk.seq
            )));
        }
        if chunk.offset != offset {
            return Err(DavError::CorruptMetadata(format!(
                "file {} chunk {} at offset {}, expected {}",
                file.path, chunk.seq, chunk.offset, offset
            )));
        }
        let handle = chunk.handle.clone().ok_or_else(|| {
            DavError::CorruptMetadata(format!(
                "file {} chunk {} has no remote handle",
                file.path, chunk.seq
            ))
        })?;
        offset += chunk.size;
        plan.push((chunk.seq, handle));
    }

    if offset != file.size {
        return Err(DavError::CorruptMetadata(format!(
            "file {} chunks cover {} bytes, file declares {}",
            file.path, offset, file.size
        )));
    }
    Ok(plan)
}

impl ChunkEngine {
    /// Rebuild the complete file at `path` byte for byte.
    ///
    /// Either every chunk arrives and the whole content is returned, or nothing
    /// is: missing chunks are reported as `PartialContent`.
    pub async fn read_file(&self, path: &str) -> DavResult<Vec<u8>> {
        let path = normalize_path(path)?;
        let mut file = self.db.get_complete_file(&path)?;
        let mut retries = 0;

        loop {
            match self.read_file_record(&file).await {
                Err(e @ DavError::PartialContent(_)) | Err(e @ DavError::CorruptMetadata(_)) => {
                    // replaced and purged while reading: read the new content
                    let current = self.db.get_complete_file(&path)?;
                    if current.id == file.id || retries >= SUPERSEDED_READ_RETRIES {
                        return Err(e);
                    }
                    debug!(
                        "ChunkEngine: {} replaced during read, retrying with file {}",
                        path, current.id
                    );
                    retries += 1;
                    file = current;
                }
                other => return other,
            }
        }
    }

    async fn read_file_record(&self, file: &FileRecord) -> DavResult<Vec<u8>> {
        let chunks = self.db.list_chunks(file.id)?;
        let plan = fetch_plan(file, &chunks)?;

        let mut data = Vec::with_capacity(file.size as usize);
        let mut missing = Vec::new();
        for ((seq, result), chunk) in self
            .transfer
            .fetch_all(plan)
            .await
            .into_iter()
            .zip(chunks.iter())
        {
            match result {
                Ok(payload) => {
                    if payload.len() as u64 != chunk.size {
                        return Err(DavError::CorruptMetadata(format!(
                            "file {} chunk {} is {} bytes, expected {}",
                            file.path,
                            seq,
                            payload.len(),
                            chunk.size
                        )));
                    }
                    if missing.is_empty() {
                        data.extend_from_slice(&payload);
                    }
                }
                Err(e) => {
                    warn!(
                        "ChunkEngine: chunk {} of {} unavailable! {}",
                        seq, file.path, e
                    );
                    missing.push(seq);
                }
            }
        }

        if !missing.is_empty() {
            return Err(DavError::PartialContent(missing));
        }
        if data.len() as u64 != file.size {
            return Err(DavError::CorruptMetadata(format!(
                "file {} rebuilt to {} bytes, expected {}",
                file.path,
                data.len(),
                file.size
            )));
        }
        debug!(
            "ChunkEngine: read {} ({} bytes, {} chunk(s))",
            file.path,
            data.len(),
            chunks.len()
        );
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meta_store::{ChunkState, FileState};

    fn record(size: u64) -> FileRecord {
        FileRecord {
            id: 1,
            folder_id: 1,
            name: "a".to_string(),
            path: "/a".to_string(),
            size,
            content_type: "x".to_string(),
            state: FileState::Complete,
            create_time: 0,
            update_time: 0,
        }
    }

    fn chunk(seq: u32, size: u64, offset: u64, handle: Option<&str>) -> ChunkRecord {
        ChunkRecord {
            id: seq as i64 + 1,
            file_id: 1,
            seq,
            size,
            offset,
            handle: handle.map(BlobHandle::new),
            state: ChunkState::Sent,
        }
    }

    #[test]
    fn test_fetch_plan_layout_checks() {
        let file = record(10);
        let good = vec![chunk(0, 6, 0, Some("h0")), chunk(1, 4, 6, Some("h1"))];
        let plan = fetch_plan(&file, &good).unwrap();
        assert_eq!(plan[1], (1, BlobHandle::new("h1")));

        let gap = vec![chunk(0, 6, 0, Some("h0")), chunk(2, 4, 6, Some("h1"))];
        assert!(matches!(fetch_plan(&file, &gap), Err(DavError::CorruptMetadata(_))));

        let no_handle = vec![chunk(0, 6, 0, Some("h0")), chunk(1, 4, 6, None)];
        assert!(matches!(
            fetch_plan(&file, &no_handle),
            Err(DavError::CorruptMetadata(_))
        ));

        let short = vec![chunk(0, 6, 0, Some("h0"))];
        assert!(matches!(fetch_plan(&file, &short), Err(DavError::CorruptMetadata(_))));
        assert!(fetch_plan(&file, &[]).is_err());
    }
}
