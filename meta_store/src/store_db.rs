use dav_lib::{BlobHandle, ChunkPlan, DavError, DavResult, NamespaceId};
use log::{debug, warn};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn db_err(op: &str, e: rusqlite::Error) -> DavError {
    warn!("MetaStoreDB: {} failed! {}", op, e);
    DavError::DbError(format!("{}: {}", op, e))
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

macro_rules! sql_state_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn from_str(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                $name::from_str(s).ok_or(FromSqlError::InvalidType)
            }
        }
    };
}

sql_state_enum!(FolderState {
    Pending => "pending",
    Active => "active",
});

sql_state_enum!(FileState {
    Planning => "planning",
    Transferring => "transferring",
    Complete => "complete",
    Deleting => "deleting",
});

sql_state_enum!(ChunkState {
    Planned => "planned",
    Sent => "sent",
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FolderRecord {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub parent_path: Option<String>,
    pub namespace_id: Option<NamespaceId>,
    pub state: FolderState,
    pub create_time: u64,
    pub update_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub folder_id: i64,
    pub name: String,
    pub path: String,
    pub size: u64,
    pub content_type: String,
    pub state: FileState,
    pub create_time: u64,
    pub update_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRecord {
    pub id: i64,
    pub file_id: i64,
    pub seq: u32,
    pub size: u64,
    pub offset: u64,
    pub handle: Option<BlobHandle>,
    pub state: ChunkState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub folders: u64,
    pub files: u64,
    pub chunks: u64,
}

const FOLDER_COLUMNS: &str =
    "id, name, path, parent_path, namespace_id, state, create_time, update_time";
const FILE_COLUMNS: &str =
    "id, folder_id, name, path, size, content_type, state, create_time, update_time";
const CHUNK_COLUMNS: &str = "id, file_id, seq, size, byte_offset, handle, state";

fn folder_from_row(row: &Row<'_>) -> rusqlite::Result<FolderRecord> {
    Ok(FolderRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        parent_path: row.get(3)?,
        namespace_id: row.get::<_, Option<String>>(4)?.map(NamespaceId::new),
        state: row.get(5)?,
        create_time: row.get::<_, i64>(6)? as u64,
        update_time: row.get::<_, i64>(7)? as u64,
    })
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        folder_id: row.get(1)?,
        name: row.get(2)?,
        path: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        content_type: row.get(5)?,
        state: row.get(6)?,
        create_time: row.get::<_, i64>(7)? as u64,
        update_time: row.get::<_, i64>(8)? as u64,
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<ChunkRecord> {
    Ok(ChunkRecord {
        id: row.get(0)?,
        file_id: row.get(1)?,
        seq: row.get::<_, i64>(2)? as u32,
        size: row.get::<_, i64>(3)? as u64,
        offset: row.get::<_, i64>(4)? as u64,
        handle: row.get::<_, Option<String>>(5)?.map(BlobHandle::new),
        state: row.get(6)?,
    })
}

/// Durable record of folders, files and chunks.
///
/// Every public method acquires the connection for its own duration; multi-row
/// changes run in one transaction. Cascades are explicit: chunks before their
/// file, files before their folder.
pub struct MetaStoreDB {
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl MetaStoreDB {
    pub fn new(db_path: &str) -> DavResult<Self> {
        debug!("MetaStoreDB: open db path: {}", db_path);
        let conn = Connection::open(db_path).map_err(|e| db_err("open db", e))?;
        Self::init(db_path.to_string(), conn)
    }

    pub fn open_in_memory() -> DavResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("open memory db", e))?;
        Self::init(":memory:".to_string(), conn)
    }

    fn init(db_path: String, conn: Connection) -> DavResult<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                path TEXT NOT NULL UNIQUE,
                parent_path TEXT,
                namespace_id TEXT,
                state TEXT NOT NULL,
                create_time INTEGER NOT NULL,
                update_time INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_folders_parent ON folders(parent_path);
            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                folder_id INTEGER NOT NULL REFERENCES folders(id),
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                size INTEGER NOT NULL,
                content_type TEXT NOT NULL,
                state TEXT NOT NULL,
                create_time INTEGER NOT NULL,
                update_time INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_files_folder ON files(folder_id);
            CREATE INDEX IF NOT EXISTS idx_files_path ON files(path);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_files_complete_path
                ON files(path) WHERE state = 'complete';
            CREATE TABLE IF NOT EXISTS file_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL REFERENCES files(id),
                seq INTEGER NOT NULL,
                size INTEGER NOT NULL,
                byte_offset INTEGER NOT NULL,
                handle TEXT,
                state TEXT NOT NULL,
                update_time INTEGER NOT NULL,
                UNIQUE(file_id, seq)
            );",
        )
        .map_err(|e| db_err("create tables", e))?;

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> DavResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| DavError::Internal("meta db connection lock poisoned".to_string()))
    }

    fn begin<'a>(conn: &'a mut Connection) -> DavResult<Transaction<'a>> {
        conn.transaction().map_err(|e| db_err("begin transaction", e))
    }

    fn commit(tx: Transaction<'_>) -> DavResult<()> {
        tx.commit().map_err(|e| db_err("commit", e))
    }

    // ---------------- folders ----------------

    pub fn insert_pending_folder(
        &self,
        name: &str,
        path: &str,
        parent_path: Option<&str>,
    ) -> DavResult<FolderRecord> {
        let now = unix_timestamp();
        let mut conn = self.conn()?;
        let tx = Self::begin(&mut conn)?;

        if Self::find_complete_file_tx(&tx, path)?.is_some() {
            return Err(DavError::Conflict(format!("file exists at {}", path)));
        }

        tx.execute(
            "INSERT INTO folders (name, path, parent_path, namespace_id, state, create_time, update_time)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6)",
            params![
                name,
                path,
                parent_path,
                FolderState::Pending,
                now as i64,
                now as i64
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                DavError::Conflict(format!("folder exists at {}", path))
            } else {
                db_err("insert folder", e)
            }
        })?;
        let id = tx.last_insert_rowid();
        Self::commit(tx)?;

        Ok(FolderRecord {
            id,
            name: name.to_string(),
            path: path.to_string(),
            parent_path: parent_path.map(|p| p.to_string()),
            namespace_id: None,
            state: FolderState::Pending,
            create_time: now,
            update_time: now,
        })
    }

    /// Attach the remote namespace. A namespace, once attached, never changes.
    pub fn activate_folder(&self, folder_id: i64, namespace_id: &NamespaceId) -> DavResult<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE folders SET namespace_id = ?1, state = ?2, update_time = ?3
                 WHERE id = ?4 AND namespace_id IS NULL",
                params![
                    namespace_id.as_str(),
                    FolderState::Active,
                    unix_timestamp() as i64,
                    folder_id
                ],
            )
            .map_err(|e| db_err("activate folder", e))?;
        if changed != 1 {
            return Err(DavError::CorruptMetadata(format!(
                "folder {} missing or namespace already attached",
                folder_id
            )));
        }
        Ok(())
    }

    /// Fails with `Conflict` while the folder still owns file rows.
    pub fn remove_folder(&self, folder_id: i64) -> DavResult<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute("DELETE FROM folders WHERE id = ?1", params![folder_id])
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    DavError::Conflict(format!("folder {} still owns files", folder_id))
                } else {
                    db_err("remove folder", e)
                }
            })?;
        if changed == 0 {
            return Err(DavError::NotFound(format!("folder id {}", folder_id)));
        }
        Ok(())
    }

    pub fn get_folder_by_path(&self, path: &str) -> DavResult<FolderRecord> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM folders WHERE path = ?1", FOLDER_COLUMNS),
            params![path],
            folder_from_row,
        )
        .optional()
        .map_err(|e| db_err("get folder", e))?
        .ok_or_else(|| DavError::NotFound(format!("folder {}", path)))
    }

    pub fn get_folder(&self, folder_id: i64) -> DavResult<FolderRecord> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM folders WHERE id = ?1", FOLDER_COLUMNS),
            params![folder_id],
            folder_from_row,
        )
        .optional()
        .map_err(|e| db_err("get folder", e))?
        .ok_or_else(|| DavError::NotFound(format!("folder id {}", folder_id)))
    }

    pub fn list_child_folders(&self, parent_path: &str) -> DavResult<Vec<FolderRecord>> {
        self.query_folders(
            &format!(
                "SELECT {} FROM folders WHERE parent_path = ?1 ORDER BY name",
                FOLDER_COLUMNS
            ),
            params![parent_path],
        )
    }

    /// `path` itself and every folder below it.
    pub fn list_folder_subtree(&self, path: &str) -> DavResult<Vec<FolderRecord>> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.query_folders(
            &format!(
                "SELECT {} FROM folders
                 WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2
                 ORDER BY path",
                FOLDER_COLUMNS
            ),
            params![path, prefix],
        )
    }

    pub fn list_pending_folders(&self) -> DavResult<Vec<FolderRecord>> {
        self.query_folders(
            &format!(
                "SELECT {} FROM folders WHERE state = ?1 ORDER BY id",
                FOLDER_COLUMNS
            ),
            params![FolderState::Pending],
        )
    }

    fn query_folders(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> DavResult<Vec<FolderRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(|e| db_err("prepare", e))?;
        let rows = stmt
            .query_map(args, folder_from_row)
            .map_err(|e| db_err("query folders", e))?;
        let mut folders = Vec::new();
        for row in rows {
            folders.push(row.map_err(|e| db_err("read folder row", e))?);
        }
        Ok(folders)
    }

    // ---------------- files ----------------

    /// Insert a file in `planning` state together with one `planned` row per chunk.
    pub fn create_file_plan(
        &self,
        folder_id: i64,
        name: &str,
        path: &str,
        size: u64,
        content_type: &str,
        plans: &[ChunkPlan],
    ) -> DavResult<FileRecord> {
        let planned: u64 = plans.iter().map(|p| p.size).sum();
        if planned != size {
            return Err(DavError::InvalidInput(format!(
                "chunk plan covers {} bytes, file declares {}",
                planned, size
            )));
        }

        let now = unix_timestamp();
        let mut conn = self.conn()?;
        let tx = Self::begin(&mut conn)?;

        let folder_exists = tx
            .query_row(
                "SELECT 1 FROM folders WHERE path = ?1",
                params![path],
                |_| Ok(()),
            )
            .optional()
            .map_err(|e| db_err("check folder path", e))?;
        if folder_exists.is_some() {
            return Err(DavError::Conflict(format!("folder exists at {}", path)));
        }

        tx.execute(
            "INSERT INTO files (folder_id, name, path, size, content_type, state, create_time, update_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                folder_id,
                name,
                path,
                size as i64,
                content_type,
                FileState::Planning,
                now as i64,
                now as i64
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                DavError::NotFound(format!("folder id {}", folder_id))
            } else {
                db_err("insert file", e)
            }
        })?;
        let file_id = tx.last_insert_rowid();

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO file_chunks (file_id, seq, size, byte_offset, handle, state, update_time)
                     VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6)",
                )
                .map_err(|e| db_err("prepare insert chunk", e))?;
            for plan in plans.iter() {
                stmt.execute(params![
                    file_id,
                    plan.seq as i64,
                    plan.size as i64,
                    plan.offset as i64,
                    ChunkState::Planned,
                    now as i64
                ])
                .map_err(|e| db_err("insert chunk", e))?;
            }
        }
        Self::commit(tx)?;

        Ok(FileRecord {
            id: file_id,
            folder_id,
            name: name.to_string(),
            path: path.to_string(),
            size,
            content_type: content_type.to_string(),
            state: FileState::Planning,
            create_time: now,
            update_time: now,
        })
    }

    pub fn set_file_state(&self, file_id: i64, state: FileState) -> DavResult<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE files SET state = ?1, update_time = ?2 WHERE id = ?3",
                params![state, unix_timestamp() as i64, file_id],
            )
            .map_err(|e| db_err("set file state", e))?;
        if changed == 0 {
            return Err(DavError::NotFound(format!("file id {}", file_id)));
        }
        Ok(())
    }

    /// Record the remote handle of one chunk. Setting a different handle on a
    /// chunk that already has one is refused.
    pub fn set_chunk_handle(&self, file_id: i64, seq: u32, handle: &BlobHandle) -> DavResult<()> {
        let conn = self.conn()?;
        Self::set_chunk_handle_tx(&conn, file_id, seq, handle)
    }

    fn set_chunk_handle_tx(
        conn: &Connection,
        file_id: i64,
        seq: u32,
        handle: &BlobHandle,
    ) -> DavResult<()> {
        let changed = conn
            .execute(
                "UPDATE file_chunks SET handle = ?1, state = ?2, update_time = ?3
                 WHERE file_id = ?4 AND seq = ?5 AND (handle IS NULL OR handle = ?1)",
                params![
                    handle.as_str(),
                    ChunkState::Sent,
                    unix_timestamp() as i64,
                    file_id,
                    seq as i64
                ],
            )
            .map_err(|e| db_err("set chunk handle", e))?;
        if changed != 1 {
            return Err(DavError::CorruptMetadata(format!(
                "chunk {} of file {} missing or bound to another blob",
                seq, file_id
            )));
        }
        Ok(())
    }

    /// Atomically bind every chunk handle, mark the file complete and move a
    /// previously complete file at the same path to `deleting`. Returns that
    /// superseded file, if any.
    pub fn commit_file(
        &self,
        file_id: i64,
        handles: &[(u32, BlobHandle)],
    ) -> DavResult<Option<FileRecord>> {
        let now = unix_timestamp() as i64;
        let mut conn = self.conn()?;
        let tx = Self::begin(&mut conn)?;

        let file = tx
            .query_row(
                &format!("SELECT {} FROM files WHERE id = ?1", FILE_COLUMNS),
                params![file_id],
                file_from_row,
            )
            .optional()
            .map_err(|e| db_err("load file", e))?
            .ok_or_else(|| DavError::NotFound(format!("file id {}", file_id)))?;
        if file.state != FileState::Transferring {
            return Err(DavError::CorruptMetadata(format!(
                "file {} is {} and cannot be committed",
                file.path,
                file.state.as_str()
            )));
        }

        for (seq, handle) in handles.iter() {
            Self::set_chunk_handle_tx(&tx, file_id, *seq, handle)?;
        }

        let unsent: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM file_chunks WHERE file_id = ?1 AND handle IS NULL",
                params![file_id],
                |row| row.get(0),
            )
            .map_err(|e| db_err("count unsent chunks", e))?;
        if unsent != 0 {
            return Err(DavError::CorruptMetadata(format!(
                "file {} has {} chunk(s) without remote handle",
                file.path, unsent
            )));
        }

        let superseded = Self::find_complete_file_tx(&tx, &file.path)?;
        if let Some(old) = superseded.as_ref() {
            tx.execute(
                "UPDATE files SET state = ?1, update_time = ?2 WHERE id = ?3",
                params![FileState::Deleting, now, old.id],
            )
            .map_err(|e| db_err("supersede file", e))?;
        }

        tx.execute(
            "UPDATE files SET state = ?1, update_time = ?2 WHERE id = ?3",
            params![FileState::Complete, now, file_id],
        )
        .map_err(|e| db_err("complete file", e))?;
        Self::commit(tx)?;

        Ok(superseded.map(|mut old| {
            old.state = FileState::Deleting;
            old
        }))
    }

    fn find_complete_file_tx(conn: &Connection, path: &str) -> DavResult<Option<FileRecord>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM files WHERE path = ?1 AND state = ?2",
                FILE_COLUMNS
            ),
            params![path, FileState::Complete],
            file_from_row,
        )
        .optional()
        .map_err(|e| db_err("find complete file", e))
    }

    /// The file readers see at `path`.
    pub fn get_complete_file(&self, path: &str) -> DavResult<FileRecord> {
        let conn = self.conn()?;
        Self::find_complete_file_tx(&conn, path)?
            .ok_or_else(|| DavError::NotFound(format!("file {}", path)))
    }

    pub fn get_file(&self, file_id: i64) -> DavResult<FileRecord> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM files WHERE id = ?1", FILE_COLUMNS),
            params![file_id],
            file_from_row,
        )
        .optional()
        .map_err(|e| db_err("get file", e))?
        .ok_or_else(|| DavError::NotFound(format!("file id {}", file_id)))
    }

    /// Files of a folder in any state, ordered by name.
    pub fn list_folder_files(&self, folder_id: i64) -> DavResult<Vec<FileRecord>> {
        self.query_files(
            &format!(
                "SELECT {} FROM files WHERE folder_id = ?1 ORDER BY name, id",
                FILE_COLUMNS
            ),
            params![folder_id],
        )
    }

    pub fn list_unfinished_files(&self) -> DavResult<Vec<FileRecord>> {
        self.query_files(
            &format!(
                "SELECT {} FROM files WHERE state != ?1 ORDER BY id",
                FILE_COLUMNS
            ),
            params![FileState::Complete],
        )
    }

    fn query_files(&self, sql: &str, args: impl rusqlite::Params) -> DavResult<Vec<FileRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(|e| db_err("prepare", e))?;
        let rows = stmt
            .query_map(args, file_from_row)
            .map_err(|e| db_err("query files", e))?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row.map_err(|e| db_err("read file row", e))?);
        }
        Ok(files)
    }

    // ---------------- chunks ----------------

    /// Chunks of a file ordered by sequence number.
    pub fn list_chunks(&self, file_id: i64) -> DavResult<Vec<ChunkRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM file_chunks WHERE file_id = ?1 ORDER BY seq",
                CHUNK_COLUMNS
            ))
            .map_err(|e| db_err("prepare", e))?;
        let rows = stmt
            .query_map(params![file_id], chunk_from_row)
            .map_err(|e| db_err("query chunks", e))?;
        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row.map_err(|e| db_err("read chunk row", e))?);
        }
        Ok(chunks)
    }

    pub fn remove_chunks(&self, file_id: i64, seqs: &[u32]) -> DavResult<()> {
        if seqs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = Self::begin(&mut conn)?;
        {
            let mut stmt = tx
                .prepare("DELETE FROM file_chunks WHERE file_id = ?1 AND seq = ?2")
                .map_err(|e| db_err("prepare delete chunk", e))?;
            for seq in seqs.iter() {
                stmt.execute(params![file_id, *seq as i64])
                    .map_err(|e| db_err("delete chunk", e))?;
            }
        }
        Self::commit(tx)
    }

    /// Remove a file and all of its chunk rows.
    pub fn remove_file(&self, file_id: i64) -> DavResult<()> {
        let mut conn = self.conn()?;
        let tx = Self::begin(&mut conn)?;
        tx.execute(
            "DELETE FROM file_chunks WHERE file_id = ?1",
            params![file_id],
        )
        .map_err(|e| db_err("delete file chunks", e))?;
        let changed = tx
            .execute("DELETE FROM files WHERE id = ?1", params![file_id])
            .map_err(|e| db_err("delete file", e))?;
        if changed == 0 {
            return Err(DavError::NotFound(format!("file id {}", file_id)));
        }
        Self::commit(tx)
    }

    pub fn count_rows(&self) -> DavResult<RowCounts> {
        let conn = self.conn()?;
        let count = |table: &str| -> DavResult<u64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
            .map_err(|e| db_err("count rows", e))
        };
        Ok(RowCounts {
            folders: count("folders")?,
            files: count("files")?,
            chunks: count("file_chunks")?,
        })
    }
}
