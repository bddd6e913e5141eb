use chunk_engine::{ChunkEngine, EngineConfig};
use dav_lib::{DavError, DavResult};
use log::{info, warn};
use meta_store::MetaStoreDB;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;

use crate::local_channel::LocalDirBlobChannel;

pub const DEFAULT_DAV_DAEMON_CONFIG_PATH: &str = "/opt/dav/etc/dav_daemon.json";

#[derive(Debug, Clone, PartialEq)]
pub enum DaemonCommand {
    Reconcile,
    Mkdir(String),
    Rmdir(String),
    Put {
        local: PathBuf,
        remote: String,
        content_type: Option<String>,
    },
    Get {
        remote: String,
        local: PathBuf,
    },
    Rm(String),
    Ls(String),
    Stat(String),
}

#[derive(Debug, Clone)]
pub struct DavDaemonRunOptions {
    pub config_path: PathBuf,
    pub command: DaemonCommand,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct DavDaemonServiceConfig {
    #[serde(alias = "meta_db_path")]
    pub db_path: PathBuf,
    #[serde(alias = "blob_root")]
    pub blob_dir: PathBuf,
    /// Emulated message size ceiling of the local channel.
    pub blob_max_size: Option<u64>,
    pub engine: EngineConfig,
}

impl Default for DavDaemonServiceConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/opt/dav/var/meta/meta.db"),
            blob_dir: PathBuf::from("/opt/dav/var/blobs"),
            blob_max_size: None,
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatOutput<'a> {
    path: &'a str,
    size: u64,
    content_type: &'a str,
    chunks: usize,
    update_time: u64,
}

pub(crate) fn read_json_config<T: DeserializeOwned>(path: &Path) -> DavResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DavError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| DavError::InvalidInput(format!("parse {} failed: {}", path.display(), e)))
}

fn to_json<T: Serialize>(value: &T) -> DavResult<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| DavError::Internal(format!("serialize output failed: {}", e)))
}

/// Open the metadata store and blob directory named by the config.
pub(crate) async fn init_engine(config: &DavDaemonServiceConfig) -> DavResult<ChunkEngine> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            DavError::IoError(format!(
                "create meta db dir {} failed: {}",
                parent.display(),
                e
            ))
        })?;
    }
    let db = Arc::new(MetaStoreDB::new(&config.db_path.to_string_lossy())?);
    let channel =
        Arc::new(LocalDirBlobChannel::open(config.blob_dir.clone(), config.blob_max_size).await?);
    ChunkEngine::new(db, channel, config.engine.clone())
}

/// Run one command and return what should be printed.
pub(crate) async fn execute_command(
    engine: &ChunkEngine,
    command: DaemonCommand,
) -> DavResult<String> {
    match command {
        DaemonCommand::Reconcile => {
            let report = engine.reconcile().await?;
            to_json(&report)
        }
        DaemonCommand::Mkdir(path) => {
            let folder = engine.create_folder(&path).await?;
            Ok(format!("created {} ({})", folder.path, folder.namespace_id))
        }
        DaemonCommand::Rmdir(path) => {
            engine.delete_folder(&path).await?;
            Ok(format!("removed {}", path))
        }
        DaemonCommand::Put {
            local,
            remote,
            content_type,
        } => {
            let file = tokio::fs::File::open(&local).await.map_err(|e| {
                DavError::IoError(format!("open {} failed: {}", local.display(), e))
            })?;
            let size = file.metadata().await?.len();
            let size = i64::try_from(size).map_err(|_| {
                DavError::InvalidInput(format!("{} too large", local.display()))
            })?;
            let handle = engine
                .write_file(&remote, size, content_type.as_deref(), file)
                .await?;
            Ok(format!(
                "stored {} ({} bytes, {} chunk(s))",
                handle.path, handle.size, handle.chunk_count
            ))
        }
        DaemonCommand::Get { remote, local } => {
            let data = engine.read_file(&remote).await?;
            tokio::fs::write(&local, &data).await.map_err(|e| {
                DavError::IoError(format!("write {} failed: {}", local.display(), e))
            })?;
            Ok(format!("fetched {} ({} bytes)", remote, data.len()))
        }
        DaemonCommand::Rm(path) => {
            engine.delete_file(&path).await?;
            Ok(format!("removed {}", path))
        }
        DaemonCommand::Ls(path) => to_json(&engine.list_folder(&path)?),
        DaemonCommand::Stat(path) => {
            let file = engine.stat_file(&path)?;
            let chunks = engine.meta_db().list_chunks(file.id)?.len();
            to_json(&StatOutput {
                path: &file.path,
                size: file.size,
                content_type: &file.content_type,
                chunks,
                update_time: file.update_time,
            })
        }
    }
}

pub fn run_dav_daemon(options: DavDaemonRunOptions) -> DavResult<String> {
    let config: DavDaemonServiceConfig = read_json_config(&options.config_path)?;
    config.engine.validate()?;
    let runtime = Runtime::new().map_err(|e| DavError::Internal(e.to_string()))?;
    info!(
        "dav_daemon: config={}, db={}, blobs={}",
        options.config_path.display(),
        config.db_path.display(),
        config.blob_dir.display()
    );

    runtime.block_on(async {
        let engine = init_engine(&config).await?;
        // recovery runs before anything else touches the store
        if options.command != DaemonCommand::Reconcile {
            let report = engine.reconcile().await?;
            for (path, handles) in report.retained_files.iter() {
                warn!(
                    "dav_daemon: {} still holds {} undeletable blob(s)",
                    path,
                    handles.len()
                );
            }
        }
        execute_command(&engine, options.command).await
    })
}
