use async_trait::async_trait;
use dav_lib::{BlobChannel, BlobHandle, DavError, DavResult, NamespaceId};
use log::{debug, info};
use rand::RngCore;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const NAMESPACE_NAME_FILE: &str = ".name";

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn is_hex_id(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn io_err(what: &str, path: &Path, e: std::io::Error) -> DavError {
    if e.kind() == ErrorKind::NotFound {
        return DavError::NotFound(format!("{} {}", what, path.display()));
    }
    DavError::IoError(format!("{} {} failed: {}", what, path.display(), e))
}

/// Blob channel over a local directory: one sub-directory per namespace and
/// one file per blob. Handles are `<namespace>/<blob>`, both random hex.
pub struct LocalDirBlobChannel {
    root: PathBuf,
    max_blob_size: Option<u64>,
}

impl LocalDirBlobChannel {
    pub async fn open(root: PathBuf, max_blob_size: Option<u64>) -> DavResult<Self> {
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_err("create blob dir", &root, e))?;
        info!("LocalDirBlobChannel: open at {}", root.display());
        Ok(Self {
            root,
            max_blob_size,
        })
    }

    fn namespace_dir(&self, namespace: &NamespaceId) -> DavResult<PathBuf> {
        if !is_hex_id(namespace.as_str()) {
            return Err(DavError::InvalidInput(format!(
                "malformed namespace id {}",
                namespace
            )));
        }
        Ok(self.root.join(namespace.as_str()))
    }

    fn blob_path(&self, handle: &BlobHandle) -> DavResult<PathBuf> {
        let (namespace, blob) = handle.as_str().split_once('/').ok_or_else(|| {
            DavError::InvalidInput(format!("malformed blob handle {}", handle))
        })?;
        if !is_hex_id(namespace) || !is_hex_id(blob) {
            return Err(DavError::InvalidInput(format!(
                "malformed blob handle {}",
                handle
            )));
        }
        Ok(self.root.join(namespace).join(blob))
    }
}

#[async_trait]
impl BlobChannel for LocalDirBlobChannel {
    async fn send(
        &self,
        namespace: &NamespaceId,
        name: &str,
        data: Vec<u8>,
    ) -> DavResult<BlobHandle> {
        if let Some(max) = self.max_blob_size {
            if data.len() as u64 > max {
                return Err(DavError::RemoteError(format!(
                    "blob {} too large: {} > {}",
                    name,
                    data.len(),
                    max
                )));
            }
        }

        let dir = self.namespace_dir(namespace)?;
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(DavError::RemoteError(format!(
                "namespace {} not found",
                namespace
            )));
        }

        let blob = random_hex(8);
        let path = dir.join(&blob);
        let tmp_path = dir.join(format!("{}.tmp", blob));
        tokio::fs::write(&tmp_path, &data)
            .await
            .map_err(|e| io_err("write blob", &tmp_path, e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| io_err("rename blob", &path, e))?;

        debug!(
            "LocalDirBlobChannel: stored {} ({} bytes) at {}",
            name,
            data.len(),
            path.display()
        );
        Ok(BlobHandle::new(format!("{}/{}", namespace, blob)))
    }

    async fn fetch(&self, handle: &BlobHandle) -> DavResult<Vec<u8>> {
        let path = self.blob_path(handle)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| io_err("read blob", &path, e))
    }

    async fn delete(&self, handle: &BlobHandle) -> DavResult<()> {
        let path = self.blob_path(handle)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| io_err("remove blob", &path, e))
    }

    async fn create_namespace(&self, name: &str) -> DavResult<NamespaceId> {
        let id = random_hex(6);
        let dir = self.root.join(&id);
        tokio::fs::create_dir(&dir)
            .await
            .map_err(|e| io_err("create namespace", &dir, e))?;
        let name_path = dir.join(NAMESPACE_NAME_FILE);
        tokio::fs::write(&name_path, name.as_bytes())
            .await
            .map_err(|e| io_err("write namespace name", &name_path, e))?;
        debug!("LocalDirBlobChannel: namespace {} for {}", id, name);
        Ok(NamespaceId::new(id))
    }

    async fn delete_namespace(&self, namespace: &NamespaceId) -> DavResult<()> {
        let dir = self.namespace_dir(namespace)?;
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| io_err("remove namespace", &dir, e))
    }
}
