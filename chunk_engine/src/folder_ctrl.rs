use dav_lib::{normalize_path, parent_path, path_depth, path_name, DavError, DavResult, ROOT_PATH};
use log::{info, warn};
use meta_store::{FolderRecord, FolderState};
use std::collections::HashSet;

use crate::{ChunkEngine, FolderHandle, PathGuard};

impl ChunkEngine {
    /// Create the folder at `path` together with its remote namespace.
    ///
    /// The parent must exist, except that the root is created on demand.
    pub async fn create_folder(&self, path: &str) -> DavResult<FolderHandle> {
        let path = normalize_path(path)?;
        let parent = parent_path(&path);
        if parent.as_deref() == Some(ROOT_PATH) {
            // ensure_folder_chain calls back into create_folder
            Box::pin(self.ensure_folder_chain(ROOT_PATH)).await?;
        }

        let _parent_guard = match parent.as_deref() {
            Some(parent) => Some(self.locks.lock_shared(parent).await),
            None => None,
        };
        let _guard = self.locks.lock_exclusive(&path).await;
        self.create_folder_locked(&path, parent.as_deref()).await
    }

    async fn create_folder_locked(
        &self,
        path: &str,
        parent: Option<&str>,
    ) -> DavResult<FolderHandle> {
        if let Some(parent) = parent {
            let parent_folder = self.db.get_folder_by_path(parent)?;
            if parent_folder.state != FolderState::Active {
                return Err(DavError::NotFound(format!("folder {}", parent)));
            }
        }

        let folder = self.db.insert_pending_folder(path_name(path), path, parent)?;
        let namespace = match self.transfer.create_namespace(path).await {
            Ok(namespace) => namespace,
            Err(e) => {
                warn!(
                    "ChunkEngine: create namespace for {} failed, dropping folder row! {}",
                    path, e
                );
                if let Err(remove_err) = self.db.remove_folder(folder.id) {
                    warn!(
                        "ChunkEngine: remove pending folder {} failed, left for reconcile! {}",
                        path, remove_err
                    );
                }
                return Err(e);
            }
        };

        if let Err(e) = self.db.activate_folder(folder.id, &namespace) {
            warn!("ChunkEngine: activate folder {} failed! {}", path, e);
            if let Err(ns_err) = self.transfer.delete_namespace(&namespace).await {
                warn!(
                    "ChunkEngine: namespace {} of {} orphaned! {}",
                    namespace, path, ns_err
                );
            }
            if let Err(remove_err) = self.db.remove_folder(folder.id) {
                warn!(
                    "ChunkEngine: remove pending folder {} failed, left for reconcile! {}",
                    path, remove_err
                );
            }
            return Err(e);
        }

        info!("ChunkEngine: created folder {} as {}", path, namespace);
        Ok(FolderHandle {
            id: folder.id,
            path: path.to_string(),
            namespace_id: namespace,
        })
    }

    /// Remove the folder at `path` with everything below it, deepest folders
    /// first. On failure the folders not yet removed stay in place.
    pub async fn delete_folder(&self, path: &str) -> DavResult<()> {
        let path = normalize_path(path)?;
        let parent = parent_path(&path);
        let _parent_guard = match parent.as_deref() {
            Some(parent) => Some(self.locks.lock_shared(parent).await),
            None => None,
        };
        let guard = self.locks.lock_exclusive(&path).await;

        self.db.get_folder_by_path(&path)?;
        let (subtree, _guards) = self.lock_subtree(guard).await?;
        self.delete_folder_locked(subtree).await
    }

    /// Lock every folder below the locked one. Sub-folders can still appear
    /// below a descendant that is not locked yet, so the listing repeats until
    /// it no longer grows.
    async fn lock_subtree(
        &self,
        root_guard: PathGuard,
    ) -> DavResult<(Vec<FolderRecord>, Vec<PathGuard>)> {
        let root = root_guard.path().to_string();
        let mut locked: HashSet<String> = HashSet::new();
        locked.insert(root.clone());
        let mut guards = vec![root_guard];

        loop {
            let subtree = self.db.list_folder_subtree(&root)?;
            let mut new_paths: Vec<String> = subtree
                .iter()
                .map(|f| f.path.clone())
                .filter(|p| !locked.contains(p))
                .collect();
            if new_paths.is_empty() {
                return Ok((subtree, guards));
            }
            // ancestors sort before their descendants
            new_paths.sort();
            for p in new_paths {
                guards.push(self.locks.lock_exclusive(&p).await);
                locked.insert(p);
            }
        }
    }

    async fn delete_folder_locked(&self, mut subtree: Vec<FolderRecord>) -> DavResult<()> {
        subtree.sort_by(|a, b| {
            path_depth(&b.path)
                .cmp(&path_depth(&a.path))
                .then_with(|| a.path.cmp(&b.path))
        });

        for folder in subtree.iter() {
            let mut first_err = None;
            for file in self.db.list_folder_files(folder.id)? {
                if let Err(e) = self.purge_file(&file).await {
                    warn!(
                        "ChunkEngine: delete {} inside folder {} failed! {}",
                        file.path, folder.path, e
                    );
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
            if let Some(e) = first_err {
                return Err(e);
            }

            if let Some(namespace) = folder.namespace_id.as_ref() {
                self.transfer.delete_namespace(namespace).await?;
            }
            self.db.remove_folder(folder.id)?;
            info!("ChunkEngine: removed folder {}", folder.path);
        }
        Ok(())
    }
}
