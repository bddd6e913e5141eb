// In-process blob channel. Used by tests and local runs; supports failure injection.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::{BlobChannel, BlobHandle, DavError, DavResult, NamespaceId};

#[derive(Default)]
struct MemChannelState {
    namespaces: HashMap<String, String>,
    blobs: HashMap<String, (String, Vec<u8>)>,
    next_id: u64,
    send_calls: u64,
    delete_calls: u64,
    fetch_calls: u64,

    fail_send_names: Vec<String>,
    fail_fetch_handles: HashSet<String>,
    fail_delete_handles: HashSet<String>,
    fail_all_deletes: bool,
    fail_create_namespace: bool,
    fail_delete_namespace: bool,
    delay: Duration,
    max_blob_size: Option<usize>,
}

pub struct MemoryBlobChannel {
    state: Mutex<MemChannelState>,
    in_flight: AtomicUsize,
    max_in_flight_seen: AtomicUsize,
}

struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryBlobChannel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemChannelState::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight_seen: AtomicUsize::new(0),
        }
    }

    /// Reject sends larger than `max_blob_size`, like a real message size ceiling.
    pub fn with_max_blob_size(self, max_blob_size: usize) -> Self {
        self.state().max_blob_size = Some(max_blob_size);
        self
    }

    fn state(&self) -> MutexGuard<'_, MemChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter_call(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight_seen.fetch_max(now, Ordering::SeqCst);
        let guard = InFlightGuard {
            counter: &self.in_flight,
        };
        let delay = self.state().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        guard
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = delay;
    }

    /// Every send whose blob name ends with `suffix` fails.
    pub fn fail_send_when_name_ends_with(&self, suffix: &str) {
        self.state().fail_send_names.push(suffix.to_string());
    }

    pub fn fail_fetch_of(&self, handle: &BlobHandle) {
        self.state()
            .fail_fetch_handles
            .insert(handle.as_str().to_string());
    }

    pub fn fail_delete_of(&self, handle: &BlobHandle) {
        self.state()
            .fail_delete_handles
            .insert(handle.as_str().to_string());
    }

    pub fn set_fail_all_deletes(&self, fail: bool) {
        self.state().fail_all_deletes = fail;
    }

    pub fn set_fail_create_namespace(&self, fail: bool) {
        self.state().fail_create_namespace = fail;
    }

    pub fn set_fail_delete_namespace(&self, fail: bool) {
        self.state().fail_delete_namespace = fail;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_send_names.clear();
        state.fail_fetch_handles.clear();
        state.fail_delete_handles.clear();
        state.fail_all_deletes = false;
        state.fail_create_namespace = false;
        state.fail_delete_namespace = false;
    }

    pub fn blob_count(&self) -> usize {
        self.state().blobs.len()
    }

    pub fn namespace_count(&self) -> usize {
        self.state().namespaces.len()
    }

    pub fn has_blob(&self, handle: &BlobHandle) -> bool {
        self.state().blobs.contains_key(handle.as_str())
    }

    pub fn has_namespace(&self, namespace: &NamespaceId) -> bool {
        self.state().namespaces.contains_key(namespace.as_str())
    }

    pub fn blob_handles(&self) -> Vec<BlobHandle> {
        let mut handles: Vec<BlobHandle> = self
            .state()
            .blobs
            .keys()
            .map(|k| BlobHandle::new(k.clone()))
            .collect();
        handles.sort();
        handles
    }

    /// Overwrite a stored blob behind the engine's back.
    pub fn tamper_blob(&self, handle: &BlobHandle, data: Vec<u8>) {
        if let Some(entry) = self.state().blobs.get_mut(handle.as_str()) {
            entry.1 = data;
        }
    }

    pub fn send_calls(&self) -> u64 {
        self.state().send_calls
    }

    pub fn fetch_calls(&self) -> u64 {
        self.state().fetch_calls
    }

    pub fn delete_calls(&self) -> u64 {
        self.state().delete_calls
    }

    pub fn max_in_flight_seen(&self) -> usize {
        self.max_in_flight_seen.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBlobChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobChannel for MemoryBlobChannel {
    async fn send(
        &self,
        namespace: &NamespaceId,
        name: &str,
        data: Vec<u8>,
    ) -> DavResult<BlobHandle> {
        let _guard = self.enter_call().await;
        let mut state = self.state();
        state.send_calls += 1;
        if !state.namespaces.contains_key(namespace.as_str()) {
            return Err(DavError::RemoteError(format!(
                "namespace {} not found",
                namespace
            )));
        }
        if state.fail_send_names.iter().any(|p| name.ends_with(p.as_str())) {
            return Err(DavError::RemoteError(format!("send {} rejected", name)));
        }
        if let Some(max) = state.max_blob_size {
            if data.len() > max {
                return Err(DavError::RemoteError(format!(
                    "blob {} too large: {} > {}",
                    name,
                    data.len(),
                    max
                )));
            }
        }

        state.next_id += 1;
        let handle = format!("msg-{}", state.next_id);
        debug!(
            "MemoryBlobChannel: stored {} as {} ({} bytes)",
            name,
            handle,
            data.len()
        );
        state
            .blobs
            .insert(handle.clone(), (namespace.as_str().to_string(), data));
        Ok(BlobHandle::new(handle))
    }

    async fn fetch(&self, handle: &BlobHandle) -> DavResult<Vec<u8>> {
        let _guard = self.enter_call().await;
        let mut state = self.state();
        state.fetch_calls += 1;
        if state.fail_fetch_handles.contains(handle.as_str()) {
            return Err(DavError::RemoteError(format!("fetch {} rejected", handle)));
        }
        state
            .blobs
            .get(handle.as_str())
            .map(|(_, data)| data.clone())
            .ok_or_else(|| DavError::NotFound(format!("blob {}", handle)))
    }

    async fn delete(&self, handle: &BlobHandle) -> DavResult<()> {
        let _guard = self.enter_call().await;
        let mut state = self.state();
        state.delete_calls += 1;
        if state.fail_all_deletes || state.fail_delete_handles.contains(handle.as_str()) {
            return Err(DavError::RemoteError(format!("delete {} rejected", handle)));
        }
        match state.blobs.remove(handle.as_str()) {
            Some(_) => Ok(()),
            None => Err(DavError::NotFound(format!("blob {}", handle))),
        }
    }

    async fn create_namespace(&self, name: &str) -> DavResult<NamespaceId> {
        let _guard = self.enter_call().await;
        let mut state = self.state();
        if state.fail_create_namespace {
            return Err(DavError::RemoteError(format!(
                "create namespace {} rejected",
                name
            )));
        }
        state.next_id += 1;
        let id = format!("topic-{}", state.next_id);
        state.namespaces.insert(id.clone(), name.to_string());
        Ok(NamespaceId::new(id))
    }

    async fn delete_namespace(&self, namespace: &NamespaceId) -> DavResult<()> {
        let _guard = self.enter_call().await;
        let mut state = self.state();
        if state.fail_delete_namespace {
            return Err(DavError::RemoteError(format!(
                "delete namespace {} rejected",
                namespace
            )));
        }
        if state.namespaces.remove(namespace.as_str()).is_none() {
            return Err(DavError::NotFound(format!("namespace {}", namespace)));
        }
        let ns = namespace.as_str().to_string();
        state.blobs.retain(|_, (owner, _)| *owner != ns);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_fetch_delete() {
        let channel = MemoryBlobChannel::new();
        let ns = channel.create_namespace("docs").await.unwrap();
        let handle = channel.send(&ns, "a.part0", vec![1, 2, 3]).await.unwrap();
        assert_eq!(channel.fetch(&handle).await.unwrap(), vec![1, 2, 3]);
        channel.delete(&handle).await.unwrap();
        assert!(channel.fetch(&handle).await.unwrap_err().is_not_found());
        assert_eq!(channel.blob_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let channel = MemoryBlobChannel::new().with_max_blob_size(4);
        let ns = channel.create_namespace("docs").await.unwrap();
        channel.fail_send_when_name_ends_with(".part1");
        assert!(channel.send(&ns, "a.part1", vec![0]).await.is_err());
        assert!(channel.send(&ns, "a.part0", vec![0; 5]).await.is_err());
        let handle = channel.send(&ns, "a.part0", vec![0; 4]).await.unwrap();

        channel.set_fail_all_deletes(true);
        assert!(channel.delete(&handle).await.is_err());
        channel.clear_failures();
        channel.delete(&handle).await.unwrap();
        assert_eq!(channel.send_calls(), 3);
    }

    #[tokio::test]
    async fn test_delete_namespace_drops_blobs() {
        let channel = MemoryBlobChannel::new();
        let ns = channel.create_namespace("docs").await.unwrap();
        channel.send(&ns, "a", vec![1]).await.unwrap();
        channel.delete_namespace(&ns).await.unwrap();
        assert_eq!(channel.blob_count(), 0);
        assert!(!channel.has_namespace(&ns));
    }
}
