use dav_lib::{BlobChannel, BlobHandle, DavError, DavResult, NamespaceId};
use futures::future::join_all;
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Runs batches of independent blob channel calls concurrently.
///
/// All calls share one semaphore, so at most `max_in_flight` channel calls are
/// outstanding across every batch; the rest queue. Each call is bounded by
/// `call_timeout` and an elapsed call counts as failed. A failed chunk never
/// stops the others: every batch returns one outcome per input.
pub struct TransferOrchestrator {
    channel: Arc<dyn BlobChannel>,
    permits: Arc<Semaphore>,
    call_timeout: Duration,
}

impl TransferOrchestrator {
    pub fn new(channel: Arc<dyn BlobChannel>, max_in_flight: usize, call_timeout: Duration) -> Self {
        Self {
            channel,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            call_timeout,
        }
    }

    async fn bounded<T, F>(&self, what: &str, call: F) -> DavResult<T>
    where
        F: Future<Output = DavResult<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DavError::Internal("transfer semaphore closed".to_string()))?;
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "TransferOrchestrator: {} timed out after {:?}",
                    what, self.call_timeout
                );
                Err(DavError::Timeout(format!(
                    "{} exceeded {:?}",
                    what, self.call_timeout
                )))
            }
        }
    }

    /// Send every `(seq, payload)` as one blob named `<name_hint>.part<seq>`.
    /// `on_sent` runs as soon as an individual send succeeds.
    pub async fn send_all<F>(
        &self,
        namespace: &NamespaceId,
        name_hint: &str,
        chunks: Vec<(u32, Vec<u8>)>,
        on_sent: F,
    ) -> Vec<(u32, DavResult<BlobHandle>)>
    where
        F: Fn(u32, &BlobHandle) + Sync,
    {
        let on_sent = &on_sent;
        let tasks = chunks.into_iter().map(|(seq, payload)| async move {
            let name = format!("{}.part{}", name_hint, seq);
            let size = payload.len();
            let result = self
                .bounded(&name, self.channel.send(namespace, &name, payload))
                .await;
            match result.as_ref() {
                Ok(handle) => {
                    debug!(
                        "TransferOrchestrator: sent {} ({} bytes) as {}",
                        name, size, handle
                    );
                    on_sent(seq, handle);
                }
                Err(e) => warn!("TransferOrchestrator: send {} failed! {}", name, e),
            }
            (seq, result)
        });

        let mut results = join_all(tasks).await;
        results.sort_by_key(|(seq, _)| *seq);
        results
    }

    pub async fn fetch_all(
        &self,
        handles: Vec<(u32, BlobHandle)>,
    ) -> Vec<(u32, DavResult<Vec<u8>>)> {
        let tasks = handles.into_iter().map(|(seq, handle)| async move {
            let what = format!("fetch {}", handle);
            let result = self.bounded(&what, self.channel.fetch(&handle)).await;
            if let Err(e) = result.as_ref() {
                warn!(
                    "TransferOrchestrator: fetch chunk {} ({}) failed! {}",
                    seq, handle, e
                );
            }
            (seq, result)
        });

        let mut results = join_all(tasks).await;
        results.sort_by_key(|(seq, _)| *seq);
        results
    }

    /// Delete every handle. A blob the channel no longer knows counts as deleted.
    pub async fn delete_all(&self, handles: Vec<BlobHandle>) -> Vec<(BlobHandle, DavResult<()>)> {
        let tasks = handles.into_iter().map(|handle| async move {
            let what = format!("delete {}", handle);
            let result = match self.bounded(&what, self.channel.delete(&handle)).await {
                Err(DavError::NotFound(_)) => {
                    debug!("TransferOrchestrator: blob {} already gone", handle);
                    Ok(())
                }
                other => other,
            };
            if let Err(e) = result.as_ref() {
                warn!("TransferOrchestrator: delete {} failed! {}", handle, e);
            }
            (handle, result)
        });

        join_all(tasks).await
    }

    pub async fn create_namespace(&self, name: &str) -> DavResult<NamespaceId> {
        let what = format!("create namespace {}", name);
        self.bounded(&what, self.channel.create_namespace(name))
            .await
    }

    pub async fn delete_namespace(&self, namespace: &NamespaceId) -> DavResult<()> {
        let what = format!("delete namespace {}", namespace);
        match self
            .bounded(&what, self.channel.delete_namespace(namespace))
            .await
        {
            Err(DavError::NotFound(_)) => {
                debug!("TransferOrchestrator: namespace {} already gone", namespace);
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dav_lib::MemoryBlobChannel;

    async fn setup(max_in_flight: usize) -> (Arc<MemoryBlobChannel>, TransferOrchestrator, NamespaceId) {
        let channel = Arc::new(MemoryBlobChannel::new());
        let orchestrator =
            TransferOrchestrator::new(channel.clone(), max_in_flight, Duration::from_secs(5));
        let ns = orchestrator.create_namespace("/t").await.unwrap();
        (channel, orchestrator, ns)
    }

    #[tokio::test]
    async fn test_send_all_collects_every_outcome() {
        let (channel, orchestrator, ns) = setup(4).await;
        channel.fail_send_when_name_ends_with("f.part2");

        let chunks: Vec<(u32, Vec<u8>)> = (0..5u32).rev().map(|i| (i, vec![i as u8; 3])).collect();
        let recorded = std::sync::Mutex::new(Vec::new());
        let results = orchestrator
            .send_all(&ns, "f", chunks, |seq, _| recorded.lock().unwrap().push(seq))
            .await;

        let seqs: Vec<u32> = results.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert!(results[2].1.is_err());
        assert_eq!(results.iter().filter(|(_, r)| r.is_ok()).count(), 4);
        assert_eq!(channel.send_calls(), 5);

        let mut recorded = recorded.into_inner().unwrap();
        recorded.sort();
        assert_eq!(recorded, vec![0, 1, 3, 4]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let (channel, orchestrator, ns) = setup(2).await;
        channel.set_delay(Duration::from_millis(20));
        let chunks: Vec<(u32, Vec<u8>)> = (0..8u32).map(|i| (i, vec![0u8; 1])).collect();
        let results = orchestrator.send_all(&ns, "f", chunks, |_, _| {}).await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(channel.max_in_flight_seen(), 2);
    }

    #[tokio::test]
    async fn test_sends_run_in_parallel() {
        let (channel, orchestrator, ns) = setup(8).await;
        channel.set_delay(Duration::from_millis(20));
        let chunks: Vec<(u32, Vec<u8>)> = (0..4u32).map(|i| (i, vec![0u8; 1])).collect();
        orchestrator.send_all(&ns, "f", chunks, |_, _| {}).await;
        assert_eq!(channel.max_in_flight_seen(), 4);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let channel = Arc::new(MemoryBlobChannel::new());
        let orchestrator =
            TransferOrchestrator::new(channel.clone(), 2, Duration::from_millis(20));
        let ns = orchestrator.create_namespace("/t").await.unwrap();
        channel.set_delay(Duration::from_millis(200));

        let results = orchestrator
            .send_all(&ns, "f", vec![(0, vec![1u8])], |_, _| {})
            .await;
        assert!(matches!(results[0].1, Err(DavError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_fetch_and_delete_all() {
        let (channel, orchestrator, ns) = setup(4).await;
        let chunks: Vec<(u32, Vec<u8>)> = (0..3u32).map(|i| (i, vec![i as u8; 2])).collect();
        let results = orchestrator.send_all(&ns, "f", chunks, |_, _| {}).await;
        let handles: Vec<(u32, BlobHandle)> = results
            .into_iter()
            .map(|(seq, r)| (seq, r.unwrap()))
            .collect();

        channel.fail_fetch_of(&handles[1].1);
        let fetched = orchestrator.fetch_all(handles.clone()).await;
        assert_eq!(fetched[0].1.as_ref().unwrap(), &vec![0u8, 0]);
        assert!(fetched[1].1.is_err());
        assert_eq!(fetched[2].1.as_ref().unwrap(), &vec![2u8, 2]);

        channel.fail_delete_of(&handles[0].1);
        let deleted = orchestrator
            .delete_all(handles.iter().map(|(_, h)| h.clone()).collect())
            .await;
        assert_eq!(deleted.len(), 3);
        assert!(deleted[0].1.is_err());
        assert!(deleted[1].1.is_ok());
        assert!(deleted[2].1.is_ok());
        assert_eq!(channel.blob_count(), 1);

        // deleting an already removed blob is not an error
        let again = orchestrator.delete_all(vec![handles[1].1.clone()]).await;
        assert!(again[0].1.is_ok());
    }
}
