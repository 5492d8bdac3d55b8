use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::store::block::{BlockId, CachedBlock, SharedRef};
use crate::store::cache::{CacheStats, ResidentCache};
use crate::store::reader::BlockReader;

type FetchResult = Result<CachedBlock>;

/// An in-flight fetch. The watch channel broadcasts the single completion
/// event to every subscriber; the ticket ties the fetch to the pending slot
/// so a concurrent put_block can supersede it without being clobbered.
struct Pending {
    ticket: u64,
    tx: watch::Sender<Option<FetchResult>>,
}

struct Inner {
    cache: ResidentCache,
    pending: HashMap<BlockId, Pending>,
    next_ticket: u64,
}

/// Asynchronous get-or-fetch block cache.
///
/// Maps block ids to resident blocks or in-flight fetches. At most one
/// fetch is ever outstanding per id: every caller that misses while a fetch
/// is in flight subscribes to the same completion instead of dispatching a
/// duplicate read. A failed fetch reverts the id to absent, so the next
/// request starts a fresh attempt.
///
/// Must be used within a tokio runtime; fetches are driven on spawned
/// tasks, so an abandoned caller does not cancel a fetch other subscribers
/// (or the cache itself) still benefit from.
pub struct BlockStore {
    reader: Arc<dyn BlockReader>,
    inner: Arc<Mutex<Inner>>,
}

impl BlockStore {
    pub fn new(config: StoreConfig, reader: Arc<dyn BlockReader>) -> Self {
        Self {
            reader,
            inner: Arc::new(Mutex::new(Inner {
                cache: ResidentCache::new(config.cache_capacity),
                pending: HashMap::new(),
                next_ticket: 0,
            })),
        }
    }

    /// Gets a block, fetching it from storage on a miss.
    ///
    /// Resident blocks resolve immediately without suspension. On a miss
    /// the returned future resolves when the (possibly already in-flight)
    /// fetch completes, with the same outcome for every subscriber.
    pub async fn find_block(&self, id: BlockId, expected_size: usize) -> Result<CachedBlock> {
        let (mut rx, ticket) = {
            let mut inner = self.inner.lock().unwrap();

            if let Some(block) = inner.cache.get(&id) {
                return Ok(block);
            }

            match inner.pending.get(&id) {
                Some(pending) => (pending.tx.subscribe(), pending.ticket),
                None => {
                    let (tx, rx) = watch::channel(None);
                    let ticket = inner.next_ticket;
                    inner.next_ticket += 1;
                    inner.pending.insert(id, Pending { ticket, tx });
                    drop(inner);

                    tracing::debug!(block = %id, size = expected_size, "Dispatching block fetch");
                    let reader = self.reader.clone();
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        let result = reader
                            .read_block(id, expected_size)
                            .await
                            .map(|bytes| CachedBlock::new(id, SharedRef::new(bytes)));
                        Self::complete_fetch(&inner, id, ticket, result);
                    });

                    (rx, ticket)
                }
            }
        };

        // Await the completion event outside the lock.
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // The fetch task died without completing (reader panic).
                // Free the slot so a later request can retry.
                let mut inner = self.inner.lock().unwrap();
                if inner.pending.get(&id).map(|p| p.ticket) == Some(ticket) {
                    inner.pending.remove(&id);
                }
                return Err(Error::BlockFetch {
                    id,
                    reason: "fetch aborted".to_string(),
                });
            }
        }
    }

    /// Synchronously installs a block from already-available data,
    /// overwriting any prior entry for the id. Subscribers of an in-flight
    /// fetch for the same id are fulfilled with the put data.
    pub fn put_block(&self, id: BlockId, data: SharedRef) -> CachedBlock {
        let block = CachedBlock::new(id, data);
        let mut inner = self.inner.lock().unwrap();
        if let Some(pending) = inner.pending.remove(&id) {
            let _ = pending.tx.send(Some(Ok(block.clone())));
        }
        inner.cache.insert(block.clone());
        tracing::debug!(block = %id, bytes = block.len(), "Put block");
        block
    }

    /// Whether a block is currently resident (pending fetches don't count).
    pub fn contains(&self, id: BlockId) -> bool {
        self.inner.lock().unwrap().cache.contains(&id)
    }

    /// Total payload bytes currently resident.
    pub fn memory_usage(&self) -> usize {
        self.inner.lock().unwrap().cache.memory_usage()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap().cache.stats()
    }

    fn complete_fetch(inner: &Mutex<Inner>, id: BlockId, ticket: u64, result: FetchResult) {
        let mut inner = inner.lock().unwrap();

        // A put_block may have superseded this fetch; if so its subscribers
        // were already fulfilled and the slot belongs to someone else.
        if inner.pending.get(&id).map(|p| p.ticket) != Some(ticket) {
            return;
        }
        let pending = inner
            .pending
            .remove(&id)
            .expect("pending entry checked above");

        match &result {
            Ok(block) => {
                inner.cache.insert(block.clone());
                tracing::debug!(block = %id, bytes = block.len(), "Block fetch completed");
            }
            Err(e) => {
                // Revert to absent so the next request retries.
                tracing::warn!(block = %id, error = %e, "Block fetch failed");
            }
        }
        drop(inner);

        let _ = pending.tx.send(Some(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Reader that counts dispatches and can be gated to hold fetches open.
    struct MockReader {
        reads: AtomicUsize,
        gate: Option<Arc<Notify>>,
        fail: std::sync::Mutex<usize>,
    }

    impl MockReader {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reads: AtomicUsize::new(0),
                gate: None,
                fail: std::sync::Mutex::new(0),
            })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                reads: AtomicUsize::new(0),
                gate: Some(gate),
                fail: std::sync::Mutex::new(0),
            })
        }

        fn fail_next(&self, count: usize) {
            *self.fail.lock().unwrap() = count;
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BlockReader for MockReader {
        async fn read_block(&self, id: BlockId, size: usize) -> Result<Vec<u8>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            {
                let mut fail = self.fail.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(Error::BlockFetch {
                        id,
                        reason: "injected failure".to_string(),
                    });
                }
            }
            Ok(vec![id.index as u8; size])
        }
    }

    fn store(reader: Arc<MockReader>) -> BlockStore {
        BlockStore::new(StoreConfig::default().cache_capacity(1024 * 1024), reader)
    }

    #[tokio::test]
    async fn test_fetch_and_hit() -> Result<()> {
        let reader = MockReader::new();
        let store = store(reader.clone());
        let id = BlockId::new(1, 7);

        let block = store.find_block(id, 64).await?;
        assert_eq!(block.id(), id);
        assert_eq!(block.data().as_slice(), &[7u8; 64][..]);
        assert_eq!(reader.reads(), 1);

        // Second access is a resident hit: no new dispatch.
        let again = store.find_block(id, 64).await?;
        assert_eq!(again.data(), block.data());
        assert_eq!(reader.reads(), 1);

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_single_flight() -> Result<()> {
        let gate = Arc::new(Notify::new());
        let reader = MockReader::gated(gate.clone());
        let store = Arc::new(store(reader.clone()));
        let id = BlockId::new(1, 3);

        let first = tokio::spawn({
            let store = store.clone();
            async move { store.find_block(id, 32).await }
        });
        let second = tokio::spawn({
            let store = store.clone();
            async move { store.find_block(id, 32).await }
        });

        // Let both callers reach the pending state, then release the read.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        gate.notify_waiters();

        let a = first.await.unwrap()?;
        let b = second.await.unwrap()?;
        assert_eq!(a.data(), b.data());

        // Exactly one fetch was dispatched for both callers.
        assert_eq!(reader.reads(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_fans_out_and_allows_retry() -> Result<()> {
        let reader = MockReader::new();
        reader.fail_next(1);
        let store = store(reader.clone());
        let id = BlockId::new(2, 0);

        let err = store.find_block(id, 16).await.unwrap_err();
        assert!(matches!(err, Error::BlockFetch { .. }));

        // The entry reverted to absent: a fresh request dispatches again
        // and succeeds.
        assert!(!store.contains(id));
        let block = store.find_block(id, 16).await?;
        assert_eq!(block.len(), 16);
        assert_eq!(reader.reads(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_put_block_hits_without_fetch() -> Result<()> {
        let reader = MockReader::new();
        let store = store(reader.clone());
        let id = BlockId::new(3, 1);

        let put = store.put_block(id, SharedRef::from_slice(b"direct data"));
        assert_eq!(put.len(), 11);
        assert!(store.contains(id));

        let found = store.find_block(id, 11).await?;
        assert_eq!(found.data().as_slice(), b"direct data");
        assert_eq!(reader.reads(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_put_block_overwrites() -> Result<()> {
        let reader = MockReader::new();
        let store = store(reader.clone());
        let id = BlockId::new(3, 2);

        store.put_block(id, SharedRef::from_slice(b"old"));
        store.put_block(id, SharedRef::from_slice(b"new data"));

        let found = store.find_block(id, 8).await?;
        assert_eq!(found.data().as_slice(), b"new data");
        Ok(())
    }

    #[tokio::test]
    async fn test_put_fulfills_pending_subscribers() -> Result<()> {
        let gate = Arc::new(Notify::new());
        let reader = MockReader::gated(gate.clone());
        let store = Arc::new(store(reader.clone()));
        let id = BlockId::new(4, 0);

        let waiter = tokio::spawn({
            let store = store.clone();
            async move { store.find_block(id, 9).await }
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        // The put supersedes the in-flight fetch and resolves the waiter.
        store.put_block(id, SharedRef::from_slice(b"put bytes"));
        let block = waiter.await.unwrap()?;
        assert_eq!(block.data().as_slice(), b"put bytes");

        // Releasing the gated read must not clobber the put data.
        gate.notify_waiters();
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let current = store.find_block(id, 9).await?;
        assert_eq!(current.data().as_slice(), b"put bytes");
        Ok(())
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel_fetch() -> Result<()> {
        let gate = Arc::new(Notify::new());
        let reader = MockReader::gated(gate.clone());
        let store = Arc::new(store(reader.clone()));
        let id = BlockId::new(5, 0);

        let abandoned = tokio::spawn({
            let store = store.clone();
            async move { store.find_block(id, 8).await }
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        abandoned.abort();

        gate.notify_waiters();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        // The fetch completed and populated the cache anyway.
        assert!(store.contains(id));
        assert_eq!(reader.reads(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_eviction_under_capacity_pressure() -> Result<()> {
        let reader = MockReader::new();
        let store = BlockStore::new(StoreConfig::default().cache_capacity(256), reader.clone());

        for i in 0..8 {
            store.find_block(BlockId::new(6, i), 64).await?;
        }
        assert!(store.memory_usage() <= 256);

        // A re-request of an evicted block dispatches a fresh fetch.
        let before = reader.reads();
        store.find_block(BlockId::new(6, 0), 64).await?;
        assert_eq!(reader.reads(), before + 1);
        Ok(())
    }
}
