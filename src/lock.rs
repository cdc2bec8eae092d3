use std::fmt::{self, Debug, Formatter};

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Reader/writer lock guarding the acceptor log, the membership table and the
/// node's request handling.
///
/// Waiters are queued FIFO: a reader arriving while a writer waits queues behind
/// that writer, so neither side can jump the line. Releasing happens when the
/// returned guard is dropped, there is no way to release a lock that was never
/// acquired. The lock is not re-entrant: acquiring it again from the task that
/// already holds the write side deadlocks.
pub struct QuorumLock<T> {
    name: &'static str,
    inner: RwLock<T>,
}

impl<T> QuorumLock<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: RwLock::new(value),
        }
    }

    /// Shared access. Waits while a writer holds or awaits the lock.
    pub async fn read(&self) -> RwLockReadGuard<'_, T> {
        match self.inner.try_read() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::trace!(lock = self.name, "waiting for read access");
                self.inner.read().await
            }
        }
    }

    /// Exclusive access. Waits while any reader or writer is active.
    pub async fn write(&self) -> RwLockWriteGuard<'_, T> {
        match self.inner.try_write() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::trace!(lock = self.name, "waiting for write access");
                self.inner.write().await
            }
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> Debug for QuorumLock<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuorumLock")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::*;

    #[tokio::test]
    async fn readers_share_the_lock() {
        let lock = QuorumLock::new("test", 0u32);

        let first = lock.read().await;
        let second = timeout(Duration::from_millis(100), lock.read())
            .await
            .expect("a second reader must not wait for the first");

        assert_eq!(*first + *second, 0);
    }

    #[tokio::test]
    async fn writer_excludes_readers_and_writers() {
        let lock = Arc::new(QuorumLock::new("test", 0u32));

        let guard = lock.write().await;
        assert!(timeout(Duration::from_millis(50), lock.read()).await.is_err());
        assert!(timeout(Duration::from_millis(50), lock.write()).await.is_err());
        drop(guard);

        assert!(timeout(Duration::from_millis(50), lock.write()).await.is_ok());
    }

    #[tokio::test]
    async fn queued_writer_blocks_new_readers() {
        let lock = Arc::new(QuorumLock::new("test", 0u32));
        let reader = lock.read().await;

        let writer_lock = Arc::clone(&lock);
        let writer = tokio::spawn(async move {
            *writer_lock.write().await += 1;
        });
        sleep(Duration::from_millis(20)).await;

        // the writer is queued behind the active reader, a new reader queues behind the writer
        let late_reader = Arc::clone(&lock);
        let late = tokio::spawn(async move { *late_reader.read().await });

        drop(reader);
        writer.await.unwrap();
        assert_eq!(late.await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_never_lose_updates() {
        let lock = Arc::new(QuorumLock::new("counter", 0u64));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let lock = Arc::clone(&lock);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let mut guard = lock.write().await;
                    let current = *guard;
                    tokio::task::yield_now().await;
                    *guard = current + 1;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*lock.read().await, 1600);
    }
}
