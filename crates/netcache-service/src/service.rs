//! An async front-end to the [`HttpCache`].
//!
//! The [`HttpCache`] itself is single-threaded and never blocks. [`CacheService`] moves it into a
//! dedicated tokio task and feeds it commands over a channel, so any number of async tasks can
//! run [`CachedTransaction`]s concurrently. After every command the cache's deferred tasks are run,
//! and transactions that were waiting for admission are woken up.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use crate::caching::{Backend, CacheContents, CacheError, DataStream};
use crate::http_cache::HttpCache;
use crate::transaction::{Admission, RequestInfo, ResponseInfo, TransactionId};

type Job<B> = Box<dyn FnOnce(&mut Driver<B>) + Send>;

/// A [`Backend`] that can be moved into the task running the cache.
pub trait ServiceBackend: Backend<Entry: Send + 'static> + Send + 'static {}

impl<B> ServiceBackend for B where B: Backend<Entry: Send + 'static> + Send + 'static {}

/// The state owned by the task running the cache.
struct Driver<B: ServiceBackend> {
    cache: HttpCache<B>,
    waiters: HashMap<TransactionId, oneshot::Sender<CacheContents<Admission>>>,
}

impl<B: ServiceBackend> Driver<B> {
    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<Job<B>>) {
        while let Some(job) = jobs.recv().await {
            job(&mut self);
            self.settle();
        }
        tracing::debug!("Cache service shut down");
    }

    /// Runs all deferred work of the cache, and wakes up transactions that were admitted.
    fn settle(&mut self) {
        self.cache.run_pending_tasks();

        for notification in self.cache.take_notifications() {
            match self.waiters.remove(&notification.transaction) {
                Some(waiter) => {
                    let _ = waiter.send(notification.outcome);
                }
                None => tracing::trace!(
                    transaction = %notification.transaction,
                    "Dropping notification without waiter"
                ),
            }
        }
    }
}

/// A handle to an [`HttpCache`] running in the background.
///
/// The cache keeps running as long as there is a handle or a transaction referring to it.
pub struct CacheService<B: ServiceBackend> {
    jobs: mpsc::UnboundedSender<Job<B>>,
}

impl<B: ServiceBackend> Clone for CacheService<B> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
        }
    }
}

impl<B: ServiceBackend> CacheService<B> {
    /// Spawns `cache` onto the current tokio runtime.
    pub fn spawn(cache: HttpCache<B>) -> Self {
        let (jobs, receiver) = mpsc::unbounded_channel();
        let driver = Driver {
            cache,
            waiters: HashMap::new(),
        };
        tokio::spawn(driver.run(receiver));
        Self { jobs }
    }

    fn send(&self, job: Job<B>) -> CacheContents<()> {
        self.jobs.send(job).map_err(|_| CacheError::ServiceClosed)
    }

    async fn call<F, R>(&self, f: F) -> CacheContents<R>
    where
        F: FnOnce(&mut Driver<B>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.send(Box::new(move |driver| {
            let result = f(driver);
            // reply only once the command had all its effects
            driver.settle();
            let _ = sender.send(result);
        }))?;
        receiver.await.map_err(|_| CacheError::ServiceClosed)
    }

    /// Runs `f` with exclusive access to the cache.
    pub async fn with_cache<F, R>(&self, f: F) -> CacheContents<R>
    where
        F: FnOnce(&mut HttpCache<B>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.call(move |driver| f(&mut driver.cache)).await
    }

    /// Starts a transaction for `request`, waiting until it is admitted.
    pub async fn begin(&self, request: RequestInfo) -> CacheContents<CachedTransaction<B>> {
        let id = self.call(|driver| driver.cache.new_transaction()).await?;
        // from here on, dropping the transaction detaches it, even while we are waiting
        let mut transaction = CachedTransaction {
            id,
            admission: Admission::Pending,
            service: self.clone(),
        };

        let (sender, receiver) = oneshot::channel();
        self.call(move |driver| match driver.cache.start_transaction(id, &request) {
            Ok(Admission::Pending) => {
                driver.waiters.insert(id, sender);
            }
            outcome => {
                let _ = sender.send(outcome);
            }
        })
        .await?;

        transaction.admission = receiver.await.map_err(|_| CacheError::ServiceClosed)??;
        tracing::trace!(transaction = %id, admission = ?transaction.admission, "Transaction admitted");
        Ok(transaction)
    }
}

/// A transaction running against a [`CacheService`].
///
/// Dropping the transaction detaches it from its entry. A writer that did not
/// [`finish_writing`](Self::finish_writing) successfully dooms the entry.
pub struct CachedTransaction<B: ServiceBackend> {
    id: TransactionId,
    admission: Admission,
    service: CacheService<B>,
}

impl<B: ServiceBackend> CachedTransaction<B> {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// How the transaction was admitted.
    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub async fn read_response_info(&self) -> CacheContents<ResponseInfo> {
        let id = self.id;
        self.service
            .call(move |driver| driver.cache.read_response_info(id))
            .await?
    }

    pub async fn write_response_info(&self, info: ResponseInfo) -> CacheContents<()> {
        let id = self.id;
        self.service
            .call(move |driver| driver.cache.write_response_info(id, &info))
            .await?
    }

    /// Reads up to `len` bytes from `stream`, starting at `offset`.
    pub async fn read_data(
        &self,
        stream: DataStream,
        offset: usize,
        len: usize,
    ) -> CacheContents<Vec<u8>> {
        let id = self.id;
        self.service
            .call(move |driver| {
                let mut buf = vec![0; len];
                let read = driver.cache.read_data(id, stream, offset, &mut buf)?;
                buf.truncate(read);
                Ok(buf)
            })
            .await?
    }

    /// Reads all of `stream`.
    pub async fn read_to_end(&self, stream: DataStream) -> CacheContents<Vec<u8>> {
        let id = self.id;
        self.service
            .call(move |driver| {
                let size = driver.cache.data_size(id, stream)?;
                let mut buf = vec![0; size];
                let read = driver.cache.read_data(id, stream, 0, &mut buf)?;
                buf.truncate(read);
                Ok(buf)
            })
            .await?
    }

    pub async fn write_data(
        &self,
        stream: DataStream,
        offset: usize,
        data: Vec<u8>,
        truncate: bool,
    ) -> CacheContents<usize> {
        let id = self.id;
        self.service
            .call(move |driver| driver.cache.write_data(id, stream, offset, &data, truncate))
            .await?
    }

    /// Continues as a reader of the stored response.
    pub async fn convert_to_reader(&mut self) -> CacheContents<()> {
        let id = self.id;
        self.service
            .call(move |driver| driver.cache.convert_to_reader(id))
            .await??;
        self.admission = Admission::Reader;
        Ok(())
    }

    /// Ends the write. Without `success`, the entry is doomed.
    pub async fn finish_writing(&mut self, success: bool) -> CacheContents<()> {
        let id = self.id;
        self.service
            .call(move |driver| driver.cache.finish_writing(id, success))
            .await??;
        self.admission = Admission::Bypass;
        Ok(())
    }
}

impl<B: ServiceBackend> Drop for CachedTransaction<B> {
    fn drop(&mut self) {
        let id = self.id;
        // the cache might be gone already, in which case there is nothing to detach from
        let _ = self.service.jobs.send(Box::new(move |driver: &mut Driver<B>| {
            driver.waiters.remove(&id);
            driver.cache.detach_transaction(id);
        }));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use url::Url;

    use crate::caching::{CacheKey, MemoryBackend};

    use super::*;

    fn service() -> (MemoryBackend, CacheService<MemoryBackend>) {
        netcache_test::setup();
        let backend = MemoryBackend::new();
        let service = CacheService::spawn(HttpCache::new(backend.clone()));
        (backend, service)
    }

    fn request() -> RequestInfo {
        RequestInfo::get(Url::parse("http://x/").unwrap())
    }

    async fn store(transaction: &mut CachedTransaction<MemoryBackend>, body: &[u8]) {
        transaction
            .write_response_info(ResponseInfo::fresh(200, vec![]))
            .await
            .unwrap();
        transaction
            .write_data(DataStream::ResponseContent, 0, body.to_vec(), true)
            .await
            .unwrap();
        transaction.finish_writing(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (backend, service) = service();

        let mut writer = service.begin(request()).await.unwrap();
        assert_eq!(writer.admission(), Admission::Writer);
        assert_eq!(
            writer.read_response_info().await,
            Err(CacheError::CacheMiss)
        );
        store(&mut writer, b"hello").await;
        drop(writer);

        let mut reader = service.begin(request()).await.unwrap();
        assert_eq!(reader.admission(), Admission::Writer);
        assert_eq!(reader.read_response_info().await.unwrap().status, 200);
        reader.convert_to_reader().await.unwrap();
        assert_eq!(reader.admission(), Admission::Reader);

        let body = reader
            .read_to_end(DataStream::ResponseContent)
            .await
            .unwrap();
        assert_eq!(body, b"hello");
        let part = reader
            .read_data(DataStream::ResponseContent, 1, 3)
            .await
            .unwrap();
        assert_eq!(part, b"ell");

        let key = CacheKey::builder("GET", &Url::parse("http://x/").unwrap()).build();
        assert!(backend.contains(&key));
    }

    #[tokio::test]
    async fn test_waiting_transaction_is_woken() {
        let (_backend, service) = service();

        let mut writer = service.begin(request()).await.unwrap();

        let waiting = tokio::spawn({
            let service = service.clone();
            async move {
                let transaction = service.begin(request()).await.unwrap();
                let admission = transaction.admission();
                let body = transaction
                    .read_to_end(DataStream::ResponseContent)
                    .await
                    .unwrap();
                (admission, body)
            }
        });

        // give the second transaction a chance to queue up
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        store(&mut writer, b"hello").await;

        let (admission, body) = waiting.await.unwrap();
        assert_eq!(admission, Admission::Writer);
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_dropped_writer_restarts_waiting() {
        let (backend, service) = service();

        let writer = service.begin(request()).await.unwrap();
        writer
            .write_data(DataStream::ResponseContent, 0, b"partial".to_vec(), false)
            .await
            .unwrap();

        let waiting = tokio::spawn({
            let service = service.clone();
            async move {
                let transaction = service.begin(request()).await.unwrap();
                let admission = transaction.admission();
                let size = transaction
                    .read_to_end(DataStream::ResponseContent)
                    .await
                    .unwrap()
                    .len();
                (admission, size)
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(writer);

        let (admission, size) = waiting.await.unwrap();
        assert_eq!(admission, Admission::Writer);
        assert_eq!(size, 0);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_begin_leaves_queue() {
        let (_backend, service) = service();

        let mut writer = service.begin(request()).await.unwrap();

        let begin = service.begin(request());
        let timed_out = tokio::time::timeout(Duration::from_millis(50), begin).await;
        assert!(timed_out.is_err());

        let pending = service
            .with_cache(|cache| {
                let key = CacheKey::builder("GET", &Url::parse("http://x/").unwrap()).build();
                let entry = cache.find_active_entry(&key).unwrap();
                cache.entry_info(entry).unwrap().pending.len()
            })
            .await
            .unwrap();
        assert_eq!(pending, 0);

        store(&mut writer, b"hello").await;
        drop(writer);
        let active = service
            .with_cache(|cache| cache.active_entry_count())
            .await
            .unwrap();
        assert_eq!(active, 0);
    }

    #[tokio::test]
    async fn test_bypass_and_miss() {
        let (_backend, service) = service();

        let request = request().with_header("Range", "bytes=0-1");
        let transaction = service.begin(request).await.unwrap();
        assert_eq!(transaction.admission(), Admission::Bypass);

        let request = self::request().with_load_flags(crate::transaction::LoadFlags::ONLY_FROM_CACHE);
        assert!(matches!(
            service.begin(request).await,
            Err(CacheError::CacheMiss)
        ));
    }
}
