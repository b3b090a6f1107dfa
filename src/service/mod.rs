//! Embedding service
//!
//! The public entry point. Callers ask [`EmbeddingService::embed`] for a
//! vector; the service answers from its cache when it can and otherwise hands
//! the text to the worker, waiting at most `request_timeout` for the result.
//!
//! A timeout releases the caller but does not cancel the computation: a
//! forward pass cannot be interrupted. When the late result arrives it is still
//! written to the cache for the next caller.

pub mod cache;
pub mod metrics;
pub mod worker;

pub use cache::{CacheKey, CacheStats, EmbeddingCache};
pub use metrics::{EmbeddingMetrics, MetricsSnapshot};
pub use worker::{WorkerHandle, WorkerStatus};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::models::{Embedding, EmbeddingConfig, EmbeddingError, EmbeddingResult, ModelLoader};
use worker::{WorkRequest, Worker};

/// Probe text used by [`EmbeddingService::warm_up`]
const WARMUP_TEXT: &str = "warmup";

/// Queue utilization above which the service reports itself degraded
pub const QUEUE_HIGH_WATERMARK: f64 = 0.8;

type Reply = oneshot::Receiver<EmbeddingResult<Embedding>>;

enum Pending {
    Ready(EmbeddingResult<Embedding>),
    Waiting(CacheKey, Reply),
}

/// Snapshot of service state for health and stats endpoints
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub model: &'static str,
    pub effective_dim: usize,
    pub status: WorkerStatus,
    pub cache: CacheStats,
    pub metrics: MetricsSnapshot,
}

/// Coarse service health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Still serving, but the queue is close to full
    Degraded,
    /// Not started or shut down
    Unavailable,
}

pub struct EmbeddingService {
    config: EmbeddingConfig,
    loader: Arc<dyn ModelLoader>,
    cache: Arc<EmbeddingCache>,
    metrics: Arc<EmbeddingMetrics>,
    worker: RwLock<Option<WorkerHandle>>,
    status: Mutex<Option<watch::Receiver<WorkerStatus>>>,
}

impl EmbeddingService {
    pub fn new(config: EmbeddingConfig, loader: Arc<dyn ModelLoader>) -> Self {
        info!(
            model = config.model().name,
            output_dim = config.effective_output_dim(),
            native_dim = config.model().native_dim,
            batch_size = config.batch_size(),
            cache_capacity = config.cache_capacity(),
            "Embedding engine configured"
        );

        Self {
            cache: Arc::new(EmbeddingCache::new(config.cache_capacity())),
            metrics: Arc::new(EmbeddingMetrics::new()),
            worker: RwLock::new(None),
            status: Mutex::new(None),
            loader,
            config,
        }
    }

    /// Start the worker. The model itself is loaded on first use.
    pub fn start(&self) -> EmbeddingResult<()> {
        let mut worker = self.worker.write();
        if worker.is_some() {
            debug!("Embedding service already running");
            return Ok(());
        }

        let handle = Worker::spawn(&self.config, Arc::clone(&self.loader), Arc::clone(&self.metrics))?;
        *self.status.lock() = Some(handle.subscribe());
        *worker = Some(handle);
        info!(model = self.config.model().name, "Embedding service started");
        Ok(())
    }

    /// Embed one text
    pub async fn embed(&self, text: &str) -> EmbeddingResult<Embedding> {
        let deadline = Instant::now() + self.config.request_timeout();
        match self.lookup_or_submit(text, deadline).await {
            Pending::Ready(result) => result,
            Pending::Waiting(key, reply) => self.await_reply(key, reply, deadline).await,
        }
    }

    /// Embed several texts. Every cache miss is queued before any reply is
    /// awaited, so the texts share worker batches. Results are in input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<EmbeddingResult<Embedding>> {
        let deadline = Instant::now() + self.config.request_timeout();

        let mut pending = Vec::with_capacity(texts.len());
        for text in texts {
            pending.push(self.lookup_or_submit(text, deadline).await);
        }

        let mut results = Vec::with_capacity(pending.len());
        for slot in pending {
            results.push(match slot {
                Pending::Ready(result) => result,
                Pending::Waiting(key, reply) => self.await_reply(key, reply, deadline).await,
            });
        }
        results
    }

    /// Force the model to load by computing a warm-up embedding, bypassing the cache
    pub async fn warm_up(&self) -> EmbeddingResult<()> {
        let deadline = Instant::now() + self.config.request_timeout();
        let reply = self.submit(WARMUP_TEXT.to_string(), deadline).await?;
        match tokio::time::timeout_at(deadline, reply).await {
            Ok(Ok(result)) => result.map(|_| ()),
            Ok(Err(_)) => Err(EmbeddingError::unavailable("Embedding worker dropped the request")),
            Err(_) => Err(self.timeout_error()),
        }
    }

    /// Stop accepting work, let the worker drain what is queued, and release the model.
    ///
    /// Returns the number of requests the worker processed. Calling this on a
    /// service that is not running is a no-op.
    pub async fn shutdown(&self, timeout: Duration) -> EmbeddingResult<usize> {
        let handle = self.worker.write().take();
        let Some(handle) = handle else {
            return Ok(0);
        };

        info!(
            queue_depth = self.metrics.queue_depth(),
            "Embedding service shutting down"
        );
        let processed = handle.shutdown(timeout).await?;
        info!(processed, "Embedding service stopped");
        Ok(processed)
    }

    pub fn status(&self) -> WorkerStatus {
        match self.status.lock().as_ref() {
            Some(status) => *status.borrow(),
            None => WorkerStatus::Unloaded,
        }
    }

    /// Watch worker status changes; `None` before [`start`](Self::start)
    pub fn subscribe(&self) -> Option<watch::Receiver<WorkerStatus>> {
        self.status.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.read().is_some()
    }

    /// Fraction of the request queue currently occupied
    pub fn queue_utilization(&self) -> f64 {
        self.metrics.queue_depth() as f64 / self.config.queue_capacity() as f64
    }

    pub fn health(&self) -> HealthStatus {
        if !self.is_running() {
            return HealthStatus::Unavailable;
        }
        let utilization = self.queue_utilization();
        if utilization > QUEUE_HIGH_WATERMARK {
            warn!(
                queue_depth = self.metrics.queue_depth(),
                utilization = %format!("{:.1}%", utilization * 100.0),
                "Embedding queue above high watermark"
            );
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    /// Length of every returned vector
    pub fn dimension(&self) -> usize {
        self.config.effective_output_dim()
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            model: self.config.model().name,
            effective_dim: self.dimension(),
            status: self.status(),
            cache: self.cache.stats(),
            metrics: self.metrics.snapshot(),
        }
    }

    fn cache_key(&self, text: &str) -> CacheKey {
        CacheKey::new(text, self.dimension(), self.config.model().name)
    }

    fn timeout_error(&self) -> EmbeddingError {
        EmbeddingError::Timeout {
            timeout_ms: self.config.request_timeout().as_millis() as u64,
        }
    }

    async fn lookup_or_submit(&self, text: &str, deadline: Instant) -> Pending {
        let key = self.cache_key(text);
        if let Some(embedding) = self.cache.get(&key) {
            debug!(cache = "hit", "Embedding served from cache");
            return Pending::Ready(Ok(embedding));
        }
        debug!(cache = "miss", "Embedding not cached, queueing");

        match self.submit(text.to_string(), deadline).await {
            Ok(reply) => Pending::Waiting(key, reply),
            Err(e) => {
                warn!("Embedding request rejected: {}", e);
                Pending::Ready(Err(e))
            }
        }
    }

    async fn submit(&self, text: String, deadline: Instant) -> EmbeddingResult<Reply> {
        let sender: mpsc::Sender<WorkRequest> = self
            .worker
            .read()
            .as_ref()
            .map(|handle| handle.sender().clone())
            .ok_or_else(|| EmbeddingError::unavailable("Embedding service is not running"))?;

        let (request, reply) = WorkRequest::new(text);
        self.metrics.inc_queue();
        match tokio::time::timeout_at(deadline, sender.send(request)).await {
            Ok(Ok(())) => Ok(reply),
            Ok(Err(_)) => {
                self.metrics.dec_queue();
                Err(EmbeddingError::unavailable("Embedding worker is shutting down"))
            }
            Err(_) => {
                self.metrics.dec_queue();
                Err(EmbeddingError::unavailable("Embedding queue is full"))
            }
        }
    }

    async fn await_reply(&self, key: CacheKey, mut reply: Reply, deadline: Instant) -> EmbeddingResult<Embedding> {
        match tokio::time::timeout_at(deadline, &mut reply).await {
            Ok(Ok(Ok(embedding))) => {
                self.cache.put(key, embedding.clone());
                Ok(embedding)
            }
            Ok(Ok(Err(e))) => {
                warn!("Embedding request failed: {}", e);
                Err(e)
            }
            Ok(Err(_)) => Err(EmbeddingError::unavailable("Embedding worker dropped the request")),
            Err(_) => {
                let error = self.timeout_error();
                warn!("{}", error);

                // The worker keeps going; remember its answer for the next caller
                let cache = Arc::clone(&self.cache);
                tokio::spawn(async move {
                    if let Ok(Ok(embedding)) = reply.await {
                        cache.put(key, embedding);
                    }
                });
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockModelLoader;
    use crate::models::{ErrorKind, ModelDescriptor};

    fn service(config: EmbeddingConfig, loader: &MockModelLoader) -> EmbeddingService {
        let service = EmbeddingService::new(config, Arc::new(loader.clone()));
        service.start().unwrap();
        service
    }

    fn mock_config() -> crate::models::EmbeddingConfigBuilder {
        EmbeddingConfig::builder(ModelDescriptor::MOCK)
    }

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[tokio::test]
    async fn test_qwen3_end_to_end_with_cache_hit() {
        let loader = MockModelLoader::new();
        let config = EmbeddingConfig::new(ModelDescriptor::QWEN3, None).unwrap();
        let service = service(config, &loader);

        let first = service.embed("hello world").await.unwrap();
        assert_eq!(first.len(), 1024);
        assert!((norm(&first) - 1.0).abs() < 1e-4);

        let second = service.embed("hello world").await.unwrap();
        assert_eq!(
            first.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
            second.iter().map(|x| x.to_bits()).collect::<Vec<_>>()
        );
        assert_eq!(loader.forward_passes(), 1);

        let stats = service.stats();
        assert_eq!(stats.cache.hits, 1);
        assert_eq!(stats.cache.misses, 1);
        assert_eq!(stats.metrics.processed_total, 1);

        service.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_mrl_output_dim() {
        let loader = MockModelLoader::new();
        let config = EmbeddingConfig::new(ModelDescriptor::QWEN3, Some(256)).unwrap();
        let service = service(config, &loader);

        let v = service.embed("truncate me").await.unwrap();
        assert_eq!(v.len(), 256);
        assert_eq!(service.dimension(), 256);
        assert!((norm(&v) - 1.0).abs() < 1e-4);

        service.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_not_started_is_unavailable() {
        let service = EmbeddingService::new(
            mock_config().build().unwrap(),
            Arc::new(MockModelLoader::new()),
        );
        let err = service.embed("text").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkerUnavailable);
        assert_eq!(service.status(), WorkerStatus::Unloaded);
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_start_does_not_load_model() {
        let loader = MockModelLoader::new();
        let service = service(mock_config().build().unwrap(), &loader);
        assert!(service.is_running());
        assert_eq!(loader.loads(), 0);
        assert_eq!(service.status(), WorkerStatus::Unloaded);

        service.warm_up().await.unwrap();
        assert_eq!(loader.loads(), 1);
        assert_eq!(service.status(), WorkerStatus::Loaded);
        // Warm-up bypasses the cache
        assert_eq!(service.stats().cache.size, 0);

        service.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_isolation_concurrent_callers() {
        let loader = MockModelLoader::new().with_latency(Duration::from_millis(20));
        let service = service(mock_config().build().unwrap(), &loader);

        let (empty, valid) = tokio::join!(service.embed(""), service.embed("valid text"));
        assert_eq!(empty.unwrap_err().kind(), ErrorKind::EmptyInput);
        assert_eq!(valid.unwrap().len(), 384);

        service.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_embed_batch_shares_worker_batch() {
        let loader = MockModelLoader::new();
        let service = service(mock_config().batch_size(8).build().unwrap(), &loader);

        let texts: Vec<String> = ["alpha", "", "beta gamma"].iter().map(|s| s.to_string()).collect();
        let results = service.embed_batch(&texts).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().kind(), ErrorKind::EmptyInput);
        assert!(results[2].is_ok());

        // Failures are not cached
        assert_eq!(service.stats().cache.size, 2);
        service.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_unload_then_reload_matches() {
        let loader = MockModelLoader::new();
        let config = mock_config()
            .cache_capacity(0)
            .idle_unload_after(Some(Duration::from_millis(100)))
            .build()
            .unwrap();
        let service = service(config, &loader);

        let before = service.embed("stable input").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut status = service.subscribe().unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == WorkerStatus::Unloaded),
        )
        .await
        .unwrap()
        .unwrap();

        let after = service.embed("stable input").await.unwrap();
        assert_eq!(before, after);
        assert_eq!(loader.loads(), 2);
        assert_eq!(service.stats().metrics.idle_unloads, 1);

        service.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_releases_caller_and_still_caches() {
        let loader = MockModelLoader::new().with_latency(Duration::from_millis(200));
        let config = mock_config()
            .request_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let service = service(config, &loader);

        let err = service.embed("slow text").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        // Let the worker finish and the detached task fill the cache
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(service.stats().cache.size, 1);

        let v = service.embed("slow text").await.unwrap();
        assert_eq!(v.len(), 384);
        assert_eq!(loader.forward_passes(), 1);

        service.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_is_unavailable() {
        let loader = MockModelLoader::new().with_latency(Duration::from_millis(300));
        let config = mock_config()
            .batch_size(1)
            .queue_capacity(1)
            .request_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let service = Arc::new(service(config, &loader));

        let busy = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.embed("occupies the worker").await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let queued = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.embed("fills the queue").await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let err = service.embed("no room left").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkerUnavailable);
        assert!(err.is_retryable());

        let _ = busy.await;
        let _ = queued.await;
        service.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_health_degrades_under_queue_pressure() {
        let loader = MockModelLoader::new().with_latency(Duration::from_millis(100));
        let config = mock_config().batch_size(1).queue_capacity(5).build().unwrap();
        let service = Arc::new(EmbeddingService::new(config, Arc::new(loader)));
        assert_eq!(service.health(), HealthStatus::Unavailable);
        service.start().unwrap();
        assert_eq!(service.health(), HealthStatus::Healthy);

        // One request occupies the worker, five more fill the queue
        let mut pending = Vec::new();
        for i in 0..6 {
            let service = Arc::clone(&service);
            pending.push(tokio::spawn(async move {
                service.embed(&format!("queued text {}", i)).await
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(service.queue_utilization() > QUEUE_HIGH_WATERMARK);
        assert_eq!(service.health(), HealthStatus::Degraded);

        for task in pending {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(service.health(), HealthStatus::Healthy);

        service.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(service.health(), HealthStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_shutdown_then_unavailable() {
        let loader = MockModelLoader::new();
        let service = service(mock_config().build().unwrap(), &loader);
        service.embed("one").await.unwrap();

        let processed = service.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(service.status(), WorkerStatus::Stopped);

        let err = service.embed("two").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkerUnavailable);

        // Second shutdown is a no-op
        assert_eq!(service.shutdown(Duration::from_secs(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_compute_failure_reaches_caller() {
        let loader = MockModelLoader::new().with_failing_forward();
        let service = service(mock_config().build().unwrap(), &loader);

        let err = service.embed("anything").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compute);
        assert_eq!(service.stats().metrics.failed_total, 1);

        service.shutdown(Duration::from_secs(5)).await.unwrap();
    }
}
