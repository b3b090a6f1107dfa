//! Embedding worker
//!
//! The worker is the only owner of the [`InferenceEngine`]. It runs on a
//! dedicated thread with its own single-threaded runtime, turns the stream of
//! queued requests into batches, and releases the model after a configured
//! idle period. Because nothing else ever holds the engine, the model needs no
//! lock.

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::InferenceEngine;
use crate::models::{
    Embedding, EmbeddingConfig, EmbeddingError, EmbeddingResult, ModelDescriptor, ModelLoader,
};
use crate::service::metrics::EmbeddingMetrics;

/// One queued embedding request
#[derive(Debug)]
pub struct WorkRequest {
    pub text: String,
    pub reply: oneshot::Sender<EmbeddingResult<Embedding>>,
}

impl WorkRequest {
    pub fn new(text: impl Into<String>) -> (Self, oneshot::Receiver<EmbeddingResult<Embedding>>) {
        let (reply, receiver) = oneshot::channel();
        (
            Self {
                text: text.into(),
                reply,
            },
            receiver,
        )
    }
}

/// Externally observable worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Unloaded,
    Loading,
    Loaded,
    Stopped,
}

enum WorkerState {
    Unloaded,
    Loaded {
        engine: InferenceEngine,
        last_access: Instant,
    },
}

/// Service-side handle to a running worker
#[derive(Debug)]
pub struct WorkerHandle {
    sender: mpsc::Sender<WorkRequest>,
    status: watch::Receiver<WorkerStatus>,
    done: oneshot::Receiver<usize>,
}

impl WorkerHandle {
    pub fn sender(&self) -> &mpsc::Sender<WorkRequest> {
        &self.sender
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status.clone()
    }

    /// Close the queue and wait for the worker to drain it.
    ///
    /// Requests already queued are still served. Returns the number of
    /// requests the worker processed over its lifetime.
    pub async fn shutdown(self, timeout: Duration) -> EmbeddingResult<usize> {
        let WorkerHandle { sender, done, .. } = self;
        drop(sender);

        match tokio::time::timeout(timeout, done).await {
            Ok(Ok(processed)) => Ok(processed),
            Ok(Err(_)) => Err(EmbeddingError::unavailable("Embedding worker exited unexpectedly")),
            Err(_) => {
                warn!("Embedding worker shutdown timed out");
                Err(EmbeddingError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

pub struct Worker {
    queue: mpsc::Receiver<WorkRequest>,
    loader: Arc<dyn ModelLoader>,
    descriptor: ModelDescriptor,
    effective_dim: usize,
    batch_size: usize,
    idle_unload_after: Option<Duration>,
    state: WorkerState,
    metrics: Arc<EmbeddingMetrics>,
    status: watch::Sender<WorkerStatus>,
}

impl Worker {
    /// Start a worker thread for `config`. The model is not loaded until the
    /// first request arrives.
    pub fn spawn(
        config: &EmbeddingConfig,
        loader: Arc<dyn ModelLoader>,
        metrics: Arc<EmbeddingMetrics>,
    ) -> EmbeddingResult<WorkerHandle> {
        let (sender, queue) = mpsc::channel(config.queue_capacity());
        let (status_tx, status_rx) = watch::channel(WorkerStatus::Unloaded);
        let (done_tx, done_rx) = oneshot::channel();

        let worker = Worker {
            queue,
            loader,
            descriptor: *config.model(),
            effective_dim: config.effective_output_dim(),
            batch_size: config.batch_size(),
            idle_unload_after: config.idle_unload_after(),
            state: WorkerState::Unloaded,
            metrics,
            status: status_tx,
        };

        std::thread::Builder::new()
            .name("embedding-worker".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to build embedding worker runtime: {}", e);
                        return;
                    }
                };
                let processed = runtime.block_on(worker.run());
                let _ = done_tx.send(processed);
            })
            .map_err(|e| EmbeddingError::unavailable(format!("Failed to spawn worker thread: {}", e)))?;

        Ok(WorkerHandle {
            sender,
            status: status_rx,
            done: done_rx,
        })
    }

    /// Serve batches until every sender is gone and the queue is drained
    pub async fn run(mut self) -> usize {
        info!(
            model = self.descriptor.name,
            effective_dim = self.effective_dim,
            batch_size = self.batch_size,
            idle_unload_after_ms = self.idle_unload_after.map(|d| d.as_millis() as u64),
            "Embedding worker started"
        );

        let mut processed_count = 0;
        while let Some(first) = self.next_request().await {
            self.metrics.dec_queue();
            let mut batch = Vec::with_capacity(self.batch_size);
            batch.push(first);

            // Take whatever is already queued; never wait for more
            while batch.len() < self.batch_size {
                match self.queue.try_recv() {
                    Ok(request) => {
                        self.metrics.dec_queue();
                        batch.push(request);
                    }
                    Err(_) => break,
                }
            }

            processed_count += self.process_batch(batch).await;
        }

        self.release("shutdown");
        self.status.send_replace(WorkerStatus::Stopped);
        info!(processed_count, "Embedding worker shutdown complete");
        processed_count
    }

    /// Wait for the next request, unloading the model if it sits idle too long
    async fn next_request(&mut self) -> Option<WorkRequest> {
        loop {
            let deadline = match (&self.state, self.idle_unload_after) {
                (WorkerState::Loaded { last_access, .. }, Some(idle)) => *last_access + idle,
                _ => return self.queue.recv().await,
            };

            let woke = tokio::select! {
                biased;

                request = self.queue.recv() => Some(request),
                _ = tokio::time::sleep_until(deadline) => None,
            };

            match woke {
                Some(request) => return request,
                None => {
                    self.metrics.inc_idle_unloads();
                    self.release("idle");
                }
            }
        }
    }

    /// Drop the engine, if any
    fn release(&mut self, reason: &'static str) {
        if let WorkerState::Loaded { last_access, .. } =
            std::mem::replace(&mut self.state, WorkerState::Unloaded)
        {
            info!(
                model = self.descriptor.name,
                reason,
                idle_ms = last_access.elapsed().as_millis() as u64,
                "Embedding model unloaded"
            );
            self.status.send_replace(WorkerStatus::Unloaded);
        }
    }

    async fn ensure_loaded(&mut self) -> EmbeddingResult<()> {
        if matches!(self.state, WorkerState::Loaded { .. }) {
            return Ok(());
        }

        self.status.send_replace(WorkerStatus::Loading);
        let started = Instant::now();
        info!(
            model = self.descriptor.name,
            loader = self.loader.name(),
            "Loading embedding model"
        );

        // Run the loader as its own task so a panic surfaces as a JoinError
        let loader = Arc::clone(&self.loader);
        let descriptor = self.descriptor;
        let loaded = match tokio::spawn(async move { loader.load(&descriptor).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(EmbeddingError::ModelLoadFailed {
                model_name: self.descriptor.name.to_string(),
                error: "Model loader panicked".to_string(),
            }),
            Err(e) => Err(EmbeddingError::ModelLoadFailed {
                model_name: self.descriptor.name.to_string(),
                error: format!("Model load task failed: {}", e),
            }),
        };

        match loaded {
            Ok(engine) => {
                self.metrics.inc_model_loads();
                self.state = WorkerState::Loaded {
                    engine,
                    last_access: Instant::now(),
                };
                self.status.send_replace(WorkerStatus::Loaded);
                info!(
                    model = self.descriptor.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Embedding model ready"
                );
                Ok(())
            }
            Err(e) => {
                self.status.send_replace(WorkerStatus::Unloaded);
                error!(model = self.descriptor.name, "Failed to load embedding model: {}", e);
                Err(e)
            }
        }
    }

    /// Compute one batch and deliver every outcome. Returns the number of
    /// requests answered.
    #[instrument(skip(self, batch), fields(batch_size = batch.len()))]
    async fn process_batch(&mut self, batch: Vec<WorkRequest>) -> usize {
        let received = batch.len();
        let batch: Vec<WorkRequest> = batch.into_iter().filter(|r| !r.reply.is_closed()).collect();
        if batch.len() < received {
            debug!(abandoned = received - batch.len(), "Skipping requests whose callers are gone");
        }
        if batch.is_empty() {
            return 0;
        }

        let (texts, replies): (Vec<String>, Vec<_>) =
            batch.into_iter().map(|r| (r.text, r.reply)).unzip();
        let count = replies.len();

        if let Err(e) = self.ensure_loaded().await {
            self.metrics.inc_failed(count as u64);
            for reply in replies {
                let _ = reply.send(Err(e.clone()));
            }
            return count;
        }

        self.metrics.inc_batches();
        let effective_dim = self.effective_dim;
        let outcome = match &mut self.state {
            WorkerState::Loaded { engine, last_access } => {
                let outcome = catch_unwind(AssertUnwindSafe(|| engine.compute(&texts, effective_dim)));
                *last_access = Instant::now();
                outcome
            }
            WorkerState::Unloaded => Ok(Err(EmbeddingError::unavailable("Model not loaded"))),
        };

        let results = match outcome {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => {
                warn!(model = self.descriptor.name, "Batch embedding failed: {}", e);
                vec![Err(e); count]
            }
            Err(_) => {
                error!(model = self.descriptor.name, "Inference engine panicked, releasing model");
                self.release("panic");
                let e = EmbeddingError::compute(self.descriptor.name, "Inference engine panicked");
                vec![Err(e); count]
            }
        };

        for (reply, result) in replies.into_iter().zip(results) {
            match &result {
                Ok(_) => self.metrics.inc_processed(1),
                Err(e) => {
                    debug!("Embedding request failed: {}", e);
                    self.metrics.inc_failed(1);
                }
            }
            let _ = reply.send(result);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockModelLoader;
    use crate::models::ErrorKind;

    fn config(batch_size: usize, idle: Option<Duration>) -> EmbeddingConfig {
        EmbeddingConfig::builder(ModelDescriptor::MOCK)
            .batch_size(batch_size)
            .idle_unload_after(idle)
            .build()
            .unwrap()
    }

    async fn submit(
        handle: &WorkerHandle,
        text: &str,
    ) -> oneshot::Receiver<EmbeddingResult<Embedding>> {
        let (request, receiver) = WorkRequest::new(text);
        handle.sender().send(request).await.unwrap();
        receiver
    }

    async fn wait_for(handle: &WorkerHandle, wanted: WorkerStatus) {
        let mut status = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == wanted))
            .await
            .expect("status not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_lazy_load_on_first_request() {
        let loader = MockModelLoader::new();
        let handle = Worker::spawn(
            &config(4, None),
            Arc::new(loader.clone()),
            Arc::new(EmbeddingMetrics::new()),
        )
        .unwrap();

        assert_eq!(handle.status(), WorkerStatus::Unloaded);
        assert_eq!(loader.loads(), 0);

        let v = submit(&handle, "hello").await.await.unwrap().unwrap();
        assert_eq!(v.len(), 384);
        assert_eq!(handle.status(), WorkerStatus::Loaded);
        assert_eq!(loader.loads(), 1);

        handle.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_batches_never_exceed_batch_size() {
        let loader = MockModelLoader::new().with_latency(Duration::from_millis(30));
        let metrics = Arc::new(EmbeddingMetrics::new());
        let handle = Worker::spawn(&config(2, None), Arc::new(loader.clone()), metrics.clone()).unwrap();

        let mut receivers = Vec::new();
        for i in 0..5 {
            receivers.push(submit(&handle, &format!("text number {}", i)).await);
        }
        for receiver in receivers {
            assert!(receiver.await.unwrap().is_ok());
        }

        let snapshot = metrics.snapshot();
        assert!(snapshot.batches_total >= 3);
        assert_eq!(snapshot.batches_total as usize, loader.forward_passes());
        assert_eq!(snapshot.processed_total, 5);
        assert_eq!(snapshot.queue_depth, 0);

        handle.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_input_isolated_within_batch() {
        let loader = MockModelLoader::new().with_latency(Duration::from_millis(30));
        let handle = Worker::spawn(
            &config(8, None),
            Arc::new(loader),
            Arc::new(EmbeddingMetrics::new()),
        )
        .unwrap();

        // Occupy the worker so the next two requests share a batch
        let warm = submit(&handle, "warm up").await;
        let empty = submit(&handle, "").await;
        let valid = submit(&handle, "valid text").await;

        assert!(warm.await.unwrap().is_ok());
        let err = empty.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyInput);
        assert_eq!(valid.await.unwrap().unwrap().len(), 384);

        handle.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_unload_and_reload() {
        let loader = MockModelLoader::new();
        let metrics = Arc::new(EmbeddingMetrics::new());
        let handle = Worker::spawn(
            &config(4, Some(Duration::from_millis(100))),
            Arc::new(loader.clone()),
            metrics.clone(),
        )
        .unwrap();

        let before = submit(&handle, "same input").await.await.unwrap().unwrap();
        assert_eq!(handle.status(), WorkerStatus::Loaded);

        tokio::time::sleep(Duration::from_millis(150)).await;
        wait_for(&handle, WorkerStatus::Unloaded).await;
        assert_eq!(metrics.snapshot().idle_unloads, 1);

        let after = submit(&handle, "same input").await.await.unwrap().unwrap();
        assert_eq!(before, after);
        assert_eq!(loader.loads(), 2);

        handle.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_failure_reported_and_worker_survives() {
        let handle = Worker::spawn(
            &config(4, None),
            Arc::new(MockModelLoader::new().with_failing_load()),
            Arc::new(EmbeddingMetrics::new()),
        )
        .unwrap();

        for _ in 0..2 {
            let err = submit(&handle, "text").await.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ModelLoad);
        }
        assert_eq!(handle.status(), WorkerStatus::Unloaded);

        handle.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_compute_failure_fails_whole_batch() {
        let metrics = Arc::new(EmbeddingMetrics::new());
        let handle = Worker::spawn(
            &config(4, None),
            Arc::new(MockModelLoader::new().with_failing_forward()),
            metrics.clone(),
        )
        .unwrap();

        let err = submit(&handle, "text").await.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compute);
        assert_eq!(metrics.snapshot().failed_total, 1);

        handle.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_loader_panic_does_not_kill_worker() {
        let handle = Worker::spawn(
            &config(4, None),
            Arc::new(MockModelLoader::new().with_panicking_load()),
            Arc::new(EmbeddingMetrics::new()),
        )
        .unwrap();

        for _ in 0..2 {
            let err = submit(&handle, "text").await.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ModelLoad);
            assert!(err.to_string().contains("panicked"));
        }
        assert_eq!(handle.status(), WorkerStatus::Unloaded);

        assert_eq!(handle.shutdown(Duration::from_secs(5)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_compute_panic_releases_model_and_reloads() {
        let loader = MockModelLoader::new().with_panicking_forward();
        let metrics = Arc::new(EmbeddingMetrics::new());
        let handle = Worker::spawn(&config(4, None), Arc::new(loader.clone()), metrics.clone()).unwrap();

        let err = submit(&handle, "first").await.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compute);
        assert_eq!(handle.status(), WorkerStatus::Unloaded);
        assert_eq!(loader.loads(), 1);

        // The worker survives and loads a fresh engine for the next batch
        let err = submit(&handle, "second").await.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compute);
        assert_eq!(loader.loads(), 2);
        assert_eq!(metrics.snapshot().failed_total, 2);

        handle.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_requests_are_skipped() {
        let loader = MockModelLoader::new().with_latency(Duration::from_millis(50));
        let metrics = Arc::new(EmbeddingMetrics::new());
        let handle = Worker::spawn(&config(8, None), Arc::new(loader.clone()), metrics.clone()).unwrap();

        // Keep the worker busy while the abandoned request waits in the queue
        let busy = submit(&handle, "keeps the worker busy").await;
        let (abandoned, receiver) = WorkRequest::new("caller went away");
        drop(receiver);
        handle.sender().send(abandoned).await.unwrap();
        assert!(busy.await.unwrap().is_ok());

        let after = submit(&handle, "still served").await;
        assert!(after.await.unwrap().is_ok());

        assert_eq!(loader.forward_passes(), 2);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.processed_total, 2);
        assert_eq!(snapshot.failed_total, 0);

        assert_eq!(handle.shutdown(Duration::from_secs(5)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let loader = MockModelLoader::new().with_latency(Duration::from_millis(20));
        let handle = Worker::spawn(
            &config(1, None),
            Arc::new(loader),
            Arc::new(EmbeddingMetrics::new()),
        )
        .unwrap();

        let mut receivers = Vec::new();
        for i in 0..3 {
            receivers.push(submit(&handle, &format!("pending {}", i)).await);
        }
        let mut status = handle.subscribe();

        let processed = handle.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(processed, 3);
        for receiver in receivers {
            assert!(receiver.await.unwrap().is_ok());
        }
        assert_eq!(*status.borrow_and_update(), WorkerStatus::Stopped);
    }
}
