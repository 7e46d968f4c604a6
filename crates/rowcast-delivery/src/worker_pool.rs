//! Worker pool management with structured concurrency.
//!
//! Workers share one receiver. The pool waits for them to drain the queue;
//! once the run is cancelled it gives them a bounded grace period to finish
//! in-flight batches before aborting.

use std::{sync::Arc, time::Duration};

use rowcast_core::Batch;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    worker::{DeliveryWorker, RunContext},
};

/// Supervises the delivery workers of one run.
pub(crate) struct WorkerPool {
    context: Arc<RunContext>,
    queue: Arc<Mutex<mpsc::Receiver<Batch>>>,
    worker_count: usize,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    pub fn new(context: Arc<RunContext>, queue: mpsc::Receiver<Batch>, worker_count: usize) -> Self {
        Self {
            context,
            queue: Arc::new(Mutex::new(queue)),
            worker_count: worker_count.max(1),
            worker_handles: Vec::new(),
        }
    }

    /// Spawns every worker. Returns immediately.
    pub async fn spawn_workers(&mut self) {
        info!(worker_count = self.worker_count, "spawning delivery workers");
        self.context.stats.write().await.active_workers = self.worker_count;

        for worker_id in 0..self.worker_count {
            let worker =
                DeliveryWorker::new(worker_id, Arc::clone(&self.context), Arc::clone(&self.queue));

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }
                result
            });
            self.worker_handles.push(handle);
        }
    }

    /// Waits for every worker to finish.
    ///
    /// Without cancellation this waits as long as the queue keeps producing.
    /// After cancellation, workers waiting for a concurrency slot give up and
    /// the rest get `shutdown_timeout` to finish their current batch.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers outlived the grace period, or
    /// `WorkerPanic` if a worker task panicked.
    pub async fn join(mut self, shutdown_timeout: Duration) -> Result<()> {
        let handles = std::mem::take(&mut self.worker_handles);
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let cancel = self.context.cancel.clone();

        let joined = join_all(handles);
        tokio::pin!(joined);

        let outcome = tokio::select! {
            result = &mut joined => result,
            () = cancel.cancelled() => {
                self.context.limiter.close();
                info!(
                    timeout_seconds = shutdown_timeout.as_secs(),
                    "waiting for in-flight batches before shutdown"
                );
                match tokio::time::timeout(shutdown_timeout, &mut joined).await {
                    Ok(result) => result,
                    Err(_elapsed) => {
                        for abort in aborts {
                            abort.abort();
                        }
                        error!(
                            timeout_seconds = shutdown_timeout.as_secs(),
                            "worker shutdown timed out, aborting remaining workers"
                        );
                        Err(DeliveryError::ShutdownTimeout { timeout: shutdown_timeout })
                    },
                }
            },
        };

        self.context.stats.write().await.active_workers = 0;
        outcome
    }
}

async fn join_all(handles: Vec<JoinHandle<Result<()>>>) -> Result<()> {
    let mut first_panic = None;

    for (worker_id, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(Ok(())) => {},
            Ok(Err(error)) => {
                warn!(worker_id, error = %error, "worker completed with error");
            },
            Err(join_error) => {
                error!(worker_id, error = %join_error, "worker task panicked");
                first_panic.get_or_insert(DeliveryError::WorkerPanic {
                    worker_id,
                    error: join_error.to_string(),
                });
            },
        }
    }

    first_panic.map_or(Ok(()), Err)
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.context.cancel.is_cancelled() {
            warn!(active_workers = active, "worker pool dropped without join, cancelling workers");
            self.context.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        pin::Pin,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use indexmap::IndexMap;
    use rowcast_core::{Clock, IdentityKey, KeyedRecord, MemoryFailureCollector, Record, TestClock};
    use tokio::sync::RwLock;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        checkpoint::ProgressTracker,
        circuit::{CircuitBreaker, CircuitConfig},
        client::DeliveryClient,
        concurrency::AdaptiveLimiter,
        retry::RetryPolicy,
        transport::{Transport, TransportError, TransportResponse},
        worker::EngineStats,
    };

    #[derive(Default)]
    struct Accepting {
        calls: AtomicUsize,
    }

    impl Transport for Accepting {
        fn send<'a>(
            &'a self,
            _batch: &'a Batch,
            _attempt: u32,
        ) -> Pin<Box<dyn Future<Output = std::result::Result<TransportResponse, TransportError>> + Send + 'a>>
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(TransportResponse::status(202)) })
        }
    }

    fn context(transport: Arc<Accepting>, cancel: CancellationToken) -> Arc<RunContext> {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let circuit = Arc::new(CircuitBreaker::new(CircuitConfig::default(), Arc::clone(&clock)));
        Arc::new(RunContext::new(
            DeliveryClient::new(transport, circuit, None, clock),
            AdaptiveLimiter::new(4, true),
            RetryPolicy::default(),
            Arc::new(MemoryFailureCollector::new()),
            None,
            1000,
            true,
            ProgressTracker::new(0, 0),
            Arc::new(RwLock::new(EngineStats::default())),
            cancel,
        ))
    }

    fn batch(seq: u64) -> Batch {
        let mut fields = IndexMap::new();
        fields.insert("email".to_string(), format!("u{seq}@example.com"));
        let record = Record::new(seq, fields);
        Batch::new(seq, vec![KeyedRecord::new(IdentityKey::from_bytes([seq as u8; 32]), record)])
    }

    #[tokio::test]
    async fn workers_drain_queue_then_stop() {
        let transport = Arc::new(Accepting::default());
        let context = context(Arc::clone(&transport), CancellationToken::new());
        let (tx, rx) = mpsc::channel(8);

        let mut pool = WorkerPool::new(Arc::clone(&context), rx, 3);
        pool.spawn_workers().await;
        assert_eq!(context.stats.read().await.active_workers, 3);

        for seq in 0..5 {
            tx.send(batch(seq)).await.unwrap();
        }
        drop(tx);

        pool.join(Duration::from_secs(1)).await.unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 5);
        assert_eq!(context.progress().await, (5, 5));
        let stats = context.stats.read().await.clone();
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.successful_deliveries, 5);
    }

    #[tokio::test]
    async fn cancellation_stops_idle_workers() {
        let cancel = CancellationToken::new();
        let context = context(Arc::new(Accepting::default()), cancel.clone());
        let (_tx, rx) = mpsc::channel::<Batch>(1);

        let mut pool = WorkerPool::new(context, rx, 2);
        pool.spawn_workers().await;
        cancel.cancel();

        pool.join(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_releases_workers_waiting_for_a_slot() {
        let cancel = CancellationToken::new();
        let transport = Arc::new(Accepting::default());
        let context = context(Arc::clone(&transport), cancel.clone());
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(context.limiter.acquire().await.unwrap());
        }

        let (tx, rx) = mpsc::channel(1);
        let mut pool = WorkerPool::new(Arc::clone(&context), rx, 1);
        pool.spawn_workers().await;
        tx.send(batch(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        cancel.cancel();
        pool.join(Duration::from_secs(5)).await.unwrap();

        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(context.progress().await, (0, 0));
        drop(held);
    }
}
