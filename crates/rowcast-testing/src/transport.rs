//! Scripted transport for driving the delivery client without a network.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rowcast_core::Batch;
use rowcast_delivery::{ItemResult, Transport, TransportError, TransportResponse};
use tokio_util::sync::CancellationToken;

type Reply = Result<TransportResponse, TransportError>;
type Responder = dyn Fn(&Batch, u32) -> Reply + Send + Sync;

/// One observed transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportCall {
    /// Sequence number of the batch sent.
    pub batch_seq: u64,
    /// Attempt number the client reported.
    pub attempt: u32,
    /// Offsets of the records in the batch.
    pub offsets: Vec<u64>,
    /// Status returned, if a response was produced.
    pub status: Option<u16>,
}

#[derive(Default)]
struct Script {
    replies: VecDeque<Reply>,
    calls: Vec<TransportCall>,
    cancel_after: Option<(usize, CancellationToken)>,
}

/// Transport returning queued replies, then a fallback.
///
/// Queued replies are consumed in call order across all workers. Once the
/// queue is empty every call gets the fallback, which defaults to `202`.
#[derive(Clone)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    fallback: Arc<Responder>,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport").field("calls", &self.calls().len()).finish_non_exhaustive()
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    /// Accepts everything.
    pub fn new() -> Self {
        Self::responding(|_, _| Ok(TransportResponse::status(202)))
    }

    /// Answers every unscripted call with `responder`.
    pub fn responding(responder: impl Fn(&Batch, u32) -> Reply + Send + Sync + 'static) -> Self {
        Self { script: Arc::default(), fallback: Arc::new(responder) }
    }

    /// Answers every unscripted call with `status`.
    pub fn always(status: u16) -> Self {
        Self::responding(move |_, _| Ok(TransportResponse::status(status)))
    }

    /// Rejects the records at `offsets` with `status` through per-item
    /// results and accepts the rest.
    pub fn rejecting(offsets: Vec<u64>, status: u16) -> Self {
        Self::responding(move |batch, _| {
            let results = batch
                .items()
                .iter()
                .enumerate()
                .map(|(index, item)| {
                    let rejected = offsets.contains(&item.record.offset());
                    ItemResult {
                        index,
                        status: if rejected { status } else { 202 },
                        message: rejected.then(|| "rejected by test".to_string()),
                    }
                })
                .collect();
            Ok(TransportResponse::status(202).with_item_results(results))
        })
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a reply.
    #[must_use]
    pub fn then(self, reply: Reply) -> Self {
        self.script().replies.push_back(reply);
        self
    }

    /// Queues a bare status reply.
    #[must_use]
    pub fn then_status(self, status: u16) -> Self {
        self.then(Ok(TransportResponse::status(status)))
    }

    /// Queues a `429` with a `Retry-After` hint.
    #[must_use]
    pub fn then_throttle(self, retry_after: Duration) -> Self {
        self.then(Ok(TransportResponse::status(429).with_retry_after(retry_after)))
    }

    /// Queues a transport failure.
    #[must_use]
    pub fn then_error(self, error: TransportError) -> Self {
        self.then(Err(error))
    }

    /// Cancels `token` once `calls` calls have completed.
    #[must_use]
    pub fn cancel_after(self, calls: usize, token: CancellationToken) -> Self {
        self.script().cancel_after = Some((calls, token));
        self
    }

    /// Every call observed so far.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.script().calls.clone()
    }

    /// Sizes of the batches sent, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.calls().iter().map(|call| call.offsets.len()).collect()
    }

    /// Offsets of every record that appeared in a `2xx` call.
    pub fn offsets_sent_ok(&self) -> Vec<u64> {
        self.calls()
            .iter()
            .filter(|call| call.status.is_some_and(|status| (200..300).contains(&status)))
            .flat_map(|call| call.offsets.iter().copied())
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn send<'a>(
        &'a self,
        batch: &'a Batch,
        attempt: u32,
    ) -> Pin<Box<dyn Future<Output = Reply> + Send + 'a>> {
        let queued = self.script().replies.pop_front();
        let reply = queued.unwrap_or_else(|| (self.fallback)(batch, attempt));

        let mut script = self.script();
        script.calls.push(TransportCall {
            batch_seq: batch.seq(),
            attempt,
            offsets: batch.offsets().collect(),
            status: reply.as_ref().ok().map(|response| response.status),
        });
        if let Some((limit, token)) = &script.cancel_after {
            if script.calls.len() >= *limit {
                token.cancel();
            }
        }
        drop(script);

        Box::pin(async move { reply })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use rowcast_core::{IdentityKey, KeyedRecord, Record};

    use super::*;

    fn batch(offsets: &[u64]) -> Batch {
        let items = offsets
            .iter()
            .map(|&offset| {
                KeyedRecord::new(IdentityKey::from_bytes([offset as u8; 32]), Record::new(offset, IndexMap::new()))
            })
            .collect();
        Batch::new(0, items)
    }

    #[tokio::test]
    async fn queued_replies_come_first() {
        let transport = ScriptedTransport::new().then_status(503);
        let batch = batch(&[0, 1]);

        assert_eq!(transport.send(&batch, 1).await.unwrap().status, 503);
        assert_eq!(transport.send(&batch, 2).await.unwrap().status, 202);
        assert_eq!(transport.batch_sizes(), vec![2, 2]);
        assert_eq!(transport.offsets_sent_ok(), vec![0, 1]);
    }

    #[tokio::test]
    async fn rejecting_marks_selected_items() {
        let transport = ScriptedTransport::rejecting(vec![1], 400);
        let response = transport.send(&batch(&[0, 1, 2]), 1).await.unwrap();
        let results = response.item_results.unwrap();

        assert!(results[0].is_accepted());
        assert_eq!(results[1].status, 400);
    }
}
