//! Channels between pipeline stages.
//!
//! Every source type gets its own bounded namespace channel, so a flood from
//! one feed type only back-pressures the producers of that type. Publishers
//! block up to `publish_timeout` on a full channel and then give up.

use metrics::counter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::error::StreamError;
use crate::ingest::types::{RawRecord, SourceType};

pub const DEFAULT_STREAM_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct StreamHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    senders: HashMap<SourceType, mpsc::Sender<RawRecord>>,
    receivers: Mutex<Option<HashMap<SourceType, mpsc::Receiver<RawRecord>>>>,
    publish_timeout: Duration,
}

impl StreamHub {
    pub fn new(capacity: usize, publish_timeout: Duration) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for t in SourceType::ALL {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.insert(t, tx);
            receivers.insert(t, rx);
        }
        Self {
            inner: Arc::new(HubInner {
                senders,
                receivers: Mutex::new(Some(receivers)),
                publish_timeout,
            }),
        }
    }

    pub fn publisher(&self, namespace: SourceType) -> StreamPublisher {
        StreamPublisher {
            namespace,
            // every namespace is created in `new`
            tx: self.inner.senders[&namespace].clone(),
            timeout: self.inner.publish_timeout,
        }
    }

    /// Hands every namespace receiver to one consumer. Only the first call succeeds.
    pub fn subscribe_all(&self) -> Result<RawRecordStreams, StreamError> {
        let mut slot = self
            .inner
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let map = slot
            .take()
            .ok_or_else(|| StreamError::AlreadySubscribed("raw-records".into()))?;
        let mut receivers: Vec<_> = map.into_iter().collect();
        receivers.sort_by_key(|(t, _)| *t);
        Ok(RawRecordStreams { receivers, next: 0 })
    }
}

/// Producer side of one namespace, held by ingestion actors.
#[derive(Clone, Debug)]
pub struct StreamPublisher {
    namespace: SourceType,
    tx: mpsc::Sender<RawRecord>,
    timeout: Duration,
}

impl StreamPublisher {
    pub fn namespace(&self) -> SourceType {
        self.namespace
    }

    pub async fn publish(&self, record: RawRecord) -> Result<(), StreamError> {
        match self.tx.send_timeout(record, self.timeout).await {
            Ok(()) => {
                counter!("stream_published_total", "namespace" => self.namespace.as_str()).increment(1);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => {
                counter!("stream_publish_timeouts_total", "namespace" => self.namespace.as_str())
                    .increment(1);
                Err(StreamError::Full(self.namespace.to_string()))
            }
            Err(SendTimeoutError::Closed(_)) => Err(StreamError::Closed(self.namespace.to_string())),
        }
    }
}

/// Consumer side of all namespaces, polled round-robin.
pub struct RawRecordStreams {
    receivers: Vec<(SourceType, mpsc::Receiver<RawRecord>)>,
    next: usize,
}

impl RawRecordStreams {
    /// Next record from any namespace; `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<RawRecord> {
        std::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    pub fn namespaces(&self) -> Vec<SourceType> {
        self.receivers.iter().map(|(t, _)| *t).collect()
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<RawRecord>> {
        let len = self.receivers.len();
        let mut closed = Vec::new();
        for offset in 0..len {
            let idx = (self.next + offset) % len;
            match self.receivers[idx].1.poll_recv(cx) {
                Poll::Ready(Some(record)) => {
                    self.next = (idx + 1) % len;
                    return Poll::Ready(Some(record));
                }
                Poll::Ready(None) => closed.push(idx),
                Poll::Pending => {}
            }
        }
        if !closed.is_empty() {
            closed.sort_unstable_by(|a, b| b.cmp(a));
            for idx in closed {
                let (ns, _) = self.receivers.remove(idx);
                tracing::debug!(target: "transform", namespace = %ns, "namespace stream closed");
            }
            self.next = 0;
        }
        if self.receivers.is_empty() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}
