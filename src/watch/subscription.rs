use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::StreamExt;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

#[must_use]
pub fn new_subscription_id() -> String {
    Uuid::new_v4().to_string()
}

/// One delivered delta, stamped with its position in the subscription
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T> {
    pub subscription: String,
    /// Strictly increasing per subscription, starting at 1
    pub seq: u64,
    pub payload: T,
}

/// What a consumer reads off its stream
#[derive(Debug, Clone)]
pub enum StreamItem<T> {
    Delta(Envelope<T>),
    /// The consumer fell behind and this many of the oldest deltas were overwritten
    Lagged(u64),
}

/// Result of handing a delta to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The consumer dropped its stream; the subscription should be torn down
    Closed,
}

/// Producer half of a subscription's bounded delta buffer.
///
/// Sends never wait on the consumer. Once the buffer holds `capacity` unread
/// deltas the oldest is overwritten and the consumer is told how many it missed.
#[derive(Debug)]
pub struct DeltaSink<T> {
    subscription: String,
    tx: broadcast::Sender<Envelope<T>>,
    last_delivered: AtomicU64,
}

impl<T: Clone + Send + 'static> DeltaSink<T> {
    #[must_use]
    pub fn channel(subscription: &str, capacity: usize) -> (Self, DeltaStream<T>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        let sink = Self {
            subscription: subscription.to_string(),
            tx,
            last_delivered: AtomicU64::new(0),
        };
        let stream = DeltaStream {
            subscription: subscription.to_string(),
            inner: BroadcastStream::new(rx),
            guard: None,
        };
        (sink, stream)
    }

    pub fn publish(&self, payload: T) -> Delivery {
        if self.tx.receiver_count() == 0 {
            return Delivery::Closed;
        }
        let seq = self.last_delivered.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = Envelope {
            subscription: self.subscription.clone(),
            seq,
            payload,
        };
        match self.tx.send(envelope) {
            Ok(_) => Delivery::Sent,
            Err(_) => Delivery::Closed,
        }
    }

    /// Sequence number of the most recently published delta (0 before the first)
    #[must_use]
    pub fn last_delivered(&self) -> u64 {
        self.last_delivered.load(Ordering::SeqCst)
    }
}

/// Consumer half of a subscription. Dropping it closes the subscription.
pub struct DeltaStream<T> {
    subscription: String,
    inner: BroadcastStream<Envelope<T>>,
    guard: Option<DropGuard>,
}

impl<T: Clone + Send + 'static> DeltaStream<T> {
    /// Cancel `token` when this stream is dropped, even if nothing is ever published again
    #[must_use]
    pub fn cancel_on_drop(mut self, token: CancellationToken) -> Self {
        self.guard = Some(token.drop_guard());
        self
    }

    /// Next item, or `None` once the subscription has ended
    pub async fn recv(&mut self) -> Option<StreamItem<T>> {
        self.next().await
    }
}

impl<T: Clone + Send + 'static> Stream for DeltaStream<T> {
    type Item = StreamItem<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = ready!(Pin::new(&mut self.inner).poll_next(cx));
        Poll::Ready(item.map(|result| match result {
            Ok(envelope) => StreamItem::Delta(envelope),
            Err(BroadcastStreamRecvError::Lagged(n)) => StreamItem::Lagged(n),
        }))
    }
}

impl<T> std::fmt::Debug for DeltaStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaStream")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}
