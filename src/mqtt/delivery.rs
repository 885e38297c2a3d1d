//! Delivery-status reporting back to the backend fan-out path.
//!
//! Every outbound message carries a [`DeliveryPromise`]; the caller that
//! enqueued it may await the paired [`DeliveryStatusFuture`] or drop it.
//! A promise resolves exactly once. Dropping an unresolved promise (for
//! example when a connection task is torn down) resolves the future to
//! [`DeliveryStatus::NotDelivered`], so no caller is ever left pending.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DeliveryStatus {
    /// Terminal acknowledgment received from the client.
    Delivered,
    /// Discarded before delivery, or refused by the client.
    Dropped,
    /// The connection went away before the flow completed.
    NotDelivered,
}

/// Producer half of a delivery status.
#[derive(Debug)]
pub struct DeliveryPromise {
    tx: Option<oneshot::Sender<DeliveryStatus>>,
}

impl DeliveryPromise {
    pub fn new() -> (Self, DeliveryStatusFuture) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, DeliveryStatusFuture { rx })
    }

    /// Promise whose outcome nobody observes.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// Whether a caller still holds the future.
    pub fn is_observed(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn resolve(mut self, status: DeliveryStatus) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(status);
        }
    }
}

/// Consumer half; resolves to the message's final [`DeliveryStatus`].
#[derive(Debug)]
pub struct DeliveryStatusFuture {
    rx: oneshot::Receiver<DeliveryStatus>,
}

impl DeliveryStatusFuture {
    /// Future that is already complete.
    pub fn resolved(status: DeliveryStatus) -> Self {
        let (promise, future) = DeliveryPromise::new();
        promise.resolve(status);
        future
    }

    /// Non-blocking peek; `None` while the flow is still running.
    pub fn try_status(&mut self) -> Option<DeliveryStatus> {
        match self.rx.try_recv() {
            Ok(status) => Some(status),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(DeliveryStatus::NotDelivered),
        }
    }
}

impl Future for DeliveryStatusFuture {
    type Output = DeliveryStatus;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(status)) => Poll::Ready(status),
            Poll::Ready(Err(_)) => Poll::Ready(DeliveryStatus::NotDelivered),
            Poll::Pending => Poll::Pending,
        }
    }
}
