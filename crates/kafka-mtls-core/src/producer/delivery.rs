use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{ClientError, Result};

/// Where the broker placed a produced record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    pub topic: String,
    pub partition: i32,
    /// Assigned offset, or `-1` when `acks = none`.
    pub offset: i64,
}

/// Resolves once the record is acknowledged or has failed for good.
#[must_use = "a delivery is only confirmed once the future resolves"]
#[derive(Debug)]
pub struct DeliveryFuture {
    rx: oneshot::Receiver<Result<DeliveryAck>>,
}

impl DeliveryFuture {
    pub(crate) fn new(rx: oneshot::Receiver<Result<DeliveryAck>>) -> Self {
        Self { rx }
    }
}

impl Future for DeliveryFuture {
    type Output = Result<DeliveryAck>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The worker went away without answering.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_with_ack() {
        let (tx, rx) = oneshot::channel();
        let ack = DeliveryAck {
            topic: "orders".to_string(),
            partition: 0,
            offset: 7,
        };
        tx.send(Ok(ack.clone())).unwrap();
        assert_eq!(DeliveryFuture::new(rx).await.unwrap(), ack);
    }

    #[tokio::test]
    async fn test_dropped_sender_is_closed() {
        let (tx, rx) = oneshot::channel::<Result<DeliveryAck>>();
        drop(tx);
        assert_eq!(DeliveryFuture::new(rx).await, Err(ClientError::Closed));
    }
}
