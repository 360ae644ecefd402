//! Look at the first frame of a request stream without losing it.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tonic::Status;

/// Wraps a frame stream so the first frame can be inspected before the
/// stream is forwarded.
pub struct StreamPeeker<S> {
    inner: S,
    first: Option<Bytes>,
    peeked: bool,
}

impl<S> StreamPeeker<S>
where
    S: Stream<Item = Result<Bytes, Status>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            first: None,
            peeked: false,
        }
    }

    /// Return the first frame, reading it from the stream if needed. The
    /// frame stays at the head of the stream.
    pub async fn peek(&mut self) -> Result<Bytes, Status> {
        if let Some(frame) = &self.first {
            return Ok(frame.clone());
        }
        if self.peeked {
            return Err(Status::invalid_argument("first request frame already consumed"));
        }
        self.peeked = true;
        match self.inner.next().await {
            Some(Ok(frame)) => {
                self.first = Some(frame.clone());
                Ok(frame)
            }
            Some(Err(status)) => Err(status),
            None => Err(Status::invalid_argument("request stream has no first frame")),
        }
    }
}

impl<S> Stream for StreamPeeker<S>
where
    S: Stream<Item = Result<Bytes, Status>> + Unpin,
{
    type Item = Result<Bytes, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(frame) = self.first.take() {
            self.peeked = true;
            return Poll::Ready(Some(Ok(frame)));
        }
        self.inner.poll_next_unpin(cx)
    }
}
