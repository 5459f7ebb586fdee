//! Pass-through body taps.
//!
//! A [`TapBody`] forwards every frame of the wrapped body unchanged and copies
//! data frames into a shared [`ContentTap`] accumulator. Nothing is buffered in
//! front of the consumer; the copy happens as each frame passes through.

use bytes::{Bytes, BytesMut};
use hyper::body::{Body, Frame, SizeHint};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};

/// Byte accumulator shared between a body in flight and the exchange that owns it.
#[derive(Debug, Clone, Default)]
pub struct ContentTap {
    buffer: Arc<Mutex<BytesMut>>,
}

impl ContentTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(chunk);
    }

    /// Copy of everything recorded so far.
    pub fn snapshot(&self) -> Bytes {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        Bytes::copy_from_slice(&buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Body wrapper feeding a [`ContentTap`].
#[derive(Debug)]
pub struct TapBody<B> {
    inner: B,
    tap: ContentTap,
}

impl<B> TapBody<B> {
    pub fn new(inner: B, tap: ContentTap) -> Self {
        Self { inner, tap }
    }

    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B> Body for TapBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));

        if let Some(Ok(frame)) = &frame {
            if let Some(data) = frame.data_ref() {
                tracing::trace!(bytes = data.len(), "Tapped body chunk");
                this.tap.record(data);
            }
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use http_body_util::{BodyExt, Empty, Full, StreamBody};
    use std::convert::Infallible;

    #[tokio::test]
    async fn test_bytes_pass_through_unchanged() {
        let tap = ContentTap::new();
        let body = TapBody::new(Full::new(Bytes::from_static(b"request body")), tap.clone());

        let collected = body.collect().await.expect("infallible").to_bytes();

        assert_eq!(collected, Bytes::from_static(b"request body"));
        assert_eq!(tap.snapshot(), Bytes::from_static(b"request body"));
    }

    #[tokio::test]
    async fn test_multiple_chunks_accumulate_in_order() {
        let chunks: Vec<Result<Frame<Bytes>, Infallible>> = vec![
            Ok(Frame::data(Bytes::from_static(b"first "))),
            Ok(Frame::data(Bytes::new())),
            Ok(Frame::data(Bytes::from_static(b"second"))),
        ];
        let tap = ContentTap::new();
        let body = TapBody::new(StreamBody::new(stream::iter(chunks)), tap.clone());

        let collected = body.collect().await.expect("infallible").to_bytes();

        assert_eq!(collected, Bytes::from_static(b"first second"));
        assert_eq!(tap.snapshot(), Bytes::from_static(b"first second"));
        assert_eq!(tap.len(), 12);
    }

    #[tokio::test]
    async fn test_empty_body_leaves_empty_tap() {
        let tap = ContentTap::new();
        let body = TapBody::new(Empty::<Bytes>::new(), tap.clone());

        assert!(body.is_end_stream());
        let collected = body.collect().await.expect("infallible").to_bytes();

        assert!(collected.is_empty());
        assert!(tap.is_empty());
    }

    #[test]
    fn test_snapshot_is_detached_from_later_writes() {
        let tap = ContentTap::new();
        tap.record(b"abc");
        let snapshot = tap.snapshot();
        tap.record(b"def");

        assert_eq!(snapshot, Bytes::from_static(b"abc"));
        assert_eq!(tap.snapshot(), Bytes::from_static(b"abcdef"));
    }

    #[test]
    fn test_size_hint_is_forwarded() {
        let body = TapBody::new(Full::new(Bytes::from_static(b"12345")), ContentTap::new());
        assert_eq!(body.size_hint().exact(), Some(5));
    }
}
