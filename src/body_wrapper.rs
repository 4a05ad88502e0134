//! Body streaming and capture utilities.
//!
//! The wrapped body forwards every frame untouched while a [`BoundedCapture`]
//! keeps the first bytes for logging. Capture completes when the stream ends,
//! fails, or is dropped by its consumer.

use crate::bounded::BoundedCapture;
use axum::body::{Body, Bytes};
use futures::stream::{BoxStream, Stream, StreamExt};
use http_body::Body as HttpBody;
use http_body_util::BodyExt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::warn;

/// Error type for body capture operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BodyCaptureError {
    #[error("Body stream error: {0}")]
    StreamError(String),
}

/// The captured prefix of a body, or the reason it could not be captured.
pub type CaptureOutcome = Result<Bytes, BodyCaptureError>;

type OnComplete = Box<dyn FnOnce(CaptureOutcome) + Send>;

/// Whether `body` is known to carry no payload.
pub fn body_is_absent<B: HttpBody>(body: &B) -> bool {
    body.is_end_stream() || body.size_hint().exact() == Some(0)
}

/// Wraps `body` so the bytes flowing through it are captured, then handed to
/// `on_complete` exactly once.
///
/// `on_complete` runs when the stream ends, when it yields an error, or when
/// the new body is dropped before reaching its end. In the last case it gets
/// whatever was captured so far.
///
/// # Examples
///
/// ```rust
/// use logged_http::body_wrapper::create_body_capture;
/// use logged_http::BoundedCapture;
/// use axum::body::Body;
/// use http_body_util::BodyExt;
/// use std::sync::{Arc, Mutex};
///
/// # #[tokio::main]
/// # async fn main() {
/// let captured = Arc::new(Mutex::new(None));
/// let slot = captured.clone();
/// let body = create_body_capture(
///     Body::from("Hello, World!"),
///     BoundedCapture::detached(Some(5)),
///     move |outcome| *slot.lock().unwrap() = Some(outcome),
/// );
///
/// let forwarded = body.collect().await.unwrap().to_bytes();
/// assert_eq!(forwarded, "Hello, World!");
/// assert_eq!(captured.lock().unwrap().clone().unwrap().unwrap(), "Hello");
/// # }
/// ```
pub fn create_body_capture<B, F>(body: B, capture: BoundedCapture<io::Sink>, on_complete: F) -> Body
where
    B: HttpBody<Data = Bytes, Error = axum::Error> + Send + 'static,
    F: FnOnce(CaptureOutcome) + Send + 'static,
{
    Body::from_stream(CaptureStream {
        inner: body.into_data_stream().boxed(),
        capture,
        on_complete: Some(Box::new(on_complete)),
    })
}

struct CaptureStream {
    inner: BoxStream<'static, Result<Bytes, axum::Error>>,
    capture: BoundedCapture<io::Sink>,
    on_complete: Option<OnComplete>,
}

impl CaptureStream {
    fn finish(&mut self, outcome: CaptureOutcome) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(outcome);
        }
    }
}

impl Stream for CaptureStream {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let polled = this.inner.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => this.capture.capture(chunk),
            Poll::Ready(Some(Err(e))) => {
                warn!(error = %e, "Stream error during body capture");
                this.finish(Err(BodyCaptureError::StreamError(e.to_string())));
            }
            Poll::Ready(None) => {
                let captured = this.capture.take_captured();
                this.finish(Ok(captured));
            }
            Poll::Pending => {}
        }
        polled
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        let captured = self.capture.take_captured();
        self.finish(Ok(captured));
    }
}
