use crate::body::{Encoding, GzipBody};
use crate::config::Config;
use crate::negotiate::add_vary_accept_encoding;
use http::response::Parts;
use http::{HeaderMap, Response, header};
use http_body::Body;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pin_project! {
    /// Future for gzip service responses.
    ///
    /// Resolves once the inner response has arrived and, for clients that
    /// accept gzip, once enough of its body has been read to decide whether
    /// to compress it.
    pub struct ResponseFuture<F, B> {
        #[pin]
        inner: F,
        config: Option<Arc<Config>>,
        pending: Option<Pending<B>>,
    }
}

/// A response whose head is held back until the writer decides.
struct Pending<B> {
    parts: Parts,
    encoding: Encoding<B>,
}

impl<F, B> ResponseFuture<F, B> {
    pub(crate) fn new(inner: F, config: Option<Arc<Config>>) -> Self {
        Self {
            inner,
            config,
            pending: None,
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Output = Result<Response<GzipBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        loop {
            if let Some(mut pending) = this.pending.take() {
                if pending.encoding.poll_decision(cx).is_pending() {
                    *this.pending = Some(pending);
                    return Poll::Pending;
                }
                let (status, headers) = pending.encoding.head();
                if let Some(status) = status {
                    pending.parts.status = status;
                }
                pending.parts.headers = headers;
                return Poll::Ready(Ok(Response::from_parts(
                    pending.parts,
                    GzipBody::encoded(pending.encoding),
                )));
            }

            let response = match this.inner.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(response)) => response,
            };
            match wrap_response(response, this.config.take()) {
                Wrapped::Identity(response) => return Poll::Ready(Ok(response)),
                Wrapped::Deciding(pending) => *this.pending = Some(pending),
            }
        }
    }
}

enum Wrapped<B> {
    Identity(Response<GzipBody<B>>),
    Deciding(Pending<B>),
}

/// Adds `Vary` and either passes the response on untouched or sets it up to
/// go through the writer.
fn wrap_response<B>(response: Response<B>, config: Option<Arc<Config>>) -> Wrapped<B>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (mut parts, body) = response.into_parts();
    add_vary_accept_encoding(&mut parts.headers);

    let Some(config) = config else {
        return Wrapped::Identity(Response::from_parts(parts, GzipBody::identity(body)));
    };

    let always_flush = is_unbuffered(&parts.headers) || is_streaming_content_type(&parts.headers);
    let headers = std::mem::take(&mut parts.headers);
    let encoding = Encoding::new(config, parts.status, headers, body, always_flush);
    Wrapped::Deciding(Pending { parts, encoding })
}

/// Checks for `X-Accel-Buffering: no`.
fn is_unbuffered(headers: &HeaderMap) -> bool {
    headers
        .get("x-accel-buffering")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("no"))
}

/// Checks if the content type requires always flushing (e.g., streaming).
fn is_streaming_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| {
            ct.starts_with("text/event-stream") || ct.starts_with("application/grpc-web")
        })
}
