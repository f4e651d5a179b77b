use crate::body::GzipBody;
use crate::config::Config;
use crate::future::ResponseFuture;
use http::{Request, Response};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

/// A Tower service that gzip-encodes HTTP response bodies.
#[derive(Debug, Clone)]
pub struct GzipService<S> {
    inner: S,
    config: Arc<Config>,
}

impl<S> GzipService<S> {
    /// Creates a new gzip service wrapping the given inner service.
    pub fn new(inner: S, config: Arc<Config>) -> Self {
        Self { inner, config }
    }

    /// Returns the shared configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Returns a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner service.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this service, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GzipService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    ResBody: http_body::Body,
    ResBody::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<GzipBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let config = self
            .config
            .accepts_gzip(req.headers())
            .then(|| Arc::clone(&self.config));

        let inner = self.inner.call(req);

        ResponseFuture::new(inner, config)
    }
}
