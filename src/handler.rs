use crate::config::Config;
use crate::negotiate::{accepts_gzip, add_vary_accept_encoding};
use crate::sink::ResponseSink;
use crate::writer::GzipResponseWriter;
use http::Request;
use std::sync::Arc;
use tracing::warn;

/// Something that answers a request by writing to a [`ResponseSink`].
pub trait Handler<B> {
    /// Handles `request`, writing the response to `response`.
    fn serve(&self, request: &Request<B>, response: &mut dyn ResponseSink);
}

impl<B, F> Handler<B> for F
where
    F: Fn(&Request<B>, &mut dyn ResponseSink),
{
    fn serve(&self, request: &Request<B>, response: &mut dyn ResponseSink) {
        self(request, response)
    }
}

/// Gzip-encodes the responses of the wrapped handler for clients that accept
/// it.
///
/// Every response gets `Vary: Accept-Encoding`. When the request does not
/// accept gzip the inner handler writes to the real sink directly. Otherwise
/// it writes through a [`GzipResponseWriter`], which is closed once the
/// handler returns, or dropped (and thereby closed) if it panics.
#[derive(Debug, Clone)]
pub struct GzipHandler<H> {
    config: Arc<Config>,
    inner: H,
}

impl<H> GzipHandler<H> {
    /// Wraps `inner` with the given configuration.
    pub fn new(config: impl Into<Arc<Config>>, inner: H) -> Self {
        Self {
            config: config.into(),
            inner,
        }
    }

    /// Wraps `inner` with the default configuration.
    pub fn with_defaults(inner: H) -> Self {
        Self::new(Config::default(), inner)
    }

    /// The shared configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Gets a reference to the inner handler.
    pub fn get_ref(&self) -> &H {
        &self.inner
    }

    /// Consumes `self`, returning the inner handler.
    pub fn into_inner(self) -> H {
        self.inner
    }
}

impl<B, H: Handler<B>> Handler<B> for GzipHandler<H> {
    fn serve(&self, request: &Request<B>, response: &mut dyn ResponseSink) {
        add_vary_accept_encoding(response.headers_mut());

        if !accepts_gzip(request.headers()) {
            return self.inner.serve(request, response);
        }

        let mut writer = GzipResponseWriter::new(Arc::clone(&self.config), response);
        self.inner.serve(request, &mut writer);
        if let Err(err) = writer.close() {
            warn!(error = %err, "failed to finish gzip response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::ResponseRecorder;
    use crate::sink::{CloseNotify, Flush, Hijack, HijackError};
    use flate2::read::GzDecoder;
    use http::header::{self, HeaderMap, HeaderValue};
    use http::StatusCode;
    use std::io::{self, Read};
    use std::panic::{self, AssertUnwindSafe};
    use tokio_util::sync::CancellationToken;

    const SMALL_BODY: &str = "aaabbcaaabbbcccaaabbbcccaaabbbcccaaabbbccc";

    fn test_body() -> String {
        "aaabbbccc".repeat(600)
    }

    fn request(accept_encoding: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = accept_encoding {
            builder = builder.header(header::ACCEPT_ENCODING, value);
        }
        builder.body(()).unwrap()
    }

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    fn serve<H: Handler<()>>(handler: &H, accept_encoding: Option<&str>) -> ResponseRecorder {
        let mut recorder = ResponseRecorder::new();
        handler.serve(&request(accept_encoding), &mut recorder);
        recorder
    }

    fn writes(body: &'static [u8]) -> impl Fn(&Request<()>, &mut dyn ResponseSink) {
        move |_: &Request<()>, response: &mut dyn ResponseSink| {
            response.write(body).unwrap();
        }
    }

    #[test]
    fn test_compresses_when_accepted() {
        let body = test_body();
        let expected = body.clone();
        let handler = GzipHandler::with_defaults(move |_: &Request<()>, response: &mut dyn ResponseSink| {
            response.write(body.as_bytes()).unwrap();
        });

        let recorder = serve(&handler, Some("gzip"));
        let headers = recorder.sent_headers();
        assert_eq!(headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");
        assert_eq!(headers.get(header::VARY).unwrap(), "Accept-Encoding");
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(gunzip(recorder.body()), expected.as_bytes());
    }

    #[test]
    fn test_not_accepted_passes_through_with_vary() {
        let handler = GzipHandler::with_defaults(writes(b"plain response"));
        for accept in [None, Some("br"), Some("gzip;q=0")] {
            let recorder = serve(&handler, accept);
            let headers = recorder.sent_headers();
            assert!(headers.get(header::CONTENT_ENCODING).is_none());
            assert_eq!(headers.get(header::VARY).unwrap(), "Accept-Encoding");
            assert_eq!(recorder.body(), b"plain response");
        }
    }

    #[test]
    fn test_small_body_not_compressed() {
        let handler = GzipHandler::with_defaults(writes(SMALL_BODY.as_bytes()));
        let recorder = serve(&handler, Some("gzip"));
        assert!(recorder.sent_headers().get(header::CONTENT_ENCODING).is_none());
        assert_eq!(recorder.body(), SMALL_BODY.as_bytes());
    }

    #[test]
    fn test_declared_small_length_written_in_two_chunks() {
        let handler = GzipHandler::with_defaults(|_: &Request<()>, response: &mut dyn ResponseSink| {
            let body = SMALL_BODY.as_bytes();
            response.headers_mut().insert(
                header::CONTENT_LENGTH,
                HeaderValue::from(body.len() as u64),
            );
            response.write(&body[..20]).unwrap();
            response.write(&body[20..]).unwrap();
        });
        let recorder = serve(&handler, Some("gzip"));
        assert!(recorder.sent_headers().get(header::CONTENT_ENCODING).is_none());
        assert_eq!(recorder.body(), SMALL_BODY.as_bytes());
    }

    #[test]
    fn test_5000_bytes_sniffed_and_compressed() {
        let body: String = "abcdefghij".repeat(500);
        assert_eq!(body.len(), 5000);
        let expected = body.clone();
        let handler = GzipHandler::with_defaults(move |_: &Request<()>, response: &mut dyn ResponseSink| {
            response.write(body.as_bytes()).unwrap();
        });

        let recorder = serve(&handler, Some("gzip, deflate"));
        let headers = recorder.sent_headers();
        assert_eq!(headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");
        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(gunzip(recorder.body()), expected.as_bytes());
    }

    #[test]
    fn test_no_writes_lets_outer_layer_set_status() {
        let handler = GzipHandler::with_defaults(|_: &Request<()>, _: &mut dyn ResponseSink| {});
        let mut recorder = serve(&handler, Some("gzip"));
        assert!(!recorder.header_written());
        assert!(recorder.body().is_empty());
        recorder.write_status(StatusCode::NOT_FOUND);
        assert_eq!(recorder.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_status_codes() {
        let handler = GzipHandler::with_defaults(|_: &Request<()>, response: &mut dyn ResponseSink| {
            response.write_status(StatusCode::NOT_FOUND);
            response.write(b"404 page not found\n").unwrap();
        });
        let recorder = serve(&handler, Some("gzip"));
        assert_eq!(recorder.status(), StatusCode::NOT_FOUND);
        assert_eq!(recorder.body(), b"404 page not found\n");
    }

    #[test]
    fn test_ignore_subsequent_status() {
        let handler = GzipHandler::with_defaults(|_: &Request<()>, response: &mut dyn ResponseSink| {
            response.write_status(StatusCode::INTERNAL_SERVER_ERROR);
            response.write_status(StatusCode::NOT_FOUND);
        });
        let recorder = serve(&handler, Some("gzip"));
        assert_eq!(recorder.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_double_status_with_declared_length() {
        let handler = GzipHandler::with_defaults(|_: &Request<()>, response: &mut dyn ResponseSink| {
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from_static("15000"));
            response.write_status(StatusCode::NOT_MODIFIED);
            response.write(&[]).unwrap();
        });
        let recorder = serve(&handler, Some("gzip"));
        assert_eq!(recorder.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(recorder.status_writes(), 1);
        assert!(recorder.body().is_empty());
        let headers = recorder.sent_headers();
        assert_eq!(headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");
        assert_eq!(headers.get(header::VARY).unwrap(), "Accept-Encoding");
    }

    #[test]
    fn test_flush_before_write() {
        let body = test_body();
        let expected = body.clone();
        let handler = GzipHandler::with_defaults(move |_: &Request<()>, response: &mut dyn ResponseSink| {
            response.write_status(StatusCode::NOT_FOUND);
            response.flusher().unwrap().flush().unwrap();
            response.write(body.as_bytes()).unwrap();
        });
        let recorder = serve(&handler, Some("gzip"));
        assert_eq!(recorder.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            recorder.sent_headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
        assert_eq!(gunzip(recorder.body()), expected.as_bytes());
    }

    #[test]
    fn test_panic_returns_compressor_to_pool() {
        let config = Arc::new(Config::builder().min_size(0).build().unwrap());
        let handler = GzipHandler::new(
            Arc::clone(&config),
            |_: &Request<()>, response: &mut dyn ResponseSink| {
                response.write(b"partial").unwrap();
                panic!("handler failed");
            },
        );

        let mut recorder = ResponseRecorder::new();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.serve(&request(Some("gzip")), &mut recorder);
        }));
        assert!(result.is_err());
        assert_eq!(config.pool().idle(), 1);
        assert_eq!(gunzip(recorder.body()), b"partial");
    }

    #[test]
    fn test_content_types() {
        let cases: &[(&[&str], &str, bool)] = &[
            (&[], "", true),
            (&[], "text/plain", true),
            (&["text/xml"], "", false),
            (&["text/xml"], "text/xml", true),
            (&["text/xml"], "text/xml; charset=utf-8", true),
            (&["text/xml; charset=utf-8"], "text/xml", false),
            (&["text/xml; charset=utf-8"], "text/xml; charset=utf-8", true),
            (&["TEXT/XML"], "text/xml", true),
            (&["text/xml"], "application/json", false),
            (&["text/xml", "application/json"], "application/json", true),
            (&["application/json", "not a type;"], "application/json", true),
        ];

        let body = test_body();
        for (allowed, content_type, compressed) in cases {
            let config = Config::builder()
                .min_size(0)
                .content_types(allowed.iter().copied())
                .build()
                .unwrap();
            let content_type = *content_type;
            let body = body.clone();
            let handler = GzipHandler::new(config, move |_: &Request<()>, response: &mut dyn ResponseSink| {
                if !content_type.is_empty() {
                    response.headers_mut().insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_str(content_type).unwrap(),
                    );
                }
                response.write(body.as_bytes()).unwrap();
            });
            let recorder = serve(&handler, Some("gzip"));
            assert_eq!(
                recorder.sent_headers().get(header::CONTENT_ENCODING).is_some(),
                *compressed,
                "allowed {allowed:?}, content type {content_type:?}"
            );
        }
    }

    /// A sink exposing every optional capability.
    #[derive(Default)]
    struct FullSink {
        inner: ResponseRecorder,
        token: CancellationToken,
        hijacked: bool,
    }

    impl ResponseSink for FullSink {
        fn headers(&self) -> &HeaderMap {
            self.inner.headers()
        }

        fn headers_mut(&mut self) -> &mut HeaderMap {
            self.inner.headers_mut()
        }

        fn write_status(&mut self, status: StatusCode) {
            self.inner.write_status(status)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }

        fn flusher(&mut self) -> Option<&mut dyn Flush> {
            self.inner.flusher()
        }

        fn hijacker(&mut self) -> Option<&mut dyn Hijack> {
            Some(self)
        }

        fn close_notifier(&self) -> Option<&dyn CloseNotify> {
            Some(self)
        }
    }

    impl Hijack for FullSink {
        fn hijack(&mut self) -> Result<Box<dyn crate::sink::Connection>, HijackError> {
            self.hijacked = true;
            Ok(Box::new(io::Cursor::new(Vec::new())))
        }
    }

    impl CloseNotify for FullSink {
        fn close_notify(&self) -> CancellationToken {
            self.token.clone()
        }
    }

    #[test]
    fn test_capabilities_forwarded() {
        let handler = GzipHandler::with_defaults(|_: &Request<()>, response: &mut dyn ResponseSink| {
            assert!(response.flusher().is_some());
            let token = response.close_notifier().unwrap().close_notify();
            assert!(!token.is_cancelled());
            let connection = response.hijacker().unwrap().hijack();
            assert!(connection.is_ok());
        });
        let mut sink = FullSink::default();
        handler.serve(&request(Some("gzip")), &mut sink);
        assert!(sink.hijacked);
    }

    #[test]
    fn test_missing_capabilities_not_advertised() {
        let handler = GzipHandler::with_defaults(|_: &Request<()>, response: &mut dyn ResponseSink| {
            assert!(response.flusher().is_some());
            assert!(response.hijacker().is_none());
            assert!(response.close_notifier().is_none());
        });
        serve(&handler, Some("gzip"));
    }
}
