use crate::config::Config;
use crate::sink::{Flush, ResponseSink};
use crate::writer::GzipResponseWriter;
use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tracing::debug;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pin_project! {
    /// A response body that may be gzip-encoded.
    ///
    /// `Identity` bodies are forwarded unchanged. `Encoded` bodies run every
    /// data frame through a [`GzipResponseWriter`], which either compresses
    /// or passes the bytes through depending on the decision made for the
    /// response.
    #[project = GzipBodyProj]
    #[allow(missing_docs)]
    pub enum GzipBody<B> {
        /// The client does not accept gzip.
        Identity {
            #[pin]
            inner: B,
        },
        /// The body goes through the decision state machine.
        Encoded {
            encoding: Encoding<B>,
        },
    }
}

impl<B> GzipBody<B> {
    pub(crate) fn identity(inner: B) -> Self {
        Self::Identity { inner }
    }

    pub(crate) fn encoded(encoding: Encoding<B>) -> Self {
        Self::Encoded { encoding }
    }
}

/// The sink an [`Encoding`] writes into: collects the head and the produced
/// bytes so they can be handed out as a response and as body frames.
#[derive(Debug)]
pub(crate) struct BufferedSink {
    status: Option<StatusCode>,
    headers: HeaderMap,
    output: BytesMut,
}

impl BufferedSink {
    fn take_output(&mut self) -> Bytes {
        self.output.split().freeze()
    }
}

impl ResponseSink for BufferedSink {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_status(&mut self, status: StatusCode) {
        self.status.get_or_insert(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flusher(&mut self) -> Option<&mut dyn Flush> {
        Some(self)
    }
}

// Output becomes a frame on the next poll anyway.
impl Flush for BufferedSink {
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// State of an encoded body: the inner body and the writer its frames
/// go through.
pub struct Encoding<B> {
    body: Pin<Box<B>>,
    writer: GzipResponseWriter<BufferedSink>,
    always_flush: bool,
    trailers: Option<HeaderMap>,
    error: Option<io::Error>,
    done: bool,
}

impl<B> Encoding<B>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    pub(crate) fn new(
        config: Arc<Config>,
        status: StatusCode,
        headers: HeaderMap,
        body: B,
        always_flush: bool,
    ) -> Self {
        let sink = BufferedSink {
            status: None,
            headers,
            output: BytesMut::new(),
        };
        let mut writer = GzipResponseWriter::new(config, sink);
        writer.write_status(status);

        let mut encoding = Self {
            body: Box::pin(body),
            writer,
            always_flush,
            trailers: None,
            error: None,
            done: false,
        };
        // Streams cannot wait for the size threshold.
        if always_flush {
            if let Err(err) = encoding.writer.commit() {
                encoding.fail(err);
            }
        }
        encoding
    }

    /// Returns whether the writer decided between compressing and passing
    /// through.
    pub(crate) fn is_decided(&self) -> bool {
        self.writer.is_decided()
    }

    /// Reads the inner body until the writer has decided.
    pub(crate) fn poll_decision(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        while !self.is_decided() {
            ready!(self.poll_inner(cx));
        }
        Poll::Ready(())
    }

    /// Status and headers to send, as decided by the writer.
    pub(crate) fn head(&self) -> (Option<StatusCode>, HeaderMap) {
        let sink = self.writer.get_ref();
        (sink.status, sink.headers.clone())
    }

    fn poll_frame(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        loop {
            let output = self.writer.get_mut().take_output();
            if !output.is_empty() {
                return Poll::Ready(Some(Ok(Frame::data(output))));
            }
            if let Some(err) = self.error.take() {
                self.trailers = None;
                return Poll::Ready(Some(Err(err)));
            }
            if self.done {
                return Poll::Ready(self.trailers.take().map(|t| Ok(Frame::trailers(t))));
            }
            ready!(self.poll_inner(cx));
        }
    }

    /// Pulls one frame from the inner body into the writer.
    fn poll_inner(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.done {
            return Poll::Ready(());
        }
        match ready!(self.body.as_mut().poll_frame(cx)) {
            None => self.finish(),
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) => self.feed(data),
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        self.trailers = Some(trailers);
                        self.finish();
                    }
                }
            },
            Some(Err(err)) => self.fail(io::Error::other(err.into())),
        }
        Poll::Ready(())
    }

    fn feed(&mut self, mut data: B::Data) {
        while data.has_remaining() {
            let chunk = data.chunk();
            let len = chunk.len();
            if let Err(err) = self.writer.write(chunk) {
                return self.fail(err);
            }
            data.advance(len);
        }
        if self.always_flush {
            if let Err(err) = self.writer.flush() {
                self.fail(err);
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        if let Err(err) = self.writer.close() {
            self.error = Some(err);
        }
    }

    fn fail(&mut self, err: io::Error) {
        self.error = Some(err);
        self.done = true;
        // Whatever was produced before the failure still goes out.
        if let Err(err) = self.writer.close() {
            debug!(error = %err, "failed to close writer after body error");
        }
    }

    /// Exact once passthrough is decided and the inner body's size is known.
    /// Unknown while gzip-encoding.
    fn size_hint(&self) -> SizeHint {
        if !self.writer.is_decided() || self.writer.is_compressing() || self.error.is_some() {
            return SizeHint::default();
        }
        let buffered = self.writer.get_ref().output.len() as u64;
        if self.done {
            return SizeHint::with_exact(buffered);
        }
        let inner = self.body.size_hint();
        let mut hint = SizeHint::new();
        hint.set_lower(inner.lower() + buffered);
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper + buffered);
        }
        hint
    }

    fn is_end_stream(&self) -> bool {
        self.done
            && self.error.is_none()
            && self.trailers.is_none()
            && self.writer.get_ref().output.is_empty()
    }
}

impl<B> Body for GzipBody<B>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            GzipBodyProj::Identity { inner } => match ready!(inner.poll_frame(cx)) {
                None => Poll::Ready(None),
                Some(Ok(frame)) => {
                    Poll::Ready(Some(Ok(frame.map_data(|mut data| data.copy_to_bytes(data.remaining())))))
                }
                Some(Err(e)) => Poll::Ready(Some(Err(io::Error::other(e.into())))),
            },
            GzipBodyProj::Encoded { encoding } => encoding.poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            GzipBody::Identity { inner } => inner.is_end_stream(),
            GzipBody::Encoded { encoding } => encoding.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            GzipBody::Identity { inner } => inner.size_hint(),
            GzipBody::Encoded { encoding } => encoding.size_hint(),
        }
    }
}
