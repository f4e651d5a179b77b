use crate::codec::Compressor;
use crate::config::Config;
use crate::sink::{Capabilities, CloseNotify, Connection, Flush, Hijack, HijackError, ResponseSink};
use crate::sniff::detect_content_type;
use http::header::{self, HeaderValue};
use http::{HeaderMap, StatusCode};
use std::io;
use std::mem;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Write-path failures raised by the writer itself.
///
/// These travel inside an [`io::Error`]; use [`io::Error::get_ref`] and
/// downcast to inspect them.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The underlying sink accepted fewer bytes than requested without error.
    #[error("short write: sink accepted {written} of {expected} bytes")]
    ShortWrite {
        /// Bytes accepted.
        written: usize,
        /// Bytes offered.
        expected: usize,
    },
    /// The writer was already closed.
    #[error("write after close")]
    Closed,
}

/// Where the response is in its one-way decision.
enum State {
    /// Nothing emitted yet; early writes are held back.
    Undecided(Vec<u8>),
    /// Head sent with `Content-Encoding: gzip`. The compressor is acquired on
    /// the first non-empty write.
    Compressed(Option<Compressor>),
    /// Head sent unchanged; writes go straight to the sink.
    Passthrough,
    /// Finalized.
    Closed,
}

enum Decision {
    Wait,
    Passthrough(&'static str),
    Compress,
}

/// A response sink that gzips the body when the response turns out to be
/// eligible.
///
/// Status and early body bytes are held back until the writer can tell
/// whether the response should be compressed: a declared Content-Length, a
/// Content-Type outside the allow-list, an existing Content-Encoding, or
/// enough buffered bytes settle it. The decision is final. Afterwards every
/// write goes either through a pooled gzip compressor or straight to the
/// wrapped sink.
///
/// [`close`](Self::close) must run once the handler is done; dropping the
/// writer closes it as a fallback so the compressor always returns to the pool.
pub struct GzipResponseWriter<S: ResponseSink> {
    sink: S,
    config: Arc<Config>,
    capabilities: Capabilities,
    status: Option<StatusCode>,
    state: State,
    gzipped: bool,
}

impl<S: ResponseSink> GzipResponseWriter<S> {
    /// Wraps `sink`, recording which optional capabilities it exposes.
    pub fn new(config: Arc<Config>, mut sink: S) -> Self {
        let capabilities = Capabilities::of(&mut sink);
        Self {
            sink,
            config,
            capabilities,
            status: None,
            state: State::Undecided(Vec::new()),
            gzipped: false,
        }
    }

    /// Returns a reference to the wrapped sink.
    pub fn get_ref(&self) -> &S {
        &self.sink
    }

    /// Returns a mutable reference to the wrapped sink.
    ///
    /// Writing to the sink directly bypasses compression.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// The configuration governing this response.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Capabilities of the wrapped sink, and therefore of this writer.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Returns whether the compress-or-passthrough decision has been made.
    pub fn is_decided(&self) -> bool {
        !matches!(self.state, State::Undecided(_))
    }

    /// Returns whether the response was committed to gzip encoding. Stays
    /// set after [`close`](Self::close).
    pub fn is_compressing(&self) -> bool {
        self.gzipped
    }

    /// Forces the decision using only what is known now.
    ///
    /// Headers still rule a response out, but the size threshold is waived.
    /// Useful for streaming responses that must start before the threshold
    /// is reached.
    pub fn commit(&mut self) -> io::Result<()> {
        self.decide(true)
    }

    /// Flushes compressed data and then the sink, if it can flush.
    ///
    /// A no-op until the decision is made: flushing early would force
    /// headers out before the size threshold could be applied.
    pub fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            State::Undecided(_) | State::Closed => return Ok(()),
            State::Compressed(Some(stream)) => {
                let output = stream.flush()?;
                write_full(&mut self.sink, output)?;
            }
            State::Compressed(None) | State::Passthrough => {}
        }
        if let Some(flusher) = self.sink.flusher() {
            flusher.flush()?;
        }
        Ok(())
    }

    /// Hands the connection over if the wrapped sink supports it.
    pub fn hijack(&mut self) -> Result<Box<dyn Connection>, HijackError> {
        match self.sink.hijacker() {
            Some(hijacker) => hijacker.hijack(),
            None => Err(HijackError::Unsupported),
        }
    }

    /// Finishes the response.
    ///
    /// An undecided response is sent uncompressed with whatever was
    /// buffered. A compressed response gets its gzip trailer and the
    /// compressor goes back to the pool. Closing twice is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        match mem::replace(&mut self.state, State::Closed) {
            State::Undecided(pending) => {
                self.state = State::Undecided(pending);
                let result = self.start_plain();
                self.state = State::Closed;
                result
            }
            State::Compressed(Some(mut stream)) => {
                let result = stream
                    .finish()
                    .and_then(|output| write_full(&mut self.sink, output));
                self.config.pool().put(stream);
                result
            }
            State::Compressed(None) | State::Passthrough | State::Closed => Ok(()),
        }
    }

    fn decide(&mut self, force: bool) -> io::Result<()> {
        let State::Undecided(pending) = &self.state else {
            return Ok(());
        };
        let (decision, sniffed) = evaluate(&self.config, self.sink.headers(), pending, force);
        if let Some(content_type) = sniffed {
            self.sink
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        match decision {
            Decision::Wait => Ok(()),
            Decision::Passthrough(reason) => {
                debug!(reason, "sending response uncompressed");
                self.start_plain()
            }
            Decision::Compress => {
                debug!("sending response gzip-encoded");
                self.start_gzip()
            }
        }
    }

    fn start_gzip(&mut self) -> io::Result<()> {
        let State::Undecided(pending) = mem::replace(&mut self.state, State::Compressed(None))
        else {
            return Ok(());
        };

        let headers = self.sink.headers_mut();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        self.gzipped = true;
        // The compressor reframes the body; the declared length no longer holds.
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::ACCEPT_RANGES);
        self.emit_status();

        // Without bytes there is nothing to encode yet; an empty body must
        // not grow a gzip header.
        if pending.is_empty() {
            return Ok(());
        }
        let mut stream = self.config.pool().get();
        let result = stream
            .compress(&pending)
            .and_then(|output| write_full(&mut self.sink, output));
        self.state = State::Compressed(Some(stream));
        result
    }

    fn start_plain(&mut self) -> io::Result<()> {
        let State::Undecided(pending) = mem::replace(&mut self.state, State::Passthrough) else {
            return Ok(());
        };
        self.emit_status();
        write_full(&mut self.sink, &pending)
    }

    fn emit_status(&mut self) {
        if let Some(status) = self.status.take() {
            self.sink.write_status(status);
        }
    }
}

impl<S: ResponseSink> ResponseSink for GzipResponseWriter<S> {
    fn headers(&self) -> &HeaderMap {
        self.sink.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.sink.headers_mut()
    }

    /// Records the status. Only the first call before the decision counts.
    fn write_status(&mut self, status: StatusCode) {
        if self.status.is_none() && !self.is_decided() {
            self.status = Some(status);
        } else {
            trace!(%status, "ignoring superfluous status");
        }
    }

    /// Writes body bytes. Bytes held back before the decision are reported
    /// as written.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.state {
            State::Compressed(stream) => {
                if buf.is_empty() {
                    return Ok(0);
                }
                let stream = stream.get_or_insert_with(|| self.config.pool().get());
                let output = stream.compress(buf)?;
                write_full(&mut self.sink, output)?;
                return Ok(buf.len());
            }
            State::Passthrough => {
                write_full(&mut self.sink, buf)?;
                return Ok(buf.len());
            }
            State::Closed => return Err(io::Error::other(WriteError::Closed)),
            State::Undecided(pending) => pending.extend_from_slice(buf),
        }
        self.decide(false)?;
        Ok(buf.len())
    }

    fn flusher(&mut self) -> Option<&mut dyn Flush> {
        if self.capabilities.flush {
            Some(self)
        } else {
            None
        }
    }

    fn hijacker(&mut self) -> Option<&mut dyn Hijack> {
        if self.capabilities.hijack {
            self.sink.hijacker()
        } else {
            None
        }
    }

    fn close_notifier(&self) -> Option<&dyn CloseNotify> {
        if self.capabilities.close_notify {
            self.sink.close_notifier()
        } else {
            None
        }
    }
}

impl<S: ResponseSink> Flush for GzipResponseWriter<S> {
    fn flush(&mut self) -> io::Result<()> {
        GzipResponseWriter::flush(self)
    }
}

impl<S: ResponseSink> Drop for GzipResponseWriter<S> {
    fn drop(&mut self) {
        if matches!(self.state, State::Closed) {
            return;
        }
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to finalize response on drop");
        }
    }
}

/// Decides what to do with the response given its headers and the bytes held
/// back so far. Also returns the sniffed content type when one had to be
/// inferred.
fn evaluate(
    config: &Config,
    headers: &HeaderMap,
    pending: &[u8],
    force: bool,
) -> (Decision, Option<&'static str>) {
    if headers.contains_key(header::CONTENT_ENCODING) {
        return (Decision::Passthrough("content-encoding already set"), None);
    }
    if headers.contains_key(header::CONTENT_RANGE) {
        return (Decision::Passthrough("range response"), None);
    }

    let min_size = config.min_size();
    let declared_length = declared_length(headers);
    if declared_length.is_some_and(|len| len < min_size as u64) {
        return (Decision::Passthrough("content-length below minimum size"), None);
    }

    // A declared type is never replaced, even if it is not valid UTF-8.
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .map(|v| String::from_utf8_lossy(v.as_bytes()))
        .filter(|v| !v.trim().is_empty());
    if content_type
        .as_deref()
        .is_some_and(|ct| !config.allows_content_type(ct))
    {
        return (Decision::Passthrough("content-type not allowed"), None);
    }

    if !force && declared_length.is_none() && pending.len() < min_size {
        return (Decision::Wait, None);
    }

    match content_type {
        Some(_) => (Decision::Compress, None),
        None => {
            let sniffed = detect_content_type(pending);
            let decision = if config.allows_content_type(sniffed) {
                Decision::Compress
            } else {
                Decision::Passthrough("sniffed content-type not allowed")
            };
            (decision, Some(sniffed))
        }
    }
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
}

/// Writes all of `buf`, treating a short write as an error.
fn write_full<S: ResponseSink + ?Sized>(sink: &mut S, buf: &[u8]) -> io::Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let written = sink.write(buf)?;
    if written < buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            WriteError::ShortWrite {
                written,
                expected: buf.len(),
            },
        ));
    }
    Ok(())
}
