//! An in-memory [`ResponseSink`](crate::ResponseSink) for tests.

use crate::sink::{Flush, ResponseSink};
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Response, StatusCode};
use std::io;
use tracing::debug;

/// An in-memory [`ResponseSink`] that records everything written to it.
///
/// Behaves like a server connection: the head is sent by the first
/// [`write_status`](ResponseSink::write_status), write or flush, and later
/// status changes are ignored. Headers present at that moment are kept
/// separately from the live header map.
#[derive(Debug, Default)]
pub struct ResponseRecorder {
    status: Option<StatusCode>,
    headers: HeaderMap,
    sent_headers: Option<HeaderMap>,
    body: BytesMut,
    status_writes: usize,
    flushes: usize,
}

impl ResponseRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Status sent, or `200 OK` if the head has not been sent.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    /// Returns whether the head has been sent.
    pub fn header_written(&self) -> bool {
        self.sent_headers.is_some()
    }

    /// Headers as they were when the head was sent, or the live headers if
    /// it has not been sent yet.
    pub fn sent_headers(&self) -> &HeaderMap {
        self.sent_headers.as_ref().unwrap_or(&self.headers)
    }

    /// Body bytes written so far.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Number of times the head was actually sent. Never more than one.
    pub fn status_writes(&self) -> usize {
        self.status_writes
    }

    /// Number of flushes.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Converts the recording into a response.
    pub fn into_response(self) -> Response<Bytes> {
        let mut response = Response::new(self.body.freeze());
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.sent_headers.unwrap_or(self.headers);
        response
    }

    fn send_head(&mut self) {
        if !self.header_written() {
            self.write_status(StatusCode::OK);
        }
    }
}

impl ResponseSink for ResponseRecorder {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_status(&mut self, status: StatusCode) {
        if self.header_written() {
            debug!(%status, "head already sent, ignoring status");
            return;
        }
        self.status = Some(status);
        self.sent_headers = Some(self.headers.clone());
        self.status_writes += 1;
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send_head();
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flusher(&mut self) -> Option<&mut dyn Flush> {
        Some(self)
    }
}

impl Flush for ResponseRecorder {
    fn flush(&mut self) -> io::Result<()> {
        self.send_head();
        self.flushes += 1;
        Ok(())
    }
}
