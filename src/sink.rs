use http::{HeaderMap, StatusCode};
use std::io;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The writing half of an HTTP response.
///
/// Headers may be changed until the status is written or the first body byte
/// is written, whichever happens first. Optional transport features are
/// exposed through the capability accessors, which return `None` when the
/// sink does not support them.
pub trait ResponseSink {
    /// Response headers.
    fn headers(&self) -> &HeaderMap;

    /// Mutable response headers.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Sends the status line and headers.
    fn write_status(&mut self, status: StatusCode);

    /// Writes body bytes, sending the head with `200 OK` first if needed.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Buffered-flush capability.
    fn flusher(&mut self) -> Option<&mut dyn Flush> {
        None
    }

    /// Raw connection takeover capability.
    fn hijacker(&mut self) -> Option<&mut dyn Hijack> {
        None
    }

    /// Early-disconnect notification capability.
    fn close_notifier(&self) -> Option<&dyn CloseNotify> {
        None
    }
}

/// Pushes buffered response data to the client.
pub trait Flush {
    /// Flushes buffered data.
    fn flush(&mut self) -> io::Result<()>;
}

/// Takes over the underlying connection from the HTTP server.
pub trait Hijack {
    /// Detaches the connection. The server no longer touches it afterwards.
    fn hijack(&mut self) -> Result<Box<dyn Connection>, HijackError>;
}

/// Reports when the client goes away before the response is complete.
pub trait CloseNotify {
    /// Token cancelled once the client connection is gone.
    fn close_notify(&self) -> CancellationToken;
}

/// A raw bidirectional connection handed out by [`Hijack`].
pub trait Connection: io::Read + io::Write + Send {}

impl<T: io::Read + io::Write + Send> Connection for T {}

/// Errors returned when taking over a connection.
#[derive(Debug, Error)]
pub enum HijackError {
    /// The sink cannot hand out its connection.
    #[error("connection hijacking is not supported")]
    Unsupported,
    /// The connection could not be detached.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The set of optional capabilities a sink exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Supports [`Flush`].
    pub flush: bool,
    /// Supports [`Hijack`].
    pub hijack: bool,
    /// Supports [`CloseNotify`].
    pub close_notify: bool,
}

impl Capabilities {
    /// Queries which capabilities `sink` exposes.
    pub fn of<S: ResponseSink + ?Sized>(sink: &mut S) -> Self {
        Self {
            flush: sink.flusher().is_some(),
            hijack: sink.hijacker().is_some(),
            close_notify: sink.close_notifier().is_some(),
        }
    }
}

impl<S: ResponseSink + ?Sized> ResponseSink for &mut S {
    fn headers(&self) -> &HeaderMap {
        (**self).headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        (**self).headers_mut()
    }

    fn write_status(&mut self, status: StatusCode) {
        (**self).write_status(status)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn flusher(&mut self) -> Option<&mut dyn Flush> {
        (**self).flusher()
    }

    fn hijacker(&mut self) -> Option<&mut dyn Hijack> {
        (**self).hijacker()
    }

    fn close_notifier(&self) -> Option<&dyn CloseNotify> {
        (**self).close_notifier()
    }
}

impl<S: ResponseSink + ?Sized> ResponseSink for Box<S> {
    fn headers(&self) -> &HeaderMap {
        (**self).headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        (**self).headers_mut()
    }

    fn write_status(&mut self, status: StatusCode) {
        (**self).write_status(status)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn flusher(&mut self) -> Option<&mut dyn Flush> {
        (**self).flusher()
    }

    fn hijacker(&mut self) -> Option<&mut dyn Hijack> {
        (**self).hijacker()
    }

    fn close_notifier(&self) -> Option<&dyn CloseNotify> {
        (**self).close_notifier()
    }
}
