//! Transparent gzip compression for HTTP responses.
//!
//! Whether a response is worth compressing often cannot be known from its
//! headers alone, yet headers must be sent before the body. This crate wraps
//! a response sink in a [`GzipResponseWriter`] that holds back the status and
//! the first body bytes until it can decide, then either gzip-encodes the rest
//! of the response or passes it through byte for byte.
//!
//! Two integrations are provided:
//!
//! - [`GzipHandler`] wraps a synchronous [`Handler`] writing to a
//!   [`ResponseSink`].
//! - [`GzipLayer`] is a Tower layer for services returning
//!   `http::Response<impl Body>`.
//!
//! # Example
//!
//! ```ignore
//! use http_response_gzip::{Config, GzipLayer};
//! use tower::ServiceBuilder;
//!
//! let config = Config::builder()
//!     .min_size(1024)
//!     .content_types(["text/html", "application/json"])
//!     .build()?;
//! let service = ServiceBuilder::new()
//!     .layer(GzipLayer::with_config(config))
//!     .service(my_service);
//! ```
//!
//! # Compression Rules
//!
//! The response is passed through unchanged when:
//! - The request does not accept `gzip` (or `x-gzip`, or `*`)
//! - `Content-Encoding` header is already set
//! - `Content-Range` header is present (range responses)
//! - `Content-Length` is below the minimum size (default: 1400 bytes)
//! - `Content-Type` is not in the configured allow-list
//! - The body ends before reaching the minimum size
//!
//! Without a `Content-Type`, one is sniffed from the first bytes of the body.
//!
//! The Tower layer **flushes** after each chunk when:
//! - `X-Accel-Buffering: no` header is present
//! - `Content-Type` is `text/event-stream`
//! - `Content-Type` starts with `application/grpc-web`
//!
//! # Response Modifications
//!
//! Every response gets `Accept-Encoding` in its `Vary` header. When
//! compression is applied:
//! - `Content-Encoding` header is set to `gzip`
//! - `Content-Length` header is removed (compressed size is unknown)
//! - `Accept-Ranges` header is removed

#![deny(missing_docs)]

mod body;
mod codec;
mod config;
mod content_type;
mod future;
mod handler;
mod layer;
mod negotiate;
mod pool;
pub mod recorder;
mod service;
mod sink;
pub mod sniff;
mod writer;

pub use body::GzipBody;
pub use codec::Compressor;
pub use config::{Config, ConfigBuilder, ConfigError, DEFAULT_MIN_SIZE, Level, Options};
pub use content_type::{ContentType, ContentTypeParseError};
pub use future::ResponseFuture;
pub use handler::{GzipHandler, Handler};
pub use layer::GzipLayer;
pub use negotiate::{Codings, parse_encodings};
pub use pool::{CompressorPool, DEFAULT_MAX_IDLE};
pub use service::GzipService;
pub use sink::{
    Capabilities, CloseNotify, Connection, Flush, Hijack, HijackError, ResponseSink,
};
pub use writer::{GzipResponseWriter, WriteError};
