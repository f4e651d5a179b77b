use crate::content_type::{self, ContentType};
use crate::negotiate;
use crate::pool::{self, CompressorPool};
use crate::sink::ResponseSink;
use crate::writer::GzipResponseWriter;
use flate2::Compression;
use http::HeaderMap;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Default minimum body size for compression, a little under one Ethernet MTU.
pub const DEFAULT_MIN_SIZE: usize = 1400;

/// Errors reported while building a [`Config`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The compression level is neither the default sentinel nor in `1..=9`.
    #[error("invalid compression level requested: {0}")]
    InvalidLevel(i32),
    /// The minimum size threshold was negative.
    #[error("minimum size must not be negative, got {0}")]
    NegativeMinSize(i64),
}

/// Gzip compression level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Level {
    /// The compressor's default trade-off (level 6).
    #[default]
    Default,
    /// An explicit level between [`Level::BEST_SPEED`] and [`Level::BEST_COMPRESSION`].
    Precise(u32),
}

impl Level {
    /// Integer sentinel selecting [`Level::Default`].
    pub const DEFAULT_SENTINEL: i32 = -1;
    /// Fastest supported level.
    pub const BEST_SPEED: u32 = 1;
    /// Smallest-output supported level.
    pub const BEST_COMPRESSION: u32 = 9;

    pub(crate) fn compression(self) -> Compression {
        match self {
            Level::Default => Compression::default(),
            Level::Precise(level) => Compression::new(level),
        }
    }

    fn validate(self) -> Result<Self, ConfigError> {
        match self {
            Level::Default => Ok(self),
            Level::Precise(level) if (Self::BEST_SPEED..=Self::BEST_COMPRESSION).contains(&level) => {
                Ok(self)
            }
            Level::Precise(level) => Err(ConfigError::InvalidLevel(
                i32::try_from(level).unwrap_or(i32::MAX),
            )),
        }
    }
}

impl TryFrom<i32> for Level {
    type Error = ConfigError;

    fn try_from(level: i32) -> Result<Self, Self::Error> {
        if level == Self::DEFAULT_SENTINEL {
            return Ok(Level::Default);
        }
        u32::try_from(level)
            .map(Level::Precise)
            .map_err(|_| ConfigError::InvalidLevel(level))?
            .validate()
    }
}

/// Raw, deserializable compression options.
///
/// This is the shape configuration arrives in from files or the environment.
/// [`Config::from_options`] validates it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Minimum body size before compression is attempted.
    pub min_size: i64,
    /// Compression level, `-1` for the default.
    pub level: i32,
    /// Content types eligible for compression. Empty means all.
    pub content_types: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE as i64,
            level: Level::DEFAULT_SENTINEL,
            content_types: Vec::new(),
        }
    }
}

/// Immutable compression policy shared by every request.
///
/// Owns the compressor pool. Build one with [`Config::builder`], wrap it in an
/// [`Arc`] and hand it to [`GzipHandler`](crate::GzipHandler) or
/// [`GzipLayer`](crate::GzipLayer).
#[derive(Debug)]
pub struct Config {
    min_size: usize,
    level: Level,
    content_types: Vec<ContentType>,
    pool: CompressorPool,
}

impl Config {
    /// Starts building a configuration with default settings.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Validates raw options into a configuration.
    pub fn from_options(options: Options) -> Result<Self, ConfigError> {
        let min_size = usize::try_from(options.min_size)
            .map_err(|_| ConfigError::NegativeMinSize(options.min_size))?;
        Config::builder()
            .min_size(min_size)
            .level(Level::try_from(options.level)?)
            .content_types(options.content_types)
            .build()
    }

    /// Minimum body size before compression is attempted.
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// Compression level used by the pool.
    pub fn level(&self) -> Level {
        self.level
    }

    /// Parsed allow-list of content types. Empty means every type is allowed.
    pub fn content_types(&self) -> &[ContentType] {
        &self.content_types
    }

    /// Pool of compressors at this configuration's level.
    pub fn pool(&self) -> &CompressorPool {
        &self.pool
    }

    /// Returns whether the request headers accept a gzip-encoded response.
    pub fn accepts_gzip(&self, headers: &HeaderMap) -> bool {
        negotiate::accepts_gzip(headers)
    }

    /// Returns whether a `Content-Type` value is eligible for compression.
    pub fn allows_content_type(&self, content_type: &str) -> bool {
        content_type::is_allowed(&self.content_types, content_type)
    }

    /// Wraps `sink` in a gzip response writer governed by this configuration.
    pub fn response_writer<S: ResponseSink>(self: &Arc<Self>, sink: S) -> GzipResponseWriter<S> {
        GzipResponseWriter::new(Arc::clone(self), sink)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            level: Level::Default,
            content_types: Vec::new(),
            pool: CompressorPool::new(Level::Default),
        }
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    min_size: usize,
    level: Level,
    content_types: Vec<ContentType>,
    max_idle: usize,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            level: Level::Default,
            content_types: Vec::new(),
            max_idle: pool::DEFAULT_MAX_IDLE,
        }
    }
}

impl ConfigBuilder {
    /// Sets the minimum body size required for compression.
    ///
    /// Responses that declare a smaller Content-Length, or that end before
    /// this many bytes were written, are sent uncompressed.
    pub fn min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Sets the compression level.
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Caps how many idle compressors the pool keeps between responses.
    pub fn max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Restricts compression to the given content types.
    ///
    /// Types are compared case-insensitively and whitespace is ignored. A type
    /// without parameters matches any candidate with the same media type, so
    /// `text/html` matches `text/html; charset=utf-8`. A type with parameters
    /// only matches a candidate carrying exactly those parameters.
    ///
    /// Entries that fail to parse are dropped. Replaces any earlier list.
    pub fn content_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.content_types = types
            .into_iter()
            .filter_map(|raw| match raw.as_ref().parse::<ContentType>() {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    debug!(content_type = raw.as_ref(), error = %err, "ignoring content type");
                    None
                }
            })
            .collect();
        self
    }

    /// Validates the settings and builds the configuration.
    pub fn build(self) -> Result<Config, ConfigError> {
        let level = self.level.validate()?;
        Ok(Config {
            min_size: self.min_size,
            level,
            content_types: self.content_types,
            pool: CompressorPool::with_max_idle(level, self.max_idle),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::ResponseRecorder;
    use flate2::read::GzDecoder;
    use http::header;
    use std::io::Read;

    #[test]
    fn test_defaults() {
        let config = Config::builder().build().unwrap();
        assert_eq!(config.min_size(), DEFAULT_MIN_SIZE);
        assert_eq!(config.level(), Level::Default);
        assert!(config.content_types().is_empty());
        assert!(config.allows_content_type("image/png"));
    }

    #[test]
    fn test_every_precise_level_is_valid() {
        for level in Level::BEST_SPEED..=Level::BEST_COMPRESSION {
            let config = Config::builder().level(Level::Precise(level)).build();
            assert!(config.is_ok(), "level {level} rejected");
        }
    }

    #[test]
    fn test_invalid_levels_rejected() {
        assert_eq!(
            Config::builder().level(Level::Precise(42)).build().unwrap_err(),
            ConfigError::InvalidLevel(42)
        );
        assert_eq!(
            Config::builder().level(Level::Precise(0)).build().unwrap_err(),
            ConfigError::InvalidLevel(0)
        );
        assert_eq!(Level::try_from(-42), Err(ConfigError::InvalidLevel(-42)));
        assert_eq!(Level::try_from(10), Err(ConfigError::InvalidLevel(10)));
    }

    #[test]
    fn test_level_from_sentinel() {
        assert_eq!(Level::try_from(-1), Ok(Level::Default));
        assert_eq!(Level::try_from(9), Ok(Level::Precise(9)));
    }

    #[test]
    fn test_unparseable_content_types_dropped() {
        let config = Config::builder()
            .content_types(["text/html", "not a type", "application/json; charset=utf-8"])
            .build()
            .unwrap();
        assert_eq!(config.content_types().len(), 2);
        assert!(config.allows_content_type("text/html; charset=utf-8"));
        assert!(!config.allows_content_type("text/plain"));
    }

    #[test]
    fn test_options_from_json() {
        let options: Options = serde_json::from_str(
            r#"{"min_size": 128, "level": 9, "content_types": ["text/plain"]}"#,
        )
        .unwrap();
        let config = Config::from_options(options).unwrap();
        assert_eq!(config.min_size(), 128);
        assert_eq!(config.level(), Level::Precise(9));
        assert_eq!(config.content_types().len(), 1);
    }

    #[test]
    fn test_options_defaults_when_missing() {
        let options: Options = serde_json::from_str("{}").unwrap();
        assert_eq!(options, Options::default());
        let config = Config::from_options(options).unwrap();
        assert_eq!(config.min_size(), DEFAULT_MIN_SIZE);
    }

    #[test]
    fn test_negative_min_size_rejected() {
        let options = Options {
            min_size: -1,
            ..Options::default()
        };
        assert_eq!(
            Config::from_options(options).unwrap_err(),
            ConfigError::NegativeMinSize(-1)
        );
    }

    #[test]
    fn test_invalid_option_level_rejected() {
        let options = Options {
            level: 0,
            ..Options::default()
        };
        assert_eq!(
            Config::from_options(options).unwrap_err(),
            ConfigError::InvalidLevel(0)
        );
    }

    #[test]
    fn test_response_writer_uses_config() {
        let config = Arc::new(Config::builder().min_size(0).max_idle(4).build().unwrap());
        assert_eq!(config.pool().max_idle(), 4);
        let body = "hello hello hello hello".repeat(10);

        let mut recorder = ResponseRecorder::new();
        let mut writer = config.response_writer(&mut recorder);
        assert!(Arc::ptr_eq(writer.config(), &config));
        writer.write(body.as_bytes()).unwrap();
        writer.close().unwrap();
        drop(writer);

        assert_eq!(
            recorder.sent_headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
        let mut decoded = String::new();
        GzDecoder::new(recorder.body())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, body);
        assert_eq!(config.pool().idle(), 1);
    }
}
