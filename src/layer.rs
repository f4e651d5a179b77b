use crate::config::Config;
use crate::service::GzipService;
use std::sync::Arc;
use tower::Layer;

/// A Tower layer that gzip-encodes HTTP response bodies.
///
/// All services produced by one layer share its [`Config`], and with it the
/// compressor pool.
#[derive(Debug, Clone)]
pub struct GzipLayer {
    config: Arc<Config>,
}

impl GzipLayer {
    /// Creates a new gzip layer with default settings.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a gzip layer using the given configuration.
    pub fn with_config(config: impl Into<Arc<Config>>) -> Self {
        Self {
            config: config.into(),
        }
    }

    /// Returns the shared configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }
}

impl Default for GzipLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for GzipLayer {
    type Service = GzipService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GzipService::new(inner, Arc::clone(&self.config))
    }
}
