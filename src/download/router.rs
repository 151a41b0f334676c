//! Scheme router: maps URL schemes to protocol downloader factories.
//!
//! The sole construction path the Manager uses on resume. Schemes are
//! matched case-insensitively; {http, https, ftp, ftps, sftp} are
//! registered at construction and additional factories can be installed
//! with [`Router::register`].

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use super::ftp::FtpDownloader;
use super::http::HttpDownloader;
use super::protocol::{DownloaderOptions, ProtocolDownloader};
use super::rate_limiter::SpeedLimiter;
use super::sftp::SftpDownloader;
use crate::config::Environment;

/// Factory producing a downloader for a parsed URL.
pub type DownloaderFactory = Box<
    dyn Fn(&str, DownloaderOptions) -> Result<Box<dyn ProtocolDownloader>, DownloadError>
        + Send
        + Sync,
>;

/// Scheme → factory registry.
pub struct Router {
    factories: HashMap<String, DownloaderFactory>,
}

impl Router {
    /// Builds a router with the standard factories. `client` lets the
    /// embedder share one HTTP connection pool; `None` builds the
    /// default client.
    #[must_use]
    pub fn new(client: Option<reqwest::Client>, env: Environment, limiter: SpeedLimiter) -> Self {
        let client = client.unwrap_or_else(default_http_client);
        let mut router = Self {
            factories: HashMap::new(),
        };

        {
            let client = client.clone();
            let env = env.clone();
            let limiter = limiter.clone();
            let http: DownloaderFactory = Box::new(move |url, opts| {
                Ok(Box::new(HttpDownloader::new(
                    client.clone(),
                    &env,
                    url,
                    limiter.clone(),
                    opts,
                )?))
            });
            router.register("http", http);
        }
        {
            let client = client.clone();
            let env = env.clone();
            let limiter = limiter.clone();
            router.register(
                "https",
                Box::new(move |url, opts| {
                    Ok(Box::new(HttpDownloader::new(
                        client.clone(),
                        &env,
                        url,
                        limiter.clone(),
                        opts,
                    )?))
                }),
            );
        }
        {
            let limiter = limiter.clone();
            router.register(
                "ftp",
                Box::new(move |url, opts| {
                    Ok(Box::new(FtpDownloader::new(url, limiter.clone(), opts)?))
                }),
            );
        }
        {
            let limiter = limiter.clone();
            router.register(
                "ftps",
                Box::new(move |url, opts| {
                    Ok(Box::new(FtpDownloader::new(url, limiter.clone(), opts)?))
                }),
            );
        }
        {
            router.register(
                "sftp",
                Box::new(move |url, opts| {
                    Ok(Box::new(SftpDownloader::new(
                        url,
                        &env,
                        limiter.clone(),
                        opts,
                    )?))
                }),
            );
        }

        router
    }

    /// Installs (or replaces) a factory for a scheme.
    pub fn register(&mut self, scheme: &str, factory: DownloaderFactory) {
        self.factories.insert(scheme.to_ascii_lowercase(), factory);
    }

    /// Registered schemes, for diagnostics.
    #[must_use]
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Builds a downloader for the URL, dispatching on its scheme.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidUrl`] for unparseable URLs and a
    /// permanent [`DownloadError::UnsupportedScheme`] when no factory is
    /// registered.
    #[instrument(skip(self, opts), fields(url = %url))]
    pub fn new_downloader(
        &self,
        url: &str,
        opts: DownloaderOptions,
    ) -> Result<Box<dyn ProtocolDownloader>, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        let scheme = parsed.scheme().to_ascii_lowercase();
        let factory = self
            .factories
            .get(&scheme)
            .ok_or(DownloadError::UnsupportedScheme {
                scheme: scheme.clone(),
            })?;
        debug!(scheme, "dispatching to protocol factory");
        factory(url, opts)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("schemes", &self.schemes()).finish()
    }
}

/// The shared HTTP client: connection pooling, gzip, sane timeouts.
///
/// # Panics
///
/// Panics if the builder rejects the static configuration, which cannot
/// happen in practice.
#[must_use]
#[allow(clippy::expect_used)]
pub fn default_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .read_timeout(Duration::from_secs(READ_TIMEOUT_SECS))
        .gzip(true)
        .build()
        .expect("failed to build HTTP client with static configuration")
}
