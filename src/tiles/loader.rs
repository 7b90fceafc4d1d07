//! Asynchronous tile data loading.
//!
//! Every request carries the [`TileHandle`] of the activation it was issued
//! for. Fetches run on the async runtime, bounded by a semaphore, and their
//! results are queued on a channel that the map controller drains from its
//! own thread. Nothing here touches a [`TileEntity`](crate::TileEntity).

use async_trait::async_trait;
use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::FutureExt;
use fxhash::FxHashMap;
use once_cell::sync::Lazy;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::TileLoadingConfig;
use crate::core::geo::{CanonicalTileId, TileId};
use crate::runtime::async_utils::{async_delay, Semaphore, SemaphorePermit};
use crate::runtime::spawners::CancelFlagHandle;
use crate::runtime::AsyncHandle;
use crate::tiles::cache::TileCache;
use crate::tiles::entity::DataChannel;
use crate::tiles::pool::TileHandle;
use crate::tiles::source::UrlTemplateSource;
use crate::{MapError, Result};

/// Shared async HTTP client for tile fetching
static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent(concat!("terraplet/", env!("CARGO_PKG_VERSION")))
        .tcp_keepalive(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(16)
        .build()
        .expect("failed to build reqwest async client")
});

/// One (tile activation, channel) fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRequest {
    pub handle: TileHandle,
    pub tile_id: TileId,
    pub channel: DataChannel,
}

impl TileRequest {
    pub fn new(handle: TileHandle, tile_id: TileId, channel: DataChannel) -> Self {
        Self {
            handle,
            tile_id,
            channel,
        }
    }

    /// Wrapped address sent to the data source
    pub fn canonical(&self) -> CanonicalTileId {
        self.tile_id.canonical()
    }
}

/// Completed fetch, waiting to be committed by the controller
#[derive(Debug)]
pub struct FetchResult {
    pub handle: TileHandle,
    pub tile_id: TileId,
    pub channel: DataChannel,
    pub data: Result<Arc<Vec<u8>>>,
}

/// Produces raw payload bytes for a tile channel.
#[async_trait]
pub trait TileFetcher: Send + Sync {
    async fn fetch(&self, request: &TileRequest) -> Result<Vec<u8>>;
}

/// [`TileFetcher`] over HTTP, with one URL template per channel.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    sources: FxHashMap<DataChannel, UrlTemplateSource>,
    timeout: Option<Duration>,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, channel: DataChannel, source: UrlTemplateSource) -> Self {
        self.sources.insert(channel, source);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Channels this fetcher has a source for
    pub fn channels(&self) -> Vec<DataChannel> {
        DataChannel::ALL
            .into_iter()
            .filter(|channel| self.sources.contains_key(channel))
            .collect()
    }
}

#[async_trait]
impl TileFetcher for HttpFetcher {
    async fn fetch(&self, request: &TileRequest) -> Result<Vec<u8>> {
        let source = self.sources.get(&request.channel).ok_or_else(|| {
            MapError::Fetch(format!("no source configured for {:?} tiles", request.channel))
        })?;
        let url = source.url(request.canonical());

        let mut builder = HTTP_CLIENT.get(&url);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            return Err(MapError::Fetch(format!("HTTP {} for {}", response.status(), url)));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

/// Runs tile fetches with bounded concurrency and queues their results.
pub struct TileDataLoader {
    fetcher: Arc<dyn TileFetcher>,
    config: TileLoadingConfig,
    channels: Vec<DataChannel>,
    cache: TileCache,
    semaphore: Semaphore,
    result_tx: Sender<FetchResult>,
    result_rx: Receiver<FetchResult>,
}

impl TileDataLoader {
    /// Creates a loader that requests every channel.
    pub fn new(fetcher: Arc<dyn TileFetcher>, config: TileLoadingConfig) -> Self {
        let (result_tx, result_rx) = unbounded();
        Self {
            fetcher,
            cache: TileCache::new(config.cache_size),
            semaphore: Semaphore::new(config.max_concurrent.max(1)),
            config,
            channels: DataChannel::ALL.to_vec(),
            result_tx,
            result_rx,
        }
    }

    /// Restricts which channels the controller requests for new tiles.
    pub fn with_channels(mut self, channels: impl IntoIterator<Item = DataChannel>) -> Self {
        self.channels = channels.into_iter().collect();
        self
    }

    pub fn channels(&self) -> &[DataChannel] {
        &self.channels
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    /// Starts fetching `request`. Cached payloads are queued immediately.
    ///
    /// Fetched bytes are not cached here; the controller caches a payload
    /// only once it has decoded. The returned handle cancels the fetch; a
    /// cancelled fetch queues nothing.
    pub fn request(&self, request: TileRequest) -> Box<dyn AsyncHandle> {
        let key = request.canonical();

        if let Some(data) = self.cache.get(request.channel, key) {
            log::debug!("cache hit for {:?} tile {}", request.channel, key);
            let _ = self.result_tx.send(FetchResult {
                handle: request.handle,
                tile_id: request.tile_id,
                channel: request.channel,
                data: Ok(data),
            });
            let handle = CancelFlagHandle::default();
            handle.mark_finished();
            return Box::new(handle);
        }

        let fetcher = Arc::clone(&self.fetcher);
        let semaphore = self.semaphore.clone();
        let result_tx = self.result_tx.clone();
        let max_retries = self.config.max_retries;
        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);

        crate::runtime::spawn(async move {
            let _permit = SemaphorePermit::acquire(&semaphore).await;
            let fetch = Self::fetch_with_retries(fetcher.as_ref(), &request, max_retries, retry_delay);
            let data = match AssertUnwindSafe(fetch).catch_unwind().await {
                Ok(result) => result.map(Arc::new),
                Err(_) => {
                    log::error!("{:?} fetch for tile {} panicked", request.channel, key);
                    Err(MapError::Fetch(format!("fetch for tile {} panicked", key)))
                }
            };

            let _ = result_tx.send(FetchResult {
                handle: request.handle,
                tile_id: request.tile_id,
                channel: request.channel,
                data,
            });
        })
    }

    async fn fetch_with_retries(
        fetcher: &dyn TileFetcher,
        request: &TileRequest,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<Vec<u8>> {
        let mut attempt = 0u32;
        loop {
            match fetcher.fetch(request).await {
                Ok(bytes) => {
                    log::debug!(
                        "fetched {:?} tile {} ({} bytes)",
                        request.channel,
                        request.canonical(),
                        bytes.len()
                    );
                    return Ok(bytes);
                }
                Err(e) if attempt < max_retries => {
                    attempt += 1;
                    log::debug!(
                        "{:?} tile {} failed, retry {}/{}: {}",
                        request.channel,
                        request.canonical(),
                        attempt,
                        max_retries,
                        e
                    );
                    if !retry_delay.is_zero() {
                        async_delay(retry_delay).await;
                    }
                }
                Err(e) => {
                    log::warn!("giving up on {:?} tile {}: {}", request.channel, request.canonical(), e);
                    return Err(e);
                }
            }
        }
    }

    /// Results completed since the last call, in completion order
    pub fn try_recv_results(&self) -> Vec<FetchResult> {
        self.result_rx.try_iter().collect()
    }

    /// Blocks until one result arrives or `timeout` elapses
    pub fn recv_result_timeout(&self, timeout: Duration) -> Option<FetchResult> {
        self.result_rx.recv_timeout(timeout).ok()
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl std::fmt::Debug for TileDataLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileDataLoader")
            .field("config", &self.config)
            .field("channels", &self.channels)
            .field("cached", &self.cache.len())
            .finish()
    }
}
