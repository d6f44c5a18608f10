//! Fetch strategy: stale-while-revalidate on hits, network with an offline
//! fallback on misses.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use studyhub_net::{fetch_within, Fetcher, Request, Response};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::Result;

/// How a response was produced.
#[derive(Debug)]
pub enum Served {
    /// Cached copy, with the background refresh that was started for it.
    ///
    /// The refresh is detached: dropping the handle does not cancel it, and
    /// its errors are discarded.
    Cache {
        response: Response,
        revalidation: JoinHandle<()>,
    },
    /// Live network response (stored in the cache when it was a 200).
    Network(Response),
    /// Offline document served in place of a failed HTML navigation.
    OfflineFallback(Response),
}

impl Served {
    pub fn response(&self) -> &Response {
        match self {
            Served::Cache { response, .. } => response,
            Served::Network(response) | Served::OfflineFallback(response) => response,
        }
    }

    pub fn into_response(self) -> Response {
        match self {
            Served::Cache { response, .. } => response,
            Served::Network(response) | Served::OfflineFallback(response) => response,
        }
    }
}

/// Only full 200 responses are written by the worker.
fn is_storable(response: &Response) -> bool {
    response.status == StatusCode::OK
}

/// Fetch strategy engine.
#[derive(Clone)]
pub struct FetchStrategy {
    store: CacheStore,
    fetcher: Arc<dyn Fetcher>,
    cache_name: String,
    offline_url: Url,
    timeout: Option<Duration>,
}

impl FetchStrategy {
    pub fn new(
        store: CacheStore,
        fetcher: Arc<dyn Fetcher>,
        cache_name: impl Into<String>,
        offline_url: Url,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            fetcher,
            cache_name: cache_name.into(),
            offline_url,
            timeout,
        }
    }

    /// Produce a response for an eligible request.
    pub async fn respond(&self, request: &Request) -> Result<Served> {
        if let Some(entry) = self.store.match_request(request).await {
            trace!(url = %request.url, "Cache hit");
            let response = entry.to_response()?;
            let revalidation = self.spawn_revalidation(request.clone());
            return Ok(Served::Cache {
                response,
                revalidation,
            });
        }

        trace!(url = %request.url, "Cache miss");
        match fetch_within(self.fetcher.as_ref(), request, self.timeout).await {
            Ok(response) => {
                if is_storable(&response) {
                    self.store_copy(request, &response).await;
                }
                Ok(Served::Network(response))
            }
            Err(err) => {
                debug!(url = %request.url, error = %err, "Network fetch failed");
                if request.accepts_html() {
                    if let Some(fallback) = self.offline_fallback().await? {
                        info!(url = %request.url, "Serving offline fallback");
                        return Ok(Served::OfflineFallback(fallback));
                    }
                    warn!(url = %request.url, "Offline fallback not cached");
                }
                Err(err.into())
            }
        }
    }

    /// Refresh the cached copy of `request` in the background.
    fn spawn_revalidation(&self, request: Request) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            match fetch_within(engine.fetcher.as_ref(), &request, engine.timeout).await {
                Ok(response) if is_storable(&response) => {
                    engine.store_copy(&request, &response).await;
                    trace!(url = %request.url, "Revalidated");
                }
                Ok(response) => {
                    debug!(url = %request.url, status = %response.status, "Revalidation not stored");
                }
                Err(err) => {
                    debug!(url = %request.url, error = %err, "Revalidation failed, discarded");
                }
            }
        })
    }

    /// Write into this worker's generation. A failed write never fails the
    /// fetch, and a generation evicted by a newer worker stays evicted.
    async fn store_copy(&self, request: &Request, response: &Response) {
        let Some(cache) = self.store.get(&self.cache_name).await else {
            debug!(url = %request.url, cache = %self.cache_name, "Generation evicted, not storing");
            return;
        };
        if let Err(err) = cache.put(request, response).await {
            warn!(url = %request.url, error = %err, "Could not cache response");
        }
    }

    async fn offline_fallback(&self) -> Result<Option<Response>> {
        let request = Request::get(self.offline_url.clone());
        self.store
            .match_request(&request)
            .await
            .map(|entry| entry.to_response())
            .transpose()
    }
}

impl std::fmt::Debug for FetchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchStrategy")
            .field("cache_name", &self.cache_name)
            .field("offline_url", &self.offline_url.as_str())
            .field("timeout", &self.timeout)
            .finish()
    }
}
