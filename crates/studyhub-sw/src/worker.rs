//! A single worker instance and its event dispatch table.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;
use serde_json::Value as JsonValue;
use studyhub_core::WorkerConfig;
use studyhub_net::{fetch_within, Fetcher, PassthroughReason, Request, RequestRouter, Response, Route};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::cache::CacheStore;
use crate::clients::Clients;
use crate::lifecycle::{Lifecycle, ServiceWorkerId, ServiceWorkerState};
use crate::notification::{
    AppMessage, ClickOutcome, NotificationCenter, NotificationDescriptor, NotificationDispatcher,
};
use crate::strategy::{FetchStrategy, Served};
use crate::{Result, ServiceWorkerError, ServiceWorkerEvent};

/// Events delivered to a worker by its host.
#[derive(Debug, Clone)]
pub enum IncomingEvent {
    Install,
    Activate,
    Fetch(Request),
    /// Push with its raw payload, if any.
    Push(Option<Bytes>),
    /// Message posted by an application page.
    Message(JsonValue),
    /// Message forwarded by the push SDK adapter.
    BackgroundMessage(JsonValue),
    NotificationClick { tag: String },
}

/// Event kinds, the keys of the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncomingEventKind {
    Install,
    Activate,
    Fetch,
    Push,
    Message,
    BackgroundMessage,
    NotificationClick,
}

impl IncomingEvent {
    pub fn kind(&self) -> IncomingEventKind {
        match self {
            IncomingEvent::Install => IncomingEventKind::Install,
            IncomingEvent::Activate => IncomingEventKind::Activate,
            IncomingEvent::Fetch(_) => IncomingEventKind::Fetch,
            IncomingEvent::Push(_) => IncomingEventKind::Push,
            IncomingEvent::Message(_) => IncomingEventKind::Message,
            IncomingEvent::BackgroundMessage(_) => IncomingEventKind::BackgroundMessage,
            IncomingEvent::NotificationClick { .. } => IncomingEventKind::NotificationClick,
        }
    }
}

impl IncomingEventKind {
    /// States in which a worker accepts this kind of event.
    pub fn accepted_in(self, state: ServiceWorkerState) -> bool {
        use ServiceWorkerState::*;
        match self {
            IncomingEventKind::Install => state == Parsed,
            IncomingEventKind::Activate => state == Waiting,
            IncomingEventKind::Message => matches!(state, Waiting | Active),
            IncomingEventKind::Fetch
            | IncomingEventKind::Push
            | IncomingEventKind::BackgroundMessage
            | IncomingEventKind::NotificationClick => state == Active,
        }
    }
}

/// Result of handling a fetch event.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The worker stays out of the way; the host fetches normally.
    Passthrough(PassthroughReason),
    /// The worker produced the response.
    Served(Served),
}

/// What a handler did.
#[derive(Debug)]
pub enum EventOutcome {
    Installed { precached: usize },
    Activated {
        evicted: Vec<String>,
        claimed: Vec<String>,
    },
    Fetch(FetchOutcome),
    Notified(NotificationDescriptor),
    SkipWaitingRequested,
    Clicked(ClickOutcome),
    /// The event required no action.
    Ignored,
}

/// One worker instance.
pub struct ServiceWorker {
    config: Arc<WorkerConfig>,
    lifecycle: RwLock<Lifecycle>,
    store: CacheStore,
    fetcher: Arc<dyn Fetcher>,
    router: RequestRouter,
    strategy: FetchStrategy,
    notifications: NotificationDispatcher,
    clients: Arc<RwLock<Clients>>,
    events: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorker {
    /// Create a worker in the `Parsed` state.
    pub fn new(
        config: Arc<WorkerConfig>,
        store: CacheStore,
        fetcher: Arc<dyn Fetcher>,
        clients: Arc<RwLock<Clients>>,
        notifications: NotificationCenter,
        events: mpsc::UnboundedSender<ServiceWorkerEvent>,
    ) -> Result<Self> {
        let strategy = FetchStrategy::new(
            store.clone(),
            fetcher.clone(),
            config.cache_name.clone(),
            config.offline_url()?,
            config.network_timeout(),
        );
        let notifications = NotificationDispatcher::new(
            config.clone(),
            notifications,
            clients.clone(),
            events.clone(),
        )?;

        Ok(Self {
            router: RequestRouter::from_markers(&config.excluded_host_markers),
            lifecycle: RwLock::new(Lifecycle::new(events.clone())),
            config,
            store,
            fetcher,
            strategy,
            notifications,
            clients,
            events,
        })
    }

    pub async fn id(&self) -> ServiceWorkerId {
        self.lifecycle.read().await.id()
    }

    pub async fn state(&self) -> ServiceWorkerState {
        self.lifecycle.read().await.state()
    }

    pub async fn skip_waiting_requested(&self) -> bool {
        self.lifecycle.read().await.skip_waiting_requested()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn notifications(&self) -> &NotificationDispatcher {
        &self.notifications
    }

    /// Mark this worker redundant (replaced or unregistered).
    pub async fn make_redundant(&self) {
        self.lifecycle.write().await.make_redundant();
    }

    /// Dispatch an event to its handler and wait for it to finish.
    ///
    /// Everything a handler starts is awaited here, except the background
    /// revalidation spawned by a cache hit.
    pub async fn dispatch(&self, event: IncomingEvent) -> Result<EventOutcome> {
        let kind = event.kind();
        let state = self.state().await;
        if !kind.accepted_in(state) {
            return Err(ServiceWorkerError::StateError(format!(
                "{kind:?} event not accepted while {state:?}"
            )));
        }

        match event {
            IncomingEvent::Install => self.on_install().await,
            IncomingEvent::Activate => self.on_activate().await,
            IncomingEvent::Fetch(request) => self.on_fetch(&request).await.map(EventOutcome::Fetch),
            IncomingEvent::Push(data) => Ok(self
                .notifications
                .on_push(data.as_deref())
                .await?
                .map_or(EventOutcome::Ignored, EventOutcome::Notified)),
            IncomingEvent::Message(value) => self.on_message(&value).await,
            IncomingEvent::BackgroundMessage(value) => self
                .notifications
                .on_background_message(&value)
                .await
                .map(EventOutcome::Notified),
            IncomingEvent::NotificationClick { tag } => self
                .notifications
                .on_click(&tag)
                .await
                .map(EventOutcome::Clicked),
        }
    }

    #[instrument(skip(self), fields(cache = %self.config.cache_name))]
    async fn on_install(&self) -> Result<EventOutcome> {
        self.lifecycle
            .write()
            .await
            .transition(ServiceWorkerState::Installing)?;

        match self.precache().await {
            Ok(precached) => {
                let mut lifecycle = self.lifecycle.write().await;
                lifecycle.transition(ServiceWorkerState::Waiting)?;
                if self.config.skip_waiting_on_install {
                    lifecycle.request_skip_waiting();
                }
                info!(precached, "Installed");
                Ok(EventOutcome::Installed { precached })
            }
            Err(err) => {
                warn!(error = %err, "Install failed");
                self.lifecycle.write().await.make_redundant();
                Err(err)
            }
        }
    }

    /// Fetch the whole precache set, then store it in one step.
    async fn precache(&self) -> Result<usize> {
        let urls = self.config.precache_urls()?;
        let timeout = self.config.network_timeout();

        let pairs: Vec<(Request, Response)> = try_join_all(urls.into_iter().map(|url| async move {
            let request = Request::get(url);
            let response = fetch_within(self.fetcher.as_ref(), &request, timeout)
                .await
                .map_err(|e| ServiceWorkerError::PrecacheFailed {
                    url: request.url.to_string(),
                    reason: e.to_string(),
                })?;
            if !response.ok() {
                return Err(ServiceWorkerError::PrecacheFailed {
                    url: request.url.to_string(),
                    reason: format!("status {}", response.status),
                });
            }
            Ok::<_, ServiceWorkerError>((request, response))
        }))
        .await?;

        let cache = self.store.open(&self.config.cache_name).await?;
        cache.put_all(&pairs).await?;
        Ok(pairs.len())
    }

    #[instrument(skip(self), fields(cache = %self.config.cache_name))]
    async fn on_activate(&self) -> Result<EventOutcome> {
        let worker = {
            let mut lifecycle = self.lifecycle.write().await;
            lifecycle.transition(ServiceWorkerState::Activating)?;
            lifecycle.id()
        };

        let mut evicted = Vec::new();
        for name in self.store.keys().await {
            if name == self.config.cache_name {
                continue;
            }
            if let Err(err) = self.store.delete(&name).await {
                self.lifecycle.write().await.make_redundant();
                return Err(err);
            }
            info!(stale = %name, "Deleted old cache");
            evicted.push(name);
        }

        self.lifecycle
            .write()
            .await
            .transition(ServiceWorkerState::Active)?;

        let claimed = self
            .clients
            .write()
            .await
            .claim(worker, |url| self.config.is_app_url(url));
        for client_id in &claimed {
            let _ = self.events.send(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                worker_id: worker,
            });
        }

        info!(evicted = evicted.len(), claimed = claimed.len(), "Activated");
        Ok(EventOutcome::Activated { evicted, claimed })
    }

    async fn on_fetch(&self, request: &Request) -> Result<FetchOutcome> {
        match self.router.route(request) {
            Route::Passthrough(reason) => Ok(FetchOutcome::Passthrough(reason)),
            Route::Handle => self.strategy.respond(request).await.map(FetchOutcome::Served),
        }
    }

    async fn on_message(&self, value: &JsonValue) -> Result<EventOutcome> {
        match AppMessage::parse(value)? {
            AppMessage::SkipWaiting => {
                self.lifecycle.write().await.request_skip_waiting();
                debug!("Skip waiting requested by page");
                Ok(EventOutcome::SkipWaitingRequested)
            }
            AppMessage::ShowNotification { title, body, tag } => {
                if self.state().await != ServiceWorkerState::Active {
                    return Err(ServiceWorkerError::StateError(
                        "notifications are shown by the active worker".to_string(),
                    ));
                }
                let descriptor = self.notifications.on_show_request(title, body, tag).await;
                Ok(EventOutcome::Notified(descriptor))
            }
            AppMessage::Unknown => Ok(EventOutcome::Ignored),
        }
    }

    /// Fetch `request` as the page would see it: through the worker when it
    /// handles the request, straight from the network otherwise.
    pub async fn serve(&self, request: Request) -> Result<Response> {
        match self.dispatch(IncomingEvent::Fetch(request.clone())).await? {
            EventOutcome::Fetch(FetchOutcome::Served(served)) => Ok(served.into_response()),
            EventOutcome::Fetch(FetchOutcome::Passthrough(reason)) => {
                debug!(url = %request.url, ?reason, "Passthrough fetch");
                Ok(fetch_within(self.fetcher.as_ref(), &request, self.config.network_timeout()).await?)
            }
            other => Err(ServiceWorkerError::StateError(format!(
                "unexpected fetch outcome {other:?}"
            ))),
        }
    }
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("cache_name", &self.config.cache_name)
            .field("base_path", &self.config.base_path)
            .finish_non_exhaustive()
    }
}
