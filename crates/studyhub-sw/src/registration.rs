//! Registration: the installing, waiting and active workers of one scope and
//! the resources they share.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use studyhub_core::WorkerConfig;
use studyhub_net::{fetch_within, Fetcher, Request, Response};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::clients::Clients;
use crate::notification::{AppMessage, NotificationCenter};
use crate::worker::{EventOutcome, IncomingEvent, ServiceWorker};
use crate::{Result, ServiceWorkerError, ServiceWorkerEvent};

#[derive(Default)]
struct Slots {
    installing: Option<Arc<ServiceWorker>>,
    waiting: Option<Arc<ServiceWorker>>,
    active: Option<Arc<ServiceWorker>>,
}

/// A service worker registration.
pub struct Registration {
    scope: Url,
    config: Arc<WorkerConfig>,
    store: CacheStore,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<RwLock<Clients>>,
    notifications: NotificationCenter,
    events: mpsc::UnboundedSender<ServiceWorkerEvent>,
    slots: RwLock<Slots>,
}

impl Registration {
    /// Create a registration and the channel its events are reported on.
    pub fn new(
        config: WorkerConfig,
        store: CacheStore,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>)> {
        config.validate()?;
        let scope = config.base_url()?;
        let (events, event_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                scope,
                config: Arc::new(config),
                store,
                fetcher,
                clients: Arc::new(RwLock::new(Clients::new())),
                notifications: NotificationCenter::new(events.clone()),
                events,
                slots: RwLock::new(Slots::default()),
            },
            event_rx,
        ))
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.clients)
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    pub async fn installing(&self) -> Option<Arc<ServiceWorker>> {
        self.slots.read().await.installing.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<ServiceWorker>> {
        self.slots.read().await.waiting.clone()
    }

    pub async fn active(&self) -> Option<Arc<ServiceWorker>> {
        self.slots.read().await.active.clone()
    }

    /// Install a new worker, activating it right away when it asks to skip
    /// waiting or nothing is active yet. Otherwise it stays waiting until a
    /// page posts a skip-waiting message.
    ///
    /// A failed install leaves the registration as it was; calling
    /// `register` again starts over with a fresh worker.
    pub async fn register(&self) -> Result<Arc<ServiceWorker>> {
        let worker = Arc::new(ServiceWorker::new(
            Arc::clone(&self.config),
            self.store.clone(),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.clients),
            self.notifications.clone(),
            self.events.clone(),
        )?);

        let superseded = self.slots.write().await.installing.replace(Arc::clone(&worker));
        if let Some(old) = superseded {
            old.make_redundant().await;
        }

        let installed = worker.dispatch(IncomingEvent::Install).await;
        let displaced = {
            let mut slots = self.slots.write().await;
            slots.installing = None;
            match installed {
                Ok(_) => slots.waiting.replace(Arc::clone(&worker)),
                Err(err) => {
                    warn!(scope = %self.scope, error = %err, "Registration failed");
                    return Err(err);
                }
            }
        };
        if let Some(old) = displaced {
            old.make_redundant().await;
        }

        if worker.skip_waiting_requested().await || self.active().await.is_none() {
            self.activate_waiting().await?;
        }
        Ok(worker)
    }

    /// Promote the waiting worker.
    ///
    /// The previous active worker keeps control until the new one has
    /// activated, and only then becomes redundant. If activation fails the
    /// previous worker stays active.
    pub async fn activate_waiting(&self) -> Result<Option<EventOutcome>> {
        let Some(worker) = self.slots.write().await.waiting.take() else {
            return Ok(None);
        };

        let outcome = match worker.dispatch(IncomingEvent::Activate).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(scope = %self.scope, error = %err, "Activation failed, keeping current worker");
                worker.make_redundant().await;
                return Err(err);
            }
        };

        let previous = self.slots.write().await.active.replace(worker);
        if let Some(previous) = previous {
            previous.make_redundant().await;
        }
        info!(scope = %self.scope, "Worker activated");
        Ok(Some(outcome))
    }

    /// Deliver a page message.
    ///
    /// Skip-waiting goes to the waiting worker (and promotes it); everything
    /// else goes to the active worker.
    pub async fn post_message(&self, value: JsonValue) -> Result<EventOutcome> {
        let skip_waiting = AppMessage::parse(&value)? == AppMessage::SkipWaiting;
        let waiting = self.waiting().await;

        let target = match (&waiting, skip_waiting) {
            (Some(w), true) => Arc::clone(w),
            _ => self
                .active()
                .await
                .ok_or_else(|| ServiceWorkerError::NotFound("no active worker".to_string()))?,
        };

        let outcome = target.dispatch(IncomingEvent::Message(value)).await?;
        if skip_waiting && waiting.is_some() {
            self.activate_waiting().await?;
        }
        Ok(outcome)
    }

    /// Deliver an event to the active worker.
    pub async fn dispatch(&self, event: IncomingEvent) -> Result<EventOutcome> {
        let active = self
            .active()
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound("no active worker".to_string()))?;
        active.dispatch(event).await
    }

    /// Fetch as a page of this scope would: through the active worker, or
    /// straight from the network when there is none.
    pub async fn fetch(&self, request: Request) -> Result<Response> {
        match self.active().await {
            Some(worker) => worker.serve(request).await,
            None => {
                debug!(url = %request.url, "No active worker, fetching directly");
                Ok(fetch_within(self.fetcher.as_ref(), &request, self.config.network_timeout()).await?)
            }
        }
    }

    /// Retire every worker of this registration.
    pub async fn unregister(&self) {
        let workers: Vec<_> = {
            let mut slots = self.slots.write().await;
            [slots.installing.take(), slots.waiting.take(), slots.active.take()]
                .into_iter()
                .flatten()
                .collect()
        };
        for worker in workers {
            worker.make_redundant().await;
        }
        info!(scope = %self.scope, "Unregistered");
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("scope", &self.scope.as_str())
            .field("cache_name", &self.config.cache_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Client;
    use crate::lifecycle::ServiceWorkerState;
    use crate::notification::ClickOutcome;
    use crate::strategy::tests::ScriptedNetwork;
    use http::StatusCode;
    use serde_json::json;

    fn config(cache_name: &str) -> WorkerConfig {
        WorkerConfig {
            cache_name: cache_name.to_string(),
            precache: vec!["/chris/".to_string(), "/chris/manifest.json".to_string()],
            ..WorkerConfig::default()
        }
    }

    fn network() -> Arc<ScriptedNetwork> {
        let network = Arc::new(ScriptedNetwork::default());
        network.serve("http://localhost/chris/", StatusCode::OK, "<html>shell</html>");
        network.serve("http://localhost/chris/manifest.json", StatusCode::OK, "{}");
        network
    }

    #[tokio::test]
    async fn test_register_installs_and_activates() {
        let (registration, mut events) =
            Registration::new(config("studyhub-v4"), CacheStore::new(), network()).unwrap();

        let worker = registration.register().await.unwrap();
        assert_eq!(worker.state().await, ServiceWorkerState::Active);
        assert!(registration.waiting().await.is_none());
        assert!(registration.installing().await.is_none());
        assert!(registration.active().await.is_some());

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ServiceWorkerEvent::StateChange { new_state, .. } = event {
                states.push(new_state);
            }
        }
        assert_eq!(
            states,
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Waiting,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Active
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_install_can_be_retried() {
        let network = Arc::new(ScriptedNetwork::default());
        let (registration, _events) =
            Registration::new(config("studyhub-v4"), CacheStore::new(), network.clone()).unwrap();

        assert!(registration.register().await.is_err());
        assert!(registration.active().await.is_none());
        assert!(registration.installing().await.is_none());

        network.serve("http://localhost/chris/", StatusCode::OK, "<html>shell</html>");
        network.serve("http://localhost/chris/manifest.json", StatusCode::OK, "{}");
        let worker = registration.register().await.unwrap();
        assert_eq!(worker.state().await, ServiceWorkerState::Active);
    }

    #[tokio::test]
    async fn test_new_generation_replaces_old() {
        let store = CacheStore::new();
        let network = network();
        network.serve("http://localhost/chris/notes.json", StatusCode::OK, "[]");

        let (old_reg, _old_events) =
            Registration::new(config("studyhub-v3"), store.clone(), network.clone()).unwrap();
        old_reg.register().await.unwrap();
        assert_eq!(store.keys().await, vec!["studyhub-v3"]);

        let (registration, _events) =
            Registration::new(config("studyhub-v4"), store.clone(), network).unwrap();
        let worker = registration.register().await.unwrap();
        assert_eq!(worker.state().await, ServiceWorkerState::Active);
        assert_eq!(store.keys().await, vec!["studyhub-v4"]);

        // A worker whose generation was evicted still answers, but never
        // brings its generation back.
        let response = old_reg
            .fetch(Request::get_str("http://localhost/chris/notes.json").unwrap())
            .await
            .unwrap();
        assert_eq!(response.text().unwrap(), "[]");
        assert_eq!(store.keys().await, vec!["studyhub-v4"]);
    }

    #[tokio::test]
    async fn test_skip_waiting_message_promotes_waiting_worker() {
        for message in [json!({"type": "SKIP_WAITING"}), json!("skipWaiting")] {
            let config = WorkerConfig {
                skip_waiting_on_install: false,
                ..config("studyhub-v4")
            };
            let (registration, _events) =
                Registration::new(config, CacheStore::new(), network()).unwrap();

            let first = registration.register().await.unwrap();
            assert_eq!(first.state().await, ServiceWorkerState::Active);

            let second = registration.register().await.unwrap();
            assert_eq!(second.state().await, ServiceWorkerState::Waiting);
            assert_eq!(first.state().await, ServiceWorkerState::Active);
            assert!(registration.waiting().await.is_some());

            let outcome = registration.post_message(message).await.unwrap();
            assert!(matches!(outcome, EventOutcome::SkipWaitingRequested));
            assert_eq!(second.state().await, ServiceWorkerState::Active);
            assert_eq!(first.state().await, ServiceWorkerState::Redundant);
            assert!(registration.waiting().await.is_none());
            assert_eq!(
                registration.active().await.unwrap().id().await,
                second.id().await
            );
        }
    }

    #[tokio::test]
    async fn test_failed_activation_keeps_current_worker() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        std::fs::create_dir(&state_dir).unwrap();
        let store = CacheStore::persistent(state_dir.join("caches.json"))
            .await
            .unwrap();

        let config = WorkerConfig {
            skip_waiting_on_install: false,
            ..config("studyhub-v4")
        };
        let (registration, _events) =
            Registration::new(config, store.clone(), network()).unwrap();
        let first = registration.register().await.unwrap();

        store.open("studyhub-v3").await.unwrap();
        let second = registration.register().await.unwrap();
        assert_eq!(second.state().await, ServiceWorkerState::Waiting);

        // Evicting the stale generation can no longer be persisted.
        std::fs::remove_dir_all(&state_dir).unwrap();
        assert!(registration.post_message(json!("skipWaiting")).await.is_err());

        assert_eq!(second.state().await, ServiceWorkerState::Redundant);
        assert_eq!(first.state().await, ServiceWorkerState::Active);
        assert!(registration.waiting().await.is_none());
        assert_eq!(
            registration.active().await.unwrap().id().await,
            first.id().await
        );

        let response = registration
            .fetch(Request::get_str("http://localhost/chris/").unwrap())
            .await
            .unwrap();
        assert!(response.from_cache);
    }

    #[tokio::test]
    async fn test_reregister_retires_previous_active() {
        let (registration, _events) =
            Registration::new(config("studyhub-v4"), CacheStore::new(), network()).unwrap();
        let first = registration.register().await.unwrap();
        let second = registration.register().await.unwrap();

        assert_eq!(first.state().await, ServiceWorkerState::Redundant);
        assert_eq!(second.state().await, ServiceWorkerState::Active);
        assert_eq!(registration.active().await.unwrap().id().await, second.id().await);
    }

    #[tokio::test]
    async fn test_click_focuses_open_app_window() {
        let (registration, _events) =
            Registration::new(config("studyhub-v4"), CacheStore::new(), network()).unwrap();
        let window = Client::window(Url::parse("http://localhost/chris/").unwrap());
        let window_id = window.id.clone();
        registration.clients().write().await.add(window);
        registration.register().await.unwrap();

        registration
            .post_message(json!({"type": "SHOW_NOTIFICATION", "title": "Quiz", "body": "Now"}))
            .await
            .unwrap();
        let outcome = registration
            .dispatch(IncomingEvent::NotificationClick {
                tag: "studyhub".to_string(),
            })
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            EventOutcome::Clicked(ClickOutcome::Focused { ref client_id }) if *client_id == window_id
        ));
        assert_eq!(registration.clients().read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_without_active_worker_goes_to_network() {
        let network = network();
        let (registration, _events) =
            Registration::new(config("studyhub-v4"), CacheStore::new(), network).unwrap();

        let response = registration
            .fetch(Request::get_str("http://localhost/chris/").unwrap())
            .await
            .unwrap();
        assert_eq!(response.text().unwrap(), "<html>shell</html>");
        assert!(registration.store().keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_messages_without_active_worker() {
        let (registration, _events) =
            Registration::new(config("studyhub-v4"), CacheStore::new(), network()).unwrap();
        assert!(matches!(
            registration.post_message(json!("skipWaiting")).await,
            Err(ServiceWorkerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unregister() {
        let (registration, _events) =
            Registration::new(config("studyhub-v4"), CacheStore::new(), network()).unwrap();
        let worker = registration.register().await.unwrap();

        registration.unregister().await;
        assert!(registration.active().await.is_none());
        assert_eq!(worker.state().await, ServiceWorkerState::Redundant);
    }
}
