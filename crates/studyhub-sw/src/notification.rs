//! Notifications: descriptors built from push, in-app and background
//! messages, the set currently on display, and click handling.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use studyhub_core::WorkerConfig;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::clients::{ClientMatchOptions, ClientType, Clients};
use crate::{Result, ServiceWorkerError, ServiceWorkerEvent};

// ==================== Descriptor ====================

/// Everything the host needs to display a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDescriptor {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    /// Notifications sharing a tag replace each other.
    pub tag: String,
    /// Stay on screen until the user acts on it.
    pub require_interaction: bool,
    /// Vibration pattern in milliseconds.
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
}

/// Data carried by a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
    /// Page the notification refers to; always under the base path.
    pub url: String,
}

/// Which event produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationSource {
    /// Server push.
    Push,
    /// Requested by an application page.
    Message,
    /// Forwarded by the push SDK adapter.
    Background,
}

// ==================== Wire Formats ====================

/// Push payload, nested (`notification` / `data`) or flat.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub notification: Option<PushNotification>,
    #[serde(default)]
    pub data: Option<PushData>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct PushNotification {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct PushData {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl PushPayload {
    /// Parse a JSON payload.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| ServiceWorkerError::InvalidPayload(format!("push payload: {e}")))
    }

    /// Parse an already decoded JSON value.
    pub fn from_value(value: &JsonValue) -> Result<Self> {
        Self::deserialize(value)
            .map_err(|e| ServiceWorkerError::InvalidPayload(format!("message payload: {e}")))
    }

    fn title(&self) -> Option<String> {
        self.notification
            .as_ref()
            .and_then(|n| n.title.clone())
            .or_else(|| self.title.clone())
    }

    fn body(&self) -> Option<String> {
        self.notification
            .as_ref()
            .and_then(|n| n.body.clone())
            .or_else(|| self.body.clone())
    }

    fn tag(&self) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|d| d.tag.clone())
            .or_else(|| self.tag.clone())
    }

    fn url(&self) -> Option<String> {
        self.data.as_ref().and_then(|d| d.url.clone())
    }
}

/// Message posted to the worker by an application page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMessage {
    ShowNotification {
        title: String,
        body: String,
        tag: Option<String>,
    },
    SkipWaiting,
    /// Anything the worker does not understand; ignored.
    Unknown,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum TypedMessage {
    ShowNotification {
        title: String,
        body: String,
        #[serde(default)]
        tag: Option<String>,
    },
    SkipWaiting,
}

impl AppMessage {
    /// Decode a page message.
    ///
    /// Both the bare string `"skipWaiting"` and `{"type": "SKIP_WAITING"}`
    /// request skip-waiting. A recognised `type` with missing fields is an
    /// error; an unrecognised one is [`AppMessage::Unknown`].
    pub fn parse(value: &JsonValue) -> Result<Self> {
        match value {
            JsonValue::String(s) if s == "skipWaiting" => Ok(Self::SkipWaiting),
            JsonValue::Object(map) => match map.get("type").and_then(JsonValue::as_str) {
                Some("SHOW_NOTIFICATION" | "SKIP_WAITING") => {
                    let typed = TypedMessage::deserialize(value).map_err(|e| {
                        ServiceWorkerError::InvalidPayload(format!("app message: {e}"))
                    })?;
                    Ok(match typed {
                        TypedMessage::ShowNotification { title, body, tag } => {
                            Self::ShowNotification { title, body, tag }
                        }
                        TypedMessage::SkipWaiting => Self::SkipWaiting,
                    })
                }
                _ => Ok(Self::Unknown),
            },
            _ => Ok(Self::Unknown),
        }
    }
}

/// Result of handling a notification click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// An open application window was focused.
    Focused { client_id: String },
    /// No application window was open, so one was opened.
    Opened { client_id: String },
}

// ==================== Notification Center ====================

/// Notifications currently on display.
#[derive(Debug, Clone)]
pub struct NotificationCenter {
    shown: Arc<RwLock<Vec<NotificationDescriptor>>>,
    events: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl NotificationCenter {
    pub fn new(events: mpsc::UnboundedSender<ServiceWorkerEvent>) -> Self {
        Self {
            shown: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    /// Display a notification, replacing any with the same tag.
    pub async fn show(&self, descriptor: NotificationDescriptor) {
        {
            let mut shown = self.shown.write().await;
            shown.retain(|n| n.tag != descriptor.tag);
            shown.push(descriptor.clone());
        }
        info!(tag = %descriptor.tag, title = %descriptor.title, "Notification shown");
        let _ = self
            .events
            .send(ServiceWorkerEvent::NotificationShown(descriptor));
    }

    /// Close the notification with `tag`, returning it if it was on display.
    pub async fn close(&self, tag: &str) -> Option<NotificationDescriptor> {
        let closed = {
            let mut shown = self.shown.write().await;
            let index = shown.iter().position(|n| n.tag == tag);
            index.map(|i| shown.remove(i))
        };
        debug!(tag, known = closed.is_some(), "Notification closed");
        let _ = self.events.send(ServiceWorkerEvent::NotificationClosed {
            tag: tag.to_string(),
        });
        closed
    }

    /// Notifications on display, oldest first.
    pub async fn list(&self) -> Vec<NotificationDescriptor> {
        self.shown.read().await.clone()
    }
}

// ==================== Dispatcher ====================

/// Builds descriptors, hands them to the [`NotificationCenter`], and
/// resolves clicks to a window.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    config: Arc<WorkerConfig>,
    base_url: Url,
    center: NotificationCenter,
    clients: Arc<RwLock<Clients>>,
    events: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl NotificationDispatcher {
    pub fn new(
        config: Arc<WorkerConfig>,
        center: NotificationCenter,
        clients: Arc<RwLock<Clients>>,
        events: mpsc::UnboundedSender<ServiceWorkerEvent>,
    ) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url()?,
            config,
            center,
            clients,
            events,
        })
    }

    pub fn center(&self) -> &NotificationCenter {
        &self.center
    }

    /// Build a descriptor, filling gaps from the defaults for `source`.
    pub fn describe(&self, source: NotificationSource, payload: &PushPayload) -> NotificationDescriptor {
        let defaults = &self.config.notifications;
        let default_tag = match source {
            NotificationSource::Push => &defaults.push_tag,
            NotificationSource::Message => &defaults.message_tag,
            NotificationSource::Background => &defaults.background_tag,
        };

        NotificationDescriptor {
            title: payload.title().unwrap_or_else(|| defaults.title.clone()),
            body: payload.body().unwrap_or_else(|| defaults.body.clone()),
            icon: defaults.icon.clone(),
            badge: defaults.badge.clone(),
            tag: payload.tag().unwrap_or_else(|| default_tag.clone()),
            require_interaction: source != NotificationSource::Background,
            vibrate: defaults.vibrate.clone(),
            data: NotificationData {
                url: self.anchored_url(payload.url()),
            },
        }
    }

    /// Keep `url` only if it points into the application.
    fn anchored_url(&self, url: Option<String>) -> String {
        url.filter(|u| {
            self.base_url
                .join(u)
                .map(|resolved| self.config.is_app_url(&resolved))
                .unwrap_or(false)
        })
        .unwrap_or_else(|| self.config.base_path.clone())
    }

    /// Handle a push event. A push without data is ignored.
    pub async fn on_push(&self, data: Option<&[u8]>) -> Result<Option<NotificationDescriptor>> {
        let Some(raw) = data else {
            debug!("Push without payload ignored");
            return Ok(None);
        };
        let payload = PushPayload::parse(raw)?;
        let descriptor = self.describe(NotificationSource::Push, &payload);
        self.center.show(descriptor.clone()).await;
        Ok(Some(descriptor))
    }

    /// Handle a `SHOW_NOTIFICATION` request from a page.
    pub async fn on_show_request(
        &self,
        title: String,
        body: String,
        tag: Option<String>,
    ) -> NotificationDescriptor {
        let payload = PushPayload {
            title: Some(title),
            body: Some(body),
            tag,
            ..Default::default()
        };
        let descriptor = self.describe(NotificationSource::Message, &payload);
        self.center.show(descriptor.clone()).await;
        descriptor
    }

    /// Handle a message forwarded by the push SDK adapter.
    pub async fn on_background_message(&self, value: &JsonValue) -> Result<NotificationDescriptor> {
        let payload = PushPayload::from_value(value)?;
        let descriptor = self.describe(NotificationSource::Background, &payload);
        self.center.show(descriptor.clone()).await;
        Ok(descriptor)
    }

    /// Close the clicked notification and surface exactly one app window.
    pub async fn on_click(&self, tag: &str) -> Result<ClickOutcome> {
        self.center.close(tag).await;

        let mut clients = self.clients.write().await;
        let options = ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::Window,
            controller: None,
        };
        let existing = clients
            .match_all(&options)
            .into_iter()
            .find(|c| self.config.is_app_url(&c.url))
            .map(|c| c.id.clone());

        match existing {
            Some(client_id) => {
                clients.focus(&client_id)?;
                let _ = self.events.send(ServiceWorkerEvent::WindowFocused {
                    client_id: client_id.clone(),
                });
                Ok(ClickOutcome::Focused { client_id })
            }
            None => {
                let client = clients.open_window(self.base_url.clone());
                let _ = self.events.send(ServiceWorkerEvent::WindowOpened {
                    client_id: client.id.clone(),
                    url: client.url.to_string(),
                });
                Ok(ClickOutcome::Opened {
                    client_id: client.id,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Client;
    use serde_json::json;

    fn dispatcher() -> (
        NotificationDispatcher,
        Arc<RwLock<Clients>>,
        mpsc::UnboundedReceiver<ServiceWorkerEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let clients = Arc::new(RwLock::new(Clients::new()));
        let dispatcher = NotificationDispatcher::new(
            Arc::new(WorkerConfig::default()),
            NotificationCenter::new(tx.clone()),
            clients.clone(),
            tx,
        )
        .unwrap();
        (dispatcher, clients, rx)
    }

    #[tokio::test]
    async fn test_push_nested_payload() {
        let (dispatcher, _, _rx) = dispatcher();
        let raw = json!({"notification": {"title": "Reminder", "body": "Class soon"}}).to_string();

        let descriptor = dispatcher.on_push(Some(raw.as_bytes())).await.unwrap().unwrap();
        assert_eq!(descriptor.title, "Reminder");
        assert_eq!(descriptor.body, "Class soon");
        assert_eq!(descriptor.tag, "studyhub-push");
        assert!(descriptor.require_interaction);
        assert_eq!(descriptor.vibrate, vec![200, 100, 200]);
        assert_eq!(descriptor.data.url, "/chris/");
    }

    #[tokio::test]
    async fn test_push_defaults() {
        let (dispatcher, _, _rx) = dispatcher();
        let descriptor = dispatcher.on_push(Some(b"{}")).await.unwrap().unwrap();
        assert_eq!(descriptor.title, "StudyHub");
        assert_eq!(descriptor.body, "יש לך התראה חדשה");
        assert_eq!(descriptor.icon, "/chris/icons/icon-192.png");
    }

    #[tokio::test]
    async fn test_push_flat_payload_and_data() {
        let (dispatcher, _, _rx) = dispatcher();
        let raw = json!({
            "title": "Flat",
            "tag": "flat-tag",
            "data": {"tag": "nested-tag", "url": "/chris/lesson/4"}
        })
        .to_string();

        let descriptor = dispatcher.on_push(Some(raw.as_bytes())).await.unwrap().unwrap();
        assert_eq!(descriptor.title, "Flat");
        assert_eq!(descriptor.tag, "nested-tag");
        assert_eq!(descriptor.data.url, "/chris/lesson/4");
    }

    #[tokio::test]
    async fn test_push_foreign_url_is_reanchored() {
        let (dispatcher, _, _rx) = dispatcher();
        let raw = json!({"data": {"url": "https://elsewhere.test/phish"}}).to_string();
        let descriptor = dispatcher.on_push(Some(raw.as_bytes())).await.unwrap().unwrap();
        assert_eq!(descriptor.data.url, "/chris/");
    }

    #[tokio::test]
    async fn test_push_without_payload_is_noop() {
        let (dispatcher, _, mut rx) = dispatcher();
        assert!(dispatcher.on_push(None).await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
        assert!(dispatcher.center().list().await.is_empty());
    }

    #[tokio::test]
    async fn test_push_invalid_json() {
        let (dispatcher, _, _rx) = dispatcher();
        assert!(matches!(
            dispatcher.on_push(Some(b"not json")).await,
            Err(ServiceWorkerError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_show_request_uses_message_tag() {
        let (dispatcher, _, mut rx) = dispatcher();
        let descriptor = dispatcher
            .on_show_request("Quiz".to_string(), "Starts now".to_string(), None)
            .await;
        assert_eq!(descriptor.tag, "studyhub");
        assert!(matches!(
            rx.try_recv(),
            Ok(ServiceWorkerEvent::NotificationShown(d)) if d.title == "Quiz"
        ));
    }

    #[tokio::test]
    async fn test_background_message() {
        let (dispatcher, _, _rx) = dispatcher();
        let descriptor = dispatcher
            .on_background_message(&json!({"notification": {"body": "New grade"}}))
            .await
            .unwrap();
        assert_eq!(descriptor.title, "StudyHub");
        assert_eq!(descriptor.body, "New grade");
        assert_eq!(descriptor.tag, "studyhub-firebase");
        assert!(!descriptor.require_interaction);
    }

    #[tokio::test]
    async fn test_same_tag_replaces() {
        let (dispatcher, _, _rx) = dispatcher();
        dispatcher
            .on_show_request("One".to_string(), "a".to_string(), Some("t".to_string()))
            .await;
        dispatcher
            .on_show_request("Two".to_string(), "b".to_string(), Some("t".to_string()))
            .await;

        let shown = dispatcher.center().list().await;
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title, "Two");
    }

    #[tokio::test]
    async fn test_click_focuses_existing_window() {
        let (dispatcher, clients, _rx) = dispatcher();
        let existing = Client::window(Url::parse("http://localhost/chris/lesson/2").unwrap());
        let existing_id = existing.id.clone();
        clients.write().await.add(existing);

        dispatcher
            .on_show_request("Quiz".to_string(), "Now".to_string(), None)
            .await;
        let outcome = dispatcher.on_click("studyhub").await.unwrap();

        assert_eq!(
            outcome,
            ClickOutcome::Focused {
                client_id: existing_id.clone()
            }
        );
        let clients = clients.read().await;
        assert_eq!(clients.len(), 1);
        assert!(clients.get(&existing_id).unwrap().focused);
        assert!(dispatcher.center().list().await.is_empty());
    }

    #[tokio::test]
    async fn test_click_opens_window_when_none_in_app() {
        let (dispatcher, clients, mut rx) = dispatcher();
        clients
            .write()
            .await
            .add(Client::window(Url::parse("http://localhost/other/").unwrap()));

        let outcome = dispatcher.on_click("studyhub-push").await.unwrap();
        let ClickOutcome::Opened { client_id } = outcome else {
            panic!("expected a new window");
        };

        let clients = clients.read().await;
        assert_eq!(clients.len(), 2);
        assert_eq!(
            clients.get(&client_id).unwrap().url.as_str(),
            "http://localhost/chris/"
        );

        assert!(matches!(
            rx.try_recv(),
            Ok(ServiceWorkerEvent::NotificationClosed { .. })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(ServiceWorkerEvent::WindowOpened { .. })
        ));
    }

    #[test]
    fn test_parse_app_messages() {
        assert_eq!(
            AppMessage::parse(&json!("skipWaiting")).unwrap(),
            AppMessage::SkipWaiting
        );
        assert_eq!(
            AppMessage::parse(&json!({"type": "SKIP_WAITING"})).unwrap(),
            AppMessage::SkipWaiting
        );
        assert_eq!(
            AppMessage::parse(&json!({"type": "SHOW_NOTIFICATION", "title": "T", "body": "B"}))
                .unwrap(),
            AppMessage::ShowNotification {
                title: "T".to_string(),
                body: "B".to_string(),
                tag: None
            }
        );
        assert_eq!(
            AppMessage::parse(&json!({"type": "PING"})).unwrap(),
            AppMessage::Unknown
        );
        assert_eq!(AppMessage::parse(&json!(42)).unwrap(), AppMessage::Unknown);
        assert!(AppMessage::parse(&json!({"type": "SHOW_NOTIFICATION", "body": "B"})).is_err());
    }
}
