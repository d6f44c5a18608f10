//! # StudyHub Service Worker
//!
//! Offline caching and notification worker for the StudyHub web app.
//!
//! ## Features
//!
//! - **Lifecycle**: install primes the cache, activate evicts stale
//!   generations and claims open windows
//! - **Cache store**: named generations of request → response snapshots,
//!   optionally persisted to disk
//! - **Fetch interception**: stale-while-revalidate on hits, network with
//!   offline fallback on misses
//! - **Notifications**: push, in-app and background messages, click to
//!   focus or open the app window
//!
//! ## Architecture
//!
//! ```text
//! Registration (scope = base path)
//!     ├── installing / waiting / active (ServiceWorker)
//!     │       ├── Lifecycle           parsed → installing → waiting → activating → active
//!     │       ├── RequestRouter       GET + host exclusions
//!     │       ├── FetchStrategy       cache hit → revalidate, miss → network → fallback
//!     │       └── NotificationDispatcher
//!     │
//!     ├── CacheStore (shared)
//!     │       └── Cache (generation) └── Request → Response snapshot
//!     ├── Clients (shared)
//!     └── ServiceWorkerEvent channel → host
//! ```

use serde::Serialize;
use studyhub_core::ConfigError;
use studyhub_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod lifecycle;
pub mod notification;
pub mod registration;
pub mod strategy;
pub mod worker;

pub use cache::{CacheEntry, CacheHandle, CacheKey, CacheStore};
pub use clients::{Client, ClientMatchOptions, ClientType, Clients};
pub use lifecycle::{Lifecycle, ServiceWorkerId, ServiceWorkerState};
pub use notification::{
    AppMessage, ClickOutcome, NotificationCenter, NotificationDescriptor, NotificationDispatcher,
    NotificationSource, PushPayload,
};
pub use registration::Registration;
pub use strategy::{FetchStrategy, Served};
pub use worker::{EventOutcome, FetchOutcome, IncomingEvent, IncomingEventKind, ServiceWorker};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Precache failed for {url}: {reason}")]
    PrecacheFailed { url: String, reason: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<NetError> for ServiceWorkerError {
    fn from(err: NetError) -> Self {
        Self::NetworkError(err.to_string())
    }
}

impl From<ConfigError> for ServiceWorkerError {
    fn from(err: ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;

// ==================== Host Events ====================

/// Events the worker reports to its host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ServiceWorkerEvent {
    /// A worker changed lifecycle state.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A client is now controlled by a different worker.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
    /// A notification should be displayed.
    NotificationShown(NotificationDescriptor),
    /// A notification should be removed from the display.
    NotificationClosed { tag: String },
    /// An existing window should be brought to the front.
    WindowFocused { client_id: String },
    /// A new window should be opened.
    WindowOpened { client_id: String, url: String },
}
