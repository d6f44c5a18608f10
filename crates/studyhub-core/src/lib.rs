//! StudyHub Core Library
//!
//! This crate provides the worker configuration and its error type.

pub mod config;
pub mod error;

pub use config::{NotificationDefaults, WorkerConfig};
pub use error::{ConfigError, ConfigResult};
