//! Subcommand implementations and the helpers they share.

pub mod completion;
pub mod config;
pub mod demo;
pub mod inbox;
pub mod receipts;
pub mod send;
pub mod watch;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Args;
use realtime::{HttpBackend, SharedBackend};
use shared::{
    config::client::Config,
    models::{NotificationEvent, Record},
};
use url::Url;

use crate::logging;

/// Connection options shared by every command that talks to the backend.
#[derive(Args, Debug, Clone)]
pub struct BackendArgs {
    /// Path to the configuration file (e.g., config.yaml or config.json)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Backend base URL; overrides the configuration file and `SOUK_BACKEND_URL`
    #[arg(long)]
    pub backend: Option<Url>,

    /// Access token of the signed-in user, sent as the bearer token
    #[arg(long)]
    pub token: Option<String>,
}

impl BackendArgs {
    /// Loads configuration, installs logging and builds the HTTP backend.
    ///
    /// # Errors
    /// Returns an error if the configuration cannot be loaded, tracing is
    /// already initialised, or the backend URL is invalid.
    pub fn prepare(&self) -> Result<(Config, SharedBackend)> {
        let config = Config::load_config(self.config.clone(), self.backend.clone())
            .context("failed to load configuration")?;
        logging::initialize_tracing(&config)?;

        let base = config.backend_url().context("invalid backend URL")?;
        let mut backend = HttpBackend::new(base, config.api_key.clone());
        if let Some(token) = &self.token {
            backend = backend.with_access_token(token.clone());
        }
        Ok((config, Arc::new(backend)))
    }
}

/// One-line rendering of a record for terminal output.
pub fn describe_record(record: &Record) -> String {
    let excerpt = record.excerpt(60);
    let read = if record.read { "read" } else { "unread" };
    format!(
        "{} [{}] from {} ({read}): {excerpt}",
        record.id, record.created_at, record.sender_id
    )
}

/// One-line rendering of a notification event.
pub fn describe_notification(event: &NotificationEvent) -> String {
    match event {
        NotificationEvent::Shown(notification) => format!(
            "new message from {}: {}",
            notification.sender_label(),
            notification.excerpt
        ),
        NotificationEvent::Enriched(notification) => format!(
            "sender of {} is {}",
            notification.source_record_id,
            notification.sender_label()
        ),
        NotificationEvent::Dismissed { id, reason } => {
            format!("notification {id} dismissed ({reason:?})")
        }
    }
}
