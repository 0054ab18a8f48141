//! Poll fallback driver.
//!
//! Fetches the full record set on a fixed period and reports it as one
//! full-replace batch. Fetches are awaited inline, so ticks that fire while a
//! fetch is in flight are skipped rather than queued.

use std::{sync::Arc, time::Duration};

use metrics::counter;
use shared::models::{Record, Scope};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{Transport, TransportEvent, TransportKind, TransportSink};
use crate::{
    backend::{BackendResult, SharedBackend},
    errors::RealtimeError,
    store::MergeStore,
};

/// Periodic full-fetch transport.
pub struct PollTransport {
    backend: SharedBackend,
    store: Arc<MergeStore>,
    period: Duration,
    running: Option<CancellationToken>,
}

impl PollTransport {
    /// Driver fetching `store`'s scope every `period`.
    #[must_use]
    pub fn new(backend: SharedBackend, store: Arc<MergeStore>, period: Duration) -> Self {
        Self {
            backend,
            store,
            period,
            running: None,
        }
    }

    /// Fetch period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Transport for PollTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Poll
    }

    fn start(&mut self, sink: TransportSink) {
        self.stop();
        let cancel = CancellationToken::new();
        tokio::spawn(poll_loop(
            Arc::clone(&self.backend),
            Arc::clone(&self.store),
            self.period,
            sink,
            cancel.clone(),
        ));
        self.running = Some(cancel);
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.running.take() {
            cancel.cancel();
        }
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for PollTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(
    backend: SharedBackend,
    store: Arc<MergeStore>,
    period: Duration,
    sink: TransportSink,
    cancel: CancellationToken,
) {
    let scope = store.scope().clone();
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut consecutive_failures: u32 = 0;
    debug!(scope = %scope, epoch = sink.epoch(), ?period, "poll fallback started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let as_of = store.version();
        let fetched = tokio::select! {
            () = cancel.cancelled() => break,
            fetched = fetch(&backend, &scope) => fetched,
        };

        let event = match fetched {
            Ok(records) => {
                consecutive_failures = 0;
                TransportEvent::Snapshot { records, as_of }
            }
            Err(source) => {
                consecutive_failures += 1;
                counter!("souk_realtime_poll_failures_total").increment(1);
                let error = RealtimeError::FetchFailure {
                    scope: scope.clone(),
                    source,
                };
                warn!(consecutive_failures, error = %error, "poll fetch failed; retrying next tick");
                TransportEvent::FetchFailed {
                    error,
                    consecutive: consecutive_failures,
                }
            }
        };
        if !sink.emit(event) {
            break;
        }
    }
    debug!(scope = %scope, epoch = sink.epoch(), "poll fallback stopped");
}

#[instrument(name = "poll_fetch", skip_all, fields(scope = %scope))]
async fn fetch(backend: &SharedBackend, scope: &Scope) -> BackendResult<Vec<Record>> {
    backend.fetch_records(scope).await
}

impl std::fmt::Debug for PollTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollTransport")
            .field("scope", self.store.scope())
            .field("period", &self.period)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
