//! Delivery dispatcher.
//!
//! Sends one payload to an ordered list of device tokens over the legacy
//! gateway and recovers from the gateway's delayed error reporting.
//!
//! # Resume Protocol
//!
//! Every notification's identifier is its index in the token list. The
//! gateway silently drops everything after a bad notification and only later
//! reports the bad identifier before closing the connection. When the
//! connection's listener publishes that report, the dispatcher retires the
//! connection and moves the cursor back to the notification after the
//! reported one; the next send opens a fresh connection. A connection lost
//! without a usable report is resent from its first notification.
//!
//! Connections are also rotated after `chunk_size` sends, and the batch waits
//! a grace period after the last notification so a trailing error is still
//! seen.
//!
//! Delivery is at-least-once: resends may duplicate notifications the gateway
//! already accepted.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::push::connection::{self, Connector, GatewayConnection};
use crate::push::frame::{check_payload_size, encode_notification};
use crate::push::listener::{ErrorListener, GatewayEvent};
use crate::push::retry::{RetryConfig, with_retry};

/// Default number of notifications sent on one connection before rotating.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Default wait for a trailing error response after the last notification.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Default listener poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Dispatch loop tuning.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Notifications sent on one connection before it is rotated.
    pub chunk_size: usize,
    /// Wait after the last notification for a trailing error response.
    pub grace_period: Duration,
    /// Listener pause between reads while the gateway is silent.
    pub poll_interval: Duration,
    /// Transport failure budget and backoff.
    pub retry: RetryConfig,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            grace_period: DEFAULT_GRACE_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryConfig::default(),
        }
    }
}

impl From<&DispatchConfig> for DispatchOptions {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            grace_period: Duration::from_millis(config.grace_period_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            retry: RetryConfig {
                max_retries: config.max_transport_retries,
                initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            },
        }
    }
}

impl DispatchOptions {
    /// Reject settings the dispatch loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidInput(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidInput(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One payload addressed to an ordered list of device tokens.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Hex device tokens; a token's index is its notification identifier.
    pub tokens: Vec<String>,
    /// Serialized payload shared by every notification.
    pub payload: Bytes,
    /// Expiry in epoch seconds, 0 for none.
    pub expiry: u32,
}

impl Batch {
    pub fn new(tokens: Vec<String>, payload: impl Into<Bytes>, expiry: u32) -> Self {
        Self {
            tokens,
            payload: payload.into(),
            expiry,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn validate(&self) -> Result<()> {
        check_payload_size(self.payload.len())?;
        if u32::try_from(self.tokens.len()).is_err() {
            return Err(Error::InvalidInput(format!(
                "batch of {} tokens exceeds the identifier range",
                self.tokens.len()
            )));
        }
        Ok(())
    }
}

/// Outcome of a completed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Frames written, resends included.
    pub frames_sent: u64,
    /// Indices skipped for malformed device tokens.
    pub skipped: BTreeSet<usize>,
    /// Error responses received from the gateway.
    pub gateway_errors: u64,
    /// Connections lost without a usable error response.
    pub connections_lost: u64,
    /// Failed connects and writes.
    pub transport_failures: u64,
    /// Connections opened.
    pub connections_opened: u64,
    /// Connections retired because they reached the chunk size.
    pub rotations: u64,
}

impl DispatchReport {
    /// Gateway errors plus lost connections.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.gateway_errors + self.connections_lost
    }
}

/// Runs batches against one gateway.
pub struct DeliveryDispatcher<C: Connector> {
    connector: C,
    options: DispatchOptions,
    metrics: Option<Arc<Metrics>>,
}

impl<C: Connector> DeliveryDispatcher<C> {
    /// Create a dispatcher, rejecting invalid options.
    pub fn new(connector: C, options: DispatchOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            connector,
            options,
            metrics: None,
        })
    }

    /// Record batch activity in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Deliver `batch`, returning once every notification has been sent or a
    /// transport failure exhausted the retry budget.
    ///
    /// All listeners are stopped and all connections closed before this
    /// returns. If the future is dropped early, listeners are stopped through
    /// their handles' `Drop`.
    pub async fn submit(&self, batch: &Batch) -> Result<DispatchReport> {
        batch.validate()?;

        let started = Instant::now();
        info!(
            notifications = batch.len(),
            endpoint = %self.connector.endpoint(),
            chunk_size = self.options.chunk_size,
            "Dispatching batch"
        );

        let mut session = Session::new(self, batch);
        let result = session.run().await;
        session.finish().await;

        let elapsed = started.elapsed();
        match result {
            Ok(()) => {
                let report = std::mem::take(&mut session.report);
                if let Some(ref m) = self.metrics {
                    m.record_batch("completed", elapsed.as_secs_f64());
                }
                info!(
                    frames_sent = report.frames_sent,
                    skipped = report.skipped.len(),
                    gateway_errors = report.gateway_errors,
                    connections_lost = report.connections_lost,
                    transport_failures = report.transport_failures,
                    connections_opened = report.connections_opened,
                    rotations = report.rotations,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Batch complete"
                );
                Ok(report)
            }
            Err(e) => {
                if let Some(ref m) = self.metrics {
                    m.record_batch("failed", elapsed.as_secs_f64());
                }
                error!(
                    error = %e,
                    cursor = session.cursor,
                    frames_sent = session.report.frames_sent,
                    "Batch aborted"
                );
                Err(e)
            }
        }
    }
}

/// The connection currently receiving frames.
struct ActiveConnection<S> {
    connection: GatewayConnection<S>,
    listener: ErrorListener,
    /// Identifier of the first notification this connection was opened for.
    first_identifier: usize,
    /// One past the last identifier written on this connection.
    next_identifier: usize,
    /// Frames written on this connection.
    chunk_count: usize,
}

/// State of one `submit` call.
struct Session<'a, C: Connector> {
    connector: &'a C,
    options: &'a DispatchOptions,
    metrics: Option<Arc<Metrics>>,
    batch: &'a Batch,
    cursor: usize,
    active: Option<ActiveConnection<C::Stream>>,
    /// Listeners of retired connections, joined when the batch ends.
    retired: Vec<ErrorListener>,
    next_connection_id: u64,
    /// Consecutive transport failures.
    failures: u32,
    /// Index a write must succeed at before the failure run ends.
    failure_at: usize,
    report: DispatchReport,
}

impl<'a, C: Connector> Session<'a, C> {
    fn new(dispatcher: &'a DeliveryDispatcher<C>, batch: &'a Batch) -> Self {
        Self {
            connector: &dispatcher.connector,
            options: &dispatcher.options,
            metrics: dispatcher.metrics.clone(),
            batch,
            cursor: 0,
            active: None,
            retired: Vec::new(),
            next_connection_id: 1,
            failures: 0,
            failure_at: 0,
            report: DispatchReport::default(),
        }
    }

    async fn run(&mut self) -> Result<()> {
        let total = self.batch.len();

        while self.cursor < total {
            if self.handle_pending_event().await? {
                continue;
            }

            let index = self.cursor;
            // Batch length was checked against the u32 range.
            let identifier = index as u32;

            let sent = match encode_notification(
                &self.batch.tokens[index],
                &self.batch.payload,
                identifier,
                self.batch.expiry,
            ) {
                Ok(frame) => {
                    if !self.send(index, &frame).await? {
                        continue;
                    }
                    true
                }
                Err(Error::TokenFormat(reason)) => {
                    warn!(index, reason = %reason, "Skipping notification with malformed device token");
                    if self.report.skipped.insert(index)
                        && let Some(ref m) = self.metrics
                    {
                        m.record_token_skipped();
                    }
                    false
                }
                Err(e) => return Err(e),
            };

            if index + 1 == total && self.active.is_some() {
                debug!(
                    grace_ms = self.options.grace_period.as_millis() as u64,
                    "Last notification sent, waiting for a trailing error"
                );
                sleep(self.options.grace_period).await;
                if self.handle_pending_event().await? {
                    continue;
                }
            }

            self.cursor = index + 1;

            let chunk_full = self
                .active
                .as_ref()
                .is_some_and(|active| active.chunk_count >= self.options.chunk_size);
            if sent
                && chunk_full
                && self.cursor < total
                && let Some(active) = self.active.take()
            {
                debug!(
                    connection_id = active.connection.id(),
                    cursor = self.cursor,
                    "Chunk complete, rotating connection"
                );
                self.report.rotations += 1;
                self.retire(active, "rotation").await;
            }
        }

        Ok(())
    }

    /// Apply an event published by the active connection's listener.
    ///
    /// Returns true when the cursor was moved. A lost connection counts
    /// against the transport budget until writes get past what it carried.
    async fn handle_pending_event(&mut self) -> Result<bool> {
        let Some(event) = self
            .active
            .as_mut()
            .and_then(|active| active.listener.try_event())
        else {
            return Ok(false);
        };
        let Some(active) = self.active.take() else {
            return Ok(false);
        };

        let resume = self.resume_point(&active, &event);
        let GatewayEvent::Lost { reason } = event else {
            self.retire(active, "rejected").await;
            self.cursor = resume;
            return Ok(true);
        };

        let connection_id = active.listener.connection_id();
        let lost_at = active.next_identifier.max(active.first_identifier + 1);
        self.retire(active, "lost").await;
        self.count_failure(lost_at);

        if self.failures > self.options.retry.max_retries {
            warn!(
                connection_id,
                failures = self.failures,
                "Transport failure budget exhausted"
            );
            return Err(Error::Connection(format!(
                "gateway connection lost {} times without progress: {reason}",
                self.failures
            )));
        }

        sleep(self.options.retry.backoff(self.failures)).await;
        self.cursor = resume;
        Ok(true)
    }

    fn count_failure(&mut self, failure_at: usize) {
        self.failures += 1;
        self.failure_at = self.failure_at.max(failure_at);
        self.report.transport_failures += 1;
        if let Some(ref m) = self.metrics {
            m.record_transport_failure();
        }
    }

    /// Where to continue after `event` on `active`, clamped to the
    /// identifiers that connection carried.
    fn resume_point(&mut self, active: &ActiveConnection<C::Stream>, event: &GatewayEvent) -> usize {
        let connection_id = active.connection.id();
        let requested = match event {
            GatewayEvent::Rejected(response) => {
                self.report.gateway_errors += 1;
                if let Some(ref m) = self.metrics {
                    m.record_gateway_error(response.status.as_str());
                }
                warn!(
                    connection_id,
                    identifier = response.identifier,
                    status = %response.status,
                    "Gateway rejected notification"
                );
                (response.identifier as usize).saturating_add(1)
            }
            GatewayEvent::Lost { reason } => {
                self.report.connections_lost += 1;
                if let Some(ref m) = self.metrics {
                    m.record_connection_lost();
                }
                warn!(
                    connection_id,
                    reason = %reason,
                    first_identifier = active.first_identifier,
                    "Gateway connection lost, resending its notifications"
                );
                active.first_identifier
            }
        };

        let resume = requested.clamp(active.first_identifier, active.next_identifier);
        if resume != requested {
            warn!(
                connection_id,
                requested,
                resume,
                "Resume point outside the identifiers sent on this connection"
            );
        }
        resume
    }

    /// Write one frame, opening a connection first if none is active.
    ///
    /// Returns false when the write failed and the cursor was moved back.
    async fn send(&mut self, index: usize, frame: &[u8]) -> Result<bool> {
        let active = match self.active.take() {
            Some(active) => active,
            None => self.open(index).await?,
        };
        let active = self.active.insert(active);

        match active.connection.write_frame(frame).await {
            Ok(()) => {
                active.next_identifier = index + 1;
                active.chunk_count += 1;
                self.report.frames_sent += 1;
                if let Some(ref m) = self.metrics {
                    m.record_frame_sent();
                }
                if self.failures > 0 && index >= self.failure_at {
                    debug!(index, failures = self.failures, "Gateway writes recovered");
                    self.failures = 0;
                    self.failure_at = 0;
                }
                Ok(true)
            }
            Err(e) => {
                self.write_failed(index, e).await?;
                Ok(false)
            }
        }
    }

    /// Handle a failed write: back off, then resume on a new connection.
    async fn write_failed(&mut self, index: usize, error: Error) -> Result<()> {
        self.count_failure(index);

        let Some(mut active) = self.active.take() else {
            return Err(error);
        };

        if self.failures > self.options.retry.max_retries {
            warn!(
                connection_id = active.connection.id(),
                index,
                failures = self.failures,
                error = %error,
                "Transport failure budget exhausted"
            );
            self.retire(active, "transport").await;
            return Err(error);
        }

        let backoff = self.options.retry.backoff(self.failures);
        warn!(
            connection_id = active.connection.id(),
            index,
            failures = self.failures,
            max_retries = self.options.retry.max_retries,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Gateway write failed, resuming on a new connection"
        );
        sleep(backoff).await;

        // The gateway usually reports the bad notification just before closing.
        let resume = match active.listener.try_event() {
            Some(event) => self.resume_point(&active, &event),
            None => active.first_identifier,
        };
        self.retire(active, "transport").await;
        self.cursor = resume;
        Ok(())
    }

    /// Open a connection for the notification at `index` and start its listener.
    async fn open(&mut self, index: usize) -> Result<ActiveConnection<C::Stream>> {
        let id = self.next_connection_id;
        self.next_connection_id += 1;

        let connector = self.connector;
        let metrics = self.metrics.clone();
        let failed = AtomicU64::new(0);
        let result = with_retry(&self.options.retry, "open gateway connection", || {
            let failed = &failed;
            let metrics = metrics.as_deref();
            async move {
                let opened = connection::open(connector, id).await;
                if opened.is_err() {
                    failed.fetch_add(1, Ordering::Relaxed);
                    if let Some(m) = metrics {
                        m.record_transport_failure();
                    }
                }
                opened
            }
        })
        .await;
        self.report.transport_failures += failed.load(Ordering::Relaxed);

        let (connection, reader) = result?;
        let listener = ErrorListener::spawn(reader, self.options.poll_interval, self.metrics.clone());

        self.report.connections_opened += 1;
        if let Some(ref m) = self.metrics {
            m.record_connection_opened();
        }
        debug!(connection_id = id, first_identifier = index, "Connection ready");

        Ok(ActiveConnection {
            connection,
            listener,
            first_identifier: index,
            next_identifier: index,
            chunk_count: 0,
        })
    }

    /// Stop the listener and close the connection; later events are discarded.
    async fn retire(&mut self, mut active: ActiveConnection<C::Stream>, reason: &'static str) {
        active.listener.stop();
        active.connection.close().await;
        if let Some(ref m) = self.metrics {
            m.record_connection_retired(reason);
        }
        debug!(
            connection_id = active.connection.id(),
            reason,
            frames = active.chunk_count,
            "Connection retired"
        );

        self.retired.retain(|listener| !listener.is_finished());
        self.retired.push(active.listener);
    }

    /// Retire the active connection and wait for every listener to exit.
    async fn finish(&mut self) {
        if let Some(active) = self.active.take() {
            self.retire(active, "complete").await;
        }
        for listener in std::mem::take(&mut self.retired) {
            listener.join().await;
        }
    }
}

impl<C: Connector> Drop for Session<'_, C> {
    fn drop(&mut self) {
        // Only reached with a live connection when `submit` was cancelled;
        // listener handles stop their tasks on drop.
        if self.active.take().is_some()
            && let Some(ref m) = self.metrics
        {
            m.record_connection_retired("cancelled");
        }
    }
}
