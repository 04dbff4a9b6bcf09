//! Error-response listener.
//!
//! Each gateway connection gets one listener task reading its read side. The
//! gateway only ever writes on failure: a single six-byte error response,
//! followed by closing the connection. The listener publishes what it saw on
//! a bounded channel that the dispatcher polls without blocking, then exits.
//!
//! Stopping is a `watch` signal raised by [`ErrorListener::stop`] or by
//! dropping the handle, so a listener never outlives the batch that spawned
//! it.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::metrics::Metrics;
use crate::push::connection::GatewayReader;
use crate::push::frame::{ERROR_RESPONSE_SIZE, ErrorResponse};

/// What a listener observed before it stopped on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// The gateway rejected a notification; later ones on the connection were dropped.
    Rejected(ErrorResponse),
    /// The connection failed without a usable error response.
    Lost { reason: String },
}

/// Handle to a running listener task.
pub struct ErrorListener {
    connection_id: u64,
    stop: watch::Sender<bool>,
    events: mpsc::Receiver<GatewayEvent>,
    task: Option<JoinHandle<()>>,
}

/// Keeps the active-listener gauge honest however the task ends.
struct ActiveGuard(Option<Arc<Metrics>>);

impl ActiveGuard {
    fn new(metrics: Option<Arc<Metrics>>) -> Self {
        if let Some(ref m) = metrics {
            m.record_listener_started();
        }
        Self(metrics)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Some(ref m) = self.0 {
            m.record_listener_stopped();
        }
    }
}

impl ErrorListener {
    /// Spawn a listener reading `reader`.
    ///
    /// `poll_interval` is the pause between reads while the gateway stays
    /// silent after closing its side.
    pub fn spawn<S>(
        reader: GatewayReader<S>,
        poll_interval: Duration,
        metrics: Option<Arc<Metrics>>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection_id = reader.id();
        let (stop, stop_rx) = watch::channel(false);
        let (event_tx, events) = mpsc::channel(1);
        let guard = ActiveGuard::new(metrics);

        let task = tokio::spawn(async move {
            let _guard = guard;
            listen(reader, poll_interval, stop_rx, event_tx).await;
        });

        Self {
            connection_id,
            stop,
            events,
            task: Some(task),
        }
    }

    /// Connection this listener watches.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Take the published event, if any, without waiting.
    pub fn try_event(&mut self) -> Option<GatewayEvent> {
        self.events.try_recv().ok()
    }

    /// Ask the task to stop. Idempotent.
    pub fn stop(&self) {
        // Fails only when the task has already exited.
        let _ = self.stop.send(true);
    }

    /// Returns true once the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop the task and wait for it to exit.
    pub async fn join(mut self) {
        self.stop();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(connection_id = self.connection_id, error = %e, "Listener task failed");
        }
    }
}

impl Drop for ErrorListener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Listener task body.
async fn listen<S>(
    mut reader: GatewayReader<S>,
    poll_interval: Duration,
    mut stop: watch::Receiver<bool>,
    events: mpsc::Sender<GatewayEvent>,
) where
    S: AsyncRead + AsyncWrite,
{
    let connection_id = reader.id();
    let mut pending: Vec<u8> = Vec::with_capacity(ERROR_RESPONSE_SIZE);

    loop {
        if *stop.borrow() {
            break;
        }

        let read = tokio::select! {
            _ = stop.changed() => break,
            result = reader.read_blocking() => result,
        };

        match read {
            Ok(bytes) if bytes.is_empty() => {
                if !pending.is_empty() {
                    publish(
                        &events,
                        connection_id,
                        GatewayEvent::Lost {
                            reason: format!(
                                "connection closed after {} of {ERROR_RESPONSE_SIZE} response bytes",
                                pending.len()
                            ),
                        },
                    );
                    return;
                }

                trace!(connection_id, "Gateway silent, polling again");
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = sleep(poll_interval) => {}
                }
            }
            Ok(bytes) => {
                pending.extend_from_slice(&bytes);
                if pending.len() < ERROR_RESPONSE_SIZE {
                    continue;
                }

                let event = match ErrorResponse::decode(&pending) {
                    Ok(response) => {
                        debug!(
                            connection_id,
                            identifier = response.identifier,
                            status = %response.status,
                            "Gateway reported an error"
                        );
                        GatewayEvent::Rejected(response)
                    }
                    Err(e) => {
                        warn!(connection_id, error = %e, "Undecodable gateway response");
                        GatewayEvent::Lost {
                            reason: e.to_string(),
                        }
                    }
                };
                publish(&events, connection_id, event);
                return;
            }
            Err(e) => {
                if *stop.borrow() {
                    break;
                }
                publish(
                    &events,
                    connection_id,
                    GatewayEvent::Lost {
                        reason: e.to_string(),
                    },
                );
                return;
            }
        }
    }

    trace!(connection_id, "Listener stopped");
}

fn publish(events: &mpsc::Sender<GatewayEvent>, connection_id: u64, event: GatewayEvent) {
    if events.try_send(event).is_err() {
        // The dispatcher already retired this connection.
        trace!(connection_id, "Listener event discarded");
    }
}
