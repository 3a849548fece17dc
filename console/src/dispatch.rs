//! Command dispatch: one-shot request/response over the feed transport,
//! synthetic console echo records, and the epoch guard that keeps
//! completions for a torn-down resource from touching its recreated
//! state.

use crate::channel::PendingResponses;
use crate::store::EventStore;
use log::{debug, info, warn};
use shared::{
    now_ms, ConsoleRecord, LogLevel, Packet, RequestAction, ResourceId, ResponseBody,
    WirePayload, REQUEST_TIMEOUT_MS,
};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Why a one-shot request produced no usable response.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestError {
    /// No response within the request timeout.
    Timeout,
    /// The feed answered with an error message.
    Rejected(String),
    /// The transport shut down before the response arrived.
    TransportClosed,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Timeout => write!(f, "request timed out"),
            RequestError::Rejected(reason) => write!(f, "request rejected: {}", reason),
            RequestError::TransportClosed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for RequestError {}

/// Issues requests over the shared feed socket and pairs responses to
/// them by request id.
pub struct RequestClient {
    outbound: mpsc::UnboundedSender<Packet>,
    pending: PendingResponses,
    next_id: AtomicU32,
    timeout: Duration,
}

impl RequestClient {
    pub fn new(outbound: mpsc::UnboundedSender<Packet>, pending: PendingResponses) -> Self {
        Self {
            outbound,
            pending,
            next_id: AtomicU32::new(0),
            timeout: Duration::from_millis(REQUEST_TIMEOUT_MS),
        }
    }

    /// Timeout override for tests.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends one request and waits for its response or the timeout. A
    /// timed-out id is forgotten; a late response for it is dropped by
    /// the receiver.
    pub async fn request(
        &self,
        resource: &ResourceId,
        action: RequestAction,
    ) -> Result<ResponseBody, RequestError> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(request_id, tx);
        }

        let packet = Packet::Request {
            request_id,
            resource: resource.clone(),
            action,
        };
        if self.outbound.send(packet).is_err() {
            self.forget(request_id);
            return Err(RequestError::TransportClosed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(body))) => Ok(body),
            Ok(Ok(Err(reason))) => Err(RequestError::Rejected(reason)),
            Ok(Err(_)) => Err(RequestError::TransportClosed),
            Err(_) => {
                self.forget(request_id);
                Err(RequestError::Timeout)
            }
        }
    }

    fn forget(&self, request_id: u32) {
        let mut pending = self.pending.lock().unwrap();
        pending.remove(&request_id);
    }
}

/// A finished command, delivered back to the owning loop for
/// application against the store.
#[derive(Debug)]
pub struct CommandCompletion {
    pub resource: ResourceId,
    /// Store epoch captured at dispatch time.
    pub epoch: u64,
    pub action: RequestAction,
    pub result: Result<ResponseBody, RequestError>,
}

/// Fires commands without blocking the event loop. Each command runs on
/// its own task; the completion comes back through the channel given at
/// construction.
pub struct CommandDispatcher {
    client: Arc<RequestClient>,
    completions: mpsc::UnboundedSender<CommandCompletion>,
}

impl CommandDispatcher {
    pub fn new(
        client: Arc<RequestClient>,
        completions: mpsc::UnboundedSender<CommandCompletion>,
    ) -> Self {
        Self {
            client,
            completions,
        }
    }

    /// Sends a console command. The `> text` echo is synthesized when
    /// the feed confirms; a failure gets an error record instead, never
    /// both.
    pub fn send_command(&self, store: &mut EventStore, resource: &ResourceId, text: &str) {
        self.dispatch(
            store,
            resource,
            RequestAction::SendCommand {
                text: text.to_string(),
            },
        );
    }

    /// Fires any one-shot action, capturing the resource's current store
    /// epoch for the stale-completion guard.
    pub fn dispatch(&self, store: &mut EventStore, resource: &ResourceId, action: RequestAction) {
        let epoch = store.entry(resource).epoch;
        let client = Arc::clone(&self.client);
        let completions = self.completions.clone();
        let resource = resource.clone();

        tokio::spawn(async move {
            let result = client.request(&resource, action.clone()).await;
            let _ = completions.send(CommandCompletion {
                resource,
                epoch,
                action,
                result,
            });
        });
    }
}

/// Applies one completion to the store. Completions whose epoch no
/// longer matches the live entry are dropped whole; the resource was
/// torn down and recreated while the command was in flight. Returns
/// whether the completion was applied.
pub fn apply_completion(store: &mut EventStore, completion: CommandCompletion) -> bool {
    let live_epoch = match store.get(&completion.resource) {
        Some(entry) => entry.epoch,
        None => {
            debug!(
                "Dropping completion for removed resource {}",
                completion.resource
            );
            return false;
        }
    };
    if live_epoch != completion.epoch {
        debug!(
            "Dropping stale completion for {} (epoch {} != {})",
            completion.resource, completion.epoch, live_epoch
        );
        return false;
    }

    match completion.result {
        Ok(ResponseBody::Ok) => {
            if let RequestAction::SendCommand { text } = &completion.action {
                store.push_synthetic(
                    &completion.resource,
                    ConsoleRecord {
                        timestamp_ms: now_ms(),
                        level: LogLevel::Info,
                        text: format!("> {}", text),
                    },
                );
            }
            debug!("{:?} completed for {}", completion.action, completion.resource);
        }
        Ok(ResponseBody::Eula { accepted }) => {
            info!(
                "EULA status for {}: accepted={}",
                completion.resource, accepted
            );
        }
        Ok(ResponseBody::Backlog { lines }) => {
            // Backlog lines go through the same normalization as live ones
            if let Err(e) = store.ingest(
                &completion.resource,
                shared::Topic::Console,
                WirePayload::ConsoleLines(lines),
            ) {
                warn!("Backlog for {} rejected: {}", completion.resource, e);
            }
        }
        Ok(ResponseBody::State {
            players,
            metrics,
            health,
        }) => {
            let entry = store.entry(&completion.resource);
            entry.players.replace(players);
            if let Some(m) = metrics {
                entry.metrics.replace(shared::MetricsRecord {
                    ticks_per_second: m.ticks_per_second,
                    tick_p95_ms: m.tick_p95_ms,
                    heap_mb: m.heap_mb,
                    gpu_queue_ms: m.gpu_queue_ms,
                    players_online: m.players_online,
                });
            }
            if let Some(h) = health {
                entry.health.replace(h);
            }
        }
        Err(error) => {
            warn!(
                "{:?} failed for {}: {}",
                completion.action, completion.resource, error
            );
            store.push_synthetic(
                &completion.resource,
                ConsoleRecord {
                    timestamp_ms: now_ms(),
                    level: LogLevel::Error,
                    text: format!("command failed: {}", error),
                },
            );
        }
    }
    true
}
