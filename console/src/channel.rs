//! Channel subscription transport: one logical live-update channel per
//! (resource, topic) pair, delivered over a shared UDP socket.

use crate::dispatch::RequestClient;
use bincode::{deserialize, serialize};
use log::{debug, error, warn};
use shared::{Packet, ResourceId, ResponseBody, Topic, WirePayload};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

/// Seconds between keepalive re-subscribes. Keeps the feed's subscriber
/// timeout at bay and re-establishes routes after a feed restart.
const KEEPALIVE_SECS: u64 = 2;

/// Lifecycle of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
    Errored,
}

/// Events a transport delivers to the owning loop.
#[derive(Debug)]
pub enum ChannelEvent {
    Payload {
        resource: ResourceId,
        topic: Topic,
        payload: WirePayload,
    },
    StateChanged {
        resource: ResourceId,
        topic: Topic,
        state: ChannelState,
    },
}

/// An open channel. Owned exclusively by the stream registry entry for
/// its resource; closing (or dropping) invokes the unsubscribe exactly
/// once.
pub struct ChannelHandle {
    pub resource: ResourceId,
    pub topic: Topic,
    pub state: ChannelState,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl ChannelHandle {
    pub fn new(
        resource: ResourceId,
        topic: Topic,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            resource,
            topic,
            state: ChannelState::Connecting,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Placeholder handle for a channel that failed to open. Carries the
    /// Errored state so health aggregation sees the failure; has nothing
    /// to unsubscribe.
    pub fn errored(resource: ResourceId, topic: Topic) -> Self {
        Self {
            resource,
            topic,
            state: ChannelState::Errored,
            unsubscribe: None,
        }
    }

    /// Synchronously unsubscribes the channel. Safe to call twice.
    pub fn close(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
        self.state = ChannelState::Closed;
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("resource", &self.resource)
            .field("topic", &self.topic)
            .field("state", &self.state)
            .finish()
    }
}

/// One topic's channel could not be established. Never fatal; the other
/// topics open independently.
#[derive(Debug)]
pub struct ChannelOpenError {
    pub topic: Topic,
    pub reason: String,
}

impl fmt::Display for ChannelOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to open {} channel: {}", self.topic, self.reason)
    }
}

impl std::error::Error for ChannelOpenError {}

/// The subscription collaborator contract. Implementations own the wire
/// transport; the core only sees handles and events.
pub trait ChannelTransport {
    fn open_channel(
        &self,
        resource: &ResourceId,
        topic: Topic,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<ChannelHandle, ChannelOpenError>;
}

/// In-flight one-shot requests awaiting a feed response, keyed by
/// request id. Shared between the receiver task and the request client.
pub type PendingResponses = Arc<Mutex<HashMap<u32, oneshot::Sender<Result<ResponseBody, String>>>>>;

type RouteMap = Arc<Mutex<HashMap<(ResourceId, Topic), mpsc::UnboundedSender<ChannelEvent>>>>;

/// UDP reference transport: one socket to the feed, a sender task
/// draining the outbound queue, and a receiver task demuxing packets to
/// subscribed routes.
pub struct UdpTransport {
    outbound: mpsc::UnboundedSender<Packet>,
    routes: RouteMap,
    pending: PendingResponses,
}

impl UdpTransport {
    pub async fn connect(feed_addr: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        socket.connect(feed_addr).await?;

        let (outbound, out_rx) = mpsc::unbounded_channel();
        let routes: RouteMap = Arc::new(Mutex::new(HashMap::new()));
        let pending: PendingResponses = Arc::new(Mutex::new(HashMap::new()));

        Self::spawn_sender(Arc::clone(&socket), out_rx);
        Self::spawn_receiver(
            Arc::clone(&socket),
            Arc::clone(&routes),
            Arc::clone(&pending),
            outbound.clone(),
        );
        Self::spawn_keepalive(Arc::clone(&routes), outbound.clone());

        Ok(Self {
            outbound,
            routes,
            pending,
        })
    }

    /// Request/response client sharing this transport's socket.
    pub fn request_client(&self) -> RequestClient {
        RequestClient::new(self.outbound.clone(), Arc::clone(&self.pending))
    }

    /// Spawns task that serializes and sends queued outbound packets.
    fn spawn_sender(socket: Arc<UdpSocket>, mut out_rx: mpsc::UnboundedReceiver<Packet>) {
        tokio::spawn(async move {
            while let Some(packet) = out_rx.recv().await {
                match serialize(&packet) {
                    Ok(data) => {
                        if let Err(e) = socket.send(&data).await {
                            error!("Failed to send packet to feed: {}", e);
                        }
                    }
                    Err(e) => error!("Failed to serialize outbound packet: {}", e),
                }
            }
        });
    }

    /// Spawns task that demuxes incoming packets to channel routes and
    /// pending requests. On socket failure every route is marked Errored,
    /// then re-subscribed, so the owning loop observes the
    /// Errored -> Connecting -> Open sequence.
    fn spawn_receiver(
        socket: Arc<UdpSocket>,
        routes: RouteMap,
        pending: PendingResponses,
        outbound: mpsc::UnboundedSender<Packet>,
    ) {
        tokio::spawn(async move {
            let mut buffer = [0u8; 8192];

            loop {
                match socket.recv(&mut buffer).await {
                    Ok(len) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            Self::handle_packet(packet, &routes, &pending);
                        } else {
                            warn!("Failed to deserialize packet from feed");
                        }
                    }
                    Err(e) => {
                        error!("Feed socket error: {}", e);
                        Self::broadcast_state(&routes, ChannelState::Errored);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Self::resubscribe_all(&routes, &outbound);
                    }
                }
            }
        });
    }

    /// Spawns task that periodically re-sends Subscribe for every live
    /// route. Subscribing is idempotent on the feed and doubles as the
    /// keepalive against its subscriber timeout.
    fn spawn_keepalive(routes: RouteMap, outbound: mpsc::UnboundedSender<Packet>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(KEEPALIVE_SECS));

            loop {
                interval.tick().await;

                let keys: Vec<(ResourceId, Topic)> = {
                    let routes = routes.lock().unwrap();
                    routes.keys().cloned().collect()
                };

                for (resource, topic) in keys {
                    if outbound
                        .send(Packet::Subscribe { resource, topic })
                        .is_err()
                    {
                        return;
                    }
                }
            }
        });
    }

    fn handle_packet(packet: Packet, routes: &RouteMap, pending: &PendingResponses) {
        match packet {
            Packet::SubscribeAck { resource, topic } => {
                Self::route_event(
                    routes,
                    &resource,
                    topic,
                    ChannelEvent::StateChanged {
                        resource: resource.clone(),
                        topic,
                        state: ChannelState::Open,
                    },
                );
            }
            Packet::SubscribeError {
                resource,
                topic,
                reason,
            } => {
                warn!("Feed rejected {} subscription for {}: {}", topic, resource, reason);
                Self::route_event(
                    routes,
                    &resource,
                    topic,
                    ChannelEvent::StateChanged {
                        resource: resource.clone(),
                        topic,
                        state: ChannelState::Errored,
                    },
                );
            }
            Packet::Payload {
                resource,
                topic,
                payload,
            } => {
                Self::route_event(
                    routes,
                    &resource,
                    topic,
                    ChannelEvent::Payload {
                        resource: resource.clone(),
                        topic,
                        payload,
                    },
                );
            }
            Packet::Response { request_id, result } => {
                let waiter = {
                    let mut pending = pending.lock().unwrap();
                    pending.remove(&request_id)
                };
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!("Dropping response for unknown request {}", request_id),
                }
            }
            other => {
                debug!("Ignoring unexpected packet from feed: {:?}", other);
            }
        }
    }

    fn route_event(routes: &RouteMap, resource: &ResourceId, topic: Topic, event: ChannelEvent) {
        let tx = {
            let routes = routes.lock().unwrap();
            routes.get(&(resource.clone(), topic)).cloned()
        };
        if let Some(tx) = tx {
            let _ = tx.send(event);
        } else {
            debug!("Dropping {} event for unsubscribed {}", topic, resource);
        }
    }

    fn broadcast_state(routes: &RouteMap, state: ChannelState) {
        let entries: Vec<((ResourceId, Topic), mpsc::UnboundedSender<ChannelEvent>)> = {
            let routes = routes.lock().unwrap();
            routes.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for ((resource, topic), tx) in entries {
            let _ = tx.send(ChannelEvent::StateChanged {
                resource,
                topic,
                state,
            });
        }
    }

    fn resubscribe_all(routes: &RouteMap, outbound: &mpsc::UnboundedSender<Packet>) {
        let entries: Vec<((ResourceId, Topic), mpsc::UnboundedSender<ChannelEvent>)> = {
            let routes = routes.lock().unwrap();
            routes.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for ((resource, topic), tx) in entries {
            let _ = tx.send(ChannelEvent::StateChanged {
                resource: resource.clone(),
                topic,
                state: ChannelState::Connecting,
            });
            let _ = outbound.send(Packet::Subscribe { resource, topic });
        }
    }
}

impl ChannelTransport for UdpTransport {
    fn open_channel(
        &self,
        resource: &ResourceId,
        topic: Topic,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<ChannelHandle, ChannelOpenError> {
        {
            let mut routes = self.routes.lock().unwrap();
            routes.insert((resource.clone(), topic), events.clone());
        }

        self.outbound
            .send(Packet::Subscribe {
                resource: resource.clone(),
                topic,
            })
            .map_err(|_| ChannelOpenError {
                topic,
                reason: "transport is shut down".to_string(),
            })?;

        let _ = events.send(ChannelEvent::StateChanged {
            resource: resource.clone(),
            topic,
            state: ChannelState::Connecting,
        });

        let routes = Arc::clone(&self.routes);
        let outbound = self.outbound.clone();
        let unsub_resource = resource.clone();
        Ok(ChannelHandle::new(
            resource.clone(),
            topic,
            move || {
                {
                    let mut routes = routes.lock().unwrap();
                    routes.remove(&(unsub_resource.clone(), topic));
                }
                let _ = outbound.send(Packet::Unsubscribe {
                    resource: unsub_resource,
                    topic,
                });
            },
        ))
    }
}
