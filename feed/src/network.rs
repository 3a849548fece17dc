//! Feed network layer handling UDP communications and telemetry publishing

use crate::fleet::Fleet;
use crate::subscribers::SubscriberManager;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, ResourceId, Topic, WirePayload};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

/// Messages sent from network tasks to the main feed loop
#[derive(Debug)]
pub enum FeedMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    SubscriberTimeout {
        addr: SocketAddr,
    },
    #[allow(dead_code)]
    Shutdown,
}

/// Messages sent from the feed loop to the network sender task
#[derive(Debug)]
pub enum PublishMessage {
    Send {
        packet: Packet,
        addr: SocketAddr,
    },
    /// Fan a payload out to every subscriber of the channel.
    Publish {
        resource: ResourceId,
        topic: Topic,
        payload: WirePayload,
    },
}

/// Main feed server coordinating networking and the fleet simulation
pub struct FeedServer {
    socket: Arc<UdpSocket>,
    subscribers: Arc<RwLock<SubscriberManager>>,
    fleet: Fleet,
    emit_duration: Duration,

    feed_tx: mpsc::UnboundedSender<FeedMessage>,
    feed_rx: mpsc::UnboundedReceiver<FeedMessage>,
    publish_tx: mpsc::UnboundedSender<PublishMessage>,
    publish_rx: mpsc::UnboundedReceiver<PublishMessage>,
}

impl FeedServer {
    pub async fn new(
        addr: &str,
        emit_duration: Duration,
        max_subscribers: usize,
        fleet: Fleet,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Feed listening on {}", socket.local_addr()?);

        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();

        Ok(FeedServer {
            socket,
            subscribers: Arc::new(RwLock::new(SubscriberManager::new(max_subscribers))),
            fleet,
            emit_duration,
            feed_tx,
            feed_rx,
            publish_tx,
            publish_rx,
        })
    }

    /// Bound address, for tests that connect to an ephemeral port.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let feed_tx = self.feed_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if feed_tx
                                .send(FeedMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that drains the publish queue onto the socket
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let subscribers = Arc::clone(&self.subscribers);
        let mut publish_rx = std::mem::replace(&mut self.publish_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = publish_rx.recv().await {
                match message {
                    PublishMessage::Send { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    PublishMessage::Publish {
                        resource,
                        topic,
                        payload,
                    } => {
                        let addrs = {
                            let subscribers_guard = subscribers.read().await;
                            subscribers_guard.addrs_for(&resource, topic)
                        };
                        if addrs.is_empty() {
                            continue;
                        }

                        let packet = Packet::Payload {
                            resource,
                            topic,
                            payload,
                        };
                        for addr in addrs {
                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to publish to {}: {}", addr, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors subscriber timeouts
    fn spawn_timeout_checker(&self) {
        let subscribers = Arc::clone(&self.subscribers);
        let feed_tx = self.feed_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut subscribers_guard = subscribers.write().await;
                    subscribers_guard.check_timeouts()
                };

                for addr in timed_out {
                    if feed_tx.send(FeedMessage::SubscriberTimeout { addr }).is_err() {
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.publish_tx.send(PublishMessage::Send { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Processes one incoming packet
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Subscribe { resource, topic } => {
                if !self.fleet.contains(&resource) {
                    self.send_packet(
                        Packet::SubscribeError {
                            resource,
                            topic,
                            reason: "unknown resource".to_string(),
                        },
                        addr,
                    );
                    return;
                }

                let added = {
                    let mut subscribers = self.subscribers.write().await;
                    subscribers.subscribe(addr, resource.clone(), topic)
                };

                if added {
                    self.send_packet(Packet::SubscribeAck { resource, topic }, addr);
                } else {
                    self.send_packet(
                        Packet::SubscribeError {
                            resource,
                            topic,
                            reason: "feed at capacity".to_string(),
                        },
                        addr,
                    );
                }
            }

            Packet::Unsubscribe { resource, topic } => {
                let mut subscribers = self.subscribers.write().await;
                subscribers.unsubscribe(addr, &resource, topic);
            }

            Packet::Request {
                request_id,
                resource,
                action,
            } => {
                {
                    let mut subscribers = self.subscribers.write().await;
                    subscribers.touch(addr);
                }
                debug!("Request {} from {}: {:?}", request_id, addr, action);
                let result = self.fleet.handle_action(&resource, action);
                self.send_packet(Packet::Response { request_id, result }, addr);
            }

            Packet::Bye => {
                let mut subscribers = self.subscribers.write().await;
                subscribers.remove(&addr);
            }

            _ => {
                warn!("Unexpected packet type from {}", addr);
            }
        }
    }

    fn publish(&self, resource: ResourceId, topic: Topic, payload: WirePayload) {
        if let Err(e) = self.publish_tx.send(PublishMessage::Publish {
            resource,
            topic,
            payload,
        }) {
            error!("Failed to queue publish: {}", e);
        }
    }

    /// Main feed loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        let mut emit_interval = interval(self.emit_duration);
        let tick_ms = self.emit_duration.as_millis() as u64;

        info!("Feed started with {} resources", self.fleet.len());

        loop {
            tokio::select! {
                message = self.feed_rx.recv() => {
                    match message {
                        Some(FeedMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(FeedMessage::SubscriberTimeout { addr }) => {
                            debug!("Subscriber {} timed out", addr);
                        },
                        Some(FeedMessage::Shutdown) | None => {
                            info!("Feed shutting down");
                            break;
                        }
                    }
                },

                _ = emit_interval.tick() => {
                    let emissions = {
                        let mut rng = rand::thread_rng();
                        self.fleet.tick(&mut rng, tick_ms)
                    };
                    for (resource, payload) in emissions {
                        let topic = payload.topic();
                        self.publish(resource, topic, payload);
                    }
                },
            }
        }

        Ok(())
    }
}
