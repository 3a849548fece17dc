//! Subscriber management for the telemetry feed
//!
//! This module tracks which console endpoints are subscribed to which
//! (resource, topic) channels, including:
//! - Subscriber lifecycle (first subscribe, unsubscribe, bye, timeout)
//! - Per-address topic routes used for publish fan-out
//! - Activity tracking and automatic cleanup of silent endpoints

use log::info;
use shared::{ResourceId, Topic, SUBSCRIBER_TIMEOUT_SECS};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One console endpoint and the channels it is subscribed to.
#[derive(Debug)]
pub struct Subscriber {
    /// Network address for publishing payloads
    pub addr: SocketAddr,
    /// Last time we received any packet from this endpoint
    pub last_seen: Instant,
    /// Channels this endpoint receives
    pub routes: HashSet<(ResourceId, Topic)>,
}

impl Subscriber {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            last_seen: Instant::now(),
            routes: HashSet::new(),
        }
    }

    /// True when nothing has arrived from this endpoint within `timeout`.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Centralized subscriber roster with a capacity limit. Subscribing is
/// idempotent per (address, resource, topic); publishing asks this
/// manager which addresses want a given channel.
pub struct SubscriberManager {
    subscribers: HashMap<SocketAddr, Subscriber>,
    max_subscribers: usize,
}

impl SubscriberManager {
    pub fn new(max_subscribers: usize) -> Self {
        Self {
            subscribers: HashMap::new(),
            max_subscribers,
        }
    }

    /// Adds a route for the endpoint, creating the subscriber on first
    /// contact. Returns false when the roster is full and the address is
    /// unknown; an existing subscriber can always add routes.
    pub fn subscribe(&mut self, addr: SocketAddr, resource: ResourceId, topic: Topic) -> bool {
        if !self.subscribers.contains_key(&addr) {
            if self.subscribers.len() >= self.max_subscribers {
                return false;
            }
            info!("Subscriber connected from {}", addr);
            self.subscribers.insert(addr, Subscriber::new(addr));
        }

        let subscriber = self.subscribers.get_mut(&addr).unwrap();
        subscriber.last_seen = Instant::now();
        subscriber.routes.insert((resource, topic));
        true
    }

    /// Drops one route. The subscriber itself stays until it says bye or
    /// times out; an endpoint with zero routes is still alive.
    pub fn unsubscribe(&mut self, addr: SocketAddr, resource: &ResourceId, topic: Topic) {
        if let Some(subscriber) = self.subscribers.get_mut(&addr) {
            subscriber.last_seen = Instant::now();
            subscriber.routes.remove(&(resource.clone(), topic));
        }
    }

    /// Marks the endpoint as active without changing its routes.
    pub fn touch(&mut self, addr: SocketAddr) {
        if let Some(subscriber) = self.subscribers.get_mut(&addr) {
            subscriber.last_seen = Instant::now();
        }
    }

    /// Removes an endpoint and all its routes. Returns true if it was
    /// known.
    pub fn remove(&mut self, addr: &SocketAddr) -> bool {
        if self.subscribers.remove(addr).is_some() {
            info!("Subscriber {} disconnected", addr);
            true
        } else {
            false
        }
    }

    /// Addresses subscribed to one channel, for publish fan-out.
    pub fn addrs_for(&self, resource: &ResourceId, topic: Topic) -> Vec<SocketAddr> {
        let key = (resource.clone(), topic);
        self.subscribers
            .values()
            .filter(|s| s.routes.contains(&key))
            .map(|s| s.addr)
            .collect()
    }

    /// Checks for and removes endpoints that went silent. Returns the
    /// removed addresses.
    pub fn check_timeouts(&mut self) -> Vec<SocketAddr> {
        let timeout = Duration::from_secs(SUBSCRIBER_TIMEOUT_SECS);
        let timed_out: Vec<SocketAddr> = self
            .subscribers
            .values()
            .filter(|s| s.is_timed_out(timeout))
            .map(|s| s.addr)
            .collect();

        for addr in &timed_out {
            self.remove(addr);
        }

        timed_out
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
