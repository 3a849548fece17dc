//! Telemetry context: owns the store, registry, and health tracker for
//! one running console and routes channel events between them. Views
//! talk to this object; nothing below it knows about selection.

use crate::channel::{ChannelEvent, ChannelState, ChannelTransport};
use crate::health::{raw_from_states, Connectivity, HealthTracker};
use crate::registry::StreamRegistry;
use crate::store::EventStore;
use log::{debug, warn};
use shared::ResourceId;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

pub struct TelemetryContext {
    pub store: EventStore,
    pub registry: StreamRegistry,
    pub health: HealthTracker,
}

impl TelemetryContext {
    /// Builds a context over the given transport. The returned receiver
    /// carries every channel event; the owning loop drains it and feeds
    /// each event to [`TelemetryContext::apply_event`].
    pub fn new(
        transport: Arc<dyn ChannelTransport + Send + Sync>,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = Self {
            store: EventStore::new(),
            registry: StreamRegistry::new(transport, events_tx),
            health: HealthTracker::new(),
        };
        (context, events_rx)
    }

    /// A view started looking at this resource.
    pub fn select(&mut self, resource: &ResourceId) {
        self.registry.subscribe(resource);
    }

    /// A view stopped looking. When the last view goes, the channels are
    /// closed synchronously and the stored telemetry is dropped, so a
    /// reselect starts clean under a fresh epoch.
    pub fn deselect(&mut self, resource: &ResourceId) {
        if self.registry.release(resource) {
            self.store.remove(resource);
            self.health.remove(resource);
        }
    }

    /// Routes one channel event. Payloads for resources no longer
    /// subscribed are dropped; they raced the teardown.
    pub fn apply_event(&mut self, event: ChannelEvent, now: Instant) {
        match event {
            ChannelEvent::Payload {
                resource,
                topic,
                payload,
            } => {
                if !self.registry.is_subscribed(&resource) {
                    debug!("Dropping late {} payload for {}", topic, resource);
                    return;
                }
                if let Err(e) = self.store.ingest(&resource, topic, payload) {
                    warn!("Rejected payload for {}: {}", resource, e);
                }
            }
            ChannelEvent::StateChanged {
                resource,
                topic,
                state,
            } => {
                self.registry.apply_state(&resource, topic, state);
                let raw = raw_from_states(&self.registry.channel_states(&resource));
                self.health.observe(&resource, raw, now);
            }
        }
    }

    /// Periodic flush of pending health transitions.
    pub fn tick(&mut self, now: Instant) {
        for resource in self.registry.subscribed_resources() {
            self.health.poll(&resource, now);
        }
    }

    pub fn connectivity(&self, resource: &ResourceId) -> Connectivity {
        self.health.connectivity(resource)
    }

    /// Convenience for transports that only report one channel.
    pub fn channel_state(
        &self,
        resource: &ResourceId,
        topic: shared::Topic,
    ) -> Option<ChannelState> {
        self.registry
            .channel_states(resource)
            .into_iter()
            .find(|(t, _)| *t == topic)
            .map(|(_, state)| state)
    }
}
