//! Stream registry: reference-counted table of open channels per
//! resource. Subscribing is idempotent; the last release tears all of a
//! resource's channels down synchronously.

use crate::channel::{ChannelEvent, ChannelHandle, ChannelState, ChannelTransport};
use log::{debug, info, warn};
use shared::{ResourceId, Topic};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

struct RegistryEntry {
    refs: usize,
    channels: HashMap<Topic, ChannelHandle>,
}

/// Owns every open channel. All views of one resource share the same
/// six channels; no (resource, topic) pair is ever opened twice.
pub struct StreamRegistry {
    transport: Arc<dyn ChannelTransport + Send + Sync>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    entries: HashMap<ResourceId, RegistryEntry>,
}

impl StreamRegistry {
    pub fn new(
        transport: Arc<dyn ChannelTransport + Send + Sync>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            transport,
            events,
            entries: HashMap::new(),
        }
    }

    /// Ensures channels exist for every topic of `resource` and takes a
    /// reference. Topics already Connecting or Open are left alone;
    /// Errored or Closed ones are retried. One topic failing to open
    /// never blocks the others.
    pub fn subscribe(&mut self, resource: &ResourceId) {
        let entry = self
            .entries
            .entry(resource.clone())
            .or_insert_with(|| RegistryEntry {
                refs: 0,
                channels: HashMap::new(),
            });
        entry.refs += 1;

        for topic in Topic::ALL {
            let needs_open = match entry.channels.get(&topic) {
                Some(handle) => matches!(
                    handle.state,
                    ChannelState::Errored | ChannelState::Closed
                ),
                None => true,
            };
            if !needs_open {
                continue;
            }

            // Close the stale handle before opening its replacement; a
            // later drop would unsubscribe the route the new channel
            // just claimed.
            if let Some(mut old) = entry.channels.remove(&topic) {
                old.close();
            }

            match self
                .transport
                .open_channel(resource, topic, self.events.clone())
            {
                Ok(handle) => {
                    entry.channels.insert(topic, handle);
                }
                Err(e) => {
                    warn!("Channel open failed for {}: {}", resource, e);
                    entry
                        .channels
                        .insert(topic, ChannelHandle::errored(resource.clone(), topic));
                }
            }
        }

        info!(
            "Subscribed to {} ({} reference(s))",
            resource, entry.refs
        );
    }

    /// Drops one reference. When the last reference goes, every channel
    /// for the resource is closed before this returns, so no further
    /// payloads for it will be routed. Returns true when torn down.
    pub fn release(&mut self, resource: &ResourceId) -> bool {
        let Some(entry) = self.entries.get_mut(resource) else {
            debug!("Release for unknown resource {}", resource);
            return false;
        };

        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return false;
        }

        // Dropping the entry drops each handle, which unsubscribes.
        self.entries.remove(resource);
        info!("Released last reference to {}, channels closed", resource);
        true
    }

    pub fn is_subscribed(&self, resource: &ResourceId) -> bool {
        self.entries.contains_key(resource)
    }

    /// Records a transport-reported state change on the stored handle.
    pub fn apply_state(&mut self, resource: &ResourceId, topic: Topic, state: ChannelState) {
        if let Some(entry) = self.entries.get_mut(resource) {
            if let Some(handle) = entry.channels.get_mut(&topic) {
                handle.state = state;
            }
        }
    }

    /// Current state of each channel for a resource, for health
    /// aggregation. Empty if the resource is not subscribed.
    pub fn channel_states(&self, resource: &ResourceId) -> Vec<(Topic, ChannelState)> {
        match self.entries.get(resource) {
            Some(entry) => entry
                .channels
                .iter()
                .map(|(topic, handle)| (*topic, handle.state))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn subscribed_resources(&self) -> Vec<ResourceId> {
        self.entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelOpenError;
    use shared::WirePayload;
    use std::sync::Mutex;

    /// Transport that records opens and closes instead of touching a
    /// socket.
    struct MockTransport {
        opened: Mutex<Vec<(ResourceId, Topic)>>,
        closed: Arc<Mutex<Vec<(ResourceId, Topic)>>>,
        fail_topic: Option<Topic>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                opened: Mutex::new(Vec::new()),
                closed: Arc::new(Mutex::new(Vec::new())),
                fail_topic: None,
            }
        }

        fn failing(topic: Topic) -> Self {
            Self {
                fail_topic: Some(topic),
                ..Self::new()
            }
        }

        fn open_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }
    }

    impl ChannelTransport for MockTransport {
        fn open_channel(
            &self,
            resource: &ResourceId,
            topic: Topic,
            _events: mpsc::UnboundedSender<ChannelEvent>,
        ) -> Result<ChannelHandle, ChannelOpenError> {
            if self.fail_topic == Some(topic) {
                return Err(ChannelOpenError {
                    topic,
                    reason: "mock failure".to_string(),
                });
            }
            self.opened
                .lock()
                .unwrap()
                .push((resource.clone(), topic));

            let closed = Arc::clone(&self.closed);
            let close_key = (resource.clone(), topic);
            Ok(ChannelHandle::new(resource.clone(), topic, move || {
                closed.lock().unwrap().push(close_key);
            }))
        }
    }

    fn registry_with(
        transport: Arc<MockTransport>,
    ) -> (StreamRegistry, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamRegistry::new(transport, tx), rx)
    }

    #[test]
    fn test_subscribe_opens_all_topics() {
        let transport = Arc::new(MockTransport::new());
        let (mut registry, _rx) = registry_with(Arc::clone(&transport));

        registry.subscribe(&ResourceId::from("srv-1"));

        assert_eq!(transport.open_count(), Topic::ALL.len());
        assert!(registry.is_subscribed(&ResourceId::from("srv-1")));
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let (mut registry, _rx) = registry_with(Arc::clone(&transport));
        let resource = ResourceId::from("srv-1");

        registry.subscribe(&resource);
        registry.subscribe(&resource);

        // Second subscribe only bumps the refcount
        assert_eq!(transport.open_count(), Topic::ALL.len());

        // First release keeps channels alive, second tears down
        assert!(!registry.release(&resource));
        assert!(registry.is_subscribed(&resource));
        assert!(registry.release(&resource));
        assert!(!registry.is_subscribed(&resource));
    }

    #[test]
    fn test_release_closes_every_channel() {
        let transport = Arc::new(MockTransport::new());
        let (mut registry, _rx) = registry_with(Arc::clone(&transport));
        let resource = ResourceId::from("srv-1");

        registry.subscribe(&resource);
        registry.release(&resource);

        assert_eq!(transport.closed.lock().unwrap().len(), Topic::ALL.len());
    }

    #[test]
    fn test_one_failing_topic_does_not_block_others() {
        let transport = Arc::new(MockTransport::failing(Topic::Metrics));
        let (mut registry, _rx) = registry_with(Arc::clone(&transport));
        let resource = ResourceId::from("srv-1");

        registry.subscribe(&resource);

        assert_eq!(transport.open_count(), Topic::ALL.len() - 1);
        let states = registry.channel_states(&resource);
        assert_eq!(states.len(), Topic::ALL.len());
        let metrics_state = states
            .iter()
            .find(|(topic, _)| *topic == Topic::Metrics)
            .unwrap()
            .1;
        assert_eq!(metrics_state, ChannelState::Errored);
    }

    #[test]
    fn test_resubscribe_retries_errored_topic() {
        let transport = Arc::new(MockTransport::failing(Topic::Metrics));
        let (mut registry, _rx) = registry_with(Arc::clone(&transport));
        let resource = ResourceId::from("srv-1");

        registry.subscribe(&resource);
        let opens_before = transport.open_count();

        // Healthy channels are left alone; only the errored one retries.
        // The mock still fails it, so the count stays put and the state
        // stays Errored.
        registry.subscribe(&resource);
        assert_eq!(transport.open_count(), opens_before);

        registry.apply_state(&resource, Topic::Console, ChannelState::Open);
        registry.subscribe(&resource);
        assert_eq!(transport.open_count(), opens_before);
    }

    /// Transport that routes delivered payloads through a live route
    /// map the way the UDP transport does, so teardown ordering bugs
    /// show up as lost deliveries.
    struct RoutedTransport {
        routes: Arc<Mutex<HashMap<(ResourceId, Topic), mpsc::UnboundedSender<ChannelEvent>>>>,
    }

    impl RoutedTransport {
        fn new() -> Self {
            Self {
                routes: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        fn deliver(&self, resource: &ResourceId, topic: Topic, payload: WirePayload) -> bool {
            let tx = {
                let routes = self.routes.lock().unwrap();
                routes.get(&(resource.clone(), topic)).cloned()
            };
            match tx {
                Some(tx) => tx
                    .send(ChannelEvent::Payload {
                        resource: resource.clone(),
                        topic,
                        payload,
                    })
                    .is_ok(),
                None => false,
            }
        }
    }

    impl ChannelTransport for RoutedTransport {
        fn open_channel(
            &self,
            resource: &ResourceId,
            topic: Topic,
            events: mpsc::UnboundedSender<ChannelEvent>,
        ) -> Result<ChannelHandle, ChannelOpenError> {
            {
                let mut routes = self.routes.lock().unwrap();
                routes.insert((resource.clone(), topic), events);
            }
            let routes = Arc::clone(&self.routes);
            let key = (resource.clone(), topic);
            Ok(ChannelHandle::new(resource.clone(), topic, move || {
                routes.lock().unwrap().remove(&key);
            }))
        }
    }

    #[test]
    fn test_resubscribe_after_errored_keeps_route_alive() {
        use shared::WireConsoleLine;
        let transport = Arc::new(RoutedTransport::new());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut registry = StreamRegistry::new(Arc::clone(&transport) as _, events_tx);
        let resource = ResourceId::from("srv-1");

        registry.subscribe(&resource);
        registry.apply_state(&resource, Topic::Console, ChannelState::Errored);
        registry.subscribe(&resource);

        // The replacement channel's route must survive the retry
        assert!(transport.deliver(
            &resource,
            Topic::Console,
            WirePayload::ConsoleLines(vec![WireConsoleLine {
                ts_ms: 1,
                level: "info".to_string(),
                text: "still here".to_string(),
            }]),
        ));

        let mut delivered = false;
        while let Ok(event) = events_rx.try_recv() {
            if matches!(event, ChannelEvent::Payload { .. }) {
                delivered = true;
            }
        }
        assert!(delivered);
    }

    #[test]
    fn test_release_unknown_resource_is_noop() {
        let transport = Arc::new(MockTransport::new());
        let (mut registry, _rx) = registry_with(transport);

        assert!(!registry.release(&ResourceId::from("ghost")));
    }
}
