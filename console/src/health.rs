//! Connection health tracker: one debounced Connected/Disconnected
//! indicator per resource. Raw channel flaps shorter than the debounce
//! window never reach the published state.

use crate::channel::ChannelState;
use shared::{ResourceId, Topic, HEALTH_DEBOUNCE_MS};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Published connectivity of one resource's telemetry link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    Disconnected,
}

/// The telemetry link counts as up while any channel is Open. A single
/// errored topic does not flag the whole resource as down.
pub fn raw_from_states(states: &[(Topic, ChannelState)]) -> Connectivity {
    if states
        .iter()
        .any(|(_, state)| *state == ChannelState::Open)
    {
        Connectivity::Connected
    } else {
        Connectivity::Disconnected
    }
}

struct Tracker {
    published: Connectivity,
    candidate: Connectivity,
    candidate_since: Option<Instant>,
}

impl Tracker {
    fn new() -> Self {
        Self {
            published: Connectivity::Disconnected,
            candidate: Connectivity::Disconnected,
            candidate_since: None,
        }
    }
}

/// Debounces raw connectivity per resource. A transition publishes only
/// after the new state has held for the full window; both directions
/// debounce the same way, so brief disconnects and brief reconnects are
/// equally invisible.
pub struct HealthTracker {
    debounce: Duration,
    trackers: HashMap<ResourceId, Tracker>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::with_debounce(Duration::from_millis(HEALTH_DEBOUNCE_MS))
    }

    /// Window override for tests that should not sleep real time.
    pub fn with_debounce(debounce: Duration) -> Self {
        Self {
            debounce,
            trackers: HashMap::new(),
        }
    }

    /// Feeds one raw observation. `now` is explicit so callers drive
    /// time; nothing in here reads the clock.
    pub fn observe(&mut self, resource: &ResourceId, raw: Connectivity, now: Instant) {
        let tracker = self
            .trackers
            .entry(resource.clone())
            .or_insert_with(Tracker::new);

        if raw == tracker.published {
            // Flap returned to the published state before the window
            // elapsed; the pending transition is cancelled.
            tracker.candidate = raw;
            tracker.candidate_since = None;
        } else if tracker.candidate != raw || tracker.candidate_since.is_none() {
            tracker.candidate = raw;
            tracker.candidate_since = Some(now);
        }

        Self::flush(tracker, self.debounce, now);
    }

    /// Publishes any candidate whose window has elapsed and returns the
    /// current published state.
    pub fn poll(&mut self, resource: &ResourceId, now: Instant) -> Connectivity {
        match self.trackers.get_mut(resource) {
            Some(tracker) => {
                Self::flush(tracker, self.debounce, now);
                tracker.published
            }
            None => Connectivity::Disconnected,
        }
    }

    /// Published state without advancing time.
    pub fn connectivity(&self, resource: &ResourceId) -> Connectivity {
        self.trackers
            .get(resource)
            .map(|t| t.published)
            .unwrap_or(Connectivity::Disconnected)
    }

    pub fn remove(&mut self, resource: &ResourceId) {
        self.trackers.remove(resource);
    }

    fn flush(tracker: &mut Tracker, debounce: Duration, now: Instant) {
        if let Some(since) = tracker.candidate_since {
            if now.duration_since(since) >= debounce {
                tracker.published = tracker.candidate;
                tracker.candidate_since = None;
            }
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(300);

    fn tracker() -> HealthTracker {
        HealthTracker::with_debounce(WINDOW)
    }

    #[test]
    fn test_initial_state_is_disconnected() {
        let health = tracker();
        assert_eq!(
            health.connectivity(&ResourceId::from("srv-1")),
            Connectivity::Disconnected
        );
    }

    #[test]
    fn test_connect_publishes_after_window() {
        let mut health = tracker();
        let resource = ResourceId::from("srv-1");
        let t0 = Instant::now();

        health.observe(&resource, Connectivity::Connected, t0);
        assert_eq!(health.connectivity(&resource), Connectivity::Disconnected);

        assert_eq!(
            health.poll(&resource, t0 + WINDOW),
            Connectivity::Connected
        );
    }

    #[test]
    fn test_short_flap_never_publishes() {
        let mut health = tracker();
        let resource = ResourceId::from("srv-1");
        let t0 = Instant::now();

        health.observe(&resource, Connectivity::Connected, t0);
        health.poll(&resource, t0 + WINDOW);

        // Down for 100ms, then back up
        health.observe(
            &resource,
            Connectivity::Disconnected,
            t0 + WINDOW + Duration::from_millis(50),
        );
        health.observe(
            &resource,
            Connectivity::Connected,
            t0 + WINDOW + Duration::from_millis(150),
        );

        assert_eq!(
            health.poll(&resource, t0 + WINDOW + Duration::from_millis(600)),
            Connectivity::Connected
        );
    }

    #[test]
    fn test_sustained_disconnect_publishes() {
        let mut health = tracker();
        let resource = ResourceId::from("srv-1");
        let t0 = Instant::now();

        health.observe(&resource, Connectivity::Connected, t0);
        health.poll(&resource, t0 + WINDOW);

        let down_at = t0 + WINDOW + Duration::from_millis(10);
        health.observe(&resource, Connectivity::Disconnected, down_at);
        assert_eq!(health.connectivity(&resource), Connectivity::Connected);

        assert_eq!(
            health.poll(&resource, down_at + WINDOW),
            Connectivity::Disconnected
        );
    }

    #[test]
    fn test_flap_restarts_the_window() {
        let mut health = tracker();
        let resource = ResourceId::from("srv-1");
        let t0 = Instant::now();

        health.observe(&resource, Connectivity::Connected, t0);
        health.poll(&resource, t0 + WINDOW);

        // Down, briefly up, down again. The second down observation
        // restarts the window, so only 300ms after it does it publish.
        let base = t0 + WINDOW;
        health.observe(&resource, Connectivity::Disconnected, base);
        health.observe(
            &resource,
            Connectivity::Connected,
            base + Duration::from_millis(100),
        );
        health.observe(
            &resource,
            Connectivity::Disconnected,
            base + Duration::from_millis(200),
        );

        assert_eq!(
            health.poll(&resource, base + Duration::from_millis(400)),
            Connectivity::Connected
        );
        assert_eq!(
            health.poll(&resource, base + Duration::from_millis(500)),
            Connectivity::Disconnected
        );
    }

    #[test]
    fn test_raw_from_states() {
        assert_eq!(raw_from_states(&[]), Connectivity::Disconnected);
        assert_eq!(
            raw_from_states(&[
                (Topic::Console, ChannelState::Open),
                (Topic::Metrics, ChannelState::Errored),
            ]),
            Connectivity::Connected
        );
        assert_eq!(
            raw_from_states(&[
                (Topic::Console, ChannelState::Errored),
                (Topic::Metrics, ChannelState::Connecting),
            ]),
            Connectivity::Disconnected
        );
    }
}
