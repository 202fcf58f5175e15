//! Node registry: every peer ever heard on the mesh.
//!
//! Any inbound frame updates the origin's record with the link metadata
//! that came with it; PONG replies additionally teach us display names.
//! Records are never deleted, only flagged inactive once nothing has been
//! heard inside the active window. The registry also decides when the
//! next discovery PING broadcast is due.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::core::config::Config;
use crate::core::events::Event;
use crate::core::port::LinkInfo;
use crate::core::session::NodeId;

/// What we know about one peer.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: NodeId,
    pub display_name: Option<String>,
    pub last_heard_at: Instant,
    pub last_snr: Option<f64>,
    pub last_rssi: Option<i32>,
}

pub struct NodeRegistry {
    nodes: HashMap<NodeId, NodeRecord>,
    snr_threshold: f64,
    active_window: Duration,
    discovery_interval: Duration,
    next_discovery_at: Option<Instant>,
}

impl NodeRegistry {
    pub fn new(cfg: &Config) -> Self {
        Self {
            nodes: HashMap::new(),
            snr_threshold: cfg.snr_event_threshold,
            active_window: cfg.node_active_window(),
            discovery_interval: cfg.discovery_interval(),
            next_discovery_at: None,
        }
    }

    /// Record that a frame arrived from `origin`. Returns a `NodeSeen`
    /// event for new nodes and for SNR moves past the threshold.
    pub fn observe(&mut self, origin: &NodeId, link: &LinkInfo, now: Instant) -> Option<Event> {
        match self.nodes.get_mut(origin) {
            Some(record) => {
                record.last_heard_at = now;
                if link.rssi.is_some() {
                    record.last_rssi = link.rssi;
                }
                let snr_jump = match (record.last_snr, link.snr) {
                    (Some(old), Some(new)) => (new - old).abs() > self.snr_threshold,
                    (None, Some(_)) => true,
                    _ => false,
                };
                if link.snr.is_some() {
                    record.last_snr = link.snr;
                }
                snr_jump.then(|| Event::NodeSeen {
                    id: origin.clone(),
                    name: record.display_name.clone(),
                    snr: record.last_snr,
                })
            }
            None => {
                debug!(event = "node_discovered", node = %origin, snr = ?link.snr, "New node observed");
                self.nodes.insert(
                    origin.clone(),
                    NodeRecord {
                        id: origin.clone(),
                        display_name: None,
                        last_heard_at: now,
                        last_snr: link.snr,
                        last_rssi: link.rssi,
                    },
                );
                Some(Event::NodeSeen {
                    id: origin.clone(),
                    name: None,
                    snr: link.snr,
                })
            }
        }
    }

    /// Attach a display name learned from a PONG. Emits `NodeSeen` when
    /// the name is new or changed. Call after `observe` so the record
    /// already exists.
    pub fn record_name(&mut self, id: &NodeId, name: &str) -> Option<Event> {
        let record = self.nodes.get_mut(id)?;
        if record.display_name.as_deref() == Some(name) {
            return None;
        }
        record.display_name = Some(name.to_string());
        Some(Event::NodeSeen {
            id: id.clone(),
            name: record.display_name.clone(),
            snr: record.last_snr,
        })
    }

    /// True if the node was heard inside the active window.
    pub fn is_active(&self, id: &NodeId, now: Instant) -> bool {
        self.nodes
            .get(id)
            .is_some_and(|r| now.duration_since(r.last_heard_at) <= self.active_window)
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn active_nodes(&self, now: Instant) -> Vec<&NodeRecord> {
        self.nodes
            .values()
            .filter(|r| now.duration_since(r.last_heard_at) <= self.active_window)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns true when a discovery PING should go out, and schedules
    /// the next one. The first call always fires so a fresh engine maps
    /// its surroundings immediately.
    pub fn discovery_due(&mut self, now: Instant) -> bool {
        match self.next_discovery_at {
            Some(at) if now < at => false,
            _ => {
                self.next_discovery_at = Some(now + self.discovery_interval);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(&Config::default())
    }

    fn link(snr: f64) -> LinkInfo {
        LinkInfo {
            snr: Some(snr),
            rssi: Some(-90),
            hop_count: Some(0),
        }
    }

    #[test]
    fn test_first_observation_emits_node_seen() {
        let mut reg = registry();
        let now = Instant::now();
        let id = NodeId::new("!cafe0001");
        let event = reg.observe(&id, &link(2.5), now);
        assert!(matches!(event, Some(Event::NodeSeen { .. })));
        assert_eq!(reg.len(), 1);

        // Same SNR again: no new announcement.
        let event = reg.observe(&id, &link(2.5), now + Duration::from_secs(5));
        assert!(event.is_none());
    }

    #[test]
    fn test_snr_jump_reannounces() {
        let mut reg = registry();
        let now = Instant::now();
        let id = NodeId::new("!cafe0001");
        reg.observe(&id, &link(0.0), now);

        // Below the 3 dB default threshold: silent.
        assert!(reg.observe(&id, &link(2.0), now).is_none());
        // Past it: announced.
        assert!(reg.observe(&id, &link(6.0), now).is_some());
    }

    #[test]
    fn test_name_recorded_once() {
        let mut reg = registry();
        let now = Instant::now();
        let id = NodeId::new("!cafe0001");
        reg.observe(&id, &link(1.0), now);

        assert!(reg.record_name(&id, "ridge repeater").is_some());
        assert!(reg.record_name(&id, "ridge repeater").is_none());
        assert_eq!(
            reg.get(&id).unwrap().display_name.as_deref(),
            Some("ridge repeater")
        );
    }

    #[test]
    fn test_active_window_flags_stale_nodes() {
        let mut reg = registry();
        let now = Instant::now();
        let id = NodeId::new("!cafe0001");
        reg.observe(&id, &link(1.0), now);

        assert!(reg.is_active(&id, now + Duration::from_secs(599)));
        assert!(!reg.is_active(&id, now + Duration::from_secs(601)));
        // Stale nodes are flagged, never evicted.
        assert_eq!(reg.len(), 1);
        assert!(reg.active_nodes(now + Duration::from_secs(601)).is_empty());
    }

    #[test]
    fn test_discovery_schedule() {
        let mut reg = registry();
        let now = Instant::now();
        assert!(reg.discovery_due(now), "first tick should ping");
        assert!(!reg.discovery_due(now + Duration::from_secs(30)));
        assert!(reg.discovery_due(now + Duration::from_secs(61)));
    }
}
