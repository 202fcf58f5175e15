//! In-memory mesh: a hub of simulated nodes with loss, duplication,
//! reordering and latency.
//!
//! This is how the protocol is exercised end-to-end without a radio: the
//! unit tests, the loss-recovery tests and the `zmesh` simulation binary
//! all attach ports to one of these. The RNG is seeded so a failing run
//! can be replayed exactly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::core::port::{Destination, Inbound, LinkInfo, MeshPort, SendError};
use crate::core::session::NodeId;

/// Impairment model applied to every delivery.
#[derive(Debug, Clone)]
pub struct LinkProfile {
    /// Probability a frame is silently dropped.
    pub loss: f64,
    /// Probability a frame is delivered twice.
    pub duplicate: f64,
    /// Base one-way delay.
    pub delay_ms: u64,
    /// Extra random delay added per copy. Distinct jitter per frame is
    /// what produces reordering.
    pub jitter_ms: u64,
}

impl Default for LinkProfile {
    fn default() -> Self {
        Self {
            loss: 0.0,
            duplicate: 0.0,
            delay_ms: 10,
            jitter_ms: 20,
        }
    }
}

struct HubInner {
    nodes: HashMap<NodeId, mpsc::UnboundedSender<Inbound>>,
    profile: LinkProfile,
    rng: StdRng,
    /// When > 0, the next sends fail transiently (for retry-path tests).
    transient_failures: u32,
}

/// A simulated mesh shared by every attached port.
#[derive(Clone)]
pub struct MemoryMesh {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryMesh {
    pub fn new(profile: LinkProfile, seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                nodes: HashMap::new(),
                profile,
                rng: StdRng::seed_from_u64(seed),
                transient_failures: 0,
            })),
        }
    }

    /// Join the mesh under the given id.
    pub fn attach(&self, id: impl Into<String>) -> MemoryPort {
        let id = NodeId::new(id);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().nodes.insert(id.clone(), tx);
        MemoryPort {
            id,
            mesh: self.clone(),
            rx,
        }
    }

    /// Remove a node; its port's `recv` then drains and returns `None`.
    pub fn detach(&self, id: &NodeId) {
        self.inner.lock().unwrap().nodes.remove(id);
    }

    /// Make the next `n` sends from any port fail with a transient error.
    pub fn induce_transient_failures(&self, n: u32) {
        self.inner.lock().unwrap().transient_failures = n;
    }

    fn dispatch(&self, from: &NodeId, dest: &Destination, text: &str) -> Result<(), SendError> {
        // Decide fate and delay of every copy under the lock; deliver
        // outside it via timed tasks so copies interleave freely.
        let mut deliveries: Vec<(mpsc::UnboundedSender<Inbound>, Duration, Inbound)> = Vec::new();
        {
            let mut hub = self.inner.lock().unwrap();
            if hub.transient_failures > 0 {
                hub.transient_failures -= 1;
                return Err(SendError::Transient("radio busy".to_string()));
            }
            let profile = hub.profile.clone();
            let targets: Vec<(NodeId, mpsc::UnboundedSender<Inbound>)> = hub
                .nodes
                .iter()
                .filter(|(id, _)| match dest {
                    Destination::Node(node) => *id == node,
                    Destination::Broadcast => *id != from,
                })
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect();

            for (_, tx) in targets {
                if hub.rng.gen_bool(profile.loss.clamp(0.0, 1.0)) {
                    continue;
                }
                let copies = if hub.rng.gen_bool(profile.duplicate.clamp(0.0, 1.0)) {
                    2
                } else {
                    1
                };
                for _ in 0..copies {
                    let jitter = if profile.jitter_ms > 0 {
                        hub.rng.gen_range(0..=profile.jitter_ms)
                    } else {
                        0
                    };
                    let delay = Duration::from_millis(profile.delay_ms + jitter);
                    let inbound = Inbound {
                        origin: from.clone(),
                        text: text.to_string(),
                        link: LinkInfo {
                            snr: Some(hub.rng.gen_range(-12.0..8.0)),
                            rssi: Some(hub.rng.gen_range(-120..-60)),
                            hop_count: Some(0),
                        },
                    };
                    deliveries.push((tx.clone(), delay, inbound));
                }
            }
        }

        for (tx, delay, inbound) in deliveries {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(inbound);
            });
        }
        Ok(())
    }
}

/// One node's view of the simulated mesh.
pub struct MemoryPort {
    id: NodeId,
    mesh: MemoryMesh,
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl MeshPort for MemoryPort {
    fn local_id(&self) -> NodeId {
        self.id.clone()
    }

    async fn send(&mut self, dest: &Destination, text: &str) -> Result<(), SendError> {
        self.mesh.dispatch(&self.id, dest, text)
    }

    async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_profile() -> LinkProfile {
        LinkProfile {
            loss: 0.0,
            duplicate: 0.0,
            delay_ms: 1,
            jitter_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_unicast_reaches_only_target() {
        let mesh = MemoryMesh::new(quiet_profile(), 7);
        let mut a = mesh.attach("!a");
        let mut b = mesh.attach("!b");
        let mut c = mesh.attach("!c");

        a.send(&Destination::Node(NodeId::new("!b")), "P|1")
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_millis(200), b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.origin, NodeId::new("!a"));
        assert_eq!(got.text, "P|1");
        assert!(got.link.snr.is_some());

        let none = tokio::time::timeout(Duration::from_millis(50), c.recv()).await;
        assert!(none.is_err(), "unicast leaked to a third node");
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let mesh = MemoryMesh::new(quiet_profile(), 7);
        let mut a = mesh.attach("!a");
        let mut b = mesh.attach("!b");

        a.send(&Destination::Broadcast, "P|2").await.unwrap();

        let got = tokio::time::timeout(Duration::from_millis(200), b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.text, "P|2");

        let echo = tokio::time::timeout(Duration::from_millis(50), a.recv()).await;
        assert!(echo.is_err(), "broadcast echoed back to sender");
    }

    #[tokio::test]
    async fn test_total_loss_delivers_nothing() {
        let mut profile = quiet_profile();
        profile.loss = 1.0;
        let mesh = MemoryMesh::new(profile, 7);
        let mut a = mesh.attach("!a");
        let mut b = mesh.attach("!b");

        a.send(&Destination::Node(NodeId::new("!b")), "E|ab12cd34")
            .await
            .unwrap();
        let none = tokio::time::timeout(Duration::from_millis(80), b.recv()).await;
        assert!(none.is_err());
    }

    #[tokio::test]
    async fn test_induced_transient_failures() {
        let mesh = MemoryMesh::new(quiet_profile(), 7);
        let mut a = mesh.attach("!a");
        let _b = mesh.attach("!b");
        mesh.induce_transient_failures(1);

        let first = a.send(&Destination::Node(NodeId::new("!b")), "E|ab12cd34").await;
        assert!(matches!(first, Err(SendError::Transient(_))));
        let second = a.send(&Destination::Node(NodeId::new("!b")), "E|ab12cd34").await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_detach_closes_stream() {
        let mesh = MemoryMesh::new(quiet_profile(), 7);
        let mut a = mesh.attach("!a");
        mesh.detach(&NodeId::new("!a"));
        assert!(a.recv().await.is_none());
    }
}
