//! Engine: sole coordinator of all transfer and discovery logic.
//!
//! This is the single source of truth for:
//! - Session lifecycle, keyed by (peer, transfer id, direction)
//! - The one-active-session-per-peer-per-direction rule
//! - Routing of inbound frames to the right session
//! - Outbound duty-cycle rate limiting (token bucket over DATA frames)
//! - Node registry updates and discovery pings
//!
//! **Architecture rule**: no transfer logic may exist outside this module
//! and the sessions it owns. The engine is a pure state machine: inputs
//! are frames, commands and clock ticks; it returns encoded frames to
//! transmit and files to deliver, and publishes events on the bus. The
//! worker that owns the mesh port executes the outcome.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::core::codec::{CodecError, Frame};
use crate::core::config::{Config, ConfigError};
use crate::core::events::{Event, EventBus};
use crate::core::port::{Destination, Inbound};
use crate::core::registry::NodeRegistry;
use crate::core::session::receiver::ReceiverSession;
use crate::core::session::sender::SenderSession;
use crate::core::session::{AbortReason, FailReason, NodeId, StartError, TransferId};

// ── Token bucket ─────────────────────────────────────────────────────────────

/// Duty-cycle approximation: DATA frames may only leave when a token is
/// available. Control frames (ACK, NAK, BEGIN, END, FIN, ABT, discovery)
/// bypass the bucket; they are small and rare.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, rate_hz: f64, now: Instant) -> Self {
        Self {
            capacity: capacity.max(1) as f64,
            tokens: capacity.max(1) as f64,
            rate: rate_hz,
            last_refill: now,
        }
    }

    /// Take one token if available.
    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = (self.tokens + dt.as_secs_f64() * self.rate).min(self.capacity);
    }
}

// ── Outcome ──────────────────────────────────────────────────────────────────

/// A reassembled file ready for the sink. The engine completes the
/// receiver session only after `on_sink_result` reports back.
#[derive(Debug)]
pub struct Delivery {
    pub peer: NodeId,
    pub tid: TransferId,
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Side effects for the worker to execute: encoded frames (already
/// budget-checked) and sink deliveries.
#[derive(Debug, Default)]
pub struct EngineOutcome {
    pub frames: Vec<(Destination, String)>,
    pub deliveries: Vec<Delivery>,
}

impl EngineOutcome {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.deliveries.is_empty()
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

type SessionKey = (NodeId, TransferId);

/// How long a terminal session stays addressable, absorbing late frames
/// (stray ACKs, retried ENDs) without ill effect.
const LINGER: Duration = Duration::from_secs(30);

pub struct Engine {
    cfg: Config,
    local_id: NodeId,
    local_name: String,
    registry: NodeRegistry,
    senders: HashMap<SessionKey, SenderSession>,
    receivers: HashMap<SessionKey, ReceiverSession>,
    /// Terminal sessions and when to forget them.
    sender_expiry: HashMap<SessionKey, Instant>,
    receiver_expiry: HashMap<SessionKey, Instant>,
    bucket: TokenBucket,
    bus: EventBus,
}

impl Engine {
    pub fn new(
        cfg: Config,
        local_id: NodeId,
        local_name: impl Into<String>,
        bus: EventBus,
        now: Instant,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            registry: NodeRegistry::new(&cfg),
            bucket: TokenBucket::new(cfg.tx_burst, cfg.tx_rate_hz, now),
            cfg,
            local_id,
            local_name: local_name.into(),
            senders: HashMap::new(),
            receivers: HashMap::new(),
            sender_expiry: HashMap::new(),
            receiver_expiry: HashMap::new(),
            bus,
        })
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    // ── Commands ─────────────────────────────────────────────────────────

    /// Begin sending a file to a peer. At most one active outbound
    /// transfer per peer.
    pub fn start_transfer(
        &mut self,
        peer: NodeId,
        filename: &str,
        data: &[u8],
        now: Instant,
    ) -> Result<(TransferId, EngineOutcome), StartError> {
        let busy = self
            .senders
            .iter()
            .any(|((p, _), s)| *p == peer && !s.is_terminal());
        if busy {
            warn!(event = "start_rejected", peer = %peer, "Sender session already active for peer");
            return Err(StartError::PeerBusy);
        }

        let (session, output) = SenderSession::start(&self.cfg, peer.clone(), filename, data, now)?;
        let tid = session.tid().clone();
        let key = (peer.clone(), tid.clone());

        let mut outcome = EngineOutcome::default();
        self.emit(output.events);
        self.push_frames(&key, Destination::Node(peer), output.frames, &mut outcome);
        self.senders.insert(key, session);
        self.pump(now, &mut outcome);
        Ok((tid, outcome))
    }

    /// Abort every live session with the given peer.
    pub fn abort_peer(&mut self, peer: &NodeId, reason: AbortReason, now: Instant) -> EngineOutcome {
        let mut outcome = EngineOutcome::default();
        let sender_keys: Vec<SessionKey> = self
            .senders
            .iter()
            .filter(|((p, _), s)| p == peer && !s.is_terminal())
            .map(|(k, _)| k.clone())
            .collect();
        for key in sender_keys {
            if let Some(session) = self.senders.get_mut(&key) {
                let output = session.abort_local(reason.clone());
                self.emit(output.events);
                self.push_frames(&key, Destination::Node(key.0.clone()), output.frames, &mut outcome);
                self.sender_expiry.insert(key, now + LINGER);
            }
        }
        let receiver_keys: Vec<SessionKey> = self
            .receivers
            .iter()
            .filter(|((p, _), r)| p == peer && !r.is_terminal())
            .map(|(k, _)| k.clone())
            .collect();
        for key in receiver_keys {
            if let Some(session) = self.receivers.get_mut(&key) {
                let output = session.abort_local(reason.clone());
                self.emit(output.events);
                self.push_frames(&key, Destination::Node(key.0.clone()), output.frames, &mut outcome);
                self.receiver_expiry.insert(key, now + LINGER);
            }
        }
        outcome
    }

    /// Abort everything; called once on shutdown. ABT frames go out
    /// best-effort before the port closes.
    pub fn shutdown(&mut self, now: Instant) -> EngineOutcome {
        info!(
            event = "engine_shutdown",
            senders = self.senders.len(),
            receivers = self.receivers.len(),
            "Aborting all sessions for shutdown"
        );
        let peers: Vec<NodeId> = self
            .senders
            .keys()
            .map(|(p, _)| p.clone())
            .chain(self.receivers.keys().map(|(p, _)| p.clone()))
            .collect();
        let mut outcome = EngineOutcome::default();
        for peer in peers {
            let out = self.abort_peer(&peer, AbortReason::Shutdown, now);
            outcome.frames.extend(out.frames);
        }
        outcome
    }

    /// The device died underneath us: fail every session. No frames can
    /// be sent any more.
    pub fn device_failed(&mut self, now: Instant) {
        error!(event = "device_failed", "Mesh device failed fatally, failing all sessions");
        self.bus.publish(Event::LogLine {
            level: tracing::Level::ERROR,
            text: "mesh device failed, all transfers stopped".to_string(),
        });
        for (key, session) in self.senders.iter_mut() {
            if !session.is_terminal() {
                let out = session.handle_abort(AbortReason::Other("device".to_string()));
                for event in out.events {
                    // Rewrite the reason so observers see a device failure.
                    if let Event::TransferFailed { tid, peer, .. } = event {
                        self.bus.publish(Event::TransferFailed {
                            tid,
                            peer,
                            reason: FailReason::Device,
                        });
                    }
                }
                self.sender_expiry.insert(key.clone(), now);
            }
        }
        for (key, session) in self.receivers.iter_mut() {
            if !session.is_terminal() {
                let out = session.handle_abort(AbortReason::Other("device".to_string()));
                for event in out.events {
                    if let Event::TransferFailed { tid, peer, .. } = event {
                        self.bus.publish(Event::TransferFailed {
                            tid,
                            peer,
                            reason: FailReason::Device,
                        });
                    }
                }
                self.receiver_expiry.insert(key.clone(), now);
            }
        }
    }

    // ── Inbound frames ───────────────────────────────────────────────────

    pub fn handle_inbound(&mut self, inbound: &Inbound, now: Instant) -> EngineOutcome {
        let mut outcome = EngineOutcome::default();
        if let Some(event) = self.registry.observe(&inbound.origin, &inbound.link, now) {
            self.bus.publish(event);
        }

        let frame = match Frame::parse(&inbound.text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(event = "malformed_frame", origin = %inbound.origin, error = %err, "Dropping unparseable frame");
                return outcome;
            }
        };

        let origin = inbound.origin.clone();
        match frame {
            Frame::Ping { nonce } => {
                let pong = Frame::Pong {
                    nonce,
                    name: self.local_name.clone(),
                };
                self.push_control(Destination::Node(origin), pong, &mut outcome);
            }
            Frame::Pong { name, .. } => {
                if let Some(event) = self.registry.record_name(&origin, &name) {
                    self.bus.publish(event);
                }
            }
            Frame::Begin {
                tid,
                total,
                filename,
            } => self.on_begin(origin, tid, total, filename, now, &mut outcome),
            Frame::Data { tid, index, payload } => {
                self.on_data(origin, tid, index, payload, now, &mut outcome)
            }
            Frame::End { tid } => self.on_end(origin, tid, now, &mut outcome),
            Frame::Ack { tid, index } => {
                let key = (origin, tid);
                if let Some(session) = self.senders.get_mut(&key) {
                    let output = session.handle_ack(index, now);
                    self.finish_sender_io(&key, output, now, &mut outcome);
                } else {
                    debug!(event = "ack_unknown_tid", tid = %key.1, "ACK for unknown transfer ignored");
                }
            }
            Frame::Nak { tid, index } => {
                let key = (origin, tid);
                if let Some(session) = self.senders.get_mut(&key) {
                    let output = session.handle_nak(index, now);
                    self.finish_sender_io(&key, output, now, &mut outcome);
                } else {
                    debug!(event = "nak_unknown_tid", tid = %key.1, "NAK for unknown transfer ignored");
                }
            }
            Frame::Fin { tid, ok } => {
                let key = (origin, tid);
                if let Some(session) = self.senders.get_mut(&key) {
                    let output = session.handle_fin(ok, now);
                    self.finish_sender_io(&key, output, now, &mut outcome);
                } else {
                    debug!(event = "fin_unknown_tid", tid = %key.1, "FIN for unknown transfer ignored");
                }
            }
            Frame::Abort { tid, reason } => {
                let key = (origin, tid);
                if let Some(session) = self.receivers.get_mut(&key) {
                    let output = session.handle_abort(reason);
                    self.finish_receiver_io(&key, output, now, &mut outcome);
                } else if let Some(session) = self.senders.get_mut(&key) {
                    let output = session.handle_abort(reason);
                    self.finish_sender_io(&key, output, now, &mut outcome);
                } else {
                    debug!(event = "abt_unknown_tid", tid = %key.1, "ABT for unknown transfer ignored");
                }
            }
        }

        self.pump(now, &mut outcome);
        outcome
    }

    fn on_begin(
        &mut self,
        origin: NodeId,
        tid: TransferId,
        total: u16,
        filename: String,
        now: Instant,
        outcome: &mut EngineOutcome,
    ) {
        let key = (origin.clone(), tid.clone());
        if let Some(session) = self.receivers.get_mut(&key) {
            // Retransmitted BEGIN: our sentinel ACK was lost.
            let output = session.reack_begin(now);
            self.finish_receiver_io(&key, output, now, outcome);
            return;
        }
        let busy = self
            .receivers
            .iter()
            .any(|((p, _), r)| *p == origin && !r.is_terminal());
        if busy {
            warn!(event = "begin_rejected_busy", peer = %origin, tid = %tid, "Second inbound transfer from peer refused");
            self.push_control(
                Destination::Node(origin),
                Frame::Abort {
                    tid,
                    reason: AbortReason::Busy,
                },
                outcome,
            );
            return;
        }
        let (session, output) =
            ReceiverSession::accept(&self.cfg, origin.clone(), tid, total, filename, now);
        self.emit(output.events);
        self.push_frames(&key, Destination::Node(origin), output.frames, outcome);
        self.receivers.insert(key, session);
    }

    fn on_data(
        &mut self,
        origin: NodeId,
        tid: TransferId,
        index: u16,
        payload: Bytes,
        now: Instant,
        outcome: &mut EngineOutcome,
    ) {
        let key = (origin.clone(), tid.clone());
        match self.receivers.get_mut(&key) {
            Some(session) => {
                let output = session.handle_data(index, payload, now);
                self.finish_receiver_io(&key, output, now, outcome);
            }
            None => {
                // No session means BEGIN was never seen or the session is
                // long gone; tell the sender to stop.
                debug!(event = "data_unknown_tid", peer = %origin, tid = %tid, "DATA without session, aborting");
                self.push_control(
                    Destination::Node(origin),
                    Frame::Abort {
                        tid,
                        reason: AbortReason::Protocol,
                    },
                    outcome,
                );
            }
        }
    }

    fn on_end(
        &mut self,
        origin: NodeId,
        tid: TransferId,
        now: Instant,
        outcome: &mut EngineOutcome,
    ) {
        let key = (origin.clone(), tid.clone());
        match self.receivers.get_mut(&key) {
            Some(session) => {
                let output = session.handle_end(now);
                self.finish_receiver_io(&key, output, now, outcome);
            }
            None => {
                debug!(event = "end_unknown_tid", peer = %origin, tid = %tid, "END without session, aborting");
                self.push_control(
                    Destination::Node(origin),
                    Frame::Abort {
                        tid,
                        reason: AbortReason::Protocol,
                    },
                    outcome,
                );
            }
        }
    }

    /// Report of a sink delivery attempt; produces the FIN.
    pub fn on_sink_result(
        &mut self,
        peer: &NodeId,
        tid: &TransferId,
        ok: bool,
        now: Instant,
    ) -> EngineOutcome {
        let mut outcome = EngineOutcome::default();
        let key = (peer.clone(), tid.clone());
        if let Some(session) = self.receivers.get_mut(&key) {
            let output = session.on_sink_result(ok, now);
            self.finish_receiver_io(&key, output, now, &mut outcome);
        }
        outcome
    }

    // ── Clock ────────────────────────────────────────────────────────────

    /// Fixed-frequency tick: watchdogs, discovery, linger expiry, and the
    /// rate-limited DATA pump.
    pub fn tick(&mut self, now: Instant) -> EngineOutcome {
        let mut outcome = EngineOutcome::default();

        if self.registry.discovery_due(now) {
            let ping = Frame::Ping {
                nonce: rand::random::<u32>(),
            };
            self.push_control(Destination::Broadcast, ping, &mut outcome);
        }

        let sender_keys: Vec<SessionKey> = self.senders.keys().cloned().collect();
        for key in sender_keys {
            if let Some(output) = self.senders.get_mut(&key).map(|s| s.tick(now)) {
                self.finish_sender_io(&key, output, now, &mut outcome);
            }
        }
        let receiver_keys: Vec<SessionKey> = self.receivers.keys().cloned().collect();
        for key in receiver_keys {
            if let Some(output) = self.receivers.get_mut(&key).map(|r| r.tick(now)) {
                self.finish_receiver_io(&key, output, now, &mut outcome);
            }
        }

        self.sender_expiry.retain(|key, expiry| {
            if now >= *expiry {
                self.senders.remove(key);
                false
            } else {
                true
            }
        });
        self.receiver_expiry.retain(|key, expiry| {
            if now >= *expiry {
                self.receivers.remove(key);
                false
            } else {
                true
            }
        });

        self.pump(now, &mut outcome);
        outcome
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// Emit token-gated DATA frames, lowest session key first.
    fn pump(&mut self, now: Instant, outcome: &mut EngineOutcome) {
        let mut keys: Vec<SessionKey> = self
            .senders
            .iter()
            .filter(|(_, s)| s.wants_data())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        for key in keys {
            if !self.bucket.try_take(now) {
                break;
            }
            if let Some(output) = self
                .senders
                .get_mut(&key)
                .and_then(|s| s.next_data(now))
            {
                self.emit(output.events);
                self.push_frames(&key, Destination::Node(key.0.clone()), output.frames, outcome);
            }
        }
    }

    fn finish_sender_io(
        &mut self,
        key: &SessionKey,
        output: crate::core::session::sender::SenderOutput,
        now: Instant,
        outcome: &mut EngineOutcome,
    ) {
        self.emit(output.events);
        self.push_frames(key, Destination::Node(key.0.clone()), output.frames, outcome);
        if let Some(session) = self.senders.get(key) {
            if session.is_terminal() && !self.sender_expiry.contains_key(key) {
                self.sender_expiry.insert(key.clone(), now + LINGER);
            }
        }
    }

    fn finish_receiver_io(
        &mut self,
        key: &SessionKey,
        output: crate::core::session::receiver::ReceiverOutput,
        now: Instant,
        outcome: &mut EngineOutcome,
    ) {
        self.emit(output.events);
        if let Some(bytes) = output.delivery {
            if let Some(session) = self.receivers.get(key) {
                outcome.deliveries.push(Delivery {
                    peer: key.0.clone(),
                    tid: key.1.clone(),
                    filename: session.filename().to_string(),
                    bytes,
                });
            }
        }
        self.push_frames(key, Destination::Node(key.0.clone()), output.frames, outcome);
        if let Some(session) = self.receivers.get(key) {
            if session.is_terminal() && !self.receiver_expiry.contains_key(key) {
                self.receiver_expiry.insert(key.clone(), now + LINGER);
            }
        }
    }

    fn emit(&self, events: Vec<Event>) {
        for event in events {
            self.bus.publish(event);
        }
    }

    /// Encode and queue session frames. An encode failure is a
    /// programming error; it is logged and the frame dropped rather than
    /// poisoning the whole outcome.
    fn push_frames(
        &mut self,
        key: &SessionKey,
        dest: Destination,
        frames: Vec<Frame>,
        outcome: &mut EngineOutcome,
    ) {
        for frame in frames {
            match frame.encode() {
                Ok(text) => outcome.frames.push((dest.clone(), text)),
                Err(err) => self.encode_failed(key, &err),
            }
        }
    }

    fn push_control(&mut self, dest: Destination, frame: Frame, outcome: &mut EngineOutcome) {
        match frame.encode() {
            Ok(text) => outcome.frames.push((dest, text)),
            Err(err) => {
                error!(event = "control_encode_failed", error = %err, "Dropping unencodable control frame")
            }
        }
    }

    fn encode_failed(&mut self, key: &SessionKey, err: &CodecError) {
        error!(
            event = "frame_encode_failed",
            peer = %key.0,
            tid = %key.1,
            error = %err,
            "Frame exceeded budget, failing session"
        );
        self.bus.publish(Event::TransferFailed {
            tid: key.1.clone(),
            peer: key.0.clone(),
            reason: FailReason::Device,
        });
    }
}
