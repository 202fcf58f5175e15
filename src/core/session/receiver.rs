//! Receiver side of a transfer: reassembly with ACK-per-chunk.
//!
//! Created on BEGIN, answered with the `-1` sentinel ACK. Every DATA is
//! acknowledged, duplicates included, because a repeated chunk means the
//! sender never saw our ACK. END either completes the transfer (bytes go
//! to the file sink, FIN reports the sink's verdict) or triggers a
//! bounded batch of NAKs for whatever is still missing.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::core::codec::Frame;
use crate::core::config::Config;
use crate::core::events::Event;
use crate::core::session::{AbortReason, Direction, FailReason, NodeId, TransferId};

/// Receiver lifecycle states.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverState {
    /// Accepting DATA frames.
    Receiving,
    /// All chunks held; reassembled bytes are with the file sink.
    Delivering,
    Completed,
    Failed(FailReason),
    Aborted(AbortReason),
}

/// Frames, events and (on END) reassembled bytes produced by one input.
#[derive(Debug, Default)]
pub struct ReceiverOutput {
    pub frames: Vec<Frame>,
    pub events: Vec<Event>,
    /// Present exactly once, when every chunk is in and END arrived.
    pub delivery: Option<Vec<u8>>,
}

pub struct ReceiverSession {
    tid: TransferId,
    peer: NodeId,
    filename: String,
    total: u16,
    /// Reassembly buffer: insertion order is arbitrary, read order is by
    /// ascending index.
    received: BTreeMap<u16, Bytes>,
    state: ReceiverState,
    payload_max: usize,
    idle_timeout: Duration,
    nak_batch_max: usize,
    last_activity_at: Instant,
    started_at: Instant,
}

impl ReceiverSession {
    /// Accept a BEGIN: create the session and answer with the sentinel ACK.
    pub fn accept(
        cfg: &Config,
        peer: NodeId,
        tid: TransferId,
        total: u16,
        filename: String,
        now: Instant,
    ) -> (Self, ReceiverOutput) {
        info!(
            event = "transfer_incoming",
            tid = %tid,
            peer = %peer,
            filename = %filename,
            total_chunks = total,
            "Inbound transfer accepted"
        );
        let session = Self {
            tid: tid.clone(),
            peer: peer.clone(),
            filename: filename.clone(),
            total,
            received: BTreeMap::new(),
            state: ReceiverState::Receiving,
            payload_max: cfg.chunk_payload_max,
            idle_timeout: cfg.recv_idle_timeout(),
            nak_batch_max: cfg.nak_batch_max,
            last_activity_at: now,
            started_at: now,
        };
        let output = ReceiverOutput {
            frames: vec![Frame::Ack {
                tid: tid.clone(),
                index: None,
            }],
            events: vec![Event::TransferStarted {
                tid,
                peer,
                direction: Direction::Receive,
                filename,
                total_chunks: total,
            }],
            delivery: None,
        };
        (session, output)
    }

    /// A retransmitted BEGIN for this session: repeat the sentinel ACK.
    pub fn reack_begin(&mut self, now: Instant) -> ReceiverOutput {
        let mut out = ReceiverOutput::default();
        if self.state == ReceiverState::Receiving {
            self.last_activity_at = now;
            out.frames.push(Frame::Ack {
                tid: self.tid.clone(),
                index: None,
            });
        }
        out
    }

    /// Store one chunk. Duplicates are re-acknowledged but not re-stored.
    pub fn handle_data(&mut self, index: u16, payload: Bytes, now: Instant) -> ReceiverOutput {
        let mut out = ReceiverOutput::default();
        if self.is_terminal() || self.state == ReceiverState::Delivering {
            return out;
        }
        if index >= self.total {
            warn!(event = "data_bad_index", tid = %self.tid, index, total = self.total, "Chunk index out of range");
            return self.abort_protocol(out);
        }
        if payload.is_empty() || payload.len() > self.payload_max {
            warn!(event = "data_bad_size", tid = %self.tid, index, size = payload.len(), "Chunk payload size out of range");
            return self.abort_protocol(out);
        }

        self.last_activity_at = now;
        if !self.received.contains_key(&index) {
            self.received.insert(index, payload);
            out.events.push(Event::Progress {
                tid: self.tid.clone(),
                done: self.received.len() as u16,
                total: self.total,
            });
        } else {
            debug!(event = "data_duplicate", tid = %self.tid, index, "Duplicate chunk re-acknowledged");
        }
        // ACK in all cases: a duplicate means our previous ACK was lost.
        out.frames.push(Frame::Ack {
            tid: self.tid.clone(),
            index: Some(index),
        });
        out
    }

    /// Sender says it is done. Either hand the reassembled bytes up, or
    /// ask for what is missing.
    pub fn handle_end(&mut self, now: Instant) -> ReceiverOutput {
        let mut out = ReceiverOutput::default();
        match self.state {
            ReceiverState::Receiving => {}
            // FIN was lost and the sender retried END: repeat the verdict.
            ReceiverState::Completed => {
                out.frames.push(Frame::Fin {
                    tid: self.tid.clone(),
                    ok: true,
                });
                return out;
            }
            _ => return out,
        }
        self.last_activity_at = now;

        if self.received.len() == self.total as usize {
            info!(event = "reassembly_complete", tid = %self.tid, chunks = self.total, "All chunks held, delivering");
            self.state = ReceiverState::Delivering;
            out.delivery = Some(self.reassemble());
            return out;
        }

        let missing: Vec<u16> = (0..self.total)
            .filter(|i| !self.received.contains_key(i))
            .take(self.nak_batch_max)
            .collect();
        debug!(
            event = "end_with_gaps",
            tid = %self.tid,
            held = self.received.len(),
            total = self.total,
            naks = missing.len(),
            "END before all chunks arrived, requesting retransmits"
        );
        for index in missing {
            out.frames.push(Frame::Nak {
                tid: self.tid.clone(),
                index,
            });
        }
        out
    }

    /// Report of the file sink's attempt to persist the delivery.
    pub fn on_sink_result(&mut self, ok: bool, _now: Instant) -> ReceiverOutput {
        let mut out = ReceiverOutput::default();
        if self.state != ReceiverState::Delivering {
            return out;
        }
        if ok {
            info!(
                event = "transfer_complete",
                tid = %self.tid,
                peer = %self.peer,
                filename = %self.filename,
                bytes = self.bytes_received(),
                "File delivered"
            );
            self.state = ReceiverState::Completed;
            out.frames.push(Frame::Fin {
                tid: self.tid.clone(),
                ok: true,
            });
            out.events.push(Event::TransferCompleted {
                tid: self.tid.clone(),
                peer: self.peer.clone(),
                filename: self.filename.clone(),
                bytes: self.bytes_received(),
            });
        } else {
            warn!(event = "sink_failed", tid = %self.tid, filename = %self.filename, "Sink could not persist file");
            self.state = ReceiverState::Failed(FailReason::SinkError);
            out.frames.push(Frame::Fin {
                tid: self.tid.clone(),
                ok: false,
            });
            out.events.push(Event::TransferFailed {
                tid: self.tid.clone(),
                peer: self.peer.clone(),
                reason: FailReason::SinkError,
            });
        }
        out
    }

    /// Handle an ABT from the peer.
    pub fn handle_abort(&mut self, reason: AbortReason) -> ReceiverOutput {
        let mut out = ReceiverOutput::default();
        if self.is_terminal() {
            return out;
        }
        warn!(event = "transfer_aborted_by_peer", tid = %self.tid, reason = %reason, "Peer aborted transfer");
        self.state = ReceiverState::Aborted(reason.clone());
        out.events.push(Event::TransferFailed {
            tid: self.tid.clone(),
            peer: self.peer.clone(),
            reason: FailReason::Aborted(reason),
        });
        out
    }

    /// Abort from this side (shutdown, operator).
    pub fn abort_local(&mut self, reason: AbortReason) -> ReceiverOutput {
        let mut out = ReceiverOutput::default();
        if self.is_terminal() {
            return out;
        }
        self.state = ReceiverState::Aborted(reason.clone());
        out.frames.push(Frame::Abort {
            tid: self.tid.clone(),
            reason: reason.clone(),
        });
        out.events.push(Event::TransferFailed {
            tid: self.tid.clone(),
            peer: self.peer.clone(),
            reason: FailReason::Aborted(reason),
        });
        out
    }

    /// Idle watchdog: a silent sender means the transfer is dead.
    pub fn tick(&mut self, now: Instant) -> ReceiverOutput {
        let mut out = ReceiverOutput::default();
        if self.state != ReceiverState::Receiving {
            return out;
        }
        if now.duration_since(self.last_activity_at) > self.idle_timeout {
            warn!(event = "recv_idle_timeout", tid = %self.tid, peer = %self.peer, "No activity from sender, aborting");
            self.state = ReceiverState::Failed(FailReason::IdleTimeout);
            out.frames.push(Frame::Abort {
                tid: self.tid.clone(),
                reason: AbortReason::IdleTimeout,
            });
            out.events.push(Event::TransferFailed {
                tid: self.tid.clone(),
                peer: self.peer.clone(),
                reason: FailReason::IdleTimeout,
            });
        }
        out
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn tid(&self) -> &TransferId {
        &self.tid
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn state(&self) -> &ReceiverState {
        &self.state
    }

    pub fn total_chunks(&self) -> u16 {
        self.total
    }

    pub fn received_count(&self) -> u16 {
        self.received.len() as u16
    }

    pub fn bytes_received(&self) -> usize {
        self.received.values().map(|c| c.len()).sum()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ReceiverState::Completed | ReceiverState::Failed(_) | ReceiverState::Aborted(_)
        )
    }

    fn reassemble(&self) -> Vec<u8> {
        // BTreeMap iteration is ascending by index, exactly the read order
        // the buffer promises.
        let mut bytes = Vec::with_capacity(self.bytes_received());
        for chunk in self.received.values() {
            bytes.extend_from_slice(chunk);
        }
        bytes
    }

    fn abort_protocol(&mut self, mut out: ReceiverOutput) -> ReceiverOutput {
        self.state = ReceiverState::Aborted(AbortReason::Protocol);
        out.frames.push(Frame::Abort {
            tid: self.tid.clone(),
            reason: AbortReason::Protocol,
        });
        out.events.push(Event::TransferFailed {
            tid: self.tid.clone(),
            peer: self.peer.clone(),
            reason: FailReason::Aborted(AbortReason::Protocol),
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(total: u16) -> (ReceiverSession, Instant) {
        let now = Instant::now();
        let (session, out) = ReceiverSession::accept(
            &Config::default(),
            NodeId::new("!feed0001"),
            TransferId::parse("ab12cd34").unwrap(),
            total,
            "file.bin".to_string(),
            now,
        );
        assert!(matches!(out.frames[0], Frame::Ack { index: None, .. }));
        (session, now)
    }

    fn chunk(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn test_in_order_reception_and_delivery() {
        let (mut r, now) = accept(3);
        for (idx, len) in [(0u16, 120), (1, 120), (2, 60)] {
            let out = r.handle_data(idx, chunk(len, idx as u8), now);
            assert!(matches!(out.frames[0], Frame::Ack { index: Some(i), .. } if i == idx));
        }
        let out = r.handle_end(now);
        let bytes = out.delivery.expect("delivery after complete END");
        assert_eq!(bytes.len(), 300);
        assert_eq!(*r.state(), ReceiverState::Delivering);

        let out = r.on_sink_result(true, now);
        assert!(matches!(out.frames[0], Frame::Fin { ok: true, .. }));
        assert_eq!(*r.state(), ReceiverState::Completed);
        assert!(out
            .events
            .iter()
            .any(|e| matches!(e, Event::TransferCompleted { bytes: 300, .. })));
    }

    #[test]
    fn test_out_of_order_and_duplicates_reassemble_identically() {
        let (mut r, now) = accept(3);
        let original: Vec<u8> = (0..300u32).map(|i| i as u8).collect();

        // Arrival order 2, 0, 2 (dup), 1 must not matter.
        r.handle_data(2, Bytes::copy_from_slice(&original[240..]), now);
        r.handle_data(0, Bytes::copy_from_slice(&original[..120]), now);
        let dup = r.handle_data(2, Bytes::copy_from_slice(&original[240..]), now);
        assert!(matches!(dup.frames[0], Frame::Ack { index: Some(2), .. }));
        assert!(dup.events.is_empty(), "duplicate must not advance progress");
        r.handle_data(1, Bytes::copy_from_slice(&original[120..240]), now);

        let out = r.handle_end(now);
        assert_eq!(out.delivery.unwrap(), original);
    }

    #[test]
    fn test_end_with_gaps_naks_missing_ascending() {
        let (mut r, now) = accept(5);
        r.handle_data(1, chunk(120, 1), now);
        r.handle_data(4, chunk(60, 4), now);

        let out = r.handle_end(now);
        assert!(out.delivery.is_none());
        assert_eq!(*r.state(), ReceiverState::Receiving);
        let naks: Vec<u16> = out
            .frames
            .iter()
            .map(|f| match f {
                Frame::Nak { index, .. } => *index,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(naks, vec![0, 2, 3]);
    }

    #[test]
    fn test_nak_batch_is_bounded() {
        let (mut r, now) = accept(100);
        let out = r.handle_end(now);
        assert_eq!(out.frames.len(), Config::default().nak_batch_max);
    }

    #[test]
    fn test_bad_index_aborts_with_protocol_error() {
        let (mut r, now) = accept(3);
        let out = r.handle_data(3, chunk(120, 0), now);
        assert!(matches!(
            out.frames[0],
            Frame::Abort {
                reason: AbortReason::Protocol,
                ..
            }
        ));
        assert!(r.is_terminal());
    }

    #[test]
    fn test_oversize_payload_aborts() {
        let (mut r, now) = accept(3);
        let out = r.handle_data(0, chunk(121, 0), now);
        assert!(matches!(out.frames[0], Frame::Abort { .. }));
        assert!(r.is_terminal());
    }

    #[test]
    fn test_idle_timeout_aborts() {
        let (mut r, now) = accept(3);
        r.handle_data(0, chunk(120, 0), now);

        // Quiet but inside the window: nothing happens.
        let out = r.tick(now + Duration::from_secs(119));
        assert!(out.frames.is_empty());

        let out = r.tick(now + Duration::from_secs(121));
        assert!(matches!(
            out.frames[0],
            Frame::Abort {
                reason: AbortReason::IdleTimeout,
                ..
            }
        ));
        assert_eq!(*r.state(), ReceiverState::Failed(FailReason::IdleTimeout));
    }

    #[test]
    fn test_activity_resets_idle_window() {
        let (mut r, start) = accept(3);
        let mid = start + Duration::from_secs(100);
        r.handle_data(0, chunk(120, 0), mid);
        // 121 s after accept but only 21 s after the last chunk.
        let out = r.tick(start + Duration::from_secs(121));
        assert!(out.frames.is_empty());
        assert_eq!(*r.state(), ReceiverState::Receiving);
    }

    #[test]
    fn test_sink_failure_sends_fin_err() {
        let (mut r, now) = accept(1);
        r.handle_data(0, chunk(10, 9), now);
        r.handle_end(now);
        let out = r.on_sink_result(false, now);
        assert!(matches!(out.frames[0], Frame::Fin { ok: false, .. }));
        assert_eq!(*r.state(), ReceiverState::Failed(FailReason::SinkError));
    }

    #[test]
    fn test_end_retry_after_completion_repeats_fin() {
        let (mut r, now) = accept(1);
        r.handle_data(0, chunk(10, 9), now);
        r.handle_end(now);
        r.on_sink_result(true, now);

        // The sender never saw our FIN and retried END.
        let out = r.handle_end(now);
        assert!(matches!(out.frames[0], Frame::Fin { ok: true, .. }));
        assert!(out.delivery.is_none());
    }

    #[test]
    fn test_reack_begin_for_duplicate_begin() {
        let (mut r, now) = accept(3);
        let out = r.reack_begin(now);
        assert!(matches!(out.frames[0], Frame::Ack { index: None, .. }));
    }
}
