//! Sender side of a transfer: stop-and-wait with a per-chunk watchdog.
//!
//! Lifecycle: Negotiating (BEGIN out, awaiting the receiver's first ACK)
//! → Transferring (one DATA outstanding at a time) → Finalizing (END out,
//! awaiting FIN) → Completed | Failed | Aborted.
//!
//! The session is a pure state machine. Inputs are frames and clock
//! ticks; outputs are control frames plus events. DATA frames are pulled
//! by the engine through `next_data` so the duty-cycle token bucket stays
//! outside the session.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::core::codec::{sanitize_filename, Frame};
use crate::core::config::Config;
use crate::core::events::Event;
use crate::core::session::{
    split_into_chunks, AbortReason, Direction, FailReason, NodeId, StartError, TransferId,
};

/// Sender lifecycle states.
#[derive(Debug, Clone, PartialEq)]
pub enum SenderState {
    /// BEGIN sent, no sign of life from the receiver yet.
    Negotiating,
    /// Chunks moving, cursor advancing.
    Transferring,
    /// Every chunk acknowledged, END sent, awaiting FIN.
    Finalizing,
    Completed,
    Failed(FailReason),
    Aborted(AbortReason),
}

/// Frames and events produced by one sender input.
#[derive(Debug, Default)]
pub struct SenderOutput {
    pub frames: Vec<Frame>,
    pub events: Vec<Event>,
}

impl SenderOutput {
    fn frame(frame: Frame) -> Self {
        Self {
            frames: vec![frame],
            events: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct SenderSession {
    tid: TransferId,
    peer: NodeId,
    filename: String,
    chunks: Vec<Bytes>,
    state: SenderState,
    /// Next never-sent chunk index.
    cursor: u16,
    /// The single DATA currently awaiting its ACK.
    in_flight: Option<u16>,
    /// Watchdog (Transferring), BEGIN (Negotiating) or FIN (Finalizing)
    /// deadline, depending on state.
    deadline: Instant,
    /// Chunks owed a retransmit, lowest index first, served before the
    /// cursor.
    retry_queue: VecDeque<u16>,
    retry_count: HashMap<u16, u8>,
    acked: BTreeSet<u16>,
    begin_retries: u8,
    end_retries: u8,
    started_at: Instant,
    chunk_timeout: Duration,
    negotiate_timeout: Duration,
    final_timeout: Duration,
    max_retries: u8,
}

impl SenderSession {
    /// Create the session and produce the opening BEGIN.
    pub fn start(
        cfg: &Config,
        peer: NodeId,
        filename: &str,
        data: &[u8],
        now: Instant,
    ) -> Result<(Self, SenderOutput), StartError> {
        let chunks = split_into_chunks(data, cfg.chunk_payload_max);
        if chunks.is_empty() {
            return Err(StartError::EmptyFile);
        }
        if chunks.len() > u16::MAX as usize {
            return Err(StartError::TooLarge {
                chunks: chunks.len(),
            });
        }

        let tid = TransferId::generate();
        let filename = sanitize_filename(filename);
        let total = chunks.len() as u16;
        info!(
            event = "transfer_started",
            tid = %tid,
            peer = %peer,
            filename = %filename,
            total_chunks = total,
            "Outbound transfer starting"
        );

        let session = Self {
            tid: tid.clone(),
            peer: peer.clone(),
            filename: filename.clone(),
            chunks,
            state: SenderState::Negotiating,
            cursor: 0,
            in_flight: None,
            deadline: now + cfg.negotiate_timeout(),
            retry_queue: VecDeque::new(),
            retry_count: HashMap::new(),
            acked: BTreeSet::new(),
            begin_retries: 0,
            end_retries: 0,
            started_at: now,
            chunk_timeout: cfg.chunk_timeout(),
            negotiate_timeout: cfg.negotiate_timeout(),
            final_timeout: cfg.final_timeout(),
            max_retries: cfg.max_retries,
        };
        let output = SenderOutput {
            frames: vec![session.begin_frame()],
            events: vec![Event::TransferStarted {
                tid,
                peer,
                direction: Direction::Send,
                filename,
                total_chunks: total,
            }],
        };
        Ok((session, output))
    }

    // ── Frame inputs ─────────────────────────────────────────────────────

    /// Handle an ACK. `None` is the begin-ack sentinel.
    pub fn handle_ack(&mut self, index: Option<u16>, now: Instant) -> SenderOutput {
        let mut out = SenderOutput::default();
        if self.is_terminal() {
            return out;
        }
        if self.state == SenderState::Negotiating {
            debug!(event = "negotiated", tid = %self.tid, "Receiver is alive, transferring");
            self.state = SenderState::Transferring;
        }

        let Some(idx) = index else {
            return out; // bare begin-ack carries no chunk to settle
        };
        if idx as usize >= self.chunks.len() {
            warn!(event = "ack_unknown_index", tid = %self.tid, index = idx, "ACK for unknown chunk ignored");
            return out;
        }
        if !self.acked.insert(idx) {
            return out; // duplicate ACK, idempotent
        }
        self.retry_count.remove(&idx);
        self.retry_queue.retain(|&i| i != idx);
        if self.in_flight == Some(idx) {
            self.in_flight = None;
        }
        out.events.push(Event::ChunkAcked {
            tid: self.tid.clone(),
            index: idx,
        });
        out.events.push(Event::Progress {
            tid: self.tid.clone(),
            done: self.acked.len() as u16,
            total: self.total_chunks(),
        });

        if self.acked.len() == self.chunks.len() {
            info!(event = "all_chunks_acked", tid = %self.tid, "Every chunk acknowledged, sending END");
            self.state = SenderState::Finalizing;
            self.deadline = now + self.final_timeout;
            out.frames.push(Frame::End {
                tid: self.tid.clone(),
            });
        }
        out
    }

    /// Handle a NAK: queue the chunk ahead of fresh ones.
    pub fn handle_nak(&mut self, index: u16, _now: Instant) -> SenderOutput {
        let mut out = SenderOutput::default();
        if self.is_terminal() {
            return out;
        }
        if self.state == SenderState::Negotiating {
            self.state = SenderState::Transferring;
        }
        if index as usize >= self.chunks.len() || self.acked.contains(&index) {
            warn!(event = "nak_ignored", tid = %self.tid, index, "NAK for unknown or settled chunk");
            return out;
        }
        if self.in_flight == Some(index) || self.retry_queue.contains(&index) {
            return out; // a retransmit is already on its way
        }

        let retries = self.retry_count.entry(index).or_insert(0);
        *retries += 1;
        if *retries > self.max_retries {
            return self.fail(FailReason::ChunkExhausted(index), out);
        }
        debug!(event = "nak_requeue", tid = %self.tid, index, retries = *retries, "Chunk queued for retransmit");
        let pos = self
            .retry_queue
            .iter()
            .position(|&i| i > index)
            .unwrap_or(self.retry_queue.len());
        self.retry_queue.insert(pos, index);

        if self.state == SenderState::Finalizing {
            // Receiver answered END with gaps; fall back to transferring.
            self.state = SenderState::Transferring;
        }
        out
    }

    /// Handle the receiver's final verdict.
    pub fn handle_fin(&mut self, ok: bool, _now: Instant) -> SenderOutput {
        let mut out = SenderOutput::default();
        if self.state != SenderState::Finalizing {
            debug!(event = "fin_out_of_state", tid = %self.tid, state = ?self.state, "FIN ignored");
            return out;
        }
        if ok {
            info!(
                event = "transfer_complete",
                tid = %self.tid,
                peer = %self.peer,
                bytes = self.bytes_total(),
                "Transfer confirmed by receiver"
            );
            self.state = SenderState::Completed;
            out.events.push(Event::TransferCompleted {
                tid: self.tid.clone(),
                peer: self.peer.clone(),
                filename: self.filename.clone(),
                bytes: self.bytes_total(),
            });
            out
        } else {
            self.fail(FailReason::ReceiverError, out)
        }
    }

    /// Handle an ABT from the peer.
    pub fn handle_abort(&mut self, reason: AbortReason) -> SenderOutput {
        let mut out = SenderOutput::default();
        if self.is_terminal() {
            return out;
        }
        warn!(event = "transfer_aborted_by_peer", tid = %self.tid, reason = %reason, "Peer aborted transfer");
        self.state = SenderState::Aborted(reason.clone());
        out.events.push(Event::TransferFailed {
            tid: self.tid.clone(),
            peer: self.peer.clone(),
            reason: FailReason::Aborted(reason),
        });
        out
    }

    /// Abort from this side: emit ABT and stop.
    pub fn abort_local(&mut self, reason: AbortReason) -> SenderOutput {
        let mut out = SenderOutput::default();
        if self.is_terminal() {
            return out;
        }
        self.state = SenderState::Aborted(reason.clone());
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

    // ── Clock input ──────────────────────────────────────────────────────

    /// Drive deadlines: BEGIN retries, the chunk watchdog, END retries.
    pub fn tick(&mut self, now: Instant) -> SenderOutput {
        let mut out = SenderOutput::default();
        if now < self.deadline || self.is_terminal() {
            return out;
        }
        match self.state {
            SenderState::Negotiating => {
                if self.begin_retries >= self.max_retries {
                    return self.fail(FailReason::NoResponse, out);
                }
                self.begin_retries += 1;
                self.deadline = now + self.negotiate_timeout;
                debug!(event = "begin_retry", tid = %self.tid, attempt = self.begin_retries, "Retransmitting BEGIN");
                out.frames.push(self.begin_frame());
                out
            }
            SenderState::Transferring => {
                let Some(idx) = self.in_flight else {
                    return out; // nothing outstanding; pump is rate-limited
                };
                let retries = self.retry_count.get(&idx).copied().unwrap_or(0) + 1;
                out.events.push(Event::ChunkTimedOut {
                    tid: self.tid.clone(),
                    index: idx,
                    retries,
                });
                if retries > self.max_retries {
                    return self.fail(FailReason::ChunkExhausted(idx), out);
                }
                warn!(event = "chunk_timeout", tid = %self.tid, index = idx, retries, "Watchdog fired, retransmitting");
                self.retry_count.insert(idx, retries);
                self.in_flight = None;
                self.retry_queue.push_front(idx);
                out
            }
            SenderState::Finalizing => {
                if self.end_retries == 0 {
                    self.end_retries = 1;
                    self.deadline = now + self.final_timeout;
                    debug!(event = "end_retry", tid = %self.tid, "Retransmitting END");
                    out.frames.push(Frame::End {
                        tid: self.tid.clone(),
                    });
                    out
                } else {
                    self.fail(FailReason::FinalTimeout, out)
                }
            }
            _ => out,
        }
    }

    // ── DATA pump (token-gated by the engine) ────────────────────────────

    /// True when the session could send a DATA frame right now.
    pub fn wants_data(&self) -> bool {
        self.state == SenderState::Transferring
            && self.in_flight.is_none()
            && (!self.retry_queue.is_empty() || (self.cursor as usize) < self.chunks.len())
    }

    /// Emit the next DATA frame: queued retransmits first, then the
    /// cursor. Arms the watchdog.
    pub fn next_data(&mut self, now: Instant) -> Option<SenderOutput> {
        if !self.wants_data() {
            return None;
        }
        let idx = match self.retry_queue.pop_front() {
            Some(idx) => idx,
            None => {
                let idx = self.cursor;
                self.cursor += 1;
                idx
            }
        };
        self.in_flight = Some(idx);
        self.deadline = now + self.chunk_timeout;
        let attempt = self.retry_count.get(&idx).copied().unwrap_or(0) + 1;
        let mut out = SenderOutput::frame(Frame::Data {
            tid: self.tid.clone(),
            index: idx,
            payload: self.chunks[idx as usize].clone(),
        });
        out.events.push(Event::ChunkSent {
            tid: self.tid.clone(),
            index: idx,
            attempt,
        });
        Some(out)
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn tid(&self) -> &TransferId {
        &self.tid
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    pub fn state(&self) -> &SenderState {
        &self.state
    }

    pub fn total_chunks(&self) -> u16 {
        self.chunks.len() as u16
    }

    pub fn bytes_total(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SenderState::Completed | SenderState::Failed(_) | SenderState::Aborted(_)
        )
    }

    fn begin_frame(&self) -> Frame {
        Frame::Begin {
            tid: self.tid.clone(),
            total: self.total_chunks(),
            filename: self.filename.clone(),
        }
    }

    fn fail(&mut self, reason: FailReason, mut out: SenderOutput) -> SenderOutput {
        warn!(event = "transfer_failed", tid = %self.tid, peer = %self.peer, reason = %reason, "Transfer failed");
        self.state = SenderState::Failed(reason.clone());
        out.events.push(Event::TransferFailed {
            tid: self.tid.clone(),
            peer: self.peer.clone(),
            reason,
        });
        out
    }
}
