//! The protocol task: one async loop owning the port and the engine.
//!
//! All session state lives behind this single task, so the protocol
//! needs no locks. The loop multiplexes exactly three input sources:
//! inbound frames from the mesh port, commands from the UI/CLI, and a
//! 1 Hz tick. Every engine outcome is executed before the next input is
//! taken: frames go to the port (with bounded backoff on transient
//! device errors), deliveries go to the file sink and their verdicts
//! feed back into the engine as FIN frames.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::core::engine::{Engine, EngineOutcome};
use crate::core::events::{Event, EventBus};
use crate::core::files::{FileSink, FileSource};
use crate::core::port::{Destination, MeshPort, SendError};
use crate::core::session::{AbortReason, NodeId};
use crate::utils::sos::SignalOfStop;

/// How often session watchdogs and the rate limiter are driven.
const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Base backoff after a transient device error.
const SEND_BACKOFF: Duration = Duration::from_millis(250);

/// Requests from the UI/CLI side.
#[derive(Debug)]
pub enum Command {
    /// Read a file and start sending it to `peer`.
    SendFile { peer: NodeId, path: PathBuf },
    /// Abort whatever is in flight with `peer`.
    AbortPeer { peer: NodeId },
}

pub struct ProtocolTask<P, SK, SR>
where
    P: MeshPort,
    SK: FileSink,
    SR: FileSource,
{
    port: P,
    engine: Engine,
    sink: SK,
    source: SR,
    bus: EventBus,
    commands: mpsc::Receiver<Command>,
    sos: SignalOfStop,
    max_send_retries: u8,
}

impl<P, SK, SR> ProtocolTask<P, SK, SR>
where
    P: MeshPort,
    SK: FileSink,
    SR: FileSource,
{
    pub fn new(
        port: P,
        engine: Engine,
        sink: SK,
        source: SR,
        bus: EventBus,
        commands: mpsc::Receiver<Command>,
        sos: SignalOfStop,
        max_send_retries: u8,
    ) -> Self {
        Self {
            port,
            engine,
            sink,
            source,
            bus,
            commands,
            sos,
            max_send_retries,
        }
    }

    /// Run until cancelled or the device dies.
    pub async fn run(mut self) -> Result<()> {
        info!(event = "protocol_task_started", local = %self.port.local_id(), "Protocol task running");
        let mut ticker = tokio::time::interval(TICK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = self.sos.wait() => {
                    let outcome = self.engine.shutdown(Instant::now());
                    // Best-effort flush of the ABT frames; the device may
                    // already be gone.
                    let _ = self.execute(outcome).await;
                    info!(event = "protocol_task_stopped", "Protocol task stopped by shutdown signal");
                    return Ok(());
                }

                inbound = self.port.recv() => match inbound {
                    Some(inbound) => {
                        let outcome = self.engine.handle_inbound(&inbound, Instant::now());
                        self.execute_or_die(outcome).await?;
                    }
                    None => {
                        self.engine.device_failed(Instant::now());
                        return Err(anyhow!("mesh device stream ended"));
                    }
                },

                cmd = self.commands.recv(), if commands_open => match cmd {
                    Some(command) => {
                        let outcome = self.handle_command(command);
                        self.execute_or_die(outcome).await?;
                    }
                    None => {
                        // UI side gone; keep serving the mesh until shutdown.
                        commands_open = false;
                    }
                },

                _ = ticker.tick() => {
                    let outcome = self.engine.tick(Instant::now());
                    self.execute_or_die(outcome).await?;
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> EngineOutcome {
        let now = Instant::now();
        match command {
            Command::SendFile { peer, path } => match self.source.read(&path) {
                Ok((filename, bytes)) => {
                    match self.engine.start_transfer(peer, &filename, &bytes, now) {
                        Ok((tid, outcome)) => {
                            debug!(event = "send_command_accepted", tid = %tid, "Transfer started from command");
                            outcome
                        }
                        Err(err) => {
                            warn!(event = "send_command_rejected", error = %err, "Transfer refused");
                            self.bus.publish(Event::LogLine {
                                level: tracing::Level::WARN,
                                text: format!("transfer refused: {err}"),
                            });
                            EngineOutcome::default()
                        }
                    }
                }
                Err(err) => {
                    warn!(event = "send_command_read_failed", path = %path.display(), error = %err, "Cannot read file to send");
                    self.bus.publish(Event::LogLine {
                        level: tracing::Level::WARN,
                        text: format!("cannot read {}: {err}", path.display()),
                    });
                    EngineOutcome::default()
                }
            },
            Command::AbortPeer { peer } => {
                self.engine.abort_peer(&peer, AbortReason::User, Instant::now())
            }
        }
    }

    async fn execute_or_die(&mut self, outcome: EngineOutcome) -> Result<()> {
        if let Err(err) = self.execute(outcome).await {
            self.engine.device_failed(Instant::now());
            return Err(err);
        }
        Ok(())
    }

    /// Execute an outcome: transmit frames, run sink deliveries, and feed
    /// sink verdicts back in until nothing is pending.
    async fn execute(&mut self, outcome: EngineOutcome) -> Result<()> {
        let mut pending = vec![outcome];
        while let Some(out) = pending.pop() {
            for (dest, text) in out.frames {
                self.transmit(&dest, &text).await?;
            }
            for delivery in out.deliveries {
                let ok = match self.sink.deliver(&delivery.filename, &delivery.bytes) {
                    Ok(path) => {
                        debug!(event = "delivery_ok", path = %path.display(), "Sink accepted file");
                        true
                    }
                    Err(err) => {
                        error!(event = "delivery_failed", filename = %delivery.filename, error = %err, "Sink rejected file");
                        false
                    }
                };
                let next =
                    self.engine
                        .on_sink_result(&delivery.peer, &delivery.tid, ok, Instant::now());
                if !next.is_empty() {
                    pending.push(next);
                }
            }
        }
        Ok(())
    }

    /// Send one frame, retrying transient failures with linear backoff.
    /// A frame dropped after exhausting retries is left to the protocol's
    /// own watchdogs; a fatal error propagates and stops the task.
    async fn transmit(&mut self, dest: &Destination, text: &str) -> Result<()> {
        let mut attempt: u8 = 0;
        loop {
            match self.port.send(dest, text).await {
                Ok(()) => return Ok(()),
                Err(SendError::Transient(msg)) => {
                    attempt += 1;
                    if attempt > self.max_send_retries {
                        warn!(event = "send_dropped", dest = %dest, "Frame dropped after transient retries");
                        return Ok(());
                    }
                    debug!(event = "send_retry", dest = %dest, attempt, reason = %msg, "Transient send failure, backing off");
                    tokio::time::sleep(SEND_BACKOFF * attempt as u32).await;
                }
                Err(SendError::Fatal(msg)) => {
                    error!(event = "send_fatal", dest = %dest, reason = %msg, "Device failed");
                    return Err(anyhow!("mesh device failed: {msg}"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::files::{DiskSource, DownloadsSink};
    use crate::core::port::{LinkProfile, MemoryMesh};

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("zmesh_worker_{tag}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn spawn_node(
        mesh: &MemoryMesh,
        id: &str,
        name: &str,
        download_dir: PathBuf,
        sos: SignalOfStop,
    ) -> (EventBus, mpsc::Sender<Command>) {
        let bus = EventBus::new();
        let port = mesh.attach(id);
        let cfg = Config::default();
        let engine = Engine::new(
            cfg.clone(),
            NodeId::new(id),
            name,
            bus.clone(),
            Instant::now(),
        )
        .unwrap();
        let sink = DownloadsSink::new(Some(download_dir)).unwrap();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let task = ProtocolTask::new(
            port,
            engine,
            sink,
            DiskSource,
            bus.clone(),
            cmd_rx,
            sos,
            cfg.max_retries,
        );
        tokio::spawn(task.run());
        (bus, cmd_tx)
    }

    async fn await_event(
        sub: &crate::core::events::Subscription,
        timeout: Duration,
        mut want: impl FnMut(&Event) -> bool,
    ) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let event = sub.recv().await;
                if want(&event) {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn test_end_to_end_transfer_over_memory_mesh() {
        let mesh = MemoryMesh::new(LinkProfile::default(), 42);
        let sos = SignalOfStop::new();
        let dir_a = scratch("e2e_a");
        let dir_b = scratch("e2e_b");

        let (bus_a, cmd_a) = spawn_node(&mesh, "!aaaa0001", "alpha", dir_a.clone(), sos.clone());
        let (bus_b, _cmd_b) = spawn_node(&mesh, "!bbbb0002", "bravo", dir_b.clone(), sos.clone());
        let done_a = bus_a.subscribe();
        let done_b = bus_b.subscribe();

        let payload: Vec<u8> = (0..300u32).map(|i| (i * 13) as u8).collect();
        let src = dir_a.join("brief.pdf");
        std::fs::write(&src, &payload).unwrap();
        cmd_a
            .send(Command::SendFile {
                peer: NodeId::new("!bbbb0002"),
                path: src,
            })
            .await
            .unwrap();

        assert!(
            await_event(&done_a, Duration::from_secs(10), |e| {
                matches!(e, Event::TransferCompleted { bytes: 300, .. })
            })
            .await,
            "sender never completed"
        );
        assert!(
            await_event(&done_b, Duration::from_secs(10), |e| {
                matches!(e, Event::TransferCompleted { .. })
            })
            .await,
            "receiver never completed"
        );
        assert_eq!(std::fs::read(dir_b.join("brief.pdf")).unwrap(), payload);

        sos.cancel();
        let _ = std::fs::remove_dir_all(&dir_a);
        let _ = std::fs::remove_dir_all(&dir_b);
    }

    #[tokio::test]
    async fn test_transient_send_errors_are_retried() {
        let mesh = MemoryMesh::new(LinkProfile::default(), 42);
        let sos = SignalOfStop::new();
        let dir_a = scratch("transient_a");
        let dir_b = scratch("transient_b");

        let (bus_a, cmd_a) = spawn_node(&mesh, "!aaaa0001", "alpha", dir_a.clone(), sos.clone());
        let (_bus_b, _cmd_b) = spawn_node(&mesh, "!bbbb0002", "bravo", dir_b.clone(), sos.clone());
        let done_a = bus_a.subscribe();

        // The first two sends hit a busy radio; backoff must absorb them.
        mesh.induce_transient_failures(2);

        let src = dir_a.join("tiny.bin");
        std::fs::write(&src, [7u8; 40]).unwrap();
        cmd_a
            .send(Command::SendFile {
                peer: NodeId::new("!bbbb0002"),
                path: src,
            })
            .await
            .unwrap();

        assert!(
            await_event(&done_a, Duration::from_secs(10), |e| {
                matches!(e, Event::TransferCompleted { .. })
            })
            .await,
            "transfer should survive transient device errors"
        );

        sos.cancel();
        let _ = std::fs::remove_dir_all(&dir_a);
        let _ = std::fs::remove_dir_all(&dir_b);
    }

    #[tokio::test]
    async fn test_busy_peer_command_reports_log_line() {
        let mesh = MemoryMesh::new(LinkProfile::default(), 42);
        let sos = SignalOfStop::new();
        let dir_a = scratch("busy_a");
        let dir_b = scratch("busy_b");

        let (bus_a, cmd_a) = spawn_node(&mesh, "!aaaa0001", "alpha", dir_a.clone(), sos.clone());
        let (_bus_b, _cmd_b) = spawn_node(&mesh, "!bbbb0002", "bravo", dir_b.clone(), sos.clone());
        let log_a = bus_a.subscribe();

        // A large file keeps the first transfer busy long enough for the
        // second command to collide with it.
        let src = dir_a.join("large.bin");
        std::fs::write(&src, vec![1u8; 12_000]).unwrap();
        for _ in 0..2 {
            cmd_a
                .send(Command::SendFile {
                    peer: NodeId::new("!bbbb0002"),
                    path: src.clone(),
                })
                .await
                .unwrap();
        }

        assert!(
            await_event(&log_a, Duration::from_secs(5), |e| {
                matches!(e, Event::LogLine { text, .. } if text.contains("refused"))
            })
            .await,
            "second start should be refused as busy"
        );

        sos.cancel();
        let _ = std::fs::remove_dir_all(&dir_a);
        let _ = std::fs::remove_dir_all(&dir_b);
    }
}
