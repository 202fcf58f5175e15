//! `zmesh` binary: run the transfer protocol across a simulated mesh.
//!
//! Two nodes join an in-memory mesh with configurable loss, duplication
//! and latency; alpha pushes a file to bravo through the full protocol
//! stack (engine, codec, rate limiter, sinks). This is the shell-facing
//! stand-in for radio hardware: same engine, fake ether.

use std::time::Instant;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use zmesh::app::Args;
use zmesh::core::config::Config;
use zmesh::core::engine::Engine;
use zmesh::core::events::{Event, EventBus};
use zmesh::core::files::{DiskSource, DownloadsSink};
use zmesh::core::port::MemoryMesh;
use zmesh::core::session::NodeId;
use zmesh::utils::sos::SignalOfStop;
use zmesh::workers::engine::{Command, ProtocolTask};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::load();

    let filter = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cfg = args.protocol_config()?;
    let sos = SignalOfStop::new();
    let sos_ctrlc = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_ctrlc.cancel();
    });

    let mesh = MemoryMesh::new(args.link_profile(), args.seed);
    let alpha_bus = spawn_node(&mesh, &cfg, "!feed0001", "alpha", &sos, None)?;
    let (payload_name, payload) = load_payload(&args)?;

    let download_dir = cfg
        .download_dir
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("received"));
    let _bravo_bus = spawn_node(
        &mesh,
        &cfg,
        "!feed0002",
        "bravo",
        &sos,
        Some(download_dir.clone()),
    )?;

    info!(
        event = "sim_started",
        file = %payload_name,
        bytes = payload.len(),
        loss = args.loss,
        seed = args.seed,
        "Pushing file across the simulated mesh"
    );

    // Stage the payload where alpha's file source can read it.
    let staging = std::env::temp_dir().join(format!("zmesh_sim_{}", std::process::id()));
    std::fs::create_dir_all(&staging)?;
    let src_path = staging.join(&payload_name);
    std::fs::write(&src_path, &payload)?;
    alpha_bus
        .1
        .send(Command::SendFile {
            peer: NodeId::new("!feed0002"),
            path: src_path,
        })
        .await?;

    // Watch alpha's events until the transfer settles or ctrl-c.
    let events = alpha_bus.0.subscribe();
    let started = Instant::now();
    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Event::Progress { done, total, .. } => {
                    info!(event = "progress", done, total, "Transfer progress");
                }
                Event::TransferCompleted { bytes, .. } => break Ok(bytes),
                Event::TransferFailed { reason, .. } => break Err(reason),
                _ => {}
            },
            _ = sos.wait() => {
                println!("interrupted");
                return Ok(());
            }
        }
    };

    let elapsed = started.elapsed();
    sos.cancel();
    let _ = std::fs::remove_dir_all(&staging);
    match outcome {
        Ok(bytes) => {
            println!(
                "transfer complete: {bytes} bytes in {:.1}s -> {}",
                elapsed.as_secs_f64(),
                download_dir.join(&payload_name).display()
            );
            Ok(())
        }
        Err(reason) => {
            println!("transfer failed after {:.1}s: {reason}", elapsed.as_secs_f64());
            std::process::exit(1);
        }
    }
}

type NodeHandle = (EventBus, mpsc::Sender<Command>);

fn spawn_node(
    mesh: &MemoryMesh,
    cfg: &Config,
    id: &str,
    name: &str,
    sos: &SignalOfStop,
    download_dir: Option<std::path::PathBuf>,
) -> Result<NodeHandle> {
    let bus = EventBus::new();
    let engine = Engine::new(
        cfg.clone(),
        NodeId::new(id),
        name,
        bus.clone(),
        Instant::now(),
    )?;
    let sink = DownloadsSink::new(download_dir)?;
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let task = ProtocolTask::new(
        mesh.attach(id),
        engine,
        sink,
        DiskSource,
        bus.clone(),
        cmd_rx,
        sos.clone(),
        cfg.max_retries,
    );
    tokio::spawn(task.run());
    Ok((bus, cmd_tx))
}

fn load_payload(args: &Args) -> Result<(String, Vec<u8>)> {
    match &args.file {
        Some(path) => {
            use zmesh::core::files::FileSource;
            DiskSource.read(path)
        }
        None => {
            let bytes: Vec<u8> = (0..args.bytes).map(|_| rand::random::<u8>()).collect();
            Ok(("random.bin".to_string(), bytes))
        }
    }
}
