use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;

use cli::Cli;
use httpscope::capture::{self, source, PcapMirror};
use httpscope::sink::{self, EventJsonWriter, EventPrinter, EventSink};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.capture_config();

    // All initialization failures are fatal before any capture starts.
    let capture = source::open(&config)
        .with_context(|| format!("opening capture input {:?}", config.input))?;
    let mirror = match &config.pcap_out {
        Some(path) => Some(
            PcapMirror::create(path, config.snap_len.max(0) as u32)
                .with_context(|| format!("creating pcap mirror {}", path.display()))?,
        ),
        None => None,
    };

    let mut sinks: Vec<Box<dyn EventSink>> = Vec::new();
    if let Some(target) = &cli.output {
        sinks.push(Box::new(
            EventPrinter::create(target).with_context(|| format!("opening dump output {target:?}"))?,
        ));
    }
    if let Some(base) = &cli.json_out {
        sinks.push(Box::new(EventJsonWriter::new(base)));
    }
    if sinks.is_empty() {
        sinks.push(Box::new(EventPrinter::create("stdout")?));
    }

    let (packet_tx, packet_rx) = mpsc::channel(source::PACKET_QUEUE);
    let (event_tx, event_rx) = mpsc::channel(config.event_capacity);

    let pump = source::spawn_pump(capture, packet_tx);
    let capture_task = tokio::spawn(capture::run(packet_rx, event_tx, config, mirror));

    sink::dispatch(event_rx, sinks).await;

    capture_task.await.context("capture loop task failed")?;
    let _ = pump.join();
    Ok(())
}
