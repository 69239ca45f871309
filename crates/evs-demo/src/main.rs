//! evs-demo: send a file or generated bytes through a multiplexed stream over
//! an in-process loopback connection.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use evs_stream::testing::LoopbackTransport;
use evs_stream::{create_stream, BlobReader, Config, DuplexStream, Multiplexer, Value};

/// Upload bytes across a loopback connection and report what arrived
#[derive(Parser, Debug)]
#[command(name = "evs-demo")]
#[command(version, about = "Send bytes through a multiplexed duplex stream")]
struct Cli {
    /// File to send; generated bytes are sent when omitted
    #[arg(long)]
    file: Option<PathBuf>,

    /// Number of generated bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    size: usize,

    /// Config file path
    #[arg(long, env = "EVSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Send binary chunks as base64 text
    #[arg(long)]
    force_base64: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.force_base64 {
        config.mux.force_base64 = true;
    }

    let (client_transport, server_transport) = LoopbackTransport::pair();
    let client = Multiplexer::new(client_transport, config.mux.clone());
    let server = Multiplexer::new(server_transport, config.mux.clone());

    let (upload_tx, mut upload_rx) = mpsc::unbounded_channel();
    server.on("upload", move |args| {
        let name = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or("unnamed")
            .to_string();
        match args.get(1).and_then(Value::as_stream) {
            Some(stream) => {
                let _ = upload_tx.send((name, stream.clone()));
            }
            None => warn!(name, "upload without a stream"),
        }
    });

    let stream = create_stream(config.stream.clone());
    let name = match &cli.file {
        Some(path) => path.display().to_string(),
        None => format!("generated-{}", cli.size),
    };
    client
        .emit("upload", vec![Value::from(name.as_str()), Value::Stream(stream.clone())])
        .context("failed to emit upload")?;

    let (name, incoming) = upload_rx
        .recv()
        .await
        .context("server never received the upload")?;
    info!(name, stream = %incoming.id(), "receiving upload");

    let started = Instant::now();
    let receiver = tokio::spawn(receive(incoming));
    let sent = send(&cli, &stream).await?;
    let received = receiver.await??;

    info!(
        sent,
        received,
        elapsed_ms = started.elapsed().as_millis() as u64,
        base64 = config.mux.force_base64,
        "transfer complete"
    );
    println!("{name}: sent {sent} bytes, received {received} bytes");

    if sent != received {
        anyhow::bail!("byte count mismatch: sent {sent}, received {received}");
    }
    Ok(())
}

async fn send(cli: &Cli, stream: &DuplexStream) -> Result<u64> {
    let sent = match &cli.file {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            stream.pipe_from(file).await?
        }
        None => {
            let data: Vec<u8> = (0..cli.size).map(|i| (i % 251) as u8).collect();
            BlobReader::new(Bytes::from(data)).pipe(stream).await?
        }
    };
    Ok(sent)
}

async fn receive(stream: DuplexStream) -> Result<u64> {
    let received = stream.pipe_to(tokio::io::sink()).await?;
    Ok(received)
}
