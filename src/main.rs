//! camdecode: camera discovery and elementary-stream decoding

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use camdecode::decode::{ffi, VideoCodec, H2645_START_CODE};
use camdecode::pipeline::DecodeWorker;
use camdecode::{Config, Discovery};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe the local network for ONVIF cameras
    Discover,
    /// Decode an Annex-B H.264/H.265 file, or a single JPEG with --codec mjpeg
    Decode {
        #[arg(long, default_value = "h264")]
        codec: VideoCodec,
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camdecode=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_deref())?;
    camdecode::CONFIG.store(Arc::new(config.clone()));
    if config.decoder.quiet_native_logs {
        ffi::set_libav_log_level_fatal();
    }

    match cli.command {
        Command::Discover => {
            let discovery = Discovery::from_config(&config.discovery);
            info!("Probing {}", discovery.multicast_address());
            let addresses = discovery.discover().await?;
            if addresses.is_empty() {
                warn!("No cameras answered");
            }
            for address in addresses {
                println!("{}", address);
            }
        }
        Command::Decode { codec, file } => {
            let data = tokio::fs::read(&file).await?;
            let units = if codec == VideoCodec::Mjpeg {
                vec![Bytes::from(data)]
            } else {
                split_annex_b(&Bytes::from(data))
            };
            info!("Decoding {} {} units from {}", units.len(), codec, file.display());

            let worker = DecodeWorker::spawn(
                codec,
                config.decoder.pool_capacity,
                config.pipeline.queue_depth,
            )?;
            let frames = worker.frames().clone();
            let printer = tokio::spawn(async move {
                while let Ok(frame) = frames.recv_async().await {
                    info!(
                        "Frame {}: {}x{}",
                        frame.meta.sequence,
                        frame.width(),
                        frame.height()
                    );
                }
            });

            for unit in units {
                worker
                    .units()
                    .send_async(unit)
                    .await
                    .map_err(|e| eyre!("Decode worker stopped: {}", e))?;
            }
            let decoded = tokio::task::spawn_blocking(move || worker.finish()).await??;
            printer.await?;
            info!("Decoded {} frames", decoded);
        }
    }

    Ok(())
}

/// Split an Annex-B byte stream into units without their start codes.
fn split_annex_b(data: &Bytes) -> Vec<Bytes> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i..i + 3] == H2645_START_CODE[1..] {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(starts.len());
    for (n, &start) in starts.iter().enumerate() {
        let mut end = starts.get(n + 1).map_or(data.len(), |next| next - 3);
        // Four-byte start codes leave a trailing zero on the previous unit
        while end > start && data[end - 1] == 0 {
            end -= 1;
        }
        if end > start {
            units.push(data.slice(start..end));
        }
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_annex_b() {
        let data = Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x68, 0xce, 0, 0, 0, 1, 0x65, 0x88]);
        let units = split_annex_b(&data);
        assert_eq!(units.len(), 3);
        assert_eq!(&units[0][..], &[0x67, 0x42]);
        assert_eq!(&units[1][..], &[0x68, 0xce]);
        assert_eq!(&units[2][..], &[0x65, 0x88]);
    }

    #[test]
    fn test_split_annex_b_without_start_code() {
        assert!(split_annex_b(&Bytes::from_static(&[0x65, 0x88])).is_empty());
    }
}
