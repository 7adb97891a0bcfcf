//! Ferry gRPC Server
//!
//! Serves a local directory over the `FileService` RPCs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use ferry::{LocalDirStore, TransferConfig};
use ferry_grpc::{TlsFiles, TransferServer};

/// Ferry gRPC Server - chunked file transfer over a local directory
#[derive(Parser, Debug)]
#[command(name = "ferry-grpc")]
#[command(about = "gRPC server for listing, downloading and uploading files")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "[::1]:50051")]
    addr: SocketAddr,

    /// Directory holding the served files
    #[arg(long, default_value = "./storage")]
    storage: PathBuf,

    /// Bearer token clients must present; authentication is off without it
    #[arg(long)]
    token: Option<String>,

    /// JSON transfer configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bytes per download chunk (overrides the config file)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Delay between download chunks in milliseconds (overrides the config file)
    #[arg(long)]
    pace_ms: Option<u64>,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

impl Args {
    fn transfer_config(&self) -> anyhow::Result<TransferConfig> {
        let mut config = match &self.config {
            Some(path) => TransferConfig::from_json_file(path)?,
            None => TransferConfig::default(),
        };
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(pace_ms) = self.pace_ms {
            config.pace = Duration::from_millis(pace_ms);
        }
        config.validate()?;
        Ok(config)
    }

    fn tls(&self) -> anyhow::Result<Option<TlsFiles>> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Ok(Some(TlsFiles {
                cert: cert.clone(),
                key: key.clone(),
            })),
            (None, None) => Ok(None),
            _ => bail!("--tls-cert and --tls-key must be given together"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let config = args.transfer_config()?;
    let store = LocalDirStore::open_dir(&args.storage)
        .await
        .with_context(|| format!("opening storage directory {}", args.storage.display()))?;

    tracing::info!(
        storage = %store.root().display(),
        chunk_size = config.chunk_size,
        pace_ms = config.pace.as_millis() as u64,
        "serving files"
    );

    TransferServer::new(args.addr, Arc::new(store), config)
        .with_token(args.token.clone())
        .with_tls(args.tls()?)
        .run()
        .await
}
