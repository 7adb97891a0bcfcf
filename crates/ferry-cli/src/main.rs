//! Ferry CLI - client for the ferry file transfer service
//!
//! Usage:
//!   ferry list                         List files on the server
//!   ferry download name.txt            Download a file to stdout
//!   ferry upload ./sports.txt          Upload a file
//!   ferry upload-progress ./big.bin    Upload a file, printing progress

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use ferry::{DEFAULT_CHUNK_SIZE, TransferError};
use ferry_grpc::{ClientOptions, FileClient};

/// Ferry CLI - list, download and upload files over gRPC
#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(about = "Client for the ferry file transfer service")]
struct Cli {
    /// Server URI
    #[arg(long, default_value = "http://[::1]:50051")]
    addr: String,

    /// Bearer token to present
    #[arg(long)]
    token: Option<String>,

    /// PEM trust root; switches to TLS
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// TLS server name override
    #[arg(long, requires = "ca_cert")]
    domain: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List files on the server
    List,
    /// Download a file
    Download {
        /// File to fetch
        name: String,
        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Write here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Upload a file over a client stream
    Upload(UploadArgs),
    /// Upload a file over a bidirectional stream, printing progress notices
    UploadProgress(UploadArgs),
}

#[derive(Args, Debug)]
struct UploadArgs {
    /// Local file to send
    path: PathBuf,
    /// Name on the server (defaults to the local file name)
    #[arg(long)]
    name: Option<String>,
    /// Bytes per message
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    /// Delay between messages in milliseconds
    #[arg(long, default_value_t = 0)]
    pace_ms: u64,
}

impl UploadArgs {
    fn target_name(&self) -> anyhow::Result<String> {
        if let Some(name) = &self.name {
            return Ok(name.clone());
        }
        file_name(&self.path)
    }
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("cannot derive a file name from {}", path.display()))
}

impl Cli {
    fn options(&self) -> ClientOptions {
        let pace = match &self.command {
            Command::Upload(args) | Command::UploadProgress(args) => {
                Duration::from_millis(args.pace_ms)
            }
            _ => Duration::ZERO,
        };
        ClientOptions {
            addr: self.addr.clone(),
            token: self.token.clone(),
            ca_cert: self.ca_cert.clone(),
            domain: self.domain.clone(),
            pace,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = FileClient::connect(cli.options()).await?;

    match cli.command {
        Command::List => {
            let names = client.list_files().await?;
            let mut stdout = std::io::stdout().lock();
            for name in &names {
                writeln!(stdout, "{name}")?;
            }
            tracing::info!(count = names.len(), "listed files");
        }
        Command::Download {
            name,
            timeout_ms,
            output,
        } => {
            let timeout = timeout_ms.map(Duration::from_millis);
            let mut download = client.download(&name, timeout).await?;
            let mut data = Vec::new();
            while let Some(chunk) = download.next_chunk().await? {
                tracing::info!(bytes = chunk.len(), total = download.received(), "received chunk");
                data.extend_from_slice(&chunk);
            }
            match output {
                Some(path) => tokio::fs::write(&path, &data)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?,
                None => std::io::stdout().lock().write_all(&data)?,
            }
            tracing::info!(filename = %name, bytes = data.len(), "download complete");
        }
        Command::Upload(args) => {
            let name = args.target_name()?;
            let payload = read_payload(&args.path).await?;
            let size = client.upload(&name, &payload, args.chunk_size).await?;
            tracing::info!(filename = %name, size, "upload complete");
        }
        Command::UploadProgress(args) => {
            let name = args.target_name()?;
            let payload = read_payload(&args.path).await?;
            let notices = client
                .upload_with_progress(&name, &payload, args.chunk_size)
                .await?;
            let size = notices.last().map_or(0, |n| n.received_bytes);
            tracing::info!(filename = %name, size, notices = notices.len(), "upload complete");
        }
    }
    Ok(())
}

async fn read_payload(path: &Path) -> anyhow::Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

fn report(err: &anyhow::Error) {
    match err.downcast_ref::<TransferError>() {
        Some(TransferError::NotFound(msg)) => tracing::error!("not found: {msg}"),
        Some(TransferError::DeadlineExceeded(msg)) => {
            tracing::error!("deadline exceeded: {msg}");
        }
        Some(TransferError::Unauthenticated(msg)) => {
            tracing::error!("unauthenticated: {msg}");
        }
        Some(other) => tracing::error!(kind = other.kind(), "transfer failed: {other}"),
        None => tracing::error!("{err:#}"),
    }
}
