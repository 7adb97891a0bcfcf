//! Server runner: bind, optionally enable TLS, serve until a shutdown signal.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use ferry::{TransferConfig, TransferStore};
use tonic::transport::{Identity, Server, ServerTlsConfig};

use crate::interceptor::{ActiveCalls, AuthInterceptor, InterceptorChain, LoggingInterceptor};
use crate::service::FileTransferService;

/// PEM files for the server's TLS identity.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    /// Certificate chain.
    pub cert: PathBuf,
    /// Private key.
    pub key: PathBuf,
}

/// The file transfer gRPC server.
#[derive(Debug)]
pub struct TransferServer {
    addr: SocketAddr,
    store: Arc<dyn TransferStore>,
    config: TransferConfig,
    token: Option<String>,
    tls: Option<TlsFiles>,
    active: ActiveCalls,
}

impl TransferServer {
    /// Create a server for `store` bound to `addr`.
    pub fn new(addr: SocketAddr, store: Arc<dyn TransferStore>, config: TransferConfig) -> Self {
        Self {
            addr,
            store,
            config,
            token: None,
            tls: None,
            active: ActiveCalls::new(),
        }
    }

    /// Require `authorization: Bearer <token>` on every call.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Serve over TLS with the given identity.
    pub fn with_tls(mut self, tls: Option<TlsFiles>) -> Self {
        self.tls = tls;
        self
    }

    /// The interceptor chain this server wraps every call in: logging,
    /// then authentication when a token is set, then in-flight tracking.
    pub fn chain(&self) -> InterceptorChain {
        let chain = InterceptorChain::new().with(LoggingInterceptor::new());
        let chain = match &self.token {
            Some(token) => chain.with(AuthInterceptor::new(token.clone())),
            None => chain,
        };
        chain.with(self.active.clone())
    }

    /// Run the server until shutdown signal.
    pub async fn run(self) -> anyhow::Result<()> {
        self.config.validate()?;
        if self.token.is_none() {
            tracing::warn!("no token configured, authentication is disabled");
        }

        let chain = self.chain();
        let active = self.active.clone();
        let service = FileTransferService::new(self.store, self.config, chain);

        let mut builder = Server::builder();
        if let Some(tls) = &self.tls {
            let cert = tokio::fs::read(&tls.cert).await?;
            let key = tokio::fs::read(&tls.key).await?;
            let identity = Identity::from_pem(cert, key);
            builder = builder.tls_config(ServerTlsConfig::new().identity(identity))?;
            tracing::info!(cert = %tls.cert.display(), "TLS enabled");
        }

        tracing::info!("Starting gRPC server on {}", self.addr);

        let draining = active.clone();
        let shutdown = async move {
            let signal = stop_signal().await;
            tracing::info!(
                signal = signal.name(),
                in_flight = draining.current(),
                "stopping, new calls refused while open transfers finish"
            );
        };

        builder
            .add_service(service.into_server())
            .serve_with_shutdown(self.addr, shutdown)
            .await?;

        tracing::info!(unfinished = active.current(), "gRPC server shut down");
        Ok(())
    }
}

/// What asked the server to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Interrupt,
    Terminate,
}

impl StopSignal {
    fn name(self) -> &'static str {
        match self {
            StopSignal::Interrupt => "SIGINT",
            StopSignal::Terminate => "SIGTERM",
        }
    }
}

/// Wait for Ctrl+C or, on unix, SIGTERM. A handler that cannot be installed
/// never fires, leaving the other to stop the server.
async fn stop_signal() -> StopSignal {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = interrupt => StopSignal::Interrupt,
        () = terminate() => StopSignal::Terminate,
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
