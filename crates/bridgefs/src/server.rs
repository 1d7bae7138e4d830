//! TCP server: accepts connections and serves them one at a time.
//!
//! The bridge has a single client, the remote mount, so concurrent
//! connections are not a goal: the listener serves each connection to
//! completion before accepting the next. All session state (handles,
//! in-flight requests) is owned per connection and torn down with it, so a
//! reconnecting client always starts from a clean slate.

use crate::config::Config;
use crate::executor::Executor;
use crate::session::Session;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bridge server
pub struct Server {
    config: Config,
    executor: Arc<Executor>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Validate the configuration and bind the listening socket.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the address cannot be bound.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Connection(format!("failed to bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Connection(format!("failed to read local address: {e}")))?;

        let executor = Arc::new(Executor::new(&config));

        Ok(Self {
            config,
            executor,
            listener,
            local_addr,
        })
    }

    /// The bound address; useful when the configured port was 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and serve connections until the process is stopped.
    ///
    /// # Errors
    ///
    /// Returns an error only if the listening socket itself fails.
    pub async fn run(&self) -> Result<()> {
        self.run_until(CancellationToken::new()).await
    }

    /// Accept and serve connections until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error only if the listening socket itself fails.
    pub async fn run_until(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            event = "server_listening",
            address = %self.local_addr,
            root_dir = ?self.config.root_dir,
            "listening for bridge connections"
        );

        loop {
            let (stream, peer) = tokio::select! {
                () = shutdown.cancelled() => {
                    info!(event = "server_stopping", "shutdown requested");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(event = "accept_failed", error = %e, "failed to accept connection");
                        continue;
                    }
                }
            };

            info!(event = "connection_accepted", peer = %peer, "connection accepted");

            if let Err(e) = stream.set_nodelay(true) {
                warn!(event = "nodelay_failed", peer = %peer, error = %e, "failed to set TCP_NODELAY");
            }

            // Serve inline: the next connection is accepted only after this
            // session has fully drained.
            let session = Session::new(&self.config, Arc::clone(&self.executor));
            match session.run(stream, shutdown.clone()).await {
                Ok(()) => info!(event = "connection_closed", peer = %peer, "connection closed"),
                Err(e) => {
                    warn!(event = "connection_failed", peer = %peer, error = %e, "connection ended with error");
                }
            }
        }
    }
}
