//! Listener loop and shutdown

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::{self, ArchivePool};
use crate::config::Config;
use crate::modifier::Pipeline;
use crate::registry::Registry;
use crate::Result;

use super::{ConnectionLimit, HttpProxy, SHUTDOWN_TIMEOUT_MS};

/// Proxy server owning the pipeline, the registry and every open archive
pub struct ProxyServer {
    config: Arc<Config>,
    proxy: Arc<HttpProxy>,
    archives: Arc<ArchivePool>,
    connections: ConnectionLimit,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyServer {
    /// Wire up a server from `config`
    ///
    /// Registers the built-in modifiers and `cache.Modifier`, then installs
    /// `config.modifier_file` as the pipeline root if one is set.
    ///
    /// # Errors
    ///
    /// Returns error if the modifier file cannot be read or built
    pub fn new(config: Config) -> Result<Self> {
        let registry = Registry::with_builtins()?;
        let archives = Arc::new(ArchivePool::new(config.archive.inline_threshold));
        cache::register(&registry, Arc::clone(&archives), config.archive.clone())?;

        let pipeline = Arc::new(Pipeline::new());
        if let Some(path) = &config.modifier_file {
            let json = std::fs::read(path)?;
            pipeline.configure(&registry, &json)?;
            info!("Installed modifiers from {}", path.display());
        }

        let proxy = HttpProxy::new(
            pipeline,
            Arc::new(registry),
            config.api_host.clone(),
            config.limits.clone(),
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            connections: ConnectionLimit::new(config.limits.max_connections),
            config: Arc::new(config),
            proxy: Arc::new(proxy),
            archives,
            shutdown_tx,
        })
    }

    /// Request handler shared by every connection
    #[must_use]
    pub fn proxy(&self) -> &Arc<HttpProxy> {
        &self.proxy
    }

    /// Archives opened by cache modifiers
    #[must_use]
    pub fn archives(&self) -> &Arc<ArchivePool> {
        &self.archives
    }

    /// Sender that stops the server when signalled
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind `config.listen` and serve until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound or an archive fails to
    /// close
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until SIGINT or the shutdown handle
    /// fires, then close every archive
    ///
    /// # Errors
    ///
    /// Returns error if an archive fails to close
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let Some(guard) = self.connections.try_acquire() else {
                                warn!("Connection limit reached, rejecting {}", peer_addr);
                                drop(stream);
                                continue;
                            };

                            let proxy = Arc::clone(&self.proxy);
                            tasks.spawn(async move {
                                let _guard = guard;
                                let service = service_fn(move |req| {
                                    let proxy = Arc::clone(&proxy);
                                    async move { Ok::<_, Infallible>(proxy.handle(req).await) }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await
                                {
                                    debug!("Connection from {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
            }
        }

        drop(listener);

        let shutdown_timeout = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        let drained = tokio::time::timeout(shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!("Connection task failed: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("{} connections still open, dropping them", tasks.len());
            tasks.shutdown().await;
        }

        let drain_timeout = Duration::from_millis(self.config.archive.drain_timeout_ms);
        self.archives.close_all(drain_timeout).await?;

        info!("Shutdown complete");
        Ok(())
    }
}
