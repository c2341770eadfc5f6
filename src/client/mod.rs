//! Client mode
//!
//! Listens for local SOCKS4/4A, SOCKS5 and HTTP proxy clients and dials each
//! requested target directly or through the remote tunnel server.

mod dispatch;

pub use dispatch::{Dispatcher, Sniffed};

use crate::ca::{CaSettings, CertificateAuthority};
use crate::config::Config;
use crate::diagnostics;
use crate::helper::duration_from_secs;
use crate::http::{HttpProxy, PathRedirects, SessionEvent, SessionLog};
use crate::rules::{HostMapping, LocalOnlyList, LocalOnlyWatcher};
use crate::stream::SharedStream;
use crate::transport::{Dialer, SocketOpts};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Bound client listener with its shared state
pub struct Client {
    config: Config,
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    local_only: Arc<LocalOnlyList>,
    _local_only_watcher: Option<LocalOnlyWatcher>,
    sessions: Option<mpsc::Receiver<SessionEvent>>,
}

impl Client {
    /// Build the rule tables, dialer and HTTP engine and bind the listener
    pub async fn bind(config: Config) -> Result<Self> {
        let rules = &config.rules;
        let mapping = Arc::new(HostMapping::new(rules.host_mapping.clone()));
        let local_only = Arc::new(LocalOnlyList::new(
            &rules.local_only,
            rules.local_only_file.clone(),
        )?);
        let dialer = Dialer::from_config(&config, mapping, local_only.clone())?;
        let local_only_watcher = match LocalOnlyWatcher::spawn(local_only.clone()) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("Local-only file will only reload on SIGHUP: {:#}", e);
                None
            }
        };

        let (session_log, sessions) = if config.session.enabled {
            let (log, rx) = SessionLog::channel(config.session.channel_capacity);
            (log, Some(rx))
        } else {
            (SessionLog::disabled(), None)
        };

        let http = if config.http.enabled {
            let ca = Arc::new(CertificateAuthority::new(
                &config.certs.cache_dir,
                CaSettings {
                    wildcard: config.certs.wildcard,
                    cache_capacity: config.certs.cache_capacity,
                    leaf_validity_days: config.certs.leaf_validity_days,
                },
            ));
            if config.http.decrypt_https {
                ca.ensure_root()
                    .await
                    .context("Failed to prepare the root certificate")?;
                info!(
                    "HTTPS decryption enabled; root certificate at {}",
                    config.http.cert_download_url()
                );
            }
            let redirects = Arc::new(PathRedirects::new(&rules.redirect)?);
            Some(Arc::new(HttpProxy::new(
                config.http.clone(),
                dialer.clone(),
                ca,
                redirects,
                session_log,
            )))
        } else {
            None
        };

        let listener = TcpListener::bind(config.listen.as_str())
            .await
            .with_context(|| format!("Failed to listen on {}", config.listen))?;

        Ok(Client {
            dispatcher: Arc::new(Dispatcher::new(dialer, http)),
            config,
            listener,
            local_only,
            _local_only_watcher: local_only_watcher,
            sessions,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Local-only list shared with the dialer, for reloads
    pub fn local_only(&self) -> Arc<LocalOnlyList> {
        self.local_only.clone()
    }

    /// Accept connections until shutdown
    ///
    /// Connections already accepted keep running after this returns.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);
        match &self.config.tunnel {
            Some(tunnel) => info!("Relaying through {}", tunnel.remote_addr),
            None => info!("Dialing targets directly"),
        }

        if let Some(rx) = self.sessions.take() {
            SessionLog::drain(rx, shutdown_rx.resubscribe());
        }
        diagnostics::spawn(
            duration_from_secs(self.config.diagnostics_interval),
            shutdown_rx.resubscribe(),
        );

        let opts = SocketOpts::for_accepted();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    if let Err(e) = opts.apply(&stream) {
                        debug!("Failed to set socket options for {}: {}", peer, e);
                    }
                    debug!("Accepted {}", peer);
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(e) = dispatcher.dispatch(SharedStream::wrap(stream)).await {
                            warn!("{}: {:#}", peer, e);
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping listener");
                    break;
                }
            }
        }

        info!("Client stopped");
        Ok(())
    }
}

/// Run client mode with the given configuration
pub async fn run_client(config: Config, shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
    Client::bind(config).await?.run(shutdown_rx).await
}
