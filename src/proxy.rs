//! Proxy Factory — accepts client connections and hands each one a handle
//! to the single, lazily-dialed backend session they all share.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::backend::{self, BackendHandle};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Holds the one backend connection all clients of this proxy instance are
/// multiplexed onto, dialing it lazily on the first client and re-dialing
/// if the backend session has since died.
///
/// Concurrent first connections race for `backend` rather than the dial
/// itself: the loser simply finds the winner's handle already cached once
/// it acquires the lock, so only one dial ever happens at a time.
pub struct ProxyFactory {
    upstream_addr: String,
    backend: Mutex<Option<BackendHandle>>,
}

impl ProxyFactory {
    pub fn new(upstream_addr: impl Into<String>) -> Self {
        Self {
            upstream_addr: upstream_addr.into(),
            backend: Mutex::new(None),
        }
    }

    async fn backend_handle(&self) -> Result<BackendHandle> {
        let mut guard = self.backend.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_dead() {
                return Ok(handle.clone());
            }
            tracing::info!("cached backend session is dead, re-dialing");
        }

        tracing::info!(upstream = %self.upstream_addr, "dialing upstream backend");
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&self.upstream_addr))
            .await
            .map_err(|_| ProxyError::UpstreamDialTimeout)??;
        let handle = backend::spawn(stream).await;
        *guard = Some(handle.clone());
        Ok(handle)
    }

    /// Sends a synthetic `Terminate` to the backend, if one has been dialed,
    /// and lets the backend session close the connection. Called only on
    /// factory shutdown; a factory that never saw a client never dialed a
    /// backend, so there is nothing to terminate.
    pub async fn shutdown(&self) {
        let guard = self.backend.lock().await;
        if let Some(handle) = guard.as_ref() {
            tracing::info!("sending terminate to backend session");
            handle.terminate().await;
        }
    }
}

/// Binds `config.listen_addr`, spawns the accept loop in the background and
/// returns the [`ProxyFactory`] driving it, so the caller can hold onto it
/// to shut the backend connection down later.
pub async fn run_proxy_factory(config: ProxyConfig) -> Result<Arc<ProxyFactory>> {
    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(
        listen = %config.listen_addr,
        upstream = %config.upstream_addr,
        "pgtestproxy listening"
    );

    let factory = Arc::new(ProxyFactory::new(config.upstream_addr));
    let accept_factory = factory.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(listener, accept_factory).await {
            tracing::warn!(error = %e, "accept loop ended");
        }
    });
    Ok(factory)
}

/// Runs the accept loop over an already-bound listener until it errors,
/// spawning one client session task per connection. Split out from
/// [`run_proxy_factory`] so tests can bind to an ephemeral port, learn its
/// address, and drive the loop directly.
pub async fn serve(listener: TcpListener, factory: Arc<ProxyFactory>) -> Result<()> {
    let next_id = Arc::new(AtomicU64::new(1));

    loop {
        let (socket, peer) = listener.accept().await?;
        let factory = factory.clone();
        let id = next_id.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            tracing::debug!(client_id = id, peer = %peer, "client connected");
            match factory.backend_handle().await {
                Ok(handle) => crate::client::run(id, socket, handle).await,
                Err(e) => {
                    tracing::warn!(client_id = id, error = %e, "could not reach upstream backend")
                }
            }
        });
    }
}
