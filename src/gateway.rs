//! Whole-gateway lifecycle: supervised startup, proxying, ordered shutdown

use crate::config::Config;
use crate::pool::ConnectionPool;
use crate::proxy::{ProxyServer, Upstream};
use crate::supervisor::{StartupStatus, Supervisor};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How long the proxy task gets to wind down after shutdown is signaled
const PROXY_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the gateway until `shutdown` completes or the listener fails.
///
/// `shutdown` is watched from the very start, so a request to stop while
/// the backend is still being cleaned up, spawned or polled ends the run
/// right there and the backend group is terminated. The proxy listener is
/// only bound once startup has finished.
pub async fn run_until<F>(
    config: &Config,
    pool: Arc<ConnectionPool>,
    session_secret: String,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let listen_addr = config.server.listen_addr()?;
    tokio::pin!(shutdown);

    // Supervise the backend before accepting any traffic
    let supervisor = Supervisor::new(config.backend.clone(), Arc::clone(&pool))
        .with_session_secret(session_secret);
    let startup = supervisor.start_until(shutdown.as_mut()).await;
    let mut backend = match startup.status {
        StartupStatus::Ready { elapsed } => {
            info!(elapsed_ms = elapsed.as_millis() as u64, "Backend started");
            startup.backend
        }
        StartupStatus::Degraded(e) => {
            warn!(error = %e, "Starting without a ready backend, requests will get 503 until it is reachable");
            startup.backend
        }
        StartupStatus::Interrupted => {
            info!("Shutdown requested during startup, proxy not started");
            return Ok(());
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let upstream = Upstream::new(config.backend.base_url(), config.server.request_timeout());
    let proxy = ProxyServer::new(listen_addr, upstream, Arc::clone(&pool), shutdown_rx);
    let mut proxy_handle = tokio::spawn(proxy.run());

    // Stop on request, or when the listener fails
    let proxy_result = tokio::select! {
        _ = shutdown.as_mut() => None,
        result = &mut proxy_handle => Some(result),
    };

    let _ = shutdown_tx.send(true);

    // Stop the backend group before leaving
    if let Some(ref mut backend) = backend {
        info!(pid = backend.pid(), "Stopping backend...");
        backend.shutdown().await;
    }

    let proxy_result = match proxy_result {
        Some(result) => Some(result),
        None => tokio::time::timeout(PROXY_JOIN_TIMEOUT, &mut proxy_handle)
            .await
            .ok(),
    };

    let stats = pool.stats();
    info!(
        requests = stats.requests(),
        probes = stats.probes(),
        "Shutdown complete"
    );

    match proxy_result {
        Some(Ok(Err(e))) => {
            error!(error = %e, "Proxy server error");
            Err(e)
        }
        Some(Err(e)) => Err(anyhow::anyhow!("Proxy server task failed: {}", e)),
        _ => Ok(()),
    }
}
