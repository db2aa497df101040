use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::SettingsHandle;
use crate::gate::Gate;
use crate::operator::Operator;

pub mod routes;

/// Header carrying the remote caller's id
pub const CALLER_HEADER: &str = "x-caller-id";

/// Server state
pub struct AppState {
    pub gate: Gate,
    /// Behind `/remote/*`; `None` unless `remote.enabled` and the allow-list is up
    pub remote: Option<Operator>,
    /// Behind `/admin`; `None` while the allow-list is unavailable
    pub admin: Option<Operator>,
    pub settings: SettingsHandle,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/check", get(routes::check))
        .route("/remote/add", post(routes::remote_add))
        .route("/remote/remove", post(routes::remote_remove))
        .route("/admin", post(routes::admin))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn start_server(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

/// Serve on an already bound listener until ctrl-c.
///
/// While serving, the config and snapshot are re-synced every
/// `remote.refresh_interval_secs` and on SIGHUP, so writes that bypass this
/// process (another proxy on the same MySQL, a CLI run with `--local`) show up.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    tracing::info!("Starting server on {}", listener.local_addr()?);

    let sync = state.admin.clone().map(|operator| {
        let secs = state.settings.read(|s| s.remote.refresh_interval_secs);
        let every = (secs > 0).then(|| Duration::from_secs(secs));
        tokio::spawn(sync_loop(operator, every))
    });

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await;

    if let Some(sync) = sync {
        sync.abort();
    }
    result?;
    tracing::info!("Server stopped");
    Ok(())
}

/// Re-read the config and reload the snapshot on every tick and every SIGHUP.
pub async fn sync_loop(operator: Operator, every: Option<Duration>) {
    let mut ticker = every.map(|period| tokio::time::interval_at(tokio::time::Instant::now() + period, period));
    let mut hangup = hangup_signal();

    loop {
        tokio::select! {
            _ = tick(&mut ticker) => {
                if let Err(e) = operator.sync().await {
                    tracing::warn!("Periodic whitelist sync failed: {}", e);
                }
            }
            _ = wait_hangup(&mut hangup) => {
                tracing::info!("SIGHUP received, reloading");
                if let Err(e) = operator.sync().await {
                    tracing::error!("Reload on SIGHUP failed: {}", e);
                }
            }
        }
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(unix)]
type Hangup = Option<tokio::signal::unix::Signal>;
#[cfg(not(unix))]
type Hangup = Option<()>;

#[cfg(unix)]
fn hangup_signal() -> Hangup {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::hangup()) {
        Ok(signal) => Some(signal),
        Err(e) => {
            tracing::warn!("Cannot listen for SIGHUP: {}", e);
            None
        }
    }
}

#[cfg(not(unix))]
fn hangup_signal() -> Hangup {
    None
}

#[cfg(unix)]
async fn wait_hangup(hangup: &mut Hangup) {
    if let Some(signal) = hangup {
        if signal.recv().await.is_some() {
            return;
        }
        *hangup = None;
    }
    std::future::pending::<()>().await
}

#[cfg(not(unix))]
async fn wait_hangup(_hangup: &mut Hangup) {
    std::future::pending::<()>().await
}
