use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use spotbook::net;
use spotbook::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use spotbook::tenant::TenantManager;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Server settings, all from `SPOTBOOK_*` environment variables.
struct Settings {
    bind: String,
    port: u16,
    data_dir: PathBuf,
    password: String,
    max_connections: usize,
    compact_threshold: u64,
    metrics_port: Option<u16>,
    tls_cert: Option<String>,
    tls_key: Option<String>,
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    var(key).and_then(|s| s.parse().ok())
}

impl Settings {
    fn from_env() -> Self {
        Self {
            bind: var("SPOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed("SPOTBOOK_PORT").unwrap_or(5433),
            data_dir: var("SPOTBOOK_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: var("SPOTBOOK_PASSWORD").unwrap_or_else(|| "spotbook".into()),
            max_connections: parsed("SPOTBOOK_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed("SPOTBOOK_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parsed("SPOTBOOK_METRICS_PORT"),
            tls_cert: var("SPOTBOOK_TLS_CERT"),
            tls_key: var("SPOTBOOK_TLS_KEY"),
        }
    }
}

/// Resolves on SIGTERM or ctrl-c.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!("no SIGTERM handler ({e}), waiting for ctrl-c only"),
        }
    }
    tokio::signal::ctrl_c().await.ok();
}

/// Wait until every connection permit is back, or the timeout passes.
async fn drain(semaphore: &Semaphore, max_connections: usize) {
    let all_back = async {
        while semaphore.available_permits() < max_connections {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, all_back).await {
        Ok(()) => info!("all connections drained"),
        Err(_) => warn!(
            "drain timeout, {} connections still open",
            max_connections - semaphore.available_permits()
        ),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env();
    spotbook::observability::init(settings.metrics_port)?;
    let tls_acceptor =
        net::load_tls_acceptor(settings.tls_cert.as_deref(), settings.tls_key.as_deref())?;
    std::fs::create_dir_all(&settings.data_dir)?;

    let tenant_manager = Arc::new(TenantManager::new(
        settings.data_dir.clone(),
        settings.compact_threshold,
    ));
    let semaphore = Arc::new(Semaphore::new(settings.max_connections));

    let addr = format!("{}:{}", settings.bind, settings.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        "spotbook listening on {addr} (data_dir {}, max_connections {}, compact_threshold {}, tls {})",
        settings.data_dir.display(),
        settings.max_connections,
        settings.compact_threshold,
        if tls_acceptor.is_some() { "on" } else { "off" }
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept error: {e}");
                    continue;
                }
            },
            _ = &mut shutdown => {
                info!("shutdown signal received, no longer accepting");
                break;
            }
        };

        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            warn!("connection limit reached, rejecting {peer}");
            metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
            continue;
        };

        metrics::counter!(CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        let tm = tenant_manager.clone();
        let password = settings.password.clone();
        let tls = tls_acceptor.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = net::process_connection(socket, tm, password, tls).await {
                error!("connection error from {peer}: {e}");
            }
            metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        });
    }

    drain(&semaphore, settings.max_connections).await;
    tenant_manager.shutdown().await;
    info!("spotbook stopped");
    Ok(())
}
