use relaygate::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use relaygate::config::Config;
use relaygate::healthcheck::{HealthCheckConfig, HealthChecker};
use relaygate::loadbalancer::{build_balancer, BackendObserver};
use relaygate::pool::ServerPool;
use relaygate::proxy::{ProxyHandler, ProxyServer};
use relaygate::session::{SessionConfig, SessionManager};
use relaygate::tls;
use relaygate::upstream::{UpstreamClient, UpstreamConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relaygate=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Pool and strategy
    let strategy = config.balancer.strategy();
    let pool = Arc::new(ServerPool::with_backends(config.backend_entries()));
    let balancer = build_balancer(strategy, Arc::clone(&pool));
    info!(%strategy, backends = pool.count(), "Load balancer ready");

    let upstream = Arc::new(UpstreamClient::new(UpstreamConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
        request_timeout: config.server.request_timeout(),
    }));

    // Sticky sessions, invalidated whenever the balancer marks a backend down
    let sessions = if config.balancer.sticky_sessions {
        let manager = Arc::new(SessionManager::new(SessionConfig {
            ttl: config.balancer.session_ttl(),
            cleanup_interval: config.balancer.session_cleanup_interval(),
        }));
        balancer.add_observer(Arc::clone(&manager) as Arc<dyn BackendObserver>);
        manager.start_cleanup();
        Some(manager)
    } else {
        None
    };

    let health_checker = Arc::new(HealthChecker::new(
        Arc::clone(&balancer),
        Arc::clone(&upstream),
        HealthCheckConfig {
            interval: config.health_check.interval(),
            timeout: config.health_check.timeout(),
            path: config.health_check.path.clone(),
        },
    ));
    health_checker.start();

    let mut handler = ProxyHandler::new(Arc::clone(&balancer), Arc::clone(&upstream))
        .with_max_body_bytes(config.server.max_body_bytes);
    if let Some(ref manager) = sessions {
        handler = handler.with_sessions(Arc::clone(manager));
    }
    let handler = Arc::new(handler);

    let tls_acceptor = tls::build_acceptor(&config.server)?;

    // Proxy server
    let proxy_addr = parse_addr(&config.server.bind, config.server.port, "proxy")?;
    let mut proxy_server = ProxyServer::new(proxy_addr, handler, shutdown_rx.clone())
        .with_header_read_timeout(config.server.header_read_timeout());
    if let Some(ref acceptor) = tls_acceptor {
        proxy_server = proxy_server.with_tls(acceptor.clone());
    }
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Admin server
    let admin_addr = parse_addr(&config.server.bind, config.server.admin_port, "admin")?;
    let admin_state = Arc::new(AdminState {
        balancer: Arc::clone(&balancer),
        health_checker: Arc::clone(&health_checker),
        sessions: sessions.clone(),
        config: Arc::new(config.clone()),
    });
    let mut admin_server = AdminServer::new(admin_addr, admin_state, shutdown_rx.clone())
        .with_header_read_timeout(config.server.header_read_timeout());
    if let Some(ref acceptor) = tls_acceptor {
        admin_server = admin_server.with_tls(acceptor.clone());
    }
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    wait_for_shutdown_signal().await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    health_checker.stop().await;
    if let Some(ref manager) = sessions {
        manager.stop_cleanup().await;
    }

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn parse_addr(bind: &str, port: u16, listener: &str) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, listener, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid {} bind address: {}", listener, e)
    })
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Received Ctrl+C, shutting down...");
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting load balancer");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        https = config.server.enable_https,
        admin_auth = config.server.admin_token.is_some(),
        "Server configuration"
    );
    info!(
        request_timeout_secs = config.server.request_timeout_secs,
        header_read_timeout_secs = config.server.header_read_timeout_secs,
        max_body_bytes = config.server.max_body_bytes,
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Request handling settings"
    );
    info!(
        strategy = %config.balancer.strategy,
        sticky_sessions = config.balancer.sticky_sessions,
        session_ttl_secs = config.balancer.session_ttl_secs,
        "Balancer settings"
    );
    info!(
        interval_secs = config.health_check.interval_secs,
        timeout_secs = config.health_check.timeout_secs,
        path = %config.health_check.path,
        "Health check settings"
    );
    info!(
        backend_count = config.backends.len(),
        backends = ?config.backends,
        "Configured backends"
    );
}
