//! hostgate - route local apps by hostname through one shared proxy
//!
//! Usage:
//!   hostgate proxy [--port N]                 Run the shared dispatcher
//!   hostgate run <name> <command> [args...]   Run an app as <name>.localhost
//!   hostgate add <hostname> <port> [--pid N]  Register a route by hand (owner: --pid or the calling shell)
//!   hostgate remove <hostname>                Remove a route
//!   hostgate list                             Show active routes
//!
//! Global options:
//!   --config <path>   Config file (default: <state dir>/config.toml if present)

use anyhow::{bail, Context, Result};
use hostgate::config::Config;
use hostgate::dispatcher::Dispatcher;
use hostgate::ports::{self, DEFAULT_MAX_PORT, DEFAULT_MIN_PORT};
use hostgate::process::{parent_pid, stop_child};
use hostgate::registry::RouteRegistry;
use hostgate::route::RouteSource;
use hostgate::{PKG_NAME, VERSION};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// How long `run` lets the app exit after SIGTERM before killing it
const CHILD_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
enum Command {
    Help,
    Version,
    Proxy { port: Option<u16> },
    Run { name: String, command: Vec<String> },
    Add { hostname: String, port: u16, pid: Option<u32> },
    Remove { hostname: String },
    List,
}

#[derive(Debug, PartialEq)]
struct Cli {
    config_path: Option<PathBuf>,
    command: Command,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hostgate=info")),
        )
        .init();

    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_args(&args)?;

    let load_config = || Config::resolve(cli.config_path.as_deref());

    match cli.command {
        Command::Help => print_help(),
        Command::Version => println!("{} {}", PKG_NAME, VERSION),
        Command::Proxy { port } => cmd_proxy(load_config()?, port).await?,
        Command::Run { name, command } => return cmd_run(load_config()?, &name, command).await,
        Command::Add { hostname, port, pid } => {
            let registry = load_config()?.registry.open();
            // Owned by whoever invoked us, not this short-lived process
            let pid = pid.unwrap_or_else(parent_pid);
            with_registry(registry, move |r| r.add(&hostname, port, pid)).await?;
        }
        Command::Remove { hostname } => {
            let registry = load_config()?.registry.open();
            with_registry(registry, move |r| r.remove(&hostname)).await?;
        }
        Command::List => cmd_list(load_config()?.registry.open()).await?,
    }

    Ok(0)
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut config_path = None;
    let mut rest = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        // Options after `run <name>` belong to the app's command line
        if rest.len() >= 2 && rest[0] == "run" {
            rest.push(arg.clone());
            continue;
        }
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().context("--config requires a path")?;
                config_path = Some(PathBuf::from(path));
            }
            _ => rest.push(arg.clone()),
        }
    }

    let command = parse_command(&rest)?;
    Ok(Cli { config_path, command })
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some(first) = args.first() else {
        return Ok(Command::Help);
    };

    let command = match first.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-v" => Command::Version,
        "proxy" => {
            let mut port = None;
            let mut iter = args[1..].iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--port" | "-p" => {
                        let value = iter.next().context("--port requires a value")?;
                        port = Some(parse_port(value)?);
                    }
                    other => bail!("Unknown option for proxy: {}", other),
                }
            }
            Command::Proxy { port }
        }
        "run" => {
            if args.len() < 3 {
                bail!("Usage: hostgate run <name> <command> [args...]");
            }
            Command::Run {
                name: args[1].clone(),
                command: args[2..].to_vec(),
            }
        }
        "add" => {
            if args.len() < 3 {
                bail!("Usage: hostgate add <hostname> <port> [--pid N]");
            }
            let mut pid = None;
            let mut iter = args[3..].iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--pid" => {
                        let value = iter.next().context("--pid requires a value")?;
                        pid = Some(value.parse().with_context(|| format!("Invalid pid: {}", value))?);
                    }
                    other => bail!("Unknown option for add: {}", other),
                }
            }
            Command::Add {
                hostname: args[1].clone(),
                port: parse_port(&args[2])?,
                pid,
            }
        }
        "remove" | "rm" => {
            let hostname = args.get(1).context("Usage: hostgate remove <hostname>")?;
            Command::Remove {
                hostname: hostname.clone(),
            }
        }
        "list" | "ls" | "routes" => Command::List,
        other => bail!("Unknown command: {} (see `hostgate help`)", other),
    };

    Ok(command)
}

fn parse_port(value: &str) -> Result<u16> {
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => bail!("Invalid port: {}", value),
    }
}

/// `<name>.localhost` unless the name already looks like a hostname
fn hostname_for(name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{}.localhost", name)
    }
}

fn print_help() {
    println!(
        "{} {}

Usage:
  hostgate proxy [--port N]                 Run the shared dispatcher
  hostgate run <name> <command> [args...]   Run an app as <name>.localhost
  hostgate add <hostname> <port> [--pid N]  Register a route by hand (owner: --pid or the calling shell)
  hostgate remove <hostname>                Remove a route
  hostgate list                             Show active routes

Options:
  -c, --config <path>   Config file (default: <state dir>/config.toml)

Environment:
  HOSTGATE_STATE_DIR    State directory (default: ~/.hostgate)
  RUST_LOG              Log filter (default: hostgate=info)",
        PKG_NAME, VERSION
    );
}

/// Run a registry operation on the blocking pool; lock retries sleep
async fn with_registry<T, F>(registry: RouteRegistry, op: F) -> Result<T>
where
    F: FnOnce(&RouteRegistry) -> std::result::Result<T, hostgate::error::RegistryError>
        + Send
        + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || op(&registry))
        .await
        .context("Registry task failed")??;
    Ok(result)
}

async fn cmd_list(registry: RouteRegistry) -> Result<()> {
    let routes = tokio::task::spawn_blocking(move || registry.load(false))
        .await
        .context("Registry task failed")?;

    if routes.is_empty() {
        println!("No apps running.");
        return Ok(());
    }

    for route in routes {
        println!("{:<40} -> localhost:{:<5} (pid {})", route.hostname, route.port, route.pid);
    }
    Ok(())
}

async fn cmd_proxy(mut config: Config, port_override: Option<u16>) -> Result<()> {
    if let Some(port) = port_override {
        config.proxy.port = port;
    }
    let port = config.proxy.port;

    if ports::is_address_listening(port, "127.0.0.1").await {
        bail!("A proxy is already running on port {}", port);
    }

    let registry = Arc::new(config.registry.open());
    registry.ensure_dir()?;

    let pid_path = registry.pid_path();
    let _pid_file = PidFile::create(&pid_path)?;
    info!(path = %pid_path.display(), "PID file written and locked");

    let active_routes = {
        let registry = Arc::clone(&registry);
        tokio::task::spawn_blocking(move || registry.load(false).len())
            .await
            .context("Registry task failed")?
    };
    print_startup_banner(&config, &registry, active_routes);

    let tls_acceptor = if config.proxy.tls_enabled() {
        Some(build_tls_acceptor(&config)?)
    } else {
        None
    };

    let bind_addr: SocketAddr = format!("{}:{}", config.proxy.bind, port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.proxy.bind, port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let routes: Arc<dyn RouteSource> = registry.clone();
    let mut dispatcher = Dispatcher::new(bind_addr, routes, shutdown_rx)
        .with_pool_config(config.proxy.pool_config())
        .with_request_timeout(config.proxy.request_timeout());
    if let Some(acceptor) = tls_acceptor {
        dispatcher = dispatcher.with_tls(acceptor);
    }

    let mut server = tokio::spawn(dispatcher.run());

    let exited = tokio::select! {
        result = &mut server => Some(result),
        signal = shutdown_signal() => {
            signal?;
            None
        }
    };

    let result = match exited {
        Some(result) => result.context("Dispatcher task panicked").and_then(|r| r),
        None => {
            let _ = shutdown_tx.send(true);
            if tokio::time::timeout(Duration::from_secs(5), server).await.is_err() {
                warn!("Dispatcher did not stop within 5s");
            }
            Ok(())
        }
    };

    if let Err(e) = std::fs::remove_file(&pid_path) {
        warn!(path = %pid_path.display(), error = %e, "Failed to remove PID file");
    }

    info!("Shutdown complete");
    result
}

async fn cmd_run(config: Config, name: &str, command: Vec<String>) -> Result<i32> {
    let hostname = hostname_for(name);
    let proxy_port = config.proxy.port;

    if !ports::is_address_listening(proxy_port, "127.0.0.1").await {
        warn!(port = proxy_port, "No proxy is listening; start one with `hostgate proxy`");
    }

    let port = ports::find_free_port(DEFAULT_MIN_PORT, DEFAULT_MAX_PORT).await?;
    let pid = std::process::id();

    let registry = config.registry.open();
    let host = hostname.clone();
    with_registry(registry.clone(), move |r| r.add(&host, port, pid)).await?;

    let url = if proxy_port == 80 {
        format!("http://{}", hostname)
    } else {
        format!("http://{}:{}", hostname, proxy_port)
    };
    info!(hostname, port, url = %url, "App registered");

    let outcome = supervise(&command, port).await;

    let host = hostname.clone();
    if let Err(e) = with_registry(registry, move |r| r.remove(&host)).await {
        warn!(hostname, error = %e, "Failed to remove route; it will be cleaned up once this process exits");
    }

    outcome
}

/// Run the app with PORT set until it exits or we are asked to stop
async fn supervise(command: &[String], port: u16) -> Result<i32> {
    let (program, args) = command.split_first().context("No command given")?;

    let mut child = tokio::process::Command::new(program)
        .args(args)
        .env("PORT", port.to_string())
        .env("HOST", "127.0.0.1")
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start {}", program))?;
    info!(command = %program, pid = child.id().unwrap_or(0), port, "App started");

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        signal = shutdown_signal() => {
            signal?;
            None
        }
    };

    match exited {
        Some(status) => {
            let status = status.context("Failed to wait for app")?;
            info!(?status, "App exited");
            Ok(status.code().unwrap_or(1))
        }
        None => {
            stop_child(&mut child, CHILD_GRACE_PERIOD).await;
            Ok(130)
        }
    }
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                bail!("Another proxy is already running (PID file {} is locked)", path.display());
            }
            return Err(err.into());
        }

        // Truncate only once the lock is ours
        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config, registry: &RouteRegistry, active_routes: usize) {
    info!(name = PKG_NAME, version = VERSION, "Starting dispatcher");
    info!(
        bind = %config.proxy.bind,
        port = config.proxy.port,
        tls = config.proxy.tls_enabled(),
        "Listener configuration"
    );
    info!(
        pool_max_idle = config.proxy.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.proxy.pool_idle_timeout_secs,
        request_timeout_secs = config.proxy.request_timeout_secs,
        "Forwarding settings"
    );
    info!(
        state_dir = %registry.dir().display(),
        routes = active_routes,
        "Route registry"
    );
}

fn build_tls_acceptor(config: &Config) -> Result<TlsAcceptor> {
    let (certs, key) = match (&config.proxy.tls_cert, &config.proxy.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");
            (certs, key)
        }
        _ => {
            let pair = generate_self_signed_cert()?;
            warn!("TLS enabled with auto-generated self-signed certificate");
            pair
        }
    };

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}

fn generate_self_signed_cert() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    // Wildcards cover one label; each app name is one label under .localhost
    let subject_alt_names = vec![
        "localhost".to_string(),
        "*.localhost".to_string(),
        "127.0.0.1".to_string(),
    ];

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok((vec![cert_der], key_der))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_empty_is_help() {
        assert_eq!(parse_args(&[]).unwrap().command, Command::Help);
    }

    #[test]
    fn test_parse_proxy_with_port_and_config() {
        let cli = parse_args(&args(&["--config", "/tmp/c.toml", "proxy", "--port", "8080"])).unwrap();
        assert_eq!(cli.config_path, Some(PathBuf::from("/tmp/c.toml")));
        assert_eq!(cli.command, Command::Proxy { port: Some(8080) });
    }

    #[test]
    fn test_parse_run_keeps_app_options() {
        let cli = parse_args(&args(&["run", "api", "node", "server.js", "--config", "x"])).unwrap();
        assert_eq!(cli.config_path, None);
        assert_eq!(
            cli.command,
            Command::Run {
                name: "api".to_string(),
                command: args(&["node", "server.js", "--config", "x"]),
            }
        );
    }

    #[test]
    fn test_parse_add() {
        let cli = parse_args(&args(&["add", "api.localhost", "4123", "--pid", "99"])).unwrap();
        assert_eq!(
            cli.command,
            Command::Add {
                hostname: "api.localhost".to_string(),
                port: 4123,
                pid: Some(99),
            }
        );

        assert!(parse_args(&args(&["add", "api.localhost", "0"])).is_err());
        assert!(parse_args(&args(&["add", "api.localhost", "70000"])).is_err());
    }

    #[test]
    fn test_parse_unknown_command() {
        assert!(parse_args(&args(&["frobnicate"])).is_err());
    }

    #[test]
    fn test_hostname_for() {
        assert_eq!(hostname_for("api"), "api.localhost");
        assert_eq!(hostname_for("api.example.test"), "api.example.test");
    }
}
