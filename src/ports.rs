//! Port allocation for new backends and detection of a running dispatcher

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

/// Lowest port handed out to backends by default
pub const DEFAULT_MIN_PORT: u16 = 4000;
/// Highest port handed out to backends by default
pub const DEFAULT_MAX_PORT: u16 = 4999;

/// Random probes before falling back to a sequential scan
const RANDOM_ATTEMPTS: usize = 50;

/// How long a liveness probe waits for a connection
const LISTEN_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum PortError {
    #[error("No free port found in range {min}-{max}")]
    NoFreePort { min: u16, max: u16 },
}

/// Check whether `port` can be bound on all interfaces right now
async fn is_port_free(port: u16) -> bool {
    // The listener is dropped on return, releasing the port
    TcpListener::bind(("0.0.0.0", port)).await.is_ok()
}

/// Find a bindable port in `min..=max`: random probes first, then a scan.
///
/// The port is only known to be free at the moment of the check.
pub async fn find_free_port(min: u16, max: u16) -> Result<u16, PortError> {
    let (min, max) = if min <= max { (min, max) } else { (max, min) };

    for _ in 0..RANDOM_ATTEMPTS {
        let port = rand::thread_rng().gen_range(min..=max);
        if is_port_free(port).await {
            return Ok(port);
        }
    }

    for port in min..=max {
        if is_port_free(port).await {
            return Ok(port);
        }
    }

    Err(PortError::NoFreePort { min, max })
}

/// Check whether something accepts TCP connections on `host:port`.
///
/// Gives up after a short timeout; the probe socket is closed on every path.
pub async fn is_address_listening(port: u16, host: &str) -> bool {
    matches!(
        tokio::time::timeout(LISTEN_PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_free_port_default_range() {
        let port = find_free_port(DEFAULT_MIN_PORT, DEFAULT_MAX_PORT).await.unwrap();
        assert!((DEFAULT_MIN_PORT..=DEFAULT_MAX_PORT).contains(&port));
    }

    #[tokio::test]
    async fn test_found_port_is_bindable() {
        let port = find_free_port(DEFAULT_MIN_PORT, DEFAULT_MAX_PORT).await.unwrap();
        let listener = TcpListener::bind(("0.0.0.0", port)).await;
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn test_custom_range() {
        let port = find_free_port(9000, 9010).await.unwrap();
        assert!((9000..=9010).contains(&port));
    }

    #[tokio::test]
    async fn test_no_free_port_in_occupied_range() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = find_free_port(port, port).await.unwrap_err();
        assert!(err.to_string().contains("No free port found"));
        drop(listener);
    }

    #[tokio::test]
    async fn test_not_listening() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!is_address_listening(port, "127.0.0.1").await);
    }

    #[tokio::test]
    async fn test_listening() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(is_address_listening(port, "127.0.0.1").await);
    }
}
