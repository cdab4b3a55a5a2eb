//! Connection pool for backend HTTP connections
//!
//! All backends live on 127.0.0.1, so one pooled client serves every route;
//! connections are keyed by port inside the client.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl PoolError {
    /// True when the backend port actively refused the TCP connection
    pub fn is_connection_refused(&self) -> bool {
        let PoolError::Client(err) = self else {
            return false;
        };

        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(e) = source {
            if let Some(io) = e.downcast_ref::<std::io::Error>() {
                return io.kind() == ErrorKind::ConnectionRefused;
            }
            source = e.source();
        }
        false
    }
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Client(e) => Some(e),
            PoolError::RequestBuild(_) => None,
        }
    }
}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to backend servers
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self { client, config }
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Send a request to the backend on `127.0.0.1:port`.
    ///
    /// Headers, including the original Host, are passed through unchanged.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = format!(
            "http://127.0.0.1:{}{}",
            port,
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let response = self.client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let config = PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        };

        let pool = ConnectionPool::new(config);
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.config().idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_request_build_error_is_not_refused() {
        let err = PoolError::RequestBuild("bad uri".to_string());
        assert!(!err.is_connection_refused());
        assert_eq!(err.to_string(), "Request build error: bad uri");
    }
}
