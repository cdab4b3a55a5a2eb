//! Route type and the accessor seam the dispatcher reads routes through

use serde::{Deserialize, Serialize};

/// A hostname bound to a local backend port, owned by a process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub hostname: String,
    pub port: u16,
    /// Process that registered the route; only used to detect stale entries
    pub pid: u32,
}

impl Route {
    pub fn new(hostname: impl Into<String>, port: u16, pid: u32) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            pid,
        }
    }

    /// Backend origin this route forwards to
    pub fn target(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// Supplies the current set of routes.
///
/// The dispatcher calls this once per request or upgrade and never keeps the
/// result, so implementations decide how fresh the view is. Calls run on the
/// blocking thread pool and may do filesystem I/O.
pub trait RouteSource: Send + Sync {
    fn routes(&self) -> Vec<Route>;
}

/// A fixed list of routes
#[derive(Debug, Clone, Default)]
pub struct StaticRoutes(pub Vec<Route>);

impl RouteSource for StaticRoutes {
    fn routes(&self) -> Vec<Route> {
        self.0.clone()
    }
}

impl<F> RouteSource for F
where
    F: Fn() -> Vec<Route> + Send + Sync,
{
    fn routes(&self) -> Vec<Route> {
        self()
    }
}

/// Find the route for `hostname`. Exact, case-sensitive; the first entry wins
/// if a racing writer left duplicates behind.
pub fn find_route<'a>(routes: &'a [Route], hostname: &str) -> Option<&'a Route> {
    routes.iter().find(|route| route.hostname == hostname)
}
