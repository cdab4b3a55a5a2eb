//! File-backed route registry shared by every process on the machine
//!
//! Routes live in `routes.json` inside the state directory. Every mutation
//! takes the `routes.lock` marker, re-reads the file, and rewrites it whole, so
//! concurrent `add`/`remove` calls from separate processes never lose updates.
//! Readers do not lock: they may briefly see routes of processes that have
//! just died, and those are filtered out by a liveness check on every load.

use crate::error::RegistryError;
use crate::lock::RouteLock;
use crate::process::is_process_alive;
use crate::route::{Route, RouteSource};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const ROUTES_FILE: &str = "routes.json";
pub const LOCK_DIR: &str = "routes.lock";
pub const PID_FILE: &str = "proxy.pid";

/// Default number of lock attempts for add/remove
pub const DEFAULT_LOCK_ATTEMPTS: u32 = 20;
/// Default delay between contended lock attempts
pub const DEFAULT_LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct RouteRegistry {
    dir: PathBuf,
    routes_path: PathBuf,
    lock: RouteLock,
    lock_attempts: u32,
    lock_retry_delay: Duration,
}

impl RouteRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            routes_path: dir.join(ROUTES_FILE),
            lock: RouteLock::new(dir.join(LOCK_DIR)),
            dir,
            lock_attempts: DEFAULT_LOCK_ATTEMPTS,
            lock_retry_delay: DEFAULT_LOCK_RETRY_DELAY,
        }
    }

    /// Set the lock retry budget used by add/remove (builder pattern)
    pub fn with_lock_retry(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.lock_attempts = attempts;
        self.lock_retry_delay = retry_delay;
        self
    }

    /// Set the age after which a lock marker is force-broken (builder pattern)
    pub fn with_stale_lock_after(mut self, stale_after: Duration) -> Self {
        self.lock = self.lock.with_stale_after(stale_after);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn routes_path(&self) -> &Path {
        &self.routes_path
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Where the dispatcher records its PID
    pub fn pid_path(&self) -> PathBuf {
        self.dir.join(PID_FILE)
    }

    /// Create the state directory if needed and make it world-readable
    pub fn ensure_dir(&self) -> Result<(), RegistryError> {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o755);
        }
        builder
            .create(&self.dir)
            .map_err(|source| RegistryError::StateDir {
                path: self.dir.clone(),
                source,
            })?;

        // May fail when another user (e.g. root) owns the directory
        set_mode(&self.dir, 0o755);
        Ok(())
    }

    /// Load the live routes.
    ///
    /// Never fails: a missing file is an empty registry, and a corrupt one is
    /// logged and treated as empty. Routes whose owning process is gone are
    /// dropped from the result.
    ///
    /// `cleanup_stale = true` also writes the filtered list back to disk when
    /// anything was dropped. Only callers holding the route lock may pass
    /// `true`; everyone else must pass `false` and tolerate stale entries on
    /// disk.
    pub fn load(&self, cleanup_stale: bool) -> Vec<Route> {
        let routes = match self.read_routes() {
            Ok(routes) => routes,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable routes file");
                return Vec::new();
            }
        };

        let total = routes.len();
        let alive: Vec<Route> = routes
            .into_iter()
            .filter(|route| is_process_alive(route.pid))
            .collect();

        if cleanup_stale && alive.len() != total {
            match self.persist(&alive) {
                Ok(()) => debug!(removed = total - alive.len(), "Removed stale routes"),
                Err(e) => warn!(error = %e, "Failed to persist stale route cleanup"),
            }
        }

        alive
    }

    /// Register `hostname`, replacing any existing route for it
    pub fn add(&self, hostname: &str, port: u16, pid: u32) -> Result<(), RegistryError> {
        self.mutate(|routes| {
            routes.retain(|route| route.hostname != hostname);
            routes.push(Route::new(hostname, port, pid));
        })?;
        info!(hostname, port, pid, "Route registered");
        Ok(())
    }

    /// Remove the route for `hostname`, if any
    pub fn remove(&self, hostname: &str) -> Result<(), RegistryError> {
        self.mutate(|routes| routes.retain(|route| route.hostname != hostname))?;
        info!(hostname, "Route removed");
        Ok(())
    }

    /// Run a read-modify-write cycle under the route lock.
    ///
    /// The guard is dropped on every path out of this function, so a failed
    /// write never leaves the lock behind.
    fn mutate(&self, apply: impl FnOnce(&mut Vec<Route>)) -> Result<(), RegistryError> {
        self.ensure_dir()?;

        let _guard = self
            .lock
            .lock(self.lock_attempts, self.lock_retry_delay)
            .ok_or_else(|| RegistryError::LockTimeout {
                path: self.lock.path().to_path_buf(),
            })?;

        let mut routes = self.load(true);
        apply(&mut routes);
        self.persist(&routes)
    }

    fn read_routes(&self) -> Result<Vec<Route>, RegistryError> {
        let content = match std::fs::read_to_string(&self.routes_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.corrupt(e.to_string())),
        };

        let value: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| self.corrupt(format!("invalid JSON: {}", e)))?;

        let serde_json::Value::Array(entries) = value else {
            return Err(self.corrupt("expected an array"));
        };

        Ok(entries.into_iter().filter_map(parse_route).collect())
    }

    /// Write the full route list: temp file in the same directory, then rename
    fn persist(&self, routes: &[Route]) -> Result<(), RegistryError> {
        let json = serde_json::to_string_pretty(routes)?;
        let tmp_path = self
            .dir
            .join(format!("{}.{}.tmp", ROUTES_FILE, std::process::id()));

        let result = write_file(&tmp_path, json.as_bytes())
            .and_then(|()| std::fs::rename(&tmp_path, &self.routes_path));
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(RegistryError::Write {
                path: self.routes_path.clone(),
                source: e,
            });
        }

        set_mode(&self.routes_path, 0o644);
        Ok(())
    }

    fn corrupt(&self, reason: impl Into<String>) -> RegistryError {
        RegistryError::Corrupt {
            path: self.routes_path.clone(),
            reason: reason.into(),
        }
    }
}

impl RouteSource for RouteRegistry {
    fn routes(&self) -> Vec<Route> {
        self.load(false)
    }
}

/// Accept an array element only if it has the full route shape
fn parse_route(entry: serde_json::Value) -> Option<Route> {
    match serde_json::from_value::<Route>(entry) {
        Ok(route) if route.port != 0 => Some(route),
        Ok(route) => {
            debug!(hostname = %route.hostname, "Skipping route with port 0");
            None
        }
        Err(e) => {
            debug!(error = %e, "Skipping malformed route entry");
            None
        }
    }
}

fn write_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        debug!(path = %path.display(), error = %e, "Could not change permissions");
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}
