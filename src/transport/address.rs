//! Endpoint addresses and pipe name generation.

use std::fmt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Where a server listens or a client connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// A TCP host and port.
    Tcp {
        /// Host name or IP address.
        host: String,
        /// Port (0 asks the OS for a free port when listening).
        port: u16,
    },
    /// A Unix domain socket path, or a named pipe on Windows.
    Pipe(PathBuf),
}

impl Address {
    /// TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Address::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Unix socket path / named pipe endpoint.
    pub fn pipe(path: impl Into<PathBuf>) -> Self {
        Address::Pipe(path.into())
    }

    /// The socket path or pipe name, if this is a pipe address.
    pub fn as_pipe(&self) -> Option<&Path> {
        match self {
            Address::Pipe(path) => Some(path),
            Address::Tcp { .. } => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } => write!(f, "{host}:{port}"),
            Address::Pipe(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<PathBuf> for Address {
    fn from(path: PathBuf) -> Self {
        Address::Pipe(path)
    }
}

impl From<&Path> for Address {
    fn from(path: &Path) -> Self {
        Address::Pipe(path.to_path_buf())
    }
}

/// Generate a fresh, collision-resistant pipe address for `app`.
///
/// Format:
/// - Unix: `<temp dir>/<app>-ipc-<uuid>.sock`
/// - Windows: `\\.\pipe\<app>-ipc-<uuid>-sock`
///
/// Every call draws a new random v4 UUID.
pub fn generate_pipe_path(app: &str) -> PathBuf {
    let id = Uuid::new_v4();

    #[cfg(windows)]
    {
        PathBuf::from(format!(r"\\.\pipe\{app}-ipc-{id}-sock"))
    }

    #[cfg(not(windows))]
    {
        std::env::temp_dir().join(format!("{app}-ipc-{id}.sock"))
    }
}
