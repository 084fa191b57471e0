use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

const IPC_DIR: &str = "/tmp/fanout";

/// Address a ZeroMQ link binds to or connects to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Endpoint {
    /// Inter-process communication via Unix domain sockets, holding the
    /// socket path. Fastest option when coordinator and executors share a host.
    Ipc(String),

    /// TCP for executors spread over several machines.
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// Create an IPC endpoint with the given socket name.
    ///
    /// The socket lives at `/tmp/fanout/{name}.sock`.
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(format!("{IPC_DIR}/{name}.sock"))
    }

    /// Create an IPC endpoint at an explicit socket path.
    pub fn ipc_path(path: impl Into<String>) -> Self {
        Self::Ipc(path.into())
    }

    /// Create a TCP endpoint with the given host and port.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse `ipc:///any/path.sock`, `ipc://name` or `tcp://host:port`.
    ///
    /// An absolute IPC path is kept as given; a bare name is placed under
    /// `/tmp/fanout/`.
    pub fn parse(endpoint: &str) -> Result<Self, TransportError> {
        if let Some(path) = endpoint.strip_prefix("ipc://") {
            if path.is_empty() || path.ends_with('/') {
                return Err(TransportError::Transport(format!(
                    "ipc endpoint without a name: {endpoint}"
                )));
            }
            if path.starts_with('/') {
                Ok(Self::ipc_path(path))
            } else {
                Ok(Self::ipc(path))
            }
        } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
            let (host, port_str) = addr.rsplit_once(':').ok_or_else(|| {
                TransportError::Transport(format!("tcp endpoint without a port: {endpoint}"))
            })?;
            let port = port_str.parse().map_err(|_| {
                TransportError::Transport(format!("invalid tcp port in endpoint: {endpoint}"))
            })?;
            Ok(Self::tcp(host, port))
        } else {
            Err(TransportError::Transport(format!(
                "unsupported endpoint scheme: {endpoint}"
            )))
        }
    }

    /// Generate the ZeroMQ endpoint address string.
    pub fn address(&self) -> String {
        match self {
            Self::Ipc(path) => format!("ipc://{path}"),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    /// For IPC endpoints, ensure the parent directory exists.
    ///
    /// ZeroMQ requires the directory to exist before binding an IPC socket.
    /// This is a no-op for TCP endpoints.
    pub fn ensure_ipc_dir(&self) -> std::io::Result<()> {
        if let Self::Ipc(path) = self {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Remove a stale IPC socket file left over from a previous run.
    ///
    /// If the process exits without cleanup the `.sock` file persists and
    /// causes `EADDRINUSE` on the next bind.
    pub fn remove_stale_socket(&self) -> std::io::Result<()> {
        if let Self::Ipc(path) = self {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    tracing::debug!(path = %path, "removed stale IPC socket");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_address() {
        let e = Endpoint::ipc("coordinator");
        assert_eq!(e.address(), "ipc:///tmp/fanout/coordinator.sock");
    }

    #[test]
    fn tcp_address() {
        let e = Endpoint::tcp("127.0.0.1", 5900);
        assert_eq!(e.address(), "tcp://127.0.0.1:5900");
        assert_eq!(e.to_string(), e.address());
    }

    #[test]
    fn parse_accepts_both_schemes() {
        assert_eq!(
            Endpoint::parse("tcp://10.0.0.5:6000").unwrap(),
            Endpoint::tcp("10.0.0.5", 6000)
        );
        assert_eq!(
            Endpoint::parse("ipc:///tmp/fanout/vis.sock").unwrap(),
            Endpoint::ipc("vis")
        );
    }

    #[test]
    fn parse_keeps_ipc_paths_outside_the_default_dir() {
        let e = Endpoint::parse("ipc:///var/run/x.sock").unwrap();
        assert_eq!(e, Endpoint::ipc_path("/var/run/x.sock"));
        assert_eq!(e.address(), "ipc:///var/run/x.sock");
        assert_eq!(
            Endpoint::parse("ipc://fanout").unwrap().address(),
            "ipc:///tmp/fanout/fanout.sock"
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Endpoint::parse("ipc://").is_err());
        assert!(Endpoint::parse("ipc:///tmp/").is_err());
        assert!(Endpoint::parse("udp://host:1").is_err());
        assert!(Endpoint::parse("tcp://host").is_err());
        assert!(Endpoint::parse("tcp://host:notaport").is_err());
    }
}
