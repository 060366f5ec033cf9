//! Socket helpers shared by the relay roles

use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::RelayError;

/// Normalize a listen address; the shorthand `":PORT"` means all interfaces
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Resolve `addr` to socket addresses
async fn resolve(addr: &str) -> std::io::Result<Vec<SocketAddr>> {
    let resolved: Vec<SocketAddr> = lookup_host(addr).await?.collect();
    if resolved.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses resolved for {}", addr),
        ));
    }
    Ok(resolved)
}

/// Bind a listener with address reuse and an explicit accept backlog
pub async fn bind_listener(addr: &str, backlog: u32) -> Result<TcpListener, RelayError> {
    let addr = normalize_bind_addr(addr);
    let candidates = resolve(&addr)
        .await
        .map_err(|e| RelayError::bind(&addr, e))?;

    let mut last_error = None;
    for candidate in candidates {
        match listen_on(candidate, backlog) {
            Ok(listener) => {
                debug!("Bound listener on {}", candidate);
                return Ok(listener);
            }
            Err(e) => {
                warn!("Failed to bind {}: {}", candidate, e);
                last_error = Some(e);
            }
        }
    }

    Err(RelayError::bind(
        &addr,
        last_error.unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::AddrNotAvailable)),
    ))
}

fn listen_on(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Connect to `addr`, trying every resolved address within `connect_timeout` each
pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<TcpStream, RelayError> {
    let candidates = match timeout(connect_timeout, resolve(addr)).await {
        Ok(Ok(candidates)) => candidates,
        Ok(Err(e)) => return Err(RelayError::connect(addr, e)),
        Err(_) => {
            return Err(RelayError::connect(
                addr,
                std::io::Error::new(std::io::ErrorKind::TimedOut, "name resolution timed out"),
            ))
        }
    };

    let mut last_error = None;
    for candidate in candidates {
        match timeout(connect_timeout, TcpStream::connect(candidate)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY on {}: {}", candidate, e);
                }
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!("Failed to connect to {}: {}", candidate, e);
                last_error = Some(e);
            }
            Err(_) => {
                debug!("Connection to {} timed out", candidate);
                last_error = Some(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connection timed out",
                ));
            }
        }
    }

    Err(RelayError::connect(
        addr,
        last_error.unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::AddrNotAvailable)),
    ))
}
