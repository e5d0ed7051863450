//! Plain TCP transport: dialing and a shutdown-aware accept loop.

use std::io;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::CoreError;

/// Dial `addr`, tuning the socket for low latency the way the rest of this
/// crate's ancestry always has: disable Nagle's algorithm and size the
/// kernel buffers explicitly rather than trust the platform default.
pub async fn connect(addr: &str, buffer_size: usize) -> Result<TcpStream, CoreError> {
    let stream = TcpStream::connect(addr).await.map_err(dial_err)?;
    tune(&stream, buffer_size)
}

/// Classify a failed dial (spec.md §7: "Transient (connect refused,
/// timeout) — reported by `start` with `retry=true`"). Everything that
/// looks like "the peer wasn't there" is retryable; anything else is
/// treated as a hard I/O fault. Restricted to `ErrorKind` variants stable
/// since this crate's MSRV (1.70).
fn dial_err(e: io::Error) -> CoreError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::TimedOut
        | io::ErrorKind::AddrNotAvailable => CoreError::transient(e.to_string()),
        _ => CoreError::Io(e),
    }
}

fn tune(stream: &TcpStream, buffer_size: usize) -> Result<TcpStream, CoreError> {
    let peer = stream.peer_addr().ok();
    let std_stream = stream
        .into_std()
        .map_err(CoreError::Io)?;
    let socket = socket2::Socket::from(std_stream.try_clone().map_err(CoreError::Io)?);
    socket.set_nodelay(true).map_err(CoreError::Io)?;
    socket.set_recv_buffer_size(buffer_size).map_err(CoreError::Io)?;
    socket.set_send_buffer_size(buffer_size).map_err(CoreError::Io)?;
    debug!(?peer, buffer_size, "tuned tcp socket");
    TcpStream::from_std(std_stream).map_err(CoreError::Io)
}

/// Binds one TCP address and hands off each accepted connection, tuned the
/// same way as the dialer side.
pub struct Listener {
    listener: TcpListener,
    local_addr: String,
    buffer_size: usize,
}

impl Listener {
    pub async fn bind(addr: &str, buffer_size: usize) -> Result<Self, CoreError> {
        let listener = TcpListener::bind(addr).await.map_err(CoreError::Io)?;
        let local_addr = listener.local_addr().map_err(CoreError::Io)?.to_string();
        Ok(Listener {
            listener,
            local_addr,
            buffer_size,
        })
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Accept connections until `stop_rx` fires, pushing each tuned stream
    /// and its remote address onto `accepted`. Uses a short accept
    /// deadline (spec.md §4.7: "~50 ms") so the shutdown signal is checked
    /// promptly even with no incoming traffic.
    pub async fn run(
        self,
        mut stop_rx: watch::Receiver<bool>,
        accepted: mpsc::Sender<(TcpStream, String)>,
    ) {
        loop {
            if *stop_rx.borrow() {
                return;
            }
            tokio::select! {
                biased;
                _ = stop_rx.changed() => return,
                result = tokio::time::timeout(Duration::from_millis(50), self.listener.accept()) => {
                    match result {
                        Ok(Ok((stream, remote))) => {
                            match self.tune_accepted(stream) {
                                Ok(stream) => {
                                    if accepted.send((stream, remote.to_string())).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => warn!(error = %e, "failed to tune accepted socket"),
                            }
                        }
                        Ok(Err(e)) => warn!(error = %e, "tcp accept failed"),
                        Err(_) => {} // deadline elapsed; loop back and recheck stop_rx
                    }
                }
            }
        }
    }

    fn tune_accepted(&self, stream: TcpStream) -> Result<TcpStream, CoreError> {
        tune(&stream, self.buffer_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_refused_is_classified_transient_and_retryable() {
        let err = dial_err(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(matches!(err, CoreError::Transient { retry: true, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn timed_out_is_classified_transient_and_retryable() {
        let err = dial_err(io::Error::from(io::ErrorKind::TimedOut));
        assert!(err.is_retryable());
    }

    #[test]
    fn other_io_errors_stay_non_retryable() {
        let err = dial_err(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, CoreError::Io(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn connect_to_unreachable_port_is_retryable() {
        // Nothing listens on port 1; the OS refuses the connection
        // immediately, exercising the same path `Manager`'s retry budget
        // relies on (spec.md §8 scenario 5).
        let err = connect("127.0.0.1:1", 4096).await.unwrap_err();
        assert!(err.is_retryable(), "expected a retryable error, got {err:?}");
    }
}
