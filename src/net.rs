//! UDP socket setup for the bridge.
//!
//! One socket is bound per session and split via `try_clone` into a send
//! handle (owned by the relay) and a receive handle (owned by the receiver
//! task). The peer replies to the source address of our datagrams, so both
//! directions must share one local port.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Receive timeout; bounds how long the receiver needs to observe a stop
/// request.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// OS-level socket buffer target, sized to absorb peer-side bursts.
const SOCKET_BUFFER_BYTES: usize = 1024 * 1024;

/// Bidirectional UDP endpoint of the bridge.
pub struct BridgeSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl BridgeSocket {
    /// Bind to `local_addr` (port 0 = auto-assign) with address reuse,
    /// enlarged OS buffers and a short receive timeout.
    pub fn bind(local_addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

        // Reuse lets a restarted session grab the port immediately.
        socket.set_reuse_address(true)?;
        socket.bind(&local_addr.into())?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        // Best effort; the kernel may clamp these.
        let _ = socket.set_recv_buffer_size(SOCKET_BUFFER_BYTES);
        let _ = socket.set_send_buffer_size(SOCKET_BUFFER_BYTES);

        let socket: UdpSocket = socket.into();
        let local_addr = socket.local_addr()?;

        Ok(Self { socket, local_addr })
    }

    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr)
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    /// The bound local address (with the auto-assigned port resolved).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    /// Second handle onto the same OS socket, for the other thread.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            socket: self.socket.try_clone()?,
            local_addr: self.local_addr,
        })
    }
}

impl std::fmt::Debug for BridgeSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeSocket")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn any_port() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn test_bind_assigns_port() {
        let socket = BridgeSocket::bind(any_port()).unwrap();
        assert_ne!(socket.local_addr().port(), 0);
    }

    #[test]
    fn test_clone_shares_the_port() {
        let socket = BridgeSocket::bind(any_port()).unwrap();
        let clone = socket.try_clone().unwrap();
        assert_eq!(socket.local_addr(), clone.local_addr());
    }

    #[test]
    fn test_send_and_receive_roundtrip() {
        let a = BridgeSocket::bind(any_port()).unwrap();
        let b = BridgeSocket::bind(any_port()).unwrap();

        a.send_to(b"ping", b.local_addr()).unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr());
    }

    #[test]
    fn test_recv_times_out() {
        let socket = BridgeSocket::bind(any_port()).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();

        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert!(
            err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut,
            "unexpected error kind: {:?}",
            err.kind()
        );
    }
}
