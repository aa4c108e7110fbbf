use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use super::Transport;

/// Receive mode currently configured on the socket.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Mode {
    NonBlocking,
    Timeout(Duration),
}

/// UDP socket, either sending to a fixed destination (master) or bound to a
/// listen port (slave).
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    dest: Option<SocketAddr>,
    mode: Option<Mode>,
}

impl UdpTransport {
    /// Opens a sending socket aimed at `host:port`.
    ///
    /// Broadcast is enabled so `255.255.255.255` or a subnet broadcast address
    /// can be used as the destination.
    pub fn sender(host: &str, port: u16) -> io::Result<Self> {
        let dest = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}:{port}"))
        })?;

        let bind: SocketAddr = match dest {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind)?;
        if dest.is_ipv4() {
            socket.set_broadcast(true)?;
        }

        Ok(Self {
            socket,
            dest: Some(dest),
            mode: None,
        })
    }

    /// Binds a receiving socket on every IPv4 interface at `port`.
    ///
    /// Port 0 picks an ephemeral port; see [`UdpTransport::local_addr`].
    pub fn listener(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        Ok(Self {
            socket,
            dest: None,
            mode: None,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Destination of a sending transport.
    pub fn dest(&self) -> Option<SocketAddr> {
        self.dest
    }

    fn set_mode(&mut self, wait: Duration) -> io::Result<()> {
        let mode = if wait.is_zero() {
            Mode::NonBlocking
        } else {
            Mode::Timeout(wait)
        };
        if self.mode == Some(mode) {
            return Ok(());
        }

        match mode {
            Mode::NonBlocking => self.socket.set_nonblocking(true)?,
            Mode::Timeout(d) => {
                self.socket.set_nonblocking(false)?;
                self.socket.set_read_timeout(Some(d))?;
            }
        }
        self.mode = Some(mode);
        Ok(())
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        let dest = self.dest.ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "listening transport cannot send")
        })?;
        self.socket.send_to(datagram, dest)?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<Option<usize>> {
        self.set_mode(wait)?;
        match self.socket.recv_from(buf) {
            Ok((n, _from)) => Ok(Some(n)),
            Err(e) if is_idle(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Errors that only mean "nothing to read yet".
fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::ConnectionReset
    )
}
