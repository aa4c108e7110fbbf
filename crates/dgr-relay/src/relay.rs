use anyhow::{Context, Result, anyhow};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often the liveness loop checks the timeouts (10 Hz).
const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Receiver read timeout; bounds how long it takes to notice the stop flag.
const RECV_POLL: Duration = Duration::from_millis(100);

const RECV_BUF_LEN: usize = 65_536;

/// Relay settings, as given on the command line.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port_in: u16,
    pub dest_host: String,
    pub ports_out: Vec<u16>,
    /// Give up if no datagram arrives at all within this window.
    pub first_packet_timeout: Duration,
    /// Give up once traffic has stopped for this long.
    pub idle_timeout: Duration,
}

impl RelayConfig {
    pub fn new(port_in: u16, dest_host: impl Into<String>, ports_out: Vec<u16>) -> Self {
        Self {
            port_in,
            dest_host: dest_host.into(),
            ports_out,
            first_packet_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(5),
        }
    }
}

/// Lifecycle of a relay.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    WaitingFirstPacket,
    Active,
    Terminated(Termination),
}

/// Why a relay stopped. All of these are clean exits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Termination {
    /// No datagram within the first-packet timeout; the master never started.
    NoFirstPacket,
    /// Traffic stopped for longer than the idle timeout.
    Idle,
    /// The master sent its shutdown datagram; it was forwarded.
    Shutdown,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Termination::NoFirstPacket => "no packet received before the first-packet timeout",
            Termination::Idle => "no packet received before the idle timeout",
            Termination::Shutdown => "master sent shutdown",
        })
    }
}

/// One outbound leg: its own socket and destination.
#[derive(Debug)]
struct Route {
    socket: UdpSocket,
    dest: SocketAddr,
}

/// State shared between the receiver thread and the liveness loop.
#[derive(Debug, Default)]
struct LinkState {
    last_packet: Option<Instant>,
    forwarded: u64,
    shutdown_seen: bool,
}

/// A bound relay, ready to run.
#[derive(Debug)]
pub struct Relay {
    inbound: UdpSocket,
    routes: Vec<Route>,
    first_packet_timeout: Duration,
    idle_timeout: Duration,
}

/// Final report of a relay run.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Summary {
    pub reason: Termination,
    pub forwarded: u64,
}

impl Relay {
    /// Binds the inbound port and opens one broadcast-capable socket per
    /// outbound port, all aimed at `dest_host`.
    pub fn bind(config: &RelayConfig) -> Result<Self> {
        if config.ports_out.is_empty() {
            return Err(anyhow!("at least one outbound port is required"));
        }

        let inbound = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port_in))
            .with_context(|| format!("failed to bind inbound port {}", config.port_in))?;

        let mut routes = Vec::with_capacity(config.ports_out.len());
        for &port in &config.ports_out {
            let dest = (config.dest_host.as_str(), port)
                .to_socket_addrs()
                .with_context(|| format!("failed to resolve {}:{port}", config.dest_host))?
                .find(SocketAddr::is_ipv4)
                .ok_or_else(|| anyhow!("no IPv4 address for {}:{port}", config.dest_host))?;

            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
                .context("failed to open outbound socket")?;
            socket
                .set_broadcast(true)
                .context("failed to enable broadcast on outbound socket")?;

            routes.push(Route { socket, dest });
        }

        Ok(Self {
            inbound,
            routes,
            first_packet_timeout: config.first_packet_timeout,
            idle_timeout: config.idle_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inbound
            .local_addr()
            .context("failed to query inbound address")
    }

    /// Forwards traffic until a timeout or a shutdown datagram ends the run.
    ///
    /// Socket errors end the run with `Err`; nothing is retried.
    pub fn run(self) -> Result<Summary> {
        let Relay {
            inbound,
            routes,
            first_packet_timeout,
            idle_timeout,
        } = self;

        inbound
            .set_read_timeout(Some(RECV_POLL))
            .context("failed to set inbound read timeout")?;

        for r in &routes {
            log::info!("relay forwarding to {}", r.dest);
        }

        let state = Arc::new(Mutex::new(LinkState::default()));
        let stop = Arc::new(AtomicBool::new(false));

        let receiver: JoinHandle<Result<()>> = {
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("relay-recv".into())
                .spawn(move || receive_loop(&inbound, &routes, &state, &stop))
                .context("failed to spawn receiver thread")?
        };

        let started = Instant::now();
        let mut phase = Phase::WaitingFirstPacket;

        let reason = loop {
            thread::sleep(CHECK_INTERVAL);

            if receiver.is_finished() {
                // The receiver only finishes by itself on shutdown or error.
                join(receiver)?;
                break Termination::Shutdown;
            }

            let since_last_packet = lock(&state).last_packet.map(|at| at.elapsed());
            let next = next_phase(
                phase,
                since_last_packet,
                started.elapsed(),
                first_packet_timeout,
                idle_timeout,
            );
            if next != phase {
                log::debug!("relay {phase:?} -> {next:?}");
                phase = next;
            }
            if let Phase::Terminated(reason) = phase {
                stop.store(true, Ordering::Release);
                join(receiver)?;
                break reason;
            }
        };

        let link = lock(&state);
        let reason = if link.shutdown_seen { Termination::Shutdown } else { reason };
        Ok(Summary {
            reason,
            forwarded: link.forwarded,
        })
    }
}

/// Liveness transition for one check, given how long ago the last datagram
/// arrived (`None` before the first one).
pub fn next_phase(
    phase: Phase,
    since_last_packet: Option<Duration>,
    since_start: Duration,
    first_packet_timeout: Duration,
    idle_timeout: Duration,
) -> Phase {
    match (phase, since_last_packet) {
        (Phase::Terminated(_), _) => phase,
        (_, None) if since_start > first_packet_timeout => {
            Phase::Terminated(Termination::NoFirstPacket)
        }
        (_, None) => Phase::WaitingFirstPacket,
        (_, Some(quiet)) if quiet > idle_timeout => Phase::Terminated(Termination::Idle),
        (_, Some(_)) => Phase::Active,
    }
}

fn receive_loop(
    inbound: &UdpSocket,
    routes: &[Route],
    state: &Mutex<LinkState>,
    stop: &AtomicBool,
) -> Result<()> {
    let mut buf = vec![0u8; RECV_BUF_LEN];

    while !stop.load(Ordering::Acquire) {
        let (n, from) = match inbound.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if is_idle(&e) => continue,
            Err(e) => return Err(e).context("failed to receive datagram"),
        };
        let datagram = &buf[..n];

        for r in routes {
            r.socket
                .send_to(datagram, r.dest)
                .with_context(|| format!("failed to forward datagram to {}", r.dest))?;
        }

        let shutdown = dgr::wire::is_shutdown(datagram);
        {
            let mut s = lock(state);
            if s.last_packet.is_none() {
                log::info!("relay received first datagram from {from}");
            }
            s.last_packet = Some(Instant::now());
            s.forwarded += 1;
            s.shutdown_seen |= shutdown;
        }

        if shutdown {
            log::info!("relay forwarded shutdown from {from}");
            return Ok(());
        }
    }
    Ok(())
}

fn join(receiver: JoinHandle<Result<()>>) -> Result<()> {
    receiver
        .join()
        .map_err(|_| anyhow!("relay receiver thread panicked"))?
}

fn lock(state: &Mutex<LinkState>) -> std::sync::MutexGuard<'_, LinkState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener() -> (UdpSocket, u16) {
        let s = UdpSocket::bind("127.0.0.1:0").unwrap();
        s.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let port = s.local_addr().unwrap().port();
        (s, port)
    }

    fn relay_to(ports_out: Vec<u16>, first: Duration, idle: Duration) -> (Relay, SocketAddr) {
        let mut config = RelayConfig::new(0, "127.0.0.1", ports_out);
        config.first_packet_timeout = first;
        config.idle_timeout = idle;
        let relay = Relay::bind(&config).unwrap();
        let port = relay.local_addr().unwrap().port();
        (relay, SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    fn recv(s: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let (n, _) = s.recv_from(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn fans_out_every_datagram_to_every_destination() {
        let (a, port_a) = listener();
        let (b, port_b) = listener();
        let (relay, addr) = relay_to(
            vec![port_a, port_b],
            Duration::from_secs(10),
            Duration::from_secs(10),
        );
        let handle = thread::spawn(move || relay.run());

        let master = UdpSocket::bind("127.0.0.1:0").unwrap();
        let angle: &[u8] = &[5, b'a', b'n', b'g', b'l', b'e', 4, 0, 0, 0, 0, 0, 180, 66];
        let frames: [&[u8]; 2] = [angle, &[0xff; 600]];
        for f in frames {
            master.send_to(f, addr).unwrap();
            assert_eq!(recv(&a), f);
            assert_eq!(recv(&b), f);
        }

        master.send_to(dgr::wire::SHUTDOWN_DATAGRAM, addr).unwrap();
        assert_eq!(recv(&a), dgr::wire::SHUTDOWN_DATAGRAM);
        assert_eq!(recv(&b), dgr::wire::SHUTDOWN_DATAGRAM);

        let summary = handle.join().unwrap().unwrap();
        assert_eq!(summary.reason, Termination::Shutdown);
        assert_eq!(summary.forwarded, 3);
    }

    #[test]
    fn exits_when_no_first_packet_arrives() {
        let (_a, port_a) = listener();
        let (relay, _) =
            relay_to(vec![port_a], Duration::from_millis(300), Duration::from_secs(10));

        let started = Instant::now();
        let summary = relay.run().unwrap();
        assert_eq!(summary.reason, Termination::NoFirstPacket);
        assert_eq!(summary.forwarded, 0);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn exits_when_traffic_stops() {
        let (a, port_a) = listener();
        let (relay, addr) =
            relay_to(vec![port_a], Duration::from_secs(10), Duration::from_millis(300));
        let handle = thread::spawn(move || relay.run());

        let master = UdpSocket::bind("127.0.0.1:0").unwrap();
        master.send_to(b"frame", addr).unwrap();
        assert_eq!(recv(&a), b"frame");

        let started = Instant::now();
        let summary = handle.join().unwrap().unwrap();
        assert_eq!(summary.reason, Termination::Idle);
        assert_eq!(summary.forwarded, 1);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn empty_route_list_is_refused() {
        let config = RelayConfig::new(0, "127.0.0.1", Vec::new());
        assert!(Relay::bind(&config).is_err());
    }

    #[test]
    fn forwarding_error_ends_the_run_with_err() {
        // The kernel refuses to send to port 0.
        let (relay, addr) = relay_to(vec![0], Duration::from_secs(10), Duration::from_secs(10));
        let handle = thread::spawn(move || relay.run());

        let master = UdpSocket::bind("127.0.0.1:0").unwrap();
        master.send_to(b"frame", addr).unwrap();

        let err = handle.join().unwrap().unwrap_err();
        assert!(format!("{err:#}").contains("failed to forward datagram"));
    }

    #[test]
    fn phase_transitions() {
        let secs = Duration::from_secs;
        let first = secs(15);
        let idle = secs(5);

        assert_eq!(
            next_phase(Phase::WaitingFirstPacket, None, secs(1), first, idle),
            Phase::WaitingFirstPacket
        );
        assert_eq!(
            next_phase(Phase::WaitingFirstPacket, None, secs(16), first, idle),
            Phase::Terminated(Termination::NoFirstPacket)
        );
        assert_eq!(
            next_phase(Phase::WaitingFirstPacket, Some(Duration::ZERO), secs(16), first, idle),
            Phase::Active
        );
        assert_eq!(
            next_phase(Phase::Active, Some(secs(4)), secs(20), first, idle),
            Phase::Active
        );
        assert_eq!(
            next_phase(Phase::Active, Some(secs(6)), secs(20), first, idle),
            Phase::Terminated(Termination::Idle)
        );
        assert_eq!(
            next_phase(
                Phase::Terminated(Termination::Idle),
                Some(Duration::ZERO),
                Duration::ZERO,
                first,
                idle
            ),
            Phase::Terminated(Termination::Idle)
        );
    }
}
