use std::time::{Duration, Instant};

use bytemuck::Pod;

use crate::config::{DgrConfig, Role};
use crate::error::{DgrError, Result};
use crate::registry::Registry;
use crate::transport::{Transport, UdpTransport};
use crate::wire::{self, Frame, MAX_PAYLOAD, SAFE_PAYLOAD};

/// Upper bound on datagrams consumed by one slave `update()`.
///
/// Keeps a flooded socket from stalling the render loop; the remainder is
/// picked up next frame.
const MAX_DRAIN: usize = 256;

/// Receive buffer size: the largest UDP payload plus one byte, so oversized
/// datagrams show up as truncated instead of silently fitting.
const RECV_BUF_LEN: usize = MAX_PAYLOAD + 1;

/// Traffic counters for one context.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Stats {
    /// Data frames sent (master).
    pub frames_sent: u64,
    /// Data frames applied (slave).
    pub frames_applied: u64,
    /// Datagrams refused as malformed or inconsistent (slave).
    pub datagrams_dropped: u64,
}

/// Replication context for one render process.
///
/// Create it once at startup, then every frame:
///
/// - master: [`Dgr::sync`] each replicated variable, then [`Dgr::update`]
/// - slave: [`Dgr::update`], then [`Dgr::sync`] each replicated variable
///
/// ```no_run
/// use dgr::{Dgr, DgrConfig};
///
/// let mut dgr = Dgr::init(DgrConfig::from_env()?)?;
/// let mut angle = 0.0f32;
/// loop {
///     if dgr.is_master() {
///         angle += 1.0;
///         dgr.sync("angle", &mut angle)?;
///         dgr.update()?;
///     } else {
///         dgr.update()?;
///         dgr.sync("angle", &mut angle)?;
///     }
///     // draw with `angle`
/// #   break;
/// }
/// # Ok::<(), dgr::DgrError>(())
/// ```
pub struct Dgr {
    role: Role,
    registry: Registry,
    link: Option<Box<dyn Transport>>,
    ended: bool,

    buf: Vec<u8>,
    recv_timeout: Duration,

    silence_warning: Duration,
    last_packet: Instant,
    silence_reported: bool,
    oversize_reported: bool,

    stats: Stats,
}

impl Dgr {
    /// Creates a context and opens the UDP transport `config.role` needs.
    pub fn init(config: DgrConfig) -> Result<Self> {
        let link: Option<Box<dyn Transport>> = match config.role {
            Role::Standalone => None,
            Role::Master => {
                let t = UdpTransport::sender(&config.dest_host, config.dest_port)
                    .map_err(DgrError::io("opening master socket"))?;
                log::info!(
                    "dgr master sending to {}:{}",
                    config.dest_host,
                    config.dest_port
                );
                Some(Box::new(t))
            }
            Role::Slave => {
                let t = UdpTransport::listener(config.listen_port)
                    .map_err(DgrError::io("binding slave socket"))?;
                log::info!("dgr slave listening on port {}", config.listen_port);
                Some(Box::new(t))
            }
        };

        if link.is_none() {
            log::info!("dgr disabled, running standalone");
        }

        Ok(Self::build(&config, link))
    }

    /// Creates a context on top of an existing transport.
    ///
    /// The transport is dropped unused when `config.role` is standalone.
    pub fn with_transport(config: &DgrConfig, transport: Box<dyn Transport>) -> Self {
        let link = (config.role != Role::Standalone).then_some(transport);
        Self::build(config, link)
    }

    fn build(config: &DgrConfig, link: Option<Box<dyn Transport>>) -> Self {
        let buf = match config.role {
            Role::Slave => vec![0; RECV_BUF_LEN],
            _ => Vec::new(),
        };

        Self {
            role: config.role,
            registry: Registry::new(),
            link,
            ended: false,
            buf,
            recv_timeout: config.recv_timeout,
            silence_warning: config.silence_warning,
            last_packet: Instant::now(),
            silence_reported: false,
            oversize_reported: false,
            stats: Stats::default(),
        }
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// `true` for the process whose values are authoritative, including a
    /// standalone process. Gate input handling and simulation on this.
    #[inline]
    pub fn is_master(&self) -> bool {
        self.role != Role::Slave
    }

    /// `true` while replication is running: not standalone, and no shutdown
    /// has been sent or received.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.role != Role::Standalone && !self.ended
    }

    #[inline]
    pub fn stats(&self) -> Stats {
        self.stats
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Declares `name` (first call) and synchronizes `buffer` with it.
    ///
    /// On the master and in standalone mode the current contents of `buffer`
    /// become the value sent next. On a slave `buffer` is overwritten with the
    /// last value received for `name`, or left alone if none arrived yet.
    ///
    /// Every call for a given name must pass the same length.
    pub fn declare_or_sync(&mut self, name: &str, buffer: &mut [u8]) -> Result<()> {
        match self.role {
            Role::Master | Role::Standalone => self.registry.store(name, buffer),
            Role::Slave => self.registry.load(name, buffer),
        }
    }

    /// Typed form of [`Dgr::declare_or_sync`] for plain-old-data values.
    pub fn sync<T: Pod>(&mut self, name: &str, value: &mut T) -> Result<()> {
        self.declare_or_sync(name, bytemuck::bytes_of_mut(value))
    }

    /// Runs this frame's replication step.
    ///
    /// Master: sends one datagram holding every declared variable. Slave:
    /// applies whatever arrived since the previous call; when nothing did,
    /// the previous values stay. Standalone, or after shutdown: nothing.
    pub fn update(&mut self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        match self.role {
            Role::Master => self.send_frame(),
            Role::Slave => self.receive_frames(),
            Role::Standalone => Ok(()),
        }
    }

    /// Ends replication.
    ///
    /// A master sends the shutdown datagram once, best-effort. A slave stops
    /// listening. Further `update()` calls do nothing.
    pub fn shutdown(&mut self) {
        if !self.is_enabled() {
            return;
        }
        self.ended = true;

        if self.role == Role::Master {
            if let Some(link) = self.link.as_mut() {
                match link.send(wire::SHUTDOWN_DATAGRAM) {
                    Ok(()) => log::info!("dgr master sent shutdown"),
                    Err(e) => log::warn!("dgr master could not send shutdown: {e}"),
                }
            }
        } else {
            log::info!("dgr slave stopped");
        }
    }

    fn send_frame(&mut self) -> Result<()> {
        let size: usize = self
            .registry
            .values()
            .map(|(name, value)| wire::tuple_len(name, value))
            .sum();
        if size > MAX_PAYLOAD {
            return Err(DgrError::PacketTooLarge { size });
        }
        if size > SAFE_PAYLOAD && !self.oversize_reported {
            self.oversize_reported = true;
            log::warn!(
                "dgr frame is {size} bytes, above the {SAFE_PAYLOAD}-byte unfragmented limit"
            );
        }

        self.buf.clear();
        self.buf.reserve(size);
        for (name, value) in self.registry.values() {
            wire::encode_tuple(name, value, &mut self.buf)?;
        }

        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        link.send(&self.buf)
            .map_err(DgrError::io("sending dgr frame"))?;
        self.stats.frames_sent += 1;
        Ok(())
    }

    fn receive_frames(&mut self) -> Result<()> {
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };

        let mut received = false;
        let mut wait = self.recv_timeout;

        for _ in 0..MAX_DRAIN {
            let Some(n) = link
                .recv(&mut self.buf, wait)
                .map_err(DgrError::io("receiving dgr frame"))?
            else {
                break;
            };
            wait = Duration::ZERO;
            received = true;

            match wire::decode(&self.buf[..n]) {
                Ok(Frame::Shutdown) => {
                    log::info!("dgr master ended replication");
                    self.ended = true;
                    break;
                }
                Ok(Frame::Data(tuples)) => match self.registry.apply(&tuples) {
                    Ok(()) => self.stats.frames_applied += 1,
                    Err(e) => {
                        self.stats.datagrams_dropped += 1;
                        log::warn!("dgr dropped frame: {e}");
                    }
                },
                Err(e) => {
                    self.stats.datagrams_dropped += 1;
                    log::warn!("dgr dropped {n}-byte datagram: {e}");
                }
            }
        }

        let now = Instant::now();
        if received {
            if self.silence_reported {
                log::info!("dgr master traffic resumed");
            }
            self.last_packet = now;
            self.silence_reported = false;
        } else if !self.silence_reported
            && now.duration_since(self.last_packet) >= self.silence_warning
        {
            self.silence_reported = true;
            log::warn!(
                "dgr slave has heard nothing from the master for {:.1}s",
                self.silence_warning.as_secs_f32()
            );
        }

        Ok(())
    }
}

impl Drop for Dgr {
    fn drop(&mut self) {
        if self.role == Role::Master {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{self, MemoryTransport};

    /// Master/slave pair joined by an in-memory link.
    fn pair() -> (Dgr, Dgr) {
        let (tx, rx) = transport::channel();
        let master = Dgr::with_transport(&DgrConfig::master("unused", 1), Box::new(tx));
        let slave = Dgr::with_transport(&DgrConfig::slave(1), Box::new(rx));
        (master, slave)
    }

    /// Slave fed with hand-made datagrams.
    fn raw_slave() -> (MemoryTransport, Dgr) {
        let (tx, rx) = transport::channel();
        (tx, Dgr::with_transport(&DgrConfig::slave(1), Box::new(rx)))
    }

    #[test]
    fn angle_follows_master_across_frames() {
        let (mut master, mut slave) = pair();

        let mut angle = 90.0f32;
        master.sync("angle", &mut angle).unwrap();
        master.update().unwrap();

        let mut seen = 0.0f32;
        slave.update().unwrap();
        slave.sync("angle", &mut seen).unwrap();
        assert_eq!(seen, 90.0);

        angle = 45.0;
        master.sync("angle", &mut angle).unwrap();
        master.update().unwrap();

        slave.update().unwrap();
        slave.sync("angle", &mut seen).unwrap();
        assert_eq!(seen, 45.0);
    }

    #[test]
    fn values_of_many_sizes_arrive_byte_identical() {
        let (mut master, mut slave) = pair();

        let mut sent: Vec<Vec<u8>> = [0usize, 1, 3, 16, 64, 700, 1400]
            .iter()
            .map(|&len| (0..len).map(|i| (i * 7 + len) as u8).collect())
            .collect();
        for (i, v) in sent.iter_mut().enumerate() {
            master.declare_or_sync(&format!("v{i}"), v).unwrap();
        }
        master.update().unwrap();

        slave.update().unwrap();
        for (i, v) in sent.iter().enumerate() {
            let mut got = vec![0xAA; v.len()];
            slave.declare_or_sync(&format!("v{i}"), &mut got).unwrap();
            assert_eq!(&got, v, "v{i}");
        }
    }

    #[test]
    fn slave_keeps_last_values_when_nothing_arrives() {
        let (mut master, mut slave) = pair();

        let mut pose = [1.0f32, 2.0, 3.0];
        master.sync("pose", &mut pose).unwrap();
        master.update().unwrap();

        let mut seen = [0.0f32; 3];
        slave.update().unwrap();
        slave.sync("pose", &mut seen).unwrap();

        for _ in 0..3 {
            slave.update().unwrap();
            slave.sync("pose", &mut seen).unwrap();
            assert_eq!(seen, [1.0, 2.0, 3.0]);
        }
    }

    #[test]
    fn slave_keeps_defaults_before_first_frame() {
        let (_master, mut slave) = pair();
        let mut seed = 1234u32;
        slave.update().unwrap();
        slave.sync("seed", &mut seed).unwrap();
        assert_eq!(seed, 1234);
    }

    #[test]
    fn truncated_datagram_changes_nothing() {
        let (mut tx, mut slave) = raw_slave();

        let mut a = 1u32;
        let mut b = 2u32;
        slave.sync("a", &mut a).unwrap();
        slave.sync("b", &mut b).unwrap();

        let mut datagram = Vec::new();
        wire::encode_tuple("a", &10u32.to_le_bytes(), &mut datagram).unwrap();
        wire::encode_tuple("b", &20u32.to_le_bytes(), &mut datagram).unwrap();
        datagram.truncate(datagram.len() - 1);
        tx.send(&datagram).unwrap();

        slave.update().unwrap();
        slave.sync("a", &mut a).unwrap();
        slave.sync("b", &mut b).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(slave.stats().datagrams_dropped, 1);
        assert_eq!(slave.stats().frames_applied, 0);
    }

    #[test]
    fn size_disagreement_drops_the_whole_frame() {
        let (mut tx, mut slave) = raw_slave();

        let mut a = 1u32;
        let mut b = 2u16;
        slave.sync("a", &mut a).unwrap();
        slave.sync("b", &mut b).unwrap();

        let mut datagram = Vec::new();
        wire::encode_tuple("a", &10u32.to_le_bytes(), &mut datagram).unwrap();
        wire::encode_tuple("b", &20u32.to_le_bytes(), &mut datagram).unwrap();
        tx.send(&datagram).unwrap();

        slave.update().unwrap();
        slave.sync("a", &mut a).unwrap();
        assert_eq!(a, 1);
        assert_eq!(slave.stats().datagrams_dropped, 1);
    }

    #[test]
    fn slave_jumps_to_newest_queued_frame() {
        let (mut master, mut slave) = pair();

        for frame in 1..=5u64 {
            let mut n = frame;
            master.sync("frame", &mut n).unwrap();
            master.update().unwrap();
        }

        let mut seen = 0u64;
        slave.update().unwrap();
        slave.sync("frame", &mut seen).unwrap();
        assert_eq!(seen, 5);
        assert_eq!(slave.stats().frames_applied, 5);
    }

    #[test]
    fn shutdown_ends_replication_on_both_sides() {
        let (mut master, mut slave) = pair();

        let mut angle = 10.0f32;
        master.sync("angle", &mut angle).unwrap();
        master.update().unwrap();
        master.shutdown();
        assert!(!master.is_enabled());
        assert!(master.is_master());

        slave.update().unwrap();
        assert!(!slave.is_enabled());

        let mut seen = 0.0f32;
        slave.sync("angle", &mut seen).unwrap();
        assert_eq!(seen, 10.0);

        // Later frames are no-ops on both sides.
        angle = 20.0;
        master.sync("angle", &mut angle).unwrap();
        master.update().unwrap();
        assert_eq!(master.stats().frames_sent, 1);

        slave.update().unwrap();
        slave.sync("angle", &mut seen).unwrap();
        assert_eq!(seen, 10.0);
    }

    #[test]
    fn frames_after_shutdown_are_ignored() {
        let (mut tx, mut slave) = raw_slave();

        let mut datagram = Vec::new();
        wire::encode_tuple("n", &[1], &mut datagram).unwrap();
        tx.send(&datagram).unwrap();
        tx.send(wire::SHUTDOWN_DATAGRAM).unwrap();
        datagram.clear();
        wire::encode_tuple("n", &[2], &mut datagram).unwrap();
        tx.send(&datagram).unwrap();

        slave.update().unwrap();
        slave.update().unwrap();

        let mut n = 0u8;
        slave.sync("n", &mut n).unwrap();
        assert_eq!(n, 1);
        assert!(!slave.is_enabled());
    }

    #[test]
    fn dropping_a_master_sends_shutdown_once() {
        let (tx, mut rx) = transport::channel();
        let master = Dgr::with_transport(&DgrConfig::master("unused", 1), Box::new(tx));
        drop(master);

        let mut buf = [0u8; 32];
        let n = rx.recv(&mut buf, Duration::ZERO).unwrap().unwrap();
        assert!(wire::is_shutdown(&buf[..n]));
        assert_eq!(rx.recv(&mut buf, Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn standalone_is_master_and_inert() {
        let mut dgr = Dgr::init(DgrConfig::default()).unwrap();
        assert!(dgr.is_master());
        assert!(!dgr.is_enabled());

        let mut angle = 3.0f32;
        dgr.sync("angle", &mut angle).unwrap();
        dgr.update().unwrap();
        assert_eq!(angle, 3.0);
        assert_eq!(dgr.stats(), Stats::default());
    }

    #[test]
    fn size_change_between_frames_is_fatal() {
        let (mut master, _slave) = pair();
        let mut small = 0u16;
        let mut big = 0u64;
        master.sync("counter", &mut small).unwrap();
        assert!(matches!(
            master.sync("counter", &mut big),
            Err(DgrError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn oversized_frame_is_refused() {
        let (mut master, _slave) = pair();
        let mut a = vec![0u8; 40_000];
        let mut b = vec![0u8; 40_000];
        master.declare_or_sync("a", &mut a).unwrap();
        master.declare_or_sync("b", &mut b).unwrap();
        assert!(matches!(master.update(), Err(DgrError::PacketTooLarge { .. })));
    }

    #[test]
    fn send_failure_is_fatal_io() {
        let (tx, rx) = transport::channel();
        drop(rx);
        let mut master = Dgr::with_transport(&DgrConfig::master("unused", 1), Box::new(tx));

        let mut angle = 1.0f32;
        master.sync("angle", &mut angle).unwrap();
        let err = master.update().unwrap_err();
        assert!(matches!(err, DgrError::Io { context: "sending dgr frame", .. }));
        assert_eq!(master.stats().frames_sent, 0);
    }

    #[test]
    fn udp_round_trip_between_contexts() {
        let listener = UdpTransport::listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut slave_config = DgrConfig::slave(port);
        slave_config.recv_timeout = Duration::from_secs(2);
        let mut slave = Dgr::with_transport(&slave_config, Box::new(listener));
        let mut master = Dgr::init(DgrConfig::master("127.0.0.1", port)).unwrap();
        assert_eq!(master.role(), Role::Master);

        let mut angle = 90.0f32;
        master.sync("angle", &mut angle).unwrap();
        master.update().unwrap();

        let mut seen = 0.0f32;
        slave.update().unwrap();
        slave.sync("angle", &mut seen).unwrap();
        assert_eq!(seen, 90.0);

        master.shutdown();
        slave.update().unwrap();
        assert!(!slave.is_enabled());
    }
}
