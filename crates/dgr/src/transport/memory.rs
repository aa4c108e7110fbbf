use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use super::Transport;

/// In-process transport: one end sends, the other receives.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: Option<Sender<Vec<u8>>>,
    rx: Option<Receiver<Vec<u8>>>,
}

/// Creates a connected `(sending, receiving)` pair.
pub fn channel() -> (MemoryTransport, MemoryTransport) {
    let (tx, rx) = mpsc::channel();
    (
        MemoryTransport { tx: Some(tx), rx: None },
        MemoryTransport { tx: None, rx: Some(rx) },
    )
}

impl Transport for MemoryTransport {
    fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "receive-only transport"))?;
        tx.send(datagram.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver dropped"))
    }

    fn recv(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<Option<usize>> {
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "send-only transport"))?;

        let datagram = if wait.is_zero() {
            match rx.try_recv() {
                Ok(d) => d,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Ok(None),
            }
        } else {
            match rx.recv_timeout(wait) {
                Ok(d) => d,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return Ok(None),
            }
        };

        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(Some(n))
    }
}
