//! In-memory duplex link.
//!
//! [`PipePort::pair`] returns two connected ends. Bytes written to one end
//! become readable on the other. The host end is used as a [`Port`] and the
//! bridge end as a [`DeviceLink`], which lets the real dispatcher and the
//! real client talk to each other on two threads without hardware.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::bridge::DeviceLink;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::DEFAULT_BAUD;

#[derive(Default)]
struct Lane {
    bytes: Mutex<LaneState>,
    ready: Condvar,
}

#[derive(Default)]
struct LaneState {
    queue: VecDeque<u8>,
    closed: bool,
}

impl Lane {
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        // A poisoned lane only means the peer thread panicked; the queue is
        // still consistent.
        self.bytes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn push(&self, data: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "peer closed"));
        }
        state
            .queue
            .extend(data);
        self.ready
            .notify_all();
        Ok(())
    }

    fn close(&self) {
        self.lock()
            .closed = true;
        self.ready
            .notify_all();
    }
}

/// One end of an in-memory duplex byte channel.
pub struct PipePort {
    name: String,
    rx: Arc<Lane>,
    tx: Arc<Lane>,
    timeout: Duration,
    baud_rate: u32,
}

impl PipePort {
    /// Create two connected ends, `(host, bridge)`.
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Lane::default());
        let b_to_a = Arc::new(Lane::default());
        let host = Self {
            name: "pipe:host".into(),
            rx: Arc::clone(&b_to_a),
            tx: Arc::clone(&a_to_b),
            timeout: Duration::from_millis(100),
            baud_rate: DEFAULT_BAUD,
        };
        let bridge = Self {
            name: "pipe:bridge".into(),
            rx: a_to_b,
            tx: b_to_a,
            timeout: Duration::from_millis(100),
            baud_rate: DEFAULT_BAUD,
        };
        (host, bridge)
    }
}

impl Drop for PipePort {
    fn drop(&mut self) {
        self.rx
            .close();
        self.tx
            .close();
    }
}

impl Read for PipePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let state = self
            .rx
            .lock();
        let (mut state, _) = self
            .rx
            .ready
            .wait_timeout_while(state, self.timeout, |s| s.queue.is_empty() && !s.closed)
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if state.queue.is_empty() {
            return if state.closed {
                Ok(0)
            } else {
                Err(io::Error::new(ErrorKind::TimedOut, "no data"))
            };
        }

        let n = buf.len().min(state.queue.len());
        for (slot, byte) in buf.iter_mut().zip(state.queue.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for PipePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .push(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for PipePort {
    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self
            .rx
            .lock()
            .queue
            .len())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.rx
            .lock()
            .queue
            .clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        self.rx
            .close();
        self.tx
            .close();
        Ok(())
    }
}

impl DeviceLink for PipePort {
    /// Blocks until a byte arrives; fails once the host end is gone.
    fn read_byte(&mut self) -> Result<u8> {
        let state = self
            .rx
            .lock();
        let mut state = self
            .rx
            .ready
            .wait_while(state, |s| s.queue.is_empty() && !s.closed)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state
            .queue
            .pop_front()
            .ok_or_else(|| Error::Io(io::Error::new(ErrorKind::UnexpectedEof, "host closed")))
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.tx
            .push(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_cross_between_ends() {
        let (mut host, mut bridge) = PipePort::pair();
        host.write_all_bytes(b"S")
            .unwrap();
        assert_eq!(bridge.bytes_available().unwrap(), 1);
        assert_eq!(bridge.read_byte().unwrap(), b'S');

        bridge
            .write_bytes(&[b'A', 0, 1, 0, 0x0A])
            .unwrap();
        assert_eq!(host.bytes_available().unwrap(), 5);
        let mut reply = [0u8; 5];
        Read::read_exact(&mut host, &mut reply).unwrap();
        assert_eq!(reply, [b'A', 0, 1, 0, 0x0A]);
    }

    #[test]
    fn test_read_times_out_when_empty() {
        let (mut host, _bridge) = PipePort::pair();
        host.set_timeout(Duration::from_millis(5))
            .unwrap();
        let mut buf = [0u8; 1];
        let err = host
            .read(&mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn test_bridge_read_fails_after_host_drop() {
        let (host, mut bridge) = PipePort::pair();
        drop(host);
        assert!(bridge.read_byte().is_err());
        assert!(bridge.write_bytes(b"A").is_err());
    }

    #[test]
    fn test_clear_buffers_discards_input() {
        let (mut host, mut bridge) = PipePort::pair();
        bridge
            .write_bytes(b"junk")
            .unwrap();
        host.clear_buffers()
            .unwrap();
        assert_eq!(host.bytes_available().unwrap(), 0);
    }
}
