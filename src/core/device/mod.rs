use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;
use crate::core::config::LinkTiming;
use crate::core::error::LinkError;
use crate::core::gpio::{RxPort, TxPort};
use crate::core::rx::RxEngine;
use crate::core::sync::WaitOutcome;
use crate::core::tx::{TxEngine, TxStats, TxStatus};

/*
  Device surface over the two engines: the library rendition of the
  character devices. An endpoint owns an engine for its probed lifetime;
  opening it hands out the single device handle, and a second opener is
  told the device is busy, exactly like the try-locked open of the
  driver. Dropping the handle releases the device.
 */

struct OpenFlag(AtomicBool);

impl OpenFlag {
    fn new() -> OpenFlag {
        OpenFlag(AtomicBool::new(false))
    }

    fn acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct TxEndpointInner {
    engine: TxEngine,
    open: OpenFlag,
}

pub struct TxEndpoint {
    inner: Arc<TxEndpointInner>,
}

impl TxEndpoint {
    pub fn new(port: TxPort, timing: LinkTiming) -> TxEndpoint {
        TxEndpoint {
            inner: Arc::new(TxEndpointInner {
                engine: TxEngine::new(port, timing),
                open: OpenFlag::new(),
            }),
        }
    }

    pub fn open(&self) -> Result<TxDevice, LinkError> {
        if !self.inner.open.acquire() {
            return Err(LinkError::Busy);
        }
        self.inner.engine.reset_session();
        info!("TX device opened");
        Ok(TxDevice {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Cancel any parked acknowledgement wait; pending writes surface
    /// `Interrupted`.
    pub fn shutdown(&self) {
        self.inner.engine.shutdown();
    }
}

pub struct TxDevice {
    inner: Arc<TxEndpointInner>,
}

impl TxDevice {
    pub fn write(&self, buf: &[u8]) -> Result<usize, LinkError> {
        self.inner.engine.write(buf)
    }

    pub fn status(&self) -> TxStatus {
        self.inner.engine.status()
    }

    pub fn stats(&self) -> TxStats {
        self.inner.engine.stats()
    }

    pub fn reset_stats(&self) {
        self.inner.engine.reset_stats();
    }

    pub fn reset_state(&self) {
        self.inner.engine.reset_session();
    }
}

impl Drop for TxDevice {
    fn drop(&mut self) {
        self.inner.open.release();
        info!("TX device released");
    }
}

struct RxEndpointInner {
    engine: RxEngine,
    open: OpenFlag,
}

pub struct RxEndpoint {
    inner: Arc<RxEndpointInner>,
}

impl RxEndpoint {
    pub fn new(port: RxPort, timing: LinkTiming) -> RxEndpoint {
        RxEndpoint {
            inner: Arc::new(RxEndpointInner {
                engine: RxEngine::new(port, timing),
                open: OpenFlag::new(),
            }),
        }
    }

    pub fn open(&self) -> Result<RxDevice, LinkError> {
        if !self.inner.open.acquire() {
            return Err(LinkError::Busy);
        }
        self.inner.engine.reset_assembly();
        info!("RX device opened");
        Ok(RxDevice {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Cancel all parked readers; pending reads surface `Interrupted`.
    pub fn shutdown(&self) {
        self.inner.engine.shutdown();
    }
}

// ioctl numbers of the character-device rendition of this surface
pub const RX_IOCTL_RESET : u32 = 0x1001;
pub const RX_IOCTL_IMAGE_READY : u32 = 0x1002;

pub struct RxDevice {
    inner: Arc<RxEndpointInner>,
}

impl RxDevice {
    fn drain(&self, buf: &mut [u8]) -> usize {
        let fifo = self.inner.engine.fifo();
        let mut n = 0;
        while n < buf.len() {
            match fifo.pop() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Blocking read: parks until at least one payload byte is
    /// available, then drains up to `buf.len()` bytes.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let engine = &self.inner.engine;
        loop {
            let n = self.drain(buf);
            if n > 0 {
                return Ok(n);
            }
            match engine
                .data_wait()
                .wait(|| !engine.fifo().is_empty(), None)
            {
                WaitOutcome::Woken => continue,
                WaitOutcome::TimedOut => return Err(LinkError::Timeout),
                WaitOutcome::Cancelled => return Err(LinkError::Interrupted),
            }
        }
    }

    /// Non-blocking read; `WouldBlock` when the FIFO is empty.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.drain(buf);
        if n == 0 {
            Err(LinkError::WouldBlock)
        } else {
            Ok(n)
        }
    }

    /// Readability poll. `None` waits indefinitely.
    pub fn poll(&self, timeout: Option<Duration>) -> bool {
        let engine = &self.inner.engine;
        matches!(
            engine
                .data_wait()
                .wait(|| !engine.fifo().is_empty(), timeout),
            WaitOutcome::Woken
        )
    }

    /// Reset ioctl: assembly state, sequence, image tracker and buffer.
    pub fn reset(&self) {
        self.inner.engine.reset();
        info!("RX state reset via ioctl");
    }

    /// Image-ready ioctl: the session's accepted bytes cover the bitmap
    /// its own header announced.
    pub fn image_ready(&self) -> bool {
        self.inner.engine.image_ready()
    }
}

impl Drop for RxDevice {
    fn drop(&mut self) {
        self.inner.open.release();
        info!("RX device released");
    }
}
