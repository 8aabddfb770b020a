use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tracing::debug;
use crate::core::config::LinkTiming;

/*
  Line model. A Line is one shared digital signal: an atomic level plus a
  list of edge subscribers. Toggling the level runs every matching
  subscriber callback in the driving thread, so the callback executes in
  what the protocol treats as interrupt context: it must not block on the
  driving side's state and it samples the other lines at the instant of
  the edge, exactly like an IRQ handler raised by the clock pin.

  The callbacks are invoked with the subscriber list unlocked; a handler
  may pulse other lines (the RX acknowledgement path does) without
  deadlocking the bus.
 */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

pub type EdgeHandler = Arc<dyn Fn(Instant) + Send + Sync>;

struct Subscriber {
    id: u64,
    trigger: Edge,
    handler: EdgeHandler,
}

struct LineInner {
    name: String,
    level: AtomicBool,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

#[derive(Clone)]
pub struct Line(Arc<LineInner>);

impl Line {
    pub fn new(name: &str) -> Line {
        Line(Arc::new(LineInner {
            name: name.to_string(),
            level: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }))
    }

    pub fn get(&self) -> bool {
        self.0.level.load(Ordering::SeqCst)
    }

    pub fn set(&self, level: bool) {
        let prev = self.0.level.swap(level, Ordering::SeqCst);
        if prev == level {
            return;
        }
        let edge = if level { Edge::Rising } else { Edge::Falling };
        let stamp = Instant::now();
        let fired: Vec<EdgeHandler> = {
            let subs = self.0.subscribers.lock().unwrap();
            subs.iter()
                .filter(|s| s.trigger == edge)
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        for handler in fired {
            handler(stamp);
        }
    }

    /// Register an edge handler, the request_irq of this bus. The handler
    /// stays attached until the returned guard is dropped.
    pub fn subscribe(&self, trigger: Edge, handler: EdgeHandler) -> IrqGuard {
        let id = self.0.next_id.fetch_add(1, Ordering::SeqCst);
        self.0.subscribers.lock().unwrap().push(Subscriber {
            id,
            trigger,
            handler,
        });
        debug!("irq attached to line {} ({:?}, id {})", self.0.name, trigger, id);
        IrqGuard {
            line: Arc::downgrade(&self.0),
            id,
        }
    }
}

pub struct IrqGuard {
    line: Weak<LineInner>,
    id: u64,
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if let Some(line) = self.line.upgrade() {
            line.subscribers.lock().unwrap().retain(|s| s.id != self.id);
            debug!("irq detached from line {} (id {})", line.name, self.id);
        }
    }
}

// Pin count of the forward data bundle
pub const DATA_LINE_COUNT : usize = 3;

/// The transmitter's view of the bundle: it drives data and clock and
/// listens on the two reverse acknowledgement lines.
#[derive(Clone)]
pub struct TxPort {
    pub data: [Line; DATA_LINE_COUNT],
    pub clock: Line,
    pub ack: Line,
    pub nack: Line,
}

impl TxPort {
    pub fn drive_data(&self, value: u8) {
        for (i, line) in self.data.iter().enumerate() {
            line.set((value >> i) & 1 != 0);
        }
    }
}

/// The receiver's view: it samples data on clock edges and owns the
/// acknowledgement lines. The verdict is carried by which line pulses,
/// not by a level sampled mid-pulse, so a NACK is as observable as an
/// ACK at the far end.
#[derive(Clone)]
pub struct RxPort {
    pub data: [Line; DATA_LINE_COUNT],
    pub clock: Line,
    pub ack: Line,
    pub nack: Line,
}

impl RxPort {
    pub fn read_data(&self) -> u8 {
        let mut value = 0u8;
        for (i, line) in self.data.iter().enumerate() {
            if line.get() {
                value |= 1 << i;
            }
        }
        value
    }

    pub fn pulse_ack(&self, timing: &LinkTiming) {
        Self::pulse(&self.ack, timing);
    }

    pub fn pulse_nack(&self, timing: &LinkTiming) {
        Self::pulse(&self.nack, timing);
    }

    fn pulse(line: &Line, timing: &LinkTiming) {
        line.set(true);
        std::thread::sleep(timing.ack_pulse);
        line.set(false);
        std::thread::sleep(timing.ack_release);
    }
}

/// One in-memory wire bundle connecting a TX and an RX endpoint. The
/// real-hardware rendition of the ports is a set of GPIO descriptors;
/// everything above this layer is agnostic to which it gets.
pub struct LinkBus {
    data: [Line; DATA_LINE_COUNT],
    clock: Line,
    ack: Line,
    nack: Line,
}

impl LinkBus {
    pub fn new() -> LinkBus {
        LinkBus {
            data: [Line::new("data0"), Line::new("data1"), Line::new("data2")],
            clock: Line::new("clock"),
            ack: Line::new("ack"),
            nack: Line::new("nack"),
        }
    }

    pub fn tx_port(&self) -> TxPort {
        TxPort {
            data: self.data.clone(),
            clock: self.clock.clone(),
            ack: self.ack.clone(),
            nack: self.nack.clone(),
        }
    }

    pub fn rx_port(&self) -> RxPort {
        RxPort {
            data: self.data.clone(),
            clock: self.clock.clone(),
            ack: self.ack.clone(),
            nack: self.nack.clone(),
        }
    }
}

impl Default for LinkBus {
    fn default() -> Self {
        Self::new()
    }
}
