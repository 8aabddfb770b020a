use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use crate::core::codec::{TickAssembler, TickOutcome};
use crate::core::config::LinkTiming;
use crate::core::crc::packet_crc32;
use crate::core::gpio::{Edge, IrqGuard, RxPort};
use crate::core::sync::{ByteFifo, StateTimer, WaitQueue};
use crate::core::{HANDSHAKE_SYN, MAX_PACKET_DATA, SEQ_NOISE_LIMIT};

/*
  Receive-side state machine. Bytes fall out of the tick assembler inside
  the clock-edge handler and walk the packet framing:

    Idle -> SeqNum -> DataLen -> Data -> Crc32 -> (verify) -> Idle

  Every state past Idle re-arms the watchdog; its expiry abandons the
  packet and returns to Idle without signalling the far end, which will
  retry on its own timeout. A reset never touches expected_seq, so
  sequence continuity survives mid-packet corruption.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxState {
    #[default]
    Idle,
    SeqNum,
    DataLen,
    Data,
    Crc32,
}

#[derive(Debug)]
struct RxPacket {
    seq_num: u8,
    data_len: u8,
    data: [u8; MAX_PACKET_DATA],
    data_index: usize,
    crc32: u32,
}

impl RxPacket {
    fn new() -> RxPacket {
        RxPacket {
            seq_num: 0,
            data_len: 0,
            data: [0; MAX_PACKET_DATA],
            data_index: 0,
            crc32: 0,
        }
    }

    fn clear(&mut self) {
        self.seq_num = 0;
        self.data_len = 0;
        self.data = [0; MAX_PACKET_DATA];
        self.data_index = 0;
        self.crc32 = 0;
    }
}

/// Follows the session byte stream far enough to answer the "image
/// ready" query: the first 8 accepted bytes are the big-endian width and
/// height, from which the expected total is derived.
#[derive(Debug, Default)]
struct ImageTracker {
    header: [u8; 8],
    received: usize,
    expected_total: Option<usize>,
}

impl ImageTracker {
    fn reset(&mut self) {
        self.header = [0; 8];
        self.received = 0;
        self.expected_total = None;
    }

    fn on_payload(&mut self, data: &[u8]) {
        for &byte in data {
            if self.received < 8 {
                self.header[self.received] = byte;
            }
            self.received += 1;
            if self.received == 8 {
                let width = u32::from_be_bytes(self.header[0..4].try_into().unwrap());
                let height = u32::from_be_bytes(self.header[4..8].try_into().unwrap());
                if (1..=10_000).contains(&width) && (1..=10_000).contains(&height) {
                    let bitmap = (width as usize * height as usize).div_ceil(8);
                    self.expected_total = Some(8 + bitmap);
                } else {
                    warn!("image header carries invalid dimensions {}x{}", width, height);
                }
            }
        }
    }

    fn ready(&self) -> bool {
        self.expected_total.is_some_and(|total| self.received >= total)
    }
}

#[derive(Debug, Default)]
struct BurstWindow {
    start: Option<Instant>,
    count: u32,
}

struct RxMachine {
    state: RxState,
    assembler: TickAssembler,
    packet: RxPacket,
    crc_byte_count: u8,
    expected_seq: u8,
    last_clock: Option<Instant>,
    burst: BurstWindow,
    image: ImageTracker,
}

impl RxMachine {
    fn new() -> RxMachine {
        RxMachine {
            state: RxState::Idle,
            assembler: TickAssembler::new(),
            packet: RxPacket::new(),
            crc_byte_count: 0,
            expected_seq: 0,
            last_clock: None,
            burst: BurstWindow::default(),
            image: ImageTracker::default(),
        }
    }
}

struct RxShared {
    timing: LinkTiming,
    port: RxPort,
    machine: Mutex<RxMachine>,
    fifo: ByteFifo,
    data_wait: WaitQueue,
    watchdog: StateTimer,
}

impl RxShared {
    fn on_clock_edge(&self, now: Instant) {
        // edge context: contention on the state lock drops the edge
        let Ok(mut m) = self.machine.try_lock() else {
            debug!("state lock busy, dropping clock edge");
            return;
        };

        if self.timing.burst_limit > 0 {
            match m.burst.start {
                Some(start) if now.duration_since(start) < Duration::from_secs(1) => {
                    m.burst.count += 1;
                    if m.burst.count > self.timing.burst_limit {
                        warn!("clock burst detected ({} edges/sec), resetting", m.burst.count);
                        self.reset_machine(&mut m, "clock burst overload");
                        m.burst = BurstWindow::default();
                        return;
                    }
                }
                _ => {
                    m.burst.start = Some(now);
                    m.burst.count = 1;
                }
            }
        }

        if self.timing.clock_debounce > Duration::ZERO
            && let Some(last) = m.last_clock
            && now.duration_since(last) < self.timing.clock_debounce
        {
            debug!("clock too fast, ignoring edge");
            return;
        }
        m.last_clock = Some(now);

        let data = self.port.read_data();
        match m.assembler.push(data, self.timing.max_invalid_ticks) {
            TickOutcome::Pending => {}
            TickOutcome::Desync => {
                self.reset_machine(&mut m, "too many consecutive invalid ticks");
            }
            TickOutcome::Byte(byte) => self.on_byte(&mut m, byte),
        }
    }

    fn on_byte(&self, m: &mut RxMachine, byte: u8) {
        match m.state {
            RxState::Idle => {
                if byte == HANDSHAKE_SYN {
                    info!("handshake SYN received, sending ACK");
                    // a handshake opens a fresh session
                    m.expected_seq = 0;
                    m.image.reset();
                    self.port.pulse_ack(&self.timing);
                } else if byte > SEQ_NOISE_LIMIT {
                    debug!("suspicious seq_num {}, ignoring", byte);
                } else {
                    m.state = RxState::SeqNum;
                    m.packet.seq_num = byte;
                    self.arm_watchdog();
                    debug!("received seq_num {}", byte);
                }
            }
            RxState::SeqNum => {
                m.packet.data_len = byte;
                if byte as usize > MAX_PACKET_DATA {
                    warn!("invalid data length {}", byte);
                    self.port.pulse_nack(&self.timing);
                    self.reset_machine(m, "invalid data length");
                    return;
                }
                m.state = RxState::DataLen;
                m.packet.data_index = 0;
                self.arm_watchdog();
                debug!("received data_len {}", byte);
            }
            RxState::DataLen => {
                if m.packet.data_len == 0 {
                    // zero-length control frame: this byte is already CRC
                    m.state = RxState::Crc32;
                    m.packet.crc32 = byte as u32;
                    m.crc_byte_count = 1;
                } else {
                    m.state = RxState::Data;
                    m.packet.data[0] = byte;
                    m.packet.data_index = 1;
                    if m.packet.data_len == 1 {
                        m.state = RxState::Crc32;
                        m.crc_byte_count = 0;
                    }
                }
                self.arm_watchdog();
            }
            RxState::Data => {
                if m.packet.data_index >= m.packet.data_len as usize
                    || m.packet.data_index >= MAX_PACKET_DATA
                {
                    self.reset_machine(m, "more data bytes than announced");
                    return;
                }
                m.packet.data[m.packet.data_index] = byte;
                m.packet.data_index += 1;
                if m.packet.data_index >= m.packet.data_len as usize {
                    m.state = RxState::Crc32;
                    m.crc_byte_count = 0;
                }
                self.arm_watchdog();
            }
            RxState::Crc32 => {
                m.packet.crc32 |= (byte as u32) << (8 * m.crc_byte_count as u32);
                m.crc_byte_count += 1;
                if m.crc_byte_count >= 4 {
                    self.complete_packet(m);
                } else {
                    self.arm_watchdog();
                }
            }
        }
    }

    fn complete_packet(&self, m: &mut RxMachine) {
        let len = m.packet.data_len as usize;
        let data = m.packet.data;
        let payload = &data[..len];
        let computed = packet_crc32(m.packet.seq_num, payload);
        debug!(
            "CRC32 verification: calculated {:#010x}, received {:#010x}",
            computed, m.packet.crc32
        );

        if computed == m.packet.crc32 {
            if m.packet.seq_num == m.expected_seq {
                if self.fifo.available() < len {
                    warn!("FIFO short on space, rejecting packet {}", m.packet.seq_num);
                    self.port.pulse_nack(&self.timing);
                } else {
                    let stored = payload.iter().take_while(|&&b| self.fifo.push(b)).count();
                    if stored == len {
                        m.expected_seq = m.expected_seq.wrapping_add(1);
                        m.image.on_payload(payload);
                        self.port.pulse_ack(&self.timing);
                        self.data_wait.notify_all();
                        info!(
                            "packet {} received ({} bytes, CRC32 ok)",
                            m.packet.seq_num, len
                        );
                    } else {
                        self.port.pulse_nack(&self.timing);
                        self.reset_machine(m, "partial FIFO store");
                        return;
                    }
                }
            } else {
                warn!(
                    "wrong sequence: expected {}, got {}",
                    m.expected_seq, m.packet.seq_num
                );
                self.port.pulse_nack(&self.timing);
            }
        } else {
            warn!("CRC32 mismatch for seq {}", m.packet.seq_num);
            self.port.pulse_nack(&self.timing);
        }

        self.reset_machine(m, "packet complete");
    }

    fn arm_watchdog(&self) {
        self.watchdog.arm(self.timing.state_watchdog);
    }

    fn reset_machine(&self, m: &mut RxMachine, reason: &str) {
        debug!("RX state reset: {}", reason);
        m.state = RxState::Idle;
        m.assembler.reset();
        m.packet.clear();
        m.crc_byte_count = 0;
        self.watchdog.disarm();
    }

    fn on_watchdog(&self) {
        warn!("state machine timeout, resetting to Idle");
        let mut m = self.machine.lock().unwrap();
        self.reset_machine(&mut m, "watchdog expiry");
    }
}

pub struct RxEngine {
    shared: Arc<RxShared>,
    _clock_irq: IrqGuard,
}

impl RxEngine {
    pub fn new(port: RxPort, timing: LinkTiming) -> RxEngine {
        let clock = port.clock.clone();
        let shared = Arc::new_cyclic(|weak: &Weak<RxShared>| {
            let expired = weak.clone();
            let watchdog = StateTimer::spawn(
                "epaper-rx-watchdog",
                Box::new(move || {
                    if let Some(shared) = expired.upgrade() {
                        shared.on_watchdog();
                    }
                }),
            );
            RxShared {
                timing,
                port,
                machine: Mutex::new(RxMachine::new()),
                fifo: ByteFifo::new(),
                data_wait: WaitQueue::new(),
                watchdog,
            }
        });

        let edge_target = Arc::downgrade(&shared);
        let clock_irq = clock.subscribe(
            Edge::Rising,
            Arc::new(move |now| {
                if let Some(shared) = edge_target.upgrade() {
                    shared.on_clock_edge(now);
                }
            }),
        );

        RxEngine {
            shared,
            _clock_irq: clock_irq,
        }
    }

    /// Abandon any partially assembled packet. Sequence continuity is
    /// preserved; used on device open.
    pub fn reset_assembly(&self) {
        let mut m = self.shared.machine.lock().unwrap();
        self.shared.reset_machine(&mut m, "user reset");
    }

    /// Full reset: assembly state, expected sequence, image tracker and
    /// the byte FIFO. The reset ioctl of the device surface.
    pub fn reset(&self) {
        let mut m = self.shared.machine.lock().unwrap();
        self.shared.reset_machine(&mut m, "full user reset");
        m.expected_seq = 0;
        m.last_clock = None;
        m.burst = BurstWindow::default();
        m.image.reset();
        self.shared.fifo.clear();
    }

    pub fn image_ready(&self) -> bool {
        self.shared.machine.lock().unwrap().image.ready()
    }

    pub fn expected_seq(&self) -> u8 {
        self.shared.machine.lock().unwrap().expected_seq
    }

    pub fn state(&self) -> RxState {
        self.shared.machine.lock().unwrap().state
    }

    pub(crate) fn fifo(&self) -> &ByteFifo {
        &self.shared.fifo
    }

    pub(crate) fn data_wait(&self) -> &WaitQueue {
        &self.shared.data_wait
    }

    /// Wake and cancel all parked readers; part of endpoint tear-down.
    pub fn shutdown(&self) {
        self.shared.data_wait.close();
    }
}
