use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use crate::core::codec::ByteShifter;
use crate::core::config::LinkTiming;
use crate::core::crc::packet_crc32;
use crate::core::error::LinkError;
use crate::core::gpio::{Edge, IrqGuard, TxPort};
use crate::core::sync::{WaitOutcome, WaitQueue};
use crate::core::{HANDSHAKE_SYN, MAX_PACKET_DATA, WRITE_BUFFER_LIMIT};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStatus {
    pub transmission_active: bool,
    pub handshake_complete: bool,
    pub error_state: bool,
    pub last_seq_sent: u8,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStats {
    pub total_packets_sent: u32,
    pub total_bytes_sent: u64,
    pub total_retries: u32,
    pub successful_handshakes: u32,
    pub failed_handshakes: u32,
    pub timeouts: u32,
    pub nacks_received: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckVerdict {
    Ack,
    Nack,
}

/*
  Acknowledgement consumer. The edge handler latches which reverse line
  pulsed and wakes the waiter; the gate is armed before the first byte of
  an attempt goes out, so a verdict that lands while the tail of the
  packet is still clocking is latched rather than lost.
 */
struct AckGate {
    armed_verdict: Mutex<Option<AckVerdict>>,
    wait: WaitQueue,
    last_edge: Mutex<Option<Instant>>,
    debounce: Duration,
}

impl AckGate {
    fn new(debounce: Duration) -> AckGate {
        AckGate {
            armed_verdict: Mutex::new(None),
            wait: WaitQueue::new(),
            last_edge: Mutex::new(None),
            debounce,
        }
    }

    fn arm(&self) {
        *self.armed_verdict.lock().unwrap() = None;
    }

    fn on_edge(&self, positive: bool, now: Instant) {
        {
            let mut last = self.last_edge.lock().unwrap();
            if self.debounce > Duration::ZERO
                && let Some(prev) = *last
                && now.duration_since(prev) < self.debounce
            {
                debug!("acknowledgement edge within debounce window, ignoring");
                return;
            }
            *last = Some(now);
        }
        let verdict = if positive {
            AckVerdict::Ack
        } else {
            AckVerdict::Nack
        };
        *self.armed_verdict.lock().unwrap() = Some(verdict);
        self.wait.notify_all();
        debug!("{:?} received", verdict);
    }

    fn wait_verdict(&self, timeout: Duration) -> Result<AckVerdict, LinkError> {
        let outcome = self.wait.wait(
            || self.armed_verdict.lock().unwrap().is_some(),
            Some(timeout),
        );
        match outcome {
            WaitOutcome::Woken => Ok(self
                .armed_verdict
                .lock()
                .unwrap()
                .expect("verdict latched before wake")),
            WaitOutcome::TimedOut => Err(LinkError::Timeout),
            WaitOutcome::Cancelled => Err(LinkError::Interrupted),
        }
    }
}

#[derive(Debug, Default)]
struct TxSession {
    transmission_active: bool,
    handshake_complete: bool,
    error_state: bool,
    last_seq_sent: u8,
    retry_count: u32,
    sequence_number: u8,
}

impl TxSession {
    fn reset(&mut self) {
        self.transmission_active = false;
        self.retry_count = 0;
        self.error_state = false;
        self.handshake_complete = false;
    }
}

struct TxShared {
    timing: LinkTiming,
    port: TxPort,
    gate: AckGate,
    // serializes write calls: one packet in flight, ever
    io: Mutex<()>,
    session: Mutex<TxSession>,
    stats: Mutex<TxStats>,
}

impl TxShared {
    fn perform_handshake(&self) -> Result<(), LinkError> {
        let shifter = ByteShifter::new(&self.port, &self.timing);
        let mut last_error = LinkError::Timeout;

        for attempt in 0..self.timing.handshake_attempts {
            info!("starting handshake (attempt {})", attempt + 1);
            self.gate.arm();
            shifter.send_byte(HANDSHAKE_SYN);

            match self.gate.wait_verdict(self.timing.ack_wait) {
                Ok(AckVerdict::Ack) => {
                    let mut session = self.session.lock().unwrap();
                    session.handshake_complete = true;
                    session.sequence_number = 0;
                    self.stats.lock().unwrap().successful_handshakes += 1;
                    info!("handshake successful");
                    return Ok(());
                }
                Ok(AckVerdict::Nack) => {
                    last_error = LinkError::Comm;
                    warn!("handshake NACK (attempt {})", attempt + 1);
                }
                Err(LinkError::Timeout) => {
                    last_error = LinkError::Timeout;
                    warn!("handshake timeout (attempt {})", attempt + 1);
                }
                Err(e) => return Err(e),
            }
            thread::sleep(self.timing.handshake_pause);
        }

        self.stats.lock().unwrap().failed_handshakes += 1;
        if last_error == LinkError::Timeout {
            error!(
                "handshake failed: receiver not responding after {} attempts",
                self.timing.handshake_attempts
            );
            Err(LinkError::HostUnreachable)
        } else {
            error!(
                "handshake failed: receiver rejected connection after {} attempts",
                self.timing.handshake_attempts
            );
            Err(LinkError::ConnRefused)
        }
    }

    fn send_packet(&self, seq: u8, payload: &[u8]) -> Result<(), LinkError> {
        let crc = packet_crc32(seq, payload);
        {
            let mut session = self.session.lock().unwrap();
            session.last_seq_sent = seq;
            session.retry_count = 0;
            session.transmission_active = true;
        }

        let shifter = ByteShifter::new(&self.port, &self.timing);
        let mut last_error = LinkError::Timeout;

        for attempt in 0..self.timing.retry_limit {
            debug!(
                "sending packet seq={} len={} crc={:#010x} attempt={}",
                seq,
                payload.len(),
                crc,
                attempt + 1
            );
            self.gate.arm();
            shifter.send_byte(seq);
            shifter.send_byte(payload.len() as u8);
            for &byte in payload {
                shifter.send_byte(byte);
            }
            for byte in crc.to_le_bytes() {
                shifter.send_byte(byte);
            }

            match self.gate.wait_verdict(self.timing.ack_wait) {
                Ok(AckVerdict::Ack) => {
                    self.stats.lock().unwrap().total_packets_sent += 1;
                    info!("packet {} sent after {} attempts", seq, attempt + 1);
                    self.session.lock().unwrap().transmission_active = false;
                    return Ok(());
                }
                Ok(AckVerdict::Nack) => {
                    last_error = LinkError::Comm;
                    self.stats.lock().unwrap().nacks_received += 1;
                    warn!(
                        "NACK on seq {}, retry {}/{}",
                        seq,
                        attempt + 1,
                        self.timing.retry_limit
                    );
                }
                Err(LinkError::Timeout) => {
                    last_error = LinkError::Timeout;
                    self.stats.lock().unwrap().timeouts += 1;
                    warn!(
                        "ACK timeout on seq {}, retry {}/{}",
                        seq,
                        attempt + 1,
                        self.timing.retry_limit
                    );
                }
                Err(e) => {
                    let mut session = self.session.lock().unwrap();
                    session.transmission_active = false;
                    session.error_state = true;
                    return Err(e);
                }
            }

            let retry = {
                let mut session = self.session.lock().unwrap();
                session.retry_count += 1;
                session.retry_count
            };
            self.stats.lock().unwrap().total_retries += 1;
            if retry < self.timing.retry_limit {
                thread::sleep(self.timing.backoff_for(retry));
            }
        }

        error!(
            "packet {} failed after {} retries: {}",
            seq, self.timing.retry_limit, last_error
        );
        let mut session = self.session.lock().unwrap();
        session.transmission_active = false;
        session.error_state = true;
        Err(last_error)
    }
}

pub struct TxEngine {
    shared: Arc<TxShared>,
    _ack_irq: IrqGuard,
    _nack_irq: IrqGuard,
}

impl TxEngine {
    pub fn new(port: TxPort, timing: LinkTiming) -> TxEngine {
        let ack_line = port.ack.clone();
        let nack_line = port.nack.clone();
        let shared = Arc::new(TxShared {
            gate: AckGate::new(timing.ack_debounce),
            timing,
            port,
            io: Mutex::new(()),
            session: Mutex::new(TxSession::default()),
            stats: Mutex::new(TxStats::default()),
        });

        let ack_target: Weak<TxShared> = Arc::downgrade(&shared);
        let ack_irq = ack_line.subscribe(
            Edge::Rising,
            Arc::new(move |now| {
                if let Some(shared) = ack_target.upgrade() {
                    shared.gate.on_edge(true, now);
                }
            }),
        );
        let nack_target: Weak<TxShared> = Arc::downgrade(&shared);
        let nack_irq = nack_line.subscribe(
            Edge::Rising,
            Arc::new(move |now| {
                if let Some(shared) = nack_target.upgrade() {
                    shared.gate.on_edge(false, now);
                }
            }),
        );

        TxEngine {
            shared,
            _ack_irq: ack_irq,
            _nack_irq: nack_irq,
        }
    }

    /// Push payload bytes to the far end, handshaking first if the
    /// session is not open. Splits into packets of up to 31 bytes; if a
    /// packet fails after earlier ones were acknowledged, the call
    /// reports the bytes that made it.
    pub fn write(&self, buf: &[u8]) -> Result<usize, LinkError> {
        let _io = self.shared.io.lock().unwrap();

        if buf.is_empty() {
            return Ok(0);
        }
        let buf = &buf[..buf.len().min(WRITE_BUFFER_LIMIT)];

        {
            let mut session = self.shared.session.lock().unwrap();
            if session.error_state {
                session.reset();
            }
        }

        let needs_handshake = !self.shared.session.lock().unwrap().handshake_complete;
        if needs_handshake {
            info!("performing handshake before data transfer");
            self.shared.perform_handshake()?;
        }

        info!("starting transmission of {} bytes", buf.len());
        let mut sent = 0usize;
        for chunk in buf.chunks(MAX_PACKET_DATA) {
            let seq = {
                let mut session = self.shared.session.lock().unwrap();
                let seq = session.sequence_number;
                session.sequence_number = seq.wrapping_add(1);
                seq
            };
            if let Err(e) = self.shared.send_packet(seq, chunk) {
                error!("transmission failed at offset {}", sent);
                self.shared.session.lock().unwrap().reset();
                return if sent > 0 { Ok(sent) } else { Err(e) };
            }
            sent += chunk.len();
        }

        self.shared.stats.lock().unwrap().total_bytes_sent += sent as u64;
        Ok(sent)
    }

    pub fn status(&self) -> TxStatus {
        let session = self.shared.session.lock().unwrap();
        TxStatus {
            transmission_active: session.transmission_active,
            handshake_complete: session.handshake_complete,
            error_state: session.error_state,
            last_seq_sent: session.last_seq_sent,
            retry_count: session.retry_count,
        }
    }

    pub fn stats(&self) -> TxStats {
        *self.shared.stats.lock().unwrap()
    }

    pub fn reset_stats(&self) {
        *self.shared.stats.lock().unwrap() = TxStats::default();
        info!("statistics reset");
    }

    pub fn reset_session(&self) {
        self.shared.session.lock().unwrap().reset();
        self.shared.gate.arm();
        info!("session state reset");
    }

    /// Cancel a parked acknowledgement wait; part of endpoint tear-down.
    pub fn shutdown(&self) {
        self.shared.gate.wait.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::{TickAssembler, TickOutcome};
    use crate::core::gpio::{LinkBus, RxPort};
    use crate::core::rx::RxEngine;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy)]
    enum Reply {
        Ack,
        Nack,
        Silent,
    }

    /// Minimal far end: reassembles frames off the clock line and answers
    /// each complete frame with the next scripted verdict.
    struct ScriptedPeer {
        _irq: IrqGuard,
    }

    struct PeerState {
        asm: TickAssembler,
        frame: Vec<u8>,
        replies: VecDeque<Reply>,
    }

    impl ScriptedPeer {
        fn new(port: RxPort, timing: LinkTiming, replies: Vec<Reply>) -> ScriptedPeer {
            let state = Arc::new(Mutex::new(PeerState {
                asm: TickAssembler::new(),
                frame: Vec::new(),
                replies: replies.into(),
            }));
            let clock = port.clock.clone();
            let irq = clock.subscribe(
                Edge::Rising,
                Arc::new(move |_| {
                    let mut s = state.lock().unwrap();
                    if let TickOutcome::Byte(b) = s.asm.push(port.read_data(), 10) {
                        s.frame.push(b);
                        let done = match s.frame.as_slice() {
                            [HANDSHAKE_SYN] => true,
                            [_, len, rest @ ..] => rest.len() == *len as usize + 4,
                            _ => false,
                        };
                        if done {
                            s.frame.clear();
                            match s.replies.pop_front().unwrap_or(Reply::Ack) {
                                Reply::Ack => port.pulse_ack(&timing),
                                Reply::Nack => port.pulse_nack(&timing),
                                Reply::Silent => {}
                            }
                        }
                    }
                }),
            );
            ScriptedPeer { _irq: irq }
        }
    }

    fn fast_timing() -> LinkTiming {
        let mut timing = LinkTiming::immediate();
        timing.ack_wait = Duration::from_millis(20);
        timing
    }

    #[test]
    fn silent_receiver_is_host_unreachable() {
        let bus = LinkBus::new();
        let timing = fast_timing();
        let engine = TxEngine::new(bus.tx_port(), timing);

        assert_eq!(engine.write(b"AB"), Err(LinkError::HostUnreachable));
        let stats = engine.stats();
        assert_eq!(stats.failed_handshakes, 1);
        assert_eq!(stats.successful_handshakes, 0);
        assert_eq!(stats.total_packets_sent, 0);
        assert!(!engine.status().handshake_complete);
    }

    #[test]
    fn nacked_handshake_is_connection_refused() {
        let bus = LinkBus::new();
        let timing = fast_timing();
        let engine = TxEngine::new(bus.tx_port(), timing.clone());
        let _peer = ScriptedPeer::new(bus.rx_port(), timing, vec![Reply::Nack; 5]);

        assert_eq!(engine.write(b"AB"), Err(LinkError::ConnRefused));
        assert_eq!(engine.stats().failed_handshakes, 1);
    }

    #[test]
    fn single_nack_costs_one_retry() {
        let bus = LinkBus::new();
        let timing = fast_timing();
        let engine = TxEngine::new(bus.tx_port(), timing.clone());
        let _peer = ScriptedPeer::new(
            bus.rx_port(),
            timing,
            vec![Reply::Ack, Reply::Nack, Reply::Ack],
        );

        assert_eq!(engine.write(b"hello"), Ok(5));
        let stats = engine.stats();
        assert_eq!(stats.total_packets_sent, 1);
        assert_eq!(stats.total_retries, 1);
        assert_eq!(stats.nacks_received, 1);
        assert_eq!(stats.total_bytes_sent, 5);
        assert!(!engine.status().error_state);
    }

    #[test]
    fn lost_ack_costs_one_timeout() {
        let bus = LinkBus::new();
        let timing = fast_timing();
        let engine = TxEngine::new(bus.tx_port(), timing.clone());
        let _peer = ScriptedPeer::new(
            bus.rx_port(),
            timing,
            vec![Reply::Ack, Reply::Silent, Reply::Ack],
        );

        assert_eq!(engine.write(b"x"), Ok(1));
        let stats = engine.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.total_retries, 1);
        assert_eq!(stats.total_packets_sent, 1);
    }

    #[test]
    fn chunked_write_reaches_real_receiver() {
        let bus = LinkBus::new();
        let timing = LinkTiming::immediate();
        let tx = TxEngine::new(bus.tx_port(), timing.clone());
        let rx = RxEngine::new(bus.rx_port(), timing);

        let payload = vec![0xAA; 40];
        assert_eq!(tx.write(&payload), Ok(40));

        let stats = tx.stats();
        assert_eq!(stats.total_packets_sent, 2);
        assert_eq!(stats.total_retries, 0);
        assert_eq!(tx.status().last_seq_sent, 1);

        let mut received = Vec::new();
        while let Some(b) = rx.fifo().pop() {
            received.push(b);
        }
        assert_eq!(received, payload);
        assert_eq!(rx.expected_seq(), 2);
    }

    #[test]
    fn exhausted_retries_error_then_fresh_session_recovers() {
        let bus = LinkBus::new();
        let timing = fast_timing();
        let engine = TxEngine::new(bus.tx_port(), timing.clone());
        let mut replies = vec![Reply::Ack]; // handshake
        replies.push(Reply::Ack); // packet 0
        replies.extend([Reply::Nack; 5]); // packet 1 dies
        replies.push(Reply::Ack); // re-handshake
        replies.push(Reply::Ack); // retransmitted remainder
        let _peer = ScriptedPeer::new(bus.rx_port(), timing, replies);

        let payload = vec![0x55; 40];
        // partial success: first chunk acknowledged, second exhausted
        assert_eq!(engine.write(&payload), Ok(31));
        let status = engine.status();
        assert!(!status.handshake_complete);

        // next write opens a new session and restarts numbering
        assert_eq!(engine.write(&payload[31..]), Ok(9));
        assert_eq!(engine.status().last_seq_sent, 0);
        let stats = engine.stats();
        assert_eq!(stats.successful_handshakes, 2);
        assert_eq!(stats.nacks_received, 5);
    }

    #[test]
    fn oversized_write_is_capped_per_call() {
        let bus = LinkBus::new();
        let timing = LinkTiming::immediate();
        let tx = TxEngine::new(bus.tx_port(), timing.clone());
        let _rx = RxEngine::new(bus.rx_port(), timing);

        let payload = vec![0x11; WRITE_BUFFER_LIMIT + 100];
        assert_eq!(tx.write(&payload), Ok(WRITE_BUFFER_LIMIT));
    }
}
